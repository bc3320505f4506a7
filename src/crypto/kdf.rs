//! Password to key derivation
//!
//! The shadowsocks scheme: iterated MD5 over `prev_digest || password`
//! until enough key material accumulates (OpenSSL's EVP_BytesToKey with
//! MD5 and no salt).

use md5::{Digest, Md5};

/// Derive `key_len` bytes of key material from a password or phrase.
pub fn bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Option<[u8; 16]> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(digest) = prev {
            hasher.update(digest);
        }
        hasher.update(password);
        let digest: [u8; 16] = hasher.finalize().into();
        key.extend_from_slice(&digest);
        prev = Some(digest);
    }

    key.truncate(key_len);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_round_is_plain_md5() {
        let key = bytes_to_key(b"password", 16);
        let digest: [u8; 16] = Md5::digest(b"password").into();
        assert_eq!(key, digest);
    }

    #[test]
    fn test_long_key_extends_deterministically() {
        let key32 = bytes_to_key(b"password", 32);
        assert_eq!(key32.len(), 32);
        // First half is the plain digest, second half chains it.
        assert_eq!(&key32[..16], bytes_to_key(b"password", 16).as_slice());

        let mut hasher = Md5::new();
        hasher.update(&key32[..16]);
        hasher.update(b"password");
        let second: [u8; 16] = hasher.finalize().into();
        assert_eq!(&key32[16..], second.as_slice());
    }

    #[test]
    fn test_odd_length_truncates() {
        assert_eq!(bytes_to_key(b"k", 24).len(), 24);
    }
}
