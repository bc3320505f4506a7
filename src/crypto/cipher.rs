//! Symmetric stream cipher environment
//!
//! One `CipherEnv` per process holds the method and the master key derived
//! from the password. Each tunnel gets its own encrypt/decrypt context pair:
//! the encrypt side generates a fresh IV and prepends it to the first
//! outbound chunk, the decrypt side consumes the peer's IV from the first
//! inbound bytes. Contexts exist only for real ciphers; the `none` method
//! carries plaintext through the protocol/obfs stages unchanged.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use ctr::Ctr128BE;
use rand::RngCore;

use crate::buffer::Buffer;
use crate::crypto::kdf::bytes_to_key;
use crate::error::TunnelError;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes192Ctr = Ctr128BE<Aes192>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// Supported cipher methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMethod {
    /// No stream encryption; protocol and obfs stages still apply.
    None,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
}

impl CipherMethod {
    /// Resolve a configured method name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "none" | "plain" | "table" => Some(CipherMethod::None),
            "aes-128-ctr" => Some(CipherMethod::Aes128Ctr),
            "aes-192-ctr" => Some(CipherMethod::Aes192Ctr),
            "aes-256-ctr" => Some(CipherMethod::Aes256Ctr),
            _ => None,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherMethod::None => 16,
            CipherMethod::Aes128Ctr => 16,
            CipherMethod::Aes192Ctr => 24,
            CipherMethod::Aes256Ctr => 32,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            CipherMethod::None => 0,
            _ => 16,
        }
    }

    /// True when per-tunnel encrypt/decrypt contexts are required.
    pub fn needs_contexts(self) -> bool {
        self != CipherMethod::None
    }
}

/// Process-wide cipher environment: method plus master key.
#[derive(Debug, Clone)]
pub struct CipherEnv {
    pub method: CipherMethod,
    pub key: Vec<u8>,
}

impl CipherEnv {
    pub fn new(method: CipherMethod, password: &str) -> Self {
        Self {
            method,
            key: bytes_to_key(password.as_bytes(), method.key_len()),
        }
    }
}

enum StreamState {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

impl StreamState {
    fn new(method: CipherMethod, key: &[u8], iv: &[u8]) -> Result<Self, TunnelError> {
        let state = match method {
            CipherMethod::Aes128Ctr => StreamState::Aes128(
                Aes128Ctr::new_from_slices(key, iv).map_err(|_| TunnelError::InvalidPassword)?,
            ),
            CipherMethod::Aes192Ctr => StreamState::Aes192(
                Aes192Ctr::new_from_slices(key, iv).map_err(|_| TunnelError::InvalidPassword)?,
            ),
            CipherMethod::Aes256Ctr => StreamState::Aes256(
                Aes256Ctr::new_from_slices(key, iv).map_err(|_| TunnelError::InvalidPassword)?,
            ),
            CipherMethod::None => return Err(TunnelError::InvalidPassword),
        };
        Ok(state)
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            StreamState::Aes128(c) => c.apply_keystream(data),
            StreamState::Aes192(c) => c.apply_keystream(data),
            StreamState::Aes256(c) => c.apply_keystream(data),
        }
    }
}

/// Per-tunnel encrypt context. Created eagerly so the IV is available to
/// protocol plugins before the first byte is packed.
pub struct EncryptCtx {
    state: StreamState,
    iv: Vec<u8>,
    iv_sent: bool,
}

impl EncryptCtx {
    pub fn new(env: &CipherEnv) -> Result<Self, TunnelError> {
        let mut iv = vec![0u8; env.method.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        let state = StreamState::new(env.method, &env.key, &iv)?;
        Ok(Self {
            state,
            iv,
            iv_sent: false,
        })
    }

    /// The IV this tunnel will send; exposed to plugins via `ServerInfo`.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Encrypt a chunk. The first call prepends the IV.
    pub fn encrypt(&mut self, data: &[u8]) -> Buffer {
        let mut out = Buffer::with_capacity(self.iv.len() + data.len());
        if !self.iv_sent {
            out.put_slice(&self.iv);
            self.iv_sent = true;
        }
        let start = out.len();
        out.put_slice(data);
        self.state.apply(&mut out[start..]);
        out
    }
}

/// Per-tunnel decrypt context. Lazily initialized once the peer's IV has
/// fully arrived; IV bytes may straddle chunk boundaries.
pub struct DecryptCtx {
    method: CipherMethod,
    key: Vec<u8>,
    state: Option<StreamState>,
    iv_pending: Vec<u8>,
}

impl DecryptCtx {
    pub fn new(env: &CipherEnv) -> Self {
        Self {
            method: env.method,
            key: env.key.clone(),
            state: None,
            iv_pending: Vec::with_capacity(env.method.iv_len()),
        }
    }

    /// Decrypt a chunk, consuming the leading IV on the first call(s).
    /// Returns an empty buffer while the IV is still incomplete.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Buffer, TunnelError> {
        let mut data = data;
        if self.state.is_none() {
            let need = self.method.iv_len() - self.iv_pending.len();
            let take = need.min(data.len());
            self.iv_pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.iv_pending.len() < self.method.iv_len() {
                return Ok(Buffer::new());
            }
            self.state = Some(StreamState::new(self.method, &self.key, &self.iv_pending)?);
        }

        let mut out = Buffer::from(data);
        if let Some(state) = self.state.as_mut() {
            state.apply(&mut out);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_methods() {
        assert_eq!(CipherMethod::parse("aes-256-ctr"), Some(CipherMethod::Aes256Ctr));
        assert_eq!(CipherMethod::parse("none"), Some(CipherMethod::None));
        assert_eq!(CipherMethod::parse("rot13"), None);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let env = CipherEnv::new(CipherMethod::Aes128Ctr, "password");
        let mut enc = EncryptCtx::new(&env).unwrap();
        let mut dec = DecryptCtx::new(&env);

        let wire = enc.encrypt(b"attack at dawn");
        let plain = dec.decrypt(&wire).unwrap();
        assert_eq!(plain.as_slice(), b"attack at dawn");

        // Subsequent chunks carry no IV.
        let wire2 = enc.encrypt(b"second");
        assert_eq!(wire2.len(), 6);
        assert_eq!(dec.decrypt(&wire2).unwrap().as_slice(), b"second");
    }

    #[test]
    fn test_decrypt_with_split_iv() {
        let env = CipherEnv::new(CipherMethod::Aes256Ctr, "pw");
        let mut enc = EncryptCtx::new(&env).unwrap();
        let mut dec = DecryptCtx::new(&env);

        let wire = enc.encrypt(b"split iv payload");
        let mut plain = Vec::new();
        // Deliver the wire bytes in 5-byte slivers.
        for chunk in wire.chunks(5) {
            plain.extend_from_slice(&dec.decrypt(chunk).unwrap());
        }
        assert_eq!(plain, b"split iv payload");
    }

    #[test]
    fn test_distinct_tunnels_use_distinct_ivs() {
        let env = CipherEnv::new(CipherMethod::Aes128Ctr, "pw");
        let a = EncryptCtx::new(&env).unwrap();
        let b = EncryptCtx::new(&env).unwrap();
        assert_ne!(a.iv(), b.iv());
    }
}
