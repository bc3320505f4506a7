//! Cryptographic plumbing
//!
//! Key derivation, the padding PRNG, and the per-tunnel stream cipher
//! contexts. Protocol-level framing lives in the plugin layer.

pub mod cipher;
pub mod kdf;
pub mod rand;

pub use cipher::{CipherEnv, CipherMethod, DecryptCtx, EncryptCtx};
pub use kdf::bytes_to_key;
pub use rand::Xorshift128Plus;
