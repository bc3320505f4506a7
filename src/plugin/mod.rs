//! Protocol and obfuscation plugins
//!
//! Every SSR variant implements one of the two traits below; a method left
//! on its default is the identity transformation. Instances are created by
//! name through the registry at tunnel setup and live for the tunnel's
//! lifetime, so the hot path never allocates plugin state.

pub mod auth_aes128;
pub mod http_simple;
pub mod plain;

use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;

use crate::buffer::{Buffer, SSR_BUFF_SIZE};
use crate::error::Result;

/// TCP maximum segment size assumed by padding heuristics.
pub const TCP_MSS: usize = 1452;

/// Shared state owned by the protocol plugin family, one per process.
///
/// `connection_id` grows monotonically as tunnels are created; once it
/// passes `0xFF00_0000` both fields are re-randomized and the id is masked
/// back to 24 bits.
#[derive(Debug)]
pub struct ProtocolGlobal {
    pub local_client_id: [u8; 8],
    pub connection_id: u32,
}

impl ProtocolGlobal {
    pub fn new() -> Self {
        let mut local_client_id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut local_client_id);
        Self {
            local_client_id,
            connection_id: rand::random::<u32>() & 0xFF_FFFF,
        }
    }

    /// Claim the next connection id, reseeding when the space is exhausted.
    pub fn next_connection(&mut self) -> ([u8; 8], u32) {
        if self.connection_id > 0xFF00_0000 {
            rand::thread_rng().fill_bytes(&mut self.local_client_id);
            self.connection_id = rand::random::<u32>() & 0xFF_FFFF;
        }
        self.connection_id += 1;
        (self.local_client_id, self.connection_id)
    }
}

impl Default for ProtocolGlobal {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tunnel parameters handed to every plugin instance.
#[derive(Clone)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    /// The tunnel's egress IV, known before the first byte is packed.
    pub iv: Vec<u8>,
    /// Master cipher key.
    pub key: Vec<u8>,
    /// Plugin parameter string from the config (`protocol_param` or
    /// `obfs_param`, depending on which plugin receives this info).
    pub param: String,
    pub g_data: Arc<Mutex<ProtocolGlobal>>,
    pub tcp_mss: usize,
    pub buffer_size: usize,
    /// Combined per-chunk overhead of protocol + obfs.
    pub overhead: usize,
    /// Length of the shadowsocks address header in the first packet.
    pub head_len: usize,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            iv: Vec::new(),
            key: Vec::new(),
            param: String::new(),
            g_data: Arc::new(Mutex::new(ProtocolGlobal::new())),
            tcp_mss: TCP_MSS,
            buffer_size: SSR_BUFF_SIZE,
            overhead: 0,
            head_len: 30,
        }
    }
}

/// Result of an obfs decode: the recovered bytes plus a flag asking the
/// caller to send a feedback write back upstream.
#[derive(Debug, Default)]
pub struct Decoded {
    pub data: Buffer,
    pub need_sendback: bool,
}

/// Innermost transformation: authentication framing around the encrypted
/// payload. Defaults are the identity (the `origin` protocol).
pub trait ProtocolPlugin: Send {
    fn set_server_info(&mut self, _info: &ServerInfo) {}

    fn overhead(&self) -> usize {
        0
    }

    fn client_pre_encrypt(&mut self, data: &[u8]) -> Result<Buffer> {
        Ok(Buffer::from(data))
    }

    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Buffer> {
        Ok(Buffer::from(data))
    }

    fn client_udp_pre_encrypt(&mut self, data: &[u8]) -> Result<Buffer> {
        Ok(Buffer::from(data))
    }

    fn client_udp_post_decrypt(&mut self, data: &[u8]) -> Result<Buffer> {
        Ok(Buffer::from(data))
    }
}

/// Outermost transformation: traffic shaping on the wire. Defaults are the
/// identity (the `plain` obfs).
pub trait ObfsPlugin: Send {
    fn set_server_info(&mut self, _info: &ServerInfo) {}

    fn overhead(&self) -> usize {
        0
    }

    fn client_encode(&mut self, data: &[u8]) -> Result<Buffer> {
        Ok(Buffer::from(data))
    }

    fn client_decode(&mut self, data: &[u8]) -> Result<Decoded> {
        Ok(Decoded {
            data: Buffer::from(data),
            need_sendback: false,
        })
    }
}

/// Resolve a protocol plugin by its registered name.
pub fn create_protocol(name: &str) -> Option<Box<dyn ProtocolPlugin>> {
    match name {
        "" | "origin" | "plain" => Some(Box::new(plain::PlainProtocol)),
        "auth_aes128_md5" => Some(Box::new(auth_aes128::AuthAes128::md5())),
        "auth_aes128_sha1" => Some(Box::new(auth_aes128::AuthAes128::sha1())),
        _ => None,
    }
}

/// Resolve an obfs plugin by its registered name.
pub fn create_obfs(name: &str) -> Option<Box<dyn ObfsPlugin>> {
    match name {
        "" | "plain" => Some(Box::new(plain::PlainObfs)),
        "http_simple" => Some(Box::new(http_simple::HttpSimple::new())),
        _ => None,
    }
}
