//! `http_simple` obfuscation (client role)
//!
//! Disguises the first outbound bytes as a browser GET request: the leading
//! portion of the encrypted stream rides percent-encoded in the request
//! path, the remainder follows the blank line. Everything after the first
//! packet in either direction passes through untouched. The server's
//! response header is consumed and discarded on ingress.

use std::fmt::Write as _;

use super::{Decoded, ObfsPlugin, ServerInfo};
use crate::buffer::Buffer;
use crate::crypto::rand::Xorshift128Plus;
use crate::error::{Result, TunnelError};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/125.0.0.0 Safari/537.36";

/// Response headers larger than this are not a handshake we recognize.
const MAX_RESPONSE_HEADER: usize = 8192;

pub struct HttpSimple {
    info: ServerInfo,
    has_sent_header: bool,
    has_recv_header: bool,
    recv_buffer: Buffer,
    rng: Xorshift128Plus,
}

impl HttpSimple {
    pub fn new() -> Self {
        Self {
            info: ServerInfo::default(),
            has_sent_header: false,
            has_recv_header: false,
            recv_buffer: Buffer::new(),
            rng: Xorshift128Plus::from_entropy(),
        }
    }

    /// Host header value: one of the comma-separated `obfs_param` hosts, or
    /// the server host itself. Non-80 ports are spelled out.
    fn host_header(&mut self) -> String {
        let hosts: Vec<&str> = self
            .info
            .param
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .collect();
        let host = if hosts.is_empty() {
            self.info.host.as_str()
        } else {
            hosts[(self.rng.next_u64() as usize) % hosts.len()]
        };
        if self.info.port == 80 {
            host.to_string()
        } else {
            format!("{}:{}", host, self.info.port)
        }
    }
}

impl Default for HttpSimple {
    fn default() -> Self {
        Self::new()
    }
}

impl ObfsPlugin for HttpSimple {
    fn set_server_info(&mut self, info: &ServerInfo) {
        self.info = info.clone();
    }

    fn client_encode(&mut self, data: &[u8]) -> Result<Buffer> {
        if self.has_sent_header {
            return Ok(Buffer::from(data));
        }

        let head_size = data
            .len()
            .min(self.info.head_len + (self.rng.next_u64() % 64) as usize);
        let (head, body) = data.split_at(head_size);

        let mut path = String::with_capacity(head.len() * 3);
        for byte in head {
            let _ = write!(path, "%{byte:02x}");
        }

        let host = self.host_header();
        let request = format!(
            "GET /{path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             User-Agent: {USER_AGENT}\r\n\
             Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
             Accept-Language: en-US,en;q=0.8\r\n\
             Accept-Encoding: gzip, deflate\r\n\
             Connection: keep-alive\r\n\r\n"
        );

        let mut out = Buffer::with_capacity(request.len() + body.len());
        out.put_slice(request.as_bytes());
        out.put_slice(body);
        self.has_sent_header = true;
        Ok(out)
    }

    fn client_decode(&mut self, data: &[u8]) -> Result<Decoded> {
        if self.has_recv_header {
            return Ok(Decoded {
                data: Buffer::from(data),
                need_sendback: false,
            });
        }

        self.recv_buffer.put_slice(data);
        if let Some(pos) = self
            .recv_buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
        {
            let out = Buffer::from(&self.recv_buffer[pos + 4..]);
            self.recv_buffer.clear();
            self.has_recv_header = true;
            return Ok(Decoded {
                data: out,
                need_sendback: false,
            });
        }

        if self.recv_buffer.len() > MAX_RESPONSE_HEADER {
            return Err(TunnelError::ClientDecode);
        }
        Ok(Decoded::default())
    }
}
