//! SOCKS5 wire protocol
//!
//! Implements the RFC 1928 client-facing side: constants, reply encoding,
//! and a streaming request parser that accepts arbitrary chunk boundaries.

use bytes::BufMut;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

use crate::buffer::Buffer;

/// SOCKS5 version
pub const VERSION: u8 = 0x05;

/// Authentication methods
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// Commands
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_CONN_NOT_ALLOWED: u8 = 0x02;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

/// Parser rejection reasons.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid SOCKS version: {0:#04x}")]
    BadVersion(u8),
    #[error("client offered zero auth methods")]
    NoMethods,
    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u8),
    #[error("unknown address type: {0:#04x}")]
    UnknownAddrType(u8),
    #[error("zero-length domain name")]
    EmptyDomain,
}

/// Requested command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Connect,
    Bind,
    UdpAssociate,
}

impl Cmd {
    fn from_byte(byte: u8) -> Result<Self, ParseError> {
        match byte {
            CMD_CONNECT => Ok(Cmd::Connect),
            CMD_BIND => Ok(Cmd::Bind),
            CMD_UDP_ASSOCIATE => Ok(Cmd::UdpAssociate),
            other => Err(ParseError::UnknownCommand(other)),
        }
    }
}

/// Destination address, stored raw. Domain names keep their original bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(Vec<u8>),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::V4(ip) => write!(f, "{ip}"),
            Address::V6(ip) => write!(f, "{ip}"),
            Address::Domain(name) => write!(f, "{}", String::from_utf8_lossy(name)),
        }
    }
}

/// Fully parsed SOCKS5 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: Cmd,
    pub addr: Address,
    pub port: u16,
}

/// Outcome of feeding bytes to the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// Message incomplete; feed more bytes.
    NeedMore,
    /// Method-select message complete; contains the offered methods.
    AuthSelect(Vec<u8>),
    /// Request message complete.
    Request(Request),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    MethodHeader,
    Methods { count: usize },
    RequestHeader,
    DomainLen { cmd: Cmd },
    AddrPort { cmd: Cmd, atyp: u8, need: usize },
    Done,
}

/// Streaming SOCKS5 parser.
///
/// Consumes the method-select message first, then the request message.
/// Bytes may arrive split at any boundary; the parser buffers internally and
/// advances an explicit stage, never recursing.
#[derive(Debug)]
pub struct Parser {
    stage: Stage,
    buf: Vec<u8>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            stage: Stage::MethodHeader,
            buf: Vec::with_capacity(64),
        }
    }

    /// Feed a chunk and try to complete the current message.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<ParseStatus, ParseError> {
        self.buf.extend_from_slice(chunk);

        loop {
            match self.stage {
                Stage::MethodHeader => {
                    if self.buf.len() < 2 {
                        return Ok(ParseStatus::NeedMore);
                    }
                    if self.buf[0] != VERSION {
                        return Err(ParseError::BadVersion(self.buf[0]));
                    }
                    let count = self.buf[1] as usize;
                    if count == 0 {
                        return Err(ParseError::NoMethods);
                    }
                    self.buf.drain(..2);
                    self.stage = Stage::Methods { count };
                }
                Stage::Methods { count } => {
                    if self.buf.len() < count {
                        return Ok(ParseStatus::NeedMore);
                    }
                    let methods: Vec<u8> = self.buf.drain(..count).collect();
                    self.stage = Stage::RequestHeader;
                    return Ok(ParseStatus::AuthSelect(methods));
                }
                Stage::RequestHeader => {
                    if self.buf.len() < 4 {
                        return Ok(ParseStatus::NeedMore);
                    }
                    if self.buf[0] != VERSION {
                        return Err(ParseError::BadVersion(self.buf[0]));
                    }
                    let cmd = Cmd::from_byte(self.buf[1])?;
                    let atyp = self.buf[3];
                    self.buf.drain(..4);
                    self.stage = match atyp {
                        ATYP_IPV4 => Stage::AddrPort { cmd, atyp, need: 4 + 2 },
                        ATYP_IPV6 => Stage::AddrPort { cmd, atyp, need: 16 + 2 },
                        ATYP_DOMAIN => Stage::DomainLen { cmd },
                        other => return Err(ParseError::UnknownAddrType(other)),
                    };
                }
                Stage::DomainLen { cmd } => {
                    if self.buf.is_empty() {
                        return Ok(ParseStatus::NeedMore);
                    }
                    let len = self.buf[0] as usize;
                    if len == 0 {
                        return Err(ParseError::EmptyDomain);
                    }
                    self.buf.drain(..1);
                    self.stage = Stage::AddrPort {
                        cmd,
                        atyp: ATYP_DOMAIN,
                        need: len + 2,
                    };
                }
                Stage::AddrPort { cmd, atyp, need } => {
                    if self.buf.len() < need {
                        return Ok(ParseStatus::NeedMore);
                    }
                    let addr_len = need - 2;
                    let addr = match atyp {
                        ATYP_IPV4 => {
                            let mut octets = [0u8; 4];
                            octets.copy_from_slice(&self.buf[..4]);
                            Address::V4(Ipv4Addr::from(octets))
                        }
                        ATYP_IPV6 => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(&self.buf[..16]);
                            Address::V6(Ipv6Addr::from(octets))
                        }
                        _ => Address::Domain(self.buf[..addr_len].to_vec()),
                    };
                    let port = u16::from_be_bytes([self.buf[addr_len], self.buf[addr_len + 1]]);
                    self.buf.drain(..need);
                    self.stage = Stage::Done;
                    return Ok(ParseStatus::Request(Request { cmd, addr, port }));
                }
                Stage::Done => return Ok(ParseStatus::NeedMore),
            }
        }
    }
}

/// Build the shadowsocks address header: `atyp || address || port (BE)`.
///
/// This is the initial package sent, encrypted, as the first upstream bytes.
pub fn ss_address(addr: &Address, port: u16) -> Buffer {
    let mut buf = Buffer::with_capacity(1 + 1 + 255 + 2);
    match addr {
        Address::V4(ip) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Address::Domain(name) => {
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name);
        }
        Address::V6(ip) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_slice(&port.to_be_bytes());
    buf
}

/// Length of the shadowsocks address header at the front of `package`,
/// inspecting at most 30 bytes. Unparseable input yields `default`.
pub fn ss_head_len(package: &[u8], default: usize) -> usize {
    let len = match package.first() {
        Some(&ATYP_IPV4) => 1 + 4 + 2,
        Some(&ATYP_IPV6) => 1 + 16 + 2,
        Some(&ATYP_DOMAIN) if package.len() >= 2 => 1 + 1 + package[1] as usize + 2,
        _ => default,
    };
    len.min(30)
}

/// Encode a SOCKS5 reply with an explicit bind address.
pub fn encode_reply(rep: u8, bind_addr: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.push(VERSION);
    buf.push(rep);
    buf.push(0x00); // Reserved
    match bind_addr {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
    }
    buf
}

/// Zero bind address used on error replies.
pub fn zero_bind_addr_v4() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}
