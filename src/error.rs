//! Tunnel error taxonomy
//!
//! Every failure a tunnel can hit maps onto one of these kinds. The
//! propagation policy is uniform: any non-`Ok` result terminates the tunnel;
//! resolve and connect failures additionally send a SOCKS5 error reply
//! before teardown, everything else closes silently.

use thiserror::Error;

/// Errors that terminate a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Cipher stage failed; almost always a wrong password or a stream
    /// corrupted beyond the point where key material lines up.
    #[error("invalid password or corrupted cipher stream")]
    InvalidPassword,

    /// Obfuscation decode rejected the inbound bytes.
    #[error("obfs client decode failed")]
    ClientDecode,

    /// Protocol post-decrypt rejected the inbound frame.
    #[error("protocol client post-decrypt failed")]
    ClientPostDecrypt,

    /// SOCKS5 parser rejected client input.
    #[error("SOCKS5 parse error: {0}")]
    Parse(#[from] crate::socks5::ParseError),

    /// Upstream hostname did not resolve.
    #[error("failed to resolve upstream host {0}")]
    ResolveFailed(String),

    /// Upstream TCP connect failed or was refused.
    #[error("upstream connect failed: {0}")]
    ConnectFailed(std::io::Error),

    /// Idle timer expired.
    #[error("idle timeout expired")]
    Timeout,

    /// Underlying read/write error other than EOF.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed. Orderly in the proxy phase, fatal before it.
    #[error("peer closed the connection")]
    Eof,
}

/// Result alias used throughout the tunnel path.
pub type Result<T> = std::result::Result<T, TunnelError>;
