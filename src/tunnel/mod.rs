//! Per-connection tunnel state machine
//!
//! Drives one client session through SOCKS5 negotiation, upstream
//! resolution and connect, SSR initial-package delivery and the
//! bidirectional relay. The lifecycle is an explicit stage loop; every
//! suspension point is bounded by the idle timeout, and any error unwinds
//! straight to teardown, which the registry observes exactly once. Late
//! completions after teardown land on closed sockets and are ignored.
//!
//! Before the proxy stage the session is strictly half-duplex: one read,
//! one parse, one write at a time. The proxy stage runs both directions
//! concurrently with at most one outstanding write per direction, which
//! preserves byte order end to end.

pub mod registry;

use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::buffer::{Buffer, SSR_BUFF_SIZE};
use crate::error::{Result, TunnelError};
use crate::metrics::METRICS;
use crate::pipeline::CipherPipeline;
use crate::server::env::ServerEnv;
use crate::socks5::{self, Cmd, ParseStatus, Parser, Request};
use crate::util;
use registry::TunnelId;

/// Lifecycle stages of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStage {
    /// Awaiting the SOCKS5 method-select message.
    Handshake,
    /// Method reply sent; the request read is armed.
    ReqStart,
    /// Awaiting (more of) the SOCKS5 request.
    ReqParse,
    /// UDP-associate reply sent; drain the control connection until EOF.
    ReqUdpAssoc,
    /// Resolving the upstream hostname.
    ReqLookup,
    /// Connecting upstream and sending the SSR initial package.
    ReqConnect,
    /// Initial package written; success reply goes back to the client.
    SsrAuthSent,
    /// Success reply written; relay loops start next.
    ProxyStart,
    /// Bidirectional relay.
    Proxy,
    /// Teardown in progress.
    Kill,
    /// Terminal.
    Dead,
}

/// Accept-side entry point: runs one tunnel to completion and keeps the
/// registry consistent around it.
pub async fn handle_client(env: Arc<ServerEnv>, client: TcpStream, peer: SocketAddr) {
    let id = env.registry.insert(peer);

    let tunnel = Tunnel::new(env.clone(), client, peer, id);
    match tunnel.run().await {
        Ok(()) => debug!(tunnel_id = %id, "Tunnel closed"),
        Err(TunnelError::Timeout) => {
            METRICS.timeout();
            debug!(tunnel_id = %id, "Tunnel idle timeout");
        }
        Err(TunnelError::Eof) => debug!(tunnel_id = %id, "Client went away"),
        Err(e) => {
            METRICS.error();
            debug!(tunnel_id = %id, error = %e, "Tunnel failed");
        }
    }

    env.registry.remove(id);
}

struct Tunnel {
    id: TunnelId,
    env: Arc<ServerEnv>,
    client: TcpStream,
    peer: SocketAddr,
    parser: Parser,
    idle: Duration,
    stage: TunnelStage,
    request: Option<Request>,
    upstream_addr: Option<SocketAddr>,
    upstream: Option<TcpStream>,
    init_package: Option<Buffer>,
    pipeline: Option<CipherPipeline>,
}

impl Tunnel {
    fn new(env: Arc<ServerEnv>, client: TcpStream, peer: SocketAddr, id: TunnelId) -> Self {
        let idle = env.config.timeouts.idle_timeout();
        Self {
            id,
            env,
            client,
            peer,
            parser: Parser::new(),
            idle,
            stage: TunnelStage::Handshake,
            request: None,
            upstream_addr: None,
            upstream: None,
            init_package: None,
            pipeline: None,
        }
    }

    async fn run(mut self) -> Result<()> {
        let mut chunk = [0u8; SSR_BUFF_SIZE];

        loop {
            let next = match self.stage {
                TunnelStage::Handshake => self.handshake(&mut chunk).await?,
                TunnelStage::ReqStart => TunnelStage::ReqParse,
                TunnelStage::ReqParse => self.req_parse(&mut chunk).await?,
                TunnelStage::ReqUdpAssoc => self.req_udp_assoc(&mut chunk).await?,
                TunnelStage::ReqLookup => self.req_lookup().await?,
                TunnelStage::ReqConnect => self.req_connect().await?,
                TunnelStage::SsrAuthSent => self.ssr_auth_sent().await?,
                TunnelStage::ProxyStart => TunnelStage::Proxy,
                TunnelStage::Proxy => {
                    self.relay().await?;
                    TunnelStage::Kill
                }
                TunnelStage::Kill => {
                    let _ = self.client.shutdown().await;
                    self.upstream = None;
                    TunnelStage::Dead
                }
                TunnelStage::Dead => return Ok(()),
            };
            trace!(tunnel_id = %self.id, from = ?self.stage, to = ?next, "Stage transition");
            self.stage = next;
        }
    }

    async fn handshake(&mut self, chunk: &mut [u8]) -> Result<TunnelStage> {
        let n = self.read_client(chunk).await?;
        if n == 0 {
            return Err(TunnelError::Eof);
        }

        match self.parser.feed(&chunk[..n])? {
            ParseStatus::NeedMore => Ok(TunnelStage::Handshake),
            ParseStatus::AuthSelect(methods) => {
                if methods.contains(&socks5::AUTH_NONE) {
                    self.write_client(&[socks5::VERSION, socks5::AUTH_NONE])
                        .await?;
                    Ok(TunnelStage::ReqStart)
                } else {
                    METRICS.handshake_failure();
                    debug!(tunnel_id = %self.id, ?methods, "No acceptable auth method");
                    self.write_client(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
                        .await?;
                    Ok(TunnelStage::Kill)
                }
            }
            ParseStatus::Request(_) => {
                unreachable!("parser yields AuthSelect before any Request")
            }
        }
    }

    async fn req_parse(&mut self, chunk: &mut [u8]) -> Result<TunnelStage> {
        // A pipelining client may have sent the request together with the
        // method select; drain the parser buffer before reading again.
        if let ParseStatus::Request(request) = self.parser.feed(&[])? {
            return self.on_request(request).await;
        }

        let n = self.read_client(chunk).await?;
        if n == 0 {
            return Err(TunnelError::Eof);
        }

        match self.parser.feed(&chunk[..n])? {
            ParseStatus::NeedMore => Ok(TunnelStage::ReqParse),
            ParseStatus::Request(request) => self.on_request(request).await,
            ParseStatus::AuthSelect(_) => {
                unreachable!("method select already consumed in handshake")
            }
        }
    }

    async fn on_request(&mut self, request: Request) -> Result<TunnelStage> {
        debug!(
            tunnel_id = %self.id,
            cmd = ?request.cmd,
            dest = %request.addr,
            port = request.port,
            "SOCKS5 request"
        );

        match request.cmd {
            Cmd::Connect => {
                let init = socks5::ss_address(&request.addr, request.port);
                self.pipeline = Some(CipherPipeline::new(&self.env, &init)?);
                self.init_package = Some(init);
                self.request = Some(request);

                let host = &self.env.config.server.remote_host;
                if let Ok(ip) = host.parse::<IpAddr>() {
                    self.upstream_addr =
                        Some(SocketAddr::new(ip, self.env.config.server.remote_port));
                    Ok(TunnelStage::ReqConnect)
                } else {
                    Ok(TunnelStage::ReqLookup)
                }
            }
            Cmd::UdpAssociate => {
                let rep = if self.env.config.local.udp {
                    socks5::REP_SUCCESS
                } else {
                    socks5::REP_CMD_NOT_SUPPORTED
                };
                let bind = self.client.local_addr()?;
                let reply = socks5::encode_reply(rep, bind);
                self.write_client(&reply).await?;
                Ok(TunnelStage::ReqUdpAssoc)
            }
            Cmd::Bind => Ok(TunnelStage::Kill),
        }
    }

    /// No datagram relay: hold the control connection open until the client
    /// goes away, discarding anything it sends.
    async fn req_udp_assoc(&mut self, chunk: &mut [u8]) -> Result<TunnelStage> {
        let n = self.read_client(chunk).await?;
        if n == 0 {
            Ok(TunnelStage::Kill)
        } else {
            Ok(TunnelStage::ReqUdpAssoc)
        }
    }

    async fn req_lookup(&mut self) -> Result<TunnelStage> {
        let host = self.env.config.server.remote_host.clone();
        let port = self.env.config.server.remote_port;

        let resolved = match timeout(self.idle, tokio::net::lookup_host((host.as_str(), port))).await
        {
            Err(_) => return Err(TunnelError::Timeout),
            Ok(Ok(mut addrs)) => addrs.next(),
            Ok(Err(e)) => {
                debug!(tunnel_id = %self.id, host = %host, error = %e, "Resolve failed");
                None
            }
        };

        match resolved {
            Some(addr) => {
                self.upstream_addr = Some(addr);
                Ok(TunnelStage::ReqConnect)
            }
            None => {
                METRICS.resolve_failure();
                let reply =
                    socks5::encode_reply(socks5::REP_HOST_UNREACHABLE, socks5::zero_bind_addr_v4());
                self.write_client(&reply).await?;
                Err(TunnelError::ResolveFailed(host))
            }
        }
    }

    async fn req_connect(&mut self) -> Result<TunnelStage> {
        let addr = self
            .upstream_addr
            .expect("upstream address resolved before connect");

        let stream = match timeout(self.idle, TcpStream::connect(addr)).await {
            Err(_) => return Err(TunnelError::Timeout),
            Ok(Err(e)) => {
                METRICS.connect_failure();
                warn!(tunnel_id = %self.id, upstream = %addr, error = %e, "Upstream connect failed");
                let reply =
                    socks5::encode_reply(socks5::REP_CONN_REFUSED, socks5::zero_bind_addr_v4());
                self.write_client(&reply).await?;
                return Err(TunnelError::ConnectFailed(e));
            }
            Ok(Ok(stream)) => stream,
        };
        util::tune_stream(&stream);
        debug!(tunnel_id = %self.id, upstream = %addr, "Upstream connected");

        // The initial package precedes every other upstream byte.
        let init = self
            .init_package
            .clone()
            .expect("init package built at request parse");
        let wire = self
            .pipeline
            .as_mut()
            .expect("pipeline built at request parse")
            .encrypt(&init)?;

        let mut upstream = stream;
        match timeout(self.idle, upstream.write_all(&wire)).await {
            Err(_) => return Err(TunnelError::Timeout),
            Ok(result) => result?,
        }
        self.upstream = Some(upstream);
        Ok(TunnelStage::SsrAuthSent)
    }

    /// Success reply mirrors the requested destination.
    async fn ssr_auth_sent(&mut self) -> Result<TunnelStage> {
        let mut reply = vec![socks5::VERSION, socks5::REP_SUCCESS, 0x00];
        reply.extend_from_slice(
            self.init_package
                .as_ref()
                .expect("init package lives until teardown"),
        );
        self.write_client(&reply).await?;

        if let Some(request) = &self.request {
            debug!(
                tunnel_id = %self.id,
                client_addr = %self.peer,
                dest = %request.addr,
                port = request.port,
                "Tunnel established"
            );
        }
        Ok(TunnelStage::ProxyStart)
    }

    async fn relay(&mut self) -> Result<()> {
        let pipeline = Mutex::new(
            self.pipeline
                .take()
                .expect("pipeline built at request parse"),
        );
        let upstream = self.upstream.take().expect("upstream connected");
        let idle = self.idle;

        let (mut upstream_read, upstream_write) = upstream.into_split();
        // Shared so the downstream direction can push obfs feedback writes.
        let upstream_write = tokio::sync::Mutex::new(upstream_write);
        let (mut client_read, mut client_write) = self.client.split();

        let client_to_upstream = async {
            let mut buf = vec![0u8; SSR_BUFF_SIZE];
            let mut total: u64 = 0;

            loop {
                let n = match timeout(idle, client_read.read(&mut buf)).await {
                    Err(_) => return Err(TunnelError::Timeout),
                    Ok(Err(e)) => return Err(TunnelError::from(e)),
                    Ok(Ok(0)) => break, // EOF: half-close toward the server
                    Ok(Ok(n)) => n,
                };

                let wire = pipeline.lock().encrypt(&buf[..n])?;
                let write = async { upstream_write.lock().await.write_all(&wire).await };
                match timeout(idle, write).await {
                    Err(_) => return Err(TunnelError::Timeout),
                    Ok(result) => result?,
                }
                total += n as u64;
                METRICS.bytes_up(n as u64);
            }

            let _ = upstream_write.lock().await.shutdown().await;
            Ok::<u64, TunnelError>(total)
        };

        let upstream_to_client = async {
            let mut buf = vec![0u8; SSR_BUFF_SIZE];
            let mut total: u64 = 0;

            loop {
                let n = match timeout(idle, upstream_read.read(&mut buf)).await {
                    Err(_) => return Err(TunnelError::Timeout),
                    Ok(Err(e)) => return Err(TunnelError::from(e)),
                    Ok(Ok(0)) => break, // EOF: half-close toward the client
                    Ok(Ok(n)) => n,
                };

                let (plain, feedback) = pipeline.lock().decrypt(&buf[..n])?;

                // A feedback-only result pauses this read side until the
                // handshake continuation is on the wire.
                if let Some(feedback) = feedback {
                    if !feedback.is_empty() {
                        let write =
                            async { upstream_write.lock().await.write_all(&feedback).await };
                        match timeout(idle, write).await {
                            Err(_) => return Err(TunnelError::Timeout),
                            Ok(result) => result?,
                        }
                    }
                }

                if !plain.is_empty() {
                    match timeout(idle, client_write.write_all(&plain)).await {
                        Err(_) => return Err(TunnelError::Timeout),
                        Ok(result) => result?,
                    }
                    total += plain.len() as u64;
                    METRICS.bytes_down(plain.len() as u64);
                }
            }

            let _ = client_write.shutdown().await;
            Ok::<u64, TunnelError>(total)
        };

        let mut shutdown_rx = self.env.registry.subscribe_shutdown();
        tokio::select! {
            result = async { tokio::try_join!(client_to_upstream, upstream_to_client) } => {
                let (up, down) = result?;
                debug!(tunnel_id = %self.id, up_bytes = up, down_bytes = down, "Relay finished");
                Ok(())
            }
            _ = shutdown_rx.recv() => {
                debug!(tunnel_id = %self.id, "Relay interrupted by shutdown");
                Ok(())
            }
        }
    }

    async fn read_client(&mut self, buf: &mut [u8]) -> Result<usize> {
        match timeout(self.idle, self.client.read(buf)).await {
            Err(_) => Err(TunnelError::Timeout),
            Ok(result) => Ok(result?),
        }
    }

    async fn write_client(&mut self, data: &[u8]) -> Result<()> {
        match timeout(self.idle, self.client.write_all(data)).await {
            Err(_) => Err(TunnelError::Timeout),
            Ok(result) => Ok(result?),
        }
    }
}
