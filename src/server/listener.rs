//! SOCKS5 accept loop
//!
//! Binds the loopback listener, spawns one tunnel task per client
//! connection and coordinates graceful shutdown with a bounded drain.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::server::env::ServerEnv;
use crate::tunnel;
use crate::util;

/// How long graceful shutdown waits for tunnels to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The SOCKS5 gateway server
pub struct Server {
    listener: tokio::net::TcpListener,
    env: Arc<ServerEnv>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Create a new server instance
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let env = ServerEnv::new(config.clone())?;

        let addr = config.local.listen_addr()?;
        let listener = util::create_listener(addr)
            .with_context(|| format!("Failed to bind SOCKS5 listener to {addr}"))?;
        info!(bind_addr = %listener.local_addr()?, "SOCKS5 listener bound");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            listener,
            env,
            shutdown_rx,
            shutdown_tx,
        })
    }

    /// Actual bound address (useful with an ephemeral listen port)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared environment handle
    pub fn env(&self) -> Arc<ServerEnv> {
        self.env.clone()
    }

    /// Run the server (main accept loop)
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            util::tune_stream(&stream);
                            let env = self.env.clone();
                            tokio::spawn(async move {
                                tunnel::handle_client(env, stream, peer).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, no longer accepting");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        let _ = self.shutdown_tx.send(true);
        self.env.registry.shutdown_all();
        self.drain(DRAIN_TIMEOUT).await;

        info!("Server shutdown complete");
    }

    /// Wait for live tunnels to finish, then report stragglers.
    async fn drain(&self, timeout: Duration) {
        info!(tunnels = self.env.registry.len(), "Draining tunnels");

        let start = std::time::Instant::now();
        while !self.env.registry.is_empty() && start.elapsed() < timeout {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if self.env.registry.is_empty() {
            info!("All tunnels drained");
        } else {
            self.env.registry.for_each_snapshot(|id, entry| {
                warn!(
                    tunnel_id = %id,
                    client_addr = %entry.client_addr,
                    "Tunnel still open after drain timeout"
                );
            });
        }
    }
}
