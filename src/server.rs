//! The request dispatcher.
//!
//! One well-known UDP socket accepts initial datagrams only. Every valid
//! RRQ or WRQ is handed to a spawned worker that runs the whole session on
//! its own ephemeral socket; anything else is answered by a short-lived
//! reject worker. A semaphore caps how many workers run at once.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::protocol::{Packet, RequestKind};
use crate::transfer::{self, TransferConfig};

const DEFAULT_BIND: &str = "0.0.0.0:6969";
const DEFAULT_MAX_TRANSFERS: usize = 32;

/// Server configuration: the listening endpoint plus the settings handed to
/// every transfer worker.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the request socket binds to. The standard port 69 needs
    /// elevated privileges, so the default stays above 1024.
    pub bind_address: String,
    /// Concurrent session ceiling. Requests beyond it are dropped.
    pub max_transfers: usize,
    /// Per-session settings.
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND.to_string(),
            max_transfers: DEFAULT_MAX_TRANSFERS,
            transfer: TransferConfig::default(),
        }
    }
}

/// TFTP server: owns the request socket and dispatches sessions.
pub struct TftpServer {
    config: ServerConfig,
    socket: Option<UdpSocket>,
}

impl TftpServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            socket: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the request socket without starting to serve.
    pub async fn bind(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("failed to bind TFTP socket on {}", self.config.bind_address))?;
        let local = socket.local_addr().context("failed to read local address")?;
        info!(
            "TFTP server listening on {} (read root: {}, write root: {})",
            local,
            self.config.transfer.read_root.display(),
            self.config.transfer.write_root.display()
        );
        self.socket = Some(socket);
        Ok(())
    }

    /// Local address of the request socket once bound. Useful when binding
    /// to port 0 and the caller needs the port the OS picked.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind if necessary, then serve requests forever.
    pub async fn run(&mut self) -> Result<()> {
        if self.socket.is_none() {
            self.bind().await?;
        }
        self.serve().await
    }

    async fn serve(&self) -> Result<()> {
        let socket = self.socket.as_ref().expect("server must be bound before serving");
        let limiter = Arc::new(Semaphore::new(self.config.max_transfers));
        // Initial requests are small, but leave room for long filenames and
        // appended option lists.
        let mut buf = [0u8; 2048];

        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            let request = Packet::decode(&buf[..len]);

            let Ok(permit) = limiter.clone().try_acquire_owned() else {
                warn!("transfer limit reached, dropping request from {}", peer);
                continue;
            };

            match request {
                Ok(Packet::Request {
                    kind,
                    filename,
                    mode,
                }) => {
                    info!("{} for '{}' ({} mode) from {}", kind.name(), filename, mode, peer);
                    let config = self.config.transfer.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let result = match kind {
                            RequestKind::Read => {
                                transfer::handle_read_request(peer, filename.clone(), config).await
                            }
                            RequestKind::Write => {
                                transfer::handle_write_request(peer, filename.clone(), config).await
                            }
                        };
                        if let Err(err) = result {
                            warn!("{} for '{}' from {} failed: {}", kind.name(), filename, peer, err);
                        }
                    });
                }
                other => {
                    match &other {
                        Ok(packet) => {
                            debug!("{} packet on the request socket from {}", packet.opcode(), peer);
                        }
                        Err(err) => debug!("invalid request from {}: {}", peer, err),
                    }
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = transfer::reject_request(peer).await {
                            warn!("failed to reject request from {}: {}", peer, err);
                        }
                    });
                }
            }
        }
    }
}
