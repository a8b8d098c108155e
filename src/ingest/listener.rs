//! RTMP ingest listener
//!
//! Handles the TCP accept loop and spawns a connection task per peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::RtmpConfig;
use crate::controller::PublishController;
use crate::error::Result;
use crate::ingest::connection::Connection;
use crate::registry::StreamRegistry;

/// RTMP ingest server
pub struct IngestServer {
    config: RtmpConfig,
    controller: Arc<PublishController>,
    registry: Arc<StreamRegistry>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl IngestServer {
    pub fn new(
        config: RtmpConfig,
        controller: Arc<PublishController>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            controller,
            registry,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Bind the configured address and run until the token is cancelled.
    pub async fn run_until(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_on(listener, cancel).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn run_on(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, app = %self.config.app_name, "RTMP ingest listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("RTMP ingest shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        self.handle_connection(socket, peer_addr).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream, peer_addr: std::net::SocketAddr) {
        let permit = if let Some(semaphore) = &self.connection_semaphore {
            match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!(session_id, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let connection = Connection::new(
            session_id,
            socket,
            peer_addr,
            self.config.clone(),
            Arc::clone(&self.controller),
            Arc::clone(&self.registry),
        );

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = connection.run().await {
                tracing::debug!(session_id, error = %e, "Connection error");
            }
            tracing::debug!(session_id, "Connection closed");
        });
    }
}
