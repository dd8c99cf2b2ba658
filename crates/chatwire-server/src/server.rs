//! TCP accept loop.

use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::store::{FileStore, StoreError};
use chatwire_proto::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT, ProtocolError, TransferLimits};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Default file cache budget (500 MiB)
pub const DEFAULT_CACHE_BUDGET: u64 = 500 * 1024 * 1024;

/// Server startup errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage could not be opened
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Storage directory for uploaded files
    pub storage_dir: PathBuf,
    /// Memory cache budget in bytes (0 disables caching)
    pub cache_budget: u64,
    /// Upload limits applied to every session
    pub upload_limits: TransferLimits,
    /// Size of each chunk when serving downloads
    pub download_chunk_size: usize,
    /// Time allowed for the opening handshake
    pub handshake_timeout: Duration,
    /// Interval of the stale-upload reaper
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("ServerFiles"),
            cache_budget: DEFAULT_CACHE_BUDGET,
            upload_limits: TransferLimits::upload(),
            download_chunk_size: DEFAULT_CHUNK_SIZE,
            handshake_timeout: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Chat relay server
pub struct ChatServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    config: ServerConfig,
}

impl ChatServer {
    /// Bind with default configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the storage
    /// directory cannot be created.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ServerError> {
        Self::bind_with_config(addr, ServerConfig::default()).await
    }

    /// Bind with custom configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the storage
    /// directory cannot be created.
    pub async fn bind_with_config(
        addr: SocketAddr,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        let store = FileStore::open(&config.storage_dir, config.cache_budget).await?;
        let listener = TcpListener::bind(addr).await?;
        let registry = Arc::new(SessionRegistry::new(store, config.download_chunk_size));

        info!(addr = %listener.local_addr()?, "chat server listening");
        Ok(Self {
            listener,
            registry,
            config,
        })
    }

    /// Default listen address (all interfaces, port 9000)
    #[must_use]
    pub fn default_addr() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Session registry
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept connections forever
    pub async fn run(&self) {
        self.run_until(std::future::pending::<()>()).await;
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) {
        let cleanup = self
            .registry
            .spawn_cleanup_task(self.config.cleanup_interval);
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = &mut shutdown => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let registry = Arc::clone(&self.registry);
                    let limits = self.config.upload_limits;
                    let timeout = self.config.handshake_timeout;
                    tokio::spawn(handle_connection(stream, peer, registry, limits, timeout));
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        cleanup.abort();
        info!("chat server stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    limits: TransferLimits,
    timeout: Duration,
) {
    let (session, reader) = match Session::handshake(stream, limits, timeout).await {
        Ok(accepted) => accepted,
        Err(ProtocolError::Disconnected) => {
            debug!(%peer, "peer left before handshake");
            return;
        }
        Err(e) => {
            warn!(%peer, "handshake failed: {e}");
            return;
        }
    };

    registry.register(Arc::clone(&session)).await;
    session.run(reader, registry).await;
}
