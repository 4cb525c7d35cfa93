//! Listener and lifecycle management
//!
//! The accept loop spawns one tracked worker per client socket. Shutdown is
//! cooperative: cancelling the token stops the loop, the cache index and the
//! blocklist are written out, and the call returns only after every worker
//! (tunnel relay halves included) has finished.

use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::blocklist::Blocklist;
use crate::cache::CacheStore;
use crate::certs::CertificateHint;
use crate::config::Config;
use crate::connection::handle_connection;
use crate::fetcher::{FetchError, OriginFetcher};

/// Process-wide state shared by every connection worker
pub struct ProxyState {
    pub config: Arc<Config>,
    pub cache: Arc<CacheStore>,
    pub blocklist: Arc<Blocklist>,
    pub certs: Arc<dyn CertificateHint>,
    pub fetcher: OriginFetcher,
    /// Join set for connection workers and tunnel relay tasks
    pub tracker: TaskTracker,
}

impl ProxyState {
    pub fn new(
        config: Config,
        cache: Arc<CacheStore>,
        blocklist: Arc<Blocklist>,
        certs: Arc<dyn CertificateHint>,
    ) -> Result<Self, FetchError> {
        let fetcher = OriginFetcher::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            cache,
            blocklist,
            certs,
            fetcher,
            tracker: TaskTracker::new(),
        })
    }

    /// Load the persisted cache index and blocklist named by `config`
    pub async fn load(config: Config, certs: Arc<dyn CertificateHint>) -> Result<Self> {
        let cache = CacheStore::open(
            config.cache_dir.clone(),
            &config.cache_index_path,
            config.cache_ttl(),
        )
        .await
        .context("Failed to open cache store")?;
        let blocklist = Blocklist::load(&config.blocklist_path).await;

        let state = Self::new(config, Arc::new(cache), Arc::new(blocklist), certs)
            .context("Failed to create origin client")?;
        Ok(state)
    }

    /// Write the cache index and blocklist. Failures are logged only.
    pub async fn persist(&self) {
        if let Err(e) = self.cache.persist(&self.config.cache_index_path).await {
            error!("[CACHE] Failed to save cached sites: {}", e);
        }
        if let Err(e) = self.blocklist.persist(&self.config.blocklist_path).await {
            error!("[BLOCK] Failed to save blocked sites: {}", e);
        }
    }
}

/// Bound listener plus the state its workers share
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub async fn bind(state: ProxyState) -> Result<Self> {
        let bind_addr = state.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", bind_addr))?;
        info!("[LISTENER] Listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<ProxyState> {
        Arc::clone(&self.state)
    }

    /// Token that stops the accept loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept until shutdown, then persist state and drain workers
    pub async fn run(self) {
        let accept_timeout = self.state.config.accept_timeout();

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = timeout(accept_timeout, self.listener.accept()) => accepted,
            };

            match accepted {
                // Bounded wait elapsed, check the shutdown flag again
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    debug!("[LISTENER] Accepted connection from {}", peer);
                    let state = Arc::clone(&self.state);
                    self.state.tracker.spawn(async move {
                        handle_connection(stream, peer, &state).await;
                    });
                }
                Ok(Err(e)) => {
                    warn!("[LISTENER] Failed to accept connection: {}", e);
                }
            }
        }

        info!("[LISTENER] Shutting down, no longer accepting connections");
        self.state.persist().await;

        self.state.tracker.close();
        let in_flight = self.state.tracker.len();
        if in_flight > 0 {
            info!("[LISTENER] Waiting for {} workers to finish", in_flight);
        }
        self.state.tracker.wait().await;

        drop(self.listener);
        info!("[LISTENER] Shutdown complete");
    }
}
