//! StashProxy - caching forward HTTP proxy
//!
//! Plain HTTP requests are answered from an on-disk cache or fetched from the
//! origin while the cache is filled. `CONNECT` requests are relayed as opaque
//! byte streams. An operator blocklist is consulted before any network or
//! filesystem access.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stashproxy::{Config, NoopCertificateHint, ProxyServer, ProxyState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = ProxyState::load(config, Arc::new(NoopCertificateHint)).await?;
//!     let server = ProxyServer::bind(state).await?;
//!
//!     let shutdown = server.shutdown_token();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.cancel();
//!     });
//!
//!     server.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `request` - request line parsing and cache/block keys
//! - `blocklist` - operator-maintained blocked URLs
//! - `cache` - artifact store and its persisted index
//! - `fetcher` - origin retrieval feeding client and cache
//! - `tunnel` - CONNECT relay
//! - `connection` - per-socket dispatch
//! - `server` - accept loop and shutdown
//! - `console` - stdin operator commands

// Request handling
pub mod connection;
pub mod request;
pub mod response;
pub mod server;
pub mod tunnel;

// State
pub mod blocklist;
pub mod cache;
pub mod persist;

// Origin access
pub mod certs;
pub mod fetcher;

// Operations
pub mod config;
pub mod console;
pub mod metrics;

pub use blocklist::Blocklist;
pub use cache::{ArtifactKind, CacheError, CacheStore, CachedArtifact, ImageType};
pub use certs::{CertificateHint, CommandCertificateHint, NoopCertificateHint};
pub use config::Config;
pub use console::{run_console, ConsoleCommand};
pub use fetcher::{FetchError, OriginFetcher};
pub use metrics::ProxyMetrics;
pub use persist::PersistError;
pub use request::{parse_request_line, CanonicalUrl, ConnectTarget, ParseError, RequestLine};
pub use response::Status;
pub use server::{ProxyServer, ProxyState};
pub use tunnel::{TunnelError, TunnelSettings, TunnelStats};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
