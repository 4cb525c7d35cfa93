//! Origin Fetcher
//!
//! Retrieves resources the cache does not hold and delivers them to the
//! client. Text bodies are streamed chunk by chunk to the client and to a
//! staged cache artifact at the same time; images are fully decoded and
//! re-encoded in their source format before anything is written, so an error
//! page served under an image URL turns into a `404 Not Found` instead of a
//! poisoned cache entry.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_LANGUAGE, CONTENT_TYPE};
use reqwest::redirect::Policy;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::cache::{ArtifactKind, ArtifactWriter, CacheError, CacheStore, CachedArtifact, ImageType};
use crate::config::Config;
use crate::metrics::ProxyMetrics;
use crate::request::CanonicalUrl;
use crate::response::{send_status, Status, PROXY_AGENT};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to build origin client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Origin timed out for {url}")]
    Timeout { url: String },

    #[error("Origin unreachable for {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Origin returned {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Origin body for {url} is not a valid image: {reason}")]
    NotAnImage { url: String, reason: String },

    #[error("Origin body for {url} interrupted: {source}")]
    Interrupted {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Cached artifact unavailable: {0}")]
    Artifact(#[from] CacheError),

    #[error("Client write failed: {0}")]
    ClientWrite(#[source] io::Error),
}

impl FetchError {
    fn from_request(url: &CanonicalUrl, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Unreachable {
                url: url.to_string(),
                source,
            }
        }
    }

    /// Status line to send when the failure happens before any response bytes
    ///
    /// `None` means the connection is closed without an answer, either because
    /// the head was already sent or because no status fits the failure.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Status { .. } | Self::NotAnImage { .. } => Some(Status::NotFound),
            Self::Timeout { .. } => Some(Status::Timeout),
            _ => None,
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Status { .. } => "bad_status",
            Self::NotAnImage { .. } => "not_image",
            Self::Interrupted { .. } => "interrupted",
            Self::ClientWrite(_) => "client_gone",
            _ => "unreachable",
        }
    }
}

/// Outbound HTTP client shared by all connection workers
#[derive(Debug)]
pub struct OriginFetcher {
    client: reqwest::Client,
    origin_fetches: AtomicU64,
}

impl OriginFetcher {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        headers.insert(CONTENT_LANGUAGE, HeaderValue::from_static("en-US"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let client = reqwest::Client::builder()
            .no_proxy()
            .user_agent(PROXY_AGENT)
            .default_headers(headers)
            .connect_timeout(config.connect_timeout())
            .timeout(config.origin_timeout())
            .redirect(Policy::limited(10))
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            origin_fetches: AtomicU64::new(0),
        })
    }

    /// Number of requests sent to origin servers since startup
    pub fn origin_fetches(&self) -> u64 {
        self.origin_fetches.load(Ordering::Relaxed)
    }

    /// Fetch `key` from its origin, answer the client and populate the cache.
    ///
    /// The cache entry is only registered once the whole body reached both the
    /// client and the artifact file.
    pub async fn fetch<W>(
        &self,
        key: &CanonicalUrl,
        kind: ArtifactKind,
        cache: &CacheStore,
        client: &mut W,
    ) -> Result<u64, FetchError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        self.origin_fetches.fetch_add(1, Ordering::Relaxed);
        debug!("[HTTP] Fetching {} from origin as {}", key, kind.label());

        let result = match kind {
            ArtifactKind::Text => self.fetch_text(key, cache, client).await,
            ArtifactKind::Image(image_type) => {
                self.fetch_image(key, image_type, cache, client).await
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(bytes) => {
                ProxyMetrics::record_origin_fetch(kind.label(), "success", elapsed);
                info!("[HTTP] Fetched {} ({} bytes) in {:.3}s", key, bytes, elapsed);
            }
            Err(e) => ProxyMetrics::record_origin_fetch(kind.label(), e.metric_label(), elapsed),
        }
        result
    }

    async fn send(&self, key: &CanonicalUrl) -> Result<reqwest::Response, FetchError> {
        let response = self
            .client
            .get(key.as_str())
            .send()
            .await
            .map_err(|e| FetchError::from_request(key, e))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::Status {
                url: key.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn fetch_text<W>(
        &self,
        key: &CanonicalUrl,
        cache: &CacheStore,
        client: &mut W,
    ) -> Result<u64, FetchError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut response = self.send(key).await?;

        send_status(client, Status::Ok)
            .await
            .map_err(FetchError::ClientWrite)?;

        let mut artifact = match cache.begin(key, ArtifactKind::Text).await {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!("[CACHE] Not caching {}: {}", key, e);
                ProxyMetrics::record_cache_write(false);
                None
            }
        };

        let mut streamed = 0u64;
        loop {
            // Dropping a pending artifact on any early return removes its part file
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(source) => {
                    return Err(FetchError::Interrupted {
                        url: key.to_string(),
                        source,
                    })
                }
            };

            client
                .write_all(&chunk)
                .await
                .map_err(FetchError::ClientWrite)?;
            streamed += chunk.len() as u64;

            let failed = match artifact.as_mut() {
                Some(writer) => writer.write_all(&chunk).await.err(),
                None => None,
            };
            if let Some(e) = failed {
                warn!("[CACHE] Disabling cache for {}: {}", key, e);
                ProxyMetrics::record_cache_write(false);
                if let Some(writer) = artifact.take() {
                    writer.abort().await;
                }
            }
        }
        client.flush().await.map_err(FetchError::ClientWrite)?;

        if let Some(writer) = artifact {
            store(cache, writer).await;
        }
        Ok(streamed)
    }

    async fn fetch_image<W>(
        &self,
        key: &CanonicalUrl,
        image_type: ImageType,
        cache: &CacheStore,
        client: &mut W,
    ) -> Result<u64, FetchError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let response = self.send(key).await?;
        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Interrupted {
                url: key.to_string(),
                source,
            })?;

        let encoded = reencode_image(key, body, image_type).await?;

        send_status(client, Status::Ok)
            .await
            .map_err(FetchError::ClientWrite)?;
        client
            .write_all(&encoded)
            .await
            .map_err(FetchError::ClientWrite)?;
        client.flush().await.map_err(FetchError::ClientWrite)?;

        match cache.begin(key, ArtifactKind::Image(image_type)).await {
            Ok(mut writer) => match writer.write_all(&encoded).await {
                Ok(()) => store(cache, writer).await,
                Err(e) => {
                    warn!("[CACHE] Not caching {}: {}", key, e);
                    ProxyMetrics::record_cache_write(false);
                    writer.abort().await;
                }
            },
            Err(e) => {
                warn!("[CACHE] Not caching {}: {}", key, e);
                ProxyMetrics::record_cache_write(false);
            }
        }

        Ok(encoded.len() as u64)
    }
}

async fn store(cache: &CacheStore, writer: ArtifactWriter) {
    match cache.commit(writer).await {
        Ok(Some(_)) => ProxyMetrics::record_cache_write(true),
        Ok(None) => {}
        Err(e) => {
            warn!("[CACHE] Failed to store artifact: {}", e);
            ProxyMetrics::record_cache_write(false);
        }
    }
}

/// Write a cache hit to the client
///
/// Text artifacts are copied as stored. Images are decoded and re-encoded on
/// the way out; an artifact that no longer decodes is answered with
/// `404 Not Found`. Errors returned before the `200 OK` head is written leave
/// the client untouched so the caller can fall back to the origin.
pub async fn serve_cached<W>(
    cache: &CacheStore,
    artifact: &CachedArtifact,
    client: &mut W,
) -> Result<u64, FetchError>
where
    W: AsyncWrite + Unpin + Send,
{
    match artifact.kind() {
        ArtifactKind::Text => {
            let mut file = cache.open_artifact(artifact).await?;
            send_status(client, Status::Ok)
                .await
                .map_err(FetchError::ClientWrite)?;
            let copied = tokio::io::copy(&mut file, client)
                .await
                .map_err(FetchError::ClientWrite)?;
            client.flush().await.map_err(FetchError::ClientWrite)?;
            Ok(copied)
        }
        ArtifactKind::Image(image_type) => {
            let data = cache.read_artifact(artifact).await?;
            let encoded = reencode_image(artifact.key(), Bytes::from(data), image_type).await?;
            send_status(client, Status::Ok)
                .await
                .map_err(FetchError::ClientWrite)?;
            client
                .write_all(&encoded)
                .await
                .map_err(FetchError::ClientWrite)?;
            client.flush().await.map_err(FetchError::ClientWrite)?;
            Ok(encoded.len() as u64)
        }
    }
}

/// Decode off the async runtime, then encode again in the same format
async fn reencode_image(
    key: &CanonicalUrl,
    data: Bytes,
    image_type: ImageType,
) -> Result<Vec<u8>, FetchError> {
    let result = tokio::task::spawn_blocking(move || reencode(&data, image_type)).await;

    match result {
        Ok(Ok(encoded)) => Ok(encoded),
        Ok(Err(e)) => Err(FetchError::NotAnImage {
            url: key.to_string(),
            reason: e.to_string(),
        }),
        Err(e) => Err(FetchError::NotAnImage {
            url: key.to_string(),
            reason: format!("decoder task failed: {}", e),
        }),
    }
}

fn reencode(data: &[u8], image_type: ImageType) -> Result<Vec<u8>, image::ImageError> {
    let format = image_type.format();
    let decoded = image::load_from_memory_with_format(data, format)?;

    // The JPEG encoder has no alpha channel support
    let decoded = match image_type {
        ImageType::Jpeg => image::DynamicImage::ImageRgb8(decoded.to_rgb8()),
        _ => decoded,
    };

    let mut out = Cursor::new(Vec::new());
    decoded.write_to(&mut out, format)?;
    Ok(out.into_inner())
}
