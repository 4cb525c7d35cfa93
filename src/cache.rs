//! Cache Store
//!
//! Maps canonical URLs to artifacts stored on local disk. Artifacts are
//! written once by the fetch that created them and never revalidated against
//! the origin; an optional TTL turns expired entries back into misses.
//!
//! Artifacts are written through [`ArtifactWriter`], which stages data in a
//! unique `.part` file and only renames it into place on [`CacheStore::commit`].
//! An abandoned writer removes its staging file, so an interrupted response
//! never leaves a partial artifact behind.
//!
//! The first committed artifact for a key wins. A later commit for a key that
//! still has a live entry is discarded, so concurrent misses on one URL never
//! overwrite the file a reader may be streaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::persist::{self, PersistError};
use crate::request::CanonicalUrl;

/// Longest sanitized URL prefix kept in an artifact file name
const MAX_STEM_LEN: usize = 120;

static PART_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Image encodings the proxy decodes and re-encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Png,
    Jpeg,
    Gif,
}

impl ImageType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }

    pub fn format(self) -> image::ImageFormat {
        match self {
            Self::Png => image::ImageFormat::Png,
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Gif => image::ImageFormat::Gif,
        }
    }
}

/// How an artifact is written back to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "format", rename_all = "lowercase")]
pub enum ArtifactKind {
    Text,
    Image(ImageType),
}

impl ArtifactKind {
    /// Classify a resource by the extension of its URL path
    pub fn for_url(key: &CanonicalUrl) -> Self {
        match path_extension(&key.path()).and_then(|ext| ImageType::from_extension(&ext)) {
            Some(image) => Self::Image(image),
            None => Self::Text,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image(_) => "image",
        }
    }
}

/// Extension of the last path segment, `None` for directory-like paths
fn path_extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next().unwrap_or_default();
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// A stored response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifact {
    key: CanonicalUrl,
    kind: ArtifactKind,
    file_name: String,
    size: u64,
    stored_at: DateTime<Utc>,
}

impl CachedArtifact {
    pub fn key(&self) -> &CanonicalUrl {
        &self.key
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }
}

/// Deterministic, filesystem-safe file name for a cache key
///
/// `http://example.com/a.html` becomes `example.com__a-<hash>.html`. The hash
/// covers the full key so URLs that sanitize to the same stem never share a
/// file. Directory-like paths get an `.html` extension.
pub fn artifact_file_name(key: &CanonicalUrl) -> String {
    let raw = key.as_str();
    let without_scheme = raw.split_once("://").map(|(_, rest)| rest).unwrap_or(raw);
    let without_query = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let ext = path_extension(&key.path());
    let stem_source = match &ext {
        Some(ext) => &without_query[..without_query.len() - ext.len() - 1],
        None => without_query,
    };

    let mut stem = String::with_capacity(stem_source.len());
    for c in stem_source.chars() {
        match c {
            '/' => stem.push_str("__"),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => stem.push(c),
            _ => stem.push('_'),
        }
    }
    stem.truncate(MAX_STEM_LEN);

    format!(
        "{}-{:016x}.{}",
        stem,
        fnv1a(raw.as_bytes()),
        ext.as_deref().unwrap_or("html")
    )
}

/// 64-bit FNV-1a, stable across builds
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Process-wide cache of fetched resources
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    ttl: Option<Duration>,
    entries: RwLock<BTreeMap<CanonicalUrl, CachedArtifact>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Create an empty store writing artifacts under `dir`
    pub fn new(dir: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            entries: RwLock::new(BTreeMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Load the persisted index and make sure the artifact directory exists.
    ///
    /// Index entries whose artifact file has disappeared are dropped. An
    /// unreadable index is logged and replaced by an empty cache.
    pub async fn open(
        dir: impl Into<PathBuf>,
        index_path: &Path,
        ttl: Option<Duration>,
    ) -> Result<Self, CacheError> {
        let store = Self::new(dir, ttl);
        tokio::fs::create_dir_all(&store.dir)
            .await
            .map_err(|e| CacheError::io(&store.dir, e))?;

        let index = match persist::load_or_create::<BTreeMap<CanonicalUrl, CachedArtifact>>(
            index_path,
        )
        .await
        {
            Ok(index) => index,
            Err(e) => {
                warn!("[CACHE] Failed to load cache index, starting empty: {}", e);
                BTreeMap::new()
            }
        };

        let mut entries = BTreeMap::new();
        for (key, artifact) in index {
            if tokio::fs::try_exists(store.dir.join(&artifact.file_name))
                .await
                .unwrap_or(false)
            {
                entries.insert(key, artifact);
            } else {
                warn!("[CACHE] Dropping {} - artifact file missing", key);
            }
        }

        info!(
            "[CACHE] Loaded {} cached sites from {}",
            entries.len(),
            index_path.display()
        );
        *store.entries.write().await = entries;
        Ok(store)
    }

    /// Look up a key. Expired entries count as misses.
    pub async fn get(&self, key: &CanonicalUrl) -> Option<CachedArtifact> {
        let found = self
            .entries
            .read()
            .await
            .get(key)
            .filter(|artifact| !self.is_expired(artifact))
            .cloned();

        match found {
            Some(artifact) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(artifact)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn is_expired(&self, artifact: &CachedArtifact) -> bool {
        match self.ttl {
            Some(ttl) => {
                let age = Utc::now().signed_duration_since(artifact.stored_at);
                age.to_std().map(|age| age > ttl).unwrap_or(false)
            }
            None => false,
        }
    }

    fn is_live(&self, entries: &BTreeMap<CanonicalUrl, CachedArtifact>, key: &CanonicalUrl) -> bool {
        entries
            .get(key)
            .map(|existing| !self.is_expired(existing))
            .unwrap_or(false)
    }

    /// Register a completed artifact unless a live entry already holds its key
    pub async fn put(&self, artifact: CachedArtifact) -> bool {
        let mut entries = self.entries.write().await;
        if self.is_live(&entries, &artifact.key) {
            debug!("[CACHE] Keeping existing entry for {}", artifact.key);
            return false;
        }
        debug!("[CACHE] Stored {} as {}", artifact.key, artifact.file_name);
        entries.insert(artifact.key.clone(), artifact);
        true
    }

    /// Move a finished writer's file into place and register it
    ///
    /// Returns `Ok(None)` and discards the staged file when another fetch
    /// already stored a live artifact for the same key.
    pub async fn commit(&self, writer: ArtifactWriter) -> Result<Option<CachedArtifact>, CacheError> {
        // Held across the rename so two commits for one key cannot race on the file
        let mut entries = self.entries.write().await;
        if self.is_live(&entries, &writer.key) {
            debug!("[CACHE] {} already cached, discarding duplicate", writer.key);
            writer.abort().await;
            return Ok(None);
        }

        let artifact = writer.commit().await?;
        debug!("[CACHE] Stored {} as {}", artifact.key, artifact.file_name);
        entries.insert(artifact.key.clone(), artifact.clone());
        Ok(Some(artifact))
    }

    pub async fn contains(&self, key: &CanonicalUrl) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Sorted snapshot of cached keys
    pub async fn keys(&self) -> Vec<CanonicalUrl> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Start writing a new artifact for `key`
    pub async fn begin(
        &self,
        key: &CanonicalUrl,
        kind: ArtifactKind,
    ) -> Result<ArtifactWriter, CacheError> {
        let file_name = artifact_file_name(key);
        let final_path = self.dir.join(&file_name);
        let part_path = self.dir.join(format!(
            "{}.{}-{}.part",
            file_name,
            std::process::id(),
            PART_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let file = File::create(&part_path)
            .await
            .map_err(|e| CacheError::io(&part_path, e))?;

        Ok(ArtifactWriter {
            key: key.clone(),
            kind,
            file_name,
            final_path,
            part_path,
            file: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    /// Open a stored artifact for reading
    pub async fn open_artifact(&self, artifact: &CachedArtifact) -> Result<File, CacheError> {
        let path = self.dir.join(&artifact.file_name);
        File::open(&path).await.map_err(|e| CacheError::io(&path, e))
    }

    /// Read a stored artifact fully
    pub async fn read_artifact(&self, artifact: &CachedArtifact) -> Result<Vec<u8>, CacheError> {
        let path = self.dir.join(&artifact.file_name);
        tokio::fs::read(&path)
            .await
            .map_err(|e| CacheError::io(&path, e))
    }

    /// Write the index to `path`
    pub async fn persist(&self, path: &Path) -> Result<(), PersistError> {
        let snapshot = self.entries.read().await.clone();
        persist::save(path, &snapshot).await?;
        info!("[CACHE] Saved {} cached sites to {}", snapshot.len(), path.display());
        Ok(())
    }
}

/// Staged artifact file owned by a single fetch
#[derive(Debug)]
pub struct ArtifactWriter {
    key: CanonicalUrl,
    kind: ArtifactKind,
    file_name: String,
    final_path: PathBuf,
    part_path: PathBuf,
    file: Option<BufWriter<File>>,
    written: u64,
}

impl ArtifactWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), CacheError> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => {
                return Err(CacheError::io(
                    &self.part_path,
                    io::Error::new(io::ErrorKind::Other, "artifact writer already closed"),
                ))
            }
        };
        file.write_all(data)
            .await
            .map_err(|e| CacheError::io(&self.part_path, e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flush and move the staged file into place
    async fn commit(mut self) -> Result<CachedArtifact, CacheError> {
        if let Err(e) = self.finish().await {
            let _ = tokio::fs::remove_file(&self.part_path).await;
            return Err(e);
        }

        Ok(CachedArtifact {
            key: self.key.clone(),
            kind: self.kind,
            file_name: self.file_name.clone(),
            size: self.written,
            stored_at: Utc::now(),
        })
    }

    async fn finish(&mut self) -> Result<(), CacheError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| CacheError::io(&self.part_path, e))?;
            file.get_mut()
                .sync_all()
                .await
                .map_err(|e| CacheError::io(&self.part_path, e))?;
        }

        tokio::fs::rename(&self.part_path, &self.final_path)
            .await
            .map_err(|e| CacheError::io(&self.final_path, e))
    }

    /// Drop the staged file
    pub async fn abort(mut self) {
        self.file.take();
        if let Err(e) = tokio::fs::remove_file(&self.part_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    "[CACHE] Failed to remove partial artifact {}: {}",
                    self.part_path.display(),
                    e
                );
            }
        }
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        // commit() renames the part file away, abort() already removed it.
        // Drop cannot await, so this is the one blocking filesystem call.
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.part_path);
        }
    }
}
