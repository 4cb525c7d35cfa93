use std::collections::BTreeSet;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::persist::{self, PersistError};
use crate::request::CanonicalUrl;

/// Operator-maintained set of blocked URLs
///
/// Entries are only ever added at runtime. Lookups use the same
/// [`CanonicalUrl`] form as the cache so both decisions agree on a key.
#[derive(Debug, Default)]
pub struct Blocklist {
    entries: RwLock<BTreeSet<CanonicalUrl>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a blocklist from existing entries
    pub fn with_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = CanonicalUrl>,
    {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Load the persisted blocklist, creating an empty file when absent.
    ///
    /// An unreadable file is logged and replaced by an empty list.
    pub async fn load(path: &Path) -> Self {
        match persist::load_or_create::<BTreeSet<CanonicalUrl>>(path).await {
            Ok(entries) => {
                info!("[BLOCK] Loaded {} blocked sites from {}", entries.len(), path.display());
                Self::with_entries(entries)
            }
            Err(e) => {
                warn!("[BLOCK] Failed to load blocked sites, starting empty: {}", e);
                Self::new()
            }
        }
    }

    /// Check whether a key is blocked
    pub async fn is_blocked(&self, key: &CanonicalUrl) -> bool {
        let blocked = self.entries.read().await.contains(key);
        if blocked {
            debug!("[BLOCK] Blocklist hit for {}", key);
        }
        blocked
    }

    /// Add a key. Returns false if it was already present.
    pub async fn add(&self, key: CanonicalUrl) -> bool {
        let mut entries = self.entries.write().await;
        let inserted = entries.insert(key.clone());
        if inserted {
            info!("[BLOCK] Blocked {}", key);
        }
        inserted
    }

    /// Sorted snapshot of all entries
    pub async fn entries(&self) -> Vec<CanonicalUrl> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Write the whole list to `path`
    pub async fn persist(&self, path: &Path) -> Result<(), PersistError> {
        let snapshot = self.entries.read().await.clone();
        persist::save(path, &snapshot).await?;
        info!("[BLOCK] Saved {} blocked sites to {}", snapshot.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_add_and_check() {
        let blocklist = Blocklist::new();
        let key = CanonicalUrl::new("http://blocked.com");

        assert!(!blocklist.is_blocked(&key).await);
        assert!(blocklist.add(key.clone()).await);
        assert!(blocklist.is_blocked(&key).await);

        // Adding twice is a no-op
        assert!(!blocklist.add(key.clone()).await);
        assert_eq!(blocklist.len().await, 1);
    }

    #[tokio::test]
    async fn test_equivalent_forms_match() {
        let blocklist = Blocklist::new();
        blocklist.add(CanonicalUrl::new("blocked.com")).await;

        assert!(blocklist.is_blocked(&CanonicalUrl::new("http://blocked.com/")).await);
        assert!(!blocklist.is_blocked(&CanonicalUrl::new("http://other.com/")).await);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blockedSites.json");

        let blocklist = Blocklist::new();
        blocklist.add(CanonicalUrl::new("http://a.com")).await;
        blocklist.add(CanonicalUrl::new("b.com:443")).await;
        blocklist.persist(&path).await.unwrap();

        let reloaded = Blocklist::load(&path).await;
        assert_eq!(reloaded.entries().await, blocklist.entries().await);
    }

    #[tokio::test]
    async fn test_load_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blockedSites.json");

        let blocklist = Blocklist::load(&path).await;
        assert!(blocklist.is_empty().await);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_concurrent_adds() {
        let blocklist = Arc::new(Blocklist::new());
        let mut handles = Vec::new();

        for i in 0..50 {
            let blocklist = Arc::clone(&blocklist);
            handles.push(tokio::spawn(async move {
                blocklist
                    .add(CanonicalUrl::new(&format!("site{}.com", i)))
                    .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(blocklist.len().await, 50);
    }
}
