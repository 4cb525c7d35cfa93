//! Persisted state files
//!
//! The blocklist and the cache index are each stored as a single JSON document
//! in the working directory. Files are read once at startup and overwritten
//! wholesale at shutdown.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid state file {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn format(path: &Path, source: serde_json::Error) -> Self {
        Self::Format {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Load a state file, creating it with the default value when absent.
///
/// An existing but empty file also yields the default value.
pub async fn load_or_create<T>(path: &Path) -> Result<T, PersistError>
where
    T: DeserializeOwned + Serialize + Default,
{
    match tokio::fs::read(path).await {
        Ok(data) if data.iter().all(u8::is_ascii_whitespace) => {
            debug!("State file {} is empty", path.display());
            Ok(T::default())
        }
        Ok(data) => serde_json::from_slice(&data).map_err(|e| PersistError::format(path, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("No state file at {} - creating new file", path.display());
            let value = T::default();
            save(path, &value).await?;
            Ok(value)
        }
        Err(e) => Err(PersistError::io(path, e)),
    }
}

/// Overwrite a state file with `value`.
///
/// The document is written to a sibling temp file and renamed into place so a
/// failed write never truncates the previous state.
pub async fn save<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let data = serde_json::to_vec_pretty(value).map_err(|e| PersistError::format(path, e))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PersistError::io(parent, e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &data)
        .await
        .map_err(|e| PersistError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PersistError::io(path, e))?;

    debug!("Wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}
