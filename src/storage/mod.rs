//! Storage for feed documents and the engine's collaborators.
//!
//! - [`FeedStore`]: paginated feed documents on the local filesystem
//! - [`SettingsStore`]: key-value settings and user registration records
//! - [`TimelineCache`]: ephemeral timeline snapshots
//!
//! ## Directory Structure
//!
//! ```text
//! storage/
//! ├── config.toml
//! ├── settings.json                      # SettingsStore (JsonFileSettings)
//! └── users/
//!     └── {user_id}/
//!         ├── feed.xml                   # live feed, newest first
//!         ├── feed-20260101120000000000.xml  # archive reached via next_node
//!         ├── follows.xml
//!         └── blocks.xml
//! ```

pub mod cache;
pub mod local;
pub mod settings;

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::error::Result;

// Re-export for convenience
pub use cache::{MemoryCache, TimelineCache};
pub use local::{AppendOutcome, FeedStore};
pub use settings::{JsonFileSettings, MemorySettings, SettingsStore};

/// Write bytes atomically (write to temp, then rename).
///
/// Readers see either the old file or the new one, never a partial write.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.tmp"));

    let result = match write_synced(&tmp, bytes).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            log::debug!("Could not remove {}: {}", tmp.display(), e);
        }
    }
    Ok(result?)
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_creates_dirs_and_leaves_no_tmp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a/b/feed.xml");

        write_atomic(&path, b"hello").await.unwrap();
        write_atomic(&path, b"world").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"world");
        assert!(!tmp.path().join("a/b/feed.xml.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_write_removes_tmp() {
        let tmp = TempDir::new().unwrap();
        // a non-empty directory where the file should go makes the rename fail
        let path = tmp.path().join("feed.xml");
        std::fs::create_dir_all(path.join("taken")).unwrap();

        assert!(write_atomic(&path, b"hello").await.is_err());
        assert!(!tmp.path().join("feed.xml.tmp").exists());
        assert!(path.is_dir());
    }
}
