/*!
Thin wrapper over an [ObjectStore] for the `cleanslate/` file area.

Writes are atomic: the payload lands in `{name}.tmp` and is renamed into
place, so a reader never observes a half-written file and a crash leaves
only a temp file behind for the startup cleanup to sweep.
*/
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{DynObjectStore, Error as StoreError, ObjectStore};

/// Root of the engine's file area within the store.
pub const ROOT_DIR: &str = "cleanslate";

/// Directory holding snapshot manifests and shards.
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Directory holding per-table changelogs.
pub const CHANGELOG_DIR: &str = "changelog";

/// Directory holding saved application state.
pub const STATE_DIR: &str = "state";

/// Suffix of in-flight temp files.
pub const TMP_SUFFIX: &str = ".tmp";

/// A file's name and size as reported by a directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    /// File name within its directory.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Blob access for one `cleanslate/` area of an object store.
#[derive(Clone)]
pub struct BlobStore {
    store: Arc<DynObjectStore>,
}

impl BlobStore {
    /// Wrap an object store.
    pub fn new(store: Arc<DynObjectStore>) -> Self {
        BlobStore { store }
    }

    fn path(dir: &str, name: &str) -> Path {
        Path::from(format!("{}/{}/{}", ROOT_DIR, dir, name))
    }

    /// List the files of one directory, optionally filtered by name prefix.
    /// Names are returned sorted, with sizes.
    pub async fn list_files(&self, dir: &str, prefix: Option<&str>) -> Result<Vec<FileEntry>> {
        let dir_path = Path::from(format!("{}/{}", ROOT_DIR, dir));
        let listing = self
            .store
            .list(Some(&dir_path))
            .await
            .with_context(|| format!("listing {}", dir_path))?;
        let mut entries: Vec<FileEntry> = listing
            .try_filter_map(|meta| {
                let name = meta.location.filename().map(|name| name.to_string());
                let size = meta.size as u64;
                futures::future::ready(Ok(name.map(|name| FileEntry { name, size })))
            })
            .try_collect()
            .await
            .with_context(|| format!("listing {}", dir_path))?;
        if let Some(prefix) = prefix {
            entries.retain(|entry| entry.name.starts_with(prefix));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Read a whole file; None when it does not exist.
    pub async fn read_file(&self, dir: &str, name: &str) -> Result<Option<Bytes>> {
        let path = Self::path(dir, name);
        match self.store.get(&path).await {
            Ok(result) => Ok(Some(
                result
                    .bytes()
                    .await
                    .with_context(|| format!("reading {}", path))?,
            )),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path)),
        }
    }

    /// Write a whole file atomically: temp file first, then rename.
    pub async fn write_file(&self, dir: &str, name: &str, bytes: Bytes) -> Result<()> {
        let final_path = Self::path(dir, name);
        let temp_path = Self::path(dir, &format!("{}{}", name, TMP_SUFFIX));
        self.store
            .put(&temp_path, bytes)
            .await
            .with_context(|| format!("writing {}", temp_path))?;
        self.store
            .rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("promoting {} to {}", temp_path, final_path))?;
        Ok(())
    }

    /// Append bytes to a file, creating it when absent. The whole file is
    /// replaced atomically; the store has no append primitive.
    pub async fn append_file(&self, dir: &str, name: &str, bytes: Bytes) -> Result<()> {
        let mut combined = BytesMut::new();
        if let Some(existing) = self.read_file(dir, name).await? {
            combined.extend_from_slice(&existing);
        }
        combined.extend_from_slice(&bytes);
        self.write_file(dir, name, combined.freeze()).await
    }

    /// Copy a file within a directory, atomically on the destination side.
    pub async fn copy_file(&self, dir: &str, source: &str, target: &str) -> Result<()> {
        let bytes = self
            .read_file(dir, source)
            .await?
            .with_context(|| format!("copy source missing: {}/{}", dir, source))?;
        self.write_file(dir, target, bytes).await
    }

    /// Delete a file. Deleting a missing file is not an error.
    pub async fn delete_file(&self, dir: &str, name: &str) -> Result<()> {
        let path = Self::path(dir, name);
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("deleting {}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    fn memory_blobs() -> BlobStore {
        BlobStore::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_write_then_read_round_trips() -> Result<()> {
        let blobs = memory_blobs();
        blobs
            .write_file(STATE_DIR, "app-state.json", Bytes::from_static(b"{}"))
            .await?;
        let read = blobs.read_file(STATE_DIR, "app-state.json").await?;
        assert_eq!(read, Some(Bytes::from_static(b"{}")));
        Ok(())
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_file() -> Result<()> {
        let blobs = memory_blobs();
        blobs
            .write_file(SNAPSHOTS_DIR, "t_shard_0.arrow", Bytes::from_static(b"data"))
            .await?;
        let names: Vec<String> = blobs
            .list_files(SNAPSHOTS_DIR, None)
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["t_shard_0.arrow"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_none_and_delete_is_idempotent() -> Result<()> {
        let blobs = memory_blobs();
        assert!(blobs.read_file(CHANGELOG_DIR, "t1.jsonl").await?.is_none());
        blobs.delete_file(CHANGELOG_DIR, "t1.jsonl").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_append_accumulates_in_order() -> Result<()> {
        let blobs = memory_blobs();
        blobs
            .append_file(CHANGELOG_DIR, "t1.jsonl", Bytes::from_static(b"one\n"))
            .await?;
        blobs
            .append_file(CHANGELOG_DIR, "t1.jsonl", Bytes::from_static(b"two\n"))
            .await?;
        let read = blobs.read_file(CHANGELOG_DIR, "t1.jsonl").await?;
        assert_eq!(read, Some(Bytes::from_static(b"one\ntwo\n")));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_files_filters_by_prefix() -> Result<()> {
        let blobs = memory_blobs();
        blobs
            .write_file(SNAPSHOTS_DIR, "a_manifest.json", Bytes::from_static(b"{}"))
            .await?;
        blobs
            .write_file(SNAPSHOTS_DIR, "b_manifest.json", Bytes::from_static(b"{}"))
            .await?;
        let entries = blobs.list_files(SNAPSHOTS_DIR, Some("a_")).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a_manifest.json");
        Ok(())
    }

    #[tokio::test]
    async fn test_local_filesystem_backend() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let local = object_store::local::LocalFileSystem::new_with_prefix(dir.path())?;
        let blobs = BlobStore::new(Arc::new(local));
        blobs
            .write_file(STATE_DIR, "app-state.json", Bytes::from_static(b"{}"))
            .await?;
        assert!(blobs.read_file(STATE_DIR, "app-state.json").await?.is_some());
        Ok(())
    }
}
