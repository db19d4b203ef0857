use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{Driver, Entry, Metadata, Reader, StorageError, StorageErrorKind, Writer};

#[derive(Debug, Clone)]
struct MemoryFileItem {
    modified: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            modified: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            modified: value.modified,
            size: value.data.len() as u64,
        }
    }
}

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

/// Storage driver that keeps objects in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.insert(bucket, HashMap::new());
    }

    fn missing_bucket(&self, bucket: &str) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Bucket not found: {bucket}"),
            ),
        )
        .bucket(bucket)
        .context("bucket not found")
        .build()
    }

    fn missing_path(&self, bucket: &str, remote: &Utf8Path) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Path not found: {remote}"),
            ),
        )
        .bucket(bucket)
        .path(remote.as_str())
        .context("path not found")
        .build()
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        Ok(bucket_map
            .get(remote)
            .ok_or_else(|| self.missing_path(bucket, remote))?
            .into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        bucket_map
            .remove(remote)
            .ok_or_else(|| self.missing_path(bucket, remote))?;

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy_buf(local, &mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        // Clone out of the map so the lock is not held while the writer is driven.
        let item = {
            let buckets = self.buckets.read().await;
            buckets
                .get(bucket)
                .ok_or_else(|| self.missing_bucket(bucket))?
                .get(remote)
                .ok_or_else(|| self.missing_path(bucket, remote))?
                .clone()
        };

        local
            .write_all(item.as_ref())
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        Ok(())
    }

    async fn copy(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        let data = bucket_map
            .get(from)
            .ok_or_else(|| self.missing_path(bucket, from))?
            .data
            .clone();
        bucket_map.insert(to.to_owned(), data.into());
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<Entry>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;

        Ok(bucket_map
            .iter()
            .filter(|(path, _)| prefix.map_or(true, |prefix| path.starts_with(prefix)))
            .map(|(path, item)| Entry {
                path: path.clone(),
                metadata: item.into(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put(storage: &MemoryStorage, path: &str, data: &[u8]) {
        let mut reader = data;
        storage
            .upload("test", Utf8Path::new(path), &mut reader)
            .await
            .unwrap();
    }

    async fn get(storage: &MemoryStorage, path: &str) -> Vec<u8> {
        let mut data = Vec::new();
        storage
            .download("test", Utf8Path::new(path), &mut data)
            .await
            .unwrap();
        data
    }

    #[tokio::test]
    async fn upload_then_download() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        put(&storage, "tmp/1", b"hello").await;

        assert_eq!(get(&storage, "tmp/1").await, b"hello");

        let metadata = storage
            .metadata("test", Utf8Path::new("tmp/1"))
            .await
            .unwrap();
        assert_eq!(metadata.size, 5);
    }

    #[tokio::test]
    async fn copy_leaves_source_in_place() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        put(&storage, "tmp/1", b"blob").await;

        storage
            .copy("test", Utf8Path::new("tmp/1"), Utf8Path::new("acis/a.aci"))
            .await
            .unwrap();

        assert_eq!(get(&storage, "tmp/1").await, b"blob");
        assert_eq!(get(&storage, "acis/a.aci").await, b"blob");
    }

    #[tokio::test]
    async fn copy_missing_source_is_not_found() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let err = storage
            .copy("test", Utf8Path::new("tmp/9"), Utf8Path::new("acis/a.aci"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let err = storage
            .delete("test", Utf8Path::new("tmp/1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_component_prefix() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        put(&storage, "acis/a.aci", b"a").await;
        put(&storage, "acis/example.com/b.aci", b"b").await;
        put(&storage, "acisfoo", b"c").await;
        put(&storage, "tmp/1", b"d").await;

        let mut paths = storage
            .list("test", Some(Utf8Path::new("acis")))
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.path.into_string())
            .collect::<Vec<_>>();
        paths.sort();

        assert_eq!(paths, vec!["acis/a.aci", "acis/example.com/b.aci"]);
        assert_eq!(storage.list("test", None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn missing_bucket() {
        let storage = MemoryStorage::new();
        let err = storage.list("nope", None).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.bucket(), Some("nope"));
    }
}
