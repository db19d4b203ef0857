use std::{fmt, ops::Deref, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::StorageError;

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for file contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Object metadata, which will be generically provided by the driver.
///
/// Only the fields every backend can report are included here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// The last time the object was written.
    pub modified: DateTime<Utc>,
}

/// A single object found while listing a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    /// Full path of the object within its bucket.
    pub path: Utf8PathBuf,

    /// Metadata reported alongside the listing.
    pub metadata: Metadata,
}

/// A storage driver, which provides the ability to interact with an object storage backend.
///
/// Paths are always relative to a bucket. Prefixes passed to [`Driver::list`] are
/// matched component-wise, so `acis` matches `acis/foo.aci` but not `acisfoo`.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Delete an object from the storage, by path.
    ///
    /// Drivers may report [`StorageErrorKind::NotFound`](crate::StorageErrorKind::NotFound)
    /// for missing objects, but are not required to.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for an object, by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Upload an object to the storage, using a reader stream to provide the contents.
    ///
    /// Any existing object at `remote` is replaced.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Download an object from storage, into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// Copy an object within a bucket.
    ///
    /// The destination only becomes visible once the copy is complete. The default
    /// implementation round-trips the contents through memory; drivers with a
    /// server-side copy should override it.
    async fn copy(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%from, %to, "Copying through memory");
        let mut buffer = Vec::new();
        self.download(bucket, from, &mut buffer).await?;
        self.upload(bucket, to, &mut buffer.as_slice()).await
    }

    /// List the objects in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<Entry>, StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, remote, writer).await
    }

    async fn copy(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.deref().copy(bucket, from, to).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<Entry>, StorageError> {
        self.deref().list(bucket, prefix).await
    }
}
