//! # Storage backends
//!
//! Configuration and unification for the object storage backends.

use std::sync::Arc;

use camino::Utf8Path;
use serde::Deserialize;

pub(crate) mod memory;
#[cfg(feature = "s3")]
pub(crate) mod s3;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "s3")]
#[doc(inline)]
pub use s3::{S3Config, S3Driver};

#[doc(inline)]
pub use storage_driver::{
    Driver, Entry, Metadata, Reader, StorageError, StorageErrorKind, Writer,
};

/// Which object storage backend to build, as read from configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in process memory, with a single pre-created bucket.
    Memory {
        /// Bucket to create.
        bucket: String,
    },

    /// An S3-compatible service.
    #[cfg(feature = "s3")]
    S3(S3Config),
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory { bucket } => MemoryStorage::with_buckets(&[&bucket]).into(),
            #[cfg(feature = "s3")]
            StorageConfig::S3(config) => S3Driver::from_config(config).await.into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cheaply clonable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle bound to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }
}

/// A [`Storage`] handle bound to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket every operation targets.
    pub bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// Name of the underlying driver.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// Size and modification time of an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Stream an object into `writer`.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn download(
        &self,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        tracing::trace!(%remote, "Downloading from: {}/{remote}", self.bucket);
        self.driver.download(&self.bucket, remote, writer).await
    }

    /// Store everything `reader` yields at `remote`.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn upload(
        &self,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver.upload(&self.bucket, remote, reader).await
    }

    /// Server-side copy within the bucket.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn copy(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.driver.copy(&self.bucket, from, to).await
    }

    /// Every object, optionally only those under `prefix`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<Entry>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }

    /// Remove an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, path).await
    }
}
