use camino::{Utf8Path, Utf8PathBuf};
use storage::{Reader, StorageBucket, StorageError, Writer};

use super::{ArtifactKind, BlobError, BlobStore, SIGNATURE_SUFFIX, staged_name};
use crate::catalog::{self, Catalog, RawEntry};
use crate::session::UploadSession;

const PUBLISHED: &str = "acis";
const SIGNING_KEY: &str = "keys/key.pub";

/// Blob store on an object storage bucket.
///
/// Published images are kept under `acis/`, staged uploads under `tmp/`, and
/// the signing key at `keys/key.pub`. Publishing copies the staged objects and
/// then deletes them; a failure in between leaves an orphaned staged object,
/// never a partially written published one.
#[derive(Debug, Clone)]
pub struct ObjectBlobs {
    bucket: StorageBucket,
}

impl ObjectBlobs {
    /// Use `bucket` for every artifact.
    pub fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    fn published(name: &str) -> Utf8PathBuf {
        Utf8Path::new(PUBLISHED).join(name)
    }

    fn staged(id: u64, kind: ArtifactKind) -> Utf8PathBuf {
        Utf8PathBuf::from(staged_name(id, kind))
    }

    async fn remove_staged(&self, id: u64, kind: ArtifactKind) -> Result<(), StorageError> {
        match self.bucket.delete(&Self::staged(id, kind)).await {
            Err(error) if error.is_not_found() => Ok(()),
            result => result,
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for ObjectBlobs {
    async fn signing_key(&self) -> Result<Vec<u8>, BlobError> {
        let mut key = Vec::new();
        match self.bucket.download(Utf8Path::new(SIGNING_KEY), &mut key).await {
            Ok(()) => Ok(key),
            Err(error) if error.is_not_found() => Err(BlobError::KeyNotConfigured),
            Err(error) => Err(error.into()),
        }
    }

    #[tracing::instrument(skip(self), fields(bucket = %self.bucket.bucket))]
    async fn list_published(&self) -> Result<Catalog, BlobError> {
        let prefix = Utf8Path::new(PUBLISHED);
        let entries = self.bucket.list(Some(prefix)).await?;

        Ok(catalog::build(entries.into_iter().filter_map(|entry| {
            let name = entry.path.strip_prefix(prefix).ok()?;
            Some(RawEntry::new(name.as_str(), entry.metadata.modified))
        })))
    }

    #[tracing::instrument(skip(self, reader))]
    async fn stage(
        &self,
        id: u64,
        kind: ArtifactKind,
        reader: &mut Reader<'_>,
    ) -> Result<(), BlobError> {
        self.bucket.upload(&Self::staged(id, kind), reader).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, session), fields(id = session.id, image = %session.image))]
    async fn publish(&self, session: &UploadSession) -> Result<(), BlobError> {
        self.check_name(&session.image)?;

        self.bucket
            .copy(
                &Self::staged(session.id, ArtifactKind::Blob),
                &Self::published(&session.image),
            )
            .await?;

        let signature = format!("{}{SIGNATURE_SUFFIX}", session.image);
        match self
            .bucket
            .copy(
                &Self::staged(session.id, ArtifactKind::Signature),
                &Self::published(&signature),
            )
            .await
        {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                tracing::debug!("no signature staged, publishing unsigned");
            }
            Err(error) => return Err(error.into()),
        }

        for kind in [ArtifactKind::Blob, ArtifactKind::Signature] {
            if let Err(error) = self.remove_staged(session.id, kind).await {
                tracing::warn!(%kind, "leaving staged object behind: {error}");
            }
        }

        tracing::info!(image = %session.image, "published");
        Ok(())
    }

    #[tracing::instrument(skip(self, session), fields(id = session.id))]
    async fn discard(&self, session: &UploadSession) -> Result<(), BlobError> {
        let blob = self.remove_staged(session.id, ArtifactKind::Blob).await;
        let signature = self
            .remove_staged(session.id, ArtifactKind::Signature)
            .await;
        blob.and(signature)?;
        Ok(())
    }

    async fn read_published(&self, name: &str, writer: &mut Writer<'_>) -> Result<(), BlobError> {
        self.check_name(name)?;
        self.bucket
            .download(&Self::published(name), writer)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use storage::{Driver, MemoryStorage, Storage};

    use super::*;

    fn store() -> (StorageBucket, ObjectBlobs) {
        let storage: Storage = MemoryStorage::with_buckets(&["aci-repository"]).into();
        let bucket = storage.bucket("aci-repository");
        (bucket.clone(), ObjectBlobs::new(bucket))
    }

    async fn put(bucket: &StorageBucket, path: &str, data: &[u8]) {
        let mut reader = data;
        bucket.upload(Utf8Path::new(path), &mut reader).await.unwrap();
    }

    async fn exists(bucket: &StorageBucket, path: &str) -> bool {
        bucket.metadata(Utf8Path::new(path)).await.is_ok()
    }

    #[tokio::test]
    async fn publish_copies_then_removes_staged() {
        let (bucket, blobs) = store();
        let session = UploadSession::new(4, "example.com/app-1.0.0-linux-amd64.aci");

        let mut image: &[u8] = b"image";
        blobs.stage(4, ArtifactKind::Blob, &mut image).await.unwrap();
        let mut signature: &[u8] = b"signature";
        blobs
            .stage(4, ArtifactKind::Signature, &mut signature)
            .await
            .unwrap();

        blobs.publish(&session).await.unwrap();

        assert!(exists(&bucket, "acis/example.com/app-1.0.0-linux-amd64.aci").await);
        assert!(exists(&bucket, "acis/example.com/app-1.0.0-linux-amd64.aci.asc").await);
        assert!(!exists(&bucket, "tmp/4").await);
        assert!(!exists(&bucket, "tmp/4.asc").await);

        let mut out = Vec::new();
        blobs
            .read_published("example.com/app-1.0.0-linux-amd64.aci", &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"image");

        let catalog = blobs.list_published().await.unwrap();
        assert_eq!(catalog[0].name, "example.com/app");
        assert!(catalog[0].versions[0].signed);
    }

    #[tokio::test]
    async fn publish_without_signature() {
        let (bucket, blobs) = store();
        let session = UploadSession::new(1, "app-1-linux-amd64.aci");
        put(&bucket, "tmp/1", b"image").await;

        blobs.publish(&session).await.unwrap();
        assert!(exists(&bucket, "acis/app-1-linux-amd64.aci").await);
        assert!(!exists(&bucket, "acis/app-1-linux-amd64.aci.asc").await);
    }

    #[tokio::test]
    async fn publish_without_blob_is_not_found() {
        let (_, blobs) = store();
        let session = UploadSession::new(1, "app-1-linux-amd64.aci");
        assert!(blobs.publish(&session).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn discard_tolerates_missing_objects() {
        let (bucket, blobs) = store();
        let session = UploadSession::new(2, "app-1-linux-amd64.aci");
        put(&bucket, "tmp/2.asc", b"signature").await;

        blobs.discard(&session).await.unwrap();
        assert!(!exists(&bucket, "tmp/2.asc").await);
    }

    #[tokio::test]
    async fn listing_only_covers_published() {
        let (bucket, blobs) = store();
        put(&bucket, "tmp/1", b"staged").await;
        put(&bucket, "keys/key.pub", b"key").await;
        put(&bucket, "acis/bar-latest-linux-amd64.aci", b"a").await;
        put(&bucket, "acis/bar-latest-linux-amd64.aci.asc", b"s").await;
        put(&bucket, "acis/bar-0.0.4-linux-amd64.aci", b"b").await;
        put(&bucket, "acis/fuz-wrong", b"c").await;

        let catalog = blobs.list_published().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "bar");
        let latest = catalog[0]
            .versions
            .iter()
            .find(|v| v.version == "latest")
            .unwrap();
        assert!(latest.signed);
    }

    #[tokio::test]
    async fn signing_key() {
        let (bucket, blobs) = store();
        assert!(matches!(
            blobs.signing_key().await,
            Err(BlobError::KeyNotConfigured)
        ));

        put(&bucket, "keys/key.pub", b"public key").await;
        assert_eq!(blobs.signing_key().await.unwrap(), b"public key");
    }

    /// Refuses to delete one key, passing everything else through.
    #[derive(Debug)]
    struct StickyKey {
        inner: MemoryStorage,
        key: &'static str,
    }

    #[async_trait::async_trait]
    impl Driver for StickyKey {
        fn name(&self) -> &'static str {
            "sticky"
        }

        async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
            if remote.as_str() == self.key {
                return Err(StorageError::new(
                    "sticky",
                    storage::StorageErrorKind::PermissionDenied,
                    "delete refused",
                ));
            }
            self.inner.delete(bucket, remote).await
        }

        async fn metadata(
            &self,
            bucket: &str,
            remote: &Utf8Path,
        ) -> Result<storage::Metadata, StorageError> {
            self.inner.metadata(bucket, remote).await
        }

        async fn upload(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            reader: &mut Reader<'_>,
        ) -> Result<(), StorageError> {
            self.inner.upload(bucket, remote, reader).await
        }

        async fn download(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            writer: &mut Writer<'_>,
        ) -> Result<(), StorageError> {
            self.inner.download(bucket, remote, writer).await
        }

        async fn copy(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
            self.inner.copy(bucket, from, to).await
        }

        async fn list(
            &self,
            bucket: &str,
            prefix: Option<&Utf8Path>,
        ) -> Result<Vec<storage::Entry>, StorageError> {
            self.inner.list(bucket, prefix).await
        }
    }

    #[tokio::test]
    async fn discard_removes_signature_when_blob_removal_fails() {
        let storage = Storage::new(StickyKey {
            inner: MemoryStorage::with_buckets(&["aci-repository"]),
            key: "tmp/7",
        });
        let bucket = storage.bucket("aci-repository");
        let blobs = ObjectBlobs::new(bucket.clone());

        put(&bucket, "tmp/7", b"image").await;
        put(&bucket, "tmp/7.asc", b"signature").await;

        let session = UploadSession::new(7, "app-1-linux-amd64.aci");
        assert!(blobs.discard(&session).await.is_err());
        assert!(exists(&bucket, "tmp/7").await);
        assert!(!exists(&bucket, "tmp/7.asc").await);
    }
}
