//! Storage for image blobs and their detached signatures.
//!
//! Uploads are staged per session under `tmp/<id>` (blob) and `tmp/<id>.asc`
//! (signature) and moved into the published namespace when the session
//! completes.

use std::fmt;

use camino::{Utf8Component, Utf8Path};
use storage::{Reader, StorageError, Writer};

use crate::catalog::Catalog;
use crate::session::UploadSession;

mod local;
mod object;

pub use local::FilesystemBlobs;
pub use object::ObjectBlobs;

pub(crate) const STAGING: &str = "tmp";
pub(crate) const SIGNATURE_SUFFIX: &str = ".asc";

/// Which staged file an upload is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// The image itself.
    Blob,

    /// Its detached signature.
    Signature,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Blob => f.write_str("blob"),
            ArtifactKind::Signature => f.write_str("signature"),
        }
    }
}

/// Name of the staged file for a session, relative to the store root.
pub(crate) fn staged_name(id: u64, kind: ArtifactKind) -> String {
    match kind {
        ArtifactKind::Blob => format!("{STAGING}/{id}"),
        ArtifactKind::Signature => format!("{STAGING}/{id}{SIGNATURE_SUFFIX}"),
    }
}

/// Errors from a [`BlobStore`].
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// This deployment has no signing key.
    #[error("no signing key is configured")]
    KeyNotConfigured,

    /// The artifact name cannot be stored safely.
    #[error("invalid artifact name: {0:?}")]
    InvalidName(String),

    /// The backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BlobError {
    /// Whether the underlying object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::Storage(error) if error.is_not_found())
    }
}

/// Check that `name` is a relative path made only of normal components.
pub fn validate_name(name: &str) -> Result<&Utf8Path, BlobError> {
    let path = Utf8Path::new(name);
    let normal = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)));

    if normal {
        Ok(path)
    } else {
        Err(BlobError::InvalidName(name.to_owned()))
    }
}

/// Staging and publication of artifacts.
#[async_trait::async_trait]
pub trait BlobStore: fmt::Debug + Send + Sync {
    /// Reject image names this store cannot publish under.
    fn check_name(&self, name: &str) -> Result<(), BlobError> {
        validate_name(name).map(|_| ())
    }

    /// The public key clients use to verify signatures.
    async fn signing_key(&self) -> Result<Vec<u8>, BlobError>;

    /// Catalog of everything published.
    async fn list_published(&self) -> Result<Catalog, BlobError>;

    /// Write an artifact into the staging area, replacing anything staged
    /// before for the same session and kind.
    async fn stage(
        &self,
        id: u64,
        kind: ArtifactKind,
        reader: &mut Reader<'_>,
    ) -> Result<(), BlobError>;

    /// Move the staged blob to `session.image` and the staged signature, if
    /// there is one, next to it.
    async fn publish(&self, session: &UploadSession) -> Result<(), BlobError>;

    /// Remove whatever was staged for the session.
    async fn discard(&self, session: &UploadSession) -> Result<(), BlobError>;

    /// Stream a published artifact or signature.
    async fn read_published(&self, name: &str, writer: &mut Writer<'_>) -> Result<(), BlobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_names() {
        assert_eq!(staged_name(12, ArtifactKind::Blob), "tmp/12");
        assert_eq!(staged_name(12, ArtifactKind::Signature), "tmp/12.asc");
    }

    #[test]
    fn names_must_stay_inside_the_store() {
        assert!(validate_name("example.com/app-1.0.0-linux-amd64.aci").is_ok());
        assert!(validate_name("app-1.0.0-linux-amd64.aci.asc").is_ok());

        for name in ["", "/etc/passwd", "../app.aci", "a/../../b.aci", "./app.aci"] {
            assert!(
                matches!(validate_name(name), Err(BlobError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }
}
