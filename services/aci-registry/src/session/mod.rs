//! Upload sessions and the stores that persist them.
//!
//! A session tracks which of the three artifacts of a push have arrived. The
//! [`SessionStore`] trait is implemented by [`MemorySessions`] for a single
//! process and by [`DistributedSessions`] on top of a versioned key-value
//! [`Coordinator`] such as etcd.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod distributed;
#[cfg(feature = "etcd")]
mod etcd;
mod memory;

pub use distributed::{Coordinator, DistributedSessions, MemoryCoordinator, Versioned};
#[cfg(feature = "etcd")]
pub use etcd::EtcdCoordinator;
pub use memory::MemorySessions;

/// An in-flight push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Unique, non-zero session id.
    pub id: u64,

    /// Name the image will be published under.
    #[serde(rename = "imageRef")]
    pub image: String,

    /// When the session was opened.
    pub started_at: DateTime<Utc>,

    /// The manifest was received.
    pub got_manifest: bool,

    /// The detached signature was staged.
    pub got_signature: bool,

    /// The image blob was staged.
    pub got_blob: bool,

    /// Store-assigned version of this record, used for conditional updates.
    #[serde(skip)]
    pub revision: i64,
}

impl UploadSession {
    pub(crate) fn new(id: u64, image: &str) -> Self {
        Self {
            id,
            image: image.to_owned(),
            started_at: Utc::now(),
            got_manifest: false,
            got_signature: false,
            got_blob: false,
            revision: 0,
        }
    }

    /// Whether this artifact has been received.
    pub fn has(&self, artifact: Artifact) -> bool {
        match artifact {
            Artifact::Manifest => self.got_manifest,
            Artifact::Signature => self.got_signature,
            Artifact::Blob => self.got_blob,
        }
    }

    /// Record that this artifact has been received.
    pub fn mark(&mut self, artifact: Artifact) {
        match artifact {
            Artifact::Manifest => self.got_manifest = true,
            Artifact::Signature => self.got_signature = true,
            Artifact::Blob => self.got_blob = true,
        }
    }

    /// The first artifact still missing, checked in the order manifest,
    /// signature, blob.
    pub fn first_missing(&self) -> Option<Artifact> {
        Artifact::ALL.into_iter().find(|a| !self.has(*a))
    }
}

/// The three pieces of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    /// Image manifest. Only its receipt is recorded.
    Manifest,

    /// Detached signature.
    Signature,

    /// The image itself.
    Blob,
}

impl Artifact {
    /// All artifacts in completion-check order.
    pub const ALL: [Artifact; 3] = [Artifact::Manifest, Artifact::Signature, Artifact::Blob];
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Manifest => f.write_str("manifest"),
            Artifact::Signature => f.write_str("signature"),
            Artifact::Blob => f.write_str("ACI"),
        }
    }
}

/// Errors from a [`SessionStore`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A session was requested without an image name.
    #[error("image name is empty")]
    EmptyName,

    /// No session with this id.
    #[error("upload session {0} not found")]
    NotFound(u64),

    /// The record changed since it was read.
    #[error("upload session {0} was modified concurrently")]
    Conflict(u64),

    /// An update tried to change the image the session was opened for.
    #[error("upload session {0} cannot change its image")]
    ImageChanged(u64),

    /// A stored record could not be encoded or decoded.
    #[error("invalid session record: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The backing store failed.
    #[error("session backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl SessionError {
    /// Wrap a backend error.
    pub fn backend<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        SessionError::Backend(error.into())
    }
}

/// Persistence for [`UploadSession`] records.
///
/// Ids are allocated by the store: every `create` returns an id strictly
/// greater than any id it handed out before, also under concurrent callers.
#[async_trait::async_trait]
pub trait SessionStore: fmt::Debug + Send + Sync {
    /// Open a new session for `image` with every flag cleared.
    async fn create(&self, image: &str) -> Result<UploadSession, SessionError>;

    /// Fetch a session.
    async fn get(&self, id: u64) -> Result<UploadSession, SessionError>;

    /// Replace a session record.
    ///
    /// Fails with [`SessionError::Conflict`] when `session.revision` is not the
    /// revision currently stored. Returns the record with its new revision.
    async fn update(&self, session: &UploadSession) -> Result<UploadSession, SessionError>;

    /// Remove a session.
    async fn delete(&self, id: u64) -> Result<(), SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let mut session = UploadSession::new(7, "example.com/app-1.0.0-linux-amd64.aci");
        session.started_at = DateTime::from_timestamp(0, 0).unwrap();
        session.got_blob = true;
        session.revision = 42;

        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": 7,
                "imageRef": "example.com/app-1.0.0-linux-amd64.aci",
                "startedAt": "1970-01-01T00:00:00Z",
                "gotManifest": false,
                "gotSignature": false,
                "gotBlob": true,
            })
        );

        let decoded: UploadSession = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.revision, 0);
        assert_eq!(decoded.image, session.image);
    }

    #[test]
    fn manifest_is_reported_first() {
        let mut session = UploadSession::new(1, "app");
        assert_eq!(session.first_missing(), Some(Artifact::Manifest));

        session.mark(Artifact::Blob);
        session.mark(Artifact::Signature);
        assert_eq!(session.first_missing(), Some(Artifact::Manifest));

        session.mark(Artifact::Manifest);
        assert_eq!(session.first_missing(), None);
    }

    #[test]
    fn signature_before_blob() {
        let mut session = UploadSession::new(1, "app");
        session.mark(Artifact::Manifest);
        assert_eq!(session.first_missing(), Some(Artifact::Signature));
        assert_eq!(Artifact::Blob.to_string(), "ACI");
    }
}
