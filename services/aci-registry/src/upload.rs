//! The push protocol: open a session, receive its artifacts, then publish or
//! discard them on completion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use storage::{Reader, Writer};

use crate::blobs::{ArtifactKind, BlobStore};
use crate::catalog::Catalog;
use crate::error::{UploadError, UploadResult};
use crate::session::{Artifact, SessionError, SessionStore, UploadSession};

/// Times a flag update is re-applied when the record changed underneath it.
const FLAG_ATTEMPTS: usize = 8;

/// Completion signal sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompletionReport {
    /// Whether the client considers the push successful.
    pub success: bool,

    /// Client explanation when it is not.
    #[serde(default)]
    pub reason: Option<String>,
}

impl CompletionReport {
    /// The client finished uploading.
    pub fn success() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    /// The client gave up.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome of completing a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    /// Whether the image was published.
    pub success: bool,

    /// Reason shown to the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Reason as seen by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_reason: Option<String>,
}

impl Completion {
    fn published() -> Self {
        Self {
            success: true,
            reason: None,
            server_reason: None,
        }
    }

    fn failed(reason: Option<String>, server_reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason,
            server_reason: Some(server_reason.into()),
        }
    }
}

/// Drives upload sessions against a session store and a blob store.
#[derive(Debug, Clone)]
pub struct Uploads {
    sessions: Arc<dyn SessionStore>,
    blobs: Arc<dyn BlobStore>,
    expose_server_reason: bool,
}

impl Uploads {
    /// Combine a session store and a blob store.
    pub fn new(sessions: Arc<dyn SessionStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            sessions,
            blobs,
            expose_server_reason: true,
        }
    }

    /// Whether completion responses include the server-side reason.
    pub fn expose_server_reason(mut self, expose: bool) -> Self {
        self.expose_server_reason = expose;
        self
    }

    /// The session store.
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// The blob store.
    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Open a session for `image`.
    #[tracing::instrument(skip(self))]
    pub async fn open(&self, image: &str) -> UploadResult<UploadSession> {
        if image.is_empty() {
            return Err(UploadError::EmptyName);
        }
        self.blobs.check_name(image)?;

        let session = self.sessions.create(image).await?;
        tracing::info!(id = session.id, "upload started");
        Ok(session)
    }

    /// Record the manifest. Its content is read and dropped.
    #[tracing::instrument(skip(self, reader))]
    pub async fn receive_manifest(&self, id: u64, reader: &mut Reader<'_>) -> UploadResult<()> {
        let session = self.sessions.get(id).await?;

        let drained = tokio::io::copy_buf(reader, &mut tokio::io::sink()).await?;
        tracing::trace!(drained, "manifest received");

        self.mark(session, Artifact::Manifest).await?;
        Ok(())
    }

    /// Stage the detached signature.
    #[tracing::instrument(skip(self, reader))]
    pub async fn receive_signature(&self, id: u64, reader: &mut Reader<'_>) -> UploadResult<()> {
        self.receive(id, ArtifactKind::Signature, reader).await
    }

    /// Stage the image blob.
    #[tracing::instrument(skip(self, reader))]
    pub async fn receive_blob(&self, id: u64, reader: &mut Reader<'_>) -> UploadResult<()> {
        self.receive(id, ArtifactKind::Blob, reader).await
    }

    async fn receive(&self, id: u64, kind: ArtifactKind, reader: &mut Reader<'_>) -> UploadResult<()> {
        let session = self.sessions.get(id).await?;
        self.blobs.stage(id, kind, reader).await?;

        let artifact = match kind {
            ArtifactKind::Blob => Artifact::Blob,
            ArtifactKind::Signature => Artifact::Signature,
        };
        match self.mark(session.clone(), artifact).await {
            Ok(_) => Ok(()),
            Err(UploadError::NotFound(id)) => {
                // Completed or aborted while staging.
                tracing::debug!(id, %kind, "session ended while staging, discarding");
                if let Err(error) = self.blobs.discard(&session).await {
                    tracing::warn!(id, "could not discard staged artifacts: {error}");
                }
                Err(UploadError::NotFound(id))
            }
            Err(error) => Err(error),
        }
    }

    /// Set one flag, re-reading the record when a concurrent update to another
    /// flag got there first.
    async fn mark(&self, mut session: UploadSession, artifact: Artifact) -> UploadResult<UploadSession> {
        for _ in 0..FLAG_ATTEMPTS {
            if session.has(artifact) {
                return Ok(session);
            }

            session.mark(artifact);
            match self.sessions.update(&session).await {
                Ok(updated) => return Ok(updated),
                Err(SessionError::Conflict(id)) => {
                    tracing::debug!(id, %artifact, "session changed concurrently, re-reading");
                    session = self.sessions.get(id).await?;
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(SessionError::Conflict(session.id).into())
    }

    /// Finish a session: publish its artifacts, or discard them when the
    /// client reported failure or something is missing.
    ///
    /// Failures are reported in the returned [`Completion`]; an `Err` means
    /// the session could not be read at all.
    #[tracing::instrument(skip(self, report), fields(success = report.success))]
    pub async fn complete(&self, id: u64, report: CompletionReport) -> UploadResult<Completion> {
        let session = self.sessions.get(id).await?;

        if !report.success {
            let completion = self
                .abort(&session, report.reason, "client reported failure")
                .await;
            return Ok(self.redact(completion));
        }

        if let Some(missing) = session.first_missing() {
            let completion = self
                .abort(
                    &session,
                    Some(format!("{missing} wasn't uploaded")),
                    format!("incomplete upload: {missing} wasn't uploaded"),
                )
                .await;
            return Ok(self.redact(completion));
        }

        if let Err(error) = self.blobs.publish(&session).await {
            tracing::error!(image = %session.image, "publish failed, keeping session: {error}");
            return Ok(self.redact(Completion::failed(
                Some("Internal Server Error".to_owned()),
                error.to_string(),
            )));
        }

        if let Err(error) = self.sessions.delete(id).await {
            tracing::warn!("published but could not remove session record: {error}");
        }

        tracing::info!(image = %session.image, "upload complete");
        Ok(Completion::published())
    }

    async fn abort(
        &self,
        session: &UploadSession,
        reason: Option<String>,
        server_reason: impl Into<String>,
    ) -> Completion {
        let completion = Completion::failed(reason, server_reason);
        tracing::info!(
            id = session.id,
            server_reason = completion.server_reason.as_deref(),
            "upload aborted"
        );

        if let Err(error) = self.blobs.discard(session).await {
            tracing::warn!(id = session.id, "could not discard staged artifacts: {error}");
        }
        if let Err(error) = self.sessions.delete(session.id).await {
            tracing::warn!(id = session.id, "could not remove session record: {error}");
        }

        completion
    }

    fn redact(&self, mut completion: Completion) -> Completion {
        if !self.expose_server_reason {
            completion.server_reason = None;
        }
        completion
    }

    /// Catalog of published images.
    pub async fn catalog(&self) -> UploadResult<Catalog> {
        Ok(self.blobs.list_published().await?)
    }

    /// The deployment's signing key.
    pub async fn signing_key(&self) -> UploadResult<Vec<u8>> {
        Ok(self.blobs.signing_key().await?)
    }

    /// Stream a published artifact.
    pub async fn read_published(&self, name: &str, writer: &mut Writer<'_>) -> UploadResult<()> {
        Ok(self.blobs.read_published(name, writer).await?)
    }
}
