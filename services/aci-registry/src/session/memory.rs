use std::collections::HashMap;

use parking_lot::Mutex;

use super::{SessionError, SessionStore, UploadSession};

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<u64, UploadSession>,
    last_id: u64,
}

/// Sessions kept in process memory behind a single lock.
#[derive(Debug, Default)]
pub struct MemorySessions {
    inner: Mutex<Inner>,
}

impl MemorySessions {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Whether no sessions are open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessions {
    #[tracing::instrument(skip(self))]
    async fn create(&self, image: &str) -> Result<UploadSession, SessionError> {
        if image.is_empty() {
            return Err(SessionError::EmptyName);
        }

        let mut inner = self.inner.lock();
        inner.last_id += 1;
        let session = UploadSession::new(inner.last_id, image);
        inner.sessions.insert(session.id, session.clone());

        tracing::debug!(id = session.id, "created upload session");
        Ok(session)
    }

    async fn get(&self, id: u64) -> Result<UploadSession, SessionError> {
        self.inner
            .lock()
            .sessions
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    #[tracing::instrument(skip(self, session), fields(id = session.id))]
    async fn update(&self, session: &UploadSession) -> Result<UploadSession, SessionError> {
        let mut inner = self.inner.lock();
        let stored = inner
            .sessions
            .get_mut(&session.id)
            .ok_or(SessionError::NotFound(session.id))?;

        if stored.revision != session.revision {
            return Err(SessionError::Conflict(session.id));
        }
        if stored.image != session.image {
            return Err(SessionError::ImageChanged(session.id));
        }

        let mut updated = session.clone();
        updated.revision += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, id: u64) -> Result<(), SessionError> {
        self.inner
            .lock()
            .sessions
            .remove(&id)
            .map(|_| ())
            .ok_or(SessionError::NotFound(id))
    }
}
