use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use super::{SessionError, SessionStore, UploadSession};

/// A value together with the store revision at which it was last written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Raw stored bytes.
    pub value: Vec<u8>,

    /// Revision of the last write to this key.
    pub revision: i64,
}

/// A key-value store with per-key conditional writes.
///
/// Revisions are assigned by the store and are always positive.
#[async_trait::async_trait]
pub trait Coordinator: fmt::Debug + Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<Versioned>, SessionError>;

    /// Write `value` only if `key` does not exist. Returns the new revision, or
    /// `None` when the key was already present.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<Option<i64>, SessionError>;

    /// Write `value` only if `key` is still at `revision`. Returns the new
    /// revision, or `None` when the key is missing or has moved on.
    async fn compare_and_swap(
        &self,
        key: &str,
        revision: i64,
        value: Vec<u8>,
    ) -> Result<Option<i64>, SessionError>;

    /// Delete `key` only if it is still at `revision`.
    async fn compare_and_delete(&self, key: &str, revision: i64) -> Result<bool, SessionError>;
}

#[derive(Debug, Default)]
struct MemoryKeys {
    keys: HashMap<String, Versioned>,
    revision: i64,
}

/// In-process [`Coordinator`] with a store-wide revision counter.
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    inner: Mutex<MemoryKeys>,
}

impl MemoryCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryKeys {
    fn put(&mut self, key: &str, value: Vec<u8>) -> i64 {
        self.revision += 1;
        let revision = self.revision;
        self.keys
            .insert(key.to_owned(), Versioned { value, revision });
        revision
    }

    fn at(&self, key: &str, revision: i64) -> bool {
        self.keys
            .get(key)
            .is_some_and(|current| current.revision == revision)
    }
}

#[async_trait::async_trait]
impl Coordinator for MemoryCoordinator {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, SessionError> {
        Ok(self.inner.lock().keys.get(key).cloned())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<Option<i64>, SessionError> {
        let mut inner = self.inner.lock();
        if inner.keys.contains_key(key) {
            return Ok(None);
        }
        Ok(Some(inner.put(key, value)))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        revision: i64,
        value: Vec<u8>,
    ) -> Result<Option<i64>, SessionError> {
        let mut inner = self.inner.lock();
        if !inner.at(key, revision) {
            return Ok(None);
        }
        Ok(Some(inner.put(key, value)))
    }

    async fn compare_and_delete(&self, key: &str, revision: i64) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock();
        if !inner.at(key, revision) {
            return Ok(false);
        }
        inner.keys.remove(key);
        Ok(true)
    }
}

/// Sessions stored as JSON records in a shared [`Coordinator`].
///
/// Records live at `<namespace>/<id>` and the id counter at
/// `<namespace>/counter`. Every write is conditional on the revision the
/// caller last saw, so several registry processes can share one namespace.
#[derive(Debug)]
pub struct DistributedSessions<C> {
    coordinator: C,
    namespace: String,
}

impl<C: Coordinator> DistributedSessions<C> {
    /// Attach to `namespace`, creating the id counter if it does not exist yet.
    #[tracing::instrument(skip(coordinator, namespace))]
    pub async fn new(coordinator: C, namespace: impl Into<String>) -> Result<Self, SessionError> {
        let namespace = namespace.into().trim_end_matches('/').to_owned();
        let sessions = Self {
            coordinator,
            namespace,
        };

        let counter = sessions.counter_key();
        if sessions
            .coordinator
            .create(&counter, b"0".to_vec())
            .await?
            .is_some()
        {
            tracing::info!(%counter, "initialised session counter");
        }

        Ok(sessions)
    }

    /// The underlying coordinator.
    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    fn counter_key(&self) -> String {
        format!("{}/counter", self.namespace)
    }

    fn session_key(&self, id: u64) -> String {
        format!("{}/{}", self.namespace, id)
    }

    async fn next_id(&self) -> Result<u64, SessionError> {
        let key = self.counter_key();
        loop {
            let Some(current) = self.coordinator.get(&key).await? else {
                self.coordinator.create(&key, b"0".to_vec()).await?;
                continue;
            };

            let last: u64 = std::str::from_utf8(&current.value)
                .ok()
                .and_then(|value| value.trim().parse().ok())
                .ok_or_else(|| SessionError::backend(format!("counter at {key} is not a number")))?;

            let next = last
                .checked_add(1)
                .ok_or_else(|| SessionError::backend(format!("counter at {key} is exhausted")))?;
            if self
                .coordinator
                .compare_and_swap(&key, current.revision, next.to_string().into_bytes())
                .await?
                .is_some()
            {
                return Ok(next);
            }

            tracing::trace!(%key, "counter moved, retrying");
            tokio::task::yield_now().await;
        }
    }

    fn decode(&self, stored: Versioned) -> Result<UploadSession, SessionError> {
        let mut session: UploadSession = serde_json::from_slice(&stored.value)?;
        session.revision = stored.revision;
        Ok(session)
    }
}

#[async_trait::async_trait]
impl<C: Coordinator> SessionStore for DistributedSessions<C> {
    #[tracing::instrument(skip(self))]
    async fn create(&self, image: &str) -> Result<UploadSession, SessionError> {
        if image.is_empty() {
            return Err(SessionError::EmptyName);
        }

        let id = self.next_id().await?;
        let mut session = UploadSession::new(id, image);
        let key = self.session_key(id);

        session.revision = self
            .coordinator
            .create(&key, serde_json::to_vec(&session)?)
            .await?
            .ok_or_else(|| SessionError::backend(format!("session record {key} already exists")))?;

        tracing::debug!(id, "created upload session");
        Ok(session)
    }

    async fn get(&self, id: u64) -> Result<UploadSession, SessionError> {
        let stored = self
            .coordinator
            .get(&self.session_key(id))
            .await?
            .ok_or(SessionError::NotFound(id))?;
        self.decode(stored)
    }

    #[tracing::instrument(skip(self, session), fields(id = session.id))]
    async fn update(&self, session: &UploadSession) -> Result<UploadSession, SessionError> {
        let key = self.session_key(session.id);
        let current = self
            .coordinator
            .get(&key)
            .await?
            .ok_or(SessionError::NotFound(session.id))?;
        if current.revision != session.revision {
            return Err(SessionError::Conflict(session.id));
        }
        if self.decode(current)?.image != session.image {
            return Err(SessionError::ImageChanged(session.id));
        }

        let value = serde_json::to_vec(session)?;
        if let Some(revision) = self
            .coordinator
            .compare_and_swap(&key, session.revision, value)
            .await?
        {
            return Ok(UploadSession {
                revision,
                ..session.clone()
            });
        }

        match self.coordinator.get(&key).await? {
            Some(_) => Err(SessionError::Conflict(session.id)),
            None => Err(SessionError::NotFound(session.id)),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, id: u64) -> Result<(), SessionError> {
        let key = self.session_key(id);
        loop {
            let current = self
                .coordinator
                .get(&key)
                .await?
                .ok_or(SessionError::NotFound(id))?;

            if self
                .coordinator
                .compare_and_delete(&key, current.revision)
                .await?
            {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn store() -> DistributedSessions<MemoryCoordinator> {
        DistributedSessions::new(MemoryCoordinator::new(), "/acis/")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn counter_is_initialised() {
        let sessions = store().await;
        let counter = sessions.coordinator().get("/acis/counter").await.unwrap();
        assert_eq!(counter.unwrap().value, b"0");
    }

    #[tokio::test]
    async fn existing_counter_is_kept() {
        let coordinator = MemoryCoordinator::new();
        coordinator
            .create("/acis/counter", b"41".to_vec())
            .await
            .unwrap();

        let sessions = DistributedSessions::new(coordinator, "/acis").await.unwrap();
        let session = sessions.create("app").await.unwrap();
        assert_eq!(session.id, 42);
    }

    #[tokio::test]
    async fn records_are_json_under_namespace() {
        let sessions = store().await;
        let session = sessions.create("example.com/app").await.unwrap();

        let stored = sessions
            .coordinator()
            .get(&format!("/acis/{}", session.id))
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&stored.value).unwrap();
        assert_eq!(value["imageRef"], "example.com/app");
        assert_eq!(value["gotBlob"], false);
        assert_eq!(stored.revision, session.revision);
    }

    #[tokio::test]
    async fn update_tracks_revision() {
        let sessions = store().await;
        let mut session = sessions.create("app").await.unwrap();

        session.got_manifest = true;
        let updated = sessions.update(&session).await.unwrap();
        assert!(updated.revision > session.revision);

        session.got_blob = true;
        assert!(matches!(
            sessions.update(&session).await,
            Err(SessionError::Conflict(_))
        ));

        let fetched = sessions.get(session.id).await.unwrap();
        assert!(fetched.got_manifest);
        assert!(!fetched.got_blob);
        assert_eq!(fetched.revision, updated.revision);
    }

    #[tokio::test]
    async fn update_after_delete_is_not_found() {
        let sessions = store().await;
        let session = sessions.create("app").await.unwrap();
        sessions.delete(session.id).await.unwrap();

        assert!(matches!(
            sessions.update(&session).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            sessions.delete(session.id).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_counter_is_a_backend_error() {
        let coordinator = MemoryCoordinator::new();
        coordinator
            .create("/acis/counter", b"many".to_vec())
            .await
            .unwrap();

        let sessions = DistributedSessions::new(coordinator, "/acis").await.unwrap();
        assert!(matches!(
            sessions.create("app").await,
            Err(SessionError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn exhausted_counter_is_a_backend_error() {
        let coordinator = MemoryCoordinator::new();
        coordinator
            .create("/acis/counter", u64::MAX.to_string().into_bytes())
            .await
            .unwrap();

        let sessions = DistributedSessions::new(coordinator, "/acis").await.unwrap();
        assert!(matches!(
            sessions.create("app").await,
            Err(SessionError::Backend(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_get_distinct_ids() {
        let sessions = Arc::new(store().await);

        let mut tasks = Vec::new();
        for n in 0..32 {
            let sessions = sessions.clone();
            tasks.push(tokio::spawn(async move {
                sessions.create(&format!("app-{n}")).await.unwrap().id
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(ids, (1..=32).collect::<Vec<u64>>());
    }
}
