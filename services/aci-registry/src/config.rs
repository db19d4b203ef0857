//! Deployment configuration: which stores to use and how clients reach us.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use camino::Utf8PathBuf;
use serde::Deserialize;
use storage::{StorageConfig, StorageError};

use crate::api::RegistryBuilder;
use crate::blobs::{BlobError, BlobStore, FilesystemBlobs, ObjectBlobs};
use crate::session::{SessionError, SessionStore};
use crate::upload::Uploads;

/// Failure while constructing the configured stores.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The session store could not be reached or initialised.
    #[error("session store: {0}")]
    Sessions(#[from] SessionError),

    /// The blob store could not be opened.
    #[error("blob store: {0}")]
    Blobs(#[from] BlobError),

    /// The object storage backend could not be built.
    #[error("object storage: {0}")]
    Storage(#[from] StorageError),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Host name put into the URLs handed to clients.
    pub server_name: String,

    /// Hand out `https://` URLs.
    #[serde(default)]
    pub https: bool,

    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Include the server-side failure reason in completion responses.
    #[serde(default = "default_expose_server_reason")]
    pub expose_server_reason: bool,

    /// Where upload sessions are kept.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Where artifacts are kept.
    pub blobs: BlobsConfig,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_expose_server_reason() -> bool {
    true
}

/// Session store selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SessionsConfig {
    /// Keep sessions in this process.
    #[default]
    Memory,

    /// Share sessions between processes through etcd.
    #[cfg(feature = "etcd")]
    Etcd {
        /// Cluster endpoints, e.g. `http://127.0.0.1:2379`.
        endpoints: Vec<String>,

        /// Key prefix for records and the id counter.
        #[serde(default = "default_namespace")]
        namespace: String,
    },
}

#[cfg(feature = "etcd")]
fn default_namespace() -> String {
    "/acis".to_owned()
}

impl SessionsConfig {
    /// Construct the configured store.
    pub async fn build(&self) -> Result<Arc<dyn SessionStore>, ConfigError> {
        let store: Arc<dyn SessionStore> = match self {
            SessionsConfig::Memory => Arc::new(crate::session::MemorySessions::new()),
            #[cfg(feature = "etcd")]
            SessionsConfig::Etcd {
                endpoints,
                namespace,
            } => {
                let coordinator = crate::session::EtcdCoordinator::connect(endpoints).await?;
                Arc::new(crate::session::DistributedSessions::new(coordinator, namespace.as_str()).await?)
            }
        };
        Ok(store)
    }
}

/// Blob store selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BlobsConfig {
    /// A local directory.
    Filesystem {
        /// Root of the store; staged uploads go to `<directory>/tmp`.
        directory: Utf8PathBuf,

        /// Public key served at `/pubkeys.gpg`.
        #[serde(default)]
        signing_key: Option<Utf8PathBuf>,
    },

    /// A bucket on an object storage backend.
    Object {
        /// Bucket name.
        bucket: String,

        /// Backend holding the bucket.
        storage: StorageConfig,
    },
}

impl BlobsConfig {
    /// Construct the configured store.
    pub async fn build(&self) -> Result<Arc<dyn BlobStore>, ConfigError> {
        let store: Arc<dyn BlobStore> = match self {
            BlobsConfig::Filesystem {
                directory,
                signing_key,
            } => Arc::new(FilesystemBlobs::open(directory.clone(), signing_key.clone()).await?),
            BlobsConfig::Object { bucket, storage } => {
                let storage = storage.clone().build().await?;
                Arc::new(ObjectBlobs::new(storage.bucket(bucket.as_str())))
            }
        };
        Ok(store)
    }
}

impl RegistryConfig {
    /// Build both stores and wire them into an orchestrator.
    #[tracing::instrument(skip(self))]
    pub async fn uploads(&self) -> Result<Uploads, ConfigError> {
        let sessions = self.sessions.build().await?;
        let blobs = self.blobs.build().await?;
        tracing::debug!(?sessions, ?blobs, "stores ready");

        Ok(Uploads::new(sessions, blobs).expose_server_reason(self.expose_server_reason))
    }

    /// Build the full HTTP service.
    pub async fn router(&self) -> Result<Router, ConfigError> {
        let uploads = self.uploads().await?;
        Ok(RegistryBuilder::new(uploads)
            .server_name(self.server_name.as_str())
            .https(self.https)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let config: RegistryConfig = serde_json::from_value(serde_json::json!({
            "server_name": "aci.example.com",
            "blobs": { "kind": "filesystem", "directory": "/srv/acis" },
        }))
        .unwrap();

        assert_eq!(config.listen, default_listen());
        assert!(config.expose_server_reason);
        assert!(!config.https);
        assert!(matches!(config.sessions, SessionsConfig::Memory));
        assert!(matches!(
            config.blobs,
            BlobsConfig::Filesystem { signing_key: None, .. }
        ));
    }

    #[test]
    fn object_storage_config() {
        let config: RegistryConfig = serde_json::from_value(serde_json::json!({
            "server_name": "aci.example.com",
            "https": true,
            "expose_server_reason": false,
            "sessions": { "kind": "memory" },
            "blobs": {
                "kind": "object",
                "bucket": "aci-repository",
                "storage": { "memory": { "bucket": "aci-repository" } },
            },
        }))
        .unwrap();

        assert!(config.https);
        assert!(!config.expose_server_reason);
        assert!(matches!(config.blobs, BlobsConfig::Object { ref bucket, .. } if bucket == "aci-repository"));
    }

    #[tokio::test]
    async fn builds_memory_backed_registry() {
        let config: RegistryConfig = serde_json::from_value(serde_json::json!({
            "server_name": "localhost:3000",
            "blobs": {
                "kind": "object",
                "bucket": "acis",
                "storage": { "memory": { "bucket": "acis" } },
            },
        }))
        .unwrap();

        let uploads = config.uploads().await.unwrap();
        let session = uploads.open("app-1-linux-amd64.aci").await.unwrap();
        assert_eq!(session.id, 1);
        assert!(config.router().await.is_ok());
    }
}
