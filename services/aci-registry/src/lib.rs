//! # ACI image registry
//!
//! Accepts App Container Images over the ACI push protocol and serves a
//! catalog of what has been published.
//!
//! A push is an upload session: the client opens it, uploads the manifest,
//! the detached signature and the image as separate requests, then reports
//! completion. Only then is the image moved out of staging and made visible.
//!
//! ## Features
//!
//! - Session stores in memory or shared through etcd (`etcd` feature)
//! - Blob stores on a local directory or any `storage` backend (S3 with the
//!   `s3` feature)
//! - Catalog rebuilt from storage listings
//! - Builder pattern for the HTTP service
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use aci_registry::{MemorySessions, ObjectBlobs, RegistryBuilder, Uploads};
//! use storage::{MemoryStorage, Storage};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage: Storage = MemoryStorage::with_buckets(&["aci-repository"]).into();
//! let uploads = Uploads::new(
//!     Arc::new(MemorySessions::new()),
//!     Arc::new(ObjectBlobs::new(storage.bucket("aci-repository"))),
//! );
//!
//! let registry = RegistryBuilder::new(uploads)
//!     .server_name("aci.example.com")
//!     .build();
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
pub mod blobs;
pub mod catalog;
pub mod config;
mod error;
pub mod session;
mod upload;

pub use api::{ACI_PUSH_VERSION, RegistryBuilder};
pub use blobs::{BlobError, BlobStore, FilesystemBlobs, ObjectBlobs};
pub use catalog::{Catalog, Image, ImageVersion};
pub use error::{UploadError, UploadResult};
pub use session::{DistributedSessions, MemorySessions, SessionError, SessionStore, UploadSession};
pub use upload::{Completion, CompletionReport, Uploads};
