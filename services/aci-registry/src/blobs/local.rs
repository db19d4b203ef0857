use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use storage::{Reader, StorageError, StorageErrorKind, Writer};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use super::{ArtifactKind, BlobError, BlobStore, SIGNATURE_SUFFIX, STAGING, staged_name, validate_name};
use crate::catalog::{self, Catalog, RawEntry};
use crate::session::UploadSession;

const ENGINE: &str = "filesystem";

fn fs_error(action: &'static str, path: &Utf8Path) -> impl FnOnce(io::Error) -> StorageError + use<> {
    let path = path.to_owned();
    move |error: io::Error| {
        let kind = StorageErrorKind::from(error.kind());
        let report = eyre::Report::new(error).wrap_err(action);
        StorageError::builder(ENGINE, kind, report)
            .path(path.as_str())
            .build()
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

/// Blob store on a local directory.
///
/// Published images live directly under the root, staged uploads under
/// `<root>/tmp`. Publishing is a rename, so both must be on the same volume.
#[derive(Debug, Clone)]
pub struct FilesystemBlobs {
    root: Utf8PathBuf,
    signing_key: Option<Utf8PathBuf>,
}

impl FilesystemBlobs {
    /// Open the store at `root`, discarding anything left in the staging area
    /// by a previous process.
    #[tracing::instrument(skip_all)]
    pub async fn open(
        root: impl Into<Utf8PathBuf>,
        signing_key: Option<Utf8PathBuf>,
    ) -> Result<Self, BlobError> {
        let root = root.into();
        let staging = root.join(STAGING);
        if ignore_missing(tokio::fs::remove_dir_all(&staging).await)
            .map_err(fs_error("clear staging area", &staging))?
        {
            tracing::debug!(%staging, "cleared leftover staging area");
        }

        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(fs_error("create staging area", &staging))?;

        Ok(Self { root, signing_key })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn staged(&self, id: u64, kind: ArtifactKind) -> Utf8PathBuf {
        self.root.join(staged_name(id, kind))
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(fs_error("create_dir_all", parent))?;
        }

        tokio::fs::rename(from, to)
            .await
            .map_err(fs_error("rename", from))
    }
}

#[async_trait::async_trait]
impl BlobStore for FilesystemBlobs {
    fn check_name(&self, name: &str) -> Result<(), BlobError> {
        let path = validate_name(name)?;
        if path.starts_with(STAGING) {
            return Err(BlobError::InvalidName(name.to_owned()));
        }
        Ok(())
    }

    async fn signing_key(&self) -> Result<Vec<u8>, BlobError> {
        let path = self.signing_key.as_ref().ok_or(BlobError::KeyNotConfigured)?;
        let key = tokio::fs::read(path)
            .await
            .map_err(fs_error("read signing key", path))?;
        Ok(key)
    }

    #[tracing::instrument(skip(self), fields(root = %self.root))]
    async fn list_published(&self) -> Result<Catalog, BlobError> {
        let root = self.root.clone();
        let entries = tokio::task::spawn_blocking(move || collect_published(&root))
            .in_current_span()
            .await
            .map_err(|error| StorageError::new(ENGINE, StorageErrorKind::Other, error))?
            .map_err(fs_error("list", &self.root))?;

        tracing::debug!("Found {} entries", entries.len());
        Ok(catalog::build(entries))
    }

    #[tracing::instrument(skip(self, reader))]
    async fn stage(
        &self,
        id: u64,
        kind: ArtifactKind,
        reader: &mut Reader<'_>,
    ) -> Result<(), BlobError> {
        let path = self.staged(id, kind);

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&path)
                .await
                .map_err(fs_error("create staged file", &path))?,
        );

        let written = tokio::io::copy_buf(reader, &mut writer)
            .await
            .map_err(fs_error("copy", &path))?;

        writer
            .shutdown()
            .await
            .map_err(fs_error("shutdown writer", &path))?;

        tracing::trace!(%path, written, "staged");
        Ok(())
    }

    #[tracing::instrument(skip(self, session), fields(id = session.id, image = %session.image))]
    async fn publish(&self, session: &UploadSession) -> Result<(), BlobError> {
        self.check_name(&session.image)?;

        let blob = self.root.join(&session.image);
        self.rename(&self.staged(session.id, ArtifactKind::Blob), &blob)
            .await?;

        let signature = self.root.join(format!("{}{SIGNATURE_SUFFIX}", session.image));
        match self
            .rename(&self.staged(session.id, ArtifactKind::Signature), &signature)
            .await
        {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                tracing::debug!("no signature staged, publishing unsigned");
            }
            Err(error) => return Err(error.into()),
        }

        tracing::info!(path = %blob, "published");
        Ok(())
    }

    #[tracing::instrument(skip(self, session), fields(id = session.id))]
    async fn discard(&self, session: &UploadSession) -> Result<(), BlobError> {
        let mut first = None;
        for kind in [ArtifactKind::Blob, ArtifactKind::Signature] {
            let path = self.staged(session.id, kind);
            if let Err(error) = ignore_missing(tokio::fs::remove_file(&path).await)
                .map_err(fs_error("remove_file", &path))
            {
                tracing::debug!(%kind, "could not remove staged file: {error}");
                if first.is_none() {
                    first = Some(error);
                }
            }
        }
        first.map_or(Ok(()), |error| Err(error.into()))
    }

    async fn read_published(&self, name: &str, writer: &mut Writer<'_>) -> Result<(), BlobError> {
        self.check_name(name)?;
        let path = self.root.join(name);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(fs_error("open", &path))?,
        );

        tokio::io::copy_buf(&mut reader, writer)
            .await
            .map_err(fs_error("copy", &path))?;

        writer.flush().await.map_err(fs_error("flush writer", &path))?;
        Ok(())
    }
}

#[tracing::instrument]
fn collect_published(root: &Utf8Path) -> io::Result<Vec<RawEntry>> {
    let mut entries = Vec::new();
    visit(root, root, &mut entries)?;
    Ok(entries)
}

fn visit(root: &Utf8Path, path: &Utf8Path, entries: &mut Vec<RawEntry>) -> io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        let metadata = entry.metadata()?;

        let Ok(name) = entry.path().strip_prefix(root) else {
            continue;
        };

        if metadata.is_dir() {
            if name.as_str() != STAGING {
                visit(root, entry.path(), entries)?;
            }
        } else {
            let modified: DateTime<Utc> = metadata.modified()?.into();
            entries.push(RawEntry::new(name.as_str(), modified));
        }
    }

    Ok(())
}
