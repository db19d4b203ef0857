//! S3-compatible object storage driver.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::SdkError,
    primitives::ByteStream,
    Client,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use storage_driver::{Driver, Entry, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Characters escaped in the `x-amz-copy-source` header. `/` is kept so the
/// key keeps its hierarchy.
const COPY_SOURCE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'+')
    .add(b'?')
    .add(b'<')
    .add(b'>');

/// Connection settings for an S3-compatible service.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Region, defaults to `us-east-1`.
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint, for MinIO and other S3-compatible services.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Static access key; the ambient AWS credential chain is used when unset.
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Static secret key, required together with `access_key_id`.
    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Use `endpoint/bucket/key` addressing.
    #[serde(default)]
    pub force_path_style: bool,
}

/// Storage driver backed by the AWS SDK.
#[derive(Debug, Clone)]
pub struct S3Driver {
    client: Client,
}

impl S3Driver {
    /// Wrap an already configured client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from configuration.
    #[tracing::instrument(skip(config), fields(region = ?config.region, endpoint = ?config.endpoint))]
    pub async fn from_config(config: S3Config) -> Self {
        let region = Region::new(config.region.unwrap_or_else(|| "us-east-1".to_string()));

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(region)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);

        if let (Some(key_id), Some(secret)) = (config.access_key_id, config.secret_access_key) {
            builder = builder.credentials_provider(Credentials::new(
                key_id,
                secret,
                None,
                None,
                "aci-registry-config",
            ));
        }

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Self::new(Client::from_conf(builder.build()))
    }

    fn error<E>(&self, err: SdkError<E>, bucket: &str, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let kind = match &err {
            SdkError::ServiceError(service) => match service.raw().status().as_u16() {
                404 => StorageErrorKind::NotFound,
                401 | 403 => StorageErrorKind::PermissionDenied,
                400 => StorageErrorKind::InvalidRequest,
                500..=599 => StorageErrorKind::ServiceUnavailable,
                _ => StorageErrorKind::Other,
            },
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                StorageErrorKind::ServiceUnavailable
            }
            SdkError::ResponseError(_) => StorageErrorKind::Io,
            _ => StorageErrorKind::Other,
        };

        StorageError::builder(self.name(), kind, err)
            .bucket(bucket)
            .path(key)
            .build()
    }
}

fn timestamp(value: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl Driver for S3Driver {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(remote.as_str())
            .send()
            .await
            .map_err(|err| self.error(err, bucket, remote.as_str()))?;

        Ok(Metadata {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            modified: timestamp(output.last_modified()),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(remote.as_str())
            .send()
            .await
            .map_err(|err| self.error(err, bucket, remote.as_str()))?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        // PutObject needs a known length, so the whole object is buffered first.
        let mut buf = Vec::new();
        tokio::io::copy_buf(local, &mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        tracing::trace!(%remote, size = buf.len(), "PutObject");

        self.client
            .put_object()
            .bucket(bucket)
            .key(remote.as_str())
            .content_type("application/octet-stream")
            .body(ByteStream::from(buf))
            .send()
            .await
            .map_err(|err| self.error(err, bucket, remote.as_str()))?;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(remote.as_str())
            .send()
            .await
            .map_err(|err| self.error(err, bucket, remote.as_str()))?;

        let mut body = output.body.into_async_read();
        tokio::io::copy(&mut body, local)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;
        Ok(())
    }

    async fn copy(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let source = format!(
            "{bucket}/{}",
            utf8_percent_encode(from.as_str(), COPY_SOURCE)
        );

        self.client
            .copy_object()
            .bucket(bucket)
            .key(to.as_str())
            .copy_source(source)
            .send()
            .await
            .map_err(|err| self.error(err, bucket, from.as_str()))?;
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<Entry>, StorageError> {
        let prefix = prefix.map(|p| format!("{}/", p.as_str().trim_end_matches('/')));
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket);
            if let Some(prefix) = &prefix {
                request = request.prefix(prefix);
            }
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|err| self.error(err, bucket, prefix.as_deref().unwrap_or_default()))?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                entries.push(Entry {
                    path: Utf8PathBuf::from(key),
                    metadata: Metadata {
                        size: object.size().unwrap_or(0).max(0) as u64,
                        modified: timestamp(object.last_modified()),
                    },
                });
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated() == Some(true) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        tracing::debug!("Found {} entries", entries.len());
        Ok(entries)
    }
}
