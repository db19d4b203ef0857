use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// What went wrong with a storage operation, independent of the backend.
///
/// Callers branch on the kind instead of inspecting messages; in particular
/// [`StorageErrorKind::NotFound`] is how "the object is absent" is reported by
/// every driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The object or bucket does not exist.
    NotFound,

    /// The backend refused the operation.
    PermissionDenied,

    /// Reading or writing data failed (disk, network, stream).
    Io,

    /// The backend service could not be reached or is overloaded.
    ServiceUnavailable,

    /// The request itself was malformed.
    InvalidRequest,

    /// Anything the driver could not classify.
    Other,
}

impl StorageErrorKind {
    /// Whether repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable | StorageErrorKind::Io
        )
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::ServiceUnavailable => write!(f, "service unavailable"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

impl From<io::ErrorKind> for StorageErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            _ => StorageErrorKind::Io,
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Only populated when `RUST_BACKTRACE` is set.
    backtrace: Backtrace,

    /// Span context at the point the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Error produced by a storage driver.
///
/// Carries the semantic [`StorageErrorKind`], the engine that failed, optional
/// bucket / path / context, the underlying error, and the backtrace and span
/// trace captured at construction.
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "memory",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such object"),
/// )
/// .bucket("registry")
/// .path("acis/example.com/app-1.0.0-linux-amd64.aci")
/// .build();
///
/// assert_eq!(error.kind(), StorageErrorKind::NotFound);
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::builder(engine, kind, error).build()
    }

    /// Create a storage error from an I/O error, deriving the kind from the I/O error kind.
    pub fn io(engine: &'static str, error: io::Error) -> Self {
        Self::new(engine, error.kind().into(), error)
    }

    /// Start building a storage error with optional bucket, path and context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// Returns a closure for `.map_err()` that wraps a downstream error.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn parse(value: &str) -> Result<u64, StorageError> {
    ///     value
    ///         .parse::<u64>()
    ///         .map_err(StorageError::with("memory", StorageErrorKind::InvalidRequest))
    /// }
    ///
    /// assert!(parse("nope").is_err());
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// The error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Shorthand for `kind() == StorageErrorKind::NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// The storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// The bucket name, if available.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// The object path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// The captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// The span trace captured when this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = &self.bucket {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for [`StorageError`], created by [`StorageError::builder`].
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`, capturing traces at this point.
    #[track_caller]
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            bucket: self.bucket,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_kind() {
        let error = StorageError::io(
            "local",
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert!(error.is_not_found());

        let error = StorageError::io("local", io::Error::other("disk on fire"));
        assert_eq!(error.kind(), StorageErrorKind::Io);
        assert!(error.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let error = StorageError::builder(
            "memory",
            StorageErrorKind::NotFound,
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        )
        .bucket("registry")
        .path("tmp/1")
        .context("download")
        .build();

        assert_eq!(
            error.to_string(),
            "Storage error [not found] from memory (bucket: registry) (path: tmp/1) (download): gone"
        );
    }
}
