use thiserror::Error;

/// A boxed error for opaque transport and body-stream failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A `Result` typedef to use with the [`HttpCacheError`] type
pub type Result<T> = std::result::Result<T, HttpCacheError>;

/// The error type surfaced by the caching stage to its caller.
///
/// Storage failures never appear here: lookups degrade to misses and
/// writes degrade to uncached pass-through, logged at warning level.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpCacheError {
    /// The backend transport failed while the request was in flight
    #[error("backend transport error: {0}")]
    Transport(#[source] BoxError),
    /// Error from http
    #[error(transparent)]
    Http(#[from] http::Error),
    /// There was an error converting a header to a string
    #[error(transparent)]
    HeaderToStr(#[from] http::header::ToStrError),
    /// There was an error parsing an HTTP header value
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// There was an error parsing an HTTP header name
    #[error(transparent)]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    /// There was an error parsing the URL
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
}

impl HttpCacheError {
    /// Wraps an opaque transport failure.
    pub fn transport<E: Into<BoxError>>(err: E) -> Self {
        Self::Transport(err.into())
    }
}

/// Classifies a storage backend failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The backend could not be reached or refused the operation
    Unavailable,
    /// A stored record could not be decoded
    Corrupt,
}

/// An error raised by the storage backend or the storage façade.
///
/// Handled locally by the executor: reads degrade to cache misses,
/// writes degrade to returning the backend response uncached.
#[derive(Error, Debug)]
#[error("cache storage error ({kind:?}): {source}")]
pub struct StorageError {
    /// What went wrong
    pub kind: StorageErrorKind,
    /// The underlying backend failure
    #[source]
    pub source: BoxError,
}

impl StorageError {
    /// A backend I/O or availability failure.
    pub fn unavailable<E: Into<BoxError>>(source: E) -> Self {
        Self { kind: StorageErrorKind::Unavailable, source: source.into() }
    }

    /// A record that exists but cannot be decoded.
    pub fn corrupt<E: Into<BoxError>>(source: E) -> Self {
        Self { kind: StorageErrorKind::Corrupt, source: source.into() }
    }
}

/// A `Result` typedef for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A fatal protocol violation detected on an incoming request.
///
/// These abort the exchange before any backend call; the response is
/// synthesized by the response generator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestViolation {
    /// A request with a body carried neither `Content-Length` nor a
    /// chunked `Transfer-Encoding`
    BodyButNoLength,
    /// A weak ETag appeared in `If-Match` on a PUT or DELETE
    WeakEtagOnPutDelete,
}
