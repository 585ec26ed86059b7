//! Response body types for the caching stage.
//!
//! A body is either a buffer already held in memory (anything served
//! from or headed into the cache) or a stream passed through from the
//! backend. The executor reads backend bodies through
//! [`CacheBody::read_bounded`] so that responses above the configured
//! object-size cap are never fully buffered: the consumed prefix is
//! rejoined with the remaining stream and handed to the client intact.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};

use crate::error::BoxError;

/// A boxed byte stream that is both [`Send`] and [`Sync`], so that
/// [`CacheBody`] (and anything containing it) can be referenced from
/// futures that must themselves be `Send`.
type BoxStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + Sync + 'static>>;

/// A response body that is either buffered in memory or streamed
/// through from the backend.
pub enum CacheBody {
    /// Bytes already held in memory, yielded as a single frame
    Buffered {
        /// Remaining data; taken on first poll
        data: Option<Bytes>,
    },
    /// A backend body passed through without further buffering
    Streaming {
        /// The inner byte stream
        inner: BoxStream,
    },
}

impl CacheBody {
    /// Creates a buffered body from bytes.
    #[must_use]
    pub fn buffered(data: Bytes) -> Self {
        Self::Buffered { data: Some(data) }
    }

    /// Creates an empty body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Buffered { data: None }
    }

    /// Wraps a backend byte stream without buffering it.
    pub fn streaming<S>(inner: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + Sync + 'static,
    {
        Self::Streaming { inner: Box::pin(inner) }
    }

    /// Rejoins an already-consumed prefix with the remaining stream.
    ///
    /// Used when a backend body overflows the object-size cap: the
    /// client must still observe every byte, in order.
    #[must_use]
    pub fn chained(prefix: Bytes, rest: Self) -> Self {
        Self::Streaming {
            inner: Box::pin(stream::iter([Ok(prefix)]).chain(rest)),
        }
    }

    /// Whether the body is fully buffered in memory.
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        matches!(self, Self::Buffered { .. })
    }

    /// Reads the whole body into memory.
    pub async fn collect(self) -> Result<Bytes, BoxError> {
        match self {
            Self::Buffered { data } => Ok(data.unwrap_or_default()),
            Self::Streaming { mut inner } => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = inner.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Reads the body into memory up to `limit` bytes.
    ///
    /// Returns [`BoundedRead::Complete`] when the body fit, or
    /// [`BoundedRead::Overflow`] carrying the consumed prefix and the
    /// untouched remainder once the limit was exceeded.
    pub async fn read_bounded(self, limit: u64) -> Result<BoundedRead, BoxError> {
        match self {
            Self::Buffered { data } => {
                let data = data.unwrap_or_default();
                if data.len() as u64 > limit {
                    Ok(BoundedRead::Overflow { prefix: data, rest: CacheBody::empty() })
                } else {
                    Ok(BoundedRead::Complete(data))
                }
            }
            Self::Streaming { mut inner } => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = inner.next().await {
                    let chunk = chunk?;
                    buf.extend_from_slice(&chunk);
                    if buf.len() as u64 > limit {
                        return Ok(BoundedRead::Overflow {
                            prefix: buf.freeze(),
                            rest: CacheBody::Streaming { inner },
                        });
                    }
                }
                Ok(BoundedRead::Complete(buf.freeze()))
            }
        }
    }
}

/// The outcome of [`CacheBody::read_bounded`].
#[derive(Debug)]
pub enum BoundedRead {
    /// The body fit inside the limit
    Complete(Bytes),
    /// The limit was exceeded; `prefix` holds what was consumed
    Overflow {
        /// Bytes consumed before the limit tripped
        prefix: Bytes,
        /// The rest of the body, not yet consumed
        rest: CacheBody,
    },
}

impl Stream for CacheBody {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            CacheBody::Buffered { data } => Poll::Ready(data.take().map(Ok)),
            CacheBody::Streaming { inner } => inner.as_mut().poll_next(cx),
        }
    }
}

impl fmt::Debug for CacheBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered { data } => f
                .debug_struct("Buffered")
                .field("len", &data.as_ref().map_or(0, Bytes::len))
                .finish(),
            Self::Streaming { .. } => f.debug_struct("Streaming").finish_non_exhaustive(),
        }
    }
}

impl From<Bytes> for CacheBody {
    fn from(data: Bytes) -> Self {
        Self::buffered(data)
    }
}

impl From<Vec<u8>> for CacheBody {
    fn from(data: Vec<u8>) -> Self {
        Self::buffered(Bytes::from(data))
    }
}

impl From<&'static str> for CacheBody {
    fn from(data: &'static str) -> Self {
        Self::buffered(Bytes::from_static(data.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static [u8]]) -> CacheBody {
        CacheBody::streaming(stream::iter(
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect::<Vec<_>>(),
        ))
    }

    #[tokio::test]
    async fn bounded_read_completes_under_limit() {
        let body = chunks(&[b"abc", b"def"]);
        match body.read_bounded(16).await.unwrap() {
            BoundedRead::Complete(data) => assert_eq!(&data[..], b"abcdef"),
            BoundedRead::Overflow { .. } => panic!("should fit"),
        }
    }

    #[tokio::test]
    async fn bounded_read_overflow_preserves_all_bytes() {
        let body = chunks(&[b"abcd", b"efgh", b"ijkl"]);
        let (prefix, rest) = match body.read_bounded(5).await.unwrap() {
            BoundedRead::Overflow { prefix, rest } => (prefix, rest),
            BoundedRead::Complete(_) => panic!("should overflow"),
        };
        assert_eq!(&prefix[..], b"abcdefgh");
        let rejoined = CacheBody::chained(prefix, rest);
        let all = rejoined.collect().await.unwrap();
        assert_eq!(&all[..], b"abcdefghijkl");
    }

    #[tokio::test]
    async fn buffered_body_over_limit_overflows() {
        let body = CacheBody::buffered(Bytes::from_static(b"0123456789"));
        match body.read_bounded(4).await.unwrap() {
            BoundedRead::Overflow { prefix, rest } => {
                assert_eq!(&prefix[..], b"0123456789");
                assert_eq!(&rest.collect().await.unwrap()[..], b"");
            }
            BoundedRead::Complete(_) => panic!("should overflow"),
        }
    }
}
