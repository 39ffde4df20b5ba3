//! HTTP response body handling utilities for the event-stream transport.
//!
//! This module provides `SseBody`, a flexible wrapper around HTTP body implementations
//! that supports static content as well as the long-lived byte streams backing
//! `text/event-stream` responses. It integrates with Hyper's body system while providing
//! convenience methods for common cases like empty bodies and channel-fed streams.
//!
//! # Examples
//!
//! ```rust
//! use graphql_sse::body::SseBody;
//! use bytes::Bytes;
//! use futures_util::stream;
//!
//! // Create empty body
//! let empty = SseBody::empty();
//!
//! // Create from string
//! let text_body = SseBody::from("event: next\ndata: {}\n\n");
//!
//! // Create from stream
//! let stream_data = stream::iter(vec![
//!     Ok::<_, std::convert::Infallible>(Bytes::from("event: next\n")),
//!     Ok(Bytes::from("data: {}\n\n")),
//! ]);
//! let stream_body = SseBody::from_stream(stream_data);
//! ```

use std::{
    fmt::Debug,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;

use futures_util::{Stream, TryStreamExt};
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame, SizeHint};

use crate::types::{BoxBody, BoxError};

/// HTTP body wrapper with streaming and conversion support.
///
/// `SseBody` provides a unified interface for the two body shapes this transport
/// produces: short buffered replies (status pages, the reservation token) and unbounded
/// event streams. It wraps Hyper's body system with error mapping and boxing so every
/// server response shares one concrete type.
///
/// # Examples
///
/// ```rust
/// use graphql_sse::body::SseBody;
/// use bytes::Bytes;
///
/// // Token reply
/// let token_body = SseBody::from("a1b2c3");
///
/// // Empty 202 reply
/// let empty_body = SseBody::empty();
///
/// // Binary data
/// let binary_body = SseBody::from(Bytes::from_static(b": keep-alive\n\n"));
/// ```
pub struct SseBody(BoxBody);

impl SseBody {
    /// Creates a new body from any type implementing the `Body` trait.
    ///
    /// This method wraps the provided body implementation with error mapping and
    /// boxing for type erasure, so different body types can be stored under the
    /// unified `SseBody` interface while preserving streaming capabilities.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use graphql_sse::body::SseBody;
    /// use http_body_util::Full;
    /// use bytes::Bytes;
    ///
    /// let body = SseBody::new(Full::from(Bytes::from("ok")));
    /// let empty = SseBody::new(http_body_util::Empty::new());
    /// ```
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self(body.map_err(|e| e.into()).boxed_unsync())
    }

    /// Creates a body from a stream of byte results.
    ///
    /// Converts a stream where each item is a `Result<Bytes, E>` into a streaming
    /// body. The event-stream responses are built this way: a channel receiver wrapped
    /// into a stream feeds encoded SSE records to the connection as they are produced.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use graphql_sse::body::SseBody;
    /// use futures_util::stream;
    /// use bytes::Bytes;
    ///
    /// let chunks = vec![
    ///     Ok::<_, std::convert::Infallible>(Bytes::from("event: next\n")),
    ///     Ok(Bytes::from("data: {\"payload\":{}}\n\n")),
    /// ];
    /// let body = SseBody::from_stream(stream::iter(chunks));
    /// ```
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + Debug + 'static,
    {
        let stream = stream.map_err(Into::into).map_ok(Frame::data);
        let body = StreamBody::new(stream).boxed_unsync();
        Self(body)
    }

    /// Creates an empty body with no content.
    ///
    /// Returns a body that immediately signals end-of-stream without any data,
    /// used for `202 Accepted` and error replies that carry only a status code.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use graphql_sse::body::SseBody;
    /// use hyper::body::Body;
    ///
    /// let empty = SseBody::empty();
    /// assert!(empty.is_end_stream());
    /// ```
    pub fn empty() -> Self {
        Self::new(Empty::new())
    }
}

impl Default for SseBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<()> for SseBody {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

/// Converts a string slice into a body with UTF-8 content.
impl From<&str> for SseBody {
    fn from(buf: &str) -> Self {
        let owned = buf.to_owned();
        Self::new(http_body_util::Full::from(owned))
    }
}

/// Macro for implementing `From` conversions for various buffer types.
macro_rules! body_from_impl {
    ($ty:ty) => {
        impl From<$ty> for SseBody {
            fn from(buf: $ty) -> Self {
                Self::new(http_body_util::Full::from(buf))
            }
        }
    };
}

body_from_impl!(String);
body_from_impl!(Vec<u8>);
body_from_impl!(Bytes);

impl Body for SseBody {
    type Data = Bytes;
    type Error = BoxError;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.0.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }
}
