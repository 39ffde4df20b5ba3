//! Core type definitions and aliases used throughout the transport.
//!
//! This module provides fundamental type aliases that standardize the types used across
//! the crate for requests, responses and errors. These aliases ensure consistency and
//! make the API more ergonomic by hiding complex generic parameters. The main types
//! include `Request` and `Response` for HTTP handling on the server side.
//!
//! # Examples
//!
//! ```rust
//! use graphql_sse::types::{Request, Response};
//! use graphql_sse::body::SseBody;
//!
//! fn not_found() -> Response {
//!     let mut res = Response::new(SseBody::empty());
//!     *res.status_mut() = http::StatusCode::NOT_FOUND;
//!     res
//! }
//! ```

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;

use crate::body::SseBody;

/// HTTP request type with streaming body support.
///
/// This type alias represents an HTTP request with an `Incoming` body stream from Hyper.
/// The server engine consumes requests of this type directly, so it can be mounted on
/// any hyper-based server without extra shimming.
pub type Request = hyper::Request<Incoming>;

/// HTTP response type produced by the server engine.
///
/// Every response the engine returns, whether a short status reply or a long-lived
/// event stream, carries an [`SseBody`].
pub type Response = hyper::Response<SseBody>;

/// Boxed HTTP body type for internal response handling.
///
/// Internal type alias combining byte streams with error handling for HTTP response
/// bodies.
pub(crate) type BoxBody = UnsyncBoxBody<Bytes, BoxError>;

/// Boxed error type for thread-safe error handling.
///
/// Internal type alias for errors that can be sent across threads and support
/// dynamic dispatch.
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
