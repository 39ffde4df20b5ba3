#![cfg_attr(docsrs, feature(doc_cfg))]

//! GraphQL over Server-Sent Events, both sides of the wire.
//!
//! This crate implements a streaming GraphQL transport layered on SSE for plain
//! HTTP/1.1: a server-side handler that executes queries, mutations and subscriptions
//! and emits their results as an event stream, and a client that opens such streams
//! and surfaces results per operation. Two interoperating modes are supported:
//!
//! - **Distinct connections** — one SSE stream per operation, submitted in-band via
//!   `POST` (or the query string for `EventSource`-style clients).
//! - **Single connection** — one SSE stream per client, multiplexing many operations
//!   addressed by id; submission and cancellation travel over separate HTTP requests
//!   correlated by a reserved stream token.
//!
//! GraphQL parsing, validation and execution are delegated to an
//! `async_graphql::Executor`; the transport treats execution results as opaque JSON
//! and preserves them bit-exactly.
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - HTTP: `hyper` 1.x
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use graphql_sse::{serve, handler::SseHandler};
//! use tokio::net::TcpListener;
//!
//! # async fn example(schema: async_graphql::Schema<async_graphql::EmptyMutation, async_graphql::EmptyMutation, async_graphql::EmptySubscription>) -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! serve(listener, SseHandler::new(schema)).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Key concepts
//! - [handler::SseHandler] routes transport requests and drives execution.
//! - [registry::StreamRegistry] tracks single-connection stream reservations.
//! - [client::Client] owns the subscribe/iterate API and the retry policy.
//! - [sse] and [protocol] define the wire format both engines share.
//!
//! # Feature flags
//! - `client` — the client engine (on by default)
//! - `tls` — client support for `https` endpoints (rustls)
//! - `sse-tracing` — structured tracing subscriber bootstrap

/// HTTP response body handling utilities.
pub mod body;

/// Client engine: subscribe/iterate over both transport modes.
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

/// Server engine: request routing, hooks, and execution.
pub mod handler;

/// Protocol message codec and operation request model.
pub mod protocol;

/// Stream reservations for single-connection mode.
pub mod registry;

/// HTTP server loop binding the handler to a TCP listener.
mod server;

/// Server-Sent Events framing and incremental parsing.
pub mod sse;

/// Tracing integration for observability.
#[cfg(feature = "sse-tracing")]
#[cfg_attr(docsrs, doc(cfg(feature = "sse-tracing")))]
pub mod tracing;

/// Core type definitions used throughout the crate.
pub mod types;

pub use bytes::Bytes;
pub use http::{Method, StatusCode, header};

pub use body::SseBody;
#[cfg(feature = "client")]
pub use client::{Client, ClientBuilder, ClientError, EventSink, Subscription, SubscriptionStream};
pub use handler::{Auth, ResponseOverride, SseHandler, SubscribeAction};
pub use protocol::{ExecutionResult, OperationRequest, StreamMessage, TOKEN_HEADER};

/// Starts the HTTP server with the given listener and handler.
///
/// This is the main entry point for running the transport standalone. The function
/// takes ownership of a TCP listener and a handler, then serves incoming connections
/// until the task is dropped.
///
/// # Examples
///
/// ```rust,no_run
/// use graphql_sse::{serve, handler::SseHandler};
/// use tokio::net::TcpListener;
///
/// # async fn example(schema: async_graphql::Schema<async_graphql::EmptyMutation, async_graphql::EmptyMutation, async_graphql::EmptySubscription>) -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpListener::bind("127.0.0.1:8080").await?;
/// serve(listener, SseHandler::new(schema)).await;
/// # Ok(())
/// # }
/// ```
pub use server::serve;
