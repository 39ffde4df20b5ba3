//! HTTP server loop binding the handler to a TCP listener.
//!
//! This module provides the `serve` convenience for running an [`SseHandler`] as a
//! standalone HTTP/1.1 endpoint on top of Hyper. Each accepted connection is handled
//! in its own tokio task; every request on the connection is dispatched through the
//! handler. Long-lived event streams ride ordinary HTTP/1.1 responses with keep-alive,
//! so no upgrade machinery is involved.
//!
//! # Examples
//!
//! ```rust,no_run
//! use graphql_sse::{serve, handler::SseHandler};
//! use tokio::net::TcpListener;
//!
//! # async fn example(schema: async_graphql::Schema<async_graphql::EmptyMutation, async_graphql::EmptyMutation, async_graphql::EmptySubscription>) -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! let handler = SseHandler::new(schema);
//! serve(listener, handler).await;
//! # Ok(())
//! # }
//! ```

use async_graphql::Executor;
use hyper::{server::conn::http1, service::service_fn};
use std::convert::Infallible;
use tokio::net::TcpListener;

use crate::handler::SseHandler;
use crate::types::BoxError;

/// Starts the HTTP server with the given listener and handler.
///
/// This function enters the accept loop and serves connections until the task is
/// dropped. Each connection runs concurrently in its own tokio task.
pub async fn serve<E>(listener: TcpListener, handler: SseHandler<E>)
where
    E: Executor + Send + Sync + Clone + 'static,
{
    run(listener, handler).await.unwrap();
}

/// Runs the main server loop, accepting connections and dispatching requests.
///
/// # Errors
///
/// Returns an error if the listener fails while accepting connections.
async fn run<E>(listener: TcpListener, handler: SseHandler<E>) -> Result<(), BoxError>
where
    E: Executor + Send + Sync + Clone + 'static,
{
    tracing::info!("GraphQL SSE endpoint listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let handler = handler.clone();

        // Spawn a new task to handle each incoming connection.
        tokio::spawn(async move {
            let svc = service_fn(move |mut req: hyper::Request<_>| {
                let handler = handler.clone();
                async move {
                    req.extensions_mut().insert(addr);
                    Ok::<_, Infallible>(handler.handle(req).await)
                }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            let conn = http.serve_connection(io, svc);

            if let Err(err) = conn.await {
                tracing::debug!("error serving connection: {err}");
            }
        });
    }
}
