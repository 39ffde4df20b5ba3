//! Shared fixtures for the transport integration tests: a small schema with a query,
//! a canned subscription and a broadcast-driven subscription the tests can feed,
//! plus helpers for spinning up a server and recording sink callbacks.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_graphql::{Context, EmptyMutation, Object, Schema, Subscription};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::BroadcastStream;

use graphql_sse::handler::SseHandler;
use graphql_sse::sse::{SseFrame, SseParser};

pub const GREETINGS: [&str; 5] = ["Hi", "Bonjour", "Hola", "Ciao", "Zdravo"];

/// Sentinel that ends every `pulses` subscription stream.
pub const PULSE_DONE: &str = "!done";

pub type Hub = tokio::sync::broadcast::Sender<String>;

pub type TestSchema = Schema<Query, EmptyMutation, SubscriptionRoot>;

pub struct Query;

#[Object]
impl Query {
    async fn hello(&self) -> &'static str {
        "world"
    }
}

pub struct SubscriptionRoot;

#[Subscription]
impl SubscriptionRoot {
    /// Five canned values, emitted as fast as the consumer drains them.
    async fn greetings(&self) -> impl Stream<Item = String> {
        futures_util::stream::iter(GREETINGS.iter().map(|g| g.to_string()))
    }

    /// Values pushed by the test through the shared [`Hub`]; ends on [`PULSE_DONE`].
    async fn pulses(&self, ctx: &Context<'_>) -> async_graphql::Result<impl Stream<Item = String>> {
        let rx = ctx.data::<Hub>()?.subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(|item| futures_util::future::ready(item.ok()))
            .take_while(|item| futures_util::future::ready(item != PULSE_DONE)))
    }

    /// A producer that yields nothing and completes immediately.
    async fn silence(&self) -> impl Stream<Item = String> {
        futures_util::stream::empty()
    }
}

pub fn test_schema() -> (TestSchema, Hub) {
    let (hub, _) = tokio::sync::broadcast::channel(64);
    let schema = Schema::build(Query, EmptyMutation, SubscriptionRoot)
        .data::<Hub>(hub.clone())
        .finish();
    (schema, hub)
}

/// Binds an ephemeral port and serves the handler on it.
pub async fn spawn_server(handler: SseHandler<TestSchema>) -> (SocketAddr, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(graphql_sse::serve(listener, handler));
    (addr, format!("http://{addr}/graphql/stream"))
}

/// Polls `cond` until it holds, panicking after a couple of seconds.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Callback log shared between a [`RecordingSink`] and the test body.
#[derive(Clone, Default)]
pub struct Recorder {
    state: Arc<Mutex<RecorderState>>,
}

#[derive(Default)]
pub struct RecorderState {
    pub next: Vec<serde_json::Value>,
    pub errors: Vec<String>,
    pub completed: bool,
}

impl Recorder {
    pub fn sink(&self) -> RecordingSink {
        RecordingSink(self.clone())
    }

    pub fn next_count(&self) -> usize {
        self.state.lock().unwrap().next.len()
    }

    pub fn nexts(&self) -> Vec<serde_json::Value> {
        self.state.lock().unwrap().next.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.state.lock().unwrap().errors.clone()
    }

    pub fn completed(&self) -> bool {
        self.state.lock().unwrap().completed
    }

    pub fn is_silent(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.next.is_empty() && state.errors.is_empty() && !state.completed
    }
}

pub struct RecordingSink(Recorder);

impl graphql_sse::EventSink for RecordingSink {
    fn next(&mut self, value: serde_json::Value) {
        self.0.state.lock().unwrap().next.push(value);
    }

    fn error(&mut self, error: graphql_sse::ClientError) {
        self.0.state.lock().unwrap().errors.push(error.to_string());
    }

    fn complete(&mut self) {
        self.0.state.lock().unwrap().completed = true;
    }
}

/// Sends one raw HTTP/1.1 request and buffers the whole response.
pub async fn raw_request(
    addr: SocketAddr,
    request: http::Request<Full<Bytes>>,
) -> (StatusCode, http::HeaderMap, Bytes) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, bytes)
}

/// Sends one raw request and reads SSE records off the response body until `stop`
/// matches one (inclusive). Panics on a non-200 response.
pub async fn raw_stream_until(
    addr: SocketAddr,
    request: http::Request<Full<Bytes>>,
    stop: impl Fn(&SseFrame) -> bool,
) -> Vec<SseFrame> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let mut parser = SseParser::new();
    let mut frames = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.unwrap();
        if let Some(data) = frame.data_ref() {
            for record in parser.feed(data) {
                let done = stop(&record);
                frames.push(record);
                if done {
                    return frames;
                }
            }
        }
    }
    frames
}
