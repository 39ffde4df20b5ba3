//! GraphQL over SSE client: subscribe/iterate API over both transport modes.
//!
//! The client owns its HTTP transport (hyper `client::conn` over TCP, TLS behind the
//! `tls` feature) and surfaces operation results through three-callback sinks or an
//! async stream adapter. In distinct-connections mode every operation is a single
//! `POST` whose response body is the event stream. In single-connection mode the
//! client reserves a multiplexed stream (`PUT`), attaches to it (`GET`), submits
//! operations over separate `POST`s correlated by the stream token, and cancels them
//! with `DELETE`. Transport failures are retried with exponential backoff; GraphQL
//! errors delivered inside results never trigger a retry.
//!
//! # Examples
//!
//! ```rust,no_run
//! use graphql_sse::client::Client;
//! use graphql_sse::protocol::OperationRequest;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder("http://localhost:8080/graphql/stream").build()?;
//! let mut results = client.iterate(OperationRequest::new("subscription { greetings }"));
//! while let Some(result) = results.next().await {
//!     println!("{}", result?);
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, doc(cfg(feature = "client")))]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::Stream;
use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::protocol::{
    ExecutionResult, OperationRequest, ProtocolError, StreamMessage, TOKEN_HEADER,
};
use crate::sse::{SseFrame, SseParser};

/// Errors surfaced by the client engine.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The endpoint URL could not be parsed or uses an unsupported scheme.
    #[error("invalid endpoint url: {0}")]
    Url(String),
    /// TCP (or TLS) connection establishment failed.
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    /// The HTTP exchange failed below the protocol layer.
    #[error("http transport failed: {0}")]
    Http(#[from] hyper::Error),
    /// The server answered with an unexpected status code.
    #[error("unexpected response status {status}")]
    Status { status: StatusCode, body: String },
    /// The event stream carried records the protocol codec rejects.
    #[error("malformed event stream: {0}")]
    Protocol(#[from] ProtocolError),
    /// The event stream ended before the operation completed.
    #[error("event stream ended before the operation completed")]
    UnexpectedEof,
    /// Operation serialization failed.
    #[error("failed to encode operation: {0}")]
    Encode(#[from] serde_json::Error),
    /// Every allowed handshake attempt failed.
    #[error("retries exhausted after {attempts} handshake attempts")]
    RetriesExhausted { attempts: u32 },
    /// The owning client was disposed.
    #[error("client disposed")]
    Disposed,
    /// Summary of a connection failure fanned out to multiple sinks.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The endpoint is `https` but the `tls` feature is not enabled.
    #[error("https endpoints require the `tls` feature")]
    TlsUnavailable,
    /// Request construction failed.
    #[error("request build failed: {0}")]
    Request(#[from] http::Error),
}

/// Whether an error is transport-level and worth another handshake attempt.
fn retryable(err: &ClientError) -> bool {
    match err {
        ClientError::Connect(_)
        | ClientError::Http(_)
        | ClientError::Protocol(_)
        | ClientError::UnexpectedEof => true,
        ClientError::Status { status, .. } => status.is_server_error(),
        _ => false,
    }
}

/// Rebuilds an error for delivery to another sink.
///
/// Most transport error sources are not clonable; sinks past the first receive a
/// summary carrying the same message.
fn replicate(err: &ClientError) -> ClientError {
    match err {
        ClientError::Status { status, body } => ClientError::Status {
            status: *status,
            body: body.clone(),
        },
        ClientError::RetriesExhausted { attempts } => ClientError::RetriesExhausted {
            attempts: *attempts,
        },
        ClientError::UnexpectedEof => ClientError::UnexpectedEof,
        ClientError::Disposed => ClientError::Disposed,
        other => ClientError::Connection(other.to_string()),
    }
}

/// Receiver of one operation's outcome.
///
/// The engine calls `next` zero or more times followed by exactly one terminal
/// callback (`complete` or `error`), always from its own tasks, never after the
/// operation's disposer has returned. Callbacks must not panic and must not call back
/// into the client.
pub trait EventSink: Send + 'static {
    /// One execution result produced by the operation.
    fn next(&mut self, value: ExecutionResult);
    /// Terminal failure; no further callbacks follow.
    fn error(&mut self, error: ClientError);
    /// Normal termination; no further callbacks follow.
    fn complete(&mut self);
}

/// Shared, take-able sink slot. Taking the sink is how disposal guarantees silence.
type SinkSlot = Arc<Mutex<Option<Box<dyn EventSink>>>>;

fn deliver_next(slot: &SinkSlot, value: ExecutionResult) -> bool {
    match &mut *slot.lock() {
        Some(sink) => {
            sink.next(value);
            true
        }
        None => false,
    }
}

fn deliver_error(slot: &SinkSlot, error: ClientError) {
    if let Some(mut sink) = slot.lock().take() {
        sink.error(error);
    }
}

fn deliver_complete(slot: &SinkSlot) {
    if let Some(mut sink) = slot.lock().take() {
        sink.complete();
    }
}

type HeadersFn = Arc<dyn Fn() -> BoxFuture<'static, HeaderMap> + Send + Sync>;
type RetryWaitFn = Arc<dyn Fn(u32) -> BoxFuture<'static, ()> + Send + Sync>;
type GenerateIdFn = Arc<dyn Fn() -> String + Send + Sync>;
type OnMessageFn = Arc<dyn Fn(&StreamMessage) + Send + Sync>;
type OnNonLazyErrorFn = Arc<dyn Fn(ClientError) + Send + Sync>;

/// Default backoff: `min(1000 * 2^attempt, 8000) + random(0..=3000)` milliseconds.
fn default_retry_wait(retries: u32) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let base = 1000u64
            .saturating_mul(1u64 << retries.min(6))
            .min(8_000);
        let jitter = rand::rng().random_range(0..=3_000u64);
        tokio::time::sleep(Duration::from_millis(base + jitter)).await;
    })
}

fn default_generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Configuration for [`Client`].
///
/// # Examples
///
/// ```rust,no_run
/// use graphql_sse::client::Client;
///
/// let client = Client::builder("http://localhost:8080/graphql/stream")
///     .single_connection(true)
///     .lazy(true)
///     .retry_attempts(5)
///     .build()
///     .unwrap();
/// ```
pub struct ClientBuilder {
    url: String,
    single_connection: bool,
    lazy: bool,
    headers: HeaderMap,
    headers_fn: Option<HeadersFn>,
    retry_attempts: u32,
    retry_wait: RetryWaitFn,
    generate_id: GenerateIdFn,
    on_message: Option<OnMessageFn>,
    on_non_lazy_error: Option<OnNonLazyErrorFn>,
}

impl ClientBuilder {
    fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            single_connection: false,
            lazy: true,
            headers: HeaderMap::new(),
            headers_fn: None,
            retry_attempts: 5,
            retry_wait: Arc::new(default_retry_wait),
            generate_id: Arc::new(default_generate_id),
            on_message: None,
            on_non_lazy_error: None,
        }
    }

    /// Multiplex every operation over one reserved event stream.
    pub fn single_connection(mut self, single: bool) -> Self {
        self.single_connection = single;
        self
    }

    /// In single-connection mode, connect on first subscribe (`true`, the default) or
    /// at build time (`false`).
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Static headers attached to every request.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Async header factory invoked per request, merged over the static headers.
    pub fn headers_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HeaderMap> + Send + 'static,
    {
        self.headers_fn = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// How many additional handshake attempts follow a transport failure.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Replaces the backoff strategy; receives the zero-based retry index.
    pub fn retry_wait<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.retry_wait = Arc::new(move |retries| Box::pin(f(retries)));
        self
    }

    /// Replaces the operation id factory. Ids must be unique within the client.
    pub fn generate_id<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.generate_id = Arc::new(f);
        self
    }

    /// Debugging hook observing every decoded protocol message before dispatch.
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&StreamMessage) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Receives connection errors that occur while no subscription is listening
    /// (non-lazy single-connection mode).
    pub fn on_non_lazy_error<F>(mut self, f: F) -> Self
    where
        F: Fn(ClientError) + Send + Sync + 'static,
    {
        self.on_non_lazy_error = Some(Arc::new(f));
        self
    }

    /// Builds the client. In non-lazy single-connection mode this starts the
    /// connection handshake immediately.
    pub fn build(self) -> Result<Client, ClientError> {
        let endpoint = Endpoint::parse(&self.url)?;
        let inner = Arc::new(ClientInner {
            transport: Transport {
                endpoint,
                headers: self.headers,
                headers_fn: self.headers_fn,
            },
            single_connection: self.single_connection,
            lazy: self.lazy,
            retry_attempts: self.retry_attempts,
            retry_wait: self.retry_wait,
            generate_id: self.generate_id,
            on_message: self.on_message,
            on_non_lazy_error: self.on_non_lazy_error,
            disposed: AtomicBool::new(false),
            distinct: DashMap::new(),
            distinct_seq: AtomicU64::new(0),
            single: SingleState::default(),
        });
        if inner.single_connection && !inner.lazy {
            inner.ensure_connection();
        }
        Ok(Client { inner })
    }
}

/// GraphQL over SSE client.
///
/// Cheap to clone; all clones share transport options and, in single-connection mode,
/// the multiplexed stream.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Starts building a client for the given endpoint URL.
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Registers a sink for one operation and starts it.
    ///
    /// The returned [`Subscription`] cancels the operation when disposed; disposal is
    /// idempotent and guarantees no sink callback fires after it returns.
    pub fn subscribe<S>(&self, request: OperationRequest, sink: S) -> Subscription
    where
        S: EventSink,
    {
        let mut sink = sink;
        if self.inner.disposed.load(Ordering::Acquire) {
            sink.error(ClientError::Disposed);
            return Subscription {
                kind: SubscriptionKind::Detached,
            };
        }
        let slot: SinkSlot = Arc::new(Mutex::new(Some(Box::new(sink))));
        if self.inner.single_connection {
            self.inner.subscribe_single(request, slot)
        } else {
            self.inner.subscribe_distinct(request, slot)
        }
    }

    /// Runs one operation and returns its results as an async stream.
    ///
    /// Dropping the stream (or `break`ing out of the read loop) disposes the
    /// underlying subscription.
    pub fn iterate(&self, request: OperationRequest) -> SubscriptionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(request, ChannelSink { tx });
        SubscriptionStream { rx, subscription }
    }

    /// Tears the client down: every active subscription receives an error and the
    /// physical stream(s) are closed.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let keys: Vec<u64> = self.inner.distinct.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, op)) = self.inner.distinct.remove(&key) {
                op.cancel.cancel();
                deliver_error(&op.sink, ClientError::Disposed);
            }
        }
        self.inner.teardown_connection();
        let ids: Vec<String> = self
            .inner
            .single
            .entries
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Some((_, entry)) = self.inner.single.entries.remove(&id) {
                deliver_error(&entry.sink, ClientError::Disposed);
            }
        }
    }
}

/// Handle cancelling one operation.
pub struct Subscription {
    kind: SubscriptionKind,
}

enum SubscriptionKind {
    Distinct {
        op: Arc<DistinctOp>,
    },
    Single {
        inner: Arc<ClientInner>,
        entry: Arc<SubEntry>,
    },
    Detached,
}

impl Subscription {
    /// Cancels the operation. Idempotent; after this returns no sink callback fires.
    pub fn dispose(&self) {
        match &self.kind {
            SubscriptionKind::Distinct { op } => {
                drop(op.sink.lock().take());
                op.cancel.cancel();
            }
            SubscriptionKind::Single { inner, entry } => {
                drop(entry.sink.lock().take());
                let id = entry.id.lock().clone();
                inner.single.entries.remove(&id);
                let handle = inner.single.conn.lock().as_ref().cloned();
                if let Some(handle) = handle {
                    let _ = handle.cmd_tx.send(ConnCmd::Cancel(id));
                }
            }
            SubscriptionKind::Detached => {}
        }
    }
}

/// Async stream adapter over [`Client::subscribe`].
///
/// Yields `Ok(result)` per `next` event; a transport failure surfaces as one final
/// `Err` item. The stream ends after `complete`. Dropping it disposes the
/// subscription.
pub struct SubscriptionStream {
    rx: mpsc::UnboundedReceiver<Result<ExecutionResult, ClientError>>,
    subscription: Subscription,
}

impl SubscriptionStream {
    /// Receives the next result, or `None` once the operation completed.
    pub async fn next(&mut self) -> Option<Result<ExecutionResult, ClientError>> {
        self.rx.recv().await
    }
}

impl Stream for SubscriptionStream {
    type Item = Result<ExecutionResult, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.subscription.dispose();
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Result<ExecutionResult, ClientError>>,
}

impl EventSink for ChannelSink {
    fn next(&mut self, value: ExecutionResult) {
        let _ = self.tx.send(Ok(value));
    }

    fn error(&mut self, error: ClientError) {
        let _ = self.tx.send(Err(error));
    }

    fn complete(&mut self) {}
}

struct DistinctOp {
    sink: SinkSlot,
    cancel: CancellationToken,
}

struct SubEntry {
    id: Mutex<String>,
    request: OperationRequest,
    sink: SinkSlot,
    submitted: AtomicBool,
}

enum ConnCmd {
    Submit(Arc<SubEntry>),
    Cancel(String),
}

#[derive(Clone)]
struct ConnHandle {
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct SingleState {
    entries: DashMap<String, Arc<SubEntry>>,
    conn: Mutex<Option<ConnHandle>>,
    generation: AtomicU64,
}

struct ClientInner {
    transport: Transport,
    single_connection: bool,
    lazy: bool,
    retry_attempts: u32,
    retry_wait: RetryWaitFn,
    generate_id: GenerateIdFn,
    on_message: Option<OnMessageFn>,
    on_non_lazy_error: Option<OnNonLazyErrorFn>,
    disposed: AtomicBool,
    distinct: DashMap<u64, Arc<DistinctOp>>,
    distinct_seq: AtomicU64,
    single: SingleState,
}

enum AttemptOutcome {
    Completed,
    Cancelled,
}

impl ClientInner {
    // ---- distinct-connections mode -------------------------------------------------

    fn subscribe_distinct(self: &Arc<Self>, request: OperationRequest, slot: SinkSlot) -> Subscription {
        let cancel = CancellationToken::new();
        let op = Arc::new(DistinctOp {
            sink: slot,
            cancel: cancel.clone(),
        });
        let key = self.distinct_seq.fetch_add(1, Ordering::Relaxed);
        self.distinct.insert(key, op.clone());

        let inner = self.clone();
        let task_op = op.clone();
        tokio::spawn(async move {
            inner.run_distinct(request, &task_op).await;
            inner.distinct.remove(&key);
        });

        Subscription {
            kind: SubscriptionKind::Distinct { op },
        }
    }

    async fn run_distinct(&self, request: OperationRequest, op: &Arc<DistinctOp>) {
        let mut retries: u32 = 0;
        loop {
            match self.distinct_attempt(&request, op).await {
                Ok(AttemptOutcome::Completed) => {
                    deliver_complete(&op.sink);
                    return;
                }
                Ok(AttemptOutcome::Cancelled) => return,
                Err(err) => {
                    if !retryable(&err) {
                        deliver_error(&op.sink, err);
                        return;
                    }
                    if retries >= self.retry_attempts {
                        tracing::debug!("giving up on operation: {err}");
                        deliver_error(
                            &op.sink,
                            ClientError::RetriesExhausted {
                                attempts: retries + 1,
                            },
                        );
                        return;
                    }
                    let wait = (self.retry_wait)(retries);
                    retries += 1;
                    tokio::select! {
                        _ = op.cancel.cancelled() => return,
                        _ = wait => {}
                    }
                }
            }
        }
    }

    async fn distinct_attempt(
        &self,
        request: &OperationRequest,
        op: &Arc<DistinctOp>,
    ) -> Result<AttemptOutcome, ClientError> {
        let body = Bytes::from(serde_json::to_vec(request)?);
        let inflight = tokio::select! {
            _ = op.cancel.cancelled() => return Ok(AttemptOutcome::Cancelled),
            inflight = self.transport.send(Method::POST, None, None, Some(body), true) => inflight?,
        };
        let mut stream = EventStream::open(inflight).await?;

        loop {
            let message = tokio::select! {
                _ = op.cancel.cancelled() => return Ok(AttemptOutcome::Cancelled),
                message = stream.next_message() => message?,
            };
            let Some(message) = message else {
                return Err(ClientError::UnexpectedEof);
            };
            if let Some(hook) = &self.on_message {
                hook(&message);
            }
            match message {
                StreamMessage::Next { payload, .. } => {
                    if !deliver_next(&op.sink, payload) {
                        return Ok(AttemptOutcome::Cancelled);
                    }
                }
                StreamMessage::Complete { .. } => return Ok(AttemptOutcome::Completed),
                StreamMessage::Pong => {}
            }
        }
    }

    // ---- single-connection mode ----------------------------------------------------

    fn subscribe_single(self: &Arc<Self>, request: OperationRequest, slot: SinkSlot) -> Subscription {
        let id = (self.generate_id)();
        let entry = Arc::new(SubEntry {
            id: Mutex::new(id.clone()),
            request,
            sink: slot,
            submitted: AtomicBool::new(false),
        });
        self.single.entries.insert(id, entry.clone());

        // A teardown can race the send; a second ensure_connection starts a fresh task.
        let handle = self.ensure_connection();
        if handle.cmd_tx.send(ConnCmd::Submit(entry.clone())).is_err() {
            let handle = self.ensure_connection();
            let _ = handle.cmd_tx.send(ConnCmd::Submit(entry.clone()));
        }

        Subscription {
            kind: SubscriptionKind::Single {
                inner: self.clone(),
                entry,
            },
        }
    }

    /// Returns the live connection handle, starting the connection task if necessary.
    fn ensure_connection(self: &Arc<Self>) -> ConnHandle {
        let mut guard = self.single.conn.lock();
        if let Some(handle) = guard.as_ref() {
            if !handle.cancel.is_cancelled() {
                return handle.clone();
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let generation = self.single.generation.fetch_add(1, Ordering::Relaxed);
        let handle = ConnHandle {
            cmd_tx,
            cancel: cancel.clone(),
            generation,
        };
        *guard = Some(handle.clone());
        drop(guard);

        let inner = self.clone();
        tokio::spawn(async move {
            inner.connection_task(cmd_rx, cancel, generation).await;
        });
        handle
    }

    /// Clears the stored connection handle if it still belongs to `generation`.
    fn clear_connection(&self, generation: u64) {
        let mut guard = self.single.conn.lock();
        if let Some(handle) = guard.as_ref() {
            if handle.generation == generation {
                handle.cancel.cancel();
                *guard = None;
            }
        }
    }

    fn teardown_connection(&self) {
        if let Some(handle) = self.single.conn.lock().take() {
            handle.cancel.cancel();
        }
    }

    /// Owns the multiplexed stream: handshake, dispatch, reconnect, resubmission.
    async fn connection_task(
        self: Arc<Self>,
        mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let mut retries: u32 = 0;
        'connect: loop {
            if cancel.is_cancelled() {
                return;
            }

            let handshake = tokio::select! {
                _ = cancel.cancelled() => return,
                handshake = self.handshake() => handshake,
            };
            let (token, mut stream) = match handshake {
                Ok(connected) => connected,
                Err(err) => {
                    if !retryable(&err) {
                        tracing::error!("event stream handshake rejected: {err}");
                        self.connection_failed(generation, &err);
                        return;
                    }
                    if retries >= self.retry_attempts {
                        let err = ClientError::RetriesExhausted {
                            attempts: retries + 1,
                        };
                        tracing::error!("event stream unreachable: {err}");
                        self.connection_failed(generation, &err);
                        return;
                    }
                    let wait = (self.retry_wait)(retries);
                    retries += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = wait => {}
                    }
                    continue 'connect;
                }
            };
            retries = 0;
            tracing::debug!(token = %token, "event stream established");

            self.resubmit_live_operations(&token).await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ConnCmd::Submit(entry)) => {
                            // Already handled by the resubmission pass after connect.
                            if !entry.submitted.load(Ordering::Acquire) {
                                self.submit_entry(&token, &entry).await;
                            }
                        }
                        Some(ConnCmd::Cancel(id)) => {
                            self.delete_operation(&token, &id).await;
                            if self.lazy && self.single.entries.is_empty() {
                                self.clear_connection(generation);
                                return;
                            }
                        }
                        None => return,
                    },
                    message = stream.next_message() => match message {
                        Ok(Some(message)) => {
                            if self.dispatch(message) && self.lazy && self.single.entries.is_empty() {
                                self.clear_connection(generation);
                                return;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("event stream ended, reconnecting");
                            if !self.reconnect_backoff(&cancel, generation, &mut retries).await {
                                return;
                            }
                            continue 'connect;
                        }
                        Err(err) => {
                            tracing::debug!("event stream failed, reconnecting: {err}");
                            if !self.reconnect_backoff(&cancel, generation, &mut retries).await {
                                return;
                            }
                            continue 'connect;
                        }
                    },
                }
            }
        }
    }

    /// Waits out the backoff before another handshake attempt.
    ///
    /// Returns `false` when the retry budget is spent or the connection was cancelled,
    /// in which case the connection task must exit.
    async fn reconnect_backoff(
        &self,
        cancel: &CancellationToken,
        generation: u64,
        retries: &mut u32,
    ) -> bool {
        if *retries >= self.retry_attempts {
            let err = ClientError::RetriesExhausted {
                attempts: *retries + 1,
            };
            tracing::error!("event stream kept failing: {err}");
            self.connection_failed(generation, &err);
            return false;
        }
        let wait = (self.retry_wait)(*retries);
        *retries += 1;
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = wait => true,
        }
    }

    /// Routes one decoded message to its sink. Returns whether an operation reached
    /// its terminal event.
    fn dispatch(&self, message: StreamMessage) -> bool {
        if let Some(hook) = &self.on_message {
            hook(&message);
        }
        match message {
            StreamMessage::Next {
                id: Some(id),
                payload,
            } => {
                let entry = self.single.entries.get(&id).map(|e| e.value().clone());
                if let Some(entry) = entry {
                    deliver_next(&entry.sink, payload);
                }
                false
            }
            StreamMessage::Complete { id: Some(id) } => {
                if let Some((_, entry)) = self.single.entries.remove(&id) {
                    deliver_complete(&entry.sink);
                    return true;
                }
                false
            }
            // Events without an id have no meaning on a multiplexed stream.
            _ => false,
        }
    }

    /// `PUT` for a token, then `GET` the event stream it reserves.
    async fn handshake(&self) -> Result<(String, EventStream), ClientError> {
        let (status, body) = self
            .transport
            .fetch(Method::PUT, None, None, None, false)
            .await?;
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        let token = String::from_utf8_lossy(&body).trim().to_string();
        if token.is_empty() {
            return Err(ClientError::Connection(
                "stream reservation returned an empty token".to_string(),
            ));
        }

        let inflight = self
            .transport
            .send(Method::GET, None, Some(&token), None, true)
            .await?;
        let stream = EventStream::open(inflight).await?;
        Ok((token, stream))
    }

    /// Submits every live operation under a fresh id.
    ///
    /// Runs after each successful handshake. Reservations do not survive the server
    /// side of a reconnect, so ids are not preserved either; sinks stay attached to
    /// their entries and keep receiving.
    async fn resubmit_live_operations(&self, token: &str) {
        let live: Vec<Arc<SubEntry>> = self
            .single
            .entries
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.single.entries.clear();

        for entry in live {
            if entry.sink.lock().is_none() {
                continue;
            }
            let id = (self.generate_id)();
            *entry.id.lock() = id.clone();
            self.single.entries.insert(id, entry.clone());
            self.submit_entry(token, &entry).await;
        }
    }

    async fn submit_entry(&self, token: &str, entry: &Arc<SubEntry>) {
        let id = entry.id.lock().clone();
        if entry.sink.lock().is_none() {
            self.single.entries.remove(&id);
            return;
        }
        entry.submitted.store(true, Ordering::Release);

        let request = entry.request.clone().with_operation_id(id.clone());
        let body = match serde_json::to_vec(&request) {
            Ok(body) => Bytes::from(body),
            Err(err) => {
                self.single.entries.remove(&id);
                deliver_error(&entry.sink, err.into());
                return;
            }
        };
        match self
            .transport
            .fetch(Method::POST, None, Some(token), Some(body), false)
            .await
        {
            Ok((status, _)) if status.is_success() => {}
            Ok((status, body)) => {
                self.single.entries.remove(&id);
                deliver_error(
                    &entry.sink,
                    ClientError::Status {
                        status,
                        body: String::from_utf8_lossy(&body).into_owned(),
                    },
                );
            }
            Err(err) => {
                self.single.entries.remove(&id);
                deliver_error(&entry.sink, err);
            }
        }
    }

    async fn delete_operation(&self, token: &str, id: &str) {
        let query = serde_urlencoded::to_string([("operationId", id)]).unwrap_or_default();
        match self
            .transport
            .fetch(Method::DELETE, Some(query), Some(token), None, false)
            .await
        {
            Ok((status, _)) if status.is_success() => {}
            Ok((status, _)) => tracing::debug!("operation cancel answered {status}"),
            Err(err) => tracing::debug!("operation cancel request failed: {err}"),
        }
    }

    /// Fails every registered subscription and clears the connection state.
    fn connection_failed(&self, generation: u64, err: &ClientError) {
        self.clear_connection(generation);
        let ids: Vec<String> = self
            .single
            .entries
            .iter()
            .map(|e| e.key().clone())
            .collect();
        let had_listeners = !ids.is_empty();
        for id in ids {
            if let Some((_, entry)) = self.single.entries.remove(&id) {
                deliver_error(&entry.sink, replicate(err));
            }
        }
        if !self.lazy && !had_listeners {
            if let Some(hook) = &self.on_non_lazy_error {
                hook(replicate(err));
            }
        }
    }
}

// ---- transport ----------------------------------------------------------------------

/// Parsed endpoint coordinates.
#[derive(Clone)]
struct Endpoint {
    https: bool,
    host: String,
    port: u16,
    authority: String,
    path: String,
}

impl Endpoint {
    fn parse(raw: &str) -> Result<Self, ClientError> {
        let url = Url::parse(raw).map_err(|e| ClientError::Url(e.to_string()))?;
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            scheme => {
                return Err(ClientError::Url(format!("unsupported scheme {scheme:?}")));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::Url("missing host".to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if https { 443 } else { 80 });
        let authority = if (https && port == 443) || (!https && port == 80) {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        let path = match url.path() {
            "" => "/".to_string(),
            path => path.to_string(),
        };
        Ok(Self {
            https,
            host,
            port,
            authority,
            path,
        })
    }
}

/// One request's connection: the HTTP/1 sender plus its driver task.
struct HttpConnection {
    sender: SendRequest<Full<Bytes>>,
    _conn: tokio::task::JoinHandle<()>,
}

impl HttpConnection {
    async fn open(endpoint: &Endpoint) -> Result<Self, ClientError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        if endpoint.https {
            #[cfg(feature = "tls")]
            {
                return Self::open_tls(endpoint, stream).await;
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(ClientError::TlsUnavailable);
            }
        }
        Self::handshake(TokioIo::new(stream)).await
    }

    #[cfg(feature = "tls")]
    async fn open_tls(endpoint: &Endpoint, stream: TcpStream) -> Result<Self, ClientError> {
        use rustls::pki_types::ServerName;
        use rustls::{ClientConfig, RootCertStore};
        use tokio_rustls::TlsConnector;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| ClientError::Url(e.to_string()))?;
        let tls = connector.connect(name, stream).await?;
        Self::handshake(TokioIo::new(tls)).await
    }

    async fn handshake<T>(io: T) -> Result<Self, ClientError>
    where
        T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let (sender, conn) = http1::handshake(io).await?;
        let handle = tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!("connection task ended: {err}");
            }
        });
        Ok(Self {
            sender,
            _conn: handle,
        })
    }
}

/// A sent request whose response body is still live.
struct InFlight {
    response: hyper::Response<Incoming>,
    conn: HttpConnection,
}

struct Transport {
    endpoint: Endpoint,
    headers: HeaderMap,
    headers_fn: Option<HeadersFn>,
}

impl Transport {
    /// Opens a fresh connection and sends one request.
    async fn send(
        &self,
        method: Method,
        query: Option<String>,
        token: Option<&str>,
        json_body: Option<Bytes>,
        accept_event_stream: bool,
    ) -> Result<InFlight, ClientError> {
        let mut conn = HttpConnection::open(&self.endpoint).await?;

        let uri = match &query {
            Some(query) => format!("{}?{}", self.endpoint.path, query),
            None => self.endpoint.path.clone(),
        };
        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, &self.endpoint.authority);
        for (name, value) in self.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(headers_fn) = &self.headers_fn {
            for (name, value) in headers_fn().await.iter() {
                builder = builder.header(name, value);
            }
        }
        if accept_event_stream {
            builder = builder.header(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        if let Some(token) = token {
            builder = builder.header(
                TOKEN_HEADER,
                HeaderValue::from_str(token).map_err(|_| {
                    ClientError::Connection("stream token is not a valid header value".to_string())
                })?,
            );
        }
        if json_body.is_some() {
            builder = builder.header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        let request = builder.body(Full::new(json_body.unwrap_or_default()))?;
        let response = conn.sender.send_request(request).await?;
        Ok(InFlight { response, conn })
    }

    /// Sends one request and buffers the whole response.
    async fn fetch(
        &self,
        method: Method,
        query: Option<String>,
        token: Option<&str>,
        json_body: Option<Bytes>,
        accept_event_stream: bool,
    ) -> Result<(StatusCode, Bytes), ClientError> {
        let inflight = self
            .send(method, query, token, json_body, accept_event_stream)
            .await?;
        let (parts, body) = inflight.response.into_parts();
        let bytes = body.collect().await?.to_bytes();
        Ok((parts.status, bytes))
    }
}

/// Incremental reader decoding an SSE response body into protocol records.
struct EventStream {
    body: Incoming,
    parser: SseParser,
    pending: VecDeque<SseFrame>,
    _conn: HttpConnection,
}

impl EventStream {
    /// Validates the stream response and wraps its body.
    async fn open(inflight: InFlight) -> Result<Self, ClientError> {
        let status = inflight.response.status();
        if !status.is_success() {
            let body = inflight
                .response
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                .unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        let content_type = inflight
            .response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("text/event-stream") {
            return Err(ClientError::Connection(format!(
                "expected a text/event-stream response, got {content_type:?}"
            )));
        }

        let (_, body) = inflight.response.into_parts();
        Ok(Self {
            body,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            _conn: inflight.conn,
        })
    }

    async fn next_frame(&mut self) -> Result<Option<SseFrame>, ClientError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            match self.body.frame().await {
                None => return Ok(None),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        self.pending.extend(self.parser.feed(data));
                    }
                }
            }
        }
    }

    async fn next_message(&mut self) -> Result<Option<StreamMessage>, ClientError> {
        match self.next_frame().await? {
            Some(frame) => Ok(Some(StreamMessage::decode(&frame)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing_defaults_ports_and_paths() {
        let ep = Endpoint::parse("http://localhost/graphql/stream").unwrap();
        assert!(!ep.https);
        assert_eq!(ep.port, 80);
        assert_eq!(ep.authority, "localhost");
        assert_eq!(ep.path, "/graphql/stream");

        let ep = Endpoint::parse("http://localhost:8080/graphql/stream").unwrap();
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.authority, "localhost:8080");

        let ep = Endpoint::parse("https://example.com").unwrap();
        assert!(ep.https);
        assert_eq!(ep.port, 443);
        assert_eq!(ep.path, "/");
    }

    #[test]
    fn endpoint_parsing_rejects_other_schemes() {
        assert!(matches!(
            Endpoint::parse("ws://localhost/graphql"),
            Err(ClientError::Url(_))
        ));
    }

    #[test]
    fn status_errors_retry_only_on_server_failures() {
        let err = ClientError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(retryable(&err));
        let err = ClientError::Status {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(!retryable(&err));
        assert!(retryable(&ClientError::UnexpectedEof));
        assert!(!retryable(&ClientError::Disposed));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(default_generate_id(), default_generate_id());
    }
}
