//! Server engine: routes transport requests and streams GraphQL results over SSE.
//!
//! [`SseHandler`] dispatches incoming HTTP requests by method and headers:
//! - `PUT` reserves a multiplexed stream and answers with its token
//! - `GET` with a stream token attaches to the reserved stream
//! - `GET` without one serves the operation encoded in the query string
//! - `POST` with a token submits an operation onto a reserved stream (`202`)
//! - `POST` with `Accept: text/event-stream` executes and streams in the response
//! - `DELETE` cancels an in-flight operation on a reserved stream
//!
//! Execution is delegated to an `async_graphql::Executor`; queries and mutations run
//! once and emit a single `next` before `complete`, subscriptions forward each produced
//! value as its own `next`. The handler works directly on hyper request/response types
//! and can be mounted on any hyper server; see `serve` for a ready-made accept loop.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_graphql::{
  self as gql, Executor,
  parser::{
    parse_query,
    types::{DocumentOperations, OperationType},
  },
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt, future::BoxFuture};
use http::{HeaderMap, HeaderValue, Method, StatusCode, header, request::Parts};
use http_body_util::BodyExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
  body::SseBody,
  protocol::{OperationRequest, StreamMessage, TOKEN_HEADER},
  registry::{Reservation, STREAM_WINDOW, StreamRegistry},
  sse::KEEP_ALIVE,
  types::{Request, Response},
};

/// Default keep-alive comment cadence.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(12);

/// Default eviction timeout for reservations no `GET` ever attaches to.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A complete response to send instead of continuing the protocol flow.
///
/// Returned by the `authenticate` and `on_subscribe` hooks to short-circuit a request,
/// typically for authentication failures or persisted-document lookups that miss.
#[derive(Debug, Default)]
pub struct ResponseOverride {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Option<String>,
}

impl ResponseOverride {
  pub fn new(status: StatusCode) -> Self {
    Self {
      status,
      ..Self::default()
    }
  }

  pub fn body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  fn into_response(self) -> Response {
    let mut res = hyper::Response::new(match self.body {
      Some(body) => SseBody::from(body),
      None => SseBody::empty(),
    });
    *res.status_mut() = self.status;
    *res.headers_mut() = self.headers;
    res
  }
}

/// Outcome of the `authenticate` hook.
pub enum Auth {
  /// Proceed with this stream token in scope. Empty means "no token required" and is
  /// only meaningful for distinct-connection requests.
  Token(String),
  /// Send this response verbatim instead of routing the request.
  Respond(ResponseOverride),
}

/// Outcome of the `on_subscribe` hook.
pub enum SubscribeAction {
  /// Execute this prepared request instead of deriving one from the submission.
  Args(gql::Request),
  /// Send this response verbatim instead of executing anything.
  Respond(ResponseOverride),
}

type AuthenticateFn = Arc<dyn Fn(Arc<Parts>) -> BoxFuture<'static, Auth> + Send + Sync>;
type OnSubscribeFn = Arc<
  dyn Fn(Arc<Parts>, OperationRequest) -> BoxFuture<'static, Option<SubscribeAction>> + Send + Sync,
>;
type ContextFn =
  Arc<dyn Fn(Arc<Parts>, gql::Request) -> BoxFuture<'static, gql::Request> + Send + Sync>;
type SchemaFn<E> = Arc<dyn Fn(Arc<Parts>) -> BoxFuture<'static, E> + Send + Sync>;
type ResultFn = Arc<dyn Fn(gql::Response) -> BoxFuture<'static, gql::Response> + Send + Sync>;
type OnCompleteFn = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// Per-operation hook set cloned into execution tasks.
#[derive(Default, Clone)]
struct OperationHooks {
  on_operation: Option<ResultFn>,
  on_next: Option<ResultFn>,
  on_complete: Option<OnCompleteFn>,
}

/// GraphQL over SSE request handler.
///
/// Construct with an executor (an `async_graphql::Schema` qualifies) and chain the
/// builder methods for hooks and timings, then call [`handle`](SseHandler::handle) for
/// every request under the endpoint path:
///
/// ```ignore
/// let schema = Schema::build(Query, EmptyMutation, Subscription).finish();
/// let handler = SseHandler::new(schema).keepalive_interval(Duration::from_secs(12));
/// serve(listener, handler).await;
/// ```
pub struct SseHandler<E> {
  executor: E,
  registry: StreamRegistry,
  keepalive: Duration,
  reservation_timeout: Duration,
  authenticate: Option<AuthenticateFn>,
  schema: Option<SchemaFn<E>>,
  context: Option<ContextFn>,
  on_subscribe: Option<OnSubscribeFn>,
  hooks: OperationHooks,
}

impl<E> Clone for SseHandler<E>
where
  E: Clone,
{
  fn clone(&self) -> Self {
    Self {
      executor: self.executor.clone(),
      registry: self.registry.clone(),
      keepalive: self.keepalive,
      reservation_timeout: self.reservation_timeout,
      authenticate: self.authenticate.clone(),
      schema: self.schema.clone(),
      context: self.context.clone(),
      on_subscribe: self.on_subscribe.clone(),
      hooks: self.hooks.clone(),
    }
  }
}

impl<E> SseHandler<E>
where
  E: Executor + Send + Sync + Clone + 'static,
{
  pub fn new(executor: E) -> Self {
    Self {
      executor,
      registry: StreamRegistry::new(),
      keepalive: DEFAULT_KEEPALIVE,
      reservation_timeout: DEFAULT_RESERVATION_TIMEOUT,
      authenticate: None,
      schema: None,
      context: None,
      on_subscribe: None,
      hooks: OperationHooks::default(),
    }
  }

  /// Cadence of `:` comment keep-alives on open event streams.
  pub fn keepalive_interval(mut self, interval: Duration) -> Self {
    self.keepalive = interval;
    self
  }

  /// How long an unclaimed reservation survives before eviction.
  pub fn reservation_timeout(mut self, timeout: Duration) -> Self {
    self.reservation_timeout = timeout;
    self
  }

  /// Authentication hook, invoked before routing.
  ///
  /// Returning [`Auth::Token`] proceeds with that token in scope; returning
  /// [`Auth::Respond`] sends the response verbatim. Without a hook, `PUT` requests get
  /// a random token and every other request uses the token header when present.
  pub fn authenticate<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(Arc<Parts>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Auth> + Send + 'static,
  {
    self.authenticate = Some(Arc::new(move |parts| Box::pin(f(parts))));
    self
  }

  /// Per-request executor resolver, for setups where the schema depends on the request.
  pub fn schema<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(Arc<Parts>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = E> + Send + 'static,
  {
    self.schema = Some(Arc::new(move |parts| Box::pin(f(parts))));
    self
  }

  /// Decorates the prepared request before execution, typically to inject context data.
  pub fn context<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(Arc<Parts>, gql::Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = gql::Request> + Send + 'static,
  {
    self.context = Some(Arc::new(move |parts, request| Box::pin(f(parts, request))));
    self
  }

  /// Inspects a submitted operation before the engine prepares it.
  ///
  /// May return [`SubscribeAction::Args`] with a replacement request (persisted
  /// documents live here), [`SubscribeAction::Respond`] to short-circuit, or `None` to
  /// let the engine parse the submission itself.
  pub fn on_subscribe<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(Arc<Parts>, OperationRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<SubscribeAction>> + Send + 'static,
  {
    self.on_subscribe = Some(Arc::new(move |parts, op| Box::pin(f(parts, op))));
    self
  }

  /// Post-execution hook for single-result operations; may replace the result.
  pub fn on_operation<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(gql::Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = gql::Response> + Send + 'static,
  {
    self.hooks.on_operation = Some(Arc::new(move |response| Box::pin(f(response))));
    self
  }

  /// Per-value hook run before each `next` event; may replace the value.
  pub fn on_next<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(gql::Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = gql::Response> + Send + 'static,
  {
    self.hooks.on_next = Some(Arc::new(move |response| Box::pin(f(response))));
    self
  }

  /// Invoked when an operation reaches its terminal event, with its id when multiplexed.
  pub fn on_complete<F>(mut self, f: F) -> Self
  where
    F: Fn(Option<&str>) + Send + Sync + 'static,
  {
    self.hooks.on_complete = Some(Arc::new(f));
    self
  }

  /// The reservation registry backing single-connection mode.
  pub fn registry(&self) -> &StreamRegistry {
    &self.registry
  }

  /// Dispatches one HTTP request.
  pub async fn handle(&self, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let parts = Arc::new(parts);

    let auth = match &self.authenticate {
      Some(hook) => hook(parts.clone()).await,
      None => Auth::Token(default_token(&parts)),
    };
    let token = match auth {
      Auth::Token(token) => token,
      Auth::Respond(over) => return over.into_response(),
    };

    match parts.method.clone() {
      Method::PUT => self.reserve_stream(token),
      Method::DELETE => self.cancel_operation(&parts, &token),
      Method::GET => {
        if self.is_single_connection(&parts, &token) {
          self.attach_stream(&token)
        } else {
          self.serve_distinct_get(parts).await
        }
      }
      Method::POST => {
        if self.is_single_connection(&parts, &token) {
          self.submit_operation(parts, body, &token).await
        } else {
          self.serve_distinct_post(parts, body).await
        }
      }
      _ => status_response(StatusCode::METHOD_NOT_ALLOWED, ""),
    }
  }

  /// Whether this request addresses a reserved multiplexed stream.
  fn is_single_connection(&self, parts: &Parts, token: &str) -> bool {
    parts.headers.contains_key(TOKEN_HEADER)
      || (!token.is_empty() && self.registry.get(token).is_some())
  }

  fn reserve_stream(&self, token: String) -> Response {
    let token = if token.is_empty() {
      StreamRegistry::generate_token()
    } else {
      token
    };
    match self.registry.reserve(token.clone(), self.reservation_timeout) {
      Some(_) => {
        tracing::debug!(token = %token, "stream reserved");
        let mut res = hyper::Response::new(SseBody::from(token));
        res.headers_mut().insert(
          header::CONTENT_TYPE,
          HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        res
      }
      None => status_response(StatusCode::CONFLICT, "Stream already reserved"),
    }
  }

  fn attach_stream(&self, token: &str) -> Response {
    if token.is_empty() {
      return status_response(StatusCode::NOT_FOUND, "Stream not found");
    }
    let Some(reservation) = self.registry.get(token) else {
      return status_response(StatusCode::NOT_FOUND, "Stream not found");
    };
    let Some(rx) = reservation.attach() else {
      return status_response(StatusCode::CONFLICT, "Stream already consumed");
    };
    tracing::debug!(token = %token, "stream attached");

    let closed = reservation.closed_token();
    self.spawn_keepalive(reservation.sender(), closed.clone());
    let registry = self.registry.clone();
    let token = token.to_string();
    let guard = StreamGuard::new(move || {
      tracing::debug!(token = %token, "stream closed, releasing reservation");
      registry.close(&token);
    });
    sse_response(rx, Some(closed), guard)
  }

  async fn submit_operation(
    &self,
    parts: Arc<Parts>,
    body: hyper::body::Incoming,
    token: &str,
  ) -> Response {
    let Some(reservation) = (!token.is_empty())
      .then(|| self.registry.get(token))
      .flatten()
    else {
      return status_response(StatusCode::NOT_FOUND, "Stream not found");
    };

    let op = match read_operation(body).await {
      Ok(op) => op,
      Err(err) => return status_response(StatusCode::BAD_REQUEST, err),
    };
    let Some(op_id) = op.operation_id().map(str::to_string) else {
      return status_response(StatusCode::BAD_REQUEST, "Missing extensions.operationId");
    };

    let cancel = CancellationToken::new();
    if !reservation.add_operation(&op_id, cancel.clone()) {
      return status_response(StatusCode::CONFLICT, "Operation id already in use");
    }
    tracing::debug!(token = %token, id = %op_id, "operation accepted");

    match self.prepare(&parts, &op).await {
      Prepared::Respond(res) => {
        reservation.remove_operation(&op_id);
        *res
      }
      Prepared::Failure(errors) => {
        // GraphQL failures travel in-band on the multiplexed stream
        spawn_failure(reservation, op_id, errors);
        accepted_response()
      }
      Prepared::Operation { request, kind } => {
        let executor = self.resolve_executor(&parts).await;
        let tx = reservation.sender();
        let hooks = self.hooks.clone();
        let id = op_id.clone();
        tokio::spawn(async move {
          run_operation(
            executor,
            request,
            kind,
            Some(id.clone()),
            tx,
            cancel,
            hooks,
          )
          .await;
          reservation.remove_operation(&id);
        });
        accepted_response()
      }
    }
  }

  fn cancel_operation(&self, parts: &Parts, token: &str) -> Response {
    let Some(reservation) = (!token.is_empty())
      .then(|| self.registry.get(token))
      .flatten()
    else {
      return status_response(StatusCode::NOT_FOUND, "Stream not found");
    };

    let query = parts.uri.query().unwrap_or("");
    let params: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
    let Some(op_id) = params
      .into_iter()
      .find(|(k, _)| k == "operationId")
      .map(|(_, v)| v)
      .filter(|v| !v.is_empty())
    else {
      return status_response(StatusCode::BAD_REQUEST, "Missing operationId");
    };

    if reservation.cancel_operation(&op_id) {
      tracing::debug!(token = %token, id = %op_id, "operation cancelled");
      status_response(StatusCode::OK, "")
    } else {
      status_response(StatusCode::NOT_FOUND, "Operation not found")
    }
  }

  async fn serve_distinct_post(&self, parts: Arc<Parts>, body: hyper::body::Incoming) -> Response {
    if !accepts_event_stream(&parts.headers) {
      return status_response(StatusCode::NOT_ACCEPTABLE, "Accept: text/event-stream required");
    }
    let op = match read_operation(body).await {
      Ok(op) => op,
      Err(err) => return status_response(StatusCode::BAD_REQUEST, err),
    };
    self.start_distinct(parts, op).await
  }

  async fn serve_distinct_get(&self, parts: Arc<Parts>) -> Response {
    let query = parts.uri.query().unwrap_or("");
    let op = match OperationRequest::from_query_string(query) {
      Ok(op) => op,
      Err(err) => return status_response(StatusCode::BAD_REQUEST, err),
    };
    self.start_distinct(parts, op).await
  }

  /// Runs one operation with the response body as its event stream.
  async fn start_distinct(&self, parts: Arc<Parts>, op: OperationRequest) -> Response {
    match self.prepare(&parts, &op).await {
      Prepared::Respond(res) => *res,
      Prepared::Failure(errors) => json_response(StatusCode::BAD_REQUEST, json!({ "errors": errors })),
      Prepared::Operation { request, kind } => {
        let executor = self.resolve_executor(&parts).await;
        let (tx, rx) = mpsc::channel(STREAM_WINDOW);
        let cancel = CancellationToken::new();
        self.spawn_keepalive(tx.clone(), cancel.clone());

        let hooks = self.hooks.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
          run_operation(executor, request, kind, None, tx, task_cancel.clone(), hooks).await;
          // Stops the keep-alive ticker so the response body reaches EOF.
          task_cancel.cancel();
        });

        let guard = StreamGuard::new(move || cancel.cancel());
        sse_response(rx, None, guard)
      }
    }
  }

  /// Turns a submission into an executable request, a canned response, or errors.
  async fn prepare(&self, parts: &Arc<Parts>, op: &OperationRequest) -> Prepared {
    let prepared = if let Some(hook) = &self.on_subscribe {
      match hook(parts.clone(), op.clone()).await {
        Some(SubscribeAction::Respond(over)) => return Prepared::Respond(Box::new(over.into_response())),
        Some(SubscribeAction::Args(request)) => Some(request),
        None => None,
      }
    } else {
      None
    };

    let request = match prepared {
      Some(request) => request,
      None => {
        if op.query.is_empty() {
          return Prepared::Failure(vec![gql::ServerError::new("Missing query", None)]);
        }
        let mut request = gql::Request::new(op.query.clone());
        if let Some(name) = &op.operation_name {
          request = request.operation_name(name.clone());
        }
        if let Some(variables) = &op.variables {
          if let Ok(variables) = serde_json::from_value::<gql::Variables>(variables.clone()) {
            request = request.variables(variables);
          }
        }
        request
      }
    };

    let kind = match operation_kind(&request.query, request.operation_name.as_deref()) {
      Ok(kind) => kind,
      Err(err) => return Prepared::Failure(vec![err]),
    };

    let request = match &self.context {
      Some(hook) => hook(parts.clone(), request).await,
      None => request,
    };
    Prepared::Operation { request, kind }
  }

  async fn resolve_executor(&self, parts: &Arc<Parts>) -> E {
    match &self.schema {
      Some(resolve) => resolve(parts.clone()).await,
      None => self.executor.clone(),
    }
  }

  fn spawn_keepalive(&self, tx: mpsc::Sender<Bytes>, stop: CancellationToken) {
    let period = self.keepalive;
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = stop.cancelled() => break,
          _ = ticker.tick() => {
            if tx.send(Bytes::from_static(KEEP_ALIVE)).await.is_err() {
              break;
            }
          }
        }
      }
    });
  }
}

enum Prepared {
  Operation {
    request: gql::Request,
    kind: OperationType,
  },
  Respond(Box<Response>),
  Failure(Vec<gql::ServerError>),
}

/// Default token derivation when no `authenticate` hook is installed.
fn default_token(parts: &Parts) -> String {
  if parts.method == Method::PUT {
    return StreamRegistry::generate_token();
  }
  parts
    .headers
    .get(TOKEN_HEADER)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("")
    .to_string()
}

/// Resolves the operation kind from the document, honoring `operationName`.
fn operation_kind(query: &str, name: Option<&str>) -> Result<OperationType, gql::ServerError> {
  let doc = parse_query(query).map_err(|e| gql::ServerError::new(e.to_string(), None))?;
  match (&doc.operations, name) {
    (DocumentOperations::Single(op), _) => Ok(op.node.ty),
    (DocumentOperations::Multiple(ops), Some(name)) => ops
      .iter()
      .find(|(key, _)| key.as_str() == name)
      .map(|(_, op)| op.node.ty)
      .ok_or_else(|| gql::ServerError::new(format!("Unknown operation named {name:?}"), None)),
    (DocumentOperations::Multiple(ops), None) => {
      let mut ops = ops.iter();
      match (ops.next(), ops.next()) {
        (Some((_, op)), None) => Ok(op.node.ty),
        _ => Err(gql::ServerError::new(
          "Must provide operationName for documents with multiple operations",
          None,
        )),
      }
    }
  }
}

async fn read_operation(body: hyper::body::Incoming) -> Result<OperationRequest, String> {
  let bytes = body
    .collect()
    .await
    .map_err(|e| format!("Failed to read body: {e}"))?
    .to_bytes();
  serde_json::from_slice(&bytes).map_err(|e| format!("Invalid JSON: {e}"))
}

/// Streams errors and a terminal `complete` for an operation that never ran.
fn spawn_failure(reservation: Arc<Reservation>, id: String, errors: Vec<gql::ServerError>) {
  let tx = reservation.sender();
  tokio::spawn(async move {
    let next = StreamMessage::Next {
      id: Some(id.clone()),
      payload: json!({ "errors": errors }),
    };
    let complete = StreamMessage::Complete {
      id: Some(id.clone()),
    };
    let _ = tx.send(next.to_frame().to_bytes()).await;
    let _ = tx.send(complete.to_frame().to_bytes()).await;
    reservation.remove_operation(&id);
  });
}

/// Drives one operation to its terminal event.
///
/// Queries and mutations execute once; subscriptions pull the producer value by value,
/// awaiting each write so slow consumers pace execution. Cancellation drops the
/// producer, which runs its cleanup path.
async fn run_operation<E>(
  executor: E,
  request: gql::Request,
  kind: OperationType,
  id: Option<String>,
  tx: mpsc::Sender<Bytes>,
  cancel: CancellationToken,
  hooks: OperationHooks,
) where
  E: Executor + Send + Sync + 'static,
{
  match kind {
    OperationType::Query | OperationType::Mutation => {
      let response = tokio::select! {
        _ = cancel.cancelled() => None,
        response = executor.execute(request) => Some(response),
      };
      if let Some(mut response) = response {
        if let Some(hook) = &hooks.on_operation {
          response = hook(response).await;
        }
        if let Some(hook) = &hooks.on_next {
          response = hook(response).await;
        }
        let _ = send_message(
          &tx,
          StreamMessage::Next {
            id: id.clone(),
            payload: serialize_response(response),
          },
        )
        .await;
      }
    }
    OperationType::Subscription => {
      let mut stream = executor.execute_stream(request, None);
      loop {
        let item = tokio::select! {
          _ = cancel.cancelled() => break,
          item = stream.next() => item,
        };
        let Some(mut response) = item else { break };
        if let Some(hook) = &hooks.on_next {
          response = hook(response).await;
        }
        let message = StreamMessage::Next {
          id: id.clone(),
          payload: serialize_response(response),
        };
        if send_message(&tx, message).await.is_err() {
          break;
        }
      }
      // Dropping the stream here runs the producer's cleanup path.
      drop(stream);
    }
  }

  let _ = send_message(&tx, StreamMessage::Complete { id: id.clone() }).await;
  if let Some(hook) = &hooks.on_complete {
    hook(id.as_deref());
  }
}

fn serialize_response(response: gql::Response) -> serde_json::Value {
  match serde_json::to_value(&response) {
    Ok(value) => value,
    Err(err) => {
      tracing::error!("failed to serialize execution result: {err}");
      json!({ "errors": [{ "message": "Internal serialization failure" }] })
    }
  }
}

async fn send_message(tx: &mpsc::Sender<Bytes>, message: StreamMessage) -> Result<(), ()> {
  tx.send(message.to_frame().to_bytes())
    .await
    .map_err(|_| ())
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
  headers
    .get(header::ACCEPT)
    .and_then(|v| v.to_str().ok())
    .map(|accept| accept.contains("text/event-stream") || accept.contains("*/*"))
    .unwrap_or(true)
}

fn status_response(status: StatusCode, body: impl Into<String>) -> Response {
  let body = body.into();
  let mut res = hyper::Response::new(if body.is_empty() {
    SseBody::empty()
  } else {
    SseBody::from(body)
  });
  *res.status_mut() = status;
  res
}

fn accepted_response() -> Response {
  status_response(StatusCode::ACCEPTED, "")
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response {
  let mut res = hyper::Response::new(SseBody::from(value.to_string()));
  *res.status_mut() = status;
  res.headers_mut().insert(
    header::CONTENT_TYPE,
    HeaderValue::from_static("application/json"),
  );
  res
}

fn sse_response(
  rx: mpsc::Receiver<Bytes>,
  closed: Option<CancellationToken>,
  guard: StreamGuard,
) -> Response {
  let events = EventChannel {
    rx: ReceiverStream::new(rx),
    closed: closed.map(|token| -> Pin<Box<dyn Future<Output = ()> + Send>> {
      Box::pin(token.cancelled_owned())
    }),
    _guard: guard,
  };
  hyper::Response::builder()
    .status(StatusCode::OK)
    .header(header::CONTENT_TYPE, "text/event-stream")
    .header(header::CACHE_CONTROL, "no-cache")
    .header(header::CONNECTION, "keep-alive")
    .body(SseBody::from_stream(events))
    .unwrap()
}

/// Runs its cleanup when the response body is dropped, i.e. when the peer goes away
/// or the stream ends.
struct StreamGuard {
  cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamGuard {
  fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
    Self {
      cleanup: Some(Box::new(cleanup)),
    }
  }
}

impl Drop for StreamGuard {
  fn drop(&mut self) {
    if let Some(cleanup) = self.cleanup.take() {
      cleanup();
    }
  }
}

struct EventChannel {
  rx: ReceiverStream<Bytes>,
  /// Resolves when the backing reservation is destroyed server-side.
  closed: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
  _guard: StreamGuard,
}

impl Stream for EventChannel {
  type Item = Result<Bytes, Infallible>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if let Some(closed) = this.closed.as_mut() {
      if closed.as_mut().poll(cx).is_ready() {
        return Poll::Ready(None);
      }
    }
    Pin::new(&mut this.rx).poll_next(cx).map(|item| item.map(Ok))
  }
}
