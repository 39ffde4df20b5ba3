//! End-to-end coverage for single-connection mode: one multiplexed SSE stream per
//! client, operations correlated by reservation token and operation id.

mod common;

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use serde_json::json;

use common::{
    GREETINGS, PULSE_DONE, Recorder, raw_request, raw_stream_until, spawn_server, test_schema,
    wait_for,
};
use graphql_sse::handler::SseHandler;
use graphql_sse::protocol::{OperationRequest, StreamMessage, TOKEN_HEADER};
use graphql_sse::registry::StreamRegistry;
use graphql_sse::Client;

fn single_conn_client(url: String) -> Client {
    Client::builder(url)
        .single_connection(true)
        .retry_wait(|_| async {})
        .build()
        .unwrap()
}

#[tokio::test]
async fn multiplexed_subscriptions_demux_without_crosstalk() {
    let (schema, _hub) = test_schema();
    let (_addr, url) = spawn_server(SseHandler::new(schema)).await;
    let client = single_conn_client(url);

    let mut a = client.iterate(OperationRequest::new("subscription { greetings }"));
    let mut b = client.iterate(OperationRequest::new("subscription { greetings }"));

    for greeting in GREETINGS {
        let value = a.next().await.unwrap().unwrap();
        assert_eq!(value, json!({"data": {"greetings": greeting}}));
    }
    assert!(a.next().await.is_none());

    for greeting in GREETINGS {
        let value = b.next().await.unwrap().unwrap();
        assert_eq!(value, json!({"data": {"greetings": greeting}}));
    }
    assert!(b.next().await.is_none());
}

#[tokio::test]
async fn queries_and_subscriptions_share_one_stream() {
    let (schema, _hub) = test_schema();
    let handler = SseHandler::new(schema);
    let registry = handler.registry().clone();
    let (_addr, url) = spawn_server(handler).await;
    let client = single_conn_client(url);

    let mut results = client.iterate(OperationRequest::new("{ hello }"));
    let value = results.next().await.unwrap().unwrap();
    assert_eq!(value, json!({"data": {"hello": "world"}}));
    assert!(results.next().await.is_none());

    // Only one reservation ever existed for the client.
    assert!(registry.len() <= 1);
}

#[tokio::test]
async fn cancel_mid_stream_stops_one_operation_only() {
    let (schema, hub) = test_schema();
    let handler = SseHandler::new(schema);
    let registry = handler.registry().clone();
    let (_addr, url) = spawn_server(handler).await;
    let client = single_conn_client(url);

    let recorder_a = Recorder::default();
    let recorder_b = Recorder::default();
    let sub_a = client.subscribe(
        OperationRequest::new("subscription { pulses }"),
        recorder_a.sink(),
    );
    let _sub_b = client.subscribe(
        OperationRequest::new("subscription { pulses }"),
        recorder_b.sink(),
    );

    wait_for("both operations to reach the producer", || {
        hub.receiver_count() == 2
    })
    .await;
    hub.send("one".to_string()).unwrap();
    wait_for("both sinks to see the first value", || {
        recorder_a.next_count() == 1 && recorder_b.next_count() == 1
    })
    .await;

    sub_a.dispose();
    wait_for("the cancellation to reach the server", || {
        hub.receiver_count() == 1
    })
    .await;

    hub.send("two".to_string()).unwrap();
    wait_for("the live sink to see the second value", || {
        recorder_b.next_count() == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(recorder_a.nexts(), vec![json!({"data": {"pulses": "one"}})]);
    assert!(!recorder_a.completed());
    assert!(recorder_a.errors().is_empty());
    assert_eq!(
        recorder_b.nexts(),
        vec![
            json!({"data": {"pulses": "one"}}),
            json!({"data": {"pulses": "two"}}),
        ]
    );

    hub.send(PULSE_DONE.to_string()).unwrap();
    wait_for("the live operation to complete", || recorder_b.completed()).await;

    client.dispose();
    wait_for("the registry to drain", || registry.is_empty()).await;
}

#[tokio::test]
async fn reconnect_resubmits_live_operations_with_fresh_ids() {
    let (schema, hub) = test_schema();
    let handler = SseHandler::new(schema);
    let registry = handler.registry().clone();
    let (_addr, url) = spawn_server(handler).await;
    let client = single_conn_client(url);

    let recorder = Recorder::default();
    let _sub = client.subscribe(
        OperationRequest::new("subscription { pulses }"),
        recorder.sink(),
    );
    wait_for("the operation to reach the producer", || {
        hub.receiver_count() == 1
    })
    .await;
    hub.send("one".to_string()).unwrap();
    wait_for("the first value", || recorder.next_count() == 1).await;

    // Drop the reservation server-side; the client observes the stream ending and
    // runs the full handshake again.
    let old_token = registry.tokens()[0].clone();
    registry.close(&old_token);

    wait_for("the client to reconnect and resubmit", || {
        hub.receiver_count() == 1 && registry.tokens().first().is_some_and(|t| *t != old_token)
    })
    .await;

    hub.send("two".to_string()).unwrap();
    wait_for("the value after reconnect", || recorder.next_count() == 2).await;
    assert_eq!(
        recorder.nexts(),
        vec![
            json!({"data": {"pulses": "one"}}),
            json!({"data": {"pulses": "two"}}),
        ]
    );
    assert!(recorder.errors().is_empty());
}

#[tokio::test]
async fn disposing_the_client_drains_the_registry() {
    let (schema, hub) = test_schema();
    let handler = SseHandler::new(schema);
    let registry = handler.registry().clone();
    let (_addr, url) = spawn_server(handler).await;
    let client = single_conn_client(url);

    let recorder = Recorder::default();
    let _sub = client.subscribe(
        OperationRequest::new("subscription { pulses }"),
        recorder.sink(),
    );
    wait_for("the operation to start", || hub.receiver_count() == 1).await;
    assert_eq!(registry.len(), 1);

    client.dispose();
    wait_for("the registry to drain", || registry.is_empty()).await;
    assert_eq!(recorder.errors().len(), 1);
    assert!(recorder.errors()[0].contains("disposed"));
}

// ---- raw protocol behavior ----------------------------------------------------------

async fn reserve_token(addr: std::net::SocketAddr) -> String {
    let request = Request::builder()
        .method(Method::PUT)
        .uri("/graphql/stream")
        .header(http::header::HOST, addr.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body) = raw_request(addr, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        headers[http::header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    String::from_utf8(body.to_vec()).unwrap()
}

fn with_token(addr: std::net::SocketAddr, method: Method, uri: &str, token: &str) -> http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::HOST, addr.to_string())
        .header(TOKEN_HEADER, token)
}

#[tokio::test]
async fn reservation_tokens_are_fresh_and_hex() {
    let (schema, _hub) = test_schema();
    let (addr, _url) = spawn_server(SseHandler::new(schema)).await;

    let first = reserve_token(addr).await;
    let second = reserve_token(addr).await;
    assert_eq!(first.len(), 32);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(first, second);
}

#[tokio::test]
async fn attaching_with_an_unknown_token_is_not_found() {
    let (schema, _hub) = test_schema();
    let (addr, _url) = spawn_server(SseHandler::new(schema)).await;

    let request = with_token(addr, Method::GET, "/graphql/stream", "deadbeef")
        .header(http::header::ACCEPT, "text/event-stream")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, _) = raw_request(addr, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn a_token_is_valid_for_exactly_one_attach() {
    let (schema, _hub) = test_schema();
    let handler = SseHandler::new(schema);
    let registry = handler.registry().clone();
    let (addr, _url) = spawn_server(handler).await;
    let token = reserve_token(addr).await;

    // First attach wins; keep it open by marking it consumed through a streamed GET
    // that we immediately abandon.
    let request = with_token(addr, Method::GET, "/graphql/stream", &token)
        .header(http::header::ACCEPT, "text/event-stream")
        .body(Full::new(Bytes::new()))
        .unwrap();
    tokio::spawn(raw_request(addr, request));
    wait_for("the first attach", || {
        registry.get(&token).is_some_and(|r| r.consumed())
    })
    .await;

    let request = with_token(addr, Method::GET, "/graphql/stream", &token)
        .header(http::header::ACCEPT, "text/event-stream")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, _) = raw_request(addr, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn operations_submitted_before_attach_are_delivered_after_it() {
    let (schema, _hub) = test_schema();
    let (addr, _url) = spawn_server(SseHandler::new(schema)).await;
    let token = reserve_token(addr).await;

    let op = OperationRequest::new("{ hello }").with_operation_id("op-a");
    let request = with_token(addr, Method::POST, "/graphql/stream", &token)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&op).unwrap())))
        .unwrap();
    let (status, _, _) = raw_request(addr, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let request = with_token(addr, Method::GET, "/graphql/stream", &token)
        .header(http::header::ACCEPT, "text/event-stream")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let frames = raw_stream_until(addr, request, |frame| frame.event == "complete").await;
    let messages: Vec<StreamMessage> = frames
        .iter()
        .map(|f| StreamMessage::decode(f).unwrap())
        .collect();
    assert_eq!(
        messages,
        vec![
            StreamMessage::Next {
                id: Some("op-a".to_string()),
                payload: json!({"data": {"hello": "world"}}),
            },
            StreamMessage::Complete {
                id: Some("op-a".to_string()),
            },
        ]
    );
}

#[tokio::test]
async fn duplicate_operation_ids_conflict() {
    let (schema, _hub) = test_schema();
    let (addr, _url) = spawn_server(SseHandler::new(schema)).await;
    let token = reserve_token(addr).await;

    let op = OperationRequest::new("subscription { pulses }").with_operation_id("dup");
    let body = Bytes::from(serde_json::to_vec(&op).unwrap());

    let request = with_token(addr, Method::POST, "/graphql/stream", &token)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(body.clone()))
        .unwrap();
    let (status, _, _) = raw_request(addr, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let request = with_token(addr, Method::POST, "/graphql/stream", &token)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(body))
        .unwrap();
    let (status, _, _) = raw_request(addr, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn submissions_without_an_operation_id_are_rejected() {
    let (schema, _hub) = test_schema();
    let (addr, _url) = spawn_server(SseHandler::new(schema)).await;
    let token = reserve_token(addr).await;

    let op = OperationRequest::new("{ hello }");
    let request = with_token(addr, Method::POST, "/graphql/stream", &token)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&op).unwrap())))
        .unwrap();
    let (status, _, _) = raw_request(addr, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancelling_an_unknown_operation_is_not_found() {
    let (schema, _hub) = test_schema();
    let (addr, _url) = spawn_server(SseHandler::new(schema)).await;
    let token = reserve_token(addr).await;

    let request = with_token(
        addr,
        Method::DELETE,
        "/graphql/stream?operationId=ghost",
        &token,
    )
    .body(Full::new(Bytes::new()))
    .unwrap();
    let (status, _, _) = raw_request(addr, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unclaimed_reservations_expire() {
    let (schema, _hub) = test_schema();
    let handler = SseHandler::new(schema).reservation_timeout(Duration::from_millis(50));
    let registry = handler.registry().clone();
    let (addr, _url) = spawn_server(handler).await;

    let token = reserve_token(addr).await;
    assert!(registry.get(&token).is_some());
    wait_for("the idle sweep", || registry.is_empty()).await;

    let request = with_token(addr, Method::GET, "/graphql/stream", &token)
        .header(http::header::ACCEPT, "text/event-stream")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, _) = raw_request(addr, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_single_connection_operations_fail_in_band() {
    let (schema, _hub) = test_schema();
    let (addr, _url) = spawn_server(SseHandler::new(schema)).await;
    let token = reserve_token(addr).await;

    let op = OperationRequest::new("{").with_operation_id("bad");
    let request = with_token(addr, Method::POST, "/graphql/stream", &token)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&op).unwrap())))
        .unwrap();
    let (status, _, _) = raw_request(addr, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let request = with_token(addr, Method::GET, "/graphql/stream", &token)
        .header(http::header::ACCEPT, "text/event-stream")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let frames = raw_stream_until(addr, request, |frame| frame.event == "complete").await;
    let messages: Vec<StreamMessage> = frames
        .iter()
        .map(|f| StreamMessage::decode(f).unwrap())
        .collect();
    assert_eq!(messages.len(), 2);
    match &messages[0] {
        StreamMessage::Next { id, payload } => {
            assert_eq!(id.as_deref(), Some("bad"));
            assert!(!payload["errors"].as_array().unwrap().is_empty());
        }
        other => panic!("expected an in-band error, got {other:?}"),
    }
    assert_eq!(
        messages[1],
        StreamMessage::Complete {
            id: Some("bad".to_string()),
        }
    );
}

#[tokio::test]
async fn generated_tokens_do_not_collide_with_registry_state() {
    // PUT -> GET -> close leaves nothing behind.
    let registry = StreamRegistry::new();
    let reservation = registry
        .reserve(StreamRegistry::generate_token(), Duration::from_secs(10))
        .unwrap();
    let token = reservation.token().to_string();
    let _rx = reservation.attach().unwrap();
    registry.close(&token);
    assert!(registry.is_empty());
}
