//! End-to-end session engine tests over in-memory channels.

#![allow(unused_results)]

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::{Value, json};
use tern_core::{DecodeError, Message, Notification, RequestId};
use tern_session::{
    DuplexChannel, ElicitOutcome, HandlerRegistry, NotificationHandler, RequestOptions, RpcError,
    Session, SessionError, SessionMessage, SessionOptions, handler_fn, memory_pair,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn connect(server: HandlerRegistry, client: HandlerRegistry) -> (Session, Session) {
    let (a, b) = memory_pair(32);
    let server = Session::start(b, Arc::new(server), SessionOptions::labelled("server")).await;
    let client = Session::start(a, Arc::new(client), SessionOptions::labelled("client")).await;
    (client, server)
}

/// Client session plus the raw far end of its channel.
async fn with_raw_peer() -> (Session, DuplexChannel) {
    let (a, b) = memory_pair(32);
    let client = Session::start(
        a,
        Arc::new(HandlerRegistry::new()),
        SessionOptions::labelled("client"),
    )
    .await;
    (client, b)
}

async fn next_message(peer: &mut DuplexChannel) -> Message {
    tokio::time::timeout(TIMEOUT, peer.reader.recv())
        .await
        .expect("peer read timed out")
        .expect("channel closed")
        .expect("decode error")
        .message
}

fn echo_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register_request(
        "echo",
        handler_fn(|params, _ctx| async move { Ok::<_, RpcError>(params.unwrap_or(Value::Null)) }),
    );
    reg
}

// ── Correlation ─────────────────────────────────────────────────────

#[tokio::test]
async fn ping_resolves_to_empty_result() {
    let (client, _server) = connect(HandlerRegistry::new(), HandlerRegistry::new()).await;
    let result = client
        .send_request("ping", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!({}));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn request_resolves_to_matching_result() {
    let (client, _server) = connect(echo_registry(), HandlerRegistry::new()).await;
    let result: Value = client
        .request("echo", &json!({"n": 42}), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!({"n": 42}));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn typed_request_reports_invalid_result() {
    let (client, _server) = connect(echo_registry(), HandlerRegistry::new()).await;
    let err = client
        .request::<_, u64>("echo", &json!({"not": "a number"}), RequestOptions::default())
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::InvalidResult(_));
}

#[tokio::test]
async fn first_exchange_after_start_with_minimal_buffering() {
    let (a, b) = memory_pair(1);
    let _server = Session::start(b, Arc::new(echo_registry()), SessionOptions::default()).await;
    let client = Session::start(a, Arc::new(HandlerRegistry::new()), SessionOptions::default()).await;
    let result = tokio::time::timeout(
        TIMEOUT,
        client.send_request("echo", Some(json!([1])), RequestOptions::default()),
    )
    .await
    .expect("first exchange stalled")
    .unwrap();
    assert_eq!(result, json!([1]));
}

#[tokio::test]
async fn stray_response_is_discarded() {
    let (client, mut peer) = with_raw_peer().await;
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.send_request("ping", None, RequestOptions::default()).await }
    });

    let Message::Request(req) = next_message(&mut peer).await else {
        panic!("expected request");
    };
    peer.writer
        .send(Message::result(999, json!({"stray": true})).into())
        .await
        .unwrap();
    peer.writer
        .send(Message::result(req.id.clone(), json!({"ok": true})).into())
        .await
        .unwrap();
    // A duplicate terminal response for the same id is a no-op.
    peer.writer
        .send(Message::result(req.id, json!({"dup": true})).into())
        .await
        .unwrap();

    assert_eq!(call.await.unwrap().unwrap(), json!({"ok": true}));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn colliding_ids_across_sessions_never_cross_deliver() {
    let (client_a, _server_a) = connect(echo_registry(), HandlerRegistry::new()).await;
    let (client_b, _server_b) = connect(echo_registry(), HandlerRegistry::new()).await;

    let run = |client: Session, tag: &'static str| async move {
        let calls = (0..20).map(|i| {
            let client = client.clone();
            async move {
                client
                    .send_request("echo", Some(json!({"tag": tag, "i": i})), RequestOptions::default())
                    .await
                    .unwrap()
            }
        });
        futures::future::join_all(calls).await
    };

    let (a, b) = tokio::join!(run(client_a, "a"), run(client_b, "b"));
    for (i, v) in a.iter().enumerate() {
        assert_eq!(v, &json!({"tag": "a", "i": i}));
    }
    for (i, v) in b.iter().enumerate() {
        assert_eq!(v, &json!({"tag": "b", "i": i}));
    }
}

// ── Timeouts and cancellation ───────────────────────────────────────

#[tokio::test]
async fn timeout_does_not_poison_session() {
    let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel();
    let mut reg = HandlerRegistry::new();
    reg.register_request(
        "slow",
        handler_fn(move |_, ctx| {
            let cancel_tx = cancel_tx.clone();
            async move {
                tokio::select! {
                    () = ctx.cancelled() => { let _ = cancel_tx.send(ctx.request_id().clone()); }
                    () = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
                Ok::<_, RpcError>(json!({"late": true}))
            }
        }),
    );
    let (client, server) = connect(reg, HandlerRegistry::new()).await;

    let err = client
        .send_request(
            "slow",
            None,
            RequestOptions::default().with_timeout(Duration::from_millis(1)),
        )
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::Timeout { .. });
    assert_eq!(client.pending_count(), 0);

    let cancelled = tokio::time::timeout(TIMEOUT, cancel_rx.recv()).await.unwrap();
    assert_eq!(cancelled, Some(RequestId::Number(1)));

    let pong = client
        .send_request("ping", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(pong, json!({}));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.in_flight_count(), 0);
}

#[tokio::test]
async fn timeout_sends_cancellation_to_peer() {
    let (client, mut peer) = with_raw_peer().await;
    let err = client
        .send_request(
            "never",
            None,
            RequestOptions::default().with_timeout(Duration::from_millis(5)),
        )
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::Timeout { ref id, .. } if *id == RequestId::Number(1));

    let Message::Request(req) = next_message(&mut peer).await else {
        panic!("expected request");
    };
    let Message::Notification(Notification { method, params }) = next_message(&mut peer).await else {
        panic!("expected cancellation");
    };
    assert_eq!(method, "notifications/cancelled");
    let params = params.unwrap();
    assert_eq!(params["requestId"], req.id.to_value());
    assert_eq!(params["reason"], "timeout");
}

#[tokio::test]
async fn explicit_cancel_runs_same_path() {
    let (client, mut peer) = with_raw_peer().await;
    let token = CancellationToken::new();
    let call = tokio::spawn({
        let client = client.clone();
        let token = token.clone();
        async move {
            client
                .send_request("never", None, RequestOptions::default().with_cancel(token))
                .await
        }
    });

    let _request = next_message(&mut peer).await;
    token.cancel();
    assert_matches!(call.await.unwrap(), Err(SessionError::Cancelled { .. }));
    assert_matches!(next_message(&mut peer).await, Message::Notification(n) if n.method == "notifications/cancelled");
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn dropped_call_cleans_up_and_notifies_peer() {
    let (client, mut peer) = with_raw_peer().await;
    let dropped = tokio::time::timeout(
        Duration::from_millis(20),
        client.send_request("never", None, RequestOptions::default()),
    )
    .await;
    assert!(dropped.is_err());
    assert_eq!(client.pending_count(), 0);

    let _request = next_message(&mut peer).await;
    assert_matches!(next_message(&mut peer).await, Message::Notification(n)
        if n.method == "notifications/cancelled" && n.params.as_ref().unwrap()["reason"] == "request dropped");
}

#[tokio::test]
async fn cancelled_inbound_request_gets_no_response() {
    let mut reg = HandlerRegistry::new();
    reg.register_request(
        "wait",
        handler_fn(|_, ctx| async move {
            ctx.cancelled().await;
            Ok::<_, RpcError>(json!("ignored"))
        }),
    );
    let (a, mut peer) = memory_pair(8);
    let server = Session::start(a, Arc::new(reg), SessionOptions::labelled("server")).await;

    peer.writer.send(Message::request(7, "wait", None).into()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(server.in_flight_count(), 1);
    peer.writer
        .send(Message::notification("notifications/cancelled", Some(json!({"requestId": 7}))).into())
        .await
        .unwrap();
    peer.writer.send(Message::request(8, "ping", None).into()).await.unwrap();

    // The only response is the ping's.
    assert_eq!(next_message(&mut peer).await, Message::result(8, json!({})));
    assert!(
        tokio::time::timeout(Duration::from_millis(30), peer.reader.recv())
            .await
            .is_err(),
        "cancelled request must not be answered"
    );
    assert_eq!(server.in_flight_count(), 0);
}

// ── Handler failures ────────────────────────────────────────────────

#[tokio::test]
async fn handler_error_becomes_error_response() {
    let mut reg = HandlerRegistry::new();
    reg.register_request(
        "strict",
        handler_fn(|_, _| async { Err::<Value, _>(RpcError::invalid_params("missing name")) }),
    );
    let (client, _server) = connect(reg, HandlerRegistry::new()).await;
    let err = client
        .send_request("strict", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::Remote(obj) if obj.code == -32602 && obj.message == "missing name");
}

#[tokio::test]
async fn handler_panic_is_internal_error_and_session_survives() {
    let mut reg = HandlerRegistry::new();
    reg.register_request(
        "boom",
        handler_fn(|_, _| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, RpcError>(Value::Null)
        }),
    );
    let (client, _server) = connect(reg, HandlerRegistry::new()).await;
    let err = client
        .send_request("boom", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::Remote(obj) if obj.code == -32603 && obj.message == "Internal error");

    let pong = client.send_request("ping", None, RequestOptions::default()).await;
    assert_eq!(pong.unwrap(), json!({}));
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let (client, _server) = connect(HandlerRegistry::new(), HandlerRegistry::new()).await;
    let err = client
        .send_request("nope", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::Remote(obj) if obj.code == -32601);
}

#[tokio::test]
async fn decode_error_is_answered() {
    let (a, mut peer) = memory_pair(8);
    let _server = Session::start(a, Arc::new(HandlerRegistry::new()), SessionOptions::default()).await;
    peer.writer
        .send_error(DecodeError::InvalidRequest {
            id: Some(RequestId::Number(5)),
            message: "missing method".into(),
        })
        .await
        .unwrap();
    assert_matches!(next_message(&mut peer).await, Message::Error(e)
        if e.id == Some(RequestId::Number(5)) && e.error.code == -32600);
}

// ── Notifications and progress ──────────────────────────────────────

struct Forward(mpsc::UnboundedSender<String>);

#[async_trait]
impl NotificationHandler for Forward {
    async fn handle(&self, notification: Notification, _session: &Session) {
        let _ = self.0.send(notification.method);
    }
}

#[tokio::test]
async fn notifications_reach_handler_then_fallback() {
    let (known_tx, mut known_rx) = mpsc::unbounded_channel();
    let (fallback_tx, mut fallback_rx) = mpsc::unbounded_channel();
    let mut reg = HandlerRegistry::new();
    reg.register_notification("notifications/initialized", Forward(known_tx));
    reg.set_notification_fallback(Forward(fallback_tx));
    let (client, _server) = connect(reg, HandlerRegistry::new()).await;

    client.send_notification("notifications/initialized", None).await.unwrap();
    client.send_notification("custom/other", Some(json!({}))).await.unwrap();

    let known = tokio::time::timeout(TIMEOUT, known_rx.recv()).await.unwrap();
    assert_eq!(known.as_deref(), Some("notifications/initialized"));
    let other = tokio::time::timeout(TIMEOUT, fallback_rx.recv()).await.unwrap();
    assert_eq!(other.as_deref(), Some("custom/other"));
}

#[tokio::test]
async fn unhandled_notification_is_ignored() {
    let (client, _server) = connect(HandlerRegistry::new(), HandlerRegistry::new()).await;
    client.send_notification("custom/whatever", None).await.unwrap();
    let pong = client.send_request("ping", None, RequestOptions::default()).await;
    assert_eq!(pong.unwrap(), json!({}));
}

/// Answers every notification by pinging the peer, then reports the outcome.
struct PingBack(mpsc::UnboundedSender<Result<Value, SessionError>>);

#[async_trait]
impl NotificationHandler for PingBack {
    async fn handle(&self, _notification: Notification, session: &Session) {
        let options = RequestOptions {
            timeout: Some(Duration::from_secs(2)),
            ..RequestOptions::default()
        };
        let outcome = session.send_request("ping", None, options).await;
        let _ = self.0.send(outcome);
    }
}

#[tokio::test]
async fn notification_handler_may_issue_requests() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut reg = echo_registry();
    reg.register_notification("notifications/initialized", PingBack(tx));
    let (client, server) = connect(reg, HandlerRegistry::new()).await;

    client.send_notification("notifications/initialized", None).await.unwrap();
    let started = std::time::Instant::now();
    let echoed = client
        .send_request("echo", Some(json!({"x": 1})), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(echoed, json!({"x": 1}));
    assert!(started.elapsed() < Duration::from_secs(1));

    let pong = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(pong.unwrap(), json!({}));
    assert_eq!(server.pending_count(), 0);
}

#[tokio::test]
async fn notification_handlers_run_in_arrival_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut reg = HandlerRegistry::new();
    reg.set_notification_fallback(Forward(tx));
    let (client, _server) = connect(reg, HandlerRegistry::new()).await;

    for i in 0..20 {
        client.send_notification(&format!("custom/{i}"), None).await.unwrap();
    }
    for i in 0..20 {
        let method = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(method, format!("custom/{i}"));
    }
}

#[tokio::test]
async fn progress_is_forwarded_in_order() {
    let mut reg = HandlerRegistry::new();
    reg.register_request(
        "work",
        handler_fn(|_, ctx| async move {
            for step in 1..=3 {
                ctx.report_progress(f64::from(step), Some(3.0), Some(&format!("step {step}")))
                    .await?;
            }
            Ok::<_, RpcError>(json!({"done": true}))
        }),
    );
    let (client, _server) = connect(reg, HandlerRegistry::new()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = client
        .send_request("work", None, RequestOptions::default().with_progress(tx))
        .await
        .unwrap();
    assert_eq!(result, json!({"done": true}));

    let mut messages = Vec::new();
    while let Ok(update) = rx.try_recv() {
        messages.push(update.message.unwrap());
    }
    assert_eq!(messages, vec!["step 1", "step 2", "step 3"]);
}

#[tokio::test]
async fn progress_without_token_is_noop() {
    let mut reg = HandlerRegistry::new();
    reg.register_request(
        "work",
        handler_fn(|_, ctx| async move {
            assert!(ctx.progress_token().is_none());
            ctx.report_progress(1.0, None, None).await?;
            Ok::<_, RpcError>(Value::Null)
        }),
    );
    let (client, _server) = connect(reg, HandlerRegistry::new()).await;
    let result = client.send_request("work", None, RequestOptions::default()).await;
    assert_eq!(result.unwrap(), Value::Null);
}

// ── Server-to-client requests ───────────────────────────────────────

#[tokio::test]
async fn elicitation_round_trip() {
    let mut server_reg = HandlerRegistry::new();
    server_reg.register_request(
        "ask",
        handler_fn(|_, ctx| async move {
            let outcome = ctx
                .elicit("Your name?", json!({"type": "object"}))
                .await?;
            Ok::<_, RpcError>(match outcome {
                ElicitOutcome::Accepted(content) => content,
                ElicitOutcome::Declined => json!("declined"),
                ElicitOutcome::Cancelled => json!("cancelled"),
            })
        }),
    );
    let mut client_reg = HandlerRegistry::new();
    client_reg.register_request(
        "elicitation/create",
        handler_fn(|params, _| async move {
            assert_eq!(params.unwrap()["message"], "Your name?");
            Ok::<_, RpcError>(json!({"action": "accept", "content": {"name": "tern"}}))
        }),
    );
    let (client, _server) = connect(server_reg, client_reg).await;
    let result = client.send_request("ask", None, RequestOptions::default()).await;
    assert_eq!(result.unwrap(), json!({"name": "tern"}));
}

#[tokio::test]
async fn related_messages_carry_request_id() {
    let mut reg = HandlerRegistry::new();
    reg.register_request(
        "chatty",
        handler_fn(|_, ctx| async move {
            ctx.send_notification("notifications/message", Some(json!({"level": "info"})))
                .await?;
            Ok::<_, RpcError>(Value::Null)
        }),
    );
    let (a, mut peer) = memory_pair(8);
    let _server = Session::start(a, Arc::new(reg), SessionOptions::default()).await;
    peer.writer.send(Message::request("c1", "chatty", None).into()).await.unwrap();

    let first: SessionMessage = peer.reader.recv().await.unwrap().unwrap();
    assert_eq!(first.message.method(), Some("notifications/message"));
    assert_eq!(first.metadata.related_request_id, Some(RequestId::from("c1")));
    let second = peer.reader.recv().await.unwrap().unwrap();
    assert!(second.message.is_terminal_for(&RequestId::from("c1")));
    assert_eq!(second.metadata.related_request_id, Some(RequestId::from("c1")));
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test]
async fn close_fails_pending_with_connection_closed() {
    let (client, mut peer) = with_raw_peer().await;
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.send_request("never", None, RequestOptions::default()).await }
    });
    let _request = next_message(&mut peer).await;

    client.close();
    assert_matches!(call.await.unwrap(), Err(SessionError::ConnectionClosed));
    assert!(client.is_closed());
    assert_matches!(
        client.send_request("ping", None, RequestOptions::default()).await,
        Err(SessionError::ConnectionClosed)
    );
    // Write side closed: the peer sees end of stream.
    assert!(peer.reader.recv().await.is_none());
}

#[tokio::test]
async fn peer_disconnect_tears_session_down() {
    let (client, mut peer) = with_raw_peer().await;
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.send_request("never", None, RequestOptions::default()).await }
    });
    let _request = next_message(&mut peer).await;
    drop(peer);

    assert_matches!(call.await.unwrap(), Err(SessionError::ConnectionClosed));
    tokio::time::timeout(TIMEOUT, client.closed()).await.unwrap();
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn close_cancels_in_flight_handlers() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let mut reg = HandlerRegistry::new();
    reg.register_request(
        "wait",
        handler_fn(move |_, ctx| {
            let seen_tx = seen_tx.clone();
            async move {
                ctx.cancelled().await;
                let _ = seen_tx.send(());
                Ok::<_, RpcError>(Value::Null)
            }
        }),
    );
    let (a, peer) = memory_pair(8);
    let server = Session::start(a, Arc::new(reg), SessionOptions::default()).await;
    peer.writer.send(Message::request(1, "wait", None).into()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    server.close();
    let seen = tokio::time::timeout(TIMEOUT, seen_rx.recv()).await.unwrap();
    assert_eq!(seen, Some(()));
    assert!(server.is_closed());
}
