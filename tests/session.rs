//! Session tests: two sessions talking to each other, or one session
//! talking to a peer that writes raw frames.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream;
use muxrpc::codec::{Body, CallRequest};
use muxrpc::protocol::{Frame, FrameBuffer, GOODBYE};
use muxrpc::{
    CallKind, CallOutcome, CloseReason, ErrorClass, HandlerError, Manifest, MuxrpcError,
    RemoteError, Session, SessionBuilder, SessionObserver, Source,
};
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn hello_server() -> SessionBuilder {
    Session::builder()
        .handle_async("hello", |(a, b): (String, String)| async move {
            Ok::<_, HandlerError>(format!("hello, {a} and {b}!"))
        })
        .handle_source("stuff", |_: ()| {
            stream::iter(
                (1..=4)
                    .map(|a| Ok::<_, HandlerError>(json!({ "a": a })))
                    .collect::<Vec<_>>(),
            )
        })
}

fn hello_client() -> SessionBuilder {
    Session::builder()
        .declare("hello", CallKind::Async)
        .declare("stuff", CallKind::Source)
}

fn pair(server: SessionBuilder, client: SessionBuilder) -> (Session, Session) {
    let (a, b) = duplex(64 * 1024);
    let server = server.spawn(a).unwrap();
    let client = client.spawn(b).unwrap();
    (server, client)
}

/// A peer that reads and writes raw frames.
struct RawPeer {
    io: DuplexStream,
    buffer: FrameBuffer,
    pending: VecDeque<Frame>,
}

impl RawPeer {
    fn connect(builder: SessionBuilder) -> (Session, RawPeer) {
        let (a, b) = duplex(64 * 1024);
        let session = builder.spawn(a).unwrap();
        let peer = RawPeer {
            io: b,
            buffer: FrameBuffer::new(),
            pending: VecDeque::new(),
        };
        (session, peer)
    }

    async fn send(&mut self, frame: Frame) {
        self.io.write_all(&frame.encode()).await.unwrap();
    }

    /// Next frame, or `None` once the session stops writing.
    async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            let mut buf = [0u8; 4096];
            let n = self.io.read(&mut buf).await.unwrap();
            if n == 0 {
                return None;
            }
            self.pending.extend(self.buffer.push(&buf[..n]).unwrap());
        }
    }

    async fn expect_frame(&mut self) -> Frame {
        timeout(WAIT, self.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
    }
}

fn call_frame(request_id: i32, method: &str, args: Value, kind: CallKind) -> Frame {
    let body = CallRequest::new(method, args, kind).to_body().unwrap();
    Frame::new(request_id, body).with_stream(kind.is_stream())
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SessionObserver for Recorder {
    fn call_started(&self, _request_id: i32, method: &str, kind: CallKind) {
        self.events.lock().unwrap().push(format!("started {method} {kind}"));
    }

    fn call_completed(
        &self,
        _request_id: i32,
        method: &str,
        outcome: &CallOutcome,
        _elapsed: Duration,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(format!("completed {method} {outcome:?}"));
    }

    fn inbound_call(&self, _request_id: i32, method: &str, kind: CallKind) {
        self.events.lock().unwrap().push(format!("inbound {method} {kind}"));
    }

    fn protocol_error(&self, _error: &MuxrpcError) {
        self.events.lock().unwrap().push("protocol error".to_string());
    }

    fn session_closed(&self, reason: &CloseReason) {
        self.events.lock().unwrap().push(format!("closed {reason}"));
    }
}

#[tokio::test]
async fn test_hello() {
    let (_server, client) = pair(hello_server(), hello_client());

    let greeting: String = client.request("hello", &("Bob", "Alice")).await.unwrap();
    assert_eq!(greeting, "hello, Bob and Alice!");
}

#[tokio::test]
async fn test_stuff_yields_values_then_end() {
    let (_server, client) = pair(hello_server(), hello_client());

    let mut source = client.source("stuff", &()).await.unwrap();
    let mut values = Vec::new();
    while let Some(value) = source.next_as::<Value>().await {
        values.push(value.unwrap());
    }

    assert_eq!(
        values,
        vec![json!({"a":1}), json!({"a":2}), json!({"a":3}), json!({"a":4})]
    );
    assert!(source.is_done());
    assert!(source.next().await.is_none());
}

#[tokio::test]
async fn test_undeclared_method_writes_nothing() {
    let (session, mut peer) = RawPeer::connect(hello_client());

    let err = session.async_call("missing", &()).await.unwrap_err();
    assert!(matches!(err, MuxrpcError::MethodNotFound(ref m) if m == "missing"));
    assert_eq!(err.class(), ErrorClass::Usage);

    let read = timeout(Duration::from_millis(100), peer.recv()).await;
    assert!(read.is_err(), "no bytes should reach the peer");
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_kind_mismatch_is_usage_error() {
    let (session, _peer) = RawPeer::connect(hello_client());

    let err = session.source("hello", &()).await.unwrap_err();
    assert!(matches!(err, MuxrpcError::KindMismatch { .. }));
    assert_eq!(session.pending_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_calls_are_not_cross_delivered() {
    let (session, mut peer) = RawPeer::connect(Session::builder().declare("echo", CallKind::Async));

    let mut responses = Vec::new();
    for i in 0..10 {
        responses.push((i, session.async_call("echo", &[i]).await.unwrap()));
    }

    let mut requests = Vec::new();
    for _ in 0..10 {
        let frame = peer.expect_frame().await;
        let request = CallRequest::from_body(&frame.body).unwrap();
        assert_eq!(request.method(), "echo");
        requests.push((frame.request_id, request.args[0].clone()));
    }

    // Answer in reverse order
    for (request_id, arg) in requests.into_iter().rev() {
        peer.send(Frame::new(-request_id, Body::json(&arg).unwrap())).await;
    }

    for (i, response) in responses {
        let value: i64 = timeout(WAIT, response.decode()).await.unwrap().unwrap();
        assert_eq!(value, i);
    }
    assert_eq!(session.pending_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_calls_between_sessions() {
    let server = Session::builder().handle_async("double", |n: i64| async move {
        tokio::time::sleep(Duration::from_millis((10 - n as u64) * 2)).await;
        Ok::<_, HandlerError>(n * 2)
    });
    let (_server, client) = pair(server, Session::builder().declare("double", CallKind::Async));

    let calls = (0..10).map(|n| {
        let client = client.clone();
        async move { (n, client.request::<i64, _>("double", &n).await.unwrap()) }
    });
    for (n, doubled) in futures::future::join_all(calls).await {
        assert_eq!(doubled, n * 2);
    }
}

#[tokio::test]
async fn test_unknown_response_id_closes_session() {
    let recorder = Recorder::default();
    let client = hello_client()
        .declare("collect", CallKind::Sink)
        .observer(recorder.clone());
    let (session, mut peer) = RawPeer::connect(client);

    let first = session.async_call("hello", &("Bob", "Alice")).await.unwrap();
    let second = session.async_call("hello", &("Carol", "Dave")).await.unwrap();
    let mut stuff = session.source("stuff", &()).await.unwrap();
    let sink = session.sink("collect", &()).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(peer.expect_frame().await.request_id);
    }
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(session.pending_calls(), 4);

    // One value reaches the source before the session fails
    let value = Frame::new(-3, Body::json(&json!({"a": 1})).unwrap()).with_stream(true);
    peer.send(value).await;
    peer.send(Frame::new(-99, Body::json(&1).unwrap())).await;

    let err = timeout(WAIT, first).await.unwrap().unwrap_err();
    assert!(matches!(err, MuxrpcError::ConnectionClosed));
    let err = timeout(WAIT, second).await.unwrap().unwrap_err();
    assert!(matches!(err, MuxrpcError::ConnectionClosed));

    let value: Value = timeout(WAIT, stuff.next_as()).await.unwrap().unwrap().unwrap();
    assert_eq!(value, json!({"a": 1}));
    let err = timeout(WAIT, stuff.next()).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, MuxrpcError::ConnectionClosed));
    assert!(stuff.next().await.is_none());

    let err = timeout(WAIT, sink.finish()).await.unwrap().unwrap_err();
    assert!(matches!(err, MuxrpcError::ConnectionClosed));

    timeout(WAIT, session.closed()).await.unwrap();
    assert_eq!(session.pending_calls(), 0);

    // The peer sees the write half shut down without a goodbye
    assert!(timeout(WAIT, peer.recv()).await.unwrap().is_none());
    assert!(!peer.buffer.saw_goodbye());

    let events = recorder.events();
    assert!(events.contains(&"protocol error".to_string()));
    assert!(events.iter().any(|e| e.starts_with("closed protocol error")));

    let err = session.async_call("hello", &("a", "b")).await.unwrap_err();
    assert!(matches!(err, MuxrpcError::ConnectionClosed));
}

#[tokio::test]
async fn test_duplicate_inbound_id_closes_session() {
    let (session, mut peer) = RawPeer::connect(hello_server());

    peer.send(call_frame(1, "hello", json!(["Bob", "Alice"]), CallKind::Async))
        .await;
    let reply = peer.expect_frame().await;
    assert_eq!(reply.request_id, -1);
    assert_eq!(reply.body.decode::<String>().unwrap(), "hello, Bob and Alice!");

    peer.send(call_frame(1, "hello", json!(["Bob", "Alice"]), CallKind::Async))
        .await;
    timeout(WAIT, session.closed()).await.unwrap();
}

#[tokio::test]
async fn test_handler_error_is_remote_and_session_survives() {
    let server = hello_server().handle_async("fail", |_: ()| async move {
        Err::<(), _>(HandlerError::new("nope"))
    });
    let client = hello_client().declare("fail", CallKind::Async);
    let (_server, client) = pair(server, client);

    let err = client.request::<Value, _>("fail", &()).await.unwrap_err();
    match err {
        MuxrpcError::Remote(remote) => {
            assert_eq!(remote.name, "Error");
            assert_eq!(remote.message, "nope");
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    let greeting: String = client.request("hello", &("Bob", "Alice")).await.unwrap();
    assert_eq!(greeting, "hello, Bob and Alice!");
}

#[tokio::test]
async fn test_peer_without_method_answers_with_error() {
    let client = hello_client().declare("nothere", CallKind::Async);
    let (_server, client) = pair(hello_server(), client);

    let err = client.request::<Value, _>("nothere", &()).await.unwrap_err();
    match err {
        MuxrpcError::Remote(remote) => assert_eq!(remote.message, "No such method: nothere"),
        other => panic!("expected remote error, got {other:?}"),
    }
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_inbound_kind_mismatch_rejected() {
    let (_session, mut peer) = RawPeer::connect(hello_server());

    peer.send(call_frame(1, "hello", json!(["Bob", "Alice"]), CallKind::Source))
        .await;
    let reply = peer.expect_frame().await;

    assert_eq!(reply.request_id, -1);
    assert!(reply.stream && reply.end);
    let err = RemoteError::from_end_body(&reply.body).unwrap();
    assert!(err.message.contains("hello"));
}

#[tokio::test]
async fn test_go_client_json_type_is_async() {
    let (session, mut peer) = RawPeer::connect(hello_server());

    let body = json!({"name": ["hello"], "args": ["Bob", "Alice"], "type": "JSON"});
    peer.send(Frame::new(1, Body::json(&body).unwrap())).await;

    let reply = peer.expect_frame().await;
    assert_eq!(reply.request_id, -1);
    assert!(!reply.stream && !reply.end);
    assert_eq!(reply.body.decode::<String>().unwrap(), "hello, Bob and Alice!");
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_source_error_ends_stream() {
    let server = Session::builder().handle_source("broken", |_: ()| {
        stream::iter(vec![
            Ok(json!(1)),
            Err(HandlerError::new("boom")),
            Ok(json!(2)),
        ])
    });
    let client = Session::builder().declare("broken", CallKind::Source);
    let (_server, client) = pair(server, client);

    let mut source = client.source("broken", &()).await.unwrap();
    assert_eq!(source.next_as::<i64>().await.unwrap().unwrap(), 1);
    match source.next().await {
        Some(Err(MuxrpcError::Remote(remote))) => assert_eq!(remote.message, "boom"),
        other => panic!("expected remote error, got {other:?}"),
    }
    assert!(source.next().await.is_none());
}

#[tokio::test]
async fn test_sink_call() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let server = Session::builder().handle_sink("collect", {
        let received = received.clone();
        move |_: (), input: Source| {
            let received = received.clone();
            async move {
                let values: Vec<i64> = input.collect_as().await?;
                received.lock().unwrap().extend(values);
                Ok::<(), HandlerError>(())
            }
        }
    });
    let client = Session::builder().declare("collect", CallKind::Sink);
    let (_server, client) = pair(server, client);

    let mut sink = client.sink("collect", &()).await.unwrap();
    for n in [1, 2, 3] {
        sink.send(&n).await.unwrap();
    }
    timeout(WAIT, sink.finish()).await.unwrap().unwrap();

    assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_duplex_echo() {
    let server = Session::builder().handle_duplex("echo", |_: (), ctx| async move {
        let mut input = ctx
            .take_input()
            .ok_or_else(|| HandlerError::new("no input"))?;
        while let Some(body) = input.next().await {
            ctx.chunk_body(body?).await?;
        }
        ctx.end().await?;
        Ok::<(), HandlerError>(())
    });
    let client = Session::builder().declare("echo", CallKind::Duplex);
    let (_server, client) = pair(server, client);

    let (mut sink, source) = client.duplex("echo", &()).await.unwrap().split();
    sink.send("a").await.unwrap();
    sink.send("b").await.unwrap();
    sink.close().await.unwrap();

    let echoed: Vec<String> = timeout(WAIT, source.collect_as()).await.unwrap().unwrap();
    assert_eq!(echoed, vec!["a", "b"]);
}

#[tokio::test]
async fn test_goodbye_closes_session() {
    let (session, mut peer) = RawPeer::connect(hello_client());

    let response = session.async_call("hello", &("Bob", "Alice")).await.unwrap();
    peer.expect_frame().await;
    peer.io.write_all(&GOODBYE).await.unwrap();

    timeout(WAIT, session.closed()).await.unwrap();
    let err = timeout(WAIT, response).await.unwrap().unwrap_err();
    assert!(matches!(err, MuxrpcError::ConnectionClosed));
}

#[tokio::test]
async fn test_close_sends_goodbye() {
    let (session, mut peer) = RawPeer::connect(hello_client());

    timeout(WAIT, session.close()).await.unwrap();
    assert!(session.is_closed());

    assert!(timeout(WAIT, peer.recv()).await.unwrap().is_none());
    assert!(peer.buffer.saw_goodbye());
}

#[tokio::test]
async fn test_close_without_goodbye() {
    let (session, mut peer) = RawPeer::connect(hello_client().goodbye_on_close(false));

    timeout(WAIT, session.close()).await.unwrap();

    assert!(timeout(WAIT, peer.recv()).await.unwrap().is_none());
    assert!(!peer.buffer.saw_goodbye());
}

#[tokio::test]
async fn test_closing_one_side_closes_the_other() {
    let (server, client) = pair(hello_server(), hello_client());

    client.close().await;
    timeout(WAIT, server.closed()).await.unwrap();
}

#[tokio::test]
async fn test_handler_capacity() {
    let release = Arc::new(tokio::sync::Notify::new());
    let server = Session::builder()
        .max_concurrent_handlers(1)
        .handle_async("wait", {
            let release = release.clone();
            move |_: ()| {
                let release = release.clone();
                async move {
                    release.notified().await;
                    Ok::<_, HandlerError>("done")
                }
            }
        });
    let (_session, mut peer) = RawPeer::connect(server);

    peer.send(call_frame(1, "wait", json!([]), CallKind::Async)).await;
    peer.send(call_frame(2, "wait", json!([]), CallKind::Async)).await;

    let rejected = peer.expect_frame().await;
    assert_eq!(rejected.request_id, -2);
    assert!(rejected.end);
    assert_eq!(
        RemoteError::from_body(&rejected.body).message,
        "Too many concurrent calls"
    );

    release.notify_one();
    let done = peer.expect_frame().await;
    assert_eq!(done.request_id, -1);
    assert_eq!(done.body.decode::<String>().unwrap(), "done");
}

#[tokio::test]
async fn test_observer_records_calls() {
    let recorder = Recorder::default();
    let (_server, client) = pair(hello_server(), hello_client().observer(recorder.clone()));

    let _: String = client.request("hello", &("Bob", "Alice")).await.unwrap();
    client.close().await;

    assert_eq!(
        recorder.events(),
        vec![
            "started hello async".to_string(),
            "completed hello Completed".to_string(),
            "closed closed locally".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_manifest_method() {
    let server = hello_server().serve_manifest(true);
    let client = Session::builder().declare("manifest", CallKind::Async);
    let (_server, client) = pair(server, client);

    let value: Value = client.request("manifest", &()).await.unwrap();
    let manifest = Manifest::from_json(&value).unwrap();

    assert_eq!(manifest.get("hello"), Some(CallKind::Async));
    assert_eq!(manifest.get("stuff"), Some(CallKind::Source));
    assert_eq!(manifest.get("manifest"), Some(CallKind::Async));
}

#[tokio::test]
async fn test_attached_session_reassembles_split_frames() {
    let session = hello_client().attach(tokio::io::sink()).unwrap();

    let response = session.async_call("hello", &("Bob", "Alice")).await.unwrap();
    let reply = Frame::new(-1, Body::text("hi")).encode();
    let (head, tail) = reply.split_at(4);

    session.on_bytes(head).await.unwrap();
    session.on_bytes(tail).await.unwrap();

    let value: String = timeout(WAIT, response.decode()).await.unwrap().unwrap();
    assert_eq!(value, "hi");
}

#[tokio::test]
async fn test_attached_session_truncated_input() {
    let session = hello_client().attach(tokio::io::sink()).unwrap();

    let reply = Frame::new(-1, Body::text("hi")).encode();
    session.on_bytes(&reply[..5]).await.unwrap();

    let err = session.on_eof().await.unwrap_err();
    assert!(matches!(err, MuxrpcError::Protocol(_)));
    assert!(session.is_closed());
}
