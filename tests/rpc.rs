use std::sync::Arc;
use std::time::Duration;

mod support;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use mamont_rpc::protocol::rpc::{
    self, read_record, read_record_limited, write_fragment, CallTracker, Context,
    SocketMessageHandler, SocketMessageType,
};
use mamont_rpc::xdr::rpc::{call_stat, make_call, make_cancel, reply_body, rpc_body, rpc_msg};
use mamont_rpc::xdr::{self, Serialize};
use mamont_rpc::{Codec, Message, Value, XdrCodec};

use support::{greeter_handlers, hello, registry, start_greeter};

fn test_context() -> Context {
    let (handlers, _) = greeter_handlers(registry());
    Context {
        local_port: 0,
        client_addr: "127.0.0.1:1234".to_string(),
        handlers: Arc::new(handlers),
        call_tracker: Arc::new(CallTracker::new()),
    }
}

fn session(
    context: &Context,
) -> (SocketMessageHandler<DuplexStream>, DuplexStream, mpsc::UnboundedReceiver<SocketMessageType>)
{
    let (server_side, client_side) = tokio::io::duplex(64 * 1024);
    let (handler, replies) = SocketMessageHandler::new(server_side, context);
    (handler, client_side, replies)
}

fn encode_request(method: &str, message: &Message) -> Vec<u8> {
    let registry = registry();
    let (_, request, _) = registry.resolve_method("Greeter", method).expect("method");
    XdrCodec::new(registry.clone()).encode(message, &request).expect("encode request")
}

async fn send(socket: &mut DuplexStream, msg: &rpc_msg) {
    let mut buf = Vec::new();
    msg.serialize(&mut buf).expect("serialize rpc_msg");
    write_fragment(socket, &buf).await.expect("write record");
}

async fn next_reply(replies: &mut mpsc::UnboundedReceiver<SocketMessageType>) -> rpc_msg {
    let response = timeout(Duration::from_secs(2), replies.recv())
        .await
        .expect("response timeout")
        .expect("response channel closed")
        .expect("response error");
    xdr::from_bytes::<rpc_msg>(&response).expect("deserialize reply")
}

fn failure_stat(reply: &rpc_msg) -> call_stat {
    match &reply.body {
        rpc_body::REPLY(reply_body::FAILURE(failure)) => failure.stat,
        other => panic!("expected failure reply, got {other:?}"),
    }
}

#[tokio::test]
async fn rejects_oversized_rpc_fragment() {
    let context = test_context();
    let (mut handler, mut client, _replies) = session(&context);

    let oversized = rpc::MAX_RPC_RECORD_LENGTH + 1;
    let fragment_header = (1_u32 << 31) | (oversized as u32);
    client.write_all(&fragment_header.to_be_bytes()).await.expect("write fragment header");

    let err = handler.read().await.expect_err("expected oversize error");
    assert!(err.to_string().contains("exceeds max"), "unexpected error: {err:?}");
}

#[tokio::test]
async fn limited_read_rejects_header_before_body_arrives() {
    let (mut server, mut client) = tokio::io::duplex(1024);
    client.write_all(&0x80FF_FFFF_u32.to_be_bytes()).await.unwrap();

    // No body is ever written, so only the header check can end the read.
    let err = timeout(Duration::from_secs(1), read_record_limited(&mut server, 64))
        .await
        .expect("read waited for the body")
        .expect_err("oversized header");
    assert!(err.to_string().contains("exceeds max 64"), "unexpected error: {err:?}");
}

#[tokio::test]
async fn oversized_session_hello_drops_connection() {
    let (server, _) = start_greeter(None).await;
    let mut socket = TcpStream::connect(&server.address).await.expect("connect");
    socket.write_all(&0x80FF_FFFF_u32.to_be_bytes()).await.expect("write header");

    // Well inside the handshake timeout.
    let mut buf = [0_u8; 16];
    let read = timeout(Duration::from_secs(2), socket.read(&mut buf))
        .await
        .expect("server kept the connection open");
    assert!(matches!(read, Ok(0) | Err(_)), "unexpected read: {read:?}");
    server.shutdown().await;
}

#[tokio::test]
async fn assembles_multi_fragment_records() {
    let (mut server, mut client) = tokio::io::duplex(1024);

    client.write_all(&3_u32.to_be_bytes()).await.unwrap();
    client.write_all(b"abc").await.unwrap();
    client.write_all(&((1_u32 << 31) | 2).to_be_bytes()).await.unwrap();
    client.write_all(b"de").await.unwrap();

    let record = read_record(&mut server).await.expect("record");
    assert_eq!(record, b"abcde");
}

#[tokio::test]
async fn write_fragment_marks_last_fragment() {
    let (mut server, mut client) = tokio::io::duplex(1024);
    write_fragment(&mut client, b"hello").await.expect("write");

    let mut header = [0_u8; 4];
    tokio::io::AsyncReadExt::read_exact(&mut server, &mut header).await.unwrap();
    assert_eq!(u32::from_be_bytes(header), (1 << 31) | 5);
}

#[tokio::test]
async fn dispatches_call_to_bound_handler() {
    let context = test_context();
    let (mut handler, mut client, mut replies) = session(&context);

    let payload = encode_request("SayHello", &hello("foo"));
    send(&mut client, &make_call(7, "Greeter", "SayHello", 0, payload)).await;
    handler.read().await.expect("handler read");

    let reply = next_reply(&mut replies).await;
    assert_eq!(reply.xid, 7);
    let payload = match reply.body {
        rpc_body::REPLY(reply_body::SUCCESS(payload)) => payload,
        other => panic!("expected success, got {other:?}"),
    };
    let registry = registry();
    let (_, _, response) = registry.resolve_method("Greeter", "SayHello").unwrap();
    let message = XdrCodec::new(registry.clone()).decode(&payload, &response).unwrap();
    assert_eq!(message.get_str("greeting"), Some("bar"));
    assert_eq!(context.call_tracker.in_flight(), 0);
}

#[tokio::test]
async fn answers_ping_with_empty_success() {
    let context = test_context();
    let (mut handler, mut client, mut replies) = session(&context);

    send(&mut client, &make_call(1, "", "", 0, Vec::new())).await;
    handler.read().await.expect("handler read");

    let reply = next_reply(&mut replies).await;
    assert_eq!(reply.body, rpc_body::REPLY(reply_body::SUCCESS(Vec::new())));
}

#[tokio::test]
async fn returns_rpc_mismatch_for_unsupported_version() {
    let context = test_context();
    let (mut handler, mut client, mut replies) = session(&context);

    let mut msg = make_call(42, "Greeter", "SayHello", 0, Vec::new());
    if let rpc_body::CALL(call) = &mut msg.body {
        call.rpcvers = 99;
    }
    send(&mut client, &msg).await;
    handler.read().await.expect("handler read");

    let reply = next_reply(&mut replies).await;
    assert_eq!(reply.xid, 42);
    assert_eq!(failure_stat(&reply), call_stat::RPC_MISMATCH);
}

#[tokio::test]
async fn reports_unimplemented_and_garbage_args() {
    let context = test_context();
    let (mut handler, mut client, mut replies) = session(&context);

    send(&mut client, &make_call(1, "Greeter", "Unbound", 0, Vec::new())).await;
    handler.read().await.expect("handler read");
    assert_eq!(failure_stat(&next_reply(&mut replies).await), call_stat::UNIMPLEMENTED);

    send(&mut client, &make_call(2, "Greeter", "SayHello", 0, vec![0, 0, 0, 1])).await;
    handler.read().await.expect("handler read");
    assert_eq!(failure_stat(&next_reply(&mut replies).await), call_stat::GARBAGE_ARGS);
}

#[tokio::test]
async fn cancel_frame_reaches_handler() {
    let context = test_context();
    let (mut handler, mut client, mut replies) = session(&context);

    let payload = encode_request("Slow", &Message::new().with("millis", Value::UInt32(10_000)));
    send(&mut client, &make_call(5, "Greeter", "Slow", 0, payload)).await;
    handler.read().await.expect("handler read");
    assert_eq!(context.call_tracker.in_flight(), 1);

    send(&mut client, &make_cancel(5)).await;
    handler.read().await.expect("handler read");

    let reply = next_reply(&mut replies).await;
    assert_eq!(reply.xid, 5);
    assert_eq!(failure_stat(&reply), call_stat::CANCELLED);
    assert_eq!(context.call_tracker.in_flight(), 0);

    // Cancelling a finished call is harmless.
    send(&mut client, &make_cancel(5)).await;
    handler.read().await.expect("handler read");
}

#[tokio::test]
async fn propagated_deadline_cancels_handler() {
    let context = test_context();
    let (mut handler, mut client, mut replies) = session(&context);

    let payload = encode_request("Slow", &Message::new().with("millis", Value::UInt32(10_000)));
    send(&mut client, &make_call(6, "Greeter", "Slow", 50, payload)).await;
    handler.read().await.expect("handler read");

    assert_eq!(failure_stat(&next_reply(&mut replies).await), call_stat::CANCELLED);
}

#[tokio::test]
async fn rejects_reply_sent_to_server() {
    let context = test_context();
    let (mut handler, mut client, _replies) = session(&context);

    send(&mut client, &xdr::rpc::make_success_reply(1, Vec::new())).await;
    assert!(handler.read().await.is_err());
}

#[tokio::test]
async fn rejects_malformed_frame() {
    let context = test_context();
    let (mut handler, mut client, _replies) = session(&context);

    write_fragment(&mut client, &[0, 0, 0, 1, 0, 0, 0, 7]).await.unwrap();
    let err = handler.read().await.expect_err("malformed");
    assert!(err.to_string().contains("Malformed"), "unexpected error: {err:?}");
}

#[test]
fn call_tracker_drops_duplicate_xids() {
    let tracker = CallTracker::new();
    let first = tracker.begin(1).expect("first call");
    assert!(tracker.begin(1).is_none());
    assert!(tracker.begin(2).is_some());
    assert_eq!(tracker.in_flight(), 2);

    assert!(tracker.cancel(1));
    assert!(*first.borrow());
    assert!(!tracker.cancel(3));

    tracker.finish(1);
    assert!(tracker.begin(1).is_some());

    tracker.cancel_all();
    tracker.finish(1);
    tracker.finish(2);
    assert_eq!(tracker.in_flight(), 0);
}
