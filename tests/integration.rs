//! Integration tests for rpcwire.
//!
//! Codec-level checks run on in-memory frames; transport checks run a real
//! client and server over loopback TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rpcwire::codec::{compression_id, serialization_id, PluginRegistry};
use rpcwire::protocol::{
    AttrValue, AuthResult, Authentication, FrameCodec, Header, Invocation, Message, MsgType,
    Negotiation, Payload, Session,
};
use rpcwire::{Client, CodecConfig, ConnState, RpcError, Server};

fn codec() -> FrameCodec {
    FrameCodec::new(Arc::new(PluginRegistry::with_defaults()), CodecConfig::default())
}

/// Decode the single frame contained in `bytes`.
fn decode_one(codec: &FrameCodec, bytes: &[u8]) -> Result<Option<Message>, rpcwire::CodecError> {
    let mut buffer = codec.frame_buffer();
    let mut frames = buffer.push(bytes)?;
    assert_eq!(frames.len(), 1);
    codec.decode(frames.remove(0))
}

async fn echo_server() -> Server {
    Server::builder("127.0.0.1:0")
        .on_invoke(|inv, _ctx| async move {
            if inv.method == "fail" {
                return Err(RpcError::Protocol("refusing to fail".into()));
            }
            if inv.method == "slow" {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            Ok(serde_json::json!(inv.args))
        })
        .bind()
        .await
        .unwrap()
}

async fn connect(server: &Server) -> Client {
    Client::builder(server.local_addr().to_string())
        .connect()
        .await
        .unwrap()
}

// ============================================================================
// Codec
// ============================================================================

/// BizReq 42 on session 7 with one string attribute.
#[test]
fn test_example_request_frame() {
    let codec = codec();
    let header = Header::new(MsgType::BizReq, 42)
        .with_session_id(7)
        .with_serialization(serialization_id::MSGPACK)
        .with_compression(compression_id::NONE)
        .with_attribute(1, "tenant-A");
    let invocation = Invocation::new("com.acme.Greeter", "greet").with_arg("world");

    let (encoded, bytes) = codec
        .encode_to_bytes(Message::request(header, Payload::from(invocation.clone())))
        .unwrap();

    // 18 fixed bytes + key(1) + tag(1) + len(2) + "tenant-A"(8)
    assert_eq!(encoded.header_length(), 30);
    assert_eq!(encoded.compression, compression_id::NONE);

    let msg = decode_one(&codec, &bytes).unwrap().unwrap();
    assert!(msg.is_request());
    assert_eq!(msg.msg_id(), 42);
    assert_eq!(msg.header().session_id, 7);
    assert_eq!(msg.header().compression, compression_id::NONE);
    assert_eq!(
        msg.header().attributes().get(1),
        Some(AttrValue::Str("tenant-A".into()))
    );
    assert_eq!(msg.payload(), Some(&Payload::Invocation(invocation)));
}

#[test]
fn test_attribute_widths_survive() {
    let codec = codec();
    let header = Header::new(MsgType::NegotiationReq, 3)
        .with_serialization(serialization_id::JSON)
        .with_attribute(1, 70_000i32)
        .with_attribute(2, -300i16)
        .with_attribute(3, 7i8)
        .with_attribute(4, "label");
    let sent = header.attributes().snapshot();

    let (_, bytes) = codec
        .encode_to_bytes(Message::request(header, Payload::from(Negotiation::default())))
        .unwrap();
    let msg = decode_one(&codec, &bytes).unwrap().unwrap();

    assert_eq!(msg.header().attributes().snapshot(), sent);
    assert_eq!(msg.header().attributes().get(2), Some(AttrValue::Int16(-300)));
    assert_eq!(msg.header().attributes().get(3), Some(AttrValue::Int8(7)));
}

#[test]
fn test_unknown_message_type_rejected() {
    let codec = codec();
    let header = Header::new(MsgType::HeartbeatReq, 5).with_serialization(serialization_id::MSGPACK);
    let (_, bytes) = codec.encode_to_bytes(Message::request(header, None)).unwrap();

    // magic(2) + length(4) + header length(2) puts the type byte at 8
    let mut patched = bytes.to_vec();
    patched[8] = 0x7F;

    let err = decode_one(&codec, &patched).unwrap_err();
    assert!(err.is_format());
    assert!(err.message().contains("0x7F"));
}

#[test]
fn test_compression_only_above_threshold() {
    let codec = codec();
    let request = |id: u32, arg: String| {
        Message::request(
            Header::new(MsgType::BizReq, id)
                .with_serialization(serialization_id::MSGPACK)
                .with_compression(compression_id::GZIP),
            Payload::from(Invocation::new("svc", "put").with_arg(arg)),
        )
    };

    let (small, small_bytes) = codec.encode_to_bytes(request(1, "tiny".into())).unwrap();
    assert_eq!(small.compression, compression_id::NONE);
    let decoded = decode_one(&codec, &small_bytes).unwrap().unwrap();
    assert_eq!(decoded.header().compression, compression_id::NONE);

    let (large, large_bytes) = codec.encode_to_bytes(request(2, "x".repeat(8192))).unwrap();
    assert_eq!(large.compression, compression_id::GZIP);
    assert!(large_bytes.len() < 8192);
    let decoded = decode_one(&codec, &large_bytes).unwrap().unwrap();
    assert_eq!(decoded.header().compression, compression_id::GZIP);
    let inv = decoded.payload().and_then(Payload::as_invocation).unwrap();
    assert_eq!(inv.args[0].as_str().map(str::len), Some(8192));
}

/// Frames split at every byte boundary still decode.
#[test]
fn test_fragmented_frames() {
    let codec = codec();
    let mut wire = Vec::new();
    for id in 1..=3 {
        let header = Header::new(MsgType::BizReq, id).with_serialization(serialization_id::JSON);
        let inv = Invocation::new("svc", "m").with_arg(id);
        let (_, bytes) = codec
            .encode_to_bytes(Message::request(header, Payload::from(inv)))
            .unwrap();
        wire.extend_from_slice(&bytes);
    }

    let mut buffer = codec.frame_buffer();
    let mut frames = Vec::new();
    for byte in &wire {
        frames.extend(buffer.push(std::slice::from_ref(byte)).unwrap());
    }

    assert_eq!(frames.len(), 3);
    for (i, frame) in frames.into_iter().enumerate() {
        let msg = codec.decode(frame).unwrap().unwrap();
        assert_eq!(msg.msg_id(), i as u32 + 1);
    }
}

// ============================================================================
// Transport
// ============================================================================

#[tokio::test]
async fn test_invoke_over_tcp() {
    let server = echo_server().await;
    let client = connect(&server).await;

    let result = client
        .invoke(Invocation::new("echo", "echo").with_arg("hi").with_arg(2))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!(["hi", 2]));

    let err = client.invoke(Invocation::new("echo", "fail")).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(msg) if msg.contains("refusing to fail")));

    assert!(client.heartbeat().await.is_ok());
    assert_eq!(server.connection_count(), 1);

    client.close(true).await;
    assert_eq!(client.state(), ConnState::Closed);
    server.close(true).await;
}

#[tokio::test]
async fn test_timeout_then_late_reply_is_ignored() {
    let server = echo_server().await;
    let client = connect(&server).await;

    let err = client
        .invoke_with_timeout(
            Invocation::new("echo", "slow"),
            Some(Duration::from_millis(30)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // Let the late reply arrive; it must not disturb the next call.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let result = client
        .invoke(Invocation::new("echo", "echo").with_arg(1))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!([1]));
    assert_eq!(client.channel().pending_calls(), 0);

    client.close(false).await;
    server.close(false).await;
}

#[tokio::test]
async fn test_server_close_fails_pending_calls() {
    let server = Server::builder("127.0.0.1:0")
        .on_invoke(|_inv, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::Value::Null)
        })
        .bind()
        .await
        .unwrap();
    let client = connect(&server).await;

    const N: usize = 5;
    let mut replies = Vec::new();
    for i in 0..N {
        let request = Message::request(
            Header::new(MsgType::BizReq, 0),
            Payload::from(Invocation::new("svc", "hang").with_arg(i)),
        );
        replies.push(
            client
                .channel()
                .request_async(request, Some(Duration::from_secs(60)))
                .await
                .unwrap(),
        );
    }
    assert_eq!(client.channel().pending_calls(), N);

    server.close(false).await;

    for reply in replies {
        let outcome = tokio::time::timeout(Duration::from_secs(5), reply)
            .await
            .expect("pending call left hanging");
        assert!(outcome.unwrap_err().is_connection_closed());
    }
    assert_eq!(client.channel().pending_calls(), 0);
    client.channel().wait_closed().await;
}

#[tokio::test]
async fn test_client_state_follows_server_disconnect() {
    let server = echo_server().await;
    let client = connect(&server).await;
    assert_eq!(client.state(), ConnState::Opened);

    server.close(false).await;
    client.channel().wait_closed().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while client.state() != ConnState::Closed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client lifecycle still open after disconnect");

    // A later close is a no-op on the dead connection
    client.close(true).await;
    assert_eq!(client.state(), ConnState::Closed);
}

#[tokio::test]
async fn test_graceful_close_drains_in_flight() {
    let server = echo_server().await;
    let client = connect(&server).await;

    let request = Message::request(
        Header::new(MsgType::BizReq, 0),
        Payload::from(Invocation::new("echo", "slow").with_arg("late")),
    );
    let reply = client.channel().request_async(request, None).await.unwrap();
    assert_eq!(client.channel().in_flight(), 1);

    client.close(true).await;

    let msg = reply.await.unwrap();
    let outcome = msg.payload().and_then(Payload::as_response).unwrap();
    assert_eq!(outcome.result, Some(serde_json::json!(["late"])));

    server.close(true).await;
}

#[tokio::test]
async fn test_server_calls_back_into_client() {
    let server = echo_server().await;
    let client = Client::builder(server.local_addr().to_string())
        .on_callback(|inv, _ctx| async move { Ok(serde_json::json!(format!("client saw {}", inv.method))) })
        .connect()
        .await
        .unwrap();

    // A round trip guarantees the server has registered the connection.
    client.heartbeat().await.unwrap();
    let channel = server.channels().pop().unwrap();

    let request = Message::request(
        Header::new(MsgType::CallbackReq, 0),
        Payload::from(Invocation::new("progress", "update")),
    );
    let reply = channel.request(request, None).await.unwrap();
    assert_eq!(reply.msg_type(), Some(MsgType::CallbackResp));
    let outcome = reply.payload().and_then(Payload::as_response).unwrap();
    assert_eq!(outcome.result, Some(serde_json::json!("client saw update")));

    client.close(true).await;
    server.close(true).await;
}

#[tokio::test]
async fn test_negotiation_session_and_auth() {
    let server = Server::builder("127.0.0.1:0")
        .on_invoke(|inv, _ctx| async move { Ok(serde_json::json!(inv.args)) })
        .authenticator(|auth: &Authentication, _peer: Option<std::net::SocketAddr>| AuthResult {
            success: auth.principal == "svc-a",
            message: None,
        })
        .bind()
        .await
        .unwrap();
    let client = connect(&server).await;

    let chosen = client
        .negotiate(Negotiation {
            serializations: vec![serialization_id::JSON, serialization_id::MSGPACK],
            compressions: vec![compression_id::ZLIB],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(chosen.serialization, Some(serialization_id::JSON));
    assert_eq!(chosen.compression, Some(compression_id::ZLIB));

    client
        .open_session(Session::new(3, serialization_id::JSON, compression_id::NONE))
        .await
        .unwrap();
    let request = Message::request(
        Header::new(MsgType::BizReq, 0).with_session_id(3),
        Payload::from(Invocation::new("echo", "echo").with_arg("json")),
    );
    let reply = client.channel().request(request, None).await.unwrap();
    assert_eq!(reply.header().serialization, serialization_id::JSON);
    assert_eq!(reply.header().session_id, 3);

    let denied = client
        .authenticate(Authentication {
            principal: "intruder".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!denied.success);
    let granted = client
        .authenticate(Authentication {
            principal: "svc-a".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(granted.success);

    client.close(true).await;
    server.close(true).await;
}

#[tokio::test]
async fn test_shared_server_closes_on_last_release() {
    let fired = Arc::new(AtomicUsize::new(0));
    let deregistered = Arc::new(AtomicUsize::new(0));
    let fired_counter = Arc::clone(&fired);
    let hook_counter = Arc::clone(&deregistered);

    let first = Server::builder("127.0.0.1:0")
        .on_last_close(move || {
            fired_counter.fetch_add(1, Ordering::SeqCst);
        })
        .before_close(move || {
            let counter = Arc::clone(&hook_counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .bind()
        .await
        .unwrap();

    const K: usize = 4;
    let mut holders = vec![first.clone()];
    for _ in 1..K {
        holders.push(first.share().await.unwrap());
    }
    assert_eq!(first.ref_count(), K);

    let last = holders.pop().unwrap();
    for holder in holders {
        holder.close(true).await;
    }
    assert_eq!(first.state(), ConnState::Opened);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // Still accepting connections
    let client = connect(&first).await;
    client.close(false).await;

    last.close(true).await;
    assert_eq!(first.state(), ConnState::Closed);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(deregistered.load(Ordering::SeqCst), 1);

    let refused = Client::builder(first.local_addr().to_string()).connect().await;
    assert!(matches!(refused, Err(RpcError::Connect(_))));
}
