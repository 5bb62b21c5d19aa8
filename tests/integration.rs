//! Integration tests for the muxrpc wire format.
//!
//! These tests verify framing, bodies and the call envelope together, the
//! way a peer sees them on the wire.

use muxrpc::codec::{Body, CallRequest};
use muxrpc::protocol::{build_frame, flags, Frame, FrameBuffer, Header, GOODBYE, HEADER_SIZE};
use muxrpc::{CallKind, MuxrpcError, RemoteError};
use serde_json::json;

/// A call request travels as a JSON body on a positive id.
#[test]
fn test_call_request_frame() {
    let request = CallRequest::new("hello", json!(["Bob", "Alice"]), CallKind::Async);
    let frame = Frame::new(1, request.to_body().unwrap());
    let bytes = frame.encode();

    assert_eq!(bytes[0], flags::TYPE_JSON);
    assert_eq!(
        u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize,
        bytes.len() - HEADER_SIZE
    );
    assert_eq!(i32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]), 1);

    let frames = FrameBuffer::new().push(&bytes).unwrap();
    let decoded = CallRequest::from_body(&frames[0].body).unwrap();
    assert_eq!(decoded.method(), "hello");
    assert_eq!(decoded.args, json!(["Bob", "Alice"]));
    assert_eq!(decoded.kind().unwrap(), CallKind::Async);
}

/// Bytes produced by a JS peer for `stuff` decode frame by frame.
#[test]
fn test_source_reply_sequence() {
    let mut wire = Vec::new();
    for a in 1..=4 {
        let frame = Frame::new(-2, Body::json(&json!({ "a": a })).unwrap()).with_stream(true);
        wire.extend_from_slice(&frame.encode());
    }
    let end = Frame::new(-2, Body::json(&true).unwrap())
        .with_stream(true)
        .with_end(true);
    wire.extend_from_slice(&end.encode());

    let frames = FrameBuffer::new().push(&wire).unwrap();
    assert_eq!(frames.len(), 5);

    let values: Vec<serde_json::Value> = frames[..4]
        .iter()
        .map(|f| f.body.decode().unwrap())
        .collect();
    assert_eq!(
        values,
        vec![json!({"a":1}), json!({"a":2}), json!({"a":3}), json!({"a":4})]
    );
    assert!(frames[4].end && frames[4].stream);
    assert!(RemoteError::from_end_body(&frames[4].body).is_none());
}

/// Every split point of a multi-frame buffer decodes to the same frames.
#[test]
fn test_any_split_point_decodes_identically() {
    let mut wire = Vec::new();
    wire.extend_from_slice(&Frame::new(1, Body::text("hello, Bob and Alice!")).encode());
    wire.extend_from_slice(&Frame::new(-3, Body::buffer(vec![0u8, 1, 2])).with_stream(true).encode());
    wire.extend_from_slice(&Frame::new(2, Body::json(&json!([1, 2])).unwrap()).encode());

    let expected = FrameBuffer::new().push(&wire).unwrap();
    assert_eq!(expected.len(), 3);

    for split in 0..=wire.len() {
        let mut buffer = FrameBuffer::new();
        let mut frames = buffer.push(&wire[..split]).unwrap();
        frames.extend(buffer.push(&wire[split..]).unwrap());
        assert_eq!(frames, expected, "split at {split}");
        assert!(buffer.finish().is_ok());
    }
}

/// Error frames from Go peers carry a plain string body.
#[test]
fn test_go_style_error_frame() {
    let header = Header::new(flags::TYPE_STRING | flags::END_ERR, 24, -1);
    let bytes = build_frame(&header, b"No such method available");

    let frames = FrameBuffer::new().push(&bytes).unwrap();
    assert!(frames[0].end && !frames[0].stream);

    let err = RemoteError::from_body(&frames[0].body);
    assert_eq!(err.message, "No such method available");
}

/// Goodbye ends the stream; trailing bytes are ignored.
#[test]
fn test_goodbye_packet() {
    let mut wire = Frame::new(1, Body::json(&1).unwrap()).encode().to_vec();
    wire.extend_from_slice(&GOODBYE);
    wire.extend_from_slice(b"garbage after goodbye");

    let mut buffer = FrameBuffer::new();
    let frames = buffer.push(&wire).unwrap();

    assert_eq!(frames.len(), 1);
    assert!(buffer.saw_goodbye());
    assert!(buffer.finish().is_ok());
}

/// Reserved flag bits are a protocol error.
#[test]
fn test_reserved_flags_rejected() {
    let header = Header::new(0x10 | flags::TYPE_JSON, 1, 1);
    let bytes = build_frame(&header, b"1");

    let result = FrameBuffer::new().push(&bytes);
    assert!(matches!(result, Err(MuxrpcError::Protocol(_))));
}

/// Oversized bodies are refused before they are buffered.
#[test]
fn test_body_limit() {
    let header = Header::new(flags::TYPE_JSON, 1024, 1);
    let mut buffer = FrameBuffer::with_max_body(512);

    let result = buffer.push(&header.encode());
    assert!(matches!(result, Err(MuxrpcError::Protocol(_))));
}
