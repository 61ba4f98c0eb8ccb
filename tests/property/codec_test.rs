// tests/property/codec_test.rs

//! Property-based tests for the frame codec
//! Tests that any valid frame survives the wire intact, however the bytes
//! are split, and that the codec never panics on arbitrary input.

use bytes::{Bytes, BytesMut};
use peerlink::core::protocol::{Answer, ExecStatus, Frame, FrameCodec, Query};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn status() -> impl Strategy<Value = ExecStatus> {
    prop_oneof![
        Just(ExecStatus::Success),
        Just(ExecStatus::QueueOverflow),
        Just(ExecStatus::MethodNotFound),
        Just(ExecStatus::NotAuthorized),
        Just(ExecStatus::SessionRequired),
        Just(ExecStatus::ApplicationError),
        Just(ExecStatus::InternalError),
    ]
}

fn frame() -> impl Strategy<Value = Frame> {
    let query = (
        1u64..,
        "[a-zA-Z0-9_.]{1,64}",
        prop::collection::vec(any::<u8>(), 0..512),
        prop::option::of(prop::collection::vec(any::<u8>(), 0..64)),
    )
        .prop_map(|(request_id, method, payload, token)| {
            Frame::Query(Query {
                request_id,
                method,
                payload: Bytes::from(payload),
                auth_token: token.map(Bytes::from),
            })
        });
    let answer = (1u64.., status(), prop::collection::vec(any::<u8>(), 0..512)).prop_map(
        |(request_id, status, payload)| {
            Frame::Answer(Answer {
                request_id,
                status,
                payload: Bytes::from(payload),
            })
        },
    );
    prop_oneof![query, answer, Just(Frame::Shutdown)]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_frames_survive_arbitrary_splits(
        frames in prop::collection::vec(frame(), 1..8),
        split in any::<prop::sample::Index>(),
    ) {
        let mut codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        for frame in &frames {
            codec.encode(frame.clone(), &mut wire).unwrap();
        }

        // Feed the bytes in two chunks split at an arbitrary point.
        let at = split.index(wire.len() + 1);
        let tail = wire.split_off(at);
        let mut buf = wire;
        let mut decoded = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            decoded.push(frame);
        }
        buf.extend_from_slice(&tail);
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            decoded.push(frame);
        }

        prop_assert_eq!(decoded, frames);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::from(&bytes[..]);
        // Either a frame, a need for more bytes, or a protocol error.
        let _ = codec.decode(&mut buf);
    }
}
