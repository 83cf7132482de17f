//! Property-based tests for the frame codec.

use bytes::BytesMut;
use proptest::prelude::*;
use trunkline_proto::{Frame, FrameDecoder, FrameType, ProtoError, HEADER_LEN};

proptest! {
    #[test]
    fn prop_request_roundtrip(request_id in any::<u64>(), body in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let frame = Frame::request(request_id, &body).unwrap();
        let encoded = frame.encode();

        // Whole header XORs to zero.
        let parity = encoded[..HEADER_LEN].iter().fold(0u8, |acc, b| acc ^ b);
        prop_assert_eq!(parity, 0);

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded.frame_type, FrameType::Request);
        prop_assert_eq!(decoded.request_id(), Some(request_id));
        prop_assert_eq!(&decoded.body()[..], &body[..]);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn prop_single_bit_header_corruption_detected(
        request_id in any::<u64>(),
        body in proptest::collection::vec(any::<u8>(), 0..256),
        bit in 0usize..(HEADER_LEN * 8),
    ) {
        let frame = Frame::request(request_id, &body).unwrap();
        let mut encoded = BytesMut::from(&frame.encode()[..]);
        encoded[bit / 8] ^= 1 << (bit % 8);

        // Flipping any single header bit breaks the XOR-to-zero invariant.
        let result = FrameDecoder::new().decode(&mut encoded);
        prop_assert_eq!(result, Err(ProtoError::ParityMismatch));
    }

    #[test]
    fn prop_decoder_is_chunking_independent(
        request_id in any::<u64>(),
        body in proptest::collection::vec(any::<u8>(), 0..512),
        chunk in 1usize..16,
    ) {
        let frame = Frame::request(request_id, &body).unwrap();
        let encoded = frame.encode();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        let mut produced = Vec::new();
        for piece in encoded.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                produced.push(frame);
            }
        }
        prop_assert_eq!(produced.len(), 1);
        prop_assert_eq!(produced[0].request_id(), Some(request_id));
        prop_assert_eq!(&produced[0].body()[..], &body[..]);
    }
}
