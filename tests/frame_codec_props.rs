//! Property tests for the length-prefixed frame codec.

use bytes::BytesMut;
use proptest::prelude::*;
use runloop::FrameCodec;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// However the wire image is sliced into read chunks, the decoded
    /// frame sequence is byte-identical to what was encoded.
    #[test]
    fn test_chunking_never_changes_decoded_frames(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8),
        chunk_len in 1usize..64,
    ) {
        let encoder = FrameCodec::new();
        let mut wire = BytesMut::new();
        for payload in &payloads {
            encoder.encode(payload, &mut wire).unwrap();
        }

        let mut decoder = FrameCodec::new();
        let mut pending = BytesMut::new();
        let mut decoded: Vec<Vec<u8>> = Vec::new();
        for chunk in wire.chunks(chunk_len) {
            pending.extend_from_slice(chunk);
            while let Some(frame) = decoder.decode(&mut pending).unwrap() {
                decoded.push(frame.to_vec());
            }
        }

        prop_assert_eq!(decoded, payloads);
    }
}
