use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, Result, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use super::message::Message;
use super::MAX_FRAME_SIZE;

/// Protocol message codec for encoding/decoding network messages
///
/// Frame layout: a big-endian u32 length prefix covering a protocol version
/// byte plus a bincode-encoded message body. The version byte sits outside
/// the body so an incompatible peer is rejected before deserialization.
#[derive(Clone, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Creates a new message codec
    pub fn new() -> Self {
        MessageCodec
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            // Need more data to read the frame length
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            return Err(Error::malformed("frame missing version byte"));
        }
        if length > MAX_FRAME_SIZE {
            return Err(Error::malformed(format!(
                "frame length {} exceeds {} byte cap",
                length, MAX_FRAME_SIZE
            )));
        }

        if src.len() < 4 + length {
            // Need more data to read the full frame
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(length);

        let version = frame[0];
        if version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        match bincode::deserialize(&frame[1..]) {
            Ok(message) => Ok(Some(message)),
            Err(e) => Err(Error::malformed(format!("failed to deserialize message: {}", e))),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let body = bincode::serialize(&item)
            .map_err(|e| Error::malformed(format!("failed to serialize message: {}", e)))?;

        dst.put_u32((body.len() + 1) as u32);
        dst.put_u8(PROTOCOL_VERSION);
        dst.extend_from_slice(&body);

        Ok(())
    }
}

/// Encodes a message as a single beacon datagram.
///
/// Rejects frames above [`MAX_DATAGRAM_SIZE`] before they reach the socket;
/// beacons must fit in one unfragmented multicast packet.
pub fn encode_datagram(message: &Message) -> Result<Bytes> {
    let mut codec = MessageCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(message.clone(), &mut buf)?;

    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(Error::PayloadTooLarge {
            size: buf.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }

    Ok(buf.freeze())
}

/// Decodes a message from a single received datagram.
///
/// Unlike the stream decoder, a datagram must contain exactly one whole
/// frame; truncation and trailing bytes are both malformed.
pub fn decode_datagram(bytes: &[u8]) -> Result<Message> {
    let mut codec = MessageCodec::new();
    let mut buf = BytesMut::from(bytes);

    match codec.decode(&mut buf)? {
        Some(message) if buf.is_empty() => Ok(message),
        Some(_) => Err(Error::malformed("trailing bytes after frame")),
        None => Err(Error::malformed("truncated datagram")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CommandResult, ExecMode, NodeId, NodeIdentity};
    use crate::protocol::message::{MessageId, MessageKind};
    use std::net::{IpAddr, Ipv4Addr};

    fn identity(id: &str) -> NodeIdentity {
        NodeIdentity::new(id, "Editor", IpAddr::V4(Ipv4Addr::LOCALHOST), 9001)
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::hello(identity("ue-a"), MessageId(1)),
            Message::pong(identity("ue-b"), NodeId::new("ue-a"), MessageId(2)),
            Message::request(
                NodeId::new("ue-a"),
                NodeId::new("ue-b"),
                MessageId(3),
                "2+2",
                ExecMode::EvaluateStatement,
                false,
            ),
            Message::response(
                NodeId::new("ue-b"),
                NodeId::new("ue-a"),
                MessageId(3),
                CommandResult::success("4"),
            ),
            Message::ack(NodeId::new("ue-b"), NodeId::new("ue-a"), MessageId(3)),
        ]
    }

    #[test]
    fn test_codec_roundtrip_all_kinds() {
        let mut codec = MessageCodec::new();
        let mut bytes = BytesMut::new();

        let messages = sample_messages();
        for message in &messages {
            codec.encode(message.clone(), &mut bytes).unwrap();
        }

        for expected in &messages {
            let decoded = codec.decode(&mut bytes).unwrap().expect("whole frame buffered");
            assert_eq!(&decoded, expected);
        }
        assert!(codec.decode(&mut bytes).unwrap().is_none());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let message = Message::hello(identity("ue-a"), MessageId(42));
        let first = encode_datagram(&message).unwrap();
        let second = encode_datagram(&message).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let message = Message::hello(identity("ue-a"), MessageId(1));
        let encoded = encode_datagram(&message).unwrap();

        let mut codec = MessageCodec::new();
        let mut partial = BytesMut::from(&encoded[..encoded.len() / 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let message = Message::hello(identity("ue-a"), MessageId(1));
        let mut encoded = encode_datagram(&message).unwrap().to_vec();
        encoded[4] = PROTOCOL_VERSION + 1;

        match decode_datagram(&encoded) {
            Err(Error::UnsupportedVersion { expected, actual }) => {
                assert_eq!(expected, PROTOCOL_VERSION);
                assert_eq!(actual, PROTOCOL_VERSION + 1);
            }
            other => panic!("Expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_garbage_body() {
        let mut bytes = BytesMut::new();
        bytes.put_u32(9);
        bytes.put_u8(PROTOCOL_VERSION);
        bytes.extend_from_slice(&[0xff; 8]);

        assert!(matches!(
            decode_datagram(&bytes),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_truncated_datagram_is_typed_error() {
        let message = Message::request(
            NodeId::new("ue-a"),
            NodeId::new("ue-b"),
            MessageId(3),
            "unreal.log('hi')",
            ExecMode::ExecuteStatement,
            true,
        );
        let encoded = encode_datagram(&message).unwrap();

        for cut in 0..encoded.len() {
            assert!(
                decode_datagram(&encoded[..cut]).is_err(),
                "truncation at {} decoded successfully",
                cut
            );
        }
    }

    #[test]
    fn test_mutated_datagram_never_panics() {
        let message = Message::response(
            NodeId::new("ue-b"),
            NodeId::new("ue-a"),
            MessageId(3),
            CommandResult::failure(vec!["NameError: name 'x' is not defined".to_string()]),
        );
        let encoded = encode_datagram(&message).unwrap().to_vec();

        for i in 0..encoded.len() {
            let mut mutated = encoded.clone();
            mutated[i] ^= 0xff;
            // Any outcome is acceptable as long as it is a value, not a fault.
            let _ = decode_datagram(&mutated);
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let message = Message::hello(identity("ue-a"), MessageId(1));
        let mut encoded = encode_datagram(&message).unwrap().to_vec();
        encoded.push(0);

        assert!(matches!(
            decode_datagram(&encoded),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_oversized_beacon_rejected_before_send() {
        let message = Message::request(
            NodeId::new("ue-a"),
            NodeId::new("ue-b"),
            MessageId(1),
            "x".repeat(MAX_DATAGRAM_SIZE),
            ExecMode::ExecuteStatement,
            false,
        );

        match encode_datagram(&message) {
            Err(Error::PayloadTooLarge { size, max }) => {
                assert!(size > max);
                assert_eq!(max, MAX_DATAGRAM_SIZE);
            }
            other => panic!("Expected PayloadTooLarge, got {:?}", other),
        }

        // The stream path has no datagram bound.
        let mut codec = MessageCodec::new();
        let mut bytes = BytesMut::new();
        codec.encode(message.clone(), &mut bytes).unwrap();
        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert!(matches!(decoded.kind, MessageKind::CommandRequest { .. }));
    }
}
