use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tracing::trace;
use crate::error::CodecError;
use crate::protocol::header::FrameHeader;
use crate::protocol::kind::MessageKind;
use crate::protocol::message::{Message, MessageBody, MultipartBody};
use crate::protocol::multipart::{Direction, ElementLayout};
use crate::protocol::version::Version;
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::PrecheckedCast;

/// Turns complete frames into [Message]s and back.
///
/// `decode` is passed exactly one frame (common header included) and the header's version
///  byte. It must distinguish recoverable failures (unknown version or type, see
///  [CodecError::is_recoverable]) from structural ones.
#[cfg_attr(test, automock)]
pub trait MessageCodec {
    fn decode(&self, version: u8, frame: Bytes) -> Result<Message, CodecError>;

    /// appends the complete frame for a message to a buffer, leaving the buffer unchanged on
    ///  failure
    fn encode(&self, message: &Message, buf: &mut BytesMut) -> Result<(), CodecError>;
}

/// The codec for the common header, the kind registry and the multipart element layouts.
///  Payloads of all other message kinds are passed through as raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

impl WireCodec {
    fn decode_multipart(version: Version, direction: Direction, mut payload: Bytes) -> Result<MultipartBody, CodecError> {
        let header_len = MultipartBody::header_len(version);
        if payload.len() < header_len {
            return Err(CodecError::Malformed(format!(
                "multipart body of {} bytes is shorter than its header", payload.len()
            )));
        }

        let subtype = payload.get_u16_checked()?;
        let flags = payload.get_u16_checked()?;
        payload.skip_checked(header_len - 4)?;

        let elements = ElementLayout::lookup(version, direction, subtype)
            .split(payload)?;

        Ok(MultipartBody {
            subtype,
            flags,
            elements,
        })
    }
}

impl MessageCodec for WireCodec {
    fn decode(&self, version: u8, mut frame: Bytes) -> Result<Message, CodecError> {
        let frame_len = frame.len();
        let header = FrameHeader::deser(&mut frame)?;
        if usize::from(header.length) != frame_len {
            return Err(CodecError::Malformed(format!(
                "declared length {} does not match frame length {}", header.length, frame_len
            )));
        }

        let version = Version::from_wire(version)
            .ok_or(CodecError::UnsupportedVersion(version))?;
        let kind = MessageKind::lookup(version, header.msg_type)
            .ok_or(CodecError::UnsupportedType { version: version.wire(), msg_type: header.msg_type })?;

        trace!("decoding {:?} frame of {} bytes, xid {:#010x}", kind, frame_len, header.xid);

        let body = match kind {
            MessageKind::MultipartRequest => MessageBody::Multipart(Self::decode_multipart(version, Direction::Request, frame)?),
            MessageKind::MultipartReply => MessageBody::Multipart(Self::decode_multipart(version, Direction::Reply, frame)?),
            MessageKind::Error if frame.len() < 4 => {
                return Err(CodecError::Malformed(format!("error body of {} bytes has no type and code", frame.len())));
            }
            _ => MessageBody::Raw(frame),
        };

        Ok(Message {
            version,
            msg_type: header.msg_type,
            xid: header.xid,
            body,
        })
    }

    fn encode(&self, message: &Message, buf: &mut BytesMut) -> Result<(), CodecError> {
        let wire_len = message.wire_len();
        if wire_len > usize::from(u16::MAX) {
            return Err(CodecError::TooLong(wire_len));
        }

        buf.reserve(wire_len);
        FrameHeader {
            version: message.version.wire(),
            msg_type: message.msg_type,
            length: wire_len.prechecked_cast(),
            xid: message.xid,
        }.ser(buf);

        match &message.body {
            MessageBody::Raw(payload) => buf.put_slice(payload),
            MessageBody::Multipart(body) => {
                buf.put_u16(body.subtype);
                buf.put_u16(body.flags);
                buf.put_bytes(0, MultipartBody::header_len(message.version) - 4);
                for element in &body.elements {
                    buf.put_slice(&element.data);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Element, ElementKey};
    use crate::protocol::multipart::subtype;
    use rstest::rstest;

    fn frame(version: u8, msg_type: u8, xid: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        FrameHeader { version, msg_type, length: (8 + payload.len()) as u16, xid }.ser(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    #[test]
    fn test_decode_raw() {
        let msg = WireCodec.decode(3, frame(3, 0, 0x11121314, &[1, 2, 3, 4])).unwrap();
        assert_eq!(msg, Message::new(Version::V1_2, 0, 0x11121314, Bytes::from_static(&[1, 2, 3, 4])));
    }

    #[test]
    fn test_decode_port_stats_10() {
        let mut payload = vec![0, 4, 0, 1];
        let mut record = vec![0u8; 104];
        record[1] = 7;
        payload.extend_from_slice(&record);

        let msg = WireCodec.decode(1, frame(1, 17, 5, &payload)).unwrap();
        let body = msg.multipart_body().unwrap();
        assert_eq!(body.subtype, subtype::PORT_STATS);
        assert!(body.more_follows());
        assert_eq!(body.elements, vec![Element { key: Some(ElementKey(7)), data: Bytes::from(record) }]);
    }

    #[test]
    fn test_decode_group_desc_13() {
        let payload = [
            0, 7, 0, 0, 0, 0, 0, 0, // multipart header
            0, 8, 0, 0, 0, 0, 0, 3, // group 3
            0, 10, 0, 0, 0, 0, 0, 4, 9, 9, // group 4
        ];
        let msg = WireCodec.decode(4, frame(4, 19, 5, &payload)).unwrap();
        let body = msg.multipart_body().unwrap();
        assert!(!body.more_follows());
        assert_eq!(body.elements.iter().map(|e| e.key).collect::<Vec<_>>(), vec![Some(ElementKey(3)), Some(ElementKey(4))]);
    }

    #[rstest]
    #[case::unknown_version(9, frame(9, 0, 1, &[]), CodecError::UnsupportedVersion(9))]
    #[case::unknown_type_10(1, frame(1, 22, 1, &[]), CodecError::UnsupportedType { version: 1, msg_type: 22 })]
    #[case::unknown_type_13(4, frame(4, 30, 1, &[]), CodecError::UnsupportedType { version: 4, msg_type: 30 })]
    fn test_decode_unsupported(#[case] version: u8, #[case] frame: Bytes, #[case] expected: CodecError) {
        let err = WireCodec.decode(version, frame).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err, expected);
    }

    #[rstest]
    #[case::short_multipart_header_13(frame(4, 19, 1, &[0, 1, 0, 0]))]
    #[case::short_multipart_header_10(frame(1, 17, 1, &[0, 1]))]
    #[case::fixed_remainder(frame(4, 19, 1, &[0, 3, 0, 0, 0, 0, 0, 0, 1, 2, 3]))]
    #[case::zero_record_length(frame(4, 19, 1, &[0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1]))]
    #[case::short_error(frame(4, 1, 1, &[0, 1, 0]))]
    #[case::length_mismatch(Bytes::from_static(&[4, 0, 0, 9, 0, 0, 0, 1]))]
    fn test_decode_malformed(#[case] frame: Bytes) {
        let err = WireCodec.decode(frame[0], frame).unwrap_err();
        assert!(!err.is_recoverable(), "{:?}", err);
    }

    #[test]
    fn test_encode_multipart() {
        let msg = Message::multipart(Version::V1_3, MessageKind::MultipartRequest, 0x0102, MultipartBody {
            subtype: subtype::FLOW,
            flags: 1,
            elements: vec![Element { key: None, data: Bytes::from_static(&[5, 6]) }],
        }).unwrap();

        let mut buf = BytesMut::new();
        WireCodec.encode(&msg, &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[4, 18, 0, 18, 0, 0, 1, 2, 0, 1, 0, 1, 0, 0, 0, 0, 5, 6]);
        assert_eq!(WireCodec.decode(4, buf.freeze()).unwrap(), msg);
    }

    #[test]
    fn test_encode_too_long() {
        let msg = Message::new(Version::V1_3, 13, 1, Bytes::from(vec![0u8; 65528]));
        let mut buf = BytesMut::new();
        assert_eq!(WireCodec.encode(&msg, &mut buf), Err(CodecError::TooLong(65536)));
        assert!(buf.is_empty());

        let msg = Message::new(Version::V1_3, 13, 1, Bytes::from(vec![0u8; 65527]));
        WireCodec.encode(&msg, &mut buf).unwrap();
        assert_eq!(buf.len(), 65535);
    }
}
