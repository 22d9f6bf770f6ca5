use bytes::{BufMut, Bytes, BytesMut};
use crate::protocol::header::FrameHeader;
use crate::protocol::kind::MessageKind;
use crate::protocol::multipart::FLAG_MORE;
use crate::protocol::version::Version;
use crate::util::buf_ext::BufExt;

/// error type and codes used for replies to frames this side cannot handle
pub mod error_code {
    pub const HELLO_FAILED: u16 = 0;
    pub const BAD_REQUEST: u16 = 1;

    pub const INCOMPATIBLE: u16 = 0;

    pub const BAD_VERSION: u16 = 0;
    pub const BAD_TYPE: u16 = 1;
}

/// The natural key of a multipart element (table id, port number, group id, ...), stored
///  as the big-endian value of its wire bytes
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ElementKey(pub u64);

/// One entry of a multipart body's repeated collection, kept in its wire representation
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Element {
    pub key: Option<ElementKey>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MultipartBody {
    pub subtype: u16,
    pub flags: u16,
    pub elements: Vec<Element>,
}

impl MultipartBody {
    /// length of the subtype / flags prefix (plus padding) in front of the elements
    pub fn header_len(version: Version) -> usize {
        match version {
            Version::V1_0 => 4,
            Version::V1_2 | Version::V1_3 => 8,
        }
    }

    pub fn more_follows(&self) -> bool {
        self.flags & FLAG_MORE != 0
    }

    pub fn elements_len(&self) -> usize {
        self.elements.iter()
            .map(|e| e.data.len())
            .sum()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MessageBody {
    /// payload bytes after the common header, not interpreted by this crate
    Raw(Bytes),
    Multipart(MultipartBody),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub version: Version,
    pub msg_type: u8,
    pub xid: u32,
    pub body: MessageBody,
}

impl Message {
    pub fn new(version: Version, msg_type: u8, xid: u32, payload: Bytes) -> Message {
        Message {
            version,
            msg_type,
            xid,
            body: MessageBody::Raw(payload),
        }
    }

    /// Creates a message of a given kind. Returns `None` if the kind does not exist in the
    ///  given protocol revision.
    pub fn of_kind(version: Version, kind: MessageKind, xid: u32, payload: Bytes) -> Option<Message> {
        kind.opcode(version)
            .map(|msg_type| Message::new(version, msg_type, xid, payload))
    }

    pub fn multipart(version: Version, kind: MessageKind, xid: u32, body: MultipartBody) -> Option<Message> {
        if !kind.is_multipart() {
            return None;
        }
        kind.opcode(version)
            .map(|msg_type| Message {
                version,
                msg_type,
                xid,
                body: MessageBody::Multipart(body),
            })
    }

    pub fn hello(version: Version, xid: u32) -> Message {
        Message::new(version, 0, xid, Bytes::new())
    }

    /// The error reply sent for a frame that was well-formed but could not be handled: error
    ///  type BAD_REQUEST with the given code, carrying (a prefix of) the offending frame.
    pub fn bad_request_error(version: Version, xid: u32, code: u16, preview: &[u8]) -> Message {
        Message::error(version, xid, error_code::BAD_REQUEST, code, preview)
    }

    pub fn error(version: Version, xid: u32, error_type: u16, code: u16, data: &[u8]) -> Message {
        let mut payload = BytesMut::with_capacity(4 + data.len());
        payload.put_u16(error_type);
        payload.put_u16(code);
        payload.put_slice(data);

        // OFPT_ERROR is 1 in all revisions
        Message::new(version, 1, xid, payload.freeze())
    }

    /// error type and code of an error message
    pub fn error_type_code(&self) -> Option<(u16, u16)> {
        if self.kind() != Some(MessageKind::Error) {
            return None;
        }
        let mut payload = &self.payload()?[..];
        let error_type = payload.get_u16_checked().ok()?;
        let code = payload.get_u16_checked().ok()?;
        Some((error_type, code))
    }

    /// the payload of a message that is not multipart
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.body {
            MessageBody::Raw(payload) => Some(payload),
            MessageBody::Multipart(_) => None,
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::lookup(self.version, self.msg_type)
    }

    /// total length of the encoded frame, including the common header
    pub fn wire_len(&self) -> usize {
        FrameHeader::SERIALIZED_LEN + match &self.body {
            MessageBody::Raw(payload) => payload.len(),
            MessageBody::Multipart(body) => MultipartBody::header_len(self.version) + body.elements_len(),
        }
    }

    pub fn multipart_body(&self) -> Option<&MultipartBody> {
        match &self.body {
            MessageBody::Multipart(body) => Some(body),
            MessageBody::Raw(_) => None,
        }
    }

    pub fn subtype(&self) -> Option<u16> {
        self.multipart_body()
            .map(|body| body.subtype)
    }

    /// true if this is one fragment of a multipart message, and more fragments follow
    pub fn more_follows(&self) -> bool {
        self.multipart_body()
            .map(|body| body.more_follows())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn multipart(version: Version, flags: u16, elements: Vec<&'static [u8]>) -> Message {
        Message::multipart(version, MessageKind::MultipartReply, 7, MultipartBody {
            subtype: 1,
            flags,
            elements: elements.into_iter()
                .map(|e| Element { key: None, data: Bytes::from_static(e) })
                .collect(),
        }).unwrap()
    }

    #[rstest]
    #[case::hello(Message::hello(Version::V1_3, 1), 8)]
    #[case::raw(Message::new(Version::V1_2, 2, 1, Bytes::from_static(&[1, 2, 3, 4])), 12)]
    #[case::multipart_10(multipart(Version::V1_0, 0, vec![&[1, 2], &[3]]), 15)]
    #[case::multipart_13(multipart(Version::V1_3, 0, vec![&[1, 2], &[3]]), 19)]
    #[case::multipart_empty(multipart(Version::V1_3, 0, vec![]), 16)]
    fn test_wire_len(#[case] msg: Message, #[case] expected: usize) {
        assert_eq!(msg.wire_len(), expected);
    }

    #[rstest]
    #[case::raw(Message::hello(Version::V1_3, 1), false)]
    #[case::last_fragment(multipart(Version::V1_3, 0, vec![]), false)]
    #[case::more(multipart(Version::V1_3, 1, vec![]), true)]
    #[case::other_flags(multipart(Version::V1_0, 0xfffe, vec![]), false)]
    fn test_more_follows(#[case] msg: Message, #[case] expected: bool) {
        assert_eq!(msg.more_follows(), expected);
    }

    #[test]
    fn test_multipart_kind_check() {
        assert!(Message::multipart(Version::V1_3, MessageKind::Hello, 1, MultipartBody { subtype: 0, flags: 0, elements: vec![] }).is_none());
        assert_eq!(Message::multipart(Version::V1_0, MessageKind::MultipartRequest, 1, MultipartBody { subtype: 0, flags: 0, elements: vec![] })
                       .unwrap().msg_type, 16);
    }

    #[test]
    fn test_of_kind() {
        assert_eq!(Message::of_kind(Version::V1_3, MessageKind::MeterMod, 3, Bytes::new()).unwrap().msg_type, 29);
        assert!(Message::of_kind(Version::V1_0, MessageKind::MeterMod, 3, Bytes::new()).is_none());
    }

    #[test]
    fn test_bad_request_error() {
        let msg = Message::bad_request_error(Version::V1_3, 0x11121314, error_code::BAD_TYPE, &[4, 99, 0, 8]);
        assert_eq!(msg.msg_type, 1);
        assert_eq!(msg.kind(), Some(MessageKind::Error));
        assert_eq!(msg.xid, 0x11121314);
        assert_eq!(msg.body, MessageBody::Raw(Bytes::from_static(&[0, 1, 0, 1, 4, 99, 0, 8])));
        assert_eq!(msg.wire_len(), 16);
    }

    #[rstest]
    #[case::hello_failed(Message::error(Version::V1_0, 1, error_code::HELLO_FAILED, error_code::INCOMPATIBLE, &[1, 2]), Some((0, 0)))]
    #[case::bad_request(Message::bad_request_error(Version::V1_3, 1, error_code::BAD_TYPE, &[]), Some((1, 1)))]
    #[case::truncated(Message::new(Version::V1_3, 1, 1, Bytes::from_static(&[0, 1, 0])), None)]
    #[case::not_an_error(Message::hello(Version::V1_3, 1), None)]
    fn test_error_type_code(#[case] msg: Message, #[case] expected: Option<(u16, u16)>) {
        assert_eq!(msg.error_type_code(), expected);
    }
}
