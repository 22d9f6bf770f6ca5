use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::error::CodecError;
use crate::protocol::message::{Message, MessageBody};
use crate::protocol::version::Version;
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::SafeCast;

/// hello element type of the version bitmap
pub const ELEM_VERSION_BITMAP: u16 = 1;

const ELEM_HEADER_LEN: usize = 4;

/// The set of protocol revisions a side supports, as exchanged in hello messages: bit `n` is
///  set for wire version `n`. Only the first 32-bit word is kept since all known revisions
///  fit into it.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct VersionBitmap(pub u32);

impl VersionBitmap {
    pub fn of(versions: &[Version]) -> VersionBitmap {
        let mut result = VersionBitmap::default();
        for v in versions {
            result.0 |= 1u32 << v.wire();
        }
        result
    }

    pub fn contains(self, version: Version) -> bool {
        self.0 & (1u32 << version.wire()) != 0
    }

    pub fn intersect(self, other: VersionBitmap) -> VersionBitmap {
        VersionBitmap(self.0 & other.0)
    }

    pub fn highest(self) -> Option<Version> {
        [Version::V1_3, Version::V1_2, Version::V1_0].into_iter()
            .find(|v| self.contains(*v))
    }

    /// hello body with a single version bitmap element
    pub fn hello_body(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ELEM_HEADER_LEN + 4);
        buf.put_u16(ELEM_VERSION_BITMAP);
        buf.put_u16((ELEM_HEADER_LEN + 4) as u16);
        buf.put_u32(self.0);
        buf.freeze()
    }

    /// The versions a peer announces in its hello. Revisions before 1.3 have no hello
    ///  elements, and a hello without a bitmap announces only its header version.
    pub fn from_hello(hello: &Message) -> Result<VersionBitmap, CodecError> {
        let header_version = VersionBitmap::of(&[hello.version]);
        let payload = match &hello.body {
            MessageBody::Raw(payload) if hello.version == Version::V1_3 => payload.clone(),
            _ => return Ok(header_version),
        };

        let mut buf = payload;
        while buf.remaining() >= ELEM_HEADER_LEN {
            let elem_type = buf.get_u16_checked()?;
            let elem_len: usize = buf.get_u16_checked()?.safe_cast();
            if elem_len < ELEM_HEADER_LEN {
                return Err(CodecError::Malformed(format!("hello element length {} is below the header length", elem_len)));
            }
            let body_len = elem_len - ELEM_HEADER_LEN;
            if body_len > buf.remaining() {
                return Err(CodecError::Malformed(format!("hello element length {} overruns the message", elem_len)));
            }

            let mut elem_body = buf.split_to(body_len);
            if elem_type == ELEM_VERSION_BITMAP {
                return Ok(VersionBitmap(elem_body.get_u32_checked()?));
            }

            // elements are padded to a multiple of 8 bytes
            let padding = (8 - elem_len % 8) % 8;
            buf.advance(padding.min(buf.remaining()));
        }
        Ok(header_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn hello(version: Version, body: &'static [u8]) -> Message {
        Message::new(version, 0, 1, Bytes::from_static(body))
    }

    #[rstest]
    #[case::v10(hello(Version::V1_0, &[]), Some(VersionBitmap(0b10)))]
    #[case::v12_ignores_body(hello(Version::V1_2, &[0, 1, 0, 8, 0, 0, 0, 0x12]), Some(VersionBitmap(0b1000)))]
    #[case::v13_without_elements(hello(Version::V1_3, &[]), Some(VersionBitmap(0b10000)))]
    #[case::v13_bitmap(hello(Version::V1_3, &[0, 1, 0, 8, 0, 0, 0, 0x1a]), Some(VersionBitmap(0x1a)))]
    #[case::unknown_element_first(hello(Version::V1_3, &[0, 9, 0, 6, 1, 2, 0, 0, 0, 1, 0, 8, 0, 0, 0, 0x02]), Some(VersionBitmap(0x02)))]
    #[case::only_unknown_element(hello(Version::V1_3, &[0, 9, 0, 8, 1, 2, 3, 4]), Some(VersionBitmap(0b10000)))]
    #[case::short_element(hello(Version::V1_3, &[0, 1, 0, 2]), None)]
    #[case::overrun(hello(Version::V1_3, &[0, 1, 0, 16, 0, 0, 0, 0x12]), None)]
    #[case::empty_bitmap(hello(Version::V1_3, &[0, 1, 0, 4]), None)]
    fn test_from_hello(#[case] msg: Message, #[case] expected: Option<VersionBitmap>) {
        assert_eq!(VersionBitmap::from_hello(&msg).ok(), expected);
    }

    #[rstest]
    #[case::all(&[Version::V1_0, Version::V1_2, Version::V1_3], &[Version::V1_0, Version::V1_2, Version::V1_3], Some(Version::V1_3))]
    #[case::older_peer(&[Version::V1_0, Version::V1_2, Version::V1_3], &[Version::V1_0, Version::V1_2], Some(Version::V1_2))]
    #[case::disjoint(&[Version::V1_3], &[Version::V1_0], None)]
    fn test_negotiation(#[case] local: &[Version], #[case] peer: &[Version], #[case] expected: Option<Version>) {
        assert_eq!(VersionBitmap::of(local).intersect(VersionBitmap::of(peer)).highest(), expected);
    }

    #[test]
    fn test_hello_body() {
        let body = VersionBitmap::of(&[Version::V1_0, Version::V1_3]).hello_body();
        assert_eq!(body.as_ref(), &[0, 1, 0, 8, 0, 0, 0, 0x12]);
        assert_eq!(VersionBitmap::from_hello(&Message::new(Version::V1_3, 0, 1, body)).unwrap(),
                   VersionBitmap(0x12));
    }
}
