use bytes::{Buf, BufMut, BytesMut};
use crate::error::CodecError;
use crate::util::buf_ext::BufExt;

/// The common header at the start of every frame, all fields in network byte order:
///
/// ```ascii
/// 0: version (u8)
/// 1: message type (u8)
/// 2: length (u16) - total frame length, including this header
/// 4: transaction id (u32)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: u8,
    pub length: u16,
    pub xid: u32,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = 8;
    pub const SERIALIZED_LEN_U16: u16 = Self::SERIALIZED_LEN as u16;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type);
        buf.put_u16(self.length);
        buf.put_u32(self.xid);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<FrameHeader, CodecError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(CodecError::TooShort {
                needed: Self::SERIALIZED_LEN,
                have: buf.remaining(),
            });
        }

        Ok(FrameHeader {
            version: buf.get_u8_checked()?,
            msg_type: buf.get_u8_checked()?,
            length: buf.get_u16_checked()?,
            xid: buf.get_u32_checked()?,
        })
    }

    /// Reads just the declared frame length from the start of a buffer holding at least a full
    ///  header, without consuming anything
    pub fn peek_length(buf: &[u8]) -> Result<u16, CodecError> {
        let mut length_field = buf.get(2..4).ok_or(CodecError::TooShort {
            needed: Self::SERIALIZED_LEN,
            have: buf.len(),
        })?;
        length_field.get_u16_checked()
    }
}
