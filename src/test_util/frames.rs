//! Raw wire frames, built byte by byte so that they can also represent frames this crate
//!  would refuse to produce

use bytes::{BufMut, BytesMut};
use crate::protocol::header::FrameHeader;
use crate::util::safe_converter::PrecheckedCast;

pub fn raw_frame(version: u8, msg_type: u8, xid: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    FrameHeader {
        version,
        msg_type,
        length: (FrameHeader::SERIALIZED_LEN + payload.len()).prechecked_cast(),
        xid,
    }.ser(&mut buf);
    buf.put_slice(payload);
    buf.to_vec()
}

pub fn hello_frame(version: u8, xid: u32) -> Vec<u8> {
    raw_frame(version, 0, xid, &[])
}

/// a 1.3 style hello carrying a version bitmap element
pub fn hello_frame_with_bitmap(version: u8, xid: u32, bitmap: u32) -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_u16(1);
    payload.put_u16(8);
    payload.put_u32(bitmap);
    raw_frame(version, 0, xid, &payload)
}

pub fn error_frame(version: u8, xid: u32, error_type: u16, code: u16) -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_u16(error_type);
    payload.put_u16(code);
    raw_frame(version, 1, xid, &payload)
}

/// A features reply with a datapath id and auxiliary id. The remaining fields are zero, and
///  the port list is empty.
pub fn features_reply_frame(version: u8, xid: u32, datapath_id: u64, auxiliary_id: u8) -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_u64(datapath_id);
    payload.put_u32(0); // buffers
    payload.put_u8(0); // tables
    payload.put_u8(auxiliary_id);
    payload.put_u16(0);
    payload.put_u32(0); // capabilities
    payload.put_u32(0);
    raw_frame(version, 6, xid, &payload)
}

pub fn echo_request_frame(version: u8, xid: u32, payload: &[u8]) -> Vec<u8> {
    raw_frame(version, 2, xid, payload)
}

pub fn echo_reply_frame(version: u8, xid: u32, payload: &[u8]) -> Vec<u8> {
    raw_frame(version, 3, xid, payload)
}

/// A multipart reply frame with a given subtype and flags. `body` is the raw element data
///  after the multipart header.
pub fn multipart_reply_frame(version: u8, xid: u32, subtype: u16, flags: u16, body: &[u8]) -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_u16(subtype);
    payload.put_u16(flags);
    let msg_type = if version == 0x01 {
        17
    }
    else {
        payload.put_u32(0);
        19
    };
    payload.put_slice(body);
    raw_frame(version, msg_type, xid, &payload)
}
