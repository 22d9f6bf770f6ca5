use bytes::Bytes;
use crate::protocol::kind::MessageKind;
use crate::protocol::message::{Element, ElementKey, Message, MultipartBody};
use crate::protocol::multipart::FLAG_MORE;
use crate::protocol::version::Version;

fn of_kind(version: Version, kind: MessageKind, xid: u32, payload: &'static [u8]) -> Message {
    Message::of_kind(version, kind, xid, Bytes::from_static(payload))
        .unwrap_or_else(|| panic!("{:?} does not exist in {:?}", kind, version))
}

pub fn echo_request(version: Version, xid: u32) -> Message {
    of_kind(version, MessageKind::EchoRequest, xid, &[0xec, 0x40])
}

pub fn barrier_request(version: Version, xid: u32) -> Message {
    of_kind(version, MessageKind::BarrierRequest, xid, &[])
}

pub fn flow_mod(version: Version, xid: u32) -> Message {
    of_kind(version, MessageKind::FlowMod, xid, &[0; 40])
}

pub fn packet_out(version: Version, xid: u32) -> Message {
    of_kind(version, MessageKind::PacketOut, xid, &[0; 16])
}

/// an element with a key, its data being the key followed by a marker byte
pub fn keyed_element(key: u8, marker: u8) -> Element {
    Element {
        key: Some(ElementKey(key.into())),
        data: Bytes::copy_from_slice(&[key, marker]),
    }
}

pub fn element(data: &[u8]) -> Element {
    Element {
        key: None,
        data: Bytes::copy_from_slice(data),
    }
}

/// one fragment of a multipart reply
pub fn multipart_reply(version: Version, xid: u32, subtype: u16, more: bool, elements: Vec<Element>) -> Message {
    let body = MultipartBody {
        subtype,
        flags: if more { FLAG_MORE } else { 0 },
        elements,
    };
    Message::multipart(version, MessageKind::MultipartReply, xid, body)
        .unwrap_or_else(|| panic!("no multipart reply in {:?}", version))
}
