use bytes::{Buf, Bytes};
use crate::error::CodecError;
use crate::protocol::message::{Element, ElementKey};
use crate::protocol::version::Version;
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::SafeCast;

/// multipart / stats subtypes that have a repeated element layout. The numbering is shared by
///  all supported revisions, later revisions only add to it.
pub mod subtype {
    pub const DESC: u16 = 0;
    pub const FLOW: u16 = 1;
    pub const AGGREGATE: u16 = 2;
    pub const TABLE: u16 = 3;
    pub const PORT_STATS: u16 = 4;
    pub const QUEUE: u16 = 5;
    pub const GROUP: u16 = 6;
    pub const GROUP_DESC: u16 = 7;
    pub const GROUP_FEATURES: u16 = 8;
    pub const METER: u16 = 9;
    pub const METER_CONFIG: u16 = 10;
    pub const METER_FEATURES: u16 = 11;
    pub const TABLE_FEATURES: u16 = 12;
    pub const PORT_DESC: u16 = 13;
    pub const EXPERIMENTER: u16 = 0xffff;
}

/// bit 0 of the multipart flags field, in requests and replies of every revision
pub const FLAG_MORE: u16 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    Request,
    Reply,
}

/// How a multipart body is cut into elements
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Framing {
    /// the entire body is a single opaque element
    Whole,
    /// the body is a sequence of records of a fixed size
    Fixed(usize),
    /// every record carries its own total length as a u16 at the given offset
    LengthPrefixed { offset: usize },
}

/// A big-endian key embedded in every element, e.g. a port number or a group id
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KeySpan {
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ElementLayout {
    pub framing: Framing,
    pub key: Option<KeySpan>,
}

impl ElementLayout {
    const WHOLE: ElementLayout = ElementLayout { framing: Framing::Whole, key: None };

    const fn fixed(len: usize, key: Option<KeySpan>) -> ElementLayout {
        ElementLayout { framing: Framing::Fixed(len), key }
    }

    const fn length_prefixed(offset: usize, key: Option<KeySpan>) -> ElementLayout {
        ElementLayout { framing: Framing::LengthPrefixed { offset }, key }
    }

    /// The element layout for a given revision, direction and subtype. Subtypes without a
    ///  repeated structure are treated as one opaque element.
    pub fn lookup(version: Version, direction: Direction, subtype: u16) -> ElementLayout {
        use subtype::*;

        const fn key(offset: usize, len: usize) -> Option<KeySpan> {
            Some(KeySpan { offset, len })
        }

        match (version, direction, subtype) {
            (_, Direction::Reply, FLOW) => Self::length_prefixed(0, None),

            (Version::V1_0, Direction::Reply, TABLE) => Self::fixed(64, key(0, 1)),
            (Version::V1_0, Direction::Reply, PORT_STATS) => Self::fixed(104, key(0, 2)),
            (Version::V1_0, Direction::Reply, QUEUE) => Self::fixed(32, key(0, 8)),

            (Version::V1_2, Direction::Reply, TABLE) => Self::fixed(128, key(0, 1)),
            (Version::V1_2, Direction::Reply, PORT_STATS) => Self::fixed(104, key(0, 4)),
            (Version::V1_2, Direction::Reply, QUEUE) => Self::fixed(32, key(0, 8)),
            (Version::V1_2, Direction::Reply, GROUP | GROUP_DESC) => Self::length_prefixed(0, key(4, 4)),

            (Version::V1_3, Direction::Reply, TABLE) => Self::fixed(24, key(0, 1)),
            (Version::V1_3, Direction::Reply, PORT_STATS) => Self::fixed(112, key(0, 4)),
            (Version::V1_3, Direction::Reply, QUEUE) => Self::fixed(40, key(0, 8)),
            (Version::V1_3, Direction::Reply, GROUP | GROUP_DESC) => Self::length_prefixed(0, key(4, 4)),
            (Version::V1_3, Direction::Reply, METER) => Self::length_prefixed(4, key(0, 4)),
            (Version::V1_3, Direction::Reply, METER_CONFIG) => Self::length_prefixed(0, key(4, 4)),
            (Version::V1_3, Direction::Reply, PORT_DESC) => Self::fixed(64, key(0, 4)),
            (Version::V1_3, _, TABLE_FEATURES) => Self::length_prefixed(0, key(2, 1)),

            _ => Self::WHOLE,
        }
    }

    pub fn split(&self, body: Bytes) -> Result<Vec<Element>, CodecError> {
        if body.is_empty() {
            return Ok(Vec::new());
        }

        let mut result = Vec::new();
        match self.framing {
            Framing::Whole => {
                result.push(Element { key: None, data: body });
            }
            Framing::Fixed(record_len) => {
                if body.len() % record_len != 0 {
                    return Err(CodecError::Malformed(format!(
                        "multipart body of {} bytes is not a multiple of the record size {}", body.len(), record_len
                    )));
                }
                for start in (0..body.len()).step_by(record_len) {
                    result.push(self.element(body.slice(start..start + record_len))?);
                }
            }
            Framing::LengthPrefixed { offset } => {
                let mut start = 0;
                while start < body.len() {
                    let mut length_field = body.get(start + offset..)
                        .ok_or_else(|| CodecError::Malformed("record header overruns the multipart body".to_string()))?;
                    let record_len = length_field.get_u16_checked()
                        .map_err(|_| CodecError::Malformed("record header overruns the multipart body".to_string()))?
                        .safe_cast();
                    if record_len == 0 {
                        return Err(CodecError::Malformed("zero record length in multipart body".to_string()));
                    }
                    if start + record_len > body.len() {
                        return Err(CodecError::Malformed(format!(
                            "record of {} bytes at offset {} overruns the multipart body of {} bytes", record_len, start, body.len()
                        )));
                    }
                    result.push(self.element(body.slice(start..start + record_len))?);
                    start += record_len;
                }
            }
        }
        Ok(result)
    }

    fn element(&self, data: Bytes) -> Result<Element, CodecError> {
        let key = match self.key {
            None => None,
            Some(span) => {
                let mut raw = data.get(span.offset..span.offset + span.len)
                    .ok_or_else(|| CodecError::Malformed("element too short for its key".to_string()))?;
                let mut key = 0u64;
                while raw.has_remaining() {
                    key = (key << 8) | u64::from(raw.get_u8());
                }
                Some(ElementKey(key))
            }
        };
        Ok(Element { key, data })
    }
}
