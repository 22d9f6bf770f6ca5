use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The protocol revisions this crate speaks. The discriminant is the wire value of the
///  header's version byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Version {
    V1_0 = 0x01,
    V1_2 = 0x03,
    V1_3 = 0x04,
}

impl Version {
    pub fn wire(self) -> u8 {
        self.into()
    }

    pub fn from_wire(raw: u8) -> Option<Version> {
        Version::try_from(raw).ok()
    }
}
