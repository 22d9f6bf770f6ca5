use crate::protocol::version::Version;

/// Semantic message kinds, independent of the opcode a specific revision assigns them.
///
/// 1.0 'stats' messages and 1.3 'multipart' messages are the same kind: they share their
///  layout (a subtype, a flags field and a repeated body) and are fragmented the same way.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageKind {
    Hello,
    Error,
    EchoRequest,
    EchoReply,
    Experimenter,
    FeaturesRequest,
    FeaturesReply,
    GetConfigRequest,
    GetConfigReply,
    SetConfig,
    PacketIn,
    FlowRemoved,
    PortStatus,
    PacketOut,
    FlowMod,
    GroupMod,
    PortMod,
    TableMod,
    MultipartRequest,
    MultipartReply,
    BarrierRequest,
    BarrierReply,
    QueueGetConfigRequest,
    QueueGetConfigReply,
    RoleRequest,
    RoleReply,
    GetAsyncRequest,
    GetAsyncReply,
    SetAsync,
    MeterMod,
}

use MessageKind::*;

const V1_0_OPCODES: &[MessageKind] = &[
    Hello, Error, EchoRequest, EchoReply, Experimenter,
    FeaturesRequest, FeaturesReply, GetConfigRequest, GetConfigReply, SetConfig,
    PacketIn, FlowRemoved, PortStatus, PacketOut, FlowMod, PortMod,
    MultipartRequest, MultipartReply, BarrierRequest, BarrierReply,
    QueueGetConfigRequest, QueueGetConfigReply,
];

const V1_2_OPCODES: &[MessageKind] = &[
    Hello, Error, EchoRequest, EchoReply, Experimenter,
    FeaturesRequest, FeaturesReply, GetConfigRequest, GetConfigReply, SetConfig,
    PacketIn, FlowRemoved, PortStatus, PacketOut, FlowMod, GroupMod, PortMod, TableMod,
    MultipartRequest, MultipartReply, BarrierRequest, BarrierReply,
    QueueGetConfigRequest, QueueGetConfigReply, RoleRequest, RoleReply,
];

const V1_3_OPCODES: &[MessageKind] = &[
    Hello, Error, EchoRequest, EchoReply, Experimenter,
    FeaturesRequest, FeaturesReply, GetConfigRequest, GetConfigReply, SetConfig,
    PacketIn, FlowRemoved, PortStatus, PacketOut, FlowMod, GroupMod, PortMod, TableMod,
    MultipartRequest, MultipartReply, BarrierRequest, BarrierReply,
    QueueGetConfigRequest, QueueGetConfigReply, RoleRequest, RoleReply,
    GetAsyncRequest, GetAsyncReply, SetAsync, MeterMod,
];

/// opcodes are dense in all supported revisions, so the table index is the opcode
fn opcode_table(version: Version) -> &'static [MessageKind] {
    match version {
        Version::V1_0 => V1_0_OPCODES,
        Version::V1_2 => V1_2_OPCODES,
        Version::V1_3 => V1_3_OPCODES,
    }
}

impl MessageKind {
    pub fn lookup(version: Version, msg_type: u8) -> Option<MessageKind> {
        opcode_table(version).get(usize::from(msg_type)).copied()
    }

    /// the wire opcode of this kind in a given revision, or `None` if the revision does not
    ///  have it
    pub fn opcode(self, version: Version) -> Option<u8> {
        opcode_table(version).iter()
            .position(|&k| k == self)
            .and_then(|idx| u8::try_from(idx).ok())
    }

    pub fn is_multipart(self) -> bool {
        matches!(self, MultipartRequest | MultipartReply)
    }
}
