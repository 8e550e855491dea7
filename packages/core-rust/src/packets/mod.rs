//! Control packet types and the fixed header shared by all of them.
//!
//! Every packet starts with a [`FixedHeader`] carrying its type, flag bits,
//! and remaining length; the per-type remainder follows. [`Packet`] is the
//! decoded sum type handed around the broker.

mod cmd;
mod cmdack;
mod connect;
mod message;
mod msgack;

use std::fmt;

pub use cmd::CmdPacket;
pub use cmdack::CmdAckPacket;
pub use connect::{ConnackCode, ConnackPacket, ConnectPacket};
pub use message::MessagePacket;
pub use msgack::MsgAckPacket;

use crate::model::ClientId;

/// Control packet type, carried in the upper nibble of the first wire byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Client request to open an authenticated session.
    Connect = 1,
    /// Connect acknowledgment.
    Connack = 2,
    /// Application message publish.
    Message = 3,
    /// Message delivery acknowledgment.
    MsgAck = 4,
    /// Heartbeat request.
    PingReq = 5,
    /// Heartbeat response.
    PingResp = 6,
    /// Named command (extension surface).
    Cmd = 7,
    /// Command acknowledgment.
    CmdAck = 8,
}

impl PacketType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Connect => "CONNECT",
            PacketType::Connack => "CONNACK",
            PacketType::Message => "MESSAGE",
            PacketType::MsgAck => "MSGACK",
            PacketType::PingReq => "PINGREQ",
            PacketType::PingResp => "PINGRESP",
            PacketType::Cmd => "CMD",
            PacketType::CmdAck => "CMDACK",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Message),
            4 => Ok(PacketType::MsgAck),
            5 => Ok(PacketType::PingReq),
            6 => Ok(PacketType::PingResp),
            7 => Ok(PacketType::Cmd),
            8 => Ok(PacketType::CmdAck),
            other => Err(other),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-packet metadata prefix common to every packet type.
///
/// `from` identifies the sender on transports that carry no connection
/// state; connection-bound codecs neither encode nor decode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub dup: bool,
    /// Quality of service, 0 or 1.
    pub qos: u8,
    pub retain: bool,
    /// Byte length of the packet remainder, filled in by the codec.
    pub remaining_length: usize,
    pub from: ClientId,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            dup: false,
            qos: 0,
            retain: false,
            remaining_length: 0,
            from: 0,
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }
}

impl fmt::Display for FixedHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: from: {} dup: {} qos: {} retain: {} remaining: {}",
            self.packet_type, self.from, self.dup, self.qos, self.retain, self.remaining_length
        )
    }
}

/// Heartbeat request. Header only, no remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingReqPacket {
    pub fixed_header: FixedHeader,
}

impl PingReqPacket {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fixed_header: FixedHeader::new(PacketType::PingReq),
        }
    }
}

impl Default for PingReqPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// Heartbeat response. Header only, no remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingRespPacket {
    pub fixed_header: FixedHeader,
}

impl PingRespPacket {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fixed_header: FixedHeader::new(PacketType::PingResp),
        }
    }
}

impl Default for PingRespPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Message(MessagePacket),
    MsgAck(MsgAckPacket),
    PingReq(PingReqPacket),
    PingResp(PingRespPacket),
    Cmd(CmdPacket),
    CmdAck(CmdAckPacket),
}

impl Packet {
    #[must_use]
    pub fn fixed_header(&self) -> &FixedHeader {
        match self {
            Packet::Connect(p) => &p.fixed_header,
            Packet::Connack(p) => &p.fixed_header,
            Packet::Message(p) => &p.fixed_header,
            Packet::MsgAck(p) => &p.fixed_header,
            Packet::PingReq(p) => &p.fixed_header,
            Packet::PingResp(p) => &p.fixed_header,
            Packet::Cmd(p) => &p.fixed_header,
            Packet::CmdAck(p) => &p.fixed_header,
        }
    }

    pub fn fixed_header_mut(&mut self) -> &mut FixedHeader {
        match self {
            Packet::Connect(p) => &mut p.fixed_header,
            Packet::Connack(p) => &mut p.fixed_header,
            Packet::Message(p) => &mut p.fixed_header,
            Packet::MsgAck(p) => &mut p.fixed_header,
            Packet::PingReq(p) => &mut p.fixed_header,
            Packet::PingResp(p) => &mut p.fixed_header,
            Packet::Cmd(p) => &mut p.fixed_header,
            Packet::CmdAck(p) => &mut p.fixed_header,
        }
    }

    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.fixed_header().packet_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_round_trips_through_u8() {
        for raw in 1u8..=8 {
            let ty = PacketType::try_from(raw).unwrap();
            assert_eq!(ty as u8, raw);
        }
    }

    #[test]
    fn packet_type_rejects_out_of_range() {
        assert_eq!(PacketType::try_from(0), Err(0));
        assert_eq!(PacketType::try_from(9), Err(9));
        assert_eq!(PacketType::try_from(255), Err(255));
    }

    #[test]
    fn fixed_header_defaults_are_empty_flags() {
        let header = FixedHeader::new(PacketType::Message);
        assert_eq!(header.packet_type, PacketType::Message);
        assert!(!header.dup);
        assert_eq!(header.qos, 0);
        assert!(!header.retain);
        assert_eq!(header.remaining_length, 0);
        assert_eq!(header.from, 0);
    }

    #[test]
    fn packet_exposes_its_header() {
        let packet = Packet::Message(MessagePacket::new(10, 1, 0, &b"hi"[..]));
        assert_eq!(packet.packet_type(), PacketType::Message);
        assert_eq!(packet.fixed_header().qos, 1);
    }

    #[test]
    fn header_from_field_is_mutable_for_stateless_transports() {
        let mut packet = Packet::PingReq(PingReqPacket::new());
        packet.fixed_header_mut().from = 42;
        assert_eq!(packet.fixed_header().from, 42);
    }
}
