//! Command acknowledgment.

use bytes::Bytes;

use super::{FixedHeader, PacketType};

/// Reply to a [`CmdPacket`](super::CmdPacket), echoing the command name
/// with a numeric status and an opaque result payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdAckPacket {
    pub fixed_header: FixedHeader,
    pub cmd: String,
    pub status: u16,
    pub payload: Bytes,
}

impl CmdAckPacket {
    #[must_use]
    pub fn new(cmd: impl Into<String>, status: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            fixed_header: FixedHeader::new(PacketType::CmdAck),
            cmd: cmd.into(),
            status,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_header(fixed_header: FixedHeader) -> Self {
        Self {
            fixed_header,
            cmd: String::new(),
            status: 0,
            payload: Bytes::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdack_echoes_command_name_and_status() {
        let packet = CmdAckPacket::new("presence.query", 200, &b"ok"[..]);
        assert_eq!(packet.fixed_header.packet_type, PacketType::CmdAck);
        assert_eq!(packet.cmd, "presence.query");
        assert_eq!(packet.status, 200);
    }
}
