//! Courier Core -- packet model, wire codec, and message/channel schemas.
//!
//! This crate provides the protocol layer for the Courier messaging broker:
//!
//! - **Packets** ([`packets`]): the eight control packet types and their
//!   shared [`packets::FixedHeader`]
//! - **Codec** ([`codec`]): the [`codec::PacketCodec`] seam plus the default
//!   `mqtt-im` wire codec
//! - **Messages** ([`msg`]): [`msg::Msg`] and its routing envelope
//!   [`msg::MsgContext`]
//! - **Models** ([`model`]): persistent descriptors for channels and clients
//!
//! It is runtime-free: no async executor, no I/O. The server crate layers
//! connections, storage, and delivery on top.

pub mod codec;
pub mod model;
pub mod msg;
pub mod packets;

// Codec
pub use codec::{codec_by_name, CodecError, MqttImCodec, PacketCodec, DEFAULT_CODEC};

// Models
pub use model::{ChannelId, ChannelModel, ChannelType, Client, ClientId, MessageId};

// Messages
pub use msg::{Msg, MsgContext};

// Packets
pub use packets::{
    CmdAckPacket, CmdPacket, ConnackCode, ConnackPacket, ConnectPacket, FixedHeader,
    MessagePacket, MsgAckPacket, Packet, PacketType, PingReqPacket, PingRespPacket,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    #[test]
    fn re_exports_accessible_from_crate_root() {
        let _codec = MqttImCodec;
        let _packet = Packet::PingReq(PingReqPacket::new());
        let _model = ChannelModel::new(1, ChannelType::Person);
    }
}
