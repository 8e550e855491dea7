//! The application message publish packet.

use std::fmt;

use bytes::Bytes;

use super::{FixedHeader, PacketType};
use crate::model::{ChannelId, MessageId};

/// Carries one application message to or from a channel.
///
/// Constructed with QoS 1: delivery is acknowledged with a `MsgAck`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePacket {
    pub fixed_header: FixedHeader,
    pub channel_id: ChannelId,
    /// Millisecond epoch time assigned by the message producer.
    pub timestamp: i64,
    pub message_id: MessageId,
    pub payload: Bytes,
}

impl MessagePacket {
    #[must_use]
    pub fn new(
        message_id: MessageId,
        channel_id: ChannelId,
        timestamp: i64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            fixed_header: FixedHeader::new(PacketType::Message).with_qos(1),
            channel_id,
            timestamp,
            message_id,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_header(fixed_header: FixedHeader) -> Self {
        Self {
            fixed_header,
            channel_id: 0,
            timestamp: 0,
            message_id: 0,
            payload: Bytes::new(),
        }
    }
}

impl fmt::Display for MessagePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} channel_id: {} message_id: {} payload: {} bytes",
            self.fixed_header,
            self.channel_id,
            self.message_id,
            self.payload.len()
        )
    }
}
