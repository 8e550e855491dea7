//! Message delivery acknowledgment.

use super::{FixedHeader, PacketType};
use crate::model::MessageId;

/// Acknowledges receipt of one or more messages by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgAckPacket {
    pub fixed_header: FixedHeader,
    pub message_ids: Vec<MessageId>,
}

impl MsgAckPacket {
    #[must_use]
    pub fn new(message_ids: Vec<MessageId>) -> Self {
        Self {
            fixed_header: FixedHeader::new(PacketType::MsgAck),
            message_ids,
        }
    }

    #[must_use]
    pub fn with_header(fixed_header: FixedHeader) -> Self {
        Self {
            fixed_header,
            message_ids: Vec::new(),
        }
    }
}
