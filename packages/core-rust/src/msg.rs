//! Application messages and the routing envelope they travel in.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::CodecError;
use crate::model::{ChannelId, ClientId, MessageId};

/// One application message.
///
/// `timestamp` is millisecond epoch time assigned by the producer when the
/// message is created and never rewritten afterwards. `message_id` is
/// globally unique and monotonic per sender; zero is not a valid id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub message_id: MessageId,
    pub from: ClientId,
    pub timestamp: i64,
    pub payload: Bytes,
}

impl Msg {
    #[must_use]
    pub fn new(
        message_id: MessageId,
        from: ClientId,
        timestamp: i64,
        payload: impl Into<Bytes>,
    ) -> Self {
        debug_assert!(message_id > 0, "message ids start at 1");
        Self {
            message_id,
            from,
            timestamp,
            payload: payload.into(),
        }
    }

    /// Binary form: `from ‖ message_id ‖ timestamp ‖ payload`, all integers
    /// big-endian unsigned 64-bit, payload consuming the remainder.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24 + self.payload.len());
        buf.put_u64(self.from);
        buf.put_u64(self.message_id);
        #[allow(clippy::cast_sign_loss)]
        buf.put_u64(self.timestamp as u64);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Inverse of [`Msg::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] when `data` is shorter than the
    /// 24-byte integer prefix.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 24 {
            return Err(CodecError::Truncated {
                needed: 24 - data.len(),
            });
        }
        let mut buf = Bytes::copy_from_slice(data);
        let from = buf.get_u64();
        let message_id = buf.get_u64();
        #[allow(clippy::cast_possible_wrap)]
        let timestamp = buf.get_u64() as i64;
        Ok(Self {
            message_id,
            from,
            timestamp,
            payload: buf,
        })
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message_id: {} from: {} payload: {} bytes",
            self.message_id,
            self.from,
            self.payload.len()
        )
    }
}

/// Routing envelope pairing a message with its target channel.
///
/// Travels on the storage-commit stream and on channel delivery inboxes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgContext {
    pub msg: Msg,
    pub channel_id: ChannelId,
}

impl MsgContext {
    #[must_use]
    pub fn new(msg: Msg, channel_id: ChannelId) -> Self {
        Self { msg, channel_id }
    }
}
