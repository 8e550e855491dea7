//! Persistent descriptors: channels, clients, and the id aliases used
//! throughout the broker.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Globally unique client identifier.
pub type ClientId = u64;

/// Channel identifier. For person channels this equals the owning client id.
pub type ChannelId = u64;

/// Message identifier, unique and monotonic per sender.
pub type MessageId = u64;

/// Classifies a channel as a personal inbox or a multi-subscriber group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    /// Personal inbox. Well-formed configurations bind exactly one
    /// subscriber whose client id equals the channel id.
    Person,
    /// Broadcast channel: delivery re-enqueues into each subscriber's
    /// person channel.
    Group,
}

/// Persistent channel descriptor. Runtime channels are materialised from
/// this lazily by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelModel {
    pub channel_id: ChannelId,
    pub channel_type: ChannelType,
}

impl ChannelModel {
    #[must_use]
    pub fn new(channel_id: ChannelId, channel_type: ChannelType) -> Self {
        Self {
            channel_id,
            channel_type,
        }
    }
}

/// A registered client credential pair.
///
/// Password comparison is exact equality, performed by the storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: ClientId,
    pub password: String,
}

impl Client {
    #[must_use]
    pub fn new(client_id: ClientId, password: impl Into<String>) -> Self {
        Self {
            client_id,
            password: password.into(),
        }
    }

    /// Binary form: `client_id (u64 BE)` followed by the password as a
    /// u16-BE length-prefixed string.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 2 + self.password.len());
        buf.put_u64(self.client_id);
        buf.put_u16(u16::try_from(self.password.len()).unwrap_or(u16::MAX));
        buf.put_slice(self.password.as_bytes());
        buf.freeze()
    }

    /// Inverse of [`Client::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] when `data` is shorter than the
    /// encoded form claims, and [`CodecError::InvalidString`] for a
    /// non-UTF-8 password field.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut buf = Bytes::copy_from_slice(data);
        if buf.remaining() < 10 {
            return Err(CodecError::Truncated {
                needed: 10 - buf.remaining(),
            });
        }
        let client_id = buf.get_u64();
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(CodecError::Truncated {
                needed: len - buf.remaining(),
            });
        }
        let password = String::from_utf8(buf.split_to(len).to_vec())?;
        Ok(Self {
            client_id,
            password,
        })
    }
}
