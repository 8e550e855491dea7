//! The broker-wide error taxonomy.

use courier_core::codec::CodecError;
use courier_core::model::{ChannelId, ClientId};
use courier_core::packets::PacketType;

/// Errors surfaced by the broker engine.
///
/// Backpressure is deliberately absent: a full queue blocks its producer,
/// it never becomes an error or a silent drop.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The wire bytes could not be decoded into a packet.
    #[error("bad packet: {0}")]
    BadPacket(#[from] CodecError),
    /// A newly accepted connection opened with something other than CONNECT.
    #[error("first packet must be CONNECT, got {0}")]
    NotConnect(PacketType),
    /// Unknown client id or wrong password.
    #[error("authentication failed for client {client_id}")]
    AuthFailed { client_id: ClientId },
    /// The persistence backend failed.
    #[error("storage operation failed: {0}")]
    Store(#[from] anyhow::Error),
    /// A path that required a configured channel found none.
    #[error("no channel configured with id {0}")]
    NoSuchChannel(ChannelId),
    /// Encoding or socket write failed for a single recipient.
    #[error("delivery to client {client_id} failed: {source}")]
    Delivery {
        client_id: ClientId,
        #[source]
        source: std::io::Error,
    },
    /// The peer closed the connection mid-frame.
    #[error("connection closed")]
    ConnClosed,
    /// No codec is registered under the configured name.
    #[error("no codec registered under {0:?}")]
    UnknownCodec(String),
    /// The broker has shut down and no longer accepts work.
    #[error("broker has shut down")]
    Shutdown,
}
