//! The socket-server seam.

use async_trait::async_trait;

/// A socket server attached to the broker.
///
/// Implementations own their accept and read loops and feed the broker's
/// input queues: accepted connections into the accept stream, decoded
/// packets into the packet stream, and disconnects into the exit stream.
/// The broker starts attached servers in order and stops them in order on
/// shutdown.
#[async_trait]
pub trait Server: Send + Sync {
    /// Bind and begin accepting connections.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop accepting and release the listener.
    async fn stop(&self) -> anyhow::Result<()>;
}
