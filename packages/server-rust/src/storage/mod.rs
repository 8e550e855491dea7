//! The persistence seam and its in-memory implementation.

mod memory;

use async_trait::async_trait;
use courier_core::model::{ChannelId, ChannelModel, Client, ClientId, MessageId};
use courier_core::msg::{Msg, MsgContext};
use tokio::sync::mpsc;

pub use memory::MemoryStorage;

/// Pluggable persistence backend for the broker.
///
/// Messages, channel descriptors, credentials, and subscriptions all live
/// behind this trait. The commit stream is the only path from persistence
/// to live delivery: every successful [`Storage::add_msg_in_channel`]
/// publishes exactly one [`MsgContext`] there, and nothing else does.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Durably append `msg` to `channel_id`, returning after persistence.
    ///
    /// On success an equivalent [`MsgContext`] is published on the commit
    /// stream exactly once. The stream is narrow by design, so this call
    /// backpressures against the broker's delivery loop.
    async fn add_msg_in_channel(&self, msg: Msg, channel_id: ChannelId) -> anyhow::Result<()>;

    /// Remove the given messages from a channel. Idempotent; ids that are
    /// not present are silently ignored.
    async fn remove_msg_in_channel(
        &self,
        message_ids: &[MessageId],
        channel_id: ChannelId,
    ) -> anyhow::Result<()>;

    /// Fetch one page of a channel's messages.
    ///
    /// Pages are 1-indexed and ordered by ascending timestamp, then
    /// message id. The final page may be short; no page ever exceeds
    /// `page_size` messages.
    async fn get_msg_in_channel(
        &self,
        channel_id: ChannelId,
        page_index: u64,
        page_size: u64,
    ) -> anyhow::Result<Vec<Msg>>;

    /// Persist a channel descriptor.
    async fn add_channel(&self, model: ChannelModel) -> anyhow::Result<()>;

    /// Fetch a channel descriptor; `None` means not configured.
    async fn get_channel(&self, channel_id: ChannelId) -> anyhow::Result<Option<ChannelModel>>;

    /// Subscribe a client to a channel. Idempotent.
    async fn bind(&self, client_id: ClientId, channel_id: ChannelId) -> anyhow::Result<()>;

    /// Subscriber ids of a channel, in an order that is stable for a given
    /// persisted state.
    async fn get_client_ids(&self, channel_id: ChannelId) -> anyhow::Result<Vec<ClientId>>;

    /// Persist a client credential record.
    async fn add_client(&self, client: Client) -> anyhow::Result<()>;

    /// Fetch a client credential record; `None` means unknown client.
    async fn get_client(&self, client_id: ClientId) -> anyhow::Result<Option<Client>>;

    /// Take the receiving end of the storage-commit stream.
    ///
    /// There is exactly one receiver; subsequent calls return `None`. The
    /// broker takes it at construction.
    fn take_commit_stream(&self) -> Option<mpsc::Receiver<MsgContext>>;
}
