//! In-memory [`Storage`] backend.
//!
//! Holds everything in maps behind a single mutex. Suitable for tests and
//! single-node deployments where durability is not required; the commit
//! stream contract is identical to a durable backend's.

use std::collections::HashMap;

use anyhow::{bail, ensure, Context as _};
use async_trait::async_trait;
use courier_core::model::{ChannelId, ChannelModel, Client, ClientId, MessageId};
use courier_core::msg::{Msg, MsgContext};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::Storage;
use crate::config::ServerConfig;

#[derive(Default)]
struct Inner {
    /// Per-channel logs, kept sorted by (timestamp, message_id).
    channel_msgs: HashMap<ChannelId, Vec<Msg>>,
    channels: HashMap<ChannelId, ChannelModel>,
    clients: HashMap<ClientId, Client>,
    /// Subscriber lists in bind order, duplicate-free.
    subscriptions: HashMap<ChannelId, Vec<ClientId>>,
}

/// In-memory storage backend.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    commit_tx: mpsc::Sender<MsgContext>,
    commit_rx: Mutex<Option<mpsc::Receiver<MsgContext>>>,
}

impl MemoryStorage {
    /// Build with the commit stream sized by the default
    /// [`ServerConfig::mem_queue_size`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_commit_capacity(ServerConfig::default().mem_queue_size)
    }

    /// Build with an explicit commit stream capacity, normally the
    /// configured `mem_queue_size`. Producers block once this many commits
    /// are waiting on the broker, which bounds ingest without coupling
    /// every [`Storage::add_msg_in_channel`] to an event-loop round trip.
    /// Tests use small capacities to exercise commit backpressure.
    #[must_use]
    pub fn with_commit_capacity(capacity: usize) -> Self {
        let (commit_tx, commit_rx) = mpsc::channel(capacity);
        Self {
            inner: Mutex::new(Inner::default()),
            commit_tx,
            commit_rx: Mutex::new(Some(commit_rx)),
        }
    }

    /// Number of messages currently stored in a channel.
    #[must_use]
    pub fn msg_count(&self, channel_id: ChannelId) -> usize {
        self.inner
            .lock()
            .channel_msgs
            .get(&channel_id)
            .map_or(0, Vec::len)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn add_msg_in_channel(&self, msg: Msg, channel_id: ChannelId) -> anyhow::Result<()> {
        let commit = MsgContext::new(msg.clone(), channel_id);
        {
            let mut inner = self.inner.lock();
            let log = inner.channel_msgs.entry(channel_id).or_default();
            let position = log
                .partition_point(|m| (m.timestamp, m.message_id) <= (msg.timestamp, msg.message_id));
            log.insert(position, msg);
        }
        // The guard is released before publishing: the send may park until
        // the broker has room for the commit.
        self.commit_tx
            .send(commit)
            .await
            .context("commit stream closed")?;
        Ok(())
    }

    async fn remove_msg_in_channel(
        &self,
        message_ids: &[MessageId],
        channel_id: ChannelId,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(log) = inner.channel_msgs.get_mut(&channel_id) {
            log.retain(|m| !message_ids.contains(&m.message_id));
        }
        Ok(())
    }

    async fn get_msg_in_channel(
        &self,
        channel_id: ChannelId,
        page_index: u64,
        page_size: u64,
    ) -> anyhow::Result<Vec<Msg>> {
        ensure!(page_index >= 1, "page_index is 1-based, got {page_index}");
        ensure!(page_size > 0, "page_size must be positive");

        let inner = self.inner.lock();
        let Some(log) = inner.channel_msgs.get(&channel_id) else {
            return Ok(Vec::new());
        };
        let start = usize::try_from((page_index - 1) * page_size)?;
        let size = usize::try_from(page_size)?;
        if start >= log.len() {
            return Ok(Vec::new());
        }
        let end = usize::min(start + size, log.len());
        Ok(log[start..end].to_vec())
    }

    async fn add_channel(&self, model: ChannelModel) -> anyhow::Result<()> {
        self.inner.lock().channels.insert(model.channel_id, model);
        Ok(())
    }

    async fn get_channel(&self, channel_id: ChannelId) -> anyhow::Result<Option<ChannelModel>> {
        Ok(self.inner.lock().channels.get(&channel_id).copied())
    }

    async fn bind(&self, client_id: ClientId, channel_id: ChannelId) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if inner.channels.get(&channel_id).is_none() {
            bail!("cannot bind to unconfigured channel {channel_id}");
        }
        let subscribers = inner.subscriptions.entry(channel_id).or_default();
        if !subscribers.contains(&client_id) {
            subscribers.push(client_id);
        }
        Ok(())
    }

    async fn get_client_ids(&self, channel_id: ChannelId) -> anyhow::Result<Vec<ClientId>> {
        Ok(self
            .inner
            .lock()
            .subscriptions
            .get(&channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_client(&self, client: Client) -> anyhow::Result<()> {
        self.inner.lock().clients.insert(client.client_id, client);
        Ok(())
    }

    async fn get_client(&self, client_id: ClientId) -> anyhow::Result<Option<Client>> {
        Ok(self.inner.lock().clients.get(&client_id).cloned())
    }

    fn take_commit_stream(&self) -> Option<mpsc::Receiver<MsgContext>> {
        self.commit_rx.lock().take()
    }
}
