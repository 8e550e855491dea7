//! Runtime channels and their delivery workers.
//!
//! A channel is materialised lazily from its persisted descriptor and lives
//! until broker shutdown. It owns one bounded delivery inbox and one worker
//! task; the broker feeds the inbox after observing a committed message for
//! this channel, and the worker fans each message out to subscribers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use courier_core::model::{ChannelId, ChannelModel, ChannelType, ClientId};
use courier_core::msg::Msg;
use courier_core::packets::{MessagePacket, Packet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use super::Shared;
use crate::error::BrokerError;
use crate::network::ShutdownController;

/// Delivery inbox capacity. A full inbox blocks its producers (the broker
/// event loop and drain tasks), pushing backpressure from delivery back
/// toward ingest.
pub(crate) const DELIVERY_INBOX_CAPACITY: usize = 1024;

/// An active channel: descriptor, message counter, delivery inbox, and the
/// worker draining it.
///
/// The broker owns the channel; the channel holds only a non-owning handle
/// back to broker internals, which it needs to resolve sibling channels
/// during group fan-out.
pub struct Channel {
    model: ChannelModel,
    message_count: AtomicU64,
    inbox_tx: mpsc::Sender<Msg>,
    shared: Weak<Shared>,
}

impl Channel {
    /// Create the channel and start its delivery worker.
    pub(crate) fn spawn(
        model: ChannelModel,
        shared: Weak<Shared>,
        shutdown: &ShutdownController,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(DELIVERY_INBOX_CAPACITY);
        let channel = Arc::new(Self {
            model,
            message_count: AtomicU64::new(0),
            inbox_tx,
            shared,
        });

        let worker = Arc::clone(&channel);
        let shutdown_rx = shutdown.receiver();
        let guard = shutdown.task_guard();
        tokio::spawn(async move {
            worker.run_worker(inbox_rx, shutdown_rx).await;
            drop(guard);
        });

        channel
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.model.channel_id
    }

    #[must_use]
    pub fn channel_type(&self) -> ChannelType {
        self.model.channel_type
    }

    /// Messages accepted through [`Channel::put_msg`] since materialisation.
    #[must_use]
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Persist a message into this channel.
    ///
    /// Never delivers directly: delivery is driven solely by the
    /// storage-commit stream, which the broker routes back into this
    /// channel's inbox.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Store`] when persistence fails and
    /// [`BrokerError::Shutdown`] when the broker is gone.
    pub async fn put_msg(&self, msg: Msg) -> Result<(), BrokerError> {
        let shared = self.shared.upgrade().ok_or(BrokerError::Shutdown)?;
        shared.storage.add_msg_in_channel(msg, self.id()).await?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Push a message onto the delivery inbox, awaiting while it is full.
    pub(crate) async fn enqueue(&self, msg: Msg) -> Result<(), mpsc::error::SendError<Msg>> {
        self.inbox_tx.send(msg).await
    }

    async fn run_worker(
        self: Arc<Self>,
        mut inbox: mpsc::Receiver<Msg>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!(channel_id = self.id(), "delivery worker started");
        loop {
            tokio::select! {
                maybe_msg = inbox.recv() => match maybe_msg {
                    Some(msg) => self.fan_out(msg).await,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!(channel_id = self.id(), "delivery worker stopped");
    }

    /// Deliver one message to this channel's subscribers.
    ///
    /// Person channels write directly to each online subscriber's
    /// connection; group channels re-enqueue into each subscriber's person
    /// channel, whose own worker then applies the person rule. The sender
    /// never receives an echo.
    async fn fan_out(&self, msg: Msg) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        debug!(channel_id = self.id(), message_id = msg.message_id, "delivering message");

        let client_ids = match shared.storage.get_client_ids(self.id()).await {
            Ok(ids) => ids,
            Err(err) => {
                error!(channel_id = self.id(), error = %err, "failed to resolve subscribers");
                return;
            }
        };
        if client_ids.is_empty() {
            warn!(channel_id = self.id(), "channel has no subscribers");
            return;
        }

        for client_id in client_ids {
            if client_id == msg.from {
                continue;
            }
            match self.model.channel_type {
                ChannelType::Person => self.deliver_direct(&shared, client_id, &msg).await,
                ChannelType::Group => self.relay_to_person(&shared, client_id, &msg).await,
            }
        }
    }

    /// Write the message straight to a subscriber's live connection.
    ///
    /// Offline subscribers are skipped: the message is already persisted in
    /// this channel and the offline drain replays it on their reconnect.
    /// A failed encode or write loses only this recipient's delivery; the
    /// fan-out continues.
    async fn deliver_direct(&self, shared: &Arc<Shared>, client_id: ClientId, msg: &Msg) {
        if !shared.presence.is_online(client_id) {
            return;
        }
        let Some(conn) = shared.conns.get(client_id) else {
            warn!(client_id, "subscriber is online but has no registered connection");
            return;
        };

        let mut packet = Packet::Message(MessagePacket::new(
            msg.message_id,
            self.id(),
            msg.timestamp,
            msg.payload.clone(),
        ));
        packet.fixed_header_mut().from = msg.from;

        let frame = match shared.codec.encode(&packet) {
            Ok(frame) => frame,
            Err(err) => {
                error!(client_id, message_id = msg.message_id, error = %err, "failed to encode message");
                return;
            }
        };
        if let Err(source) = conn.write_all(&frame).await {
            let err = BrokerError::Delivery { client_id, source };
            error!(message_id = msg.message_id, error = %err, "delivery failed");
        }
    }

    /// Group fan-out: persist into the subscriber's person channel.
    ///
    /// The second persistence flows through the storage-commit stream back
    /// to the person channel's worker, so offline drain covers group
    /// messages with no extra machinery.
    async fn relay_to_person(&self, shared: &Arc<Shared>, client_id: ClientId, msg: &Msg) {
        match Shared::get_channel(shared, client_id).await {
            Ok(Some(person)) => {
                if let Err(err) = person.put_msg(msg.clone()).await {
                    warn!(
                        client_id,
                        message_id = msg.message_id,
                        error = %err,
                        "failed to store message in subscriber's person channel"
                    );
                }
            }
            Ok(None) => warn!(client_id, "group subscriber has no person channel"),
            Err(err) => {
                error!(client_id, error = %err, "failed to resolve subscriber's person channel");
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("channel_id", &self.model.channel_id)
            .field("channel_type", &self.model.channel_type)
            .field("message_count", &self.message_count())
            .finish_non_exhaustive()
    }
}
