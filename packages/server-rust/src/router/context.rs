//! Pooled routing contexts.
//!
//! An [`MContext`] wraps one decoded packet and its originating connection
//! for a trip through the middleware chain and match table. Contexts are
//! recycled through a bounded free-list; release strips the packet,
//! connection, and chain references so nothing of one request can leak
//! into the next.

use std::sync::Arc;

use courier_core::model::{ChannelId, ClientId};
use courier_core::msg::Msg;
use courier_core::packets::{CmdPacket, Packet, PacketType};
use parking_lot::Mutex;
use tracing::{error, warn};

use super::Handler;
use crate::broker::{AuthenticatedContext, Channel, PacketContext, Shared};
use crate::config::ServerConfig;
use crate::error::BrokerError;
use crate::network::{Conn, StatefulConn};
use crate::storage::Storage;

/// Cursor value that short-circuits the remaining chain.
pub(crate) const ABORT_INDEX: i8 = i8::MAX / 2;

struct ActiveState {
    packet_ctx: PacketContext,
    chain: Arc<[Arc<dyn Handler>]>,
    shared: Arc<Shared>,
}

/// Routing context handed to middleware and match handlers.
///
/// Accessors panic when used after release back to the pool; the broker's
/// dispatch path is the only caller and never does.
pub struct MContext {
    state: Option<ActiveState>,
    index: i8,
}

impl MContext {
    fn idle() -> Self {
        Self {
            state: None,
            index: -1,
        }
    }

    fn activate(
        &mut self,
        packet_ctx: PacketContext,
        chain: Arc<[Arc<dyn Handler>]>,
        shared: Arc<Shared>,
    ) {
        self.index = -1;
        self.state = Some(ActiveState {
            packet_ctx,
            chain,
            shared,
        });
    }

    fn clear(&mut self) {
        self.index = -1;
        self.state = None;
    }

    fn state(&self) -> &ActiveState {
        self.state
            .as_ref()
            .expect("routing context used after release")
    }

    /// The decoded packet under dispatch.
    #[must_use]
    pub fn packet(&self) -> &Packet {
        &self.state().packet_ctx.packet
    }

    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.packet().packet_type()
    }

    /// The command view of the packet, when it is one.
    #[must_use]
    pub fn cmd_packet(&self) -> Option<&CmdPacket> {
        match self.packet() {
            Packet::Cmd(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// The originating connection.
    #[must_use]
    pub fn conn(&self) -> &Conn {
        &self.state().packet_ctx.conn
    }

    /// The authenticated client id of the originating connection, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        self.conn().stateful().and_then(|conn| conn.client_id())
    }

    /// Build a [`Msg`] from a message packet.
    ///
    /// The sender is the connection's authenticated id when there is one,
    /// falling back to the header's `from` field on stateless transports.
    /// Returns `None` for non-message packets and for the invalid id 0.
    #[must_use]
    pub fn msg(&self) -> Option<Msg> {
        let Packet::Message(packet) = self.packet() else {
            return None;
        };
        if packet.message_id == 0 {
            return None;
        }
        let from = self
            .client_id()
            .unwrap_or(packet.fixed_header.from);
        Some(Msg::new(
            packet.message_id,
            from,
            packet.timestamp,
            packet.payload.clone(),
        ))
    }

    #[must_use]
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.state().shared.storage)
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.state().shared.config
    }

    /// Resolve a runtime channel through the broker's cache.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Store`] when the descriptor fetch fails.
    pub async fn get_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<Arc<Channel>>, BrokerError> {
        Shared::get_channel(&self.state().shared, channel_id).await
    }

    /// Encode a packet and write it back on the originating connection.
    ///
    /// Failures are logged; the dispatch continues either way.
    pub async fn reply_packet(&self, packet: Packet) {
        let frame = match self.state().shared.codec.encode(&packet) {
            Ok(frame) => frame,
            Err(err) => {
                error!(packet_type = %packet.packet_type(), error = %err, "failed to encode reply");
                return;
            }
        };
        if let Err(err) = self.conn().write_all(&frame).await {
            error!(packet_type = %packet.packet_type(), error = %err, "failed to write reply");
        }
    }

    /// Hand an authentication result to the broker's event loop.
    pub async fn emit_authenticated(&self, client_id: ClientId, conn: Arc<StatefulConn>) {
        if self
            .state()
            .shared
            .authenticated_tx
            .send(AuthenticatedContext::new(client_id, conn))
            .await
            .is_err()
        {
            warn!(client_id, "authenticated stream closed");
        }
    }

    /// Run the remaining middleware chain.
    ///
    /// A handler may call this itself to wrap the rest of the chain; the
    /// cursor guarantees each middleware runs at most once per dispatch.
    pub async fn next(&mut self) {
        self.index += 1;
        loop {
            if self.is_aborted() {
                break;
            }
            let handler = {
                let state = self.state();
                match usize::try_from(self.index)
                    .ok()
                    .and_then(|i| state.chain.get(i))
                {
                    Some(handler) => Arc::clone(handler),
                    None => break,
                }
            };
            handler.call(self).await;
            self.index += 1;
        }
    }

    /// Short-circuit the rest of the chain and the match handlers.
    pub fn abort(&mut self) {
        self.index = ABORT_INDEX;
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.index >= ABORT_INDEX
    }
}

/// Bounded free-list of routing contexts.
///
/// Released contexts are cleared before they are pooled; contexts beyond
/// the capacity are simply dropped.
pub(crate) struct ContextPool {
    free: Mutex<Vec<MContext>>,
    capacity: usize,
}

impl ContextPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub(crate) fn acquire(
        &self,
        packet_ctx: PacketContext,
        chain: Arc<[Arc<dyn Handler>]>,
        shared: Arc<Shared>,
    ) -> MContext {
        let mut ctx = self.free.lock().pop().unwrap_or_else(MContext::idle);
        ctx.activate(packet_ctx, chain, shared);
        ctx
    }

    pub(crate) fn release(&self, mut ctx: MContext) {
        ctx.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(ctx);
        }
    }
}
