//! The broker core: channel cache, event loop, and lifecycle.
//!
//! One event-loop task multiplexes the broker's input streams: newly
//! accepted connections, decoded packets, authentication results, storage
//! commits, connection exits, and shutdown. Everything is a bounded queue,
//! so backpressure is visible end to end and shutdown is a single signal.

mod channel;
pub(crate) mod drain;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use courier_core::codec::{codec_by_name, PacketCodec};
use courier_core::model::{ChannelId, ClientId};
use courier_core::msg::MsgContext;
use courier_core::packets::{Packet, PacketType};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, trace, warn};

pub use channel::Channel;

use crate::config::ServerConfig;
use crate::error::BrokerError;
use crate::network::{read_packet, Conn, ConnManager, Presence, Server, ShutdownController, StatefulConn};
use crate::router::{ContextPool, Router};
use crate::storage::Storage;

/// Capacity of each broker input queue.
const INPUT_QUEUE_CAPACITY: usize = 1024;

/// Bounded free-list size for pooled routing contexts.
const CONTEXT_POOL_CAPACITY: usize = 128;

/// How long `stop` waits for workers and drains to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Headroom on top of `max_msg_size` for packet framing.
const FRAME_OVERHEAD: usize = 1024;

/// A decoded packet paired with the connection it arrived on.
#[derive(Debug)]
pub struct PacketContext {
    pub packet: Packet,
    pub conn: Conn,
}

impl PacketContext {
    #[must_use]
    pub fn new(packet: Packet, conn: Conn) -> Self {
        Self { packet, conn }
    }
}

/// Emitted by the connect handler once credentials check out.
///
/// Only stateful connections authenticate; stateless transports identify
/// senders per packet instead.
#[derive(Debug)]
pub struct AuthenticatedContext {
    pub client_id: ClientId,
    pub conn: Arc<StatefulConn>,
}

impl AuthenticatedContext {
    #[must_use]
    pub fn new(client_id: ClientId, conn: Arc<StatefulConn>) -> Self {
        Self { client_id, conn }
    }
}

/// Broker internals shared with channels, routing contexts, and drains.
///
/// Channels hold this through a `Weak`, keeping ownership strictly with
/// the broker.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) codec: Arc<dyn PacketCodec>,
    pub(crate) conns: ConnManager,
    pub(crate) presence: Arc<Presence>,
    pub(crate) authenticated_tx: mpsc::Sender<AuthenticatedContext>,
    packet_tx: mpsc::Sender<PacketContext>,
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
    pub(crate) shutdown: ShutdownController,
}

impl Shared {
    /// Resolve the runtime channel for `channel_id`, materialising it from
    /// storage on first use.
    ///
    /// The write lock is held across the storage fetch so lazy creation is
    /// idempotent: at most one instance ever exists per id. `Ok(None)`
    /// means no such channel is configured.
    pub(crate) async fn get_channel(
        this: &Arc<Self>,
        channel_id: ChannelId,
    ) -> Result<Option<Arc<Channel>>, BrokerError> {
        let mut channels = this.channels.write().await;
        if let Some(channel) = channels.get(&channel_id) {
            return Ok(Some(Arc::clone(channel)));
        }
        let Some(model) = this.storage.get_channel(channel_id).await? else {
            return Ok(None);
        };
        let channel = Channel::spawn(model, Arc::downgrade(this), &this.shutdown);
        channels.insert(channel_id, Arc::clone(&channel));
        debug!(channel_id, channel_type = ?model.channel_type, "channel materialised");
        Ok(Some(channel))
    }
}

/// The message broker.
///
/// Construction spawns the event loop immediately; [`Broker::start`] only
/// starts attached socket servers, and [`Broker::stop`] tears the whole
/// engine down.
pub struct Broker {
    shared: Arc<Shared>,
    accept_conn_tx: mpsc::Sender<Conn>,
    conn_exit_tx: mpsc::Sender<Conn>,
    packet_tx: mpsc::Sender<PacketContext>,
    servers: Vec<Arc<dyn Server>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("servers", &self.servers.len())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Build the broker and spawn its event loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the configured codec is unknown or the storage commit
    /// stream has already been taken.
    pub fn new(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        router: Router,
    ) -> Result<Self, BrokerError> {
        let codec = codec_by_name(&config.codec)
            .ok_or_else(|| BrokerError::UnknownCodec(config.codec.clone()))?;
        let commit_rx = storage
            .take_commit_stream()
            .ok_or_else(|| anyhow::anyhow!("storage commit stream already taken"))?;

        let (accept_conn_tx, accept_conn_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (packet_tx, packet_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (authenticated_tx, authenticated_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (conn_exit_tx, conn_exit_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);

        let presence = Arc::new(Presence::new());
        let shared = Arc::new(Shared {
            config,
            storage,
            codec,
            conns: ConnManager::new(Arc::clone(&presence)),
            presence,
            authenticated_tx,
            packet_tx: packet_tx.clone(),
            channels: RwLock::new(HashMap::new()),
            shutdown: ShutdownController::new(),
        });

        let event_loop = EventLoop {
            shared: Arc::clone(&shared),
            router: Arc::new(router),
            pool: ContextPool::new(CONTEXT_POOL_CAPACITY),
            accept_conn_rx,
            packet_rx,
            authenticated_rx,
            commit_rx,
            conn_exit_rx,
            shutdown_rx: shared.shutdown.receiver(),
        };
        let guard = shared.shutdown.task_guard();
        tokio::spawn(async move {
            event_loop.run().await;
            drop(guard);
        });

        Ok(Self {
            shared,
            accept_conn_tx,
            conn_exit_tx,
            packet_tx,
            servers: Vec::new(),
        })
    }

    /// Attach a socket server to be started and stopped with the broker.
    pub fn attach_server(&mut self, server: Arc<dyn Server>) {
        self.servers.push(server);
    }

    /// Start attached servers, in attachment order.
    ///
    /// # Errors
    ///
    /// Propagates the first server start failure.
    pub async fn start(&self) -> anyhow::Result<()> {
        for server in &self.servers {
            server.start().await?;
        }
        info!("broker started");
        Ok(())
    }

    /// Shut down: signal every task, stop servers, wait for workers.
    ///
    /// # Errors
    ///
    /// Propagates the first server stop failure.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.shared.shutdown.trigger();
        for server in &self.servers {
            server.stop().await?;
        }
        if !self.shared.shutdown.wait_idle(SHUTDOWN_TIMEOUT).await {
            warn!(
                remaining = self.shared.shutdown.task_count(),
                "shutdown timeout expired with tasks still running"
            );
        }
        info!("broker stopped");
        Ok(())
    }

    /// Sender feeding newly accepted connections to the broker.
    #[must_use]
    pub fn accept_conn_sender(&self) -> mpsc::Sender<Conn> {
        self.accept_conn_tx.clone()
    }

    /// Sender feeding decoded packets to the router.
    #[must_use]
    pub fn packet_sender(&self) -> mpsc::Sender<PacketContext> {
        self.packet_tx.clone()
    }

    /// Sender notifying the broker of a connection's exit.
    #[must_use]
    pub fn conn_exit_sender(&self) -> mpsc::Sender<Conn> {
        self.conn_exit_tx.clone()
    }

    /// Resolve (and lazily materialise) a channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Store`] when the descriptor fetch fails.
    pub async fn get_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<Arc<Channel>>, BrokerError> {
        Shared::get_channel(&self.shared, channel_id).await
    }

    #[must_use]
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.shared.storage)
    }

    #[must_use]
    pub fn connections(&self) -> &ConnManager {
        &self.shared.conns
    }

    #[must_use]
    pub fn presence(&self) -> &Presence {
        &self.shared.presence
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

/// The single consumer of all broker input streams.
struct EventLoop {
    shared: Arc<Shared>,
    router: Arc<Router>,
    pool: ContextPool,
    accept_conn_rx: mpsc::Receiver<Conn>,
    packet_rx: mpsc::Receiver<PacketContext>,
    authenticated_rx: mpsc::Receiver<AuthenticatedContext>,
    commit_rx: mpsc::Receiver<MsgContext>,
    conn_exit_rx: mpsc::Receiver<Conn>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EventLoop {
    /// Polling order matters: commits drain ahead of authentication and
    /// new packets, so every message committed before a client's CONNECT
    /// is handled (and skipped for the then-offline client) before the
    /// drain for that client starts. That ordering is what keeps the cold
    /// replay and the live path from delivering the same message twice.
    async fn run(mut self) {
        debug!("event loop started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break,
                Some(commit) = self.commit_rx.recv() => self.on_commit(commit).await,
                Some(auth) = self.authenticated_rx.recv() => self.on_authenticated(auth).await,
                Some(conn) = self.conn_exit_rx.recv() => self.on_conn_exit(conn).await,
                Some(packet_ctx) = self.packet_rx.recv() => self.on_packet(packet_ctx).await,
                Some(conn) = self.accept_conn_rx.recv() => self.on_accept_conn(conn).await,
                else => break,
            }
        }
        debug!("event loop stopped");
    }

    /// First-packet contract: decode exactly one packet and require it to
    /// be CONNECT; anything else drops the connection without a response.
    async fn on_accept_conn(&self, conn: Conn) {
        let max_frame = self.shared.config.max_msg_size as usize + FRAME_OVERHEAD;
        let mut buf = BytesMut::new();
        let handshake = tokio::time::timeout(
            self.shared.config.max_heartbeat_interval,
            read_packet(&conn, &*self.shared.codec, &mut buf, max_frame),
        )
        .await;

        let packet = match handshake {
            Err(_) => {
                warn!("handshake timed out");
                conn.close().await;
                return;
            }
            Ok(Err(err)) => {
                warn!(error = %err, "failed to decode first packet");
                conn.close().await;
                return;
            }
            Ok(Ok(packet)) => packet,
        };

        if packet.packet_type() != PacketType::Connect {
            let err = BrokerError::NotConnect(packet.packet_type());
            warn!(error = %err, "rejecting connection");
            conn.close().await;
            return;
        }

        if self
            .shared
            .packet_tx
            .send(PacketContext::new(packet, conn))
            .await
            .is_err()
        {
            debug!("packet stream closed during handshake");
        }
    }

    async fn on_packet(&self, packet_ctx: PacketContext) {
        trace!(packet_type = %packet_ctx.packet.packet_type(), "dispatching packet");
        let mut ctx = self
            .pool
            .acquire(packet_ctx, self.router.chain(), Arc::clone(&self.shared));
        self.router.serve(&mut ctx).await;
        self.pool.release(ctx);
    }

    /// Register the authenticated connection, flip presence, make sure the
    /// person channel is live, and kick off the offline drain.
    async fn on_authenticated(&self, auth: AuthenticatedContext) {
        let client_id = auth.client_id;
        debug!(client_id, conn = auth.conn.serial(), "connection authenticated");

        if self.shared.conns.add(client_id, Arc::clone(&auth.conn)).is_some() {
            debug!(client_id, "evicted a previous connection for this client");
        }
        self.shared.presence.set_online(client_id, true);

        match Shared::get_channel(&self.shared, client_id).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!(client_id, "authenticated client has no person channel"),
            Err(err) => {
                error!(client_id, error = %err, "failed to materialise person channel");
            }
        }

        // The cutoff must be taken here, on the loop, not in the drain
        // task: any commit this loop handles after registration is then
        // strictly newer than the cutoff, however late the runtime gets
        // around to scheduling the drain.
        let cutoff = drain::now_ms();
        let shared = Arc::clone(&self.shared);
        let guard = self.shared.shutdown.task_guard();
        tokio::spawn(async move {
            drain::run(&shared, client_id, cutoff).await;
            drop(guard);
        });
    }

    /// A commit became durable: hand it to the owning channel's worker.
    async fn on_commit(&self, commit: MsgContext) {
        match Shared::get_channel(&self.shared, commit.channel_id).await {
            Ok(Some(channel)) => {
                if channel.enqueue(commit.msg).await.is_err() {
                    warn!(channel_id = commit.channel_id, "delivery inbox closed; commit dropped");
                }
            }
            Ok(None) => {
                warn!(channel_id = commit.channel_id, "commit for unknown channel discarded");
            }
            Err(err) => {
                error!(channel_id = commit.channel_id, error = %err, "failed to resolve channel for commit");
            }
        }
    }

    /// Connection gone: mark offline and unregister. The channel survives
    /// for the next session.
    async fn on_conn_exit(&self, conn: Conn) {
        let Conn::Stateful(stateful) = conn else {
            return;
        };
        let Some(client_id) = stateful.client_id() else {
            debug!(conn = stateful.serial(), "unauthenticated connection exited");
            return;
        };
        // Only unregister if this exact connection still owns the slot, so
        // a stale exit cannot tear down an eviction successor.
        if self.shared.conns.remove_matching(client_id, &stateful) {
            self.shared.presence.set_online(client_id, false);
            debug!(client_id, "connection exited");
        }
    }
}


#[cfg(test)]
mod tests {
    use courier_core::model::{ChannelModel, ChannelType};

    use super::test_support::shared_fixture;
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn get_channel_returns_none_for_unconfigured() {
        let fixture = shared_fixture();
        assert!(Shared::get_channel(&fixture.shared, 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_channel_materialises_exactly_one_instance() {
        let fixture = shared_fixture();
        fixture
            .shared
            .storage
            .add_channel(ChannelModel::new(7, ChannelType::Person))
            .await
            .unwrap();

        let first = Shared::get_channel(&fixture.shared, 7).await.unwrap().unwrap();
        let second = Shared::get_channel(&fixture.shared, 7).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id(), 7);
        assert_eq!(first.channel_type(), ChannelType::Person);
    }

    #[tokio::test]
    async fn broker_rejects_unknown_codec() {
        let config = ServerConfig {
            codec: "no-such-codec".to_string(),
            ..ServerConfig::default()
        };
        let storage = Arc::new(MemoryStorage::new());
        let err = Broker::new(config, storage, Router::new()).unwrap_err();
        assert!(matches!(err, BrokerError::UnknownCodec(name) if name == "no-such-codec"));
    }

    #[tokio::test]
    async fn broker_requires_a_fresh_commit_stream() {
        let storage = Arc::new(MemoryStorage::new());
        let _taken = storage.take_commit_stream().unwrap();
        let err = Broker::new(ServerConfig::default(), storage, Router::new()).unwrap_err();
        assert!(matches!(err, BrokerError::Store(_)));
    }

    #[tokio::test]
    async fn stop_joins_event_loop_and_workers() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .add_channel(ChannelModel::new(1, ChannelType::Person))
            .await
            .unwrap();
        let broker = Broker::new(ServerConfig::default(), storage, Router::new()).unwrap();

        // Materialise a channel so a worker is running too.
        broker.get_channel(1).await.unwrap().unwrap();

        broker.stop().await.unwrap();
        assert_eq!(broker.shared.shutdown.task_count(), 0);
    }
}
