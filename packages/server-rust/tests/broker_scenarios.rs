//! End-to-end broker scenarios over the in-memory backend and in-process
//! duplex transports: direct person delivery, offline drain, group
//! fan-out, connection eviction, and the first-packet contract.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use courier_core::codec::{MqttImCodec, PacketCodec as _};
use courier_core::model::{ChannelModel, ChannelType, Client};
use courier_core::packets::{
    ConnackCode, ConnectPacket, MessagePacket, MsgAckPacket, Packet, PacketType,
};
use courier_server::broker::{Broker, PacketContext};
use courier_server::handlers::default_router;
use courier_server::network::{Conn, DuplexTransport, StatefulConn, Transport as _};
use courier_server::storage::{MemoryStorage, Storage};
use courier_server::ServerConfig;

const READ_DEADLINE: Duration = Duration::from_secs(2);
const SILENCE_WINDOW: Duration = Duration::from_millis(150);

fn now_ms() -> i64 {
    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis(),
    )
    .unwrap()
}

/// One test client: the far side of a duplex pipe whose near side the
/// broker owns as a stateful connection.
struct TestClient {
    client_id: u64,
    conn: Conn,
    transport: Arc<DuplexTransport>,
    buf: BytesMut,
}

impl TestClient {
    /// Hand a fresh connection to the broker's accept stream and complete
    /// the CONNECT handshake.
    async fn connect(broker: &Broker, client_id: u64, password: &str) -> Self {
        let mut client = Self::open(broker, client_id).await;
        client
            .send(&Packet::Connect(ConnectPacket::new(client_id, password)))
            .await;

        let reply = client.read_packet().await;
        let Packet::Connack(connack) = reply else {
            panic!("expected CONNACK, got {reply:?}");
        };
        assert_eq!(connack.return_code, ConnackCode::Accepted);

        // Registration happens on the event loop after the CONNACK; wait
        // until presence flips before letting the test publish.
        wait_until("client registration", || {
            broker.presence().is_online(client_id)
        })
        .await;
        client
    }

    /// Open a connection without authenticating.
    async fn open(broker: &Broker, client_id: u64) -> Self {
        let (near, far) = DuplexTransport::pair(256 * 1024);
        let conn = Conn::Stateful(Arc::new(StatefulConn::new(near)));
        broker
            .accept_conn_sender()
            .send(conn.clone())
            .await
            .expect("broker accept stream open");
        Self {
            client_id,
            conn,
            transport: far,
            buf: BytesMut::new(),
        }
    }

    /// Write a frame as the remote peer would.
    async fn send(&self, packet: &Packet) {
        let frame = MqttImCodec.encode(packet).expect("encode");
        self.transport.write_all(&frame).await.expect("write frame");
    }

    /// Publish a message the way a socket server would: the frame is
    /// already decoded, so it enters through the broker's packet stream.
    async fn publish(&self, broker: &Broker, message_id: u64, channel_id: u64, timestamp: i64) {
        let packet = Packet::Message(MessagePacket::new(
            message_id,
            channel_id,
            timestamp,
            &b"hi"[..],
        ));
        broker
            .packet_sender()
            .send(PacketContext::new(packet, self.conn.clone()))
            .await
            .expect("broker packet stream open");
    }

    /// Publish and wait for the broker's MSGACK.
    async fn publish_acked(
        &mut self,
        broker: &Broker,
        message_id: u64,
        channel_id: u64,
        timestamp: i64,
    ) {
        self.publish(broker, message_id, channel_id, timestamp).await;
        let reply = self.read_packet().await;
        let Packet::MsgAck(ack) = reply else {
            panic!("expected MSGACK for {message_id}, got {reply:?}");
        };
        assert_eq!(ack.message_ids, vec![message_id]);
    }

    /// Read the next packet, failing after the deadline.
    async fn read_packet(&mut self) -> Packet {
        loop {
            if let Some(packet) = MqttImCodec.decode(&mut self.buf).expect("decode") {
                return packet;
            }
            let read = tokio::time::timeout(READ_DEADLINE, self.transport.read_buf(&mut self.buf))
                .await
                .unwrap_or_else(|_| panic!("client {} timed out waiting for a packet", self.client_id))
                .expect("transport read");
            assert_ne!(read, 0, "client {} connection closed", self.client_id);
        }
    }

    /// Read the next packet and require it to be a delivered message.
    async fn read_message(&mut self) -> MessagePacket {
        let packet = self.read_packet().await;
        let Packet::Message(message) = packet else {
            panic!("expected MESSAGE, got {packet:?}");
        };
        message
    }

    /// Assert nothing arrives for a short window.
    async fn assert_silent(&mut self) {
        if !self.buf.is_empty() {
            panic!("client {} has undecoded bytes buffered", self.client_id);
        }
        let mut probe = BytesMut::new();
        let outcome =
            tokio::time::timeout(SILENCE_WINDOW, self.transport.read_buf(&mut probe)).await;
        match outcome {
            Err(_) => {}
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => panic!("client {} received {n} unexpected bytes", self.client_id),
            Ok(Err(err)) => panic!("client {} read error: {err}", self.client_id),
        }
    }

    /// Observe EOF, i.e. the broker closed this connection.
    async fn assert_closed(&mut self) {
        let mut probe = BytesMut::new();
        let read = tokio::time::timeout(READ_DEADLINE, self.transport.read_buf(&mut probe))
            .await
            .expect("timed out waiting for close")
            .expect("transport read");
        assert_eq!(read, 0, "expected EOF, got {read} bytes");
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Seed a person-channel client: credentials, descriptor, self binding.
async fn seed_person(storage: &MemoryStorage, client_id: u64) {
    storage
        .add_client(Client::new(client_id, "pw"))
        .await
        .unwrap();
    storage
        .add_channel(ChannelModel::new(client_id, ChannelType::Person))
        .await
        .unwrap();
    storage.bind(client_id, client_id).await.unwrap();
}

/// One configuration drives the whole composition: the storage commit
/// stream is sized by the same `mem_queue_size` the broker is built with.
fn test_storage() -> (ServerConfig, Arc<MemoryStorage>) {
    let config = ServerConfig::default();
    let storage = Arc::new(MemoryStorage::with_commit_capacity(config.mem_queue_size));
    (config, storage)
}

fn broker_with(config: ServerConfig, storage: &Arc<MemoryStorage>) -> Broker {
    courier_server::logging::init_logging("warn");
    let storage: Arc<dyn Storage> = Arc::clone(storage) as Arc<dyn Storage>;
    Broker::new(config, storage, default_router()).expect("broker")
}

#[tokio::test]
async fn person_to_person_online_delivery() {
    let (config, storage) = test_storage();
    seed_person(&storage, 1).await;
    seed_person(&storage, 2).await;
    // B also follows A's channel.
    storage.bind(2, 1).await.unwrap();

    let broker = broker_with(config, &storage);
    let mut alice = TestClient::connect(&broker, 1, "pw").await;
    let mut bob = TestClient::connect(&broker, 2, "pw").await;

    alice.publish_acked(&broker, 10, 1, now_ms()).await;

    let delivered = bob.read_message().await;
    assert_eq!(delivered.channel_id, 1);
    assert_eq!(delivered.message_id, 10);
    assert_eq!(delivered.fixed_header.from, 1);
    assert_eq!(delivered.fixed_header.qos, 1);
    assert_eq!(&delivered.payload[..], b"hi");

    // Exactly one copy for B, no echo for A.
    bob.assert_silent().await;
    alice.assert_silent().await;

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn offline_backlog_drains_on_reconnect() {
    let (config, storage) = test_storage();
    seed_person(&storage, 1).await;
    seed_person(&storage, 2).await;

    let broker = broker_with(config, &storage);
    let mut alice = TestClient::connect(&broker, 1, "pw").await;

    // Bob is offline; Alice writes three messages into his person channel.
    let past = now_ms() - 10_000;
    for (message_id, offset) in [(21u64, 0i64), (22, 1), (23, 2)] {
        alice.publish_acked(&broker, message_id, 2, past + offset).await;
    }

    // Bob reconnects and the drain replays the backlog in commit order.
    let mut bob = TestClient::connect(&broker, 2, "pw").await;
    for expected in [21u64, 22, 23] {
        let delivered = bob.read_message().await;
        assert_eq!(delivered.message_id, expected);
        assert_eq!(delivered.channel_id, 2);
        assert_eq!(delivered.fixed_header.from, 1);
    }
    bob.assert_silent().await;

    // Later sends are delivered live, exactly once.
    alice.publish_acked(&broker, 24, 2, now_ms() + 10_000).await;
    let live = bob.read_message().await;
    assert_eq!(live.message_id, 24);
    bob.assert_silent().await;

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn group_fan_out_reaches_each_member_person_channel() {
    let (config, storage) = test_storage();
    for client_id in [1, 2, 3] {
        seed_person(&storage, client_id).await;
    }
    storage
        .add_channel(ChannelModel::new(100, ChannelType::Group))
        .await
        .unwrap();
    for client_id in [1, 2, 3] {
        storage.bind(client_id, 100).await.unwrap();
    }

    let broker = broker_with(config, &storage);
    let mut alice = TestClient::connect(&broker, 1, "pw").await;
    let mut bob = TestClient::connect(&broker, 2, "pw").await;
    let mut carol = TestClient::connect(&broker, 3, "pw").await;

    alice.publish_acked(&broker, 20, 100, now_ms()).await;

    // Each member receives through their own person channel.
    let to_bob = bob.read_message().await;
    assert_eq!(to_bob.channel_id, 2);
    assert_eq!(to_bob.message_id, 20);
    assert_eq!(to_bob.fixed_header.from, 1);

    let to_carol = carol.read_message().await;
    assert_eq!(to_carol.channel_id, 3);
    assert_eq!(to_carol.message_id, 20);
    assert_eq!(to_carol.fixed_header.from, 1);

    // No echo to the sender, one copy each.
    alice.assert_silent().await;
    bob.assert_silent().await;
    carol.assert_silent().await;

    // One persistence into the group, one relay per other member, none
    // into the sender's person channel.
    wait_until("relay persistence", || {
        storage.msg_count(2) == 1 && storage.msg_count(3) == 1
    })
    .await;
    assert_eq!(storage.msg_count(100), 1);
    assert_eq!(storage.msg_count(1), 0);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn second_authentication_evicts_the_first_connection() {
    let (config, storage) = test_storage();
    seed_person(&storage, 1).await;
    seed_person(&storage, 9).await;
    storage.bind(9, 1).await.unwrap();

    let broker = broker_with(config, &storage);

    let mut conn_x = TestClient::connect(&broker, 1, "pw").await;
    let x_arc = Arc::clone(conn_x.conn.stateful().unwrap());

    let mut conn_y = TestClient::connect(&broker, 1, "pw").await;
    let y_arc = Arc::clone(conn_y.conn.stateful().unwrap());

    // The registry now holds Y and only Y.
    wait_until("eviction", || {
        broker
            .connections()
            .get(1)
            .is_some_and(|current| Arc::ptr_eq(&current, &y_arc))
    })
    .await;
    assert!(!Arc::ptr_eq(&broker.connections().get(1).unwrap(), &x_arc));
    assert!(broker.presence().is_online(1));

    // A message into channel 1 reaches Y only. Client 9 publishes so the
    // no-echo rule does not filter client 1.
    let mut publisher = TestClient::connect(&broker, 9, "pw").await;
    publisher.publish_acked(&broker, 30, 1, now_ms()).await;

    let delivered = conn_y.read_message().await;
    assert_eq!(delivered.message_id, 30);
    assert_eq!(delivered.channel_id, 1);
    conn_x.assert_silent().await;

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn connection_exit_marks_the_client_offline() {
    let (config, storage) = test_storage();
    seed_person(&storage, 1).await;
    seed_person(&storage, 2).await;

    let broker = broker_with(config, &storage);
    let mut alice = TestClient::connect(&broker, 1, "pw").await;
    let mut bob = TestClient::connect(&broker, 2, "pw").await;

    broker
        .conn_exit_sender()
        .send(bob.conn.clone())
        .await
        .unwrap();
    wait_until("bob unregistered", || {
        !broker.presence().is_online(2) && broker.connections().get(2).is_none()
    })
    .await;

    // Bob's channel survives the disconnect: the message is persisted and
    // waits for his next session instead of being delivered.
    alice.publish_acked(&broker, 30, 2, now_ms() - 5_000).await;
    bob.assert_silent().await;

    let mut bob_again = TestClient::connect(&broker, 2, "pw").await;
    assert_eq!(bob_again.read_message().await.message_id, 30);
    bob_again.assert_silent().await;

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn non_connect_first_packet_is_rejected() {
    let (config, storage) = test_storage();
    seed_person(&storage, 1).await;

    let broker = broker_with(config, &storage);
    let mut intruder = TestClient::open(&broker, 1).await;

    // First frame is a MESSAGE, violating the handshake contract.
    intruder
        .send(&Packet::Message(MessagePacket::new(10, 1, now_ms(), &b"hi"[..])))
        .await;

    intruder.assert_closed().await;
    assert!(broker.connections().is_empty());
    assert_eq!(storage.msg_count(1), 0);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn undecodable_first_packet_is_rejected() {
    let (config, storage) = test_storage();
    let broker = broker_with(config, &storage);
    let mut intruder = TestClient::open(&broker, 1).await;

    // Control byte with packet type 15: no such packet.
    intruder.transport.write_all(&[0xF0, 0x00]).await.unwrap();

    intruder.assert_closed().await;
    assert!(broker.connections().is_empty());

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn drain_cutoff_hands_over_to_the_live_path() {
    let (config, storage) = test_storage();
    seed_person(&storage, 5).await;
    seed_person(&storage, 9).await;

    let broker = broker_with(config, &storage);

    // 500 historical messages, all safely older than the upcoming cutoff.
    // The broker is already running, so each commit flows through the live
    // path and is skipped for the offline subscriber.
    let t0 = now_ms() - 60_000;
    for i in 0..500u64 {
        #[allow(clippy::cast_possible_wrap)]
        storage
            .add_msg_in_channel(
                courier_core::msg::Msg::new(i + 1, 9, t0 + i as i64, &b"old"[..]),
                5,
            )
            .await
            .unwrap();
    }

    let mut client = TestClient::connect(&broker, 5, "pw").await;

    // While the drain replays, a publisher commits a strictly newer
    // message, which must arrive via the live path exactly once.
    let mut publisher = TestClient::connect(&broker, 9, "pw").await;
    publisher.publish(&broker, 777, 5, now_ms() + 10_000).await;

    let mut seen_new = 0u32;
    let mut historical = Vec::with_capacity(500);
    while historical.len() < 500 || seen_new < 1 {
        let delivered = client.read_message().await;
        if delivered.message_id == 777 {
            seen_new += 1;
        } else {
            historical.push(delivered.message_id);
        }
    }

    // All 500 historical messages, in commit order, each exactly once.
    let expected: Vec<u64> = (1..=500).collect();
    assert_eq!(historical, expected);
    assert_eq!(seen_new, 1);

    // The publisher's ack and nothing else.
    let ack = publisher.read_packet().await;
    assert!(matches!(ack, Packet::MsgAck(_)));
    client.assert_silent().await;

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn live_commit_right_after_reconnect_is_delivered_once() {
    let (config, storage) = test_storage();
    seed_person(&storage, 5).await;
    seed_person(&storage, 9).await;

    let broker = broker_with(config, &storage);
    let mut publisher = TestClient::connect(&broker, 9, "pw").await;

    // Enough backlog that the drain is still paging when the live commit
    // lands.
    let t0 = now_ms() - 60_000;
    for i in 0..250u64 {
        #[allow(clippy::cast_possible_wrap)]
        storage
            .add_msg_in_channel(
                courier_core::msg::Msg::new(i + 1, 9, t0 + i as i64, &b"old"[..]),
                5,
            )
            .await
            .unwrap();
    }

    let mut client = TestClient::connect(&broker, 5, "pw").await;

    // The drain's cutoff was captured when the broker registered the
    // client, so a commit stamped a few milliseconds later is already
    // strictly newer. No forward-dated padding: this is the window where
    // a late-captured cutoff would hand the message to both paths.
    tokio::time::sleep(Duration::from_millis(5)).await;
    publisher.publish_acked(&broker, 600, 5, now_ms()).await;

    let mut seen_new = 0u32;
    let mut historical = Vec::with_capacity(250);
    while historical.len() < 250 || seen_new < 1 {
        let delivered = client.read_message().await;
        if delivered.message_id == 600 {
            seen_new += 1;
        } else {
            historical.push(delivered.message_id);
        }
    }

    let expected: Vec<u64> = (1..=250).collect();
    assert_eq!(historical, expected);
    assert_eq!(seen_new, 1);
    client.assert_silent().await;

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn message_acks_clear_the_person_channel_backlog() {
    let (config, storage) = test_storage();
    seed_person(&storage, 1).await;
    seed_person(&storage, 2).await;

    let broker = broker_with(config, &storage);
    let mut alice = TestClient::connect(&broker, 1, "pw").await;

    let past = now_ms() - 10_000;
    alice.publish_acked(&broker, 40, 2, past).await;
    alice.publish_acked(&broker, 41, 2, past + 1).await;

    let mut bob = TestClient::connect(&broker, 2, "pw").await;
    assert_eq!(bob.read_message().await.message_id, 40);
    assert_eq!(bob.read_message().await.message_id, 41);

    // Bob acknowledges one of them; it leaves his backlog.
    let ack = Packet::MsgAck(MsgAckPacket::new(vec![40]));
    broker
        .packet_sender()
        .send(PacketContext::new(ack, bob.conn.clone()))
        .await
        .unwrap();

    wait_until("ack removal", || storage.msg_count(2) == 1).await;

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn heartbeat_round_trip() {
    let (config, storage) = test_storage();
    seed_person(&storage, 1).await;

    let broker = broker_with(config, &storage);
    let mut client = TestClient::connect(&broker, 1, "pw").await;

    broker
        .packet_sender()
        .send(PacketContext::new(
            Packet::PingReq(courier_core::packets::PingReqPacket::new()),
            client.conn.clone(),
        ))
        .await
        .unwrap();

    let reply = client.read_packet().await;
    assert_eq!(reply.packet_type(), PacketType::PingResp);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn wrong_password_closes_the_connection() {
    let (config, storage) = test_storage();
    seed_person(&storage, 1).await;

    let broker = broker_with(config, &storage);
    let mut client = TestClient::open(&broker, 1).await;
    client
        .send(&Packet::Connect(ConnectPacket::new(1, "wrong")))
        .await;

    let reply = client.read_packet().await;
    let Packet::Connack(connack) = reply else {
        panic!("expected CONNACK, got {reply:?}");
    };
    assert_eq!(connack.return_code, ConnackCode::AuthFailed);
    client.assert_closed().await;
    assert!(broker.connections().is_empty());
    assert!(!broker.presence().is_online(1));

    broker.stop().await.unwrap();
}
