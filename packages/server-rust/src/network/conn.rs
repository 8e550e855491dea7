//! Connection abstractions over pluggable byte transports.
//!
//! The broker never opens sockets; attached servers hand it [`Conn`] values
//! wrapping whatever [`Transport`] they accepted. Stateful transports (TCP,
//! WebSocket) carry an authenticated client id; stateless transports (UDP)
//! identify senders through the packet header instead.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use courier_core::codec::PacketCodec;
use courier_core::model::ClientId;
use courier_core::packets::Packet;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::BrokerError;

/// Byte-level duplex transport implemented by the server layer.
///
/// Methods take `&self`: implementations serialise access internally so a
/// transport can be shared between the read path and concurrent writers.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Append whatever bytes are available to `buf`.
    ///
    /// Returns the number of bytes read; 0 means the peer closed.
    async fn read_buf(&self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Write the whole of `data`.
    async fn write_all(&self, data: &[u8]) -> io::Result<()>;

    /// Close the transport. Subsequent reads yield EOF.
    async fn close(&self);
}

/// Read one complete packet from a connection.
///
/// Decodes from `buf` first and only reads from the connection while the
/// frame is incomplete, so bytes already buffered are never lost between
/// calls.
///
/// # Errors
///
/// Returns [`BrokerError::ConnClosed`] on EOF mid-frame and
/// [`BrokerError::BadPacket`] for undecodable input. `max_frame_size`
/// bounds the bytes buffered for a single frame.
pub async fn read_packet(
    conn: &Conn,
    codec: &dyn PacketCodec,
    buf: &mut BytesMut,
    max_frame_size: usize,
) -> Result<Packet, BrokerError> {
    loop {
        if let Some(packet) = codec.decode(buf)? {
            return Ok(packet);
        }
        if buf.len() > max_frame_size {
            return Err(BrokerError::BadPacket(
                courier_core::codec::CodecError::MalformedLength,
            ));
        }
        let read = conn
            .read_buf(buf)
            .await
            .map_err(|_| BrokerError::ConnClosed)?;
        if read == 0 {
            return Err(BrokerError::ConnClosed);
        }
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// A connection-oriented session that can be bound to a client id.
///
/// The id is unset until authentication succeeds and is written exactly
/// once; delivery paths treat an id-less connection as unreachable.
pub struct StatefulConn {
    serial: u64,
    transport: Arc<dyn Transport>,
    /// 0 means unauthenticated; client ids start at 1.
    client_id: AtomicU64,
}

impl StatefulConn {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            transport,
            client_id: AtomicU64::new(0),
        }
    }

    /// Registry-independent serial, for log correlation only.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The authenticated client id, if authentication has completed.
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        match self.client_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Bind the authenticated client id. First write wins.
    pub fn set_client_id(&self, client_id: ClientId) {
        let _ = self
            .client_id
            .compare_exchange(0, client_id, Ordering::AcqRel, Ordering::Acquire);
    }

    pub async fn read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        self.transport.read_buf(buf).await
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.transport.write_all(data).await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

impl fmt::Debug for StatefulConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulConn")
            .field("serial", &self.serial)
            .field("client_id", &self.client_id())
            .finish_non_exhaustive()
    }
}

/// A connectionless session; sender identity travels in each packet header.
pub struct StatelessConn {
    transport: Arc<dyn Transport>,
}

impl StatelessConn {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        self.transport.read_buf(buf).await
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.transport.write_all(data).await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

impl fmt::Debug for StatelessConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatelessConn").finish_non_exhaustive()
    }
}

/// The two connection flavours the broker routes over.
#[derive(Debug, Clone)]
pub enum Conn {
    Stateful(Arc<StatefulConn>),
    Stateless(Arc<StatelessConn>),
}

impl Conn {
    /// The stateful view, when this connection has one.
    #[must_use]
    pub fn stateful(&self) -> Option<&Arc<StatefulConn>> {
        match self {
            Conn::Stateful(conn) => Some(conn),
            Conn::Stateless(_) => None,
        }
    }

    pub async fn read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Conn::Stateful(conn) => conn.read_buf(buf).await,
            Conn::Stateless(conn) => conn.read_buf(buf).await,
        }
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        match self {
            Conn::Stateful(conn) => conn.write_all(data).await,
            Conn::Stateless(conn) => conn.write_all(data).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Conn::Stateful(conn) => conn.close().await,
            Conn::Stateless(conn) => conn.close().await,
        }
    }
}

/// In-process transport over [`tokio::io::duplex`], for tests and
/// loopback servers.
pub struct DuplexTransport {
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<WriteHalf<DuplexStream>>,
}

impl DuplexTransport {
    /// Create a connected pair of transports with the given buffer size.
    #[must_use]
    pub fn pair(max_buf_size: usize) -> (Arc<Self>, Arc<Self>) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        (Arc::new(Self::from_stream(a)), Arc::new(Self::from_stream(b)))
    }

    fn from_stream(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

impl fmt::Debug for DuplexTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        self.reader.lock().await.read_buf(buf).await
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}
