//! Default packet handlers and middleware.
//!
//! [`default_router`] wires the standard pipeline: packet tracing and an
//! authentication gate in front, then per-type handlers for session
//! establishment, message ingest, heartbeats, and delivery acks. Command
//! handlers are deliberately absent; the match table is the extension
//! surface for them.

use std::sync::Arc;

use courier_core::packets::{
    ConnackCode, ConnackPacket, MsgAckPacket, Packet, PacketType, PingRespPacket,
};
use tracing::{debug, error, warn};

use crate::error::BrokerError;
use crate::network::Conn;
use crate::router::{handler_fn, HandlerFuture, MContext, MatchKey, Router};
use crate::storage::Storage;

/// Build a router with the default middleware and packet handlers.
#[must_use]
pub fn default_router() -> Router {
    let mut router = Router::new();
    router.middleware(handler_fn(trace_packets));
    router.middleware(handler_fn(require_auth));
    router.route(MatchKey::Type(PacketType::Connect), handler_fn(authenticate));
    router.route(MatchKey::Type(PacketType::Message), handler_fn(ingest_message));
    router.route(MatchKey::Type(PacketType::PingReq), handler_fn(heartbeat));
    router.route(MatchKey::Type(PacketType::MsgAck), handler_fn(acknowledge));
    router
}

/// Middleware: debug-log every packet as it enters the pipeline.
pub fn trace_packets(ctx: &mut MContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        debug!(
            packet_type = %ctx.packet_type(),
            client_id = ctx.client_id(),
            "packet received"
        );
    })
}

/// Middleware: gate everything but CONNECT behind authentication.
///
/// Applies to stateful connections only; stateless transports carry their
/// identity per packet and commands authenticate via their token.
pub fn require_auth(ctx: &mut MContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        if ctx.packet_type() == PacketType::Connect {
            return;
        }
        let unauthenticated = match ctx.conn() {
            Conn::Stateful(conn) if conn.client_id().is_none() => Some(conn.serial()),
            _ => None,
        };
        if let Some(serial) = unauthenticated {
            warn!(
                packet_type = %ctx.packet_type(),
                conn = serial,
                "dropping packet from unauthenticated connection"
            );
            ctx.abort();
        }
    })
}

/// CONNECT: check credentials against storage.
///
/// Success replies CONNACK-accepted, binds the client id to the
/// connection, and emits the authentication result for the broker to
/// register. Failure replies CONNACK-auth-failed and closes.
pub fn authenticate(ctx: &mut MContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Packet::Connect(connect) = ctx.packet().clone() else {
            return;
        };
        match verify_credentials(&*ctx.storage(), connect.client_id, &connect.password).await {
            Ok(()) => {
                ctx.reply_packet(Packet::Connack(ConnackPacket::new(ConnackCode::Accepted)))
                    .await;
                if let Conn::Stateful(conn) = ctx.conn() {
                    let conn = Arc::clone(conn);
                    conn.set_client_id(connect.client_id);
                    ctx.emit_authenticated(connect.client_id, conn).await;
                }
            }
            Err(err) => {
                warn!(client_id = connect.client_id, error = %err, "rejecting connect");
                ctx.reply_packet(Packet::Connack(ConnackPacket::new(ConnackCode::AuthFailed)))
                    .await;
                ctx.conn().close().await;
                ctx.abort();
            }
        }
    })
}

async fn verify_credentials(
    storage: &dyn Storage,
    client_id: u64,
    password: &str,
) -> Result<(), BrokerError> {
    let client = storage.get_client(client_id).await?;
    match client {
        Some(client) if client.password == password => Ok(()),
        _ => Err(BrokerError::AuthFailed { client_id }),
    }
}

/// MESSAGE: persist into the target channel and ack.
///
/// Storage failures are logged without an ack, leaving redelivery to the
/// client. Messages for unconfigured channels are logged and dropped.
pub fn ingest_message(ctx: &mut MContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Packet::Message(packet) = ctx.packet() else {
            return;
        };
        let channel_id = packet.channel_id;
        let payload_len = packet.payload.len();
        let Some(msg) = ctx.msg() else {
            warn!(channel_id, "discarding message without a valid message id");
            return;
        };
        if payload_len > ctx.config().max_msg_size as usize {
            warn!(
                channel_id,
                message_id = msg.message_id,
                payload_len,
                "discarding oversized message"
            );
            return;
        }

        let message_id = msg.message_id;
        match ctx.get_channel(channel_id).await {
            Ok(Some(channel)) => match channel.put_msg(msg).await {
                Ok(()) => {
                    ctx.reply_packet(Packet::MsgAck(MsgAckPacket::new(vec![message_id])))
                        .await;
                }
                Err(err) => {
                    error!(channel_id, message_id, error = %err, "failed to store message");
                }
            },
            Ok(None) => {
                let err = BrokerError::NoSuchChannel(channel_id);
                warn!(message_id, error = %err, "message dropped");
            }
            Err(err) => {
                error!(channel_id, message_id, error = %err, "failed to resolve channel");
            }
        }
    })
}

/// PINGREQ: reply with PINGRESP.
pub fn heartbeat(ctx: &mut MContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        ctx.reply_packet(Packet::PingResp(PingRespPacket::new())).await;
    })
}

/// MSGACK: remove acknowledged messages from the client's person channel.
pub fn acknowledge(ctx: &mut MContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Packet::MsgAck(ack) = ctx.packet() else {
            return;
        };
        let message_ids = ack.message_ids.clone();
        let Some(client_id) = ctx.client_id() else {
            return;
        };
        if let Err(err) = ctx
            .storage()
            .remove_msg_in_channel(&message_ids, client_id)
            .await
        {
            error!(client_id, error = %err, "failed to remove acknowledged messages");
        } else {
            debug!(client_id, count = message_ids.len(), "messages acknowledged");
        }
    })
}
