//! The default `mqtt-im` wire codec.
//!
//! Frame layout: one control byte (`type << 4 | dup << 3 | qos << 1 |
//! retain`), an MQTT-style variable-length remaining-length field (up to
//! four bytes, seven payload bits each), then the per-type remainder. All
//! multi-byte integers are big-endian; strings are u16-BE length-prefixed.
//!
//! The fixed header's `from` field is connection-bound metadata and is not
//! part of this codec's frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use super::{get_string, get_u16, get_u64, get_u8, put_string, CodecError, PacketCodec};
use crate::packets::{
    CmdAckPacket, CmdPacket, ConnackCode, ConnackPacket, ConnectPacket, FixedHeader,
    MessagePacket, MsgAckPacket, Packet, PacketType, PingReqPacket, PingRespPacket,
};

/// Longest representable remainder: 4 varint bytes of 7 bits each.
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Stateless codec implementing the `mqtt-im` frame format.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttImCodec;

impl PacketCodec for MqttImCodec {
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        let Some((control, remaining_length, header_len)) = peek_header(src)? else {
            return Ok(None);
        };
        if src.len() < header_len + remaining_length {
            return Ok(None);
        }

        src.advance(header_len);
        let mut body = src.split_to(remaining_length).freeze();

        let raw_type = control >> 4;
        let packet_type = PacketType::try_from(raw_type).map_err(CodecError::BadPacket)?;
        let fixed_header = FixedHeader {
            packet_type,
            dup: control & 0x08 != 0,
            qos: (control >> 1) & 0x03,
            retain: control & 0x01 != 0,
            remaining_length,
            from: 0,
        };
        trace!(packet_type = %packet_type, remaining_length, "decoded frame header");

        let packet = match packet_type {
            PacketType::Connect => {
                let mut p = ConnectPacket::with_header(fixed_header);
                p.client_id = get_u64(&mut body)?;
                p.password = get_string(&mut body)?;
                Packet::Connect(p)
            }
            PacketType::Connack => {
                let raw = get_u8(&mut body)?;
                let return_code = ConnackCode::try_from(raw).map_err(CodecError::BadPacket)?;
                Packet::Connack(ConnackPacket {
                    fixed_header,
                    return_code,
                })
            }
            PacketType::Message => {
                let mut p = MessagePacket::with_header(fixed_header);
                p.channel_id = get_u64(&mut body)?;
                #[allow(clippy::cast_possible_wrap)]
                {
                    p.timestamp = get_u64(&mut body)? as i64;
                }
                p.message_id = get_u64(&mut body)?;
                p.payload = body;
                Packet::Message(p)
            }
            PacketType::MsgAck => {
                let mut p = MsgAckPacket::with_header(fixed_header);
                if body.remaining() % 8 != 0 {
                    return Err(CodecError::Truncated {
                        needed: 8 - body.remaining() % 8,
                    });
                }
                while body.has_remaining() {
                    p.message_ids.push(body.get_u64());
                }
                Packet::MsgAck(p)
            }
            PacketType::PingReq => Packet::PingReq(PingReqPacket { fixed_header }),
            PacketType::PingResp => Packet::PingResp(PingRespPacket { fixed_header }),
            PacketType::Cmd => {
                let mut p = CmdPacket::with_header(fixed_header);
                p.cmd = get_string(&mut body)?;
                let token_flag = get_u8(&mut body)?;
                if token_flag != 0 {
                    p.token = Some(get_string(&mut body)?);
                }
                p.payload = body;
                Packet::Cmd(p)
            }
            PacketType::CmdAck => {
                let mut p = CmdAckPacket::with_header(fixed_header);
                p.cmd = get_string(&mut body)?;
                p.status = get_u16(&mut body)?;
                p.payload = body;
                Packet::CmdAck(p)
            }
        };
        Ok(Some(packet))
    }

    fn encode(&self, packet: &Packet) -> Result<Bytes, CodecError> {
        let body = encode_body(packet);
        if body.len() > MAX_REMAINING_LENGTH {
            return Err(CodecError::MalformedLength);
        }

        let header = packet.fixed_header();
        let control = (header.packet_type as u8) << 4
            | u8::from(header.dup) << 3
            | (header.qos & 0x03) << 1
            | u8::from(header.retain);

        let mut frame = BytesMut::with_capacity(5 + body.len());
        frame.put_u8(control);
        put_varint(&mut frame, body.len());
        frame.put_slice(&body);
        Ok(frame.freeze())
    }
}

fn encode_body(packet: &Packet) -> BytesMut {
    let mut body = BytesMut::new();
    match packet {
        Packet::Connect(p) => {
            body.put_u64(p.client_id);
            put_string(&mut body, &p.password);
        }
        Packet::Connack(p) => {
            body.put_u8(p.return_code as u8);
        }
        Packet::Message(p) => {
            body.put_u64(p.channel_id);
            #[allow(clippy::cast_sign_loss)]
            body.put_u64(p.timestamp as u64);
            body.put_u64(p.message_id);
            body.put_slice(&p.payload);
        }
        Packet::MsgAck(p) => {
            for id in &p.message_ids {
                body.put_u64(*id);
            }
        }
        Packet::PingReq(_) | Packet::PingResp(_) => {}
        Packet::Cmd(p) => {
            put_string(&mut body, &p.cmd);
            body.put_u8(u8::from(p.token.is_some()));
            if let Some(token) = &p.token {
                put_string(&mut body, token);
            }
            body.put_slice(&p.payload);
        }
        Packet::CmdAck(p) => {
            put_string(&mut body, &p.cmd);
            body.put_u16(p.status);
            body.put_slice(&p.payload);
        }
    }
    body
}

/// Parse the control byte and remaining-length varint without consuming.
///
/// Returns `(control, remaining_length, header_len)` once both are fully
/// buffered, `None` while more bytes are needed.
fn peek_header(src: &BytesMut) -> Result<Option<(u8, usize, usize)>, CodecError> {
    if src.is_empty() {
        return Ok(None);
    }
    let control = src[0];
    let mut remaining: usize = 0;
    let mut shift = 0;
    let mut idx = 1;
    loop {
        if idx >= src.len() {
            return Ok(None);
        }
        let byte = src[idx];
        idx += 1;
        remaining |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(CodecError::MalformedLength);
        }
    }
    Ok(Some((control, remaining, idx)))
}

fn put_varint(buf: &mut BytesMut, mut value: usize) {
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}
