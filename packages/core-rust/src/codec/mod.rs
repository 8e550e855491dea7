//! The packet codec seam and wire-level primitives.
//!
//! A codec turns the byte stream of a connection into [`Packet`] values and
//! back. Decoding is streaming: a call consumes at most one whole packet
//! from the input buffer and returns `Ok(None)` while the frame is still
//! incomplete, so the caller can read more bytes and retry. Encoding is
//! deterministic for equal inputs.

mod mqtt_im;

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use mqtt_im::MqttImCodec;

use crate::packets::Packet;

/// Name of the codec registered by default.
pub const DEFAULT_CODEC: &str = "mqtt-im";

/// Errors produced while encoding or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The wire carried a packet type outside 1..=8.
    #[error("unknown packet type {0}")]
    BadPacket(u8),
    /// The remaining-length varint was longer than four bytes.
    #[error("malformed remaining length")]
    MalformedLength,
    /// A complete frame's body ended before a declared field did.
    #[error("packet body truncated: {needed} more bytes needed")]
    Truncated { needed: usize },
    /// A length-prefixed string field was not valid UTF-8.
    #[error("string field is not valid utf-8")]
    InvalidString(#[from] std::string::FromUtf8Error),
}

/// Streaming packet encoder/decoder.
///
/// Implementations are stateless and shared as `Arc<dyn PacketCodec>`; all
/// decode state lives in the caller's buffer.
pub trait PacketCodec: Send + Sync {
    /// Try to decode one packet from the front of `src`.
    ///
    /// Returns `Ok(Some(packet))` and consumes the frame when one complete
    /// packet is buffered, `Ok(None)` without consuming anything when more
    /// bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for malformed input; the buffer contents
    /// are unspecified afterwards and the connection should be dropped.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError>;

    /// Encode one packet into its complete wire frame.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] when the packet cannot be represented on
    /// the wire.
    fn encode(&self, packet: &Packet) -> Result<Bytes, CodecError>;
}

/// Look up a codec by its configured name.
///
/// Returns `None` for names no codec is registered under; callers decide
/// whether that is fatal.
#[must_use]
pub fn codec_by_name(name: &str) -> Option<Arc<dyn PacketCodec>> {
    match name {
        DEFAULT_CODEC => Some(Arc::new(MqttImCodec)),
        _ => None,
    }
}

/// Append a u16-BE length-prefixed string.
pub(crate) fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

/// Append a u16-BE length-prefixed byte field.
pub(crate) fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    debug_assert!(value.len() <= usize::from(u16::MAX));
    buf.put_u16(u16::try_from(value.len()).unwrap_or(u16::MAX));
    buf.put_slice(value);
}

/// Read a u16-BE length-prefixed string.
pub(crate) fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let field = get_bytes(buf)?;
    Ok(String::from_utf8(field.to_vec())?)
}

/// Read a u16-BE length-prefixed byte field.
pub(crate) fn get_bytes(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = usize::from(get_u16(buf)?);
    if buf.remaining() < len {
        return Err(CodecError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(buf.split_to(len))
}

pub(crate) fn get_u16(buf: &mut Bytes) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated {
            needed: 2 - buf.remaining(),
        });
    }
    Ok(buf.get_u16())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated {
            needed: 8 - buf.remaining(),
        });
    }
    Ok(buf.get_u64())
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated { needed: 1 });
    }
    Ok(buf.get_u8())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codec_is_registered() {
        assert!(codec_by_name(DEFAULT_CODEC).is_some());
        assert!(codec_by_name("protobuf-im").is_none());
    }

    #[test]
    fn string_field_round_trip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "héllo");
        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes).unwrap(), "héllo");
        assert!(bytes.is_empty());
    }

    #[test]
    fn get_string_reports_missing_bytes() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hello");
        let mut truncated = buf.freeze().slice(..4);
        let err = get_string(&mut truncated).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed: 3 }));
    }

    #[test]
    fn integer_reads_check_remaining() {
        let mut short = Bytes::from_static(&[0, 1, 2]);
        assert!(matches!(
            get_u64(&mut short),
            Err(CodecError::Truncated { needed: 5 })
        ));
        let mut empty = Bytes::new();
        assert!(matches!(
            get_u16(&mut empty),
            Err(CodecError::Truncated { needed: 2 })
        ));
    }
}
