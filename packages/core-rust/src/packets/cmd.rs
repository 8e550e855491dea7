//! Named command packet, the protocol's extension surface.

use std::fmt;

use bytes::Bytes;

use super::{FixedHeader, PacketType};

/// A named command with an opaque payload.
///
/// Commands are dispatched by name through the router's match table, so new
/// operations can be added without widening the packet-type space. The
/// optional token authenticates command senders on stateless transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdPacket {
    pub fixed_header: FixedHeader,
    pub cmd: String,
    pub token: Option<String>,
    pub payload: Bytes,
}

impl CmdPacket {
    #[must_use]
    pub fn new(cmd: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            fixed_header: FixedHeader::new(PacketType::Cmd),
            cmd: cmd.into(),
            token: None,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_header(fixed_header: FixedHeader) -> Self {
        Self {
            fixed_header,
            cmd: String::new(),
            token: None,
            payload: Bytes::new(),
        }
    }
}

impl fmt::Display for CmdPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cmd: {} token: {} payload: {} bytes",
            self.fixed_header,
            self.cmd,
            self.token.is_some(),
            self.payload.len()
        )
    }
}
