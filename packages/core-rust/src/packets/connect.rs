//! Session establishment packets: `Connect` and its acknowledgment.

use std::fmt;

use super::{FixedHeader, PacketType};
use crate::model::ClientId;

/// First frame of every connection: presents the client's credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub fixed_header: FixedHeader,
    pub client_id: ClientId,
    pub password: String,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: ClientId, password: impl Into<String>) -> Self {
        Self {
            fixed_header: FixedHeader::new(PacketType::Connect),
            client_id,
            password: password.into(),
        }
    }

    #[must_use]
    pub fn with_header(fixed_header: FixedHeader) -> Self {
        Self {
            fixed_header,
            client_id: 0,
            password: String::new(),
        }
    }
}

impl fmt::Display for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} client_id: {}", self.fixed_header, self.client_id)
    }
}

/// Authentication outcome carried in a [`ConnackPacket`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnackCode {
    /// Credentials accepted; the session is authenticated.
    Accepted = 0,
    /// Unknown client id or wrong password.
    AuthFailed = 1,
}

impl TryFrom<u8> for ConnackCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::AuthFailed),
            other => Err(other),
        }
    }
}

/// Reply to a [`ConnectPacket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnackPacket {
    pub fixed_header: FixedHeader,
    pub return_code: ConnackCode,
}

impl ConnackPacket {
    #[must_use]
    pub fn new(return_code: ConnackCode) -> Self {
        Self {
            fixed_header: FixedHeader::new(PacketType::Connack),
            return_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_sets_type_in_header() {
        let packet = ConnectPacket::new(1, "pw");
        assert_eq!(packet.fixed_header.packet_type, PacketType::Connect);
        assert_eq!(packet.client_id, 1);
        assert_eq!(packet.password, "pw");
    }

    #[test]
    fn connack_code_round_trips_through_u8() {
        assert_eq!(ConnackCode::try_from(0), Ok(ConnackCode::Accepted));
        assert_eq!(ConnackCode::try_from(1), Ok(ConnackCode::AuthFailed));
        assert_eq!(ConnackCode::try_from(2), Err(2));
    }
}
