/**
 * coordinator/protocol.rs
 *
 * Rendezvous service and STUN relay messages
 *
 * Every message is one framed packet (see network/packet.rs). Messages sent
 * by the client start with the coordinator protocol version; messages sent
 * by the service do not.
 *
 *   type  name            direction  payload
 *   0     REGISTER        ->         version, u8 visibility, u16 port, game info
 *   1     REGISTER_ACK    <-         string join-key, u8 connection type
 *   2     UPDATE          ->         version, game info
 *   3     LISTING         ->         version
 *   4     LISTING         <-         u16 count, count x game info (0 ends the pass)
 *   5     CONNECT         ->         version, string join-key
 *   6     CONNECTING      <-         string token, string join-key
 *   7     CONNECT_FAILED  <->        [version,] string token
 *   8     DIRECT_CONNECT  <-         string token, string host, u16 port
 *   9     STUN_REQUEST    <-         string token
 *   10    STUN_CONNECT    <-         string token, u8 family, string host, u16 port
 *   11    ERROR           <-         u8 kind, string detail
 */

use super::types::{ConnectionType, Visibility};
use crate::game_info::{GameInfo, JOIN_KEY_LENGTH};
use crate::network::{Family, Packet, PacketError};
use std::fmt;

/// Coordinator protocol version sent with every client message
pub const PROTOCOL_VERSION: u8 = 1;

pub const TOKEN_LENGTH: usize = 64;
pub const HOSTNAME_LENGTH: usize = 255;
pub const ERROR_DETAIL_LENGTH: usize = 255;

pub const PACKET_REGISTER: u8 = 0;
pub const PACKET_REGISTER_ACK: u8 = 1;
pub const PACKET_UPDATE: u8 = 2;
pub const PACKET_LISTING_REQUEST: u8 = 3;
pub const PACKET_LISTING: u8 = 4;
pub const PACKET_CONNECT: u8 = 5;
pub const PACKET_CONNECTING: u8 = 6;
pub const PACKET_CONNECT_FAILED: u8 = 7;
pub const PACKET_DIRECT_CONNECT: u8 = 8;
pub const PACKET_STUN_REQUEST: u8 = 9;
pub const PACKET_STUN_CONNECT: u8 = 10;
pub const PACKET_ERROR: u8 = 11;

/// The only message the STUN relay understands
pub const PACKET_STUN: u8 = 0;

/// Error categories the service reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    General,
    ProtocolVersion,
    RegistrationFailed,
    InvalidJoinKey,
}

impl ServiceErrorKind {
    pub fn to_wire(self) -> u8 {
        match self {
            ServiceErrorKind::General => 0,
            ServiceErrorKind::ProtocolVersion => 1,
            ServiceErrorKind::RegistrationFailed => 2,
            ServiceErrorKind::InvalidJoinKey => 3,
        }
    }

    /// Unknown kinds are treated as general errors
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => ServiceErrorKind::ProtocolVersion,
            2 => ServiceErrorKind::RegistrationFailed,
            3 => ServiceErrorKind::InvalidJoinKey,
            _ => ServiceErrorKind::General,
        }
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceErrorKind::General => write!(f, "general error"),
            ServiceErrorKind::ProtocolVersion => write!(f, "protocol version mismatch"),
            ServiceErrorKind::RegistrationFailed => write!(f, "registration failed"),
            ServiceErrorKind::InvalidJoinKey => write!(f, "invalid join-key"),
        }
    }
}

/// Messages the client sends to the service
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Register {
        visibility: Visibility,
        port: u16,
        info: GameInfo,
    },
    Update {
        info: GameInfo,
    },
    Listing,
    Connect {
        join_key: String,
    },
    ConnectFailed {
        token: String,
    },
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "REGISTER",
            ClientMessage::Update { .. } => "UPDATE",
            ClientMessage::Listing => "LISTING",
            ClientMessage::Connect { .. } => "CONNECT",
            ClientMessage::ConnectFailed { .. } => "CONNECT_FAILED",
        }
    }

    pub fn to_packet(&self) -> Packet {
        let packet_type = match self {
            ClientMessage::Register { .. } => PACKET_REGISTER,
            ClientMessage::Update { .. } => PACKET_UPDATE,
            ClientMessage::Listing => PACKET_LISTING_REQUEST,
            ClientMessage::Connect { .. } => PACKET_CONNECT,
            ClientMessage::ConnectFailed { .. } => PACKET_CONNECT_FAILED,
        };

        let mut p = Packet::new(packet_type);
        p.send_u8(PROTOCOL_VERSION);

        match self {
            ClientMessage::Register { visibility, port, info } => {
                p.send_u8(visibility.to_wire());
                p.send_u16(*port);
                info.serialize(&mut p);
            }
            ClientMessage::Update { info } => info.serialize(&mut p),
            ClientMessage::Listing => {}
            ClientMessage::Connect { join_key } => p.send_string(join_key),
            ClientMessage::ConnectFailed { token } => p.send_string(token),
        }
        p
    }

    /// Decode a client message; the service side of the protocol
    pub fn from_packet(p: &mut Packet) -> Result<Self, PacketError> {
        let packet_type = p.packet_type();
        let version = p.recv_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(PacketError::ProtocolVersion {
                expected: PROTOCOL_VERSION,
                received: version,
            });
        }

        match packet_type {
            PACKET_REGISTER => {
                let visibility = Visibility::from_wire(p.recv_u8()?)
                    .ok_or(PacketError::InvalidValue("visibility"))?;
                let port = p.recv_u16()?;
                let info = GameInfo::deserialize(p)?;
                Ok(ClientMessage::Register { visibility, port, info })
            }
            PACKET_UPDATE => Ok(ClientMessage::Update { info: GameInfo::deserialize(p)? }),
            PACKET_LISTING_REQUEST => Ok(ClientMessage::Listing),
            PACKET_CONNECT => Ok(ClientMessage::Connect { join_key: p.recv_string(JOIN_KEY_LENGTH)? }),
            PACKET_CONNECT_FAILED => Ok(ClientMessage::ConnectFailed { token: p.recv_string(TOKEN_LENGTH)? }),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// Messages the service sends to the client
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceMessage {
    RegisterAck {
        join_key: String,
        connection_type: ConnectionType,
    },
    /// One page of a listing pass; an empty page ends the pass
    Listing {
        games: Vec<GameInfo>,
    },
    Connecting {
        token: String,
        join_key: String,
    },
    ConnectFailed {
        token: String,
    },
    DirectConnect {
        token: String,
        host: String,
        port: u16,
    },
    StunRequest {
        token: String,
    },
    StunConnect {
        token: String,
        family: Family,
        host: String,
        port: u16,
    },
    Error {
        kind: ServiceErrorKind,
        detail: String,
    },
}

impl ServiceMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceMessage::RegisterAck { .. } => "REGISTER_ACK",
            ServiceMessage::Listing { .. } => "LISTING",
            ServiceMessage::Connecting { .. } => "CONNECTING",
            ServiceMessage::ConnectFailed { .. } => "CONNECT_FAILED",
            ServiceMessage::DirectConnect { .. } => "DIRECT_CONNECT",
            ServiceMessage::StunRequest { .. } => "STUN_REQUEST",
            ServiceMessage::StunConnect { .. } => "STUN_CONNECT",
            ServiceMessage::Error { .. } => "ERROR",
        }
    }

    pub fn to_packet(&self) -> Packet {
        match self {
            ServiceMessage::RegisterAck { join_key, connection_type } => {
                let mut p = Packet::new(PACKET_REGISTER_ACK);
                p.send_string(join_key);
                p.send_u8(connection_type.to_wire());
                p
            }
            ServiceMessage::Listing { games } => {
                let mut p = Packet::new(PACKET_LISTING);
                p.send_u16(games.len() as u16);
                for game in games {
                    game.serialize(&mut p);
                }
                p
            }
            ServiceMessage::Connecting { token, join_key } => {
                let mut p = Packet::new(PACKET_CONNECTING);
                p.send_string(token);
                p.send_string(join_key);
                p
            }
            ServiceMessage::ConnectFailed { token } => {
                let mut p = Packet::new(PACKET_CONNECT_FAILED);
                p.send_string(token);
                p
            }
            ServiceMessage::DirectConnect { token, host, port } => {
                let mut p = Packet::new(PACKET_DIRECT_CONNECT);
                p.send_string(token);
                p.send_string(host);
                p.send_u16(*port);
                p
            }
            ServiceMessage::StunRequest { token } => {
                let mut p = Packet::new(PACKET_STUN_REQUEST);
                p.send_string(token);
                p
            }
            ServiceMessage::StunConnect { token, family, host, port } => {
                let mut p = Packet::new(PACKET_STUN_CONNECT);
                p.send_string(token);
                p.send_u8(family.to_wire());
                p.send_string(host);
                p.send_u16(*port);
                p
            }
            ServiceMessage::Error { kind, detail } => {
                let mut p = Packet::new(PACKET_ERROR);
                p.send_u8(kind.to_wire());
                p.send_string(detail);
                p
            }
        }
    }

    pub fn from_packet(p: &mut Packet) -> Result<Self, PacketError> {
        match p.packet_type() {
            PACKET_REGISTER_ACK => {
                let join_key = p.recv_string(JOIN_KEY_LENGTH)?;
                let connection_type = ConnectionType::from_wire(p.recv_u8()?)
                    .ok_or(PacketError::InvalidValue("connection type"))?;
                Ok(ServiceMessage::RegisterAck { join_key, connection_type })
            }
            PACKET_LISTING => {
                let count = p.recv_u16()?;
                let games = (0..count)
                    .map(|_| GameInfo::deserialize(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ServiceMessage::Listing { games })
            }
            PACKET_CONNECTING => Ok(ServiceMessage::Connecting {
                token: p.recv_string(TOKEN_LENGTH)?,
                join_key: p.recv_string(JOIN_KEY_LENGTH)?,
            }),
            PACKET_CONNECT_FAILED => Ok(ServiceMessage::ConnectFailed { token: p.recv_string(TOKEN_LENGTH)? }),
            PACKET_DIRECT_CONNECT => Ok(ServiceMessage::DirectConnect {
                token: p.recv_string(TOKEN_LENGTH)?,
                host: p.recv_string(HOSTNAME_LENGTH)?,
                port: p.recv_u16()?,
            }),
            PACKET_STUN_REQUEST => Ok(ServiceMessage::StunRequest { token: p.recv_string(TOKEN_LENGTH)? }),
            PACKET_STUN_CONNECT => {
                let token = p.recv_string(TOKEN_LENGTH)?;
                let family = Family::from_wire(p.recv_u8()?).ok_or(PacketError::InvalidValue("address family"))?;
                Ok(ServiceMessage::StunConnect {
                    token,
                    family,
                    host: p.recv_string(HOSTNAME_LENGTH)?,
                    port: p.recv_u16()?,
                })
            }
            PACKET_ERROR => Ok(ServiceMessage::Error {
                kind: ServiceErrorKind::from_wire(p.recv_u8()?),
                detail: p.recv_string(ERROR_DETAIL_LENGTH)?,
            }),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// Request sent to the STUN relay right after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub token: String,
    pub family: Family,
}

impl StunMessage {
    pub fn to_packet(&self) -> Packet {
        let mut p = Packet::new(PACKET_STUN);
        p.send_u8(PROTOCOL_VERSION);
        p.send_string(&self.token);
        p.send_u8(self.family.to_wire());
        p
    }

    pub fn from_packet(p: &mut Packet) -> Result<Self, PacketError> {
        if p.packet_type() != PACKET_STUN {
            return Err(PacketError::UnknownType(p.packet_type()));
        }
        let version = p.recv_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(PacketError::ProtocolVersion {
                expected: PROTOCOL_VERSION,
                received: version,
            });
        }
        let token = p.recv_string(TOKEN_LENGTH)?;
        let family = Family::from_wire(p.recv_u8()?).ok_or(PacketError::InvalidValue("address family"))?;
        Ok(Self { token, family })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reread(p: Packet) -> Packet {
        Packet::from_frame(p.into_frame().unwrap()).unwrap()
    }

    #[test]
    fn test_client_messages_carry_version() {
        let frame = ClientMessage::Connect { join_key: "ABCD1234".into() }
            .to_packet()
            .into_frame()
            .unwrap();
        assert_eq!(frame[2], PACKET_CONNECT);
        assert_eq!(frame[3], PROTOCOL_VERSION);
        assert_eq!(&frame[4..6], &[0, 8]);
        assert_eq!(&frame[6..], b"ABCD1234");
    }

    #[test]
    fn test_register_decodes() {
        let msg = ClientMessage::Register {
            visibility: Visibility::Public,
            port: 3979,
            info: GameInfo { server_name: "Test".into(), ..GameInfo::default() },
        };
        let mut p = reread(msg.to_packet());
        assert_eq!(ClientMessage::from_packet(&mut p).unwrap(), msg);
    }

    #[test]
    fn test_wrong_protocol_version_is_rejected() {
        let mut p = Packet::new(PACKET_LISTING_REQUEST);
        p.send_u8(PROTOCOL_VERSION + 1);
        let mut p = reread(p);
        assert_eq!(
            ClientMessage::from_packet(&mut p),
            Err(PacketError::ProtocolVersion { expected: PROTOCOL_VERSION, received: PROTOCOL_VERSION + 1 })
        );
    }

    #[test]
    fn test_service_messages_decode() {
        let messages = vec![
            ServiceMessage::RegisterAck { join_key: "K".into(), connection_type: ConnectionType::Stun },
            ServiceMessage::Listing { games: vec![GameInfo::default(), GameInfo::default()] },
            ServiceMessage::Listing { games: Vec::new() },
            ServiceMessage::Connecting { token: "tok1".into(), join_key: "ABCD1234".into() },
            ServiceMessage::DirectConnect { token: "tok1".into(), host: "203.0.113.5".into(), port: 12345 },
            ServiceMessage::StunConnect { token: "tok2".into(), family: Family::V6, host: "2001:db8::1".into(), port: 4000 },
            ServiceMessage::Error { kind: ServiceErrorKind::InvalidJoinKey, detail: "ZZZ".into() },
        ];
        for msg in messages {
            let mut p = reread(msg.to_packet());
            assert_eq!(ServiceMessage::from_packet(&mut p).unwrap(), msg, "{}", msg.name());
            assert_eq!(p.remaining(), 0);
        }
    }

    #[test]
    fn test_unknown_service_message() {
        let mut p = reread(Packet::new(200));
        assert_eq!(ServiceMessage::from_packet(&mut p), Err(PacketError::UnknownType(200)));
    }

    #[test]
    fn test_truncated_listing_is_an_error() {
        let mut p = Packet::new(PACKET_LISTING);
        p.send_u16(2);
        GameInfo::default().serialize(&mut p);
        let mut p = reread(p);
        assert!(matches!(ServiceMessage::from_packet(&mut p), Err(PacketError::Truncated { .. })));
    }

    #[test]
    fn test_stun_message_layout() {
        let msg = StunMessage { token: "tok2".into(), family: Family::V4 };
        let frame = msg.to_packet().into_frame().unwrap();
        assert_eq!(frame, vec![0, 11, PACKET_STUN, PROTOCOL_VERSION, 0, 4, b't', b'o', b'k', b'2', 1]);
        let mut p = Packet::from_frame(frame).unwrap();
        assert_eq!(StunMessage::from_packet(&mut p).unwrap(), msg);
    }
}
