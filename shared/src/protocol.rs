//! Datagram-level protocol shared by server and client.
//!
//! Every UDP datagram carries exactly one [`Packet`]. Connection management
//! (connect, heartbeat, kick, disconnect) lives directly on the packet, while
//! game messages travel inside an [`Envelope`] that is either sequenced on the
//! reliable-ordered channel or sent raw as unreliable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bumped whenever the wire layout changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Receive buffer size used by both sides.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Opaque id the server assigns to every admitted peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Protocol-level message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Opcode(pub u16);

impl Opcode {
    pub const ENTER_GAME: Opcode = Opcode(1);
    pub const CLIENT_READY: Opcode = Opcode(2);
    pub const SAFE_DISCONNECT: Opcode = Opcode(3);
    pub const CHAT: Opcode = Opcode(10);
    pub const TIME_OF_DAY: Opcode = Opcode(11);
    pub const MAP_INFO: Opcode = Opcode(12);
    pub const SERVER_INFO: Opcode = Opcode(13);
    pub const ENTITY_STATE: Opcode = Opcode(14);
    pub const PARTY_MEMBERS: Opcode = Opcode(15);
    pub const GUILD_MEMBERS: Opcode = Opcode(16);
    pub const SPAWN_PROGRESS: Opcode = Opcode(17);

    /// Delivery class the sender must use for this opcode.
    ///
    /// Time-of-day and per-entity snapshots are superseded by the next update,
    /// so losing or reordering them is harmless; everything else is sequenced.
    pub fn delivery(self) -> DeliveryClass {
        match self {
            Opcode::TIME_OF_DAY | Opcode::ENTITY_STATE => DeliveryClass::Unreliable,
            _ => DeliveryClass::ReliableOrdered,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryClass {
    ReliableOrdered,
    Unreliable,
}

/// Typed outcome of a request, round-tripped to the caller for display.
///
/// Also used as the packed 16-bit reason of a [`Packet::Kick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ResultCode {
    None = 0,
    ServerClose = 1,
    ServerFull = 2,
    ServerNotReady = 3,
    NotEnteredGame = 4,
    AlreadyEnteredGame = 5,
    InvalidCharacter = 6,
    MalformedMessage = 7,
    Timeout = 8,
    InternalError = 9,
    VersionMismatch = 10,
}

impl ResultCode {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Unknown codes collapse to `InternalError` so a newer peer can never
    /// make us misreport a rejection as success.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => ResultCode::None,
            1 => ResultCode::ServerClose,
            2 => ResultCode::ServerFull,
            3 => ResultCode::ServerNotReady,
            4 => ResultCode::NotEnteredGame,
            5 => ResultCode::AlreadyEnteredGame,
            6 => ResultCode::InvalidCharacter,
            7 => ResultCode::MalformedMessage,
            8 => ResultCode::Timeout,
            10 => ResultCode::VersionMismatch,
            _ => ResultCode::InternalError,
        }
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::None
    }

    /// Localization key surfaced in the client's disconnect dialog.
    pub fn message_key(self) -> &'static str {
        match self {
            ResultCode::None => "UI_NONE",
            ResultCode::ServerClose => "UI_ERROR_SERVER_CLOSE",
            ResultCode::ServerFull => "UI_ERROR_SERVER_FULL",
            ResultCode::ServerNotReady => "UI_ERROR_SERVER_NOT_READY",
            ResultCode::NotEnteredGame => "UI_ERROR_NOT_ENTERED_GAME",
            ResultCode::AlreadyEnteredGame => "UI_ERROR_ALREADY_ENTERED_GAME",
            ResultCode::InvalidCharacter => "UI_ERROR_INVALID_CHARACTER",
            ResultCode::MalformedMessage => "UI_ERROR_MALFORMED_MESSAGE",
            ResultCode::Timeout => "UI_ERROR_TIMEOUT",
            ResultCode::InternalError => "UI_ERROR_INTERNAL_SERVER_ERROR",
            ResultCode::VersionMismatch => "UI_ERROR_INVALID_VERSION",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.message_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Notification,
    Request { correlation_id: u32 },
    Response { correlation_id: u32, result: ResultCode },
}

/// A routed message: opcode, direction/correlation and an encoded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub opcode: Opcode,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn delivery(&self) -> DeliveryClass {
        self.opcode.delivery()
    }

    pub fn correlation_id(&self) -> Option<u32> {
        match self.kind {
            MessageKind::Notification => None,
            MessageKind::Request { correlation_id } => Some(correlation_id),
            MessageKind::Response { correlation_id, .. } => Some(correlation_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    Connect { client_version: u32 },
    Connected { connection_id: ConnectionId },
    Heartbeat,
    Reliable { sequence: u32, envelope: Envelope },
    /// Cumulative: every reliable sequence up to and including this one arrived.
    Ack { sequence: u32 },
    Unreliable { envelope: Envelope },
    Kick { reason: u16 },
    Disconnect,
}

impl Packet {
    /// Wraps an envelope for a one-off unreliable send; reliable sends must go
    /// through a [`crate::channel::ReliableChannel`] to get a sequence number.
    pub fn unreliable(envelope: Envelope) -> Self {
        Packet::Unreliable { envelope }
    }

    pub fn kick(reason: ResultCode) -> Self {
        Packet::Kick {
            reason: reason.to_u16(),
        }
    }
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(packet)
}

pub fn decode_packet(data: &[u8]) -> Result<Packet, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_roundtrip_through_u16() {
        let codes = [
            ResultCode::None,
            ResultCode::ServerClose,
            ResultCode::ServerFull,
            ResultCode::ServerNotReady,
            ResultCode::NotEnteredGame,
            ResultCode::AlreadyEnteredGame,
            ResultCode::InvalidCharacter,
            ResultCode::MalformedMessage,
            ResultCode::Timeout,
            ResultCode::InternalError,
            ResultCode::VersionMismatch,
        ];

        for code in codes {
            assert_eq!(ResultCode::from_u16(code.to_u16()), code);
        }
    }

    #[test]
    fn test_unknown_result_code_is_never_success() {
        assert_eq!(ResultCode::from_u16(999), ResultCode::InternalError);
        assert!(!ResultCode::from_u16(999).is_success());
    }

    #[test]
    fn test_message_keys_are_distinct() {
        let a = ResultCode::ServerClose.message_key();
        let b = ResultCode::ServerFull.message_key();
        assert_ne!(a, b);
        assert!(a.starts_with("UI_ERROR_"));
    }

    #[test]
    fn test_opcode_delivery_classes() {
        assert_eq!(Opcode::TIME_OF_DAY.delivery(), DeliveryClass::Unreliable);
        assert_eq!(Opcode::ENTITY_STATE.delivery(), DeliveryClass::Unreliable);
        assert_eq!(Opcode::ENTER_GAME.delivery(), DeliveryClass::ReliableOrdered);
        assert_eq!(Opcode::MAP_INFO.delivery(), DeliveryClass::ReliableOrdered);
    }

    #[test]
    fn test_kick_packs_reason_code() {
        match Packet::kick(ResultCode::ServerClose) {
            Packet::Kick { reason } => assert_eq!(reason, 1),
            _ => panic!("Wrong packet type"),
        }
    }

    #[test]
    fn test_truncated_packet_is_rejected() {
        let packet = Packet::Reliable {
            sequence: 7,
            envelope: Envelope {
                opcode: Opcode::CHAT,
                kind: MessageKind::Notification,
                payload: vec![1, 2, 3, 4],
            },
        };
        let data = encode_packet(&packet).unwrap();
        assert_eq!(decode_packet(&data).unwrap(), packet);
        assert!(decode_packet(&data[..data.len() / 2]).is_err());
        assert!(decode_packet(&[]).is_err());
    }

    #[test]
    fn test_envelope_correlation_id() {
        let request = Envelope {
            opcode: Opcode::ENTER_GAME,
            kind: MessageKind::Request { correlation_id: 4 },
            payload: Vec::new(),
        };
        let notification = Envelope {
            opcode: Opcode::CHAT,
            kind: MessageKind::Notification,
            payload: Vec::new(),
        };
        assert_eq!(request.correlation_id(), Some(4));
        assert_eq!(notification.correlation_id(), None);
    }
}
