//! ACDS wire protocol
//!
//! Messages exchanged between peers and the discovery service. Framing is the
//! shared length-prefixed bincode codec with a 64 KB cap.
//!
//! ```text
//! Creator                       ACDS                         Joiner
//!    │── SessionCreate ─────────>│                              │
//!    │<─ SessionCreated ─────────│                              │
//!    │                           │<──────────── SessionJoin ────│
//!    │<─ ParticipantJoined ──────│── SessionJoined ────────────>│
//!    │── NetworkQuality ────────>│── NetworkQuality ───────────>│
//!    │<─ NetworkQuality ─────────│<─ NetworkQuality ────────────│
//!    │── HostAnnouncement ──────>│── HostDesignated ───────────>│
//! ```

use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::framing::{self, DecodeError, EncodeError};
use crate::nat::{ConnectionType, NetworkQualityWire};

// ============================================================================
// Constants
// ============================================================================

/// Maximum ACDS message payload (64 KB)
pub const MAX_ACDS_MESSAGE_SIZE: usize = 64 * 1024;

/// Default ACDS TCP port
pub const DEFAULT_ACDS_PORT: u16 = 27225;

/// Upper bound on `max_participants` for any session
pub const MAX_PARTICIPANTS: u8 = 32;

/// Capability bit: session carries video
pub const CAP_VIDEO: u8 = 0x01;

/// Capability bit: session carries audio
pub const CAP_AUDIO: u8 = 0x02;

/// Session identifier assigned by ACDS
pub type SessionId = [u8; 16];

/// Participant identifier assigned by ACDS
pub type ParticipantId = [u8; 16];

/// Generate a random 16-byte identifier
pub fn generate_id() -> Result<[u8; 16]> {
    let rng = SystemRandom::new();
    let mut id = [0u8; 16];
    rng.fill(&mut id)
        .map_err(|_| Error::Crypto("system RNG unavailable".to_string()))?;
    Ok(id)
}

/// Short hex rendering of an id for log lines
pub fn short_id(id: &[u8; 16]) -> String {
    hex::encode(&id[..4])
}

// ============================================================================
// Enums
// ============================================================================

/// ACDS error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    SessionNotFound = 1,
    SessionFull = 2,
    InvalidPassword = 3,
    InvalidSignature = 4,
    RateLimited = 5,
    StringTaken = 6,
    StringInvalid = 7,
    InvalidParam = 8,
    Internal = 255,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::None => "none",
            ErrorCode::SessionNotFound => "session not found",
            ErrorCode::SessionFull => "session full",
            ErrorCode::InvalidPassword => "invalid password",
            ErrorCode::InvalidSignature => "invalid signature",
            ErrorCode::RateLimited => "rate limited",
            ErrorCode::StringTaken => "session string taken",
            ErrorCode::StringInvalid => "session string invalid",
            ErrorCode::InvalidParam => "invalid parameter",
            ErrorCode::Internal => "internal error",
        };
        write!(f, "{} ({})", name, self.as_u8())
    }
}

/// How media flows once a host is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionType {
    #[default]
    DirectTcp,
    WebRtc,
}

// ============================================================================
// Message bodies
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionCreate {
    pub session_type: SessionType,
    pub capabilities: u8,
    pub max_participants: u8,
    pub has_password: bool,
    /// Plaintext over the ACDS link; hashed before storage
    pub password: Option<String>,
    pub expose_ip_publicly: bool,
    /// Non-empty only when the creator is already hosting
    pub server_address: String,
    pub server_port: u16,
    pub reserved_string: Option<String>,
    pub identity_pubkey: Option<[u8; 32]>,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: SessionId,
    /// Creator's participant id
    pub participant_id: ParticipantId,
    pub session_string: String,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

/// Lookup reply; never carries an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub found: bool,
    pub session_id: SessionId,
    pub participant_count: u8,
    pub max_participants: u8,
    pub capabilities: u8,
    pub has_password: bool,
    pub session_type: SessionType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionJoin {
    pub session_string: String,
    pub has_password: bool,
    pub password: Option<String>,
    pub identity_pubkey: Option<[u8; 32]>,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionJoined {
    pub success: bool,
    pub error_code: ErrorCode,
    pub error_message: String,
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    pub initiator_id: ParticipantId,
    /// A host is already running; the address is still subject to IP privacy
    pub host_established: bool,
    pub server_address: String,
    pub server_port: u16,
    pub session_type: SessionType,
    pub turn_username: String,
    pub turn_password: String,
}

impl SessionJoined {
    /// A failed join reply with every address field empty
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: code,
            error_message: message.into(),
            participant_id: [0; 16],
            session_id: [0; 16],
            initiator_id: [0; 16],
            host_established: false,
            server_address: String::new(),
            server_port: 0,
            session_type: SessionType::DirectTcp,
            turn_username: String::new(),
            turn_password: String::new(),
        }
    }

    /// Whether the reply revealed where the host is
    pub fn reveals_host(&self) -> bool {
        !self.server_address.is_empty() && self.server_port != 0
    }
}

/// Where the current host (or future host) can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAnnouncement {
    pub session_id: SessionId,
    pub host_id: ParticipantId,
    pub address: String,
    pub port: u16,
    pub connection_type: ConnectionType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureHostElected {
    pub session_id: SessionId,
    /// Host that ran the round
    pub host_id: ParticipantId,
    pub future_host_id: ParticipantId,
    pub address: String,
    pub port: u16,
    pub connection_type: ConnectionType,
    pub round: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLost {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub last_host_id: ParticipantId,
    pub reason: u32,
    pub disconnect_time_ms: u64,
}

// ============================================================================
// Message enum
// ============================================================================

/// Every message on the ACDS link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcdsMessage {
    SessionCreate(SessionCreate),
    SessionCreated(SessionCreated),
    SessionLookup {
        session_string: String,
    },
    SessionInfo(SessionInfo),
    SessionJoin(SessionJoin),
    SessionJoined(SessionJoined),
    SessionLeave {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    ParticipantJoined {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    ParticipantLeft {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    NetworkQuality(NetworkQualityWire),
    ElectionRequest {
        session_id: SessionId,
        host_id: ParticipantId,
        round: u64,
    },
    FutureHostElected(FutureHostElected),
    HostAnnouncement(HostAnnouncement),
    /// Server rebroadcast of a `HostAnnouncement`
    HostDesignated(HostAnnouncement),
    HostLost(HostLost),
    Ping,
    Pong,
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl AcdsMessage {
    /// Session the message is scoped to, for relay routing
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            AcdsMessage::SessionCreated(m) => Some(m.session_id),
            AcdsMessage::SessionLeave { session_id, .. }
            | AcdsMessage::ParticipantJoined { session_id, .. }
            | AcdsMessage::ParticipantLeft { session_id, .. }
            | AcdsMessage::ElectionRequest { session_id, .. } => Some(*session_id),
            AcdsMessage::NetworkQuality(w) => Some(w.session_id),
            AcdsMessage::FutureHostElected(m) => Some(m.session_id),
            AcdsMessage::HostAnnouncement(m) | AcdsMessage::HostDesignated(m) => {
                Some(m.session_id)
            }
            AcdsMessage::HostLost(m) => Some(m.session_id),
            _ => None,
        }
    }

    /// Short name for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            AcdsMessage::SessionCreate(_) => "SessionCreate",
            AcdsMessage::SessionCreated(_) => "SessionCreated",
            AcdsMessage::SessionLookup { .. } => "SessionLookup",
            AcdsMessage::SessionInfo(_) => "SessionInfo",
            AcdsMessage::SessionJoin(_) => "SessionJoin",
            AcdsMessage::SessionJoined(_) => "SessionJoined",
            AcdsMessage::SessionLeave { .. } => "SessionLeave",
            AcdsMessage::ParticipantJoined { .. } => "ParticipantJoined",
            AcdsMessage::ParticipantLeft { .. } => "ParticipantLeft",
            AcdsMessage::NetworkQuality(_) => "NetworkQuality",
            AcdsMessage::ElectionRequest { .. } => "ElectionRequest",
            AcdsMessage::FutureHostElected(_) => "FutureHostElected",
            AcdsMessage::HostAnnouncement(_) => "HostAnnouncement",
            AcdsMessage::HostDesignated(_) => "HostDesignated",
            AcdsMessage::HostLost(_) => "HostLost",
            AcdsMessage::Ping => "Ping",
            AcdsMessage::Pong => "Pong",
            AcdsMessage::Error { .. } => "Error",
        }
    }
}

/// Encode an ACDS message with its length prefix
pub fn encode_message(msg: &AcdsMessage) -> std::result::Result<Vec<u8>, EncodeError> {
    framing::encode_frame(msg, MAX_ACDS_MESSAGE_SIZE)
}

/// Decode one ACDS message from the front of `buf`
pub fn decode_message(buf: &[u8]) -> std::result::Result<(AcdsMessage, usize), DecodeError> {
    framing::decode_frame(buf, MAX_ACDS_MESSAGE_SIZE)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_unique() {
        let a = generate_id().unwrap();
        let b = generate_id().unwrap();
        assert_ne!(a, b);
        assert_eq!(short_id(&a).len(), 8);
    }

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::None.as_u8(), 0);
        assert_eq!(ErrorCode::SessionNotFound.as_u8(), 1);
        assert_eq!(ErrorCode::InvalidParam.as_u8(), 8);
        assert_eq!(ErrorCode::Internal.as_u8(), 255);
        assert!(ErrorCode::RateLimited.to_string().contains("(5)"));
    }

    #[test]
    fn test_join_failure_has_no_address() {
        let reply = SessionJoined::failure(ErrorCode::InvalidPassword, "wrong password");
        assert!(!reply.success);
        assert!(reply.server_address.is_empty());
        assert_eq!(reply.server_port, 0);
        assert!(reply.turn_username.is_empty());
        assert!(reply.turn_password.is_empty());
        assert!(!reply.reveals_host());
    }

    #[test]
    fn test_message_session_routing() {
        let sid = [7u8; 16];
        let msg = AcdsMessage::ElectionRequest {
            session_id: sid,
            host_id: [1; 16],
            round: 3,
        };
        assert_eq!(msg.session_id(), Some(sid));
        assert_eq!(AcdsMessage::Ping.session_id(), None);
        assert_eq!(msg.kind(), "ElectionRequest");
    }

    #[test]
    fn test_create_message_over_framing() {
        let msg = AcdsMessage::SessionCreate(SessionCreate {
            capabilities: CAP_VIDEO | CAP_AUDIO,
            max_participants: 4,
            server_address: "203.0.113.5".to_string(),
            server_port: 27224,
            ..Default::default()
        });

        let encoded = encode_message(&msg).unwrap();
        let (decoded, consumed) = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let msg = AcdsMessage::Error {
            code: ErrorCode::Internal,
            message: "x".repeat(MAX_ACDS_MESSAGE_SIZE + 1),
        };
        assert!(matches!(
            encode_message(&msg),
            Err(EncodeError::MessageTooLarge { .. })
        ));
    }
}
