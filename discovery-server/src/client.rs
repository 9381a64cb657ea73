//! Connected clients of the discovery server

use std::net::SocketAddr;

use session_core::protocol::{short_id, ParticipantId, SessionId};
use session_core::transport::StreamConnection;

// ============================================================================
// Membership
// ============================================================================

/// Session a connection has created or joined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            short_id(&self.session_id),
            short_id(&self.participant_id)
        )
    }
}

// ============================================================================
// Client Structure
// ============================================================================

/// A framed TCP connection from a peer
pub struct Client {
    pub conn: StreamConnection,
    /// Source address as seen by the server
    pub observed_addr: SocketAddr,
    /// Set once the peer creates or joins a session
    pub membership: Option<Membership>,
}

impl Client {
    pub fn new(conn: StreamConnection, observed_addr: SocketAddr) -> Self {
        Client {
            conn,
            observed_addr,
            membership: None,
        }
    }

    pub fn is_member_of(&self, session_id: &SessionId) -> bool {
        self.membership
            .map(|m| &m.session_id == session_id)
            .unwrap_or(false)
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.membership.map(|m| m.participant_id)
    }
}
