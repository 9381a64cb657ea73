//! Session registry
//!
//! The registry maintains:
//! - Sessions by id, with their members and current host
//! - A session-string index for lookup/join
//!
//! It only keeps state; who gets told what is decided in `signaling`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info};
use ring::rand::SystemRandom;

use session_core::nat::ConnectionType;
use session_core::protocol::{
    generate_id, short_id, ErrorCode, HostAnnouncement, ParticipantId, SessionId, SessionType,
    MAX_PARTICIPANTS,
};

use crate::auth::PasswordHash;
use crate::strings;

/// Attempts at drawing an unused session string
const STRING_ATTEMPTS: usize = 16;

// ============================================================================
// Session entry
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session_id: SessionId,
    pub session_string: String,
    pub session_type: SessionType,
    pub capabilities: u8,
    pub max_participants: u8,
    pub password: Option<PasswordHash>,
    pub expose_ip_publicly: bool,

    pub initiator_id: ParticipantId,
    /// First participant to join after the creator
    pub initiator_peer: Option<ParticipantId>,
    pub participants: Vec<ParticipantId>,

    pub host_id: Option<ParticipantId>,
    pub host_address: String,
    pub host_port: u16,
    pub host_connection_type: ConnectionType,
    /// Set by `HostLost`, cleared by the next announcement
    pub migration_started: Option<Instant>,

    pub created_at: Instant,
    pub expires_at: Instant,
}

impl SessionEntry {
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants as usize
    }

    pub fn host_established(&self) -> bool {
        self.host_id.is_some() || (!self.host_address.is_empty() && self.host_port != 0)
    }

    pub fn is_member(&self, id: &ParticipantId) -> bool {
        self.participants.contains(id)
    }
}

/// Validated create parameters
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_type: SessionType,
    pub capabilities: u8,
    pub max_participants: u8,
    pub password: Option<PasswordHash>,
    pub expose_ip_publicly: bool,
    pub reserved_string: Option<String>,
    /// Creator already hosting
    pub host_address: String,
    pub host_port: u16,
}

// ============================================================================
// Registry
// ============================================================================

pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionEntry>,
    by_string: HashMap<String, SessionId>,
    ttl: Duration,
    rng: SystemRandom,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            by_string: HashMap::new(),
            ttl,
            rng: SystemRandom::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&SessionEntry> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &SessionId) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(session_id)
    }

    pub fn find_by_string(&self, session_string: &str) -> Option<&SessionEntry> {
        self.by_string
            .get(session_string)
            .and_then(|id| self.sessions.get(id))
    }

    /// Create a session with the creator as its first member
    ///
    /// Returns the session id and the creator's participant id.
    pub fn create(
        &mut self,
        req: NewSession,
        now: Instant,
    ) -> Result<(SessionId, ParticipantId), ErrorCode> {
        if req.max_participants == 0 || req.max_participants > MAX_PARTICIPANTS {
            return Err(ErrorCode::InvalidParam);
        }

        let session_string = match req.reserved_string {
            Some(s) => {
                if !strings::is_valid(&s) {
                    return Err(ErrorCode::StringInvalid);
                }
                if self.by_string.contains_key(&s) {
                    return Err(ErrorCode::StringTaken);
                }
                s
            }
            None => self.fresh_string()?,
        };

        let session_id = generate_id().map_err(|_| ErrorCode::Internal)?;
        let creator = generate_id().map_err(|_| ErrorCode::Internal)?;

        let host_id = (req.host_port != 0).then_some(creator);
        let entry = SessionEntry {
            session_id,
            session_string: session_string.clone(),
            session_type: req.session_type,
            capabilities: req.capabilities,
            max_participants: req.max_participants,
            password: req.password,
            expose_ip_publicly: req.expose_ip_publicly,
            initiator_id: creator,
            initiator_peer: None,
            participants: vec![creator],
            host_id,
            host_address: req.host_address,
            host_port: req.host_port,
            host_connection_type: ConnectionType::DirectPublic,
            migration_started: None,
            created_at: now,
            expires_at: now + self.ttl,
        };

        info!(
            "Session '{}' created ({}), max {} participants{}",
            session_string,
            short_id(&session_id),
            entry.max_participants,
            if entry.has_password() { ", password" } else { "" }
        );
        self.sessions.insert(session_id, entry);
        self.by_string.insert(session_string, session_id);
        Ok((session_id, creator))
    }

    fn fresh_string(&self) -> Result<String, ErrorCode> {
        for _ in 0..STRING_ATTEMPTS {
            let s = strings::generate(&self.rng).ok_or(ErrorCode::Internal)?;
            if !self.by_string.contains_key(&s) {
                return Ok(s);
            }
            debug!("Session string collision on '{}'", s);
        }
        Err(ErrorCode::Internal)
    }

    /// Add a participant; password and capacity checks happen here
    pub fn join(
        &mut self,
        session_string: &str,
        password: Option<&str>,
    ) -> Result<(SessionId, ParticipantId, bool), ErrorCode> {
        let session_id = *self
            .by_string
            .get(session_string)
            .ok_or(ErrorCode::SessionNotFound)?;
        let entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or(ErrorCode::SessionNotFound)?;

        if entry.is_full() {
            return Err(ErrorCode::SessionFull);
        }

        let password_verified = match &entry.password {
            Some(hash) => match password {
                Some(p) if hash.verify(p) => true,
                _ => return Err(ErrorCode::InvalidPassword),
            },
            None => false,
        };

        let participant_id = generate_id().map_err(|_| ErrorCode::Internal)?;
        entry.participants.push(participant_id);
        if entry.initiator_peer.is_none() {
            entry.initiator_peer = Some(participant_id);
        }

        info!(
            "Participant {} joined '{}' ({}/{})",
            short_id(&participant_id),
            entry.session_string,
            entry.participants.len(),
            entry.max_participants
        );
        Ok((session_id, participant_id, password_verified))
    }

    /// Remove a member; an empty session is deleted (returns true)
    pub fn leave(&mut self, session_id: &SessionId, participant_id: &ParticipantId) -> bool {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return false;
        };
        entry.participants.retain(|p| p != participant_id);
        if entry.host_id.as_ref() == Some(participant_id) {
            debug!("Host {} left '{}'", short_id(participant_id), entry.session_string);
        }

        if entry.participants.is_empty() {
            self.remove(session_id);
            return true;
        }
        false
    }

    fn remove(&mut self, session_id: &SessionId) {
        if let Some(entry) = self.sessions.remove(session_id) {
            self.by_string.remove(&entry.session_string);
            info!("Session '{}' removed", entry.session_string);
        }
    }

    /// Record the current host; ends any migration in progress
    pub fn set_host(&mut self, ann: &HostAnnouncement) -> bool {
        let Some(entry) = self.sessions.get_mut(&ann.session_id) else {
            return false;
        };
        if !entry.is_member(&ann.host_id) {
            return false;
        }
        if let Some(started) = entry.migration_started.take() {
            info!(
                "Session '{}' migrated to {} in {} ms",
                entry.session_string,
                short_id(&ann.host_id),
                started.elapsed().as_millis()
            );
        }
        entry.host_id = Some(ann.host_id);
        entry.host_address = ann.address.clone();
        entry.host_port = ann.port;
        entry.host_connection_type = ann.connection_type;
        true
    }

    /// Start migration tracking; true the first time per migration
    pub fn host_lost(&mut self, session_id: &SessionId, now: Instant) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(entry) if entry.migration_started.is_none() => {
                entry.migration_started = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Clear the host of sessions whose migration never finished
    pub fn expire_migrations(&mut self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        let mut cleared = Vec::new();
        for entry in self.sessions.values_mut() {
            let Some(started) = entry.migration_started else {
                continue;
            };
            if now.saturating_duration_since(started) >= timeout {
                info!(
                    "Migration in '{}' timed out, clearing host",
                    entry.session_string
                );
                entry.migration_started = None;
                entry.host_id = None;
                entry.host_address.clear();
                entry.host_port = 0;
                cleared.push(entry.session_id);
            }
        }
        cleared
    }

    /// Drop sessions past their lifetime
    pub fn expire_sessions(&mut self, now: Instant) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|e| now >= e.expires_at)
            .map(|e| e.session_id)
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(max: u8) -> NewSession {
        NewSession {
            session_type: SessionType::DirectTcp,
            capabilities: 3,
            max_participants: max,
            password: None,
            expose_ip_publicly: false,
            reserved_string: None,
            host_address: String::new(),
            host_port: 0,
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(3600))
    }

    #[test]
    fn test_create_and_find() {
        let mut reg = registry();
        let (sid, creator) = reg.create(new_session(4), Instant::now()).unwrap();
        let entry = reg.get(&sid).unwrap();
        assert!(strings::is_valid(&entry.session_string));
        assert_eq!(entry.initiator_id, creator);
        assert_eq!(entry.participants, vec![creator]);
        assert!(!entry.host_established());

        let s = entry.session_string.clone();
        assert_eq!(reg.find_by_string(&s).unwrap().session_id, sid);
    }

    #[test]
    fn test_create_validation() {
        let mut reg = registry();
        let now = Instant::now();
        assert_eq!(reg.create(new_session(0), now), Err(ErrorCode::InvalidParam));
        assert_eq!(reg.create(new_session(33), now), Err(ErrorCode::InvalidParam));

        let mut bad = new_session(2);
        bad.reserved_string = Some("Not-Valid".to_string());
        assert_eq!(reg.create(bad, now), Err(ErrorCode::StringInvalid));

        let mut first = new_session(2);
        first.reserved_string = Some("calm-lake-tree".to_string());
        assert!(reg.create(first.clone(), now).is_ok());
        assert_eq!(reg.create(first, now), Err(ErrorCode::StringTaken));
    }

    #[test]
    fn test_join_capacity() {
        let mut reg = registry();
        let (sid, _) = reg.create(new_session(2), Instant::now()).unwrap();
        let s = reg.get(&sid).unwrap().session_string.clone();

        let (joined_sid, peer, verified) = reg.join(&s, None).unwrap();
        assert_eq!(joined_sid, sid);
        assert!(!verified);
        assert_eq!(reg.get(&sid).unwrap().initiator_peer, Some(peer));

        assert_eq!(reg.join(&s, None), Err(ErrorCode::SessionFull));
        assert_eq!(reg.join("no-such-thing", None), Err(ErrorCode::SessionNotFound));
    }

    #[test]
    fn test_join_password() {
        let mut reg = registry();
        let mut req = new_session(4);
        req.password = Some(PasswordHash::new(&SystemRandom::new(), "pw").unwrap());
        let (sid, _) = reg.create(req, Instant::now()).unwrap();
        let s = reg.get(&sid).unwrap().session_string.clone();

        assert_eq!(reg.join(&s, None), Err(ErrorCode::InvalidPassword));
        assert_eq!(reg.join(&s, Some("nope")), Err(ErrorCode::InvalidPassword));
        let (_, _, verified) = reg.join(&s, Some("pw")).unwrap();
        assert!(verified);
    }

    #[test]
    fn test_last_leave_removes_session() {
        let mut reg = registry();
        let (sid, creator) = reg.create(new_session(4), Instant::now()).unwrap();
        let s = reg.get(&sid).unwrap().session_string.clone();
        let (_, peer, _) = reg.join(&s, None).unwrap();

        assert!(!reg.leave(&sid, &creator));
        assert!(reg.leave(&sid, &peer));
        assert!(reg.is_empty());
        assert!(reg.find_by_string(&s).is_none());
    }

    #[test]
    fn test_host_and_migration() {
        let mut reg = registry();
        let start = Instant::now();
        let (sid, creator) = reg.create(new_session(4), start).unwrap();

        let ann = HostAnnouncement {
            session_id: sid,
            host_id: creator,
            address: "203.0.113.9".to_string(),
            port: 27224,
            connection_type: ConnectionType::DirectPublic,
        };
        assert!(reg.set_host(&ann));
        assert!(reg.get(&sid).unwrap().host_established());

        // Non-members cannot claim the host role
        let mut stranger = ann.clone();
        stranger.host_id = [0xee; 16];
        assert!(!reg.set_host(&stranger));

        assert!(reg.host_lost(&sid, start));
        assert!(!reg.host_lost(&sid, start));
        assert!(reg
            .expire_migrations(start + Duration::from_secs(10), Duration::from_secs(30))
            .is_empty());
        assert_eq!(
            reg.expire_migrations(start + Duration::from_secs(30), Duration::from_secs(30)),
            vec![sid]
        );
        assert!(!reg.get(&sid).unwrap().host_established());
    }

    #[test]
    fn test_sessions_expire() {
        let mut reg = SessionRegistry::new(Duration::from_secs(60));
        let start = Instant::now();
        let (sid, _) = reg.create(new_session(4), start).unwrap();
        assert!(reg.expire_sessions(start + Duration::from_secs(59)).is_empty());
        assert_eq!(reg.expire_sessions(start + Duration::from_secs(60)), vec![sid]);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_creator_already_hosting() {
        let mut reg = registry();
        let mut req = new_session(4);
        req.host_address = "198.51.100.4".to_string();
        req.host_port = 27224;
        let (sid, creator) = reg.create(req, Instant::now()).unwrap();
        let entry = reg.get(&sid).unwrap();
        assert_eq!(entry.host_id, Some(creator));
        assert!(entry.host_established());
    }
}
