//! ACDS request handling and session relay
//!
//! Turns one decoded message from a client into the messages the server has
//! to deliver. The I/O loop in `server` owns the sockets and routes the
//! resulting `Delivery` values.
//!
//! # Protocol Flow
//!
//! ```text
//! Creator                   ACDS                    Joiner
//!   │                        │                        │
//!   │─── SessionCreate ─────►│                        │
//!   │◄── SessionCreated ─────│                        │
//!   │                        │◄──── SessionJoin ──────│
//!   │                        │───── SessionJoined ───►│
//!   │◄── ParticipantJoined ──│                        │
//!   │                        │                        │
//!   │─── NetworkQuality ────►│──── NetworkQuality ───►│
//!   │◄── NetworkQuality ─────│◄─── NetworkQuality ────│
//!   │                        │                        │
//!   │─── HostAnnouncement ──►│──── HostDesignated ───►│
//! ```
//!
//! # IP privacy
//!
//! A joiner learns the host address from `SessionJoined` only when it proved
//! the session password or the creator opted into `expose_ip_publicly`.
//! Lookups never carry an address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use ring::rand::SystemRandom;

use session_core::identity;
use session_core::protocol::{
    short_id, AcdsMessage, ErrorCode, ParticipantId, SessionCreate, SessionCreated, SessionId,
    SessionInfo, SessionJoin, SessionJoined, SessionType, TurnServer,
};

use crate::auth::{self, PasswordHash};
use crate::client::Membership;
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::rate_limit::{RateEvent, RateLimiter};
use crate::registry::{NewSession, SessionRegistry};

// ============================================================================
// Deliveries
// ============================================================================

/// Where a produced message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Back to the sender
    Reply(AcdsMessage),
    /// To every member of a session, optionally skipping one
    Session {
        session_id: SessionId,
        except: Option<ParticipantId>,
        msg: AcdsMessage,
    },
}

impl Delivery {
    fn to_others(membership: &Membership, msg: AcdsMessage) -> Self {
        Delivery::Session {
            session_id: membership.session_id,
            except: Some(membership.participant_id),
            msg,
        }
    }
}

fn error(code: ErrorCode, message: impl Into<String>) -> Vec<Delivery> {
    vec![Delivery::Reply(AcdsMessage::Error {
        code,
        message: message.into(),
    })]
}

// ============================================================================
// Handler
// ============================================================================

pub struct Signaling {
    config: ServerConfig,
    registry: SessionRegistry,
    limiter: RateLimiter,
    metrics: Arc<Metrics>,
    rng: SystemRandom,
}

impl Signaling {
    pub fn new(config: ServerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            registry: SessionRegistry::new(config.session_ttl()),
            limiter: RateLimiter::new(config.rate_limits),
            config,
            metrics,
            rng: SystemRandom::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Process one message from `peer`
    ///
    /// `membership` is the sender's session slot; create/join fill it,
    /// leave clears it.
    pub fn handle(
        &mut self,
        peer: SocketAddr,
        membership: &mut Option<Membership>,
        msg: AcdsMessage,
        now: Instant,
    ) -> Vec<Delivery> {
        debug!("{} -> {}", peer, msg.kind());
        match msg {
            AcdsMessage::SessionCreate(req) => self.handle_create(peer, membership, req, now),
            AcdsMessage::SessionLookup { session_string } => {
                self.handle_lookup(peer, &session_string, now)
            }
            AcdsMessage::SessionJoin(req) => self.handle_join(peer, membership, req, now),
            AcdsMessage::SessionLeave {
                session_id,
                participant_id,
            } => {
                let Some(m) = *membership else {
                    return Vec::new();
                };
                if m.session_id != session_id || m.participant_id != participant_id {
                    return error(ErrorCode::InvalidParam, "not a member of that session");
                }
                *membership = None;
                self.leave(m)
            }
            AcdsMessage::HostAnnouncement(ann) => {
                let Some(m) = self.check_member(membership, &ann.session_id) else {
                    return error(ErrorCode::InvalidParam, "not a member of that session");
                };
                if !self.registry.set_host(&ann) {
                    return error(ErrorCode::InvalidParam, "unknown host");
                }
                info!(
                    "Host for {} is {} at {}:{}",
                    short_id(&ann.session_id),
                    short_id(&ann.host_id),
                    ann.address,
                    ann.port
                );
                Metrics::inc(&self.metrics.messages_relayed_total);
                vec![Delivery::to_others(&m, AcdsMessage::HostDesignated(ann))]
            }
            AcdsMessage::HostLost(lost) => {
                let Some(m) = self.check_member(membership, &lost.session_id) else {
                    return Vec::new();
                };
                if self.registry.host_lost(&lost.session_id, now) {
                    Metrics::inc(&self.metrics.migrations_total);
                    info!(
                        "Host {} lost in {} (reason {}), migration started",
                        short_id(&lost.last_host_id),
                        short_id(&lost.session_id),
                        lost.reason
                    );
                }
                self.relay(&m, AcdsMessage::HostLost(lost))
            }
            msg @ (AcdsMessage::NetworkQuality(_)
            | AcdsMessage::ElectionRequest { .. }
            | AcdsMessage::FutureHostElected(_)) => {
                let Some(session_id) = msg.session_id() else {
                    return Vec::new();
                };
                match self.check_member(membership, &session_id) {
                    Some(m) => self.relay(&m, msg),
                    None => {
                        debug!("Dropping {} from non-member {}", msg.kind(), peer);
                        Vec::new()
                    }
                }
            }
            AcdsMessage::Ping => vec![Delivery::Reply(AcdsMessage::Pong)],
            AcdsMessage::Pong => Vec::new(),
            other => {
                debug!("Unexpected {} from {}", other.kind(), peer);
                error(ErrorCode::InvalidParam, "unexpected message")
            }
        }
    }

    /// The connection went away without a leave
    pub fn disconnect(&mut self, membership: Membership) -> Vec<Delivery> {
        debug!("Member {} disconnected", membership);
        self.leave(membership)
    }

    /// Periodic housekeeping; returns sessions that no longer exist
    pub fn cleanup(&mut self, now: Instant) -> Vec<SessionId> {
        let expired = self.registry.expire_sessions(now);
        let cleared = self
            .registry
            .expire_migrations(now, self.config.migration_timeout());
        let dropped = self.limiter.cleanup(now);
        if !expired.is_empty() || !cleared.is_empty() || dropped > 0 {
            debug!(
                "Cleanup: {} sessions expired, {} migrations timed out, {} rate entries dropped",
                expired.len(),
                cleared.len(),
                dropped
            );
        }
        self.update_session_gauge();
        expired
    }

    // ========================================================================
    // Create / lookup / join
    // ========================================================================

    fn handle_create(
        &mut self,
        peer: SocketAddr,
        membership: &mut Option<Membership>,
        req: SessionCreate,
        now: Instant,
    ) -> Vec<Delivery> {
        if !self.limiter.check(peer.ip(), RateEvent::Create, now) {
            Metrics::inc(&self.metrics.rate_limited_total);
            return error(ErrorCode::RateLimited, "too many session creations");
        }
        if membership.is_some() {
            return error(ErrorCode::InvalidParam, "already in a session");
        }
        if let Err(e) = auth::verify_create(
            &req,
            self.config.require_server_identity,
            identity::unix_timestamp(),
        ) {
            warn!("Rejected create from {}: {}", peer, e);
            return error(ErrorCode::InvalidSignature, e.to_string());
        }

        let password = if req.has_password {
            match req.password.as_deref() {
                Some(p) if !p.is_empty() => match PasswordHash::new(&self.rng, p) {
                    Ok(h) => Some(h),
                    Err(e) => return error(ErrorCode::Internal, e.to_string()),
                },
                _ => return error(ErrorCode::InvalidParam, "password flag set without password"),
            }
        } else {
            None
        };

        // A creator that already hosts but cannot see its own public address
        let mut host_address = req.server_address;
        if req.server_port != 0 && host_address.is_empty() {
            host_address = peer.ip().to_string();
        }

        let new = NewSession {
            session_type: req.session_type,
            capabilities: req.capabilities,
            max_participants: req.max_participants,
            password,
            expose_ip_publicly: req.expose_ip_publicly,
            reserved_string: req.reserved_string,
            host_address,
            host_port: req.server_port,
        };
        let (session_id, participant_id) = match self.registry.create(new, now) {
            Ok(ids) => ids,
            Err(code) => return error(code, code.to_string()),
        };
        let session_string = self
            .registry
            .get(&session_id)
            .map(|e| e.session_string.clone())
            .unwrap_or_default();

        *membership = Some(Membership {
            session_id,
            participant_id,
        });
        Metrics::inc(&self.metrics.sessions_created_total);
        self.update_session_gauge();

        vec![Delivery::Reply(AcdsMessage::SessionCreated(SessionCreated {
            session_id,
            participant_id,
            session_string,
            stun_servers: self.config.stun_servers.clone(),
            turn_servers: self.turn_servers(&session_id),
        }))]
    }

    fn turn_servers(&self, session_id: &SessionId) -> Vec<TurnServer> {
        let (username, credential) = match &self.config.turn_secret {
            Some(secret) => auth::turn_credentials(
                secret,
                session_id,
                identity::unix_timestamp(),
                self.config.turn_credential_ttl_secs,
            ),
            None => (String::new(), String::new()),
        };
        self.config
            .turn_servers
            .iter()
            .map(|t| TurnServer {
                url: t.url.clone(),
                username: username.clone(),
                credential: credential.clone(),
            })
            .collect()
    }

    fn handle_lookup(
        &mut self,
        peer: SocketAddr,
        session_string: &str,
        now: Instant,
    ) -> Vec<Delivery> {
        if !self.limiter.check(peer.ip(), RateEvent::Lookup, now) {
            Metrics::inc(&self.metrics.rate_limited_total);
            return error(ErrorCode::RateLimited, "too many lookups");
        }
        let info = match self.registry.find_by_string(session_string) {
            Some(e) => SessionInfo {
                found: true,
                session_id: e.session_id,
                participant_count: e.participants.len() as u8,
                max_participants: e.max_participants,
                capabilities: e.capabilities,
                has_password: e.has_password(),
                session_type: e.session_type,
            },
            None => SessionInfo {
                found: false,
                session_id: [0; 16],
                participant_count: 0,
                max_participants: 0,
                capabilities: 0,
                has_password: false,
                session_type: SessionType::DirectTcp,
            },
        };
        vec![Delivery::Reply(AcdsMessage::SessionInfo(info))]
    }

    fn handle_join(
        &mut self,
        peer: SocketAddr,
        membership: &mut Option<Membership>,
        req: SessionJoin,
        now: Instant,
    ) -> Vec<Delivery> {
        let reject = |metrics: &Metrics, code: ErrorCode, message: String| {
            Metrics::inc(&metrics.join_rejections_total);
            vec![Delivery::Reply(AcdsMessage::SessionJoined(
                SessionJoined::failure(code, message),
            ))]
        };

        if !self.limiter.check(peer.ip(), RateEvent::Join, now) {
            Metrics::inc(&self.metrics.rate_limited_total);
            return reject(&self.metrics, ErrorCode::RateLimited, "too many joins".into());
        }
        if membership.is_some() {
            return reject(&self.metrics, ErrorCode::InvalidParam, "already in a session".into());
        }
        if let Err(e) = auth::verify_join(
            &req,
            self.config.require_server_identity,
            identity::unix_timestamp(),
        ) {
            warn!("Rejected join from {}: {}", peer, e);
            return reject(&self.metrics, ErrorCode::InvalidSignature, e.to_string());
        }

        let password = if req.has_password {
            req.password.as_deref()
        } else {
            None
        };
        let (session_id, participant_id, password_verified) =
            match self.registry.join(&req.session_string, password) {
                Ok(v) => v,
                Err(code) => {
                    debug!("Join of '{}' from {} refused: {}", req.session_string, peer, code);
                    return reject(&self.metrics, code, code.to_string());
                }
            };

        let Some(entry) = self.registry.get(&session_id) else {
            return reject(&self.metrics, ErrorCode::Internal, "session vanished".into());
        };

        let mut joined = SessionJoined {
            success: true,
            error_code: ErrorCode::None,
            error_message: String::new(),
            participant_id,
            session_id,
            initiator_id: entry.initiator_id,
            host_established: entry.host_established(),
            server_address: String::new(),
            server_port: 0,
            session_type: SessionType::default(),
            turn_username: String::new(),
            turn_password: String::new(),
        };

        if password_verified || entry.expose_ip_publicly {
            joined.server_address = entry.host_address.clone();
            joined.server_port = entry.host_port;
            joined.session_type = entry.session_type;
            if entry.session_type == SessionType::WebRtc {
                if let Some(secret) = &self.config.turn_secret {
                    let (user, pass) = auth::turn_credentials(
                        secret,
                        &session_id,
                        identity::unix_timestamp(),
                        self.config.turn_credential_ttl_secs,
                    );
                    joined.turn_username = user;
                    joined.turn_password = pass;
                }
            }
        } else if entry.host_established() {
            debug!(
                "Withholding host address of '{}' from {}",
                entry.session_string, peer
            );
        }

        let m = Membership {
            session_id,
            participant_id,
        };
        *membership = Some(m);
        Metrics::inc(&self.metrics.joins_total);

        vec![
            Delivery::Reply(AcdsMessage::SessionJoined(joined)),
            Delivery::to_others(
                &m,
                AcdsMessage::ParticipantJoined {
                    session_id,
                    participant_id,
                },
            ),
        ]
    }

    // ========================================================================
    // Membership
    // ========================================================================

    fn check_member(
        &self,
        membership: &Option<Membership>,
        session_id: &SessionId,
    ) -> Option<Membership> {
        let m = (*membership)?;
        if &m.session_id != session_id {
            return None;
        }
        self.registry
            .get(session_id)
            .filter(|e| e.is_member(&m.participant_id))
            .map(|_| m)
    }

    fn relay(&self, from: &Membership, msg: AcdsMessage) -> Vec<Delivery> {
        Metrics::inc(&self.metrics.messages_relayed_total);
        vec![Delivery::to_others(from, msg)]
    }

    fn leave(&mut self, m: Membership) -> Vec<Delivery> {
        if self.registry.get(&m.session_id).is_none() {
            return Vec::new();
        }
        let removed = self.registry.leave(&m.session_id, &m.participant_id);
        self.update_session_gauge();
        if removed {
            return Vec::new();
        }
        vec![Delivery::to_others(
            &m,
            AcdsMessage::ParticipantLeft {
                session_id: m.session_id,
                participant_id: m.participant_id,
            },
        )]
    }

    fn update_session_gauge(&self) {
        self.metrics
            .active_sessions
            .store(self.registry.len() as u64, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_core::identity::Identity;
    use session_core::nat::ConnectionType;
    use session_core::protocol::HostAnnouncement;
    use std::sync::atomic::Ordering;

    fn addr(last: u8) -> SocketAddr {
        format!("198.51.100.{}:40000", last).parse().unwrap()
    }

    fn signaling() -> Signaling {
        Signaling::new(ServerConfig::default(), Arc::new(Metrics::new()))
    }

    fn create(sig: &mut Signaling, req: SessionCreate) -> (Membership, SessionCreated) {
        let mut m = None;
        let out = sig.handle(addr(1), &mut m, AcdsMessage::SessionCreate(req), Instant::now());
        match out.as_slice() {
            [Delivery::Reply(AcdsMessage::SessionCreated(c))] => (m.unwrap(), c.clone()),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn basic_create() -> SessionCreate {
        SessionCreate {
            capabilities: 3,
            max_participants: 4,
            ..Default::default()
        }
    }

    fn join(
        sig: &mut Signaling,
        from: u8,
        session_string: &str,
        password: Option<&str>,
    ) -> (Option<Membership>, Vec<Delivery>) {
        let mut m = None;
        let out = sig.handle(
            addr(from),
            &mut m,
            AcdsMessage::SessionJoin(SessionJoin {
                session_string: session_string.to_string(),
                has_password: password.is_some(),
                password: password.map(str::to_string),
                ..Default::default()
            }),
            Instant::now(),
        );
        (m, out)
    }

    fn joined(out: &[Delivery]) -> SessionJoined {
        match out.first() {
            Some(Delivery::Reply(AcdsMessage::SessionJoined(j))) => j.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_create_returns_stun_servers() {
        let mut sig = signaling();
        let (m, created) = create(&mut sig, basic_create());
        assert_eq!(m.session_id, created.session_id);
        assert_eq!(m.participant_id, created.participant_id);
        assert_eq!(created.stun_servers, ServerConfig::default().stun_servers);
        assert!(created.turn_servers.is_empty());
        assert_eq!(sig.metrics.sessions_created_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_create_rejects_bad_params() {
        let mut sig = signaling();
        let mut m = None;
        let req = SessionCreate {
            has_password: true,
            ..basic_create()
        };
        let out = sig.handle(addr(1), &mut m, AcdsMessage::SessionCreate(req), Instant::now());
        assert!(matches!(
            out.as_slice(),
            [Delivery::Reply(AcdsMessage::Error { code: ErrorCode::InvalidParam, .. })]
        ));
        assert!(m.is_none());
    }

    #[test]
    fn test_create_requires_identity_when_configured() {
        let config = ServerConfig {
            require_server_identity: true,
            ..Default::default()
        };
        let mut sig = Signaling::new(config, Arc::new(Metrics::new()));
        let mut m = None;
        let out = sig.handle(
            addr(1),
            &mut m,
            AcdsMessage::SessionCreate(basic_create()),
            Instant::now(),
        );
        assert!(matches!(
            out.as_slice(),
            [Delivery::Reply(AcdsMessage::Error { code: ErrorCode::InvalidSignature, .. })]
        ));

        let id = Identity::generate().unwrap();
        let ts = identity::unix_timestamp();
        let mut req = basic_create();
        req.identity_pubkey = Some(id.public_key());
        req.timestamp = ts;
        req.signature = id.sign(&identity::create_signing_payload(ts, 3, 4)).to_vec();
        create(&mut sig, req);
    }

    #[test]
    fn test_join_hides_address_without_password() {
        let mut sig = signaling();
        let req = SessionCreate {
            server_address: "203.0.113.5".to_string(),
            server_port: 27224,
            session_type: SessionType::WebRtc,
            ..basic_create()
        };
        let (creator, created) = create(&mut sig, req);

        let (m, out) = join(&mut sig, 2, &created.session_string, None);
        let j = joined(&out);
        assert!(j.success);
        assert!(j.host_established);
        assert!(!j.reveals_host());
        // The session type is withheld along with the address
        assert_eq!(j.session_type, SessionType::default());
        assert!(j.turn_username.is_empty());
        assert_eq!(j.initiator_id, creator.participant_id);
        assert!(out.contains(&Delivery::Session {
            session_id: created.session_id,
            except: Some(j.participant_id),
            msg: AcdsMessage::ParticipantJoined {
                session_id: created.session_id,
                participant_id: j.participant_id,
            },
        }));
        assert_eq!(m.unwrap().participant_id, j.participant_id);
    }

    #[test]
    fn test_join_reveals_address_with_password() {
        let mut sig = signaling();
        let req = SessionCreate {
            has_password: true,
            password: Some("open sesame".to_string()),
            server_port: 27224,
            ..basic_create()
        };
        let (_, created) = create(&mut sig, req);

        let (m, out) = join(&mut sig, 2, &created.session_string, Some("wrong"));
        assert!(m.is_none());
        assert_eq!(joined(&out).error_code, ErrorCode::InvalidPassword);

        let (_, out) = join(&mut sig, 2, &created.session_string, Some("open sesame"));
        let j = joined(&out);
        assert!(j.success);
        // Filled in from the creator's observed address
        assert_eq!(j.server_address, "198.51.100.1");
        assert_eq!(j.server_port, 27224);
        assert_eq!(sig.metrics.join_rejections_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_join_expose_ip_publicly() {
        let mut sig = signaling();
        let req = SessionCreate {
            expose_ip_publicly: true,
            server_address: "203.0.113.5".to_string(),
            server_port: 27224,
            session_type: SessionType::WebRtc,
            ..basic_create()
        };
        let (_, created) = create(&mut sig, req);
        let (_, out) = join(&mut sig, 2, &created.session_string, None);
        let j = joined(&out);
        assert_eq!(j.server_address, "203.0.113.5");
        // No TURN secret configured
        assert!(j.turn_username.is_empty());
    }

    #[test]
    fn test_lookup_never_reveals_address() {
        let mut sig = signaling();
        let (_, created) = create(&mut sig, basic_create());
        let mut m = None;
        let out = sig.handle(
            addr(3),
            &mut m,
            AcdsMessage::SessionLookup {
                session_string: created.session_string.clone(),
            },
            Instant::now(),
        );
        match out.as_slice() {
            [Delivery::Reply(AcdsMessage::SessionInfo(info))] => {
                assert!(info.found);
                assert_eq!(info.participant_count, 1);
                assert_eq!(info.max_participants, 4);
            }
            other => panic!("unexpected {:?}", other),
        }

        let out = sig.handle(
            addr(3),
            &mut m,
            AcdsMessage::SessionLookup {
                session_string: "no-such-session".to_string(),
            },
            Instant::now(),
        );
        assert!(matches!(
            out.as_slice(),
            [Delivery::Reply(AcdsMessage::SessionInfo(SessionInfo { found: false, .. }))]
        ));
    }

    #[test]
    fn test_join_rate_limited() {
        let config = ServerConfig {
            rate_limits: crate::config::RateLimits {
                join: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut sig = Signaling::new(config, Arc::new(Metrics::new()));
        for _ in 0..2 {
            let (_, out) = join(&mut sig, 9, "calm-lake-tree", None);
            assert_eq!(joined(&out).error_code, ErrorCode::SessionNotFound);
        }
        let (_, out) = join(&mut sig, 9, "calm-lake-tree", None);
        assert_eq!(joined(&out).error_code, ErrorCode::RateLimited);
        assert_eq!(sig.metrics.rate_limited_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_relay_requires_membership() {
        let mut sig = signaling();
        let (creator, created) = create(&mut sig, basic_create());
        let request = AcdsMessage::ElectionRequest {
            session_id: created.session_id,
            host_id: creator.participant_id,
            round: 1,
        };

        let mut stranger = None;
        assert!(sig
            .handle(addr(7), &mut stranger, request.clone(), Instant::now())
            .is_empty());

        let mut m = Some(creator);
        let out = sig.handle(addr(1), &mut m, request.clone(), Instant::now());
        assert_eq!(
            out,
            vec![Delivery::Session {
                session_id: created.session_id,
                except: Some(creator.participant_id),
                msg: request,
            }]
        );
    }

    #[test]
    fn test_host_announcement_becomes_designation() {
        let mut sig = signaling();
        let (creator, created) = create(&mut sig, basic_create());
        let ann = HostAnnouncement {
            session_id: created.session_id,
            host_id: creator.participant_id,
            address: "203.0.113.5".to_string(),
            port: 27224,
            connection_type: ConnectionType::DirectPublic,
        };
        let mut m = Some(creator);
        let out = sig.handle(
            addr(1),
            &mut m,
            AcdsMessage::HostAnnouncement(ann.clone()),
            Instant::now(),
        );
        assert!(matches!(
            out.as_slice(),
            [Delivery::Session { msg: AcdsMessage::HostDesignated(a), .. }] if a == &ann
        ));
        assert!(sig
            .registry()
            .get(&created.session_id)
            .unwrap()
            .host_established());
    }

    #[test]
    fn test_leave_notifies_and_last_leave_removes() {
        let mut sig = signaling();
        let (creator, created) = create(&mut sig, basic_create());
        let (peer, _) = join(&mut sig, 2, &created.session_string, None);
        let peer = peer.unwrap();

        let mut m = Some(peer);
        let out = sig.handle(
            addr(2),
            &mut m,
            AcdsMessage::SessionLeave {
                session_id: peer.session_id,
                participant_id: peer.participant_id,
            },
            Instant::now(),
        );
        assert!(m.is_none());
        assert!(matches!(
            out.as_slice(),
            [Delivery::Session { msg: AcdsMessage::ParticipantLeft { .. }, .. }]
        ));

        assert!(sig.disconnect(creator).is_empty());
        assert!(sig.registry().is_empty());
        assert_eq!(sig.metrics.active_sessions.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_host_lost_starts_migration_once() {
        let mut sig = signaling();
        let (creator, created) = create(&mut sig, basic_create());
        let (peer, _) = join(&mut sig, 2, &created.session_string, None);
        let lost = session_core::protocol::HostLost {
            session_id: created.session_id,
            participant_id: peer.unwrap().participant_id,
            last_host_id: creator.participant_id,
            reason: 1,
            disconnect_time_ms: 0,
        };
        let mut m = peer;
        for _ in 0..2 {
            let msg = AcdsMessage::HostLost(lost.clone());
            let out = sig.handle(addr(2), &mut m, msg, Instant::now());
            assert_eq!(out.len(), 1);
        }
        assert_eq!(sig.metrics.migrations_total.load(Ordering::Relaxed), 1);
    }
}
