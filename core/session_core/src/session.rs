//! Discovery session lifecycle
//!
//! `DiscoverySession` drives one peer through session formation and keeps
//! the session alive across host loss:
//!
//! ```text
//! Init ─> ConnectingDiscovery ─┬─> CreatingSession ─> WaitingPeer ─┐
//!                              └─> JoiningSession ─────────────────┤
//!                                                                  ▼
//!                                   ┌─────────────── Negotiating ──┐
//!                                   ▼                              ▼
//!                              StartingHost                 ConnectingHost
//!                                   └───────────> Active <─────────┘
//!                                                   │ host lost
//!                                                   ▼
//!                                               Migrating ─> Active | Failed
//! ```
//!
//! `process` is the single I/O driver: it pumps the ACDS link, advances the
//! state machine and polls the media role. Nothing in it blocks longer than
//! the timeout passed in, except NAT probing on entering negotiation.
//!
//! Failover never re-negotiates. The host runs a ring election every few
//! minutes (and whenever someone joins) so every participant already knows
//! who takes over and where to reach them.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::acds_client::{await_reply, AcdsClient, DiscoveryLink};
use crate::election::{ElectionRound, RingConsensus, DEFAULT_COLLECT_WINDOW, ELECTION_INTERVAL};
use crate::error::{Error, Result};
use crate::host::{
    HostConfig, HostMedia, HostObserver, MemoryFeed, SessionHost, DEFAULT_FRAME_HEIGHT,
    DEFAULT_FRAME_WIDTH, DEFAULT_HOST_PORT,
};
use crate::identity::{self, Identity};
use crate::media::CAPTURE_FRAME_SAMPLES;
use crate::migration::{
    MigrationContext, MIGRATION_TIMEOUT, REASON_CONNECTION_RESET, REASON_TIMEOUT,
};
use crate::nat::{ConnectionType, HostEndpoint, NatQuality, NetworkQualityWire};
use crate::negotiate::{NegotiationContext, NegotiationState};
use crate::participant::{
    AudioSource, HostEvent, ParticipantConfig, SessionParticipant, TestPatternSource, ToneSource,
    VideoSource,
};
use crate::probe::{NatProber, QualityProbe, DEFAULT_STUN_SERVER};
use crate::protocol::{
    short_id, AcdsMessage, FutureHostElected, HostAnnouncement, HostLost, ParticipantId,
    SessionCreate, SessionId, SessionJoin, SessionType, DEFAULT_ACDS_PORT,
};
use crate::settings::SessionSettings;

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_ACDS_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WAITING_TIMEOUT: Duration = Duration::from_secs(60);

const ACDS_PING_INTERVAL: Duration = Duration::from_secs(10);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const HOST_CAPTURE_TICK: Duration = Duration::from_millis(20);
const FRAME_QUEUE_DEPTH: usize = 4;
const NO_ID: [u8; 16] = [0; 16];

// ============================================================================
// State and configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Init,
    ConnectingDiscovery,
    CreatingSession,
    JoiningSession,
    WaitingPeer,
    Negotiating,
    StartingHost,
    ConnectingHost,
    Active,
    Migrating,
    Failed,
    Ended,
}

impl DiscoveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DiscoveryState::Failed | DiscoveryState::Ended)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub acds_address: String,
    pub acds_port: u16,
    pub acds_timeout: Duration,

    /// Join this session; create one when `None`
    pub session_string: Option<String>,
    pub password: Option<String>,
    pub expose_ip_publicly: bool,
    pub max_participants: u8,
    pub capabilities: u8,

    pub host_bind_address: String,
    pub host_port: u16,
    pub stun_server: String,
    pub enable_video: bool,
    pub enable_audio: bool,

    /// How long negotiation waits for the peer's quality; `None` waits forever
    pub waiting_timeout: Option<Duration>,
    pub election_interval: Duration,
    pub election_window: Duration,
    pub migration_timeout: Duration,

    /// Sign create/join requests when set
    pub identity: Option<Arc<Identity>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            acds_address: "127.0.0.1".to_string(),
            acds_port: DEFAULT_ACDS_PORT,
            acds_timeout: DEFAULT_ACDS_TIMEOUT,
            session_string: None,
            password: None,
            expose_ip_publicly: false,
            max_participants: 8,
            capabilities: crate::protocol::CAP_VIDEO | crate::protocol::CAP_AUDIO,
            host_bind_address: "0.0.0.0".to_string(),
            host_port: DEFAULT_HOST_PORT,
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            enable_video: true,
            enable_audio: true,
            waiting_timeout: Some(DEFAULT_WAITING_TIMEOUT),
            election_interval: ELECTION_INTERVAL,
            election_window: DEFAULT_COLLECT_WINDOW,
            migration_timeout: MIGRATION_TIMEOUT,
            identity: None,
        }
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// User-visible session callbacks, all invoked from `start`/`process`/`stop`
pub trait SessionEvents: Send {
    fn on_state_change(&mut self, _old: DiscoveryState, _new: DiscoveryState) {}
    fn on_session_ready(&mut self, _session_string: &str) {}
    fn on_role(&mut self, _is_host: bool) {}
    fn on_frame(&mut self, _text: &str) {}
    fn on_error(&mut self, _error: &Error) {}
}

struct NoEvents;

impl SessionEvents for NoEvents {}

/// Supplies the media pieces each role needs
pub trait MediaFactory: Send {
    fn host_media(&mut self) -> HostMedia {
        HostMedia::default()
    }

    fn video_source(&mut self, width: u32, height: u32) -> Box<dyn VideoSource> {
        Box::new(TestPatternSource::new(width, height))
    }

    fn audio_source(&mut self) -> Box<dyn AudioSource> {
        Box::new(ToneSource::new(440.0, 0.1))
    }
}

/// Synthetic capture with the built-in renderer and codec
#[derive(Debug, Default)]
pub struct DefaultMedia;

impl MediaFactory for DefaultMedia {}

// ============================================================================
// Roles
// ============================================================================

/// Forwards mixed frames from the host's render thread to the session thread
struct FrameForwarder {
    tx: Mutex<SyncSender<String>>,
}

impl HostObserver for FrameForwarder {
    fn on_frame(&self, text: &str) {
        if let Ok(tx) = self.tx.lock() {
            // A full queue means nobody is polling; drop the frame
            let _ = tx.try_send(text.to_string());
        }
    }
}

/// Feeds the host's own capture into its memory participant
struct HostCapture {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl HostCapture {
    fn spawn(
        feed: MemoryFeed,
        mut video: Option<Box<dyn VideoSource>>,
        mut audio: Option<Box<dyn AudioSource>>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::Builder::new()
            .name("host-capture".to_string())
            .spawn(move || {
                let mut chunk = vec![0.0f32; CAPTURE_FRAME_SAMPLES];
                let mut tick: u64 = 0;
                let mut next = Instant::now();

                while flag.load(Ordering::SeqCst) {
                    if let Some(src) = audio.as_mut() {
                        match src.read(&mut chunk) {
                            Ok(n) => {
                                if let Err(e) = feed.inject_audio(&chunk[..n]) {
                                    debug!("Host audio inject failed: {}", e);
                                }
                            }
                            Err(e) => debug!("Host audio source error: {}", e),
                        }
                    }

                    // Video at half the audio cadence
                    if tick % 2 == 0 {
                        if let Some(src) = video.as_mut() {
                            match src.next_frame() {
                                Ok(Some(img)) => {
                                    if let Err(e) =
                                        feed.inject_frame(img.width, img.height, img.pixels)
                                    {
                                        debug!("Host frame inject failed: {}", e);
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => debug!("Host video source error: {}", e),
                            }
                        }
                    }
                    tick += 1;

                    next += HOST_CAPTURE_TICK;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
            })
            .map_err(|e| Error::Thread(e.to_string()))?;

        Ok(Self { running, handle })
    }

    fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        if self.handle.join().is_err() {
            warn!("Host capture thread panicked");
        }
    }
}

pub struct HostRole {
    host: SessionHost,
    capture: Option<HostCapture>,
    frames: Receiver<String>,
}

impl HostRole {
    pub fn host(&self) -> &SessionHost {
        &self.host
    }
}

/// At most one media runtime at a time
pub enum Role {
    None,
    Host(HostRole),
    Participant(SessionParticipant),
}

impl Role {
    fn teardown(&mut self) {
        match std::mem::replace(self, Role::None) {
            Role::Host(mut h) => {
                if let Some(capture) = h.capture.take() {
                    capture.stop();
                }
                h.host.stop();
            }
            Role::Participant(mut p) => p.stop(),
            Role::None => {}
        }
    }
}

// ============================================================================
// DiscoverySession
// ============================================================================

pub struct DiscoverySession {
    config: SessionConfig,
    state: DiscoveryState,

    link: Option<Box<dyn DiscoveryLink>>,
    backlog: VecDeque<AcdsMessage>,
    prober: Box<dyn QualityProbe>,
    media: Box<dyn MediaFactory>,
    events: Box<dyn SessionEvents>,

    session_id: SessionId,
    participant_id: ParticipantId,
    initiator_id: ParticipantId,
    session_string: String,
    in_session: bool,
    is_initiator: bool,
    is_host: bool,
    late_joiner: bool,
    reached_active: bool,

    negotiation: Option<NegotiationContext>,
    latest_quality: Option<NatQuality>,

    peers: HashSet<ParticipantId>,
    host_id: Option<ParticipantId>,
    host_address: String,
    host_port: u16,
    host_connection_type: ConnectionType,
    last_connect_attempt: Option<Instant>,

    ring: RingConsensus,
    election: Option<ElectionRound>,
    election_round: u64,
    next_election: Option<Instant>,
    migration: MigrationContext,

    role: Role,
    settings: SessionSettings,

    acds_ping_sent: Option<Instant>,
    next_acds_ping: Option<Instant>,
    discovery_rtt: Option<Duration>,
}

impl DiscoverySession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: DiscoveryState::Init,
            link: None,
            backlog: VecDeque::new(),
            prober: Box::new(NatProber::default()),
            media: Box::new(DefaultMedia),
            events: Box::new(NoEvents),
            session_id: NO_ID,
            participant_id: NO_ID,
            initiator_id: NO_ID,
            session_string: String::new(),
            in_session: false,
            is_initiator: false,
            is_host: false,
            late_joiner: false,
            reached_active: false,
            negotiation: None,
            latest_quality: None,
            peers: HashSet::new(),
            host_id: None,
            host_address: String::new(),
            host_port: 0,
            host_connection_type: ConnectionType::default(),
            last_connect_attempt: None,
            ring: RingConsensus::default(),
            election: None,
            election_round: 0,
            next_election: None,
            migration: MigrationContext::default(),
            role: Role::None,
            settings: SessionSettings::default(),
            acds_ping_sent: None,
            next_acds_ping: None,
            discovery_rtt: None,
        }
    }

    /// Use an existing link instead of dialing ACDS in `start`
    pub fn with_link(mut self, link: Box<dyn DiscoveryLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_prober(mut self, prober: Box<dyn QualityProbe>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_media(mut self, media: Box<dyn MediaFactory>) -> Self {
        self.media = media;
        self
    }

    pub fn with_events(mut self, events: Box<dyn SessionEvents>) -> Self {
        self.events = events;
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn initiator_id(&self) -> ParticipantId {
        self.initiator_id
    }

    pub fn session_string(&self) -> &str {
        &self.session_string
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn host_endpoint(&self) -> (&str, u16, ConnectionType) {
        (&self.host_address, self.host_port, self.host_connection_type)
    }

    pub fn negotiation(&self) -> Option<&NegotiationContext> {
        self.negotiation.as_ref()
    }

    pub fn ring(&self) -> &RingConsensus {
        &self.ring
    }

    pub fn migration(&self) -> &MigrationContext {
        &self.migration
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn host(&self) -> Option<&SessionHost> {
        match &self.role {
            Role::Host(h) => Some(&h.host),
            _ => None,
        }
    }

    pub fn participant(&self) -> Option<&SessionParticipant> {
        match &self.role {
            Role::Participant(p) => Some(p),
            _ => None,
        }
    }

    pub fn discovery_rtt(&self) -> Option<Duration> {
        self.discovery_rtt
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect to ACDS, then create or join
    pub fn start(&mut self) -> Result<()> {
        if self.state != DiscoveryState::Init {
            return Err(Error::InvalidState(format!(
                "session already started ({:?})",
                self.state
            )));
        }

        self.set_state(DiscoveryState::ConnectingDiscovery);
        if self.link.is_none() {
            match AcdsClient::connect(
                &self.config.acds_address,
                self.config.acds_port,
                self.config.acds_timeout,
            ) {
                Ok(client) => self.link = Some(Box::new(client)),
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            }
        }

        let result = match self.config.session_string.clone() {
            Some(s) => self.join(&s),
            None => self.create(),
        };
        if let Err(e) = result {
            self.fail(&e);
            return Err(e);
        }

        self.acds_keepalive(Instant::now())
    }

    fn create(&mut self) -> Result<()> {
        self.set_state(DiscoveryState::CreatingSession);

        let mut req = SessionCreate {
            session_type: SessionType::DirectTcp,
            capabilities: self.config.capabilities,
            max_participants: self.config.max_participants,
            has_password: self.config.password.is_some(),
            password: self.config.password.clone(),
            expose_ip_publicly: self.config.expose_ip_publicly,
            ..Default::default()
        };
        if let Some(id) = &self.config.identity {
            let ts = identity::unix_timestamp();
            req.identity_pubkey = Some(id.public_key());
            req.timestamp = ts;
            req.signature = id
                .sign(&identity::create_signing_payload(
                    ts,
                    req.capabilities,
                    req.max_participants,
                ))
                .to_vec();
        }

        let link = self
            .link
            .as_deref_mut()
            .ok_or_else(|| Error::NetworkConnect("discovery link down".to_string()))?;
        link.send(&AcdsMessage::SessionCreate(req))?;
        let reply = await_reply(link, &mut self.backlog, self.config.acds_timeout, |m| {
            matches!(m, AcdsMessage::SessionCreated(_))
        })?;
        let AcdsMessage::SessionCreated(created) = reply else {
            return Err(Error::NetworkProtocol("unexpected create reply".to_string()));
        };

        self.session_id = created.session_id;
        self.participant_id = created.participant_id;
        self.initiator_id = created.participant_id;
        self.session_string = created.session_string;
        self.in_session = true;
        self.is_initiator = true;
        self.negotiation = Some(NegotiationContext::new(
            self.session_id,
            self.participant_id,
            true,
            self.config.waiting_timeout,
        ));

        info!(
            "Created session '{}' as {}",
            self.session_string,
            short_id(&self.participant_id)
        );
        let s = self.session_string.clone();
        self.events.on_session_ready(&s);
        self.set_state(DiscoveryState::WaitingPeer);
        Ok(())
    }

    fn join(&mut self, session_string: &str) -> Result<()> {
        self.set_state(DiscoveryState::JoiningSession);

        let mut req = SessionJoin {
            session_string: session_string.to_string(),
            has_password: self.config.password.is_some(),
            password: self.config.password.clone(),
            ..Default::default()
        };
        if let Some(id) = &self.config.identity {
            let ts = identity::unix_timestamp();
            req.identity_pubkey = Some(id.public_key());
            req.timestamp = ts;
            req.signature = id
                .sign(&identity::join_signing_payload(ts, session_string))
                .to_vec();
        }

        let link = self
            .link
            .as_deref_mut()
            .ok_or_else(|| Error::NetworkConnect("discovery link down".to_string()))?;
        link.send(&AcdsMessage::SessionJoin(req))?;
        let reply = await_reply(link, &mut self.backlog, self.config.acds_timeout, |m| {
            matches!(m, AcdsMessage::SessionJoined(_))
        })?;
        let AcdsMessage::SessionJoined(joined) = reply else {
            return Err(Error::NetworkProtocol("unexpected join reply".to_string()));
        };

        if !joined.success {
            return Err(Error::Acds {
                code: joined.error_code,
                message: joined.error_message,
            });
        }

        self.session_id = joined.session_id;
        self.participant_id = joined.participant_id;
        self.initiator_id = joined.initiator_id;
        self.session_string = session_string.to_string();
        self.in_session = true;
        self.is_initiator = false;
        self.negotiation = Some(NegotiationContext::new(
            self.session_id,
            self.participant_id,
            false,
            self.config.waiting_timeout,
        ));

        info!(
            "Joined session '{}' as {}",
            self.session_string,
            short_id(&self.participant_id)
        );
        let s = self.session_string.clone();
        self.events.on_session_ready(&s);

        if joined.reveals_host() {
            // Measured once here; election replies reuse it
            self.fresh_quality();
            self.host_address = joined.server_address;
            self.host_port = joined.server_port;
            self.host_connection_type = ConnectionType::DirectPublic;
            self.set_state(DiscoveryState::ConnectingHost);
        } else {
            // A running host without a revealed address: negotiate against
            // the quality it rebroadcasts, but always defer to it
            self.late_joiner = joined.host_established;
            self.set_state(DiscoveryState::Negotiating);
        }
        Ok(())
    }

    /// Drive the session for at most `timeout`
    pub fn process(&mut self, timeout: Duration) -> Result<()> {
        match self.state {
            DiscoveryState::Init => {
                return Err(Error::InvalidState("session not started".to_string()))
            }
            s if s.is_terminal() => return Ok(()),
            _ => {}
        }

        let started = Instant::now();

        self.pump_link(Duration::ZERO)?;
        if self.state.is_terminal() {
            return Ok(());
        }

        self.step(Instant::now())?;
        if self.state.is_terminal() {
            return Ok(());
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        if matches!(self.role, Role::Participant(_)) {
            self.pump_role(remaining);
            self.pump_link(Duration::ZERO)?;
        } else {
            self.pump_link(remaining)?;
            self.pump_role(Duration::ZERO);
        }

        if self.state.is_terminal() {
            return Ok(());
        }
        self.acds_keepalive(Instant::now())
    }

    /// Leave the session and tear everything down
    pub fn stop(&mut self) {
        if self.state == DiscoveryState::Ended {
            return;
        }
        self.role.teardown();
        self.election = None;

        if let Some(mut link) = self.link.take() {
            if self.in_session {
                let _ = link.send(&AcdsMessage::SessionLeave {
                    session_id: self.session_id,
                    participant_id: self.participant_id,
                });
            }
            link.close();
        }
        self.in_session = false;
        self.set_state(DiscoveryState::Ended);
    }

    // ------------------------------------------------------------------------
    // Internals: state plumbing
    // ------------------------------------------------------------------------

    fn set_state(&mut self, new: DiscoveryState) {
        let old = self.state;
        if old == new {
            return;
        }
        info!("Session state: {:?} -> {:?}", old, new);
        self.state = new;
        self.events.on_state_change(old, new);
    }

    fn fail(&mut self, err: &Error) {
        if self.state.is_terminal() {
            return;
        }
        error!("Session failed: {}", err);
        self.events.on_error(err);
        self.role.teardown();
        self.election = None;
        if let Some(ctx) = self.negotiation.as_mut() {
            ctx.fail(err.to_string());
        }
        self.set_state(DiscoveryState::Failed);
    }

    fn enter_active(&mut self) {
        self.reached_active = true;
        self.set_state(DiscoveryState::Active);
    }

    /// Link errors are fatal until the session is up, then only degrade it
    fn on_link_error(&mut self, e: Error) -> Result<()> {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        if self.reached_active {
            warn!("Discovery link lost, continuing without it: {}", e);
            self.events.on_error(&e);
            Ok(())
        } else {
            self.fail(&e);
            Err(e)
        }
    }

    fn send_acds(&mut self, msg: AcdsMessage) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            debug!("No discovery link, dropping {}", msg.kind());
            return Ok(());
        };
        match link.send(&msg) {
            Ok(()) => Ok(()),
            Err(e) => self.on_link_error(e),
        }
    }

    fn acds_keepalive(&mut self, now: Instant) -> Result<()> {
        if self.link.is_none() {
            return Ok(());
        }
        if self.next_acds_ping.map_or(true, |t| now >= t) {
            self.acds_ping_sent = Some(now);
            self.next_acds_ping = Some(now + ACDS_PING_INTERVAL);
            self.send_acds(AcdsMessage::Ping)?;
        }
        Ok(())
    }

    fn pump_link(&mut self, wait: Duration) -> Result<()> {
        while let Some(msg) = self.backlog.pop_front() {
            self.handle_message(msg)?;
        }

        let mut wait = wait;
        loop {
            let Some(link) = self.link.as_mut() else {
                if !wait.is_zero() {
                    thread::sleep(wait);
                }
                return Ok(());
            };
            match link.recv(wait) {
                Ok(Some(msg)) => {
                    self.handle_message(msg)?;
                    wait = Duration::ZERO;
                }
                Ok(None) => return Ok(()),
                Err(e) => return self.on_link_error(e),
            }
            if self.state.is_terminal() {
                return Ok(());
            }
        }
    }

    fn pump_role(&mut self, wait: Duration) {
        let mut latest = None;
        match &mut self.role {
            Role::Participant(p) => match p.poll(wait) {
                Ok(events) => {
                    for ev in events {
                        match ev {
                            HostEvent::Frame(text) => latest = Some(text),
                            HostEvent::Settings(s) => self.settings = s,
                            HostEvent::Welcome(_) | HostEvent::Audio(_) => {}
                        }
                    }
                }
                Err(e) => debug!("Participant poll failed: {}", e),
            },
            Role::Host(h) => {
                while let Ok(text) = h.frames.try_recv() {
                    latest = Some(text);
                }
            }
            Role::None => {}
        }
        if let Some(text) = latest {
            self.events.on_frame(&text);
        }
    }

    // ------------------------------------------------------------------------
    // Internals: inbound ACDS messages
    // ------------------------------------------------------------------------

    fn handle_message(&mut self, msg: AcdsMessage) -> Result<()> {
        if let Some(sid) = msg.session_id() {
            if self.in_session && sid != self.session_id {
                debug!("Ignoring {} for another session", msg.kind());
                return Ok(());
            }
        }

        match msg {
            AcdsMessage::ParticipantJoined { participant_id, .. } => {
                self.on_participant_joined(participant_id)
            }
            AcdsMessage::ParticipantLeft { participant_id, .. } => {
                info!("Participant {} left", short_id(&participant_id));
                self.peers.remove(&participant_id);
                Ok(())
            }
            AcdsMessage::NetworkQuality(wire) => {
                self.on_network_quality(wire);
                Ok(())
            }
            AcdsMessage::ElectionRequest { host_id, round, .. } => {
                self.on_election_request(host_id, round)
            }
            AcdsMessage::FutureHostElected(elected) => {
                self.ring.store(&elected, &self.participant_id);
                Ok(())
            }
            AcdsMessage::HostDesignated(ann) | AcdsMessage::HostAnnouncement(ann) => {
                self.on_host_designated(ann);
                Ok(())
            }
            AcdsMessage::Pong => {
                if let Some(sent) = self.acds_ping_sent.take() {
                    let rtt = sent.elapsed();
                    debug!("Discovery RTT {} ms", rtt.as_millis());
                    self.discovery_rtt = Some(rtt);
                    self.prober.set_discovery_rtt(rtt);
                }
                Ok(())
            }
            AcdsMessage::Ping => self.send_acds(AcdsMessage::Pong),
            AcdsMessage::Error { code, message } => {
                let e = Error::Acds { code, message };
                warn!("Discovery service error: {}", e);
                self.events.on_error(&e);
                Ok(())
            }
            other => {
                debug!("Ignoring {} in {:?}", other.kind(), self.state);
                Ok(())
            }
        }
    }

    fn on_participant_joined(&mut self, participant_id: ParticipantId) -> Result<()> {
        info!("Participant {} joined", short_id(&participant_id));
        self.peers.insert(participant_id);
        match self.state {
            DiscoveryState::WaitingPeer => {
                self.set_state(DiscoveryState::Negotiating);
                Ok(())
            }
            DiscoveryState::Active if self.is_host => {
                // Late joiners negotiate against this snapshot
                if let Some(q) = self.latest_quality.clone() {
                    let wire = NetworkQualityWire::from_quality(
                        self.session_id,
                        self.participant_id,
                        0,
                        &q,
                    );
                    self.send_acds(AcdsMessage::NetworkQuality(wire))?;
                }
                if self.election.is_none() {
                    self.open_round(false)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_network_quality(&mut self, wire: NetworkQualityWire) {
        if wire.participant_id == self.participant_id {
            return;
        }
        self.peers.insert(wire.participant_id);

        if wire.round > 0 {
            if let Some(round) = self.election.as_mut() {
                if round.record(&wire) {
                    debug!(
                        "Election round {}: quality from {}",
                        wire.round,
                        short_id(&wire.participant_id)
                    );
                }
            }
            return;
        }

        if !matches!(
            self.state,
            DiscoveryState::WaitingPeer | DiscoveryState::Negotiating
        ) {
            return;
        }

        if let Some(ctx) = self.negotiation.as_mut() {
            if ctx.peer_quality().is_none() {
                if let Err(e) = ctx.receive_peer_quality(&wire) {
                    debug!("Peer quality not applied: {}", e);
                }
            }
        }
        if self.state == DiscoveryState::WaitingPeer {
            self.set_state(DiscoveryState::Negotiating);
        }
    }

    fn on_election_request(&mut self, host_id: ParticipantId, round: u64) -> Result<()> {
        if host_id == self.participant_id {
            return Ok(());
        }
        self.host_id = Some(host_id);

        // Re-probing here could outlast the host's collect window
        let quality = self.latest_quality.clone().unwrap_or_default();
        let wire =
            NetworkQualityWire::from_quality(self.session_id, self.participant_id, round, &quality);
        debug!("Answering election round {}", round);
        self.send_acds(AcdsMessage::NetworkQuality(wire))
    }

    fn on_host_designated(&mut self, ann: HostAnnouncement) {
        self.host_id = Some(ann.host_id);
        if ann.host_id == self.participant_id {
            return;
        }
        info!(
            "Host is {} at {}:{} ({:?})",
            short_id(&ann.host_id),
            ann.address,
            ann.port,
            ann.connection_type
        );
        self.host_address = ann.address;
        self.host_port = ann.port;
        self.host_connection_type = ann.connection_type;
    }

    /// Re-probe; fall back to the last good snapshot if probing fails
    fn fresh_quality(&mut self) -> NatQuality {
        match self
            .prober
            .detect_quality(&self.config.stun_server, self.config.host_port)
        {
            Ok(q) => {
                self.latest_quality = Some(q.clone());
                q
            }
            Err(e) => {
                warn!("Quality re-probe failed: {}", e);
                self.latest_quality.clone().unwrap_or_default()
            }
        }
    }

    // ------------------------------------------------------------------------
    // Internals: per-state work
    // ------------------------------------------------------------------------

    fn step(&mut self, now: Instant) -> Result<()> {
        match self.state {
            DiscoveryState::Negotiating => self.step_negotiation(now),
            DiscoveryState::StartingHost => self.become_host(),
            DiscoveryState::ConnectingHost | DiscoveryState::Migrating => {
                self.step_connecting(now)
            }
            DiscoveryState::Active => self.step_active(now),
            _ => Ok(()),
        }
    }

    fn step_negotiation(&mut self, now: Instant) -> Result<()> {
        let Some(ctx) = self.negotiation.as_mut() else {
            let e = Error::InvalidState("negotiating without a context".to_string());
            self.fail(&e);
            return Err(e);
        };

        if ctx.state() == NegotiationState::Init {
            if let Some(rtt) = self.discovery_rtt {
                self.prober.set_discovery_rtt(rtt);
            }
            let detected = ctx
                .start_detection(
                    self.prober.as_mut(),
                    &self.config.stun_server,
                    self.config.host_port,
                )
                .map(|()| (ctx.our_quality().clone(), ctx.our_wire(0)));
            match detected {
                Ok((quality, wire)) => {
                    self.latest_quality = Some(quality);
                    self.send_acds(AcdsMessage::NetworkQuality(wire))?;
                }
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            }
        }

        let Some(ctx) = self.negotiation.as_mut() else {
            return Ok(());
        };
        if ctx.check_timeout(now) {
            let reason = ctx
                .failure_reason()
                .unwrap_or("negotiation timed out")
                .to_string();
            let e = Error::InvalidState(reason);
            self.fail(&e);
            return Err(e);
        }
        if ctx.state() != NegotiationState::Comparing {
            return Ok(());
        }

        let decided = if self.late_joiner {
            ctx.accept_peer_as_host().map(|r| r.clone())
        } else {
            ctx.determine_result().map(|r| r.clone())
        };

        match decided {
            Ok(r) if r.we_are_host => {
                self.set_state(DiscoveryState::StartingHost);
                self.become_host()
            }
            Ok(r) => {
                self.host_address = r.host_address;
                self.host_port = r.host_port;
                self.host_connection_type = r.connection_type;
                self.last_connect_attempt = None;
                self.set_state(DiscoveryState::ConnectingHost);
                self.step_connecting(now)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn step_connecting(&mut self, now: Instant) -> Result<()> {
        if self.migration.timed_out(now, self.config.migration_timeout) {
            let e = Error::NetworkConnect(format!(
                "failover to {}:{} timed out",
                self.host_address, self.host_port
            ));
            self.fail(&e);
            return Err(e);
        }

        if let Some(last) = self.last_connect_attempt {
            if now.saturating_duration_since(last) < CONNECT_RETRY_INTERVAL {
                return Ok(());
            }
        }
        self.last_connect_attempt = Some(now);

        let (address, port) = (self.host_address.clone(), self.host_port);
        match self.connect_to_host(&address, port) {
            Ok(()) => {
                if self.migration.in_progress() {
                    self.migration.complete();
                    self.ring.clear();
                    info!("Failover to {}:{} complete", address, port);
                }
                self.enter_active();
                Ok(())
            }
            Err(e) => {
                debug!("Connect to host {}:{} failed, will retry: {}", address, port, e);
                Ok(())
            }
        }
    }

    fn step_active(&mut self, now: Instant) -> Result<()> {
        match &self.role {
            Role::Participant(p) => {
                if !p.is_host_alive() {
                    let reason = if p.connection_lost() {
                        REASON_CONNECTION_RESET
                    } else {
                        REASON_TIMEOUT
                    };
                    return self.handle_host_disconnect(reason);
                }
                Ok(())
            }
            Role::Host(_) => {
                let due = self.election.as_ref().map(|r| r.is_due(now));
                match due {
                    Some(true) => self.finish_election(),
                    Some(false) => Ok(()),
                    None if self.next_election.map_or(true, |t| now >= t) => {
                        self.start_ring_round()
                    }
                    None => Ok(()),
                }
            }
            Role::None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Roles
    // ------------------------------------------------------------------------

    /// Start hosting, announce it and open an election right away
    pub fn become_host(&mut self) -> Result<()> {
        self.role.teardown();

        let port = match self.start_host_role() {
            Ok(port) => port,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        self.is_host = true;
        self.host_id = Some(self.participant_id);

        let quality = self.latest_quality.clone().unwrap_or_default();
        let mut endpoint = HostEndpoint::from_quality(&quality);
        if endpoint.port == 0 {
            endpoint.port = port;
        }
        self.host_address = endpoint.address.clone();
        self.host_port = endpoint.port;
        self.host_connection_type = endpoint.connection_type;

        if self.migration.in_progress() {
            self.migration.complete();
            self.ring.clear();
            info!("Took over as host after failover");
        }

        self.enter_active();
        self.events.on_role(true);

        info!(
            "Hosting at {}:{} ({:?})",
            endpoint.address, endpoint.port, endpoint.connection_type
        );
        self.send_acds(AcdsMessage::HostAnnouncement(HostAnnouncement {
            session_id: self.session_id,
            host_id: self.participant_id,
            address: endpoint.address,
            port: endpoint.port,
            connection_type: endpoint.connection_type,
        }))?;
        self.open_round(false)
    }

    fn start_host_role(&mut self) -> Result<u16> {
        let config = HostConfig {
            bind_address: self.config.host_bind_address.clone(),
            port: self.config.host_port,
            ..Default::default()
        };
        let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        let observer: Arc<dyn HostObserver> = Arc::new(FrameForwarder { tx: Mutex::new(tx) });

        let mut host = SessionHost::new(config, self.media.host_media(), Some(observer))?;
        host.start()?;
        host.add_memory_participant()?;

        let video = self
            .config
            .enable_video
            .then(|| self.media.video_source(DEFAULT_FRAME_WIDTH, DEFAULT_FRAME_HEIGHT));
        let audio = self.config.enable_audio.then(|| self.media.audio_source());
        let capture = match host.memory_feed() {
            Some(feed) if video.is_some() || audio.is_some() => {
                Some(HostCapture::spawn(feed, video, audio)?)
            }
            _ => None,
        };

        let port = host
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.host_port);
        self.role = Role::Host(HostRole {
            host,
            capture,
            frames: rx,
        });
        Ok(port)
    }

    /// Connect to the stored future host
    pub fn connect_to_future_host(&mut self) -> Result<()> {
        if !self.ring.has_future_host() {
            return Err(Error::NotFound("no future host elected".to_string()));
        }
        let address = self.ring.future_host_address.clone();
        let port = self.ring.future_host_port;
        self.host_id = self.ring.future_host_id;
        self.host_address = address.clone();
        self.host_port = port;
        self.host_connection_type = self.ring.future_host_connection_type;

        self.connect_to_host(&address, port)?;
        if self.migration.in_progress() {
            self.migration.complete();
            self.ring.clear();
        }
        self.enter_active();
        Ok(())
    }

    fn connect_to_host(&mut self, address: &str, port: u16) -> Result<()> {
        self.role.teardown();

        let config = ParticipantConfig {
            host_address: address.to_string(),
            port,
            enable_video: self.config.enable_video,
            enable_audio: self.config.enable_audio,
            ..Default::default()
        };
        let mut participant = SessionParticipant::new(config)
            .with_video_source(
                self.media
                    .video_source(DEFAULT_FRAME_WIDTH, DEFAULT_FRAME_HEIGHT),
            )
            .with_audio_source(self.media.audio_source());
        participant.connect()?;

        if self.config.enable_video {
            if let Err(e) = participant.start_video() {
                warn!("Video capture not started: {}", e);
            }
        }
        if self.config.enable_audio {
            if let Err(e) = participant.start_audio() {
                warn!("Audio capture not started: {}", e);
            }
        }

        info!("Connected to host at {}:{}", address, port);
        self.role = Role::Participant(participant);
        self.is_host = false;
        self.events.on_role(false);
        Ok(())
    }

    /// Host liveness, from the transport
    pub fn check_host_alive(&self) -> bool {
        match &self.role {
            Role::Participant(p) => p.is_host_alive(),
            Role::Host(h) => h.host.is_running(),
            Role::None => false,
        }
    }

    /// Fail over to the pre-elected future host without re-negotiating
    pub fn handle_host_disconnect(&mut self, reason: u32) -> Result<()> {
        let now = Instant::now();
        let last_host = self.host_id;
        warn!(
            "Host {} lost (reason {})",
            last_host.as_ref().map(short_id).unwrap_or_else(|| "?".to_string()),
            reason
        );

        self.migration.detect(last_host, reason, now);
        if let Some(id) = last_host {
            self.peers.remove(&id);
        }
        self.set_state(DiscoveryState::Migrating);
        self.role.teardown();

        let lost = HostLost {
            session_id: self.session_id,
            participant_id: self.participant_id,
            last_host_id: last_host.unwrap_or(NO_ID),
            reason,
            disconnect_time_ms: self.migration.elapsed_ms(Instant::now()),
        };
        self.send_acds(AcdsMessage::HostLost(lost))?;

        if !self.ring.has_future_host() {
            let e = Error::NotFound("host lost and no future host elected".to_string());
            self.fail(&e);
            return Err(e);
        }

        self.migration.begin_failover();
        if self.ring.am_future_host {
            return self.become_host();
        }

        self.host_id = self.ring.future_host_id;
        self.host_address = self.ring.future_host_address.clone();
        self.host_port = self.ring.future_host_port;
        self.host_connection_type = self.ring.future_host_connection_type;
        self.last_connect_attempt = None;
        self.set_state(DiscoveryState::ConnectingHost);
        self.step_connecting(now)
    }

    // ------------------------------------------------------------------------
    // Election (host side)
    // ------------------------------------------------------------------------

    /// Re-measure our own quality, then open a new election round
    pub fn start_ring_round(&mut self) -> Result<()> {
        self.open_round(true)
    }

    /// Rounds opened on a join or a takeover reuse the last snapshot
    fn open_round(&mut self, remeasure: bool) -> Result<()> {
        if !self.is_host {
            return Err(Error::InvalidState("only the host runs elections".to_string()));
        }

        let round = self.election_round.max(self.ring.elected_round) + 1;
        self.election_round = round;

        let quality = if remeasure {
            self.fresh_quality()
        } else {
            self.latest_quality.clone().unwrap_or_default()
        };
        self.election = Some(ElectionRound::new(
            self.session_id,
            self.participant_id,
            round,
            quality,
            self.config.election_window,
        )
        .expecting(self.peer_count()));
        self.next_election = Some(Instant::now() + self.config.election_interval);

        info!("Election round {} started", round);
        self.send_acds(AcdsMessage::ElectionRequest {
            session_id: self.session_id,
            host_id: self.participant_id,
            round,
        })
    }

    fn peer_count(&self) -> usize {
        let connected = match &self.role {
            Role::Host(h) => h.host.client_count(),
            _ => 0,
        };
        self.peers.len().max(connected)
    }

    fn finish_election(&mut self) -> Result<()> {
        let Some(round) = self.election.take() else {
            return Ok(());
        };
        let Some(elected) = round.finish() else {
            return Ok(());
        };
        info!(
            "Election round {} picked {} from {} candidates",
            elected.round,
            short_id(&elected.future_host_id),
            round.candidate_count()
        );
        self.store_and_broadcast(elected)
    }

    fn store_and_broadcast(&mut self, elected: FutureHostElected) -> Result<()> {
        self.ring.store(&elected, &self.participant_id);
        self.send_acds(AcdsMessage::FutureHostElected(elected))
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Push new settings to every participant (host only)
    pub fn broadcast_settings(&mut self, mut settings: SessionSettings) -> Result<usize> {
        let Role::Host(h) = &self.role else {
            return Err(Error::InvalidState("only the host sets session settings".to_string()));
        };
        settings.version = self.settings.version.wrapping_add(1);
        let sent = h.host.broadcast_settings(&settings);
        self.settings = settings;
        Ok(sent)
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DiscoverySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoverySession")
            .field("state", &self.state)
            .field("session_string", &self.session_string)
            .field("participant_id", &short_id(&self.participant_id))
            .field("is_host", &self.is_host)
            .field("migration", &self.migration.state)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
