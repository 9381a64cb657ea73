//! Integration tests for session formation and failover
//!
//! Sessions talk to a minimal in-process discovery relay over channel links
//! and to each other's hosts over real loopback TCP.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use session_core::acds_client::{ChannelLink, DiscoveryLink};
use session_core::migration::MigrationState;
use session_core::probe::{QualityProbe, StaticQuality};
use session_core::protocol::{
    AcdsMessage, ErrorCode, ParticipantId, SessionCreated, SessionJoined, SessionType,
};
use session_core::transport::ChannelTransport;
use session_core::{
    compare, ConnectionType, DiscoverySession, DiscoveryState, Error, HostConfig, NatQuality,
    NatType, SessionConfig, SessionEvents, SessionHost,
};

const SESSION_ID: [u8; 16] = [0x5a; 16];
const SESSION_STRING: &str = "amber-falcon-meadow";

// ============================================================================
// Mini relay
// ============================================================================

/// Just enough of a discovery service to form one session
struct MiniRelay {
    new_links: Sender<ChannelLink>,
    running: Arc<AtomicBool>,
    log: Arc<Mutex<Vec<AcdsMessage>>>,
    handle: Option<JoinHandle<()>>,
}

struct RelayPeer {
    link: ChannelLink,
    id: Option<ParticipantId>,
}

impl MiniRelay {
    fn start() -> Self {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let log = Arc::new(Mutex::new(Vec::new()));
        let flag = running.clone();
        let recorded = log.clone();
        let handle = thread::spawn(move || relay_loop(rx, flag, recorded));
        Self {
            new_links: tx,
            running,
            log,
            handle: Some(handle),
        }
    }

    /// Everything the relay has received so far, in arrival order
    fn received(&self) -> Vec<AcdsMessage> {
        self.log.lock().unwrap().clone()
    }

    fn link(&self) -> ChannelLink {
        let (ours, theirs) = ChannelLink::pair();
        self.new_links.send(theirs).unwrap();
        ours
    }
}

impl Drop for MiniRelay {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn relay_loop(
    new_links: Receiver<ChannelLink>,
    running: Arc<AtomicBool>,
    log: Arc<Mutex<Vec<AcdsMessage>>>,
) {
    let mut peers: Vec<RelayPeer> = Vec::new();
    let mut next_id: u8 = 1;
    let mut host: Option<(String, u16)> = None;

    while running.load(Ordering::SeqCst) {
        while let Ok(link) = new_links.try_recv() {
            peers.push(RelayPeer { link, id: None });
        }

        let mut outbound: Vec<(Option<usize>, Option<usize>, AcdsMessage)> = Vec::new();
        let mut dead = Vec::new();

        for (i, peer) in peers.iter_mut().enumerate() {
            loop {
                let msg = match peer.link.recv(Duration::ZERO) {
                    Ok(Some(m)) => m,
                    Ok(None) => break,
                    Err(_) => {
                        dead.push(i);
                        break;
                    }
                };
                log.lock().unwrap().push(msg.clone());
                match msg {
                    AcdsMessage::SessionCreate(_) => {
                        let id = [next_id; 16];
                        next_id += 1;
                        peer.id = Some(id);
                        outbound.push((
                            Some(i),
                            None,
                            AcdsMessage::SessionCreated(SessionCreated {
                                session_id: SESSION_ID,
                                participant_id: id,
                                session_string: SESSION_STRING.to_string(),
                                stun_servers: vec![],
                                turn_servers: vec![],
                            }),
                        ));
                    }
                    AcdsMessage::SessionJoin(join) => {
                        if join.session_string != SESSION_STRING {
                            outbound.push((
                                Some(i),
                                None,
                                AcdsMessage::SessionJoined(SessionJoined::failure(
                                    ErrorCode::SessionNotFound,
                                    "session not found",
                                )),
                            ));
                            continue;
                        }
                        let id = [next_id; 16];
                        next_id += 1;
                        peer.id = Some(id);
                        let (address, port) = host.clone().unwrap_or_default();
                        outbound.push((
                            Some(i),
                            None,
                            AcdsMessage::SessionJoined(SessionJoined {
                                success: true,
                                error_code: ErrorCode::None,
                                error_message: String::new(),
                                participant_id: id,
                                session_id: SESSION_ID,
                                initiator_id: [1; 16],
                                host_established: host.is_some(),
                                server_address: address,
                                server_port: port,
                                session_type: SessionType::DirectTcp,
                                turn_username: String::new(),
                                turn_password: String::new(),
                            }),
                        ));
                        outbound.push((
                            None,
                            Some(i),
                            AcdsMessage::ParticipantJoined {
                                session_id: SESSION_ID,
                                participant_id: id,
                            },
                        ));
                    }
                    AcdsMessage::HostAnnouncement(ann) => {
                        host = Some((ann.address.clone(), ann.port));
                        outbound.push((None, Some(i), AcdsMessage::HostDesignated(ann)));
                    }
                    AcdsMessage::SessionLeave {
                        session_id,
                        participant_id,
                    } => {
                        dead.push(i);
                        outbound.push((
                            None,
                            Some(i),
                            AcdsMessage::ParticipantLeft {
                                session_id,
                                participant_id,
                            },
                        ));
                        break;
                    }
                    AcdsMessage::Ping => outbound.push((Some(i), None, AcdsMessage::Pong)),
                    other @ (AcdsMessage::NetworkQuality(_)
                    | AcdsMessage::ElectionRequest { .. }
                    | AcdsMessage::FutureHostElected(_)
                    | AcdsMessage::HostLost(_)) => outbound.push((None, Some(i), other)),
                    _ => {}
                }
            }
        }

        for (to, except, msg) in outbound {
            for (i, peer) in peers.iter_mut().enumerate() {
                let wanted = match (to, except) {
                    (Some(t), _) => t == i,
                    (None, Some(e)) => e != i && peer.id.is_some(),
                    (None, None) => true,
                };
                if wanted && !dead.contains(&i) {
                    let _ = peer.link.send(&msg);
                }
            }
        }

        dead.sort_unstable();
        dead.dedup();
        for i in dead.into_iter().rev() {
            peers.remove(i);
        }

        thread::sleep(Duration::from_millis(2));
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn public_quality(upload: u32) -> NatQuality {
    NatQuality {
        has_public_ip: true,
        public_address: "127.0.0.1".to_string(),
        nat_type: NatType::Open,
        upload_kbps: upload,
        download_kbps: upload,
        rtt_to_discovery_ms: 10,
        detection_complete: true,
        ..Default::default()
    }
}

fn natted_quality(upload: u32) -> NatQuality {
    NatQuality {
        nat_type: NatType::Symmetric,
        upload_kbps: upload,
        download_kbps: upload,
        rtt_to_discovery_ms: 30,
        detection_complete: true,
        ..Default::default()
    }
}

#[derive(Clone, Default)]
struct Frames(Arc<Mutex<usize>>);

impl SessionEvents for Frames {
    fn on_frame(&mut self, _text: &str) {
        *self.0.lock().unwrap() += 1;
    }
}

impl Frames {
    fn count(&self) -> usize {
        *self.0.lock().unwrap()
    }
}

fn config(join: bool, host_port: u16) -> SessionConfig {
    SessionConfig {
        session_string: join.then(|| SESSION_STRING.to_string()),
        host_bind_address: "127.0.0.1".to_string(),
        host_port,
        enable_audio: false,
        election_window: Duration::from_millis(100),
        ..Default::default()
    }
}

fn session(relay: &MiniRelay, join: bool, quality: NatQuality) -> DiscoverySession {
    DiscoverySession::new(config(join, free_port()))
        .with_link(Box::new(relay.link()))
        .with_prober(Box::new(StaticQuality::new(quality)))
}

/// Fixed quality that counts how often it is measured
struct Counted {
    inner: StaticQuality,
    calls: Arc<AtomicUsize>,
}

impl QualityProbe for Counted {
    fn detect_quality(
        &mut self,
        stun_server: &str,
        local_port: u16,
    ) -> session_core::Result<NatQuality> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.detect_quality(stun_server, local_port)
    }
}

fn counted_session(
    relay: &MiniRelay,
    host_port: u16,
    quality: NatQuality,
    calls: &Arc<AtomicUsize>,
) -> DiscoverySession {
    DiscoverySession::new(config(true, host_port))
        .with_link(Box::new(relay.link()))
        .with_prober(Box::new(Counted {
            inner: StaticQuality::new(quality),
            calls: calls.clone(),
        }))
}

fn drive(
    sessions: &mut [&mut DiscoverySession],
    cond: impl Fn(&[&mut DiscoverySession]) -> bool,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        for s in sessions.iter_mut() {
            let _ = s.process(Duration::from_millis(5));
        }
        if cond(sessions) {
            return true;
        }
    }
    false
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_public_creator_hosts_natted_joiner() {
    let relay = MiniRelay::start();

    let mut creator = session(&relay, false, public_quality(20_000));
    creator.start().unwrap();
    assert_eq!(creator.state(), DiscoveryState::WaitingPeer);

    let frames = Frames::default();
    let mut joiner =
        session(&relay, true, natted_quality(5_000)).with_events(Box::new(frames.clone()));
    joiner.start().unwrap();

    assert!(drive(&mut [&mut creator, &mut joiner], |s| {
        s[0].state() == DiscoveryState::Active && s[1].state() == DiscoveryState::Active
    }));
    assert!(creator.is_host());
    assert!(!joiner.is_host());
    assert_eq!(
        creator.negotiation().and_then(|n| n.result()).map(|r| r.we_are_host),
        Some(true)
    );

    // Mixed ASCII frames reach the participant
    assert!(drive(&mut [&mut creator, &mut joiner], |_| frames.count() > 0));
    assert_eq!(creator.host().unwrap().client_count(), 2);
}

#[test]
fn test_bandwidth_override_makes_joiner_host() {
    let relay = MiniRelay::start();

    let mut creator = session(&relay, false, public_quality(1_000));
    creator.start().unwrap();
    let mut joiner = session(&relay, true, natted_quality(20_000));
    joiner.start().unwrap();

    assert!(drive(&mut [&mut creator, &mut joiner], |s| {
        s[0].state() == DiscoveryState::Active && s[1].state() == DiscoveryState::Active
    }));
    assert!(joiner.is_host());
    assert!(!creator.is_host());
}

#[test]
fn test_late_joiner_connects_to_announced_host() {
    let relay = MiniRelay::start();

    let mut creator = session(&relay, false, public_quality(20_000));
    creator.start().unwrap();
    let mut second = session(&relay, true, natted_quality(5_000));
    second.start().unwrap();
    assert!(drive(&mut [&mut creator, &mut second], |s| {
        s[0].is_host() && s[1].state() == DiscoveryState::Active
    }));

    let mut third = session(&relay, true, public_quality(50_000));
    third.start().unwrap();
    assert!(drive(&mut [&mut creator, &mut second, &mut third], |s| {
        s[2].state() == DiscoveryState::Active
    }));

    // The stronger late joiner still defers to the running host
    assert!(!third.is_host());
    assert_eq!(creator.host().unwrap().client_count(), 3);
}

#[test]
fn test_host_loss_fails_over_to_future_host() {
    let relay = MiniRelay::start();

    let mut creator = session(&relay, false, public_quality(20_000));
    creator.start().unwrap();
    let mut joiner = session(&relay, true, natted_quality(5_000));
    joiner.start().unwrap();

    assert!(drive(&mut [&mut creator, &mut joiner], |s| {
        s[0].state() == DiscoveryState::Active && s[1].state() == DiscoveryState::Active
    }));

    // The host is excluded, so the only other peer is elected
    assert!(drive(&mut [&mut creator, &mut joiner], |s| s[1].ring().am_future_host));

    creator.stop();
    assert_eq!(creator.state(), DiscoveryState::Ended);

    assert!(drive(&mut [&mut joiner], |s| {
        s[0].is_host() && s[0].state() == DiscoveryState::Active
    }));
    assert!(joiner.host().is_some());
}

#[test]
fn test_three_way_failover_to_upnp_future_host() {
    let relay = MiniRelay::start();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut a = session(&relay, false, public_quality(20_000));
    a.start().unwrap();

    // B reaches the outside through a UPnP mapping of its host port
    let b_port = free_port();
    let upnp = NatQuality {
        upnp_available: true,
        upnp_mapped_port: b_port,
        public_address: "127.0.0.1".to_string(),
        nat_type: NatType::FullCone,
        upload_kbps: 15_000,
        download_kbps: 15_000,
        rtt_to_discovery_ms: 15,
        detection_complete: true,
        ..Default::default()
    };
    let mut b = counted_session(&relay, b_port, upnp, &calls);
    b.start().unwrap();
    assert!(drive(&mut [&mut a, &mut b], |s| {
        s[0].is_host() && s[1].state() == DiscoveryState::Active
    }));

    let mut c = counted_session(&relay, free_port(), natted_quality(5_000), &calls);
    c.start().unwrap();

    let b_id = b.participant_id();
    assert!(drive(&mut [&mut a, &mut b, &mut c], |s| {
        s[2].state() == DiscoveryState::Active
            && s[1].ring().am_future_host
            && s[2].ring().future_host_id == Some(s[1].participant_id())
    }));
    let ring = c.ring().clone();
    assert_eq!(ring.future_host_id, Some(b_id));
    assert_eq!(ring.future_host_connection_type, ConnectionType::Upnp);
    assert_eq!(ring.future_host_address, "127.0.0.1");
    assert_eq!(ring.future_host_port, b_port);

    let measured = calls.load(Ordering::SeqCst);
    a.stop();

    assert!(drive(&mut [&mut b, &mut c], |s| {
        s[0].is_host()
            && s[0].state() == DiscoveryState::Active
            && s[1].state() == DiscoveryState::Active
            && s[0].host().map_or(false, |h| h.client_count() == 2)
    }));

    // C went straight to the stored address of B
    assert!(!c.is_host());
    assert_eq!(c.host_endpoint(), ("127.0.0.1", b_port, ConnectionType::Upnp));
    assert_eq!(c.migration().state, MigrationState::Complete);

    // Failover reused the snapshots taken before the host was lost
    assert_eq!(calls.load(Ordering::SeqCst), measured);

    let log = relay.received();
    let lost_at = log
        .iter()
        .position(|m| matches!(m, AcdsMessage::HostLost(_)))
        .expect("HostLost relayed");
    assert!(!log[lost_at..]
        .iter()
        .any(|m| matches!(m, AcdsMessage::NetworkQuality(w) if w.round == 0)));
}

#[test]
fn test_unknown_session_string_fails_join() {
    let relay = MiniRelay::start();
    let config = SessionConfig {
        session_string: Some("no-such-session".to_string()),
        ..Default::default()
    };

    let mut s = DiscoverySession::new(config).with_link(Box::new(relay.link()));
    match s.start() {
        Err(Error::Acds { code, .. }) => assert_eq!(code, ErrorCode::SessionNotFound),
        other => panic!("expected join rejection, got {:?}", other),
    }
    assert_eq!(s.state(), DiscoveryState::Failed);
}

// ============================================================================
// Comparator and host properties
// ============================================================================

#[test]
fn test_comparator_agrees_from_both_sides() {
    let snapshots = [
        public_quality(1_000),
        public_quality(20_000),
        natted_quality(1_000),
        natted_quality(50_000),
        NatQuality {
            upnp_available: true,
            upnp_mapped_port: 40_000,
            nat_type: NatType::FullCone,
            upload_kbps: 8_000,
            detection_complete: true,
            ..Default::default()
        },
    ];

    for a in &snapshots {
        for b in &snapshots {
            let ours = compare(a, b, true);
            let theirs = compare(b, a, false);
            assert_eq!(ours, theirs.reverse(), "disagreement on {:?} vs {:?}", a, b);
            assert_ne!(ours, CmpOrdering::Equal);
        }
    }
}

#[test]
fn test_identical_peers_initiator_hosts() {
    let q = natted_quality(5_000);
    assert_eq!(compare(&q, &q, true), CmpOrdering::Less);
    assert_eq!(compare(&q, &q, false), CmpOrdering::Greater);
}

#[test]
fn test_host_rejects_clients_over_capacity() {
    let mut host = SessionHost::new(
        HostConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            max_clients: 2,
            ..Default::default()
        },
        Default::default(),
        None,
    )
    .unwrap();
    host.start().unwrap();

    let mut keep = Vec::new();
    for _ in 0..2 {
        let (ours, theirs) = ChannelTransport::pair();
        host.add_client_transport(Box::new(ours)).unwrap();
        keep.push(theirs);
    }
    let (ours, _theirs) = ChannelTransport::pair();
    assert!(matches!(
        host.add_client_transport(Box::new(ours)),
        Err(Error::SessionFull)
    ));
    assert_eq!(host.client_count(), 2);
    host.stop();
}
