//! Two-party host negotiation
//!
//! ```text
//! Init ──> DetectingNat ──┬──> WaitingPeer ──> Comparing ──┬──> WeHost ───┐
//!               │         └──────────────────────^         └──> TheyHost ─┴──> Complete
//!               └──> Failed <── (timeout / transport) ──┘
//! ```
//!
//! Peer quality may arrive at any point before comparison; it is stored and
//! consumed once local detection finishes.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::compare::compare;
use crate::error::{Error, Result};
use crate::nat::{ConnectionType, HostEndpoint, NatQuality, NetworkQualityWire};
use crate::probe::QualityProbe;
use crate::protocol::{short_id, ParticipantId, SessionId};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Init,
    DetectingNat,
    WaitingPeer,
    Comparing,
    WeHost,
    TheyHost,
    Complete,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Complete | NegotiationState::Failed)
    }
}

/// Valid (from, to) pairs; everything else is rejected
fn is_valid_transition(from: NegotiationState, to: NegotiationState) -> bool {
    use NegotiationState::*;
    matches!(
        (from, to),
        (Init, DetectingNat)
            | (DetectingNat, WaitingPeer)
            | (DetectingNat, Comparing)
            | (WaitingPeer, Comparing)
            | (Comparing, WeHost)
            | (Comparing, TheyHost)
            | (WeHost, Complete)
            | (TheyHost, Complete)
            | (Init, Failed)
            | (DetectingNat, Failed)
            | (WaitingPeer, Failed)
            | (Comparing, Failed)
    )
}

/// Outcome of a finished negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationResult {
    pub we_are_host: bool,
    pub host_address: String,
    pub host_port: u16,
    pub connection_type: ConnectionType,
}

// ============================================================================
// NegotiationContext
// ============================================================================

#[derive(Debug)]
pub struct NegotiationContext {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub is_initiator: bool,

    state: NegotiationState,
    our_quality: NatQuality,
    peer_quality: NatQuality,
    peer_quality_received: bool,
    result: Option<NegotiationResult>,
    failure: Option<String>,

    started_at: Instant,
    waiting_since: Option<Instant>,
    waiting_timeout: Option<Duration>,
}

impl NegotiationContext {
    pub fn new(
        session_id: SessionId,
        participant_id: ParticipantId,
        is_initiator: bool,
        waiting_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session_id,
            participant_id,
            is_initiator,
            state: NegotiationState::Init,
            our_quality: NatQuality::default(),
            peer_quality: NatQuality::default(),
            peer_quality_received: false,
            result: None,
            failure: None,
            started_at: Instant::now(),
            waiting_since: None,
            waiting_timeout,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn our_quality(&self) -> &NatQuality {
        &self.our_quality
    }

    pub fn peer_quality(&self) -> Option<&NatQuality> {
        self.peer_quality_received.then_some(&self.peer_quality)
    }

    pub fn result(&self) -> Option<&NegotiationResult> {
        self.result.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Our snapshot in wire form, for relaying through ACDS
    pub fn our_wire(&self, round: u64) -> NetworkQualityWire {
        NetworkQualityWire::from_quality(
            self.session_id,
            self.participant_id,
            round,
            &self.our_quality,
        )
    }

    fn transition(&mut self, to: NegotiationState) -> Result<()> {
        if !is_valid_transition(self.state, to) {
            return Err(Error::InvalidState(format!(
                "negotiation {:?} -> {:?}",
                self.state, to
            )));
        }
        debug!(
            "Negotiation {}: {:?} -> {:?}",
            short_id(&self.participant_id),
            self.state,
            to
        );
        self.state = to;
        if to == NegotiationState::WaitingPeer {
            self.waiting_since = Some(Instant::now());
        }
        Ok(())
    }

    /// Run local probing, then wait for or compare against the peer
    pub fn start_detection(
        &mut self,
        prober: &mut dyn QualityProbe,
        stun_server: &str,
        local_port: u16,
    ) -> Result<()> {
        self.transition(NegotiationState::DetectingNat)?;

        match prober.detect_quality(stun_server, local_port) {
            Ok(q) => self.our_quality = q,
            Err(e) => {
                self.fail(format!("NAT detection failed: {}", e));
                return Err(e);
            }
        }

        info!(
            "Local NAT quality: tier {} nat={:?} upload={} kbps",
            crate::nat::compute_tier(&self.our_quality),
            self.our_quality.nat_type,
            self.our_quality.upload_kbps
        );

        if self.peer_quality_received && self.peer_quality.detection_complete {
            self.transition(NegotiationState::Comparing)
        } else {
            self.transition(NegotiationState::WaitingPeer)
        }
    }

    /// Store the peer's snapshot; compare if ours is ready
    pub fn receive_peer_quality(&mut self, wire: &NetworkQualityWire) -> Result<()> {
        match self.state {
            NegotiationState::Init
            | NegotiationState::DetectingNat
            | NegotiationState::WaitingPeer => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "peer quality received in {:?}",
                    other
                )))
            }
        }

        if wire.participant_id == self.participant_id {
            return Err(Error::InvalidParam("quality report is our own".to_string()));
        }

        self.peer_quality = wire.to_quality();
        self.peer_quality_received = true;
        debug!(
            "Peer {} quality received (complete={})",
            short_id(&wire.participant_id),
            self.peer_quality.detection_complete
        );

        if self.state == NegotiationState::WaitingPeer
            && self.our_quality.detection_complete
            && self.peer_quality.detection_complete
        {
            self.transition(NegotiationState::Comparing)?;
        }
        Ok(())
    }

    /// Run the comparator and fix the host endpoint
    pub fn determine_result(&mut self) -> Result<&NegotiationResult> {
        self.require_comparing()?;

        let we_host =
            compare(&self.our_quality, &self.peer_quality, self.is_initiator) == Ordering::Less;
        self.finish(we_host)
    }

    /// Accept the peer as host without comparing (joining an already running host)
    pub fn accept_peer_as_host(&mut self) -> Result<&NegotiationResult> {
        self.require_comparing()?;
        self.finish(false)
    }

    fn require_comparing(&self) -> Result<()> {
        if self.state != NegotiationState::Comparing {
            return Err(Error::InvalidState(format!(
                "cannot determine result in {:?}",
                self.state
            )));
        }
        if !self.our_quality.detection_complete || !self.peer_quality.detection_complete {
            return Err(Error::InvalidState("quality detection incomplete".to_string()));
        }
        Ok(())
    }

    fn finish(&mut self, we_host: bool) -> Result<&NegotiationResult> {
        let endpoint = if we_host {
            self.transition(NegotiationState::WeHost)?;
            HostEndpoint::from_quality(&self.our_quality)
        } else {
            self.transition(NegotiationState::TheyHost)?;
            HostEndpoint::from_quality(&self.peer_quality)
        };

        info!(
            "Negotiation decided: {} hosts at {}:{} ({:?})",
            if we_host { "we" } else { "peer" },
            endpoint.address,
            endpoint.port,
            endpoint.connection_type
        );

        self.transition(NegotiationState::Complete)?;
        Ok(&*self.result.insert(NegotiationResult {
            we_are_host: we_host,
            host_address: endpoint.address,
            host_port: endpoint.port,
            connection_type: endpoint.connection_type,
        }))
    }

    /// Fail if the peer has not reported within the waiting timeout
    ///
    /// Returns true if this call moved the negotiation to `Failed`.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.state != NegotiationState::WaitingPeer {
            return false;
        }
        let (Some(timeout), Some(since)) = (self.waiting_timeout, self.waiting_since) else {
            return false;
        };
        if now.saturating_duration_since(since) > timeout {
            self.fail("peer did not report network quality");
            return true;
        }
        false
    }

    /// Move to `Failed` from any non-terminal state
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.state.is_terminal() {
            return;
        }
        warn!("Negotiation failed in {:?}: {}", self.state, reason);
        self.failure = Some(reason);
        self.state = NegotiationState::Failed;
    }
}

// ============================================================================
// Tests
// ============================================================================
