//! Ring consensus: rolling future-host election
//!
//! The current host runs a round every `ELECTION_INTERVAL`, and right away
//! when someone joins:
//!
//! ```text
//! Host                         ACDS                     Participants
//!  │── ElectionRequest{r} ────>│── ElectionRequest{r} ───>│
//!  │                           │<── NetworkQuality{r} ────│  (fresh probe)
//!  │<── NetworkQuality{r} ─────│                          │
//!  │   ... collect window ...  │                          │
//!  │── FutureHostElected{r} ──>│── FutureHostElected{r} ─>│
//! ```
//!
//! Participants answer from their last measured quality so the reply always
//! lands inside the collect window. Everyone (host included) stores the
//! elected record verbatim. If the host later disappears, participants fail
//! over to it without another round.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::compare::compare_qualities;
use crate::nat::{ConnectionType, HostEndpoint, NatQuality, NetworkQualityWire};
use crate::protocol::{short_id, FutureHostElected, ParticipantId, SessionId};

// ============================================================================
// Constants
// ============================================================================

/// Time between election rounds
pub const ELECTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long the host waits for quality replies
pub const DEFAULT_COLLECT_WINDOW: Duration = Duration::from_secs(3);

// ============================================================================
// RingConsensus
// ============================================================================

/// Latest stored future-host record
#[derive(Debug, Clone, Default)]
pub struct RingConsensus {
    pub future_host_id: Option<ParticipantId>,
    pub future_host_address: String,
    pub future_host_port: u16,
    pub future_host_connection_type: ConnectionType,
    pub am_future_host: bool,
    pub elected_round: u64,
    pub last_round_time: Option<Instant>,
}

impl RingConsensus {
    /// Replace the record with an election result
    ///
    /// Rounds are monotonic: a result not newer than the stored one is
    /// ignored and `false` returned.
    pub fn store(&mut self, elected: &FutureHostElected, me: &ParticipantId) -> bool {
        if self.future_host_id.is_some() && elected.round <= self.elected_round {
            debug!(
                "Ignoring stale election round {} (have {})",
                elected.round, self.elected_round
            );
            return false;
        }

        *self = RingConsensus {
            future_host_id: Some(elected.future_host_id),
            future_host_address: elected.address.clone(),
            future_host_port: elected.port,
            future_host_connection_type: elected.connection_type,
            am_future_host: &elected.future_host_id == me,
            elected_round: elected.round,
            last_round_time: Some(Instant::now()),
        };

        info!(
            "Future host for round {}: {} at {}:{}{}",
            elected.round,
            short_id(&elected.future_host_id),
            elected.address,
            elected.port,
            if self.am_future_host { " (us)" } else { "" }
        );
        true
    }

    pub fn has_future_host(&self) -> bool {
        self.future_host_id.is_some()
    }

    pub fn clear(&mut self) {
        *self = RingConsensus {
            elected_round: self.elected_round,
            ..Default::default()
        };
    }
}

// ============================================================================
// Election
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionCandidate {
    pub participant_id: ParticipantId,
    pub quality: NatQuality,
}

/// Best candidate by `compare_qualities`, then lower participant id
///
/// `exclude` (the current host) is skipped unless it is the only candidate.
pub fn elect_future_host<'a>(
    candidates: &'a [ElectionCandidate],
    exclude: Option<&ParticipantId>,
) -> Option<&'a ElectionCandidate> {
    let eligible: Vec<&ElectionCandidate> = candidates
        .iter()
        .filter(|c| Some(&c.participant_id) != exclude)
        .collect();

    let pool: Vec<&ElectionCandidate> = if eligible.is_empty() {
        candidates.iter().collect()
    } else {
        eligible
    };

    pool.into_iter().min_by(|a, b| rank(a, b))
}

fn rank(a: &ElectionCandidate, b: &ElectionCandidate) -> Ordering {
    compare_qualities(&a.quality, &b.quality)
        .then_with(|| a.participant_id.cmp(&b.participant_id))
}

/// One host-side collection round
#[derive(Debug)]
pub struct ElectionRound {
    pub session_id: SessionId,
    pub host_id: ParticipantId,
    pub round: u64,
    started_at: Instant,
    window: Duration,
    expected_peers: usize,
    candidates: Vec<ElectionCandidate>,
}

impl ElectionRound {
    /// Open a round seeded with the host's own fresh quality
    pub fn new(
        session_id: SessionId,
        host_id: ParticipantId,
        round: u64,
        host_quality: NatQuality,
        window: Duration,
    ) -> Self {
        Self {
            session_id,
            host_id,
            round,
            started_at: Instant::now(),
            window,
            expected_peers: 0,
            candidates: vec![ElectionCandidate {
                participant_id: host_id,
                quality: host_quality,
            }],
        }
    }

    /// Number of other participants the host knows about
    ///
    /// With peers present the host never elects itself: a round nobody
    /// answered keeps the previous record instead.
    pub fn expecting(mut self, peers: usize) -> Self {
        self.expected_peers = peers;
        self
    }

    /// Record a reply; replies for other rounds are dropped
    pub fn record(&mut self, wire: &NetworkQualityWire) -> bool {
        if wire.round != self.round || wire.session_id != self.session_id {
            return false;
        }
        let quality = wire.to_quality();
        match self
            .candidates
            .iter_mut()
            .find(|c| c.participant_id == wire.participant_id)
        {
            Some(existing) => existing.quality = quality,
            None => self.candidates.push(ElectionCandidate {
                participant_id: wire.participant_id,
                quality,
            }),
        }
        true
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) >= self.window
    }

    /// Pick the winner and build the broadcast record
    pub fn finish(&self) -> Option<FutureHostElected> {
        if self.expected_peers > 0 && self.candidates.len() == 1 {
            warn!(
                "Election round {}: no replies from {} peer(s), keeping previous future host",
                self.round, self.expected_peers
            );
            return None;
        }
        let winner = elect_future_host(&self.candidates, Some(&self.host_id))?;
        let endpoint = HostEndpoint::from_quality(&winner.quality);

        Some(FutureHostElected {
            session_id: self.session_id,
            host_id: self.host_id,
            future_host_id: winner.participant_id,
            address: endpoint.address,
            port: endpoint.port,
            connection_type: endpoint.connection_type,
            round: self.round,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
