//! Host liveness and failover tracking
//!
//! # Keepalive
//!
//! Participants ping the host every 2 seconds. A ping that goes unanswered
//! for `KEEPALIVE_TIMEOUT` counts as missed; 3 consecutive misses (or a
//! connection reset) mean the host is gone.
//!
//! # Migration
//!
//! ```text
//! None ──> Detected ──> Failover ──> Complete
//!             │             │
//!             └─────────────┴──> (timeout) session fails
//! ```

use std::time::{Duration, Instant};

use crate::protocol::ParticipantId;

// ============================================================================
// Constants
// ============================================================================

/// How often to ping the host
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// How long to wait for a pong before counting a miss
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of missed keepalives before the host is considered lost
pub const MISSED_KEEPALIVES_THRESHOLD: u32 = 3;

/// Time allowed to finish a failover
pub const MIGRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Disconnect reasons carried in `HostLost`
pub const REASON_TIMEOUT: u32 = 1;
pub const REASON_CONNECTION_RESET: u32 = 2;
pub const REASON_HOST_LEFT: u32 = 3;

// ============================================================================
// Migration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationState {
    #[default]
    None,
    Detected,
    Failover,
    Complete,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationContext {
    pub state: MigrationState,
    pub detection_time: Option<Instant>,
    pub last_host_id: Option<ParticipantId>,
    pub disconnect_reason: u32,
}

impl MigrationContext {
    /// Record that the host is gone
    pub fn detect(&mut self, last_host_id: Option<ParticipantId>, reason: u32, now: Instant) {
        self.state = MigrationState::Detected;
        self.detection_time = Some(now);
        self.last_host_id = last_host_id;
        self.disconnect_reason = reason;
    }

    pub fn begin_failover(&mut self) {
        self.state = MigrationState::Failover;
    }

    pub fn complete(&mut self) {
        self.state = MigrationState::Complete;
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.state, MigrationState::Detected | MigrationState::Failover)
    }

    /// Whether an in-progress migration has outlived `timeout`
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        match (self.in_progress(), self.detection_time) {
            (true, Some(t)) => now.saturating_duration_since(t) > timeout,
            _ => false,
        }
    }

    /// Milliseconds since detection, for `HostLost`
    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        self.detection_time
            .map(|t| now.saturating_duration_since(t).as_millis() as u64)
            .unwrap_or(0)
    }
}

// ============================================================================
// Keepalive liveness
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Alive,
    /// Some keepalives missed
    Degraded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct HostLiveness {
    pub state: LivenessState,
    pub missed_keepalives: u32,
    pub last_ping_sent: Option<Instant>,
    pub last_heard: Instant,
    pub rtt: Option<Duration>,
    awaiting_pong: bool,
    interval: Duration,
    timeout: Duration,
}

impl HostLiveness {
    pub fn new(now: Instant) -> Self {
        Self::with_timing(now, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT)
    }

    pub fn with_timing(now: Instant, interval: Duration, timeout: Duration) -> Self {
        Self {
            state: LivenessState::Alive,
            missed_keepalives: 0,
            last_ping_sent: None,
            last_heard: now,
            rtt: None,
            awaiting_pong: false,
            interval,
            timeout,
        }
    }

    pub fn should_send_ping(&self, now: Instant) -> bool {
        if self.state == LivenessState::Failed || self.awaiting_pong {
            return false;
        }
        match self.last_ping_sent {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn record_ping_sent(&mut self, now: Instant) {
        self.last_ping_sent = Some(now);
        self.awaiting_pong = true;
    }

    /// Any traffic from the host proves it is alive; a pong also yields RTT
    pub fn record_heard(&mut self, now: Instant, is_pong: bool) {
        if is_pong && self.awaiting_pong {
            if let Some(sent) = self.last_ping_sent {
                self.rtt = Some(now.saturating_duration_since(sent));
            }
        }
        self.last_heard = now;
        self.awaiting_pong = false;
        self.missed_keepalives = 0;
        if self.state == LivenessState::Degraded {
            self.state = LivenessState::Alive;
        }
    }

    /// Count an unanswered ping; returns true on the transition to Failed
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.state == LivenessState::Failed || !self.awaiting_pong {
            return false;
        }
        let Some(sent) = self.last_ping_sent else {
            return false;
        };
        if now.saturating_duration_since(sent) < self.timeout {
            return false;
        }

        self.awaiting_pong = false;
        self.missed_keepalives += 1;
        if self.missed_keepalives >= MISSED_KEEPALIVES_THRESHOLD {
            self.state = LivenessState::Failed;
            return true;
        }
        self.state = LivenessState::Degraded;
        false
    }

    pub fn mark_failed(&mut self) {
        self.state = LivenessState::Failed;
    }

    pub fn is_alive(&self) -> bool {
        self.state != LivenessState::Failed
    }
}
