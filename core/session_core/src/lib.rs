//! Session core for peer-to-peer video chat
//!
//! Session formation and host failover: a discovery service (ACDS) brokers
//! participants that do not know each other's addresses, negotiation picks
//! the media-mixing host from NAT quality and bandwidth, and a rolling ring
//! election pre-selects a future host so a lost host can be replaced without
//! a live re-election.
//!
//! # Module Structure
//!
//! - `nat` / `probe`: NAT quality snapshot and the probes that fill it
//! - `compare`: deterministic host comparator
//! - `negotiate`: two-party negotiation state machine
//! - `election` / `migration`: future-host ring consensus and failover
//! - `protocol` / `packet` / `framing`: ACDS messages, host media packets, wire framing
//! - `host` / `participant`: media runtimes
//! - `session`: the discovery session lifecycle tying it all together
//!
//! # Roles
//!
//! ```text
//!                 ┌──────────────┐
//!        ┌───────>│     ACDS     │<───────┐
//!        │        └──────────────┘        │
//!        │  quality / election relay      │
//!   ┌────┴─────┐                     ┌────┴─────┐
//!   │  Host    │<════ media TCP ═════│ Partic.  │
//!   │ (mixer)  │════ ascii/audio ═══>│          │
//!   └──────────┘                     └──────────┘
//! ```

pub mod acds_client;
pub mod compare;
pub mod election;
pub mod error;
pub mod framing;
pub mod host;
pub mod identity;
pub mod media;
pub mod migration;
pub mod nat;
pub mod negotiate;
pub mod packet;
pub mod participant;
pub mod probe;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod transport;

pub use compare::{compare, compare_qualities};
pub use error::{Error, Result};
pub use host::{HostConfig, SessionHost};
pub use nat::{compute_tier, ConnectionType, NatQuality, NatType, NetworkQualityWire};
pub use negotiate::{NegotiationContext, NegotiationResult, NegotiationState};
pub use participant::{ParticipantConfig, SessionParticipant};
pub use protocol::{AcdsMessage, ErrorCode, ParticipantId, SessionId};
pub use session::{DiscoverySession, DiscoveryState, MediaFactory, SessionConfig, SessionEvents};
pub use settings::SessionSettings;
