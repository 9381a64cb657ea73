//! ACDS discovery server
//!
//! Brokers sessions between peers that do not know each other's addresses:
//! hands out memorable session strings, admits joiners (password, capacity,
//! optional identity signature), keeps host addresses private unless the
//! joiner is entitled to them, and relays negotiation and election traffic
//! between the members of a session. It never carries media.
//!
//! # Module Structure
//!
//! - `server`: mio accept/read/write loop
//! - `signaling`: per-message handling, producing deliveries
//! - `registry`: in-memory session table
//! - `auth` / `rate_limit`: admission checks
//! - `strings`: session string generation and validation

pub mod auth;
pub mod client;
pub mod config;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod signaling;
pub mod strings;

pub use config::ServerConfig;
pub use server::Server;
