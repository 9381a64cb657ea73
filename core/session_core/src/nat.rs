//! NAT quality snapshot
//!
//! A `NatQuality` is one peer's reachability and performance at a point in
//! time. It starts at the worst case (symmetric NAT, nothing reachable) and
//! the prober fills in what it can. It crosses the wire as the fixed-layout
//! `NetworkQualityWire`.
//!
//! # Tiers
//!
//! | Tier | Condition          |
//! |------|--------------------|
//! | 0    | LAN reachable      |
//! | 1    | Public IP          |
//! | 2    | UPnP mapping       |
//! | 3    | NAT <= Restricted  |
//! | 4    | Everything else    |

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::protocol::{ParticipantId, SessionId};

// ============================================================================
// NAT type
// ============================================================================

/// NAT behaviour, best (Open) to worst (Symmetric)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NatType {
    Open = 0,
    FullCone = 1,
    Restricted = 2,
    PortRestricted = 3,
    Symmetric = 4,
}

impl NatType {
    /// Unknown values decode as the worst case
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => NatType::Open,
            1 => NatType::FullCone,
            2 => NatType::Restricted,
            3 => NatType::PortRestricted,
            _ => NatType::Symmetric,
        }
    }
}

impl Default for NatType {
    fn default() -> Self {
        NatType::Symmetric
    }
}

/// How a participant reaches the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum ConnectionType {
    #[default]
    DirectPublic = 0,
    Upnp = 1,
    Stun = 2,
    Turn = 3,
}

// ============================================================================
// NatQuality
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NatQuality {
    pub has_public_ip: bool,
    pub public_address: String,
    /// Port this peer would host on
    pub public_port: u16,
    pub upnp_available: bool,
    pub upnp_mapped_port: u16,
    pub nat_type: NatType,
    pub lan_reachable: bool,

    pub upload_kbps: u32,
    pub download_kbps: u32,
    pub rtt_to_discovery_ms: u16,
    pub jitter_ms: u8,
    pub packet_loss_pct: u8,

    pub has_host_candidates: bool,
    pub has_srflx_candidates: bool,
    pub has_relay_candidates: bool,

    pub detection_complete: bool,
    pub error: Option<String>,
}

/// Derived reachability tier, lower is better
pub fn compute_tier(q: &NatQuality) -> u8 {
    if q.lan_reachable {
        0
    } else if q.has_public_ip {
        1
    } else if q.upnp_available {
        2
    } else if q.nat_type <= NatType::Restricted {
        3
    } else {
        4
    }
}

/// Address a peer should be reached at if it hosts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEndpoint {
    pub address: String,
    pub port: u16,
    pub connection_type: ConnectionType,
}

impl HostEndpoint {
    /// Pick the best advertised address: public, then UPnP, then STUN, then loopback
    pub fn from_quality(q: &NatQuality) -> Self {
        if q.has_public_ip && !q.public_address.is_empty() {
            return Self {
                address: q.public_address.clone(),
                port: q.public_port,
                connection_type: ConnectionType::DirectPublic,
            };
        }

        if q.upnp_available && !q.public_address.is_empty() {
            let port = if q.upnp_mapped_port != 0 {
                q.upnp_mapped_port
            } else {
                q.public_port
            };
            return Self {
                address: q.public_address.clone(),
                port,
                connection_type: ConnectionType::Upnp,
            };
        }

        if q.has_srflx_candidates && !q.public_address.is_empty() {
            return Self {
                address: q.public_address.clone(),
                port: q.public_port,
                connection_type: ConnectionType::Stun,
            };
        }

        Self {
            address: Ipv4Addr::LOCALHOST.to_string(),
            port: q.public_port,
            connection_type: ConnectionType::DirectPublic,
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

pub const FLAG_PUBLIC_IP: u8 = 0x01;
pub const FLAG_UPNP: u8 = 0x02;
pub const FLAG_LAN: u8 = 0x04;
pub const FLAG_COMPLETE: u8 = 0x08;

pub const ICE_HOST: u8 = 0x01;
pub const ICE_SRFLX: u8 = 0x02;
pub const ICE_RELAY: u8 = 0x04;

/// Size of the NUL-padded address field
pub const WIRE_ADDRESS_LEN: usize = 64;

/// Fixed-layout quality report relayed through ACDS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkQualityWire {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    /// Election round this report answers; 0 during negotiation
    pub round: u64,
    pub flags: u8,
    pub upnp_mapped_port: u16,
    pub public_port: u16,
    pub nat_type: u8,
    pub upload_kbps: u32,
    pub download_kbps: u32,
    pub rtt_ms: u16,
    pub jitter_ms: u8,
    pub loss_pct: u8,
    /// 64 NUL-padded bytes, split in two for serde
    pub public_address: ([u8; 32], [u8; 32]),
    pub ice_candidates: u8,
}

impl NetworkQualityWire {
    pub fn from_quality(
        session_id: SessionId,
        participant_id: ParticipantId,
        round: u64,
        q: &NatQuality,
    ) -> Self {
        let mut flags = 0;
        if q.has_public_ip {
            flags |= FLAG_PUBLIC_IP;
        }
        if q.upnp_available {
            flags |= FLAG_UPNP;
        }
        if q.lan_reachable {
            flags |= FLAG_LAN;
        }
        if q.detection_complete {
            flags |= FLAG_COMPLETE;
        }

        let mut ice = 0;
        if q.has_host_candidates {
            ice |= ICE_HOST;
        }
        if q.has_srflx_candidates {
            ice |= ICE_SRFLX;
        }
        if q.has_relay_candidates {
            ice |= ICE_RELAY;
        }

        Self {
            session_id,
            participant_id,
            round,
            flags,
            upnp_mapped_port: q.upnp_mapped_port,
            public_port: q.public_port,
            nat_type: q.nat_type as u8,
            upload_kbps: q.upload_kbps,
            download_kbps: q.download_kbps,
            rtt_ms: q.rtt_to_discovery_ms,
            jitter_ms: q.jitter_ms,
            loss_pct: q.packet_loss_pct,
            public_address: encode_address(&q.public_address),
            ice_candidates: ice,
        }
    }

    pub fn to_quality(&self) -> NatQuality {
        NatQuality {
            has_public_ip: self.flags & FLAG_PUBLIC_IP != 0,
            public_address: decode_address(&self.public_address),
            public_port: self.public_port,
            upnp_available: self.flags & FLAG_UPNP != 0,
            upnp_mapped_port: self.upnp_mapped_port,
            nat_type: NatType::from_u8(self.nat_type),
            lan_reachable: self.flags & FLAG_LAN != 0,
            upload_kbps: self.upload_kbps,
            download_kbps: self.download_kbps,
            rtt_to_discovery_ms: self.rtt_ms,
            jitter_ms: self.jitter_ms,
            packet_loss_pct: self.loss_pct,
            has_host_candidates: self.ice_candidates & ICE_HOST != 0,
            has_srflx_candidates: self.ice_candidates & ICE_SRFLX != 0,
            has_relay_candidates: self.ice_candidates & ICE_RELAY != 0,
            detection_complete: self.flags & FLAG_COMPLETE != 0,
            error: None,
        }
    }
}

/// NUL-pad an address into the fixed field; the last byte is always NUL
fn encode_address(address: &str) -> ([u8; 32], [u8; 32]) {
    let mut buf = [0u8; WIRE_ADDRESS_LEN];
    let bytes = address.as_bytes();
    let len = bytes.len().min(WIRE_ADDRESS_LEN - 1);
    buf[..len].copy_from_slice(&bytes[..len]);

    let mut lo = [0u8; 32];
    let mut hi = [0u8; 32];
    lo.copy_from_slice(&buf[..32]);
    hi.copy_from_slice(&buf[32..]);
    (lo, hi)
}

fn decode_address(field: &([u8; 32], [u8; 32])) -> String {
    let mut buf = [0u8; WIRE_ADDRESS_LEN];
    buf[..32].copy_from_slice(&field.0);
    buf[32..].copy_from_slice(&field.1);
    let end = buf.iter().position(|&b| b == 0).unwrap_or(WIRE_ADDRESS_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

// ============================================================================
// Local interfaces
// ============================================================================

/// Whether an IPv4 address is routable on the public internet
pub fn is_public_ipv4(ip: &Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast())
}

/// This host's IPv4 interfaces, classified in one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAddresses {
    /// Non-loopback addresses in interface order
    pub addrs: Vec<Ipv4Addr>,
    /// Some interface sits on a private network
    pub lan: bool,
    /// First interface that is directly routable
    pub public: Option<Ipv4Addr>,
}

impl LocalAddresses {
    pub fn classify(ips: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let mut out = Self::default();
        for ip in ips {
            if ip.is_loopback() || ip.is_unspecified() {
                continue;
            }
            out.lan |= ip.is_private();
            if out.public.is_none() && is_public_ipv4(&ip) {
                out.public = Some(ip);
            }
            out.addrs.push(ip);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Read and classify the interface list
pub fn local_addresses() -> LocalAddresses {
    LocalAddresses::classify(interface_ipv4s())
}

#[cfg(unix)]
fn interface_ipv4s() -> Vec<Ipv4Addr> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: on success `head` owns a list released by freeifaddrs below
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Vec::new();
    }

    let mut ips = Vec::new();
    let mut cursor = head;
    // SAFETY: every node and its ifa_addr stay valid until freeifaddrs
    while let Some(ifa) = unsafe { cursor.as_ref() } {
        if let Some(sa) = unsafe { ifa.ifa_addr.as_ref() } {
            if i32::from(sa.sa_family) == libc::AF_INET {
                let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                ips.push(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
            }
        }
        cursor = ifa.ifa_next;
    }

    unsafe { libc::freeifaddrs(head) };
    ips
}

#[cfg(not(unix))]
fn interface_ipv4s() -> Vec<Ipv4Addr> {
    Vec::new()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_worst_case() {
        let q = NatQuality::default();
        assert_eq!(q.nat_type, NatType::Symmetric);
        assert!(!q.detection_complete);
        assert_eq!(compute_tier(&q), 4);
    }

    #[test]
    fn test_nat_type_ordering() {
        assert!(NatType::Open < NatType::FullCone);
        assert!(NatType::Restricted < NatType::PortRestricted);
        assert!(NatType::PortRestricted < NatType::Symmetric);
        assert_eq!(NatType::from_u8(9), NatType::Symmetric);
    }

    #[test]
    fn test_tier_order() {
        let mut q = NatQuality::default();
        q.nat_type = NatType::Restricted;
        assert_eq!(compute_tier(&q), 3);

        q.upnp_available = true;
        assert_eq!(compute_tier(&q), 2);

        q.has_public_ip = true;
        assert_eq!(compute_tier(&q), 1);

        q.lan_reachable = true;
        assert_eq!(compute_tier(&q), 0);
    }

    #[test]
    fn test_port_restricted_is_tier_four() {
        let q = NatQuality {
            nat_type: NatType::PortRestricted,
            ..Default::default()
        };
        assert_eq!(compute_tier(&q), 4);
    }

    #[test]
    fn test_endpoint_preference() {
        let mut q = NatQuality {
            public_address: "198.51.100.7".to_string(),
            public_port: 27224,
            upnp_available: true,
            upnp_mapped_port: 40000,
            ..Default::default()
        };
        let ep = HostEndpoint::from_quality(&q);
        assert_eq!(ep.connection_type, ConnectionType::Upnp);
        assert_eq!(ep.port, 40000);

        q.has_public_ip = true;
        let ep = HostEndpoint::from_quality(&q);
        assert_eq!(ep.connection_type, ConnectionType::DirectPublic);
        assert_eq!(ep.port, 27224);

        let q = NatQuality {
            public_address: "198.51.100.7".to_string(),
            public_port: 27224,
            has_srflx_candidates: true,
            ..Default::default()
        };
        assert_eq!(
            HostEndpoint::from_quality(&q).connection_type,
            ConnectionType::Stun
        );
    }

    #[test]
    fn test_endpoint_loopback_fallback() {
        let q = NatQuality {
            public_port: 5000,
            ..Default::default()
        };
        let ep = HostEndpoint::from_quality(&q);
        assert_eq!(ep.address, "127.0.0.1");
        assert_eq!(ep.port, 5000);
        assert_eq!(ep.connection_type, ConnectionType::DirectPublic);
    }

    #[test]
    fn test_wire_conversion_preserves_fields() {
        let q = NatQuality {
            has_public_ip: true,
            public_address: "203.0.113.44".to_string(),
            public_port: 27224,
            upnp_available: false,
            nat_type: NatType::Open,
            lan_reachable: true,
            upload_kbps: 12_000,
            download_kbps: 80_000,
            rtt_to_discovery_ms: 31,
            jitter_ms: 4,
            packet_loss_pct: 1,
            has_host_candidates: true,
            has_srflx_candidates: true,
            detection_complete: true,
            ..Default::default()
        };

        let wire = NetworkQualityWire::from_quality([1; 16], [2; 16], 5, &q);
        assert_eq!(wire.flags, FLAG_PUBLIC_IP | FLAG_LAN | FLAG_COMPLETE);
        assert_eq!(wire.ice_candidates, ICE_HOST | ICE_SRFLX);
        assert_eq!(wire.round, 5);
        assert_eq!(wire.to_quality(), q);
    }

    #[test]
    fn test_wire_address_truncated_and_terminated() {
        let long = "a".repeat(100);
        let q = NatQuality {
            public_address: long,
            ..Default::default()
        };
        let wire = NetworkQualityWire::from_quality([0; 16], [0; 16], 0, &q);
        assert_eq!(wire.public_address.1[31], 0);
        assert_eq!(wire.to_quality().public_address.len(), WIRE_ADDRESS_LEN - 1);
    }

    #[test]
    fn test_public_ipv4_classification() {
        assert!(is_public_ipv4(&Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_public_ipv4(&Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!is_public_ipv4(&Ipv4Addr::new(172, 20, 0, 1)));
        assert!(!is_public_ipv4(&Ipv4Addr::new(192, 168, 1, 1)));
        assert!(is_public_ipv4(&Ipv4Addr::new(172, 32, 0, 1)));
    }

    #[test]
    fn test_classify_local_addresses() {
        let local = LocalAddresses::classify([
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::new(192, 168, 1, 20),
            Ipv4Addr::new(203, 0, 113, 1),
            Ipv4Addr::new(198, 51, 100, 7),
        ]);
        assert_eq!(local.addrs.len(), 3);
        assert!(local.lan);
        assert_eq!(local.public, Some(Ipv4Addr::new(203, 0, 113, 1)));

        let wan = LocalAddresses::classify([Ipv4Addr::new(203, 0, 113, 1)]);
        assert!(!wan.lan);

        let none = LocalAddresses::classify([Ipv4Addr::LOCALHOST, Ipv4Addr::UNSPECIFIED]);
        assert!(none.is_empty());
        assert!(!none.lan);
        assert_eq!(none.public, None);
    }

    #[test]
    #[cfg(unix)]
    fn test_local_addresses_skip_loopback() {
        let local = local_addresses();
        assert!(local.addrs.iter().all(|ip| !ip.is_loopback()));
        assert_eq!(local.lan, local.addrs.iter().any(|ip| ip.is_private()));
    }
}
