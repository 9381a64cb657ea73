//! NAT quality prober
//!
//! Runs the UPnP, STUN and bandwidth probes and folds their results into a
//! `NatQuality`. The probes are independent: a failed probe is logged and
//! leaves its fields at the defaults, and detection still completes.
//!
//! Order: UPnP first; a successful mapping makes STUN redundant. LAN
//! reachability comes from the local interface list.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use igd_next::{PortMappingProtocol, SearchOptions};
use log::{debug, info, warn};
use stun::addr::MappedAddress;
use stun::agent::TransactionId;
use stun::message::{Getter, Message, BINDING_REQUEST, BINDING_SUCCESS};
use stun::xoraddr::XorMappedAddress;

use crate::error::{Error, Result};
use crate::nat::{is_public_ipv4, local_addresses, LocalAddresses, NatQuality, NatType};

// ============================================================================
// Constants
// ============================================================================

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// STUN response timeout
pub const STUN_TIMEOUT: Duration = Duration::from_secs(5);

/// SSDP gateway discovery timeout
pub const UPNP_SEARCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Port mapping lease requested from the gateway
pub const UPNP_LEASE: Duration = Duration::from_secs(3600);

const SSDP_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_PORT: u16 = 1900;

/// Conservative bandwidth assumed when nothing is measured
pub const ASSUMED_UPLOAD_KBPS: u32 = 10_000;
pub const ASSUMED_DOWNLOAD_KBPS: u32 = 50_000;
pub const ASSUMED_RTT_MS: u16 = 50;
pub const ASSUMED_JITTER_MS: u8 = 5;

// ============================================================================
// Probe traits
// ============================================================================

/// External mapping granted by a UPnP gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub external_ip: IpAddr,
    pub external_port: u16,
}

/// UPnP IGD port mapper
pub trait PortMapper: Send {
    fn map(&mut self, local_port: u16) -> Result<PortMapping>;
}

/// Result of a STUN binding exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunReply {
    pub reflexive: SocketAddr,
    /// NAT classification, when the probe can tell
    pub nat_hint: Option<NatType>,
}

pub trait StunProbe: Send {
    fn probe(&mut self, server: &str) -> Result<StunReply>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthReport {
    pub upload_kbps: u32,
    pub download_kbps: u32,
    pub rtt_ms: u16,
    pub jitter_ms: u8,
    pub loss_pct: u8,
}

pub trait BandwidthProbe: Send {
    fn measure(&mut self) -> Result<BandwidthReport>;
}

/// Anything that can produce a quality snapshot for negotiation
pub trait QualityProbe: Send {
    fn detect_quality(&mut self, stun_server: &str, local_port: u16) -> Result<NatQuality>;

    /// Latest measured round trip to the discovery service
    fn set_discovery_rtt(&mut self, _rtt: Duration) {}
}

// ============================================================================
// Default probe implementations
// ============================================================================

/// No UPnP gateway support
#[derive(Debug, Default)]
pub struct NoPortMapper;

impl PortMapper for NoPortMapper {
    fn map(&mut self, _local_port: u16) -> Result<PortMapping> {
        Err(Error::NotFound("UPnP gateway".to_string()))
    }
}

/// UPnP Internet Gateway Device found over SSDP
///
/// Maps the host port to the same external TCP port for `lease`.
#[derive(Debug, Clone)]
pub struct IgdPortMapper {
    pub bind_addr: SocketAddr,
    pub ssdp_address: SocketAddr,
    pub search_timeout: Duration,
    pub lease: Duration,
    pub description: String,
}

impl Default for IgdPortMapper {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            ssdp_address: SocketAddr::from((SSDP_MULTICAST, SSDP_PORT)),
            search_timeout: UPNP_SEARCH_TIMEOUT,
            lease: UPNP_LEASE,
            description: "session host".to_string(),
        }
    }
}

impl PortMapper for IgdPortMapper {
    fn map(&mut self, local_port: u16) -> Result<PortMapping> {
        let options = SearchOptions {
            bind_addr: self.bind_addr,
            broadcast_address: self.ssdp_address,
            timeout: Some(self.search_timeout),
            ..Default::default()
        };
        let gateway = igd_next::search_gateway(options)
            .map_err(|e| Error::NotFound(format!("UPnP gateway: {}", e)))?;
        debug!("UPnP gateway at {}", gateway.addr);

        let local_ip = local_ip_towards(gateway.addr)?;
        let external_ip = gateway
            .get_external_ip()
            .map_err(|e| Error::NetworkProtocol(format!("UPnP external address: {}", e)))?;

        gateway
            .add_port(
                PortMappingProtocol::TCP,
                local_port,
                SocketAddr::new(local_ip, local_port),
                self.lease.as_secs().min(u32::MAX as u64) as u32,
                &self.description,
            )
            .map_err(|e| Error::NetworkProtocol(format!("UPnP mapping: {}", e)))?;

        Ok(PortMapping {
            external_ip,
            external_port: local_port,
        })
    }
}

/// Source address the kernel picks for reaching `remote`
fn local_ip_towards(remote: SocketAddr) -> Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .map_err(|e| Error::NetworkBind(e.to_string()))?;
    socket.connect(remote)?;
    Ok(socket.local_addr()?.ip())
}

/// Reports the conservative defaults
#[derive(Debug, Default)]
pub struct AssumedBandwidth;

impl BandwidthProbe for AssumedBandwidth {
    fn measure(&mut self) -> Result<BandwidthReport> {
        Ok(BandwidthReport {
            upload_kbps: ASSUMED_UPLOAD_KBPS,
            download_kbps: ASSUMED_DOWNLOAD_KBPS,
            rtt_ms: ASSUMED_RTT_MS,
            jitter_ms: ASSUMED_JITTER_MS,
            loss_pct: 0,
        })
    }
}

/// Timed upload to a sink endpoint
///
/// Connects, writes `payload_kb` kilobytes and derives upload throughput from
/// the elapsed time. Download is not measured and reports the assumed value.
#[derive(Debug, Clone)]
pub struct TcpThroughputProbe {
    pub target: SocketAddr,
    pub payload_kb: usize,
    pub timeout: Duration,
}

impl TcpThroughputProbe {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            payload_kb: 256,
            timeout: Duration::from_secs(5),
        }
    }
}

impl BandwidthProbe for TcpThroughputProbe {
    fn measure(&mut self) -> Result<BandwidthReport> {
        let connect_start = Instant::now();
        let mut stream = TcpStream::connect_timeout(&self.target, self.timeout)
            .map_err(|e| Error::NetworkConnect(format!("{}: {}", self.target, e)))?;
        let rtt = connect_start.elapsed();

        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;

        let chunk = [0u8; 1024];
        let start = Instant::now();
        for _ in 0..self.payload_kb {
            stream.write_all(&chunk)?;
        }
        stream.flush()?;
        let elapsed_ms = start.elapsed().as_millis().max(1) as u64;

        let bits = (self.payload_kb as u64) * 1024 * 8;
        let upload_kbps = (bits / elapsed_ms).min(u32::MAX as u64) as u32;

        debug!(
            "Throughput probe to {}: {} KB in {} ms ({} kbps)",
            self.target, self.payload_kb, elapsed_ms, upload_kbps
        );

        Ok(BandwidthReport {
            upload_kbps,
            download_kbps: ASSUMED_DOWNLOAD_KBPS,
            rtt_ms: rtt.as_millis().min(u16::MAX as u128) as u16,
            jitter_ms: 0,
            loss_pct: 0,
        })
    }
}

/// RFC 5389 Binding Request over UDP
#[derive(Debug, Clone)]
pub struct UdpStunProbe {
    pub timeout: Duration,
}

impl Default for UdpStunProbe {
    fn default() -> Self {
        Self {
            timeout: STUN_TIMEOUT,
        }
    }
}

impl StunProbe for UdpStunProbe {
    fn probe(&mut self, server: &str) -> Result<StunReply> {
        let server_addr = server
            .to_socket_addrs()
            .map_err(|e| Error::NetworkConnect(format!("resolve {}: {}", server, e)))?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| Error::NetworkConnect(format!("no IPv4 address for {}", server)))?;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| Error::NetworkBind(e.to_string()))?;
        socket.set_read_timeout(Some(self.timeout))?;

        let request = binding_request()?;
        socket.send_to(&request.raw, server_addr)?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 1024];
        loop {
            let (len, from) = socket.recv_from(&mut buf)?;
            if from == server_addr {
                if let Some(reflexive) = reflexive_address(&buf[..len], &request) {
                    return Ok(StunReply {
                        reflexive,
                        nat_hint: None,
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::NetworkProtocol("no STUN binding response".to_string()));
            }
        }
    }
}

/// A Binding Request with a fresh transaction id and no attributes
pub fn binding_request() -> Result<Message> {
    let mut msg = Message::new();
    msg.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
        .map_err(|e| Error::NetworkProtocol(format!("stun encode: {}", e)))?;
    Ok(msg)
}

/// Reflexive address from the Binding Success Response to `request`
///
/// Prefers XOR-MAPPED-ADDRESS, falls back to MAPPED-ADDRESS.
pub fn reflexive_address(data: &[u8], request: &Message) -> Option<SocketAddr> {
    let mut msg = Message::new();
    msg.unmarshal_binary(data).ok()?;
    if msg.typ != BINDING_SUCCESS || msg.transaction_id != request.transaction_id {
        return None;
    }

    let mut xor = XorMappedAddress::default();
    if xor.get_from(&msg).is_ok() {
        return Some(SocketAddr::new(xor.ip, xor.port));
    }
    let mut mapped = MappedAddress::default();
    mapped.get_from(&msg).ok()?;
    Some(SocketAddr::new(mapped.ip, mapped.port))
}

// ============================================================================
// NatProber
// ============================================================================

/// Runs all probes and assembles a `NatQuality`
pub struct NatProber {
    mapper: Box<dyn PortMapper>,
    stun: Box<dyn StunProbe>,
    bandwidth: Box<dyn BandwidthProbe>,
    discovery_rtt: Option<Duration>,
}

impl Default for NatProber {
    fn default() -> Self {
        Self::new(
            Box::new(IgdPortMapper::default()),
            Box::new(UdpStunProbe::default()),
            Box::new(AssumedBandwidth),
        )
    }
}

impl NatProber {
    pub fn new(
        mapper: Box<dyn PortMapper>,
        stun: Box<dyn StunProbe>,
        bandwidth: Box<dyn BandwidthProbe>,
    ) -> Self {
        Self {
            mapper,
            stun,
            bandwidth,
            discovery_rtt: None,
        }
    }

    /// Probe with an explicit interface list (for deterministic tests)
    pub fn detect_with_interfaces(
        &mut self,
        stun_server: &str,
        local_port: u16,
        local: &LocalAddresses,
    ) -> NatQuality {
        let mut q = NatQuality {
            public_port: local_port,
            ..Default::default()
        };

        q.lan_reachable = local.lan;
        q.has_host_candidates = !local.is_empty();

        // A local interface may already be public
        if let Some(ip) = local.public {
            q.has_public_ip = true;
            q.public_address = ip.to_string();
            q.nat_type = NatType::Open;
        }

        let mut upnp_ok = false;
        match self.mapper.map(local_port) {
            Ok(mapping) => {
                upnp_ok = true;
                q.upnp_available = true;
                q.upnp_mapped_port = mapping.external_port;
                if q.public_address.is_empty() {
                    q.public_address = mapping.external_ip.to_string();
                }
                if q.nat_type > NatType::FullCone {
                    q.nat_type = NatType::FullCone;
                }
                info!(
                    "UPnP mapping {} -> {}:{}",
                    local_port, mapping.external_ip, mapping.external_port
                );
            }
            Err(e) => debug!("UPnP unavailable: {}", e),
        }

        let mut stun_ok = false;
        if !upnp_ok && !q.has_public_ip {
            match self.stun.probe(stun_server) {
                Ok(reply) => {
                    stun_ok = true;
                    let public = match reply.reflexive.ip() {
                        IpAddr::V4(v4) => is_public_ipv4(&v4),
                        IpAddr::V6(v6) => !v6.is_loopback() && !v6.is_unspecified(),
                    };
                    q.public_address = reply.reflexive.ip().to_string();
                    if public {
                        q.has_public_ip = true;
                        q.nat_type = NatType::Open;
                    } else if let Some(hint) = reply.nat_hint {
                        q.nat_type = hint;
                    }
                    debug!("STUN reflexive address {}", reply.reflexive);
                }
                Err(e) => {
                    warn!("STUN probe to {} failed: {}", stun_server, e);
                    q.error = Some(format!("stun: {}", e));
                }
            }
        }

        q.has_srflx_candidates = upnp_ok || q.has_public_ip || stun_ok;
        q.has_relay_candidates = false;

        match self.bandwidth.measure() {
            Ok(report) => {
                q.upload_kbps = report.upload_kbps;
                q.download_kbps = report.download_kbps;
                q.rtt_to_discovery_ms = report.rtt_ms;
                q.jitter_ms = report.jitter_ms;
                q.packet_loss_pct = report.loss_pct;
            }
            Err(e) => warn!("Bandwidth probe failed: {}", e),
        }

        if let Some(rtt) = self.discovery_rtt {
            q.rtt_to_discovery_ms = rtt.as_millis().min(u16::MAX as u128) as u16;
        }

        q.detection_complete = true;
        q
    }
}

impl QualityProbe for NatProber {
    fn detect_quality(&mut self, stun_server: &str, local_port: u16) -> Result<NatQuality> {
        let local = local_addresses();
        Ok(self.detect_with_interfaces(stun_server, local_port, &local))
    }

    fn set_discovery_rtt(&mut self, rtt: Duration) {
        self.discovery_rtt = Some(rtt);
    }
}

/// Reports a fixed snapshot, for peers whose connectivity is known up front
#[derive(Debug, Clone, Default)]
pub struct StaticQuality {
    pub quality: NatQuality,
}

impl StaticQuality {
    pub fn new(quality: NatQuality) -> Self {
        Self { quality }
    }
}

impl QualityProbe for StaticQuality {
    fn detect_quality(&mut self, _stun_server: &str, local_port: u16) -> Result<NatQuality> {
        let mut q = self.quality.clone();
        if q.public_port == 0 {
            q.public_port = local_port;
        }
        q.detection_complete = true;
        Ok(q)
    }

    fn set_discovery_rtt(&mut self, rtt: Duration) {
        self.quality.rtt_to_discovery_ms = rtt.as_millis().min(u16::MAX as u128) as u16;
    }
}

// ============================================================================
// Tests
// ============================================================================
