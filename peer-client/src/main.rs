//! Session peer
//!
//! Creates a session (no `--join`) or joins one by its session string, then
//! lets the discovery session negotiate the host and run the media role:
//! - Connects to ACDS and creates/joins
//! - Probes NAT quality and negotiates who hosts
//! - Hosts (mixes ASCII frames) or connects to the host as a participant
//! - Fails over to the elected future host when the host goes away

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};

use session_core::identity::Identity;
use session_core::probe::StaticQuality;
use session_core::protocol::DEFAULT_ACDS_PORT;
use session_core::{
    DiscoverySession, DiscoveryState, Error, NatQuality, NatType, SessionConfig, SessionEvents,
};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on one `process` call
const PROCESS_SLICE: Duration = Duration::from_millis(50);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        usage();
        return Ok(());
    }

    // --acds-address <host>     Discovery server (default 127.0.0.1)
    // --acds-port <port>        Discovery port (default 27225)
    // --join <session-string>   Join instead of create
    // --password <pw>           Session password
    // --expose-ip               Reveal the host address to joiners without a password
    // --host-port <port>        Port to listen on when hosting
    // --stun <host:port>        STUN server for NAT probing
    // --public-address <ip>     Skip probing, report this public address
    // --identity <file>         Ed25519 key (PKCS#8); created if missing
    // --waiting-timeout <secs>  Give up negotiation after this long (0 = never)
    // --no-video / --no-audio   Disable a capture path
    // --json                    Status lines as JSON on stdout
    // --render                  Print received frames
    let mut config = SessionConfig::default();
    if let Some(v) = parse_arg(&args, "--acds-address") {
        config.acds_address = v;
    }
    config.acds_port = match parse_arg(&args, "--acds-port") {
        Some(v) => v.parse().map_err(|_| "Invalid --acds-port")?,
        None => DEFAULT_ACDS_PORT,
    };
    config.session_string = parse_arg(&args, "--join");
    config.password = parse_arg(&args, "--password");
    config.expose_ip_publicly = has_flag(&args, "--expose-ip");
    if let Some(v) = parse_arg(&args, "--host-port") {
        config.host_port = v.parse().map_err(|_| "Invalid --host-port")?;
    }
    if let Some(v) = parse_arg(&args, "--stun") {
        config.stun_server = v;
    }
    if let Some(v) = parse_arg(&args, "--waiting-timeout") {
        let secs: u64 = v.parse().map_err(|_| "Invalid --waiting-timeout")?;
        config.waiting_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    config.enable_video = !has_flag(&args, "--no-video");
    config.enable_audio = !has_flag(&args, "--no-audio");
    if let Some(path) = parse_arg(&args, "--identity") {
        config.identity = Some(Arc::new(load_identity(Path::new(&path))?));
    }

    let json = has_flag(&args, "--json");
    let render = has_flag(&args, "--render");

    log::info!("Session peer starting...");
    log::info!("  ACDS:   {}:{}", config.acds_address, config.acds_port);
    match &config.session_string {
        Some(s) => log::info!("  Join:   {}", s),
        None => log::info!("  Create: max {} participants", config.max_participants),
    }
    log::info!("  Host port: {}", config.host_port);
    log::info!(
        "  Identity:  {}",
        if config.identity.is_some() { "signed" } else { "anonymous" }
    );

    let mut session =
        DiscoverySession::new(config).with_events(Box::new(StatusEvents { json, render }));
    if let Some(addr) = parse_arg(&args, "--public-address") {
        session = session.with_prober(Box::new(StaticQuality::new(public_quality(addr))));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    session.start()?;

    while !shutdown.load(Ordering::Relaxed) && !session.state().is_terminal() {
        if let Err(e) = session.process(PROCESS_SLICE) {
            log::warn!("Session error: {}", e);
        }
    }

    let failed = session.state() == DiscoveryState::Failed;
    session.stop();
    if failed {
        return Err("session failed".into());
    }
    log::info!("Session ended");
    Ok(())
}

fn usage() {
    eprintln!(
        "Usage: peer-client [--acds-address HOST] [--acds-port PORT] [--join SESSION]\n\
         \x20                  [--password PW] [--expose-ip] [--host-port PORT]\n\
         \x20                  [--stun HOST:PORT] [--public-address IP] [--identity FILE]\n\
         \x20                  [--waiting-timeout SECS] [--no-video] [--no-audio]\n\
         \x20                  [--json] [--render]"
    );
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Load a PKCS#8 key, generating and saving one on first use
fn load_identity(path: &Path) -> Result<Identity, Box<dyn std::error::Error>> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        return Ok(Identity::from_pkcs8(&bytes)?);
    }
    let id = Identity::generate()?;
    std::fs::write(path, id.pkcs8())?;
    log::info!("Generated identity key at {}", path.display());
    Ok(id)
}

/// Operator-supplied quality for a host with a known public address
fn public_quality(address: String) -> NatQuality {
    NatQuality {
        has_public_ip: true,
        public_address: address,
        nat_type: NatType::Open,
        detection_complete: true,
        ..Default::default()
    }
}

// ============================================================================
// Status output
// ============================================================================

struct StatusEvents {
    json: bool,
    render: bool,
}

impl StatusEvents {
    fn emit(&self, value: serde_json::Value) {
        if self.json {
            println!("{}", value);
        }
    }
}

impl SessionEvents for StatusEvents {
    fn on_state_change(&mut self, old: DiscoveryState, new: DiscoveryState) {
        log::info!("State: {:?} -> {:?}", old, new);
        self.emit(serde_json::json!({
            "event": "state",
            "from": format!("{:?}", old),
            "to": format!("{:?}", new),
        }));
    }

    fn on_session_ready(&mut self, session_string: &str) {
        log::info!("Session string: {}", session_string);
        self.emit(serde_json::json!({ "event": "session", "session_string": session_string }));
    }

    fn on_role(&mut self, is_host: bool) {
        log::info!("Role: {}", if is_host { "host" } else { "participant" });
        self.emit(serde_json::json!({ "event": "role", "host": is_host }));
    }

    fn on_frame(&mut self, text: &str) {
        if self.render && !self.json {
            // Home the cursor and redraw in place
            print!("\x1b[H{}", text);
        }
    }

    fn on_error(&mut self, error: &Error) {
        log::error!("{}", error);
        self.emit(serde_json::json!({ "event": "error", "message": error.to_string() }));
    }
}
