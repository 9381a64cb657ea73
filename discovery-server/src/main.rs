//! ACDS discovery server binary

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use discovery_server::{Server, ServerConfig};
use signal_hook::consts::{SIGINT, SIGTERM};

fn usage() {
    eprintln!(
        "Usage: discovery-server [--config FILE] [--bind ADDR] [--port PORT]\n\
         \x20                       [--stun URL,..] [--turn URL,..] [--turn-secret SECRET]\n\
         \x20                       [--session-ttl SECS] [--require-identity]"
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        usage();
        return Ok(());
    }

    let config = ServerConfig::from_args(&args)?;

    log::info!("ACDS discovery server starting...");
    log::info!("  Bind: {}:{}", config.bind_address, config.port);
    log::info!("  STUN: {:?}", config.stun_servers);
    log::info!(
        "  TURN: {} server(s), credentials {}",
        config.turn_servers.len(),
        if config.turn_secret.is_some() { "on" } else { "off" }
    );
    log::info!(
        "  Identity signatures: {}",
        if config.require_server_identity {
            "required"
        } else {
            "optional"
        }
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let mut server = Server::bind(config)?;
    server.run(&shutdown)?;

    log::info!("Discovery server stopped");
    Ok(())
}
