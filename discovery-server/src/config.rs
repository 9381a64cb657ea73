//! Server configuration
//!
//! Defaults, then an optional JSON file (`--config`), then CLI flags.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use session_core::protocol::DEFAULT_ACDS_PORT;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TurnServerConfig {
    pub url: String,
}

/// Requests allowed per IP in one rate-limit window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub window_secs: u64,
    pub create: u32,
    pub lookup: u32,
    pub join: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            window_secs: 60,
            create: 10,
            lookup: 30,
            join: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Handed to every creator in `SessionCreated`
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServerConfig>,
    /// Shared secret for time-limited TURN credentials; none disables TURN
    pub turn_secret: Option<String>,
    pub turn_credential_ttl_secs: u64,
    /// Reject create/join without a valid Ed25519 signature
    pub require_server_identity: bool,
    pub session_ttl_secs: u64,
    pub migration_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    /// How often metrics are logged; 0 disables
    pub metrics_log_interval_secs: u64,
    pub rate_limits: RateLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_ACDS_PORT,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            turn_secret: None,
            turn_credential_ttl_secs: 24 * 60 * 60,
            require_server_identity: false,
            session_ttl_secs: 24 * 60 * 60,
            migration_timeout_secs: 30,
            cleanup_interval_secs: 60,
            metrics_log_interval_secs: 300,
            rate_limits: RateLimits::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read(String, std::io::Error),
    Parse(String),
    InvalidFlag(String, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(path, e) => write!(f, "cannot read config {}: {}", path, e),
            ConfigError::Parse(msg) => write!(f, "invalid config: {}", msg),
            ConfigError::InvalidFlag(flag, value) => {
                write!(f, "invalid value '{}' for {}", value, flag)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Loading
// ============================================================================

impl ServerConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_string(), e))?;
        Self::from_json(&text)
    }

    /// Build from `--config` (if given) with the remaining flags on top
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = match parse_arg(args, "--config") {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_args(args)?;
        Ok(config)
    }

    pub fn apply_args(&mut self, args: &[String]) -> Result<(), ConfigError> {
        if let Some(v) = parse_arg(args, "--bind") {
            self.bind_address = v;
        }
        if let Some(v) = parse_arg(args, "--port") {
            self.port = parse_num("--port", &v)?;
        }
        if let Some(v) = parse_arg(args, "--stun") {
            self.stun_servers = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = parse_arg(args, "--turn") {
            self.turn_servers = v
                .split(',')
                .map(|s| TurnServerConfig {
                    url: s.trim().to_string(),
                })
                .collect();
        }
        if let Some(v) = parse_arg(args, "--turn-secret") {
            self.turn_secret = Some(v);
        }
        if let Some(v) = parse_arg(args, "--session-ttl") {
            self.session_ttl_secs = parse_num("--session-ttl", &v)?;
        }
        if args.iter().any(|a| a == "--require-identity") {
            self.require_server_identity = true;
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

pub fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_num<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidFlag(flag.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.port, 27225);
        assert_eq!(c.rate_limits.create, 10);
        assert_eq!(c.rate_limits.lookup, 30);
        assert_eq!(c.rate_limits.join, 20);
        assert_eq!(c.session_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let c = ServerConfig::from_json(
            r#"{ "port": 9443, "turn_secret": "s3cret", "rate_limits": { "join": 5 } }"#,
        )
        .unwrap();
        assert_eq!(c.port, 9443);
        assert_eq!(c.turn_secret.as_deref(), Some("s3cret"));
        assert_eq!(c.rate_limits.join, 5);
        assert_eq!(c.rate_limits.create, 10);
        assert_eq!(c.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            ServerConfig::from_json("{ port: }"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_flags_override() {
        let mut c = ServerConfig::default();
        c.apply_args(&args(&[
            "discovery-server",
            "--port",
            "4000",
            "--stun",
            "stun:a:1, stun:b:2",
            "--require-identity",
        ]))
        .unwrap();
        assert_eq!(c.port, 4000);
        assert_eq!(c.stun_servers, vec!["stun:a:1", "stun:b:2"]);
        assert!(c.require_server_identity);
    }

    #[test]
    fn test_bad_port_flag() {
        let mut c = ServerConfig::default();
        assert!(c.apply_args(&args(&["x", "--port", "99999"])).is_err());
    }
}
