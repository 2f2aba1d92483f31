//! Gateway configuration: CLI flags (process bootstrap) plus an optional
//! TOML file and host-supplied overrides.
//!
//! TOML is optional; every field defaults the same way the host's own
//! config notification would. Validation happens once, eagerly, at
//! startup — a bad CIDR or malformed `long_running_gcodes` entry is a hard
//! config error and the process exits non-zero before binding any socket.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "moonraker-gateway")]
pub struct CliArgs {
    /// Address to bind the HTTP/WS listener to.
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    pub address: String,
    /// Port to bind the HTTP/WS listener to.
    #[arg(short = 'p', long, default_value_t = 7125)]
    pub port: u16,
    /// Unix socket path the host connects to.
    #[arg(short = 's', long, default_value = "/tmp/moonraker")]
    pub socket_file: PathBuf,
    /// Log file path.
    #[arg(short = 'l', long, default_value = "/tmp/moonraker.log")]
    pub log_file: PathBuf,
    /// Optional TOML config file.
    #[arg(short = 'c', long)]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key_path: PathBuf,
    pub require_auth: bool,
    pub enable_cors: bool,
    pub trusted_clients: Vec<TrustedSubnet>,
    pub request_timeout: f64,
    pub long_running_gcodes: HashMap<String, f64>,
    pub long_running_requests: HashMap<String, f64>,
    pub status_tiers: [Vec<String>; 6],
    pub tick_time: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key_path: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            require_auth: true,
            enable_cors: false,
            trusted_clients: Vec::new(),
            request_timeout: 5.0,
            long_running_gcodes: HashMap::new(),
            long_running_requests: HashMap::new(),
            status_tiers: Default::default(),
            tick_time: 0.25,
        }
    }
}

/// A validated `x.x.x.0/24` subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedSubnet {
    network: [u8; 3],
}

impl TrustedSubnet {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (addr_part, prefix_part) = raw
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidValue(format!("'{raw}' is not CIDR notation")))?;
        if prefix_part != "24" {
            return Err(ConfigError::InvalidValue(format!(
                "'{raw}': only /24 trusted subnets are supported"
            )));
        }
        let addr: Ipv4Addr = addr_part
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("'{raw}': invalid IPv4 address")))?;
        let octets = addr.octets();
        if octets[3] != 0 {
            return Err(ConfigError::InvalidValue(format!(
                "'{raw}': host octet must be 0 for a /24"
            )));
        }
        Ok(Self {
            network: [octets[0], octets[1], octets[2]],
        })
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let octets = addr.octets();
        octets[0] == self.network[0] && octets[1] == self.network[1] && octets[2] == self.network[2]
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(String),
    #[error("parsing config file: {0}")]
    Parse(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    api_key_path: Option<String>,
    require_auth: Option<bool>,
    enable_cors: Option<bool>,
    trusted_clients: Option<Vec<String>>,
    request_timeout: Option<f64>,
    long_running_gcodes: Option<Vec<RawTimeoutEntry>>,
    long_running_requests: Option<Vec<RawTimeoutEntry>>,
    status_tier_1: Option<Vec<String>>,
    status_tier_2: Option<Vec<String>>,
    status_tier_3: Option<Vec<String>>,
    status_tier_4: Option<Vec<String>>,
    status_tier_5: Option<Vec<String>>,
    status_tier_6: Option<Vec<String>>,
    tick_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTimeoutEntry {
    name: String,
    seconds: f64,
}

pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("'{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    merge_config(&GatewayConfig::default(), raw)
}

/// Apply the host's `register_config` notification on top of the
/// file/CLI-loaded config for the remainder of this host session: the
/// overlay is never persisted back to the file. Any field the host omits
/// keeps its current value rather than reverting to the built-in default.
pub fn apply_host_config(base: &GatewayConfig, params: serde_json::Value) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = serde_json::from_value(params).map_err(|e| ConfigError::Parse(e.to_string()))?;
    merge_config(base, raw)
}

/// Build a full config by overlaying `raw`'s present fields onto `base`,
/// falling back to `base`'s existing value for every field `raw` leaves unset.
fn merge_config(base: &GatewayConfig, raw: RawConfig) -> Result<GatewayConfig, ConfigError> {
    let api_key_path = raw
        .api_key_path
        .map(PathBuf::from)
        .unwrap_or_else(|| base.api_key_path.clone());

    let trusted_clients = match raw.trusted_clients {
        Some(entries) => entries
            .iter()
            .map(|entry| TrustedSubnet::parse(entry))
            .collect::<Result<Vec<_>, _>>()?,
        None => base.trusted_clients.clone(),
    };

    let long_running_gcodes = raw
        .long_running_gcodes
        .map(normalize_timeouts)
        .unwrap_or_else(|| base.long_running_gcodes.clone());
    let long_running_requests = raw
        .long_running_requests
        .map(normalize_timeouts)
        .unwrap_or_else(|| base.long_running_requests.clone());

    let status_tiers = [
        raw.status_tier_1.unwrap_or_else(|| base.status_tiers[0].clone()),
        raw.status_tier_2.unwrap_or_else(|| base.status_tiers[1].clone()),
        raw.status_tier_3.unwrap_or_else(|| base.status_tiers[2].clone()),
        raw.status_tier_4.unwrap_or_else(|| base.status_tiers[3].clone()),
        raw.status_tier_5.unwrap_or_else(|| base.status_tiers[4].clone()),
        raw.status_tier_6.unwrap_or_else(|| base.status_tiers[5].clone()),
    ];

    Ok(GatewayConfig {
        api_key_path,
        require_auth: raw.require_auth.unwrap_or(base.require_auth),
        enable_cors: raw.enable_cors.unwrap_or(base.enable_cors),
        trusted_clients,
        request_timeout: raw.request_timeout.unwrap_or(base.request_timeout),
        long_running_gcodes,
        long_running_requests,
        status_tiers,
        tick_time: raw.tick_time.unwrap_or(base.tick_time),
    })
}

fn normalize_timeouts(entries: Vec<RawTimeoutEntry>) -> HashMap<String, f64> {
    entries
        .into_iter()
        .map(|e| (e.name.to_uppercase(), e.seconds))
        .collect()
}

/// Parse the first whitespace-delimited token of a gcode script and look it
/// up (case-insensitively) in `long_running_gcodes`.
pub fn gcode_timeout_override(config: &GatewayConfig, script: &str) -> Option<f64> {
    let token = script.split_whitespace().next()?;
    config.long_running_gcodes.get(&token.to_uppercase()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_subnet_accepts_dot_zero_slash_24() {
        let s = TrustedSubnet::parse("192.168.1.0/24").unwrap();
        assert!(s.contains("192.168.1.42".parse().unwrap()));
        assert!(!s.contains("192.168.2.1".parse().unwrap()));
    }

    #[test]
    fn trusted_subnet_rejects_non_zero_host_octet() {
        assert!(TrustedSubnet::parse("192.168.1.5/24").is_err());
    }

    #[test]
    fn trusted_subnet_rejects_other_prefix_lengths() {
        assert!(TrustedSubnet::parse("192.168.1.0/16").is_err());
    }

    #[test]
    fn load_config_from_str_applies_defaults() {
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg.request_timeout, 5.0);
        assert_eq!(cfg.tick_time, 0.25);
        assert!(cfg.require_auth);
    }

    #[test]
    fn load_config_from_str_parses_long_running_gcodes() {
        let toml_str = r#"
            [[long_running_gcodes]]
            name = "bed_mesh_calibrate"
            seconds = 120.0
        "#;
        let cfg = load_config_from_str(toml_str).unwrap();
        assert_eq!(
            cfg.long_running_gcodes.get("BED_MESH_CALIBRATE").copied(),
            Some(120.0)
        );
    }

    #[test]
    fn gcode_timeout_override_matches_first_token_case_insensitively() {
        let mut cfg = GatewayConfig::default();
        cfg.long_running_gcodes.insert("M109".to_owned(), 300.0);
        assert_eq!(gcode_timeout_override(&cfg, "m109 S60"), Some(300.0));
        assert_eq!(gcode_timeout_override(&cfg, "G28"), None);
        assert_eq!(gcode_timeout_override(&cfg, "   "), None);
    }

    #[test]
    fn load_config_from_str_rejects_bad_cidr() {
        let toml_str = r#"trusted_clients = ["10.0.0.5/24"]"#;
        assert!(load_config_from_str(toml_str).is_err());
    }

    #[test]
    fn apply_host_config_overrides_only_present_fields() {
        let mut base = GatewayConfig::default();
        base.request_timeout = 5.0;
        base.tick_time = 0.25;
        let params = serde_json::json!({"tick_time": 0.1});
        let merged = apply_host_config(&base, params).unwrap();
        assert_eq!(merged.tick_time, 0.1);
        assert_eq!(merged.request_timeout, 5.0, "fields the host omits keep their current value");
    }

    #[test]
    fn apply_host_config_rejects_bad_cidr_without_mutating_base() {
        let base = GatewayConfig::default();
        let params = serde_json::json!({"trusted_clients": ["10.0.0.5/24"]});
        assert!(apply_host_config(&base, params).is_err());
    }
}
