// src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use ipnet::IpNet;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::access::AccessLevel;
use crate::config::FileConfig;

const DEFAULT_PORT: u16 = 8787;
const DEFAULT_RATE_LIMIT: usize = 60;
const DEFAULT_PAIR_RATE_LIMIT: usize = 10;
const DEFAULT_TRUSTED_NETWORK: &str = "100.64.0.0/10";
const DEFAULT_MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_LOCAL_MODEL: &str = "llama3.2";

/// All non-secret gateway configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind host (BIND_HOST, or 127.0.0.1 when TORBO_LOOPBACK_ONLY is set)
    pub bind_host: String,
    /// Bind port (TORBO_PORT)
    pub port: u16,
    /// Global access level ceiling (TORBO_ACCESS_LEVEL, default FULL)
    pub global_level: AccessLevel,
    /// Requests per minute per client IP (RATE_LIMIT_PER_MINUTE)
    pub rate_limit_per_minute: usize,
    /// Independent per-IP limit for the open pairing endpoints
    pub pair_rate_limit_per_minute: usize,
    /// CIDR from which auto-pairing is permitted (TRUSTED_NETWORK_CIDR)
    pub trusted_network: IpNet,
    /// Hostname/IP reported to authenticated health callers
    pub trusted_hostname: Option<String>,
    pub trusted_ip: Option<String>,
    /// Origins allowed by the CORS validator (ALLOWED_ORIGINS, comma-separated)
    pub allowed_origins: Vec<String>,
    /// Root directory for file tools (SANDBOX_ROOT)
    pub sandbox_root: PathBuf,
    /// Commands the shell tool may run (ALLOWED_COMMANDS, comma-separated)
    pub allowed_commands: Vec<String>,
    /// Reject URLs resolving to private ranges (SSRF_PROTECTION, default on)
    pub ssrf_protection: bool,
    /// State directory for persisted stores (TORBO_DATA_DIR, default ~/.torbo)
    pub data_dir: PathBuf,
    /// Optional audit file sink (TORBO_AUDIT_FILE)
    pub audit_file: Option<PathBuf>,
    /// Maximum request body size in bytes
    pub max_request_bytes: usize,
    /// Model used when neither the request nor the agent names one
    pub default_model: String,
    /// Small local model used for background summarization
    pub summarizer_model: String,
    /// Server-configured system prompt injected when the client supplies none
    pub system_prompt: Option<String>,
}

impl GatewayConfig {
    /// Load configuration from environment variables, overlaying the
    /// optional ~/.torbo/config.toml file for prompt/model preferences.
    pub fn load() -> Self {
        let file = FileConfig::load();

        let loopback_only = parse_bool_env("TORBO_LOOPBACK_ONLY").unwrap_or(false);
        let bind_host = if loopback_only {
            "127.0.0.1".to_string()
        } else {
            read_var("BIND_HOST").unwrap_or_else(|| "0.0.0.0".to_string())
        };

        let port = read_var("TORBO_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let global_level = read_var("TORBO_ACCESS_LEVEL")
            .and_then(|s| s.parse::<u8>().ok())
            .and_then(AccessLevel::from_u8)
            .unwrap_or(AccessLevel::Full);

        let trusted_network = read_var("TRUSTED_NETWORK_CIDR")
            .and_then(|s| match s.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!(cidr = %s, error = %e, "Invalid TRUSTED_NETWORK_CIDR, using default");
                    None
                }
            })
            .unwrap_or_else(|| {
                DEFAULT_TRUSTED_NETWORK
                    .parse()
                    .expect("default trusted network CIDR parses")
            });

        let data_dir = read_var("TORBO_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".torbo")
        });

        let sandbox_root = read_var("SANDBOX_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("sandbox"));

        let allowed_commands = read_var("ALLOWED_COMMANDS")
            .map(|s| split_csv(&s))
            .unwrap_or_else(|| {
                ["ls", "cat", "head", "date", "uname", "df"]
                    .iter()
                    .map(|c| c.to_string())
                    .collect()
            });

        let config = Self {
            bind_host,
            port,
            global_level,
            rate_limit_per_minute: read_var("RATE_LIMIT_PER_MINUTE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RATE_LIMIT),
            pair_rate_limit_per_minute: read_var("PAIR_RATE_LIMIT_PER_MINUTE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PAIR_RATE_LIMIT),
            trusted_network,
            trusted_hostname: read_var("TAILSCALE_HOSTNAME"),
            trusted_ip: read_var("TAILSCALE_IP"),
            allowed_origins: read_var("ALLOWED_ORIGINS")
                .map(|s| split_csv(&s))
                .unwrap_or_default(),
            sandbox_root,
            allowed_commands,
            ssrf_protection: parse_bool_env("SSRF_PROTECTION").unwrap_or(true),
            data_dir,
            audit_file: read_var("TORBO_AUDIT_FILE").map(PathBuf::from),
            max_request_bytes: read_var("TORBO_MAX_REQUEST_BYTES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_REQUEST_BYTES),
            default_model: file
                .default_model
                .or_else(|| read_var("TORBO_DEFAULT_MODEL"))
                .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string()),
            summarizer_model: file
                .summarizer_model
                .or_else(|| read_var("TORBO_SUMMARIZER_MODEL"))
                .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string()),
            system_prompt: file.system_prompt.or_else(|| read_var("TORBO_SYSTEM_PROMPT")),
        };

        info!(
            host = %config.bind_host,
            port = config.port,
            level = %config.global_level,
            "Gateway configuration loaded"
        );
        config
    }

    /// Whether an Origin header passes the CORS validator. An empty
    /// allowlist admits only the gateway's own localhost origins.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        if self.allowed_origins.is_empty() {
            return origin.starts_with("http://localhost")
                || origin.starts_with("http://127.0.0.1");
        }
        self.allowed_origins.iter().any(|o| o == origin)
    }

    /// Construct a config programmatically (embedding, tests) without
    /// touching the environment.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            bind_host: "127.0.0.1".into(),
            port: 0,
            global_level: AccessLevel::Full,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT,
            pair_rate_limit_per_minute: DEFAULT_PAIR_RATE_LIMIT,
            trusted_network: DEFAULT_TRUSTED_NETWORK
                .parse()
                .expect("default trusted network CIDR parses"),
            trusted_hostname: None,
            trusted_ip: None,
            allowed_origins: Vec::new(),
            sandbox_root: data_dir.join("sandbox"),
            allowed_commands: vec!["echo".into(), "date".into()],
            ssrf_protection: true,
            data_dir,
            audit_file: None,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            default_model: DEFAULT_LOCAL_MODEL.into(),
            summarizer_model: DEFAULT_LOCAL_MODEL.into(),
            system_prompt: None,
        }
    }
}

fn read_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

pub fn parse_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?.to_lowercase();
    match value.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
