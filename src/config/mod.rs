//! Configuration module - environment variable parsing
//!
//! Everything has a default so the proxy runs with an empty environment;
//! defaults mirror a small public-facing deployment.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Per-resource-class rate-limit capacities, all sharing one refill rate
#[derive(Clone, Debug)]
pub struct RateLimits {
    /// Tokens refilled per minute into every bucket
    pub refills_per_min: u32,
    pub http: u32,
    pub ws: u32,
    pub motd: u32,
    pub skins: u32,
    pub skins_ip: u32,
    pub connect: u32,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Directory holding persisted skin records
    pub skin_cache_dir: PathBuf,
    /// How long a cached skin lives, in milliseconds
    pub skin_lifetime_ms: u64,
    /// How often the cache sweeps expired records, in milliseconds
    pub skin_prune_interval_ms: u64,
    /// Largest accepted skin payload, in bytes
    pub max_skin_bytes: usize,

    /// Rate-limit capacities per resource class
    pub ratelimits: RateLimits,

    /// Allowed skin-source hosts; `None` allows all
    pub origin_whitelist: Option<Vec<String>>,
    /// Denied skin-source hosts
    pub origin_blacklist: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT; fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            skin_cache_dir: env::var("SKIN_CACHE_DIR")
                .unwrap_or_else(|_| "skin_cache".to_string())
                .into(),
            skin_lifetime_ms: parsed_var("SKIN_CACHE_LIFETIME_MS", 60 * 60 * 1000)?,
            skin_prune_interval_ms: parsed_var("SKIN_CACHE_PRUNE_INTERVAL_MS", 10 * 60 * 1000)?,
            max_skin_bytes: parsed_var("MAX_SKIN_BYTES", 1024 * 1024)?,

            ratelimits: RateLimits {
                refills_per_min: parsed_var("RATELIMIT_REFILLS_PER_MIN", 10)?,
                http: parsed_var("RATELIMIT_HTTP", 100)?,
                ws: parsed_var("RATELIMIT_WS", 100)?,
                motd: parsed_var("RATELIMIT_MOTD", 100)?,
                skins: parsed_var("RATELIMIT_SKINS", 1000)?,
                skins_ip: parsed_var("RATELIMIT_SKINS_IP", 10000)?,
                connect: parsed_var("RATELIMIT_CONNECT", 100)?,
            },

            origin_whitelist: host_list(env::var("ORIGIN_WHITELIST").ok()),
            origin_blacklist: host_list(env::var("ORIGIN_BLACKLIST").ok()).unwrap_or_default(),
        })
    }
}

/// Parse an env var into `T`, falling back to `default` when unset.
fn parsed_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Comma-separated host list; unset or empty means "no list".
fn host_list(raw: Option<String>) -> Option<Vec<String>> {
    let raw = raw?;
    let hosts: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if hosts.is_empty() {
        None
    } else {
        Some(hosts)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Environment variable {0} could not be parsed")]
    Invalid(&'static str),
}
