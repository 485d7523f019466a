//! Recognized configuration surface
//!
//! The config-file parser is an external collaborator; this module holds
//! the options the supervision core acts on, with library defaults,
//! environment overrides and a builder.
//!
//! # Configuration priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`KESTREL_*`)
//! 3. Library defaults

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// One listening pool as far as the core is concerned: a name and an
/// address. Server selection behind the pool is external.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    pub listen: SocketAddr,
}

impl PoolConfig {
    pub fn new(name: &str, listen: SocketAddr) -> Self {
        PoolConfig {
            name: name.to_string(),
            listen,
        }
    }
}

/// Options recognized by the supervisor and worker loops.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Number of worker processes to keep alive
    pub worker_processes: usize,
    /// Graceful-drain deadline in seconds
    pub worker_shutdown_timeout: u64,
    /// User name for privilege drop when started as root
    pub user: Option<String>,
    /// Numeric uid for privilege drop
    pub uid: Option<u32>,
    /// Numeric gid for privilege drop
    pub gid: Option<u32>,
    /// Telemetry listener address
    pub stats_addr: String,
    /// Telemetry listener port
    pub stats_port: u16,
    /// Sampler interval in milliseconds
    pub stats_interval_ms: u64,
    /// Reactor readiness-buffer size and initial fd-map capacity
    pub max_events: usize,
    /// Log file path; stderr when unset
    pub log_file: Option<PathBuf>,
    /// Listening pools
    pub pools: Vec<PoolConfig>,
}

mod defaults {
    pub const WORKER_PROCESSES: usize = 2;
    pub const WORKER_SHUTDOWN_TIMEOUT: u64 = 30;
    pub const STATS_ADDR: &str = "0.0.0.0";
    pub const STATS_PORT: u16 = 22222;
    pub const STATS_INTERVAL_MS: u64 = 30_000;
    pub const MAX_EVENTS: usize = 1024;
}

fn env_get<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.parse().unwrap_or(default),
        Err(_) => default,
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyConfig {
    /// Create config with library defaults (no env override).
    pub fn new() -> Self {
        ProxyConfig {
            worker_processes: defaults::WORKER_PROCESSES,
            worker_shutdown_timeout: defaults::WORKER_SHUTDOWN_TIMEOUT,
            user: None,
            uid: None,
            gid: None,
            stats_addr: defaults::STATS_ADDR.to_string(),
            stats_port: defaults::STATS_PORT,
            stats_interval_ms: defaults::STATS_INTERVAL_MS,
            max_events: defaults::MAX_EVENTS,
            log_file: None,
            pools: Vec::new(),
        }
    }

    /// Create config from defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `KESTREL_WORKER_PROCESSES` - worker pool size
    /// - `KESTREL_WORKER_SHUTDOWN_TIMEOUT` - drain deadline, seconds
    /// - `KESTREL_USER` / `KESTREL_UID` / `KESTREL_GID` - privilege drop
    /// - `KESTREL_STATS_ADDR` / `KESTREL_STATS_PORT` - telemetry listener
    /// - `KESTREL_STATS_INTERVAL_MS` - sampler interval
    /// - `KESTREL_MAX_EVENTS` - reactor event-buffer size
    /// - `KESTREL_LOG_FILE` - log sink path
    /// - `KESTREL_POOLS` - `name=ip:port[,name=ip:port…]`
    pub fn from_env() -> Self {
        let mut cfg = Self::new();
        cfg.worker_processes =
            env_get("KESTREL_WORKER_PROCESSES", cfg.worker_processes);
        cfg.worker_shutdown_timeout = env_get(
            "KESTREL_WORKER_SHUTDOWN_TIMEOUT",
            cfg.worker_shutdown_timeout,
        );
        if let Ok(user) = std::env::var("KESTREL_USER") {
            cfg.user = Some(user);
        }
        if let Ok(uid) = std::env::var("KESTREL_UID") {
            cfg.uid = uid.parse().ok();
        }
        if let Ok(gid) = std::env::var("KESTREL_GID") {
            cfg.gid = gid.parse().ok();
        }
        cfg.stats_addr = env_get("KESTREL_STATS_ADDR", cfg.stats_addr);
        cfg.stats_port = env_get("KESTREL_STATS_PORT", cfg.stats_port);
        cfg.stats_interval_ms =
            env_get("KESTREL_STATS_INTERVAL_MS", cfg.stats_interval_ms);
        cfg.max_events = env_get("KESTREL_MAX_EVENTS", cfg.max_events);
        if let Ok(path) = std::env::var("KESTREL_LOG_FILE") {
            cfg.log_file = Some(PathBuf::from(path));
        }
        if let Ok(spec) = std::env::var("KESTREL_POOLS") {
            if let Ok(pools) = parse_pools(&spec) {
                cfg.pools = pools;
            }
        }
        cfg
    }

    // Builder methods

    pub fn worker_processes(mut self, n: usize) -> Self {
        self.worker_processes = n;
        self
    }

    pub fn worker_shutdown_timeout(mut self, secs: u64) -> Self {
        self.worker_shutdown_timeout = secs;
        self
    }

    pub fn user(mut self, user: &str, uid: u32, gid: u32) -> Self {
        self.user = Some(user.to_string());
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn stats_listener(mut self, addr: &str, port: u16) -> Self {
        self.stats_addr = addr.to_string();
        self.stats_port = port;
        self
    }

    pub fn stats_interval_ms(mut self, ms: u64) -> Self {
        self.stats_interval_ms = ms;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pools.push(pool);
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_processes == 0 {
            return Err(ConfigError::InvalidValue("worker_processes must be > 0"));
        }
        if self.worker_processes > 512 {
            return Err(ConfigError::InvalidValue("worker_processes must be <= 512"));
        }
        if self.worker_shutdown_timeout == 0 {
            return Err(ConfigError::InvalidValue(
                "worker_shutdown_timeout must be >= 1",
            ));
        }
        if self.stats_interval_ms < 10 {
            return Err(ConfigError::InvalidValue("stats_interval_ms must be >= 10"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.pools.is_empty() {
            return Err(ConfigError::InvalidValue("at least one pool is required"));
        }
        for (i, p) in self.pools.iter().enumerate() {
            for q in &self.pools[i + 1..] {
                if p.name == q.name {
                    return Err(ConfigError::InvalidValue("pool names must be unique"));
                }
                if p.listen == q.listen {
                    return Err(ConfigError::InvalidValue(
                        "pool listen addresses must be unique",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Parse a `name=ip:port[,name=ip:port…]` pool list.
pub fn parse_pools(spec: &str) -> Result<Vec<PoolConfig>, ConfigError> {
    let mut pools = Vec::new();
    for item in spec.split(',').filter(|s| !s.trim().is_empty()) {
        let (name, addr) = item
            .split_once('=')
            .ok_or(ConfigError::InvalidValue("pool spec must be name=ip:port"))?;
        let listen: SocketAddr = addr
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue("pool address must be ip:port"))?;
        pools.push(PoolConfig::new(name.trim(), listen));
    }
    Ok(pools)
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
    Load(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
            ConfigError::Load(msg) => write!(f, "config load failed: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
