//! Broker configuration parsing from .mdbrokerrc and the environment
//!
//! Recognised keys (environment variables of the same name override the file):
//! - MDP_HEARTBEAT_INTERVAL=milliseconds
//! - MDP_HEARTBEAT_LIVENESS=count
//! - MDP_CLIENT_TIMEOUT=seconds (0 keeps idle clients forever)
//! - MDP_ENDPOINTS="tcp://*:5555 ipc:///tmp/broker.sock"
//! - MDP_RBAC_ROLES="ADMIN OPERATOR USER" (highest priority first)
//! - MDP_SERVICE_QUEUE_CAPACITY=count (0 = unbounded)
//! - MDP_INTERNAL_THREADS=count

use crate::broker::rbac::RbacRoleSet;
use crate::broker::transport::Endpoint;
use crate::error::BrokerError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);

/// Default number of missed heartbeats before a peer is declared dead
pub const DEFAULT_HEARTBEAT_LIVENESS: u32 = 3;

/// Default listener
pub const DEFAULT_ENDPOINT: &str = "tcp://*:5555";

/// Default RBAC roles, highest priority first
pub const DEFAULT_ROLES: [&str; 3] = ["ADMIN", "OPERATOR", "USER"];

/// Complete broker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Interval between heartbeats to idle workers
    pub heartbeat_interval: Duration,
    /// Missed heartbeats tolerated before a worker is purged
    pub heartbeat_liveness: u32,
    /// Idle time before a client is purged (zero = never)
    pub client_timeout: Duration,
    /// Endpoints to bind
    pub endpoints: Vec<String>,
    /// RBAC roles, rank = index
    pub rbac_roles: Vec<String>,
    /// Pending requests allowed per service (zero = unbounded)
    pub service_queue_capacity: usize,
    /// Default thread count for internal services
    pub internal_threads: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_liveness: DEFAULT_HEARTBEAT_LIVENESS,
            client_timeout: Duration::ZERO,
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            rbac_roles: DEFAULT_ROLES.iter().map(|r| r.to_string()).collect(),
            service_queue_capacity: 0,
            internal_threads: num_cpus::get().max(1),
        }
    }
}

impl BrokerConfig {
    /// Load ~/.mdbrokerrc, then apply environment overrides
    pub fn load() -> Self {
        let mut config = Self::from_file(&Self::rc_path()).unwrap_or_default();
        config.apply_env(std::env::vars());
        config
    }

    /// Get the path to .mdbrokerrc
    pub fn rc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mdbrokerrc")
    }

    /// Per-user ipc endpoint, e.g. `ipc:///tmp/mdbroker-alice.sock`
    pub fn default_ipc_endpoint() -> String {
        format!("ipc:///tmp/mdbroker-{}.sock", whoami::username())
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    ///
    /// Unparseable values are skipped and the default kept.
    pub fn parse(content: &str) -> Self {
        let mut config = BrokerConfig::default();

        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            if let Some((key, value)) = parse_assignment(line) {
                config.apply(&key, &unquote(&value));
            }
        }

        config
    }

    /// Apply `MDP_*` overrides from an environment listing
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if key.starts_with("MDP_") {
                self.apply(&key, &value);
            }
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        let value = value.trim();
        match key {
            "MDP_HEARTBEAT_INTERVAL" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.heartbeat_interval = Duration::from_millis(ms);
                }
            }
            "MDP_HEARTBEAT_LIVENESS" => {
                if let Ok(count) = value.parse::<u32>() {
                    self.heartbeat_liveness = count;
                }
            }
            "MDP_CLIENT_TIMEOUT" => {
                if let Ok(secs) = value.parse::<u64>() {
                    self.client_timeout = Duration::from_secs(secs);
                }
            }
            "MDP_ENDPOINTS" => {
                self.endpoints = value.split_whitespace().map(str::to_string).collect();
            }
            "MDP_RBAC_ROLES" => {
                self.rbac_roles = value.split_whitespace().map(str::to_string).collect();
            }
            "MDP_SERVICE_QUEUE_CAPACITY" => {
                if let Ok(capacity) = value.parse::<usize>() {
                    self.service_queue_capacity = capacity;
                }
            }
            "MDP_INTERNAL_THREADS" => {
                if let Ok(threads) = value.parse::<usize>() {
                    self.internal_threads = threads;
                }
            }
            _ => {}
        }
    }

    /// Reject values the broker cannot run with
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("MDP_HEARTBEAT_INTERVAL", "must be greater than zero"));
        }
        if self.heartbeat_liveness == 0 {
            return Err(invalid("MDP_HEARTBEAT_LIVENESS", "must be at least 1"));
        }
        if self.internal_threads == 0 {
            return Err(invalid("MDP_INTERNAL_THREADS", "must be at least 1"));
        }
        for endpoint in &self.endpoints {
            endpoint.parse::<Endpoint>()?;
        }
        Ok(())
    }

    /// How long a worker stays alive without a heartbeat
    pub fn worker_expiry(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_liveness
    }

    /// How long an idle client is kept, if it is ever purged
    pub fn client_expiry(&self) -> Option<Duration> {
        if self.client_timeout.is_zero() {
            None
        } else {
            Some(self.client_timeout)
        }
    }

    /// Ordered RBAC role set
    pub fn role_set(&self) -> RbacRoleSet {
        RbacRoleSet::new(self.rbac_roles.iter().cloned())
    }
}

fn invalid(key: &str, reason: &str) -> BrokerError {
    BrokerError::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }

    s.to_string()
}
