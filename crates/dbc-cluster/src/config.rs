//! Cluster configuration management

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Default connection and info request timeout
pub const DEFAULT_CONN_TIMEOUT_MS: u64 = 1000;

/// Default and minimum interval between tend cycles
pub const MIN_TEND_INTERVAL_MS: u64 = 1000;

/// Default idle socket pool capacity per node
pub const DEFAULT_MAX_CONNS_PER_NODE: usize = 300;

/// A seed or peer host as configured or learned from the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    /// Hostname or IP address
    pub name: String,

    /// Service port
    pub port: u16,
}

impl Host {
    pub fn new<T: Into<String>>(name: T, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// User credentials presented on every new connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password_hash: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password_hash", &"<redacted>")
            .finish()
    }
}

/// Main cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Seed hosts used to bootstrap discovery
    pub hosts: Vec<Host>,

    /// Optional user name
    pub user: Option<String>,

    /// Hash of the user's password, as expected by the server
    pub password_hash: Option<String>,

    /// Connection and info request timeout in milliseconds (0 selects the default)
    pub conn_timeout_ms: u64,

    /// Interval between tend cycles in milliseconds (clamped to the minimum)
    pub tend_interval_ms: u64,

    /// Maximum idle connections kept per node
    pub max_conns_per_node: usize,

    /// Fail cluster creation if no seed can be reached
    pub fail_if_not_connected: bool,

    /// Address translation applied to every looked up host name
    pub ip_map: HashMap<String, String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: vec![],
            user: None,
            password_hash: None,
            conn_timeout_ms: DEFAULT_CONN_TIMEOUT_MS,
            tend_interval_ms: MIN_TEND_INTERVAL_MS,
            max_conns_per_node: DEFAULT_MAX_CONNS_PER_NODE,
            fail_if_not_connected: true,
            ip_map: HashMap::new(),
        }
    }
}

impl ClusterConfig {
    /// Create a configuration with a single seed host
    pub fn with_host<T: Into<String>>(name: T, port: u16) -> Self {
        Self {
            hosts: vec![Host::new(name, port)],
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::configuration(format!("Failed to read config file: {}", e))
        })?;

        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            ClusterError::configuration(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            ClusterError::configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ClusterError::configuration(
                "At least one seed host must be configured",
            ));
        }

        if let Some(host) = self.hosts.iter().find(|h| h.name.is_empty() || h.port == 0) {
            return Err(ClusterError::configuration(format!(
                "Invalid seed host '{}'",
                host
            )));
        }

        if self.max_conns_per_node == 0 {
            return Err(ClusterError::configuration(
                "Connection pool capacity must be at least 1",
            ));
        }

        match (&self.user, &self.password_hash) {
            (Some(user), _) if user.is_empty() => {
                Err(ClusterError::configuration("User name cannot be empty"))
            }
            (None, Some(_)) => Err(ClusterError::configuration(
                "Password hash configured without a user",
            )),
            _ => Ok(()),
        }
    }

    /// Effective connection timeout
    pub fn conn_timeout(&self) -> Duration {
        match self.conn_timeout_ms {
            0 => Duration::from_millis(DEFAULT_CONN_TIMEOUT_MS),
            ms => Duration::from_millis(ms),
        }
    }

    /// Effective tend interval, never below the minimum
    pub fn tend_interval(&self) -> Duration {
        Duration::from_millis(self.tend_interval_ms.max(MIN_TEND_INTERVAL_MS))
    }

    /// Credentials when a user is configured
    pub fn credentials(&self) -> Option<Credentials> {
        self.user.as_ref().map(|user| Credentials {
            user: user.clone(),
            password_hash: self.password_hash.clone().unwrap_or_default(),
        })
    }

    /// Translate a host name through the address map
    pub fn translate<'a>(&'a self, name: &'a str) -> &'a str {
        self.ip_map.get(name).map(String::as_str).unwrap_or(name)
    }
}
