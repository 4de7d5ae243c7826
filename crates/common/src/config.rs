//! # Attach Configuration
//!
//! Settings shared by the attach engine and the `sattach` front end.
//!
//! Configuration is loaded from multiple sources in order of precedence:
//! 1. Environment variables (SATTACH_*)
//! 2. Configuration file (explicit path, `SATTACH_CONFIG`, or `./sattach.toml`)
//! 3. Built-in defaults

use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "sattach.toml";
pub const DEFAULT_MSG_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CLIENTS_PER_PORT: usize = 48;
pub const DEFAULT_RECV_TIMEOUT_FACTOR: u32 = 8;
/// Upper bound on `msg_timeout_secs` (one day).
pub const MAX_MSG_TIMEOUT_SECS: u64 = 86_400;
/// Upper bound on `recv_timeout_factor`.
pub const MAX_RECV_TIMEOUT_FACTOR: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Default message timeout of the transport, in seconds.
    pub msg_timeout_secs: u64,
    /// Remote daemons served by one response port.
    pub clients_per_port: usize,
    /// Multiplier applied to the message timeout when receiving task events.
    pub recv_timeout_factor: u32,
    /// Uid of the workload manager's service account.
    pub service_uid: u32,
    /// Shared cluster key used to sign and verify message envelopes.
    pub auth_key: Option<String>,
    /// Address the response ports bind to.
    pub bind_addr: IpAddr,
    /// Restricts response ports to a range instead of ephemeral ports.
    pub response_port_range: Option<PortRange>,
    /// Layout file standing in for the step metadata service.
    pub layout_file: Option<PathBuf>,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            msg_timeout_secs: DEFAULT_MSG_TIMEOUT_SECS,
            clients_per_port: DEFAULT_CLIENTS_PER_PORT,
            recv_timeout_factor: DEFAULT_RECV_TIMEOUT_FACTOR,
            service_uid: 0,
            auth_key: None,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            response_port_range: None,
            layout_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn len(&self) -> usize {
        if self.max < self.min {
            0
        } else {
            (self.max - self.min) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttachConfig {
    /// Loads configuration from `path` (or the default locations) and applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_path(path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_parse::<u64>("SATTACH_MSG_TIMEOUT") {
            self.msg_timeout_secs = secs;
        }
        if let Some(uid) = env_parse::<u32>("SATTACH_SERVICE_UID") {
            self.service_uid = uid;
        }
        if let Ok(key) = env::var("SATTACH_AUTH_KEY") {
            let key = key.trim();
            if !key.is_empty() {
                self.auth_key = Some(key.to_string());
            }
        }
        if let Ok(path) = env::var("SATTACH_LAYOUT_FILE") {
            if !path.trim().is_empty() {
                self.layout_file = Some(PathBuf::from(path.trim()));
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.msg_timeout_secs == 0 || self.msg_timeout_secs > MAX_MSG_TIMEOUT_SECS {
            bail!(
                "msg_timeout_secs must be between 1 and {}, got {}",
                MAX_MSG_TIMEOUT_SECS,
                self.msg_timeout_secs
            );
        }
        if self.clients_per_port == 0 {
            bail!("clients_per_port must be greater than zero");
        }
        if self.recv_timeout_factor == 0 || self.recv_timeout_factor > MAX_RECV_TIMEOUT_FACTOR {
            bail!(
                "recv_timeout_factor must be between 1 and {}, got {}",
                MAX_RECV_TIMEOUT_FACTOR,
                self.recv_timeout_factor
            );
        }
        if let Some(range) = self.response_port_range {
            if range.is_empty() || range.min == 0 {
                bail!(
                    "response_port_range {}-{} is empty or includes port 0",
                    range.min,
                    range.max
                );
            }
        }
        Ok(())
    }

    pub fn msg_timeout(&self) -> Duration {
        Duration::from_secs(self.msg_timeout_secs)
    }

    /// Timeout for receiving one task event: collective-startup libraries on
    /// large steps are slow to answer.
    pub fn recv_timeout(&self) -> Duration {
        self.msg_timeout()
            .checked_mul(self.recv_timeout_factor)
            .unwrap_or(Duration::MAX)
    }

    pub fn forward_timeout_ms(&self) -> u64 {
        self.msg_timeout_secs.saturating_mul(1000)
    }

    pub fn auth_key_bytes(&self) -> Option<&[u8]> {
        self.auth_key.as_deref().map(str::as_bytes)
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env::var("SATTACH_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let candidate = env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
            if candidate.is_file() {
                Some(candidate)
            } else {
                None
            }
        })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Invalid {} value '{}': {}", key, raw, err);
            None
        }
    }
}
