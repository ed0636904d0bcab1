// src/config.rs - Runtime configuration for the tester

use crate::error::{PlcError, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Main VESTA configuration
///
/// Every section is optional in the file; missing values fall back to the
/// defaults below.
///
/// # Examples
///
/// ```rust
/// use vesta::Config;
///
/// let config = Config::from_yaml("engine:\n  tolerance_ms: 250\n")?;
/// assert_eq!(config.engine.tolerance_ms, 250);
/// assert_eq!(config.engine.scan_rate_ms, 100);
/// # Ok::<(), vesta::PlcError>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Controller connection
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Wire scheduler
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Execution engine
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(address) = &self.connection.address {
            address.parse::<Ipv4Addr>().map_err(|_| {
                PlcError::Config(format!("'{}' is not an IPv4 address", address))
            })?;
        }
        if self.connection.timeout_ms == 0 {
            return Err(PlcError::Config("connection.timeout_ms must be positive".into()));
        }
        if self.scheduler.capacity == 0 {
            return Err(PlcError::Config("scheduler.capacity must be positive".into()));
        }
        if self.engine.scan_rate_ms == 0 {
            return Err(PlcError::Config("engine.scan_rate_ms must be positive".into()));
        }
        Ok(())
    }
}

// ============================================================================
// CONNECTION CONFIGURATION
// ============================================================================

/// Controller connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// IPv4 address of the controller
    #[serde(default)]
    pub address: Option<String>,

    /// Backplane slot of the processor
    #[serde(default)]
    pub slot: u8,

    /// EtherNet/IP TCP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-request response window in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: None,
            slot: 0,
            port: default_port(),
            timeout_ms: default_timeout(),
        }
    }
}

// ============================================================================
// SCHEDULER CONFIGURATION
// ============================================================================

/// Wire scheduler parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum queued jobs before submissions are rejected
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Pause between two consecutive jobs in milliseconds
    #[serde(default)]
    pub inter_request_delay_ms: u64,
}

impl SchedulerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            inter_request_delay_ms: 0,
        }
    }
}

// ============================================================================
// ENGINE CONFIGURATION
// ============================================================================

/// Execution engine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pause between units in milliseconds
    #[serde(default)]
    pub unit_delay_ms: u64,

    /// Pause between sets in milliseconds
    #[serde(default)]
    pub set_delay_ms: u64,

    /// Timing slack for unit tests in milliseconds
    #[serde(default = "default_tolerance")]
    pub tolerance_ms: u64,

    /// Scan loop cadence in milliseconds
    #[serde(default = "default_scan_rate")]
    pub scan_rate_ms: u64,
}

impl EngineConfig {
    pub fn unit_delay(&self) -> Duration {
        Duration::from_millis(self.unit_delay_ms)
    }

    pub fn set_delay(&self) -> Duration {
        Duration::from_millis(self.set_delay_ms)
    }

    pub fn scan_rate(&self) -> Duration {
        Duration::from_millis(self.scan_rate_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unit_delay_ms: 0,
            set_delay_ms: 0,
            tolerance_ms: default_tolerance(),
            scan_rate_ms: default_scan_rate(),
        }
    }
}

// ============================================================================
// DEFAULT VALUE FUNCTIONS
// ============================================================================

fn default_port() -> u16 { 44818 }
fn default_timeout() -> u64 { 10_000 }
fn default_capacity() -> usize { 1000 }
fn default_tolerance() -> u64 { 100 }
fn default_scan_rate() -> u64 { 100 }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.connection.port, 44818);
        assert_eq!(config.connection.timeout(), Duration::from_secs(10));
        assert_eq!(config.scheduler.capacity, 1000);
        assert_eq!(config.engine.tolerance_ms, 100);
        assert_eq!(config.engine.scan_rate(), Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_address_rejected() {
        let err = Config::from_yaml("connection:\n  address: plc.local\n").unwrap_err();
        assert!(matches!(err, PlcError::Config(_)));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(Config::from_yaml("scheduler:\n  capacity: 0\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "connection:\n  address: 192.168.1.10\n  slot: 2\nengine:\n  unit_delay_ms: 50"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.connection.address.as_deref(), Some("192.168.1.10"));
        assert_eq!(config.connection.slot, 2);
        assert_eq!(config.engine.unit_delay(), Duration::from_millis(50));
    }
}
