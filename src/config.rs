//! Configuration module for reglock.
//!
//! Capacities of the shared tables are compile-time constants (the blob
//! layout must be byte-identical in every process mapping a registry), so
//! configuration only covers knobs that are private to one process: the
//! shared-memory naming scheme, creation permissions, how long to wait for
//! another process to finish initializing a registry, and how often a
//! blocking waiter re-checks the table.

use crate::error::{RegLockError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a reglock library instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegLockConfig {
    /// Shared-memory registry configuration.
    pub shm: ShmConfig,
    /// Blocking-wait configuration.
    pub wait: WaitConfig,
}

impl RegLockConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RegLockError::Config(format!("failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RegLockError::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.shm.prefix.is_empty() {
            return Err(RegLockError::InvalidConfig {
                field: "shm.prefix".to_string(),
                reason: "prefix must be non-empty".to_string(),
            });
        }

        if self.shm.prefix.contains('/') {
            return Err(RegLockError::InvalidConfig {
                field: "shm.prefix".to_string(),
                reason: "prefix must not contain '/'".to_string(),
            });
        }

        if self.shm.init_retry_attempts == 0 {
            return Err(RegLockError::InvalidConfig {
                field: "shm.init_retry_attempts".to_string(),
                reason: "at least one probe is required".to_string(),
            });
        }

        if self.wait.recheck_ms == 0 {
            return Err(RegLockError::InvalidConfig {
                field: "wait.recheck_ms".to_string(),
                reason: "re-check interval must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Shared-memory registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Prefix of registry object names. A file with identity `(dev, ino)`
    /// maps to the object `/<prefix>_<dev>_<ino>`.
    pub prefix: String,
    /// Permission bits for newly created registry objects, subject to the
    /// creating process's umask.
    pub create_mode: u32,
    /// How many times to probe an existing registry for its ready marker
    /// before giving up.
    pub init_retry_attempts: u32,
    /// Delay between ready-marker probes, in milliseconds.
    pub init_retry_delay_ms: u64,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            prefix: "reglock".to_string(),
            create_mode: 0o666,
            init_retry_attempts: 100,
            init_retry_delay_ms: 1,
        }
    }
}

impl ShmConfig {
    /// Delay between ready-marker probes.
    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_millis(self.init_retry_delay_ms)
    }
}

/// Blocking-wait configuration.
///
/// A waiter parked on the registry condition variable is only woken by
/// another process using this library. If a conflicting holder dies without
/// releasing, nobody broadcasts, so waiters wake up on their own every
/// `recheck_ms` to re-run the applicability check (which reclaims locks of
/// dead owners).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Maximum time a waiter sleeps before re-checking the table, in
    /// milliseconds.
    pub recheck_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self { recheck_ms: 500 }
    }
}

impl WaitConfig {
    /// Maximum time a waiter sleeps before re-checking the table.
    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RegLockConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_prefix() {
        let mut config = RegLockConfig::default();
        config.shm.prefix.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_slash_in_prefix() {
        let mut config = RegLockConfig::default();
        config.shm.prefix = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_recheck() {
        let mut config = RegLockConfig::default();
        config.wait.recheck_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_through_json() {
        let config = RegLockConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RegLockConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.shm.prefix, config.shm.prefix);
        assert_eq!(back.wait.recheck_ms, config.wait.recheck_ms);
    }
}
