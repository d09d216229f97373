//! Session configuration and defaults.
//!
//! [`SessionConfig`] controls how the registry connects to devices and what it
//! records. It can be built in code or parsed from JSON.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::session::AuditLevel;

/// NETCONF over SSH port, used when a target does not name one.
pub const DEFAULT_PORT: u16 = 830;

/// Seconds to wait for a transport to come up.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;

/// Seconds a liveness probe may take before the device is declared unreachable.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Records an audit log keeps before dropping the oldest.
pub const DEFAULT_AUDIT_MAX_ENTRIES: usize = 10_000;

/// Runtime settings shared by every connection of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound for establishing a transport.
    pub connect_timeout_secs: u64,
    /// Upper bound for a liveness probe.
    pub probe_timeout_secs: u64,
    /// Audit recording granularity.
    pub audit_level: AuditLevel,
    /// Upper bound on retained audit records.
    pub audit_max_entries: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            audit_level: AuditLevel::default(),
            audit_max_entries: DEFAULT_AUDIT_MAX_ENTRIES,
        }
    }
}

impl SessionConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, DeviceError> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| DeviceError::InvalidArgument(format!("session config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make every operation fail.
    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.connect_timeout_secs == 0 {
            return Err(DeviceError::InvalidArgument(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.probe_timeout_secs == 0 {
            return Err(DeviceError::InvalidArgument(
                "probe_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.audit_max_entries == 0 {
            return Err(DeviceError::InvalidArgument(
                "audit_max_entries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(60));
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.audit_level, AuditLevel::KeyEventsOnly);
        assert_eq!(config.audit_max_entries, DEFAULT_AUDIT_MAX_ENTRIES);
    }

    #[test]
    fn zero_audit_bound_is_rejected() {
        let err = SessionConfig::from_json(r#"{"audit_max_entries": 0}"#)
            .expect_err("zero bound must fail");
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SessionConfig::from_json(r#"{"probe_timeout_secs": 2, "audit_level": "full"}"#)
            .expect("parse config");
        assert_eq!(config.probe_timeout_secs, 2);
        assert_eq!(config.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);
        assert_eq!(config.audit_level, AuditLevel::Full);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = SessionConfig::from_json(r#"{"connect_timeout_secs": 0}"#)
            .expect_err("zero timeout must fail");
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn malformed_json_is_invalid_argument() {
        let err = SessionConfig::from_json("{not json").expect_err("malformed");
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }
}
