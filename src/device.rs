//! Device-facing data model.
//!
//! Targets and credentials identify a device, the candidate and option types
//! describe what a configuration transaction submits, and [`ProbeResult`] /
//! [`Facts`] carry what the device reports back.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::DEFAULT_PORT;
use crate::error::DeviceError;

/// Device facts: fact name to value.
pub type Facts = BTreeMap<String, serde_json::Value>;

/// Reboot time accepted by the device: `hh:mm` or `yymmddhhmm`.
static AT_TIME: Lazy<Regex> = Lazy::new(
    || match Regex::new(r"^(?:(?:[01]\d|2[0-3]):[0-5]\d|\d{10})$") {
        Ok(re) => re,
        Err(err) => panic!("invalid AT_TIME regex: {err}"),
    },
);

/// Login material for a device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Path to a private key used instead of (or along with) the password.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            key_path: None,
        }
    }

    pub fn key(username: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            password: None,
            key_path: Some(key_path.into()),
        }
    }

    /// SHA-256 over the secret parts, used to decide whether a cached session
    /// was opened with the same login.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.username.as_bytes());
        hasher.update([0u8]);
        if let Some(password) = self.password.as_ref() {
            hasher.update(password.as_bytes());
        }
        hasher.update([0u8]);
        if let Some(key) = self.key_path.as_ref() {
            hasher.update(key.to_string_lossy().as_bytes());
        }
        hasher.finalize().into()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// Where and how to reach a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceTarget {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub credentials: Credentials,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl DeviceTarget {
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            credentials,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Registry key: `user@host:port`.
    pub fn device_id(&self) -> String {
        format!("{}@{}:{}", self.credentials.username, self.host, self.port)
    }
}

/// Encoding of a configuration payload. Passed to the device untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFormat {
    /// Curly-brace text.
    #[default]
    Text,
    Xml,
    /// `set`/`delete` command deltas.
    Set,
    Json,
}

impl ConfigFormat {
    /// Infers the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "conf" | "text" | "txt" => Some(Self::Text),
            "xml" => Some(Self::Xml),
            "set" => Some(Self::Set),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Xml => "xml",
            Self::Set => "set",
            Self::Json => "json",
        }
    }
}

impl FromStr for ConfigFormat {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "conf" | "txt" => Ok(Self::Text),
            "xml" => Ok(Self::Xml),
            "set" => Ok(Self::Set),
            "json" => Ok(Self::Json),
            other => Err(DeviceError::InvalidArgument(format!(
                "unknown config format '{other}'"
            ))),
        }
    }
}

/// How a candidate is combined with the existing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadAction {
    /// Merge into the existing configuration.
    #[default]
    Merge,
    /// Replace the statements marked for replacement.
    Replace,
    /// Discard the existing configuration and load the candidate in full.
    Override,
}

/// A configuration payload ready to submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CandidateConfig {
    pub content: String,
    pub format: ConfigFormat,
    pub action: LoadAction,
}

impl CandidateConfig {
    pub fn new(content: impl Into<String>, format: ConfigFormat, action: LoadAction) -> Self {
        Self {
            content: content.into(),
            format,
            action,
        }
    }

    /// Checks the payload before the device sees it.
    ///
    /// Set-style deltas only merge; an override with set commands is meaningless.
    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.content.trim().is_empty() {
            return Err(DeviceError::InvalidArgument(
                "candidate configuration is empty".to_string(),
            ));
        }
        if self.format == ConfigFormat::Set && self.action != LoadAction::Merge {
            return Err(DeviceError::InvalidArgument(format!(
                "set format does not support {:?} load",
                self.action
            )));
        }
        Ok(())
    }
}

/// Options applied to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct CommitOptions {
    /// Comment stored with the commit in the device's history.
    pub comment: Option<String>,
    /// Commit confirmed: the device rolls back unless confirmed within this many minutes.
    pub confirm_minutes: Option<u32>,
    /// Synchronize the commit to both routing engines.
    pub synchronize: bool,
}

/// Options for `load_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoadOptions {
    /// Payload format. `None` means text, or the file extension for file loads.
    pub format: Option<ConfigFormat>,
    pub action: LoadAction,
    /// Commit after loading. When false, the candidate is left staged on the device.
    pub commit: bool,
    pub commit_options: CommitOptions,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            format: None,
            action: LoadAction::Merge,
            commit: true,
            commit_options: CommitOptions::default(),
        }
    }
}

/// Reboot or power-off request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct ShutdownRequest {
    pub reboot: bool,
    pub delay_minutes: u32,
    /// Absolute reboot time. Ignored for power-off.
    pub at: Option<String>,
}

impl ShutdownRequest {
    pub fn validate(&self) -> Result<(), DeviceError> {
        if let Some(at) = self.at.as_deref()
            && self.reboot
            && !AT_TIME.is_match(at)
        {
            return Err(DeviceError::InvalidArgument(format!(
                "reboot time '{at}' must be hh:mm or yymmddhhmm"
            )));
        }
        Ok(())
    }
}

/// Outcome of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProbeResult {
    pub reachable: bool,
    pub latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_includes_user_host_and_port() {
        let target = DeviceTarget::new("10.0.0.1", Credentials::password("admin", "pw"));
        assert_eq!(target.device_id(), "admin@10.0.0.1:830");
        assert_eq!(target.with_port(22).device_id(), "admin@10.0.0.1:22");
    }

    #[test]
    fn fingerprint_changes_with_password() {
        let a = Credentials::password("admin", "one");
        let b = Credentials::password("admin", "two");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let rendered = format!("{:?}", Credentials::password("admin", "secret"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn format_parsing_and_inference() {
        assert_eq!("XML".parse::<ConfigFormat>().expect("xml"), ConfigFormat::Xml);
        assert_eq!("conf".parse::<ConfigFormat>().expect("conf"), ConfigFormat::Text);
        assert!("yaml".parse::<ConfigFormat>().is_err());
        assert_eq!(
            ConfigFormat::from_path(Path::new("/tmp/edge.set")),
            Some(ConfigFormat::Set)
        );
        assert_eq!(ConfigFormat::from_path(Path::new("/tmp/edge")), None);
    }

    #[test]
    fn set_format_only_merges() {
        let candidate = CandidateConfig::new(
            "set system host-name r1",
            ConfigFormat::Set,
            LoadAction::Override,
        );
        assert!(matches!(
            candidate.validate(),
            Err(DeviceError::InvalidArgument(_))
        ));
        let merge = CandidateConfig::new("set system host-name r1", ConfigFormat::Set, LoadAction::Merge);
        assert!(merge.validate().is_ok());
    }

    #[test]
    fn reboot_time_is_checked() {
        let ok = ShutdownRequest {
            reboot: true,
            delay_minutes: 0,
            at: Some("23:15".to_string()),
        };
        assert!(ok.validate().is_ok());

        let bad = ShutdownRequest {
            reboot: true,
            delay_minutes: 0,
            at: Some("tomorrow".to_string()),
        };
        assert!(bad.validate().is_err());

        let poweroff = ShutdownRequest {
            reboot: false,
            delay_minutes: 5,
            at: Some("tomorrow".to_string()),
        };
        assert!(poweroff.validate().is_ok());
    }
}
