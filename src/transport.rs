//! Transport capability traits.
//!
//! The session layer never frames protocol messages itself. A transport
//! implementation (NETCONF over SSH, a vendor API, or the in-memory
//! [`simulator`](crate::simulator)) provides these primitives and the core drives
//! them.

use std::time::Duration;

use async_trait::async_trait;

use crate::device::{CandidateConfig, CommitOptions, DeviceTarget, Facts};
use crate::error::TransportError;
use crate::rpc::RpcParams;

/// Opens management sessions.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, target: &DeviceTarget)
    -> Result<Box<dyn DeviceTransport>, TransportError>;
}

/// One open management session to a device.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn close(&mut self) -> Result<(), TransportError>;

    /// Runs a named RPC and returns its structured output.
    async fn invoke_rpc(
        &mut self,
        name: &str,
        params: &RpcParams,
    ) -> Result<serde_json::Value, TransportError>;

    /// Gathers device identity and state.
    async fn facts(&mut self) -> Result<Facts, TransportError>;

    /// Returns whether the device answered within `timeout`.
    async fn probe(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    /// Takes the exclusive configuration lock.
    async fn lock(&mut self) -> Result<(), TransportError>;

    async fn unlock(&mut self) -> Result<(), TransportError>;

    /// Submits a candidate configuration.
    async fn load(&mut self, candidate: &CandidateConfig) -> Result<(), TransportError>;

    /// Validates the candidate without touching the active configuration.
    async fn commit_check(&mut self) -> Result<bool, TransportError>;

    /// Applies the candidate.
    async fn commit(&mut self, options: &CommitOptions) -> Result<(), TransportError>;

    /// Reverts the active configuration to a committed revision (0 = most recent prior).
    async fn rollback(&mut self, revision: u32) -> Result<(), TransportError>;

    /// Candidate versus active configuration. `None` when there is no difference.
    async fn diff(&mut self) -> Result<Option<String>, TransportError>;

    async fn reboot(&mut self, delay_minutes: u32, at: Option<&str>) -> Result<(), TransportError>;

    async fn power_off(&mut self, delay_minutes: u32) -> Result<(), TransportError>;
}
