//! Device sessions and configuration transactions.
//!
//! This module owns the lifecycle of management sessions to devices and the
//! transactional workflow used to change their configuration.
//!
//! # Main Components
//!
//! - [`SessionRegistry`] - Table of live connections keyed by device id
//! - [`DeviceConnection`] - One management session with its facts cache
//! - [`ConfigTransaction`] - Lock, load, check, commit and unlock state machine
//! - [`OperationFacade`] - Public operation set returning [`OperationResult`]
//! - [`AuditRecorder`] - Session and transaction event log

use log::{debug, error, info, trace, warn};
use moka::future::Cache;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::SessionConfig;
use crate::device::{
    CandidateConfig, CommitOptions, DeviceTarget, Facts, LoadOptions, ProbeResult,
    ShutdownRequest,
};
use crate::error::{DeviceError, TransportError};
use crate::rpc::{self, RpcParams};
use crate::transport::{DeviceTransport, TransportConnector};

pub use facade::{OperationFacade, OperationResult};
pub use recording::{AuditEvent, AuditLevel, AuditRecord, AuditRecorder};
pub use transaction::{CandidateState, ConfigTransaction, LockState, TxPhase};

/// Lifecycle state of a [`DeviceConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// The last connect attempt failed or the transport died.
    Faulted,
}

/// One authenticated management session to a device.
pub struct DeviceConnection {
    device_id: String,
    target: DeviceTarget,

    /// SHA-256 fingerprint of the credentials the session was opened with
    credentials_hash: [u8; 32],

    state: ConnectionState,
    transport: Option<Box<dyn DeviceTransport>>,

    /// Cached facts, replaced wholesale on refresh
    facts: Facts,

    /// Whether this session currently holds the configuration lock
    config_locked: bool,

    connect_timeout: Duration,
    probe_timeout: Duration,
    recorder: Option<AuditRecorder>,
}

/// Connection handle shared through the registry.
///
/// The mutex is the exclusive-access guard for one device: whoever holds it
/// owns the session for the whole lock-to-unlock span.
pub type SharedConnection = Arc<Mutex<DeviceConnection>>;

/// Process-wide table of device connections.
///
/// Entries are created lazily on first [`get`](SessionRegistry::get) and only
/// removed by [`teardown`](SessionRegistry::teardown). There is no idle eviction.
pub struct SessionRegistry {
    cache: Cache<String, SharedConnection>,
    connector: Arc<dyn TransportConnector>,
    config: SessionConfig,
    recorder: Option<AuditRecorder>,
    next_tx_id: AtomicU64,
}

mod connection;
mod facade;
mod manager;
mod recording;
mod transaction;
