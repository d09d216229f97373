//! # rnetcfg - Transactional Configuration Sessions for Network Devices
//!
//! `rnetcfg` manages authenticated management sessions to network devices and
//! drives configuration changes through a strict transaction: lock, load,
//! commit-check, commit, unlock. The device is never asked to apply a candidate
//! that did not pass its commit-check, and the configuration lock is released on
//! every exit path.
//!
//! ## Features
//!
//! - **Session Registry**: One live session per device, reused across operations
//!   and reconnected when it faults or the credentials change
//! - **Configuration Transactions**: Explicit phase machine with guaranteed unlock
//! - **Operation Facade**: Every operation returns one uniform [`OperationResult`](session::OperationResult)
//! - **RPC Catalog**: Validated passthrough for read-only device RPCs
//! - **Audit Recording**: Connection and transaction events, exportable as JSONL
//! - **Pluggable Transport**: Bring your own [`TransportConnector`](transport::TransportConnector);
//!   an in-memory [`SimulatedDevice`](simulator::SimulatedDevice) is included
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rnetcfg::config::SessionConfig;
//! use rnetcfg::device::{Credentials, DeviceTarget, LoadOptions};
//! use rnetcfg::session::{OperationFacade, SessionRegistry};
//! use rnetcfg::simulator::SimulatedDevice;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let device = SimulatedDevice::new();
//!     let registry = Arc::new(SessionRegistry::new(
//!         Arc::new(device.connector()),
//!         SessionConfig::default(),
//!     ));
//!     let facade = OperationFacade::new(
//!         registry,
//!         DeviceTarget::new("192.168.1.1", Credentials::password("admin", "password")),
//!     );
//!
//!     let result = facade
//!         .load_config("system { host-name edge-1; }", &LoadOptions::default())
//!         .await;
//!     println!("{}: {}", result.success, result.message);
//! }
//! ```
//!
//! ## Main Modules
//!
//! - [`session`] - Registry, connections, transactions, facade and audit log
//! - [`device`] - Targets, credentials, candidate payloads and options
//! - [`rpc`] - RPC catalog and parameter validation
//! - [`transport`] - Transport capability traits
//! - [`simulator`] - In-memory device for dry runs and tests
//! - [`config`] - Session configuration and defaults
//! - [`error`] - Error types

pub mod config;
pub mod device;
pub mod error;
pub mod rpc;
pub mod session;
pub mod simulator;
pub mod transport;
