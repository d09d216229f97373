//! In-memory simulated device.
//!
//! [`SimulatedDevice`] implements the transport traits against a small model of
//! a device with a shared candidate database, an active configuration, a commit
//! history and an exclusive configuration lock. Faults can be injected per
//! primitive and every primitive call is counted, which makes it usable for
//! offline dry runs and for tests that must prove a primitive was never called.
//!
//! Configuration is modelled as a list of statement lines. Set-style deltas
//! understand `set ...` and `delete ...`; other formats are handled line by line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use serde_json::{Value, json};

use crate::device::{
    CandidateConfig, CommitOptions, ConfigFormat, DeviceTarget, Facts, LoadAction,
    ShutdownRequest,
};
use crate::error::TransportError;
use crate::rpc::RpcParams;
use crate::transport::{DeviceTransport, TransportConnector};

// Lock owner id used for "another actor holds the lock".
const FOREIGN_SESSION: u64 = 0;

#[derive(Debug, Default)]
struct Faults {
    connect: Option<String>,
    lock: Option<String>,
    unlock: Option<String>,
    load: Option<String>,
    commit_check: Option<String>,
    commit: Option<String>,
    rpc: Option<String>,
    shutdown: Option<String>,
}

#[derive(Debug)]
struct DeviceState {
    active: Vec<String>,
    candidate: Option<Vec<String>>,
    /// `history[0]` is the most recent prior commit.
    history: Vec<Vec<String>>,
    lock_owner: Option<u64>,
    next_session: u64,
    /// Sessions opened before this epoch are dead.
    session_epoch: u64,
    password: Option<String>,
    facts: Facts,
    check_passes: bool,
    reachable: bool,
    faults: Faults,
    calls: HashMap<String, usize>,
    last_commit: Option<CommitOptions>,
    last_shutdown: Option<ShutdownRequest>,
}

impl Default for DeviceState {
    fn default() -> Self {
        let mut facts = Facts::new();
        facts.insert("hostname".to_string(), json!("sim-r1"));
        facts.insert("model".to_string(), json!("vmx"));
        facts.insert("version".to_string(), json!("21.4R3"));
        facts.insert("serial_number".to_string(), json!("SIM0001"));
        Self {
            active: Vec::new(),
            candidate: None,
            history: Vec::new(),
            lock_owner: None,
            next_session: FOREIGN_SESSION + 1,
            session_epoch: 0,
            password: None,
            facts,
            check_passes: true,
            reachable: true,
            faults: Faults::default(),
            calls: HashMap::new(),
            last_commit: None,
            last_shutdown: None,
        }
    }
}

impl DeviceState {
    fn count(&mut self, primitive: &str) {
        *self.calls.entry(primitive.to_string()).or_default() += 1;
    }
}

/// Handle to a simulated device. Clones share the same device.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with `lines` as the active configuration.
    pub fn with_active_config(lines: &[&str]) -> Self {
        let device = Self::new();
        device.state().active = lines.iter().map(|l| l.to_string()).collect();
        device
    }

    /// Connector that opens sessions to this device.
    pub fn connector(&self) -> SimulatedConnector {
        SimulatedConnector {
            state: self.state.clone(),
        }
    }

    /// Number of times a primitive was called (`connect`, `lock`, `unlock`,
    /// `load`, `commit_check`, `commit`, `rollback`, `diff`, `rpc`, `facts`,
    /// `probe`, `reboot`, `power_off`, `close`).
    pub fn calls(&self, primitive: &str) -> usize {
        self.state().calls.get(primitive).copied().unwrap_or(0)
    }

    pub fn is_locked(&self) -> bool {
        self.state().lock_owner.is_some()
    }

    pub fn active_config(&self) -> Vec<String> {
        self.state().active.clone()
    }

    pub fn candidate_config(&self) -> Option<Vec<String>> {
        self.state().candidate.clone()
    }

    /// Number of committed revisions available for rollback.
    pub fn revisions(&self) -> usize {
        self.state().history.len()
    }

    pub fn last_commit(&self) -> Option<CommitOptions> {
        self.state().last_commit.clone()
    }

    pub fn last_shutdown(&self) -> Option<ShutdownRequest> {
        self.state().last_shutdown.clone()
    }

    /// Requires this password on connect.
    pub fn require_password(&self, password: &str) {
        self.state().password = Some(password.to_string());
    }

    /// Simulates another actor holding the configuration lock.
    pub fn hold_lock_elsewhere(&self) {
        self.state().lock_owner = Some(FOREIGN_SESSION);
    }

    pub fn release_foreign_lock(&self) {
        let mut state = self.state();
        if state.lock_owner == Some(FOREIGN_SESSION) {
            state.lock_owner = None;
        }
    }

    pub fn refuse_connections(&self, reason: &str) {
        self.state().faults.connect = Some(reason.to_string());
    }

    pub fn accept_connections(&self) {
        self.state().faults.connect = None;
    }

    pub fn fail_lock_with(&self, reason: &str) {
        self.state().faults.lock = Some(reason.to_string());
    }

    pub fn fail_unlock_with(&self, reason: &str) {
        self.state().faults.unlock = Some(reason.to_string());
    }

    pub fn clear_unlock_fault(&self) {
        self.state().faults.unlock = None;
    }

    pub fn reject_load_with(&self, reason: &str) {
        self.state().faults.load = Some(reason.to_string());
    }

    /// Makes commit-check report `passes`.
    pub fn set_commit_check(&self, passes: bool) {
        self.state().check_passes = passes;
    }

    pub fn fail_commit_check_with(&self, reason: &str) {
        self.state().faults.commit_check = Some(reason.to_string());
    }

    pub fn fail_commit_with(&self, reason: &str) {
        self.state().faults.commit = Some(reason.to_string());
    }

    pub fn fail_rpc_with(&self, reason: &str) {
        self.state().faults.rpc = Some(reason.to_string());
    }

    pub fn fail_shutdown_with(&self, reason: &str) {
        self.state().faults.shutdown = Some(reason.to_string());
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    pub fn set_fact(&self, name: &str, value: Value) {
        self.state().facts.insert(name.to_string(), value);
    }

    pub fn remove_fact(&self, name: &str) {
        self.state().facts.remove(name);
    }

    /// Kills every open session. Locks held by them are released.
    pub fn drop_sessions(&self) {
        let mut state = self.state();
        state.session_epoch = state.next_session;
        if state.lock_owner.is_some_and(|owner| owner != FOREIGN_SESSION) {
            state.lock_owner = None;
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<DeviceState>) -> MutexGuard<'_, DeviceState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// [`TransportConnector`] for a [`SimulatedDevice`].
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    state: Arc<Mutex<DeviceState>>,
}

#[async_trait]
impl TransportConnector for SimulatedConnector {
    async fn connect(
        &self,
        target: &DeviceTarget,
    ) -> Result<Box<dyn DeviceTransport>, TransportError> {
        let mut state = lock_state(&self.state);
        state.count("connect");
        if let Some(reason) = state.faults.connect.clone() {
            return Err(TransportError::Unreachable(reason));
        }
        if let Some(expected) = state.password.as_ref()
            && target.credentials.password.as_ref() != Some(expected)
        {
            return Err(TransportError::Auth(format!(
                "bad password for {}",
                target.credentials.username
            )));
        }
        let session_id = state.next_session;
        state.next_session += 1;
        debug!("simulated session {} opened for {}", session_id, target.device_id());
        Ok(Box::new(SimulatedSession {
            state: self.state.clone(),
            session_id,
            open: true,
        }))
    }
}

/// One session to a [`SimulatedDevice`].
#[derive(Debug)]
pub struct SimulatedSession {
    state: Arc<Mutex<DeviceState>>,
    session_id: u64,
    open: bool,
}

impl SimulatedSession {
    // Counts the call and fails with `Closed` when the session is dead.
    fn enter(&self, primitive: &str) -> Result<MutexGuard<'_, DeviceState>, TransportError> {
        let mut state = lock_state(&self.state);
        state.count(primitive);
        trace!("simulated session {} {}", self.session_id, primitive);
        if !self.open || self.session_id < state.session_epoch {
            return Err(TransportError::Closed);
        }
        Ok(state)
    }

    fn owns_lock(&self, state: &DeviceState) -> bool {
        state.lock_owner == Some(self.session_id)
    }
}

#[async_trait]
impl DeviceTransport for SimulatedSession {
    fn is_connected(&self) -> bool {
        self.open && self.session_id >= lock_state(&self.state).session_epoch
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        {
            let mut state = lock_state(&self.state);
            state.count("close");
            if state.lock_owner == Some(self.session_id) {
                state.lock_owner = None;
            }
        }
        self.open = false;
        Ok(())
    }

    async fn invoke_rpc(&mut self, name: &str, params: &RpcParams) -> Result<Value, TransportError> {
        let state = self.enter("rpc")?;
        if let Some(reason) = state.faults.rpc.clone() {
            return Err(TransportError::Rejected(reason));
        }
        let output = match name {
            "get-software-information" => json!({
                "host-name": state.facts.get("hostname").cloned().unwrap_or(Value::Null),
                "product-model": state.facts.get("model").cloned().unwrap_or(Value::Null),
                "junos-version": state.facts.get("version").cloned().unwrap_or(Value::Null),
            }),
            "get-configuration" => json!({ "configuration": state.active.join("\n") }),
            _ => json!({ "rpc": name, "params": Value::Object(params.clone()) }),
        };
        Ok(output)
    }

    async fn facts(&mut self) -> Result<Facts, TransportError> {
        let state = self.enter("facts")?;
        Ok(state.facts.clone())
    }

    async fn probe(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
        let state = self.enter("probe")?;
        Ok(state.reachable)
    }

    async fn lock(&mut self) -> Result<(), TransportError> {
        let session_id = self.session_id;
        let mut state = self.enter("lock")?;
        if let Some(reason) = state.faults.lock.clone() {
            return Err(TransportError::Rejected(reason));
        }
        if state.lock_owner.is_some() {
            return Err(TransportError::Rejected(
                "configuration database locked by another user".to_string(),
            ));
        }
        state.lock_owner = Some(session_id);
        Ok(())
    }

    async fn unlock(&mut self) -> Result<(), TransportError> {
        let mut state = self.enter("unlock")?;
        if let Some(reason) = state.faults.unlock.clone() {
            return Err(TransportError::Rejected(reason));
        }
        if !self.owns_lock(&state) {
            return Err(TransportError::Rejected(
                "configuration database not locked by this session".to_string(),
            ));
        }
        state.lock_owner = None;
        Ok(())
    }

    async fn load(&mut self, candidate: &CandidateConfig) -> Result<(), TransportError> {
        let mut state = self.enter("load")?;
        if let Some(reason) = state.faults.load.clone() {
            return Err(TransportError::Rejected(reason));
        }
        if !self.owns_lock(&state) {
            return Err(TransportError::Rejected(
                "configuration database not locked".to_string(),
            ));
        }
        let lines = statement_lines(&candidate.content);
        let next = match candidate.action {
            LoadAction::Replace | LoadAction::Override => lines,
            LoadAction::Merge => {
                let mut base = state
                    .candidate
                    .clone()
                    .unwrap_or_else(|| state.active.clone());
                merge_lines(&mut base, lines, candidate.format);
                base
            }
        };
        state.candidate = Some(next);
        Ok(())
    }

    async fn commit_check(&mut self) -> Result<bool, TransportError> {
        let state = self.enter("commit_check")?;
        if let Some(reason) = state.faults.commit_check.clone() {
            return Err(TransportError::Rejected(reason));
        }
        Ok(state.check_passes)
    }

    async fn commit(&mut self, options: &CommitOptions) -> Result<(), TransportError> {
        let mut state = self.enter("commit")?;
        if let Some(reason) = state.faults.commit.clone() {
            return Err(TransportError::Rejected(reason));
        }
        if let Some(next) = state.candidate.take() {
            let previous = std::mem::replace(&mut state.active, next);
            state.history.insert(0, previous);
        }
        state.last_commit = Some(options.clone());
        Ok(())
    }

    async fn rollback(&mut self, revision: u32) -> Result<(), TransportError> {
        let mut state = self.enter("rollback")?;
        let target = state
            .history
            .get(revision as usize)
            .cloned()
            .ok_or_else(|| {
                TransportError::Rejected(format!("rollback {revision} is not available"))
            })?;
        let previous = std::mem::replace(&mut state.active, target);
        state.history.insert(0, previous);
        state.candidate = None;
        Ok(())
    }

    async fn diff(&mut self) -> Result<Option<String>, TransportError> {
        let state = self.enter("diff")?;
        let Some(candidate) = state.candidate.as_ref() else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for line in state.active.iter().filter(|l| !candidate.contains(l)) {
            out.push(format!("- {line}"));
        }
        for line in candidate.iter().filter(|l| !state.active.contains(l)) {
            out.push(format!("+ {line}"));
        }
        if out.is_empty() {
            return Ok(None);
        }
        Ok(Some(out.join("\n")))
    }

    async fn reboot(&mut self, delay_minutes: u32, at: Option<&str>) -> Result<(), TransportError> {
        let mut state = self.enter("reboot")?;
        if let Some(reason) = state.faults.shutdown.clone() {
            return Err(TransportError::Rejected(reason));
        }
        state.last_shutdown = Some(ShutdownRequest {
            reboot: true,
            delay_minutes,
            at: at.map(str::to_string),
        });
        Ok(())
    }

    async fn power_off(&mut self, delay_minutes: u32) -> Result<(), TransportError> {
        let mut state = self.enter("power_off")?;
        if let Some(reason) = state.faults.shutdown.clone() {
            return Err(TransportError::Rejected(reason));
        }
        state.last_shutdown = Some(ShutdownRequest {
            reboot: false,
            delay_minutes,
            at: None,
        });
        Ok(())
    }
}

fn statement_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn merge_lines(base: &mut Vec<String>, lines: Vec<String>, format: ConfigFormat) {
    for line in lines {
        if format == ConfigFormat::Set
            && let Some(path) = line.strip_prefix("delete ")
        {
            let prefix = format!("set {path}");
            base.retain(|existing| !existing.starts_with(&prefix));
            continue;
        }
        if !base.contains(&line) {
            base.push(line);
        }
    }
}
