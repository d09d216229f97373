use super::*;
use crate::device::ConfigFormat;
use serde_json::{Value, json};
use std::path::Path;

/// Uniform result of every facade operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl From<DeviceError> for OperationResult {
    fn from(err: DeviceError) -> Self {
        Self::failed(err.to_string())
    }
}

/// Public operation set for one device.
///
/// Every operation returns exactly one [`OperationResult`]; no error escapes.
/// Each call holds the device's exclusive-access guard for its whole duration,
/// so operations on one device never interleave.
#[derive(Clone)]
pub struct OperationFacade {
    registry: Arc<SessionRegistry>,
    target: DeviceTarget,
}

impl OperationFacade {
    pub fn new(registry: Arc<SessionRegistry>, target: DeviceTarget) -> Self {
        Self { registry, target }
    }

    pub fn device_id(&self) -> String {
        self.target.device_id()
    }

    /// Takes the configuration lock and keeps it until [`unlock`](Self::unlock).
    pub async fn lock(&self) -> OperationResult {
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        debug!("{} taking lock", conn.device_id());
        match conn.lock_config(None).await {
            Ok(()) => {
                debug!("{} locked config", conn.device_id());
                OperationResult::ok("locked config")
            }
            Err(err) => {
                debug!("{} could not lock config! {}", conn.device_id(), err);
                OperationResult::failed("could not lock config!")
            }
        }
    }

    pub async fn unlock(&self) -> OperationResult {
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        debug!("{} unlocking config", conn.device_id());
        match conn.unlock_config(None).await {
            Ok(()) => OperationResult::ok("unlocked config"),
            Err(_) => OperationResult::failed("could not unlock config!"),
        }
    }

    /// Loads `data` and, unless `options.commit` is false, checks and commits it.
    pub async fn load_config(&self, data: &str, options: &LoadOptions) -> OperationResult {
        let candidate =
            CandidateConfig::new(data, options.format.unwrap_or_default(), options.action);
        self.run_load(&candidate, options).await
    }

    /// Like [`load_config`](Self::load_config) with the payload read from `path`.
    ///
    /// The format comes from `options.format`, else the file extension, else text.
    pub async fn load_config_file(&self, path: &Path, options: &LoadOptions) -> OperationResult {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) => {
                return OperationResult::failed(format!(
                    "Failed to load config: cannot read {}: {err}",
                    path.display()
                ));
            }
        };
        let format = options
            .format
            .or_else(|| ConfigFormat::from_path(path))
            .unwrap_or_default();
        let candidate = CandidateConfig::new(content, format, options.action);
        self.run_load(&candidate, options).await
    }

    /// Validates the staged candidate without applying it.
    pub async fn commit_check(&self) -> OperationResult {
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        match conn.commit_check().await {
            Ok(true) => OperationResult::ok("Pre-commit check passed.").with_payload(json!(true)),
            Ok(false) => {
                OperationResult::failed("Pre-commit check failed.").with_payload(json!(false))
            }
            Err(err) => err.into(),
        }
    }

    /// Checks and commits the staged candidate.
    pub async fn commit(&self) -> OperationResult {
        self.commit_with(&CommitOptions::default()).await
    }

    pub async fn commit_with(&self, options: &CommitOptions) -> OperationResult {
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        let id = self.registry.next_transaction_id();
        let mut tx = ConfigTransaction::begin(&mut conn, id);
        let outcome = tx.commit_staged(options).await;
        let unlock_error = tx.unlock_error().map(str::to_string);
        drop(tx);
        let unlocked = !conn.holds_config_lock();
        transaction_result(id, outcome, "Commit Successful.", unlock_error, unlocked)
    }

    /// Reverts the active configuration to revision `revision` (0 = most recent prior commit).
    pub async fn rollback(&self, revision: u32) -> OperationResult {
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        let id = self.registry.next_transaction_id();
        let mut tx = ConfigTransaction::begin(&mut conn, id);
        let outcome = tx.rollback(revision).await.map_err(|err| match err {
            DeviceError::Rollback(cause) => DeviceError::Rollback(cause),
            other => DeviceError::Rollback(other.to_string()),
        });
        let unlock_error = tx.unlock_error().map(str::to_string);
        drop(tx);
        let unlocked = !conn.holds_config_lock();
        let mut result = transaction_result(id, outcome, "Rollback successful", unlock_error, unlocked);
        if !result.success {
            result.message = capitalize(&result.message);
        }
        result
    }

    /// Candidate versus active configuration.
    pub async fn diff(&self) -> OperationResult {
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        match conn.diff().await {
            Ok(Some(diff)) => OperationResult::ok(diff.clone()).with_payload(Value::String(diff)),
            Ok(None) => OperationResult::ok("No configuration differences.").with_payload(Value::Null),
            Err(err) => err.into(),
        }
    }

    /// Schedules a reboot (`reboot == true`) or a power-off.
    pub async fn shutdown(&self, reboot: bool, delay_minutes: u32, at: Option<&str>) -> OperationResult {
        let request = ShutdownRequest {
            reboot,
            delay_minutes,
            at: at.map(str::to_string),
        };
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        match conn.shutdown(&request).await {
            Ok(()) if reboot => OperationResult::ok(format!(
                "Reboot in: {}, at: {}",
                delay_minutes,
                at.unwrap_or("None")
            )),
            Ok(()) => OperationResult::ok(format!("Shutdown in: {delay_minutes}")),
            Err(err) => err.into(),
        }
    }

    /// Liveness probe.
    pub async fn ping(&self) -> OperationResult {
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        match conn.probe().await {
            Ok(probe) => {
                let payload = json!({ "reachable": probe.reachable, "latency_ms": probe.latency_ms });
                if probe.reachable {
                    OperationResult::ok("device reachable").with_payload(payload)
                } else {
                    OperationResult::failed("device unreachable").with_payload(payload)
                }
            }
            Err(err) => err.into(),
        }
    }

    /// Runs a catalog RPC.
    pub async fn rpc(&self, name: &str, params: &RpcParams) -> OperationResult {
        let (name, params) = match rpc::prepare(name, params) {
            Ok(prepared) => prepared,
            Err(err) => return err.into(),
        };
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        match conn.invoke(&name, &params).await {
            Ok(output) => OperationResult::ok(format!("rpc {name} executed")).with_payload(output),
            Err(err) => err.into(),
        }
    }

    /// Re-reads device facts.
    pub async fn refresh_facts(&self) -> OperationResult {
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        match conn.refresh_facts().await {
            Ok(facts) => OperationResult::ok("facts refreshed").with_payload(facts_value(facts)),
            Err(err) => err.into(),
        }
    }

    /// Facts as last gathered.
    pub async fn facts(&self) -> OperationResult {
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let conn = shared.lock().await;
        OperationResult::ok("cached facts").with_payload(facts_value(conn.facts().clone()))
    }

    /// Tears the session down. The next operation reconnects.
    pub async fn close(&self) -> OperationResult {
        if self.registry.teardown(&self.target.device_id()).await {
            OperationResult::ok("session closed")
        } else {
            OperationResult::ok("no open session")
        }
    }

    async fn acquire(&self) -> Result<SharedConnection, OperationResult> {
        self.registry
            .get(&self.target)
            .await
            .map_err(OperationResult::from)
    }

    async fn run_load(&self, candidate: &CandidateConfig, options: &LoadOptions) -> OperationResult {
        let shared = match self.acquire().await {
            Ok(shared) => shared,
            Err(result) => return result,
        };
        let mut conn = shared.lock().await;
        let id = self.registry.next_transaction_id();
        let mut tx = ConfigTransaction::begin(&mut conn, id);
        debug!("tx {} loading configuration", id);
        let (outcome, message) = if options.commit {
            (
                tx.apply(candidate, &options.commit_options).await,
                "Successfully loaded configuration",
            )
        } else {
            (
                tx.stage(candidate).await,
                "Successfully loaded configuration (not committed)",
            )
        };
        let unlock_error = tx.unlock_error().map(str::to_string);
        drop(tx);
        let unlocked = !conn.holds_config_lock();
        transaction_result(id, outcome, message, unlock_error, unlocked)
    }
}

// Unlock failures never change the reported outcome, they are appended to it.
// `unlocked` is the session's lock state after the transaction ended.
fn transaction_result(
    tx_id: u64,
    outcome: Result<(), DeviceError>,
    success_message: &str,
    unlock_error: Option<String>,
    unlocked: bool,
) -> OperationResult {
    let mut result = match outcome {
        Ok(()) => OperationResult::ok(success_message),
        Err(err) => OperationResult::failed(err.to_string()),
    };
    if let Some(reason) = unlock_error.as_ref() {
        warn!("tx {} left the configuration locked: {}", tx_id, reason);
        result.message.push_str("; could not unlock config!");
    }
    result.with_payload(json!({ "tx_id": tx_id, "unlocked": unlocked }))
}

fn facts_value(facts: Facts) -> Value {
    Value::Object(facts.into_iter().collect())
}

fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
