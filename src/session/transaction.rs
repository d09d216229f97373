use super::*;

/// Phase of a configuration transaction.
///
/// Happy path: `Idle → Locking → Locked → Loading → Loaded → Validating →
/// Validated → Committing → Committed`. Any failure after `Idle` goes through
/// `Aborting` to `Unlocked`, which is the terminal failure phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TxPhase {
    Idle,
    Locking,
    Locked,
    Loading,
    Loaded,
    Validating,
    Validated,
    Committing,
    Committed,
    Aborting,
    Unlocked,
}

impl TxPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxPhase::Committed | TxPhase::Unlocked)
    }
}

/// Whether the transaction holds the device's configuration lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Locked,
}

/// What the transaction knows about the device's candidate configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CandidateState {
    Empty,
    Loaded,
    Validated,
}

/// One configuration change on one device.
///
/// The transaction borrows the connection exclusively for its whole life, so
/// it cannot outlive the operation that created it. Every exit path after a
/// successful [`lock`](Self::lock) releases the lock: load failure, refused
/// commit, failed commit and successful commit all route through unlock.
///
/// When the session already holds the configuration lock (taken explicitly
/// through the facade), the transaction adopts it and leaves it held on exit;
/// the explicit holder releases it.
pub struct ConfigTransaction<'a> {
    conn: &'a mut DeviceConnection,
    id: u64,
    phase: TxPhase,
    lock: LockState,
    borrowed_lock: bool,
    candidate: CandidateState,
    unlock_error: Option<String>,
}

impl<'a> ConfigTransaction<'a> {
    /// Starts a transaction in `Idle`. `id` correlates its log and audit entries.
    pub fn begin(conn: &'a mut DeviceConnection, id: u64) -> Self {
        debug!("{} tx {} started", conn.device_id(), id);
        conn.audit(Some(id), AuditEvent::TxStarted);
        Self {
            conn,
            id,
            phase: TxPhase::Idle,
            lock: LockState::Unlocked,
            borrowed_lock: false,
            candidate: CandidateState::Empty,
            unlock_error: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> TxPhase {
        self.phase
    }

    pub fn lock_state(&self) -> LockState {
        self.lock
    }

    pub fn candidate_state(&self) -> CandidateState {
        self.candidate
    }

    /// Whether the lock was adopted from the session instead of taken.
    pub fn borrowed_lock(&self) -> bool {
        self.borrowed_lock
    }

    /// Reason of the last failed unlock, if the lock could not be released.
    pub fn unlock_error(&self) -> Option<&str> {
        self.unlock_error.as_deref()
    }

    /// Takes the configuration lock.
    ///
    /// On failure the transaction ends in `Unlocked` without ever having held
    /// the lock.
    pub async fn lock(&mut self) -> Result<(), DeviceError> {
        if self.phase != TxPhase::Idle {
            return Err(self.invalid("lock"));
        }
        self.phase = TxPhase::Locking;
        if self.conn.holds_config_lock() {
            self.lock = LockState::Locked;
            self.borrowed_lock = true;
            self.phase = TxPhase::Locked;
            debug!(
                "{} tx {} adopted the session's configuration lock",
                self.conn.device_id(),
                self.id
            );
            return Ok(());
        }
        match self.conn.lock_config(Some(self.id)).await {
            Ok(()) => {
                self.lock = LockState::Locked;
                self.phase = TxPhase::Locked;
                debug!("{} tx {} locked config", self.conn.device_id(), self.id);
                Ok(())
            }
            Err(err) => {
                self.phase = TxPhase::Unlocked;
                debug!("{} tx {} could not lock config: {}", self.conn.device_id(), self.id, err);
                Err(err)
            }
        }
    }

    /// Submits a candidate. Requires `Locked`.
    ///
    /// A rejected candidate aborts the transaction (the lock is released)
    /// before the error is returned.
    pub async fn load_config(&mut self, candidate: &CandidateConfig) -> Result<(), DeviceError> {
        if self.phase != TxPhase::Locked {
            return Err(self.invalid("load"));
        }
        self.phase = TxPhase::Loading;
        let outcome = match candidate.validate() {
            Ok(()) => self.conn.load_candidate(candidate).await,
            Err(err) => Err(DeviceError::Load(err.to_string())),
        };
        match outcome {
            Ok(()) => {
                self.candidate = CandidateState::Loaded;
                self.phase = TxPhase::Loaded;
                self.conn.audit(
                    Some(self.id),
                    AuditEvent::CandidateLoaded {
                        format: candidate.format.as_str().to_string(),
                        action: format!("{:?}", candidate.action).to_ascii_lowercase(),
                    },
                );
                Ok(())
            }
            Err(err) => {
                error!("{} tx {} {}", self.conn.device_id(), self.id, err);
                self.conn.audit(
                    Some(self.id),
                    AuditEvent::LoadFailed {
                        reason: err.to_string(),
                    },
                );
                let _ = self.abort().await;
                Err(err)
            }
        }
    }

    /// Adopts a candidate that is already staged on the device. Requires `Locked`.
    pub fn attach_candidate(&mut self) -> Result<(), DeviceError> {
        if self.phase != TxPhase::Locked {
            return Err(self.invalid("attach candidate"));
        }
        self.candidate = CandidateState::Loaded;
        self.phase = TxPhase::Loaded;
        Ok(())
    }

    /// Dry-run validation of the candidate.
    ///
    /// Moves to `Validated` only when the device accepts the candidate. A
    /// transport error counts as a failed check. Outside `Loaded`/`Validated`
    /// this returns false without contacting the device.
    pub async fn commit_check(&mut self) -> bool {
        if !matches!(self.phase, TxPhase::Loaded | TxPhase::Validated) {
            warn!(
                "{} tx {} commit check in phase {:?}",
                self.conn.device_id(),
                self.id,
                self.phase
            );
            return false;
        }
        self.phase = TxPhase::Validating;
        let passed = match self.conn.commit_check().await {
            Ok(passed) => passed,
            Err(err) => {
                warn!("{} tx {} commit check error: {}", self.conn.device_id(), self.id, err);
                false
            }
        };
        self.conn
            .audit(Some(self.id), AuditEvent::CommitChecked { passed });
        if passed {
            self.candidate = CandidateState::Validated;
            self.phase = TxPhase::Validated;
        } else {
            self.candidate = CandidateState::Loaded;
            self.phase = TxPhase::Loaded;
        }
        passed
    }

    /// Applies a validated candidate, then releases the lock.
    ///
    /// Without a passing [`commit_check`](Self::commit_check) in this
    /// transaction the device is never asked to apply; the transaction aborts
    /// with [`DeviceError::CommitCheckFailed`]. An apply failure after a passing
    /// check is reported as [`DeviceError::CommitApply`].
    pub async fn commit(&mut self, options: &CommitOptions) -> Result<(), DeviceError> {
        if self.phase.is_terminal() {
            return Err(self.invalid("commit"));
        }
        if self.phase != TxPhase::Validated {
            debug!(
                "{} tx {} commit refused in phase {:?}",
                self.conn.device_id(),
                self.id,
                self.phase
            );
            let _ = self.abort().await;
            return Err(DeviceError::CommitCheckFailed);
        }

        self.phase = TxPhase::Committing;
        let outcome = self.conn.commit(options).await;
        match &outcome {
            Ok(()) => self.conn.audit(
                Some(self.id),
                AuditEvent::Committed {
                    comment: options.comment.clone(),
                },
            ),
            Err(err) => self.conn.audit(
                Some(self.id),
                AuditEvent::CommitFailed {
                    reason: err.to_string(),
                },
            ),
        }
        let _ = self.release().await;

        match outcome {
            Ok(()) => {
                self.candidate = CandidateState::Empty;
                self.phase = TxPhase::Committed;
                info!("{} tx {} committed", self.conn.device_id(), self.id);
                Ok(())
            }
            Err(err) => {
                self.phase = TxPhase::Unlocked;
                error!("{} tx {} {}", self.conn.device_id(), self.id, err);
                Err(err)
            }
        }
    }

    /// Releases the lock.
    ///
    /// Safe to call repeatedly: once released, further calls succeed without
    /// contacting the device. Releasing in the middle of a transaction aborts it.
    pub async fn unlock(&mut self) -> Result<(), DeviceError> {
        if self.lock == LockState::Unlocked {
            return Ok(());
        }
        if self.phase.is_terminal() {
            return self.release().await;
        }
        self.abort().await
    }

    /// Abandons the transaction, releasing the lock if held.
    pub async fn abort(&mut self) -> Result<(), DeviceError> {
        if self.phase.is_terminal() {
            return self.release().await;
        }
        if self.phase == TxPhase::Idle {
            self.phase = TxPhase::Unlocked;
            return Ok(());
        }
        self.phase = TxPhase::Aborting;
        debug!("{} tx {} aborting", self.conn.device_id(), self.id);
        let released = self.release().await;
        self.phase = TxPhase::Unlocked;
        released
    }

    /// Candidate versus active configuration. Requires a loaded candidate.
    pub async fn diff(&mut self) -> Result<Option<String>, DeviceError> {
        if !matches!(self.phase, TxPhase::Loaded | TxPhase::Validated) {
            return Err(self.invalid("diff"));
        }
        self.conn.diff().await
    }

    /// Ends a non-committing transaction: the lock is released and the
    /// candidate stays staged on the device for a later commit.
    pub async fn finish_staged(&mut self) -> Result<(), DeviceError> {
        if !matches!(self.phase, TxPhase::Loaded | TxPhase::Validated) {
            return Err(self.invalid("finish staged"));
        }
        let released = self.release().await;
        self.phase = TxPhase::Unlocked;
        released
    }

    /// Reverts the active configuration to a committed revision
    /// (0 = most recent prior commit) under the configuration lock.
    ///
    /// Independent of the load/check/commit sequence. Requires `Idle`.
    pub async fn rollback(&mut self, revision: u32) -> Result<(), DeviceError> {
        if self.phase != TxPhase::Idle {
            return Err(self.invalid("rollback"));
        }
        self.lock().await?;
        let outcome = self.conn.rollback(revision).await;
        self.conn.audit(
            Some(self.id),
            AuditEvent::RolledBack {
                revision,
                success: outcome.is_ok(),
            },
        );
        let _ = self.release().await;
        match outcome {
            Ok(()) => {
                self.phase = TxPhase::Committed;
                info!("{} tx {} rolled back to {}", self.conn.device_id(), self.id, revision);
                Ok(())
            }
            Err(err) => {
                self.phase = TxPhase::Unlocked;
                warn!("{} tx {} {}", self.conn.device_id(), self.id, err);
                Err(err)
            }
        }
    }

    /// Lock, load, check, commit and unlock in one call.
    pub async fn apply(
        &mut self,
        candidate: &CandidateConfig,
        options: &CommitOptions,
    ) -> Result<(), DeviceError> {
        self.lock().await?;
        self.load_config(candidate).await?;
        self.commit_check().await;
        self.commit(options).await
    }

    /// Lock, load and unlock, leaving the candidate staged.
    pub async fn stage(&mut self, candidate: &CandidateConfig) -> Result<(), DeviceError> {
        self.lock().await?;
        self.load_config(candidate).await?;
        self.finish_staged().await
    }

    /// Lock, check and commit whatever candidate is already staged, then unlock.
    pub async fn commit_staged(&mut self, options: &CommitOptions) -> Result<(), DeviceError> {
        self.lock().await?;
        self.attach_candidate()?;
        self.commit_check().await;
        self.commit(options).await
    }

    async fn release(&mut self) -> Result<(), DeviceError> {
        if self.lock == LockState::Unlocked {
            return Ok(());
        }
        if self.borrowed_lock {
            // The explicit holder keeps the device lock.
            self.lock = LockState::Unlocked;
            return Ok(());
        }
        match self.conn.unlock_config(Some(self.id)).await {
            Ok(()) => {
                self.lock = LockState::Unlocked;
                self.unlock_error = None;
                debug!("{} tx {} unlocked config", self.conn.device_id(), self.id);
                Ok(())
            }
            Err(err) => {
                self.unlock_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn invalid(&self, operation: &str) -> DeviceError {
        DeviceError::InvalidTransaction(format!(
            "tx {}: cannot {operation} in phase {:?}",
            self.id, self.phase
        ))
    }
}

impl Drop for ConfigTransaction<'_> {
    fn drop(&mut self) {
        if self.lock == LockState::Locked && !self.borrowed_lock {
            warn!(
                "{} tx {} dropped while holding the configuration lock",
                self.conn.device_id(),
                self.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConfigFormat, Credentials, LoadAction};
    use crate::simulator::SimulatedDevice;

    async fn connected(device: &SimulatedDevice) -> DeviceConnection {
        let target = DeviceTarget::new("r1", Credentials::password("admin", "pw"));
        let mut conn = DeviceConnection::new(target, &SessionConfig::default(), None);
        conn.connect(&device.connector()).await.expect("connect");
        conn
    }

    fn candidate() -> CandidateConfig {
        CandidateConfig::new(
            "set system host-name r1",
            ConfigFormat::Set,
            LoadAction::Merge,
        )
    }

    #[tokio::test]
    async fn load_requires_lock() {
        let device = SimulatedDevice::new();
        let mut conn = connected(&device).await;
        let mut tx = ConfigTransaction::begin(&mut conn, 1);

        let err = tx.load_config(&candidate()).await.expect_err("load before lock");
        assert!(matches!(err, DeviceError::InvalidTransaction(_)));
        assert_eq!(tx.phase(), TxPhase::Idle);
        assert_eq!(device.calls("load"), 0);
    }

    #[tokio::test]
    async fn lock_twice_is_invalid() {
        let device = SimulatedDevice::new();
        let mut conn = connected(&device).await;
        let mut tx = ConfigTransaction::begin(&mut conn, 1);

        tx.lock().await.expect("lock");
        let err = tx.lock().await.expect_err("second lock");
        assert!(matches!(err, DeviceError::InvalidTransaction(_)));
        tx.unlock().await.expect("unlock");
        assert_eq!(device.calls("lock"), 1);
    }

    #[tokio::test]
    async fn commit_from_idle_never_applies() {
        let device = SimulatedDevice::new();
        let mut conn = connected(&device).await;
        let mut tx = ConfigTransaction::begin(&mut conn, 1);

        let err = tx
            .commit(&CommitOptions::default())
            .await
            .expect_err("commit without check");
        assert!(matches!(err, DeviceError::CommitCheckFailed));
        assert_eq!(tx.phase(), TxPhase::Unlocked);
        assert_eq!(device.calls("commit"), 0);
    }

    #[tokio::test]
    async fn commit_check_outside_loaded_is_false() {
        let device = SimulatedDevice::new();
        let mut conn = connected(&device).await;
        let mut tx = ConfigTransaction::begin(&mut conn, 1);

        tx.lock().await.expect("lock");
        assert!(!tx.commit_check().await);
        assert_eq!(device.calls("commit_check"), 0);
        tx.abort().await.expect("abort");
        assert_eq!(tx.lock_state(), LockState::Unlocked);
    }

    #[tokio::test]
    async fn check_error_counts_as_failed_check() {
        let device = SimulatedDevice::new();
        device.fail_commit_check_with("rpc timeout");
        let mut conn = connected(&device).await;
        let mut tx = ConfigTransaction::begin(&mut conn, 1);

        tx.lock().await.expect("lock");
        tx.load_config(&candidate()).await.expect("load");
        assert!(!tx.commit_check().await);
        assert_eq!(tx.candidate_state(), CandidateState::Loaded);
    }

    #[tokio::test]
    async fn terminal_transaction_cannot_be_reused() {
        let device = SimulatedDevice::new();
        let mut conn = connected(&device).await;
        let mut tx = ConfigTransaction::begin(&mut conn, 1);

        tx.apply(&candidate(), &CommitOptions::default())
            .await
            .expect("apply");
        assert_eq!(tx.phase(), TxPhase::Committed);
        assert!(matches!(
            tx.lock().await,
            Err(DeviceError::InvalidTransaction(_))
        ));
        assert!(matches!(
            tx.commit(&CommitOptions::default()).await,
            Err(DeviceError::InvalidTransaction(_))
        ));
    }

    #[tokio::test]
    async fn diff_requires_candidate() {
        let device = SimulatedDevice::new();
        let mut conn = connected(&device).await;
        let mut tx = ConfigTransaction::begin(&mut conn, 1);

        tx.lock().await.expect("lock");
        assert!(matches!(
            tx.diff().await,
            Err(DeviceError::InvalidTransaction(_))
        ));
        tx.load_config(&candidate()).await.expect("load");
        let diff = tx.diff().await.expect("diff").expect("some diff");
        assert!(diff.contains("+ set system host-name r1"));
        tx.abort().await.expect("abort");
    }

    #[tokio::test]
    async fn session_lock_is_adopted_and_kept() {
        let device = SimulatedDevice::new();
        let mut conn = connected(&device).await;
        conn.lock_config(None).await.expect("session lock");

        let mut tx = ConfigTransaction::begin(&mut conn, 1);
        tx.apply(&candidate(), &CommitOptions::default())
            .await
            .expect("apply under session lock");
        assert!(tx.borrowed_lock());
        assert_eq!(tx.phase(), TxPhase::Committed);
        assert_eq!(tx.lock_state(), LockState::Unlocked);
        drop(tx);

        assert_eq!(device.calls("lock"), 1);
        assert_eq!(device.calls("unlock"), 0);
        assert!(conn.holds_config_lock());
        assert!(device.is_locked());

        conn.unlock_config(None).await.expect("session unlock");
        assert!(!device.is_locked());
    }

    #[tokio::test]
    async fn invalid_candidate_is_rejected_before_the_device() {
        let device = SimulatedDevice::new();
        let mut conn = connected(&device).await;
        let mut tx = ConfigTransaction::begin(&mut conn, 1);

        tx.lock().await.expect("lock");
        let bad = CandidateConfig::new("set a b", ConfigFormat::Set, LoadAction::Override);
        let err = tx.load_config(&bad).await.expect_err("invalid candidate");
        assert!(matches!(err, DeviceError::Load(_)));
        assert_eq!(device.calls("load"), 0);
        assert_eq!(tx.phase(), TxPhase::Unlocked);
        assert_eq!(tx.lock_state(), LockState::Unlocked);
        assert!(!device.is_locked());
    }
}
