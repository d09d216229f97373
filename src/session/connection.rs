use super::*;

impl DeviceConnection {
    /// Creates a disconnected session for `target`.
    pub fn new(target: DeviceTarget, config: &SessionConfig, recorder: Option<AuditRecorder>) -> Self {
        Self {
            device_id: target.device_id(),
            credentials_hash: target.credentials.fingerprint(),
            target,
            state: ConnectionState::Disconnected,
            transport: None,
            facts: Facts::new(),
            config_locked: false,
            connect_timeout: config.connect_timeout(),
            probe_timeout: config.probe_timeout(),
            recorder,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Checks if the underlying transport is still active.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    /// Whether this session holds the configuration lock.
    pub fn holds_config_lock(&self) -> bool {
        self.config_locked
    }

    /// Checks if the session was opened with the same login (used for reuse).
    pub fn matches_credentials(&self, credentials: &crate::device::Credentials) -> bool {
        self.credentials_hash == credentials.fingerprint()
    }

    /// Cached facts. Empty until the first successful gather.
    pub fn facts(&self) -> &Facts {
        &self.facts
    }

    /// Opens the transport.
    ///
    /// No retry is attempted; a failure leaves the connection `Faulted`.
    pub async fn connect(&mut self, connector: &dyn TransportConnector) -> Result<(), DeviceError> {
        if self.is_connected() {
            return Ok(());
        }
        // A stale transport is dropped before a new one is opened.
        self.transport = None;
        self.config_locked = false;

        let attempt = tokio::time::timeout(self.connect_timeout, connector.connect(&self.target)).await;
        let transport = match attempt {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => {
                self.state = ConnectionState::Faulted;
                self.audit(None, AuditEvent::ConnectionFaulted {
                    reason: err.to_string(),
                });
                return Err(DeviceError::Connect(err.to_string()));
            }
            Err(_) => {
                self.state = ConnectionState::Faulted;
                let reason = format!(
                    "no session after {}s",
                    self.connect_timeout.as_secs()
                );
                self.audit(None, AuditEvent::ConnectionFaulted {
                    reason: reason.clone(),
                });
                return Err(DeviceError::Connect(reason));
            }
        };

        self.transport = Some(transport);
        self.state = ConnectionState::Connected;
        debug!("{} session established", self.device_id);
        self.audit(None, AuditEvent::ConnectionEstablished);

        if let Err(err) = self.refresh_facts().await {
            warn!("{} could not gather facts on connect: {}", self.device_id, err);
        }
        Ok(())
    }

    /// Closes the transport. Close errors are logged, the session is dropped either way.
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if self.config_locked {
                warn!(
                    "{} closing session while holding the configuration lock",
                    self.device_id
                );
            }
            if let Err(err) = transport.close().await {
                debug!("{} error closing session: {}", self.device_id, err);
            }
            self.audit(None, AuditEvent::ConnectionClosed {
                reason: "disconnect requested".to_string(),
            });
        }
        self.config_locked = false;
        self.state = ConnectionState::Disconnected;
        debug!("{} session closed", self.device_id);
    }

    /// Runs a raw RPC.
    ///
    /// Use [`rpc`](Self::rpc) for catalog-checked calls.
    pub async fn invoke(&mut self, name: &str, params: &RpcParams) -> Result<serde_json::Value, DeviceError> {
        trace!("{} rpc {} {:?}", self.device_id, name, params);
        let outcome = self.transport_mut()?.invoke_rpc(name, params).await;
        let outcome = self.observe(outcome);
        self.audit(None, AuditEvent::RpcInvoked {
            name: name.to_string(),
            success: outcome.is_ok(),
            output: outcome.as_ref().ok().cloned(),
        });
        outcome.map_err(|err| DeviceError::Rpc {
            name: name.to_string(),
            cause: err.to_string(),
        })
    }

    /// Resolves `name` against the RPC catalog and runs it.
    pub async fn rpc(&mut self, name: &str, params: &RpcParams) -> Result<serde_json::Value, DeviceError> {
        let (name, params) = rpc::prepare(name, params)?;
        self.invoke(&name, &params).await
    }

    /// Re-queries device facts and replaces the cache.
    pub async fn refresh_facts(&mut self) -> Result<Facts, DeviceError> {
        let outcome = self.transport_mut()?.facts().await;
        let facts = self.observe(outcome).map_err(|err| DeviceError::Rpc {
            name: "facts".to_string(),
            cause: err.to_string(),
        })?;
        self.facts = facts;
        debug!("{} facts refreshed ({} entries)", self.device_id, self.facts.len());
        Ok(self.facts.clone())
    }

    /// Liveness check, independent of lock or transaction state.
    ///
    /// An unreachable device is a successful probe with `reachable == false`.
    pub async fn probe(&mut self) -> Result<ProbeResult, DeviceError> {
        let timeout = self.probe_timeout;
        let started = Instant::now();
        let transport = self.transport_mut()?;
        let reachable = match tokio::time::timeout(timeout, transport.probe(timeout)).await {
            Ok(Ok(reachable)) => reachable,
            Ok(Err(err)) => {
                debug!("probe error: {}", err);
                false
            }
            Err(_) => false,
        };
        Ok(ProbeResult {
            reachable,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Takes the configuration lock for this session.
    pub async fn lock_config(&mut self, tx_id: Option<u64>) -> Result<(), DeviceError> {
        if self.config_locked {
            let reason = "configuration already locked by this session".to_string();
            self.audit(tx_id, AuditEvent::LockFailed {
                reason: reason.clone(),
            });
            return Err(DeviceError::Lock(reason));
        }
        let outcome = self.transport_mut()?.lock().await;
        match self.observe(outcome) {
            Ok(()) => {
                self.config_locked = true;
                self.audit(tx_id, AuditEvent::Locked);
                Ok(())
            }
            Err(err) => {
                self.audit(tx_id, AuditEvent::LockFailed {
                    reason: err.to_string(),
                });
                Err(DeviceError::Lock(err.to_string()))
            }
        }
    }

    /// Releases the configuration lock.
    ///
    /// Succeeds without a device call when this session does not hold the lock.
    pub async fn unlock_config(&mut self, tx_id: Option<u64>) -> Result<(), DeviceError> {
        if !self.config_locked {
            return Ok(());
        }
        let outcome = self.transport_mut()?.unlock().await;
        match self.observe(outcome) {
            Ok(()) => {
                self.config_locked = false;
                self.audit(tx_id, AuditEvent::Unlocked);
                Ok(())
            }
            Err(err) => {
                error!(
                    "{} could not unlock config, manual intervention may be needed: {}",
                    self.device_id, err
                );
                self.audit(tx_id, AuditEvent::UnlockFailed {
                    reason: err.to_string(),
                });
                Err(DeviceError::Unlock(err.to_string()))
            }
        }
    }

    pub async fn load_candidate(&mut self, candidate: &CandidateConfig) -> Result<(), DeviceError> {
        let outcome = self.transport_mut()?.load(candidate).await;
        self.observe(outcome)
            .map_err(|err| DeviceError::Load(err.to_string()))
    }

    pub async fn commit_check(&mut self) -> Result<bool, DeviceError> {
        let outcome = self.transport_mut()?.commit_check().await;
        self.observe(outcome).map_err(|err| DeviceError::Rpc {
            name: "commit-check".to_string(),
            cause: err.to_string(),
        })
    }

    pub async fn commit(&mut self, options: &CommitOptions) -> Result<(), DeviceError> {
        let outcome = self.transport_mut()?.commit(options).await;
        self.observe(outcome)
            .map_err(|err| DeviceError::CommitApply(err.to_string()))
    }

    pub async fn rollback(&mut self, revision: u32) -> Result<(), DeviceError> {
        let outcome = self.transport_mut()?.rollback(revision).await;
        self.observe(outcome)
            .map_err(|err| DeviceError::Rollback(err.to_string()))
    }

    /// Candidate versus active configuration.
    pub async fn diff(&mut self) -> Result<Option<String>, DeviceError> {
        let outcome = self.transport_mut()?.diff().await;
        self.observe(outcome).map_err(|err| DeviceError::Rpc {
            name: "diff".to_string(),
            cause: err.to_string(),
        })
    }

    /// Schedules a reboot or power-off.
    pub async fn shutdown(&mut self, request: &ShutdownRequest) -> Result<(), DeviceError> {
        request.validate()?;
        let transport = self.transport_mut()?;
        let outcome = if request.reboot {
            transport
                .reboot(request.delay_minutes, request.at.as_deref())
                .await
        } else {
            transport.power_off(request.delay_minutes).await
        };
        self.observe(outcome)
            .map_err(|err| DeviceError::Shutdown(err.to_string()))
    }

    pub(super) fn audit(&self, tx_id: Option<u64>, event: AuditEvent) {
        if let Some(recorder) = self.recorder.as_ref() {
            let _ = recorder.record(&self.device_id, tx_id, event);
        }
    }

    fn transport_mut(&mut self) -> Result<&mut Box<dyn DeviceTransport>, DeviceError> {
        if self.state != ConnectionState::Connected {
            return Err(DeviceError::NotConnected(self.device_id.clone()));
        }
        self.transport
            .as_mut()
            .ok_or_else(|| DeviceError::NotConnected(self.device_id.clone()))
    }

    // A closed session is fatal: the transport is dropped and the connection
    // is faulted so the registry reconnects on next use.
    fn observe<T>(&mut self, outcome: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(TransportError::Closed) = &outcome {
            warn!("{} session closed by transport", self.device_id);
            self.transport = None;
            self.config_locked = false;
            self.state = ConnectionState::Faulted;
            self.audit(None, AuditEvent::ConnectionFaulted {
                reason: "session closed".to_string(),
            });
        }
        outcome
    }
}
