use super::*;

impl SessionRegistry {
    /// Creates an empty registry. Nothing connects until the first [`get`](Self::get).
    pub fn new(connector: Arc<dyn TransportConnector>, config: SessionConfig) -> Self {
        let recorder = match config.audit_level {
            AuditLevel::Off => None,
            level => Some(AuditRecorder::with_max_entries(
                level,
                config.audit_max_entries,
            )),
        };
        Self::build(connector, config, recorder)
    }

    /// Creates a registry that records into `recorder`.
    pub fn with_recorder(
        connector: Arc<dyn TransportConnector>,
        config: SessionConfig,
        recorder: AuditRecorder,
    ) -> Self {
        Self::build(connector, config, Some(recorder))
    }

    fn build(
        connector: Arc<dyn TransportConnector>,
        config: SessionConfig,
        recorder: Option<AuditRecorder>,
    ) -> Self {
        // Unbounded and without idle eviction: entries leave only on teardown.
        let cache = Cache::builder().build();
        Self {
            cache,
            connector,
            config,
            recorder,
            next_tx_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn recorder(&self) -> Option<&AuditRecorder> {
        self.recorder.as_ref()
    }

    /// Next transaction id. Monotonic for the life of the registry.
    pub fn next_transaction_id(&self) -> u64 {
        self.next_tx_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Gets the live connection for `target` or creates and connects one.
    ///
    /// A cached entry is reused when it is connected and was opened with the
    /// same credentials. Otherwise it is reconnected in place. Concurrent first
    /// calls for one device share a single connect.
    pub async fn get(&self, target: &DeviceTarget) -> Result<SharedConnection, DeviceError> {
        let device_id = target.device_id();

        if let Some(shared) = self.cache.get(&device_id).await {
            let mut conn = shared.lock().await;
            if conn.is_connected() && conn.matches_credentials(&target.credentials) {
                debug!("Cache hit, reusing: {}", device_id);
                drop(conn);
                return Ok(shared);
            }
            if conn.is_connected() {
                debug!("Credentials changed, reconnecting: {}", device_id);
            } else {
                debug!("Cached connection {} is {:?}, reconnecting", device_id, conn.state());
            }
            conn.disconnect().await;
            *conn = DeviceConnection::new(target.clone(), &self.config, self.recorder.clone());
            conn.connect(self.connector.as_ref()).await?;
            drop(conn);
            return Ok(shared);
        }

        debug!("Cache miss, creating new connection for {}...", device_id);
        let init = async {
            let mut conn =
                DeviceConnection::new(target.clone(), &self.config, self.recorder.clone());
            conn.connect(self.connector.as_ref()).await?;
            Ok::<SharedConnection, DeviceError>(Arc::new(Mutex::new(conn)))
        };
        let shared = self
            .cache
            .try_get_with(device_id.clone(), init)
            .await
            .map_err(|err| match Arc::try_unwrap(err) {
                Ok(err) => err,
                // Another caller still holds the shared error.
                Err(shared) => match shared.as_ref() {
                    DeviceError::Connect(cause) => DeviceError::Connect(cause.clone()),
                    other => DeviceError::Connect(other.to_string()),
                },
            })?;
        debug!("New connection for {} has been cached.", device_id);
        Ok(shared)
    }

    /// Existing entry for `device_id`, without connecting.
    pub async fn lookup(&self, device_id: &str) -> Option<SharedConnection> {
        self.cache.get(device_id).await
    }

    /// Ids of all cached entries.
    pub fn device_ids(&self) -> Vec<String> {
        self.cache.iter().map(|(key, _)| key.as_ref().clone()).collect()
    }

    /// Disconnects and removes one device. Returns whether an entry existed.
    pub async fn teardown(&self, device_id: &str) -> bool {
        let Some(shared) = self.cache.remove(device_id).await else {
            return false;
        };
        shared.lock().await.disconnect().await;
        info!("{} torn down", device_id);
        true
    }

    /// Disconnects and removes every device.
    pub async fn teardown_all(&self) {
        for device_id in self.device_ids() {
            self.teardown(&device_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Credentials;
    use crate::simulator::SimulatedDevice;

    fn registry(device: &SimulatedDevice) -> SessionRegistry {
        SessionRegistry::new(Arc::new(device.connector()), SessionConfig::default())
    }

    fn target(password: &str) -> DeviceTarget {
        DeviceTarget::new("r1", Credentials::password("admin", password))
    }

    #[tokio::test]
    async fn get_reuses_live_connection() {
        let device = SimulatedDevice::new();
        let registry = registry(&device);

        let first = registry.get(&target("pw")).await.expect("first get");
        let second = registry.get(&target("pw")).await.expect("second get");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(device.calls("connect"), 1);
        assert_eq!(registry.device_ids(), vec!["admin@r1:830".to_string()]);
    }

    #[tokio::test]
    async fn get_reconnects_after_fault() {
        let device = SimulatedDevice::new();
        let registry = registry(&device);

        let shared = registry.get(&target("pw")).await.expect("get");
        device.drop_sessions();
        {
            let mut conn = shared.lock().await;
            assert!(conn.refresh_facts().await.is_err());
            assert_eq!(conn.state(), ConnectionState::Faulted);
        }

        let again = registry.get(&target("pw")).await.expect("reconnect");
        assert!(again.lock().await.is_connected());
        assert_eq!(device.calls("connect"), 2);
    }

    #[tokio::test]
    async fn get_reconnects_when_credentials_change() {
        let device = SimulatedDevice::new();
        let registry = registry(&device);

        registry.get(&target("old")).await.expect("get");
        let shared = registry.get(&target("new")).await.expect("get with new password");

        assert!(shared.lock().await.matches_credentials(&target("new").credentials));
        assert_eq!(device.calls("connect"), 2);
        assert_eq!(device.calls("close"), 1);
    }

    #[tokio::test]
    async fn connect_failure_is_not_cached() {
        let device = SimulatedDevice::new();
        device.refuse_connections("no route to host");
        let registry = registry(&device);

        let err = match registry.get(&target("pw")).await {
            Ok(_) => panic!("connect should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, DeviceError::Connect(_)));
        assert!(err.to_string().contains("no route to host"));
        assert!(registry.lookup("admin@r1:830").await.is_none());

        device.accept_connections();
        registry.get(&target("pw")).await.expect("second attempt");
        assert_eq!(device.calls("connect"), 2);
    }

    #[tokio::test]
    async fn shared_connect_failure_is_not_double_wrapped() {
        let device = SimulatedDevice::new();
        device.refuse_connections("no route to host");
        let registry = registry(&device);

        let first_target = target("pw");
        let second_target = target("pw");
        let (first, second) = tokio::join!(registry.get(&first_target), registry.get(&second_target));
        for outcome in [first, second] {
            let err = match outcome {
                Ok(_) => panic!("connect should fail"),
                Err(err) => err,
            };
            assert_eq!(
                err.to_string(),
                "connect failed: device unreachable: no route to host"
            );
        }
    }

    #[tokio::test]
    async fn registry_bounds_its_audit_log() {
        let device = SimulatedDevice::new();
        let config = SessionConfig {
            audit_max_entries: 4,
            ..SessionConfig::default()
        };
        let registry = SessionRegistry::new(Arc::new(device.connector()), config);
        let recorder = registry.recorder().expect("recorder").clone();
        assert_eq!(recorder.max_entries(), 4);

        let shared = registry.get(&target("pw")).await.expect("get");
        let mut conn = shared.lock().await;
        for _ in 0..10 {
            conn.lock_config(None).await.expect("lock");
            conn.unlock_config(None).await.expect("unlock");
        }
        assert_eq!(recorder.entries().expect("entries").len(), 4);
    }

    #[tokio::test]
    async fn teardown_removes_entry() {
        let device = SimulatedDevice::new();
        let registry = registry(&device);
        registry.get(&target("pw")).await.expect("get");

        assert!(registry.teardown("admin@r1:830").await);
        assert!(!registry.teardown("admin@r1:830").await);
        assert!(registry.lookup("admin@r1:830").await.is_none());
        assert_eq!(device.calls("close"), 1);
    }

    #[tokio::test]
    async fn transaction_ids_are_monotonic() {
        let device = SimulatedDevice::new();
        let registry = registry(&device);
        let a = registry.next_transaction_id();
        let b = registry.next_transaction_id();
        assert_eq!(a, 1);
        assert!(b > a);
    }
}
