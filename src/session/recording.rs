use super::*;
use crate::config::DEFAULT_AUDIT_MAX_ENTRIES;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Audit recording granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    /// Disable recording.
    Off,
    /// Record lifecycle and transaction events.
    #[default]
    KeyEventsOnly,
    /// Also keep RPC output.
    Full,
}

/// A single recorded event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditRecord {
    pub ts_ms: u128,
    pub device_id: String,
    /// Transaction the event belongs to, if any.
    #[serde(default)]
    pub tx_id: Option<u64>,
    pub event: AuditEvent,
}

/// Supported audit event types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    ConnectionEstablished,
    ConnectionClosed {
        reason: String,
    },
    ConnectionFaulted {
        reason: String,
    },
    TxStarted,
    Locked,
    LockFailed {
        reason: String,
    },
    CandidateLoaded {
        format: String,
        action: String,
    },
    LoadFailed {
        reason: String,
    },
    CommitChecked {
        passed: bool,
    },
    Committed {
        #[serde(default)]
        comment: Option<String>,
    },
    CommitFailed {
        reason: String,
    },
    Unlocked,
    UnlockFailed {
        reason: String,
    },
    RolledBack {
        revision: u32,
        success: bool,
    },
    RpcInvoked {
        name: String,
        success: bool,
        #[serde(default)]
        output: Option<serde_json::Value>,
    },
}

/// In-memory audit recorder. Clones share the same log.
///
/// The log is bounded: once `max_entries` records are held, the oldest record
/// is dropped for every new one.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    level: AuditLevel,
    max_entries: usize,
    entries: Arc<StdMutex<VecDeque<AuditRecord>>>,
}

impl AuditRecorder {
    /// Create a recorder with the given level and the default bound.
    pub fn new(level: AuditLevel) -> Self {
        Self::with_max_entries(level, DEFAULT_AUDIT_MAX_ENTRIES)
    }

    /// Create a recorder keeping at most `max_entries` records (at least one).
    pub fn with_max_entries(level: AuditLevel, max_entries: usize) -> Self {
        Self {
            level,
            max_entries: max_entries.max(1),
            entries: Arc::new(StdMutex::new(VecDeque::new())),
        }
    }

    pub fn level(&self) -> AuditLevel {
        self.level
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Record one event.
    pub fn record(
        &self,
        device_id: &str,
        tx_id: Option<u64>,
        event: AuditEvent,
    ) -> Result<(), DeviceError> {
        if self.level == AuditLevel::Off {
            return Ok(());
        }
        let event = match event {
            AuditEvent::RpcInvoked { name, success, .. } if self.level != AuditLevel::Full => {
                AuditEvent::RpcInvoked {
                    name,
                    success,
                    output: None,
                }
            }
            other => other,
        };
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| DeviceError::Internal(format!("audit lock error: {e}")))?;
        while guard.len() >= self.max_entries {
            guard.pop_front();
        }
        guard.push_back(AuditRecord {
            ts_ms: now_ms(),
            device_id: device_id.to_string(),
            tx_id,
            event,
        });
        Ok(())
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Result<Vec<AuditRecord>, DeviceError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| DeviceError::Internal(format!("audit lock error: {e}")))?;
        Ok(guard.iter().cloned().collect())
    }

    /// Records belonging to one transaction, in recording order.
    pub fn entries_for_transaction(&self, tx_id: u64) -> Result<Vec<AuditRecord>, DeviceError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.tx_id == Some(tx_id))
            .collect())
    }

    pub fn clear(&self) -> Result<(), DeviceError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| DeviceError::Internal(format!("audit lock error: {e}")))?;
        guard.clear();
        Ok(())
    }

    /// Export records as JSONL.
    pub fn to_jsonl(&self) -> Result<String, DeviceError> {
        let entries = self.entries()?;
        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            let line = serde_json::to_string(&entry)
                .map_err(|e| DeviceError::Internal(format!("audit encode error: {e}")))?;
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    /// Restore a recorder from JSONL lines.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, DeviceError> {
        let mut parsed = VecDeque::new();
        for line in jsonl.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditRecord = serde_json::from_str(line)
                .map_err(|e| DeviceError::Internal(format!("audit decode error: {e}")))?;
            parsed.push_back(entry);
        }

        Ok(Self {
            level: AuditLevel::Full,
            max_entries: parsed.len().max(DEFAULT_AUDIT_MAX_ENTRIES),
            entries: Arc::new(StdMutex::new(parsed)),
        })
    }
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new(AuditLevel::default())
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_level_records_nothing() {
        let recorder = AuditRecorder::new(AuditLevel::Off);
        recorder
            .record("admin@r1:830", Some(1), AuditEvent::Locked)
            .expect("record");
        assert!(recorder.entries().expect("entries").is_empty());
    }

    #[test]
    fn key_events_only_drops_rpc_output() {
        let recorder = AuditRecorder::new(AuditLevel::KeyEventsOnly);
        recorder
            .record(
                "admin@r1:830",
                None,
                AuditEvent::RpcInvoked {
                    name: "get-software-information".to_string(),
                    success: true,
                    output: Some(serde_json::json!({"version": "21.4R3"})),
                },
            )
            .expect("record");
        let entries = recorder.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            &entries[0].event,
            AuditEvent::RpcInvoked { output: None, .. }
        ));
    }

    #[test]
    fn full_level_keeps_rpc_output() {
        let recorder = AuditRecorder::new(AuditLevel::Full);
        recorder
            .record(
                "admin@r1:830",
                None,
                AuditEvent::RpcInvoked {
                    name: "get-software-information".to_string(),
                    success: true,
                    output: Some(serde_json::json!({"version": "21.4R3"})),
                },
            )
            .expect("record");
        let entries = recorder.entries().expect("entries");
        assert!(matches!(
            &entries[0].event,
            AuditEvent::RpcInvoked { output: Some(_), .. }
        ));
    }

    #[test]
    fn entries_filter_by_transaction() {
        let recorder = AuditRecorder::default();
        recorder.record("d", Some(1), AuditEvent::TxStarted).expect("record");
        recorder.record("d", Some(2), AuditEvent::TxStarted).expect("record");
        recorder.record("d", Some(1), AuditEvent::Locked).expect("record");
        recorder.record("d", None, AuditEvent::ConnectionEstablished).expect("record");

        let tx1 = recorder.entries_for_transaction(1).expect("tx1");
        assert_eq!(tx1.len(), 2);
        assert_eq!(tx1[1].event, AuditEvent::Locked);
    }

    #[test]
    fn jsonl_export_restores_entries() {
        let recorder = AuditRecorder::default();
        recorder
            .record("d", Some(7), AuditEvent::CommitChecked { passed: false })
            .expect("record");
        recorder
            .record(
                "d",
                Some(7),
                AuditEvent::UnlockFailed {
                    reason: "timeout".to_string(),
                },
            )
            .expect("record");

        let jsonl = recorder.to_jsonl().expect("encode");
        assert!(jsonl.contains("\"kind\":\"commit_checked\""));
        let restored = AuditRecorder::from_jsonl(&jsonl).expect("decode");
        let entries = restored.entries().expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tx_id, Some(7));
    }

    #[test]
    fn from_jsonl_accepts_empty_input() {
        let restored = AuditRecorder::from_jsonl("").expect("decode empty jsonl");
        assert!(restored.entries().expect("entries").is_empty());
    }

    #[test]
    fn oldest_entries_are_dropped_past_the_bound() {
        let recorder = AuditRecorder::with_max_entries(AuditLevel::KeyEventsOnly, 3);
        for tx_id in 1..=5 {
            recorder.record("d", Some(tx_id), AuditEvent::TxStarted).expect("record");
        }

        let entries = recorder.entries().expect("entries");
        assert_eq!(entries.len(), 3);
        let ids: Vec<Option<u64>> = entries.iter().map(|e| e.tx_id).collect();
        assert_eq!(ids, vec![Some(3), Some(4), Some(5)]);
    }

    #[test]
    fn zero_bound_keeps_latest_entry() {
        let recorder = AuditRecorder::with_max_entries(AuditLevel::Full, 0);
        assert_eq!(recorder.max_entries(), 1);
        recorder.record("d", Some(1), AuditEvent::Locked).expect("record");
        recorder.record("d", Some(2), AuditEvent::Unlocked).expect("record");
        let entries = recorder.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, AuditEvent::Unlocked);
    }

    #[test]
    fn clear_removes_all_entries() {
        let recorder = AuditRecorder::default();
        recorder.record("d", None, AuditEvent::Unlocked).expect("record");
        recorder.clear().expect("clear");
        assert!(recorder.entries().expect("entries").is_empty());
    }
}
