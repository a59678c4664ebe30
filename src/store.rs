//! Durable session persistence
//!
//! A session is a record (entity map + masked dataset + metadata) and an
//! append-only message log. The store is the source of truth; the
//! in-process `SessionCache` is rebuilt from it on a miss.

use crate::crypto::{RecordSealer, SealedRecord};
use crate::dataset::Dataset;
use crate::error::{InsightError, Result};
use crate::vault::EntityMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Longest accepted session id
const MAX_SESSION_ID_LEN: usize = 128;

/// Reject ids that are empty, overlong, or not path-safe
pub fn validate_session_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(InsightError::InvalidSession(id.to_string()))
    }
}

/// Masked dataset as persisted with its upload name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDataset {
    pub filename: String,
    pub dataset: Dataset,
}

/// Persistent per-session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_map: Option<EntityMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<StoredDataset>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            entity_map: None,
            dataset: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Speaker of a logged message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the session message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl StoredMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Listing entry for a stored session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

/// Pluggable session persistence
pub trait SessionStore: Send + Sync {
    /// Load a session record; `None` when the session does not exist
    fn load(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Create or replace a session record
    fn save(&self, record: &SessionRecord) -> Result<()>;

    /// Append to the session's message log
    fn append_message(&self, session_id: &str, message: &StoredMessage) -> Result<()>;

    /// Full message log in append order
    fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>>;

    /// Remove the record and its log; returns whether anything existed
    fn delete(&self, session_id: &str) -> Result<bool>;

    /// All sessions, most recently updated first
    fn list(&self) -> Result<Vec<SessionSummary>>;
}

fn summarize(records: impl Iterator<Item = SessionRecord>) -> Vec<SessionSummary> {
    let mut out: Vec<SessionSummary> = records
        .map(|r| SessionSummary {
            session_id: r.session_id,
            title: r.title,
            updated_at: r.updated_at,
        })
        .collect();
    out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    out
}

/// In-memory session store for tests and single-process use
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, SessionRecord>>,
    logs: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

fn lock_err(e: impl std::fmt::Display) -> InsightError {
    InsightError::Store(format!("Failed to acquire store lock: {}", e))
}

impl SessionStore for MemorySessionStore {
    fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let records = self.records.read().map_err(lock_err)?;
        Ok(records.get(session_id).cloned())
    }

    fn save(&self, record: &SessionRecord) -> Result<()> {
        validate_session_id(&record.session_id)?;
        let mut records = self.records.write().map_err(lock_err)?;
        records.insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn append_message(&self, session_id: &str, message: &StoredMessage) -> Result<()> {
        validate_session_id(session_id)?;
        let mut logs = self.logs.write().map_err(lock_err)?;
        logs.entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let logs = self.logs.read().map_err(lock_err)?;
        Ok(logs.get(session_id).cloned().unwrap_or_default())
    }

    fn delete(&self, session_id: &str) -> Result<bool> {
        let had_record = self
            .records
            .write()
            .map_err(lock_err)?
            .remove(session_id)
            .is_some();
        let had_log = self.logs.write().map_err(lock_err)?.remove(session_id).is_some();
        Ok(had_record || had_log)
    }

    fn list(&self) -> Result<Vec<SessionSummary>> {
        let records = self.records.read().map_err(lock_err)?;
        Ok(summarize(records.values().cloned()))
    }
}

/// JSON-file session store
///
/// Layout: `<dir>/<id>.json` for the record and `<dir>/<id>.messages.json`
/// for the log. Writes go through a temp file and a rename. With a sealer
/// configured, both files hold sealed envelopes; plain files written
/// before sealing was enabled are still readable.
pub struct FileSessionStore {
    dir: PathBuf,
    sealer: Option<Arc<dyn RecordSealer>>,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sealer: None,
        }
    }

    /// Seal every record written from now on
    pub fn with_sealer(mut self, sealer: Arc<dyn RecordSealer>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.messages.json", session_id))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let mut doc = serde_json::to_value(value)?;
        if let Some(sealer) = &self.sealer {
            doc = sealer.seal(&doc)?;
        }
        let json = serde_json::to_string_pretty(&doc)?;

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            InsightError::Store(format!(
                "Failed to create session directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, json).map_err(|e| {
            InsightError::Store(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;
        std::fs::rename(&tmp_path, path).map_err(|e| {
            InsightError::Store(format!(
                "Failed to rename {} to {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InsightError::Store(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut doc: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            InsightError::Store(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        if SealedRecord::is_sealed(&doc) {
            let sealer = self.sealer.as_ref().ok_or_else(|| {
                InsightError::Crypto(format!(
                    "{} is sealed but no sealing key is configured",
                    path.display()
                ))
            })?;
            doc = sealer.unseal(&doc)?;
        }
        Ok(Some(serde_json::from_value(doc)?))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        validate_session_id(session_id)?;
        self.read_json(&self.record_path(session_id))
    }

    fn save(&self, record: &SessionRecord) -> Result<()> {
        validate_session_id(&record.session_id)?;
        self.write_json(&self.record_path(&record.session_id), record)?;
        tracing::debug!(session = %record.session_id, "Session record saved");
        Ok(())
    }

    fn append_message(&self, session_id: &str, message: &StoredMessage) -> Result<()> {
        validate_session_id(session_id)?;
        let path = self.log_path(session_id);
        let mut log: Vec<StoredMessage> = self.read_json(&path)?.unwrap_or_default();
        log.push(message.clone());
        self.write_json(&path, &log)
    }

    fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        validate_session_id(session_id)?;
        Ok(self.read_json(&self.log_path(session_id))?.unwrap_or_default())
    }

    fn delete(&self, session_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        let mut removed = false;
        for path in [self.record_path(session_id), self.log_path(session_id)] {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    InsightError::Store(format!("Failed to remove {}: {}", path.display(), e))
                })?;
                removed = true;
            }
        }
        if removed {
            tracing::info!(session = %session_id, "Session files removed");
        }
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<SessionSummary>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            InsightError::Store(format!("Failed to list {}: {}", self.dir.display(), e))
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if id.ends_with(".messages") || validate_session_id(id).is_err() {
                continue;
            }
            match self.read_json::<SessionRecord>(&entry.path()) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(file = %entry.path().display(), error = %e, "Skipping unreadable session"),
            }
        }
        Ok(summarize(records.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmSealer;
    use crate::dataset::{CellValue, Table};

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("a3s-insight-test-{}", uuid::Uuid::new_v4()))
    }

    fn sample_record(id: &str) -> SessionRecord {
        let mut map = EntityMap::new();
        map.assign("COUN", "France");
        let mut record = SessionRecord::new(id, "sales.csv");
        record.entity_map = Some(map);
        record.dataset = Some(StoredDataset {
            filename: "sales.csv".into(),
            dataset: Dataset::Structured(Table::from_rows(
                vec!["country".into()],
                vec![vec![CellValue::Text("<COUN_1>".into())]],
            )),
        });
        record
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("abc-123_X").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemorySessionStore::default();
        let record = sample_record("s1");
        store.save(&record).unwrap();
        assert_eq!(store.load("s1").unwrap(), Some(record));
        assert_eq!(store.load("missing").unwrap(), None);
    }

    #[test]
    fn test_memory_store_messages_and_delete() {
        let store = MemorySessionStore::default();
        store.save(&sample_record("s1")).unwrap();
        store
            .append_message("s1", &StoredMessage::new(Role::User, "hi"))
            .unwrap();
        store
            .append_message("s1", &StoredMessage::new(Role::Assistant, "hello"))
            .unwrap();

        let log = store.messages("s1").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].role, Role::Assistant);

        assert!(store.delete("s1").unwrap());
        assert!(!store.delete("s1").unwrap());
        assert!(store.messages("s1").unwrap().is_empty());
    }

    #[test]
    fn test_file_store_roundtrip_and_list() {
        let dir = temp_dir();
        let store = FileSessionStore::new(&dir);
        let record = sample_record("s1");
        store.save(&record).unwrap();
        store.save(&sample_record("s2")).unwrap();
        store
            .append_message("s1", &StoredMessage::new(Role::User, "q"))
            .unwrap();

        assert_eq!(store.load("s1").unwrap(), Some(record));
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"s1".to_string()));

        // Atomic write leaves no temp file behind
        assert!(!dir.join("s1.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_only_masked_data_on_disk() {
        let dir = temp_dir();
        let store = FileSessionStore::new(&dir);
        store.save(&sample_record("s1")).unwrap();
        let content = std::fs::read_to_string(dir.join("s1.json")).unwrap();
        assert!(content.contains("<COUN_1>"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_sealed() {
        let dir = temp_dir();
        let sealer: Arc<dyn RecordSealer> = Arc::new(Aes256GcmSealer::new("k1", &[7u8; 32]));
        let store = FileSessionStore::new(&dir).with_sealer(sealer);
        let record = sample_record("s1");
        store.save(&record).unwrap();

        let content = std::fs::read_to_string(dir.join("s1.json")).unwrap();
        assert!(!content.contains("France"));
        assert!(content.contains("ciphertext"));
        assert_eq!(store.load("s1").unwrap(), Some(record));

        // Unsealed reader cannot open sealed records
        let plain = FileSessionStore::new(&dir);
        assert!(matches!(plain.load("s1"), Err(InsightError::Crypto(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_delete() {
        let dir = temp_dir();
        let store = FileSessionStore::new(&dir);
        store.save(&sample_record("s1")).unwrap();
        store
            .append_message("s1", &StoredMessage::new(Role::System, "loaded"))
            .unwrap();
        assert!(store.delete("s1").unwrap());
        assert_eq!(store.load("s1").unwrap(), None);
        assert!(store.messages("s1").unwrap().is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_rejects_unsafe_ids() {
        let store = FileSessionStore::new(temp_dir());
        assert!(matches!(
            store.load("../x"),
            Err(InsightError::InvalidSession(_))
        ));
    }
}
