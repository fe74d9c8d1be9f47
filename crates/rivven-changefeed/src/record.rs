//! Local record of a managed changefeed
//!
//! The database does not echo every creation option back in a structured
//! form, so the record written at create time is the authoritative copy of
//! the configuration. It also carries the step of an in-flight table update
//! so an interrupted update can be picked up again.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::spec::{ChangefeedSpec, JobId};

/// Step of the pause → alter → resume update saga
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePhase {
    /// A table change was detected; the pause may have been issued
    TablesChanged,
    /// The job reported `paused`
    Paused,
    /// Alter statements are being applied
    Altering,
    /// The resume statement is being applied
    Resuming,
    /// No update in flight
    #[default]
    Done,
}

impl UpdatePhase {
    /// Whether an update was interrupted in this phase
    #[inline]
    pub const fn is_in_flight(self) -> bool {
        !matches!(self, Self::Done)
    }

    /// Name used in logs and serialized records
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TablesChanged => "tables-changed",
            Self::Paused => "paused",
            Self::Altering => "altering",
            Self::Resuming => "resuming",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored state of one changefeed job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangefeedRecord {
    /// Job id, `None` before creation and after deletion
    #[serde(default)]
    pub id: Option<JobId>,
    /// Configuration the job was created with (tables track updates)
    pub spec: ChangefeedSpec,
    /// Update saga step
    #[serde(default)]
    pub phase: UpdatePhase,
    /// Creation options could not be read back from an adopted job
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub options_unknown: bool,
}

impl ChangefeedRecord {
    /// Record for a job that has not been created yet
    pub fn pending(spec: ChangefeedSpec) -> Self {
        Self {
            id: None,
            spec,
            phase: UpdatePhase::Done,
            options_unknown: false,
        }
    }

    /// Record for a freshly created job
    pub fn created(id: JobId, spec: ChangefeedSpec) -> Self {
        Self {
            id: Some(id),
            spec,
            phase: UpdatePhase::Done,
            options_unknown: false,
        }
    }

    /// Record for a job being adopted; everything is recovered on read
    pub fn imported(id: JobId) -> Self {
        Self {
            id: Some(id),
            spec: ChangefeedSpec::default(),
            phase: UpdatePhase::Done,
            options_unknown: false,
        }
    }

    /// Job id as a display string, or `-` when unset
    pub fn id_str(&self) -> &str {
        self.id.as_ref().map(JobId::as_str).unwrap_or("-")
    }
}

/// Persistence for [`ChangefeedRecord`]s
///
/// The reconciler saves the record at every step of a table update so a
/// restarted process finds the job's real state.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Save the record, replacing any previous copy
    async fn save(&self, record: &ChangefeedRecord) -> Result<()>;
}

/// Store that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardRecords;

#[async_trait]
impl RecordStore for DiscardRecords {
    async fn save(&self, _record: &ChangefeedRecord) -> Result<()> {
        Ok(())
    }
}

/// In-memory store keeping every saved copy, for testing
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    saved: Mutex<Vec<ChangefeedRecord>>,
}

impl MemoryRecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every saved copy, oldest first
    pub fn history(&self) -> Vec<ChangefeedRecord> {
        self.saved.lock().clone()
    }

    /// Most recently saved copy
    pub fn latest(&self) -> Option<ChangefeedRecord> {
        self.saved.lock().last().cloned()
    }

    /// Phases in save order
    pub fn phases(&self) -> Vec<UpdatePhase> {
        self.saved.lock().iter().map(|r| r.phase).collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, record: &ChangefeedRecord) -> Result<()> {
        self.saved.lock().push(record.clone());
        Ok(())
    }
}

/// JSON file store
///
/// Writes go to a sibling temporary file that is renamed over the target,
/// so a crash never leaves a half-written record.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    path: PathBuf,
}

impl FileRecordStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File holding the record
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, `None` when the file does not exist
    pub async fn load(&self) -> Result<Option<ChangefeedRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn save(&self, record: &ChangefeedRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!(path = %self.path.display(), phase = %record.phase, "record saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&UpdatePhase::TablesChanged).unwrap();
        assert_eq!(json, "\"tables-changed\"");
        let phase: UpdatePhase = serde_json::from_str("\"altering\"").unwrap();
        assert_eq!(phase, UpdatePhase::Altering);
        assert_eq!(UpdatePhase::Resuming.to_string(), "resuming");
    }

    #[test]
    fn test_phase_in_flight() {
        assert!(!UpdatePhase::Done.is_in_flight());
        assert!(UpdatePhase::Paused.is_in_flight());
        assert_eq!(UpdatePhase::default(), UpdatePhase::Done);
    }

    #[test]
    fn test_record_json() {
        let spec = ChangefeedSpec::new(["t1", "t2"], "kafka", "pfx", "registry");
        let record = ChangefeedRecord::created(JobId::new("77").unwrap(), spec);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"id\":\"77\""));
        assert!(json.contains("\"phase\":\"done\""));

        let back: ChangefeedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_missing_phase_defaults() {
        let json = r#"{"id":"5","spec":{"tables":["a"],"sink":"k","schema_prefix":"p","registry":"r"}}"#;
        let record: ChangefeedRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.phase, UpdatePhase::Done);
        assert_eq!(record.id_str(), "5");
        assert!(ChangefeedRecord::pending(record.spec.clone()).id.is_none());
    }

    #[test]
    fn test_options_unknown_omitted_when_false() {
        let spec = ChangefeedSpec::new(["a"], "k", "p", "r");
        let record = ChangefeedRecord::created(JobId::from(1), spec);
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("options_unknown"));

        let mut imported = ChangefeedRecord::imported(JobId::from(2));
        imported.options_unknown = true;
        let json = serde_json::to_string(&imported).unwrap();
        let back: ChangefeedRecord = serde_json::from_str(&json).unwrap();
        assert!(back.options_unknown);
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_none());

        let spec = ChangefeedSpec::new(["orders"], "kafka", "shop", "registry");
        let mut record = ChangefeedRecord::created(JobId::from(1001), spec);
        store.save(&record).await.unwrap();
        record.phase = UpdatePhase::TablesChanged;
        store.save(&record).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(record));
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = FileRecordStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, crate::error::ChangefeedError::Json(_)));
    }

    #[tokio::test]
    async fn test_memory_store_history() {
        let store = MemoryRecordStore::new();
        let mut record = ChangefeedRecord::imported(JobId::from(3));
        store.save(&record).await.unwrap();
        record.phase = UpdatePhase::Altering;
        store.save(&record).await.unwrap();
        assert_eq!(store.phases(), vec![UpdatePhase::Done, UpdatePhase::Altering]);
        assert_eq!(store.latest(), Some(record));
        assert_eq!(store.history().len(), 2);
    }
}
