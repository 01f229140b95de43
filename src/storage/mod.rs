//! Work item retrieval and annotation result persistence.
//!
//! The document store hands chunks of item ids back as full work items; the
//! result sink receives one record per attempted item. Upserts are
//! idempotent and last-write-wins per (item, backend) key, so re-running a
//! chunk after an interruption is always safe.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::SourceError;

/// One document to annotate, with its ordered sub-units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    /// Ordered sub-units; unit `i` receives id `S{i+1}`.
    pub units: Vec<String>,
}

/// Terminal status of one annotation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationStatus {
    Completed,
    Failed,
}

/// Record written to the sink for every attempted item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub item_id: i64,
    pub backend: String,
    pub status: AnnotationStatus,
    /// Serialized annotation units when the attempt completed.
    pub payload: Option<String>,
    /// Terminal error description when the attempt failed.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnnotationRecord {
    /// Fresh record stamped with the current time. The sink replaces
    /// `created_at` when the key was seen before.
    pub fn new(
        item_id: i64,
        backend: &str,
        status: AnnotationStatus,
        payload: Option<String>,
        error_message: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            item_id,
            backend: backend.to_string(),
            status,
            payload,
            error_message,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Destination for annotation records.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Stores or replaces the record for its (item, backend) key. Returns
    /// whether the write landed; failures are logged, never fatal to the
    /// batch.
    async fn upsert(&self, record: AnnotationRecord) -> bool;

    /// Of `ids`, the ones already holding a completed record for `backend`.
    async fn completed_ids(&self, ids: &[i64], backend: &str) -> Vec<i64>;
}

/// Source of work items by id.
pub trait DocumentStore: Send + Sync {
    /// Returns the items found among `ids`, preserving input order. Unknown
    /// ids are logged and skipped.
    fn fetch(&self, ids: &[i64]) -> Result<Vec<WorkItem>, SourceError>;
}

type RecordKey = (i64, String);

struct SinkIndex {
    /// First-seen timestamp per key, preserved across upserts.
    created: HashMap<RecordKey, DateTime<Utc>>,
    completed: HashMap<RecordKey, bool>,
}

/// Append-only JSON-lines sink.
///
/// Every upsert appends one line; the latest line for a key supersedes
/// earlier ones, which readers resolve by taking the last occurrence.
pub struct JsonlSink {
    path: PathBuf,
    index: Mutex<SinkIndex>,
}

impl JsonlSink {
    /// Opens the sink, replaying an existing file to rebuild the key index
    /// so resumed runs keep idempotent semantics.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut index = SinkIndex {
            created: HashMap::new(),
            completed: HashMap::new(),
        };
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<AnnotationRecord>(line) {
                    Ok(record) => {
                        let key = (record.item_id, record.backend.clone());
                        index.created.entry(key.clone()).or_insert(record.created_at);
                        index
                            .completed
                            .insert(key, record.status == AnnotationStatus::Completed);
                    }
                    Err(e) => warn!(error = %e, "Skipping malformed result line"),
                }
            }
            debug!(
                path = %path.display(),
                known_keys = index.completed.len(),
                "Replayed existing result file"
            );
        }
        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonlSink {
    async fn upsert(&self, mut record: AnnotationRecord) -> bool {
        let key = (record.item_id, record.backend.clone());
        {
            let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(created) = index.created.get(&key) {
                record.created_at = *created;
            } else {
                index.created.insert(key.clone(), record.created_at);
            }
            index
                .completed
                .insert(key, record.status == AnnotationStatus::Completed);
        }

        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!(item_id = record.item_id, error = %e, "Could not serialize record");
                return false;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(item_id = record.item_id, error = %e, "Could not write record");
                false
            }
        }
    }

    async fn completed_ids(&self, ids: &[i64], backend: &str) -> Vec<i64> {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        ids.iter()
            .copied()
            .filter(|id| {
                index
                    .completed
                    .get(&(*id, backend.to_string()))
                    .copied()
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// In-memory sink for tests and rehearsal runs.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<HashMap<RecordKey, AnnotationRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored records, unordered.
    pub fn records(&self) -> Vec<AnnotationRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn upsert(&self, mut record: AnnotationRecord) -> bool {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let key = (record.item_id, record.backend.clone());
        if let Some(existing) = records.get(&key) {
            record.created_at = existing.created_at;
        }
        records.insert(key, record);
        true
    }

    async fn completed_ids(&self, ids: &[i64], backend: &str) -> Vec<i64> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        ids.iter()
            .copied()
            .filter(|id| {
                records
                    .get(&(*id, backend.to_string()))
                    .is_some_and(|r| r.status == AnnotationStatus::Completed)
            })
            .collect()
    }
}

/// Document store backed by a JSON array of work items.
pub struct JsonDocumentStore {
    items: HashMap<i64, WorkItem>,
}

impl JsonDocumentStore {
    pub fn from_file(path: &Path) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let items: Vec<WorkItem> = serde_json::from_str(&text).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;
        debug!(path = %path.display(), items = items.len(), "Loaded document store");
        Ok(Self::from_items(items))
    }

    pub fn from_items(items: Vec<WorkItem>) -> Self {
        Self {
            items: items.into_iter().map(|item| (item.id, item)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl DocumentStore for JsonDocumentStore {
    fn fetch(&self, ids: &[i64]) -> Result<Vec<WorkItem>, SourceError> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.items.get(id) {
                Some(item) => found.push(item.clone()),
                None => warn!(item_id = id, "Item id not present in document store"),
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(item_id: i64, status: AnnotationStatus) -> AnnotationRecord {
        AnnotationRecord::new(
            item_id,
            "backend-a",
            status,
            matches!(status, AnnotationStatus::Completed).then(|| "[]".to_string()),
            matches!(status, AnnotationStatus::Failed).then(|| "boom".to_string()),
        )
    }

    #[tokio::test]
    async fn test_memory_sink_upsert_is_last_write_wins() {
        let sink = MemorySink::new();
        assert!(sink.upsert(record(1, AnnotationStatus::Failed)).await);
        assert!(sink.upsert(record(1, AnnotationStatus::Completed)).await);
        assert_eq!(sink.len(), 1);
        let records = sink.records();
        assert_eq!(records[0].status, AnnotationStatus::Completed);
    }

    #[tokio::test]
    async fn test_memory_sink_preserves_created_at() {
        let sink = MemorySink::new();
        let first = record(1, AnnotationStatus::Failed);
        let created = first.created_at;
        sink.upsert(first).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        sink.upsert(record(1, AnnotationStatus::Completed)).await;
        let stored = sink.records().remove(0);
        assert_eq!(stored.created_at, created);
        assert!(stored.updated_at > created);
    }

    #[tokio::test]
    async fn test_memory_sink_completed_ids() {
        let sink = MemorySink::new();
        sink.upsert(record(1, AnnotationStatus::Completed)).await;
        sink.upsert(record(2, AnnotationStatus::Failed)).await;
        let done = sink.completed_ids(&[1, 2, 3], "backend-a").await;
        assert_eq!(done, vec![1]);
        assert!(sink.completed_ids(&[1], "other").await.is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_and_replays() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("results.jsonl");

        let sink = JsonlSink::open(&path).expect("open");
        assert!(sink.upsert(record(1, AnnotationStatus::Failed)).await);
        assert!(sink.upsert(record(1, AnnotationStatus::Completed)).await);
        assert!(sink.upsert(record(2, AnnotationStatus::Completed)).await);

        // Reopen and confirm the index was rebuilt from the file.
        drop(sink);
        let reopened = JsonlSink::open(&path).expect("reopen");
        let done = reopened.completed_ids(&[1, 2, 3], "backend-a").await;
        assert_eq!(done, vec![1, 2]);

        // Latest line per key wins for readers.
        let text = std::fs::read_to_string(&path).expect("read");
        let last_for_one = text
            .lines()
            .filter_map(|l| serde_json::from_str::<AnnotationRecord>(l).ok())
            .filter(|r| r.item_id == 1)
            .last()
            .expect("record present");
        assert_eq!(last_for_one.status, AnnotationStatus::Completed);
    }

    #[tokio::test]
    async fn test_jsonl_sink_skips_malformed_lines_on_replay() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("results.jsonl");
        std::fs::write(&path, "not json\n").expect("seed");
        let sink = JsonlSink::open(&path).expect("open");
        assert!(sink.completed_ids(&[1], "backend-a").await.is_empty());
    }

    #[test]
    fn test_document_store_fetch_preserves_order_and_skips_unknown() {
        let store = JsonDocumentStore::from_items(vec![
            WorkItem {
                id: 2,
                title: "b".into(),
                author: String::new(),
                units: vec!["x".into()],
            },
            WorkItem {
                id: 1,
                title: "a".into(),
                author: String::new(),
                units: vec!["y".into()],
            },
        ]);
        let items = store.fetch(&[1, 99, 2]).expect("fetch");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, 1);
        assert_eq!(items[1].id, 2);
    }

    #[test]
    fn test_document_store_from_missing_file() {
        let err = JsonDocumentStore::from_file(Path::new("/nonexistent/items.json"))
            .map(|_| ())
            .expect_err("must fail");
        assert!(matches!(err, SourceError::NotFound(_)));
    }
}
