//! Job bookkeeping: status records that pollers read while a job runs.
//!
//! The orchestrator writes a fresh [`JobRecord`] after every page resolves,
//! so `progress.resolved` only ever grows. The store itself is a collaborator
//! behind [`JobStore`]; [`MemoryJobStore`] is the in-process implementation.

use crate::page::PageStage;
use crate::store::BlobRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Lifecycle of a document job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    /// Every selected page reached `Done`.
    Completed,
    /// At least one page succeeded and at least one failed.
    PartiallyCompleted,
    /// No page succeeded, or a fatal error stopped the job.
    Failed,
    /// Cancelled between pages; results of in-flight pages were discarded.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// Pages resolved so far out of the pages selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub resolved: usize,
    pub total: usize,
}

/// Persisted view of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub document_id: String,
    pub status: JobStatus,
    /// `(page_number, stage)` in page order.
    pub per_page_status: Vec<(usize, PageStage)>,
    pub final_markdown_ref: Option<BlobRef>,
    pub error_message: Option<String>,
    pub progress: JobProgress,
}

impl JobRecord {
    pub fn pending(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            status: JobStatus::Pending,
            per_page_status: Vec::new(),
            final_markdown_ref: None,
            error_message: None,
            progress: JobProgress::default(),
        }
    }
}

/// Storage for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, record: JobRecord);

    async fn load(&self, document_id: &str) -> Option<JobRecord>;
}

/// In-memory job store.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    records: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, record: JobRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.document_id.clone(), record);
    }

    async fn load(&self, document_id: &str) -> Option<JobRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(document_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::PartiallyCompleted.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::PartiallyCompleted).unwrap();
        assert_eq!(json, "\"partially_completed\"");
    }

    #[tokio::test]
    async fn save_overwrites_previous_record() {
        let store = MemoryJobStore::new();
        let mut record = JobRecord::pending("doc-1");
        store.save(record.clone()).await;

        record.status = JobStatus::Running;
        record.progress = JobProgress { resolved: 1, total: 3 };
        store.save(record).await;

        let loaded = store.load("doc-1").await.unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.progress.resolved, 1);
        assert!(store.load("doc-2").await.is_none());
    }
}
