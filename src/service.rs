//! Submit / poll / fetch surface over [`DocumentOrchestrator`].
//!
//! `submit` returns a job id immediately and runs the job on the tokio
//! runtime. Pollers read status from the [`crate::jobs::JobStore`]; the
//! finished [`DocumentJob`] is kept in memory for `result`.

use crate::config::PageSelection;
use crate::document::{CancelFlag, DocumentJob, DocumentOrchestrator};
use crate::error::PageError;
use crate::jobs::{JobProgress, JobRecord, JobStatus};
use crate::store::BlobRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// What `status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub progress: JobProgress,
    pub error_message: Option<String>,
}

/// What `result` hands to delivery code: Markdown plus opaque image URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub markdown: String,
    pub markdown_ref: Option<BlobRef>,
    pub images: Vec<BlobRef>,
    /// One entry per failed page, so exactly those can be resubmitted.
    pub page_errors: Vec<PageError>,
}

impl From<&DocumentJob> for JobResult {
    fn from(job: &DocumentJob) -> Self {
        Self {
            status: job.status,
            markdown: job.markdown.clone(),
            markdown_ref: job.markdown_ref.clone(),
            images: job.images.clone(),
            page_errors: job.pages.iter().filter_map(|p| p.error.clone()).collect(),
        }
    }
}

#[derive(Default)]
struct Running {
    cancels: HashMap<String, CancelFlag>,
    handles: HashMap<String, JoinHandle<()>>,
    finished: HashMap<String, DocumentJob>,
}

/// Job service. Cheap to clone.
#[derive(Clone)]
pub struct Ocr2MdService {
    orchestrator: Arc<DocumentOrchestrator>,
    state: Arc<Mutex<Running>>,
}

impl Ocr2MdService {
    pub fn new(orchestrator: DocumentOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            state: Arc::default(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Running> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a job and return its id. `pages` overrides the configured
    /// selection, e.g. to resubmit only the pages that failed.
    pub async fn submit(&self, bytes: Vec<u8>, pages: Option<PageSelection>) -> String {
        let job_id = uuid::Uuid::new_v4().to_string();
        let selection = pages.unwrap_or_else(|| self.orchestrator.config().pages.clone());
        let cancel = CancelFlag::new();

        self.orchestrator
            .jobs()
            .save(JobRecord::pending(job_id.clone()))
            .await;

        let orchestrator = Arc::clone(&self.orchestrator);
        let state = Arc::clone(&self.state);
        let id = job_id.clone();
        let flag = cancel.clone();
        // Hold the lock across spawn so the task cannot finish before its
        // handle is registered.
        let mut guard = self.state();
        let handle = tokio::spawn(async move {
            let outcome = orchestrator.process_job(&id, &bytes, &selection, &flag).await;
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.cancels.remove(&id);
            state.handles.remove(&id);
            match outcome {
                Ok(job) => {
                    state.finished.insert(id, job);
                }
                Err(e) => error!("Job {} failed: {}", id, e),
            }
        });
        guard.cancels.insert(job_id.clone(), cancel);
        guard.handles.insert(job_id.clone(), handle);
        drop(guard);

        info!("Job {} submitted", job_id);
        job_id
    }

    pub async fn status(&self, job_id: &str) -> Option<JobStatusView> {
        self.orchestrator
            .jobs()
            .load(job_id)
            .await
            .map(|r| JobStatusView {
                status: r.status,
                progress: r.progress,
                error_message: r.error_message,
            })
    }

    /// Result of a finished job that produced output (completed, partially
    /// completed, or cancelled with nothing merged).
    pub fn result(&self, job_id: &str) -> Option<JobResult> {
        self.state().finished.get(job_id).map(JobResult::from)
    }

    /// Request cancellation. `false` when the job is unknown or finished.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.state().cancels.get(job_id) {
            Some(flag) => {
                flag.cancel();
                info!("Job {} cancellation requested", job_id);
                true
            }
            None => false,
        }
    }

    /// Jobs submitted and not yet finished.
    pub fn active_jobs(&self) -> usize {
        self.state().handles.len()
    }

    /// Wait for a submitted job to reach a terminal status.
    pub async fn wait(&self, job_id: &str) -> Option<JobStatusView> {
        let handle = self.state().handles.remove(job_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Job {} task panicked: {}", job_id, e);
            }
        }
        self.status(job_id).await
    }
}
