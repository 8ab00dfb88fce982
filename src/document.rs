//! Document-level orchestration: cache lookup, page fan-out, ordered merge.
//!
//! ## Flow
//!
//! ```text
//! bytes ──▶ cache_key ──hit──▶ cached DocumentJob (no OCR)
//!               │
//!              miss
//!               ▼
//!   render (spawn_blocking) ──▶ pages ──buffer_unordered──▶ PageOrchestrator::run
//!                                                   │
//!                          slot[position] = outcome ◀┘  (job record saved each time)
//!                                   │
//!                      merge in page order ──▶ persist when Completed
//! ```
//!
//! Pages finish in any order; each outcome is written to the slot of its
//! position in the selection, and the merge reads the slots front to back.
//! Completion order therefore never affects the merged document.

use crate::config::{ConversionConfig, PageSelection, PageSeparator};
use crate::error::Ocr2MdError;
use crate::jobs::{JobProgress, JobRecord, JobStatus, JobStore};
use crate::page::{PageOrchestrator, PageOutcome, PageStage, StageObserver};
use crate::pipeline::crop::{artifact_matches, RegionCropper};
use crate::pipeline::ocr::OcrGateway;
use crate::pipeline::render::PageRenderer;
use crate::reconcile::Reconciler;
use crate::store::{content_hash, BlobRef, BlobStore, StoreError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cooperative cancellation signal shared between a caller and a job.
///
/// Checked before each page starts. Pages already in flight run to
/// completion and their results are discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Aggregate result of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentJob {
    pub document_id: String,
    pub cache_key: String,
    pub status: JobStatus,
    /// Pages in the PDF, selected or not.
    pub total_pages: usize,
    /// Outcomes of the selected pages, in page order.
    pub pages: Vec<PageOutcome>,
    pub markdown: String,
    /// Stored crops of all pages, in page then region order.
    pub images: Vec<BlobRef>,
    /// Where the merged Markdown was stored.
    pub markdown_ref: Option<BlobRef>,
    pub from_cache: bool,
    pub duration_ms: u64,
}

impl DocumentJob {
    /// Page numbers that ended `Failed`, for resubmission.
    pub fn failed_pages(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.stage == PageStage::Failed)
            .map(|p| p.page_number)
            .collect()
    }

    pub fn done_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_done()).count()
    }
}

/// Cache key of an upload: content hash, plus the page selection when it
/// is not the whole document.
pub fn cache_key(bytes: &[u8], selection: &PageSelection) -> String {
    let hash = content_hash(bytes);
    match selection.fingerprint() {
        Some(fp) => format!("{hash}-{fp}"),
        None => hash,
    }
}

fn manifest_key(cache_key: &str) -> String {
    format!("results/{cache_key}/manifest.json")
}

fn markdown_key(cache_key: &str) -> String {
    format!("results/{cache_key}/document.md")
}

fn partial_markdown_key(job_id: &str) -> String {
    format!("jobs/{job_id}/document.md")
}

/// `Completed` when every page is done, `PartiallyCompleted` when some are,
/// `Failed` when none are.
pub fn job_status(outcomes: &[PageOutcome]) -> JobStatus {
    let done = outcomes.iter().filter(|o| o.is_done()).count();
    if done == outcomes.len() {
        JobStatus::Completed
    } else if done > 0 {
        JobStatus::PartiallyCompleted
    } else {
        JobStatus::Failed
    }
}

/// Concatenate successful pages in slice order with `separator` between
/// them.
pub fn merge_pages(outcomes: &[PageOutcome], separator: &PageSeparator) -> String {
    let mut out = String::new();
    for (i, outcome) in outcomes.iter().filter(|o| o.is_done()).enumerate() {
        if i > 0 {
            out.push_str(&separator.render(outcome.page_number));
        }
        out.push_str(outcome.markdown().unwrap_or_default().trim_end());
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn requested_page(selection: &PageSelection) -> usize {
    match selection {
        PageSelection::All => 1,
        PageSelection::Single(p) => *p,
        PageSelection::Range(start, _) => *start,
        PageSelection::Set(pages) => pages.iter().copied().max().unwrap_or(1),
    }
}

/// Runs whole documents.
pub struct DocumentOrchestrator {
    config: Arc<ConversionConfig>,
    renderer: Arc<dyn PageRenderer>,
    pages: PageOrchestrator,
    store: Arc<dyn BlobStore>,
    jobs: Arc<dyn JobStore>,
}

impl DocumentOrchestrator {
    pub fn new(
        config: ConversionConfig,
        renderer: Arc<dyn PageRenderer>,
        gateway: OcrGateway,
        store: Arc<dyn BlobStore>,
        jobs: Arc<dyn JobStore>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        let config = Arc::new(config);
        let pages = PageOrchestrator::new(
            gateway,
            RegionCropper::new(Arc::clone(&store)),
            reconciler,
            Arc::clone(&config),
        );
        Self {
            config,
            renderer,
            pages,
            store,
            jobs,
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Convert a whole document with the configured page selection.
    pub async fn process(&self, bytes: &[u8]) -> Result<DocumentJob, Ocr2MdError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let selection = self.config.pages.clone();
        self.process_job(&job_id, bytes, &selection, &CancelFlag::new())
            .await
    }

    /// Convert `selection` of a document under the given job id.
    ///
    /// Page failures are reported inside the returned job. `Err` means no
    /// result could be produced at all: unreadable PDF, empty selection, or
    /// the merged result could not be stored.
    pub async fn process_job(
        &self,
        job_id: &str,
        bytes: &[u8],
        selection: &PageSelection,
        cancel: &CancelFlag,
    ) -> Result<DocumentJob, Ocr2MdError> {
        let start = Instant::now();
        let key = cache_key(bytes, selection);
        let mut record = JobRecord::pending(job_id);

        if let Some(job) = self.lookup(job_id, &key, start).await {
            info!("Job {}: cache hit for {}", job_id, key);
            record.status = job.status;
            record.per_page_status = job.pages.iter().map(|p| (p.page_number, p.stage)).collect();
            record.final_markdown_ref = job.markdown_ref.clone();
            record.progress = JobProgress {
                resolved: job.pages.len(),
                total: job.pages.len(),
            };
            self.jobs.save(record).await;
            if let Some(cb) = &self.config.progress_callback {
                cb.on_conversion_complete(job.pages.len(), job.done_count(), true);
            }
            return Ok(job);
        }

        record.status = JobStatus::Running;
        self.jobs.save(record.clone()).await;

        match self.run(job_id, &key, bytes, selection, cancel, &mut record, start).await {
            Ok(job) => Ok(job),
            Err(e) => {
                warn!("Job {}: failed: {}", job_id, e);
                record.status = JobStatus::Failed;
                record.error_message = Some(e.to_string());
                self.jobs.save(record).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        job_id: &str,
        key: &str,
        bytes: &[u8],
        selection: &PageSelection,
        cancel: &CancelFlag,
        record: &mut JobRecord,
        start: Instant,
    ) -> Result<DocumentJob, Ocr2MdError> {
        // ── Render (CPU-bound, pdfium is not async-safe) ─────────────────
        let renderer = Arc::clone(&self.renderer);
        let pdf: Arc<[u8]> = Arc::from(bytes);
        let sel = selection.clone();
        let password = self.config.password.clone();
        let rendered = tokio::task::spawn_blocking(move || renderer.render(&pdf, &sel, password.as_deref()))
            .await
            .map_err(|e| Ocr2MdError::Internal(format!("render task panicked: {e}")))??;

        if rendered.pages.is_empty() && rendered.total_pages > 0 {
            return Err(Ocr2MdError::PageOutOfRange {
                page: requested_page(selection),
                total: rendered.total_pages,
            });
        }

        let total_pages = rendered.total_pages;
        let selected = rendered.pages.len();
        record.per_page_status = rendered
            .pages
            .iter()
            .map(|p| (p.page_number, PageStage::Rendered))
            .collect();
        record.progress = JobProgress {
            resolved: 0,
            total: selected,
        };
        self.jobs.save(record.clone()).await;

        let callback = self.config.progress_callback.clone();
        if let Some(cb) = &callback {
            cb.on_conversion_start(selected);
        }

        // Every save goes through this lock, so the store sees records in
        // the order they were produced.
        let live = LiveRecord {
            record: tokio::sync::Mutex::new(std::mem::replace(record, JobRecord::pending(job_id))),
            jobs: self.jobs.as_ref(),
        };

        // ── Fan out ──────────────────────────────────────────────────────
        let mut slots: Vec<Option<PageOutcome>> = vec![None; selected];
        let mut results = stream::iter(rendered.pages.into_iter().enumerate().map(|(pos, page)| {
            let callback = callback.clone();
            let live = &live;
            async move {
                if cancel.is_cancelled() {
                    return (pos, None);
                }
                if let Some(cb) = &callback {
                    cb.on_page_start(page.page_number, selected);
                }
                let outcome = match page.bitmap {
                    Ok(bitmap) => self.pages.run(page.page_number, bitmap, key, live).await,
                    Err(error) => {
                        warn!("{}", error);
                        PageOutcome::failed(error, 0, 0)
                    }
                };
                (pos, Some(outcome))
            }
        }))
        .buffer_unordered(self.config.concurrency);

        while let Some((pos, outcome)) = results.next().await {
            let Some(outcome) = outcome else { continue };
            if cancel.is_cancelled() {
                debug!("Job {}: discarding page {} after cancellation", job_id, outcome.page_number);
                continue;
            }
            if let Some(cb) = &callback {
                match &outcome.error {
                    None => cb.on_page_complete(
                        outcome.page_number,
                        selected,
                        outcome.markdown().map_or(0, str::len),
                    ),
                    Some(e) => cb.on_page_error(outcome.page_number, selected, &e.to_string()),
                }
            }
            let mut current = live.record.lock().await;
            current.per_page_status[pos].1 = outcome.stage;
            current.progress.resolved += 1;
            self.jobs.save(current.clone()).await;
            drop(current);
            slots[pos] = Some(outcome);
        }
        drop(results);
        *record = live.record.into_inner();

        let duration_ms = || start.elapsed().as_millis() as u64;

        if cancel.is_cancelled() {
            info!("Job {}: cancelled after {} of {} pages", job_id, record.progress.resolved, selected);
            record.status = JobStatus::Cancelled;
            record.error_message = Some("cancelled".to_string());
            self.jobs.save(record.clone()).await;
            return Ok(DocumentJob {
                document_id: job_id.to_string(),
                cache_key: key.to_string(),
                status: JobStatus::Cancelled,
                total_pages,
                pages: slots.into_iter().flatten().collect(),
                markdown: String::new(),
                images: Vec::new(),
                markdown_ref: None,
                from_cache: false,
                duration_ms: duration_ms(),
            });
        }

        // ── Merge (barrier: every slot is filled here) ───────────────────
        let outcomes: Vec<PageOutcome> = slots.into_iter().flatten().collect();
        let status = job_status(&outcomes);
        let markdown = merge_pages(&outcomes, &self.config.page_separator);
        let images = outcomes.iter().flat_map(|o| o.images.iter().cloned()).collect();

        let mut job = DocumentJob {
            document_id: job_id.to_string(),
            cache_key: key.to_string(),
            status,
            total_pages,
            pages: outcomes,
            markdown,
            images,
            markdown_ref: None,
            from_cache: false,
            duration_ms: duration_ms(),
        };

        if status != JobStatus::Failed {
            job.markdown_ref = Some(
                self.persist(&job)
                    .await
                    .map_err(|source| Ocr2MdError::StorageFailed {
                        job_id: job_id.to_string(),
                        source,
                    })?,
            );
        }

        let failed = job.failed_pages();
        record.status = status;
        record.final_markdown_ref = job.markdown_ref.clone();
        record.error_message = if failed.is_empty() {
            None
        } else {
            Some(format!("pages failed: {failed:?}"))
        };
        self.jobs.save(record.clone()).await;

        if let Some(cb) = &callback {
            cb.on_conversion_complete(selected, job.done_count(), false);
        }
        info!(
            "Job {}: {:?}, {}/{} pages in {}ms",
            job_id,
            status,
            job.done_count(),
            selected,
            job.duration_ms
        );
        Ok(job)
    }

    /// Store the merged Markdown; completed jobs also get a cache manifest.
    async fn persist(&self, job: &DocumentJob) -> Result<BlobRef, StoreError> {
        if job.status != JobStatus::Completed {
            return self
                .store
                .put(&partial_markdown_key(&job.document_id), job.markdown.clone().into_bytes())
                .await;
        }

        let markdown_ref = self
            .store
            .put(&markdown_key(&job.cache_key), job.markdown.clone().into_bytes())
            .await?;
        let mut manifest = job.clone();
        manifest.markdown_ref = Some(markdown_ref.clone());
        let bytes = serde_json::to_vec(&manifest).map_err(|e| StoreError::Corrupt {
            key: manifest_key(&job.cache_key),
            detail: e.to_string(),
        })?;
        self.store.put(&manifest_key(&job.cache_key), bytes).await?;
        debug!("Cached result under {}", job.cache_key);
        Ok(markdown_ref)
    }

    /// Cached job for `key`, or `None`. Unreadable manifests are a miss.
    async fn lookup(&self, job_id: &str, key: &str, start: Instant) -> Option<DocumentJob> {
        let manifest = manifest_key(key);
        let bytes = match self.store.get(&manifest).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return None,
            Err(e) => {
                warn!("Cache lookup for {} failed ({}), reprocessing", key, e);
                return None;
            }
        };

        let corrupt = |detail: String| {
            let err = StoreError::Corrupt {
                key: manifest.clone(),
                detail,
            };
            warn!("{}; treating as cache miss", err);
        };
        let job = match serde_json::from_slice::<DocumentJob>(&bytes) {
            Ok(job) if job.cache_key == key && job.status == JobStatus::Completed => job,
            Ok(job) => {
                corrupt(format!("manifest describes {} ({:?})", job.cache_key, job.status));
                return None;
            }
            Err(e) => {
                corrupt(e.to_string());
                return None;
            }
        };

        if let Err(e) = self.verify_artifacts(&job).await {
            warn!("Cached result {} is unusable ({}); treating as cache miss", key, e);
            return None;
        }
        Some(DocumentJob {
            document_id: job_id.to_string(),
            from_cache: true,
            duration_ms: start.elapsed().as_millis() as u64,
            ..job
        })
    }

    /// Every blob a cached job links to must still hold what was written:
    /// crops are checked against the digest in their key, the Markdown
    /// against the manifest copy.
    async fn verify_artifacts(&self, job: &DocumentJob) -> Result<(), StoreError> {
        let key_of = |reference: &BlobRef| {
            self.store.key_of(reference).ok_or_else(|| StoreError::Corrupt {
                key: reference.to_string(),
                detail: "reference not served by this store".to_string(),
            })
        };

        for image in &job.images {
            let key = key_of(image)?;
            let bytes = self.store.get(&key).await?;
            if !artifact_matches(&key, &bytes) {
                return Err(StoreError::Corrupt {
                    key,
                    detail: "content does not match its digest".to_string(),
                });
            }
        }

        let markdown_ref = job.markdown_ref.as_ref().ok_or_else(|| StoreError::Corrupt {
            key: manifest_key(&job.cache_key),
            detail: "no stored markdown".to_string(),
        })?;
        let key = key_of(markdown_ref)?;
        if self.store.get(&key).await? != job.markdown.as_bytes() {
            return Err(StoreError::Corrupt {
                key,
                detail: "stored markdown differs from manifest".to_string(),
            });
        }
        Ok(())
    }
}

/// The record of a running job, shared by the merge loop and the pages
/// reporting their transitions.
struct LiveRecord<'a> {
    record: tokio::sync::Mutex<JobRecord>,
    jobs: &'a dyn JobStore,
}

#[async_trait]
impl StageObserver for LiveRecord<'_> {
    async fn reached(&self, page_number: usize, stage: PageStage) {
        let mut record = self.record.lock().await;
        let Some(entry) = record.per_page_status.iter_mut().find(|(p, _)| *p == page_number) else {
            return;
        };
        entry.1 = stage;
        self.jobs.save(record.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageError;
    use crate::reconcile::ReconciliationReport;

    fn done(page: usize, md: &str) -> PageOutcome {
        PageOutcome {
            page_number: page,
            stage: PageStage::Done,
            report: Some(ReconciliationReport {
                page_number: page,
                placeholder_count: 0,
                image_count: 0,
                substituted: 0,
                omitted: 0,
                mismatches: 0,
                degraded: false,
                final_markdown: md.to_string(),
            }),
            images: vec![],
            error: None,
            retries: 0,
            duration_ms: 1,
        }
    }

    fn failed(page: usize) -> PageOutcome {
        PageOutcome::failed(
            PageError::RecognitionInconsistency {
                page,
                detail: "mismatch".into(),
            },
            0,
            1,
        )
    }

    #[test]
    fn status_from_outcomes() {
        assert_eq!(job_status(&[done(1, "a"), done(2, "b")]), JobStatus::Completed);
        assert_eq!(job_status(&[done(1, "a"), failed(2)]), JobStatus::PartiallyCompleted);
        assert_eq!(job_status(&[failed(1)]), JobStatus::Failed);
    }

    #[test]
    fn merge_uses_slice_order_and_separators() {
        let md = merge_pages(
            &[done(1, "one\n"), done(2, "two\n"), done(3, "three\n")],
            &PageSeparator::Comment,
        );
        assert_eq!(md, "one\n\n<!-- page 2 -->\n\ntwo\n\n<!-- page 3 -->\n\nthree\n");
    }

    #[test]
    fn merge_skips_failed_pages() {
        let md = merge_pages(&[done(1, "one"), failed(2), done(3, "three")], &PageSeparator::HorizontalRule);
        assert_eq!(md, "one\n\n---\n\nthree\n");
        assert_eq!(merge_pages(&[failed(1)], &PageSeparator::Comment), "");
    }

    #[test]
    fn cache_key_includes_partial_selection() {
        let bytes = b"%PDF-1.7 body";
        assert_eq!(cache_key(bytes, &PageSelection::All), content_hash(bytes));
        assert_ne!(
            cache_key(bytes, &PageSelection::Single(2)),
            cache_key(bytes, &PageSelection::All)
        );
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!flag.is_cancelled());
        other.cancel();
        assert!(flag.is_cancelled());
    }
}
