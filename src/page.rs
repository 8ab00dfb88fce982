//! Per-page lifecycle: render → recognize → crop → reconcile.
//!
//! Each state is its own type and each transition consumes the previous
//! state, so a page can only move forward:
//!
//! ```text
//! Rendered ──recognize──▶ Recognized ──crop──▶ Cropped ──reconcile──▶ Reconciled ──finish──▶ PageOutcome
//!    ▲   │                                 (bitmap dropped here)
//!    └───┘ transient OCR failure, retried with backoff
//! ```
//!
//! Any transition may end in [`PageStage::Failed`]; that is recorded in the
//! [`PageOutcome`] and never propagated as an error, so one bad page cannot
//! abort its siblings.

use crate::config::ConversionConfig;
use crate::error::PageError;
use crate::geometry::RegionBox;
use crate::pipeline::crop::{CropError, CroppedImage, RegionCropper};
use crate::pipeline::encode;
use crate::pipeline::ocr::{OcrError, OcrGateway};
use crate::reconcile::{ReconcileInput, ReconciliationReport, Reconciler};
use crate::store::BlobRef;
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Stage a page has reached, as reported to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStage {
    Rendered,
    Recognized,
    Cropped,
    Reconciled,
    Done,
    Failed,
}

/// A rasterised page waiting for OCR.
#[derive(Debug)]
pub struct Rendered {
    page_number: usize,
    bitmap: DynamicImage,
}

/// OCR succeeded; the transcript's placeholders match `regions`.
#[derive(Debug)]
pub struct Recognized {
    page_number: usize,
    bitmap: DynamicImage,
    markdown: String,
    regions: Vec<RegionBox>,
}

/// Regions cut out and stored. The bitmap is gone.
#[derive(Debug)]
pub struct Cropped {
    page_number: usize,
    markdown: String,
    images: Vec<CroppedImage>,
    page_png: Option<Vec<u8>>,
}

/// Final Markdown produced.
#[derive(Debug)]
pub struct Reconciled {
    page_number: usize,
    report: ReconciliationReport,
    images: Vec<CroppedImage>,
}

impl Rendered {
    pub fn new(page_number: usize, bitmap: DynamicImage) -> Self {
        Self { page_number, bitmap }
    }

    pub fn page_number(&self) -> usize {
        self.page_number
    }

    /// One OCR attempt. On failure the page comes back unchanged so the
    /// caller can retry the same transition.
    pub async fn recognize(self, gateway: &OcrGateway) -> Result<Recognized, (Rendered, OcrError)> {
        match gateway.extract(self.page_number, &self.bitmap).await {
            Ok(recognition) => {
                let (markdown, regions) = recognition.into_parts();
                Ok(Recognized {
                    page_number: self.page_number,
                    bitmap: self.bitmap,
                    markdown,
                    regions,
                })
            }
            Err(e) => Err((self, e)),
        }
    }
}

impl Recognized {
    pub fn markdown(&self) -> &str {
        &self.markdown
    }

    pub fn regions(&self) -> &[RegionBox] {
        &self.regions
    }

    /// Crop and store every region, releasing the bitmap.
    ///
    /// With `keep_page_png` the full page is PNG-encoded first, for
    /// reconcilers that look at the whole page.
    pub async fn crop(
        self,
        cropper: &RegionCropper,
        cache_key: &str,
        keep_page_png: bool,
    ) -> Result<Cropped, PageError> {
        let page = self.page_number;
        let page_png = if keep_page_png {
            let png = encode::encode_png(&self.bitmap).map_err(|e| PageError::CropFailed {
                page,
                detail: format!("page image could not be encoded: {e}"),
            })?;
            Some(png)
        } else {
            None
        };

        let images = cropper
            .crop(cache_key, page, self.bitmap, self.regions)
            .await
            .map_err(|e| match e {
                CropError::Store(source) => PageError::StorageFailed {
                    page,
                    detail: source.to_string(),
                },
                other => PageError::CropFailed {
                    page,
                    detail: other.to_string(),
                },
            })?;

        Ok(Cropped {
            page_number: page,
            markdown: self.markdown,
            images,
            page_png,
        })
    }
}

impl Cropped {
    pub fn images(&self) -> &[CroppedImage] {
        &self.images
    }

    pub async fn reconcile(self, reconciler: &dyn Reconciler) -> Reconciled {
        let report = reconciler
            .reconcile(ReconcileInput {
                page_number: self.page_number,
                raw_markdown: &self.markdown,
                images: &self.images,
                page_png: self.page_png.as_deref(),
            })
            .await;
        Reconciled {
            page_number: self.page_number,
            report,
            images: self.images,
        }
    }
}

impl Reconciled {
    pub fn report(&self) -> &ReconciliationReport {
        &self.report
    }

    pub fn finish(self, retries: u32, duration_ms: u64) -> PageOutcome {
        PageOutcome {
            page_number: self.page_number,
            stage: PageStage::Done,
            images: self.images.into_iter().filter_map(|img| img.reference).collect(),
            report: Some(self.report),
            error: None,
            retries,
            duration_ms,
        }
    }
}

/// Result of one page, success or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOutcome {
    pub page_number: usize,
    /// `Done` or `Failed`.
    pub stage: PageStage,
    pub report: Option<ReconciliationReport>,
    /// Stored crops in region order.
    pub images: Vec<BlobRef>,
    pub error: Option<PageError>,
    /// OCR retries spent on this page.
    pub retries: u32,
    pub duration_ms: u64,
}

impl PageOutcome {
    pub fn failed(error: PageError, retries: u32, duration_ms: u64) -> Self {
        Self {
            page_number: error.page(),
            stage: PageStage::Failed,
            report: None,
            images: Vec::new(),
            error: Some(error),
            retries,
            duration_ms,
        }
    }

    pub fn is_done(&self) -> bool {
        self.stage == PageStage::Done
    }

    /// Final page Markdown, when the page succeeded.
    pub fn markdown(&self) -> Option<&str> {
        self.report.as_ref().map(|r| r.final_markdown.as_str())
    }
}

/// Told about each intermediate transition as it happens, so pollers can
/// see pages move through `Recognized`, `Cropped` and `Reconciled`.
/// Terminal stages are reported through the [`PageOutcome`] instead.
#[async_trait]
pub trait StageObserver: Send + Sync {
    async fn reached(&self, page_number: usize, stage: PageStage);
}

#[async_trait]
impl StageObserver for () {
    async fn reached(&self, _page_number: usize, _stage: PageStage) {}
}

/// Drives one page through every transition.
#[derive(Clone)]
pub struct PageOrchestrator {
    gateway: OcrGateway,
    cropper: RegionCropper,
    reconciler: Arc<dyn Reconciler>,
    config: Arc<ConversionConfig>,
}

impl PageOrchestrator {
    pub fn new(
        gateway: OcrGateway,
        cropper: RegionCropper,
        reconciler: Arc<dyn Reconciler>,
        config: Arc<ConversionConfig>,
    ) -> Self {
        Self {
            gateway,
            cropper,
            reconciler,
            config,
        }
    }

    /// Process one rendered page. Never fails; see [`PageOutcome::stage`].
    pub async fn run(
        &self,
        page_number: usize,
        bitmap: DynamicImage,
        cache_key: &str,
        observer: &dyn StageObserver,
    ) -> PageOutcome {
        let start = Instant::now();
        let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

        let mut page = Rendered::new(page_number, bitmap);
        let mut retries = 0u32;

        let recognized = loop {
            match page.recognize(&self.gateway).await {
                Ok(recognized) => break recognized,
                Err((back, OcrError::Transient(detail))) if retries < self.config.max_retries => {
                    retries += 1;
                    let delay = self.config.backoff_for(retries);
                    warn!(
                        "Page {}: transient OCR failure ({}), retry {}/{} in {}ms",
                        page_number,
                        detail,
                        retries,
                        self.config.max_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    page = back;
                }
                Err((_, e)) => {
                    let error = match e {
                        OcrError::Transient(detail) => PageError::OcrUnavailable {
                            page: page_number,
                            retries,
                            detail,
                        },
                        OcrError::Inconsistent(detail) => PageError::RecognitionInconsistency {
                            page: page_number,
                            detail,
                        },
                        OcrError::Rejected(detail) => PageError::OcrRejected {
                            page: page_number,
                            detail,
                        },
                    };
                    warn!("{}", error);
                    return PageOutcome::failed(error, retries, elapsed(start));
                }
            }
        };
        debug!(
            "Page {}: recognized, {} regions",
            page_number,
            recognized.regions().len()
        );
        observer.reached(page_number, PageStage::Recognized).await;

        let cropped = match recognized
            .crop(&self.cropper, cache_key, self.reconciler.needs_page_image())
            .await
        {
            Ok(cropped) => cropped,
            Err(error) => {
                warn!("{}", error);
                return PageOutcome::failed(error, retries, elapsed(start));
            }
        };

        observer.reached(page_number, PageStage::Cropped).await;

        let reconciled = cropped.reconcile(self.reconciler.as_ref()).await;
        observer.reached(page_number, PageStage::Reconciled).await;
        let report = reconciled.report();
        info!(
            "Page {}: done ({} images placed{})",
            page_number,
            report.substituted,
            if report.degraded { ", degraded" } else { "" }
        );
        reconciled.finish(retries, elapsed(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ocr::{OcrBackend, OcrMode, OcrRequest, RawRecognition, PLACEHOLDER};
    use crate::reconcile::PlaceholderReconciler;
    use crate::store::MemoryBlobStore;
    use async_trait::async_trait;
    use image::RgbaImage;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replies in order; repeats the last one when the script runs out.
    struct Script {
        replies: Mutex<VecDeque<Result<RawRecognition, OcrError>>>,
        calls: AtomicUsize,
    }

    impl Script {
        fn new(replies: Vec<Result<RawRecognition, OcrError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OcrBackend for Script {
        fn name(&self) -> &str {
            "script"
        }

        async fn recognize(&self, _request: OcrRequest) -> Result<RawRecognition, OcrError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap()
            }
        }
    }

    #[derive(Default)]
    struct StageLog(Mutex<Vec<(usize, PageStage)>>);

    #[async_trait]
    impl StageObserver for StageLog {
        async fn reached(&self, page_number: usize, stage: PageStage) {
            self.0.lock().unwrap().push((page_number, stage));
        }
    }

    fn good() -> RawRecognition {
        RawRecognition {
            markdown: format!("# Page\n\n{PLACEHOLDER}\n\nCaption."),
            regions: vec![RegionBox::new(100.0, 100.0, 500.0, 500.0)],
        }
    }

    fn orchestrator(backend: Arc<Script>, store: Arc<MemoryBlobStore>) -> PageOrchestrator {
        let config = ConversionConfig::builder()
            .max_retries(2)
            .retry_backoff_ms(1)
            .max_backoff_ms(2)
            .build()
            .unwrap();
        PageOrchestrator::new(
            OcrGateway::new(backend, OcrMode::Grounding, Duration::from_secs(5)),
            RegionCropper::new(store),
            Arc::new(PlaceholderReconciler::new(config.omission_marker.clone())),
            Arc::new(config),
        )
    }

    fn bitmap() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::new(200, 300))
    }

    #[tokio::test]
    async fn happy_path_reaches_done() {
        let backend = Script::new(vec![Ok(good())]);
        let store = Arc::new(MemoryBlobStore::new());
        let observer = StageLog::default();
        let outcome = orchestrator(backend.clone(), store.clone())
            .run(4, bitmap(), "k", &observer)
            .await;

        assert!(outcome.is_done(), "{outcome:?}");
        assert_eq!(
            *observer.0.lock().unwrap(),
            vec![
                (4, PageStage::Recognized),
                (4, PageStage::Cropped),
                (4, PageStage::Reconciled)
            ]
        );
        assert_eq!(outcome.page_number, 4);
        assert_eq!(outcome.images.len(), 1);
        assert_eq!(store.len(), 1);
        let md = outcome.markdown().unwrap();
        assert!(md.contains("![page-4-image-1](mem://artifacts/k/page-0004/image-001-"));
        assert!(!md.contains(PLACEHOLDER));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = Script::new(vec![
            Err(OcrError::Transient("503".into())),
            Err(OcrError::Transient("timeout".into())),
            Ok(good()),
        ]);
        let outcome = orchestrator(backend.clone(), Arc::new(MemoryBlobStore::new()))
            .run(1, bitmap(), "k", &())
            .await;

        assert!(outcome.is_done());
        assert_eq!(outcome.retries, 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_bound_is_respected() {
        let backend = Script::new(vec![Err(OcrError::Transient("503".into()))]);
        let outcome = orchestrator(backend.clone(), Arc::new(MemoryBlobStore::new()))
            .run(2, bitmap(), "k", &())
            .await;

        assert_eq!(outcome.stage, PageStage::Failed);
        assert!(matches!(
            outcome.error,
            Some(PageError::OcrUnavailable { page: 2, retries: 2, .. })
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn inconsistency_fails_without_retry() {
        let bad = RawRecognition {
            markdown: format!("{PLACEHOLDER}{PLACEHOLDER}"),
            regions: vec![RegionBox::new(0.0, 0.0, 10.0, 10.0)],
        };
        let backend = Script::new(vec![Ok(bad)]);
        let store = Arc::new(MemoryBlobStore::new());
        let observer = StageLog::default();
        let outcome = orchestrator(backend.clone(), store.clone())
            .run(3, bitmap(), "k", &observer)
            .await;

        assert!(matches!(
            outcome.error,
            Some(PageError::RecognitionInconsistency { page: 3, .. })
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
        assert!(observer.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transitions_expose_intermediate_state() {
        let backend = Script::new(vec![Ok(good())]);
        let gateway = OcrGateway::new(backend, OcrMode::Grounding, Duration::from_secs(5));
        let cropper = RegionCropper::new(Arc::new(MemoryBlobStore::new()));

        let recognized = Rendered::new(1, bitmap()).recognize(&gateway).await.unwrap();
        assert_eq!(recognized.regions().len(), 1);
        let cropped = recognized.crop(&cropper, "k", false).await.unwrap();
        assert_eq!(cropped.images().len(), 1);
        let reconciled = cropped.reconcile(&PlaceholderReconciler::new("*x*")).await;
        assert_eq!(reconciled.report().substituted, 1);
        assert_eq!(reconciled.finish(0, 0).stage, PageStage::Done);
    }
}
