//! # edgequake-ocr2md
//!
//! Convert scanned PDF documents to Markdown with figures in the right place.
//!
//! ## Why this crate?
//!
//! A scanned page has no text layer: an OCR service has to read it. Grounding
//! OCR models return the transcript with a placeholder token where each figure
//! sits, plus one bounding box per figure. The hard part is putting the
//! figures back. This crate threads a single integer index from the OCR
//! response through cropping to reconciliation, so the i-th placeholder is
//! always replaced by the i-th crop. No text matching, no second model call.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF bytes
//!  │
//!  ├─ 0. Cache     content hash hit → stored result, zero OCR calls
//!  ├─ 1. Render    rasterise selected pages via pdfium (spawn_blocking)
//!  ├─ 2. OCR       Markdown with <|image|> tokens + region boxes, verified
//!  ├─ 3. Crop      one PNG per box, same order, stored in the blob store
//!  ├─ 4. Reconcile i-th token → i-th image link
//!  └─ 5. Merge     page order, page-boundary markers, result cached
//! ```
//!
//! Steps 2–4 run concurrently across pages ([`page::PageOrchestrator`]);
//! [`document::DocumentOrchestrator`] merges in page order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocr2md::{
//!     ConversionConfig, DocumentOrchestrator, HttpOcrBackend, MemoryBlobStore,
//!     MemoryJobStore, OcrGateway, PdfiumRenderer, PlaceholderReconciler,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::default();
//!     let gateway = OcrGateway::new(
//!         Arc::new(HttpOcrBackend::new("http://localhost:8000/ocr")),
//!         config.ocr_mode,
//!         config.api_timeout(),
//!     );
//!     let orchestrator = DocumentOrchestrator::new(
//!         config.clone(),
//!         Arc::new(PdfiumRenderer::new(config.max_rendered_pixels)),
//!         gateway,
//!         Arc::new(MemoryBlobStore::new()),
//!         Arc::new(MemoryJobStore::new()),
//!         Arc::new(PlaceholderReconciler::new(config.omission_marker.clone())),
//!     );
//!
//!     let bytes = std::fs::read("scan.pdf")?;
//!     let job = orchestrator.process(&bytes).await?;
//!     println!("{}", job.markdown);
//!     eprintln!("{:?}, failed pages: {:?}", job.status, job.failed_pages());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocr2md` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-ocr2md = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod geometry;
pub mod jobs;
pub mod page;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod reconcile;
pub mod service;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ConversionConfig, ConversionConfigBuilder, PageSelection, PageSeparator, ReconcileStrategy,
};
pub use document::{cache_key, CancelFlag, DocumentJob, DocumentOrchestrator};
pub use error::{Ocr2MdError, PageError};
pub use geometry::{GeometryError, PixelRect, RegionBox};
pub use jobs::{JobProgress, JobRecord, JobStatus, JobStore, MemoryJobStore};
pub use page::{PageOrchestrator, PageOutcome, PageStage, StageObserver};
pub use pipeline::crop::{CroppedImage, RegionCropper};
pub use pipeline::http_ocr::HttpOcrBackend;
pub use pipeline::input::load_input;
pub use pipeline::ocr::{OcrBackend, OcrError, OcrGateway, OcrMode, Recognition, PLACEHOLDER};
pub use pipeline::render::{DocumentMetadata, PageRenderer, PdfiumRenderer};
pub use pipeline::vision::VisionOcrBackend;
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use reconcile::{
    LegacySemanticAnchor, PlaceholderReconciler, ReconcileInput, ReconciliationReport, Reconciler,
};
pub use service::{JobResult, JobStatusView, Ocr2MdService};
pub use store::{BlobRef, BlobStore, FsBlobStore, MemoryBlobStore, StoreError};
