//! Push-style progress events.
//!
//! The [`crate::jobs::JobRecord`] is the source of truth for pollers. A
//! [`ConversionProgressCallback`] is for consumers that want to react as
//! events happen, such as the CLI progress bar. Install one with
//! [`crate::config::ConversionConfigBuilder::progress_callback`].
//!
//! Event order for one job:
//!
//! ```text
//! processed:  conversion_start(n) → { page_start → page_complete | page_error }×n → conversion_complete(.., false)
//! cache hit:  conversion_complete(n, n, true)
//! ```
//!
//! Page events of different pages interleave arbitrarily.
//!
//! ```rust
//! use edgequake_ocr2md::{ConversionConfig, ConversionProgressCallback};
//! use std::sync::{Arc, Mutex};
//!
//! #[derive(Default)]
//! struct FailedPages(Mutex<Vec<usize>>);
//!
//! impl ConversionProgressCallback for FailedPages {
//!     fn on_page_error(&self, page_num: usize, _total_pages: usize, error: &str) {
//!         eprintln!("page {page_num}: {error}");
//!         self.0.lock().unwrap().push(page_num);
//!     }
//! }
//!
//! let failed = Arc::new(FailedPages::default());
//! let config = ConversionConfig::builder()
//!     .progress_callback(failed.clone())
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Receiver of job events. All methods are no-ops by default.
///
/// Called from the merge loop of the document orchestrator, never
/// concurrently for one job; implementations still need to be `Sync` since
/// one callback may serve several jobs.
pub trait ConversionProgressCallback: Send + Sync {
    /// Pages rendered, `total_pages` selected pages about to go to OCR.
    fn on_conversion_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Page reconciled. `markdown_len` is the byte length of its Markdown.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, markdown_len: usize) {
        let _ = (page_num, total_pages, markdown_len);
    }

    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Job finished. Not called for cancelled jobs.
    fn on_conversion_complete(&self, total_pages: usize, success_count: usize, from_cache: bool) {
        let _ = (total_pages, success_count, from_cache);
    }
}

pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Shared handle stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
