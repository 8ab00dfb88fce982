//! Error types for the edgequake-ocr2md library.
//!
//! Two layers of failure, kept apart on purpose:
//!
//! * [`Ocr2MdError`] is **fatal**: the job cannot produce any result at all
//!   (unreadable PDF, wrong password, the artifact store refused the merged
//!   document). Returned as `Err(Ocr2MdError)` from the orchestrator.
//!
//! * [`PageError`] is **non-fatal**: one page failed (OCR kept timing out,
//!   the service returned placeholders that do not match its regions) while
//!   the rest of the document is fine. Stored inside
//!   [`crate::page::PageOutcome`] so a caller can resubmit exactly the failed
//!   pages.
//!
//! Stage-local errors ([`crate::pipeline::ocr::OcrError`],
//! [`crate::geometry::GeometryError`], [`crate::store::StoreError`]) live next
//! to the stage that raises them and are folded into one of the two types
//! above by the orchestrators.

use crate::store::StoreError;
use thiserror::Error;

/// All fatal errors returned by the edgequake-ocr2md library.
#[derive(Debug, Error)]
pub enum Ocr2MdError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: String },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes were read, but they are not a PDF.
    #[error("Input is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF is corrupt: {detail}")]
    CorruptPdf { detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired,

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF")]
    WrongPassword,

    /// The page selection matched no page of the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    // ── OCR provider errors ───────────────────────────────────────────────
    /// The configured OCR provider is not initialised (missing API key etc.).
    #[error("OCR provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// The artifact store could not persist the merged result.
    #[error("Failed to store result for job {job_id}: {source}")]
    StorageFailed {
        job_id: String,
        #[source]
        source: StoreError,
    },

    /// Could not create or write the output Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// The document keeps going; the page is reported as
/// [`crate::page::PageStage::Failed`] and the job as partially completed.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// OCR kept failing with transient errors until the retry bound was hit.
    #[error("Page {page}: OCR failed after {retries} retries: {detail}")]
    OcrUnavailable {
        page: usize,
        retries: u32,
        detail: String,
    },

    /// OCR answered, but its placeholders and regions disagree (or the
    /// response could not be parsed). Retrying does not help.
    #[error("Page {page}: recognition inconsistent: {detail}")]
    RecognitionInconsistency { page: usize, detail: String },

    /// The OCR service rejected the request outright.
    #[error("Page {page}: OCR request rejected: {detail}")]
    OcrRejected { page: usize, detail: String },

    /// A region could not be cut out or encoded.
    #[error("Page {page}: cropping failed: {detail}")]
    CropFailed { page: usize, detail: String },

    /// Cropped images could not be written to the artifact store.
    #[error("Page {page}: storing cropped images failed: {detail}")]
    StorageFailed { page: usize, detail: String },
}

impl PageError {
    /// 1-indexed page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::OcrUnavailable { page, .. }
            | PageError::RecognitionInconsistency { page, .. }
            | PageError::OcrRejected { page, .. }
            | PageError::CropFailed { page, .. }
            | PageError::StorageFailed { page, .. } => *page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_error_reports_its_page() {
        let e = PageError::RecognitionInconsistency {
            page: 4,
            detail: "3 placeholders, 2 regions".into(),
        };
        assert_eq!(e.page(), 4);
        assert!(e.to_string().contains("Page 4"));
    }

    #[test]
    fn ocr_unavailable_display() {
        let e = PageError::OcrUnavailable {
            page: 2,
            retries: 3,
            detail: "timed out".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("3 retries"), "got: {msg}");
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn storage_failed_display() {
        let e = Ocr2MdError::StorageFailed {
            job_id: "job-1".into(),
            source: StoreError::Io("disk full".into()),
        };
        assert!(e.to_string().contains("job-1"));
        assert!(e.to_string().contains("disk full"));
    }

    #[test]
    fn page_error_roundtrips_through_json() {
        let e = PageError::OcrRejected {
            page: 1,
            detail: "HTTP 400".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: PageError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
