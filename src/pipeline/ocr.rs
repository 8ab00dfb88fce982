//! OCR gateway: one page bitmap in, Markdown-with-placeholders and region
//! boxes out.
//!
//! The whole pipeline rests on one correspondence: the Nth placeholder in
//! the transcript belongs to the Nth region box. The gateway does not trust
//! the backend on this. It counts placeholders after cleanup and refuses to
//! return a recognition whose count differs from the number of boxes
//! ([`OcrError::Inconsistent`]), instead of silently truncating.
//!
//! Backends ([`OcrBackend`]) perform exactly one network call and classify
//! their failures; retries are the page orchestrator's job.

use crate::geometry::RegionBox;
use crate::pipeline::{cleanup, encode};
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Marker the OCR service emits where an image belongs.
pub const PLACEHOLDER: &str = "<|image|>";

/// Number of placeholder tokens in `markdown`.
pub fn count_placeholders(markdown: &str) -> usize {
    markdown.matches(PLACEHOLDER).count()
}

/// Recognition mode sent with each request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMode {
    /// Markdown plus image regions. (default)
    #[default]
    Grounding,
    /// Markdown only; the service reports no regions.
    Free,
}

impl fmt::Display for OcrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrMode::Grounding => f.write_str("grounding"),
            OcrMode::Free => f.write_str("free"),
        }
    }
}

/// A single-page request.
#[derive(Debug, Clone)]
pub struct OcrRequest {
    pub page_number: usize,
    pub png: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub mode: OcrMode,
}

/// What a backend returned, before verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecognition {
    pub markdown: String,
    #[serde(default)]
    pub regions: Vec<RegionBox>,
}

/// A verified recognition: `count(PLACEHOLDER, markdown) == regions.len()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    markdown: String,
    regions: Vec<RegionBox>,
}

impl Recognition {
    pub fn markdown(&self) -> &str {
        &self.markdown
    }

    pub fn regions(&self) -> &[RegionBox] {
        &self.regions
    }

    pub fn into_parts(self) -> (String, Vec<RegionBox>) {
        (self.markdown, self.regions)
    }
}

/// Failure of one OCR attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OcrError {
    /// Network trouble, timeout, 429 or 5xx. Worth retrying with backoff.
    #[error("transient OCR failure: {0}")]
    Transient(String),

    /// The response cannot be used: placeholder/region mismatch or malformed
    /// body. Not retryable.
    #[error("recognition inconsistency: {0}")]
    Inconsistent(String),

    /// The service refused the request (4xx other than 429). Not retryable.
    #[error("OCR request rejected: {0}")]
    Rejected(String),
}

impl OcrError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OcrError::Transient(_))
    }
}

/// One OCR network call.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn recognize(&self, request: OcrRequest) -> Result<RawRecognition, OcrError>;
}

/// Wraps an [`OcrBackend`] with encoding, a call timeout, cleanup and the
/// placeholder/region count check.
#[derive(Clone)]
pub struct OcrGateway {
    backend: Arc<dyn OcrBackend>,
    mode: OcrMode,
    timeout: Duration,
}

impl OcrGateway {
    pub fn new(backend: Arc<dyn OcrBackend>, mode: OcrMode, timeout: Duration) -> Self {
        Self {
            backend,
            mode,
            timeout,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Recognise one page. Single attempt; see [`OcrError::is_transient`].
    pub async fn extract(&self, page_number: usize, bitmap: &DynamicImage) -> Result<Recognition, OcrError> {
        let png = encode::encode_png(bitmap)
            .map_err(|e| OcrError::Rejected(format!("page bitmap could not be encoded: {e}")))?;
        let request = OcrRequest {
            page_number,
            png: Arc::new(png),
            width: bitmap.width(),
            height: bitmap.height(),
            mode: self.mode,
        };

        let start = Instant::now();
        let raw = tokio::time::timeout(self.timeout, self.backend.recognize(request))
            .await
            .map_err(|_| {
                OcrError::Transient(format!(
                    "{} timed out after {:?}",
                    self.backend.name(),
                    self.timeout
                ))
            })??;

        debug!(
            "Page {}: {} answered in {:?} with {} regions",
            page_number,
            self.backend.name(),
            start.elapsed(),
            raw.regions.len()
        );
        verify(raw)
    }
}

/// Clean the transcript and check the placeholder/region correspondence.
pub fn verify(raw: RawRecognition) -> Result<Recognition, OcrError> {
    let markdown = cleanup::clean_markdown(&raw.markdown);
    let placeholders = count_placeholders(&markdown);
    if placeholders != raw.regions.len() {
        return Err(OcrError::Inconsistent(format!(
            "{placeholders} placeholders but {} regions",
            raw.regions.len()
        )));
    }
    Ok(Recognition {
        markdown,
        regions: raw.regions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        calls: AtomicUsize,
        reply: Result<RawRecognition, OcrError>,
        delay: Duration,
    }

    #[async_trait]
    impl OcrBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn recognize(&self, request: OcrRequest) -> Result<RawRecognition, OcrError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.mode, OcrMode::Grounding);
            assert_eq!((request.width, request.height), (8, 4));
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn gateway(reply: Result<RawRecognition, OcrError>, delay: Duration) -> OcrGateway {
        let backend = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            reply,
            delay,
        });
        OcrGateway::new(backend, OcrMode::Grounding, Duration::from_millis(200))
    }

    fn bitmap() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::new(8, 4))
    }

    #[tokio::test]
    async fn matching_counts_pass() {
        let raw = RawRecognition {
            markdown: format!("# Title\n{PLACEHOLDER}\ntext {PLACEHOLDER}"),
            regions: vec![RegionBox::new(0.0, 0.0, 10.0, 10.0), RegionBox::new(20.0, 20.0, 30.0, 30.0)],
        };
        let rec = gateway(Ok(raw), Duration::ZERO).extract(1, &bitmap()).await.unwrap();
        assert_eq!(count_placeholders(rec.markdown()), rec.regions().len());
        assert_eq!(rec.regions().len(), 2);
    }

    #[tokio::test]
    async fn mismatch_is_inconsistency_not_truncation() {
        let raw = RawRecognition {
            markdown: format!("{PLACEHOLDER} {PLACEHOLDER} {PLACEHOLDER}"),
            regions: vec![RegionBox::new(0.0, 0.0, 10.0, 10.0)],
        };
        let err = gateway(Ok(raw), Duration::ZERO).extract(1, &bitmap()).await.unwrap_err();
        assert!(matches!(err, OcrError::Inconsistent(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_transient() {
        let raw = RawRecognition {
            markdown: "text".into(),
            regions: vec![],
        };
        let err = gateway(Ok(raw), Duration::from_secs(5)).extract(1, &bitmap()).await.unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
        assert_eq!(err, OcrError::Transient("scripted timed out after 200ms".into()));
    }

    #[tokio::test]
    async fn backend_errors_pass_through() {
        let err = gateway(Err(OcrError::Rejected("HTTP 400".into())), Duration::ZERO)
            .extract(1, &bitmap())
            .await
            .unwrap_err();
        assert_eq!(err, OcrError::Rejected("HTTP 400".into()));
    }

    #[test]
    fn raw_recognition_parses_service_json() {
        let raw: RawRecognition =
            serde_json::from_str(r#"{"markdown":"a <|image|>","regions":[[1,2,300,400]]}"#).unwrap();
        assert_eq!(raw.regions.len(), 1);
        assert!(verify(raw).is_ok());
    }
}
