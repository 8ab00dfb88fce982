//! Configuration types for scanned-PDF conversion.
//!
//! Every knob lives in [`ConversionConfig`], built via its
//! [`ConversionConfigBuilder`]. The OCR backend, the stores and the
//! reconciler are injected separately into
//! [`crate::document::DocumentOrchestrator`]; this struct only holds plain
//! values so it can be cloned into every page task.

use crate::error::Ocr2MdError;
use crate::pipeline::ocr::OcrMode;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default marker rendered where an image was expected but none was produced.
pub const DEFAULT_OMISSION_MARKER: &str = "*[image omitted]*";

/// Configuration for a scanned-PDF conversion job.
///
/// # Example
/// ```rust
/// use edgequake_ocr2md::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .concurrency(4)
///     .max_retries(5)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Longest edge of the rendered page bitmap in pixels. Default: 2000.
    ///
    /// Pages are rasterised to a fixed resolution so the OCR service always
    /// sees comparable input and region boxes project onto the same grid
    /// regardless of the physical page size.
    pub max_rendered_pixels: u32,

    /// Number of pages in flight at once. Default: 4.
    ///
    /// Only the OCR call is network-bound; cropping and reconciliation are
    /// cheap. Lower this if the OCR service starts answering 429.
    pub concurrency: usize,

    /// Recognition mode sent with every OCR request. Default: grounding.
    pub ocr_mode: OcrMode,

    /// Retries of the OCR call on a transient failure. Default: 3.
    ///
    /// Inconsistent or rejected responses are never retried.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Upper bound of a single retry delay in milliseconds. Default: 8000.
    pub max_backoff_ms: u64,

    /// Per-OCR-call timeout in seconds. Default: 60.
    ///
    /// A timeout counts as a transient failure of that page only.
    pub api_timeout_secs: u64,

    /// Page selection. Default: all pages.
    pub pages: PageSelection,

    /// Page boundary marker in the merged document. Default: HTML comment.
    pub page_separator: PageSeparator,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Text substituted for a placeholder that has no cropped image.
    pub omission_marker: String,

    /// How cropped images are put back into the transcript. Default: placeholder.
    pub strategy: ReconcileStrategy,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional observer notified as pages resolve.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_rendered_pixels: 2000,
            concurrency: 4,
            ocr_mode: OcrMode::default(),
            max_retries: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 8000,
            api_timeout_secs: 60,
            pages: PageSelection::default(),
            page_separator: PageSeparator::default(),
            password: None,
            omission_marker: DEFAULT_OMISSION_MARKER.to_string(),
            strategy: ReconcileStrategy::default(),
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("ocr_mode", &self.ocr_mode)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("pages", &self.pages)
            .field("page_separator", &self.page_separator)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("omission_marker", &self.omission_marker)
            .field("strategy", &self.strategy)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn ocr_mode(mut self, mode: OcrMode) -> Self {
        self.config.ocr_mode = mode;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn omission_marker(mut self, marker: impl Into<String>) -> Self {
        self.config.omission_marker = marker.into();
        self
    }

    pub fn strategy(mut self, strategy: ReconcileStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Ocr2MdError> {
        let c = &self.config;
        if c.api_timeout_secs == 0 {
            return Err(Ocr2MdError::InvalidConfig(
                "OCR timeout must be at least 1 second".into(),
            ));
        }
        if c.max_backoff_ms < c.retry_backoff_ms {
            return Err(Ocr2MdError::InvalidConfig(format!(
                "max backoff ({}ms) is below the initial backoff ({}ms)",
                c.max_backoff_ms, c.retry_backoff_ms
            )));
        }
        if c.omission_marker.contains(crate::pipeline::ocr::PLACEHOLDER) {
            return Err(Ocr2MdError::InvalidConfig(
                "omission marker must not contain the OCR placeholder token".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Specifies which pages of the PDF to convert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Convert all pages (default).
    #[default]
    All,
    /// Convert a single page (1-indexed).
    Single(usize),
    /// Convert a contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Convert specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) if (1..=total_pages).contains(p) => vec![p - 1],
            PageSelection::Single(_) => vec![],
            PageSelection::Range(start, end) => ((*start).max(1) - 1..(*end).min(total_pages)).collect(),
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|p| (1..=total_pages).contains(*p))
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Stable textual form, used to tell cached results of different
    /// selections of the same upload apart. `None` for [`PageSelection::All`].
    pub fn fingerprint(&self) -> Option<String> {
        match self {
            PageSelection::All => None,
            PageSelection::Single(p) => Some(format!("p{p}")),
            PageSelection::Range(s, e) => Some(format!("p{s}-{e}")),
            PageSelection::Set(pages) => {
                let mut sorted = pages.clone();
                sorted.sort_unstable();
                sorted.dedup();
                let joined: Vec<String> = sorted.iter().map(|p| p.to_string()).collect();
                Some(format!("p{}", joined.join(",")))
            }
        }
    }
}

/// Reconciliation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStrategy {
    /// Positional placeholder substitution. (default)
    #[default]
    Placeholder,
    /// Model-proposed text anchors. Kept for comparison runs only; drops
    /// images whose anchor text does not match the transcript verbatim.
    LegacyAnchor,
}

impl fmt::Display for ReconcileStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileStrategy::Placeholder => f.write_str("placeholder"),
            ReconcileStrategy::LegacyAnchor => f.write_str("legacy_anchor"),
        }
    }
}

/// Page boundary marker placed between pages of the merged document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// HTML comment with the page number: `<!-- page N -->`. (default)
    #[default]
    Comment,
    /// Horizontal rule: `---`.
    HorizontalRule,
    /// Custom string; `{page}` is replaced by the page number.
    Custom(String),
}

impl PageSeparator {
    /// Render the boundary placed before page `page_num` (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::Comment => format!("\n\n<!-- page {page_num} -->\n\n"),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Custom(s) => {
                format!("\n\n{}\n\n", s.replace("{page}", &page_num.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_concurrency() {
        let config = ConversionConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ConversionConfig::builder()
            .retry_backoff_ms(500)
            .max_backoff_ms(1500)
            .build()
            .unwrap();
        assert_eq!(config.backoff_for(1), Duration::from_millis(500));
        assert_eq!(config.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(config.backoff_for(3), Duration::from_millis(1500));
        assert_eq!(config.backoff_for(40), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_backoff_cap_below_initial_delay() {
        let err = ConversionConfig::builder()
            .retry_backoff_ms(1000)
            .max_backoff_ms(10)
            .build()
            .unwrap_err();
        assert!(matches!(err, Ocr2MdError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_marker_containing_placeholder() {
        let marker = format!("missing {}", crate::pipeline::ocr::PLACEHOLDER);
        assert!(ConversionConfig::builder().omission_marker(marker).build().is_err());
    }

    #[test]
    fn page_selection_to_indices() {
        assert_eq!(PageSelection::All.to_indices(3), vec![0, 1, 2]);
        assert_eq!(PageSelection::Single(3).to_indices(5), vec![2]);
        assert_eq!(PageSelection::Single(6).to_indices(5), Vec::<usize>::new());
        assert_eq!(PageSelection::Range(2, 9).to_indices(4), vec![1, 2, 3]);
        assert_eq!(PageSelection::Set(vec![3, 1, 3]).to_indices(5), vec![0, 2]);
    }

    #[test]
    fn fingerprint_is_order_insensitive_for_sets() {
        assert_eq!(PageSelection::All.fingerprint(), None);
        assert_eq!(
            PageSelection::Set(vec![3, 1, 3]).fingerprint(),
            PageSelection::Set(vec![1, 3]).fingerprint()
        );
    }

    #[test]
    fn separator_rendering() {
        assert_eq!(PageSeparator::Comment.render(2), "\n\n<!-- page 2 -->\n\n");
        assert_eq!(
            PageSeparator::Custom("=== {page} ===".into()).render(7),
            "\n\n=== 7 ===\n\n"
        );
    }
}
