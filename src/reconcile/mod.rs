//! Reconciliation: put cropped images back into the transcript.
//!
//! Two implementations of [`Reconciler`]:
//!
//! * [`placeholder::PlaceholderReconciler`] substitutes the i-th placeholder
//!   with the i-th crop. Deterministic, no I/O. This is the default.
//! * [`legacy::LegacySemanticAnchor`] asks a vision model where each image
//!   belongs and searches the transcript for the proposed anchor text. Kept
//!   so both strategies can be compared on the same input.
//!
//! The page orchestrator only ever sees `Arc<dyn Reconciler>`.

pub mod legacy;
pub mod placeholder;

pub use crate::config::ReconcileStrategy;
pub use legacy::LegacySemanticAnchor;
pub use placeholder::PlaceholderReconciler;

use crate::config::ConversionConfig;
use crate::error::Ocr2MdError;
use crate::pipeline::crop::CroppedImage;
use async_trait::async_trait;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything a reconciler may look at for one page.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileInput<'a> {
    pub page_number: usize,
    /// Cleaned OCR transcript, placeholders included.
    pub raw_markdown: &'a str,
    /// Crops in region order.
    pub images: &'a [CroppedImage],
    /// Full page as PNG; only provided when
    /// [`Reconciler::needs_page_image`] is `true`.
    pub page_png: Option<&'a [u8]>,
}

/// Outcome of reconciling one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub page_number: usize,
    pub placeholder_count: usize,
    pub image_count: usize,
    /// Images actually placed in the output.
    pub substituted: usize,
    /// Placeholders (or images) rendered as the omission marker or dropped.
    pub omitted: usize,
    /// `|placeholder_count - image_count|`.
    pub mismatches: usize,
    /// Counts disagreed or images were lost; output is best-effort.
    pub degraded: bool,
    pub final_markdown: String,
}

/// Strategy that turns a transcript plus crops into final page Markdown.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the full page PNG must be kept past cropping.
    fn needs_page_image(&self) -> bool {
        false
    }

    /// Never fails: problems are reported through
    /// [`ReconciliationReport::degraded`].
    async fn reconcile(&self, input: ReconcileInput<'_>) -> ReconciliationReport;
}

/// Alt text and link for one placed image.
pub(crate) fn image_link(image: &CroppedImage) -> Option<String> {
    image
        .reference
        .as_ref()
        .map(|r| format!("![page-{}-image-{}]({})", image.page_number, image.index, r))
}

/// Build the reconciler selected by `config.strategy`.
///
/// `provider` is only consulted for [`ReconcileStrategy::LegacyAnchor`].
pub fn for_strategy(
    config: &ConversionConfig,
    provider: Option<Arc<dyn LLMProvider>>,
) -> Result<Arc<dyn Reconciler>, Ocr2MdError> {
    match config.strategy {
        ReconcileStrategy::Placeholder => {
            Ok(Arc::new(PlaceholderReconciler::new(config.omission_marker.clone())))
        }
        ReconcileStrategy::LegacyAnchor => {
            let provider = provider.ok_or_else(|| Ocr2MdError::ProviderNotConfigured {
                provider: "legacy_anchor".to_string(),
                hint: "The legacy anchor strategy needs a vision provider (--provider / --model)."
                    .to_string(),
            })?;
            Ok(Arc::new(LegacySemanticAnchor::new(provider)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlobRef;

    #[test]
    fn image_link_needs_a_reference() {
        let mut image = CroppedImage {
            page_number: 2,
            index: 3,
            bytes: vec![],
            bounds: Default::default(),
            placeholder: false,
            reference: None,
        };
        assert_eq!(image_link(&image), None);

        image.reference = Some(BlobRef::new("mem://a/b.png"));
        assert_eq!(image_link(&image).as_deref(), Some("![page-2-image-3](mem://a/b.png)"));
    }

    #[test]
    fn default_strategy_is_placeholder() {
        let reconciler = for_strategy(&ConversionConfig::default(), None).unwrap();
        assert_eq!(reconciler.name(), "placeholder");
        assert!(!reconciler.needs_page_image());
    }

    #[test]
    fn legacy_strategy_requires_provider() {
        let config = ConversionConfig::builder()
            .strategy(ReconcileStrategy::LegacyAnchor)
            .build()
            .unwrap();
        assert!(matches!(
            for_strategy(&config, None),
            Err(Ocr2MdError::ProviderNotConfigured { .. })
        ));
    }
}
