//! Positional placeholder substitution.
//!
//! One left-to-right pass records where every placeholder starts; the output
//! is then assembled into a fresh buffer, copying the text between
//! placeholders and writing the i-th image link in place of the i-th token.
//! Nothing is replaced in place, so earlier substitutions cannot shift the
//! offsets of later ones.

use super::{image_link, ReconcileInput, ReconciliationReport, Reconciler};
use crate::pipeline::ocr::{count_placeholders, PLACEHOLDER};
use async_trait::async_trait;
use tracing::warn;

/// Default [`Reconciler`].
#[derive(Debug, Clone)]
pub struct PlaceholderReconciler {
    omission_marker: String,
}

impl PlaceholderReconciler {
    pub fn new(omission_marker: impl Into<String>) -> Self {
        Self {
            omission_marker: omission_marker.into(),
        }
    }

    /// Synchronous core of [`Reconciler::reconcile`].
    pub fn substitute(&self, input: ReconcileInput<'_>) -> ReconciliationReport {
        let markdown = input.raw_markdown;
        let positions: Vec<usize> = markdown.match_indices(PLACEHOLDER).map(|(at, _)| at).collect();
        let placeholder_count = positions.len();
        let image_count = input.images.len();

        let mut out = String::with_capacity(markdown.len() + image_count * 64);
        let mut cursor = 0;
        let mut substituted = 0;
        let mut omitted = 0;

        for (i, &at) in positions.iter().enumerate() {
            out.push_str(&markdown[cursor..at]);
            match input.images.get(i).and_then(image_link) {
                Some(link) => {
                    out.push_str(&link);
                    substituted += 1;
                }
                None => {
                    out.push_str(&self.omission_marker);
                    omitted += 1;
                }
            }
            cursor = at + PLACEHOLDER.len();
        }
        out.push_str(&markdown[cursor..]);

        let mismatches = placeholder_count.abs_diff(image_count);
        // Crops beyond the last placeholder have nowhere to go.
        omitted += image_count.saturating_sub(placeholder_count);
        let degraded = mismatches > 0 || omitted > 0;
        if degraded {
            warn!(
                "Page {}: {} placeholders, {} images; {} substituted, {} omitted",
                input.page_number, placeholder_count, image_count, substituted, omitted
            );
        }
        debug_assert_eq!(count_placeholders(&out), 0);

        ReconciliationReport {
            page_number: input.page_number,
            placeholder_count,
            image_count,
            substituted,
            omitted,
            mismatches,
            degraded,
            final_markdown: out,
        }
    }
}

#[async_trait]
impl Reconciler for PlaceholderReconciler {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn reconcile(&self, input: ReconcileInput<'_>) -> ReconciliationReport {
        self.substitute(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_OMISSION_MARKER;
    use crate::pipeline::crop::CroppedImage;
    use crate::store::BlobRef;

    fn image(page: usize, index: usize) -> CroppedImage {
        CroppedImage {
            page_number: page,
            index,
            bytes: vec![],
            bounds: Default::default(),
            placeholder: false,
            reference: Some(BlobRef::new(format!("mem://p{page}/i{index}.png"))),
        }
    }

    fn input<'a>(markdown: &'a str, images: &'a [CroppedImage]) -> ReconcileInput<'a> {
        ReconcileInput {
            page_number: 1,
            raw_markdown: markdown,
            images,
            page_png: None,
        }
    }

    fn reconciler() -> PlaceholderReconciler {
        PlaceholderReconciler::new(DEFAULT_OMISSION_MARKER)
    }

    #[test]
    fn substitutes_in_order() {
        let md = format!("# A\n{PLACEHOLDER}\nmiddle\n{PLACEHOLDER}\nend");
        let images = [image(1, 1), image(1, 2)];
        let report = reconciler().substitute(input(&md, &images));

        assert_eq!(
            report.final_markdown,
            "# A\n![page-1-image-1](mem://p1/i1.png)\nmiddle\n![page-1-image-2](mem://p1/i2.png)\nend"
        );
        assert_eq!(report.substituted, 2);
        assert!(!report.degraded);
    }

    #[test]
    fn short_images_become_omission_markers() {
        let md = format!("a {PLACEHOLDER} b {PLACEHOLDER} c {PLACEHOLDER}");
        let images = [image(1, 1)];
        let report = reconciler().substitute(input(&md, &images));

        assert_eq!(report.placeholder_count, 3);
        assert_eq!(report.image_count, 1);
        assert_eq!(report.substituted, 1);
        assert_eq!(report.omitted, 2);
        assert_eq!(report.mismatches, 2);
        assert!(report.degraded);
        assert_eq!(report.final_markdown.matches(DEFAULT_OMISSION_MARKER).count(), 2);
        assert!(!report.final_markdown.contains(PLACEHOLDER));
    }

    #[test]
    fn extra_images_are_reported_not_placed() {
        let md = format!("only {PLACEHOLDER}");
        let images = [image(1, 1), image(1, 2)];
        let report = reconciler().substitute(input(&md, &images));

        assert_eq!(report.substituted, 1);
        assert_eq!(report.omitted, 1);
        assert!(report.degraded);
        assert!(!report.final_markdown.contains("image-2"));
    }

    #[test]
    fn reconciling_reconciled_text_is_a_no_op() {
        let md = format!("x {PLACEHOLDER} y");
        let images = [image(1, 1)];
        let once = reconciler().substitute(input(&md, &images)).final_markdown;
        let twice = reconciler().substitute(input(&once, &[])).final_markdown;
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_reference_is_omitted() {
        let md = format!("{PLACEHOLDER}");
        let mut unstored = image(1, 1);
        unstored.reference = None;
        let images = [unstored];
        let report = reconciler().substitute(input(&md, &images));
        assert_eq!(report.final_markdown, DEFAULT_OMISSION_MARKER);
        assert_eq!(report.omitted, 1);
    }

    #[test]
    fn adjacent_placeholders_and_multibyte_text() {
        let md = format!("é{PLACEHOLDER}{PLACEHOLDER}ü");
        let images = [image(1, 1), image(1, 2)];
        let report = reconciler().substitute(input(&md, &images));
        assert!(report.final_markdown.starts_with("é![page-1-image-1]"));
        assert!(report.final_markdown.ends_with("(mem://p1/i2.png)ü"));
    }
}
