//! Anchor-based reconciliation through a vision model.
//!
//! The model sees the transcript (placeholders removed), the full page and
//! every crop, and proposes for each image a piece of transcript text plus an
//! operation. Proposals are applied by exact substring search. When the model
//! paraphrases the page instead of quoting the transcript (`Fig. 1.` read off
//! the image against `**Figure 1:**` in the transcript) the search misses and
//! the image is dropped. [`super::PlaceholderReconciler`] has no such failure
//! mode; this strategy stays for side-by-side comparison.

use super::{image_link, ReconcileInput, ReconciliationReport, Reconciler};
use crate::pipeline::cleanup;
use crate::pipeline::crop::CroppedImage;
use crate::pipeline::encode;
use crate::pipeline::ocr::{count_placeholders, PLACEHOLDER};
use crate::prompts::{anchor_request, ANCHOR_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where an image goes relative to its anchor text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorOperation {
    Replace,
    InsertBefore,
    InsertAfter,
}

/// One model proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorProposal {
    /// 1-based crop index.
    pub image: usize,
    pub anchor_text: String,
    pub operation: AnchorOperation,
}

#[derive(Deserialize)]
struct AnchorReply {
    #[serde(default)]
    anchors: Vec<AnchorProposal>,
}

/// Pull the proposals out of a model reply, tolerating fences and chatter
/// around the JSON object.
pub fn parse_proposals(reply: &str) -> Result<Vec<AnchorProposal>, serde_json::Error> {
    let body = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => reply,
    };
    serde_json::from_str::<AnchorReply>(body).map(|r| r.anchors)
}

/// Apply proposals to `transcript` by exact substring search.
///
/// Returns the new text and the 1-based indices of images that were not
/// placed, either because no proposal named them or because their anchor
/// text does not occur in the transcript.
pub fn apply_anchors(
    transcript: &str,
    proposals: &[AnchorProposal],
    images: &[CroppedImage],
) -> (String, Vec<usize>) {
    let mut text = transcript.to_string();
    let mut placed = vec![false; images.len()];

    for proposal in proposals {
        let Some(slot) = proposal.image.checked_sub(1).filter(|&i| i < images.len()) else {
            debug!("anchor proposal for unknown image {}", proposal.image);
            continue;
        };
        if placed[slot] || proposal.anchor_text.is_empty() {
            continue;
        }
        let Some(link) = image_link(&images[slot]) else {
            continue;
        };
        let Some(at) = text.find(&proposal.anchor_text) else {
            debug!("anchor text for image {} not found: {:?}", proposal.image, proposal.anchor_text);
            continue;
        };

        let end = at + proposal.anchor_text.len();
        let replacement = match proposal.operation {
            AnchorOperation::Replace => link,
            AnchorOperation::InsertBefore => format!("{link}\n\n{}", proposal.anchor_text),
            AnchorOperation::InsertAfter => format!("{}\n\n{link}", proposal.anchor_text),
        };
        text.replace_range(at..end, &replacement);
        placed[slot] = true;
    }

    let dropped = placed
        .iter()
        .enumerate()
        .filter(|&(_, &p)| !p)
        .map(|(i, _)| i + 1)
        .collect();
    (text, dropped)
}

/// Anchor reconciler backed by a vision-language provider.
pub struct LegacySemanticAnchor {
    provider: Arc<dyn LLMProvider>,
    max_tokens: usize,
}

impl LegacySemanticAnchor {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            max_tokens: 2048,
        }
    }

    async fn propose(&self, transcript: &str, input: &ReconcileInput<'_>) -> Vec<AnchorProposal> {
        let mut attachments = Vec::with_capacity(input.images.len() + 1);
        if let Some(page) = input.page_png {
            attachments.push(encode::to_image_data(page));
        }
        attachments.extend(input.images.iter().map(|img| encode::to_image_data(&img.bytes)));

        let messages = vec![
            ChatMessage::system(ANCHOR_SYSTEM_PROMPT),
            ChatMessage::user_with_images(anchor_request(transcript, input.images.len()), attachments),
        ];
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let reply = match self.provider.chat(&messages, Some(&options)).await {
            Ok(r) => r.content,
            Err(e) => {
                warn!("Page {}: anchor proposal call failed: {}", input.page_number, e);
                return Vec::new();
            }
        };
        parse_proposals(&reply).unwrap_or_else(|e| {
            warn!("Page {}: unreadable anchor proposals: {}", input.page_number, e);
            Vec::new()
        })
    }
}

#[async_trait]
impl Reconciler for LegacySemanticAnchor {
    fn name(&self) -> &str {
        "legacy_anchor"
    }

    fn needs_page_image(&self) -> bool {
        true
    }

    async fn reconcile(&self, input: ReconcileInput<'_>) -> ReconciliationReport {
        let placeholder_count = count_placeholders(input.raw_markdown);
        let image_count = input.images.len();
        let transcript = cleanup::clean_markdown(&input.raw_markdown.replace(PLACEHOLDER, ""));

        let proposals = if image_count == 0 {
            Vec::new()
        } else {
            self.propose(&transcript, &input).await
        };
        let (final_markdown, dropped) = apply_anchors(&transcript, &proposals, input.images);

        if !dropped.is_empty() {
            warn!(
                "Page {}: {} of {} images dropped (anchor text not found)",
                input.page_number,
                dropped.len(),
                image_count
            );
        }
        let mismatches = placeholder_count.abs_diff(image_count);
        ReconciliationReport {
            page_number: input.page_number,
            placeholder_count,
            image_count,
            substituted: image_count - dropped.len(),
            omitted: dropped.len(),
            mismatches,
            degraded: mismatches > 0 || !dropped.is_empty(),
            final_markdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlobRef;

    fn image(index: usize) -> CroppedImage {
        CroppedImage {
            page_number: 1,
            index,
            bytes: vec![],
            bounds: Default::default(),
            placeholder: false,
            reference: Some(BlobRef::new(format!("mem://i{index}.png"))),
        }
    }

    fn proposal(image: usize, anchor: &str, operation: AnchorOperation) -> AnchorProposal {
        AnchorProposal {
            image,
            anchor_text: anchor.into(),
            operation,
        }
    }

    #[test]
    fn exact_anchor_places_image() {
        let transcript = "Intro.\n\n**Figure 1:** The rig.\n\nOutro.";
        let (text, dropped) = apply_anchors(
            transcript,
            &[proposal(1, "**Figure 1:** The rig.", AnchorOperation::InsertBefore)],
            &[image(1)],
        );
        assert!(dropped.is_empty());
        assert!(text.contains("![page-1-image-1](mem://i1.png)\n\n**Figure 1:** The rig."));
    }

    #[test]
    fn paraphrased_anchor_drops_image() {
        let transcript = "**Figure 1:** The rig.";
        let (text, dropped) = apply_anchors(
            transcript,
            &[proposal(1, "Fig. 1.", AnchorOperation::InsertAfter)],
            &[image(1)],
        );
        assert_eq!(dropped, vec![1]);
        assert_eq!(text, transcript);
    }

    #[test]
    fn replace_and_unnamed_images() {
        let (text, dropped) = apply_anchors(
            "see [chart] below",
            &[proposal(2, "[chart]", AnchorOperation::Replace), proposal(9, "see", AnchorOperation::Replace)],
            &[image(1), image(2)],
        );
        assert_eq!(text, "see ![page-1-image-2](mem://i2.png) below");
        assert_eq!(dropped, vec![1]);
    }

    #[test]
    fn proposals_parse_from_fenced_reply() {
        let reply = "Sure:\n```json\n{\"anchors\": [{\"image\": 1, \"anchor_text\": \"Intro\", \"operation\": \"insert_after\"}]}\n```";
        let parsed = parse_proposals(reply).unwrap();
        assert_eq!(parsed, vec![proposal(1, "Intro", AnchorOperation::InsertAfter)]);
        assert!(parse_proposals("no json here").is_err());
    }
}
