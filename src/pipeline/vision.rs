//! Grounding OCR through a vision-language model.
//!
//! DeepSeek-OCR style models return Markdown interleaved with grounding
//! tags:
//!
//! ```text
//! <|ref|>title<|/ref|><|det|>[[120, 40, 880, 90]]<|/det|>
//! # Results
//! <|ref|>image<|/ref|><|det|>[[100, 200, 500, 600]]<|/det|>
//! ```
//!
//! [`parse_grounding`] turns every image tag into one [`PLACEHOLDER`] per box
//! (in reading order) and drops every other tag, producing exactly the
//! `{markdown, regions}` shape the HTTP OCR service returns.

use crate::error::Ocr2MdError;
use crate::geometry::RegionBox;
use crate::pipeline::encode;
use crate::pipeline::ocr::{OcrBackend, OcrError, OcrMode, OcrRequest, RawRecognition, PLACEHOLDER};
use crate::prompts::{FREE_OCR_PROMPT, GROUNDING_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Default model when only a provider name is given.
pub const DEFAULT_VISION_MODEL: &str = "gpt-4.1-nano";

static RE_GROUNDING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<\|ref\|>(.*?)<\|/ref\|>\s*<\|det\|>(.*?)<\|/det\|>").unwrap());

static RE_BOX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\s*(-?[\d.]+)\s*,\s*(-?[\d.]+)\s*,\s*(-?[\d.]+)\s*,\s*(-?[\d.]+)\s*\]").unwrap()
});

/// Labels whose regions are cropped out as images.
const IMAGE_LABELS: &[&str] = &["image", "figure"];

/// Split grounding-tagged model output into placeholder Markdown and boxes.
pub fn parse_grounding(output: &str) -> RawRecognition {
    let mut regions = Vec::new();
    let markdown = RE_GROUNDING
        .replace_all(output, |caps: &regex::Captures<'_>| {
            let label = caps[1].trim().to_ascii_lowercase();
            if !IMAGE_LABELS.contains(&label.as_str()) {
                return String::new();
            }
            let boxes = parse_boxes(&caps[2]);
            let tokens = vec![PLACEHOLDER; boxes.len()].join("\n\n");
            regions.extend(boxes);
            tokens
        })
        .into_owned();

    RawRecognition { markdown, regions }
}

fn parse_boxes(det: &str) -> Vec<RegionBox> {
    RE_BOX
        .captures_iter(det)
        .filter_map(|c| {
            let n = |i: usize| c[i].parse::<f64>().ok();
            Some(RegionBox::new(n(1)?, n(2)?, n(3)?, n(4)?))
        })
        .collect()
}

/// OCR backend that drives a grounding-capable vision model.
pub struct VisionOcrBackend {
    provider: Arc<dyn LLMProvider>,
    max_tokens: usize,
}

impl VisionOcrBackend {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            max_tokens: 8192,
        }
    }

    pub fn with_max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n;
        self
    }
}

#[async_trait]
impl OcrBackend for VisionOcrBackend {
    fn name(&self) -> &str {
        "vision"
    }

    async fn recognize(&self, request: OcrRequest) -> Result<RawRecognition, OcrError> {
        let prompt = match request.mode {
            OcrMode::Grounding => GROUNDING_PROMPT,
            OcrMode::Free => FREE_OCR_PROMPT,
        };
        let messages = vec![ChatMessage::user_with_images(
            prompt,
            vec![encode::to_image_data(&request.png)],
        )];
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        // Provider errors carry no status; all of them count as transient.
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| OcrError::Transient(e.to_string()))?;

        debug!(
            "Page {}: vision OCR used {} input / {} output tokens",
            request.page_number, response.prompt_tokens, response.completion_tokens
        );
        Ok(parse_grounding(&response.content))
    }
}

/// Resolve a vision provider, from most- to least-specific:
///
/// 1. explicit provider name (+ model, default [`DEFAULT_VISION_MODEL`]);
/// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set;
/// 3. auto-detection from API key variables.
pub fn resolve_provider(
    provider_name: Option<&str>,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, Ocr2MdError> {
    if let Some(name) = provider_name {
        return create_provider(name, model.unwrap_or(DEFAULT_VISION_MODEL));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, model.unwrap_or(&env_model));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Ocr2MdError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision provider could be auto-detected from environment.\n\
                 Set OPENAI_API_KEY or another provider key, or pass --ocr-endpoint.\n\
                 Error: {e}"
            ),
        })?;
    Ok(llm_provider)
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Ocr2MdError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| Ocr2MdError::ProviderNotConfigured {
        provider: name.to_string(),
        hint: format!("{e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ocr::{count_placeholders, verify};

    #[test]
    fn image_tags_become_placeholders_in_order() {
        let output = "<|ref|>title<|/ref|><|det|>[[120, 40, 880, 90]]<|/det|>\n# Results\n\
                      <|ref|>image<|/ref|><|det|>[[100, 200, 500, 600]]<|/det|>\n\
                      Body text.\n\
                      <|ref|>image<|/ref|><|det|>[[10, 700, 300, 900]]<|/det|>\n";
        let raw = parse_grounding(output);

        assert!(raw.markdown.contains("# Results"));
        assert!(!raw.markdown.contains("<|ref|>"));
        assert!(!raw.markdown.contains("<|det|>"));
        assert_eq!(count_placeholders(&raw.markdown), 2);
        assert_eq!(raw.regions[0].coords(), [100.0, 200.0, 500.0, 600.0]);
        assert_eq!(raw.regions[1].coords(), [10.0, 700.0, 300.0, 900.0]);
        assert!(verify(raw).is_ok());
    }

    #[test]
    fn one_tag_with_several_boxes_yields_several_placeholders() {
        let raw = parse_grounding("<|ref|>figure<|/ref|><|det|>[[1,2,3,4], [5,6,7,8]]<|/det|>");
        assert_eq!(raw.regions.len(), 2);
        assert_eq!(count_placeholders(&raw.markdown), 2);
    }

    #[test]
    fn untagged_text_passes_through() {
        let raw = parse_grounding("Plain transcript without figures.");
        assert_eq!(raw.markdown, "Plain transcript without figures.");
        assert!(raw.regions.is_empty());
    }
}
