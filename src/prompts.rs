//! Prompts sent to vision-language models.
//!
//! Two consumers: the grounding OCR backend ([`crate::pipeline::vision`]) and
//! the superseded anchor reconciler ([`crate::reconcile::legacy`]).

/// Grounding prompt for DeepSeek-OCR style models. The model answers with
/// Markdown interleaved with `<|ref|>label<|/ref|><|det|>[[x1,y1,x2,y2]]<|/det|>`
/// tags on the `[0, 999]` grid.
pub const GROUNDING_PROMPT: &str = "<image>\n<|grounding|>Convert the document to markdown.";

/// Plain transcription prompt, no region tags.
pub const FREE_OCR_PROMPT: &str = "<image>\nFree OCR.";

/// System prompt for the legacy anchor proposal call.
pub const ANCHOR_SYSTEM_PROMPT: &str = r#"You place figures into a document transcript.

You receive the transcript of a scanned page, the full page image, and a numbered list of figure crops.
For every figure, choose a short passage of the transcript next to which the figure belongs.

Answer with JSON only, no commentary:
{"anchors": [{"image": 1, "anchor_text": "...", "operation": "insert_after"}]}

Rules:
- "image" is the 1-based figure number.
- "anchor_text" must be copied verbatim from the transcript.
- "operation" is one of "replace", "insert_before", "insert_after"."#;

/// User message of the legacy anchor call.
pub fn anchor_request(transcript: &str, image_count: usize) -> String {
    format!(
        "Transcript:\n\"\"\"\n{transcript}\n\"\"\"\n\nFigures on this page: {image_count}. \
         The first attached image is the full page; the following ones are figures 1..{image_count}."
    )
}
