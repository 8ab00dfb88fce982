//! HTTP OCR backend.
//!
//! Wire format:
//!
//! ```text
//! POST {endpoint}
//! { "image": "<base64 png>", "mode": "grounding", "page": 3 }
//!
//! 200 OK
//! { "markdown": "... <|image|> ...", "regions": [[x1,y1,x2,y2], ...] }
//! ```
//!
//! Region coordinates are on the `[0, 999]` grid.

use crate::pipeline::encode;
use crate::pipeline::ocr::{OcrBackend, OcrError, OcrMode, OcrRequest, RawRecognition};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::warn;

#[derive(Serialize)]
struct OcrRequestBody<'a> {
    image: String,
    mode: OcrMode,
    page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

/// OCR service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpOcrBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
}

impl HttpOcrBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: None,
            model: None,
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Model name forwarded to services that host several.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// 429 and 5xx are worth retrying; any other non-success status is not.
pub fn classify_status(status: StatusCode, body: &str) -> OcrError {
    let detail = format!("HTTP {status}: {}", truncate(body, 200));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        OcrError::Transient(detail)
    } else {
        OcrError::Rejected(detail)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl OcrBackend for HttpOcrBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn recognize(&self, request: OcrRequest) -> Result<RawRecognition, OcrError> {
        let body = OcrRequestBody {
            image: encode::to_base64(&request.png),
            mode: request.mode,
            page: request.page_number,
            model: self.model.as_deref(),
        };

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| OcrError::Transient(format!("request to {} failed: {e}", self.endpoint)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OcrError::Transient(format!("reading response body: {e}")))?;

        if !status.is_success() {
            let err = classify_status(status, &text);
            warn!("Page {}: OCR service answered {}", request.page_number, status);
            return Err(err);
        }

        serde_json::from_str::<RawRecognition>(&text)
            .map_err(|e| OcrError::Inconsistent(format!("malformed OCR response: {e}")))
    }
}
