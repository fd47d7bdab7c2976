use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::llm::media::{ImagePayload, ReferenceImage};
use crate::pipeline::backend::{ImageModel, ImageRequest, LanguageModel};
use crate::pipeline::errors::{BackendError, BackendErrorKind};
use crate::pipeline::types::ModelFamily;
use crate::utils::http::build_http_client;
use crate::utils::timing::log_llm_timing;

const SUBJECT_REFERENCE_NOTE: &str = "Reference Image 1: Use this face/person as the subject.";
const SCENE_REFERENCE_NOTE: &str =
    "Reference Image 2: Use this image as the background/location style.";
const GEMINI_RETRY_BASE_DELAY_MS: u64 = 900;

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub base_url: String,
    pub plan_model: String,
    pub prompt_model: String,
    pub request_timeout: Duration,
    /// Extra attempts after a connection failure. Timeouts are not retried
    /// since the request may already be running upstream.
    pub transport_retries: usize,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
    #[allow(dead_code)]
    Other(Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predictions: Option<Vec<Prediction>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
}

/// Parsed `{"error": {...}}` body of a failed call.
#[derive(Debug, Default, PartialEq, Eq)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
    reasons: Vec<String>,
    summary: String,
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_error_body(body: &str) -> ErrorBody {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return ErrorBody {
            summary: "empty response body".to_string(),
            ..ErrorBody::default()
        };
    }

    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return ErrorBody {
            summary: truncate_for_log(trimmed, 2000),
            ..ErrorBody::default()
        };
    };

    let message = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("message").and_then(|v| v.as_str()))
        .map(|v| v.to_string());
    let status = value
        .pointer("/error/status")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    let reasons = value
        .pointer("/error/details")
        .and_then(|v| v.as_array())
        .map(|details| {
            details
                .iter()
                .filter_map(|detail| detail.get("reason").and_then(|v| v.as_str()))
                .map(|v| v.to_string())
                .collect()
        })
        .unwrap_or_default();

    ErrorBody {
        message,
        status,
        reasons,
        summary: truncate_for_log(&value.to_string(), 2000),
    }
}

/// Decides the failure category from the HTTP status and the error body.
fn classify_failure(status: StatusCode, body: &ErrorBody) -> BackendErrorKind {
    let has_marker = |markers: &[&str]| {
        body.status
            .as_deref()
            .into_iter()
            .chain(body.reasons.iter().map(String::as_str))
            .any(|value| markers.contains(&value))
    };

    if status == StatusCode::TOO_MANY_REQUESTS || has_marker(&["RESOURCE_EXHAUSTED"]) {
        return BackendErrorKind::RateLimited;
    }
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || has_marker(&["PERMISSION_DENIED", "UNAUTHENTICATED", "API_KEY_INVALID"])
    {
        return BackendErrorKind::Unauthorized;
    }
    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        return BackendErrorKind::Transient;
    }
    BackendErrorKind::Fatal
}

fn gemini_should_retry_error(err: &reqwest::Error) -> bool {
    err.is_connect() && !err.is_timeout()
}

fn gemini_retry_delay(attempt: usize) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::from_millis(GEMINI_RETRY_BASE_DELAY_MS.saturating_mul(attempt))
}

fn inline_image_part(image: &ReferenceImage) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type(),
            "data": image.data_base64(),
        }
    })
}

/// Planning payload: instructions first, then every reference image.
fn build_structured_payload(instructions: &str, images: &[&ReferenceImage]) -> Value {
    let mut parts = vec![json!({ "text": instructions })];
    parts.extend(images.iter().map(|image| inline_image_part(image)));
    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": { "responseMimeType": "application/json" },
    })
}

fn build_text_payload(prompt: &str) -> Value {
    json!({
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
    })
}

fn build_conversational_payload(request: &ImageRequest<'_>) -> Value {
    let mut parts = vec![json!({
        "text": format!("{} --aspect_ratio {}", request.prompt, request.aspect_ratio)
    })];
    if let Some(subject) = request.subject {
        parts.push(inline_image_part(subject));
        parts.push(json!({ "text": SUBJECT_REFERENCE_NOTE }));
    }
    if let Some(scene) = request.scene {
        parts.push(inline_image_part(scene));
        parts.push(json!({ "text": SCENE_REFERENCE_NOTE }));
    }
    json!({
        "contents": [{ "role": "user", "parts": parts }],
    })
}

fn build_predict_payload(request: &ImageRequest<'_>) -> Value {
    json!({
        "instances": [{ "prompt": request.prompt, "aspectRatio": request.aspect_ratio }],
        "parameters": { "sampleCount": 1 },
    })
}

fn extract_text_from_response(response: GeminiResponse) -> String {
    let mut text_parts = Vec::new();
    for candidate in response.candidates.unwrap_or_default() {
        if let Some(content) = candidate.content {
            if let Some(parts) = content.parts {
                for part in parts {
                    if let GeminiPart::Text { text } = part {
                        if !text.trim().is_empty() {
                            text_parts.push(text);
                        }
                    }
                }
            }
        }
    }
    text_parts.join("\n")
}

/// First inline image of the response, skipping any text parts before it.
fn extract_first_image(response: GeminiResponse) -> Result<ImagePayload, BackendError> {
    for candidate in response.candidates.unwrap_or_default() {
        let parts = candidate
            .content
            .and_then(|content| content.parts)
            .unwrap_or_default();
        for part in parts {
            if let GeminiPart::InlineData { inline_data } = part {
                if let Some(mime) = inline_data.mime_type.as_deref() {
                    if !mime.starts_with("image/") {
                        continue;
                    }
                }
                let bytes = general_purpose::STANDARD
                    .decode(inline_data.data.as_bytes())
                    .map_err(|err| {
                        BackendError::malformed(format!("Invalid image data in Gemini response: {err}"))
                    })?;
                return Ok(ImagePayload::new(bytes, inline_data.mime_type.as_deref()));
            }
        }
    }
    Err(BackendError::malformed("No image data in Gemini response"))
}

fn extract_prediction(response: PredictResponse) -> Result<ImagePayload, BackendError> {
    let prediction = response
        .predictions
        .unwrap_or_default()
        .into_iter()
        .find(|prediction| prediction.bytes_base64_encoded.is_some())
        .ok_or_else(|| BackendError::malformed("No image data in Imagen response"))?;
    let encoded = prediction.bytes_base64_encoded.unwrap_or_default();
    let bytes = general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|err| BackendError::malformed(format!("Invalid image data in Imagen response: {err}")))?;
    Ok(ImagePayload::new(bytes, prediction.mime_type.as_deref()))
}

/// HTTP client for the Generative Language API.
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    settings: GeminiSettings,
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings) -> Result<Self, BackendError> {
        let http = build_http_client(settings.request_timeout).map_err(|err| {
            BackendError::new(
                BackendErrorKind::Fatal,
                format!("Failed to build HTTP client: {err}"),
            )
        })?;
        Ok(Self { http, settings })
    }

    fn redact(&self, text: &str) -> String {
        let key = self.settings.api_key.trim();
        if key.is_empty() {
            return text.to_string();
        }
        text.replace(key, "[redacted]")
    }

    fn endpoint(&self, model: &str, method: &str) -> Result<Url, BackendError> {
        let base = self.settings.base_url.trim_end_matches('/');
        Url::parse(&format!("{base}/models/{}:{method}", model.trim())).map_err(|err| {
            BackendError::new(
                BackendErrorKind::Fatal,
                format!("Invalid Gemini endpoint for model {model}: {err}"),
            )
        })
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        model: &str,
        method: &str,
        payload: &Value,
    ) -> Result<T, BackendError> {
        let url = self.endpoint(model, method)?;
        let max_attempts = self.settings.transport_retries + 1;

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match self
                .http
                .post(url.clone())
                .header("x-goog-api-key", self.settings.api_key.as_str())
                .json(payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    let err_text = self.redact(&err.to_string());
                    let retryable = gemini_should_retry_error(&err);
                    let should_retry = retryable && attempt < max_attempts;
                    warn!(
                        "Gemini request failed to send: {} (timeout={}, connect={}, retrying={})",
                        err_text,
                        err.is_timeout(),
                        err.is_connect(),
                        should_retry
                    );
                    if should_retry {
                        tokio::time::sleep(gemini_retry_delay(attempt)).await;
                        continue;
                    }
                    let kind = if err.is_timeout() || err.is_connect() || err.is_request() {
                        BackendErrorKind::Transient
                    } else {
                        BackendErrorKind::Fatal
                    };
                    return Err(BackendError::new(
                        kind,
                        format!("Gemini request failed: {err_text}"),
                    ));
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let error_body = summarize_error_body(&body);
                let kind = classify_failure(status, &error_body);
                warn!(
                    "Gemini API error: model={}, status={}, kind={}, body={}",
                    model,
                    status,
                    kind.as_str(),
                    self.redact(&error_body.summary)
                );
                let detail = error_body
                    .message
                    .clone()
                    .unwrap_or_else(|| error_body.summary.clone());
                let marker = error_body
                    .status
                    .as_deref()
                    .map(|value| format!(" [{value}]"))
                    .unwrap_or_default();
                return Err(BackendError::new(
                    kind,
                    format!(
                        "Gemini request failed with status {}{}: {}",
                        status.as_u16(),
                        marker,
                        self.redact(&detail)
                    ),
                )
                .with_status(status.as_u16()));
            }

            let body = response.text().await.map_err(|err| {
                BackendError::new(
                    BackendErrorKind::Transient,
                    format!("Failed to read Gemini response: {}", self.redact(&err.to_string())),
                )
            })?;
            debug!(
                target: "llm.gemini",
                model = model,
                method = method,
                body = %truncate_for_log(&body, 500)
            );
            return serde_json::from_str::<T>(&body).map_err(|err| {
                BackendError::malformed(format!("Unexpected Gemini response shape: {err}"))
            });
        }
    }

    async fn generate_content(
        &self,
        model: &str,
        operation: &str,
        payload: Value,
        metadata: Value,
    ) -> Result<GeminiResponse, BackendError> {
        log_llm_timing("gemini", model, operation, Some(metadata), || async {
            self.post_json::<GeminiResponse>(model, "generateContent", &payload)
                .await
        })
        .await
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate_structured(
        &self,
        instructions: &str,
        images: &[&ReferenceImage],
    ) -> Result<String, BackendError> {
        let model = self.settings.plan_model.as_str();
        let payload = build_structured_payload(instructions, images);
        let response = self
            .generate_content(
                model,
                "plan_photoshoot",
                payload,
                json!({ "images": images.len() }),
            )
            .await?;
        Ok(extract_text_from_response(response))
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, BackendError> {
        let model = self.settings.prompt_model.as_str();
        let response = self
            .generate_content(
                model,
                "enhance_prompt",
                build_text_payload(prompt),
                json!({ "prompt_chars": prompt.len() }),
            )
            .await?;
        Ok(extract_text_from_response(response))
    }
}

#[async_trait]
impl ImageModel for GeminiClient {
    async fn generate_image(&self, request: ImageRequest<'_>) -> Result<ImagePayload, BackendError> {
        let model = request.model.name.as_str();
        let metadata = json!({
            "aspect_ratio": request.aspect_ratio,
            "subject": request.subject.map(ReferenceImage::id),
            "scene": request.scene.map(ReferenceImage::id),
        });
        match request.model.family {
            ModelFamily::Conversational => {
                let payload = build_conversational_payload(&request);
                let response = self
                    .generate_content(model, "generate_image", payload, metadata)
                    .await?;
                extract_first_image(response)
            }
            ModelFamily::TextToImage => {
                let payload = build_predict_payload(&request);
                let response = log_llm_timing("imagen", model, "generate_image", Some(metadata), || async {
                    self.post_json::<PredictResponse>(model, "predict", &payload)
                        .await
                })
                .await?;
                extract_prediction(response)
            }
        }
    }
}
