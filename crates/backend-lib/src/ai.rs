// ============================
// crates/backend-lib/src/ai.rs
// ============================
//! AI submission gate.
//!
//! Sits between the event router and the external vision model: enforces
//! the image bounds without touching the network, throttles per room,
//! applies a hard timeout, sanitizes the model output, and folds every
//! failure into a small user-safe taxonomy. Raw provider error text never
//! reaches clients.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use metrics::counter;
use thiserror::Error;
use tokio::time::timeout;

use crate::config::Settings;
use crate::validation::{self, ValidationError};

/// Errors a model implementation may report.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model quota exhausted")]
    QuotaExceeded,

    #[error("model call failed: {0}")]
    Provider(String),
}

/// The external vision model, reduced to the one call this system makes.
/// Only success, quota exhaustion and generic failure are distinguished.
#[async_trait]
pub trait VisionModel: Send + Sync + 'static {
    async fn generate(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, ModelError>;
}

/// Gemini `generateContent` REST implementation.
pub struct GeminiModel {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: Option<String>,
    max_output_tokens: u32,
    temperature: f32,
}

impl GeminiModel {
    pub fn from_settings(settings: &crate::config::AiSettings) -> Self {
        GeminiModel {
            http: reqwest::Client::new(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            endpoint: settings.endpoint.clone(),
            max_output_tokens: settings.max_output_tokens,
            temperature: settings.temperature,
        }
    }

    fn url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
                self.model, self.api_key
            ),
        }
    }
}

#[async_trait]
impl VisionModel for GeminiModel {
    async fn generate(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, ModelError> {
        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": {
                        "mime_type": mime_type,
                        "data": base64::engine::general_purpose::STANDARD.encode(image),
                    }},
                ],
            }],
            "generationConfig": {
                "maxOutputTokens": self.max_output_tokens,
                "temperature": self.temperature,
            },
        });

        let response = self
            .http
            .post(self.url())
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Provider(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelError::QuotaExceeded);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ModelError::Provider(format!("status {status}: {detail}")));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::Provider(e.to_string()))?;

        let text = payload["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(ModelError::Provider("empty candidate text".to_string()));
        }
        Ok(text)
    }
}

/// User-facing failure taxonomy for submissions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AiFailure {
    #[error("image exceeds the size limit")]
    Oversized,

    #[error("drawing has too little content to analyze")]
    TooSimple,

    #[error("unsupported image format")]
    InvalidFormat,

    #[error("a submission from this room is still cooling down")]
    Cooldown,

    #[error("the model did not answer within the time budget")]
    Timeout,

    #[error("model quota exhausted")]
    Quota,

    #[error("model request failed")]
    Provider,
}

impl AiFailure {
    /// Message broadcast to the room in an `aiError` event.
    pub fn user_message(&self) -> &'static str {
        match self {
            AiFailure::Oversized => "The drawing is too large to process. Try a smaller area.",
            AiFailure::TooSimple => {
                "The drawing looks empty. Sketch the problem first, then submit."
            },
            AiFailure::InvalidFormat => "The submitted image format is not supported.",
            AiFailure::Cooldown => "A submission was just processed. Try again shortly.",
            AiFailure::Timeout => "The AI took too long to answer. Try again.",
            AiFailure::Quota => "The AI service is over its quota right now. Try again later.",
            AiFailure::Provider => "The AI service could not process the drawing. Try again.",
        }
    }
}

/// Rate-limited, time-bounded front for the vision model.
pub struct AiGate<M> {
    model: Arc<M>,
    settings: Arc<Settings>,
    /// room id -> time of the last accepted submission
    cooldowns: DashMap<String, Instant>,
}

impl<M: VisionModel> AiGate<M> {
    pub fn new(model: M, settings: Arc<Settings>) -> Self {
        AiGate {
            model: Arc::new(model),
            settings,
            cooldowns: DashMap::new(),
        }
    }

    /// Run one submission end to end. Ordering matters: bounds checks come
    /// first so an invalid payload costs neither a cooldown slot nor an
    /// external call.
    pub async fn submit(
        &self,
        room_id: &str,
        image_data_uri: &str,
        prompt: Option<&str>,
    ) -> Result<String, AiFailure> {
        let ai = &self.settings.ai;

        let decoded = validation::decode_image_payload(
            image_data_uri,
            ai.max_image_bytes,
            ai.min_image_bytes,
        )
        .map_err(|e| match e {
            ValidationError::ImageTooLarge { .. } => AiFailure::Oversized,
            ValidationError::ImageTooSmall { .. } => AiFailure::TooSimple,
            _ => AiFailure::InvalidFormat,
        })?;

        self.claim_cooldown_slot(room_id)?;

        let prompt = prompt.unwrap_or(&ai.prompt);
        let call = self
            .model
            .generate(prompt, &decoded.bytes, &decoded.mime_type);

        match timeout(Duration::from_secs(ai.timeout_secs), call).await {
            // In-flight work past the deadline is abandoned, not awaited.
            Err(_) => Err(AiFailure::Timeout),
            Ok(Err(ModelError::QuotaExceeded)) => Err(AiFailure::Quota),
            Ok(Err(ModelError::Provider(detail))) => {
                tracing::warn!(room_id, detail, "vision model call failed");
                Err(AiFailure::Provider)
            },
            Ok(Ok(raw)) => Ok(sanitize_response(&raw)),
        }
    }

    /// A submission arriving inside the cooldown window is dropped, not
    /// queued. The slot is claimed at acceptance time so even a failing
    /// call counts against the window.
    fn claim_cooldown_slot(&self, room_id: &str) -> Result<(), AiFailure> {
        let window = Duration::from_secs(self.settings.ai.cooldown_secs);
        let now = Instant::now();

        use dashmap::mapref::entry::Entry;
        match self.cooldowns.entry(room_id.to_string()) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < window {
                    return Err(AiFailure::Cooldown);
                }
                last.insert(now);
            },
            Entry::Vacant(slot) => {
                slot.insert(now);
            },
        }
        Ok(())
    }

    /// Forget a room's cooldown state, called on room teardown.
    pub fn forget_room(&self, room_id: &str) {
        self.cooldowns.remove(room_id);
    }
}

/// Normalize raw model text to the wire format clients expect: no markdown
/// emphasis, no `\boxed{...}` wrappers, Unix line breaks, at most one blank
/// line in a row. Deterministic and idempotent; clean text passes through
/// unchanged.
pub fn sanitize_response(raw: &str) -> String {
    let mut text = raw.replace("\r\n", "\n").replace('\r', "\n");
    text = text.replace("**", "");
    text = unwrap_boxed(&text);
    while text.contains("\n\n\n") {
        text = text.replace("\n\n\n", "\n\n");
    }
    text.trim().to_string()
}

/// Replace every `\boxed{...}` with its brace-balanced inner content.
fn unwrap_boxed(text: &str) -> String {
    const MARKER: &str = "\\boxed{";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(MARKER) {
        out.push_str(&rest[..start]);
        let inner_start = start + MARKER.len();

        let mut depth = 1usize;
        let mut end = None;
        for (offset, ch) in rest[inner_start..].char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(inner_start + offset);
                        break;
                    }
                },
                _ => {},
            }
        }

        match end {
            Some(end) => {
                out.push_str(&rest[inner_start..end]);
                rest = &rest[end + 1..];
            },
            None => {
                // unbalanced marker, keep it verbatim
                out.push_str(&rest[start..]);
                rest = "";
            },
        }
    }
    out.push_str(rest);
    out
}

/// Count a submission failure against the metrics taxonomy.
pub fn record_failure(failure: &AiFailure) {
    counter!(crate::metrics::AI_FAILURE).increment(1);
    tracing::debug!(failure = %failure, "ai submission rejected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Model that records its calls and returns a canned answer.
    struct MockModel {
        calls: AtomicUsize,
        response: &'static str,
    }

    impl MockModel {
        fn new(response: &'static str) -> Self {
            MockModel {
                calls: AtomicUsize::new(0),
                response,
            }
        }
    }

    #[async_trait]
    impl VisionModel for MockModel {
        async fn generate(&self, _: &str, _: &[u8], _: &str) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.to_string())
        }
    }

    struct QuotaModel;

    #[async_trait]
    impl VisionModel for QuotaModel {
        async fn generate(&self, _: &str, _: &[u8], _: &str) -> Result<String, ModelError> {
            Err(ModelError::QuotaExceeded)
        }
    }

    struct SlowModel;

    #[async_trait]
    impl VisionModel for SlowModel {
        async fn generate(&self, _: &str, _: &[u8], _: &str) -> Result<String, ModelError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("never".to_string())
        }
    }

    fn settings(cooldown_secs: u64, timeout_secs: u64) -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.ai.cooldown_secs = cooldown_secs;
        settings.ai.timeout_secs = timeout_secs;
        Arc::new(settings)
    }

    fn image(len: usize) -> String {
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(vec![0x5A_u8; len])
        )
    }

    #[tokio::test]
    async fn test_bounds_rejected_without_model_call() {
        let gate = AiGate::new(MockModel::new("answer"), settings(0, 15));

        // 5 MiB against the 4 MiB default ceiling
        let err = gate
            .submit("r1", &image(5 * 1024 * 1024), None)
            .await
            .unwrap_err();
        assert_eq!(err, AiFailure::Oversized);

        // effectively blank drawing
        let err = gate.submit("r1", &image(16), None).await.unwrap_err();
        assert_eq!(err, AiFailure::TooSimple);

        let err = gate
            .submit("r1", "data:image/tiff;base64,AAAA", None)
            .await
            .unwrap_err();
        assert_eq!(err, AiFailure::InvalidFormat);

        assert_eq!(gate.model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cooldown_drops_rapid_resubmission() {
        let gate = AiGate::new(MockModel::new("answer"), settings(3600, 15));

        let ok = gate.submit("r1", &image(2048), None).await.unwrap();
        assert_eq!(ok, "answer");

        let err = gate.submit("r1", &image(2048), None).await.unwrap_err();
        assert_eq!(err, AiFailure::Cooldown);
        assert_eq!(gate.model.calls.load(Ordering::SeqCst), 1);

        // other rooms are unaffected, no global lock
        let ok = gate.submit("r2", &image(2048), None).await.unwrap();
        assert_eq!(ok, "answer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_the_call() {
        let gate = AiGate::new(SlowModel, settings(0, 15));
        let err = gate.submit("r1", &image(2048), None).await.unwrap_err();
        assert_eq!(err, AiFailure::Timeout);
    }

    #[tokio::test]
    async fn test_quota_maps_to_user_taxonomy() {
        let gate = AiGate::new(QuotaModel, settings(0, 15));
        let err = gate.submit("r1", &image(2048), None).await.unwrap_err();
        assert_eq!(err, AiFailure::Quota);
        assert!(err.user_message().contains("quota"));
    }

    #[tokio::test]
    async fn test_successful_submission_is_sanitized() {
        let gate = AiGate::new(
            MockModel::new("**Step 1**: add.\r\n\r\n\r\nAnswer: \\boxed{42}"),
            settings(0, 15),
        );
        let answer = gate.submit("r1", &image(2048), None).await.unwrap();
        assert_eq!(answer, "Step 1: add.\n\nAnswer: 42");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let raw = "**Bold** and \\boxed{x + 1}\r\nnext\n\n\n\nline";
        let once = sanitize_response(raw);
        let twice = sanitize_response(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "Bold and x + 1\nnext\n\nline");
    }

    #[test]
    fn test_unwrap_boxed_handles_nesting_and_imbalance() {
        assert_eq!(unwrap_boxed("\\boxed{a{b}c}"), "a{b}c");
        assert_eq!(unwrap_boxed("x \\boxed{1} y \\boxed{2}"), "x 1 y 2");
        // unbalanced stays verbatim
        assert_eq!(unwrap_boxed("\\boxed{open"), "\\boxed{open");
        assert_eq!(unwrap_boxed("plain"), "plain");
    }
}
