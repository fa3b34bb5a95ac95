//! Gemini (Google) image generation provider.

use crate::error::{
    classify_failure, parse_retry_after, sanitize_error_message, CharsheetError, ErrorCategory,
    Result,
};
use crate::image::provider::{GenerationResult, ImageProvider, ProviderConfig};
use crate::image::types::{GeneratedImage, GenerationRequest, ImageFormat, ImageInput};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Gemini image model variants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GeminiModel {
    /// Gemini 2.5 Flash Image (fast, economical).
    #[default]
    Flash,
    /// Gemini 3 Pro Image preview (higher fidelity, better text rendering).
    ProPreview,
    /// Any other model id, passed through unchanged.
    Custom(String),
}

impl GeminiModel {
    /// Returns the API model identifier.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Flash => "gemini-2.5-flash-image",
            Self::ProPreview => "gemini-3-pro-image-preview",
            Self::Custom(id) => id,
        }
    }

    /// Maps a model id onto a known variant, or keeps it as `Custom`.
    pub fn from_id(id: &str) -> Self {
        match id {
            "gemini-2.5-flash-image" => Self::Flash,
            "gemini-3-pro-image-preview" => Self::ProPreview,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// Builder for GeminiProvider.
#[derive(Debug, Clone)]
pub struct GeminiProviderBuilder {
    api_key: Option<String>,
    model: GeminiModel,
    base_url: String,
    timeout: Duration,
}

impl Default for GeminiProviderBuilder {
    fn default() -> Self {
        Self {
            api_key: None,
            model: GeminiModel::default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl GeminiProviderBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the API key. Falls back to `GEMINI_API_KEY` env var.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the Gemini model variant.
    pub fn model(mut self, model: GeminiModel) -> Self {
        self.model = model;
        self
    }

    /// Overrides the API base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the HTTP timeout for the generation call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the provider, resolving the API key.
    pub fn build(self) -> Result<GeminiProvider> {
        let api_key = self
            .api_key
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .ok_or_else(|| CharsheetError::InvalidProviderConfig {
                provider: "gemini".into(),
                reason: format!("{API_KEY_ENV} not set and no API key provided"),
            })?;

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;

        Ok(GeminiProvider {
            client,
            api_key,
            model: self.model,
            base_url: self.base_url,
        })
    }
}

/// Gemini image generation provider.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: GeminiModel,
    base_url: String,
}

impl GeminiProvider {
    /// Creates a new `GeminiProviderBuilder`.
    pub fn builder() -> GeminiProviderBuilder {
        GeminiProviderBuilder::new()
    }

    /// Builds a provider from registry-resolved configuration.
    pub fn from_config(config: ProviderConfig) -> Result<Self> {
        let mut builder = Self::builder().api_key(config.credential);
        if let Some(model) = config.model_id.as_deref() {
            builder = builder.model(GeminiModel::from_id(model));
        }
        builder.build()
    }

    async fn generate_impl(&self, request: &GenerationRequest) -> Result<GeneratedImage> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url,
            self.model.as_str(),
        );

        let body = GeminiRequest::from_generation_request(request, &self.model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(self.parse_error(status.as_u16(), &text, &headers));
        }

        let gemini_response: GeminiResponse = response.json().await?;
        extract_image(gemini_response)
    }

    fn parse_error(
        &self,
        status: u16,
        text: &str,
        headers: &reqwest::header::HeaderMap,
    ) -> CharsheetError {
        let message = serde_json::from_str::<GeminiErrorResponse>(text)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| text.to_string());
        let message = sanitize_error_message(&message);

        match classify_failure(Some(status), &message) {
            ErrorCategory::RateLimited => CharsheetError::RateLimited {
                retry_after: parse_retry_after(headers).map(Duration::from_secs),
            },
            ErrorCategory::Unauthorized => {
                CharsheetError::Unauthorized(format!("Check {API_KEY_ENV}. {message}"))
            }
            _ if is_safety_block(&message) => CharsheetError::ContentBlocked(message),
            _ => CharsheetError::Api { status, message },
        }
    }
}

#[async_trait]
impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        self.model.as_str()
    }

    fn validate_config(&self) -> bool {
        self.api_key.starts_with("AIza")
    }

    async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        let start = Instant::now();
        let attempt = self.generate_impl(request).await;
        GenerationResult::from_attempt(self.name(), self.model(), start.elapsed(), attempt)
    }
}

/// Prompt text sent alongside the images.
fn augmented_prompt(request: &GenerationRequest) -> String {
    if !request.has_template() {
        return request.prompt.clone();
    }
    format!(
        "{}. The first image (image 1) is the character/avatar to use as the subject. \
         The second image (image 2) is the template structure to follow. \
         Generate the result based on the avatar in image 1, following the exact layout \
         and structure shown in image 2.",
        request.prompt.trim().trim_end_matches('.')
    )
}

fn is_safety_block(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("safety") || lower.contains("blocked") || lower.contains("prohibited")
}

fn extract_image(response: GeminiResponse) -> Result<GeneratedImage> {
    // Prompt blocks come back as HTTP 200.
    if let Some(ref feedback) = response.prompt_feedback {
        if let Some(ref reason) = feedback.block_reason {
            let msg = feedback
                .block_reason_message
                .clone()
                .unwrap_or_else(|| format!("Prompt blocked: {}", reason));
            return Err(CharsheetError::ContentBlocked(msg));
        }
    }

    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        CharsheetError::NoImageReturned("No candidates in Gemini response".into())
    })?;

    if let Some(ref finish_reason) = candidate.finish_reason {
        match finish_reason.as_str() {
            "SAFETY"
            | "IMAGE_SAFETY"
            | "IMAGE_PROHIBITED_CONTENT"
            | "IMAGE_RECITATION"
            | "RECITATION"
            | "PROHIBITED_CONTENT"
            | "BLOCKLIST" => {
                return Err(CharsheetError::ContentBlocked(format!(
                    "Content blocked by Gemini safety filter: {}",
                    finish_reason
                )));
            }
            "IMAGE_OTHER" | "NO_IMAGE" => {
                return Err(CharsheetError::NoImageReturned(format!(
                    "Generation failed: {}. Try a different prompt.",
                    finish_reason
                )));
            }
            _ => {}
        }
    }

    let inline_data = candidate
        .content
        .into_iter()
        .flat_map(|c| c.parts)
        .find_map(|p| p.inline_data)
        .ok_or_else(|| {
            CharsheetError::NoImageReturned("No image data in Gemini response".into())
        })?;

    let data = base64::engine::general_purpose::STANDARD
        .decode(&inline_data.data)
        .map_err(|e| CharsheetError::Decode(e.to_string()))?;

    let format = ImageFormat::from_mime_type(&inline_data.mime_type).unwrap_or_default();
    Ok(GeneratedImage::new(data, format))
}

// Request/Response types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiRequestPart>,
}

/// A part in a Gemini request - can be text or inline image data.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiRequestPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

impl GeminiRequestPart {
    fn image(image: &ImageInput) -> Self {
        Self::InlineData {
            inline_data: GeminiInlineData {
                mime_type: image.mime_type().to_string(),
                data: image.to_base64(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiConfig {
    response_modalities: Vec<String>,
    image_config: GeminiImageConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiImageConfig {
    aspect_ratio: String,
    image_size: String,
}

impl GeminiRequest {
    fn from_generation_request(req: &GenerationRequest, model: &GeminiModel) -> Self {
        let mut parts = vec![
            GeminiRequestPart::Text {
                text: augmented_prompt(req),
            },
            GeminiRequestPart::image(&req.primary_image),
        ];
        if let Some(ref template) = req.template_image {
            parts.push(GeminiRequestPart::image(template));
        }

        // The pro preview model needs explicit modalities and image sizing.
        let generation_config = matches!(model, GeminiModel::ProPreview).then(|| GeminiConfig {
            response_modalities: vec!["TEXT".to_string(), "IMAGE".to_string()],
            image_config: GeminiImageConfig {
                aspect_ratio: "1:1".to_string(),
                image_size: "2K".to_string(),
            },
        });

        Self {
            contents: vec![GeminiContent { parts }],
            generation_config,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContentResponse>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
    #[serde(default)]
    block_reason_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPartResponse {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiErrorBody,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "AIzaTestKey";

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            "Character sheet of a knight",
            ImageInput::new(b"AVATAR".to_vec(), ImageFormat::WebP),
        )
    }

    fn provider(server: &MockServer, model: GeminiModel) -> GeminiProvider {
        GeminiProvider::builder()
            .api_key(KEY)
            .model(model)
            .base_url(server.uri())
            .build()
            .unwrap()
    }

    fn image_response(data: &[u8]) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "here you go" },
                        { "inlineData": {
                            "mimeType": "image/png",
                            "data": base64::engine::general_purpose::STANDARD.encode(data)
                        }}
                    ]
                },
                "finishReason": "STOP"
            }]
        })
    }

    #[test]
    fn test_gemini_model_ids() {
        assert_eq!(GeminiModel::Flash.as_str(), "gemini-2.5-flash-image");
        assert_eq!(GeminiModel::from_id("gemini-3-pro-image-preview"), GeminiModel::ProPreview);
        assert_eq!(GeminiModel::from_id("imagen-x").as_str(), "imagen-x");
        assert_eq!(GeminiModel::default(), GeminiModel::Flash);
    }

    #[test]
    fn test_validate_config_checks_prefix() {
        let good = GeminiProvider::builder().api_key(KEY).build().unwrap();
        assert!(good.validate_config());
        let bad = GeminiProvider::builder().api_key("r8_wrong").build().unwrap();
        assert!(!bad.validate_config());
    }

    #[test]
    fn test_from_config_applies_model() {
        let config = ProviderConfig::new("gemini", KEY).with_model("gemini-3-pro-image-preview");
        let provider = GeminiProvider::from_config(config).unwrap();
        assert_eq!(provider.model(), "gemini-3-pro-image-preview");
        assert_eq!(provider.name(), "gemini");
    }

    #[test]
    fn test_request_without_template() {
        let req = request();
        let body = GeminiRequest::from_generation_request(&req, &GeminiModel::Flash);
        let json = serde_json::to_value(&body).unwrap();

        let parts = json["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "Character sheet of a knight");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/webp");
        assert!(json.get("generationConfig").is_none());
    }

    #[test]
    fn test_request_with_template_augments_prompt() {
        let req = request().with_template(ImageInput::new(b"GRID".to_vec(), ImageFormat::Png));
        let body = GeminiRequest::from_generation_request(&req, &GeminiModel::Flash);
        let json = serde_json::to_value(&body).unwrap();

        let parts = json["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2]["inlineData"]["mimeType"], "image/png");

        let text = parts[0]["text"].as_str().unwrap();
        assert!(text.starts_with("Character sheet of a knight. "));
        assert!(text.contains("image 1) is the character/avatar to use as the subject"));
        assert!(text.contains("image 2) is the template structure to follow"));
        // Deterministic wording.
        assert_eq!(text, augmented_prompt(&req));
    }

    #[test]
    fn test_pro_preview_sends_image_config() {
        let body = GeminiRequest::from_generation_request(&request(), &GeminiModel::ProPreview);
        let json = serde_json::to_value(&body).unwrap();
        let config = &json["generationConfig"];
        assert_eq!(config["responseModalities"], serde_json::json!(["TEXT", "IMAGE"]));
        assert_eq!(config["imageConfig"]["aspectRatio"], "1:1");
        assert_eq!(config["imageConfig"]["imageSize"], "2K");
    }

    #[test]
    fn test_extract_image_prompt_feedback_block() {
        let resp: GeminiResponse = serde_json::from_str(
            r#"{"candidates": [], "promptFeedback": {"blockReason": "SAFETY"}}"#,
        )
        .unwrap();
        let err = extract_image(resp).unwrap_err();
        assert!(matches!(err, CharsheetError::ContentBlocked(_)));
    }

    #[test]
    fn test_extract_image_without_inline_data() {
        let resp: GeminiResponse =
            serde_json::from_str(r#"{"candidates": [{"content": {"parts": [{}]}}]}"#).unwrap();
        let err = extract_image(resp).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NoImageReturned);
    }

    #[test]
    fn test_extract_image_no_image_finish_reason() {
        let resp: GeminiResponse =
            serde_json::from_str(r#"{"candidates": [{"finishReason": "NO_IMAGE"}]}"#).unwrap();
        let err = extract_image(resp).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NoImageReturned);
    }

    #[tokio::test]
    async fn test_generate_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash-image:generateContent"))
            .and(header("x-goog-api-key", KEY))
            .respond_with(ResponseTemplate::new(200).set_body_json(image_response(b"IMG1")))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server, GeminiModel::Flash).generate(&request()).await;
        match result {
            GenerationResult::Success { images, metadata } => {
                assert_eq!(images.len(), 1);
                assert_eq!(images[0].data, b"IMG1");
                assert_eq!(images[0].format, ImageFormat::Png);
                assert_eq!(metadata.provider, "gemini");
                assert_eq!(metadata.model, "gemini-2.5-flash-image");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "30")
                    .set_body_json(serde_json::json!({
                        "error": { "code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED" }
                    })),
            )
            .mount(&server)
            .await;

        let result = provider(&server, GeminiModel::Flash).generate(&request()).await;
        match result {
            GenerationResult::Failure { failure, .. } => {
                assert_eq!(failure.category, ErrorCategory::RateLimited);
                assert!(failure.message.contains("retry after 30s"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_invalid_key_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": 400, "message": "API key not valid. Please pass a valid API key.", "status": "INVALID_ARGUMENT" }
            })))
            .mount(&server)
            .await;

        let result = provider(&server, GeminiModel::Flash).generate(&request()).await;
        match result {
            GenerationResult::Failure { failure, .. } => {
                assert_eq!(failure.category, ErrorCategory::Unauthorized);
                assert!(failure.message.contains("GEMINI_API_KEY"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_server_error_is_generic() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .mount(&server)
            .await;

        let result = provider(&server, GeminiModel::Flash).generate(&request()).await;
        match result {
            GenerationResult::Failure { failure, .. } => {
                assert_eq!(failure.category, ErrorCategory::Generic);
                assert_eq!(failure.message, "API error: 500 - internal");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_quota_message_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": 400, "message": "Quota exceeded for this project", "status": "FAILED_PRECONDITION" }
            })))
            .mount(&server)
            .await;

        let result = provider(&server, GeminiModel::Flash).generate(&request()).await;
        match result {
            GenerationResult::Failure { failure, .. } => {
                assert_eq!(failure.category, ErrorCategory::RateLimited);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_safety_rejection_is_content_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": 400, "message": "Request blocked by safety settings", "status": "INVALID_ARGUMENT" }
            })))
            .mount(&server)
            .await;

        let result = provider(&server, GeminiModel::Flash).generate(&request()).await;
        match result {
            GenerationResult::Failure { failure, .. } => {
                assert_eq!(failure.category, ErrorCategory::Generic);
                assert!(failure.message.starts_with("content blocked:"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
