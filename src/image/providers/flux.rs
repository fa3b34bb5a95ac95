//! Flux (Black Forest Labs) image generation provider, served through Replicate.

use crate::error::{
    classify_failure, parse_retry_after, sanitize_error_message, CharsheetError, ErrorCategory,
    Result,
};
use crate::image::provider::{GenerationResult, ImageProvider, ProviderConfig};
use crate::image::types::{GeneratedImage, GenerationRequest, ImageFormat, ImageInput};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const DEFAULT_BASE_URL: &str = "https://api.replicate.com";
const API_KEY_ENV: &str = "FLUX_API_KEY";
const API_KEY_ALIAS_ENV: &str = "REPLICATE_API_TOKEN";

/// Kontext model that accepts a subject image plus a layout image.
const MULTI_IMAGE_MODEL: &str = "flux-kontext-apps/multi-image-kontext-pro";

/// Flux model variants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FluxModel {
    /// Flux Kontext Pro, image-to-image editing.
    #[default]
    KontextPro,
    /// Flux Kontext Max, highest quality editing.
    KontextMax,
    /// Flux Schnell, fast text-to-image.
    Schnell,
    /// Any other Replicate `owner/name` model, passed through unchanged.
    Custom(String),
}

impl FluxModel {
    /// Returns the Replicate model identifier.
    pub fn as_str(&self) -> &str {
        match self {
            Self::KontextPro => "black-forest-labs/flux-kontext-pro",
            Self::KontextMax => "black-forest-labs/flux-kontext-max",
            Self::Schnell => "black-forest-labs/flux-schnell",
            Self::Custom(id) => id,
        }
    }

    /// Maps a model id onto a known variant, or keeps it as `Custom`.
    pub fn from_id(id: &str) -> Self {
        match id {
            "black-forest-labs/flux-kontext-pro" | "flux-kontext-pro" => Self::KontextPro,
            "black-forest-labs/flux-kontext-max" | "flux-kontext-max" => Self::KontextMax,
            "black-forest-labs/flux-schnell" | "flux-schnell" => Self::Schnell,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// Builder for FluxProvider.
#[derive(Debug, Clone)]
pub struct FluxProviderBuilder {
    api_key: Option<String>,
    model: FluxModel,
    base_url: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for FluxProviderBuilder {
    fn default() -> Self {
        Self {
            api_key: None,
            model: FluxModel::default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(120),
        }
    }
}

impl FluxProviderBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the API token. Falls back to `FLUX_API_KEY`, then `REPLICATE_API_TOKEN`.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the Flux model variant.
    pub fn model(mut self, model: FluxModel) -> Self {
        self.model = model;
        self
    }

    /// Overrides the API base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets how often a pending prediction is polled.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the maximum time to wait for a prediction.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the provider, resolving the API token.
    pub fn build(self) -> Result<FluxProvider> {
        let api_key = self
            .api_key
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .or_else(|| std::env::var(API_KEY_ALIAS_ENV).ok())
            .ok_or_else(|| CharsheetError::InvalidProviderConfig {
                provider: "flux".into(),
                reason: format!(
                    "{API_KEY_ENV} (or {API_KEY_ALIAS_ENV}) not set and no API key provided"
                ),
            })?;

        // Leave headroom over the 60s synchronous wait.
        let client = reqwest::Client::builder()
            .timeout(self.timeout.max(Duration::from_secs(90)))
            .build()?;

        Ok(FluxProvider {
            client,
            api_key,
            model: self.model,
            base_url: self.base_url,
            poll_interval: self.poll_interval,
            timeout: self.timeout,
        })
    }
}

/// Flux image generation provider.
pub struct FluxProvider {
    client: reqwest::Client,
    api_key: String,
    model: FluxModel,
    base_url: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl FluxProvider {
    /// Creates a new `FluxProviderBuilder`.
    pub fn builder() -> FluxProviderBuilder {
        FluxProviderBuilder::new()
    }

    /// Builds a provider from registry-resolved configuration.
    pub fn from_config(config: ProviderConfig) -> Result<Self> {
        let mut builder = Self::builder().api_key(config.credential);
        if let Some(model) = config.model_id.as_deref() {
            builder = builder.model(FluxModel::from_id(model));
        }
        builder.build()
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<Prediction> {
        // A template needs the two-image Kontext model regardless of the configured one.
        let model = if request.has_template() {
            MULTI_IMAGE_MODEL
        } else {
            self.model.as_str()
        };
        let url = format!("{}/v1/models/{}/predictions", self.base_url, model);

        let body = FluxRequest::from_generation_request(request);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Prefer", "wait")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(self.parse_error(status.as_u16(), &text, &headers));
        }

        let prediction: Prediction = response.json().await?;
        tracing::debug!(prediction_id = %prediction.id, model, status = %prediction.status, "submitted prediction");
        Ok(prediction)
    }

    async fn poll_until_ready(&self, mut prediction: Prediction) -> Result<Prediction> {
        let start = Instant::now();

        loop {
            match prediction.status.as_str() {
                "succeeded" => return Ok(prediction),
                "failed" => {
                    let message = prediction
                        .error
                        .as_deref()
                        .map(sanitize_error_message)
                        .unwrap_or_else(|| "Unknown error".into());
                    return Err(failure_from_message(message));
                }
                "canceled" => {
                    return Err(CharsheetError::Api {
                        status: 500,
                        message: "Prediction was canceled".into(),
                    });
                }
                _ => {}
            }

            if start.elapsed() > self.timeout {
                return Err(CharsheetError::Timeout(self.timeout));
            }
            tokio::time::sleep(self.poll_interval).await;

            let url = prediction.urls.get.clone().unwrap_or_else(|| {
                format!("{}/v1/predictions/{}", self.base_url, prediction.id)
            });
            let response = self.client.get(&url).bearer_auth(&self.api_key).send().await?;

            let status = response.status();
            if !status.is_success() {
                let headers = response.headers().clone();
                let text = response.text().await.unwrap_or_default();
                return Err(self.parse_error(status.as_u16(), &text, &headers));
            }
            prediction = response.json().await?;
        }
    }

    async fn download(&self, output: &str) -> Result<GeneratedImage> {
        if output.starts_with("data:") {
            let image = ImageInput::from_base64(output, None)?;
            return Ok(GeneratedImage::new(image.data().to_vec(), image.format()));
        }

        let response = self.client.get(output).send().await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = if status == 403 || status == 410 {
                "Generated image URL expired before download"
            } else {
                "Failed to download generated image"
            };
            return Err(CharsheetError::Api {
                status,
                message: message.into(),
            });
        }

        let fallback = output
            .rsplit('.')
            .next()
            .and_then(ImageFormat::from_extension)
            .unwrap_or(ImageFormat::Png);
        let data = response.bytes().await?.to_vec();
        Ok(GeneratedImage::detect(data, fallback))
    }

    async fn generate_impl(&self, request: &GenerationRequest) -> Result<GeneratedImage> {
        let prediction = self.submit(request).await?;
        let prediction = self.poll_until_ready(prediction).await?;

        let output = first_output(prediction.output.as_ref()).ok_or_else(|| {
            CharsheetError::NoImageReturned("No image data in Replicate response".into())
        })?;
        let shown: String = output.chars().take(80).collect();
        tracing::debug!(output = %shown, "prediction complete");

        self.download(&output).await
    }

    fn parse_error(
        &self,
        status: u16,
        text: &str,
        headers: &reqwest::header::HeaderMap,
    ) -> CharsheetError {
        let message = serde_json::from_str::<ReplicateErrorResponse>(text)
            .map(|e| e.detail)
            .unwrap_or_else(|_| text.to_string());
        let message = sanitize_error_message(&message);

        match classify_failure(Some(status), &message) {
            ErrorCategory::RateLimited => CharsheetError::RateLimited {
                retry_after: parse_retry_after(headers).map(Duration::from_secs),
            },
            ErrorCategory::Unauthorized => CharsheetError::Unauthorized(format!(
                "Check {API_KEY_ENV} or {API_KEY_ALIAS_ENV}. {message}"
            )),
            _ => CharsheetError::Api { status, message },
        }
    }
}

#[async_trait]
impl ImageProvider for FluxProvider {
    fn name(&self) -> &str {
        "flux"
    }

    fn model(&self) -> &str {
        self.model.as_str()
    }

    fn validate_config(&self) -> bool {
        // Replicate API tokens start with "r8_".
        self.api_key.starts_with("r8_")
    }

    async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        let start = Instant::now();
        let attempt = self.generate_impl(request).await;
        GenerationResult::from_attempt(self.name(), self.model(), start.elapsed(), attempt)
    }
}

/// Maps a prediction's error text onto an error variant.
fn failure_from_message(message: String) -> CharsheetError {
    match classify_failure(None, &message) {
        ErrorCategory::RateLimited => CharsheetError::RateLimited { retry_after: None },
        ErrorCategory::Unauthorized => CharsheetError::Unauthorized(message),
        ErrorCategory::NoImageReturned => CharsheetError::NoImageReturned(message),
        _ => CharsheetError::Api {
            status: 500,
            message,
        },
    }
}

/// Replicate returns either a single output or a list; only the first is used.
fn first_output(output: Option<&serde_json::Value>) -> Option<String> {
    match output? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Array(items) => items
            .iter()
            .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
            .map(str::to_string),
        _ => None,
    }
}

fn augmented_prompt(request: &GenerationRequest) -> String {
    if !request.has_template() {
        return request.prompt.clone();
    }
    format!(
        "{}. Use image 1 as the subject: keep the character's appearance and details. \
         Follow the structural layout of image 2: present the character in that exact \
         character sheet layout and structure.",
        request.prompt.trim().trim_end_matches('.')
    )
}

#[derive(Debug, Serialize)]
struct FluxRequest {
    input: FluxInput,
}

#[derive(Debug, Serialize)]
struct FluxInput {
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_image_1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_image_2: Option<String>,
    output_format: &'static str,
}

impl FluxRequest {
    fn from_generation_request(req: &GenerationRequest) -> Self {
        let primary = req.primary_image.to_data_uri();
        let input = match &req.template_image {
            Some(template) => FluxInput {
                prompt: augmented_prompt(req),
                input_image: None,
                input_image_1: Some(primary),
                input_image_2: Some(template.to_data_uri()),
                output_format: "png",
            },
            None => FluxInput {
                prompt: augmented_prompt(req),
                input_image: Some(primary),
                input_image_1: None,
                input_image_2: None,
                output_format: "png",
            },
        };
        Self { input }
    }
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    urls: PredictionUrls,
}

#[derive(Debug, Default, Deserialize)]
struct PredictionUrls {
    #[serde(default)]
    get: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReplicateErrorResponse {
    detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "r8_test_token";
    const PNG_BYTES: [u8; 12] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3, 4];

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            "Character sheet of a knight",
            ImageInput::new(b"AVATAR".to_vec(), ImageFormat::WebP),
        )
    }

    fn provider(server: &MockServer) -> FluxProvider {
        FluxProvider::builder()
            .api_key(KEY)
            .base_url(server.uri())
            .poll_interval(Duration::from_millis(10))
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn failure(result: GenerationResult) -> crate::image::provider::ProviderFailure {
        match result {
            GenerationResult::Failure { failure, .. } => failure,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_flux_model_ids() {
        assert_eq!(FluxModel::default().as_str(), "black-forest-labs/flux-kontext-pro");
        assert_eq!(FluxModel::from_id("flux-schnell"), FluxModel::Schnell);
        assert_eq!(FluxModel::from_id("acme/custom").as_str(), "acme/custom");
    }

    #[test]
    fn test_validate_config_checks_prefix() {
        assert!(FluxProvider::builder().api_key(KEY).build().unwrap().validate_config());
        assert!(!FluxProvider::builder()
            .api_key("AIzaWrongProvider")
            .build()
            .unwrap()
            .validate_config());
    }

    #[test]
    fn test_request_without_template() {
        let body = FluxRequest::from_generation_request(&request());
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["input"]["prompt"], "Character sheet of a knight");
        assert_eq!(json["input"]["input_image"], "data:image/webp;base64,QVZBVEFS");
        assert!(json["input"].get("input_image_2").is_none());
    }

    #[test]
    fn test_request_with_template_augments_prompt() {
        let req = request().with_template(ImageInput::new(b"GRID".to_vec(), ImageFormat::Png));
        let body = FluxRequest::from_generation_request(&req);
        let json = serde_json::to_value(&body).unwrap();

        assert!(json["input"].get("input_image").is_none());
        assert_eq!(json["input"]["input_image_1"], "data:image/webp;base64,QVZBVEFS");
        assert_eq!(json["input"]["input_image_2"], "data:image/png;base64,R1JJRA==");

        let prompt = json["input"]["prompt"].as_str().unwrap();
        assert!(prompt.contains("Use image 1 as the subject"));
        assert!(prompt.contains("Follow the structural layout of image 2"));
    }

    #[test]
    fn test_first_output_shapes() {
        assert_eq!(first_output(Some(&json!("https://x/a.png"))).as_deref(), Some("https://x/a.png"));
        assert_eq!(
            first_output(Some(&json!(["https://x/1.png", "https://x/2.png"]))).as_deref(),
            Some("https://x/1.png")
        );
        assert_eq!(first_output(Some(&json!([]))), None);
        assert_eq!(first_output(Some(&json!(null))), None);
        assert_eq!(first_output(None), None);
    }

    #[test]
    fn test_failure_from_message_is_deterministic() {
        for _ in 0..2 {
            assert!(matches!(
                failure_from_message("rate limit reached".into()),
                CharsheetError::RateLimited { .. }
            ));
            assert!(matches!(
                failure_from_message("authentication failed".into()),
                CharsheetError::Unauthorized(_)
            ));
            assert!(matches!(
                failure_from_message("CUDA out of memory".into()),
                CharsheetError::Api { status: 500, .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_generate_polls_then_downloads() {
        let server = MockServer::start().await;
        let uri = server.uri();

        Mock::given(method("POST"))
            .and(path("/v1/models/black-forest-labs/flux-kontext-pro/predictions"))
            .and(header("authorization", format!("Bearer {KEY}").as_str()))
            .and(header("prefer", "wait"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "p1",
                "status": "processing",
                "output": null,
                "urls": { "get": format!("{uri}/v1/predictions/p1") }
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "p1",
                "status": "succeeded",
                "output": [format!("{uri}/files/out.png")],
                "urls": { "get": format!("{uri}/v1/predictions/p1") }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/files/out.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG_BYTES.to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        match provider(&server).generate(&request()).await {
            GenerationResult::Success { images, metadata } => {
                assert_eq!(images.len(), 1);
                assert_eq!(images[0].data, PNG_BYTES.to_vec());
                assert_eq!(images[0].format, ImageFormat::Png);
                assert_eq!(metadata.provider, "flux");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_template_uses_multi_image_model() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/models/flux-kontext-apps/multi-image-kontext-pro/predictions"))
            .and(body_partial_json(json!({
                "input": { "input_image_2": "data:image/png;base64,R1JJRA==" }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "p2",
                "status": "succeeded",
                "output": "data:image/png;base64,SU1HMQ=="
            })))
            .expect(1)
            .mount(&server)
            .await;

        let req = request().with_template(ImageInput::new(b"GRID".to_vec(), ImageFormat::Png));
        match provider(&server).generate(&req).await {
            GenerationResult::Success { images, .. } => assert_eq!(images[0].data, b"IMG1"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_succeeded_without_output_is_no_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "p3", "status": "succeeded", "output": []
            })))
            .mount(&server)
            .await;

        let failure = failure(provider(&server).generate(&request()).await);
        assert_eq!(failure.category, ErrorCategory::NoImageReturned);
    }

    #[tokio::test]
    async fn test_failed_prediction_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "p4", "status": "failed", "error": "You have hit the rate limit"
            })))
            .mount(&server)
            .await;

        let failure = failure(provider(&server).generate(&request()).await);
        assert_eq!(failure.category, ErrorCategory::RateLimited);
    }

    #[tokio::test]
    async fn test_unauthorized_create() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "title": "Unauthenticated",
                "detail": "You did not pass a valid authentication token",
                "status": 401
            })))
            .mount(&server)
            .await;

        let failure = failure(provider(&server).generate(&request()).await);
        assert_eq!(failure.category, ErrorCategory::Unauthorized);
        assert!(failure.message.contains("REPLICATE_API_TOKEN"));
    }

    #[tokio::test]
    async fn test_expired_download_url() {
        let server = MockServer::start().await;
        let uri = server.uri();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "p5", "status": "succeeded", "output": [format!("{uri}/files/gone.png")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/gone.png"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let failure = failure(provider(&server).generate(&request()).await);
        assert_eq!(failure.category, ErrorCategory::Generic);
        assert!(failure.message.contains("expired"));
    }
}
