//! JSON shapes exchanged with an HTTP endpoint layer.
//!
//! An endpoint parses a [`GenerateRequestBody`], hands it to [`respond`],
//! and writes the returned body with [`PayloadResponse::status_code`].

use crate::error::{CharsheetError, Result};
use crate::image::{GenerationRequest, ImageInput};
use crate::orchestrator::{
    GenerationOutcome, InvocationReport, InvocationResultSet, Orchestrator, OutcomeStatus,
    ProviderSelection,
};
use crate::projection::global_banner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Incoming generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequestBody {
    /// Prompt text.
    #[serde(default)]
    pub prompt_text: String,
    /// Avatar image, base64 or a data URI.
    #[serde(default)]
    pub primary_image_base64: String,
    /// Avatar MIME type; detected when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_mime_type: Option<String>,
    /// Optional layout template image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_image_base64: Option<String>,
    /// Template MIME type; detected when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_mime_type: Option<String>,
    /// Requested selections, in display order.
    #[serde(default)]
    pub selections: Vec<SelectionBody>,
}

/// One requested (provider, model) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionBody {
    /// Provider id.
    pub provider_id: String,
    /// Model id.
    pub model_id: String,
    /// Display label; defaults to the model id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl GenerateRequestBody {
    /// Parses a body from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Validates the body and splits it into a request and its selections.
    ///
    /// Selection ids are `provider:model`; repeats get a `#n` suffix.
    pub fn into_parts(self) -> Result<(GenerationRequest, Vec<ProviderSelection>)> {
        let mut missing = Vec::new();
        if self.prompt_text.trim().is_empty() {
            missing.push("promptText");
        }
        if self.primary_image_base64.trim().is_empty() {
            missing.push("primaryImageBase64");
        }
        if self.selections.is_empty() {
            missing.push("selections");
        }
        if !missing.is_empty() {
            return Err(CharsheetError::Validation(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }

        let primary =
            ImageInput::from_base64(&self.primary_image_base64, self.primary_mime_type.as_deref())?;
        let mut request = GenerationRequest::new(self.prompt_text, primary);
        if let Some(template) = self.template_image_base64.filter(|t| !t.trim().is_empty()) {
            request = request.with_template(ImageInput::from_base64(
                &template,
                self.template_mime_type.as_deref(),
            )?);
        }
        request.validate()?;

        let mut seen: HashMap<String, usize> = HashMap::new();
        let selections = self
            .selections
            .into_iter()
            .map(|s| {
                let base = format!("{}:{}", s.provider_id, s.model_id);
                let count = seen.entry(base.clone()).or_insert(0);
                *count += 1;
                let id = if *count == 1 {
                    base
                } else {
                    format!("{base}#{count}")
                };
                let label = s.label.unwrap_or_else(|| s.model_id.clone());
                ProviderSelection::new(id, s.provider_id, s.model_id).with_label(label)
            })
            .collect();

        Ok((request, selections))
    }
}

/// Metadata echoed on single-provider responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    /// Provider id.
    pub provider: String,
    /// Model id.
    pub model: String,
    /// Completion time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    /// Selection duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Response for a request with exactly one selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleGenerationResponse {
    /// True when an image was produced.
    pub success: bool,
    /// Base64 image bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
    /// MIME type of `image_data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider and timing details, absent for rejected bodies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
    #[serde(skip)]
    status: u16,
}

impl SingleGenerationResponse {
    /// Builds the response for a settled outcome.
    pub fn from_outcome(outcome: &GenerationOutcome) -> Self {
        let metadata = Some(ResponseMetadata {
            provider: outcome.provider_id.clone(),
            model: outcome.model_id.clone(),
            generated_at: outcome.completed_at,
            duration_ms: outcome.duration_ms,
        });
        match &outcome.status {
            OutcomeStatus::Success { images } if !images.is_empty() => Self {
                success: true,
                image_data: Some(images[0].to_base64()),
                mime_type: Some(images[0].format.mime_type().to_string()),
                error: None,
                metadata,
                status: 200,
            },
            OutcomeStatus::Failure { error } => Self {
                success: false,
                image_data: None,
                mime_type: None,
                error: Some(error.message.clone()),
                metadata,
                status: 500,
            },
            _ => Self {
                success: false,
                image_data: None,
                mime_type: None,
                error: Some("Generation failed".into()),
                metadata,
                status: 500,
            },
        }
    }

    /// Builds the response for an error raised before any outcome existed.
    pub fn from_error(err: &CharsheetError) -> Self {
        Self {
            success: false,
            image_data: None,
            mime_type: None,
            error: Some(err.to_string()),
            metadata: None,
            status: status_for(err),
        }
    }

    /// HTTP status the endpoint should answer with.
    pub fn status_code(&self) -> u16 {
        self.status
    }
}

/// Response for a request with several selections.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    /// False only when every selection failed.
    pub success: bool,
    /// Invocation id.
    pub invocation_id: Uuid,
    /// Every outcome, in selection order.
    pub results: InvocationResultSet,
    /// Invocation-level error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Global banner text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<&'static str>,
}

impl InvocationResponse {
    /// Builds the response for a settled invocation.
    pub fn from_report(report: &InvocationReport) -> Self {
        Self {
            success: report.error.is_none(),
            invocation_id: report.invocation_id,
            results: report.results.clone(),
            error: report.error.as_ref().map(ToString::to_string),
            banner: global_banner(&report.results),
        }
    }

    /// HTTP status the endpoint should answer with.
    pub fn status_code(&self) -> u16 {
        if self.success {
            200
        } else {
            500
        }
    }
}

/// Either response shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PayloadResponse {
    /// One selection, or a rejected body.
    Single(SingleGenerationResponse),
    /// Several selections.
    Invocation(InvocationResponse),
}

impl PayloadResponse {
    /// HTTP status the endpoint should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Single(r) => r.status_code(),
            Self::Invocation(r) => r.status_code(),
        }
    }
}

/// Runs a request body end to end.
///
/// One selection takes the single-provider path; several return the whole
/// result set. Never fails: errors become a response with a 4xx/5xx status.
pub async fn respond(orchestrator: &Orchestrator, body: GenerateRequestBody) -> PayloadResponse {
    let (request, selections) = match body.into_parts() {
        Ok(parts) => parts,
        Err(e) => {
            tracing::info!("rejected request body: {e}");
            return PayloadResponse::Single(SingleGenerationResponse::from_error(&e));
        }
    };

    if selections.len() == 1 {
        let selection = selections.into_iter().next();
        let outcome = match selection {
            Some(selection) => orchestrator.generate_one(request, selection).await,
            None => Err(CharsheetError::Validation("Missing required fields: selections".into())),
        };
        return PayloadResponse::Single(match outcome {
            Ok(outcome) => SingleGenerationResponse::from_outcome(&outcome),
            Err(e) => SingleGenerationResponse::from_error(&e),
        });
    }

    match orchestrator.generate(request, selections) {
        Ok(invocation) => {
            PayloadResponse::Invocation(InvocationResponse::from_report(&invocation.wait().await))
        }
        Err(e) => PayloadResponse::Single(SingleGenerationResponse::from_error(&e)),
    }
}

fn status_for(err: &CharsheetError) -> u16 {
    match err {
        CharsheetError::Validation(_) | CharsheetError::Json(_) | CharsheetError::Decode(_) => 400,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::image::{
        GeneratedImage, GenerationMetadata, GenerationResult, ImageFormat, ImageProvider,
        ProviderFailure,
    };
    use crate::registry::{ProviderEntry, ProviderRegistry};
    use async_trait::async_trait;
    use std::sync::Arc;

    // 1x1 transparent PNG.
    const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    fn body(selections: &[(&str, &str)]) -> GenerateRequestBody {
        GenerateRequestBody {
            prompt_text: "Create a character sheet".into(),
            primary_image_base64: PNG_B64.into(),
            primary_mime_type: None,
            template_image_base64: None,
            template_mime_type: None,
            selections: selections
                .iter()
                .map(|(p, m)| SelectionBody {
                    provider_id: p.to_string(),
                    model_id: m.to_string(),
                    label: None,
                })
                .collect(),
        }
    }

    struct FixedProvider {
        model: String,
        succeed: bool,
    }

    #[async_trait]
    impl ImageProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        fn model(&self) -> &str {
            &self.model
        }

        fn validate_config(&self) -> bool {
            true
        }

        async fn generate(&self, _request: &GenerationRequest) -> GenerationResult {
            let metadata = GenerationMetadata {
                provider: "fixed".into(),
                model: self.model.clone(),
                generated_at: Utc::now(),
                duration_ms: 1,
            };
            if self.succeed {
                GenerationResult::Success {
                    images: vec![GeneratedImage::new(b"IMG1".to_vec(), ImageFormat::Png)],
                    metadata,
                }
            } else {
                GenerationResult::Failure {
                    failure: ProviderFailure::new(ErrorCategory::RateLimited, "rate limit exceeded"),
                    metadata,
                }
            }
        }
    }

    fn orchestrator() -> Orchestrator {
        let registry = ProviderRegistry::builder()
            .register(ProviderEntry::new("fixed", "ok", |config| {
                let model = config.model_id.unwrap_or_default();
                let provider: Box<dyn ImageProvider> = Box::new(FixedProvider {
                    succeed: model != "fail",
                    model,
                });
                Ok(provider)
            }))
            .credential("fixed", "key")
            .build();
        Orchestrator::new(Arc::new(registry))
    }

    #[test]
    fn test_into_parts() {
        let mut body = body(&[("gemini", "flash"), ("flux", "kontext")]);
        body.template_image_base64 = Some(format!("data:image/png;base64,{PNG_B64}"));
        body.selections[1].label = Some("Flux".into());

        let (request, selections) = body.into_parts().unwrap();
        assert!(request.has_template());
        assert_eq!(request.primary_image.format(), ImageFormat::Png);
        assert_eq!(selections[0].selection_id, "gemini:flash");
        assert_eq!(selections[0].display_label, "flash");
        assert_eq!(selections[1].display_label, "Flux");
    }

    #[test]
    fn test_repeated_selections_get_suffixed_ids() {
        let (_, selections) = body(&[("gemini", "flash"), ("gemini", "flash"), ("gemini", "pro")])
            .into_parts()
            .unwrap();
        let ids: Vec<_> = selections.iter().map(|s| s.selection_id.as_str()).collect();
        assert_eq!(ids, vec!["gemini:flash", "gemini:flash#2", "gemini:pro"]);
    }

    #[test]
    fn test_missing_fields_are_listed() {
        let mut body = body(&[]);
        body.prompt_text = "  ".into();
        let err = body.into_parts().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid request: Missing required fields: promptText, selections"
        );
        assert_eq!(SingleGenerationResponse::from_error(&err).status_code(), 400);
    }

    #[test]
    fn test_bad_image_is_rejected() {
        let mut body = body(&[("gemini", "flash")]);
        body.primary_image_base64 = "!!!not base64!!!".into();
        assert!(matches!(body.into_parts(), Err(CharsheetError::Validation(_))));

        let mut body = self::body(&[("gemini", "flash")]);
        body.primary_mime_type = Some("image/gif".into());
        assert!(body.into_parts().is_err());
    }

    #[test]
    fn test_from_json() {
        let text = format!(
            r#"{{"promptText":"hi","primaryImageBase64":"{PNG_B64}","selections":[{{"providerId":"gemini","modelId":"flash"}}]}}"#
        );
        let body = GenerateRequestBody::from_json(&text).unwrap();
        assert_eq!(body.selections[0].provider_id, "gemini");
        assert!(GenerateRequestBody::from_json("{").is_err());
    }

    #[tokio::test]
    async fn test_single_selection_success() {
        let response = respond(&orchestrator(), body(&[("fixed", "ok")])).await;
        assert_eq!(response.status_code(), 200);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["imageData"], "SU1HMQ==");
        assert_eq!(json["mimeType"], "image/png");
        assert_eq!(json["metadata"]["provider"], "fixed");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_single_selection_failure_is_500() {
        let response = respond(&orchestrator(), body(&[("fixed", "fail")])).await;
        assert_eq!(response.status_code(), 500);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "rate limit exceeded");
        assert_eq!(json["metadata"]["model"], "fail");
    }

    #[tokio::test]
    async fn test_multiple_selections_return_result_set() {
        let response = respond(&orchestrator(), body(&[("fixed", "ok"), ("fixed", "fail")])).await;
        assert_eq!(response.status_code(), 200);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["results"][0]["status"], "success");
        assert_eq!(json["results"][1]["status"], "failure");
        assert!(json.get("banner").is_none());

        let response = respond(&orchestrator(), body(&[("fixed", "fail"), ("nope", "x")])).await;
        assert_eq!(response.status_code(), 500);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["banner"], "All models failed to generate. Please try again.");
        assert_eq!(json["results"][1]["error"]["category"], "unknown_provider");
    }
}
