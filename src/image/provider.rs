//! Image provider trait and the result it reports.

use crate::error::{CharsheetError, ErrorCategory};
use crate::image::types::{GeneratedImage, GenerationMetadata, GenerationRequest};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;

/// Configuration a provider instance is constructed from.
///
/// Resolved once per instance and never mutated afterwards.
#[derive(Clone)]
pub struct ProviderConfig {
    /// Registered provider id (e.g. `gemini`).
    pub provider_id: String,
    /// API credential.
    pub credential: String,
    /// Model override; `None` means the provider default.
    pub model_id: Option<String>,
}

impl ProviderConfig {
    /// Creates a config without a model override.
    pub fn new(provider_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            credential: credential.into(),
            model_id: None,
        }
    }

    /// Sets the model override.
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider_id", &self.provider_id)
            .field("credential", &"[REDACTED]")
            .field("model_id", &self.model_id)
            .finish()
    }
}

/// Why a provider call failed, in caller-presentable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    /// Coarse category.
    pub category: ErrorCategory,
    /// Human-readable message.
    pub message: String,
}

impl ProviderFailure {
    /// Creates a failure with an explicit category.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl From<&CharsheetError> for ProviderFailure {
    fn from(err: &CharsheetError) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

impl From<CharsheetError> for ProviderFailure {
    fn from(err: CharsheetError) -> Self {
        Self::from(&err)
    }
}

/// The tagged result of one provider call. Providers never panic or
/// return `Err` across this boundary.
#[derive(Debug, Clone)]
pub enum GenerationResult {
    /// The call produced images.
    Success {
        /// Generated images, first one is authoritative.
        images: Vec<GeneratedImage>,
        /// Call metadata.
        metadata: GenerationMetadata,
    },
    /// The call failed.
    Failure {
        /// What went wrong.
        failure: ProviderFailure,
        /// Call metadata.
        metadata: GenerationMetadata,
    },
}

impl GenerationResult {
    /// Folds an internal provider attempt into the tagged result.
    pub fn from_attempt(
        provider: &str,
        model: &str,
        elapsed: Duration,
        attempt: crate::Result<GeneratedImage>,
    ) -> Self {
        let metadata = GenerationMetadata {
            provider: provider.to_string(),
            model: model.to_string(),
            generated_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
        };
        match attempt {
            Ok(image) => Self::Success {
                images: vec![image],
                metadata,
            },
            Err(e) => {
                tracing::warn!(
                    provider,
                    model,
                    category = %e.category(),
                    "generation failed: {e}"
                );
                Self::Failure {
                    failure: ProviderFailure::from(&e),
                    metadata,
                }
            }
        }
    }

    /// Returns true for a success carrying at least one image.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { images, .. } if !images.is_empty())
    }

    /// Call metadata.
    pub fn metadata(&self) -> &GenerationMetadata {
        match self {
            Self::Success { metadata, .. } | Self::Failure { metadata, .. } => metadata,
        }
    }
}

/// Trait for image generation providers.
///
/// One instance serves one selection; implementations hold only their own
/// immutable configuration.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Returns the registered provider id (e.g. `gemini`).
    fn name(&self) -> &str;

    /// Returns the model id this instance calls.
    fn model(&self) -> &str;

    /// Checks the credential's shape without any network call.
    fn validate_config(&self) -> bool;

    /// Generates a character sheet. All failures come back as
    /// [`GenerationResult::Failure`].
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult;
}
