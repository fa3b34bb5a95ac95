#![warn(missing_docs)]
//! Charsheet - character sheet generation across several AI image providers.
//!
//! One request (a prompt, an avatar image and an optional layout template)
//! is sent to every selected (provider, model) pair at once. Each selection
//! settles on its own; callers can watch results arrive one by one and
//! render them without waiting for the slowest provider.
//!
//! # Quick Start
//!
//! ```no_run
//! use charsheet::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> charsheet::Result<()> {
//!     let registry = ProviderRegistry::with_defaults().credentials_from_env().build();
//!     let orchestrator = Orchestrator::new(Arc::new(registry));
//!
//!     let request = GenerationRequest::new(
//!         "A character sheet with front, side and back views",
//!         ImageInput::from_path("avatar.png")?,
//!     )
//!     .with_template(ImageInput::from_path("layout.png")?);
//!
//!     let invocation = orchestrator.generate(request, ProviderSelection::defaults())?;
//!     let results = invocation.wait().await.into_result()?;
//!     for outcome in &results {
//!         if let Some(image) = outcome.images().first() {
//!             image.save(format!("{}.png", outcome.selection_id))?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `gemini`: Gemini (Google) image models
//! - `flux`: Flux Kontext (Black Forest Labs, served by Replicate)
//! - `cli`: Command-line interface

pub mod config;
mod error;
pub mod image;
pub mod orchestrator;
pub mod payload;
pub mod projection;
pub mod registry;

// Re-export error types at crate root
pub use error::{
    classify_failure, parse_retry_after, sanitize_error_message, CharsheetError, ErrorCategory,
    Result,
};

pub use config::{Credentials, Settings};
pub use image::{
    GeneratedImage, GenerationMetadata, GenerationRequest, GenerationResult, ImageFormat,
    ImageInput, ImageProvider, ProviderConfig, ProviderFailure,
};
pub use orchestrator::{
    GenerationOutcome, Invocation, InvocationReport, InvocationResultSet, Orchestrator,
    OrchestratorConfig, OutcomeStatus, ProviderSelection, Updates,
};
pub use projection::{project, Badge, PresentationRow};
pub use registry::{ProviderEntry, ProviderRegistry, ProviderRegistryBuilder};

#[cfg(feature = "flux")]
pub use image::providers::{FluxModel, FluxProvider, FluxProviderBuilder};

#[cfg(feature = "gemini")]
pub use image::providers::{GeminiModel, GeminiProvider, GeminiProviderBuilder};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{CharsheetError, ErrorCategory, Result};
    pub use crate::image::{GeneratedImage, GenerationRequest, ImageInput, ImageProvider};
    pub use crate::orchestrator::{
        GenerationOutcome, Invocation, InvocationResultSet, Orchestrator, ProviderSelection,
    };
    pub use crate::registry::ProviderRegistry;

    #[cfg(feature = "flux")]
    pub use crate::image::providers::FluxProvider;

    #[cfg(feature = "gemini")]
    pub use crate::image::providers::GeminiProvider;
}
