//! Image generation module.

mod provider;
pub mod providers;
mod types;

pub use provider::{GenerationResult, ImageProvider, ProviderConfig, ProviderFailure};
pub use types::{
    GeneratedImage, GenerationMetadata, GenerationRequest, ImageFormat, ImageInput,
    MAX_IMAGE_BYTES, MAX_PROMPT_CHARS,
};
