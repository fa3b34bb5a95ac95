//! Image generation providers.

#[cfg(feature = "flux")]
mod flux;
#[cfg(feature = "gemini")]
mod gemini;

#[cfg(feature = "flux")]
pub use flux::{FluxModel, FluxProvider, FluxProviderBuilder};

#[cfg(feature = "gemini")]
pub use gemini::{GeminiModel, GeminiProvider, GeminiProviderBuilder};
