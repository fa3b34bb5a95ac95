//! Process-wide settings and provider credentials.

use crate::error::{CharsheetError, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Default deadline for a single selection, including provider polling.
pub const DEFAULT_SELECTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Stock prompt for the avatar-only flow.
pub const DEFAULT_PROMPT: &str = "Character sheet of a cute Vietnamese kindergarten child, headshot only. \
Style: High-quality children's storybook illustration style, soft digital painting, warm colors, \
expressive, detailed facial features, cute and charming, hand-drawn texture, white background. \
Consistency: High fidelity to the original face features from the reference image, keeping exact \
hair style and face shape. Layout: A grid layout of 8 panels (4 columns x 2 rows). \
Content Row 1 (Front views): 1. Neutral expression, 2. Big happy smile, 3. Crying with tears, \
4. Grumpy pouting face. Content Row 2 (Angles): 5. Left side profile, 6. Right side profile, \
7. 3/4 angle view from front-left, 8. Back of the head view showing hair only. \
Negative Prompt: (distortion, bad anatomy, extra fingers, messy lines, text, watermark, blurry, \
realistic photo style, 3d render)";

/// Stock prompt for the template flow.
pub const TEMPLATE_PROMPT: &str = "Generate result follow the input template image structure";

/// Stock prompt for a flow with or without a layout template.
pub fn default_prompt(has_template: bool) -> &'static str {
    if has_template {
        TEMPLATE_PROMPT
    } else {
        DEFAULT_PROMPT
    }
}

const DEFAULT_PROVIDER_ENV: &str = "DEFAULT_PROVIDER";
const SELECTION_TIMEOUT_ENV: &str = "CHARSHEET_SELECTION_TIMEOUT_SECS";
const MAX_CONCURRENCY_ENV: &str = "CHARSHEET_MAX_CONCURRENCY";

/// Settings read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Provider used when a caller names none.
    pub default_provider: String,
    /// Deadline applied to each selection.
    pub selection_timeout: Duration,
    /// Upper bound on simultaneous provider calls; `None` is unbounded.
    pub max_concurrency: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_provider: "gemini".to_string(),
            selection_timeout: DEFAULT_SELECTION_TIMEOUT,
            max_concurrency: None,
        }
    }
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(provider) = non_empty(lookup(DEFAULT_PROVIDER_ENV)) {
            settings.default_provider = provider.to_lowercase();
        }
        if let Some(raw) = non_empty(lookup(SELECTION_TIMEOUT_ENV)) {
            let secs = parse_positive(SELECTION_TIMEOUT_ENV, &raw)?;
            settings.selection_timeout = Duration::from_secs(secs as u64);
        }
        if let Some(raw) = non_empty(lookup(MAX_CONCURRENCY_ENV)) {
            settings.max_concurrency = Some(parse_positive(MAX_CONCURRENCY_ENV, &raw)?);
        }

        Ok(settings)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_positive(key: &str, raw: &str) -> Result<usize> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(CharsheetError::Validation(format!(
            "{key} must be a positive integer, got '{raw}'"
        ))),
    }
}

/// Immutable provider-id to credential map.
#[derive(Clone, Default)]
pub struct Credentials {
    secrets: HashMap<String, String>,
}

impl Credentials {
    /// Creates an empty credential store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a credential for a provider. Empty secrets are ignored.
    pub fn with(mut self, provider_id: impl Into<String>, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.trim().is_empty() {
            self.secrets.insert(provider_id.into(), secret.trim().to_string());
        }
        self
    }

    /// Returns the credential for a provider, if configured.
    pub fn get(&self, provider_id: &str) -> Option<&str> {
        self.secrets.get(provider_id).map(String::as_str)
    }

    /// Returns true if a credential is configured for the provider.
    pub fn contains(&self, provider_id: &str) -> bool {
        self.secrets.contains_key(provider_id)
    }

    /// Resolves a provider's credential from the environment.
    ///
    /// Tries `${PROVIDER_ID_UPPER}_API_KEY` first, then each alias in order.
    pub fn resolve(
        provider_id: &str,
        aliases: &[String],
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Option<String> {
        std::iter::once(env_var_name(provider_id))
            .chain(aliases.iter().cloned())
            .find_map(|key| non_empty(lookup(&key)))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<&str> = self.secrets.keys().map(String::as_str).collect();
        providers.sort_unstable();
        f.debug_struct("Credentials")
            .field("providers", &providers)
            .finish()
    }
}

/// Conventional env var holding a provider's key (`gemini` -> `GEMINI_API_KEY`).
pub fn env_var_name(provider_id: &str) -> String {
    format!("{}_API_KEY", provider_id.to_uppercase().replace('-', "_"))
}
