//! Provider registry: maps provider ids to constructors and credentials.
//!
//! Built once at startup, then shared read-only (typically behind an `Arc`)
//! by every invocation.

use crate::config::{env_var_name, Credentials};
use crate::error::{CharsheetError, Result};
use crate::image::{ImageProvider, ProviderConfig};
use std::sync::Arc;

/// Builds a provider instance from resolved configuration.
pub type ProviderConstructor =
    Arc<dyn Fn(ProviderConfig) -> Result<Box<dyn ImageProvider>> + Send + Sync>;

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// One registered provider implementation.
#[derive(Clone)]
pub struct ProviderEntry {
    id: String,
    display_name: String,
    default_model: String,
    credential_aliases: Vec<String>,
    constructor: ProviderConstructor,
}

impl ProviderEntry {
    /// Creates an entry for `id` whose selections default to `default_model`.
    pub fn new<F>(id: impl Into<String>, default_model: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(ProviderConfig) -> Result<Box<dyn ImageProvider>> + Send + Sync + 'static,
    {
        let id = id.into().to_ascii_lowercase();
        Self {
            display_name: id.clone(),
            id,
            default_model: default_model.into(),
            credential_aliases: Vec::new(),
            constructor: Arc::new(constructor),
        }
    }

    /// Sets the human-readable name.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Adds an env var consulted after `${ID}_API_KEY`.
    pub fn credential_alias(mut self, env_var: impl Into<String>) -> Self {
        self.credential_aliases.push(env_var.into());
        self
    }

    /// Provider id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.display_name
    }

    /// Model used when a selection names none.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Env vars searched for the credential, in order.
    pub fn credential_env_vars(&self) -> Vec<String> {
        std::iter::once(env_var_name(&self.id))
            .chain(self.credential_aliases.iter().cloned())
            .collect()
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("id", &self.id)
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

/// Immutable provider registry.
#[derive(Debug)]
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
    credentials: Credentials,
}

impl ProviderRegistry {
    /// Creates an empty registry builder.
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Creates a builder with every compiled-in provider registered.
    pub fn with_defaults() -> ProviderRegistryBuilder {
        #[allow(unused_mut)]
        let mut builder = Self::builder();

        #[cfg(feature = "gemini")]
        {
            builder = builder.register(
                ProviderEntry::new("gemini", "gemini-2.5-flash-image", gemini_constructor)
                    .display_name("Gemini (Google)"),
            );
        }

        #[cfg(feature = "flux")]
        {
            builder = builder.register(
                ProviderEntry::new(
                    "flux",
                    "black-forest-labs/flux-kontext-pro",
                    flux_constructor,
                )
                .display_name("Flux (Black Forest Labs via Replicate)")
                .credential_alias("REPLICATE_API_TOKEN"),
            );
        }

        builder
    }

    /// Looks up the entry for a provider id.
    pub fn resolve(&self, provider_id: &str) -> Result<&ProviderEntry> {
        let wanted = provider_id.trim().to_ascii_lowercase();
        self.entries
            .iter()
            .find(|e| e.id == wanted)
            .ok_or_else(|| CharsheetError::UnknownProvider(provider_id.to_string()))
    }

    /// Constructs a fresh, validated provider instance.
    ///
    /// Fails with `UnknownProvider` for unregistered ids and with
    /// `InvalidProviderConfig` when the credential is absent or fails the
    /// provider's own shape check. No network call is made.
    pub fn create_provider(
        &self,
        provider_id: &str,
        model_id: Option<&str>,
    ) -> Result<Box<dyn ImageProvider>> {
        let entry = self.resolve(provider_id)?;

        let credential = self.credentials.get(&entry.id).ok_or_else(|| {
            CharsheetError::InvalidProviderConfig {
                provider: entry.id.clone(),
                reason: format!(
                    "API key not found, set {}",
                    entry.credential_env_vars().join(" or ")
                ),
            }
        })?;

        let model = model_id
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&entry.default_model);
        let config = ProviderConfig::new(&entry.id, credential).with_model(model);

        let provider = (entry.constructor)(config).map_err(|e| match e {
            CharsheetError::InvalidProviderConfig { .. } => e,
            other => CharsheetError::InvalidProviderConfig {
                provider: entry.id.clone(),
                reason: other.to_string(),
            },
        })?;

        if !provider.validate_config() {
            return Err(CharsheetError::InvalidProviderConfig {
                provider: entry.id.clone(),
                reason: "credential format not recognized".into(),
            });
        }

        Ok(provider)
    }

    /// Registered entries, in registration order.
    pub fn entries(&self) -> &[ProviderEntry] {
        &self.entries
    }

    /// Registered provider ids, in registration order.
    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    /// Returns true if a credential is configured for the provider.
    pub fn has_credential(&self, provider_id: &str) -> bool {
        self.credentials.contains(&provider_id.to_ascii_lowercase())
    }
}

/// Builder for [`ProviderRegistry`].
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    entries: Vec<ProviderEntry>,
    credentials: Credentials,
    env_lookup: Option<EnvLookup>,
}

impl ProviderRegistryBuilder {
    /// Registers a provider. The first registration of an id wins.
    pub fn register(mut self, entry: ProviderEntry) -> Self {
        if self.entries.iter().any(|e| e.id == entry.id) {
            tracing::warn!(provider = %entry.id, "provider already registered, ignoring");
            return self;
        }
        self.entries.push(entry);
        self
    }

    /// Sets an explicit credential for a provider.
    pub fn credential(mut self, provider_id: &str, secret: impl Into<String>) -> Self {
        self.credentials = self
            .credentials
            .with(provider_id.to_ascii_lowercase(), secret);
        self
    }

    /// Fills missing credentials from the process environment at build time.
    pub fn credentials_from_env(self) -> Self {
        self.credentials_from_lookup(|key| std::env::var(key).ok())
    }

    /// Fills missing credentials through an arbitrary lookup at build time.
    pub fn credentials_from_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env_lookup = Some(Box::new(lookup));
        self
    }

    /// Freezes the registry.
    pub fn build(self) -> ProviderRegistry {
        let mut credentials = self.credentials;
        if let Some(lookup) = self.env_lookup {
            for entry in &self.entries {
                if credentials.contains(&entry.id) {
                    continue;
                }
                if let Some(secret) =
                    Credentials::resolve(&entry.id, &entry.credential_aliases, &lookup)
                {
                    credentials = credentials.with(entry.id.clone(), secret);
                }
            }
        }

        tracing::debug!(
            providers = ?self.entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            credentials = ?credentials,
            "provider registry built"
        );

        ProviderRegistry {
            entries: self.entries,
            credentials,
        }
    }
}

#[cfg(feature = "gemini")]
fn gemini_constructor(config: ProviderConfig) -> Result<Box<dyn ImageProvider>> {
    let provider = crate::image::providers::GeminiProvider::from_config(config)?;
    Ok(Box::new(provider))
}

#[cfg(feature = "flux")]
fn flux_constructor(config: ProviderConfig) -> Result<Box<dyn ImageProvider>> {
    let provider = crate::image::providers::FluxProvider::from_config(config)?;
    Ok(Box::new(provider))
}
