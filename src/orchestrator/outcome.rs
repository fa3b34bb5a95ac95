//! Selections, per-selection outcomes, and the invocation result set.

use crate::error::{CharsheetError, ErrorCategory, Result};
use crate::image::{GeneratedImage, ProviderFailure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One (provider, model) branch of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSelection {
    /// Unique within one invocation.
    pub selection_id: String,
    /// Registered provider id.
    pub provider_id: String,
    /// Model passed to the provider.
    pub model_id: String,
    /// Label shown to users.
    pub display_label: String,
}

impl ProviderSelection {
    /// Creates a selection labelled with its model id.
    pub fn new(
        selection_id: impl Into<String>,
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        let model_id = model_id.into();
        Self {
            selection_id: selection_id.into(),
            provider_id: provider_id.into(),
            display_label: model_id.clone(),
            model_id,
        }
    }

    /// Sets the display label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.display_label = label.into();
        self
    }

    /// The stock selection set: two Gemini models and Flux Kontext.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("gemini-flash", "gemini", "gemini-2.5-flash-image")
                .with_label("Gemini Flash"),
            Self::new("gemini-pro", "gemini", "gemini-3-pro-image-preview")
                .with_label("Gemini Pro (Preview)"),
            Self::new("flux-kontext", "flux", "black-forest-labs/flux-kontext-pro")
                .with_label("Flux Kontext Pro"),
        ]
    }
}

/// Checks that a selection list can start an invocation.
pub(crate) fn validate_selections(selections: &[ProviderSelection]) -> Result<()> {
    if selections.is_empty() {
        return Err(CharsheetError::Validation(
            "at least one provider selection is required".into(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for selection in selections {
        if selection.selection_id.trim().is_empty() {
            return Err(CharsheetError::Validation("selection id is required".into()));
        }
        if selection.provider_id.trim().is_empty() {
            return Err(CharsheetError::Validation(format!(
                "selection '{}' has no provider",
                selection.selection_id
            )));
        }
        if !seen.insert(selection.selection_id.as_str()) {
            return Err(CharsheetError::Validation(format!(
                "duplicate selection id '{}'",
                selection.selection_id
            )));
        }
    }
    Ok(())
}

/// Lifecycle state of one selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Dispatched or waiting to be.
    Pending,
    /// Terminal: the provider produced an image.
    Success {
        /// Exactly one image.
        images: Vec<GeneratedImage>,
    },
    /// Terminal: the selection failed.
    Failure {
        /// Category and message.
        error: ProviderFailure,
    },
}

/// The pending or terminal record for one selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutcome {
    /// Selection this outcome belongs to.
    pub selection_id: String,
    /// Provider id from the selection.
    pub provider_id: String,
    /// Model id from the selection.
    pub model_id: String,
    /// Current state.
    #[serde(flatten)]
    pub status: OutcomeStatus,
    /// When the selection's call was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the outcome became terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Dispatch-to-terminal time for this selection alone.
    pub duration_ms: Option<u64>,
}

impl GenerationOutcome {
    /// Creates the pending outcome for a selection.
    pub fn pending(selection: &ProviderSelection) -> Self {
        Self {
            selection_id: selection.selection_id.clone(),
            provider_id: selection.provider_id.clone(),
            model_id: selection.model_id.clone(),
            status: OutcomeStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Returns true while the selection has not settled.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, OutcomeStatus::Pending)
    }

    /// Returns true once the selection has settled.
    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    /// Returns true for a settled success.
    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success { .. })
    }

    /// Returns true for a settled failure.
    pub fn is_failure(&self) -> bool {
        matches!(self.status, OutcomeStatus::Failure { .. })
    }

    /// Generated images; empty unless successful.
    pub fn images(&self) -> &[GeneratedImage] {
        match &self.status {
            OutcomeStatus::Success { images } => images,
            _ => &[],
        }
    }

    /// Failure details, if failed.
    pub fn error(&self) -> Option<&ProviderFailure> {
        match &self.status {
            OutcomeStatus::Failure { error } => Some(error),
            _ => None,
        }
    }

    /// Short status name (`pending`, `success`, `failure`).
    pub fn status_name(&self) -> &'static str {
        match self.status {
            OutcomeStatus::Pending => "pending",
            OutcomeStatus::Success { .. } => "success",
            OutcomeStatus::Failure { .. } => "failure",
        }
    }
}

/// Outcomes of one invocation, in selection order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct InvocationResultSet {
    outcomes: Vec<GenerationOutcome>,
}

impl InvocationResultSet {
    /// Creates an all-pending result set.
    pub fn pending(selections: &[ProviderSelection]) -> Self {
        Self {
            outcomes: selections.iter().map(GenerationOutcome::pending).collect(),
        }
    }

    /// Looks up the outcome for a selection id.
    pub fn get(&self, selection_id: &str) -> Option<&GenerationOutcome> {
        self.outcomes.iter().find(|o| o.selection_id == selection_id)
    }

    /// Outcomes in selection order.
    pub fn outcomes(&self) -> &[GenerationOutcome] {
        &self.outcomes
    }

    /// Iterates outcomes in selection order.
    pub fn iter(&self) -> std::slice::Iter<'_, GenerationOutcome> {
        self.outcomes.iter()
    }

    /// Number of selections.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns true if there are no selections.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Number of selections not yet settled.
    pub fn pending_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_pending()).count()
    }

    /// Number of successful selections.
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// Number of failed selections.
    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    /// Returns true once no selection is pending.
    pub fn is_settled(&self) -> bool {
        self.pending_count() == 0
    }

    /// Returns true iff every selection settled and none succeeded.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.is_failure())
    }

    /// Writes a terminal outcome into its slot.
    ///
    /// Returns false, leaving the set untouched, if the slot is unknown,
    /// belongs to another selection, or has already settled.
    pub(crate) fn settle(&mut self, index: usize, outcome: GenerationOutcome) -> bool {
        let Some(slot) = self.outcomes.get_mut(index) else {
            return false;
        };
        if slot.selection_id != outcome.selection_id || slot.is_terminal() || outcome.is_pending() {
            tracing::warn!(
                selection_id = %outcome.selection_id,
                "rejected settlement for an already settled or mismatched slot"
            );
            return false;
        }
        *slot = outcome;
        true
    }

    /// Settles every still-pending slot as a failure.
    pub(crate) fn fail_pending(&mut self, message: &str) {
        let now = Utc::now();
        for slot in self.outcomes.iter_mut().filter(|o| o.is_pending()) {
            slot.status = OutcomeStatus::Failure {
                error: ProviderFailure::new(ErrorCategory::Generic, message),
            };
            slot.completed_at = Some(now);
        }
    }
}

impl<'a> IntoIterator for &'a InvocationResultSet {
    type Item = &'a GenerationOutcome;
    type IntoIter = std::slice::Iter<'a, GenerationOutcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Final state of a settled invocation.
#[derive(Debug)]
pub struct InvocationReport {
    /// Invocation id, also present on log spans.
    pub invocation_id: Uuid,
    /// Every outcome, all terminal.
    pub results: InvocationResultSet,
    /// `AllSelectionsFailed` when no selection succeeded.
    pub error: Option<CharsheetError>,
}

impl InvocationReport {
    /// Returns true if every selection failed.
    pub fn all_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Returns the results, or the invocation-level error.
    pub fn into_result(self) -> Result<InvocationResultSet> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.results),
        }
    }
}
