//! Result projection: selections plus a snapshot become display rows.
//!
//! [`project`] is pure and safe to call on any intermediate snapshot.

use crate::orchestrator::{GenerationOutcome, InvocationResultSet, OutcomeStatus, ProviderSelection};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Hint shown under every failed row.
pub const RETRY_HINT: &str =
    "This model may be unavailable or rate limited. Other models may have succeeded.";

/// Banner shown when every selection failed.
pub const ALL_FAILED_BANNER: &str = "All models failed to generate. Please try again.";

/// Row status badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Badge {
    /// No outcome exists for the selection yet.
    Idle,
    /// Dispatched, not settled.
    Loading,
    /// Settled with an image.
    Success,
    /// Settled with a failure.
    Error,
}

impl Badge {
    /// Single-character marker.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Idle => "·",
            Self::Loading => "⏳",
            Self::Success => "✓",
            Self::Error => "✗",
        }
    }

    /// Short status text.
    pub fn text(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Loading => "Generating...",
            Self::Success => "Done",
            Self::Error => "Failed",
        }
    }
}

/// One display row per selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationRow {
    /// Selection this row renders.
    pub selection_id: String,
    /// Display label of the selection.
    pub label: String,
    /// Provider id.
    pub provider_id: String,
    /// Model id.
    pub model_id: String,
    /// Status badge.
    pub badge: Badge,
    /// `data:` URL of the generated image.
    pub image_data_url: Option<String>,
    /// Failure message.
    pub error: Option<String>,
    /// Retry hint, only on failed rows.
    pub hint: Option<&'static str>,
    /// Formatted duration, e.g. `2.35s`.
    pub duration: Option<String>,
    /// Completion time of a successful row.
    pub generated_at: Option<DateTime<Utc>>,
}

impl PresentationRow {
    fn new(selection: &ProviderSelection, outcome: Option<&GenerationOutcome>) -> Self {
        let mut row = Self {
            selection_id: selection.selection_id.clone(),
            label: selection.display_label.clone(),
            provider_id: selection.provider_id.clone(),
            model_id: selection.model_id.clone(),
            badge: Badge::Idle,
            image_data_url: None,
            error: None,
            hint: None,
            duration: None,
            generated_at: None,
        };

        let Some(outcome) = outcome else {
            return row;
        };

        row.duration = outcome.duration_ms.map(format_duration);
        match &outcome.status {
            OutcomeStatus::Pending => row.badge = Badge::Loading,
            OutcomeStatus::Success { images } => {
                row.badge = Badge::Success;
                row.image_data_url = images.first().map(|img| img.to_data_url());
                row.generated_at = outcome.completed_at;
            }
            OutcomeStatus::Failure { error } => {
                row.badge = Badge::Error;
                row.error = Some(error.message.clone());
                row.hint = Some(RETRY_HINT);
            }
        }
        row
    }
}

impl fmt::Display for PresentationRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.badge.symbol(), self.label, self.badge.text())?;
        if let Some(duration) = &self.duration {
            write!(f, " {duration}")?;
        }
        if let Some(error) = &self.error {
            write!(f, ": {error}")?;
        }
        Ok(())
    }
}

/// Builds one row per selection, in selection order.
pub fn project(
    selections: &[ProviderSelection],
    results: &InvocationResultSet,
) -> Vec<PresentationRow> {
    selections
        .iter()
        .map(|s| PresentationRow::new(s, results.get(&s.selection_id)))
        .collect()
}

/// Formats milliseconds as seconds with two decimals.
pub fn format_duration(ms: u64) -> String {
    format!("{:.2}s", ms as f64 / 1000.0)
}

/// The global banner, present only once every selection has failed.
pub fn global_banner(results: &InvocationResultSet) -> Option<&'static str> {
    results.all_failed().then_some(ALL_FAILED_BANNER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::image::{GeneratedImage, ImageFormat, ProviderFailure};

    fn selections() -> Vec<ProviderSelection> {
        vec![
            ProviderSelection::new("g", "gemini", "gemini-2.5-flash-image").with_label("Gemini Flash"),
            ProviderSelection::new("f", "flux", "black-forest-labs/flux-kontext-pro")
                .with_label("Flux Kontext Pro"),
        ]
    }

    fn settled(sels: &[ProviderSelection]) -> InvocationResultSet {
        let mut results = InvocationResultSet::pending(sels);
        results.settle(
            0,
            GenerationOutcome {
                status: OutcomeStatus::Success {
                    images: vec![GeneratedImage::new(b"IMG1".to_vec(), ImageFormat::Png)],
                },
                completed_at: Some(Utc::now()),
                duration_ms: Some(2350),
                ..GenerationOutcome::pending(&sels[0])
            },
        );
        results.settle(
            1,
            GenerationOutcome {
                status: OutcomeStatus::Failure {
                    error: ProviderFailure::new(ErrorCategory::RateLimited, "rate limit exceeded"),
                },
                duration_ms: Some(120),
                ..GenerationOutcome::pending(&sels[1])
            },
        );
        results
    }

    #[test]
    fn test_pending_snapshot_renders_loading_rows() {
        let sels = selections();
        let rows = project(&sels, &InvocationResultSet::pending(&sels));
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.badge == Badge::Loading));
        assert_eq!(rows[0].label, "Gemini Flash");
        assert!(rows[0].image_data_url.is_none());
    }

    #[test]
    fn test_missing_outcome_is_idle() {
        let sels = selections();
        let rows = project(&sels, &InvocationResultSet::pending(&sels[..1]));
        assert_eq!(rows[0].badge, Badge::Loading);
        assert_eq!(rows[1].badge, Badge::Idle);
    }

    #[test]
    fn test_settled_rows() {
        let sels = selections();
        let results = settled(&sels);
        let rows = project(&sels, &results);

        assert_eq!(rows[0].badge, Badge::Success);
        assert_eq!(rows[0].image_data_url.as_deref(), Some("data:image/png;base64,SU1HMQ=="));
        assert_eq!(rows[0].duration.as_deref(), Some("2.35s"));
        assert!(rows[0].hint.is_none());

        assert_eq!(rows[1].badge, Badge::Error);
        assert_eq!(rows[1].error.as_deref(), Some("rate limit exceeded"));
        assert_eq!(rows[1].hint, Some(RETRY_HINT));
        assert_eq!(rows[1].to_string(), "✗ Flux Kontext Pro [Failed] 0.12s: rate limit exceeded");

        // Projection is idempotent.
        assert_eq!(project(&sels, &results), rows);
        assert_eq!(global_banner(&results), None);
    }

    #[test]
    fn test_banner_only_when_all_failed() {
        let sels = selections();
        let mut results = InvocationResultSet::pending(&sels);
        assert_eq!(global_banner(&results), None);
        results.fail_pending("boom");
        assert_eq!(global_banner(&results), Some(ALL_FAILED_BANNER));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0.00s");
        assert_eq!(format_duration(1500), "1.50s");
        assert_eq!(format_duration(61_004), "61.00s");
    }

    #[test]
    fn test_row_serialization() {
        let sels = selections();
        let rows = project(&sels, &settled(&sels));
        let json = serde_json::to_value(&rows[1]).unwrap();
        assert_eq!(json["badge"], "error");
        assert_eq!(json["selectionId"], "f");
        assert!(json["imageDataUrl"].is_null());
    }
}
