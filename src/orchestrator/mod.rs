//! Fan-out orchestration of one generation request across many selections.
//!
//! Each selection runs in its own task and reports its terminal outcome to a
//! single aggregator, which owns the result set and publishes a snapshot
//! after every settlement. A failing, slow, or panicking selection never
//! delays or alters its siblings. Subscribers always see the all-pending
//! set first.
//!
//! ```no_run
//! use charsheet::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> charsheet::Result<()> {
//! let registry = Arc::new(ProviderRegistry::with_defaults().credentials_from_env().build());
//! let orchestrator = Orchestrator::new(registry);
//!
//! let request = GenerationRequest::new(
//!     "A fantasy ranger",
//!     ImageInput::from_path("avatar.png")?,
//! );
//! let invocation = orchestrator.generate(request, ProviderSelection::defaults())?;
//!
//! let mut updates = invocation.subscribe();
//! while let Some(snapshot) = updates.next().await {
//!     println!("{} of {} settled", snapshot.len() - snapshot.pending_count(), snapshot.len());
//! }
//!
//! let report = invocation.wait().await;
//! # Ok(())
//! # }
//! ```

mod outcome;

pub use outcome::{
    GenerationOutcome, InvocationReport, InvocationResultSet, OutcomeStatus, ProviderSelection,
};

use crate::config::{Settings, DEFAULT_SELECTION_TIMEOUT};
use crate::error::{sanitize_error_message, CharsheetError, ErrorCategory, Result};
use crate::image::{GenerationRequest, GenerationResult, ProviderFailure};
use crate::registry::ProviderRegistry;
use chrono::Utc;
use outcome::validate_selections;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

const LOST_TASK_MESSAGE: &str = "selection task ended without reporting a result";
const PANIC_MESSAGE: &str = "provider call panicked";

/// Tuning for an [`Orchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Deadline for each selection, measured from dispatch.
    pub selection_timeout: Duration,
    /// Maximum provider calls in flight per invocation; `None` is unbounded.
    pub max_concurrency: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            selection_timeout: DEFAULT_SELECTION_TIMEOUT,
            max_concurrency: None,
        }
    }
}

impl From<&Settings> for OrchestratorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            selection_timeout: settings.selection_timeout,
            max_concurrency: settings.max_concurrency,
        }
    }
}

/// Dispatches requests to every selected provider concurrently.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates an orchestrator with default tuning.
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            config: OrchestratorConfig::default(),
        }
    }

    /// Replaces the tuning.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// The registry selections are resolved against.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Starts an invocation.
    ///
    /// Validation errors are returned before anything is dispatched. After
    /// that, every per-selection problem (unknown provider, missing
    /// credential, upstream error, timeout) becomes that selection's
    /// failed outcome. Must be called within a Tokio runtime.
    pub fn generate(
        &self,
        request: GenerationRequest,
        selections: Vec<ProviderSelection>,
    ) -> Result<Invocation> {
        request.validate()?;
        validate_selections(&selections)?;

        let id = Uuid::new_v4();
        let initial = InvocationResultSet::pending(&selections);
        let (snapshot_tx, snapshot_rx) = watch::channel(initial.clone());
        let (settle_tx, settle_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let permits = self
            .config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n)));
        let request = Arc::new(request);

        tracing::info!(
            invocation_id = %id,
            selections = selections.len(),
            has_template = request.has_template(),
            "starting invocation"
        );

        for (index, selection) in selections.into_iter().enumerate() {
            let span = tracing::info_span!(
                "selection",
                invocation_id = %id,
                selection_id = %selection.selection_id,
                provider = %selection.provider_id,
                model = %selection.model_id,
            );
            let task = SelectionTask {
                registry: Arc::clone(&self.registry),
                request: Arc::clone(&request),
                selection,
                timeout: self.config.selection_timeout,
                cancel: cancel.clone(),
                permits: permits.clone(),
            };
            let tx = settle_tx.clone();
            tokio::spawn(
                async move {
                    let outcome = task.run().await;
                    // The aggregator only stops listening once every slot settled.
                    let _ = tx.send(Settlement { index, outcome });
                }
                .instrument(span),
            );
        }
        drop(settle_tx);

        let aggregator = tokio::spawn(
            aggregate(initial.clone(), settle_rx, snapshot_tx)
                .instrument(tracing::info_span!("invocation", invocation_id = %id)),
        );

        Ok(Invocation {
            id,
            initial,
            snapshots: snapshot_rx,
            cancel,
            aggregator,
        })
    }

    /// Runs a single selection to completion and returns its outcome.
    pub async fn generate_one(
        &self,
        request: GenerationRequest,
        selection: ProviderSelection,
    ) -> Result<GenerationOutcome> {
        let report = self.generate(request, vec![selection])?.wait().await;
        report
            .results
            .outcomes()
            .first()
            .cloned()
            .ok_or_else(|| CharsheetError::Validation("invocation produced no outcome".into()))
    }
}

/// Handle to a running invocation.
#[derive(Debug)]
pub struct Invocation {
    id: Uuid,
    initial: InvocationResultSet,
    snapshots: watch::Receiver<InvocationResultSet>,
    cancel: CancellationToken,
    aggregator: JoinHandle<InvocationResultSet>,
}

impl Invocation {
    /// Invocation id, also recorded on every log span.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The all-pending result set the invocation started from.
    pub fn initial(&self) -> &InvocationResultSet {
        &self.initial
    }

    /// The latest published result set.
    pub fn snapshot(&self) -> InvocationResultSet {
        self.snapshots.borrow().clone()
    }

    /// Subscribes to result set updates.
    ///
    /// The first item is always the all-pending set, even when some
    /// selections settled before the call.
    pub fn subscribe(&self) -> Updates {
        Updates {
            initial: Some(self.initial.clone()),
            snapshots: self.snapshots.clone(),
        }
    }

    /// Settles every still-pending selection as cancelled.
    pub fn cancel(&self) {
        tracing::info!(invocation_id = %self.id, "cancelling invocation");
        self.cancel.cancel();
    }

    /// Waits until every selection has settled.
    pub async fn wait(self) -> InvocationReport {
        let results = match self.aggregator.await {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(invocation_id = %self.id, "aggregator task failed: {e}");
                let mut results = self.snapshots.borrow().clone();
                results.fail_pending(LOST_TASK_MESSAGE);
                results
            }
        };

        let error = results
            .all_failed()
            .then(|| CharsheetError::AllSelectionsFailed {
                total: results.len(),
            });

        tracing::info!(
            invocation_id = %self.id,
            succeeded = results.success_count(),
            failed = results.failure_count(),
            "invocation settled"
        );

        InvocationReport {
            invocation_id: self.id,
            results,
            error,
        }
    }
}

/// Result sets of one invocation in publication order.
///
/// Yields the all-pending set, then the latest set after each settlement
/// it observes, and ends after the settled set. Settlements that land
/// between two polls arrive merged in one set.
#[derive(Debug)]
pub struct Updates {
    initial: Option<InvocationResultSet>,
    snapshots: watch::Receiver<InvocationResultSet>,
}

impl Updates {
    /// Waits for the next result set; `None` once the invocation settled
    /// and its final set was yielded.
    pub async fn next(&mut self) -> Option<InvocationResultSet> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        self.snapshots.changed().await.ok()?;
        Some(self.snapshots.borrow_and_update().clone())
    }
}

struct Settlement {
    index: usize,
    outcome: GenerationOutcome,
}

/// Sole writer of the result set.
async fn aggregate(
    mut results: InvocationResultSet,
    mut settlements: mpsc::UnboundedReceiver<Settlement>,
    snapshots: watch::Sender<InvocationResultSet>,
) -> InvocationResultSet {
    while !results.is_settled() {
        let Some(Settlement { index, outcome }) = settlements.recv().await else {
            break;
        };
        tracing::info!(
            selection_id = %outcome.selection_id,
            status = outcome.status_name(),
            duration_ms = outcome.duration_ms,
            "selection settled"
        );
        if results.settle(index, outcome) {
            snapshots.send_replace(results.clone());
        }
    }

    if !results.is_settled() {
        tracing::error!(
            pending = results.pending_count(),
            "selection tasks exited without settling"
        );
        results.fail_pending(LOST_TASK_MESSAGE);
        snapshots.send_replace(results.clone());
    }

    results
}

struct SelectionTask {
    registry: Arc<ProviderRegistry>,
    request: Arc<GenerationRequest>,
    selection: ProviderSelection,
    timeout: Duration,
    cancel: CancellationToken,
    permits: Option<Arc<Semaphore>>,
}

impl SelectionTask {
    async fn run(self) -> GenerationOutcome {
        let _permit = match self.permits.clone() {
            Some(sem) => sem.acquire_owned().await.ok(),
            None => None,
        };

        let started_at = Utc::now();
        let start = Instant::now();
        tracing::debug!("dispatching");

        let selection = self.selection.clone();
        let cancel = self.cancel.clone();
        // A panicking provider only takes down this inner task.
        let mut call = tokio::spawn(async move { self.dispatch().await }.in_current_span());

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                call.abort();
                failed(CharsheetError::Cancelled)
            }
            joined = &mut call => joined.unwrap_or_else(panicked),
        };

        GenerationOutcome {
            status,
            started_at: Some(started_at),
            completed_at: Some(Utc::now()),
            duration_ms: Some(start.elapsed().as_millis() as u64),
            ..GenerationOutcome::pending(&selection)
        }
    }

    async fn dispatch(&self) -> OutcomeStatus {
        let provider = match self
            .registry
            .create_provider(&self.selection.provider_id, Some(&self.selection.model_id))
        {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(category = %e.category(), "provider unavailable: {e}");
                return failed(e);
            }
        };

        match tokio::time::timeout(self.timeout, provider.generate(&self.request)).await {
            Ok(result) => normalize(result),
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "selection timed out");
                failed(CharsheetError::Timeout(self.timeout))
            }
        }
    }
}

fn failed(err: CharsheetError) -> OutcomeStatus {
    OutcomeStatus::Failure {
        error: ProviderFailure::from(err),
    }
}

fn panicked(err: JoinError) -> OutcomeStatus {
    let detail = match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned()),
        Err(_) => None,
    };
    tracing::error!(detail = detail.as_deref(), "{PANIC_MESSAGE}");
    let message = match detail {
        Some(detail) => format!("{PANIC_MESSAGE}: {}", sanitize_error_message(&detail)),
        None => PANIC_MESSAGE.to_string(),
    };
    OutcomeStatus::Failure {
        error: ProviderFailure::new(ErrorCategory::Generic, message),
    }
}

/// Maps a provider result onto a terminal status holding exactly one image.
fn normalize(result: GenerationResult) -> OutcomeStatus {
    match result {
        GenerationResult::Success { mut images, .. } => {
            if images.is_empty() {
                return failed(CharsheetError::NoImageReturned(
                    "provider reported success without an image".into(),
                ));
            }
            images.truncate(1);
            OutcomeStatus::Success { images }
        }
        GenerationResult::Failure { failure, .. } => OutcomeStatus::Failure { error: failure },
    }
}
