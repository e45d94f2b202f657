//! Batch orchestration: windows of concurrent lead analyses.
//!
//! ## Flow per batch
//!
//! 1. Take the next window; its size is the controller's current value, re-read each time
//! 2. Fan out the window (one task per lead, start times staggered)
//! 3. Per lead: cache lookup, then scoring on a miss, then write-through and persistence
//! 4. Feed the window's observations back to the controller
//! 5. Pause, then repeat until no leads are left or the caller cancels
//!
//! Scoring calls from every batch on one orchestrator share a semaphore sized to the
//! configured maximum concurrency, so concurrent batches cannot exceed it together.
//!
//! A lead's failure is always recorded as a failed [`AnalyzedLead`]; only an empty input
//! aborts the call.

use crate::cache_store::{CacheStore, LeadIdentity};
use crate::concurrency::{ConcurrencyController, WindowStats};
use crate::config::PipelineConfig;
use crate::errors::{AppError, ScoringError};
use crate::models::{
    AnalyzedLead, BatchResponse, BatchStats, Lead, SessionContext, SessionDelta, SessionStatus,
};
use crate::persistence::{LeadRecord, PersistenceSink};
use crate::scoring_client::LeadScorer;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// The slice of `items` starting at `start`, at most `size` long (a size of 0 counts as 1).
pub fn next_window<T>(items: &[T], start: usize, size: usize) -> &[T] {
    let start = start.min(items.len());
    let end = start.saturating_add(size.max(1)).min(items.len());
    &items[start..end]
}

/// Splits `items` into consecutive windows of `size`; the last one may be shorter.
pub fn split_windows<T>(items: &[T], size: usize) -> Vec<&[T]> {
    let mut windows = Vec::new();
    let mut start = 0;
    while start < items.len() {
        let window = next_window(items, start, size);
        start += window.len();
        windows.push(window);
    }
    windows
}

/// One lead's outcome plus the signals the controller and counters need.
#[derive(Debug, Clone)]
struct LeadOutcome {
    analyzed: AnalyzedLead,
    rate_limited: bool,
    server_error: bool,
}

impl LeadOutcome {
    fn ok(analyzed: AnalyzedLead) -> Self {
        Self {
            analyzed,
            rate_limited: false,
            server_error: false,
        }
    }

    fn failed(lead: Lead, error: &ScoringError, model_used: Option<String>) -> Self {
        Self {
            analyzed: AnalyzedLead::failed(lead, error.kind(), error.to_string(), model_used),
            rate_limited: matches!(error, ScoringError::RateLimitExceeded { .. }),
            server_error: matches!(error, ScoringError::ServerError { .. }),
        }
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a spawned task needs to process one lead.
#[derive(Clone)]
struct LeadWorker {
    scorer: Arc<dyn LeadScorer>,
    cache: Arc<dyn CacheStore>,
    sink: Option<Arc<dyn PersistenceSink>>,
    gate: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl LeadWorker {
    async fn process(&self, lead: Lead, session: Option<SessionContext>) -> LeadOutcome {
        let outcome = {
            // Never closed, so the permit is always granted
            let _permit = self.gate.acquire().await.ok();
            let _guard = InFlightGuard::enter(&self.in_flight);
            self.analyze(lead).await
        };
        self.persist(&outcome.analyzed, session).await;
        outcome
    }

    async fn analyze(&self, lead: Lead) -> LeadOutcome {
        if let Err(problems) = lead.validate() {
            let error = ScoringError::InvalidLead(problems.join("; "));
            tracing::warn!("Skipping invalid lead '{}': {}", lead.business_name, error);
            return LeadOutcome::failed(lead, &error, None);
        }

        let identity = LeadIdentity::from_lead(&lead);

        match self.cache.lookup(&identity).await {
            Ok(Some(hit)) => {
                tracing::debug!(
                    "Cache hit for '{}' (cached at {})",
                    lead.business_name,
                    hit.cached_at
                );
                return LeadOutcome::ok(AnalyzedLead::cached(lead, hit.analysis));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    "Cache lookup failed for '{}', treating as miss: {}",
                    lead.business_name,
                    e
                );
            }
        }

        let scored = self.scorer.score(&lead).await;
        match scored.result {
            Ok(analysis) => {
                if let Err(e) = self
                    .cache
                    .store(&identity, &lead.maps_url, &analysis, Utc::now())
                    .await
                {
                    tracing::warn!("Cache write failed for '{}': {}", lead.business_name, e);
                }
                LeadOutcome::ok(AnalyzedLead::scored(lead, analysis, scored.model_used))
            }
            Err(error) => LeadOutcome::failed(lead, &error, Some(scored.model_used)),
        }
    }

    async fn persist(&self, analyzed: &AnalyzedLead, session: Option<SessionContext>) {
        let (Some(sink), Some(session)) = (&self.sink, session) else {
            return;
        };

        let record = LeadRecord::from_outcome(&session, analyzed);
        if let Err(e) = sink.persist(&record).await {
            tracing::error!(
                "Failed to persist outcome for '{}': {}",
                analyzed.lead.business_name,
                e
            );
        }
    }
}

/// Drives a list of leads through cache, scoring and persistence.
pub struct BatchOrchestrator {
    worker: LeadWorker,
    config: PipelineConfig,
}

impl BatchOrchestrator {
    pub fn new(
        scorer: Arc<dyn LeadScorer>,
        cache: Arc<dyn CacheStore>,
        sink: Option<Arc<dyn PersistenceSink>>,
        config: PipelineConfig,
    ) -> Self {
        let max_in_flight = config.concurrency.normalized().max;
        Self {
            worker: LeadWorker {
                scorer,
                cache,
                sink,
                gate: Arc::new(Semaphore::new(max_in_flight)),
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
            config,
        }
    }

    /// Scoring calls currently running across all batches on this orchestrator.
    pub fn in_flight(&self) -> usize {
        self.worker.in_flight.load(Ordering::SeqCst)
    }

    /// Analyzes a single lead through the same cache/score/persist path as a batch.
    pub async fn analyze_one(&self, lead: Lead, session: Option<SessionContext>) -> AnalyzedLead {
        self.worker.process(lead, session).await.analyzed
    }

    /// Processes every lead and returns outcomes in completion order.
    ///
    /// Cancelling `cancel` stops the run between windows; the window in flight finishes.
    pub async fn process(
        &self,
        leads: Vec<Lead>,
        session: Option<SessionContext>,
        cancel: CancellationToken,
    ) -> Result<BatchResponse, AppError> {
        if leads.is_empty() {
            return Err(AppError::NoLeads);
        }

        let total = leads.len();
        let mut controller = ConcurrencyController::new(self.config.concurrency);
        let mut stats = BatchStats {
            total,
            ..Default::default()
        };
        let mut results = Vec::with_capacity(total);

        tracing::info!(
            "Starting batch of {} leads (concurrency {})",
            total,
            controller.current()
        );
        self.report(
            session,
            SessionDelta {
                total,
                status: Some(SessionStatus::Processing),
                ..Default::default()
            },
        )
        .await;

        let mut next = 0;
        while next < total {
            if cancel.is_cancelled() {
                tracing::info!("Batch cancelled with {} leads not dispatched", total - next);
                stats.cancelled = true;
                break;
            }

            let window = next_window(&leads, next, controller.current());
            next += window.len();
            stats.windows += 1;

            let outcomes = self.run_window(window, session).await;

            let mut window_stats = WindowStats::default();
            let mut delta = SessionDelta::default();
            for outcome in outcomes {
                let success = outcome.analyzed.success;
                window_stats.record(success, outcome.rate_limited);
                delta.processed += 1;
                if success {
                    stats.successful += 1;
                    delta.successful += 1;
                    if outcome.analyzed.from_cache {
                        stats.cached += 1;
                    }
                } else {
                    stats.failed += 1;
                    delta.failed += 1;
                }
                if outcome.rate_limited {
                    stats.rate_limit_errors += 1;
                }
                if outcome.server_error {
                    stats.server_errors += 1;
                }
                results.push(outcome.analyzed);
            }

            tracing::info!(
                "Window {} done: {}/{} leads processed ({} ok, {} failed)",
                stats.windows,
                next,
                total,
                delta.successful,
                delta.failed
            );

            controller.observe(window_stats);
            self.report(session, delta).await;

            if next < total {
                self.pause(&cancel, self.config.inter_batch_delay).await;
            }
        }

        stats.final_concurrency = controller.current();
        stats.finalize_rates();

        if !stats.cancelled {
            let status = if stats.successful == 0 {
                SessionStatus::Error
            } else {
                SessionStatus::Completed
            };
            self.report(
                session,
                SessionDelta {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await;
        }

        tracing::info!(
            "Batch finished: {} ok, {} failed, {} from cache, success rate {:.2}",
            stats.successful,
            stats.failed,
            stats.cached,
            stats.success_rate
        );

        Ok(BatchResponse { stats, results })
    }

    async fn run_window(
        &self,
        window: &[Lead],
        session: Option<SessionContext>,
    ) -> Vec<LeadOutcome> {
        let mut tasks = JoinSet::new();

        for (slot, lead) in window.iter().enumerate() {
            let worker = self.worker.clone();
            let stagger = self.config.inter_request_delay * slot as u32;
            let lead = lead.clone();

            tasks.spawn(async move {
                if !stagger.is_zero() {
                    tokio::time::sleep(stagger).await;
                }
                (slot, worker.process(lead, session).await)
            });
        }

        let mut outcomes = Vec::with_capacity(window.len());
        let mut finished = vec![false; window.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, outcome)) => {
                    finished[slot] = true;
                    outcomes.push(outcome);
                }
                Err(e) => tracing::error!("Lead task failed: {}", e),
            }
        }

        // A task that panicked still yields a failed, persisted outcome for its lead
        for (lead, _) in window.iter().zip(finished).filter(|(_, done)| !done) {
            let error = ScoringError::ConnectionError("analysis task aborted".to_string());
            let outcome = LeadOutcome::failed(lead.clone(), &error, None);
            self.worker.persist(&outcome.analyzed, session).await;
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn report(&self, session: Option<SessionContext>, delta: SessionDelta) {
        let (Some(sink), Some(session)) = (&self.worker.sink, session) else {
            return;
        };
        if let Err(e) = sink.report_session(&session, &delta).await {
            tracing::warn!("Failed to update session {}: {}", session.session_id, e);
        }
    }

    async fn pause(&self, cancel: &CancellationToken, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }
}
