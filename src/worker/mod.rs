//! Worker pools and the per-check job flow
//!
//! One pool per target class, each bounded by its own semaphore. A job
//! flows through six steps: load the target, confirm someone is still
//! watching, take the single-flight slot, acquire a session, execute the
//! scrape (with one refresh-and-retry on an auth expiry), then apply the
//! result to the registry and dispatch any detection. Interest is
//! re-checked at execution time so a lapsed alert never costs an external
//! request. A slow check can never overlap itself; the next tick simply
//! finds the in-flight marker and skips.

pub mod http;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, mpsc, Mutex, Semaphore};
use tokio::time::Instant;

use crate::dispatch::Dispatcher;
use crate::interest::PartyStore;
use crate::models::{ScrapeResult, ScrapeStatus, Session, Target, TargetStatus};
use crate::notify::{OperatorAlert, OperatorEvent};
use crate::proxy::{ProxyEndpoint, ProxyPool};
use crate::registry::{AppliedCheck, TargetRegistry};
use crate::scheduler::CheckJob;
use crate::session::SessionManager;

/// Failures surfaced by a scrape executor
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Session rejected by the site (419/422); refresh and retry once
    #[error("session rejected by site")]
    AuthExpired,

    /// Anything else; becomes an error result and counts toward the budget
    #[error("{0}")]
    Failed(String),
}

/// Site-specific check execution
#[async_trait]
pub trait ScrapeExecutor: Send + Sync {
    async fn execute(
        &self,
        target: &Target,
        session: &Session,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<ScrapeResult, ExecutionError>;
}

/// How one job ended, for logs and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Check ran and its result was applied
    Completed(AppliedCheck),
    /// A check for this target was already in flight
    SkippedInflight,
    /// Target is no longer schedulable (paused or parked since enqueue)
    SkippedStatus,
    /// No active party is watching this scope anymore
    SkippedNoInterest,
    /// Target vanished from the registry
    UnknownTarget,
}

/// Shared per-check logic, used by every pool
pub struct Worker {
    registry: Arc<TargetRegistry>,
    parties: Arc<dyn PartyStore>,
    sessions: Arc<SessionManager>,
    proxies: Arc<ProxyPool>,
    dispatcher: Arc<Dispatcher>,
    operator: Arc<dyn OperatorAlert>,
    executor: Arc<dyn ScrapeExecutor>,
    check_timeout: Duration,
    inflight: Mutex<HashSet<String>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TargetRegistry>,
        parties: Arc<dyn PartyStore>,
        sessions: Arc<SessionManager>,
        proxies: Arc<ProxyPool>,
        dispatcher: Arc<Dispatcher>,
        operator: Arc<dyn OperatorAlert>,
        executor: Arc<dyn ScrapeExecutor>,
        check_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            parties,
            sessions,
            proxies,
            dispatcher,
            operator,
            executor,
            check_timeout,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Run one check end to end
    pub async fn process_job(&self, job: &CheckJob) -> JobOutcome {
        let Some(target) = self.registry.get(&job.target_id).await else {
            tracing::warn!(target = %job.target_id, "Job for unknown target dropped");
            return JobOutcome::UnknownTarget;
        };
        if target.status != TargetStatus::Active {
            tracing::debug!(target = %target.id, status = %target.status, "Skipping inactive target");
            return JobOutcome::SkippedStatus;
        }

        // Interest may have lapsed between scheduling and execution
        let sub_category = job.sub_category.as_deref();
        if self
            .parties
            .parties_for(&target.id, sub_category)
            .await
            .is_empty()
        {
            tracing::debug!(
                target = %target.id,
                sub_category = ?sub_category,
                "Nobody watching anymore, skipping check"
            );
            return JobOutcome::SkippedNoInterest;
        }

        // Single-flight per target
        {
            let mut inflight = self.inflight.lock().await;
            if !inflight.insert(target.id.clone()) {
                tracing::debug!(target = %target.id, "Check already in flight, skipping tick");
                return JobOutcome::SkippedInflight;
            }
        }

        let outcome = self.checked_run(&target, sub_category).await;

        self.inflight.lock().await.remove(&target.id);
        outcome
    }

    async fn checked_run(&self, target: &Target, sub_category: Option<&str>) -> JobOutcome {
        let started = Instant::now();
        let proxy = self.proxies.next_for(&target.domain);
        let result = self.run_check(target, proxy.as_ref()).await;
        let elapsed = started.elapsed();
        let result = ScrapeResult {
            response_time_ms: elapsed.as_millis() as u64,
            ..result
        };

        if let Some(endpoint) = &proxy {
            match result.status {
                ScrapeStatus::SlotsFound | ScrapeStatus::NoSlots => {
                    self.proxies.report_success(&endpoint.id, &target.domain);
                }
                _ => {
                    self.proxies.report_failure(&endpoint.id, &target.domain);
                }
            }
        }

        crate::metrics::record_check(target.class.as_str(), result.status.as_str());
        crate::metrics::observe_check_duration(target.class.as_str(), elapsed.as_secs_f64());

        let Some(applied) = self.registry.apply_result(&target.id, &result).await else {
            return JobOutcome::UnknownTarget;
        };

        if applied.parked {
            self.alert_park(target, &result, &applied).await;
        }

        if result.status == ScrapeStatus::SlotsFound {
            let summary = self.dispatcher.dispatch(target, sub_category, &result).await;
            for _ in 0..summary.suppressed {
                crate::metrics::record_suppressed();
            }
            tracing::info!(
                target = %target.id,
                slots = result.slots_available,
                notified = summary.notified,
                suppressed = summary.suppressed,
                "Detection processed"
            );
        }

        JobOutcome::Completed(applied)
    }

    /// Session, execution, timeout, and the single auth retry
    async fn run_check(&self, target: &Target, proxy: Option<&ProxyEndpoint>) -> ScrapeResult {
        let session = match self.sessions.acquire(target).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(target = %target.id, error = %e, "Session acquisition failed");
                return ScrapeResult::error(format!("session: {e}"));
            }
        };

        match self.execute_with_timeout(target, &session, proxy).await {
            Ok(result) => result,
            Err(ExecutionError::AuthExpired) => {
                tracing::debug!(target = %target.id, "Session rejected, refreshing once");
                let session = match self.sessions.refresh(target).await {
                    Ok(session) => session,
                    Err(e) => return ScrapeResult::error(format!("session refresh: {e}")),
                };
                match self.execute_with_timeout(target, &session, proxy).await {
                    Ok(result) => result,
                    Err(ExecutionError::AuthExpired) => {
                        ScrapeResult::error("session rejected after refresh")
                    }
                    Err(ExecutionError::Failed(msg)) => ScrapeResult::error(msg),
                }
            }
            Err(ExecutionError::Failed(msg)) => ScrapeResult::error(msg),
        }
    }

    async fn execute_with_timeout(
        &self,
        target: &Target,
        session: &Session,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<ScrapeResult, ExecutionError> {
        match tokio::time::timeout(
            self.check_timeout,
            self.executor.execute(target, session, proxy),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    target = %target.id,
                    timeout_secs = self.check_timeout.as_secs(),
                    "Check timed out"
                );
                Ok(ScrapeResult::timeout())
            }
        }
    }

    async fn alert_park(&self, target: &Target, result: &ScrapeResult, applied: &AppliedCheck) {
        let event = match applied.status {
            TargetStatus::CaptchaBlocked => {
                crate::metrics::record_parked("captcha");
                OperatorEvent::ChallengeBlocked {
                    target_id: target.id.clone(),
                    target_name: target.name.clone(),
                    kind: result.challenge_kind,
                }
            }
            TargetStatus::Error => {
                crate::metrics::record_parked("errors");
                OperatorEvent::ErrorParked {
                    target_id: target.id.clone(),
                    target_name: target.name.clone(),
                    consecutive_errors: applied.consecutive_errors,
                    last_error: result.error_message.clone(),
                }
            }
            _ => return,
        };
        if let Err(e) = self.operator.alert(&event).await {
            tracing::error!(target = %target.id, error = %e, "Operator alert failed");
        }
    }
}

/// Consumes one class channel with bounded concurrency
pub struct WorkerPool {
    worker: Arc<Worker>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(worker: Arc<Worker>, concurrency: usize) -> Self {
        Self {
            worker,
            concurrency: concurrency.max(1),
        }
    }

    /// Pump jobs until the channel closes or shutdown is signalled
    pub async fn run(&self, mut jobs: mpsc::Receiver<CheckJob>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        loop {
            tokio::select! {
                maybe_job = jobs.recv() => {
                    let Some(job) = maybe_job else {
                        tracing::info!("Job channel closed, pool stopping");
                        break;
                    };
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let worker = self.worker.clone();
                    tokio::spawn(async move {
                        worker.process_job(&job).await;
                        drop(permit);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Worker pool stopping");
                        break;
                    }
                }
            }
        }
    }
}
