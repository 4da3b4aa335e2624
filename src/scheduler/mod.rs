//! Repeating-job board and schedule reconciliation
//!
//! Each (target, sub-category) pair with active interest owns exactly one
//! repeating job. The [`JobBoard`] makes `ensure` idempotent: re-ensuring
//! with the same interval is a no-op, a changed interval replaces the job,
//! and `cancel` tears it down. Jobs emit [`CheckJob`]s onto the per-class
//! channels feeding the worker pools.
//!
//! The [`Reconciler`] periodically diffs the desired schedule (schedulable
//! targets with at least one active party, filtered through the bootstrap
//! allowlist) against the board, so crashes, expiries, and status changes
//! converge without any event needing to be observed live.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::BootstrapConfig;
use crate::error::{CreneauErrorTrait, ErrorCategory};
use crate::interest::PartyStore;
use crate::models::{Target, TargetClass};
use crate::registry::TargetRegistry;

/// One unit of work for a worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckJob {
    pub target_id: String,
    /// Procedure scope within the target; `None` covers the whole target
    pub sub_category: Option<String>,
    pub class: TargetClass,
}

/// Board key: one job per (target, sub-category)
pub type JobKey = (String, Option<String>);

/// Scheduling errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Worker pool channel for a class is gone
    #[error("job channel for class {0} is closed")]
    ChannelClosed(TargetClass),

    /// No channel registered for a class
    #[error("no worker pool registered for class {0}")]
    UnknownClass(TargetClass),
}

impl CreneauErrorTrait for SchedulerError {
    fn is_recoverable(&self) -> bool {
        false
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Scheduler
    }
}

// ============================================================================
// Job board
// ============================================================================

struct RepeatingJob {
    interval: Duration,
    handle: JoinHandle<()>,
}

impl Drop for RepeatingJob {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Owns the repeating jobs, one per (target, sub-category)
pub struct JobBoard {
    senders: HashMap<TargetClass, mpsc::Sender<CheckJob>>,
    jobs: Mutex<HashMap<JobKey, RepeatingJob>>,
}

impl JobBoard {
    pub fn new(senders: HashMap<TargetClass, mpsc::Sender<CheckJob>>) -> Self {
        Self {
            senders,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a repeating job exists for a (target, sub-category) at the
    /// given interval
    ///
    /// Idempotent: same interval is a no-op, a different interval replaces
    /// the job. The first tick fires immediately.
    pub async fn ensure(
        &self,
        target_id: &str,
        sub_category: Option<&str>,
        class: TargetClass,
        interval: Duration,
    ) -> Result<(), SchedulerError> {
        let sender = self
            .senders
            .get(&class)
            .ok_or(SchedulerError::UnknownClass(class))?
            .clone();

        let key: JobKey = (target_id.to_string(), sub_category.map(String::from));
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.get(&key) {
            if existing.interval == interval {
                return Ok(());
            }
            tracing::info!(
                target = %target_id,
                sub_category = ?sub_category,
                interval_secs = interval.as_secs(),
                "Rescheduling job at new interval"
            );
        } else {
            tracing::info!(
                target = %target_id,
                sub_category = ?sub_category,
                class = %class,
                interval_secs = interval.as_secs(),
                "Scheduling repeating job"
            );
        }

        let job = CheckJob {
            target_id: target_id.to_string(),
            sub_category: sub_category.map(String::from),
            class,
        };
        let handle = tokio::spawn(async move {
            // Spread simultaneous schedules so one site is not hit in lockstep
            let jitter_ms = interval.as_millis() as u64 / 10;
            if jitter_ms > 0 {
                use rand::Rng;
                let delay = rand::thread_rng().gen_range(0..=jitter_ms);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if sender.send(job.clone()).await.is_err() {
                    tracing::warn!(target = %job.target_id, "Worker channel closed, job stops");
                    break;
                }
            }
        });

        jobs.insert(key, RepeatingJob { interval, handle });
        Ok(())
    }

    /// Cancel the repeating job for a (target, sub-category), if any
    pub async fn cancel(&self, target_id: &str, sub_category: Option<&str>) -> bool {
        let key: JobKey = (target_id.to_string(), sub_category.map(String::from));
        let removed = self.jobs.lock().await.remove(&key).is_some();
        if removed {
            tracing::info!(
                target = %target_id,
                sub_category = ?sub_category,
                "Repeating job cancelled"
            );
        }
        removed
    }

    /// Keys currently on the board
    pub async fn scheduled(&self) -> Vec<JobKey> {
        self.jobs.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Abort every job, used on shutdown
    pub async fn clear(&self) {
        self.jobs.lock().await.clear();
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Diff applied by one reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Jobs ensured (new, rescheduled, or confirmed)
    pub ensured: usize,
    /// Stale jobs cancelled
    pub cancelled: usize,
}

/// Converges the job board toward the desired schedule
pub struct Reconciler {
    registry: Arc<TargetRegistry>,
    parties: Arc<dyn PartyStore>,
    board: Arc<JobBoard>,
    bootstrap: BootstrapConfig,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<TargetRegistry>,
        parties: Arc<dyn PartyStore>,
        board: Arc<JobBoard>,
        bootstrap: BootstrapConfig,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            parties,
            board,
            bootstrap,
            interval,
        }
    }

    /// Effective interval for a target under the bootstrap settings
    fn interval_for(&self, target: &Target) -> Duration {
        Duration::from_secs(
            self.bootstrap
                .effective_interval_secs(target.base_interval_secs()),
        )
    }

    /// One reconcile pass: ensure desired jobs, cancel the rest
    ///
    /// A job is desired per (target, sub-category) pair carrying active
    /// interest, so a procedure-scoped alert gets its own check cadence.
    pub async fn reconcile_once(&self) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let interest = self.parties.interest_summary().await;

        let schedulable: HashMap<String, Target> = self
            .registry
            .schedulable()
            .await
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        let mut desired: HashMap<JobKey, (TargetClass, Duration)> = HashMap::new();
        for ((target_id, sub_category), count) in &interest {
            if *count == 0 || !self.bootstrap.allows(target_id) {
                continue;
            }
            let Some(target) = schedulable.get(target_id) else {
                continue;
            };
            desired.insert(
                (target_id.clone(), sub_category.clone()),
                (target.class, self.interval_for(target)),
            );
        }

        for ((target_id, sub_category), (class, interval)) in &desired {
            match self
                .board
                .ensure(target_id, sub_category.as_deref(), *class, *interval)
                .await
            {
                Ok(()) => outcome.ensured += 1,
                Err(e) => tracing::error!(target = %target_id, error = %e, "Ensure failed"),
            }
        }

        for key in self.board.scheduled().await {
            if !desired.contains_key(&key) {
                self.board.cancel(&key.0, key.1.as_deref()).await;
                outcome.cancelled += 1;
            }
        }

        crate::metrics::set_scheduled_jobs(self.board.len().await as i64);
        tracing::debug!(
            ensured = outcome.ensured,
            cancelled = outcome.cancelled,
            "Reconcile pass complete"
        );
        outcome
    }

    /// Run the reconcile loop until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Reconciler stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::MemoryPartyStore;
    use crate::models::{InterestedParty, ScrapeResult, TargetTier};

    fn board_with_channel(
        class: TargetClass,
        capacity: usize,
    ) -> (Arc<JobBoard>, mpsc::Receiver<CheckJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        let board = Arc::new(JobBoard::new(HashMap::from([(class, tx)])));
        (board, rx)
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (board, _rx) = board_with_channel(TargetClass::Prefecture, 8);
        let interval = Duration::from_secs(60);
        board
            .ensure("t1", None, TargetClass::Prefecture, interval)
            .await
            .unwrap();
        board
            .ensure("t1", None, TargetClass::Prefecture, interval)
            .await
            .unwrap();
        assert_eq!(board.len().await, 1);
    }

    #[tokio::test]
    async fn test_sub_categories_get_separate_jobs() {
        let (board, _rx) = board_with_channel(TargetClass::Consulate, 8);
        let interval = Duration::from_secs(60);
        board
            .ensure("t1", None, TargetClass::Consulate, interval)
            .await
            .unwrap();
        board
            .ensure("t1", Some("long_stay_visa"), TargetClass::Consulate, interval)
            .await
            .unwrap();
        assert_eq!(board.len().await, 2);

        assert!(board.cancel("t1", Some("long_stay_visa")).await);
        assert_eq!(board.len().await, 1);
    }

    #[tokio::test]
    async fn test_ensure_unknown_class_fails() {
        let (board, _rx) = board_with_channel(TargetClass::Prefecture, 8);
        let err = board
            .ensure("t1", None, TargetClass::VisaCenter, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownClass(_)));
    }

    #[tokio::test]
    async fn test_job_emits_on_interval() {
        let (board, mut rx) = board_with_channel(TargetClass::Consulate, 8);
        board
            .ensure("t1", None, TargetClass::Consulate, Duration::from_millis(10))
            .await
            .unwrap();

        // Immediate first tick plus at least one repeat
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.target_id, "t1");
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.class, TargetClass::Consulate);
    }

    #[tokio::test]
    async fn test_cancel_stops_emission() {
        let (board, mut rx) = board_with_channel(TargetClass::Consulate, 64);
        board
            .ensure("t1", None, TargetClass::Consulate, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(board.cancel("t1", None).await);
        assert!(!board.cancel("t1", None).await);

        // Drain anything in flight, then the channel stays quiet
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    async fn reconciler_fixture() -> (Arc<TargetRegistry>, Arc<MemoryPartyStore>, Arc<JobBoard>, Reconciler)
    {
        let registry = Arc::new(TargetRegistry::new(3, 10));
        let parties = Arc::new(MemoryPartyStore::new());
        let (tx, _rx) = mpsc::channel(64);
        let board = Arc::new(JobBoard::new(HashMap::from([(TargetClass::Prefecture, tx)])));
        // Receiver leaks intentionally so the channel stays open
        std::mem::forget(_rx);
        let reconciler = Reconciler::new(
            registry.clone(),
            parties.clone(),
            board.clone(),
            BootstrapConfig::default(),
            Duration::from_secs(180),
        );
        (registry, parties, board, reconciler)
    }

    #[tokio::test]
    async fn test_reconcile_requires_interest() {
        let (registry, parties, board, reconciler) = reconciler_fixture().await;
        registry
            .upsert(Target::new("t1", "T1", TargetClass::Prefecture, TargetTier::High))
            .await;

        // No parties: nothing scheduled
        let outcome = reconciler.reconcile_once().await;
        assert_eq!(outcome.ensured, 0);
        assert!(board.is_empty().await);

        // Interest appears: job ensured
        parties.add(InterestedParty::new("a1", "t1")).await;
        let outcome = reconciler.reconcile_once().await;
        assert_eq!(outcome.ensured, 1);
        assert_eq!(board.scheduled().await, vec![("t1".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_reconcile_schedules_scoped_interest_separately() {
        let (registry, parties, board, reconciler) = reconciler_fixture().await;
        registry
            .upsert(Target::new("t1", "T1", TargetClass::Prefecture, TargetTier::High))
            .await;
        parties.add(InterestedParty::new("a1", "t1")).await;
        parties
            .add(InterestedParty::new("a2", "t1").with_sub_category("naturalisation"))
            .await;

        let outcome = reconciler.reconcile_once().await;
        assert_eq!(outcome.ensured, 2);
        let mut scheduled = board.scheduled().await;
        scheduled.sort();
        assert_eq!(
            scheduled,
            vec![
                ("t1".to_string(), None),
                ("t1".to_string(), Some("naturalisation".to_string())),
            ]
        );

        // The scoped alert lapses; only its job goes away
        parties.remove("a2").await;
        let outcome = reconciler.reconcile_once().await;
        assert_eq!(outcome.cancelled, 1);
        assert_eq!(board.scheduled().await, vec![("t1".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_reconcile_cancels_parked_targets() {
        let (registry, parties, board, reconciler) = reconciler_fixture().await;
        registry
            .upsert(Target::new("t1", "T1", TargetClass::Prefecture, TargetTier::High))
            .await;
        parties.add(InterestedParty::new("a1", "t1")).await;
        reconciler.reconcile_once().await;
        assert_eq!(board.len().await, 1);

        // Park the target; the next pass removes the job
        for _ in 0..3 {
            registry.apply_result("t1", &ScrapeResult::error("boom")).await;
        }
        let outcome = reconciler.reconcile_once().await;
        assert_eq!(outcome.cancelled, 1);
        assert!(board.is_empty().await);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (registry, parties, _board, reconciler) = reconciler_fixture().await;
        registry
            .upsert(Target::new("t1", "T1", TargetClass::Prefecture, TargetTier::High))
            .await;
        parties.add(InterestedParty::new("a1", "t1")).await;

        let first = reconciler.reconcile_once().await;
        let second = reconciler.reconcile_once().await;
        assert_eq!(first.ensured, 1);
        // Confirmed, not duplicated
        assert_eq!(second.ensured, 1);
        assert_eq!(second.cancelled, 0);
    }

    #[tokio::test]
    async fn test_reconcile_honors_bootstrap_allowlist() {
        let registry = Arc::new(TargetRegistry::new(3, 10));
        let parties = Arc::new(MemoryPartyStore::new());
        let (tx, _rx) = mpsc::channel(64);
        std::mem::forget(_rx);
        let board = Arc::new(JobBoard::new(HashMap::from([(TargetClass::Prefecture, tx)])));
        let bootstrap = BootstrapConfig {
            enabled: true,
            priority_targets: vec!["t1".to_string()],
            ..Default::default()
        };
        let reconciler = Reconciler::new(
            registry.clone(),
            parties.clone(),
            board.clone(),
            bootstrap,
            Duration::from_secs(180),
        );

        for id in ["t1", "t2"] {
            registry
                .upsert(Target::new(id, id, TargetClass::Prefecture, TargetTier::High))
                .await;
            parties.add(InterestedParty::new(&format!("a_{id}"), id)).await;
        }

        reconciler.reconcile_once().await;
        assert_eq!(board.scheduled().await, vec![("t1".to_string(), None)]);
    }
}
