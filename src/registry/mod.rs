//! Target registry and lifecycle status machine
//!
//! The registry is the single writer for target state. Workers hand it a
//! [`ScrapeResult`] after every check and it applies the status machine:
//!
//! * success resets the consecutive-error counter and re-activates a target
//!   that was parked in `ERROR`
//! * error and timeout outcomes increment the counter; at the configured
//!   threshold the target parks in `ERROR` and stops being scheduled
//! * a challenge outcome parks the target in `CAPTCHA_BLOCKED` without
//!   touching the error counter, since a challenge says nothing about the
//!   health of the scraper
//! * `PAUSED` is operator-owned; results never move a target out of it
//!
//! A bounded ring of [`CheckRecord`]s keeps the recent check history for
//! operator inspection.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::{CheckRecord, ScrapeResult, ScrapeStatus, Target, TargetStatus};

/// Outcome of applying one check result to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCheck {
    pub target_id: String,
    /// Status after the transition
    pub status: TargetStatus,
    pub consecutive_errors: u32,
    /// True when this check moved the target out of the schedulable set
    pub parked: bool,
}

/// In-memory target store with the lifecycle status machine
pub struct TargetRegistry {
    targets: RwLock<HashMap<String, Target>>,
    check_log: RwLock<VecDeque<CheckRecord>>,
    max_consecutive_errors: u32,
    check_log_size: usize,
}

impl TargetRegistry {
    pub fn new(max_consecutive_errors: u32, check_log_size: usize) -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            check_log: RwLock::new(VecDeque::new()),
            max_consecutive_errors,
            check_log_size,
        }
    }

    /// Insert or replace a target definition
    ///
    /// Runtime state (status, counters, timestamps) of an existing entry is
    /// preserved; only the definition fields are refreshed.
    pub async fn upsert(&self, incoming: Target) {
        let mut targets = self.targets.write().await;
        match targets.get_mut(&incoming.id) {
            Some(existing) => {
                existing.name = incoming.name;
                existing.class = incoming.class;
                existing.tier = incoming.tier;
                existing.domain = incoming.domain;
                existing.booking_url = incoming.booking_url;
                existing.check_interval_secs = incoming.check_interval_secs;
                existing.booking_capable = incoming.booking_capable;
            }
            None => {
                tracing::info!(target = %incoming.id, class = %incoming.class, "Target registered");
                targets.insert(incoming.id.clone(), incoming);
            }
        }
    }

    pub async fn get(&self, target_id: &str) -> Option<Target> {
        self.targets.read().await.get(target_id).cloned()
    }

    pub async fn all(&self) -> Vec<Target> {
        self.targets.read().await.values().cloned().collect()
    }

    /// Targets eligible for scheduling (status `ACTIVE`)
    pub async fn schedulable(&self) -> Vec<Target> {
        self.targets
            .read()
            .await
            .values()
            .filter(|t| t.status == TargetStatus::Active)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.targets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.targets.read().await.is_empty()
    }

    // ------------------------------------------------------------------------
    // Status machine
    // ------------------------------------------------------------------------

    /// Apply a check result, running the status machine
    ///
    /// Returns `None` for unknown targets. Results against a `PAUSED`
    /// target only update timestamps.
    pub async fn apply_result(
        &self,
        target_id: &str,
        result: &ScrapeResult,
    ) -> Option<AppliedCheck> {
        let mut targets = self.targets.write().await;
        let target = targets.get_mut(target_id)?;

        let now = Utc::now();
        target.last_checked_at = Some(now);
        if result.status == ScrapeStatus::SlotsFound {
            target.last_slot_found_at = Some(now);
        }

        let mut parked = false;
        if target.status != TargetStatus::Paused {
            match result.status {
                ScrapeStatus::Captcha => {
                    if target.status != TargetStatus::CaptchaBlocked {
                        tracing::warn!(
                            target = %target_id,
                            kind = ?result.challenge_kind,
                            "Target parked on unsolved challenge"
                        );
                        parked = true;
                    }
                    target.status = TargetStatus::CaptchaBlocked;
                }
                ScrapeStatus::Blocked => {
                    // Egress trouble, not target health; counter and status hold
                }
                status if status.is_counted_error() => {
                    target.consecutive_errors += 1;
                    if target.consecutive_errors >= self.max_consecutive_errors
                        && target.status == TargetStatus::Active
                    {
                        tracing::error!(
                            target = %target_id,
                            errors = target.consecutive_errors,
                            "Target parked after consecutive errors"
                        );
                        target.status = TargetStatus::Error;
                        parked = true;
                    }
                }
                _ => {
                    // Success path recovers ERROR and CAPTCHA_BLOCKED parks
                    target.consecutive_errors = 0;
                    if target.status != TargetStatus::Active {
                        tracing::info!(target = %target_id, "Target recovered, re-activating");
                    }
                    target.status = TargetStatus::Active;
                }
            }
        }

        let applied = AppliedCheck {
            target_id: target_id.to_string(),
            status: target.status,
            consecutive_errors: target.consecutive_errors,
            parked,
        };
        drop(targets);

        self.record_check(target_id, result).await;
        Some(applied)
    }

    /// Operator pause; results will not move the target until resumed
    pub async fn pause(&self, target_id: &str) -> bool {
        let mut targets = self.targets.write().await;
        match targets.get_mut(target_id) {
            Some(target) => {
                target.status = TargetStatus::Paused;
                tracing::info!(target = %target_id, "Target paused");
                true
            }
            None => false,
        }
    }

    /// Operator resume; clears the error counter and re-activates
    pub async fn resume(&self, target_id: &str) -> bool {
        let mut targets = self.targets.write().await;
        match targets.get_mut(target_id) {
            Some(target) => {
                target.status = TargetStatus::Active;
                target.consecutive_errors = 0;
                tracing::info!(target = %target_id, "Target resumed");
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Check log
    // ------------------------------------------------------------------------

    async fn record_check(&self, target_id: &str, result: &ScrapeResult) {
        let mut log = self.check_log.write().await;
        if log.len() >= self.check_log_size {
            log.pop_front();
        }
        log.push_back(CheckRecord {
            target_id: target_id.to_string(),
            status: result.status,
            slots_found: result.slots_available,
            response_time_ms: result.response_time_ms,
            error_message: result.error_message.clone(),
            checked_at: Utc::now(),
        });
    }

    /// Most recent checks, newest last
    pub async fn recent_checks(&self, limit: usize) -> Vec<CheckRecord> {
        let log = self.check_log.read().await;
        log.iter()
            .skip(log.len().saturating_sub(limit))
            .cloned()
            .collect()
    }
}
