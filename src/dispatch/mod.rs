//! Detection matching and dispatch
//!
//! A positive check fans out to every active party matching the check's
//! (target, sub-category) scope. For each party the dispatcher filters the
//! advertised dates through the party's
//! date preference, picks the best acceptable slot (earliest date, then
//! earliest time), and passes the detection through the dedup gate before
//! anything leaves the process. Auto-booking parties on booking-capable
//! targets additionally get a booking request for that slot.
//!
//! Sites that only expose a count (no dates) match every party; the slot
//! identity degrades to the target-wide `any` signature.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::RwLock;

use crate::dedup::DedupGate;
use crate::interest::PartyStore;
use crate::models::{DatePreference, DispatchRecord, ScrapeResult, SlotDay, Target};
use crate::notify::{BookingOutcome, BookingRequest, BookingSink, NotificationSink, SlotNotification};

/// Best acceptable slot under a preference: earliest date, earliest time
pub fn select_best_slot(
    dates: &[SlotDay],
    preference: &DatePreference,
) -> Option<(NaiveDate, Option<String>)> {
    dates
        .iter()
        .filter(|d| preference.accepts(d.date))
        .min_by_key(|d| d.date)
        .map(|d| (d.date, d.times.iter().min().cloned()))
}

/// Tally of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Notifications delivered
    pub notified: usize,
    /// Detections suppressed by the dedup gate
    pub suppressed: usize,
    /// Parties whose preference matched no advertised date
    pub unmatched: usize,
    /// Booking requests that secured a slot
    pub booked: usize,
}

/// Fans detections out to parties through the gate and sinks
pub struct Dispatcher {
    parties: Arc<dyn PartyStore>,
    gate: Arc<dyn DedupGate>,
    notifications: Arc<dyn NotificationSink>,
    booking: Arc<dyn BookingSink>,
    records: RwLock<VecDeque<DispatchRecord>>,
    record_capacity: usize,
}

impl Dispatcher {
    pub fn new(
        parties: Arc<dyn PartyStore>,
        gate: Arc<dyn DedupGate>,
        notifications: Arc<dyn NotificationSink>,
        booking: Arc<dyn BookingSink>,
    ) -> Self {
        Self {
            parties,
            gate,
            notifications,
            booking,
            records: RwLock::new(VecDeque::new()),
            record_capacity: 1000,
        }
    }

    /// Dispatch one positive check result to parties in its scope
    pub async fn dispatch(
        &self,
        target: &Target,
        sub_category: Option<&str>,
        result: &ScrapeResult,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let parties = self.parties.parties_for(&target.id, sub_category).await;
        if parties.is_empty() {
            tracing::debug!(target = %target.id, "Slots found but nobody is watching");
            return summary;
        }

        for party in parties {
            let slot = if result.available_dates.is_empty() {
                // Count-only site, every party matches
                None
            } else {
                match select_best_slot(&result.available_dates, &party.date_preference) {
                    Some(slot) => Some(slot),
                    None => {
                        summary.unmatched += 1;
                        continue;
                    }
                }
            };

            let signature = match &slot {
                Some((date, Some(time))) => format!("{date}|{time}"),
                Some((date, None)) => format!("{date}|"),
                None => "any".to_string(),
            };

            if !self.gate.first_seen(&target.id, &party.id, &signature).await {
                summary.suppressed += 1;
                continue;
            }

            let (slot_date, slot_time) = match slot {
                Some((date, time)) => (Some(date), time),
                None => (None, None),
            };

            let notification = SlotNotification {
                target_id: target.id.clone(),
                target_name: target.name.clone(),
                party_id: party.id.clone(),
                slots_available: result.slots_available,
                slot_date,
                slot_time: slot_time.clone(),
                booking_url: result
                    .booking_url
                    .clone()
                    .or_else(|| Some(target.booking_url.clone()).filter(|u| !u.is_empty())),
                detected_at: Utc::now(),
            };

            if let Err(e) = self.notifications.deliver(&notification).await {
                tracing::error!(
                    target = %target.id,
                    party = %party.id,
                    error = %e,
                    "Notification delivery failed"
                );
                continue;
            }
            summary.notified += 1;
            crate::metrics::record_notification(&target.id);

            self.parties
                .record_dispatch(&party.id, result.slots_available)
                .await;
            self.push_record(&notification).await;

            if party.auto_book && target.booking_capable {
                if let Some(date) = notification.slot_date {
                    summary.booked += self
                        .try_book(target, &party.id, date, slot_time, &notification.booking_url)
                        .await;
                }
            }
        }

        summary
    }

    async fn try_book(
        &self,
        target: &Target,
        party_id: &str,
        date: NaiveDate,
        time: Option<String>,
        booking_url: &Option<String>,
    ) -> usize {
        let request = BookingRequest {
            target_id: target.id.clone(),
            party_id: party_id.to_string(),
            date,
            time,
            booking_url: booking_url.clone(),
        };
        match self.booking.book(&request).await {
            Ok(BookingOutcome::Booked { confirmation }) => {
                tracing::info!(
                    target = %target.id,
                    party = %party_id,
                    confirmation = %confirmation,
                    "Auto-booking succeeded"
                );
                1
            }
            Ok(BookingOutcome::Gone) => {
                tracing::info!(target = %target.id, party = %party_id, "Slot gone before booking");
                0
            }
            Err(e) => {
                tracing::error!(target = %target.id, party = %party_id, error = %e, "Booking failed");
                0
            }
        }
    }

    async fn push_record(&self, notification: &SlotNotification) {
        let mut records = self.records.write().await;
        if records.len() >= self.record_capacity {
            records.pop_front();
        }
        records.push_back(DispatchRecord {
            id: uuid::Uuid::new_v4(),
            target_id: notification.target_id.clone(),
            party_id: notification.party_id.clone(),
            slots_available: notification.slots_available,
            slot_date: notification.slot_date,
            slot_time: notification.slot_time.clone(),
            booking_url: notification.booking_url.clone(),
            detected_at: notification.detected_at,
        });
    }

    /// Most recent dispatch records, newest last
    pub async fn recent_records(&self, limit: usize) -> Vec<DispatchRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .skip(records.len().saturating_sub(limit))
            .cloned()
            .collect()
    }
}
