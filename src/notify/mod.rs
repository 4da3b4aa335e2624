//! Outbound collaborator seams
//!
//! The pipeline never talks to users directly. Detections leave through
//! [`NotificationSink`], auto-booking requests through [`BookingSink`], and
//! operational incidents (challenge parks, error parks) through
//! [`OperatorAlert`]. [`LogNotifier`] implements all three over structured
//! logs and is the default wiring; [`WebhookAlert`] posts operator events
//! to an HTTP endpoint.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::captcha::ChallengeKind;

/// One detection addressed to one party
#[derive(Debug, Clone, Serialize)]
pub struct SlotNotification {
    pub target_id: String,
    pub target_name: String,
    pub party_id: String,
    pub slots_available: u32,
    pub slot_date: Option<NaiveDate>,
    pub slot_time: Option<String>,
    pub booking_url: Option<String>,
    pub detected_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver a detection to its party
    async fn deliver(&self, notification: &SlotNotification) -> anyhow::Result<()>;
}

/// Auto-booking request for the earliest acceptable slot
#[derive(Debug, Clone, Serialize)]
pub struct BookingRequest {
    pub target_id: String,
    pub party_id: String,
    pub date: NaiveDate,
    pub time: Option<String>,
    pub booking_url: Option<String>,
}

/// What the booking collaborator did with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    /// Slot secured, confirmation reference attached
    Booked { confirmation: String },
    /// Slot was gone by the time the request landed
    Gone,
}

#[async_trait]
pub trait BookingSink: Send + Sync {
    async fn book(&self, request: &BookingRequest) -> anyhow::Result<BookingOutcome>;
}

/// Operational incidents needing a human
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OperatorEvent {
    /// Target parked on a challenge no solver can handle
    ChallengeBlocked {
        target_id: String,
        target_name: String,
        kind: Option<ChallengeKind>,
    },
    /// Target parked after exhausting the error budget
    ErrorParked {
        target_id: String,
        target_name: String,
        consecutive_errors: u32,
        last_error: Option<String>,
    },
}

#[async_trait]
pub trait OperatorAlert: Send + Sync {
    async fn alert(&self, event: &OperatorEvent) -> anyhow::Result<()>;
}

// ============================================================================
// Log sink
// ============================================================================

/// Structured-log implementation of every outbound seam
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn deliver(&self, n: &SlotNotification) -> anyhow::Result<()> {
        tracing::info!(
            target = %n.target_id,
            party = %n.party_id,
            slots = n.slots_available,
            date = ?n.slot_date,
            time = ?n.slot_time,
            "Slot detection dispatched"
        );
        Ok(())
    }
}

#[async_trait]
impl BookingSink for LogNotifier {
    async fn book(&self, request: &BookingRequest) -> anyhow::Result<BookingOutcome> {
        tracing::info!(
            target = %request.target_id,
            party = %request.party_id,
            date = %request.date,
            time = ?request.time,
            "Auto-booking requested (log sink, not executed)"
        );
        Ok(BookingOutcome::Gone)
    }
}

#[async_trait]
impl OperatorAlert for LogNotifier {
    async fn alert(&self, event: &OperatorEvent) -> anyhow::Result<()> {
        match event {
            OperatorEvent::ChallengeBlocked {
                target_id, kind, ..
            } => {
                tracing::error!(target = %target_id, kind = ?kind, "OPERATOR: challenge block");
            }
            OperatorEvent::ErrorParked {
                target_id,
                consecutive_errors,
                last_error,
                ..
            } => {
                tracing::error!(
                    target = %target_id,
                    errors = consecutive_errors,
                    last_error = ?last_error,
                    "OPERATOR: target parked on errors"
                );
            }
        }
        Ok(())
    }
}

// ============================================================================
// Webhook operator alerts
// ============================================================================

/// Posts operator events as JSON to a webhook (`OPERATOR_WEBHOOK_URL`)
pub struct WebhookAlert {
    url: String,
    client: reqwest::Client,
}

impl WebhookAlert {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var("OPERATOR_WEBHOOK_URL")
            .ok()
            .map(|url| Self::new(&url))
    }
}

#[async_trait]
impl OperatorAlert for WebhookAlert {
    async fn alert(&self, event: &OperatorEvent) -> anyhow::Result<()> {
        let response = self.client.post(&self.url).json(event).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}
