//! Core data structures for the detection pipeline
//!
//! The types here are the shared vocabulary between the scheduler, worker
//! pools, dispatcher, and the external collaborator traits: monitored
//! [`Target`]s, the [`InterestedParty`] projections that drive scheduling,
//! and the [`ScrapeResult`] value returned by every check.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

// ============================================================================
// Targets
// ============================================================================

/// Class of a monitored booking endpoint
///
/// Each class runs in its own worker pool with its own concurrency bound,
/// since execution cost differs wildly (browser-driven visa centers vs.
/// plain HTTP consulate APIs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetClass {
    Prefecture,
    Consulate,
    VisaCenter,
}

impl TargetClass {
    /// All classes, in pool-startup order
    pub const ALL: [TargetClass; 3] = [
        TargetClass::Prefecture,
        TargetClass::Consulate,
        TargetClass::VisaCenter,
    ];

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prefecture => "prefecture",
            Self::Consulate => "consulate",
            Self::VisaCenter => "visa_center",
        }
    }
}

impl std::fmt::Display for TargetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority bucket driving the default check interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetTier {
    /// Highest-demand endpoints (checked every 30s by default)
    Critical,
    /// Major-city endpoints (60s)
    High,
    /// Everything else (120s)
    Standard,
}

impl TargetTier {
    /// Default check interval for this tier, in seconds
    pub fn default_interval_secs(&self) -> u64 {
        match self {
            Self::Critical => 30,
            Self::High => 60,
            Self::Standard => 120,
        }
    }
}

/// Lifecycle status of a monitored target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetStatus {
    /// Being checked on schedule
    Active,
    /// Manually paused by an operator
    Paused,
    /// Parked after too many consecutive errors
    Error,
    /// Parked on an unsolvable challenge, pending manual intervention
    CaptchaBlocked,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Error => "ERROR",
            Self::CaptchaBlocked => "CAPTCHA_BLOCKED",
        }
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A monitored booking endpoint
///
/// Created by configuration sync, mutated only by the worker pool after each
/// check. Targets are never deleted, only paused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Stable identifier, e.g. `paris_75` or `vfs-italy-del`
    pub id: String,

    /// Human-readable name for notifications and operator alerts
    pub name: String,

    /// Target class (selects the worker pool)
    pub class: TargetClass,

    /// Priority tier (drives the default check interval)
    pub tier: TargetTier,

    /// Domain used for proxy failure isolation
    pub domain: String,

    /// Public booking page URL
    pub booking_url: String,

    /// Current lifecycle status
    pub status: TargetStatus,

    /// Consecutive error/timeout results since the last success
    pub consecutive_errors: u32,

    /// Explicit check interval override in seconds (tier default when None)
    pub check_interval_secs: Option<u64>,

    /// Whether the booking collaborator can act on this target
    pub booking_capable: bool,

    /// Last time a check completed, success or failure
    pub last_checked_at: Option<DateTime<Utc>>,

    /// Last time a check found open slots
    pub last_slot_found_at: Option<DateTime<Utc>>,
}

impl Target {
    /// Create a new active target with tier-default interval
    pub fn new(id: &str, name: &str, class: TargetClass, tier: TargetTier) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            class,
            tier,
            domain: String::new(),
            booking_url: String::new(),
            status: TargetStatus::Active,
            consecutive_errors: 0,
            check_interval_secs: None,
            booking_capable: false,
            last_checked_at: None,
            last_slot_found_at: None,
        }
    }

    /// Set the egress domain
    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    /// Set the booking page URL
    pub fn with_booking_url(mut self, url: &str) -> Self {
        self.booking_url = url.to_string();
        self
    }

    /// Mark as booking-capable
    pub fn with_booking(mut self) -> Self {
        self.booking_capable = true;
        self
    }

    /// Set an explicit interval override
    pub fn with_interval(mut self, secs: u64) -> Self {
        self.check_interval_secs = Some(secs);
        self
    }

    /// Base check interval before bootstrap adjustment
    pub fn base_interval_secs(&self) -> u64 {
        self.check_interval_secs
            .unwrap_or_else(|| self.tier.default_interval_secs())
    }
}

// ============================================================================
// Interested Parties
// ============================================================================

/// Date-window preference of an interested party
///
/// An unset bound on a given side is always satisfied; `Earliest` accepts
/// any date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum DatePreference {
    Earliest,
    After {
        date: NaiveDate,
    },
    Before {
        date: NaiveDate,
    },
    Between {
        after: Option<NaiveDate>,
        before: Option<NaiveDate>,
    },
}

impl DatePreference {
    /// Check whether a slot date satisfies this preference
    pub fn accepts(&self, date: NaiveDate) -> bool {
        match self {
            Self::Earliest => true,
            Self::After { date: after } => date >= *after,
            Self::Before { date: before } => date <= *before,
            Self::Between { after, before } => {
                let after_ok = after.map_or(true, |a| date >= a);
                let before_ok = before.map_or(true, |b| date <= b);
                after_ok && before_ok
            }
        }
    }
}

impl Default for DatePreference {
    fn default() -> Self {
        Self::Earliest
    }
}

/// A user alert or booking client wanting notification for a target
///
/// Owned by upstream collaborators; the pipeline treats parties as a
/// read-only projection fetched per job. Running counters are mutated
/// through the party store, never on this value directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterestedParty {
    /// Stable party identifier (alert id or client id)
    pub id: String,

    /// Target this party watches
    pub target_id: String,

    /// Optional sub-category (procedure / service / visa type)
    pub sub_category: Option<String>,

    /// Acceptable date window
    pub date_preference: DatePreference,

    /// Whether the booking collaborator should act on detections
    pub auto_book: bool,

    /// Interest expiry; `None` means open-ended
    pub expires_at: Option<DateTime<Utc>>,

    /// Running counter: total slots seen in dispatched detections
    pub slots_found: u64,

    /// Running counter: notifications emitted for this party
    pub notifications_sent: u64,
}

impl InterestedParty {
    /// Create a party with open-ended interest and default preference
    pub fn new(id: &str, target_id: &str) -> Self {
        Self {
            id: id.to_string(),
            target_id: target_id.to_string(),
            sub_category: None,
            date_preference: DatePreference::Earliest,
            auto_book: false,
            expires_at: None,
            slots_found: 0,
            notifications_sent: 0,
        }
    }

    /// Set the sub-category
    pub fn with_sub_category(mut self, sub: &str) -> Self {
        self.sub_category = Some(sub.to_string());
        self
    }

    /// Set the date preference
    pub fn with_preference(mut self, pref: DatePreference) -> Self {
        self.date_preference = pref;
        self
    }

    /// Enable auto-booking
    pub fn with_auto_book(mut self) -> Self {
        self.auto_book = true;
        self
    }

    /// Set interest expiry
    pub fn with_expiry(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Whether interest is still live at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Ephemeral per-target credential bundle (CSRF token + cookies)
///
/// Never used past `fetched_at + ttl`; invalidated unconditionally on an
/// authentication-expiry signal from the scrape executor.
#[derive(Debug, Clone)]
pub struct Session {
    /// CSRF or API token extracted from the landing page
    pub token: String,

    /// Cookie header value accumulated during the handshake
    pub cookies: String,

    /// Monotonic fetch instant, for TTL checks
    pub fetched_at: Instant,
}

impl Session {
    pub fn new(token: &str, cookies: &str) -> Self {
        Self {
            token: token.to_string(),
            cookies: cookies.to_string(),
            fetched_at: Instant::now(),
        }
    }

    /// Age of this session
    pub fn age(&self) -> std::time::Duration {
        self.fetched_at.elapsed()
    }
}

// ============================================================================
// Scrape Results
// ============================================================================

/// Outcome class of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    SlotsFound,
    NoSlots,
    Captcha,
    Blocked,
    Timeout,
    Error,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlotsFound => "slots_found",
            Self::NoSlots => "no_slots",
            Self::Captcha => "captcha",
            Self::Blocked => "blocked",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }

    /// Whether this outcome counts toward the consecutive-error threshold
    pub fn is_counted_error(&self) -> bool {
        matches!(self, Self::Error | Self::Timeout)
    }
}

impl std::fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Open slots on one date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDay {
    pub date: NaiveDate,
    /// Times in `HH:MM`, sorted ascending by the producer
    pub times: Vec<String>,
}

impl SlotDay {
    pub fn new(date: NaiveDate, times: Vec<&str>) -> Self {
        Self {
            date,
            times: times.into_iter().map(String::from).collect(),
        }
    }
}

/// Immutable outcome of one check against one target
///
/// Returned by the scrape executor and consumed exactly once by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub status: ScrapeStatus,

    /// Total open slots detected (0 unless `slots_found`)
    pub slots_available: u32,

    /// Per-date availability, earliest first; may be empty even on
    /// `slots_found` for sites that only expose a count
    pub available_dates: Vec<SlotDay>,

    /// Challenge kind when `status == Captcha`, for operator alerts
    pub challenge_kind: Option<crate::captcha::ChallengeKind>,

    /// Final booking URL (after redirects) to include in notifications
    pub booking_url: Option<String>,

    /// Wall-clock duration of the check
    pub response_time_ms: u64,

    pub error_message: Option<String>,
}

impl ScrapeResult {
    fn base(status: ScrapeStatus) -> Self {
        Self {
            status,
            slots_available: 0,
            available_dates: Vec::new(),
            challenge_kind: None,
            booking_url: None,
            response_time_ms: 0,
            error_message: None,
        }
    }

    /// Positive result with per-date availability
    pub fn slots_found(dates: Vec<SlotDay>) -> Self {
        let slots_available = dates.iter().map(|d| d.times.len().max(1) as u32).sum();
        Self {
            slots_available,
            available_dates: dates,
            ..Self::base(ScrapeStatus::SlotsFound)
        }
    }

    pub fn no_slots() -> Self {
        Self::base(ScrapeStatus::NoSlots)
    }

    pub fn captcha(kind: Option<crate::captcha::ChallengeKind>) -> Self {
        Self {
            challenge_kind: kind,
            ..Self::base(ScrapeStatus::Captcha)
        }
    }

    pub fn blocked() -> Self {
        Self::base(ScrapeStatus::Blocked)
    }

    pub fn timeout() -> Self {
        Self::base(ScrapeStatus::Timeout)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::base(ScrapeStatus::Error)
        }
    }

    /// Set the response time
    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = ms;
        self
    }

    /// Set the booking URL
    pub fn with_booking_url(mut self, url: &str) -> Self {
        self.booking_url = Some(url.to_string());
        self
    }

    /// Earliest advertised slot, if any
    pub fn first_slot(&self) -> Option<(NaiveDate, Option<&str>)> {
        self.available_dates
            .first()
            .map(|d| (d.date, d.times.first().map(String::as_str)))
    }

    /// Identity of the detected opening, used in the dedup key
    ///
    /// `date|time` of the earliest slot, `date|` for date-only sites, or
    /// `any` when the site only exposes a count.
    pub fn slot_signature(&self) -> String {
        match self.first_slot() {
            Some((date, Some(time))) => format!("{date}|{time}"),
            Some((date, None)) => format!("{date}|"),
            None => "any".to_string(),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Audit record of one completed check, kept in the registry's ring log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecord {
    pub target_id: String,
    pub status: ScrapeStatus,
    pub slots_found: u32,
    pub response_time_ms: u64,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// One emitted notification, kept for audit and date-prediction features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub id: uuid::Uuid,
    pub target_id: String,
    pub party_id: String,
    pub slots_available: u32,
    pub slot_date: Option<NaiveDate>,
    pub slot_time: Option<String>,
    pub booking_url: Option<String>,
    pub detected_at: DateTime<Utc>,
}
