//! # creneau
//!
//! Appointment-slot detection pipeline for rate-limited booking sites.
//!
//! Targets (prefectures, consulates, visa centers) are checked on repeating
//! jobs owned by a reconciled job board. Worker pools bounded per class run
//! each check through a cached session, an assigned proxy, and a hard
//! timeout, then feed the result into the target status machine. Positive
//! checks fan out to interested parties through a date-preference matcher
//! and a Redis-backed deduplication gate before any notification or
//! auto-booking request leaves the process.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler ──ensure/cancel──> JobBoard ──CheckJob──> WorkerPool (per class)
//!                                                          │
//!                       SessionManager ── ProxyPool ── ScrapeExecutor
//!                                                          │
//!                              TargetRegistry <── ScrapeResult
//!                                                          │
//!                     Dispatcher ── DedupGate ── Notification/Booking sinks
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use creneau::models::{Target, TargetClass, TargetTier};
//! use creneau::registry::TargetRegistry;
//!
//! # async fn demo() {
//! let registry = TargetRegistry::new(5, 500);
//! registry
//!     .upsert(
//!         Target::new("paris_75", "Paris", TargetClass::Prefecture, TargetTier::Critical)
//!             .with_domain("rdv.prefecture.example")
//!             .with_booking_url("https://rdv.prefecture.example/slots"),
//!     )
//!     .await;
//! # }
//! ```

pub mod captcha;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod interest;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod proxy;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod worker;

pub use config::Config;
pub use error::{CreneauErrorTrait, Error, ErrorCategory, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dedup::DedupGate;
    pub use crate::dispatch::Dispatcher;
    pub use crate::error::{CreneauErrorTrait, Error, ErrorCategory, Result};
    pub use crate::interest::PartyStore;
    pub use crate::models::{
        DatePreference, InterestedParty, ScrapeResult, ScrapeStatus, SlotDay, Target, TargetClass,
        TargetStatus, TargetTier,
    };
    pub use crate::registry::TargetRegistry;
    pub use crate::scheduler::{CheckJob, JobBoard, Reconciler};
    pub use crate::worker::{ScrapeExecutor, Worker, WorkerPool};
}
