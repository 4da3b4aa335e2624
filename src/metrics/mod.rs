//! Prometheus metrics
//!
//! Metrics are optional: recording helpers are no-ops until
//! [`init_metrics`] runs, so library users and unit tests pay nothing.
//! Registration failures are logged and leave the process on the no-op
//! path rather than aborting startup.

use std::sync::OnceLock;

use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
};

struct Metrics {
    registry: Registry,
    checks_total: IntCounterVec,
    check_duration_seconds: HistogramVec,
    notifications_total: IntCounterVec,
    dedup_suppressed_total: IntCounter,
    targets_parked_total: IntCounterVec,
    captcha_detected_total: IntCounterVec,
    captcha_solves_total: IntCounterVec,
    scheduled_jobs: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build() -> prometheus::Result<Metrics> {
    let registry = Registry::new();

    let checks_total = IntCounterVec::new(
        opts!("creneau_checks_total", "Completed checks by class and outcome"),
        &["class", "status"],
    )?;
    let check_duration_seconds = HistogramVec::new(
        histogram_opts!(
            "creneau_check_duration_seconds",
            "Wall-clock duration of one check",
            vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        ),
        &["class"],
    )?;
    let notifications_total = IntCounterVec::new(
        opts!("creneau_notifications_total", "Dispatched detections by target"),
        &["target"],
    )?;
    let dedup_suppressed_total = IntCounter::new(
        "creneau_dedup_suppressed_total",
        "Detections suppressed by the dedup gate",
    )?;
    let targets_parked_total = IntCounterVec::new(
        opts!("creneau_targets_parked_total", "Park transitions by reason"),
        &["reason"],
    )?;
    let captcha_detected_total = IntCounterVec::new(
        opts!("creneau_captcha_detected_total", "Challenges detected by kind"),
        &["kind"],
    )?;
    let captcha_solves_total = IntCounterVec::new(
        opts!("creneau_captcha_solves_total", "Challenge solve attempts by outcome"),
        &["outcome"],
    )?;
    let scheduled_jobs = IntGauge::new(
        "creneau_scheduled_jobs",
        "Repeating jobs currently on the board",
    )?;

    registry.register(Box::new(checks_total.clone()))?;
    registry.register(Box::new(check_duration_seconds.clone()))?;
    registry.register(Box::new(notifications_total.clone()))?;
    registry.register(Box::new(dedup_suppressed_total.clone()))?;
    registry.register(Box::new(targets_parked_total.clone()))?;
    registry.register(Box::new(captcha_detected_total.clone()))?;
    registry.register(Box::new(captcha_solves_total.clone()))?;
    registry.register(Box::new(scheduled_jobs.clone()))?;

    Ok(Metrics {
        registry,
        checks_total,
        check_duration_seconds,
        notifications_total,
        dedup_suppressed_total,
        targets_parked_total,
        captcha_detected_total,
        captcha_solves_total,
        scheduled_jobs,
    })
}

/// Initialize the metrics registry; idempotent
pub fn init_metrics() {
    if METRICS.get().is_some() {
        return;
    }
    match build() {
        Ok(metrics) => {
            let _ = METRICS.set(metrics);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Metrics registration failed, running without metrics");
        }
    }
}

/// Render the registry in the Prometheus text format
pub fn gather() -> String {
    let Some(m) = METRICS.get() else {
        return String::new();
    };
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode_to_string(&m.registry.gather())
        .unwrap_or_default()
}

pub fn record_check(class: &str, status: &str) {
    if let Some(m) = METRICS.get() {
        m.checks_total.with_label_values(&[class, status]).inc();
    }
}

pub fn observe_check_duration(class: &str, seconds: f64) {
    if let Some(m) = METRICS.get() {
        m.check_duration_seconds
            .with_label_values(&[class])
            .observe(seconds);
    }
}

pub fn record_notification(target_id: &str) {
    if let Some(m) = METRICS.get() {
        m.notifications_total.with_label_values(&[target_id]).inc();
    }
}

pub fn record_suppressed() {
    if let Some(m) = METRICS.get() {
        m.dedup_suppressed_total.inc();
    }
}

pub fn record_parked(reason: &str) {
    if let Some(m) = METRICS.get() {
        m.targets_parked_total.with_label_values(&[reason]).inc();
    }
}

pub fn record_captcha_detected(kind: &str) {
    if let Some(m) = METRICS.get() {
        m.captcha_detected_total.with_label_values(&[kind]).inc();
    }
}

pub fn record_captcha_solve(outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.captcha_solves_total.with_label_values(&[outcome]).inc();
    }
}

pub fn set_scheduled_jobs(count: i64) {
    if let Some(m) = METRICS.get() {
        m.scheduled_jobs.set(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_init_is_noop() {
        // Must not panic before init
        record_check("prefecture", "no_slots");
        record_notification("paris_75");
    }

    #[test]
    fn test_init_and_gather() {
        init_metrics();
        init_metrics(); // idempotent
        record_check("prefecture", "slots_found");
        record_parked("captcha");
        record_captcha_detected("recaptcha_v2");
        set_scheduled_jobs(4);
        let text = gather();
        assert!(text.contains("creneau_checks_total"));
        assert!(text.contains("creneau_captcha_detected_total"));
        assert!(text.contains("creneau_scheduled_jobs"));
    }
}
