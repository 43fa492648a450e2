//! Metrics definitions for the conference client.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cc_` prefix
//! - `_total` suffix for counters
//!
//! Labels are bounded: `state` (4 signaling states), `scope` (publisher,
//! subscriber), `role` (publisher, subscriber), `reason` (disconnected,
//! join_blocked). The library only records through the `metrics` facade;
//! installing an exporter is up to the embedding application.

use common::types::QualitySetting;
use metrics::{counter, gauge};

// ============================================================================
// Signaling
// ============================================================================

/// Metric: `cc_signaling_state_transitions_total`
/// Labels: `state`
pub fn record_signaling_state(state: &'static str) {
    counter!("cc_signaling_state_transitions_total", "state" => state).increment(1);
}

/// Metric: `cc_heartbeat_timeouts_total`
pub fn record_heartbeat_timeout() {
    counter!("cc_heartbeat_timeouts_total").increment(1);
}

// ============================================================================
// Quality & Connections
// ============================================================================

/// Set the current quality limit of a backoff controller.
///
/// Metric: `cc_quality_limit` (0 = off .. 3 = high)
/// Labels: `scope`
pub fn set_quality_limit(scope: &'static str, limit: QualitySetting) {
    let level = match limit {
        QualitySetting::Off => 0.0,
        QualitySetting::Low => 1.0,
        QualitySetting::Medium => 2.0,
        QualitySetting::High => 3.0,
    };
    gauge!("cc_quality_limit", "scope" => scope).set(level);
}

/// Metric: `cc_connections_active`
/// Labels: `role`
pub fn set_connections_active(role: &'static str, count: usize) {
    // usize to f64 conversion is safe for realistic connection counts
    #[allow(clippy::cast_precision_loss)]
    let count = count as f64;
    gauge!("cc_connections_active", "role" => role).set(count);
}

/// Record one aggregated statistics sample.
///
/// Metrics: `cc_upstream_bitrate_bps`, `cc_downstream_bitrate_bps`,
/// `cc_upstream_loss_ratio`
pub fn set_transport_stats(upstream_bps: u64, downstream_bps: u64, upstream_loss: f64) {
    // u64 to f64 conversion is safe for realistic bitrates (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    let (upstream, downstream) = (upstream_bps as f64, downstream_bps as f64);
    gauge!("cc_upstream_bitrate_bps").set(upstream);
    gauge!("cc_downstream_bitrate_bps").set(downstream);
    gauge!("cc_upstream_loss_ratio").set(upstream_loss);
}

/// Metric: `cc_stats_poll_failures_total`
pub fn record_stats_poll_failure() {
    counter!("cc_stats_poll_failures_total").increment(1);
}

// ============================================================================
// Session
// ============================================================================

/// Metric: `cc_rejoin_attempts_total`
/// Labels: `reason`
pub fn record_rejoin_attempt(reason: &'static str) {
    counter!("cc_rejoin_attempts_total", "reason" => reason).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    fn capture(f: impl FnOnce()) -> Vec<(String, DebugValue)> {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, f);
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| (key.key().name().to_string(), value))
            .collect()
    }

    #[test]
    fn test_quality_limit_gauge_levels() {
        let recorded = capture(|| set_quality_limit("publisher", QualitySetting::Medium));
        let (name, value) = recorded.first().unwrap();
        assert_eq!(name, "cc_quality_limit");
        match value {
            DebugValue::Gauge(v) => assert!((v.0 - 2.0).abs() < f64::EPSILON),
            other => unreachable!("expected gauge, got {other:?}"),
        }
    }

    #[test]
    fn test_counters_increment() {
        let recorded = capture(|| {
            record_heartbeat_timeout();
            record_heartbeat_timeout();
        });
        assert_eq!(recorded.len(), 1);
        assert!(matches!(recorded.first(), Some((_, DebugValue::Counter(2)))));
    }

    #[test]
    fn test_transport_stats_records_three_gauges() {
        let recorded = capture(|| set_transport_stats(800_000, 2_400_000, 0.01));
        let mut names: Vec<_> = recorded.iter().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec![
                "cc_downstream_bitrate_bps",
                "cc_upstream_bitrate_bps",
                "cc_upstream_loss_ratio"
            ]
        );
    }

    #[test]
    fn test_labelled_metrics_record() {
        let recorded = capture(|| {
            record_signaling_state("connected");
            set_connections_active("subscriber", 3);
            record_rejoin_attempt("disconnected");
            record_stats_poll_failure();
        });
        assert_eq!(recorded.len(), 4);
    }
}
