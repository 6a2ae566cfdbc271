//! Upgrade Metrics
//!
//! Prometheus counters and a duration histogram for upgrade runs, kept in
//! a registry owned by the upgrader so several instances can coexist.

use super::UpgradePhase;
use crate::error::Result;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Result label for successful upgrades
pub const RESULT_SUCCESS: &str = "success";
/// Result label for failed upgrades
pub const RESULT_FAILURE: &str = "failure";

/// Metrics for the upgrade workflow
#[derive(Clone)]
pub struct UpgradeMetrics {
    registry: Registry,
    upgrades: IntCounterVec,
    failures: IntCounterVec,
    duration: Histogram,
}

impl UpgradeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let upgrades = IntCounterVec::new(
            Opts::new("pv_upgrade_total", "PV upgrades attempted, by result"),
            &["result"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new(
                "pv_upgrade_failures_total",
                "Failed PV upgrades, by the phase that failed",
            ),
            &["phase"],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "pv_upgrade_duration_seconds",
                "Wall time of PV upgrades, successful or not",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        )?;

        registry.register(Box::new(upgrades.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            upgrades,
            failures,
            duration,
        })
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.upgrades.with_label_values(&[RESULT_SUCCESS]).inc();
        self.duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_failure(&self, phase: UpgradePhase, elapsed: Duration) {
        self.upgrades.with_label_values(&[RESULT_FAILURE]).inc();
        self.failures.with_label_values(&[phase.as_str()]).inc();
        self.duration.observe(elapsed.as_secs_f64());
    }

    /// Number of upgrades recorded with the given result label
    pub fn upgrades(&self, result: &str) -> u64 {
        self.upgrades.with_label_values(&[result]).get()
    }

    /// Number of failures recorded in the given phase
    pub fn failures(&self, phase: UpgradePhase) -> u64 {
        self.failures.with_label_values(&[phase.as_str()]).get()
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_render() {
        let metrics = UpgradeMetrics::new().unwrap();
        metrics.record_success(Duration::from_secs(12));
        metrics.record_failure(UpgradePhase::AwaitingClaimLost, Duration::from_secs(30));

        assert_eq!(metrics.upgrades(RESULT_SUCCESS), 1);
        assert_eq!(metrics.upgrades(RESULT_FAILURE), 1);
        assert_eq!(metrics.failures(UpgradePhase::AwaitingClaimLost), 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("pv_upgrade_total{result=\"success\"} 1"));
        assert!(text.contains("pv_upgrade_failures_total{phase=\"awaiting_claim_lost\"} 1"));
        assert!(text.contains("pv_upgrade_duration_seconds_count 2"));
    }
}
