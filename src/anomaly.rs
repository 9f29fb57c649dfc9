// =============================================================================
// Anomaly detection — portfolio-value z-score and single-step moves
// =============================================================================
//
// Works over the trailing 24 hours of snapshot totals. Two independent
// checks that may both fire in the same tick:
//
//   - single-step: the latest step moved >= ANOMALY_SINGLE_STEP_PCT
//     (severity `high`; doubled threshold upgrades to `critical`)
//   - z-score: |z| of the latest total against the window mean/stddev
//     >= ANOMALY_Z_THRESHOLD (severity `warning`)
// =============================================================================

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::events::{topic, EventBus};
use crate::records::AlertRecord;
use crate::store::Store;
use crate::types::Severity;

pub struct AnomalyDetector {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    single_step_pct: f64,
    z_threshold: f64,
}

impl AnomalyDetector {
    pub fn new(config: &Config, store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            single_step_pct: config.anomaly_single_step_pct,
            z_threshold: config.anomaly_z_threshold,
        }
    }

    /// One detection pass. Returns the alerts raised (for tests).
    pub async fn run_check(&self) -> Vec<AlertRecord> {
        let snapshots = self
            .store
            .snapshots_since(Utc::now() - Duration::hours(24))
            .await
            .unwrap_or_default();
        if snapshots.len() < 2 {
            return Vec::new();
        }

        let totals: Vec<f64> = snapshots.iter().map(|s| s.total_value_usd()).collect();
        let mut raised = Vec::new();

        // Single-step move.
        let prev = totals[totals.len() - 2];
        let latest = totals[totals.len() - 1];
        if prev > 0.0 {
            let step_pct = (latest - prev) / prev * 100.0;
            if step_pct.abs() >= self.single_step_pct {
                let severity = if step_pct.abs() >= self.single_step_pct * 2.0 {
                    Severity::Critical
                } else {
                    Severity::High
                };
                let alert = AlertRecord::new(
                    "anomaly",
                    severity,
                    format!("portfolio moved {step_pct:.2}% in a single step"),
                )
                .with_data(serde_json::json!({
                    "check": "single_step",
                    "step_pct": step_pct,
                    "previous_usd": prev,
                    "latest_usd": latest,
                }));
                self.raise(&alert).await;
                raised.push(alert);
            }
        }

        // Z-score of the latest total against the 24h window.
        if totals.len() >= 3 {
            let n = totals.len() as f64;
            let mean = totals.iter().sum::<f64>() / n;
            let variance =
                totals.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let std = variance.sqrt();
            if std > 0.0 {
                let z = (latest - mean) / std;
                if z.abs() >= self.z_threshold {
                    let alert = AlertRecord::new(
                        "anomaly",
                        Severity::Warning,
                        format!("portfolio total is {z:.2} sigma from the 24h mean"),
                    )
                    .with_data(serde_json::json!({
                        "check": "z_score",
                        "z": z,
                        "mean_usd": mean,
                        "stddev_usd": std,
                        "latest_usd": latest,
                    }));
                    self.raise(&alert).await;
                    raised.push(alert);
                }
            }
        }

        if !raised.is_empty() {
            info!(count = raised.len(), "anomaly alerts raised");
        }
        raised
    }

    async fn raise(&self, alert: &AlertRecord) {
        if let Err(e) = self.store.record_alert(alert).await {
            warn!(error = %e, "anomaly alert not persisted");
        }
        self.bus
            .publish(topic::ALERT, serde_json::to_value(alert).unwrap_or_default());
    }
}
