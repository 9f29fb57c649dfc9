// =============================================================================
// Learning loop — periodic user-preference recomputation
// =============================================================================
//
// Aggregates up to 5000 recent decided approvals and executions into a
// preferences record. Failure is non-fatal: a failed pass logs and leaves
// the previous preferences in place.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::records::{ApprovalStatus, Preferences};
use crate::store::Store;

/// Maximum decisions considered per pass.
const SAMPLE_LIMIT: usize = 5000;

/// Profit target assumed until enough profit-taking decisions exist.
const DEFAULT_PROFIT_TARGET_PCT: f64 = 25.0;

pub struct LearningEngine {
    store: Arc<Store>,
}

impl LearningEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// One recomputation pass. Returns the new preferences when the pass
    /// produced any signal.
    pub async fn recompute(&self) -> Option<Preferences> {
        let approvals = match self.store.list_approvals(None, SAMPLE_LIMIT).await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "learning pass skipped: approvals unreadable");
                return None;
            }
        };
        let executions = match self.store.recent_executions(SAMPLE_LIMIT).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "learning pass skipped: executions unreadable");
                return None;
            }
        };

        let decided: Vec<_> = approvals
            .iter()
            .filter(|a| a.status.is_terminal())
            .collect();
        let sample_size = (decided.len() + executions.len()) as u64;
        if sample_size == 0 {
            return None;
        }

        // Approval rate: decided approvals that went through.
        let accepted = decided
            .iter()
            .filter(|a| {
                matches!(
                    a.status,
                    ApprovalStatus::Approved
                        | ApprovalStatus::Executed
                        | ApprovalStatus::Simulated
                )
            })
            .count();
        let approval_rate = if decided.is_empty() {
            0.0
        } else {
            accepted as f64 / decided.len() as f64
        };

        // Risk tolerance: appetite for live (non-simulated) execution,
        // blended with how often proposals are accepted.
        let live_share = if executions.is_empty() {
            0.0
        } else {
            executions.iter().filter(|e| !e.dry_run).count() as f64 / executions.len() as f64
        };
        let risk_tolerance = (0.5 * approval_rate + 0.5 * live_share).clamp(0.0, 1.0);

        // Favorite symbol: most traded, approvals breaking ties.
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for e in &executions {
            *counts.entry(e.symbol.as_str()).or_default() += 1;
        }
        for a in &decided {
            if let Some(sym) = a.symbol.as_deref() {
                *counts.entry(sym).or_default() += 1;
            }
        }
        let favorite_symbol = counts
            .into_iter()
            .max_by_key(|(_, n)| *n)
            .map(|(sym, _)| sym.to_string());

        // Preferred profit target from accepted profit-taking decisions.
        let gains: Vec<f64> = decided
            .iter()
            .filter(|a| a.kind == "profit_taking")
            .filter_map(|a| a.metadata["gain_pct"].as_f64())
            .collect();
        let preferred_profit_target = if gains.is_empty() {
            DEFAULT_PROFIT_TARGET_PCT
        } else {
            gains.iter().sum::<f64>() / gains.len() as f64
        };

        let prefs = Preferences {
            risk_tolerance,
            preferred_profit_target,
            approval_rate,
            favorite_symbol,
            confidence: (sample_size as f64 / 100.0).min(1.0),
            sample_size,
            updated_at: Utc::now(),
        };

        if let Err(e) = self.store.upsert_preferences(&prefs).await {
            warn!(error = %e, "preferences not persisted — keeping previous");
            return None;
        }
        info!(
            sample_size,
            approval_rate,
            confidence = prefs.confidence,
            "preferences recomputed"
        );
        Some(prefs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Approval, ExecutionRecord};
    use crate::types::{OrderMode, Side};

    async fn engine() -> (LearningEngine, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_async(dir.path().join("t.db").to_str().unwrap()).await);
        (LearningEngine::new(store.clone()), store, dir)
    }

    fn execution(symbol: &str, dry_run: bool) -> ExecutionRecord {
        ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            approval_id: None,
            rule_id: None,
            side: Side::Sell,
            symbol: symbol.to_string(),
            amount: 1.0,
            mode: OrderMode::Market,
            order_id: Some(uuid::Uuid::new_v4().to_string()),
            status: "filled".to_string(),
            filled_qty: Some(1.0),
            avg_fill_price: Some(1.0),
            dry_run,
            executed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_history_yields_no_preferences() {
        let (engine, store, _dir) = engine().await;
        assert!(engine.recompute().await.is_none());
        assert!(store.read_preferences().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn aggregates_decisions_into_preferences() {
        let (engine, store, _dir) = engine().await;

        // Three decided approvals: two accepted, one declined.
        for (i, target) in [
            ApprovalStatus::Executed,
            ApprovalStatus::Simulated,
            ApprovalStatus::Declined,
        ]
        .iter()
        .enumerate()
        {
            let mut a = Approval::new("trade", format!("t{i}"));
            a.symbol = Some("XRP".to_string());
            store.create_approval(&a).await.unwrap();
            if *target == ApprovalStatus::Executed {
                store
                    .update_approval_status(&a.id, ApprovalStatus::Approved, "owner")
                    .await
                    .unwrap();
            }
            store
                .update_approval_status(&a.id, *target, "owner")
                .await
                .unwrap();
        }

        // Executions: mostly XRP, one BTC; half live.
        store.append_execution(&execution("XRP", false)).await.unwrap();
        store.append_execution(&execution("XRP", true)).await.unwrap();
        store.append_execution(&execution("BTC", false)).await.unwrap();

        let prefs = engine.recompute().await.unwrap();
        assert_eq!(prefs.sample_size, 6);
        assert!((prefs.approval_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(prefs.favorite_symbol.as_deref(), Some("XRP"));
        assert!((prefs.confidence - 0.06).abs() < 1e-9);
        assert!(prefs.risk_tolerance > 0.0 && prefs.risk_tolerance <= 1.0);

        // Persisted for the rest of the system.
        assert!(store.read_preferences().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn profit_target_comes_from_accepted_profit_taking() {
        let (engine, store, _dir) = engine().await;
        let mut a = Approval::new("profit_taking", "XRP profit-taking 30%");
        a.symbol = Some("XRP".to_string());
        a.metadata = serde_json::json!({ "gain_pct": 30.0 });
        store.create_approval(&a).await.unwrap();
        store
            .update_approval_status(&a.id, ApprovalStatus::Simulated, "owner")
            .await
            .unwrap();

        let prefs = engine.recompute().await.unwrap();
        assert!((prefs.preferred_profit_target - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn confidence_caps_at_one() {
        let (engine, store, _dir) = engine().await;
        for _ in 0..120 {
            store.append_execution(&execution("BTC", true)).await.unwrap();
        }
        let prefs = engine.recompute().await.unwrap();
        assert!((prefs.confidence - 1.0).abs() < 1e-9);
    }
}
