// =============================================================================
// Profit-taking scanner — proposes selling surplus above the baseline
// =============================================================================
//
// For each core asset with a baseline and a recorded average buy price: if
// the holding exceeds the baseline and the price has gained at least the
// configured percentage over that average, create a pending approval for
// the surplus. At most one open profit-taking approval per symbol.
//
// The average buy price is owner-supplied baseline metadata, not derived
// from fills.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::events::{topic, EventBus};
use crate::records::Approval;
use crate::store::Store;
use crate::types::{Side, CORE_SYMBOLS};

pub struct ProfitScanner {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    min_gain_pct: f64,
    fee_rate: f64,
}

impl ProfitScanner {
    pub fn new(config: &Config, store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            min_gain_pct: config.profit_taking_min_gain_pct,
            fee_rate: config.fee_rate,
        }
    }

    /// One scan pass. Returns the approvals created.
    pub async fn scan(&self) -> Vec<Approval> {
        let Ok(Some(snapshot)) = self.store.latest_snapshot().await else {
            return Vec::new();
        };
        let baselines = self.store.list_baselines().await.unwrap_or_default();

        let mut created = Vec::new();
        for symbol in CORE_SYMBOLS {
            let Some(baseline) = baselines.iter().find(|b| b.symbol == symbol) else {
                continue;
            };
            let Some(avg_buy) = baseline.avg_buy_price.filter(|p| *p > 0.0) else {
                continue;
            };
            let holding = snapshot.balances.get(symbol).copied().unwrap_or(0.0);
            let surplus = holding - baseline.baseline;
            if surplus <= 0.0 {
                continue;
            }
            let Some(price) = snapshot.prices.get(symbol).copied().filter(|p| *p > 0.0)
            else {
                continue;
            };

            let gain_pct = (price - avg_buy) / avg_buy * 100.0;
            if gain_pct < self.min_gain_pct {
                continue;
            }

            // One outstanding proposal per symbol.
            match self.store.has_open_approval("profit_taking", symbol).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "profit scan skipped: approvals unreadable");
                    return created;
                }
            }

            let estimated_net_usd = surplus * price * (1.0 - self.fee_rate);
            let mut approval = Approval::new(
                "profit_taking",
                format!("{symbol} profit-taking {gain_pct:.0}%"),
            );
            approval.symbol = Some(symbol.to_string());
            approval.amount = Some(surplus);
            approval.summary = format!(
                "{surplus} {symbol} above baseline, up {gain_pct:.1}% over avg buy {avg_buy}"
            );
            approval.metadata = serde_json::json!({
                "intent": {
                    "side": Side::Sell,
                    "symbol": symbol,
                    "qty": surplus,
                    "recommended_sell_qty": surplus,
                },
                "gain_pct": gain_pct,
                "avg_buy_price": avg_buy,
                "estimated_net_usd": estimated_net_usd,
                "estimated_value_usd": surplus * price,
            });

            match self.store.create_approval(&approval).await {
                Ok(()) => {
                    info!(
                        symbol,
                        surplus,
                        gain_pct,
                        estimated_net_usd,
                        "profit-taking approval created"
                    );
                    self.bus.publish(
                        topic::APPROVAL_CREATED,
                        serde_json::to_value(&approval).unwrap_or_default(),
                    );
                    created.push(approval);
                }
                Err(e) => warn!(symbol, error = %e, "profit-taking approval not persisted"),
            }
        }
        created
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Baseline, Snapshot};
    use std::collections::BTreeMap;

    async fn scanner() -> (ProfitScanner, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_async(dir.path().join("t.db").to_str().unwrap()).await);
        let bus = Arc::new(EventBus::default());
        let scanner = ProfitScanner::new(&Config::default(), store.clone(), bus);
        (scanner, store, dir)
    }

    async fn seed(store: &Store, qty: f64, price: f64, baseline: f64, avg_buy: Option<f64>) {
        let mut balances = BTreeMap::new();
        balances.insert("XRP".to_string(), qty);
        let mut prices = BTreeMap::new();
        prices.insert("XRP".to_string(), price);
        store
            .insert_snapshot(&Snapshot::new(balances, prices, "test"))
            .await
            .unwrap();
        store
            .upsert_baseline(&Baseline {
                symbol: "XRP".to_string(),
                baseline,
                auto_increment_on_deposit: false,
                min_tokens: Some(10.0),
                avg_buy_price: avg_buy,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn surplus_with_sufficient_gain_creates_approval() {
        let (scanner, _store, _dir) = scanner().await;
        // 12.14 XRP at 0.5, baseline 10, avg buy 0.40 => 25% gain on 2.14.
        seed(&_store, 12.14, 0.5, 10.0, Some(0.40)).await;

        let created = scanner.scan().await;
        assert_eq!(created.len(), 1);
        let approval = &created[0];
        assert_eq!(approval.title, "XRP profit-taking 25%");
        assert!(
            (approval.metadata["intent"]["recommended_sell_qty"].as_f64().unwrap() - 2.14).abs()
                < 1e-9
        );
        let est = approval.metadata["estimated_net_usd"].as_f64().unwrap();
        assert!((est - 2.14 * 0.5 * (1.0 - 0.006)).abs() < 1e-6);
        assert!((est - 1.064).abs() < 0.001);
    }

    #[tokio::test]
    async fn below_threshold_gain_is_ignored() {
        let (scanner, store, _dir) = scanner().await;
        // Only 10% up.
        seed(&store, 12.14, 0.44, 10.0, Some(0.40)).await;
        assert!(scanner.scan().await.is_empty());
    }

    #[tokio::test]
    async fn no_surplus_means_no_proposal() {
        let (scanner, store, _dir) = scanner().await;
        seed(&store, 10.0, 0.5, 10.0, Some(0.40)).await;
        assert!(scanner.scan().await.is_empty());
    }

    #[tokio::test]
    async fn missing_avg_buy_price_is_skipped() {
        let (scanner, store, _dir) = scanner().await;
        seed(&store, 12.14, 0.5, 10.0, None).await;
        assert!(scanner.scan().await.is_empty());
    }

    #[tokio::test]
    async fn one_open_proposal_per_symbol() {
        let (scanner, store, _dir) = scanner().await;
        seed(&store, 12.14, 0.5, 10.0, Some(0.40)).await;
        assert_eq!(scanner.scan().await.len(), 1);
        // A second pass while the first approval is still pending is a no-op.
        assert!(scanner.scan().await.is_empty());
        assert_eq!(store.list_approvals(None, 10).await.unwrap().len(), 1);
    }
}
