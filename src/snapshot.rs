// =============================================================================
// Snapshot Engine — periodic balance + price capture
// =============================================================================
//
// Each tick: fetch balances and collateral, price the union of held and
// baselined symbols, filter to assets that matter, seed baselines on first
// run, persist the snapshot, and publish `portfolio:updated`.
//
// Failure policy: any fetch error records a warning alert and skips the
// tick. There are no retries within a tick; the next tick starts clean.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::broker::Brokerage;
use crate::events::{topic, EventBus};
use crate::records::{AlertRecord, Baseline, Snapshot};
use crate::store::Store;
use crate::types::{Severity, XRP_MIN_TOKENS};

// =============================================================================
// 24h deltas
// =============================================================================

/// Change of one symbol's position over the trailing 24 hours.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolDelta {
    pub symbol: String,
    pub qty: f64,
    pub qty_delta: f64,
    pub price: f64,
    pub price_delta_pct: f64,
}

// =============================================================================
// Engine
// =============================================================================

pub struct SnapshotEngine {
    broker: Arc<dyn Brokerage>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
}

impl SnapshotEngine {
    pub fn new(broker: Arc<dyn Brokerage>, store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self { broker, store, bus }
    }

    /// Capture one snapshot. Returns `None` when the tick was skipped
    /// (fetch failure or degraded storage); the alert trail records why.
    pub async fn capture(&self, reason: &str) -> Option<Snapshot> {
        let previous = self.store.latest_snapshot().await.unwrap_or(None);
        // 1. Balances.
        let balances = match self.broker.fetch_balances().await {
            Ok(b) => b,
            Err(e) => {
                self.skip_tick("balance fetch failed", &e.to_string()).await;
                return None;
            }
        };

        // 2. Collateral (needed for the asset filter and the risk loops).
        let collateral = match self.broker.fetch_collateral().await {
            Ok(c) => c,
            Err(e) => {
                self.skip_tick("collateral fetch failed", &e.to_string()).await;
                return None;
            }
        };
        if let Err(e) = self.store.replace_collateral(&collateral).await {
            warn!(error = %e, "collateral not persisted — continuing");
        }

        let baselines = self.store.list_baselines().await.unwrap_or_default();

        // 3. Price the union of held and baselined symbols.
        let mut symbols: Vec<String> = balances.keys().cloned().collect();
        for b in &baselines {
            if !symbols.contains(&b.symbol) {
                symbols.push(b.symbol.clone());
            }
        }
        let prices = match self.broker.fetch_prices(&symbols).await {
            Ok(p) => p,
            Err(e) => {
                self.skip_tick("price fetch failed", &e.to_string()).await;
                return None;
            }
        };

        // 4. Filter: keep assets with holdings, locked collateral, or a
        // baseline floor.
        let baseline_of = |sym: &str| {
            baselines
                .iter()
                .find(|b| b.symbol == sym)
                .map(|b| b.baseline)
                .unwrap_or(0.0)
        };
        let locked_of = |sym: &str| {
            collateral
                .iter()
                .filter(|c| c.symbol == sym)
                .map(|c| c.locked_qty)
                .sum::<f64>()
        };

        let mut kept: BTreeMap<String, f64> = BTreeMap::new();
        for (sym, entry) in &balances {
            let total = entry.qty + entry.locked;
            if total > 0.0 || locked_of(sym) > 0.0 || baseline_of(sym) > 0.0 {
                kept.insert(sym.clone(), total);
            }
        }

        let kept_prices: BTreeMap<String, f64> = prices
            .iter()
            .filter(|(sym, _)| kept.contains_key(*sym))
            .map(|(sym, p)| (sym.clone(), *p))
            .collect();

        // 5. First-run baseline seeding; afterwards, deposits raise
        // auto-incrementing baselines.
        if baselines.is_empty() {
            self.seed_baselines(&kept).await;
        } else if let Some(prev) = &previous {
            self.record_deposits(prev, &kept, &baselines).await;
        }

        let snapshot = Snapshot::new(kept, kept_prices, reason);

        // 6. Persist, then fan out.
        if let Err(e) = self.store.insert_snapshot(&snapshot).await {
            self.skip_tick("snapshot not persisted", &e.to_string()).await;
            return None;
        }

        info!(
            id = %snapshot.id,
            assets = snapshot.balances.len(),
            total_usd = snapshot.total_value_usd(),
            reason,
            "snapshot captured"
        );
        self.bus.publish(
            topic::PORTFOLIO_UPDATED,
            serde_json::json!({
                "id": snapshot.id,
                "captured_at": snapshot.captured_at,
                "total_value_usd": snapshot.total_value_usd(),
                "reason": reason,
            }),
        );
        Some(snapshot)
    }

    /// Seed the default baselines: BTC at current holdings (or 0) and XRP
    /// at max(10, current holdings).
    async fn seed_baselines(&self, holdings: &BTreeMap<String, f64>) {
        let btc_qty = holdings.get("BTC").copied().unwrap_or(0.0);
        let xrp_qty = holdings.get("XRP").copied().unwrap_or(0.0);

        let seeds = [
            Baseline {
                symbol: "BTC".to_string(),
                baseline: btc_qty,
                auto_increment_on_deposit: true,
                min_tokens: None,
                avg_buy_price: None,
            },
            Baseline {
                symbol: "XRP".to_string(),
                baseline: XRP_MIN_TOKENS.max(xrp_qty),
                auto_increment_on_deposit: true,
                min_tokens: Some(XRP_MIN_TOKENS),
                avg_buy_price: None,
            },
        ];
        for seed in seeds {
            info!(symbol = %seed.symbol, baseline = seed.baseline, "seeding baseline");
            if let Err(e) = self.store.upsert_baseline(&seed).await {
                warn!(symbol = %seed.symbol, error = %e, "baseline seed not persisted");
            }
        }
    }

    /// Raise auto-incrementing baselines when holdings grew without a buy
    /// execution (an external deposit). The floor follows the deposit so
    /// deposited funds are never treated as sellable surplus.
    async fn record_deposits(
        &self,
        previous: &Snapshot,
        holdings: &BTreeMap<String, f64>,
        baselines: &[Baseline],
    ) {
        let recent = self
            .store
            .executions_since(previous.captured_at)
            .await
            .unwrap_or_default();

        for baseline in baselines.iter().filter(|b| b.auto_increment_on_deposit) {
            let before = previous.balances.get(&baseline.symbol).copied().unwrap_or(0.0);
            let now = holdings.get(&baseline.symbol).copied().unwrap_or(0.0);
            let delta = now - before;
            if delta <= 0.0 {
                continue;
            }
            let bought = recent
                .iter()
                .any(|e| e.symbol == baseline.symbol && e.side == crate::types::Side::Buy);
            if bought {
                continue;
            }

            let mut updated = baseline.clone();
            updated.baseline += delta;
            info!(
                symbol = %baseline.symbol,
                delta,
                new_baseline = updated.baseline,
                "deposit detected — baseline raised"
            );
            if let Err(e) = self.store.upsert_baseline(&updated).await {
                warn!(symbol = %baseline.symbol, error = %e, "deposit baseline not persisted");
                continue;
            }
            let alert = AlertRecord::new(
                "deposit",
                Severity::Info,
                format!(
                    "{delta} {} deposited; baseline raised to {}",
                    baseline.symbol, updated.baseline
                ),
            );
            if let Err(e) = self.store.record_alert(&alert).await {
                warn!(error = %e, "deposit alert not persisted");
            }
            self.bus
                .publish(topic::ALERT, serde_json::to_value(&alert).unwrap_or_default());
        }
    }

    /// 24-hour position deltas for the portfolio endpoint: latest snapshot
    /// against the earliest snapshot within the trailing day.
    pub async fn deltas_24h(&self) -> Vec<SymbolDelta> {
        let latest = match self.store.latest_snapshot().await {
            Ok(Some(s)) => s,
            _ => return Vec::new(),
        };
        let history = self
            .store
            .snapshots_since(Utc::now() - Duration::hours(24))
            .await
            .unwrap_or_default();
        let reference = match history.first() {
            Some(s) => s.clone(),
            None => return Vec::new(),
        };

        latest
            .balances
            .iter()
            .map(|(sym, qty)| {
                let old_qty = reference.balances.get(sym).copied().unwrap_or(0.0);
                let price = latest.prices.get(sym).copied().unwrap_or(0.0);
                let old_price = reference.prices.get(sym).copied().unwrap_or(0.0);
                let price_delta_pct = if old_price > 0.0 {
                    (price - old_price) / old_price * 100.0
                } else {
                    0.0
                };
                SymbolDelta {
                    symbol: sym.clone(),
                    qty: *qty,
                    qty_delta: qty - old_qty,
                    price,
                    price_delta_pct,
                }
            })
            .collect()
    }

    async fn skip_tick(&self, what: &str, error: &str) {
        warn!(error, "{what} — skipping snapshot tick");
        let alert = AlertRecord::new("snapshot", Severity::Warning, format!("{what}: {error}"));
        if let Err(e) = self.store.record_alert(&alert).await {
            warn!(error = %e, "alert not persisted");
        }
        self.bus
            .publish(topic::ALERT, serde_json::to_value(&alert).unwrap_or_default());
    }
}
