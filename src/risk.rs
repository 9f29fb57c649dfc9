// =============================================================================
// Risk Gate — stateful guardrails between rule intents and execution
// =============================================================================
//
// Checks run in a fixed order; the first failure short-circuits with a
// machine-readable reason code:
//
//   1. Cooldown            — COOLDOWN
//   2. Max drawdown        — DRAWDOWN_MAX (assumed-peak heuristic)
//   3. Daily loss limit    — DAILY_LOSS_LIMIT (resets on UTC date change)
//   4. Velocity throttle   — VELOCITY_MAX_TRADES
//   5. Baseline protection — BASELINE_<SYMBOL>
//   6. Collateral (BTC)    — COLLATERAL_BTC
//   7. Max position        — MAX_POSITION
//
// Rejection is a normal result value, never an error. The only mutator is
// `record_execution`, called by the execution pipeline after every
// completed order. All state lives behind one short-lived mutex and no I/O
// happens under it.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::records::{Baseline, CollateralPosition, Snapshot};
use crate::rules::{Guardrail, Intent, Rule};
use crate::types::is_core_symbol;

/// Execution history ring capacity.
const HISTORY_CAP: usize = 1000;

// =============================================================================
// Decision
// =============================================================================

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Rejected { code: String },
}

impl GateDecision {
    fn reject(code: impl Into<String>) -> Self {
        Self::Rejected { code: code.into() }
    }

    pub fn allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Allowed => None,
            Self::Rejected { code } => Some(code),
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// Read-only market/portfolio context the gate evaluates against. Built by
/// the caller from the latest snapshot; the gate itself never touches
/// persistence.
pub struct GateContext<'a> {
    pub snapshot: &'a Snapshot,
    pub baselines: &'a [Baseline],
    pub collateral: &'a [CollateralPosition],
}

impl<'a> GateContext<'a> {
    fn baseline_for(&self, symbol: &str) -> Option<&Baseline> {
        self.baselines.iter().find(|b| b.symbol == symbol)
    }

    fn locked_qty(&self, symbol: &str) -> f64 {
        self.collateral
            .iter()
            .filter(|c| c.symbol == symbol)
            .map(|c| c.locked_qty)
            .sum()
    }
}

// =============================================================================
// Serialisable state snapshot
// =============================================================================

/// Point-in-time view of the gate's counters for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStateView {
    pub trades_last_hour: u32,
    pub daily_loss: f64,
    pub last_daily_reset: String,
    pub history_len: usize,
}

// =============================================================================
// Internal state
// =============================================================================

struct Inner {
    /// Rolling (timestamp, pnl) window, newest at the back.
    history: VecDeque<(DateTime<Utc>, f64)>,
    /// Accumulated negative pnl for the current UTC date (<= 0).
    daily_loss: f64,
    /// UTC date of the last daily reset, "YYYY-MM-DD".
    last_daily_reset: String,
    /// rule id -> last execution time, for cooldowns.
    last_executions: HashMap<String, DateTime<Utc>>,
}

// =============================================================================
// RiskGate
// =============================================================================

pub struct RiskGate {
    state: Mutex<Inner>,
    /// Velocity throttle: executions allowed per rolling hour.
    max_trades_hour: u32,
    /// Assumed-peak multiplier for the drawdown heuristic.
    assumed_peak_mult: f64,
}

impl RiskGate {
    pub fn new(config: &Config) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            max_trades_hour = config.risk_max_trades_hour,
            assumed_peak_mult = config.risk_assumed_peak_mult,
            "risk gate initialised"
        );
        Self {
            state: Mutex::new(Inner {
                history: VecDeque::new(),
                daily_loss: 0.0,
                last_daily_reset: today,
                last_executions: HashMap::new(),
            }),
            max_trades_hour: config.risk_max_trades_hour,
            assumed_peak_mult: config.risk_assumed_peak_mult,
        }
    }

    // -------------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------------

    /// Evaluate one intent against all guardrails.
    pub fn gate(&self, rule: &Rule, ctx: &GateContext<'_>, intent: &Intent) -> GateDecision {
        let now = Utc::now();
        let total_value = ctx.snapshot.total_value_usd();

        // Counters are read under the lock once; no I/O follows while held.
        let (last_exec, daily_loss, trades_last_hour) = {
            let mut s = self.state.lock();
            Self::maybe_reset_daily(&mut s, now);
            (
                s.last_executions.get(&rule.id).copied(),
                s.daily_loss,
                Self::count_last_hour(&s.history, now),
            )
        };

        // 1. Cooldown.
        if rule.risk.cooldown_secs > 0 {
            if let Some(last) = last_exec {
                let elapsed = (now - last).num_seconds();
                if elapsed < rule.risk.cooldown_secs as i64 {
                    debug!(rule = %rule.name, elapsed, "intent rejected: cooldown");
                    return GateDecision::reject("COOLDOWN");
                }
            }
        }

        // 2. Max drawdown (assumed-peak heuristic).
        if let Some(max_loss_pct) = rule.risk.max_daily_loss_pct {
            let assumed_peak = total_value * self.assumed_peak_mult;
            if total_value < assumed_peak * (1.0 - max_loss_pct) {
                warn!(rule = %rule.name, total_value, "intent rejected: drawdown heuristic");
                return GateDecision::reject("DRAWDOWN_MAX");
            }
        }

        // 3. Daily loss limit, relative to portfolio value.
        if let Some(max_loss_pct) = rule.risk.max_daily_loss_pct {
            if total_value > 0.0 && daily_loss.abs() / total_value >= max_loss_pct {
                warn!(rule = %rule.name, daily_loss, "intent rejected: daily loss limit");
                return GateDecision::reject("DAILY_LOSS_LIMIT");
            }
        }

        // 4. Velocity throttle.
        if rule.risk.has_guardrail(Guardrail::ThrottleVelocity)
            && trades_last_hour >= self.max_trades_hour
        {
            warn!(rule = %rule.name, trades_last_hour, "intent rejected: velocity throttle");
            return GateDecision::reject("VELOCITY_MAX_TRADES");
        }

        let symbol = intent.action.symbol().unwrap_or_default();
        let alloc_pct = intent.action.alloc_pct().unwrap_or(0.0);
        let price = ctx.snapshot.prices.get(symbol).copied().unwrap_or(0.0);
        let holding = ctx.snapshot.balances.get(symbol).copied().unwrap_or(0.0);
        let qty_to_trade = if price > 0.0 {
            (alloc_pct / 100.0) * total_value / price
        } else {
            0.0
        };

        // 5. Baseline protection: never sell a core asset through its floor.
        if rule.risk.has_guardrail(Guardrail::BaselineProtection)
            && intent.action.reduces_holdings()
            && is_core_symbol(symbol)
        {
            if let Some(baseline) = ctx.baseline_for(symbol) {
                let remaining = holding - qty_to_trade;
                let floor = baseline.baseline.max(baseline.min_tokens.unwrap_or(0.0));
                if remaining < floor {
                    info!(
                        symbol,
                        remaining,
                        floor,
                        rule = %rule.name,
                        "intent rejected: baseline protection"
                    );
                    return GateDecision::reject(format!("BASELINE_{symbol}"));
                }
            }
        }

        // 6. Collateral protection: BTC sells must leave the locked quantity
        // untouched.
        if symbol == "BTC" && intent.action.reduces_holdings() {
            let locked = ctx.locked_qty("BTC");
            if locked > 0.0 && holding - qty_to_trade < locked {
                warn!(holding, locked, "intent rejected: collateral protection");
                return GateDecision::reject("COLLATERAL_BTC");
            }
        }

        // 7. Max position for entries.
        if intent.action.is_entry() {
            if let Some(max_position_pct) = rule.risk.max_position_pct {
                let exposure = ctx.snapshot.exposure_pct(symbol);
                if exposure + alloc_pct > max_position_pct {
                    debug!(
                        symbol,
                        exposure,
                        alloc_pct,
                        max_position_pct,
                        "intent rejected: max position"
                    );
                    return GateDecision::reject("MAX_POSITION");
                }
            }
        }

        GateDecision::Allowed
    }

    // -------------------------------------------------------------------------
    // Mutator
    // -------------------------------------------------------------------------

    /// Record a completed execution. Called by the execution pipeline on
    /// every completed order.
    pub fn record_execution(&self, rule_id: Option<&str>, pnl: Option<f64>) {
        self.record_execution_at(rule_id, pnl, Utc::now());
    }

    /// Timestamped variant; exposed for tests and replays.
    pub fn record_execution_at(
        &self,
        rule_id: Option<&str>,
        pnl: Option<f64>,
        at: DateTime<Utc>,
    ) {
        let mut s = self.state.lock();
        Self::maybe_reset_daily(&mut s, at);

        s.history.push_back((at, pnl.unwrap_or(0.0)));
        while s.history.len() > HISTORY_CAP {
            s.history.pop_front();
        }

        if let Some(p) = pnl {
            if p < 0.0 {
                s.daily_loss += p;
            }
        }
        if let Some(id) = rule_id {
            s.last_executions.insert(id.to_string(), at);
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Executions recorded within the trailing hour.
    pub fn trades_last_hour(&self) -> u32 {
        let now = Utc::now();
        let mut s = self.state.lock();
        Self::maybe_reset_daily(&mut s, now);
        Self::count_last_hour(&s.history, now)
    }

    /// Accumulated daily loss (<= 0) for the current UTC date.
    pub fn daily_loss(&self) -> f64 {
        let now = Utc::now();
        let mut s = self.state.lock();
        Self::maybe_reset_daily(&mut s, now);
        s.daily_loss
    }

    pub fn last_execution(&self, rule_id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().last_executions.get(rule_id).copied()
    }

    /// Serialisable view for diagnostics and `/health/full`.
    pub fn view(&self) -> RiskStateView {
        let now = Utc::now();
        let mut s = self.state.lock();
        Self::maybe_reset_daily(&mut s, now);
        RiskStateView {
            trades_last_hour: Self::count_last_hour(&s.history, now),
            daily_loss: s.daily_loss,
            last_daily_reset: s.last_daily_reset.clone(),
            history_len: s.history.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn count_last_hour(history: &VecDeque<(DateTime<Utc>, f64)>, now: DateTime<Utc>) -> u32 {
        let cutoff = now - Duration::hours(1);
        history.iter().filter(|(at, _)| *at >= cutoff).count() as u32
    }

    fn maybe_reset_daily(s: &mut Inner, now: DateTime<Utc>) {
        let today = now.format("%Y-%m-%d").to_string();
        if s.last_daily_reset != today {
            info!(
                old_date = %s.last_daily_reset,
                new_date = %today,
                "UTC date rolled — resetting daily loss"
            );
            s.daily_loss = 0.0;
            s.last_daily_reset = today;
        }
    }
}
