// =============================================================================
// Rule Evaluator — turns rules + market state into intents
// =============================================================================
//
// Pure with respect to persistence: the evaluator reads the latest snapshot
// and its history, walks enabled rules in insertion order, AND-s their
// conditions with short-circuit, and emits one intent per action of each
// matched rule. It never writes anywhere; risk gating and execution happen
// downstream.
//
// A condition that cannot be evaluated (missing price, not enough history)
// fails that condition only — the tick carries on with the next rule.
// =============================================================================

use std::collections::HashSet;

use chrono::{Duration, Utc};
use tracing::debug;

use crate::indicators;
use crate::records::Snapshot;
use crate::rules::{Action, Condition, IndicatorKind, Intent, Rule, Trigger};
use crate::types::is_core_symbol;

// =============================================================================
// Inputs
// =============================================================================

/// Everything one evaluation tick reads. `history` is ascending by capture
/// time and includes the latest snapshot.
pub struct EvalInputs<'a> {
    pub snapshot: &'a Snapshot,
    pub history: &'a [Snapshot],
    pub rules: &'a [Rule],
    /// External event names observed since the previous tick; event-triggered
    /// rules only fire when their name is present.
    pub external_events: &'a HashSet<String>,
}

// =============================================================================
// Evaluator
// =============================================================================

pub struct Evaluator {
    /// Whether objectives permit auto-executing core assets at all.
    auto_execute_core: bool,
}

impl Evaluator {
    pub fn new(auto_execute_core: bool) -> Self {
        Self { auto_execute_core }
    }

    /// Evaluate all enabled rules for one tick, in insertion order; within a
    /// rule, actions produce intents left-to-right.
    pub fn evaluate_tick(&self, inputs: &EvalInputs<'_>) -> Vec<Intent> {
        let mut intents = Vec::new();

        for rule in inputs.rules.iter().filter(|r| r.enabled) {
            match &rule.trigger {
                Trigger::Interval => {}
                Trigger::Event { name } => {
                    if !inputs.external_events.contains(name) {
                        continue;
                    }
                }
            }

            let matched = rule
                .conditions
                .iter()
                .all(|c| self.eval_condition(c, inputs));
            if !matched {
                continue;
            }

            debug!(rule = %rule.name, actions = rule.actions.len(), "rule matched");
            let reason = format!(
                "rule '{}' matched {} condition(s)",
                rule.name,
                rule.conditions.len()
            );

            for action in &rule.actions {
                let dry_run = self.classify_dry_run(rule, action);
                intents.push(Intent::new(rule, action.clone(), reason.clone(), dry_run));
            }
        }

        intents
    }

    /// Core assets may auto-execute when objectives allow and the rule does
    /// not insist on approval; everything else goes through the approval
    /// path.
    fn classify_dry_run(&self, rule: &Rule, action: &Action) -> bool {
        let core = action.symbol().map(is_core_symbol).unwrap_or(false);
        if !core || !action.is_tradeable() {
            return true;
        }
        if rule.risk.require_approval {
            return true;
        }
        !self.auto_execute_core
    }

    // -------------------------------------------------------------------------
    // Conditions
    // -------------------------------------------------------------------------

    fn eval_condition(&self, condition: &Condition, inputs: &EvalInputs<'_>) -> bool {
        match condition {
            Condition::PortfolioExposure {
                symbol,
                lt_pct,
                gt_pct,
            } => {
                if inputs.snapshot.total_value_usd() <= 0.0 {
                    return false;
                }
                let exposure = inputs.snapshot.exposure_pct(symbol);
                within_bounds(exposure, *lt_pct, *gt_pct)
            }

            Condition::PriceChangePct {
                symbol,
                window_mins,
                lt,
                gt,
            } => {
                let current = match inputs.snapshot.prices.get(symbol) {
                    Some(p) if *p > 0.0 => *p,
                    _ => return false,
                };
                let cutoff = Utc::now() - Duration::minutes(*window_mins as i64);
                // Oldest snapshot inside the window is the reference point.
                let reference = inputs
                    .history
                    .iter()
                    .find(|s| s.captured_at >= cutoff)
                    .and_then(|s| s.prices.get(symbol).copied());
                let Some(old) = reference.filter(|p| *p > 0.0) else {
                    return false;
                };
                let change_pct = (current - old) / old * 100.0;
                within_bounds(change_pct, *lt, *gt)
            }

            Condition::Indicator {
                kind,
                symbol,
                period,
                lt,
                gt,
            } => {
                let series: Vec<f64> = inputs
                    .history
                    .iter()
                    .filter_map(|s| s.prices.get(symbol).copied())
                    .filter(|p| *p > 0.0)
                    .collect();
                let value = match kind {
                    IndicatorKind::Rsi => indicators::current_rsi(&series, *period),
                    IndicatorKind::Sma => indicators::current_sma(&series, *period),
                    IndicatorKind::Volatility => indicators::returns_stddev_pct(&series),
                };
                match value {
                    Some(v) => within_bounds(v, *lt, *gt),
                    None => false,
                }
            }
        }
    }
}

/// True when `value` satisfies both optional bounds.
fn within_bounds(value: f64, lt: Option<f64>, gt: Option<f64>) -> bool {
    if let Some(upper) = lt {
        if value >= upper {
            return false;
        }
    }
    if let Some(lower) = gt {
        if value <= lower {
            return false;
        }
    }
    true
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleRisk;
    use std::collections::BTreeMap;

    fn snapshot_at(prices: &[(&str, f64)], minutes_ago: i64) -> Snapshot {
        let balances: BTreeMap<String, f64> =
            prices.iter().map(|(s, _)| (s.to_string(), 1.0)).collect();
        let mut snap = Snapshot::new(
            balances,
            prices.iter().map(|(s, p)| (s.to_string(), *p)).collect(),
            "test",
        );
        snap.captured_at = Utc::now() - Duration::minutes(minutes_ago);
        snap
    }

    fn interval_rule(name: &str, conditions: Vec<Condition>, actions: Vec<Action>) -> Rule {
        let mut rule = Rule::new(name);
        rule.enabled = true;
        rule.conditions = conditions;
        rule.actions = actions;
        rule
    }

    fn exit_btc() -> Action {
        Action::Exit {
            symbol: "BTC".into(),
            alloc_pct: 10.0,
        }
    }

    #[test]
    fn disabled_rules_emit_nothing() {
        let snap = snapshot_at(&[("BTC", 100.0)], 0);
        let history = vec![snap.clone()];
        let mut rule = interval_rule("r", vec![], vec![exit_btc()]);
        rule.enabled = false;

        let intents = Evaluator::new(false).evaluate_tick(&EvalInputs {
            snapshot: &snap,
            history: &history,
            rules: &[rule],
            external_events: &HashSet::new(),
        });
        assert!(intents.is_empty());
    }

    #[test]
    fn exposure_condition_matches() {
        // BTC is 100% of this portfolio.
        let snap = snapshot_at(&[("BTC", 100.0)], 0);
        let history = vec![snap.clone()];
        let rule = interval_rule(
            "heavy-btc",
            vec![Condition::PortfolioExposure {
                symbol: "BTC".into(),
                lt_pct: None,
                gt_pct: Some(50.0),
            }],
            vec![exit_btc()],
        );

        let intents = Evaluator::new(false).evaluate_tick(&EvalInputs {
            snapshot: &snap,
            history: &history,
            rules: &[rule],
            external_events: &HashSet::new(),
        });
        assert_eq!(intents.len(), 1);
        assert!(intents[0].dry_run);
        assert!(intents[0].reason.contains("heavy-btc"));
    }

    #[test]
    fn price_change_condition_uses_window_reference() {
        let old = snapshot_at(&[("BTC", 100.0)], 30);
        let latest = snapshot_at(&[("BTC", 110.0)], 0);
        let history = vec![old, latest.clone()];

        // +10% over 60 minutes; rule requires > 5%.
        let rule = interval_rule(
            "momentum",
            vec![Condition::PriceChangePct {
                symbol: "BTC".into(),
                window_mins: 60,
                lt: None,
                gt: Some(5.0),
            }],
            vec![exit_btc()],
        );
        let intents = Evaluator::new(false).evaluate_tick(&EvalInputs {
            snapshot: &latest,
            history: &history,
            rules: &[rule],
            external_events: &HashSet::new(),
        });
        assert_eq!(intents.len(), 1);

        // A tighter lower bound fails.
        let rule2 = interval_rule(
            "momentum",
            vec![Condition::PriceChangePct {
                symbol: "BTC".into(),
                window_mins: 60,
                lt: None,
                gt: Some(15.0),
            }],
            vec![exit_btc()],
        );
        let intents2 = Evaluator::new(false).evaluate_tick(&EvalInputs {
            snapshot: &latest,
            history: &history,
            rules: &[rule2],
            external_events: &HashSet::new(),
        });
        assert!(intents2.is_empty());
    }

    #[test]
    fn missing_market_data_fails_condition_not_tick() {
        let snap = snapshot_at(&[("BTC", 100.0)], 0);
        let history = vec![snap.clone()];

        let needs_eth = interval_rule(
            "eth-rule",
            vec![Condition::PriceChangePct {
                symbol: "ETH".into(),
                window_mins: 60,
                lt: None,
                gt: Some(1.0),
            }],
            vec![Action::Exit {
                symbol: "ETH".into(),
                alloc_pct: 10.0,
            }],
        );
        let unconditional = interval_rule("always", vec![], vec![exit_btc()]);

        let intents = Evaluator::new(false).evaluate_tick(&EvalInputs {
            snapshot: &snap,
            history: &history,
            rules: &[needs_eth, unconditional],
            external_events: &HashSet::new(),
        });
        // The ETH rule fails silently; the unconditional rule still fires.
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].rule_name, "always");
    }

    #[test]
    fn volatility_indicator_condition() {
        // Alternating +-5% steps give a stddev well above 3.
        let mut history = Vec::new();
        let mut price = 100.0;
        for i in 0..20 {
            price = if i % 2 == 0 { price * 1.05 } else { price * 0.95 };
            history.push(snapshot_at(&[("BTC", price)], 20 - i));
        }
        let latest = history.last().unwrap().clone();

        let rule = interval_rule(
            "choppy",
            vec![Condition::Indicator {
                kind: IndicatorKind::Volatility,
                symbol: "BTC".into(),
                period: 0,
                lt: None,
                gt: Some(3.0),
            }],
            vec![exit_btc()],
        );
        let intents = Evaluator::new(false).evaluate_tick(&EvalInputs {
            snapshot: &latest,
            history: &history,
            rules: &[rule],
            external_events: &HashSet::new(),
        });
        assert_eq!(intents.len(), 1);
    }

    #[test]
    fn event_trigger_requires_published_event() {
        let snap = snapshot_at(&[("BTC", 100.0)], 0);
        let history = vec![snap.clone()];
        let mut rule = interval_rule("on-news", vec![], vec![exit_btc()]);
        rule.trigger = Trigger::Event {
            name: "macro:update".into(),
        };

        let quiet = Evaluator::new(false).evaluate_tick(&EvalInputs {
            snapshot: &snap,
            history: &history,
            rules: &[rule.clone()],
            external_events: &HashSet::new(),
        });
        assert!(quiet.is_empty());

        let mut events = HashSet::new();
        events.insert("macro:update".to_string());
        let fired = Evaluator::new(false).evaluate_tick(&EvalInputs {
            snapshot: &snap,
            history: &history,
            rules: &[rule],
            external_events: &events,
        });
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn dry_run_classification() {
        let snap = snapshot_at(&[("BTC", 100.0), ("ETH", 10.0)], 0);
        let history = vec![snap.clone()];

        let core = interval_rule("core", vec![], vec![exit_btc()]);
        let mut core_needs_approval = interval_rule("careful", vec![], vec![exit_btc()]);
        core_needs_approval.risk = RuleRisk {
            require_approval: true,
            ..RuleRisk::default()
        };
        let non_core = interval_rule(
            "alt",
            vec![],
            vec![Action::Exit {
                symbol: "ETH".into(),
                alloc_pct: 10.0,
            }],
        );

        let rules = [core, core_needs_approval, non_core];

        // Auto-execution enabled: only the unconstrained core intent is live.
        let intents = Evaluator::new(true).evaluate_tick(&EvalInputs {
            snapshot: &snap,
            history: &history,
            rules: &rules,
            external_events: &HashSet::new(),
        });
        assert_eq!(intents.len(), 3);
        assert!(!intents[0].dry_run);
        assert!(intents[1].dry_run);
        assert!(intents[2].dry_run);

        // Auto-execution disabled: everything is dry-run.
        let intents = Evaluator::new(false).evaluate_tick(&EvalInputs {
            snapshot: &snap,
            history: &history,
            rules: &rules,
            external_events: &HashSet::new(),
        });
        assert!(intents.iter().all(|i| i.dry_run));
    }

    #[test]
    fn insertion_order_and_action_order_preserved() {
        let snap = snapshot_at(&[("BTC", 100.0), ("XRP", 1.0)], 0);
        let history = vec![snap.clone()];
        let first = interval_rule(
            "first",
            vec![],
            vec![
                exit_btc(),
                Action::Exit {
                    symbol: "XRP".into(),
                    alloc_pct: 5.0,
                },
            ],
        );
        let second = interval_rule("second", vec![], vec![exit_btc()]);

        let intents = Evaluator::new(false).evaluate_tick(&EvalInputs {
            snapshot: &snap,
            history: &history,
            rules: &[first, second],
            external_events: &HashSet::new(),
        });
        assert_eq!(intents.len(), 3);
        assert_eq!(intents[0].rule_name, "first");
        assert_eq!(intents[0].action.symbol(), Some("BTC"));
        assert_eq!(intents[1].action.symbol(), Some("XRP"));
        assert_eq!(intents[2].rule_name, "second");
    }
}
