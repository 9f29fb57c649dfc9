// =============================================================================
// Rule model — declarative trading rules and the intents they emit
// =============================================================================
//
// A rule is a trigger, a conjunction of conditions, and a list of actions,
// plus a per-rule risk block. Rules are owned by the owner through the HTTP
// surface; nothing in the engine mutates a stored rule (the optimizer
// proposes changes as approvals instead).
//
// Conditions and actions are tagged serde enums so stored JSON stays
// readable and forward-compatible.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Trigger
// =============================================================================

/// When a rule is considered. Interval triggers fire on every evaluation
/// tick; event triggers only when the named external event has arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Interval,
    Event { name: String },
}

impl Default for Trigger {
    fn default() -> Self {
        Self::Interval
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Indicator family usable in an `indicator` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Rsi,
    Sma,
    Volatility,
}

/// A single boolean predicate over the latest portfolio snapshot and its
/// history. All conditions of a rule are AND-ed with short-circuit; a
/// condition that cannot be evaluated (missing market data) fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Share of portfolio value held in `symbol`, in percent.
    PortfolioExposure {
        symbol: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lt_pct: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gt_pct: Option<f64>,
    },
    /// Percent price change of `symbol` over the trailing window.
    PriceChangePct {
        symbol: String,
        window_mins: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lt: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gt: Option<f64>,
    },
    /// Technical indicator over the snapshot price series.
    Indicator {
        kind: IndicatorKind,
        symbol: String,
        period: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lt: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gt: Option<f64>,
    },
}

// =============================================================================
// Actions
// =============================================================================

/// What a matched rule proposes. Only `enter` and `exit` are eligible for
/// auto-execution; `notify` always just raises an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Enter { symbol: String, alloc_pct: f64 },
    Exit { symbol: String, alloc_pct: f64 },
    Notify { message: String },
}

impl Action {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Enter { symbol, .. } | Self::Exit { symbol, .. } => Some(symbol),
            Self::Notify { .. } => None,
        }
    }

    pub fn alloc_pct(&self) -> Option<f64> {
        match self {
            Self::Enter { alloc_pct, .. } | Self::Exit { alloc_pct, .. } => Some(*alloc_pct),
            Self::Notify { .. } => None,
        }
    }

    /// True for actions that add exposure (entries).
    pub fn is_entry(&self) -> bool {
        matches!(self, Self::Enter { .. })
    }

    /// True for actions that reduce holdings (exits / sells).
    pub fn reduces_holdings(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }

    /// True for the action kinds the auto-execution path accepts.
    pub fn is_tradeable(&self) -> bool {
        matches!(self, Self::Enter { .. } | Self::Exit { .. })
    }
}

// =============================================================================
// Risk block
// =============================================================================

/// Opt-in guardrails the risk gate enforces for this rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guardrail {
    BaselineProtection,
    ThrottleVelocity,
}

/// Per-rule risk limits consulted by the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRisk {
    /// Minimum seconds between successive executions of this rule.
    #[serde(default)]
    pub cooldown_secs: u64,

    /// Cap on post-trade exposure for entries, percent of portfolio value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_position_pct: Option<f64>,

    /// Daily loss fraction (e.g. 0.05) beyond which this rule stops trading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_daily_loss_pct: Option<f64>,

    /// Force the approval path even for otherwise auto-executable intents.
    #[serde(default)]
    pub require_approval: bool,

    #[serde(default)]
    pub guardrails: Vec<Guardrail>,
}

impl Default for RuleRisk {
    fn default() -> Self {
        Self {
            cooldown_secs: 0,
            max_position_pct: None,
            max_daily_loss_pct: None,
            require_approval: false,
            guardrails: Vec::new(),
        }
    }
}

impl RuleRisk {
    pub fn has_guardrail(&self, g: Guardrail) -> bool {
        self.guardrails.contains(&g)
    }
}

// =============================================================================
// Rule
// =============================================================================

/// A stored, owner-managed trading rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub risk: RuleRisk,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl Rule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            enabled: false,
            trigger: Trigger::Interval,
            conditions: Vec::new(),
            actions: Vec::new(),
            risk: RuleRisk::default(),
            meta: serde_json::Value::Null,
        }
    }
}

// =============================================================================
// Intent
// =============================================================================

/// A proposed action emitted by the evaluator, before risk gating. Transient
/// — never persisted directly (it rides along in approval metadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub rule_id: String,
    pub rule_name: String,
    pub action: Action,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// True when the intent must go through the approval path rather than
    /// auto-execution.
    pub dry_run: bool,
}

impl Intent {
    pub fn new(rule: &Rule, action: Action, reason: impl Into<String>, dry_run: bool) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            action,
            reason: reason.into(),
            created_at: Utc::now(),
            dry_run,
        }
    }
}
