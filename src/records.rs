// =============================================================================
// Durable records — the logical entities the persistence gateway stores
// =============================================================================
//
// Monetary quantities are f64 USD / asset units; timestamps are UTC with
// millisecond resolution. Append-only records (snapshots, executions,
// alerts, audit) are never updated after insert. Approvals carry the only
// mutable status field, guarded by the state machine below.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Actor, OrderMode, Severity, Side};

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable point-in-time capture of balances and prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub captured_at: DateTime<Utc>,
    /// symbol -> quantity held.
    pub balances: BTreeMap<String, f64>,
    /// symbol -> USD price.
    pub prices: BTreeMap<String, f64>,
    /// Why this snapshot was taken ("scheduled", "forced", "startup").
    pub reason: String,
}

impl Snapshot {
    pub fn new(
        balances: BTreeMap<String, f64>,
        prices: BTreeMap<String, f64>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            captured_at: Utc::now(),
            balances,
            prices,
            reason: reason.into(),
        }
    }

    /// Total portfolio value: sum of qty x price over symbols present in
    /// both maps.
    pub fn total_value_usd(&self) -> f64 {
        self.balances
            .iter()
            .filter_map(|(sym, qty)| self.prices.get(sym).map(|p| qty * p))
            .sum()
    }

    /// USD value held in one symbol.
    pub fn value_of(&self, symbol: &str) -> f64 {
        let qty = self.balances.get(symbol).copied().unwrap_or(0.0);
        let price = self.prices.get(symbol).copied().unwrap_or(0.0);
        qty * price
    }

    /// Exposure of `symbol` as percent of total portfolio value.
    pub fn exposure_pct(&self, symbol: &str) -> f64 {
        let total = self.total_value_usd();
        if total <= 0.0 {
            return 0.0;
        }
        self.value_of(symbol) / total * 100.0
    }
}

// =============================================================================
// Baseline
// =============================================================================

/// Per-symbol floor of holdings the supervisor will never sell through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub symbol: String,
    pub baseline: f64,
    #[serde(default)]
    pub auto_increment_on_deposit: bool,
    /// Hard token floor (XRP policy: >= 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tokens: Option<f64>,
    /// Owner-supplied average buy price; source for the profit-taking
    /// scanner's gain computation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_buy_price: Option<f64>,
}

// =============================================================================
// Approval
// =============================================================================

/// Lifecycle of an approval record. Terminal statuses are write-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Declined,
    Executed,
    Simulated,
    Failed,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Executed | Self::Declined | Self::Simulated | Self::Failed
        )
    }

    /// Whether `from -> to` is a legal, monotonic transition.
    pub fn can_transition(from: Self, to: Self) -> bool {
        use ApprovalStatus::*;
        match (from, to) {
            (Pending, Approved) => true,
            (Pending, Declined) => true,
            (Pending, Simulated) => true,
            (Pending, Failed) => true,
            (Approved, Executed) => true,
            (Approved, Simulated) => true,
            (Approved, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::Executed => "executed",
            Self::Simulated => "simulated",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "declined" => Ok(Self::Declined),
            "executed" => Ok(Self::Executed),
            "simulated" => Ok(Self::Simulated),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown approval status '{other}'")),
        }
    }
}

/// A durable record of a pending or decided intent requiring owner
/// acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    /// Category: "trade", "profit_taking", "rule_update".
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    pub title: String,
    pub summary: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acted_at: Option<DateTime<Utc>>,
    /// Free-form payload; `metadata.intent` carries the originating intent.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Approval {
    pub fn new(kind: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            symbol: None,
            amount: None,
            title: title.into(),
            summary: String::new(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            acted_by: None,
            acted_at: None,
            metadata: serde_json::Value::Null,
        }
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Append-only record of an actually-submitted (or simulated) order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub side: Side,
    pub symbol: String,
    pub amount: f64,
    pub mode: OrderMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_qty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<f64>,
    pub dry_run: bool,
    pub executed_at: DateTime<Utc>,
}

// =============================================================================
// Kill switch
// =============================================================================

/// Singleton process-wide halt flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_by: Option<Actor>,
    pub timestamp: DateTime<Utc>,
}

impl Default for KillSwitchState {
    fn default() -> Self {
        Self {
            enabled: false,
            reason: None,
            set_by: None,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// MFA challenge
// =============================================================================

/// Short-lived 6-digit code binding one large execution to one trade id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaChallenge {
    pub trade_id: String,
    pub user_id: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub verified: bool,
    #[serde(default)]
    pub trade_details: serde_json::Value,
}

// =============================================================================
// Alerts & audit
// =============================================================================

/// Append-only operator-facing alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl AlertRecord {
    pub fn new(kind: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            severity,
            message: message.into(),
            data: serde_json::Value::Null,
            ts: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Append-only audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            message: message.into(),
            data: serde_json::Value::Null,
            ts: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

// =============================================================================
// Collateral
// =============================================================================

/// One collateralised position as reported by the brokerage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollateralPosition {
    pub symbol: String,
    /// Quantity locked as collateral (not sellable).
    pub locked_qty: f64,
    /// Health factor; below the configured minimum triggers the breach path.
    pub health: f64,
}

// =============================================================================
// Preferences
// =============================================================================

/// Learned user-preference aggregate, recomputed periodically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    pub risk_tolerance: f64,
    pub preferred_profit_target: f64,
    pub approval_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorite_symbol: Option<String>,
    /// min(1, sample_size / 100).
    pub confidence: f64,
    pub sample_size: u64,
    pub updated_at: DateTime<Utc>,
}
