// =============================================================================
// Shared types used across the Coinward trading supervisor
// =============================================================================

use serde::{Deserialize, Serialize};

/// Symbols eligible for auto-execution (subject to baseline floors).
pub const CORE_SYMBOLS: [&str; 2] = ["BTC", "XRP"];

/// Policy floor for the XRP baseline: never seeded or lowered below this.
pub const XRP_MIN_TOKENS: f64 = 10.0;

/// Returns true if `symbol` is a core asset (BTC or XRP).
pub fn is_core_symbol(symbol: &str) -> bool {
    CORE_SYMBOLS.contains(&symbol)
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order placement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    Market,
    Limit,
}

impl Default for OrderMode {
    fn default() -> Self {
        Self::Market
    }
}

impl std::fmt::Display for OrderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

/// Severity grading for alerts and audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Who performed a state change. The kill-switch auto-recovery path only
/// releases engagements made by `SystemRisk`; owner engagements stay until
/// the owner clears them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    #[serde(rename = "owner")]
    Owner,
    #[serde(rename = "system:risk")]
    SystemRisk,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::SystemRisk => write!(f, "system:risk"),
        }
    }
}
