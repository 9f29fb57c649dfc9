// =============================================================================
// Configuration — enumerated environment-backed settings, frozen at startup
// =============================================================================
//
// Every runtime knob the supervisor recognises lives here. Values are read
// from the environment exactly once, defaulted, validated, and then the
// resulting `Config` is immutable for the life of the process.
//
// SAFETY: `DRY_RUN=false` without a configured `OWNER_ID` is coerced back to
// true with a warning. Simulated execution is the failure-safe default; it is
// never a fatal misconfiguration.
// =============================================================================

use serde::Serialize;
use std::str::FromStr;
use tracing::warn;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_port() -> u16 {
    8787
}

fn default_db_path() -> String {
    "coinward.db".to_string()
}

fn default_mfa_threshold_usd() -> f64 {
    100.0
}

fn default_auto_execute_max_per_tick() -> usize {
    1
}

fn default_risk_max_trades_hour() -> u32 {
    4
}

fn default_risk_daily_loss_limit() -> f64 {
    -1000.0
}

fn default_risk_collateral_min_health() -> f64 {
    1.2
}

fn default_risk_recovery_grace_min() -> u64 {
    30
}

fn default_risk_assumed_peak_mult() -> f64 {
    1.2
}

fn default_max_slippage_pct() -> f64 {
    0.02
}

fn default_snapshot_interval_minutes() -> u64 {
    60
}

fn default_vol_high_stddev_pct() -> f64 {
    3.0
}

fn default_vol_low_stddev_pct() -> f64 {
    1.0
}

fn default_vol_snapshot_fast_minutes() -> u64 {
    15
}

fn default_vol_snapshot_slow_minutes() -> u64 {
    60
}

fn default_anomaly_single_step_pct() -> f64 {
    2.0
}

fn default_anomaly_z_threshold() -> f64 {
    3.0
}

fn default_profit_taking_min_gain_pct() -> f64 {
    25.0
}

fn default_fee_rate() -> f64 {
    0.006
}

fn default_broker_base_url() -> String {
    "https://api.exchange.coinbase.com".to_string()
}

// =============================================================================
// Config
// =============================================================================

/// Frozen runtime configuration. Secrets (`broker_api_key`,
/// `broker_api_secret`) are excluded from serialisation so the `/env`
/// endpoint can return the struct directly.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// When true every execution request is simulated; no order reaches the
    /// venue. Forced true when `owner_id` is unset.
    pub dry_run: bool,

    /// Identifier required in `X-Owner-Id` for state-changing endpoints.
    /// `None` leaves the process read-only + simulated.
    pub owner_id: Option<String>,

    /// Desired HTTP port; binding retries `port+1..=port+4` on conflict.
    pub port: u16,

    /// SQLite database path.
    pub db_path: String,

    /// Notional (USD) above which an execution requires an MFA code.
    pub mfa_threshold_usd: f64,

    /// Master switch for the auto-execution path.
    pub auto_execute_enabled: bool,

    /// Cap on auto-executed intents per rule-evaluation tick.
    pub auto_execute_max_per_tick: usize,

    /// Velocity gate and kill-switch breach input: executions per hour.
    pub risk_max_trades_hour: u32,

    /// Daily loss gate and breach input (USD, negative).
    pub risk_daily_loss_limit: f64,

    /// Collateral health below which the kill switch engages.
    pub risk_collateral_min_health: f64,

    /// Continuous breach-free minutes before an auto-engaged kill switch
    /// releases.
    pub risk_recovery_grace_min: u64,

    /// Assumed-peak multiplier for the max-drawdown heuristic.
    pub risk_assumed_peak_mult: f64,

    /// Maximum tolerated |price - limit_price| / price for limit orders.
    pub max_slippage_pct: f64,

    /// Initial snapshot cadence in minutes.
    pub snapshot_interval_minutes: u64,

    /// 24h return stddev (percent) at or above which snapshots speed up.
    pub vol_high_stddev_pct: f64,

    /// 24h return stddev (percent) at or below which snapshots slow down.
    pub vol_low_stddev_pct: f64,

    /// Fast snapshot cadence in minutes.
    pub vol_snapshot_fast_minutes: u64,

    /// Slow snapshot cadence in minutes.
    pub vol_snapshot_slow_minutes: u64,

    /// Single-step portfolio move (percent) flagged as a high anomaly.
    pub anomaly_single_step_pct: f64,

    /// |z| of the latest portfolio total flagged as an anomaly.
    pub anomaly_z_threshold: f64,

    /// Minimum gain over average buy before the profit-taking scanner
    /// proposes a sale.
    pub profit_taking_min_gain_pct: f64,

    /// Fee fraction used when estimating net sale proceeds.
    pub fee_rate: f64,

    /// Diagnostics-only run: no schedulers are started.
    pub light_mode: bool,

    /// Brokerage REST base URL.
    pub broker_base_url: String,

    /// Brokerage API key.
    #[serde(skip_serializing)]
    pub broker_api_key: String,

    /// Brokerage API secret (HMAC signing key).
    #[serde(skip_serializing)]
    pub broker_api_secret: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dry_run: true,
            owner_id: None,
            port: default_port(),
            db_path: default_db_path(),
            mfa_threshold_usd: default_mfa_threshold_usd(),
            auto_execute_enabled: false,
            auto_execute_max_per_tick: default_auto_execute_max_per_tick(),
            risk_max_trades_hour: default_risk_max_trades_hour(),
            risk_daily_loss_limit: default_risk_daily_loss_limit(),
            risk_collateral_min_health: default_risk_collateral_min_health(),
            risk_recovery_grace_min: default_risk_recovery_grace_min(),
            risk_assumed_peak_mult: default_risk_assumed_peak_mult(),
            max_slippage_pct: default_max_slippage_pct(),
            snapshot_interval_minutes: default_snapshot_interval_minutes(),
            vol_high_stddev_pct: default_vol_high_stddev_pct(),
            vol_low_stddev_pct: default_vol_low_stddev_pct(),
            vol_snapshot_fast_minutes: default_vol_snapshot_fast_minutes(),
            vol_snapshot_slow_minutes: default_vol_snapshot_slow_minutes(),
            anomaly_single_step_pct: default_anomaly_single_step_pct(),
            anomaly_z_threshold: default_anomaly_z_threshold(),
            profit_taking_min_gain_pct: default_profit_taking_min_gain_pct(),
            fee_rate: default_fee_rate(),
            light_mode: false,
            broker_base_url: default_broker_base_url(),
            broker_api_key: String::new(),
            broker_api_secret: String::new(),
        }
    }
}

impl Config {
    /// Read the full configuration from the process environment, apply
    /// defaults, and validate.
    pub fn from_env() -> Self {
        let mut cfg = Self {
            dry_run: env_bool("DRY_RUN", true),
            owner_id: env_opt("OWNER_ID"),
            port: env_parse("PORT", default_port()),
            db_path: env_string("DB_PATH", default_db_path()),
            mfa_threshold_usd: env_parse("MFA_THRESHOLD_USD", default_mfa_threshold_usd()),
            auto_execute_enabled: env_bool("AUTO_EXECUTE_ENABLED", false),
            auto_execute_max_per_tick: env_parse(
                "AUTO_EXECUTE_MAX_PER_TICK",
                default_auto_execute_max_per_tick(),
            ),
            risk_max_trades_hour: env_parse(
                "AUTO_EXECUTE_RISK_MAX_TRADES_HOUR",
                default_risk_max_trades_hour(),
            ),
            risk_daily_loss_limit: env_parse(
                "AUTO_EXECUTE_DAILY_LOSS_LIMIT",
                default_risk_daily_loss_limit(),
            ),
            risk_collateral_min_health: env_parse(
                "RISK_COLLATERAL_MIN_HEALTH",
                default_risk_collateral_min_health(),
            ),
            risk_recovery_grace_min: env_parse(
                "RISK_RECOVERY_GRACE_MIN",
                default_risk_recovery_grace_min(),
            ),
            risk_assumed_peak_mult: env_parse(
                "RISK_ASSUMED_PEAK_MULT",
                default_risk_assumed_peak_mult(),
            ),
            max_slippage_pct: env_parse("MAX_SLIPPAGE_PCT", default_max_slippage_pct()),
            snapshot_interval_minutes: env_parse(
                "SNAPSHOT_INTERVAL_MINUTES",
                default_snapshot_interval_minutes(),
            ),
            vol_high_stddev_pct: env_parse("VOL_HIGH_STDDEV_PCT", default_vol_high_stddev_pct()),
            vol_low_stddev_pct: env_parse("VOL_LOW_STDDEV_PCT", default_vol_low_stddev_pct()),
            vol_snapshot_fast_minutes: env_parse(
                "VOL_SNAPSHOT_FAST_MINUTES",
                default_vol_snapshot_fast_minutes(),
            ),
            vol_snapshot_slow_minutes: env_parse(
                "VOL_SNAPSHOT_SLOW_MINUTES",
                default_vol_snapshot_slow_minutes(),
            ),
            anomaly_single_step_pct: env_parse(
                "ANOMALY_SINGLE_STEP_PCT",
                default_anomaly_single_step_pct(),
            ),
            anomaly_z_threshold: env_parse("ANOMALY_Z_THRESHOLD", default_anomaly_z_threshold()),
            profit_taking_min_gain_pct: env_parse(
                "PROFIT_TAKING_MIN_GAIN_PCT",
                default_profit_taking_min_gain_pct(),
            ),
            fee_rate: env_parse("FEE_RATE", default_fee_rate()),
            light_mode: env_bool("LIGHT_MODE", false),
            broker_base_url: env_string("BROKER_BASE_URL", default_broker_base_url()),
            broker_api_key: env_string("BROKER_API_KEY", String::new()),
            broker_api_secret: env_string("BROKER_API_SECRET", String::new()),
        };
        cfg.validate();
        cfg
    }

    /// Apply safety coercions. Called once from `from_env`; public so tests
    /// can exercise the rules directly.
    pub fn validate(&mut self) {
        if !self.dry_run && self.owner_id.is_none() {
            warn!("DRY_RUN=false requires OWNER_ID — coercing DRY_RUN back to true");
            self.dry_run = true;
        }
        if self.auto_execute_max_per_tick == 0 {
            warn!("AUTO_EXECUTE_MAX_PER_TICK=0 disables auto-execution entirely");
        }
        if self.vol_snapshot_fast_minutes > self.vol_snapshot_slow_minutes {
            warn!(
                fast = self.vol_snapshot_fast_minutes,
                slow = self.vol_snapshot_slow_minutes,
                "fast snapshot cadence exceeds slow cadence — swapping"
            );
            std::mem::swap(
                &mut self.vol_snapshot_fast_minutes,
                &mut self.vol_snapshot_slow_minutes,
            );
        }
    }

    /// Effective dry-run flag: true when globally requested or when no owner
    /// is configured.
    pub fn effective_dry_run(&self) -> bool {
        self.dry_run || self.owner_id.is_none()
    }
}

// =============================================================================
// Env helpers
// =============================================================================

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_string(key: &str, default: String) -> String {
    env_opt(key).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env_opt(key) {
        Some(v) => match v.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(key, value = %v, "unparseable config value — using default");
                default
            }
        },
        None => default,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = Config::default();
        assert!(cfg.dry_run);
        assert!(cfg.owner_id.is_none());
        assert_eq!(cfg.port, 8787);
        assert!((cfg.mfa_threshold_usd - 100.0).abs() < f64::EPSILON);
        assert!(!cfg.auto_execute_enabled);
        assert_eq!(cfg.auto_execute_max_per_tick, 1);
        assert_eq!(cfg.risk_max_trades_hour, 4);
        assert!((cfg.risk_daily_loss_limit + 1000.0).abs() < f64::EPSILON);
        assert!((cfg.max_slippage_pct - 0.02).abs() < f64::EPSILON);
        assert_eq!(cfg.snapshot_interval_minutes, 60);
        assert!((cfg.vol_high_stddev_pct - 3.0).abs() < f64::EPSILON);
        assert!((cfg.vol_low_stddev_pct - 1.0).abs() < f64::EPSILON);
        assert_eq!(cfg.vol_snapshot_fast_minutes, 15);
        assert!((cfg.anomaly_single_step_pct - 2.0).abs() < f64::EPSILON);
        assert!((cfg.anomaly_z_threshold - 3.0).abs() < f64::EPSILON);
        assert!((cfg.fee_rate - 0.006).abs() < f64::EPSILON);
        assert!(!cfg.light_mode);
    }

    #[test]
    fn dry_run_false_without_owner_coerces_to_true() {
        let mut cfg = Config {
            dry_run: false,
            owner_id: None,
            ..Config::default()
        };
        cfg.validate();
        assert!(cfg.dry_run);
        assert!(cfg.effective_dry_run());
    }

    #[test]
    fn dry_run_false_with_owner_is_honoured() {
        let mut cfg = Config {
            dry_run: false,
            owner_id: Some("alice".to_string()),
            ..Config::default()
        };
        cfg.validate();
        assert!(!cfg.dry_run);
        assert!(!cfg.effective_dry_run());
    }

    #[test]
    fn effective_dry_run_true_when_owner_missing() {
        let cfg = Config {
            dry_run: true,
            owner_id: None,
            ..Config::default()
        };
        assert!(cfg.effective_dry_run());
    }

    #[test]
    fn swapped_cadences_are_corrected() {
        let mut cfg = Config {
            vol_snapshot_fast_minutes: 90,
            vol_snapshot_slow_minutes: 10,
            ..Config::default()
        };
        cfg.validate();
        assert_eq!(cfg.vol_snapshot_fast_minutes, 10);
        assert_eq!(cfg.vol_snapshot_slow_minutes, 90);
    }

    #[test]
    fn secrets_are_not_serialised() {
        let cfg = Config {
            broker_api_key: "key".to_string(),
            broker_api_secret: "secret".to_string(),
            ..Config::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("broker_api_key"));
    }
}
