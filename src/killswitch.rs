// =============================================================================
// Kill-Switch Controller — automatic engagement and graceful recovery
// =============================================================================
//
// Runs on a 60-second cadence. A breach is any of:
//
//   - trades in the last hour >= RISK_MAX_TRADES_HOUR
//   - accumulated daily loss <= RISK_DAILY_LOSS_LIMIT
//   - minimum collateral health < RISK_COLLATERAL_MIN_HEALTH
//
// On breach with the switch off, the controller engages it as
// `system:risk`. Recovery requires a continuous breach-free grace period
// and only ever releases engagements made by `system:risk` — an
// owner-engaged switch stays until the owner clears it.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::events::{topic, EventBus};
use crate::records::{AlertRecord, AuditRecord, KillSwitchState};
use crate::risk::RiskGate;
use crate::store::Store;
use crate::types::{Actor, Severity};

pub struct KillSwitchController {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    risk: Arc<RiskGate>,
    max_trades_hour: u32,
    daily_loss_limit: f64,
    collateral_min_health: f64,
    recovery_grace: Duration,
    /// Start of the current continuous no-breach window, while an
    /// auto-engaged switch waits for release.
    recovery_start: Mutex<Option<DateTime<Utc>>>,
}

impl KillSwitchController {
    pub fn new(
        config: &Config,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        risk: Arc<RiskGate>,
    ) -> Self {
        Self {
            store,
            bus,
            risk,
            max_trades_hour: config.risk_max_trades_hour,
            daily_loss_limit: config.risk_daily_loss_limit,
            collateral_min_health: config.risk_collateral_min_health,
            recovery_grace: Duration::minutes(config.risk_recovery_grace_min as i64),
            recovery_start: Mutex::new(None),
        }
    }

    /// One controller tick: read risk state, engage or recover.
    pub async fn evaluate(&self) {
        let breaches = self.current_breaches().await;
        let current = match self.store.read_kill_switch().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "kill switch unreadable — controller tick skipped");
                return;
            }
        };

        if !breaches.is_empty() {
            *self.recovery_start.lock() = None;
            if !current.enabled {
                self.engage(breaches).await;
            }
            return;
        }

        // No breach. Only auto-engaged switches are eligible for release.
        if current.enabled && current.set_by == Some(Actor::SystemRisk) {
            let now = Utc::now();
            let started = {
                let mut guard = self.recovery_start.lock();
                *guard.get_or_insert(now)
            };
            if now - started >= self.recovery_grace {
                self.disengage().await;
                *self.recovery_start.lock() = None;
            } else {
                info!(
                    since = %started,
                    "kill switch recovery window open — waiting for grace period"
                );
            }
        }
    }

    /// Manually set or clear the switch (owner path). Manual changes reset
    /// the recovery timer.
    pub async fn set_manual(&self, enabled: bool, reason: Option<String>, actor: Actor) {
        let state = KillSwitchState {
            enabled,
            reason,
            set_by: Some(actor),
            timestamp: Utc::now(),
        };
        *self.recovery_start.lock() = None;
        self.apply(state, Severity::Warning).await;
    }

    async fn current_breaches(&self) -> Vec<String> {
        let mut breaches = Vec::new();

        let trades = self.risk.trades_last_hour();
        if trades >= self.max_trades_hour {
            breaches.push(format!(
                "trade velocity {trades}/h >= {}",
                self.max_trades_hour
            ));
        }

        let daily_loss = self.risk.daily_loss();
        if daily_loss <= self.daily_loss_limit {
            breaches.push(format!(
                "daily loss {daily_loss:.2} <= {:.2}",
                self.daily_loss_limit
            ));
        }

        let min_health = self
            .store
            .list_collateral()
            .await
            .unwrap_or_default()
            .iter()
            .map(|c| c.health)
            .fold(f64::INFINITY, f64::min);
        if min_health < self.collateral_min_health {
            breaches.push(format!(
                "collateral health {min_health:.2} < {:.2}",
                self.collateral_min_health
            ));
        }

        breaches
    }

    async fn engage(&self, breaches: Vec<String>) {
        let reason = breaches.join("; ");
        warn!(%reason, "risk breach — engaging kill switch");
        let state = KillSwitchState {
            enabled: true,
            reason: Some(reason),
            set_by: Some(Actor::SystemRisk),
            timestamp: Utc::now(),
        };
        self.apply(state, Severity::High).await;
    }

    async fn disengage(&self) {
        info!("breach-free grace period elapsed — releasing kill switch");
        let state = KillSwitchState {
            enabled: false,
            reason: Some("auto-recovered after grace period".to_string()),
            set_by: Some(Actor::SystemRisk),
            timestamp: Utc::now(),
        };
        self.apply(state, Severity::Info).await;
    }

    async fn apply(&self, state: KillSwitchState, severity: Severity) {
        if let Err(e) = self.store.upsert_kill_switch(&state).await {
            warn!(error = %e, "kill switch state not persisted");
            return;
        }
        self.bus.publish(
            topic::KILL_SWITCH_CHANGED,
            serde_json::to_value(&state).unwrap_or_default(),
        );

        let verb = if state.enabled { "engaged" } else { "released" };
        let message = format!(
            "kill switch {verb} by {}{}",
            state.set_by.map(|a| a.to_string()).unwrap_or_default(),
            state
                .reason
                .as_deref()
                .map(|r| format!(": {r}"))
                .unwrap_or_default()
        );
        let alert = AlertRecord::new("killswitch", severity, message.clone());
        if let Err(e) = self.store.record_alert(&alert).await {
            warn!(error = %e, "kill switch alert not persisted");
        }
        self.bus
            .publish(topic::ALERT, serde_json::to_value(&alert).unwrap_or_default());
        if let Err(e) = self
            .store
            .insert_audit(&AuditRecord::new("killswitch", message))
            .await
        {
            warn!(error = %e, "kill switch audit not persisted");
        }
    }
}
