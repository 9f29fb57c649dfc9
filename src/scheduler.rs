// =============================================================================
// Scheduler Supervisor — owns every periodic task
// =============================================================================
//
// Parallel cooperative workers: each task is its own tokio loop that yields
// between runs and exits on the shutdown signal. Overlapping ticks are
// skipped, never queued (fixed-delay scheduling; an interval elapsing while
// the previous run is still in flight is simply missed).
//
// The snapshot cadence is dynamic: a watch channel carries the current
// interval in minutes, and the volatility controller retargets it between
// the configured fast and slow settings.
//
// LIGHT_MODE skips this module entirely (diagnostics-only run).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::events::topic;
use crate::indicators::returns_stddev_pct;
use crate::records::{AlertRecord, Approval, ApprovalStatus, AuditRecord};
use crate::types::Severity;

/// Cadences that are not configurable.
const RULE_TICK_SECS: u64 = 60;
const KILL_SWITCH_SECS: u64 = 60;
const PERFORMANCE_SECS: u64 = 300;
const ANOMALY_SECS: u64 = 300;
const CADENCE_SECS: u64 = 300;
const DIAGNOSTICS_SECS: u64 = 300;
const MFA_GC_SECS: u64 = 600;
const LEARNING_SECS: u64 = 3600;
const DAILY_SECS: u64 = 86_400;
const OPTIMIZER_UTC_HOUR: u32 = 2;

/// Suppression window for repeated performance alerts of the same kind.
const PERF_ALERT_SUPPRESS_SECS: u64 = 3600;

// =============================================================================
// Spawn
// =============================================================================

/// Start every periodic task. Each handle exits cleanly once `shutdown`
/// flips to true.
pub fn spawn_all(
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    info!("scheduler starting all periodic tasks");
    vec![
        spawn_snapshot_loop(state.clone(), shutdown.clone()),
        spawn_rule_tick(state.clone(), shutdown.clone()),
        spawn_fixed(state.clone(), shutdown.clone(), "killswitch", KILL_SWITCH_SECS, |s| async move {
            s.killswitch.evaluate().await;
        }),
        spawn_performance(state.clone(), shutdown.clone()),
        spawn_fixed(state.clone(), shutdown.clone(), "anomaly", ANOMALY_SECS, |s| async move {
            s.anomaly.run_check().await;
        }),
        spawn_fixed(state.clone(), shutdown.clone(), "cadence", CADENCE_SECS, |s| async move {
            reevaluate_cadence(&s).await;
        }),
        spawn_fixed(state.clone(), shutdown.clone(), "diagnostics", DIAGNOSTICS_SECS, |s| async move {
            write_diagnostics(&s).await;
        }),
        spawn_fixed(state.clone(), shutdown.clone(), "mfa-gc", MFA_GC_SECS, |s| async move {
            if let Err(e) = s.store.gc_expired_mfa(Utc::now()).await {
                warn!(error = %e, "MFA garbage collection failed");
            }
        }),
        spawn_fixed(state.clone(), shutdown.clone(), "learning", LEARNING_SECS, |s| async move {
            s.learning.recompute().await;
        }),
        spawn_nightly_optimizer(state.clone(), shutdown.clone()),
        spawn_fixed(state.clone(), shutdown.clone(), "backtest", DAILY_SECS, |s| async move {
            backtest_pass(&s).await;
        }),
        spawn_fixed(state, shutdown, "credentials", DAILY_SECS, |s| async move {
            credential_rotation_check(&s).await;
        }),
    ]
}

/// Generic fixed-period worker. Missed ticks are skipped, not queued.
fn spawn_fixed<F, Fut>(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
    name: &'static str,
    period_secs: u64,
    job: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<AppState>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(period_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first interval tick fires immediately; consume it so every
        // task starts one full period after boot.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => job(state.clone()).await,
                _ = shutdown.changed() => {
                    info!(task = name, "scheduler task stopped");
                    return;
                }
            }
        }
    })
}

// =============================================================================
// Snapshot loop (dynamic cadence)
// =============================================================================

fn spawn_snapshot_loop(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval_rx = state.snapshot_interval_rx.clone();
        loop {
            let minutes = *interval_rx.borrow();
            tokio::select! {
                _ = sleep(Duration::from_secs(minutes * 60)) => {
                    state.snapshots.capture("scheduled").await;
                }
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // Cadence retargeted: the pending sleep is cancelled and
                    // a fresh timer starts atomically on the next loop.
                    info!(minutes = *interval_rx.borrow(), "snapshot cadence re-armed");
                }
                _ = shutdown.changed() => {
                    info!(task = "snapshot", "scheduler task stopped");
                    return;
                }
            }
        }
    })
}

// =============================================================================
// Rule tick (evaluate -> gate -> route, plus the profit scanner)
// =============================================================================

fn spawn_rule_tick(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(RULE_TICK_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    state.pipeline.run_rule_tick(&state.evaluator).await;
                    state.scanner.scan().await;
                }
                _ = shutdown.changed() => {
                    info!(task = "rules", "scheduler task stopped");
                    return;
                }
            }
        }
    })
}

// =============================================================================
// Volatility-adaptive snapshot cadence
// =============================================================================

/// Recompute the 24h return stddev of BTC (XRP fallback) and retarget the
/// snapshot interval when a threshold is crossed. Emits a `cadence` alert
/// on every change.
pub async fn reevaluate_cadence(state: &AppState) {
    let snapshots = state
        .store
        .snapshots_since(Utc::now() - ChronoDuration::hours(24))
        .await
        .unwrap_or_default();

    let series_for = |symbol: &str| -> Vec<f64> {
        snapshots
            .iter()
            .filter_map(|s| s.prices.get(symbol).copied())
            .filter(|p| *p > 0.0)
            .collect()
    };
    let mut series = series_for("BTC");
    if series.len() < 3 {
        series = series_for("XRP");
    }
    let Some(std) = returns_stddev_pct(&series) else {
        return;
    };

    let cfg = &state.config;
    let current = state.snapshot_interval_minutes();
    let target = if std >= cfg.vol_high_stddev_pct {
        cfg.vol_snapshot_fast_minutes
    } else if std <= cfg.vol_low_stddev_pct {
        cfg.vol_snapshot_slow_minutes
    } else {
        return;
    };
    if target == current {
        return;
    }

    if state.snapshot_interval_tx.send(target).is_err() {
        return;
    }
    info!(stddev_pct = std, from = current, to = target, "snapshot cadence retargeted");

    let alert = AlertRecord::new(
        "cadence",
        Severity::Info,
        format!("snapshot cadence {current} -> {target} min (24h stddev {std:.2}%)"),
    )
    .with_data(serde_json::json!({
        "stddev_pct": std,
        "from_minutes": current,
        "to_minutes": target,
    }));
    if let Err(e) = state.store.record_alert(&alert).await {
        warn!(error = %e, "cadence alert not persisted");
    }
    state
        .bus
        .publish(topic::ALERT, serde_json::to_value(&alert).unwrap_or_default());
}

// =============================================================================
// Performance alerting
// =============================================================================

fn spawn_performance(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(PERFORMANCE_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut last_fired: HashMap<&'static str, Instant> = HashMap::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => performance_check(&state, &mut last_fired).await,
                _ = shutdown.changed() => {
                    info!(task = "performance", "scheduler task stopped");
                    return;
                }
            }
        }
    })
}

/// Warn when the daily loss is near its limit; note a weak 24h trend. Each
/// alert kind fires at most once per hour.
async fn performance_check(state: &AppState, last_fired: &mut HashMap<&'static str, Instant>) {
    let mut due = |kind: &'static str| -> bool {
        let now = Instant::now();
        match last_fired.get(kind) {
            Some(at) if now.duration_since(*at).as_secs() < PERF_ALERT_SUPPRESS_SECS => false,
            _ => {
                last_fired.insert(kind, now);
                true
            }
        }
    };

    let risk = state.risk.view();
    let limit = state.config.risk_daily_loss_limit;
    if limit < 0.0 && risk.daily_loss <= limit * 0.8 && due("daily_loss_nearing") {
        let alert = AlertRecord::new(
            "performance",
            Severity::Warning,
            format!(
                "daily loss {:.2} is within 20% of the {:.2} limit",
                risk.daily_loss, limit
            ),
        );
        raise(state, alert).await;
    }

    let snapshots = state
        .store
        .snapshots_since(Utc::now() - ChronoDuration::hours(24))
        .await
        .unwrap_or_default();
    if let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) {
        let (start, end) = (first.total_value_usd(), last.total_value_usd());
        if start > 0.0 {
            let change_pct = (end - start) / start * 100.0;
            if change_pct <= -5.0 && due("portfolio_drawdown_24h") {
                let alert = AlertRecord::new(
                    "performance",
                    Severity::Info,
                    format!("portfolio down {change_pct:.2}% over 24h"),
                );
                raise(state, alert).await;
            }
        }
    }
}

// =============================================================================
// Diagnostics writer
// =============================================================================

async fn write_diagnostics(state: &AppState) {
    let risk = state.risk.view();
    let entry = AuditRecord::new("diagnostics", "periodic diagnostics").with_data(
        serde_json::json!({
            "uptime_secs": state.uptime_secs(),
            "db_connected": state.store.is_connected(),
            "subscribers": state.bus.subscriber_count(),
            "trades_last_hour": risk.trades_last_hour,
            "daily_loss": risk.daily_loss,
            "snapshot_interval_minutes": state.snapshot_interval_minutes(),
            "dry_run": state.config.effective_dry_run(),
        }),
    );
    if let Err(e) = state.store.insert_audit(&entry).await {
        warn!(error = %e, "diagnostics entry not persisted");
    }
}

// =============================================================================
// Nightly optimizer
// =============================================================================

fn spawn_nightly_optimizer(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = secs_until_utc_hour(OPTIMIZER_UTC_HOUR);
            tokio::select! {
                _ = sleep(Duration::from_secs(wait)) => optimizer_pass(&state).await,
                _ = shutdown.changed() => {
                    info!(task = "optimizer", "scheduler task stopped");
                    return;
                }
            }
        }
    })
}

/// Seconds until the next occurrence of `hour`:00 UTC.
fn secs_until_utc_hour(hour: u32) -> u64 {
    let now = Utc::now();
    let today = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .expect("static time is valid")
        .and_utc();
    let next = if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    };
    (next - now).num_seconds().max(1) as u64
}

/// Rules whose proposals keep getting declined are flagged for disabling —
/// as a proposed approval, never a direct write.
pub async fn optimizer_pass(state: &AppState) {
    let rules = state.store.list_rules().await.unwrap_or_default();
    let declined = state
        .store
        .list_approvals(Some(ApprovalStatus::Declined), 1000)
        .await
        .unwrap_or_default();
    let cutoff = Utc::now() - ChronoDuration::hours(24);

    let mut proposed = 0usize;
    for rule in rules.iter().filter(|r| r.enabled) {
        let declines = declined
            .iter()
            .filter(|a| a.created_at >= cutoff)
            .filter(|a| a.metadata["intent"]["rule_id"].as_str() == Some(rule.id.as_str()))
            .count();
        if declines < 3 {
            continue;
        }
        match state.store.has_open_approval("rule_update", &rule.id).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(_) => break,
        }

        let mut approval = Approval::new(
            "rule_update",
            format!("disable rule '{}'", rule.name),
        );
        approval.symbol = Some(rule.id.clone());
        approval.summary = format!(
            "{declines} proposals from this rule were declined in the last 24h"
        );
        approval.metadata = serde_json::json!({
            "rule_id": rule.id,
            "proposed": { "enabled": false },
            "declines_24h": declines,
        });
        if state.store.create_approval(&approval).await.is_ok() {
            state.bus.publish(
                topic::APPROVAL_CREATED,
                serde_json::to_value(&approval).unwrap_or_default(),
            );
            proposed += 1;
        }
    }

    let entry = AuditRecord::new("optimizer", "nightly optimizer pass").with_data(
        serde_json::json!({ "rules": rules.len(), "proposed_updates": proposed }),
    );
    if let Err(e) = state.store.insert_audit(&entry).await {
        warn!(error = %e, "optimizer audit not persisted");
    }
}

// =============================================================================
// Scheduled backtest
// =============================================================================

/// Replay the enabled rules against each snapshot of the trailing day and
/// record how often they would have fired. Purely informational.
pub async fn backtest_pass(state: &AppState) {
    let snapshots = state
        .store
        .snapshots_since(Utc::now() - ChronoDuration::hours(24))
        .await
        .unwrap_or_default();
    let rules = state.store.list_rules().await.unwrap_or_default();
    if snapshots.is_empty() || rules.is_empty() {
        return;
    }

    let mut intents_total = 0usize;
    for (i, snap) in snapshots.iter().enumerate() {
        let history = &snapshots[..=i];
        let intents = state.evaluator.evaluate_tick(&crate::evaluator::EvalInputs {
            snapshot: snap,
            history,
            rules: &rules,
            external_events: &Default::default(),
        });
        intents_total += intents.len();
    }

    let entry = AuditRecord::new("backtest", "daily rule replay").with_data(serde_json::json!({
        "snapshots": snapshots.len(),
        "rules": rules.len(),
        "intents": intents_total,
    }));
    if let Err(e) = state.store.insert_audit(&entry).await {
        warn!(error = %e, "backtest audit not persisted");
    }
}

// =============================================================================
// Credential rotation check
// =============================================================================

async fn credential_rotation_check(state: &AppState) {
    let configured = !state.config.broker_api_key.is_empty();
    if !configured && !state.config.effective_dry_run() {
        let alert = AlertRecord::new(
            "credentials",
            Severity::Warning,
            "live mode without brokerage credentials",
        );
        raise(state, alert).await;
    }
    let entry = AuditRecord::new("credentials", "rotation check").with_data(
        serde_json::json!({ "configured": configured }),
    );
    if let Err(e) = state.store.insert_audit(&entry).await {
        warn!(error = %e, "credential audit not persisted");
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn raise(state: &AppState, alert: AlertRecord) {
    if let Err(e) = state.store.record_alert(&alert).await {
        warn!(error = %e, "alert not persisted");
    }
    state
        .bus
        .publish(topic::ALERT, serde_json::to_value(&alert).unwrap_or_default());
}
