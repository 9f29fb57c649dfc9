// =============================================================================
// Approval / Execution Pipeline — intent intake, approvals, and orders
// =============================================================================
//
// Routes every gated intent to one of two paths:
//
//   - approval path: a pending Approval record + `approval:created`
//   - auto-execution: bounded per tick, enter/exit actions only
//
// Execution requests re-run their pre-flight checks at call time (kill
// switch, limit sanity, live balance, velocity, daily loss) — intake-time
// knowledge is considered stale. With `DRY_RUN` (or no configured owner)
// the pipeline simulates and never contacts the venue.
//
// Rejections, MFA prompts, and MFA failures are ordinary outcomes; only
// genuine venue faults surface as errors.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::broker::{Brokerage, OrderRequest};
use crate::config::Config;
use crate::errors::BrokerError;
use crate::evaluator::{EvalInputs, Evaluator};
use crate::events::{topic, EventBus};
use crate::mfa::{MfaCheck, MfaService};
use crate::records::{
    AlertRecord, Approval, ApprovalStatus, AuditRecord, ExecutionRecord, Snapshot,
};
use crate::risk::{GateContext, RiskGate};
use crate::rules::{Action, Intent, Rule};
use crate::store::Store;
use crate::types::{is_core_symbol, OrderMode, Severity, Side};

// =============================================================================
// Request / outcome types
// =============================================================================

/// One execution request entering the pipeline.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub side: Side,
    pub symbol: String,
    pub amount: f64,
    pub mode: OrderMode,
    pub limit_price: Option<f64>,
    pub reason: String,
    pub approval_id: Option<String>,
    pub rule_id: Option<String>,
    /// Notional estimate used for the MFA threshold.
    pub estimated_value_usd: Option<f64>,
    pub mfa_code: Option<String>,
    /// Who asked for this execution ("owner", "system:auto").
    pub actor: String,
    /// Force simulation regardless of global dry-run.
    pub force_dry_run: bool,
}

/// Outcome of an execution attempt. Every variant is normal control flow.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecOutcome {
    Executed { execution: ExecutionRecord },
    Simulated { execution: ExecutionRecord },
    MfaRequired { expires_at: DateTime<Utc> },
    MfaFailed { reason: String },
    Rejected { code: String },
}

impl ExecOutcome {
    pub fn execution(&self) -> Option<&ExecutionRecord> {
        match self {
            Self::Executed { execution } | Self::Simulated { execution } => Some(execution),
            _ => None,
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct ExecutionPipeline {
    config: Arc<Config>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    broker: Arc<dyn Brokerage>,
    risk: Arc<RiskGate>,
    mfa: Arc<MfaService>,
    shutting_down: AtomicBool,
    /// External event names accumulated for event-triggered rules; drained
    /// each tick.
    pending_events: Mutex<HashSet<String>>,
}

impl ExecutionPipeline {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        broker: Arc<dyn Brokerage>,
        risk: Arc<RiskGate>,
        mfa: Arc<MfaService>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            broker,
            risk,
            mfa,
            shutting_down: AtomicBool::new(false),
            pending_events: Mutex::new(HashSet::new()),
        }
    }

    /// Refuse all new work from now on (shutdown path).
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Queue an external event for event-triggered rules on the next tick.
    pub fn notify_external_event(&self, name: &str) {
        self.pending_events.lock().insert(name.to_string());
    }

    // =========================================================================
    // Rule tick: evaluate -> gate -> route
    // =========================================================================

    /// One full rule-evaluation tick. Returns the number of intents routed.
    pub async fn run_rule_tick(&self, evaluator: &Evaluator) -> usize {
        if self.shutting_down.load(Ordering::Acquire) {
            return 0;
        }

        // Engaged kill switch: the evaluator is skipped entirely.
        match self.store.read_kill_switch().await {
            Ok(ks) if ks.enabled => {
                info!("kill switch engaged — skipping rule evaluation");
                return 0;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "kill switch unreadable — skipping rule tick");
                return 0;
            }
        }

        let Ok(Some(snapshot)) = self.store.latest_snapshot().await else {
            return 0;
        };
        let rules = self.store.list_rules().await.unwrap_or_default();
        if rules.is_empty() {
            return 0;
        }
        let history = self
            .store
            .snapshots_since(Utc::now() - Duration::hours(24))
            .await
            .unwrap_or_default();
        let baselines = self.store.list_baselines().await.unwrap_or_default();
        let collateral = self.store.list_collateral().await.unwrap_or_default();
        let external_events: HashSet<String> =
            std::mem::take(&mut *self.pending_events.lock());

        let intents = evaluator.evaluate_tick(&EvalInputs {
            snapshot: &snapshot,
            history: &history,
            rules: &rules,
            external_events: &external_events,
        });
        if intents.is_empty() {
            return 0;
        }

        let ctx = GateContext {
            snapshot: &snapshot,
            baselines: &baselines,
            collateral: &collateral,
        };

        let mut routed = 0;
        let mut auto_executed = 0;
        for intent in intents {
            let Some(rule) = rules.iter().find(|r| r.id == intent.rule_id) else {
                continue;
            };

            // Notify actions raise an alert and stop there.
            if let Action::Notify { message } = &intent.action {
                self.raise_alert(
                    AlertRecord::new("rule", Severity::Info, message.clone()).with_data(
                        serde_json::json!({ "rule_id": rule.id, "rule": rule.name }),
                    ),
                )
                .await;
                routed += 1;
                continue;
            }

            let decision = self.risk.gate(rule, &ctx, &intent);
            if let Some(code) = decision.code() {
                self.raise_alert(
                    AlertRecord::new(
                        "risk",
                        Severity::Info,
                        format!("intent rejected: {code}"),
                    )
                    .with_data(serde_json::json!({
                        "rule_id": rule.id,
                        "rule": rule.name,
                        "code": code,
                        "action": intent.action,
                    })),
                )
                .await;
                continue;
            }

            let estimated_usd = intent
                .action
                .alloc_pct()
                .map(|pct| pct / 100.0 * snapshot.total_value_usd())
                .unwrap_or(0.0);

            let needs_approval = intent.dry_run
                || !intent
                    .action
                    .symbol()
                    .map(is_core_symbol)
                    .unwrap_or(false)
                || estimated_usd > self.config.mfa_threshold_usd
                || rule.risk.require_approval;

            let auto_slot_open = self.config.auto_execute_enabled
                && auto_executed < self.config.auto_execute_max_per_tick
                && intent.action.is_tradeable();

            if needs_approval || !auto_slot_open {
                if self.create_intent_approval(&intent, estimated_usd, &snapshot).await {
                    routed += 1;
                }
                continue;
            }

            // Auto-execution path.
            let Some(request) = self.request_from_intent(&intent, estimated_usd, &snapshot)
            else {
                continue;
            };
            auto_executed += 1;
            routed += 1;
            match self.execute(request).await {
                Ok(outcome) => {
                    info!(rule = %intent.rule_name, ?outcome, "auto-execution finished")
                }
                Err(e) => {
                    warn!(rule = %intent.rule_name, error = %e, "auto-execution failed");
                    self.audit(
                        "auto_execute",
                        format!("auto-execution failed: {e}"),
                        serde_json::json!({ "rule_id": intent.rule_id }),
                    )
                    .await;
                }
            }
        }
        routed
    }

    fn request_from_intent(
        &self,
        intent: &Intent,
        estimated_usd: f64,
        snapshot: &Snapshot,
    ) -> Option<ExecRequest> {
        let symbol = intent.action.symbol()?.to_string();
        let price = snapshot.prices.get(&symbol).copied().filter(|p| *p > 0.0)?;
        let qty = estimated_usd / price;
        let side = if intent.action.is_entry() {
            Side::Buy
        } else {
            Side::Sell
        };
        Some(ExecRequest {
            side,
            symbol,
            amount: qty,
            mode: OrderMode::Market,
            limit_price: None,
            reason: intent.reason.clone(),
            approval_id: None,
            rule_id: Some(intent.rule_id.clone()),
            estimated_value_usd: Some(estimated_usd),
            mfa_code: None,
            actor: "system:auto".to_string(),
            force_dry_run: false,
        })
    }

    /// Persist an approval for a gated intent and fan out
    /// `approval:created`.
    async fn create_intent_approval(
        &self,
        intent: &Intent,
        estimated_usd: f64,
        snapshot: &Snapshot,
    ) -> bool {
        let Some(symbol) = intent.action.symbol().map(str::to_string) else {
            return false;
        };
        let price = snapshot.prices.get(&symbol).copied().unwrap_or(0.0);
        let qty = if price > 0.0 { estimated_usd / price } else { 0.0 };
        let side = if intent.action.is_entry() {
            Side::Buy
        } else {
            Side::Sell
        };
        let verb = if intent.action.is_entry() { "enter" } else { "exit" };
        let alloc = intent.action.alloc_pct().unwrap_or(0.0);

        let mut approval = Approval::new("trade", format!("{verb} {symbol} {alloc}%"));
        approval.symbol = Some(symbol.clone());
        approval.amount = Some(qty);
        approval.summary = intent.reason.clone();
        approval.metadata = serde_json::json!({
            "intent": {
                "rule_id": intent.rule_id,
                "rule_name": intent.rule_name,
                "side": side,
                "symbol": symbol,
                "qty": qty,
                "reason": intent.reason,
                "dry_run": intent.dry_run,
            },
            "estimated_value_usd": estimated_usd,
        });

        match self.store.create_approval(&approval).await {
            Ok(()) => {
                info!(id = %approval.id, title = %approval.title, "approval created");
                self.bus.publish(
                    topic::APPROVAL_CREATED,
                    serde_json::to_value(&approval).unwrap_or_default(),
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "approval not persisted");
                false
            }
        }
    }

    // =========================================================================
    // Approval actions
    // =========================================================================

    /// Approve or decline a pending approval. Idempotent: repeating a
    /// decision that already holds is a no-op and emits nothing.
    pub async fn decide_approval(
        &self,
        id: &str,
        approve: bool,
        actor: &str,
    ) -> Result<Approval, crate::errors::StoreError> {
        let target = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Declined
        };
        let outcome = self.store.update_approval_status(id, target, actor).await?;
        if outcome.applied() {
            info!(id, status = %target, actor, "approval decided");
            self.bus.publish(
                topic::APPROVAL_UPDATED,
                serde_json::to_value(outcome.approval()).unwrap_or_default(),
            );
            self.audit(
                "approval",
                format!("approval {id} -> {target}"),
                serde_json::json!({ "actor": actor }),
            )
            .await;
        }
        Ok(outcome.approval().clone())
    }

    /// Execute an approval: MFA handshake for large notionals, then the
    /// standard execution path, then the matching status transition.
    pub async fn execute_approval(
        &self,
        id: &str,
        actor: &str,
        mfa_code: Option<String>,
        estimated_value_usd: Option<f64>,
    ) -> Result<ExecOutcome, crate::errors::StoreError> {
        let approval = self
            .store
            .find_approval(id)
            .await?
            .ok_or_else(|| crate::errors::StoreError::NotFound(format!("approval {id}")))?;

        if approval.status.is_terminal() {
            // A replayed code against a finished trade reports the MFA
            // verdict ("already used"), not just the terminal status.
            if let Some(code) = mfa_code.as_deref() {
                if let Ok(MfaCheck::Failed { reason }) = self
                    .mfa
                    .check(&approval.id, actor, serde_json::Value::Null, Some(code))
                    .await
                {
                    return Ok(ExecOutcome::MfaFailed { reason });
                }
            }
            return Ok(ExecOutcome::Rejected {
                code: format!("ALREADY_{}", approval.status.to_string().to_uppercase()),
            });
        }

        let intent = &approval.metadata["intent"];
        let symbol = intent["symbol"]
            .as_str()
            .or(approval.symbol.as_deref())
            .unwrap_or_default()
            .to_string();
        let amount = intent["qty"].as_f64().or(approval.amount).unwrap_or(0.0);
        let side = match intent["side"].as_str() {
            Some("buy") => Side::Buy,
            _ => Side::Sell,
        };
        let estimated = estimated_value_usd
            .or_else(|| approval.metadata["estimated_value_usd"].as_f64());

        let request = ExecRequest {
            side,
            symbol,
            amount,
            mode: OrderMode::Market,
            limit_price: None,
            reason: approval.title.clone(),
            approval_id: Some(approval.id.clone()),
            rule_id: intent["rule_id"].as_str().map(str::to_string),
            estimated_value_usd: estimated,
            mfa_code,
            actor: actor.to_string(),
            force_dry_run: false,
        };

        let outcome = match self.execute(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Venue fault: the approval fails terminally and the fault
                // is audited.
                warn!(id, error = %e, "approval execution failed");
                self.transition_or_log(&approval.id, ApprovalStatus::Failed, actor)
                    .await;
                self.audit(
                    "approval",
                    format!("approval {id} failed: {e}"),
                    serde_json::json!({ "actor": actor }),
                )
                .await;
                return Ok(ExecOutcome::Rejected {
                    code: if e.is_transient() {
                        "BROKER_TRANSIENT".to_string()
                    } else {
                        "BROKER_PERMANENT".to_string()
                    },
                });
            }
        };

        match &outcome {
            ExecOutcome::Executed { .. } => {
                // pending approvals pass through approved on their way out.
                if approval.status == ApprovalStatus::Pending {
                    self.transition_or_log(&approval.id, ApprovalStatus::Approved, actor)
                        .await;
                }
                self.transition_or_log(&approval.id, ApprovalStatus::Executed, actor)
                    .await;
            }
            ExecOutcome::Simulated { .. } => {
                self.transition_or_log(&approval.id, ApprovalStatus::Simulated, actor)
                    .await;
            }
            // MFA prompts and rejections leave the approval as-is.
            _ => {}
        }
        Ok(outcome)
    }

    async fn transition_by_id(
        &self,
        id: &str,
        to: ApprovalStatus,
        actor: &str,
    ) -> Result<(), crate::errors::StoreError> {
        let outcome = self.store.update_approval_status(id, to, actor).await?;
        if outcome.applied() {
            self.bus.publish(
                topic::APPROVAL_UPDATED,
                serde_json::to_value(outcome.approval()).unwrap_or_default(),
            );
        }
        Ok(())
    }

    /// Post-execution status bookkeeping. The order already happened, so a
    /// failed transition (degraded store, racing writer) must not vanish:
    /// it leaves the approval stranded in a non-terminal status, which
    /// would also block the profit scanner's one-open-proposal check.
    async fn transition_or_log(&self, id: &str, to: ApprovalStatus, actor: &str) {
        if let Err(e) = self.transition_by_id(id, to, actor).await {
            warn!(id, status = %to, error = %e, "approval status not updated after execution");
            self.audit(
                "approval",
                format!("approval {id}: transition to {to} failed: {e}"),
                serde_json::json!({ "actor": actor, "target_status": to.to_string() }),
            )
            .await;
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute (or simulate) one order, re-running every pre-flight check.
    pub async fn execute(&self, req: ExecRequest) -> Result<ExecOutcome, BrokerError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Ok(ExecOutcome::Rejected {
                code: "SHUTDOWN_IN_PROGRESS".to_string(),
            });
        }
        if !(req.amount > 0.0) {
            return Ok(ExecOutcome::Rejected {
                code: "INVALID_AMOUNT".to_string(),
            });
        }

        // Kill switch is read fresh — intake-time state is stale.
        match self.store.read_kill_switch().await {
            Ok(ks) if ks.enabled => {
                return Ok(ExecOutcome::Rejected {
                    code: "KILL_SWITCH_ENABLED".to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "kill switch unreadable — refusing execution");
                return Ok(ExecOutcome::Rejected {
                    code: "KILL_SWITCH_UNKNOWN".to_string(),
                });
            }
        }

        // Limit-order sanity.
        if req.mode == OrderMode::Limit {
            let Some(limit) = req.limit_price.filter(|p| *p > 0.0) else {
                return Ok(ExecOutcome::Rejected {
                    code: "INVALID_LIMIT_PRICE".to_string(),
                });
            };
            let market = self.reference_price(&req.symbol).await;
            if let Some(price) = market {
                if ((price - limit).abs() / price) > self.config.max_slippage_pct {
                    return Ok(ExecOutcome::Rejected {
                        code: "SLIPPAGE_EXCEEDED".to_string(),
                    });
                }
            }
        }

        // Velocity and daily-loss gates, re-checked at call time.
        if self.risk.trades_last_hour() >= self.config.risk_max_trades_hour {
            return Ok(ExecOutcome::Rejected {
                code: "VELOCITY_MAX_TRADES".to_string(),
            });
        }
        if self.risk.daily_loss() <= self.config.risk_daily_loss_limit {
            return Ok(ExecOutcome::Rejected {
                code: "DAILY_LOSS_LIMIT".to_string(),
            });
        }

        // MFA for large notionals, bound to the approval id.
        if let (Some(est), Some(trade_id)) = (req.estimated_value_usd, req.approval_id.as_ref())
        {
            if est > self.config.mfa_threshold_usd {
                let check = self
                    .mfa
                    .check(
                        trade_id,
                        &req.actor,
                        serde_json::json!({
                            "symbol": req.symbol,
                            "side": req.side,
                            "amount": req.amount,
                            "estimated_value_usd": est,
                        }),
                        req.mfa_code.as_deref(),
                    )
                    .await
                    .map_err(|e| BrokerError::Transient(e.to_string()))?;
                match check {
                    MfaCheck::ChallengeIssued { expires_at } => {
                        return Ok(ExecOutcome::MfaRequired { expires_at });
                    }
                    MfaCheck::Failed { reason } => {
                        return Ok(ExecOutcome::MfaFailed { reason });
                    }
                    MfaCheck::Verified => {}
                }
            }
        }

        // Simulated path: global dry-run, unset owner, or forced.
        if req.force_dry_run || self.config.effective_dry_run() {
            return Ok(self.simulate(&req).await);
        }

        // Live path: fresh balance check before touching the venue.
        if req.side == Side::Sell {
            let balances = self.broker.fetch_balances().await?;
            let available = balances.get(&req.symbol).map(|b| b.qty).unwrap_or(0.0);
            if available < req.amount {
                return Ok(ExecOutcome::Rejected {
                    code: "INSUFFICIENT_BALANCE".to_string(),
                });
            }
        }

        self.place_live(&req).await
    }

    async fn simulate(&self, req: &ExecRequest) -> ExecOutcome {
        let execution = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            approval_id: req.approval_id.clone(),
            rule_id: req.rule_id.clone(),
            side: req.side,
            symbol: req.symbol.clone(),
            amount: req.amount,
            mode: req.mode,
            order_id: Some(format!("dry-run-{}", uuid::Uuid::new_v4())),
            status: "simulated".to_string(),
            filled_qty: Some(req.amount),
            avg_fill_price: self.reference_price(&req.symbol).await,
            dry_run: true,
            executed_at: Utc::now(),
        };

        self.publish_trade_events(&execution, true);
        self.risk.record_execution(req.rule_id.as_deref(), None);
        if let Err(e) = self.store.append_execution(&execution).await {
            warn!(error = %e, "simulated execution not persisted");
        }
        info!(
            symbol = %req.symbol,
            side = %req.side,
            amount = req.amount,
            order_id = ?execution.order_id,
            "execution simulated"
        );
        ExecOutcome::Simulated { execution }
    }

    async fn place_live(&self, req: &ExecRequest) -> Result<ExecOutcome, BrokerError> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        self.bus.publish(
            topic::TRADE_SUBMITTED,
            serde_json::json!({
                "execution_id": execution_id,
                "symbol": req.symbol,
                "side": req.side,
                "amount": req.amount,
                "mode": req.mode,
            }),
        );

        let order = OrderRequest {
            side: req.side,
            symbol: req.symbol.clone(),
            amount: req.amount,
            mode: req.mode,
            limit_price: req.limit_price,
            client_order_id: Some(execution_id.clone()),
        };

        let ack = match self.broker.place_order(&order).await {
            Ok(ack) => ack,
            Err(e) => {
                // Round-trip contract: every trade:submitted gets exactly
                // one trade:result, success or not.
                self.bus.publish(
                    topic::TRADE_RESULT,
                    serde_json::json!({
                        "execution_id": execution_id,
                        "ok": false,
                        "error": e.to_string(),
                    }),
                );
                self.audit(
                    "execution",
                    format!("order placement failed: {e}"),
                    serde_json::json!({ "symbol": req.symbol, "side": req.side }),
                )
                .await;
                return Err(e);
            }
        };

        let execution = ExecutionRecord {
            id: execution_id,
            approval_id: req.approval_id.clone(),
            rule_id: req.rule_id.clone(),
            side: req.side,
            symbol: req.symbol.clone(),
            amount: req.amount,
            mode: req.mode,
            order_id: Some(ack.order_id.clone()),
            status: ack.status.clone(),
            filled_qty: ack.filled_qty,
            avg_fill_price: ack.avg_fill_price,
            dry_run: false,
            executed_at: Utc::now(),
        };

        self.risk.record_execution(req.rule_id.as_deref(), None);
        // Executions must never be lost: written before the caller proceeds.
        if let Err(e) = self.store.append_execution(&execution).await {
            warn!(order_id = %ack.order_id, error = %e, "execution record not persisted");
        }
        self.bus.publish(
            topic::TRADE_RESULT,
            serde_json::json!({
                "execution_id": execution.id,
                "order_id": ack.order_id,
                "status": ack.status,
                "ok": true,
            }),
        );
        info!(
            symbol = %req.symbol,
            side = %req.side,
            amount = req.amount,
            order_id = %ack.order_id,
            "order placed"
        );
        Ok(ExecOutcome::Executed { execution })
    }

    fn publish_trade_events(&self, execution: &ExecutionRecord, ok: bool) {
        self.bus.publish(
            topic::TRADE_SUBMITTED,
            serde_json::json!({
                "execution_id": execution.id,
                "symbol": execution.symbol,
                "side": execution.side,
                "amount": execution.amount,
                "mode": execution.mode,
            }),
        );
        self.bus.publish(
            topic::TRADE_RESULT,
            serde_json::json!({
                "execution_id": execution.id,
                "order_id": execution.order_id,
                "status": execution.status,
                "ok": ok,
            }),
        );
    }

    /// Latest known price for a symbol, from the snapshot store.
    async fn reference_price(&self, symbol: &str) -> Option<f64> {
        self.store
            .latest_snapshot()
            .await
            .ok()
            .flatten()
            .and_then(|s| s.prices.get(symbol).copied())
            .filter(|p| *p > 0.0)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn raise_alert(&self, alert: AlertRecord) {
        if let Err(e) = self.store.record_alert(&alert).await {
            warn!(error = %e, "alert not persisted");
        }
        self.bus
            .publish(topic::ALERT, serde_json::to_value(&alert).unwrap_or_default());
    }

    async fn audit(&self, kind: &str, message: String, data: serde_json::Value) {
        let entry = AuditRecord::new(kind, message).with_data(data);
        if let Err(e) = self.store.insert_audit(&entry).await {
            warn!(error = %e, "audit entry not persisted");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::notify::RecordingNotifier;
    use crate::records::{Baseline, KillSwitchState, Snapshot};
    use crate::rules::{Condition, Guardrail, Rule, RuleRisk};
    use crate::types::Actor;
    use std::collections::BTreeMap;

    struct Harness {
        pipeline: ExecutionPipeline,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        broker: Arc<PaperBroker>,
        notifier: Arc<RecordingNotifier>,
        risk: Arc<RiskGate>,
        _dir: tempfile::TempDir,
    }

    async fn harness(config: Config) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config);
        let store = Arc::new(Store::open_async(dir.path().join("t.db").to_str().unwrap()).await);
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(PaperBroker::with_demo_portfolio());
        let risk = Arc::new(RiskGate::new(&config));
        let notifier = Arc::new(RecordingNotifier::default());
        let mfa = Arc::new(MfaService::new(store.clone(), notifier.clone()));
        let pipeline = ExecutionPipeline::new(
            config,
            store.clone(),
            bus.clone(),
            broker.clone(),
            risk.clone(),
            mfa,
        );
        Harness {
            pipeline,
            store,
            bus,
            broker,
            notifier,
            risk,
            _dir: dir,
        }
    }

    fn live_config() -> Config {
        let mut cfg = Config {
            dry_run: false,
            owner_id: Some("owner".to_string()),
            ..Config::default()
        };
        cfg.validate();
        cfg
    }

    fn sell_request(amount: f64) -> ExecRequest {
        ExecRequest {
            side: Side::Sell,
            symbol: "XRP".to_string(),
            amount,
            mode: OrderMode::Market,
            limit_price: None,
            reason: "test".to_string(),
            approval_id: None,
            rule_id: None,
            estimated_value_usd: None,
            mfa_code: None,
            actor: "owner".to_string(),
            force_dry_run: false,
        }
    }

    async fn seed_snapshot(store: &Store, entries: &[(&str, f64, f64)]) -> Snapshot {
        let balances: BTreeMap<String, f64> = entries
            .iter()
            .map(|(s, q, _)| (s.to_string(), *q))
            .collect();
        let prices: BTreeMap<String, f64> = entries
            .iter()
            .map(|(s, _, p)| (s.to_string(), *p))
            .collect();
        let snap = Snapshot::new(balances, prices, "test");
        store.insert_snapshot(&snap).await.unwrap();
        snap
    }

    // -------------------------------------------------------------------------
    // Execution request path
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn dry_run_simulates_without_touching_the_venue() {
        // DRY_RUN=false with no owner coerces back to simulation.
        let mut cfg = Config {
            dry_run: false,
            owner_id: None,
            ..Config::default()
        };
        cfg.validate();
        let h = harness(cfg).await;

        let outcome = h.pipeline.execute(sell_request(5.0)).await.unwrap();
        let ExecOutcome::Simulated { execution } = outcome else {
            panic!("expected simulation");
        };
        assert!(execution.order_id.as_deref().unwrap().starts_with("dry-run-"));
        assert!(execution.dry_run);
        assert_eq!(h.broker.orders_placed(), 0);

        // The simulated order is still durably recorded.
        let recorded = h.store.recent_executions(5).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].dry_run);
    }

    #[tokio::test]
    async fn live_execution_places_order_and_records() {
        let h = harness(live_config()).await;
        let outcome = h.pipeline.execute(sell_request(5.0)).await.unwrap();
        let ExecOutcome::Executed { execution } = outcome else {
            panic!("expected live execution");
        };
        assert!(!execution.dry_run);
        assert_eq!(h.broker.orders_placed(), 1);
        assert_eq!(h.risk.trades_last_hour(), 1);
        assert_eq!(h.store.recent_executions(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn kill_switch_blocks_all_executions() {
        let h = harness(live_config()).await;
        h.store
            .upsert_kill_switch(&KillSwitchState {
                enabled: true,
                reason: Some("manual".to_string()),
                set_by: Some(Actor::Owner),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let outcome = h.pipeline.execute(sell_request(5.0)).await.unwrap();
        let ExecOutcome::Rejected { code } = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(code, "KILL_SWITCH_ENABLED");
        // Invariant: no execution record is appended while engaged.
        assert!(h.store.recent_executions(5).await.unwrap().is_empty());
        assert_eq!(h.broker.orders_placed(), 0);
    }

    #[tokio::test]
    async fn limit_order_slippage_is_bounded() {
        let h = harness(live_config()).await;
        seed_snapshot(&h.store, &[("XRP", 100.0, 0.5)]).await;

        let mut req = sell_request(5.0);
        req.mode = OrderMode::Limit;
        req.limit_price = Some(0.4); // 20% away from 0.5 market
        let ExecOutcome::Rejected { code } = h.pipeline.execute(req).await.unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(code, "SLIPPAGE_EXCEEDED");

        let mut ok_req = sell_request(5.0);
        ok_req.mode = OrderMode::Limit;
        ok_req.limit_price = Some(0.501); // 0.2% away
        assert!(matches!(
            h.pipeline.execute(ok_req).await.unwrap(),
            ExecOutcome::Executed { .. }
        ));

        let mut bad_req = sell_request(5.0);
        bad_req.mode = OrderMode::Limit;
        bad_req.limit_price = None;
        let ExecOutcome::Rejected { code } = h.pipeline.execute(bad_req).await.unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(code, "INVALID_LIMIT_PRICE");
    }

    #[tokio::test]
    async fn sell_requires_live_balance() {
        let h = harness(live_config()).await;
        let ExecOutcome::Rejected { code } =
            h.pipeline.execute(sell_request(500.0)).await.unwrap()
        else {
            panic!("expected rejection");
        };
        assert_eq!(code, "INSUFFICIENT_BALANCE");
    }

    #[tokio::test]
    async fn velocity_gate_rechecks_at_call_time() {
        let h = harness(live_config()).await;
        for _ in 0..4 {
            h.risk.record_execution(None, None);
        }
        let ExecOutcome::Rejected { code } =
            h.pipeline.execute(sell_request(5.0)).await.unwrap()
        else {
            panic!("expected rejection");
        };
        assert_eq!(code, "VELOCITY_MAX_TRADES");
    }

    #[tokio::test]
    async fn daily_loss_gate_rechecks_at_call_time() {
        let h = harness(live_config()).await;
        h.risk.record_execution(None, Some(-1500.0));
        let ExecOutcome::Rejected { code } =
            h.pipeline.execute(sell_request(5.0)).await.unwrap()
        else {
            panic!("expected rejection");
        };
        assert_eq!(code, "DAILY_LOSS_LIMIT");
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let h = harness(live_config()).await;
        h.pipeline.begin_shutdown();
        let ExecOutcome::Rejected { code } =
            h.pipeline.execute(sell_request(5.0)).await.unwrap()
        else {
            panic!("expected rejection");
        };
        assert_eq!(code, "SHUTDOWN_IN_PROGRESS");
    }

    #[tokio::test]
    async fn trade_submitted_is_paired_with_trade_result() {
        let h = harness(live_config()).await;
        let mut sub = h
            .bus
            .subscribe(Some(&[topic::TRADE_SUBMITTED, topic::TRADE_RESULT]));
        let _ = sub.recv().await; // connected

        h.pipeline.execute(sell_request(5.0)).await.unwrap();

        let submitted = sub.recv().await.unwrap();
        assert_eq!(submitted.topic, topic::TRADE_SUBMITTED);
        let result = sub.recv().await.unwrap();
        assert_eq!(result.topic, topic::TRADE_RESULT);
        assert_eq!(submitted.data["execution_id"], result.data["execution_id"]);
        assert_eq!(result.data["ok"], true);
    }

    #[tokio::test]
    async fn venue_failure_still_emits_result_event() {
        let h = harness(live_config()).await;
        let mut sub = h
            .bus
            .subscribe(Some(&[topic::TRADE_SUBMITTED, topic::TRADE_RESULT]));
        let _ = sub.recv().await;

        h.broker
            .fail_next(BrokerError::Transient("venue 503".into()));
        // fail_next consumes the balance fetch first; pre-load another.
        h.broker
            .fail_next(BrokerError::Transient("venue 503".into()));
        let res = h.pipeline.execute(sell_request(5.0)).await;
        assert!(res.is_err());

        // Balance fetch failed before submission — nothing was emitted; a
        // second attempt that fails at placement emits the pair.
        let mut req = sell_request(5.0);
        req.side = Side::Buy; // buys skip the balance pre-check
        h.broker
            .fail_next(BrokerError::Transient("venue 503".into()));
        assert!(h.pipeline.execute(req).await.is_err());

        let submitted = sub.recv().await.unwrap();
        assert_eq!(submitted.topic, topic::TRADE_SUBMITTED);
        let result = sub.recv().await.unwrap();
        assert_eq!(result.topic, topic::TRADE_RESULT);
        assert_eq!(result.data["ok"], false);
    }

    // -------------------------------------------------------------------------
    // MFA handshake through approvals
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn mfa_handshake_on_large_approval() {
        let h = harness(live_config()).await;
        seed_snapshot(&h.store, &[("XRP", 2000.0, 0.5)]).await;

        let mut approval = Approval::new("trade", "exit XRP 50%");
        approval.symbol = Some("XRP".to_string());
        approval.amount = Some(10.0);
        approval.metadata = serde_json::json!({
            "intent": { "side": "sell", "symbol": "XRP", "qty": 10.0 },
        });
        h.store.create_approval(&approval).await.unwrap();

        // First attempt with a 500 USD notional and no code.
        let first = h
            .pipeline
            .execute_approval(&approval.id, "owner", None, Some(500.0))
            .await
            .unwrap();
        assert!(matches!(first, ExecOutcome::MfaRequired { .. }));
        // Challenge persisted; no trade happened.
        assert!(h.store.find_mfa(&approval.id).await.unwrap().is_some());
        assert_eq!(h.broker.orders_placed(), 0);

        // Second attempt with the delivered code executes.
        let code = h.notifier.published()[0].1.clone();
        let second = h
            .pipeline
            .execute_approval(&approval.id, "owner", Some(code.clone()), Some(500.0))
            .await
            .unwrap();
        assert!(matches!(second, ExecOutcome::Executed { .. }));
        assert_eq!(h.broker.orders_placed(), 1);

        let done = h.store.find_approval(&approval.id).await.unwrap().unwrap();
        assert_eq!(done.status, ApprovalStatus::Executed);

        // Replaying the consumed code reports the MFA verdict.
        let replay = h
            .pipeline
            .execute_approval(&approval.id, "owner", Some(code), Some(500.0))
            .await
            .unwrap();
        let ExecOutcome::MfaFailed { reason } = replay else {
            panic!("expected MFA failure");
        };
        assert_eq!(reason, "already used");

        // Without a code, the terminal status is reported directly.
        let bare = h
            .pipeline
            .execute_approval(&approval.id, "owner", None, Some(500.0))
            .await
            .unwrap();
        let ExecOutcome::Rejected { code } = bare else {
            panic!("expected rejection");
        };
        assert_eq!(code, "ALREADY_EXECUTED");
    }

    #[tokio::test]
    async fn small_approval_skips_mfa() {
        let h = harness(live_config()).await;
        seed_snapshot(&h.store, &[("XRP", 100.0, 0.5)]).await;

        let mut approval = Approval::new("trade", "exit XRP");
        approval.symbol = Some("XRP".to_string());
        approval.amount = Some(2.0);
        approval.metadata = serde_json::json!({
            "intent": { "side": "sell", "symbol": "XRP", "qty": 2.0 },
            "estimated_value_usd": 1.0,
        });
        h.store.create_approval(&approval).await.unwrap();

        let outcome = h
            .pipeline
            .execute_approval(&approval.id, "owner", None, None)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecOutcome::Executed { .. }));
    }

    #[tokio::test]
    async fn approval_simulates_under_global_dry_run() {
        let h = harness(Config::default()).await; // dry_run = true
        seed_snapshot(&h.store, &[("XRP", 100.0, 0.5)]).await;

        let mut approval = Approval::new("trade", "exit XRP");
        approval.symbol = Some("XRP".to_string());
        approval.amount = Some(2.0);
        approval.metadata = serde_json::json!({
            "intent": { "side": "sell", "symbol": "XRP", "qty": 2.0 },
            "estimated_value_usd": 1.0,
        });
        h.store.create_approval(&approval).await.unwrap();

        let outcome = h
            .pipeline
            .execute_approval(&approval.id, "owner", None, None)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecOutcome::Simulated { .. }));
        let after = h.store.find_approval(&approval.id).await.unwrap().unwrap();
        assert_eq!(after.status, ApprovalStatus::Simulated);
        assert_eq!(h.broker.orders_placed(), 0);
    }

    #[tokio::test]
    async fn decline_is_idempotent_and_emits_once() {
        let h = harness(Config::default()).await;
        let approval = Approval::new("trade", "exit XRP");
        h.store.create_approval(&approval).await.unwrap();

        let mut sub = h.bus.subscribe(Some(&[topic::APPROVAL_UPDATED]));
        let _ = sub.recv().await; // connected

        h.pipeline
            .decide_approval(&approval.id, false, "owner")
            .await
            .unwrap();
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.data["status"], "declined");

        // Replay: no second event.
        h.pipeline
            .decide_approval(&approval.id, false, "owner")
            .await
            .unwrap();
        assert!(sub.try_recv().is_none());
    }

    // -------------------------------------------------------------------------
    // Rule tick routing
    // -------------------------------------------------------------------------

    fn exposure_exit_rule(guardrails: Vec<Guardrail>) -> Rule {
        let mut rule = Rule::new("trim-btc");
        rule.enabled = true;
        rule.conditions = vec![Condition::PortfolioExposure {
            symbol: "BTC".into(),
            lt_pct: None,
            gt_pct: Some(10.0),
        }];
        rule.actions = vec![Action::Exit {
            symbol: "BTC".into(),
            alloc_pct: 50.0,
        }];
        rule.risk = RuleRisk {
            guardrails,
            ..RuleRisk::default()
        };
        rule
    }

    #[tokio::test]
    async fn baseline_rejection_raises_info_alert_and_no_approval() {
        let h = harness(Config::default()).await;
        // Baselines {BTC:1.0}; balances {BTC:1.5}; selling 50% of value
        // breaches the floor.
        seed_snapshot(&h.store, &[("BTC", 1.5, 70_000.0), ("XRP", 12.0, 0.5)]).await;
        h.store
            .upsert_baseline(&Baseline {
                symbol: "BTC".into(),
                baseline: 1.0,
                auto_increment_on_deposit: false,
                min_tokens: None,
                avg_buy_price: None,
            })
            .await
            .unwrap();
        h.store
            .upsert_rule(&exposure_exit_rule(vec![Guardrail::BaselineProtection]))
            .await
            .unwrap();

        let evaluator = Evaluator::new(false);
        h.pipeline.run_rule_tick(&evaluator).await;

        let approvals = h.store.list_approvals(None, 10).await.unwrap();
        assert!(approvals.is_empty());

        let alerts = h.store.recent_alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Info);
        assert_eq!(alerts[0].data["code"], "BASELINE_BTC");
    }

    #[tokio::test]
    async fn gated_intent_becomes_pending_approval() {
        let h = harness(Config::default()).await;
        seed_snapshot(&h.store, &[("BTC", 1.5, 70_000.0)]).await;
        h.store.upsert_rule(&exposure_exit_rule(vec![])).await.unwrap();

        let mut sub = h.bus.subscribe(Some(&[topic::APPROVAL_CREATED]));
        let _ = sub.recv().await;

        let evaluator = Evaluator::new(false);
        let routed = h.pipeline.run_rule_tick(&evaluator).await;
        assert_eq!(routed, 1);

        let approvals = h.store.list_approvals(None, 10).await.unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].status, ApprovalStatus::Pending);
        assert_eq!(approvals[0].symbol.as_deref(), Some("BTC"));

        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.topic, topic::APPROVAL_CREATED);
    }

    #[tokio::test]
    async fn kill_switch_suppresses_the_whole_tick() {
        let h = harness(Config::default()).await;
        seed_snapshot(&h.store, &[("BTC", 1.5, 70_000.0)]).await;
        h.store.upsert_rule(&exposure_exit_rule(vec![])).await.unwrap();
        h.store
            .upsert_kill_switch(&KillSwitchState {
                enabled: true,
                reason: Some("breach".to_string()),
                set_by: Some(Actor::SystemRisk),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let evaluator = Evaluator::new(false);
        assert_eq!(h.pipeline.run_rule_tick(&evaluator).await, 0);
        assert!(h.store.list_approvals(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_triggered_rule_waits_for_external_event() {
        let h = harness(Config::default()).await;
        seed_snapshot(&h.store, &[("BTC", 1.5, 70_000.0)]).await;

        let mut rule = Rule::new("on-macro");
        rule.enabled = true;
        rule.trigger = crate::rules::Trigger::Event {
            name: "macro:update".into(),
        };
        rule.actions = vec![Action::Exit {
            symbol: "BTC".into(),
            alloc_pct: 10.0,
        }];
        h.store.upsert_rule(&rule).await.unwrap();

        let evaluator = Evaluator::new(false);
        // No event published yet: nothing fires.
        assert_eq!(h.pipeline.run_rule_tick(&evaluator).await, 0);

        // Published event fires exactly one tick, then drains.
        h.pipeline.notify_external_event("macro:update");
        assert_eq!(h.pipeline.run_rule_tick(&evaluator).await, 1);
        assert_eq!(h.pipeline.run_rule_tick(&evaluator).await, 0);
    }

    #[tokio::test]
    async fn auto_execution_respects_per_tick_bound() {
        let mut cfg = live_config();
        cfg.auto_execute_enabled = true;
        cfg.auto_execute_max_per_tick = 1;
        // Keep notionals under the MFA threshold so they stay auto-eligible.
        cfg.mfa_threshold_usd = 10_000.0;
        let h = harness(cfg).await;

        // Two small exit rules against a modest portfolio.
        seed_snapshot(&h.store, &[("BTC", 0.001, 70_000.0), ("XRP", 100.0, 0.5)]).await;
        let mut first = Rule::new("one");
        first.enabled = true;
        first.actions = vec![Action::Exit {
            symbol: "XRP".into(),
            alloc_pct: 10.0,
        }];
        let mut second = Rule::new("two");
        second.enabled = true;
        second.actions = vec![Action::Exit {
            symbol: "XRP".into(),
            alloc_pct: 10.0,
        }];
        h.store.upsert_rule(&first).await.unwrap();
        h.store.upsert_rule(&second).await.unwrap();

        // Auto-execution objectives on: intents are live (dry_run=false).
        let evaluator = Evaluator::new(true);
        h.pipeline.run_rule_tick(&evaluator).await;

        // One auto-executed; the overflow candidate became an approval.
        assert_eq!(h.broker.orders_placed(), 1);
        let approvals = h.store.list_approvals(None, 10).await.unwrap();
        assert_eq!(approvals.len(), 1);
    }
}
