// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// JSON everywhere. Read endpoints are public; every state-changing endpoint
// requires the `X-Owner-Id` header (401 on mismatch, 403 when no owner is
// configured). This adapter is the only place result kinds become HTTP
// status codes.
//
// CORS is configured permissively for development; tighten
// `allowed_origins` in production.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post, put},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::OwnerGuard;
use crate::app_state::AppState;
use crate::errors::StoreError;
use crate::evaluator::EvalInputs;
use crate::pipeline::ExecOutcome;
use crate::records::{Approval, ApprovalStatus, Baseline};
use crate::rules::{Action, Condition, Rule, RuleRisk, Trigger};
use crate::types::{Actor, Side, XRP_MIN_TOKENS};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health & environment ────────────────────────────────────
        .route("/health", get(health))
        .route("/health/full", get(health_full))
        .route("/env", get(env_view))
        // ── Portfolio ───────────────────────────────────────────────
        .route("/portfolio/current", get(portfolio_current))
        .route("/portfolio/snapshot/force", post(snapshot_force))
        // ── Approvals ───────────────────────────────────────────────
        .route("/approvals", get(approvals_list).post(approvals_create))
        .route("/approvals/:id", patch(approvals_decide))
        .route("/approvals/:id/execute", post(approvals_execute))
        // ── Rules ───────────────────────────────────────────────────
        .route("/rules", get(rules_list).post(rules_upsert))
        .route("/rules/:id/activate", post(rules_activate))
        .route("/rules/evaluate", post(rules_evaluate))
        // ── Baselines ───────────────────────────────────────────────
        .route("/baselines", get(baselines_list))
        .route("/baselines/:symbol", put(baselines_upsert))
        // ── Kill switch ─────────────────────────────────────────────
        .route("/kill-switch", get(kill_switch_get).post(kill_switch_set))
        // ── Alerts ──────────────────────────────────────────────────
        .route("/alerts", get(alerts_list))
        // ── Live stream ─────────────────────────────────────────────
        .route("/live", get(crate::api::sse::live_stream))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

/// Map a store fault to an HTTP response.
fn store_error(e: StoreError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        StoreError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Io(_) | StoreError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

// =============================================================================
// Health & environment
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "db": state.store.is_connected(),
        "dry_run": state.config.effective_dry_run(),
    }))
}

async fn health_full(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let kill_switch = state.store.read_kill_switch().await.ok();
    let pending = state
        .store
        .list_approvals(Some(ApprovalStatus::Pending), 500)
        .await
        .map(|a| a.len())
        .unwrap_or(0);

    Json(serde_json::json!({
        "ok": true,
        "db": state.store.is_connected(),
        "dry_run": state.config.effective_dry_run(),
        "uptime_secs": state.uptime_secs(),
        "active_port": state.active_port(),
        "subscribers": state.bus.subscriber_count(),
        "snapshot_interval_minutes": state.snapshot_interval_minutes(),
        "risk": state.risk.view(),
        "kill_switch": kill_switch,
        "pending_approvals": pending,
        "light_mode": state.config.light_mode,
    }))
}

async fn env_view(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = serde_json::to_value(state.config.as_ref()).unwrap_or_default();
    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "active_port".to_string(),
            serde_json::json!(state.active_port()),
        );
        obj.insert(
            "dry_run".to_string(),
            serde_json::json!(state.config.effective_dry_run()),
        );
    }
    Json(body)
}

// =============================================================================
// Portfolio
// =============================================================================

async fn portfolio_current(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = match state.store.latest_snapshot().await {
        Ok(s) => s,
        Err(e) => return store_error(e).into_response(),
    };
    let collateral = state.store.list_collateral().await.unwrap_or_default();
    let deltas = state.snapshots.deltas_24h().await;
    let total = snapshot.as_ref().map(|s| s.total_value_usd());

    Json(serde_json::json!({
        "snapshot": snapshot,
        "total_value_usd": total,
        "collateral": collateral,
        "deltas_24h": deltas,
    }))
    .into_response()
}

async fn snapshot_force(
    OwnerGuard(owner): OwnerGuard,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!(owner, "manual snapshot requested");
    match state.snapshots.capture("forced").await {
        Some(snapshot) => Json(serde_json::json!({
            "ok": true,
            "snapshot": snapshot,
        }))
        .into_response(),
        None => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({
                "ok": false,
                "error": "snapshot capture failed; see alerts",
            })),
        )
            .into_response(),
    }
}

// =============================================================================
// Approvals
// =============================================================================

#[derive(Deserialize)]
struct ApprovalsQuery {
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn approvals_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApprovalsQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        Some(raw) => match ApprovalStatus::from_str(raw) {
            Ok(s) => Some(s),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": e })),
                )
                    .into_response();
            }
        },
        None => None,
    };
    match state.store.list_approvals(status, query.limit).await {
        Ok(approvals) => Json(approvals).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct CreateApprovalRequest {
    #[serde(default = "default_kind")]
    kind: String,
    symbol: String,
    amount: f64,
    side: Side,
    title: Option<String>,
    summary: Option<String>,
    estimated_value_usd: Option<f64>,
}

fn default_kind() -> String {
    "trade".to_string()
}

async fn approvals_create(
    OwnerGuard(owner): OwnerGuard,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateApprovalRequest>,
) -> impl IntoResponse {
    if !(req.amount > 0.0) || req.symbol.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "symbol and positive amount required" })),
        )
            .into_response();
    }

    let title = req
        .title
        .unwrap_or_else(|| format!("{} {}", req.side, req.symbol));
    let mut approval = Approval::new(req.kind, title);
    approval.symbol = Some(req.symbol.clone());
    approval.amount = Some(req.amount);
    approval.summary = req.summary.unwrap_or_default();
    approval.metadata = serde_json::json!({
        "intent": {
            "side": req.side,
            "symbol": req.symbol,
            "qty": req.amount,
        },
        "estimated_value_usd": req.estimated_value_usd,
        "created_by": owner,
    });

    match state.store.create_approval(&approval).await {
        Ok(()) => {
            state.bus.publish(
                crate::events::topic::APPROVAL_CREATED,
                serde_json::to_value(&approval).unwrap_or_default(),
            );
            (StatusCode::CREATED, Json(approval)).into_response()
        }
        Err(e) => store_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct DecideApprovalRequest {
    status: String,
}

async fn approvals_decide(
    OwnerGuard(owner): OwnerGuard,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<DecideApprovalRequest>,
) -> impl IntoResponse {
    let approve = match req.status.as_str() {
        "approved" => true,
        "declined" => false,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("status must be 'approved' or 'declined', got '{other}'"),
                })),
            )
                .into_response();
        }
    };

    match state.pipeline.decide_approval(&id, approve, &owner).await {
        Ok(approval) => Json(approval).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

#[derive(Deserialize, Default)]
struct ExecuteApprovalRequest {
    mfa_code: Option<String>,
    estimated_value_usd: Option<f64>,
}

async fn approvals_execute(
    OwnerGuard(owner): OwnerGuard,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ExecuteApprovalRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let outcome = match state
        .pipeline
        .execute_approval(&id, &owner, req.mfa_code, req.estimated_value_usd)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return store_error(e).into_response(),
    };

    match &outcome {
        ExecOutcome::Executed { execution } => Json(serde_json::json!({
            "ok": true,
            "status": "executed",
            "execution": execution,
        }))
        .into_response(),
        ExecOutcome::Simulated { execution } => Json(serde_json::json!({
            "ok": true,
            "status": "simulated",
            "execution": execution,
        }))
        .into_response(),
        ExecOutcome::MfaRequired { expires_at } => Json(serde_json::json!({
            "mfa_required": true,
            "expires_at": expires_at,
        }))
        .into_response(),
        ExecOutcome::MfaFailed { reason } => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "mfa_failed": true,
                "reason": reason,
            })),
        )
            .into_response(),
        ExecOutcome::Rejected { code } => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "ok": false,
                "error": code,
            })),
        )
            .into_response(),
    }
}

// =============================================================================
// Rules
// =============================================================================

async fn rules_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_rules().await {
        Ok(rules) => Json(rules).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct UpsertRuleRequest {
    id: Option<String>,
    name: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    trigger: Trigger,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    actions: Vec<Action>,
    #[serde(default)]
    risk: RuleRisk,
    #[serde(default)]
    meta: serde_json::Value,
}

async fn rules_upsert(
    OwnerGuard(owner): OwnerGuard,
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpsertRuleRequest>,
) -> impl IntoResponse {
    if req.name.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "rule name required" })),
        )
            .into_response();
    }

    let rule = Rule {
        id: req.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        name: req.name,
        enabled: req.enabled,
        trigger: req.trigger,
        conditions: req.conditions,
        actions: req.actions,
        risk: req.risk,
        meta: req.meta,
    };

    match state.store.upsert_rule(&rule).await {
        Ok(()) => {
            info!(owner, rule = %rule.name, id = %rule.id, "rule upserted");
            state.bus.publish(
                crate::events::topic::RULES_UPDATED,
                serde_json::json!({ "id": rule.id, "name": rule.name }),
            );
            (StatusCode::CREATED, Json(rule)).into_response()
        }
        Err(e) => store_error(e).into_response(),
    }
}

#[derive(Deserialize, Default)]
struct ActivateRuleRequest {
    enabled: Option<bool>,
}

async fn rules_activate(
    OwnerGuard(owner): OwnerGuard,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ActivateRuleRequest>>,
) -> impl IntoResponse {
    let enabled = body
        .map(|Json(r)| r.enabled.unwrap_or(true))
        .unwrap_or(true);
    match state.store.set_rule_enabled(&id, enabled).await {
        Ok(rule) => {
            info!(owner, rule = %rule.name, enabled, "rule activation changed");
            state.bus.publish(
                crate::events::topic::RULES_UPDATED,
                serde_json::json!({ "id": rule.id, "enabled": enabled }),
            );
            Json(rule).into_response()
        }
        Err(e) => store_error(e).into_response(),
    }
}

/// One-shot dry evaluation: run the evaluator against the latest snapshot
/// and return the intents without routing any of them.
async fn rules_evaluate(
    OwnerGuard(_owner): OwnerGuard,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let snapshot = match state.store.latest_snapshot().await {
        Ok(Some(s)) => s,
        Ok(None) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": "no snapshot captured yet" })),
            )
                .into_response();
        }
        Err(e) => return store_error(e).into_response(),
    };
    let rules = state.store.list_rules().await.unwrap_or_default();
    let history = state
        .store
        .snapshots_since(chrono::Utc::now() - chrono::Duration::hours(24))
        .await
        .unwrap_or_default();

    let intents = state.evaluator.evaluate_tick(&EvalInputs {
        snapshot: &snapshot,
        history: &history,
        rules: &rules,
        external_events: &Default::default(),
    });
    Json(serde_json::json!({ "intents": intents })).into_response()
}

// =============================================================================
// Baselines
// =============================================================================

async fn baselines_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_baselines().await {
        Ok(baselines) => Json(baselines).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct UpsertBaselineRequest {
    baseline: f64,
    #[serde(default)]
    auto_increment_on_deposit: bool,
    min_tokens: Option<f64>,
    avg_buy_price: Option<f64>,
}

async fn baselines_upsert(
    OwnerGuard(owner): OwnerGuard,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(req): Json<UpsertBaselineRequest>,
) -> impl IntoResponse {
    if req.baseline < 0.0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "baseline must be non-negative" })),
        )
            .into_response();
    }

    // XRP carries a hard token floor; the baseline may never sit below it.
    let min_tokens = if symbol == "XRP" {
        Some(req.min_tokens.unwrap_or(XRP_MIN_TOKENS).max(XRP_MIN_TOKENS))
    } else {
        req.min_tokens
    };
    if let Some(floor) = min_tokens {
        if req.baseline < floor {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("baseline {} is below the {floor} token floor", req.baseline),
                })),
            )
                .into_response();
        }
    }

    let baseline = Baseline {
        symbol: symbol.clone(),
        baseline: req.baseline,
        auto_increment_on_deposit: req.auto_increment_on_deposit,
        min_tokens,
        avg_buy_price: req.avg_buy_price,
    };
    match state.store.upsert_baseline(&baseline).await {
        Ok(()) => {
            info!(owner, symbol = %symbol, baseline = req.baseline, "baseline updated");
            Json(baseline).into_response()
        }
        Err(e) => store_error(e).into_response(),
    }
}

// =============================================================================
// Kill switch
// =============================================================================

async fn kill_switch_get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.read_kill_switch().await {
        Ok(ks) => Json(ks).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct KillSwitchRequest {
    enabled: bool,
    reason: Option<String>,
}

async fn kill_switch_set(
    OwnerGuard(owner): OwnerGuard,
    State(state): State<Arc<AppState>>,
    Json(req): Json<KillSwitchRequest>,
) -> impl IntoResponse {
    info!(owner, enabled = req.enabled, "manual kill switch change");
    state
        .killswitch
        .set_manual(req.enabled, req.reason, Actor::Owner)
        .await;
    match state.store.read_kill_switch().await {
        Ok(ks) => Json(ks).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Deserialize)]
struct AlertsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

async fn alerts_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    match state.store.recent_alerts(query.limit).await {
        Ok(alerts) => Json(alerts).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}
