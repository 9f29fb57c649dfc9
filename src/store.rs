// =============================================================================
// Persistence Gateway — durable collections over embedded SQLite
// =============================================================================
//
// Capability wrapper every other component goes through for durable state.
// Records are stored as JSON payloads alongside the columns that need
// indexing (status, timestamps, unique order ids).
//
// Degraded mode: if the database cannot be opened the process keeps running;
// every operation returns `StoreError::NotConnected` and a watchdog retries
// with exponential backoff (15 s doubling, capped at 15 min). On reconnect
// the gateway publishes `system:reconnected`.
//
// Hot-loop reads (latest snapshot, kill switch, rules list) are cached with
// a 1-second TTL; writes invalidate the corresponding cache.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::StoreError;
use crate::events::{topic, EventBus};
use crate::records::{
    AlertRecord, Approval, ApprovalStatus, AuditRecord, Baseline, CollateralPosition,
    ExecutionRecord, KillSwitchState, MfaChallenge, Preferences, Snapshot,
};
use crate::rules::Rule;

/// TTL for hot-loop read caches.
const CACHE_TTL: Duration = Duration::from_secs(1);

/// Watchdog backoff bounds.
const RETRY_INITIAL: Duration = Duration::from_secs(15);
const RETRY_MAX: Duration = Duration::from_secs(15 * 60);

type Result<T> = std::result::Result<T, StoreError>;

// =============================================================================
// CAS outcome
// =============================================================================

/// Result of a compare-and-set status update.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The transition was applied.
    Applied(Approval),
    /// The approval was already in the requested status; nothing changed
    /// and callers must not re-emit events.
    Noop(Approval),
}

impl CasOutcome {
    pub fn approval(&self) -> &Approval {
        match self {
            Self::Applied(a) | Self::Noop(a) => a,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

// =============================================================================
// Store
// =============================================================================

/// Shared handle to the persistence gateway.
pub struct Store {
    path: String,
    conn: Mutex<Option<Connection>>,
    connected: AtomicBool,

    snapshot_cache: SyncMutex<Option<(Instant, Option<Snapshot>)>>,
    kill_cache: SyncMutex<Option<(Instant, KillSwitchState)>>,
    rules_cache: SyncMutex<Option<(Instant, Vec<Rule>)>>,
}

impl Store {
    /// Open the gateway. A failed open does NOT abort: the store starts in
    /// degraded mode and the watchdog keeps retrying.
    pub async fn open_async(path: impl Into<String>) -> Self {
        let path = path.into();
        let store = Self {
            path: path.clone(),
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
            snapshot_cache: SyncMutex::new(None),
            kill_cache: SyncMutex::new(None),
            rules_cache: SyncMutex::new(None),
        };
        store.try_connect().await;
        store
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// One reconnection attempt. Returns true when connected afterwards.
    pub async fn try_connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        match Self::open_connection(&self.path) {
            Ok(conn) => {
                *self.conn.lock().await = Some(conn);
                self.connected.store(true, Ordering::Release);
                self.invalidate_caches();
                info!(path = %self.path, "store connected");
                true
            }
            Err(e) => {
                warn!(path = %self.path, error = %e, "store connect attempt failed — degraded mode");
                false
            }
        }
    }

    /// Degraded-mode watchdog: retries with exponential backoff and emits
    /// `system:reconnected` on recovery. Runs until the shutdown signal.
    pub async fn run_watchdog(
        self: Arc<Self>,
        bus: Arc<EventBus>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut backoff = RETRY_INITIAL;
        loop {
            let wait = if self.is_connected() {
                backoff = RETRY_INITIAL;
                RETRY_INITIAL
            } else {
                backoff
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => return,
            }

            if !self.is_connected() {
                if self.try_connect().await {
                    bus.publish(topic::SYSTEM_RECONNECTED, serde_json::json!({}));
                    backoff = RETRY_INITIAL;
                } else {
                    backoff = (backoff * 2).min(RETRY_MAX);
                }
            }
        }
    }

    fn open_connection(path: &str) -> anyhow::Result<Connection> {
        use anyhow::Context;
        let conn = Connection::open(path).context("open sqlite database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::migrate(&conn).context("run migrations")?;
        Ok(conn)
    }

    fn migrate(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                captured_at INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_captured_at
                ON snapshots(captured_at);

            CREATE TABLE IF NOT EXISTS baselines (
                symbol TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_approvals_status_created
                ON approvals(status, created_at);

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                order_id TEXT UNIQUE,
                executed_at INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_executions_executed_at
                ON executions(executed_at);

            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_ts ON alerts(ts);

            CREATE TABLE IF NOT EXISTS audit (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kill_switch (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS mfa_challenges (
                trade_id TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS collateral (
                symbol TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS preferences (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL
            );",
        )
    }

    fn invalidate_caches(&self) {
        *self.snapshot_cache.lock() = None;
        *self.kill_cache.lock() = None;
        *self.rules_cache.lock() = None;
    }

    /// Run `f` against the live connection, or fail with `NotConnected` in
    /// degraded mode. Driver faults flip the store back into degraded mode.
    async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::NotConnected)?;
        f(conn).map_err(StoreError::Io)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let payload = to_json(snapshot)?;
        let captured = snapshot.captured_at.timestamp_millis();
        let id = snapshot.id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO snapshots (id, captured_at, payload) VALUES (?1, ?2, ?3)",
                params![id, captured, payload],
            )
            .map(|_| ())
        })
        .await?;
        *self.snapshot_cache.lock() = None;
        Ok(())
    }

    /// Most recent snapshot, cached for up to one second.
    pub async fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        if let Some((at, cached)) = self.snapshot_cache.lock().clone() {
            if at.elapsed() < CACHE_TTL {
                return Ok(cached);
            }
        }
        let row: Option<String> = self
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT payload FROM snapshots
                     ORDER BY captured_at DESC, rowid DESC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        let snapshot = row.map(|p| from_json(&p)).transpose()?;
        *self.snapshot_cache.lock() = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    /// Snapshots captured at or after `since`, ascending by capture time.
    pub async fn snapshots_since(&self, since: DateTime<Utc>) -> Result<Vec<Snapshot>> {
        let cutoff = since.timestamp_millis();
        let payloads: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT payload FROM snapshots WHERE captured_at >= ?1
                     ORDER BY captured_at ASC, rowid ASC",
                )?;
                let rows = stmt.query_map(params![cutoff], |r| r.get(0))?;
                rows.collect()
            })
            .await?;
        payloads.iter().map(|p| from_json(p)).collect()
    }

    // =========================================================================
    // Executions
    // =========================================================================

    /// Append an execution. Inserts are unique by `order_id` when provided;
    /// a duplicate order id is silently ignored (at-least-once writers).
    pub async fn append_execution(&self, execution: &ExecutionRecord) -> Result<()> {
        let payload = to_json(execution)?;
        let id = execution.id.clone();
        let order_id = execution.order_id.clone();
        let executed = execution.executed_at.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO executions (id, order_id, executed_at, payload)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(order_id) DO NOTHING",
                params![id, order_id, executed, payload],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn executions_since(&self, since: DateTime<Utc>) -> Result<Vec<ExecutionRecord>> {
        let cutoff = since.timestamp_millis();
        let payloads: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT payload FROM executions WHERE executed_at >= ?1
                     ORDER BY executed_at ASC",
                )?;
                let rows = stmt.query_map(params![cutoff], |r| r.get(0))?;
                rows.collect()
            })
            .await?;
        payloads.iter().map(|p| from_json(p)).collect()
    }

    pub async fn recent_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let payloads: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT payload FROM executions ORDER BY executed_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], |r| r.get(0))?;
                rows.collect()
            })
            .await?;
        payloads.iter().map(|p| from_json(p)).collect()
    }

    // =========================================================================
    // Alerts & audit
    // =========================================================================

    pub async fn record_alert(&self, alert: &AlertRecord) -> Result<()> {
        let payload = to_json(alert)?;
        let id = alert.id.clone();
        let ts = alert.ts.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO alerts (id, ts, payload) VALUES (?1, ?2, ?3)",
                params![id, ts, payload],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        let payloads: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare_cached("SELECT payload FROM alerts ORDER BY ts DESC LIMIT ?1")?;
                let rows = stmt.query_map(params![limit as i64], |r| r.get(0))?;
                rows.collect()
            })
            .await?;
        payloads.iter().map(|p| from_json(p)).collect()
    }

    pub async fn insert_audit(&self, entry: &AuditRecord) -> Result<()> {
        let payload = to_json(entry)?;
        let id = entry.id.clone();
        let ts = entry.ts.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit (id, ts, payload) VALUES (?1, ?2, ?3)",
                params![id, ts, payload],
            )
            .map(|_| ())
        })
        .await
    }

    // =========================================================================
    // Kill switch
    // =========================================================================

    pub async fn upsert_kill_switch(&self, state: &KillSwitchState) -> Result<()> {
        let payload = to_json(state)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kill_switch (id, payload) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
                params![payload],
            )
            .map(|_| ())
        })
        .await?;
        *self.kill_cache.lock() = None;
        Ok(())
    }

    /// Current kill-switch state (defaults to disabled when never set),
    /// cached for up to one second.
    pub async fn read_kill_switch(&self) -> Result<KillSwitchState> {
        if let Some((at, cached)) = self.kill_cache.lock().clone() {
            if at.elapsed() < CACHE_TTL {
                return Ok(cached);
            }
        }
        let row: Option<String> = self
            .with_conn(|conn| {
                conn.query_row("SELECT payload FROM kill_switch WHERE id = 1", [], |r| {
                    r.get(0)
                })
                .optional()
            })
            .await?;
        let state = match row {
            Some(p) => from_json(&p)?,
            None => KillSwitchState::default(),
        };
        *self.kill_cache.lock() = Some((Instant::now(), state.clone()));
        Ok(state)
    }

    // =========================================================================
    // Approvals
    // =========================================================================

    pub async fn create_approval(&self, approval: &Approval) -> Result<()> {
        let payload = to_json(approval)?;
        let id = approval.id.clone();
        let status = approval.status.to_string();
        let created = approval.created_at.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO approvals (id, status, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, status, created, payload],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn find_approval(&self, id: &str) -> Result<Option<Approval>> {
        let id = id.to_string();
        let row: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT payload FROM approvals WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        row.map(|p| from_json(&p)).transpose()
    }

    pub async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
        limit: usize,
    ) -> Result<Vec<Approval>> {
        let payloads: Vec<String> = self
            .with_conn(move |conn| match status {
                Some(s) => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT payload FROM approvals WHERE status = ?1
                         ORDER BY created_at DESC LIMIT ?2",
                    )?;
                    let rows =
                        stmt.query_map(params![s.to_string(), limit as i64], |r| r.get(0))?;
                    rows.collect()
                }
                None => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT payload FROM approvals ORDER BY created_at DESC LIMIT ?1",
                    )?;
                    let rows = stmt.query_map(params![limit as i64], |r| r.get(0))?;
                    rows.collect()
                }
            })
            .await?;
        payloads.iter().map(|p| from_json(p)).collect()
    }

    /// True when a non-terminal approval of `kind` exists for `symbol`.
    pub async fn has_open_approval(&self, kind: &str, symbol: &str) -> Result<bool> {
        let open = self.list_approvals(Some(ApprovalStatus::Pending), 500).await?;
        Ok(open
            .iter()
            .any(|a| a.kind == kind && a.symbol.as_deref() == Some(symbol)))
    }

    /// Atomic status transition. Fails with `Conflict` when the transition
    /// is illegal; returns `Noop` when the approval is already in the
    /// requested status (idempotent replays must not re-emit events).
    pub async fn update_approval_status(
        &self,
        id: &str,
        to: ApprovalStatus,
        acted_by: &str,
    ) -> Result<CasOutcome> {
        let current = self
            .find_approval(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("approval {id}")))?;

        if current.status == to {
            return Ok(CasOutcome::Noop(current));
        }
        if !ApprovalStatus::can_transition(current.status, to) {
            return Err(StoreError::Conflict(format!(
                "approval {id}: illegal transition {} -> {}",
                current.status, to
            )));
        }

        let mut updated = current.clone();
        updated.status = to;
        updated.acted_by = Some(acted_by.to_string());
        updated.acted_at = Some(Utc::now());

        let payload = to_json(&updated)?;
        let from_str = current.status.to_string();
        let to_str = to.to_string();
        let id_owned = id.to_string();

        // Guard on the previous status so a concurrent writer loses cleanly.
        let changed = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE approvals SET status = ?1, payload = ?2
                     WHERE id = ?3 AND status = ?4",
                    params![to_str, payload, id_owned, from_str],
                )
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "approval {id}: concurrent status change"
            )));
        }
        Ok(CasOutcome::Applied(updated))
    }

    // =========================================================================
    // MFA challenges
    // =========================================================================

    pub async fn insert_mfa(&self, challenge: &MfaChallenge) -> Result<()> {
        let payload = to_json(challenge)?;
        let trade_id = challenge.trade_id.clone();
        let expires = challenge.expires_at.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO mfa_challenges (trade_id, expires_at, payload)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(trade_id) DO UPDATE SET
                     expires_at = excluded.expires_at,
                     payload = excluded.payload",
                params![trade_id, expires, payload],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn find_mfa(&self, trade_id: &str) -> Result<Option<MfaChallenge>> {
        let trade_id = trade_id.to_string();
        let row: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT payload FROM mfa_challenges WHERE trade_id = ?1",
                    params![trade_id],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        row.map(|p| from_json(&p)).transpose()
    }

    /// Flip `verified` to true exactly once. Returns false when the
    /// challenge was already verified (write-once).
    pub async fn mark_mfa_verified(&self, trade_id: &str) -> Result<bool> {
        let current = self
            .find_mfa(trade_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("mfa challenge {trade_id}")))?;
        if current.verified {
            return Ok(false);
        }
        let mut updated = current;
        updated.verified = true;
        let payload = to_json(&updated)?;
        let id = trade_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE mfa_challenges SET payload = ?1 WHERE trade_id = ?2",
                params![payload, id],
            )
            .map(|_| ())
        })
        .await?;
        Ok(true)
    }

    /// Delete expired challenges; returns the number removed.
    pub async fn gc_expired_mfa(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.timestamp_millis();
        let removed = self
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM mfa_challenges WHERE expires_at < ?1",
                    params![cutoff],
                )
            })
            .await?;
        Ok(removed)
    }

    // =========================================================================
    // Rules
    // =========================================================================

    pub async fn upsert_rule(&self, rule: &Rule) -> Result<()> {
        let payload = to_json(rule)?;
        let id = rule.id.clone();
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rules (id, created_at, payload) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
                params![id, now, payload],
            )
            .map(|_| ())
        })
        .await?;
        *self.rules_cache.lock() = None;
        Ok(())
    }

    /// All rules in insertion order, cached for up to one second.
    pub async fn list_rules(&self) -> Result<Vec<Rule>> {
        if let Some((at, cached)) = self.rules_cache.lock().clone() {
            if at.elapsed() < CACHE_TTL {
                return Ok(cached);
            }
        }
        let payloads: Vec<String> = self
            .with_conn(|conn| {
                // rowid preserves insertion order even for same-millisecond
                // inserts; upserts keep the original rowid.
                let mut stmt =
                    conn.prepare_cached("SELECT payload FROM rules ORDER BY rowid ASC")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect()
            })
            .await?;
        let rules: Vec<Rule> = payloads
            .iter()
            .map(|p| from_json(p))
            .collect::<Result<_>>()?;
        *self.rules_cache.lock() = Some((Instant::now(), rules.clone()));
        Ok(rules)
    }

    pub async fn get_rule(&self, id: &str) -> Result<Option<Rule>> {
        let id = id.to_string();
        let row: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT payload FROM rules WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        row.map(|p| from_json(&p)).transpose()
    }

    pub async fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<Rule> {
        let mut rule = self
            .get_rule(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("rule {id}")))?;
        rule.enabled = enabled;
        self.upsert_rule(&rule).await?;
        Ok(rule)
    }

    // =========================================================================
    // Baselines
    // =========================================================================

    pub async fn upsert_baseline(&self, baseline: &Baseline) -> Result<()> {
        let payload = to_json(baseline)?;
        let symbol = baseline.symbol.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO baselines (symbol, payload) VALUES (?1, ?2)
                 ON CONFLICT(symbol) DO UPDATE SET payload = excluded.payload",
                params![symbol, payload],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn get_baseline(&self, symbol: &str) -> Result<Option<Baseline>> {
        let symbol = symbol.to_string();
        let row: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT payload FROM baselines WHERE symbol = ?1",
                    params![symbol],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        row.map(|p| from_json(&p)).transpose()
    }

    pub async fn list_baselines(&self) -> Result<Vec<Baseline>> {
        let payloads: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT payload FROM baselines ORDER BY symbol ASC")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect()
            })
            .await?;
        payloads.iter().map(|p| from_json(p)).collect()
    }

    // =========================================================================
    // Collateral
    // =========================================================================

    pub async fn replace_collateral(&self, positions: &[CollateralPosition]) -> Result<()> {
        let rows: Vec<(String, String)> = positions
            .iter()
            .map(|p| Ok((p.symbol.clone(), to_json(p)?)))
            .collect::<Result<_>>()?;
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM collateral", [])?;
            for (symbol, payload) in &rows {
                conn.execute(
                    "INSERT INTO collateral (symbol, payload) VALUES (?1, ?2)",
                    params![symbol, payload],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn list_collateral(&self) -> Result<Vec<CollateralPosition>> {
        let payloads: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT payload FROM collateral ORDER BY symbol ASC")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect()
            })
            .await?;
        payloads.iter().map(|p| from_json(p)).collect()
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    pub async fn upsert_preferences(&self, prefs: &Preferences) -> Result<()> {
        let payload = to_json(prefs)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO preferences (id, payload) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
                params![payload],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn read_preferences(&self) -> Result<Option<Preferences>> {
        let row: Option<String> = self
            .with_conn(|conn| {
                conn.query_row("SELECT payload FROM preferences WHERE id = 1", [], |r| {
                    r.get(0)
                })
                .optional()
            })
            .await?;
        row.map(|p| from_json(&p)).transpose()
    }
}

// =============================================================================
// JSON helpers
// =============================================================================

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T> {
    serde_json::from_str(payload).map_err(|e| StoreError::Corrupt(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderMode, Severity, Side};
    use std::collections::BTreeMap;

    async fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open_async(path.to_str().unwrap()).await;
        assert!(store.is_connected());
        (store, dir)
    }

    fn snapshot(btc_price: f64) -> Snapshot {
        let mut balances = BTreeMap::new();
        balances.insert("BTC".to_string(), 1.0);
        let mut prices = BTreeMap::new();
        prices.insert("BTC".to_string(), btc_price);
        Snapshot::new(balances, prices, "test")
    }

    fn execution(order_id: Option<&str>) -> ExecutionRecord {
        ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            approval_id: None,
            rule_id: None,
            side: Side::Buy,
            symbol: "BTC".to_string(),
            amount: 0.1,
            mode: OrderMode::Market,
            order_id: order_id.map(str::to_string),
            status: "filled".to_string(),
            filled_qty: Some(0.1),
            avg_fill_price: Some(70_000.0),
            dry_run: false,
            executed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn degraded_mode_returns_not_connected() {
        let store = Store::open_async("/nonexistent-dir/zzz/test.db").await;
        assert!(!store.is_connected());
        let err = store.latest_snapshot().await.unwrap_err();
        assert!(matches!(err, StoreError::NotConnected));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn snapshot_round_trip_and_latest() {
        let (store, _dir) = temp_store().await;
        let older = snapshot(60_000.0);
        store.insert_snapshot(&older).await.unwrap();

        let mut newer = snapshot(70_000.0);
        newer.captured_at = older.captured_at + chrono::Duration::minutes(5);
        store.insert_snapshot(&newer).await.unwrap();

        let latest = store.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);

        let since = store
            .snapshots_since(older.captured_at - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].id, older.id);
    }

    #[tokio::test]
    async fn execution_unique_by_order_id() {
        let (store, _dir) = temp_store().await;
        store
            .append_execution(&execution(Some("ord-1")))
            .await
            .unwrap();
        // Same order id — silently ignored.
        store
            .append_execution(&execution(Some("ord-1")))
            .await
            .unwrap();
        // NULL order ids never conflict.
        store.append_execution(&execution(None)).await.unwrap();
        store.append_execution(&execution(None)).await.unwrap();

        let all = store.recent_executions(10).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn approval_cas_applies_and_nops() {
        let (store, _dir) = temp_store().await;
        let approval = Approval::new("trade", "Sell BTC");
        store.create_approval(&approval).await.unwrap();

        let out = store
            .update_approval_status(&approval.id, ApprovalStatus::Declined, "owner")
            .await
            .unwrap();
        assert!(out.applied());
        assert_eq!(out.approval().acted_by.as_deref(), Some("owner"));

        // Idempotent replay: no-op, not an error.
        let replay = store
            .update_approval_status(&approval.id, ApprovalStatus::Declined, "owner")
            .await
            .unwrap();
        assert!(!replay.applied());

        // Illegal transition out of a terminal status.
        let err = store
            .update_approval_status(&approval.id, ApprovalStatus::Executed, "owner")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn approval_listing_filters_by_status() {
        let (store, _dir) = temp_store().await;
        let a = Approval::new("trade", "one");
        let b = Approval::new("trade", "two");
        store.create_approval(&a).await.unwrap();
        store.create_approval(&b).await.unwrap();
        store
            .update_approval_status(&a.id, ApprovalStatus::Declined, "owner")
            .await
            .unwrap();

        let pending = store
            .list_approvals(Some(ApprovalStatus::Pending), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[tokio::test]
    async fn mfa_verify_is_write_once_and_gc_removes_expired() {
        let (store, _dir) = temp_store().await;
        let challenge = MfaChallenge {
            trade_id: "t-1".to_string(),
            user_id: "owner".to_string(),
            code: "123456".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
            verified: false,
            trade_details: serde_json::Value::Null,
        };
        store.insert_mfa(&challenge).await.unwrap();

        assert!(store.mark_mfa_verified("t-1").await.unwrap());
        assert!(!store.mark_mfa_verified("t-1").await.unwrap());

        // Expired challenge is garbage collected.
        let stale = MfaChallenge {
            trade_id: "t-2".to_string(),
            expires_at: Utc::now() - chrono::Duration::minutes(1),
            ..challenge
        };
        store.insert_mfa(&stale).await.unwrap();
        let removed = store.gc_expired_mfa(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_mfa("t-2").await.unwrap().is_none());
        assert!(store.find_mfa("t-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn kill_switch_defaults_and_round_trips() {
        let (store, _dir) = temp_store().await;
        let initial = store.read_kill_switch().await.unwrap();
        assert!(!initial.enabled);

        let engaged = KillSwitchState {
            enabled: true,
            reason: Some("velocity".to_string()),
            set_by: Some(crate::types::Actor::SystemRisk),
            timestamp: Utc::now(),
        };
        store.upsert_kill_switch(&engaged).await.unwrap();
        let read = store.read_kill_switch().await.unwrap();
        assert!(read.enabled);
        assert_eq!(read.set_by, Some(crate::types::Actor::SystemRisk));
    }

    #[tokio::test]
    async fn rules_preserve_insertion_order() {
        let (store, _dir) = temp_store().await;
        let first = Rule::new("first");
        let second = Rule::new("second");
        store.upsert_rule(&first).await.unwrap();
        store.upsert_rule(&second).await.unwrap();

        let rules = store.list_rules().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "first");
        assert_eq!(rules[1].name, "second");

        let toggled = store.set_rule_enabled(&first.id, true).await.unwrap();
        assert!(toggled.enabled);
    }

    #[tokio::test]
    async fn baselines_collateral_preferences_round_trip() {
        let (store, _dir) = temp_store().await;
        store
            .upsert_baseline(&Baseline {
                symbol: "XRP".to_string(),
                baseline: 10.0,
                auto_increment_on_deposit: true,
                min_tokens: Some(10.0),
                avg_buy_price: Some(0.4),
            })
            .await
            .unwrap();
        let b = store.get_baseline("XRP").await.unwrap().unwrap();
        assert_eq!(b.min_tokens, Some(10.0));

        store
            .replace_collateral(&[CollateralPosition {
                symbol: "BTC".to_string(),
                locked_qty: 0.5,
                health: 1.8,
            }])
            .await
            .unwrap();
        let coll = store.list_collateral().await.unwrap();
        assert_eq!(coll.len(), 1);
        assert!((coll[0].locked_qty - 0.5).abs() < 1e-12);

        store
            .upsert_preferences(&Preferences {
                risk_tolerance: 0.4,
                preferred_profit_target: 20.0,
                approval_rate: 0.8,
                favorite_symbol: Some("BTC".to_string()),
                confidence: 0.5,
                sample_size: 50,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let prefs = store.read_preferences().await.unwrap().unwrap();
        assert_eq!(prefs.sample_size, 50);
    }

    #[tokio::test]
    async fn alerts_and_audit_append() {
        let (store, _dir) = temp_store().await;
        store
            .record_alert(&AlertRecord::new("snapshot", Severity::Warning, "fetch failed"))
            .await
            .unwrap();
        store
            .insert_audit(&AuditRecord::new("diagnostics", "tick"))
            .await
            .unwrap();
        let alerts = store.recent_alerts(5).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
    }
}
