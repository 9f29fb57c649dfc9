// =============================================================================
// Coinward — Autonomous Trading Supervisor — Main Entry Point
// =============================================================================
//
// The process starts in dry-run mode unless an owner identifier is
// configured AND DRY_RUN=false was explicitly requested. Simulated
// execution is always the failure-safe default.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod anomaly;
mod api;
mod app_state;
mod broker;
mod config;
mod errors;
mod evaluator;
mod events;
mod indicators;
mod killswitch;
mod learning;
mod mfa;
mod notify;
mod pipeline;
mod records;
mod risk;
mod rules;
mod scanner;
mod scheduler;
mod snapshot;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::{Brokerage, HttpBroker, PaperBroker};
use crate::config::Config;
use crate::notify::{LogNotifier, Notifier};
use crate::store::Store;

/// Consecutive ports tried when the configured one is taken.
const BIND_ATTEMPTS: u16 = 5;

/// How long in-flight work may linger after the shutdown signal.
const SHUTDOWN_GRACE_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Coinward Supervisor — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Config::from_env();
    info!(
        dry_run = config.effective_dry_run(),
        light_mode = config.light_mode,
        port = config.port,
        "configuration loaded"
    );

    // ── 2. Persistence gateway (degraded mode tolerated) ────────────────
    let store = Arc::new(Store::open_async(&config.db_path).await);
    if !store.is_connected() {
        warn!("starting in degraded mode — the watchdog will keep retrying");
    }

    // ── 3. Brokerage capability ──────────────────────────────────────────
    let broker: Arc<dyn Brokerage> = if config.broker_api_key.is_empty() {
        warn!("no brokerage credentials — using the paper venue");
        Arc::new(PaperBroker::with_demo_portfolio())
    } else {
        Arc::new(HttpBroker::new(
            config.broker_base_url.clone(),
            config.broker_api_key.clone(),
            config.broker_api_secret.clone(),
        ))
    };
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    // ── 4. Build shared state ────────────────────────────────────────────
    let light_mode = config.light_mode;
    let state = AppState::build(config, store.clone(), broker, notifier);

    // ── 5. Shutdown signal fabric ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Store watchdog runs in every mode; reconnection matters even for a
    // diagnostics-only process.
    tokio::spawn(
        store
            .clone()
            .run_watchdog(state.bus.clone(), shutdown_rx.clone()),
    );

    // ── 6. Initial snapshot (seeds baselines on first run) ───────────────
    state.snapshots.capture("startup").await;

    // ── 7. Bind the API listener with port retry ─────────────────────────
    let desired_port = state.config.port;
    let (listener, bound_port) = bind_with_retry(desired_port).await?;
    state.set_active_port(bound_port);
    info!(port = bound_port, "API server listening");

    let app = api::rest::router(state.clone());
    let server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let mut rx = server_shutdown;
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server failed");
        }
    });

    // ── 8. Heartbeat (runs even in light mode so /live stays alive) ──────
    {
        let bus = state.bus.clone();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => bus.publish_heartbeat(),
                    _ = rx.changed() => return,
                }
            }
        });
    }

    // ── 9. Periodic schedulers ───────────────────────────────────────────
    let worker_handles = if light_mode {
        warn!("LIGHT_MODE — all schedulers disabled (diagnostics-only run)");
        Vec::new()
    } else {
        scheduler::spawn_all(state.clone(), shutdown_rx.clone())
    };

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("shutdown signal received — stopping gracefully");

    state.pipeline.begin_shutdown();
    let _ = shutdown_tx.send(true);

    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = server.await;
    };
    if tokio::time::timeout(std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS), drain)
        .await
        .is_err()
    {
        warn!("shutdown grace period elapsed — abandoning in-flight work");
    }

    state.bus.close_all();
    info!("Coinward shut down complete");
    Ok(())
}

/// Bind `0.0.0.0:port`, retrying the next four ports on address-in-use.
/// Exhausting all five attempts is fatal (non-zero exit).
async fn bind_with_retry(port: u16) -> anyhow::Result<(TcpListener, u16)> {
    for offset in 0..BIND_ATTEMPTS {
        let candidate = port + offset;
        match TcpListener::bind(("0.0.0.0", candidate)).await {
            Ok(listener) => return Ok((listener, candidate)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(port = candidate, "port in use — trying the next one");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("binding 0.0.0.0:{candidate} failed"));
            }
        }
    }
    anyhow::bail!(
        "no free port in {}..={} after {} attempts",
        port,
        port + BIND_ATTEMPTS - 1,
        BIND_ATTEMPTS
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Find a base port (searching upward from `start`) where `count`
    /// consecutive listeners can be taken, so bind behaviour is
    /// deterministic. Each test uses a disjoint search range to avoid
    /// racing its siblings.
    async fn occupy_consecutive(start: u16, count: u16) -> (u16, Vec<TcpListener>) {
        let mut base = start;
        'outer: loop {
            let mut held = Vec::new();
            for offset in 0..count {
                match TcpListener::bind(("0.0.0.0", base + offset)).await {
                    Ok(l) => held.push(l),
                    Err(_) => {
                        base += count + 1;
                        assert!(base < start + 900, "no usable port range found");
                        continue 'outer;
                    }
                }
            }
            return (base, held);
        }
    }

    #[tokio::test]
    async fn bind_retries_past_busy_ports() {
        let (base, mut held) = occupy_consecutive(43_211, 3).await;
        // Free the last of the three; the first two stay busy.
        held.pop();

        let (_listener, port) = bind_with_retry(base).await.unwrap();
        assert_eq!(port, base + 2);
    }

    #[tokio::test]
    async fn bind_fails_after_five_busy_ports() {
        let (base, _held) = occupy_consecutive(44_311, 5).await;
        assert!(bind_with_retry(base).await.is_err());
    }

    #[tokio::test]
    async fn bind_uses_first_free_port() {
        let (base, held) = occupy_consecutive(45_411, 1).await;
        drop(held);
        let (_listener, port) = bind_with_retry(base).await.unwrap();
        assert_eq!(port, base);
    }
}
