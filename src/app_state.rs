// =============================================================================
// Central Application State — Coinward supervisor
// =============================================================================
//
// The single source of truth shared across all async tasks via
// `Arc<AppState>`. Subsystems manage their own interior mutability; this
// struct wires them together and exposes the unified view the HTTP surface
// serves.
// =============================================================================

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::anomaly::AnomalyDetector;
use crate::broker::Brokerage;
use crate::config::Config;
use crate::evaluator::Evaluator;
use crate::events::EventBus;
use crate::killswitch::KillSwitchController;
use crate::learning::LearningEngine;
use crate::mfa::MfaService;
use crate::notify::Notifier;
use crate::pipeline::ExecutionPipeline;
use crate::risk::RiskGate;
use crate::scanner::ProfitScanner;
use crate::snapshot::SnapshotEngine;
use crate::store::Store;

/// Shared state for the whole supervisor.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub broker: Arc<dyn Brokerage>,
    pub risk: Arc<RiskGate>,
    pub pipeline: Arc<ExecutionPipeline>,
    pub killswitch: Arc<KillSwitchController>,
    pub snapshots: Arc<SnapshotEngine>,
    pub scanner: Arc<ProfitScanner>,
    pub anomaly: Arc<AnomalyDetector>,
    pub learning: Arc<LearningEngine>,
    pub evaluator: Evaluator,

    /// Current snapshot cadence in minutes; the volatility controller
    /// retargets it and the snapshot loop follows the channel.
    pub snapshot_interval_tx: watch::Sender<u64>,
    pub snapshot_interval_rx: watch::Receiver<u64>,

    /// Port the HTTP listener actually bound (after in-use retries).
    pub active_port: AtomicU16,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire every subsystem together. The brokerage and notifier are passed
    /// in so tests and credential-less runs can substitute fakes.
    pub fn build(
        config: Config,
        store: Arc<Store>,
        broker: Arc<dyn Brokerage>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let bus = Arc::new(EventBus::default());
        let risk = Arc::new(RiskGate::new(&config));
        let mfa = Arc::new(MfaService::new(store.clone(), notifier));
        let pipeline = Arc::new(ExecutionPipeline::new(
            config.clone(),
            store.clone(),
            bus.clone(),
            broker.clone(),
            risk.clone(),
            mfa,
        ));
        let killswitch = Arc::new(KillSwitchController::new(
            &config,
            store.clone(),
            bus.clone(),
            risk.clone(),
        ));
        let snapshots = Arc::new(SnapshotEngine::new(
            broker.clone(),
            store.clone(),
            bus.clone(),
        ));
        let scanner = Arc::new(ProfitScanner::new(&config, store.clone(), bus.clone()));
        let anomaly = Arc::new(AnomalyDetector::new(&config, store.clone(), bus.clone()));
        let learning = Arc::new(LearningEngine::new(store.clone()));
        let evaluator = Evaluator::new(config.auto_execute_enabled);

        let (snapshot_interval_tx, snapshot_interval_rx) =
            watch::channel(config.snapshot_interval_minutes);

        Arc::new(Self {
            config,
            store,
            bus,
            broker,
            risk,
            pipeline,
            killswitch,
            snapshots,
            scanner,
            anomaly,
            learning,
            evaluator,
            snapshot_interval_tx,
            snapshot_interval_rx,
            active_port: AtomicU16::new(0),
            start_time: std::time::Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn active_port(&self) -> u16 {
        self.active_port.load(Ordering::Relaxed)
    }

    pub fn set_active_port(&self, port: u16) {
        self.active_port.store(port, Ordering::Relaxed);
    }

    /// Current snapshot cadence in minutes.
    pub fn snapshot_interval_minutes(&self) -> u64 {
        *self.snapshot_interval_rx.borrow()
    }
}
