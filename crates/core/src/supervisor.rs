//! Process-wide lifecycle owner (§4.8, §5, §7): builds one `PumpExecutor`
//! per configured pump, runs the scheduler against them, and drives startup
//! and shutdown. Task-death handling follows the teacher's `main.rs` split
//! between safety-critical tasks (death is fatal) and non-critical ones
//! (death is logged and the system carries on) — here the scheduler is
//! safety-critical (no scheduler means no auto-watering runs at all) while
//! an individual pump executor's death is isolated and restarted in place,
//! since the other pumps must keep working.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config_store::ConfigStore;
use crate::host_client::HostClient;
use crate::manual_controller::ManualController;
use crate::model::{Pump, PumpId, SystemSettings};
use crate::pump_executor::{PumpExecutor, PumpHandle};
use crate::scheduler::Scheduler;

pub struct Supervisor {
    clock: Arc<dyn Clock>,
    host: Arc<dyn HostClient>,
    config: Arc<dyn ConfigStore>,
    cancel: CancellationToken,
    pumps: Arc<std::sync::RwLock<HashMap<PumpId, PumpHandle>>>,
    pump_tasks: HashMap<PumpId, (Pump, JoinHandle<()>)>,
    scheduler_task: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(clock: Arc<dyn Clock>, host: Arc<dyn HostClient>, config: Arc<dyn ConfigStore>) -> Self {
        Self {
            clock,
            host,
            config,
            cancel: CancellationToken::new(),
            pumps: Arc::new(std::sync::RwLock::new(HashMap::new())),
            pump_tasks: HashMap::new(),
            scheduler_task: None,
        }
    }

    pub fn manual_controller(&self) -> ManualController {
        ManualController::new(self.clock.clone(), self.config.clone(), self.pumps.clone())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns one executor per configured pump (regardless of `enabled`)
    /// plus the scheduler task. `enabled` only gates *scheduled* firings
    /// (`Scheduler::build_job`) — a manual command must reach the pump even
    /// if it, or its zone, is disabled for auto-watering (§3 invariant 5).
    pub fn start(&mut self) {
        let snapshot = self.config.snapshot();
        let settings = snapshot.settings;

        for pump in &snapshot.pumps {
            self.spawn_pump(pump.clone(), settings);
        }

        let pumps_snapshot = self.pumps.read().expect("pump map lock poisoned").clone();
        let scheduler = Scheduler::new(
            self.clock.clone(),
            self.host.clone(),
            self.config.clone(),
            pumps_snapshot,
            self.cancel.clone(),
        );
        self.scheduler_task = Some(scheduler.spawn());

        info!(pump_count = snapshot.pumps.len(), "supervisor started");
    }

    fn spawn_pump(&mut self, pump: Pump, settings: SystemSettings) {
        let (handle, join) = PumpExecutor::spawn(
            pump.clone(),
            self.host.clone(),
            self.clock.clone(),
            settings,
            self.cancel.clone(),
        );
        self.pumps
            .write()
            .expect("pump map lock poisoned")
            .insert(pump.id.clone(), handle);
        self.pump_tasks.insert(pump.id.clone(), (pump, join));
    }

    /// Blocks until cancelled — externally, or because a safety-critical
    /// task (the scheduler) died on its own. Does not tear anything down;
    /// call `shutdown` afterwards.
    pub async fn run(&mut self) {
        if let Some(task) = self.scheduler_task.as_mut() {
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = task => {
                    if !self.cancel.is_cancelled() {
                        error!("scheduler task exited — this is safety-critical, shutting down");
                        self.cancel.cancel();
                    }
                }
            }
        } else {
            self.cancel.cancelled().await;
        }
    }

    /// Checks every pump task once; any that died from a panic are
    /// restarted in place so a bug isolated to one pump's worker doesn't
    /// take the others down with it. Intended to be polled periodically by
    /// the binary's own `tokio::select!` loop alongside `run`.
    pub async fn reap_dead_pumps(&mut self) {
        let dead: Vec<PumpId> = self
            .pump_tasks
            .iter()
            .filter(|(_, (_, join))| join.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for pump_id in dead {
            let Some((pump, join)) = self.pump_tasks.remove(&pump_id) else {
                continue;
            };

            // `join` already finished; awaiting it resolves immediately.
            let outcome = join.await;

            match outcome {
                Err(e) if e.is_panic() => {
                    warn!(pump = %pump_id, "pump executor panicked — restarting");
                }
                Err(_) => {
                    info!(pump = %pump_id, "pump executor task was aborted, not restarting");
                    continue;
                }
                Ok(()) => {
                    if self.cancel.is_cancelled() {
                        continue;
                    }
                    warn!(pump = %pump_id, "pump executor exited unexpectedly — restarting");
                }
            }

            if self.cancel.is_cancelled() {
                continue;
            }
            let settings = self.config.snapshot().settings;
            self.spawn_pump(pump, settings);
        }
    }

    /// Cancels everything, then waits (bounded by `2 * stuck_lock_timeout_sec`,
    /// the time the slowest pump could need to finish tearing down a job) for
    /// every pump worker to exit before returning (§5: "shutdown must not
    /// return until every pump has confirmed its lock is released or the
    /// grace period has elapsed").
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();

        let settings = self.config.snapshot().settings;
        let grace = Duration::from_secs(settings.stuck_lock_timeout_sec.saturating_mul(2));

        if let Some(task) = self.scheduler_task.take() {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("scheduler task did not exit within the shutdown grace period");
            }
        }

        for (pump_id, (_, task)) in self.pump_tasks.drain() {
            if tokio::time::timeout(grace, task).await.is_err() {
                error!(pump = %pump_id, "pump executor did not exit within the shutdown grace period");
            }
        }

        info!("supervisor shutdown complete");
    }
}
