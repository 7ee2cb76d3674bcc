//! Manual zone control (§4.7): a thin, synchronous-feeling entry point for
//! "run this zone now" / "stop this pump now", backed by the same pump
//! executors the scheduler submits to. No priority over scheduled jobs —
//! FIFO is strict, so a manual run just takes its place in the queue.

use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config_store::ConfigStore;
use crate::error::ManualError;
use crate::model::{Job, JobId, JobOrigin, PumpId, ZoneId};
use crate::pump_executor::PumpHandle;

pub struct ManualController {
    clock: Arc<dyn Clock>,
    config: Arc<dyn ConfigStore>,
    pumps: Arc<std::sync::RwLock<HashMap<PumpId, PumpHandle>>>,
    next_job_id: std::sync::atomic::AtomicU64,
}

impl ManualController {
    pub fn new(
        clock: Arc<dyn Clock>,
        config: Arc<dyn ConfigStore>,
        pumps: Arc<std::sync::RwLock<HashMap<PumpId, PumpHandle>>>,
    ) -> Self {
        Self {
            clock,
            config,
            pumps,
            next_job_id: std::sync::atomic::AtomicU64::new(1_000_000),
        }
    }

    /// Submits a one-off job to run `zone_id` for `duration_sec` seconds.
    pub async fn run_zone(&self, zone_id: &ZoneId, duration_sec: i64) -> Result<JobId, ManualError> {
        if duration_sec <= 0 {
            return Err(ManualError::DurationInvalid(duration_sec));
        }

        let snapshot = self.config.snapshot();
        let zone = snapshot
            .zone(zone_id)
            .ok_or_else(|| ManualError::ZoneNotFound(zone_id.clone()))?;
        let pump = snapshot
            .pump(&zone.pump_id)
            .ok_or_else(|| ManualError::PumpNotFound(zone.pump_id.clone()))?;

        let handle = {
            let pumps = self.pumps.read().expect("pump map lock poisoned");
            pumps
                .get(&pump.id)
                .cloned()
                .ok_or(ManualError::ExecutorUnavailable)?
        };

        let job_id = self
            .next_job_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let job = Job {
            job_id,
            pump_id: pump.id.clone(),
            zone_id: zone.id.clone(),
            zone_name: zone.name.clone(),
            switch_ref: zone.switch_ref.clone(),
            run_seconds: duration_sec,
            origin: JobOrigin::Manual,
            submitted_at: self.clock.now(),
            scheduled_for: None,
        };

        handle
            .submit(job)
            .await
            .map_err(|_dropped| ManualError::ExecutorUnavailable)?;

        Ok(job_id)
    }

    /// Cancels whatever job is currently active on `pump_id`; queued jobs
    /// behind it are unaffected and will run next.
    pub async fn stop_pump(&self, pump_id: &PumpId) -> Result<(), ManualError> {
        let handle = {
            let pumps = self.pumps.read().expect("pump map lock poisoned");
            pumps
                .get(pump_id)
                .cloned()
                .ok_or_else(|| ManualError::PumpNotFound(pump_id.clone()))?
        };
        handle.cancel_current().await;
        Ok(())
    }
}
