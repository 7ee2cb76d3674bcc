//! Tick-driven scheduler (§4.5): every `scheduler_interval_sec`, resolves
//! due firings from the current config snapshot and submits one `Job` per
//! firing to the owning pump's queue. Mirrors the teacher's `scheduler.rs`
//! shape — a `run(...)` loop function spawned as its own task, reading
//! shared state and publishing through the same channels the rest of the
//! system uses, rather than mutating anything directly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use time::Date;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config_store::ConfigStore;
use crate::host_client::HostClient;
use crate::model::{EventId, Job, JobId, JobOrigin, ZoneId};
use crate::pump_executor::PumpHandle;
use crate::schedule_calculator::{is_due, next_firings_today, parse_time_of_day};

/// Key identifying one firing instance for dedup purposes: an event fires
/// at most once per calendar day, even if the scheduler restarts (§4.4/§4.5:
/// "a crash-restart must never re-fire an event that already ran today").
type FiringKey = (EventId, Date);

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    host: Arc<dyn HostClient>,
    config: Arc<dyn ConfigStore>,
    pumps: std::collections::HashMap<String, PumpHandle>,
    cancel: CancellationToken,
    fired_today: HashSet<FiringKey>,
    last_day_seen: Option<Date>,
    next_job_id: JobId,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        host: Arc<dyn HostClient>,
        config: Arc<dyn ConfigStore>,
        pumps: std::collections::HashMap<String, PumpHandle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            clock,
            host,
            config,
            pumps,
            cancel,
            fired_today: HashSet::new(),
            last_day_seen: None,
            next_job_id: 1,
        }
    }

    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        let snapshot = self.config.snapshot();
        let interval = Duration::from_secs(snapshot.settings.scheduler_interval_sec.max(1));
        drop(snapshot);

        loop {
            if self.cancel.is_cancelled() {
                info!("scheduler stopping");
                return;
            }

            self.tick().await;

            self.clock.sleep(interval, &self.cancel).await;
            if self.cancel.is_cancelled() {
                info!("scheduler stopping");
                return;
            }
        }
    }

    async fn tick(&mut self) {
        let now = self.clock.now();
        let today = now.date();
        if self.last_day_seen != Some(today) {
            self.fired_today.clear();
            self.last_day_seen = Some(today);
        }

        let snapshot = self.config.snapshot();
        // The due window equals the tick interval so each firing is
        // considered due during exactly one tick (§4.4/§4.5).
        let due_window = time::Duration::seconds(snapshot.settings.scheduler_interval_sec.max(1) as i64);

        // Resolve candidate (event, firing, zone) triples, deterministically
        // sorted by (scheduled_for, event_id, zone_id) so concurrent firings
        // submit to pumps in a stable order (§4.5).
        let mut due: Vec<(Job, FiringKey)> = Vec::new();

        for event in &snapshot.events {
            if !event.enabled {
                continue;
            }
            let room = snapshot.room(&event.room_id);

            // P1 needs the instant the lights actually turned on; rooms
            // expose that as a time-of-day entity ("HH:MM[:SS]"), so it's
            // read via `read_time_of_day` and combined with today's date.
            let lights_on_instant = match room.and_then(|r| r.lights_on_ref.as_ref()) {
                Some(entity_ref) => match self.host.read_time_of_day(entity_ref).await {
                    Ok(raw) => match parse_time_of_day(&raw) {
                        Some(t) => Some(now.replace_time(t)),
                        None => {
                            warn!(event = %event.id, value = %raw, "unparseable lights-on reference");
                            None
                        }
                    },
                    Err(e) => {
                        warn!(event = %event.id, error = %e, "could not read lights-on reference");
                        None
                    }
                },
                None => None,
            };

            for firing in next_firings_today(event, lights_on_instant, now) {
                let key = (event.id.clone(), today);
                if self.fired_today.contains(&key) {
                    continue;
                }
                if !is_due(firing, now, due_window) {
                    continue;
                }

                for zone_id in &event.assigned_zone_ids {
                    if let Some(job) = self.build_job(&snapshot, zone_id, event.run_seconds, now) {
                        due.push((job, key.clone()));
                    }
                }
            }
        }

        due.sort_by(|(a, ak), (b, bk)| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(ak.0.cmp(&bk.0))
                .then(a.zone_id.cmp(&b.zone_id))
        });

        for (job, key) in due {
            self.fired_today.insert(key);
            self.submit(job).await;
        }
    }

    fn build_job(
        &mut self,
        snapshot: &crate::config_store::ConfigSnapshot,
        zone_id: &ZoneId,
        run_seconds: i64,
        now: time::OffsetDateTime,
    ) -> Option<Job> {
        let zone = snapshot.zone(zone_id)?;
        if !zone.enabled {
            return None;
        }
        let pump = snapshot.pump(&zone.pump_id)?;
        if !pump.enabled {
            return None;
        }

        let job_id = self.next_job_id;
        self.next_job_id += 1;

        Some(Job {
            job_id,
            pump_id: pump.id.clone(),
            zone_id: zone.id.clone(),
            zone_name: zone.name.clone(),
            switch_ref: zone.switch_ref.clone(),
            run_seconds,
            origin: JobOrigin::Scheduled,
            submitted_at: now,
            scheduled_for: Some(now),
        })
    }

    async fn submit(&self, job: Job) {
        let Some(handle) = self.pumps.get(&job.pump_id) else {
            warn!(pump = %job.pump_id, job_id = job.job_id, "no executor for pump — dropping job");
            return;
        };

        if let Err(dropped) = handle.submit(job).await {
            warn!(
                pump = %dropped.pump_id,
                job_id = dropped.job_id,
                zone = %dropped.zone_id,
                "pump queue full — dropping scheduled job"
            );
        }
    }
}
