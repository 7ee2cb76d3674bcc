//! Per-pump worker (§4.6): a single task owns the physical pump lock and
//! zone switch for one pump, runs jobs strictly FIFO, and guarantees that a
//! zone switch and pump lock are never abandoned in the "on" state — even
//! when a job is cancelled or the worker is shutting down.
//!
//! Shaped after the teacher's `SharedState` pattern (`Arc<RwLock<...>>` for
//! readers, a dedicated task owning the mutation), generalized to a
//! `watch::Receiver<PumpStatus>` per pump instead of one global state blob.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::HostError;
use crate::host_client::HostClient;
use crate::model::{Job, JobId, Pump, SystemSettings};

/// Depth of the per-pump submit queue (§4.5: "a non-blocking bounded
/// channel; a full queue is logged and the job is dropped").
pub const QUEUE_CAPACITY: usize = 32;

/// Re-read interval while waiting for an externally-held lock to free up
/// (§4.6 step 2: "re-reading every 5s").
const STUCK_LOCK_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    AcquiringLock,
    PumpStartup,
    ZoneOn,
    Running,
    ZoneOff,
    ReleasingLock,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct PumpStatus {
    pub pump_id: String,
    pub current_job: Option<JobId>,
    pub state: JobState,
    pub queue_len: usize,
    pub updated_at: OffsetDateTime,
}

impl PumpStatus {
    fn idle(pump_id: String, now: OffsetDateTime) -> Self {
        Self {
            pump_id,
            current_job: None,
            state: JobState::Completed,
            queue_len: 0,
            updated_at: now,
        }
    }
}

pub enum ExecutorMsg {
    Submit(Job),
    /// Cancels whatever job is currently running; queued-but-not-started
    /// jobs are unaffected (§4.7: "stop affects only the active job").
    CancelCurrent,
    Shutdown,
}

/// Handle held by the supervisor / manual controller to talk to a pump's
/// worker task.
#[derive(Clone)]
pub struct PumpHandle {
    pub tx: mpsc::Sender<ExecutorMsg>,
    pub status: watch::Receiver<PumpStatus>,
}

impl PumpHandle {
    pub async fn submit(&self, job: Job) -> Result<(), Job> {
        match self.tx.try_send(ExecutorMsg::Submit(job)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(ExecutorMsg::Submit(job))) => Err(job),
            Err(mpsc::error::TrySendError::Closed(ExecutorMsg::Submit(job))) => Err(job),
            _ => unreachable!("only Submit is ever sent back"),
        }
    }

    pub async fn cancel_current(&self) {
        let _ = self.tx.send(ExecutorMsg::CancelCurrent).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(ExecutorMsg::Shutdown).await;
    }
}

pub struct PumpExecutor {
    pump: Pump,
    host: Arc<dyn HostClient>,
    clock: Arc<dyn Clock>,
    settings: SystemSettings,
    rx: mpsc::Receiver<ExecutorMsg>,
    status_tx: watch::Sender<PumpStatus>,
    shutdown: CancellationToken,
}

impl PumpExecutor {
    /// Spawns the worker task and returns a handle to it. `shutdown` is the
    /// process-wide cancellation root (§5); when tripped, the worker finishes
    /// tearing down any in-flight job before exiting.
    pub fn spawn(
        pump: Pump,
        host: Arc<dyn HostClient>,
        clock: Arc<dyn Clock>,
        settings: SystemSettings,
        shutdown: CancellationToken,
    ) -> (PumpHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(PumpStatus::idle(pump.id.clone(), clock.now()));

        let executor = PumpExecutor {
            pump,
            host,
            clock,
            settings,
            rx,
            status_tx,
            shutdown,
        };

        let handle = tokio::spawn(executor.run());
        (
            PumpHandle {
                tx,
                status: status_rx,
            },
            handle,
        )
    }

    fn publish(&self, current_job: Option<JobId>, state: JobState, queue_len: usize) {
        let _ = self.status_tx.send(PumpStatus {
            pump_id: self.pump.id.clone(),
            current_job,
            state,
            queue_len,
            updated_at: self.clock.now(),
        });
    }

    async fn run(mut self) {
        let mut queue: VecDeque<Job> = VecDeque::new();

        loop {
            while let Ok(msg) = self.rx.try_recv() {
                match msg {
                    ExecutorMsg::Submit(job) => queue.push_back(job),
                    ExecutorMsg::CancelCurrent => {}
                    ExecutorMsg::Shutdown => {
                        info!(pump = %self.pump.id, "pump worker received shutdown, stopping");
                        return;
                    }
                }
            }

            let Some(job) = queue.pop_front() else {
                if self.shutdown.is_cancelled() {
                    return;
                }
                tokio::select! {
                    msg = self.rx.recv() => match msg {
                        Some(ExecutorMsg::Submit(job)) => queue.push_back(job),
                        Some(ExecutorMsg::CancelCurrent) => {}
                        Some(ExecutorMsg::Shutdown) | None => return,
                    },
                    _ = self.shutdown.cancelled() => return,
                }
                continue;
            };

            self.publish(Some(job.job_id), JobState::Pending, queue.len());
            let outcome = self.run_job(job.clone(), &mut queue).await;
            match &outcome {
                JobOutcome::Completed => info!(pump = %self.pump.id, job_id = job.job_id, "job completed"),
                JobOutcome::Cancelled => info!(pump = %self.pump.id, job_id = job.job_id, "job cancelled"),
                JobOutcome::Failed(reason) => {
                    warn!(pump = %self.pump.id, job_id = job.job_id, reason, "job failed")
                }
            }
            self.publish(None, JobState::Completed, queue.len());
        }
    }

    /// Races `fut` against incoming executor messages: `Submit` enqueues,
    /// `CancelCurrent`/`Shutdown` trips `job_cancel`. Returns `Err(())` if
    /// `job_cancel` fires before `fut` resolves.
    async fn race<T>(
        &mut self,
        queue: &mut VecDeque<Job>,
        job_cancel: &CancellationToken,
        fut: impl Future<Output = T>,
    ) -> Result<T, ()> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                res = &mut fut => return Ok(res),
                _ = job_cancel.cancelled() => return Err(()),
                msg = self.rx.recv() => match msg {
                    Some(ExecutorMsg::Submit(job)) => queue.push_back(job),
                    Some(ExecutorMsg::CancelCurrent) => job_cancel.cancel(),
                    Some(ExecutorMsg::Shutdown) | None => job_cancel.cancel(),
                },
            }
        }
    }

    async fn run_job(&mut self, job: Job, queue: &mut VecDeque<Job>) -> JobOutcome {
        let job_cancel = self.shutdown.child_token();

        self.publish(Some(job.job_id), JobState::AcquiringLock, queue.len());

        // Pre-acquire external-busy check (§4.6 step 2): if something else
        // already holds the lock, wait for it to free up (force-resetting
        // after the stuck-lock timeout) before we touch it ourselves.
        if let Some(outcome) = self.wait_for_lock_free(&job_cancel, queue, job.job_id).await {
            return outcome;
        }

        let lock_result = self
            .race(queue, &job_cancel, self.host.set_bool(&self.pump.lock_ref, true))
            .await;
        match lock_result {
            Err(()) => return JobOutcome::Cancelled,
            Ok(Err(e)) => return JobOutcome::Failed(format!("lock acquire failed: {e}")),
            Ok(Ok(())) => {}
        }

        self.publish(Some(job.job_id), JobState::PumpStartup, queue.len());
        let startup = Duration::from_secs(self.settings.pump_startup_delay_sec);
        let clock = self.clock.clone();
        let startup_cancel = job_cancel.clone();
        let cancelled_during_startup = self
            .race(queue, &job_cancel, async move {
                clock.sleep(startup, &startup_cancel).await;
            })
            .await
            .is_err();
        if cancelled_during_startup {
            let _ = self.host.set_bool(&self.pump.lock_ref, false).await;
            return JobOutcome::Cancelled;
        }

        self.publish(Some(job.job_id), JobState::ZoneOn, queue.len());
        if let Err(e) = self.host.set_bool(&job.switch_ref, true).await {
            let _ = self.host.set_bool(&self.pump.lock_ref, false).await;
            return JobOutcome::Failed(format!("zone on failed: {e}"));
        }

        self.publish(Some(job.job_id), JobState::Running, queue.len());
        let run_duration = Duration::from_secs(job.run_seconds.max(0) as u64);
        let clock = self.clock.clone();
        let run_cancel = job_cancel.clone();
        let cancelled_during_run = self
            .race(queue, &job_cancel, async move {
                clock.sleep(run_duration, &run_cancel).await;
            })
            .await
            .is_err();

        // Teardown always runs, whether the job completed naturally or was
        // cancelled mid-run: the zone switch and pump lock must never be
        // abandoned in the "on" state.
        self.publish(Some(job.job_id), JobState::ZoneOff, queue.len());
        if let Err(e) = self.host.set_bool(&job.switch_ref, false).await {
            warn!(pump = %self.pump.id, job_id = job.job_id, error = %e, "zone-off during teardown failed — will still attempt lock release");
        }

        self.publish(Some(job.job_id), JobState::ReleasingLock, queue.len());
        if let Err(e) = self.host.set_bool(&self.pump.lock_ref, false).await {
            error!(pump = %self.pump.id, job_id = job.job_id, error = %e, "lock release failed");
            return JobOutcome::Failed(format!("lock release failed: {e}"));
        }

        if cancelled_during_run {
            JobOutcome::Cancelled
        } else {
            JobOutcome::Completed
        }
    }

    /// Reads `lockRef` before we've touched it; if it already reads "on" the
    /// pump is externally busy. Waits up to `stuck_lock_timeout_sec`,
    /// re-reading every `STUCK_LOCK_POLL_INTERVAL`; if it is still on once
    /// the timeout elapses, force-resets it with a stuck-lock warning and
    /// lets the job proceed regardless (§4.6 step 2). Returns `Some` only on
    /// cancellation or an unrecoverable read/reset failure — `None` means
    /// the lock is now free (or was forced free) and the job should go on
    /// to acquire it itself.
    async fn wait_for_lock_free(
        &mut self,
        job_cancel: &CancellationToken,
        queue: &mut VecDeque<Job>,
        job_id: JobId,
    ) -> Option<JobOutcome> {
        let deadline = self.clock.now() + time::Duration::seconds(self.settings.stuck_lock_timeout_sec as i64);

        loop {
            match self.host.read_bool(&self.pump.lock_ref).await {
                Ok(false) => return None,
                Ok(true) | Err(HostError::Transient { .. }) => {}
                Err(e) => return Some(JobOutcome::Failed(format!("lock read failed: {e}"))),
            }

            if self.clock.now() >= deadline {
                warn!(pump = %self.pump.id, job_id, "pump lock stuck on externally — forcing release");
                if let Err(e) = self.host.set_bool(&self.pump.lock_ref, false).await {
                    error!(pump = %self.pump.id, job_id, error = %e, "forced lock release failed");
                    return Some(JobOutcome::Failed(format!("forced lock release failed: {e}")));
                }
                return None;
            }

            let clock = self.clock.clone();
            let poll_cancel = job_cancel.clone();
            if self
                .race(queue, job_cancel, async move {
                    clock.sleep(STUCK_LOCK_POLL_INTERVAL, &poll_cancel).await;
                })
                .await
                .is_err()
            {
                return Some(JobOutcome::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::host_client::testing::MockHostClient;
    use crate::model::JobOrigin;
    use time::macros::datetime;

    fn test_pump() -> Pump {
        Pump {
            id: "p1".into(),
            room_id: "r1".into(),
            name: "Main Pump".into(),
            lock_ref: "switch.pump_lock".into(),
            enabled: true,
        }
    }

    fn test_job(job_id: JobId, run_seconds: i64) -> Job {
        Job {
            job_id,
            pump_id: "p1".into(),
            zone_id: "z1".into(),
            zone_name: "Zone 1".into(),
            switch_ref: "switch.zone1".into(),
            run_seconds,
            origin: JobOrigin::Manual,
            submitted_at: datetime!(2024-03-01 08:00:00 UTC),
            scheduled_for: None,
        }
    }

    fn settings() -> SystemSettings {
        SystemSettings {
            pump_startup_delay_sec: 1,
            zone_switch_delay_sec: 1,
            scheduler_interval_sec: 60,
            stuck_lock_timeout_sec: 5,
        }
    }

    #[tokio::test]
    async fn happy_path_completes_and_releases_lock() {
        let host = Arc::new(MockHostClient::new());
        let clock = Arc::new(VirtualClock::new(datetime!(2024-03-01 08:00:00 UTC)));
        let cancel = CancellationToken::new();

        let (handle, join) = PumpExecutor::spawn(test_pump(), host.clone(), clock.clone(), settings(), cancel.clone());
        handle.submit(test_job(1, 10)).await.unwrap();

        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(1)).await; // pump startup
        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(10)).await; // run duration

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let status = handle.status.borrow().clone();
                if status.current_job.is_none() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("job should complete");

        handle.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;

        assert_eq!(host.read_bool(&"switch.pump_lock".into()).await.unwrap(), false);
        assert_eq!(host.read_bool(&"switch.zone1".into()).await.unwrap(), false);
    }

    #[tokio::test]
    async fn cancel_mid_run_still_turns_off_zone_and_releases_lock() {
        let host = Arc::new(MockHostClient::new());
        let clock = Arc::new(VirtualClock::new(datetime!(2024-03-01 08:00:00 UTC)));
        let cancel = CancellationToken::new();

        let (handle, join) = PumpExecutor::spawn(test_pump(), host.clone(), clock.clone(), settings(), cancel.clone());
        handle.submit(test_job(1, 600)).await.unwrap();

        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(1)).await; // past pump startup, now Running
        tokio::task::yield_now().await;

        handle.cancel_current().await;

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let status = handle.status.borrow().clone();
                if status.current_job.is_none() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("cancelled job should still finish teardown");

        handle.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;

        assert_eq!(host.read_bool(&"switch.zone1".into()).await.unwrap(), false);
        assert_eq!(host.read_bool(&"switch.pump_lock".into()).await.unwrap(), false);
    }

    #[tokio::test]
    async fn jobs_run_strictly_fifo() {
        let host = Arc::new(MockHostClient::new());
        let clock = Arc::new(VirtualClock::new(datetime!(2024-03-01 08:00:00 UTC)));
        let cancel = CancellationToken::new();

        let mut fast_settings = settings();
        fast_settings.pump_startup_delay_sec = 0;

        let (handle, join) =
            PumpExecutor::spawn(test_pump(), host.clone(), clock.clone(), fast_settings, cancel.clone());

        handle.submit(test_job(1, 0)).await.unwrap();
        handle.submit(test_job(2, 0)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let calls = host.set_bool_calls.lock().unwrap();
                if calls.iter().filter(|(e, v)| e.0 == "switch.zone1" && !*v).count() >= 1 {
                    break;
                }
                drop(calls);
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first job should run and turn zone1 off");

        handle.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;

        let calls = host.set_bool_calls.lock().unwrap();
        let zone_on_positions: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, (e, v))| e.0 == "switch.zone1" && *v)
            .map(|(i, _)| i)
            .collect();
        assert!(!zone_on_positions.is_empty());
    }

    #[tokio::test]
    async fn externally_stuck_lock_is_forced_off_after_timeout_then_job_proceeds() {
        let host = Arc::new(MockHostClient::new());
        // Lock reads "on" from the start, as if held by something else, and
        // nothing but our own forced reset will ever clear it.
        host.seed_bool(&"switch.pump_lock".into(), true);

        let clock = Arc::new(VirtualClock::new(datetime!(2024-03-01 08:00:00 UTC)));
        let cancel = CancellationToken::new();

        let mut short_timeout = settings();
        short_timeout.stuck_lock_timeout_sec = 2;
        short_timeout.pump_startup_delay_sec = 0;

        let (handle, join) =
            PumpExecutor::spawn(test_pump(), host.clone(), clock.clone(), short_timeout, cancel.clone());
        handle.submit(test_job(1, 5)).await.unwrap();

        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(5)).await; // past one stuck-lock poll and the timeout
        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(5)).await; // run duration

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let status = handle.status.borrow().clone();
                if status.current_job.is_none() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("job should proceed and complete after the stuck lock is forced off");

        handle.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;

        assert_eq!(host.read_bool(&"switch.pump_lock".into()).await.unwrap(), false);
        assert_eq!(host.read_bool(&"switch.zone1".into()).await.unwrap(), false);
    }

    #[tokio::test]
    async fn lock_already_free_skips_the_wait() {
        let host = Arc::new(MockHostClient::new());
        // Defaults to false — lock is free from the start, no waiting.
        let clock = Arc::new(VirtualClock::new(datetime!(2024-03-01 08:00:00 UTC)));
        let cancel = CancellationToken::new();

        let mut fast_settings = settings();
        fast_settings.pump_startup_delay_sec = 0;
        fast_settings.stuck_lock_timeout_sec = 300;

        let (handle, join) =
            PumpExecutor::spawn(test_pump(), host.clone(), clock.clone(), fast_settings, cancel.clone());
        handle.submit(test_job(1, 5)).await.unwrap();

        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(5)).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if handle.status.borrow().current_job.is_none() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("job with a free lock should complete without waiting out the stuck-lock timeout");

        handle.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;
    }

    /// Tiny deterministic PRNG so the seeded test below is reproducible
    /// without pulling in a dependency for a handful of interleavings.
    struct Xorshift(u64);
    impl Xorshift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
        fn range(&mut self, lo: u64, hi: u64) -> u64 {
            lo + self.next() % (hi - lo)
        }
    }

    /// Mutual exclusion property (§4.6 invariant 2/3): for a shared pump,
    /// at most one zone's switch is ever "on" at a time — submitted jobs
    /// for two zones, run with seeded random durations and interleavings,
    /// must never overlap.
    #[tokio::test]
    async fn mutual_exclusion_holds_across_seeded_job_sequences() {
        for seed in 1..=5u64 {
            let mut rng = Xorshift(seed * 2654435761 | 1);
            let host = Arc::new(MockHostClient::new());
            let clock = Arc::new(VirtualClock::new(datetime!(2024-03-01 08:00:00 UTC)));
            let cancel = CancellationToken::new();

            let mut fast_settings = settings();
            fast_settings.pump_startup_delay_sec = 0;

            let (handle, join) =
                PumpExecutor::spawn(test_pump(), host.clone(), clock.clone(), fast_settings, cancel.clone());

            let job_count = 4;
            for i in 0..job_count {
                let mut job = test_job(i + 1, rng.range(1, 5) as i64);
                job.zone_id = if i % 2 == 0 { "z1".into() } else { "z2".into() };
                job.switch_ref = if i % 2 == 0 {
                    "switch.zone1".into()
                } else {
                    "switch.zone2".into()
                };
                handle.submit(job).await.unwrap();
            }

            for _ in 0..50 {
                clock.advance(Duration::from_secs(1)).await;
                tokio::task::yield_now().await;
            }

            tokio::time::timeout(Duration::from_secs(1), async {
                loop {
                    if handle.status.borrow().current_job.is_none() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
            .await
            .expect("all seeded jobs should drain");

            handle.shutdown().await;
            let _ = tokio::time::timeout(Duration::from_secs(1), join).await;

            // Replay the call log: a zone must always be turned off before
            // the other zone is turned on, for every seed.
            let calls = host.set_bool_calls.lock().unwrap();
            let mut zone1_on = false;
            let mut zone2_on = false;
            for (entity, value) in calls.iter() {
                match entity.0.as_str() {
                    "switch.zone1" => {
                        if *value {
                            assert!(!zone2_on, "seed {seed}: zone1 turned on while zone2 was on");
                        }
                        zone1_on = *value;
                    }
                    "switch.zone2" => {
                        if *value {
                            assert!(!zone1_on, "seed {seed}: zone2 turned on while zone1 was on");
                        }
                        zone2_on = *value;
                    }
                    _ => {}
                }
            }
        }
    }
}
