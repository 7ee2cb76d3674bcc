//! Wall-clock + monotonic time source (§4.1), mockable so tests can drive a
//! virtual clock deterministically instead of wall-clock sleeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    /// Sleeps for `d`, returning early if `cancel` is tripped.
    async fn sleep(&self, d: Duration, cancel: &CancellationToken);
}

/// Production clock: real wall time, real `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep(&self, d: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(d) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// Virtual clock for deterministic scenario tests. `advance` moves the clock
/// forward and wakes any `sleep` calls whose deadline has passed.
pub struct VirtualClock {
    inner: Arc<Mutex<OffsetDateTime>>,
    notify: Arc<Notify>,
}

impl VirtualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Moves the clock forward by `d` and wakes any pending `sleep`s.
    pub async fn advance(&self, d: Duration) {
        let mut t = self.inner.lock().await;
        *t += d;
        drop(t);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> OffsetDateTime {
        // Tests only call `now()` from within an async context that has
        // already synchronized with the clock's lock via `advance`/`sleep`,
        // so a blocking try_lock is sufficient and avoids an async fn here.
        *self.inner.try_lock().expect("virtual clock lock contended")
    }

    async fn sleep(&self, d: Duration, cancel: &CancellationToken) {
        let deadline = self.now() + d;
        loop {
            if self.now() >= deadline {
                return;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}
