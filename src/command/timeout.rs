//! Deadline queue for pending correlations
//!
//! One supervisor task serves every pending request. Deadlines live in a
//! single ordered set; the task sleeps until the earliest one and is woken
//! early whenever a new deadline is scheduled.

use crate::error::{FleetError, Result};
use fleet_shared::CorrelationKey;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

/// Longest wait a deadline may represent (about 30 years)
pub const MAX_TIMEOUT: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Runs at most once, on the supervisor task, while the queue lock is held.
pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    on_fire: TimeoutCallback,
}

#[derive(Default)]
struct DeadlineQueue {
    order: BTreeSet<(Instant, CorrelationKey)>,
    entries: HashMap<CorrelationKey, Entry>,
}

impl DeadlineQueue {
    /// Pop and fire every entry due at `now`; returns the next deadline
    fn fire_expired(&mut self, now: Instant) -> (usize, Option<Instant>) {
        let mut fired = 0;
        while let Some(&(deadline, key)) = self.order.first() {
            if deadline > now {
                return (fired, Some(deadline));
            }
            self.order.pop_first();
            if let Some(entry) = self.entries.remove(&key) {
                (entry.on_fire)();
                fired += 1;
            }
        }
        (fired, None)
    }
}

/// Monitors correlation deadlines and fires their timeout callbacks
pub struct TimeoutSupervisor {
    queue: Arc<Mutex<DeadlineQueue>>,
    wake: Arc<Notify>,
    granularity: Duration,
    origin: Instant,
    worker: JoinHandle<()>,
}

impl TimeoutSupervisor {
    /// Start the supervisor task. Deadlines are rounded up to `granularity`.
    pub fn new(granularity: Duration) -> Self {
        let queue = Arc::new(Mutex::new(DeadlineQueue::default()));
        let wake = Arc::new(Notify::new());

        let worker = tokio::spawn(run(queue.clone(), wake.clone()));

        Self {
            queue,
            wake,
            granularity,
            origin: Instant::now(),
            worker,
        }
    }

    /// Deadline for a timeout starting now, rounded up to the next tick
    ///
    /// Timeouts longer than `MAX_TIMEOUT` are clamped to it.
    pub fn deadline_after(&self, timeout: Duration) -> Instant {
        let now = Instant::now();
        let raw = now
            .checked_add(timeout.min(MAX_TIMEOUT))
            .unwrap_or_else(|| now + Duration::from_secs(86_400));
        let tick = self.granularity.as_nanos();
        if tick == 0 {
            return raw;
        }

        let offset = raw.duration_since(self.origin).as_nanos();
        let rounded = offset.div_ceil(tick) * tick;
        match u64::try_from(rounded) {
            Ok(nanos) => self.origin.checked_add(Duration::from_nanos(nanos)).unwrap_or(raw),
            Err(_) => raw,
        }
    }

    /// Schedule `on_fire` for `key` after `timeout`; returns the deadline
    pub fn schedule(
        &self,
        key: CorrelationKey,
        timeout: Duration,
        on_fire: TimeoutCallback,
    ) -> Result<Instant> {
        let deadline = self.deadline_after(timeout);
        self.schedule_at(key, deadline, on_fire)?;
        Ok(deadline)
    }

    /// Schedule `on_fire` for `key` at a precomputed deadline
    pub fn schedule_at(
        &self,
        key: CorrelationKey,
        deadline: Instant,
        on_fire: TimeoutCallback,
    ) -> Result<()> {
        let mut queue = self.lock();
        if queue.entries.contains_key(&key) {
            return Err(FleetError::Invariant(format!(
                "deadline already scheduled for request {}",
                key
            )));
        }
        queue.order.insert((deadline, key));
        queue.entries.insert(key, Entry { deadline, on_fire });
        drop(queue);

        self.wake.notify_one();
        Ok(())
    }

    /// Remove the deadline for `key`.
    ///
    /// Returns `false` when the entry already fired or never existed. Once this
    /// returns, the callback for `key` will not run.
    pub fn cancel(&self, key: CorrelationKey) -> bool {
        let mut queue = self.lock();
        match queue.entries.remove(&key) {
            Some(entry) => {
                queue.order.remove(&(entry.deadline, key));
                true
            }
            None => false,
        }
    }

    /// Earliest scheduled deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().order.first().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, DeadlineQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run(queue: Arc<Mutex<DeadlineQueue>>, wake: Arc<Notify>) {
    loop {
        let (fired, next) = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fire_expired(Instant::now());

        if fired > 0 {
            debug!("[TIMEOUT] Fired {} deadline(s)", fired);
        }

        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
}
