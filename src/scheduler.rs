//! Keyed timer tasks
//!
//! Rotation, reconnect and keep-alive timers never touch shared state
//! themselves: the task a caller schedules posts work onto the owner's event
//! channel, where it is processed under the same lock as subscribe and
//! unsubscribe calls.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Owner of keyed, cancellable timer tasks
#[derive(Debug)]
pub struct Scheduler<K> {
    tasks: Mutex<HashMap<K, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl<K> Default for Scheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Scheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run `task` once after `delay`, replacing any task under the same key
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return;
        }

        let token = self.shutdown.child_token();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => task.await,
            }
        });

        trace!(key = ?key, delay_ms = delay.as_millis() as u64, "Scheduled task");
        if let Some(previous) = self.tasks.lock().insert(key, handle) {
            previous.abort();
        }
    }

    /// Run `task` every `period`, first run one period from now
    pub fn schedule_repeating<F, Fut>(&self, key: K, period: Duration, task: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() || period.is_zero() {
            return;
        }

        let token = self.shutdown.child_token();
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => task().await,
                }
            }
        });

        if let Some(previous) = self.tasks.lock().insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel the task under `key`; returns whether one was pending
    pub fn cancel(&self, key: &K) -> bool {
        match self.tasks.lock().remove(key) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.tasks
            .lock()
            .get(key)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel everything and refuse new work
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        debug!(count = tasks.len(), "Scheduler shut down");
        for (_, handle) in tasks {
            handle.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl<K> Drop for Scheduler<K> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for (_, handle) in self.tasks.get_mut().drain() {
            handle.abort();
        }
    }
}
