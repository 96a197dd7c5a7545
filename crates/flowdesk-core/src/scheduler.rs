//! Delayed continuations for the step loop.
//!
//! After a step completes the orchestrator does not call itself again
//! directly; it hands a continuation to a [`Scheduler`] keyed by workflow id.
//! Pending continuations are visible (`pending`), cancellable (`cancel`) and,
//! with [`ManualScheduler`], driven explicitly by tests without any
//! wall-clock waiting.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;

pub type Continuation = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Scheduler: Send + Sync {
    /// Run `task` after `delay`. Replaces any continuation pending for `key`.
    fn schedule(&self, key: &str, delay: Duration, task: Continuation);

    /// Drop the continuation pending for `key`, if any.
    fn cancel(&self, key: &str) -> bool;

    /// Keys with a continuation still waiting to run.
    fn pending(&self) -> Vec<String>;
}

// ─── Tokio timer scheduler ────────────────────────────────────────────────

struct TimerEntry {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct TimerTable {
    next_generation: u64,
    entries: HashMap<String, TimerEntry>,
}

/// Runs continuations on the tokio runtime after a `tokio::time::sleep`.
#[derive(Clone, Default)]
pub struct TokioScheduler {
    timers: Arc<Mutex<TimerTable>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, key: &str, delay: Duration, task: Continuation) {
        let Ok(mut table) = self.timers.lock() else {
            tracing::error!("[Scheduler] timer table poisoned, dropping continuation for {}", key);
            return;
        };
        table.next_generation += 1;
        let generation = table.next_generation;

        let timers = self.timers.clone();
        let owned_key = key.to_string();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Deregister before running so the task can schedule its successor.
            if let Ok(mut table) = timers.lock() {
                if table
                    .entries
                    .get(&owned_key)
                    .is_some_and(|e| e.generation == generation)
                {
                    table.entries.remove(&owned_key);
                }
            }
            task.await;
        });

        if let Some(previous) = table.entries.insert(
            key.to_string(),
            TimerEntry {
                generation,
                handle: join.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
    }

    fn cancel(&self, key: &str) -> bool {
        let Ok(mut table) = self.timers.lock() else {
            return false;
        };
        match table.entries.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                tracing::debug!("[Scheduler] cancelled continuation for {}", key);
                true
            }
            None => false,
        }
    }

    fn pending(&self) -> Vec<String> {
        self.timers
            .lock()
            .map(|t| t.entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

// ─── Manual scheduler ─────────────────────────────────────────────────────

struct QueuedTask {
    key: String,
    delay: Duration,
    task: Continuation,
}

/// Queues continuations until the owner runs them. Delays are recorded but
/// never waited on.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    queue: Arc<Mutex<VecDeque<QueuedTask>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of the queued continuations, in queue order.
    pub fn queued_delays(&self) -> Vec<Duration> {
        self.queue
            .lock()
            .map(|q| q.iter().map(|t| t.delay).collect())
            .unwrap_or_default()
    }

    /// Run the oldest queued continuation. Returns false when idle.
    pub async fn run_next(&self) -> bool {
        let next = match self.queue.lock() {
            Ok(mut q) => q.pop_front(),
            Err(_) => None,
        };
        match next {
            Some(queued) => {
                queued.task.await;
                true
            }
            None => false,
        }
    }

    /// Run continuations (including ones scheduled while running) until the
    /// queue is empty. Returns how many ran.
    pub async fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next().await {
            ran += 1;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, key: &str, delay: Duration, task: Continuation) {
        if let Ok(mut q) = self.queue.lock() {
            q.retain(|t| t.key != key);
            q.push_back(QueuedTask {
                key: key.to_string(),
                delay,
                task,
            });
        }
    }

    fn cancel(&self, key: &str) -> bool {
        match self.queue.lock() {
            Ok(mut q) => {
                let before = q.len();
                q.retain(|t| t.key != key);
                q.len() != before
            }
            Err(_) => false,
        }
    }

    fn pending(&self) -> Vec<String> {
        self.queue
            .lock()
            .map(|q| q.iter().map(|t| t.key.clone()).collect())
            .unwrap_or_default()
    }
}
