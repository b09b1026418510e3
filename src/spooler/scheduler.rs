//! The self-rescheduling task spooler.
//!
//! One refresh cycle cancels every armed timer, reloads the task table,
//! arms one timer per schedulable task and only then schedules the next
//! refresh. A paused or slow process therefore never accumulates a backlog
//! of queued fires; an overdue task simply comes back with a zero delay
//! (catch-up, not skip). Mutual exclusion per task is the persisted
//! `is_running` latch, taken with a single conditional UPDATE.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::spooler::task_store::{SpoolerTask, TaskStore};

/// Reports handler progress into the task's log context.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// A registered unit of recurring work. Receives the task's persisted
/// opaque state and returns the state to persist for the next run.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, state: serde_json::Value, progress: ProgressFn)
        -> Result<serde_json::Value>;
}

pub struct Spooler {
    store: Arc<TaskStore>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    refresh_interval: Duration,
    timers: Mutex<Vec<JoinHandle<()>>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Spooler {
    pub fn new(store: Arc<TaskStore>, refresh_interval: Duration) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            refresh_interval,
            timers: Mutex::new(Vec::new()),
            refresher: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Register the handler for a task name. Must happen before `start`;
    /// a duplicate name is a deployment configuration error.
    pub fn register_handler(&mut self, name: &str, handler: Arc<dyn TaskHandler>) -> Result<()> {
        if self.handlers.contains_key(name) {
            return Err(anyhow!("duplicate task handler registration: {name:?}"));
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Begin the refresh loop. The loop halts the whole spooler on a
    /// configuration error (a schedulable task with no registered handler);
    /// transient store errors are logged and retried on the next cycle.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("spooler already started");
            return;
        }
        info!("⏲️  Spooler starting (refresh every {:?})", self.refresh_interval);

        let spooler = self.clone();
        let handle = tokio::spawn(async move {
            while spooler.running.load(Ordering::SeqCst) {
                match Self::refresh(&spooler, Utc::now().timestamp_millis()) {
                    Ok(armed) => debug!(armed, "spooler refresh cycle complete"),
                    Err(e) => {
                        error!(error = %e, "spooler refresh failed fatally, stopping");
                        spooler.running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                // Next refresh is scheduled only after this one completed.
                tokio::time::sleep(spooler.refresh_interval).await;
            }
        });
        *self.refresher.lock() = Some(handle);
    }

    /// Clear all armed timers and stop refreshing. In-flight handler
    /// executions are not forcibly cancelled; they run to completion on
    /// their own detached tasks.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.refresher.lock().take() {
            handle.abort();
        }
        self.cancel_armed_timers();
        info!("⏲️  Spooler stopped");
    }

    fn cancel_armed_timers(&self) {
        let mut timers = self.timers.lock();
        for handle in timers.drain(..) {
            handle.abort();
        }
    }

    /// One refresh cycle: cancel timers, reload records, arm one timer per
    /// schedulable task. Returns how many timers were armed. A store error
    /// during reload skips the cycle (the records are still on disk and the
    /// next cycle retries); `Err` is reserved for configuration errors.
    fn refresh(spooler: &Arc<Self>, now_ms: i64) -> Result<usize> {
        spooler.cancel_armed_timers();

        let tasks = match spooler.store.list_scheduled() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "task reload failed, retrying next refresh cycle");
                return Ok(0);
            }
        };
        let mut armed = 0usize;

        let mut timers = spooler.timers.lock();
        for task in tasks {
            // A one-shot that already ran is terminal; never re-armed.
            if task.is_one_shot() && task.run_count > 0 {
                continue;
            }

            // Unknown handler for a schedulable task is a deployment error,
            // not something to limp past at fire time.
            if !spooler.handlers.contains_key(&task.name) {
                return Err(anyhow!("no handler registered for task {:?}", task.name));
            }

            let delay = compute_delay(&task, now_ms);
            debug!(task = %task.name, ?delay, "arming task timer");

            let spooler = spooler.clone();
            timers.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Detach execution so cancelling armed timers on the next
                // refresh (or at shutdown) never kills a run in progress.
                tokio::spawn(async move {
                    spooler.execute_task(task.id).await;
                });
            }));
            armed += 1;
        }
        Ok(armed)
    }

    async fn execute_task(self: Arc<Self>, task_id: i64) {
        let task = match self.store.get(task_id) {
            Ok(t) => t,
            Err(e) => {
                warn!(task_id, error = %e, "task vanished before execution");
                return;
            }
        };

        if task.is_one_shot() && task.run_count > 0 {
            error!(task = %task.name, "one-shot task fired again after completing");
            return;
        }

        // The latch is a single conditional update: lose the race, skip the
        // firing.
        match self.store.try_begin_run(task.id) {
            Ok(true) => {}
            Ok(false) => {
                warn!(task = %task.name, "task already running, skipping this firing");
                return;
            }
            Err(e) => {
                warn!(task = %task.name, error = %e, "could not take run latch");
                return;
            }
        }

        // Re-read now that the latch is ours: the state payload may have
        // been edited out-of-band since the refresh cycle loaded it.
        let task = match self.store.get(task_id) {
            Ok(t) => t,
            Err(e) => {
                error!(task_id, error = %e, "task vanished after latching");
                return;
            }
        };

        let handler = match self.handlers.get(&task.name) {
            Some(h) => h.clone(),
            None => {
                // Refresh validates registration, so this cannot happen
                // short of a programming error.
                error!(task = %task.name, "no handler registered at fire time");
                let _ = self.store.fail_run(task.id, "no handler registered");
                return;
            }
        };

        let name = task.name.clone();
        let progress: ProgressFn = {
            let name = name.clone();
            Arc::new(move |msg: &str| info!(task = %name, "{msg}"))
        };

        info!(task = %name, run = task.run_count + 1, "▶️  task starting");
        // The handler runs on its own task so a panic inside it is contained
        // by the join instead of unwinding past the latch cleanup below.
        let state = task.state.clone();
        let run = tokio::spawn(async move { handler.run(state, progress).await });
        let result = match run.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("task handler panicked: {e}")),
        };
        let now_ms = Utc::now().timestamp_millis();

        match result {
            Ok(new_state) => {
                let next_run = task
                    .frequency_seconds
                    .filter(|&f| f > 0)
                    .map(|f| now_ms + f * 1_000);
                if let Err(e) = self.store.complete_run(task.id, &new_state, now_ms, next_run) {
                    error!(task = %name, error = %e, "failed to persist task completion");
                }
                info!(task = %name, "✅ task complete");
            }
            Err(e) => {
                error!(task = %name, id = task.id, error = %e, "task handler failed");
                // Always clear the latch; scheduling fields stay put so the
                // catch-up rule retries the task on the next cycle.
                if let Err(persist_err) = self.store.fail_run(task.id, &e.to_string()) {
                    error!(task = %name, error = %persist_err, "failed to clear run latch");
                }
            }
        }
    }
}

/// Delay until a task should fire, per the scheduling rules:
/// a never-run task fires immediately whatever its frequency; an overdue
/// `next_run` fires immediately (catch-up); a future `next_run` waits it
/// out; otherwise a fresh full period.
pub fn compute_delay(task: &SpoolerTask, now_ms: i64) -> Duration {
    if task.prev_run.is_none() && task.run_count == 0 {
        return Duration::ZERO;
    }
    if let Some(next_run) = task.next_run {
        let remaining = next_run - now_ms;
        return if remaining > 0 {
            Duration::from_millis(remaining as u64)
        } else {
            Duration::ZERO
        };
    }
    match task.frequency_seconds {
        Some(f) if f > 0 => Duration::from_secs(f as u64),
        _ => Duration::ZERO,
    }
}
