//! Action scheduler
//!
//! Adds timing on top of the executor:
//! - zero-delay on-trigger / on-recover `once` actions run inline
//! - delayed and after-phase `once` actions wait on a cancellable timer task,
//!   which hands the action to the worker pool when the delay elapses
//! - every loop runs in its own tracked task for its whole lifetime
//!
//! The worker pool only ever executes one-shot jobs, so a long-running loop
//! can never occupy a worker. Every spawned task is tracked, so `stop()`
//! returns only after all of them have exited.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use errors::{BatchFailure, GatewayError, GatewayResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::executor::ActionExecutor;
use crate::state_machine::StateSource;
use crate::types::{Action, ActiveAlarm, AlarmState, ExecutionMode};

pub const DEFAULT_SCHEDULER_WORKERS: usize = 4;

fn default_workers() -> usize {
    DEFAULT_SCHEDULER_WORKERS
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Worker tasks executing actions whose timer has elapsed
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_SCHEDULER_WORKERS,
        }
    }
}

/// A due one-shot action handed to the worker pool
struct OneShotJob {
    instance: u64,
    action: Action,
    alarm: Arc<ActiveAlarm>,
    cancel: CancellationToken,
}

struct PendingEntry {
    instance: u64,
    cancel: CancellationToken,
}

struct SchedulerInner {
    executor: Arc<ActionExecutor>,
    states: Arc<dyn StateSource>,
    workers: usize,
    queue_tx: mpsc::Sender<OneShotJob>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<OneShotJob>>>,
    /// action ID -> live scheduling instances
    pending: Mutex<FxHashMap<String, Vec<PendingEntry>>>,
    next_instance: AtomicU64,
    root: CancellationToken,
    tracker: TaskTracker,
    running: AtomicBool,
}

impl SchedulerInner {
    fn register(&self, action_id: &str) -> (u64, CancellationToken) {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let cancel = self.root.child_token();
        self.pending
            .lock()
            .entry(action_id.to_string())
            .or_default()
            .push(PendingEntry {
                instance,
                cancel: cancel.clone(),
            });
        (instance, cancel)
    }

    fn finish(&self, action_id: &str, instance: u64) {
        let mut pending = self.pending.lock();
        if let Some(entries) = pending.get_mut(action_id) {
            entries.retain(|e| e.instance != instance);
            if entries.is_empty() {
                pending.remove(action_id);
            }
        }
    }

    async fn run_loop(
        &self,
        action: &Action,
        alarm: &ActiveAlarm,
        cancel: &CancellationToken,
        count: u32,
        interval: Duration,
        until: Option<AlarmState>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fired: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Loop {} cancelled after {} firings", action.id, fired);
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Some(stop_state) = until {
                if self.states.state(&alarm.rule_id) == stop_state {
                    debug!("Loop {} stopped: rule {} is {}", action.id, alarm.rule_id, stop_state);
                    return;
                }
            }

            if let Err(e) = self.executor.execute(action, alarm).await {
                warn!("Loop action {} failed: {}", action.id, e);
            }
            fired += 1;

            if count > 0 && fired >= count {
                debug!("Loop {} finished after {} firings", action.id, fired);
                return;
            }
        }
    }

    async fn worker(self: Arc<Self>, worker_id: usize) {
        debug!("Scheduler worker {} started", worker_id);
        loop {
            let job = tokio::select! {
                _ = self.root.cancelled() => break,
                job = async { self.queue_rx.lock().await.recv().await } => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            if job.cancel.is_cancelled() {
                debug!("Action {} cancelled while queued", job.action.id);
            } else if let Err(e) = self.executor.execute(&job.action, &job.alarm).await {
                warn!("Scheduled action {} failed: {}", job.action.id, e);
            }
            self.finish(&job.action.id, job.instance);
        }
        debug!("Scheduler worker {} exited", worker_id);
    }

    /// Sleep out the delay, then queue the action for a worker
    async fn run_timer(self: Arc<Self>, job: OneShotJob) {
        let (action_id, instance) = (job.action.id.clone(), job.instance);
        let delay = job.action.delay;
        let cancel = job.cancel.clone();

        let elapsed = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        };
        if !elapsed {
            debug!("Timer for action {} cancelled", action_id);
            self.finish(&action_id, instance);
            return;
        }

        // Waiting for queue space happens here, never on the caller of schedule()
        let queued = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.queue_tx.send(job) => sent.is_ok(),
        };
        if !queued {
            self.finish(&action_id, instance);
        }
    }

    /// Own task for the whole life of a loop: delay, then periodic firings
    async fn run_loop_task(
        self: Arc<Self>,
        action: Action,
        alarm: Arc<ActiveAlarm>,
        instance: u64,
        cancel: CancellationToken,
    ) {
        let ExecutionMode::Loop {
            count,
            interval,
            until,
        } = action.mode
        else {
            self.finish(&action.id, instance);
            return;
        };

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(action.delay) => true,
        };
        if started {
            self.run_loop(&action, &alarm, &cancel, count, interval, until)
                .await;
        } else {
            debug!("Loop {} cancelled before its first firing", action.id);
        }
        self.finish(&action.id, instance);
    }
}

/// Runs actions with delay and loop timing
pub struct ActionScheduler {
    inner: Arc<SchedulerInner>,
}

impl ActionScheduler {
    pub fn new(executor: Arc<ActionExecutor>, states: Arc<dyn StateSource>, config: SchedulerConfig) -> Self {
        let workers = config.workers.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(workers * 2);
        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                states,
                workers,
                queue_tx,
                queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
                pending: Mutex::new(FxHashMap::default()),
                next_instance: AtomicU64::new(1),
                root: CancellationToken::new(),
                tracker: TaskTracker::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.inner.executor
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn the worker pool for due one-shot actions
    pub fn start(&self) -> GatewayResult<()> {
        let inner = &self.inner;
        if inner.root.is_cancelled() {
            return Err(GatewayError::Internal("action scheduler was stopped".to_string()));
        }
        if inner.running.swap(true, Ordering::AcqRel) {
            warn!("Action scheduler already running");
            return Ok(());
        }
        for worker_id in 0..inner.workers {
            inner.tracker.spawn(Arc::clone(inner).worker(worker_id));
        }
        info!("Action scheduler started with {} workers", inner.workers);
        Ok(())
    }

    /// Schedule one action for an alarm
    ///
    /// Inline actions return their execution result; everything else returns
    /// as soon as its task is spawned, so this never waits on the pool.
    pub async fn schedule(&self, action: &Action, alarm: &Arc<ActiveAlarm>) -> GatewayResult<()> {
        action.validate()?;
        let inner = &self.inner;
        if !self.is_running() {
            return Err(GatewayError::Internal("action scheduler is not running".to_string()));
        }

        let immediate = action.delay.is_zero() && !action.when.is_after();
        match action.mode {
            ExecutionMode::Once if immediate => {
                debug!("Executing action {} inline", action.id);
                inner.executor.execute(action, alarm).await
            },
            ExecutionMode::Once => {
                let (instance, cancel) = inner.register(&action.id);
                debug!("Action {} armed with delay {:?}", action.id, action.delay);
                let job = OneShotJob {
                    instance,
                    action: action.clone(),
                    alarm: Arc::clone(alarm),
                    cancel,
                };
                inner.tracker.spawn(Arc::clone(inner).run_timer(job));
                Ok(())
            },
            ExecutionMode::Loop { .. } => {
                let (instance, cancel) = inner.register(&action.id);
                debug!("Loop action {} started", action.id);
                inner.tracker.spawn(Arc::clone(inner).run_loop_task(
                    action.clone(),
                    Arc::clone(alarm),
                    instance,
                    cancel,
                ));
                Ok(())
            },
        }
    }

    /// Schedule every action; failures are collected, not fatal
    pub async fn schedule_batch(&self, actions: &[Action], alarm: &Arc<ActiveAlarm>) -> GatewayResult<()> {
        let mut failures = Vec::new();
        for action in actions {
            if let Err(e) = self.schedule(action, alarm).await {
                failures.push(BatchFailure {
                    id: action.id.clone(),
                    cause: e.to_string(),
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Batch {
                total: actions.len(),
                failures,
            })
        }
    }

    /// Cancel every pending instance of an action; returns how many were live
    pub fn cancel_action(&self, action_id: &str) -> usize {
        let entries = self.inner.pending.lock().remove(action_id).unwrap_or_default();
        for entry in &entries {
            entry.cancel.cancel();
        }
        if !entries.is_empty() {
            info!("Cancelled action {} ({} pending)", action_id, entries.len());
        }
        entries.len()
    }

    pub fn cancel_all_actions(&self) -> usize {
        let drained: Vec<PendingEntry> = self
            .inner
            .pending
            .lock()
            .drain()
            .flat_map(|(_, entries)| entries)
            .collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            info!("Cancelled {} pending actions", drained.len());
        }
        drained.len()
    }

    /// Armed timers, queued one-shot jobs and running loops
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().values().map(Vec::len).sum()
    }

    /// Cancel all outstanding work and wait for every scheduler task to exit
    pub async fn stop(&self) {
        let inner = &self.inner;
        info!("Stopping action scheduler");
        inner.root.cancel();
        self.cancel_all_actions();
        inner.tracker.close();
        inner.tracker.wait().await;
        inner.running.store(false, Ordering::Release);
        info!("Action scheduler stopped");
    }
}
