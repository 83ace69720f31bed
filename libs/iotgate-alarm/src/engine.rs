//! Alarm rule engine
//!
//! Subscribes to the store for every monitored variable and drives each
//! rule through the alarm lifecycle:
//!
//! - a condition must hold for the rule's debounce delay before the alarm
//!   raises; the debounce timer re-reads the live value before it fires
//! - a false condition clears a raised alarm at once
//! - every raise creates a new `ActiveAlarm`; cleared alarms move to history
//! - edge rules raise on a transition of the condition instead of its level
//! - a deadband keeps a raised numeric alarm up until the value has left
//!   the condition by that margin
//! - shielded rules never raise
//!
//! Store notifications are handed to a single evaluation task through a
//! bounded queue, so store writers never wait on rule evaluation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use errors::{GatewayError, GatewayResult};
use iotgate_model::{Value, Variable, VariableUpdate};
use iotgate_rtdb::{UpdateCallback, VariableStore};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::condition::Condition;
use crate::executor::ActionExecutor;
use crate::scheduler::{ActionScheduler, SchedulerConfig};
use crate::state_machine::{AlarmStateMachine, StateSource};
use crate::types::{Action, ActiveAlarm, AlarmRule, AlarmState, TriggerMode};

pub const DEFAULT_EVAL_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_ALARM_HISTORY_LIMIT: usize = 1000;
/// Store subscriber name used by the engine
pub const ENGINE_SUBSCRIBER: &str = "alarm-engine";

fn default_eval_queue_capacity() -> usize {
    DEFAULT_EVAL_QUEUE_CAPACITY
}

fn default_history_limit() -> usize {
    DEFAULT_ALARM_HISTORY_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_eval_queue_capacity")]
    pub eval_queue_capacity: usize,
    /// Cleared alarms retained for `alarm_history()`
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            eval_queue_capacity: DEFAULT_EVAL_QUEUE_CAPACITY,
            history_limit: DEFAULT_ALARM_HISTORY_LIMIT,
        }
    }
}

struct CompiledRule {
    rule: AlarmRule,
    condition: Condition,
}

/// Debounce timer in flight for a rule
struct PendingTrigger {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RuleRuntime {
    pending: Option<PendingTrigger>,
    alarm: Option<ActiveAlarm>,
    /// Previous raw condition result, for edge triggers
    last_level: Option<bool>,
}

/// Work left to do after the runtime lock is released
enum Outcome {
    Triggered(Arc<ActiveAlarm>, Vec<Action>),
    Recovered(Arc<ActiveAlarm>, Vec<Action>),
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn VariableStore>,
    scheduler: Arc<ActionScheduler>,
    state_machine: Arc<AlarmStateMachine>,
    rules: RwLock<FxHashMap<String, Arc<CompiledRule>>>,
    runtime: Mutex<FxHashMap<String, RuleRuntime>>,
    shielded: RwLock<FxHashSet<String>>,
    history: Mutex<VecDeque<ActiveAlarm>>,
    callback: Mutex<Option<UpdateCallback>>,
    next_generation: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
    running: AtomicBool,
}

impl EngineInner {
    fn rule(&self, rule_id: &str) -> GatewayResult<Arc<CompiledRule>> {
        self.rules
            .read()
            .get(rule_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("alarm rule {}", rule_id)))
    }

    fn rules_for(&self, variable_id: u64) -> Vec<Arc<CompiledRule>> {
        self.rules
            .read()
            .values()
            .filter(|c| c.rule.variable_id == variable_id)
            .cloned()
            .collect()
    }

    fn watches(&self, variable_id: u64) -> bool {
        self.rules
            .read()
            .values()
            .any(|c| c.rule.variable_id == variable_id)
    }

    /// Raise the rule's alarm; caller holds the runtime lock
    fn activate(&self, compiled: &CompiledRule, runtime: &mut RuleRuntime, value: Value) -> GatewayResult<Outcome> {
        let rule = &compiled.rule;
        self.state_machine
            .transition(&rule.id, AlarmState::Active, "trigger", None)?;
        let alarm = ActiveAlarm::new(rule, value);
        warn!(
            "Alarm raised: rule={} level={} alarm={} message={}",
            rule.id, rule.level, alarm.alarm_id, alarm.message
        );
        runtime.alarm = Some(alarm.clone());
        Ok(Outcome::Triggered(Arc::new(alarm), rule.trigger_actions.clone()))
    }

    /// Clear the rule's alarm and move it to history; caller holds the runtime lock
    fn recover(&self, compiled: &CompiledRule, runtime: &mut RuleRuntime) -> GatewayResult<Outcome> {
        let rule = &compiled.rule;
        self.state_machine
            .transition(&rule.id, AlarmState::Cleared, "recover", None)?;
        let mut alarm = runtime
            .alarm
            .take()
            .ok_or_else(|| GatewayError::Internal(format!("rule {} raised without an alarm", rule.id)))?;
        alarm.state = AlarmState::Cleared;
        alarm.recover_time = Some(Utc::now());
        info!("Alarm cleared: rule={} alarm={}", rule.id, alarm.alarm_id);
        self.archive(alarm.clone());
        Ok(Outcome::Recovered(Arc::new(alarm), rule.recover_actions.clone()))
    }

    fn archive(&self, alarm: ActiveAlarm) {
        let mut history = self.history.lock();
        if history.len() >= self.config.history_limit {
            history.pop_front();
        }
        history.push_back(alarm);
    }

    async fn dispatch(&self, outcome: Outcome) {
        let (alarm, actions) = match outcome {
            Outcome::Triggered(alarm, actions) | Outcome::Recovered(alarm, actions) => (alarm, actions),
        };
        if actions.is_empty() {
            return;
        }
        if let Err(e) = self.scheduler.schedule_batch(&actions, &alarm).await {
            error!("Actions for rule {} failed: {}", alarm.rule_id, e);
        }
    }

    async fn evaluate(self: &Arc<Self>, rule_id: &str, variable: &Variable) -> GatewayResult<()> {
        let compiled = self.rule(rule_id)?;
        if !compiled.rule.enabled {
            return Ok(());
        }
        if !variable.quality.is_good() {
            debug!(
                "Rule {} skips variable {} with quality {:?}",
                rule_id, variable.id, variable.quality
            );
            return Ok(());
        }
        let level = compiled.condition.evaluate(&variable.value)?;
        let shielded = self.shielded.read().contains(rule_id);

        let outcome = {
            let mut runtime = self.runtime.lock();
            let rt = runtime.entry(rule_id.to_string()).or_default();
            let raised = self.state_machine.state(rule_id).is_raised();
            let previous = rt.last_level.replace(level);
            let rule = &compiled.rule;

            // Whether the alarm should be (or stay) up after this sample
            let holds = match rule.trigger {
                TriggerMode::Level if raised && rule.deadband > 0.0 => compiled
                    .condition
                    .evaluate_within(&variable.value, rule.deadband)?,
                TriggerMode::Level => level,
                TriggerMode::RisingEdge if raised => level,
                TriggerMode::RisingEdge => previous == Some(false) && level,
                TriggerMode::FallingEdge if raised => !level,
                TriggerMode::FallingEdge => previous == Some(true) && !level,
            };

            if holds && !raised && shielded {
                debug!("Rule {} is shielded, not raising", rule_id);
                return Ok(());
            }

            match (holds, raised) {
                (true, true) => None,
                (true, false) if compiled.rule.delay.is_zero() => {
                    Some(self.activate(&compiled, rt, variable.value.clone())?)
                },
                (true, false) => {
                    if rt.pending.is_none() {
                        rt.pending = Some(self.arm_debounce(&compiled));
                    }
                    None
                },
                (false, raised) => {
                    if let Some(pending) = rt.pending.take() {
                        debug!("Rule {} condition dropped before debounce elapsed", rule_id);
                        pending.cancel.cancel();
                    }
                    if raised {
                        Some(self.recover(&compiled, rt)?)
                    } else {
                        None
                    }
                },
            }
        };

        if let Some(outcome) = outcome {
            self.dispatch(outcome).await;
        }
        Ok(())
    }

    fn arm_debounce(self: &Arc<Self>, compiled: &Arc<CompiledRule>) -> PendingTrigger {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        let delay = compiled.rule.delay;
        debug!("Rule {} debounce armed for {:?}", compiled.rule.id, delay);

        let inner = Arc::clone(self);
        let compiled = Arc::clone(compiled);
        let token = cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = inner.debounce_elapsed(&compiled, generation).await {
                warn!("Debounce for rule {} failed: {}", compiled.rule.id, e);
            }
        });

        PendingTrigger { generation, cancel }
    }

    async fn debounce_elapsed(&self, compiled: &CompiledRule, generation: u64) -> GatewayResult<()> {
        let rule = &compiled.rule;
        let live = self.store.read_var(rule.variable_id)?;
        let holds = live.quality.is_good() && compiled.condition.evaluate(&live.value)?;

        let outcome = {
            let mut runtime = self.runtime.lock();
            let Some(rt) = runtime.get_mut(&rule.id) else {
                return Ok(());
            };
            match &rt.pending {
                Some(p) if p.generation == generation => {},
                _ => return Ok(()),
            }
            rt.pending = None;

            let shielded = self.shielded.read().contains(&rule.id);
            if holds && !shielded && !self.state_machine.state(&rule.id).is_raised() {
                Some(self.activate(compiled, rt, live.value)?)
            } else {
                None
            }
        };

        if let Some(outcome) = outcome {
            self.dispatch(outcome).await;
        }
        Ok(())
    }

    async fn run_evaluation(self: Arc<Self>, mut updates: mpsc::Receiver<VariableUpdate>) {
        loop {
            let update = tokio::select! {
                _ = self.cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            let variable = variable_from_update(update);
            for compiled in self.rules_for(variable.id) {
                if let Err(e) = self.evaluate(&compiled.rule.id, &variable).await {
                    warn!("Rule {} evaluation failed: {}", compiled.rule.id, e);
                }
            }
        }
        debug!("Alarm evaluation loop exited");
    }

    fn subscribe(&self, variable_id: u64) -> GatewayResult<()> {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            self.store.subscribe(ENGINE_SUBSCRIBER, &[variable_id], callback)?;
        }
        Ok(())
    }
}

fn variable_from_update(update: VariableUpdate) -> Variable {
    Variable {
        id: update.variable_id,
        string_id: update.string_id,
        device_id: update.device_id,
        value: update.value,
        quality: update.quality,
        timestamp: update.timestamp,
        ..Default::default()
    }
}

/// Rule engine plus the scheduler that runs its actions
pub struct AlarmEngine {
    inner: Arc<EngineInner>,
}

impl AlarmEngine {
    /// Engine with the built-in action handlers writing into `store`
    pub fn new(store: Arc<dyn VariableStore>, scheduler_config: SchedulerConfig) -> Self {
        let executor = Arc::new(ActionExecutor::with_default_handlers(Arc::clone(&store)));
        let state_machine = Arc::new(AlarmStateMachine::new());
        let states: Arc<dyn StateSource> = state_machine.clone();
        let scheduler = Arc::new(ActionScheduler::new(executor, states, scheduler_config));
        Self::with_parts(store, scheduler, state_machine, EngineConfig::default())
    }

    /// Engine over an existing scheduler; `state_machine` must be the
    /// scheduler's state source for until-state loops to observe this engine
    pub fn with_parts(
        store: Arc<dyn VariableStore>,
        scheduler: Arc<ActionScheduler>,
        state_machine: Arc<AlarmStateMachine>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                scheduler,
                state_machine,
                rules: RwLock::new(FxHashMap::default()),
                runtime: Mutex::new(FxHashMap::default()),
                shielded: RwLock::new(FxHashSet::default()),
                history: Mutex::new(VecDeque::new()),
                callback: Mutex::new(None),
                next_generation: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn scheduler(&self) -> &Arc<ActionScheduler> {
        &self.inner.scheduler
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        self.inner.scheduler.executor()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Compile and install a rule; replaces a rule with the same ID
    pub fn add_rule(&self, rule: AlarmRule) -> GatewayResult<()> {
        rule.validate()?;
        let condition = Condition::compile(&rule.condition).map_err(|e| match e {
            GatewayError::InvalidConfig { reason, .. } => {
                GatewayError::invalid_config(format!("rules.{}.condition", rule.id), reason)
            },
            other => other,
        })?;
        let executor = self.inner.scheduler.executor();
        for action in rule.trigger_actions.iter().chain(&rule.recover_actions) {
            executor.validate(action)?;
        }

        let rule_id = rule.id.clone();
        let variable_id = rule.variable_id;
        let newly_watched = !self.inner.watches(variable_id);
        let replaced = self.inner.rules.write().insert(
            rule_id.clone(),
            Arc::new(CompiledRule { rule, condition }),
        );
        if let Some(old) = replaced {
            self.reset_runtime(&rule_id);
            if old.rule.variable_id != variable_id {
                self.release_variable(old.rule.variable_id);
            }
        }

        if newly_watched && self.is_running() {
            self.inner.subscribe(variable_id)?;
        }
        info!("Alarm rule {} loaded for variable {}", rule_id, variable_id);
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: &str) -> GatewayResult<AlarmRule> {
        let removed = self
            .inner
            .rules
            .write()
            .remove(rule_id)
            .ok_or_else(|| GatewayError::not_found(format!("alarm rule {}", rule_id)))?;
        self.reset_runtime(rule_id);
        self.inner.shielded.write().remove(rule_id);
        self.release_variable(removed.rule.variable_id);
        info!("Alarm rule {} removed", rule_id);
        Ok(removed.rule.clone())
    }

    /// Drop timers, open alarm and state of a rule
    fn reset_runtime(&self, rule_id: &str) {
        if let Some(rt) = self.inner.runtime.lock().remove(rule_id) {
            if let Some(pending) = rt.pending {
                pending.cancel.cancel();
            }
            if let Some(mut alarm) = rt.alarm {
                alarm.state = AlarmState::Cleared;
                alarm.recover_time = Some(Utc::now());
                self.inner.archive(alarm);
            }
        }
        self.inner.state_machine.remove(rule_id);
    }

    fn release_variable(&self, variable_id: u64) {
        if self.is_running() && !self.inner.watches(variable_id) {
            if let Err(e) = self.inner.store.unsubscribe(ENGINE_SUBSCRIBER, &[variable_id]) {
                warn!("Unsubscribe from variable {} failed: {}", variable_id, e);
            }
        }
    }

    /// Loaded rules, sorted by ID
    pub fn rules(&self) -> Vec<AlarmRule> {
        let mut rules: Vec<AlarmRule> = self
            .inner
            .rules
            .read()
            .values()
            .map(|c| c.rule.clone())
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Subscribe to every monitored variable and start the scheduler
    pub fn start(&self) -> GatewayResult<()> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(GatewayError::Internal("alarm engine was stopped".to_string()));
        }
        if inner.running.swap(true, Ordering::AcqRel) {
            warn!("Alarm engine already running");
            return Ok(());
        }
        inner.scheduler.start()?;

        let (tx, rx) = mpsc::channel(inner.config.eval_queue_capacity.max(1));
        let callback: UpdateCallback = Arc::new(move |update: VariableUpdate| {
            if let Err(e) = tx.try_send(update) {
                warn!("Alarm evaluation queue rejected an update: {}", e);
            }
        });
        *inner.callback.lock() = Some(callback);
        inner.tracker.spawn(Arc::clone(inner).run_evaluation(rx));

        let mut variable_ids: Vec<u64> = inner
            .rules
            .read()
            .values()
            .map(|c| c.rule.variable_id)
            .collect();
        variable_ids.sort_unstable();
        variable_ids.dedup();
        if !variable_ids.is_empty() {
            let callback = inner.callback.lock().clone();
            if let Some(callback) = callback {
                inner.store.subscribe(ENGINE_SUBSCRIBER, &variable_ids, callback)?;
            }
        }

        info!(
            "Alarm engine started: {} rules over {} variables",
            inner.rules.read().len(),
            variable_ids.len()
        );
        Ok(())
    }

    /// Unsubscribe, cancel debounce timers and stop the scheduler
    pub async fn stop(&self) {
        let inner = &self.inner;
        info!("Stopping alarm engine");
        if let Err(e) = inner.store.unsubscribe_all(ENGINE_SUBSCRIBER) {
            warn!("Alarm engine unsubscribe failed: {}", e);
        }
        inner.callback.lock().take();
        inner.cancel.cancel();
        inner.tracker.close();
        inner.tracker.wait().await;
        for rt in inner.runtime.lock().values_mut() {
            rt.pending = None;
        }
        inner.scheduler.stop().await;
        inner.running.store(false, Ordering::Release);
        info!("Alarm engine stopped");
    }

    /// Evaluate one rule against a variable snapshot
    pub async fn evaluate(&self, rule_id: &str, variable: &Variable) -> GatewayResult<()> {
        self.inner.evaluate(rule_id, variable).await
    }

    /// Record operator acknowledgement; the alarm stays raised
    pub fn acknowledge(&self, alarm_id: &str, user: &str) -> GatewayResult<ActiveAlarm> {
        let inner = &self.inner;
        let mut runtime = inner.runtime.lock();
        let (rule_id, rt) = runtime
            .iter_mut()
            .find(|(_, rt)| rt.alarm.as_ref().is_some_and(|a| a.alarm_id == alarm_id))
            .ok_or_else(|| GatewayError::not_found(format!("active alarm {}", alarm_id)))?;

        inner
            .state_machine
            .transition(rule_id, AlarmState::Acknowledged, "acknowledge", Some(user))?;
        let alarm = rt
            .alarm
            .as_mut()
            .ok_or_else(|| GatewayError::not_found(format!("active alarm {}", alarm_id)))?;
        alarm.state = AlarmState::Acknowledged;
        alarm.ack_user = Some(user.to_string());
        alarm.ack_time = Some(Utc::now());
        info!("Alarm {} acknowledged by {}", alarm_id, user);
        Ok(alarm.clone())
    }

    /// Return a cleared rule to inactive
    pub fn reset_rule(&self, rule_id: &str) -> GatewayResult<()> {
        self.inner.rule(rule_id)?;
        self.inner
            .state_machine
            .transition(rule_id, AlarmState::Inactive, "reset", None)?;
        Ok(())
    }

    /// Raised alarms, oldest first
    pub fn active_alarms(&self) -> Vec<ActiveAlarm> {
        let mut alarms: Vec<ActiveAlarm> = self
            .inner
            .runtime
            .lock()
            .values()
            .filter_map(|rt| rt.alarm.clone())
            .collect();
        alarms.sort_by_key(|a| a.trigger_time);
        alarms
    }

    /// Cleared alarms, oldest first
    pub fn alarm_history(&self) -> Vec<ActiveAlarm> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn state(&self, rule_id: &str) -> AlarmState {
        self.inner.state_machine.state(rule_id)
    }

    /// Suppress new alarms for a rule; a raised alarm still clears normally
    pub fn shield_rule(&self, rule_id: &str) -> GatewayResult<()> {
        self.inner.rule(rule_id)?;
        if self.inner.shielded.write().insert(rule_id.to_string()) {
            info!("Alarm rule {} shielded", rule_id);
        }
        Ok(())
    }

    pub fn unshield_rule(&self, rule_id: &str) -> GatewayResult<()> {
        self.inner.rule(rule_id)?;
        if self.inner.shielded.write().remove(rule_id) {
            info!("Alarm rule {} unshielded", rule_id);
        }
        Ok(())
    }

    pub fn is_shielded(&self, rule_id: &str) -> bool {
        self.inner.shielded.read().contains(rule_id)
    }

    pub fn state_machine(&self) -> &Arc<AlarmStateMachine> {
        &self.inner.state_machine
    }
}
