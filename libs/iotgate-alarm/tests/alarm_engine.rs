//! Alarm engine lifecycle against a live memory store

#![allow(clippy::disallowed_methods)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use errors::{GatewayError, GatewayResult};
use iotgate_alarm::{
    Action, ActionExecutor, ActionHandler, ActionKind, ActionScheduler, ActionType, ActiveAlarm,
    AlarmEngine, AlarmRule, AlarmState, AlarmStateMachine, EngineConfig, SchedulerConfig, TriggerMode, TriggerPhase,
};
use iotgate_model::{DataType, Quality, Value, Variable};
use iotgate_rtdb::{MemoryStore, VariableStore};
use tokio::time::sleep;

// ============================================================================
// Helpers
// ============================================================================

const TEMP: u64 = 100_001;
const FAN: u64 = 100_002;

fn write(store: &MemoryStore, id: u64, value: f64) {
    store
        .write_var(Variable::new(id, "", DataType::Float64).with_value(value))
        .unwrap();
}

fn write_action(id: &str, when: TriggerPhase, value: i64) -> Action {
    Action::new(
        id,
        ActionKind::WriteVar {
            variable_id: FAN,
            value: Value::Int(value),
        },
    )
    .when(when)
}

fn engine_with(rule: AlarmRule) -> (Arc<MemoryStore>, AlarmEngine) {
    let store = Arc::new(MemoryStore::new());
    write(&store, TEMP, 20.0);
    let engine = AlarmEngine::new(store.clone(), SchedulerConfig { workers: 2 });
    engine.add_rule(rule).unwrap();
    engine.start().unwrap();
    (store, engine)
}

/// Let notification and evaluation tasks drain
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

struct Counter(AtomicUsize);

#[async_trait]
impl ActionHandler for Counter {
    fn validate(&self, _action: &Action) -> GatewayResult<()> {
        Ok(())
    }

    async fn handle(&self, _action: &Action, _alarm: &ActiveAlarm) -> GatewayResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Debounce
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_debounce_requires_sustained_condition() {
    let rule = AlarmRule::new("high-temp", TEMP, "value > 50").with_delay(Duration::from_millis(2000));
    let (store, engine) = engine_with(rule);

    // True for only 1000ms
    write(&store, TEMP, 80.0);
    sleep(Duration::from_millis(1000)).await;
    assert_eq!(engine.state("high-temp"), AlarmState::Inactive);
    write(&store, TEMP, 20.0);
    sleep(Duration::from_millis(3000)).await;
    assert_eq!(engine.state("high-temp"), AlarmState::Inactive);
    assert!(engine.active_alarms().is_empty());

    // True for 2500ms
    write(&store, TEMP, 80.0);
    sleep(Duration::from_millis(1900)).await;
    assert_eq!(engine.state("high-temp"), AlarmState::Inactive);
    sleep(Duration::from_millis(600)).await;
    assert_eq!(engine.state("high-temp"), AlarmState::Active);

    let alarms = engine.active_alarms();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].trigger_value, Value::Float(80.0));
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_debounce_fires_once_for_repeated_true_writes() {
    let rule = AlarmRule::new("high-temp", TEMP, "value > 50").with_delay(Duration::from_millis(500));
    let (store, engine) = engine_with(rule);

    for v in [60.0, 70.0, 80.0] {
        write(&store, TEMP, v);
        sleep(Duration::from_millis(100)).await;
    }
    sleep(Duration::from_millis(500)).await;

    let alarms = engine.active_alarms();
    assert_eq!(alarms.len(), 1);
    // The live value at fire time is what gets recorded
    assert_eq!(alarms[0].trigger_value, Value::Float(80.0));
    assert_eq!(engine.state_machine().history("high-temp").len(), 1);
    engine.stop().await;
}

// ============================================================================
// Lifecycle and actions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_trigger_and_recover_run_actions() {
    let rule = AlarmRule::new("high-temp", TEMP, "value > 50")
        .with_message("{name}: {value} C")
        .on_trigger(write_action("fan-on", TriggerPhase::OnTrigger, 1))
        .on_recover(write_action("fan-off", TriggerPhase::OnRecover, 0));
    let (store, engine) = engine_with(rule);

    write(&store, TEMP, 75.5);
    settle().await;
    assert_eq!(engine.state("high-temp"), AlarmState::Active);
    assert_eq!(store.read_var(FAN).unwrap().value, Value::Int(1));
    let first = engine.active_alarms().remove(0);
    assert_eq!(first.message, "high-temp: 75.5 C");

    write(&store, TEMP, 30.0);
    settle().await;
    assert_eq!(engine.state("high-temp"), AlarmState::Cleared);
    assert_eq!(store.read_var(FAN).unwrap().value, Value::Int(0));
    assert!(engine.active_alarms().is_empty());

    let history = engine.alarm_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].alarm_id, first.alarm_id);
    assert_eq!(history[0].state, AlarmState::Cleared);
    assert!(history[0].recover_time.is_some());

    // A new raise after clearing is a new alarm instance
    write(&store, TEMP, 90.0);
    settle().await;
    let second = engine.active_alarms().remove(0);
    assert_ne!(second.alarm_id, first.alarm_id);
    assert_eq!(engine.alarm_history().len(), 1);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_after_recover_action_is_delayed() {
    let rule = AlarmRule::new("high-temp", TEMP, "value > 50").on_recover(
        write_action("fan-off", TriggerPhase::AfterRecover, 0).with_delay(Duration::from_millis(500)),
    );
    let (store, engine) = engine_with(rule);
    write(&store, FAN, 1.0);

    write(&store, TEMP, 80.0);
    settle().await;
    write(&store, TEMP, 20.0);
    settle().await;
    assert_eq!(engine.scheduler().pending_count(), 1);
    sleep(Duration::from_millis(400)).await;
    assert_eq!(store.read_var(FAN).unwrap().value, Value::Float(1.0));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(store.read_var(FAN).unwrap().value, Value::Int(0));
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_acknowledge_keeps_alarm_raised() {
    let (store, engine) = engine_with(AlarmRule::new("high-temp", TEMP, "value > 50"));
    write(&store, TEMP, 80.0);
    settle().await;
    let alarm_id = engine.active_alarms()[0].alarm_id.clone();

    let acked = engine.acknowledge(&alarm_id, "operator-1").unwrap();
    assert_eq!(acked.state, AlarmState::Acknowledged);
    assert_eq!(engine.state("high-temp"), AlarmState::Acknowledged);
    assert_eq!(engine.active_alarms().len(), 1);

    let again = engine.acknowledge(&alarm_id, "operator-2").unwrap_err();
    assert!(matches!(again, GatewayError::InvalidTransition { .. }));
    assert!(matches!(
        engine.acknowledge("no-such-alarm", "x"),
        Err(GatewayError::NotFound { .. })
    ));

    write(&store, TEMP, 20.0);
    settle().await;
    assert_eq!(engine.state("high-temp"), AlarmState::Cleared);
    let history = engine.alarm_history();
    assert_eq!(history[0].ack_user.as_deref(), Some("operator-1"));

    engine.reset_rule("high-temp").unwrap();
    assert_eq!(engine.state("high-temp"), AlarmState::Inactive);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_loop_action_stops_when_acknowledged() {
    let nag = Action::new(
        "nag",
        ActionKind::Popup {
            title: None,
            message: None,
        },
    )
    .looping(0, Duration::from_millis(100), Some(AlarmState::Acknowledged));
    let (store, engine) = engine_with(AlarmRule::new("high-temp", TEMP, "value > 50").on_trigger(nag));
    let counter = Arc::new(Counter(AtomicUsize::new(0)));
    engine.executor().register_handler(ActionType::Popup, counter.clone());

    write(&store, TEMP, 80.0);
    sleep(Duration::from_millis(350)).await;
    assert_eq!(counter.0.load(Ordering::SeqCst), 4);

    let alarm_id = engine.active_alarms()[0].alarm_id.clone();
    engine.acknowledge(&alarm_id, "operator-1").unwrap();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(counter.0.load(Ordering::SeqCst), 4);
    assert_eq!(engine.scheduler().pending_count(), 0);
    engine.stop().await;
}

// ============================================================================
// Filtering and rule management
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_bad_quality_is_ignored() {
    let (store, engine) = engine_with(AlarmRule::new("high-temp", TEMP, "value > 50"));
    let mut bad = Variable::new(TEMP, "", DataType::Float64).with_value(99.0);
    bad.quality = Quality::Bad;
    store.write_var(bad).unwrap();
    settle().await;
    assert_eq!(engine.state("high-temp"), AlarmState::Inactive);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_rules_added_and_removed_while_running() {
    let (store, engine) = engine_with(AlarmRule::new("high-temp", TEMP, "value > 50"));
    write(&store, FAN, 0.0);
    engine
        .add_rule(AlarmRule::new("fan-stuck", FAN, "value >= 1").with_level(iotgate_alarm::AlarmLevel::High))
        .unwrap();
    assert_eq!(engine.rules().len(), 2);

    write(&store, FAN, 1.0);
    settle().await;
    assert_eq!(engine.state("fan-stuck"), AlarmState::Active);

    let removed = engine.remove_rule("fan-stuck").unwrap();
    assert_eq!(removed.variable_id, FAN);
    assert_eq!(engine.state("fan-stuck"), AlarmState::Inactive);
    assert_eq!(engine.alarm_history().len(), 1);
    assert!(matches!(engine.remove_rule("fan-stuck"), Err(GatewayError::NotFound { .. })));

    let probe = Variable::new(TEMP, "", DataType::Float64).with_value(1.0);
    assert!(matches!(
        engine.evaluate("fan-stuck", &probe).await,
        Err(GatewayError::NotFound { .. })
    ));
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_invalid_rules_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    let engine = AlarmEngine::new(store, SchedulerConfig::default());
    let err = engine
        .add_rule(AlarmRule::new("broken", TEMP, "value >"))
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidConfig { ref field, .. } if field == "rules.broken.condition"));
    assert!(engine.rules().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rules_with_invalid_actions_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    let engine = AlarmEngine::new(store, SchedulerConfig::default());

    let bad_write = Action::new(
        "fan-on",
        ActionKind::WriteVar {
            variable_id: 0,
            value: Value::Int(1),
        },
    );
    let err = engine
        .add_rule(AlarmRule::new("hot", TEMP, "value > 50").on_trigger(bad_write))
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidParameter { ref param, .. } if param == "actions.fan-on.variable_id"));

    let silent = Action::new(
        "buzz",
        ActionKind::Sound {
            file: String::new(),
            continuous: false,
            volume: None,
        },
    );
    let err = engine
        .add_rule(AlarmRule::new("hot", TEMP, "value > 50").on_recover(silent))
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidParameter { ref param, .. } if param == "actions.buzz.file"));
    assert!(engine.rules().is_empty());

    // Types without a registered handler cannot be loaded either
    let state_machine = Arc::new(AlarmStateMachine::new());
    let scheduler = Arc::new(ActionScheduler::new(
        Arc::new(ActionExecutor::new()),
        state_machine.clone(),
        SchedulerConfig::default(),
    ));
    let bare = AlarmEngine::with_parts(
        Arc::new(MemoryStore::new()),
        scheduler,
        state_machine,
        EngineConfig::default(),
    );
    let popup = Action::new("pop", ActionKind::Popup { title: None, message: None });
    assert!(bare
        .add_rule(AlarmRule::new("hot", TEMP, "value > 50").on_trigger(popup))
        .is_err());
}

// ============================================================================
// Edge triggers, deadband and shielding
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rising_edge_needs_an_observed_transition() {
    let rule = AlarmRule::new("surge", TEMP, "value > 50").with_trigger(TriggerMode::RisingEdge);
    let (store, engine) = engine_with(rule);

    // The first sample only seeds the detector
    write(&store, TEMP, 80.0);
    settle().await;
    assert_eq!(engine.state("surge"), AlarmState::Inactive);

    write(&store, TEMP, 90.0);
    settle().await;
    assert_eq!(engine.state("surge"), AlarmState::Inactive);

    write(&store, TEMP, 20.0);
    settle().await;
    write(&store, TEMP, 60.0);
    settle().await;
    assert_eq!(engine.state("surge"), AlarmState::Active);

    // Stays up while the condition holds, clears when it drops
    write(&store, TEMP, 70.0);
    settle().await;
    assert_eq!(engine.active_alarms().len(), 1);
    write(&store, TEMP, 10.0);
    settle().await;
    assert_eq!(engine.state("surge"), AlarmState::Cleared);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_falling_edge_raises_on_drop() {
    let rule = AlarmRule::new("pump-stop", TEMP, "value > 50").with_trigger(TriggerMode::FallingEdge);
    let (store, engine) = engine_with(rule);

    write(&store, TEMP, 10.0);
    settle().await;
    write(&store, TEMP, 80.0);
    settle().await;
    assert_eq!(engine.state("pump-stop"), AlarmState::Inactive);

    write(&store, TEMP, 30.0);
    settle().await;
    assert_eq!(engine.state("pump-stop"), AlarmState::Active);
    write(&store, TEMP, 20.0);
    settle().await;
    assert_eq!(engine.state("pump-stop"), AlarmState::Active);

    write(&store, TEMP, 60.0);
    settle().await;
    assert_eq!(engine.state("pump-stop"), AlarmState::Cleared);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deadband_holds_alarm_near_threshold() {
    let rule = AlarmRule::new("hot", TEMP, "value > 80").with_deadband(5.0);
    let (store, engine) = engine_with(rule);

    write(&store, TEMP, 85.0);
    settle().await;
    assert_eq!(engine.state("hot"), AlarmState::Active);

    // Jitter just under the threshold keeps the alarm up
    for v in [79.0, 81.0, 76.0] {
        write(&store, TEMP, v);
        settle().await;
        assert_eq!(engine.state("hot"), AlarmState::Active, "value {}", v);
    }

    write(&store, TEMP, 75.0);
    settle().await;
    assert_eq!(engine.state("hot"), AlarmState::Cleared);

    // Raising does not use the band
    write(&store, TEMP, 79.0);
    settle().await;
    assert_eq!(engine.state("hot"), AlarmState::Cleared);
    write(&store, TEMP, 80.5);
    settle().await;
    assert_eq!(engine.state("hot"), AlarmState::Active);
    assert_eq!(engine.alarm_history().len(), 1);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shielded_rule_never_raises() {
    let rule = AlarmRule::new("high-temp", TEMP, "value > 50").with_delay(Duration::from_millis(500));
    let (store, engine) = engine_with(rule);
    assert!(matches!(engine.shield_rule("nope"), Err(GatewayError::NotFound { .. })));

    // Shielding while a debounce is pending suppresses it too
    write(&store, TEMP, 80.0);
    settle().await;
    engine.shield_rule("high-temp").unwrap();
    assert!(engine.is_shielded("high-temp"));
    sleep(Duration::from_secs(2)).await;
    write(&store, TEMP, 90.0);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(engine.state("high-temp"), AlarmState::Inactive);

    engine.unshield_rule("high-temp").unwrap();
    write(&store, TEMP, 95.0);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(engine.state("high-temp"), AlarmState::Active);

    // A raised alarm still clears while shielded
    engine.shield_rule("high-temp").unwrap();
    write(&store, TEMP, 20.0);
    settle().await;
    assert_eq!(engine.state("high-temp"), AlarmState::Cleared);

    engine.remove_rule("high-temp").unwrap();
    assert!(!engine.is_shielded("high-temp"));
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_debounce() {
    let rule = AlarmRule::new("high-temp", TEMP, "value > 50").with_delay(Duration::from_secs(5));
    let (store, engine) = engine_with(rule);
    write(&store, TEMP, 80.0);
    settle().await;

    engine.stop().await;
    assert!(!engine.is_running());
    assert_eq!(store.stats().total_subscribers, 0);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(engine.state("high-temp"), AlarmState::Inactive);
    assert!(engine.start().is_err());
}
