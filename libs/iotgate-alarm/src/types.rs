//! Alarm and action type definitions
//!
//! - AlarmRule: monitored variable, condition, level, message, debounce delay
//! - Action: typed side effect with trigger phase, delay and execution mode
//! - ActiveAlarm: one triggered instance of a rule

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use errors::{GatewayError, GatewayResult};
use iotgate_model::Value;
use serde::{Deserialize, Serialize};

// ============================================================================
// Levels and states
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmLevel {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl AlarmLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmLevel::Low => "low",
            AlarmLevel::Medium => "medium",
            AlarmLevel::High => "high",
            AlarmLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlarmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alarm lifecycle state of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    #[default]
    Inactive = 0,
    Active = 1,
    Acknowledged = 2,
    Cleared = 3,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Inactive => "inactive",
            AlarmState::Active => "active",
            AlarmState::Acknowledged => "acknowledged",
            AlarmState::Cleared => "cleared",
        }
    }

    /// Active or acknowledged: the condition is still considered raised
    pub fn is_raised(&self) -> bool {
        matches!(self, AlarmState::Active | AlarmState::Acknowledged)
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Actions
// ============================================================================

/// When an action runs relative to the alarm lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPhase {
    #[default]
    OnTrigger,
    /// Delayed from the trigger instant
    AfterTrigger,
    OnRecover,
    /// Delayed from the recovery instant
    AfterRecover,
}

impl TriggerPhase {
    pub fn is_after(&self) -> bool {
        matches!(self, TriggerPhase::AfterTrigger | TriggerPhase::AfterRecover)
    }

    pub fn is_recover(&self) -> bool {
        matches!(self, TriggerPhase::OnRecover | TriggerPhase::AfterRecover)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Once,
    /// Repeat every `interval` until `count` firings (0 = unbounded) or the
    /// rule reaches `until`
    Loop {
        #[serde(default)]
        count: u32,
        #[serde(with = "humantime_serde")]
        interval: Duration,
        #[serde(default)]
        until: Option<AlarmState>,
    },
}

/// Handler dispatch key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Sound,
    PageJump,
    WriteVar,
    Popup,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Sound => "sound",
            ActionType::PageJump => "page_jump",
            ActionType::WriteVar => "write_var",
            ActionType::Popup => "popup",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed action parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Sound {
        file: String,
        #[serde(default)]
        continuous: bool,
        /// 0.0..=1.0, defaults to full volume
        #[serde(default)]
        volume: Option<f64>,
    },
    PageJump {
        page: String,
        #[serde(default)]
        params: HashMap<String, serde_json::Value>,
    },
    WriteVar {
        variable_id: u64,
        value: Value,
    },
    Popup {
        #[serde(default)]
        title: Option<String>,
        /// Falls back to the alarm message
        #[serde(default)]
        message: Option<String>,
    },
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionKind::Sound { .. } => ActionType::Sound,
            ActionKind::PageJump { .. } => ActionType::PageJump,
            ActionKind::WriteVar { .. } => ActionType::WriteVar,
            ActionKind::Popup { .. } => ActionType::Popup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    #[serde(default)]
    pub when: TriggerPhase,
    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl Action {
    pub fn new(id: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            id: id.into(),
            when: TriggerPhase::default(),
            delay: Duration::ZERO,
            mode: ExecutionMode::Once,
            kind,
        }
    }

    pub fn when(mut self, when: TriggerPhase) -> Self {
        self.when = when;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn looping(mut self, count: u32, interval: Duration, until: Option<AlarmState>) -> Self {
        self.mode = ExecutionMode::Loop {
            count,
            interval,
            until,
        };
        self
    }

    pub fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }

    /// Timing checks done once at load; parameter checks belong to the handler
    pub fn validate(&self) -> GatewayResult<()> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::invalid_config("action.id", "must not be empty"));
        }
        if self.when.is_after() && self.delay.is_zero() {
            return Err(GatewayError::invalid_config(
                format!("actions.{}.delay", self.id),
                "after-trigger and after-recover actions need a non-zero delay",
            ));
        }
        if let ExecutionMode::Loop {
            count,
            interval,
            until,
        } = &self.mode
        {
            if interval.is_zero() {
                return Err(GatewayError::invalid_config(
                    format!("actions.{}.mode.interval", self.id),
                    "loop interval must be non-zero",
                ));
            }
            if *count == 0 && until.is_none() {
                return Err(GatewayError::invalid_config(
                    format!("actions.{}.mode", self.id),
                    "loop needs a count or an until state",
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Rules
// ============================================================================

fn default_enabled() -> bool {
    true
}

/// What the condition has to do for the alarm to raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Raise while the condition holds
    #[default]
    Level,
    /// Raise when the condition goes false -> true; clear when it goes false again
    RisingEdge,
    /// Raise when the condition goes true -> false; clear when it goes true again
    FallingEdge,
}

impl TriggerMode {
    pub fn is_edge(&self) -> bool {
        !matches!(self, TriggerMode::Level)
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::Level => write!(f, "level"),
            TriggerMode::RisingEdge => write!(f, "rising_edge"),
            TriggerMode::FallingEdge => write!(f, "falling_edge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub variable_id: u64,
    /// Boolean expression over `value`, e.g. `value > 80.0`
    pub condition: String,
    #[serde(default)]
    pub level: AlarmLevel,
    /// Template with `{value}`, `{rule}` and `{name}` placeholders
    #[serde(default)]
    pub message: String,
    /// Debounce: the condition must hold this long before the alarm raises
    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub trigger: TriggerMode,
    /// Hysteresis for numeric values: a raised alarm clears only once the
    /// value is this far outside the condition
    #[serde(default)]
    pub deadband: f64,
    #[serde(default)]
    pub trigger_actions: Vec<Action>,
    #[serde(default)]
    pub recover_actions: Vec<Action>,
}

impl AlarmRule {
    pub fn new(id: impl Into<String>, variable_id: u64, condition: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            variable_id,
            condition: condition.into(),
            level: AlarmLevel::default(),
            message: String::new(),
            delay: Duration::ZERO,
            enabled: true,
            trigger: TriggerMode::Level,
            deadband: 0.0,
            trigger_actions: Vec::new(),
            recover_actions: Vec::new(),
        }
    }

    pub fn with_level(mut self, level: AlarmLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerMode) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_deadband(mut self, deadband: f64) -> Self {
        self.deadband = deadband;
        self
    }

    pub fn on_trigger(mut self, action: Action) -> Self {
        self.trigger_actions.push(action);
        self
    }

    pub fn on_recover(mut self, action: Action) -> Self {
        self.recover_actions.push(action);
        self
    }

    /// Expand the message template for a triggering value
    pub fn render_message(&self, value: &Value) -> String {
        if self.message.is_empty() {
            return format!("{} ({})", self.name, value);
        }
        self.message
            .replace("{value}", &value.to_string())
            .replace("{rule}", &self.id)
            .replace("{name}", &self.name)
    }

    /// Structural checks; the condition itself is compiled separately
    pub fn validate(&self) -> GatewayResult<()> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::invalid_config("rule.id", "must not be empty"));
        }
        if self.variable_id == 0 {
            return Err(GatewayError::invalid_config(
                format!("rules.{}.variable_id", self.id),
                "must be non-zero",
            ));
        }
        if !self.deadband.is_finite() || self.deadband < 0.0 {
            return Err(GatewayError::invalid_config(
                format!("rules.{}.deadband", self.id),
                format!("{} must be a finite value >= 0", self.deadband),
            ));
        }
        if self.trigger.is_edge() && (!self.delay.is_zero() || self.deadband > 0.0) {
            return Err(GatewayError::invalid_config(
                format!("rules.{}.trigger", self.id),
                format!("{} rules take no delay or deadband", self.trigger),
            ));
        }
        for action in &self.trigger_actions {
            action.validate()?;
            if action.when.is_recover() {
                return Err(GatewayError::invalid_config(
                    format!("rules.{}.trigger_actions.{}.when", self.id, action.id),
                    "recover phases belong in recover_actions",
                ));
            }
        }
        for action in &self.recover_actions {
            action.validate()?;
            if !action.when.is_recover() {
                return Err(GatewayError::invalid_config(
                    format!("rules.{}.recover_actions.{}.when", self.id, action.id),
                    "trigger phases belong in trigger_actions",
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Active alarm
// ============================================================================

/// One triggered instance of a rule, closed (but kept) once cleared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAlarm {
    pub alarm_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub level: AlarmLevel,
    pub message: String,
    pub state: AlarmState,
    pub trigger_time: DateTime<Utc>,
    pub trigger_value: Value,
    pub ack_user: Option<String>,
    pub ack_time: Option<DateTime<Utc>>,
    pub recover_time: Option<DateTime<Utc>>,
}

impl ActiveAlarm {
    pub fn new(rule: &AlarmRule, value: Value) -> Self {
        Self {
            alarm_id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            level: rule.level,
            message: rule.render_message(&value),
            state: AlarmState::Active,
            trigger_time: Utc::now(),
            trigger_value: value,
            ack_user: None,
            ack_time: None,
            recover_time: None,
        }
    }
}
