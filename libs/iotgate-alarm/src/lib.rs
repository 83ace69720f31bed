//! iotgate Alarm Engine
//!
//! Rule-based alarms over live store variables, with timed side effects.
//!
//! # Architecture
//!
//! ```text
//! Store ──notify──▶ AlarmEngine ──schedule──▶ ActionScheduler ──execute──▶ ActionExecutor
//!   ▲              (debounce, state machine)  (timers, loops)              (handlers)
//!   │                                                                          │
//!   └───────────────────────────── write_var action ──────────────────────────┘
//! ```

pub mod condition;
pub mod engine;
pub mod executor;
pub mod handlers;
pub mod scheduler;
pub mod state_machine;
pub mod types;

pub use condition::Condition;
pub use engine::{AlarmEngine, EngineConfig};
pub use executor::{ActionExecutor, ActionHandler};
pub use handlers::{PageJumpHandler, PopupHandler, SoundHandler, WriteVarHandler};
pub use scheduler::{ActionScheduler, SchedulerConfig, DEFAULT_SCHEDULER_WORKERS};
pub use state_machine::{is_valid_transition, AlarmStateMachine, StateSource, StateTransition};
pub use types::{
    Action, ActionKind, ActionType, ActiveAlarm, AlarmLevel, AlarmRule, AlarmState,
    ExecutionMode, TriggerMode, TriggerPhase,
};
