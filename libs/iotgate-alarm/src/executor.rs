//! Action executor
//!
//! Dispatches actions to the handler registered for their type. Handlers are
//! validated before they run, and a panicking handler is reported as
//! `PanicRecovered` instead of taking the caller down.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use errors::{panic_message, BatchFailure, GatewayError, GatewayResult};
use futures::future::join_all;
use futures::FutureExt;
use iotgate_rtdb::VariableStore;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info};

use crate::handlers::{PageJumpHandler, PopupHandler, SoundHandler, WriteVarHandler};
use crate::types::{Action, ActionType, ActiveAlarm};

/// Side effect for one action type
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Check the action's parameters without side effects
    fn validate(&self, action: &Action) -> GatewayResult<()>;

    async fn handle(&self, action: &Action, alarm: &ActiveAlarm) -> GatewayResult<()>;
}

#[derive(Default)]
pub struct ActionExecutor {
    handlers: RwLock<FxHashMap<ActionType, Arc<dyn ActionHandler>>>,
}

impl ActionExecutor {
    /// Executor without handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor with the built-in handlers; variable writes go to `store`
    pub fn with_default_handlers(store: Arc<dyn VariableStore>) -> Self {
        let executor = Self::new();
        executor.register_handler(ActionType::Sound, Arc::new(SoundHandler));
        executor.register_handler(ActionType::PageJump, Arc::new(PageJumpHandler));
        executor.register_handler(ActionType::WriteVar, Arc::new(WriteVarHandler::new(store)));
        executor.register_handler(ActionType::Popup, Arc::new(PopupHandler));
        executor
    }

    /// Install or replace the handler for a type
    pub fn register_handler(&self, action_type: ActionType, handler: Arc<dyn ActionHandler>) {
        self.handlers.write().insert(action_type, handler);
    }

    pub fn has_handler(&self, action_type: ActionType) -> bool {
        self.handlers.read().contains_key(&action_type)
    }

    fn handler(&self, action_type: ActionType) -> GatewayResult<Arc<dyn ActionHandler>> {
        self.handlers
            .read()
            .get(&action_type)
            .cloned()
            .ok_or_else(|| GatewayError::Validation(format!("no handler for action type {}", action_type)))
    }

    /// Check an action against the handler registered for its type
    pub fn validate(&self, action: &Action) -> GatewayResult<()> {
        self.handler(action.action_type())?.validate(action)
    }

    /// Validate and run one action
    pub async fn execute(&self, action: &Action, alarm: &ActiveAlarm) -> GatewayResult<()> {
        let handler = self.handler(action.action_type())?;
        handler.validate(action)?;

        debug!(
            "Executing action {} ({}) for rule {}",
            action.id,
            action.action_type(),
            alarm.rule_id
        );
        match AssertUnwindSafe(handler.handle(action, alarm))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Action {} panicked: {}", action.id, message);
                Err(GatewayError::PanicRecovered(format!(
                    "action {}: {}",
                    action.id, message
                )))
            },
        }
    }

    /// Run every action concurrently and report all failures together
    pub async fn execute_batch(&self, actions: &[Action], alarm: &ActiveAlarm) -> GatewayResult<()> {
        if actions.is_empty() {
            return Ok(());
        }

        let outcomes = join_all(
            actions
                .iter()
                .map(|action| async move { (action, self.execute(action, alarm).await) }),
        )
        .await;

        let failures: Vec<BatchFailure> = outcomes
            .into_iter()
            .filter_map(|(action, outcome)| {
                outcome.err().map(|e| BatchFailure {
                    id: action.id.clone(),
                    cause: e.to_string(),
                })
            })
            .collect();

        if failures.is_empty() {
            info!("Executed {} actions for rule {}", actions.len(), alarm.rule_id);
            Ok(())
        } else {
            Err(GatewayError::Batch {
                total: actions.len(),
                failures,
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, AlarmRule};
    use iotgate_model::Value;
    use iotgate_rtdb::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Panicking;

    #[async_trait]
    impl ActionHandler for Panicking {
        fn validate(&self, _action: &Action) -> GatewayResult<()> {
            Ok(())
        }

        async fn handle(&self, _action: &Action, _alarm: &ActiveAlarm) -> GatewayResult<()> {
            panic!("speaker on fire");
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl ActionHandler for Counting {
        fn validate(&self, _action: &Action) -> GatewayResult<()> {
            Ok(())
        }

        async fn handle(&self, _action: &Action, _alarm: &ActiveAlarm) -> GatewayResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn alarm() -> ActiveAlarm {
        ActiveAlarm::new(&AlarmRule::new("r1", 100_001, "value > 1"), Value::Int(2))
    }

    fn write(id: &str, variable_id: u64, value: i64) -> Action {
        Action::new(
            id,
            ActionKind::WriteVar {
                variable_id,
                value: Value::Int(value),
            },
        )
    }

    #[tokio::test]
    async fn test_batch_reports_only_failing_actions() {
        let store = Arc::new(MemoryStore::new());
        let executor = ActionExecutor::with_default_handlers(store.clone());

        let actions = vec![write("ok-1", 100_010, 1), write("bad", 0, 2), write("ok-2", 100_011, 3)];
        let err = executor.execute_batch(&actions, &alarm()).await.unwrap_err();

        assert_eq!(err.failed_ids(), vec!["bad"]);
        assert!(matches!(err, GatewayError::Batch { total: 3, .. }));
        assert_eq!(store.read_var(100_010).unwrap().value, Value::Int(1));
        assert_eq!(store.read_var(100_011).unwrap().value, Value::Int(3));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_recovered() {
        let executor = ActionExecutor::new();
        executor.register_handler(ActionType::Sound, Arc::new(Panicking));
        let action = Action::new(
            "siren",
            ActionKind::Sound {
                file: "a.wav".into(),
                continuous: false,
                volume: None,
            },
        );

        let err = executor.execute(&action, &alarm()).await.unwrap_err();
        assert!(matches!(err, GatewayError::PanicRecovered(ref m) if m.contains("speaker on fire")));
    }

    #[tokio::test]
    async fn test_missing_handler_and_empty_batch() {
        let executor = ActionExecutor::new();
        assert!(executor.execute_batch(&[], &alarm()).await.is_ok());
        let err = executor.execute(&write("w", 100_010, 1), &alarm()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_registered_handler_replaces_default() {
        let store = Arc::new(MemoryStore::new());
        let executor = ActionExecutor::with_default_handlers(store.clone());
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        executor.register_handler(ActionType::WriteVar, counting.clone());

        executor.execute(&write("w", 100_010, 1), &alarm()).await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert!(store.read_var(100_010).is_err());
    }
}
