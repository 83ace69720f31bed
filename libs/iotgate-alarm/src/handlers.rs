//! Built-in action handlers
//!
//! Only [`WriteVarHandler`] changes anything inside the gateway. Sound,
//! page-jump and popup delivery live outside this process; their handlers
//! validate parameters and log what would be delivered. Replace them through
//! `ActionExecutor::register_handler` to reach a real sink.

use std::sync::Arc;

use async_trait::async_trait;
use errors::{GatewayError, GatewayResult};
use iotgate_model::{is_valid_id, DataType, Value, Variable};
use iotgate_rtdb::VariableStore;
use tracing::info;

use crate::executor::ActionHandler;
use crate::types::{Action, ActionKind, ActiveAlarm};

fn mismatched(action: &Action, expected: &str) -> GatewayError {
    GatewayError::Validation(format!(
        "action {} is a {} action, expected {}",
        action.id,
        action.action_type(),
        expected
    ))
}

fn param(action: &Action, name: &str) -> String {
    format!("actions.{}.{}", action.id, name)
}

// ============================================================================
// Sound
// ============================================================================

pub struct SoundHandler;

#[async_trait]
impl ActionHandler for SoundHandler {
    fn validate(&self, action: &Action) -> GatewayResult<()> {
        let ActionKind::Sound { file, volume, .. } = &action.kind else {
            return Err(mismatched(action, "sound"));
        };
        if file.trim().is_empty() {
            return Err(GatewayError::invalid_parameter(param(action, "file"), "must not be empty"));
        }
        if let Some(v) = volume {
            if !(0.0..=1.0).contains(v) {
                return Err(GatewayError::invalid_parameter(
                    param(action, "volume"),
                    format!("{} is outside [0, 1]", v),
                ));
            }
        }
        Ok(())
    }

    async fn handle(&self, action: &Action, alarm: &ActiveAlarm) -> GatewayResult<()> {
        if let ActionKind::Sound {
            file,
            continuous,
            volume,
        } = &action.kind
        {
            info!(
                "Sound: file={} continuous={} volume={:.2} alarm={}",
                file,
                continuous,
                volume.unwrap_or(1.0),
                alarm.rule_name
            );
        }
        Ok(())
    }
}

// ============================================================================
// Page jump
// ============================================================================

pub struct PageJumpHandler;

#[async_trait]
impl ActionHandler for PageJumpHandler {
    fn validate(&self, action: &Action) -> GatewayResult<()> {
        let ActionKind::PageJump { page, .. } = &action.kind else {
            return Err(mismatched(action, "page_jump"));
        };
        if page.trim().is_empty() {
            return Err(GatewayError::invalid_parameter(param(action, "page"), "must not be empty"));
        }
        Ok(())
    }

    async fn handle(&self, action: &Action, alarm: &ActiveAlarm) -> GatewayResult<()> {
        if let ActionKind::PageJump { page, params } = &action.kind {
            info!("Page jump: page={} params={:?} alarm={}", page, params, alarm.rule_name);
        }
        Ok(())
    }
}

// ============================================================================
// Popup
// ============================================================================

pub const DEFAULT_POPUP_TITLE: &str = "Alarm";

/// All parameters are optional
pub struct PopupHandler;

#[async_trait]
impl ActionHandler for PopupHandler {
    fn validate(&self, action: &Action) -> GatewayResult<()> {
        match action.kind {
            ActionKind::Popup { .. } => Ok(()),
            _ => Err(mismatched(action, "popup")),
        }
    }

    async fn handle(&self, action: &Action, alarm: &ActiveAlarm) -> GatewayResult<()> {
        if let ActionKind::Popup { title, message } = &action.kind {
            info!(
                "Popup: title={} message={} alarm={}",
                title.as_deref().unwrap_or(DEFAULT_POPUP_TITLE),
                message.as_deref().unwrap_or(&alarm.message),
                alarm.rule_name
            );
        }
        Ok(())
    }
}

// ============================================================================
// Variable write
// ============================================================================

/// Writes the configured value into the store
pub struct WriteVarHandler {
    store: Arc<dyn VariableStore>,
}

impl WriteVarHandler {
    pub fn new(store: Arc<dyn VariableStore>) -> Self {
        Self { store }
    }
}

fn inferred_type(value: &Value) -> DataType {
    match value {
        Value::Bool(_) => DataType::Bool,
        Value::Int(_) => DataType::Int64,
        Value::UInt(_) => DataType::Uint64,
        Value::Float(_) => DataType::Float64,
        Value::String(_) | Value::Null => DataType::String,
        Value::Bytes(_) => DataType::Bytes,
    }
}

#[async_trait]
impl ActionHandler for WriteVarHandler {
    fn validate(&self, action: &Action) -> GatewayResult<()> {
        let ActionKind::WriteVar { variable_id, value } = &action.kind else {
            return Err(mismatched(action, "write_var"));
        };
        if !is_valid_id(*variable_id) {
            return Err(GatewayError::invalid_parameter(
                param(action, "variable_id"),
                format!("{} is not a valid variable ID", variable_id),
            ));
        }
        if value.is_null() {
            return Err(GatewayError::invalid_parameter(param(action, "value"), "is required"));
        }
        Ok(())
    }

    async fn handle(&self, action: &Action, alarm: &ActiveAlarm) -> GatewayResult<()> {
        let ActionKind::WriteVar { variable_id, value } = &action.kind else {
            return Err(mismatched(action, "write_var"));
        };

        // Existing variables keep their metadata; unknown ones are created by the upsert
        let variable = match self.store.read_var(*variable_id) {
            Ok(mut existing) => {
                existing.set_value(value.clone());
                existing
            },
            Err(_) => Variable::new(*variable_id, "", inferred_type(value)).with_value(value.clone()),
        };
        self.store.write_var(variable)?;

        info!(
            "Wrote variable {} = {} for rule {}",
            variable_id, value, alarm.rule_id
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::types::AlarmRule;
    use iotgate_model::Quality;
    use iotgate_rtdb::MemoryStore;

    fn alarm() -> ActiveAlarm {
        ActiveAlarm::new(&AlarmRule::new("r1", 100_001, "value"), Value::Bool(true))
    }

    #[test]
    fn test_sound_validation() {
        let sound = |file: &str, volume: Option<f64>| {
            Action::new(
                "s",
                ActionKind::Sound {
                    file: file.into(),
                    continuous: true,
                    volume,
                },
            )
        };
        assert!(SoundHandler.validate(&sound("alarm.wav", Some(0.3))).is_ok());
        assert!(SoundHandler.validate(&sound("", None)).is_err());
        let err = SoundHandler.validate(&sound("alarm.wav", Some(1.5))).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParameter { ref param, .. } if param == "actions.s.volume"));
    }

    #[test]
    fn test_handlers_reject_other_kinds() {
        let popup = Action::new(
            "p",
            ActionKind::Popup {
                title: None,
                message: None,
            },
        );
        assert!(PopupHandler.validate(&popup).is_ok());
        assert!(SoundHandler.validate(&popup).is_err());
        assert!(PageJumpHandler.validate(&popup).is_err());

        let page = Action::new(
            "j",
            ActionKind::PageJump {
                page: " ".into(),
                params: Default::default(),
            },
        );
        assert!(PageJumpHandler.validate(&page).is_err());
    }

    #[tokio::test]
    async fn test_write_var_keeps_metadata() {
        let store = Arc::new(MemoryStore::new());
        let mut setpoint = Variable::new(100_020, "DV-PLC1-SETPOINT", DataType::Float64).with_value(20.0);
        setpoint.unit = "C".into();
        setpoint.quality = Quality::Uncertain;
        store.create_variable(setpoint).unwrap();

        let handler = WriteVarHandler::new(store.clone());
        let action = Action::new(
            "w",
            ActionKind::WriteVar {
                variable_id: 100_020,
                value: Value::Float(5.0),
            },
        );
        handler.validate(&action).unwrap();
        handler.handle(&action, &alarm()).await.unwrap();

        let written = store.read_var(100_020).unwrap();
        assert_eq!(written.value, Value::Float(5.0));
        assert_eq!(written.unit, "C");
        assert_eq!(written.quality, Quality::Good);
        assert_eq!(written.string_id, "DV-PLC1-SETPOINT");
    }

    #[tokio::test]
    async fn test_write_var_creates_unknown_variable() {
        let store = Arc::new(MemoryStore::new());
        let handler = WriteVarHandler::new(store.clone());
        let action = Action::new(
            "w",
            ActionKind::WriteVar {
                variable_id: 100_021,
                value: Value::Bool(true),
            },
        );
        handler.handle(&action, &alarm()).await.unwrap();
        let created = store.read_var(100_021).unwrap();
        assert_eq!(created.data_type, DataType::Bool);
        assert_eq!(created.value, Value::Bool(true));
    }

    #[test]
    fn test_write_var_validation() {
        let handler = WriteVarHandler::new(Arc::new(MemoryStore::new()));
        let bad_id = Action::new(
            "w",
            ActionKind::WriteVar {
                variable_id: 0,
                value: Value::Int(1),
            },
        );
        assert!(handler.validate(&bad_id).is_err());
        let no_value = Action::new(
            "w",
            ActionKind::WriteVar {
                variable_id: 100_001,
                value: Value::Null,
            },
        );
        assert!(handler.validate(&no_value).is_err());
    }
}
