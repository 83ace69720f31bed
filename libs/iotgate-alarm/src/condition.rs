//! Alarm conditions
//!
//! A condition is an `evalexpr` expression over the single identifier
//! `value`, compiled once when the rule is loaded.

use std::fmt;

use errors::{GatewayError, GatewayResult};
use evalexpr::{ContextWithMutableVariables, HashMapContext, Node};
use iotgate_model::Value;

/// Identifier bound to the monitored variable's value
pub const VALUE_IDENT: &str = "value";

pub struct Condition {
    source: String,
    tree: Node,
}

impl Condition {
    pub fn compile(source: &str) -> GatewayResult<Self> {
        let tree = evalexpr::build_operator_tree(source)
            .map_err(|e| GatewayError::invalid_config("condition", format!("'{}': {}", source, e)))?;

        if let Some(unknown) = tree.iter_variable_identifiers().find(|ident| *ident != VALUE_IDENT) {
            return Err(GatewayError::invalid_config(
                "condition",
                format!("'{}': unknown identifier '{}', only '{}' is bound", source, unknown, VALUE_IDENT),
            ));
        }

        Ok(Self {
            source: source.to_string(),
            tree,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a variable value; a non-boolean result is an error
    pub fn evaluate(&self, value: &Value) -> GatewayResult<bool> {
        let mut context = HashMapContext::new();
        context
            .set_value(VALUE_IDENT.to_string(), to_expr_value(value)?)
            .map_err(|e| GatewayError::Internal(format!("binding '{}': {}", VALUE_IDENT, e)))?;

        self.tree
            .eval_boolean_with_context(&context)
            .map_err(|e| GatewayError::Validation(format!("condition '{}': {}", self.source, e)))
    }

    /// Whether the condition holds at `value`, `value - band` or `value + band`
    ///
    /// Keeps a raised alarm up until a numeric value has left the condition
    /// by at least `band`. Non-numeric values ignore the band.
    pub fn evaluate_within(&self, value: &Value, band: f64) -> GatewayResult<bool> {
        if self.evaluate(value)? {
            return Ok(true);
        }
        let x = match value {
            Value::Int(i) => *i as f64,
            Value::UInt(u) => *u as f64,
            Value::Float(f) => *f,
            _ => return Ok(false),
        };
        if band <= 0.0 {
            return Ok(false);
        }
        Ok(self.evaluate(&Value::Float(x - band))? || self.evaluate(&Value::Float(x + band))?)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Condition").field(&self.source).finish()
    }
}

fn to_expr_value(value: &Value) -> GatewayResult<evalexpr::Value> {
    Ok(match value {
        Value::Bool(b) => evalexpr::Value::Boolean(*b),
        Value::Int(i) => evalexpr::Value::Int(*i),
        Value::UInt(u) => match i64::try_from(*u) {
            Ok(i) => evalexpr::Value::Int(i),
            Err(_) => evalexpr::Value::Float(*u as f64),
        },
        Value::Float(f) => evalexpr::Value::Float(*f),
        Value::String(s) => evalexpr::Value::String(s.clone()),
        Value::Null => evalexpr::Value::Empty,
        Value::Bytes(_) => {
            return Err(GatewayError::Validation(
                "byte values cannot be used in alarm conditions".to_string(),
            ))
        },
    })
}
