//! Type coercion from JSON values to declared variable types

use iotgate_model::{DataType, Value};
use serde_json::Value as Json;

use crate::error::{Result, TransformError};

fn json_type(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

fn coercion(value: &Json, to: DataType, detail: impl Into<String>) -> TransformError {
    TransformError::Coercion {
        from: json_type(value),
        to,
        detail: detail.into(),
    }
}

/// Inclusive bounds of an integer type, widened to i128
fn int_bounds(target: DataType) -> (i128, i128) {
    match target {
        DataType::Int8 => (i128::from(i8::MIN), i128::from(i8::MAX)),
        DataType::Int16 => (i128::from(i16::MIN), i128::from(i16::MAX)),
        DataType::Int32 => (i128::from(i32::MIN), i128::from(i32::MAX)),
        DataType::Uint8 => (0, i128::from(u8::MAX)),
        DataType::Uint16 => (0, i128::from(u16::MAX)),
        DataType::Uint32 => (0, i128::from(u32::MAX)),
        DataType::Uint64 => (0, i128::from(u64::MAX)),
        _ => (i128::from(i64::MIN), i128::from(i64::MAX)),
    }
}

/// Coerce a located JSON value to the target type
pub fn coerce(value: &Json, target: DataType) -> Result<Value> {
    match target {
        DataType::Float32 | DataType::Float64 => to_float(value, target),
        DataType::String => Ok(Value::String(to_string(value))),
        DataType::Bool => to_bool(value).map(Value::Bool),
        DataType::Bytes => to_bytes(value).map(Value::Bytes),
        _ => to_integer(value, target),
    }
}

fn to_float(value: &Json, target: DataType) -> Result<Value> {
    let f = match value {
        Json::Number(n) => n
            .as_f64()
            .ok_or_else(|| coercion(value, target, format!("unrepresentable number {}", n)))?,
        Json::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| coercion(value, target, format!("'{}' is not a number", s)))?,
        Json::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        },
        _ => return Err(coercion(value, target, "no numeric representation")),
    };

    if target == DataType::Float32 {
        if f.is_finite() && f.abs() > f64::from(f32::MAX) {
            return Err(coercion(value, target, format!("{} overflows float32", f)));
        }
        return Ok(Value::Float(f64::from(f as f32)));
    }
    Ok(Value::Float(f))
}

fn to_integer(value: &Json, target: DataType) -> Result<Value> {
    let wide: i128 = match value {
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                i128::from(i)
            } else if let Some(u) = n.as_u64() {
                i128::from(u)
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if !f.is_finite() {
                    return Err(coercion(value, target, format!("{} is not finite", n)));
                }
                // Truncate toward zero; anything beyond i128 is out of range anyway
                let t = f.trunc();
                if t.abs() >= 1.0e38 {
                    return Err(coercion(value, target, format!("{} out of range", n)));
                }
                t as i128
            }
        },
        Json::String(s) => s
            .trim()
            .parse::<i128>()
            .map_err(|_| coercion(value, target, format!("'{}' is not an integer", s)))?,
        Json::Bool(b) => i128::from(*b),
        _ => return Err(coercion(value, target, "no integer representation")),
    };

    let (min, max) = int_bounds(target);
    if wide < min || wide > max {
        return Err(coercion(
            value,
            target,
            format!("{} outside [{}, {}]", wide, min, max),
        ));
    }

    let out = match target {
        DataType::Uint8 | DataType::Uint16 | DataType::Uint32 | DataType::Uint64 => {
            Value::UInt(wide as u64)
        },
        _ => Value::Int(wide as i64),
    };
    Ok(out)
}

fn to_string(value: &Json) -> String {
    match value {
        Json::Null => String::new(),
        Json::String(s) => s.clone(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        // Compact JSON for nested structures
        other => other.to_string(),
    }
}

fn to_bool(value: &Json) -> Result<bool> {
    match value {
        Json::Bool(b) => Ok(*b),
        Json::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Json::String(s) => match s.trim() {
            t if t.eq_ignore_ascii_case("true") => Ok(true),
            t if t.eq_ignore_ascii_case("false") => Ok(false),
            "1" => Ok(true),
            "0" => Ok(false),
            _ => Err(coercion(
                value,
                DataType::Bool,
                format!("'{}' is not a boolean", s),
            )),
        },
        _ => Err(coercion(value, DataType::Bool, "no boolean representation")),
    }
}

fn to_bytes(value: &Json) -> Result<Vec<u8>> {
    match value {
        Json::String(s) => Ok(s.as_bytes().to_vec()),
        Json::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                item.as_u64()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(|| {
                        coercion(
                            value,
                            DataType::Bytes,
                            format!("element {} is not a byte (0-255)", i),
                        )
                    })
            })
            .collect(),
        _ => Err(coercion(value, DataType::Bytes, "expected string or byte array")),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_float_targets() {
        assert_eq!(coerce(&json!(23.5), DataType::Float64).unwrap(), Value::Float(23.5));
        assert_eq!(coerce(&json!(7), DataType::Float64).unwrap(), Value::Float(7.0));
        assert_eq!(coerce(&json!("1e3"), DataType::Float64).unwrap(), Value::Float(1000.0));
        assert_eq!(coerce(&json!(true), DataType::Float32).unwrap(), Value::Float(1.0));
        assert!(coerce(&json!(1.0e300), DataType::Float32).is_err());

        let err = coerce(&json!("hot"), DataType::Float64).unwrap_err();
        assert!(matches!(
            err,
            TransformError::Coercion { from: "string", to: DataType::Float64, .. }
        ));
    }

    #[test]
    fn test_integer_targets() {
        assert_eq!(coerce(&json!(-3.9), DataType::Int32).unwrap(), Value::Int(-3));
        assert_eq!(coerce(&json!("42"), DataType::Int16).unwrap(), Value::Int(42));
        assert_eq!(coerce(&json!(false), DataType::Uint8).unwrap(), Value::UInt(0));
        assert_eq!(
            coerce(&json!(u64::MAX), DataType::Uint64).unwrap(),
            Value::UInt(u64::MAX)
        );

        assert!(coerce(&json!(128), DataType::Int8).is_err());
        assert!(coerce(&json!(-1), DataType::Uint16).is_err());
        assert!(coerce(&json!(u64::MAX), DataType::Int64).is_err());
        assert!(coerce(&json!("4.5"), DataType::Int64).is_err());
        assert!(coerce(&json!(null), DataType::Int64).is_err());
    }

    #[test]
    fn test_string_target() {
        assert_eq!(coerce(&json!(null), DataType::String).unwrap(), Value::String(String::new()));
        assert_eq!(coerce(&json!(1.5), DataType::String).unwrap(), Value::String("1.5".into()));
        assert_eq!(
            coerce(&json!({"a": [1, 2]}), DataType::String).unwrap(),
            Value::String("{\"a\":[1,2]}".into())
        );
    }

    #[test]
    fn test_bool_target() {
        assert_eq!(coerce(&json!(2), DataType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(coerce(&json!(0.0), DataType::Bool).unwrap(), Value::Bool(false));
        assert_eq!(coerce(&json!("TRUE"), DataType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(coerce(&json!("0"), DataType::Bool).unwrap(), Value::Bool(false));
        assert!(coerce(&json!("yes"), DataType::Bool).is_err());
        assert!(coerce(&json!(null), DataType::Bool).is_err());
    }

    #[test]
    fn test_bytes_target() {
        assert_eq!(coerce(&json!("ab"), DataType::Bytes).unwrap(), Value::Bytes(vec![97, 98]));
        assert_eq!(
            coerce(&json!([0, 255]), DataType::Bytes).unwrap(),
            Value::Bytes(vec![0, 255])
        );
        assert!(coerce(&json!([256]), DataType::Bytes).is_err());
        assert!(coerce(&json!(12), DataType::Bytes).is_err());
    }
}
