//! iotgate Data Transform Engine
//!
//! Extracts a scalar from a raw JSON payload with a restricted JSONPath and
//! coerces it to a variable's declared type.
//!
//! # Example
//!
//! ```
//! use iotgate_model::{DataType, Value};
//! use iotgate_transform::{transform, JsonPath};
//!
//! let path = JsonPath::parse("$.sensors[0].temp").unwrap();
//! let raw = br#"{"sensors":[{"temp":"21.5"}]}"#;
//! assert_eq!(transform(raw, &path, DataType::Float64).unwrap(), Value::Float(21.5));
//! ```

pub mod coerce;
pub mod error;
pub mod path;

use std::sync::Arc;

use iotgate_model::{DataType, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

pub use coerce::coerce;
pub use error::{Result, TransformError};
pub use path::JsonPath;

/// Parse `raw`, walk `path` and coerce the located value to `target`
pub fn transform(raw: &[u8], path: &JsonPath, target: DataType) -> Result<Value> {
    let document: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| TransformError::InvalidJson(e.to_string()))?;
    let located = path.resolve(&document)?;
    coerce(located, target)
}

/// Transformer that accepts path strings and caches their compiled form
#[derive(Default)]
pub struct Transformer {
    paths: RwLock<FxHashMap<String, Arc<JsonPath>>>,
}

impl Transformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(&self, raw: &[u8], path: &str, target: DataType) -> Result<Value> {
        let compiled = self.compile(path)?;
        transform(raw, &compiled, target)
    }

    fn compile(&self, path: &str) -> Result<Arc<JsonPath>> {
        if let Some(compiled) = self.paths.read().get(path) {
            return Ok(Arc::clone(compiled));
        }
        let compiled = Arc::new(JsonPath::parse(path)?);
        self.paths
            .write()
            .insert(path.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Number of distinct compiled paths
    pub fn cached_paths(&self) -> usize {
        self.paths.read().len()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use errors::GatewayError;

    #[test]
    fn test_canonical_temperature() {
        let path = JsonPath::parse("$.temperature").unwrap();
        let value = transform(br#"{"temperature":23.5}"#, &path, DataType::Float64).unwrap();
        assert_eq!(value, Value::Float(23.5));
    }

    #[test]
    fn test_first_array_element() {
        let path = JsonPath::parse("sensors[0]").unwrap();
        let value = transform(br#"{"sensors":[10,20]}"#, &path, DataType::Int32).unwrap();
        assert_eq!(value, Value::Int(10));
    }

    #[test]
    fn test_missing_field_named() {
        let path = JsonPath::parse("$.data.humidity").unwrap();
        let err = transform(br#"{"data":{"temp":1}}"#, &path, DataType::Float64).unwrap_err();
        assert_eq!(err.segment(), Some("humidity"));
        assert!(err.to_string().contains("humidity"));
    }

    #[test]
    fn test_root_and_invalid_json() {
        let value = transform(b"17", &JsonPath::root(), DataType::Uint8).unwrap();
        assert_eq!(value, Value::UInt(17));

        let err = transform(b"{not json", &JsonPath::root(), DataType::String).unwrap_err();
        assert!(matches!(err, TransformError::InvalidJson(_)));

        let gateway: GatewayError = err.into();
        assert!(matches!(gateway, GatewayError::Protocol { .. }));
    }

    #[test]
    fn test_transformer_caches_paths() {
        let t = Transformer::new();
        let raw = br#"{"a":{"b":true}}"#;
        assert_eq!(t.transform(raw, "$.a.b", DataType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(t.transform(raw, "$.a.b", DataType::String).unwrap(), Value::String("true".into()));
        assert_eq!(t.cached_paths(), 1);
        assert!(t.transform(raw, "$.a[", DataType::Bool).is_err());
        assert_eq!(t.cached_paths(), 1);
    }
}
