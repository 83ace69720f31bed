//! Core domain types for the gateway
//!
//! Variables are the unit of real-time data; devices carry the connection
//! parameters and the protocol tag bag that adapters parse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use errors::GatewayError;

// ============================================================================
// Data Types
// ============================================================================

/// Declared scalar type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    #[default]
    Float64,
    String,
    Bytes,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Uint8 => "uint8",
            DataType::Uint16 => "uint16",
            DataType::Uint32 => "uint32",
            DataType::Uint64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
            DataType::Bytes => "bytes",
        }
    }

    /// Integer and floating point types
    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::Uint8
                | DataType::Uint16
                | DataType::Uint32
                | DataType::Uint64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(DataType::Bool),
            "int8" => Ok(DataType::Int8),
            "int16" => Ok(DataType::Int16),
            "int32" => Ok(DataType::Int32),
            "int64" | "int" => Ok(DataType::Int64),
            "uint8" => Ok(DataType::Uint8),
            "uint16" => Ok(DataType::Uint16),
            "uint32" => Ok(DataType::Uint32),
            "uint64" | "uint" => Ok(DataType::Uint64),
            "float32" => Ok(DataType::Float32),
            "float64" | "float" | "double" => Ok(DataType::Float64),
            "string" => Ok(DataType::String),
            "bytes" => Ok(DataType::Bytes),
            other => Err(GatewayError::invalid_parameter(
                "data_type",
                format!("unknown data type '{}'", other),
            )),
        }
    }
}

// ============================================================================
// Quality Codes
// ============================================================================

/// Confidence/availability tag attached to every variable value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Good = 0,
    Bad = 1,
    Uncertain = 2,
    Disconnected = 3,
    Timeout = 4,
    Overflow = 5,
}

impl Quality {
    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }

    /// Numeric quality code
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Quality::Good),
            1 => Some(Quality::Bad),
            2 => Some(Quality::Uncertain),
            3 => Some(Quality::Disconnected),
            4 => Some(Quality::Timeout),
            5 => Some(Quality::Overflow),
            _ => None,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quality::Good => "good",
            Quality::Bad => "bad",
            Quality::Uncertain => "uncertain",
            Quality::Disconnected => "disconnected",
            Quality::Timeout => "timeout",
            Quality::Overflow => "overflow",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Values
// ============================================================================

/// Scalar value held by a variable
///
/// Serialized untagged so configuration files can write plain literals
/// (`value: 1`, `value: "on"`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Numeric view of the value; strings are parsed, bools map to 1/0
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bytes(_) | Value::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            Value::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness: nonzero numbers, `true`, and non-empty strings/bytes
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::UInt(u) => *u != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Convert to a JSON value (bytes become an array of numbers)
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::UInt(u) => serde_json::Value::from(*u),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::from(b.clone()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            },
            serde_json::Value::String(s) => Value::String(s),
            // Nested structures are kept as their compact JSON text
            other => Value::String(other.to_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "{:?}", b),
        }
    }
}

// ============================================================================
// Variables
// ============================================================================

/// A single named, typed real-time data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Variable {
    /// Numeric ID, globally unique
    pub id: u64,
    /// Semantic ID, `<kind>-<device>-<local>[-<index>]`
    pub string_id: String,
    pub name: String,
    pub description: String,
    pub data_type: DataType,
    pub value: Value,
    pub quality: Quality,
    /// Last update time
    pub timestamp: DateTime<Utc>,
    /// Owning device
    pub device_id: String,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<Value>,
}

impl Default for Variable {
    fn default() -> Self {
        Self {
            id: 0,
            string_id: String::new(),
            name: String::new(),
            description: String::new(),
            data_type: DataType::default(),
            value: Value::Null,
            quality: Quality::Good,
            timestamp: Utc::now(),
            device_id: String::new(),
            unit: String::new(),
            min_value: None,
            max_value: None,
        }
    }
}

impl Variable {
    pub fn new(id: u64, string_id: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id,
            string_id: string_id.into(),
            data_type,
            ..Default::default()
        }
    }

    /// Builder-style device assignment
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Builder-style initial value
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = value.into();
        self
    }

    /// Set value, mark quality good and stamp with the current time
    pub fn set_value(&mut self, value: impl Into<Value>) {
        self.value = value.into();
        self.quality = Quality::Good;
        self.timestamp = Utc::now();
    }

    /// Snapshot of the live fields for subscribers
    pub fn to_update(&self) -> VariableUpdate {
        VariableUpdate {
            variable_id: self.id,
            string_id: self.string_id.clone(),
            device_id: self.device_id.clone(),
            value: self.value.clone(),
            quality: self.quality,
            timestamp: self.timestamp,
        }
    }
}

/// Change notification delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableUpdate {
    pub variable_id: u64,
    pub string_id: String,
    pub device_id: String,
    pub value: Value,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Devices
// ============================================================================

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_enabled() -> bool {
    true
}

/// A field device or broker endpoint served by one adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Protocol name resolved through the adapter registry
    pub protocol: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Protocol-specific configuration
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Device {
    pub fn new(id: impl Into<String>, protocol: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            protocol: protocol.into(),
            address: String::new(),
            port: 0,
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            enabled: true,
            tags: HashMap::new(),
        }
    }

    /// Builder-style tag insertion
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}
