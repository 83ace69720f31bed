//! Typed adapter configuration parsed from a device's tag bag
//!
//! Tags are plain strings; each protocol's recognized keys are parsed once,
//! when the adapter is built, so handlers never deal with untyped values.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use errors::{GatewayError, GatewayResult};
use iotgate_model::{DataType, Device};
use iotgate_transform::JsonPath;
use serde::de::DeserializeOwned;
use serde::Deserialize;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_KEEP_ALIVE: Duration = Duration::from_secs(60);
/// Smallest keep-alive the MQTT client accepts
pub const MIN_MQTT_KEEP_ALIVE: Duration = Duration::from_secs(5);
pub const DEFAULT_HTTP_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Tag helpers
// ============================================================================

fn tag_field(key: &str) -> String {
    format!("tags.{}", key)
}

fn required_tag<'a>(device: &'a Device, key: &str) -> GatewayResult<&'a str> {
    match device.tag(key) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim()),
        _ => Err(GatewayError::invalid_config(
            tag_field(key),
            format!("required for {} device {}", device.protocol, device.id),
        )),
    }
}

fn optional_tag<'a>(device: &'a Device, key: &str) -> Option<&'a str> {
    device
        .tag(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_tag<T>(device: &Device, key: &str) -> GatewayResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_tag(device, key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| GatewayError::invalid_config(tag_field(key), format!("'{}': {}", raw, e)))
        })
        .transpose()
}

fn duration_tag(device: &Device, key: &str) -> GatewayResult<Option<Duration>> {
    optional_tag(device, key)
        .map(|raw| {
            humantime::parse_duration(raw)
                .map_err(|e| GatewayError::invalid_config(tag_field(key), format!("'{}': {}", raw, e)))
        })
        .transpose()
}

fn json_tag<T: DeserializeOwned>(device: &Device, key: &str) -> GatewayResult<Option<T>> {
    optional_tag(device, key)
        .map(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| GatewayError::invalid_config(tag_field(key), e.to_string()))
        })
        .transpose()
}

/// Default string ID for values an adapter produces: `DV-<device>-VAR<id>`
pub fn default_string_id(device_id: &str, variable_id: u64) -> String {
    format!("DV-{}-VAR{}", device_id, variable_id)
}

// ============================================================================
// Mock
// ============================================================================

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub device_id: String,
    /// Simulated latency per call
    pub data_delay: Duration,
    /// Failure injection: <= 0 never fails, >= 1 always fails
    pub error_rate: f64,
    pub value_range: (f64, f64),
    pub auto_increment: bool,
    /// Variables read on every simulation tick while connected
    pub variables: Vec<u64>,
    /// Simulation tick; `None` disables the background loop
    pub poll_interval: Option<Duration>,
}

impl MockConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            data_delay: Duration::ZERO,
            error_rate: 0.0,
            value_range: (0.0, 100.0),
            auto_increment: false,
            variables: Vec::new(),
            poll_interval: None,
        }
    }

    pub fn from_device(device: &Device) -> GatewayResult<Self> {
        let mut config = Self::new(device.id.clone());
        if let Some(delay) = duration_tag(device, "data_delay")? {
            config.data_delay = delay;
        }
        if let Some(rate) = parse_tag::<f64>(device, "error_rate")? {
            config.error_rate = rate;
        }
        let min = parse_tag::<f64>(device, "value_min")?.unwrap_or(config.value_range.0);
        let max = parse_tag::<f64>(device, "value_max")?.unwrap_or(config.value_range.1);
        if min > max {
            return Err(GatewayError::invalid_config(
                tag_field("value_min"),
                format!("{} is greater than value_max {}", min, max),
            ));
        }
        config.value_range = (min, max);
        if let Some(flag) = parse_tag::<bool>(device, "auto_increment")? {
            config.auto_increment = flag;
        }
        if let Some(raw) = optional_tag(device, "variables") {
            config.variables = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<u64>().map_err(|e| {
                        GatewayError::invalid_config(tag_field("variables"), format!("'{}': {}", s, e))
                    })
                })
                .collect::<GatewayResult<_>>()?;
        }
        config.poll_interval = duration_tag(device, "poll_interval")?;
        Ok(config)
    }
}

// ============================================================================
// MQTT
// ============================================================================

/// One topic-to-variable mapping
#[derive(Debug, Clone, Deserialize)]
pub struct MqttTopic {
    pub topic: String,
    pub variable_id: u64,
    pub json_path: JsonPath,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub string_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub clean_session: bool,
    pub keep_alive: Duration,
    /// ConnAck deadline
    pub timeout: Duration,
    pub topics: Vec<MqttTopic>,
}

impl MqttConfig {
    pub fn from_device(device: &Device) -> GatewayResult<Self> {
        let broker_url = required_tag(device, "broker_url")?.to_string();
        let qos = parse_tag::<u8>(device, "qos")?.unwrap_or(0);
        if qos > 2 {
            return Err(GatewayError::invalid_config(
                tag_field("qos"),
                format!("{} is not a valid QoS (0-2)", qos),
            ));
        }
        let keep_alive = duration_tag(device, "keep_alive")?
            .unwrap_or(DEFAULT_MQTT_KEEP_ALIVE)
            .max(MIN_MQTT_KEEP_ALIVE);

        let config = Self {
            client_id: optional_tag(device, "client_id")
                .map(str::to_string)
                .unwrap_or_else(|| format!("iotgate-{}", device.id)),
            username: optional_tag(device, "username").map(str::to_string),
            password: optional_tag(device, "password").map(str::to_string),
            qos,
            clean_session: parse_tag::<bool>(device, "clean_session")?.unwrap_or(true),
            keep_alive,
            timeout: duration_tag(device, "timeout")?.unwrap_or(device.connect_timeout),
            topics: json_tag(device, "topics")?.unwrap_or_default(),
            broker_url,
        };
        config.broker_endpoint()?;
        Ok(config)
    }

    /// Host and port from `mqtt://host:port`, `tcp://host:port` or `host:port`
    pub fn broker_endpoint(&self) -> GatewayResult<(String, u16)> {
        let raw = self.broker_url.trim();
        let rest = raw
            .strip_prefix("mqtt://")
            .or_else(|| raw.strip_prefix("tcp://"))
            .unwrap_or(raw);
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    GatewayError::invalid_config(tag_field("broker_url"), format!("bad port '{}': {}", port, e))
                })?;
                (host, port)
            },
            None => (rest, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() || host.contains("://") {
            return Err(GatewayError::invalid_config(
                tag_field("broker_url"),
                format!("unsupported broker URL '{}'", raw),
            ));
        }
        Ok((host.to_string(), port))
    }

    /// Mapping that owns `variable_id` for outbound publishes
    pub fn topic_for(&self, variable_id: u64) -> Option<&MqttTopic> {
        self.topics.iter().find(|t| t.variable_id == variable_id)
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HttpAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

/// One polled endpoint feeding one variable
#[derive(Debug, Clone, Deserialize)]
pub struct HttpEndpoint {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub variable_id: u64,
    pub json_path: JsonPath,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub string_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub poll_interval: Duration,
    /// Per-request timeout
    pub timeout: Duration,
    pub headers: HashMap<String, String>,
    pub auth: HttpAuth,
    pub endpoints: Vec<HttpEndpoint>,
}

impl HttpConfig {
    pub fn from_device(device: &Device) -> GatewayResult<Self> {
        let base_url = required_tag(device, "base_url")?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(GatewayError::invalid_config(
                tag_field("base_url"),
                format!("'{}' must start with http:// or https://", base_url),
            ));
        }

        let poll_interval =
            duration_tag(device, "poll_interval")?.unwrap_or(DEFAULT_HTTP_POLL_INTERVAL);
        if poll_interval.is_zero() {
            return Err(GatewayError::invalid_config(
                tag_field("poll_interval"),
                "must be greater than zero",
            ));
        }

        let auth = match optional_tag(device, "auth_type").map(str::to_ascii_lowercase) {
            None => HttpAuth::None,
            Some(kind) if kind == "none" => HttpAuth::None,
            Some(kind) if kind == "basic" => HttpAuth::Basic {
                username: required_tag(device, "username")?.to_string(),
                password: optional_tag(device, "password").unwrap_or_default().to_string(),
            },
            Some(kind) if kind == "bearer" => HttpAuth::Bearer {
                token: required_tag(device, "token")?.to_string(),
            },
            Some(other) => {
                return Err(GatewayError::invalid_config(
                    tag_field("auth_type"),
                    format!("unknown auth type '{}' (none, basic, bearer)", other),
                ))
            },
        };

        let endpoints: Vec<HttpEndpoint> = json_tag(device, "endpoints")?.unwrap_or_default();
        for (i, endpoint) in endpoints.iter().enumerate() {
            if reqwest::Method::from_bytes(endpoint.method.to_ascii_uppercase().as_bytes()).is_err() {
                return Err(GatewayError::invalid_config(
                    format!("tags.endpoints[{}].method", i),
                    format!("'{}' is not an HTTP method", endpoint.method),
                ));
            }
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
            timeout: duration_tag(device, "timeout")?.unwrap_or(DEFAULT_HTTP_TIMEOUT),
            headers: json_tag(device, "headers")?.unwrap_or_default(),
            auth,
            endpoints,
        })
    }

    pub fn url_for(&self, endpoint: &HttpEndpoint) -> String {
        if endpoint.path.starts_with('/') {
            format!("{}{}", self.base_url, endpoint.path)
        } else {
            format!("{}/{}", self.base_url, endpoint.path)
        }
    }

    /// Endpoint that owns `variable_id` for outbound writes
    pub fn endpoint_for(&self, variable_id: u64) -> Option<&HttpEndpoint> {
        self.endpoints.iter().find(|e| e.variable_id == variable_id)
    }
}
