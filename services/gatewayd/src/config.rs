//! Daemon configuration
//!
//! One YAML (or TOML/JSON) file, overridable through `GATEWAYD_*` environment
//! variables with `__` between nested keys.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use errors::{GatewayError, GatewayResult};
use iotgate_alarm::{AlarmRule, SchedulerConfig};
use iotgate_model::{Device, Variable};
use iotgate_rtdb::StoreConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "config/gatewayd.yaml";
pub const ENV_PREFIX: &str = "GATEWAYD_";
pub const DEFAULT_SUPERVISOR_INTERVAL: Duration = Duration::from_secs(5);

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_supervisor_interval() -> Duration {
    DEFAULT_SUPERVISOR_INTERVAL
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log root; `IOTGATE_LOG_DIR` still wins when set
    #[serde(default)]
    pub dir: Option<String>,
    /// JSON lines in the log file
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_true")]
    pub file: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            json: false,
            file: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// How often disconnected adapters are retried
    #[serde(default = "default_supervisor_interval", with = "humantime_serde")]
    pub supervisor_interval: Duration,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub rules: Vec<AlarmRule>,
    /// Created in the store before any adapter connects
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log: LogSettings::default(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            supervisor_interval: DEFAULT_SUPERVISOR_INTERVAL,
            devices: Vec::new(),
            rules: Vec::new(),
            variables: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let config: Self = common::load_config(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need the whole file; per-item checks run
    /// again when the store, registry and engine consume the items
    pub fn validate(&self) -> GatewayResult<()> {
        if self.supervisor_interval.is_zero() {
            return Err(GatewayError::invalid_config(
                "supervisor_interval",
                "must be greater than zero",
            ));
        }
        if self.scheduler.workers == 0 {
            return Err(GatewayError::invalid_config(
                "scheduler.workers",
                "must be at least 1",
            ));
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(GatewayError::invalid_config("devices.id", "must not be empty"));
            }
            if !device_ids.insert(device.id.as_str()) {
                return Err(GatewayError::invalid_config(
                    format!("devices.{}", device.id),
                    "duplicate device ID",
                ));
            }
        }

        let mut rule_ids = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(GatewayError::invalid_config(
                    format!("rules.{}", rule.id),
                    "duplicate rule ID",
                ));
            }
        }
        Ok(())
    }

    pub fn enabled_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|d| d.enabled)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use iotgate_alarm::{ActionKind, TriggerPhase};
    use iotgate_model::Value;
    use std::io::Write;
    use tempfile::Builder;

    const SAMPLE: &str = r#"
log:
  level: debug
  file: false
store:
  notify_queue_capacity: 64
scheduler:
  workers: 2
supervisor_interval: 2s
devices:
  - id: PLC1
    protocol: simulator
    tags:
      variables: "100001,100002"
      poll_interval: 500ms
  - id: ROOF
    protocol: mqtt
    enabled: false
    connect_timeout: 3s
    tags:
      broker_url: tcp://broker:1883
rules:
  - id: high-temp
    variable_id: 100001
    condition: value > 80
    level: high
    delay: 2s
    trigger_actions:
      - id: fan-on
        type: write_var
        variable_id: 100010
        value: 1
    recover_actions:
      - id: fan-off
        type: write_var
        when: after_recover
        delay: 30s
        variable_id: 100010
        value: 0
variables:
  - id: 100010
    string_id: DO-PLC1-FAN
    data_type: int64
"#;

    fn write_yaml(content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample() {
        let file = write_yaml(SAMPLE);
        let config = GatewayConfig::load(file.path()).unwrap();

        assert_eq!(config.log.level, "debug");
        assert!(!config.log.file);
        assert_eq!(config.store.notify_queue_capacity, 64);
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.supervisor_interval, Duration::from_secs(2));

        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].connect_timeout, Duration::from_secs(3));
        let enabled: Vec<_> = config.enabled_devices().map(|d| d.id.as_str()).collect();
        assert_eq!(enabled, vec!["PLC1"]);

        let rule = &config.rules[0];
        assert_eq!(rule.delay, Duration::from_secs(2));
        assert_eq!(rule.recover_actions[0].when, TriggerPhase::AfterRecover);
        assert_eq!(rule.recover_actions[0].delay, Duration::from_secs(30));
        assert!(matches!(
            rule.trigger_actions[0].kind,
            ActionKind::WriteVar { variable_id: 100_010, value: Value::Int(1) }
        ));

        assert_eq!(config.variables[0].string_id, "DO-PLC1-FAN");
    }

    #[test]
    fn test_defaults_for_empty_sections() {
        let file = write_yaml("devices: []\n");
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.supervisor_interval, DEFAULT_SUPERVISOR_INTERVAL);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let file = write_yaml(
            "devices:\n  - {id: A, protocol: mock}\n  - {id: A, protocol: mock}\n",
        );
        let err = GatewayConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig { ref field, .. } if field == "devices.A"));

        let mut config = GatewayConfig::default();
        config.rules = vec![
            AlarmRule::new("r", 100_001, "value > 1"),
            AlarmRule::new("r", 100_002, "value > 2"),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = GatewayConfig::load("/nonexistent/gatewayd.yaml").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
