//! Mock Protocol Implementation
//!
//! In-memory device for tests and demos. Never touches real I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use errors::{protocol_error, GatewayError, GatewayResult};
use iotgate_model::{DataType, Device, Value, Variable};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::base::{AdapterBase, BackgroundTask, ConnectionState};
use crate::config::MockConfig;
use crate::traits::ProtocolAdapter;

pub const PROTOCOL: &str = "mock";

/// Threshold check only: a rate strictly between 0 and 1 never fails
pub fn should_inject_error(error_rate: f64) -> bool {
    if error_rate <= 0.0 {
        return false;
    }
    error_rate >= 1.0
}

struct MockShared {
    base: AdapterBase,
    config: MockConfig,
    variables: RwLock<FxHashMap<u64, Variable>>,
    counter: AtomicU64,
}

impl MockShared {
    fn string_id(&self, id: u64) -> String {
        format!("MOCK-{}-VAR{}", self.config.device_id, id)
    }

    fn midpoint(&self) -> f64 {
        let (min, max) = self.config.value_range;
        if min == max {
            min
        } else {
            min + (max - min) * 0.5
        }
    }

    fn new_variable(&self, id: u64, value: Value) -> Variable {
        let mut variable = Variable::new(id, self.string_id(id), DataType::Float64)
            .with_device(self.config.device_id.clone())
            .with_value(value);
        variable.name = format!("Mock Variable {}", id);
        variable
    }

    async fn simulate_latency(&self) {
        if !self.config.data_delay.is_zero() {
            tokio::time::sleep(self.config.data_delay).await;
        }
    }

    async fn read(&self, id: u64) -> GatewayResult<Variable> {
        self.base.ensure_connected()?;
        self.simulate_latency().await;

        if should_inject_error(self.config.error_rate) {
            let err = protocol_error!(PROTOCOL, "mock read error");
            self.base.record_read(false);
            self.base.set_last_error(&err);
            return Err(err);
        }

        let variable = {
            let mut variables = self.variables.write();
            let entry = variables
                .entry(id)
                .or_insert_with(|| self.new_variable(id, Value::Float(self.midpoint())));
            if self.config.auto_increment {
                let next = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
                entry.set_value(next as f64);
            }
            entry.clone()
        };

        self.base.record_read(true);
        self.base.sink().deliver(&variable);
        Ok(variable)
    }

    async fn write(&self, id: u64, value: Value) -> GatewayResult<()> {
        self.base.ensure_connected()?;
        self.simulate_latency().await;

        if should_inject_error(self.config.error_rate) {
            let err = protocol_error!(PROTOCOL, "mock write error");
            self.base.record_write(false);
            self.base.set_last_error(&err);
            return Err(err);
        }

        {
            let mut variables = self.variables.write();
            match variables.get_mut(&id) {
                Some(existing) => existing.set_value(value),
                None => {
                    variables.insert(id, self.new_variable(id, value));
                },
            }
        }
        self.base.record_write(true);
        Ok(())
    }
}

/// Mock adapter with optional periodic simulation
pub struct MockAdapter {
    shared: Arc<MockShared>,
    task: tokio::sync::Mutex<Option<BackgroundTask>>,
}

impl MockAdapter {
    pub fn new(config: MockConfig) -> Self {
        let device = Device::new(config.device_id.clone(), PROTOCOL);
        Self::from_parts(AdapterBase::new(PROTOCOL, device), config)
    }

    pub fn from_device(device: &Device) -> GatewayResult<Self> {
        let config = MockConfig::from_device(device)?;
        Ok(Self::from_parts(
            AdapterBase::new(PROTOCOL, device.clone()),
            config,
        ))
    }

    /// Build around a preconfigured base, e.g. with a short reconnect delay
    pub fn from_parts(base: AdapterBase, config: MockConfig) -> Self {
        Self {
            shared: Arc::new(MockShared {
                base,
                config,
                variables: RwLock::new(FxHashMap::default()),
                counter: AtomicU64::new(0),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MockConfig {
        &self.shared.config
    }

    /// Seed a simulated variable
    pub fn add_variable(&self, variable: Variable) {
        self.shared.variables.write().insert(variable.id, variable);
    }

    /// Change a seeded variable's value without going through `write_variable`
    pub fn set_variable(&self, id: u64, value: impl Into<Value>) -> GatewayResult<()> {
        let mut variables = self.shared.variables.write();
        let variable = variables
            .get_mut(&id)
            .ok_or_else(|| GatewayError::not_found(format!("mock variable {}", id)))?;
        variable.set_value(value);
        Ok(())
    }

    pub fn list_variables(&self) -> Vec<Variable> {
        let mut all: Vec<Variable> = self.shared.variables.read().values().cloned().collect();
        all.sort_unstable_by_key(|v| v.id);
        all
    }

    /// Mark the simulated link broken, as a real adapter does on I/O failure
    pub fn simulate_connection_loss(&self, reason: &str) {
        self.shared.base.mark_disconnected(reason);
    }
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    fn base(&self) -> &AdapterBase {
        &self.shared.base
    }

    async fn connect(&self, device: &Device) -> GatewayResult<()> {
        let mut task = self.task.lock().await;
        if self.shared.base.is_connected() {
            return Ok(());
        }
        if let Some(stale) = task.take() {
            stale.stop().await;
        }

        self.shared.base.set_device(device);
        self.shared.base.set_state(ConnectionState::Connecting);
        self.shared.base.mark_connected();

        if let Some(interval) = self.shared.config.poll_interval {
            if !self.shared.config.variables.is_empty() {
                let shared = Arc::clone(&self.shared);
                *task = Some(BackgroundTask::spawn(move |cancel| async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                for id in &shared.config.variables {
                                    if let Err(e) = shared.read(*id).await {
                                        debug!("Mock poll of var {} failed: {}", id, e);
                                    }
                                }
                            }
                        }
                    }
                }));
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        let mut task = self.task.lock().await;
        if let Some(running) = task.take() {
            running.stop().await;
        }
        if self.shared.base.state() != ConnectionState::Disconnected {
            self.shared.base.set_state(ConnectionState::Disconnected);
            info!("Mock device {} disconnected", self.shared.base.device_id());
        }
        Ok(())
    }

    async fn read_variable(&self, id: u64) -> GatewayResult<Variable> {
        self.shared.read(id).await
    }

    async fn write_variable(&self, id: u64, value: Value) -> GatewayResult<()> {
        self.shared.write(id, value).await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use iotgate_rtdb::{MemoryStore, VariableStore};
    use std::time::Duration;

    use crate::base::UpdateSink;

    fn adapter(config: MockConfig) -> MockAdapter {
        MockAdapter::new(config)
    }

    async fn connected(config: MockConfig) -> MockAdapter {
        let adapter = adapter(config);
        let device = adapter.base().device();
        adapter.connect(&device).await.unwrap();
        adapter
    }

    #[test]
    fn test_error_injection_threshold() {
        assert!(!should_inject_error(0.0));
        assert!(!should_inject_error(-1.0));
        assert!(!should_inject_error(0.5));
        assert!(!should_inject_error(0.999));
        assert!(should_inject_error(1.0));
        assert!(should_inject_error(2.0));
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let adapter = adapter(MockConfig::new("SIM1"));
        assert!(matches!(
            adapter.read_variable(1).await,
            Err(GatewayError::NotConnected(_))
        ));
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
        assert_eq!(adapter.protocol(), "mock");
    }

    #[tokio::test]
    async fn test_first_read_creates_midpoint() {
        let mut config = MockConfig::new("SIM1");
        config.value_range = (10.0, 20.0);
        let adapter = connected(config).await;

        let v = adapter.read_variable(100_001).await.unwrap();
        assert_eq!(v.value, Value::Float(15.0));
        assert_eq!(v.string_id, "MOCK-SIM1-VAR100001");
        assert_eq!(v.device_id, "SIM1");
        assert_eq!(adapter.list_variables().len(), 1);
        assert_eq!(adapter.stats().success_reads, 1);
    }

    #[tokio::test]
    async fn test_auto_increment() {
        let mut config = MockConfig::new("SIM1");
        config.auto_increment = true;
        let adapter = connected(config).await;

        let values: Vec<Value> = adapter
            .read_variables(&[1, 2, 1])
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.value)
            .collect();
        assert_eq!(values, vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]);
    }

    #[tokio::test]
    async fn test_always_failing_device() {
        let mut config = MockConfig::new("SIM1");
        config.error_rate = 1.0;
        let adapter = connected(config).await;

        assert!(adapter.read_variable(1).await.is_err());
        assert!(adapter.write_variable(1, Value::Int(1)).await.is_err());

        let stats = adapter.stats();
        assert_eq!(stats.failed_reads, 1);
        assert_eq!(stats.failed_writes, 1);
        assert_eq!(stats.last_error.as_deref(), Some("Protocol error: mock: mock write error"));
        // Per-operation failures keep the adapter up
        assert!(adapter.is_connected());
    }

    #[tokio::test]
    async fn test_write_then_read_and_helpers() {
        let adapter = connected(MockConfig::new("SIM1")).await;
        adapter.write_variable(7, Value::Int(42)).await.unwrap();
        assert_eq!(adapter.read_variable(7).await.unwrap().value, Value::Int(42));

        assert!(adapter.set_variable(8, 1.0).is_err());
        adapter.add_variable(Variable::new(8, "MOCK-SIM1-VAR8", DataType::Bool));
        adapter.set_variable(8, true).unwrap();
        assert_eq!(adapter.read_variable(8).await.unwrap().value, Value::Bool(true));
    }

    #[tokio::test]
    async fn test_reads_reach_store() {
        let store = Arc::new(MemoryStore::new());
        let adapter = connected(MockConfig::new("SIM1")).await;
        adapter.set_update_sink(UpdateSink::new().with_store(store.clone()));

        adapter.read_variable(100_005).await.unwrap();
        let stored = store.read_var_by_string_id("MOCK-SIM1-VAR100005").unwrap();
        assert_eq!(stored.value, Value::Float(50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_loop_stops_on_disconnect() {
        let store = Arc::new(MemoryStore::new());
        let mut config = MockConfig::new("SIM1");
        config.auto_increment = true;
        config.variables = vec![1];
        config.poll_interval = Some(Duration::from_millis(100));
        let adapter = adapter(config);
        adapter.set_update_sink(UpdateSink::new().with_store(store.clone()));
        adapter.connect(&adapter.base().device()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        adapter.disconnect().await.unwrap();
        let reads = adapter.stats().success_reads;
        assert_eq!(reads, 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(adapter.stats().success_reads, reads);
        assert_eq!(store.read_var(1).unwrap().value, Value::Float(3.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_loss() {
        let base = AdapterBase::new(PROTOCOL, Device::new("SIM1", PROTOCOL))
            .with_max_reconnect_attempts(1);
        let adapter = MockAdapter::from_parts(base, MockConfig::new("SIM1"));
        adapter.connect(&adapter.base().device()).await.unwrap();

        adapter.simulate_connection_loss("cable pulled");
        assert!(!adapter.is_connected());
        adapter.reconnect().await.unwrap();
        assert!(adapter.is_connected());
        assert_eq!(adapter.stats().reconnect_count, 0);

        adapter.simulate_connection_loss("cable pulled again");
        adapter.reconnect().await.unwrap();
        adapter.simulate_connection_loss("and again");
        // Budget restored by each successful connect
        assert!(adapter.reconnect().await.is_ok());
    }
}
