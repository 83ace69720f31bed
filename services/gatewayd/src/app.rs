//! Gateway assembly and lifecycle
//!
//! Startup order: store (with pre-created variables), alarm engine, adapters.
//! The engine is subscribed before the first adapter delivers a value, so
//! initial readings are evaluated too. Shutdown runs in reverse.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use errors::{GatewayError, GatewayResult};
use futures::future::join_all;
use iotgate_adapters::{AdapterRegistry, ProtocolAdapter, UpdateSink};
use iotgate_alarm::AlarmEngine;
use iotgate_rtdb::{MemoryStore, VariableStore};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;

pub struct Gateway {
    store: Arc<MemoryStore>,
    registry: AdapterRegistry,
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
    engine: AlarmEngine,
    supervisor_interval: Duration,
    /// Devices whose reconnect budget is spent
    abandoned: Mutex<HashSet<String>>,
}

impl Gateway {
    /// Build every component from configuration without touching the network
    ///
    /// Unknown protocols and malformed device tags are configuration errors
    /// and fail the build; connection problems only surface in [`Gateway::run`].
    pub fn build(config: &GatewayConfig) -> GatewayResult<Self> {
        let store = Arc::new(MemoryStore::with_config(config.store.clone()));
        for variable in &config.variables {
            store.create_variable(variable.clone())?;
        }
        if !config.variables.is_empty() {
            info!("Pre-created {} variables", config.variables.len());
        }

        let registry = AdapterRegistry::with_defaults();
        let mut adapters = Vec::new();
        for device in config.enabled_devices() {
            let adapter = registry.create(device)?;
            adapter.set_update_sink(UpdateSink::new().with_store(store.clone()));
            debug!("Created {} adapter for device {}", adapter.protocol(), device.id);
            adapters.push(adapter);
        }

        let engine = AlarmEngine::new(store.clone(), config.scheduler.clone());
        for rule in &config.rules {
            engine.add_rule(rule.clone())?;
        }

        info!(
            "Gateway built: {} adapters, {} rules, protocols [{}]",
            adapters.len(),
            config.rules.len(),
            registry.registered_protocols().join(", ")
        );

        Ok(Self {
            store,
            registry,
            adapters,
            engine,
            supervisor_interval: config.supervisor_interval,
            abandoned: Mutex::new(HashSet::new()),
        })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &AlarmEngine {
        &self.engine
    }

    pub fn adapters(&self) -> &[Arc<dyn ProtocolAdapter>] {
        &self.adapters
    }

    pub fn adapter(&self, device_id: &str) -> Option<&Arc<dyn ProtocolAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.base().device_id() == device_id)
    }

    /// Start the engine, connect all adapters, then supervise until `shutdown`
    pub async fn run(&self, shutdown: CancellationToken) -> GatewayResult<()> {
        self.engine.start()?;
        self.connect_all().await;

        let connected = self.adapters.iter().filter(|a| a.is_connected()).count();
        info!(
            "Gateway running: {}/{} adapters connected",
            connected,
            self.adapters.len()
        );

        self.supervise(&shutdown).await;
        self.shutdown().await;
        Ok(())
    }

    /// Connect every adapter concurrently; failures are logged, not fatal
    pub async fn connect_all(&self) {
        let attempts = self.adapters.iter().map(|adapter| async move {
            let device = adapter.base().device();
            if let Err(e) = adapter.connect(&device).await {
                warn!("Device {} ({}) connect failed: {}", device.id, adapter.protocol(), e);
            }
        });
        join_all(attempts).await;
    }

    async fn supervise(&self, shutdown: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.supervisor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = self.reconnect_disconnected() => {},
                    }
                },
            }
        }
    }

    /// One supervisor pass over the disconnected adapters
    pub async fn reconnect_disconnected(&self) {
        let candidates: Vec<_> = {
            let abandoned = self.abandoned.lock();
            self.adapters
                .iter()
                .filter(|a| !a.is_connected() && !abandoned.contains(&a.base().device_id()))
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return;
        }

        let attempts = candidates.into_iter().map(|adapter| async move {
            let device_id = adapter.base().device_id();
            match adapter.reconnect().await {
                Ok(()) => info!("Device {} reconnected", device_id),
                Err(GatewayError::MaxReconnectAttempts { attempts }) => {
                    error!(
                        "Device {} gave up after {} reconnect attempts",
                        device_id, attempts
                    );
                    self.abandoned.lock().insert(device_id);
                },
                Err(e) => warn!("Device {} reconnect failed: {}", device_id, e),
            }
        });
        join_all(attempts).await;
    }

    /// Stop the engine, then disconnect every adapter
    pub async fn shutdown(&self) {
        info!("Gateway shutting down");
        self.engine.stop().await;

        let disconnects = self.adapters.iter().map(|adapter| async move {
            if let Err(e) = adapter.disconnect().await {
                warn!("Device {} disconnect failed: {}", adapter.base().device_id(), e);
            }
        });
        join_all(disconnects).await;

        let stats = self.store.stats();
        info!(
            "Gateway stopped: {} variables in store, {} active subscribers",
            stats.total_variables, stats.total_subscribers
        );
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use iotgate_alarm::AlarmRule;
    use iotgate_model::{DataType, Device, Variable};

    fn mock_device(id: &str) -> Device {
        Device::new(id, "mock")
            .with_tag("variables", "100001")
            .with_tag("value_min", "90")
            .with_tag("value_max", "90")
            .with_tag("poll_interval", "100ms")
    }

    #[tokio::test]
    async fn test_build_rejects_unknown_protocol() {
        let config = GatewayConfig {
            devices: vec![Device::new("X", "modbus")],
            ..Default::default()
        };
        assert!(matches!(
            Gateway::build(&config),
            Err(GatewayError::UnsupportedProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_build_skips_disabled_devices_and_precreates_variables() {
        let mut disabled = mock_device("OFF");
        disabled.enabled = false;
        let config = GatewayConfig {
            devices: vec![mock_device("SIM1"), disabled],
            variables: vec![Variable::new(100_050, "DO-SIM1-FAN", DataType::Int64)],
            ..Default::default()
        };
        let gateway = Gateway::build(&config).unwrap();
        assert_eq!(gateway.adapters().len(), 1);
        assert!(gateway.adapter("SIM1").is_some());
        assert!(gateway.adapter("OFF").is_none());
        assert_eq!(gateway.store().read_var_by_string_id("DO-SIM1-FAN").unwrap().id, 100_050);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_feeds_engine_until_shutdown() {
        let config = GatewayConfig {
            devices: vec![mock_device("SIM1")],
            rules: vec![AlarmRule::new("hot", 100_001, "value > 80")],
            ..Default::default()
        };
        let gateway = Arc::new(Gateway::build(&config).unwrap());
        let shutdown = CancellationToken::new();

        let runner = {
            let gateway = gateway.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { gateway.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(gateway.adapter("SIM1").unwrap().is_connected());
        assert_eq!(gateway.engine().active_alarms().len(), 1);

        shutdown.cancel();
        runner.await.unwrap().unwrap();
        assert!(!gateway.engine().is_running());
        assert!(!gateway.adapter("SIM1").unwrap().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_reconnects_dropped_adapter() {
        let config = GatewayConfig {
            devices: vec![mock_device("SIM1")],
            supervisor_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let gateway = Arc::new(Gateway::build(&config).unwrap());
        let shutdown = CancellationToken::new();
        let runner = {
            let gateway = gateway.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { gateway.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let adapter = gateway.adapter("SIM1").unwrap().clone();
        adapter.base().mark_disconnected("link lost");
        assert!(!adapter.is_connected());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(adapter.is_connected());
        // A successful connect restores the budget
        assert_eq!(adapter.stats().reconnect_count, 0);
        assert!(adapter.stats().last_error.is_some());

        shutdown.cancel();
        runner.await.unwrap().unwrap();
    }
}
