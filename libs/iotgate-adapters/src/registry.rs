//! Adapter Registry Module
//!
//! Maps protocol names to factories that parse a device's tag bag and build
//! the matching adapter. The registry is an ordinary value: construct it,
//! register factories, and hand it to whoever creates adapters.

use std::sync::Arc;

use dashmap::DashMap;
use errors::{GatewayError, GatewayResult};
use iotgate_model::Device;

use crate::http::HttpAdapter;
use crate::mock::MockAdapter;
use crate::mqtt::MqttAdapter;
use crate::traits::ProtocolAdapter;

/// Lower-cased, trimmed protocol name
pub fn normalize_protocol_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

// ============================================================================
// Adapter Factory Trait
// ============================================================================

/// Builds one protocol's adapters from device definitions
pub trait AdapterFactory: Send + Sync {
    /// Names this factory answers to (aliases allowed)
    fn protocol_names(&self) -> &'static [&'static str];

    /// Parse the device's tags and build an unconnected adapter
    fn create(&self, device: &Device) -> GatewayResult<Arc<dyn ProtocolAdapter>>;
}

/// Factory backed by a constructor closure
pub struct FnFactory<F> {
    names: &'static [&'static str],
    constructor: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&Device) -> GatewayResult<Arc<dyn ProtocolAdapter>> + Send + Sync,
{
    pub fn new(names: &'static [&'static str], constructor: F) -> Self {
        Self { names, constructor }
    }
}

impl<F> AdapterFactory for FnFactory<F>
where
    F: Fn(&Device) -> GatewayResult<Arc<dyn ProtocolAdapter>> + Send + Sync,
{
    fn protocol_names(&self) -> &'static [&'static str] {
        self.names
    }

    fn create(&self, device: &Device) -> GatewayResult<Arc<dyn ProtocolAdapter>> {
        (self.constructor)(device)
    }
}

// ============================================================================
// Built-in factories
// ============================================================================

pub struct MockFactory;

impl AdapterFactory for MockFactory {
    fn protocol_names(&self) -> &'static [&'static str] {
        &["mock", "simulator"]
    }

    fn create(&self, device: &Device) -> GatewayResult<Arc<dyn ProtocolAdapter>> {
        Ok(Arc::new(MockAdapter::from_device(device)?))
    }
}

pub struct MqttFactory;

impl AdapterFactory for MqttFactory {
    fn protocol_names(&self) -> &'static [&'static str] {
        &["mqtt"]
    }

    fn create(&self, device: &Device) -> GatewayResult<Arc<dyn ProtocolAdapter>> {
        Ok(Arc::new(MqttAdapter::from_device(device)?))
    }
}

pub struct HttpFactory;

impl AdapterFactory for HttpFactory {
    fn protocol_names(&self) -> &'static [&'static str] {
        &["http", "https"]
    }

    fn create(&self, device: &Device) -> GatewayResult<Arc<dyn ProtocolAdapter>> {
        Ok(Arc::new(HttpAdapter::from_device(device)?))
    }
}

// ============================================================================
// Adapter Registry
// ============================================================================

/// Protocol name -> factory
pub struct AdapterRegistry {
    factories: DashMap<String, Arc<dyn AdapterFactory>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Registry with the mock, MQTT and HTTP factories
    ///
    /// Modbus and OPC-UA plug in the same way through [`AdapterRegistry::register`].
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(MockFactory));
        registry.register(Arc::new(MqttFactory));
        registry.register(Arc::new(HttpFactory));
        registry
    }

    /// Register every name the factory declares; later registrations win
    pub fn register(&self, factory: Arc<dyn AdapterFactory>) {
        for name in factory.protocol_names() {
            self.factories
                .insert(normalize_protocol_name(name), Arc::clone(&factory));
        }
    }

    /// Build an adapter for the device's protocol
    pub fn create(&self, device: &Device) -> GatewayResult<Arc<dyn ProtocolAdapter>> {
        let factory = self
            .factories
            .get(&normalize_protocol_name(&device.protocol))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::UnsupportedProtocol(device.protocol.clone()))?;
        factory.create(device)
    }

    pub fn is_registered(&self, protocol: &str) -> bool {
        self.factories
            .contains_key(&normalize_protocol_name(protocol))
    }

    /// Registered names, sorted
    pub fn registered_protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|r| r.key().clone()).collect();
        names.sort_unstable();
        names
    }
}

// ============================================================================
// Tests
// ============================================================================
