//! iotgate Protocol Adapter Framework
//!
//! Connects to field devices and turns what they report into variable
//! updates for the store.
//!
//! # Key Components
//!
//! - **ProtocolAdapter trait**: connect/disconnect/read/write/reconnect
//! - **AdapterBase**: connection state, last error, reconnect budget, counters
//! - **Adapters**: `MockAdapter`, `MqttAdapter` (rumqttc), `HttpAdapter` (reqwest polling)
//! - **AdapterRegistry**: protocol name -> factory, constructed explicitly
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use iotgate_adapters::{AdapterRegistry, UpdateSink};
//! use iotgate_model::Device;
//! use iotgate_rtdb::MemoryStore;
//!
//! # async fn demo() -> errors::GatewayResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! let registry = AdapterRegistry::with_defaults();
//! let device = Device::new("SIM1", "mock");
//! let adapter = registry.create(&device)?;
//! adapter.set_update_sink(UpdateSink::new().with_store(store));
//! adapter.connect(&device).await?;
//! adapter.read_variable(100_001).await?;
//! # Ok(())
//! # }
//! ```

pub mod base;
pub mod config;
pub mod http;
pub mod mock;
pub mod mqtt;
pub mod registry;
pub mod traits;

pub use base::{
    write_envelope, AdapterBase, AdapterStats, ConnectionState, UpdateCallback, UpdateSink,
};
pub use config::{HttpAuth, HttpConfig, HttpEndpoint, MockConfig, MqttConfig, MqttTopic};
pub use http::HttpAdapter;
pub use mock::MockAdapter;
pub use mqtt::MqttAdapter;
pub use registry::{AdapterFactory, AdapterRegistry, FnFactory};
pub use traits::ProtocolAdapter;
