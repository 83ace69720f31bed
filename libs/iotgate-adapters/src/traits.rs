//! Protocol adapter trait

use async_trait::async_trait;
use errors::GatewayResult;
use iotgate_model::{Device, Value, Variable};

use crate::base::{AdapterBase, AdapterStats, ConnectionState, UpdateSink};

/// Polymorphic device connection
///
/// Adapters are shared (`Arc<dyn ProtocolAdapter>`) between the owner that
/// drives I/O and a supervisor that reconnects them, so every method takes
/// `&self`.
///
/// State machine: Disconnected -> Connecting -> Connected. I/O failure while
/// connected drops back to Disconnected; adapters never self-heal, a
/// supervisor must call [`ProtocolAdapter::reconnect`].
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Shared bookkeeping
    fn base(&self) -> &AdapterBase;

    fn protocol(&self) -> &'static str {
        self.base().protocol()
    }

    async fn connect(&self, device: &Device) -> GatewayResult<()>;

    /// Stop background work and release connections before returning
    async fn disconnect(&self) -> GatewayResult<()>;

    fn is_connected(&self) -> bool {
        self.base().is_connected()
    }

    fn state(&self) -> ConnectionState {
        self.base().state()
    }

    async fn read_variable(&self, id: u64) -> GatewayResult<Variable>;

    async fn read_variables(&self, ids: &[u64]) -> GatewayResult<Vec<Variable>> {
        let mut variables = Vec::with_capacity(ids.len());
        for id in ids {
            variables.push(self.read_variable(*id).await?);
        }
        Ok(variables)
    }

    async fn write_variable(&self, id: u64, value: Value) -> GatewayResult<()>;

    /// Retry the connection after `attempt x base delay`
    ///
    /// Fails with `MaxReconnectAttempts` once the budget is spent; a
    /// successful connect restores it.
    async fn reconnect(&self) -> GatewayResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let delay = self.base().begin_reconnect()?;
        tokio::time::sleep(delay).await;
        let device = self.base().device();
        self.connect(&device).await
    }

    fn stats(&self) -> AdapterStats {
        self.base().stats()
    }

    /// Route inbound values into a store and/or callback
    fn set_update_sink(&self, sink: UpdateSink) {
        self.base().set_sink(sink);
    }
}
