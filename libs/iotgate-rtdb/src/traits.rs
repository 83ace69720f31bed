//! Trait definitions for the variable store abstraction

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use errors::GatewayResult;
use iotgate_model::{Variable, VariableUpdate};
use serde::Serialize;

/// Subscriber callback, invoked off the writer's thread
pub type UpdateCallback = Arc<dyn Fn(VariableUpdate) + Send + Sync>;

/// What a subscription listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Exact numeric IDs
    Ids(Vec<u64>),
    /// Every variable owned by a device
    Device(String),
    /// String-ID pattern: `*`/`?` glob, trailing-`-` prefix, or exact
    Pattern(String),
}

/// Store counters, cumulative since start
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_variables: usize,
    pub total_subscribers: usize,
    pub total_subscriptions: usize,
    pub read_count: u64,
    pub write_count: u64,
    /// Notifications discarded because a subscriber queue was full
    pub dropped_notifications: u64,
    pub start_time: DateTime<Utc>,
}

/// Variable Store
///
/// Authoritative live cache shared by adapters (writers) and consumers such
/// as the alarm engine (readers and subscribers). All operations are safe for
/// concurrent use and never block on subscriber callbacks.
///
/// Implementations:
/// - `MemoryStore`: sharded in-memory backend
pub trait VariableStore: Send + Sync + 'static {
    // ========== Introspection ==========

    /// Allow downcasting to concrete types
    fn as_any(&self) -> &dyn Any;

    // ========== Reads ==========

    /// Read one variable; unknown IDs fail with `NotFound`
    fn read_var(&self, id: u64) -> GatewayResult<Variable>;

    /// Consistent snapshot of several variables
    ///
    /// Unknown IDs are skipped; the result keeps request order.
    fn read_vars(&self, ids: &[u64]) -> GatewayResult<Vec<Variable>>;

    fn read_var_by_string_id(&self, string_id: &str) -> GatewayResult<Variable>;

    fn list_variables(&self) -> Vec<Variable>;

    fn list_variables_by_device(&self, device_id: &str) -> Vec<Variable>;

    // ========== Writes ==========

    /// Update value, quality and timestamp, then fan out to subscribers
    ///
    /// Unknown IDs are created (upsert).
    fn write_var(&self, variable: Variable) -> GatewayResult<()>;

    /// Write a batch; ID and string-ID conflicts are rejected before any
    /// variable is written
    fn write_vars(&self, variables: Vec<Variable>) -> GatewayResult<()>;

    /// Create a variable; ID 0 allocates one from the custom range
    ///
    /// Returns the assigned ID.
    fn create_variable(&self, variable: Variable) -> GatewayResult<u64>;

    fn delete_variable(&self, id: u64) -> GatewayResult<()>;

    // ========== Pub/Sub ==========

    fn subscribe_selector(
        &self,
        subscriber: &str,
        selector: Selector,
        callback: UpdateCallback,
    ) -> GatewayResult<()>;

    fn subscribe(&self, subscriber: &str, ids: &[u64], callback: UpdateCallback) -> GatewayResult<()> {
        self.subscribe_selector(subscriber, Selector::Ids(ids.to_vec()), callback)
    }

    fn subscribe_by_device(
        &self,
        subscriber: &str,
        device_id: &str,
        callback: UpdateCallback,
    ) -> GatewayResult<()> {
        self.subscribe_selector(subscriber, Selector::Device(device_id.to_string()), callback)
    }

    fn subscribe_by_pattern(
        &self,
        subscriber: &str,
        pattern: &str,
        callback: UpdateCallback,
    ) -> GatewayResult<()> {
        self.subscribe_selector(subscriber, Selector::Pattern(pattern.to_string()), callback)
    }

    /// Remove the given IDs from the subscriber's exact-ID subscriptions
    fn unsubscribe(&self, subscriber: &str, ids: &[u64]) -> GatewayResult<()>;

    /// Remove every subscription of the subscriber at once
    fn unsubscribe_all(&self, subscriber: &str) -> GatewayResult<()>;

    // ========== Observability ==========

    fn stats(&self) -> StoreStats;
}
