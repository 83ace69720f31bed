//! Shared adapter bookkeeping
//!
//! Every concrete adapter embeds an [`AdapterBase`] for its connection
//! state, last error, reconnect budget and read/write counters. Counters are
//! atomics so stats can be sampled while I/O is in flight.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use errors::{GatewayError, GatewayResult};
use iotgate_model::{Device, Variable};
use iotgate_rtdb::VariableStore;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of reconnect attempts before giving up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default reconnect backoff unit; attempt N waits N times this
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Connection state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Update sink
// ============================================================================

/// Per-value hook invoked by adapters for every inbound value
pub type UpdateCallback = Arc<dyn Fn(&Variable) + Send + Sync>;

/// Where inbound values go besides the adapter's own cache
#[derive(Clone, Default)]
pub struct UpdateSink {
    store: Option<Arc<dyn VariableStore>>,
    callback: Option<UpdateCallback>,
}

impl UpdateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn VariableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_callback(mut self, callback: UpdateCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_none() && self.callback.is_none()
    }

    /// Write to the store (if any), then run the callback (if any)
    ///
    /// Store failures are logged; they never fail the adapter operation.
    pub fn deliver(&self, variable: &Variable) {
        if let Some(store) = &self.store {
            if let Err(e) = store.write_var(variable.clone()) {
                warn!("Store write of var {} failed: {}", variable.id, e);
            }
        }
        if let Some(callback) = &self.callback {
            callback(variable);
        }
    }
}

impl fmt::Debug for UpdateSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateSink")
            .field("store", &self.store.is_some())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Adapter counters and last error, sampled without blocking I/O
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStats {
    pub device_id: String,
    pub protocol: String,
    pub state: ConnectionState,
    pub total_reads: u64,
    pub success_reads: u64,
    pub failed_reads: u64,
    pub total_writes: u64,
    pub success_writes: u64,
    pub failed_writes: u64,
    pub reconnect_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct LastError {
    message: String,
    at: DateTime<Utc>,
}

// ============================================================================
// AdapterBase
// ============================================================================

pub struct AdapterBase {
    protocol: &'static str,
    device: RwLock<Device>,
    state: AtomicU8,
    last_error: RwLock<Option<LastError>>,
    reconnect_count: AtomicU32,
    max_reconnect_attempts: u32,
    reconnect_base_delay: Duration,
    success_reads: AtomicU64,
    failed_reads: AtomicU64,
    success_writes: AtomicU64,
    failed_writes: AtomicU64,
    sink: RwLock<UpdateSink>,
}

impl AdapterBase {
    pub fn new(protocol: &'static str, device: Device) -> Self {
        Self {
            protocol,
            device: RwLock::new(device),
            state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
            last_error: RwLock::new(None),
            reconnect_count: AtomicU32::new(0),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            success_reads: AtomicU64::new(0),
            failed_reads: AtomicU64::new(0),
            success_writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            sink: RwLock::new(UpdateSink::default()),
        }
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn device(&self) -> Device {
        self.device.read().clone()
    }

    pub fn device_id(&self) -> String {
        self.device.read().id.clone()
    }

    /// Replace the device definition, e.g. on `connect` with a new one
    pub fn set_device(&self, device: &Device) {
        *self.device.write() = device.clone();
    }

    // ========== State ==========

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn set_state(&self, next: ConnectionState) {
        let prev = ConnectionState::from_u8(self.state.swap(next.to_u8(), Ordering::AcqRel));
        if prev != next {
            debug!(
                "Adapter {} ({}) state {} -> {}",
                self.device_id(),
                self.protocol,
                prev,
                next
            );
        }
    }

    /// Connected and the reconnect budget restored
    pub fn mark_connected(&self) {
        self.reconnect_count.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
        info!("Adapter {} ({}) connected", self.device_id(), self.protocol);
    }

    /// Connection-level failure: record it and drop to Disconnected
    pub fn mark_disconnected(&self, reason: impl fmt::Display) {
        self.set_last_error(&reason);
        self.set_state(ConnectionState::Disconnected);
    }

    // ========== Errors ==========

    pub fn set_last_error(&self, err: &dyn fmt::Display) {
        let message = err.to_string();
        warn!(
            "Adapter {} ({}) error: {}",
            self.device_id(),
            self.protocol,
            message
        );
        *self.last_error.write() = Some(LastError {
            message,
            at: Utc::now(),
        });
    }

    pub fn last_error(&self) -> Option<(String, DateTime<Utc>)> {
        self.last_error
            .read()
            .as_ref()
            .map(|e| (e.message.clone(), e.at))
    }

    /// Fail fast when not connected
    pub fn ensure_connected(&self) -> GatewayResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::NotConnected(format!(
                "device {} ({})",
                self.device_id(),
                self.protocol
            )))
        }
    }

    // ========== Reconnect ==========

    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay * attempt
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }

    /// Consume one reconnect attempt and return how long to wait before it
    pub fn begin_reconnect(&self) -> GatewayResult<Duration> {
        let attempt = self.reconnect_count.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt > self.max_reconnect_attempts {
            self.reconnect_count
                .store(self.max_reconnect_attempts, Ordering::Relaxed);
            return Err(GatewayError::MaxReconnectAttempts {
                attempts: self.max_reconnect_attempts,
            });
        }
        info!(
            "Reconnecting device {} (attempt {}/{})",
            self.device_id(),
            attempt,
            self.max_reconnect_attempts
        );
        Ok(self.reconnect_delay(attempt))
    }

    // ========== Counters ==========

    pub fn record_read(&self, success: bool) {
        if success {
            self.success_reads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_reads.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_write(&self, success: bool) {
        if success {
            self.success_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ========== Sink ==========

    pub fn set_sink(&self, sink: UpdateSink) {
        *self.sink.write() = sink;
    }

    pub fn sink(&self) -> UpdateSink {
        self.sink.read().clone()
    }

    pub fn stats(&self) -> AdapterStats {
        let success_reads = self.success_reads.load(Ordering::Relaxed);
        let failed_reads = self.failed_reads.load(Ordering::Relaxed);
        let success_writes = self.success_writes.load(Ordering::Relaxed);
        let failed_writes = self.failed_writes.load(Ordering::Relaxed);
        let last_error = self.last_error();
        AdapterStats {
            device_id: self.device_id(),
            protocol: self.protocol.to_string(),
            state: self.state(),
            total_reads: success_reads + failed_reads,
            success_reads,
            failed_reads,
            total_writes: success_writes + failed_writes,
            success_writes,
            failed_writes,
            reconnect_count: self.reconnect_count(),
            last_error_time: last_error.as_ref().map(|(_, at)| *at),
            last_error: last_error.map(|(message, _)| message),
        }
    }
}

impl fmt::Debug for AdapterBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterBase")
            .field("protocol", &self.protocol)
            .field("device_id", &self.device_id())
            .field("state", &self.state())
            .finish()
    }
}

/// An adapter's I/O loop and the token that stops it
pub(crate) struct BackgroundTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub(crate) fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(body(cancel.clone()));
        Self { cancel, handle }
    }

    /// Cancel and wait until the loop has exited
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        Self::join(self.handle).await;
    }

    /// Let the loop finish on its own for up to `grace`, then cancel it
    pub(crate) async fn stop_after(mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.handle).await.is_ok() {
            return;
        }
        self.cancel.cancel();
        Self::join(self.handle).await;
    }

    async fn join(handle: JoinHandle<()>) {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!("Adapter background task panicked: {}", e);
            }
        }
    }
}

/// JSON body published or POSTed by `write_variable`
pub fn write_envelope(variable_id: u64, value: &iotgate_model::Value) -> serde_json::Value {
    serde_json::json!({
        "variableID": variable_id,
        "value": value.to_json(),
        "timestamp": Utc::now().timestamp(),
    })
}
