//! IoT Gateway Realtime Variable Store
//!
//! Authoritative live cache of every device variable, shared by protocol
//! adapters (writers) and consumers such as the alarm engine (readers and
//! subscribers).
//!
//! # Key Components
//!
//! - **VariableStore trait**: read/write/list/subscribe contract
//! - **MemoryStore**: 64-way sharded in-memory implementation
//! - **Selector**: exact IDs, device scope or string-ID pattern
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use iotgate_model::{DataType, Variable};
//! use iotgate_rtdb::{MemoryStore, VariableStore};
//!
//! # async fn demo() -> errors::GatewayResult<()> {
//! let store = MemoryStore::new();
//! store.subscribe_by_pattern("ui", "DV-PLC001-*", Arc::new(|u| println!("{:?}", u.value)))?;
//! store.write_var(Variable::new(1001, "DV-PLC001-TEMP", DataType::Float64).with_value(23.5))?;
//! # Ok(())
//! # }
//! ```

pub mod matcher;
pub mod memory_impl;
mod pubsub;
pub mod traits;

pub use matcher::{CompiledPattern, PatternKind};
pub use memory_impl::{MemoryStore, StoreConfig, DEFAULT_NOTIFY_QUEUE_CAPACITY};
pub use traits::{Selector, StoreStats, UpdateCallback, VariableStore};
