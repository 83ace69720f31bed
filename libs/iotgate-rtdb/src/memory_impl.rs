//! Sharded in-memory variable store
//!
//! Variables live in 64 `RwLock` shards keyed by `id % 64`. A `DashMap`
//! indexes string IDs. Lock order is always shard, then subscription index,
//! then string index; batch reads take shard locks in ascending order.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use errors::{GatewayError, GatewayResult};
use iotgate_model::{IdGenerator, Variable};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::debug;

use crate::pubsub::PubSub;
use crate::traits::{Selector, StoreStats, UpdateCallback, VariableStore};

const SHARD_COUNT: usize = 64;

/// Default per-subscription notify queue depth
pub const DEFAULT_NOTIFY_QUEUE_CAPACITY: usize = 1024;

fn default_notify_queue_capacity() -> usize {
    DEFAULT_NOTIFY_QUEUE_CAPACITY
}

/// Store tuning
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Per-subscription queue depth; updates beyond it are dropped
    #[serde(default = "default_notify_queue_capacity")]
    pub notify_queue_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            notify_queue_capacity: DEFAULT_NOTIFY_QUEUE_CAPACITY,
        }
    }
}

type Shard = RwLock<FxHashMap<u64, Variable>>;

/// In-memory variable store with concurrent access support
pub struct MemoryStore {
    shards: Vec<Shard>,
    string_index: DashMap<String, u64>,
    ids: IdGenerator,
    pubsub: PubSub,
    variable_count: AtomicUsize,
    read_count: AtomicU64,
    write_count: AtomicU64,
    start_time: DateTime<Utc>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(FxHashMap::default()))
                .collect(),
            string_index: DashMap::new(),
            ids: IdGenerator::new(),
            pubsub: PubSub::new(config.notify_queue_capacity),
            variable_count: AtomicUsize::new(0),
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            start_time: Utc::now(),
        }
    }

    fn shard_index(id: u64) -> usize {
        (id % SHARD_COUNT as u64) as usize
    }

    fn shard(&self, id: u64) -> &Shard {
        &self.shards[Self::shard_index(id)]
    }

    /// Point `string_id` at `id`; fails if another variable owns it
    fn claim_string_id(&self, string_id: &str, id: u64) -> GatewayResult<()> {
        match self.string_index.entry(string_id.to_string()) {
            Entry::Occupied(entry) if *entry.get() != id => Err(GatewayError::AlreadyExists(
                format!("string ID {} (owned by {})", string_id, entry.get()),
            )),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(id);
                Ok(())
            },
        }
    }

    fn release_string_id(&self, string_id: &str, id: u64) {
        self.string_index
            .remove_if(string_id, |_, owner| *owner == id);
    }

    /// Every string-ID claim in a batch must succeed before anything is written
    fn check_batch_string_ids(&self, variables: &[Variable]) -> GatewayResult<()> {
        let mut claims: FxHashMap<&str, u64> = FxHashMap::default();
        for (pos, variable) in variables.iter().enumerate() {
            if variable.string_id.is_empty() {
                continue;
            }
            let sid = variable.string_id.as_str();
            if let Some(&other) = claims.get(sid) {
                if other != variable.id {
                    return Err(GatewayError::invalid_parameter(
                        format!("variables[{}].string_id", pos),
                        format!("{} is also claimed by {} in the same batch", sid, other),
                    ));
                }
            }
            claims.insert(sid, variable.id);

            if let Some(owner) = self.string_index.get(sid) {
                if *owner != variable.id {
                    return Err(GatewayError::AlreadyExists(format!(
                        "string ID {} (owned by {})",
                        sid,
                        *owner
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_write(variable: &Variable) -> GatewayResult<()> {
        if variable.id == 0 {
            return Err(GatewayError::invalid_parameter(
                "id",
                "variable ID must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore for MemoryStore {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn read_var(&self, id: u64) -> GatewayResult<Variable> {
        let variable = self
            .shard(id)
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("variable {}", id)))?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(variable)
    }

    fn read_vars(&self, ids: &[u64]) -> GatewayResult<Vec<Variable>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut shard_ids: Vec<usize> = ids.iter().map(|id| Self::shard_index(*id)).collect();
        shard_ids.sort_unstable();
        shard_ids.dedup();

        // Hold every involved shard at once for a consistent snapshot
        let guards: FxHashMap<usize, _> = shard_ids
            .into_iter()
            .map(|idx| (idx, self.shards[idx].read()))
            .collect();

        let result = ids
            .iter()
            .filter_map(|id| {
                guards
                    .get(&Self::shard_index(*id))
                    .and_then(|shard| shard.get(id).cloned())
            })
            .collect();
        drop(guards);

        self.read_count
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
        Ok(result)
    }

    fn read_var_by_string_id(&self, string_id: &str) -> GatewayResult<Variable> {
        let id = self
            .string_index
            .get(string_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| GatewayError::not_found(format!("variable {}", string_id)))?;
        self.read_var(id)
    }

    fn list_variables(&self) -> Vec<Variable> {
        let mut all = Vec::with_capacity(self.variable_count.load(Ordering::Relaxed));
        for shard in &self.shards {
            all.extend(shard.read().values().cloned());
        }
        all.sort_unstable_by_key(|v| v.id);
        all
    }

    fn list_variables_by_device(&self, device_id: &str) -> Vec<Variable> {
        let mut matched = Vec::new();
        for shard in &self.shards {
            matched.extend(
                shard
                    .read()
                    .values()
                    .filter(|v| v.device_id == device_id)
                    .cloned(),
            );
        }
        matched.sort_unstable_by_key(|v| v.id);
        matched
    }

    fn write_var(&self, variable: Variable) -> GatewayResult<()> {
        Self::validate_write(&variable)?;
        let id = variable.id;
        let mut shard = self.shard(id).write();

        let update = match shard.get_mut(&id) {
            Some(existing) => {
                if !variable.string_id.is_empty() && variable.string_id != existing.string_id {
                    self.claim_string_id(&variable.string_id, id)?;
                    if !existing.string_id.is_empty() {
                        self.release_string_id(&existing.string_id, id);
                    }
                    existing.string_id = variable.string_id;
                }
                if !variable.device_id.is_empty() {
                    existing.device_id = variable.device_id;
                }
                existing.value = variable.value;
                existing.quality = variable.quality;
                existing.timestamp = variable.timestamp;
                existing.to_update()
            },
            None => {
                if !variable.string_id.is_empty() {
                    self.claim_string_id(&variable.string_id, id)?;
                }
                self.ids.mark_used(id);
                self.variable_count.fetch_add(1, Ordering::Relaxed);
                debug!("Variable {} created on first write", id);
                let update = variable.to_update();
                shard.insert(id, variable);
                update
            },
        };

        self.pubsub.publish(&update);
        drop(shard);

        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_vars(&self, variables: Vec<Variable>) -> GatewayResult<()> {
        if let Some(pos) = variables.iter().position(|v| v.id == 0) {
            return Err(GatewayError::invalid_parameter(
                format!("variables[{}].id", pos),
                "variable ID must be non-zero",
            ));
        }
        self.check_batch_string_ids(&variables)?;
        for variable in variables {
            self.write_var(variable)?;
        }
        Ok(())
    }

    fn create_variable(&self, mut variable: Variable) -> GatewayResult<u64> {
        let allocated = variable.id == 0;
        if allocated {
            variable.id = self.ids.next_custom_id()?;
        }
        let id = variable.id;

        let mut shard = self.shard(id).write();
        let outcome = if shard.contains_key(&id) {
            Err(GatewayError::AlreadyExists(format!("variable {}", id)))
        } else if !variable.string_id.is_empty() {
            self.claim_string_id(&variable.string_id, id)
        } else {
            Ok(())
        };

        if let Err(e) = outcome {
            if allocated {
                self.ids.release(id);
            }
            return Err(e);
        }

        self.ids.mark_used(id);
        shard.insert(id, variable);
        self.variable_count.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn delete_variable(&self, id: u64) -> GatewayResult<()> {
        let removed = self
            .shard(id)
            .write()
            .remove(&id)
            .ok_or_else(|| GatewayError::not_found(format!("variable {}", id)))?;

        if !removed.string_id.is_empty() {
            self.release_string_id(&removed.string_id, id);
        }
        self.ids.release(id);
        self.variable_count.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe_selector(
        &self,
        subscriber: &str,
        selector: Selector,
        callback: UpdateCallback,
    ) -> GatewayResult<()> {
        self.pubsub.subscribe(subscriber, selector, callback)
    }

    fn unsubscribe(&self, subscriber: &str, ids: &[u64]) -> GatewayResult<()> {
        self.pubsub.unsubscribe(subscriber, ids)
    }

    fn unsubscribe_all(&self, subscriber: &str) -> GatewayResult<()> {
        self.pubsub.unsubscribe_all(subscriber)
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            total_variables: self.variable_count.load(Ordering::Relaxed),
            total_subscribers: self.pubsub.subscriber_count(),
            total_subscriptions: self.pubsub.subscription_count(),
            read_count: self.read_count.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            dropped_notifications: self.pubsub.dropped(),
            start_time: self.start_time,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use iotgate_model::{DataType, Quality, Value, MIN_CUSTOM_ID};

    fn var(id: u64, sid: &str) -> Variable {
        Variable::new(id, sid, DataType::Float64).with_device("PLC001")
    }

    #[test]
    fn test_read_unknown_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.read_var(42), Err(GatewayError::NotFound { .. })));
        assert!(store.read_var_by_string_id("DV-X-Y").is_err());
    }

    #[test]
    fn test_write_upserts_and_keeps_metadata() {
        let store = MemoryStore::new();
        let mut initial = var(1001, "DV-PLC001-TEMP");
        initial.unit = "C".into();
        store.create_variable(initial).unwrap();

        let mut update = Variable::new(1001, "", DataType::Float64).with_value(30.5);
        update.quality = Quality::Uncertain;
        store.write_var(update).unwrap();

        let read = store.read_var(1001).unwrap();
        assert_eq!(read.value, Value::Float(30.5));
        assert_eq!(read.quality, Quality::Uncertain);
        assert_eq!(read.unit, "C");
        assert_eq!(read.string_id, "DV-PLC001-TEMP");
        assert_eq!(read.device_id, "PLC001");

        store.write_var(var(2002, "DV-PLC001-NEW").with_value(1i64)).unwrap();
        assert_eq!(store.read_var_by_string_id("DV-PLC001-NEW").unwrap().id, 2002);
        assert_eq!(store.stats().total_variables, 2);
        assert_eq!(store.stats().write_count, 2);
    }

    #[test]
    fn test_write_rejects_zero_id() {
        let store = MemoryStore::new();
        assert!(store.write_var(var(0, "DV-A-B")).is_err());

        let batch = vec![var(5, "DV-A-5"), var(0, "DV-A-0"), var(6, "DV-A-6")];
        let err = store.write_vars(batch).unwrap_err();
        assert!(err.to_string().contains("variables[1].id"));
        assert!(store.read_var(5).is_err());
    }

    #[test]
    fn test_write_vars_string_id_conflict_writes_nothing() {
        let store = MemoryStore::new();
        store.create_variable(var(1, "DV-PLC001-X")).unwrap();
        let writes = store.stats().write_count;

        let batch = vec![var(2, "DV-PLC001-Y").with_value(1.0), var(3, "DV-PLC001-X").with_value(2.0)];
        assert!(matches!(
            store.write_vars(batch),
            Err(GatewayError::AlreadyExists(_))
        ));
        assert!(store.read_var(2).is_err());
        assert!(store.read_var_by_string_id("DV-PLC001-Y").is_err());
        assert!(store.read_var(3).is_err());
        assert_eq!(store.stats().write_count, writes);

        // Two entries fighting over one string ID inside the batch
        let batch = vec![var(4, "DV-PLC001-Z"), var(5, "DV-PLC001-Z")];
        let err = store.write_vars(batch).unwrap_err();
        assert!(err.to_string().contains("variables[1].string_id"));
        assert!(store.read_var(4).is_err());

        // The owner rewriting its own string ID is fine
        store
            .write_vars(vec![var(1, "DV-PLC001-X").with_value(3.0), var(6, "DV-PLC001-W")])
            .unwrap();
        assert_eq!(store.read_var(1).unwrap().value, Value::Float(3.0));
        assert_eq!(store.read_var_by_string_id("DV-PLC001-W").unwrap().id, 6);
    }

    #[test]
    fn test_create_assigns_custom_ids_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let id = store.create_variable(var(0, "DV-PLC001-A")).unwrap();
        assert!(id >= MIN_CUSTOM_ID);

        assert!(matches!(
            store.create_variable(var(id, "DV-PLC001-OTHER")),
            Err(GatewayError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.create_variable(var(0, "DV-PLC001-A")),
            Err(GatewayError::AlreadyExists(_))
        ));
        assert_eq!(store.stats().total_variables, 1);
    }

    #[test]
    fn test_delete_releases_string_id() {
        let store = MemoryStore::new();
        store.create_variable(var(77, "DV-PLC001-X")).unwrap();
        store.delete_variable(77).unwrap();
        assert!(store.read_var_by_string_id("DV-PLC001-X").is_err());
        assert!(store.delete_variable(77).is_err());
        store.create_variable(var(78, "DV-PLC001-X")).unwrap();
        assert_eq!(store.stats().total_variables, 1);
    }

    #[test]
    fn test_read_vars_skips_unknown_and_keeps_order() {
        let store = MemoryStore::new();
        for id in [3u64, 67, 131] {
            store.write_var(var(id, &format!("DV-PLC001-V{}", id))).unwrap();
        }
        let got: Vec<u64> = store
            .read_vars(&[131, 999, 3, 67])
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(got, vec![131, 3, 67]);
        assert_eq!(store.stats().read_count, 4);
    }

    #[test]
    fn test_list_by_device() {
        let store = MemoryStore::new();
        store.write_var(var(1, "DV-PLC001-A")).unwrap();
        store.write_var(Variable::new(2, "DV-PLC002-A", DataType::Bool).with_device("PLC002")).unwrap();
        store.write_var(var(3, "DV-PLC001-B")).unwrap();
        let ids: Vec<u64> = store.list_variables_by_device("PLC001").iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(store.list_variables().len(), 3);
    }
}
