//! Subscription registry and notification delivery
//!
//! Every subscription owns a bounded queue and a delivery task. Publishing
//! only does `try_send` into the matching queues, so a slow callback can
//! never stall the writer. A full queue drops the update and counts it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};

use errors::{panic_message, GatewayError, GatewayResult};
use iotgate_model::VariableUpdate;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::matcher::{CompiledPattern, PatternSet};
use crate::traits::{Selector, UpdateCallback};

enum Target {
    Ids(FxHashSet<u64>),
    Device(String),
    Pattern(CompiledPattern),
}

struct Subscription {
    subscriber: String,
    target: Target,
    tx: mpsc::Sender<VariableUpdate>,
}

#[derive(Default)]
struct SubscriptionIndex {
    subscriptions: FxHashMap<u64, Subscription>,
    by_subscriber: HashMap<String, Vec<u64>>,
    by_id: FxHashMap<u64, Vec<u64>>,
    by_device: HashMap<String, Vec<u64>>,
    patterns: PatternSet,
}

fn remove_owner<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, Vec<u64>, impl std::hash::BuildHasher>,
    key: &K,
    sub_id: u64,
) {
    if let Some(owners) = map.get_mut(key) {
        owners.retain(|&s| s != sub_id);
        if owners.is_empty() {
            map.remove(key);
        }
    }
}

impl SubscriptionIndex {
    fn rebuild_patterns(&mut self) -> GatewayResult<()> {
        let mut entries: Vec<(u64, &CompiledPattern)> = self
            .subscriptions
            .iter()
            .filter_map(|(id, sub)| match &sub.target {
                Target::Pattern(p) => Some((*id, p)),
                _ => None,
            })
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        self.patterns = PatternSet::build(entries)?;
        Ok(())
    }

    /// Detach a subscription from every index; dropping it closes its queue
    fn remove(&mut self, sub_id: u64) -> Option<Subscription> {
        let sub = self.subscriptions.remove(&sub_id)?;
        match &sub.target {
            Target::Ids(ids) => {
                for id in ids {
                    remove_owner(&mut self.by_id, id, sub_id);
                }
            },
            Target::Device(device) => remove_owner(&mut self.by_device, device, sub_id),
            Target::Pattern(_) => {},
        }
        remove_owner(&mut self.by_subscriber, &sub.subscriber, sub_id);
        Some(sub)
    }
}

pub(crate) struct PubSub {
    index: RwLock<SubscriptionIndex>,
    next_id: AtomicU64,
    queue_capacity: usize,
    dropped: AtomicU64,
}

impl PubSub {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            index: RwLock::new(SubscriptionIndex::default()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(
        &self,
        subscriber: &str,
        selector: Selector,
        callback: UpdateCallback,
    ) -> GatewayResult<()> {
        if subscriber.is_empty() {
            return Err(GatewayError::invalid_parameter(
                "subscriber",
                "subscriber ID must not be empty",
            ));
        }

        // Compile before touching the index so a bad pattern leaves no trace
        let target = match selector {
            Selector::Ids(ids) => {
                if ids.is_empty() {
                    return Err(GatewayError::invalid_parameter(
                        "ids",
                        "at least one variable ID is required",
                    ));
                }
                Target::Ids(ids.into_iter().collect())
            },
            Selector::Device(device) => {
                if device.is_empty() {
                    return Err(GatewayError::invalid_parameter(
                        "device_id",
                        "device ID must not be empty",
                    ));
                }
                Target::Device(device)
            },
            Selector::Pattern(pattern) => Target::Pattern(CompiledPattern::compile(&pattern)?),
        };

        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            GatewayError::Internal("subscribe requires a running Tokio runtime".to_string())
        })?;

        let sub_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let is_pattern = matches!(target, Target::Pattern(_));

        {
            let mut index = self.index.write();
            match &target {
                Target::Ids(ids) => {
                    for id in ids {
                        index.by_id.entry(*id).or_default().push(sub_id);
                    }
                },
                Target::Device(device) => {
                    index.by_device.entry(device.clone()).or_default().push(sub_id);
                },
                Target::Pattern(_) => {},
            }
            index
                .by_subscriber
                .entry(subscriber.to_string())
                .or_default()
                .push(sub_id);
            index.subscriptions.insert(
                sub_id,
                Subscription {
                    subscriber: subscriber.to_string(),
                    target,
                    tx,
                },
            );
            if is_pattern {
                if let Err(e) = index.rebuild_patterns() {
                    index.remove(sub_id);
                    return Err(e);
                }
            }
        }

        let label = format!("{}#{}", subscriber, sub_id);
        debug!("Subscription {} registered", label);
        handle.spawn(deliver(label, rx, callback));
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, subscriber: &str, ids: &[u64]) -> GatewayResult<()> {
        let mut guard = self.index.write();
        let index = &mut *guard;
        let owned = index
            .by_subscriber
            .get(subscriber)
            .cloned()
            .unwrap_or_default();

        for sub_id in owned {
            let emptied = {
                let Some(sub) = index.subscriptions.get_mut(&sub_id) else {
                    continue;
                };
                let Target::Ids(set) = &mut sub.target else {
                    continue;
                };
                let mut removed = Vec::new();
                for id in ids {
                    if set.remove(id) {
                        removed.push(*id);
                    }
                }
                set.shrink_to_fit();
                let emptied = set.is_empty();
                for id in removed {
                    remove_owner(&mut index.by_id, &id, sub_id);
                }
                emptied
            };
            if emptied {
                index.remove(sub_id);
            }
        }
        Ok(())
    }

    pub(crate) fn unsubscribe_all(&self, subscriber: &str) -> GatewayResult<()> {
        let mut index = self.index.write();
        let owned = index.by_subscriber.remove(subscriber).unwrap_or_default();
        let mut had_pattern = false;
        for sub_id in owned {
            if let Some(sub) = index.remove(sub_id) {
                had_pattern |= matches!(sub.target, Target::Pattern(_));
            }
        }
        if had_pattern {
            index.rebuild_patterns()?;
        }
        Ok(())
    }

    /// Enqueue an update for every matching subscription
    ///
    /// Called with the variable's shard lock held, which keeps per-variable
    /// order intact within each queue.
    pub(crate) fn publish(&self, update: &VariableUpdate) {
        let index = self.index.read();
        if index.subscriptions.is_empty() {
            return;
        }

        let mut matched: Vec<u64> = Vec::new();
        if let Some(owners) = index.by_id.get(&update.variable_id) {
            matched.extend_from_slice(owners);
        }
        if !update.device_id.is_empty() {
            if let Some(owners) = index.by_device.get(&update.device_id) {
                matched.extend_from_slice(owners);
            }
        }
        if !update.string_id.is_empty() && !index.patterns.is_empty() {
            matched.extend(index.patterns.matches(&update.string_id));
        }

        for sub_id in matched {
            let Some(sub) = index.subscriptions.get(&sub_id) else {
                continue;
            };
            match sub.tx.try_send(update.clone()) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Notify queue full, dropping update of var {} for {}#{}",
                        update.variable_id, sub.subscriber, sub_id
                    );
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {},
            }
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.index.read().by_subscriber.len()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.index.read().subscriptions.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain one subscription's queue until it is closed
async fn deliver(label: String, mut rx: mpsc::Receiver<VariableUpdate>, callback: UpdateCallback) {
    while let Some(update) = rx.recv().await {
        let var_id = update.variable_id;
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(update))) {
            error!(
                "Subscription callback panicked: {} (var {}): {}",
                label,
                var_id,
                panic_message(panic.as_ref())
            );
        }
    }
    debug!("Subscription {} closed", label);
}
