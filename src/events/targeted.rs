//! Targeted Signal

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::signal::{Slot, SubscriptionId};

struct TargetedSlot<K, T> {
    id: SubscriptionId,
    key: K,
    slot: Slot<T>,
}

/// Publish/subscribe channel scoped by a key.
///
/// `send_to` only invokes callbacks registered under the same key. The
/// manager keys it by listening-socket handle so each server only hears
/// about peers accepted on its own listener.
pub struct TargetedSignal<K, T> {
    slots: Arc<Mutex<Vec<TargetedSlot<K, T>>>>,
}

impl<K, T> TargetedSignal<K, T>
where
    K: PartialEq + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe a callback under `key`
    pub fn connect<F>(&self, key: K, slot: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.slots.lock().push(TargetedSlot {
            id,
            key,
            slot: Arc::new(slot),
        });
        id
    }

    /// Invoke the callbacks registered under `key`. Returns how many ran.
    pub fn send_to(&self, key: &K, value: &T) -> usize {
        let snapshot: Vec<Slot<T>> = self
            .slots
            .lock()
            .iter()
            .filter(|entry| entry.key == *key)
            .map(|entry| Arc::clone(&entry.slot))
            .collect();

        for slot in &snapshot {
            slot(value);
        }
        snapshot.len()
    }

    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|entry| entry.id != id);
        slots.len() != before
    }

    /// Drop every callback registered under `key`
    pub fn disconnect_key(&self, key: &K) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|entry| entry.key != *key);
        before - slots.len()
    }

    pub fn disconnect_all(&self) {
        self.slots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl<K, T> Default for TargetedSignal<K, T>
where
    K: PartialEq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Clone for TargetedSignal<K, T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K, T> fmt::Debug for TargetedSignal<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetedSignal")
            .field("subscribers", &self.slots.lock().len())
            .finish()
    }
}
