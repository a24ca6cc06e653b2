// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thread-safe ordered map with callback access.
//!
//! Locking contract:
//! - the tree *shape* is guarded by a [`SharedLock`]: lookups and walks take
//!   it shared, insertions and deletions take it exclusively;
//! - every value has its own mutex, taken for the duration of a callback, so
//!   readers of different keys proceed in parallel inside the shared section.
//!
//! Values are never handed out by reference outside a callback. Callbacks must
//! not call back into the same map.

mod llrb;

pub use llrb::Comparator;

use crate::shared_lock::SharedLock;
use llrb::{Tree, Upsert};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use thiserror::Error;

/// Ordered-map errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// The value constructor declined; the map was left unchanged.
    #[error("unresolvable insert: value construction declined")]
    Unresolvable,
}

pub struct OrderedMap<K, V> {
    tree: SharedLock<Tree<K, V>>,
    count: AtomicUsize,
}

impl<K: Ord + Clone, V> OrderedMap<K, V> {
    pub fn new() -> Self {
        Self::with_comparator(K::cmp)
    }
}

impl<K: Ord + Clone, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone, V> OrderedMap<K, V> {
    /// Map ordered by `cmp` instead of `Ord`.
    pub fn with_comparator(cmp: Comparator<K>) -> Self {
        Self {
            tree: SharedLock::new(Tree::new(cmp)),
            count: AtomicUsize::new(0),
        }
    }

    /// Run `f` on the value stored under `key`.
    ///
    /// Returns `None` when the key is absent.
    pub fn find<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let tree = self.tree.read();
        let node = tree.get(key)?;
        let mut value = node.value.lock();
        Some(f(&mut value))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.tree.read().get(key).is_some()
    }

    /// Insert a new value or update the existing one in place.
    ///
    /// `new_fn` builds the value (and the result) for an absent key; returning
    /// `None` leaves the map untouched and yields [`MapError::Unresolvable`].
    /// `existing_fn` receives the stored value and may mutate or replace it.
    pub fn insert_or_update<R>(
        &self,
        key: &K,
        new_fn: impl FnOnce() -> Option<(V, R)>,
        existing_fn: impl FnOnce(&mut V) -> R,
    ) -> Result<R, MapError> {
        let mut tree = self.tree.write();
        match tree.upsert(key, new_fn, existing_fn) {
            Upsert::Inserted(r) => {
                self.count.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(r)
            }
            Upsert::Updated(r) => Ok(r),
            Upsert::Declined => Err(MapError::Unresolvable),
        }
    }

    /// Store `value`, returning the value it replaced.
    pub fn insert(&self, key: &K, value: V) -> Option<V> {
        let mut tree = self.tree.write();
        if let Some(node) = tree.get_mut(key) {
            return Some(std::mem::replace(node.value.get_mut(), value));
        }
        if let Upsert::Inserted(()) = tree.upsert(key, || Some((value, ())), |_| ()) {
            self.count.fetch_add(1, AtomicOrdering::Relaxed);
        }
        None
    }

    /// Run `f` once for every stored key found in `keys`, in key order.
    ///
    /// The lookup keys are sorted first and the tree is descended once,
    /// splitting the key set at every node. Returns the number of hits.
    pub fn batch_find(&self, keys: &[K], mut f: impl FnMut(&K, &mut V)) -> usize {
        let tree = self.tree.read();
        let cmp = tree.comparator();
        let mut sorted: Vec<&K> = keys.iter().collect();
        sorted.sort_by(|a, b| cmp(a, b));

        let mut hits = 0;
        tree.batch(&sorted, |key, value| {
            hits += 1;
            f(key, &mut value.lock());
        });
        hits
    }

    /// In-order traversal under the shared lock.
    pub fn walk(&self, mut f: impl FnMut(&K, &mut V)) {
        let tree = self.tree.read();
        tree.walk(|key, value| f(key, &mut value.lock()));
    }

    /// Remove every entry for which `predicate` returns true.
    ///
    /// Keys are collected during a traversal under the shared lock and
    /// unlinked afterwards in one exclusive batch; rebalancing while iterating
    /// would invalidate the walk. In the batch `predicate` runs again on each
    /// collected entry and only a second `true` removes it, so an entry
    /// updated between the phases survives.
    pub fn walk_and_delete(&self, mut predicate: impl FnMut(&K, &mut V) -> bool) -> Vec<(K, V)> {
        let mut doomed = Vec::new();
        self.tree.read().walk(|key, value| {
            if predicate(key, &mut value.lock()) {
                doomed.push(key.clone());
            }
        });
        if doomed.is_empty() {
            return Vec::new();
        }

        let mut tree = self.tree.write();
        let mut removed = Vec::with_capacity(doomed.len());
        for key in doomed {
            let confirmed = match tree.get_mut(&key) {
                Some(node) => predicate(&key, node.value.get_mut()),
                None => false,
            };
            if !confirmed {
                continue;
            }
            if let Some(entry) = tree.remove(&key) {
                self.count.fetch_sub(1, AtomicOrdering::Relaxed);
                removed.push(entry);
            }
        }
        removed
    }

    /// Conditional delete: `predicate` sees the value and may veto removal.
    ///
    /// Returns the removed value, or `None` if absent or vetoed.
    pub fn delete(&self, key: &K, predicate: impl FnOnce(&mut V) -> bool) -> Option<V> {
        let mut tree = self.tree.write();
        let approved = {
            let node = tree.get_mut(key)?;
            predicate(node.value.get_mut())
        };
        if !approved {
            return None;
        }
        let (_, value) = tree.remove(key)?;
        self.count.fetch_sub(1, AtomicOrdering::Relaxed);
        Some(value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.delete(key, |_| true)
    }

    /// Number of live keys; maintained on structural changes only.
    pub fn count(&self) -> usize {
        self.count.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        let tree = self.tree.read();
        let mut keys = Vec::with_capacity(self.count());
        tree.walk(|key, _| keys.push(key.clone()));
        keys
    }

    /// Shape of the tree as `(key B|R)[left][right]`.
    pub fn dump(&self) -> String
    where
        K: fmt::Display,
    {
        self.tree.read().dump()
    }

    /// Key order used by this map.
    pub fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.tree.read().comparator())(a, b)
    }
}

impl<K, V> fmt::Debug for OrderedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMap")
            .field("count", &self.count.load(AtomicOrdering::Relaxed))
            .finish_non_exhaustive()
    }
}
