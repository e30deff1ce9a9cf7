//! NAT resolution
//!
//! Rewrites observed tuples to their translated form so both sides of a
//! translated connection converge on a single registry key.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::types::Tuple;

#[derive(Default)]
struct Table {
    forward: HashMap<Tuple, Tuple>,
    /// canonical tuple -> every key mapped to it
    reverse: HashMap<Tuple, HashSet<Tuple>>,
}

impl Table {
    fn insert_flattened(&mut self, from: Tuple, to: Tuple) {
        let target = self.forward.get(&to).copied().unwrap_or(to);
        if target == from {
            // The new mapping would close a cycle; the existing direction wins.
            return;
        }
        if let Some(sources) = self.reverse.remove(&from) {
            for source in &sources {
                self.forward.insert(*source, target);
            }
            self.reverse.entry(target).or_default().extend(sources);
        }
        if let Some(previous) = self.forward.insert(from, target) {
            self.unlink(&from, &previous);
        }
        self.reverse.entry(target).or_default().insert(from);
    }

    fn remove(&mut self, from: &Tuple) {
        if let Some(target) = self.forward.remove(from) {
            self.unlink(from, &target);
        }
    }

    fn unlink(&mut self, from: &Tuple, target: &Tuple) {
        if let Some(sources) = self.reverse.get_mut(target) {
            sources.remove(from);
            if sources.is_empty() {
                self.reverse.remove(target);
            }
        }
    }
}

/// Translation table populated from connection-tracking metadata
///
/// Every stored mapping points directly at a canonical tuple that is not
/// itself a key, so `canonicalize` is idempotent.
#[derive(Default)]
pub struct NatResolver {
    translations: RwLock<Table>,
    rewrites: AtomicU64,
}

impl NatResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `original -> translated`, including the reply direction
    pub fn add_translation(&self, original: Tuple, translated: Tuple) {
        if original == translated {
            return;
        }
        let mut table = self.translations.write();
        table.insert_flattened(original, translated);
        table.insert_flattened(original.reversed(), translated.reversed());
        debug!("NAT translation added: {} => {}", original, translated);
    }

    /// Drop a translation previously registered for `original`
    pub fn remove_translation(&self, original: &Tuple) {
        let mut table = self.translations.write();
        table.remove(original);
        table.remove(&original.reversed());
    }

    /// Return the canonical tuple, or the input when no mapping exists
    pub fn canonicalize(&self, tuple: &Tuple) -> Tuple {
        match self.translations.read().forward.get(tuple) {
            Some(translated) => {
                self.rewrites.fetch_add(1, Ordering::Relaxed);
                *translated
            }
            None => *tuple,
        }
    }

    /// Number of stored mappings (both directions count)
    pub fn len(&self) -> usize {
        self.translations.read().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rewrites(&self) -> u64 {
        self.rewrites.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        *self.translations.write() = Table::default();
    }
}
