//! Cross-cycle state shared by every plugin of one engine.
//!
//! Each concern gets its own typed [`Store`], so readers never have to
//! guess what a key holds. Entries are never evicted: keys are hardware
//! identifiers (interface names, mount points), which stay bounded.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

/// Last cumulative byte counters seen for a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Last cumulative I/O counters seen for a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Last package energy reading, used to derive power draw.
#[derive(Debug, Clone, Copy)]
pub struct EnergySample {
    pub microjoules: u64,
    pub taken_at: Instant,
}

#[derive(Debug)]
pub struct Store<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> Default for Store<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Clone> Store<V> {
    /// Overwrites any previous value for `key`.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let mut guard = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        guard.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    pub interfaces: Store<NetCounters>,
    pub block_devices: Store<IoCounters>,
    pub cpu_energy: Store<EnergySample>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }
}
