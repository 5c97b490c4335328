//! The flow arena.
//!
//! Forwarders are indexed by a stable integer [`FlowId`]; the flow key and
//! the outbound socket's ephemeral port are side tables pointing into the
//! arena. The port index is what lets the TLS terminator find the owning
//! flow of an accepted connection.

use crate::forwarder::Forwarder;
use dashmap::DashMap;
use refract_wire::FlowKey;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable identifier of one flow for the lifetime of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// Arena of active forwarders plus its two side indexes
pub struct FlowTable {
    next_id: AtomicU64,
    by_id: DashMap<FlowId, Arc<Forwarder>>,
    by_key: DashMap<FlowKey, FlowId>,
    by_local_port: DashMap<u16, FlowId>,
    port_of: DashMap<FlowId, u16>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_id: DashMap::new(),
            by_key: DashMap::new(),
            by_local_port: DashMap::new(),
            port_of: DashMap::new(),
        }
    }

    pub fn next_id(&self) -> FlowId {
        FlowId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert a forwarder; fails if a flow with the same key already exists
    /// (at most one forwarder per key at any time).
    pub fn insert(&self, forwarder: Arc<Forwarder>) -> bool {
        let key = forwarder.key();
        let id = forwarder.id();
        match self.by_key.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(id);
                self.by_id.insert(id, forwarder);
                true
            }
        }
    }

    pub fn get(&self, id: FlowId) -> Option<Arc<Forwarder>> {
        self.by_id.get(&id).map(|e| e.clone())
    }

    pub fn get_by_key(&self, key: &FlowKey) -> Option<Arc<Forwarder>> {
        let id = *self.by_key.get(key)?;
        self.get(id)
    }

    /// Record which ephemeral local port the flow's outbound socket uses
    pub fn bind_local_port(&self, port: u16, id: FlowId) {
        self.by_local_port.insert(port, id);
        self.port_of.insert(id, port);
    }

    pub fn by_local_port(&self, port: u16) -> Option<Arc<Forwarder>> {
        let id = *self.by_local_port.get(&port)?;
        self.get(id)
    }

    /// Remove a flow from the arena and every side index. Idempotent.
    pub fn release(&self, id: FlowId) {
        if let Some((_, forwarder)) = self.by_id.remove(&id) {
            self.by_key
                .remove_if(&forwarder.key(), |_, mapped| *mapped == id);
        }
        if let Some((_, port)) = self.port_of.remove(&id) {
            self.by_local_port.remove_if(&port, |_, mapped| *mapped == id);
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Snapshot of every active forwarder
    pub fn snapshot(&self) -> Vec<Arc<Forwarder>> {
        self.by_id.iter().map(|e| e.clone()).collect()
    }

    /// Remove and return every active forwarder (engine teardown)
    pub fn drain(&self) -> Vec<Arc<Forwarder>> {
        let all = self.snapshot();
        for forwarder in &all {
            self.release(forwarder.id());
        }
        all
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}
