//! The connection table.
//!
//! Lookup semantics: a hit resets the record's sweep counter; a miss
//! triggers exactly one synchronous rescan, and a second miss caches a
//! "not found" sentinel so repeated lookups for the same port do not hammer
//! the expensive system scan. The sweeper ages every record and evicts
//! those that reach the staleness threshold — staleness is not an error,
//! the next lookup simply rescans.

use crate::{AppDescriptor, Result};
use parking_lot::Mutex;
use refract_core::config::ResolverConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One scanned socket: local port plus owning application
#[derive(Debug, Clone)]
pub struct SocketOwner {
    pub local_port: u16,
    pub app: AppDescriptor,
}

/// Supplies connection-table snapshots. The procfs implementation is the
/// production source; tests inject fakes.
pub trait ConnectionSource: Send + Sync {
    fn scan(&self) -> Result<Vec<SocketOwner>>;
}

struct ConnectionRecord {
    /// `None` is the cached "not found" sentinel
    app: Option<AppDescriptor>,
    sweeps: u32,
}

/// Port-keyed application table with lazy refresh and sweep-based aging
pub struct ConnectionTable {
    records: Mutex<HashMap<u16, ConnectionRecord>>,
    source: Box<dyn ConnectionSource>,
    config: ResolverConfig,
    scans: AtomicU64,
}

impl ConnectionTable {
    pub fn new(source: Box<dyn ConnectionSource>, config: ResolverConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            source,
            config,
            scans: AtomicU64::new(0),
        }
    }

    /// Rescan the connection tables and upsert every record. Refreshed
    /// records (sentinels included) restart with a zero sweep counter.
    pub fn refresh(&self) -> usize {
        let mut records = self.records.lock();
        self.refresh_locked(&mut records)
    }

    fn refresh_locked(&self, records: &mut HashMap<u16, ConnectionRecord>) -> usize {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let owners = match self.source.scan() {
            Ok(o) => o,
            Err(e) => {
                warn!("Connection table scan failed: {}", e);
                return 0;
            }
        };
        let count = owners.len();
        for owner in owners {
            records.insert(
                owner.local_port,
                ConnectionRecord {
                    app: Some(owner.app),
                    sweeps: 0,
                },
            );
        }
        trace!("Connection table refreshed: {} sockets", count);
        count
    }

    /// Resolve the application owning `local_port`.
    ///
    /// A hit (found or sentinel) never rescans; a miss rescans once and
    /// caches the outcome either way.
    pub fn lookup(&self, local_port: u16) -> Option<AppDescriptor> {
        let mut records = self.records.lock();

        if let Some(record) = records.get_mut(&local_port) {
            record.sweeps = 0;
            return record.app.clone();
        }

        self.refresh_locked(&mut records);

        if let Some(record) = records.get_mut(&local_port) {
            record.sweeps = 0;
            return record.app.clone();
        }

        debug!("Port {} not attributable, caching sentinel", local_port);
        records.insert(
            local_port,
            ConnectionRecord {
                app: None,
                sweeps: 0,
            },
        );
        None
    }

    /// Age every record by one sweep; evict records that reach the
    /// threshold without a lookup hit in between.
    pub fn sweep(&self) {
        let max = self.config.max_sweeps;
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| {
            record.sweeps += 1;
            record.sweeps < max
        });
        let evicted = before - records.len();
        if evicted > 0 {
            debug!("Connection table sweep evicted {} records", evicted);
        }
    }

    /// Periodic sweeper; exits when `running` clears.
    pub fn spawn_sweeper(self: Arc<Self>, running: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sweep_interval;
        let table = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                table.sweep();
            }
        })
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Number of scans performed so far
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }
}
