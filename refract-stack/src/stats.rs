//! Engine counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters covering the whole engine
#[derive(Debug, Default)]
pub struct EngineStats {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    tcp_packets: AtomicU64,
    udp_packets: AtomicU64,
    other_packets: AtomicU64,
    parse_errors: AtomicU64,
    filtered: AtomicU64,
    flows_opened: AtomicU64,
    flows_closed: AtomicU64,
    flows_redirected: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_tcp(&self) {
        self.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_other(&self) {
        self.other_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_opened(&self) {
        self.flows_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_closed(&self) {
        self.flows_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_redirected(&self) {
        self.flows_redirected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    pub fn flows_opened(&self) -> u64 {
        self.flows_opened.load(Ordering::Relaxed)
    }

    pub fn flows_closed(&self) -> u64 {
        self.flows_closed.load(Ordering::Relaxed)
    }

    pub fn flows_redirected(&self) -> u64 {
        self.flows_redirected.load(Ordering::Relaxed)
    }
}
