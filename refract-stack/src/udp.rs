//! UDP relay.
//!
//! UDP needs no state machine: each flow key gets a protected outbound
//! socket connected to the destination, a receive task synthesizing
//! response datagrams back into the virtual interface, and idle-timeout
//! eviction from the cleanup pass.

use crate::engine::EngineShared;
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use refract_wire::{build_ipv4_udp, FlowKey};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

struct UdpSession {
    socket: Arc<UdpSocket>,
    last_active: Mutex<Instant>,
    recv_task: tokio::task::JoinHandle<()>,
}

/// Session table for forwarded UDP traffic
pub struct UdpRelay {
    sessions: DashMap<FlowKey, Arc<UdpSession>>,
    shared: Arc<EngineShared>,
}

impl UdpRelay {
    pub fn new(shared: Arc<EngineShared>) -> Self {
        Self {
            sessions: DashMap::new(),
            shared,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Forward one datagram, creating the session on first sight.
    pub async fn handle_datagram(&self, key: FlowKey, payload: &[u8]) {
        let session = match self.session(key).await {
            Some(session) => session,
            None => return,
        };

        *session.last_active.lock() = Instant::now();
        if let Err(e) = session.socket.send(payload).await {
            debug!(flow = %key, "UDP send failed: {}", e);
            self.remove(key);
        }
    }

    async fn session(&self, key: FlowKey) -> Option<Arc<UdpSession>> {
        if let Some(existing) = self.sessions.get(&key) {
            return Some(existing.clone());
        }

        if self.sessions.len() >= self.shared.config.udp.max_sessions {
            warn!("UDP session table full, dropping datagram for {}", key);
            return None;
        }

        let socket = match self.shared.dialer.bind_udp().await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                debug!(flow = %key, "UDP socket bind failed: {}", e);
                return None;
            }
        };
        if let Err(e) = socket.connect(key.dst.socket_addr()).await {
            debug!(flow = %key, "UDP connect failed: {}", e);
            return None;
        }

        trace!(flow = %key, "UDP session opened");

        let recv_socket = socket.clone();
        let tun_tx = self.shared.tun_tx.clone();
        let stats = self.shared.stats.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                match recv_socket.recv(&mut buf).await {
                    Ok(n) => {
                        let pkt = build_ipv4_udp(key.dst, key.src, &buf[..n]);
                        stats.record_sent(pkt.len());
                        if tun_tx.send(BytesMut::from(&pkt[..])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        trace!(flow = %key, "UDP recv ended: {}", e);
                        break;
                    }
                }
            }
        });

        let session = Arc::new(UdpSession {
            socket,
            last_active: Mutex::new(Instant::now()),
            recv_task,
        });
        self.sessions.insert(key, session.clone());
        Some(session)
    }

    fn remove(&self, key: FlowKey) {
        if let Some((_, session)) = self.sessions.remove(&key) {
            session.recv_task.abort();
        }
    }

    /// Evict sessions idle past the configured timeout.
    pub fn cleanup(&self) {
        let timeout = self.shared.config.udp.session_timeout;
        let expired: Vec<FlowKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_active.lock().elapsed() > timeout)
            .map(|entry| *entry.key())
            .collect();
        for key in expired {
            trace!(flow = %key, "UDP session expired");
            self.remove(key);
        }
    }

    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.recv_task.abort();
        }
        self.sessions.clear();
    }
}
