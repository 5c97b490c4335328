//! Outbound channel I/O.
//!
//! Owns every flow's outbound socket once connected. Each registration gets
//! a writer driver draining the flow's FIFO pending-write queue (the queue's
//! `Notify` is the wake primitive other threads poke after enqueueing) and a
//! reader driver delivering inbound bytes back to the forwarder. Interest
//! changes are the register/deregister calls themselves, applied atomically
//! through the shared tables; back-pressure is bytes staying queued, never
//! dropped.

use crate::flow::FlowId;
use crate::forwarder::{Forwarder, PendingWrite};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

const READ_BUFFER: usize = 64 * 1024;

#[derive(Default)]
struct FlowQueue {
    pending: Mutex<VecDeque<PendingWrite>>,
    notify: Notify,
}

struct DriverHandles {
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

/// Registry of outbound channels and their driver tasks
pub struct IoManager {
    queues: DashMap<FlowId, Arc<FlowQueue>>,
    drivers: DashMap<FlowId, DriverHandles>,
}

impl IoManager {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            drivers: DashMap::new(),
        }
    }

    /// Create the flow's write queue ahead of the outbound connect so data
    /// arriving with the handshake ACK has somewhere to go.
    pub fn create_queue(&self, id: FlowId) {
        self.queues.entry(id).or_default();
    }

    /// Append a pending write and wake the flow's writer driver.
    pub fn queue_write(&self, id: FlowId, write: PendingWrite) {
        match self.queues.get(&id) {
            Some(queue) => {
                queue.pending.lock().push_back(write);
                queue.notify.notify_one();
            }
            None => warn!("{}: write dropped, no queue registered", id),
        }
    }

    /// Bytes queued but not yet written for a flow
    pub fn pending_len(&self, id: FlowId) -> usize {
        self.queues
            .get(&id)
            .map(|q| q.pending.lock().iter().map(|w| w.data.len()).sum())
            .unwrap_or(0)
    }

    /// Attach a connected outbound socket to its flow and start the driver
    /// pair.
    pub fn register(&self, forwarder: Arc<Forwarder>, stream: TcpStream) {
        let id = forwarder.id();
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        let queue = self.queues.entry(id).or_default().clone();

        let writer_fw = forwarder.clone();
        let writer = tokio::spawn(async move {
            loop {
                let next = queue.pending.lock().pop_front();
                match next {
                    Some(write) => {
                        if let Err(e) = write_half.write_all(&write.data).await {
                            writer_fw.handle_server_error(&e).await;
                            break;
                        }
                        trace!("{}: wrote {} bytes outbound", id, write.data.len());
                        writer_fw.write_completed(write.ack_on_complete).await;
                    }
                    None => queue.notify.notified().await,
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!("{}: outbound EOF", id);
                        forwarder.handle_server_eof().await;
                        break;
                    }
                    Ok(n) => forwarder.handle_server_bytes(&buf[..n]).await,
                    Err(e) => {
                        forwarder.handle_server_error(&e).await;
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.drivers.insert(id, DriverHandles { reader, writer }) {
            old.reader.abort();
            old.writer.abort();
        }
    }

    /// Cancel the flow's drivers, drop its queue and close the socket.
    pub fn deregister(&self, id: FlowId) {
        if let Some((_, handles)) = self.drivers.remove(&id) {
            handles.reader.abort();
            handles.writer.abort();
        }
        if let Some((_, queue)) = self.queues.remove(&id) {
            let dropped = queue.pending.lock().len();
            if dropped > 0 {
                debug!("{}: dropped {} pending writes on teardown", id, dropped);
            }
        }
    }

    /// Tear down every registration (engine shutdown).
    pub fn shutdown(&self) {
        for entry in self.drivers.iter() {
            entry.reader.abort();
            entry.writer.abort();
        }
        self.drivers.clear();
        self.queues.clear();
    }
}

impl Default for IoManager {
    fn default() -> Self {
        Self::new()
    }
}
