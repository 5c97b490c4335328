//! Virtual network interface seam.
//!
//! The engine never opens a tun device itself; the embedding layer hands it
//! an object with the read/write surface of one. [`ChannelInterface`] backs
//! the same surface with in-memory channels for tests.

use bytes::BytesMut;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Read/write surface of the virtual network device.
///
/// `poll_read` is called in a tight loop from a dedicated reader thread, so
/// implementations must honour the timeout rather than block indefinitely.
pub trait VirtualInterface: Send + Sync {
    /// Wait up to `timeout` for the next inbound IP datagram.
    /// `Ok(None)` means the timeout elapsed; an error is fatal to the reader.
    fn poll_read(&self, timeout: Duration) -> io::Result<Option<BytesMut>>;

    /// Inject a synthesized IP datagram back into the interface.
    fn write(&self, datagram: &[u8]) -> io::Result<()>;
}

/// Channel-backed interface used by integration tests and embedders that
/// already own the device I/O.
pub struct ChannelInterface {
    incoming: Mutex<Receiver<BytesMut>>,
    outgoing: Sender<BytesMut>,
}

impl ChannelInterface {
    /// Returns the interface plus the far ends: a sender to inject inbound
    /// datagrams and a receiver observing everything the engine writes back.
    pub fn pair() -> (Arc<Self>, Sender<BytesMut>, Receiver<BytesMut>) {
        let (in_tx, in_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        let iface = Arc::new(Self {
            incoming: Mutex::new(in_rx),
            outgoing: out_tx,
        });
        (iface, in_tx, out_rx)
    }
}

impl VirtualInterface for ChannelInterface {
    fn poll_read(&self, timeout: Duration) -> io::Result<Option<BytesMut>> {
        let rx = self
            .incoming
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "interface poisoned"))?;
        match rx.recv_timeout(timeout) {
            Ok(datagram) => Ok(Some(datagram)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "interface closed",
            )),
        }
    }

    fn write(&self, datagram: &[u8]) -> io::Result<()> {
        self.outgoing
            .send(BytesMut::from(datagram))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface closed"))
    }
}
