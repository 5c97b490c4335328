//! Engine context.
//!
//! Top-level owner of every service: the flow arena, the I/O manager, the
//! app resolver, the pinning list and the TLS terminator are all explicitly
//! constructed here and handed to the components that need them. The engine
//! runs a dedicated reader thread against the virtual interface, a dispatch
//! task, a writer task draining synthesized segments, and the periodic
//! cleanup/sweeper tasks.

use crate::flow::FlowTable;
use crate::forwarder::Forwarder;
use crate::io::IoManager;
use crate::stats::EngineStats;
use crate::udp::UdpRelay;
use bytes::BytesMut;
use parking_lot::Mutex;
use refract_core::{
    AllowAll, Dialer, EngineConfig, Error, NoProtection, PacketFilter, Result, SocketProtector,
    VirtualInterface,
};
use refract_mitm::{FlowDirectory, InterceptCa, OwningFlow, PinningList, TlsTerminator};
use refract_sock2app::{ConnectionSource, ConnectionTable, ProcfsSource};
use refract_wire::{
    build_ipv4_tcp, parse_datagram, FlowKey, ParsedDatagram, TcpFlags, TcpSegment, Transport,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

const READ_POLL: Duration = Duration::from_millis(100);
const CHANNEL_DEPTH: usize = 1024;

/// Services shared between the engine, its forwarders and the drivers
pub struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) tun_tx: mpsc::Sender<BytesMut>,
    pub(crate) flows: FlowTable,
    pub(crate) io: IoManager,
    pub(crate) dialer: Arc<Dialer>,
    pub(crate) filter: Arc<dyn PacketFilter>,
    pub(crate) stats: Arc<EngineStats>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) terminator_addr: OnceLock<SocketAddr>,
}

/// Fluent engine construction with injectable collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    filter: Arc<dyn PacketFilter>,
    protector: Arc<dyn SocketProtector>,
    source: Option<Box<dyn ConnectionSource>>,
    pinning: Arc<PinningList>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            filter: Arc::new(AllowAll),
            protector: Arc::new(NoProtection),
            source: None,
            pinning: Arc::new(PinningList::new()),
        }
    }

    pub fn filter(mut self, filter: Arc<dyn PacketFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn protector(mut self, protector: Arc<dyn SocketProtector>) -> Self {
        self.protector = protector;
        self
    }

    pub fn connection_source(mut self, source: Box<dyn ConnectionSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn pinning(mut self, pinning: Arc<PinningList>) -> Self {
        self.pinning = pinning;
        self
    }

    pub fn intercept(mut self, enabled: bool) -> Self {
        self.config.intercept.enabled = enabled;
        self
    }

    /// Assemble the engine. Binds the terminator listener (and generates
    /// the interception CA) when interception is enabled.
    pub async fn build(self, iface: Arc<dyn VirtualInterface>) -> Result<Arc<Engine>> {
        let (tun_tx, tun_rx) = mpsc::channel::<BytesMut>(CHANNEL_DEPTH);
        let dialer = Arc::new(Dialer::new(
            self.protector.clone(),
            self.config.tcp.connect_timeout,
        ));

        let shared = Arc::new(EngineShared {
            config: self.config.clone(),
            tun_tx,
            flows: FlowTable::new(),
            io: IoManager::new(),
            dialer: dialer.clone(),
            filter: self.filter.clone(),
            stats: Arc::new(EngineStats::new()),
            running: Arc::new(AtomicBool::new(false)),
            terminator_addr: OnceLock::new(),
        });

        let source = self
            .source
            .unwrap_or_else(|| Box::new(ProcfsSource::new()));
        let resolver = Arc::new(ConnectionTable::new(source, self.config.resolver.clone()));

        let (ca, terminator) = if self.config.intercept.enabled {
            let ca = Arc::new(
                InterceptCa::generate()
                    .map_err(|e| Error::tls_with_source("CA generation failed", e))?,
            );
            let directory: Arc<dyn FlowDirectory> = Arc::new(InterceptDirectory {
                shared: shared.clone(),
            });
            let terminator = Arc::new(
                TlsTerminator::bind(
                    self.config.intercept.clone(),
                    ca.clone(),
                    self.pinning.clone(),
                    directory,
                    resolver.clone(),
                    self.filter.clone(),
                    dialer.clone(),
                )
                .await
                .map_err(|e| Error::tls_with_source("terminator bind failed", e))?,
            );
            shared
                .terminator_addr
                .set(terminator.local_addr())
                .map_err(|_| Error::internal("terminator address already set"))?;
            (Some(ca), Some(terminator))
        } else {
            (None, None)
        };

        let udp = Arc::new(UdpRelay::new(shared.clone()));

        Ok(Arc::new_cyclic(|me| Engine {
            shared,
            iface,
            resolver,
            pinning: self.pinning,
            ca,
            terminator,
            udp,
            tun_rx: Mutex::new(Some(tun_rx)),
            tasks: Mutex::new(Vec::new()),
            reader: Mutex::new(None),
            me: me.clone(),
        }))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The forwarding engine
pub struct Engine {
    shared: Arc<EngineShared>,
    iface: Arc<dyn VirtualInterface>,
    resolver: Arc<ConnectionTable>,
    pinning: Arc<PinningList>,
    ca: Option<Arc<InterceptCa>>,
    terminator: Option<Arc<TlsTerminator>>,
    udp: Arc<UdpRelay>,
    tun_rx: Mutex<Option<mpsc::Receiver<BytesMut>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    reader: Mutex<Option<std::thread::JoinHandle<()>>>,
    /// Self-handle for the engine's background tasks
    me: Weak<Engine>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Start the reader thread and every background task.
    pub async fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("engine already started"));
        }
        info!("Engine starting");

        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Error::internal("engine handle gone"))?;

        let mut tun_rx = self
            .tun_rx
            .lock()
            .take()
            .ok_or_else(|| Error::internal("engine already consumed"))?;

        let mut tasks = self.tasks.lock();

        // Writer: synthesized segments -> virtual interface
        let iface = self.iface.clone();
        let running = self.shared.running.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(pkt) = tun_rx.recv().await {
                if let Err(e) = iface.write(&pkt) {
                    if running.load(Ordering::Relaxed) {
                        error!("Virtual interface write failed: {}", e);
                    }
                    break;
                }
            }
        }));

        // Reader thread: virtual interface -> dispatch channel
        let (packet_tx, mut packet_rx) = mpsc::channel::<BytesMut>(CHANNEL_DEPTH);
        let iface = self.iface.clone();
        let running = self.shared.running.clone();
        let reader = std::thread::Builder::new()
            .name("refract-reader".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    match iface.poll_read(READ_POLL) {
                        Ok(Some(pkt)) => {
                            if packet_tx.blocking_send(pkt).is_err() {
                                break;
                            }
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            if running.load(Ordering::Relaxed) {
                                error!("Virtual interface read failed: {}", e);
                            }
                            break;
                        }
                    }
                }
            })
            .map_err(|e| Error::internal(format!("reader thread spawn failed: {}", e)))?;
        *self.reader.lock() = Some(reader);

        // Dispatch
        let engine = me.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(pkt) = packet_rx.recv().await {
                engine.process_datagram(&pkt).await;
            }
        }));

        // Periodic cleanup
        let engine = me;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.shared.config.cleanup.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            while engine.shared.running.load(Ordering::Relaxed) {
                ticker.tick().await;
                engine.cleanup().await;
            }
        }));

        tasks.push(
            self.resolver
                .clone()
                .spawn_sweeper(self.shared.running.clone()),
        );

        if let Some(terminator) = &self.terminator {
            tasks.push(terminator.clone().spawn(self.shared.running.clone()));
        }

        Ok(())
    }

    /// Feed one raw IP datagram through the filter gate and into the flow
    /// machinery.
    pub async fn process_datagram(&self, data: &[u8]) {
        if !self.shared.running.load(Ordering::Relaxed) {
            return;
        }
        self.shared.stats.record_received(data.len());

        if !self.shared.filter.accept_ip_datagram(data) {
            self.shared.stats.record_filtered();
            trace!("Datagram vetoed by filter");
            return;
        }

        let parsed = match parse_datagram(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.shared.stats.record_parse_error();
                debug!("Datagram dropped: {}", e);
                return;
            }
        };

        if parsed.version != 4 {
            trace!(
                "IPv6 datagram dropped ({} -> {})",
                parsed.src_addr,
                parsed.dst_addr
            );
            return;
        }

        match &parsed.transport {
            Transport::Tcp(seg) => {
                self.shared.stats.record_tcp();
                self.handle_tcp(&parsed, seg, data).await;
            }
            Transport::Udp(udp) => {
                self.shared.stats.record_udp();
                if let Some(key) = parsed.flow_key() {
                    self.udp.handle_datagram(key, udp.payload(data)).await;
                }
            }
            Transport::Icmp | Transport::Other(_) => {
                self.shared.stats.record_other();
            }
        }
    }

    async fn handle_tcp(&self, parsed: &ParsedDatagram, seg: &TcpSegment, data: &[u8]) {
        let key = match parsed.flow_key() {
            Some(key) => key,
            None => return,
        };
        let payload = seg.payload(data);
        trace!(
            flow = %key,
            "TCP seq={} ack={} flags={:?} len={}",
            seg.seq,
            seg.ack,
            seg.flags,
            payload.len()
        );

        if let Some(forwarder) = self.shared.flows.get_by_key(&key) {
            forwarder.handle_segment(seg, payload).await;
            return;
        }

        if seg.flags.syn && !seg.flags.ack {
            let id = self.shared.flows.next_id();
            let forwarder = Forwarder::new(id, key, self.shared.clone());
            if !self.shared.flows.insert(forwarder.clone()) {
                if let Some(existing) = self.shared.flows.get_by_key(&key) {
                    existing.handle_segment(seg, payload).await;
                }
                return;
            }
            self.shared.io.create_queue(id);
            self.shared.stats.record_flow_opened();
            debug!(flow = %key, "Flow created ({})", id);
            forwarder.handle_segment(seg, payload).await;
            return;
        }

        if seg.flags.rst {
            trace!(flow = %key, "RST for unknown flow ignored");
            return;
        }

        // Mid-stream segment for a flow we don't know: tell the client to
        // go away
        debug!(flow = %key, "Segment for unknown flow, sending RST");
        let pkt = build_ipv4_tcp(
            key.dst,
            key.src,
            seg.ack,
            seg.seq.wrapping_add(1),
            TcpFlags::rst_ack(),
            self.shared.config.tcp.recv_window,
            &[],
            None,
        );
        self.shared.stats.record_sent(pkt.len());
        let _ = self.shared.tun_tx.send(BytesMut::from(&pkt[..])).await;
    }

    async fn cleanup(&self) {
        for forwarder in self.shared.flows.snapshot() {
            if forwarder.is_idle() {
                debug!(flow = %forwarder.key(), "Evicting idle flow");
                forwarder.destroy().await;
            }
        }
        self.udp.cleanup();
    }

    /// Stop everything: reader thread, drivers, terminator, flows, tables.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Engine shutting down");

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        if let Some(handle) = self.reader.lock().take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        for forwarder in self.shared.flows.drain() {
            forwarder.destroy().await;
        }
        self.shared.io.shutdown();
        self.udp.shutdown();
        self.resolver.clear();

        info!("Engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.shared.stats
    }

    pub fn flow_count(&self) -> usize {
        self.shared.flows.len()
    }

    pub fn udp_session_count(&self) -> usize {
        self.udp.session_count()
    }

    pub fn resolver(&self) -> &Arc<ConnectionTable> {
        &self.resolver
    }

    pub fn pinning(&self) -> &Arc<PinningList> {
        &self.pinning
    }

    /// PEM of the interception CA, when interception is enabled
    pub fn ca_cert_pem(&self) -> Option<&str> {
        self.ca.as_deref().map(InterceptCa::cert_pem)
    }

    /// Port the TLS terminator listens on, when interception is enabled
    pub fn terminator_port(&self) -> Option<u16> {
        self.terminator.as_deref().map(TlsTerminator::local_port)
    }
}

/// The terminator's window into the flow arena
struct InterceptDirectory {
    shared: Arc<EngineShared>,
}

impl FlowDirectory for InterceptDirectory {
    fn flow_by_local_port(&self, local_port: u16) -> Option<Arc<dyn OwningFlow>> {
        let forwarder = self.shared.flows.by_local_port(local_port)?;
        Some(Arc::new(FlowHandle(forwarder)))
    }
}

struct FlowHandle(Arc<Forwarder>);

impl OwningFlow for FlowHandle {
    fn key(&self) -> FlowKey {
        self.0.key()
    }

    fn set_tls_handshaking(&self, active: bool) {
        self.0.set_tls_handshaking(active);
    }

    fn reset(&self) {
        let forwarder = self.0.clone();
        tokio::spawn(async move {
            forwarder.reset_flow().await;
        });
    }
}
