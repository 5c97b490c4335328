//! Per-flow TCP state machine.
//!
//! Each flow is driven by a [`FlowCell`] that consumes decoded segments
//! under the flow's lock and returns the actions to perform; the
//! [`Forwarder`] executes them (synthesizing segments into the tun,
//! opening the outbound channel, queueing writes, scheduling timers).
//! Client-observed and server-facing state are tracked independently since
//! the two sides close independently. All sequence arithmetic wraps mod
//! 2^32 and only advances while the lock is held.

use crate::engine::EngineShared;
use crate::flow::FlowId;
use bytes::BytesMut;
use parking_lot::Mutex;
use refract_core::TcpConfig;
use refract_wire::{build_ipv4_tcp, FlowKey, TcpFlags, TcpSegment, DEFAULT_MSS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// TCP state (RFC 793)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One queued outbound write. The ACK for the data it carries is only
/// injected once the write to the real server completes; `None` means the
/// ACK was already sent inline (FIN handling).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub data: Vec<u8>,
    pub ack_on_complete: Option<u32>,
}

/// Blueprint of a synthesized segment toward the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTemplate {
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
    pub payload: Vec<u8>,
    pub mss: Option<u16>,
}

impl SegmentTemplate {
    fn control(flags: TcpFlags, seq: u32, ack: u32) -> Self {
        Self {
            flags,
            seq,
            ack,
            payload: Vec::new(),
            mss: None,
        }
    }
}

/// What the forwarder must do after a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    /// Inject a synthesized segment into the virtual interface
    Send(SegmentTemplate),
    /// Open the outbound channel (direct or redirected to the terminator)
    OpenOutbound,
    /// Append to the flow's outbound write queue
    QueueWrite(PendingWrite),
    /// Asynchronously emit our FIN to the client
    ScheduleFin,
    /// Asynchronously tear the flow down without emitting anything
    ScheduleClose,
    /// Tear the flow down after the TIME_WAIT linger
    ScheduleLinger,
    /// Tear the flow down now, silently
    Destroy,
}

/// Lock-guarded state of one flow
pub struct FlowCell {
    client_state: TcpState,
    server_state: TcpState,
    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    mss: u16,
    fin_sent: bool,
    fin_scheduled: bool,
    tls_handshaking: bool,
    last_active: Instant,
    config_mss: u16,
}

impl FlowCell {
    pub fn new(config: &TcpConfig) -> Self {
        Self {
            client_state: TcpState::Closed,
            server_state: TcpState::Listen,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            mss: config.mss,
            fin_sent: false,
            fin_scheduled: false,
            tls_handshaking: false,
            last_active: Instant::now(),
            config_mss: config.mss,
        }
    }

    pub fn client_state(&self) -> TcpState {
        self.client_state
    }

    pub fn server_state(&self) -> TcpState {
        self.server_state
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }

    pub fn set_tls_handshaking(&mut self, active: bool) {
        self.tls_handshaking = active;
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    pub fn set_closed(&mut self) {
        self.client_state = TcpState::Closed;
        self.server_state = TcpState::Closed;
    }

    /// Drive the state machine with one inbound segment from the virtual
    /// interface.
    pub fn on_segment(&mut self, seg: &TcpSegment, payload: &[u8]) -> Vec<FlowAction> {
        self.last_active = Instant::now();

        if seg.flags.rst {
            return self.on_rst();
        }

        match self.server_state {
            TcpState::Listen => self.on_listen(seg, payload),
            TcpState::SynReceived => self.on_syn_received(seg, payload),
            TcpState::Established => self.on_established(seg, payload),
            TcpState::FinWait1 => self.on_fin_wait1(seg, payload),
            TcpState::FinWait2 => self.on_fin_wait2(seg, payload),
            TcpState::CloseWait => self.on_close_wait(seg),
            TcpState::Closing | TcpState::LastAck => self.on_awaiting_fin_ack(seg),
            TcpState::TimeWait => self.on_time_wait(seg),
            TcpState::Closed | TcpState::SynSent => Vec::new(),
        }
    }

    fn on_rst(&mut self) -> Vec<FlowAction> {
        if self.server_state == TcpState::Listen {
            // No handshake to undo; go away without a response segment
            self.set_closed();
            return vec![FlowAction::Destroy];
        }
        if self.tls_handshaking {
            // Don't let a stray RST race the TLS negotiation
            debug!("RST ignored while TLS handshake in flight");
            return Vec::new();
        }
        self.set_closed();
        vec![FlowAction::ScheduleClose]
    }

    fn on_listen(&mut self, seg: &TcpSegment, payload: &[u8]) -> Vec<FlowAction> {
        if seg.flags.syn && !seg.flags.ack {
            if self.client_state == TcpState::SynSent {
                // Retransmitted SYN while the outbound connect is pending
                trace!("Duplicate SYN ignored");
                return Vec::new();
            }
            self.rcv_nxt = seg.seq.wrapping_add(1);
            let iss: u32 = rand::random();
            self.snd_una = iss;
            self.snd_nxt = iss.wrapping_add(1);
            self.mss = seg.mss.unwrap_or(DEFAULT_MSS).min(self.config_mss);
            self.client_state = TcpState::SynSent;
            return vec![FlowAction::OpenOutbound];
        }

        if !payload.is_empty() || seg.flags.fin {
            // Mid-stream junk for a listener: reflect the client's sequence
            // and go away
            let ack = seg
                .seq
                .wrapping_add(payload.len() as u32)
                .wrapping_add(seg.flags.fin as u32);
            let flags = if seg.flags.fin && payload.is_empty() {
                TcpFlags::fin_ack()
            } else {
                TcpFlags::rst_ack()
            };
            self.set_closed();
            return vec![
                FlowAction::Send(SegmentTemplate::control(flags, seg.ack, ack)),
                FlowAction::Destroy,
            ];
        }

        trace!("Control segment dropped in LISTEN");
        Vec::new()
    }

    /// Outbound connect finished: synthesize the SYN-ACK.
    pub fn on_outbound_connected(&mut self) -> Vec<FlowAction> {
        if self.server_state != TcpState::Listen {
            return Vec::new();
        }
        self.server_state = TcpState::SynReceived;
        vec![FlowAction::Send(SegmentTemplate {
            flags: TcpFlags::syn_ack(),
            seq: self.snd_una,
            ack: self.rcv_nxt,
            payload: Vec::new(),
            mss: Some(self.mss),
        })]
    }

    fn on_syn_received(&mut self, seg: &TcpSegment, payload: &[u8]) -> Vec<FlowAction> {
        if seg.flags.ack && seg.ack == self.snd_nxt {
            self.snd_una = seg.ack;
            self.server_state = TcpState::Established;
            self.client_state = TcpState::Established;
            debug!("Flow established");

            let mut actions = Vec::new();
            if !payload.is_empty() {
                actions.extend(self.ingest_payload(seg, payload, seg.flags.fin));
            }
            if seg.flags.fin {
                actions.extend(self.ingest_fin(seg, payload));
            }
            return actions;
        }

        if !payload.is_empty() || seg.flags.fin {
            // Not the handshake ACK: fall back to LISTEN and reflect the
            // client's sequence. The flow survives so a fresh SYN can retry.
            self.server_state = TcpState::Listen;
            self.client_state = TcpState::Closed;
            let ack = seg
                .seq
                .wrapping_add(payload.len() as u32)
                .wrapping_add(seg.flags.fin as u32);
            let flags = if seg.flags.fin && payload.is_empty() {
                TcpFlags::fin_ack()
            } else {
                TcpFlags::rst_ack()
            };
            return vec![FlowAction::Send(SegmentTemplate::control(
                flags, seg.ack, ack,
            ))];
        }

        Vec::new()
    }

    fn on_established(&mut self, seg: &TcpSegment, payload: &[u8]) -> Vec<FlowAction> {
        if seg.flags.syn {
            // Protocol violation: reflect the new initial sequence and close
            warn!("SYN in ESTABLISHED, resetting");
            return vec![
                FlowAction::Send(SegmentTemplate::control(
                    TcpFlags::rst_ack(),
                    self.snd_nxt,
                    seg.seq.wrapping_add(1),
                )),
                FlowAction::ScheduleClose,
            ];
        }

        if seg.flags.ack {
            self.process_ack(seg.ack);
        }

        let mut actions = Vec::new();
        // The FIN sits right after the segment's payload, so it is
        // consumable exactly when the segment itself starts in order
        let fin_in_order = seg.flags.fin && seg.seq == self.rcv_nxt;
        if !payload.is_empty() {
            actions.extend(self.ingest_payload(seg, payload, fin_in_order));
        }
        if seg.flags.fin {
            if fin_in_order {
                actions.extend(self.ingest_fin(seg, payload));
            } else if self.seq_before(seg.seq, self.rcv_nxt) {
                // Retransmitted FIN
                actions.push(FlowAction::Send(SegmentTemplate::control(
                    TcpFlags::ack_only(),
                    self.snd_nxt,
                    self.rcv_nxt,
                )));
            }
        }
        actions
    }

    fn ingest_payload(&mut self, seg: &TcpSegment, payload: &[u8], quiet: bool) -> Vec<FlowAction> {
        let len = payload.len() as u32;
        let seq_end = seg.seq.wrapping_add(len);

        if seg.seq == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(len);
            return vec![FlowAction::QueueWrite(PendingWrite {
                data: payload.to_vec(),
                ack_on_complete: (!quiet).then_some(self.rcv_nxt),
            })];
        }

        if self.seq_before_or_eq(seq_end, self.rcv_nxt) {
            trace!("Retransmission, re-acking");
            return vec![FlowAction::Send(SegmentTemplate::control(
                TcpFlags::ack_only(),
                self.snd_nxt,
                self.rcv_nxt,
            ))];
        }

        if self.seq_before(seg.seq, self.rcv_nxt) && self.seq_after(seq_end, self.rcv_nxt) {
            // Partial retransmission: only the tail is new
            let skip = self.rcv_nxt.wrapping_sub(seg.seq) as usize;
            let fresh = &payload[skip..];
            self.rcv_nxt = self.rcv_nxt.wrapping_add(fresh.len() as u32);
            return vec![FlowAction::QueueWrite(PendingWrite {
                data: fresh.to_vec(),
                ack_on_complete: (!quiet).then_some(self.rcv_nxt),
            })];
        }

        // The virtual interface delivers in order; anything ahead of
        // rcv_nxt is dropped rather than reassembled
        warn!(
            "Out-of-order segment dropped: seq={} expected={}",
            seg.seq, self.rcv_nxt
        );
        Vec::new()
    }

    fn ingest_fin(&mut self, _seg: &TcpSegment, _payload: &[u8]) -> Vec<FlowAction> {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.server_state = TcpState::CloseWait;
        // Our ACK is on the wire before the client can see anything else,
        // so the client is treated as already past FIN_WAIT_1
        self.client_state = TcpState::FinWait2;
        self.fin_scheduled = true;
        vec![
            FlowAction::Send(SegmentTemplate::control(
                TcpFlags::ack_only(),
                self.snd_nxt,
                self.rcv_nxt,
            )),
            FlowAction::ScheduleFin,
        ]
    }

    fn on_fin_wait1(&mut self, seg: &TcpSegment, payload: &[u8]) -> Vec<FlowAction> {
        let acked_our_fin = seg.flags.ack && seg.ack == self.snd_nxt;
        if acked_our_fin {
            self.snd_una = seg.ack;
            if seg.flags.fin {
                self.rcv_nxt = self
                    .rcv_nxt
                    .wrapping_add(payload.len() as u32)
                    .wrapping_add(1);
                self.server_state = TcpState::TimeWait;
                self.client_state = TcpState::Closed;
                return vec![
                    FlowAction::Send(SegmentTemplate::control(
                        TcpFlags::ack_only(),
                        self.snd_nxt,
                        self.rcv_nxt,
                    )),
                    FlowAction::ScheduleLinger,
                ];
            }
            self.server_state = TcpState::FinWait2;
            return Vec::new();
        }

        if seg.flags.fin {
            // Simultaneous close: ack the peer's FIN, wait for ours to be
            // acked. Best-effort replica, covered by explicit tests.
            self.rcv_nxt = self
                .rcv_nxt
                .wrapping_add(payload.len() as u32)
                .wrapping_add(1);
            self.server_state = TcpState::Closing;
            return vec![FlowAction::Send(SegmentTemplate::control(
                TcpFlags::ack_only(),
                self.snd_nxt,
                self.rcv_nxt,
            ))];
        }

        if seg.flags.ack {
            self.process_ack(seg.ack);
        }
        Vec::new()
    }

    fn on_fin_wait2(&mut self, seg: &TcpSegment, payload: &[u8]) -> Vec<FlowAction> {
        if seg.flags.fin {
            self.rcv_nxt = self
                .rcv_nxt
                .wrapping_add(payload.len() as u32)
                .wrapping_add(1);
            self.server_state = TcpState::TimeWait;
            self.client_state = TcpState::Closed;
            return vec![
                FlowAction::Send(SegmentTemplate::control(
                    TcpFlags::ack_only(),
                    self.snd_nxt,
                    self.rcv_nxt,
                )),
                FlowAction::ScheduleLinger,
            ];
        }
        if seg.flags.ack {
            self.process_ack(seg.ack);
        }
        Vec::new()
    }

    fn on_close_wait(&mut self, seg: &TcpSegment) -> Vec<FlowAction> {
        if seg.flags.fin {
            // Retransmitted FIN: ack it again
            return vec![FlowAction::Send(SegmentTemplate::control(
                TcpFlags::ack_only(),
                self.snd_nxt,
                self.rcv_nxt,
            ))];
        }
        if seg.flags.ack {
            self.process_ack(seg.ack);
        }
        Vec::new()
    }

    fn on_awaiting_fin_ack(&mut self, seg: &TcpSegment) -> Vec<FlowAction> {
        if seg.flags.ack && seg.ack == self.snd_nxt {
            self.snd_una = seg.ack;
            self.server_state = TcpState::TimeWait;
            self.client_state = TcpState::Closed;
            return vec![FlowAction::ScheduleLinger];
        }
        Vec::new()
    }

    fn on_time_wait(&mut self, seg: &TcpSegment) -> Vec<FlowAction> {
        if seg.flags.fin {
            return vec![FlowAction::Send(SegmentTemplate::control(
                TcpFlags::ack_only(),
                self.snd_nxt,
                self.rcv_nxt,
            ))];
        }
        Vec::new()
    }

    /// The scheduled FIN toward the client fires.
    pub fn on_fin_timer(&mut self) -> Vec<FlowAction> {
        if !self.fin_scheduled {
            return Vec::new();
        }
        self.fin_scheduled = false;
        self.emit_fin()
    }

    /// The real server closed its write side.
    pub fn on_outbound_eof(&mut self) -> Vec<FlowAction> {
        match self.server_state {
            TcpState::Established | TcpState::CloseWait => self.emit_fin(),
            _ => Vec::new(),
        }
    }

    fn emit_fin(&mut self) -> Vec<FlowAction> {
        if self.fin_sent {
            return Vec::new();
        }
        self.fin_sent = true;
        let seq = self.snd_nxt;
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.server_state = match self.server_state {
            TcpState::CloseWait => TcpState::LastAck,
            TcpState::Established => TcpState::FinWait1,
            s => s,
        };
        vec![FlowAction::Send(SegmentTemplate::control(
            TcpFlags::fin_ack(),
            seq,
            self.rcv_nxt,
        ))]
    }

    /// Outbound I/O failed after the flow was live.
    pub fn on_outbound_error(&mut self) -> Vec<FlowAction> {
        let was_live = matches!(
            self.server_state,
            TcpState::SynReceived
                | TcpState::Established
                | TcpState::CloseWait
                | TcpState::FinWait1
                | TcpState::FinWait2
        );
        let rst = self.make_rst();
        self.set_closed();
        if was_live {
            vec![FlowAction::Send(rst), FlowAction::Destroy]
        } else {
            vec![FlowAction::Destroy]
        }
    }

    pub fn make_rst(&self) -> SegmentTemplate {
        SegmentTemplate::control(TcpFlags::rst_ack(), self.snd_nxt, self.rcv_nxt)
    }

    /// Reserve sequence space for `len` bytes toward the client. `None`
    /// when the flow is no longer allowed to carry data.
    pub fn reserve_outbound(&mut self, len: u32) -> Option<(u32, u32, u16)> {
        if self.fin_sent
            || !matches!(
                self.server_state,
                TcpState::Established | TcpState::CloseWait
            )
        {
            return None;
        }
        self.last_active = Instant::now();
        let base = self.snd_nxt;
        self.snd_nxt = self.snd_nxt.wrapping_add(len);
        Some((base, self.rcv_nxt, self.mss))
    }

    fn process_ack(&mut self, ack: u32) {
        if self.valid_ack(ack) {
            self.snd_una = ack;
        }
    }

    fn valid_ack(&self, ack: u32) -> bool {
        let (una, nxt) = (self.snd_una, self.snd_nxt);
        if una <= nxt {
            ack > una && ack <= nxt
        } else {
            ack > una || ack <= nxt
        }
    }

    fn seq_before(&self, a: u32, b: u32) -> bool {
        (a.wrapping_sub(b) as i32) < 0
    }

    fn seq_after(&self, a: u32, b: u32) -> bool {
        (a.wrapping_sub(b) as i32) > 0
    }

    fn seq_before_or_eq(&self, a: u32, b: u32) -> bool {
        a == b || self.seq_before(a, b)
    }
}

enum TimerKind {
    Fin,
    Close,
}

/// Per-flow driver: owns the cell, the outbound channel registration and
/// the flow's timers.
pub struct Forwarder {
    id: FlowId,
    key: FlowKey,
    cell: Mutex<FlowCell>,
    shared: Arc<EngineShared>,
    redirected: AtomicBool,
    destroyed: AtomicBool,
    timers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Self-handle for the tasks this flow spawns
    me: Weak<Forwarder>,
}

impl Forwarder {
    pub(crate) fn new(id: FlowId, key: FlowKey, shared: Arc<EngineShared>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            key,
            cell: Mutex::new(FlowCell::new(&shared.config.tcp)),
            shared,
            redirected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            timers: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn is_redirected(&self) -> bool {
        self.redirected.load(Ordering::Relaxed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn is_idle(&self) -> bool {
        self.cell.lock().is_idle(self.shared.config.tcp.idle_timeout)
    }

    pub fn set_tls_handshaking(&self, active: bool) {
        self.cell.lock().set_tls_handshaking(active);
    }

    /// Drive the flow with one inbound segment.
    pub async fn handle_segment(&self, seg: &TcpSegment, payload: &[u8]) {
        if self.is_destroyed() {
            return;
        }
        let actions = self.cell.lock().on_segment(seg, payload);
        self.run_actions(actions).await;
    }

    async fn run_actions(&self, actions: Vec<FlowAction>) {
        for action in actions {
            match action {
                FlowAction::Send(template) => self.send_template(template).await,
                FlowAction::OpenOutbound => self.spawn_connect(),
                FlowAction::QueueWrite(write) => self.shared.io.queue_write(self.id, write),
                FlowAction::ScheduleFin => self.schedule(Duration::ZERO, TimerKind::Fin),
                FlowAction::ScheduleClose => self.schedule(Duration::ZERO, TimerKind::Close),
                FlowAction::ScheduleLinger => {
                    self.schedule(self.shared.config.tcp.linger, TimerKind::Close)
                }
                FlowAction::Destroy => self.destroy().await,
            }
        }
    }

    async fn send_template(&self, template: SegmentTemplate) {
        let pkt = build_ipv4_tcp(
            self.key.dst,
            self.key.src,
            template.seq,
            template.ack,
            template.flags,
            self.shared.config.tcp.recv_window,
            &template.payload,
            template.mss,
        );
        self.shared.stats.record_sent(pkt.len());
        if self.shared.tun_tx.send(BytesMut::from(&pkt[..])).await.is_err() {
            warn!("Virtual interface channel closed");
        }
    }

    /// Open the outbound channel, redirecting TLS flows to the terminator
    /// when interception is enabled.
    fn spawn_connect(&self) {
        let fw = match self.me.upgrade() {
            Some(fw) => fw,
            None => return,
        };
        let handle = tokio::spawn(async move {
            let shared = fw.shared.clone();
            let mut target = fw.key.dst.socket_addr();
            if shared.config.intercept.enabled && fw.key.dst.port == shared.config.intercept.tls_port
            {
                if let Some(addr) = shared.terminator_addr.get() {
                    fw.redirected.store(true, Ordering::Relaxed);
                    shared.stats.record_flow_redirected();
                    target = *addr;
                }
            }

            match shared.dialer.connect(target).await {
                Ok(stream) => {
                    if fw.is_destroyed() {
                        return;
                    }
                    if let Ok(local) = stream.local_addr() {
                        shared.flows.bind_local_port(local.port(), fw.id);
                    }
                    let actions = fw.cell.lock().on_outbound_connected();
                    shared.io.register(fw.clone(), stream);
                    fw.run_actions(actions).await;
                }
                Err(e) => {
                    use std::io::ErrorKind;
                    match e.kind() {
                        ErrorKind::ConnectionRefused | ErrorKind::TimedOut => {
                            // Mirror "no network" rather than "port closed"
                            debug!(flow = %fw.key, "Outbound connect failed, dropping: {}", e);
                            fw.destroy().await;
                        }
                        _ => {
                            warn!(flow = %fw.key, "Outbound connect error: {}", e);
                            let rst = fw.cell.lock().make_rst();
                            fw.send_template(rst).await;
                            fw.destroy().await;
                        }
                    }
                }
            }
        });
        self.timers.lock().push(handle);
    }

    /// Bytes read from the real server: segmentize by MSS and synthesize
    /// data segments toward the client.
    pub(crate) async fn handle_server_bytes(&self, data: &[u8]) {
        let (base_seq, ack, mss) = match self.cell.lock().reserve_outbound(data.len() as u32) {
            Some(reservation) => reservation,
            None => return,
        };

        let mss = mss as usize;
        let mut offset = 0;
        let mut seq = base_seq;
        while offset < data.len() {
            let end = (offset + mss).min(data.len());
            let chunk = &data[offset..end];
            let flags = if end == data.len() {
                TcpFlags::psh_ack()
            } else {
                TcpFlags::ack_only()
            };
            let pkt = build_ipv4_tcp(
                self.key.dst,
                self.key.src,
                seq,
                ack,
                flags,
                self.shared.config.tcp.recv_window,
                chunk,
                None,
            );
            self.shared.stats.record_sent(pkt.len());
            if self.shared.tun_tx.send(BytesMut::from(&pkt[..])).await.is_err() {
                return;
            }
            seq = seq.wrapping_add(chunk.len() as u32);
            offset = end;
        }
    }

    pub(crate) async fn handle_server_eof(&self) {
        let actions = self.cell.lock().on_outbound_eof();
        self.run_actions(actions).await;
    }

    pub(crate) async fn handle_server_error(&self, err: &std::io::Error) {
        debug!(flow = %self.key, "Outbound channel error: {}", err);
        let actions = self.cell.lock().on_outbound_error();
        self.run_actions(actions).await;
    }

    /// A queued write reached the real server; inject the deferred ACK.
    pub(crate) async fn write_completed(&self, ack: Option<u32>) {
        if let Some(ack) = ack {
            let template = {
                let cell = self.cell.lock();
                SegmentTemplate::control(TcpFlags::ack_only(), cell.snd_nxt(), ack)
            };
            self.send_template(template).await;
        }
    }

    /// RST the client and tear the flow down (TLS handshake failures).
    pub(crate) async fn reset_flow(&self) {
        if self.is_destroyed() {
            return;
        }
        let rst = self.cell.lock().make_rst();
        self.send_template(rst).await;
        self.destroy().await;
    }

    fn schedule(&self, delay: Duration, kind: TimerKind) {
        let fw = match self.me.upgrade() {
            Some(fw) => fw,
            None => return,
        };
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match kind {
                TimerKind::Fin => {
                    let actions = fw.cell.lock().on_fin_timer();
                    fw.run_actions(actions).await;
                }
                TimerKind::Close => fw.destroy().await,
            }
        });
        self.timers.lock().push(handle);
    }

    /// Remove the flow from every shared map, cancel its registrations and
    /// timers, close the channel and notify the filter. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.timers.lock().drain(..) {
            handle.abort();
        }
        self.shared.io.deregister(self.id);
        self.shared.flows.release(self.id);
        self.cell.lock().set_closed();
        self.shared.filter.connection_closed(self.key);
        self.shared.stats.record_flow_closed();
        debug!(flow = %self.key, "Flow destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(flags: TcpFlags, seq: u32, ack: u32, payload_len: usize) -> TcpSegment {
        TcpSegment {
            src_port: 5000,
            dst_port: 443,
            seq,
            ack,
            flags,
            window: 65535,
            mss: Some(1460),
            header_len: 20,
            payload_offset: 40,
            payload_len,
        }
    }

    fn cell() -> FlowCell {
        FlowCell::new(&TcpConfig::default())
    }

    /// SYN + connect completion; returns the synthesized initial sequence.
    fn open(cell: &mut FlowCell) -> u32 {
        let actions = cell.on_segment(&seg(TcpFlags::syn_only(), 1000, 0, 0), &[]);
        assert_eq!(actions, vec![FlowAction::OpenOutbound]);
        assert_eq!(cell.server_state(), TcpState::Listen);
        assert_eq!(cell.client_state(), TcpState::SynSent);

        let actions = cell.on_outbound_connected();
        assert_eq!(cell.server_state(), TcpState::SynReceived);
        let template = match &actions[..] {
            [FlowAction::Send(t)] => t.clone(),
            other => panic!("expected one Send, got {:?}", other),
        };
        assert_eq!(template.flags, TcpFlags::syn_ack());
        assert_eq!(template.ack, 1001);
        assert!(template.mss.is_some());
        template.seq
    }

    fn establish(cell: &mut FlowCell) -> u32 {
        let iss = open(cell);
        let actions = cell.on_segment(&seg(TcpFlags::ack_only(), 1001, iss.wrapping_add(1), 0), &[]);
        assert!(actions.is_empty());
        assert_eq!(cell.server_state(), TcpState::Established);
        assert_eq!(cell.client_state(), TcpState::Established);
        iss
    }

    #[test]
    fn full_lifecycle_never_skips_established() {
        let mut cell = cell();
        let mut states = vec![cell.server_state()];

        let iss = establish(&mut cell);
        states.push(cell.server_state());

        let actions = cell.on_segment(
            &seg(TcpFlags::psh_ack(), 1001, iss.wrapping_add(1), 5),
            b"hello",
        );
        assert_eq!(
            actions,
            vec![FlowAction::QueueWrite(PendingWrite {
                data: b"hello".to_vec(),
                ack_on_complete: Some(1006),
            })]
        );
        states.push(cell.server_state());

        let actions = cell.on_segment(&seg(TcpFlags::fin_ack(), 1006, iss.wrapping_add(1), 0), &[]);
        assert_eq!(cell.server_state(), TcpState::CloseWait);
        match &actions[..] {
            [FlowAction::Send(ack), FlowAction::ScheduleFin] => {
                assert_eq!(ack.flags, TcpFlags::ack_only());
                assert_eq!(ack.ack, 1007);
            }
            other => panic!("expected Send+ScheduleFin, got {:?}", other),
        }
        states.push(cell.server_state());

        let actions = cell.on_fin_timer();
        assert_eq!(cell.server_state(), TcpState::LastAck);
        match &actions[..] {
            [FlowAction::Send(fin)] => {
                assert_eq!(fin.flags, TcpFlags::fin_ack());
                assert_eq!(fin.seq, iss.wrapping_add(1));
                assert_eq!(fin.ack, 1007);
            }
            other => panic!("expected one FIN, got {:?}", other),
        }
        states.push(cell.server_state());

        let actions = cell.on_segment(&seg(TcpFlags::ack_only(), 1007, iss.wrapping_add(2), 0), &[]);
        assert_eq!(actions, vec![FlowAction::ScheduleLinger]);
        states.push(cell.server_state());

        assert_eq!(
            states,
            vec![
                TcpState::Listen,
                TcpState::Established,
                TcpState::Established,
                TcpState::CloseWait,
                TcpState::LastAck,
                TcpState::TimeWait,
            ]
        );
    }

    #[test]
    fn rst_in_listen_destroys_silently() {
        let mut cell = cell();
        let actions = cell.on_segment(&seg(TcpFlags::rst_only(), 1000, 0, 0), &[]);
        assert_eq!(actions, vec![FlowAction::Destroy]);
    }

    #[test]
    fn fin_with_payload_acks_exactly_once() {
        let mut cell = cell();
        let iss = establish(&mut cell);

        let mut flags = TcpFlags::fin_ack();
        flags.psh = true;
        let actions = cell.on_segment(&seg(flags, 1001, iss.wrapping_add(1), 4), b"data");

        // Exactly one ACK (covering payload + FIN) and one scheduled FIN;
        // the queued write must not emit a second, stale ACK
        match &actions[..] {
            [FlowAction::QueueWrite(write), FlowAction::Send(ack), FlowAction::ScheduleFin] => {
                assert_eq!(write.data, b"data".to_vec());
                assert_eq!(write.ack_on_complete, None);
                assert_eq!(ack.flags, TcpFlags::ack_only());
                assert_eq!(ack.ack, 1001u32.wrapping_add(4).wrapping_add(1));
            }
            other => panic!("unexpected actions {:?}", other),
        }
        assert_eq!(cell.server_state(), TcpState::CloseWait);
        assert_eq!(cell.client_state(), TcpState::FinWait2);
    }

    #[test]
    fn simultaneous_close_goes_through_closing() {
        let mut cell = cell();
        let iss = establish(&mut cell);

        // We initiate: real server hit EOF
        let actions = cell.on_outbound_eof();
        assert_eq!(cell.server_state(), TcpState::FinWait1);
        match &actions[..] {
            [FlowAction::Send(fin)] => assert_eq!(fin.seq, iss.wrapping_add(1)),
            other => panic!("expected our FIN, got {:?}", other),
        }

        // Client FINs without acking ours
        let actions = cell.on_segment(&seg(TcpFlags::fin_ack(), 1001, iss.wrapping_add(1), 0), &[]);
        assert_eq!(cell.server_state(), TcpState::Closing);
        match &actions[..] {
            [FlowAction::Send(ack)] => {
                assert_eq!(ack.flags, TcpFlags::ack_only());
                assert_eq!(ack.ack, 1002);
            }
            other => panic!("expected ACK of peer FIN, got {:?}", other),
        }

        // ACK of our FIN finishes the exchange
        let actions = cell.on_segment(&seg(TcpFlags::ack_only(), 1002, iss.wrapping_add(2), 0), &[]);
        assert_eq!(actions, vec![FlowAction::ScheduleLinger]);
        assert_eq!(cell.server_state(), TcpState::TimeWait);
    }

    #[test]
    fn fin_wait_progression() {
        let mut cell = cell();
        let iss = establish(&mut cell);
        cell.on_outbound_eof();
        assert_eq!(cell.server_state(), TcpState::FinWait1);

        let actions = cell.on_segment(&seg(TcpFlags::ack_only(), 1001, iss.wrapping_add(2), 0), &[]);
        assert!(actions.is_empty());
        assert_eq!(cell.server_state(), TcpState::FinWait2);

        let actions = cell.on_segment(&seg(TcpFlags::fin_ack(), 1001, iss.wrapping_add(2), 0), &[]);
        assert_eq!(cell.server_state(), TcpState::TimeWait);
        match &actions[..] {
            [FlowAction::Send(ack), FlowAction::ScheduleLinger] => {
                assert_eq!(ack.ack, 1002);
            }
            other => panic!("expected ACK + linger, got {:?}", other),
        }

        // TIME_WAIT only acknowledges
        let actions = cell.on_segment(&seg(TcpFlags::fin_ack(), 1001, iss.wrapping_add(2), 0), &[]);
        assert!(matches!(&actions[..], [FlowAction::Send(_)]));
    }

    #[test]
    fn syn_in_established_is_a_violation() {
        let mut cell = cell();
        let iss = establish(&mut cell);

        let actions = cell.on_segment(&seg(TcpFlags::syn_only(), 9999, 0, 0), &[]);
        match &actions[..] {
            [FlowAction::Send(rst), FlowAction::ScheduleClose] => {
                assert!(rst.flags.rst);
                assert_eq!(rst.seq, iss.wrapping_add(1));
                assert_eq!(rst.ack, 10000);
            }
            other => panic!("expected RST + close, got {:?}", other),
        }
    }

    #[test]
    fn syn_received_reverts_to_listen_on_junk() {
        let mut cell = cell();
        let iss = open(&mut cell);

        let actions = cell.on_segment(
            &seg(TcpFlags::psh_ack(), 1001, iss.wrapping_add(777), 3),
            b"abc",
        );
        assert_eq!(cell.server_state(), TcpState::Listen);
        assert_eq!(cell.client_state(), TcpState::Closed);
        // Reflects the client's sequence and stops; the flow is not destroyed
        match &actions[..] {
            [FlowAction::Send(rst)] => {
                assert!(rst.flags.rst);
                assert_eq!(rst.ack, 1004);
            }
            other => panic!("expected reflecting RST, got {:?}", other),
        }
    }

    #[test]
    fn handshake_ack_with_payload_forwards_it() {
        let mut cell = cell();
        let iss = open(&mut cell);

        let actions = cell.on_segment(&seg(TcpFlags::psh_ack(), 1001, iss.wrapping_add(1), 3), b"GET");
        assert_eq!(cell.server_state(), TcpState::Established);
        assert_eq!(
            actions,
            vec![FlowAction::QueueWrite(PendingWrite {
                data: b"GET".to_vec(),
                ack_on_complete: Some(1004),
            })]
        );
    }

    #[test]
    fn rst_is_deferred_during_tls_handshake() {
        let mut cell = cell();
        establish(&mut cell);

        cell.set_tls_handshaking(true);
        let actions = cell.on_segment(&seg(TcpFlags::rst_only(), 1001, 0, 0), &[]);
        assert!(actions.is_empty());
        assert_eq!(cell.server_state(), TcpState::Established);

        cell.set_tls_handshaking(false);
        let actions = cell.on_segment(&seg(TcpFlags::rst_only(), 1001, 0, 0), &[]);
        assert_eq!(actions, vec![FlowAction::ScheduleClose]);
    }

    #[test]
    fn retransmission_is_reacked_not_requeued() {
        let mut cell = cell();
        let iss = establish(&mut cell);

        let first = cell.on_segment(&seg(TcpFlags::psh_ack(), 1001, iss.wrapping_add(1), 5), b"hello");
        assert!(matches!(&first[..], [FlowAction::QueueWrite(_)]));

        let replay = cell.on_segment(&seg(TcpFlags::psh_ack(), 1001, iss.wrapping_add(1), 5), b"hello");
        match &replay[..] {
            [FlowAction::Send(ack)] => {
                assert_eq!(ack.flags, TcpFlags::ack_only());
                assert_eq!(ack.ack, 1006);
            }
            other => panic!("expected re-ACK, got {:?}", other),
        }
    }

    #[test]
    fn out_of_order_data_is_dropped() {
        let mut cell = cell();
        let iss = establish(&mut cell);

        let actions = cell.on_segment(&seg(TcpFlags::psh_ack(), 4000, iss.wrapping_add(1), 5), b"ahead");
        assert!(actions.is_empty());
        assert_eq!(cell.rcv_nxt(), 1001);
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut cell = cell();
        // Client ISN near the wrap point
        let actions = cell.on_segment(&seg(TcpFlags::syn_only(), u32::MAX - 1, 0, 0), &[]);
        assert_eq!(actions, vec![FlowAction::OpenOutbound]);
        cell.on_outbound_connected();
        assert_eq!(cell.rcv_nxt(), u32::MAX);

        let iss = cell.snd_nxt().wrapping_sub(1);
        cell.on_segment(&seg(TcpFlags::ack_only(), u32::MAX, iss.wrapping_add(1), 0), &[]);
        assert_eq!(cell.server_state(), TcpState::Established);

        let actions = cell.on_segment(&seg(TcpFlags::psh_ack(), u32::MAX, iss.wrapping_add(1), 8), b"wrapping");
        match &actions[..] {
            [FlowAction::QueueWrite(write)] => {
                // 0xFFFFFFFF + 8 wraps to 7
                assert_eq!(write.ack_on_complete, Some(7));
            }
            other => panic!("expected queued write, got {:?}", other),
        }
    }

    #[test]
    fn reserve_outbound_stops_after_fin() {
        let mut cell = cell();
        establish(&mut cell);
        assert!(cell.reserve_outbound(10).is_some());

        cell.on_outbound_eof();
        assert!(cell.reserve_outbound(10).is_none());
    }
}
