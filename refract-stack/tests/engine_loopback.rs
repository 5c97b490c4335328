//! End-to-end engine tests against real sockets on localhost: synthesized
//! segments go in through the virtual-interface seam, response segments
//! come back out of it.

use bytes::BytesMut;
use refract_core::{ChannelInterface, EngineConfig};
use refract_stack::Engine;
use refract_wire::{build_ipv4_tcp, parse_datagram, TcpFlags, TcpSegment, Transport, Tuple};
use std::net::Ipv4Addr;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct EmptySource;

impl refract_sock2app::ConnectionSource for EmptySource {
    fn scan(&self) -> refract_sock2app::Result<Vec<refract_sock2app::SocketOwner>> {
        Ok(Vec::new())
    }
}

fn client() -> Tuple {
    Tuple::new(Ipv4Addr::new(10, 0, 0, 2), 5000)
}

fn inject(
    tx: &std::sync::mpsc::Sender<BytesMut>,
    src: Tuple,
    dst: Tuple,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
    mss: Option<u16>,
) {
    let pkt = build_ipv4_tcp(src, dst, seq, ack, flags, 65535, payload, mss);
    tx.send(BytesMut::from(&pkt[..])).expect("inject");
}

/// Pull the next synthesized TCP segment off the interface, skipping
/// anything else, within `timeout`.
fn recv_tcp(rx: &Receiver<BytesMut>, timeout: Duration) -> Option<(TcpSegment, Vec<u8>)> {
    tokio::task::block_in_place(|| {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let pkt = rx.recv_timeout(remaining).ok()?;
            let parsed = parse_datagram(&pkt).expect("engine emitted malformed datagram");
            if let Transport::Tcp(seg) = parsed.transport {
                let payload = seg.payload(&pkt).to_vec();
                return Some((seg, payload));
            }
        }
    })
}

async fn spawn_echo_server() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (port, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn syn_data_echo_fin_lifecycle() {
    let (port, _server) = spawn_echo_server().await;
    let server = Tuple::new(Ipv4Addr::LOCALHOST, port);

    let (iface, in_tx, out_rx) = ChannelInterface::pair();
    let engine = Engine::builder()
        .intercept(false)
        .connection_source(Box::new(EmptySource))
        .build(iface)
        .await
        .unwrap();
    engine.start().await.unwrap();

    // Handshake
    inject(&in_tx, client(), server, 1000, 0, TcpFlags::syn_only(), &[], Some(1460));
    let (synack, _) = recv_tcp(&out_rx, Duration::from_secs(3)).expect("no SYN-ACK");
    assert!(synack.flags.syn && synack.flags.ack);
    assert_eq!(synack.ack, 1001);
    assert!(synack.mss.is_some(), "SYN-ACK must carry the MSS option");
    let iss = synack.seq;

    inject(&in_tx, client(), server, 1001, iss.wrapping_add(1), TcpFlags::ack_only(), &[], None);
    assert_eq!(engine.flow_count(), 1);

    // Data out, echo back. The ACK of our data fires only after the
    // outbound write completed; collect both without assuming an order.
    inject(&in_tx, client(), server, 1001, iss.wrapping_add(1), TcpFlags::psh_ack(), b"ping", None);

    let mut got_ack = false;
    let mut got_echo = false;
    for _ in 0..10 {
        let (seg, payload) = recv_tcp(&out_rx, Duration::from_secs(3)).expect("segment");
        if payload == b"ping" {
            assert_eq!(seg.seq, iss.wrapping_add(1), "echo must start at our snd_nxt");
            got_echo = true;
        } else if seg.flags.ack && !seg.flags.syn && seg.ack == 1005 {
            got_ack = true;
        }
        if got_ack && got_echo {
            break;
        }
    }
    assert!(got_ack, "no ACK of the client data");
    assert!(got_echo, "echo payload never came back");

    // Acknowledge the echoed data, then close from the client side
    inject(&in_tx, client(), server, 1005, iss.wrapping_add(5), TcpFlags::ack_only(), &[], None);
    inject(&in_tx, client(), server, 1005, iss.wrapping_add(5), TcpFlags::fin_ack(), &[], None);

    // Exactly one ACK of the FIN (ack = seq + 1) followed by our FIN
    let mut fin_seq = None;
    let mut fin_ack_seen = false;
    for _ in 0..10 {
        let (seg, _) = recv_tcp(&out_rx, Duration::from_secs(3)).expect("close segment");
        if seg.flags.fin {
            assert_eq!(seg.ack, 1006);
            fin_seq = Some(seg.seq);
            break;
        }
        if seg.flags.ack && seg.ack == 1006 {
            assert!(!fin_ack_seen, "FIN must be acked exactly once");
            fin_ack_seen = true;
        }
    }
    assert!(fin_ack_seen, "client FIN never acked");
    let fin_seq = fin_seq.expect("engine never sent its FIN");

    // Complete the close; after the linger the flow is gone
    inject(&in_tx, client(), server, 1006, fin_seq.wrapping_add(1), TcpFlags::ack_only(), &[], None);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.flow_count(), 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_datagram_creates_no_flow() {
    let (iface, in_tx, _out_rx) = ChannelInterface::pair();
    let engine = Engine::builder()
        .intercept(false)
        .connection_source(Box::new(EmptySource))
        .build(iface)
        .await
        .unwrap();
    engine.start().await.unwrap();

    // Shorter than a minimum IPv4 header
    in_tx.send(BytesMut::from(&[0x45u8, 0x00][..])).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(engine.flow_count(), 0);
    assert!(engine.stats().parse_errors() >= 1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_refused_drops_silently() {
    // Grab a port with no listener behind it
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let server = Tuple::new(Ipv4Addr::LOCALHOST, port);

    let (iface, in_tx, out_rx) = ChannelInterface::pair();
    let engine = Engine::builder()
        .intercept(false)
        .connection_source(Box::new(EmptySource))
        .build(iface)
        .await
        .unwrap();
    engine.start().await.unwrap();

    inject(&in_tx, client(), server, 1000, 0, TcpFlags::syn_only(), &[], Some(1460));

    // Mirrors "no network": no SYN-ACK, no RST, flow silently gone
    assert!(recv_tcp(&out_rx, Duration::from_secs(1)).is_none());
    assert_eq!(engine.flow_count(), 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redirected_flow_resets_when_probe_fails() {
    // A "TLS" server that drops every connection before the handshake; the
    // certificate probe must fail and the original flow must be reset.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((sock, _)) => drop(sock),
                Err(_) => break,
            }
        }
    });
    let server = Tuple::new(Ipv4Addr::LOCALHOST, port);

    let mut config = EngineConfig::default();
    config.intercept.enabled = true;
    config.intercept.tls_port = port;

    let (iface, in_tx, out_rx) = ChannelInterface::pair();
    let engine = refract_stack::EngineBuilder::with_config(config)
        .connection_source(Box::new(EmptySource))
        .build(iface)
        .await
        .unwrap();
    engine.start().await.unwrap();
    assert!(engine.terminator_port().is_some());
    assert!(engine.ca_cert_pem().is_some());

    inject(&in_tx, client(), server, 1000, 0, TcpFlags::syn_only(), &[], Some(1460));

    // The flow is redirected to the local terminator, so the SYN-ACK
    // arrives even though the "real server" never speaks TLS
    let (synack, _) = recv_tcp(&out_rx, Duration::from_secs(3)).expect("no SYN-ACK");
    assert!(synack.flags.syn && synack.flags.ack);
    assert_eq!(engine.stats().flows_redirected(), 1);

    inject(&in_tx, client(), server, 1001, synack.seq.wrapping_add(1), TcpFlags::ack_only(), &[], None);

    // Probe failure resets the original flow
    let mut got_rst = false;
    for _ in 0..10 {
        match recv_tcp(&out_rx, Duration::from_secs(3)) {
            Some((seg, _)) if seg.flags.rst => {
                got_rst = true;
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert!(got_rst, "client never saw the reset");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.flow_count(), 0);

    engine.shutdown().await;
}
