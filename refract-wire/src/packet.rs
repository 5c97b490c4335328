//! IPv4/TCP/UDP parsing and synthesis.
//!
//! Decoding leans on smoltcp's wire types for bounds validation; encoding is
//! manual header construction with one's-complement checksums so synthesized
//! segments are byte-exact against real OS stacks.

use crate::error::{Result, WireError};
use crate::tuple::{FlowKey, Tuple};
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_MSS: u16 = 1360;

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const TTL: u8 = 64;

/// TCP control bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_only() -> Self {
        Self {
            syn: true,
            ..Default::default()
        }
    }
    pub fn syn_ack() -> Self {
        Self {
            syn: true,
            ack: true,
            ..Default::default()
        }
    }
    pub fn ack_only() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }
    pub fn fin_ack() -> Self {
        Self {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }
    pub fn rst_only() -> Self {
        Self {
            rst: true,
            ..Default::default()
        }
    }
    pub fn rst_ack() -> Self {
        Self {
            rst: true,
            ack: true,
            ..Default::default()
        }
    }
    pub fn psh_ack() -> Self {
        Self {
            psh: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut bits = 0u8;
        if self.fin {
            bits |= 0x01;
        }
        if self.syn {
            bits |= 0x02;
        }
        if self.rst {
            bits |= 0x04;
        }
        if self.psh {
            bits |= 0x08;
        }
        if self.ack {
            bits |= 0x10;
        }
        bits
    }
}

/// Decoded TCP segment; offsets are absolute into the original datagram so
/// callers can slice the payload without copying.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// MSS option value, present on SYN segments that carry it
    pub mss: Option<u16>,
    pub header_len: usize,
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl TcpSegment {
    pub fn payload<'a>(&self, datagram: &'a [u8]) -> &'a [u8] {
        &datagram[self.payload_offset..self.payload_offset + self.payload_len]
    }
}

/// Decoded UDP datagram
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl UdpDatagram {
    pub fn payload<'a>(&self, datagram: &'a [u8]) -> &'a [u8] {
        &datagram[self.payload_offset..self.payload_offset + self.payload_len]
    }
}

/// Transport layer of a parsed datagram
#[derive(Debug, Clone)]
pub enum Transport {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
    Icmp,
    Other(u8),
}

/// Result of decoding one IP datagram
#[derive(Debug, Clone)]
pub struct ParsedDatagram {
    pub version: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: u8,
    /// IP header length in bytes
    pub header_len: usize,
    /// Total datagram length from the IP header (payload bounds derive from
    /// this, never from the buffer length)
    pub total_len: usize,
    pub transport: Transport,
}

impl ParsedDatagram {
    pub fn src_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(t) => Some(SocketAddr::new(self.src_addr, t.src_port)),
            Transport::Udp(u) => Some(SocketAddr::new(self.src_addr, u.src_port)),
            _ => None,
        }
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(t) => Some(SocketAddr::new(self.dst_addr, t.dst_port)),
            Transport::Udp(u) => Some(SocketAddr::new(self.dst_addr, u.dst_port)),
            _ => None,
        }
    }

    /// Flow key for IPv4 TCP/UDP datagrams
    pub fn flow_key(&self) -> Option<FlowKey> {
        let (src, dst) = match (self.src_addr, self.dst_addr) {
            (IpAddr::V4(s), IpAddr::V4(d)) => (s, d),
            _ => return None,
        };
        match &self.transport {
            Transport::Tcp(t) => Some(FlowKey::new(
                Tuple::new(src, t.src_port),
                Tuple::new(dst, t.dst_port),
            )),
            Transport::Udp(u) => Some(FlowKey::new(
                Tuple::new(src, u.src_port),
                Tuple::new(dst, u.dst_port),
            )),
            _ => None,
        }
    }

    pub fn is_tcp_syn(&self) -> bool {
        matches!(&self.transport, Transport::Tcp(t) if t.flags.syn && !t.flags.ack)
    }
}

/// Decode one IP datagram. Any malformation maps to a [`WireError`];
/// callers treat that as "drop".
pub fn parse_datagram(data: &[u8]) -> Result<ParsedDatagram> {
    if data.is_empty() {
        return Err(WireError::PacketTooShort {
            expected: IPV4_HEADER_LEN,
            actual: 0,
        });
    }

    match (data[0] >> 4) & 0x0F {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        v => Err(WireError::InvalidIpVersion(v)),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<ParsedDatagram> {
    if data.len() < IPV4_HEADER_LEN {
        return Err(WireError::PacketTooShort {
            expected: IPV4_HEADER_LEN,
            actual: data.len(),
        });
    }

    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| WireError::InvalidPacket(format!("IPv4: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    let total_len = pkt.total_len() as usize;
    let protocol = pkt.next_header();
    let payload = pkt.payload();

    let transport = parse_transport(protocol, payload, header_len)?;

    Ok(ParsedDatagram {
        version: 4,
        src_addr: IpAddr::V4(pkt.src_addr()),
        dst_addr: IpAddr::V4(pkt.dst_addr()),
        protocol: protocol.into(),
        header_len,
        total_len,
        transport,
    })
}

fn parse_ipv6(data: &[u8]) -> Result<ParsedDatagram> {
    let pkt = Ipv6Packet::new_checked(data)
        .map_err(|e| WireError::InvalidPacket(format!("IPv6: {}", e)))?;

    let header_len = 40;
    let protocol = pkt.next_header();
    let payload = pkt.payload();

    let transport = parse_transport(protocol, payload, header_len)?;

    Ok(ParsedDatagram {
        version: 6,
        src_addr: IpAddr::V6(pkt.src_addr()),
        dst_addr: IpAddr::V6(pkt.dst_addr()),
        protocol: protocol.into(),
        header_len,
        total_len: header_len + payload.len(),
        transport,
    })
}

fn parse_transport(protocol: IpProtocol, payload: &[u8], base: usize) -> Result<Transport> {
    match protocol {
        IpProtocol::Tcp => parse_tcp(payload, base),
        IpProtocol::Udp => parse_udp(payload, base),
        IpProtocol::Icmp | IpProtocol::Icmpv6 => Ok(Transport::Icmp),
        other => Ok(Transport::Other(other.into())),
    }
}

fn parse_tcp(data: &[u8], base: usize) -> Result<Transport> {
    let pkt =
        TcpPacket::new_checked(data).map_err(|e| WireError::InvalidPacket(format!("TCP: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    if header_len < TCP_HEADER_LEN || header_len > data.len() {
        return Err(WireError::PacketTooShort {
            expected: header_len,
            actual: data.len(),
        });
    }

    Ok(Transport::Tcp(TcpSegment {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        mss: parse_mss_option(&data[TCP_HEADER_LEN..header_len]),
        header_len,
        payload_offset: base + header_len,
        payload_len: data.len() - header_len,
    }))
}

fn parse_mss_option(opts: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break,
            1 => i += 1,
            2 if i + 4 <= opts.len() && opts[i + 1] == 4 => {
                return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
            }
            _ => {
                if i + 1 < opts.len() && opts[i + 1] >= 2 {
                    i += opts[i + 1] as usize;
                } else {
                    break;
                }
            }
        }
    }
    None
}

fn parse_udp(data: &[u8], base: usize) -> Result<Transport> {
    let pkt =
        UdpPacket::new_checked(data).map_err(|e| WireError::InvalidPacket(format!("UDP: {}", e)))?;

    Ok(Transport::Udp(UdpDatagram {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        payload_offset: base + UDP_HEADER_LEN,
        payload_len: pkt.payload().len(),
    }))
}

static IP_ID: AtomicU16 = AtomicU16::new(1);

/// Build an IPv4/TCP datagram. The MSS option is emitted only on SYN
/// segments; the IP id counter wraps at 16 bits.
pub fn build_ipv4_tcp(
    src: Tuple,
    dst: Tuple,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    mss: Option<u16>,
) -> Vec<u8> {
    let opts_len = if flags.syn && mss.is_some() { 4 } else { 0 };
    let tcp_len = TCP_HEADER_LEN + opts_len;
    let total = IPV4_HEADER_LEN + tcp_len + payload.len();

    let mut pkt = vec![0u8; total];
    write_ipv4_header(&mut pkt, src, dst, total as u16, PROTO_TCP);

    let t = IPV4_HEADER_LEN;
    pkt[t..t + 2].copy_from_slice(&src.port.to_be_bytes());
    pkt[t + 2..t + 4].copy_from_slice(&dst.port.to_be_bytes());
    pkt[t + 4..t + 8].copy_from_slice(&seq.to_be_bytes());
    pkt[t + 8..t + 12].copy_from_slice(&ack.to_be_bytes());
    pkt[t + 12] = ((tcp_len / 4) as u8) << 4;
    pkt[t + 13] = flags.to_byte();
    pkt[t + 14..t + 16].copy_from_slice(&window.to_be_bytes());

    if opts_len > 0 {
        // Option 2 (MSS), length 4
        let mss_val = mss.unwrap_or(DEFAULT_MSS);
        pkt[t + 20] = 2;
        pkt[t + 21] = 4;
        pkt[t + 22..t + 24].copy_from_slice(&mss_val.to_be_bytes());
    }

    let p = t + tcp_len;
    pkt[p..p + payload.len()].copy_from_slice(payload);

    let cksum = transport_checksum(&src.addr.octets(), &dst.addr.octets(), PROTO_TCP, &pkt[t..]);
    pkt[t + 16..t + 18].copy_from_slice(&cksum.to_be_bytes());

    pkt
}

/// Build an IPv4/UDP datagram
pub fn build_ipv4_udp(src: Tuple, dst: Tuple, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut pkt = vec![0u8; total];
    write_ipv4_header(&mut pkt, src, dst, total as u16, PROTO_UDP);

    let t = IPV4_HEADER_LEN;
    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    pkt[t..t + 2].copy_from_slice(&src.port.to_be_bytes());
    pkt[t + 2..t + 4].copy_from_slice(&dst.port.to_be_bytes());
    pkt[t + 4..t + 6].copy_from_slice(&udp_len.to_be_bytes());

    pkt[t + UDP_HEADER_LEN..].copy_from_slice(payload);

    let cksum = transport_checksum(&src.addr.octets(), &dst.addr.octets(), PROTO_UDP, &pkt[t..]);
    // A computed zero must be transmitted as all-ones for UDP
    let cksum = if cksum == 0 { 0xFFFF } else { cksum };
    pkt[t + 6..t + 8].copy_from_slice(&cksum.to_be_bytes());

    pkt
}

fn write_ipv4_header(pkt: &mut [u8], src: Tuple, dst: Tuple, total_len: u16, protocol: u8) {
    pkt[0] = 0x45;
    pkt[1] = 0x00;
    pkt[2..4].copy_from_slice(&total_len.to_be_bytes());

    let id = IP_ID.fetch_add(1, Ordering::Relaxed);
    pkt[4..6].copy_from_slice(&id.to_be_bytes());

    // Don't-fragment, no offset
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = TTL;
    pkt[9] = protocol;
    pkt[12..16].copy_from_slice(&src.addr.octets());
    pkt[16..20].copy_from_slice(&dst.addr.octets());

    let cksum = ones_complement(&pkt[..IPV4_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&cksum.to_be_bytes());
}

fn fold_sum(data: &[u8], mut sum: u32) -> u32 {
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    sum
}

fn finish_sum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// One's-complement checksum over a header block (IPv4 header checksum)
fn ones_complement(data: &[u8]) -> u16 {
    finish_sum(fold_sum(data, 0))
}

/// One's-complement checksum over the pseudo-header plus segment
fn transport_checksum(src: &[u8; 4], dst: &[u8; 4], proto: u8, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum.wrapping_add(((src[0] as u32) << 8) | src[1] as u32);
    sum = sum.wrapping_add(((src[2] as u32) << 8) | src[3] as u32);
    sum = sum.wrapping_add(((dst[0] as u32) << 8) | dst[1] as u32);
    sum = sum.wrapping_add(((dst[2] as u32) << 8) | dst[3] as u32);
    sum = sum.wrapping_add(proto as u32);
    sum = sum.wrapping_add(segment.len() as u32);
    finish_sum(fold_sum(segment, sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn client() -> Tuple {
        Tuple::new(Ipv4Addr::new(10, 0, 0, 2), 5000)
    }

    fn server() -> Tuple {
        Tuple::new(Ipv4Addr::new(93, 184, 216, 34), 443)
    }

    fn tcp_of(parsed: &ParsedDatagram) -> &TcpSegment {
        match &parsed.transport {
            Transport::Tcp(t) => t,
            other => panic!("expected TCP, got {:?}", other),
        }
    }

    /// Recompute both checksums from scratch and compare with the stored ones.
    fn checksums_valid(datagram: &[u8]) -> bool {
        let ihl = ((datagram[0] & 0x0F) as usize) * 4;
        let mut header = datagram[..ihl].to_vec();
        let stored_ip = u16::from_be_bytes([header[10], header[11]]);
        header[10] = 0;
        header[11] = 0;
        if ones_complement(&header) != stored_ip {
            return false;
        }

        let total = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
        let mut segment = datagram[ihl..total].to_vec();
        let stored_tcp = u16::from_be_bytes([segment[16], segment[17]]);
        segment[16] = 0;
        segment[17] = 0;
        let src: [u8; 4] = datagram[12..16].try_into().unwrap();
        let dst: [u8; 4] = datagram[16..20].try_into().unwrap();
        transport_checksum(&src, &dst, datagram[9], &segment) == stored_tcp
    }

    #[test]
    fn syn_round_trip() {
        let pkt = build_ipv4_tcp(
            client(),
            server(),
            1000,
            0,
            TcpFlags::syn_only(),
            65535,
            &[],
            Some(1460),
        );
        let parsed = parse_datagram(&pkt).unwrap();
        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.protocol, 6);
        assert!(parsed.is_tcp_syn());

        let tcp = tcp_of(&parsed);
        assert_eq!(tcp.src_port, 5000);
        assert_eq!(tcp.dst_port, 443);
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.mss, Some(1460));
        assert_eq!(tcp.header_len, 24);
        assert_eq!(tcp.payload_len, 0);

        let key = parsed.flow_key().unwrap();
        assert_eq!(key.src, client());
        assert_eq!(key.dst, server());
    }

    #[test]
    fn data_segment_payload_bounds() {
        let payload = b"GET / HTTP/1.1\r\n\r\n";
        let mut pkt = build_ipv4_tcp(
            client(),
            server(),
            42,
            7,
            TcpFlags::psh_ack(),
            4096,
            payload,
            None,
        );
        // Trailing bytes beyond the IP total length must not leak into the payload
        pkt.extend_from_slice(&[0xAA; 4]);

        let parsed = parse_datagram(&pkt).unwrap();
        let tcp = tcp_of(&parsed);
        assert_eq!(tcp.payload_len, payload.len());
        assert_eq!(tcp.payload(&pkt), payload);
    }

    #[test]
    fn mss_option_only_on_syn() {
        let pkt = build_ipv4_tcp(
            client(),
            server(),
            1,
            1,
            TcpFlags::ack_only(),
            65535,
            &[],
            Some(1460),
        );
        let parsed = parse_datagram(&pkt).unwrap();
        let tcp = tcp_of(&parsed);
        assert_eq!(tcp.mss, None);
        assert_eq!(tcp.header_len, 20);
    }

    #[test]
    fn malformed_too_short() {
        assert!(parse_datagram(&[]).is_err());
        assert!(parse_datagram(&[0x45, 0x00]).is_err());
        // Truncated below the IPv4 minimum header
        let short = vec![0x45u8; 12];
        assert!(parse_datagram(&short).is_err());
    }

    #[test]
    fn invalid_ip_version() {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x75;
        assert!(matches!(
            parse_datagram(&pkt),
            Err(WireError::InvalidIpVersion(7))
        ));
    }

    #[test]
    fn udp_round_trip() {
        let payload = b"dns-ish";
        let pkt = build_ipv4_udp(client(), server(), payload);
        let parsed = parse_datagram(&pkt).unwrap();
        match &parsed.transport {
            Transport::Udp(u) => {
                assert_eq!(u.src_port, 5000);
                assert_eq!(u.dst_port, 443);
                assert_eq!(u.payload(&pkt), payload);
            }
            other => panic!("expected UDP, got {:?}", other),
        }
    }

    proptest! {
        /// Decode -> re-encode reproduces identical, valid checksums for the
        /// same headers and payload.
        #[test]
        fn checksum_round_trip_law(
            src_port in 1u16..65535,
            dst_port in 1u16..65535,
            seq in any::<u32>(),
            ack in any::<u32>(),
            window in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..1200),
            syn in any::<bool>(),
            psh in any::<bool>(),
        ) {
            let flags = TcpFlags { syn, psh, ack: true, ..Default::default() };
            let src = Tuple::new(Ipv4Addr::new(10, 0, 0, 2), src_port);
            let dst = Tuple::new(Ipv4Addr::new(203, 0, 113, 9), dst_port);

            let built = build_ipv4_tcp(src, dst, seq, ack, flags, window, &payload, None);
            prop_assert!(checksums_valid(&built));

            let parsed = parse_datagram(&built).unwrap();
            let tcp = tcp_of(&parsed);
            prop_assert_eq!(tcp.seq, seq);
            prop_assert_eq!(tcp.ack, ack);
            prop_assert_eq!(tcp.window, window);
            prop_assert_eq!(tcp.payload(&built), &payload[..]);

            // Re-encode from the decoded fields: checksums must again verify
            let rebuilt = build_ipv4_tcp(
                src, dst, tcp.seq, tcp.ack, tcp.flags, tcp.window,
                tcp.payload(&built), tcp.mss,
            );
            prop_assert!(checksums_valid(&rebuilt));
            // Everything after the volatile IP id/checksum fields is identical
            prop_assert_eq!(&rebuilt[..4], &built[..4]);
            prop_assert_eq!(&rebuilt[6..10], &built[6..10]);
            prop_assert_eq!(&rebuilt[12..], &built[12..]);
        }
    }
}
