//! IPv4/TCP demultiplexing of raw tunnel packets.
//!
//! Everything here reads fixed offsets out of a borrowed packet. Packets that
//! fail any check are "not interesting" rather than errors; the tunnel loop
//! forwards them untouched either way.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::classifier::{Classification, TargetDomainSet};
use crate::tls;

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const PROTOCOL_TCP: u8 = 6;
pub const HTTPS_PORT: u16 = 443;

/// Address family tag the tunnel attaches to every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Other(u32),
}

impl AddressFamily {
    /// Maps a platform `AF_*` value. `AF_INET6` differs across platforms.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            2 => AddressFamily::Inet,
            10 | 28 | 30 => AddressFamily::Inet6,
            other => AddressFamily::Other(other),
        }
    }
}

/// One network-layer frame as delivered by the tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub bytes: Vec<u8>,
    pub family: AddressFamily,
}

impl Packet {
    pub fn ipv4(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            family: AddressFamily::Inet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    pub protocol: u8,
    pub fragment_offset: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < IPV4_MIN_HEADER_LEN || packet[0] >> 4 != 4 {
            return None;
        }
        let header_len = usize::from(packet[0] & 0x0f) * 4;
        if header_len < IPV4_MIN_HEADER_LEN || packet.len() < header_len {
            return None;
        }

        Some(Self {
            header_len,
            total_len: usize::from(u16::from_be_bytes([packet[2], packet[3]])),
            protocol: packet[9],
            fragment_offset: u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff,
            source: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            destination: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        })
    }

    /// End of the datagram inside `packet_len` bytes, ignoring link padding.
    fn datagram_end(&self, packet_len: usize) -> usize {
        if self.total_len >= self.header_len && self.total_len <= packet_len {
            self.total_len
        } else {
            packet_len
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub header_len: usize,
    pub source_port: u16,
    pub destination_port: u16,
}

impl TcpHeader {
    pub fn parse(segment: &[u8]) -> Option<Self> {
        if segment.len() < TCP_MIN_HEADER_LEN {
            return None;
        }
        let header_len = usize::from(segment[12] >> 4) * 4;
        if header_len < TCP_MIN_HEADER_LEN || segment.len() < header_len {
            return None;
        }

        Some(Self {
            header_len,
            source_port: u16::from_be_bytes([segment[0], segment[1]]),
            destination_port: u16::from_be_bytes([segment[2], segment[3]]),
        })
    }
}

/// A TCP segment located inside an IPv4 packet, payload borrowed in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    pub payload: &'a [u8],
}

impl TcpSegment<'_> {
    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.source, self.tcp.source_port)
    }

    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.destination, self.tcp.destination_port)
    }
}

pub fn parse_tcp(packet: &[u8]) -> Option<TcpSegment<'_>> {
    let ip = Ipv4Header::parse(packet)?;
    // Later fragments carry no TCP header.
    if ip.protocol != PROTOCOL_TCP || ip.fragment_offset != 0 {
        return None;
    }

    let datagram = &packet[..ip.datagram_end(packet.len())];
    let segment = datagram.get(ip.header_len..)?;
    let tcp = TcpHeader::parse(segment)?;

    Some(TcpSegment {
        ip,
        tcp,
        payload: &segment[tcp.header_len..],
    })
}

/// A non-empty TCP payload headed for port 443, the only traffic worth
/// handing to the ClientHello parser.
pub fn demultiplex(packet: &[u8]) -> Option<TcpSegment<'_>> {
    parse_tcp(packet).filter(|s| s.tcp.destination_port == HTTPS_PORT && !s.payload.is_empty())
}

/// Result of one parse pass over a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub classification: Classification,
    /// Source and destination of the flow, set whenever a ClientHello was found.
    pub endpoints: Option<(SocketAddrV4, SocketAddrV4)>,
}

impl Inspection {
    fn not_interesting() -> Self {
        Self {
            classification: Classification::NotInteresting,
            endpoints: None,
        }
    }
}

/// Full pipeline for one packet: demultiplex, extract SNI, match.
pub fn inspect(packet: &Packet, targets: &TargetDomainSet) -> Inspection {
    if packet.family != AddressFamily::Inet {
        return Inspection::not_interesting();
    }
    let Some(segment) = demultiplex(&packet.bytes) else {
        return Inspection::not_interesting();
    };
    match tls::extract_sni(segment.payload) {
        Some(hostname) => Inspection {
            classification: Classification::from_hostname(hostname, targets),
            endpoints: Some((segment.source(), segment.destination())),
        },
        None => Inspection::not_interesting(),
    }
}

pub fn classify(packet: &Packet, targets: &TargetDomainSet) -> Classification {
    inspect(packet, targets).classification
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ipv4_tcp_packet(
        source: SocketAddrV4,
        destination: SocketAddrV4,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN + payload.len();
        let mut packet = vec![0u8; total_len];

        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        packet[6] = 0x40; // don't fragment
        packet[8] = 64;
        packet[9] = PROTOCOL_TCP;
        packet[12..16].copy_from_slice(&source.ip().octets());
        packet[16..20].copy_from_slice(&destination.ip().octets());

        let tcp = &mut packet[IPV4_MIN_HEADER_LEN..];
        tcp[0..2].copy_from_slice(&source.port().to_be_bytes());
        tcp[2..4].copy_from_slice(&destination.port().to_be_bytes());
        tcp[12] = 0x50;
        tcp[13] = 0x18; // PSH, ACK
        tcp[TCP_MIN_HEADER_LEN..].copy_from_slice(payload);
        packet
    }

    fn client() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 51_234)
    }

    fn server(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(17, 253, 1, 1), port)
    }

    #[test]
    fn extracts_https_payload_and_endpoints() {
        let packet = ipv4_tcp_packet(client(), server(443), b"\x16\x03\x01hello");
        let segment = demultiplex(&packet).unwrap();

        assert_eq!(segment.payload, b"\x16\x03\x01hello");
        assert_eq!(segment.source(), client());
        assert_eq!(segment.destination(), server(443));
        assert_eq!(segment.ip.header_len, 20);
        assert_eq!(segment.tcp.header_len, 20);
    }

    #[test]
    fn short_packets_are_not_interesting() {
        let packet = ipv4_tcp_packet(client(), server(443), b"payload");
        for len in 0..IPV4_MIN_HEADER_LEN {
            assert!(Ipv4Header::parse(&packet[..len]).is_none());
        }
        assert!(demultiplex(&packet[..IPV4_MIN_HEADER_LEN + 10]).is_none());
    }

    #[test]
    fn non_ipv4_versions_are_not_interesting() {
        let mut packet = ipv4_tcp_packet(client(), server(443), b"payload");
        packet[0] = 0x65;
        assert!(demultiplex(&packet).is_none());
    }

    #[test]
    fn declared_header_longer_than_packet_is_rejected() {
        let mut packet = ipv4_tcp_packet(client(), server(443), &[]);
        packet[0] = 0x4f; // 60-byte header, 40-byte packet
        assert!(Ipv4Header::parse(&packet).is_none());

        packet[0] = 0x44; // below the 20-byte minimum
        assert!(Ipv4Header::parse(&packet).is_none());
    }

    #[test]
    fn honours_ip_options() {
        let base = ipv4_tcp_packet(client(), server(443), b"data");
        let mut packet = base[..IPV4_MIN_HEADER_LEN].to_vec();
        packet.extend_from_slice(&[0x01, 0x01, 0x01, 0x00]); // NOP padding option
        packet.extend_from_slice(&base[IPV4_MIN_HEADER_LEN..]);
        packet[0] = 0x46;
        let total_len = packet.len() as u16;
        packet[2..4].copy_from_slice(&total_len.to_be_bytes());

        assert_eq!(demultiplex(&packet).unwrap().payload, b"data");
    }

    #[test]
    fn only_tcp_to_port_443_with_payload_is_kept() {
        let mut udp = ipv4_tcp_packet(client(), server(443), b"data");
        udp[9] = 17;
        assert!(demultiplex(&udp).is_none());

        let http = ipv4_tcp_packet(client(), server(80), b"data");
        assert!(parse_tcp(&http).is_some());
        assert!(demultiplex(&http).is_none());

        let bare_ack = ipv4_tcp_packet(client(), server(443), &[]);
        assert!(demultiplex(&bare_ack).is_none());
    }

    #[test]
    fn tcp_header_longer_than_packet_is_rejected() {
        let mut packet = ipv4_tcp_packet(client(), server(443), b"abc");
        packet[IPV4_MIN_HEADER_LEN + 12] = 0xf0; // 60-byte TCP header
        assert!(demultiplex(&packet).is_none());

        packet[IPV4_MIN_HEADER_LEN + 12] = 0x40; // 16 bytes, below minimum
        assert!(demultiplex(&packet).is_none());
    }

    #[test]
    fn later_fragments_are_skipped() {
        let mut packet = ipv4_tcp_packet(client(), server(443), b"data");
        packet[6] = 0x00;
        packet[7] = 0xb9;
        assert!(demultiplex(&packet).is_none());
    }

    #[test]
    fn link_padding_is_trimmed() {
        let mut packet = ipv4_tcp_packet(client(), server(443), b"data");
        packet.extend_from_slice(&[0; 6]);
        assert_eq!(demultiplex(&packet).unwrap().payload, b"data");
    }

    #[test]
    fn inspection_carries_flow_endpoints() {
        let targets = TargetDomainSet::new(["ls.apple.com"]);
        let hello = Packet::ipv4(ipv4_tcp_packet(
            client(),
            server(443),
            &tls::tests::client_hello_with_sni("ls.apple.com"),
        ));

        let inspection = inspect(&hello, &targets);
        assert_eq!(inspection.classification, Classification::Matched("ls.apple.com".into()));
        assert_eq!(inspection.endpoints, Some((client(), server(443))));

        let no_hello = Packet::ipv4(ipv4_tcp_packet(client(), server(443), b"\x17\x03\x03data"));
        assert_eq!(inspect(&no_hello, &targets).endpoints, None);
    }

    #[test]
    fn ipv6_family_passes_through_unclassified() {
        let targets = TargetDomainSet::new(["example.com"]);
        let bytes = ipv4_tcp_packet(
            client(),
            server(443),
            &tls::tests::client_hello_with_sni("example.com"),
        );

        let inet = Packet::ipv4(bytes.clone());
        assert_eq!(classify(&inet, &targets), Classification::Matched("example.com".into()));

        let inet6 = Packet {
            bytes,
            family: AddressFamily::from_raw(30),
        };
        assert_eq!(classify(&inet6, &targets), Classification::NotInteresting);
    }
}
