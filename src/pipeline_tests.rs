//! Raw packet in, classification out, across every stage.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::classifier::{Classification, TargetDomainSet};
use crate::packet::{self, tests::ipv4_tcp_packet, Packet};
use crate::tls::tests::client_hello_with_sni;

fn location_targets() -> TargetDomainSet {
    TargetDomainSet::new(["gs-loc.apple.com", "ls.apple.com"])
}

fn hello(host: &str, port: u16) -> Packet {
    Packet::ipv4(ipv4_tcp_packet(
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 49_152),
        SocketAddrV4::new(Ipv4Addr::new(17, 36, 200, 7), port),
        &client_hello_with_sni(host),
    ))
}

#[test]
fn location_service_hello_is_matched() {
    let result = packet::classify(&hello("ls.apple.com", 443), &location_targets());
    assert_eq!(result, Classification::Matched("ls.apple.com".to_string()));
}

#[test]
fn uppercase_subdomain_is_matched_as_sent() {
    let result = packet::classify(&hello("EU.GS-LOC.APPLE.COM", 443), &location_targets());
    assert_eq!(result, Classification::Matched("EU.GS-LOC.APPLE.COM".to_string()));
}

#[test]
fn other_hosts_are_unmatched() {
    let result = packet::classify(&hello("www.apple.com", 443), &location_targets());
    assert_eq!(result, Classification::Unmatched("www.apple.com".to_string()));
}

#[test]
fn non_https_ports_are_ignored() {
    let result = packet::classify(&hello("ls.apple.com", 8443), &location_targets());
    assert_eq!(result, Classification::NotInteresting);
}

#[test]
fn hello_split_across_segments_is_missed() {
    let record = client_hello_with_sni("ls.apple.com");
    let first_half = Packet::ipv4(ipv4_tcp_packet(
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 49_152),
        SocketAddrV4::new(Ipv4Addr::new(17, 36, 200, 7), 443),
        &record[..record.len() / 2],
    ));
    assert_eq!(packet::classify(&first_half, &location_targets()), Classification::NotInteresting);
}
