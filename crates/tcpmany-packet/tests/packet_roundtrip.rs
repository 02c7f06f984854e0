use std::net::Ipv4Addr;

use tcpmany_address::Address;
use tcpmany_packet::{Packet, MAX_PAYLOAD};

fn addr(a: u8, b: u8, c: u8, d: u8, port: u16) -> Address {
    Address::new(Ipv4Addr::new(a, b, c, d), port)
}

#[test]
fn full_handshake_and_close_sequence_checksums_verify() {
    let client = addr(10, 1, 1, 1, 45000);
    let server = addr(10, 1, 1, 2, 80);

    let syn = Packet::syn(0, server, client);
    assert!(syn.ip_checksum_is_valid());
    assert!(syn.tcp_checksum_is_valid());

    let syn_ack = Packet::ack_of(0, &syn);
    assert!(syn_ack.tcp_checksum_is_valid());
    assert_eq!(syn_ack.ack_seq(), 1);

    let data = Packet::data_packet(1, syn_ack.seq() + 1, server, client, b"GET / HTTP/1.0\r\n\r\n")
        .unwrap();
    assert!(data.tcp_checksum_is_valid());

    let data_ack = Packet::ack_of(syn_ack.seq() + 1, &data);
    assert!(data_ack.tcp_checksum_is_valid());

    let fin = Packet::fin(data.seq() + data.data_len() as u32, data_ack.seq(), server, client);
    assert!(fin.tcp_checksum_is_valid());

    let fin_ack = Packet::fin_ack_of(data_ack.seq(), &fin);
    assert!(fin_ack.tcp_checksum_is_valid());
    assert_eq!(fin_ack.ack_seq(), fin.seq() + 1);
}

#[test]
fn max_size_payload_stays_in_bounds_and_checksums() {
    let payload = vec![0xabu8; MAX_PAYLOAD];
    let pkt = Packet::data_packet(1, 1, addr(1, 1, 1, 1, 1), addr(2, 2, 2, 2, 2), &payload).unwrap();
    assert_eq!(pkt.data(), payload.as_slice());
    assert!(pkt.tcp_checksum_is_valid());
    assert!(pkt.ip_checksum_is_valid());
}

#[test]
fn wire_bytes_round_trip_through_from_bytes() {
    let pkt = Packet::data_packet(
        7,
        3,
        addr(192, 168, 0, 1, 443),
        addr(192, 168, 0, 2, 55000),
        b"round trip",
    )
    .unwrap();
    let wire = pkt.as_bytes().to_vec();
    let reparsed = Packet::from_bytes(&wire).unwrap();

    assert_eq!(reparsed.seq(), 7);
    assert_eq!(reparsed.ack_seq(), 3);
    assert_eq!(reparsed.data(), b"round trip");
    assert_eq!(reparsed.src_address(), addr(192, 168, 0, 1, 443));
    assert_eq!(reparsed.dst_address(), addr(192, 168, 0, 2, 55000));
    assert!(reparsed.ip_checksum_is_valid());
    assert!(reparsed.tcp_checksum_is_valid());
}
