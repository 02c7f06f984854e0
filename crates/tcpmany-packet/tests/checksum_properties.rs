use proptest::prelude::*;
use std::net::Ipv4Addr;

use tcpmany_address::Address;
use tcpmany_packet::{Packet, MAX_PAYLOAD};

fn addr(a: u8, b: u8, c: u8, d: u8, port: u16) -> Address {
    Address::new(Ipv4Addr::new(a, b, c, d), port)
}

proptest! {
    #[test]
    fn data_packets_always_checksum_valid(
        seq in any::<u32>(),
        ack in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD),
    ) {
        let pkt = Packet::data_packet(
            seq,
            ack,
            addr(10, 0, 0, 1, 1234),
            addr(10, 0, 0, 2, 5678),
            &payload,
        )
        .unwrap();
        prop_assert!(pkt.ip_checksum_is_valid());
        prop_assert!(pkt.tcp_checksum_is_valid());
        prop_assert_eq!(pkt.data(), payload.as_slice());
    }

    #[test]
    fn ack_of_always_advances_correctly(
        seq in any::<u32>(),
        ack_seq in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 0..=64),
    ) {
        let data = Packet::data_packet(
            seq,
            ack_seq,
            addr(10, 0, 0, 1, 1234),
            addr(10, 0, 0, 2, 5678),
            &payload,
        )
        .unwrap();
        let ack = Packet::ack_of(0, &data);
        let expected = if payload.is_empty() {
            seq.wrapping_add(1)
        } else {
            seq.wrapping_add(payload.len() as u32)
        };
        prop_assert_eq!(ack.ack_seq(), expected);
        prop_assert!(ack.tcp_checksum_is_valid());
    }
}
