//! The wire format this engine speaks: a fixed-capacity buffer holding a
//! raw IPv4 header immediately followed by a TCP header and (optionally)
//! payload, with no options on either header, plus a few bytes of scratch
//! space past the largest real frame for the checksum's pseudo-header
//! trailer. Field access goes straight through byte offsets rather than a
//! packed struct, since Rust has no portable equivalent of the original's
//! header union.

mod checksum;
mod error;
mod flags;

pub use checksum::internet_checksum;
pub use error::PacketError;
pub use flags::TcpFlags;

use std::fmt;

use tcpmany_address::Address;

/// Largest frame this engine will ever build or accept, matching a
/// standard Ethernet MTU (1500) plus the 14-byte link header the raw
/// socket strips before handing us the IP datagram — kept as in the
/// original for header room even though we only ever see the IP payload.
pub const MAX_SIZE: usize = 1514;
pub const IP_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const HEADER_LEN: usize = IP_HEADER_LEN + TCP_HEADER_LEN;
/// The largest payload `set_data`/`data_packet` will accept: everything
/// past the header, up to the full on-wire frame size.
pub const MAX_PAYLOAD: usize = MAX_SIZE - HEADER_LEN;
/// The backing buffer is 4 bytes larger than the largest on-wire frame so
/// the TCP checksum's scratch pseudo-header trailer (written just past the
/// payload, then discarded) has somewhere to go even when the payload
/// already fills the frame out to `MAX_SIZE`.
const BUF_CAPACITY: usize = MAX_SIZE + 4;

const IP_PROTO_TCP: u8 = 6;
const DEFAULT_WINDOW: u16 = 4096;
const DEFAULT_TTL: u8 = 64;
/// The original never varies this across packets; kept verbatim rather
/// than computed, since nothing in this engine's demultiplexing or
/// reassembly depends on IP identification uniqueness (no fragmentation
/// is ever performed or expected).
const DEFAULT_IDENTIFICATION: u16 = 11111;

// IP header field offsets.
const OFF_VER_IHL: usize = 0;
const OFF_TOS: usize = 1;
const OFF_TOT_LEN: usize = 2;
const OFF_IDENT: usize = 4;
const OFF_FRAG_OFF: usize = 6;
const OFF_TTL: usize = 8;
const OFF_PROTOCOL: usize = 9;
const OFF_IP_CHECKSUM: usize = 10;
const OFF_SRC_ADDR: usize = 12;
const OFF_DST_ADDR: usize = 16;

// TCP header field offsets, relative to the start of the TCP header
// (add IP_HEADER_LEN to index into `buf`).
const TOFF_SRC_PORT: usize = 0;
const TOFF_DST_PORT: usize = 2;
const TOFF_SEQ: usize = 4;
const TOFF_ACK_SEQ: usize = 8;
const TOFF_DATA_OFFSET: usize = 12;
const TOFF_FLAGS: usize = 13;
const TOFF_WINDOW: usize = 14;
const TOFF_CHECKSUM: usize = 16;
const TOFF_URGENT: usize = 18;

/// A single IPv4+TCP datagram, stored as the exact bytes that go on (or
/// come off) the raw socket.
#[derive(Clone)]
pub struct Packet {
    buf: Box<[u8; BUF_CAPACITY]>,
}

impl Packet {
    /// A blank packet with sane IP header defaults (version 4, no
    /// options, TTL 64, protocol TCP) and a TCP header with no flags set
    /// and the default advertised window. Callers fill in the rest.
    pub fn new() -> Self {
        let mut buf = Box::new([0u8; BUF_CAPACITY]);
        buf[OFF_VER_IHL] = 0x45; // version 4, IHL 5 (no options)
        buf[OFF_TOS] = 0x04;
        buf[OFF_TTL] = DEFAULT_TTL;
        buf[OFF_PROTOCOL] = IP_PROTO_TCP;
        buf[IP_HEADER_LEN + TOFF_DATA_OFFSET] = 0x50; // data offset 5, reserved 0
        let mut pkt = Self { buf };
        pkt.set_u16(OFF_IDENT, DEFAULT_IDENTIFICATION);
        pkt.set_window(DEFAULT_WINDOW);
        pkt.set_total_length(HEADER_LEN as u16);
        pkt
    }

    fn get_u16(&self, off: usize) -> u16 {
        u16::from_be_bytes([self.buf[off], self.buf[off + 1]])
    }

    fn set_u16(&mut self, off: usize, v: u16) {
        let b = v.to_be_bytes();
        self.buf[off] = b[0];
        self.buf[off + 1] = b[1];
    }

    fn get_u32(&self, off: usize) -> u32 {
        u32::from_be_bytes([
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        ])
    }

    fn set_u32(&mut self, off: usize, v: u32) {
        let b = v.to_be_bytes();
        self.buf[off..off + 4].copy_from_slice(&b);
    }

    // --- IP header -----------------------------------------------------

    pub fn total_length(&self) -> u16 {
        self.get_u16(OFF_TOT_LEN)
    }

    pub fn set_total_length(&mut self, len: u16) {
        self.set_u16(OFF_TOT_LEN, len);
    }

    pub fn ttl(&self) -> u8 {
        self.buf[OFF_TTL]
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.buf[OFF_TTL] = ttl;
    }

    pub fn is_tcp(&self) -> bool {
        self.buf[OFF_PROTOCOL] == IP_PROTO_TCP
    }

    /// The engine's receive path calls this to turn "wrong IP protocol"
    /// into a real error rather than a bare boolean, per `PacketError`.
    pub fn ensure_tcp(&self) -> Result<(), PacketError> {
        if self.is_tcp() {
            Ok(())
        } else {
            Err(PacketError::NotTcp { proto: self.buf[OFF_PROTOCOL] })
        }
    }

    fn ip_header_checksum_field(&self) -> u16 {
        self.get_u16(OFF_IP_CHECKSUM)
    }

    pub fn src_address(&self) -> Address {
        let ip = u32::from_be_bytes([
            self.buf[OFF_SRC_ADDR],
            self.buf[OFF_SRC_ADDR + 1],
            self.buf[OFF_SRC_ADDR + 2],
            self.buf[OFF_SRC_ADDR + 3],
        ]);
        Address::new(ip.into(), self.get_u16(IP_HEADER_LEN + TOFF_SRC_PORT))
    }

    pub fn dst_address(&self) -> Address {
        let ip = u32::from_be_bytes([
            self.buf[OFF_DST_ADDR],
            self.buf[OFF_DST_ADDR + 1],
            self.buf[OFF_DST_ADDR + 2],
            self.buf[OFF_DST_ADDR + 3],
        ]);
        Address::new(ip.into(), self.get_u16(IP_HEADER_LEN + TOFF_DST_PORT))
    }

    pub fn set_src_address(&mut self, addr: Address) {
        self.buf[OFF_SRC_ADDR..OFF_SRC_ADDR + 4].copy_from_slice(&addr.ip().octets());
        self.set_u16(IP_HEADER_LEN + TOFF_SRC_PORT, addr.port());
    }

    pub fn set_dst_address(&mut self, addr: Address) {
        self.buf[OFF_DST_ADDR..OFF_DST_ADDR + 4].copy_from_slice(&addr.ip().octets());
        self.set_u16(IP_HEADER_LEN + TOFF_DST_PORT, addr.port());
    }

    /// Swaps `received`'s source and destination into this packet, i.e.
    /// this packet's destination becomes the sender's source, and this
    /// packet's source becomes the sender's destination — the reply
    /// direction. Mirrors the original `ExchangeAddress`.
    fn reply_to(&mut self, received: &Packet) {
        self.set_dst_address(received.src_address());
        self.set_src_address(received.dst_address());
    }

    // --- TCP header ------------------------------------------------------

    pub fn seq(&self) -> u32 {
        self.get_u32(IP_HEADER_LEN + TOFF_SEQ)
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.set_u32(IP_HEADER_LEN + TOFF_SEQ, seq);
    }

    pub fn ack_seq(&self) -> u32 {
        self.get_u32(IP_HEADER_LEN + TOFF_ACK_SEQ)
    }

    pub fn set_ack_seq(&mut self, ack_seq: u32) {
        self.set_u32(IP_HEADER_LEN + TOFF_ACK_SEQ, ack_seq);
    }

    pub fn window(&self) -> u16 {
        self.get_u16(IP_HEADER_LEN + TOFF_WINDOW)
    }

    pub fn set_window(&mut self, window: u16) {
        self.set_u16(IP_HEADER_LEN + TOFF_WINDOW, window);
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_truncate(self.buf[IP_HEADER_LEN + TOFF_FLAGS])
    }

    pub fn set_flags(&mut self, flags: TcpFlags) {
        self.buf[IP_HEADER_LEN + TOFF_FLAGS] = flags.bits();
    }

    pub fn is_syn(&self) -> bool {
        self.flags().contains(TcpFlags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.flags().contains(TcpFlags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.flags().contains(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags().contains(TcpFlags::RST)
    }

    fn data_offset_words(&self) -> usize {
        (self.buf[IP_HEADER_LEN + TOFF_DATA_OFFSET] >> 4) as usize
    }

    /// Length of the payload following the TCP header, derived from the
    /// total IP length and the (always 5-word, no-options) data offset.
    pub fn data_len(&self) -> usize {
        let header_total = IP_HEADER_LEN + self.data_offset_words() * 4;
        (self.total_length() as usize).saturating_sub(header_total)
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[HEADER_LEN..HEADER_LEN + self.data_len()]
    }

    /// Overwrites the payload and updates the IP total length in one
    /// host-order computation, then performs a single big-endian write —
    /// the fix for the original's bug of writing the length field twice
    /// in different byte orders.
    pub fn set_data(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadOversize {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        self.buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        let new_total = (HEADER_LEN + payload.len()) as u16;
        self.set_total_length(new_total);
        Ok(())
    }

    // --- checksums -------------------------------------------------------

    /// Recomputes and stores the IP header checksum over the full
    /// 20-byte header (the original only summed the first 12 bytes,
    /// which this implementation treats as a bug rather than behavior
    /// worth preserving).
    pub fn compute_ip_checksum(&mut self) {
        self.set_u16(OFF_IP_CHECKSUM, 0);
        let sum = internet_checksum(&self.buf[..IP_HEADER_LEN]);
        self.set_u16(OFF_IP_CHECKSUM, sum);
    }

    /// Recomputes and stores the TCP checksum over the pseudo-header,
    /// TCP header, and payload (zero-padded to an even length).
    pub fn compute_tcp_checksum(&mut self) {
        self.set_u16(IP_HEADER_LEN + TOFF_CHECKSUM, 0);

        let data_len = self.data_len();
        let padded = data_len + (data_len % 2);
        if padded != data_len {
            self.buf[HEADER_LEN + data_len] = 0;
        }

        let tcp_segment_len = (TCP_HEADER_LEN + data_len) as u16;
        let trailer_off = HEADER_LEN + padded;
        self.buf[trailer_off] = 0;
        self.buf[trailer_off + 1] = IP_PROTO_TCP;
        self.set_u16(trailer_off + 2, tcp_segment_len);

        // Sum starts at the IP source address field: 4 (src) + 4 (dst) +
        // 20 (TCP header) + padded payload + 4 (pseudo trailer).
        let span = OFF_SRC_ADDR..(trailer_off + 4);
        let sum = internet_checksum(&self.buf[span]);
        self.set_u16(IP_HEADER_LEN + TOFF_CHECKSUM, sum);
    }

    pub fn compute_checksums(&mut self) {
        self.compute_tcp_checksum();
        self.compute_ip_checksum();
    }

    // --- building common replies ----------------------------------------

    pub fn syn(seq: u32, dst: Address, src: Address) -> Self {
        let mut pkt = Self::new();
        pkt.set_src_address(src);
        pkt.set_dst_address(dst);
        pkt.set_seq(seq);
        pkt.set_flags(TcpFlags::SYN);
        pkt.compute_checksums();
        pkt
    }

    /// A FIN+ACK, matching the original `FinPacket`, which sets both bits
    /// rather than a bare FIN.
    pub fn fin(seq: u32, ack_seq: u32, dst: Address, src: Address) -> Self {
        let mut pkt = Self::new();
        pkt.set_src_address(src);
        pkt.set_dst_address(dst);
        pkt.set_seq(seq);
        pkt.set_ack_seq(ack_seq);
        pkt.set_flags(TcpFlags::FIN | TcpFlags::ACK);
        pkt.compute_checksums();
        pkt
    }

    /// An ACK for `received`, acknowledging its sequence number plus its
    /// payload length (or plus one if it carried no payload, covering a
    /// SYN or FIN).
    pub fn ack_of(seq: u32, received: &Packet) -> Self {
        let mut pkt = Self::new();
        pkt.reply_to(received);
        pkt.set_seq(seq);
        let advance = if received.data_len() > 0 {
            received.data_len() as u32
        } else {
            1
        };
        pkt.set_ack_seq(received.seq().wrapping_add(advance));
        pkt.set_flags(TcpFlags::ACK);
        pkt.compute_checksums();
        pkt
    }

    /// A FIN+ACK replying to `received`, always acknowledging exactly
    /// `received.seq() + 1` regardless of payload length — matching the
    /// original `FinAckPacket`, which does not account for trailing data
    /// on the packet it's closing in response to.
    pub fn fin_ack_of(seq: u32, received: &Packet) -> Self {
        let mut pkt = Self::new();
        pkt.reply_to(received);
        pkt.set_seq(seq);
        pkt.set_ack_seq(received.seq().wrapping_add(1));
        pkt.set_flags(TcpFlags::FIN | TcpFlags::ACK);
        pkt.compute_checksums();
        pkt
    }

    pub fn data_packet(
        seq: u32,
        ack_seq: u32,
        dst: Address,
        src: Address,
        payload: &[u8],
    ) -> Result<Self, PacketError> {
        let mut pkt = Self::new();
        pkt.set_src_address(src);
        pkt.set_dst_address(dst);
        pkt.set_seq(seq);
        pkt.set_ack_seq(ack_seq);
        pkt.set_flags(TcpFlags::PSH | TcpFlags::ACK);
        pkt.set_data(payload)?;
        pkt.compute_checksums();
        Ok(pkt)
    }

    // --- wire I/O ---------------------------------------------------------

    /// Parses a raw frame received off the socket. Only checks that it's
    /// long enough to hold a full header; checksum and protocol
    /// validation are the caller's responsibility (see
    /// [`Packet::is_tcp`] and the checksum accessors).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::Truncated { len: bytes.len() });
        }
        let mut buf = Box::new([0u8; BUF_CAPACITY]);
        let n = bytes.len().min(MAX_SIZE);
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(Self { buf })
    }

    /// The buffer this packet would occupy on the wire: the IP+TCP
    /// headers plus payload, per its own total-length field.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.total_length() as usize]
    }

    /// Raw storage for the receive path: `recvfrom` writes directly into
    /// this buffer before the caller calls [`Packet::is_tcp`] and the
    /// length accessors to decide whether to keep it. Bounded to
    /// [`MAX_SIZE`] (not the larger backing allocation) so a read can never
    /// land in the checksum scratch space past the largest real frame.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..MAX_SIZE]
    }

    pub fn ip_checksum_is_valid(&self) -> bool {
        internet_checksum(&self.buf[..IP_HEADER_LEN]) == 0
    }

    pub fn tcp_checksum_is_valid(&self) -> bool {
        let data_len = self.data_len();
        let padded = data_len + (data_len % 2);
        let span_end = HEADER_LEN + padded + 4;
        if span_end > BUF_CAPACITY {
            return false;
        }
        internet_checksum(&self.buf[OFF_SRC_ADDR..span_end]) == 0
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IP[ttl={} proto={} chk={:#06x} {}->{}] TCP[seq={} ack={} flags={:?} win={} chk={:#06x}]",
            self.ttl(),
            self.buf[OFF_PROTOCOL],
            self.ip_header_checksum_field(),
            self.src_address(),
            self.dst_address(),
            self.seq(),
            self.ack_seq(),
            self.flags(),
            self.window(),
            self.get_u16(IP_HEADER_LEN + TOFF_CHECKSUM),
        )
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(a: u8, b: u8, c: u8, d: u8, port: u16) -> Address {
        Address::new(Ipv4Addr::new(a, b, c, d), port)
    }

    #[test]
    fn new_packet_has_sane_defaults() {
        let pkt = Packet::new();
        assert_eq!(pkt.total_length(), HEADER_LEN as u16);
        assert_eq!(pkt.ttl(), DEFAULT_TTL);
        assert!(pkt.is_tcp());
        assert_eq!(pkt.window(), DEFAULT_WINDOW);
        assert_eq!(pkt.data_len(), 0);
        assert_eq!(pkt.get_u16(OFF_IDENT), DEFAULT_IDENTIFICATION);
    }

    #[test]
    fn syn_checksums_verify() {
        let pkt = Packet::syn(100, addr(10, 0, 0, 1, 9000), addr(10, 0, 0, 2, 40000));
        assert!(pkt.ip_checksum_is_valid());
        assert!(pkt.tcp_checksum_is_valid());
        assert!(pkt.is_syn());
        assert_eq!(pkt.seq(), 100);
        assert_eq!(pkt.dst_address(), addr(10, 0, 0, 1, 9000));
        assert_eq!(pkt.src_address(), addr(10, 0, 0, 2, 40000));
    }

    #[test]
    fn ack_of_advances_by_one_for_empty_payload() {
        let syn = Packet::syn(500, addr(10, 0, 0, 1, 80), addr(10, 0, 0, 2, 5000));
        let ack = Packet::ack_of(1, &syn);
        assert_eq!(ack.ack_seq(), 501);
        assert!(ack.is_ack());
        assert!(ack.tcp_checksum_is_valid());
        // Reply direction is swapped relative to the SYN.
        assert_eq!(ack.src_address(), addr(10, 0, 0, 1, 80));
        assert_eq!(ack.dst_address(), addr(10, 0, 0, 2, 5000));
    }

    #[test]
    fn ack_of_advances_by_payload_length() {
        let data = Packet::data_packet(
            10,
            20,
            addr(10, 0, 0, 1, 80),
            addr(10, 0, 0, 2, 5000),
            b"hello",
        )
        .unwrap();
        let ack = Packet::ack_of(99, &data);
        assert_eq!(ack.ack_seq(), 15);
    }

    #[test]
    fn fin_ack_of_ignores_payload_length() {
        // Matches the original's FinAckPacket: always +1 even if the
        // closing packet carried trailing data.
        let data = Packet::data_packet(
            10,
            20,
            addr(10, 0, 0, 1, 80),
            addr(10, 0, 0, 2, 5000),
            b"hello",
        )
        .unwrap();
        let fin_ack = Packet::fin_ack_of(1, &data);
        assert_eq!(fin_ack.ack_seq(), 11);
    }

    #[test]
    fn set_data_accepts_exactly_max_payload() {
        let mut pkt = Packet::new();
        let full = vec![0xabu8; MAX_PAYLOAD];
        pkt.set_data(&full).unwrap();
        pkt.compute_checksums();
        assert_eq!(pkt.data(), full.as_slice());
        assert!(pkt.tcp_checksum_is_valid());
    }

    #[test]
    fn set_data_rejects_oversized_payload() {
        let mut pkt = Packet::new();
        let oversized = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            pkt.set_data(&oversized),
            Err(PacketError::PayloadOversize { .. })
        ));
    }

    #[test]
    fn data_round_trips() {
        let pkt = Packet::data_packet(
            1,
            2,
            addr(10, 0, 0, 1, 80),
            addr(10, 0, 0, 2, 5000),
            b"payload-bytes",
        )
        .unwrap();
        assert_eq!(pkt.data(), b"payload-bytes");
        assert_eq!(pkt.data_len(), 13);
        assert!(pkt.tcp_checksum_is_valid());
    }

    #[test]
    fn ensure_tcp_rejects_non_tcp_protocol() {
        let mut pkt = Packet::new();
        assert!(pkt.ensure_tcp().is_ok());

        pkt.buf[OFF_PROTOCOL] = 17; // UDP
        let err = pkt.ensure_tcp().unwrap_err();
        assert!(matches!(err, PacketError::NotTcp { proto: 17 }));
    }

    #[test]
    fn from_bytes_rejects_truncated_frame() {
        let short = [0u8; HEADER_LEN - 1];
        assert!(matches!(
            Packet::from_bytes(&short),
            Err(PacketError::Truncated { len }) if len == HEADER_LEN - 1
        ));
    }

    #[test]
    fn from_bytes_then_as_bytes_round_trips() {
        let pkt = Packet::syn(1, addr(1, 2, 3, 4, 1), addr(5, 6, 7, 8, 2));
        let wire = pkt.as_bytes().to_vec();
        let reparsed = Packet::from_bytes(&wire).unwrap();
        assert_eq!(reparsed.as_bytes(), wire.as_slice());
        assert_eq!(reparsed.seq(), 1);
        assert!(reparsed.ip_checksum_is_valid());
    }

    #[test]
    fn odd_length_payload_is_zero_padded_for_checksum() {
        let pkt = Packet::data_packet(
            1,
            2,
            addr(1, 2, 3, 4, 1),
            addr(5, 6, 7, 8, 2),
            b"odd", // 3 bytes
        )
        .unwrap();
        assert!(pkt.tcp_checksum_is_valid());
    }
}
