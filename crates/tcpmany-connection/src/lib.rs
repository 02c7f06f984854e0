//! The per-peer TCP client state machine: CLOSED -> SYN_SENT ->
//! ESTABLISHED -> FIN_WAIT_1 -> {FIN_WAIT_2, CLOSING} -> CLOSED. Driving
//! it is entirely synchronous and side-effect-free except through the
//! `out` sink passed to [`Connection::process`], so it can be exercised
//! without a socket at all.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use tcpmany_address::Address;
use tcpmany_clock::now_us;
use tcpmany_packet::Packet;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("packet with flags {packet_flags:?} is not valid in state {state:?}")]
    Protocol {
        state: ConnState,
        packet_flags: tcpmany_packet::TcpFlags,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Closed = 0,
    SynSent = 1,
    Established = 2,
    FinWait1 = 3,
    FinWait2 = 4,
    Closing = 5,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Closed,
            1 => ConnState::SynSent,
            2 => ConnState::Established,
            3 => ConnState::FinWait1,
            4 => ConnState::FinWait2,
            5 => ConnState::Closing,
            _ => unreachable!("invalid ConnState discriminant"),
        }
    }
}

pub type ConnectionHandle = Arc<Connection>;

type ConnectedCallback = Box<dyn Fn(&ConnectionHandle) + Send + Sync>;
type MessageCallback = Box<dyn Fn(&ConnectionHandle, &[u8]) + Send + Sync>;
type ClosedCallback = Box<dyn Fn(&ConnectionHandle) + Send + Sync>;

fn default_connected(_: &ConnectionHandle) {}
fn default_message(_: &ConnectionHandle, _: &[u8]) {}
fn default_closed(_: &ConnectionHandle) {}

/// One simulated TCP client connection. Holds no socket of its own —
/// [`Connection::process`] takes inbound packets and an `out` sink for
/// whatever it needs to send in response, leaving the actual I/O to
/// whatever owns the connection (normally `tcpmany-engine`'s `Engine`).
pub struct Connection {
    dst_addr: Address,
    src_addr: Address,
    state: AtomicU8,
    seq: AtomicU32,
    ack_seq: AtomicU32,
    connected_callback: ConnectedCallback,
    message_callback: MessageCallback,
    closed_callback: ClosedCallback,
}

pub struct ConnectionBuilder {
    dst_addr: Address,
    src_addr: Address,
    connected_callback: Option<ConnectedCallback>,
    message_callback: Option<MessageCallback>,
    closed_callback: Option<ClosedCallback>,
}

impl ConnectionBuilder {
    pub fn new(dst_addr: Address, src_addr: Address) -> Self {
        Self {
            dst_addr,
            src_addr,
            connected_callback: None,
            message_callback: None,
            closed_callback: None,
        }
    }

    pub fn on_connected<F>(mut self, cb: F) -> Self
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        self.connected_callback = Some(Box::new(cb));
        self
    }

    pub fn on_message<F>(mut self, cb: F) -> Self
    where
        F: Fn(&ConnectionHandle, &[u8]) + Send + Sync + 'static,
    {
        self.message_callback = Some(Box::new(cb));
        self
    }

    pub fn on_closed<F>(mut self, cb: F) -> Self
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        self.closed_callback = Some(Box::new(cb));
        self
    }

    pub fn build(self) -> ConnectionHandle {
        Arc::new(Connection {
            dst_addr: self.dst_addr,
            src_addr: self.src_addr,
            state: AtomicU8::new(ConnState::Closed as u8),
            seq: AtomicU32::new(initial_seq()),
            ack_seq: AtomicU32::new(0),
            connected_callback: self.connected_callback.unwrap_or_else(|| Box::new(default_connected)),
            message_callback: self.message_callback.unwrap_or_else(|| Box::new(default_message)),
            closed_callback: self.closed_callback.unwrap_or_else(|| Box::new(default_closed)),
        })
    }
}

/// A seed that varies per connection and per process without relying on
/// wall-clock time the way the original's `time(0) + clock()` did —
/// `now_us()` mixed with the process id, so connections created in quick
/// succession within one run don't collide.
fn initial_seq() -> u32 {
    let t = now_us() as u32;
    t ^ std::process::id()
}

impl Connection {
    pub fn dst_address(&self) -> Address {
        self.dst_addr
    }

    pub fn src_address(&self) -> Address {
        self.src_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        ConnState::from_u8(self.state.load(Ordering::SeqCst)) == ConnState::Closed
    }

    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn ack_seq(&self) -> u32 {
        self.ack_seq.load(Ordering::SeqCst)
    }

    /// Sends the initial SYN and transitions to `SynSent`.
    pub fn connect(&self, out: &dyn Fn(Packet)) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        out(Packet::syn(seq, self.dst_addr, self.src_addr));
        self.state.store(ConnState::SynSent as u8, Ordering::SeqCst);
    }

    /// Sends a FIN+ACK and transitions to `FinWait1`.
    pub fn close(&self, out: &dyn Fn(Packet)) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let ack_seq = self.ack_seq.load(Ordering::SeqCst);
        out(Packet::fin(seq, ack_seq, self.dst_addr, self.src_addr));
        self.state.store(ConnState::FinWait1 as u8, Ordering::SeqCst);
    }

    /// Sends `message` as a single data segment. Callers are responsible
    /// for keeping `message` within [`tcpmany_packet::MAX_PAYLOAD`].
    pub fn send(&self, message: &[u8], out: &dyn Fn(Packet)) -> Result<(), tcpmany_packet::PacketError> {
        let seq = self.seq.fetch_add(message.len() as u32, Ordering::SeqCst);
        let ack_seq = self.ack_seq.load(Ordering::SeqCst);
        let pkt = Packet::data_packet(seq, ack_seq, self.dst_addr, self.src_addr, message)?;
        out(pkt);
        Ok(())
    }

    /// Forces the connection straight to `Closed` and fires `on_closed`,
    /// regardless of its current state. Used by the engine's "soft mode"
    /// response to a protocol violation: rather than aborting the process
    /// (the original's `CHECK`-and-abort), the offending connection is
    /// torn down on its own and the rest of the engine keeps running.
    /// A no-op if the connection is already closed.
    pub fn abort(self: &ConnectionHandle) {
        let previous = self.state.swap(ConnState::Closed as u8, Ordering::SeqCst);
        if ConnState::from_u8(previous) != ConnState::Closed {
            (self.closed_callback)(self);
        }
    }

    /// Advances the state machine with one inbound packet, calling `out`
    /// for each packet this transition needs to send in response and
    /// invoking whichever user callback fires as a result.
    pub fn process(
        self: &ConnectionHandle,
        packet: &Packet,
        out: &dyn Fn(Packet),
    ) -> Result<(), ConnectionError> {
        let data_len = packet.data_len();
        tracing::trace!(data_len, state = ?ConnState::from_u8(self.state.load(Ordering::SeqCst)), "processing inbound packet");

        if data_len > 0 {
            self.ack_seq.store(packet.seq().wrapping_add(data_len as u32), Ordering::SeqCst);
        } else {
            self.ack_seq.store(packet.seq().wrapping_add(1), Ordering::SeqCst);
        }

        match ConnState::from_u8(self.state.load(Ordering::SeqCst)) {
            ConnState::Closed => {}
            ConnState::SynSent => {
                if packet.is_syn() && packet.is_ack() {
                    out(Packet::ack_of(self.seq.load(Ordering::SeqCst), packet));
                    self.state.store(ConnState::Established as u8, Ordering::SeqCst);
                    (self.connected_callback)(self);
                } else {
                    return Err(ConnectionError::Protocol {
                        state: ConnState::SynSent,
                        packet_flags: packet.flags(),
                    });
                }
            }
            ConnState::Established => {
                self.process_established(packet, out)?;
            }
            ConnState::FinWait1 => {
                // ACK+FIN together means the peer is acking our FIN and
                // closing at the same time (simultaneous close): ack it
                // and go straight to Closed. A bare ACK just acks our FIN,
                // leaving the peer's FIN still to come. A bare FIN is the
                // peer closing first, before acking ours.
                if packet.is_ack() && packet.is_fin() {
                    out(Packet::ack_of(self.seq.load(Ordering::SeqCst), packet));
                    self.state.store(ConnState::Closed as u8, Ordering::SeqCst);
                    (self.closed_callback)(self);
                } else if packet.is_ack() {
                    self.state.store(ConnState::FinWait2 as u8, Ordering::SeqCst);
                } else if packet.is_fin() {
                    out(Packet::ack_of(self.seq.load(Ordering::SeqCst), packet));
                    self.state.store(ConnState::Closing as u8, Ordering::SeqCst);
                } else {
                    return Err(ConnectionError::Protocol {
                        state: ConnState::FinWait1,
                        packet_flags: packet.flags(),
                    });
                }
            }
            ConnState::FinWait2 => {
                if packet.is_fin() {
                    out(Packet::ack_of(self.seq.load(Ordering::SeqCst), packet));
                    self.state.store(ConnState::Closed as u8, Ordering::SeqCst);
                    (self.closed_callback)(self);
                } else {
                    return Err(ConnectionError::Protocol {
                        state: ConnState::FinWait2,
                        packet_flags: packet.flags(),
                    });
                }
            }
            ConnState::Closing => {
                if packet.is_ack() {
                    self.state.store(ConnState::Closed as u8, Ordering::SeqCst);
                    (self.closed_callback)(self);
                } else {
                    return Err(ConnectionError::Protocol {
                        state: ConnState::Closing,
                        packet_flags: packet.flags(),
                    });
                }
            }
        }
        Ok(())
    }

    fn process_established(
        self: &ConnectionHandle,
        packet: &Packet,
        out: &dyn Fn(Packet),
    ) -> Result<(), ConnectionError> {
        let data_len = packet.data_len();
        if data_len > 0 {
            out(Packet::ack_of(self.seq.load(Ordering::SeqCst), packet));
            (self.message_callback)(self, packet.data());
        } else if packet.is_fin() {
            out(Packet::fin_ack_of(self.seq.load(Ordering::SeqCst), packet));
            self.state.store(ConnState::Closing as u8, Ordering::SeqCst);
        } else if packet.is_ack() {
            tracing::trace!("received a bare ack while established, nothing pending to clear");
        } else {
            return Err(ConnectionError::Protocol {
                state: ConnState::Established,
                packet_flags: packet.flags(),
            });
        }
        Ok(())
    }
}
