//! Ties the pieces together: a raw IPv4 socket, a connection table keyed
//! by source `"ip:port"`, and the three long-lived worker threads
//! (receive, send, timer) that drive every [`tcpmany_connection::Connection`]
//! owned by an [`Engine`].

mod config;
mod error;
mod socket;

pub use config::EngineConfig;
pub use error::EngineError;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use tcpmany_address::Address;
use tcpmany_clock::now_us;
pub use tcpmany_clock::Timestamp;
pub use tcpmany_connection::{ConnectionBuilder, ConnectionHandle};
use tcpmany_packet::Packet;
use tcpmany_queue::BoundedBlockingQueue;
use tcpmany_timer::{TimerId, TimerManager};

use socket::RawSocket;

/// A command handed to the send thread. The shutdown variant replaces
/// the original's magic `"lastpacket"` sentinel bytes with a real tagged
/// union, so a packet that happens to start the same way is never
/// mistaken for the stop signal.
enum SendCommand {
    Packet(Packet),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    Stopped,
    Running,
    Stopping,
}

/// Owns a raw socket, a connection table, and the worker threads that
/// service both. Not a process-wide singleton — construct as many as you
/// need (though in practice one raw socket per process is typical, since
/// `IPPROTO_TCP` raw sockets receive every inbound TCP segment regardless
/// of which `Engine` is asking).
pub struct Engine {
    socket: Arc<RawSocket>,
    config: EngineConfig,
    connections: Arc<Mutex<HashMap<String, ConnectionHandle>>>,
    send_queue: Arc<BoundedBlockingQueue<SendCommand>>,
    timer: Arc<TimerManager>,
    receive_state: Arc<Mutex<ReceiveState>>,
    stopped: Arc<AtomicBool>,
    send_thread: Mutex<Option<JoinHandle<()>>>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

const SEND_QUEUE_CAPACITY: usize = 4096;

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let socket = RawSocket::open()?;
        let timer = TimerManager::new().map_err(EngineError::Setup)?;
        Ok(Self {
            socket: Arc::new(socket),
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
            send_queue: Arc::new(BoundedBlockingQueue::new(SEND_QUEUE_CAPACITY)),
            timer: Arc::new(timer),
            receive_state: Arc::new(Mutex::new(ReceiveState::Stopped)),
            stopped: Arc::new(AtomicBool::new(false)),
            send_thread: Mutex::new(None),
            receive_thread: Mutex::new(None),
            timer_thread: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawns the send, receive, and timer threads. Calling this twice
    /// without an intervening `stop()` is a programming error, same as
    /// the original's `CHECK(!thread.joinable())`.
    pub fn start(&self) {
        assert!(
            self.send_thread.lock().is_none() && self.receive_thread.lock().is_none(),
            "Engine::start called while already running"
        );

        {
            let socket = self.socket.clone();
            let queue = self.send_queue.clone();
            *self.send_thread.lock() = Some(
                std::thread::Builder::new()
                    .name("tcpmany-send".into())
                    .spawn(move || send_loop(socket, queue))
                    .expect("failed to spawn tcpmany-send thread"),
            );
        }
        {
            let socket = self.socket.clone();
            let connections = self.connections.clone();
            let receive_state = self.receive_state.clone();
            let send_queue = self.send_queue.clone();
            let config = self.config;
            *self.receive_thread.lock() = Some(
                std::thread::Builder::new()
                    .name("tcpmany-recv".into())
                    .spawn(move || receive_loop(socket, connections, receive_state, send_queue, config))
                    .expect("failed to spawn tcpmany-recv thread"),
            );
        }
        {
            let timer = self.timer.clone();
            *self.timer_thread.lock() = Some(
                std::thread::Builder::new()
                    .name("tcpmany-timer".into())
                    .spawn(move || {
                        while !timer.is_stopped() {
                            timer.run_expired();
                        }
                    })
                    .expect("failed to spawn tcpmany-timer thread"),
            );
        }
    }

    /// Closes every open connection, waits for them to finish closing,
    /// then tears down the worker threads in the order the original
    /// requires: timer, receive, send, socket.
    pub fn stop(&self) {
        if self.stopped.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }

        // Every connection still open when `stop()` runs gets told to
        // close. The receive thread drives each one the rest of the way
        // to `Closed` as the peer's FIN/ACK arrives (or `Connection::abort`
        // does, on a protocol violation); this loop's job is just to
        // notice that and release each one back out of the table, playing
        // the role the original's "closed-callback that releases" plays
        // without needing a callback slot that can be rebound after
        // construction.
        let mut pending: Vec<ConnectionHandle> = self.connections.lock().values().cloned().collect();
        for conn in &pending {
            let queue = self.send_queue.clone();
            let config = self.config;
            conn.close(&move |mut pkt| {
                apply_outbound_config(&mut pkt, &config);
                queue.push(SendCommand::Packet(pkt));
            });
        }
        while !pending.is_empty() {
            pending.retain(|conn| {
                if conn.is_closed() {
                    self.release(conn);
                    false
                } else {
                    true
                }
            });
            if pending.is_empty() {
                break;
            }
            tracing::info!(remaining = pending.len(), "waiting for all connections to close");
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
        tracing::info!("all connections closed");

        self.timer.stop();
        if let Some(handle) = self.timer_thread.lock().take() {
            let _ = handle.join();
        }

        *self.receive_state.lock() = ReceiveState::Stopping;
        if let Some(handle) = self.receive_thread.lock().take() {
            let _ = handle.join();
        }

        self.send_queue.push(SendCommand::Shutdown);
        if let Some(handle) = self.send_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Allocates a new connection bound to `src_addr` with the default
    /// (no-op) callbacks, failing if that source address is already in
    /// use by another connection on this engine. Use
    /// [`Engine::register_connection`] to install callbacks first.
    pub fn new_connection(
        &self,
        dst_addr: Address,
        src_addr: Address,
    ) -> Result<ConnectionHandle, EngineError> {
        self.register_connection(ConnectionBuilder::new(dst_addr, src_addr))
    }

    /// Builds and registers a connection from a caller-configured
    /// [`ConnectionBuilder`], so `on_connected`/`on_message`/`on_closed`
    /// can be installed before the connection ever sees a packet.
    pub fn register_connection(
        &self,
        builder: ConnectionBuilder,
    ) -> Result<ConnectionHandle, EngineError> {
        let conn = builder.build();
        let key = conn.src_address().to_string();
        let mut connections = self.connections.lock();
        if connections.contains_key(&key) {
            return Err(EngineError::SrcInUse { addr: key });
        }
        connections.insert(key, conn.clone());
        Ok(conn)
    }

    /// Removes a connection from the table. The caller must ensure it's
    /// already closed; this mirrors the original's `DoRemove` precondition
    /// rather than silently ignoring a live connection.
    pub fn release(&self, conn: &ConnectionHandle) {
        debug_assert!(conn.is_closed(), "releasing a connection that isn't closed");
        self.connections.lock().remove(&conn.src_address().to_string());
    }

    /// Queues `packet` for transmission on the send thread, applying the
    /// configured TCP window and IP TTL and recomputing its checksums.
    pub fn send(&self, mut packet: Packet) {
        apply_outbound_config(&mut packet, &self.config);
        self.send_queue.push(SendCommand::Packet(packet));
    }

    pub fn add_timer<F>(&self, when: Timestamp, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.timer.add_timer(when, Box::new(callback))
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.timer.cancel_timer(id);
    }

    pub fn now_us(&self) -> Timestamp {
        now_us()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Overrides the advertised TCP window and IP TTL per [`EngineConfig`] and
/// recomputes both checksums, since either field participates in one.
fn apply_outbound_config(packet: &mut Packet, config: &EngineConfig) {
    packet.set_window(config.tcp_window);
    packet.set_ttl(config.ip_ttl);
    packet.compute_checksums();
}

fn send_loop(socket: Arc<RawSocket>, queue: Arc<BoundedBlockingQueue<SendCommand>>) {
    loop {
        match queue.pop() {
            SendCommand::Shutdown => break,
            SendCommand::Packet(packet) => {
                if let Err(err) = socket.send_to(&packet) {
                    tracing::error!(%err, "sendto failed");
                }
            }
        }
    }
    tracing::info!("send thread exited");
}

fn receive_loop(
    socket: Arc<RawSocket>,
    connections: Arc<Mutex<HashMap<String, ConnectionHandle>>>,
    receive_state: Arc<Mutex<ReceiveState>>,
    send_queue: Arc<BoundedBlockingQueue<SendCommand>>,
    config: EngineConfig,
) {
    *receive_state.lock() = ReceiveState::Running;
    loop {
        if *receive_state.lock() != ReceiveState::Running {
            break;
        }

        let mut packet = Packet::new();
        let n = match socket.recv_from(&mut packet, config.recv_buffer_len) {
            Ok(n) => n,
            Err(err) => {
                tracing::error!(%err, "recvfrom failed");
                continue;
            }
        };
        if n < tcpmany_packet::HEADER_LEN {
            tracing::debug!(len = n, "recvfrom length is too small");
            continue;
        }
        if let Err(err) = packet.ensure_tcp() {
            tracing::debug!(%err, "dropping non-tcp packet");
            continue;
        }
        tracing::debug!(packet = %packet, "received packet");

        let dst = packet.dst_address();
        let primary_key = dst.to_string();

        let conn = {
            let table = connections.lock();
            table.get(&primary_key).cloned().or_else(|| {
                if !config.fallback_lookup {
                    return None;
                }
                let fallback_key = dst.with_ip(packet.src_address().ip()).to_string();
                table.get(&fallback_key).cloned()
            })
        };

        match conn {
            Some(conn) => {
                let reply_queue = send_queue.clone();
                let result = conn.process(&packet, &move |mut reply| {
                    apply_outbound_config(&mut reply, &config);
                    reply_queue.push(SendCommand::Packet(reply));
                });
                if let Err(err) = result {
                    tracing::error!(?err, "protocol violation, closing connection");
                    conn.abort();
                    connections.lock().remove(&conn.src_address().to_string());
                }
            }
            None => {
                tracing::trace!("no connection matches the packet");
            }
        }
    }
    *receive_state.lock() = ReceiveState::Stopped;
    tracing::info!("receive thread exited");
}
