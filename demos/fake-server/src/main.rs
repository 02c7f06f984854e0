//! A plain, kernel-backed TCP echo server for exercising `connect-many`
//! against: accepts one connection at a time, echoes back whatever it
//! reads, then waits for the next client. Not part of this crate's core —
//! a stand-in for a real server under load, the way the original project's
//! `example/fakeserver.cc` stood in for one.

use std::io::{Read, Write};
use std::net::TcpListener;

const BIND_ADDR: &str = "0.0.0.0:5223";
const BUFFER_LEN: usize = 1024;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind(BIND_ADDR).unwrap_or_else(|err| {
        tracing::error!(%err, addr = BIND_ADDR, "bind failed");
        std::process::exit(1);
    });
    tracing::info!(addr = BIND_ADDR, "listening");

    loop {
        tracing::info!("ready to accept");
        let (mut socket, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                continue;
            }
        };
        tracing::info!(%peer, "accept success");

        let mut buffer = [0u8; BUFFER_LEN];
        let n = match socket.read(&mut buffer) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(%err, %peer, "receive failed");
                continue;
            }
        };
        tracing::info!(bytes = n, %peer, "received");

        if let Err(err) = socket.write_all(&buffer[..n]) {
            tracing::warn!(%err, %peer, "send failed");
        }
    }
}
