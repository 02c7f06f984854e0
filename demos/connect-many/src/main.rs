//! Opens many simulated TCP clients against one server address, each
//! with a distinct source IP, and sends a small HTTP-ish request once
//! connected. A thin illustration of `tcpmany-engine`, not a load-test
//! tool in its own right.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tcpmany_address::Address;
use tcpmany_engine::{ConnectionBuilder, Engine, EngineConfig};

fn usage(program: &str) -> ! {
    eprintln!("usage: {program} <server_ip> <server_port> <count> <local_ip_base>");
    std::process::exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 5 {
        usage(&args[0]);
    }

    let server_ip: Ipv4Addr = args[1].parse().unwrap_or_else(|_| usage(&args[0]));
    let server_port: u16 = args[2].parse().unwrap_or_else(|_| usage(&args[0]));
    let count: u32 = args[3].parse().unwrap_or_else(|_| usage(&args[0]));
    let base_ip: Ipv4Addr = args[4].parse().unwrap_or_else(|_| usage(&args[0]));

    let server_addr = Address::new(server_ip, server_port);
    const LOCAL_PORT: u16 = 13579;

    let engine = Arc::new(Engine::new(EngineConfig::default()).expect(
        "opening the raw socket failed; this demo needs CAP_NET_RAW or root",
    ));
    engine.start();

    let mut base = u32::from(base_ip);
    for id in 0..count {
        let client_addr = Address::new(Ipv4Addr::from(base), LOCAL_PORT);
        base = base.wrapping_add(1);

        let engine_for_request = engine.clone();
        let builder = ConnectionBuilder::new(server_addr, client_addr)
            .on_connected(move |conn| {
                tracing::info!(id, "connected");
                let request = format!(
                    "GET /sub?uid={id} HTTP/1.1\r\nUser-Agent: tcpmany/0.1.0\r\nHost: {server_addr}\r\nAccept: */*\r\n\r\n"
                );
                let engine = engine_for_request.clone();
                if let Err(err) = conn.send(request.as_bytes(), &move |pkt| engine.send(pkt)) {
                    tracing::error!(%err, id, "request too large to send");
                }
            })
            .on_message(move |_conn, data| {
                tracing::info!(id, bytes = data.len(), "received message");
            });

        let conn = match engine.register_connection(builder) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(%err, id, "failed to create connection");
                continue;
            }
        };

        let engine_for_connect = engine.clone();
        conn.connect(&move |pkt| engine_for_connect.send(pkt));
        tracing::info!(id, %client_addr, "connecting");
    }

    println!("press enter to finish");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);

    engine.stop();
}
