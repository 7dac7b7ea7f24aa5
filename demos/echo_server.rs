use std::net::SocketAddr;

use clap::Parser;
use mill_reactor::{prelude::*, Result};
use tracing::info;

#[path = "common/mod.rs"]
#[allow(dead_code)]
mod common;

#[derive(Parser, Debug)]
#[command(name = "echo_server")]
#[command(about = "Echoes every byte back to the sender")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:2007")]
    listen: SocketAddr,

    /// IO threads; 0 handles everything on the accepting loop
    #[arg(short, long, default_value_t = 0)]
    threads: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    common::init_tracing(&args.log_level);

    let event_loop = EventLoop::new()?;
    let config = TcpServerConfig::builder()
        .address(args.listen)
        .name("EchoServer")
        .num_threads(args.threads)
        .build();
    let server = TcpServer::new(&event_loop, config)?;

    server.set_connection_callback(|conn| {
        info!(
            "EchoServer - {} -> {} is {}",
            conn.peer_address(),
            conn.local_address(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    });
    server.set_message_callback(|conn, buf, receive_time| {
        let len = buf.readable_bytes();
        let data = buf.retrieve_as_bytes(len);
        info!(
            "{} echo {} bytes, data received at {}",
            conn.name(),
            data.len(),
            receive_time
        );
        conn.send(&data);
    });

    server.start()?;
    info!("EchoServer listening on {}", server.ip_port());
    event_loop.run();
    Ok(())
}
