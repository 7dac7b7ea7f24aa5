use std::net::SocketAddr;

use clap::Parser;
use mill_reactor::{rpc::RpcChannel, EventLoop, Result, TcpClient};
use tracing::{error, info};

#[path = "common/mod.rs"]
#[allow(dead_code)]
mod common;

#[derive(Parser, Debug)]
#[command(name = "rpc_client")]
#[command(about = "Calls Calculator.sum once and exits")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9981")]
    server: SocketAddr,

    /// Numbers to add up
    #[arg(default_values_t = vec![1, 2, 3])]
    numbers: Vec<i64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    common::init_tracing(&args.log_level);

    let event_loop = EventLoop::new()?;
    let client = TcpClient::new(&event_loop, args.server, "RpcClient");
    let channel = RpcChannel::new();

    let caller = channel.clone();
    let quit_loop = event_loop.clone();
    let numbers = args.numbers;
    client.set_connection_callback(move |conn| {
        info!(
            "{} -> {} is {}",
            conn.local_address(),
            conn.peer_address(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
        if !conn.connected() {
            quit_loop.quit();
            return;
        }
        caller.set_connection(conn);
        let conn = conn.clone();
        caller.call::<_, i64, _>("Calculator", "sum", &numbers, move |result| {
            match result {
                Ok(sum) => info!("Calculator.sum = {}", sum),
                Err(code) => error!("Calculator.sum failed: {}", code),
            }
            conn.shutdown();
        });
    });
    let receiver = channel.clone();
    client.set_message_callback(move |conn, buf, receive_time| {
        receiver.on_message(conn, buf, receive_time)
    });

    client.connect();
    event_loop.run();
    Ok(())
}
