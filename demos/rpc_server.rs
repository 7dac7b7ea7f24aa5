use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use mill_reactor::{
    rpc::{decode_request, encode_response, Done, RpcErrorCode, RpcServer, Service},
    EventLoop, Result, TcpServerConfig,
};
use serde_json::Value;
use tracing::info;

#[path = "common/mod.rs"]
#[allow(dead_code)]
mod common;

#[derive(Parser, Debug)]
#[command(name = "rpc_server")]
#[command(about = "Serves the Calculator RPC service")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:9981")]
    listen: SocketAddr,

    /// IO threads
    #[arg(short, long, default_value_t = 0)]
    threads: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,
}

struct Calculator;

impl Service for Calculator {
    fn name(&self) -> &str {
        "Calculator"
    }

    fn call(&self, method: &str, request: Value, done: Done) {
        info!("Calculator::{}", method);
        match method {
            "sum" => done(decode_request::<Vec<i64>>(request).and_then(|xs| {
                encode_response(&xs.iter().sum::<i64>())
            })),
            "echo" => done(Ok(request)),
            _ => done(Err(RpcErrorCode::NoMethod)),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    common::init_tracing(&args.log_level);

    let event_loop = EventLoop::new()?;
    let config = TcpServerConfig::builder()
        .address(args.listen)
        .name("RpcServer")
        .num_threads(args.threads)
        .build();
    let server = RpcServer::new(&event_loop, config)?;
    server.register_service(Arc::new(Calculator));
    server.start()?;
    info!("RpcServer listening on {}", server.tcp_server().ip_port());
    event_loop.run();
    Ok(())
}
