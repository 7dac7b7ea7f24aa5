use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use mill_reactor::{prelude::*, Result};
use tracing::info;

#[path = "common/mod.rs"]
mod common;

use common::{Answer, Empty, Query};

#[derive(Parser, Debug)]
#[command(name = "query_server")]
#[command(about = "Answers typed Query frames, then shuts the connection down")]
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

fn main() -> Result<()> {
    let args = Args::parse();
    common::init_tracing(&args.log_level);

    let dispatcher = Arc::new(Dispatcher::with_default_callback(|conn, type_name, _, _| {
        info!("onUnknownMessage: {}", type_name);
        conn.shutdown();
    }));
    dispatcher.register::<Query, _>(|conn, query, _| {
        info!("onQuery: {:?}", query);
        let answer = Answer {
            id: query.id,
            questioner: query.questioner,
            answerer: "irvinglwj.github.io".into(),
            solution: vec!["Jump!".into(), "Win!".into()],
        };
        TypedCodec::send(conn, &answer);
        conn.shutdown();
    });
    dispatcher.register::<Empty, _>(|conn, empty, _| {
        info!("onEmpty: {:?}", empty);
        TypedCodec::send(conn, &Empty::default());
    });

    let routes = dispatcher.clone();
    let codec = Arc::new(TypedCodec::new(move |conn, frame, receive_time| {
        routes.on_frame(conn, frame, receive_time)
    }));

    let event_loop = EventLoop::new()?;
    let config = TcpServerConfig::builder()
        .address(args.listen)
        .name("QueryServer")
        .num_threads(args.threads)
        .build();
    let server = TcpServer::new(&event_loop, config)?;
    server.set_connection_callback(|conn| {
        info!(
            "{} -> {} is {}",
            conn.local_address(),
            conn.peer_address(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    });
    server.set_message_callback(move |conn, buf, receive_time| {
        codec.on_message(conn, buf, receive_time)
    });

    server.start()?;
    info!("QueryServer listening on {}", server.ip_port());
    event_loop.run();
    Ok(())
}
