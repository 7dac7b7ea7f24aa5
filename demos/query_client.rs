use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use mill_reactor::{prelude::*, Result};
use tracing::info;

#[path = "common/mod.rs"]
mod common;

use common::{Answer, Empty, Query};

#[derive(Parser, Debug)]
#[command(name = "query_client")]
#[command(about = "Sends one Query and prints the Answer")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9981")]
    server: SocketAddr,

    /// Who is asking
    #[arg(short, long, default_value = "Liu wj")]
    questioner: String,

    /// Send an Empty message before the query
    #[arg(long)]
    empty: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    common::init_tracing(&args.log_level);

    let event_loop = EventLoop::new()?;

    let dispatcher = Arc::new(Dispatcher::with_default_callback(|_, type_name, _, _| {
        info!("onUnknownMessage: {}", type_name);
    }));
    dispatcher.register::<Answer, _>(|_, answer, _| info!("onAnswer: {:?}", answer));
    dispatcher.register::<Empty, _>(|_, empty, _| info!("onEmpty: {:?}", empty));

    let routes = dispatcher.clone();
    let codec = Arc::new(TypedCodec::new(move |conn, frame, receive_time| {
        routes.on_frame(conn, frame, receive_time)
    }));

    let client = TcpClient::new(&event_loop, args.server, "QueryClient");
    let quit_loop = event_loop.clone();
    let query = Query {
        id: 1,
        questioner: args.questioner,
        question: vec!["Running?".into()],
    };
    let send_empty = args.empty;
    client.set_connection_callback(move |conn| {
        info!(
            "{} -> {} is {}",
            conn.local_address(),
            conn.peer_address(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
        if conn.connected() {
            if send_empty {
                TypedCodec::send(conn, &Empty::default());
            }
            TypedCodec::send(conn, &query);
        } else {
            quit_loop.quit();
        }
    });
    client.set_message_callback(move |conn, buf, receive_time| {
        codec.on_message(conn, buf, receive_time)
    });

    client.connect();
    event_loop.run();
    Ok(())
}
