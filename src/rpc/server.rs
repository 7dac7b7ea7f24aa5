use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::{RpcChannel, Service, ServiceMap};
use crate::{
    config::TcpServerConfig, error::Result, event_loop::EventLoop, net::TcpServer,
};

/// A [`TcpServer`] that gives every connection its own [`RpcChannel`].
///
/// Services must be registered before [`start`](Self::start).
pub struct RpcServer {
    server: Arc<TcpServer>,
    services: Mutex<ServiceMap>,
}

impl RpcServer {
    pub fn new(event_loop: &Arc<EventLoop>, config: TcpServerConfig) -> Result<Self> {
        Ok(Self {
            server: TcpServer::new(event_loop, config)?,
            services: Mutex::new(ServiceMap::new()),
        })
    }

    pub fn register_service(&self, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        info!("RpcServer registers service {}", name);
        self.services.lock().insert(name, service);
    }

    pub fn tcp_server(&self) -> &Arc<TcpServer> {
        &self.server
    }

    pub fn start(&self) -> Result<()> {
        let services = Arc::new(self.services.lock().clone());
        self.server.set_connection_callback(move |conn| {
            info!(
                "RpcServer - {} -> {} is {}",
                conn.peer_address(),
                conn.local_address(),
                if conn.connected() { "UP" } else { "DOWN" }
            );
            if conn.connected() {
                let channel = RpcChannel::new();
                channel.set_connection(conn);
                channel.set_services(services.clone());
                conn.set_context(channel);
            } else {
                conn.clear_context();
            }
        });
        self.server.set_message_callback(|conn, buf, receive_time| {
            match conn.context_as::<RpcChannel>() {
                Some(channel) => channel.on_message(conn, buf, receive_time),
                None => buf.retrieve_all(),
            }
        });
        self.server.start()
    }
}
