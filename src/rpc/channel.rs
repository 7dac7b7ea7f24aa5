use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use super::{MessageKind, RpcCodec, RpcErrorCode, RpcMessage, ServiceMap, RPC_TAG};
use crate::{
    buffer::Buffer,
    net::{TcpConnection, TcpConnectionPtr},
    timestamp::Timestamp,
};

pub type ResponseCallback = Box<dyn FnOnce(Result<Value, RpcErrorCode>) + Send>;

/// One RPC endpoint bound to one connection.
///
/// Sends requests and matches responses by id; answers incoming requests
/// from its service map. Holds the connection weakly, so it can live in
/// the connection's context.
pub struct RpcChannel {
    codec: RpcCodec,
    connection: Mutex<Weak<TcpConnection>>,
    next_id: AtomicU64,
    outstanding: Mutex<HashMap<u64, ResponseCallback>>,
    services: Mutex<Arc<ServiceMap>>,
    weak_self: Weak<RpcChannel>,
}

impl RpcChannel {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<RpcChannel>| {
            let owner = weak.clone();
            let codec = RpcCodec::new(RPC_TAG, move |conn, message, receive_time| {
                if let Some(channel) = owner.upgrade() {
                    channel.on_rpc_message(conn, message, receive_time);
                }
            });
            RpcChannel {
                codec,
                connection: Mutex::new(Weak::new()),
                next_id: AtomicU64::new(0),
                outstanding: Mutex::new(HashMap::new()),
                services: Mutex::new(Arc::new(ServiceMap::new())),
                weak_self: weak.clone(),
            }
        })
    }

    pub fn set_connection(&self, conn: &TcpConnectionPtr) {
        *self.connection.lock() = Arc::downgrade(conn);
    }

    pub fn set_services(&self, services: Arc<ServiceMap>) {
        *self.services.lock() = services;
    }

    /// Calls still waiting for an answer.
    pub fn outstanding_calls(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Message callback for the connection this channel serves.
    pub fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, receive_time: Timestamp) {
        self.codec.on_message(conn, buf, receive_time);
    }

    /// Sends a request; `done` runs on the loop thread when the answer arrives.
    ///
    /// Without a live connection `done` fails at once with `InvalidRequest`.
    pub fn call_method<F>(&self, service: &str, method: &str, request: Value, done: F)
    where
        F: FnOnce(Result<Value, RpcErrorCode>) + Send + 'static,
    {
        let Some(conn) = self.connection.lock().upgrade() else {
            warn!("RpcChannel::call_method {}.{} without a connection", service, method);
            done(Err(RpcErrorCode::InvalidRequest));
            return;
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.outstanding.lock().insert(id, Box::new(done));
        self.codec
            .send(&conn, &RpcMessage::request(id, service, method, request));
    }

    /// Typed wrapper over [`call_method`](Self::call_method).
    pub fn call<Req, Resp, F>(&self, service: &str, method: &str, request: &Req, done: F)
    where
        Req: Serialize,
        Resp: DeserializeOwned + 'static,
        F: FnOnce(Result<Resp, RpcErrorCode>) + Send + 'static,
    {
        let request = match serde_json::to_value(request) {
            Ok(request) => request,
            Err(e) => {
                error!("RpcChannel::call {}.{} - {}", service, method, e);
                done(Err(RpcErrorCode::InvalidRequest));
                return;
            }
        };
        self.call_method(service, method, request, move |result| {
            done(result.and_then(|value| {
                serde_json::from_value(value).map_err(|_| RpcErrorCode::InvalidResponse)
            }))
        });
    }

    fn on_rpc_message(&self, conn: &TcpConnectionPtr, message: RpcMessage, _receive_time: Timestamp) {
        match message.kind {
            MessageKind::Response | MessageKind::Error => {
                let pending = self.outstanding.lock().remove(&message.id);
                let Some(done) = pending else {
                    warn!("RpcChannel got an answer for unknown call {}", message.id);
                    return;
                };
                let result = if message.kind == MessageKind::Response {
                    message.response.ok_or(RpcErrorCode::InvalidResponse)
                } else {
                    Err(message.error.unwrap_or(RpcErrorCode::WrongProto))
                };
                done(result);
            }
            MessageKind::Request => self.serve(conn, message),
        }
    }

    fn serve(&self, conn: &TcpConnectionPtr, message: RpcMessage) {
        let id = message.id;
        let (Some(service_name), Some(method)) = (message.service, message.method) else {
            self.answer(conn, id, Err(RpcErrorCode::InvalidRequest));
            return;
        };
        let service = self.services.lock().get(&service_name).cloned();
        let Some(service) = service else {
            self.answer(conn, id, Err(RpcErrorCode::NoService));
            return;
        };

        let weak = self.weak_self.clone();
        let weak_conn = Arc::downgrade(conn);
        service.call(
            &method,
            message.request.unwrap_or(Value::Null),
            Box::new(move |result| {
                if let (Some(channel), Some(conn)) = (weak.upgrade(), weak_conn.upgrade()) {
                    channel.answer(&conn, id, result);
                }
            }),
        );
    }

    fn answer(&self, conn: &TcpConnectionPtr, id: u64, result: Result<Value, RpcErrorCode>) {
        let message = match result {
            Ok(response) => RpcMessage::response(id, response),
            Err(code) => RpcMessage::error(id, code),
        };
        self.codec.send(conn, &message);
    }
}
