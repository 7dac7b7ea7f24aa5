use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{info, warn};

use super::{ErrorCode, Frame, Message};
use crate::{net::TcpConnectionPtr, timestamp::Timestamp};

type Route = Arc<dyn Fn(&TcpConnectionPtr, &[u8], Timestamp) -> Result<(), ErrorCode> + Send + Sync>;

/// Receives frames whose type name has no route: `(conn, type_name, payload, time)`.
pub type DefaultCallback = Arc<dyn Fn(&TcpConnectionPtr, &str, &[u8], Timestamp) + Send + Sync>;

/// Routes typed frames to per-type callbacks.
///
/// Each route deserializes the payload straight into its registered type,
/// so callbacks receive `M` by value.
#[derive(Default)]
pub struct Dispatcher {
    routes: RwLock<HashMap<&'static str, Route>>,
    default_callback: RwLock<Option<DefaultCallback>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_callback<F>(callback: F) -> Self
    where
        F: Fn(&TcpConnectionPtr, &str, &[u8], Timestamp) + Send + Sync + 'static,
    {
        let dispatcher = Self::new();
        *dispatcher.default_callback.write() = Some(Arc::new(callback));
        dispatcher
    }

    /// Routes frames named `M::TYPE_NAME` to `callback`, replacing any earlier route.
    pub fn register<M, F>(&self, callback: F)
    where
        M: Message,
        F: Fn(&TcpConnectionPtr, M, Timestamp) + Send + Sync + 'static,
    {
        let route: Route = Arc::new(
            move |conn: &TcpConnectionPtr, payload: &[u8], receive_time: Timestamp| {
                let message: M =
                    serde_json::from_slice(payload).map_err(|_| ErrorCode::ParseError)?;
                callback(conn, message, receive_time);
                Ok(())
            },
        );
        if self.routes.write().insert(M::TYPE_NAME, route).is_some() {
            info!("Dispatcher route for {} replaced", M::TYPE_NAME);
        }
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.routes.read().contains_key(type_name)
    }

    /// Frame callback for a [`TypedCodec`](super::TypedCodec).
    pub fn on_frame(
        &self,
        conn: &TcpConnectionPtr,
        frame: Frame<'_>,
        receive_time: Timestamp,
    ) -> Result<(), ErrorCode> {
        let route = self.routes.read().get(frame.type_name).cloned();
        if let Some(route) = route {
            return route(conn, frame.payload, receive_time);
        }
        let fallback = self.default_callback.read().clone();
        match fallback {
            Some(callback) => {
                callback(conn, frame.type_name, frame.payload, receive_time);
                Ok(())
            }
            None => {
                warn!("Dispatcher has no route for {}", frame.type_name);
                Err(ErrorCode::UnknownMessageType)
            }
        }
    }
}
