//! Request/response RPC over the tagged codec.
//!
//! Every message is one [`RpcMessage`] carried in a `"RPC0"` frame. Requests
//! name a service and method; the peer answers with a response or an error
//! code under the same id.

mod channel;
mod server;

use std::{collections::HashMap, sync::Arc};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use channel::{ResponseCallback, RpcChannel};
pub use server::RpcServer;

use crate::codec::{Message, TaggedCodec};

pub const RPC_TAG: &str = "RPC0";

pub type RpcCodec = TaggedCodec<RpcMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Response,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RpcErrorCode {
    #[error("no error")]
    NoError,
    #[error("wrong protocol")]
    WrongProto,
    #[error("no such service")]
    NoService,
    #[error("no such method")]
    NoMethod,
    #[error("invalid request")]
    InvalidRequest,
    #[error("invalid response")]
    InvalidResponse,
    #[error("timeout")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub kind: MessageKind,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorCode>,
}

impl Message for RpcMessage {
    const TYPE_NAME: &'static str = "mill.rpc.RpcMessage";
}

impl RpcMessage {
    pub fn request(id: u64, service: &str, method: &str, request: Value) -> Self {
        Self {
            kind: MessageKind::Request,
            id,
            service: Some(service.to_string()),
            method: Some(method.to_string()),
            request: Some(request),
            response: None,
            error: None,
        }
    }

    pub fn response(id: u64, response: Value) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            service: None,
            method: None,
            request: None,
            response: Some(response),
            error: None,
        }
    }

    pub fn error(id: u64, code: RpcErrorCode) -> Self {
        Self {
            kind: MessageKind::Error,
            id,
            service: None,
            method: None,
            request: None,
            response: None,
            error: Some(code),
        }
    }
}

/// Completes one call with a response value or an error code.
pub type Done = Box<dyn FnOnce(Result<Value, RpcErrorCode>) + Send>;

/// A named set of methods served over an [`RpcChannel`].
///
/// Implementations answer through `done`, possibly later and from another
/// thread. Unknown methods should answer `NoMethod`; requests that do not
/// decode should answer `InvalidRequest`.
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn call(&self, method: &str, request: Value, done: Done);
}

pub type ServiceMap = HashMap<String, Arc<dyn Service>>;

pub fn decode_request<T: DeserializeOwned>(request: Value) -> Result<T, RpcErrorCode> {
    serde_json::from_value(request).map_err(|_| RpcErrorCode::InvalidRequest)
}

pub fn encode_response<T: Serialize>(response: &T) -> Result<Value, RpcErrorCode> {
    serde_json::to_value(response).map_err(|_| RpcErrorCode::InvalidResponse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_fields_are_skipped() {
        let encoded = serde_json::to_value(RpcMessage::error(7, RpcErrorCode::NoService)).unwrap();
        assert_eq!(encoded, json!({"kind": "Error", "id": 7, "error": "NoService"}));
        let decoded: RpcMessage = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.error, Some(RpcErrorCode::NoService));
        assert!(decoded.service.is_none());
    }

    #[test]
    fn request_helpers() {
        #[derive(Deserialize)]
        struct Sum {
            a: i32,
            b: i32,
        }
        let sum: Sum = decode_request(json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(sum.a + sum.b, 3);
        assert_eq!(
            decode_request::<Sum>(json!("nope")).err(),
            Some(RpcErrorCode::InvalidRequest)
        );
        assert_eq!(encode_response(&3).unwrap(), json!(3));
    }
}
