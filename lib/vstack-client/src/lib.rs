// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface for invoking operations on the vStack JSON-RPC API.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slog::{debug, o, Logger};
use thiserror::Error;
use uuid::Uuid;

use vstack_types::{Action, VmId};

pub mod api;
mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use api::{RpcMethod, StatusCode};
pub use http::HttpTransport;

/// Version tag carried by every request envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Errors which may be returned from the vStack client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bad Status: {0}")]
    Status(u16),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{method}: API error {code}: {message}")]
    Rpc { method: String, code: i64, message: String },

    #[error("{method}: returned code={code}: {message}")]
    Domain { method: String, code: StatusCode, message: String },

    #[error("{method}: response carries neither a result nor an error")]
    MissingResult { method: String },

    #[error("{method}: result carries no data")]
    MissingData { method: String },

    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl Error {
    /// The status code of a domain failure, if this is one.
    pub fn domain_code(&self) -> Option<StatusCode> {
        match self {
            Error::Domain { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: Uuid,
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
}

impl RequestEnvelope {
    /// Wraps parameters for `M` in an envelope with a fresh request id.
    pub fn new<M: RpcMethod>(params: &M::Params) -> Result<Self, Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: M::NAME.to_string(),
            params: serde_json::to_value(params)?,
        })
    }
}

/// Envelope-level failure: the platform refused the request outright.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ResponseEnvelope {
    /// Decodes the result of `M`, treating an envelope error or a status code
    /// other than success as a failure.
    pub fn decode<M: RpcMethod>(self) -> Result<Option<M::Data>, Error> {
        if let Some(err) = self.error {
            return Err(Error::Rpc {
                method: M::NAME.to_string(),
                code: err.code,
                message: err.message,
            });
        }
        let Some(result) = self.result else {
            return Err(Error::MissingResult { method: M::NAME.to_string() });
        };
        let body: api::ResultBody = serde_json::from_value(result)?;

        if !body.code.is_success() {
            return Err(Error::Domain {
                method: M::NAME.to_string(),
                code: body.code,
                message: failure_message(body.data.as_ref()),
            });
        }

        match body.data {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
        }
    }
}

// Failed results usually explain themselves in `data.message`; otherwise
// fall back to whatever data came along.
fn failure_message(data: Option<&serde_json::Value>) -> String {
    match data {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(data) => match data.get("message").and_then(|m| m.as_str()) {
            Some(message) => message.to_string(),
            None => data.to_string(),
        },
    }
}

/// Delivers one request envelope to the platform and returns its response.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(
        &self,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, Error>;
}

/// Client-side connection to the vStack API.
///
/// Each invocation is delivered at most once; nothing is retried or cached.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn RpcTransport>,
    log: Logger,
}

impl Client {
    pub fn new(transport: Arc<dyn RpcTransport>, log: Logger) -> Self {
        Self { transport, log: log.new(o!("component" => "vstack-client")) }
    }

    /// Invokes `M`, returning its result data if the platform sent any.
    pub async fn invoke<M: RpcMethod>(
        &self,
        params: &M::Params,
    ) -> Result<Option<M::Data>, Error> {
        let request = RequestEnvelope::new::<M>(params)?;
        debug!(self.log, "invoking remote method";
            "method" => M::NAME,
            "request_id" => %request.id,
        );
        let response = self.transport.send(&request).await?;
        response.decode::<M>().map_err(|e| {
            debug!(self.log, "remote method failed";
                "method" => M::NAME,
                "request_id" => %request.id,
                "error" => %e,
            );
            e
        })
    }

    /// Invokes `M`, requiring the result to carry data.
    pub async fn call<M: RpcMethod>(
        &self,
        params: &M::Params,
    ) -> Result<M::Data, Error> {
        self.invoke::<M>(params)
            .await?
            .ok_or_else(|| Error::MissingData { method: M::NAME.to_string() })
    }

    /// Runs the remote operation registered for `action`.
    pub async fn run_action(
        &self,
        action: Action,
        id: VmId,
    ) -> Result<(), Error> {
        let params = api::VmIdParams { id };
        match action {
            Action::Start => self.invoke::<api::VmsRestart>(&params).await?,
            Action::Stop => self.invoke::<api::VmsStop>(&params).await?,
        };
        Ok(())
    }

    /// Describes a VM.
    pub async fn vm_get(&self, id: VmId) -> Result<api::VmDescription, Error> {
        self.call::<api::VmGet>(&api::VmIdParams { id }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> ResponseEnvelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn request_envelope_shape() {
        let params = api::VmIdParams { id: VmId::new(42).unwrap() };
        let a = RequestEnvelope::new::<api::VmGet>(&params).unwrap();
        let b = RequestEnvelope::new::<api::VmGet>(&params).unwrap();
        assert_ne!(a.id, b.id);

        let value = serde_json::to_value(&a).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "vm-get");
        assert_eq!(value["params"], json!({"id": 42}));
    }

    #[test]
    fn decode_success_with_string_code() {
        let resp = envelope(json!({
            "id": "x", "jsonrpc": "2.0",
            "result": {"code": "1", "data": {"id": 17}}
        }));
        let data = resp.decode::<api::VmsCreate>().unwrap().unwrap();
        assert_eq!(data.id, Some(17));
    }

    #[test]
    fn decode_success_without_data() {
        let resp = envelope(json!({"result": {"code": 1}}));
        assert_eq!(resp.decode::<api::VmsStop>().unwrap(), None);
    }

    #[test]
    fn decode_domain_failure_surfaces_message() {
        let resp = envelope(json!({
            "result": {"code": 7, "data": {"message": "VM is locked"}}
        }));
        let err = resp.decode::<api::VmSet>().unwrap_err();
        assert_eq!(err.domain_code(), Some(StatusCode(7)));
        let text = err.to_string();
        assert!(text.contains("vm-set"), "{text}");
        assert!(text.contains("VM is locked"), "{text}");
    }

    #[test]
    fn decode_envelope_error() {
        let resp = envelope(json!({
            "error": {"code": -32601, "message": "Method not found"}
        }));
        match resp.decode::<api::VmGet>() {
            Err(Error::Rpc { method, code, message }) => {
                assert_eq!(method, "vm-get");
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn decode_missing_result() {
        let resp = envelope(json!({"id": "x"}));
        assert!(matches!(
            resp.decode::<api::VmGet>(),
            Err(Error::MissingResult { .. })
        ));
    }

    #[test]
    fn failure_message_falls_back_to_raw_data() {
        assert_eq!(failure_message(None), "");
        assert_eq!(
            failure_message(Some(&json!({"reason": "busy"}))),
            r#"{"reason":"busy"}"#
        );
    }
}
