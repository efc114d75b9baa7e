//! JSON-RPC 2.0 request/response encode/decode over the framed channel.
//!
//! Every message is exactly one JSON object; arrays (batch requests) are
//! rejected since batch semantics are unused by this protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[allow(dead_code)]
    #[serde(default, rename = "jsonrpc")]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub struct Response;

impl Response {
    /// `{jsonrpc:"2.0", id, result}`
    pub fn success(id: Value, result: Value) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        })
    }

    /// `{jsonrpc:"2.0", id, error:{code, message, data?}}`
    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message.into() },
        })
    }

    pub fn error_with_data(id: Value, code: i64, message: impl Into<String>, data: Value) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message.into(), "data": data },
        })
    }
}

/// Decode one JSON-RPC request object from `plaintext`. Arrays are rejected
/// per the no-batch constraint; non-object top-level values are a parse
/// error addressed to a null id by the caller.
pub fn decode_request(plaintext: &[u8]) -> Result<Request, serde_json::Error> {
    let value: Value = serde_json::from_slice(plaintext)?;
    if !value.is_object() {
        // Force a deserialize error with a stable message for non-objects
        // (including arrays), since RPCRequest can't be derived from them.
        return serde_json::from_value(serde_json::json!(null));
    }
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_request_with_id() {
        let raw = br#"{"jsonrpc":"2.0","method":"list","params":{},"id":1}"#;
        let req = decode_request(raw).unwrap();
        assert_eq!(req.method, "list");
        assert!(!req.is_notification());
    }

    #[test]
    fn decodes_notification_without_id() {
        let raw = br#"{"jsonrpc":"2.0","method":"notification","params":{}}"#;
        let req = decode_request(raw).unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn rejects_array_batch() {
        let raw = br#"[{"method":"a"},{"method":"b"}]"#;
        assert!(decode_request(raw).is_err());
    }

    #[test]
    fn success_and_error_shapes() {
        let id = Value::from(1);
        let ok = Response::success(id.clone(), serde_json::json!({"code": 0}));
        assert_eq!(ok["result"]["code"], 0);
        let err = Response::error(id, METHOD_NOT_FOUND, "no such method");
        assert_eq!(err["error"]["code"], METHOD_NOT_FOUND);
    }
}
