//! JSON codec and the call request envelope.
//!
//! Every call starts with a JSON body naming the method, its arguments and
//! the call kind:
//!
//! ```text
//! {"name": ["hello"], "args": ["Bob", "Alice"], "type": "async"}
//! ```
//!
//! # Example
//!
//! ```
//! use muxrpc::codec::{CallRequest, JsonCodec};
//! use muxrpc::CallKind;
//!
//! let request = CallRequest::new("sub.hello", serde_json::json!(["Bob"]), CallKind::Async);
//! let bytes = JsonCodec::encode(&request).unwrap();
//! let back: CallRequest = JsonCodec::decode(&bytes).unwrap();
//! assert_eq!(back.method(), "sub.hello");
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Body;
use crate::error::{MuxrpcError, Result};
use crate::handler::CallKind;

/// JSON codec for bodies.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode JSON bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialize call arguments into the positional argument array.
    ///
    /// Tuples and sequences become the array as-is, `()` becomes `[]`,
    /// anything else becomes a single argument.
    pub fn args<T: Serialize + ?Sized>(args: &T) -> Result<Value> {
        Ok(match serde_json::to_value(args)? {
            Value::Array(items) => Value::Array(items),
            Value::Null => Value::Array(Vec::new()),
            single => Value::Array(vec![single]),
        })
    }
}

/// Method name as sent on the wire: a path array, or a dotted string
/// from lenient peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum MethodName {
    Path(Vec<String>),
    Dotted(String),
}

/// Body of the first frame of every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    name: MethodName,
    /// Positional arguments.
    #[serde(default = "empty_args")]
    pub args: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

fn empty_args() -> Value {
    Value::Array(Vec::new())
}

impl CallRequest {
    /// Build a request for a dotted method name.
    pub fn new(method: &str, args: Value, kind: CallKind) -> Self {
        Self {
            name: MethodName::Path(method.split('.').map(str::to_string).collect()),
            args,
            kind: Some(kind.as_str().to_string()),
        }
    }

    /// Dotted method name.
    pub fn method(&self) -> String {
        match &self.name {
            MethodName::Path(parts) => parts.join("."),
            MethodName::Dotted(name) => name.clone(),
        }
    }

    /// Declared call kind.
    ///
    /// A missing type means async.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an unsupported kind.
    pub fn kind(&self) -> Result<CallKind> {
        match self.kind.as_deref() {
            None => Ok(CallKind::Async),
            Some(kind) => kind.parse(),
        }
    }

    /// Encode as a JSON body.
    pub fn to_body(&self) -> Result<Body> {
        Body::json(self)
    }

    /// Parse the body of a call frame.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the body is not a JSON call request.
    pub fn from_body(body: &Body) -> Result<Self> {
        match body {
            Body::Json(bytes) => JsonCodec::decode(bytes)
                .map_err(|e| MuxrpcError::protocol(format!("Malformed call request: {e}"))),
            other => Err(MuxrpcError::protocol(format!(
                "Call request must be JSON, got {:?} body",
                other.body_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = CallRequest::new("hello", json!(["Bob", "Alice"]), CallKind::Async);
        let value: Value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"name": ["hello"], "args": ["Bob", "Alice"], "type": "async"})
        );
    }

    #[test]
    fn test_dotted_method_name_splits() {
        let request = CallRequest::new("blobs.get", json!([]), CallKind::Source);
        let value: Value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["name"], json!(["blobs", "get"]));
        assert_eq!(request.method(), "blobs.get");
    }

    #[test]
    fn test_missing_type_is_async() {
        let body = Body::Json(br#"{"name":["whoami"],"args":[]}"#.to_vec().into());
        let request = CallRequest::from_body(&body).unwrap();
        assert_eq!(request.kind().unwrap(), CallKind::Async);
        assert_eq!(request.method(), "whoami");
    }

    #[test]
    fn test_string_name_and_missing_args() {
        let body = Body::Json(br#"{"name":"a.b","type":"source"}"#.to_vec().into());
        let request = CallRequest::from_body(&body).unwrap();
        assert_eq!(request.method(), "a.b");
        assert_eq!(request.args, json!([]));
        assert_eq!(request.kind().unwrap(), CallKind::Source);
    }

    #[test]
    fn test_unsupported_kind() {
        let body = Body::Json(br#"{"name":["x"],"args":[],"type":"bogus"}"#.to_vec().into());
        let request = CallRequest::from_body(&body).unwrap();
        assert!(matches!(request.kind(), Err(MuxrpcError::Protocol(_))));
    }

    #[test]
    fn test_non_json_request_is_protocol_error() {
        let result = CallRequest::from_body(&Body::text("hello"));
        assert!(matches!(result, Err(MuxrpcError::Protocol(_))));
    }

    #[test]
    fn test_args_normalization() {
        assert_eq!(JsonCodec::args(&("Bob", "Alice")).unwrap(), json!(["Bob", "Alice"]));
        assert_eq!(JsonCodec::args(&()).unwrap(), json!([]));
        assert_eq!(JsonCodec::args(&json!({"a": 1})).unwrap(), json!([{"a": 1}]));
        assert_eq!(JsonCodec::args(&"one").unwrap(), json!(["one"]));
    }
}
