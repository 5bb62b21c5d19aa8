//! Codec module - frame bodies and JSON payloads.
//!
//! - [`Body`] - buffer, string or JSON body of a frame
//! - [`JsonCodec`] - `serde_json` encoding for values and call arguments
//! - [`CallRequest`] - the envelope that opens every call
//!
//! # Example
//!
//! ```
//! use muxrpc::codec::Body;
//!
//! let body = Body::json(&serde_json::json!({"a": 1})).unwrap();
//! let value: serde_json::Value = body.decode().unwrap();
//! assert_eq!(value["a"], 1);
//! ```

mod body;
mod json;

pub use body::Body;
pub use json::{CallRequest, JsonCodec};
