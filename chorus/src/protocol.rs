//! JSON-RPC message shapes.
//!
//! The multiplexer forwards payloads untouched, so messages stay as raw
//! [`serde_json::Value`]s; this module only answers the structural questions
//! the router needs. The three shapes are distinguished by the presence of
//! `id` and `method`: a request has both, a response has only `id`, a
//! notification has only `method`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Request/response ID.
///
/// Can be either a number or a string per JSON-RPC 2.0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

/// The `method` field, if any.
pub fn method(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

/// The `id` field, if it is a number or string.
pub fn request_id(message: &Value) -> Option<RequestId> {
    match message.get("id") {
        Some(Value::Number(n)) => n.as_i64().map(RequestId::Number),
        Some(Value::String(s)) => Some(RequestId::String(s.clone())),
        _ => None,
    }
}

/// Split a response into its payload and an error flag.
///
/// Per JSON-RPC a response carries either `result` or `error`; the payload
/// is whichever is present.
pub fn response_payload(message: &Value) -> (Option<&Value>, bool) {
    match message.get("error") {
        Some(error) => (Some(error), true),
        None => (message.get("result"), false),
    }
}
