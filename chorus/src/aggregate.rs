//! Per-aggregation bookkeeping.
//!
//! An aggregation collects the contributions of several backends to one
//! logical message: the responses to a fanned-out request, or matching
//! notifications (same method, document and version) from different
//! backends. The router creates one on first arrival, merges later
//! arrivals, and dispatches when the set completes or its timer fires.

use crate::backend::BackendId;
use crate::protocol::RequestId;
use serde_json::{json, Value};
use std::collections::HashSet;

/// Identity of one aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggKey {
    /// Responses to the client request with this id.
    Response(RequestId),
    /// Notifications grouped by method, document and version.
    Notification {
        method: String,
        uri: String,
        version: i64,
    },
}

/// Dispatch progress of an aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing sent yet.
    Pending,
    /// Sent on completion.
    Dispatched,
    /// Sent early because the timer fired; stragglers may still arrive.
    TimedOut,
}

/// State of one running aggregation.
pub struct Aggregation {
    /// Backends whose contribution is still expected.
    pub outstanding: HashSet<BackendId>,
    /// Client request id for response aggregations.
    pub id: Option<RequestId>,
    pub method: String,
    /// The running merged payload.
    pub aggregate: Value,
    pub dispatched: Dispatch,
    /// Timeout task; dropping it cancels the timer.
    pub timer: Option<smol::Task<()>>,
}

impl Aggregation {
    /// Rebuild the full JSON-RPC envelope around the aggregate.
    pub fn reconstruct(&self) -> Value {
        match &self.id {
            Some(id) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": self.aggregate,
            }),
            None => json!({
                "jsonrpc": "2.0",
                "method": self.method,
                "params": self.aggregate,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregation(id: Option<RequestId>) -> Aggregation {
        Aggregation {
            outstanding: HashSet::new(),
            id,
            method: "textDocument/publishDiagnostics".to_owned(),
            aggregate: json!({"uri": "file:///x", "diagnostics": []}),
            dispatched: Dispatch::Pending,
            timer: None,
        }
    }

    #[test]
    fn responses_reconstruct_with_id_and_result() {
        let mut ag = aggregation(Some(RequestId::Number(4)));
        ag.method = "initialize".to_owned();
        ag.aggregate = json!({"capabilities": {}});
        assert_eq!(
            ag.reconstruct(),
            json!({"jsonrpc": "2.0", "id": 4, "result": {"capabilities": {}}})
        );
    }

    #[test]
    fn notifications_reconstruct_with_method_and_params() {
        let ag = aggregation(None);
        assert_eq!(
            ag.reconstruct(),
            json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {"uri": "file:///x", "diagnostics": []},
            })
        );
    }

    #[test]
    fn null_results_still_serialize() {
        let mut ag = aggregation(Some(RequestId::Number(2)));
        ag.method = "shutdown".to_owned();
        ag.aggregate = Value::Null;
        let message = ag.reconstruct();
        assert!(message.as_object().unwrap().contains_key("result"));
        assert_eq!(message["result"], Value::Null);
    }
}
