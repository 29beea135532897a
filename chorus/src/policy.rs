//! LSP-specific routing and merging decisions.
//!
//! The router consults a [`Policy`] at every decision point; everything the
//! multiplexer knows about LSP semantics lives behind this trait, so an
//! alternative can be selected by name at startup (`--logic-class`).

use crate::aggregate::AggKey;
use crate::backend::{BackendId, BackendName};
use crate::merge::{deep_merge, is_scalar};
use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
};
use serde_json::{json, Value};
use std::collections::HashMap;

/// One backend as the policy sees it: a display name plus the capability
/// object from its `initialize` reply (empty until then).
pub struct BackendSeat {
    pub id: BackendId,
    pub name: BackendName,
    pub caps: Value,
}

impl BackendSeat {
    pub fn new(id: BackendId, name: BackendName) -> Self {
        Self {
            id,
            name,
            caps: Value::Object(Default::default()),
        }
    }
}

/// What to do with a server notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Forward to the client verbatim.
    Forward,
    /// Discard silently (e.g. a stale diagnostics publication).
    Drop,
    /// Feed into the aggregation with this key.
    Aggregate(AggKey),
}

/// Decides message routing and payload merging.
///
/// Hooks that receive `&mut Value` get the whole JSON-RPC message and may
/// rewrite the parts they understand (stashed `data` fields, diagnostic
/// `source` tags); the router forwards whatever they leave behind.
pub trait Policy: Send + Sync {
    /// Which backends receive this client request, in order.
    fn on_client_request(
        &mut self,
        method: &str,
        message: &mut Value,
        seats: &mut [BackendSeat],
    ) -> Vec<BackendId>;

    /// A notification arrived from the client.
    fn on_client_notification(&mut self, method: &str, params: Option<&Value>);

    /// The client answered a server-originated request.
    fn on_client_response(
        &mut self,
        method: &str,
        request_params: &Value,
        payload: Option<&Value>,
        is_error: bool,
        seat: &BackendSeat,
    );

    /// A backend sent a request to the client.
    fn on_server_request(&mut self, method: &str, params: Option<&Value>, seat: &BackendSeat);

    /// A backend sent a notification.
    fn on_server_notification(
        &mut self,
        method: &str,
        message: &mut Value,
        seats: &mut [BackendSeat],
        from: BackendId,
    );

    /// A backend answered a client request.
    fn on_server_response(
        &mut self,
        method: &str,
        request_params: &Value,
        message: &mut Value,
        is_error: bool,
        seats: &mut [BackendSeat],
        from: BackendId,
    );

    /// Aggregation key for a server notification, if any.
    fn notification_disposition(&mut self, method: &str, params: Option<&Value>) -> Disposition;

    /// How long an aggregation for this method waits for stragglers.
    fn aggregation_timeout_ms(&self, method: &str) -> u64;

    /// Fold `payload` into the running `aggregate`.
    fn aggregate_payloads(
        &mut self,
        method: &str,
        aggregate: Value,
        payload: &Value,
        is_error: bool,
        seats: &[BackendSeat],
        from: BackendId,
    ) -> Value;
}

/// Look up a policy implementation by name.
///
/// This is the seam `--logic-class` goes through; `lsp` (the default) maps
/// to [`LspPolicy`].
pub fn create_policy(name: &str) -> Option<Box<dyn Policy>> {
    match name {
        "lsp" | "default" => Some(Box::new(LspPolicy::new())),
        _ => None,
    }
}

/// Key under which a backend's identity is stashed into `data` fields.
const STASH_SERVER: &str = "chorus-server";
/// Key under which the original `data` value is kept alongside it.
const STASH_DATA: &str = "chorus-data";

/// The default policy.
pub struct LspPolicy {
    /// Latest version the client announced per open document.
    document_versions: HashMap<String, i64>,
}

impl LspPolicy {
    pub fn new() -> Self {
        Self {
            document_versions: HashMap::new(),
        }
    }

    fn merge_diagnostics(
        &self,
        mut aggregate: Value,
        payload: &Value,
        seats: &[BackendSeat],
        from: BackendId,
    ) -> Value {
        let name = seats[from].name.get();
        let mut incoming = payload
            .get("diagnostics")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for diagnostic in &mut incoming {
            tag_source(diagnostic, &name);
        }

        if let Some(object) = aggregate.as_object_mut() {
            let existing = object
                .entry("diagnostics")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(items) = existing.as_array_mut() {
                items.extend(incoming);
            }
        }
        aggregate
    }

    fn merge_initialize(
        &self,
        mut aggregate: Value,
        payload: &Value,
        from: BackendId,
    ) -> Value {
        if !aggregate.is_object() {
            return aggregate;
        }
        let from_primary = from == 0;

        let mut caps = aggregate
            .get("capabilities")
            .cloned()
            .unwrap_or_else(|| json!({}));
        if let (Some(merged), Some(incoming)) = (
            caps.as_object_mut(),
            payload.get("capabilities").and_then(Value::as_object),
        ) {
            for (cap, new_value) in incoming {
                let value = match merged.get(cap) {
                    None | Some(Value::Null) => new_value.clone(),
                    Some(_) if cap == "textDocumentSync" && is_full_sync(new_value) => {
                        // Full sync is the lowest common denominator: if any
                        // backend needs full document content, advertise it.
                        new_value.clone()
                    }
                    Some(existing) if is_scalar(existing) != is_scalar(new_value) => {
                        new_value.clone()
                    }
                    Some(existing)
                        if existing.is_object()
                            && new_value.is_object()
                            && cap != "semanticTokensProvider" =>
                    {
                        deep_merge(existing, new_value)
                    }
                    Some(existing) => existing.clone(),
                };
                merged.insert(cap.clone(), value);
            }
        }
        aggregate["capabilities"] = caps;

        let incoming_info = payload
            .get("serverInfo")
            .and_then(Value::as_object)
            .filter(|info| !info.is_empty());
        if let Some(incoming_info) = incoming_info {
            let merged_info = aggregate.get("serverInfo").cloned().unwrap_or(Value::Null);
            let join = |field: &str, separator: &str| -> String {
                let current = merged_info
                    .get(field)
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let incoming = incoming_info
                    .get(field)
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if current.is_empty() || incoming.is_empty() {
                    let keep = if incoming.is_empty() { current } else { incoming };
                    keep.to_owned()
                } else if from_primary {
                    // The primary's half always comes first.
                    format!("{incoming}{separator}{current}")
                } else {
                    format!("{current}{separator}{incoming}")
                }
            };
            aggregate["serverInfo"] = json!({
                "name": join("name", "+"),
                "version": join("version", ","),
            });
        }
        aggregate
    }
}

impl Default for LspPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for LspPolicy {
    fn on_client_request(
        &mut self,
        method: &str,
        message: &mut Value,
        seats: &mut [BackendSeat],
    ) -> Vec<BackendId> {
        // A `*/resolve` request whose `data` carries a stash goes back to
        // the backend the item came from, with the original data restored.
        if method.ends_with("resolve") {
            let stashed = message.pointer("/params/data").and_then(|data| {
                let id = data.get(STASH_SERVER)?.as_u64()? as usize;
                (id < seats.len())
                    .then(|| (id, data.get(STASH_DATA).cloned().unwrap_or(Value::Null)))
            });
            if let Some((id, original)) = stashed {
                if let Some(slot) = message.pointer_mut("/params/data") {
                    *slot = original;
                }
                return vec![id];
            }
        }

        if method == "initialize" || method == "shutdown" {
            return seats.iter().map(|seat| seat.id).collect();
        }

        if method == "textDocument/codeAction" {
            return seats
                .iter()
                .filter(|seat| truthy(seat.caps.get("codeActionProvider")))
                .map(|seat| seat.id)
                .collect();
        }

        if method == "textDocument/completion" {
            let candidates: Vec<BackendId> = seats
                .iter()
                .filter(|seat| truthy(seat.caps.get("completionProvider")))
                .map(|seat| seat.id)
                .collect();
            if candidates.len() <= 1 {
                return candidates;
            }
            let trigger = message
                .pointer("/params/context/triggerCharacter")
                .and_then(Value::as_str);
            if let Some(trigger) = trigger {
                return candidates
                    .into_iter()
                    .filter(|&id| {
                        seats[id]
                            .caps
                            .pointer("/completionProvider/triggerCharacters")
                            .and_then(Value::as_array)
                            .is_some_and(|chars| {
                                chars.iter().any(|c| c.as_str() == Some(trigger))
                            })
                    })
                    .collect();
            }
            return candidates;
        }

        // Methods served by at most one backend.
        let exclusive = match method {
            "textDocument/rename" => Some("renameProvider"),
            "textDocument/formatting" => Some("documentFormattingProvider"),
            "textDocument/rangeFormatting" => Some("documentRangeFormattingProvider"),
            _ => None,
        };
        if let Some(capability) = exclusive {
            return seats
                .iter()
                .find(|seat| truthy(seat.caps.get(capability)))
                .map(|seat| vec![seat.id])
                .unwrap_or_default();
        }

        // Everything else goes to the primary.
        seats.first().map(|seat| vec![seat.id]).unwrap_or_default()
    }

    fn on_client_notification(&mut self, method: &str, params: Option<&Value>) {
        let Some(params) = params else { return };
        match method {
            "textDocument/didOpen" => {
                if let Ok(p) = serde_json::from_value::<DidOpenTextDocumentParams>(params.clone())
                {
                    self.document_versions.insert(
                        p.text_document.uri.as_str().to_owned(),
                        i64::from(p.text_document.version),
                    );
                }
            }
            "textDocument/didChange" => {
                if let Ok(p) =
                    serde_json::from_value::<DidChangeTextDocumentParams>(params.clone())
                {
                    self.document_versions.insert(
                        p.text_document.uri.as_str().to_owned(),
                        i64::from(p.text_document.version),
                    );
                }
            }
            "textDocument/didClose" => {
                if let Ok(p) =
                    serde_json::from_value::<DidCloseTextDocumentParams>(params.clone())
                {
                    self.document_versions.remove(p.text_document.uri.as_str());
                }
            }
            _ => {}
        }
    }

    fn on_client_response(
        &mut self,
        _method: &str,
        _request_params: &Value,
        _payload: Option<&Value>,
        _is_error: bool,
        _seat: &BackendSeat,
    ) {
    }

    fn on_server_request(&mut self, _method: &str, _params: Option<&Value>, _seat: &BackendSeat) {}

    fn on_server_notification(
        &mut self,
        method: &str,
        message: &mut Value,
        seats: &mut [BackendSeat],
        from: BackendId,
    ) {
        if method == "textDocument/publishDiagnostics" {
            let name = seats[from].name.get();
            if let Some(diagnostics) = message
                .pointer_mut("/params/diagnostics")
                .and_then(Value::as_array_mut)
            {
                for diagnostic in diagnostics {
                    tag_source(diagnostic, &name);
                }
            }
        }
    }

    fn on_server_response(
        &mut self,
        method: &str,
        _request_params: &Value,
        message: &mut Value,
        is_error: bool,
        seats: &mut [BackendSeat],
        from: BackendId,
    ) {
        if is_error {
            return;
        }
        let Some(payload) = message.get_mut("result") else {
            return;
        };
        if !truthy(Some(payload)) {
            return;
        }

        match method {
            "textDocument/codeAction" => {
                if let Some(actions) = payload.as_array_mut() {
                    for action in actions {
                        stash_data(action, from);
                    }
                }
            }
            "textDocument/completion" => {
                let items = if payload.is_array() {
                    payload.as_array_mut()
                } else {
                    payload.get_mut("items").and_then(Value::as_array_mut)
                };
                if let Some(items) = items {
                    for item in items {
                        stash_data(item, from);
                    }
                }
            }
            "initialize" => {
                if let Some(name) = payload.pointer("/serverInfo/name").and_then(Value::as_str) {
                    seats[from].name.set(name);
                }
                seats[from].caps = payload
                    .get("capabilities")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
            }
            _ => {}
        }
    }

    fn notification_disposition(&mut self, method: &str, params: Option<&Value>) -> Disposition {
        if method != "textDocument/publishDiagnostics" {
            return Disposition::Forward;
        }

        let uri = params
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let mut version = params.and_then(|p| p.get("version")).and_then(Value::as_i64);

        if let Some(&tracked) = self.document_versions.get(&uri) {
            match version {
                // An unversioned publication counts as current.
                None => version = Some(tracked),
                Some(v) if v < tracked => return Disposition::Drop,
                Some(_) => {}
            }
        }

        Disposition::Aggregate(AggKey::Notification {
            method: method.to_owned(),
            uri,
            version: version.unwrap_or(0),
        })
    }

    fn aggregation_timeout_ms(&self, method: &str) -> u64 {
        if method == "textDocument/publishDiagnostics" {
            1000
        } else {
            1500
        }
    }

    fn aggregate_payloads(
        &mut self,
        method: &str,
        aggregate: Value,
        payload: &Value,
        is_error: bool,
        seats: &[BackendSeat],
        from: BackendId,
    ) -> Value {
        // Error responses never improve an aggregate.
        if is_error {
            return aggregate;
        }

        match method {
            "textDocument/publishDiagnostics" => {
                self.merge_diagnostics(aggregate, payload, seats, from)
            }
            "textDocument/codeAction" => {
                let mut actions = aggregate.as_array().cloned().unwrap_or_default();
                actions.extend(payload.as_array().cloned().unwrap_or_default());
                Value::Array(actions)
            }
            "textDocument/completion" => deep_merge(
                &normalize_completion(&aggregate),
                &normalize_completion(payload),
            ),
            "initialize" => self.merge_initialize(aggregate, payload, from),
            // shutdown results are null; anything unrecognized keeps the
            // first payload.
            _ => aggregate,
        }
    }
}

/// Normalize a `textDocument/completion` result to the `{items: …}` shape,
/// so bare-array and `CompletionList` responses merge the same way.
fn normalize_completion(value: &Value) -> Value {
    match value {
        Value::Array(items) => json!({ "items": items }),
        other => other.clone(),
    }
}

/// Python-style truthiness over JSON: absent, null, false, 0, "" and empty
/// containers all count as false.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(true, |f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// `textDocumentSync` advertises full sync as the literal `1` or as an
/// options object with `change == 1`.
fn is_full_sync(value: &Value) -> bool {
    value.as_i64() == Some(1) || value.get("change").and_then(Value::as_i64) == Some(1)
}

/// Give a sourceless diagnostic the contributing backend's name.
fn tag_source(diagnostic: &mut Value, name: &str) {
    if let Some(object) = diagnostic.as_object_mut() {
        object
            .entry("source")
            .or_insert_with(|| Value::String(name.to_owned()));
    }
}

/// Replace an item's `data` with a wrapper recording which backend it came
/// from, so a later `*/resolve` can find its way home.
fn stash_data(item: &mut Value, from: BackendId) {
    let Some(object) = item.as_object_mut() else {
        return;
    };
    if let Some(original) = object.remove("data") {
        let mut stash = serde_json::Map::new();
        stash.insert(STASH_SERVER.to_owned(), json!(from));
        stash.insert(STASH_DATA.to_owned(), original);
        object.insert("data".to_owned(), Value::Object(stash));
    }
}
