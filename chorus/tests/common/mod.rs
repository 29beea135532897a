#![allow(dead_code)]

//! Shared harness for router integration tests.
//!
//! Tests play both sides of the multiplexer through in-memory wires: one
//! [`WirePeer`] acts as the editor, one per fake backend. No processes are
//! spawned, so the tests are deterministic up to the aggregation timers.

use chorus::{
    create_policy,
    router::{BackendLink, Router, RouterOptions},
    wire::{ChannelWire, WirePeer},
    BackendName,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

/// A multiplexer under test with its far ends.
pub struct Mux {
    pub client: WirePeer,
    pub backends: Vec<WirePeer>,
    pub done: smol::Task<Result<(), String>>,
}

pub fn start(names: &[&str], options: RouterOptions) -> Mux {
    let (client_wire, client) = ChannelWire::pair();

    let mut links = Vec::new();
    let mut backends = Vec::new();
    for (id, name) in names.iter().enumerate() {
        let (wire, peer) = ChannelWire::pair();
        links.push(BackendLink {
            id,
            name: BackendName::new(*name),
            wire: Arc::new(wire),
        });
        backends.push(peer);
    }

    let policy = create_policy("lsp").expect("default policy exists");
    let router = Router::new(Arc::new(client_wire), links, policy, options);
    let done = smol::spawn(async move { router.run().await.map_err(|error| format!("{error:#}")) });

    Mux {
        client,
        backends,
        done,
    }
}

pub fn request(id: i64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

pub fn response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

pub fn did_open_params(uri: &str, version: i64, text: &str) -> Value {
    json!({"textDocument": {
        "uri": uri,
        "languageId": "python",
        "version": version,
        "text": text,
    }})
}

pub fn did_change_params(uri: &str, version: i64, text: &str) -> Value {
    json!({
        "textDocument": {"uri": uri, "version": version},
        "contentChanges": [{"text": text}],
    })
}

/// Next message within five seconds, or panic.
pub async fn expect_message(peer: &WirePeer) -> Value {
    peer.recv_timeout(Duration::from_secs(5))
        .await
        .expect("timed out waiting for a message")
}

/// Read until a message with the given method arrives.
pub async fn expect_method(peer: &WirePeer, method: &str) -> Value {
    loop {
        let message = expect_message(peer).await;
        if message["method"] == method {
            return message;
        }
    }
}

/// Assert that nothing arrives within `timeout`.
pub async fn expect_nothing(peer: &WirePeer, timeout: Duration) {
    if let Some(message) = peer.recv_timeout(timeout).await {
        panic!("expected no message, got {message}");
    }
}

/// Consume messages until the multiplexer closes this direction.
pub async fn drain_until_closed(peer: &WirePeer) {
    while peer.recv_timeout(Duration::from_secs(5)).await.is_some() {}
}

/// Answer an incoming `initialize` with the given capabilities.
pub async fn respond_initialize(peer: &WirePeer, caps: Value, name: &str, version: &str) {
    let req = expect_method(peer, "initialize").await;
    peer.send(response(
        req["id"].clone(),
        json!({
            "capabilities": caps,
            "serverInfo": {"name": name, "version": version},
        }),
    ))
    .await;
}

/// Full initialize exchange: request, per-backend replies, merged response.
pub async fn initialize_all(mux: &Mux, caps: &[Value]) -> Value {
    assert_eq!(caps.len(), mux.backends.len());
    mux.client.send(request(1, "initialize", json!({}))).await;
    for (index, (peer, caps)) in mux.backends.iter().zip(caps).enumerate() {
        respond_initialize(peer, caps.clone(), &format!("srv{index}"), "1.0").await;
    }
    expect_message(&mux.client).await
}

/// Orderly end of session: shutdown request, exit notification, client EOF,
/// backend EOFs; asserts the router finished cleanly.
pub async fn shutdown_cleanly(mux: Mux) {
    mux.client.send(request(99, "shutdown", json!(null))).await;
    for peer in &mux.backends {
        let req = expect_method(peer, "shutdown").await;
        peer.send(response(req["id"].clone(), Value::Null)).await;
    }
    let reply = expect_message(&mux.client).await;
    assert_eq!(reply["id"], 99);

    mux.client.send(notification("exit", json!(null))).await;
    mux.client.close();

    for peer in &mux.backends {
        drain_until_closed(peer).await;
        peer.close();
    }

    mux.done.await.expect("router should exit cleanly");
}
