//! End-to-end aggregation behavior: capability union, diagnostics merging,
//! stale-version suppression, and tardy-reply handling.

mod common;

use chorus::router::RouterOptions;
use common::*;
use serde_json::{json, Value};
use std::time::Duration;

fn diagnostic(message: &str, source: Option<&str>) -> Value {
    let diagnostic = lsp_types::Diagnostic {
        range: lsp_types::Range::new(
            lsp_types::Position::new(0, 0),
            lsp_types::Position::new(0, 3),
        ),
        severity: Some(lsp_types::DiagnosticSeverity::ERROR),
        source: source.map(str::to_owned),
        message: message.to_owned(),
        ..Default::default()
    };
    serde_json::to_value(diagnostic).expect("diagnostics serialize")
}

#[test]
fn initialize_merges_capabilities_and_server_info() {
    smol::block_on(async {
        let mux = start(&["primary", "secondary"], RouterOptions::default());

        mux.client.send(request(1, "initialize", json!({}))).await;
        respond_initialize(
            &mux.backends[0],
            json!({"hoverProvider": true, "textDocumentSync": 2}),
            "primary",
            "1.0.0",
        )
        .await;
        respond_initialize(
            &mux.backends[1],
            json!({"textDocumentSync": 1, "codeActionProvider": true}),
            "secondary",
            "2.0.0",
        )
        .await;

        let reply = expect_message(&mux.client).await;
        assert_eq!(reply["id"], 1);
        assert_eq!(
            reply["result"]["capabilities"],
            json!({
                "hoverProvider": true,
                "textDocumentSync": 1,
                "codeActionProvider": true,
            })
        );
        assert_eq!(reply["result"]["serverInfo"]["name"], "primary+secondary");
        assert_eq!(reply["result"]["serverInfo"]["version"], "1.0.0,2.0.0");

        // Exactly one response for the request.
        expect_nothing(&mux.client, Duration::from_millis(300)).await;

        shutdown_cleanly(mux).await;
    });
}

#[test]
fn diagnostics_from_all_backends_arrive_as_one_message() {
    smol::block_on(async {
        let mux = start(&["alpha", "beta"], RouterOptions::default());

        mux.client
            .send(notification(
                "textDocument/didOpen",
                did_open_params("file:///x", 1, "import os\n"),
            ))
            .await;
        expect_method(&mux.backends[0], "textDocument/didOpen").await;
        expect_method(&mux.backends[1], "textDocument/didOpen").await;

        mux.backends[0]
            .send(notification(
                "textDocument/publishDiagnostics",
                json!({
                    "uri": "file:///x",
                    "version": 1,
                    "diagnostics": [diagnostic("one", None), diagnostic("two", Some("mypy"))],
                }),
            ))
            .await;
        mux.backends[1]
            .send(notification(
                "textDocument/publishDiagnostics",
                json!({
                    "uri": "file:///x",
                    "version": 1,
                    "diagnostics": [diagnostic("three", None)],
                }),
            ))
            .await;

        let publish = expect_method(&mux.client, "textDocument/publishDiagnostics").await;
        let diagnostics = publish["params"]["diagnostics"].as_array().unwrap();
        assert_eq!(diagnostics.len(), 3);

        let sources: Vec<&str> = diagnostics
            .iter()
            .map(|d| d["source"].as_str().unwrap())
            .collect();
        assert!(sources.contains(&"alpha"));
        assert!(sources.contains(&"mypy"));
        assert!(sources.contains(&"beta"));

        expect_nothing(&mux.client, Duration::from_millis(300)).await;
        shutdown_cleanly(mux).await;
    });
}

#[test]
fn stale_publication_is_suppressed() {
    smol::block_on(async {
        let mux = start(&["solo"], RouterOptions::default());

        mux.client
            .send(notification(
                "textDocument/didOpen",
                did_open_params("file:///x", 1, "a = 1\n"),
            ))
            .await;
        mux.client
            .send(notification(
                "textDocument/didChange",
                did_change_params("file:///x", 2, "a = 2\n"),
            ))
            .await;
        expect_method(&mux.backends[0], "textDocument/didOpen").await;
        expect_method(&mux.backends[0], "textDocument/didChange").await;

        mux.backends[0]
            .send(notification(
                "textDocument/publishDiagnostics",
                json!({"uri": "file:///x", "version": 2, "diagnostics": [diagnostic("fresh", None)]}),
            ))
            .await;
        smol::Timer::after(Duration::from_millis(300)).await;
        mux.backends[0]
            .send(notification(
                "textDocument/publishDiagnostics",
                json!({"uri": "file:///x", "version": 1, "diagnostics": [diagnostic("stale", None)]}),
            ))
            .await;

        // Only the v2 publication comes through (after its aggregation
        // timer, since the lone backend is the only contributor).
        let publish = expect_method(&mux.client, "textDocument/publishDiagnostics").await;
        assert_eq!(publish["params"]["version"], 2);
        assert_eq!(publish["params"]["diagnostics"][0]["message"], "fresh");

        expect_nothing(&mux.client, Duration::from_millis(1300)).await;
        shutdown_cleanly(mux).await;
    });
}

#[test]
fn tardy_reply_is_dropped_with_drop_tardy() {
    smol::block_on(async {
        let options = RouterOptions {
            drop_tardy: true,
            ..Default::default()
        };
        let mux = start(&["fast", "slow"], options);

        mux.client.send(request(1, "initialize", json!({}))).await;
        respond_initialize(&mux.backends[0], json!({"hoverProvider": true}), "fast", "1").await;
        // The slow backend holds its reply past the 1500ms response timeout.

        let reply = expect_message(&mux.client).await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["serverInfo"]["name"], "fast");
        assert_eq!(reply["result"]["capabilities"], json!({"hoverProvider": true}));

        // Now the straggler answers; with --drop-tardy the client must not
        // see a second response.
        respond_initialize(&mux.backends[1], json!({"codeActionProvider": true}), "slow", "2")
            .await;
        expect_nothing(&mux.client, Duration::from_secs(1)).await;

        shutdown_cleanly(mux).await;
    });
}

#[test]
fn late_completion_redispatches_by_default() {
    smol::block_on(async {
        let mux = start(&["fast", "slow"], RouterOptions::default());

        mux.client.send(request(1, "initialize", json!({}))).await;
        respond_initialize(&mux.backends[0], json!({"hoverProvider": true}), "fast", "1").await;

        // First delivery: the timed-out aggregate built from the fast
        // backend alone.
        let first = expect_message(&mux.client).await;
        assert_eq!(first["id"], 1);
        assert_eq!(first["result"]["serverInfo"]["name"], "fast");

        // The straggler completes the aggregation, which is re-sent.
        respond_initialize(&mux.backends[1], json!({"codeActionProvider": true}), "slow", "2")
            .await;
        let second = expect_message(&mux.client).await;
        assert_eq!(second["id"], 1);
        assert_eq!(second["result"]["serverInfo"]["name"], "fast+slow");
        assert_eq!(
            second["result"]["capabilities"],
            json!({"hoverProvider": true, "codeActionProvider": true})
        );

        shutdown_cleanly(mux).await;
    });
}
