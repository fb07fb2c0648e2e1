use std::{path::Path, time::Duration};

use httpmock::{Method::POST, MockServer};
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use ask_relay::{
    config::RelayConfig,
    error::RelayError,
    events::EventEmitter,
    mcp::McpServer,
    registry::{publish_descriptor, EndpointDescriptor},
    reply::IMAGE_MARKER,
    service::RelayService,
};

fn relay_config(port_dir: &Path) -> RelayConfig {
    RelayConfig {
        port_dir: port_dir.to_path_buf(),
        callback_port_start: 0,
        callback_port_attempts: 1,
        request_timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(10),
        discovery_retry_delay: Duration::from_millis(10),
        ..RelayConfig::default()
    }
}

fn mock_extension(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(POST)
            .path("/ask")
            .json_body_partial(r#"{"type":"ask_continue"}"#);
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"success":true}"#);
    })
}

async fn wait_for_pending(service: &RelayService) -> String {
    wait_for_pending_besides(service, &[]).await
}

/// First pending id that is not in `known`.
async fn wait_for_pending_besides(service: &RelayService, known: &[&str]) -> String {
    for _ in 0..400 {
        let fresh = service
            .pending()
            .ids()
            .into_iter()
            .find(|id| !known.contains(&id.as_str()));
        if let Some(id) = fresh {
            return id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no request became pending");
}

async fn post_reply(port: u16, body: Value) -> reqwest::Response {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("client")
        .post(format!("http://127.0.0.1:{port}/response"))
        .json(&body)
        .send()
        .await
        .expect("callback request")
}

#[tokio::test]
async fn reply_round_trip_through_published_descriptor() {
    let temp = tempdir().expect("tempdir");
    let extension = MockServer::start();
    let ask = mock_extension(&extension);
    publish_descriptor(
        temp.path(),
        &EndpointDescriptor {
            port: extension.port(),
            pid: Some(4242),
            time: Some(1_700_000_000_000),
        },
    )
    .expect("publish descriptor");

    let service = RelayService::start(relay_config(temp.path()), EventEmitter::new(false))
        .await
        .expect("service should start");
    let callback_port = service.callback_port();

    let caller = service.clone();
    let call = tokio::spawn(async move { caller.request_user_input("finished step 1").await });

    let id = wait_for_pending(&service).await;
    let accepted = post_reply(
        callback_port,
        json!({ "requestId": id, "userInput": "continue with X", "cancelled": false }),
    )
    .await;
    assert_eq!(accepted.status().as_u16(), 200);
    assert_eq!(
        accepted
            .headers()
            .get("access-control-allow-origin")
            .and_then(|value| value.to_str().ok()),
        Some("*")
    );
    assert_eq!(
        accepted.json::<Value>().await.expect("json"),
        json!({ "success": true })
    );

    let reply = call.await.expect("task").expect("reply");
    assert_eq!(reply, "continue with X");
    ask.assert_hits(1);

    let late = post_reply(callback_port, json!({ "requestId": id, "userInput": "again" })).await;
    assert_eq!(late.status().as_u16(), 404);
    assert!(service.pending().is_empty());
}

#[tokio::test]
async fn cancelled_reply_is_reported_as_cancellation() {
    let temp = tempdir().expect("tempdir");
    let extension = MockServer::start();
    let _ask = mock_extension(&extension);
    let service = RelayService::start(
        RelayConfig {
            default_extension_port: extension.port(),
            ..relay_config(temp.path())
        },
        EventEmitter::new(false),
    )
    .await
    .expect("service should start");

    let caller = service.clone();
    let call = tokio::spawn(async move { caller.request_user_input("ready for review").await });

    let id = wait_for_pending(&service).await;
    let response = post_reply(
        service.callback_port(),
        json!({ "requestId": id, "userInput": "ignored", "cancelled": true }),
    )
    .await;
    assert_eq!(response.status().as_u16(), 200);

    let error = call.await.expect("task").expect_err("cancelled");
    assert!(matches!(error, RelayError::Cancelled));
}

#[tokio::test]
async fn concurrent_requests_each_get_their_own_reply() {
    let temp = tempdir().expect("tempdir");
    let extension = MockServer::start();
    let busy = extension.mock(|when, then| {
        when.method(POST)
            .path("/ask")
            .json_body_partial(r#"{"reason":"still rendering"}"#);
        then.status(500)
            .body(r#"{"error":"Failed to show dialog","details":"window busy"}"#);
    });
    let ready = extension.mock(|when, then| {
        when.method(POST)
            .path("/ask")
            .json_body_partial(r#"{"reason":"tests pass"}"#);
        then.status(200).body(r#"{"success":true}"#);
    });
    let service = RelayService::start(
        RelayConfig {
            default_extension_port: extension.port(),
            backoff_base: Duration::from_millis(750),
            ..relay_config(temp.path())
        },
        EventEmitter::new(false),
    )
    .await
    .expect("service should start");

    let caller = service.clone();
    let retrying = tokio::spawn(async move { caller.request_user_input("still rendering").await });
    let retrying_id = wait_for_pending(&service).await;

    let caller = service.clone();
    let delivered = tokio::spawn(async move { caller.request_user_input("tests pass").await });
    let delivered_id = wait_for_pending_besides(&service, &[retrying_id.as_str()]).await;
    assert_ne!(retrying_id, delivered_id);

    let accepted = post_reply(
        service.callback_port(),
        json!({ "requestId": delivered_id, "userInput": "ship it" }),
    )
    .await;
    assert_eq!(accepted.status().as_u16(), 200);
    assert_eq!(delivered.await.expect("task").expect("reply"), "ship it");
    ready.assert_hits(1);

    // The other call is still between delivery rounds.
    assert!(!retrying.is_finished());
    assert!(service.pending().contains(&retrying_id));

    let accepted = post_reply(
        service.callback_port(),
        json!({ "requestId": retrying_id, "userInput": "wait for the render" }),
    )
    .await;
    assert_eq!(accepted.status().as_u16(), 200);
    assert_eq!(
        retrying.await.expect("task").expect("reply"),
        "wait for the render"
    );
    busy.assert_hits(3);
    assert!(service.pending().is_empty());
}

#[tokio::test]
async fn empty_descriptor_directory_falls_back_to_default_port() {
    let temp = tempdir().expect("tempdir");
    let extension = MockServer::start();
    let ask = extension.mock(|when, then| {
        when.method(POST).path("/ask");
        then.status(200).body(r#"{"success":true}"#);
    });
    let service = RelayService::start(
        RelayConfig {
            default_extension_port: extension.port(),
            ..relay_config(temp.path())
        },
        EventEmitter::new(false),
    )
    .await
    .expect("service should start");

    let caller = service.clone();
    let call = tokio::spawn(async move { caller.request_user_input("done").await });

    let id = wait_for_pending(&service).await;
    post_reply(service.callback_port(), json!({ "requestId": id, "userInput": "" })).await;

    assert_eq!(call.await.expect("task").expect("reply"), "");
    ask.assert_hits(1);
}

#[tokio::test]
async fn callback_listener_skips_occupied_port() {
    let temp = tempdir().expect("tempdir");
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("bind occupant");
    let taken = occupied.local_addr().expect("addr").port();

    let service = RelayService::start(
        RelayConfig {
            callback_port_start: taken,
            callback_port_attempts: 50,
            ..relay_config(temp.path())
        },
        EventEmitter::new(false),
    )
    .await
    .expect("service should start");

    assert!(service.is_listening());
    assert!(service.callback_port() > taken);
    assert!(u32::from(service.callback_port()) < u32::from(taken) + 50);

    let preflight = reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("client")
        .request(
            reqwest::Method::OPTIONS,
            format!("http://127.0.0.1:{}/response", service.callback_port()),
        )
        .send()
        .await
        .expect("preflight");
    assert_eq!(preflight.status().as_u16(), 200);
}

#[tokio::test]
async fn tool_call_over_stdio_renders_text_and_images() {
    let temp = tempdir().expect("tempdir");
    let extension = MockServer::start();
    let ask = extension.mock(|when, then| {
        when.method(POST)
            .path("/ask")
            .json_body_partial(r#"{"reason":"Task completed"}"#);
        then.status(200).body(r#"{"success":true}"#);
    });
    let service = RelayService::start(
        RelayConfig {
            default_extension_port: extension.port(),
            ..relay_config(temp.path())
        },
        EventEmitter::new(false),
    )
    .await
    .expect("service should start");

    let (mut client_in, server_in) = tokio::io::duplex(64 * 1024);
    let (server_out, client_out) = tokio::io::duplex(64 * 1024);
    let server = McpServer::new(service.clone());
    let serving = tokio::spawn(async move { server.run(BufReader::new(server_in), server_out).await });
    let mut responses = BufReader::new(client_out).lines();

    client_in
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"ask_continue\",\"arguments\":{}}}\n")
        .await
        .expect("write call");

    let id = wait_for_pending(&service).await;

    client_in
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n")
        .await
        .expect("write ping");
    let ping: Value = serde_json::from_str(
        &responses.next_line().await.expect("read").expect("ping line"),
    )
    .expect("ping json");
    assert_eq!(ping["id"], json!(2));

    let input = format!("fix the layout {IMAGE_MARKER}\ndata:image/png;base64,iVBORw0K");
    post_reply(service.callback_port(), json!({ "requestId": id, "userInput": input })).await;

    let result: Value = serde_json::from_str(
        &responses.next_line().await.expect("read").expect("result line"),
    )
    .expect("result json");
    assert_eq!(result["id"], json!(1));
    assert_eq!(result["result"]["isError"], json!(false));
    let content = result["result"]["content"].as_array().expect("content");
    assert_eq!(content.len(), 3);
    assert!(content[0]["text"]
        .as_str()
        .is_some_and(|text| text.contains("fix the layout")));
    assert_eq!(
        content[1],
        json!({ "type": "image", "data": "iVBORw0K", "mimeType": "image/png" })
    );
    ask.assert_hits(1);

    drop(client_in);
    serving.await.expect("task").expect("server exits at end of input");
}
