mod common;

use common::{ws_proto, RawClient};
use serde_json::Value;

#[tokio::test]
async fn rpc_call_round_trip() {
    let harness = common::start_server().await;
    let mut client = RawClient::connect(harness.addr, "reconnectionToken=tok-rpc").await;
    let reply = client.handshake(1, "abc123", Value::Null).await;
    assert_eq!(reply["type"], "ok");

    client
        .send_regular(
            1,
            serde_json::json!({
                "type": "promise",
                "id": 1,
                "channel": "logLevel",
                "name": "getLevel",
                "args": null,
            })
            .to_string()
            .as_bytes(),
        )
        .await;

    let (_, response) = client.expect_regular().await;
    assert_eq!(response["type"], "replyOk");
    assert_eq!(response["id"], 1);
    assert!(response["data"].is_u64());
}

#[tokio::test]
async fn unknown_channel_replies_err() {
    let harness = common::start_server().await;
    let mut client = RawClient::connect(harness.addr, "reconnectionToken=tok-badchan").await;
    client.handshake(1, "abc123", Value::Null).await;

    client
        .send_regular(
            1,
            serde_json::json!({
                "type": "promise",
                "id": 9,
                "channel": "no-such-channel",
                "name": "x",
                "args": null,
            })
            .to_string()
            .as_bytes(),
        )
        .await;
    let (_, response) = client.expect_regular().await;
    assert_eq!(response["type"], "replyErr");
    assert_eq!(response["id"], 9);
}

#[tokio::test]
async fn reconnect_replays_unacked_output() {
    let harness = common::start_server().await;

    // First connection makes an RPC call and reads, but never acks, the
    // reply.
    let mut first = RawClient::connect(harness.addr, "reconnectionToken=tok-resume").await;
    first.handshake(1, "abc123", Value::Null).await;
    first
        .send_regular(
            1,
            serde_json::json!({
                "type": "promise",
                "id": 1,
                "channel": "logLevel",
                "name": "getLevel",
                "args": null,
            })
            .to_string()
            .as_bytes(),
        )
        .await;
    let (reply_id, response) = first.expect_regular().await;
    assert_eq!(response["type"], "replyOk");

    // Drop the socket; the session must survive.
    first.shutdown().await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(harness.state.management.lookup("tok-resume").is_some());

    // Reconnect: after the handshake the server sends ok and replays the
    // unacked reply with its original sequence id.
    let mut second =
        RawClient::connect(harness.addr, "reconnectionToken=tok-resume&reconnection=true").await;
    let reply = second.handshake(1, "abc123", Value::Null).await;
    assert_eq!(reply["type"], "ok");

    let (replayed_id, replayed) = second.expect_regular().await;
    assert_eq!(replayed_id, reply_id, "replay keeps the sequence id");
    assert_eq!(replayed["type"], "replyOk");
    assert_eq!(replayed["id"], 1);
}

#[tokio::test]
async fn disconnect_disposes_the_session() {
    let harness = common::start_server().await;
    let mut client = RawClient::connect(harness.addr, "reconnectionToken=tok-bye").await;
    client.handshake(1, "abc123", Value::Null).await;
    client.send_disconnect().await;

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(
        harness.state.management.lookup("tok-bye").is_none(),
        "session entry dropped after disconnect"
    );

    // A reconnect attempt now fails with the unknown-token reason.
    let mut retry =
        RawClient::connect(harness.addr, "reconnectionToken=tok-bye&reconnection=true").await;
    let reply = retry.handshake(1, "abc123", Value::Null).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(
        reply["reason"],
        "Asking to reconnect but provided token is unknown"
    );
}

#[tokio::test]
async fn environment_data_over_websocket_frames() {
    let harness = common::start_server().await;
    let mut ws = common::ws_connect(harness.addr, "reconnectionToken=tok-ws-env").await;

    let reply = ws_proto::handshake(&mut ws, 1, Value::Null).await;
    assert_eq!(reply["type"], "ok");

    ws_proto::send(
        &mut ws,
        workbench_gateway::protocol::persistent::kinds::REGULAR,
        1,
        serde_json::json!({
            "type": "promise",
            "id": 1,
            "channel": "remoteextensionsenvironment",
            "name": "getEnvironmentData",
            "args": null,
        })
        .to_string()
        .as_bytes(),
    )
    .await;

    let (_, response) = ws_proto::expect_regular(&mut ws).await;
    assert_eq!(response["type"], "replyOk");
    let data = &response["data"];
    assert_eq!(data["pid"], std::process::id());
    assert!(data["connectionToken"]
        .as_str()
        .unwrap()
        .starts_with("conn_"));
    assert_eq!(data["appRoot"]["scheme"], "vscode-remote");
    assert_eq!(data["useHostProxy"], false);
}

#[tokio::test]
async fn filesystem_channel_reads_files_remotely() {
    let harness = common::start_server().await;
    let target = harness.app_root.path().join("fs-probe.txt");
    std::fs::write(&target, b"channel payload").expect("write probe");

    let mut client = RawClient::connect(harness.addr, "reconnectionToken=tok-fs").await;
    client.handshake(1, "abc123", Value::Null).await;

    // The client addresses the file through its vscode-remote URI.
    let resource = serde_json::json!({
        "scheme": "vscode-remote",
        "authority": "localhost",
        "path": target.to_string_lossy(),
    });
    client
        .send_regular(
            1,
            serde_json::json!({
                "type": "promise",
                "id": 4,
                "channel": "remotefilesystem",
                "name": "readFile",
                "args": { "resource": resource },
            })
            .to_string()
            .as_bytes(),
        )
        .await;

    let (_, response) = client.expect_regular().await;
    assert_eq!(response["type"], "replyOk");
    let decoded = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(response["data"]["data"].as_str().unwrap())
            .unwrap()
    };
    assert_eq!(decoded, b"channel payload");
}
