mod common;

const KEY_HEADER: &str = "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n";

#[tokio::test]
async fn upgrade_computes_accept_key() {
    let harness = common::start_server().await;
    let head = common::upgrade_response_head(
        harness.addr,
        "/?reconnectionToken=ws-accept",
        KEY_HEADER,
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 101"), "got: {head}");
    // SHA1-derived accept value for the RFC sample key.
    assert!(
        head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
        "got: {head}"
    );
}

#[tokio::test]
async fn deflate_offer_is_echoed_with_normalized_window_bits() {
    let harness = common::start_server().await;
    let head = common::upgrade_response_head(
        harness.addr,
        "/?reconnectionToken=ws-deflate",
        &format!(
            "{KEY_HEADER}Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n"
        ),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 101"), "got: {head}");
    assert!(
        head.contains("Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits=15"),
        "got: {head}"
    );
}

#[tokio::test]
async fn explicit_deflate_parameters_are_accepted_as_offered() {
    let harness = common::start_server().await;
    let head = common::upgrade_response_head(
        harness.addr,
        "/?reconnectionToken=ws-deflate-2",
        &format!(
            "{KEY_HEADER}Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=12\r\n"
        ),
    )
    .await;
    assert!(
        head.contains("Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=12"),
        "got: {head}"
    );
}

#[tokio::test]
async fn no_offer_means_no_extension_header() {
    let harness = common::start_server().await;
    let head = common::upgrade_response_head(
        harness.addr,
        "/?reconnectionToken=ws-plain",
        KEY_HEADER,
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 101"), "got: {head}");
    assert!(!head.contains("Sec-WebSocket-Extensions"), "got: {head}");
}

#[tokio::test]
async fn malformed_key_is_rejected() {
    let harness = common::start_server().await;
    let head = common::upgrade_response_head(
        harness.addr,
        "/?reconnectionToken=ws-badkey",
        "Sec-WebSocket-Key: not-base64!!\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 400"), "got: {head}");
}
