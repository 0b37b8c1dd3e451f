//! Gateway authentication over a real socket: close-code discipline and
//! credential revocation semantics.

mod common;

use common::{harness, harness_with, Harness};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

use foreman_protocol::{AuthRequest, Frame, HeartbeatPong, Message};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_gateway(h: &Harness) -> String {
    let app = h.services.app();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("ws://{addr}/api/v1/agents/ws")
}

async fn connect(url: &str) -> WsStream {
    let (socket, _) = connect_async(url).await.expect("gateway unreachable");
    socket
}

fn auth_frame(agent_id: &str, api_key: &str) -> WsMessage {
    let frame = Frame::new(&Message::AuthRequest(AuthRequest {
        agent_id: agent_id.into(),
        api_key: api_key.into(),
        version: "test".into(),
    }))
    .unwrap();
    WsMessage::Text(frame.encode().unwrap().into())
}

/// Read frames until the server closes; returns (messages, close code).
async fn read_until_close(socket: &mut WsStream) -> (Vec<Message>, Option<u16>) {
    let mut messages = Vec::new();
    let deadline = std::time::Duration::from_secs(5);
    loop {
        let next = tokio::time::timeout(deadline, socket.next()).await;
        match next {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                if let Ok(inbound) = Frame::decode(text.as_str()) {
                    messages.push(inbound.message);
                }
            }
            Ok(Some(Ok(WsMessage::Close(frame)))) => {
                return (messages, frame.map(|f| u16::from(f.code)));
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) => return (messages, None),
            Err(_) => panic!("server neither replied nor closed in time"),
        }
    }
}

#[tokio::test]
async fn test_pre_auth_message_closes_with_4002() {
    let h = harness().await;
    let url = spawn_gateway(&h).await;
    let mut socket = connect(&url).await;

    let pong = Frame::new(&Message::HeartbeatPong(HeartbeatPong {
        agent_id: "w1".into(),
        server_time: 0,
        active_tasks: vec![],
        cpu_usage: 1.0,
        memory_usage: 1.0,
    }))
    .unwrap();
    socket
        .send(WsMessage::Text(pong.encode().unwrap().into()))
        .await
        .unwrap();

    let (_, code) = read_until_close(&mut socket).await;
    assert_eq!(code, Some(4002));
}

#[tokio::test]
async fn test_malformed_auth_closes_with_4003() {
    let h = harness().await;
    let url = spawn_gateway(&h).await;
    let mut socket = connect(&url).await;

    // auth_request with a missing apiKey field fails schema validation
    let broken = r#"{"id":"m1","type":"auth_request","payload":{"agentId":"w1"},"timestamp":0}"#;
    socket
        .send(WsMessage::Text(broken.to_string().into()))
        .await
        .unwrap();

    let (_, code) = read_until_close(&mut socket).await;
    assert_eq!(code, Some(4003));
}

#[tokio::test]
async fn test_invalid_credential_gets_response_then_4004() {
    let h = harness().await;
    let url = spawn_gateway(&h).await;
    let mut socket = connect(&url).await;

    socket.send(auth_frame("w1", "fmk-wrong")).await.unwrap();
    let (messages, code) = read_until_close(&mut socket).await;

    assert_eq!(code, Some(4004));
    match messages.first() {
        Some(Message::AuthResponse(response)) => {
            assert!(!response.success);
            assert!(response.error.is_some());
        }
        other => panic!("expected auth response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_agent_id_mismatch_is_rejected() {
    let h = harness().await;
    let url = spawn_gateway(&h).await;
    let mut socket = connect(&url).await;

    // valid key, wrong asserted identity
    socket.send(auth_frame("w2", "fmk-w1")).await.unwrap();
    let (messages, code) = read_until_close(&mut socket).await;
    assert_eq!(code, Some(4004));
    assert!(matches!(
        messages.first(),
        Some(Message::AuthResponse(r)) if !r.success
    ));
}

#[tokio::test]
async fn test_auth_timeout_closes_with_4001() {
    let h = harness_with(|config| config.dispatch.auth_timeout_ms = 200).await;
    let url = spawn_gateway(&h).await;
    let mut socket = connect(&url).await;

    // send nothing inside the window
    let (_, code) = read_until_close(&mut socket).await;
    assert_eq!(code, Some(4001));
}

#[tokio::test]
async fn test_revocation_blocks_new_connections_not_open_ones() {
    let h = harness().await;
    let url = spawn_gateway(&h).await;

    // w1 authenticates successfully
    let mut socket = connect(&url).await;
    socket.send(auth_frame("w1", "fmk-w1")).await.unwrap();
    let response = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match response {
        WsMessage::Text(text) => {
            let inbound = Frame::decode(text.as_str()).unwrap();
            assert!(matches!(
                inbound.message,
                Message::AuthResponse(r) if r.success
            ));
        }
        other => panic!("expected auth response, got {other:?}"),
    }
    // give the registry a beat to record the registration
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.services.registry.is_online("w1"));

    // an admin revokes the key
    h.services.storage.api_keys.revoke("fmk-w1").await.unwrap();

    // new connections with the key are rejected
    let mut second = connect(&url).await;
    second.send(auth_frame("w1", "fmk-w1")).await.unwrap();
    let (messages, code) = read_until_close(&mut second).await;
    assert_eq!(code, Some(4004));
    match messages.first() {
        Some(Message::AuthResponse(response)) => {
            assert_eq!(response.error.as_deref(), Some("revoked"));
        }
        other => panic!("expected auth response, got {other:?}"),
    }

    // revocation alone does not force-close the open connection
    assert!(h.services.registry.is_online("w1"));
}
