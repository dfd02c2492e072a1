//! Integration tests driving a gateway session against a loopback
//! websocket server.
//!
//! Each test binds an ephemeral listener, points `open_url` at it, and
//! plays the server side of the protocol by hand: send a configuration
//! frame, observe the handshake, then exercise reconnect paths.

use std::sync::Once;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use corvid_gateway::{open_url, Frame, GatewayConfig, Intents, Opcode};

type ServerSocket = WebSocketStream<TcpStream>;

const STEP: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

fn init_tracing() {
    static TRACING: Once = Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

async fn bind() -> (TcpListener, String) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = timeout(STEP, listener.accept())
        .await
        .expect("client should connect")
        .unwrap();
    accept_async(stream).await.unwrap()
}

async fn send_json(server: &mut ServerSocket, frame: Value) {
    server.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next protocol frame from the client, skipping transport-level messages.
async fn next_frame(server: &mut ServerSocket) -> Frame {
    loop {
        let message = timeout(STEP, server.next())
            .await
            .expect("client should send a frame")
            .expect("connection should stay open")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn hello(server: &mut ServerSocket, heartbeat_interval: u64) {
    send_json(
        server,
        json!({ "op": 10, "d": { "heartbeat_interval": heartbeat_interval } }),
    )
    .await;
}

fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::new("token-under-test");
    config.intents = Some(Intents::GUILDS | Intents::MESSAGES);
    config.invalid_session_delay = Duration::from_millis(50);
    config
}

// ----------------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------------

#[tokio::test]
async fn hello_triggers_identify_on_a_fresh_session() {
    let (listener, url) = bind().await;
    let _gateway = open_url(&url, test_config()).unwrap();

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;

    let identify = next_frame(&mut server).await;
    assert_eq!(identify.op, Opcode::Identify);
    assert_eq!(identify.d["token"], json!("Bot token-under-test"));
    assert_eq!(
        identify.d["intents"],
        json!((Intents::GUILDS | Intents::MESSAGES).bits())
    );
    assert_eq!(identify.d["properties"]["$browser"], json!("corvid"));
}

// ----------------------------------------------------------------------------
// Dispatch and Resume
// ----------------------------------------------------------------------------

#[tokio::test]
async fn dispatch_publishes_events_and_reconnect_resumes() {
    let (listener, url) = bind().await;
    let gateway = open_url(&url, test_config()).unwrap();

    let (event_tx, mut events) = mpsc::unbounded_channel::<String>();
    {
        let tx = event_tx.clone();
        gateway.on("message_create", move |d| {
            let _ = tx.send(format!("named:{}", d["content"].as_str().unwrap()));
        });
    }
    gateway.on_any(move |name, _| {
        let _ = event_tx.send(format!("any:{name}"));
    });

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    assert_eq!(next_frame(&mut server).await.op, Opcode::Identify);

    send_json(
        &mut server,
        json!({ "op": 0, "t": "READY", "s": 1, "d": { "session_id": "sess-1" } }),
    )
    .await;
    send_json(
        &mut server,
        json!({ "op": 0, "t": "MESSAGE_CREATE", "s": 5, "d": { "content": "hi" } }),
    )
    .await;

    // Named handler first, then the wildcard with the event name attached.
    for expected in ["any:ready", "named:hi", "any:message_create"] {
        let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
        assert_eq!(event, expected);
    }

    // The server asks for a reconnect; the client must resume with the
    // session id and sequence it captured above.
    send_json(&mut server, json!({ "op": 7, "d": null })).await;

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    let resume = next_frame(&mut server).await;
    assert_eq!(resume.op, Opcode::Resume);
    assert_eq!(resume.d["token"], json!("Bot token-under-test"));
    assert_eq!(resume.d["session_id"], json!("sess-1"));
    assert_eq!(resume.d["seq"], json!(5));

    gateway.close();
}

#[tokio::test]
async fn invalid_session_without_resume_forces_fresh_identify() {
    let (listener, url) = bind().await;
    let gateway = open_url(&url, test_config()).unwrap();

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    assert_eq!(next_frame(&mut server).await.op, Opcode::Identify);
    send_json(
        &mut server,
        json!({ "op": 0, "t": "READY", "s": 1, "d": { "session_id": "sess-2" } }),
    )
    .await;

    // Non-resumable invalidation: state must be discarded.
    send_json(&mut server, json!({ "op": 9, "d": false })).await;

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    let handshake = next_frame(&mut server).await;
    assert_eq!(handshake.op, Opcode::Identify);

    gateway.close();
}

#[tokio::test]
async fn invalid_session_with_resume_flag_resumes() {
    let (listener, url) = bind().await;
    let gateway = open_url(&url, test_config()).unwrap();

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    assert_eq!(next_frame(&mut server).await.op, Opcode::Identify);
    send_json(
        &mut server,
        json!({ "op": 0, "t": "READY", "s": 3, "d": { "session_id": "sess-3" } }),
    )
    .await;

    send_json(&mut server, json!({ "op": 9, "d": true })).await;

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    let handshake = next_frame(&mut server).await;
    assert_eq!(handshake.op, Opcode::Resume);
    assert_eq!(handshake.d["session_id"], json!("sess-3"));

    gateway.close();
}

// ----------------------------------------------------------------------------
// Heartbeating
// ----------------------------------------------------------------------------

#[tokio::test]
async fn missed_heartbeat_ack_reconnects_with_resume() {
    let (listener, url) = bind().await;
    let gateway = open_url(&url, test_config()).unwrap();

    let mut server = accept(&listener).await;
    hello(&mut server, 50).await;
    assert_eq!(next_frame(&mut server).await.op, Opcode::Identify);
    send_json(
        &mut server,
        json!({ "op": 0, "t": "READY", "s": 3, "d": { "session_id": "sess-9" } }),
    )
    .await;

    // First tick sends a beat carrying the current sequence; the server
    // never acks it, so the second tick abandons the connection.
    let beat = next_frame(&mut server).await;
    assert_eq!(beat.op, Opcode::Heartbeat);
    assert_eq!(beat.d, json!(3));

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    let resume = next_frame(&mut server).await;
    assert_eq!(resume.op, Opcode::Resume);
    assert_eq!(resume.d["session_id"], json!("sess-9"));
    assert_eq!(resume.d["seq"], json!(3));

    gateway.close();
}

#[tokio::test]
async fn acked_heartbeats_keep_the_connection_alive() {
    let (listener, url) = bind().await;
    let gateway = open_url(&url, test_config()).unwrap();

    let mut server = accept(&listener).await;
    hello(&mut server, 50).await;
    assert_eq!(next_frame(&mut server).await.op, Opcode::Identify);

    // Ack every beat; as long as acks flow, no reconnect may happen.
    let acker = tokio::spawn(async move {
        while let Some(Ok(message)) = server.next().await {
            if let Message::Text(text) = message {
                let frame: Frame = serde_json::from_str(&text).unwrap();
                if frame.op == Opcode::Heartbeat {
                    server
                        .send(Message::Text(json!({ "op": 11, "d": null }).to_string()))
                        .await
                        .unwrap();
                }
            }
        }
    });

    assert!(timeout(Duration::from_millis(300), listener.accept())
        .await
        .is_err());

    gateway.close();
    acker.abort();
}

#[tokio::test]
async fn server_heartbeat_request_is_answered_immediately() {
    let (listener, url) = bind().await;
    let gateway = open_url(&url, test_config()).unwrap();

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    assert_eq!(next_frame(&mut server).await.op, Opcode::Identify);
    send_json(
        &mut server,
        json!({ "op": 0, "t": "READY", "s": 8, "d": { "session_id": "sess-4" } }),
    )
    .await;

    send_json(&mut server, json!({ "op": 1, "d": null })).await;
    let beat = next_frame(&mut server).await;
    assert_eq!(beat.op, Opcode::Heartbeat);
    assert_eq!(beat.d, json!(8));

    gateway.close();
}

// ----------------------------------------------------------------------------
// Outbound Control and Termination
// ----------------------------------------------------------------------------

#[tokio::test]
async fn control_requests_become_outbound_frames() {
    let (listener, url) = bind().await;
    let gateway = open_url(&url, test_config()).unwrap();

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    assert_eq!(next_frame(&mut server).await.op, Opcode::Identify);

    gateway.update_status(corvid_gateway::StatusUpdate {
        since: None,
        game: None,
        status: "idle".to_string(),
        afk: true,
    });
    let frame = next_frame(&mut server).await;
    assert_eq!(frame.op, Opcode::PresenceUpdate);
    assert_eq!(frame.d["status"], json!("idle"));
    assert_eq!(frame.d["afk"], json!(true));

    gateway.request_members(corvid_gateway::MemberRequest {
        guild_id: "g7".to_string(),
        query: Some(String::new()),
        limit: 0,
        presences: None,
        user_ids: None,
        nonce: None,
    });
    let frame = next_frame(&mut server).await;
    assert_eq!(frame.op, Opcode::RequestGuildMembers);
    assert_eq!(frame.d["guild_id"], json!("g7"));

    gateway.close();
}

#[tokio::test]
async fn close_terminates_without_reconnecting() {
    let (listener, url) = bind().await;
    let gateway = open_url(&url, test_config()).unwrap();

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    assert_eq!(next_frame(&mut server).await.op, Opcode::Identify);

    gateway.close();

    // The client closes the transport and never dials back.
    let mut saw_close = false;
    while let Ok(Some(Ok(message))) = timeout(STEP, server.next()).await {
        if matches!(message, Message::Close(_)) {
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);
    assert!(timeout(Duration::from_millis(200), listener.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn remote_close_publishes_disconnect_and_stops() {
    let (listener, url) = bind().await;
    let gateway = open_url(&url, test_config()).unwrap();

    let (tx, mut disconnects) = mpsc::unbounded_channel::<()>();
    gateway.on("disconnect", move |_| {
        let _ = tx.send(());
    });

    let mut server = accept(&listener).await;
    hello(&mut server, 60_000).await;
    assert_eq!(next_frame(&mut server).await.op, Opcode::Identify);

    server.close(None).await.unwrap();

    timeout(STEP, disconnects.recv())
        .await
        .expect("disconnect should be published")
        .unwrap();
    assert!(timeout(Duration::from_millis(200), listener.accept())
        .await
        .is_err());
}
