//! End-to-end tests over a real WebSocket client.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use relay_server::routing::TrustedVerifier;
use relay_server::{start, ServerConfig, ServerHandle};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Boot a test server and return the WS URL + handle.
async fn boot_server() -> (String, ServerHandle) {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0, // auto-assign
        ..Default::default()
    };
    let handle = start(config, Box::new(TrustedVerifier), None, Vec::new())
        .await
        .unwrap();
    let url = format!("ws://127.0.0.1:{}/ws", handle.port);
    (url, handle)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Read the next text frame as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read frames until one with the given event name arrives.
async fn read_until(ws: &mut WsStream, event: &str) -> Value {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "never received {event}"
        );
        let msg = read_json(ws).await;
        if msg["event"] == event {
            return msg;
        }
    }
}

async fn send(ws: &mut WsStream, event: Value) {
    ws.send(Message::text(event.to_string())).await.unwrap();
}

/// Register a visitor and return its conversation id.
async fn register_visitor(ws: &mut WsStream, user_id: &str) -> String {
    send(
        ws,
        json!({"event": "register", "data": {"role": "visitor", "userId": user_id}}),
    )
    .await;
    let registered = read_until(ws, "registered").await;
    registered["data"]["conversation"]["id"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn register_operator(ws: &mut WsStream, user_id: &str, name: &str) -> Value {
    send(
        ws,
        json!({
            "event": "register",
            "data": {"role": "operator", "userId": user_id, "userData": {"name": name}}
        }),
    )
    .await;
    read_until(ws, "registered").await
}

#[tokio::test]
async fn e2e_visitor_registration_creates_pending_conversation() {
    let (url, _handle) = boot_server().await;
    let mut ws = connect(&url).await;

    send(
        &mut ws,
        json!({"event": "register", "data": {"role": "visitor"}}),
    )
    .await;
    let registered = read_until(&mut ws, "registered").await;

    let data = &registered["data"];
    assert!(data["visitorId"].as_str().unwrap().starts_with("vis_"));
    assert_eq!(data["conversation"]["status"], "pending");
    assert!(data["conversation"]["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn e2e_full_chat_flow() {
    let (url, _handle) = boot_server().await;

    let mut op = connect(&url).await;
    let registered = register_operator(&mut op, "op_1", "Jo").await;
    assert_eq!(registered["data"]["operatorId"], "op_1");
    assert!(registered["data"]["pendingChats"].as_array().unwrap().is_empty());

    // Visitor arrives; the operator pool is told.
    let mut vis = connect(&url).await;
    let conversation_id = register_visitor(&mut vis, "vis_1").await;
    let chat_new = read_until(&mut op, "chat:new").await;
    assert_eq!(chat_new["data"]["conversationId"], conversation_id);

    // Pending message shows up as a summary refresh for operators.
    send(
        &mut vis,
        json!({
            "event": "message:send",
            "data": {"conversationId": conversation_id, "content": "hi, I need a refund"}
        }),
    )
    .await;
    let sent = read_until(&mut vis, "message:sent").await;
    assert_eq!(sent["data"]["status"], "sent");
    let update = read_until(&mut op, "chat:update").await;
    assert_eq!(update["data"]["lastMessage"]["preview"], "hi, I need a refund");

    // Accept: visitor sees the join, operator gets the transcript.
    send(
        &mut op,
        json!({"event": "chat:accept", "data": {"conversationId": conversation_id}}),
    )
    .await;
    let joined = read_until(&mut op, "chat:joined").await;
    assert_eq!(joined["data"]["conversation"]["status"], "active");
    assert_eq!(
        joined["data"]["conversation"]["messages"].as_array().unwrap().len(),
        2 // visitor message + system join message
    );
    let accepted = read_until(&mut vis, "chat:accepted").await;
    assert_eq!(accepted["data"]["operator"]["name"], "Jo");

    // Operator replies, visitor receives.
    send(
        &mut op,
        json!({
            "event": "message:send",
            "data": {"conversationId": conversation_id, "content": "sure, one moment"}
        }),
    )
    .await;
    let receive = read_until(&mut vis, "message:receive").await;
    assert_eq!(receive["data"]["message"]["content"]["text"], "sure, one moment");
    assert_eq!(receive["data"]["message"]["sender"]["role"], "operator");

    // Visitor replies, operator receives through the conversation group.
    send(
        &mut vis,
        json!({
            "event": "message:send",
            "data": {"conversationId": conversation_id, "content": "thanks!"}
        }),
    )
    .await;
    let receive = read_until(&mut op, "message:receive").await;
    assert_eq!(receive["data"]["message"]["content"]["text"], "thanks!");

    // Close, both sides hear about it.
    send(
        &mut op,
        json!({
            "event": "chat:close",
            "data": {"conversationId": conversation_id, "reason": "resolved"}
        }),
    )
    .await;
    let closed = read_until(&mut vis, "chat:closed").await;
    assert_eq!(closed["data"]["closedBy"], "operator");
    assert_eq!(closed["data"]["reason"], "resolved");
    let closed = read_until(&mut op, "chat:closed").await;
    assert_eq!(closed["data"]["conversationId"], conversation_id);
}

#[tokio::test]
async fn e2e_typing_indicator() {
    let (url, _handle) = boot_server().await;
    let mut op = connect(&url).await;
    register_operator(&mut op, "op_1", "Jo").await;
    let mut vis = connect(&url).await;
    let conversation_id = register_visitor(&mut vis, "vis_1").await;

    send(
        &mut op,
        json!({"event": "chat:accept", "data": {"conversationId": conversation_id}}),
    )
    .await;
    read_until(&mut vis, "chat:accepted").await;

    send(
        &mut vis,
        json!({
            "event": "message:typing",
            "data": {"conversationId": conversation_id, "isTyping": true}
        }),
    )
    .await;
    let typing = read_until(&mut op, "typing").await;
    assert_eq!(typing["data"]["userType"], "visitor");
    assert_eq!(typing["data"]["isTyping"], true);
}

#[tokio::test]
async fn e2e_operator_presence_announcements() {
    let (url, _handle) = boot_server().await;
    let mut op1 = connect(&url).await;
    register_operator(&mut op1, "op_1", "Jo").await;

    let mut op2 = connect(&url).await;
    let registered = register_operator(&mut op2, "op_2", "Sam").await;
    let online = registered["data"]["onlineOperators"].as_array().unwrap();
    assert_eq!(online.len(), 2);

    let announce = read_until(&mut op1, "operator:online").await;
    assert_eq!(announce["data"]["operator"]["id"], "op_2");

    send(
        &mut op2,
        json!({"event": "operator:status", "data": {"status": "away"}}),
    )
    .await;
    let change = read_until(&mut op1, "operator:statusChange").await;
    assert_eq!(change["data"]["status"], "away");

    drop(op2);
    let offline = read_until(&mut op1, "operator:offline").await;
    assert_eq!(offline["data"]["operatorId"], "op_2");
}

#[tokio::test]
async fn e2e_visitor_reconnect_restores_transcript() {
    let (url, _handle) = boot_server().await;
    let mut vis = connect(&url).await;
    let conversation_id = register_visitor(&mut vis, "vis_1").await;

    send(
        &mut vis,
        json!({
            "event": "message:send",
            "data": {"conversationId": conversation_id, "content": "remember me"}
        }),
    )
    .await;
    read_until(&mut vis, "message:sent").await;
    drop(vis);

    // Same token, new socket: same conversation, transcript intact.
    let mut vis = connect(&url).await;
    send(
        &mut vis,
        json!({"event": "register", "data": {"role": "visitor", "userId": "vis_1"}}),
    )
    .await;
    let registered = read_until(&mut vis, "registered").await;
    assert_eq!(registered["data"]["conversation"]["id"], conversation_id);
    let messages = registered["data"]["conversation"]["messages"].as_array().unwrap();
    assert_eq!(messages[0]["content"]["text"], "remember me");
}

#[tokio::test]
async fn e2e_invalid_payloads_get_error_events() {
    let (url, _handle) = boot_server().await;
    let mut ws = connect(&url).await;

    ws.send(Message::text("not json")).await.unwrap();
    let error = read_until(&mut ws, "error").await;
    assert_eq!(error["data"]["code"], "validation_error");

    send(&mut ws, json!({"event": "register", "data": {"role": "admin"}})).await;
    let error = read_until(&mut ws, "error").await;
    assert_eq!(error["data"]["code"], "invalid_role");

    // Acting before registering.
    send(
        &mut ws,
        json!({
            "event": "message:send",
            "data": {"conversationId": "conv_none", "content": "hi"}
        }),
    )
    .await;
    let error = read_until(&mut ws, "error").await;
    assert_eq!(error["data"]["code"], "unauthorized");
}

#[tokio::test]
async fn e2e_transfer_between_operators() {
    let (url, _handle) = boot_server().await;
    let mut op1 = connect(&url).await;
    register_operator(&mut op1, "op_1", "Jo").await;
    let mut op2 = connect(&url).await;
    register_operator(&mut op2, "op_2", "Sam").await;
    let mut vis = connect(&url).await;
    let conversation_id = register_visitor(&mut vis, "vis_1").await;

    send(
        &mut op1,
        json!({"event": "chat:accept", "data": {"conversationId": conversation_id}}),
    )
    .await;
    read_until(&mut op1, "chat:joined").await;

    send(
        &mut op1,
        json!({
            "event": "chat:transfer",
            "data": {"conversationId": conversation_id, "targetOperatorId": "op_2"}
        }),
    )
    .await;
    let transferred = read_until(&mut vis, "chat:transferred").await;
    assert_eq!(transferred["data"]["fromOperatorId"], "op_1");
    assert_eq!(transferred["data"]["toOperator"]["id"], "op_2");
    read_until(&mut op2, "chat:transferred").await;

    // The new operator can message the visitor.
    send(
        &mut op2,
        json!({
            "event": "message:send",
            "data": {"conversationId": conversation_id, "content": "taking over from Jo"}
        }),
    )
    .await;
    let receive = read_until(&mut vis, "message:receive").await;
    assert_eq!(receive["data"]["message"]["sender"]["id"], "op_2");
}

#[tokio::test]
async fn e2e_read_receipts() {
    let (url, _handle) = boot_server().await;
    let mut op = connect(&url).await;
    register_operator(&mut op, "op_1", "Jo").await;
    let mut vis = connect(&url).await;
    let conversation_id = register_visitor(&mut vis, "vis_1").await;

    send(
        &mut op,
        json!({"event": "chat:accept", "data": {"conversationId": conversation_id}}),
    )
    .await;
    read_until(&mut vis, "chat:accepted").await;

    send(
        &mut vis,
        json!({
            "event": "message:send",
            "data": {"conversationId": conversation_id, "content": "did you see this?"}
        }),
    )
    .await;
    let receive = read_until(&mut op, "message:receive").await;
    let message_id = receive["data"]["message"]["id"].as_str().unwrap().to_string();

    send(
        &mut op,
        json!({
            "event": "message:read",
            "data": {"conversationId": conversation_id, "messageIds": [message_id]}
        }),
    )
    .await;
    let status = read_until(&mut vis, "message:status").await;
    assert_eq!(status["data"]["status"], "read");
    assert_eq!(status["data"]["messageIds"][0], message_id);
    assert!(status["data"]["readAt"].is_string());
}
