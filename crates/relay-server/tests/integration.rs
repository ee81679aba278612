//! End-to-end tests against a running relay using real WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use relay_server::notify::LogNotifier;
use relay_server::{start, ServerHandle, ServerSettings};
use relay_store::Database;

const TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(300);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn boot_server() -> ServerHandle {
    let settings = ServerSettings {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerSettings::default()
    };
    let db = Database::in_memory().unwrap();
    start(&settings, db, Arc::new(LogNotifier), None).await.unwrap()
}

async fn connect(handle: &ServerHandle) -> WsStream {
    let url = format!("ws://127.0.0.1:{}/ws", handle.port);
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

fn http(handle: &ServerHandle, path: &str) -> String {
    format!("http://127.0.0.1:{}{path}", handle.port)
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
async fn recv(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Assert no text frame arrives within a short window.
async fn assert_silent(ws: &mut WsStream) {
    let deadline = tokio::time::Instant::now() + SILENCE;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {}", text.as_str()),
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("connection ended: {other:?}"),
        }
    }
}

async fn get_json(url: &str) -> (u16, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    let body = resp.json().await.unwrap_or(Value::Null);
    (status, body)
}

async fn wait_for_connections(handle: &ServerHandle, n: usize) {
    timeout(TIMEOUT, async {
        while handle.connection_count() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never settled");
}

/// Visitor opens a chat and returns (visitor socket, session id).
async fn open_chat(handle: &ServerHandle) -> (WsStream, String) {
    let mut visitor = connect(handle).await;
    send(
        &mut visitor,
        json!({"type": "init", "userName": "Ana", "userEmail": "ana@x.com", "content": "Hi"}),
    )
    .await;
    let created = recv(&mut visitor).await;
    assert_eq!(created["type"], "session_created");
    let session_id = created["sessionId"].as_str().unwrap().to_string();
    (visitor, session_id)
}

#[tokio::test]
async fn full_chat_lifecycle() {
    let handle = boot_server().await;

    // Visitor opens a chat.
    let (mut visitor, session_id) = open_chat(&handle).await;
    let (_, session) = get_json(&http(&handle, &format!("/chat/sessions/{session_id}"))).await;
    assert_eq!(session["status"], "waiting");
    assert_eq!(session["userName"], "Ana");
    assert_eq!(session["messages"].as_array().unwrap().len(), 1);

    // Bystander never hears anything about the session.
    let mut bystander = connect(&handle).await;

    // Operator joins; both parties are told.
    let mut operator = connect(&handle).await;
    send(&mut operator, json!({"type": "join", "sessionId": session_id})).await;
    for ws in [&mut operator, &mut visitor] {
        let joined = recv(ws).await;
        assert_eq!(joined["type"], "admin_joined");
        assert_eq!(joined["sessionId"], session_id.as_str());
    }
    let (_, session) = get_json(&http(&handle, &format!("/chat/sessions/{session_id}"))).await;
    assert_eq!(session["status"], "active");

    // Visitor's message reaches the operator only.
    send(
        &mut visitor,
        json!({"type": "message", "sessionId": session_id, "content": "Still there?", "sender": "user"}),
    )
    .await;
    let relayed = recv(&mut operator).await;
    assert_eq!(relayed["type"], "message");
    assert_eq!(relayed["content"], "Still there?");
    assert_eq!(relayed["sender"], "user");
    assert_silent(&mut visitor).await;

    // Operator reply reaches the visitor only.
    send(
        &mut operator,
        json!({"type": "message", "sessionId": session_id, "content": "Yes!", "sender": "admin"}),
    )
    .await;
    let reply = recv(&mut visitor).await;
    assert_eq!(reply["content"], "Yes!");
    assert_eq!(reply["sender"], "admin");
    assert_silent(&mut operator).await;

    // Operator ends the chat; both parties are told.
    send(&mut operator, json!({"type": "end", "sessionId": session_id})).await;
    for ws in [&mut operator, &mut visitor] {
        let ended = recv(ws).await;
        assert_eq!(ended["type"], "session_ended");
        assert_eq!(ended["sessionId"], session_id.as_str());
    }

    let (_, session) = get_json(&http(&handle, &format!("/chat/sessions/{session_id}"))).await;
    assert_eq!(session["status"], "ended");
    assert!(session["endedAt"].is_string());
    assert_eq!(session["messages"].as_array().unwrap().len(), 3);

    assert_silent(&mut bystander).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn spoofed_sender_uses_connection_role() {
    let handle = boot_server().await;
    let (mut visitor, session_id) = open_chat(&handle).await;

    let mut operator = connect(&handle).await;
    send(&mut operator, json!({"type": "join", "sessionId": session_id})).await;
    recv(&mut operator).await;
    recv(&mut visitor).await;

    send(
        &mut visitor,
        json!({"type": "message", "sessionId": session_id, "content": "I'm staff", "sender": "admin"}),
    )
    .await;
    let relayed = recv(&mut operator).await;
    assert_eq!(relayed["sender"], "user");
    handle.shutdown().await;
}

#[tokio::test]
async fn messages_after_end_are_dropped() {
    let handle = boot_server().await;
    let (mut visitor, session_id) = open_chat(&handle).await;

    let mut operator = connect(&handle).await;
    send(&mut operator, json!({"type": "join", "sessionId": session_id})).await;
    recv(&mut operator).await;
    recv(&mut visitor).await;

    send(&mut visitor, json!({"type": "end", "sessionId": session_id})).await;
    recv(&mut operator).await;
    recv(&mut visitor).await;

    send(&mut visitor, json!({"type": "message", "content": "hello?"})).await;
    assert_silent(&mut operator).await;

    let (_, session) = get_json(&http(&handle, &format!("/chat/sessions/{session_id}"))).await;
    assert_eq!(session["messages"].as_array().unwrap().len(), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_keep_connection_open() {
    let handle = boot_server().await;
    let mut ws = connect(&handle).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    send(&mut ws, json!({"type": "typing"})).await;
    send(&mut ws, json!({"type": "message", "content": "unbound"})).await;
    assert_silent(&mut ws).await;

    // Still usable afterwards.
    send(&mut ws, json!({"type": "init", "userName": "Bo", "userEmail": "bo@x.com"})).await;
    assert_eq!(recv(&mut ws).await["type"], "session_created");
    handle.shutdown().await;
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let handle = boot_server().await;
    let mut ws = connect(&handle).await;
    wait_for_connections(&handle, 1).await;

    let content = "x".repeat(600);
    send(&mut ws, json!({"type": "message", "content": content})).await;

    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server did not close the connection");
    wait_for_connections(&handle, 0).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn disconnect_unregisters_connection() {
    let handle = boot_server().await;
    let mut a = connect(&handle).await;
    let _b = connect(&handle).await;
    wait_for_connections(&handle, 2).await;

    a.close(None).await.unwrap();
    wait_for_connections(&handle, 1).await;

    let (status, body) = get_json(&http(&handle, "/health")).await;
    assert_eq!(status, 200);
    assert_eq!(body["connections"], 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn session_history_endpoints() {
    let handle = boot_server().await;
    let (_visitor, session_id) = open_chat(&handle).await;

    let (status, sessions) = get_json(&http(&handle, "/chat/sessions")).await;
    assert_eq!(status, 200);
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], session_id.as_str());
    assert_eq!(sessions[0]["messages"][0]["content"], "Hi");
    assert_eq!(sessions[0]["messages"][0]["sender"], "user");

    let resp = reqwest::get(http(&handle, "/chat/sessions/sess_missing")).await.unwrap();
    assert_eq!(resp.status(), 404);
    handle.shutdown().await;
}

#[tokio::test]
async fn contact_form_round_trip() {
    let handle = boot_server().await;
    let client = reqwest::Client::new();
    let url = http(&handle, "/chatbot");

    let resp = client
        .post(&url)
        .json(&json!({"name": "Ana", "email": "ana@x.com", "query": "Do you ship?"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], relay_server::api::CONTACT_ACK);

    let resp = client
        .post(&url)
        .json(&json!({"name": "Ana", "email": "nope", "query": "?"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.text().await.unwrap(), "Invalid email format");

    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let (status, queries) = get_json(&http(&handle, "/queries")).await;
    assert_eq!(status, 200);
    let queries = queries.as_array().unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0]["query"], "Do you ship?");
    handle.shutdown().await;
}
