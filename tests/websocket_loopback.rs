//! Drives the tokio client against a minimal in-process chat server

use futures::{SinkExt, StreamExt};
use ratchat_sync::crypto::encrypt_text;
use ratchat_sync::{ConnectionState, SessionConfig, StaticKeys, SymmetricKey, SyncClient, SyncEvent};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn key(user: &str) -> SymmetricKey {
    SymmetricKey::from_passphrase(&format!("{}'s passphrase", user))
}

/// Answers the handshake, pings and chat messages of a single client
async fn serve(listener: TcpListener) -> Vec<String> {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let mut seen = Vec::new();

    let history_entry = json!({
        "sender": "bob",
        "message": encrypt_text(&key("bob"), "from history").unwrap(),
        "isEncrypted": true,
        "timestamp": "2024-05-01T09:00:00.000Z",
        "chatroom": "general",
    });

    while let Some(Ok(msg)) = ws.next().await {
        let text = match msg {
            Message::Text(text) => text.as_str().to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let v: Value = serde_json::from_str(&text).unwrap();
        let kind = v["type"].as_str().map(str::to_string);
        seen.push(kind.clone().unwrap_or_else(|| "untyped".to_string()));

        let reply = match kind.as_deref() {
            Some("fetch_history") => Some(json!({
                "type": "chatroom_history",
                "history": [history_entry.to_string()],
            })),
            Some("get_online_users") => Some(json!({"type": "online_users", "users": ["alice", "bob"]})),
            Some("get_channels") => Some(json!({"type": "channel_list", "channels": [{"name": "general"}]})),
            Some("ping") => Some(json!({"type": "pong"})),
            None if v.get("message").is_some() => {
                let mut echo = v.clone();
                echo["sender"] = "alice".into();
                Some(echo)
            }
            _ => None,
        };
        if let Some(reply) = reply {
            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
        }
    }
    seen
}

async fn wait_for(client: &mut SyncClient, what: impl Fn(&SyncEvent) -> bool) {
    loop {
        match client.next_event().await {
            Some(event) if what(&event) => return,
            Some(_) => continue,
            None => panic!("client stopped early"),
        }
    }
}

#[tokio::test]
async fn test_client_round_trip_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve(listener));

    let config = SessionConfig::new("alice", key("alice")).with_server_url(format!("ws://{}", addr));
    let mut client = SyncClient::start(config, StaticKeys::new().with("bob", key("bob")));

    let scenario = async {
        wait_for(&mut client, |e| {
            matches!(e, SyncEvent::StateChanged(ConnectionState::Ready))
        })
        .await;

        // Bob's key arrives through the resolver after the debounce window
        wait_for(&mut client, |e| {
            matches!(e, SyncEvent::MessageUpdated { message, .. }
                if message.message.as_deref() == Some("from history"))
        })
        .await;

        client.send_message("hi bob").unwrap();
        wait_for(&mut client, |e| {
            matches!(e, SyncEvent::MessageAdded { message, .. }
                if message.message.as_deref() == Some("hi bob") && !message.is_encrypted)
        })
        .await;
    };
    tokio::time::timeout(Duration::from_secs(10), scenario)
        .await
        .expect("scenario timed out");

    client.shutdown().await.unwrap();
    let seen = server.await.unwrap();
    assert_eq!(
        &seen[..4],
        &["untyped", "fetch_history", "get_online_users", "get_channels"]
    );
    assert!(seen.iter().filter(|s| *s == "untyped").count() >= 2);
}

#[tokio::test]
async fn test_unreachable_server_reports_reconnects() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = SessionConfig::new("alice", key("alice")).with_server_url(format!("ws://{}", addr));
    let mut client = SyncClient::start(config, StaticKeys::new());

    tokio::time::timeout(
        Duration::from_secs(5),
        wait_for(&mut client, |e| matches!(e, SyncEvent::Reconnecting { attempt: 1, .. })),
    )
    .await
    .expect("no reconnect scheduled");

    client.shutdown().await.unwrap();
}
