//! Wire protocol: JSON text frames over the WebSocket.
//!
//! Client → server frames are built from [`ClientFrame`]; server → client
//! frames are classified by [`ServerFrame::parse`]. Chat messages and the
//! join frame carry no `type` field, so classification falls back on shape.

use crate::error::{Result, SyncError};
use crate::types::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One file chunk frame (`upload_file_chunk` outbound, `file_chunk` inbound)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrame {
    pub file_id: String,
    pub file_name: String,
    /// Payload bytes (JSON array of numbers, as the server expects)
    pub chunk: Vec<u8>,
    /// Byte offset of this chunk in the raw file
    pub offset: u64,
    pub is_last_chunk: bool,
    pub total_size: u64,
    /// Hex SHA-256 of the complete raw file
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chatroom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Uploader, when relayed by the server (needed to open sealed chunks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// Channel entry from `channel_list`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(default)]
    pub users: Vec<String>,
}

/// Frames the client sends
#[derive(Clone, Debug, PartialEq)]
pub enum ClientFrame {
    /// Identify and join: `{username, chatroom}`
    Join { username: String, chatroom: String },
    FetchHistory { chatroom: String },
    SwitchChatroom {
        username: String,
        old_chatroom: String,
        new_chatroom: String,
    },
    Ping { username: String },
    GetOnlineUsers { username: String },
    GetChannels,
    Typing { chatroom: String, is_typing: bool },
    /// Chat message; `message` is ciphertext when `is_encrypted`
    Chat {
        message: String,
        timestamp: String,
        chatroom: String,
        is_encrypted: bool,
    },
    UploadChunk(ChunkFrame),
    RequestFile { file_name: String },
    /// Fetch a file announced by a `file_uploaded` message
    DownloadFile { file_id: String, chatroom: String },
    CreateChannel { name: String, creator: String },
    DeleteChannel { name: String, requester: String },
    AddUser { username: String, chatroom: String },
    RemoveUser { username: String, chatroom: String },
}

impl ClientFrame {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            ClientFrame::Join { .. } => "join",
            ClientFrame::FetchHistory { .. } => "fetch_history",
            ClientFrame::SwitchChatroom { .. } => "switch_chatroom",
            ClientFrame::Ping { .. } => "ping",
            ClientFrame::GetOnlineUsers { .. } => "get_online_users",
            ClientFrame::GetChannels => "get_channels",
            ClientFrame::Typing { .. } => "typing_status",
            ClientFrame::Chat { .. } => "message",
            ClientFrame::UploadChunk(_) => "upload_file_chunk",
            ClientFrame::RequestFile { .. } => "request_file",
            ClientFrame::DownloadFile { .. } => "download_file",
            ClientFrame::CreateChannel { .. } => "create_channel",
            ClientFrame::DeleteChannel { .. } => "delete_channel",
            ClientFrame::AddUser { .. } => "add_user_to_channel",
            ClientFrame::RemoveUser { .. } => "remove_user_from_channel",
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            ClientFrame::Join { username, chatroom } => {
                json!({ "username": username, "chatroom": chatroom })
            }
            ClientFrame::FetchHistory { chatroom } => {
                json!({ "type": "fetch_history", "chatroom": chatroom })
            }
            ClientFrame::SwitchChatroom {
                username,
                old_chatroom,
                new_chatroom,
            } => json!({
                "type": "switch_chatroom",
                "chatroom": new_chatroom,
                "username": username,
                "old_chatroom": old_chatroom,
                "new_chatroom": new_chatroom,
            }),
            ClientFrame::Ping { username } => json!({ "type": "ping", "username": username }),
            ClientFrame::GetOnlineUsers { username } => {
                json!({ "type": "get_online_users", "username": username })
            }
            ClientFrame::GetChannels => json!({ "type": "get_channels" }),
            ClientFrame::Typing { chatroom, is_typing } => json!({
                "type": "typing_status",
                "chatroom": chatroom,
                "is_typing": is_typing,
            }),
            ClientFrame::Chat {
                message,
                timestamp,
                chatroom,
                is_encrypted,
            } => json!({
                "message": message,
                "timestamp": timestamp,
                "chatroom": chatroom,
                "isEncrypted": is_encrypted,
            }),
            ClientFrame::UploadChunk(chunk) => {
                let mut v = serde_json::to_value(chunk)?;
                if let Value::Object(map) = &mut v {
                    map.insert("type".into(), Value::from("upload_file_chunk"));
                }
                v
            }
            ClientFrame::RequestFile { file_name } => {
                json!({ "type": "request_file", "fileName": file_name })
            }
            ClientFrame::DownloadFile { file_id, chatroom } => json!({
                "type": "download_file",
                "fileId": file_id,
                "chatroom": chatroom,
            }),
            ClientFrame::CreateChannel { name, creator } => json!({
                "type": "create_channel",
                "channelName": name,
                "creator": creator,
            }),
            ClientFrame::DeleteChannel { name, requester } => json!({
                "type": "delete_channel",
                "channelName": name,
                "requester": requester,
            }),
            ClientFrame::AddUser { username, chatroom } => json!({
                "type": "add_user_to_channel",
                "username": username,
                "chatroom": chatroom,
            }),
            ClientFrame::RemoveUser { username, chatroom } => json!({
                "type": "remove_user_from_channel",
                "username": username,
                "chatroom": chatroom,
            }),
        };
        Ok(value)
    }

    /// Serialized text frame
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }
}

/// Frames the server sends
#[derive(Clone, Debug, PartialEq)]
pub enum ServerFrame {
    /// Room history, oldest first; malformed entries already dropped
    History(Vec<ChatMessage>),
    OnlineUsers(Vec<String>),
    Pong,
    Typing { username: String, is_typing: bool },
    Channels(Vec<Channel>),
    SwitchSucceeded { chatroom: String },
    SwitchFailed { message: String },
    /// Whole file, base64 payload
    FileDownload {
        filename: String,
        file_data: String,
        checksum: String,
    },
    FileChunk(ChunkFrame),
    UploadStatus { ok: bool, message: Option<String> },
    /// Generic `{status, message}` reply
    Status { ok: bool, message: String },
    Chat(ChatMessage),
    Unknown(String),
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn required(v: &Value, key: &str, frame: &str) -> Result<String> {
    str_field(v, key).ok_or_else(|| SyncError::Protocol(format!("{} without '{}'", frame, key)))
}

/// History entries are stringified messages; objects are tolerated
fn parse_history_entry(entry: &Value) -> Option<ChatMessage> {
    let parsed = match entry {
        Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    };
    match parsed {
        Ok(msg) => Some(msg),
        Err(e) => {
            log::warn!("Protocol: dropping malformed history entry: {}", e);
            None
        }
    }
}

fn parse_user(entry: &Value) -> Option<String> {
    match entry {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => str_field(entry, "username"),
        _ => None,
    }
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let v: Value = serde_json::from_str(text)?;
        if !v.is_object() {
            return Err(SyncError::Protocol("frame is not an object".into()));
        }

        let kind = str_field(&v, "type");
        let frame = match kind.as_deref() {
            Some("chatroom_history") => {
                let entries = v.get("history").and_then(Value::as_array);
                let history = entries
                    .map(|list| list.iter().filter_map(parse_history_entry).collect())
                    .unwrap_or_default();
                ServerFrame::History(history)
            }
            Some("online_users") => {
                let users = v
                    .get("users")
                    .and_then(Value::as_array)
                    .map(|list| list.iter().filter_map(parse_user).collect())
                    .unwrap_or_default();
                ServerFrame::OnlineUsers(users)
            }
            Some("pong") => ServerFrame::Pong,
            Some("typing_status") => ServerFrame::Typing {
                username: required(&v, "username", "typing_status")?,
                is_typing: v.get("is_typing").and_then(Value::as_bool).unwrap_or(false),
            },
            Some("channel_list") => {
                let channels = match v.get("channels") {
                    Some(list) => serde_json::from_value(list.clone())?,
                    None => Vec::new(),
                };
                ServerFrame::Channels(channels)
            }
            Some("switch_chatroom_success") => ServerFrame::SwitchSucceeded {
                chatroom: str_field(&v, "chatroom").unwrap_or_default(),
            },
            Some("switch_chatroom_error") => ServerFrame::SwitchFailed {
                message: str_field(&v, "message").unwrap_or_default(),
            },
            Some("file_download") => ServerFrame::FileDownload {
                filename: required(&v, "filename", "file_download")?,
                file_data: required(&v, "file_data", "file_download")?,
                checksum: required(&v, "checksum", "file_download")?,
            },
            Some("file_chunk") => ServerFrame::FileChunk(serde_json::from_value(v)?),
            Some("file_upload_status") => ServerFrame::UploadStatus {
                ok: v.get("status").and_then(Value::as_str) == Some("success"),
                message: str_field(&v, "message"),
            },
            Some("text") | Some("file_uploaded") => ServerFrame::Chat(serde_json::from_value(v)?),
            Some(other) => ServerFrame::Unknown(other.to_string()),
            None => {
                if v.get("sender").is_some() || v.get("chatroom").is_some() {
                    ServerFrame::Chat(serde_json::from_value(v)?)
                } else if let Some(status) = v.get("status").and_then(Value::as_str) {
                    ServerFrame::Status {
                        ok: status == "success",
                        message: str_field(&v, "message").unwrap_or_default(),
                    }
                } else {
                    ServerFrame::Unknown(String::new())
                }
            }
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_chat_have_no_type() {
        let join = ClientFrame::Join {
            username: "alice".into(),
            chatroom: "general".into(),
        }
        .to_value()
        .unwrap();
        assert!(join.get("type").is_none());
        assert_eq!(join["username"], "alice");

        let chat = ClientFrame::Chat {
            message: "c".into(),
            timestamp: "t".into(),
            chatroom: "general".into(),
            is_encrypted: true,
        }
        .to_value()
        .unwrap();
        assert!(chat.get("type").is_none());
        assert_eq!(chat["isEncrypted"], true);
    }

    #[test]
    fn test_chunk_frame_shape() {
        let frame = ClientFrame::UploadChunk(ChunkFrame {
            file_id: "f1".into(),
            file_name: "a.bin".into(),
            chunk: vec![1, 2, 3],
            offset: 16384,
            is_last_chunk: true,
            total_size: 16387,
            checksum: "00".into(),
            chatroom: Some("general".into()),
            timestamp: Some("t".into()),
            sender: None,
        });
        let v = frame.to_value().unwrap();
        assert_eq!(v["type"], "upload_file_chunk");
        assert_eq!(v["fileId"], "f1");
        assert_eq!(v["isLastChunk"], true);
        assert_eq!(v["totalSize"], 16387);
        assert_eq!(v["chunk"], json!([1, 2, 3]));
    }

    #[test]
    fn test_download_file_frame() {
        let v = ClientFrame::DownloadFile {
            file_id: "k3x9q".into(),
            chatroom: "general".into(),
        }
        .to_value()
        .unwrap();
        assert_eq!(v, json!({"type": "download_file", "fileId": "k3x9q", "chatroom": "general"}));
    }

    #[test]
    fn test_parse_history_skips_bad_entries() {
        let text = r#"{"type":"chatroom_history","history":[
            "{\"sender\":\"a\",\"message\":\"x\",\"isEncrypted\":true,\"timestamp\":\"t\"}",
            "not json",
            {"sender":"b","message":"y","timestamp":"t"}
        ]}"#;
        match ServerFrame::parse(text).unwrap() {
            ServerFrame::History(h) => {
                assert_eq!(h.len(), 2);
                assert_eq!(h[0].sender.as_deref(), Some("a"));
                assert!(h[0].is_encrypted);
                assert_eq!(h[1].sender.as_deref(), Some("b"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_untyped_frames() {
        let chat = ServerFrame::parse(
            r#"{"message":"m","sender":"bob","timestamp":"t","chatroom":"general","isEncrypted":true}"#,
        )
        .unwrap();
        assert!(matches!(chat, ServerFrame::Chat(ref m) if m.sender.as_deref() == Some("bob")));

        let status = ServerFrame::parse(r#"{"status":"error","message":"nope"}"#).unwrap();
        assert_eq!(
            status,
            ServerFrame::Status {
                ok: false,
                message: "nope".into()
            }
        );
    }

    #[test]
    fn test_parse_typed_frames() {
        assert_eq!(ServerFrame::parse(r#"{"type":"pong"}"#).unwrap(), ServerFrame::Pong);
        assert_eq!(
            ServerFrame::parse(r#"{"type":"online_users","users":["a",{"username":"b"},3]}"#)
                .unwrap(),
            ServerFrame::OnlineUsers(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            ServerFrame::parse(r#"{"type":"file_upload_status","status":"success"}"#).unwrap(),
            ServerFrame::UploadStatus {
                ok: true,
                message: None
            }
        );
        assert!(matches!(
            ServerFrame::parse(r#"{"type":"channel_list","channels":[{"name":"general"}]}"#)
                .unwrap(),
            ServerFrame::Channels(ref c) if c[0].name == "general" && c[0].users.is_empty()
        ));
        assert_eq!(
            ServerFrame::parse(r#"{"type":"mystery"}"#).unwrap(),
            ServerFrame::Unknown("mystery".into())
        );
    }

    #[test]
    fn test_parse_rejects_incomplete_download() {
        assert!(ServerFrame::parse(r#"{"type":"file_download","filename":"a"}"#).is_err());
        assert!(ServerFrame::parse("[1,2]").is_err());
        assert!(ServerFrame::parse("{").is_err());
    }
}
