use serde::{Deserialize, Serialize};

/// Shown in place of a body that could not be decrypted
pub const UNDECRYPTABLE: &str = "[undecryptable]";

/// Kind of chat entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    /// Server announcement that a file was uploaded to the room
    FileUploaded,
    #[serde(other)]
    Other,
}

/// Chat message as it travels on the wire and sits in the visible list
///
/// Built from an inbound frame (or a history entry) and mutated in place at
/// most once: when the sender's key resolves, `message` is replaced with
/// plaintext (or [`UNDECRYPTABLE`]) and `is_encrypted` flips to false.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "isEncrypted", default)]
    pub is_encrypted: bool,
    /// ISO8601
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chatroom: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Server-side id of an uploaded file (`file_uploaded` entries)
    #[serde(rename = "fileId", default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(rename = "fileName", default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Set when decryption was attempted and failed
    #[serde(skip)]
    pub undecryptable: bool,
}

impl ChatMessage {
    /// Visible to the UI: decrypted, with body and timestamp present
    pub fn is_renderable(&self) -> bool {
        !self.is_encrypted && self.message.is_some() && self.timestamp.is_some()
    }

    /// File id to pass to `SyncEngine::download_file`, if this announces one
    pub fn download_id(&self) -> Option<&str> {
        match self.kind {
            MessageKind::FileUploaded => self.file_id.as_deref(),
            _ => None,
        }
    }

    /// Still waiting for `sender`'s key
    pub fn awaits_key_of(&self, sender: &str) -> bool {
        self.is_encrypted && self.message.is_some() && self.sender.as_deref() == Some(sender)
    }

    /// Replace the ciphertext with plaintext
    pub fn mark_decrypted(&mut self, plaintext: String) {
        self.message = Some(plaintext);
        self.is_encrypted = false;
        self.undecryptable = false;
    }

    /// Replace the ciphertext with the failure sentinel (kept visible)
    pub fn mark_undecryptable(&mut self) {
        self.message = Some(UNDECRYPTABLE.to_string());
        self.is_encrypted = false;
        self.undecryptable = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wire_message() {
        let json = r#"{"message":"abc","sender":"bob","timestamp":"2024-05-01T10:00:00.000Z","chatroom":"general","isEncrypted":true}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.sender.as_deref(), Some("bob"));
        assert!(msg.is_encrypted);
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(!msg.is_renderable());
    }

    #[test]
    fn test_file_uploaded_kind() {
        let json = r#"{"type":"file_uploaded","message":"[File: a.txt]","sender":"bob","timestamp":"t","chatroom":"general","fileId":"k3x9q","fileName":"a.txt"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, MessageKind::FileUploaded);
        assert!(msg.is_renderable());
        assert_eq!(msg.download_id(), Some("k3x9q"));
        assert_eq!(msg.file_name.as_deref(), Some("a.txt"));

        let text: ChatMessage =
            serde_json::from_str(r#"{"message":"hi","fileId":"stray","timestamp":"t"}"#).unwrap();
        assert_eq!(text.download_id(), None);

        let odd: ChatMessage = serde_json::from_str(r#"{"type":"sticker"}"#).unwrap();
        assert_eq!(odd.kind, MessageKind::Other);
    }

    #[test]
    fn test_decrypt_transitions() {
        let mut msg = ChatMessage {
            sender: Some("bob".into()),
            message: Some("cipher".into()),
            is_encrypted: true,
            timestamp: Some("t".into()),
            ..Default::default()
        };
        assert!(msg.awaits_key_of("bob"));
        assert!(!msg.awaits_key_of("carol"));

        msg.mark_decrypted("hi".into());
        assert!(msg.is_renderable());
        assert!(!msg.awaits_key_of("bob"));

        let mut bad = msg.clone();
        bad.is_encrypted = true;
        bad.mark_undecryptable();
        assert_eq!(bad.message.as_deref(), Some(UNDECRYPTABLE));
        assert!(bad.undecryptable);
        assert!(bad.is_renderable());
    }
}
