//! Chatroom session: current room, visible messages, presence
//!
//! The message list only ever holds messages for `current_room`. Live
//! messages are admitted iff their `chatroom` matches the room at the time
//! they are received; switching rooms clears the list instead of queueing.
//!
//! History payloads answer `fetch_history` requests in the order they were
//! sent. A payload for a room that was left in the meantime is dropped, so a
//! slow answer never lands in the new room's list.
//!
//! Encrypted messages are admitted as-is when their sender's key is not yet
//! known and flipped in place once it resolves. Decryption failures keep the
//! message visible with the [`UNDECRYPTABLE`](crate::types::UNDECRYPTABLE)
//! sentinel.

use crate::crypto::decrypt_text;
use crate::key_cache::{KeyCache, KeyStatus};
use crate::protocol::{Channel, ClientFrame};
use crate::types::ChatMessage;
use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

/// Outcome of running one message through the decrypt pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decrypted {
    /// Plaintext already (nothing to do)
    Plain,
    /// Decrypted in place
    Opened,
    /// Key known but the ciphertext would not open
    Failed,
    /// Sender's key not resolved yet
    AwaitingKey,
}

/// Decrypt `msg` in place if its sender's key is available
///
/// Unknown senders are queued on the cache; the message stays encrypted.
pub fn decrypt_in_place(msg: &mut ChatMessage, keys: &mut KeyCache, now: Instant) -> Decrypted {
    if !msg.is_encrypted {
        return Decrypted::Plain;
    }
    let Some(sender) = msg.sender.clone() else {
        // No one to ask for a key
        msg.mark_undecryptable();
        return Decrypted::Failed;
    };
    let Some(ciphertext) = msg.message.as_deref() else {
        return Decrypted::Plain;
    };

    match keys.require(&sender, now) {
        KeyStatus::Ready(key) => match decrypt_text(&key, ciphertext) {
            Ok(plain) => {
                msg.mark_decrypted(plain);
                Decrypted::Opened
            }
            Err(_) => {
                log::warn!("Session: message from '{}' is undecryptable", sender);
                msg.mark_undecryptable();
                Decrypted::Failed
            }
        },
        KeyStatus::Pending => Decrypted::AwaitingKey,
    }
}

pub struct ChatroomSession {
    username: String,
    current_room: String,
    messages: Vec<ChatMessage>,
    online_users: Vec<String>,
    typing: BTreeSet<String>,
    channels: Vec<Channel>,
    /// Rooms of the `fetch_history` requests still unanswered, oldest first
    history_requests: VecDeque<String>,
}

impl ChatroomSession {
    pub fn new(username: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            current_room: room.into(),
            messages: Vec::new(),
            online_users: Vec::new(),
            typing: BTreeSet::new(),
            channels: Vec::new(),
            history_requests: VecDeque::new(),
        }
    }

    pub fn current_room(&self) -> &str {
        &self.current_room
    }

    /// Everything admitted for the current room, in receive order
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn online_users(&self) -> &[String] {
        &self.online_users
    }

    pub fn typing_users(&self) -> impl Iterator<Item = &str> {
        self.typing.iter().map(String::as_str)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Change rooms; returns the frames to send, or None if already there
    ///
    /// The buffered list is cleared: old-room messages are discarded.
    pub fn switch_room(&mut self, new_room: &str) -> Option<Vec<ClientFrame>> {
        if new_room == self.current_room {
            return None;
        }
        let old_room = std::mem::replace(&mut self.current_room, new_room.to_string());
        log::info!(
            "Session: '{}' -> '{}' (dropping {} message(s))",
            old_room,
            new_room,
            self.messages.len()
        );
        self.messages.clear();
        self.typing.clear();

        Some(self.switch_frames(old_room))
    }

    /// Frames that move the server from `joined_room` to the current room
    ///
    /// None when the server already has us in the current room.
    pub fn catch_up_frames(&self, joined_room: &str) -> Option<Vec<ClientFrame>> {
        if joined_room == self.current_room {
            return None;
        }
        Some(self.switch_frames(joined_room.to_string()))
    }

    fn switch_frames(&self, old_room: String) -> Vec<ClientFrame> {
        vec![
            ClientFrame::SwitchChatroom {
                username: self.username.clone(),
                old_chatroom: old_room,
                new_chatroom: self.current_room.clone(),
            },
            ClientFrame::FetchHistory {
                chatroom: self.current_room.clone(),
            },
        ]
    }

    /// A `fetch_history` for `room` went out
    pub fn expect_history(&mut self, room: &str) {
        self.history_requests.push_back(room.to_string());
    }

    /// New transport: earlier requests will never be answered
    pub fn reset_history_requests(&mut self) {
        self.history_requests.clear();
    }

    fn belongs_here(&self, msg: &ChatMessage) -> bool {
        msg.chatroom.as_deref() == Some(self.current_room.as_str())
    }

    /// Admission filter plus decrypt pipeline for a live message
    ///
    /// Returns the index in the visible list, or None if the message is for
    /// another room.
    pub fn admit(&mut self, mut msg: ChatMessage, keys: &mut KeyCache, now: Instant) -> Option<usize> {
        if !self.belongs_here(&msg) {
            log::debug!(
                "Session: discarding message for '{}' while in '{}'",
                msg.chatroom.as_deref().unwrap_or("?"),
                self.current_room
            );
            return None;
        }
        decrypt_in_place(&mut msg, keys, now);
        self.messages.push(msg);
        Some(self.messages.len() - 1)
    }

    /// Replace the list with a history payload for the current room
    ///
    /// The payload answers the oldest outstanding request. If that request
    /// was for a room we have since left, the payload is dropped and None is
    /// returned. Unsolicited payloads are attributed to the current room.
    ///
    /// Every distinct encrypted sender is required before any entry is
    /// decrypted, so unknown authors go out in one batch and the result is
    /// either decrypted or explicitly pending per entry. Order is preserved.
    /// Entries tagged for another room are dropped; untagged ones belong to
    /// the fetched room.
    pub fn replay_history(
        &mut self,
        history: Vec<ChatMessage>,
        keys: &mut KeyCache,
        now: Instant,
    ) -> Option<usize> {
        if let Some(fetched) = self.history_requests.pop_front() {
            if fetched != self.current_room {
                log::debug!(
                    "Session: dropping {} history entries for '{}' (now in '{}')",
                    history.len(),
                    fetched,
                    self.current_room
                );
                return None;
            }
        }
        let room = self.current_room.clone();
        let mut entries: Vec<ChatMessage> = history
            .into_iter()
            .filter(|m| m.chatroom.as_deref().map_or(true, |r| r == room))
            .collect();

        let senders: BTreeSet<&str> = entries
            .iter()
            .filter(|m| m.is_encrypted)
            .filter_map(|m| m.sender.as_deref())
            .collect();
        for sender in &senders {
            keys.require(sender, now);
        }

        let mut waiting = 0;
        for msg in &mut entries {
            if decrypt_in_place(msg, keys, now) == Decrypted::AwaitingKey {
                waiting += 1;
            }
        }
        log::debug!(
            "Session: history for '{}': {} entries, {} awaiting keys",
            room,
            entries.len(),
            waiting
        );

        self.messages = entries;
        Some(self.messages.len())
    }

    /// Re-walk buffered ciphertext after keys resolved
    ///
    /// Returns the indices of messages that changed.
    pub fn keys_resolved(&mut self, senders: &[String], keys: &mut KeyCache, now: Instant) -> Vec<usize> {
        let mut changed = Vec::new();
        for (i, msg) in self.messages.iter_mut().enumerate() {
            let waiting = senders.iter().any(|s| msg.awaits_key_of(s));
            if waiting && decrypt_in_place(msg, keys, now) != Decrypted::AwaitingKey {
                changed.push(i);
            }
        }
        changed
    }

    pub fn set_online_users(&mut self, users: Vec<String>) {
        self.online_users = users;
    }

    /// Returns true if the typing set changed
    pub fn set_typing(&mut self, username: &str, is_typing: bool) -> bool {
        if username == self.username {
            return false;
        }
        if is_typing {
            self.typing.insert(username.to_string())
        } else {
            self.typing.remove(username)
        }
    }

    pub fn set_channels(&mut self, channels: Vec<Channel>) {
        self.channels = channels;
    }
}
