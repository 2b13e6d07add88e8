//! SyncEngine: composition root
//!
//! Wires ConnectionManager, KeyCache, ChatroomSession and
//! FileTransferController into the request/response protocol. Inputs are
//! transport callbacks (`transport_opened`, `transport_closed`,
//! `handle_text`), key-directory answers (`keys_resolved`) and `tick(now)`.
//! Outputs are frames on the [`Transport`] and [`SyncEvent`]s collected for
//! the UI via `drain_events`.

use crate::config::{ChunkPolicy, SessionConfig};
use crate::connection::{ConnectionEvent, ConnectionId, ConnectionManager, ConnectionState, Transport};
use crate::crypto::{encrypt_text, SymmetricKey};
use crate::error::{Result, SyncError};
use crate::key_cache::{BatchId, KeyCache, KeyDirectory, KeyStatus};
use crate::protocol::{Channel, ChunkFrame, ClientFrame, ServerFrame};
use crate::session::ChatroomSession;
use crate::transfer::{FileTransferController, TransferEvent};
use crate::types::ChatMessage;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Everything the UI layer needs to render
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    StateChanged(ConnectionState),
    Reconnecting { attempt: u32, delay: Duration },
    /// Automatic retries exhausted; call `reconnect()` to try again
    GaveUp { attempts: u32 },
    HistoryLoaded { room: String, count: usize },
    /// `index` points into `SyncEngine::messages()`
    MessageAdded { index: usize, message: ChatMessage },
    /// A buffered message was decrypted (or marked undecryptable) in place
    MessageUpdated { index: usize, message: ChatMessage },
    OnlineUsers(Vec<String>),
    Typing { username: String, is_typing: bool },
    Channels(Vec<Channel>),
    RoomSwitched { room: String },
    RoomSwitchFailed { message: String },
    /// Generic server status reply
    Notice { ok: bool, message: String },
    UploadStatus { ok: bool, message: Option<String> },
    Transfer(TransferEvent),
}

/// ISO8601 with milliseconds, UTC
fn timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

pub struct SyncEngine<T: Transport, D: KeyDirectory> {
    config: SessionConfig,
    connection: ConnectionManager<T>,
    keys: KeyCache,
    session: ChatroomSession,
    transfers: FileTransferController,
    directory: D,
    /// Room the live transport joined or last switched to on the server
    joined_room: Option<String>,
    events: Vec<SyncEvent>,
}

impl<T: Transport, D: KeyDirectory> SyncEngine<T, D> {
    pub fn new(config: SessionConfig, transport: T, directory: D) -> Self {
        let mut keys = KeyCache::new(config.timings.key_debounce);
        // Own echoes decrypt without a directory round trip
        keys.insert(&config.username, config.own_key.clone());

        Self {
            connection: ConnectionManager::new(transport, &config.username, config.timings.clone()),
            session: ChatroomSession::new(&config.username, &config.room),
            transfers: FileTransferController::new(&config.timings, config.chunk_policy),
            keys,
            directory,
            joined_room: None,
            events: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn retry_count(&self) -> u32 {
        self.connection.retry_count()
    }

    pub fn is_terminal(&self) -> bool {
        self.connection.is_terminal()
    }

    pub fn current_room(&self) -> &str {
        self.session.current_room()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.session.messages()
    }

    pub fn online_users(&self) -> &[String] {
        self.session.online_users()
    }

    pub fn typing_users(&self) -> Vec<String> {
        self.session.typing_users().map(str::to_string).collect()
    }

    pub fn channels(&self) -> &[Channel] {
        self.session.channels()
    }

    pub fn key_of(&self, username: &str) -> Option<&SymmetricKey> {
        self.keys.get(username)
    }

    pub fn transport(&self) -> &T {
        self.connection.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.connection.transport_mut()
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut D {
        &mut self.directory
    }

    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Earliest instant at which `tick` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let uploads = if self.connection.is_ready() {
            self.transfers.next_deadline()
        } else {
            None
        };
        [self.connection.next_deadline(), self.keys.next_deadline(), uploads]
            .into_iter()
            .flatten()
            .min()
    }

    // ---- Lifecycle ----

    pub fn connect(&mut self) -> bool {
        let opened = self.connection.connect();
        self.pump_connection_events();
        opened
    }

    /// Manual retry (resets the retry budget)
    pub fn reconnect(&mut self) -> bool {
        let opened = self.connection.reconnect();
        self.pump_connection_events();
        opened
    }

    /// Tear down: every timer cancelled, transport closed cleanly
    pub fn shutdown(&mut self) {
        self.connection.shutdown();
        self.keys.cancel();
        self.pump_connection_events();
    }

    pub fn transport_opened(&mut self, id: ConnectionId, now: Instant) {
        let room = self.session.current_room().to_string();
        if self.connection.on_open(id, &room, now) {
            self.session.reset_history_requests();
            self.session.expect_history(&room);
            self.joined_room = Some(room);
        }
        self.pump_connection_events();
    }

    pub fn transport_closed(&mut self, id: ConnectionId, code: u16, reason: &str, now: Instant) {
        self.connection.on_close(id, code, reason, now);
        self.pump_connection_events();
    }

    /// Fire due timers: connection, key debounce, upload pacing
    pub fn tick(&mut self, now: Instant) {
        self.connection.tick(now);
        self.pump_connection_events();

        if let Some((batch, usernames)) = self.keys.flush(now) {
            self.directory.request(batch, usernames);
        }

        if self.connection.is_ready() && self.transfers.active_uploads() > 0 {
            let connection = &mut self.connection;
            let mut send = |frame: ClientFrame| connection.send(&frame);
            let events = self
                .transfers
                .poll_uploads(now, &self.config.own_key, &mut send);
            self.events.extend(events.into_iter().map(SyncEvent::Transfer));
        }
    }

    fn pump_connection_events(&mut self) {
        for event in self.connection.take_events() {
            match event {
                ConnectionEvent::StateChanged(state) => {
                    if state != ConnectionState::Ready {
                        let aborted = self.transfers.abort_all("connection lost");
                        self.events.extend(aborted.into_iter().map(SyncEvent::Transfer));
                    }
                    self.events.push(SyncEvent::StateChanged(state));
                    if state == ConnectionState::Ready {
                        self.catch_up_room();
                    }
                }
                ConnectionEvent::Reconnecting { attempt, delay } => {
                    self.events.push(SyncEvent::Reconnecting { attempt, delay });
                }
                ConnectionEvent::GaveUp { attempts } => {
                    self.events.push(SyncEvent::GaveUp { attempts });
                }
            }
        }
    }

    /// The room changed while the handshake was joining another one
    fn catch_up_room(&mut self) {
        let Some(joined) = self.joined_room.clone() else {
            return;
        };
        let Some(frames) = self.session.catch_up_frames(&joined) else {
            return;
        };
        log::info!(
            "Engine: joined '{}' during the handshake, moving to '{}'",
            joined,
            self.session.current_room()
        );
        if let Err(e) = self.send_switch(&frames) {
            log::warn!("Engine: room catch-up failed: {}", e);
        }
    }

    /// Send switch frames, noting the history request they carry
    fn send_switch(&mut self, frames: &[ClientFrame]) -> Result<()> {
        for frame in frames {
            self.connection.send(frame)?;
            if let ClientFrame::FetchHistory { chatroom } = frame {
                self.session.expect_history(chatroom);
            }
        }
        self.joined_room = Some(self.session.current_room().to_string());
        Ok(())
    }

    // ---- Inbound ----

    /// One text frame from transport `id`
    pub fn handle_text(&mut self, id: ConnectionId, text: &str, now: Instant) {
        if self.connection.current_id() != Some(id) {
            log::debug!("Engine: dropping frame from stale transport #{}", id.0);
            return;
        }
        #[cfg(feature = "verbose-network")]
        log::debug!("Engine: RX #{} {} bytes", id.0, text.len());

        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Engine: unparseable frame: {}", e);
                return;
            }
        };
        self.handle_frame(frame, now);
        self.pump_connection_events();
    }

    fn handle_frame(&mut self, frame: ServerFrame, now: Instant) {
        match frame {
            ServerFrame::History(history) => {
                if let Some(count) = self.session.replay_history(history, &mut self.keys, now) {
                    self.events.push(SyncEvent::HistoryLoaded {
                        room: self.session.current_room().to_string(),
                        count,
                    });
                }
                self.connection.note_history(now);
            }
            ServerFrame::OnlineUsers(users) => {
                self.session.set_online_users(users.clone());
                self.events.push(SyncEvent::OnlineUsers(users));
                self.connection.note_presence(now);
            }
            ServerFrame::Pong => self.connection.on_pong(),
            ServerFrame::Typing { username, is_typing } => {
                if self.session.set_typing(&username, is_typing) {
                    self.events.push(SyncEvent::Typing { username, is_typing });
                }
            }
            ServerFrame::Channels(channels) => {
                self.session.set_channels(channels.clone());
                self.events.push(SyncEvent::Channels(channels));
            }
            ServerFrame::SwitchSucceeded { chatroom } => {
                log::info!("Engine: switched to '{}'", chatroom);
                self.events.push(SyncEvent::RoomSwitched { room: chatroom });
            }
            ServerFrame::SwitchFailed { message } => {
                log::warn!("Engine: room switch refused: {}", message);
                self.events.push(SyncEvent::RoomSwitchFailed { message });
            }
            ServerFrame::FileDownload {
                filename,
                file_data,
                checksum,
            } => {
                let event = self.transfers.receive_download(&filename, &file_data, &checksum);
                self.events.push(SyncEvent::Transfer(event));
            }
            ServerFrame::FileChunk(chunk) => self.receive_file_chunk(chunk, now),
            ServerFrame::UploadStatus { ok, message } => {
                self.events.push(SyncEvent::UploadStatus { ok, message });
            }
            ServerFrame::Status { ok, message } => {
                self.events.push(SyncEvent::Notice { ok, message });
            }
            ServerFrame::Chat(message) => {
                if let Some(index) = self.session.admit(message, &mut self.keys, now) {
                    let message = self.session.messages()[index].clone();
                    self.events.push(SyncEvent::MessageAdded { index, message });
                }
            }
            ServerFrame::Unknown(kind) => {
                log::debug!("Engine: ignoring frame type '{}'", kind);
            }
        }
    }

    /// Sealed chunks wait for the sender's key like encrypted messages do
    fn receive_file_chunk(&mut self, chunk: ChunkFrame, now: Instant) {
        let sender = chunk.sender.clone();
        let key = match (self.transfers.policy(), sender.as_deref()) {
            (ChunkPolicy::Encrypted, Some(sender)) => match self.keys.require(sender, now) {
                KeyStatus::Ready(key) => Some(key),
                KeyStatus::Pending => {
                    if let Some(event) = self.transfers.park_chunk(chunk) {
                        self.events.push(SyncEvent::Transfer(event));
                    }
                    return;
                }
            },
            _ => None,
        };
        if let Some(event) = self.transfers.receive_chunk(chunk, key.as_ref()) {
            self.events.push(SyncEvent::Transfer(event));
        }
    }

    /// Answer for a batch handed to the [`KeyDirectory`]
    pub fn keys_resolved(
        &mut self,
        batch: BatchId,
        result: Result<HashMap<String, SymmetricKey>>,
        now: Instant,
    ) {
        let newly = self
            .keys
            .complete(batch, result.map_err(|e| e.to_string()));

        for index in self.session.keys_resolved(&newly, &mut self.keys, now) {
            let message = self.session.messages()[index].clone();
            self.events.push(SyncEvent::MessageUpdated { index, message });
        }

        for sender in &newly {
            for chunk in self.transfers.take_parked(sender) {
                self.receive_file_chunk(chunk, now);
            }
        }
        // Senders whose lookup came back empty
        let keys = &self.keys;
        let unresolved = self
            .transfers
            .reject_parked(|sender| keys.get(sender).is_none() && !keys.is_pending(sender));
        self.events.extend(unresolved.into_iter().map(SyncEvent::Transfer));
    }

    // ---- Outbound ----

    /// Encrypt with our own key and send
    pub fn send_message(&mut self, text: &str) -> Result<()> {
        let ciphertext = encrypt_text(&self.config.own_key, text)?;
        self.connection.send(&ClientFrame::Chat {
            message: ciphertext,
            timestamp: timestamp(),
            chatroom: self.session.current_room().to_string(),
            is_encrypted: true,
        })
    }

    pub fn set_typing(&mut self, is_typing: bool) -> Result<()> {
        self.connection.send(&ClientFrame::Typing {
            chatroom: self.session.current_room().to_string(),
            is_typing,
        })
    }

    /// Switch rooms; returns false if already in `room`
    ///
    /// The local switch happens even while disconnected: the next handshake
    /// joins the new room, and a handshake already under way is followed by
    /// a switch as soon as it completes.
    pub fn switch_room(&mut self, room: &str) -> Result<bool> {
        let Some(frames) = self.session.switch_room(room) else {
            return Ok(false);
        };
        if self.connection.is_ready() {
            self.send_switch(&frames)?;
        }
        Ok(true)
    }

    /// Start a paced upload into the current room; returns the file id
    pub fn upload_file(&mut self, file_name: &str, data: Vec<u8>, now: Instant) -> Result<String> {
        if !self.connection.is_ready() {
            return Err(SyncError::NotConnected);
        }
        let room = self.session.current_room().to_string();
        Ok(self.transfers.start_upload(file_name, data, room, timestamp(), now))
    }

    pub fn request_file(&mut self, file_name: &str) -> Result<()> {
        self.connection.send(&ClientFrame::RequestFile {
            file_name: file_name.to_string(),
        })
    }

    /// Ask for a file announced by a `file_uploaded` message
    pub fn download_file(&mut self, file_id: &str) -> Result<()> {
        if file_id.is_empty() {
            return Err(SyncError::Protocol("file id is empty".into()));
        }
        self.connection.send(&ClientFrame::DownloadFile {
            file_id: file_id.to_string(),
            chatroom: self.session.current_room().to_string(),
        })
    }

    pub fn create_channel(&mut self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::Protocol("channel name is empty".into()));
        }
        self.connection.send(&ClientFrame::CreateChannel {
            name: name.to_string(),
            creator: self.config.username.clone(),
        })
    }

    /// Delete a channel; leaving it first if it is the current room
    pub fn delete_channel(&mut self, name: &str) -> Result<()> {
        if name == crate::DEFAULT_ROOM {
            return Err(SyncError::Protocol(format!(
                "'{}' cannot be deleted",
                crate::DEFAULT_ROOM
            )));
        }
        self.connection.send(&ClientFrame::DeleteChannel {
            name: name.to_string(),
            requester: self.config.username.clone(),
        })?;
        if self.session.current_room() == name {
            self.switch_room(crate::DEFAULT_ROOM)?;
        }
        Ok(())
    }

    pub fn add_user(&mut self, username: &str) -> Result<()> {
        self.connection.send(&ClientFrame::AddUser {
            username: username.to_string(),
            chatroom: self.session.current_room().to_string(),
        })
    }

    pub fn remove_user(&mut self, username: &str) -> Result<()> {
        self.connection.send(&ClientFrame::RemoveUser {
            username: username.to_string(),
            chatroom: self.session.current_room().to_string(),
        })
    }
}
