//! Tokio driver for [`SyncEngine`]
//!
//! One task owns the engine and multiplexes caller commands, socket events,
//! key-directory answers and timer deadlines. Each transport id gets its
//! own socket task (tokio-tungstenite) fed through an mpsc writer queue, so
//! the engine never awaits I/O.

use crate::config::SessionConfig;
use crate::connection::{close_code, ConnectionId, ConnectionState, Transport};
use crate::crypto::SymmetricKey;
use crate::engine::{SyncEngine, SyncEvent};
use crate::error::{Result, SyncError};
use crate::key_cache::{BatchId, KeyDirectory};
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Longest the loop sleeps without re-checking timers
const MAX_IDLE: Duration = Duration::from_secs(1);

/// Grace period for the close handshake on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Async key-directory lookup: usernames in, known keys out
///
/// Absent users are simply missing from the map.
pub trait ResolveKeys: Send + Sync + 'static {
    fn resolve_keys(
        &self,
        usernames: BTreeSet<String>,
    ) -> impl Future<Output = Result<HashMap<String, SymmetricKey>>> + Send;
}

/// Fixed key table (tests, the terminal client's `RATCHAT_KEYS`)
#[derive(Clone, Debug, Default)]
pub struct StaticKeys {
    keys: HashMap<String, SymmetricKey>,
}

impl StaticKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, username: impl Into<String>, key: SymmetricKey) -> Self {
        self.keys.insert(username.into(), key);
        self
    }

    /// Parse `user=passphrase,user2=passphrase2`
    pub fn from_pairs(pairs: &str) -> Self {
        let keys = pairs
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(user, secret)| (user.trim().to_string(), SymmetricKey::from_passphrase(secret.trim())))
            .filter(|(user, _)| !user.is_empty())
            .collect();
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl ResolveKeys for StaticKeys {
    fn resolve_keys(
        &self,
        usernames: BTreeSet<String>,
    ) -> impl Future<Output = Result<HashMap<String, SymmetricKey>>> + Send {
        let found = usernames
            .into_iter()
            .filter_map(|u| self.keys.get(&u).cloned().map(|k| (u, k)))
            .collect();
        std::future::ready(Ok(found))
    }
}

/// Everything that wakes the driver besides caller commands
enum IoEvent {
    Opened(ConnectionId),
    Frame(ConnectionId, String),
    Closed(ConnectionId, u16, String),
    Keys(BatchId, Result<HashMap<String, SymmetricKey>>),
}

enum Outbound {
    Text(String),
    Close(u16, String),
}

/// WebSocket [`Transport`]: one socket task per connection id
pub struct WsTransport {
    url: String,
    io: mpsc::UnboundedSender<IoEvent>,
    sockets: HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>,
}

impl WsTransport {
    fn new(url: String, io: mpsc::UnboundedSender<IoEvent>) -> Self {
        Self {
            url,
            io,
            sockets: HashMap::new(),
        }
    }

    /// Socket tasks whose close has not been reported yet
    pub fn live_sockets(&self) -> usize {
        self.sockets.len()
    }
}

impl Transport for WsTransport {
    fn open(&mut self, id: ConnectionId) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.insert(id, tx);
        tokio::spawn(run_socket(self.url.clone(), id, rx, self.io.clone()));
    }

    fn send(&mut self, id: ConnectionId, text: String) -> Result<()> {
        let socket = self
            .sockets
            .get(&id)
            .ok_or_else(|| SyncError::Transport(format!("no socket #{}", id.0)))?;
        socket
            .send(Outbound::Text(text))
            .map_err(|_| SyncError::Transport(format!("socket #{} is gone", id.0)))
    }

    fn close(&mut self, id: ConnectionId, code: u16, reason: &str) {
        if let Some(socket) = self.sockets.remove(&id) {
            let _ = socket.send(Outbound::Close(code, reason.to_string()));
        }
    }

    fn release(&mut self, id: ConnectionId) {
        self.sockets.remove(&id);
    }
}

/// Read a file for upload: the name to announce and its bytes
pub async fn read_upload(path: impl AsRef<Path>) -> Result<(String, Vec<u8>)> {
    let path = path.as_ref();
    let data = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string());
    Ok((name, data))
}

/// Drive one WebSocket until either side closes it
async fn run_socket(
    url: String,
    id: ConnectionId,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    io: mpsc::UnboundedSender<IoEvent>,
) {
    log::debug!("WebSocket: #{} connecting to {}", id.0, url);
    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            log::warn!("WebSocket: #{} connect failed: {}", id.0, e);
            let _ = io.send(IoEvent::Closed(id, close_code::ABNORMAL, e.to_string()));
            return;
        }
    };
    let _ = io.send(IoEvent::Opened(id));

    let (mut write, mut read) = stream.split();
    let (code, reason) = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        break (close_code::ABNORMAL, e.to_string());
                    }
                }
                Some(Outbound::Close(code, reason)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break (code, reason);
                }
                None => {
                    let _ = write.close().await;
                    break (close_code::NORMAL, "transport dropped".to_string());
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = io.send(IoEvent::Frame(id, text.as_str().to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((close_code::ABNORMAL, "closed without status".to_string()));
                }
                // Protocol pings are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => break (close_code::ABNORMAL, e.to_string()),
                None => break (close_code::ABNORMAL, "stream ended".to_string()),
            },
        }
    };

    log::debug!("WebSocket: #{} closed ({} '{}')", id.0, code, reason);
    let _ = io.send(IoEvent::Closed(id, code, reason));
}

/// [`KeyDirectory`] that runs each batch on its own task
pub struct ChannelKeyDirectory<R: ResolveKeys> {
    resolver: Arc<R>,
    io: mpsc::UnboundedSender<IoEvent>,
}

impl<R: ResolveKeys> KeyDirectory for ChannelKeyDirectory<R> {
    fn request(&mut self, batch: BatchId, usernames: BTreeSet<String>) {
        let resolver = Arc::clone(&self.resolver);
        let io = self.io.clone();
        tokio::spawn(async move {
            let result = resolver.resolve_keys(usernames).await;
            let _ = io.send(IoEvent::Keys(batch, result));
        });
    }
}

/// Caller requests for the driver task
#[derive(Debug)]
enum Command {
    Send(String),
    Typing(bool),
    SwitchRoom(String),
    Upload { file_name: String, data: Vec<u8> },
    RequestFile(String),
    DownloadFile(String),
    CreateChannel(String),
    DeleteChannel(String),
    AddUser(String),
    RemoveUser(String),
    Reconnect,
    Shutdown,
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Send(_) => "send",
            Command::Typing(_) => "typing",
            Command::SwitchRoom(_) => "switch room",
            Command::Upload { .. } => "upload",
            Command::RequestFile(_) => "request file",
            Command::DownloadFile(_) => "download file",
            Command::CreateChannel(_) => "create channel",
            Command::DeleteChannel(_) => "delete channel",
            Command::AddUser(_) => "add user",
            Command::RemoveUser(_) => "remove user",
            Command::Reconnect => "reconnect",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Handle to a running session
///
/// Commands are fire-and-forget; failures come back as
/// [`SyncEvent::Notice`] with `ok: false`.
pub struct SyncClient {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    task: JoinHandle<()>,
}

impl SyncClient {
    /// Spawn the driver task and connect
    pub fn start<R: ResolveKeys>(config: SessionConfig, resolver: R) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();

        let transport = WsTransport::new(config.server_url.clone(), io_tx.clone());
        let directory = ChannelKeyDirectory {
            resolver: Arc::new(resolver),
            io: io_tx,
        };
        let engine = SyncEngine::new(config, transport, directory);
        let task = tokio::spawn(drive(engine, command_rx, io_rx, event_tx));

        Self {
            commands: command_tx,
            events: event_rx,
            task,
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::Transport("client task has stopped".into()))
    }

    pub fn send_message(&self, text: impl Into<String>) -> Result<()> {
        self.command(Command::Send(text.into()))
    }

    pub fn set_typing(&self, is_typing: bool) -> Result<()> {
        self.command(Command::Typing(is_typing))
    }

    pub fn switch_room(&self, room: impl Into<String>) -> Result<()> {
        self.command(Command::SwitchRoom(room.into()))
    }

    pub fn upload_file(&self, file_name: impl Into<String>, data: Vec<u8>) -> Result<()> {
        self.command(Command::Upload {
            file_name: file_name.into(),
            data,
        })
    }

    /// Upload a file from disk; read errors are returned directly
    pub async fn upload_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let (file_name, data) = read_upload(path).await?;
        self.upload_file(file_name, data)
    }

    pub fn request_file(&self, file_name: impl Into<String>) -> Result<()> {
        self.command(Command::RequestFile(file_name.into()))
    }

    /// Fetch a file announced in the room (see `ChatMessage::download_id`)
    pub fn download_file(&self, file_id: impl Into<String>) -> Result<()> {
        self.command(Command::DownloadFile(file_id.into()))
    }

    pub fn create_channel(&self, name: impl Into<String>) -> Result<()> {
        self.command(Command::CreateChannel(name.into()))
    }

    pub fn delete_channel(&self, name: impl Into<String>) -> Result<()> {
        self.command(Command::DeleteChannel(name.into()))
    }

    pub fn add_user(&self, username: impl Into<String>) -> Result<()> {
        self.command(Command::AddUser(username.into()))
    }

    pub fn remove_user(&self, username: impl Into<String>) -> Result<()> {
        self.command(Command::RemoveUser(username.into()))
    }

    /// Manual retry after the client gave up
    pub fn reconnect(&self) -> Result<()> {
        self.command(Command::Reconnect)
    }

    /// Next engine event; None once the driver has stopped
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Close cleanly and wait for the driver to finish
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);
        self.task
            .await
            .map_err(|e| SyncError::Transport(format!("client task failed: {}", e)))
    }
}

/// Run one caller command; failures become a notice for the caller
fn apply<T: Transport, D: KeyDirectory>(engine: &mut SyncEngine<T, D>, command: Command) -> Option<SyncEvent> {
    let label = command.label();
    let result = match command {
        Command::Send(text) => engine.send_message(&text),
        Command::Typing(is_typing) => engine.set_typing(is_typing),
        Command::SwitchRoom(room) => engine.switch_room(&room).map(|_| ()),
        Command::Upload { file_name, data } => engine
            .upload_file(&file_name, data, Instant::now())
            .map(|_| ()),
        Command::RequestFile(name) => engine.request_file(&name),
        Command::DownloadFile(file_id) => engine.download_file(&file_id),
        Command::CreateChannel(name) => engine.create_channel(&name),
        Command::DeleteChannel(name) => engine.delete_channel(&name),
        Command::AddUser(user) => engine.add_user(&user),
        Command::RemoveUser(user) => engine.remove_user(&user),
        Command::Reconnect => {
            engine.reconnect();
            Ok(())
        }
        Command::Shutdown => Ok(()),
    };
    result.err().map(|e| {
        log::warn!("Client: {} failed: {}", label, e);
        SyncEvent::Notice {
            ok: false,
            message: format!("{} failed: {}", label, e),
        }
    })
}

fn apply_io<T: Transport, D: KeyDirectory>(engine: &mut SyncEngine<T, D>, event: IoEvent) {
    let now = Instant::now();
    match event {
        IoEvent::Opened(id) => engine.transport_opened(id, now),
        IoEvent::Frame(id, text) => engine.handle_text(id, &text, now),
        IoEvent::Closed(id, code, reason) => engine.transport_closed(id, code, &reason, now),
        IoEvent::Keys(batch, result) => engine.keys_resolved(batch, result, now),
    }
}

async fn drive<T: Transport, D: KeyDirectory>(
    mut engine: SyncEngine<T, D>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut io: mpsc::UnboundedReceiver<IoEvent>,
    events: mpsc::UnboundedSender<SyncEvent>,
) {
    engine.connect();

    loop {
        for event in engine.drain_events() {
            let _ = events.send(event);
        }

        let now = Instant::now();
        let wake = engine
            .next_deadline()
            .map_or(now + MAX_IDLE, |d| d.min(now + MAX_IDLE));

        tokio::select! {
            command = commands.recv() => match command {
                None | Some(Command::Shutdown) => break,
                Some(command) => {
                    if let Some(notice) = apply(&mut engine, command) {
                        let _ = events.send(notice);
                    }
                }
            },
            Some(event) = io.recv() => apply_io(&mut engine, event),
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
        }

        engine.tick(Instant::now());
    }

    engine.shutdown();
    // Let the socket confirm the close so the final state is IDLE
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while engine.state() == ConnectionState::Closing {
            match io.recv().await {
                Some(event) => apply_io(&mut engine, event),
                None => break,
            }
        }
    })
    .await;

    for event in engine.drain_events() {
        let _ = events.send(event);
    }
    log::info!("Client: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_keys_from_pairs() {
        let keys = StaticKeys::from_pairs("bob=hunter2, carol = pw ,broken,=x");
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_static_keys_resolve_subset() {
        let keys = StaticKeys::new().with("bob", SymmetricKey::from_passphrase("b"));
        let wanted: BTreeSet<String> = ["bob", "ghost"].iter().map(|s| s.to_string()).collect();
        let found = keys.resolve_keys(wanted).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("bob"), Some(&SymmetricKey::from_passphrase("b")));
    }

    #[tokio::test]
    async fn test_read_upload() {
        let path = std::env::temp_dir().join(format!("ratchat-upload-{}.txt", std::process::id()));
        tokio::fs::write(&path, b"payload").await.unwrap();
        let (name, data) = read_upload(&path).await.unwrap();
        assert_eq!(name, path.file_name().unwrap().to_string_lossy());
        assert_eq!(data, b"payload");
        tokio::fs::remove_file(&path).await.unwrap();

        assert!(matches!(read_upload(&path).await, Err(SyncError::Io(_))));
    }

    #[tokio::test]
    async fn test_failed_connects_release_their_sockets() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (io_tx, mut io_rx) = mpsc::unbounded_channel();
        let transport = WsTransport::new(format!("ws://{}", addr), io_tx.clone());
        let directory = ChannelKeyDirectory {
            resolver: Arc::new(StaticKeys::new()),
            io: io_tx,
        };
        let config = SessionConfig::new("alice", SymmetricKey::from_passphrase("a"));
        let mut engine = SyncEngine::new(config, transport, directory);

        for _ in 0..4 {
            engine.reconnect();
            assert_eq!(engine.transport().live_sockets(), 1);
            let event = tokio::time::timeout(Duration::from_secs(5), io_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(event, IoEvent::Closed(..)));
            apply_io(&mut engine, event);
            assert_eq!(engine.transport().live_sockets(), 0);
        }
    }
}
