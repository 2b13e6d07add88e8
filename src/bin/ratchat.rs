//! Terminal RatChat client
//!
//! Usage: ratchat <username> <passphrase> [server_url]
//!
//! Peer keys come from RATCHAT_KEYS ("bob=passphrase,carol=passphrase").
//! Type a line to send it. Commands:
//!   /join <room>     switch rooms
//!   /upload <path>   upload a file into the current room
//!   /get <name>      download a file by name (saved under ./downloads)
//!   /download <id>   download a file announced in the room
//!   /create <room>   /delete <room>   /add <user>   /remove <user>
//!   /retry           reconnect after giving up
//!   /quit

use anyhow::{bail, Context};
use ratchat_sync::transfer::{percent, TransferEvent};
use ratchat_sync::{SessionConfig, StaticKeys, SymmetricKey, SyncClient, SyncEvent, DEFAULT_SERVER_URL};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string())
}

async fn save_download(name: &str, data: &[u8]) -> anyhow::Result<PathBuf> {
    let dir = PathBuf::from("downloads");
    tokio::fs::create_dir_all(&dir).await?;
    // Never trust a server-supplied path
    let path = dir.join(file_name_of(Path::new(name)));
    tokio::fs::write(&path, data).await?;
    Ok(path)
}

async fn show(event: SyncEvent) {
    match event {
        SyncEvent::StateChanged(state) => println!("* connection: {:?}", state),
        SyncEvent::Reconnecting { attempt, delay } => {
            println!("* reconnecting (attempt {}) in {:?}", attempt, delay)
        }
        SyncEvent::GaveUp { attempts } => {
            println!("* gave up after {} attempts; /retry to try again", attempts)
        }
        SyncEvent::HistoryLoaded { room, count } => println!("* #{}: {} message(s)", room, count),
        SyncEvent::MessageAdded { message, .. } | SyncEvent::MessageUpdated { message, .. } => {
            if message.is_renderable() {
                let hint = message
                    .download_id()
                    .map(|id| format!(" (/download {})", id))
                    .unwrap_or_default();
                println!(
                    "[{}] {}: {}{}",
                    message.timestamp.as_deref().unwrap_or(""),
                    message.sender.as_deref().unwrap_or("?"),
                    message.message.as_deref().unwrap_or(""),
                    hint
                );
            } else {
                println!("[{}] (waiting for key)", message.sender.as_deref().unwrap_or("?"));
            }
        }
        SyncEvent::OnlineUsers(users) => println!("* online: {}", users.join(", ")),
        SyncEvent::Typing { username, is_typing } => {
            if is_typing {
                println!("* {} is typing", username);
            }
        }
        SyncEvent::Channels(channels) => {
            let names: Vec<&str> = channels.iter().map(|c| c.name.as_str()).collect();
            println!("* channels: {}", names.join(", "));
        }
        SyncEvent::RoomSwitched { room } => println!("* now in #{}", room),
        SyncEvent::RoomSwitchFailed { message } => println!("! switch failed: {}", message),
        SyncEvent::Notice { ok, message } => {
            println!("{} {}", if ok { "*" } else { "!" }, message)
        }
        SyncEvent::UploadStatus { ok, message } => println!(
            "{} upload: {}",
            if ok { "*" } else { "!" },
            message.unwrap_or_default()
        ),
        SyncEvent::Transfer(transfer) => match transfer {
            TransferEvent::UploadProgress {
                file_name, sent, total, ..
            } => println!("* {} {:.0}%", file_name, percent(sent, total)),
            TransferEvent::UploadComplete {
                file_name, checksum, ..
            } => println!("* {} sent (sha256 {})", file_name, checksum),
            TransferEvent::UploadFailed {
                file_name, reason, ..
            } => println!("! {} failed: {}", file_name, reason),
            TransferEvent::FileReady {
                file_name, data, ..
            } => match save_download(&file_name, &data).await {
                Ok(path) => println!("* saved {}", path.display()),
                Err(e) => println!("! could not save {}: {:#}", file_name, e),
            },
            TransferEvent::FileRejected { file_name, reason } => {
                println!("! {} rejected: {}", file_name, reason)
            }
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("usage: {} <username> <passphrase> [server_url]", args[0]);
    }
    let username = args[1].clone();
    let own_key = SymmetricKey::from_passphrase(&args[2]);
    let server_url = args
        .get(3)
        .cloned()
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

    let peers = StaticKeys::from_pairs(&std::env::var("RATCHAT_KEYS").unwrap_or_default());
    log::info!(
        "ratchat: {} (key {}) with {} peer key(s)",
        username,
        own_key.fingerprint(),
        peers.len()
    );

    let config = SessionConfig::new(username, own_key).with_server_url(server_url);
    let mut client = SyncClient::start(config, peers);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = client.next_event() => match event {
                Some(event) => show(event).await,
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
                let arg = arg.trim();
                match command {
                    "/quit" => break,
                    "/join" => client.switch_room(arg)?,
                    "/retry" => client.reconnect()?,
                    "/get" => client.request_file(arg)?,
                    "/download" => client.download_file(arg)?,
                    "/create" => client.create_channel(arg)?,
                    "/delete" => client.delete_channel(arg)?,
                    "/add" => client.add_user(arg)?,
                    "/remove" => client.remove_user(arg)?,
                    "/upload" => {
                        if let Err(e) = client.upload_path(arg).await {
                            println!("! cannot upload {}: {}", arg, e);
                        }
                    }
                    other if other.starts_with('/') => println!("! unknown command {}", other),
                    _ => client.send_message(line)?,
                }
            }
        }
    }

    client.shutdown().await?;
    Ok(())
}
