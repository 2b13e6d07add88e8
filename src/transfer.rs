//! Chunked file transfer with whole-file checksum verification
//!
//! Outbound: the checksum is computed once over the complete raw bytes
//! before anything is sent, then the file goes out as fixed-size
//! `upload_file_chunk` frames paced by `chunk_interval`. A send failure
//! aborts the upload; there is no resume.
//!
//! Inbound: a `file_download` frame carries the whole file (base64) and is
//! verified in one step. `file_chunk` frames are reassembled into a
//! pre-allocated buffer with a received-bitmap and verified once every chunk
//! has been observed. Bytes that fail verification are never handed out.
//! The number of concurrent assemblies and the bytes they reserve are both
//! capped. Sealed chunks whose sender key is still being looked up are
//! parked, within their own byte budget, until the key arrives.

use crate::config::{ChunkPolicy, Timings};
use crate::crypto::{decrypt_bytes, encrypt_bytes, Checksum, SymmetricKey};
use crate::error::{Result, SyncError};
use crate::protocol::{ChunkFrame, ClientFrame};
use base64::Engine as _;
use bitvec::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// Upper bound for an inbound chunked file (pre-allocated up front)
pub const MAX_INBOUND_SIZE: u64 = 256 * 1024 * 1024;
/// Concurrent inbound chunked files
pub const MAX_INBOUND_TRANSFERS: usize = 4;
/// Bytes reserved by all inbound assemblies together
pub const MAX_INBOUND_RESERVED: u64 = 512 * 1024 * 1024;
/// Sealed chunk bytes held while their sender's key is looked up
pub const MAX_PARKED_BYTES: usize = 16 * 1024 * 1024;

/// Transfer notifications for the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    UploadProgress {
        file_id: String,
        file_name: String,
        sent: u64,
        total: u64,
    },
    UploadComplete {
        file_id: String,
        file_name: String,
        checksum: Checksum,
    },
    UploadFailed {
        file_id: String,
        file_name: String,
        reason: String,
    },
    /// Verified bytes, ready to save or display
    FileReady {
        file_name: String,
        data: Vec<u8>,
        checksum: Checksum,
    },
    /// Integrity or decode failure; the bytes are dropped
    FileRejected { file_name: String, reason: String },
}

/// Upload progress in percent; an empty file is 100% once its only chunk is out
pub fn percent(sent: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (sent as f64 / total as f64 * 100.0).min(100.0)
}

fn chunk_count(total_size: u64, chunk_size: usize) -> u64 {
    total_size.div_ceil(chunk_size as u64).max(1)
}

/// One outbound file
struct Upload {
    file_id: String,
    file_name: String,
    data: Vec<u8>,
    checksum: Checksum,
    chatroom: String,
    timestamp: String,
    chunks_sent: u64,
    total_chunks: u64,
    next_at: Instant,
}

impl Upload {
    fn failed(&self, reason: impl Into<String>) -> TransferEvent {
        TransferEvent::UploadFailed {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            reason: reason.into(),
        }
    }
}

/// Reassembly buffer for one inbound chunked file
struct Assembly {
    file_name: String,
    data: Vec<u8>,
    received: BitVec,
    received_count: u64,
    total_size: u64,
    expected: Checksum,
}

impl Assembly {
    fn new(file_name: String, total_size: u64, chunk_size: usize, expected: Checksum) -> Self {
        let chunks = chunk_count(total_size, chunk_size) as usize;
        Self {
            file_name,
            data: vec![0u8; total_size as usize],
            received: bitvec![0; chunks],
            received_count: 0,
            total_size,
            expected,
        }
    }

    /// Store a chunk; returns false for duplicates
    fn insert(&mut self, index: usize, offset: usize, payload: &[u8]) -> Result<bool> {
        if index >= self.received.len() {
            return Err(SyncError::Protocol(format!("chunk {} out of range", index)));
        }
        if self.received[index] {
            return Ok(false);
        }
        let end = offset + payload.len();
        if end > self.data.len() {
            return Err(SyncError::Protocol(format!(
                "chunk at {} overruns {} bytes",
                offset, self.total_size
            )));
        }
        self.data[offset..end].copy_from_slice(payload);
        self.received.set(index, true);
        self.received_count += 1;
        Ok(true)
    }

    fn is_complete(&self) -> bool {
        self.received_count == self.received.len() as u64
    }
}

pub struct FileTransferController {
    chunk_size: usize,
    interval: std::time::Duration,
    policy: ChunkPolicy,
    uploads: Vec<Upload>,
    inbound: HashMap<String, Assembly>,
    max_inbound_transfers: usize,
    max_inbound_reserved: u64,
    parked: Vec<ChunkFrame>,
    parked_bytes: usize,
}

impl FileTransferController {
    pub fn new(timings: &Timings, policy: ChunkPolicy) -> Self {
        Self {
            chunk_size: timings.chunk_size.max(1),
            interval: timings.chunk_interval,
            policy,
            uploads: Vec::new(),
            inbound: HashMap::new(),
            max_inbound_transfers: MAX_INBOUND_TRANSFERS,
            max_inbound_reserved: MAX_INBOUND_RESERVED,
            parked: Vec::new(),
            parked_bytes: 0,
        }
    }

    /// Override the inbound assembly caps
    pub fn with_inbound_limits(mut self, max_transfers: usize, max_reserved: u64) -> Self {
        self.max_inbound_transfers = max_transfers;
        self.max_inbound_reserved = max_reserved;
        self
    }

    pub fn policy(&self) -> ChunkPolicy {
        self.policy
    }

    pub fn active_uploads(&self) -> usize {
        self.uploads.len()
    }

    pub fn active_downloads(&self) -> usize {
        self.inbound.len()
    }

    /// Bytes pre-allocated by inbound assemblies
    pub fn reserved_bytes(&self) -> u64 {
        self.inbound.values().map(|a| a.total_size).sum()
    }

    pub fn parked_chunks(&self) -> usize {
        self.parked.len()
    }

    /// Queue a file for upload; the first chunk goes out on the next poll
    ///
    /// Returns the file id used on the wire.
    pub fn start_upload(
        &mut self,
        file_name: impl Into<String>,
        data: Vec<u8>,
        chatroom: impl Into<String>,
        timestamp: impl Into<String>,
        now: Instant,
    ) -> String {
        let file_id = hex::encode(rand::random::<[u8; 8]>());
        let checksum = Checksum::compute(&data);
        let upload = Upload {
            file_id: file_id.clone(),
            file_name: file_name.into(),
            total_chunks: chunk_count(data.len() as u64, self.chunk_size),
            data,
            checksum,
            chatroom: chatroom.into(),
            timestamp: timestamp.into(),
            chunks_sent: 0,
            next_at: now,
        };
        log::info!(
            "Transfer: upload {} '{}' ({} bytes, {} chunk(s), sha256 {})",
            upload.file_id,
            upload.file_name,
            upload.data.len(),
            upload.total_chunks,
            upload.checksum
        );
        self.uploads.push(upload);
        file_id
    }

    /// Earliest time a queued chunk is due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.uploads.iter().map(|u| u.next_at).min()
    }

    /// Send every chunk that is due, one per upload
    pub fn poll_uploads(
        &mut self,
        now: Instant,
        own_key: &SymmetricKey,
        send: &mut dyn FnMut(ClientFrame) -> Result<()>,
    ) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        let mut finished = Vec::new();

        for (i, upload) in self.uploads.iter_mut().enumerate() {
            if upload.next_at > now {
                continue;
            }

            let start = (upload.chunks_sent as usize) * self.chunk_size;
            let end = (start + self.chunk_size).min(upload.data.len());
            let is_last = upload.chunks_sent + 1 == upload.total_chunks;
            let raw = &upload.data[start..end];

            let chunk = match self.policy {
                ChunkPolicy::Raw => raw.to_vec(),
                ChunkPolicy::Encrypted => match encrypt_bytes(own_key, raw) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        events.push(upload.failed(e.to_string()));
                        finished.push(i);
                        continue;
                    }
                },
            };

            let frame = ClientFrame::UploadChunk(ChunkFrame {
                file_id: upload.file_id.clone(),
                file_name: upload.file_name.clone(),
                chunk,
                offset: start as u64,
                is_last_chunk: is_last,
                total_size: upload.data.len() as u64,
                checksum: upload.checksum.to_hex(),
                chatroom: Some(upload.chatroom.clone()),
                timestamp: Some(upload.timestamp.clone()),
                sender: None,
            });

            if let Err(e) = send(frame) {
                log::warn!(
                    "Transfer: upload {} aborted at offset {}: {}",
                    upload.file_id,
                    start,
                    e
                );
                events.push(upload.failed(e.to_string()));
                finished.push(i);
                continue;
            }

            upload.chunks_sent += 1;
            events.push(TransferEvent::UploadProgress {
                file_id: upload.file_id.clone(),
                file_name: upload.file_name.clone(),
                sent: end as u64,
                total: upload.data.len() as u64,
            });

            if is_last {
                log::info!("Transfer: upload {} sent", upload.file_id);
                events.push(TransferEvent::UploadComplete {
                    file_id: upload.file_id.clone(),
                    file_name: upload.file_name.clone(),
                    checksum: upload.checksum,
                });
                finished.push(i);
            } else {
                upload.next_at = now + self.interval;
            }
        }

        for i in finished.into_iter().rev() {
            self.uploads.remove(i);
        }
        events
    }

    /// Decode and verify a whole-file `file_download`
    pub fn verify_download(file_data: &str, checksum: &str) -> Result<(Vec<u8>, Checksum)> {
        let expected = Checksum::from_hex(checksum)?;
        let data = base64::engine::general_purpose::STANDARD.decode(file_data.trim())?;
        expected.verify(&data)?;
        Ok((data, expected))
    }

    pub fn receive_download(&mut self, file_name: &str, file_data: &str, checksum: &str) -> TransferEvent {
        match Self::verify_download(file_data, checksum) {
            Ok((data, checksum)) => {
                log::info!("Transfer: '{}' verified ({} bytes)", file_name, data.len());
                TransferEvent::FileReady {
                    file_name: file_name.to_string(),
                    data,
                    checksum,
                }
            }
            Err(e) => {
                log::warn!("Transfer: rejecting '{}': {}", file_name, e);
                TransferEvent::FileRejected {
                    file_name: file_name.to_string(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Feed one inbound `file_chunk` frame
    ///
    /// `sender_key` is only consulted under [`ChunkPolicy::Encrypted`].
    /// Returns an event once the file is complete or has been rejected.
    pub fn receive_chunk(&mut self, frame: ChunkFrame, sender_key: Option<&SymmetricKey>) -> Option<TransferEvent> {
        let file_id = frame.file_id.clone();
        let file_name = frame.file_name.clone();

        match self.store_chunk(frame, sender_key) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                log::warn!("Transfer: dropping inbound {} '{}': {}", file_id, file_name, e);
                self.inbound.remove(&file_id);
                return Some(TransferEvent::FileRejected {
                    file_name,
                    reason: e.to_string(),
                });
            }
        }

        let assembly = self.inbound.remove(&file_id)?;
        match assembly.expected.verify(&assembly.data) {
            Ok(()) => {
                log::info!(
                    "Transfer: inbound '{}' complete and verified ({} bytes)",
                    assembly.file_name,
                    assembly.total_size
                );
                Some(TransferEvent::FileReady {
                    file_name: assembly.file_name,
                    checksum: assembly.expected,
                    data: assembly.data,
                })
            }
            Err(e) => {
                log::warn!("Transfer: inbound '{}' failed verification: {}", assembly.file_name, e);
                Some(TransferEvent::FileRejected {
                    file_name: assembly.file_name,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Returns Ok(true) when the assembly for this file is complete
    fn store_chunk(&mut self, frame: ChunkFrame, sender_key: Option<&SymmetricKey>) -> Result<bool> {
        if frame.total_size > MAX_INBOUND_SIZE {
            return Err(SyncError::Protocol(format!(
                "{} bytes exceeds the inbound limit",
                frame.total_size
            )));
        }
        if frame.offset % self.chunk_size as u64 != 0 {
            return Err(SyncError::Protocol(format!(
                "offset {} is not chunk aligned",
                frame.offset
            )));
        }

        let payload = match self.policy {
            ChunkPolicy::Raw => frame.chunk,
            ChunkPolicy::Encrypted => {
                let key = sender_key.ok_or_else(|| {
                    SyncError::KeyLookup(format!(
                        "no key for sender {:?}",
                        frame.sender.as_deref().unwrap_or("?")
                    ))
                })?;
                decrypt_bytes(key, &frame.chunk)?
            }
        };

        if !self.inbound.contains_key(&frame.file_id) {
            if self.inbound.len() >= self.max_inbound_transfers {
                return Err(SyncError::Protocol(format!(
                    "{} inbound transfers already in progress",
                    self.inbound.len()
                )));
            }
            let reserved = self.reserved_bytes();
            if reserved + frame.total_size > self.max_inbound_reserved {
                return Err(SyncError::Protocol(format!(
                    "{} bytes would exceed the inbound budget ({} reserved)",
                    frame.total_size, reserved
                )));
            }
            let expected = Checksum::from_hex(&frame.checksum)?;
            log::debug!(
                "Transfer: receiving {} '{}' ({} bytes)",
                frame.file_id,
                frame.file_name,
                frame.total_size
            );
            self.inbound.insert(
                frame.file_id.clone(),
                Assembly::new(frame.file_name.clone(), frame.total_size, self.chunk_size, expected),
            );
        }

        let chunk_size = self.chunk_size;
        let Some(assembly) = self.inbound.get_mut(&frame.file_id) else {
            return Err(SyncError::UnknownTransfer(frame.file_id));
        };
        if assembly.total_size != frame.total_size {
            return Err(SyncError::Protocol(format!(
                "total size changed from {} to {}",
                assembly.total_size, frame.total_size
            )));
        }

        let index = (frame.offset / chunk_size as u64) as usize;
        if !assembly.insert(index, frame.offset as usize, &payload)? {
            log::debug!("Transfer: duplicate chunk {} for {}", index, frame.file_id);
            return Ok(false);
        }
        Ok(assembly.is_complete())
    }

    /// Hold a sealed chunk until its sender's key resolves
    ///
    /// Over the parked budget the whole file is rejected instead.
    pub fn park_chunk(&mut self, frame: ChunkFrame) -> Option<TransferEvent> {
        if self.parked_bytes + frame.chunk.len() > MAX_PARKED_BYTES {
            log::warn!(
                "Transfer: no room to park chunk of {} '{}'",
                frame.file_id,
                frame.file_name
            );
            self.drop_file(&frame.file_id);
            return Some(TransferEvent::FileRejected {
                file_name: frame.file_name,
                reason: SyncError::KeyLookup("too many chunks waiting for a key".into()).to_string(),
            });
        }
        log::debug!(
            "Transfer: parking chunk at {} of {} until {:?} has a key",
            frame.offset,
            frame.file_id,
            frame.sender
        );
        self.parked_bytes += frame.chunk.len();
        self.parked.push(frame);
        None
    }

    /// Parked chunks from `sender`, in arrival order
    pub fn take_parked(&mut self, sender: &str) -> Vec<ChunkFrame> {
        self.take_parked_where(|c| c.sender.as_deref() == Some(sender))
    }

    /// Reject every file with parked chunks from a sender matching `gone`
    pub fn reject_parked(&mut self, gone: impl Fn(&str) -> bool) -> Vec<TransferEvent> {
        let dropped = self.take_parked_where(|c| c.sender.as_deref().map_or(true, &gone));
        let mut seen = BTreeSet::new();
        let mut events = Vec::new();
        for chunk in dropped {
            if !seen.insert(chunk.file_id.clone()) {
                continue;
            }
            self.inbound.remove(&chunk.file_id);
            let sender = chunk.sender.as_deref().unwrap_or("?");
            log::warn!("Transfer: dropping {} '{}': no key for {}", chunk.file_id, chunk.file_name, sender);
            events.push(TransferEvent::FileRejected {
                file_name: chunk.file_name,
                reason: SyncError::KeyLookup(format!("no key for sender {:?}", sender)).to_string(),
            });
        }
        events
    }

    fn take_parked_where(&mut self, pick: impl Fn(&ChunkFrame) -> bool) -> Vec<ChunkFrame> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|c| pick(c));
        self.parked = kept;
        self.parked_bytes = self.parked.iter().map(|c| c.chunk.len()).sum();
        taken
    }

    fn drop_file(&mut self, file_id: &str) {
        self.inbound.remove(file_id);
        self.take_parked_where(|c| c.file_id == file_id);
    }

    /// Connection lost: abort uploads and drop partial inbound files
    pub fn abort_all(&mut self, reason: &str) -> Vec<TransferEvent> {
        let mut events: Vec<TransferEvent> = self
            .uploads
            .drain(..)
            .map(|u| u.failed(SyncError::TransferAborted(reason.to_string()).to_string()))
            .collect();
        let mut dropped: BTreeSet<String> = BTreeSet::new();
        events.extend(self.inbound.drain().map(|(file_id, a)| {
            dropped.insert(file_id);
            TransferEvent::FileRejected {
                file_name: a.file_name,
                reason: SyncError::TransferAborted(reason.to_string()).to_string(),
            }
        }));
        for chunk in self.take_parked_where(|_| true) {
            if dropped.insert(chunk.file_id) {
                events.push(TransferEvent::FileRejected {
                    file_name: chunk.file_name,
                    reason: SyncError::TransferAborted(reason.to_string()).to_string(),
                });
            }
        }
        if !events.is_empty() {
            log::info!("Transfer: aborted {} transfer(s): {}", events.len(), reason);
        }
        events
    }
}
