//! Per-sender key cache with debounced, batched directory lookups.
//!
//! `require()` never blocks: it either hands back a resolved key or marks
//! the sender as pending. Unknown senders collect in a pending set; each new
//! one restarts a short single-shot debounce timer, and when the timer fires
//! the whole set goes to the key directory as one batch. A burst of unknown
//! authors (history replay) therefore costs one round trip.
//!
//! Resolved keys are immutable for the lifetime of the cache. Failed or
//! partial batches are not retried here; the next `require()` for a missing
//! sender queues it again.

use crate::crypto::SymmetricKey;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Correlates a directory request with its result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(pub u64);

/// Remote key directory (lookup collaborator)
///
/// `request` must not block. The answer is delivered later through
/// [`crate::SyncEngine::keys_resolved`] with the same `BatchId`.
pub trait KeyDirectory {
    fn request(&mut self, batch: BatchId, usernames: BTreeSet<String>);
}

/// Result of a cache lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    Ready(SymmetricKey),
    /// Queued or already in flight
    Pending,
}

/// Single-shot restartable timer
#[derive(Debug)]
struct Debounce {
    quiet: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            deadline: None,
        }
    }

    fn restart(&mut self, now: Instant) {
        self.deadline = Some(now + self.quiet);
    }

    fn cancel(&mut self) {
        self.deadline = None;
    }

    /// True once when the deadline has passed
    fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

pub struct KeyCache {
    resolved: HashMap<String, SymmetricKey>,
    /// Waiting for the debounce window to close
    pending: BTreeSet<String>,
    /// Sent to the directory, awaiting the answer
    in_flight: HashMap<BatchId, BTreeSet<String>>,
    debounce: Debounce,
    next_batch: u64,
}

impl KeyCache {
    pub fn new(debounce: Duration) -> Self {
        Self {
            resolved: HashMap::new(),
            pending: BTreeSet::new(),
            in_flight: HashMap::new(),
            debounce: Debounce::new(debounce),
            next_batch: 0,
        }
    }

    /// Seed a key (e.g. our own). Returns false if the user already had one.
    pub fn insert(&mut self, username: &str, key: SymmetricKey) -> bool {
        if self.resolved.contains_key(username) {
            return false;
        }
        self.resolved.insert(username.to_string(), key);
        true
    }

    pub fn get(&self, username: &str) -> Option<&SymmetricKey> {
        self.resolved.get(username)
    }

    pub fn is_pending(&self, username: &str) -> bool {
        self.pending.contains(username) || self.in_flight.values().any(|s| s.contains(username))
    }

    /// Look up a sender's key, queueing a lookup if it is unknown
    pub fn require(&mut self, username: &str, now: Instant) -> KeyStatus {
        if let Some(key) = self.resolved.get(username) {
            return KeyStatus::Ready(key.clone());
        }
        if self.is_pending(username) {
            return KeyStatus::Pending;
        }
        self.pending.insert(username.to_string());
        self.debounce.restart(now);
        log::debug!(
            "KeyCache: queued '{}' ({} pending)",
            username,
            self.pending.len()
        );
        KeyStatus::Pending
    }

    /// When the debounce timer fires, take the pending set as one batch
    pub fn flush(&mut self, now: Instant) -> Option<(BatchId, BTreeSet<String>)> {
        if !self.debounce.fire(now) || self.pending.is_empty() {
            return None;
        }
        let batch = BatchId(self.next_batch);
        self.next_batch += 1;
        let names = std::mem::take(&mut self.pending);
        self.in_flight.insert(batch, names.clone());
        log::debug!("KeyCache: batch {} requesting {} key(s)", batch.0, names.len());
        Some((batch, names))
    }

    /// Next instant at which `flush` will produce a batch
    pub fn next_deadline(&self) -> Option<Instant> {
        self.debounce.deadline
    }

    /// Merge a directory answer. Returns the senders that became resolved.
    ///
    /// Requested senders missing from the answer (or the whole batch on
    /// error) leave the in-flight set, so a later `require()` asks again.
    pub fn complete(
        &mut self,
        batch: BatchId,
        result: Result<HashMap<String, SymmetricKey>, String>,
    ) -> Vec<String> {
        let requested = self.in_flight.remove(&batch).unwrap_or_default();
        let keys = match result {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!(
                    "KeyCache: batch {} failed for {} sender(s): {}",
                    batch.0,
                    requested.len(),
                    e
                );
                return Vec::new();
            }
        };

        let mut newly = Vec::new();
        for (username, key) in keys {
            if self.insert(&username, key) {
                newly.push(username);
            }
        }
        newly.sort();

        let missing = requested
            .iter()
            .filter(|u| !self.resolved.contains_key(u.as_str()))
            .count();
        if missing > 0 {
            log::info!("KeyCache: batch {} left {} sender(s) without a key", batch.0, missing);
        }
        newly
    }

    /// Drop queued and in-flight work (session teardown). Resolved keys stay.
    pub fn cancel(&mut self) {
        self.debounce.cancel();
        self.pending.clear();
        self.in_flight.clear();
    }
}
