//! Connection lifecycle state machine
//!
//! IDLE → CONNECTING → HANDSHAKING → READY → (CLOSING | FAILED) → IDLE
//!
//! Owns the transport handle and every connection timer (handshake timeout,
//! heartbeat interval, pong deadline, retry backoff). Timers are plain
//! deadlines fired from `tick(now)`; all of them are cancelled through one
//! teardown path. Each transport gets a fresh [`ConnectionId`], and events
//! from any id other than the live one are ignored, so at most one transport
//! is live per session.
//!
//! Close handling:
//! - 1000/1001 are clean: no reconnect.
//! - Anything else schedules a reconnect with exponential backoff, up to
//!   `max_retries`. Past that the state is FAILED with no timer armed and only
//!   an explicit `reconnect()` starts over.
//! - A missed pong force-closes the socket and reconnects immediately,
//!   counting one retry.

use crate::config::Timings;
use crate::error::{Result, SyncError};
use crate::protocol::ClientFrame;
use std::time::{Duration, Instant};

/// WebSocket close codes the manager produces or interprets
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    /// No close frame (socket dropped, connect failed)
    pub const ABNORMAL: u16 = 1006;
    pub const INIT_TIMEOUT: u16 = 4000;
    pub const HEARTBEAT_TIMEOUT: u16 = 4001;

    pub fn is_clean(code: u16) -> bool {
        code == NORMAL || code == GOING_AWAY
    }
}

/// Identifies one transport object (one socket)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Message-oriented transport (WebSocket in production)
///
/// None of these may block. `open` reports back through
/// `SyncEngine::transport_opened` / `transport_closed` (a failed connect is a
/// close with [`close_code::ABNORMAL`]). Once that close has been reported,
/// `release` is called for the id, live or stale, and the transport drops
/// whatever it still holds for it.
pub trait Transport {
    fn open(&mut self, id: ConnectionId);
    fn send(&mut self, id: ConnectionId, text: String) -> Result<()>;
    fn close(&mut self, id: ConnectionId, code: u16, reason: &str);
    fn release(&mut self, id: ConnectionId);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Handshaking,
    Ready,
    /// Clean teardown requested, waiting for the close event
    Closing,
    /// Lost or refused; a retry may be armed (see `is_terminal`)
    Failed,
}

/// Notifications for the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Reconnecting { attempt: u32, delay: Duration },
    /// Retry budget spent; terminal until `reconnect()`
    GaveUp { attempts: u32 },
}

#[derive(Debug, Default)]
struct Timers {
    handshake: Option<Instant>,
    heartbeat: Option<Instant>,
    pong: Option<Instant>,
    retry: Option<Instant>,
}

impl Timers {
    /// Timers that only make sense while a socket is live
    fn cancel_socket_timers(&mut self) {
        self.handshake = None;
        self.heartbeat = None;
        self.pong = None;
    }

    fn cancel_all(&mut self) {
        self.cancel_socket_timers();
        self.retry = None;
    }

    fn next(&self) -> Option<Instant> {
        [self.handshake, self.heartbeat, self.pong, self.retry]
            .into_iter()
            .flatten()
            .min()
    }
}

fn due(deadline: Option<Instant>, now: Instant) -> bool {
    matches!(deadline, Some(d) if now >= d)
}

/// Handshake responses seen since transport-open
#[derive(Debug, Default)]
struct Handshake {
    history: bool,
    presence: bool,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    username: String,
    timings: Timings,
    state: ConnectionState,
    /// The live transport, if any
    current: Option<ConnectionId>,
    next_id: u64,
    retry_count: u32,
    timers: Timers,
    handshake: Handshake,
    events: Vec<ConnectionEvent>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, username: impl Into<String>, timings: Timings) -> Self {
        Self {
            transport,
            username: username.into(),
            timings,
            state: ConnectionState::Idle,
            current: None,
            next_id: 1,
            retry_count: 0,
            timers: Timers::default(),
            handshake: Handshake::default(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn current_id(&self) -> Option<ConnectionId> {
        self.current
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// FAILED with no reconnect armed
    pub fn is_terminal(&self) -> bool {
        self.state == ConnectionState::Failed && self.timers.retry.is_none()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Earliest armed timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next()
    }

    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!("Connection: {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.push(ConnectionEvent::StateChanged(state));
        }
    }

    /// Open a transport unless one is already being set up or in use
    ///
    /// Returns true if a new transport was opened.
    pub fn connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Handshaking | ConnectionState::Ready => {
                log::debug!("Connection: connect() ignored in {:?}", self.state);
                return false;
            }
            ConnectionState::Closing => {
                // Teardown in progress; that socket is on its way out
                self.current = None;
            }
            ConnectionState::Idle | ConnectionState::Failed => {}
        }

        self.timers.retry = None;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.current = Some(id);
        self.set_state(ConnectionState::Connecting);
        log::info!(
            "Connection: opening transport #{} (retry {}/{})",
            id.0,
            self.retry_count,
            self.timings.max_retries
        );
        self.transport.open(id);
        true
    }

    /// Caller-initiated reconnect: resets the retry budget
    pub fn reconnect(&mut self) -> bool {
        self.retry_count = 0;
        self.timers.retry = None;
        self.connect()
    }

    /// Transport reported open: start the handshake by joining `room`
    ///
    /// Returns false if the open was for a stale transport.
    pub fn on_open(&mut self, id: ConnectionId, room: &str, now: Instant) -> bool {
        if self.current != Some(id) || self.state != ConnectionState::Connecting {
            log::debug!("Connection: ignoring open for stale transport #{}", id.0);
            return false;
        }

        self.set_state(ConnectionState::Handshaking);
        self.handshake = Handshake::default();
        self.timers.handshake = Some(now + self.timings.handshake_timeout);

        let frames = [
            ClientFrame::Join {
                username: self.username.clone(),
                chatroom: room.to_string(),
            },
            ClientFrame::FetchHistory {
                chatroom: room.to_string(),
            },
            ClientFrame::GetOnlineUsers {
                username: self.username.clone(),
            },
            ClientFrame::GetChannels,
        ];
        for frame in &frames {
            if let Err(e) = self.send_on(id, frame) {
                // The transport will report the close; the handshake timer covers the rest
                log::warn!("Connection: handshake send '{}' failed: {}", frame.label(), e);
                break;
            }
        }
        true
    }

    /// History for the current room arrived
    pub fn note_history(&mut self, now: Instant) {
        self.handshake.history = true;
        self.maybe_complete_handshake(now);
    }

    /// Presence list arrived
    pub fn note_presence(&mut self, now: Instant) {
        self.handshake.presence = true;
        self.maybe_complete_handshake(now);
    }

    fn maybe_complete_handshake(&mut self, now: Instant) {
        if self.state != ConnectionState::Handshaking
            || !self.handshake.history
            || !self.handshake.presence
        {
            return;
        }
        self.timers.handshake = None;
        self.retry_count = 0;
        self.timers.heartbeat = Some(now + self.timings.heartbeat_interval);
        self.set_state(ConnectionState::Ready);
        log::info!("Connection: ready");
    }

    pub fn on_pong(&mut self) {
        #[cfg(feature = "verbose-network")]
        log::debug!("Connection: pong");
        self.timers.pong = None;
    }

    /// Transport reported closed (or failed to open)
    pub fn on_close(&mut self, id: ConnectionId, code: u16, reason: &str, now: Instant) {
        self.transport.release(id);
        if self.current != Some(id) {
            log::debug!("Connection: ignoring close for stale transport #{}", id.0);
            return;
        }
        self.current = None;
        self.timers.cancel_socket_timers();

        log::info!(
            "Connection: transport #{} closed (code {}, '{}') in {:?}",
            id.0,
            code,
            reason,
            self.state
        );

        if self.state == ConnectionState::Closing || close_code::is_clean(code) {
            self.set_state(ConnectionState::Idle);
            return;
        }

        self.set_state(ConnectionState::Failed);
        self.schedule_retry(now, None);
    }

    /// Arm the retry timer, or give up when the budget is spent
    fn schedule_retry(&mut self, now: Instant, delay: Option<Duration>) {
        if self.timers.retry.is_some() {
            return;
        }
        if self.retry_count >= self.timings.max_retries {
            log::warn!(
                "Connection: giving up after {} reconnect attempts",
                self.retry_count
            );
            self.events.push(ConnectionEvent::GaveUp {
                attempts: self.retry_count,
            });
            return;
        }
        self.retry_count += 1;
        let delay = delay.unwrap_or_else(|| self.timings.retry_delay(self.retry_count));
        self.timers.retry = Some(now + delay);
        log::info!(
            "Connection: reconnect {}/{} in {:?}",
            self.retry_count,
            self.timings.max_retries,
            delay
        );
        self.events.push(ConnectionEvent::Reconnecting {
            attempt: self.retry_count,
            delay,
        });
    }

    /// Close the live transport ourselves and mark the session failed
    fn force_close(&mut self, code: u16, reason: &str) {
        self.timers.cancel_socket_timers();
        if let Some(id) = self.current.take() {
            self.transport.close(id, code, reason);
        }
        self.set_state(ConnectionState::Failed);
    }

    /// Fire due timers
    pub fn tick(&mut self, now: Instant) {
        if due(self.timers.handshake, now) {
            self.timers.handshake = None;
            log::warn!("Connection: initialization timeout");
            self.force_close(close_code::INIT_TIMEOUT, "Initialization timeout");
            self.schedule_retry(now, None);
        }

        if due(self.timers.pong, now) {
            self.timers.pong = None;
            log::warn!("Connection: no pong within {:?}", self.timings.pong_deadline);
            self.liveness_failure(now);
        }

        if due(self.timers.heartbeat, now) && self.state == ConnectionState::Ready {
            self.timers.heartbeat = Some(now + self.timings.heartbeat_interval);
            self.heartbeat(now);
        }

        if due(self.timers.retry, now) {
            self.timers.retry = None;
            self.connect();
        }
    }

    fn heartbeat(&mut self, now: Instant) {
        let Some(id) = self.current else {
            return;
        };
        #[cfg(feature = "verbose-network")]
        log::debug!("Connection: ping");

        let ping = ClientFrame::Ping {
            username: self.username.clone(),
        };
        if let Err(e) = self.send_on(id, &ping) {
            log::warn!("Connection: ping failed: {}", e);
            self.liveness_failure(now);
            return;
        }
        self.timers.pong = Some(now + self.timings.pong_deadline);

        // Presence and channel refresh ride along with the ping
        let refresh = [
            ClientFrame::GetOnlineUsers {
                username: self.username.clone(),
            },
            ClientFrame::GetChannels,
        ];
        for frame in &refresh {
            if let Err(e) = self.send_on(id, frame) {
                log::debug!("Connection: '{}' refresh failed: {}", frame.label(), e);
            }
        }
    }

    /// Dead connection: drop the socket and reconnect right away
    fn liveness_failure(&mut self, now: Instant) {
        self.force_close(close_code::HEARTBEAT_TIMEOUT, "Heartbeat timeout");
        self.schedule_retry(now, Some(Duration::ZERO));
        if due(self.timers.retry, now) {
            self.timers.retry = None;
            self.connect();
        }
    }

    fn send_on(&mut self, id: ConnectionId, frame: &ClientFrame) -> Result<()> {
        let text = frame.encode()?;
        #[cfg(feature = "verbose-network")]
        log::debug!("Connection: TX {} ({} bytes)", frame.label(), text.len());
        self.transport.send(id, text)
    }

    /// Send an application frame; only allowed while READY
    pub fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        match (self.state, self.current) {
            (ConnectionState::Ready, Some(id)) => self.send_on(id, frame),
            _ => {
                log::debug!(
                    "Connection: dropped '{}' in {:?}",
                    frame.label(),
                    self.state
                );
                Err(SyncError::NotConnected)
            }
        }
    }

    /// Cancel every timer and close the transport cleanly
    pub fn shutdown(&mut self) {
        self.timers.cancel_all();
        match self.current {
            Some(id) => {
                self.set_state(ConnectionState::Closing);
                self.transport.close(id, close_code::NORMAL, "Client shutdown");
            }
            None => self.set_state(ConnectionState::Idle),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every transport call
    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub opens: Vec<ConnectionId>,
        pub sent: Vec<(ConnectionId, String)>,
        pub closes: Vec<(ConnectionId, u16)>,
        pub released: Vec<ConnectionId>,
        pub fail_sends: bool,
    }

    impl MockTransport {
        pub fn sent_types(&self) -> Vec<String> {
            self.sent
                .iter()
                .map(|(_, text)| {
                    let v: serde_json::Value = serde_json::from_str(text).unwrap();
                    v.get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("untyped")
                        .to_string()
                })
                .collect()
        }
    }

    impl Transport for MockTransport {
        fn open(&mut self, id: ConnectionId) {
            self.opens.push(id);
        }

        fn send(&mut self, id: ConnectionId, text: String) -> Result<()> {
            if self.fail_sends {
                return Err(SyncError::Transport("socket gone".into()));
            }
            self.sent.push((id, text));
            Ok(())
        }

        fn close(&mut self, id: ConnectionId, code: u16, _reason: &str) {
            self.closes.push((id, code));
        }

        fn release(&mut self, id: ConnectionId) {
            self.released.push(id);
        }
    }

    fn manager() -> ConnectionManager<MockTransport> {
        ConnectionManager::new(MockTransport::default(), "alice", Timings::default())
    }

    fn ready(m: &mut ConnectionManager<MockTransport>, now: Instant) {
        m.connect();
        let id = m.current_id().unwrap();
        m.on_open(id, "general", now);
        m.note_history(now);
        m.note_presence(now);
        assert_eq!(m.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut m = manager();
        assert!(m.connect());
        assert!(!m.connect());
        assert_eq!(m.transport().opens.len(), 1);

        let id = m.current_id().unwrap();
        m.on_open(id, "general", Instant::now());
        assert!(!m.connect());
        assert_eq!(m.transport().opens.len(), 1);
    }

    #[test]
    fn test_handshake_frames_and_completion() {
        let t0 = Instant::now();
        let mut m = manager();
        m.connect();
        let id = m.current_id().unwrap();
        m.on_open(id, "general", t0);

        assert_eq!(m.state(), ConnectionState::Handshaking);
        assert_eq!(
            m.transport().sent_types(),
            vec!["untyped", "fetch_history", "get_online_users", "get_channels"]
        );
        let join: serde_json::Value = serde_json::from_str(&m.transport().sent[0].1).unwrap();
        assert_eq!(join["username"], "alice");
        assert_eq!(join["chatroom"], "general");

        // Application frames are refused until READY
        assert!(matches!(
            m.send(&ClientFrame::GetChannels),
            Err(SyncError::NotConnected)
        ));

        m.note_history(t0);
        assert_eq!(m.state(), ConnectionState::Handshaking);
        m.note_presence(t0);
        assert_eq!(m.state(), ConnectionState::Ready);
        assert!(m.send(&ClientFrame::GetChannels).is_ok());
        assert_eq!(m.next_deadline(), Some(t0 + Duration::from_secs(30)));
    }

    #[test]
    fn test_handshake_timeout_forces_close_once() {
        let t0 = Instant::now();
        let mut m = manager();
        m.connect();
        let id = m.current_id().unwrap();
        m.on_open(id, "general", t0);

        m.tick(t0 + Duration::from_secs(5));
        assert_eq!(m.transport().closes, vec![(id, close_code::INIT_TIMEOUT)]);
        assert_eq!(m.state(), ConnectionState::Failed);
        assert_eq!(m.retry_count(), 1);
        assert!(!m.is_terminal());

        // The socket's own close event arrives late and must not add a retry
        m.on_close(id, close_code::INIT_TIMEOUT, "Initialization timeout", t0);
        assert_eq!(m.retry_count(), 1);

        m.tick(t0 + Duration::from_secs(7));
        assert_eq!(m.transport().opens.len(), 2);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_missed_pong_reconnects_exactly_once() {
        let t0 = Instant::now();
        let mut m = manager();
        ready(&mut m, t0);
        let first = m.current_id().unwrap();

        m.tick(t0 + Duration::from_secs(30));
        assert!(m.transport().sent_types().contains(&"ping".to_string()));
        assert_eq!(m.retry_count(), 0);

        m.tick(t0 + Duration::from_secs(35));
        assert_eq!(m.transport().closes, vec![(first, close_code::HEARTBEAT_TIMEOUT)]);
        assert_eq!(m.retry_count(), 1);
        assert_eq!(m.transport().opens.len(), 2);
        assert_eq!(m.state(), ConnectionState::Connecting);

        // Nothing else is pending
        m.tick(t0 + Duration::from_secs(120));
        assert_eq!(m.transport().opens.len(), 2);
        assert_eq!(m.retry_count(), 1);
    }

    #[test]
    fn test_pong_cancels_deadline() {
        let t0 = Instant::now();
        let mut m = manager();
        ready(&mut m, t0);

        m.tick(t0 + Duration::from_secs(30));
        m.on_pong();
        m.tick(t0 + Duration::from_secs(36));
        assert!(m.transport().closes.is_empty());
        assert_eq!(m.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_retry_budget_is_bounded() {
        let t0 = Instant::now();
        let mut m = manager();
        m.connect();
        let mut now = t0;

        for attempt in 1..=5 {
            let id = m.current_id().unwrap();
            m.on_close(id, close_code::ABNORMAL, "refused", now);
            assert_eq!(m.retry_count(), attempt);
            now += Duration::from_secs(60);
            m.tick(now);
        }
        assert_eq!(m.transport().opens.len(), 6);

        let id = m.current_id().unwrap();
        m.on_close(id, close_code::ABNORMAL, "refused", now);
        assert!(m.is_terminal());
        assert!(m
            .take_events()
            .contains(&ConnectionEvent::GaveUp { attempts: 5 }));

        m.tick(now + Duration::from_secs(3600));
        assert_eq!(m.transport().opens.len(), 6);

        // Manual retry starts over
        assert!(m.reconnect());
        assert_eq!(m.retry_count(), 0);
        assert_eq!(m.transport().opens.len(), 7);
    }

    #[test]
    fn test_backoff_grows() {
        let t0 = Instant::now();
        let mut m = manager();
        m.connect();
        let id = m.current_id().unwrap();
        m.on_close(id, close_code::ABNORMAL, "", t0);
        assert_eq!(m.next_deadline(), Some(t0 + Duration::from_secs(1)));

        m.tick(t0 + Duration::from_secs(1));
        let id = m.current_id().unwrap();
        m.on_close(id, close_code::ABNORMAL, "", t0 + Duration::from_secs(1));
        assert_eq!(m.next_deadline(), Some(t0 + Duration::from_secs(3)));
    }

    #[test]
    fn test_clean_close_does_not_retry() {
        let t0 = Instant::now();
        let mut m = manager();
        ready(&mut m, t0);
        let id = m.current_id().unwrap();
        m.on_close(id, close_code::GOING_AWAY, "server restart", t0);
        assert_eq!(m.state(), ConnectionState::Idle);
        assert!(m.next_deadline().is_none());
    }

    #[test]
    fn test_shutdown_is_clean() {
        let t0 = Instant::now();
        let mut m = manager();
        ready(&mut m, t0);
        let id = m.current_id().unwrap();

        m.shutdown();
        assert_eq!(m.state(), ConnectionState::Closing);
        assert_eq!(m.transport().closes, vec![(id, close_code::NORMAL)]);
        assert!(m.next_deadline().is_none());

        m.on_close(id, close_code::NORMAL, "", t0);
        assert_eq!(m.state(), ConnectionState::Idle);
        assert_eq!(m.retry_count(), 0);
        m.tick(t0 + Duration::from_secs(600));
        assert_eq!(m.transport().opens.len(), 1);
    }

    #[test]
    fn test_stale_events_ignored() {
        let t0 = Instant::now();
        let mut m = manager();
        m.connect();
        let stale = m.current_id().unwrap();
        m.on_close(stale, close_code::ABNORMAL, "", t0);
        m.tick(t0 + Duration::from_secs(1));
        let live = m.current_id().unwrap();
        assert_ne!(stale, live);

        assert!(!m.on_open(stale, "general", t0));
        assert_eq!(m.state(), ConnectionState::Connecting);
        m.on_close(stale, close_code::ABNORMAL, "", t0);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.retry_count(), 1);
    }

    #[test]
    fn test_every_reported_close_releases_the_transport() {
        let t0 = Instant::now();
        let mut m = manager();
        for attempt in 1..=3u64 {
            m.reconnect();
            let id = m.current_id().unwrap();
            m.on_close(id, close_code::ABNORMAL, "refused", t0);
            assert_eq!(m.transport().released.len() as u64, attempt);
        }

        // A close arriving after a forced close is stale but still released
        ready(&mut m, t0);
        let forced = m.current_id().unwrap();
        m.tick(t0 + Duration::from_secs(30));
        m.tick(t0 + Duration::from_secs(35));
        assert_ne!(m.current_id(), Some(forced));
        m.on_close(forced, close_code::HEARTBEAT_TIMEOUT, "", t0 + Duration::from_secs(35));
        assert_eq!(m.transport().released.last(), Some(&forced));
    }

    #[test]
    fn test_failed_ping_counts_as_liveness_failure() {
        let t0 = Instant::now();
        let mut m = manager();
        ready(&mut m, t0);
        m.transport_mut().fail_sends = true;

        m.tick(t0 + Duration::from_secs(30));
        assert_eq!(m.retry_count(), 1);
        assert_eq!(m.transport().opens.len(), 2);
    }
}
