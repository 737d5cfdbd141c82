//! Hub
//!
//! The single task that owns every registry: live connections, pending
//! invitations, lobbies and tournaments. Connections talk to it through a
//! [`HubHandle`]; timers talk to it through [`HubSignal`]s. All registry
//! mutations happen inside [`Hub::run`], one message at a time.
//!
//! Lobby handling lives in `lobby.rs` and tournament handling in
//! `tournament.rs`; both extend [`Hub`] directly.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::game::{Command, GameConfig, UserId};
use crate::network::connection::{ConnId, ConnectionHandle};
use crate::network::lobby::{Invitation, Lobby};
use crate::network::persistence::Persistence;
use crate::network::protocol::{self, ChatMessage, GameCommandRequest, Inbound, ServerEvent};
use crate::network::tournament::{Tournament, TournamentConfig};

/// Hub tunables.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each hub input channel.
    pub channel_capacity: usize,
    /// Delay between a departure and its `USER_DISCONNECTED` broadcast.
    pub departure_delay: Duration,
    /// Match tick period.
    pub tick_interval: Duration,
    /// Match rules.
    pub game: GameConfig,
    /// Tournament timing.
    pub tournament: TournamentConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            departure_delay: Duration::from_millis(200),
            tick_interval: Duration::from_millis(16),
            game: GameConfig::default(),
            tournament: TournamentConfig::default(),
        }
    }
}

/// Messages the hub sends itself from timer tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubSignal {
    /// One tournament clock tick.
    TournamentClock(String),
    /// Departure delay for a user has elapsed.
    AnnounceDeparture(UserId),
}

/// Sending side of the hub's input channels.
#[derive(Debug, Clone)]
pub struct HubHandle {
    register: mpsc::Sender<ConnectionHandle>,
    unregister: mpsc::Sender<(UserId, ConnId)>,
    inbound: mpsc::Sender<(UserId, String)>,
}

impl HubHandle {
    /// Register a connection. `false` once the hub is gone.
    pub async fn register(&self, handle: ConnectionHandle) -> bool {
        self.register.send(handle).await.is_ok()
    }

    /// Unregister a connection. Stale `(user, conn)` pairs are ignored.
    pub async fn unregister(&self, user: UserId, conn: ConnId) -> bool {
        self.unregister.send((user, conn)).await.is_ok()
    }

    /// Forward a raw inbound frame.
    pub async fn inbound(&self, user: UserId, text: String) -> bool {
        self.inbound.send((user, text)).await.is_ok()
    }
}

struct HubReceivers {
    register: mpsc::Receiver<ConnectionHandle>,
    unregister: mpsc::Receiver<(UserId, ConnId)>,
    inbound: mpsc::Receiver<(UserId, String)>,
    signals: mpsc::UnboundedReceiver<HubSignal>,
}

/// Registry owner.
pub struct Hub {
    pub(crate) config: HubConfig,
    pub(crate) clients: HashMap<UserId, ConnectionHandle>,
    pub(crate) invitations: HashMap<Uuid, Invitation>,
    pub(crate) lobbies: HashMap<Uuid, Lobby>,
    pub(crate) tournaments: HashMap<String, Tournament>,
    pub(crate) persistence: Persistence,
    pub(crate) signals: mpsc::UnboundedSender<HubSignal>,
    evictions: Vec<(UserId, ConnId)>,
    receivers: Option<HubReceivers>,
}

impl Hub {
    /// Create a hub and the handle connections use to reach it.
    pub fn new(config: HubConfig, persistence: Persistence) -> (Self, HubHandle) {
        let capacity = config.channel_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let hub = Self {
            config,
            clients: HashMap::new(),
            invitations: HashMap::new(),
            lobbies: HashMap::new(),
            tournaments: HashMap::new(),
            persistence,
            signals: signal_tx,
            evictions: Vec::new(),
            receivers: Some(HubReceivers {
                register: register_rx,
                unregister: unregister_rx,
                inbound: inbound_rx,
                signals: signal_rx,
            }),
        };
        let handle = HubHandle {
            register: register_tx,
            unregister: unregister_tx,
            inbound: inbound_tx,
        };
        (hub, handle)
    }

    /// Process hub input until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut rx) = self.receivers.take() else {
            error!("Hub already running");
            return;
        };
        info!("Hub started");

        loop {
            tokio::select! {
                Some(handle) = rx.register.recv() => self.register(handle),
                Some((user, conn)) = rx.unregister.recv() => self.unregister(user, conn),
                Some((user, text)) = rx.inbound.recv() => self.dispatch(user, &text),
                Some(signal) = rx.signals.recv() => self.handle_signal(signal),
                _ = shutdown.recv() => {
                    info!("Hub shutting down");
                    break;
                }
                else => break,
            }
        }

        self.close_all();
    }

    // =========================================================================
    // REGISTRY
    // =========================================================================

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Whether `user` is registered with an open connection.
    pub fn is_reachable(&self, user: UserId) -> bool {
        self.clients.get(&user).is_some_and(ConnectionHandle::is_open)
    }

    /// Add a connection. A second connection for the same user replaces the
    /// first.
    pub fn register(&mut self, handle: ConnectionHandle) {
        let user = handle.user_id();
        self.rebind_matches(&handle);
        let replaced = self.clients.insert(user, handle);

        match &replaced {
            Some(old) => {
                info!(user, old_conn = old.conn_id(), "Connection replaced");
                old.close();
            }
            None => info!(user, online = self.clients.len(), "User connected"),
        }

        let mut others: Vec<UserId> = self.clients.keys().copied().filter(|&id| id != user).collect();
        others.sort_unstable();
        self.send_to(user, &ServerEvent::OnlineUsers { users_online: others.clone() });
        if replaced.is_none() {
            self.send_to_many(&others, &ServerEvent::NewConnection { user });
        }

        self.drain_evictions();
    }

    /// Remove a connection if `conn` is still the user's current one.
    pub fn unregister(&mut self, user: UserId, conn: ConnId) {
        if self.remove_client(user, conn) {
            info!(user, "User disconnected");
        }
        self.drain_evictions();
    }

    fn remove_client(&mut self, user: UserId, conn: ConnId) -> bool {
        match self.clients.get(&user) {
            Some(handle) if handle.conn_id() == conn => {}
            _ => return false,
        }
        if let Some(handle) = self.clients.remove(&user) {
            handle.close();
        }

        self.invitations
            .retain(|_, inv| inv.sender != user && inv.receiver != user);
        self.lobby_departure(user);
        self.tournament_departure(user);
        self.schedule_departure_notice(user);
        true
    }

    fn schedule_departure_notice(&self, user: UserId) {
        let signals = self.signals.clone();
        let delay = self.config.departure_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(HubSignal::AnnounceDeparture(user));
        });
    }

    fn drain_evictions(&mut self) {
        while let Some((user, conn)) = self.evictions.pop() {
            if self.remove_client(user, conn) {
                warn!(user, conn, "Evicted unresponsive connection");
            }
        }
    }

    fn close_all(&mut self) {
        for (_, lobby) in self.lobbies.drain() {
            lobby.destroy();
        }
        for (_, tournament) in self.tournaments.drain() {
            tournament.destroy();
        }
        for (_, handle) in self.clients.drain() {
            handle.close();
        }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Send one event to one user. Failed sends schedule an eviction.
    pub(crate) fn send_to(&mut self, user: UserId, event: &ServerEvent) {
        self.send_to_many(&[user], event);
    }

    /// Send one event to several users, serializing once.
    pub(crate) fn send_to_many(&mut self, users: &[UserId], event: &ServerEvent) {
        if users.is_empty() {
            return;
        }
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize event: {}", e);
                return;
            }
        };
        for &user in users {
            let Some(handle) = self.clients.get(&user) else {
                continue;
            };
            if !handle.send_text(text.clone()) {
                self.evictions.push((user, handle.conn_id()));
            }
        }
    }

    fn broadcast(&mut self, event: &ServerEvent) {
        let everyone: Vec<UserId> = self.clients.keys().copied().collect();
        self.send_to_many(&everyone, event);
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Route one inbound frame from `user`.
    ///
    /// The connection's user id is authoritative; ids claimed inside the
    /// payload are only used to name the *other* party.
    pub fn dispatch(&mut self, user: UserId, text: &str) {
        if !self.clients.contains_key(&user) {
            debug!(user, "Frame from unregistered user dropped");
            return;
        }

        match protocol::decode(text) {
            Ok(Inbound::Chat(msg)) => self.handle_chat(user, msg),
            Ok(Inbound::Lobby(request)) => self.handle_lobby(user, request),
            Ok(Inbound::Game(request)) => self.handle_game_command(user, request),
            Ok(Inbound::Tournament(request)) => self.handle_tournament(user, request),
            Err(e) => warn!(user, "Dropping frame: {}", e),
        }

        self.drain_evictions();
    }

    /// Apply a timer signal.
    pub fn handle_signal(&mut self, signal: HubSignal) {
        match signal {
            HubSignal::TournamentClock(id) => self.on_tournament_clock(&id),
            HubSignal::AnnounceDeparture(user) => {
                // back already under a new connection
                if !self.clients.contains_key(&user) {
                    self.broadcast(&ServerEvent::UserDisconnected { user });
                }
            }
        }
        self.drain_evictions();
    }

    fn handle_chat(&mut self, user: UserId, mut msg: ChatMessage) {
        msg.sender_id = user;
        let recipients = if msg.receiver_id == user {
            vec![user]
        } else {
            vec![user, msg.receiver_id]
        };
        self.send_to_many(&recipients, &ServerEvent::Chat(msg.clone()));
        self.persistence.store_chat(&msg);
    }

    fn handle_game_command(&mut self, user: UserId, request: GameCommandRequest) {
        let Some(command) = Command::parse(&request.key_pressed) else {
            debug!(user, key = %request.key_pressed, "Unknown key");
            return;
        };
        let game = request
            .lobby_id
            .and_then(|id| self.lobbies.get(&id))
            .and_then(|lobby| lobby.game.as_ref());
        match game {
            Some(game) if game.has_player(user) => {
                game.handle_command(user, command);
            }
            _ => debug!(user, lobby = ?request.lobby_id, "Game command without a running match"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::Value;

    pub(crate) struct TestClient {
        pub handle: ConnectionHandle,
        pub rx: mpsc::Receiver<String>,
    }

    impl TestClient {
        /// Everything queued so far, parsed.
        pub fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(text) = self.rx.try_recv() {
                out.push(serde_json::from_str(&text).unwrap());
            }
            out
        }

        /// Queued events of one type.
        pub fn take(&mut self, kind: &str) -> Vec<Value> {
            self.drain().into_iter().filter(|v| v["type"] == kind).collect()
        }
    }

    pub(crate) fn test_hub() -> Hub {
        let config = HubConfig {
            departure_delay: Duration::from_millis(1),
            tournament: TournamentConfig {
                semifinal_countdown_secs: 1,
                final_countdown_secs: 1,
                completion_grace_secs: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        Hub::new(config, Persistence::disabled()).0
    }

    pub(crate) fn connect(hub: &mut Hub, user: UserId) -> TestClient {
        connect_with_capacity(hub, user, 4096)
    }

    pub(crate) fn connect_with_capacity(hub: &mut Hub, user: UserId, capacity: usize) -> TestClient {
        let (handle, rx) = ConnectionHandle::new(user, capacity);
        hub.register(handle.clone());
        TestClient { handle, rx }
    }

    pub(crate) fn send(hub: &mut Hub, user: UserId, value: Value) {
        hub.dispatch(user, &value.to_string());
    }

    #[tokio::test]
    async fn test_register_announces_presence() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        let online = a.take("ONLINE_USERS");
        assert_eq!(online[0]["usersOnline"], serde_json::json!([]));

        let mut b = connect(&mut hub, 2);
        assert_eq!(b.take("ONLINE_USERS")[0]["usersOnline"], serde_json::json!([1]));
        assert_eq!(a.take("NEW_CONNECTION")[0]["user"], 2);
    }

    #[tokio::test]
    async fn test_duplicate_identity_replaces_connection() {
        let mut hub = test_hub();
        let first = connect(&mut hub, 1);
        let second = connect(&mut hub, 1);
        assert!(!first.handle.is_open());
        assert!(second.handle.is_open());

        // stale unregister is ignored
        hub.unregister(1, first.handle.conn_id());
        assert!(hub.is_reachable(1));

        hub.unregister(1, second.handle.conn_id());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_departure_notice_skips_returning_user() {
        let mut hub = test_hub();
        let mut watcher = connect(&mut hub, 1);
        let leaver = connect(&mut hub, 2);
        watcher.drain();

        hub.unregister(2, leaver.handle.conn_id());
        hub.handle_signal(HubSignal::AnnounceDeparture(2));
        assert_eq!(watcher.take("USER_DISCONNECTED")[0]["user"], 2);

        let _back = connect(&mut hub, 2);
        watcher.drain();
        hub.handle_signal(HubSignal::AnnounceDeparture(2));
        assert!(watcher.take("USER_DISCONNECTED").is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_evicts_exactly_once() {
        let mut hub = test_hub();
        let mut sender = connect(&mut hub, 1);
        // ONLINE_USERS fills the one slot
        let slow = connect_with_capacity(&mut hub, 2, 1);
        sender.drain();

        let chat = serde_json::json!({"type": "CHAT", "data": "hi", "receiverId": 2});
        send(&mut hub, 1, chat.clone());
        assert!(!slow.handle.is_open());
        assert!(!hub.is_reachable(2));
        assert_eq!(hub.connection_count(), 1);

        // further traffic and the pump's own unregister are no-ops
        send(&mut hub, 1, chat);
        hub.unregister(2, slow.handle.conn_id());
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(sender.take("CHAT").len(), 2);
    }

    #[tokio::test]
    async fn test_chat_uses_connection_identity() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        let mut b = connect(&mut hub, 2);
        send(
            &mut hub,
            1,
            serde_json::json!({"type": "CHAT", "data": "gg", "senderId": 99, "receiverId": 2}),
        );
        let got = b.take("CHAT");
        assert_eq!(got[0]["senderId"], 1);
        assert_eq!(got[0]["data"], "gg");
        assert_eq!(a.take("CHAT").len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_dropped() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        a.drain();
        hub.dispatch(1, "{not json");
        hub.dispatch(1, r#"{"type":"HELLO"}"#);
        hub.dispatch(1, r#"{"type":"GAME_EVENT","keyPressed":"UP"}"#);
        assert!(a.drain().is_empty());
        assert!(hub.is_reachable(1));
    }
}
