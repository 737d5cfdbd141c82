//! Lobbies
//!
//! A lobby pairs an inviter (`sender`) with an invitee (`receiver`), runs the
//! ready handshake and hosts exactly one match once both are ready.
//!
//! ```text
//! INVITED -> CREATED -> READY-HANDSHAKE -> RUNNING -> DESTROYED
//! ```
//!
//! Tournament lobbies skip the handshake: both flags start set and the
//! tournament clock decides when the match begins.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::game::{Game, GameConfig, MatchOutcome, UserId};
use crate::network::connection::{ConnId, ConnectionHandle};
use crate::network::hub::Hub;
use crate::network::persistence::Persistence;
use crate::network::protocol::{
    GameFrame, LobbyEventBody, LobbyPayload, LobbyRequest, LobbyUserState, ServerEvent,
};

/// Reason attached to `LOBBY_DESTROYED` when a participant disappears.
pub const PLAYER_LEFT: &str = "A player has left the lobby";

/// Lobby request failures, reported as `LOBBY_ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    /// Request needs a lobby id.
    #[error("Missing lobby id")]
    MissingLobbyId,
    /// Invitee is not connected.
    #[error("User {0} is not online")]
    UserOffline(UserId),
    /// Inviting oneself.
    #[error("Cannot invite yourself")]
    SelfInvite,
    /// No such lobby.
    #[error("Lobby {0} does not exist")]
    UnknownLobby(Uuid),
    /// No such pending invitation.
    #[error("No pending invitation {0}")]
    UnknownInvitation(Uuid),
    /// Caller is not one of the two participants.
    #[error("Not a participant of lobby {0}")]
    NotParticipant(Uuid),
    /// Tournament lobbies belong to the bracket.
    #[error("Lobby {0} belongs to a tournament")]
    TournamentLobby(Uuid),
}

impl LobbyError {
    /// Lobby the error concerns, if any.
    pub fn lobby_id(&self) -> Option<Uuid> {
        match self {
            LobbyError::UnknownLobby(id)
            | LobbyError::UnknownInvitation(id)
            | LobbyError::NotParticipant(id)
            | LobbyError::TournamentLobby(id) => Some(*id),
            _ => None,
        }
    }
}

/// An invitation waiting for an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invitation {
    /// Inviter.
    pub sender: UserId,
    /// Invitee.
    pub receiver: UserId,
    /// Game-mode flag chosen by the inviter.
    pub is_game_mode: bool,
}

/// One lobby.
#[derive(Debug)]
pub struct Lobby {
    /// Lobby id.
    pub id: Uuid,
    /// Inviter, plays on the left.
    pub sender: UserId,
    /// Invitee, plays on the right.
    pub receiver: UserId,
    /// `[sender, receiver]` ready flags.
    pub ready: [bool; 2],
    /// When the match was created.
    pub pregame_at: Option<DateTime<Utc>>,
    /// Match, once both are ready. Never removed.
    pub game: Option<Arc<Game>>,
    /// Part of a tournament bracket.
    pub is_tournament: bool,
    /// Cosmetic game-mode flag.
    pub is_game_mode: bool,
    /// Where the tick task sends frames.
    pub audience: MatchAudience,
    destroy: broadcast::Sender<()>,
}

impl Lobby {
    /// Fresh lobby, nobody ready.
    pub fn new(id: Uuid, sender: UserId, receiver: UserId) -> Self {
        let (destroy, _) = broadcast::channel(1);
        Self {
            id,
            sender,
            receiver,
            ready: [false, false],
            pregame_at: None,
            game: None,
            is_tournament: false,
            is_game_mode: false,
            audience: MatchAudience::default(),
            destroy,
        }
    }

    /// Bracket lobby, both flags already set.
    pub fn for_tournament(id: Uuid, player1: UserId, player2: UserId) -> Self {
        Self {
            ready: [true, true],
            is_tournament: true,
            ..Self::new(id, player1, player2)
        }
    }

    /// `[sender, receiver]`.
    pub fn participants(&self) -> [UserId; 2] {
        [self.sender, self.receiver]
    }

    /// Whether `user` is one of the two participants.
    pub fn has_participant(&self, user: UserId) -> bool {
        self.sender == user || self.receiver == user
    }

    /// Set `user`'s ready flag. `false` if `user` isn't a participant.
    pub fn set_ready(&mut self, user: UserId, ready: bool) -> bool {
        let slot = if user == self.sender {
            0
        } else if user == self.receiver {
            1
        } else {
            return false;
        };
        self.ready[slot] = ready;
        true
    }

    /// Both flags set.
    pub fn both_ready(&self) -> bool {
        self.ready[0] && self.ready[1]
    }

    /// Create the match. Happens at most once per lobby.
    pub fn start_game(&mut self, config: GameConfig) -> Option<Arc<Game>> {
        if self.game.is_some() || !self.both_ready() {
            return None;
        }
        let game = Arc::new(Game::new(self.sender, self.receiver, config));
        self.pregame_at = Some(Utc::now());
        self.game = Some(game.clone());
        Some(game)
    }

    /// Outcome of the hosted match, once it has ended.
    pub fn outcome(&self) -> Option<MatchOutcome> {
        self.game.as_ref()?.outcome()
    }

    /// Receiver for the destroy signal.
    pub fn subscribe_destroy(&self) -> broadcast::Receiver<()> {
        self.destroy.subscribe()
    }

    /// Release the destroy signal. Tick tasks stop on it.
    pub fn destroy(&self) {
        let _ = self.destroy.send(());
    }

    /// Wire body describing this lobby.
    pub fn body(&self, user_id: UserId) -> LobbyEventBody {
        LobbyEventBody {
            lobby_id: self.id,
            user_id,
            sender: LobbyUserState {
                id: self.sender,
                is_ready: self.ready[0],
            },
            receiver: LobbyUserState {
                id: self.receiver,
                is_ready: self.ready[1],
            },
            is_tournament_game: self.is_tournament,
            is_game_mode: self.is_game_mode,
            error: None,
        }
    }
}

// =============================================================================
// MATCH TICK TASK
// =============================================================================

/// Current outbound handles of a match's players.
///
/// Shared between the lobby and its tick task. The hub rebinds a player's
/// handle when they reconnect under the same identity.
#[derive(Debug, Clone, Default)]
pub struct MatchAudience(Arc<Mutex<Vec<ConnectionHandle>>>);

impl MatchAudience {
    /// Use `handle` for its user from now on.
    pub fn bind(&self, handle: ConnectionHandle) {
        let mut handles = self.0.lock();
        handles.retain(|h| h.user_id() != handle.user_id());
        handles.push(handle);
    }

    /// Users currently bound, with their connection ids.
    pub fn bound(&self) -> Vec<(UserId, ConnId)> {
        self.0.lock().iter().map(|h| (h.user_id(), h.conn_id())).collect()
    }

    fn send(&self, text: &str) {
        for handle in self.0.lock().iter() {
            // failures close the handle; the hub evicts it when its pump exits
            handle.send_text(text.to_string());
        }
    }
}

/// Everything the tick task needs, detached from the hub.
pub(crate) struct MatchTask {
    pub lobby_id: Uuid,
    pub game: Arc<Game>,
    pub audience: MatchAudience,
    pub is_tournament: bool,
    pub tick_interval: Duration,
    pub destroy: broadcast::Receiver<()>,
    pub persistence: Persistence,
}

impl MatchTask {
    fn frame(&self) -> GameFrame {
        let [player1_id, player2_id] = self.game.players();
        GameFrame {
            lobby_id: self.lobby_id,
            state: self.game.snapshot(),
            player1_id,
            player2_id,
            is_tournament_game: self.is_tournament,
        }
    }

    fn broadcast(&self, event: &ServerEvent) {
        if let Ok(text) = event.to_json() {
            self.audience.send(&text);
        }
    }
}

/// Advance the match every tick until it ends or the lobby is destroyed.
///
/// The final result is stored exactly once, whichever way the loop exits.
pub(crate) async fn run_match(mut task: MatchTask) {
    let mut ticker = interval(task.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = task.destroy.recv() => {
                debug!(lobby = %task.lobby_id, "Match task destroyed");
                break;
            }
            _ = ticker.tick() => {
                task.game.update(Instant::now());
                if task.game.is_active() {
                    task.broadcast(&ServerEvent::GameEvent(task.frame()));
                } else {
                    task.broadcast(&ServerEvent::GameFinished(task.frame()));
                    info!(lobby = %task.lobby_id, outcome = ?task.game.outcome(), "Match finished");
                    break;
                }
            }
        }
    }

    if let Some(outcome) = task.game.take_result() {
        task.persistence.store_match(&outcome);
    }
}

// =============================================================================
// HUB: LOBBY PROTOCOL
// =============================================================================

impl Hub {
    pub(crate) fn handle_lobby(&mut self, caller: UserId, request: LobbyRequest) {
        let result = match request {
            LobbyRequest::Invite(p) => self.lobby_invite(caller, p),
            LobbyRequest::Accept(p) => self.lobby_accept(caller, p),
            LobbyRequest::Deny(p) => self.lobby_deny(caller, p),
            LobbyRequest::Terminate(p) => self.lobby_terminate(caller, p),
            LobbyRequest::SpecialMode(p) => self.lobby_special_mode(caller, p),
            LobbyRequest::Ready(p) => self.lobby_set_ready(caller, p, true),
            LobbyRequest::Unready(p) => self.lobby_set_ready(caller, p, false),
        };

        if let Err(err) = result {
            debug!(user = caller, "Lobby request refused: {}", err);
            self.send_to(
                caller,
                &ServerEvent::LobbyError {
                    lobby_id: err.lobby_id(),
                    error: err.to_string(),
                },
            );
        }
    }

    fn lobby_invite(&mut self, caller: UserId, p: LobbyPayload) -> Result<(), LobbyError> {
        let invitee = p.receiver.id;
        if invitee == caller {
            return Err(LobbyError::SelfInvite);
        }
        if !self.is_reachable(invitee) {
            return Err(LobbyError::UserOffline(invitee));
        }

        let id = Uuid::new_v4();
        self.invitations.insert(
            id,
            Invitation {
                sender: caller,
                receiver: invitee,
                is_game_mode: p.is_game_mode,
            },
        );

        let body = LobbyEventBody {
            lobby_id: id,
            user_id: caller,
            sender: LobbyUserState { id: caller, is_ready: false },
            receiver: LobbyUserState { id: invitee, is_ready: false },
            is_game_mode: p.is_game_mode,
            ..Default::default()
        };
        self.send_to(caller, &ServerEvent::LobbyInvitationSent(body.clone()));
        self.send_to(invitee, &ServerEvent::LobbyInvitationReceived(body));
        info!(lobby = %id, from = caller, to = invitee, "Invitation sent");
        Ok(())
    }

    fn lobby_accept(&mut self, caller: UserId, p: LobbyPayload) -> Result<(), LobbyError> {
        let id = p.lobby_id.ok_or(LobbyError::MissingLobbyId)?;
        match self.invitations.get(&id) {
            Some(inv) if inv.receiver == caller => {}
            Some(_) => return Err(LobbyError::NotParticipant(id)),
            None => return Err(LobbyError::UnknownInvitation(id)),
        }
        let Some(inv) = self.invitations.remove(&id) else {
            return Err(LobbyError::UnknownInvitation(id));
        };
        if !self.is_reachable(inv.sender) {
            return Err(LobbyError::UserOffline(inv.sender));
        }

        let mut lobby = Lobby::new(id, inv.sender, inv.receiver);
        lobby.is_game_mode = inv.is_game_mode;
        let body = lobby.body(caller);
        let participants = lobby.participants();
        self.lobbies.insert(id, lobby);

        self.send_to_many(&participants, &ServerEvent::LobbyCreated(body));
        info!(lobby = %id, sender = inv.sender, receiver = inv.receiver, "Lobby created");
        Ok(())
    }

    fn lobby_deny(&mut self, caller: UserId, p: LobbyPayload) -> Result<(), LobbyError> {
        let id = p.lobby_id.ok_or(LobbyError::MissingLobbyId)?;
        let inv = match self.invitations.get(&id) {
            Some(inv) if inv.sender == caller || inv.receiver == caller => *inv,
            Some(_) => return Err(LobbyError::NotParticipant(id)),
            None => return Err(LobbyError::UnknownInvitation(id)),
        };
        self.invitations.remove(&id);

        let body = LobbyEventBody {
            lobby_id: id,
            user_id: caller,
            sender: LobbyUserState { id: inv.sender, is_ready: false },
            receiver: LobbyUserState { id: inv.receiver, is_ready: false },
            is_game_mode: inv.is_game_mode,
            ..Default::default()
        };
        self.send_to_many(&[inv.sender, inv.receiver], &ServerEvent::LobbyDenied(body));
        info!(lobby = %id, by = caller, "Invitation denied");
        Ok(())
    }

    fn lobby_terminate(&mut self, caller: UserId, p: LobbyPayload) -> Result<(), LobbyError> {
        let id = self.participant_lobby(caller, p.lobby_id)?;
        if self.lobbies.get(&id).is_some_and(|l| l.is_tournament) {
            return Err(LobbyError::TournamentLobby(id));
        }
        // terminating mid-match concedes it
        self.teardown_lobby(id, Some(caller), None);
        Ok(())
    }

    fn lobby_special_mode(&mut self, caller: UserId, p: LobbyPayload) -> Result<(), LobbyError> {
        let id = self.participant_lobby(caller, p.lobby_id)?;
        if !self.ensure_reachable(id) {
            return Ok(());
        }
        let Some(lobby) = self.lobbies.get_mut(&id) else {
            return Err(LobbyError::UnknownLobby(id));
        };
        lobby.is_game_mode = p.is_game_mode;
        let body = lobby.body(caller);
        let participants = lobby.participants();
        self.send_to_many(&participants, &ServerEvent::LobbySpecialModeToggled(body));
        Ok(())
    }

    fn lobby_set_ready(&mut self, caller: UserId, p: LobbyPayload, ready: bool) -> Result<(), LobbyError> {
        let id = self.participant_lobby(caller, p.lobby_id)?;
        if !self.ensure_reachable(id) {
            return Ok(());
        }
        let Some(lobby) = self.lobbies.get_mut(&id) else {
            return Err(LobbyError::UnknownLobby(id));
        };
        // bracket lobbies stay ready and start on the tournament clock
        if lobby.is_tournament {
            return Err(LobbyError::TournamentLobby(id));
        }
        lobby.set_ready(caller, ready);
        let body = lobby.body(caller);
        let participants = lobby.participants();
        let should_start = lobby.both_ready() && lobby.game.is_none();
        self.send_to_many(&participants, &ServerEvent::LobbyPlayerStatus(body));

        if should_start {
            self.send_to_many(&participants, &ServerEvent::GameStart { lobby_id: id });
            self.start_lobby_match(id);
        }
        Ok(())
    }

    /// Lobby `lobby_id` if it exists and `caller` is in it.
    fn participant_lobby(&self, caller: UserId, lobby_id: Option<Uuid>) -> Result<Uuid, LobbyError> {
        let id = lobby_id.ok_or(LobbyError::MissingLobbyId)?;
        let lobby = self.lobbies.get(&id).ok_or(LobbyError::UnknownLobby(id))?;
        if !lobby.has_participant(caller) {
            return Err(LobbyError::NotParticipant(id));
        }
        Ok(id)
    }

    /// Tear the lobby down if a participant is gone. `true` if both are here.
    fn ensure_reachable(&mut self, id: Uuid) -> bool {
        let Some(lobby) = self.lobbies.get(&id) else {
            return false;
        };
        let missing = lobby
            .participants()
            .into_iter()
            .find(|&user| !self.is_reachable(user));
        match missing {
            Some(user) => {
                self.teardown_lobby(id, Some(user), Some(PLAYER_LEFT));
                false
            }
            None => true,
        }
    }

    /// Create the lobby's match and spawn its tick task.
    ///
    /// Returns `false` if the lobby is gone or already has a match.
    pub(crate) fn start_lobby_match(&mut self, id: Uuid) -> bool {
        let config = self.config.game.clone();
        let Some(lobby) = self.lobbies.get_mut(&id) else {
            return false;
        };
        let Some(game) = lobby.start_game(config) else {
            return false;
        };

        for user in lobby.participants() {
            if let Some(handle) = self.clients.get(&user) {
                lobby.audience.bind(handle.clone());
            }
        }
        let task = MatchTask {
            lobby_id: id,
            game,
            audience: lobby.audience.clone(),
            is_tournament: lobby.is_tournament,
            tick_interval: self.config.tick_interval,
            destroy: lobby.subscribe_destroy(),
            persistence: self.persistence.clone(),
        };
        info!(lobby = %id, players = ?lobby.participants(), "Match started");
        tokio::spawn(run_match(task));
        true
    }

    /// Remove a lobby and tell both participants.
    ///
    /// `leaver` concedes a running match before the destroy signal fires, so
    /// the result is still stored.
    pub(crate) fn teardown_lobby(&mut self, id: Uuid, leaver: Option<UserId>, error: Option<&str>) {
        let Some(lobby) = self.lobbies.remove(&id) else {
            return;
        };
        if let (Some(game), Some(leaver)) = (&lobby.game, leaver) {
            game.player_left(leaver);
        }

        let mut body = lobby.body(leaver.unwrap_or_default());
        body.error = error.map(str::to_string);
        self.send_to_many(&lobby.participants(), &ServerEvent::LobbyDestroyed(body));
        lobby.destroy();
        info!(lobby = %id, ?leaver, "Lobby destroyed");
    }

    /// Point running matches of `handle`'s user at this connection.
    pub(crate) fn rebind_matches(&mut self, handle: &ConnectionHandle) {
        let user = handle.user_id();
        for lobby in self.lobbies.values() {
            if lobby.game.is_some() && lobby.has_participant(user) {
                lobby.audience.bind(handle.clone());
                debug!(lobby = %lobby.id, user, conn = handle.conn_id(), "Match rebound to new connection");
            }
        }
    }

    /// Disconnect cascade for regular lobbies.
    pub(crate) fn lobby_departure(&mut self, user: UserId) {
        let affected: Vec<Uuid> = self
            .lobbies
            .values()
            .filter(|l| !l.is_tournament && l.has_participant(user))
            .map(|l| l.id)
            .collect();
        for id in affected {
            self.teardown_lobby(id, Some(user), Some(PLAYER_LEFT));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::hub::tests::{connect, send, test_hub, TestClient};
    use serde_json::{json, Value};

    fn invite(hub: &mut Hub, from: UserId, to: UserId) -> String {
        send(hub, from, json!({"type": "LOBBY_INVITATION_TO_FRIEND", "receiver": {"id": to}}));
        let id = hub
            .invitations
            .iter()
            .find(|(_, inv)| inv.sender == from && inv.receiver == to)
            .map(|(id, _)| id.to_string())
            .unwrap();
        id
    }

    fn open_lobby(hub: &mut Hub, a: UserId, b: UserId) -> String {
        let id = invite(hub, a, b);
        send(hub, b, json!({"type": "LOBBY_ACCEPT_FROM_FRIEND", "lobbyId": id}));
        id
    }

    fn lobby<'a>(hub: &'a Hub, id: &str) -> &'a Lobby {
        hub.lobbies.get(&Uuid::parse_str(id).unwrap()).unwrap()
    }

    fn only(client: &mut TestClient, kind: &str) -> Value {
        let mut events = client.take(kind);
        assert_eq!(events.len(), 1, "expected one {kind}");
        events.remove(0)
    }

    #[tokio::test]
    async fn test_invite_accept_ready_starts_match() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        let mut b = connect(&mut hub, 2);

        let id = invite(&mut hub, 1, 2);
        assert_eq!(only(&mut a, "LOBBY_INVITATION_TO_FRIEND")["lobbyId"], id);
        let received = only(&mut b, "LOBBY_INVITATION_FROM_FRIEND");
        assert_eq!(received["sender"]["id"], 1);

        send(&mut hub, 2, json!({"type": "LOBBY_ACCEPT_FROM_FRIEND", "lobbyId": id}));
        let created = only(&mut a, "LOBBY_CREATED");
        assert_eq!(created["sender"]["isReady"], false);
        assert_eq!(created["receiver"]["isReady"], false);
        only(&mut b, "LOBBY_CREATED");

        send(&mut hub, 1, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        let status = only(&mut b, "LOBBY_PLAYER_STATUS");
        assert_eq!(status["sender"]["isReady"], true);
        assert_eq!(status["receiver"]["isReady"], false);
        assert!(lobby(&hub, &id).game.is_none());

        send(&mut hub, 2, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        a.drain();
        assert!(lobby(&hub, &id).game.is_some());
        only(&mut b, "GAME_START");
    }

    #[tokio::test]
    async fn test_ready_toggle_does_not_start() {
        let mut hub = test_hub();
        let _a = connect(&mut hub, 1);
        let _b = connect(&mut hub, 2);
        let id = open_lobby(&mut hub, 1, 2);

        send(&mut hub, 1, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        send(&mut hub, 1, json!({"type": "LOBBY_PLAYER_UNREADY_STATUS", "lobbyId": id}));
        send(&mut hub, 2, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        assert!(lobby(&hub, &id).game.is_none());
        assert_eq!(lobby(&hub, &id).ready, [false, true]);
    }

    #[tokio::test]
    async fn test_game_created_once() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        let _b = connect(&mut hub, 2);
        let id = open_lobby(&mut hub, 1, 2);
        send(&mut hub, 1, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        send(&mut hub, 2, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        let first = lobby(&hub, &id).game.clone().unwrap();

        send(&mut hub, 2, json!({"type": "LOBBY_PLAYER_UNREADY_STATUS", "lobbyId": id}));
        send(&mut hub, 2, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        let second = lobby(&hub, &id).game.clone().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(a.take("GAME_START").len(), 1);
    }

    #[tokio::test]
    async fn test_invite_offline_user_errors() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        send(&mut hub, 1, json!({"type": "LOBBY_INVITATION_TO_FRIEND", "receiver": {"id": 9}}));
        let err = only(&mut a, "LOBBY_ERROR");
        assert_eq!(err["error"], "User 9 is not online");
        assert!(hub.invitations.is_empty());
    }

    #[tokio::test]
    async fn test_accept_requires_invitee() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        let _b = connect(&mut hub, 2);
        let id = invite(&mut hub, 1, 2);

        // the inviter cannot accept their own invitation
        send(&mut hub, 1, json!({"type": "LOBBY_ACCEPT_FROM_FRIEND", "lobbyId": id}));
        assert_eq!(only(&mut a, "LOBBY_ERROR")["lobbyId"], id);
        assert!(hub.lobbies.is_empty());
    }

    #[tokio::test]
    async fn test_accept_after_inviter_left_creates_nothing() {
        let mut hub = test_hub();
        let a = connect(&mut hub, 1);
        let mut b = connect(&mut hub, 2);
        let id = invite(&mut hub, 1, 2);

        a.handle.close();
        send(&mut hub, 2, json!({"type": "LOBBY_ACCEPT_FROM_FRIEND", "lobbyId": id}));
        assert!(hub.lobbies.is_empty());
        assert_eq!(only(&mut b, "LOBBY_ERROR")["error"], "User 1 is not online");
    }

    #[tokio::test]
    async fn test_deny_notifies_both() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        let mut b = connect(&mut hub, 2);
        let id = invite(&mut hub, 1, 2);
        send(&mut hub, 2, json!({"type": "LOBBY_DENY_FROM_FRIEND", "lobbyId": id}));
        only(&mut a, "LOBBY_DENIED");
        only(&mut b, "LOBBY_DENIED");
        assert!(hub.invitations.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_destroys_lobby() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        let mut b = connect(&mut hub, 2);
        let id = open_lobby(&mut hub, 1, 2);
        let mut destroyed = lobby(&hub, &id).subscribe_destroy();

        send(&mut hub, 2, json!({"type": "LOBBY_TERMINATE", "lobbyId": id}));
        assert!(hub.lobbies.is_empty());
        only(&mut a, "LOBBY_DESTROYED");
        only(&mut b, "LOBBY_DESTROYED");
        assert!(destroyed.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_stranger_cannot_touch_lobby() {
        let mut hub = test_hub();
        let _a = connect(&mut hub, 1);
        let _b = connect(&mut hub, 2);
        let mut c = connect(&mut hub, 3);
        let id = open_lobby(&mut hub, 1, 2);

        send(&mut hub, 3, json!({"type": "LOBBY_TERMINATE", "lobbyId": id}));
        assert_eq!(only(&mut c, "LOBBY_ERROR")["error"], format!("Not a participant of lobby {id}"));
        assert_eq!(hub.lobbies.len(), 1);
    }

    #[tokio::test]
    async fn test_special_mode_rebroadcast() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        let _b = connect(&mut hub, 2);
        let id = open_lobby(&mut hub, 1, 2);
        send(
            &mut hub,
            2,
            json!({"type": "LOBBY_SPECIAL_MODE_TOGGLED", "lobbyId": id, "isGameMode": true}),
        );
        assert_eq!(only(&mut a, "LOBBY_SPECIAL_MODE_TOGGLED")["isGameMode"], true);
    }

    #[tokio::test]
    async fn test_unreachable_peer_tears_down() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        let b = connect(&mut hub, 2);
        let id = open_lobby(&mut hub, 1, 2);

        b.handle.close();
        send(&mut hub, 1, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        let destroyed = only(&mut a, "LOBBY_DESTROYED");
        assert_eq!(destroyed["error"], PLAYER_LEFT);
        assert!(a.take("LOBBY_PLAYER_STATUS").is_empty());
        assert!(hub.lobbies.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_mid_match_forfeits() {
        let mut hub = test_hub();
        let mut a = connect(&mut hub, 1);
        let b = connect(&mut hub, 2);
        let id = open_lobby(&mut hub, 1, 2);
        send(&mut hub, 1, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        send(&mut hub, 2, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        let game = lobby(&hub, &id).game.clone().unwrap();

        hub.unregister(2, b.handle.conn_id());
        assert!(hub.lobbies.is_empty());
        assert_eq!(only(&mut a, "LOBBY_DESTROYED")["error"], PLAYER_LEFT);

        let outcome = game.outcome().unwrap();
        assert_eq!(outcome.winner, Some(1));
        assert_eq!(outcome.score, [GameConfig::default().winning_score, 0]);
    }

    #[tokio::test]
    async fn test_game_commands_reach_the_match() {
        let mut hub = test_hub();
        let _a = connect(&mut hub, 1);
        let _b = connect(&mut hub, 2);
        let id = open_lobby(&mut hub, 1, 2);
        send(&mut hub, 1, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        send(&mut hub, 2, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));

        send(&mut hub, 2, json!({"type": "GAME_EVENT", "lobbyId": id, "keyPressed": "DOWN"}));
        let game = lobby(&hub, &id).game.clone().unwrap();
        assert_eq!(game.snapshot().paddles[1].direction, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_task_finishes_and_stops() {
        let (a, mut rx_a) = ConnectionHandle::new(1, 4096);
        let audience = MatchAudience::default();
        audience.bind(a);
        let game = Arc::new(Game::new(1, 2, GameConfig::default()));
        let (destroy_tx, destroy) = broadcast::channel(1);
        let task = tokio::spawn(run_match(MatchTask {
            lobby_id: Uuid::new_v4(),
            game: game.clone(),
            audience: audience.clone(),
            is_tournament: false,
            tick_interval: Duration::from_millis(16),
            destroy,
            persistence: Persistence::disabled(),
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        game.player_left(2);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        drop(destroy_tx);

        let mut kinds = Vec::new();
        while let Ok(text) = rx_a.try_recv() {
            let v: Value = serde_json::from_str(&text).unwrap();
            kinds.push(v["type"].as_str().unwrap().to_string());
        }
        assert!(kinds.iter().any(|k| k == "GAME_EVENT"));
        assert_eq!(kinds.last().map(String::as_str), Some("GAME_FINISHED"));
        // result was handed to persistence already
        assert!(game.take_result().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_mid_match_keeps_receiving_frames() {
        let mut hub = test_hub();
        let _a = connect(&mut hub, 1);
        let first = connect(&mut hub, 2);
        let id = open_lobby(&mut hub, 1, 2);
        send(&mut hub, 1, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));
        send(&mut hub, 2, json!({"type": "LOBBY_PLAYER_READY_STATUS", "lobbyId": id}));

        let mut second = connect(&mut hub, 2);
        assert!(!first.handle.is_open());
        second.drain();
        assert!(lobby(&hub, &id)
            .audience
            .bound()
            .contains(&(2, second.handle.conn_id())));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!second.take("GAME_EVENT").is_empty());
        assert!(lobby(&hub, &id).game.as_ref().unwrap().is_active());
    }
}
