//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is one JSON object with a string `type` discriminator.
//!
//! Decoding is two-phase: [`decode`] peeks at `type`, picks the protocol
//! family (chat, lobby, game, tournament), then decodes the full payload
//! into that family's closed enum. Unknown fields are ignored everywhere.

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::game::{GameState, UserId};

/// Protocol decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not JSON, or no string `type` field.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    /// `type` recognised but the payload didn't fit.
    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        /// Event type that failed.
        kind: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// `type` belongs to no protocol family.
    #[error("unknown event type: {0}")]
    UnknownType(String),
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// First decoding phase: only the discriminator.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: String,
}

/// A decoded client frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// `CHAT`
    Chat(ChatMessage),
    /// `LOBBY_*`
    Lobby(LobbyRequest),
    /// `GAME_EVENT`
    Game(GameCommandRequest),
    /// `TOURNAMENT_*`
    Tournament(TournamentRequest),
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(ProtocolError::MalformedEnvelope)?;
    let kind = envelope.kind;

    let payload = |source| ProtocolError::MalformedPayload {
        kind: kind.clone(),
        source,
    };

    if kind == "CHAT" {
        serde_json::from_str(text).map(Inbound::Chat).map_err(payload)
    } else if kind == "GAME_EVENT" {
        serde_json::from_str(text).map(Inbound::Game).map_err(payload)
    } else if kind.starts_with("LOBBY_") {
        serde_json::from_str(text).map(Inbound::Lobby).map_err(payload)
    } else if kind.starts_with("TOURNAMENT_") {
        serde_json::from_str(text).map(Inbound::Tournament).map_err(payload)
    } else {
        Err(ProtocolError::UnknownType(kind))
    }
}

fn lenient_uuid<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Uuid>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw
        .and_then(|s| Uuid::parse_str(&s).ok())
        .filter(|id| !id.is_nil()))
}

// =============================================================================
// CHAT
// =============================================================================

/// Direct message between two users. Relayed as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message text.
    pub data: String,
    /// Author.
    pub sender_id: UserId,
    /// Recipient.
    pub receiver_id: UserId,
}

// =============================================================================
// LOBBY
// =============================================================================

/// One participant's id and ready flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LobbyUserState {
    /// User id.
    pub id: UserId,
    /// Ready flag.
    pub is_ready: bool,
}

/// Fields shared by every lobby request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LobbyPayload {
    /// Target lobby. Absent on invitations.
    #[serde(deserialize_with = "lenient_uuid")]
    pub lobby_id: Option<Uuid>,
    /// Acting user, as claimed by the client.
    pub user_id: UserId,
    /// Inviter.
    pub sender: LobbyUserState,
    /// Invitee.
    pub receiver: LobbyUserState,
    /// Cosmetic game-mode flag.
    pub is_game_mode: bool,
}

/// Lobby protocol requests.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum LobbyRequest {
    /// Invite `receiver`.
    #[serde(rename = "LOBBY_INVITATION_TO_FRIEND")]
    Invite(LobbyPayload),
    /// Accept a pending invitation.
    #[serde(rename = "LOBBY_ACCEPT_FROM_FRIEND")]
    Accept(LobbyPayload),
    /// Decline a pending invitation.
    #[serde(rename = "LOBBY_DENY_FROM_FRIEND")]
    Deny(LobbyPayload),
    /// Tear the lobby down.
    #[serde(rename = "LOBBY_TERMINATE")]
    Terminate(LobbyPayload),
    /// Toggle the cosmetic game mode.
    #[serde(rename = "LOBBY_SPECIAL_MODE_TOGGLED")]
    SpecialMode(LobbyPayload),
    /// Caller is ready.
    #[serde(rename = "LOBBY_PLAYER_READY_STATUS")]
    Ready(LobbyPayload),
    /// Caller is no longer ready.
    #[serde(rename = "LOBBY_PLAYER_UNREADY_STATUS")]
    Unready(LobbyPayload),
}

impl LobbyRequest {
    /// Payload, whatever the variant.
    pub fn payload(&self) -> &LobbyPayload {
        match self {
            LobbyRequest::Invite(p)
            | LobbyRequest::Accept(p)
            | LobbyRequest::Deny(p)
            | LobbyRequest::Terminate(p)
            | LobbyRequest::SpecialMode(p)
            | LobbyRequest::Ready(p)
            | LobbyRequest::Unready(p) => p,
        }
    }
}

/// Body of most outbound lobby events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyEventBody {
    /// Lobby id.
    pub lobby_id: Uuid,
    /// Acting user.
    pub user_id: UserId,
    /// Inviter and ready flag.
    pub sender: LobbyUserState,
    /// Invitee and ready flag.
    pub receiver: LobbyUserState,
    /// Lobby belongs to a tournament.
    pub is_tournament_game: bool,
    /// Cosmetic game-mode flag.
    pub is_game_mode: bool,
    /// Reason, on teardown caused by a departure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// GAME
// =============================================================================

/// In-match key press.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameCommandRequest {
    /// Lobby hosting the match.
    #[serde(deserialize_with = "lenient_uuid")]
    pub lobby_id: Option<Uuid>,
    /// Acting user, as claimed by the client.
    pub user_id: UserId,
    /// `UP`, `DOWN`, `STOP` or `SPACE`.
    pub key_pressed: String,
}

/// Per-tick state frame (`GAME_EVENT`) and final frame (`GAME_FINISHED`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFrame {
    /// Lobby hosting the match.
    pub lobby_id: Uuid,
    /// Snapshot.
    pub state: GameState,
    /// Left player.
    #[serde(rename = "player1id")]
    pub player1_id: UserId,
    /// Right player.
    #[serde(rename = "player2id")]
    pub player2_id: UserId,
    /// Match belongs to a tournament.
    pub is_tournament_game: bool,
}

// =============================================================================
// TOURNAMENT
// =============================================================================

/// Fields shared by every tournament request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TournamentPayload {
    /// Tournament id, or its short join code.
    pub code: String,
    /// Acting user, as claimed by the client.
    pub user_id: UserId,
}

/// Tournament protocol requests.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum TournamentRequest {
    /// Create a tournament; caller becomes Player1.
    #[serde(rename = "TOURNAMENT_CREATE")]
    Create(TournamentPayload),
    /// Join by id or short code.
    #[serde(rename = "TOURNAMENT_JOIN_WITH_CODE")]
    Join(TournamentPayload),
    /// Leave before the bracket starts.
    #[serde(rename = "TOURNAMENT_LEAVE_WAITING_ROOM")]
    LeaveWaitingRoom(TournamentPayload),
    /// Player1 starts the bracket.
    #[serde(rename = "TOURNAMENT_START")]
    Start(TournamentPayload),
    /// Ask for the bracket descriptors.
    #[serde(rename = "TOURNAMENT_TREE_STATE")]
    TreeState(TournamentPayload),
}

impl TournamentRequest {
    /// Payload, whatever the variant.
    pub fn payload(&self) -> &TournamentPayload {
        match self {
            TournamentRequest::Create(p)
            | TournamentRequest::Join(p)
            | TournamentRequest::LeaveWaitingRoom(p)
            | TournamentRequest::Start(p)
            | TournamentRequest::TreeState(p) => p,
        }
    }
}

/// Roster broadcast (`TOURNAMENT_EVENT` and friends). Empty slots are `0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentRoster {
    /// Tournament id.
    pub code: String,
    /// Acting user.
    pub user_id: UserId,
    /// Slot 1 (creator).
    #[serde(rename = "player1id")]
    pub player1: UserId,
    /// Slot 2.
    #[serde(rename = "player2id")]
    pub player2: UserId,
    /// Slot 3.
    #[serde(rename = "player3id")]
    pub player3: UserId,
    /// Slot 4.
    #[serde(rename = "player4id")]
    pub player4: UserId,
}

/// One bracket match descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketMatch {
    /// First contestant, `0` until known.
    pub player1: UserId,
    /// Second contestant, `0` until known.
    pub player2: UserId,
    /// First contestant's score.
    pub score1: u32,
    /// Second contestant's score.
    pub score2: u32,
    /// Result is final.
    pub is_finished: bool,
    /// Hosting lobby, once created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lobby_id: Option<Uuid>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Sent to a freshly registered user: everyone else online.
    #[serde(rename = "ONLINE_USERS", rename_all = "camelCase")]
    OnlineUsers {
        /// Online user ids, excluding the recipient.
        users_online: Vec<UserId>,
    },
    /// Someone came online.
    #[serde(rename = "NEW_CONNECTION")]
    NewConnection {
        /// Who.
        user: UserId,
    },
    /// Someone went offline.
    #[serde(rename = "USER_DISCONNECTED")]
    UserDisconnected {
        /// Who.
        user: UserId,
    },
    /// Relayed direct message.
    #[serde(rename = "CHAT")]
    Chat(ChatMessage),

    /// Invitation dispatched (to the inviter).
    #[serde(rename = "LOBBY_INVITATION_TO_FRIEND")]
    LobbyInvitationSent(LobbyEventBody),
    /// Invitation received (to the invitee).
    #[serde(rename = "LOBBY_INVITATION_FROM_FRIEND")]
    LobbyInvitationReceived(LobbyEventBody),
    /// Lobby opened.
    #[serde(rename = "LOBBY_CREATED")]
    LobbyCreated(LobbyEventBody),
    /// Invitation declined.
    #[serde(rename = "LOBBY_DENIED")]
    LobbyDenied(LobbyEventBody),
    /// Lobby closed.
    #[serde(rename = "LOBBY_DESTROYED")]
    LobbyDestroyed(LobbyEventBody),
    /// Ready flags changed.
    #[serde(rename = "LOBBY_PLAYER_STATUS")]
    LobbyPlayerStatus(LobbyEventBody),
    /// Game-mode flag changed.
    #[serde(rename = "LOBBY_SPECIAL_MODE_TOGGLED")]
    LobbySpecialModeToggled(LobbyEventBody),
    /// Lobby request refused.
    #[serde(rename = "LOBBY_ERROR", rename_all = "camelCase")]
    LobbyError {
        /// Lobby concerned, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        lobby_id: Option<Uuid>,
        /// Reason.
        error: String,
    },

    /// Both players ready; frames follow.
    #[serde(rename = "GAME_START", rename_all = "camelCase")]
    GameStart {
        /// Lobby hosting the match.
        lobby_id: Uuid,
    },
    /// Per-tick state.
    #[serde(rename = "GAME_EVENT")]
    GameEvent(GameFrame),
    /// Final state.
    #[serde(rename = "GAME_FINISHED")]
    GameFinished(GameFrame),

    /// Tournament created (to the creator).
    #[serde(rename = "TOURNAMENT_CREATE")]
    TournamentCreated(TournamentRoster),
    /// Join accepted (to the joiner).
    #[serde(rename = "TOURNAMENT_JOIN_WITH_CODE")]
    TournamentJoined(TournamentRoster),
    /// Roster changed.
    #[serde(rename = "TOURNAMENT_EVENT")]
    TournamentRosterChanged(TournamentRoster),
    /// Tournament cancelled.
    #[serde(rename = "TOURNAMENT_TERMINATE")]
    TournamentTerminated(TournamentRoster),
    /// Tournament request refused.
    #[serde(rename = "TOURNAMENT_ERROR")]
    TournamentError {
        /// Tournament id or code as given.
        code: String,
        /// Reason.
        error: String,
    },
    /// Countdown tick.
    #[serde(rename = "TOURNAMENT_TIMER", rename_all = "camelCase")]
    TournamentTimer {
        /// Tournament id.
        code: String,
        /// Seconds until the next round.
        remaining_time: u32,
    },
    /// A bracket match is starting.
    #[serde(rename = "TOURNAMENT_GAME", rename_all = "camelCase")]
    TournamentGame {
        /// Tournament id.
        code: String,
        /// Lobby hosting the match.
        lobby_id: Uuid,
    },
    /// Full bracket.
    #[serde(rename = "TOURNAMENT_TREE_STATE")]
    TournamentTreeState {
        /// Tournament id.
        code: String,
        /// First semifinal.
        semi1: BracketMatch,
        /// Second semifinal.
        semi2: BracketMatch,
        /// Final.
        #[serde(rename = "final")]
        final_match: BracketMatch,
    },
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ServerEvent {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::GameConfig;
    use serde_json::{json, Value};
    use std::time::Instant;

    fn to_value(event: &ServerEvent) -> Value {
        serde_json::from_str(&event.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_decode_routes_by_prefix() {
        let chat = decode(r#"{"type":"CHAT","data":"hi","senderId":1,"receiverId":2}"#).unwrap();
        assert!(matches!(chat, Inbound::Chat(ChatMessage { sender_id: 1, .. })));

        let lobby = decode(r#"{"type":"LOBBY_PLAYER_READY_STATUS","userId":3}"#).unwrap();
        assert!(matches!(lobby, Inbound::Lobby(LobbyRequest::Ready(_))));

        let game = decode(r#"{"type":"GAME_EVENT","keyPressed":"UP"}"#).unwrap();
        assert!(matches!(game, Inbound::Game(_)));

        let tn = decode(r#"{"type":"TOURNAMENT_START","code":"abc"}"#).unwrap();
        assert!(matches!(tn, Inbound::Tournament(TournamentRequest::Start(_))));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode("not json"),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode(r#"{"data":"no type"}"#),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"PING"}"#),
            Err(ProtocolError::UnknownType(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"LOBBY_DANCE"}"#),
            Err(ProtocolError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let msg = json!({
            "type": "LOBBY_ACCEPT_FROM_FRIEND",
            "lobbyId": "4a8f3c1e-9b2d-4f6a-8c7e-1d2b3a4c5e6f",
            "sender": {"id": 1, "isReady": false, "avatar": "x.png"},
            "receiver": {"id": 2},
            "somethingElse": [1, 2, 3]
        });
        let Inbound::Lobby(LobbyRequest::Accept(p)) = decode(&msg.to_string()).unwrap() else {
            panic!("wrong family");
        };
        assert!(p.lobby_id.is_some());
        assert_eq!(p.sender.id, 1);
        assert_eq!(p.receiver.id, 2);
    }

    #[test]
    fn test_blank_lobby_id_is_none() {
        let Inbound::Lobby(req) =
            decode(r#"{"type":"LOBBY_INVITATION_TO_FRIEND","lobbyId":""}"#).unwrap()
        else {
            panic!("wrong family");
        };
        assert_eq!(req.payload().lobby_id, None);

        let Inbound::Lobby(req) = decode(
            r#"{"type":"LOBBY_TERMINATE","lobbyId":"00000000-0000-0000-0000-000000000000"}"#,
        )
        .unwrap() else {
            panic!("wrong family");
        };
        assert_eq!(req.payload().lobby_id, None);
    }

    #[test]
    fn test_server_event_tags() {
        let v = to_value(&ServerEvent::OnlineUsers {
            users_online: vec![4, 5],
        });
        assert_eq!(v, json!({"type": "ONLINE_USERS", "usersOnline": [4, 5]}));

        let v = to_value(&ServerEvent::TournamentTimer {
            code: "t".into(),
            remaining_time: 3,
        });
        assert_eq!(v["type"], "TOURNAMENT_TIMER");
        assert_eq!(v["remainingTime"], 3);

        let v = to_value(&ServerEvent::TournamentTreeState {
            code: "t".into(),
            semi1: BracketMatch::default(),
            semi2: BracketMatch::default(),
            final_match: BracketMatch {
                player1: 7,
                ..Default::default()
            },
        });
        assert_eq!(v["final"]["player1"], 7);
        assert_eq!(v["semi1"]["isFinished"], false);
    }

    #[test]
    fn test_game_frame_layout() {
        let lobby_id = Uuid::new_v4();
        let state = GameState::new(1, 2, &GameConfig::default(), Instant::now());
        let v = to_value(&ServerEvent::GameEvent(GameFrame {
            lobby_id,
            state,
            player1_id: 1,
            player2_id: 2,
            is_tournament_game: false,
        }));
        assert_eq!(v["type"], "GAME_EVENT");
        assert_eq!(v["lobbyId"], lobby_id.to_string());
        assert_eq!(v["player1id"], 1);
        assert_eq!(v["state"]["paddle"]["height"], 120.0);
    }

    #[test]
    fn test_lobby_error_omits_missing_id() {
        let v = to_value(&ServerEvent::LobbyError {
            lobby_id: None,
            error: "nope".into(),
        });
        assert_eq!(v, json!({"type": "LOBBY_ERROR", "error": "nope"}));
    }
}
