//! Network Layer
//!
//! WebSocket server, the hub that owns every registry, and the lobby and
//! tournament protocols layered on top of it. Match physics live in `game/`.

pub mod auth;
pub mod connection;
pub mod hub;
pub mod lobby;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod tournament;

pub use auth::{resolve_identity, validate_token, AuthConfig, AuthError, TokenClaims};
pub use connection::{ConnectionConfig, ConnectionHandle};
pub use hub::{Hub, HubConfig, HubHandle, HubSignal};
pub use lobby::{Lobby, LobbyError};
pub use persistence::{Persistence, PersistenceConfig, PersistError};
pub use protocol::{Inbound, ProtocolError, ServerEvent};
pub use server::{GameServer, ServerConfig, ServerError};
pub use tournament::{Tournament, TournamentConfig, TournamentError};
