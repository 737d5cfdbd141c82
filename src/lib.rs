//! # Paddle Arena Server
//!
//! Realtime backend for a two-player paddle-and-ball game: presence, chat,
//! lobby invitations, authoritative matches and four-player tournaments over
//! one websocket per user.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   PADDLE ARENA SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/             - Match simulation                        │
//! │  ├── state.rs      - Ball, paddles, scores, wire snapshot    │
//! │  ├── collision.rs  - Walls, paddle faces and edges           │
//! │  ├── tick.rs       - One authoritative step                  │
//! │  ├── input.rs      - Paddle commands                         │
//! │  ├── events.rs     - Step events and match outcomes          │
//! │  └── engine.rs     - Lock-guarded match                      │
//! │                                                              │
//! │  network/          - Realtime plumbing                       │
//! │  ├── server.rs     - Listener and websocket upgrade          │
//! │  ├── auth.rs       - Identity of a connecting socket         │
//! │  ├── connection.rs - Per-socket pumps and handles            │
//! │  ├── hub.rs        - Registry-owning actor                   │
//! │  ├── lobby.rs      - Invitations, lobbies, match ticking     │
//! │  ├── tournament.rs - Four-player bracket                     │
//! │  ├── protocol.rs   - JSON message families                   │
//! │  └── persistence.rs- Chat and match history collaborator     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! The [`network::Hub`] is the only owner of the connection, invitation,
//! lobby and tournament registries; everything else reaches it through
//! channels. A running match is the one piece of state shared between tasks,
//! guarded by a mutex inside [`game::Game`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::{Game, GameConfig, GameState, MatchOutcome, UserId};
pub use network::{GameServer, ServerConfig, ServerError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
