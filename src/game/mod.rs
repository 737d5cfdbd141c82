//! Game Logic Module
//!
//! Authoritative paddle-and-ball simulation.
//!
//! ## Module Structure
//!
//! - `state`: Ball, paddles, scores, boosts and the wire snapshot
//! - `collision`: Walls, paddle faces, paddle edges
//! - `tick`: One simulation step
//! - `input`: Paddle commands
//! - `events`: Tick events and match outcomes
//! - `engine`: Mutex-guarded match shared with the tick task

pub mod input;
pub mod state;
pub mod tick;
pub mod collision;
pub mod events;
pub mod engine;

// Re-export key types
pub use engine::Game;
pub use events::{MatchOutcome, StepEvent};
pub use input::Command;
pub use state::{GameConfig, GameState, Side, UserId};
pub use tick::TickResult;
