//! Player Commands
//!
//! Key presses forwarded by the client inside `GAME_EVENT` frames.

use serde::{Deserialize, Serialize};

use crate::game::state::{GameState, Side};

// =============================================================================
// COMMANDS
// =============================================================================

/// A single paddle command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    /// Start moving up.
    Up,
    /// Start moving down.
    Down,
    /// Stop moving.
    Stop,
    /// Activate an armed boost.
    #[serde(alias = "SPACE")]
    Boost,
}

impl Command {
    /// Parse the `keyPressed` field. Unknown keys yield `None`.
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "UP" => Some(Command::Up),
            "DOWN" => Some(Command::Down),
            "STOP" => Some(Command::Stop),
            "SPACE" | "BOOST" => Some(Command::Boost),
            _ => None,
        }
    }

    /// Paddle direction this command selects, if it is a movement command.
    pub fn direction(self) -> Option<i8> {
        match self {
            Command::Up => Some(-1),
            Command::Down => Some(1),
            Command::Stop => Some(0),
            Command::Boost => None,
        }
    }
}

/// Apply a command for `side`. Ignored once the match is over.
///
/// Returns `true` if the state changed.
pub fn apply_command(state: &mut GameState, side: Side, command: Command) -> bool {
    if !state.active {
        return false;
    }
    if let Some(direction) = command.direction() {
        let paddle = &mut state.paddles[side.index()];
        let changed = paddle.direction != direction;
        paddle.direction = direction;
        return changed;
    }

    let boost = &mut state.boosts[side.index()];
    if boost.ready {
        boost.ready = false;
        boost.active = true;
        true
    } else {
        false
    }
}
