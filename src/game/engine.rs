//! Shared Game Handle
//!
//! A [`Game`] is touched by two independent tasks: the lobby tick loop and
//! the hub's command path. All state lives behind one mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::game::events::MatchOutcome;
use crate::game::input::{apply_command, Command};
use crate::game::state::{GameConfig, GameState, UserId};
use crate::game::tick::{step, TickResult};

/// One running match.
#[derive(Debug)]
pub struct Game {
    players: [UserId; 2],
    config: GameConfig,
    state: Mutex<GameState>,
    reported: AtomicBool,
}

impl Game {
    /// Start a match between `player1` (left) and `player2` (right).
    pub fn new(player1: UserId, player2: UserId, config: GameConfig) -> Self {
        Self::starting_at(player1, player2, config, Instant::now())
    }

    /// Start a match with an explicit clock origin.
    pub fn starting_at(player1: UserId, player2: UserId, config: GameConfig, now: Instant) -> Self {
        let state = GameState::new(player1, player2, &config, now);
        Self {
            players: [player1, player2],
            config,
            state: Mutex::new(state),
            reported: AtomicBool::new(false),
        }
    }

    /// `[player1, player2]`.
    pub fn players(&self) -> [UserId; 2] {
        self.players
    }

    /// Whether `user` plays in this match.
    pub fn has_player(&self, user: UserId) -> bool {
        self.players.contains(&user)
    }

    /// Advance one tick.
    pub fn update(&self, now: Instant) -> TickResult {
        let mut state = self.state.lock();
        step(&mut state, &self.config, now)
    }

    /// Apply a command from `user`. Strangers are ignored.
    pub fn handle_command(&self, user: UserId, command: Command) -> bool {
        let mut state = self.state.lock();
        match state.side_of(user) {
            Some(side) => apply_command(&mut state, side, command),
            None => false,
        }
    }

    /// End the match because `user` left.
    ///
    /// Returns `false` if the match had already ended.
    pub fn player_left(&self, user: UserId) -> bool {
        self.state.lock().forfeit(user, self.config.winning_score)
    }

    /// Copy of the current state, for broadcasting.
    pub fn snapshot(&self) -> GameState {
        self.state.lock().clone()
    }

    /// Whether the match is still running.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Outcome once the match has ended.
    pub fn outcome(&self) -> Option<MatchOutcome> {
        MatchOutcome::from_state(&self.state.lock())
    }

    /// Outcome, handed out at most once per match.
    ///
    /// The tick loop and teardown paths both try to report; only one wins.
    pub fn take_result(&self) -> Option<MatchOutcome> {
        let outcome = self.outcome()?;
        if self.reported.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_from_strangers_ignored() {
        let game = Game::new(1, 2, GameConfig::default());
        assert!(!game.handle_command(3, Command::Up));
        assert!(game.handle_command(1, Command::Up));
        assert_eq!(game.snapshot().paddles[0].direction, -1);
    }

    #[test]
    fn test_result_taken_once() {
        let game = Game::new(1, 2, GameConfig::default());
        assert!(game.take_result().is_none());

        assert!(game.player_left(2));
        let outcome = game.take_result().unwrap();
        assert_eq!(outcome.winner, Some(1));
        assert_eq!(outcome.score, [5, 0]);
        assert!(game.take_result().is_none());
        // outcome stays readable
        assert!(game.outcome().is_some());
    }

    #[test]
    fn test_leaving_twice_is_noop() {
        let game = Game::new(1, 2, GameConfig::default());
        assert!(game.player_left(1));
        assert!(!game.player_left(2));
        assert_eq!(game.snapshot().winner, 2);
    }
}
