//! Game Events
//!
//! Things that happen during a tick, and the final outcome of a match.

use serde::Serialize;

use crate::game::state::{GameState, Side, UserId};

/// Something notable that happened during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    /// A side scored.
    PointScored {
        /// Side that scored.
        scorer: Side,
        /// Score after the point.
        score: [u32; 2],
    },
    /// A side's boost became available.
    BoostArmed {
        /// Side whose boost armed.
        side: Side,
    },
    /// A boosted return was played.
    BoostUsed {
        /// Side that used it.
        side: Side,
    },
    /// The match ended.
    MatchEnded {
        /// Winner, `None` on a timed-out tie.
        winner: Option<UserId>,
    },
}

/// Final result of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchOutcome {
    /// Player ids, `[player1, player2]`.
    pub players: [UserId; 2],
    /// Final score, `[player1, player2]`.
    pub score: [u32; 2],
    /// Winner, `None` on a draw.
    pub winner: Option<UserId>,
}

impl MatchOutcome {
    /// Outcome of a finished state. `None` while the match is still running.
    pub fn from_state(state: &GameState) -> Option<Self> {
        if state.active {
            return None;
        }
        Some(Self {
            players: state.players,
            score: state.score,
            winner: (state.winner != 0).then_some(state.winner),
        })
    }

    /// The player who did not win. `None` on a draw.
    pub fn loser(&self) -> Option<UserId> {
        let winner = self.winner?;
        self.players.into_iter().find(|&p| p != winner)
    }

    /// Score of `user` followed by the opponent's, if `user` played.
    pub fn score_for(&self, user: UserId) -> Option<(u32, u32)> {
        if self.players[0] == user {
            Some((self.score[0], self.score[1]))
        } else if self.players[1] == user {
            Some((self.score[1], self.score[0]))
        } else {
            None
        }
    }
}
