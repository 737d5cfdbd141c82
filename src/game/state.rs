//! Game State Definitions
//!
//! Ball, paddles, scores and boost sub-states for one match.
//! Internally everything is indexed by [`Side`]; the wire layout keeps the
//! `player1`/`player2` field names the web client reads.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

// =============================================================================
// PLAYER ID
// =============================================================================

/// Opaque numeric user identifier, stable for a session.
///
/// `0` is reserved to mean "nobody" (no winner, empty slot).
pub type UserId = u64;

// =============================================================================
// CANVAS CONSTANTS
// =============================================================================

/// Canvas width in game units.
pub const CANVAS_WIDTH: f64 = 800.0;
/// Canvas height in game units.
pub const CANVAS_HEIGHT: f64 = 600.0;
/// Nominal ball speed (units per tick).
pub const BALL_SPEED: f64 = 8.0;
/// Ball radius.
pub const BALL_RADIUS: f64 = 10.0;
/// Paddle speed (units per tick).
pub const PADDLE_SPEED: f64 = 8.0;
/// Paddle width.
pub const PADDLE_WIDTH: f64 = 20.0;
/// Paddle height.
pub const PADDLE_HEIGHT: f64 = 120.0;
/// X of the left paddle's back face.
pub const LEFT_PADDLE_X: f64 = 20.0;
/// X of the right paddle's front face.
pub const RIGHT_PADDLE_X: f64 = 760.0;

/// Tunables that differ between deployments (and tests).
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// First player to reach this score wins.
    pub winning_score: u32,
    /// Match clock in seconds.
    pub match_duration_secs: u32,
    /// Freeze after each point.
    pub point_pause: Duration,
    /// Consecutive face hits needed to arm a boost.
    pub hits_to_boost: u32,
    /// Speed multiplier applied by an active boost.
    pub boost_multiplier: f64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            winning_score: 5,
            match_duration_secs: 300,
            point_pause: Duration::from_secs(1),
            hits_to_boost: 3,
            boost_multiplier: 2.5,
        }
    }
}

// =============================================================================
// SIDES
// =============================================================================

/// Which end of the table a player defends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Player 1 (lobby sender), paddle at the left wall.
    Left = 0,
    /// Player 2 (lobby receiver), paddle at the right wall.
    Right = 1,
}

impl Side {
    /// Both sides, in index order.
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    /// Array index for per-side state.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The other side.
    #[inline]
    pub fn opponent(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Horizontal direction a ball travels after leaving this side's paddle.
    #[inline]
    pub fn outward(self) -> f64 {
        match self {
            Side::Left => 1.0,
            Side::Right => -1.0,
        }
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

/// The ball.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ball {
    /// Centre x.
    pub x: f64,
    /// Centre y.
    pub y: f64,
    /// Horizontal velocity.
    pub dx: f64,
    /// Vertical velocity.
    pub dy: f64,
    /// Radius.
    pub radius: f64,
}

impl Ball {
    /// Ball resting at the canvas centre, moving horizontally.
    pub fn centered(dx: f64) -> Self {
        Self {
            x: CANVAS_WIDTH / 2.0,
            y: CANVAS_HEIGHT / 2.0,
            dx,
            dy: 0.0,
            radius: BALL_RADIUS,
        }
    }
}

/// One paddle. `y` is the top edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Paddle {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// -1 up, 0 still, +1 down.
    pub direction: i8,
}

impl Paddle {
    /// Vertically centred paddle for a side.
    pub fn for_side(side: Side) -> Self {
        let x = match side {
            Side::Left => LEFT_PADDLE_X,
            Side::Right => RIGHT_PADDLE_X,
        };
        Self {
            x,
            y: Self::centered_y(),
            direction: 0,
        }
    }

    /// Top edge of a vertically centred paddle.
    #[inline]
    pub fn centered_y() -> f64 {
        CANVAS_HEIGHT / 2.0 - PADDLE_HEIGHT / 2.0
    }

    /// Vertical centre of the paddle.
    #[inline]
    pub fn center_y(&self) -> f64 {
        self.y + PADDLE_HEIGHT / 2.0
    }

    /// Whether a y coordinate lies within the paddle's vertical span.
    #[inline]
    pub fn spans(&self, y: f64) -> bool {
        y >= self.y && y <= self.y + PADDLE_HEIGHT
    }
}

/// Per-player boost sub-state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BoostState {
    /// Consecutive face hits since the last arm / point.
    #[serde(rename = "ballhit")]
    pub hits: u32,
    /// Boost armed, waiting for activation.
    #[serde(rename = "boostReady")]
    pub ready: bool,
    /// Boost activated, applied on the next own-paddle hit.
    #[serde(rename = "isboostactive")]
    pub active: bool,
}

impl BoostState {
    /// Record a face hit; arms the boost once `threshold` is reached.
    ///
    /// Returns `true` when this hit armed the boost.
    pub fn record_hit(&mut self, threshold: u32) -> bool {
        self.hits += 1;
        if self.hits >= threshold {
            self.ready = true;
            self.hits = 0;
            return true;
        }
        false
    }
}

// =============================================================================
// GAME STATE
// =============================================================================

/// Full authoritative state of one match.
#[derive(Debug, Clone)]
pub struct GameState {
    /// Player ids, indexed by [`Side`].
    pub players: [UserId; 2],
    /// Ball.
    pub ball: Ball,
    /// Paddles, indexed by [`Side`].
    pub paddles: [Paddle; 2],
    /// Scores, indexed by [`Side`].
    pub score: [u32; 2],
    /// Boosts, indexed by [`Side`].
    pub boosts: [BoostState; 2],
    /// Match still running.
    pub active: bool,
    /// Winner id, 0 while undecided or on a timed-out tie.
    pub winner: UserId,
    /// Frozen after a point.
    pub paused: bool,
    /// When the current pause began.
    pub paused_at: Option<Instant>,
    /// Wall-clock start of the current pause, as shown to clients.
    pub pause_time: Option<DateTime<Utc>>,
    /// Last time the match clock was decremented.
    pub clock_mark: Instant,
    /// Seconds left on the match clock.
    pub remaining_secs: u32,
}

impl GameState {
    /// Fresh match: ball centred, scores zero, no winner.
    pub fn new(player1: UserId, player2: UserId, config: &GameConfig, now: Instant) -> Self {
        Self {
            players: [player1, player2],
            ball: Ball::centered(BALL_SPEED),
            paddles: [Paddle::for_side(Side::Left), Paddle::for_side(Side::Right)],
            score: [0, 0],
            boosts: [BoostState::default(); 2],
            active: true,
            winner: 0,
            paused: false,
            paused_at: None,
            pause_time: None,
            clock_mark: now,
            remaining_secs: config.match_duration_secs,
        }
    }

    /// Side a user plays on, if they are in this match.
    pub fn side_of(&self, user: UserId) -> Option<Side> {
        Side::BOTH.into_iter().find(|s| self.players[s.index()] == user)
    }

    /// Put the ball back in the middle heading away from `conceding`,
    /// re-centre paddles, clear boosts and start the point pause.
    pub fn serve_from(&mut self, conceding: Side, now: Instant) {
        self.ball = Ball::centered(BALL_SPEED * conceding.outward());
        for side in Side::BOTH {
            let paddle = &mut self.paddles[side.index()];
            paddle.y = Paddle::centered_y();
        }
        self.boosts = [BoostState::default(); 2];
        self.paused = true;
        self.paused_at = Some(now);
        self.pause_time = Some(Utc::now());
    }

    /// Leave the point pause.
    pub fn resume(&mut self) {
        self.paused = false;
        self.paused_at = None;
        self.pause_time = None;
    }

    /// End the match. Keeps `active` and `winner` mutually exclusive.
    pub fn finish(&mut self, winner: Option<Side>) {
        self.active = false;
        self.resume();
        self.winner = winner.map(|s| self.players[s.index()]).unwrap_or(0);
    }

    /// Force-end because `leaver` disconnected: survivor takes the winning
    /// score, leaver gets zero.
    ///
    /// Returns `false` if the match was already over or `leaver` isn't playing.
    pub fn forfeit(&mut self, leaver: UserId, winning_score: u32) -> bool {
        if !self.active {
            return false;
        }
        let Some(side) = self.side_of(leaver) else {
            return false;
        };
        let survivor = side.opponent();
        self.score[survivor.index()] = winning_score;
        self.score[side.index()] = 0;
        self.finish(Some(survivor));
        true
    }

    /// Side that leads on points, `None` on a tie.
    pub fn leader(&self) -> Option<Side> {
        use std::cmp::Ordering;
        match self.score[0].cmp(&self.score[1]) {
            Ordering::Greater => Some(Side::Left),
            Ordering::Less => Some(Side::Right),
            Ordering::Equal => None,
        }
    }
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

#[derive(Serialize)]
struct BallView {
    x: f64,
    y: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaddleView {
    width: f64,
    height: f64,
    #[serde(rename = "player1Y")]
    player1_y: f64,
    #[serde(rename = "player2Y")]
    player2_y: f64,
    #[serde(rename = "player1X")]
    player1_x: f64,
    #[serde(rename = "player2X")]
    player2_x: f64,
    #[serde(rename = "player1YDirection")]
    player1_direction: i8,
    #[serde(rename = "player2YDirection")]
    player2_direction: i8,
}

#[derive(Serialize)]
struct ScoreView {
    player1: u32,
    player2: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GameStateView<'a> {
    ball: BallView,
    paddle: PaddleView,
    score: ScoreView,
    is_active: bool,
    winner: UserId,
    is_paused: bool,
    pause_time: Option<DateTime<Utc>>,
    #[serde(rename = "player1boost")]
    player1_boost: &'a BoostState,
    #[serde(rename = "player2boost")]
    player2_boost: &'a BoostState,
    remaining_time: u32,
}

impl Serialize for GameState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let [left, right] = &self.paddles;
        GameStateView {
            ball: BallView {
                x: self.ball.x,
                y: self.ball.y,
            },
            paddle: PaddleView {
                width: PADDLE_WIDTH,
                height: PADDLE_HEIGHT,
                player1_y: left.y,
                player2_y: right.y,
                player1_x: left.x,
                player2_x: right.x,
                player1_direction: left.direction,
                player2_direction: right.direction,
            },
            score: ScoreView {
                player1: self.score[0],
                player2: self.score[1],
            },
            is_active: self.active,
            winner: self.winner,
            is_paused: self.paused,
            pause_time: self.pause_time,
            player1_boost: &self.boosts[0],
            player2_boost: &self.boosts[1],
            remaining_time: self.remaining_secs,
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_state() -> GameState {
        GameState::new(11, 22, &GameConfig::default(), Instant::now())
    }

    #[test]
    fn test_new_state_is_centered() {
        let state = new_state();
        assert_eq!(state.ball.x, CANVAS_WIDTH / 2.0);
        assert_eq!(state.ball.y, CANVAS_HEIGHT / 2.0);
        assert_eq!(state.score, [0, 0]);
        assert_eq!(state.winner, 0);
        assert!(state.active);
    }

    #[test]
    fn test_side_lookup() {
        let state = new_state();
        assert_eq!(state.side_of(11), Some(Side::Left));
        assert_eq!(state.side_of(22), Some(Side::Right));
        assert_eq!(state.side_of(33), None);
    }

    #[test]
    fn test_forfeit_credits_survivor() {
        let mut state = new_state();
        state.score = [2, 3];
        assert!(state.forfeit(22, 5));
        assert_eq!(state.score, [5, 0]);
        assert_eq!(state.winner, 11);
        assert!(!state.active);

        // Second forfeit is a no-op once the match is over.
        assert!(!state.forfeit(11, 5));
        assert_eq!(state.winner, 11);
    }

    #[test]
    fn test_forfeit_ignores_strangers() {
        let mut state = new_state();
        assert!(!state.forfeit(99, 5));
        assert!(state.active);
    }

    #[test]
    fn test_boost_arms_at_threshold() {
        let mut boost = BoostState::default();
        assert!(!boost.record_hit(3));
        assert!(!boost.record_hit(3));
        assert!(boost.record_hit(3));
        assert!(boost.ready);
        assert_eq!(boost.hits, 0);
    }

    #[test]
    fn test_wire_layout() {
        let state = new_state();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["paddle"]["player1X"], LEFT_PADDLE_X);
        assert_eq!(json["paddle"]["player2X"], RIGHT_PADDLE_X);
        assert_eq!(json["score"]["player1"], 0);
        assert_eq!(json["isActive"], true);
        assert_eq!(json["player1boost"]["boostReady"], false);
        assert_eq!(json["remainingTime"], 300);
        assert!(json["ball"].get("dx").is_none());
    }
}
