//! Authoritative Simulation Tick
//!
//! One fixed-rate physics step. Wall-clock time only drives the match clock
//! and the point pause; movement is per tick.

use std::time::{Duration, Instant};

use crate::game::collision::{
    edge_contact, hits_face, reflect_walls, resolve_edge, return_from_face,
};
use crate::game::events::StepEvent;
use crate::game::state::{
    GameConfig, GameState, Side, BALL_SPEED, CANVAS_HEIGHT, CANVAS_WIDTH, PADDLE_HEIGHT,
    PADDLE_SPEED,
};

const ONE_SECOND: Duration = Duration::from_secs(1);

/// Result of a tick.
#[derive(Debug, Default)]
pub struct TickResult {
    /// Events generated this tick
    pub events: Vec<StepEvent>,
    /// Whether the match is over after this tick
    pub match_ended: bool,
}

/// Run one simulation tick at wall-clock time `now`.
///
/// Does nothing once the match is over.
pub fn step(state: &mut GameState, config: &GameConfig, now: Instant) -> TickResult {
    let mut result = TickResult::default();

    if !state.active {
        result.match_ended = true;
        return result;
    }

    // 1. Match clock, then the point pause
    if run_clock(state, now) {
        let leader = state.leader();
        end_match(state, leader, &mut result);
        return result;
    }
    if state.paused {
        match state.paused_at {
            Some(at) if now.saturating_duration_since(at) < config.point_pause => {
                return result;
            }
            _ => state.resume(),
        }
    }

    // 2. Paddles
    move_paddles(state);

    // 3. Ball
    state.ball.x += state.ball.dx;
    state.ball.y += state.ball.dy;

    // 4. Top / bottom walls
    reflect_walls(&mut state.ball);

    // 5-6. Paddle faces, then paddle edges
    if !process_face_hits(state, config, &mut result) {
        process_edge_hits(state);
    }

    // 7-8. Scoring and win check
    process_scoring(state, config, now, &mut result);

    result
}

/// Decrement the clock once per elapsed second. Returns `true` on expiry.
fn run_clock(state: &mut GameState, now: Instant) -> bool {
    while now.saturating_duration_since(state.clock_mark) >= ONE_SECOND {
        state.clock_mark += ONE_SECOND;
        state.remaining_secs = state.remaining_secs.saturating_sub(1);
        if state.remaining_secs == 0 {
            return true;
        }
    }
    false
}

fn move_paddles(state: &mut GameState) {
    let max_y = CANVAS_HEIGHT - PADDLE_HEIGHT;
    for paddle in state.paddles.iter_mut() {
        let y = paddle.y + f64::from(paddle.direction) * PADDLE_SPEED;
        paddle.y = y.clamp(0.0, max_y);
    }
}

fn process_face_hits(state: &mut GameState, config: &GameConfig, result: &mut TickResult) -> bool {
    for side in Side::BOTH {
        let paddle = state.paddles[side.index()];
        if !hits_face(&state.ball, &paddle, side) {
            continue;
        }

        let boost = &mut state.boosts[side.index()];
        let boosted = boost.active;
        let speed = if boosted {
            boost.active = false;
            BALL_SPEED * config.boost_multiplier
        } else {
            BALL_SPEED
        };

        return_from_face(&mut state.ball, &paddle, side, speed);
        if boosted {
            state.ball.dy *= config.boost_multiplier;
            result.events.push(StepEvent::BoostUsed { side });
        }

        if state.boosts[side.index()].record_hit(config.hits_to_boost) {
            result.events.push(StepEvent::BoostArmed { side });
        }
        return true;
    }
    false
}

fn process_edge_hits(state: &mut GameState) {
    for paddle in state.paddles {
        if let Some(contact) = edge_contact(&state.ball, &paddle) {
            resolve_edge(&mut state.ball, &paddle, contact);
            return;
        }
    }
}

fn process_scoring(state: &mut GameState, config: &GameConfig, now: Instant, result: &mut TickResult) {
    let conceding = if state.ball.x <= 0.0 {
        Side::Left
    } else if state.ball.x >= CANVAS_WIDTH {
        Side::Right
    } else {
        return;
    };
    let scorer = conceding.opponent();

    state.score[scorer.index()] += 1;
    state.serve_from(conceding, now);
    result.events.push(StepEvent::PointScored {
        scorer,
        score: state.score,
    });

    if state.score[scorer.index()] >= config.winning_score {
        end_match(state, Some(scorer), result);
    }
}

fn end_match(state: &mut GameState, winner: Option<Side>, result: &mut TickResult) {
    state.finish(winner);
    result.match_ended = true;
    result.events.push(StepEvent::MatchEnded {
        winner: (state.winner != 0).then_some(state.winner),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{Paddle, LEFT_PADDLE_X, PADDLE_WIDTH};

    fn setup() -> (GameState, GameConfig, Instant) {
        let config = GameConfig::default();
        let now = Instant::now();
        (GameState::new(1, 2, &config, now), config, now)
    }

    #[test]
    fn test_ball_moves_each_tick() {
        let (mut state, config, now) = setup();
        let x0 = state.ball.x;
        step(&mut state, &config, now);
        assert_eq!(state.ball.x, x0 + BALL_SPEED);
    }

    #[test]
    fn test_paddle_clamped_to_canvas() {
        let (mut state, config, now) = setup();
        state.paddles[0].direction = -1;
        for _ in 0..200 {
            step(&mut state, &config, now);
            // keep the ball in play
            state.ball.x = 400.0;
            state.ball.y = 300.0;
        }
        assert_eq!(state.paddles[0].y, 0.0);
    }

    #[test]
    fn test_point_scored_resets_and_pauses() {
        let (mut state, config, now) = setup();
        state.boosts[0].hits = 2;
        state.boosts[1].ready = true;
        state.paddles[1].y = 10.0;
        state.ball.x = 2.0;
        state.ball.y = 50.0;
        state.ball.dx = -8.0;

        let result = step(&mut state, &config, now);
        assert_eq!(state.score, [0, 1]);
        assert!(matches!(
            result.events[0],
            StepEvent::PointScored { scorer: Side::Right, .. }
        ));
        assert!(state.paused);
        assert_eq!(state.ball.x, CANVAS_WIDTH / 2.0);
        assert_eq!(state.ball.dy, 0.0);
        // serve travels away from the side that conceded
        assert!(state.ball.dx > 0.0);
        assert_eq!(state.paddles[1].y, Paddle::centered_y());
        assert_eq!(state.boosts[0].hits, 0);
        assert!(!state.boosts[1].ready);
    }

    #[test]
    fn test_pause_holds_for_point_pause() {
        let (mut state, config, now) = setup();
        state.serve_from(Side::Left, now);
        let x0 = state.ball.x;

        step(&mut state, &config, now + Duration::from_millis(500));
        assert_eq!(state.ball.x, x0);
        assert!(state.paused);

        step(&mut state, &config, now + Duration::from_millis(1001));
        assert!(!state.paused);
        assert_ne!(state.ball.x, x0);
    }

    #[test]
    fn test_winning_point_ends_match() {
        let (mut state, config, now) = setup();
        state.score = [config.winning_score - 1, 0];
        state.paddles[1].y = 10.0;
        state.ball.x = CANVAS_WIDTH - 2.0;
        state.ball.y = 500.0;

        let result = step(&mut state, &config, now);
        assert!(result.match_ended);
        assert!(!state.active);
        assert_eq!(state.winner, 1);
    }

    #[test]
    fn test_clock_expiry_tie_has_no_winner() {
        let (mut state, config, now) = setup();
        state.remaining_secs = 2;
        state.score = [1, 1];

        step(&mut state, &config, now + Duration::from_millis(1100));
        assert!(state.active);
        assert_eq!(state.remaining_secs, 1);

        let result = step(&mut state, &config, now + Duration::from_millis(2100));
        assert!(result.match_ended);
        assert!(!state.active);
        assert_eq!(state.winner, 0);
    }

    #[test]
    fn test_clock_expiry_leader_wins() {
        let (mut state, config, now) = setup();
        state.remaining_secs = 1;
        state.score = [0, 2];
        step(&mut state, &config, now + Duration::from_secs(1));
        assert_eq!(state.winner, 2);
    }

    #[test]
    fn test_third_hit_arms_boost_and_boost_speeds_return() {
        let (mut state, config, now) = setup();
        let paddle_center = state.paddles[0].center_y();
        let mut armed = false;

        for _ in 0..3 {
            state.ball.x = LEFT_PADDLE_X + PADDLE_WIDTH + state.ball.radius + 4.0;
            state.ball.y = paddle_center;
            state.ball.dx = -BALL_SPEED;
            state.ball.dy = 0.0;
            let result = step(&mut state, &config, now);
            armed |= result
                .events
                .iter()
                .any(|e| matches!(e, StepEvent::BoostArmed { side: Side::Left }));
            assert_eq!(state.ball.dx, BALL_SPEED);
        }
        assert!(armed);
        assert!(state.boosts[0].ready);

        state.boosts[0].ready = false;
        state.boosts[0].active = true;
        state.ball.x = LEFT_PADDLE_X + PADDLE_WIDTH + state.ball.radius + 4.0;
        state.ball.y = paddle_center;
        state.ball.dx = -BALL_SPEED;
        step(&mut state, &config, now);
        assert_eq!(state.ball.dx, BALL_SPEED * config.boost_multiplier);
        assert!(!state.boosts[0].active);
    }

    #[test]
    fn test_winner_exclusive_with_active() {
        let (mut state, config, now) = setup();
        for i in 0..20_000u64 {
            let t = now + Duration::from_millis(16 * i);
            step(&mut state, &config, t);
            assert!(!(state.active && state.winner != 0));
            if !state.active {
                break;
            }
        }
        assert!(!state.active);
    }
}
