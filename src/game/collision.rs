//! Collision Detection
//!
//! Ball against walls and paddles. Paddles have two kinds of contact:
//! the front face (normal returns) and the top/bottom edges (glancing hits).

use crate::game::state::{
    Ball, Paddle, Side, BALL_SPEED, CANVAS_HEIGHT, PADDLE_HEIGHT, PADDLE_WIDTH,
};

/// How far past a paddle edge the ball may sink and still count as an edge hit.
pub const EDGE_TOLERANCE: f64 = 5.0;

/// Vertical speed after a face hit.
///
/// Zero at the paddle's vertical centre, `±BALL_SPEED / 2` at its ends,
/// negative (upwards) on the upper half.
#[inline]
pub fn face_deflection(ball_y: f64, paddle_y: f64) -> f64 {
    let half = PADDLE_HEIGHT / 2.0;
    let mid = paddle_y + half;
    (ball_y - mid) / half * (BALL_SPEED / 2.0)
}

/// Horizontal speed after an edge hit, symmetric about the paddle's
/// horizontal centre.
#[inline]
pub fn edge_deflection(ball_x: f64, paddle_x: f64) -> f64 {
    let half = PADDLE_WIDTH / 2.0;
    let mid = paddle_x + half;
    (ball_x - mid) / half * (BALL_SPEED / 2.0)
}

/// Bounce off the top and bottom walls.
///
/// Returns `true` if the ball touched a wall.
pub fn reflect_walls(ball: &mut Ball) -> bool {
    if ball.y - ball.radius <= 0.0 {
        ball.y = ball.radius;
        ball.dy = ball.dy.abs();
        true
    } else if ball.y + ball.radius >= CANVAS_HEIGHT {
        ball.y = CANVAS_HEIGHT - ball.radius;
        ball.dy = -ball.dy.abs();
        true
    } else {
        false
    }
}

/// Whether the ball's leading edge is crossing `side`'s front face
/// while travelling towards it and lined up with the paddle.
pub fn hits_face(ball: &Ball, paddle: &Paddle, side: Side) -> bool {
    if !paddle.spans(ball.y) {
        return false;
    }
    match side {
        Side::Left => {
            let leading = ball.x - ball.radius;
            ball.dx < 0.0 && leading <= paddle.x + PADDLE_WIDTH && leading > paddle.x
        }
        Side::Right => {
            let leading = ball.x + ball.radius;
            ball.dx > 0.0 && leading >= paddle.x && leading < paddle.x + PADDLE_WIDTH
        }
    }
}

/// Send the ball back from `side`'s face at `speed`.
///
/// The ball is moved clear of the face so it cannot register twice.
pub fn return_from_face(ball: &mut Ball, paddle: &Paddle, side: Side, speed: f64) {
    ball.dy = face_deflection(ball.y, paddle.y);
    ball.dx = speed * side.outward();
    ball.x = match side {
        Side::Left => paddle.x + PADDLE_WIDTH + ball.radius,
        Side::Right => paddle.x - ball.radius,
    };
}

/// Which paddle edge the ball struck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeContact {
    /// Ball came down onto the paddle's top edge.
    Top,
    /// Ball came up into the paddle's bottom edge.
    Bottom,
}

/// Detect a glancing hit on a paddle's top or bottom edge.
pub fn edge_contact(ball: &Ball, paddle: &Paddle) -> Option<EdgeContact> {
    if ball.x < paddle.x || ball.x > paddle.x + PADDLE_WIDTH {
        return None;
    }
    let bottom_of_ball = ball.y + ball.radius;
    let top_of_ball = ball.y - ball.radius;
    let paddle_bottom = paddle.y + PADDLE_HEIGHT;

    if bottom_of_ball >= paddle.y && bottom_of_ball <= paddle.y + EDGE_TOLERANCE {
        Some(EdgeContact::Top)
    } else if top_of_ball <= paddle_bottom && top_of_ball >= paddle_bottom - EDGE_TOLERANCE {
        Some(EdgeContact::Bottom)
    } else {
        None
    }
}

/// Bounce the ball off a paddle edge, pushing it outside the paddle.
pub fn resolve_edge(ball: &mut Ball, paddle: &Paddle, contact: EdgeContact) {
    match contact {
        EdgeContact::Top => {
            ball.y = paddle.y - ball.radius - 1.0;
            ball.dy = -BALL_SPEED;
        }
        EdgeContact::Bottom => {
            ball.y = paddle.y + PADDLE_HEIGHT + ball.radius + 1.0;
            ball.dy = BALL_SPEED;
        }
    }
    ball.dx = edge_deflection(ball.x, paddle.x);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{BALL_RADIUS, LEFT_PADDLE_X, RIGHT_PADDLE_X};
    use proptest::prelude::*;

    fn ball(x: f64, y: f64, dx: f64, dy: f64) -> Ball {
        Ball {
            x,
            y,
            dx,
            dy,
            radius: BALL_RADIUS,
        }
    }

    #[test]
    fn test_face_deflection_center_is_flat() {
        let paddle_y = 240.0;
        assert_eq!(face_deflection(paddle_y + PADDLE_HEIGHT / 2.0, paddle_y), 0.0);
    }

    #[test]
    fn test_face_deflection_extremes() {
        let paddle_y = 100.0;
        assert_eq!(face_deflection(paddle_y, paddle_y), -BALL_SPEED / 2.0);
        assert_eq!(
            face_deflection(paddle_y + PADDLE_HEIGHT, paddle_y),
            BALL_SPEED / 2.0
        );
    }

    #[test]
    fn test_left_face_hit_returns_ball() {
        let paddle = Paddle::for_side(Side::Left);
        let mut b = ball(LEFT_PADDLE_X + PADDLE_WIDTH + 5.0, paddle.center_y(), -8.0, 0.0);
        assert!(hits_face(&b, &paddle, Side::Left));

        return_from_face(&mut b, &paddle, Side::Left, BALL_SPEED);
        assert_eq!(b.dx, BALL_SPEED);
        assert_eq!(b.dy, 0.0);
        assert!(!hits_face(&b, &paddle, Side::Left));
    }

    #[test]
    fn test_face_ignores_ball_moving_away() {
        let paddle = Paddle::for_side(Side::Right);
        let b = ball(RIGHT_PADDLE_X - 5.0, paddle.center_y(), -8.0, 0.0);
        assert!(!hits_face(&b, &paddle, Side::Right));
    }

    #[test]
    fn test_face_ignores_ball_outside_span() {
        let paddle = Paddle::for_side(Side::Right);
        let b = ball(RIGHT_PADDLE_X - 5.0, paddle.y - 30.0, 8.0, 0.0);
        assert!(!hits_face(&b, &paddle, Side::Right));
    }

    #[test]
    fn test_top_edge_bounce_clears_paddle() {
        let paddle = Paddle::for_side(Side::Left);
        let mut b = ball(paddle.x + 3.0, paddle.y - BALL_RADIUS + 2.0, -2.0, 4.0);
        assert_eq!(edge_contact(&b, &paddle), Some(EdgeContact::Top));

        resolve_edge(&mut b, &paddle, EdgeContact::Top);
        assert!(b.y + b.radius < paddle.y);
        assert_eq!(b.dy, -BALL_SPEED);
        assert!(b.dx < 0.0);
    }

    #[test]
    fn test_bottom_edge_bounce_clears_paddle() {
        let paddle = Paddle::for_side(Side::Right);
        let bottom = paddle.y + PADDLE_HEIGHT;
        let mut b = ball(paddle.x + 15.0, bottom + BALL_RADIUS - 1.0, 3.0, -4.0);
        assert_eq!(edge_contact(&b, &paddle), Some(EdgeContact::Bottom));

        resolve_edge(&mut b, &paddle, EdgeContact::Bottom);
        assert!(b.y - b.radius > bottom);
        assert_eq!(b.dy, BALL_SPEED);
        assert!(b.dx > 0.0);
    }

    #[test]
    fn test_walls_reflect() {
        let mut b = ball(400.0, 5.0, 8.0, -3.0);
        assert!(reflect_walls(&mut b));
        assert_eq!(b.dy, 3.0);

        let mut b = ball(400.0, CANVAS_HEIGHT - 2.0, 8.0, 3.0);
        assert!(reflect_walls(&mut b));
        assert_eq!(b.dy, -3.0);

        let mut b = ball(400.0, 300.0, 8.0, 3.0);
        assert!(!reflect_walls(&mut b));
    }

    proptest! {
        #[test]
        fn prop_face_deflection_is_antisymmetric(
            paddle_y in 0.0f64..(CANVAS_HEIGHT - PADDLE_HEIGHT),
            offset in 0.0f64..(PADDLE_HEIGHT / 2.0),
        ) {
            let mid = paddle_y + PADDLE_HEIGHT / 2.0;
            let up = face_deflection(mid - offset, paddle_y);
            let down = face_deflection(mid + offset, paddle_y);
            prop_assert!((up + down).abs() < 1e-9);
            prop_assert!(up <= 0.0);
            prop_assert!(down.abs() <= BALL_SPEED / 2.0 + 1e-9);
        }

        #[test]
        fn prop_edge_deflection_is_antisymmetric(
            paddle_x in prop_oneof![Just(LEFT_PADDLE_X), Just(RIGHT_PADDLE_X)],
            offset in 0.0f64..(PADDLE_WIDTH / 2.0),
        ) {
            let mid = paddle_x + PADDLE_WIDTH / 2.0;
            let left = edge_deflection(mid - offset, paddle_x);
            let right = edge_deflection(mid + offset, paddle_x);
            prop_assert!((left + right).abs() < 1e-9);
        }
    }
}
