//! Pong match simulation: the pluggable per-tick domain update for a room.
//!
//! Pure with respect to the session layer: `step` advances ball and paddles
//! and reports scoring events; the room decides what to broadcast and when
//! the match ends. Field coordinates follow the protocol convention
//! (origin top-left, y down).

use protocol::{
    Ball, GameResult, InputDir, Pad, ServerMessage, Side, Vec2, BALL_RADIUS, BALL_SPEED,
    FIELD_HEIGHT, FIELD_WIDTH, PAD_HEIGHT, PAD_MARGIN, PAD_SPEED, WIN_SCORE,
};
use rand::Rng;

/// Events produced by one simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchEvent {
    Scored(Side),
}

/// One running pong match between the two seat holders.
#[derive(Debug, Clone)]
pub struct Match {
    ball: Ball,
    left_pad: Pad,
    right_pad: Pad,
    score_left: u32,
    score_right: u32,
}

impl Match {
    pub fn new() -> Self {
        let mut m = Self {
            ball: Ball {
                pos: Vec2 {
                    x: FIELD_WIDTH / 2.0,
                    y: FIELD_HEIGHT / 2.0,
                },
                speed: Vec2 { x: 0.0, y: 0.0 },
            },
            left_pad: Pad {
                y: FIELD_HEIGHT / 2.0,
                speed: 0.0,
            },
            right_pad: Pad {
                y: FIELD_HEIGHT / 2.0,
                speed: 0.0,
            },
            score_left: 0,
            score_right: 0,
        };
        m.serve(random_side());
        m
    }

    pub fn score(&self) -> (u32, u32) {
        (self.score_left, self.score_right)
    }

    /// True once one side has reached the winning score.
    pub fn is_over(&self) -> bool {
        self.score_left >= WIN_SCORE || self.score_right >= WIN_SCORE
    }

    /// The winner, once [`is_over`](Self::is_over) holds.
    pub fn winner(&self) -> Side {
        if self.score_left >= self.score_right {
            Side::Left
        } else {
            Side::Right
        }
    }

    /// Awards a point directly, for tests that need a decided game without
    /// simulating rallies.
    #[cfg(test)]
    pub(crate) fn force_point(&mut self, side: Side) {
        match side {
            Side::Left => self.score_left += 1,
            Side::Right => self.score_right += 1,
        }
        self.serve(side.opposite());
    }

    pub fn result_for(&self, side: Side) -> GameResult {
        if self.winner() == side {
            GameResult::Won
        } else {
            GameResult::Lost
        }
    }

    /// Applies a player's movement request to their paddle.
    pub fn set_input(&mut self, side: Side, dir: InputDir) {
        let pad = match side {
            Side::Left => &mut self.left_pad,
            Side::Right => &mut self.right_pad,
        };
        pad.speed = match dir {
            InputDir::Idle => 0.0,
            InputDir::Up => -PAD_SPEED,
            InputDir::Down => PAD_SPEED,
        };
    }

    /// Advances the simulation by `dt` seconds.
    pub fn step(&mut self, dt: f32) -> Vec<MatchEvent> {
        let mut events = Vec::new();

        for pad in [&mut self.left_pad, &mut self.right_pad] {
            let half = PAD_HEIGHT / 2.0;
            pad.y = (pad.y + pad.speed * dt).clamp(half, FIELD_HEIGHT - half);
        }

        self.ball.pos.x += self.ball.speed.x * dt;
        self.ball.pos.y += self.ball.speed.y * dt;

        // Top and bottom walls reflect.
        if self.ball.pos.y - BALL_RADIUS < 0.0 {
            self.ball.pos.y = BALL_RADIUS;
            self.ball.speed.y = self.ball.speed.y.abs();
        } else if self.ball.pos.y + BALL_RADIUS > FIELD_HEIGHT {
            self.ball.pos.y = FIELD_HEIGHT - BALL_RADIUS;
            self.ball.speed.y = -self.ball.speed.y.abs();
        }

        // Paddle faces. A miss past a face keeps flying until the wall.
        let left_face = PAD_MARGIN;
        let right_face = FIELD_WIDTH - PAD_MARGIN;
        if self.ball.speed.x < 0.0
            && self.ball.pos.x - BALL_RADIUS <= left_face
            && self.ball.pos.x - BALL_RADIUS > left_face - BALL_RADIUS * 2.0
            && (self.ball.pos.y - self.left_pad.y).abs() <= PAD_HEIGHT / 2.0 + BALL_RADIUS
        {
            self.ball.pos.x = left_face + BALL_RADIUS;
            let pad = self.left_pad;
            self.deflect(pad, 1.0);
        } else if self.ball.speed.x > 0.0
            && self.ball.pos.x + BALL_RADIUS >= right_face
            && self.ball.pos.x + BALL_RADIUS < right_face + BALL_RADIUS * 2.0
            && (self.ball.pos.y - self.right_pad.y).abs() <= PAD_HEIGHT / 2.0 + BALL_RADIUS
        {
            self.ball.pos.x = right_face - BALL_RADIUS;
            let pad = self.right_pad;
            self.deflect(pad, -1.0);
        }

        // Goals.
        if self.ball.pos.x < 0.0 {
            self.score_right += 1;
            events.push(MatchEvent::Scored(Side::Right));
            self.serve(Side::Left);
        } else if self.ball.pos.x > FIELD_WIDTH {
            self.score_left += 1;
            events.push(MatchEvent::Scored(Side::Left));
            self.serve(Side::Right);
        }

        events
    }

    /// Snapshot for the per-tick broadcast.
    pub fn state_message(&self) -> ServerMessage {
        ServerMessage::GameState {
            ball: self.ball,
            left_pad: self.left_pad,
            right_pad: self.right_pad,
        }
    }

    pub fn score_message(&self) -> ServerMessage {
        ServerMessage::Score {
            left: self.score_left,
            right: self.score_right,
        }
    }

    /// Reflects the ball off a paddle. The contact offset steers the exit
    /// angle so play does not degenerate into a flat rally.
    fn deflect(&mut self, pad: Pad, dir_x: f32) {
        let offset = ((self.ball.pos.y - pad.y) / (PAD_HEIGHT / 2.0)).clamp(-1.0, 1.0);
        let angle = offset * std::f32::consts::FRAC_PI_4;
        self.ball.speed.x = dir_x * BALL_SPEED * angle.cos();
        self.ball.speed.y = BALL_SPEED * angle.sin();
    }

    /// Re-centers the ball, serving toward the side that just conceded.
    fn serve(&mut self, toward: Side) {
        self.ball.pos = Vec2 {
            x: FIELD_WIDTH / 2.0,
            y: FIELD_HEIGHT / 2.0,
        };
        let dir_x = match toward {
            Side::Left => -1.0,
            Side::Right => 1.0,
        };
        let angle: f32 = rand::thread_rng().gen_range(-0.4..0.4);
        self.ball.speed = Vec2 {
            x: dir_x * BALL_SPEED * angle.cos(),
            y: BALL_SPEED * angle.sin(),
        };
    }
}

impl Default for Match {
    fn default() -> Self {
        Self::new()
    }
}

fn random_side() -> Side {
    if rand::thread_rng().gen_bool(0.5) {
        Side::Left
    } else {
        Side::Right
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_new_match_starts_centered_and_scoreless() {
        let m = Match::new();
        assert_eq!(m.score(), (0, 0));
        assert!(!m.is_over());
        let speed = (m.ball.speed.x.powi(2) + m.ball.speed.y.powi(2)).sqrt();
        assert_approx_eq!(speed, BALL_SPEED, 0.5);
    }

    #[test]
    fn test_paddle_moves_and_clamps() {
        let mut m = Match::new();
        m.set_input(Side::Left, InputDir::Up);

        let before = m.left_pad.y;
        m.step(1.0 / 60.0);
        assert!(m.left_pad.y < before, "Up must move the pad toward y=0");

        // Long enough to hit the top edge.
        for _ in 0..300 {
            m.step(1.0 / 60.0);
        }
        assert_approx_eq!(m.left_pad.y, PAD_HEIGHT / 2.0, 0.01);
    }

    #[test]
    fn test_idle_paddle_stays_put() {
        let mut m = Match::new();
        m.set_input(Side::Right, InputDir::Down);
        m.step(1.0 / 60.0);
        m.set_input(Side::Right, InputDir::Idle);
        let y = m.right_pad.y;
        m.step(1.0 / 60.0);
        assert_approx_eq!(m.right_pad.y, y, 1e-6);
    }

    #[test]
    fn test_ball_bounces_off_top_wall() {
        let mut m = Match::new();
        m.ball.pos = Vec2 { x: 400.0, y: 10.0 };
        m.ball.speed = Vec2 {
            x: 0.0,
            y: -BALL_SPEED,
        };
        m.step(1.0 / 60.0);
        assert!(m.ball.speed.y > 0.0);
        assert!(m.ball.pos.y >= BALL_RADIUS);
    }

    #[test]
    fn test_paddle_returns_ball() {
        let mut m = Match::new();
        m.left_pad.y = 300.0;
        m.ball.pos = Vec2 {
            x: PAD_MARGIN + BALL_RADIUS + 1.0,
            y: 300.0,
        };
        m.ball.speed = Vec2 {
            x: -BALL_SPEED,
            y: 0.0,
        };
        m.step(1.0 / 60.0);
        assert!(m.ball.speed.x > 0.0, "ball must reflect off the left pad");
        assert_eq!(m.score(), (0, 0));
    }

    #[test]
    fn test_missed_ball_scores_for_the_other_side() {
        let mut m = Match::new();
        // Pad parked far away from the ball's path.
        m.left_pad.y = 40.0;
        m.ball.pos = Vec2 { x: 30.0, y: 500.0 };
        m.ball.speed = Vec2 {
            x: -BALL_SPEED,
            y: 0.0,
        };

        let mut scored = Vec::new();
        for _ in 0..30 {
            scored.extend(m.step(1.0 / 60.0));
            if !scored.is_empty() {
                break;
            }
        }
        assert_eq!(scored, vec![MatchEvent::Scored(Side::Right)]);
        assert_eq!(m.score(), (0, 1));

        // Serve goes toward the side that conceded.
        assert!(m.ball.speed.x < 0.0);
        assert_approx_eq!(m.ball.pos.x, FIELD_WIDTH / 2.0, 0.01);
    }

    #[test]
    fn test_match_ends_at_win_score() {
        let mut m = Match::new();
        m.score_left = WIN_SCORE - 1;
        assert!(!m.is_over());
        m.score_left += 1;
        assert!(m.is_over());
        assert_eq!(m.winner(), Side::Left);
        assert_eq!(m.result_for(Side::Left), GameResult::Won);
        assert_eq!(m.result_for(Side::Right), GameResult::Lost);
    }
}
