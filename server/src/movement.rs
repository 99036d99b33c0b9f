//! Fixed-rate movement and collision resolution.
//!
//! Clients only ask to walk somewhere; the server advances every walker once
//! per tick and decides where they actually are. A step that would land inside
//! one of the walker's collision rectangles cancels the whole move and leaves
//! the walker at the last valid position. There is no sliding.

use log::debug;
use shared::{first_collision, Direction, MotionState, PlayerMoved, Vector2};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::registry::Session;

/// What happened to one walker during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Advanced towards the destination
    Moved,
    /// Close enough to snap onto the destination
    Arrived,
    /// The step would have entered a collision rectangle
    Blocked,
}

#[derive(Debug, Clone)]
pub struct MovementEngine {
    /// Distance covered by one tick of walking
    step_distance: f64,
    snap_threshold: f64,
    tick: u64,
}

impl MovementEngine {
    pub fn new(walk_speed: f64, tick_rate: u32, snap_threshold: f64) -> Self {
        Self {
            step_distance: walk_speed / tick_rate as f64,
            snap_threshold,
            tick: 0,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.walk_speed, config.tick_rate, config.snap_threshold)
    }

    pub fn step_distance(&self) -> f64 {
        self.step_distance
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Validates and accepts a walk request
    ///
    /// The raw target is checked against the session's geometry before
    /// anything changes; a rejected request leaves the session untouched.
    pub fn request_move(&self, session: &mut Session, target: Vector2) -> Result<()> {
        if !target.is_finite() {
            return Err(ServerError::InvalidRequest(format!(
                "non-finite move target ({}, {})",
                target.x, target.y
            )));
        }
        if let Some(rect) = first_collision(&session.collision, &target) {
            debug!(
                "Player {} move to ({:.1}, {:.1}) rejected by {:?}",
                session.player_id, target.x, target.y, rect
            );
            return Err(ServerError::PreconditionFailed(
                "move target is inside a collision rectangle".into(),
            ));
        }

        session.destination = Some(target);
        session.motion = MotionState::Walking;
        Ok(())
    }

    /// Advances one session by one tick. Returns `None` if it was not walking.
    pub fn advance(&self, session: &mut Session) -> Option<StepOutcome> {
        let destination = match session.destination {
            Some(destination) => destination,
            None => {
                session.motion = MotionState::Idle;
                return None;
            }
        };

        let remaining = destination.sub(&session.position);
        let distance = remaining.magnitude();

        if distance < self.snap_threshold {
            session.position = destination;
            session.stop();
            return Some(StepOutcome::Arrived);
        }

        let ratio = (self.step_distance / distance).min(1.0);
        let step = remaining.scale(ratio);
        let candidate = session.position.add(&step);

        if first_collision(&session.collision, &candidate).is_some() {
            session.stop();
            return Some(StepOutcome::Blocked);
        }

        session.position = candidate;
        session.direction = Direction::from_delta(step.x, step.y);
        Some(StepOutcome::Moved)
    }

    /// Runs one tick over every session and returns the batched deltas
    ///
    /// Only sessions whose state changed produce a record. Records are
    /// ordered by player id so a tick's batch is deterministic.
    pub fn tick<'a, I>(&mut self, sessions: I) -> Vec<PlayerMoved>
    where
        I: IntoIterator<Item = &'a mut Session>,
    {
        self.tick += 1;

        let mut moves: Vec<PlayerMoved> = sessions
            .into_iter()
            .filter_map(|session| {
                self.advance(session).map(|_| PlayerMoved {
                    player_id: session.player_id,
                    position: session.position,
                    direction: session.direction,
                    motion: session.motion,
                })
            })
            .collect();

        moves.sort_by_key(|record| record.player_id);
        moves
    }
}
