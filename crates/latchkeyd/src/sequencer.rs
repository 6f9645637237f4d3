//! Gate actuation state machine.
//!
//! ```text
//!   RESTING --accepted match--> OPEN --dwell elapsed--> COOLDOWN --cooldown elapsed--> RESTING
//! ```
//!
//! Dwell and cooldown are deadlines checked by [`Sequencer::poll`], so the
//! frame loop keeps running while the gate is open. Matches seen outside
//! RESTING are ignored: one sustained presence yields one cycle.

use std::time::{Duration, Instant};

use latchkey_core::MatchResult;
use latchkey_hw::Servo;

/// Time source for dwell and cooldown deadlines.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

/// Wall-clock-independent monotonic time.
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorState {
    Resting,
    Open,
    Cooldown,
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub open_angle: f32,
    pub rest_angle: f32,
    pub dwell: Duration,
    pub cooldown: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            open_angle: 180.0,
            rest_angle: 0.0,
            dwell: Duration::from_millis(4000),
            cooldown: Duration::from_millis(1000),
        }
    }
}

/// Sole owner of the gate servo.
///
/// Dropping the sequencer commands rest and releases the servo, whatever
/// state it was in.
pub struct Sequencer<C: Clock = MonotonicClock> {
    servo: Box<dyn Servo>,
    clock: C,
    timing: Timing,
    state: ActuatorState,
    deadline: Option<Instant>,
    shut_down: bool,
}

impl<C: Clock> Sequencer<C> {
    /// Take ownership of the servo and drive it to rest.
    pub fn new(servo: Box<dyn Servo>, clock: C, timing: Timing) -> Self {
        let mut seq = Self {
            servo,
            clock,
            timing,
            state: ActuatorState::Resting,
            deadline: None,
            shut_down: false,
        };
        seq.command(timing.rest_angle);
        seq
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    /// Advance timed transitions whose deadline has passed.
    pub fn poll(&mut self) -> ActuatorState {
        let now = self.clock.now();
        match (self.state, self.deadline) {
            (ActuatorState::Open, Some(deadline)) if now >= deadline => {
                self.command(self.timing.rest_angle);
                self.enter(ActuatorState::Cooldown, Some(now + self.timing.cooldown));
            }
            (ActuatorState::Cooldown, Some(deadline)) if now >= deadline => {
                self.enter(ActuatorState::Resting, None);
            }
            _ => {}
        }
        self.state
    }

    /// Feed one frame's match results. Returns `true` if this frame opened
    /// the gate.
    ///
    /// Any number of accepted matches in the frame counts as one trigger.
    pub fn on_frame(&mut self, results: &[MatchResult]) -> bool {
        self.poll();
        let Some(trigger) = results.iter().find(|r| r.accepted) else {
            return false;
        };
        if self.state != ActuatorState::Resting {
            tracing::trace!(name = %trigger.name, state = ?self.state, "match ignored");
            return false;
        }

        tracing::info!(name = %trigger.name, distance = trigger.distance, "access granted");
        self.command(self.timing.open_angle);
        let now = self.clock.now();
        self.enter(ActuatorState::Open, Some(now + self.timing.dwell));
        true
    }

    /// Rest the actuator and stop driving it. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.command(self.timing.rest_angle);
        if let Err(e) = self.servo.release() {
            tracing::warn!(error = %e, "servo release failed");
        }
        self.state = ActuatorState::Resting;
        self.deadline = None;
        tracing::info!("actuator at rest, servo released");
    }

    fn enter(&mut self, state: ActuatorState, deadline: Option<Instant>) {
        tracing::debug!(from = ?self.state, to = ?state, "actuator transition");
        self.state = state;
        self.deadline = deadline;
    }

    /// Fire-and-forget with a single retry. A servo fault never stops the loop.
    fn command(&mut self, angle: f32) {
        if let Err(first) = self.servo.set_angle(angle) {
            tracing::warn!(angle, error = %first, "servo command failed, retrying");
            if let Err(e) = self.servo.set_angle(angle) {
                tracing::error!(angle, error = %e, "servo command failed twice, giving up");
            }
        }
    }
}

impl<C: Clock> Drop for Sequencer<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
