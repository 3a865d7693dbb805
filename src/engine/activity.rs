// Idle activity: step, turn and chat planners, and the timers that drive them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::UnboundedSender;

use super::config::{
    CHAT_PHRASES, JUMP_PROBABILITY, MAX_PITCH, RETURN_STEP, STEP_HEADINGS, STEP_LENGTHS,
};
use super::position::{PositionState, Vec3};
use super::timer::{DelayPolicy, RepeatingTask};
use super::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Step,
    Turn,
    Chat,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Step => "step",
            ActivityKind::Turn => "turn",
            ActivityKind::Chat => "chat",
        }
    }
}

/// Timing and bounds for idle activity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySettings {
    pub step: DelayPolicy,
    pub turn: DelayPolicy,
    pub chat: DelayPolicy,
    pub patrol_radius: f64,
}

/// A planned position/orientation update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovePlan {
    pub position: Vec3,
    pub pitch: f64,
    pub yaw: f64,
}

/// A planned chat line, optionally followed by a jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatPlan {
    pub message: &'static str,
    pub jump: bool,
}

/// Yaw (degrees, `[0, 360)`) facing along `(dx, dz)`. Yaw 0 points along +z,
/// yaw 90 along +x, matching the `(sin, cos)` projection used for steps.
pub fn yaw_towards(dx: f64, dz: f64) -> f64 {
    dx.atan2(dz).to_degrees().rem_euclid(360.0)
}

/// Plan one patrol step.
///
/// At or beyond the patrol radius the entity walks back toward the anchor.
/// Otherwise it takes a 1 or 2 unit step forward, back, left or right of its
/// heading; a step that would leave the radius is skipped, not clamped.
pub fn plan_step<R: Rng + ?Sized>(
    state: &PositionState,
    radius: f64,
    rng: &mut R,
) -> Option<MovePlan> {
    let anchor = state.anchor()?;
    let pos = state.position;
    let distance = pos.distance_to(&anchor);

    if distance >= radius {
        if distance <= f64::EPSILON {
            return None;
        }
        let ux = (anchor.x - pos.x) / distance;
        let uy = (anchor.y - pos.y) / distance;
        let uz = (anchor.z - pos.z) / distance;
        // Never overshoot the anchor
        let step = RETURN_STEP.min(distance);
        return Some(MovePlan {
            position: Vec3::new(pos.x + ux * step, pos.y + uy * step, pos.z + uz * step),
            pitch: state.pitch,
            yaw: yaw_towards(ux, uz),
        });
    }

    let length = STEP_LENGTHS[rng.gen_range(0..STEP_LENGTHS.len())];
    let heading = (state.yaw + STEP_HEADINGS[rng.gen_range(0..STEP_HEADINGS.len())]).to_radians();
    let candidate = Vec3::new(
        pos.x + heading.sin() * length,
        pos.y,
        pos.z + heading.cos() * length,
    );

    if candidate.distance_to(&anchor) > radius {
        return None;
    }

    Some(MovePlan {
        position: candidate,
        pitch: state.pitch,
        yaw: state.yaw,
    })
}

/// Plan a random look-around. Position is unchanged.
pub fn plan_turn<R: Rng + ?Sized>(state: &PositionState, rng: &mut R) -> MovePlan {
    MovePlan {
        position: state.position,
        pitch: rng.gen_range(-MAX_PITCH..=MAX_PITCH),
        yaw: rng.gen_range(0.0..360.0),
    }
}

pub fn plan_chat<R: Rng + ?Sized>(rng: &mut R) -> ChatPlan {
    ChatPlan {
        message: CHAT_PHRASES[rng.gen_range(0..CHAT_PHRASES.len())],
        jump: rng.gen_bool(JUMP_PROBABILITY),
    }
}

/// The three independent activity timers of an active session.
///
/// Each timer posts `Event::Activity` tagged with the session generation, so
/// ticks that race with teardown are recognisable as stale.
#[derive(Debug, Default)]
pub struct ActivityScheduler {
    step: RepeatingTask,
    turn: RepeatingTask,
    chat: RepeatingTask,
}

impl ActivityScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start all three timers, replacing any that are running.
    pub fn start(
        &mut self,
        generation: u64,
        settings: &ActivitySettings,
        tx: &UnboundedSender<Event>,
        rng: &mut StdRng,
    ) {
        self.stop();
        self.step = Self::spawn_timer(ActivityKind::Step, settings.step, generation, tx, rng);
        self.turn = Self::spawn_timer(ActivityKind::Turn, settings.turn, generation, tx, rng);
        self.chat = Self::spawn_timer(ActivityKind::Chat, settings.chat, generation, tx, rng);
    }

    /// Cancel all timers. Safe to call when nothing is running.
    pub fn stop(&mut self) {
        self.step.cancel();
        self.turn.cancel();
        self.chat.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.step.is_armed() || self.turn.is_armed() || self.chat.is_armed()
    }

    fn spawn_timer(
        kind: ActivityKind,
        policy: DelayPolicy,
        generation: u64,
        tx: &UnboundedSender<Event>,
        rng: &mut StdRng,
    ) -> RepeatingTask {
        let timer_rng = StdRng::seed_from_u64(rng.gen());
        RepeatingTask::spawn(policy.sampler(timer_rng), tx.clone(), move || {
            Event::Activity { generation, kind }
        })
    }
}
