// Session connection manager.
//
// Owns the current connection attempt (at most one), its liveness timer, the
// activity scheduler and the long-lived position model. Translates protocol
// client events into transitions for the supervisor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use tokio::sync::mpsc::UnboundedSender;

use crate::metrics;

use super::activity::{
    plan_chat, plan_step, plan_turn, ActivityKind, ActivityScheduler, ActivitySettings, MovePlan,
};
use super::connector::{
    AnimateAction, ConnectRequest, Connection, Connector, EntityId, EventSink, OutboundAction,
    SessionEvent,
};
use super::position::PositionState;
use super::reconnect::{Failure, FailureKind};
use super::timer::RepeatingTask;
use super::Event;

/// Server address and identity used for every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

/// What the supervisor should do after a session event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Continue,
    /// Spawn confirmed; the session is now active.
    Activated { entity_id: EntityId },
    /// The session ended and has to be torn down.
    Terminal(Failure),
}

/// One connection attempt.
struct Session {
    generation: u64,
    version: String,
    connection: Box<dyn Connection>,
    sink: EventSink,
    entity_id: Option<EntityId>,
    started: Instant,
    active_since: Option<Instant>,
    heartbeat: RepeatingTask,
}

impl Session {
    /// Stop the heartbeat, detach the event sink and close the connection.
    fn release(&mut self) {
        self.heartbeat.cancel();
        self.sink.detach();
        self.connection.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct SessionManager {
    connector: Arc<dyn Connector>,
    target: SessionTarget,
    activity_settings: ActivitySettings,
    heartbeat_interval: Duration,
    tx: UnboundedSender<Event>,
    session: Option<Session>,
    activity: ActivityScheduler,
    position: PositionState,
    rng: StdRng,
    next_generation: u64,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        target: SessionTarget,
        activity_settings: ActivitySettings,
        heartbeat_interval: Duration,
        tx: UnboundedSender<Event>,
        rng: StdRng,
    ) -> Self {
        Self {
            connector,
            target,
            activity_settings,
            heartbeat_interval,
            tx,
            session: None,
            activity: ActivityScheduler::new(),
            position: PositionState::new(),
            rng,
            next_generation: 0,
        }
    }

    /// Tear down any previous session and start a new attempt with `version`.
    ///
    /// A synchronous refusal by the connector is reported as a
    /// `ConnectRejected` failure, the same way an asynchronous error would be.
    pub fn connect(&mut self, version: &str) -> Result<u64, Failure> {
        self.close();

        self.next_generation += 1;
        let generation = self.next_generation;
        let request = ConnectRequest {
            host: self.target.host.clone(),
            port: self.target.port,
            username: self.target.username.clone(),
            version: version.to_string(),
        };
        let sink = EventSink::new(generation, self.tx.clone());

        tracing::info!(
            "Connecting to {}:{} as {} with version {} (session #{})",
            request.host,
            request.port,
            request.username,
            version,
            generation
        );
        metrics::CONNECTION_ATTEMPTS_TOTAL
            .with_label_values(&[version])
            .inc();

        match self.connector.connect(&request, sink.clone()) {
            Ok(connection) => {
                self.session = Some(Session {
                    generation,
                    version: version.to_string(),
                    connection,
                    sink,
                    entity_id: None,
                    started: Instant::now(),
                    active_since: None,
                    heartbeat: RepeatingTask::default(),
                });
                Ok(generation)
            }
            Err(e) => {
                sink.detach();
                Err(Failure::new(FailureKind::ConnectRejected, Some(e.to_string())))
            }
        }
    }

    /// Tear down the current session, if any. Idempotent.
    pub fn close(&mut self) {
        self.activity.stop();
        if let Some(mut session) = self.session.take() {
            if let Some(since) = session.active_since {
                metrics::SESSION_DURATION_SECONDS.observe(since.elapsed().as_secs_f64());
                metrics::SESSION_ACTIVE.set(0);
            }
            session.release();
            tracing::debug!(
                "Session #{} torn down after {:.1}s",
                session.generation,
                session.started.elapsed().as_secs_f64()
            );
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Spawn confirmed on the current session.
    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.active_since.is_some())
    }

    pub fn generation(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.generation)
    }

    pub fn entity_id(&self) -> Option<EntityId> {
        self.session.as_ref().and_then(|s| s.entity_id)
    }

    pub fn version(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.version.as_str())
    }

    pub fn heartbeat_armed(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.heartbeat.is_armed())
    }

    pub fn activity_running(&self) -> bool {
        self.activity.is_running()
    }

    pub fn position(&self) -> &PositionState {
        &self.position
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    /// Handle one protocol client event for session `generation`.
    pub fn dispatch(&mut self, generation: u64, event: SessionEvent) -> Transition {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.generation == generation)
        else {
            tracing::debug!("Dropping {:?} from stale session #{}", event, generation);
            return Transition::Continue;
        };

        match event {
            SessionEvent::PositionSeeded(position) => {
                if !position.is_finite() {
                    tracing::warn!("Ignoring non-finite position {:?}", position);
                } else if self.position.seed(position) {
                    tracing::info!(
                        "Anchor recorded at ({:.1}, {:.1}, {:.1})",
                        position.x,
                        position.y,
                        position.z
                    );
                } else {
                    tracing::debug!("Position seeded at {:?}", position);
                }
                Transition::Continue
            }
            SessionEvent::Spawned { runtime_id } => {
                let entity_id = match EntityId::try_from(runtime_id) {
                    Ok(id) => id,
                    Err(e) if session.active_since.is_some() => {
                        tracing::warn!(
                            "Ignoring repeated spawn notice with {}; keeping entity {:?}",
                            e,
                            session.entity_id
                        );
                        return Transition::Continue;
                    }
                    Err(e) => {
                        return Transition::Terminal(Failure::new(
                            FailureKind::InvalidSpawn,
                            Some(e.to_string()),
                        ));
                    }
                };
                session.entity_id = Some(entity_id);
                if session.active_since.is_some() {
                    tracing::debug!("Repeated spawn notice, entity id now {}", entity_id);
                    return Transition::Continue;
                }

                session.active_since = Some(Instant::now());
                let interval = self.heartbeat_interval;
                session.heartbeat = RepeatingTask::spawn(
                    move || interval,
                    self.tx.clone(),
                    move || Event::Heartbeat { generation },
                );
                self.activity
                    .start(generation, &self.activity_settings, &self.tx, &mut self.rng);
                metrics::SESSION_ACTIVE.set(1);

                tracing::info!(
                    "Spawned on {}:{} as entity {} (version {}, session #{})",
                    self.target.host,
                    self.target.port,
                    entity_id,
                    session.version,
                    generation
                );
                Transition::Activated { entity_id }
            }
            SessionEvent::TextReceived { source, message } => {
                tracing::info!("[chat] <{}> {}", source, message);
                Transition::Continue
            }
            terminal => match Failure::from_event(&terminal) {
                Some(failure) => Transition::Terminal(failure),
                None => Transition::Continue,
            },
        }
    }

    /// Run one activity tick for session `generation`.
    ///
    /// Ticks for stale sessions, or before the entity id is known, are dropped.
    pub fn on_activity(&mut self, generation: u64, kind: ActivityKind) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.generation == generation)
        else {
            return;
        };
        let Some(entity_id) = session.entity_id else {
            metrics::ACTIONS_SKIPPED_TOTAL
                .with_label_values(&[kind.as_str()])
                .inc();
            return;
        };

        match kind {
            ActivityKind::Step => {
                let radius = self.activity_settings.patrol_radius;
                match plan_step(&self.position, radius, &mut self.rng) {
                    Some(plan) => {
                        self.position.apply(plan.position, plan.pitch, plan.yaw);
                        send(session.connection.as_mut(), move_action(entity_id, &plan));
                    }
                    None => {
                        metrics::ACTIONS_SKIPPED_TOTAL
                            .with_label_values(&[kind.as_str()])
                            .inc();
                    }
                }
            }
            ActivityKind::Turn => {
                let plan = plan_turn(&self.position, &mut self.rng);
                self.position.apply(plan.position, plan.pitch, plan.yaw);
                send(session.connection.as_mut(), move_action(entity_id, &plan));
            }
            ActivityKind::Chat => {
                let plan = plan_chat(&mut self.rng);
                send(
                    session.connection.as_mut(),
                    OutboundAction::Text {
                        source: self.target.username.clone(),
                        message: plan.message.to_string(),
                    },
                );
                if plan.jump {
                    send(
                        session.connection.as_mut(),
                        OutboundAction::Animate {
                            entity_id,
                            action: AnimateAction::Jump,
                        },
                    );
                }
            }
        }
    }

    /// Periodic liveness log for the active session. Returns whether anything
    /// was logged; stale or not-yet-active sessions are skipped.
    pub fn on_heartbeat(&mut self, generation: u64) -> bool {
        let Some(session) = self.session.as_ref().filter(|s| s.generation == generation) else {
            return false;
        };
        let Some(since) = session.active_since else {
            return false;
        };
        let p = self.position.position;
        tracing::info!(
            "Still connected to {}:{} (version {}, up {}s, at {:.1}, {:.1}, {:.1})",
            self.target.host,
            self.target.port,
            session.version,
            since.elapsed().as_secs(),
            p.x,
            p.y,
            p.z
        );
        true
    }
}

fn move_action(entity_id: EntityId, plan: &MovePlan) -> OutboundAction {
    OutboundAction::Move {
        entity_id,
        position: plan.position,
        pitch: plan.pitch,
        yaw: plan.yaw,
        head_yaw: plan.yaw,
        on_ground: true,
    }
}

fn send(connection: &mut dyn Connection, action: OutboundAction) {
    metrics::ACTIONS_SENT_TOTAL
        .with_label_values(&[action.kind()])
        .inc();
    connection.send(action);
}
