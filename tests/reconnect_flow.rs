// Integration tests for the session supervisor: reconnect timing, version
// rotation, exit mode, patrol bounds and teardown, driven through a
// recording connector on tokio's paused clock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use afk_keeper::bridge::parse_event_line;
use afk_keeper::config::Config;
use afk_keeper::engine::activity::ActivityKind;
use afk_keeper::engine::connector::{
    ConnectError, ConnectRequest, Connection, Connector, EntityId, EventSink, OutboundAction,
    RawEntityId, SessionEvent,
};
use afk_keeper::engine::position::Vec3;
use afk_keeper::engine::reconnect::FailureKind;
use afk_keeper::engine::supervisor::{RunOutcome, Supervisor};
use afk_keeper::engine::Event;

// ── Recording connector ──────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    requests: Vec<ConnectRequest>,
    sinks: Vec<EventSink>,
    actions: Vec<OutboundAction>,
    closes: usize,
    refusals: VecDeque<String>,
}

#[derive(Clone, Default)]
struct MockConnector {
    state: Arc<Mutex<Recorder>>,
}

impl MockConnector {
    fn refuse_next(&self, message: &str) {
        self.state.lock().unwrap().refusals.push_back(message.to_string());
    }

    fn sink(&self, attempt: usize) -> EventSink {
        self.state.lock().unwrap().sinks[attempt].clone()
    }

    fn versions(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.requests.iter().map(|r| r.version.clone()).collect()
    }

    fn actions(&self) -> Vec<OutboundAction> {
        self.state.lock().unwrap().actions.clone()
    }

    fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        request: &ConnectRequest,
        events: EventSink,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.refusals.pop_front() {
            return Err(ConnectError::Unavailable(message));
        }
        state.requests.push(request.clone());
        state.sinks.push(events);
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<Recorder>>,
    closed: bool,
}

impl Connection for MockConnection {
    fn send(&mut self, action: OutboundAction) {
        self.state.lock().unwrap().actions.push(action);
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().closes += 1;
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

const VERSION_A: &str = "1.21.50";
const VERSION_B: &str = "1.21.40";

fn config(extra: &[(&str, &str)]) -> Config {
    let mut env: HashMap<String, String> = [
        ("SERVER_HOST", "play.example.net"),
        ("SERVER_PORT", "19132"),
        ("PROTOCOL_VERSIONS", "1.21.50,1.21.40"),
        ("RETRY_DELAY_MS", "5000"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in extra {
        env.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(&[], |key| env.get(key).cloned()).unwrap()
}

fn supervisor(config: &Config, connector: &MockConnector) -> Supervisor {
    Supervisor::with_rng(config, Arc::new(connector.clone()), StdRng::seed_from_u64(11))
}

/// Handle the next queued event.
async fn pump(sup: &mut Supervisor) -> Option<RunOutcome> {
    let event = sup.next_event().await.expect("event channel closed");
    sup.handle(event)
}

/// Wait for the retry timer and return how long it took to fire.
async fn await_retry(sup: &mut Supervisor) -> Duration {
    let start = Instant::now();
    let event = sup.next_event().await.expect("event channel closed");
    assert!(matches!(event, Event::RetryDue), "expected retry, got {event:?}");
    let elapsed = start.elapsed();
    assert!(sup.handle(event).is_none());
    elapsed
}

fn assert_delay(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected about {expected:?}, waited {elapsed:?}"
    );
}

fn spawn_session(connector: &MockConnector, attempt: usize, position: Vec3, runtime_id: u64) {
    let sink = connector.sink(attempt);
    assert!(sink.emit(SessionEvent::PositionSeeded(position)));
    assert!(sink.emit(SessionEvent::Spawned {
        runtime_id: RawEntityId::Unsigned(runtime_id),
    }));
}

// ── Reconnect timing ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_transient_failures_keep_candidate_and_back_off() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    assert!(sup.start().is_none());

    for (attempt, expected_secs) in [5, 10, 15, 20].into_iter().enumerate() {
        connector
            .sink(attempt)
            .emit(SessionEvent::Errored("connect ETIMEDOUT 10.0.0.5:19132".into()));
        assert!(pump(&mut sup).await.is_none());
        assert!(sup.reconnect().is_pending());
        assert!(!sup.sessions().has_session());

        assert_delay(await_retry(&mut sup).await, Duration::from_secs(expected_secs));
    }

    assert_eq!(connector.versions(), vec![VERSION_A; 5]);
    assert_eq!(sup.reconnect().attempts(), 4);
    assert_eq!(connector.closes(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_version_mismatch_rotates_then_cycles() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();

    connector
        .sink(0)
        .emit(SessionEvent::Disconnected(Some("outdated_server".into())));
    pump(&mut sup).await;
    assert_delay(await_retry(&mut sup).await, Duration::from_secs(1));
    assert_eq!(sup.reconnect().index(), 1);

    connector
        .sink(1)
        .emit(SessionEvent::Disconnected(Some("Outdated client!".into())));
    pump(&mut sup).await;
    // Every candidate rejected: back to the first after twice the base delay
    assert_delay(await_retry(&mut sup).await, Duration::from_secs(10));
    assert_eq!(sup.reconnect().index(), 0);

    connector
        .sink(2)
        .emit(SessionEvent::Errored("read ECONNRESET".into()));
    pump(&mut sup).await;
    assert_delay(await_retry(&mut sup).await, Duration::from_secs(15));

    assert_eq!(
        connector.versions(),
        vec![VERSION_A, VERSION_B, VERSION_A, VERSION_A]
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_spawn_id_counts_as_mismatch() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();

    connector.sink(0).emit(SessionEvent::Spawned {
        runtime_id: RawEntityId::Text("not-a-number".into()),
    });
    assert!(pump(&mut sup).await.is_none());
    assert!(!sup.sessions().is_active());
    assert_delay(await_retry(&mut sup).await, Duration::from_secs(1));
    assert_eq!(connector.versions(), vec![VERSION_A, VERSION_B]);
}

#[tokio::test(start_paused = true)]
async fn test_fractional_spawn_id_from_bridge_rotates_version() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();

    let spawn = parse_event_line(r#"{"event":"spawn","runtime_id":9.5}"#).unwrap();
    assert!(connector.sink(0).emit(spawn));
    assert!(pump(&mut sup).await.is_none());
    assert!(!sup.sessions().is_active());
    assert_delay(await_retry(&mut sup).await, Duration::from_secs(1));
    assert_eq!(connector.versions(), vec![VERSION_A, VERSION_B]);
}

#[tokio::test(start_paused = true)]
async fn test_synchronous_refusal_is_retried() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    connector.refuse_next("connect ECONNREFUSED 10.0.0.5:19132");
    let mut sup = supervisor(&cfg, &connector);

    assert!(sup.start().is_none());
    assert!(sup.reconnect().is_pending());
    assert!(connector.versions().is_empty());

    assert_delay(await_retry(&mut sup).await, Duration::from_secs(5));
    assert_eq!(connector.versions(), vec![VERSION_A]);
    assert!(sup.sessions().has_session());
}

#[tokio::test(start_paused = true)]
async fn test_attempts_reset_after_spawn() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();

    for attempt in 0..2 {
        connector.sink(attempt).emit(SessionEvent::Ended);
        pump(&mut sup).await;
        await_retry(&mut sup).await;
    }
    assert_eq!(sup.reconnect().attempts(), 2);

    spawn_session(&connector, 2, Vec3::new(0.0, 64.0, 0.0), 7);
    pump(&mut sup).await;
    pump(&mut sup).await;
    assert!(sup.sessions().is_active());
    assert_eq!(sup.reconnect().attempts(), 0);

    connector.sink(2).emit(SessionEvent::Closed);
    // Activity ticks may be queued ahead of the failure
    while sup.sessions().has_session() {
        pump(&mut sup).await;
    }
    assert_delay(await_retry(&mut sup).await, Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_failures_schedule_one_retry() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();

    let sink = connector.sink(0);
    sink.emit(SessionEvent::Errored("socket hang up".into()));
    sink.emit(SessionEvent::Ended);
    sink.emit(SessionEvent::Closed);

    pump(&mut sup).await;
    pump(&mut sup).await;
    pump(&mut sup).await;
    assert_eq!(sup.reconnect().scheduled_total(), 1);

    await_retry(&mut sup).await;
    assert_eq!(connector.versions().len(), 2);
}

// ── Exit mode and shutdown ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_exit_mode_stops_without_retry() {
    let cfg = config(&[("RECONNECT_MODE", "exit")]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();

    connector
        .sink(0)
        .emit(SessionEvent::Errored("connect ECONNREFUSED".into()));
    match pump(&mut sup).await {
        Some(outcome @ RunOutcome::ConnectionFailed(_)) => {
            assert_eq!(outcome.exit_code(), 1);
            if let RunOutcome::ConnectionFailed(failure) = outcome {
                assert_eq!(failure.kind, FailureKind::Errored);
            }
        }
        other => panic!("expected connection failure, got {other:?}"),
    }
    assert_eq!(sup.reconnect().scheduled_total(), 0);
    assert!(!sup.reconnect().is_pending());
    assert!(!sup.sessions().has_session());
    assert_eq!(connector.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exit_mode_run_returns_on_refusal() {
    let cfg = config(&[("RECONNECT_MODE", "exit")]);
    let connector = MockConnector::default();
    connector.refuse_next("no route to host");
    let mut sup = supervisor(&cfg, &connector);

    let outcome = sup.run(CancellationToken::new()).await;
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(sup.reconnect().scheduled_total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let outcome = sup.run(shutdown).await;

    assert_eq!(outcome, RunOutcome::Stopped);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(connector.versions(), vec![VERSION_A]);
    assert_eq!(connector.closes(), 1);
    assert!(!sup.sessions().has_session());
}

#[tokio::test(start_paused = true)]
async fn test_teardown_is_idempotent() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();
    spawn_session(&connector, 0, Vec3::new(0.0, 64.0, 0.0), 3);
    pump(&mut sup).await;
    pump(&mut sup).await;
    assert!(sup.sessions().activity_running());
    assert!(sup.sessions().heartbeat_armed());

    sup.shutdown();
    sup.shutdown();

    assert_eq!(connector.closes(), 1);
    assert!(!sup.sessions().activity_running());
    assert!(!sup.sessions().has_session());
    assert!(!sup.reconnect().is_pending());
    // Late events from the torn-down client are dropped at the source
    assert!(!connector.sink(0).emit(SessionEvent::Closed));
}

// ── Session events ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_stale_generation_is_ignored() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();
    let first = sup.sessions().generation().unwrap();

    connector.sink(0).emit(SessionEvent::Ended);
    pump(&mut sup).await;
    await_retry(&mut sup).await;
    let second = sup.sessions().generation().unwrap();
    assert_ne!(first, second);

    let outcome = sup.handle(Event::Session {
        generation: first,
        event: SessionEvent::Disconnected(Some("old".into())),
    });
    assert!(outcome.is_none());
    assert!(!sup.reconnect().is_pending());
    assert_eq!(sup.sessions().generation(), Some(second));

    sup.handle(Event::Activity {
        generation: first,
        kind: ActivityKind::Chat,
    });
    assert!(connector.actions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_activity_skipped_before_spawn() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();
    let generation = sup.sessions().generation().unwrap();

    connector
        .sink(0)
        .emit(SessionEvent::PositionSeeded(Vec3::new(1.0, 70.0, 1.0)));
    pump(&mut sup).await;

    for kind in [ActivityKind::Step, ActivityKind::Turn, ActivityKind::Chat] {
        sup.handle(Event::Activity { generation, kind });
    }
    assert!(connector.actions().is_empty());
    assert!(!sup.sessions().activity_running());
}

#[tokio::test(start_paused = true)]
async fn test_patrol_stays_within_radius() {
    let cfg = config(&[
        ("PATROL_RADIUS", "5"),
        ("STEP_MIN_SECS", "1"),
        ("STEP_MAX_SECS", "2"),
    ]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();
    let anchor = Vec3::new(0.0, 64.0, 0.0);
    spawn_session(&connector, 0, anchor, 42);

    for _ in 0..400 {
        assert!(pump(&mut sup).await.is_none());
        let distance = sup.sessions().position().distance_from_anchor().unwrap();
        assert!(distance <= 5.0 + 1e-9, "left the patrol area: {distance}");
    }

    let actions = connector.actions();
    let moves: Vec<_> = actions
        .iter()
        .filter_map(|a| match a {
            OutboundAction::Move {
                entity_id,
                position,
                yaw,
                head_yaw,
                on_ground,
                ..
            } => Some((*entity_id, *position, *yaw, *head_yaw, *on_ground)),
            _ => None,
        })
        .collect();
    assert!(moves.len() > 100);
    for (entity_id, position, yaw, head_yaw, on_ground) in moves {
        assert_eq!(entity_id, EntityId(42));
        assert!(position.distance_to(&anchor) <= 5.0 + 1e-9);
        assert!((0.0..360.0).contains(&yaw));
        assert_eq!(yaw, head_yaw);
        assert!(on_ground);
    }
    assert!(actions
        .iter()
        .any(|a| matches!(a, OutboundAction::Text { source, .. } if source == "AFKBot")));
}

#[tokio::test(start_paused = true)]
async fn test_anchor_survives_reconnect() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();
    let first = Vec3::new(10.0, 64.0, -4.0);
    spawn_session(&connector, 0, first, 1);
    pump(&mut sup).await;
    pump(&mut sup).await;

    connector.sink(0).emit(SessionEvent::Disconnected(None));
    while sup.sessions().has_session() {
        pump(&mut sup).await;
    }
    await_retry(&mut sup).await;

    spawn_session(&connector, 1, Vec3::new(500.0, 80.0, 500.0), 2);
    pump(&mut sup).await;
    pump(&mut sup).await;

    assert_eq!(sup.sessions().position().anchor(), Some(first));
    assert_eq!(sup.sessions().entity_id(), Some(EntityId(2)));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_spawn_updates_entity_id() {
    let cfg = config(&[]);
    let connector = MockConnector::default();
    let mut sup = supervisor(&cfg, &connector);
    sup.start();
    spawn_session(&connector, 0, Vec3::new(0.0, 64.0, 0.0), 5);
    pump(&mut sup).await;
    pump(&mut sup).await;

    connector.sink(0).emit(SessionEvent::Spawned {
        runtime_id: RawEntityId::Text("6".into()),
    });
    pump(&mut sup).await;

    assert!(sup.sessions().is_active());
    assert_eq!(sup.sessions().entity_id(), Some(EntityId(6)));

    // An unusable id on a live session is ignored
    connector.sink(0).emit(SessionEvent::Spawned {
        runtime_id: RawEntityId::Text("bad".into()),
    });
    assert!(pump(&mut sup).await.is_none());
    assert!(sup.sessions().is_active());
    assert_eq!(sup.sessions().entity_id(), Some(EntityId(6)));
    assert_eq!(sup.reconnect().scheduled_total(), 0);
}
