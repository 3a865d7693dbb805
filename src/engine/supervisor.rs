// Supervisor: the single task that owns the session manager and the
// reconnect controller and consumes every engine event.

use std::str::FromStr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::metrics;

use super::connector::Connector;
use super::reconnect::{classify, Failure, ReconnectController};
use super::session::{SessionManager, SessionTarget, Transition};
use super::Event;

/// What to do after a session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    /// Schedule another attempt.
    Retry,
    /// Stop the process with a failure status.
    Exit,
}

impl FromStr for ReconnectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(ReconnectMode::Retry),
            "exit" => Ok(ReconnectMode::Exit),
            other => Err(format!("expected \"retry\" or \"exit\", got {other:?}")),
        }
    }
}

/// Why the event loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Shutdown was requested from outside.
    Stopped,
    /// A session failed while running in exit mode.
    ConnectionFailed(Failure),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Stopped => 0,
            RunOutcome::ConnectionFailed(_) => 1,
        }
    }
}

pub struct Supervisor {
    mode: ReconnectMode,
    sessions: SessionManager,
    reconnect: ReconnectController,
    tx: UnboundedSender<Event>,
    rx: UnboundedReceiver<Event>,
}

impl Supervisor {
    pub fn new(config: &Config, connector: Arc<dyn Connector>) -> Self {
        Self::with_rng(config, connector, StdRng::from_entropy())
    }

    /// Build with an explicit random source, for reproducible runs.
    pub fn with_rng(config: &Config, connector: Arc<dyn Connector>, rng: StdRng) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let target = SessionTarget {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
        };
        let sessions = SessionManager::new(
            connector,
            target,
            config.activity_settings(),
            config.heartbeat_interval,
            tx.clone(),
            rng,
        );
        let reconnect = ReconnectController::new(config.versions.clone(), config.backoff());

        Self {
            mode: config.reconnect_mode,
            sessions,
            reconnect,
            tx,
            rx,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn reconnect(&self) -> &ReconnectController {
        &self.reconnect
    }

    /// Open the first session with the first candidate version.
    pub fn start(&mut self) -> Option<RunOutcome> {
        self.connect_current()
    }

    /// Wait for the next event. The supervisor holds a sender, so this only
    /// returns `None` if the channel is closed externally.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Process one event. Returns an outcome when the loop has to stop.
    pub fn handle(&mut self, event: Event) -> Option<RunOutcome> {
        match event {
            Event::Session { generation, event } => {
                match self.sessions.dispatch(generation, event) {
                    Transition::Continue => None,
                    Transition::Activated { .. } => {
                        self.reconnect.on_session_active();
                        metrics::CONSECUTIVE_FAILURES.set(0);
                        None
                    }
                    Transition::Terminal(failure) => self.on_failure(failure),
                }
            }
            Event::Activity { generation, kind } => {
                self.sessions.on_activity(generation, kind);
                None
            }
            Event::Heartbeat { generation } => {
                self.sessions.on_heartbeat(generation);
                None
            }
            Event::RetryDue => {
                if self.reconnect.retry_fired() {
                    self.connect_current()
                } else {
                    tracing::debug!("Ignoring retry timer with nothing pending");
                    None
                }
            }
        }
    }

    /// Run until shutdown is requested or exit mode gives up.
    pub async fn run(&mut self, shutdown: CancellationToken) -> RunOutcome {
        if let Some(outcome) = self.start() {
            return outcome;
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.shutdown();
                    return RunOutcome::Stopped;
                }
                event = self.rx.recv() => {
                    let Some(event) = event else {
                        self.shutdown();
                        return RunOutcome::Stopped;
                    };
                    if let Some(outcome) = self.handle(event) {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Cancel the pending retry and tear down the session. Idempotent.
    pub fn shutdown(&mut self) {
        self.reconnect.cancel();
        self.sessions.close();
        tracing::info!("Session engine stopped");
    }

    fn connect_current(&mut self) -> Option<RunOutcome> {
        let version = self.reconnect.current_candidate().to_string();
        match self.sessions.connect(&version) {
            Ok(_) => None,
            Err(failure) => self.on_failure(failure),
        }
    }

    fn on_failure(&mut self, failure: Failure) -> Option<RunOutcome> {
        let version = self
            .sessions
            .version()
            .unwrap_or(self.reconnect.current_candidate())
            .to_string();
        self.sessions.close();

        let class = classify(&failure);
        metrics::SESSION_FAILURES_TOTAL
            .with_label_values(&[class.as_str()])
            .inc();
        let target = self.sessions.target();
        tracing::warn!(
            "Session to {}:{} with version {} failed ({}): {}",
            target.host,
            target.port,
            version,
            class.as_str(),
            failure
        );

        if self.mode == ReconnectMode::Exit {
            tracing::error!("Reconnect mode is exit, giving up");
            self.reconnect.cancel();
            return Some(RunOutcome::ConnectionFailed(failure));
        }

        match self.reconnect.schedule(class, &self.tx) {
            Some(plan) => {
                metrics::RETRIES_SCHEDULED_TOTAL.inc();
                metrics::CONSECUTIVE_FAILURES.set(i64::from(plan.attempts));
                if plan.rotated {
                    metrics::VERSION_ROTATIONS_TOTAL.inc();
                }
                if plan.full_cycle {
                    tracing::warn!(
                        "Every version candidate was rejected, restarting from {} in {:?}",
                        plan.version,
                        plan.delay
                    );
                } else {
                    tracing::info!(
                        "Retrying with version {} (candidate {}, {} consecutive failures) in {:?}",
                        plan.version,
                        plan.index,
                        plan.attempts,
                        plan.delay
                    );
                }
            }
            None => tracing::debug!("Retry already pending, ignoring: {}", failure),
        }
        None
    }
}
