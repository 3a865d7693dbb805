// Reconnection/backoff controller.
//
// Classifies terminal session events, rotates protocol-version candidates on
// mismatch, and keeps at most one retry timer pending.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use super::config::{BACKOFF_CAP, BACKOFF_STEP, MAX_ATTEMPTS, ROTATE_DELAY};
use super::connector::SessionEvent;
use super::timer::DelayedTask;
use super::Event;

/// Which terminal event (or synchronous failure) ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The connector refused to start the attempt.
    ConnectRejected,
    Errored,
    Disconnected,
    Ended,
    Closed,
    /// Spawn notice carried an unusable entity id.
    InvalidSpawn,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ConnectRejected => "connect-rejected",
            FailureKind::Errored => "error",
            FailureKind::Disconnected => "disconnect",
            FailureKind::Ended => "end",
            FailureKind::Closed => "close",
            FailureKind::InvalidSpawn => "invalid-spawn",
        }
    }
}

/// A session-ending failure with the raw text the peer or client supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: Option<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: Option<String>) -> Self {
        Self { kind, detail }
    }

    /// Translate a terminal session event. Non-terminal events yield `None`.
    pub fn from_event(event: &SessionEvent) -> Option<Self> {
        match event {
            SessionEvent::Errored(msg) => Some(Self::new(FailureKind::Errored, Some(msg.clone()))),
            SessionEvent::Disconnected(reason) => {
                Some(Self::new(FailureKind::Disconnected, reason.clone()))
            }
            SessionEvent::Ended => Some(Self::new(FailureKind::Ended, None)),
            SessionEvent::Closed => Some(Self::new(FailureKind::Closed, None)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind.as_str(), detail),
            None => write!(f, "{}", self.kind.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    TransientNetwork,
    ProtocolMismatch,
    Unclassified,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::TransientNetwork => "transient-network",
            FailureClass::ProtocolMismatch => "protocol-mismatch",
            FailureClass::Unclassified => "unclassified",
        }
    }
}

const MISMATCH_MARKERS: &[&str] = &[
    "outdated",
    "incompatible",
    "unsupported protocol",
    "unsupported version",
    "protocol version",
    "version mismatch",
    "wrong version",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "etimedout",
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "unreachable",
    "ehostunreach",
    "enetunreach",
    "enotfound",
    "eai_again",
    "no route to host",
    "broken pipe",
];

/// Put a failure into exactly one class. Mismatch markers win over transient ones.
pub fn classify(failure: &Failure) -> FailureClass {
    if failure.kind == FailureKind::InvalidSpawn {
        return FailureClass::ProtocolMismatch;
    }
    let text = failure
        .detail
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if MISMATCH_MARKERS.iter().any(|m| text.contains(m)) {
        FailureClass::ProtocolMismatch
    } else if TRANSIENT_MARKERS.iter().any(|m| text.contains(m)) {
        FailureClass::TransientNetwork
    } else {
        FailureClass::Unclassified
    }
}

/// Retry timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    /// Added per consecutive failed attempt.
    pub step: Duration,
    /// Upper bound on the added per-attempt delay.
    pub cap: Duration,
    /// Delay before trying the next candidate within a cycle.
    pub rotate_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn with_base(base: Duration) -> Self {
        Self {
            base,
            step: BACKOFF_STEP,
            cap: BACKOFF_CAP,
            rotate_delay: ROTATE_DELAY,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// `base + min(attempts * step, cap)`.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        self.base + self.step.saturating_mul(attempts).min(self.cap)
    }
}

/// What the controller decided for one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    pub class: FailureClass,
    pub delay: Duration,
    pub version: String,
    pub index: usize,
    /// Consecutive failures including this one.
    pub attempts: u32,
    pub rotated: bool,
    /// The rotation wrapped back to the first candidate.
    pub full_cycle: bool,
}

/// Candidate index, consecutive failure count and the single pending retry timer.
#[derive(Debug)]
pub struct ReconnectController {
    candidates: Vec<String>,
    index: usize,
    attempts: u32,
    policy: BackoffPolicy,
    pending: DelayedTask,
    scheduled_total: u64,
}

impl ReconnectController {
    /// `candidates` must be non-empty; configuration loading guarantees it.
    pub fn new(candidates: Vec<String>, policy: BackoffPolicy) -> Self {
        assert!(!candidates.is_empty(), "version candidate list must not be empty");
        Self {
            candidates,
            index: 0,
            attempts: 0,
            policy,
            pending: DelayedTask::default(),
            scheduled_total: 0,
        }
    }

    pub fn current_candidate(&self) -> &str {
        &self.candidates[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_armed()
    }

    /// Retries scheduled over the controller's lifetime.
    pub fn scheduled_total(&self) -> u64 {
        self.scheduled_total
    }

    /// Decide delay and candidate for a failure and advance the state.
    /// Does not touch the timer; see [`ReconnectController::schedule`].
    pub fn plan(&mut self, class: FailureClass) -> RetryPlan {
        let (delay, rotated, full_cycle) = match class {
            FailureClass::ProtocolMismatch => {
                self.index = (self.index + 1) % self.candidates.len();
                let full_cycle = self.index == 0;
                let delay = if full_cycle {
                    self.policy.base.saturating_mul(2)
                } else {
                    self.policy.rotate_delay
                };
                (delay, true, full_cycle)
            }
            FailureClass::TransientNetwork | FailureClass::Unclassified => {
                (self.policy.retry_delay(self.attempts), false, false)
            }
        };

        self.attempts = self.attempts.saturating_add(1).min(self.policy.max_attempts);

        RetryPlan {
            class,
            delay,
            version: self.current_candidate().to_string(),
            index: self.index,
            attempts: self.attempts,
            rotated,
            full_cycle,
        }
    }

    /// Plan and arm the retry timer, posting `Event::RetryDue` when it fires.
    /// Returns `None` without changing anything if a retry is already pending.
    pub fn schedule(
        &mut self,
        class: FailureClass,
        tx: &UnboundedSender<Event>,
    ) -> Option<RetryPlan> {
        if self.is_pending() {
            return None;
        }
        let plan = self.plan(class);
        self.pending = DelayedTask::spawn(plan.delay, tx.clone(), Event::RetryDue);
        self.scheduled_total += 1;
        Some(plan)
    }

    /// Called when `Event::RetryDue` arrives. Returns false if nothing was pending.
    pub fn retry_fired(&mut self) -> bool {
        if !self.pending.is_armed() {
            return false;
        }
        self.pending.cancel();
        true
    }

    pub fn cancel(&mut self) {
        self.pending.cancel();
    }

    /// A session became active: prior failures are forgiven.
    pub fn on_session_active(&mut self) {
        self.attempts = 0;
    }
}
