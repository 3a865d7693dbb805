// Contract with the external game-protocol client.
//
// The engine never speaks the wire protocol. A `Connector` opens a connection
// for one session and reports lifecycle events through an `EventSink`; the
// returned `Connection` accepts fire-and-forget outbound actions.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::position::Vec3;
use super::Event;

/// Everything the protocol client needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub version: String,
}

/// Entity identifier as the peer delivered it, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawEntityId {
    Unsigned(u64),
    Signed(i64),
    Text(String),
    /// Anything else the peer sent: fractions, out-of-range numbers, null.
    Other(serde_json::Value),
}

impl Default for RawEntityId {
    fn default() -> Self {
        RawEntityId::Other(serde_json::Value::Null)
    }
}

/// Peer-assigned runtime id of the controlled entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid entity id {raw:?}: {reason}")]
pub struct EntityIdError {
    pub raw: String,
    pub reason: &'static str,
}

impl TryFrom<RawEntityId> for EntityId {
    type Error = EntityIdError;

    fn try_from(raw: RawEntityId) -> Result<Self, Self::Error> {
        match raw {
            RawEntityId::Unsigned(v) => Ok(EntityId(v)),
            RawEntityId::Signed(v) => u64::try_from(v).map(EntityId).map_err(|_| EntityIdError {
                raw: v.to_string(),
                reason: "negative",
            }),
            RawEntityId::Text(s) => s.trim().parse::<u64>().map(EntityId).map_err(|_| EntityIdError {
                raw: s,
                reason: "not an unsigned 64-bit integer",
            }),
            RawEntityId::Other(v) => Err(EntityIdError {
                raw: v.to_string(),
                reason: "not an integer",
            }),
        }
    }
}

/// Lifecycle events reported by the protocol client for one session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Initial position notice from the peer.
    PositionSeeded(Vec3),
    /// The peer confirmed the entity spawned; actions may be addressed to it.
    Spawned { runtime_id: RawEntityId },
    TextReceived { source: String, message: String },
    Errored(String),
    Disconnected(Option<String>),
    /// End of the inbound stream.
    Ended,
    /// Underlying socket closed.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimateAction {
    Jump,
}

/// Outbound requests to the protocol client. None are acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OutboundAction {
    Move {
        entity_id: EntityId,
        position: Vec3,
        pitch: f64,
        yaw: f64,
        head_yaw: f64,
        on_ground: bool,
    },
    Animate {
        entity_id: EntityId,
        action: AnimateAction,
    },
    Text {
        source: String,
        message: String,
    },
}

impl OutboundAction {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundAction::Move { .. } => "move",
            OutboundAction::Animate { .. } => "animate",
            OutboundAction::Text { .. } => "text",
        }
    }
}

/// Handle through which a protocol client reports events for one session.
///
/// Once the session is torn down the sink is detached and further events are
/// dropped at the source.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: UnboundedSender<Event>,
    detached: CancellationToken,
}

impl EventSink {
    pub fn new(generation: u64, tx: UnboundedSender<Event>) -> Self {
        Self {
            generation,
            tx,
            detached: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns false if the sink is detached or the engine is gone.
    pub fn emit(&self, event: SessionEvent) -> bool {
        if self.detached.is_cancelled() {
            return false;
        }
        self.tx
            .send(Event::Session {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn detach(&self) {
        self.detached.cancel();
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }

    /// Resolves once the sink is detached. Lets client tasks stop promptly.
    pub async fn detached(&self) {
        self.detached.cancelled().await
    }
}

/// Synchronous failure to even start a connection attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid connect request: {0}")]
    InvalidRequest(String),
    #[error("protocol client unavailable: {0}")]
    Unavailable(String),
}

/// A live connection owned by one session.
pub trait Connection: Send {
    fn send(&mut self, action: OutboundAction);

    /// Release the connection. Must be idempotent.
    fn close(&mut self);
}

/// Factory for connections to the game server.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        request: &ConnectRequest,
        events: EventSink,
    ) -> Result<Box<dyn Connection>, ConnectError>;
}
