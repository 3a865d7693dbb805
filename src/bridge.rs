// Connector that delegates the game protocol to a sidecar process.
//
// The sidecar hosts a real protocol client and talks newline-delimited JSON
// over TCP: we send one `connect` line followed by outbound actions, it sends
// back one event per line.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::engine::connector::{
    ConnectError, ConnectRequest, Connection, Connector, EventSink, OutboundAction, RawEntityId,
    SessionEvent,
};
use crate::engine::position::Vec3;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// First line sent to the sidecar.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Hello<'a> {
    Connect {
        host: &'a str,
        port: u16,
        username: &'a str,
        version: &'a str,
    },
}

/// One line received from the sidecar.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    Position { x: f64, y: f64, z: f64 },
    Spawn {
        #[serde(default)]
        runtime_id: RawEntityId,
    },
    Text { source: String, message: String },
    Error { message: String },
    Disconnect {
        #[serde(default)]
        reason: Option<String>,
    },
    End,
}

impl From<BridgeEvent> for SessionEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Position { x, y, z } => SessionEvent::PositionSeeded(Vec3::new(x, y, z)),
            BridgeEvent::Spawn { runtime_id } => SessionEvent::Spawned { runtime_id },
            BridgeEvent::Text { source, message } => SessionEvent::TextReceived { source, message },
            BridgeEvent::Error { message } => SessionEvent::Errored(message),
            BridgeEvent::Disconnect { reason } => SessionEvent::Disconnected(reason),
            BridgeEvent::End => SessionEvent::Ended,
        }
    }
}

/// Parse one inbound line. Blank and malformed lines yield `None`.
pub fn parse_event_line(line: &str) -> Option<SessionEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<BridgeEvent>(line) {
        Ok(event) => Some(event.into()),
        Err(e) => {
            tracing::warn!("Skipping malformed bridge line {:?}: {}", line, e);
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConnector {
    addr: String,
    connect_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Connector for BridgeConnector {
    fn connect(
        &self,
        request: &ConnectRequest,
        events: EventSink,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        if request.host.trim().is_empty() {
            return Err(ConnectError::InvalidRequest("empty host".to_string()));
        }
        if request.version.trim().is_empty() {
            return Err(ConnectError::InvalidRequest("empty version".to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConnectError::Unavailable(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(run_bridge(
            self.addr.clone(),
            self.connect_timeout,
            request.clone(),
            outbound_rx,
            events,
        ));

        Ok(Box::new(BridgeConnection {
            outbound: outbound_tx,
            task: Some(task),
        }))
    }
}

pub struct BridgeConnection {
    outbound: UnboundedSender<OutboundAction>,
    task: Option<JoinHandle<()>>,
}

impl Connection for BridgeConnection {
    fn send(&mut self, action: OutboundAction) {
        if self.task.is_none() || self.outbound.send(action).is_err() {
            tracing::debug!("Dropping action on closed bridge connection");
        }
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_bridge(
    addr: String,
    connect_timeout: Duration,
    request: ConnectRequest,
    mut outbound: UnboundedReceiver<OutboundAction>,
    sink: EventSink,
) {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            sink.emit(SessionEvent::Errored(format!("bridge {addr}: {e}")));
            return;
        }
        Err(_) => {
            sink.emit(SessionEvent::Errored(format!("bridge {addr}: connect timed out")));
            return;
        }
    };

    let (read_half, mut write_half) = stream.into_split();
    let hello = Hello::Connect {
        host: &request.host,
        port: request.port,
        username: &request.username,
        version: &request.version,
    };
    if let Err(e) = write_json_line(&mut write_half, &hello).await {
        sink.emit(SessionEvent::Errored(format!("bridge {addr}: {e}")));
        return;
    }

    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            // Session torn down
            _ = sink.detached() => break,
            action = outbound.recv() => {
                let Some(action) = action else { break };
                if let Err(e) = write_json_line(&mut write_half, &action).await {
                    sink.emit(SessionEvent::Errored(format!("bridge {addr}: {e}")));
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_event_line(&line) {
                            sink.emit(event);
                        }
                    }
                    Ok(None) => {
                        sink.emit(SessionEvent::Ended);
                        sink.emit(SessionEvent::Closed);
                        break;
                    }
                    Err(e) => {
                        sink.emit(SessionEvent::Errored(format!("bridge {addr}: {e}")));
                        sink.emit(SessionEvent::Closed);
                        break;
                    }
                }
            }
        }
    }
}

async fn write_json_line<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    value: &T,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await
}
