// Session engine: connection lifecycle, reconnection and idle activity.
//
// All engine state is owned by the `Supervisor` and mutated from one task.
// Timers and protocol clients only ever post `Event`s into its channel.

pub mod activity;
pub mod config;
pub mod connector;
pub mod position;
pub mod reconnect;
pub mod session;
pub mod supervisor;
pub mod timer;

use activity::ActivityKind;
use connector::SessionEvent;

/// Everything the supervisor's event loop consumes.
#[derive(Debug)]
pub enum Event {
    /// Lifecycle event from the protocol client of session `generation`.
    Session {
        generation: u64,
        event: SessionEvent,
    },
    /// An activity timer of session `generation` fired.
    Activity {
        generation: u64,
        kind: ActivityKind,
    },
    /// Liveness log timer of session `generation` fired.
    Heartbeat { generation: u64 },
    /// The pending retry timer fired.
    RetryDue,
}
