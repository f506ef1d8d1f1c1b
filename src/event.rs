use crate::call::session::{CallDirection, CallState};
use crate::useragent::registration::RegistrationStatus;
use serde::Serialize;

/// Changes of the phone line, broadcast to observers (UI/CLI).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LineEvent {
    Registration {
        timestamp: u64,
        status: RegistrationStatus,
    },
    CallState {
        timestamp: u64,
        state: CallState,
        direction: Option<CallDirection>,
        peer: Option<String>,
    },
    /// An invitation is waiting for answer/reject
    Incoming { timestamp: u64, caller: String },
    /// A second invitation was refused while the line was in use
    BusyRejected { timestamp: u64, caller: String },
    /// Connected time, published once per second
    Duration { timestamp: u64, elapsed: u64 },
    Error { timestamp: u64, message: String },
}

impl LineEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            LineEvent::Registration { timestamp, .. } => *timestamp,
            LineEvent::CallState { timestamp, .. } => *timestamp,
            LineEvent::Incoming { timestamp, .. } => *timestamp,
            LineEvent::BusyRejected { timestamp, .. } => *timestamp,
            LineEvent::Duration { timestamp, .. } => *timestamp,
            LineEvent::Error { timestamp, .. } => *timestamp,
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<LineEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<LineEvent>;
