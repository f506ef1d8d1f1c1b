use crate::useragent::invitation::{BUSY_HERE, DECLINE};
use crate::useragent::transport::{SessionHandle, SessionHandleRef, SignalingError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Identifies one call attempt. Messages tagged with an older generation
/// belong to a session the line has already moved on from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionGeneration(u64);

impl SessionGeneration {
    pub fn next(self) -> Self {
        SessionGeneration(self.0 + 1)
    }
}

impl From<u64> for SessionGeneration {
    fn from(value: u64) -> Self {
        SessionGeneration(value)
    }
}

impl fmt::Display for SessionGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    Connected,
    Holding,
    Terminating,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Holding => "holding",
            CallState::Terminating => "terminating",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Outbound => f.write_str("outbound"),
            CallDirection::Inbound => f.write_str("inbound"),
        }
    }
}

/// How a session is ended, decided by direction and by whether it was ever
/// established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMethod {
    /// BYE on an established session
    Bye,
    /// CANCEL of our own pending invitation
    Cancel,
    /// Final error response to an inbound invitation
    Reject(u16),
}

impl TerminationMethod {
    pub fn select(direction: CallDirection, established: bool) -> Self {
        match (established, direction) {
            (true, _) => TerminationMethod::Bye,
            (false, CallDirection::Outbound) => TerminationMethod::Cancel,
            (false, CallDirection::Inbound) => TerminationMethod::Reject(DECLINE),
        }
    }

    pub fn busy() -> Self {
        TerminationMethod::Reject(BUSY_HERE)
    }

    pub async fn run(&self, handle: &dyn SessionHandle) -> Result<(), SignalingError> {
        match self {
            TerminationMethod::Bye => handle.terminate().await,
            TerminationMethod::Cancel => handle.cancel().await,
            TerminationMethod::Reject(code) => handle.reject(*code).await,
        }
    }
}

impl From<TerminationMethod> for SessionOp {
    fn from(method: TerminationMethod) -> Self {
        match method {
            TerminationMethod::Bye => SessionOp::Terminate,
            TerminationMethod::Cancel => SessionOp::Cancel,
            TerminationMethod::Reject(code) => SessionOp::Reject(code),
        }
    }
}

/// A session primitive issued by the line.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOp {
    Answer,
    Hold,
    Unhold,
    Transfer(rsip::Uri),
    Dtmf(char),
    Cancel,
    Reject(u16),
    Terminate,
}

impl SessionOp {
    pub fn name(&self) -> &'static str {
        match self {
            SessionOp::Answer => "answer",
            SessionOp::Hold => "hold",
            SessionOp::Unhold => "unhold",
            SessionOp::Transfer(_) => "transfer",
            SessionOp::Dtmf(_) => "dtmf",
            SessionOp::Cancel => "cancel",
            SessionOp::Reject(_) => "reject",
            SessionOp::Terminate => "hangup",
        }
    }

    /// Ops that renegotiate or hand over the session; at most one of them
    /// may be pending per call.
    pub fn is_exclusive(&self) -> bool {
        matches!(
            self,
            SessionOp::Answer | SessionOp::Hold | SessionOp::Unhold | SessionOp::Transfer(_)
        )
    }

    pub async fn run(&self, handle: &dyn SessionHandle) -> Result<(), SignalingError> {
        match self {
            SessionOp::Answer => handle.accept().await,
            SessionOp::Hold => handle.hold().await,
            SessionOp::Unhold => handle.unhold().await,
            SessionOp::Transfer(target) => handle.refer(target.clone()).await,
            SessionOp::Dtmf(digit) => handle.send_dtmf(*digit).await,
            SessionOp::Cancel => handle.cancel().await,
            SessionOp::Reject(code) => handle.reject(*code).await,
            SessionOp::Terminate => handle.terminate().await,
        }
    }
}

/// The single call of the line. Absent when the line is idle.
pub struct CallSession {
    pub generation: SessionGeneration,
    pub direction: CallDirection,
    pub state: CallState,
    pub peer_address: String,
    pub established_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub pending_transfer_target: Option<String>,
    /// None while an outbound session is still being created, and for an
    /// inbound call until it is answered (the gate owns the handle then).
    pub handle: Option<SessionHandleRef>,
    pub in_flight: Option<SessionOp>,
}

impl CallSession {
    pub fn outbound(generation: SessionGeneration, peer_address: impl Into<String>) -> Self {
        Self::new(generation, CallDirection::Outbound, CallState::Dialing, peer_address)
    }

    pub fn inbound(generation: SessionGeneration, peer_address: impl Into<String>) -> Self {
        Self::new(generation, CallDirection::Inbound, CallState::Ringing, peer_address)
    }

    fn new(
        generation: SessionGeneration,
        direction: CallDirection,
        state: CallState,
        peer_address: impl Into<String>,
    ) -> Self {
        Self {
            generation,
            direction,
            state,
            peer_address: peer_address.into(),
            established_at: None,
            muted: false,
            pending_transfer_target: None,
            handle: None,
            in_flight: None,
        }
    }

    pub fn was_established(&self) -> bool {
        self.established_at.is_some()
    }

    pub fn termination_method(&self) -> TerminationMethod {
        TerminationMethod::select(self.direction, self.was_established())
    }

    /// Records the first transition into Connected; later ones (after unhold)
    /// keep the original timestamp.
    pub fn mark_established(&mut self) {
        if self.established_at.is_none() {
            self.established_at = Some(Utc::now());
        }
        self.state = CallState::Connected;
    }

    pub fn snapshot(&self, duration: u64) -> CallSnapshot {
        CallSnapshot {
            direction: self.direction,
            state: self.state,
            peer_address: self.peer_address.clone(),
            established_at: self.established_at,
            muted: self.muted,
            duration,
            pending_transfer_target: self.pending_transfer_target.clone(),
            pending_operation: self.in_flight.as_ref().map(|op| op.name().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub direction: CallDirection,
    pub state: CallState,
    pub peer_address: String,
    pub established_at: Option<DateTime<Utc>>,
    pub muted: bool,
    /// Elapsed connected time in seconds
    pub duration: u64,
    pub pending_transfer_target: Option<String>,
    /// Answer, hold, unhold or transfer awaiting the transport
    pub pending_operation: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_method_by_direction() {
        use CallDirection::*;
        assert_eq!(TerminationMethod::select(Outbound, false), TerminationMethod::Cancel);
        assert_eq!(
            TerminationMethod::select(Inbound, false),
            TerminationMethod::Reject(603)
        );
        assert_eq!(TerminationMethod::select(Outbound, true), TerminationMethod::Bye);
        assert_eq!(TerminationMethod::select(Inbound, true), TerminationMethod::Bye);
        assert_eq!(TerminationMethod::busy(), TerminationMethod::Reject(486));
    }

    #[test]
    fn test_established_at_set_once() {
        let mut call = CallSession::outbound(SessionGeneration::from(1), "sip:2000@pbx");
        assert_eq!(call.termination_method(), TerminationMethod::Cancel);
        call.mark_established();
        let first = call.established_at;
        assert!(first.is_some());

        call.state = CallState::Holding;
        call.mark_established();
        assert_eq!(call.established_at, first);
        assert_eq!(call.state, CallState::Connected);
        assert_eq!(call.termination_method(), TerminationMethod::Bye);
    }

    #[test]
    fn test_exclusive_ops() {
        assert!(SessionOp::Hold.is_exclusive());
        assert!(SessionOp::Answer.is_exclusive());
        assert!(!SessionOp::Dtmf('1').is_exclusive());
        assert!(!SessionOp::Terminate.is_exclusive());
        assert_eq!(SessionOp::from(TerminationMethod::Bye), SessionOp::Terminate);
    }

    #[test]
    fn test_snapshot_serializes_snake_case() {
        let call = CallSession::inbound(SessionGeneration::from(3), "sip:3000@pbx");
        let value = serde_json::to_value(call.snapshot(0)).unwrap();
        assert_eq!(value["state"], "ringing");
        assert_eq!(value["direction"], "inbound");
        assert_eq!(value["muted"], false);
    }
}
