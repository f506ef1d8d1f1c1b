use super::transport::{SessionHandleRef, SessionStateReceiver};
use crate::call::session::SessionGeneration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

pub const BUSY_HERE: u16 = 486;
pub const DECLINE: u16 = 603;

/// An inbound request to establish a session, as raised by the transport.
pub struct IncomingInvitation {
    /// Caller URI, e.g. sip:3000@10.42.0.1
    pub caller: String,
    pub display_name: Option<String>,
    pub handle: SessionHandleRef,
    pub states: SessionStateReceiver,
}

impl IncomingInvitation {
    pub fn new(caller: impl Into<String>, handle: SessionHandleRef, states: SessionStateReceiver) -> Self {
        Self {
            caller: caller.into(),
            display_name: None,
            handle,
            states,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// Display name when the caller sent one, the caller URI otherwise.
pub fn caller_identity(caller: &str, display_name: Option<&str>) -> String {
    match display_name {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => caller.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvitationSnapshot {
    pub caller: String,
    pub identity: String,
    pub received_at: DateTime<Utc>,
}

pub struct PendingInvitation {
    pub generation: SessionGeneration,
    pub caller: String,
    pub display_name: Option<String>,
    pub handle: SessionHandleRef,
    pub received_at: DateTime<Utc>,
}

impl PendingInvitation {
    pub fn identity(&self) -> String {
        caller_identity(&self.caller, self.display_name.as_deref())
    }
}

pub enum GateOutcome {
    /// The invitation now occupies the slot; its state events must be
    /// consumed under `generation`.
    Held {
        generation: SessionGeneration,
        states: SessionStateReceiver,
    },
    /// A call is already in progress; the invitation must be refused.
    Busy {
        caller: String,
        handle: SessionHandleRef,
    },
}

/// Single-slot buffer for one pending inbound invitation.
#[derive(Default)]
pub struct IncomingCallGate {
    slot: Option<PendingInvitation>,
}

impl IncomingCallGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(
        &mut self,
        invitation: IncomingInvitation,
        line_idle: bool,
        generation: SessionGeneration,
    ) -> GateOutcome {
        let IncomingInvitation {
            caller,
            display_name,
            handle,
            states,
        } = invitation;

        if !line_idle || self.slot.is_some() {
            info!(caller, session = handle.id(), "line busy, refusing invitation");
            return GateOutcome::Busy { caller, handle };
        }

        info!(caller, %generation, session = handle.id(), "holding invitation");
        self.slot = Some(PendingInvitation {
            generation,
            caller,
            display_name,
            handle,
            received_at: Utc::now(),
        });
        GateOutcome::Held { generation, states }
    }

    pub fn pending(&self) -> Option<&PendingInvitation> {
        self.slot.as_ref()
    }

    pub fn is_pending(&self, generation: SessionGeneration) -> bool {
        self.slot
            .as_ref()
            .map(|p| p.generation == generation)
            .unwrap_or(false)
    }

    pub fn handle(&self, generation: SessionGeneration) -> Option<SessionHandleRef> {
        self.slot
            .as_ref()
            .filter(|p| p.generation == generation)
            .map(|p| p.handle.clone())
    }

    /// Clears the slot when it holds `generation`: the invitation was
    /// accepted, rejected or withdrawn.
    pub fn resolve(&mut self, generation: SessionGeneration) -> Option<PendingInvitation> {
        if self.is_pending(generation) {
            self.slot.take()
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> Option<InvitationSnapshot> {
        self.slot.as_ref().map(|p| InvitationSnapshot {
            caller: p.caller.clone(),
            identity: p.identity(),
            received_at: p.received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::useragent::loopback::LoopbackSession;
    use tokio::sync::mpsc::unbounded_channel;

    fn invitation(caller: &str) -> IncomingInvitation {
        let (sender, receiver) = unbounded_channel();
        let handle = LoopbackSession::detached(sender);
        IncomingInvitation::new(caller, handle, receiver)
    }

    #[test]
    fn test_caller_identity_prefers_display_name() {
        assert_eq!(caller_identity("sip:3000@pbx", Some("Alice")), "Alice");
        assert_eq!(caller_identity("sip:3000@pbx", Some("  ")), "sip:3000@pbx");
        assert_eq!(caller_identity("sip:3000@pbx", None), "sip:3000@pbx");
    }

    #[test]
    fn test_gate_holds_one_invitation() {
        let mut gate = IncomingCallGate::new();
        let first = SessionGeneration::from(1);
        let second = SessionGeneration::from(2);

        assert!(matches!(
            gate.offer(invitation("sip:3000@pbx"), true, first),
            GateOutcome::Held { .. }
        ));
        assert!(gate.is_pending(first));

        match gate.offer(invitation("sip:4000@pbx"), true, second) {
            GateOutcome::Busy { caller, .. } => assert_eq!(caller, "sip:4000@pbx"),
            GateOutcome::Held { .. } => panic!("second invitation must be refused"),
        }
        assert!(gate.is_pending(first));
        assert_eq!(gate.snapshot().unwrap().caller, "sip:3000@pbx");
    }

    #[test]
    fn test_gate_refuses_while_call_active() {
        let mut gate = IncomingCallGate::new();
        let outcome = gate.offer(invitation("sip:3000@pbx"), false, SessionGeneration::from(1));
        assert!(matches!(outcome, GateOutcome::Busy { .. }));
        assert!(gate.pending().is_none());
    }

    #[test]
    fn test_resolve_only_matching_generation() {
        let mut gate = IncomingCallGate::new();
        let generation = SessionGeneration::from(7);
        gate.offer(
            invitation("sip:3000@pbx").with_display_name("Bob"),
            true,
            generation,
        );
        assert!(gate.resolve(SessionGeneration::from(6)).is_none());
        assert!(gate.handle(generation).is_some());

        let pending = gate.resolve(generation).unwrap();
        assert_eq!(pending.identity(), "Bob");
        assert!(gate.pending().is_none());
        assert!(gate.snapshot().is_none());
    }
}
