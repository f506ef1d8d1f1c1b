use super::invitation::IncomingInvitation;
use super::registration::{RegisterOption, UserCredential};
use super::transport::{
    SessionHandle, SessionHandleRef, SessionState, SessionStateSender, SignalingError,
    SignalingTransport, TerminatedReason, TransportEvent, TransportEventSender,
};
use crate::media::MediaHandle;
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::{mpsc::unbounded_channel, watch};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LoopbackOption {
    /// Password the registrar insists on; any credential passes when unset.
    pub password: Option<String>,
    pub reachable: bool,
    /// Expiry granted on register; the requested one is echoed when unset.
    pub granted_expires: Option<u32>,
    /// Remote party rings and then answers outbound sessions after this delay.
    pub answer_after: Option<Duration>,
    /// Local cancel/reject/bye/accept are confirmed by the matching session
    /// state, as a remote party would.
    pub auto_respond: bool,
}

impl Default for LoopbackOption {
    fn default() -> Self {
        Self {
            password: None,
            reachable: true,
            granted_expires: None,
            answer_after: None,
            auto_respond: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Connect,
    Register,
    Unregister,
    Close,
    Invite,
    Accept,
    Reject,
    Cancel,
    Bye,
    Hold,
    Unhold,
    Dtmf,
    Refer,
}

/// A primitive the loopback transport was asked to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    Connect(String),
    Register { username: String, expires: u32 },
    Unregister,
    Close,
    Invite(String),
    Accept(String),
    Reject(String, u16),
    Cancel(String),
    Bye(String),
    Hold(String),
    Unhold(String),
    Dtmf(String, char),
    Refer(String, String),
}

impl Primitive {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Primitive::Connect(_) => PrimitiveKind::Connect,
            Primitive::Register { .. } => PrimitiveKind::Register,
            Primitive::Unregister => PrimitiveKind::Unregister,
            Primitive::Close => PrimitiveKind::Close,
            Primitive::Invite(_) => PrimitiveKind::Invite,
            Primitive::Accept(_) => PrimitiveKind::Accept,
            Primitive::Reject(..) => PrimitiveKind::Reject,
            Primitive::Cancel(_) => PrimitiveKind::Cancel,
            Primitive::Bye(_) => PrimitiveKind::Bye,
            Primitive::Hold(_) => PrimitiveKind::Hold,
            Primitive::Unhold(_) => PrimitiveKind::Unhold,
            Primitive::Dtmf(..) => PrimitiveKind::Dtmf,
            Primitive::Refer(..) => PrimitiveKind::Refer,
        }
    }
}

#[derive(Default)]
struct Inner {
    option: LoopbackOption,
    journal: Vec<Primitive>,
    failures: HashMap<PrimitiveKind, SignalingError>,
    events: Option<TransportEventSender>,
    sessions: HashMap<String, SessionStateSender>,
    last_session: Option<String>,
}

impl Inner {
    fn record(&mut self, primitive: Primitive) -> Result<(), SignalingError> {
        debug!(?primitive, "loopback primitive");
        let kind = primitive.kind();
        self.journal.push(primitive);
        match self.failures.remove(&kind) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    /// Primitives that block until resumed
    paused: watch::Sender<HashSet<PrimitiveKind>>,
}

impl Shared {
    fn new(option: LoopbackOption) -> Arc<Self> {
        let (paused, _) = watch::channel(HashSet::new());
        Arc::new(Self {
            inner: Mutex::new(Inner {
                option,
                ..Default::default()
            }),
            paused,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn unpaused(&self, kind: PrimitiveKind) -> Result<(), SignalingError> {
        let mut paused = self.paused.subscribe();
        if paused.wait_for(|set| !set.contains(&kind)).await.is_err() {
            return Err(SignalingError::Failed("transport dropped".to_string()));
        }
        Ok(())
    }
}

/// In-process signaling transport. Sessions are played by the transport
/// itself; tests and the demo shell drive the remote side through it.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(LoopbackOption::default())
    }
}

impl LoopbackTransport {
    pub fn new(option: LoopbackOption) -> Self {
        Self {
            shared: Shared::new(option),
        }
    }

    pub fn journal(&self) -> Vec<Primitive> {
        self.shared.lock().journal.clone()
    }

    pub fn count(&self, kind: PrimitiveKind) -> usize {
        self.shared
            .lock()
            .journal
            .iter()
            .filter(|p| p.kind() == kind)
            .count()
    }

    /// The next primitive of `kind` fails with `error`.
    pub fn fail_next(&self, kind: PrimitiveKind, error: SignalingError) {
        self.shared.lock().failures.insert(kind, error);
    }

    /// Primitives of `kind` block until [`Self::resume`]. Pausing
    /// [`PrimitiveKind::Invite`] holds outbound session creation.
    pub fn pause(&self, kind: PrimitiveKind) {
        self.shared.paused.send_modify(|set| {
            set.insert(kind);
        });
    }

    pub fn resume(&self, kind: PrimitiveKind) {
        self.shared.paused.send_modify(|set| {
            set.remove(&kind);
        });
    }

    pub fn last_session(&self) -> Option<String> {
        self.shared.lock().last_session.clone()
    }

    /// Reports `state` on the most recent session, as the remote side would.
    /// A terminated session is forgotten.
    pub fn emit(&self, state: SessionState) -> bool {
        let mut inner = self.shared.lock();
        let Some(id) = inner.last_session.clone() else {
            return false;
        };
        let terminated = matches!(state, SessionState::Terminated(_));
        let sent = inner
            .sessions
            .get(&id)
            .map(|sender| sender.send(state).is_ok())
            .unwrap_or(false);
        if terminated {
            inner.sessions.remove(&id);
        }
        sent
    }

    /// Raises an inbound invitation and returns its session id.
    pub fn inject_invite(
        &self,
        caller: &str,
        display_name: Option<&str>,
    ) -> Result<String, SignalingError> {
        let mut inner = self.shared.lock();
        let Some(events) = inner.events.clone() else {
            return Err(SignalingError::Failed("not connected".to_string()));
        };
        let (sender, receiver) = unbounded_channel();
        let id = Uuid::new_v4().to_string();
        let handle: SessionHandleRef = Arc::new(LoopbackSession {
            id: id.clone(),
            shared: self.shared.clone(),
            states: sender.clone(),
        });
        inner.sessions.insert(id.clone(), sender);
        inner.last_session = Some(id.clone());

        let mut invitation = IncomingInvitation::new(caller, handle, receiver);
        if let Some(name) = display_name {
            invitation = invitation.with_display_name(name);
        }
        info!(caller, session = id, "loopback: inbound invitation");
        events
            .send(TransportEvent::InviteReceived(invitation))
            .map_err(|_| SignalingError::Failed("transport events closed".to_string()))?;
        Ok(id)
    }

    pub fn drop_connection(&self, reason: &str) {
        let mut inner = self.shared.lock();
        if let Some(events) = inner.events.take() {
            events
                .send(TransportEvent::Disconnected(reason.to_string()))
                .ok();
        }
        inner.sessions.clear();
    }

    pub fn deregister(&self, reason: &str) {
        let inner = self.shared.lock();
        if let Some(events) = inner.events.as_ref() {
            events
                .send(TransportEvent::Deregistered(reason.to_string()))
                .ok();
        }
    }
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    async fn connect(
        &self,
        option: &RegisterOption,
        events: TransportEventSender,
    ) -> Result<(), SignalingError> {
        self.shared.unpaused(PrimitiveKind::Connect).await?;
        let mut inner = self.shared.lock();
        inner.record(Primitive::Connect(option.server.clone()))?;
        if !inner.option.reachable {
            return Err(SignalingError::Unreachable(option.server.clone()));
        }
        inner.events = Some(events);
        Ok(())
    }

    async fn register(
        &self,
        option: &RegisterOption,
        credential: Option<&UserCredential>,
        expires: u32,
    ) -> Result<u32, SignalingError> {
        self.shared.unpaused(PrimitiveKind::Register).await?;
        let mut inner = self.shared.lock();
        inner.record(Primitive::Register {
            username: option.username.clone(),
            expires,
        })?;
        if let Some(required) = inner.option.password.as_ref() {
            let supplied = credential.map(|c| c.password.as_str());
            if supplied != Some(required.as_str()) {
                return Err(SignalingError::Rejected {
                    code: 403,
                    reason: "Forbidden".to_string(),
                });
            }
        }
        Ok(inner.option.granted_expires.unwrap_or(expires))
    }

    async fn unregister(&self) -> Result<(), SignalingError> {
        self.shared.lock().record(Primitive::Unregister)
    }

    async fn close(&self) -> Result<(), SignalingError> {
        let mut inner = self.shared.lock();
        inner.events = None;
        inner.sessions.clear();
        inner.record(Primitive::Close)
    }

    async fn create_outbound_session(
        &self,
        target: rsip::Uri,
        states: SessionStateSender,
    ) -> Result<SessionHandleRef, SignalingError> {
        self.shared.unpaused(PrimitiveKind::Invite).await?;

        let mut inner = self.shared.lock();
        inner.record(Primitive::Invite(target.to_string()))?;
        if inner.events.is_none() {
            return Err(SignalingError::Failed("not connected".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        inner.sessions.insert(id.clone(), states.clone());
        inner.last_session = Some(id.clone());

        if let Some(delay) = inner.option.answer_after {
            let states = states.clone();
            tokio::spawn(async move {
                states.send(SessionState::Provisional(180)).ok();
                tokio::time::sleep(delay).await;
                states.send(SessionState::Established).ok();
            });
        }
        info!(%target, session = id, "loopback: outbound session");
        Ok(Arc::new(LoopbackSession {
            id,
            shared: self.shared.clone(),
            states,
        }))
    }
}

pub struct LoopbackSession {
    id: String,
    shared: Arc<Shared>,
    states: SessionStateSender,
}

impl LoopbackSession {
    /// A session not attached to any transport.
    pub fn detached(states: SessionStateSender) -> SessionHandleRef {
        Arc::new(LoopbackSession {
            id: Uuid::new_v4().to_string(),
            shared: Shared::new(LoopbackOption::default()),
            states,
        })
    }

    async fn perform(
        &self,
        primitive: Primitive,
        response: Option<SessionState>,
    ) -> Result<(), SignalingError> {
        self.shared.unpaused(primitive.kind()).await?;
        let mut inner = self.shared.lock();
        inner.record(primitive)?;
        if inner.option.auto_respond {
            if let Some(state) = response {
                if matches!(state, SessionState::Terminated(_)) {
                    inner.sessions.remove(&self.id);
                }
                self.states.send(state).ok();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionHandle for LoopbackSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn media(&self) -> MediaHandle {
        MediaHandle::new(format!("loopback-{}", self.id))
    }

    async fn accept(&self) -> Result<(), SignalingError> {
        self.perform(
            Primitive::Accept(self.id.clone()),
            Some(SessionState::Established),
        )
        .await
    }

    async fn reject(&self, code: u16) -> Result<(), SignalingError> {
        self.perform(
            Primitive::Reject(self.id.clone(), code),
            Some(SessionState::Terminated(TerminatedReason::Declined)),
        )
        .await
    }

    async fn cancel(&self) -> Result<(), SignalingError> {
        self.perform(
            Primitive::Cancel(self.id.clone()),
            Some(SessionState::Terminated(TerminatedReason::Cancelled)),
        )
        .await
    }

    async fn terminate(&self) -> Result<(), SignalingError> {
        self.perform(
            Primitive::Bye(self.id.clone()),
            Some(SessionState::Terminated(TerminatedReason::LocalBye)),
        )
        .await
    }

    async fn hold(&self) -> Result<(), SignalingError> {
        self.perform(Primitive::Hold(self.id.clone()), None).await
    }

    async fn unhold(&self) -> Result<(), SignalingError> {
        self.perform(Primitive::Unhold(self.id.clone()), None).await
    }

    async fn send_dtmf(&self, digit: char) -> Result<(), SignalingError> {
        self.perform(Primitive::Dtmf(self.id.clone(), digit), None).await
    }

    /// The transferee hangs up on us once the referral is accepted.
    async fn refer(&self, target: rsip::Uri) -> Result<(), SignalingError> {
        self.perform(
            Primitive::Refer(self.id.clone(), target.to_string()),
            Some(SessionState::Terminated(TerminatedReason::RemoteBye)),
        )
        .await
    }
}
