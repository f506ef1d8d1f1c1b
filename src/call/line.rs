use super::clock::DurationClock;
use super::dial_buffer::{validate_digit, DialBuffer};
use super::session::{
    CallDirection, CallSession, CallSnapshot, CallState, SessionGeneration, SessionOp,
    TerminationMethod,
};
use crate::config::UseragentConfig;
use crate::error::PhoneError;
use crate::event::{EventReceiver, EventSender, LineEvent};
use crate::get_timestamp;
use crate::media::{LoopbackMedia, MediaBinder, MediaEngine};
use crate::useragent::invitation::{GateOutcome, IncomingCallGate, InvitationSnapshot};
use crate::useragent::registration::{
    RegisterOption, RegistrationMessage, RegistrationSession, RegistrationStatus,
    RegistrationUpdate,
};
use crate::useragent::transport::{
    bounded, SessionHandleRef, SessionState, SessionStateReceiver, SignalingError,
    SignalingTransport, TerminatedReason, TransportEvent,
};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    select,
    sync::{
        broadcast,
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) type Mailbox = UnboundedSender<LineMessage>;
pub(crate) type Reply<T = ()> = oneshot::Sender<Result<T, PhoneError>>;

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 64;

pub(crate) enum Command {
    Connect(RegisterOption, Reply),
    Disconnect(Reply),
    Dial(String, Reply),
    Answer(Reply),
    Reject(Reply),
    Hangup(Reply),
    Hold(Reply),
    Unhold(Reply),
    Mute(bool, Reply),
    Transfer(String, Reply),
    SendDigit(char, Reply),
    ClearDialBuffer(Reply),
}

/// Everything the line reacts to. Processed strictly one at a time.
pub(crate) enum LineMessage {
    Command(Command),
    Registration(RegistrationMessage),
    Transport {
        epoch: u64,
        event: TransportEvent,
    },
    SessionCreated {
        generation: SessionGeneration,
        result: Result<SessionHandleRef, SignalingError>,
        states: SessionStateReceiver,
        reply: Reply,
    },
    Session {
        generation: SessionGeneration,
        state: SessionState,
    },
    /// The transport dropped the state stream of a session.
    SessionClosed {
        generation: SessionGeneration,
    },
    OpCompleted {
        generation: SessionGeneration,
        op: SessionOp,
        result: Result<(), SignalingError>,
        reply: Option<Reply>,
    },
}

/// Observable state of the line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineSnapshot {
    pub registration: RegistrationStatus,
    pub call: Option<CallSnapshot>,
    pub invitation: Option<InvitationSnapshot>,
    pub dial_buffer: String,
    /// Most recent failure, kept until the next one
    pub last_error: Option<String>,
}

impl Default for LineSnapshot {
    fn default() -> Self {
        Self {
            registration: RegistrationStatus::Disconnected,
            call: None,
            invitation: None,
            dial_buffer: String::new(),
            last_error: None,
        }
    }
}

impl LineSnapshot {
    pub fn call_state(&self) -> CallState {
        self.call
            .as_ref()
            .map(|call| call.state)
            .unwrap_or(CallState::Idle)
    }
}

pub struct PhoneLineBuilder {
    transport: Option<Arc<dyn SignalingTransport>>,
    media: Option<Arc<dyn MediaEngine>>,
    token: Option<CancellationToken>,
    operation_timeout: Duration,
    playback_sink: String,
}

impl Default for PhoneLineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PhoneLineBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            media: None,
            token: None,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            playback_sink: "default".to_string(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_media_engine(mut self, media: Arc<dyn MediaEngine>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_playback_sink(mut self, sink: impl Into<String>) -> Self {
        self.playback_sink = sink.into();
        self
    }

    pub fn with_config(self, config: &UseragentConfig) -> Self {
        self.with_operation_timeout(Duration::from_secs(config.operation_timeout))
            .with_playback_sink(config.playback_sink.clone())
    }

    /// Spawns the line on the current tokio runtime.
    pub fn build(self) -> Result<PhoneLine> {
        let transport = self
            .transport
            .ok_or_else(|| anyhow!("signaling transport is required"))?;
        let media = self
            .media
            .unwrap_or_else(|| Arc::new(LoopbackMedia::new()) as Arc<dyn MediaEngine>);
        let token = self.token.unwrap_or_default();

        let (mailbox, receiver) = unbounded_channel();
        let (snapshot, snapshot_receiver) = watch::channel(LineSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = LineActor {
            registration: RegistrationSession::new(
                transport.clone(),
                mailbox.clone(),
                token.child_token(),
                self.operation_timeout,
            ),
            mailbox: mailbox.clone(),
            token: token.clone(),
            operation_timeout: self.operation_timeout,
            call: None,
            gate: IncomingCallGate::new(),
            binder: MediaBinder::new(media, self.playback_sink),
            clock: DurationClock::new(),
            dial_buffer: DialBuffer::default(),
            draining: HashMap::new(),
            generation: SessionGeneration::default(),
            last_error: None,
            last_tick: 0,
            snapshot,
            published: LineSnapshot::default(),
            events: events.clone(),
        };
        tokio::spawn(actor.serve(receiver));

        Ok(PhoneLine {
            mailbox,
            snapshot: snapshot_receiver,
            events,
            token,
        })
    }
}

/// Command handle of the phone line. Cheap to clone; every clone talks to
/// the same line.
#[derive(Clone)]
pub struct PhoneLine {
    mailbox: Mailbox,
    snapshot: watch::Receiver<LineSnapshot>,
    events: EventSender,
    token: CancellationToken,
}

impl PhoneLine {
    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), PhoneError> {
        let (reply, result) = oneshot::channel();
        self.mailbox
            .send(LineMessage::Command(command(reply)))
            .map_err(|_| PhoneError::LineClosed)?;
        result.await.map_err(|_| PhoneError::LineClosed)?
    }

    /// Connects and registers. Resolves once the line is Registered or the
    /// attempt failed.
    pub async fn connect(&self, option: RegisterOption) -> Result<(), PhoneError> {
        self.request(|reply| Command::Connect(option, reply)).await
    }

    /// Ends any call, unregisters and closes the transport.
    pub async fn disconnect(&self) -> Result<(), PhoneError> {
        self.request(Command::Disconnect).await
    }

    /// Resolves once the outbound session was created.
    pub async fn dial(&self, number: &str) -> Result<(), PhoneError> {
        let number = number.to_string();
        self.request(|reply| Command::Dial(number, reply)).await
    }

    pub async fn answer(&self) -> Result<(), PhoneError> {
        self.request(Command::Answer).await
    }

    pub async fn reject(&self) -> Result<(), PhoneError> {
        self.request(Command::Reject).await
    }

    pub async fn hangup(&self) -> Result<(), PhoneError> {
        self.request(Command::Hangup).await
    }

    pub async fn hold(&self) -> Result<(), PhoneError> {
        self.request(Command::Hold).await
    }

    pub async fn unhold(&self) -> Result<(), PhoneError> {
        self.request(Command::Unhold).await
    }

    pub async fn mute(&self) -> Result<(), PhoneError> {
        self.request(|reply| Command::Mute(true, reply)).await
    }

    pub async fn unmute(&self) -> Result<(), PhoneError> {
        self.request(|reply| Command::Mute(false, reply)).await
    }

    pub async fn transfer(&self, number: &str) -> Result<(), PhoneError> {
        let number = number.to_string();
        self.request(|reply| Command::Transfer(number, reply)).await
    }

    /// Appends to the dial buffer and, while Connected, sends the digit as
    /// DTMF.
    pub async fn send_digit(&self, digit: char) -> Result<(), PhoneError> {
        self.request(|reply| Command::SendDigit(digit, reply)).await
    }

    pub async fn clear_dial_buffer(&self) -> Result<(), PhoneError> {
        self.request(Command::ClearDialBuffer).await
    }

    pub fn snapshot(&self) -> LineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LineSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.mailbox.is_closed()
    }
}

struct LineActor {
    mailbox: Mailbox,
    token: CancellationToken,
    operation_timeout: Duration,
    registration: RegistrationSession,
    call: Option<CallSession>,
    gate: IncomingCallGate,
    binder: MediaBinder,
    clock: DurationClock,
    dial_buffer: DialBuffer,
    /// Sessions the line has moved on from but the transport may still
    /// report on. The handle is None while creation is still in flight.
    draining: HashMap<SessionGeneration, Option<SessionHandleRef>>,
    generation: SessionGeneration,
    last_error: Option<String>,
    last_tick: u64,
    snapshot: watch::Sender<LineSnapshot>,
    published: LineSnapshot,
    events: EventSender,
}

impl LineActor {
    async fn serve(mut self, mut receiver: UnboundedReceiver<LineMessage>) {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("phone line started");
        loop {
            select! {
                biased;
                _ = self.token.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => self.process(message),
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }
        self.stop();
    }

    fn process(&mut self, message: LineMessage) {
        match message {
            LineMessage::Command(command) => self.dispatch(command),
            LineMessage::Registration(message) => {
                let update = self.registration.on_message(message);
                self.apply_registration(update);
            }
            LineMessage::Transport { epoch, event } => self.on_transport_event(epoch, event),
            LineMessage::SessionCreated {
                generation,
                result,
                states,
                reply,
            } => self.on_session_created(generation, result, states, reply),
            LineMessage::Session { generation, state } => {
                self.on_session_state(generation, state)
            }
            LineMessage::SessionClosed { generation } => self.on_session_closed(generation),
            LineMessage::OpCompleted {
                generation,
                op,
                result,
                reply,
            } => self.on_op_completed(generation, op, result, reply),
        }
        self.publish();
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Connect(option, reply) => match self.registration.check_connect(&option) {
                Ok(()) => self.registration.start_connect(option, reply),
                Err(e) => self.respond(reply, Err(e)),
            },
            Command::Disconnect(reply) => {
                let teardown = self.abandon_call("disconnect");
                let update = self.registration.disconnect(teardown, reply);
                self.apply_registration(update);
            }
            Command::Dial(number, reply) => self.do_dial(number, reply),
            Command::Answer(reply) => self.do_answer(reply),
            Command::Reject(reply) => self.do_reject(reply),
            Command::Hangup(reply) => self.do_hangup(reply),
            Command::Hold(reply) => {
                self.start_exclusive(SessionOp::Hold, &[CallState::Connected], reply)
            }
            Command::Unhold(reply) => {
                self.start_exclusive(SessionOp::Unhold, &[CallState::Holding], reply)
            }
            Command::Mute(muted, reply) => self.do_mute(muted, reply),
            Command::Transfer(number, reply) => self.do_transfer(number, reply),
            Command::SendDigit(digit, reply) => self.do_send_digit(digit, reply),
            Command::ClearDialBuffer(reply) => {
                self.dial_buffer.clear();
                self.respond(reply, Ok(()));
            }
        }
    }

    fn do_dial(&mut self, number: String, reply: Reply) {
        if !self.registration.is_registered() {
            return self.respond(reply, Err(PhoneError::NotRegistered));
        }
        if let Some(state) = self.call.as_ref().map(|call| call.state) {
            return self.respond(reply, Err(PhoneError::invalid_state("dial", state)));
        }
        let target = match self.registration.option() {
            Some(option) => option.target_uri(&number),
            None => Err(PhoneError::NotRegistered),
        };
        let target = match target {
            Ok(target) => target,
            Err(e) => return self.respond(reply, Err(e)),
        };

        self.generation = self.generation.next();
        let generation = self.generation;
        info!(%generation, peer = %target, "dialing");
        self.call = Some(CallSession::outbound(generation, target.to_string()));
        self.publish();

        let (sender, states) = unbounded_channel();
        let transport = self.registration.transport();
        let mailbox = self.mailbox.clone();
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            let result = bounded(timeout, transport.create_outbound_session(target, sender)).await;
            mailbox
                .send(LineMessage::SessionCreated {
                    generation,
                    result,
                    states,
                    reply,
                })
                .ok();
        });
    }

    fn on_session_created(
        &mut self,
        generation: SessionGeneration,
        result: Result<SessionHandleRef, SignalingError>,
        states: SessionStateReceiver,
        reply: Reply,
    ) {
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%generation, "outbound session failed: {}", e);
                self.draining.remove(&generation);
                if self.is_current(generation) {
                    self.finish_call("session creation failed");
                }
                return self.respond(reply, Err(PhoneError::Transport(e.to_string())));
            }
        };

        self.spawn_state_loop(generation, states);
        match self.call.as_mut().filter(|call| call.generation == generation) {
            Some(call) => {
                info!(%generation, session = handle.id(), "outbound session created");
                call.handle = Some(handle);
                self.respond(reply, Ok(()));
            }
            None => {
                info!(%generation, session = handle.id(), "session created after hangup, cancelling");
                self.draining.insert(generation, Some(handle.clone()));
                self.spawn_op(generation, SessionOp::Cancel, handle, None);
                self.respond(
                    reply,
                    Err(PhoneError::operation_failed(
                        "dial",
                        "hung up before the call was placed",
                    )),
                );
            }
        }
    }

    fn do_answer(&mut self, reply: Reply) {
        let outbound = self
            .call
            .as_ref()
            .filter(|call| call.direction == CallDirection::Outbound)
            .map(|call| format!("{} ({})", call.state, call.direction));
        if let Some(state) = outbound {
            return self.respond(reply, Err(PhoneError::invalid_state("answer", state)));
        }
        self.start_exclusive(SessionOp::Answer, &[CallState::Ringing], reply);
    }

    fn do_reject(&mut self, reply: Reply) {
        match self.call.as_ref() {
            Some(call)
                if call.direction == CallDirection::Inbound && call.state == CallState::Ringing =>
            {
                let generation = call.generation;
                if let Some((handle, method)) = self.abandon_call("rejected") {
                    self.spawn_op(generation, method.into(), handle, None);
                }
                self.respond(reply, Ok(()));
            }
            Some(call) => {
                let state = call.state;
                self.respond(reply, Err(PhoneError::invalid_state("reject", state)))
            }
            None => self.respond(reply, Err(PhoneError::invalid_state("reject", CallState::Idle))),
        }
    }

    fn do_hangup(&mut self, reply: Reply) {
        let Some(call) = self.call.as_mut() else {
            return self.respond(reply, Ok(()));
        };
        let generation = call.generation;
        match call.state {
            CallState::Idle | CallState::Terminating => self.respond(reply, Ok(())),
            CallState::Connected | CallState::Holding => {
                info!(%generation, "hanging up");
                call.state = CallState::Terminating;
                match call.handle.clone() {
                    Some(handle) => {
                        self.spawn_op(generation, SessionOp::Terminate, handle, Some(reply))
                    }
                    None => {
                        self.finish_call("hangup");
                        self.respond(reply, Ok(()));
                    }
                }
            }
            CallState::Dialing | CallState::Ringing => {
                if let Some((handle, method)) = self.abandon_call("hangup") {
                    self.spawn_op(generation, method.into(), handle, None);
                }
                self.respond(reply, Ok(()));
            }
        }
    }

    fn do_mute(&mut self, muted: bool, reply: Reply) {
        let command = if muted { "mute" } else { "unmute" };
        let Some(call) = self.call.as_mut() else {
            return self.respond(reply, Err(PhoneError::invalid_state(command, CallState::Idle)));
        };
        call.muted = muted;
        self.binder.set_muted(muted);
        debug!(generation = %call.generation, muted, "local track");
        self.respond(reply, Ok(()));
    }

    fn do_transfer(&mut self, number: String, reply: Reply) {
        let target = match self.registration.option() {
            Some(option) => option.target_uri(&number),
            None => Err(PhoneError::NotRegistered),
        };
        match target {
            Ok(target) => {
                self.start_exclusive(SessionOp::Transfer(target), &[CallState::Connected], reply)
            }
            Err(e) => self.respond(reply, Err(e)),
        }
    }

    fn do_send_digit(&mut self, digit: char, reply: Reply) {
        let digit = match validate_digit(digit) {
            Ok(digit) => digit,
            Err(e) => return self.respond(reply, Err(e)),
        };
        self.dial_buffer.push(digit);

        let target = match self.call.as_ref() {
            Some(call) if call.state == CallState::Connected => call
                .handle
                .clone()
                .map(|handle| (call.generation, handle))
                .ok_or_else(|| PhoneError::invalid_state("dtmf", call.state)),
            Some(call) => Err(PhoneError::invalid_state("dtmf", call.state)),
            None => Err(PhoneError::invalid_state("dtmf", CallState::Idle)),
        };
        match target {
            Ok((generation, handle)) => {
                self.spawn_op(generation, SessionOp::Dtmf(digit), handle, Some(reply))
            }
            Err(e) => self.respond(reply, Err(e)),
        }
    }

    /// Hold, unhold, answer and transfer: one at a time per call.
    fn start_exclusive(&mut self, op: SessionOp, allowed: &[CallState], reply: Reply) {
        let prepared = match self.call.as_ref() {
            None => Err(PhoneError::invalid_state(op.name(), CallState::Idle)),
            Some(call) if !allowed.contains(&call.state) => {
                Err(PhoneError::invalid_state(op.name(), call.state))
            }
            Some(call) => match call.in_flight.as_ref() {
                Some(pending) => Err(PhoneError::invalid_state(
                    op.name(),
                    format!("{} with {} pending", call.state, pending.name()),
                )),
                None => call
                    .handle
                    .clone()
                    .or_else(|| self.gate.handle(call.generation))
                    .map(|handle| (call.generation, handle))
                    .ok_or_else(|| PhoneError::invalid_state(op.name(), call.state)),
            },
        };
        let (generation, handle) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.respond(reply, Err(e)),
        };
        if let Some(call) = self.call.as_mut() {
            if let SessionOp::Transfer(target) = &op {
                call.pending_transfer_target = Some(target.to_string());
            }
            call.in_flight = Some(op.clone());
        }
        info!(%generation, op = op.name(), "session operation");
        self.spawn_op(generation, op, handle, Some(reply));
    }

    fn on_op_completed(
        &mut self,
        generation: SessionGeneration,
        op: SessionOp,
        result: Result<(), SignalingError>,
        reply: Option<Reply>,
    ) {
        let terminating = matches!(
            op,
            SessionOp::Terminate | SessionOp::Cancel | SessionOp::Reject(_)
        );
        if !self.is_current(generation) {
            if let Err(e) = &result {
                debug!(%generation, op = op.name(), "operation on finished call failed: {}", e);
            }
            if let Some(reply) = reply {
                let result = match result {
                    // the call ended while the accept was in flight
                    _ if op == SessionOp::Answer => {
                        Err(PhoneError::operation_failed(op.name(), "call ended"))
                    }
                    Err(e) if !terminating => Err(PhoneError::operation_failed(op.name(), e)),
                    _ => Ok(()),
                };
                self.respond(reply, result);
            }
            return;
        }
        if terminating {
            // only a Bye of the current call comes back here
            if let Err(e) = &result {
                self.record_error(format!("hangup: {}", e));
            }
            self.finish_call("hangup acknowledged");
            if let Some(reply) = reply {
                self.respond(reply, Ok(()));
            }
            return;
        }

        let Some(call) = self.call.as_mut() else {
            return;
        };
        if op.is_exclusive() && call.in_flight.as_ref() == Some(&op) {
            call.in_flight = None;
        }
        if let SessionOp::Transfer(_) = op {
            call.pending_transfer_target = None;
        }
        let state = call.state;
        let outcome = match result {
            Err(e) => {
                warn!(%generation, op = op.name(), "operation failed: {}", e);
                Err(PhoneError::operation_failed(op.name(), e))
            }
            Ok(()) => match (&op, state) {
                (SessionOp::Answer, CallState::Ringing) => {
                    self.enter_connected();
                    Ok(())
                }
                (SessionOp::Answer, CallState::Connected) => Ok(()),
                (SessionOp::Hold, CallState::Connected) => {
                    call.state = CallState::Holding;
                    info!(%generation, "call on hold");
                    Ok(())
                }
                (SessionOp::Unhold, CallState::Holding) => {
                    call.state = CallState::Connected;
                    info!(%generation, "call resumed");
                    Ok(())
                }
                (SessionOp::Transfer(target), _) => {
                    info!(%generation, %target, "transfer accepted");
                    Ok(())
                }
                (SessionOp::Dtmf(_), _) => Ok(()),
                (op, state) => Err(PhoneError::invalid_state(op.name(), state)),
            },
        };
        if let Some(reply) = reply {
            self.respond(reply, outcome);
        }
    }

    fn on_transport_event(&mut self, epoch: u64, event: TransportEvent) {
        if !self.registration.is_current(epoch) {
            if let TransportEvent::InviteReceived(invitation) = event {
                debug!(epoch, caller = invitation.caller, "invitation on stale connection");
                self.spawn_primitive(invitation.handle, TerminationMethod::busy());
            }
            return;
        }
        match event {
            TransportEvent::InviteReceived(invitation) => {
                let line_idle = self.call.is_none();
                match self.gate.offer(invitation, line_idle, self.generation.next()) {
                    GateOutcome::Held { generation, states } => {
                        self.generation = generation;
                        let caller = self
                            .gate
                            .pending()
                            .map(|pending| pending.caller.clone())
                            .unwrap_or_default();
                        self.call = Some(CallSession::inbound(generation, caller));
                        self.spawn_state_loop(generation, states);
                    }
                    GateOutcome::Busy { caller, handle } => {
                        self.emit(LineEvent::BusyRejected {
                            timestamp: get_timestamp(),
                            caller,
                        });
                        self.spawn_primitive(handle, TerminationMethod::busy());
                    }
                }
            }
            TransportEvent::Deregistered(reason) => {
                let update = self.registration.on_deregistered(&reason);
                self.apply_registration(update);
            }
            TransportEvent::Disconnected(reason) => {
                let update = self.registration.on_connection_lost(&reason);
                if self.call.is_some() {
                    self.finish_call("connection lost");
                }
                self.apply_registration(update);
            }
        }
    }

    fn on_session_state(&mut self, generation: SessionGeneration, state: SessionState) {
        if !self.is_current(generation) {
            return self.on_stale_session_state(generation, state);
        }
        let Some(call) = self.call.as_mut() else {
            return;
        };
        match state {
            SessionState::Provisional(code) => {
                if call.direction == CallDirection::Outbound && call.state == CallState::Dialing {
                    info!(%generation, code, "remote ringing");
                    call.state = CallState::Ringing;
                }
            }
            SessionState::Established => match (call.direction, call.state) {
                (CallDirection::Outbound, CallState::Dialing | CallState::Ringing) => {
                    self.enter_connected()
                }
                (CallDirection::Inbound, CallState::Ringing)
                    if call.in_flight == Some(SessionOp::Answer) =>
                {
                    self.enter_connected()
                }
                (_, state) => debug!(%generation, %state, "establishment ignored"),
            },
            SessionState::Terminated(reason) => self.on_terminated(reason),
        }
    }

    fn on_stale_session_state(&mut self, generation: SessionGeneration, state: SessionState) {
        let Some(handle) = self.draining.get(&generation).cloned() else {
            debug!(%generation, ?state, "state of unknown session ignored");
            return;
        };
        match state {
            SessionState::Established => {
                self.draining.remove(&generation);
                if let Some(handle) = handle {
                    warn!(%generation, session = handle.id(), "abandoned session established, sending bye");
                    self.spawn_op(generation, SessionOp::Terminate, handle, None);
                }
            }
            SessionState::Terminated(reason) => {
                debug!(%generation, ?reason, "abandoned session terminated");
                self.draining.remove(&generation);
            }
            SessionState::Provisional(_) => {}
        }
    }

    fn on_terminated(&mut self, reason: TerminatedReason) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        let generation = call.generation;
        match &reason {
            TerminatedReason::RemoteCancel if self.gate.is_pending(generation) => {
                info!(%generation, caller = call.peer_address, "invitation withdrawn");
            }
            TerminatedReason::RemoteRejected(code) => {
                self.record_error(format!("call rejected by remote party: {}", code));
            }
            TerminatedReason::Failed(message) => {
                self.record_error(format!("call failed: {}", message));
            }
            _ => {}
        }
        self.finish_call(&format!("{:?}", reason));
    }

    fn on_session_closed(&mut self, generation: SessionGeneration) {
        self.draining.remove(&generation);
        let open = self
            .call
            .as_ref()
            .filter(|call| call.generation == generation)
            .is_some();
        if open {
            warn!(%generation, "session closed by transport");
            self.on_terminated(TerminatedReason::Failed("session closed".to_string()));
        }
    }

    fn enter_connected(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.handle.is_none() {
            call.handle = self.gate.resolve(call.generation).map(|pending| pending.handle);
        } else {
            self.gate.resolve(call.generation);
        }
        call.mark_established();
        info!(generation = %call.generation, peer = call.peer_address, "call connected");
        let media = call.handle.as_ref().map(|handle| handle.media());
        let muted = call.muted;
        self.clock.start();
        self.binder.set_muted(muted);
        if let Some(media) = media {
            if let Err(e) = self.binder.bind(&media) {
                self.record_error(format!("media bind failed: {}", e));
            }
        }
    }

    /// Drops the call without sending anything.
    fn finish_call(&mut self, reason: &str) {
        let Some(call) = self.call.take() else {
            return;
        };
        self.gate.resolve(call.generation);
        info!(generation = %call.generation, state = %call.state, reason, "call ended");
        self.release_media();
    }

    /// Ends the call locally without waiting for the transport. Returns the
    /// termination primitive still to be sent, if any.
    fn abandon_call(&mut self, reason: &str) -> Option<(SessionHandleRef, TerminationMethod)> {
        let call = self.call.take()?;
        let generation = call.generation;
        let pending = self.gate.resolve(generation).map(|pending| pending.handle);
        let handle = call.handle.clone().or(pending);
        let method = call.termination_method();
        info!(%generation, state = %call.state, reason, ?method, "call abandoned");
        self.draining.insert(generation, handle.clone());
        self.release_media();
        if call.state == CallState::Terminating {
            return None;
        }
        handle.map(|handle| (handle, method))
    }

    fn release_media(&mut self) {
        self.binder.unbind();
        self.binder.set_muted(false);
        self.clock.stop();
        self.last_tick = 0;
    }

    fn is_current(&self, generation: SessionGeneration) -> bool {
        self.call
            .as_ref()
            .map(|call| call.generation == generation)
            .unwrap_or(false)
    }

    fn spawn_state_loop(&self, generation: SessionGeneration, mut states: SessionStateReceiver) {
        let mailbox = self.mailbox.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = token.cancelled() => return,
                    state = states.recv() => match state {
                        Some(state) => {
                            let terminated = matches!(state, SessionState::Terminated(_));
                            if mailbox.send(LineMessage::Session { generation, state }).is_err() {
                                return;
                            }
                            if terminated {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            mailbox.send(LineMessage::SessionClosed { generation }).ok();
        });
    }

    fn spawn_op(
        &self,
        generation: SessionGeneration,
        op: SessionOp,
        handle: SessionHandleRef,
        reply: Option<Reply>,
    ) {
        let mailbox = self.mailbox.clone();
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            let result = bounded(timeout, op.run(handle.as_ref())).await;
            mailbox
                .send(LineMessage::OpCompleted {
                    generation,
                    op,
                    result,
                    reply,
                })
                .ok();
        });
    }

    /// Fire and forget, for sessions the line never owned.
    fn spawn_primitive(&self, handle: SessionHandleRef, method: TerminationMethod) {
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            if let Err(e) = bounded(timeout, method.run(handle.as_ref())).await {
                warn!(session = handle.id(), ?method, "refusing invitation failed: {}", e);
            }
        });
    }

    fn apply_registration(&mut self, update: RegistrationUpdate) {
        match update {
            RegistrationUpdate::None => {}
            RegistrationUpdate::Settled(reply, result) => self.respond(reply, result),
            RegistrationUpdate::Lost(reason) => self.record_error(reason),
        }
    }

    fn on_tick(&mut self) {
        if self.clock.is_running() {
            let elapsed = self.clock.elapsed();
            if elapsed != self.last_tick {
                self.last_tick = elapsed;
                self.emit(LineEvent::Duration {
                    timestamp: get_timestamp(),
                    elapsed,
                });
            }
        }
        self.publish();
    }

    /// Publishes the snapshot before the caller learns the outcome.
    fn respond(&mut self, reply: Reply, result: Result<(), PhoneError>) {
        if let Err(e) = &result {
            self.record_error(e.to_string());
        }
        self.publish();
        reply.send(result).ok();
    }

    fn record_error(&mut self, message: String) {
        warn!(error = message, "line error");
        self.last_error = Some(message.clone());
        self.emit(LineEvent::Error {
            timestamp: get_timestamp(),
            message,
        });
    }

    fn emit(&self, event: LineEvent) {
        // no subscribers is fine
        self.events.send(event).ok();
    }

    fn current_snapshot(&self) -> LineSnapshot {
        LineSnapshot {
            registration: self.registration.status().clone(),
            call: self
                .call
                .as_ref()
                .map(|call| call.snapshot(self.clock.elapsed())),
            invitation: self.gate.snapshot(),
            dial_buffer: self.dial_buffer.as_str().to_string(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&mut self) {
        let snapshot = self.current_snapshot();
        if snapshot == self.published {
            return;
        }
        let timestamp = get_timestamp();
        if snapshot.registration != self.published.registration {
            self.emit(LineEvent::Registration {
                timestamp,
                status: snapshot.registration.clone(),
            });
        }
        let call_key = |s: &LineSnapshot| {
            s.call
                .as_ref()
                .map(|c| (c.state, c.direction, c.peer_address.clone()))
        };
        if call_key(&snapshot) != call_key(&self.published) {
            self.emit(LineEvent::CallState {
                timestamp,
                state: snapshot.call_state(),
                direction: snapshot.call.as_ref().map(|c| c.direction),
                peer: snapshot.call.as_ref().map(|c| c.peer_address.clone()),
            });
        }
        if let Some(invitation) = snapshot.invitation.as_ref() {
            if self.published.invitation.as_ref() != Some(invitation) {
                self.emit(LineEvent::Incoming {
                    timestamp,
                    caller: invitation.identity.clone(),
                });
            }
        }
        self.snapshot.send_replace(snapshot.clone());
        self.published = snapshot;
    }

    fn stop(&mut self) {
        if let Some((handle, method)) = self.abandon_call("line stopped") {
            self.spawn_primitive(handle, method);
        }
        self.publish();
        info!("phone line stopped");
    }
}
