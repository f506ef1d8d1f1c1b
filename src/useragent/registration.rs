use super::transport::{
    bounded, SessionHandleRef, SignalingError, SignalingTransport, TransportEventReceiver,
};
use crate::call::line::{LineMessage, Mailbox, Reply};
use crate::call::session::TerminationMethod;
use crate::error::PhoneError;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{select, sync::mpsc::unbounded_channel, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_EXPIRES: u32 = 3600;

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq, Eq)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RegisterOption {
    /// Signaling server, e.g. ws://10.42.0.1:8088/ws
    pub server: String,
    /// SIP domain used for our AOR and for dial targets
    pub domain: String,
    pub username: String,
    pub display_name: Option<String>,
    pub credential: Option<UserCredential>,
    pub expires: Option<u32>,
    pub useragent: Option<String>,
}

impl RegisterOption {
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    /// Turns a dialed number into a SIP URI in our domain. Numbers that are
    /// already `sip:`/`sips:` URIs are used as they are.
    pub fn target_uri(&self, number: &str) -> Result<rsip::Uri, PhoneError> {
        let number = number.trim();
        if number.is_empty() || number.chars().any(char::is_whitespace) {
            return Err(PhoneError::InvalidTarget(format!("{:?}", number)));
        }
        let target = if number.starts_with("sip:") || number.starts_with("sips:") {
            number.to_string()
        } else {
            format!("sip:{}@{}", number, self.domain)
        };
        rsip::Uri::try_from(target.clone())
            .map_err(|e| PhoneError::InvalidTarget(format!("{}: {}", target, e)))
    }

    fn validate(&self) -> Result<(), PhoneError> {
        if self.server.trim().is_empty() {
            return Err(PhoneError::Connect("no signaling server configured".to_string()));
        }
        if self.domain.trim().is_empty() || self.username.trim().is_empty() {
            return Err(PhoneError::InvalidTarget(format!(
                "incomplete address of record: {}",
                self.aor()
            )));
        }
        rsip::Uri::try_from(self.aor())
            .map(|_| ())
            .map_err(|e| PhoneError::InvalidTarget(format!("{}: {}", self.aor(), e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RegistrationStatus {
    Disconnected,
    Connecting,
    Connected,
    Registering,
    Registered,
    Unregistered,
    Failed(String),
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStatus::Disconnected => write!(f, "disconnected"),
            RegistrationStatus::Connecting => write!(f, "connecting"),
            RegistrationStatus::Connected => write!(f, "connected"),
            RegistrationStatus::Registering => write!(f, "registering"),
            RegistrationStatus::Registered => write!(f, "registered"),
            RegistrationStatus::Unregistered => write!(f, "unregistered"),
            RegistrationStatus::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

pub(crate) enum RegistrationMessage {
    ConnectCompleted {
        epoch: u64,
        result: Result<(), SignalingError>,
        reply: Reply,
    },
    /// Connected; the handshake starts on the next turn so observers see
    /// the connected status.
    RegisterDue {
        epoch: u64,
        reply: Reply,
    },
    RegisterCompleted {
        epoch: u64,
        result: Result<u32, SignalingError>,
        reply: Reply,
    },
    RefreshDue {
        epoch: u64,
    },
    RefreshCompleted {
        epoch: u64,
        result: Result<u32, SignalingError>,
    },
    DisconnectCompleted {
        result: Result<(), SignalingError>,
        reply: Reply,
    },
}

/// What the line has to do after a registration message was applied.
pub(crate) enum RegistrationUpdate {
    None,
    Settled(Reply, Result<(), PhoneError>),
    /// Registration was lost without anyone waiting on it.
    Lost(String),
}

/// Owns the connect -> register lifecycle and the transport connection.
///
/// Every attempt runs under an epoch; completions and transport events of an
/// older epoch are stale and never touch the current status.
pub struct RegistrationSession {
    transport: Arc<dyn SignalingTransport>,
    mailbox: Mailbox,
    token: CancellationToken,
    operation_timeout: Duration,
    status: RegistrationStatus,
    option: Option<RegisterOption>,
    epoch: u64,
    expires: u32,
    closing: bool,
}

impl RegistrationSession {
    pub(crate) fn new(
        transport: Arc<dyn SignalingTransport>,
        mailbox: Mailbox,
        token: CancellationToken,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            mailbox,
            token,
            operation_timeout,
            status: RegistrationStatus::Disconnected,
            option: None,
            epoch: 0,
            expires: 0,
            closing: false,
        }
    }

    pub fn status(&self) -> &RegistrationStatus {
        &self.status
    }

    pub fn is_registered(&self) -> bool {
        self.status == RegistrationStatus::Registered
    }

    pub fn option(&self) -> Option<&RegisterOption> {
        self.option.as_ref()
    }

    pub(crate) fn transport(&self) -> Arc<dyn SignalingTransport> {
        self.transport.clone()
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    pub(crate) fn check_connect(&self, option: &RegisterOption) -> Result<(), PhoneError> {
        if self.closing {
            return Err(PhoneError::invalid_state("connect", "disconnecting"));
        }
        match self.status {
            RegistrationStatus::Disconnected
            | RegistrationStatus::Unregistered
            | RegistrationStatus::Failed(_) => option.validate(),
            _ => Err(PhoneError::invalid_state("connect", &self.status)),
        }
    }

    pub(crate) fn start_connect(&mut self, option: RegisterOption, reply: Reply) {
        self.epoch += 1;
        self.status = RegistrationStatus::Connecting;
        info!(
            aor = option.aor(),
            server = option.server.as_str(),
            epoch = self.epoch,
            "connecting"
        );

        let (event_sender, event_receiver) = unbounded_channel();
        self.spawn_event_loop(event_receiver);

        let epoch = self.epoch;
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let timeout = self.operation_timeout;
        self.option = Some(option.clone());
        tokio::spawn(async move {
            let result = bounded(timeout, transport.connect(&option, event_sender)).await;
            mailbox
                .send(LineMessage::Registration(
                    RegistrationMessage::ConnectCompleted {
                        epoch,
                        result,
                        reply,
                    },
                ))
                .ok();
        });
    }

    fn spawn_event_loop(&self, mut receiver: TransportEventReceiver) {
        let epoch = self.epoch;
        let mailbox = self.mailbox.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = token.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => {
                            if mailbox.send(LineMessage::Transport { epoch, event }).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!(epoch, "transport event loop done");
        });
    }

    fn spawn_register(&self, reply: Option<Reply>) {
        let Some(option) = self.option.clone() else {
            return;
        };
        let epoch = self.epoch;
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            let expires = option.expires.unwrap_or(DEFAULT_EXPIRES);
            let result = bounded(
                timeout,
                transport.register(&option, option.credential.as_ref(), expires),
            )
            .await;
            let message = match reply {
                Some(reply) => RegistrationMessage::RegisterCompleted {
                    epoch,
                    result,
                    reply,
                },
                None => RegistrationMessage::RefreshCompleted { epoch, result },
            };
            mailbox.send(LineMessage::Registration(message)).ok();
        });
    }

    fn schedule_refresh(&self) {
        if self.expires == 0 {
            return;
        }
        // 75% of the granted expiry
        let refresh_after = Duration::from_secs(self.expires as u64 * 3 / 4);
        let epoch = self.epoch;
        let mailbox = self.mailbox.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => {}
                _ = sleep(refresh_after) => {
                    mailbox
                        .send(LineMessage::Registration(RegistrationMessage::RefreshDue { epoch }))
                        .ok();
                }
            }
        });
    }

    pub(crate) fn on_message(&mut self, message: RegistrationMessage) -> RegistrationUpdate {
        match message {
            RegistrationMessage::ConnectCompleted {
                epoch,
                result,
                reply,
            } => {
                if !self.is_current(epoch) {
                    debug!(epoch, "stale connect completion");
                    return RegistrationUpdate::Settled(
                        reply,
                        Err(PhoneError::Connect("connection attempt superseded".to_string())),
                    );
                }
                match result {
                    Ok(()) => {
                        self.status = RegistrationStatus::Connected;
                        info!(epoch, "connected");
                        self.mailbox
                            .send(LineMessage::Registration(RegistrationMessage::RegisterDue {
                                epoch,
                                reply,
                            }))
                            .ok();
                        RegistrationUpdate::None
                    }
                    Err(e) => {
                        warn!(epoch, "connect failed: {}", e);
                        self.status = RegistrationStatus::Failed(e.to_string());
                        RegistrationUpdate::Settled(reply, Err(PhoneError::Connect(e.to_string())))
                    }
                }
            }
            RegistrationMessage::RegisterDue { epoch, reply } => {
                if !self.is_current(epoch) {
                    debug!(epoch, "stale register request");
                    return RegistrationUpdate::Settled(
                        reply,
                        Err(PhoneError::Connect("connection attempt superseded".to_string())),
                    );
                }
                debug!(epoch, "registering");
                self.status = RegistrationStatus::Registering;
                self.spawn_register(Some(reply));
                RegistrationUpdate::None
            }
            RegistrationMessage::RegisterCompleted {
                epoch,
                result,
                reply,
            } => {
                if !self.is_current(epoch) {
                    debug!(epoch, "stale register completion");
                    return RegistrationUpdate::Settled(
                        reply,
                        Err(PhoneError::Transport("registration superseded".to_string())),
                    );
                }
                match result {
                    Ok(expires) => {
                        self.expires = expires;
                        self.status = RegistrationStatus::Registered;
                        info!(
                            aor = self.option.as_ref().map(|o| o.aor()),
                            expires, "registered"
                        );
                        self.schedule_refresh();
                        RegistrationUpdate::Settled(reply, Ok(()))
                    }
                    Err(e) => {
                        warn!(epoch, "registration failed: {}", e);
                        self.status = RegistrationStatus::Failed(e.to_string());
                        RegistrationUpdate::Settled(reply, Err(PhoneError::from_register(e)))
                    }
                }
            }
            RegistrationMessage::RefreshDue { epoch } => {
                if self.is_current(epoch) && self.is_registered() {
                    debug!(epoch, "refreshing registration");
                    self.spawn_register(None);
                }
                RegistrationUpdate::None
            }
            RegistrationMessage::RefreshCompleted { epoch, result } => {
                if !self.is_current(epoch) || !self.is_registered() {
                    return RegistrationUpdate::None;
                }
                match result {
                    Ok(expires) => {
                        self.expires = expires;
                        info!(expires, "registration refreshed");
                        self.schedule_refresh();
                        RegistrationUpdate::None
                    }
                    Err(SignalingError::Rejected { code, reason }) => {
                        warn!(code, reason = reason.as_str(), "registration refresh rejected");
                        self.status = RegistrationStatus::Unregistered;
                        RegistrationUpdate::Lost(format!(
                            "registration refresh rejected: {} {}",
                            code, reason
                        ))
                    }
                    Err(e) => {
                        warn!("registration refresh failed: {}", e);
                        self.status = RegistrationStatus::Failed(e.to_string());
                        RegistrationUpdate::Lost(format!("registration refresh failed: {}", e))
                    }
                }
            }
            RegistrationMessage::DisconnectCompleted { result, reply } => {
                self.closing = false;
                if let Err(e) = result {
                    warn!("transport teardown reported: {}", e);
                }
                info!("disconnected");
                RegistrationUpdate::Settled(reply, Ok(()))
            }
        }
    }

    /// The server dropped our binding.
    pub(crate) fn on_deregistered(&mut self, reason: &str) -> RegistrationUpdate {
        if !self.is_registered() {
            return RegistrationUpdate::None;
        }
        warn!(reason, "deregistered by server");
        self.status = RegistrationStatus::Unregistered;
        RegistrationUpdate::Lost(format!("deregistered: {}", reason))
    }

    pub(crate) fn on_connection_lost(&mut self, reason: &str) -> RegistrationUpdate {
        if self.status == RegistrationStatus::Disconnected {
            return RegistrationUpdate::None;
        }
        warn!(reason, "transport connection lost");
        self.epoch += 1;
        self.status = RegistrationStatus::Failed(reason.to_string());
        RegistrationUpdate::Lost(format!("connection lost: {}", reason))
    }

    /// Unregisters and closes the transport. `teardown` is the termination of
    /// the active call, performed before anything else.
    pub(crate) fn disconnect(
        &mut self,
        teardown: Option<(SessionHandleRef, TerminationMethod)>,
        reply: Reply,
    ) -> RegistrationUpdate {
        if self.closing || self.status == RegistrationStatus::Disconnected {
            if let Some((handle, method)) = teardown {
                self.spawn_teardown_only(handle, method);
            }
            return RegistrationUpdate::Settled(reply, Ok(()));
        }
        let was_registered = self.is_registered();
        info!(status = %self.status, was_registered, "disconnecting");
        self.epoch += 1;
        self.status = RegistrationStatus::Disconnected;
        self.closing = true;

        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            if let Some((handle, method)) = teardown {
                if let Err(e) = bounded(timeout, method.run(handle.as_ref())).await {
                    warn!(session = handle.id(), "call teardown failed: {}", e);
                }
            }
            let mut result = Ok(());
            if was_registered {
                result = bounded(timeout, transport.unregister()).await;
            }
            let closed = bounded(timeout, transport.close()).await;
            let result = result.and(closed);
            mailbox
                .send(LineMessage::Registration(
                    RegistrationMessage::DisconnectCompleted { result, reply },
                ))
                .ok();
        });
        RegistrationUpdate::None
    }

    fn spawn_teardown_only(&self, handle: SessionHandleRef, method: TerminationMethod) {
        let timeout = self.operation_timeout;
        tokio::spawn(async move {
            if let Err(e) = bounded(timeout, method.run(handle.as_ref())).await {
                warn!(session = handle.id(), "call teardown failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option() -> RegisterOption {
        RegisterOption {
            server: "ws://10.42.0.1:8088/ws".to_string(),
            domain: "10.42.0.1".to_string(),
            username: "1000".to_string(),
            display_name: None,
            credential: None,
            expires: None,
            useragent: None,
        }
    }

    #[test]
    fn test_target_uri_in_domain() {
        let uri = option().target_uri(" 2000 ").unwrap();
        assert_eq!(uri.to_string(), "sip:2000@10.42.0.1");
    }

    #[test]
    fn test_target_uri_keeps_full_uri() {
        let uri = option().target_uri("sip:bob@example.com").unwrap();
        assert_eq!(uri.to_string(), "sip:bob@example.com");
    }

    #[test]
    fn test_target_uri_rejects_empty() {
        assert!(matches!(
            option().target_uri("   "),
            Err(PhoneError::InvalidTarget(_))
        ));
        assert!(matches!(
            option().target_uri("20 00"),
            Err(PhoneError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_validate_requires_server() {
        let mut opt = option();
        assert!(opt.validate().is_ok());
        opt.server = "".to_string();
        assert!(matches!(opt.validate(), Err(PhoneError::Connect(_))));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(RegistrationStatus::Registered.to_string(), "registered");
        assert_eq!(
            RegistrationStatus::Failed("403 Forbidden".to_string()).to_string(),
            "failed (403 Forbidden)"
        );
    }
}
