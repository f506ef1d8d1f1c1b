use super::invitation::IncomingInvitation;
use super::registration::{RegisterOption, UserCredential};
use crate::media::MediaHandle;
use async_trait::async_trait;
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("rejected: {code} {reason}")]
    Rejected { code: u16, reason: String },
    #[error("operation timed out")]
    Timeout,
    #[error("{0}")]
    Failed(String),
}

/// Why a session ended, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminatedReason {
    /// We cancelled before the session was established.
    Cancelled,
    /// We declined an inbound invitation.
    Declined,
    LocalBye,
    RemoteBye,
    /// The caller withdrew an invitation before it was answered.
    RemoteCancel,
    /// The remote party refused an outbound session (busy, decline, ...).
    RemoteRejected(u16),
    Failed(String),
}

/// Per-session state reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// 1xx response, the remote side is being alerted.
    Provisional(u16),
    Established,
    Terminated(TerminatedReason),
}

pub type SessionStateSender = mpsc::UnboundedSender<SessionState>;
pub type SessionStateReceiver = mpsc::UnboundedReceiver<SessionState>;

/// Connection level events, delivered on the sender handed to
/// [`SignalingTransport::connect`].
pub enum TransportEvent {
    InviteReceived(IncomingInvitation),
    /// The server dropped our binding.
    Deregistered(String),
    /// The underlying connection was lost.
    Disconnected(String),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Session level primitives of one call.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn id(&self) -> &str;
    fn media(&self) -> MediaHandle;
    async fn accept(&self) -> Result<(), SignalingError>;
    async fn reject(&self, code: u16) -> Result<(), SignalingError>;
    async fn cancel(&self) -> Result<(), SignalingError>;
    /// Ends an established session (BYE).
    async fn terminate(&self) -> Result<(), SignalingError>;
    async fn hold(&self) -> Result<(), SignalingError>;
    async fn unhold(&self) -> Result<(), SignalingError>;
    async fn send_dtmf(&self, digit: char) -> Result<(), SignalingError>;
    async fn refer(&self, target: rsip::Uri) -> Result<(), SignalingError>;
}

pub type SessionHandleRef = Arc<dyn SessionHandle>;

/// The signaling stack: connection, registration and session creation.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn connect(
        &self,
        option: &RegisterOption,
        events: TransportEventSender,
    ) -> Result<(), SignalingError>;

    /// Returns the expiry granted by the registrar, in seconds.
    async fn register(
        &self,
        option: &RegisterOption,
        credential: Option<&UserCredential>,
        expires: u32,
    ) -> Result<u32, SignalingError>;

    async fn unregister(&self) -> Result<(), SignalingError>;

    async fn close(&self) -> Result<(), SignalingError>;

    /// Creates an outbound session and starts inviting `target`. Session
    /// state changes are reported on `states`.
    async fn create_outbound_session(
        &self,
        target: rsip::Uri,
        states: SessionStateSender,
    ) -> Result<SessionHandleRef, SignalingError>;
}

/// Runs a transport operation, failing with [`SignalingError::Timeout`] when
/// it does not settle within `limit`.
pub(crate) async fn bounded<T>(
    limit: Duration,
    operation: impl Future<Output = Result<T, SignalingError>>,
) -> Result<T, SignalingError> {
    match timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(SignalingError::Timeout),
    }
}
