use crate::useragent::transport::SignalingError;
use thiserror::Error;

/// Errors reported to the caller of a [`crate::call::PhoneLine`] command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PhoneError {
    #[error("not registered")]
    NotRegistered,
    /// The signaling server could not be reached.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Registration was explicitly rejected by the server.
    #[error("registration rejected: {0}")]
    Auth(String),
    /// Connection or session creation failed on the transport.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{command} is not allowed while {state}")]
    InvalidState {
        command: &'static str,
        state: String,
    },
    /// Hold, unhold, answer or transfer rejected by the remote party or transport.
    #[error("{operation} failed: {reason}")]
    OperationFailed {
        operation: &'static str,
        reason: String,
    },
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("invalid dtmf digit: {0:?}")]
    InvalidDigit(char),
    #[error("phone line is closed")]
    LineClosed,
}

impl PhoneError {
    pub fn invalid_state(command: &'static str, state: impl ToString) -> Self {
        PhoneError::InvalidState {
            command,
            state: state.to_string(),
        }
    }

    pub fn operation_failed(operation: &'static str, reason: impl ToString) -> Self {
        PhoneError::OperationFailed {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Maps a failure of the registration handshake.
    pub fn from_register(e: SignalingError) -> Self {
        match e {
            SignalingError::Rejected { code, reason } => {
                PhoneError::Auth(format!("{} {}", code, reason))
            }
            other => PhoneError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejection_maps_to_auth() {
        let e = PhoneError::from_register(SignalingError::Rejected {
            code: 403,
            reason: "Forbidden".to_string(),
        });
        assert_eq!(e, PhoneError::Auth("403 Forbidden".to_string()));

        let e = PhoneError::from_register(SignalingError::Timeout);
        assert!(matches!(e, PhoneError::Transport(_)));
    }

    #[test]
    fn test_messages_are_human_readable() {
        let e = PhoneError::invalid_state("dtmf", "dialing");
        assert_eq!(e.to_string(), "dtmf is not allowed while dialing");
        let e = PhoneError::operation_failed("hold", "488 Not Acceptable Here");
        assert_eq!(e.to_string(), "hold failed: 488 Not Acceptable Here");
    }
}
