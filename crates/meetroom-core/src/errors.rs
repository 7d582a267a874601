use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::room::SessionState;
use crate::transport::{MediaKind, TransportError};

#[derive(Debug, Error)]
pub enum MeetError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("user is not authenticated")]
    Unauthenticated,
    #[error("device unavailable: {0}")]
    DeviceUnavailable(#[from] DeviceError),
    #[error("join failed: {0}")]
    Join(#[from] JoinFailure),
    #[error("meeting has not started yet, it is scheduled for {starts_at}")]
    NotYetStarted { starts_at: DateTime<Utc> },
    #[error("invalid room: {0}")]
    InvalidRoom(String),
    #[error("operation not allowed in state {state:?}: {operation}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("publish {kind} failed: {source}")]
    Publish {
        kind: MediaKind,
        #[source]
        source: TransportError,
    },
    #[error("http error: {0}")]
    Http(String),
}

/// Why a join attempt did not reach `Joined`.
#[derive(Debug, Error)]
pub enum JoinFailure {
    #[error("credential expired at {0}")]
    CredentialExpired(DateTime<Utc>),
    #[error("transport rejected join: {0}")]
    Transport(#[from] TransportError),
    #[error("join timed out after {0:?}")]
    TimedOut(std::time::Duration),
    #[error("join cancelled by leave")]
    Cancelled,
}

/// Local capture failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("failed to create {kind} track: {reason}")]
    TrackCreation { kind: MediaKind, reason: String },
    #[error("track {0} already released")]
    Released(String),
    #[error("device error: {0}")]
    Other(String),
}

/// Token verification failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token issued for another room")]
    RoomMismatch,
    #[error("token issued for another app")]
    AppMismatch,
    #[error("invalid token: {0}")]
    Invalid(String),
}

impl MeetError {
    /// Whether the user can sensibly retry the failed action.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, MeetError::Configuration(_))
    }
}
