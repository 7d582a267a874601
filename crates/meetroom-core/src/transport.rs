use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::controls::LocalTrack;
use crate::links::RoomId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Events pushed by the transport, in the order it observed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    UserJoined { participant_id: String },
    UserLeft { participant_id: String },
    UserPublished { participant_id: String, kind: MediaKind },
    UserUnpublished { participant_id: String, kind: MediaKind },
    /// The transport gave up on the connection; no further events follow.
    ConnectionLost { reason: String },
}

pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("not connected")]
    NotConnected,
    #[error("network error: {0}")]
    Network(String),
}

/// Arguments of a transport connect call.
#[derive(Clone)]
pub struct JoinParams {
    pub app_id: String,
    pub room_id: RoomId,
    pub token: String,
    pub user_id: String,
}

impl fmt::Debug for JoinParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinParams")
            .field("app_id", &self.app_id)
            .field("room_id", &self.room_id)
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// A subscribed remote media track.
pub trait RemoteTrack: fmt::Debug + Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// Start playback. Video needs a surface, audio plays without one.
    fn play(&self, surface_id: Option<&str>);
    fn stop(&self);
}

/// Capabilities RoomSession needs from a real-time transport SDK.
///
/// Concrete SDK clients are adapted to this trait; the session never talks
/// to an SDK directly.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join the room. The returned receiver yields remote events until the
    /// connection ends.
    async fn connect(&self, params: &JoinParams) -> Result<EventReceiver, TransportError>;

    /// Leave the room. Must succeed when already disconnected.
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(&self, track: Arc<dyn LocalTrack>) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        participant_id: &str,
        kind: MediaKind,
    ) -> Result<Arc<dyn RemoteTrack>, TransportError>;
}
