use std::sync::{Arc, PoisonError, RwLock};

use crate::room::SessionState;
use crate::transport::MediaKind;

/// Events emitted by the core to UI listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetEvent {
    SessionStateChanged(SessionState),
    ParticipantJoined(String),
    ParticipantLeft(String),
    MediaPublished { participant_id: String, kind: MediaKind },
    MediaUnpublished { participant_id: String, kind: MediaKind },
    LocalTrackPublished(MediaKind),
    PublishFailed { kind: MediaKind, reason: String },
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait MeetEventListener: Send + Sync {
    fn on_event(&self, event: MeetEvent);
}

/// Dispatches events to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn MeetEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn MeetEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: MeetEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
