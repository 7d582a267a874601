use std::sync::Arc;

use crate::transport::{MediaKind, RemoteTrack};

/// A remote identity connected to the same room.
#[derive(Debug, Clone)]
pub struct RemoteParticipant {
    pub participant_id: String,
    pub has_audio: bool,
    pub has_video: bool,
    pub audio: Option<Arc<dyn RemoteTrack>>,
    pub video: Option<Arc<dyn RemoteTrack>>,
}

impl RemoteParticipant {
    fn new(participant_id: &str) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            has_audio: false,
            has_video: false,
            audio: None,
            video: None,
        }
    }

    pub fn track(&self, kind: MediaKind) -> Option<&Arc<dyn RemoteTrack>> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    fn set_track(&mut self, kind: MediaKind, track: Option<Arc<dyn RemoteTrack>>) {
        let available = track.is_some();
        match kind {
            MediaKind::Audio => {
                self.audio = track;
                self.has_audio = available;
            }
            MediaKind::Video => {
                self.video = track;
                self.has_video = available;
            }
        }
    }
}

/// Remote participants of the current room, in arrival order.
///
/// Updated only by the session event loop, one transport event at a time.
/// Tracks state only: render surfaces of departed participants are cleaned
/// up by the layout presenter.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    participants: Vec<RemoteParticipant>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the participant was not known yet.
    pub fn on_participant_joined(&mut self, participant_id: &str) -> bool {
        if self.participant(participant_id).is_some() {
            return false;
        }
        self.participants.push(RemoteParticipant::new(participant_id));
        true
    }

    pub fn on_participant_left(&mut self, participant_id: &str) -> Option<RemoteParticipant> {
        let pos = self
            .participants
            .iter()
            .position(|p| p.participant_id == participant_id)?;
        Some(self.participants.remove(pos))
    }

    /// Record a subscribed track. A publish may arrive before the join event,
    /// in which case the participant is created here.
    pub fn on_media_published(
        &mut self,
        participant_id: &str,
        kind: MediaKind,
        track: Arc<dyn RemoteTrack>,
    ) {
        self.on_participant_joined(participant_id);
        if let Some(p) = self.participant_mut(participant_id) {
            p.set_track(kind, Some(track));
        }
    }

    /// Returns the track that was dropped, if any.
    pub fn on_media_unpublished(
        &mut self,
        participant_id: &str,
        kind: MediaKind,
    ) -> Option<Arc<dyn RemoteTrack>> {
        let p = self.participant_mut(participant_id)?;
        let previous = p.track(kind).cloned();
        p.set_track(kind, None);
        previous
    }

    pub fn participants(&self) -> &[RemoteParticipant] {
        &self.participants
    }

    pub fn participant(&self, participant_id: &str) -> Option<&RemoteParticipant> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    fn participant_mut(&mut self, participant_id: &str) -> Option<&mut RemoteParticipant> {
        self.participants
            .iter_mut()
            .find(|p| p.participant_id == participant_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Drop every participant, stopping their tracks.
    pub fn clear(&mut self) {
        for p in self.participants.drain(..) {
            for track in [p.audio, p.video].into_iter().flatten() {
                track.stop();
            }
        }
    }
}
