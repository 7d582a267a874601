//! In-process transport and media backend.
//!
//! `LoopbackTransport` checks tokens the way a real service would and lets the
//! caller play the remote side of the room. `SimulatedMedia` hands out tracks
//! that record what was done to them. Both back the demo binary and tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::controls::{LocalTrack, MediaBackend};
use crate::errors::{DeviceError, TokenError};
use crate::token::TokenVerifier;
use crate::transport::{
    EventReceiver, JoinParams, MediaKind, RemoteTrack, Transport, TransportError, TransportEvent,
};

#[derive(Default)]
struct LoopbackState {
    sender: Option<mpsc::UnboundedSender<TransportEvent>>,
    joined: Option<JoinParams>,
    published: Vec<String>,
    remote_media: BTreeSet<(String, MediaKind)>,
    subscribed: Vec<Arc<LoopbackRemoteTrack>>,
    connects: usize,
    disconnects: usize,
}

/// A transport whose "server" lives in the same process.
pub struct LoopbackTransport {
    verifier: TokenVerifier,
    clock: Arc<dyn Clock>,
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    pub fn new(verifier: TokenVerifier, clock: Arc<dyn Clock>) -> Self {
        Self {
            verifier,
            clock,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state().sender.is_some()
    }

    pub fn joined_as(&self) -> Option<JoinParams> {
        self.state().joined.clone()
    }

    pub fn published_tracks(&self) -> Vec<String> {
        self.state().published.clone()
    }

    /// Whether the receiver handed out by `connect` is still being read.
    pub fn is_listened_to(&self) -> bool {
        self.state().sender.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Every remote track handed out so far, oldest first.
    pub fn subscribed_tracks(&self) -> Vec<Arc<LoopbackRemoteTrack>> {
        self.state().subscribed.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    fn push(&self, event: TransportEvent) -> bool {
        let state = self.state();
        match &state.sender {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Simulate a remote user entering the room.
    pub fn remote_joined(&self, participant_id: &str) -> bool {
        self.push(TransportEvent::UserJoined {
            participant_id: participant_id.to_string(),
        })
    }

    pub fn remote_left(&self, participant_id: &str) -> bool {
        self.state()
            .remote_media
            .retain(|(id, _)| id != participant_id);
        self.push(TransportEvent::UserLeft {
            participant_id: participant_id.to_string(),
        })
    }

    pub fn remote_published(&self, participant_id: &str, kind: MediaKind) -> bool {
        self.state()
            .remote_media
            .insert((participant_id.to_string(), kind));
        self.push(TransportEvent::UserPublished {
            participant_id: participant_id.to_string(),
            kind,
        })
    }

    pub fn remote_unpublished(&self, participant_id: &str, kind: MediaKind) -> bool {
        self.state()
            .remote_media
            .remove(&(participant_id.to_string(), kind));
        self.push(TransportEvent::UserUnpublished {
            participant_id: participant_id.to_string(),
            kind,
        })
    }

    /// Simulate the connection dropping for good.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let sent = self.push(TransportEvent::ConnectionLost {
            reason: reason.to_string(),
        });
        let mut state = self.state();
        state.sender = None;
        state.joined = None;
        sent
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, params: &JoinParams) -> Result<EventReceiver, TransportError> {
        if params.app_id != self.verifier.app_id() {
            return Err(TransportError::Rejected(format!("unknown app id '{}'", params.app_id)));
        }
        self.verifier
            .verify(&params.token, &params.room_id, self.clock.now())
            .map_err(|e| match e {
                TokenError::Expired => TransportError::TokenExpired,
                other => TransportError::InvalidToken(other.to_string()),
            })?;

        let mut state = self.state();
        if state.sender.is_some() {
            return Err(TransportError::Rejected("client already in a room".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.sender = Some(tx);
        state.joined = Some(params.clone());
        state.connects += 1;
        tracing::debug!("loopback: {} joined {}", params.user_id, params.room_id);
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.sender.take().is_some() {
            state.disconnects += 1;
        }
        state.joined = None;
        state.published.clear();
        state.remote_media.clear();
        Ok(())
    }

    async fn publish(&self, track: Arc<dyn LocalTrack>) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.sender.is_none() {
            return Err(TransportError::NotConnected);
        }
        let id = track.id().to_string();
        if !state.published.contains(&id) {
            state.published.push(id);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        participant_id: &str,
        kind: MediaKind,
    ) -> Result<Arc<dyn RemoteTrack>, TransportError> {
        let mut state = self.state();
        if state.sender.is_none() {
            return Err(TransportError::NotConnected);
        }
        if !state
            .remote_media
            .contains(&(participant_id.to_string(), kind))
        {
            return Err(TransportError::Rejected(format!(
                "{participant_id} is not publishing {kind}"
            )));
        }
        let track = Arc::new(LoopbackRemoteTrack::new(participant_id, kind));
        state.subscribed.push(track.clone());
        Ok(track)
    }
}

/// Remote track handed out by [`LoopbackTransport::subscribe`].
#[derive(Debug)]
pub struct LoopbackRemoteTrack {
    id: String,
    kind: MediaKind,
    playing_on: Mutex<Option<String>>,
    playing: AtomicBool,
}

impl LoopbackRemoteTrack {
    fn new(participant_id: &str, kind: MediaKind) -> Self {
        Self {
            id: format!("{participant_id}-{kind}"),
            kind,
            playing_on: Mutex::new(None),
            playing: AtomicBool::new(false),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn surface(&self) -> Option<String> {
        self.playing_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RemoteTrack for LoopbackRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn play(&self, surface_id: Option<&str>) {
        *self.playing_on.lock().unwrap_or_else(PoisonError::into_inner) = surface_id.map(str::to_string);
        self.playing.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }
}

/// Capture track that records toggles, playback and close calls.
#[derive(Debug)]
pub struct SimulatedTrack {
    id: String,
    kind: MediaKind,
    permission_check: bool,
    enabled: AtomicBool,
    closes: AtomicUsize,
    surface: Mutex<Option<String>>,
}

impl SimulatedTrack {
    fn new(id: String, kind: MediaKind, permission_check: bool) -> Self {
        Self {
            id,
            kind,
            permission_check,
            enabled: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            surface: Mutex::new(None),
        }
    }

    pub fn is_permission_check(&self) -> bool {
        self.permission_check
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn surface(&self) -> Option<String> {
        self.surface
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LocalTrack for SimulatedTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Released(self.id.clone()));
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn play(&self, surface_id: &str) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Released(self.id.clone()));
        }
        *self.surface.lock().unwrap_or_else(PoisonError::into_inner) = Some(surface_id.to_string());
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MediaState {
    tracks: Vec<Arc<SimulatedTrack>>,
    failing: BTreeSet<MediaKind>,
    deny_permissions: bool,
}

/// Media backend with switchable failures.
#[derive(Default)]
pub struct SimulatedMedia {
    state: Mutex<MediaState>,
}

impl SimulatedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MediaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make creation of this kind of track fail.
    pub fn fail_track(&self, kind: MediaKind) {
        self.state().failing.insert(kind);
    }

    pub fn deny_permissions(&self) {
        self.state().deny_permissions = true;
    }

    /// Undo every injected failure.
    pub fn heal(&self) {
        let mut state = self.state();
        state.failing.clear();
        state.deny_permissions = false;
    }

    /// Every track created so far, permission checks included.
    pub fn tracks(&self) -> Vec<Arc<SimulatedTrack>> {
        self.state().tracks.clone()
    }

    /// The most recent capture track of a kind.
    pub fn track_of(&self, kind: MediaKind) -> Option<Arc<SimulatedTrack>> {
        self.state()
            .tracks
            .iter()
            .rev()
            .find(|t| t.kind == kind && !t.permission_check)
            .cloned()
    }

    fn create(
        &self,
        kind: MediaKind,
        permission_check: bool,
    ) -> Result<Arc<SimulatedTrack>, DeviceError> {
        let mut state = self.state();
        if !permission_check && state.failing.contains(&kind) {
            return Err(DeviceError::TrackCreation {
                kind,
                reason: "device busy".into(),
            });
        }
        let prefix = if permission_check { "permission" } else { "local" };
        let track = Arc::new(SimulatedTrack::new(
            format!("{prefix}-{kind}-{}", uuid::Uuid::new_v4()),
            kind,
            permission_check,
        ));
        state.tracks.push(track.clone());
        Ok(track)
    }
}

#[async_trait]
impl MediaBackend for SimulatedMedia {
    async fn request_permissions(&self) -> Result<Vec<Arc<dyn LocalTrack>>, DeviceError> {
        if self.state().deny_permissions {
            return Err(DeviceError::PermissionDenied(
                "camera and microphone access was denied".into(),
            ));
        }
        let audio: Arc<dyn LocalTrack> = self.create(MediaKind::Audio, true)?;
        let video: Arc<dyn LocalTrack> = self.create(MediaKind::Video, true)?;
        Ok(vec![audio, video])
    }

    async fn create_microphone_track(&self) -> Result<Arc<dyn LocalTrack>, DeviceError> {
        let track: Arc<dyn LocalTrack> = self.create(MediaKind::Audio, false)?;
        Ok(track)
    }

    async fn create_camera_track(&self) -> Result<Arc<dyn LocalTrack>, DeviceError> {
        let track: Arc<dyn LocalTrack> = self.create(MediaKind::Video, false)?;
        Ok(track)
    }
}
