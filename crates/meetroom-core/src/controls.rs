use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::errors::DeviceError;
use crate::layout::SurfaceHost;
use crate::transport::MediaKind;

/// A local capture track created by a media backend.
pub trait LocalTrack: fmt::Debug + Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// Mute (audio) or pause (video) without destroying the capture.
    fn set_enabled(&self, enabled: bool) -> Result<(), DeviceError>;
    fn play(&self, surface_id: &str) -> Result<(), DeviceError>;
    /// Stop capturing and free the device.
    fn close(&self);
}

/// Platform capture: permission prompt plus microphone and camera tracks.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Ask the OS for camera and microphone access. The returned tracks are
    /// only evidence of the grant and are closed right away.
    async fn request_permissions(&self) -> Result<Vec<Arc<dyn LocalTrack>>, DeviceError>;
    async fn create_microphone_track(&self) -> Result<Arc<dyn LocalTrack>, DeviceError>;
    async fn create_camera_track(&self) -> Result<Arc<dyn LocalTrack>, DeviceError>;
}

/// Owned handle to a local track. Releasing twice is a no-op.
#[derive(Debug, Clone)]
pub struct TrackHandle {
    track: Arc<dyn LocalTrack>,
    released: Arc<AtomicBool>,
}

impl TrackHandle {
    pub fn new(track: Arc<dyn LocalTrack>) -> Self {
        Self {
            track,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    pub fn track(&self) -> Arc<dyn LocalTrack> {
        self.track.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Close the underlying track. Returns `false` if it was already closed.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.track.close();
        tracing::debug!("released {} track {}", self.kind(), self.id());
        true
    }
}

/// Snapshot of local device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDeviceState {
    pub microphone_enabled: bool,
    pub camera_enabled: bool,
    pub has_audio_track: bool,
    pub has_video_track: bool,
}

/// Controls for local media (microphone, camera).
///
/// Owns the capture handles for one setup attempt. Handles are released on
/// every exit path, including drop.
pub struct DeviceTrackManager {
    backend: Arc<dyn MediaBackend>,
    microphone_enabled: bool,
    camera_enabled: bool,
    audio: Option<TrackHandle>,
    video: Option<TrackHandle>,
}

impl DeviceTrackManager {
    pub fn new(backend: Arc<dyn MediaBackend>, microphone_enabled: bool, camera_enabled: bool) -> Self {
        Self {
            backend,
            microphone_enabled,
            camera_enabled,
            audio: None,
            video: None,
        }
    }

    /// Check permissions, then create microphone and camera tracks together.
    ///
    /// Either track failing fails the whole call, and a track that did get
    /// created is released before the error is returned.
    pub async fn acquire(&mut self) -> Result<(TrackHandle, TrackHandle), DeviceError> {
        self.release_all();

        let granted = self.backend.request_permissions().await.map_err(|e| {
            tracing::warn!("media permission request failed: {e}");
            e
        })?;
        for track in granted {
            track.close();
        }

        let (audio, video) = futures_util::future::join(
            self.backend.create_microphone_track(),
            self.backend.create_camera_track(),
        )
        .await;

        let (audio, video) = match (audio, video) {
            (Ok(audio), Ok(video)) => (TrackHandle::new(audio), TrackHandle::new(video)),
            (Ok(created), Err(e)) | (Err(e), Ok(created)) => {
                tracing::warn!("track creation failed, releasing {} track: {e}", created.kind());
                TrackHandle::new(created).release();
                return Err(e);
            }
            (Err(e), Err(other)) => {
                tracing::warn!("both track creations failed: {e}; {other}");
                return Err(e);
            }
        };

        Self::apply_enabled(&audio, self.microphone_enabled);
        Self::apply_enabled(&video, self.camera_enabled);

        tracing::info!("local tracks acquired: audio={} video={}", audio.id(), video.id());
        self.audio = Some(audio.clone());
        self.video = Some(video.clone());
        Ok((audio, video))
    }

    fn apply_enabled(handle: &TrackHandle, enabled: bool) {
        if handle.is_released() {
            return;
        }
        if let Err(e) = handle.track.set_enabled(enabled) {
            tracing::warn!("failed to set {} track enabled={enabled}: {e}", handle.kind());
        }
    }

    /// Toggle the microphone or camera. The preference is kept even when no
    /// track exists yet, and is applied on the next acquire.
    pub fn set_enabled(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.microphone_enabled = enabled,
            MediaKind::Video => self.camera_enabled = enabled,
        }
        if let Some(handle) = self.handle(kind) {
            Self::apply_enabled(handle, enabled);
        }
        tracing::info!("{kind} enabled: {enabled}");
    }

    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.microphone_enabled,
            MediaKind::Video => self.camera_enabled,
        }
    }

    pub fn handle(&self, kind: MediaKind) -> Option<&TrackHandle> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    /// Live handles, audio first.
    pub fn handles(&self) -> Vec<TrackHandle> {
        [self.audio.as_ref(), self.video.as_ref()]
            .into_iter()
            .flatten()
            .filter(|h| !h.is_released())
            .cloned()
            .collect()
    }

    pub fn state(&self) -> LocalDeviceState {
        LocalDeviceState {
            microphone_enabled: self.microphone_enabled,
            camera_enabled: self.camera_enabled,
            has_audio_track: self.audio.as_ref().is_some_and(|h| !h.is_released()),
            has_video_track: self.video.as_ref().is_some_and(|h| !h.is_released()),
        }
    }

    pub fn release(&mut self, kind: MediaKind) {
        let handle = match kind {
            MediaKind::Audio => self.audio.take(),
            MediaKind::Video => self.video.take(),
        };
        if let Some(handle) = handle {
            handle.release();
        }
    }

    pub fn release_all(&mut self) {
        self.release(MediaKind::Audio);
        self.release(MediaKind::Video);
    }

    /// Show the camera preview on a surface. Returns whether it was attached.
    pub fn render_preview(&self, surfaces: &dyn SurfaceHost, surface_id: &str) -> bool {
        let Some(video) = self.video.as_ref().filter(|h| !h.is_released()) else {
            return false;
        };
        if !self.camera_enabled || !surfaces.has_surface(surface_id) {
            return false;
        }
        match video.track.play(surface_id) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("preview on {surface_id} failed: {e}");
                false
            }
        }
    }
}

impl Drop for DeviceTrackManager {
    fn drop(&mut self) {
        self.release_all();
    }
}
