use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::auth::TokenSource;
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, DEFAULT_JOIN_TIMEOUT};
use crate::controls::{DeviceTrackManager, LocalDeviceState, MediaBackend, TrackHandle};
use crate::errors::{DeviceError, JoinFailure, MeetError};
use crate::events::{EventEmitter, MeetEvent, MeetEventListener};
use crate::layout::SurfaceHost;
use crate::links::RoomId;
use crate::participants::{ParticipantRegistry, RemoteParticipant};
use crate::settings::Settings;
use crate::token::Credential;
use crate::transport::{EventReceiver, JoinParams, MediaKind, Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AcquiringDevices,
    ReadyToJoin,
    Joining,
    Joined,
    Leaving,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::AcquiringDevices => "acquiring-devices",
            SessionState::ReadyToJoin => "ready-to-join",
            SessionState::Joining => "joining",
            SessionState::Joined => "joined",
            SessionState::Leaving => "leaving",
            SessionState::Failed => "failed",
        })
    }
}

/// Who is joining which room. Fixed for the lifetime of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomIdentity {
    pub room_id: RoomId,
    pub local_user_id: String,
}

/// Result of a successful join. Publish failures do not fail the join but
/// are all reported here.
#[derive(Debug)]
pub struct JoinOutcome {
    pub room: RoomIdentity,
    pub published: Vec<MediaKind>,
    pub publish_failures: Vec<(MediaKind, TransportError)>,
}

impl JoinOutcome {
    pub fn fully_published(&self) -> bool {
        self.publish_failures.is_empty()
    }
}

#[derive(Clone)]
pub struct SessionOptions {
    pub clock: Arc<dyn Clock>,
    pub join_timeout: Duration,
    /// Joins are refused before this instant.
    pub scheduled_start: Option<DateTime<Utc>>,
    pub microphone_enabled: bool,
    pub camera_enabled: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            scheduled_start: None,
            microphone_enabled: true,
            camera_enabled: true,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig, settings: &Settings) -> Self {
        Self {
            join_timeout: config.join_timeout,
            microphone_enabled: settings.mic_enabled_on_join,
            camera_enabled: settings.camera_enabled_on_join,
            ..Self::default()
        }
    }
}

struct SessionInner {
    state: SessionState,
    /// Bumped on every join so stale completions can be recognised.
    attempt: u64,
    room: Option<RoomIdentity>,
    published: BTreeSet<MediaKind>,
    event_task: Option<JoinHandle<()>>,
    cancel_join: Option<oneshot::Sender<()>>,
    last_error: Option<String>,
}

/// Drives one meeting: local devices, the transport connection and the
/// remote participant registry.
///
/// Methods take `&self` and may be called from concurrent tasks. State is
/// re-checked after every await, so a `leave()` racing a `join()` always
/// wins and the session ends up `Idle`.
pub struct RoomSession {
    transport: Arc<dyn Transport>,
    devices: Arc<Mutex<DeviceTrackManager>>,
    participants: Arc<Mutex<ParticipantRegistry>>,
    inner: Arc<Mutex<SessionInner>>,
    emitter: EventEmitter,
    clock: Arc<dyn Clock>,
    join_timeout: Duration,
    scheduled_start: Option<DateTime<Utc>>,
}

impl RoomSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaBackend>,
        options: SessionOptions,
    ) -> Self {
        Self {
            transport,
            devices: Arc::new(Mutex::new(DeviceTrackManager::new(
                media,
                options.microphone_enabled,
                options.camera_enabled,
            ))),
            participants: Arc::new(Mutex::new(ParticipantRegistry::new())),
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Idle,
                attempt: 0,
                room: None,
                published: BTreeSet::new(),
                event_task: None,
                cancel_join: None,
                last_error: None,
            })),
            emitter: EventEmitter::new(),
            clock: options.clock,
            join_timeout: options.join_timeout,
            scheduled_start: options.scheduled_start,
        }
    }

    /// Register a listener for session events.
    pub fn add_listener(&self, listener: Arc<dyn MeetEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Message of the last session-level failure.
    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    pub async fn room(&self) -> Option<RoomIdentity> {
        self.inner.lock().await.room.clone()
    }

    pub fn scheduled_start(&self) -> Option<DateTime<Utc>> {
        self.scheduled_start
    }

    /// Get a snapshot of current remote participants.
    pub async fn participants(&self) -> Vec<RemoteParticipant> {
        self.participants.lock().await.participants().to_vec()
    }

    pub async fn local_devices(&self) -> LocalDeviceState {
        self.devices.lock().await.state()
    }

    pub async fn published_kinds(&self) -> Vec<MediaKind> {
        self.inner.lock().await.published.iter().copied().collect()
    }

    fn transition(inner: &mut SessionInner, emitter: &EventEmitter, state: SessionState) {
        if inner.state == state {
            return;
        }
        tracing::info!("session {} -> {}", inner.state, state);
        inner.state = state;
        emitter.emit(MeetEvent::SessionStateChanged(state));
    }

    fn check_started(&self) -> Result<(), MeetError> {
        if let Some(starts_at) = self.scheduled_start {
            if self.clock.now() < starts_at {
                return Err(MeetError::NotYetStarted { starts_at });
            }
        }
        Ok(())
    }

    /// Acquire microphone and camera. Legal from `Idle` and `Failed`.
    pub async fn acquire(&self) -> Result<(), MeetError> {
        {
            let mut inner = self.inner.lock().await;
            if !matches!(inner.state, SessionState::Idle | SessionState::Failed) {
                return Err(MeetError::InvalidState {
                    operation: "acquire",
                    state: inner.state,
                });
            }
            inner.last_error = None;
            Self::transition(&mut inner, &self.emitter, SessionState::AcquiringDevices);
        }

        let result = self.devices.lock().await.acquire().await;

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::AcquiringDevices {
            let state = inner.state;
            drop(inner);
            self.devices.lock().await.release_all();
            return Err(MeetError::InvalidState {
                operation: "acquire",
                state,
            });
        }
        match result {
            Ok(_) => {
                Self::transition(&mut inner, &self.emitter, SessionState::ReadyToJoin);
                Ok(())
            }
            Err(e) => {
                tracing::error!("device acquisition failed: {e}");
                inner.last_error = Some(e.to_string());
                Self::transition(&mut inner, &self.emitter, SessionState::Failed);
                Err(e.into())
            }
        }
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) {
        self.devices.lock().await.set_enabled(MediaKind::Audio, enabled);
    }

    pub async fn set_camera_enabled(&self, enabled: bool) {
        self.devices.lock().await.set_enabled(MediaKind::Video, enabled);
    }

    pub async fn render_preview(&self, surfaces: &dyn SurfaceHost, surface_id: &str) -> bool {
        self.devices.lock().await.render_preview(surfaces, surface_id)
    }

    /// Fetch a fresh credential from `source` and join with it.
    pub async fn connect(
        &self,
        source: &dyn TokenSource,
        identity: RoomIdentity,
    ) -> Result<JoinOutcome, MeetError> {
        {
            let inner = self.inner.lock().await;
            if inner.state != SessionState::ReadyToJoin {
                return Err(MeetError::InvalidState {
                    operation: "join",
                    state: inner.state,
                });
            }
        }
        self.check_started()?;
        let credential = source.fetch(&identity.room_id).await?;
        self.join(credential, identity).await
    }

    /// Join the room and publish the acquired local tracks.
    pub async fn join(
        &self,
        credential: Credential,
        identity: RoomIdentity,
    ) -> Result<JoinOutcome, MeetError> {
        let (attempt, cancelled) = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::ReadyToJoin {
                return Err(MeetError::InvalidState {
                    operation: "join",
                    state: inner.state,
                });
            }
            self.check_started()?;
            if credential.room_id != identity.room_id {
                return Err(MeetError::InvalidRoom(format!(
                    "credential is for room {}, not {}",
                    credential.room_id, identity.room_id
                )));
            }

            inner.attempt += 1;
            Self::transition(&mut inner, &self.emitter, SessionState::Joining);

            if credential.is_expired_at(self.clock.now()) {
                let failure = JoinFailure::CredentialExpired(credential.expires_at);
                tracing::error!("join {} failed: {failure}", identity.room_id);
                inner.last_error = Some(failure.to_string());
                Self::transition(&mut inner, &self.emitter, SessionState::Failed);
                return Err(failure.into());
            }

            let (tx, rx) = oneshot::channel();
            inner.cancel_join = Some(tx);
            inner.room = Some(identity.clone());
            (inner.attempt, rx)
        };

        let params = JoinParams {
            app_id: credential.app_id,
            room_id: identity.room_id.clone(),
            token: credential.token,
            user_id: identity.local_user_id.clone(),
        };
        tracing::info!("joining room {} as {}", params.room_id, params.user_id);

        let connect = tokio::time::timeout(self.join_timeout, self.transport.connect(&params));
        let result = tokio::select! {
            res = connect => match res {
                Ok(Ok(events)) => Ok(events),
                Ok(Err(e)) => Err(JoinFailure::Transport(e)),
                Err(_) => Err(JoinFailure::TimedOut(self.join_timeout)),
            },
            _ = cancelled => Err(JoinFailure::Cancelled),
        };

        let mut inner = self.inner.lock().await;
        if inner.attempt != attempt || inner.state != SessionState::Joining {
            // a newer attempt may own the shared transport now
            let superseded = inner.attempt != attempt
                && matches!(inner.state, SessionState::Joining | SessionState::Joined);
            drop(inner);
            if result.is_ok() && !superseded {
                // connected after leave() already tore down
                drop(result);
                if let Err(e) = self.transport.disconnect().await {
                    tracing::warn!("disconnect after cancelled join failed: {e}");
                }
            }
            tracing::info!("join of {} cancelled", params.room_id);
            return Err(JoinFailure::Cancelled.into());
        }
        inner.cancel_join = None;

        let events = match result {
            Ok(events) => events,
            Err(failure) => {
                tracing::error!("join {} failed: {failure}", params.room_id);
                inner.room = None;
                inner.last_error = Some(failure.to_string());
                Self::transition(&mut inner, &self.emitter, SessionState::Failed);
                return Err(failure.into());
            }
        };

        inner.event_task = Some(tokio::spawn(Self::event_loop(
            events,
            self.transport.clone(),
            self.participants.clone(),
            self.inner.clone(),
            self.emitter.clone(),
            attempt,
        )));
        drop(inner);

        let (published, publish_failures) = self.publish_local_tracks().await;

        let mut inner = self.inner.lock().await;
        if inner.attempt != attempt || inner.state != SessionState::Joining {
            let failure = match (inner.state, inner.last_error.clone()) {
                (SessionState::Failed, Some(reason)) => {
                    JoinFailure::Transport(TransportError::Network(reason))
                }
                _ => JoinFailure::Cancelled,
            };
            return Err(failure.into());
        }
        inner.published.extend(published.iter().copied());
        Self::transition(&mut inner, &self.emitter, SessionState::Joined);

        Ok(JoinOutcome {
            room: identity,
            published,
            publish_failures,
        })
    }

    /// Publish every live local track concurrently. Failures are collected,
    /// never dropped.
    async fn publish_local_tracks(&self) -> (Vec<MediaKind>, Vec<(MediaKind, TransportError)>) {
        let handles = self.devices.lock().await.handles();
        let results = futures_util::future::join_all(handles.iter().map(|handle| {
            let transport = self.transport.clone();
            let track = handle.track();
            async move {
                let kind = track.kind();
                (kind, transport.publish(track).await)
            }
        }))
        .await;

        let mut published = Vec::new();
        let mut failures = Vec::new();
        for (kind, result) in results {
            match result {
                Ok(()) => {
                    tracing::info!("{kind} track published");
                    self.emitter.emit(MeetEvent::LocalTrackPublished(kind));
                    published.push(kind);
                }
                Err(e) => {
                    tracing::warn!("publishing {kind} track failed: {e}");
                    self.emitter.emit(MeetEvent::PublishFailed {
                        kind,
                        reason: e.to_string(),
                    });
                    failures.push((kind, e));
                }
            }
        }
        (published, failures)
    }

    /// Publish one local track. Returns `false` if it was already published.
    pub async fn publish(&self, kind: MediaKind) -> Result<bool, MeetError> {
        {
            let inner = self.inner.lock().await;
            if inner.state != SessionState::Joined {
                return Err(MeetError::InvalidState {
                    operation: "publish",
                    state: inner.state,
                });
            }
            if inner.published.contains(&kind) {
                return Ok(false);
            }
        }

        let track = self
            .devices
            .lock()
            .await
            .handle(kind)
            .filter(|h| !h.is_released())
            .map(TrackHandle::track)
            .ok_or_else(|| DeviceError::Other(format!("no {kind} track acquired")))?;

        self.transport
            .publish(track)
            .await
            .map_err(|source| MeetError::Publish { kind, source })?;

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Joined {
            return Err(MeetError::InvalidState {
                operation: "publish",
                state: inner.state,
            });
        }
        inner.published.insert(kind);
        drop(inner);

        tracing::info!("{kind} track published");
        self.emitter.emit(MeetEvent::LocalTrackPublished(kind));
        Ok(true)
    }

    /// Leave the room and release local devices.
    ///
    /// The transport is told to disconnect from every state but `Idle`, even
    /// after a failed or timed-out join. A no-op when idle or already leaving.
    pub async fn leave(&self) {
        let event_task = {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, SessionState::Idle | SessionState::Leaving) {
                return;
            }
            Self::transition(&mut inner, &self.emitter, SessionState::Leaving);
            if let Some(cancel) = inner.cancel_join.take() {
                let _ = cancel.send(());
            }
            inner.event_task.take()
        };

        Self::teardown(&*self.transport, &self.devices, &self.participants, event_task).await;

        let mut inner = self.inner.lock().await;
        inner.room = None;
        inner.published.clear();
        Self::transition(&mut inner, &self.emitter, SessionState::Idle);
    }

    /// Stop listening, disconnect, then release devices.
    async fn teardown(
        transport: &dyn Transport,
        devices: &Mutex<DeviceTrackManager>,
        participants: &Mutex<ParticipantRegistry>,
        event_task: Option<JoinHandle<()>>,
    ) {
        if let Some(task) = event_task {
            task.abort();
            let _ = task.await;
        }

        if let Err(e) = transport.disconnect().await {
            tracing::warn!("transport disconnect failed: {e}");
        }

        devices.lock().await.release_all();
        participants.lock().await.clear();
    }

    async fn event_loop(
        mut events: EventReceiver,
        transport: Arc<dyn Transport>,
        participants: Arc<Mutex<ParticipantRegistry>>,
        inner: Arc<Mutex<SessionInner>>,
        emitter: EventEmitter,
        attempt: u64,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::UserJoined { participant_id } => {
                    if participants.lock().await.on_participant_joined(&participant_id) {
                        tracing::debug!("participant joined: {participant_id}");
                        emitter.emit(MeetEvent::ParticipantJoined(participant_id));
                    }
                }

                TransportEvent::UserLeft { participant_id } => {
                    let removed = participants.lock().await.on_participant_left(&participant_id);
                    if let Some(p) = removed {
                        for track in [p.audio, p.video].into_iter().flatten() {
                            track.stop();
                        }
                        tracing::debug!("participant left: {participant_id}");
                        emitter.emit(MeetEvent::ParticipantLeft(participant_id));
                    }
                }

                TransportEvent::UserPublished { participant_id, kind } => {
                    match transport.subscribe(&participant_id, kind).await {
                        Ok(track) => {
                            if kind == MediaKind::Audio {
                                track.play(None);
                            }
                            participants
                                .lock()
                                .await
                                .on_media_published(&participant_id, kind, track);
                            emitter.emit(MeetEvent::MediaPublished {
                                participant_id,
                                kind,
                            });
                        }
                        Err(e) => {
                            tracing::warn!("subscribe to {kind} of {participant_id} failed: {e}");
                        }
                    }
                }

                TransportEvent::UserUnpublished { participant_id, kind } => {
                    let dropped = participants
                        .lock()
                        .await
                        .on_media_unpublished(&participant_id, kind);
                    if let Some(track) = dropped {
                        track.stop();
                        emitter.emit(MeetEvent::MediaUnpublished {
                            participant_id,
                            kind,
                        });
                    }
                }

                TransportEvent::ConnectionLost { reason } => {
                    tracing::error!("connection lost: {reason}");
                    let mut inner = inner.lock().await;
                    if inner.attempt == attempt
                        && matches!(inner.state, SessionState::Joining | SessionState::Joined)
                    {
                        inner.last_error = Some(reason);
                        Self::transition(&mut inner, &emitter, SessionState::Failed);
                    }
                    break;
                }
            }
        }

        tracing::debug!("room event loop ended");
    }
}

impl Drop for RoomSession {
    /// A session dropped without `leave()` still disconnects. The teardown is
    /// spawned on the current runtime; outside one, only local resources can
    /// be released.
    fn drop(&mut self) {
        let inner = self.inner.clone();
        let transport = self.transport.clone();
        let devices = self.devices.clone();
        let participants = self.participants.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            if let Ok(mut inner) = inner.try_lock() {
                if let Some(task) = inner.event_task.take() {
                    task.abort();
                }
            }
            if let Ok(mut devices) = devices.try_lock() {
                devices.release_all();
            }
            if let Ok(mut participants) = participants.try_lock() {
                participants.clear();
            }
            tracing::warn!("room session dropped outside a runtime, transport not disconnected");
            return;
        };

        handle.spawn(async move {
            let event_task = {
                let mut inner = inner.lock().await;
                if inner.state == SessionState::Idle {
                    return;
                }
                if let Some(cancel) = inner.cancel_join.take() {
                    let _ = cancel.send(());
                }
                inner.state = SessionState::Leaving;
                inner.event_task.take()
            };
            tracing::info!("room session dropped, tearing down");
            Self::teardown(&*transport, &devices, &participants, event_task).await;

            let mut inner = inner.lock().await;
            inner.room = None;
            inner.published.clear();
            inner.state = SessionState::Idle;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::controls::LocalTrack;
    use crate::events::tests::EventCapture;
    use crate::identity::StaticIdentity;
    use crate::auth::TokenIssuer;
    use crate::layout::{LayoutPresenter, MemorySurfaces};
    use crate::loopback::{LoopbackTransport, SimulatedMedia};
    use crate::token::{JwtSigner, TokenVerifier};
    use async_trait::async_trait;
    use std::future::Future;
    use tokio::sync::Notify;

    type Journal = Arc<std::sync::Mutex<Vec<String>>>;

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    /// Wraps the loopback transport with connect stalls and publish failures,
    /// and journals disconnect calls.
    struct ScriptedTransport {
        inner: Arc<LoopbackTransport>,
        stall_connect: Option<Arc<Notify>>,
        fail_publish: Option<MediaKind>,
        journal: Journal,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self, params: &JoinParams) -> Result<EventReceiver, TransportError> {
            if let Some(gate) = &self.stall_connect {
                gate.notified().await;
            }
            self.inner.connect(params).await
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("disconnect listening={}", self.inner.is_listened_to()));
            self.inner.disconnect().await
        }

        async fn publish(&self, track: Arc<dyn LocalTrack>) -> Result<(), TransportError> {
            if self.fail_publish == Some(track.kind()) {
                return Err(TransportError::Rejected("publish quota exceeded".into()));
            }
            self.inner.publish(track).await
        }

        async fn subscribe(
            &self,
            participant_id: &str,
            kind: MediaKind,
        ) -> Result<Arc<dyn crate::transport::RemoteTrack>, TransportError> {
            self.inner.subscribe(participant_id, kind).await
        }
    }

    /// Local track that journals its close.
    #[derive(Debug)]
    struct JournalTrack {
        inner: Arc<dyn LocalTrack>,
        journal: Journal,
    }

    impl LocalTrack for JournalTrack {
        fn id(&self) -> &str {
            self.inner.id()
        }

        fn kind(&self) -> MediaKind {
            self.inner.kind()
        }

        fn set_enabled(&self, enabled: bool) -> Result<(), DeviceError> {
            self.inner.set_enabled(enabled)
        }

        fn play(&self, surface_id: &str) -> Result<(), DeviceError> {
            self.inner.play(surface_id)
        }

        fn close(&self) {
            self.journal.lock().unwrap().push(format!("close {}", self.kind()));
            self.inner.close();
        }
    }

    struct JournalMedia {
        inner: Arc<SimulatedMedia>,
        journal: Journal,
    }

    impl JournalMedia {
        fn wrap(&self, track: Arc<dyn LocalTrack>) -> Arc<dyn LocalTrack> {
            Arc::new(JournalTrack {
                inner: track,
                journal: self.journal.clone(),
            })
        }
    }

    #[async_trait]
    impl MediaBackend for JournalMedia {
        async fn request_permissions(&self) -> Result<Vec<Arc<dyn LocalTrack>>, DeviceError> {
            self.inner.request_permissions().await
        }

        async fn create_microphone_track(&self) -> Result<Arc<dyn LocalTrack>, DeviceError> {
            Ok(self.wrap(self.inner.create_microphone_track().await?))
        }

        async fn create_camera_track(&self) -> Result<Arc<dyn LocalTrack>, DeviceError> {
            Ok(self.wrap(self.inner.create_camera_track().await?))
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        media: Arc<SimulatedMedia>,
        loopback: Arc<LoopbackTransport>,
        issuer: TokenIssuer,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let config = AppConfig::from_lookup(|key| match key {
                "APP_ID" => Some("app-123".into()),
                "APP_CERTIFICATE" => Some("cert".into()),
                _ => None,
            })
            .unwrap();
            Self {
                media: Arc::new(SimulatedMedia::new()),
                loopback: Arc::new(LoopbackTransport::new(
                    TokenVerifier::new("app-123", "cert"),
                    clock.clone(),
                )),
                issuer: TokenIssuer::new(
                    config,
                    Arc::new(StaticIdentity::signed_in("user_1")),
                    Arc::new(JwtSigner),
                    clock.clone(),
                ),
                clock,
            }
        }

        fn options(&self) -> SessionOptions {
            SessionOptions {
                clock: self.clock.clone(),
                ..SessionOptions::default()
            }
        }

        fn session(&self) -> Arc<RoomSession> {
            self.session_with(self.loopback.clone(), self.options())
        }

        fn session_with(
            &self,
            transport: Arc<dyn Transport>,
            options: SessionOptions,
        ) -> Arc<RoomSession> {
            Arc::new(RoomSession::new(transport, self.media.clone(), options))
        }

        fn scripted(
            &self,
            stall_connect: Option<Arc<Notify>>,
            fail_publish: Option<MediaKind>,
        ) -> Arc<ScriptedTransport> {
            Arc::new(ScriptedTransport {
                inner: self.loopback.clone(),
                stall_connect,
                fail_publish,
                journal: Journal::default(),
            })
        }

        async fn credential(&self) -> Credential {
            self.issuer.issue_token(&room()).await.unwrap()
        }
    }

    fn room() -> RoomId {
        RoomId::parse("room-42").unwrap()
    }

    fn identity() -> RoomIdentity {
        RoomIdentity {
            room_id: room(),
            local_user_id: "user_1".into(),
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..400 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let h = Harness::new();
        let session = h.session();
        let capture = Arc::new(EventCapture::default());
        session.add_listener(capture.clone());

        session.acquire().await.unwrap();
        assert_eq!(session.state().await, SessionState::ReadyToJoin);

        let outcome = session.join(h.credential().await, identity()).await.unwrap();
        assert!(outcome.fully_published());
        assert_eq!(outcome.published, vec![MediaKind::Audio, MediaKind::Video]);
        assert_eq!(session.state().await, SessionState::Joined);
        assert_eq!(h.loopback.published_tracks().len(), 2);
        assert_eq!(h.loopback.joined_as().unwrap().user_id, "user_1");

        h.loopback.remote_joined("p1");
        h.loopback.remote_published("p1", MediaKind::Video);
        h.loopback.remote_published("p1", MediaKind::Audio);
        eventually(|| {
            let session = session.clone();
            async move {
                session
                    .participants()
                    .await
                    .first()
                    .is_some_and(|p| p.has_video && p.has_audio)
            }
        })
        .await;

        let host = MemorySurfaces::new();
        let mut presenter = LayoutPresenter::default();
        presenter.sync(&session.participants().await, &host);
        assert_eq!(host.surfaces(), vec!["remote-video-p1".to_string()]);

        h.loopback.remote_left("p1");
        eventually(|| {
            let session = session.clone();
            async move { session.participants().await.is_empty() }
        })
        .await;
        presenter.sync(&session.participants().await, &host);
        assert!(host.surfaces().is_empty());

        session.leave().await;
        assert_eq!(session.state().await, SessionState::Idle);
        assert!(!h.loopback.is_connected());
        assert!(h.media.tracks().iter().all(|t| t.is_closed()));

        let states: Vec<SessionState> = capture
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                MeetEvent::SessionStateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::AcquiringDevices,
                SessionState::ReadyToJoin,
                SessionState::Joining,
                SessionState::Joined,
                SessionState::Leaving,
                SessionState::Idle,
            ]
        );
        assert!(capture.snapshot().contains(&MeetEvent::ParticipantJoined("p1".into())));
    }

    #[tokio::test]
    async fn join_requires_acquired_devices() {
        let h = Harness::new();
        let session = h.session();
        let err = session.join(h.credential().await, identity()).await.unwrap_err();
        assert!(matches!(
            err,
            MeetError::InvalidState {
                operation: "join",
                state: SessionState::Idle
            }
        ));
        assert_eq!(h.loopback.connect_count(), 0);
    }

    #[tokio::test]
    async fn device_failure_fails_session_and_releases_audio() {
        let h = Harness::new();
        h.media.fail_track(MediaKind::Video);
        let session = h.session();

        let err = session.acquire().await.unwrap_err();
        assert!(matches!(err, MeetError::DeviceUnavailable(_)));
        assert_eq!(session.state().await, SessionState::Failed);
        assert!(h.media.track_of(MediaKind::Audio).unwrap().is_closed());
        assert!(session.last_error().await.is_some());

        h.media.heal();
        session.acquire().await.unwrap();
        assert_eq!(session.state().await, SessionState::ReadyToJoin);
    }

    #[tokio::test]
    async fn token_valid_after_ten_minutes() {
        let h = Harness::new();
        let credential = h.credential().await;
        h.clock.advance(chrono::Duration::minutes(10));

        let session = h.session();
        session.acquire().await.unwrap();
        session.join(credential, identity()).await.unwrap();
        assert_eq!(session.state().await, SessionState::Joined);
        session.leave().await;
    }

    #[tokio::test]
    async fn token_expired_after_two_hours() {
        let h = Harness::new();
        let credential = h.credential().await;
        h.clock.advance(chrono::Duration::hours(2));

        let session = h.session();
        session.acquire().await.unwrap();
        let err = session.join(credential, identity()).await.unwrap_err();
        assert!(matches!(err, MeetError::Join(JoinFailure::CredentialExpired(_))));
        assert_eq!(session.state().await, SessionState::Failed);
        assert_eq!(h.loopback.connect_count(), 0);

        session.leave().await;
        assert!(h.media.tracks().iter().all(|t| t.is_closed()));
    }

    #[tokio::test]
    async fn transport_rejection_is_join_error() {
        let h = Harness::new();
        let session = h.session();
        session.acquire().await.unwrap();

        let mut credential = h.credential().await;
        credential.token = "forged.token.value".into();
        let err = session.join(credential, identity()).await.unwrap_err();
        assert!(matches!(
            err,
            MeetError::Join(JoinFailure::Transport(TransportError::InvalidToken(_)))
        ));
        assert_eq!(session.state().await, SessionState::Failed);
    }

    #[tokio::test]
    async fn credential_for_other_room_is_refused() {
        let h = Harness::new();
        let session = h.session();
        session.acquire().await.unwrap();
        let other = RoomIdentity {
            room_id: RoomId::parse("room-43").unwrap(),
            local_user_id: "user_1".into(),
        };
        let err = session.join(h.credential().await, other).await.unwrap_err();
        assert!(matches!(err, MeetError::InvalidRoom(_)));
        assert_eq!(session.state().await, SessionState::ReadyToJoin);
    }

    #[tokio::test]
    async fn leave_twice_ends_idle() {
        let h = Harness::new();
        let session = h.session();
        session.leave().await;
        assert_eq!(session.state().await, SessionState::Idle);

        session.acquire().await.unwrap();
        session.join(h.credential().await, identity()).await.unwrap();
        session.leave().await;
        session.leave().await;
        assert_eq!(session.state().await, SessionState::Idle);
        assert_eq!(h.loopback.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn scheduled_meeting_gate_is_rechecked() {
        let h = Harness::new();
        let starts_at = h.clock.now() + chrono::Duration::hours(1);
        let session = h.session_with(
            h.loopback.clone(),
            SessionOptions {
                scheduled_start: Some(starts_at),
                ..h.options()
            },
        );
        session.acquire().await.unwrap();

        let err = session.join(h.credential().await, identity()).await.unwrap_err();
        assert!(matches!(err, MeetError::NotYetStarted { starts_at: s } if s == starts_at));
        assert_eq!(session.state().await, SessionState::ReadyToJoin);

        h.clock.set(starts_at);
        session.join(h.credential().await, identity()).await.unwrap();
        assert_eq!(session.state().await, SessionState::Joined);
    }

    #[tokio::test]
    async fn connect_fetches_credential_from_source() {
        let h = Harness::new();
        let session = h.session();
        session.acquire().await.unwrap();
        let outcome = session.connect(&h.issuer, identity()).await.unwrap();
        assert_eq!(outcome.room, identity());
        assert_eq!(session.room().await, Some(identity()));
    }

    #[tokio::test]
    async fn publish_failures_are_reported_not_dropped() {
        let h = Harness::new();
        let session = h.session_with(h.scripted(None, Some(MediaKind::Video)), h.options());
        let capture = Arc::new(EventCapture::default());
        session.add_listener(capture.clone());
        session.acquire().await.unwrap();

        let outcome = session.join(h.credential().await, identity()).await.unwrap();
        assert_eq!(outcome.published, vec![MediaKind::Audio]);
        assert_eq!(outcome.publish_failures.len(), 1);
        assert_eq!(outcome.publish_failures[0].0, MediaKind::Video);
        assert_eq!(session.state().await, SessionState::Joined);
        assert!(capture.snapshot().iter().any(|e| matches!(
            e,
            MeetEvent::PublishFailed { kind: MediaKind::Video, .. }
        )));

        assert!(matches!(
            session.publish(MediaKind::Video).await,
            Err(MeetError::Publish { kind: MediaKind::Video, .. })
        ));
        assert!(!session.publish(MediaKind::Audio).await.unwrap());
        assert_eq!(session.published_kinds().await, vec![MediaKind::Audio]);
    }

    #[tokio::test]
    async fn publish_outside_joined_is_refused() {
        let h = Harness::new();
        let session = h.session();
        session.acquire().await.unwrap();
        assert!(matches!(
            session.publish(MediaKind::Audio).await,
            Err(MeetError::InvalidState { operation: "publish", .. })
        ));
    }

    #[tokio::test]
    async fn leave_during_join_cancels_and_reaches_idle() {
        let h = Harness::new();
        let gate = Arc::new(Notify::new());
        let session = h.session_with(h.scripted(Some(gate.clone()), None), h.options());
        session.acquire().await.unwrap();

        let credential = h.credential().await;
        let joining = {
            let session = session.clone();
            tokio::spawn(async move { session.join(credential, identity()).await })
        };
        eventually(|| {
            let session = session.clone();
            async move { session.state().await == SessionState::Joining }
        })
        .await;

        session.leave().await;
        let result = joining.await.unwrap();
        assert!(matches!(result, Err(MeetError::Join(JoinFailure::Cancelled))));
        assert_eq!(session.state().await, SessionState::Idle);
        assert!(!h.loopback.is_connected());
        assert!(h.media.tracks().iter().all(|t| t.is_closed()));
    }

    #[tokio::test]
    async fn join_times_out() {
        let h = Harness::new();
        let never = Arc::new(Notify::new());
        let transport = h.scripted(Some(never), None);
        let session = h.session_with(
            transport.clone(),
            SessionOptions {
                join_timeout: Duration::from_millis(50),
                ..h.options()
            },
        );
        session.acquire().await.unwrap();

        let err = session.join(h.credential().await, identity()).await.unwrap_err();
        assert!(matches!(err, MeetError::Join(JoinFailure::TimedOut(_))));
        assert_eq!(session.state().await, SessionState::Failed);

        session.leave().await;
        assert_eq!(session.state().await, SessionState::Idle);
        assert_eq!(entries(&transport.journal), vec!["disconnect listening=false"]);
    }

    #[tokio::test]
    async fn leave_after_rejected_join_still_disconnects() {
        let h = Harness::new();
        let transport = h.scripted(None, None);
        let session = h.session_with(transport.clone(), h.options());
        session.acquire().await.unwrap();

        let mut credential = h.credential().await;
        credential.token = "forged.token.value".into();
        assert!(session.join(credential, identity()).await.is_err());
        assert_eq!(session.state().await, SessionState::Failed);

        session.leave().await;
        assert_eq!(entries(&transport.journal).len(), 1);
        assert_eq!(session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn leave_stops_listening_then_disconnects_then_releases() {
        let h = Harness::new();
        let transport = h.scripted(None, None);
        let journal = transport.journal.clone();
        let media = Arc::new(JournalMedia {
            inner: h.media.clone(),
            journal: journal.clone(),
        });
        let session = RoomSession::new(transport.clone(), media, h.options());
        session.acquire().await.unwrap();
        session.join(h.credential().await, identity()).await.unwrap();
        assert!(h.loopback.is_listened_to());
        journal.lock().unwrap().clear();

        session.leave().await;
        assert_eq!(
            entries(&journal),
            vec!["disconnect listening=false", "close audio", "close video"]
        );
    }

    #[tokio::test]
    async fn dropped_session_disconnects_and_releases() {
        let h = Harness::new();
        let session = h.session();
        session.acquire().await.unwrap();
        session.join(h.credential().await, identity()).await.unwrap();

        h.loopback.remote_joined("p1");
        h.loopback.remote_published("p1", MediaKind::Audio);
        eventually(|| {
            let session = session.clone();
            async move {
                session
                    .participants()
                    .await
                    .first()
                    .is_some_and(|p| p.has_audio)
            }
        })
        .await;
        assert!(h.loopback.subscribed_tracks()[0].is_playing());

        drop(session);
        let loopback = h.loopback.clone();
        let media = h.media.clone();
        eventually(|| {
            let loopback = loopback.clone();
            let media = media.clone();
            async move {
                !loopback.is_connected()
                    && media.tracks().iter().all(|t| t.is_closed())
                    && loopback.subscribed_tracks().iter().all(|t| !t.is_playing())
            }
        })
        .await;
        assert_eq!(h.loopback.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn superseded_join_leaves_newer_connection_alone() {
        let h = Harness::new();
        let gate = Arc::new(Notify::new());
        let transport = h.scripted(Some(gate.clone()), None);
        let session = h.session_with(transport.clone(), h.options());
        session.acquire().await.unwrap();

        let credential = h.credential().await;
        let joining = {
            let session = session.clone();
            tokio::spawn(async move { session.join(credential, identity()).await })
        };
        eventually(|| {
            let session = session.clone();
            async move { session.state().await == SessionState::Joining }
        })
        .await;

        // a newer attempt takes over while the first connect is still pending
        {
            let mut inner = session.inner.lock().await;
            inner.attempt += 1;
            inner.state = SessionState::Joined;
        }
        gate.notify_one();

        let result = joining.await.unwrap();
        assert!(matches!(result, Err(MeetError::Join(JoinFailure::Cancelled))));
        assert!(h.loopback.is_connected());
        assert!(entries(&transport.journal).is_empty());

        session.leave().await;
        assert!(!h.loopback.is_connected());
    }


    #[tokio::test]
    async fn connection_loss_fails_session() {
        let h = Harness::new();
        let session = h.session();
        session.acquire().await.unwrap();
        session.join(h.credential().await, identity()).await.unwrap();

        h.loopback.drop_connection("server restart");
        eventually(|| {
            let session = session.clone();
            async move { session.state().await == SessionState::Failed }
        })
        .await;
        assert_eq!(session.last_error().await.as_deref(), Some("server restart"));

        session.leave().await;
        assert_eq!(session.state().await, SessionState::Idle);
        assert!(h.media.tracks().iter().all(|t| t.is_closed()));
    }

    #[tokio::test]
    async fn publish_before_join_event_is_tolerated() {
        let h = Harness::new();
        let session = h.session();
        session.acquire().await.unwrap();
        session.join(h.credential().await, identity()).await.unwrap();

        h.loopback.remote_published("p1", MediaKind::Video);
        h.loopback.remote_joined("p1");
        eventually(|| {
            let session = session.clone();
            async move {
                let participants = session.participants().await;
                participants.len() == 1 && participants[0].has_video
            }
        })
        .await;

        h.loopback.remote_unpublished("p1", MediaKind::Video);
        eventually(|| {
            let session = session.clone();
            async move {
                session
                    .participants()
                    .await
                    .first()
                    .is_some_and(|p| !p.has_video)
            }
        })
        .await;
    }

    #[tokio::test]
    async fn toggles_reach_local_tracks() {
        let h = Harness::new();
        let session = h.session();
        session.set_microphone_enabled(false).await;
        session.acquire().await.unwrap();
        assert!(!h.media.track_of(MediaKind::Audio).unwrap().is_enabled());

        session.set_camera_enabled(false).await;
        let devices = session.local_devices().await;
        assert!(!devices.camera_enabled);
        assert!(devices.has_video_track);
        assert!(!h.media.track_of(MediaKind::Video).unwrap().is_enabled());

        let host = MemorySurfaces::new();
        host.create_surface("video-preview");
        assert!(!session.render_preview(&host, "video-preview").await);
        session.set_camera_enabled(true).await;
        assert!(session.render_preview(&host, "video-preview").await);
    }

    #[tokio::test]
    async fn options_follow_settings() {
        let config = AppConfig::from_lookup(|key| (key == "JOIN_TIMEOUT_SECS").then(|| "7".to_string()))
            .unwrap();
        let settings = Settings {
            mic_enabled_on_join: false,
            ..Settings::default()
        };
        let options = SessionOptions::from_config(&config, &settings);
        assert_eq!(options.join_timeout, Duration::from_secs(7));
        assert!(!options.microphone_enabled);
        assert!(options.camera_enabled);
    }
}
