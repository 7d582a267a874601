//! Meetroom core business logic.
//!
//! Pure Rust crate with no platform dependencies. The media transport and
//! capture devices sit behind traits; `loopback` provides in-process versions
//! of both.

pub mod auth;
pub mod clock;
pub mod config;
pub mod controls;
pub mod errors;
pub mod events;
pub mod identity;
pub mod layout;
pub mod links;
pub mod loopback;
pub mod meeting;
pub mod participants;
pub mod room;
pub mod settings;
pub mod token;
pub mod transport;

pub use auth::{RemoteTokenSource, TokenIssuer, TokenSource};
pub use config::AppConfig;
pub use controls::{DeviceTrackManager, LocalDeviceState, LocalTrack, MediaBackend, TrackHandle};
pub use errors::{DeviceError, JoinFailure, MeetError, TokenError};
pub use events::{EventEmitter, MeetEvent, MeetEventListener};
pub use layout::{LayoutMode, LayoutPresenter, SurfaceHost};
pub use links::{MeetingLink, RoomId};
pub use meeting::Meeting;
pub use participants::{ParticipantRegistry, RemoteParticipant};
pub use room::{JoinOutcome, RoomIdentity, RoomSession, SessionOptions, SessionState};
pub use settings::{Settings, SettingsStore};
pub use token::{Credential, TokenResponse, TokenRole};
pub use transport::{MediaKind, Transport, TransportError, TransportEvent};
