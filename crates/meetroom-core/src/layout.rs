use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::participants::RemoteParticipant;

const GRID_COLUMNS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutMode {
    Grid,
    #[default]
    SpeakerLeft,
    SpeakerRight,
}

impl fmt::Display for LayoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayoutMode::Grid => "grid",
            LayoutMode::SpeakerLeft => "speaker-left",
            LayoutMode::SpeakerRight => "speaker-right",
        })
    }
}

impl FromStr for LayoutMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grid" => Ok(LayoutMode::Grid),
            "speaker-left" => Ok(LayoutMode::SpeakerLeft),
            "speaker-right" => Ok(LayoutMode::SpeakerRight),
            other => Err(format!("unknown layout '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilePlacement {
    Cell { row: usize, column: usize },
    Speaker,
    Sidebar { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub participant_id: String,
    pub surface_id: String,
    pub has_video: bool,
    pub placement: TilePlacement,
}

/// Where rendered video ends up. Implemented by the UI shell.
pub trait SurfaceHost: Send + Sync {
    fn has_surface(&self, surface_id: &str) -> bool;
    fn create_surface(&self, surface_id: &str);
    fn remove_surface(&self, surface_id: &str);
}

/// Surface host that only remembers surface names.
#[derive(Debug, Default)]
pub struct MemorySurfaces {
    surfaces: Mutex<BTreeSet<String>>,
}

impl MemorySurfaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn surfaces(&self) -> Vec<String> {
        self.surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl SurfaceHost for MemorySurfaces {
    fn has_surface(&self, surface_id: &str) -> bool {
        self.surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(surface_id)
    }

    fn create_surface(&self, surface_id: &str) {
        self.surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(surface_id.to_string());
    }

    fn remove_surface(&self, surface_id: &str) {
        self.surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(surface_id);
    }
}

pub fn surface_id(participant_id: &str) -> String {
    format!("remote-video-{participant_id}")
}

/// Arranges remote participants and keeps their video surfaces in sync.
#[derive(Debug, Default)]
pub struct LayoutPresenter {
    mode: LayoutMode,
    show_participants: bool,
    /// participant id -> id of the video track playing on its surface
    bound: BTreeMap<String, String>,
}

impl LayoutPresenter {
    pub fn new(mode: LayoutMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> LayoutMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: LayoutMode) {
        self.mode = mode;
    }

    pub fn show_participants(&self) -> bool {
        self.show_participants
    }

    pub fn toggle_participants(&mut self) -> bool {
        self.show_participants = !self.show_participants;
        self.show_participants
    }

    /// Side of the strip of non-speaker tiles. `None` for grid.
    pub fn sidebar_side(&self) -> Option<Side> {
        match self.mode {
            LayoutMode::Grid => None,
            LayoutMode::SpeakerLeft => Some(Side::Right),
            LayoutMode::SpeakerRight => Some(Side::Left),
        }
    }

    pub fn arrange(&self, participants: &[RemoteParticipant]) -> Vec<Tile> {
        participants
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let placement = match self.mode {
                    LayoutMode::Grid => TilePlacement::Cell {
                        row: i / GRID_COLUMNS,
                        column: i % GRID_COLUMNS,
                    },
                    LayoutMode::SpeakerLeft | LayoutMode::SpeakerRight if i == 0 => {
                        TilePlacement::Speaker
                    }
                    LayoutMode::SpeakerLeft | LayoutMode::SpeakerRight => {
                        TilePlacement::Sidebar { index: i - 1 }
                    }
                };
                Tile {
                    participant_id: p.participant_id.clone(),
                    surface_id: surface_id(&p.participant_id),
                    has_video: p.has_video,
                    placement,
                }
            })
            .collect()
    }

    /// Bring surfaces in line with the registry: remove surfaces whose
    /// participant left or stopped video, create and attach the rest.
    pub fn sync(&mut self, participants: &[RemoteParticipant], host: &dyn SurfaceHost) {
        let wanted: BTreeMap<&str, _> = participants
            .iter()
            .filter_map(|p| p.video.as_ref().map(|v| (p.participant_id.as_str(), v)))
            .collect();

        let stale: Vec<String> = self
            .bound
            .keys()
            .filter(|id| !wanted.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            self.bound.remove(&id);
            host.remove_surface(&surface_id(&id));
            tracing::debug!("detached surface for {id}");
        }

        for (id, track) in wanted {
            let surface = surface_id(id);
            if !host.has_surface(&surface) {
                host.create_surface(&surface);
            }
            if self.bound.get(id).map(String::as_str) != Some(track.id()) {
                track.play(Some(surface.as_str()));
                self.bound.insert(id.to_string(), track.id().to_string());
                tracing::debug!("attached {} to {surface}", track.id());
            }
        }
    }

    /// Remove every surface this presenter created.
    pub fn detach_all(&mut self, host: &dyn SurfaceHost) {
        for id in std::mem::take(&mut self.bound).into_keys() {
            host.remove_surface(&surface_id(&id));
        }
    }
}
