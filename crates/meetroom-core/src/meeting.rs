//! Instant and scheduled meetings.
//!
//! A meeting is a freshly generated room plus an optional description and
//! start time. It yields the shareable link and the session options that gate
//! joins until the start time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::TokenSource;
use crate::errors::MeetError;
use crate::links::{MeetingLink, RoomId};
use crate::room::SessionOptions;
use crate::token::Credential;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
}

impl Meeting {
    /// Meeting that can be joined right away.
    pub fn instant() -> Self {
        Self {
            room_id: RoomId::generate(),
            description: None,
            starts_at: None,
        }
    }

    /// Meeting that opens at `starts_at`. A blank description is dropped.
    pub fn scheduled(description: impl Into<String>, starts_at: DateTime<Utc>) -> Self {
        let description = description.into();
        let description = description.trim();
        Self {
            room_id: RoomId::generate(),
            description: (!description.is_empty()).then(|| description.to_string()),
            starts_at: Some(starts_at),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.starts_at.is_some()
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.starts_at.is_none_or(|starts_at| now >= starts_at)
    }

    pub fn link(&self, base_url: &str) -> Result<MeetingLink, MeetError> {
        MeetingLink::new(base_url, self.room_id.clone(), false)
    }

    /// `options` with the join gate set to this meeting's start time.
    pub fn session_options(&self, options: SessionOptions) -> SessionOptions {
        SessionOptions {
            scheduled_start: self.starts_at,
            ..options
        }
    }

    /// Fetch a join credential for the meeting's room.
    pub async fn credential(&self, source: &dyn TokenSource) -> Result<Credential, MeetError> {
        let credential = source.fetch(&self.room_id).await?;
        tracing::info!("meeting {} created", self.room_id);
        Ok(credential)
    }
}
