use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::MeetError;

/// Characters a room identifier may contain, at most 64 of them.
static ROOM_ID_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9 !#$%&()+\-:;<=.>?@\[\]^_{|}~,]{1,64}$")
        .expect("room id pattern compiles")
});

const MEETING_SEGMENT: &str = "meeting";

/// Validated room (channel) name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(input: &str) -> Result<Self, MeetError> {
        if ROOM_ID_PATTERN.is_match(input) {
            Ok(Self(input.to_string()))
        } else {
            Err(MeetError::InvalidRoom(format!("invalid room id: '{input}'")))
        }
    }

    /// Fresh random room id (hyphenated uuid v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomId {
    type Error = MeetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

/// Shareable `/meeting/{room}?personal=true` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingLink {
    pub base_url: Url,
    pub room_id: RoomId,
    pub personal: bool,
}

impl MeetingLink {
    pub fn new(base_url: &str, room_id: RoomId, personal: bool) -> Result<Self, MeetError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| MeetError::Configuration(format!("invalid base url '{base_url}': {e}")))?;
        Ok(Self {
            base_url,
            room_id,
            personal,
        })
    }

    /// A user's personal room is keyed by their user id.
    pub fn personal_room(base_url: &str, user_id: &str) -> Result<Self, MeetError> {
        Self::new(base_url, RoomId::parse(user_id)?, true)
    }

    /// Path and query relative to the site root.
    pub fn path(&self) -> String {
        let mut path = format!(
            "/{MEETING_SEGMENT}/{}",
            urlencoding::encode(self.room_id.as_str())
        );
        if self.personal {
            path.push_str("?personal=true");
        }
        path
    }

    pub fn to_url(&self) -> Url {
        let mut url = self.base_url.clone();
        let prefix = self.base_url.path().trim_end_matches('/');
        url.set_path(&format!(
            "{prefix}/{MEETING_SEGMENT}/{}",
            urlencoding::encode(self.room_id.as_str())
        ));
        url.set_query(self.personal.then_some("personal=true"));
        url.set_fragment(None);
        url
    }

    /// Parse a full meeting URL back into its parts.
    pub fn parse(input: &str) -> Result<Self, MeetError> {
        let url = Url::parse(input.trim())
            .map_err(|e| MeetError::InvalidRoom(format!("invalid meeting url '{input}': {e}")))?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let pos = segments
            .iter()
            .rposition(|seg| *seg == MEETING_SEGMENT)
            .filter(|pos| pos + 2 == segments.len())
            .ok_or_else(|| {
                MeetError::InvalidRoom(format!("expected '/{MEETING_SEGMENT}/<room>', got '{input}'"))
            })?;

        let raw_room = segments[pos + 1];
        let room = urlencoding::decode(raw_room)
            .map_err(|e| MeetError::InvalidRoom(format!("bad room encoding '{raw_room}': {e}")))?;
        let room_id = RoomId::parse(&room)?;

        let personal = url
            .query_pairs()
            .any(|(k, v)| k == "personal" && (v == "true" || v == "1"));

        let mut base_url = url.clone();
        let prefix = segments[..pos].join("/");
        base_url.set_path(&format!("/{prefix}"));
        base_url.set_query(None);
        base_url.set_fragment(None);

        Ok(Self {
            base_url,
            room_id,
            personal,
        })
    }
}

impl fmt::Display for MeetingLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_url())
    }
}
