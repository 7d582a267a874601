use std::time::Duration;

use url::Url;

use crate::errors::MeetError;
use crate::token::TokenRole;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Deployment configuration, read from the environment.
///
/// `APP_ID` and `APP_CERTIFICATE` stay optional here: their absence is a
/// token-issuing error, not a startup error.
#[derive(Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub app_id: Option<String>,
    pub app_certificate: Option<String>,
    pub base_url: Url,
    pub token_role: TokenRole,
    pub join_timeout: Duration,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("app_id", &self.app_id)
            .field("app_certificate", &self.app_certificate.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url.as_str())
            .field("token_role", &self.token_role)
            .field("join_timeout", &self.join_timeout)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, MeetError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, MeetError> {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let base_url = non_empty("BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base_url)
            .map_err(|e| MeetError::Configuration(format!("invalid BASE_URL '{base_url}': {e}")))?;

        let token_role = match non_empty("TOKEN_ROLE") {
            Some(role) => role.parse().map_err(MeetError::Configuration)?,
            None => TokenRole::default(),
        };

        let join_timeout = match non_empty("JOIN_TIMEOUT_SECS") {
            Some(secs) => secs
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    MeetError::Configuration(format!("invalid JOIN_TIMEOUT_SECS '{secs}'"))
                })?,
            None => DEFAULT_JOIN_TIMEOUT,
        };

        Ok(Self {
            app_id: non_empty("APP_ID"),
            app_certificate: non_empty("APP_CERTIFICATE"),
            base_url,
            token_role,
            join_timeout,
        })
    }

    /// App id and signing secret, or the configuration error naming what is missing.
    pub fn signing_keys(&self) -> Result<(&str, &str), MeetError> {
        let app_id = self
            .app_id
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| MeetError::Configuration("APP_ID is missing".into()))?;
        let secret = self
            .app_certificate
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| MeetError::Configuration("APP_CERTIFICATE is missing".into()))?;
        Ok((app_id, secret))
    }
}
