use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::errors::MeetError;
use crate::identity::IdentityProvider;
use crate::links::RoomId;
use crate::token::{Credential, DYNAMIC_UID, TokenRequest, TokenResponse, TokenSigner, token_validity};

/// Anything that can hand out a join credential for a room.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, room_id: &RoomId) -> Result<Credential, MeetError>;
}

/// Signs room tokens for the signed-in user.
pub struct TokenIssuer {
    config: AppConfig,
    identity: Arc<dyn IdentityProvider>,
    signer: Arc<dyn TokenSigner>,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(
        config: AppConfig,
        identity: Arc<dyn IdentityProvider>,
        signer: Arc<dyn TokenSigner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            identity,
            signer,
            clock,
        }
    }

    /// Issue a credential valid for one hour.
    ///
    /// Configuration is checked before identity, so a missing app id or
    /// certificate is reported the same way whoever asks.
    pub async fn issue_token(&self, room_id: &RoomId) -> Result<Credential, MeetError> {
        let (app_id, secret) = self.config.signing_keys()?;

        let user = self
            .identity
            .current_user()
            .await
            .filter(|u| u.is_authenticated)
            .ok_or(MeetError::Unauthenticated)?;

        let now = self.clock.now();
        let expires_at = chrono::DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
            + token_validity();

        let token = self.signer.build_token(&TokenRequest {
            app_id,
            secret,
            room_id,
            uid: DYNAMIC_UID,
            role: self.config.token_role,
            expires_at,
        })?;

        tracing::info!(
            "issued {} token for room {room_id} to user {} (expires {expires_at})",
            self.config.token_role,
            user.id
        );

        Ok(Credential {
            token,
            app_id: app_id.to_string(),
            room_id: room_id.clone(),
            expires_at,
        })
    }
}

#[async_trait]
impl TokenSource for TokenIssuer {
    async fn fetch(&self, room_id: &RoomId) -> Result<Credential, MeetError> {
        self.issue_token(room_id).await
    }
}

/// Requests credentials from a token endpoint over HTTP.
pub struct RemoteTokenSource {
    base_url: Url,
    session_token: Option<String>,
    client: reqwest::Client,
}

impl RemoteTokenSource {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            session_token: None,
            client: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured HTTP client (proxies, timeouts, roots).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Bearer token identifying the signed-in user to the endpoint.
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// `{base}/api/token?room={room}`
    pub fn token_url(&self, room_id: &RoomId) -> String {
        format!(
            "{}/api/token?room={}",
            self.base_url.as_str().trim_end_matches('/'),
            urlencoding::encode(room_id.as_str())
        )
    }
}

#[async_trait]
impl TokenSource for RemoteTokenSource {
    async fn fetch(&self, room_id: &RoomId) -> Result<Credential, MeetError> {
        let api_url = self.token_url(room_id);
        tracing::info!("requesting token from {api_url}");

        let mut request = self.client.get(&api_url);
        if let Some(token) = &self.session_token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| MeetError::Http(e.to_string()))?;

        match resp.status() {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                return Err(MeetError::Unauthenticated);
            }
            status if !status.is_success() => {
                return Err(MeetError::Http(format!("token endpoint returned status {status}")));
            }
            _ => {}
        }

        let data: TokenResponse = resp
            .json()
            .await
            .map_err(|e| MeetError::Http(format!("invalid token response: {e}")))?;

        Ok(data.into_credential(room_id.clone()))
    }
}
