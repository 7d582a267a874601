use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::{MeetError, TokenError};
use crate::links::RoomId;

/// How long an issued token stays valid, in seconds.
pub const TOKEN_VALIDITY_SECS: i64 = 3600;

pub fn token_validity() -> Duration {
    Duration::seconds(TOKEN_VALIDITY_SECS)
}

/// Uid 0 lets the transport assign one at join time.
pub const DYNAMIC_UID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenRole {
    #[default]
    Publisher,
    Subscriber,
}

impl fmt::Display for TokenRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TokenRole::Publisher => "publisher",
            TokenRole::Subscriber => "subscriber",
        })
    }
}

impl FromStr for TokenRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "publisher" => Ok(TokenRole::Publisher),
            "subscriber" => Ok(TokenRole::Subscriber),
            other => Err(format!("unknown token role '{other}'")),
        }
    }
}

/// Short-lived join credential. Consumed by a single join call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub app_id: String,
    pub room_id: RoomId,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Expiry has whole-second precision, matching the signed `exp` claim.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.expires_at.timestamp()
    }

    pub fn to_response(&self) -> TokenResponse {
        TokenResponse {
            token: self.token.clone(),
            app_id: self.app_id.clone(),
            expires_at: self.expires_at,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("app_id", &self.app_id)
            .field("room_id", &self.room_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// JSON body of a token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub app_id: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenResponse {
    pub fn into_credential(self, room_id: RoomId) -> Credential {
        Credential {
            token: self.token,
            app_id: self.app_id,
            room_id,
            expires_at: self.expires_at,
        }
    }
}

/// Inputs of the signing step.
#[derive(Clone, Copy)]
pub struct TokenRequest<'a> {
    pub app_id: &'a str,
    pub secret: &'a str,
    pub room_id: &'a RoomId,
    pub uid: u32,
    pub role: TokenRole,
    pub expires_at: DateTime<Utc>,
}

pub trait TokenSigner: Send + Sync {
    fn build_token(&self, request: &TokenRequest<'_>) -> Result<String, MeetError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// App id.
    pub iss: String,
    pub room: String,
    pub uid: u32,
    pub role: TokenRole,
    pub exp: i64,
}

/// HS256 JWT signer. Output depends only on the request fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct JwtSigner;

impl TokenSigner for JwtSigner {
    fn build_token(&self, request: &TokenRequest<'_>) -> Result<String, MeetError> {
        let claims = TokenClaims {
            iss: request.app_id.to_string(),
            room: request.room_id.as_str().to_string(),
            uid: request.uid,
            role: request.role,
            exp: request.expires_at.timestamp(),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(request.secret.as_bytes()),
        )
        .map_err(|e| MeetError::Configuration(format!("token signing failed: {e}")))
    }
}

/// Checks tokens produced by [`JwtSigner`] against an explicit clock reading.
#[derive(Clone)]
pub struct TokenVerifier {
    app_id: String,
    key: DecodingKey,
}

impl TokenVerifier {
    pub fn new(app_id: &str, secret: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn verify(
        &self,
        token: &str,
        room_id: &RoomId,
        now: DateTime<Utc>,
    ) -> Result<TokenClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // expiry is checked below against the caller's clock
        validation.validate_exp = false;

        let claims = jsonwebtoken::decode::<TokenClaims>(token, &self.key, &validation)
            .map_err(|e| TokenError::Invalid(e.to_string()))?
            .claims;

        if claims.iss != self.app_id {
            return Err(TokenError::AppMismatch);
        }
        if claims.room != room_id.as_str() {
            return Err(TokenError::RoomMismatch);
        }
        if now.timestamp() > claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}
