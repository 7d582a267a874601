use async_trait::async_trait;

/// The signed-in user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub is_authenticated: bool,
}

impl Identity {
    pub fn authenticated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_authenticated: true,
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Option<Identity>;
}

/// Identity provider with a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(pub Option<Identity>);

impl StaticIdentity {
    pub fn signed_in(id: impl Into<String>) -> Self {
        Self(Some(Identity::authenticated(id)))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<Identity> {
        self.0.clone()
    }
}
