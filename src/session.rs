//! Per-browser state: the pending SAML request and the logged-in user.

use async_trait::async_trait;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tower_sessions::Session;

use crate::{
    authn_request::Binding,
    error::{SamlError, SamlResult},
    identity::UserIdentity,
};

pub const SAML_REQUEST_KEY: &str = "SAMLRequest";
pub const RELAY_STATE_KEY: &str = "RelayState";
pub const BINDING_KEY: &str = "SAMLBinding";
pub const RECEIVED_AT_KEY: &str = "SAMLReceivedAt";
pub const AUTH_USER_KEY: &str = "_auth_user";
pub const AUTH_INSTANT_KEY: &str = "_auth_instant";

/// A request captured at the login endpoint, awaiting authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Encoded `SAMLRequest`, exactly as received.
    pub saml_request: String,
    pub relay_state: Option<String>,
    pub binding: Binding,
    pub received_at: OffsetDateTime,
}

impl PendingRequest {
    pub fn new(saml_request: String, relay_state: Option<String>, binding: Binding) -> Self {
        PendingRequest {
            saml_request,
            relay_state,
            binding,
            received_at: OffsetDateTime::now_utc(),
        }
    }

    /// Store in the session, replacing any earlier pending request. A
    /// missing relay state clears the stored one.
    pub async fn store(&self, session: &Session) -> SamlResult<()> {
        session
            .insert(SAML_REQUEST_KEY, &self.saml_request)
            .await?;
        match &self.relay_state {
            Some(relay_state) => session.insert(RELAY_STATE_KEY, relay_state).await?,
            None => {
                session.remove_value(RELAY_STATE_KEY).await?;
            }
        }
        session
            .insert(BINDING_KEY, self.binding.to_string())
            .await?;
        session
            .insert(RECEIVED_AT_KEY, format_instant(self.received_at)?)
            .await?;
        Ok(())
    }

    pub async fn load(session: &Session) -> SamlResult<Option<Self>> {
        let Some(saml_request) = session.get::<String>(SAML_REQUEST_KEY).await? else {
            return Ok(None);
        };
        let binding = match session.get::<String>(BINDING_KEY).await? {
            Some(binding) => binding.parse()?,
            None => Binding::default(),
        };
        let received_at = session
            .get::<String>(RECEIVED_AT_KEY)
            .await?
            .ok_or_else(|| SamlError::Session("pending request has no timestamp".into()))
            .and_then(|instant| parse_instant(&instant))?;
        Ok(Some(PendingRequest {
            saml_request,
            relay_state: session.get(RELAY_STATE_KEY).await?,
            binding,
            received_at,
        }))
    }

    pub async fn clear(session: &Session) -> SamlResult<()> {
        for key in [SAML_REQUEST_KEY, RELAY_STATE_KEY, BINDING_KEY, RECEIVED_AT_KEY] {
            session.remove_value(key).await?;
        }
        Ok(())
    }
}

fn format_instant(instant: OffsetDateTime) -> SamlResult<String> {
    instant
        .format(&Rfc3339)
        .map_err(|e| SamlError::Session(format!("unrepresentable instant: {e}")))
}

fn parse_instant(instant: &str) -> SamlResult<OffsetDateTime> {
    OffsetDateTime::parse(instant, &Rfc3339)
        .map_err(|e| SamlError::Session(format!("bad instant {instant:?}: {e}")))
}

/// The local authentication system, as seen by the IdP.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn current_user(&self, session: &Session) -> SamlResult<Option<UserIdentity>>;

    /// When the current user last presented credentials. Requests with
    /// `ForceAuthn` need a login newer than the request.
    async fn authenticated_at(&self, session: &Session) -> SamlResult<Option<OffsetDateTime>>;

    /// End the local session, including any pending request.
    async fn logout(&self, session: &Session) -> SamlResult<()>;
}

/// Keeps the authenticated user in the session under [`AUTH_USER_KEY`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionAuthenticator;

impl SessionAuthenticator {
    /// Mark the session as authenticated. The session ID is rotated.
    pub async fn login(session: &Session, user: &UserIdentity) -> SamlResult<()> {
        session.cycle_id().await?;
        session.insert(AUTH_USER_KEY, user).await?;
        session
            .insert(AUTH_INSTANT_KEY, format_instant(OffsetDateTime::now_utc())?)
            .await?;
        tracing::info!(username = %user.username, "user logged in");
        Ok(())
    }
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    async fn current_user(&self, session: &Session) -> SamlResult<Option<UserIdentity>> {
        Ok(session.get(AUTH_USER_KEY).await?)
    }

    async fn authenticated_at(&self, session: &Session) -> SamlResult<Option<OffsetDateTime>> {
        session
            .get::<String>(AUTH_INSTANT_KEY)
            .await?
            .map(|instant| parse_instant(&instant))
            .transpose()
    }

    async fn logout(&self, session: &Session) -> SamlResult<()> {
        let user: Option<UserIdentity> = session.get(AUTH_USER_KEY).await?;
        session.flush().await?;
        if let Some(user) = user {
            tracing::info!(username = %user.username, "user logged out");
        }
        Ok(())
    }
}
