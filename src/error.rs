//! Error taxonomy for the IdP core.

use thiserror::Error;

pub type SamlResult<T> = Result<T, SamlError>;

#[derive(Debug, Error)]
pub enum SamlError {
    /// The SAMLRequest could not be decoded, parsed or validated.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unknown binding: {0}")]
    UnknownBinding(String),

    /// No processor is configured for the requesting service provider.
    #[error("cannot handle assertion for {0}")]
    CannotHandleAssertion(String),

    /// No authenticated local session. Recovered by sending the user to login.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The SP asked for `IsPassive` but the user would have to log in.
    #[error("passive authentication not possible: {0}")]
    NoPassive(String),

    /// The authenticated user cannot be vouched for by this processor.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Key, certificate or canonicalization problem. Never downgraded to an
    /// unsigned response.
    #[error("signing failure: {0}")]
    SigningFailure(String),

    #[error("certificate not found: {0}")]
    CertificateNotFound(String),

    /// A `redirect_to` target that is not an absolute http(s) URL.
    #[error("invalid redirect target: {0}")]
    InvalidRedirectTarget(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("session error: {0}")]
    Session(String),
}

impl SamlError {
    /// Short machine-readable code, used in logs and error pages.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "malformed_request",
            Self::UnknownBinding(_) => "unknown_binding",
            Self::CannotHandleAssertion(_) => "cannot_handle_assertion",
            Self::NotAuthenticated => "not_authenticated",
            Self::NoPassive(_) => "no_passive",
            Self::InvalidIdentity(_) => "invalid_identity",
            Self::SigningFailure(_) => "signing_failure",
            Self::CertificateNotFound(_) => "certificate_not_found",
            Self::InvalidRedirectTarget(_) => "invalid_redirect_target",
            Self::Configuration(_) => "configuration_error",
            Self::Template(_) => "template_error",
            Self::Session(_) => "session_error",
        }
    }

    /// HTTP status used when the error reaches the web layer.
    ///
    /// `NotAuthenticated` maps to 401 here, but the login flow intercepts it
    /// and redirects instead.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::MalformedRequest(_)
            | Self::UnknownBinding(_)
            | Self::InvalidRedirectTarget(_) => 400,
            Self::NotAuthenticated => 401,
            Self::CannotHandleAssertion(_) | Self::NoPassive(_) | Self::InvalidIdentity(_) => 403,
            Self::SigningFailure(_)
            | Self::CertificateNotFound(_)
            | Self::Configuration(_)
            | Self::Template(_)
            | Self::Session(_) => 500,
        }
    }

    /// Message safe to show to end users. Never names configured SPs.
    #[must_use]
    pub const fn public_message(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) | Self::UnknownBinding(_) => {
                "The SAML request could not be understood."
            }
            Self::InvalidRedirectTarget(_) => "The redirect target is not valid.",
            Self::NotAuthenticated => "You must log in to continue.",
            Self::NoPassive(_) => "You are not logged in to this identity provider.",
            Self::CannotHandleAssertion(_) | Self::InvalidIdentity(_) => {
                "This identity provider cannot handle the request."
            }
            _ => "An internal error occurred.",
        }
    }
}

impl From<base64::DecodeError> for SamlError {
    fn from(err: base64::DecodeError) -> Self {
        Self::MalformedRequest(format!("base64 decode error: {err}"))
    }
}

impl From<tower_sessions::session::Error> for SamlError {
    fn from(err: tower_sessions::session::Error) -> Self {
        Self::Session(err.to_string())
    }
}

impl From<handlebars::RenderError> for SamlError {
    fn from(err: handlebars::RenderError) -> Self {
        Self::Template(err.to_string())
    }
}

impl From<handlebars::TemplateError> for SamlError {
    fn from(err: handlebars::TemplateError) -> Self {
        Self::Template(err.to_string())
    }
}
