pub mod authn_request;
pub mod config;
pub mod error;
pub mod identity;
pub mod idp_metadata;
pub mod keys;
pub mod processor;
pub mod registry;
pub mod response;
pub mod session;
pub mod signing;
pub mod templates;
#[cfg(test)]
mod fixtures;
mod utils;
pub mod web;

pub use authn_request::{AuthnRequest, Binding, LogoutRequest};
pub use config::Config;
pub use error::{SamlError, SamlResult};
pub use identity::{IdpIdentity, UserIdentity};
pub use idp_metadata::render_metadata;
pub use processor::{Delivery, ExchangeState, Processor};
pub use registry::{ProcessorConfig, ProcessorRegistry};
pub use signing::{load_certificate, sign_response, verify, SignatureAlgorithm};
pub use templates::{template_names, Templates};
pub use utils::random_id;
use time::format_description::well_known::iso8601::{self, TimePrecision};

pub const NAME_ID_FORMAT_EMAIL_ADDRESS: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
pub const NAME_ID_FORMAT_PERSISTENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent";
pub const NAME_ID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";

pub const AUTHN_CONTEXT_PASSWORD_PROTECTED: &str =
    "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport";

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;
