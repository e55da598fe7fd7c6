//! Shared values for unit tests.

use time::{macros::datetime, OffsetDateTime};

use crate::{
    authn_request::AuthnRequest,
    config::Config,
    identity::{IdpIdentity, UserIdentity},
    registry::ProcessorRegistry,
};

pub const MESSAGING_ENTITY_ID: &str = "https://messaging.example.com/saml/metadata";
pub const MESSAGING_ACS: &str = "https://messaging.example.com/saml/acs";

pub const CONFIG: &str = r#"
idp:
  entity_id: https://idp.example.com/idp/metadata/
  base_url: https://idp.example.com/idp
  certificate_file: tests/fixtures/idp.crt
  private_key_file: tests/fixtures/idp.key
  organization:
    name: Example
    display_name: Example Inc.
    url: https://example.com/
service_providers:
  - name: messaging
    entity_id: https://messaging.example.com/saml/metadata
    acs_url: https://messaging.example.com/saml/acs
    acs_urls:
      - https://messaging.example.com/saml/acs/alt
    attributes:
      - name: mail
        source: email
      - name: memberOf
        source: groups
    links:
      inbox: https://messaging.example.com/inbox
  - name: wiki
    entity_id: https://wiki.example.com/
    acs_url: https://wiki.example.com/acs
    sign_response: true
    sign_assertion: false
    signature_algorithm: rsa-sha512
    name_id_format: urn:oasis:names:tc:SAML:2.0:nameid-format:transient
    assertion_validity_secs: 120
"#;

pub const NOW: OffsetDateTime = datetime!(2026-10-16 10:00:00 UTC);

pub fn config() -> Config {
    Config::from_yaml(CONFIG).unwrap()
}

pub fn idp() -> IdpIdentity {
    IdpIdentity::from_config(&config().idp).unwrap()
}

pub fn registry() -> ProcessorRegistry {
    ProcessorRegistry::new(config().service_providers).unwrap()
}

pub fn user() -> UserIdentity {
    UserIdentity::new("fred")
        .email("fred@example.com")
        .name("Fred", "Flintstone")
        .groups(&["quarry"])
}

pub fn request(issuer: &str) -> AuthnRequest {
    AuthnRequest {
        xml: String::new(),
        id: "_request1".into(),
        version: "2.0".into(),
        issue_instant: NOW,
        issuer: issuer.into(),
        acs_url: None,
        destination: None,
        protocol_binding: None,
        name_id_format: None,
        force_authn: false,
        is_passive: false,
        relay_state: None,
    }
}
