//! One authentication exchange with one service provider.
//!
//! A [`Processor`] is created per exchange and moves through
//! `Received -> Validated -> Authenticated -> AssertionBuilt -> Signed ->
//! Delivered`. Any failing step leaves it in `Failed`. Instances are never
//! reused.

use std::fmt::Display;

use base64::{prelude::BASE64_STANDARD, Engine};
use time::OffsetDateTime;

use crate::{
    authn_request::{AuthnRequest, Binding},
    error::{SamlError, SamlResult},
    identity::{IdpIdentity, UserIdentity},
    registry::ProcessorConfig,
    response::{build_assertion, render_response, Assertion},
    signing::sign_response,
    utils::validate_redirect_target,
    NAME_ID_FORMAT_UNSPECIFIED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Received,
    Validated,
    Authenticated,
    AssertionBuilt,
    Signed,
    Delivered,
    Failed,
}

impl Display for ExchangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ExchangeState::Received => "received",
            ExchangeState::Validated => "validated",
            ExchangeState::Authenticated => "authenticated",
            ExchangeState::AssertionBuilt => "assertion_built",
            ExchangeState::Signed => "signed",
            ExchangeState::Delivered => "delivered",
            ExchangeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the browser needs to post the response to the SP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Name of the processor that handled the exchange.
    pub processor: String,
    pub acs_url: String,
    /// Base64 of the signed `samlp:Response`.
    pub saml_response: String,
    pub relay_state: Option<String>,
    pub response_id: String,
    pub assertion_id: String,
}

pub struct Processor<'a> {
    idp: &'a IdpIdentity,
    config: &'a ProcessorConfig,
    request: Option<AuthnRequest>,
    relay_state: Option<String>,
    state: ExchangeState,
    acs_url: Option<String>,
    user: Option<UserIdentity>,
    assertion: Option<Assertion>,
    response_id: Option<String>,
    signed_xml: Option<String>,
}

impl<'a> Processor<'a> {
    /// Exchange started by an SP's `AuthnRequest`.
    pub fn new(idp: &'a IdpIdentity, config: &'a ProcessorConfig, request: AuthnRequest) -> Self {
        let relay_state = request.relay_state.clone();
        Self::start(idp, config, Some(request), relay_state)
    }

    /// IdP-initiated exchange, with no request to answer.
    pub fn unsolicited(
        idp: &'a IdpIdentity,
        config: &'a ProcessorConfig,
        relay_state: Option<String>,
    ) -> Self {
        Self::start(idp, config, None, relay_state)
    }

    fn start(
        idp: &'a IdpIdentity,
        config: &'a ProcessorConfig,
        request: Option<AuthnRequest>,
        relay_state: Option<String>,
    ) -> Self {
        Processor {
            idp,
            config,
            request,
            relay_state,
            state: ExchangeState::Received,
            acs_url: None,
            user: None,
            assertion: None,
            response_id: None,
            signed_xml: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn assertion(&self) -> Option<&Assertion> {
        self.assertion.as_ref()
    }

    /// Run the exchange to completion for the given user.
    pub fn process(&mut self, user: Option<&UserIdentity>) -> SamlResult<Delivery> {
        self.process_at(user, OffsetDateTime::now_utc())
    }

    pub fn process_at(
        &mut self,
        user: Option<&UserIdentity>,
        now: OffsetDateTime,
    ) -> SamlResult<Delivery> {
        if self.state != ExchangeState::Received {
            return Err(SamlError::Configuration(format!(
                "processor {} already ran (state {})",
                self.config.name, self.state
            )));
        }
        let result = self
            .validate(now)
            .and_then(|()| self.authenticate(user))
            .and_then(|()| self.build_assertion(now))
            .and_then(|()| self.sign())
            .and_then(|()| self.deliver());

        match result {
            Ok(delivery) => {
                tracing::info!(
                    processor = %self.config.name,
                    response_id = %delivery.response_id,
                    acs_url = %delivery.acs_url,
                    "delivering SAML response"
                );
                Ok(delivery)
            }
            Err(error) => {
                tracing::warn!(
                    processor = %self.config.name,
                    failed_after = %self.state,
                    error = %error,
                    "SAML exchange failed"
                );
                self.state = ExchangeState::Failed;
                Err(error)
            }
        }
    }

    fn validate(&mut self, now: OffsetDateTime) -> SamlResult<()> {
        let acs_url = match &self.request {
            None => self.config.acs_url.clone(),
            Some(request) => {
                self.check_request(request, now)?;
                self.resolve_acs_url(request.acs_url.as_deref())?
            }
        };
        self.acs_url = Some(acs_url);
        self.state = ExchangeState::Validated;
        Ok(())
    }

    fn check_request(&self, request: &AuthnRequest, now: OffsetDateTime) -> SamlResult<()> {
        if request.version != "2.0" {
            return Err(SamlError::MalformedRequest(format!(
                "unsupported SAML version {}",
                request.version
            )));
        }
        if request.issue_instant > now + self.idp.clock_skew {
            return Err(SamlError::MalformedRequest(
                "request was issued in the future".into(),
            ));
        }
        if request.issue_instant < now - self.idp.request_max_age - self.idp.clock_skew {
            return Err(SamlError::MalformedRequest(format!(
                "request {} has expired",
                request.id
            )));
        }
        if let Some(destination) = &request.destination {
            let sso_url = self.idp.sso_url();
            if destination.trim_end_matches('/') != sso_url.trim_end_matches('/') {
                return Err(SamlError::MalformedRequest(format!(
                    "request is addressed to {destination}, not {sso_url}"
                )));
            }
        }
        if let Some(binding) = request.protocol_binding {
            if binding != Binding::Post {
                return Err(SamlError::UnknownBinding(format!(
                    "responses cannot be delivered with {binding}"
                )));
            }
        }
        if let Some(format) = &request.name_id_format {
            if format != NAME_ID_FORMAT_UNSPECIFIED && *format != self.config.name_id_format {
                return Err(SamlError::MalformedRequest(format!(
                    "NameID format {format} is not released to {}",
                    self.config.name
                )));
            }
        }
        Ok(())
    }

    /// The requested ACS URL when registered, otherwise the configured one.
    fn resolve_acs_url(&self, requested: Option<&str>) -> SamlResult<String> {
        let Some(requested) = requested else {
            return Ok(self.config.acs_url.clone());
        };
        validate_redirect_target(requested)
            .map_err(|_| SamlError::MalformedRequest(format!("invalid ACS URL {requested:?}")))?;
        if !self.config.allows_acs_url(requested) {
            return Err(SamlError::MalformedRequest(format!(
                "ACS URL {requested} is not registered for {}",
                self.config.name
            )));
        }
        Ok(requested.to_string())
    }

    fn authenticate(&mut self, user: Option<&UserIdentity>) -> SamlResult<()> {
        let user = user.ok_or(SamlError::NotAuthenticated)?;
        self.user = Some(user.clone());
        self.state = ExchangeState::Authenticated;
        Ok(())
    }

    fn build_assertion(&mut self, now: OffsetDateTime) -> SamlResult<()> {
        let (Some(user), Some(acs_url)) = (&self.user, &self.acs_url) else {
            return Err(SamlError::NotAuthenticated);
        };
        let assertion = build_assertion(
            self.idp,
            self.config,
            self.request.as_ref(),
            acs_url,
            user,
            now,
        )?;
        tracing::debug!(
            processor = %self.config.name,
            assertion_id = %assertion.id,
            name_id = %assertion.name_id,
            "built assertion"
        );
        self.assertion = Some(assertion);
        self.state = ExchangeState::AssertionBuilt;
        Ok(())
    }

    fn sign(&mut self) -> SamlResult<()> {
        let Some(assertion) = &self.assertion else {
            return Err(SamlError::SigningFailure("no assertion to sign".into()));
        };
        let rendered = render_response(assertion, self.idp, self.config)?;
        self.signed_xml = Some(sign_response(&rendered.xml, &self.idp.credentials)?);
        self.response_id = Some(rendered.id);
        self.state = ExchangeState::Signed;
        Ok(())
    }

    fn deliver(&mut self) -> SamlResult<Delivery> {
        let (Some(xml), Some(response_id), Some(assertion)) =
            (&self.signed_xml, &self.response_id, &self.assertion)
        else {
            return Err(SamlError::SigningFailure("no signed response to deliver".into()));
        };
        let delivery = Delivery {
            processor: self.config.name.clone(),
            acs_url: assertion.recipient.clone(),
            saml_response: BASE64_STANDARD.encode(xml),
            relay_state: self.relay_state.clone(),
            response_id: response_id.clone(),
            assertion_id: assertion.id.clone(),
        };
        self.state = ExchangeState::Delivered;
        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::{
        fixtures::{self, MESSAGING_ACS, MESSAGING_ENTITY_ID, NOW},
        signing::verify,
        utils::decode_xml_base64,
    };

    fn decoded(delivery: &Delivery) -> String {
        String::from_utf8(decode_xml_base64(&delivery.saml_response).unwrap()).unwrap()
    }

    #[test]
    fn delivers_signed_response() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.select(MESSAGING_ENTITY_ID).unwrap();
        let request = fixtures::request(MESSAGING_ENTITY_ID).with_relay_state(Some("abc".into()));

        let mut processor = Processor::new(&idp, config, request);
        assert_eq!(processor.state(), ExchangeState::Received);
        let delivery = processor.process_at(Some(&fixtures::user()), NOW).unwrap();

        assert_eq!(processor.state(), ExchangeState::Delivered);
        assert_eq!(delivery.processor, "messaging");
        assert_eq!(delivery.acs_url, MESSAGING_ACS);
        assert_eq!(delivery.relay_state.as_deref(), Some("abc"));
        assert_eq!(
            processor.assertion().unwrap().in_response_to.as_deref(),
            Some("_request1")
        );

        let xml = decoded(&delivery);
        assert!(xml.contains(&delivery.assertion_id));
        assert!(verify(&xml, idp.credentials.certificate_der()).unwrap());
    }

    #[test]
    fn unauthenticated_exchange_fails() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.select(MESSAGING_ENTITY_ID).unwrap();

        let mut processor = Processor::new(&idp, config, fixtures::request(MESSAGING_ENTITY_ID));
        assert!(matches!(
            processor.process_at(None, NOW),
            Err(SamlError::NotAuthenticated)
        ));
        assert_eq!(processor.state(), ExchangeState::Failed);
        assert!(processor.assertion().is_none());
    }

    #[test]
    fn processors_are_not_reused() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.select(MESSAGING_ENTITY_ID).unwrap();

        let mut processor = Processor::new(&idp, config, fixtures::request(MESSAGING_ENTITY_ID));
        processor.process_at(Some(&fixtures::user()), NOW).unwrap();
        assert!(processor.process_at(Some(&fixtures::user()), NOW).is_err());
        assert_eq!(processor.state(), ExchangeState::Delivered);
    }

    #[test]
    fn requested_acs_url_must_be_registered() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.select(MESSAGING_ENTITY_ID).unwrap();

        let mut alternate = fixtures::request(MESSAGING_ENTITY_ID);
        alternate.acs_url = Some("https://messaging.example.com/saml/acs/alt".into());
        let delivery = Processor::new(&idp, config, alternate)
            .process_at(Some(&fixtures::user()), NOW)
            .unwrap();
        assert_eq!(delivery.acs_url, "https://messaging.example.com/saml/acs/alt");

        let mut foreign = fixtures::request(MESSAGING_ENTITY_ID);
        foreign.acs_url = Some("https://evil.example.com/acs".into());
        let mut processor = Processor::new(&idp, config, foreign);
        assert!(matches!(
            processor.process_at(Some(&fixtures::user()), NOW),
            Err(SamlError::MalformedRequest(_))
        ));
        assert_eq!(processor.state(), ExchangeState::Failed);
    }

    #[test]
    fn request_checks() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.select(MESSAGING_ENTITY_ID).unwrap();
        let run = |request: AuthnRequest| {
            Processor::new(&idp, config, request).process_at(Some(&fixtures::user()), NOW)
        };

        let mut version = fixtures::request(MESSAGING_ENTITY_ID);
        version.version = "1.1".into();
        assert!(matches!(run(version), Err(SamlError::MalformedRequest(_))));

        let mut future = fixtures::request(MESSAGING_ENTITY_ID);
        future.issue_instant = NOW + Duration::minutes(10);
        assert!(matches!(run(future), Err(SamlError::MalformedRequest(_))));

        let mut skewed = fixtures::request(MESSAGING_ENTITY_ID);
        skewed.issue_instant = NOW + Duration::seconds(30);
        assert!(run(skewed).is_ok());

        let mut stale = fixtures::request(MESSAGING_ENTITY_ID);
        stale.issue_instant = NOW - Duration::hours(1);
        assert!(matches!(run(stale), Err(SamlError::MalformedRequest(_))));

        let mut slow_login = fixtures::request(MESSAGING_ENTITY_ID);
        slow_login.issue_instant = NOW - Duration::minutes(8);
        assert!(run(slow_login).is_ok());

        let mut destination = fixtures::request(MESSAGING_ENTITY_ID);
        destination.destination = Some("https://other-idp.example.com/sso".into());
        assert!(matches!(run(destination), Err(SamlError::MalformedRequest(_))));

        let mut ours = fixtures::request(MESSAGING_ENTITY_ID);
        ours.destination = Some("https://idp.example.com/idp/login".into());
        assert!(run(ours).is_ok());

        let mut binding = fixtures::request(MESSAGING_ENTITY_ID);
        binding.protocol_binding = Some(Binding::Redirect);
        assert!(matches!(run(binding), Err(SamlError::UnknownBinding(_))));

        let mut format = fixtures::request(MESSAGING_ENTITY_ID);
        format.name_id_format = Some(crate::NAME_ID_FORMAT_PERSISTENT.into());
        assert!(matches!(run(format), Err(SamlError::MalformedRequest(_))));

        let mut unspecified = fixtures::request(MESSAGING_ENTITY_ID);
        unspecified.name_id_format = Some(NAME_ID_FORMAT_UNSPECIFIED.into());
        assert!(run(unspecified).is_ok());
    }

    #[test]
    fn unsolicited_response_uses_configured_acs() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.by_name("wiki").unwrap();

        let mut processor =
            Processor::unsolicited(&idp, config, Some("https://wiki.example.com/page".into()));
        let delivery = processor.process_at(Some(&fixtures::user()), NOW).unwrap();

        assert_eq!(delivery.acs_url, "https://wiki.example.com/acs");
        assert_eq!(
            delivery.relay_state.as_deref(),
            Some("https://wiki.example.com/page")
        );
        let xml = decoded(&delivery);
        assert!(!xml.contains("InResponseTo"));
        assert!(verify(&xml, idp.credentials.certificate_der()).unwrap());
    }
}
