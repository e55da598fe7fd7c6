//! Assertion building and `samlp:Response` rendering.

use time::{Duration, OffsetDateTime};

use crate::{
    authn_request::AuthnRequest,
    error::{SamlError, SamlResult},
    identity::{IdpIdentity, UserIdentity},
    registry::{MappedAttribute, ProcessorConfig},
    signing::Signature,
    utils::{random_id, xs_date_time},
    NAME_ID_FORMAT_TRANSIENT,
};

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const SUBJECT_CONFIRMATION_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";
const NAME_ID_FORMAT_ENTITY: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:entity";

/// Everything the IdP asserts about a user to one SP, before it becomes XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub id: String,
    pub issue_instant: OffsetDateTime,
    pub issuer: String,
    pub name_id: String,
    pub name_id_format: String,
    /// ACS URL the assertion is delivered to.
    pub recipient: String,
    pub in_response_to: Option<String>,
    pub not_before: OffsetDateTime,
    pub not_on_or_after: OffsetDateTime,
    pub audience: String,
    pub session_index: String,
    pub authn_context_class: String,
    pub attributes: Vec<MappedAttribute>,
}

pub fn build_assertion(
    idp: &IdpIdentity,
    config: &ProcessorConfig,
    request: Option<&AuthnRequest>,
    acs_url: &str,
    user: &UserIdentity,
    now: OffsetDateTime,
) -> SamlResult<Assertion> {
    let name_id = if config.name_id_format == NAME_ID_FORMAT_TRANSIENT {
        random_id()
    } else {
        user.values(&config.name_id_field)
            .into_iter()
            .next()
            .ok_or_else(|| {
                SamlError::InvalidIdentity(format!(
                    "user {} has no {} for the NameID",
                    user.username, config.name_id_field
                ))
            })?
    };

    let validity = config
        .assertion_validity_secs
        .map(|secs| Duration::seconds(i64::from(secs)))
        .unwrap_or(idp.assertion_validity);

    Ok(Assertion {
        id: random_id(),
        issue_instant: now,
        issuer: idp.entity_id.clone(),
        name_id,
        name_id_format: config.name_id_format.clone(),
        recipient: acs_url.to_string(),
        in_response_to: request.map(|request| request.id.clone()),
        not_before: now - idp.clock_skew,
        not_on_or_after: now + validity,
        audience: config.entity_id.clone(),
        session_index: random_id(),
        authn_context_class: config.authn_context_class.clone(),
        attributes: config.map_attributes(user),
    })
}

/// A rendered, not yet signed, response document.
#[derive(Debug, Clone)]
pub struct RenderedResponse {
    pub id: String,
    pub xml: String,
}

/// Render a `samlp:Response` carrying the assertion, with signature
/// templates where the processor wants signatures.
pub fn render_response(
    assertion: &Assertion,
    idp: &IdpIdentity,
    config: &ProcessorConfig,
) -> SamlResult<RenderedResponse> {
    let algorithm = config
        .signature_algorithm
        .unwrap_or(idp.signature_algorithm);
    let response_id = random_id();

    let issuer = || xml::Issuer {
        format: Some(NAME_ID_FORMAT_ENTITY.into()),
        value: assertion.issuer.clone(),
    };

    let attribute_statement = (!assertion.attributes.is_empty()).then(|| xml::AttributeStatement {
        attributes: assertion
            .attributes
            .iter()
            .map(|attribute| xml::Attribute {
                name: attribute.name.clone(),
                friendly_name: attribute.friendly_name.clone(),
                name_format: attribute.name_format.clone(),
                values: attribute.values.clone(),
            })
            .collect(),
    });

    let response = xml::Response {
        id: response_id.clone(),
        version: "2.0".into(),
        issue_instant: xs_date_time(assertion.issue_instant)?,
        destination: assertion.recipient.clone(),
        in_response_to: assertion.in_response_to.clone(),
        issuer: issuer(),
        signature: config
            .sign_response
            .then(|| Signature::template(&response_id, algorithm)),
        status: xml::Status {
            status_code: xml::StatusCode {
                value: STATUS_SUCCESS.into(),
            },
        },
        assertion: xml::Assertion {
            id: assertion.id.clone(),
            version: "2.0".into(),
            issue_instant: xs_date_time(assertion.issue_instant)?,
            issuer: issuer(),
            signature: config
                .sign_assertion
                .then(|| Signature::template(&assertion.id, algorithm)),
            subject: xml::Subject {
                name_id: xml::NameId {
                    format: assertion.name_id_format.clone(),
                    sp_name_qualifier: assertion.audience.clone(),
                    value: assertion.name_id.clone(),
                },
                subject_confirmation: xml::SubjectConfirmation {
                    method: SUBJECT_CONFIRMATION_BEARER.into(),
                    subject_confirmation_data: xml::SubjectConfirmationData {
                        in_response_to: assertion.in_response_to.clone(),
                        not_on_or_after: xs_date_time(assertion.not_on_or_after)?,
                        recipient: assertion.recipient.clone(),
                    },
                },
            },
            conditions: xml::Conditions {
                not_before: xs_date_time(assertion.not_before)?,
                not_on_or_after: xs_date_time(assertion.not_on_or_after)?,
                audience_restriction: xml::AudienceRestriction {
                    audience: assertion.audience.clone(),
                },
            },
            authn_statement: xml::AuthnStatement {
                authn_instant: xs_date_time(assertion.issue_instant)?,
                session_index: assertion.session_index.clone(),
                authn_context: xml::AuthnContext {
                    authn_context_class_ref: assertion.authn_context_class.clone(),
                },
            },
            attribute_statement,
        },
    };

    let xml = yaserde::ser::to_string(&response)
        .map_err(|e| SamlError::SigningFailure(format!("failed to serialize response: {e}")))?;
    Ok(RenderedResponse {
        id: response_id,
        xml,
    })
}

mod xml {
    use yaserde::YaSerialize;

    use crate::signing::Signature;

    #[derive(YaSerialize)]
    #[yaserde(
      rename = "Response",
      namespaces = {
        "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
        "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
        "ds" = "http://www.w3.org/2000/09/xmldsig#",
      },
      prefix = "samlp"
    )]
    pub(super) struct Response {
        #[yaserde(attribute = true, rename = "ID")]
        pub id: String,
        #[yaserde(attribute = true, rename = "Version")]
        pub version: String,
        #[yaserde(attribute = true, rename = "IssueInstant")]
        pub issue_instant: String,
        #[yaserde(attribute = true, rename = "Destination")]
        pub destination: String,
        #[yaserde(attribute = true, rename = "InResponseTo")]
        pub in_response_to: Option<String>,
        #[yaserde(rename = "Issuer", prefix = "saml")]
        pub issuer: Issuer,
        #[yaserde(rename = "Signature", prefix = "ds")]
        pub signature: Option<Signature>,
        #[yaserde(rename = "Status", prefix = "samlp")]
        pub status: Status,
        #[yaserde(rename = "Assertion", prefix = "saml")]
        pub assertion: Assertion,
    }

    #[derive(YaSerialize)]
    pub(super) struct Issuer {
        #[yaserde(attribute = true, rename = "Format")]
        pub format: Option<String>,
        #[yaserde(text = true)]
        pub value: String,
    }

    #[derive(YaSerialize)]
    pub(super) struct Status {
        #[yaserde(rename = "StatusCode", prefix = "samlp")]
        pub status_code: StatusCode,
    }

    #[derive(YaSerialize)]
    pub(super) struct StatusCode {
        #[yaserde(attribute = true, rename = "Value")]
        pub value: String,
    }

    #[derive(YaSerialize)]
    pub(super) struct Assertion {
        #[yaserde(attribute = true, rename = "ID")]
        pub id: String,
        #[yaserde(attribute = true, rename = "Version")]
        pub version: String,
        #[yaserde(attribute = true, rename = "IssueInstant")]
        pub issue_instant: String,
        #[yaserde(rename = "Issuer", prefix = "saml")]
        pub issuer: Issuer,
        #[yaserde(rename = "Signature", prefix = "ds")]
        pub signature: Option<Signature>,
        #[yaserde(rename = "Subject", prefix = "saml")]
        pub subject: Subject,
        #[yaserde(rename = "Conditions", prefix = "saml")]
        pub conditions: Conditions,
        #[yaserde(rename = "AuthnStatement", prefix = "saml")]
        pub authn_statement: AuthnStatement,
        #[yaserde(rename = "AttributeStatement", prefix = "saml")]
        pub attribute_statement: Option<AttributeStatement>,
    }

    #[derive(YaSerialize)]
    pub(super) struct Subject {
        #[yaserde(rename = "NameID", prefix = "saml")]
        pub name_id: NameId,
        #[yaserde(rename = "SubjectConfirmation", prefix = "saml")]
        pub subject_confirmation: SubjectConfirmation,
    }

    #[derive(YaSerialize)]
    pub(super) struct NameId {
        #[yaserde(attribute = true, rename = "Format")]
        pub format: String,
        #[yaserde(attribute = true, rename = "SPNameQualifier")]
        pub sp_name_qualifier: String,
        #[yaserde(text = true)]
        pub value: String,
    }

    #[derive(YaSerialize)]
    pub(super) struct SubjectConfirmation {
        #[yaserde(attribute = true, rename = "Method")]
        pub method: String,
        #[yaserde(rename = "SubjectConfirmationData", prefix = "saml")]
        pub subject_confirmation_data: SubjectConfirmationData,
    }

    #[derive(YaSerialize)]
    pub(super) struct SubjectConfirmationData {
        #[yaserde(attribute = true, rename = "InResponseTo")]
        pub in_response_to: Option<String>,
        #[yaserde(attribute = true, rename = "NotOnOrAfter")]
        pub not_on_or_after: String,
        #[yaserde(attribute = true, rename = "Recipient")]
        pub recipient: String,
    }

    #[derive(YaSerialize)]
    pub(super) struct Conditions {
        #[yaserde(attribute = true, rename = "NotBefore")]
        pub not_before: String,
        #[yaserde(attribute = true, rename = "NotOnOrAfter")]
        pub not_on_or_after: String,
        #[yaserde(rename = "AudienceRestriction", prefix = "saml")]
        pub audience_restriction: AudienceRestriction,
    }

    #[derive(YaSerialize)]
    pub(super) struct AudienceRestriction {
        #[yaserde(rename = "Audience", prefix = "saml")]
        pub audience: String,
    }

    #[derive(YaSerialize)]
    pub(super) struct AuthnStatement {
        #[yaserde(attribute = true, rename = "AuthnInstant")]
        pub authn_instant: String,
        #[yaserde(attribute = true, rename = "SessionIndex")]
        pub session_index: String,
        #[yaserde(rename = "AuthnContext", prefix = "saml")]
        pub authn_context: AuthnContext,
    }

    #[derive(YaSerialize)]
    pub(super) struct AuthnContext {
        #[yaserde(rename = "AuthnContextClassRef", prefix = "saml")]
        pub authn_context_class_ref: String,
    }

    #[derive(YaSerialize)]
    pub(super) struct AttributeStatement {
        #[yaserde(rename = "Attribute", prefix = "saml")]
        pub attributes: Vec<Attribute>,
    }

    #[derive(YaSerialize)]
    pub(super) struct Attribute {
        #[yaserde(attribute = true, rename = "Name")]
        pub name: String,
        #[yaserde(attribute = true, rename = "FriendlyName")]
        pub friendly_name: Option<String>,
        #[yaserde(attribute = true, rename = "NameFormat")]
        pub name_format: Option<String>,
        #[yaserde(rename = "AttributeValue", prefix = "saml")]
        pub values: Vec<String>,
    }
}

#[cfg(test)]
mod tests {
    use libxml::parser::Parser as XmlParser;

    use super::*;
    use crate::{
        fixtures::{self, MESSAGING_ACS, MESSAGING_ENTITY_ID, NOW},
        utils::{find_text, saml_context},
        NAME_ID_FORMAT_EMAIL_ADDRESS,
    };

    #[test]
    fn assertion_is_bounded_in_time_and_audience() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.by_name("messaging").unwrap();
        let request = fixtures::request(MESSAGING_ENTITY_ID);

        let assertion = build_assertion(
            &idp,
            config,
            Some(&request),
            MESSAGING_ACS,
            &fixtures::user(),
            NOW,
        )
        .unwrap();

        assert_eq!(assertion.issuer, "https://idp.example.com/idp/metadata/");
        assert_eq!(assertion.name_id, "fred@example.com");
        assert_eq!(assertion.name_id_format, NAME_ID_FORMAT_EMAIL_ADDRESS);
        assert_eq!(assertion.audience, MESSAGING_ENTITY_ID);
        assert_eq!(assertion.recipient, MESSAGING_ACS);
        assert_eq!(assertion.in_response_to.as_deref(), Some("_request1"));
        assert_eq!(assertion.not_before, NOW - Duration::seconds(60));
        assert_eq!(assertion.not_on_or_after, NOW + Duration::seconds(300));
        assert!(assertion.not_before < assertion.not_on_or_after);
        assert_eq!(assertion.attributes.len(), 2);
    }

    #[test]
    fn per_processor_validity_and_transient_name_ids() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.by_name("wiki").unwrap();

        let build = || {
            build_assertion(
                &idp,
                config,
                None,
                "https://wiki.example.com/acs",
                &fixtures::user(),
                NOW,
            )
            .unwrap()
        };
        let first = build();
        let second = build();

        assert_eq!(first.not_on_or_after, NOW + Duration::seconds(120));
        assert_eq!(first.in_response_to, None);
        assert_ne!(first.name_id, second.name_id);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn user_without_name_id_value_is_rejected() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.by_name("messaging").unwrap();

        let result = build_assertion(
            &idp,
            config,
            None,
            MESSAGING_ACS,
            &UserIdentity::new("nomail"),
            NOW,
        );
        assert!(matches!(result, Err(SamlError::InvalidIdentity(_))));
    }

    #[test]
    fn renders_response_document() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.by_name("messaging").unwrap();
        let request = fixtures::request(MESSAGING_ENTITY_ID);
        let assertion = build_assertion(
            &idp,
            config,
            Some(&request),
            MESSAGING_ACS,
            &fixtures::user(),
            NOW,
        )
        .unwrap();

        let rendered = render_response(&assertion, &idp, config).unwrap();
        let document = XmlParser::default().parse_string(&rendered.xml).unwrap();
        let mut context = saml_context(&document).unwrap();
        let text = |context: &mut libxml::xpath::Context, xpath: &str| {
            find_text(context, xpath, None).unwrap_or_default()
        };

        assert_eq!(text(&mut context, "/samlp:Response/@ID"), rendered.id);
        assert_eq!(text(&mut context, "/samlp:Response/@InResponseTo"), "_request1");
        assert_eq!(text(&mut context, "/samlp:Response/@Destination"), MESSAGING_ACS);
        assert_eq!(
            text(&mut context, "/samlp:Response/samlp:Status/samlp:StatusCode/@Value"),
            STATUS_SUCCESS
        );
        assert_eq!(
            text(&mut context, "//saml:Assertion/saml:Subject/saml:NameID"),
            "fred@example.com"
        );
        assert_eq!(
            text(&mut context, "//saml:Conditions/@NotBefore"),
            "2026-10-16T09:59:00Z"
        );
        assert_eq!(
            text(&mut context, "//saml:Conditions/@NotOnOrAfter"),
            "2026-10-16T10:05:00Z"
        );
        assert_eq!(
            text(&mut context, "//saml:AudienceRestriction/saml:Audience"),
            MESSAGING_ENTITY_ID
        );
        assert_eq!(
            text(&mut context, "//saml:Attribute[@Name='mail']/saml:AttributeValue"),
            "fred@example.com"
        );

        // messaging signs the assertion only
        assert_eq!(text(&mut context, "count(/samlp:Response/ds:Signature)"), "0");
        assert_eq!(
            text(
                &mut context,
                "//saml:Assertion/ds:Signature/ds:SignedInfo/ds:Reference/@URI"
            ),
            format!("#{}", assertion.id)
        );
    }

    #[test]
    fn response_signature_template_uses_processor_algorithm() {
        let idp = fixtures::idp();
        let registry = fixtures::registry();
        let config = registry.by_name("wiki").unwrap();
        let assertion = build_assertion(
            &idp,
            config,
            None,
            "https://wiki.example.com/acs",
            &fixtures::user(),
            NOW,
        )
        .unwrap();

        let rendered = render_response(&assertion, &idp, config).unwrap();
        let document = XmlParser::default().parse_string(&rendered.xml).unwrap();
        let mut context = saml_context(&document).unwrap();

        assert_eq!(
            find_text(
                &mut context,
                "/samlp:Response/ds:Signature/ds:SignedInfo/ds:SignatureMethod/@Algorithm",
                None
            )
            .as_deref(),
            Some("http://www.w3.org/2001/04/xmldsig-more#rsa-sha512")
        );
        assert_eq!(
            find_text(&mut context, "count(//saml:Assertion/ds:Signature)", None).as_deref(),
            Some("0")
        );
        assert!(find_text(&mut context, "/samlp:Response/@InResponseTo", None).is_none());
    }
}
