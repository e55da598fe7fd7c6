//! Decoding of inbound `AuthnRequest` and `LogoutRequest` messages.

use std::{fmt::Display, io::Read, str::FromStr};

use flate2::read::DeflateDecoder;
use libxml::parser::Parser as XmlParser;
use time::{format_description::well_known::Iso8601, OffsetDateTime};

use crate::{
    error::{SamlError, SamlResult},
    utils::{decode_xml_base64, find_text, saml_context, single_node},
};

/// Encoded size limits, checked before base64 decoding.
const MAX_ENCODED_SIZE_REDIRECT: usize = 128 * 1024;
const MAX_ENCODED_SIZE_POST: usize = 512 * 1024;

/// Inflated size limit for the redirect binding.
const MAX_INFLATED_SIZE: u64 = 64 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    Post,
    #[default]
    Redirect,
}

impl Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Binding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            Binding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
        }
    }
}

impl FromStr for Binding {
    type Err = SamlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(Binding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(Binding::Redirect),
            _ => Err(SamlError::UnknownBinding(s.to_string())),
        }
    }
}

/// A decoded `AuthnRequest`. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnRequest {
    /// The decoded request document.
    pub xml: String,
    pub id: String,
    pub version: String,
    pub issue_instant: OffsetDateTime,
    /// SP entity ID as claimed by the request.
    pub issuer: String,
    pub acs_url: Option<String>,
    pub destination: Option<String>,
    pub protocol_binding: Option<Binding>,
    pub name_id_format: Option<String>,
    pub force_authn: bool,
    pub is_passive: bool,
    /// Opaque, echoed back to the SP unchanged.
    pub relay_state: Option<String>,
}

impl AuthnRequest {
    /// Decode a `SAMLRequest` parameter received over `binding`.
    pub fn decode(raw: &str, binding: Binding) -> SamlResult<Self> {
        let xml = decode_payload(raw, binding)?;
        Self::parse(xml)
    }

    pub fn with_relay_state(self, relay_state: Option<String>) -> Self {
        AuthnRequest {
            relay_state,
            ..self
        }
    }

    fn parse(xml: String) -> SamlResult<Self> {
        let parser = XmlParser::default();
        let document = parser
            .parse_string(xml.as_bytes())
            .map_err(|e| SamlError::MalformedRequest(format!("invalid XML: {e:?}")))?;
        let mut context = saml_context(&document)?;

        let root = single_node(
            &context
                .evaluate("/samlp:AuthnRequest")
                .map_err(|_| SamlError::MalformedRequest("XPath evaluation failed".into()))?,
            "samlp:AuthnRequest",
        )?;

        let id = root
            .get_attribute("ID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SamlError::MalformedRequest("missing ID attribute".into()))?;
        let version = root
            .get_attribute("Version")
            .ok_or_else(|| SamlError::MalformedRequest("missing Version attribute".into()))?;
        let issue_instant = root
            .get_attribute("IssueInstant")
            .ok_or_else(|| SamlError::MalformedRequest("missing IssueInstant attribute".into()))
            .and_then(|value| {
                OffsetDateTime::parse(&value, &Iso8601::DEFAULT).map_err(|_| {
                    SamlError::MalformedRequest(format!("invalid IssueInstant {value:?}"))
                })
            })?;
        let issuer = find_text(&mut context, "/samlp:AuthnRequest/saml:Issuer", None)
            .ok_or_else(|| SamlError::MalformedRequest("missing Issuer element".into()))?;
        let protocol_binding = root
            .get_attribute("ProtocolBinding")
            .map(|value| value.parse())
            .transpose()?;
        let name_id_format = find_text(
            &mut context,
            "/samlp:AuthnRequest/samlp:NameIDPolicy/@Format",
            None,
        );

        Ok(AuthnRequest {
            id,
            version,
            issue_instant,
            issuer,
            acs_url: root
                .get_attribute("AssertionConsumerServiceURL")
                .filter(|url| !url.is_empty()),
            destination: root.get_attribute("Destination").filter(|d| !d.is_empty()),
            protocol_binding,
            name_id_format,
            force_authn: root.get_attribute("ForceAuthn").as_deref() == Some("true"),
            is_passive: root.get_attribute("IsPassive").as_deref() == Some("true"),
            relay_state: None,
            xml,
        })
    }
}

/// A decoded SP-initiated `LogoutRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    pub id: String,
    pub issuer: String,
    pub name_id: Option<String>,
    pub session_index: Option<String>,
}

impl LogoutRequest {
    pub fn decode(raw: &str, binding: Binding) -> SamlResult<Self> {
        let xml = decode_payload(raw, binding)?;

        let parser = XmlParser::default();
        let document = parser
            .parse_string(xml.as_bytes())
            .map_err(|e| SamlError::MalformedRequest(format!("invalid XML: {e:?}")))?;
        let mut context = saml_context(&document)?;

        let root = single_node(
            &context
                .evaluate("/samlp:LogoutRequest")
                .map_err(|_| SamlError::MalformedRequest("XPath evaluation failed".into()))?,
            "samlp:LogoutRequest",
        )?;

        Ok(LogoutRequest {
            id: root
                .get_attribute("ID")
                .filter(|id| !id.is_empty())
                .ok_or_else(|| SamlError::MalformedRequest("missing ID attribute".into()))?,
            issuer: find_text(&mut context, "/samlp:LogoutRequest/saml:Issuer", None)
                .ok_or_else(|| SamlError::MalformedRequest("missing Issuer element".into()))?,
            name_id: find_text(&mut context, "/samlp:LogoutRequest/saml:NameID", None),
            session_index: find_text(
                &mut context,
                "/samlp:LogoutRequest/samlp:SessionIndex",
                None,
            ),
        })
    }
}

/// base64 (and, for the redirect binding, raw DEFLATE) to UTF-8 XML.
fn decode_payload(raw: &str, binding: Binding) -> SamlResult<String> {
    let limit = match binding {
        Binding::Redirect => MAX_ENCODED_SIZE_REDIRECT,
        Binding::Post => MAX_ENCODED_SIZE_POST,
    };
    if raw.len() > limit {
        return Err(SamlError::MalformedRequest(format!(
            "encoded message exceeds {limit} bytes"
        )));
    }

    let decoded = decode_xml_base64(raw)?;
    let bytes = match binding {
        Binding::Post => decoded,
        Binding::Redirect => inflate(&decoded)?,
    };

    String::from_utf8(bytes)
        .map_err(|e| SamlError::MalformedRequest(format!("message is not UTF-8: {e}")))
}

fn inflate(compressed: &[u8]) -> SamlResult<Vec<u8>> {
    let mut inflated = Vec::new();
    DeflateDecoder::new(compressed)
        .take(MAX_INFLATED_SIZE + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| SamlError::MalformedRequest(format!("inflate failed: {e}")))?;

    if inflated.len() as u64 > MAX_INFLATED_SIZE {
        return Err(SamlError::MalformedRequest(format!(
            "inflated message exceeds {MAX_INFLATED_SIZE} bytes"
        )));
    }
    Ok(inflated)
}
