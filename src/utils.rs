use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{
    tree::{Document, Node},
    xpath::{Context, Object},
};
use rand::RngCore;

use time::{OffsetDateTime, UtcOffset};
use url::Url;

use crate::{
    error::{SamlError, SamlResult},
    DATE_TIME_FORMAT,
};

pub const NS_PROTOCOL: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const NS_ASSERTION: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const NS_METADATA: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const NS_DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";

/// XML ID (NCName) with 160 bits from the thread-local CSPRNG.
pub fn random_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("_{}", hex::encode(bytes))
}

pub fn single_node(object: &Object, what: &str) -> SamlResult<Node> {
    let mut nodes = object.get_nodes_as_vec();
    if nodes.len() != 1 {
        return Err(SamlError::MalformedRequest(format!(
            "expected exactly one {what}, found {}",
            nodes.len()
        )));
    }
    Ok(nodes.remove(0))
}

pub fn decode_xml_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

/// XPath context with the SAML, metadata and XML-DSig prefixes registered.
pub fn saml_context(document: &Document) -> SamlResult<Context> {
    let mut context = Context::new(document)
        .map_err(|_| SamlError::MalformedRequest("failed to create XPath context".into()))?;
    for (prefix, href) in [
        ("samlp", NS_PROTOCOL),
        ("saml", NS_ASSERTION),
        ("md", NS_METADATA),
        ("ds", NS_DSIG),
    ] {
        context
            .register_namespace(prefix, href)
            .map_err(|_| SamlError::MalformedRequest(format!("failed to register {prefix}")))?;
    }
    Ok(context)
}

/// Text value of an XPath expression; empty results count as absent.
pub fn find_text(context: &mut Context, xpath: &str, node: Option<&Node>) -> Option<String> {
    context
        .findvalue(xpath, node)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `xs:dateTime` in UTC with second precision.
pub fn xs_date_time(instant: OffsetDateTime) -> SamlResult<String> {
    instant
        .to_offset(UtcOffset::UTC)
        .format(&DATE_TIME_FORMAT)
        .map_err(|e| SamlError::Configuration(format!("cannot format {instant}: {e}")))
}

/// Parse a URL that the IdP is about to send a browser to. Only absolute
/// http(s) URLs are accepted.
pub fn validate_redirect_target(target: &str) -> SamlResult<Url> {
    let url = Url::parse(target)
        .map_err(|e| SamlError::InvalidRedirectTarget(format!("{target:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        _ => Err(SamlError::InvalidRedirectTarget(format!(
            "{target:?} is not an absolute http(s) URL"
        ))),
    }
}
