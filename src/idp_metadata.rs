use yaserde::YaSerialize;

use crate::{
    authn_request::Binding,
    error::{SamlError, SamlResult},
    identity::IdpIdentity,
    signing::KeyInfo,
    utils::NS_PROTOCOL,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "md" = "urn:oasis:names:tc:SAML:2.0:metadata",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
    "xml" = "http://www.w3.org/XML/1998/namespace",
  },
  prefix = "md"
)]
struct EntityDescriptor {
    #[yaserde(attribute = true, rename = "entityID")]
    entity_id: String,
    #[yaserde(rename = "IDPSSODescriptor", prefix = "md")]
    idp_sso_descriptor: IDPSSODescriptor,
    #[yaserde(rename = "Organization", prefix = "md")]
    organization: Option<Organization>,
}

#[derive(YaSerialize)]
struct IDPSSODescriptor {
    #[yaserde(attribute = true, rename = "WantAuthnRequestsSigned")]
    want_authn_requests_signed: bool,
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(rename = "KeyDescriptor", prefix = "md")]
    key_descriptor: KeyDescriptor,
    #[yaserde(rename = "SingleLogoutService", prefix = "md")]
    single_logout_services: Vec<Endpoint>,
    #[yaserde(rename = "NameIDFormat", prefix = "md")]
    name_id_formats: Vec<String>,
    #[yaserde(rename = "SingleSignOnService", prefix = "md")]
    single_sign_on_services: Vec<Endpoint>,
}

#[derive(YaSerialize)]
struct KeyDescriptor {
    #[yaserde(attribute = true, rename = "use")]
    key_use: String,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
}

#[derive(YaSerialize)]
struct Endpoint {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
}

impl Endpoint {
    fn for_bindings(location: &str) -> Vec<Endpoint> {
        [Binding::Redirect, Binding::Post]
            .into_iter()
            .map(|binding| Endpoint {
                binding: binding.to_string(),
                location: location.into(),
            })
            .collect()
    }
}

#[derive(YaSerialize)]
struct Organization {
    #[yaserde(rename = "OrganizationName", prefix = "md")]
    name: Localized,
    #[yaserde(rename = "OrganizationDisplayName", prefix = "md")]
    display_name: Localized,
    #[yaserde(rename = "OrganizationURL", prefix = "md")]
    url: Localized,
}

#[derive(YaSerialize)]
struct Localized {
    #[yaserde(attribute = true, prefix = "xml", rename = "lang")]
    lang: String,
    #[yaserde(text = true)]
    content: String,
}

impl Localized {
    fn en(content: &str) -> Self {
        Localized {
            lang: "en".into(),
            content: content.into(),
        }
    }
}

/// The IdP's `md:EntityDescriptor`, advertising its signing certificate
/// and endpoints.
pub fn render_metadata(idp: &IdpIdentity) -> SamlResult<String> {
    let metadata = EntityDescriptor {
        entity_id: idp.entity_id.clone(),
        idp_sso_descriptor: IDPSSODescriptor {
            want_authn_requests_signed: false,
            protocol_support_enumeration: NS_PROTOCOL.into(),
            key_descriptor: KeyDescriptor {
                key_use: "signing".into(),
                key_info: KeyInfo::new(idp.credentials.certificate()),
            },
            single_logout_services: Endpoint::for_bindings(&idp.slo_url()),
            name_id_formats: idp.name_id_formats.clone(),
            single_sign_on_services: Endpoint::for_bindings(&idp.sso_url()),
        },
        organization: idp.organization.as_ref().map(|org| Organization {
            name: Localized::en(&org.name),
            display_name: Localized::en(&org.display_name),
            url: Localized::en(&org.url),
        }),
    };
    yaserde::ser::to_string(&metadata)
        .map_err(|e| SamlError::Configuration(format!("failed to serialize metadata: {e}")))
}
