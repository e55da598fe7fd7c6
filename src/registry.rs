//! Configured service providers and selection of the one that handles a
//! request.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::{
    authn_request::Binding,
    error::{SamlError, SamlResult},
    identity::UserIdentity,
    signing::SignatureAlgorithm,
    utils::validate_redirect_target,
    AUTHN_CONTEXT_PASSWORD_PROTECTED, NAME_ID_FORMAT_EMAIL_ADDRESS,
};

/// One service provider: how to recognise its requests and how to shape
/// the assertions it receives.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Short identifier, used in logs, template overrides and IdP-initiated URLs.
    pub name: String,
    pub entity_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Default Assertion Consumer Service URL.
    pub acs_url: String,
    /// Further ACS URLs the SP may ask for in its requests.
    #[serde(default)]
    pub acs_urls: Vec<String>,
    #[serde(default = "default_response_binding")]
    pub response_binding: String,
    #[serde(default)]
    pub sign_response: bool,
    #[serde(default = "default_true")]
    pub sign_assertion: bool,
    #[serde(default)]
    pub signature_algorithm: Option<SignatureAlgorithm>,
    #[serde(default = "default_name_id_format")]
    pub name_id_format: String,
    /// User field the NameID value is taken from.
    #[serde(default = "default_name_id_field")]
    pub name_id_field: String,
    #[serde(default)]
    pub attributes: Vec<AttributeRule>,
    #[serde(default)]
    pub assertion_validity_secs: Option<u32>,
    #[serde(default = "default_authn_context")]
    pub authn_context_class: String,
    /// Named RelayState targets for IdP-initiated logins.
    #[serde(default)]
    pub links: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_response_binding() -> String {
    Binding::Post.to_string()
}

fn default_name_id_format() -> String {
    NAME_ID_FORMAT_EMAIL_ADDRESS.to_string()
}

fn default_name_id_field() -> String {
    "email".to_string()
}

fn default_authn_context() -> String {
    AUTHN_CONTEXT_PASSWORD_PROTECTED.to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AttributeRule {
    /// Attribute `Name` as released to the SP.
    pub name: String,
    /// User field the values come from.
    pub source: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub name_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedAttribute {
    pub name: String,
    pub friendly_name: Option<String>,
    pub name_format: Option<String>,
    pub values: Vec<String>,
}

impl ProcessorConfig {
    /// Apply the attribute rules to a user. Attributes without values are
    /// left out.
    pub fn map_attributes(&self, user: &UserIdentity) -> Vec<MappedAttribute> {
        self.attributes
            .iter()
            .filter_map(|rule| {
                let values = user.values(&rule.source);
                (!values.is_empty()).then(|| MappedAttribute {
                    name: rule.name.clone(),
                    friendly_name: rule.friendly_name.clone(),
                    name_format: rule.name_format.clone(),
                    values,
                })
            })
            .collect()
    }

    pub fn allows_acs_url(&self, url: &str) -> bool {
        self.acs_url == url || self.acs_urls.iter().any(|allowed| allowed == url)
    }

    fn check(&self) -> SamlResult<()> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            return Err(SamlError::Configuration(format!(
                "service provider name {:?} must be non-empty and use only [A-Za-z0-9_-]",
                self.name
            )));
        }
        if self.entity_id.trim().is_empty() {
            return Err(SamlError::Configuration(format!(
                "service provider {} has no entity_id",
                self.name
            )));
        }
        for url in std::iter::once(&self.acs_url).chain(&self.acs_urls) {
            validate_redirect_target(url).map_err(|_| {
                SamlError::Configuration(format!(
                    "service provider {} has an invalid ACS URL {url:?}",
                    self.name
                ))
            })?;
        }
        let binding: Binding = self.response_binding.parse()?;
        if binding != Binding::Post {
            return Err(SamlError::Configuration(format!(
                "service provider {}: responses can only be delivered with HTTP-POST",
                self.name
            )));
        }
        if self.assertion_validity_secs == Some(0) {
            return Err(SamlError::Configuration(format!(
                "service provider {}: assertion_validity_secs must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Immutable set of processors, keyed by SP entity ID and by name.
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    processors: Vec<ProcessorConfig>,
    by_entity_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl ProcessorRegistry {
    pub fn new(processors: Vec<ProcessorConfig>) -> SamlResult<Self> {
        let mut registry = ProcessorRegistry::default();
        for (index, processor) in processors.iter().enumerate() {
            processor.check()?;
            if registry
                .by_entity_id
                .insert(processor.entity_id.clone(), index)
                .is_some()
            {
                return Err(SamlError::Configuration(format!(
                    "duplicate service provider entity_id {}",
                    processor.entity_id
                )));
            }
            if registry.by_name.insert(processor.name.clone(), index).is_some() {
                return Err(SamlError::Configuration(format!(
                    "duplicate service provider name {}",
                    processor.name
                )));
            }
        }
        registry.processors = processors;
        Ok(registry)
    }

    /// The processor configured for the issuer of a request.
    pub fn select(&self, issuer: &str) -> SamlResult<&ProcessorConfig> {
        self.by_entity_id
            .get(issuer)
            .map(|&index| &self.processors[index])
            .ok_or_else(|| {
                SamlError::CannotHandleAssertion(format!(
                    "no service provider is configured for {issuer}"
                ))
            })
    }

    pub fn by_name(&self, name: &str) -> SamlResult<&ProcessorConfig> {
        self.by_name
            .get(name)
            .map(|&index| &self.processors[index])
            .ok_or_else(|| {
                SamlError::CannotHandleAssertion(format!("no service provider is named {name}"))
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.processors.iter().map(|processor| processor.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}
