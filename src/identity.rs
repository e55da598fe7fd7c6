//! The IdP's own identity and the identities it vouches for.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::{
    config::{IdpConfig, OrganizationConfig},
    error::SamlResult,
    keys::SigningCredentials,
    signing::SignatureAlgorithm,
};

/// Process-wide IdP state. Built once at startup and shared immutably.
#[derive(Debug, Clone)]
pub struct IdpIdentity {
    pub entity_id: String,
    base_url: String,
    pub organization: Option<OrganizationConfig>,
    pub name_id_formats: Vec<String>,
    pub credentials: SigningCredentials,
    pub assertion_validity: Duration,
    pub clock_skew: Duration,
    pub request_max_age: Duration,
    pub signature_algorithm: SignatureAlgorithm,
}

impl IdpIdentity {
    pub fn from_config(config: &IdpConfig) -> SamlResult<Self> {
        Ok(IdpIdentity {
            entity_id: config.entity_id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            organization: config.organization.clone(),
            name_id_formats: config.name_id_formats.clone(),
            credentials: SigningCredentials::load(config)?,
            assertion_validity: Duration::seconds(i64::from(config.assertion_validity_secs)),
            clock_skew: Duration::seconds(i64::from(config.clock_skew_secs)),
            request_max_age: Duration::seconds(i64::from(config.request_max_age_secs)),
            signature_algorithm: config.signature_algorithm,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn sso_url(&self) -> String {
        format!("{}/login/", self.base_url)
    }

    pub fn slo_url(&self) -> String {
        format!("{}/slo/", self.base_url)
    }

    pub fn metadata_url(&self) -> String {
        format!("{}/metadata/", self.base_url)
    }
}

/// A locally authenticated user, as supplied by the authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Additional named attributes, each an ordered list of values.
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl UserIdentity {
    pub fn new(username: &str) -> Self {
        UserIdentity {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn email(self, email: &str) -> Self {
        UserIdentity {
            email: Some(email.into()),
            ..self
        }
    }

    pub fn name(self, first_name: &str, last_name: &str) -> Self {
        UserIdentity {
            first_name: Some(first_name.into()),
            last_name: Some(last_name.into()),
            ..self
        }
    }

    pub fn groups(self, groups: &[&str]) -> Self {
        UserIdentity {
            groups: groups.iter().map(|g| g.to_string()).collect(),
            ..self
        }
    }

    pub fn attribute(mut self, name: &str, values: &[&str]) -> Self {
        self.attributes.insert(
            name.into(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    /// Non-empty values of a named field. Unknown names are looked up in
    /// `attributes`.
    pub fn values(&self, field: &str) -> Vec<String> {
        let values = match field {
            "username" => vec![self.username.clone()],
            "email" => self.email.iter().cloned().collect(),
            "first_name" => self.first_name.iter().cloned().collect(),
            "last_name" => self.last_name.iter().cloned().collect(),
            "full_name" => {
                let full_name = [self.first_name.as_deref(), self.last_name.as_deref()]
                    .into_iter()
                    .flatten()
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                vec![full_name]
            }
            "groups" => self.groups.clone(),
            other => self.attributes.get(other).cloned().unwrap_or_default(),
        };
        values.into_iter().filter(|v| !v.is_empty()).collect()
    }
}
