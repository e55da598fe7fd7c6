//! Process-wide configuration, loaded once from YAML at startup.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{
    error::{SamlError, SamlResult},
    registry::ProcessorConfig,
    signing::SignatureAlgorithm,
    NAME_ID_FORMAT_EMAIL_ADDRESS,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub idp: IdpConfig,
    #[serde(default)]
    pub templates: TemplateConfig,
    #[serde(default)]
    pub service_providers: Vec<ProcessorConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Path prefix the protocol endpoints are mounted under.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Where unauthenticated users are sent. A `next` parameter is appended.
    #[serde(default = "default_login_url")]
    pub login_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            base_path: default_base_path(),
            login_url: default_login_url(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_base_path() -> String {
    "/idp".to_string()
}

fn default_login_url() -> String {
    "/accounts/login/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdpConfig {
    pub entity_id: String,
    /// Absolute URL of the mounted endpoints, e.g. `https://idp.example.com/idp`.
    pub base_url: String,
    pub certificate_file: Option<PathBuf>,
    pub certificate_data: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub private_key_data: Option<String>,
    #[serde(default = "default_name_id_formats")]
    pub name_id_formats: Vec<String>,
    pub organization: Option<OrganizationConfig>,
    #[serde(default = "default_validity")]
    pub assertion_validity_secs: u32,
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u32,
    /// Oldest AuthnRequest still answered, counting the time spent logging in.
    #[serde(default = "default_request_max_age")]
    pub request_max_age_secs: u32,
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,
}

fn default_name_id_formats() -> Vec<String> {
    vec![NAME_ID_FORMAT_EMAIL_ADDRESS.to_string()]
}

fn default_validity() -> u32 {
    300
}

fn default_clock_skew() -> u32 {
    60
}

fn default_request_max_age() -> u32 {
    600
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OrganizationConfig {
    pub name: String,
    pub display_name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateConfig {
    /// Directory holding `saml2idp/...` template overrides.
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info,saml2idp=debug".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SamlResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SamlError::Configuration(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(content: &str) -> SamlResult<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| SamlError::Configuration(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration file path from `SAML2IDP_CONFIG`, or the default.
    pub fn config_path() -> String {
        std::env::var("SAML2IDP_CONFIG").unwrap_or_else(|_| "./config/saml2idp.yaml".to_string())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("SAML2IDP_BIND") {
            self.server.bind = bind;
        }
        if let Ok(base_url) = std::env::var("SAML2IDP_BASE_URL") {
            self.idp.base_url = base_url;
        }
    }

    fn validate(&self) -> SamlResult<()> {
        if self.idp.entity_id.trim().is_empty() {
            return Err(SamlError::Configuration("idp.entity_id is empty".into()));
        }
        url::Url::parse(&self.idp.base_url)
            .map_err(|e| SamlError::Configuration(format!("idp.base_url: {e}")))?;
        if !self.server.base_path.is_empty() && !self.server.base_path.starts_with('/') {
            return Err(SamlError::Configuration(
                "server.base_path must start with '/'".into(),
            ));
        }
        if self.idp.assertion_validity_secs == 0 {
            return Err(SamlError::Configuration(
                "idp.assertion_validity_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
