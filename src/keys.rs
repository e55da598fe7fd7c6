//! Certificate and private key store for the IdP signing credentials.

use std::fmt;

use crate::{
    config::IdpConfig,
    error::{SamlError, SamlResult},
    signing::{check_certificate, load_certificate},
};

/// Signing certificate and private key, loaded once.
///
/// Key material is kept as bytes and turned into an xmlsec key for each
/// signing call, so the credentials can be shared freely across threads.
#[derive(Clone)]
pub struct SigningCredentials {
    certificate: String,
    certificate_der: Vec<u8>,
    private_key_pem: Option<Vec<u8>>,
}

impl SigningCredentials {
    pub fn load(config: &IdpConfig) -> SamlResult<Self> {
        let certificate = load_certificate(config)?;
        let private_key_pem = match (&config.private_key_data, &config.private_key_file) {
            (Some(data), _) => Some(data.as_bytes().to_vec()),
            (None, Some(path)) => Some(std::fs::read(path).map_err(|e| {
                SamlError::Configuration(format!(
                    "failed to read private key {}: {e}",
                    path.display()
                ))
            })?),
            (None, None) => {
                tracing::warn!("no IdP private key configured; signed responses will fail");
                None
            }
        };
        Self::new(certificate, private_key_pem)
    }

    pub fn from_pem(certificate_pem: &str, private_key_pem: Option<&str>) -> SamlResult<Self> {
        Self::new(
            certificate_body(certificate_pem),
            private_key_pem.map(|pem| pem.as_bytes().to_vec()),
        )
    }

    fn new(certificate: String, private_key_pem: Option<Vec<u8>>) -> SamlResult<Self> {
        let certificate_der = check_certificate(&certificate)?;
        Ok(SigningCredentials {
            certificate,
            certificate_der,
            private_key_pem,
        })
    }

    /// Base64 certificate body, as embedded in metadata and signatures.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn private_key_pem(&self) -> SamlResult<&[u8]> {
        self.private_key_pem
            .as_deref()
            .ok_or_else(|| SamlError::SigningFailure("no private key available".into()))
    }
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("certificate", &self.certificate)
            .field("private_key", &self.private_key_pem.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Strip PEM armor and whitespace, leaving the base64 body.
pub fn certificate_body(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----"))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .collect()
}
