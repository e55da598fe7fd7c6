//! XML-DSig signing of outgoing responses and verification of signed
//! documents.
//!
//! Signatures are enveloped, use exclusive canonicalization, and carry the
//! IdP certificate in `KeyInfo`. The response builder emits empty
//! `ds:Signature` templates where signatures are wanted; [`sign_response`]
//! fills them in.

use libxml::{
    parser::Parser as XmlParser,
    tree::{Document, Node, SaveOptions},
    xpath::Context,
};
use serde::Deserialize;
use xmlsec::{XmlSecDocumentExt as _, XmlSecKey, XmlSecKeyFormat, XmlSecSignatureContext};
use yaserde::YaSerialize;

use crate::{
    config::IdpConfig,
    error::{SamlError, SamlResult},
    keys::{certificate_body, SigningCredentials},
    utils::{decode_xml_base64, saml_context, single_node, NS_ASSERTION, NS_PROTOCOL},
};

pub const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    RsaSha1,
    #[default]
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn uri(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    pub fn digest_uri(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }
}

#[derive(YaSerialize)]
pub(crate) struct Signature {
    #[yaserde(rename = "SignedInfo", prefix = "ds")]
    signed_info: SignedInfo,
    #[yaserde(rename = "SignatureValue", prefix = "ds")]
    signature_value: String,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
}

impl Signature {
    /// Unsigned template referencing the element with the given `ID`.
    /// The certificate is left empty for xmlsec to fill from the key.
    pub(crate) fn template(reference_id: &str, algorithm: SignatureAlgorithm) -> Self {
        Signature {
            signed_info: SignedInfo {
                canonicalization_method: AlgorithmRef::new(EXCLUSIVE_C14N),
                signature_method: AlgorithmRef::new(algorithm.uri()),
                reference: Reference {
                    uri: format!("#{reference_id}"),
                    transforms: Transforms {
                        transforms: vec![
                            AlgorithmRef::new(ENVELOPED_SIGNATURE),
                            AlgorithmRef::new(EXCLUSIVE_C14N),
                        ],
                    },
                    digest_method: AlgorithmRef::new(algorithm.digest_uri()),
                    digest_value: String::new(),
                },
            },
            signature_value: String::new(),
            key_info: KeyInfo::new(""),
        }
    }
}

#[derive(YaSerialize)]
struct SignedInfo {
    #[yaserde(rename = "CanonicalizationMethod", prefix = "ds")]
    canonicalization_method: AlgorithmRef,
    #[yaserde(rename = "SignatureMethod", prefix = "ds")]
    signature_method: AlgorithmRef,
    #[yaserde(rename = "Reference", prefix = "ds")]
    reference: Reference,
}

#[derive(YaSerialize)]
struct AlgorithmRef {
    #[yaserde(attribute = true, rename = "Algorithm")]
    algorithm: String,
}

impl AlgorithmRef {
    fn new(algorithm: &str) -> Self {
        AlgorithmRef {
            algorithm: algorithm.into(),
        }
    }
}

#[derive(YaSerialize)]
struct Reference {
    #[yaserde(attribute = true, rename = "URI")]
    uri: String,
    #[yaserde(rename = "Transforms", prefix = "ds")]
    transforms: Transforms,
    #[yaserde(rename = "DigestMethod", prefix = "ds")]
    digest_method: AlgorithmRef,
    #[yaserde(rename = "DigestValue", prefix = "ds")]
    digest_value: String,
}

#[derive(YaSerialize)]
struct Transforms {
    #[yaserde(rename = "Transform", prefix = "ds")]
    transforms: Vec<AlgorithmRef>,
}

#[derive(YaSerialize)]
pub(crate) struct KeyInfo {
    #[yaserde(rename = "X509Data", prefix = "ds")]
    x509_data: X509Data,
}

impl KeyInfo {
    pub(crate) fn new(certificate: &str) -> Self {
        KeyInfo {
            x509_data: X509Data {
                x509_certificate: certificate.into(),
            },
        }
    }
}

#[derive(YaSerialize)]
struct X509Data {
    #[yaserde(rename = "X509Certificate", prefix = "ds")]
    x509_certificate: String,
}

/// Base64 body of the IdP certificate. Inline data wins over a file.
pub fn load_certificate(config: &IdpConfig) -> SamlResult<String> {
    let pem = match (&config.certificate_data, &config.certificate_file) {
        (Some(data), _) => data.clone(),
        (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
            SamlError::CertificateNotFound(format!("{}: {e}", path.display()))
        })?,
        (None, None) => {
            return Err(SamlError::CertificateNotFound(
                "neither certificate_data nor certificate_file is set".into(),
            ))
        }
    };
    let body = certificate_body(&pem);
    if body.is_empty() {
        return Err(SamlError::CertificateNotFound("certificate is empty".into()));
    }
    Ok(body)
}

/// Decode a certificate body and make sure xmlsec can load it.
pub fn check_certificate(body: &str) -> SamlResult<Vec<u8>> {
    let der = decode_xml_base64(body)
        .map_err(|e| SamlError::Configuration(format!("certificate is not base64: {e}")))?;
    XmlSecKey::from_memory(&der, XmlSecKeyFormat::CertDer, None)
        .map_err(|e| SamlError::Configuration(format!("unusable certificate: {e:?}")))?;
    Ok(der)
}

/// Fill in the signature templates of a `samlp:Response`.
///
/// The assertion is signed before the response so that the response
/// signature covers the signed assertion. The result is checked against
/// the certificate, which catches a key that does not belong to it.
pub fn sign_response(xml: &str, credentials: &SigningCredentials) -> SamlResult<String> {
    let document = XmlParser::default()
        .parse_string(xml)
        .map_err(|e| SamlError::SigningFailure(format!("unparseable response: {e:?}")))?;
    let mut context = saml_context(&document)?;

    let response_template = first_node(&mut context, "/samlp:Response/ds:Signature");
    let assertion_template =
        first_node(&mut context, "/samlp:Response/saml:Assertion/ds:Signature");
    if response_template.is_none() && assertion_template.is_none() {
        return Ok(xml.to_string());
    }

    if assertion_template.is_some() {
        // xmlsec signs the first template in document order
        let mut hidden = response_template.clone();
        if let Some(node) = hidden.as_mut() {
            node.unlink_node();
        }
        register_id(&document, "/samlp:Response/saml:Assertion")?;
        sign_first(&document, credentials)?;
        if let Some(mut node) = hidden {
            let mut issuer = single_node(
                &context
                    .evaluate("/samlp:Response/saml:Issuer")
                    .map_err(|_| SamlError::SigningFailure("response has no Issuer".into()))?,
                "response Issuer",
            )?;
            issuer
                .add_next_sibling(&mut node)
                .map_err(|e| SamlError::SigningFailure(e.to_string()))?;
        }
    }

    if response_template.is_some() {
        register_id(&document, "/samlp:Response")?;
        sign_first(&document, credentials)?;
    }

    let signed = document.to_string_with_options(SaveOptions::default());
    match verify(&signed, credentials.certificate_der()) {
        Ok(true) => Ok(signed),
        _ => Err(SamlError::SigningFailure(
            "signature does not verify against the IdP certificate".into(),
        )),
    }
}

/// Verify every signature in a document against a DER certificate.
///
/// Signatures are checked outermost first. Returns `false` when any of
/// them fails or when the document carries none.
pub fn verify(xml: &str, certificate_der: &[u8]) -> SamlResult<bool> {
    let document = XmlParser::default()
        .parse_string(xml)
        .map_err(|e| SamlError::MalformedRequest(format!("unparseable document: {e:?}")))?;
    let mut context = saml_context(&document)?;

    for xpath in ["/samlp:Response", "//saml:Assertion"] {
        if first_node(&mut context, xpath).is_some() {
            register_id(&document, xpath)?;
        }
    }

    let mut verified = false;
    while let Some(mut signature) = first_node(&mut context, "//ds:Signature") {
        let key = XmlSecKey::from_memory(certificate_der, XmlSecKeyFormat::CertDer, None)
            .map_err(|e| SamlError::Configuration(format!("unusable certificate: {e:?}")))?;
        let mut sigctx = XmlSecSignatureContext::new();
        sigctx.insert_key(key);
        if !sigctx.verify_document(&document).unwrap_or(false) {
            return Ok(false);
        }
        verified = true;
        signature.unlink_node();
    }
    Ok(verified)
}

fn first_node(context: &mut Context, xpath: &str) -> Option<Node> {
    context
        .evaluate(xpath)
        .ok()
        .and_then(|object| object.get_nodes_as_vec().into_iter().next())
}

fn register_id(document: &Document, xpath: &str) -> SamlResult<()> {
    document
        .specify_idattr(
            xpath,
            "ID",
            Some(&[("samlp", NS_PROTOCOL), ("saml", NS_ASSERTION)]),
        )
        .map_err(|e| SamlError::SigningFailure(format!("cannot register ID on {xpath}: {e:?}")))
}

fn sign_first(document: &Document, credentials: &SigningCredentials) -> SamlResult<()> {
    let mut key = XmlSecKey::from_memory(credentials.private_key_pem()?, XmlSecKeyFormat::Pem, None)
        .map_err(|e| SamlError::SigningFailure(format!("failed to load private key: {e:?}")))?;
    key.load_cert_from_memory(credentials.certificate_der(), XmlSecKeyFormat::CertDer)
        .map_err(|e| SamlError::SigningFailure(format!("failed to attach certificate: {e:?}")))?;

    let mut sigctx = XmlSecSignatureContext::new();
    sigctx.insert_key(key);
    sigctx
        .sign_document(document)
        .map_err(|e| SamlError::SigningFailure(format!("{e:?}")))
}
