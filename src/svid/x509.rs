//! X.509-SVIDs.

use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;

use crate::bundle::x509::X509Bundle;
use crate::cert::{
    parse_x509, single_spiffe_id, split_der_certificates, Certificate, CertificateError,
    PrivateKey, PrivateKeyError, MAX_CHAIN_LENGTH,
};
use crate::spiffe_id::SpiffeId;
use crate::svid::Document;
use crate::validator::SignatureError;

/// Failure to parse or validate an X.509-SVID.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum X509SvidError {
    /// The chain holds no certificates.
    #[error("no certificates found in chain")]
    EmptyChain,

    /// The leaf is a CA.
    #[error("leaf certificate must not have CA flag set to true")]
    LeafCertificateHasCaFlag,

    /// The leaf may sign certificates or CRLs.
    #[error("leaf certificate must not have 'keyCertSign' or 'cRLSign' set as key usage")]
    LeafCertificateCanSign,

    /// The leaf lacks `digitalSignature`.
    #[error("leaf certificate must have 'digitalSignature' set as key usage")]
    LeafCertificateMissingDigitalSignature,

    /// An intermediate is not a CA.
    #[error("signing certificate must have CA flag set to true")]
    SigningCertificateMissingCaFlag,

    /// A certificate lacks a required extension.
    #[error("certificate is missing the {0} extension")]
    MissingExtension(&'static str),

    /// Certificate parsing failure.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// Private key decoding failure.
    #[error(transparent)]
    PrivateKey(#[from] PrivateKeyError),
}

/// An X.509-SVID: a certificate chain, leaf first, and the leaf's private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Svid {
    spiffe_id: SpiffeId,
    leaf: Certificate,
    cert_chain: Vec<Certificate>,
    private_key: PrivateKey,
    expiry: OffsetDateTime,
    hint: Option<String>,
}

impl X509Svid {
    /// Parses a concatenated DER chain and a PKCS#8 DER key.
    ///
    /// The leaf must be a non-CA certificate with `digitalSignature` and a
    /// single SPIFFE URI SAN; every further certificate must be a CA.
    ///
    /// # Errors
    ///
    /// Returns an [`X509SvidError`] naming the first violated constraint.
    pub fn parse_from_der(chain_der: &[u8], key_der: &[u8]) -> Result<Self, X509SvidError> {
        let cert_chain = split_der_certificates(chain_der, Some(MAX_CHAIN_LENGTH))?;
        let (leaf, intermediates) = cert_chain.split_first().ok_or(X509SvidError::EmptyChain)?;

        let parsed_leaf = parse_x509(leaf.as_bytes())?;
        check_leaf(&parsed_leaf)?;
        let spiffe_id = single_spiffe_id(&parsed_leaf)?;
        let expiry = parsed_leaf.validity().not_after.to_datetime();

        for cert in intermediates {
            check_signing(&parse_x509(cert.as_bytes())?)?;
        }

        let private_key = PrivateKey::try_from(key_der)?;
        let leaf = leaf.clone();

        Ok(Self {
            spiffe_id,
            leaf,
            cert_chain,
            private_key,
            expiry,
            hint: None,
        })
    }

    pub(crate) fn with_hint(mut self, hint: String) -> Self {
        self.hint = (!hint.is_empty()).then_some(hint);
        self
    }

    /// The identity in the leaf's URI SAN.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// The chain, leaf first.
    pub fn cert_chain(&self) -> &[Certificate] {
        &self.cert_chain
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> &Certificate {
        &self.leaf
    }

    /// The leaf's private key.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// The leaf's `notAfter`.
    pub fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }

    /// Operator-provided hint attached by the Workload API, if any.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

fn check_leaf(cert: &X509Certificate<'_>) -> Result<(), X509SvidError> {
    let constraints = cert
        .basic_constraints()
        .map_err(CertificateError::from)?
        .ok_or(X509SvidError::MissingExtension("BasicConstraints"))?;
    if constraints.value.ca {
        return Err(X509SvidError::LeafCertificateHasCaFlag);
    }

    let usage = cert
        .key_usage()
        .map_err(CertificateError::from)?
        .ok_or(X509SvidError::MissingExtension("KeyUsage"))?;
    if !usage.value.digital_signature() {
        return Err(X509SvidError::LeafCertificateMissingDigitalSignature);
    }
    if usage.value.key_cert_sign() || usage.value.crl_sign() {
        return Err(X509SvidError::LeafCertificateCanSign);
    }
    Ok(())
}

fn check_signing(cert: &X509Certificate<'_>) -> Result<(), X509SvidError> {
    match cert.basic_constraints().map_err(CertificateError::from)? {
        Some(constraints) if constraints.value.ca => Ok(()),
        _ => Err(X509SvidError::SigningCertificateMissingCaFlag),
    }
}

impl Document for X509Svid {
    type Bundle = X509Bundle;

    fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }

    fn audience(&self) -> &[String] {
        &[]
    }

    /// Walks the chain leaf-first, then requires the last certificate to be
    /// signed by one of the bundle's authorities.
    fn verify_signature(&self, bundle: &X509Bundle) -> Result<(), SignatureError> {
        for pair in self.cert_chain.windows(2) {
            if !pair[0].is_signed_by(&pair[1])? {
                return Err(SignatureError::BrokenChain);
            }
        }

        let top = self.cert_chain.last().ok_or(SignatureError::BrokenChain)?;
        for authority in bundle.authorities() {
            if top.is_signed_by(authority)? {
                return Ok(());
            }
        }
        Err(SignatureError::UntrustedChain)
    }
}
