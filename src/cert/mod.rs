//! DER certificate and PKCS#8 key wrappers shared by X.509 bundles and SVIDs.
//!
//! Both types are validated when constructed, so holders never see bytes that
//! fail to parse.

mod error;

pub use error::{CertificateError, PrivateKeyError};

use std::fmt;

use pkcs8::PrivateKeyInfo;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::extensions::GeneralName;
use zeroize::Zeroize;

use crate::spiffe_id::SpiffeId;

const MAX_URI_SAN_ENTRIES: usize = 32;
const MAX_URI_LENGTH: usize = 2048;
pub(crate) const MAX_CHAIN_LENGTH: usize = 16;

/// One DER-encoded X.509 certificate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    /// The DER bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn parsed(&self) -> Result<X509Certificate<'_>, CertificateError> {
        parse_x509(&self.0)
    }

    /// The SPIFFE ID carried in the certificate's single SPIFFE URI SAN.
    ///
    /// # Errors
    ///
    /// Fails if the certificate carries no SPIFFE URI SAN, more than one,
    /// or one that does not parse.
    pub fn spiffe_id(&self) -> Result<SpiffeId, CertificateError> {
        single_spiffe_id(&self.parsed()?)
    }

    /// The end of the validity window (`notAfter`).
    ///
    /// # Errors
    ///
    /// Fails if the certificate no longer parses.
    pub fn not_after(&self) -> Result<OffsetDateTime, CertificateError> {
        Ok(self.parsed()?.validity().not_after.to_datetime())
    }

    /// Whether `issuer`'s public key verifies this certificate's signature.
    pub(crate) fn is_signed_by(&self, issuer: &Certificate) -> Result<bool, CertificateError> {
        let subject = self.parsed()?;
        let issuer = issuer.parsed()?;
        Ok(subject.verify_signature(Some(issuer.public_key())).is_ok())
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Certificate {
    type Error = CertificateError;

    fn try_from(der: &[u8]) -> Result<Self, Self::Error> {
        Self::try_from(der.to_vec())
    }
}

impl TryFrom<Vec<u8>> for Certificate {
    type Error = CertificateError;

    fn try_from(der: Vec<u8>) -> Result<Self, Self::Error> {
        parse_x509(&der)?;
        Ok(Self(der))
    }
}

/// A PKCS#8 DER private key. Zeroized on drop and never printed.
#[derive(Clone, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    /// The DER bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = PrivateKeyError;

    fn try_from(der: &[u8]) -> Result<Self, Self::Error> {
        PrivateKeyInfo::try_from(der).map_err(PrivateKeyError::DecodePkcs8)?;
        Ok(Self(der.to_vec()))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("len", &self.0.len())
            .finish()
    }
}

pub(crate) fn parse_x509(der: &[u8]) -> Result<X509Certificate<'_>, CertificateError> {
    use x509_parser::nom::Err;

    match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => Ok(cert),
        Err(Err::Incomplete(_)) => Err(X509Error::InvalidCertificate.into()),
        Err(Err::Error(e) | Err::Failure(e)) => Err(e.into()),
    }
}

/// Splits concatenated DER certificates.
///
/// `max` bounds chains; bundles pass `None` and rely on resource limits.
pub(crate) fn split_der_certificates(
    mut der: &[u8],
    max: Option<usize>,
) -> Result<Vec<Certificate>, CertificateError> {
    use x509_parser::nom::Err;

    let mut certs = Vec::new();
    while !der.is_empty() {
        if let Some(max) = max {
            if certs.len() >= max {
                return Err(CertificateError::TooManyCertificates { max });
            }
        }
        let rest = match x509_parser::parse_x509_certificate(der) {
            Ok((rest, _)) => rest,
            Err(Err::Incomplete(_)) => return Err(X509Error::InvalidCertificate.into()),
            Err(Err::Error(e) | Err::Failure(e)) => return Err(e.into()),
        };
        let (one, _) = der.split_at(der.len() - rest.len());
        certs.push(Certificate(one.to_vec()));
        der = rest;
    }
    Ok(certs)
}

pub(crate) fn single_spiffe_id(cert: &X509Certificate<'_>) -> Result<SpiffeId, CertificateError> {
    let Some(san) = cert.subject_alternative_name()? else {
        return Err(CertificateError::MissingSpiffeId);
    };

    let mut uris = 0usize;
    let mut found = None;
    for name in &san.value.general_names {
        let GeneralName::URI(uri) = name else {
            continue;
        };
        uris += 1;
        if uris > MAX_URI_SAN_ENTRIES {
            return Err(CertificateError::TooManyUriSanEntries {
                max: MAX_URI_SAN_ENTRIES,
            });
        }
        if uri.len() > MAX_URI_LENGTH || !uri.starts_with("spiffe://") {
            continue;
        }
        if found.replace(SpiffeId::new(uri)?).is_some() {
            return Err(CertificateError::MultipleSpiffeIds);
        }
    }
    found.ok_or(CertificateError::MissingSpiffeId)
}
