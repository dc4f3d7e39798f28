use x509_parser::error::X509Error;

use crate::spiffe_id::SpiffeIdError;

/// Failure to parse or inspect a DER-encoded X.509 certificate.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum CertificateError {
    /// The bytes are not a DER X.509 certificate.
    #[error("failed parsing X.509 certificate")]
    Parse(#[from] X509Error),

    /// More certificates than a chain may carry.
    #[error("certificate chain is too long (max {max})")]
    TooManyCertificates {
        /// Upper bound on chain length.
        max: usize,
    },

    /// No URI SAN holds a SPIFFE ID.
    #[error("certificate is missing SPIFFE ID in URI SAN")]
    MissingSpiffeId,

    /// More than one URI SAN holds a SPIFFE ID.
    #[error("certificate contains multiple SPIFFE IDs in URI SAN")]
    MultipleSpiffeIds,

    /// More URI SAN entries than will be inspected.
    #[error("certificate has too many URI SAN entries (max {max})")]
    TooManyUriSanEntries {
        /// Upper bound on inspected URI SAN entries.
        max: usize,
    },

    /// A `spiffe://` URI SAN that does not parse.
    #[error("failed to parse SPIFFE ID from URI SAN: {0}")]
    InvalidSpiffeId(#[from] SpiffeIdError),
}

/// Failure to decode a PKCS#8 private key.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum PrivateKeyError {
    /// Error returned by the PKCS#8 decoder.
    #[error("failed decoding PKCS#8 private key")]
    DecodePkcs8(pkcs8::Error),
}
