//! Stateless document validation against a bundle set snapshot.

use time::OffsetDateTime;

use crate::bundle::BundleSet;
use crate::cert::CertificateError;
use crate::spiffe_id::TrustDomain;
use crate::svid::Document;

/// Why a document's signature could not be verified.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SignatureError {
    /// The bundle has no key with the token's `kid`.
    #[error("cannot find JWT authority for key_id: {0}")]
    AuthorityNotFound(String),

    /// The matching bundle key cannot be used for verification.
    #[error("unusable JWT authority: {0}")]
    InvalidAuthority(String),

    /// The JWT signature does not verify.
    #[error("invalid token signature")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// A certificate in the chain is not signed by the next one.
    #[error("certificate chain is not correctly signed")]
    BrokenChain,

    /// No bundle authority signed the top of the chain.
    #[error("certificate chain does not lead to a bundle authority")]
    UntrustedChain,

    /// A certificate in the chain or the bundle no longer parses.
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// The first check a document failed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Rejection {
    /// The document expired at the given instant.
    #[error("document expired at {0}")]
    Expired(OffsetDateTime),

    /// No bundle for the issuing trust domain.
    #[error("no bundle found for trust domain: {0}")]
    BundleNotFound(TrustDomain),

    /// No key of the issuing trust domain verifies the signature.
    #[error("signature verification failed: {0}")]
    Signature(#[from] SignatureError),

    /// An expected audience entry is absent from the document.
    #[error("expected audience {expected:?} not in {actual:?}")]
    AudienceMismatch {
        /// The first expected entry that was not found.
        expected: String,
        /// The document's audience.
        actual: Vec<String>,
    },
}

/// Validates `document` against `bundles`.
///
/// Checks run in a fixed order and the first failure is reported: expiry,
/// bundle presence for the issuing trust domain, signature, then audience.
/// Every entry of `expected_audience` must appear in the document's audience;
/// documents without an audience therefore only pass an empty expectation.
///
/// # Errors
///
/// Returns the [`Rejection`] for the first failed check.
pub fn validate<D, A>(
    document: &D,
    bundles: &BundleSet<D::Bundle>,
    expected_audience: &[A],
) -> Result<(), Rejection>
where
    D: Document,
    A: AsRef<str>,
{
    let expiry = document.expiry();
    if expiry <= OffsetDateTime::now_utc() {
        return Err(Rejection::Expired(expiry));
    }

    let trust_domain = document.spiffe_id().trust_domain();
    let bundle = bundles
        .get(trust_domain)
        .ok_or_else(|| Rejection::BundleNotFound(trust_domain.clone()))?;

    document.verify_signature(&bundle)?;

    let actual = document.audience();
    if let Some(missing) = expected_audience
        .iter()
        .map(AsRef::as_ref)
        .find(|expected| !actual.iter().any(|a| a == expected))
    {
        return Err(Rejection::AudienceMismatch {
            expected: missing.to_owned(),
            actual: actual.to_vec(),
        });
    }

    Ok(())
}
