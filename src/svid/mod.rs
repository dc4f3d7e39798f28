//! Signed identity documents: JWT-SVIDs and X.509-SVIDs.

pub mod jwt;
pub mod x509;

use time::OffsetDateTime;

use crate::bundle::Bundle;
use crate::spiffe_id::SpiffeId;
use crate::validator::SignatureError;

/// What the validator needs to know about a signed identity document.
pub trait Document {
    /// The kind of bundle whose keys sign this document.
    type Bundle: Bundle;

    /// The identity the document asserts.
    fn spiffe_id(&self) -> &SpiffeId;

    /// The instant after which the document must be rejected.
    fn expiry(&self) -> OffsetDateTime;

    /// Audience entries as issued. Empty for documents without an audience.
    fn audience(&self) -> &[String];

    /// Checks the document's signature against the keys of `bundle`.
    ///
    /// # Errors
    ///
    /// Returns a [`SignatureError`] if no key in `bundle` verifies the
    /// document.
    fn verify_signature(&self, bundle: &Self::Bundle) -> Result<(), SignatureError>;
}
