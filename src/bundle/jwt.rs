//! JWT bundles: the JWKS a trust domain signs JWT-SVIDs with.

use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::jwk::Jwk;
use serde_json::Value;

use crate::bundle::{Bundle, BundleSet};
use crate::spiffe_id::TrustDomain;

/// Failure to decode a JWKS document.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum JwtBundleError {
    /// A key without a `kid`.
    #[error("missing key ID")]
    MissingKeyId,

    /// The document has no `keys` array.
    #[error("jwks must contain a 'keys' array")]
    MissingKeys,

    /// Malformed JSON, or a key the JWK decoder does not understand.
    #[error("cannot deserialize json jwk set")]
    Deserialize(#[from] serde_json::Error),
}

/// One JWT signing key, identified by its `kid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtAuthority {
    key_id: String,
    jwk_json: Vec<u8>,
}

impl JwtAuthority {
    /// Parses a single JWK. The key must carry a `kid`.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON or a missing `kid`.
    pub fn from_jwk_json(jwk_json: &[u8]) -> Result<Self, JwtBundleError> {
        let value: Value = serde_json::from_slice(jwk_json)?;
        Self::from_value(&value)
    }

    fn from_value(value: &Value) -> Result<Self, JwtBundleError> {
        let key_id = value
            .get("kid")
            .and_then(Value::as_str)
            .ok_or(JwtBundleError::MissingKeyId)?
            .to_owned();
        Ok(Self {
            key_id,
            jwk_json: serde_json::to_vec(value)?,
        })
    }

    /// The `kid` header value that selects this key.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The key as normalized JSON.
    pub fn jwk_json(&self) -> &[u8] {
        &self.jwk_json
    }

    /// The key decoded for signature verification.
    ///
    /// # Errors
    ///
    /// Fails if the JWK uses a key type `jsonwebtoken` cannot represent.
    pub fn jwk(&self) -> Result<Jwk, JwtBundleError> {
        Ok(serde_json::from_slice(&self.jwk_json)?)
    }
}

/// The JWT signing keys of one trust domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtBundle {
    trust_domain: TrustDomain,
    authorities: HashMap<String, Arc<JwtAuthority>>,
}

impl JwtBundle {
    /// A bundle with no keys.
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            authorities: HashMap::new(),
        }
    }

    /// Decodes a JWKS document (`{"keys": [...]}`) for `trust_domain`.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON, a missing `keys` array, or a key without `kid`.
    ///
    /// # Examples
    ///
    /// ```
    /// use spiffe_source::bundle::jwt::JwtBundle;
    /// use spiffe_source::TrustDomain;
    ///
    /// let jwks = br#"{"keys":[{"kty":"oct","kid":"k1","k":"c2VjcmV0"}]}"#;
    /// let td = TrustDomain::new("example.org").unwrap();
    /// let bundle = JwtBundle::from_jwks(td, jwks).unwrap();
    /// assert!(bundle.find_authority("k1").is_some());
    /// ```
    pub fn from_jwks(trust_domain: TrustDomain, jwks: &[u8]) -> Result<Self, JwtBundleError> {
        let document: Value = serde_json::from_slice(jwks)?;
        let keys = document
            .get("keys")
            .and_then(Value::as_array)
            .ok_or(JwtBundleError::MissingKeys)?;

        let mut bundle = Self::new(trust_domain);
        for key in keys {
            bundle.add_authority(JwtAuthority::from_value(key)?);
        }
        Ok(bundle)
    }

    /// Adds or replaces the key with the same `kid`.
    pub fn add_authority(&mut self, authority: JwtAuthority) {
        self.authorities
            .insert(authority.key_id.clone(), Arc::new(authority));
    }

    /// The key with the given `kid`.
    pub fn find_authority(&self, key_id: &str) -> Option<&Arc<JwtAuthority>> {
        self.authorities.get(key_id)
    }

    /// All keys, in no particular order.
    pub fn authorities(&self) -> impl Iterator<Item = &Arc<JwtAuthority>> {
        self.authorities.values()
    }
}

impl Bundle for JwtBundle {
    fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    fn material_len(&self) -> usize {
        self.authorities.values().map(|a| a.jwk_json.len()).sum()
    }
}

impl BundleSet<JwtBundle> {
    /// Decodes a trust-domain-name to JWKS map as sent by the Workload API.
    pub(crate) fn from_jwks_map<'a, I>(entries: I) -> Result<Self, crate::workload_api::ProtocolError>
    where
        I: IntoIterator<Item = (&'a String, &'a [u8])>,
    {
        let mut set = Self::new();
        for (name, jwks) in entries {
            let trust_domain = TrustDomain::new(name)?;
            set.insert(JwtBundle::from_jwks(trust_domain, jwks)?);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn td() -> TrustDomain {
        TrustDomain::new("example.org").unwrap()
    }

    #[test]
    fn keys_are_indexed_by_kid() {
        let jwks = br#"{"keys":[
            {"kty":"EC","crv":"P-256","kid":"a","x":"AA","y":"AA"},
            {"kty":"EC","crv":"P-256","kid":"b","x":"AA","y":"AA"}
        ]}"#;
        let bundle = JwtBundle::from_jwks(td(), jwks).unwrap();

        assert_eq!(bundle.authorities().count(), 2);
        assert_eq!(bundle.find_authority("b").unwrap().key_id(), "b");
        assert!(bundle.find_authority("c").is_none());
        assert!(bundle.material_len() > 0);
    }

    #[test]
    fn key_without_kid_is_rejected() {
        let jwks = br#"{"keys":[{"kty":"EC","crv":"P-256","x":"AA","y":"AA"}]}"#;
        assert!(matches!(
            JwtBundle::from_jwks(td(), jwks),
            Err(JwtBundleError::MissingKeyId)
        ));
    }

    #[test]
    fn document_without_keys_is_rejected() {
        assert!(matches!(
            JwtBundle::from_jwks(td(), br#"{"other":[]}"#),
            Err(JwtBundleError::MissingKeys)
        ));
        assert!(matches!(
            JwtBundle::from_jwks(td(), b"{"),
            Err(JwtBundleError::Deserialize(_))
        ));
    }

    #[test]
    fn empty_key_list_is_a_valid_bundle() {
        let bundle = JwtBundle::from_jwks(td(), br#"{"keys":[]}"#).unwrap();
        assert_eq!(bundle.authorities().count(), 0);
    }
}
