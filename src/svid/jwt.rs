//! JWT-SVIDs.
//!
//! Tokens handed out by the Workload API are parsed without verification;
//! [`crate::validator::validate`] performs the signature and claim checks
//! against a bundle set.

use std::fmt;
use std::str::FromStr;

use base64ct::{Base64UrlUnpadded, Encoding as _};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{de, Deserialize, Deserializer};
use time::OffsetDateTime;
use zeroize::Zeroize;

use crate::bundle::jwt::JwtBundle;
use crate::spiffe_id::{SpiffeId, SpiffeIdError};
use crate::svid::Document;
use crate::validator::SignatureError;

const MAX_AUDIENCE_ENTRIES: usize = 32;
const MAX_SEGMENT_LEN: usize = 64 * 1024;

/// Signature algorithms allowed by the JWT-SVID profile.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum JwtAlg {
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    PS256,
    PS384,
    PS512,
}

impl FromStr for JwtAlg {
    type Err = JwtSvidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "RS256" => Self::RS256,
            "RS384" => Self::RS384,
            "RS512" => Self::RS512,
            "ES256" => Self::ES256,
            "ES384" => Self::ES384,
            "PS256" => Self::PS256,
            "PS384" => Self::PS384,
            "PS512" => Self::PS512,
            _ => return Err(JwtSvidError::UnsupportedAlgorithm),
        })
    }
}

impl From<JwtAlg> for jsonwebtoken::Algorithm {
    fn from(alg: JwtAlg) -> Self {
        match alg {
            JwtAlg::RS256 => Self::RS256,
            JwtAlg::RS384 => Self::RS384,
            JwtAlg::RS512 => Self::RS512,
            JwtAlg::ES256 => Self::ES256,
            JwtAlg::ES384 => Self::ES384,
            JwtAlg::PS256 => Self::PS256,
            JwtAlg::PS384 => Self::PS384,
            JwtAlg::PS512 => Self::PS512,
        }
    }
}

/// Failure to parse a JWT-SVID.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum JwtSvidError {
    /// Not three dot-separated parts.
    #[error("malformed jwt token: expected 3 dot-separated parts")]
    InvalidJwtFormat,

    /// A part is not base64url, or is oversized.
    #[error("malformed jwt token: invalid base64url encoding")]
    InvalidBase64,

    /// Header or claims are not the expected JSON.
    #[error("malformed jwt token: invalid json")]
    InvalidJson(#[source] serde_json::Error),

    /// `typ` present but neither `JWT` nor `JOSE`.
    #[error("token header 'typ' should be 'JWT' or 'JOSE'")]
    InvalidTyp,

    /// `alg` outside the JWT-SVID profile.
    #[error("algorithm in 'alg' header is not supported")]
    UnsupportedAlgorithm,

    /// No `kid` header.
    #[error("token header 'kid' not found")]
    MissingKeyId,

    /// `sub` is not a SPIFFE ID.
    #[error("invalid spiffe_id in token 'sub' claim")]
    InvalidSubject(#[from] SpiffeIdError),

    /// `exp` is out of range.
    #[error("invalid token expiration ('exp') claim")]
    InvalidExpiration,
}

#[derive(Clone, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
struct Token(String);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

#[derive(Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    typ: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
struct Claims {
    sub: String,
    #[serde(deserialize_with = "audience")]
    aud: Vec<String>,
    exp: i64,
}

/// A JWT-SVID: a signed token asserting a SPIFFE ID to a set of audiences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtSvid {
    spiffe_id: SpiffeId,
    audience: Vec<String>,
    expiry: OffsetDateTime,
    key_id: String,
    alg: JwtAlg,
    hint: Option<String>,
    token: Token,
}

impl JwtSvid {
    /// Parses a token without verifying its signature.
    ///
    /// # Errors
    ///
    /// Returns a [`JwtSvidError`] if the token is not a well-formed JWT-SVID.
    pub fn parse_insecure(token: &str) -> Result<Self, JwtSvidError> {
        let mut parts = token.split('.');
        let (Some(header), Some(claims), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(JwtSvidError::InvalidJwtFormat);
        };

        let header: Header =
            serde_json::from_slice(&decode_segment(header)?).map_err(JwtSvidError::InvalidJson)?;
        let claims: Claims =
            serde_json::from_slice(&decode_segment(claims)?).map_err(JwtSvidError::InvalidJson)?;

        if !matches!(header.typ.as_deref(), None | Some("JWT" | "JOSE")) {
            return Err(JwtSvidError::InvalidTyp);
        }
        let alg = header.alg.parse()?;
        let key_id = header.kid.ok_or(JwtSvidError::MissingKeyId)?;
        let spiffe_id = SpiffeId::new(&claims.sub)?;
        let expiry = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| JwtSvidError::InvalidExpiration)?;

        Ok(Self {
            spiffe_id,
            audience: claims.aud,
            expiry,
            key_id,
            alg,
            hint: None,
            token: Token(token.to_owned()),
        })
    }

    pub(crate) fn with_hint(mut self, hint: String) -> Self {
        self.hint = (!hint.is_empty()).then_some(hint);
        self
    }

    /// The compact serialized token.
    pub fn token(&self) -> &str {
        &self.token.0
    }

    /// The `sub` claim.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// The `aud` claim, in issue order.
    pub fn audience(&self) -> &[String] {
        &self.audience
    }

    /// The `exp` claim.
    pub fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }

    /// The `kid` header.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The `alg` header.
    pub fn alg(&self) -> JwtAlg {
        self.alg
    }

    /// Operator-provided hint attached by the Workload API, if any.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

impl FromStr for JwtSvid {
    type Err = JwtSvidError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::parse_insecure(token)
    }
}

impl Document for JwtSvid {
    type Bundle = JwtBundle;

    fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }

    fn audience(&self) -> &[String] {
        &self.audience
    }

    fn verify_signature(&self, bundle: &JwtBundle) -> Result<(), SignatureError> {
        let authority = bundle
            .find_authority(&self.key_id)
            .ok_or_else(|| SignatureError::AuthorityNotFound(self.key_id.clone()))?;
        let jwk = authority
            .jwk()
            .map_err(|e| SignatureError::InvalidAuthority(e.to_string()))?;
        let key = DecodingKey::from_jwk(&jwk)?;

        // Expiry and audience are checked by the validator in a fixed order.
        let mut validation = Validation::new(self.alg.into());
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        jsonwebtoken::decode::<serde_json::Value>(self.token(), &key, &validation)?;
        Ok(())
    }
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, JwtSvidError> {
    if segment.len() > MAX_SEGMENT_LEN * 4 / 3 {
        return Err(JwtSvidError::InvalidBase64);
    }
    Base64UrlUnpadded::decode_vec(segment).map_err(|_| JwtSvidError::InvalidBase64)
}

// `aud` may be a single string or an array; arrays are capped.
fn audience<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct AudienceVisitor;

    impl<'de> de::Visitor<'de> for AudienceVisitor {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("string or sequence of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![v.to_owned()])
        }

        fn visit_seq<S: de::SeqAccess<'de>>(self, mut seq: S) -> Result<Self::Value, S::Error> {
            let mut entries = Vec::new();
            while let Some(entry) = seq.next_element::<String>()? {
                if entries.len() == MAX_AUDIENCE_ENTRIES {
                    return Err(de::Error::custom(format!(
                        "JWT `aud` claim has too many entries (max {MAX_AUDIENCE_ENTRIES})"
                    )));
                }
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_any(AudienceVisitor)
}
