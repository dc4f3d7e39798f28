//! Key material for unit tests.

use base64ct::{Base64UrlUnpadded, Encoding as _};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePrivateKey as _;
use rand_core::OsRng;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose, SanType};
use serde_json::json;
use time::OffsetDateTime;

use crate::bundle::jwt::JwtBundle;
use crate::bundle::x509::X509Bundle;
use crate::spiffe_id::TrustDomain;

/// An ES256 signing key with its `kid`.
pub(crate) struct EcKey {
    kid: String,
    signing: SigningKey,
    encoding: EncodingKey,
}

impl EcKey {
    pub(crate) fn generate(kid: &str) -> Self {
        let signing = SigningKey::random(&mut OsRng);
        let der = signing.to_pkcs8_der().unwrap();
        Self {
            kid: kid.to_owned(),
            encoding: EncodingKey::from_ec_der(der.as_bytes()),
            signing,
        }
    }

    pub(crate) fn jwk(&self) -> serde_json::Value {
        let point = self.signing.verifying_key().to_encoded_point(false);
        json!({
            "kty": "EC",
            "crv": "P-256",
            "x": Base64UrlUnpadded::encode_string(point.x().unwrap()),
            "y": Base64UrlUnpadded::encode_string(point.y().unwrap()),
            "kid": self.kid,
            "alg": "ES256",
            "use": "sig",
        })
    }

    pub(crate) fn bundle(&self, trust_domain: &str) -> JwtBundle {
        let jwks = json!({ "keys": [self.jwk()] }).to_string();
        JwtBundle::from_jwks(TrustDomain::new(trust_domain).unwrap(), jwks.as_bytes()).unwrap()
    }

    /// Signs a JWT-SVID expiring `exp_offset` seconds from now.
    pub(crate) fn sign_jwt(&self, sub: &str, aud: &[&str], exp_offset: i64) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        header.typ = Some("JWT".to_owned());
        let claims = json!({
            "sub": sub,
            "aud": aud,
            "exp": OffsetDateTime::now_utc().unix_timestamp() + exp_offset,
        });
        jsonwebtoken::encode(&header, &claims, &self.encoding).unwrap()
    }
}

/// A self-signed CA that issues X.509-SVIDs.
pub(crate) struct TestCa {
    trust_domain: TrustDomain,
    key: KeyPair,
    cert: rcgen::Certificate,
}

impl TestCa {
    pub(crate) fn new(trust_domain: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let id = format!("spiffe://{trust_domain}");
        params.subject_alt_names = vec![SanType::URI(id.as_str().try_into().unwrap())];
        let cert = params.self_signed(&key).unwrap();
        Self {
            trust_domain: TrustDomain::new(trust_domain).unwrap(),
            key,
            cert,
        }
    }

    pub(crate) fn bundle(&self) -> X509Bundle {
        X509Bundle::parse_from_der(self.trust_domain.clone(), self.cert.der()).unwrap()
    }

    /// Issues a leaf for `spiffe_id`; returns (chain DER, PKCS#8 key DER).
    pub(crate) fn issue(&self, spiffe_id: &str) -> (Vec<u8>, Vec<u8>) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.subject_alt_names = vec![SanType::URI(spiffe_id.try_into().unwrap())];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (cert.der().to_vec(), key.serialize_der())
    }
}
