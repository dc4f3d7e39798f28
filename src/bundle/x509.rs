//! X.509 bundles: the CA certificates a trust domain issues X.509-SVIDs from.

use crate::bundle::{Bundle, BundleSet};
use crate::cert::{split_der_certificates, Certificate, CertificateError};
use crate::spiffe_id::TrustDomain;

/// Failure to decode an X.509 bundle.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum X509BundleError {
    /// One of the concatenated certificates does not parse.
    #[error("invalid X.509 authority: {0}")]
    Certificate(#[from] CertificateError),
}

/// The X.509 authorities of one trust domain, in the order received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Bundle {
    trust_domain: TrustDomain,
    authorities: Vec<Certificate>,
}

impl X509Bundle {
    /// A bundle with no authorities.
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            authorities: Vec::new(),
        }
    }

    /// Decodes concatenated DER certificates.
    ///
    /// # Errors
    ///
    /// Fails if any certificate does not parse.
    pub fn parse_from_der(trust_domain: TrustDomain, der: &[u8]) -> Result<Self, X509BundleError> {
        Ok(Self {
            trust_domain,
            authorities: split_der_certificates(der, None)?,
        })
    }

    /// Appends an authority.
    pub fn add_authority(&mut self, authority: Certificate) {
        self.authorities.push(authority);
    }

    /// The authorities, in order.
    pub fn authorities(&self) -> &[Certificate] {
        &self.authorities
    }
}

impl Bundle for X509Bundle {
    fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    fn material_len(&self) -> usize {
        self.authorities.iter().map(|c| c.as_bytes().len()).sum()
    }
}

impl BundleSet<X509Bundle> {
    /// Decodes a trust-domain-name to DER map as sent by the Workload API.
    pub(crate) fn from_der_map<'a, I>(entries: I) -> Result<Self, crate::workload_api::ProtocolError>
    where
        I: IntoIterator<Item = (&'a String, &'a [u8])>,
    {
        let mut set = Self::new();
        for (name, der) in entries {
            let trust_domain = TrustDomain::new(name)?;
            set.insert(X509Bundle::parse_from_der(trust_domain, der)?);
        }
        Ok(set)
    }
}
