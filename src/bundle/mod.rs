//! Per-trust-domain key material and the set an identity source caches.

pub mod jwt;
pub mod x509;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::spiffe_id::TrustDomain;

/// Key material belonging to exactly one trust domain.
pub trait Bundle {
    /// The trust domain this material authenticates.
    fn trust_domain(&self) -> &TrustDomain;

    /// Encoded size of the key material, as counted by resource limits.
    fn material_len(&self) -> usize;
}

/// Lookup of a trust domain that has no bundle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no bundle found for trust domain: {0}")]
pub struct BundleNotFound(pub TrustDomain);

/// Bundles keyed by trust domain, at most one per domain.
///
/// A set is built once and then shared behind an [`Arc`]; updates replace the
/// whole set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSet<B> {
    bundles: BTreeMap<TrustDomain, Arc<B>>,
}

impl<B: Bundle> BundleSet<B> {
    /// An empty set.
    pub fn new() -> Self {
        Self {
            bundles: BTreeMap::new(),
        }
    }

    /// Inserts `bundle`, replacing any bundle for the same trust domain.
    pub fn insert(&mut self, bundle: B) {
        self.bundles
            .insert(bundle.trust_domain().clone(), Arc::new(bundle));
    }

    /// The bundle for `trust_domain`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleNotFound`] if the set holds nothing for that domain.
    pub fn bundle_for(&self, trust_domain: &TrustDomain) -> Result<Arc<B>, BundleNotFound> {
        self.get(trust_domain)
            .ok_or_else(|| BundleNotFound(trust_domain.clone()))
    }

    /// The bundle for `trust_domain`, if present.
    pub fn get(&self, trust_domain: &TrustDomain) -> Option<Arc<B>> {
        self.bundles.get(trust_domain).cloned()
    }

    /// Iterates bundles in trust domain order.
    pub fn iter(&self) -> impl Iterator<Item = (&TrustDomain, &Arc<B>)> {
        self.bundles.iter()
    }

    /// Number of trust domains in the set.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Whether the set holds no bundles.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

impl<B: Bundle> Default for BundleSet<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Bundle> FromIterator<B> for BundleSet<B> {
    fn from_iter<T: IntoIterator<Item = B>>(iter: T) -> Self {
        let mut set = Self::new();
        for bundle in iter {
            set.insert(bundle);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::x509::X509Bundle;
    use super::*;

    fn td(name: &str) -> TrustDomain {
        TrustDomain::new(name).unwrap()
    }

    #[test]
    fn absent_domain_is_an_error_not_an_empty_bundle() {
        let set: BundleSet<X509Bundle> = [X509Bundle::new(td("example.org"))]
            .into_iter()
            .collect();

        assert!(set.bundle_for(&td("example.org")).is_ok());
        assert_eq!(
            set.bundle_for(&td("other.org")).unwrap_err(),
            BundleNotFound(td("other.org"))
        );
    }

    #[test]
    fn one_bundle_per_domain() {
        let mut set = BundleSet::new();
        set.insert(X509Bundle::new(td("example.org")));
        set.insert(X509Bundle::new(td("example.org")));
        set.insert(X509Bundle::new(td("other.org")));

        assert_eq!(set.len(), 2);
        let domains: Vec<_> = set.iter().map(|(td, _)| td.as_str()).collect();
        assert_eq!(domains, ["example.org", "other.org"]);
    }
}
