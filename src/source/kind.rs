use std::fmt;
use std::future::Future;

use crate::bundle::jwt::JwtBundle;
use crate::bundle::x509::X509Bundle;
use crate::bundle::{Bundle, BundleSet};
use crate::spiffe_id::SpiffeId;
use crate::svid::jwt::JwtSvid;
use crate::svid::x509::X509Svid;
use crate::svid::Document;
use crate::workload_api::{BundleStream, WorkloadApiClient, WorkloadApiError};

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::Jwt {}
    impl Sealed for super::X509 {}
}

/// A family of SPIFFE documents and the bundles that verify them.
///
/// Selects what an [`IdentitySource`](super::IdentitySource) watches and
/// fetches. Implemented by [`Jwt`] and [`X509`]; sealed.
pub trait DocumentKind: sealed::Sealed + Send + Sync + 'static {
    /// Trust material for this kind.
    type Bundle: Bundle + fmt::Debug + PartialEq + Send + Sync + 'static;

    /// The identity document this kind fetches.
    type Document: Document<Bundle = Self::Bundle> + Send + Sync;

    /// Parameters of a one-shot document fetch.
    type Request: Send + Sync;

    /// Names the bundle half in errors, e.g. `"JWT bundle"`.
    const BUNDLE_LABEL: &'static str;

    /// Names the document half in errors, e.g. `"JWT SVID"`.
    const DOCUMENT_LABEL: &'static str;

    /// Fetches the current bundle set once.
    fn fetch_bundles(
        client: &WorkloadApiClient,
    ) -> impl Future<Output = Result<BundleSet<Self::Bundle>, WorkloadApiError>> + Send;

    /// Opens the bundle update stream.
    fn stream_bundles(
        client: &WorkloadApiClient,
    ) -> impl Future<Output = Result<BundleStream<Self::Bundle>, WorkloadApiError>> + Send;

    /// Fetches one document from the provider.
    fn fetch_document(
        client: &WorkloadApiClient,
        request: &Self::Request,
    ) -> impl Future<Output = Result<Self::Document, WorkloadApiError>> + Send;
}

/// JWT-SVIDs verified by JWT bundles.
#[derive(Debug, Clone, Copy)]
pub enum Jwt {}

/// X.509-SVIDs verified by X.509 bundles.
#[derive(Debug, Clone, Copy)]
pub enum X509 {}

/// Parameters of a JWT-SVID fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtSvidRequest {
    /// Identity to fetch for; `None` lets the provider pick the default.
    pub spiffe_id: Option<SpiffeId>,
    /// Requested audience, in order.
    pub audience: Vec<String>,
}

impl DocumentKind for Jwt {
    type Bundle = JwtBundle;
    type Document = JwtSvid;
    type Request = JwtSvidRequest;

    const BUNDLE_LABEL: &'static str = "JWT bundle";
    const DOCUMENT_LABEL: &'static str = "JWT SVID";

    async fn fetch_bundles(
        client: &WorkloadApiClient,
    ) -> Result<BundleSet<JwtBundle>, WorkloadApiError> {
        client.fetch_jwt_bundles().await
    }

    async fn stream_bundles(
        client: &WorkloadApiClient,
    ) -> Result<BundleStream<JwtBundle>, WorkloadApiError> {
        client.stream_jwt_bundles().await
    }

    async fn fetch_document(
        client: &WorkloadApiClient,
        request: &JwtSvidRequest,
    ) -> Result<JwtSvid, WorkloadApiError> {
        client
            .fetch_jwt_svid(&request.audience, request.spiffe_id.as_ref())
            .await
    }
}

impl DocumentKind for X509 {
    type Bundle = X509Bundle;
    type Document = X509Svid;
    type Request = Option<SpiffeId>;

    const BUNDLE_LABEL: &'static str = "X.509 bundle";
    const DOCUMENT_LABEL: &'static str = "X.509 SVID";

    async fn fetch_bundles(
        client: &WorkloadApiClient,
    ) -> Result<BundleSet<X509Bundle>, WorkloadApiError> {
        client.fetch_x509_bundles().await
    }

    async fn stream_bundles(
        client: &WorkloadApiClient,
    ) -> Result<BundleStream<X509Bundle>, WorkloadApiError> {
        client.stream_x509_bundles().await
    }

    async fn fetch_document(
        client: &WorkloadApiClient,
        request: &Option<SpiffeId>,
    ) -> Result<X509Svid, WorkloadApiError> {
        client.fetch_x509_svid(request.as_ref()).await
    }
}
