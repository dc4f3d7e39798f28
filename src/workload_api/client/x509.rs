use futures::StreamExt as _;

use crate::bundle::x509::X509Bundle;
use crate::bundle::BundleSet;
use crate::spiffe_id::SpiffeId;
use crate::svid::x509::X509Svid;
use crate::workload_api::pb::{X509BundlesRequest, X509BundlesResponse, X509svidRequest};
use crate::workload_api::{BundleStream, ProtocolError, WorkloadApiClient, WorkloadApiError};

impl WorkloadApiClient {
    /// Fetches the current X.509 bundles once.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Unavailable`] on transport failure and
    /// [`WorkloadApiError::Protocol`] if a bundle does not decode.
    pub async fn fetch_x509_bundles(&self) -> Result<BundleSet<X509Bundle>, WorkloadApiError> {
        let mut grpc = self.grpc()?;
        self.guarded(async move {
            let response = grpc
                .fetch_x509_bundles(X509BundlesRequest::default())
                .await?;
            let message = Self::first_message(response.into_inner()).await?;
            x509_bundle_set(message)
        })
        .await
    }

    /// Subscribes to X.509 bundle updates.
    ///
    /// # Errors
    ///
    /// Fails if the stream cannot be opened.
    pub async fn stream_x509_bundles(&self) -> Result<BundleStream<X509Bundle>, WorkloadApiError> {
        let mut grpc = self.grpc()?;
        let response = self
            .guarded(async move {
                Ok(grpc
                    .fetch_x509_bundles(X509BundlesRequest::default())
                    .await?)
            })
            .await?;

        let messages = response.into_inner().map(|message| {
            message
                .map_err(WorkloadApiError::from)
                .and_then(x509_bundle_set)
        });
        Ok(self.terminating(messages))
    }

    /// Fetches the X.509-SVID for `spiffe_id`, or the default (first) one.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Protocol`] if the response has no matching
    /// SVID or it does not parse.
    pub async fn fetch_x509_svid(
        &self,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<X509Svid, WorkloadApiError> {
        let mut grpc = self.grpc()?;
        let message = self
            .guarded(async move {
                let response = grpc.fetch_x509svid(X509svidRequest::default()).await?;
                Self::first_message(response.into_inner()).await
            })
            .await?;

        let svid = match spiffe_id {
            Some(id) => {
                let wanted = id.to_string();
                message.svids.into_iter().find(|s| s.spiffe_id == wanted)
            }
            None => message.svids.into_iter().next(),
        };
        let svid = svid.ok_or_else(|| match spiffe_id {
            Some(id) => ProtocolError::SvidNotFound(id.clone()),
            None => ProtocolError::EmptyResponse,
        })?;

        Ok(X509Svid::parse_from_der(&svid.x509_svid, &svid.x509_svid_key)?.with_hint(svid.hint))
    }
}

fn x509_bundle_set(message: X509BundlesResponse) -> Result<BundleSet<X509Bundle>, WorkloadApiError> {
    Ok(BundleSet::from_der_map(
        message.bundles.iter().map(|(td, der)| (td, der.as_ref())),
    )?)
}
