use futures::StreamExt as _;

use crate::bundle::jwt::JwtBundle;
use crate::bundle::BundleSet;
use crate::spiffe_id::SpiffeId;
use crate::svid::jwt::JwtSvid;
use crate::workload_api::pb::{
    JwtBundlesRequest, JwtBundlesResponse, JwtsvidRequest, ValidateJwtsvidRequest,
};
use crate::workload_api::{BundleStream, ProtocolError, WorkloadApiClient, WorkloadApiError};

impl WorkloadApiClient {
    /// Fetches the current JWT bundles once.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Unavailable`] on transport failure and
    /// [`WorkloadApiError::Protocol`] if a bundle does not decode.
    pub async fn fetch_jwt_bundles(&self) -> Result<BundleSet<JwtBundle>, WorkloadApiError> {
        let mut grpc = self.grpc()?;
        self.guarded(async move {
            let response = grpc.fetch_jwt_bundles(JwtBundlesRequest::default()).await?;
            let message = Self::first_message(response.into_inner()).await?;
            jwt_bundle_set(message)
        })
        .await
    }

    /// Subscribes to JWT bundle updates.
    ///
    /// The first item is the current bundle set.
    ///
    /// # Errors
    ///
    /// Fails if the stream cannot be opened.
    pub async fn stream_jwt_bundles(&self) -> Result<BundleStream<JwtBundle>, WorkloadApiError> {
        let mut grpc = self.grpc()?;
        let response = self
            .guarded(async move { Ok(grpc.fetch_jwt_bundles(JwtBundlesRequest::default()).await?) })
            .await?;

        let messages = response.into_inner().map(|message| {
            message
                .map_err(WorkloadApiError::from)
                .and_then(jwt_bundle_set)
        });
        Ok(self.terminating(messages))
    }

    /// Fetches a JWT-SVID for `audience`.
    ///
    /// With `spiffe_id` set, the SVID for that identity is returned; otherwise
    /// the provider's default identity. The returned audience preserves the
    /// requested order.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::InvalidArgument`] for an empty audience,
    /// without contacting the provider.
    pub async fn fetch_jwt_svid<I>(
        &self,
        audience: I,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<JwtSvid, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut grpc = self.grpc()?;
        let audience: Vec<String> = audience
            .into_iter()
            .map(|a| a.as_ref().to_owned())
            .collect();
        if audience.is_empty() {
            return Err(WorkloadApiError::InvalidArgument(
                "audience must not be empty".to_owned(),
            ));
        }

        let request = JwtsvidRequest {
            audience,
            spiffe_id: spiffe_id.map(ToString::to_string).unwrap_or_default(),
        };
        let response = self
            .guarded(async move { Ok(grpc.fetch_jwtsvid(request).await?.into_inner()) })
            .await?;

        let wanted = spiffe_id.map(ToString::to_string);
        let svid = match &wanted {
            Some(id) => response.svids.into_iter().find(|s| &s.spiffe_id == id),
            None => response.svids.into_iter().next(),
        };
        let svid = svid.ok_or_else(|| match spiffe_id {
            Some(id) => ProtocolError::SvidNotFound(id.clone()),
            None => ProtocolError::EmptyResponse,
        })?;

        Ok(JwtSvid::parse_insecure(&svid.svid)?.with_hint(svid.hint))
    }

    /// Asks the provider to validate `token` for `audience`.
    ///
    /// The token is parsed locally only after the provider accepts it.
    ///
    /// # Errors
    ///
    /// Fails if the provider rejects the token or cannot be reached.
    pub async fn validate_jwt_token(
        &self,
        audience: &str,
        token: &str,
    ) -> Result<JwtSvid, WorkloadApiError> {
        let mut grpc = self.grpc()?;
        let request = ValidateJwtsvidRequest {
            audience: audience.to_owned(),
            svid: token.to_owned(),
        };
        self.guarded(async move { Ok(grpc.validate_jwtsvid(request).await?) })
            .await?;
        Ok(JwtSvid::parse_insecure(token)?)
    }
}

fn jwt_bundle_set(message: JwtBundlesResponse) -> Result<BundleSet<JwtBundle>, WorkloadApiError> {
    Ok(BundleSet::from_jwks_map(
        message.bundles.iter().map(|(td, jwks)| (td, jwks.as_ref())),
    )?)
}
