//! Workload API client.
//!
//! [`WorkloadApiClient`] is a thin facade over the generated gRPC client. It
//! offers one-shot fetches and long-lived bundle streams, and nothing else:
//! no caching, no retries. [`IdentitySource`](crate::source::IdentitySource)
//! layers those on top.
//!
//! Clones share one channel. [`WorkloadApiClient::close`] on any clone
//! releases the channel, fails blocked calls and terminates open streams.

mod header;
mod jwt;
mod x509;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::{Stream, StreamExt as _};
use tokio_util::sync::CancellationToken;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

use crate::bundle::BundleSet;
use crate::transport::{self, Endpoint};
use crate::workload_api::pb::spiffe_workload_api_client::SpiffeWorkloadApiClient;
use crate::workload_api::{endpoint_from_env, WorkloadApiError};
use header::MetadataAdder;

type GrpcClient = SpiffeWorkloadApiClient<InterceptedService<Channel, MetadataAdder>>;

/// A stream of bundle set updates.
///
/// The stream never ends silently: a remote close yields
/// [`WorkloadApiError::StreamEnded`], a client close yields
/// [`WorkloadApiError::Closed`], and any error is the last item.
pub type BundleStream<B> =
    Pin<Box<dyn Stream<Item = Result<BundleSet<B>, WorkloadApiError>> + Send + 'static>>;

/// Client for the SPIFFE Workload API.
#[derive(Clone)]
pub struct WorkloadApiClient {
    shared: Arc<Shared>,
}

struct Shared {
    endpoint: Option<Endpoint>,
    grpc: ArcSwapOption<GrpcClient>,
    closed: CancellationToken,
}

impl fmt::Debug for WorkloadApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadApiClient")
            .field("endpoint", &self.shared.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WorkloadApiClient {
    /// Connects to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Unavailable`] if the connection fails.
    pub async fn connect(endpoint: Endpoint) -> Result<Self, WorkloadApiError> {
        let channel = transport::connect(&endpoint).await?;
        Ok(Self::from_parts(Some(endpoint), channel))
    }

    /// Parses `endpoint` (e.g. `unix:///tmp/agent.sock`) and connects to it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Endpoint`] for a malformed address, or
    /// [`WorkloadApiError::Unavailable`] if the connection fails.
    pub async fn connect_to(endpoint: impl AsRef<str>) -> Result<Self, WorkloadApiError> {
        Self::connect(Endpoint::parse(endpoint.as_ref())?).await
    }

    /// Connects to the address in `SPIFFE_ENDPOINT_SOCKET`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::MissingEndpointSocket`] if the variable is
    /// unset, otherwise as [`WorkloadApiClient::connect_to`].
    pub async fn connect_env() -> Result<Self, WorkloadApiError> {
        Self::connect(endpoint_from_env()?).await
    }

    /// Wraps an existing channel, e.g. one with custom timeouts or TLS.
    pub fn from_channel(channel: Channel) -> Self {
        Self::from_parts(None, channel)
    }

    fn from_parts(endpoint: Option<Endpoint>, channel: Channel) -> Self {
        let grpc = SpiffeWorkloadApiClient::with_interceptor(channel, MetadataAdder);
        Self {
            shared: Arc::new(Shared {
                endpoint,
                grpc: ArcSwapOption::from_pointee(grpc),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// The endpoint this client connected to, if it was built from one.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.shared.endpoint.as_ref()
    }

    /// Releases the channel. Idempotent.
    ///
    /// Blocked calls fail with [`WorkloadApiError::Closed`], open streams
    /// yield it as their final item, and later calls fail with it without
    /// touching the network.
    pub fn close(&self) {
        self.shared.closed.cancel();
        self.shared.grpc.store(None);
    }

    /// Whether [`WorkloadApiClient::close`] has been called on any clone.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    fn grpc(&self) -> Result<GrpcClient, WorkloadApiError> {
        if self.is_closed() {
            return Err(WorkloadApiError::Closed);
        }
        self.shared
            .grpc
            .load_full()
            .map(|grpc| GrpcClient::clone(&grpc))
            .ok_or(WorkloadApiError::Closed)
    }

    /// Runs `call`, failing with `Closed` as soon as the client is closed.
    async fn guarded<T, F>(&self, call: F) -> Result<T, WorkloadApiError>
    where
        F: Future<Output = Result<T, WorkloadApiError>>,
    {
        tokio::select! {
            biased;
            () = self.shared.closed.cancelled() => Err(WorkloadApiError::Closed),
            result = call => result,
        }
    }

    async fn first_message<T>(mut messages: tonic::Streaming<T>) -> Result<T, WorkloadApiError> {
        messages
            .message()
            .await?
            .ok_or_else(|| crate::workload_api::ProtocolError::EmptyResponse.into())
    }

    /// Turns decoded gRPC messages into a stream that always ends with an error item.
    fn terminating<T, S>(
        &self,
        messages: S,
    ) -> Pin<Box<dyn Stream<Item = Result<T, WorkloadApiError>> + Send + 'static>>
    where
        T: Send + 'static,
        S: Stream<Item = Result<T, WorkloadApiError>> + Send + 'static,
    {
        let state = Some((Box::pin(messages), self.shared.closed.clone()));
        Box::pin(futures::stream::unfold(state, |state| async move {
            let (mut messages, closed) = state?;
            let next = tokio::select! {
                biased;
                () = closed.cancelled() => None,
                item = messages.next() => Some(item),
            };
            match next {
                Some(Some(Ok(item))) => Some((Ok(item), Some((messages, closed)))),
                Some(Some(Err(err))) => Some((Err(err), None)),
                Some(None) => Some((Err(WorkloadApiError::StreamEnded), None)),
                None => Some((Err(WorkloadApiError::Closed), None)),
            }
        }))
    }
}
