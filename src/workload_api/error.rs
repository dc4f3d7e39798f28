use tonic::Code;

use crate::bundle::jwt::JwtBundleError;
use crate::bundle::x509::X509BundleError;
use crate::spiffe_id::{SpiffeId, SpiffeIdError};
use crate::svid::jwt::JwtSvidError;
use crate::svid::x509::X509SvidError;
use crate::transport::{EndpointError, TransportError};

/// Errors returned by [`WorkloadApiClient`](crate::workload_api::WorkloadApiClient).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WorkloadApiError {
    /// `SPIFFE_ENDPOINT_SOCKET` is not set.
    #[error("missing SPIFFE endpoint socket path (SPIFFE_ENDPOINT_SOCKET)")]
    MissingEndpointSocket,

    /// The configured endpoint does not parse.
    #[error("invalid workload api endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    /// The provider could not be reached, or failed the call.
    #[error("workload api unavailable: {0}")]
    Unavailable(#[from] TransportError),

    /// The provider answered with something that does not decode.
    #[error("malformed workload api response: {0}")]
    Protocol(#[from] ProtocolError),

    /// The provider rejected the request for lacking the security header.
    #[error("security context rejected: {0}")]
    SecurityContext(String),

    /// The request was rejected before or by the provider as malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The workload is not entitled to any identity.
    #[error("no identity issued")]
    NoIdentityIssued,

    /// The provider refused the call.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The provider closed an update stream.
    #[error("workload api stream ended")]
    StreamEnded,

    /// The client was closed.
    #[error("workload api client is closed")]
    Closed,
}

/// A Workload API response that cannot be turned into identity material.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// No message, or a message without SVIDs.
    #[error("empty Workload API response")]
    EmptyResponse,

    /// The response holds no SVID for the requested identity.
    #[error("no SVID for {0} in response")]
    SvidNotFound(SpiffeId),

    /// A trust domain or SPIFFE ID in the response does not parse.
    #[error("failed to parse SPIFFE ID: {0}")]
    SpiffeId(#[from] SpiffeIdError),

    /// A JWT bundle in the response does not decode.
    #[error("failed to parse JWT bundle: {0}")]
    JwtBundle(#[from] JwtBundleError),

    /// A JWT-SVID in the response does not parse.
    #[error("failed to parse JWT-SVID: {0}")]
    JwtSvid(#[from] JwtSvidError),

    /// An X.509 bundle in the response does not decode.
    #[error("failed to parse X.509 bundle: {0}")]
    X509Bundle(#[from] X509BundleError),

    /// An X.509-SVID in the response does not parse.
    #[error("failed to parse X.509 SVID: {0}")]
    X509Svid(#[from] X509SvidError),
}

macro_rules! protocol_errors {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for WorkloadApiError {
                fn from(err: $source) -> Self {
                    Self::Protocol(err.into())
                }
            }
        )*
    };
}

protocol_errors!(
    SpiffeIdError,
    JwtBundleError,
    JwtSvidError,
    X509BundleError,
    X509SvidError,
);

impl From<tonic::Status> for WorkloadApiError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message();
        match status.code() {
            Code::PermissionDenied if message.contains("no identity issued") => {
                Self::NoIdentityIssued
            }
            Code::PermissionDenied => Self::PermissionDenied(message.to_owned()),
            Code::InvalidArgument if message.contains("security header") => {
                Self::SecurityContext(message.to_owned())
            }
            Code::InvalidArgument => Self::InvalidArgument(message.to_owned()),
            _ => Self::Unavailable(TransportError::Status(status)),
        }
    }
}

impl From<tonic::transport::Error> for WorkloadApiError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Unavailable(TransportError::Tonic(err))
    }
}
