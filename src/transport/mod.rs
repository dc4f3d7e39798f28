//! Socket addressing and gRPC channel setup for the Workload API.

mod endpoint;

pub use endpoint::{Endpoint, EndpointError};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hyper_util::rt::TokioIo;
#[cfg(unix)]
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};
use tower::service_fn;

// tonic wants an http URI even when the connector ignores it.
const PLACEHOLDER_URI: &str = "http://[::]:50051";

/// Failure to reach the Workload API.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The endpoint kind is not available on this platform.
    #[error("unsupported endpoint transport: {scheme}")]
    UnsupportedEndpointTransport {
        /// The endpoint scheme.
        scheme: &'static str,
    },

    /// The channel could not be built or connected.
    #[error(transparent)]
    Tonic(#[from] tonic::transport::Error),

    /// A call failed with a gRPC status that has no more specific meaning.
    #[error(transparent)]
    Status(#[from] tonic::Status),
}

/// Opens a gRPC channel to `endpoint`.
///
/// # Errors
///
/// Returns a [`TransportError`] if the connection cannot be established.
pub async fn connect(endpoint: &Endpoint) -> Result<Channel, TransportError> {
    match endpoint {
        Endpoint::Tcp(addr) => connect_tcp(*addr).await,
        Endpoint::Unix(path) => connect_unix(path.clone()).await,
    }
}

async fn connect_tcp(addr: SocketAddr) -> Result<Channel, TransportError> {
    Ok(TonicEndpoint::try_from(format!("http://{addr}"))?
        .connect()
        .await?)
}

#[cfg(unix)]
async fn connect_unix(path: PathBuf) -> Result<Channel, TransportError> {
    let path = Arc::new(path);
    let channel = TonicEndpoint::try_from(PLACEHOLDER_URI)?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = Arc::clone(&path);
            async move {
                let stream = UnixStream::connect(path.as_path()).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;
    Ok(channel)
}

#[cfg(not(unix))]
async fn connect_unix(_path: PathBuf) -> Result<Channel, TransportError> {
    Err(TransportError::UnsupportedEndpointTransport { scheme: "unix" })
}
