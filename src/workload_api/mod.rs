//! SPIFFE Workload API access.

mod client;
mod error;

pub use client::{BundleStream, WorkloadApiClient};
pub use error::{ProtocolError, WorkloadApiError};

use crate::transport::Endpoint;

#[allow(
    clippy::all,
    clippy::pedantic,
    dead_code,
    missing_docs,
    missing_debug_implementations,
    unreachable_pub
)]
pub(crate) mod pb {
    tonic::include_proto!("_");
}

/// Environment variable holding the Workload API address.
pub const ENDPOINT_SOCKET_ENV: &str = "SPIFFE_ENDPOINT_SOCKET";

/// Reads and parses `SPIFFE_ENDPOINT_SOCKET`.
///
/// # Errors
///
/// Returns [`WorkloadApiError::MissingEndpointSocket`] if the variable is
/// unset, or [`WorkloadApiError::Endpoint`] if it does not parse.
pub fn endpoint_from_env() -> Result<Endpoint, WorkloadApiError> {
    let raw = std::env::var(ENDPOINT_SOCKET_ENV)
        .map_err(|_| WorkloadApiError::MissingEndpointSocket)?;
    Ok(Endpoint::parse(&raw)?)
}
