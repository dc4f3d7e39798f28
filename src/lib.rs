#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Identity sources for the
//! [SPIFFE Workload API](https://github.com/spiffe/spiffe/blob/main/standards/SPIFFE_Workload_API.md).
//!
//! An identity source keeps a live, atomically swapped cache of trust
//! bundles fed by a Workload API subscription, serves one-shot SVID fetches,
//! and validates SVIDs against the cached bundles. It reconnects on its own
//! and has a one-way, idempotent close.
//!
//! ## JWT
//!
//! ```no_run
//! use spiffe_source::{JwtSource, SpiffeId, TrustDomain};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Connect using SPIFFE_ENDPOINT_SOCKET
//! let source = JwtSource::new().await?;
//!
//! let server = SpiffeId::new("spiffe://example.org/workload-server")?;
//! let svid = source
//!     .fetch_jwt_svid(Some(&server), ["aud1", "aud2"])
//!     .await?;
//!
//! // Validate a token received from a peer.
//! source.validate(&svid, &["aud1"])?;
//!
//! let bundle = source.bundle_for_trust_domain(&TrustDomain::new("example.org")?)?;
//! println!("{} keys", bundle.authorities().count());
//!
//! source.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## X.509
//!
//! ```no_run
//! use spiffe_source::X509Source;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = X509Source::builder()
//!     .endpoint("unix:///tmp/spire-agent/public/api.sock")
//!     .build()
//!     .await?;
//!
//! let svid = source.fetch_x509_svid(None).await?;
//! source.validate(&svid, &[] as &[&str])?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`logging`**: emit diagnostics through the `log` crate.
//! - **`tracing`**: emit diagnostics through `tracing` (takes precedence).

mod observability;
mod prelude;

pub mod bundle;
pub mod cert;
pub mod source;
pub mod spiffe_id;
pub mod svid;
pub mod transport;
pub mod validator;
pub mod workload_api;

#[cfg(test)]
mod test_support;

pub use crate::source::{IdentitySource, JwtSource, SourceError, X509Source};
pub use crate::spiffe_id::{SpiffeId, SpiffeIdError, TrustDomain};
pub use crate::workload_api::{WorkloadApiClient, WorkloadApiError};
