//! Identity sources: cached, self-refreshing trust bundles plus on-demand
//! SVID fetching.
//!
//! An [`IdentitySource`] seeds its bundle cache from the Workload API before
//! it is returned, then watches the API for bundle rotations. Transient
//! failures are handled by reconnecting with backoff while reads keep
//! serving the last good bundle set. [`JwtSource`] and [`X509Source`] are the
//! two flavours.
//!
//! Use [`IdentitySource::updated`] to observe rotations and
//! [`IdentitySource::close`] to stop the background task.
//!
//! # Example
//!
//! ```no_run
//! use spiffe_source::{TrustDomain, X509Source};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = X509Source::builder()
//!     .endpoint("unix:///tmp/spire-agent/public/api.sock")
//!     .build()
//!     .await?;
//!
//! let svid = source.fetch_x509_svid(None).await?;
//! let bundle = source.bundle_for_trust_domain(svid.spiffe_id().trust_domain())?;
//! println!("{} authorities", bundle.authorities().len());
//! # Ok(())
//! # }
//! ```

mod config;
mod errors;
mod identity;
mod kind;
mod limits;
mod metrics;
mod updates;
mod watcher;

pub use config::{ReconnectConfig, ResourceLimits, SourceBuilder, SourceConfig};
pub use errors::{InitializationError, LimitExceeded, LimitKind, MetricsErrorKind, SourceError};
pub use identity::{IdentitySource, JwtSource, X509Source};
pub use kind::{DocumentKind, Jwt, JwtSvidRequest, X509};
pub use metrics::MetricsRecorder;
pub use updates::SourceUpdates;
pub use watcher::WatchState;
