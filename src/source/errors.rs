use std::fmt;
use std::time::Duration;

use crate::bundle::BundleNotFound;
use crate::spiffe_id::TrustDomain;
use crate::validator::Rejection;
use crate::workload_api::WorkloadApiError;

/// Errors returned by [`IdentitySource`](super::IdentitySource).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SourceError {
    /// The source was closed. Carries what was asked of it, e.g. `"JWT bundle"`.
    #[error("{0} source is closed")]
    Closed(&'static str),

    /// The cached bundle set has nothing for the trust domain.
    #[error("no bundle found for trust domain: {0}")]
    BundleNotFound(TrustDomain),

    /// The source could not be built.
    #[error("failed to initialize source: {0}")]
    Initialization(#[from] InitializationError),

    /// A one-shot document fetch failed.
    #[error("failed to fetch document: {0}")]
    FetchDocument(WorkloadApiError),

    /// The request was rejected before reaching the provider.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bundle set update exceeds the configured resource limits.
    #[error(transparent)]
    ResourceLimitExceeded(#[from] LimitExceeded),

    /// A document failed validation.
    #[error("document rejected: {0}")]
    Rejected(#[from] Rejection),

    /// The watcher did not stop within the shutdown timeout and was aborted.
    #[error("shutdown timeout exceeded")]
    ShutdownTimeout,
}

impl From<BundleNotFound> for SourceError {
    fn from(err: BundleNotFound) -> Self {
        Self::BundleNotFound(err.0)
    }
}

/// Why a source could not be built. No source is ever returned without trust
/// material.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InitializationError {
    /// The Workload API could not be reached.
    #[error("cannot connect to workload api: {0}")]
    Connect(WorkloadApiError),

    /// The seed bundle fetch failed.
    #[error("initial bundle fetch failed: {0}")]
    Fetch(WorkloadApiError),

    /// The seed bundle fetch did not finish in time.
    #[error("initial bundle fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The seed bundle set exceeds the configured resource limits.
    #[error("initial bundle set rejected: {0}")]
    ResourceLimit(LimitExceeded),
}

/// A bundle set that broke one of the [`ResourceLimits`](super::ResourceLimits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("resource limit exceeded: {kind} (limit={limit}, actual={actual})")]
pub struct LimitExceeded {
    /// Which limit.
    pub kind: LimitKind,
    /// The configured limit.
    pub limit: usize,
    /// The observed value.
    pub actual: usize,
}

/// The kind of resource limit that was exceeded.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum LimitKind {
    /// Too many trust domains in one bundle set.
    MaxBundles,
    /// Too much key material in one bundle.
    MaxBundleBytes,
}

impl LimitKind {
    /// A stable label, suitable for logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MaxBundles => "max_bundles",
            Self::MaxBundleBytes => "max_bundle_bytes",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error kinds for structured metrics reporting.
///
/// These are stable, low-cardinality labels.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum MetricsErrorKind {
    /// Connecting to the Workload API failed during construction.
    ClientCreation,
    /// The bundle stream could not be opened.
    StreamConnect,
    /// The bundle stream yielded an error.
    StreamError,
    /// The provider closed the bundle stream.
    StreamEnded,
    /// The seed fetch failed or timed out.
    InitialSyncFailed,
    /// A bundle set had too many bundles.
    LimitMaxBundles,
    /// A bundle carried too much key material.
    LimitMaxBundleBytes,
    /// A bundle set update was rejected.
    UpdateRejected,
    /// A one-shot document fetch failed.
    FetchDocument,
    /// The watcher task panicked or was aborted during shutdown.
    WatcherJoinFailed,
}

impl MetricsErrorKind {
    /// A stable label for metrics systems that need strings.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientCreation => "client_creation",
            Self::StreamConnect => "stream_connect",
            Self::StreamError => "stream_error",
            Self::StreamEnded => "stream_ended",
            Self::InitialSyncFailed => "initial_sync_failed",
            Self::LimitMaxBundles => "limit_max_bundles",
            Self::LimitMaxBundleBytes => "limit_max_bundle_bytes",
            Self::UpdateRejected => "update_rejected",
            Self::FetchDocument => "fetch_document",
            Self::WatcherJoinFailed => "watcher_join_failed",
        }
    }
}

impl From<LimitKind> for MetricsErrorKind {
    fn from(kind: LimitKind) -> Self {
        match kind {
            LimitKind::MaxBundles => Self::LimitMaxBundles,
            LimitKind::MaxBundleBytes => Self::LimitMaxBundleBytes,
        }
    }
}

impl fmt::Display for MetricsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
