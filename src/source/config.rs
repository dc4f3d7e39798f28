use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::errors::SourceError;
use super::kind::DocumentKind;
use super::metrics::MetricsRecorder;
use super::IdentitySource;
use crate::workload_api::WorkloadApiClient;

/// Reconnect/backoff configuration.
///
/// After a stream failure the watcher waits `min_backoff`, then doubles the
/// delay (plus up to 10% jitter) on every further failure, capped at
/// `max_backoff`. The delay drops back to `min_backoff` once an update is
/// applied.
///
/// If `min_backoff > max_backoff`, the two are swapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// First delay after a failure.
    pub min_backoff: Duration,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    /// Returns the configuration with `min_backoff <= max_backoff`.
    pub fn normalize(mut self) -> Self {
        if self.min_backoff > self.max_backoff {
            std::mem::swap(&mut self.min_backoff, &mut self.max_backoff);
        }
        self
    }
}

/// Resource limits applied to every bundle set before it is published.
///
/// `None` disables a limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum number of trust domains in a bundle set.
    pub max_bundles: Option<usize>,
    /// Maximum encoded key material per bundle, in bytes: the sum of JWK JSON
    /// lengths for a JWT bundle, or of certificate DER lengths for an X.509
    /// bundle.
    pub max_bundle_bytes: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_bundles: Some(200),
            max_bundle_bytes: Some(4 * 1024 * 1024),
        }
    }
}

impl ResourceLimits {
    /// No limits enforced.
    pub const fn unlimited() -> Self {
        Self {
            max_bundles: None,
            max_bundle_bytes: None,
        }
    }
}

/// Configuration for [`IdentitySource::with_config`].
///
/// Every field has a default; override what you need with struct update
/// syntax:
///
/// ```
/// use std::time::Duration;
///
/// use spiffe_source::source::SourceConfig;
///
/// let config = SourceConfig {
///     endpoint: Some("unix:///tmp/spire-agent/public/api.sock".to_owned()),
///     initial_fetch_timeout: Duration::from_secs(3),
///     ..SourceConfig::default()
/// };
/// assert_eq!(config.shutdown_timeout, Some(Duration::from_secs(30)));
/// ```
#[derive(Clone)]
pub struct SourceConfig {
    /// Workload API address. Falls back to `SPIFFE_ENDPOINT_SOCKET` when
    /// neither this nor `client` is set.
    pub endpoint: Option<String>,
    /// A ready client to use instead of connecting. Takes precedence over
    /// `endpoint`. The source closes it when the source is closed.
    pub client: Option<WorkloadApiClient>,
    /// Upper bound on the seed bundle fetch.
    pub initial_fetch_timeout: Duration,
    /// Watcher backoff.
    pub reconnect: ReconnectConfig,
    /// Limits applied to the seed and every update.
    pub limits: ResourceLimits,
    /// Optional metrics hook.
    pub metrics: Option<Arc<dyn MetricsRecorder>>,
    /// How long `close()` waits for the watcher before aborting it. `None`
    /// waits indefinitely.
    pub shutdown_timeout: Option<Duration>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            client: None,
            initial_fetch_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            limits: ResourceLimits::default(),
            metrics: None,
            shutdown_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("endpoint", &self.endpoint)
            .field("client", &self.client)
            .field("initial_fetch_timeout", &self.initial_fetch_timeout)
            .field("reconnect", &self.reconnect)
            .field("limits", &self.limits)
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

/// Builder for an [`IdentitySource`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use spiffe_source::JwtSource;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = JwtSource::builder()
///     .endpoint("unix:///tmp/spire-agent/public/api.sock")
///     .reconnect_backoff(Duration::from_millis(500), Duration::from_secs(30))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SourceBuilder<K> {
    config: SourceConfig,
    kind: PhantomData<fn() -> K>,
}

impl<K> fmt::Debug for SourceBuilder<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl<K: DocumentKind> Default for SourceBuilder<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: DocumentKind> SourceBuilder<K> {
    /// A builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: SourceConfig::default(),
            kind: PhantomData,
        }
    }

    /// Sets the Workload API address, e.g. `unix:///tmp/agent.sock`.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = Some(endpoint.into());
        self
    }

    /// Uses `client` instead of connecting.
    #[must_use]
    pub fn client(mut self, client: WorkloadApiClient) -> Self {
        self.config.client = Some(client);
        self
    }

    /// Bounds the seed bundle fetch.
    #[must_use]
    pub fn initial_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.initial_fetch_timeout = timeout;
        self
    }

    /// Sets the watcher backoff range.
    #[must_use]
    pub fn reconnect_backoff(mut self, min_backoff: Duration, max_backoff: Duration) -> Self {
        self.config.reconnect = ReconnectConfig {
            min_backoff,
            max_backoff,
        };
        self
    }

    /// Sets the resource limits.
    #[must_use]
    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Installs a metrics hook.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.config.metrics = Some(metrics);
        self
    }

    /// Sets the close timeout. `None` waits for the watcher indefinitely.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Builds the source. See [`IdentitySource::with_config`].
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Initialization`] if the source cannot be seeded.
    pub async fn build(self) -> Result<IdentitySource<K>, SourceError> {
        IdentitySource::with_config(self.config).await
    }
}

impl<K: DocumentKind> From<SourceConfig> for SourceBuilder<K> {
    fn from(config: SourceConfig) -> Self {
        Self {
            config,
            kind: PhantomData,
        }
    }
}
