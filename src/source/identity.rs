use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::config::{ResourceLimits, SourceBuilder, SourceConfig};
use super::errors::{InitializationError, MetricsErrorKind, SourceError};
use super::kind::{DocumentKind, Jwt, JwtSvidRequest, X509};
use super::limits;
use super::metrics::MetricsRecorder;
use super::updates::SourceUpdates;
use super::watcher::{self, WatchState, WatcherHandle};
use crate::bundle::BundleSet;
use crate::prelude::{debug, info, warn};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::jwt::JwtSvid;
use crate::svid::x509::X509Svid;
use crate::validator;
use crate::workload_api::{WorkloadApiClient, WorkloadApiError};

/// Live, self-refreshing source of SPIFFE trust bundles.
///
/// A source is seeded with the provider's current bundle set before
/// construction returns, then kept fresh by a background watcher that
/// reconnects with backoff when the stream fails. Reads are lock-free and
/// always see a complete bundle set. Document fetches go straight to the
/// provider.
///
/// Handles are cheap to clone and share one source. [`IdentitySource::close`]
/// is one-way: afterwards every read, fetch and validation fails with
/// [`SourceError::Closed`]. Dropping the last handle closes the source on a
/// best-effort basis.
///
/// # Example
///
/// ```no_run
/// use spiffe_source::{JwtSource, TrustDomain};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = JwtSource::new().await?;
///
/// let svid = source
///     .fetch_jwt_svid(None, ["spiffe://example.org/backend"])
///     .await?;
/// let bundle = source.bundle_for_trust_domain(&TrustDomain::new("example.org")?)?;
/// source.validate(&svid, &["spiffe://example.org/backend"])?;
///
/// source.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct IdentitySource<K: DocumentKind> {
    inner: Arc<Inner<K>>,
}

/// Source of JWT bundles and JWT-SVIDs.
pub type JwtSource = IdentitySource<Jwt>;

/// Source of X.509 bundles and X.509-SVIDs.
pub type X509Source = IdentitySource<X509>;

pub(super) struct Inner<K: DocumentKind> {
    // Last-known-good bundle set, replaced wholesale.
    snapshot: ArcSwap<BundleSet<K::Bundle>>,
    limits: ResourceLimits,

    client: WorkloadApiClient,
    metrics: Option<Arc<dyn MetricsRecorder>>,

    // Lifecycle.
    closed: AtomicBool,
    cancel: CancellationToken,
    shutdown_timeout: Option<Duration>,

    // Update notifications (monotonic sequence, seed = 0).
    update_tx: watch::Sender<u64>,

    watcher: WatcherHandle,
}

/// Outcome of an applied update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Applied {
    /// The snapshot was replaced; carries the new sequence number.
    Swapped(u64),
    /// The update equals the current snapshot.
    Unchanged,
}

impl<K: DocumentKind> Clone for IdentitySource<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: DocumentKind> fmt::Debug for IdentitySource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl<K: DocumentKind> fmt::Debug for Inner<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentitySource")
            .field("kind", &K::BUNDLE_LABEL)
            .field("bundles", &self.snapshot.load().len())
            .field("client", &self.client)
            .field("limits", &self.limits)
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("update_seq", &*self.update_tx.borrow())
            .field("watcher", &self.watcher.state())
            .finish()
    }
}

impl<K: DocumentKind> IdentitySource<K> {
    /// Creates a source connected to `SPIFFE_ENDPOINT_SOCKET` with default
    /// settings.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Initialization`] if the provider cannot be
    /// reached or the seed fetch fails.
    pub async fn new() -> Result<Self, SourceError> {
        Self::with_config(SourceConfig::default()).await
    }

    /// A builder for configuring a source.
    pub fn builder() -> SourceBuilder<K> {
        SourceBuilder::new()
    }

    /// Creates a source from `config`.
    ///
    /// Connects, fetches the current bundle set exactly once within
    /// `initial_fetch_timeout`, checks it against the resource limits and only
    /// then starts the background watcher.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Initialization`] if any of those steps fail. A
    /// client created here is closed again; an injected one is left open.
    pub async fn with_config(config: SourceConfig) -> Result<Self, SourceError> {
        let SourceConfig {
            endpoint,
            client,
            initial_fetch_timeout,
            reconnect,
            limits,
            metrics,
            shutdown_timeout,
        } = config;
        let reconnect = reconnect.normalize();
        let record = |kind: MetricsErrorKind| {
            if let Some(m) = metrics.as_deref() {
                m.record_error(kind);
            }
        };

        let (client, owned) = match client {
            Some(client) => (client, false),
            None => {
                let connected = match endpoint {
                    Some(endpoint) => WorkloadApiClient::connect_to(endpoint).await,
                    None => WorkloadApiClient::connect_env().await,
                };
                let client = connected.map_err(|e| {
                    warn!("Failed to connect to the Workload API: error={}", e);
                    record(MetricsErrorKind::ClientCreation);
                    InitializationError::Connect(e)
                })?;
                (client, true)
            }
        };

        let seed = match tokio::time::timeout(initial_fetch_timeout, K::fetch_bundles(&client)).await
        {
            Ok(Ok(seed)) => limits::check_and_record(&seed, limits, metrics.as_deref())
                .map(|()| seed)
                .map_err(InitializationError::ResourceLimit),
            Ok(Err(e)) => Err(InitializationError::Fetch(e)),
            Err(_) => Err(InitializationError::Timeout(initial_fetch_timeout)),
        };
        let seed = match seed {
            Ok(seed) => seed,
            Err(e) => {
                warn!("Initial {} fetch failed: error={}", K::BUNDLE_LABEL, e);
                record(MetricsErrorKind::InitialSyncFailed);
                if owned {
                    client.close();
                }
                return Err(e.into());
            }
        };
        info!(
            "Initial {} set fetched: trust_domains={}",
            K::BUNDLE_LABEL,
            seed.len()
        );

        let cancel = CancellationToken::new();
        let (watcher, state) = watcher::handle(cancel.child_token());
        let (update_tx, _) = watch::channel(0);

        let inner = Arc::new(Inner {
            snapshot: ArcSwap::from_pointee(seed),
            limits,
            client,
            metrics,
            closed: AtomicBool::new(false),
            cancel,
            shutdown_timeout,
            update_tx,
            watcher,
        });
        watcher::start(&inner, state, reconnect).await;

        Ok(Self { inner })
    }

    /// The bundle for `trust_domain` from the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] after close, or
    /// [`SourceError::BundleNotFound`] if the snapshot has nothing for that
    /// domain.
    pub fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Arc<K::Bundle>, SourceError> {
        Ok(self.snapshot()?.bundle_for(trust_domain)?)
    }

    /// The current bundle set.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] after close.
    pub fn bundle_set(&self) -> Result<Arc<BundleSet<K::Bundle>>, SourceError> {
        self.snapshot()
    }

    /// Validates `document` against one snapshot of the current bundles.
    ///
    /// Every entry of `expected_audience` must be in the document's audience.
    /// Fetched documents are not validated implicitly; call this when you
    /// need it.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] after close, or
    /// [`SourceError::Rejected`] with the first failed check.
    pub fn validate<A: AsRef<str>>(
        &self,
        document: &K::Document,
        expected_audience: &[A],
    ) -> Result<(), SourceError> {
        let snapshot = self.snapshot()?;
        validator::validate(document, &*snapshot, expected_audience)?;
        Ok(())
    }

    /// Notifications for bundle set updates published after this call.
    pub fn updated(&self) -> SourceUpdates {
        SourceUpdates::new(
            self.inner.update_tx.subscribe(),
            self.inner.cancel.clone(),
            K::BUNDLE_LABEL,
        )
    }

    /// Best-effort health check: open and holding at least one bundle.
    pub fn is_healthy(&self) -> bool {
        !self.is_closed() && !self.inner.snapshot.load().is_empty()
    }

    /// What the background watcher is doing.
    pub fn watcher_state(&self) -> WatchState {
        self.inner.watcher.state()
    }

    /// Whether [`IdentitySource::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Closes the source. Idempotent.
    ///
    /// Stops the watcher, waiting up to the configured shutdown timeout, then
    /// closes the Workload API client. Blocked fetches fail with
    /// [`SourceError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ShutdownTimeout`] if the watcher had to be
    /// aborted. The source is closed either way.
    pub async fn close(&self) -> Result<(), SourceError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Closing {} source", K::BUNDLE_LABEL);
        self.inner.cancel.cancel();

        let stopped = self
            .inner
            .watcher
            .stop(self.inner.shutdown_timeout, self.inner.metrics.as_deref())
            .await;
        self.inner.client.close();
        stopped
    }

    fn snapshot(&self) -> Result<Arc<BundleSet<K::Bundle>>, SourceError> {
        if self.is_closed() {
            return Err(SourceError::Closed(K::BUNDLE_LABEL));
        }
        Ok(self.inner.snapshot.load_full())
    }

    async fn fetch_document(&self, request: K::Request) -> Result<K::Document, SourceError> {
        if self.is_closed() {
            return Err(SourceError::Closed(K::DOCUMENT_LABEL));
        }

        let fetched = tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => return Err(SourceError::Closed(K::DOCUMENT_LABEL)),
            fetched = K::fetch_document(&self.inner.client, &request) => fetched,
        };

        fetched.map_err(|e| match e {
            WorkloadApiError::Closed => SourceError::Closed(K::DOCUMENT_LABEL),
            other => {
                self.inner.record_error(MetricsErrorKind::FetchDocument);
                SourceError::FetchDocument(other)
            }
        })
    }
}

impl IdentitySource<Jwt> {
    /// Fetches a JWT-SVID for `audience` from the provider.
    ///
    /// With `spiffe_id` set, the SVID for that identity is returned;
    /// otherwise the provider's default. The returned audience keeps the
    /// requested order. Never served from cache and never retried.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the source is or becomes closed,
    /// [`SourceError::InvalidArgument`] for an empty audience, or
    /// [`SourceError::FetchDocument`] if the provider call fails.
    pub async fn fetch_jwt_svid<I>(
        &self,
        spiffe_id: Option<&SpiffeId>,
        audience: I,
    ) -> Result<JwtSvid, SourceError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        if self.is_closed() {
            return Err(SourceError::Closed(Jwt::DOCUMENT_LABEL));
        }
        let audience: Vec<String> = audience
            .into_iter()
            .map(|a| a.as_ref().to_owned())
            .collect();
        if audience.is_empty() {
            return Err(SourceError::InvalidArgument(
                "audience must not be empty".to_owned(),
            ));
        }

        let request = JwtSvidRequest {
            spiffe_id: spiffe_id.cloned(),
            audience,
        };
        self.fetch_document(request).await
    }
}

impl IdentitySource<X509> {
    /// Fetches the X.509-SVID for `spiffe_id`, or the default one, from the
    /// provider.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the source is or becomes closed, or
    /// [`SourceError::FetchDocument`] if the provider call fails.
    pub async fn fetch_x509_svid(
        &self,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<X509Svid, SourceError> {
        self.fetch_document(spiffe_id.cloned()).await
    }
}

impl<K: DocumentKind> Inner<K> {
    pub(super) fn client(&self) -> &WorkloadApiClient {
        &self.client
    }

    pub(super) fn watcher(&self) -> &WatcherHandle {
        &self.watcher
    }

    pub(super) fn metrics_arc(&self) -> Option<Arc<dyn MetricsRecorder>> {
        self.metrics.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    fn record_error(&self, kind: MetricsErrorKind) {
        if let Some(m) = self.metrics.as_deref() {
            m.record_error(kind);
        }
    }

    /// Publishes `update` unless the source is closed, it breaks a resource
    /// limit, or it equals the current snapshot.
    pub(super) fn apply_update(&self, update: BundleSet<K::Bundle>) -> Result<Applied, SourceError> {
        if self.is_closed() {
            return Err(SourceError::Closed(K::BUNDLE_LABEL));
        }
        if let Err(exceeded) = limits::check_and_record(&update, self.limits, self.metrics.as_deref())
        {
            self.record_error(MetricsErrorKind::UpdateRejected);
            return Err(exceeded.into());
        }
        if **self.snapshot.load() == update {
            return Ok(Applied::Unchanged);
        }

        self.snapshot.store(Arc::new(update));
        if let Some(m) = self.metrics.as_deref() {
            m.record_update();
        }

        let mut seq = 0;
        self.update_tx.send_modify(|current| {
            *current += 1;
            seq = *current;
        });
        Ok(Applied::Swapped(seq))
    }
}

#[cfg(test)]
impl<K: DocumentKind> Inner<K> {
    /// Source state around `seed` with no watcher task and a client that is
    /// never dialed.
    pub(super) fn detached(
        seed: BundleSet<K::Bundle>,
        limits: ResourceLimits,
        metrics: Option<Arc<dyn MetricsRecorder>>,
    ) -> Arc<Self> {
        let channel = tonic::transport::Channel::from_static("http://127.0.0.1:1").connect_lazy();
        let cancel = CancellationToken::new();
        let (watcher, _state) = watcher::handle(cancel.child_token());
        let (update_tx, _) = watch::channel(0);

        Arc::new(Inner {
            snapshot: ArcSwap::from_pointee(seed),
            limits,
            client: WorkloadApiClient::from_channel(channel),
            metrics,
            closed: AtomicBool::new(false),
            cancel,
            shutdown_timeout: Some(Duration::from_secs(1)),
            update_tx,
            watcher,
        })
    }

    pub(super) fn updates(&self) -> watch::Receiver<u64> {
        self.update_tx.subscribe()
    }
}

impl<K: DocumentKind> Drop for Inner<K> {
    fn drop(&mut self) {
        // Last handle gone. Do not block in Drop.
        self.cancel.cancel();
        self.client.close();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;


    use super::*;
    use crate::bundle::jwt::JwtBundle;
    use crate::bundle::Bundle;
    use crate::source::errors::LimitKind;
    use crate::test_support::EcKey;

    #[derive(Default)]
    struct CountingRecorder {
        errors: Mutex<HashMap<MetricsErrorKind, u64>>,
        updates: Mutex<u64>,
    }

    impl CountingRecorder {
        fn errors(&self, kind: MetricsErrorKind) -> u64 {
            *self.errors.lock().unwrap().get(&kind).unwrap_or(&0)
        }
    }

    impl MetricsRecorder for CountingRecorder {
        fn record_update(&self) {
            *self.updates.lock().unwrap() += 1;
        }
        fn record_reconnect(&self) {}
        fn record_error(&self, kind: MetricsErrorKind) {
            *self.errors.lock().unwrap().entry(kind).or_insert(0) += 1;
        }
    }

    fn source_with(
        seed: BundleSet<JwtBundle>,
        limits: ResourceLimits,
        metrics: Option<Arc<dyn MetricsRecorder>>,
    ) -> JwtSource {
        IdentitySource {
            inner: Inner::detached(seed, limits, metrics),
        }
    }

    fn bundles(domains: &[&str]) -> BundleSet<JwtBundle> {
        let key = EcKey::generate("k1");
        domains.iter().map(|td| key.bundle(td)).collect()
    }

    fn td(name: &str) -> TrustDomain {
        TrustDomain::new(name).unwrap()
    }

    #[tokio::test]
    async fn lookup_by_trust_domain() {
        let source = source_with(bundles(&["example.org"]), ResourceLimits::default(), None);

        let bundle = source.bundle_for_trust_domain(&td("example.org")).unwrap();
        assert_eq!(bundle.trust_domain(), &td("example.org"));
        assert!(matches!(
            source.bundle_for_trust_domain(&td("other.org")),
            Err(SourceError::BundleNotFound(ref d)) if *d == td("other.org")
        ));
        assert!(source.is_healthy());
    }

    #[tokio::test]
    async fn applied_updates_are_sequenced_and_duplicates_skipped() {
        let source = source_with(bundles(&["example.org"]), ResourceLimits::default(), None);
        let updates = source.updated();
        assert_eq!(updates.last(), 0);

        let next = bundles(&["example.org", "other.org"]);
        assert_eq!(
            source.inner.apply_update(next.clone()).unwrap(),
            Applied::Swapped(1)
        );
        assert_eq!(source.inner.apply_update(next).unwrap(), Applied::Unchanged);
        assert_eq!(updates.last(), 1);
        assert!(source.bundle_for_trust_domain(&td("other.org")).is_ok());
    }

    #[tokio::test]
    async fn rejected_update_keeps_snapshot_and_records_once() {
        let metrics = Arc::new(CountingRecorder::default());
        let limits = ResourceLimits {
            max_bundles: Some(1),
            max_bundle_bytes: None,
        };
        let recorder: Arc<dyn MetricsRecorder> = metrics.clone();
        let source = source_with(bundles(&["example.org"]), limits, Some(recorder));

        let err = source
            .inner
            .apply_update(bundles(&["a.org", "b.org"]))
            .unwrap_err();
        assert!(matches!(
            err,
            SourceError::ResourceLimitExceeded(ref e) if e.kind == LimitKind::MaxBundles
        ));
        assert_eq!(metrics.errors(MetricsErrorKind::LimitMaxBundles), 1);
        assert_eq!(metrics.errors(MetricsErrorKind::UpdateRejected), 1);
        assert_eq!(*metrics.updates.lock().unwrap(), 0);
        assert_eq!(source.bundle_set().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_source_refuses_everything() {
        let source = source_with(bundles(&["example.org"]), ResourceLimits::default(), None);
        source.close().await.unwrap();
        source.close().await.unwrap();

        let err = source
            .bundle_for_trust_domain(&td("example.org"))
            .unwrap_err();
        assert_eq!(err.to_string(), "JWT bundle source is closed");

        let err = source.fetch_jwt_svid(None, ["aud"]).await.unwrap_err();
        assert_eq!(err.to_string(), "JWT SVID source is closed");
        let audience: [&str; 0] = [];
        assert!(matches!(
            source.fetch_jwt_svid(None, audience).await,
            Err(SourceError::Closed("JWT SVID"))
        ));

        assert!(matches!(
            source.inner.apply_update(bundles(&["other.org"])),
            Err(SourceError::Closed(_))
        ));
        assert!(source.inner.client.is_closed());
        assert!(!source.is_healthy());
    }

    #[tokio::test]
    async fn empty_audience_is_an_invalid_argument() {
        let source = source_with(bundles(&["example.org"]), ResourceLimits::default(), None);
        let audience: [&str; 0] = [];
        assert!(matches!(
            source.fetch_jwt_svid(None, audience).await,
            Err(SourceError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn validate_uses_the_current_snapshot() {
        let key = EcKey::generate("k1");
        let seed: BundleSet<JwtBundle> = [key.bundle("example.org")].into_iter().collect();
        let source = source_with(seed, ResourceLimits::default(), None);

        let token = key.sign_jwt("spiffe://example.org/web", &["aud1", "aud2"], 300);
        let svid = JwtSvid::parse_insecure(&token).unwrap();

        source.validate(&svid, &["aud2"]).unwrap();
        assert!(matches!(
            source.validate(&svid, &["aud3"]),
            Err(SourceError::Rejected(validator::Rejection::AudienceMismatch { .. }))
        ));

        // Rotate to a key that did not sign the token.
        let rotated = EcKey::generate("k2");
        source
            .inner
            .apply_update([rotated.bundle("example.org")].into_iter().collect())
            .unwrap();
        assert!(matches!(
            source.validate(&svid, &["aud1"]),
            Err(SourceError::Rejected(validator::Rejection::Signature(_)))
        ));
    }
}
