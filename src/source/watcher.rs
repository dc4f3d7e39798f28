//! The watch/reconnect engine behind an identity source.
//!
//! One task per source keeps a bundle stream open, hands every update to the
//! source and reconnects with jittered exponential backoff when the stream
//! fails. The task only holds a [`Weak`] reference to the source, so it never
//! keeps a dropped source alive.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::config::ReconnectConfig;
use super::errors::{MetricsErrorKind, SourceError};
use super::identity::{Applied, Inner};
use super::kind::DocumentKind;
use super::metrics::MetricsRecorder;
use crate::prelude::{debug, info, warn};
use crate::workload_api::{BundleStream, WorkloadApiClient, WorkloadApiError};

/// Repeats of one error kind logged at WARN before dropping to DEBUG.
const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Observable state of the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Created, not yet running.
    Idle,
    /// Opening the bundle stream.
    Connecting,
    /// Receiving updates.
    Streaming,
    /// Waiting before the next connection attempt.
    Backoff,
    /// Stopped for good.
    Stopped,
}

/// Jittered exponential backoff between `min` and `max`.
#[derive(Debug, Clone)]
pub(super) struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub(super) fn new(config: ReconnectConfig) -> Self {
        let config = config.normalize();
        Self {
            current: config.min_backoff,
            min: config.min_backoff,
            max: config.max_backoff,
        }
    }

    /// The delay to wait before the next attempt.
    pub(super) fn delay(&self) -> Duration {
        self.current
    }

    /// Moves to the next, longer delay and returns it.
    pub(super) fn advance(&mut self) -> Duration {
        self.current = next_backoff(self.current, self.max);
        self.current
    }

    pub(super) fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Doubles `current`, clamps it to `max`, then adds up to 10% jitter and
/// clamps again.
///
/// Millisecond precision.
#[allow(clippy::cast_possible_truncation)]
fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = cur.saturating_mul(2).min(max);
    if base == 0 {
        return Duration::ZERO;
    }

    let jitter = base / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis(base.saturating_add(add).min(max))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKey {
    StreamConnect,
    StreamFailed,
    UpdateRejected,
}

/// Counts consecutive repeats of one error kind so that log noise can be
/// suppressed after the first few.
#[derive(Debug)]
pub(super) struct ErrorTracker {
    last: Option<ErrorKey>,
    consecutive: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(super) fn new(max_consecutive: u32) -> Self {
        Self {
            last: None,
            consecutive: 0,
            max_consecutive,
        }
    }

    /// Records an occurrence; returns whether it should be logged at WARN.
    fn record(&mut self, key: ErrorKey) -> bool {
        let should_warn = self.last != Some(key) || self.consecutive < self.max_consecutive;

        if self.last == Some(key) {
            self.consecutive += 1;
        } else {
            self.last = Some(key);
            self.consecutive = 1;
        }

        should_warn
    }

    fn reset(&mut self) {
        self.last = None;
        self.consecutive = 0;
    }

    fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Sleeps for `dur`; returns `true` if `token` was cancelled first.
pub(super) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// The source's handle on its watcher task.
pub(super) struct WatcherHandle {
    stop: CancellationToken,
    state: watch::Receiver<WatchState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherHandle {
    pub(super) fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Stops the watcher and joins it, aborting after `timeout`. Idempotent.
    pub(super) async fn stop(
        &self,
        timeout: Option<Duration>,
        metrics: Option<&dyn MetricsRecorder>,
    ) -> Result<(), SourceError> {
        self.stop.cancel();

        let Some(mut task) = self.task.lock().await.take() else {
            return Ok(());
        };

        let joined = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Watcher did not stop within {:?}; aborting", timeout);
                    task.abort();
                    let _unused: Result<_, _> = task.await;
                    return Err(SourceError::ShutdownTimeout);
                }
            },
            None => task.await,
        };

        if let Err(e) = joined {
            warn!("Error joining watcher task during shutdown: error={}", e);
            if let Some(m) = metrics {
                m.record_error(MetricsErrorKind::WatcherJoinFailed);
            }
        }
        Ok(())
    }
}

enum Flow {
    Stop,
    Reconnect,
}

struct Watcher<K: DocumentKind> {
    id: u64,
    source: Weak<Inner<K>>,
    client: WorkloadApiClient,
    stop: CancellationToken,
    state: watch::Sender<WatchState>,
    backoff: Backoff,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

/// Creates the handle for a watcher that [`start`] will later run.
///
/// `stop` must be a child of the source's cancellation token so that closing
/// or dropping the source stops the watcher.
pub(super) fn handle(stop: CancellationToken) -> (WatcherHandle, watch::Sender<WatchState>) {
    let (state_tx, state_rx) = watch::channel(WatchState::Idle);
    let handle = WatcherHandle {
        stop,
        state: state_rx,
        task: Mutex::new(None),
    };
    (handle, state_tx)
}

/// Spawns the watcher task for `source` and registers it with the source's
/// handle.
pub(super) async fn start<K: DocumentKind>(
    source: &Arc<Inner<K>>,
    state: watch::Sender<WatchState>,
    reconnect: ReconnectConfig,
) {
    let watcher = Watcher {
        id: fastrand::u64(..),
        source: Arc::downgrade(source),
        client: source.client().clone(),
        stop: source.watcher().stop.clone(),
        state,
        backoff: Backoff::new(reconnect),
        metrics: source.metrics_arc(),
    };
    let task = tokio::spawn(watcher.run());
    *source.watcher().task.lock().await = Some(task);
}

impl<K: DocumentKind> Watcher<K> {
    async fn run(mut self) {
        info!("Starting {} watcher: id={}", K::BUNDLE_LABEL, self.id);
        let mut errors = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            self.set_state(WatchState::Connecting);
            let opened = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                opened = K::stream_bundles(&self.client) => opened,
            };

            match opened {
                Ok(stream) => {
                    if errors.consecutive() > 0 {
                        info!(
                            "Stream connection recovered after {} consecutive failures: id={}",
                            errors.consecutive(),
                            self.id
                        );
                    }
                    errors.reset();
                    info!(
                        "Connected to Workload API {} stream: id={}",
                        K::BUNDLE_LABEL,
                        self.id
                    );
                    self.set_state(WatchState::Streaming);

                    if let Flow::Stop = self.drain(stream, &mut errors).await {
                        break;
                    }
                }
                Err(WorkloadApiError::Closed) => {
                    debug!("Workload API client closed; stopping watcher: id={}", self.id);
                    break;
                }
                Err(e) => {
                    if errors.record(ErrorKey::StreamConnect) {
                        warn!(
                            "Failed to open Workload API stream; retrying: id={}, error={}, backoff_ms={}",
                            self.id,
                            e,
                            self.backoff.delay().as_millis()
                        );
                    } else {
                        debug!(
                            "Failed to open Workload API stream (repeated); retrying: id={}, error={}, backoff_ms={}, consecutive_failures={}",
                            self.id,
                            e,
                            self.backoff.delay().as_millis(),
                            errors.consecutive()
                        );
                    }
                    self.record_error(MetricsErrorKind::StreamConnect);
                }
            }

            self.set_state(WatchState::Backoff);
            if let Some(m) = self.metrics.as_deref() {
                m.record_reconnect();
            }
            if sleep_or_cancel(&self.stop, self.backoff.delay()).await {
                break;
            }
            self.backoff.advance();
        }

        self.set_state(WatchState::Stopped);
        debug!("{} watcher stopped: id={}", K::BUNDLE_LABEL, self.id);
    }

    /// Applies updates until the stream fails or the watcher is stopped.
    async fn drain(
        &mut self,
        mut stream: BundleStream<K::Bundle>,
        errors: &mut ErrorTracker,
    ) -> Flow {
        loop {
            let item = tokio::select! {
                biased;
                () = self.stop.cancelled() => return Flow::Stop,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(bundle_set)) => {
                    if self.stop.is_cancelled() {
                        return Flow::Stop;
                    }
                    let Some(source) = self.source.upgrade() else {
                        return Flow::Stop;
                    };

                    match source.apply_update(bundle_set) {
                        Ok(applied) => {
                            if errors.consecutive() > 0 {
                                info!(
                                    "Update validation recovered after {} consecutive failures",
                                    errors.consecutive()
                                );
                                errors.reset();
                            }
                            self.backoff.reset();
                            match applied {
                                Applied::Swapped(seq) => {
                                    info!("{} set updated: seq={}", K::BUNDLE_LABEL, seq);
                                }
                                Applied::Unchanged => {
                                    debug!("{} set unchanged; skipped", K::BUNDLE_LABEL);
                                }
                            }
                        }
                        Err(SourceError::Closed(_)) => return Flow::Stop,
                        Err(e) => {
                            if errors.record(ErrorKey::UpdateRejected) {
                                warn!("Rejected {} set update: error={}", K::BUNDLE_LABEL, e);
                            } else {
                                debug!(
                                    "Rejected {} set update (repeated): error={}, consecutive_rejections={}",
                                    K::BUNDLE_LABEL,
                                    e,
                                    errors.consecutive()
                                );
                            }
                        }
                    }
                }
                Some(Err(WorkloadApiError::Closed)) => return Flow::Stop,
                Some(Err(WorkloadApiError::StreamEnded)) | None => {
                    self.log_stream_failure(errors, &WorkloadApiError::StreamEnded);
                    self.record_error(MetricsErrorKind::StreamEnded);
                    return Flow::Reconnect;
                }
                Some(Err(e)) => {
                    self.log_stream_failure(errors, &e);
                    self.record_error(MetricsErrorKind::StreamError);
                    return Flow::Reconnect;
                }
            }
        }
    }

    fn log_stream_failure(&self, errors: &mut ErrorTracker, error: &WorkloadApiError) {
        if errors.record(ErrorKey::StreamFailed) {
            warn!(
                "Workload API stream failed; reconnecting: id={}, error={}",
                self.id, error
            );
        } else {
            debug!(
                "Workload API stream failed (repeated); reconnecting: id={}, error={}, consecutive_failures={}",
                self.id,
                error,
                errors.consecutive()
            );
        }
    }

    fn set_state(&self, state: WatchState) {
        self.state.send_replace(state);
    }

    fn record_error(&self, kind: MetricsErrorKind) {
        if let Some(m) = self.metrics.as_deref() {
            m.record_error(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::jwt::JwtBundle;
    use crate::bundle::BundleSet;
    use crate::source::config::ResourceLimits;
    use crate::source::kind::Jwt;
    use crate::test_support::EcKey;

    fn config(min_ms: u64, max_ms: u64) -> ReconnectConfig {
        ReconnectConfig {
            min_backoff: Duration::from_millis(min_ms),
            max_backoff: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let mut backoff = Backoff::new(config(200, 10_000));
        assert_eq!(backoff.delay(), Duration::from_millis(200));

        let mut previous = backoff.delay();
        for _ in 0..20 {
            let next = backoff.advance();
            assert!(next >= previous, "{next:?} < {previous:?}");
            assert!(next <= Duration::from_secs(10));
            previous = next;
        }
        assert_eq!(backoff.delay(), Duration::from_secs(10));
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        for _ in 0..100 {
            let next = next_backoff(Duration::from_millis(1_000), Duration::from_secs(60));
            assert!(next >= Duration::from_millis(2_000));
            assert!(next <= Duration::from_millis(2_200));
        }
    }

    #[test]
    fn backoff_resets_to_min() {
        let mut backoff = Backoff::new(config(100, 1_000));
        backoff.advance();
        backoff.advance();
        assert!(backoff.delay() > Duration::from_millis(100));

        backoff.reset();
        assert_eq!(backoff.delay(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_normalizes_inverted_range() {
        let mut backoff = Backoff::new(config(1_000, 100));
        assert_eq!(backoff.delay(), Duration::from_millis(100));
        for _ in 0..10 {
            assert!(backoff.advance() <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn zero_backoff_stays_zero() {
        assert_eq!(next_backoff(Duration::ZERO, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn error_tracker_downgrades_repeats() {
        let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        assert!(tracker.record(ErrorKey::StreamConnect));
        assert!(tracker.record(ErrorKey::StreamConnect));
        assert!(tracker.record(ErrorKey::StreamConnect));
        assert!(!tracker.record(ErrorKey::StreamConnect));
        assert_eq!(tracker.consecutive(), 4);

        // A different kind starts over.
        assert!(tracker.record(ErrorKey::StreamFailed));
        assert_eq!(tracker.consecutive(), 1);

        tracker.reset();
        assert_eq!(tracker.consecutive(), 0);
        assert!(tracker.record(ErrorKey::StreamFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_or_cancel_reports_cancellation() {
        let token = CancellationToken::new();
        assert!(!sleep_or_cancel(&token, Duration::from_millis(10)).await);

        token.cancel();
        assert!(sleep_or_cancel(&token, Duration::from_secs(3600)).await);
    }

    fn bundles(kid: &str, domains: &[&str]) -> BundleSet<JwtBundle> {
        let key = EcKey::generate(kid);
        domains.iter().map(|td| key.bundle(td)).collect()
    }

    fn watcher_for(source: &Arc<Inner<Jwt>>, reconnect: ReconnectConfig) -> Watcher<Jwt> {
        let (state, _) = watch::channel(WatchState::Idle);
        Watcher {
            id: 1,
            source: Arc::downgrade(source),
            client: source.client().clone(),
            stop: CancellationToken::new(),
            state,
            backoff: Backoff::new(reconnect),
            metrics: None,
        }
    }

    fn stream_of(
        items: Vec<Result<BundleSet<JwtBundle>, WorkloadApiError>>,
    ) -> BundleStream<JwtBundle> {
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn applied_update_resets_backoff() {
        let source = Inner::<Jwt>::detached(
            bundles("k1", &["example.org"]),
            ResourceLimits::default(),
            None,
        );
        let mut watcher = watcher_for(&source, config(100, 10_000));
        let mut errors = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        // Failed streams without updates keep growing the delay.
        for _ in 0..3 {
            let flow = watcher
                .drain(stream_of(vec![Err(WorkloadApiError::StreamEnded)]), &mut errors)
                .await;
            assert!(matches!(flow, Flow::Reconnect));
            watcher.backoff.advance();
        }
        let grown = watcher.backoff.delay();
        assert!(grown >= Duration::from_millis(800), "{grown:?}");

        let update = bundles("k2", &["example.org"]);
        let flow = watcher
            .drain(
                stream_of(vec![Ok(update), Err(WorkloadApiError::StreamEnded)]),
                &mut errors,
            )
            .await;
        assert!(matches!(flow, Flow::Reconnect));
        assert_eq!(watcher.backoff.delay(), Duration::from_millis(100));
        assert_eq!(*source.updates().borrow(), 1);
    }

    #[tokio::test]
    async fn rejected_update_keeps_backoff() {
        let limits = ResourceLimits {
            max_bundles: Some(1),
            max_bundle_bytes: None,
        };
        let source = Inner::<Jwt>::detached(bundles("k1", &["example.org"]), limits, None);
        let mut watcher = watcher_for(&source, config(100, 10_000));
        let mut errors = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);
        watcher.backoff.advance();
        let grown = watcher.backoff.delay();

        let oversized = bundles("k2", &["a.org", "b.org"]);
        let flow = watcher
            .drain(stream_of(vec![Ok(oversized)]), &mut errors)
            .await;
        assert!(matches!(flow, Flow::Reconnect));
        assert_eq!(watcher.backoff.delay(), grown);
    }

    #[tokio::test]
    async fn stopped_watcher_drops_pending_updates() {
        let source = Inner::<Jwt>::detached(
            bundles("k1", &["example.org"]),
            ResourceLimits::default(),
            None,
        );
        let mut watcher = watcher_for(&source, config(100, 1_000));
        let mut errors = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);
        watcher.stop.cancel();

        let flow = watcher
            .drain(stream_of(vec![Ok(bundles("k2", &["other.org"]))]), &mut errors)
            .await;
        assert!(matches!(flow, Flow::Stop));
        assert_eq!(*source.updates().borrow(), 0);
    }

    #[tokio::test]
    async fn stopping_an_unstarted_watcher_is_a_no_op() {
        let (handle, _state) = handle(CancellationToken::new());
        assert_eq!(handle.state(), WatchState::Idle);
        assert!(handle.stop(Some(Duration::from_millis(10)), None).await.is_ok());
        assert!(handle.stop(None, None).await.is_ok());
    }
}
