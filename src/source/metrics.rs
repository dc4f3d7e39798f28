use super::errors::MetricsErrorKind;

/// Hook for exporting source metrics.
///
/// Implementations must be cheap and non-blocking: they are called inline
/// from the watcher loop and from caller tasks.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// use spiffe_source::source::{MetricsErrorKind, MetricsRecorder};
///
/// #[derive(Default)]
/// struct Counters {
///     updates: AtomicU64,
///     reconnects: AtomicU64,
///     errors: AtomicU64,
/// }
///
/// impl MetricsRecorder for Counters {
///     fn record_update(&self) {
///         self.updates.fetch_add(1, Ordering::Relaxed);
///     }
///
///     fn record_reconnect(&self) {
///         self.reconnects.fetch_add(1, Ordering::Relaxed);
///     }
///
///     fn record_error(&self, _kind: MetricsErrorKind) {
///         self.errors.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait MetricsRecorder: Send + Sync {
    /// A new bundle set was published.
    fn record_update(&self);

    /// The watcher is about to back off and reconnect.
    ///
    /// Recorded once per backoff cycle. The seed fetch is not a reconnect.
    fn record_reconnect(&self);

    /// An error of the given kind occurred.
    fn record_error(&self, kind: MetricsErrorKind);
}
