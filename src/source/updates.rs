use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::errors::SourceError;

/// Receiver for bundle set update notifications.
///
/// Every published update bumps a sequence number; the seed bundle set is
/// sequence `0`. A slow receiver may skip intermediate numbers.
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = spiffe_source::JwtSource::new().await?;
/// let mut updates = source.updated();
///
/// let seq = updates.changed().await?;
/// println!("bundles rotated, seq={seq}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct SourceUpdates {
    rx: watch::Receiver<u64>,
    closed: CancellationToken,
    label: &'static str,
}

impl SourceUpdates {
    pub(super) fn new(
        rx: watch::Receiver<u64>,
        closed: CancellationToken,
        label: &'static str,
    ) -> Self {
        Self { rx, closed, label }
    }

    /// Waits for the next update and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] once the source is closed or dropped.
    pub async fn changed(&mut self) -> Result<u64, SourceError> {
        let closed = SourceError::Closed(self.label);
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(closed),
            changed = self.rx.changed() => match changed {
                Ok(()) => Ok(*self.rx.borrow_and_update()),
                Err(_) => Err(closed),
            },
        }
    }

    /// The latest sequence number, without waiting.
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Waits until the sequence number satisfies `predicate`, checking the
    /// current one first.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the source closes first.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<u64, SourceError>
    where
        F: FnMut(u64) -> bool,
    {
        let current = *self.rx.borrow_and_update();
        if predicate(current) {
            return Ok(current);
        }
        loop {
            let seq = self.changed().await?;
            if predicate(seq) {
                return Ok(seq);
            }
        }
    }
}
