use super::config::ResourceLimits;
use super::errors::{LimitExceeded, LimitKind, MetricsErrorKind};
use super::metrics::MetricsRecorder;
use crate::bundle::{Bundle, BundleSet};

/// Checks `bundle_set` against `limits`, stopping at the first violation.
pub(super) fn check<B: Bundle>(
    bundle_set: &BundleSet<B>,
    limits: ResourceLimits,
) -> Result<(), LimitExceeded> {
    if let Some(limit) = limits.max_bundles {
        let actual = bundle_set.len();
        if actual > limit {
            return Err(LimitExceeded {
                kind: LimitKind::MaxBundles,
                limit,
                actual,
            });
        }
    }

    if let Some(limit) = limits.max_bundle_bytes {
        // Enforced per bundle, not summed over the set.
        for (_, bundle) in bundle_set.iter() {
            let actual = bundle.material_len();
            if actual > limit {
                return Err(LimitExceeded {
                    kind: LimitKind::MaxBundleBytes,
                    limit,
                    actual,
                });
            }
        }
    }

    Ok(())
}

/// As [`check`], recording the limit-specific metric on a violation.
pub(super) fn check_and_record<B: Bundle>(
    bundle_set: &BundleSet<B>,
    limits: ResourceLimits,
    metrics: Option<&dyn MetricsRecorder>,
) -> Result<(), LimitExceeded> {
    check(bundle_set, limits).inspect_err(|exceeded| {
        if let Some(m) = metrics {
            m.record_error(MetricsErrorKind::from(exceeded.kind));
        }
    })
}
