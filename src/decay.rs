//! Recency Decay
//!
//! Evidence on an edge loses weight exponentially with the time since its
//! last update:
//!
//! ```text
//! factor = 2^(-Δt / half_life)      Δt = max(0, now - last_updated)
//! ```
//!
//! Decay is applied by multiplying both pseudo-counts by the factor, which
//! keeps the posterior mean and shrinks the effective sample size. A stale
//! edge therefore looks *less certain*, not *worse*, and the exploration
//! bonus of the ranking policies pulls it back into play.

use chrono::{DateTime, Utc};

/// Smallest value a Beta pseudo-count may take before sampling or division
pub const MIN_PSEUDO_COUNT: f64 = 1e-6;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Exponential decay factor in `(0, 1]`
///
/// Returns 1.0 when there is no history (`last_updated` is `None`) or when
/// the half-life is non-positive or not finite.
pub fn decay_factor(
    last_updated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    half_life_days: f64,
) -> f64 {
    let Some(last) = last_updated else {
        return 1.0;
    };
    if !half_life_days.is_finite() || half_life_days <= 0.0 {
        return 1.0;
    }

    let elapsed_secs = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
    let half_life_secs = half_life_days * SECONDS_PER_DAY;
    let factor = (-elapsed_secs / half_life_secs).exp2();

    if factor.is_nan() {
        1.0
    } else {
        factor.clamp(f64::MIN_POSITIVE, 1.0)
    }
}

/// Shrink both pseudo-counts by `factor`, clamped to the positive floor
pub fn decay_counts(alpha: f64, beta: f64, factor: f64) -> (f64, f64) {
    (
        clamp_count(alpha * factor),
        clamp_count(beta * factor),
    )
}

/// Keep a pseudo-count strictly positive and finite
pub fn clamp_count(value: f64) -> f64 {
    if value.is_finite() {
        value.max(MIN_PSEUDO_COUNT)
    } else if value == f64::INFINITY {
        f64::MAX
    } else {
        MIN_PSEUDO_COUNT
    }
}
