//! Gamma and Beta Sampling
//!
//! Thompson sampling needs one posterior draw per arm per call. The draws
//! are built from scratch rather than through inverse-CDF lookups so the
//! sampler stays cheap and exact for fractional (decayed) pseudo-counts:
//!
//! - `sample_gamma`: Marsaglia-Tsang rejection sampler, scale 1
//! - `sample_beta`: `X / (X + Y)` with `X ~ Gamma(a)`, `Y ~ Gamma(b)`

use crate::decay::MIN_PSEUDO_COUNT;
use rand::Rng;
use std::f64::consts::PI;

/// Standard normal draw via Box-Muller
fn sample_standard_normal(rng: &mut impl Rng) -> f64 {
    // 1 - U keeps u1 in (0, 1] so ln() stays finite
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Draw from Gamma(shape, 1) using Marsaglia & Tsang (2000)
///
/// Shapes below 1 use the boost `Gamma(shape) = Gamma(shape + 1) * U^(1/shape)`.
/// Non-positive or non-finite shapes are floored to [`MIN_PSEUDO_COUNT`].
pub fn sample_gamma(shape: f64, rng: &mut impl Rng) -> f64 {
    let shape = if shape.is_finite() {
        shape.max(MIN_PSEUDO_COUNT)
    } else {
        MIN_PSEUDO_COUNT
    };

    if shape < 1.0 {
        let u: f64 = rng.gen();
        return sample_gamma(shape + 1.0, rng) * u.powf(1.0 / shape);
    }

    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();

    loop {
        let x = sample_standard_normal(rng);
        let v = 1.0 + c * x;
        if v <= 0.0 {
            continue;
        }
        let v = v * v * v;
        let u: f64 = rng.gen();

        // Squeeze test avoids the log most of the time
        if u < 1.0 - 0.0331 * x.powi(4) {
            return d * v;
        }
        if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}

/// Draw from Beta(a, b); always in `[0, 1]`
pub fn sample_beta(a: f64, b: f64, rng: &mut impl Rng) -> f64 {
    let a = if a.is_finite() { a.max(MIN_PSEUDO_COUNT) } else { MIN_PSEUDO_COUNT };
    let b = if b.is_finite() { b.max(MIN_PSEUDO_COUNT) } else { MIN_PSEUDO_COUNT };

    let x = sample_gamma(a, rng);
    let y = sample_gamma(b, rng);
    let total = x + y;

    if total > 0.0 && total.is_finite() {
        (x / total).clamp(0.0, 1.0)
    } else {
        // Both draws underflowed: fall back to the mean
        a / (a + b)
    }
}
