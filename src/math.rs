//! Log-space numerics shared by estimators and losses.
//!
//! Every aggregation over flows goes through [`logsumexp`], which shifts by the maximum before
//! exponentiating. Masked entries are represented as `-inf` and contribute exactly zero mass.

/// `log(sum(exp(xs)))`, stable under large magnitudes.
///
/// Returns `-inf` for an empty slice or when every entry is `-inf`.
pub fn logsumexp(xs: &[f32]) -> f32 {
    let m = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if m == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    if m == f32::INFINITY {
        return f32::INFINITY;
    }
    let s: f32 = xs.iter().map(|&x| (x - m).exp()).sum();
    m + s.ln()
}

/// Softmax weights of `xs`, i.e. the gradient of [`logsumexp`] with respect to `xs`.
///
/// Entries equal to `-inf` get weight 0. All-`-inf` input yields all zeros.
pub fn softmax(xs: &[f32]) -> Vec<f32> {
    let lse = logsumexp(xs);
    if !lse.is_finite() {
        return vec![0.0; xs.len()];
    }
    xs.iter().map(|&x| (x - lse).exp()).collect()
}

/// Log-softmax over the entries where `mask` is true; masked entries are `-inf`.
///
/// `logits` and `mask` must have the same length and `mask` must contain at least one `true`.
pub fn log_softmax_masked(logits: &[f32], mask: &[bool]) -> Vec<f32> {
    debug_assert_eq!(logits.len(), mask.len());
    debug_assert!(mask.iter().any(|&m| m));
    let masked: Vec<f32> = logits
        .iter()
        .zip(mask)
        .map(|(&x, &m)| if m { x } else { f32::NEG_INFINITY })
        .collect();
    let lse = logsumexp(&masked);
    masked
        .iter()
        .map(|&x| if x == f32::NEG_INFINITY { x } else { x - lse })
        .collect()
}

/// Probabilities matching [`log_softmax_masked`] (masked entries are exactly 0).
pub fn softmax_masked(logits: &[f32], mask: &[bool]) -> Vec<f32> {
    log_softmax_masked(logits, mask)
        .into_iter()
        .map(|lp| if lp == f32::NEG_INFINITY { 0.0 } else { lp.exp() })
        .collect()
}

/// Huber penalty and its derivative at `x`.
///
/// Quadratic `x^2` inside `|x| <= delta` (matching the squared loss used elsewhere), linear
/// `delta * (2|x| - delta)` outside.
#[inline]
pub fn huber(x: f32, delta: f32) -> (f32, f32) {
    let a = x.abs();
    if a <= delta {
        (x * x, 2.0 * x)
    } else {
        (delta * (2.0 * a - delta), 2.0 * delta * x.signum())
    }
}
