//! Evaluation against the exact target distribution (small envs only).
//!
//! For an enumerable env the target is `π*(x) = R(x) / Z` over terminating states. These helpers
//! compare the empirical terminating-state distribution of a trained forward policy against it
//! and report the exact scalars they compute.

use ndarray::{Array1, ArrayView1};
use rand::Rng;
use tracing::info;

use crate::env::{Env, State};
use crate::math::logsumexp;
use crate::parametrizations::Parametrization;
use crate::{Error, Result};

/// Exact `log Z = logsumexp_x log R(x)` over terminating states.
pub fn true_log_partition(env: &dyn Env) -> Result<f32> {
    let states = enumerable(env)?;
    let log_r: Vec<f32> = states.iter().map(|s| env.log_reward(s)).collect();
    Ok(logsumexp(&log_r))
}

/// Exact target pmf `R(x) / Z`, indexed by `env.state_index`. Non-terminating states get 0.
pub fn true_distribution(env: &dyn Env) -> Result<Array1<f32>> {
    let states = enumerable(env)?;
    let n = env
        .n_states()
        .ok_or_else(|| Error::Configuration("env does not enumerate its states".into()))?;
    let log_z = true_log_partition(env)?;
    let mut pmf = Array1::<f32>::zeros(n);
    for s in &states {
        let i = env
            .state_index(s)
            .ok_or_else(|| Error::Invariant(format!("state {:?} has no index", s.coords())))?;
        pmf[i] = (env.log_reward(s) - log_z).exp();
    }
    Ok(pmf)
}

/// Normalization tolerance handed to `logp` by [`validate`].
pub const JS_TOL: f32 = 1e-6;

fn enumerable(env: &dyn Env) -> Result<Vec<State>> {
    env.terminating_states()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Configuration("env does not enumerate its terminating states".into()))
}

fn check_pair(p: &ArrayView1<f32>, q: &ArrayView1<f32>) -> Result<()> {
    if p.is_empty() || p.len() != q.len() {
        return Err(Error::Shape("p and q must be non-empty and the same length"));
    }
    if p.iter().chain(q.iter()).any(|&x| x < 0.0 || !x.is_finite()) {
        return Err(Error::Invariant("p and q must be finite and nonnegative".into()));
    }
    Ok(())
}

/// `Σ |p − q|` (total variation times two).
pub fn l1_distance(p: &ArrayView1<f32>, q: &ArrayView1<f32>) -> Result<f32> {
    check_pair(p, q)?;
    Ok(p.iter().zip(q).map(|(a, b)| (a - b).abs()).sum())
}

/// Jensen–Shannon divergence in nats, `0 ≤ JS ≤ ln 2`. Inputs are normalized first.
///
/// Wraps `logp::jensen_shannon_divergence`; `tol` is its normalization tolerance.
pub fn jensen_shannon_divergence(
    p: &ArrayView1<f32>,
    q: &ArrayView1<f32>,
    tol: f32,
) -> Result<f32> {
    check_pair(p, q)?;
    if !tol.is_finite() || tol <= 0.0 {
        return Err(Error::Configuration("tol must be positive and finite".into()));
    }
    let sp: f64 = p.iter().map(|&x| x as f64).sum();
    let sq: f64 = q.iter().map(|&x| x as f64).sum();
    if sp <= 0.0 || sq <= 0.0 {
        return Err(Error::Invariant("p and q must have positive total mass".into()));
    }
    let pf64: Vec<f64> = p.iter().map(|&x| x as f64 / sp).collect();
    let qf64: Vec<f64> = q.iter().map(|&x| x as f64 / sq).collect();
    let js = logp::jensen_shannon_divergence(&pf64, &qf64, tol as f64)
        .map_err(|_| Error::Invariant("logp::jensen_shannon_divergence failed".into()))?;
    Ok(js as f32)
}

/// Distances between a parametrization's sampled terminating states and the exact target.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub n_samples: usize,
    pub l1: f32,
    pub jsd: f32,
    /// `learned log Z − true log Z`, for TB parametrizations.
    pub log_z_diff: Option<f32>,
}

/// Sample `n_samples` terminating states and compare them to `R / Z`.
pub fn validate(
    param: &Parametrization,
    n_samples: usize,
    rng: &mut impl Rng,
) -> Result<ValidationReport> {
    let env = param.env().clone();
    let target = true_distribution(env.as_ref())?;
    let pi = param.pi(env.as_ref(), n_samples, rng)?;
    let empirical = pi
        .pmf()
        .ok_or_else(|| Error::Configuration("env does not enumerate its states".into()))?;
    let l1 = l1_distance(&empirical.view(), &target.view())?;
    let jsd = jensen_shannon_divergence(&empirical.view(), &target.view(), JS_TOL)?;
    let log_z_diff = match param {
        Parametrization::TrajectoryBalance(p) => {
            Some(p.log_z.value() - true_log_partition(env.as_ref())?)
        }
        _ => None,
    };
    info!(kind = %param.kind(), n_samples, l1, jsd, ?log_z_diff, "validation");
    Ok(ValidationReport {
        n_samples,
        l1,
        jsd,
        log_z_diff,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{DiscreteEbm, DiscreteEbmConfig, HyperGrid, HyperGridConfig};
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn hypergrid_target_sums_to_one() {
        let env = HyperGrid::new(HyperGridConfig {
            ndim: 2,
            height: 4,
            ..HyperGridConfig::default()
        })
        .unwrap();
        let pmf = true_distribution(&env).unwrap();
        assert_eq!(pmf.len(), 16);
        assert!((pmf.sum() - 1.0).abs() < 1e-5);
        let log_z = true_log_partition(&env).unwrap();
        let z: f32 = (0..4)
            .flat_map(|i| (0..4).map(move |j| State(vec![i, j])))
            .map(|s| env.log_reward(&s).exp())
            .sum();
        assert!((log_z - z.ln()).abs() < 1e-5);
    }

    #[test]
    fn ebm_target_lives_on_full_states() {
        let env = DiscreteEbm::new(DiscreteEbmConfig {
            ndim: 2,
            ..DiscreteEbmConfig::default()
        })
        .unwrap();
        let pmf = true_distribution(&env).unwrap();
        let support = pmf.iter().filter(|&&p| p > 0.0).count();
        assert_eq!(support, 4);
    }

    #[test]
    fn divergences_of_known_pairs() {
        let p = array![1.0f32, 0.0];
        let q = array![0.0f32, 1.0];
        assert!((l1_distance(&p.view(), &q.view()).unwrap() - 2.0).abs() < 1e-6);
        let js = jensen_shannon_divergence(&p.view(), &q.view(), JS_TOL).unwrap();
        assert!((js - std::f32::consts::LN_2).abs() < 1e-6);
        assert!(matches!(
            l1_distance(&p.view(), &array![1.0f32].view()),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn js_normalizes_counts_and_rejects_bad_tolerance() {
        let counts = array![2.0f32, 6.0];
        let pmf = array![0.25f32, 0.75];
        let js = jensen_shannon_divergence(&counts.view(), &pmf.view(), JS_TOL).unwrap();
        assert!(js.abs() < 1e-6);
        for tol in [0.0f32, -1.0, f32::NAN] {
            assert!(matches!(
                jensen_shannon_divergence(&counts.view(), &pmf.view(), tol),
                Err(Error::Configuration(_))
            ));
        }
        let empty = array![0.0f32, 0.0];
        assert!(matches!(
            jensen_shannon_divergence(&empty.view(), &pmf.view(), JS_TOL),
            Err(Error::Invariant(_))
        ));
    }

    proptest! {
        #[test]
        fn js_is_symmetric_and_bounded(
            p in prop::collection::vec(0.01f32..1.0, 2..8),
            seed in 0u64..1000,
        ) {
            let q: Vec<f32> = p
                .iter()
                .enumerate()
                .map(|(i, x)| ((i as u64 * 31 + seed) % 17) as f32 * 0.1 + x * 0.5)
                .collect();
            let p = Array1::from_vec(p);
            let q = Array1::from_vec(q);
            let a = jensen_shannon_divergence(&p.view(), &q.view(), JS_TOL).unwrap();
            let b = jensen_shannon_divergence(&q.view(), &p.view(), JS_TOL).unwrap();
            prop_assert!((a - b).abs() < 1e-6);
            prop_assert!(a >= 0.0 && a <= std::f32::consts::LN_2 + 1e-6);
        }
    }
}
