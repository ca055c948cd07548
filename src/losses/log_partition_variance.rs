//! Log-partition variance (Zhang et al., 2023).
//!
//! Every complete trajectory gives an estimate of `log Z`:
//! `ζ(τ) = Σ log P_F − Σ log P_B − log R`, up to sign. At the optimum all estimates agree, so
//! the loss is their population variance over the batch. No `log Z` parameter is learned.

use ndarray::Array1;

use crate::containers::Trajectories;
use crate::nn::Gradients;
use crate::parametrizations::PfBasedParametrization;
use crate::{Error, Result};

use super::scoring::{self, TrajectoryScores};
use super::{finish, GradMode, Loss, LossOutput, NumericWarning, DEFAULT_LOG_REWARD_CLIP_MIN};

#[derive(Debug, Clone)]
pub struct LogPartitionVarianceConfig {
    pub on_policy: bool,
    pub log_reward_clip_min: f32,
    /// Fail on a batch of one trajectory instead of warning.
    pub fail_on_ill_conditioned: bool,
}

impl Default for LogPartitionVarianceConfig {
    fn default() -> Self {
        Self {
            on_policy: false,
            log_reward_clip_min: DEFAULT_LOG_REWARD_CLIP_MIN,
            fail_on_ill_conditioned: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogPartitionVariance<'a> {
    param: &'a PfBasedParametrization,
    config: LogPartitionVarianceConfig,
}

impl<'a> LogPartitionVariance<'a> {
    pub fn new(param: &'a PfBasedParametrization, config: LogPartitionVarianceConfig) -> Self {
        Self { param, config }
    }

    pub fn get_trajectories_scores(&self, trajectories: &Trajectories) -> Result<TrajectoryScores> {
        scoring::get_trajectories_scores(
            &self.param.pf,
            &self.param.pb,
            trajectories,
            self.config.on_policy,
            self.config.log_reward_clip_min,
        )
    }
}

impl Loss<Trajectories> for LogPartitionVariance<'_> {
    fn evaluate(&self, trajectories: &Trajectories, mode: GradMode) -> Result<LossOutput> {
        let mut warnings = Vec::new();
        if trajectories.len() == 1 {
            let w = NumericWarning::IllConditionedVariance { batch_size: 1 };
            if self.config.fail_on_ill_conditioned {
                return Err(Error::IllConditioned(w.to_string()));
            }
            warnings.push(w);
        }

        let scores = self.get_trajectories_scores(trajectories)?;
        let n = trajectories.len() as f32;
        let mean = scores.scores.sum() / n;
        let centered = scores.scores.mapv(|s| s - mean);
        let value = centered.mapv(|c| c * c).sum() / n;

        let mut grads = Gradients::new();
        if mode == GradMode::WithGrads {
            // the mean's own gradient sums to zero across the batch
            let grad_scores: Array1<f32> = centered.mapv(|c| 2.0 * c / n);
            scores.backward(
                &self.param.pf,
                &self.param.pb,
                trajectories,
                &grad_scores,
                &mut grads,
            )?;
        }
        warnings.extend(scores.steps.extreme_warning());
        finish("ZVar", value, trajectories.len(), grads, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{DiscreteEbm, DiscreteEbmConfig, Env, Preprocessor};
    use crate::estimators::{Direction, ProbabilityEstimator};
    use crate::losses::testing::check_grad;
    use crate::nn::Tabular;
    use crate::samplers::{SamplerConfig, TrajectoriesSampler};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::rc::Rc;

    fn ebm_param() -> PfBasedParametrization {
        let env: Rc<dyn Env> = Rc::new(
            DiscreteEbm::new(DiscreteEbmConfig {
                ndim: 3,
                preprocessor: Preprocessor::Enum,
                ..DiscreteEbmConfig::default()
            })
            .unwrap(),
        );
        let n_states = env.n_states().unwrap();
        let pf = Tabular::new(n_states, env.n_actions());
        for ((r, c), v) in pf.table().value_mut().indexed_iter_mut() {
            *v = ((r * 7 + c * 3) % 5) as f32 * 0.2;
        }
        let pb = Tabular::new(n_states, env.n_actions() - 1);
        PfBasedParametrization::new(
            ProbabilityEstimator::new(env.clone(), Box::new(pf), Direction::Forward).unwrap(),
            ProbabilityEstimator::new(env, Box::new(pb), Direction::Backward).unwrap(),
        )
        .unwrap()
    }

    fn sample(param: &PfBasedParametrization, n: usize, seed: u64) -> Trajectories {
        TrajectoriesSampler::new(&param.pf, SamplerConfig::default())
            .unwrap()
            .sample_trajectories(n, &mut ChaCha8Rng::seed_from_u64(seed))
            .unwrap()
    }

    #[test]
    fn single_trajectory_is_flagged() {
        let param = ebm_param();
        let trajs = sample(&param, 1, 0);
        let out = LogPartitionVariance::new(&param, LogPartitionVarianceConfig::default())
            .loss_and_grads(&trajs)
            .unwrap();
        assert_eq!(out.value, 0.0);
        assert!(out
            .warnings
            .contains(&NumericWarning::IllConditionedVariance { batch_size: 1 }));

        let strict = LogPartitionVarianceConfig {
            fail_on_ill_conditioned: true,
            ..LogPartitionVarianceConfig::default()
        };
        assert!(matches!(
            LogPartitionVariance::new(&param, strict).loss(&trajs),
            Err(Error::IllConditioned(_))
        ));
    }

    #[test]
    fn value_is_population_variance_of_scores() {
        let param = ebm_param();
        let trajs = sample(&param, 10, 3);
        let zvar = LogPartitionVariance::new(&param, LogPartitionVarianceConfig::default());
        let scores = zvar.get_trajectories_scores(&trajs).unwrap().scores;
        let n = scores.len() as f32;
        let mean = scores.sum() / n;
        let expected = scores.mapv(|s| (s - mean).powi(2)).sum() / n;
        let value = zvar.loss(&trajs).unwrap();
        assert!((value - expected).abs() < 1e-5);
        assert!(value >= 0.0);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let param = ebm_param();
        let trajs = sample(&param, 6, 12);
        let zvar = LogPartitionVariance::new(&param, LogPartitionVarianceConfig::default());
        let out = zvar.loss_and_grads(&trajs).unwrap();
        assert!(out.warnings.is_empty());
        let pf = param.pf.module().named_parameters()[0].1.clone();
        check_grad(&pf, &out, || zvar.loss(&trajs), 2e-2);
    }
}
