//! Trajectory balance (Malkin et al., 2022).
//!
//! For a complete trajectory `τ = (s_0 → … → s_n → s_f)`:
//!
//! `score(τ) = log Z + Σ_t log P_F(a_t | s_t) − Σ_t log P_B(a_t | s_{t+1}) − log R(s_n)`
//!
//! and the loss is the batch mean of `score²` (or of a Huber penalty on `score`).

use ndarray::Array1;

use crate::containers::Trajectories;
use crate::math::huber;
use crate::nn::Gradients;
use crate::parametrizations::TbParametrization;
use crate::{Error, Result};

use super::scoring::{self, StepLogProbs, TrajectoryScores};
use super::{finish, GradMode, Loss, LossOutput, DEFAULT_LOG_REWARD_CLIP_MIN};

#[derive(Debug, Clone)]
pub struct TrajectoryBalanceConfig {
    /// Reuse log-probabilities recorded at sampling time for the loss value.
    pub on_policy: bool,
    pub log_reward_clip_min: f32,
    /// Use a Huber penalty with this threshold instead of the square.
    pub huber_delta: Option<f32>,
}

impl Default for TrajectoryBalanceConfig {
    fn default() -> Self {
        Self {
            on_policy: false,
            log_reward_clip_min: DEFAULT_LOG_REWARD_CLIP_MIN,
            huber_delta: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrajectoryBalance<'a> {
    param: &'a TbParametrization,
    config: TrajectoryBalanceConfig,
}

impl<'a> TrajectoryBalance<'a> {
    pub fn new(param: &'a TbParametrization, config: TrajectoryBalanceConfig) -> Result<Self> {
        if let Some(delta) = config.huber_delta {
            if !(delta > 0.0) {
                return Err(Error::Configuration(format!(
                    "huber_delta must be positive, got {delta}"
                )));
            }
        }
        Ok(Self { param, config })
    }

    pub fn config(&self) -> &TrajectoryBalanceConfig {
        &self.config
    }

    pub fn get_pfs_and_pbs(&self, trajectories: &Trajectories) -> Result<StepLogProbs> {
        scoring::get_pfs_and_pbs(
            &self.param.pf,
            &self.param.pb,
            trajectories,
            self.config.on_policy,
        )
    }

    /// Scores without `log Z`: `Σ log P_F − Σ log P_B − clipped log R`.
    pub fn get_trajectories_scores(&self, trajectories: &Trajectories) -> Result<TrajectoryScores> {
        scoring::get_trajectories_scores(
            &self.param.pf,
            &self.param.pb,
            trajectories,
            self.config.on_policy,
            self.config.log_reward_clip_min,
        )
    }

    /// Per-trajectory TB residuals, `log Z` included.
    pub fn residuals(&self, trajectories: &Trajectories) -> Result<Array1<f32>> {
        let log_z = self.param.log_z.value();
        Ok(self
            .get_trajectories_scores(trajectories)?
            .scores
            .mapv(|s| s + log_z))
    }

    fn penalty(&self, r: f32) -> (f32, f32) {
        match self.config.huber_delta {
            Some(delta) => huber(r, delta),
            None => (r * r, 2.0 * r),
        }
    }
}

impl Loss<Trajectories> for TrajectoryBalance<'_> {
    fn evaluate(&self, trajectories: &Trajectories, mode: GradMode) -> Result<LossOutput> {
        let scores = self.get_trajectories_scores(trajectories)?;
        let log_z = self.param.log_z.value();
        let n = trajectories.len() as f32;

        let mut value = 0.0f32;
        let mut grad_scores = Array1::<f32>::zeros(trajectories.len());
        for (b, &s) in scores.scores.iter().enumerate() {
            let (v, d) = self.penalty(s + log_z);
            value += v;
            grad_scores[b] = d / n;
        }
        value /= n;

        let mut grads = Gradients::new();
        if mode == GradMode::WithGrads {
            self.param.log_z.backward(grad_scores.sum(), &mut grads);
            // on-policy values were recorded, not computed: re-evaluate so P_F gets gradients
            scores.backward(
                &self.param.pf,
                &self.param.pb,
                trajectories,
                &grad_scores,
                &mut grads,
            )?;
        }
        let warnings = scores.steps.extreme_warning().into_iter().collect();
        finish("TB", value, trajectories.len(), grads, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, HyperGrid, HyperGridConfig, Preprocessor};
    use crate::estimators::{Direction, LogZEstimator, ProbabilityEstimator};
    use crate::losses::testing::check_grad;
    use crate::nn::{Tabular, Uniform};
    use crate::samplers::{SamplerConfig, TrajectoriesSampler};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::rc::Rc;

    fn enum_grid() -> Rc<dyn Env> {
        Rc::new(
            HyperGrid::new(HyperGridConfig {
                ndim: 2,
                height: 3,
                preprocessor: Preprocessor::Enum,
                ..HyperGridConfig::default()
            })
            .unwrap(),
        )
    }

    fn tabular_tb(env: &Rc<dyn Env>, log_z: f32) -> TbParametrization {
        let pf_table = Tabular::new(9, 3);
        pf_table.table().value_mut()[[0, 0]] = 0.5;
        pf_table.table().value_mut()[[4, 2]] = -0.3;
        let pb_table = Tabular::new(9, 2);
        pb_table.table().value_mut()[[4, 1]] = 0.8;
        TbParametrization::new(
            ProbabilityEstimator::new(env.clone(), Box::new(pf_table), Direction::Forward).unwrap(),
            ProbabilityEstimator::new(env.clone(), Box::new(pb_table), Direction::Backward)
                .unwrap(),
            LogZEstimator::new(log_z),
        )
        .unwrap()
    }

    fn sample(param: &TbParametrization, n: usize, seed: u64) -> Trajectories {
        TrajectoriesSampler::new(&param.pf, SamplerConfig::default())
            .unwrap()
            .sample_trajectories(n, &mut ChaCha8Rng::seed_from_u64(seed))
            .unwrap()
    }

    #[test]
    fn uniform_policies_give_closed_form_residual() {
        let env = enum_grid();
        let param = TbParametrization::new(
            ProbabilityEstimator::new(env.clone(), Box::new(Uniform::new(3)), Direction::Forward)
                .unwrap(),
            ProbabilityEstimator::new(env.clone(), Box::new(Uniform::new(2)), Direction::Backward)
                .unwrap(),
            LogZEstimator::new(1.5),
        )
        .unwrap();
        // s0 -exit-> : one forward step with 3 valid actions, no backward step
        let trajs = Trajectories::new(
            env.clone(),
            vec![crate::containers::Trajectory {
                states: vec![env.s0()],
                actions: vec![2],
                log_pfs: None,
                log_reward: env.log_reward(&env.s0()),
            }],
        )
        .unwrap();
        let tb = TrajectoryBalance::new(&param, TrajectoryBalanceConfig::default()).unwrap();
        let r = tb.residuals(&trajs).unwrap()[0];
        let expected = 1.5 + (1.0f32 / 3.0).ln() - env.log_reward(&env.s0());
        assert!((r - expected).abs() < 1e-5);
        assert!((tb.loss(&trajs).unwrap() - expected * expected).abs() < 1e-4);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let env = enum_grid();
        let param = tabular_tb(&env, 0.3);
        let trajs = sample(&param, 6, 2);
        let tb = TrajectoryBalance::new(&param, TrajectoryBalanceConfig::default()).unwrap();
        let out = tb.loss_and_grads(&trajs).unwrap();
        let loss = || tb.loss(&trajs);
        check_grad(param.log_z.param(), &out, loss, 2e-2);
        let pf_params = param.pf.module().named_parameters();
        check_grad(&pf_params[0].1, &out, loss, 2e-2);
        let pb_params = param.pb.module().named_parameters();
        check_grad(&pb_params[0].1, &out, loss, 2e-2);
    }

    #[test]
    fn huber_gradients_match_finite_differences() {
        let env = enum_grid();
        let param = tabular_tb(&env, 4.0);
        let trajs = sample(&param, 5, 9);
        let cfg = TrajectoryBalanceConfig {
            huber_delta: Some(1.0),
            ..TrajectoryBalanceConfig::default()
        };
        let tb = TrajectoryBalance::new(&param, cfg).unwrap();
        let out = tb.loss_and_grads(&trajs).unwrap();
        check_grad(param.log_z.param(), &out, || tb.loss(&trajs), 2e-2);
    }

    #[test]
    fn on_policy_gradients_equal_off_policy() {
        let env = enum_grid();
        let param = tabular_tb(&env, 0.1);
        let trajs = sample(&param, 8, 5);
        let on = TrajectoryBalance::new(
            &param,
            TrajectoryBalanceConfig {
                on_policy: true,
                ..TrajectoryBalanceConfig::default()
            },
        )
        .unwrap()
        .loss_and_grads(&trajs)
        .unwrap();
        let off = TrajectoryBalance::new(&param, TrajectoryBalanceConfig::default())
            .unwrap()
            .loss_and_grads(&trajs)
            .unwrap();
        assert_eq!(on.value, off.value);
        let pf = &param.pf.module().named_parameters()[0].1;
        assert_eq!(on.grads.get(pf), off.grads.get(pf));
    }

    #[test]
    fn rejects_non_positive_huber_delta() {
        let env = enum_grid();
        let param = tabular_tb(&env, 0.0);
        let cfg = TrajectoryBalanceConfig {
            huber_delta: Some(0.0),
            ..TrajectoryBalanceConfig::default()
        };
        assert!(matches!(
            TrajectoryBalance::new(&param, cfg),
            Err(Error::Configuration(_))
        ));
    }
}
