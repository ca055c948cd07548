//! Detailed balance (Bengio et al., 2023).
//!
//! For each transition `s --a--> s'`:
//!
//! - non-terminal: `r = log F(s) + log P_F(a | s) − log F(s') − log P_B(a | s')`
//! - terminal (exit from `s`): `r = log F(s) + log P_F(exit | s) − max(log R(s), clip)`
//!
//! The loss is the batch mean of `r²`.

use ndarray::Array1;

use crate::containers::Transitions;
use crate::env::State;
use crate::nn::Gradients;
use crate::parametrizations::DbParametrization;
use crate::{Error, Result};

use super::{
    finish, GradMode, Loss, LossOutput, NumericWarning, DEFAULT_LOG_REWARD_CLIP_MIN,
    EXTREME_LOG_PROB,
};

#[derive(Debug, Clone)]
pub struct DetailedBalanceConfig {
    /// Use the `log_pf` recorded on each transition for the loss value.
    pub on_policy: bool,
    /// Lower clamp on terminal log-rewards.
    pub log_reward_clip_min: f32,
}

impl Default for DetailedBalanceConfig {
    fn default() -> Self {
        Self {
            on_policy: false,
            log_reward_clip_min: DEFAULT_LOG_REWARD_CLIP_MIN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetailedBalance<'a> {
    param: &'a DbParametrization,
    config: DetailedBalanceConfig,
}

struct Residuals {
    values: Array1<f32>,
    grads: Gradients,
    min_log_prob: f32,
}

impl<'a> DetailedBalance<'a> {
    pub fn new(param: &'a DbParametrization, config: DetailedBalanceConfig) -> Self {
        Self { param, config }
    }

    /// Per-transition residuals, in batch order.
    pub fn residuals(&self, transitions: &Transitions) -> Result<Array1<f32>> {
        Ok(self.compute(transitions, GradMode::ValueOnly)?.values)
    }

    fn compute(&self, transitions: &Transitions, mode: GradMode) -> Result<Residuals> {
        let DbParametrization { pf, pb, log_f } = self.param;
        if pf.env().n_actions() != transitions.env().n_actions() {
            return Err(Error::Configuration(format!(
                "estimators expect {} actions, transitions have {}",
                pf.env().n_actions(),
                transitions.env().n_actions()
            )));
        }
        if transitions.is_empty() {
            return Err(Error::Invariant("empty transition batch".into()));
        }
        let m = transitions.len();

        let states: Vec<State> = transitions.iter().map(|t| t.state.clone()).collect();
        let actions: Vec<usize> = transitions.iter().map(|t| t.action).collect();
        let recorded: Option<Vec<f32>> = if self.config.on_policy {
            let lp = transitions.iter().map(|t| t.log_pf).collect::<Option<Vec<f32>>>();
            Some(lp.ok_or_else(|| {
                Error::Invariant("on-policy DB needs transitions with recorded log_pf".into())
            })?)
        } else {
            None
        };
        let pf_eval = match (&recorded, mode) {
            (Some(_), GradMode::ValueOnly) => None,
            _ => Some(pf.evaluate(&states, &actions)?),
        };
        let log_pfs: Array1<f32> = match (&recorded, &pf_eval) {
            (Some(lp), _) => Array1::from_vec(lp.clone()),
            (None, Some(eval)) => eval.chosen(),
            (None, None) => return Err(Error::Invariant("no forward log-probabilities".into())),
        };
        let flows = log_f.evaluate(&states)?;

        let live: Vec<usize> = (0..m)
            .filter(|&i| !transitions.as_slice()[i].is_done())
            .collect();
        let next_states: Vec<State> = live
            .iter()
            .filter_map(|&i| transitions.as_slice()[i].next_state.clone())
            .collect();
        let live_actions: Vec<usize> = live.iter().map(|&i| actions[i]).collect();
        let pb_eval = pb.evaluate(&next_states, &live_actions)?;
        let log_pbs = pb_eval.chosen();
        let next_flows = log_f.evaluate(&next_states)?;

        let mut values = Array1::<f32>::zeros(m);
        for (i, tr) in transitions.iter().enumerate() {
            values[i] = flows.values[i] + log_pfs[i];
            if tr.is_done() {
                let log_r = tr.log_reward.ok_or_else(|| {
                    Error::Invariant(format!("terminal transition {i} has no log-reward"))
                })?;
                values[i] -= log_r.max(self.config.log_reward_clip_min);
            }
        }
        for (k, &i) in live.iter().enumerate() {
            values[i] -= next_flows.values[k] + log_pbs[k];
        }

        let min_log_prob = log_pfs
            .iter()
            .chain(log_pbs.iter())
            .copied()
            .fold(f32::INFINITY, f32::min);

        let mut grads = Gradients::new();
        if mode == GradMode::WithGrads {
            let g: Vec<f32> = values.iter().map(|r| 2.0 * r / m as f32).collect();
            let g_live: Vec<f32> = live.iter().map(|&i| -g[i]).collect();
            if let Some(eval) = &pf_eval {
                pf.backward(eval, &g, &mut grads);
            }
            log_f.backward(&flows, &g, &mut grads);
            log_f.backward(&next_flows, &g_live, &mut grads);
            pb.backward(&pb_eval, &g_live, &mut grads);
        }
        Ok(Residuals {
            values,
            grads,
            min_log_prob,
        })
    }
}

impl Loss<Transitions> for DetailedBalance<'_> {
    fn evaluate(&self, transitions: &Transitions, mode: GradMode) -> Result<LossOutput> {
        let res = self.compute(transitions, mode)?;
        let value = res.values.mapv(|r| r * r).mean().unwrap_or(f32::NAN);
        let mut warnings = Vec::new();
        if res.min_log_prob < EXTREME_LOG_PROB {
            warnings.push(NumericWarning::ExtremeLogProbability {
                min: res.min_log_prob,
            });
        }
        finish("DB", value, transitions.len(), res.grads, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::{Trajectories, Transition};
    use crate::env::{Env, HyperGrid, HyperGridConfig, Preprocessor};
    use crate::estimators::{Direction, LogStateFlowEstimator, ProbabilityEstimator};
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

    fn tabular_db(env: &Rc<dyn Env>, forward_looking: bool) -> DbParametrization {
        let pf = Tabular::new(9, 3);
        pf.table().value_mut()[[0, 1]] = 0.4;
        let pb = Tabular::new(9, 2);
        pb.table().value_mut()[[4, 0]] = -0.6;
        let f = Tabular::new(9, 1);
        for k in 0..9 {
            f.table().value_mut()[[k, 0]] = 0.1 * k as f32;
        }
        DbParametrization::new(
            ProbabilityEstimator::new(env.clone(), Box::new(pf), Direction::Forward).unwrap(),
            ProbabilityEstimator::new(env.clone(), Box::new(pb), Direction::Backward).unwrap(),
            LogStateFlowEstimator::new(env.clone(), Box::new(f), forward_looking).unwrap(),
        )
        .unwrap()
    }

    fn sample(param: &DbParametrization, n: usize, seed: u64) -> Trajectories {
        TrajectoriesSampler::new(&param.pf, SamplerConfig::default())
            .unwrap()
            .sample_trajectories(n, &mut ChaCha8Rng::seed_from_u64(seed))
            .unwrap()
    }

    #[test]
    fn terminal_residual_uses_log_reward() {
        let env = enum_grid();
        let param = DbParametrization::new(
            ProbabilityEstimator::new(env.clone(), Box::new(Uniform::new(3)), Direction::Forward)
                .unwrap(),
            ProbabilityEstimator::new(env.clone(), Box::new(Uniform::new(2)), Direction::Backward)
                .unwrap(),
            LogStateFlowEstimator::new(env.clone(), Box::new(Uniform::new(1)), false).unwrap(),
        )
        .unwrap();
        let s = State(vec![2, 2]);
        let transitions = Transitions::new(
            env.clone(),
            vec![Transition {
                state: s.clone(),
                action: 2,
                next_state: None,
                log_reward: Some(env.log_reward(&s)),
                log_pf: None,
            }],
        )
        .unwrap();
        let db = DetailedBalance::new(&param, DetailedBalanceConfig::default());
        // only the exit is valid from the corner
        let r = db.residuals(&transitions).unwrap()[0];
        assert!((r + env.log_reward(&s)).abs() < 1e-6);
    }

    #[test]
    fn gradients_match_finite_differences() {
        for forward_looking in [false, true] {
            let env = enum_grid();
            let param = tabular_db(&env, forward_looking);
            let transitions = sample(&param, 5, 11).to_transitions();
            let db = DetailedBalance::new(&param, DetailedBalanceConfig::default());
            let out = db.loss_and_grads(&transitions).unwrap();
            let loss = || db.loss(&transitions);
            for module in [param.pf.module(), param.pb.module(), param.log_f.module()] {
                check_grad(&module.named_parameters()[0].1, &out, loss, 2e-2);
            }
        }
    }

    #[test]
    fn on_policy_needs_recorded_log_pf() {
        let env = enum_grid();
        let param = tabular_db(&env, false);
        let cfg = SamplerConfig {
            record_log_probs: false,
            ..SamplerConfig::default()
        };
        let trajs = TrajectoriesSampler::new(&param.pf, cfg)
            .unwrap()
            .sample_trajectories(3, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap();
        let db = DetailedBalance::new(
            &param,
            DetailedBalanceConfig {
                on_policy: true,
                ..DetailedBalanceConfig::default()
            },
        );
        assert!(matches!(
            db.loss(&trajs.to_transitions()),
            Err(Error::Invariant(_))
        ));

        let recorded = sample(&param, 3, 0).to_transitions();
        let on = db.loss(&recorded).unwrap();
        let off = DetailedBalance::new(&param, DetailedBalanceConfig::default())
            .loss(&recorded)
            .unwrap();
        assert_eq!(on, off);
    }
}
