//! Trajectory sampling under a forward policy.
//!
//! The contract:
//! - deterministic given the `rng`,
//! - with the default [`SamplerConfig`], the recorded `log_pfs` are bit-identical to what
//!   [`ProbabilityEstimator::evaluate`] recomputes for the same states and actions,
//! - exploration knobs (`temperature`, `sf_bias`, `epsilon`) change the sampling distribution,
//!   and the recorded log-probabilities are those of the distribution actually sampled from.

use std::collections::BTreeMap;
use std::rc::Rc;

use ndarray::{Array1, Array2};
use rand::Rng;
use tracing::trace;

use crate::containers::{Trajectories, Trajectory};
use crate::env::{Env, State};
use crate::estimators::{Direction, LogEdgeFlowEstimator, ProbabilityEstimator};
use crate::math::log_softmax_masked;
use crate::{Error, Result};

/// Anything that yields forward-policy logits over `n_actions` for a batch of states.
pub trait ForwardPolicy {
    fn env(&self) -> &Rc<dyn Env>;
    fn policy_logits(&self, states: &[State]) -> Result<Array2<f32>>;
}

impl ForwardPolicy for ProbabilityEstimator {
    fn env(&self) -> &Rc<dyn Env> {
        ProbabilityEstimator::env(self)
    }

    fn policy_logits(&self, states: &[State]) -> Result<Array2<f32>> {
        if self.direction() != Direction::Forward {
            return Err(Error::Configuration(
                "cannot sample forward actions from a backward estimator".into(),
            ));
        }
        Ok(self.logits(states)?.1)
    }
}

impl ForwardPolicy for LogEdgeFlowEstimator {
    fn env(&self) -> &Rc<dyn Env> {
        LogEdgeFlowEstimator::env(self)
    }

    fn policy_logits(&self, states: &[State]) -> Result<Array2<f32>> {
        LogEdgeFlowEstimator::policy_logits(self, states)
    }
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Logits are divided by this before the softmax.
    pub temperature: f32,
    /// Subtracted from the exit logit (discourages early stopping when positive).
    pub sf_bias: f32,
    /// Mix in a uniform distribution over valid actions with this weight.
    pub epsilon: f32,
    /// Record per-step forward log-probabilities for on-policy losses.
    pub record_log_probs: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            sf_bias: 0.0,
            epsilon: 0.0,
            record_log_probs: true,
        }
    }
}

impl SamplerConfig {
    fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(Error::Configuration("temperature must be positive and finite".into()));
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(Error::Configuration("epsilon must be in [0, 1]".into()));
        }
        if !self.sf_bias.is_finite() {
            return Err(Error::Configuration("sf_bias must be finite".into()));
        }
        Ok(())
    }
}

fn sample_categorical_from_log_probs(log_probs: &[f32], rng: &mut impl Rng) -> usize {
    debug_assert!(log_probs.iter().any(|x| x.is_finite()));
    // Float roundoff can leave the cumulative sum slightly below 1.0; fall back to the last
    // valid index instead of a masked one.
    let u: f32 = rng.random();
    let mut acc = 0.0f32;
    let mut last_valid = 0;
    for (idx, &lp) in log_probs.iter().enumerate() {
        if lp == f32::NEG_INFINITY {
            continue;
        }
        last_valid = idx;
        acc += lp.exp();
        if u <= acc {
            return idx;
        }
    }
    last_valid
}

/// Samples one action per state from a [`ForwardPolicy`].
pub struct ActionsSampler<'a> {
    policy: &'a dyn ForwardPolicy,
    config: SamplerConfig,
}

impl<'a> ActionsSampler<'a> {
    pub fn new(policy: &'a dyn ForwardPolicy, config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { policy, config })
    }

    /// Log-probabilities of the sampling distribution, one row per state.
    fn sampling_log_probs(&self, states: &[State]) -> Result<Vec<Vec<f32>>> {
        let env = self.policy.env();
        let exit = env.exit_action();
        let logits = self.policy.policy_logits(states)?;
        let c = &self.config;
        let mut rows = Vec::with_capacity(states.len());
        for (i, s) in states.iter().enumerate() {
            let mask = env.forward_mask(s);
            let mut z: Vec<f32> = logits.row(i).iter().map(|&x| x / c.temperature).collect();
            z[exit] -= c.sf_bias;
            let mut lp = log_softmax_masked(&z, &mask);
            if c.epsilon > 0.0 {
                let n_valid = mask.iter().filter(|&&m| m).count() as f32;
                for (v, &m) in lp.iter_mut().zip(&mask) {
                    if m {
                        *v = ((1.0 - c.epsilon) * v.exp() + c.epsilon / n_valid).ln();
                    }
                }
            }
            rows.push(lp);
        }
        Ok(rows)
    }

    /// `(actions, log-probabilities of the sampled actions)`.
    pub fn sample(&self, states: &[State], rng: &mut impl Rng) -> Result<(Vec<usize>, Vec<f32>)> {
        let rows = self.sampling_log_probs(states)?;
        let mut actions = Vec::with_capacity(states.len());
        let mut log_probs = Vec::with_capacity(states.len());
        for lp in rows {
            let a = sample_categorical_from_log_probs(&lp, rng);
            actions.push(a);
            log_probs.push(lp[a]);
        }
        Ok((actions, log_probs))
    }
}

/// Rolls out complete trajectories from `s_0`.
pub struct TrajectoriesSampler<'a> {
    actions: ActionsSampler<'a>,
}

impl<'a> TrajectoriesSampler<'a> {
    pub fn new(policy: &'a dyn ForwardPolicy, config: SamplerConfig) -> Result<Self> {
        Ok(Self {
            actions: ActionsSampler::new(policy, config)?,
        })
    }

    pub fn env(&self) -> &Rc<dyn Env> {
        self.actions.policy.env()
    }

    /// Sample `n` trajectories, batching the policy over the still-active ones at each step.
    pub fn sample_trajectories(&self, n: usize, rng: &mut impl Rng) -> Result<Trajectories> {
        let env = self.env().clone();
        let exit = env.exit_action();
        let record = self.actions.config.record_log_probs;

        let mut current: Vec<State> = vec![env.s0(); n];
        let mut built: Vec<Trajectory> = (0..n)
            .map(|_| Trajectory {
                states: Vec::new(),
                actions: Vec::new(),
                log_pfs: record.then(Vec::new),
                log_reward: 0.0,
            })
            .collect();
        let mut active: Vec<usize> = (0..n).collect();
        let mut step = 0usize;

        while !active.is_empty() {
            let batch: Vec<State> = active.iter().map(|&b| current[b].clone()).collect();
            let (acts, lps) = self.actions.sample(&batch, rng)?;
            let mut still_active = Vec::with_capacity(active.len());
            for (k, &b) in active.iter().enumerate() {
                let traj = &mut built[b];
                let s = std::mem::replace(&mut current[b], env.s0());
                traj.actions.push(acts[k]);
                if let Some(lp) = traj.log_pfs.as_mut() {
                    lp.push(lps[k]);
                }
                if acts[k] == exit {
                    traj.log_reward = env.log_reward(&s);
                    traj.states.push(s);
                } else {
                    current[b] = env.step(&s, acts[k])?;
                    traj.states.push(s);
                    still_active.push(b);
                }
            }
            trace!(step, active = still_active.len(), "sampler step");
            active = still_active;
            step += 1;
        }

        Ok(Trajectories::from_sampled(env, built))
    }
}

/// Empirical distribution over terminating states, as returned by `Parametrization::pi`.
#[derive(Debug, Clone)]
pub struct TerminatingStateDistribution {
    env: Rc<dyn Env>,
    samples: Vec<State>,
    counts: BTreeMap<State, usize>,
}

impl TerminatingStateDistribution {
    pub fn from_trajectories(trajectories: &Trajectories) -> Result<Self> {
        if trajectories.is_empty() {
            return Err(Error::Configuration(
                "cannot build a distribution from zero samples".into(),
            ));
        }
        let samples = trajectories.terminating_states();
        let mut counts = BTreeMap::new();
        for s in &samples {
            *counts.entry(s.clone()).or_insert(0) += 1;
        }
        Ok(Self {
            env: trajectories.env().clone(),
            samples,
            counts,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[State] {
        &self.samples
    }

    /// Draw one terminating state.
    pub fn sample(&self, rng: &mut impl Rng) -> State {
        self.samples[rng.random_range(0..self.samples.len())].clone()
    }

    pub fn probability(&self, s: &State) -> f32 {
        self.counts.get(s).copied().unwrap_or(0) as f32 / self.samples.len() as f32
    }

    /// Probability mass per state index, for enumerable envs.
    pub fn pmf(&self) -> Option<Array1<f32>> {
        let n = self.env.n_states()?;
        let mut out = Array1::<f32>::zeros(n);
        for (s, &c) in &self.counts {
            out[self.env.state_index(s)?] = c as f32 / self.samples.len() as f32;
        }
        Some(out)
    }
}
