//! Forward/backward log-probabilities along trajectories, shared by TB, SubTB, and ZVar.
//!
//! Per-step values are laid out time-major, `[max_length, n_trajectories]`, with zeros in the
//! padded entries. Step `t` of trajectory `b` holds
//!
//! - `log_pfs[[t, b]] = log P_F(a_t | s_t)` for `t < n_b`,
//! - `log_pbs[[t, b]] = log P_B(a_t | s_{t+1})` for `t < n_b - 1` (the exit step has no backward
//!   counterpart).
//!
//! Totals are summed over valid steps in increasing `t`, so on-policy (recorded) and off-policy
//! (recomputed) totals are bit-identical whenever the per-step values are.

use ndarray::{Array1, Array2};

use crate::containers::Trajectories;
use crate::env::State;
use crate::estimators::{PolicyEvaluation, ProbabilityEstimator};
use crate::nn::Gradients;
use crate::{Error, Result};

use super::{NumericWarning, EXTREME_LOG_PROB};

/// Per-step log-probabilities of a trajectory batch, with what the backward pass needs.
#[derive(Debug, Clone)]
pub struct StepLogProbs {
    pub log_pfs: Array2<f32>,
    pub log_pbs: Array2<f32>,
    /// `mask[[t, b]]` iff trajectory `b` acted at step `t`.
    pub mask: Array2<bool>,
    pf_rows: Vec<(usize, usize)>,
    pb_rows: Vec<(usize, usize)>,
    /// `None` when the recorded on-policy values were reused.
    pf_eval: Option<PolicyEvaluation>,
    pb_eval: PolicyEvaluation,
}

pub(crate) fn check_policies(
    pf: &ProbabilityEstimator,
    pb: &ProbabilityEstimator,
    trajectories: &Trajectories,
) -> Result<()> {
    let n = trajectories.env().n_actions();
    if pf.env().n_actions() != n || pb.env().n_actions() != n {
        return Err(Error::Configuration(format!(
            "estimators expect {} actions, trajectories have {n}",
            pf.env().n_actions()
        )));
    }
    if trajectories.is_empty() {
        return Err(Error::Invariant("empty trajectory batch".into()));
    }
    Ok(())
}

/// Per-step `log P_F` and `log P_B` for every valid step of every trajectory.
///
/// With `on_policy`, the forward values recorded at sampling time are reused; this is only
/// correct if the trajectories were sampled under the current parameters. Otherwise (replay
/// buffers, stale or tempered policies) they are recomputed from `pf`.
pub fn get_pfs_and_pbs(
    pf: &ProbabilityEstimator,
    pb: &ProbabilityEstimator,
    trajectories: &Trajectories,
    on_policy: bool,
) -> Result<StepLogProbs> {
    check_policies(pf, pb, trajectories)?;
    let shape = (trajectories.max_length(), trajectories.len());

    let mut pf_rows = Vec::new();
    let mut pf_states: Vec<State> = Vec::new();
    let mut pf_actions = Vec::new();
    let mut pb_rows = Vec::new();
    let mut pb_states: Vec<State> = Vec::new();
    let mut pb_actions = Vec::new();
    for (b, traj) in trajectories.iter().enumerate() {
        let n = traj.len();
        for t in 0..n {
            pf_rows.push((t, b));
            pf_states.push(traj.states[t].clone());
            pf_actions.push(traj.actions[t]);
            if t + 1 < n {
                pb_rows.push((t, b));
                pb_states.push(traj.states[t + 1].clone());
                pb_actions.push(traj.actions[t]);
            }
        }
    }

    let mut log_pfs = Array2::<f32>::zeros(shape);
    let pf_eval = if on_policy {
        let recorded = trajectories.log_pfs().ok_or_else(|| {
            Error::Invariant("on-policy loss needs trajectories with recorded log_pfs".into())
        })?;
        for &(t, b) in &pf_rows {
            log_pfs[[t, b]] = recorded[[t, b]];
        }
        None
    } else {
        let eval = pf.evaluate(&pf_states, &pf_actions)?;
        for (&(t, b), &lp) in pf_rows.iter().zip(eval.chosen().iter()) {
            log_pfs[[t, b]] = lp;
        }
        Some(eval)
    };

    let pb_eval = pb.evaluate(&pb_states, &pb_actions)?;
    let mut log_pbs = Array2::<f32>::zeros(shape);
    for (&(t, b), &lp) in pb_rows.iter().zip(pb_eval.chosen().iter()) {
        log_pbs[[t, b]] = lp;
    }

    Ok(StepLogProbs {
        log_pfs,
        log_pbs,
        mask: trajectories.step_mask(),
        pf_rows,
        pb_rows,
        pf_eval,
        pb_eval,
    })
}

impl StepLogProbs {
    /// `(Σ_t log P_F, Σ_t log P_B)` per trajectory.
    pub fn totals(&self) -> (Array1<f32>, Array1<f32>) {
        let (max_len, n) = self.mask.dim();
        let mut pf = Array1::<f32>::zeros(n);
        let mut pb = Array1::<f32>::zeros(n);
        for b in 0..n {
            for t in 0..max_len {
                if self.mask[[t, b]] {
                    pf[b] += self.log_pfs[[t, b]];
                    pb[b] += self.log_pbs[[t, b]];
                }
            }
        }
        (pf, pb)
    }

    /// Smallest valid log-probability, if below [`EXTREME_LOG_PROB`].
    pub(crate) fn extreme_warning(&self) -> Option<NumericWarning> {
        let min_pf = self
            .pf_rows
            .iter()
            .map(|&(t, b)| self.log_pfs[[t, b]])
            .fold(f32::INFINITY, f32::min);
        let min_pb = self
            .pb_rows
            .iter()
            .map(|&(t, b)| self.log_pbs[[t, b]])
            .fold(f32::INFINITY, f32::min);
        let min = min_pf.min(min_pb);
        (min < EXTREME_LOG_PROB).then_some(NumericWarning::ExtremeLogProbability { min })
    }

    /// Backpropagate per-step gradients (same layout as `log_pfs` / `log_pbs`).
    pub fn backward(
        &self,
        pf: &ProbabilityEstimator,
        pb: &ProbabilityEstimator,
        trajectories: &Trajectories,
        grad_log_pfs: &Array2<f32>,
        grad_log_pbs: &Array2<f32>,
        grads: &mut Gradients,
    ) -> Result<()> {
        let g_pf: Vec<f32> = self.pf_rows.iter().map(|&(t, b)| grad_log_pfs[[t, b]]).collect();
        match &self.pf_eval {
            Some(eval) => pf.backward(eval, &g_pf, grads),
            None => {
                // on-policy values carry no evaluation; differentiate the current policy
                let batch = trajectories.iter().as_slice();
                let (states, actions): (Vec<State>, Vec<usize>) = self
                    .pf_rows
                    .iter()
                    .map(|&(t, b)| (batch[b].states[t].clone(), batch[b].actions[t]))
                    .unzip();
                let eval = pf.evaluate(&states, &actions)?;
                pf.backward(&eval, &g_pf, grads);
            }
        }
        let g_pb: Vec<f32> = self.pb_rows.iter().map(|&(t, b)| grad_log_pbs[[t, b]]).collect();
        pb.backward(&self.pb_eval, &g_pb, grads);
        Ok(())
    }
}

/// Trajectory-level scores without `logZ`.
#[derive(Debug, Clone)]
pub struct TrajectoryScores {
    pub total_log_pfs: Array1<f32>,
    pub total_log_pbs: Array1<f32>,
    /// `Σ log P_F − Σ log P_B − max(log R, log_reward_clip_min)`.
    pub scores: Array1<f32>,
    pub steps: StepLogProbs,
}

pub fn get_trajectories_scores(
    pf: &ProbabilityEstimator,
    pb: &ProbabilityEstimator,
    trajectories: &Trajectories,
    on_policy: bool,
    log_reward_clip_min: f32,
) -> Result<TrajectoryScores> {
    let steps = get_pfs_and_pbs(pf, pb, trajectories, on_policy)?;
    let (total_log_pfs, total_log_pbs) = steps.totals();
    let log_rewards = trajectories.log_rewards();
    let scores = Array1::from_iter((0..trajectories.len()).map(|b| {
        total_log_pfs[b] - total_log_pbs[b] - log_rewards[b].max(log_reward_clip_min)
    }));
    if scores.iter().any(|s| s.is_nan()) {
        return Err(Error::NonFinite("trajectory scores"));
    }
    Ok(TrajectoryScores {
        total_log_pfs,
        total_log_pbs,
        scores,
        steps,
    })
}

impl TrajectoryScores {
    /// Spread `d(loss)/d(score_b)` over the steps of each trajectory and backpropagate.
    pub fn backward(
        &self,
        pf: &ProbabilityEstimator,
        pb: &ProbabilityEstimator,
        trajectories: &Trajectories,
        grad_scores: &Array1<f32>,
        grads: &mut Gradients,
    ) -> Result<()> {
        let shape = self.steps.mask.dim();
        let mut g_pf = Array2::<f32>::zeros(shape);
        let mut g_pb = Array2::<f32>::zeros(shape);
        for (b, traj) in trajectories.iter().enumerate() {
            let n = traj.len();
            for t in 0..n {
                g_pf[[t, b]] = grad_scores[b];
                if t + 1 < n {
                    g_pb[[t, b]] = -grad_scores[b];
                }
            }
        }
        self.steps.backward(pf, pb, trajectories, &g_pf, &g_pb, grads)
    }
}
