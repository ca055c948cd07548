use std::fmt;
use std::rc::Rc;

use ndarray::{Array1, Array2};

use super::{FlowStates, Transition, Transitions};
use crate::env::{Env, State};
use crate::{Error, Result};

/// One episode. `states[t]` is the state the action `actions[t]` was taken from; the last action
/// is the exit action, so `states.last()` is the terminating state.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub states: Vec<State>,
    pub actions: Vec<usize>,
    /// Forward log-probabilities recorded at sampling time, one per action.
    pub log_pfs: Option<Vec<f32>>,
    pub log_reward: f32,
}

impl Trajectory {
    /// Number of actions including the exit action (`when_is_done`).
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn terminating_state(&self) -> &State {
        &self.states[self.states.len() - 1]
    }
}

/// A batch of complete trajectories over one env.
#[derive(Clone)]
pub struct Trajectories {
    env: Rc<dyn Env>,
    trajectories: Vec<Trajectory>,
}

impl fmt::Debug for Trajectories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trajectories")
            .field("n", &self.trajectories.len())
            .field("max_length", &self.max_length())
            .finish()
    }
}

impl Trajectories {
    /// Validates every trajectory: starts at `s_0`, follows `env.step`, exits exactly once at the
    /// end, and carries one recorded log-probability per action when any are recorded.
    pub fn new(env: Rc<dyn Env>, trajectories: Vec<Trajectory>) -> Result<Self> {
        let exit = env.exit_action();
        for (b, traj) in trajectories.iter().enumerate() {
            let n = traj.len();
            if n == 0 || traj.states.len() != n {
                return Err(Error::Invariant(format!(
                    "trajectory {b}: {} states for {n} actions",
                    traj.states.len()
                )));
            }
            if !env.is_initial(&traj.states[0]) {
                return Err(Error::Invariant(format!(
                    "trajectory {b} does not start at s0"
                )));
            }
            for t in 0..n - 1 {
                if traj.actions[t] == exit {
                    return Err(Error::Invariant(format!(
                        "trajectory {b} exits at step {t} before its end"
                    )));
                }
                let next = env.step(&traj.states[t], traj.actions[t])?;
                if next != traj.states[t + 1] {
                    return Err(Error::Invariant(format!(
                        "trajectory {b}: step {t} does not lead to the recorded state"
                    )));
                }
            }
            let last = &traj.states[n - 1];
            env.check_state(last)?;
            if traj.actions[n - 1] != exit || !env.forward_mask(last)[exit] {
                return Err(Error::Invariant(format!(
                    "trajectory {b} does not end with a valid exit action"
                )));
            }
            if let Some(lp) = &traj.log_pfs {
                if lp.len() != n {
                    return Err(Error::Invariant(format!(
                        "trajectory {b}: {} log_pfs for {n} actions",
                        lp.len()
                    )));
                }
            }
        }
        Ok(Self { env, trajectories })
    }

    /// Skips validation; used by the sampler, which builds trajectories from `env.step` itself.
    pub(crate) fn from_sampled(env: Rc<dyn Env>, trajectories: Vec<Trajectory>) -> Self {
        Self { env, trajectories }
    }

    pub fn env(&self) -> &Rc<dyn Env> {
        &self.env
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Trajectory> {
        self.trajectories.iter()
    }

    pub fn max_length(&self) -> usize {
        self.trajectories.iter().map(Trajectory::len).max().unwrap_or(0)
    }

    pub fn when_is_done(&self) -> Vec<usize> {
        self.trajectories.iter().map(Trajectory::len).collect()
    }

    pub fn log_rewards(&self) -> Array1<f32> {
        self.trajectories.iter().map(|t| t.log_reward).collect()
    }

    pub fn terminating_states(&self) -> Vec<State> {
        self.trajectories
            .iter()
            .map(|t| t.terminating_state().clone())
            .collect()
    }

    /// `true` iff every trajectory recorded its forward log-probabilities.
    pub fn has_log_pfs(&self) -> bool {
        !self.trajectories.is_empty() && self.trajectories.iter().all(|t| t.log_pfs.is_some())
    }

    /// `[max_length, n]` validity mask: `mask[[t, b]]` iff trajectory `b` took an action at `t`.
    pub fn step_mask(&self) -> Array2<bool> {
        let n_b = self.when_is_done();
        Array2::from_shape_fn((self.max_length(), self.len()), |(t, b)| t < n_b[b])
    }

    /// Recorded forward log-probabilities, time-major and zero-padded.
    pub fn log_pfs(&self) -> Option<Array2<f32>> {
        let mut out = Array2::<f32>::zeros((self.max_length(), self.len()));
        for (b, traj) in self.trajectories.iter().enumerate() {
            for (t, &lp) in traj.log_pfs.as_ref()?.iter().enumerate() {
                out[[t, b]] = lp;
            }
        }
        Some(out)
    }

    /// Flatten into transitions, trajectory-major and in step order.
    pub fn to_transitions(&self) -> Transitions {
        let mut out = Vec::with_capacity(self.trajectories.iter().map(Trajectory::len).sum());
        for traj in &self.trajectories {
            let n = traj.len();
            for t in 0..n {
                let done = t == n - 1;
                out.push(Transition {
                    state: traj.states[t].clone(),
                    action: traj.actions[t],
                    next_state: (!done).then(|| traj.states[t + 1].clone()),
                    log_reward: done.then_some(traj.log_reward),
                    log_pf: traj.log_pfs.as_ref().map(|lp| lp[t]),
                });
            }
        }
        Transitions::from_trajectories(self.env.clone(), out)
    }

    /// Distinct non-initial states visited by the batch (terminating states included).
    pub fn to_flow_states(&self) -> Result<FlowStates> {
        let visited = self
            .trajectories
            .iter()
            .flat_map(|t| t.states.iter().skip(1).cloned());
        FlowStates::from_states(self.env.clone(), visited)
    }
}

impl<'a> IntoIterator for &'a Trajectories {
    type Item = &'a Trajectory;
    type IntoIter = std::slice::Iter<'a, Trajectory>;

    fn into_iter(self) -> Self::IntoIter {
        self.trajectories.iter()
    }
}
