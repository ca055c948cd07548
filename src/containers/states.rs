use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use crate::env::{Env, State};
use crate::{Error, Result};

/// An incoming edge `parent --action--> state`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub parent: State,
    pub action: usize,
}

/// A state with everything flow matching balances over it.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowState {
    pub state: State,
    /// Every edge into `state` allowed by the backward mask.
    pub incoming: Vec<Edge>,
    /// Valid non-exit forward actions out of `state`.
    pub outgoing: Vec<usize>,
    /// `log R(state)` when the exit action is valid from `state`.
    pub log_reward: Option<f32>,
}

/// Distinct non-initial states for flow matching.
#[derive(Clone)]
pub struct FlowStates {
    env: Rc<dyn Env>,
    states: Vec<FlowState>,
}

impl fmt::Debug for FlowStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowStates")
            .field("n", &self.states.len())
            .field(
                "n_terminating",
                &self.states.iter().filter(|s| s.log_reward.is_some()).count(),
            )
            .finish()
    }
}

impl FlowStates {
    /// Deduplicate `states` (first occurrence order) and annotate each one from the env.
    ///
    /// The initial state has no incoming edge and is rejected with [`Error::Invariant`].
    pub fn from_states(env: Rc<dyn Env>, states: impl IntoIterator<Item = State>) -> Result<Self> {
        let exit = env.exit_action();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for s in states {
            if !seen.insert(s.clone()) {
                continue;
            }
            env.check_state(&s)?;
            if env.is_initial(&s) {
                return Err(Error::Invariant(
                    "flow matching states must not include s0".into(),
                ));
            }
            let mut incoming = Vec::new();
            for (a, valid) in env.backward_mask(&s).into_iter().enumerate() {
                if valid {
                    incoming.push(Edge {
                        parent: env.backward_step(&s, a)?,
                        action: a,
                    });
                }
            }
            let fwd = env.forward_mask(&s);
            let outgoing = (0..exit).filter(|&a| fwd[a]).collect();
            let log_reward = fwd[exit].then(|| env.log_reward(&s));
            out.push(FlowState {
                state: s,
                incoming,
                outgoing,
                log_reward,
            });
        }
        Ok(Self { env, states: out })
    }

    /// Wrap pre-annotated states as-is; the loss checks the edge sets.
    pub fn new(env: Rc<dyn Env>, states: Vec<FlowState>) -> Self {
        Self { env, states }
    }

    pub fn env(&self) -> &Rc<dyn Env> {
        &self.env
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FlowState> {
        self.states.iter()
    }

    /// States the exit action is valid from.
    pub fn terminating(&self) -> impl Iterator<Item = &FlowState> {
        self.states.iter().filter(|s| s.log_reward.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{DiscreteEbm, DiscreteEbmConfig};

    #[test]
    fn annotates_parents_and_exit_reward() {
        let env: Rc<dyn Env> = Rc::new(
            DiscreteEbm::new(DiscreteEbmConfig {
                ndim: 2,
                ..DiscreteEbmConfig::default()
            })
            .unwrap(),
        );
        let full = State(vec![0, 1]);
        let half = State(vec![-1, 1]);
        let batch = vec![half.clone(), full.clone(), half];
        let fs = FlowStates::from_states(env.clone(), batch).unwrap();
        assert_eq!(fs.len(), 2);

        let h = &fs.iter().next().unwrap();
        assert_eq!(h.incoming.len(), 1);
        assert_eq!(h.incoming[0].parent, env.s0());
        assert_eq!(h.outgoing, vec![0, 2]);
        assert!(h.log_reward.is_none());

        let f = fs.terminating().next().unwrap();
        assert_eq!(f.state, full);
        assert_eq!(f.incoming.len(), 2);
        assert!(f.outgoing.is_empty());
        assert_eq!(f.log_reward, Some(env.log_reward(&full)));
    }

    #[test]
    fn rejects_out_of_range_state() {
        let env: Rc<dyn Env> = Rc::new(DiscreteEbm::new(DiscreteEbmConfig::default()).unwrap());
        let mut coords = env.s0().0;
        coords[0] = 2;
        assert!(matches!(
            FlowStates::from_states(env, vec![State(coords)]),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn rejects_initial_state() {
        let env: Rc<dyn Env> = Rc::new(DiscreteEbm::new(DiscreteEbmConfig::default()).unwrap());
        let s0 = env.s0();
        assert!(matches!(
            FlowStates::from_states(env, vec![s0]),
            Err(Error::Invariant(_))
        ));
    }
}
