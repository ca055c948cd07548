use std::fmt;
use std::rc::Rc;

use crate::env::{Env, State};
use crate::{Error, Result};

/// One edge `s --a--> s'`. Terminal transitions take the exit action, have no `next_state`, and
/// carry the log-reward of `state`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: State,
    pub action: usize,
    pub next_state: Option<State>,
    pub log_reward: Option<f32>,
    pub log_pf: Option<f32>,
}

impl Transition {
    pub fn is_done(&self) -> bool {
        self.next_state.is_none()
    }
}

/// A batch of transitions over one env.
#[derive(Clone)]
pub struct Transitions {
    env: Rc<dyn Env>,
    transitions: Vec<Transition>,
}

impl fmt::Debug for Transitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transitions")
            .field("n", &self.transitions.len())
            .field("n_done", &self.transitions.iter().filter(|t| t.is_done()).count())
            .finish()
    }
}

impl Transitions {
    /// Validates that each non-terminal `next_state` is `env.step(state, action)` and that each
    /// terminal transition exits from a state where exiting is valid and carries a log-reward.
    pub fn new(env: Rc<dyn Env>, transitions: Vec<Transition>) -> Result<Self> {
        let exit = env.exit_action();
        for (i, tr) in transitions.iter().enumerate() {
            env.check_state(&tr.state)?;
            match &tr.next_state {
                None => {
                    if tr.action != exit || !env.forward_mask(&tr.state)[exit] {
                        return Err(Error::Invariant(format!(
                            "transition {i} is done but does not take a valid exit action"
                        )));
                    }
                    if tr.log_reward.is_none() {
                        return Err(Error::Invariant(format!(
                            "terminal transition {i} has no log-reward"
                        )));
                    }
                }
                Some(next) => {
                    if tr.action == exit {
                        return Err(Error::Invariant(format!(
                            "transition {i} exits but has a next state"
                        )));
                    }
                    let stepped = env.step(&tr.state, tr.action).map_err(|_| {
                        let action = tr.action;
                        Error::Invariant(format!("transition {i}: action {action} is not valid"))
                    })?;
                    if stepped != *next {
                        return Err(Error::Invariant(format!(
                            "transition {i}: next state {:?} is not reachable from {:?}",
                            next.coords(),
                            tr.state.coords()
                        )));
                    }
                }
            }
        }
        Ok(Self { env, transitions })
    }

    pub(crate) fn from_trajectories(env: Rc<dyn Env>, transitions: Vec<Transition>) -> Self {
        Self { env, transitions }
    }

    pub fn env(&self) -> &Rc<dyn Env> {
        &self.env
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Transition> {
        self.transitions.iter()
    }

    pub fn as_slice(&self) -> &[Transition] {
        &self.transitions
    }
}
