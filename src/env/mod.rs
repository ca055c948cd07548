//! State spaces consumed by the estimators, samplers, and losses.
//!
//! An [`Env`] exposes exactly what the GFlowNet layer needs: action counts, masks, forward and
//! backward dynamics, and a terminal log-reward. The exit action is always the last action
//! index; backward actions are indexed like the forward action they undo, so a backward policy
//! has `n_actions - 1` outputs.
//!
//! Two reference environments are provided: [`HyperGrid`] and [`DiscreteEbm`].

mod discrete_ebm;
mod hypergrid;

pub use discrete_ebm::{DiscreteEbm, DiscreteEbmConfig};
pub use hypergrid::{HyperGrid, HyperGridConfig};

use std::str::FromStr;

use ndarray::Array2;

use crate::{Error, Result};

/// A (non-sink) state, stored as integer coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct State(pub Vec<i64>);

impl State {
    pub fn coords(&self) -> &[i64] {
        &self.0
    }
}

impl From<Vec<i64>> for State {
    fn from(v: Vec<i64>) -> Self {
        Self(v)
    }
}

/// Discrete GFlowNet environment.
///
/// The sink state `s_f` is implicit: taking [`Env::exit_action`] ends the trajectory.
pub trait Env: std::fmt::Debug {
    /// Number of forward actions, including the exit action.
    fn n_actions(&self) -> usize;

    fn exit_action(&self) -> usize {
        self.n_actions() - 1
    }

    /// Number of states when the space is enumerable.
    fn n_states(&self) -> Option<usize>;

    /// Length of a state's coordinate vector.
    fn state_dim(&self) -> usize;

    fn s0(&self) -> State;

    /// `Err(Invariant)` unless `s` has this env's shape and coordinate range.
    fn check_state(&self, s: &State) -> Result<()>;

    fn is_initial(&self, s: &State) -> bool {
        *s == self.s0()
    }

    /// Valid forward actions, length `n_actions`.
    fn forward_mask(&self, s: &State) -> Vec<bool>;

    /// Valid backward actions, length `n_actions - 1`.
    fn backward_mask(&self, s: &State) -> Vec<bool>;

    /// Apply a non-exit forward action.
    fn step(&self, s: &State, action: usize) -> Result<State>;

    /// Undo forward action `action`, returning the parent.
    fn backward_step(&self, s: &State, action: usize) -> Result<State>;

    /// Log-reward of terminating in `s`.
    fn log_reward(&self, s: &State) -> f32;

    /// Canonical index in `0..n_states`.
    fn state_index(&self, s: &State) -> Option<usize>;

    fn preprocessor(&self) -> Preprocessor;

    /// All states the exit action is valid from, when enumerable.
    fn terminating_states(&self) -> Option<Vec<State>>;

    /// Largest coordinate value plus one, used by the `KHot` preprocessor.
    fn coordinate_cardinality(&self) -> Option<usize> {
        None
    }
}

/// Maps raw states to module inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preprocessor {
    /// One column holding the state index (for `Tabular` modules).
    Enum,
    /// Coordinates as floats.
    Identity,
    /// Per-coordinate one-hot blocks (`state_dim * cardinality` columns).
    KHot,
    /// One-hot over the state index (`n_states` columns).
    OneHot,
}

impl FromStr for Preprocessor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Enum" => Ok(Self::Enum),
            "Identity" => Ok(Self::Identity),
            "KHot" => Ok(Self::KHot),
            "OneHot" => Ok(Self::OneHot),
            other => Err(Error::Configuration(format!("unknown preprocessor {other:?}"))),
        }
    }
}

impl Preprocessor {
    pub fn output_dim(&self, env: &dyn Env) -> Result<usize> {
        match self {
            Self::Enum => Ok(1),
            Self::Identity => Ok(env.state_dim()),
            Self::KHot => env
                .coordinate_cardinality()
                .map(|k| k * env.state_dim())
                .ok_or_else(|| Error::Configuration("KHot needs bounded coordinates".into())),
            Self::OneHot => env
                .n_states()
                .ok_or_else(|| Error::Configuration("OneHot needs an enumerable env".into())),
        }
    }

    /// `[states.len(), output_dim]` feature matrix.
    pub fn apply(&self, env: &dyn Env, states: &[State]) -> Result<Array2<f32>> {
        let dim = self.output_dim(env)?;
        let mut out = Array2::<f32>::zeros((states.len(), dim));
        for (i, s) in states.iter().enumerate() {
            env.check_state(s)?;
            match self {
                Self::Enum => out[[i, 0]] = index_of(env, s)? as f32,
                Self::OneHot => out[[i, index_of(env, s)?]] = 1.0,
                Self::Identity => {
                    for (k, &c) in s.coords().iter().enumerate() {
                        out[[i, k]] = c as f32;
                    }
                }
                Self::KHot => {
                    let card = dim / env.state_dim();
                    for (k, &c) in s.coords().iter().enumerate() {
                        if c < 0 || c as usize >= card {
                            return Err(Error::Invariant(format!(
                                "coordinate {c} outside KHot range 0..{card}"
                            )));
                        }
                        out[[i, k * card + c as usize]] = 1.0;
                    }
                }
            }
        }
        Ok(out)
    }
}

fn index_of(env: &dyn Env, s: &State) -> Result<usize> {
    env.state_index(s)
        .ok_or_else(|| Error::Invariant(format!("state {:?} has no index", s.coords())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocessor_names_parse() {
        assert_eq!("KHot".parse::<Preprocessor>().unwrap(), Preprocessor::KHot);
        assert!(matches!(
            "Embedding".parse::<Preprocessor>(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn khot_and_onehot_shapes() {
        let env = HyperGrid::new(HyperGridConfig {
            ndim: 2,
            height: 3,
            ..HyperGridConfig::default()
        })
        .unwrap();
        let states = vec![State(vec![0, 2]), State(vec![1, 1])];

        let kh = Preprocessor::KHot.apply(&env, &states).unwrap();
        assert_eq!(kh.dim(), (2, 6));
        assert_eq!(kh.row(0).to_vec(), vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);

        let oh = Preprocessor::OneHot.apply(&env, &states).unwrap();
        assert_eq!(oh.dim(), (2, 9));
        assert_eq!(oh[[1, 4]], 1.0);

        let en = Preprocessor::Enum.apply(&env, &states).unwrap();
        assert_eq!(en.column(0).to_vec(), vec![2.0, 4.0]);
    }
}
