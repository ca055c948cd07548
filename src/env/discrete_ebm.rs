//! Discrete energy-based model environment (Zhang et al., 2022).
//!
//! States are vectors in `{-1, 0, 1}^ndim`, where `-1` means "not yet set". Starting from all
//! `-1`, action `i < ndim` sets coordinate `i` to 0 and action `ndim + i` sets it to 1. The exit
//! action is valid only once every coordinate is set. The log-reward is `-alpha * E(x)` for an
//! Ising energy
//!
//! \[
//! E(x) = -\sigma^\top J \sigma, \qquad \sigma_i = 2x_i - 1 \text{ (0 while unset)}.
//! \]

use ndarray::Array2;

use super::{Env, Preprocessor, State};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct DiscreteEbmConfig {
    pub ndim: usize,
    pub alpha: f32,
    /// Coupling matrix; defaults to `1/ndim` off the diagonal and 0 on it.
    pub coupling: Option<Array2<f32>>,
    pub preprocessor: Preprocessor,
}

impl Default for DiscreteEbmConfig {
    fn default() -> Self {
        Self {
            ndim: 4,
            alpha: 1.0,
            coupling: None,
            preprocessor: Preprocessor::Identity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscreteEbm {
    ndim: usize,
    alpha: f32,
    coupling: Array2<f32>,
    preprocessor: Preprocessor,
}

impl DiscreteEbm {
    pub fn new(config: DiscreteEbmConfig) -> Result<Self> {
        let d = config.ndim;
        if d == 0 {
            return Err(Error::Configuration("DiscreteEbm ndim must be >= 1".into()));
        }
        if config.preprocessor == Preprocessor::KHot {
            return Err(Error::Configuration(
                "KHot preprocessing is only defined for HyperGrid".into(),
            ));
        }
        let coupling = match config.coupling {
            Some(j) if j.dim() != (d, d) => {
                return Err(Error::Configuration(format!(
                    "coupling must be {d}x{d}, got {:?}",
                    j.dim()
                )))
            }
            Some(j) => j,
            None => Array2::from_shape_fn((d, d), |(i, k)| {
                if i == k {
                    0.0
                } else {
                    1.0 / d as f32
                }
            }),
        };
        Ok(Self {
            ndim: d,
            alpha: config.alpha,
            coupling,
            preprocessor: config.preprocessor,
        })
    }

    pub fn energy(&self, s: &State) -> f32 {
        let sigma: Vec<f32> = s
            .coords()
            .iter()
            .map(|&x| if x < 0 { 0.0 } else { 2.0 * x as f32 - 1.0 })
            .collect();
        let mut quad = 0.0f32;
        for i in 0..self.ndim {
            for k in 0..self.ndim {
                quad += sigma[i] * self.coupling[[i, k]] * sigma[k];
            }
        }
        -quad
    }
}

impl Env for DiscreteEbm {
    fn n_actions(&self) -> usize {
        2 * self.ndim + 1
    }

    fn check_state(&self, s: &State) -> Result<()> {
        if s.coords().len() != self.ndim || s.coords().iter().any(|&x| !(-1..=1).contains(&x)) {
            return Err(Error::Invariant(format!(
                "{:?} is not a DiscreteEbm state",
                s.coords()
            )));
        }
        Ok(())
    }

    fn n_states(&self) -> Option<usize> {
        3usize.checked_pow(u32::try_from(self.ndim).ok()?)
    }

    fn state_dim(&self) -> usize {
        self.ndim
    }

    fn s0(&self) -> State {
        State(vec![-1; self.ndim])
    }

    fn forward_mask(&self, s: &State) -> Vec<bool> {
        let unset: Vec<bool> = s.coords().iter().map(|&x| x == -1).collect();
        let mut mask = Vec::with_capacity(self.n_actions());
        mask.extend_from_slice(&unset);
        mask.extend_from_slice(&unset);
        mask.push(unset.iter().all(|&u| !u));
        mask
    }

    fn backward_mask(&self, s: &State) -> Vec<bool> {
        let mut mask: Vec<bool> = s.coords().iter().map(|&x| x == 0).collect();
        mask.extend(s.coords().iter().map(|&x| x == 1));
        mask
    }

    fn step(&self, s: &State, action: usize) -> Result<State> {
        self.check_state(s)?;
        if action >= 2 * self.ndim {
            return Err(Error::InvalidAction {
                action,
                reason: "exit is not a state transition",
            });
        }
        if !self.forward_mask(s)[action] {
            return Err(Error::InvalidAction {
                action,
                reason: "coordinate already set",
            });
        }
        let mut next = s.clone();
        next.0[action % self.ndim] = (action / self.ndim) as i64;
        Ok(next)
    }

    fn backward_step(&self, s: &State, action: usize) -> Result<State> {
        self.check_state(s)?;
        if action >= 2 * self.ndim || !self.backward_mask(s)[action] {
            return Err(Error::InvalidAction {
                action,
                reason: "coordinate does not hold this value",
            });
        }
        let mut parent = s.clone();
        parent.0[action % self.ndim] = -1;
        Ok(parent)
    }

    fn log_reward(&self, s: &State) -> f32 {
        -self.alpha * self.energy(s)
    }

    fn state_index(&self, s: &State) -> Option<usize> {
        if self.check_state(s).is_err() {
            return None;
        }
        s.coords()
            .iter()
            .try_fold(0usize, |acc, &x| acc.checked_mul(3)?.checked_add((x + 1) as usize))
    }

    fn preprocessor(&self) -> Preprocessor {
        self.preprocessor
    }

    fn terminating_states(&self) -> Option<Vec<State>> {
        let d = self.ndim;
        let states = (0..1usize << d)
            .map(|bits| State((0..d).map(|k| ((bits >> (d - 1 - k)) & 1) as i64).collect()))
            .collect();
        Some(states)
    }
}
