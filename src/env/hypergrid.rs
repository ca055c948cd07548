//! The HyperGrid environment (Bengio et al., 2021).
//!
//! States are points of `{0, .., height-1}^ndim`, starting at the origin. Action `i < ndim`
//! increments coordinate `i`; action `ndim` exits. Every state is terminating. The reward has
//! high-value modes near the corners:
//!
//! \[
//! R(x) = R_0 + R_1 \prod_i \mathbb{1}[0.25 < a_i] + R_2 \prod_i \mathbb{1}[0.3 < a_i < 0.4],
//! \quad a_i = \left| \tfrac{x_i}{H-1} - \tfrac12 \right|.
//! \]

use super::{Env, Preprocessor, State};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct HyperGridConfig {
    pub ndim: usize,
    pub height: usize,
    pub r0: f32,
    pub r1: f32,
    pub r2: f32,
    /// Use the oscillating `cos`-based reward instead of the step reward.
    pub reward_cos: bool,
    pub preprocessor: Preprocessor,
}

impl Default for HyperGridConfig {
    fn default() -> Self {
        Self {
            ndim: 2,
            height: 4,
            r0: 0.1,
            r1: 0.5,
            r2: 2.0,
            reward_cos: false,
            preprocessor: Preprocessor::KHot,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HyperGrid {
    config: HyperGridConfig,
}

impl HyperGrid {
    pub fn new(config: HyperGridConfig) -> Result<Self> {
        if config.ndim == 0 {
            return Err(Error::Configuration("HyperGrid ndim must be >= 1".into()));
        }
        if config.height < 2 {
            return Err(Error::Configuration("HyperGrid height must be >= 2".into()));
        }
        if !(config.r0 > 0.0) || config.r1 < 0.0 || config.r2 < 0.0 {
            return Err(Error::Configuration(
                "HyperGrid rewards need r0 > 0 and r1, r2 >= 0".into(),
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &HyperGridConfig {
        &self.config
    }

    fn reward(&self, s: &State) -> f32 {
        let c = &self.config;
        let scale = (c.height - 1) as f32;
        let ax: Vec<f32> = s
            .coords()
            .iter()
            .map(|&x| (x as f32 / scale - 0.5).abs())
            .collect();
        if c.reward_cos {
            let inv_sqrt_2pi = 1.0 / (2.0 * core::f32::consts::PI).sqrt();
            let prod: f32 = ax
                .iter()
                .map(|&a| {
                    let z = 5.0 * a;
                    ((a * 50.0).cos() + 1.0) * inv_sqrt_2pi * (-0.5 * z * z).exp()
                })
                .product();
            c.r0 + prod * c.r1
        } else {
            let outer = ax.iter().all(|&a| a > 0.25);
            let band = ax.iter().all(|&a| a > 0.3 && a < 0.4);
            c.r0 + if outer { c.r1 } else { 0.0 } + if band { c.r2 } else { 0.0 }
        }
    }
}

impl Env for HyperGrid {
    fn n_actions(&self) -> usize {
        self.config.ndim + 1
    }

    fn check_state(&self, s: &State) -> Result<()> {
        let h = self.config.height as i64;
        if s.coords().len() != self.config.ndim || s.coords().iter().any(|&x| x < 0 || x >= h) {
            return Err(Error::Invariant(format!(
                "{:?} is not a HyperGrid state",
                s.coords()
            )));
        }
        Ok(())
    }

    /// `None` when `height^ndim` overflows `usize`.
    fn n_states(&self) -> Option<usize> {
        let ndim = u32::try_from(self.config.ndim).ok()?;
        self.config.height.checked_pow(ndim)
    }

    fn state_dim(&self) -> usize {
        self.config.ndim
    }

    fn s0(&self) -> State {
        State(vec![0; self.config.ndim])
    }

    fn forward_mask(&self, s: &State) -> Vec<bool> {
        let top = self.config.height as i64 - 1;
        let mut mask: Vec<bool> = s.coords().iter().map(|&x| x < top).collect();
        mask.push(true);
        mask
    }

    fn backward_mask(&self, s: &State) -> Vec<bool> {
        s.coords().iter().map(|&x| x > 0).collect()
    }

    fn step(&self, s: &State, action: usize) -> Result<State> {
        self.check_state(s)?;
        if action >= self.config.ndim {
            return Err(Error::InvalidAction {
                action,
                reason: "exit is not a state transition",
            });
        }
        if !self.forward_mask(s)[action] {
            return Err(Error::InvalidAction {
                action,
                reason: "coordinate already at the grid edge",
            });
        }
        let mut next = s.clone();
        next.0[action] += 1;
        Ok(next)
    }

    fn backward_step(&self, s: &State, action: usize) -> Result<State> {
        self.check_state(s)?;
        if action >= self.config.ndim || !self.backward_mask(s)[action] {
            return Err(Error::InvalidAction {
                action,
                reason: "no parent along this coordinate",
            });
        }
        let mut parent = s.clone();
        parent.0[action] -= 1;
        Ok(parent)
    }

    fn log_reward(&self, s: &State) -> f32 {
        self.reward(s).ln()
    }

    fn state_index(&self, s: &State) -> Option<usize> {
        self.check_state(s).ok()?;
        let h = self.config.height;
        s.coords()
            .iter()
            .try_fold(0usize, |idx, &x| idx.checked_mul(h)?.checked_add(x as usize))
    }

    fn preprocessor(&self) -> Preprocessor {
        self.config.preprocessor
    }

    fn terminating_states(&self) -> Option<Vec<State>> {
        let n = self.n_states()?;
        let h = self.config.height;
        let d = self.config.ndim;
        let states = (0..n)
            .map(|mut idx| {
                let mut coords = vec![0i64; d];
                for k in (0..d).rev() {
                    coords[k] = (idx % h) as i64;
                    idx /= h;
                }
                State(coords)
            })
            .collect();
        Some(states)
    }

    fn coordinate_cardinality(&self) -> Option<usize> {
        Some(self.config.height)
    }
}
