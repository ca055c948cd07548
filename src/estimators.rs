//! Estimators: a [`Module`] bound to an [`Env`], producing log-scores for batches of states.
//!
//! Each estimator returns an evaluation record holding the preprocessed inputs, so the caller
//! can send `d(loss)/d(score)` back through the module without re-preprocessing.

use std::fmt;
use std::rc::Rc;

use ndarray::{Array1, Array2};

use crate::env::{Env, Preprocessor, State};
use crate::math::{log_softmax_masked, softmax_masked};
use crate::nn::{Gradients, Module, Param};
use crate::{Error, Result};

/// Which policy a [`ProbabilityEstimator`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `P_F(a | s)` over all `n_actions` (exit included).
    Forward,
    /// `P_B(a | s')` over the `n_actions - 1` non-exit actions.
    Backward,
}

fn check_module(env: &dyn Env, module: &dyn Module, output_dim: usize, what: &str) -> Result<()> {
    if module.output_dim() != output_dim {
        return Err(Error::Configuration(format!(
            "{what} needs output_dim {output_dim}, module has {}",
            module.output_dim()
        )));
    }
    if module.takes_state_index() && env.preprocessor() != Preprocessor::Enum {
        return Err(Error::Configuration(format!(
            "{what}: a tabular module needs the Enum preprocessor, env uses {:?}",
            env.preprocessor()
        )));
    }
    let Some(module_in) = module.input_dim() else {
        return Ok(());
    };
    let (expected, unit) = if module.takes_state_index() {
        let n = env.n_states().ok_or_else(|| {
            Error::Configuration(format!("{what}: a tabular module needs an enumerable env"))
        })?;
        (n, "states")
    } else {
        (env.preprocessor().output_dim(env)?, "input columns")
    };
    if module_in != expected {
        return Err(Error::Configuration(format!(
            "{what}: env has {expected} {unit}, module was built for {module_in}"
        )));
    }
    Ok(())
}

/// Log-probabilities of chosen actions, plus what the backward pass needs.
#[derive(Debug, Clone)]
pub struct PolicyEvaluation {
    pub inputs: Array2<f32>,
    /// Masked log-softmax rows (`-inf` on invalid actions).
    pub log_probs: Array2<f32>,
    pub masks: Vec<Vec<bool>>,
    pub actions: Vec<usize>,
}

impl PolicyEvaluation {
    /// `log P(actions[i] | states[i])` for each row.
    pub fn chosen(&self) -> Array1<f32> {
        Array1::from_iter(
            self.actions
                .iter()
                .enumerate()
                .map(|(i, &a)| self.log_probs[[i, a]]),
        )
    }
}

/// Logit estimator for a forward or backward policy.
pub struct ProbabilityEstimator {
    env: Rc<dyn Env>,
    module: Box<dyn Module>,
    direction: Direction,
}

impl fmt::Debug for ProbabilityEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbabilityEstimator")
            .field("direction", &self.direction)
            .field("module", &self.module)
            .finish()
    }
}

impl ProbabilityEstimator {
    pub fn new(env: Rc<dyn Env>, module: Box<dyn Module>, direction: Direction) -> Result<Self> {
        let dim = match direction {
            Direction::Forward => env.n_actions(),
            Direction::Backward => env.n_actions() - 1,
        };
        check_module(env.as_ref(), module.as_ref(), dim, "ProbabilityEstimator")?;
        Ok(Self {
            env,
            module,
            direction,
        })
    }

    pub fn env(&self) -> &Rc<dyn Env> {
        &self.env
    }

    pub fn module(&self) -> &dyn Module {
        self.module.as_ref()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn mask(&self, s: &State) -> Vec<bool> {
        match self.direction {
            Direction::Forward => self.env.forward_mask(s),
            Direction::Backward => self.env.backward_mask(s),
        }
    }

    /// Raw logits and masks for a batch of states.
    pub fn logits(&self, states: &[State]) -> Result<(Array2<f32>, Array2<f32>, Vec<Vec<bool>>)> {
        let inputs = self.env.preprocessor().apply(self.env.as_ref(), states)?;
        let logits = self.module.forward(&inputs.view());
        let masks: Vec<Vec<bool>> = states.iter().map(|s| self.mask(s)).collect();
        Ok((inputs, logits, masks))
    }

    /// `log P(actions[i] | states[i])` with the evaluation kept for [`Self::backward`].
    ///
    /// Fails with [`Error::Invariant`] if a chosen action is masked or a state has no valid action.
    pub fn evaluate(&self, states: &[State], actions: &[usize]) -> Result<PolicyEvaluation> {
        if states.len() != actions.len() {
            return Err(Error::Shape("states and actions must have the same length"));
        }
        let (inputs, logits, masks) = self.logits(states)?;
        let mut log_probs = Array2::<f32>::zeros(logits.dim());
        for (i, mask) in masks.iter().enumerate() {
            let a = actions[i];
            if a >= mask.len() || !mask[a] {
                return Err(Error::Invariant(format!(
                    "{:?} action {a} is not valid from {:?}",
                    self.direction,
                    states[i].coords()
                )));
            }
            let row = logits.row(i).to_vec();
            let lp = log_softmax_masked(&row, mask);
            log_probs
                .row_mut(i)
                .assign(&Array1::from_vec(lp));
        }
        Ok(PolicyEvaluation {
            inputs,
            log_probs,
            masks,
            actions: actions.to_vec(),
        })
    }

    /// Backpropagate `grad_chosen[i] = d(loss)/d(log P(actions[i] | states[i]))`.
    ///
    /// `d log_softmax(z)_a / dz = onehot(a) - softmax(z)` on valid entries.
    pub fn backward(
        &self,
        eval: &PolicyEvaluation,
        grad_chosen: &[f32],
        grads: &mut Gradients,
    ) {
        let logits = self.module.forward(&eval.inputs.view());
        let mut grad_logits = Array2::<f32>::zeros(logits.dim());
        for (i, &g) in grad_chosen.iter().enumerate() {
            if g == 0.0 {
                continue;
            }
            let probs = softmax_masked(&logits.row(i).to_vec(), &eval.masks[i]);
            for (k, p) in probs.iter().enumerate() {
                grad_logits[[i, k]] = -g * p;
            }
            grad_logits[[i, eval.actions[i]]] += g;
        }
        self.module
            .backward(&eval.inputs.view(), &grad_logits.view(), grads);
    }
}

/// Scalar flow values with the inputs used to produce them.
#[derive(Debug, Clone)]
pub struct FlowEvaluation {
    pub inputs: Array2<f32>,
    pub values: Array1<f32>,
}

/// `log F(s)`, optionally forward-looking (`log F(s) = module(s) + log R(s)`).
pub struct LogStateFlowEstimator {
    env: Rc<dyn Env>,
    module: Box<dyn Module>,
    forward_looking: bool,
}

impl fmt::Debug for LogStateFlowEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStateFlowEstimator")
            .field("forward_looking", &self.forward_looking)
            .field("module", &self.module)
            .finish()
    }
}

impl LogStateFlowEstimator {
    pub fn new(env: Rc<dyn Env>, module: Box<dyn Module>, forward_looking: bool) -> Result<Self> {
        check_module(env.as_ref(), module.as_ref(), 1, "LogStateFlowEstimator")?;
        Ok(Self {
            env,
            module,
            forward_looking,
        })
    }

    pub fn env(&self) -> &Rc<dyn Env> {
        &self.env
    }

    pub fn module(&self) -> &dyn Module {
        self.module.as_ref()
    }

    pub fn forward_looking(&self) -> bool {
        self.forward_looking
    }

    pub fn evaluate(&self, states: &[State]) -> Result<FlowEvaluation> {
        let inputs = self.env.preprocessor().apply(self.env.as_ref(), states)?;
        let out = self.module.forward(&inputs.view());
        let mut values = out.column(0).to_owned();
        if self.forward_looking {
            for (v, s) in values.iter_mut().zip(states) {
                *v += self.env.log_reward(s);
            }
        }
        Ok(FlowEvaluation { inputs, values })
    }

    /// Backpropagate `grad[i] = d(loss)/d(log F(states[i]))`; the reward offset is constant.
    pub fn backward(&self, eval: &FlowEvaluation, grad: &[f32], grads: &mut Gradients) {
        let g = Array2::from_shape_fn((grad.len(), 1), |(i, _)| grad[i]);
        self.module.backward(&eval.inputs.view(), &g.view(), grads);
    }
}

/// `log F(s -> s')` for every non-exit action out of `s`.
///
/// The exit edge is not learned: flow matching scores it with `log R(s)`.
pub struct LogEdgeFlowEstimator {
    env: Rc<dyn Env>,
    module: Box<dyn Module>,
}

impl fmt::Debug for LogEdgeFlowEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEdgeFlowEstimator")
            .field("module", &self.module)
            .finish()
    }
}

impl LogEdgeFlowEstimator {
    pub fn new(env: Rc<dyn Env>, module: Box<dyn Module>) -> Result<Self> {
        let dim = env.n_actions() - 1;
        check_module(env.as_ref(), module.as_ref(), dim, "LogEdgeFlowEstimator")?;
        Ok(Self { env, module })
    }

    pub fn env(&self) -> &Rc<dyn Env> {
        &self.env
    }

    pub fn module(&self) -> &dyn Module {
        self.module.as_ref()
    }

    /// `(inputs, [states.len(), n_actions - 1] edge log-flows)`.
    pub fn evaluate(&self, states: &[State]) -> Result<(Array2<f32>, Array2<f32>)> {
        let inputs = self.env.preprocessor().apply(self.env.as_ref(), states)?;
        let out = self.module.forward(&inputs.view());
        Ok((inputs, out))
    }

    pub fn backward(&self, inputs: &Array2<f32>, grad: &Array2<f32>, grads: &mut Gradients) {
        self.module.backward(&inputs.view(), &grad.view(), grads);
    }

    /// Forward-policy logits induced by the edge flows: learned non-exit edges, `log R(s)` for
    /// the exit edge.
    pub fn policy_logits(&self, states: &[State]) -> Result<Array2<f32>> {
        let (_, edges) = self.evaluate(states)?;
        let n_actions = self.env.n_actions();
        let mut logits = Array2::<f32>::zeros((states.len(), n_actions));
        for (i, s) in states.iter().enumerate() {
            logits
                .row_mut(i)
                .slice_mut(ndarray::s![..n_actions - 1])
                .assign(&edges.row(i));
            logits[[i, n_actions - 1]] = if self.env.forward_mask(s)[n_actions - 1] {
                self.env.log_reward(s)
            } else {
                f32::NEG_INFINITY
            };
        }
        Ok(logits)
    }
}

/// The learned log-partition scalar.
#[derive(Debug, Clone)]
pub struct LogZEstimator {
    param: Param,
}

impl LogZEstimator {
    pub fn new(init: f32) -> Self {
        Self {
            param: Param::new(Array2::from_elem((1, 1), init)),
        }
    }

    pub fn value(&self) -> f32 {
        self.param.value()[[0, 0]]
    }

    pub fn param(&self) -> &Param {
        &self.param
    }

    pub fn backward(&self, grad: f32, grads: &mut Gradients) {
        grads.accumulate_with(&self.param, |g| g[[0, 0]] += grad);
    }
}

/// Untyped estimator, for building a parametrization from a list.
#[derive(Debug)]
pub enum Estimator {
    Probability(ProbabilityEstimator),
    LogStateFlow(LogStateFlowEstimator),
    LogEdgeFlow(LogEdgeFlowEstimator),
    LogZ(LogZEstimator),
}

impl Estimator {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Probability(p) if p.direction() == Direction::Forward => "forward policy",
            Self::Probability(_) => "backward policy",
            Self::LogStateFlow(_) => "state flow",
            Self::LogEdgeFlow(_) => "edge flow",
            Self::LogZ(_) => "logZ",
        }
    }
}
