//! Function approximators backing the estimators.
//!
//! These are intentionally boring baselines: enough structure to train the GFlowNet losses
//! without importing a full ML framework.
//!
//! - [`Param`] is a shared handle to one weight matrix. Cloning a `Param` ties it: both clones
//!   point at the same storage and have the same [`ParamId`].
//! - [`Module::backward`] takes `d(loss)/d(outputs)` and accumulates `d(loss)/d(param)` into a
//!   [`Gradients`] buffer keyed by `ParamId`, so tied parameters receive summed gradients.
//! - Forward passes use explicit loops with a fixed summation order; a row's output does not
//!   depend on which other rows share the batch.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;

use ndarray::{Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Identity of a [`Param`]'s storage. Equal ids mean the same (tied) parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(usize);

/// A trainable weight matrix behind a shared handle.
#[derive(Debug, Clone)]
pub struct Param(Rc<RefCell<Array2<f32>>>);

impl Param {
    pub fn new(value: Array2<f32>) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::new(Array2::zeros((rows, cols)))
    }

    pub fn id(&self) -> ParamId {
        ParamId(Rc::as_ptr(&self.0) as usize)
    }

    /// `true` iff both handles share storage (identity, not value equality).
    pub fn is_tied_to(&self, other: &Param) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn value(&self) -> Ref<'_, Array2<f32>> {
        self.0.borrow()
    }

    pub fn value_mut(&self) -> RefMut<'_, Array2<f32>> {
        self.0.borrow_mut()
    }

    pub fn dim(&self) -> (usize, usize) {
        self.0.borrow().dim()
    }
}

/// Accumulated `d(loss)/d(param)` for every parameter touched by a backward pass.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: HashMap<ParamId, Array2<f32>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the gradient buffer of `param`, creating a zero buffer on first use.
    pub fn accumulate_with(&mut self, param: &Param, f: impl FnOnce(&mut Array2<f32>)) {
        let buf = self
            .grads
            .entry(param.id())
            .or_insert_with(|| Array2::zeros(param.dim()));
        f(buf);
    }

    pub fn get(&self, param: &Param) -> Option<&Array2<f32>> {
        self.grads.get(&param.id())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// L2 norm over all buffers.
    pub fn global_norm(&self) -> f32 {
        let s: f64 = self
            .grads
            .values()
            .flat_map(|g| g.iter())
            .map(|&x| (x as f64) * (x as f64))
            .sum();
        s.sqrt() as f32
    }
}

/// A differentiable map from a batch of preprocessed states to per-row outputs.
pub trait Module: std::fmt::Debug {
    fn output_dim(&self) -> usize;

    /// Input width the module was built for. For a state-index module, the number of states it
    /// can index. `None` accepts any width.
    fn input_dim(&self) -> Option<usize> {
        None
    }

    /// `inputs` is `[batch, input_dim]`; returns `[batch, output_dim]`.
    fn forward(&self, inputs: &ArrayView2<f32>) -> Array2<f32>;

    /// Accumulate parameter gradients given `grad_outputs = d(loss)/d(forward(inputs))`.
    fn backward(
        &self,
        inputs: &ArrayView2<f32>,
        grad_outputs: &ArrayView2<f32>,
        grads: &mut Gradients,
    );

    /// Parameters in a stable order, named relative to the module.
    fn named_parameters(&self) -> Vec<(String, Param)>;

    /// Whether the module reads column 0 of its input as a state index.
    fn takes_state_index(&self) -> bool {
        false
    }
}

/// One row of learned outputs per state; input column 0 is the state index.
#[derive(Debug, Clone)]
pub struct Tabular {
    table: Param,
}

impl Tabular {
    pub fn new(n_states: usize, output_dim: usize) -> Self {
        Self {
            table: Param::zeros(n_states, output_dim),
        }
    }

    pub fn n_states(&self) -> usize {
        self.table.dim().0
    }

    pub fn table(&self) -> &Param {
        &self.table
    }
}

impl Module for Tabular {
    fn output_dim(&self) -> usize {
        self.table.dim().1
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.n_states())
    }

    fn forward(&self, inputs: &ArrayView2<f32>) -> Array2<f32> {
        let table = self.table.value();
        let mut out = Array2::<f32>::zeros((inputs.nrows(), table.ncols()));
        for i in 0..inputs.nrows() {
            let idx = inputs[[i, 0]] as usize;
            debug_assert!(idx < table.nrows());
            out.row_mut(i).assign(&table.row(idx));
        }
        out
    }

    fn backward(
        &self,
        inputs: &ArrayView2<f32>,
        grad_outputs: &ArrayView2<f32>,
        grads: &mut Gradients,
    ) {
        grads.accumulate_with(&self.table, |g| {
            for i in 0..inputs.nrows() {
                let idx = inputs[[i, 0]] as usize;
                let mut row = g.row_mut(idx);
                row += &grad_outputs.row(i);
            }
        });
    }

    fn named_parameters(&self) -> Vec<(String, Param)> {
        vec![("table".to_string(), self.table.clone())]
    }

    fn takes_state_index(&self) -> bool {
        true
    }
}

/// Constant zero outputs: a uniform policy over valid actions, or `log F = 0` for a flow.
#[derive(Debug, Clone, Copy)]
pub struct Uniform {
    output_dim: usize,
}

/// `Uniform` used as a flow estimator (`log F ≡ 0`).
pub type Zero = Uniform;

impl Uniform {
    pub fn new(output_dim: usize) -> Self {
        Self { output_dim }
    }
}

impl Module for Uniform {
    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn forward(&self, inputs: &ArrayView2<f32>) -> Array2<f32> {
        Array2::zeros((inputs.nrows(), self.output_dim))
    }

    fn backward(&self, _: &ArrayView2<f32>, _: &ArrayView2<f32>, _: &mut Gradients) {}

    fn named_parameters(&self) -> Vec<(String, Param)> {
        Vec::new()
    }
}

/// Dense layer `y = x W + b` with `W: [in, out]`, `b: [1, out]`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Param,
    bias: Param,
}

impl Linear {
    /// Uniform init in `±1/sqrt(in_dim)` for both weight and bias.
    pub fn new(in_dim: usize, out_dim: usize, rng: &mut impl Rng) -> Self {
        debug_assert!(in_dim > 0 && out_dim > 0);
        let bound = 1.0 / (in_dim as f32).sqrt();
        let w = Array2::from_shape_fn((in_dim, out_dim), |_| rng.random_range(-bound..bound));
        let b = Array2::from_shape_fn((1, out_dim), |_| rng.random_range(-bound..bound));
        Self {
            weight: Param::new(w),
            bias: Param::new(b),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.dim().0
    }

    pub fn out_dim(&self) -> usize {
        self.weight.dim().1
    }

    fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let w = self.weight.value();
        let b = self.bias.value();
        let (n, d_in) = x.dim();
        let d_out = w.ncols();
        debug_assert_eq!(d_in, w.nrows());
        let mut out = Array2::<f32>::zeros((n, d_out));
        for i in 0..n {
            for j in 0..d_out {
                let mut s = b[[0, j]];
                for k in 0..d_in {
                    s += x[[i, k]] * w[[k, j]];
                }
                out[[i, j]] = s;
            }
        }
        out
    }

    /// Accumulates `dW`, `db` and returns `d(loss)/d(x)`.
    fn backward(
        &self,
        x: &ArrayView2<f32>,
        g: &ArrayView2<f32>,
        grads: &mut Gradients,
    ) -> Array2<f32> {
        let (n, d_in) = x.dim();
        let d_out = g.ncols();
        grads.accumulate_with(&self.weight, |dw| {
            for i in 0..n {
                for k in 0..d_in {
                    let xik = x[[i, k]];
                    if xik == 0.0 {
                        continue;
                    }
                    for j in 0..d_out {
                        dw[[k, j]] += xik * g[[i, j]];
                    }
                }
            }
        });
        grads.accumulate_with(&self.bias, |db| {
            for i in 0..n {
                for j in 0..d_out {
                    db[[0, j]] += g[[i, j]];
                }
            }
        });
        let w = self.weight.value();
        let mut dx = Array2::<f32>::zeros((n, d_in));
        for i in 0..n {
            for k in 0..d_in {
                let mut s = 0.0f32;
                for j in 0..d_out {
                    s += g[[i, j]] * w[[k, j]];
                }
                dx[[i, k]] = s;
            }
        }
        dx
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Param)> {
        vec![
            (format!("{prefix}.weight"), self.weight.clone()),
            (format!("{prefix}.bias"), self.bias.clone()),
        ]
    }
}

/// Hidden stack of `Linear + ReLU` layers. Cloning a torso ties its parameters.
#[derive(Debug, Clone)]
pub struct Torso {
    layers: Vec<Linear>,
}

impl Torso {
    pub fn new(input_dim: usize, config: &NeuralNetConfig, rng: &mut impl Rng) -> Self {
        let mut layers = Vec::with_capacity(config.n_hidden_layers);
        let mut d = input_dim;
        for _ in 0..config.n_hidden_layers {
            layers.push(Linear::new(d, config.hidden_dim, rng));
            d = config.hidden_dim;
        }
        Self { layers }
    }

    pub fn input_dim(&self) -> Option<usize> {
        self.layers.first().map(Linear::in_dim)
    }

    pub fn output_dim(&self) -> Option<usize> {
        self.layers.last().map(Linear::out_dim)
    }

    /// Inputs of every layer plus the final activation (`layers.len() + 1` entries).
    fn activations(&self, inputs: &ArrayView2<f32>) -> Vec<Array2<f32>> {
        let mut acts = Vec::with_capacity(self.layers.len() + 1);
        acts.push(inputs.to_owned());
        for layer in &self.layers {
            let mut h = layer.forward(&acts[acts.len() - 1].view());
            h.mapv_inplace(|v| v.max(0.0));
            acts.push(h);
        }
        acts
    }
}

/// MLP hyperparameters.
#[derive(Debug, Clone)]
pub struct NeuralNetConfig {
    pub hidden_dim: usize,
    pub n_hidden_layers: usize,
    /// Initialization seed.
    pub seed: u64,
}

impl Default for NeuralNetConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 256,
            n_hidden_layers: 2,
            seed: 0,
        }
    }
}

/// `head(torso(x))`, where the torso may be shared with another network.
#[derive(Debug, Clone)]
pub struct NeuralNet {
    torso: Torso,
    head: Linear,
}

impl NeuralNet {
    pub fn new(input_dim: usize, output_dim: usize, config: &NeuralNetConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let torso = Torso::new(input_dim, config, &mut rng);
        let head_in = torso.output_dim().unwrap_or(input_dim);
        let head = Linear::new(head_in, output_dim, &mut rng);
        Self { torso, head }
    }

    /// A new head on top of an existing (shared) torso.
    pub fn with_torso(torso: Torso, input_dim: usize, output_dim: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let head_in = torso.output_dim().unwrap_or(input_dim);
        let head = Linear::new(head_in, output_dim, &mut rng);
        Self { torso, head }
    }

    pub fn torso(&self) -> &Torso {
        &self.torso
    }
}

impl Module for NeuralNet {
    fn output_dim(&self) -> usize {
        self.head.out_dim()
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.torso.input_dim().unwrap_or(self.head.in_dim()))
    }

    fn forward(&self, inputs: &ArrayView2<f32>) -> Array2<f32> {
        let acts = self.torso.activations(inputs);
        self.head.forward(&acts[acts.len() - 1].view())
    }

    fn backward(
        &self,
        inputs: &ArrayView2<f32>,
        grad_outputs: &ArrayView2<f32>,
        grads: &mut Gradients,
    ) {
        let acts = self.torso.activations(inputs);
        let mut g = self
            .head
            .backward(&acts[acts.len() - 1].view(), grad_outputs, grads);
        for (k, layer) in self.torso.layers.iter().enumerate().rev() {
            // relu'(pre) == 1 exactly where the post-activation is positive
            ndarray::Zip::from(&mut g)
                .and(&acts[k + 1])
                .for_each(|gv, &h| {
                    if h <= 0.0 {
                        *gv = 0.0;
                    }
                });
            g = layer.backward(&acts[k].view(), &g.view(), grads);
        }
    }

    fn named_parameters(&self) -> Vec<(String, Param)> {
        let mut out = Vec::new();
        for (k, layer) in self.torso.layers.iter().enumerate() {
            out.extend(layer.named_parameters(&format!("torso.{k}")));
        }
        out.extend(self.head.named_parameters("head"));
        out
    }
}

/// Plain gradient descent: `p -= lr * grad`.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    pub lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }

    /// Update every parameter that has a gradient; others are left untouched.
    pub fn step<'a>(&self, params: impl IntoIterator<Item = &'a Param>, grads: &Gradients) {
        for p in params {
            if let Some(g) = grads.get(p) {
                let mut v = p.value_mut();
                v.scaled_add(-self.lr, g);
            }
        }
    }
}
