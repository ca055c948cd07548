//! Flow matching (Bengio et al., 2021).
//!
//! For every non-initial state `s`:
//!
//! - `log inflow(s) = logsumexp over (parent, a) → s of log F(parent --a--> s)`
//! - `log outflow(s) = logsumexp of log F(s --a--> ·) over valid non-exit `a`, plus `log R(s)`
//!   when exiting from `s` is valid`
//!
//! The loss is the mean of `(log inflow − log outflow)²`.

use ndarray::{Array1, Array2};

use crate::containers::{FlowState, FlowStates};
use crate::env::State;
use crate::math::{logsumexp, softmax};
use crate::nn::Gradients;
use crate::parametrizations::FmParametrization;
use crate::{Error, Result};

use super::{finish, GradMode, Loss, LossOutput};

#[derive(Debug, Clone)]
pub struct FlowMatching<'a> {
    param: &'a FmParametrization,
}

/// Log-space inflow/outflow terms of one state, and where each came from.
struct Terms {
    /// `(row in the parents batch, action)` per incoming edge.
    incoming: Vec<(usize, usize)>,
    in_values: Vec<f32>,
    /// Outgoing non-exit actions (the exit reward, if any, is the last value).
    outgoing: Vec<usize>,
    out_values: Vec<f32>,
}

fn check_edges(i: usize, fs: &FlowState) -> Result<()> {
    if fs.incoming.is_empty() {
        return Err(Error::Invariant(format!(
            "flow state {i} {:?} has no incoming edge",
            fs.state.coords()
        )));
    }
    if fs.outgoing.is_empty() && fs.log_reward.is_none() {
        return Err(Error::Invariant(format!(
            "flow state {i} {:?} has neither an outgoing edge nor an exit",
            fs.state.coords()
        )));
    }
    Ok(())
}

impl<'a> FlowMatching<'a> {
    pub fn new(param: &'a FmParametrization) -> Self {
        Self { param }
    }

    /// `(log inflow, log outflow)` per state.
    pub fn log_flows(&self, states: &FlowStates) -> Result<(Array1<f32>, Array1<f32>)> {
        let (terms, ..) = self.terms(states)?;
        let inflow = terms.iter().map(|t| logsumexp(&t.in_values)).collect();
        let outflow = terms.iter().map(|t| logsumexp(&t.out_values)).collect();
        Ok((inflow, outflow))
    }

    #[allow(clippy::type_complexity)]
    fn terms(
        &self,
        states: &FlowStates,
    ) -> Result<(Vec<Terms>, (Array2<f32>, Array2<f32>), (Array2<f32>, Array2<f32>))> {
        let edge = &self.param.log_f_edge;
        if edge.env().n_actions() != states.env().n_actions() {
            return Err(Error::Configuration(format!(
                "edge flow expects {} actions, states have {}",
                edge.env().n_actions(),
                states.env().n_actions()
            )));
        }
        if states.is_empty() {
            return Err(Error::Invariant("empty flow-state batch".into()));
        }
        for (i, fs) in states.iter().enumerate() {
            check_edges(i, fs)?;
        }

        let parents: Vec<State> = states
            .iter()
            .flat_map(|fs| fs.incoming.iter().map(|e| e.parent.clone()))
            .collect();
        let own: Vec<State> = states.iter().map(|fs| fs.state.clone()).collect();
        let (parent_inputs, parent_edges) = edge.evaluate(&parents)?;
        let (own_inputs, own_edges) = edge.evaluate(&own)?;

        let mut row = 0;
        let mut terms = Vec::with_capacity(states.len());
        for (i, fs) in states.iter().enumerate() {
            let incoming: Vec<(usize, usize)> = fs
                .incoming
                .iter()
                .enumerate()
                .map(|(k, e)| (row + k, e.action))
                .collect();
            row += fs.incoming.len();
            let in_values = incoming.iter().map(|&(r, a)| parent_edges[[r, a]]).collect();
            let mut out_values: Vec<f32> = fs.outgoing.iter().map(|&a| own_edges[[i, a]]).collect();
            out_values.extend(fs.log_reward);
            terms.push(Terms {
                incoming,
                in_values,
                outgoing: fs.outgoing.clone(),
                out_values,
            });
        }
        Ok((terms, (parent_inputs, parent_edges), (own_inputs, own_edges)))
    }
}

impl Loss<FlowStates> for FlowMatching<'_> {
    fn evaluate(&self, states: &FlowStates, mode: GradMode) -> Result<LossOutput> {
        let (terms, (parent_inputs, parent_edges), (own_inputs, own_edges)) = self.terms(states)?;
        let n = terms.len() as f32;
        let residuals: Vec<f32> = terms
            .iter()
            .map(|t| logsumexp(&t.in_values) - logsumexp(&t.out_values))
            .collect();
        let value = residuals.iter().map(|r| r * r).sum::<f32>() / n;

        let mut grads = Gradients::new();
        if mode == GradMode::WithGrads {
            let mut g_parents = Array2::<f32>::zeros(parent_edges.dim());
            let mut g_own = Array2::<f32>::zeros(own_edges.dim());
            for (i, (t, r)) in terms.iter().zip(&residuals).enumerate() {
                let g = 2.0 * r / n;
                // d logsumexp / d x_k = softmax(x)_k
                for (w, &(row, a)) in softmax(&t.in_values).iter().zip(&t.incoming) {
                    g_parents[[row, a]] += g * w;
                }
                for (w, &a) in softmax(&t.out_values).iter().zip(&t.outgoing) {
                    g_own[[i, a]] -= g * w;
                }
            }
            let edge = &self.param.log_f_edge;
            edge.backward(&parent_inputs, &g_parents, &mut grads);
            edge.backward(&own_inputs, &g_own, &mut grads);
        }
        finish("FM", value, states.len(), grads, Vec::new())
    }
}
