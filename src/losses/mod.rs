//! GFlowNet training objectives.
//!
//! Every loss is a scalar mean (or weighted sum) over a batch, returned together with analytic
//! gradients for every parameter it touches:
//!
//! | loss | batch | objective |
//! |---|---|---|
//! | [`FlowMatching`] | [`FlowStates`] | `(log inflow − log outflow)²` |
//! | [`DetailedBalance`] | [`Transitions`] | `(log F(s) + log P_F − log F(s') − log P_B)²` |
//! | [`TrajectoryBalance`] | [`Trajectories`] | `(log Z + Σ log P_F − Σ log P_B − log R)²` |
//! | [`SubTrajectoryBalance`] | [`Trajectories`] | weighted DB/TB residuals over sub-trajectories |
//! | [`LogPartitionVariance`] | [`Trajectories`] | `Var_b(Σ log P_F − Σ log P_B − log R)` |
//!
//! Numerical trouble is reported two ways: hard failures (non-finite loss, strict ill-conditioned
//! variance) are [`Error`]s; soft ones are [`NumericWarning`]s, logged with `tracing::warn!` and
//! returned in [`LossOutput::warnings`].

use std::fmt;

use tracing::{debug, warn};

use crate::containers::{FlowStates, Trajectories, Transitions};
use crate::nn::Gradients;
use crate::{Error, Result};

pub mod detailed_balance;
pub mod flow_matching;
pub mod log_partition_variance;
pub mod scoring;
pub mod sub_trajectory_balance;
pub mod trajectory_balance;

pub use detailed_balance::{DetailedBalance, DetailedBalanceConfig};
pub use flow_matching::FlowMatching;
pub use log_partition_variance::{LogPartitionVariance, LogPartitionVarianceConfig};
pub use scoring::{get_pfs_and_pbs, get_trajectories_scores, StepLogProbs, TrajectoryScores};
pub use sub_trajectory_balance::{
    SubTrajectoryBalance, SubTrajectoryBalanceConfig, SubTrajectoryResidual, SubTbWeighing,
};
pub use trajectory_balance::{TrajectoryBalance, TrajectoryBalanceConfig};

/// Log-probabilities below this are flagged with [`NumericWarning::ExtremeLogProbability`].
pub const EXTREME_LOG_PROB: f32 = -100.0;

/// Default lower clip on `log R` inside trajectory-level scores.
pub const DEFAULT_LOG_REWARD_CLIP_MIN: f32 = -12.0;

/// A recoverable numerical condition met while computing a loss.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericWarning {
    /// A variance over a batch of one trajectory is always zero and carries no signal.
    IllConditionedVariance { batch_size: usize },
    /// Some valid step has `log P < EXTREME_LOG_PROB`.
    ExtremeLogProbability { min: f32 },
}

impl fmt::Display for NumericWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllConditionedVariance { batch_size } => {
                write!(f, "variance over a batch of {batch_size} trajectory is ill-conditioned")
            }
            Self::ExtremeLogProbability { min } => {
                write!(f, "log-probability {min} below {EXTREME_LOG_PROB}")
            }
        }
    }
}

/// Whether a loss evaluation also backpropagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradMode {
    ValueOnly,
    WithGrads,
}

/// A loss value with its gradients (empty under [`GradMode::ValueOnly`]).
#[derive(Debug, Clone, Default)]
pub struct LossOutput {
    pub value: f32,
    pub grads: Gradients,
    pub warnings: Vec<NumericWarning>,
}

/// A training objective over batches of type `B`.
pub trait Loss<B: ?Sized> {
    fn evaluate(&self, batch: &B, mode: GradMode) -> Result<LossOutput>;

    fn loss(&self, batch: &B) -> Result<f32> {
        Ok(self.evaluate(batch, GradMode::ValueOnly)?.value)
    }

    fn loss_and_grads(&self, batch: &B) -> Result<LossOutput> {
        self.evaluate(batch, GradMode::WithGrads)
    }
}

/// Check the value, log warnings and a summary, and package the output.
pub(crate) fn finish(
    loss: &'static str,
    value: f32,
    batch_size: usize,
    grads: Gradients,
    warnings: Vec<NumericWarning>,
) -> Result<LossOutput> {
    if !value.is_finite() {
        return Err(Error::NonFinite(loss));
    }
    for w in &warnings {
        warn!(loss, %w, "numerical warning");
    }
    debug!(loss, value, batch_size, n_grads = grads.len(), "loss evaluated");
    Ok(LossOutput {
        value,
        grads,
        warnings,
    })
}

/// Per-loss settings, one variant per objective.
#[derive(Debug, Clone)]
pub enum LossConfig {
    FlowMatching,
    DetailedBalance(DetailedBalanceConfig),
    TrajectoryBalance(TrajectoryBalanceConfig),
    SubTrajectoryBalance(SubTrajectoryBalanceConfig),
    LogPartitionVariance(LogPartitionVarianceConfig),
}

impl LossConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FlowMatching => "FM",
            Self::DetailedBalance(_) => "DB",
            Self::TrajectoryBalance(_) => "TB",
            Self::SubTrajectoryBalance(_) => "SubTB",
            Self::LogPartitionVariance(_) => "ZVar",
        }
    }
}

/// A loss bound to a parametrization, taking trajectories and converting them to the batch type
/// its objective needs.
#[derive(Debug)]
pub enum GFlowNetLoss<'a> {
    FlowMatching(FlowMatching<'a>),
    DetailedBalance(DetailedBalance<'a>),
    TrajectoryBalance(TrajectoryBalance<'a>),
    SubTrajectoryBalance(SubTrajectoryBalance<'a>),
    LogPartitionVariance(LogPartitionVariance<'a>),
}

impl Loss<Trajectories> for GFlowNetLoss<'_> {
    fn evaluate(&self, trajectories: &Trajectories, mode: GradMode) -> Result<LossOutput> {
        match self {
            Self::FlowMatching(l) => {
                let states: FlowStates = trajectories.to_flow_states()?;
                l.evaluate(&states, mode)
            }
            Self::DetailedBalance(l) => {
                let transitions: Transitions = trajectories.to_transitions();
                l.evaluate(&transitions, mode)
            }
            Self::TrajectoryBalance(l) => l.evaluate(trajectories, mode),
            Self::SubTrajectoryBalance(l) => l.evaluate(trajectories, mode),
            Self::LogPartitionVariance(l) => l.evaluate(trajectories, mode),
        }
    }
}
