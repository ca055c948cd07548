//! Parametrizations: the estimator bundle each loss trains.
//!
//! | kind | estimators | loss |
//! |---|---|---|
//! | FM | edge flow | [`FlowMatching`] |
//! | DB | `P_F`, `P_B`, state flow | [`DetailedBalance`] |
//! | TB | `P_F`, `P_B`, `logZ` | [`TrajectoryBalance`] |
//! | SubTB | `P_F`, `P_B`, state flow | [`SubTrajectoryBalance`] |
//! | ZVar | `P_F`, `P_B` | [`LogPartitionVariance`] |
//!
//! [`Parametrization::parameters`] collects every trainable parameter once, even when several
//! estimators share a torso.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use rand::Rng;
use tracing::debug;

use crate::containers::Trajectories;
use crate::env::Env;
use crate::estimators::{
    Direction, Estimator, LogEdgeFlowEstimator, LogStateFlowEstimator, LogZEstimator,
    ProbabilityEstimator,
};
use crate::losses::{
    DetailedBalance, DetailedBalanceConfig, FlowMatching, GFlowNetLoss, LogPartitionVariance,
    LogPartitionVarianceConfig, LossConfig, SubTbWeighing, SubTrajectoryBalance,
    SubTrajectoryBalanceConfig, TrajectoryBalance, TrajectoryBalanceConfig,
};
use crate::nn::{Module, Param};
use crate::samplers::{
    ForwardPolicy, SamplerConfig, TerminatingStateDistribution, TrajectoriesSampler,
};
use crate::{Error, Result};

/// Which objective a parametrization is trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParametrizationKind {
    FlowMatching,
    DetailedBalance,
    TrajectoryBalance,
    SubTrajectoryBalance,
    LogPartitionVariance,
}

impl ParametrizationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::FlowMatching => "FM",
            Self::DetailedBalance => "DB",
            Self::TrajectoryBalance => "TB",
            Self::SubTrajectoryBalance => "SubTB",
            Self::LogPartitionVariance => "ZVar",
        }
    }
}

impl fmt::Display for ParametrizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ParametrizationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FM" => Ok(Self::FlowMatching),
            "DB" => Ok(Self::DetailedBalance),
            "TB" => Ok(Self::TrajectoryBalance),
            "SubTB" => Ok(Self::SubTrajectoryBalance),
            "ZVar" => Ok(Self::LogPartitionVariance),
            other => Err(Error::Configuration(format!(
                "unknown parametrization {other:?} (expected FM, DB, TB, SubTB or ZVar)"
            ))),
        }
    }
}

fn check_policies(pf: &ProbabilityEstimator, pb: &ProbabilityEstimator) -> Result<()> {
    if pf.direction() != Direction::Forward {
        return Err(Error::Configuration("pf must be a forward estimator".into()));
    }
    if pb.direction() != Direction::Backward {
        return Err(Error::Configuration("pb must be a backward estimator".into()));
    }
    if pf.env().n_actions() != pb.env().n_actions() {
        return Err(Error::Configuration(format!(
            "pf has {} actions, pb has {}",
            pf.env().n_actions(),
            pb.env().n_actions()
        )));
    }
    Ok(())
}

fn check_env(what: &str, expected: &dyn Env, got: &dyn Env) -> Result<()> {
    if expected.n_actions() != got.n_actions() {
        return Err(Error::Configuration(format!(
            "{what} has {} actions, policies have {}",
            got.n_actions(),
            expected.n_actions()
        )));
    }
    Ok(())
}

/// Flow matching: one edge-flow estimator, which also induces the forward policy.
#[derive(Debug)]
pub struct FmParametrization {
    pub log_f_edge: LogEdgeFlowEstimator,
}

impl FmParametrization {
    pub fn new(log_f_edge: LogEdgeFlowEstimator) -> Self {
        Self { log_f_edge }
    }
}

#[derive(Debug)]
pub struct DbParametrization {
    pub pf: ProbabilityEstimator,
    pub pb: ProbabilityEstimator,
    pub log_f: LogStateFlowEstimator,
}

impl DbParametrization {
    pub fn new(
        pf: ProbabilityEstimator,
        pb: ProbabilityEstimator,
        log_f: LogStateFlowEstimator,
    ) -> Result<Self> {
        check_policies(&pf, &pb)?;
        check_env("state flow", pf.env().as_ref(), log_f.env().as_ref())?;
        Ok(Self { pf, pb, log_f })
    }
}

#[derive(Debug)]
pub struct TbParametrization {
    pub pf: ProbabilityEstimator,
    pub pb: ProbabilityEstimator,
    pub log_z: LogZEstimator,
}

impl TbParametrization {
    pub fn new(
        pf: ProbabilityEstimator,
        pb: ProbabilityEstimator,
        log_z: LogZEstimator,
    ) -> Result<Self> {
        check_policies(&pf, &pb)?;
        Ok(Self { pf, pb, log_z })
    }
}

/// SubTB shares DB's estimators and adds the default sub-trajectory weighing.
#[derive(Debug)]
pub struct SubTbParametrization {
    pub pf: ProbabilityEstimator,
    pub pb: ProbabilityEstimator,
    pub log_f: LogStateFlowEstimator,
    pub weighing: SubTbWeighing,
}

impl SubTbParametrization {
    pub fn new(
        pf: ProbabilityEstimator,
        pb: ProbabilityEstimator,
        log_f: LogStateFlowEstimator,
        weighing: SubTbWeighing,
    ) -> Result<Self> {
        check_policies(&pf, &pb)?;
        check_env("state flow", pf.env().as_ref(), log_f.env().as_ref())?;
        weighing.validate()?;
        Ok(Self {
            pf,
            pb,
            log_f,
            weighing,
        })
    }
}

/// Policies only; used by the log-partition-variance loss.
#[derive(Debug)]
pub struct PfBasedParametrization {
    pub pf: ProbabilityEstimator,
    pub pb: ProbabilityEstimator,
}

impl PfBasedParametrization {
    pub fn new(pf: ProbabilityEstimator, pb: ProbabilityEstimator) -> Result<Self> {
        check_policies(&pf, &pb)?;
        Ok(Self { pf, pb })
    }
}

/// Any of the five parametrizations.
#[derive(Debug)]
pub enum Parametrization {
    FlowMatching(FmParametrization),
    DetailedBalance(DbParametrization),
    TrajectoryBalance(TbParametrization),
    SubTrajectoryBalance(SubTbParametrization),
    LogPartitionVariance(PfBasedParametrization),
}

fn wrong_estimators(kind: ParametrizationKind, expected: &str, got: &[Estimator]) -> Error {
    let got: Vec<&str> = got.iter().map(Estimator::kind).collect();
    Error::Configuration(format!("{kind} needs [{expected}], got {got:?}"))
}

impl Parametrization {
    /// Assemble a parametrization from estimators in the order listed in the module table.
    ///
    /// SubTB starts with [`SubTbWeighing::default`].
    pub fn from_estimators(kind: ParametrizationKind, estimators: Vec<Estimator>) -> Result<Self> {
        use Estimator as E;
        let p = match kind {
            ParametrizationKind::FlowMatching => match <[Estimator; 1]>::try_from(estimators) {
                Ok([E::LogEdgeFlow(f)]) => Self::FlowMatching(FmParametrization::new(f)),
                Ok(got) => return Err(wrong_estimators(kind, "edge flow", &got)),
                Err(got) => return Err(wrong_estimators(kind, "edge flow", &got)),
            },
            ParametrizationKind::LogPartitionVariance => {
                let expected = "forward policy, backward policy";
                match <[Estimator; 2]>::try_from(estimators) {
                    Ok([E::Probability(pf), E::Probability(pb)]) => {
                        Self::LogPartitionVariance(PfBasedParametrization::new(pf, pb)?)
                    }
                    Ok(got) => return Err(wrong_estimators(kind, expected, &got)),
                    Err(got) => return Err(wrong_estimators(kind, expected, &got)),
                }
            }
            ParametrizationKind::TrajectoryBalance => {
                let expected = "forward policy, backward policy, logZ";
                match <[Estimator; 3]>::try_from(estimators) {
                    Ok([E::Probability(pf), E::Probability(pb), E::LogZ(z)]) => {
                        Self::TrajectoryBalance(TbParametrization::new(pf, pb, z)?)
                    }
                    Ok(got) => return Err(wrong_estimators(kind, expected, &got)),
                    Err(got) => return Err(wrong_estimators(kind, expected, &got)),
                }
            }
            ParametrizationKind::DetailedBalance | ParametrizationKind::SubTrajectoryBalance => {
                let expected = "forward policy, backward policy, state flow";
                match <[Estimator; 3]>::try_from(estimators) {
                    Ok([E::Probability(pf), E::Probability(pb), E::LogStateFlow(f)]) => {
                        if kind == ParametrizationKind::DetailedBalance {
                            Self::DetailedBalance(DbParametrization::new(pf, pb, f)?)
                        } else {
                            Self::SubTrajectoryBalance(SubTbParametrization::new(
                                pf,
                                pb,
                                f,
                                SubTbWeighing::default(),
                            )?)
                        }
                    }
                    Ok(got) => return Err(wrong_estimators(kind, expected, &got)),
                    Err(got) => return Err(wrong_estimators(kind, expected, &got)),
                }
            }
        };
        debug!(kind = %p.kind(), n_params = p.parameters().len(), "parametrization built");
        Ok(p)
    }

    pub fn kind(&self) -> ParametrizationKind {
        match self {
            Self::FlowMatching(_) => ParametrizationKind::FlowMatching,
            Self::DetailedBalance(_) => ParametrizationKind::DetailedBalance,
            Self::TrajectoryBalance(_) => ParametrizationKind::TrajectoryBalance,
            Self::SubTrajectoryBalance(_) => ParametrizationKind::SubTrajectoryBalance,
            Self::LogPartitionVariance(_) => ParametrizationKind::LogPartitionVariance,
        }
    }

    /// The policy trajectories are sampled from.
    pub fn forward_policy(&self) -> &dyn ForwardPolicy {
        match self {
            Self::FlowMatching(p) => &p.log_f_edge,
            Self::DetailedBalance(p) => &p.pf,
            Self::TrajectoryBalance(p) => &p.pf,
            Self::SubTrajectoryBalance(p) => &p.pf,
            Self::LogPartitionVariance(p) => &p.pf,
        }
    }

    pub fn env(&self) -> &Rc<dyn Env> {
        self.forward_policy().env()
    }

    /// Every trainable parameter, by qualified name.
    ///
    /// A parameter reachable from several estimators (a shared torso) appears once, under the
    /// first name it was found by in estimator order `pf`, `pb`, flow, `logZ`.
    pub fn parameters(&self) -> BTreeMap<String, Param> {
        let named: Vec<(String, Param)> = match self {
            Self::FlowMatching(p) => prefixed("log_f_edge", p.log_f_edge.module()),
            Self::DetailedBalance(p) => [
                prefixed("pf", p.pf.module()),
                prefixed("pb", p.pb.module()),
                prefixed("log_f", p.log_f.module()),
            ]
            .concat(),
            Self::TrajectoryBalance(p) => [
                prefixed("pf", p.pf.module()),
                prefixed("pb", p.pb.module()),
                vec![("logZ".to_string(), p.log_z.param().clone())],
            ]
            .concat(),
            Self::SubTrajectoryBalance(p) => [
                prefixed("pf", p.pf.module()),
                prefixed("pb", p.pb.module()),
                prefixed("log_f", p.log_f.module()),
            ]
            .concat(),
            Self::LogPartitionVariance(p) => {
                [prefixed("pf", p.pf.module()), prefixed("pb", p.pb.module())].concat()
            }
        };

        let mut seen = HashSet::new();
        let mut out = BTreeMap::new();
        for (name, param) in named {
            if seen.insert(param.id()) {
                out.insert(name, param);
            }
        }
        out
    }

    /// Sample `n` trajectories from the forward policy.
    pub fn sample_trajectories(
        &self,
        n: usize,
        config: SamplerConfig,
        rng: &mut impl Rng,
    ) -> Result<Trajectories> {
        TrajectoriesSampler::new(self.forward_policy(), config)?.sample_trajectories(n, rng)
    }

    /// Empirical terminating-state distribution of the forward policy, from `n_samples`
    /// trajectories.
    pub fn pi(
        &self,
        env: &dyn Env,
        n_samples: usize,
        rng: &mut impl Rng,
    ) -> Result<TerminatingStateDistribution> {
        check_env("env", self.env().as_ref(), env)?;
        if n_samples == 0 {
            return Err(Error::Configuration("pi needs at least one sample".into()));
        }
        let trajectories = self.sample_trajectories(n_samples, SamplerConfig::default(), rng)?;
        TerminatingStateDistribution::from_trajectories(&trajectories)
    }

    /// The loss matching this parametrization, with default settings.
    pub fn loss(&self) -> Result<GFlowNetLoss<'_>> {
        let config = match self {
            Self::FlowMatching(_) => LossConfig::FlowMatching,
            Self::DetailedBalance(_) => {
                LossConfig::DetailedBalance(DetailedBalanceConfig::default())
            }
            Self::TrajectoryBalance(_) => {
                LossConfig::TrajectoryBalance(TrajectoryBalanceConfig::default())
            }
            Self::SubTrajectoryBalance(_) => {
                LossConfig::SubTrajectoryBalance(SubTrajectoryBalanceConfig::default())
            }
            Self::LogPartitionVariance(_) => {
                LossConfig::LogPartitionVariance(LogPartitionVarianceConfig::default())
            }
        };
        self.loss_with(config)
    }

    /// The loss matching this parametrization; `config` must be for the same objective.
    pub fn loss_with(&self, config: LossConfig) -> Result<GFlowNetLoss<'_>> {
        Ok(match (self, config) {
            (Self::FlowMatching(p), LossConfig::FlowMatching) => {
                GFlowNetLoss::FlowMatching(FlowMatching::new(p))
            }
            (Self::DetailedBalance(p), LossConfig::DetailedBalance(c)) => {
                GFlowNetLoss::DetailedBalance(DetailedBalance::new(p, c))
            }
            (Self::TrajectoryBalance(p), LossConfig::TrajectoryBalance(c)) => {
                GFlowNetLoss::TrajectoryBalance(TrajectoryBalance::new(p, c)?)
            }
            (Self::SubTrajectoryBalance(p), LossConfig::SubTrajectoryBalance(c)) => {
                GFlowNetLoss::SubTrajectoryBalance(SubTrajectoryBalance::new(p, c)?)
            }
            (Self::LogPartitionVariance(p), LossConfig::LogPartitionVariance(c)) => {
                GFlowNetLoss::LogPartitionVariance(LogPartitionVariance::new(p, c))
            }
            (p, c) => {
                return Err(Error::Configuration(format!(
                    "{} loss config does not fit a {} parametrization",
                    c.name(),
                    p.kind()
                )))
            }
        })
    }
}

fn prefixed(prefix: &str, module: &dyn Module) -> Vec<(String, Param)> {
    module
        .named_parameters()
        .into_iter()
        .map(|(n, p)| (format!("{prefix}.{n}"), p))
        .collect()
}
