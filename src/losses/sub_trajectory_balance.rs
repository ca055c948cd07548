//! Sub-trajectory balance (Madan et al., 2023).
//!
//! For a trajectory `s_0 → … → s_{n-1} → s_f` and every pair `0 ≤ i < j ≤ n`:
//!
//! ```text
//! r(i, j) = log F(s_i) + Σ_{i≤k<j} log P_F(a_k | s_k)
//!         − log F(s_j) − Σ_{i≤k<j} log P_B(a_k | s_{k+1})
//! ```
//!
//! where `log F(s_n)` is the (clipped) log-reward and the exit step has no backward term. The
//! loss is `Σ w(i, j) r(i, j)²`, with the weights of every scheme summing to one over the batch.
//!
//! Sub-trajectory sums come from per-trajectory prefix sums accumulated in `f64`.

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;

use crate::containers::Trajectories;
use crate::env::State;
use crate::nn::Gradients;
use crate::parametrizations::SubTbParametrization;
use crate::{Error, Result};

use super::scoring;
use super::{finish, GradMode, Loss, LossOutput, NumericWarning, DEFAULT_LOG_REWARD_CLIP_MIN};

/// Default geometric decay of sub-trajectory weights with length.
pub const DEFAULT_LAMBDA: f32 = 0.9;

/// How sub-trajectory residuals are weighted.
///
/// `Δ = j − i` is a sub-trajectory's length in steps; `N` is the number of trajectories and
/// `n_b` the length of trajectory `b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubTbWeighing {
    /// Only `Δ = 1`, uniform over all transitions.
    Db,
    /// Only the full trajectory `(0, n_b)`, uniform over trajectories.
    Tb,
    /// Only `Δ = 1`, with forward-looking flows, uniform within each trajectory and across
    /// trajectories.
    ModifiedDb,
    /// Uniform over every sub-trajectory in the batch.
    Equal,
    /// Uniform over lengths `Δ`, then uniform among sub-trajectories of that length.
    EqualWithin,
    /// Length `Δ` gets total mass `∝ λ^(Δ−1)`, split uniformly among sub-trajectories of that
    /// length.
    Geometric { lambda: f32 },
    /// Within each trajectory, `w ∝ λ^(Δ−1)`; every trajectory gets total mass `1/N`.
    GeometricWithin { lambda: f32 },
}

impl Default for SubTbWeighing {
    fn default() -> Self {
        Self::GeometricWithin {
            lambda: DEFAULT_LAMBDA,
        }
    }
}

impl SubTbWeighing {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Db => "DB",
            Self::Tb => "TB",
            Self::ModifiedDb => "ModifiedDB",
            Self::Equal => "equal",
            Self::EqualWithin => "equal_within",
            Self::Geometric { .. } => "geometric",
            Self::GeometricWithin { .. } => "geometric_within",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Geometric { lambda } | Self::GeometricWithin { lambda }
                if !(lambda > 0.0 && lambda < 1.0) =>
            {
                Err(Error::Configuration(format!(
                    "{} weighing needs 0 < lambda < 1, got {lambda}",
                    self.name()
                )))
            }
            _ => Ok(()),
        }
    }

    /// `(trajectory, i, j, weight)` for every weighted sub-trajectory, ordered by trajectory,
    /// then `i`, then `j`.
    fn pairs(&self, lengths: &[usize]) -> Vec<(usize, usize, usize, f32)> {
        let n_traj = lengths.len() as f64;
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        // number of sub-trajectories of each length Δ (index Δ - 1)
        let counts: Vec<f64> = (1..=max_len)
            .map(|d| lengths.iter().map(|&n| (n + 1).saturating_sub(d)).sum::<usize>() as f64)
            .collect();

        let mut out = Vec::new();
        match *self {
            Self::Db => {
                let m: usize = lengths.iter().sum();
                for (b, &n) in lengths.iter().enumerate() {
                    out.extend((0..n).map(|i| (b, i, i + 1, 1.0 / m as f32)));
                }
            }
            Self::ModifiedDb => {
                for (b, &n) in lengths.iter().enumerate() {
                    let w = (1.0 / (n_traj * n as f64)) as f32;
                    out.extend((0..n).map(|i| (b, i, i + 1, w)));
                }
            }
            Self::Tb => {
                for (b, &n) in lengths.iter().enumerate() {
                    out.push((b, 0, n, (1.0 / n_traj) as f32));
                }
            }
            Self::Equal => {
                let total: f64 = counts.iter().sum();
                all_pairs(lengths, &mut out, |_, _| 1.0 / total);
            }
            Self::EqualWithin => {
                let groups = max_len as f64;
                all_pairs(lengths, &mut out, |_, d| 1.0 / (groups * counts[d - 1]));
            }
            Self::Geometric { lambda } => {
                let l = lambda as f64;
                let norm = 1.0 - l.powi(max_len as i32);
                all_pairs(lengths, &mut out, |_, d| {
                    (1.0 - l) * l.powi(d as i32 - 1) / norm / counts[d - 1]
                });
            }
            Self::GeometricWithin { lambda } => {
                let l = lambda as f64;
                let per_traj: Vec<f64> = lengths
                    .iter()
                    .map(|&n| (1..=n).map(|d| (n - d + 1) as f64 * l.powi(d as i32 - 1)).sum())
                    .collect();
                all_pairs(lengths, &mut out, |b, d| {
                    l.powi(d as i32 - 1) / (n_traj * per_traj[b])
                });
            }
        }
        out
    }
}

fn all_pairs(
    lengths: &[usize],
    out: &mut Vec<(usize, usize, usize, f32)>,
    weight: impl Fn(usize, usize) -> f64,
) {
    for (b, &n) in lengths.iter().enumerate() {
        for i in 0..n {
            for j in i + 1..=n {
                out.push((b, i, j, weight(b, j - i) as f32));
            }
        }
    }
}

impl fmt::Display for SubTbWeighing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Geometric { lambda } | Self::GeometricWithin { lambda } => {
                write!(f, "{}(lambda={lambda})", self.name())
            }
            _ => f.write_str(self.name()),
        }
    }
}

impl FromStr for SubTbWeighing {
    type Err = Error;

    /// Geometric schemes parse with [`DEFAULT_LAMBDA`].
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DB" => Ok(Self::Db),
            "TB" => Ok(Self::Tb),
            "ModifiedDB" => Ok(Self::ModifiedDb),
            "equal" => Ok(Self::Equal),
            "equal_within" => Ok(Self::EqualWithin),
            "geometric" => Ok(Self::Geometric {
                lambda: DEFAULT_LAMBDA,
            }),
            "geometric_within" => Ok(Self::GeometricWithin {
                lambda: DEFAULT_LAMBDA,
            }),
            other => Err(Error::Configuration(format!(
                "unknown sub-trajectory weighing {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubTrajectoryBalanceConfig {
    /// Overrides the parametrization's weighing.
    pub weighing: Option<SubTbWeighing>,
    pub on_policy: bool,
    pub log_reward_clip_min: f32,
}

impl Default for SubTrajectoryBalanceConfig {
    fn default() -> Self {
        Self {
            weighing: None,
            on_policy: false,
            log_reward_clip_min: DEFAULT_LOG_REWARD_CLIP_MIN,
        }
    }
}

/// One weighted sub-trajectory residual.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubTrajectoryResidual {
    pub trajectory: usize,
    pub start: usize,
    pub end: usize,
    pub residual: f32,
    pub weight: f32,
}

#[derive(Debug, Clone)]
pub struct SubTrajectoryBalance<'a> {
    param: &'a SubTbParametrization,
    config: SubTrajectoryBalanceConfig,
}

struct Evaluated {
    residuals: Vec<SubTrajectoryResidual>,
    grads: Gradients,
    warning: Option<NumericWarning>,
}

impl<'a> SubTrajectoryBalance<'a> {
    pub fn new(
        param: &'a SubTbParametrization,
        config: SubTrajectoryBalanceConfig,
    ) -> Result<Self> {
        if let Some(w) = &config.weighing {
            w.validate()?;
        }
        Ok(Self { param, config })
    }

    /// The weighing in effect: the config override, else the parametrization's.
    pub fn weighing(&self) -> SubTbWeighing {
        self.config.weighing.unwrap_or(self.param.weighing)
    }

    /// Every weighted sub-trajectory with its residual, ordered by trajectory then endpoints.
    pub fn sub_trajectory_residuals(
        &self,
        trajectories: &Trajectories,
    ) -> Result<Vec<SubTrajectoryResidual>> {
        Ok(self.compute(trajectories, GradMode::ValueOnly)?.residuals)
    }

    fn compute(&self, trajectories: &Trajectories, mode: GradMode) -> Result<Evaluated> {
        let SubTbParametrization { pf, pb, log_f, .. } = self.param;
        let steps = scoring::get_pfs_and_pbs(pf, pb, trajectories, self.config.on_policy)?;
        let weighing = self.weighing();
        let add_reward = weighing == SubTbWeighing::ModifiedDb && !log_f.forward_looking();
        let env = trajectories.env();
        let shape = steps.mask.dim();

        let mut flow_rows = Vec::new();
        let mut flow_states: Vec<State> = Vec::new();
        for (b, traj) in trajectories.iter().enumerate() {
            for (t, s) in traj.states.iter().enumerate() {
                flow_rows.push((t, b));
                flow_states.push(s.clone());
            }
        }
        let flows = log_f.evaluate(&flow_states)?;
        let mut log_flows = Array2::<f32>::zeros(shape);
        for (k, &(t, b)) in flow_rows.iter().enumerate() {
            log_flows[[t, b]] = flows.values[k];
            if add_reward {
                log_flows[[t, b]] += env.log_reward(&flow_states[k]);
            }
        }

        let lengths = trajectories.when_is_done();
        let log_rewards = trajectories.log_rewards();
        let clip = self.config.log_reward_clip_min;
        // prefix[b][k] = Σ_{t<k} value, k in 0..=n_b
        let prefix = |values: &Array2<f32>| -> Vec<Vec<f64>> {
            lengths
                .iter()
                .enumerate()
                .map(|(b, &n)| {
                    let mut acc = vec![0.0f64; n + 1];
                    for t in 0..n {
                        acc[t + 1] = acc[t] + values[[t, b]] as f64;
                    }
                    acc
                })
                .collect()
        };
        let cum_pf = prefix(&steps.log_pfs);
        let cum_pb = prefix(&steps.log_pbs);

        let residuals: Vec<SubTrajectoryResidual> = weighing
            .pairs(&lengths)
            .into_iter()
            .map(|(b, i, j, weight)| {
                let f_i = log_flows[[i, b]] as f64;
                let f_j = if j == lengths[b] {
                    log_rewards[b].max(clip) as f64
                } else {
                    log_flows[[j, b]] as f64
                };
                let r = f_i + (cum_pf[b][j] - cum_pf[b][i]) - f_j - (cum_pb[b][j] - cum_pb[b][i]);
                SubTrajectoryResidual {
                    trajectory: b,
                    start: i,
                    end: j,
                    residual: r as f32,
                    weight,
                }
            })
            .collect();
        if residuals.iter().any(|r| r.residual.is_nan()) {
            return Err(Error::NonFinite("sub-trajectory residuals"));
        }

        let mut grads = Gradients::new();
        if mode == GradMode::WithGrads {
            let mut g_flows = Array2::<f32>::zeros(shape);
            // difference arrays over steps: +c at i, -c at j
            let mut d_steps = Array2::<f32>::zeros((shape.0 + 1, shape.1));
            for r in &residuals {
                let c = 2.0 * r.weight * r.residual;
                g_flows[[r.start, r.trajectory]] += c;
                if r.end < lengths[r.trajectory] {
                    g_flows[[r.end, r.trajectory]] -= c;
                }
                d_steps[[r.start, r.trajectory]] += c;
                d_steps[[r.end, r.trajectory]] -= c;
            }
            let mut g_pf = Array2::<f32>::zeros(shape);
            for (b, &n) in lengths.iter().enumerate() {
                let mut acc = 0.0f32;
                for t in 0..n {
                    acc += d_steps[[t, b]];
                    g_pf[[t, b]] = acc;
                }
            }
            // the exit step's backward entry is padding and never backpropagated
            let g_pb = g_pf.mapv(|g| -g);

            let g_flat: Vec<f32> = flow_rows.iter().map(|&(t, b)| g_flows[[t, b]]).collect();
            log_f.backward(&flows, &g_flat, &mut grads);
            steps.backward(pf, pb, trajectories, &g_pf, &g_pb, &mut grads)?;
        }

        Ok(Evaluated {
            residuals,
            grads,
            warning: steps.extreme_warning(),
        })
    }
}

impl Loss<Trajectories> for SubTrajectoryBalance<'_> {
    fn evaluate(&self, trajectories: &Trajectories, mode: GradMode) -> Result<LossOutput> {
        let ev = self.compute(trajectories, mode)?;
        let value = ev
            .residuals
            .iter()
            .map(|r| r.weight as f64 * (r.residual as f64).powi(2))
            .sum::<f64>() as f32;
        finish(
            "SubTB",
            value,
            trajectories.len(),
            ev.grads,
            ev.warning.into_iter().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, HyperGrid, HyperGridConfig, Preprocessor};
    use crate::estimators::{Direction, LogStateFlowEstimator, ProbabilityEstimator};
    use crate::losses::testing::check_grad;
    use crate::nn::Tabular;
    use crate::samplers::{SamplerConfig, TrajectoriesSampler};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::rc::Rc;

    const SCHEMES: [SubTbWeighing; 7] = [
        SubTbWeighing::Db,
        SubTbWeighing::Tb,
        SubTbWeighing::ModifiedDb,
        SubTbWeighing::Equal,
        SubTbWeighing::EqualWithin,
        SubTbWeighing::Geometric { lambda: 0.9 },
        SubTbWeighing::GeometricWithin { lambda: 0.9 },
    ];

    fn tables() -> (Tabular, Tabular, Tabular) {
        let pf = Tabular::new(9, 3);
        pf.table().value_mut()[[0, 0]] = 0.6;
        pf.table().value_mut()[[3, 2]] = -0.5;
        let pb = Tabular::new(9, 2);
        pb.table().value_mut()[[4, 1]] = 0.3;
        let f = Tabular::new(9, 1);
        for k in 0..9 {
            f.table().value_mut()[[k, 0]] = 0.5 - 0.15 * k as f32;
        }
        (pf, pb, f)
    }

    fn enum_grid() -> Rc<dyn Env> {
        Rc::new(
            HyperGrid::new(HyperGridConfig {
                ndim: 2,
                height: 3,
                preprocessor: Preprocessor::Enum,
                ..HyperGridConfig::default()
            })
            .unwrap(),
        )
    }

    fn subtb_from(
        env: &Rc<dyn Env>,
        (pf, pb, f): (Tabular, Tabular, Tabular),
        weighing: SubTbWeighing,
    ) -> SubTbParametrization {
        SubTbParametrization::new(
            ProbabilityEstimator::new(env.clone(), Box::new(pf), Direction::Forward).unwrap(),
            ProbabilityEstimator::new(env.clone(), Box::new(pb), Direction::Backward).unwrap(),
            LogStateFlowEstimator::new(env.clone(), Box::new(f), false).unwrap(),
            weighing,
        )
        .unwrap()
    }

    fn tabular_subtb(weighing: SubTbWeighing) -> SubTbParametrization {
        subtb_from(&enum_grid(), tables(), weighing)
    }

    fn sample(param: &SubTbParametrization, n: usize, seed: u64) -> Trajectories {
        TrajectoriesSampler::new(&param.pf, SamplerConfig::default())
            .unwrap()
            .sample_trajectories(n, &mut ChaCha8Rng::seed_from_u64(seed))
            .unwrap()
    }

    proptest! {
        #[test]
        fn weights_sum_to_one(lengths in prop::collection::vec(1usize..9, 1..6)) {
            for scheme in SCHEMES {
                let total: f64 = scheme.pairs(&lengths).iter().map(|p| p.3 as f64).sum();
                prop_assert!((total - 1.0).abs() < 1e-5, "{scheme}: {total}");
            }
        }
    }

    #[test]
    fn pair_sets_follow_the_scheme() {
        let lengths = [3, 1];
        assert_eq!(SubTbWeighing::Tb.pairs(&lengths).len(), 2);
        assert_eq!(SubTbWeighing::Db.pairs(&lengths).len(), 4);
        assert_eq!(SubTbWeighing::Equal.pairs(&lengths).len(), 6 + 1);

        // Δ=1 has 4 pairs, Δ=2 two, Δ=3 one; each length gets a third of the mass
        let ew = SubTbWeighing::EqualWithin.pairs(&lengths);
        let long = ew.iter().find(|p| p.2 - p.1 == 3).unwrap();
        assert!((long.3 - 1.0 / 3.0).abs() < 1e-6);
        let short = ew.iter().find(|p| p.2 - p.1 == 1).unwrap();
        assert!((short.3 - 1.0 / 12.0).abs() < 1e-6);

        let md = SubTbWeighing::ModifiedDb.pairs(&lengths);
        assert!((md[0].3 - 1.0 / 6.0).abs() < 1e-6);
        assert!((md[3].3 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn weighing_names_parse() {
        for scheme in SCHEMES {
            assert_eq!(scheme.name().parse::<SubTbWeighing>().unwrap(), scheme);
        }
        assert!(matches!(
            "harmonic".parse::<SubTbWeighing>(),
            Err(Error::Configuration(_))
        ));
        assert!(SubTbWeighing::Geometric { lambda: 1.0 }.validate().is_err());
    }

    #[test]
    fn tb_scheme_matches_trajectory_balance_with_flow_at_s0() {
        use crate::estimators::LogZEstimator;
        use crate::losses::{TrajectoryBalance, TrajectoryBalanceConfig};
        use crate::parametrizations::TbParametrization;

        let env = enum_grid();
        let (pf, pb, f) = tables();
        let log_z = f.table().value()[[0, 0]];
        // cloned tables share their parameters
        let param = subtb_from(&env, (pf.clone(), pb.clone(), f), SubTbWeighing::Tb);
        let trajs = sample(&param, 7, 1);
        let tb_param = TbParametrization::new(
            ProbabilityEstimator::new(env.clone(), Box::new(pf), Direction::Forward).unwrap(),
            ProbabilityEstimator::new(env, Box::new(pb), Direction::Backward).unwrap(),
            LogZEstimator::new(log_z),
        )
        .unwrap();

        let subtb = SubTrajectoryBalance::new(&param, SubTrajectoryBalanceConfig::default())
            .unwrap()
            .loss(&trajs)
            .unwrap();
        let tb = TrajectoryBalance::new(&tb_param, TrajectoryBalanceConfig::default())
            .unwrap()
            .loss(&trajs)
            .unwrap();
        assert!((subtb - tb).abs() < 1e-4, "subtb={subtb} tb={tb}");
    }

    #[test]
    fn gradients_match_finite_differences() {
        for scheme in SCHEMES {
            let param = tabular_subtb(scheme);
            let trajs = sample(&param, 4, 6);
            let loss =
                SubTrajectoryBalance::new(&param, SubTrajectoryBalanceConfig::default()).unwrap();
            let out = loss.loss_and_grads(&trajs).unwrap();
            for module in [param.pf.module(), param.pb.module(), param.log_f.module()] {
                check_grad(&module.named_parameters()[0].1, &out, || loss.loss(&trajs), 2e-2);
            }
        }
    }

    #[test]
    fn config_override_wins() {
        let param = tabular_subtb(SubTbWeighing::Db);
        let cfg = SubTrajectoryBalanceConfig {
            weighing: Some(SubTbWeighing::Tb),
            ..SubTrajectoryBalanceConfig::default()
        };
        let loss = SubTrajectoryBalance::new(&param, cfg).unwrap();
        assert_eq!(loss.weighing(), SubTbWeighing::Tb);
        let trajs = sample(&param, 3, 2);
        let res = loss.sub_trajectory_residuals(&trajs).unwrap();
        assert_eq!(res.len(), 3);
        assert!(res.iter().all(|r| r.start == 0));
    }
}
