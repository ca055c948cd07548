use std::rc::Rc;

use gflownet::env::HyperGridConfig;
use gflownet::losses::{DetailedBalance, DetailedBalanceConfig};
use gflownet::nn::{Sgd, Tabular, Uniform};
use gflownet::parametrizations::{DbParametrization, TbParametrization};
use gflownet::samplers::{SamplerConfig, TrajectoriesSampler};
use gflownet::validation::validate;
use gflownet::{
    Direction, Env, HyperGrid, LogStateFlowEstimator, LogZEstimator, Loss, Parametrization,
    Preprocessor, ProbabilityEstimator,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn enum_grid(ndim: usize, height: usize) -> Rc<dyn Env> {
    Rc::new(
        HyperGrid::new(HyperGridConfig {
            ndim,
            height,
            preprocessor: Preprocessor::Enum,
            ..HyperGridConfig::default()
        })
        .expect("valid grid"),
    )
}

#[test]
fn detailed_balance_on_a_fixed_batch_decreases_monotonically() {
    // 1-D grid: one "increment" action plus exit
    let env = enum_grid(1, 4);
    assert_eq!(env.n_actions(), 2);
    let table = Tabular::new(4, 1);
    let flow_table = table.table().clone();
    let param = DbParametrization::new(
        ProbabilityEstimator::new(env.clone(), Box::new(Uniform::new(2)), Direction::Forward)
            .expect("pf"),
        ProbabilityEstimator::new(env.clone(), Box::new(Uniform::new(1)), Direction::Backward)
            .expect("pb"),
        LogStateFlowEstimator::new(env.clone(), Box::new(table), false).expect("flow"),
    )
    .expect("db");

    let trajs = TrajectoriesSampler::new(&param.pf, SamplerConfig::default())
        .expect("sampler")
        .sample_trajectories(10, &mut ChaCha8Rng::seed_from_u64(0))
        .expect("sampling should succeed");
    let transitions = trajs.to_transitions();
    let db = DetailedBalance::new(&param, DetailedBalanceConfig::default());
    let sgd = Sgd::new(0.1);

    let mut losses = Vec::with_capacity(51);
    for _ in 0..50 {
        let out = db.loss_and_grads(&transitions).expect("finite DB loss");
        losses.push(out.value);
        sgd.step([&flow_table], &out.grads);
    }
    losses.push(db.loss(&transitions).expect("finite DB loss"));

    for w in losses.windows(2) {
        assert!(w[0].is_finite() && w[1].is_finite());
        assert!(w[1] <= w[0] + 1e-6, "loss went up: {} -> {}", w[0], w[1]);
    }
    let (first, last) = (losses[0], losses[losses.len() - 1]);
    assert!(last < first, "no progress: {first} -> {last}");
}

#[test]
fn trajectory_balance_training_moves_pi_towards_the_reward() {
    let env = enum_grid(2, 3);
    let param = Parametrization::TrajectoryBalance(
        TbParametrization::new(
            ProbabilityEstimator::new(env.clone(), Box::new(Tabular::new(9, 3)), Direction::Forward)
                .expect("pf"),
            ProbabilityEstimator::new(
                env.clone(),
                Box::new(Tabular::new(9, 2)),
                Direction::Backward,
            )
            .expect("pb"),
            LogZEstimator::new(0.0),
        )
        .expect("tb"),
    );
    let params = param.parameters();
    assert_eq!(params.len(), 3);

    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let before = validate(&param, 4_000, &mut rng).expect("validation");

    let loss = param.loss().expect("tb loss");
    let sgd = Sgd::new(0.05);
    for _ in 0..400 {
        let trajs = param
            .sample_trajectories(16, SamplerConfig::default(), &mut rng)
            .expect("sampling should succeed");
        let out = loss.loss_and_grads(&trajs).expect("finite TB loss");
        sgd.step(params.values(), &out.grads);
    }

    let after = validate(&param, 4_000, &mut rng).expect("validation");
    assert!(
        after.l1 < 0.8 * before.l1,
        "L1 to R/Z did not improve enough: {} -> {}",
        before.l1,
        after.l1
    );
    let dz_before = before.log_z_diff.expect("TB reports logZ").abs();
    let dz_after = after.log_z_diff.expect("TB reports logZ").abs();
    assert!(dz_after < dz_before, "logZ error {dz_before} -> {dz_after}");
}
