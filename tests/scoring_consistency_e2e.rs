use std::rc::Rc;

use gflownet::losses::{get_pfs_and_pbs, get_trajectories_scores};
use gflownet::nn::{Module, NeuralNet, NeuralNetConfig, Tabular, Uniform};
use gflownet::samplers::{SamplerConfig, TrajectoriesSampler};
use gflownet::{
    Direction, DiscreteEbm, Env, HyperGrid, Preprocessor, ProbabilityEstimator, Trajectories,
};
use gflownet::env::{DiscreteEbmConfig, HyperGridConfig};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn grid(preprocessor: Preprocessor) -> Rc<dyn Env> {
    Rc::new(
        HyperGrid::new(HyperGridConfig {
            ndim: 2,
            height: 5,
            preprocessor,
            ..HyperGridConfig::default()
        })
        .expect("valid grid"),
    )
}

fn policies(
    env: &Rc<dyn Env>,
    pf: Box<dyn Module>,
    pb: Box<dyn Module>,
) -> (ProbabilityEstimator, ProbabilityEstimator) {
    (
        ProbabilityEstimator::new(env.clone(), pf, Direction::Forward).expect("pf"),
        ProbabilityEstimator::new(env.clone(), pb, Direction::Backward).expect("pb"),
    )
}

fn sample(pf: &ProbabilityEstimator, n: usize, seed: u64) -> Trajectories {
    TrajectoriesSampler::new(pf, SamplerConfig::default())
        .expect("sampler")
        .sample_trajectories(n, &mut ChaCha8Rng::seed_from_u64(seed))
        .expect("sampling should succeed")
}

fn assert_on_off_policy_agree(pf: &ProbabilityEstimator, pb: &ProbabilityEstimator, seed: u64) {
    let trajs = sample(pf, 24, seed);
    assert!(trajs.has_log_pfs());

    let on = get_pfs_and_pbs(pf, pb, &trajs, true).expect("on-policy");
    let off = get_pfs_and_pbs(pf, pb, &trajs, false).expect("off-policy");
    assert_eq!(on.mask, off.mask);
    for (a, b) in on.log_pfs.iter().zip(off.log_pfs.iter()) {
        assert!((a - b).abs() < 1e-5, "recorded {a} vs recomputed {b}");
    }
    assert_eq!(on.log_pbs, off.log_pbs);

    let s_on = get_trajectories_scores(pf, pb, &trajs, true, -12.0).expect("on-policy scores");
    let s_off = get_trajectories_scores(pf, pb, &trajs, false, -12.0).expect("off-policy scores");
    assert_eq!(s_on.scores, s_off.scores, "scores must be bit-identical");
}

#[test]
fn on_and_off_policy_agree_with_uniform_policies() {
    let env = grid(Preprocessor::KHot);
    let (pf, pb) = policies(&env, Box::new(Uniform::new(3)), Box::new(Uniform::new(2)));
    assert_on_off_policy_agree(&pf, &pb, 1);
}

#[test]
fn on_and_off_policy_agree_with_tabular_policies() {
    let env = grid(Preprocessor::Enum);
    let pf = Tabular::new(25, 3);
    for ((r, c), v) in pf.table().value_mut().indexed_iter_mut() {
        *v = ((r * 13 + c * 5) % 7) as f32 * 0.3 - 0.9;
    }
    let pb = Tabular::new(25, 2);
    pb.table().value_mut()[[6, 1]] = 1.2;
    let (pf, pb) = policies(&env, Box::new(pf), Box::new(pb));
    assert_on_off_policy_agree(&pf, &pb, 2);
}

#[test]
fn on_and_off_policy_agree_with_neural_policies() {
    let env = grid(Preprocessor::KHot);
    let cfg = NeuralNetConfig {
        hidden_dim: 32,
        n_hidden_layers: 2,
        seed: 17,
    };
    let pf = NeuralNet::new(10, 3, &cfg);
    let pb = NeuralNet::new(10, 2, &NeuralNetConfig { seed: 18, ..cfg });
    let (pf, pb) = policies(&env, Box::new(pf), Box::new(pb));
    assert_on_off_policy_agree(&pf, &pb, 3);
}

#[test]
fn on_and_off_policy_agree_on_discrete_ebm() {
    let env: Rc<dyn Env> = Rc::new(
        DiscreteEbm::new(DiscreteEbmConfig {
            ndim: 5,
            ..DiscreteEbmConfig::default()
        })
        .expect("valid ebm"),
    );
    let cfg = NeuralNetConfig {
        hidden_dim: 16,
        n_hidden_layers: 1,
        seed: 4,
    };
    let pf = NeuralNet::new(5, 11, &cfg);
    let pb = NeuralNet::new(5, 10, &NeuralNetConfig { seed: 5, ..cfg });
    let (pf, pb) = policies(&env, Box::new(pf), Box::new(pb));
    assert_on_off_policy_agree(&pf, &pb, 4);
}

#[test]
fn totals_equal_per_step_sums() {
    let env = grid(Preprocessor::KHot);
    let (pf, pb) = policies(&env, Box::new(Uniform::new(3)), Box::new(Uniform::new(2)));
    let trajs = sample(&pf, 10, 9);
    let scores = get_trajectories_scores(&pf, &pb, &trajs, false, -12.0).expect("scores");
    for (b, traj) in trajs.iter().enumerate() {
        let n = traj.len();
        let pf_sum: f32 = (0..n).map(|t| scores.steps.log_pfs[[t, b]]).sum();
        let pb_sum: f32 = (0..n.saturating_sub(1)).map(|t| scores.steps.log_pbs[[t, b]]).sum();
        assert!((scores.total_log_pfs[b] - pf_sum).abs() < 1e-5);
        assert!((scores.total_log_pbs[b] - pb_sum).abs() < 1e-5);
        let expected = pf_sum - pb_sum - traj.log_reward.max(-12.0);
        assert!((scores.scores[b] - expected).abs() < 1e-4);
    }
}
