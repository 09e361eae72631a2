use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, StandardNormal};
use test_log::test;

use cutforest::{ConvergingMean, ForestError, RandomCutForest};

/// try cargo test --release; the distribution tests are longish

fn gaussian_cluster(
    rng: &mut ChaCha20Rng,
    center: &[f64],
    scale: f64,
    count: usize,
) -> Vec<Vec<f64>> {
    (0..count)
        .map(|_| {
            center
                .iter()
                .map(|&c| c + scale * <StandardNormal as Distribution<f64>>::sample(&StandardNormal, rng))
                .collect()
        })
        .collect()
}

#[test]
fn two_cluster_stream_scores_the_gap_high() {
    let dimensions = 20;
    let mut center_a = vec![0.0; dimensions];
    let mut center_b = vec![0.0; dimensions];
    center_a[0] = 5.0;
    center_b[0] = -5.0;

    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let mut forest = RandomCutForest::builder(dimensions)
        .sample_size(256)
        .number_of_trees(30)
        .time_decay(0.1 / 256.0)
        .random_seed(17)
        .build()
        .unwrap();

    for _ in 0..5_000 {
        let point = if rng.gen_bool(0.5) {
            gaussian_cluster(&mut rng, &center_a, 0.1, 1).pop().unwrap()
        } else {
            gaussian_cluster(&mut rng, &center_b, 0.1, 1).pop().unwrap()
        };
        forest.update(&point).unwrap();
    }

    // the reservoirs cap how many handles can stay live in the shared store
    assert!(forest.executor().point_store().live_handles() <= 256 * 30 + 1);

    let inlier = forest.score(&center_a).unwrap();
    let outlier = forest.score(&vec![0.0; dimensions]).unwrap();
    assert!(
        outlier > 1.5,
        "midpoint between clusters should be anomalous, got {outlier}"
    );
    assert!(
        outlier > 1.5 * inlier,
        "outlier {outlier} should clearly exceed inlier {inlier}"
    );
}

#[test]
fn sequential_and_parallel_forests_agree() {
    let build = |threads: usize| {
        let mut forest = RandomCutForest::builder(4)
            .sample_size(64)
            .number_of_trees(10)
            .random_seed(23)
            .parallel(threads)
            .build()
            .unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        for _ in 0..1_000 {
            let point: Vec<f64> = (0..4).map(|_| rng.gen_range(-1.0..1.0)).collect();
            forest.update(&point).unwrap();
        }
        forest
    };

    let mut sequential = build(0);
    let mut parallel = build(2);
    assert!(!sequential.executor().is_parallel());
    assert!(parallel.executor().is_parallel());
    assert_eq!(sequential.executor().component_count(), 10);
    let probe = vec![0.25, -0.25, 0.5, -0.5];
    let score_a = sequential.score(&probe).unwrap();
    let score_b = parallel.score(&probe).unwrap();
    assert!(
        (score_a - score_b).abs() < 1e-12,
        "per-component state must match: {score_a} vs {score_b}"
    );
    assert_eq!(
        sequential.point_store_state(true).unwrap(),
        parallel.point_store_state(true).unwrap()
    );
}

#[test]
fn same_seed_forests_serialize_identically() {
    let build = |seed: u64| {
        let mut forest = RandomCutForest::builder(3)
            .sample_size(32)
            .number_of_trees(7)
            .random_seed(seed)
            .build()
            .unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(100);
        for _ in 0..500 {
            let point: Vec<f64> = (0..3).map(|_| rng.gen_range(-2.0..2.0)).collect();
            forest.update(&point).unwrap();
        }
        forest.point_store_state(false).unwrap()
    };
    assert_eq!(build(9), build(9));
    assert_ne!(build(9), build(10));
}

#[test]
fn internal_shingling_warms_up_then_scores() {
    let mut forest = RandomCutForest::builder(8)
        .shingle_size(4)
        .internal_shingling(true)
        .sample_size(64)
        .number_of_trees(10)
        .random_seed(3)
        .output_after(16)
        .build()
        .unwrap();

    // warm-up: the first shingle_size - 1 inputs cannot produce a point
    assert_eq!(forest.update(&[1.0, 0.0]).unwrap(), 0);
    assert_eq!(forest.update(&[2.0, 0.0]).unwrap(), 0);
    assert_eq!(forest.update(&[3.0, 0.0]).unwrap(), 0);
    assert!(forest.update(&[4.0, 0.0]).unwrap() > 0);

    let mut rng = ChaCha20Rng::seed_from_u64(8);
    for _ in 0..500 {
        let step: Vec<f64> = vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)];
        forest.update(&step).unwrap();
    }
    // a wildly out-of-range step should look anomalous
    let calm = forest.score(&[0.0, 0.0]).unwrap();
    let wild = forest.score(&[25.0, -25.0]).unwrap();
    assert!(wild > calm, "wild {wild} vs calm {calm}");
}

#[test]
fn rotated_shingles_keep_scoring() {
    let mut forest = RandomCutForest::builder(6)
        .shingle_size(3)
        .internal_shingling(true)
        .internal_rotation(true)
        .sample_size(32)
        .number_of_trees(5)
        .random_seed(77)
        .output_after(8)
        .build()
        .unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(21);
    for _ in 0..300 {
        forest
            .update(&[rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)])
            .unwrap();
    }
    let score = forest.score(&[0.5, 0.5]).unwrap();
    assert!(score.is_finite() && score > 0.0);
}

#[test]
fn forest_imputation_recovers_cluster_coordinates() {
    let mut forest = RandomCutForest::builder(2)
        .sample_size(128)
        .number_of_trees(20)
        .random_seed(41)
        .build()
        .unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(2);
    // tight cluster around (3, -7)
    for point in gaussian_cluster(&mut rng, &[3.0, -7.0], 0.05, 2_000) {
        forest.update(&point).unwrap();
    }
    let completed = forest.impute(&[3.0, f64::NAN]).unwrap();
    assert!(
        (completed[1] + 7.0).abs() < 0.5,
        "imputed {} for a coordinate clustered at -7",
        completed[1]
    );
}

#[test]
fn converging_traversal_stops_early() {
    use cutforest::AnomalyScoreVisitor;

    let mut forest = RandomCutForest::builder(2)
        .sample_size(64)
        .number_of_trees(40)
        .random_seed(13)
        .build()
        .unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(4);
    for point in gaussian_cluster(&mut rng, &[0.0, 0.0], 1.0, 2_000) {
        forest.update(&point).unwrap();
    }

    let query = vec![0.1, 0.1];
    let mut accumulator = ConvergingMean::new(5, 0.1);
    let (score, visited) = forest
        .executor()
        .traverse_converging(
            &query,
            |c| AnomalyScoreVisitor::new(query.clone(), c.tree_mass()),
            &mut accumulator,
            |acc, visited| (acc.mean(), visited),
        )
        .unwrap();
    assert!(score > 0.0);
    assert!(
        visited < 40,
        "a loose tolerance should converge before all components, visited {visited}"
    );
}

#[test]
fn updates_validate_their_input() {
    let mut forest = RandomCutForest::builder(2)
        .sample_size(16)
        .number_of_trees(2)
        .random_seed(1)
        .build()
        .unwrap();
    assert!(matches!(
        forest.update(&[1.0]).unwrap_err(),
        ForestError::InvalidDimension { .. }
    ));
    assert!(matches!(
        forest.update(&[1.0, f64::NAN]).unwrap_err(),
        ForestError::InvalidPoint { .. }
    ));
    // negative zero is coerced before storage
    forest.update(&[-0.0, 2.0]).unwrap();
    let state = forest.point_store_state(false).unwrap();
    assert!(state
        .point_data
        .chunks(8)
        .all(|c| c != (-0.0f64).to_le_bytes().as_slice()));
}

#[test]
fn total_updates_is_strictly_monotonic() {
    let mut forest = RandomCutForest::builder(2)
        .sample_size(8)
        .number_of_trees(2)
        .random_seed(6)
        .build()
        .unwrap();
    for i in 0..10u64 {
        assert_eq!(forest.total_updates(), i);
        forest.update(&[i as f64, -(i as f64)]).unwrap();
    }
    assert_eq!(forest.total_updates(), 10);
}
