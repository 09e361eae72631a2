use cutforest::{
    AnomalyScoreVisitor, ForestError, ImputeVisitor, PointHandle, PointStore, RandomCutTree,
    ScriptedRandom,
};

/// Builds the reference five-point tree: scripted cuts 0.625, 0.5, 0.25 on
/// the inserts of (-1,-1)@1, (1,1)@2, (-1,0)@3, (0,1)@4, (0,1)@5.
fn scripted_tree(extra_draws: &[f64]) -> (RandomCutTree, PointStore, Vec<PointHandle>) {
    let mut store = PointStore::new(2, 1, 64, 64, false, false, true).unwrap();
    let points: [&[f64]; 4] = [&[-1.0, -1.0], &[1.0, 1.0], &[-1.0, 0.0], &[0.0, 1.0]];
    let handles: Vec<PointHandle> = points
        .iter()
        .enumerate()
        .map(|(i, p)| store.admit(p, i as u64 + 1).unwrap().unwrap())
        .collect();
    let mut script = vec![0.625, 0.5, 0.25];
    script.extend_from_slice(extra_draws);
    let mut tree =
        RandomCutTree::with_random(2, 8, true, true, 1.0, Box::new(ScriptedRandom::new(&script)))
            .unwrap();
    tree.add_point(handles[0], 1, &store).unwrap();
    tree.add_point(handles[1], 2, &store).unwrap();
    tree.add_point(handles[2], 3, &store).unwrap();
    tree.add_point(handles[3], 4, &store).unwrap();
    tree.add_point(handles[3], 5, &store).unwrap();
    (tree, store, handles)
}

#[test]
fn anomaly_score_of_the_reference_tree() {
    let (tree, store, _) = scripted_tree(&[]);
    let query = vec![0.0, 1.0];
    let score = tree
        .traverse(
            &query,
            AnomalyScoreVisitor::new(query.clone(), tree.mass() as usize),
            &store,
        )
        .unwrap();
    assert!(
        (score - 0.451).abs() < 0.001,
        "expected 0.451 +- 0.001, got {score}"
    );
}

#[test]
fn score_converges_even_when_the_query_is_far_away() {
    let (tree, store, _) = scripted_tree(&[]);
    let query = vec![10.0, 10.0];
    let score = tree
        .traverse(
            &query,
            AnomalyScoreVisitor::new(query.clone(), tree.mass() as usize),
            &store,
        )
        .unwrap();
    // a distant point should look considerably more anomalous than a seen one
    assert!(score > 1.0, "distant query scored only {score}");
}

#[test]
fn imputation_picks_the_better_branch() {
    let (tree, store, _) = scripted_tree(&[]);
    let query = vec![0.0, f64::NAN];
    let imputed = tree
        .traverse_multi(
            &query,
            ImputeVisitor::new(query.clone(), &[1], tree.mass() as usize, 1.0, 0),
            &store,
        )
        .unwrap();
    assert_eq!(imputed.point, vec![0.0, 1.0]);
}

#[test]
fn imputation_after_an_extra_insert() {
    // one further draw drives the (0, 0.75) insert below the (0, 1) leaf
    let (mut tree, mut store, _) = scripted_tree(&[0.5]);
    let extra = store.admit(&[0.0, 0.75], 6).unwrap().unwrap();
    tree.add_point(extra, 6, &store).unwrap();

    let query = vec![1.0, f64::NAN];
    let imputed = tree
        .traverse_multi(
            &query,
            ImputeVisitor::new(query.clone(), &[1], tree.mass() as usize, 1.0, 0),
            &store,
        )
        .unwrap();
    assert_eq!(imputed.point, vec![1.0, 1.0]);
}

#[test]
fn single_traversals_reject_nan_queries_via_the_executor() {
    use cutforest::{ForestComponent, ForestExecutor, TimeDecaySampler};

    let mut store = PointStore::new(2, 1, 64, 64, false, false, true).unwrap();
    let mut tree = RandomCutTree::new(2, 8, true, false, 1.0, 5).unwrap();
    let handle = store.admit(&[0.0, 0.0], 1).unwrap().unwrap();
    tree.add_point(handle, 1, &store).unwrap();
    let component = ForestComponent::new(Box::new(TimeDecaySampler::new(8, 0.0, 1.0, 3)), tree);
    let executor = ForestExecutor::new(vec![component], store, 0).unwrap();

    let result = executor.traverse(
        &[0.0, f64::NAN],
        |c| AnomalyScoreVisitor::new(vec![0.0, f64::NAN], c.tree_mass()),
        |a, b| a + b,
        |sum, n| sum / n as f64,
    );
    assert!(matches!(result, Err(ForestError::InvalidPoint { .. })));
}
