use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_core::RngCore;

use crate::component::ForestComponent;
use crate::executor::ForestExecutor;
use crate::imputevisitor::{Imputation, ImputeVisitor};
use crate::pointstore::PointStore;
use crate::sampler::TimeDecaySampler;
use crate::scorevisitor::AnomalyScoreVisitor;
use crate::statemapper::{to_state, PointStoreState};
use crate::tree::RandomCutTree;
use crate::types::Result;
use crate::util::check_argument;

/// Configuration for a [`RandomCutForest`]. Dimensions are the full
/// (shingled) tree-space width.
pub struct ForestBuilder {
    dimensions: usize,
    shingle_size: usize,
    sample_size: usize,
    number_of_trees: usize,
    random_seed: u64,
    time_decay: f64,
    initial_accept_fraction: f64,
    thread_pool_size: usize,
    internal_shingling: bool,
    internal_rotation: bool,
    bounding_box_cache_fraction: f64,
    store_sequence_indexes: bool,
    center_of_mass: bool,
    dynamic_resizing: bool,
    output_after: Option<usize>,
}

impl ForestBuilder {
    pub fn new(dimensions: usize) -> Self {
        ForestBuilder {
            dimensions,
            shingle_size: 1,
            sample_size: 256,
            number_of_trees: 50,
            random_seed: 42,
            time_decay: 0.0,
            initial_accept_fraction: 0.125,
            thread_pool_size: 0,
            internal_shingling: false,
            internal_rotation: false,
            bounding_box_cache_fraction: 1.0,
            store_sequence_indexes: true,
            center_of_mass: false,
            dynamic_resizing: true,
            output_after: None,
        }
    }

    pub fn shingle_size(mut self, shingle_size: usize) -> Self {
        self.shingle_size = shingle_size;
        self
    }

    pub fn sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn number_of_trees(mut self, number_of_trees: usize) -> Self {
        self.number_of_trees = number_of_trees;
        self
    }

    pub fn random_seed(mut self, random_seed: u64) -> Self {
        self.random_seed = random_seed;
        self
    }

    pub fn time_decay(mut self, time_decay: f64) -> Self {
        self.time_decay = time_decay;
        self
    }

    pub fn initial_accept_fraction(mut self, fraction: f64) -> Self {
        self.initial_accept_fraction = fraction;
        self
    }

    /// Zero keeps the forest sequential; any other value builds a bounded
    /// worker pool of that size.
    pub fn parallel(mut self, thread_pool_size: usize) -> Self {
        self.thread_pool_size = thread_pool_size;
        self
    }

    pub fn internal_shingling(mut self, enabled: bool) -> Self {
        self.internal_shingling = enabled;
        self
    }

    pub fn internal_rotation(mut self, enabled: bool) -> Self {
        self.internal_rotation = enabled;
        self
    }

    pub fn bounding_box_cache_fraction(mut self, fraction: f64) -> Self {
        self.bounding_box_cache_fraction = fraction;
        self
    }

    pub fn store_sequence_indexes(mut self, enabled: bool) -> Self {
        self.store_sequence_indexes = enabled;
        self
    }

    pub fn center_of_mass(mut self, enabled: bool) -> Self {
        self.center_of_mass = enabled;
        self
    }

    pub fn dynamic_resizing(mut self, enabled: bool) -> Self {
        self.dynamic_resizing = enabled;
        self
    }

    /// Number of updates before scores become meaningful; defaults to a
    /// quarter of the sample size.
    pub fn output_after(mut self, updates: usize) -> Self {
        self.output_after = Some(updates);
        self
    }

    pub fn build(self) -> Result<RandomCutForest> {
        check_argument(self.dimensions > 0, "dimensions must be positive")?;
        check_argument(
            self.shingle_size >= 1 && self.dimensions % self.shingle_size == 0,
            "shingle size must divide dimensions",
        )?;
        check_argument(self.sample_size > 1, "sample size must exceed one")?;
        check_argument(self.number_of_trees > 0, "at least one tree is required")?;
        check_argument(
            !self.internal_rotation || self.internal_shingling,
            "internal shingling is required for rotation",
        )?;

        let mut point_store_capacity = self.sample_size * self.number_of_trees + 1;
        if point_store_capacity < 2 * self.sample_size {
            point_store_capacity = 2 * self.sample_size;
        }
        let point_store = PointStore::new(
            self.dimensions,
            self.shingle_size,
            point_store_capacity,
            2 * self.sample_size,
            self.internal_shingling,
            self.internal_rotation,
            self.dynamic_resizing,
        )?;

        let mut rng = ChaCha20Rng::seed_from_u64(self.random_seed);
        let mut components = Vec::with_capacity(self.number_of_trees);
        for _ in 0..self.number_of_trees {
            let sampler = TimeDecaySampler::new(
                self.sample_size,
                self.time_decay,
                self.initial_accept_fraction,
                rng.next_u64(),
            );
            let tree = RandomCutTree::new(
                self.dimensions,
                self.sample_size,
                self.store_sequence_indexes,
                self.center_of_mass,
                self.bounding_box_cache_fraction,
                rng.next_u64(),
            )?;
            components.push(ForestComponent::new(Box::new(sampler), tree));
        }

        let executor = ForestExecutor::new(components, point_store, self.thread_pool_size)?;
        Ok(RandomCutForest {
            executor,
            output_after: self.output_after.unwrap_or(self.sample_size / 4),
            impute_seed: rng.next_u64(),
        })
    }
}

/// An ensemble of random cut trees over a sliding sample of the stream,
/// scoring and imputing through visitor traversals.
pub struct RandomCutForest {
    executor: ForestExecutor,
    output_after: usize,
    impute_seed: u64,
}

impl RandomCutForest {
    pub fn builder(dimensions: usize) -> ForestBuilder {
        ForestBuilder::new(dimensions)
    }

    pub fn executor(&self) -> &ForestExecutor {
        &self.executor
    }

    pub fn total_updates(&self) -> u64 {
        self.executor.total_updates()
    }

    pub fn dimensions(&self) -> usize {
        self.executor.point_store().dimensions()
    }

    /// Feeds one point (full width, or one time step with internal
    /// shingling); returns how many trees changed.
    pub fn update(&mut self, point: &[f64]) -> Result<usize> {
        self.executor.update(point)
    }

    fn is_output_ready(&self) -> bool {
        self.executor.total_updates() as usize >= self.output_after
            && self.executor.components().iter().all(|c| !c.is_tree_empty())
    }

    /// Average anomaly score over the trees; zero until the forest has seen
    /// enough of the stream.
    pub fn score(&self, point: &[f64]) -> Result<f64> {
        if !self.is_output_ready() {
            return Ok(0.0);
        }
        let query = self.executor.point_store().shingled_point(point)?;
        self.executor.traverse(
            &query,
            |component| AnomalyScoreVisitor::new(query.clone(), component.tree_mass()),
            |a, b| a + b,
            |sum, trees| sum / trees as f64,
        )
    }

    /// Completes the NaN-marked coordinates of a query. Each tree proposes
    /// its best completion; the forest answers with the coordinate-wise
    /// median of the proposals.
    pub fn impute(&self, point: &[f64]) -> Result<Vec<f64>> {
        check_argument(self.is_output_ready(), "imputation before any output")?;
        let query = self.executor.point_store().shingled_point(point)?;
        let missing: Vec<usize> = query
            .iter()
            .enumerate()
            .filter(|(_, value)| value.is_nan())
            .map(|(position, _)| position)
            .collect();
        check_argument(!missing.is_empty(), "nothing to impute")?;

        let seed = self.impute_seed;
        let proposals: Vec<Imputation> = self.executor.traverse_multi_collector(
            &query,
            |component| {
                ImputeVisitor::new(query.clone(), &missing, component.tree_mass(), 1.0, seed)
            },
            Vec::new,
            |proposals: &mut Vec<Imputation>, proposal| proposals.push(proposal),
            |mut left, mut right| {
                left.append(&mut right);
                left
            },
            |proposals, _| proposals,
        )?;
        let mut completed = query.clone();
        for &position in &missing {
            let mut values: Vec<f64> = proposals.iter().map(|p| p.point[position]).collect();
            values.sort_by(|a, b| a.partial_cmp(b).expect("imputed values are never NaN"));
            let middle = values.len() / 2;
            completed[position] = if values.len() % 2 == 1 {
                values[middle]
            } else {
                0.5 * (values[middle - 1] + values[middle])
            };
        }
        Ok(completed)
    }

    /// Snapshot of the shared point store for persistence; compacts first.
    pub fn point_store_state(&mut self, compressed: bool) -> Result<PointStoreState> {
        to_state(self.executor.point_store_mut(), compressed)
    }
}
