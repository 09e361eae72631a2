use log::trace;
use num::abs;
use rayon::prelude::*;

use crate::component::{ForestComponent, UpdateResult};
use crate::errors::ForestError;
use crate::pointstore::PointStore;
use crate::types::Result;
use crate::util::{check_argument, clean_copy};
use crate::visitor::{MultiVisitor, Visitor};

/// An accumulator that can report that further per-tree contributions will
/// not change its answer, letting a sequential traversal stop early.
pub trait ConvergingAccumulator<R> {
    fn accept(&mut self, value: R);

    fn is_converged(&self) -> bool;
}

/// Running mean with a relative-tolerance early exit.
pub struct ConvergingMean {
    sum: f64,
    count: usize,
    minimum_contributions: usize,
    tolerance: f64,
    previous_mean: f64,
    converged: bool,
}

impl ConvergingMean {
    pub fn new(minimum_contributions: usize, tolerance: f64) -> Self {
        ConvergingMean {
            sum: 0.0,
            count: 0,
            minimum_contributions,
            tolerance,
            previous_mean: f64::MAX,
            converged: false,
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn contributions(&self) -> usize {
        self.count
    }
}

impl ConvergingAccumulator<f64> for ConvergingMean {
    fn accept(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        let mean = self.mean();
        if self.count >= self.minimum_contributions
            && abs(mean - self.previous_mean) <= self.tolerance * abs(mean)
        {
            self.converged = true;
        }
        self.previous_mean = mean;
    }

    fn is_converged(&self) -> bool {
        self.converged
    }
}

/// Fans points out to every component and folds traversal results back.
///
/// The executor owns the shared point store, the component list and, when
/// parallelism is enabled, a bounded thread pool that dies with it.
/// Components never share mutable tree state, so the parallel executor
/// produces the same per-component state as the sequential one; only the
/// fold order of traversal results can differ, which is why parallel
/// accumulators must be associative and commutative.
pub struct ForestExecutor {
    components: Vec<ForestComponent>,
    point_store: PointStore,
    total_updates: u64,
    thread_pool: Option<rayon::ThreadPool>,
}

impl ForestExecutor {
    /// `thread_count` zero builds a sequential executor; otherwise a pool of
    /// exactly that many workers is created and owned here.
    pub fn new(
        components: Vec<ForestComponent>,
        point_store: PointStore,
        thread_count: usize,
    ) -> Result<Self> {
        check_argument(!components.is_empty(), "an executor needs components")?;
        let thread_pool = if thread_count > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(thread_count)
                    .build()
                    .map_err(|_| ForestError::InvalidArgument {
                        msg: "could not build the worker pool",
                    })?,
            )
        } else {
            None
        };
        Ok(ForestExecutor {
            components,
            point_store,
            total_updates: 0,
            thread_pool,
        })
    }

    pub fn is_parallel(&self) -> bool {
        self.thread_pool.is_some()
    }

    /// Strictly monotonic count of external update calls; doubles as the
    /// per-forest sequence index.
    pub fn total_updates(&self) -> u64 {
        self.total_updates
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn components(&self) -> &[ForestComponent] {
        &self.components
    }

    pub fn point_store(&self) -> &PointStore {
        &self.point_store
    }

    pub fn point_store_mut(&mut self) -> &mut PointStore {
        &mut self.point_store
    }

    /// Clean-copies the point, admits it into the shared store and submits
    /// `(handle, seq)` to every component. Returns how many components
    /// changed state.
    pub fn update(&mut self, point: &[f64]) -> Result<usize> {
        let expected = if self.point_store.is_internal_shingling_enabled() {
            self.point_store.base_dimensions()
        } else {
            self.point_store.dimensions()
        };
        if point.len() != expected {
            return Err(ForestError::InvalidDimension {
                expected,
                actual: point.len(),
            });
        }
        let cleaned = clean_copy(point)?;
        self.total_updates += 1;
        let sequence_index = self.total_updates;
        let Some(handle) = self.point_store.admit(&cleaned, sequence_index)? else {
            // internal shingle still warming up
            return Ok(0);
        };
        trace!("update {sequence_index}: handle {handle} to {} components", self.components.len());

        let results: Result<Vec<UpdateResult>> = {
            let point_store = &self.point_store;
            let components = &mut self.components;
            match &self.thread_pool {
                Some(pool) => pool.install(|| {
                    components
                        .par_iter_mut()
                        .map(|component| component.update(handle, sequence_index, point_store))
                        .collect()
                }),
                None => components
                    .iter_mut()
                    .map(|component| component.update(handle, sequence_index, point_store))
                    .collect(),
            }
        };
        let results = results?;

        // settle the reference deltas: additions first so nothing dips to
        // zero while still referenced, then evictions, then the bootstrap
        // reference from admit
        for result in &results {
            if let Some(added) = result.added {
                self.point_store.inc_ref(added)?;
            }
        }
        for result in &results {
            if let Some(evicted) = result.evicted {
                self.point_store.dec_ref(evicted)?;
            }
        }
        self.point_store.dec_ref(handle)?;

        Ok(results.iter().filter(|r| r.state_changed()).count())
    }

    fn check_query(&self, point: &[f64], allow_missing: bool) -> Result<()> {
        if !allow_missing {
            for &value in point {
                if value.is_nan() {
                    return Err(ForestError::InvalidPoint {
                        msg: "NaN is only valid in imputation queries",
                    });
                }
            }
        }
        Ok(())
    }

    /// One fresh visitor per component; results fold left-to-right through
    /// `accumulator`, then `finisher` maps the fold and the component count
    /// to the final answer.
    pub fn traverse<V, R, T>(
        &self,
        point: &[f64],
        visitor_factory: impl Fn(&ForestComponent) -> V + Sync,
        accumulator: impl Fn(R, R) -> R,
        finisher: impl FnOnce(R, usize) -> T,
    ) -> Result<T>
    where
        V: Visitor<Output = R>,
        R: Send,
    {
        self.check_query(point, false)?;
        let point_store = &self.point_store;
        let results =
            self.run_traversals(|c| c.traverse(point, visitor_factory(c), point_store))?;
        let mut iterator = results.into_iter();
        let first = iterator
            .next()
            .ok_or(ForestError::InvalidArgument { msg: "no components" })?;
        let folded = iterator.fold(first, accumulator);
        Ok(finisher(folded, self.components.len()))
    }

    /// Streaming alternative: per-component results are folded into a state
    /// built by `supplier`, partial states merge with `combine`.
    pub fn traverse_collector<V, R, S, T>(
        &self,
        point: &[f64],
        visitor_factory: impl Fn(&ForestComponent) -> V + Sync,
        supplier: impl Fn() -> S + Sync + Send,
        accumulate: impl Fn(&mut S, R) + Sync + Send,
        combine: impl Fn(S, S) -> S + Sync + Send,
        finisher: impl FnOnce(S, usize) -> T,
    ) -> Result<T>
    where
        V: Visitor<Output = R>,
        R: Send,
        S: Send,
    {
        self.check_query(point, false)?;
        let point_store = &self.point_store;
        let state: Result<S> = match &self.thread_pool {
            Some(pool) => pool.install(|| {
                self.components
                    .par_iter()
                    .map(|c| c.traverse(point, visitor_factory(c), point_store))
                    .try_fold(&supplier, |mut state, result| {
                        accumulate(&mut state, result?);
                        Ok(state)
                    })
                    .try_reduce(&supplier, |a, b| Ok(combine(a, b)))
            }),
            None => {
                let mut state = supplier();
                for component in &self.components {
                    let result =
                        component.traverse(point, visitor_factory(component), point_store)?;
                    accumulate(&mut state, result);
                }
                Ok(state)
            }
        };
        Ok(finisher(state?, self.components.len()))
    }

    /// Visits components in order and stops as soon as the accumulator
    /// reports convergence. Sequential by contract, whatever the executor's
    /// parallelism; `finisher` receives the accumulator and the number of
    /// components actually visited.
    pub fn traverse_converging<V, R, A, T>(
        &self,
        point: &[f64],
        visitor_factory: impl Fn(&ForestComponent) -> V,
        accumulator: &mut A,
        finisher: impl FnOnce(&A, usize) -> T,
    ) -> Result<T>
    where
        V: Visitor<Output = R>,
        A: ConvergingAccumulator<R>,
    {
        self.check_query(point, false)?;
        let mut visited = 0;
        for component in &self.components {
            let result =
                component.traverse(point, visitor_factory(component), &self.point_store)?;
            accumulator.accept(result);
            visited += 1;
            if accumulator.is_converged() {
                trace!("converged after {visited} components");
                break;
            }
        }
        Ok(finisher(accumulator, visited))
    }

    /// Multi-visitor variant of [`traverse`](Self::traverse); NaN marks
    /// missing coordinates here.
    pub fn traverse_multi<V, R, T>(
        &self,
        point: &[f64],
        visitor_factory: impl Fn(&ForestComponent) -> V + Sync,
        accumulator: impl Fn(R, R) -> R,
        finisher: impl FnOnce(R, usize) -> T,
    ) -> Result<T>
    where
        V: MultiVisitor<Output = R>,
        R: Send,
    {
        let point_store = &self.point_store;
        let results =
            self.run_traversals(|c| c.traverse_multi(point, visitor_factory(c), point_store))?;
        let mut iterator = results.into_iter();
        let first = iterator
            .next()
            .ok_or(ForestError::InvalidArgument { msg: "no components" })?;
        let folded = iterator.fold(first, accumulator);
        Ok(finisher(folded, self.components.len()))
    }

    /// Collector-shaped multi-visitor traversal.
    pub fn traverse_multi_collector<V, R, S, T>(
        &self,
        point: &[f64],
        visitor_factory: impl Fn(&ForestComponent) -> V + Sync,
        supplier: impl Fn() -> S + Sync + Send,
        accumulate: impl Fn(&mut S, R) + Sync + Send,
        combine: impl Fn(S, S) -> S + Sync + Send,
        finisher: impl FnOnce(S, usize) -> T,
    ) -> Result<T>
    where
        V: MultiVisitor<Output = R>,
        R: Send,
        S: Send,
    {
        let point_store = &self.point_store;
        let state: Result<S> = match &self.thread_pool {
            Some(pool) => pool.install(|| {
                self.components
                    .par_iter()
                    .map(|c| c.traverse_multi(point, visitor_factory(c), point_store))
                    .try_fold(&supplier, |mut state, result| {
                        accumulate(&mut state, result?);
                        Ok(state)
                    })
                    .try_reduce(&supplier, |a, b| Ok(combine(a, b)))
            }),
            None => {
                let mut state = supplier();
                for component in &self.components {
                    let result =
                        component.traverse_multi(point, visitor_factory(component), point_store)?;
                    accumulate(&mut state, result);
                }
                Ok(state)
            }
        };
        Ok(finisher(state?, self.components.len()))
    }

    fn run_traversals<R: Send>(
        &self,
        run: impl Fn(&ForestComponent) -> Result<R> + Sync,
    ) -> Result<Vec<R>> {
        match &self.thread_pool {
            Some(pool) => {
                pool.install(|| self.components.par_iter().map(|c| run(c)).collect())
            }
            None => self.components.iter().map(run).collect(),
        }
    }
}
