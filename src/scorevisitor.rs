use crate::nodeview::NodeView;
use crate::types::Result;
use crate::visitor::Visitor;

/// Expected displacement contribution when the query matches a seen point.
pub fn score_seen(depth: usize, mass: usize) -> f64 {
    1.0 / (depth as f64 + f64::log2(1.0 + mass as f64))
}

/// Contribution when the query would have split off on its own.
pub fn score_unseen(depth: usize, _mass: usize) -> f64 {
    1.0 / (depth as f64 + 1.0)
}

/// Discounts duplicates so that heavy leaves do not read as anomalous.
pub fn damp(leaf_mass: usize, tree_mass: usize) -> f64 {
    1.0 - leaf_mass as f64 / (2.0 * tree_mass as f64)
}

pub fn normalizer(score: f64, tree_mass: usize) -> f64 {
    score * f64::log2(1.0 + tree_mass as f64)
}

/// The classic anomaly score of a single tree.
///
/// The terminal value is fixed at the leaf and refined on the unwind: at
/// each ancestor the score mixes with the unseen contribution weighted by
/// the probability that a random cut at that box separates the query. The
/// visitor is path-post-order; it ignores the root-to-leaf pass.
pub struct AnomalyScoreVisitor {
    query: Vec<f64>,
    tree_mass: usize,
    score_seen: fn(usize, usize) -> f64,
    score_unseen: fn(usize, usize) -> f64,
    damp: fn(usize, usize) -> f64,
    normalizer: fn(f64, usize) -> f64,
    score: f64,
    leaf_seen: bool,
    converged: bool,
}

impl AnomalyScoreVisitor {
    pub fn new(query: Vec<f64>, tree_mass: usize) -> Self {
        AnomalyScoreVisitor {
            query,
            tree_mass,
            score_seen,
            score_unseen,
            damp,
            normalizer,
            score: 0.0,
            leaf_seen: false,
            converged: false,
        }
    }

    /// Variant with caller-supplied scoring functions.
    pub fn with_functions(
        query: Vec<f64>,
        tree_mass: usize,
        score_seen: fn(usize, usize) -> f64,
        score_unseen: fn(usize, usize) -> f64,
        damp: fn(usize, usize) -> f64,
        normalizer: fn(f64, usize) -> f64,
    ) -> Self {
        AnomalyScoreVisitor {
            query,
            tree_mass,
            score_seen,
            score_unseen,
            damp,
            normalizer,
            score: 0.0,
            leaf_seen: false,
            converged: false,
        }
    }
}

impl Visitor for AnomalyScoreVisitor {
    type Output = f64;

    fn accept(&mut self, node_view: &NodeView<'_>, depth: usize) -> Result<()> {
        if !self.leaf_seen || self.converged {
            return Ok(());
        }
        let probability = node_view.probability_of_cut(&self.query)?;
        if probability == 0.0 {
            self.converged = true;
        } else {
            self.score = (1.0 - probability) * self.score
                + probability * (self.score_unseen)(depth, node_view.mass() as usize);
        }
        Ok(())
    }

    fn accept_leaf(&mut self, leaf_view: &NodeView<'_>, depth: usize) -> Result<()> {
        let mass = leaf_view.mass() as usize;
        if leaf_view.leaf_equals(&self.query)? {
            self.score = (self.damp)(mass, self.tree_mass) * (self.score_seen)(depth, mass);
            self.converged = true;
        } else {
            self.score = (self.score_unseen)(depth, mass);
        }
        self.leaf_seen = true;
        Ok(())
    }

    fn is_path_post_order(&self) -> bool {
        true
    }

    fn result(&self) -> Result<f64> {
        Ok((self.normalizer)(self.score, self.tree_mass))
    }
}
