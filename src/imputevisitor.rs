use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::nodeview::NodeView;
use crate::scorevisitor::{damp, normalizer, score_seen, score_unseen};
use crate::types::Result;
use crate::util::{check_argument, l1distance};
use crate::visitor::{MultiVisitor, Visitor};

/// A completed query with the quality of the completion.
#[derive(Clone, Debug, PartialEq)]
pub struct Imputation {
    pub point: Vec<f64>,
    pub score: f64,
    pub distance: f64,
}

#[derive(Clone)]
struct Candidate {
    point: Vec<f64>,
    score: f64,
    distance: f64,
    converged: bool,
    random: f64,
}

/// Imputes the missing coordinates of a query by exploring both sides of
/// every cut in a missing dimension and keeping the better completion.
///
/// Each traversal branch carries its own candidate: the leaf it reaches
/// fills the holes and scores like the anomaly visitor; `combine` keeps the
/// candidate with the smaller adjusted score. `centrality` blends that score
/// with a uniform draw, between always-best (1) and a random sample of
/// plausible completions (0).
pub struct ImputeVisitor {
    query: Vec<f64>,
    missing_mask: Vec<bool>,
    tree_mass: usize,
    centrality: f64,
    rng: ChaCha20Rng,
    candidate: Option<Candidate>,
}

impl ImputeVisitor {
    pub fn new(
        query: Vec<f64>,
        missing: &[usize],
        tree_mass: usize,
        centrality: f64,
        seed: u64,
    ) -> Self {
        let mut missing_mask = vec![false; query.len()];
        for &position in missing {
            missing_mask[position] = true;
        }
        ImputeVisitor {
            query,
            missing_mask,
            tree_mass,
            centrality,
            rng: ChaCha20Rng::seed_from_u64(seed),
            candidate: None,
        }
    }

    fn adjusted_score(&self, candidate: &Candidate) -> f64 {
        self.centrality * normalizer(candidate.score, self.tree_mass)
            + (1.0 - self.centrality) * candidate.random
    }
}

impl Visitor for ImputeVisitor {
    type Output = Imputation;

    fn accept(&mut self, node_view: &NodeView<'_>, depth: usize) -> Result<()> {
        let Some(candidate) = self.candidate.as_mut() else {
            return Ok(());
        };
        if candidate.converged {
            return Ok(());
        }
        // the missing coordinates carry no information about this box
        let probability =
            node_view.probability_of_cut_with_missing(&self.query, &self.missing_mask)?;
        if probability == 0.0 {
            candidate.converged = true;
        } else {
            candidate.score = (1.0 - probability) * candidate.score
                + probability * score_unseen(depth, node_view.mass() as usize);
        }
        Ok(())
    }

    fn accept_leaf(&mut self, leaf_view: &NodeView<'_>, depth: usize) -> Result<()> {
        let leaf_point = leaf_view.leaf_point()?;
        let mut imputed = self.query.clone();
        for (position, &is_missing) in self.missing_mask.iter().enumerate() {
            if is_missing {
                imputed[position] = leaf_point[position];
            }
        }
        let mass = leaf_view.mass() as usize;
        let mut converged = false;
        let score = if imputed == leaf_point {
            converged = true;
            damp(mass, self.tree_mass) * score_seen(depth, mass)
        } else {
            score_unseen(depth, mass)
        };
        let distance = l1distance(&imputed, &leaf_point);
        self.candidate = Some(Candidate {
            point: imputed,
            score,
            distance,
            converged,
            random: self.rng.gen(),
        });
        Ok(())
    }

    fn is_path_post_order(&self) -> bool {
        true
    }

    fn result(&self) -> Result<Imputation> {
        check_argument(self.candidate.is_some(), "traversal produced no candidate")?;
        let candidate = self.candidate.as_ref().expect("checked above");
        Ok(Imputation {
            point: candidate.point.clone(),
            score: normalizer(candidate.score, self.tree_mass),
            distance: candidate.distance,
        })
    }
}

impl MultiVisitor for ImputeVisitor {
    fn trigger(&self, node_view: &NodeView<'_>) -> Result<bool> {
        if node_view.is_leaf() {
            return Ok(false);
        }
        Ok(self.missing_mask[node_view.cut()?.dimension])
    }

    fn new_copy(&mut self) -> Self {
        ImputeVisitor {
            query: self.query.clone(),
            missing_mask: self.missing_mask.clone(),
            tree_mass: self.tree_mass,
            centrality: self.centrality,
            rng: ChaCha20Rng::seed_from_u64(self.rng.gen()),
            candidate: None,
        }
    }

    fn combine(&mut self, other: Self) -> Result<()> {
        let Some(theirs) = other.candidate else {
            return Ok(());
        };
        let Some(ours) = self.candidate.take() else {
            self.candidate = Some(theirs);
            return Ok(());
        };
        let converged = ours.converged || theirs.converged;
        let mut winner = if self.adjusted_score(&theirs) < self.adjusted_score(&ours) {
            theirs
        } else {
            ours
        };
        winner.converged = converged;
        self.candidate = Some(winner);
        Ok(())
    }
}
