use crate::pointstore::PointStore;
use crate::sampler::{ReservoirSampler, SamplerDecision};
use crate::tree::RandomCutTree;
use crate::types::{PointHandle, Result, SequenceIndex};
use crate::visitor::{MultiVisitor, Visitor};

/// What one component did with an offered `(point, seq)` pair: the handle it
/// retained (possibly an existing equivalent one) and the handle it evicted.
/// The executor settles the reference-count deltas these imply.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpdateResult {
    pub added: Option<PointHandle>,
    pub evicted: Option<PointHandle>,
}

impl UpdateResult {
    pub fn unchanged() -> Self {
        UpdateResult {
            added: None,
            evicted: None,
        }
    }

    pub fn state_changed(&self) -> bool {
        self.added.is_some() || self.evicted.is_some()
    }
}

/// One sampler paired with one tree over the forest's shared point store.
pub struct ForestComponent {
    sampler: Box<dyn ReservoirSampler>,
    tree: RandomCutTree,
}

impl ForestComponent {
    pub fn new(sampler: Box<dyn ReservoirSampler>, tree: RandomCutTree) -> Self {
        ForestComponent { sampler, tree }
    }

    /// Offers a point to the sampler and applies its decision to the tree.
    /// On eviction the expelled handle is deleted from the tree before the
    /// new point is inserted.
    pub fn update(
        &mut self,
        handle: PointHandle,
        sequence_index: SequenceIndex,
        point_store: &PointStore,
    ) -> Result<UpdateResult> {
        match self.sampler.decide(sequence_index) {
            SamplerDecision::Reject => Ok(UpdateResult::unchanged()),
            SamplerDecision::Accept => {
                let retained = self.tree.add_point(handle, sequence_index, point_store)?;
                self.sampler.note_accepted(sequence_index, retained)?;
                Ok(UpdateResult {
                    added: Some(retained),
                    evicted: None,
                })
            }
            SamplerDecision::AcceptAndEvict {
                sequence_index: evicted_sequence,
                handle: evicted_handle,
            } => {
                let evicted =
                    self.tree
                        .delete_point(evicted_handle, evicted_sequence, point_store)?;
                let retained = self.tree.add_point(handle, sequence_index, point_store)?;
                self.sampler.note_accepted(sequence_index, retained)?;
                Ok(UpdateResult {
                    added: Some(retained),
                    evicted: Some(evicted),
                })
            }
        }
    }

    pub fn traverse<V: Visitor>(
        &self,
        point: &[f64],
        visitor: V,
        point_store: &PointStore,
    ) -> Result<V::Output> {
        self.tree.traverse(point, visitor, point_store)
    }

    pub fn traverse_multi<V: MultiVisitor>(
        &self,
        point: &[f64],
        visitor: V,
        point_store: &PointStore,
    ) -> Result<V::Output> {
        self.tree.traverse_multi(point, visitor, point_store)
    }

    pub fn tree_mass(&self) -> usize {
        self.tree.mass() as usize
    }

    pub fn is_tree_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn sampler_size(&self) -> usize {
        self.sampler.size()
    }
}
