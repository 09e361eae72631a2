use crate::boundingbox::BoundingBox;
use crate::cut::Cut;
use crate::errors::ForestError;
use crate::nodestore::{Node, NodeStore};
use crate::pointstore::PointStore;
use crate::types::{PointHandle, Result, SequenceIndex};

/// Read-only window onto the node a traversal is currently visiting.
///
/// Everything a visitor may ask for is resolved through the node and point
/// stores on demand; the box comes from the cache when the node has one and
/// is recomputed from descendants otherwise.
pub struct NodeView<'a> {
    node_store: &'a NodeStore,
    point_store: &'a PointStore,
    index: u32,
}

impl<'a> NodeView<'a> {
    pub(crate) fn new(node_store: &'a NodeStore, point_store: &'a PointStore, index: u32) -> Self {
        NodeView {
            node_store,
            point_store,
            index,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.node_store.is_leaf(self.index)
    }

    pub fn mass(&self) -> u32 {
        self.node_store.mass(self.index)
    }

    /// The cut of an internal node.
    pub fn cut(&self) -> Result<Cut> {
        self.node_store.cut_of(self.index)
    }

    pub fn is_left_of(&self, point: &[f64]) -> Result<bool> {
        self.node_store.is_left_of(self.index, point)
    }

    pub fn bounding_box(&self) -> Result<BoundingBox> {
        self.node_store.box_of(self.index, self.point_store)
    }

    /// Probability that a random cut separates `point` from this subtree.
    pub fn probability_of_cut(&self, point: &[f64]) -> Result<f64> {
        self.node_store
            .probability_of_cut(self.index, point, self.point_store)
    }

    /// As `probability_of_cut`, ignoring the flagged coordinates.
    pub fn probability_of_cut_with_missing(
        &self,
        point: &[f64],
        missing: &[bool],
    ) -> Result<f64> {
        Ok(self
            .bounding_box()?
            .probability_of_cut_with_missing(point, missing))
    }

    pub fn leaf_handle(&self) -> Result<PointHandle> {
        Ok(self.node_store.leaf(self.index)?.handle)
    }

    pub fn leaf_point(&self) -> Result<Vec<f64>> {
        self.point_store
            .get_copy(self.node_store.leaf(self.index)?.handle)
    }

    /// Whether the leaf's stored point equals `point` exactly.
    pub fn leaf_equals(&self, point: &[f64]) -> Result<bool> {
        self.point_store
            .is_equal(point, self.node_store.leaf(self.index)?.handle)
    }

    /// Center of mass of the subtree, when the tree maintains one.
    pub fn center_of_mass(&self) -> Result<Option<Vec<f64>>> {
        if !self.node_store.center_of_mass_enabled() {
            return Ok(None);
        }
        Ok(Some(
            self.node_store.center_of_mass(self.index, self.point_store)?,
        ))
    }

    /// Sequence-index multiset at a leaf, when the tree stores one.
    pub fn sequence_indexes(&self) -> Result<Option<&[SequenceIndex]>> {
        if !self.node_store.store_sequences_enabled() {
            return Ok(None);
        }
        match self.node_store.node(self.index) {
            Node::Leaf(leaf) => Ok(Some(&leaf.sequences)),
            _ => Err(ForestError::InvalidArgument {
                msg: "sequence indexes exist only at leaves",
            }),
        }
    }
}
