use crate::boundingbox::BoundingBox;
use crate::cut::Cut;
use crate::errors::ForestError;
use crate::nodestore::{NodeStore, NULL_NODE};
use crate::nodeview::NodeView;
use crate::pointstore::PointStore;
use crate::types::{PointHandle, RandomUnit, Result, SeededRandom, SequenceIndex};
use crate::util::check_argument;
use crate::visitor::{MultiVisitor, Visitor};

/// A random cut tree: an incremental binary space partition over the points
/// referenced by its leaves.
///
/// The tree stores point handles, not points; the vectors live in a
/// [`PointStore`] shared with the rest of the forest, which is why the
/// structural operations borrow one. Randomness comes exclusively from the
/// injected [`RandomUnit`] capability, one draw per node whose box does not
/// already contain the inserted point.
pub struct RandomCutTree {
    dimensions: usize,
    capacity: usize,
    node_store: NodeStore,
    root: u32,
    rng: Box<dyn RandomUnit>,
}

impl RandomCutTree {
    pub fn new(
        dimensions: usize,
        capacity: usize,
        store_sequence_indexes: bool,
        center_of_mass: bool,
        bounding_box_cache_fraction: f64,
        random_seed: u64,
    ) -> Result<Self> {
        Self::with_random(
            dimensions,
            capacity,
            store_sequence_indexes,
            center_of_mass,
            bounding_box_cache_fraction,
            Box::new(SeededRandom::new(random_seed)),
        )
    }

    /// Constructor with an explicit randomness capability; shape tests
    /// inject a scripted sequence here.
    pub fn with_random(
        dimensions: usize,
        capacity: usize,
        store_sequence_indexes: bool,
        center_of_mass: bool,
        bounding_box_cache_fraction: f64,
        rng: Box<dyn RandomUnit>,
    ) -> Result<Self> {
        check_argument(dimensions > 0, "dimensions must be positive")?;
        check_argument(capacity > 1, "tree capacity must exceed one point")?;
        let node_store = NodeStore::new(
            capacity,
            dimensions,
            store_sequence_indexes,
            center_of_mass,
            bounding_box_cache_fraction,
        )?;
        Ok(RandomCutTree {
            dimensions,
            capacity,
            node_store,
            root: NULL_NODE,
            rng,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.root == NULL_NODE
    }

    /// Number of point occurrences in the tree, counting multiplicity.
    pub fn mass(&self) -> u32 {
        if self.root == NULL_NODE {
            0
        } else {
            self.node_store.mass(self.root)
        }
    }

    /// Retargets the bounding-box cache; entries materialize lazily.
    pub fn set_bounding_box_cache_fraction(&mut self, fraction: f64) -> Result<()> {
        self.node_store.set_cache_fraction(fraction)
    }

    fn check_dimensions(&self, point: &[f64]) -> Result<()> {
        if point.len() != self.dimensions {
            return Err(ForestError::InvalidDimension {
                expected: self.dimensions,
                actual: point.len(),
            });
        }
        Ok(())
    }

    /// Inserts one occurrence of the point behind `handle` at the given
    /// sequence index. Returns the handle the tree actually retained, which
    /// is the existing one when an equal point is already present. With
    /// sequence indexes enabled, re-inserting a (point, sequence) pair that
    /// is already present is a no-op.
    pub fn add_point(
        &mut self,
        handle: PointHandle,
        sequence_index: SequenceIndex,
        point_store: &PointStore,
    ) -> Result<PointHandle> {
        let point = point_store.get_copy(handle)?;
        self.check_dimensions(&point)?;

        if self.root == NULL_NODE {
            self.root = self.node_store.new_leaf(handle, sequence_index, NULL_NODE)?;
            return Ok(handle);
        }

        // walk down; one random draw at each node whose box does not
        // already contain the point
        let mut path: Vec<u32> = Vec::new();
        let mut node = self.root;
        loop {
            let node_box = self.node_store.box_of(node, point_store)?;
            if !node_box.contains(&point) {
                let merged = node_box.merged_with_point(&point)?;
                let factor = self.rng.next_unit();
                if let Some(cut) = Cut::random_cut(&merged, factor) {
                    if cut.separates(&point, &node_box) {
                        return self.split(
                            node,
                            handle,
                            sequence_index,
                            &point,
                            cut,
                            merged,
                            &path,
                            point_store,
                        );
                    }
                }
            }
            if self.node_store.is_leaf(node) {
                return self.absorb_at_leaf(node, sequence_index, &point, &path, point_store);
            }
            path.push(node);
            node = {
                let internal = self.node_store.internal(node)?;
                if point[internal.cut_dimension as usize] <= internal.cut_value {
                    internal.left
                } else {
                    internal.right
                }
            };
        }
    }

    /// Same point at a leaf: bump multiplicity and propagate.
    fn absorb_at_leaf(
        &mut self,
        node: u32,
        sequence_index: SequenceIndex,
        point: &[f64],
        path: &[u32],
        point_store: &PointStore,
    ) -> Result<PointHandle> {
        let leaf = self.node_store.leaf(node)?;
        check_argument(
            point_store.is_equal(point, leaf.handle)?,
            "leaf cut failed to separate distinct points",
        )?;
        let retained = leaf.handle;
        if self.node_store.store_sequences_enabled() && leaf.sequences.contains(&sequence_index) {
            // idempotent re-insert of a known (point, sequence) pair
            return Ok(retained);
        }
        let store_sequences = self.node_store.store_sequences_enabled();
        {
            let leaf = self.node_store.leaf_mut(node)?;
            leaf.mass += 1;
            if store_sequences {
                leaf.sequences.push(sequence_index);
            }
        }
        for &ancestor in path.iter().rev() {
            self.node_store.internal_mut(ancestor)?.mass += 1;
            self.node_store.adjust_point_sum(ancestor, point, 1.0)?;
            // boxes already contain a duplicate point
        }
        Ok(retained)
    }

    #[allow(clippy::too_many_arguments)]
    fn split(
        &mut self,
        node: u32,
        handle: PointHandle,
        sequence_index: SequenceIndex,
        point: &[f64],
        cut: Cut,
        merged_box: BoundingBox,
        path: &[u32],
        point_store: &PointStore,
    ) -> Result<PointHandle> {
        let parent = self.node_store.parent(node);
        let leaf = self.node_store.new_leaf(handle, sequence_index, NULL_NODE)?;
        let (left, right) = if cut.is_left_of(point) {
            (leaf, node)
        } else {
            (node, leaf)
        };
        let mass = self.node_store.mass(node) + 1;
        let merged = self
            .node_store
            .new_internal(parent, cut, left, right, mass, &merged_box)?;
        self.node_store.set_parent(leaf, merged);
        self.node_store.set_parent(node, merged);
        self.node_store.recompute_point_sum(merged, point_store)?;

        if parent == NULL_NODE {
            self.root = merged;
        } else {
            self.node_store.replace_child(parent, node, merged)?;
        }

        let mut resolved = false;
        for &ancestor in path.iter().rev() {
            self.node_store.internal_mut(ancestor)?.mass += 1;
            self.node_store.adjust_point_sum(ancestor, point, 1.0)?;
            if !resolved {
                resolved = self
                    .node_store
                    .check_contains_and_add_point(ancestor, point, point_store)?;
            }
        }
        Ok(handle)
    }

    /// Deletes one occurrence of the point behind `handle` at the given
    /// sequence index, returning the handle the leaf held. The walk follows
    /// the cuts; stepping outside a cached box, or a leaf mismatch, means
    /// the point was never inserted. Failed deletes leave the tree
    /// unchanged.
    pub fn delete_point(
        &mut self,
        handle: PointHandle,
        sequence_index: SequenceIndex,
        point_store: &PointStore,
    ) -> Result<PointHandle> {
        if self.root == NULL_NODE {
            return Err(ForestError::PointNotFound);
        }
        let point = point_store.get_copy(handle)?;
        self.check_dimensions(&point)?;

        let mut path: Vec<u32> = Vec::new();
        let mut node = self.root;
        while !self.node_store.is_leaf(node) {
            if self.node_store.cached_contains(node, &point) == Some(false) {
                return Err(ForestError::PointNotFound);
            }
            path.push(node);
            let internal = self.node_store.internal(node)?;
            node = if point[internal.cut_dimension as usize] <= internal.cut_value {
                internal.left
            } else {
                internal.right
            };
        }

        let leaf = self.node_store.leaf(node)?;
        if !point_store.is_equal(&point, leaf.handle)? {
            return Err(ForestError::PointNotFound);
        }
        let retained = leaf.handle;
        let sequence_position = if self.node_store.store_sequences_enabled() {
            match leaf.sequences.iter().position(|&s| s == sequence_index) {
                Some(position) => Some(position),
                None => return Err(ForestError::SequenceNotFound),
            }
        } else {
            None
        };

        // all failure checks are behind us; mutate
        {
            let leaf = self.node_store.leaf_mut(node)?;
            if let Some(position) = sequence_position {
                leaf.sequences.swap_remove(position);
            }
            leaf.mass -= 1;
        }
        if self.node_store.mass(node) > 0 {
            for &ancestor in path.iter().rev() {
                self.node_store.internal_mut(ancestor)?.mass -= 1;
                self.node_store.adjust_point_sum(ancestor, &point, -1.0)?;
            }
            return Ok(retained);
        }

        // the leaf is gone; its sibling moves up in place of the parent
        self.node_store.release(node);
        let Some(parent) = path.pop() else {
            self.root = NULL_NODE;
            return Ok(retained);
        };
        let sibling = self.node_store.sibling_of(parent, node)?;
        match path.last() {
            None => {
                self.root = sibling;
                self.node_store.set_parent(sibling, NULL_NODE);
            }
            Some(&grand_parent) => {
                self.node_store.replace_child(grand_parent, parent, sibling)?;
            }
        }
        self.node_store.release(parent);

        let mut resolved = false;
        for &ancestor in path.iter().rev() {
            self.node_store.internal_mut(ancestor)?.mass -= 1;
            self.node_store.adjust_point_sum(ancestor, &point, -1.0)?;
            if !resolved {
                resolved = self
                    .node_store
                    .check_contains_and_rebuild_box(ancestor, &point, point_store)?;
            }
        }
        Ok(retained)
    }

    /// Runs a visitor root-to-leaf along `point`'s side of every cut and
    /// returns its result.
    pub fn traverse<V: Visitor>(
        &self,
        point: &[f64],
        mut visitor: V,
        point_store: &PointStore,
    ) -> Result<V::Output> {
        self.check_dimensions(point)?;
        if self.root == NULL_NODE {
            return Err(ForestError::EmptyTree);
        }
        self.traverse_recursive(self.root, 0, point, &mut visitor, point_store)?;
        visitor.result()
    }

    fn traverse_recursive<V: Visitor>(
        &self,
        node: u32,
        depth: usize,
        point: &[f64],
        visitor: &mut V,
        point_store: &PointStore,
    ) -> Result<()> {
        let view = NodeView::new(&self.node_store, point_store, node);
        if self.node_store.is_leaf(node) {
            return visitor.accept_leaf(&view, depth);
        }
        visitor.accept(&view, depth)?;
        let child = {
            let internal = self.node_store.internal(node)?;
            if point[internal.cut_dimension as usize] <= internal.cut_value {
                internal.left
            } else {
                internal.right
            }
        };
        self.traverse_recursive(child, depth + 1, point, visitor, point_store)?;
        if visitor.is_path_post_order() {
            visitor.accept(&view, depth)?;
        }
        Ok(())
    }

    /// Multi-visitor traversal: at each internal node the visitor may fork
    /// and explore both children, merging the copies on the way back. NaN
    /// coordinates are legal here; they mark missing values whose cuts the
    /// visitor is expected to trigger on.
    pub fn traverse_multi<V: MultiVisitor>(
        &self,
        point: &[f64],
        mut visitor: V,
        point_store: &PointStore,
    ) -> Result<V::Output> {
        self.check_dimensions(point)?;
        if self.root == NULL_NODE {
            return Err(ForestError::EmptyTree);
        }
        self.traverse_multi_recursive(self.root, 0, point, &mut visitor, point_store)?;
        visitor.result()
    }

    fn traverse_multi_recursive<V: MultiVisitor>(
        &self,
        node: u32,
        depth: usize,
        point: &[f64],
        visitor: &mut V,
        point_store: &PointStore,
    ) -> Result<()> {
        let view = NodeView::new(&self.node_store, point_store, node);
        if self.node_store.is_leaf(node) {
            return visitor.accept_leaf(&view, depth);
        }
        visitor.accept(&view, depth)?;
        let internal = self.node_store.internal(node)?;
        let (left, right) = (internal.left, internal.right);
        if visitor.trigger(&view)? {
            let mut other = visitor.new_copy();
            self.traverse_multi_recursive(left, depth + 1, point, visitor, point_store)?;
            self.traverse_multi_recursive(right, depth + 1, point, &mut other, point_store)?;
            visitor.combine(other)?;
        } else {
            let child = if point[internal.cut_dimension as usize] <= internal.cut_value {
                left
            } else {
                right
            };
            self.traverse_multi_recursive(child, depth + 1, point, visitor, point_store)?;
        }
        if visitor.is_path_post_order() {
            let view = NodeView::new(&self.node_store, point_store, node);
            visitor.accept(&view, depth)?;
        }
        Ok(())
    }

    pub(crate) fn node_store(&self) -> &NodeStore {
        &self.node_store
    }

    pub(crate) fn root(&self) -> u32 {
        self.root
    }
}
