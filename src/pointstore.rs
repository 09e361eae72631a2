use std::borrow::Cow;

use log::{debug, trace};

use crate::errors::ForestError;
use crate::intervalstore::IntervalStore;
use crate::types::{PointHandle, Result, SequenceIndex};
use crate::util::{check_argument, clean_copy};

/// Sentinel in the location list meaning "this handle is not in use".
pub const INFEASIBLE: usize = usize::MAX;

/// Reference-counted arena of fixed-dimension vectors shared by the trees of
/// one forest.
///
/// Vectors are packed into a single `f64` backing array; a handle resolves
/// through `location` to a raw offset in that array. Freed handles keep their
/// backing bytes until the next [`compact`](PointStore::compact). With
/// internal shingling the store maintains the rolling shingle itself and
/// consecutive shingles share their overlapping coordinates in the backing
/// array, so each admit appends only the stride-many new values.
///
/// With rotation, the tree-space presentation of a stored vector is the
/// linear shingle rotated by `location % dimensions`; the store hands out
/// rotated copies and compaction preserves offsets modulo the dimension so
/// the presentation is stable.
#[derive(Debug)]
pub struct PointStore {
    pub(crate) dimensions: usize,
    pub(crate) shingle_size: usize,
    pub(crate) capacity: usize,
    pub(crate) internal_shingling: bool,
    pub(crate) rotation_enabled: bool,
    pub(crate) dynamic_resizing: bool,
    pub(crate) direct_location_map: bool,
    pub(crate) store: Vec<f64>,
    pub(crate) location: Vec<usize>,
    pub(crate) reference_count: Vec<u32>,
    pub(crate) start_of_free_segment: usize,
    pub(crate) known_shingle: Vec<f64>,
    pub(crate) next_sequence_index: u64,
    pub(crate) last_admitted: Option<PointHandle>,
    pub(crate) index_manager: IntervalStore,
}

impl PointStore {
    pub fn new(
        dimensions: usize,
        shingle_size: usize,
        capacity: usize,
        initial_capacity: usize,
        internal_shingling: bool,
        rotation_enabled: bool,
        dynamic_resizing: bool,
    ) -> Result<Self> {
        check_argument(dimensions > 0, "dimensions must be positive")?;
        check_argument(
            shingle_size >= 1 && dimensions % shingle_size == 0,
            "shingle size must divide dimensions",
        )?;
        check_argument(capacity > 0, "capacity must be positive")?;
        check_argument(
            !rotation_enabled || internal_shingling,
            "rotation requires internal shingling",
        )?;
        let initial = if dynamic_resizing {
            initial_capacity.clamp(1, capacity)
        } else {
            capacity
        };
        Ok(PointStore {
            dimensions,
            shingle_size,
            capacity,
            internal_shingling,
            rotation_enabled,
            dynamic_resizing,
            direct_location_map: !internal_shingling && shingle_size == 1,
            store: vec![0.0; initial * dimensions],
            location: vec![INFEASIBLE; initial],
            reference_count: vec![0; initial],
            start_of_free_segment: 0,
            known_shingle: vec![0.0; dimensions],
            next_sequence_index: 0,
            last_admitted: None,
            index_manager: IntervalStore::new(initial),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn shingle_size(&self) -> usize {
        self.shingle_size
    }

    /// Number of coordinates contributed per time step.
    pub fn base_dimensions(&self) -> usize {
        self.dimensions / self.shingle_size
    }

    pub fn is_internal_shingling_enabled(&self) -> bool {
        self.internal_shingling
    }

    pub fn is_rotation_enabled(&self) -> bool {
        self.rotation_enabled
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn live_handles(&self) -> usize {
        self.index_manager.in_use()
    }

    fn rotation_offset_for(&self, input_count: u64) -> usize {
        ((input_count as usize) % self.shingle_size) * self.base_dimensions()
    }

    /// Rotates a linear shingle into its tree-space presentation for the
    /// given input count.
    fn rotate(&self, linear: &[f64], input_count: u64) -> Vec<f64> {
        let offset = self.rotation_offset_for(input_count);
        let mut rotated = vec![0.0; self.dimensions];
        for (i, &value) in linear.iter().enumerate() {
            rotated[(i + offset) % self.dimensions] = value;
        }
        rotated
    }

    /// Builds the tree-space query point for `point`, which is either a full
    /// `dimensions`-length vector or, with internal shingling, the next
    /// `base_dimensions` values continuing the stream.
    pub fn shingled_point(&self, point: &[f64]) -> Result<Vec<f64>> {
        let base = self.base_dimensions();
        if point.len() == base && self.shingle_size > 1 {
            check_argument(
                self.internal_shingling,
                "partial input requires internal shingling",
            )?;
            let mut linear = Vec::with_capacity(self.dimensions);
            linear.extend_from_slice(&self.known_shingle[base..]);
            linear.extend_from_slice(point);
            if self.rotation_enabled {
                return Ok(self.rotate(&linear, self.next_sequence_index + 1));
            }
            return Ok(linear);
        }
        if point.len() != self.dimensions {
            return Err(ForestError::InvalidDimension {
                expected: self.dimensions,
                actual: point.len(),
            });
        }
        Ok(point.to_vec())
    }

    /// Maps missing positions of a base-dimension input onto tree-space
    /// coordinates, `look_ahead` steps past the current stream position.
    pub fn shingle_missing_indices(&self, look_ahead: usize, positions: &[usize]) -> Result<Vec<usize>> {
        if !self.internal_shingling {
            for &p in positions {
                check_argument(p < self.dimensions, "missing position out of range")?;
            }
            return Ok(positions.to_vec());
        }
        let base = self.base_dimensions();
        let mut answer = Vec::with_capacity(positions.len());
        for &p in positions {
            check_argument(p < base, "missing position out of range")?;
            if self.rotation_enabled {
                answer.push(
                    ((self.next_sequence_index as usize + look_ahead) * base + p) % self.dimensions,
                );
            } else {
                answer.push(self.dimensions - base + p);
            }
        }
        Ok(answer)
    }

    /// Admits a point, returning a stable handle with one reference, or
    /// `None` while the internal shingle is still warming up. May return an
    /// existing handle (with its count incremented) when the new shingle
    /// equals the most recently admitted one.
    pub fn admit(&mut self, point: &[f64], sequence_index: SequenceIndex) -> Result<Option<PointHandle>> {
        let base = self.base_dimensions();
        trace!("admit at sequence {sequence_index}");
        let cleaned = clean_copy(point)?;
        if self.internal_shingling {
            if cleaned.len() != base {
                return Err(ForestError::InvalidDimension {
                    expected: base,
                    actual: cleaned.len(),
                });
            }
            self.next_sequence_index += 1;
            self.known_shingle.copy_within(base.., 0);
            let tail = self.dimensions - base;
            self.known_shingle[tail..].copy_from_slice(&cleaned);
            if self.next_sequence_index < self.shingle_size as u64 {
                return Ok(None);
            }
        } else {
            if cleaned.len() != self.dimensions {
                return Err(ForestError::InvalidDimension {
                    expected: self.dimensions,
                    actual: cleaned.len(),
                });
            }
            self.next_sequence_index += 1;
            self.known_shingle.copy_from_slice(&cleaned);
        }

        // adjacent-in-time duplicate: hand back the previous handle
        if self.internal_shingling {
            if let Some(previous) = self.last_admitted {
                if self.reference_count[previous] > 0 {
                    let candidate = self.tree_space_shingle();
                    if self.is_equal(&candidate, previous)? {
                        self.inc_ref(previous)?;
                        return Ok(Some(previous));
                    }
                }
            }
        }

        let handle = self.reserve_handle()?;
        let stored: Vec<f64> = self.known_shingle.clone();
        if let Err(e) = self.write_point(handle, &stored) {
            self.reference_count[handle] = 0;
            self.index_manager.release(handle);
            return Err(e);
        }
        self.last_admitted = Some(handle);
        Ok(Some(handle))
    }

    /// The current shingle in its tree-space presentation.
    fn tree_space_shingle(&self) -> Vec<f64> {
        if self.rotation_enabled {
            self.rotate(&self.known_shingle, self.next_sequence_index)
        } else {
            self.known_shingle.clone()
        }
    }

    fn reserve_handle(&mut self) -> Result<PointHandle> {
        if self.index_manager.is_exhausted() {
            let current = self.location.len();
            if !self.dynamic_resizing || current >= self.capacity {
                return Err(ForestError::CapacityExceeded {
                    capacity: self.capacity,
                });
            }
            let grown = (current + current / 5 + 1).min(self.capacity);
            debug!("growing point store index arrays {current} -> {grown}");
            self.location.resize(grown, INFEASIBLE);
            self.reference_count.resize(grown, 0);
            self.index_manager.extend_capacity(grown);
        }
        let handle = self.index_manager.take()?;
        check_argument(self.reference_count[handle] == 0, "reserved handle in use")?;
        self.reference_count[handle] = 1;
        Ok(handle)
    }

    /// Lays the linear vector into the backing array, reusing the overlap
    /// with the previous shingle when possible.
    fn write_point(&mut self, handle: PointHandle, linear: &[f64]) -> Result<()> {
        let base = self.base_dimensions();
        let overlap = self.dimensions - base;

        // reclaim and grow up front; compaction moves offsets, so it must
        // not run between the overlap test and the append
        let worst = if self.rotation_enabled {
            2 * self.dimensions
        } else {
            self.dimensions
        };
        if self.start_of_free_segment + worst > self.store.len() {
            self.compact()?;
            self.grow_store(worst)?;
        }

        if self.internal_shingling
            && self.shingle_size > 1
            && self.start_of_free_segment >= overlap
            && self.store[self.start_of_free_segment - overlap..self.start_of_free_segment]
                == linear[..overlap]
        {
            let offset = self.start_of_free_segment - overlap;
            self.location[handle] = offset;
            let end = self.start_of_free_segment + base;
            self.store[self.start_of_free_segment..end].copy_from_slice(&linear[overlap..]);
            self.start_of_free_segment = end;
            return Ok(());
        }

        // a fresh run; with rotation the offset must stay congruent to the
        // stream position so the rotated view is correct
        let padding = if self.rotation_enabled {
            let expected = self.rotation_offset_for(self.next_sequence_index);
            (self.dimensions + expected - self.start_of_free_segment % self.dimensions)
                % self.dimensions
        } else {
            0
        };
        for _ in 0..padding {
            self.store[self.start_of_free_segment] = 0.0;
            self.start_of_free_segment += 1;
        }
        let offset = self.start_of_free_segment;
        self.location[handle] = offset;
        self.store[offset..offset + self.dimensions].copy_from_slice(linear);
        self.start_of_free_segment = offset + self.dimensions;
        Ok(())
    }

    fn grow_store(&mut self, needed: usize) -> Result<()> {
        while self.start_of_free_segment + needed > self.store.len() {
            let current = self.store.len();
            let limit = self.capacity * self.dimensions;
            if !self.dynamic_resizing || current >= limit {
                return Err(ForestError::CapacityExceeded {
                    capacity: self.capacity,
                });
            }
            let mut grown = current + current / 5 + self.dimensions;
            grown = (grown + self.dimensions - 1) / self.dimensions * self.dimensions;
            let grown = grown.min(limit);
            debug!("growing point store backing {current} -> {grown}");
            self.store.resize(grown, 0.0);
        }
        Ok(())
    }

    pub fn inc_ref(&mut self, handle: PointHandle) -> Result<u32> {
        check_argument(
            handle < self.reference_count.len() && self.reference_count[handle] > 0,
            "handle not in use",
        )?;
        self.reference_count[handle] += 1;
        Ok(self.reference_count[handle])
    }

    /// Drops one reference; at zero the handle becomes free and its backing
    /// bytes are reclaimed by the next compaction.
    pub fn dec_ref(&mut self, handle: PointHandle) -> Result<u32> {
        check_argument(
            handle < self.reference_count.len() && self.reference_count[handle] > 0,
            "handle not in use",
        )?;
        self.reference_count[handle] -= 1;
        if self.reference_count[handle] == 0 {
            self.location[handle] = INFEASIBLE;
            self.index_manager.release(handle);
            if self.last_admitted == Some(handle) {
                self.last_admitted = None;
            }
        }
        Ok(self.reference_count[handle])
    }

    pub fn reference_count(&self, handle: PointHandle) -> u32 {
        if handle < self.reference_count.len() {
            self.reference_count[handle]
        } else {
            0
        }
    }

    fn raw_slice(&self, handle: PointHandle) -> Result<(&[f64], usize)> {
        check_argument(
            handle < self.reference_count.len() && self.reference_count[handle] > 0,
            "handle not in use",
        )?;
        let offset = self.location[handle];
        check_argument(offset != INFEASIBLE, "handle has no location")?;
        let rotation = if self.rotation_enabled {
            offset % self.dimensions
        } else {
            0
        };
        Ok((&self.store[offset..offset + self.dimensions], rotation))
    }

    /// Tree-space view of the stored vector; borrows the backing array when
    /// no unrotation is required.
    pub fn view(&self, handle: PointHandle) -> Result<Cow<'_, [f64]>> {
        let (reference, rotation) = self.raw_slice(handle)?;
        if rotation == 0 {
            Ok(Cow::Borrowed(reference))
        } else {
            let mut rotated = vec![0.0; self.dimensions];
            for (i, &value) in reference.iter().enumerate() {
                rotated[(i + rotation) % self.dimensions] = value;
            }
            Ok(Cow::Owned(rotated))
        }
    }

    pub fn get_copy(&self, handle: PointHandle) -> Result<Vec<f64>> {
        Ok(self.view(handle)?.into_owned())
    }

    /// Whether the stored vector equals `point` (a tree-space vector).
    pub fn is_equal(&self, point: &[f64], handle: PointHandle) -> Result<bool> {
        if point.len() != self.dimensions {
            return Err(ForestError::InvalidDimension {
                expected: self.dimensions,
                actual: point.len(),
            });
        }
        let (reference, rotation) = self.raw_slice(handle)?;
        if rotation == 0 {
            return Ok(point == reference);
        }
        Ok(reference
            .iter()
            .enumerate()
            .all(|(i, &value)| point[(i + rotation) % self.dimensions] == value))
    }

    /// Collapses free holes in the backing array, preserving handle values
    /// and the relative order of live vectors; only offsets change. Must not
    /// run while any tree is mid-traversal on this store, which the executor
    /// guarantees by compacting between external calls.
    pub fn compact(&mut self) -> Result<()> {
        let mut live: Vec<(usize, PointHandle)> = self
            .location
            .iter()
            .enumerate()
            .filter(|(_, &offset)| offset != INFEASIBLE)
            .map(|(handle, &offset)| (offset, handle))
            .collect();
        live.sort_unstable();
        trace!(
            "compacting point store: {} live handles, free segment at {}",
            live.len(),
            self.start_of_free_segment
        );

        let mut fresh_start = 0;
        let mut i = 0;
        while i < live.len() {
            let block_start = live[i].0;
            let mut block_end = block_start + self.dimensions;
            let mut j = i + 1;
            while j < live.len() && live[j].0 <= block_end {
                block_end = block_end.max(live[j].0 + self.dimensions);
                j += 1;
            }
            if self.rotation_enabled {
                // keep offsets congruent mod dimensions so rotations hold
                while fresh_start % self.dimensions != block_start % self.dimensions {
                    self.store[fresh_start] = 0.0;
                    fresh_start += 1;
                }
            }
            check_argument(fresh_start <= block_start, "compaction would move data right")?;
            for &(offset, handle) in &live[i..j] {
                self.location[handle] = fresh_start + (offset - block_start);
            }
            self.store.copy_within(block_start..block_end, fresh_start);
            fresh_start += block_end - block_start;
            i = j;
        }
        self.start_of_free_segment = fresh_start;
        Ok(())
    }

    /// The smallest `k` such that every handle `>= k` is free; the state
    /// mapper truncates its packed arrays there.
    pub fn valid_prefix(&self) -> usize {
        for (handle, &offset) in self.location.iter().enumerate().rev() {
            if offset != INFEASIBLE {
                return handle + 1;
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_store(dimensions: usize, capacity: usize) -> PointStore {
        PointStore::new(dimensions, 1, capacity, capacity, false, false, true).unwrap()
    }

    #[test]
    fn admit_and_resolve() {
        let mut store = plain_store(2, 8);
        let a = store.admit(&[1.0, 2.0], 1).unwrap().unwrap();
        let b = store.admit(&[3.0, 4.0], 2).unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(store.get_copy(a).unwrap(), vec![1.0, 2.0]);
        assert_eq!(store.get_copy(b).unwrap(), vec![3.0, 4.0]);
        assert!(store.is_equal(&[3.0, 4.0], b).unwrap());
        assert_eq!(store.reference_count(a), 1);
    }

    #[test]
    fn dec_ref_frees_and_capacity_is_enforced() {
        let mut store = PointStore::new(1, 1, 2, 2, false, false, false).unwrap();
        let a = store.admit(&[1.0], 1).unwrap().unwrap();
        let _b = store.admit(&[2.0], 2).unwrap().unwrap();
        assert_eq!(
            store.admit(&[3.0], 3).unwrap_err(),
            ForestError::CapacityExceeded { capacity: 2 }
        );
        assert_eq!(store.dec_ref(a).unwrap(), 0);
        // freed slot is reusable, backing bytes reclaimed by compaction
        let c = store.admit(&[3.0], 4).unwrap().unwrap();
        assert_eq!(store.get_copy(c).unwrap(), vec![3.0]);
    }

    #[test]
    fn shingle_overlap_reuses_backing_bytes() {
        // dimensions 4, shingle size 2: each admit should append 2 floats
        let mut store = PointStore::new(4, 2, 16, 16, true, false, true).unwrap();
        assert!(store.admit(&[1.0, 2.0], 1).unwrap().is_none());
        let a = store.admit(&[3.0, 4.0], 2).unwrap().unwrap();
        assert_eq!(store.get_copy(a).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        let used_after_first = store.start_of_free_segment;
        let b = store.admit(&[5.0, 6.0], 3).unwrap().unwrap();
        assert_eq!(store.get_copy(b).unwrap(), vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(store.start_of_free_segment, used_after_first + 2);
    }

    #[test]
    fn identical_adjacent_shingles_share_a_handle() {
        let mut store = PointStore::new(2, 2, 16, 16, true, false, true).unwrap();
        assert!(store.admit(&[7.0], 1).unwrap().is_none());
        let a = store.admit(&[7.0], 2).unwrap().unwrap();
        let b = store.admit(&[7.0], 3).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(store.reference_count(a), 2);
    }

    #[test]
    fn rotation_presents_cyclic_views() {
        let mut store = PointStore::new(4, 2, 16, 16, true, true, true).unwrap();
        assert!(store.admit(&[1.0, 2.0], 1).unwrap().is_none());
        let a = store.admit(&[3.0, 4.0], 2).unwrap().unwrap();
        let b = store.admit(&[5.0, 6.0], 3).unwrap().unwrap();
        let va = store.get_copy(a).unwrap();
        let vb = store.get_copy(b).unwrap();
        // linear shingles are (1,2,3,4) and (3,4,5,6); the rotated views put
        // each time step's block at a stable cyclic position
        assert_eq!(va, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(vb, vec![5.0, 6.0, 3.0, 4.0]);
        assert!(store.is_equal(&vb, b).unwrap());
    }

    #[test]
    fn compaction_preserves_handles_and_order() {
        let mut store = plain_store(2, 16);
        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(store.admit(&[i as f64, 0.0], i).unwrap().unwrap());
        }
        for &h in handles.iter().step_by(2) {
            store.dec_ref(h).unwrap();
        }
        let survivors: Vec<_> = handles.iter().copied().skip(1).step_by(2).collect();
        let before: Vec<_> = survivors
            .iter()
            .map(|&h| store.get_copy(h).unwrap())
            .collect();
        store.compact().unwrap();
        let after: Vec<_> = survivors
            .iter()
            .map(|&h| store.get_copy(h).unwrap())
            .collect();
        assert_eq!(before, after);
        assert_eq!(store.start_of_free_segment, 2 * survivors.len());
        let mut offsets: Vec<_> = survivors.iter().map(|&h| store.location[h]).collect();
        let sorted = {
            let mut s = offsets.clone();
            s.sort_unstable();
            s
        };
        assert_eq!(offsets, sorted);
        offsets.dedup();
        assert_eq!(offsets.len(), survivors.len());
    }

    #[test]
    fn valid_prefix_tracks_trailing_free_handles() {
        let mut store = plain_store(1, 8);
        let a = store.admit(&[1.0], 1).unwrap().unwrap();
        let b = store.admit(&[2.0], 2).unwrap().unwrap();
        let c = store.admit(&[3.0], 3).unwrap().unwrap();
        assert_eq!(store.valid_prefix(), 3);
        store.dec_ref(c).unwrap();
        assert_eq!(store.valid_prefix(), 2);
        store.dec_ref(a).unwrap();
        assert_eq!(store.valid_prefix(), 2);
        store.dec_ref(b).unwrap();
        assert_eq!(store.valid_prefix(), 0);
    }

    #[test]
    fn admit_rejects_nan_and_bad_dimension() {
        let mut store = plain_store(2, 4);
        assert!(matches!(
            store.admit(&[1.0, f64::NAN], 1),
            Err(ForestError::InvalidPoint { .. })
        ));
        assert!(matches!(
            store.admit(&[1.0], 2),
            Err(ForestError::InvalidDimension { .. })
        ));
    }

    #[test]
    fn shingled_query_points_extend_the_stream() {
        let mut store = PointStore::new(4, 2, 16, 16, true, false, true).unwrap();
        store.admit(&[1.0, 2.0], 1).unwrap();
        store.admit(&[3.0, 4.0], 2).unwrap();
        let q = store.shingled_point(&[9.0, 9.0]).unwrap();
        assert_eq!(q, vec![3.0, 4.0, 9.0, 9.0]);
        assert_eq!(store.shingle_missing_indices(0, &[0, 1]).unwrap(), vec![2, 3]);
    }
}
