use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::types::{PointHandle, Result, SequenceIndex};
use crate::util::check_argument;

/// Outcome of offering a sequence index to a sampler.
#[derive(Clone, Debug, PartialEq)]
pub enum SamplerDecision {
    Reject,
    Accept,
    /// Accepted, at the price of evicting the entry admitted at
    /// `sequence_index` under `handle`.
    AcceptAndEvict {
        sequence_index: SequenceIndex,
        handle: PointHandle,
    },
}

/// Reservoir policy consulted by a component before touching its tree.
///
/// The protocol is two-phase: `decide` commits the sampler to an accept or
/// reject for the offered sequence index; on an accept the component inserts
/// into its tree and then reports the handle actually retained through
/// `note_accepted`. Every Accept/AcceptAndEvict must be followed by exactly
/// one `note_accepted` before the next `decide`.
pub trait ReservoirSampler: Send + Sync {
    fn decide(&mut self, sequence_index: SequenceIndex) -> SamplerDecision;

    fn note_accepted(&mut self, sequence_index: SequenceIndex, handle: PointHandle) -> Result<()>;

    fn is_full(&self) -> bool;

    fn size(&self) -> usize;

    fn capacity(&self) -> usize;

    /// The handle stored for a live sequence index, if any.
    fn handle_of(&self, sequence_index: SequenceIndex) -> Option<PointHandle>;
}

struct Entry {
    weight: f64,
    sequence_index: SequenceIndex,
    handle: PointHandle,
}

/// Time-decayed weighted reservoir over a max-weight heap.
///
/// Each offer draws `ln(-ln(u)) - seq · λ`; smaller is better, so the
/// largest weight sits at the heap root and is the eviction victim. While
/// the reservoir fills, acceptance ramps down from certainty as the fill
/// fraction passes `initial_accept_fraction`.
pub struct TimeDecaySampler {
    capacity: usize,
    time_decay: f64,
    initial_accept_fraction: f64,
    rng: ChaCha20Rng,
    entries: Vec<Entry>,
    pending_weight: Option<f64>,
}

impl TimeDecaySampler {
    pub fn new(
        capacity: usize,
        time_decay: f64,
        initial_accept_fraction: f64,
        random_seed: u64,
    ) -> Self {
        TimeDecaySampler {
            capacity,
            time_decay,
            initial_accept_fraction,
            rng: ChaCha20Rng::seed_from_u64(random_seed),
            entries: Vec::with_capacity(capacity),
            pending_weight: None,
        }
    }

    fn fill_fraction(&self) -> f64 {
        self.entries.len() as f64 / self.capacity as f64
    }

    fn initial_accept_probability(&self, fill_fraction: f64) -> f64 {
        if fill_fraction < self.initial_accept_fraction {
            1.0
        } else if self.initial_accept_fraction >= 1.0 {
            0.0
        } else {
            1.0 - (fill_fraction - self.initial_accept_fraction)
                / (1.0 - self.initial_accept_fraction)
        }
    }

    fn swap_down(&mut self, start: usize) {
        let mut current = start;
        while 2 * current + 1 < self.entries.len() {
            let mut largest = 2 * current + 1;
            let right = 2 * current + 2;
            if right < self.entries.len() && self.entries[right].weight > self.entries[largest].weight
            {
                largest = right;
            }
            if self.entries[largest].weight > self.entries[current].weight {
                self.entries.swap(current, largest);
                current = largest;
            } else {
                break;
            }
        }
    }

    fn evict_max(&mut self) -> Entry {
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let evicted = self.entries.pop().expect("heap cannot be empty here");
        self.swap_down(0);
        evicted
    }
}

impl ReservoirSampler for TimeDecaySampler {
    fn decide(&mut self, sequence_index: SequenceIndex) -> SamplerDecision {
        let u: f64 = self.rng.gen();
        let weight = f64::ln(-f64::ln(u)) - sequence_index as f64 * self.time_decay;

        if !self.is_full() {
            let ramp: f64 = self.rng.gen();
            if ramp < self.initial_accept_probability(self.fill_fraction()) {
                self.pending_weight = Some(weight);
                return SamplerDecision::Accept;
            }
        }
        if !self.entries.is_empty() && weight < self.entries[0].weight {
            let evicted = self.evict_max();
            self.pending_weight = Some(weight);
            return SamplerDecision::AcceptAndEvict {
                sequence_index: evicted.sequence_index,
                handle: evicted.handle,
            };
        }
        SamplerDecision::Reject
    }

    fn note_accepted(&mut self, sequence_index: SequenceIndex, handle: PointHandle) -> Result<()> {
        let weight = match self.pending_weight.take() {
            Some(weight) => weight,
            None => {
                return Err(crate::errors::ForestError::InvalidArgument {
                    msg: "note_accepted without a preceding accept",
                })
            }
        };
        check_argument(self.entries.len() < self.capacity, "sampler overflow")?;
        self.entries.push(Entry {
            weight,
            sequence_index,
            handle,
        });
        let mut current = self.entries.len() - 1;
        while current > 0 {
            let parent = (current - 1) / 2;
            if self.entries[parent].weight < self.entries[current].weight {
                self.entries.swap(current, parent);
                current = parent;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn handle_of(&self, sequence_index: SequenceIndex) -> Option<PointHandle> {
        self.entries
            .iter()
            .find(|entry| entry.sequence_index == sequence_index)
            .map(|entry| entry.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_then_evicts_at_capacity() {
        let mut sampler = TimeDecaySampler::new(16, 0.01, 0.125, 3);
        let mut live = 0usize;
        for sequence in 1..=1000u64 {
            match sampler.decide(sequence) {
                SamplerDecision::Reject => {}
                SamplerDecision::Accept => {
                    sampler.note_accepted(sequence, sequence as usize).unwrap();
                    live += 1;
                }
                SamplerDecision::AcceptAndEvict { .. } => {
                    sampler.note_accepted(sequence, sequence as usize).unwrap();
                }
            }
            assert!(sampler.size() <= sampler.capacity());
        }
        assert!(live >= 16);
        assert!(sampler.is_full());
        // heap property: every parent outweighs its children
        for i in 1..sampler.entries.len() {
            let parent = (i - 1) / 2;
            assert!(sampler.entries[parent].weight >= sampler.entries[i].weight);
        }
    }

    #[test]
    fn time_decay_prefers_recent_points() {
        let mut sampler = TimeDecaySampler::new(32, 0.05, 0.125, 9);
        for sequence in 1..=2000u64 {
            match sampler.decide(sequence) {
                SamplerDecision::Reject => {}
                _ => sampler.note_accepted(sequence, sequence as usize).unwrap(),
            }
        }
        let mean_sequence: f64 = sampler
            .entries
            .iter()
            .map(|e| e.sequence_index as f64)
            .sum::<f64>()
            / sampler.entries.len() as f64;
        assert!(
            mean_sequence > 1000.0,
            "decayed reservoir should skew recent, got mean {mean_sequence}"
        );
    }

    #[test]
    fn note_without_accept_is_rejected() {
        let mut sampler = TimeDecaySampler::new(4, 0.0, 1.0, 1);
        assert!(sampler.note_accepted(1, 1).is_err());
    }

    #[test]
    fn accepted_entries_are_addressable_by_sequence() {
        let mut sampler = TimeDecaySampler::new(4, 0.0, 0.125, 5);
        let mut admitted = Vec::new();
        for sequence in 1..=50u64 {
            match sampler.decide(sequence) {
                SamplerDecision::Reject => {}
                SamplerDecision::Accept => {
                    sampler.note_accepted(sequence, 1000 + sequence as usize).unwrap();
                    admitted.push(sequence);
                }
                SamplerDecision::AcceptAndEvict { sequence_index, .. } => {
                    sampler.note_accepted(sequence, 1000 + sequence as usize).unwrap();
                    admitted.retain(|&s| s != sequence_index);
                    admitted.push(sequence);
                }
            }
        }
        for &sequence in &admitted {
            assert_eq!(sampler.handle_of(sequence), Some(1000 + sequence as usize));
        }
        assert_eq!(sampler.handle_of(0), None);
    }
}
