use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use serde::{Deserialize, Serialize};
use varint_rs::{VarintReader, VarintWriter};

use crate::errors::ForestError;
use crate::intervalstore::IntervalStore;
use crate::pointstore::{PointStore, INFEASIBLE};
use crate::types::Result;

pub const PRECISION_FLOAT_64: &str = "FLOAT_64";
const STATE_VERSION: u32 = 1;
const FREE_LOCATION: i64 = -1;

/// Compact, portable snapshot of a point store.
///
/// The record is self-describing: the `compressed` flag selects between raw
/// little-endian packing and delta+varint packing of the integer arrays, and
/// both branches round-trip. Only the prefix of handles up to the validity
/// prefix is recorded; everything past it is free by construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointStoreState {
    pub version: u32,
    pub dimensions: u64,
    pub capacity: u64,
    pub index_capacity: u64,
    pub current_store_capacity: u64,
    pub shingle_size: u64,
    pub start_of_free_segment: u64,
    pub precision: String,
    pub internal_shingling_enabled: bool,
    pub rotation_enabled: bool,
    pub dynamic_resizing_enabled: bool,
    pub direct_location_map: bool,
    pub compressed: bool,
    pub internal_shingle: Vec<f64>,
    pub last_time_stamp: u64,
    pub point_data: Vec<u8>,
    pub ref_count: Vec<u8>,
    pub location_list: Vec<u8>,
}

fn pack_doubles(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for &value in values {
        bytes
            .write_f64::<LittleEndian>(value)
            .expect("write to a vector cannot fail");
    }
    bytes
}

fn unpack_doubles(bytes: &[u8], count: usize) -> Result<Vec<f64>> {
    let mut reader = bytes;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(reader.read_f64::<LittleEndian>().map_err(|_| {
            ForestError::MalformedState {
                msg: "truncated point data",
            }
        })?);
    }
    Ok(values)
}

fn pack_counts(values: &[u32], compressed: bool) -> Vec<u8> {
    let mut bytes = Vec::new();
    if compressed {
        let mut previous = 0i64;
        for &value in values {
            bytes
                .write_i64_varint(value as i64 - previous)
                .expect("write to a vector cannot fail");
            previous = value as i64;
        }
    } else {
        for &value in values {
            bytes
                .write_u32::<LittleEndian>(value)
                .expect("write to a vector cannot fail");
        }
    }
    bytes
}

fn unpack_counts(bytes: &[u8], count: usize, compressed: bool) -> Result<Vec<u32>> {
    let mut reader = bytes;
    let mut values = Vec::with_capacity(count);
    if compressed {
        let mut previous = 0i64;
        for _ in 0..count {
            let delta = reader
                .read_i64_varint()
                .map_err(|_| ForestError::MalformedState {
                    msg: "truncated reference counts",
                })?;
            previous += delta;
            if previous < 0 || previous > u32::MAX as i64 {
                return Err(ForestError::MalformedState {
                    msg: "reference count out of range",
                });
            }
            values.push(previous as u32);
        }
    } else {
        for _ in 0..count {
            values.push(reader.read_u32::<LittleEndian>().map_err(|_| {
                ForestError::MalformedState {
                    msg: "truncated reference counts",
                }
            })?);
        }
    }
    Ok(values)
}

fn pack_locations(values: &[usize], compressed: bool) -> Vec<u8> {
    let mut bytes = Vec::new();
    let as_signed = |value: usize| -> i64 {
        if value == INFEASIBLE {
            FREE_LOCATION
        } else {
            value as i64
        }
    };
    if compressed {
        let mut previous = 0i64;
        for &value in values {
            let signed = as_signed(value);
            bytes
                .write_i64_varint(signed - previous)
                .expect("write to a vector cannot fail");
            previous = signed;
        }
    } else {
        for &value in values {
            bytes
                .write_i64::<LittleEndian>(as_signed(value))
                .expect("write to a vector cannot fail");
        }
    }
    bytes
}

fn unpack_locations(bytes: &[u8], count: usize, compressed: bool) -> Result<Vec<usize>> {
    let mut reader = bytes;
    let mut values = Vec::with_capacity(count);
    let mut previous = 0i64;
    for _ in 0..count {
        let signed = if compressed {
            let delta = reader
                .read_i64_varint()
                .map_err(|_| ForestError::MalformedState {
                    msg: "truncated location list",
                })?;
            previous += delta;
            previous
        } else {
            reader
                .read_i64::<LittleEndian>()
                .map_err(|_| ForestError::MalformedState {
                    msg: "truncated location list",
                })?
        };
        if signed == FREE_LOCATION {
            values.push(INFEASIBLE);
        } else if signed < 0 {
            return Err(ForestError::MalformedState {
                msg: "negative location",
            });
        } else {
            values.push(signed as usize);
        }
    }
    Ok(values)
}

/// Compacts the store and captures it as a portable state record.
pub fn to_state(point_store: &mut PointStore, compressed: bool) -> Result<PointStoreState> {
    point_store.compact()?;
    let prefix = point_store.valid_prefix();
    debug!(
        "mapping point store to state: prefix {prefix}, free segment {}",
        point_store.start_of_free_segment
    );
    Ok(PointStoreState {
        version: STATE_VERSION,
        dimensions: point_store.dimensions as u64,
        capacity: point_store.capacity as u64,
        index_capacity: point_store.location.len() as u64,
        current_store_capacity: (point_store.store.len() / point_store.dimensions) as u64,
        shingle_size: point_store.shingle_size as u64,
        start_of_free_segment: point_store.start_of_free_segment as u64,
        precision: PRECISION_FLOAT_64.to_string(),
        internal_shingling_enabled: point_store.internal_shingling,
        rotation_enabled: point_store.rotation_enabled,
        dynamic_resizing_enabled: point_store.dynamic_resizing,
        direct_location_map: point_store.direct_location_map,
        compressed,
        internal_shingle: if point_store.internal_shingling {
            point_store.known_shingle.clone()
        } else {
            Vec::new()
        },
        last_time_stamp: point_store.next_sequence_index,
        point_data: pack_doubles(&point_store.store[..point_store.start_of_free_segment]),
        ref_count: pack_counts(&point_store.reference_count[..prefix], compressed),
        location_list: pack_locations(&point_store.location[..prefix], compressed),
    })
}

/// Rebuilds a live point store from a state record.
pub fn to_model(state: &PointStoreState) -> Result<PointStore> {
    if state.precision != PRECISION_FLOAT_64 {
        return Err(ForestError::PrecisionMismatch {
            found: state.precision.clone(),
        });
    }
    let dimensions = state.dimensions as usize;
    let shingle_size = state.shingle_size as usize;
    if dimensions == 0 || shingle_size == 0 || dimensions % shingle_size != 0 {
        return Err(ForestError::MalformedState {
            msg: "inconsistent dimensions",
        });
    }
    let index_capacity = state.index_capacity as usize;
    let store_length = state.current_store_capacity as usize * dimensions;
    let start_of_free_segment = state.start_of_free_segment as usize;
    if start_of_free_segment > store_length {
        return Err(ForestError::MalformedState {
            msg: "free segment beyond the backing array",
        });
    }

    // recover the prefix; infer its length from the uncompressed stride or
    // decode greedily for the varint branch
    let prefix = if state.compressed {
        count_varints(&state.location_list)?
    } else {
        state.location_list.len() / 8
    };
    if prefix > index_capacity {
        return Err(ForestError::MalformedState {
            msg: "validity prefix exceeds index capacity",
        });
    }

    let mut location = vec![INFEASIBLE; index_capacity];
    let mut reference_count = vec![0u32; index_capacity];
    let decoded_locations = unpack_locations(&state.location_list, prefix, state.compressed)?;
    let decoded_counts = unpack_counts(&state.ref_count, prefix, state.compressed)?;
    location[..prefix].copy_from_slice(&decoded_locations);
    reference_count[..prefix].copy_from_slice(&decoded_counts);
    for handle in 0..prefix {
        let free = location[handle] == INFEASIBLE;
        if free != (reference_count[handle] == 0) {
            return Err(ForestError::MalformedState {
                msg: "location and reference count disagree",
            });
        }
        if !free && location[handle] + dimensions > start_of_free_segment {
            return Err(ForestError::MalformedState {
                msg: "location beyond the free segment",
            });
        }
    }

    let mut store = vec![0.0; store_length];
    let decoded_points = unpack_doubles(&state.point_data, start_of_free_segment)?;
    store[..start_of_free_segment].copy_from_slice(&decoded_points);

    let known_shingle = if state.internal_shingling_enabled {
        if state.internal_shingle.len() != dimensions {
            return Err(ForestError::MalformedState {
                msg: "internal shingle has the wrong length",
            });
        }
        state.internal_shingle.clone()
    } else {
        vec![0.0; dimensions]
    };

    let index_manager =
        IntervalStore::from_occupied(index_capacity, |handle| location[handle] != INFEASIBLE);

    Ok(PointStore {
        dimensions,
        shingle_size,
        capacity: state.capacity as usize,
        internal_shingling: state.internal_shingling_enabled,
        rotation_enabled: state.rotation_enabled,
        dynamic_resizing: state.dynamic_resizing_enabled,
        direct_location_map: state.direct_location_map,
        store,
        location,
        reference_count,
        start_of_free_segment,
        known_shingle,
        next_sequence_index: state.last_time_stamp,
        last_admitted: None,
        index_manager,
    })
}

fn count_varints(bytes: &[u8]) -> Result<usize> {
    let mut count = 0;
    let mut inside = false;
    for &byte in bytes {
        inside = byte & 0x80 != 0;
        if !inside {
            count += 1;
        }
    }
    if inside {
        return Err(ForestError::MalformedState {
            msg: "dangling varint continuation",
        });
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated_store() -> PointStore {
        let mut store = PointStore::new(4, 2, 64, 8, true, false, true).unwrap();
        for sequence in 1..=40u64 {
            let value = sequence as f64;
            store.admit(&[value, -value], sequence).unwrap();
        }
        // punch holes so compaction and the prefix have work to do
        for handle in [0usize, 3, 5] {
            if store.reference_count(handle) > 0 {
                store.dec_ref(handle).unwrap();
            }
        }
        store
    }

    fn live_contents(store: &PointStore) -> Vec<(usize, Vec<f64>, u32)> {
        (0..store.valid_prefix())
            .filter(|&h| store.reference_count(h) > 0)
            .map(|h| (h, store.get_copy(h).unwrap(), store.reference_count(h)))
            .collect()
    }

    #[test]
    fn model_round_trip_preserves_live_points() {
        for compressed in [false, true] {
            let mut store = populated_store();
            let before = live_contents(&store);
            let state = to_state(&mut store, compressed).unwrap();
            let restored = to_model(&state).unwrap();
            assert_eq!(live_contents(&restored), before);
            assert_eq!(restored.valid_prefix(), store.valid_prefix());
            assert_eq!(restored.next_sequence_index, store.next_sequence_index);
        }
    }

    #[test]
    fn state_round_trip_is_byte_identical() {
        for compressed in [false, true] {
            let mut store = populated_store();
            let state = to_state(&mut store, compressed).unwrap();
            let mut restored = to_model(&state).unwrap();
            let again = to_state(&mut restored, compressed).unwrap();
            assert_eq!(state, again);
        }
    }

    #[test]
    fn rotation_survives_the_round_trip() {
        let mut store = PointStore::new(4, 2, 32, 8, true, true, true).unwrap();
        for sequence in 1..=20u64 {
            let value = sequence as f64;
            store.admit(&[value, value + 0.5], sequence).unwrap();
        }
        let before = live_contents(&store);
        let state = to_state(&mut store, true).unwrap();
        let restored = to_model(&state).unwrap();
        assert_eq!(live_contents(&restored), before);
        // the restored store keeps admitting consistently rotated shingles
        let mut restored = restored;
        let next = restored.admit(&[99.0, 98.0], 21).unwrap().unwrap();
        let view = restored.get_copy(next).unwrap();
        assert!(view.contains(&99.0) && view.contains(&98.0));
    }

    #[test]
    fn state_record_round_trips_through_serde() {
        let mut store = populated_store();
        let state = to_state(&mut store, true).unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let back: PointStoreState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn wrong_precision_is_rejected() {
        let mut store = populated_store();
        let mut state = to_state(&mut store, false).unwrap();
        state.precision = "FLOAT_32".to_string();
        assert_eq!(
            to_model(&state).unwrap_err(),
            ForestError::PrecisionMismatch {
                found: "FLOAT_32".to_string()
            }
        );
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        let mut store = populated_store();
        let mut state = to_state(&mut store, false).unwrap();
        state.point_data.truncate(state.point_data.len() / 2);
        assert!(matches!(
            to_model(&state).unwrap_err(),
            ForestError::MalformedState { .. }
        ));
    }
}
