//! Hash-lookup slot sizing.
//!
//! Each segment owns an open-addressed lookup array. A slot packs two
//! fields: hash bits of the key (key bits) and the index of the entry's
//! first chunk (value bits). Slots are read and written with single atomic
//! loads and stores, so their width is 4 or 8 bytes; 8 only where aligned
//! 64-bit memory operations are atomic.

use stratamap_common::num::next_power_of_two;

/// Minimum slots in a segment's lookup array.
pub const MIN_HASH_LOOKUP_CAPACITY: u64 = 64;

/// Load factor past which the lookup capacity doubles.
pub const MAX_LOAD_FACTOR: f64 = 2.0 / 3.0;

/// Hash bits stored beyond the capacity bits, cutting the probability that
/// distinct keys collide on both slot index and stored hash.
pub const EXTRA_HASH_BITS: u32 = 2;

/// Slots in a segment's lookup array for the given entry count.
pub fn capacity_for(entries_per_segment: u64) -> u64 {
    let capacity = next_power_of_two(entries_per_segment, MIN_HASH_LOOKUP_CAPACITY);
    if entries_per_segment as f64 / capacity as f64 > MAX_LOAD_FACTOR {
        capacity << 1
    } else {
        capacity
    }
}

/// Bits of a slot's chunk-index field: wide enough for any chunk index in
/// the segment.
pub fn value_bits(chunks_per_segment: u64) -> u32 {
    64 - chunks_per_segment.leading_zeros()
}

/// Bits of a slot's hash field.
pub fn key_bits(entries_per_segment: u64, _value_bits: u32) -> u32 {
    capacity_for(entries_per_segment).trailing_zeros() + EXTRA_HASH_BITS
}

/// Slot bytes holding the packed fields.
///
/// 4 and 8 are the widths the runtime can operate on atomically; anything
/// wider is a sentinel the segment planner's search rejects and the layout
/// invariants refuse.
pub fn entry_size(key_bits: u32, value_bits: u32) -> u32 {
    let bits = key_bits + value_bits;
    if bits <= 32 {
        4
    } else if bits <= 64 {
        8
    } else {
        16
    }
}

/// Slot bytes for a segment of the given entry and chunk counts.
pub fn slot_bytes(entries_per_segment: u64, chunks_per_segment: u64) -> u32 {
    let value_bits = value_bits(chunks_per_segment);
    let key_bits = key_bits(entries_per_segment, value_bits);
    entry_size(key_bits, value_bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_floor() {
        assert_eq!(capacity_for(1), 64);
        assert_eq!(capacity_for(40), 64);
    }

    #[test]
    fn test_capacity_doubles_past_load_factor() {
        // 43 / 64 = 0.67 > 2/3
        assert_eq!(capacity_for(42), 64);
        assert_eq!(capacity_for(43), 128);
        assert_eq!(capacity_for(100), 256);
        // 21845 / 32768 is just under 2/3; one more entry tips it.
        assert_eq!(capacity_for(21_845), 32_768);
        assert_eq!(capacity_for(21_846), 65_536);
    }

    #[test]
    fn test_value_bits() {
        assert_eq!(value_bits(1), 1);
        assert_eq!(value_bits(2), 2);
        assert_eq!(value_bits(3), 2);
        assert_eq!(value_bits(4), 3);
        assert_eq!(value_bits(65_535), 16);
        assert_eq!(value_bits(65_536), 17);
        assert_eq!(value_bits(1 << 32), 33);
    }

    #[test]
    fn test_key_bits() {
        // Capacity 64 -> 6 bits + 2 extra.
        assert_eq!(key_bits(1, 0), 8);
        assert_eq!(key_bits(16_384, 0), 15 + EXTRA_HASH_BITS);
    }

    #[test]
    fn test_entry_size_widths() {
        assert_eq!(entry_size(16, 16), 4);
        assert_eq!(entry_size(17, 16), 8);
        assert_eq!(entry_size(32, 32), 8);
        assert_eq!(entry_size(40, 33), 16);
    }

    #[test]
    fn test_slot_bytes_boundary() {
        // 10922 entries at 5.25 chunks each stay within a 4-byte slot;
        // one more entry doubles the capacity and forces 8 bytes.
        assert_eq!(slot_bytes(10_922, 57_341), 4);
        assert_eq!(slot_bytes(10_923, 57_347), 8);
    }

    #[test]
    fn test_slot_bytes_monotone_in_entries() {
        let mut last = 0;
        for shift in 0..30 {
            let entries = 1u64 << shift;
            let bytes = slot_bytes(entries, entries * 4);
            assert!(bytes >= last);
            last = bytes;
        }
    }
}
