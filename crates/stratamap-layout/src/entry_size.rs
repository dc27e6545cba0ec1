//! Average entry footprint and worst-case alignment padding.
//!
//! A stored entry is: key length prefix, key bytes, replication bytes (when
//! replicated), checksum bytes (when checksummed), value length prefix,
//! alignment padding, value bytes. The planner works with the average
//! footprint and budgets the worst padding the runtime allocator can incur.

use stratamap_common::num::{align_up, gcd};

use crate::chunks;
use crate::constants::{ADDITIONAL_ENTRY_BYTES, CHECKSUM_STORED_BYTES};

/// Average entry footprint plus the worst-case bytes lost to value alignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntrySizeInfo {
    /// Average serialized entry size in bytes, padding included.
    pub average_entry_size: f64,
    /// Upper bound on per-entry padding; always below the value alignment.
    pub worst_alignment: u64,
}

/// Resolved sizing facts of both map sides, detached from the builder.
///
/// Everything the footprint and chunk computations consume lives here, so
/// they stay pure functions of a snapshot.
#[derive(Debug, Clone)]
pub(crate) struct EntryShape {
    pub average_key_size: f64,
    pub average_key_storing_length: f64,
    pub average_value_size: f64,
    pub average_value_storing_length: f64,
    pub constant_keys: bool,
    /// `Some` iff values are constant-sized.
    pub constant_value_size: Option<u64>,
    pub constant_value_storing_length: bool,
    pub replicated: bool,
    pub checksums: bool,
    pub alignment: u64,
    pub actual_chunk_size: Option<u64>,
}

impl EntryShape {
    /// True when both keys and values are constant-sized.
    pub fn constant_entries(&self) -> bool {
        self.constant_keys && self.constant_value_size.is_some()
    }

    /// Computes the average footprint and the worst alignment padding.
    pub fn entry_size_info(&self) -> EntrySizeInfo {
        let mut size = self.average_key_storing_length + self.average_key_size;
        if self.replicated {
            size += ADDITIONAL_ENTRY_BYTES as f64;
        }
        if self.checksums {
            size += CHECKSUM_STORED_BYTES as f64;
        }
        size += self.average_value_storing_length;

        let worst_alignment = if self.alignment_depends_on_value_size() {
            let size_before_alignment = size.round() as u64;
            match self.constant_value_size {
                // The first entry is deliberately misaligned (see
                // `segment_entry_space_inner_offset`), so every entry loses
                // exactly the padding of the first.
                Some(constant_value_size) => {
                    let total_data_size = size_before_alignment + constant_value_size;
                    align_up(total_data_size, self.alignment) - total_data_size
                }
                None => match self.actual_chunk_size {
                    Some(chunk_size) => worst_alignment_assuming_chunk_size(
                        size_before_alignment,
                        chunk_size,
                        self.alignment,
                    ),
                    None => {
                        let chunk_size = 8;
                        let worst = worst_alignment_assuming_chunk_size(
                            size_before_alignment,
                            chunk_size,
                            self.alignment,
                        );
                        let max_chunks =
                            chunks::max_default_chunks_per_average_entry(self.replicated);
                        if size + worst as f64 + self.average_value_size
                            >= (max_chunks * chunk_size) as f64
                        {
                            worst
                        } else {
                            // The chunk planner will settle on a 4-byte
                            // chunk for an entry this small.
                            worst_alignment_assuming_chunk_size(
                                size_before_alignment,
                                4,
                                self.alignment,
                            )
                        }
                    }
                },
            }
        } else {
            worst_alignment_without_value_size(self.alignment)
        };

        size += worst_alignment as f64;
        size += self.average_value_size;
        EntrySizeInfo {
            average_entry_size: size,
            worst_alignment,
        }
    }

    /// Offset of the first entry within a segment's entry space.
    ///
    /// When the constant entry size is not a multiple of the alignment, the
    /// first chunk is misaligned by the value size so that the value of
    /// every subsequent entry lands on the same aligned residue.
    pub fn segment_entry_space_inner_offset(&self) -> u64 {
        if !self.constant_entries() {
            return 0;
        }
        match self.constant_value_size {
            Some(value_size) => value_size % self.alignment,
            None => 0,
        }
    }

    /// Whether the worst padding can be pinned down from the value size:
    /// keys must be constant-sized and the value length prefix must occupy
    /// a fixed number of bytes.
    fn alignment_depends_on_value_size(&self) -> bool {
        self.alignment != 1 && self.constant_keys && self.constant_value_storing_length
    }
}

/// Worst padding between entry head and value payload for a known chunk
/// size.
///
/// Entry starts are predictable only modulo gcd(alignment, chunk size); walk
/// the residues from the first entry's padding and take the worst.
pub(crate) fn worst_alignment_assuming_chunk_size(
    size_before_alignment: u64,
    chunk_size: u64,
    alignment: u64,
) -> u64 {
    let first_alignment = align_up(size_before_alignment, alignment) - size_before_alignment;
    let step = gcd(alignment, chunk_size);
    if step == alignment {
        return first_alignment;
    }
    let mut worst = first_alignment;
    while worst + step < alignment {
        worst += step;
    }
    worst
}

/// Worst padding when the entry head size varies: all of the alignment can
/// be lost.
pub(crate) fn worst_alignment_without_value_size(alignment: u64) -> u64 {
    alignment - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variable_shape(key: f64, value: f64) -> EntryShape {
        EntryShape {
            average_key_size: key,
            average_key_storing_length: 1.0,
            average_value_size: value,
            average_value_storing_length: 1.0,
            constant_keys: false,
            constant_value_size: None,
            constant_value_storing_length: false,
            replicated: false,
            checksums: false,
            alignment: 1,
            actual_chunk_size: None,
        }
    }

    fn constant_shape(key: u64, value: u64, alignment: u64) -> EntryShape {
        EntryShape {
            average_key_size: key as f64,
            average_key_storing_length: 0.0,
            average_value_size: value as f64,
            average_value_storing_length: 0.0,
            constant_keys: true,
            constant_value_size: Some(value),
            constant_value_storing_length: true,
            replicated: false,
            checksums: false,
            alignment,
            actual_chunk_size: None,
        }
    }

    #[test]
    fn test_variable_entry_without_alignment() {
        let info = variable_shape(8.0, 8.0).entry_size_info();
        // prefix + key + prefix + value
        assert_eq!(info.average_entry_size, 18.0);
        assert_eq!(info.worst_alignment, 0);
    }

    #[test]
    fn test_variable_entry_with_alignment_assumes_worst() {
        let mut shape = variable_shape(8.0, 8.0);
        shape.alignment = 8;
        let info = shape.entry_size_info();
        assert_eq!(info.worst_alignment, 7);
        assert_eq!(info.average_entry_size, 25.0);
    }

    #[test]
    fn test_replication_and_checksum_bytes() {
        let mut shape = variable_shape(8.0, 8.0);
        shape.replicated = true;
        shape.checksums = true;
        let info = shape.entry_size_info();
        assert_eq!(
            info.average_entry_size,
            18.0 + (ADDITIONAL_ENTRY_BYTES + CHECKSUM_STORED_BYTES) as f64
        );
    }

    #[test]
    fn test_constant_entry_padding_from_total_size() {
        // 4 + 4 = 8 bytes, aligned to 4: no padding.
        let info = constant_shape(4, 4, 4).entry_size_info();
        assert_eq!(info.worst_alignment, 0);
        assert_eq!(info.average_entry_size, 8.0);

        // 3 + 3 = 6 bytes, aligned to 4: two bytes lost per entry.
        let info = constant_shape(3, 3, 4).entry_size_info();
        assert_eq!(info.worst_alignment, 2);
        assert_eq!(info.average_entry_size, 8.0);
    }

    #[test]
    fn test_inner_offset_misaligns_first_entry() {
        assert_eq!(constant_shape(4, 4, 4).segment_entry_space_inner_offset(), 0);
        assert_eq!(constant_shape(3, 3, 4).segment_entry_space_inner_offset(), 3);
        // Variable entries always start at offset zero.
        assert_eq!(variable_shape(8.0, 8.0).segment_entry_space_inner_offset(), 0);
    }

    #[test]
    fn test_constant_keys_variable_values_probe_chunk_sizes() {
        // Constant 8-byte keys, fixed 4-byte value length prefix, variable
        // values averaging 20 bytes, alignment 8. Head = 8 + 4 = 12.
        let shape = EntryShape {
            average_key_size: 8.0,
            average_key_storing_length: 0.0,
            average_value_size: 20.0,
            average_value_storing_length: 4.0,
            constant_keys: true,
            constant_value_size: None,
            constant_value_storing_length: true,
            replicated: false,
            checksums: false,
            alignment: 8,
            actual_chunk_size: None,
        };
        let info = shape.entry_size_info();
        // Chunk size 8 gives worst padding 4; the entry (36 bytes) fits in
        // eight 8-byte chunks, so the 4-byte chunk estimate is used; gcd(8, 4)
        // = 4 steps the padding to 4 as well.
        assert_eq!(info.worst_alignment, 4);
        assert_eq!(info.average_entry_size, 36.0);
    }

    #[test]
    fn test_chunk_size_override_drives_padding() {
        // Constant 4-byte keys, variable values behind a fixed-length
        // prefix, chunk size pinned to 6.
        let shape = EntryShape {
            actual_chunk_size: Some(6),
            constant_value_size: None,
            average_value_size: 10.0,
            ..constant_shape(4, 0, 4)
        };
        let info = shape.entry_size_info();
        // Head of 4 bytes, chunk 6, alignment 4: first entry pads 0, the
        // gcd-2 residue walk ends at 2.
        assert_eq!(info.worst_alignment, 2);
    }

    #[test]
    fn test_worst_alignment_assuming_chunk_size() {
        // gcd equals alignment: padding of the first entry.
        assert_eq!(worst_alignment_assuming_chunk_size(6, 8, 4), 2);
        // gcd 2 < alignment 4: walk residues.
        assert_eq!(worst_alignment_assuming_chunk_size(6, 6, 4), 2);
        assert_eq!(worst_alignment_assuming_chunk_size(5, 6, 4), 3);
        assert_eq!(worst_alignment_assuming_chunk_size(4, 2, 8), 6);
        // Always strictly below the alignment.
        for size in 0..32u64 {
            for chunk in 1..24u64 {
                for align in [1u64, 2, 4, 8, 16] {
                    assert!(worst_alignment_assuming_chunk_size(size, chunk, align) < align);
                }
            }
        }
    }

    #[test]
    fn test_worst_alignment_without_value_size() {
        assert_eq!(worst_alignment_without_value_size(1), 0);
        assert_eq!(worst_alignment_without_value_size(8), 7);
    }
}
