//! The immutable physical layout of a map.
//!
//! A [`Layout`] is the planner's output and the runtime's allocation recipe.
//! It is frozen at emit time, value-equal field by field, and stored in the
//! map's persistence header by the header codec, so a map file reopened with
//! the same builder recipe maps onto identical geometry.

use serde::{Deserialize, Serialize};

use stratamap_common::num::is_power_of_two;
use stratamap_common::{Result, StrataError};

use crate::constants::{MAX_CHUNK_SIZE, MAX_SEGMENTS, MAX_SEGMENT_CHUNKS, OS_PAGE_SIZE};
use crate::hash_lookup;

/// Physical layout of a segmented map.
///
/// All runtime invariants of the map are established here: the slot count is
/// a power of two, chunk indexes fit the slot value field, and tier overflow
/// is bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Number of segments; a power of two in [1, 2^30].
    pub segments: u64,
    /// Entries one segment accommodates without tiering.
    pub entries_per_segment: u64,
    /// Allocation granule of a segment's entry space, in bytes.
    pub chunk_size: u64,
    /// Chunks in one segment's entry space.
    pub chunks_per_segment: u64,
    /// Most chunks a single entry may occupy.
    pub max_chunks_per_entry: u64,
    /// Bits of a hash-lookup slot holding the chunk index.
    pub hash_lookup_value_bits: u32,
    /// Bits of a hash-lookup slot holding key hash bits.
    pub hash_lookup_key_bits: u32,
    /// Width of one hash-lookup slot: 4 or 8.
    pub hash_lookup_slot_bytes: u32,
    /// Bytes reserved for one segment header.
    pub segment_header_bytes: u64,
    /// Alignment of value payloads within entries; a power of two.
    pub value_alignment: u64,
    /// Upper bound on bytes lost per entry to value alignment.
    pub worst_alignment_padding: u64,
    /// Offset of the first entry within a segment's entry space.
    pub segment_inner_offset: u64,
    /// Overflow tiers the map may allocate beyond the primary segments.
    pub max_extra_tiers: u64,
    /// Whether entries carry a stored checksum.
    pub checksums: bool,
    /// Whether entries carry replication metadata.
    pub replicated: bool,
}

impl Layout {
    /// Validates every context-free invariant of the record.
    ///
    /// Run on every emitted layout and again after decoding one from a
    /// persistence header.
    pub fn validate(&self) -> Result<()> {
        if !is_power_of_two(self.segments) || self.segments > MAX_SEGMENTS {
            return Err(invalid(
                "segments",
                format!("must be a power of two in [1, {}], got {}", MAX_SEGMENTS, self.segments),
            ));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(invalid(
                "chunkSize",
                format!("must be in [1, {}], got {}", MAX_CHUNK_SIZE, self.chunk_size),
            ));
        }
        if self.chunks_per_segment == 0 || self.chunks_per_segment > MAX_SEGMENT_CHUNKS {
            return Err(invalid(
                "chunksPerSegment",
                format!(
                    "must be in [1, {}], got {}",
                    MAX_SEGMENT_CHUNKS, self.chunks_per_segment
                ),
            ));
        }
        let total_chunks = self.chunks_per_segment as u128 * self.segments as u128;
        if total_chunks > i64::MAX as u128 {
            return Err(invalid(
                "chunksPerSegment",
                format!(
                    "{} chunks x {} segments does not fit a signed 64-bit total",
                    self.chunks_per_segment, self.segments
                ),
            ));
        }
        if self.entries_per_segment > self.chunks_per_segment {
            return Err(invalid(
                "entriesPerSegment",
                format!(
                    "{} entries per segment exceed {} chunks per segment",
                    self.entries_per_segment, self.chunks_per_segment
                ),
            ));
        }
        if self.hash_lookup_slot_bytes != 4 && self.hash_lookup_slot_bytes != 8 {
            return Err(invalid(
                "hashLookupSlotBytes",
                format!("must be 4 or 8, got {}", self.hash_lookup_slot_bytes),
            ));
        }
        if self.hash_lookup_value_bits + self.hash_lookup_key_bits > 8 * self.hash_lookup_slot_bytes
        {
            return Err(invalid(
                "hashLookupSlotBytes",
                format!(
                    "{} value bits + {} key bits overflow a {}-byte slot",
                    self.hash_lookup_value_bits,
                    self.hash_lookup_key_bits,
                    self.hash_lookup_slot_bytes
                ),
            ));
        }
        if self.max_chunks_per_entry == 0 || self.max_chunks_per_entry > self.chunks_per_segment {
            return Err(invalid(
                "maxChunksPerEntry",
                format!(
                    "must be in [1, {}], got {}",
                    self.chunks_per_segment, self.max_chunks_per_entry
                ),
            ));
        }
        if !is_power_of_two(self.value_alignment) {
            return Err(invalid(
                "valueAlignment",
                format!("must be a power of two, got {}", self.value_alignment),
            ));
        }
        if self.worst_alignment_padding >= self.value_alignment {
            return Err(invalid(
                "worstAlignmentPadding",
                format!(
                    "{} does not stay below the value alignment {}",
                    self.worst_alignment_padding, self.value_alignment
                ),
            ));
        }
        if !matches!(self.segment_header_bytes, 32 | 64 | 128 | 192) {
            return Err(invalid(
                "segmentHeaderBytes",
                format!("must be 32, 64, 128 or 192, got {}", self.segment_header_bytes),
            ));
        }
        Ok(())
    }

    /// Slots in one segment's hash-lookup array; a power of two.
    pub fn hash_lookup_capacity(&self) -> u64 {
        hash_lookup::capacity_for(self.entries_per_segment)
    }

    /// Bytes of one segment's hash-lookup array.
    pub fn hash_lookup_bytes_per_segment(&self) -> u64 {
        self.hash_lookup_capacity() * self.hash_lookup_slot_bytes as u64
    }

    /// Bytes of one segment's entry space, inner offset included.
    pub fn entry_space_bytes_per_segment(&self) -> u64 {
        self.segment_inner_offset + self.chunks_per_segment * self.chunk_size
    }

    /// Bytes of one fully laid out segment.
    pub fn segment_bytes(&self) -> u64 {
        self.segment_header_bytes
            + self.hash_lookup_bytes_per_segment()
            + self.entry_space_bytes_per_segment()
    }

    /// Bytes of the segment area before any overflow tier is allocated.
    ///
    /// The global map header is owned by the persistence layer and comes on
    /// top of this.
    pub fn bytes_without_tiers(&self) -> u64 {
        self.segments * self.segment_bytes()
    }
}

fn invalid(option: &'static str, message: String) -> StrataError {
    StrataError::InvalidConfig { option, message }
}

/// Bytes reserved per segment header.
///
/// Generous headers keep concurrently locked segment headers on separate
/// cache lines (with guard lines around them) while the total header area
/// stays within a few pages; with many segments false sharing matters less
/// than footprint.
pub(crate) fn segment_header_bytes(segments: u64) -> u64 {
    if segments * 192 < 2 * OS_PAGE_SIZE {
        // <= 42 segments: a cache line per header plus one on either side.
        192
    } else if segments * 128 < 3 * OS_PAGE_SIZE {
        // up to ~96 segments
        128
    } else if segments <= 16 * 1024 {
        64
    } else {
        32
    }
}

/// Overflow tiers the map may allocate beyond the primary segments.
///
/// The bloat factor is a scale, so subtract the primary allocation before
/// budgeting extra tiers; one extra tier per segment is granted on top to
/// absorb slight misconfiguration and uneven hash distribution.
pub(crate) fn max_extra_tiers(
    allow_segment_tiering: bool,
    max_bloat_factor: f64,
    segments: u64,
) -> u64 {
    if !allow_segment_tiering {
        return 0;
    }
    ((max_bloat_factor - 1.0) * segments as f64).floor() as u64 + segments
}
