//! Segment count and per-segment capacity planning.
//!
//! Entries spread over segments by hash, so per-segment load is
//! Poisson-distributed. The planner prefers many small segments (better
//! parallelism, shorter per-segment pauses, fewer dirty pages per update
//! when persisted) but over-provisions each segment to the configured load
//! percentile so that overflow tiering stays exceptional. The balance point
//! is found by trying the narrow 4-byte hash-lookup slot first and falling
//! back to the widest slot the platform supports.

use tracing::debug;

use stratamap_common::num::next_power_of_two;
use stratamap_common::{poisson, Result, StrataError};

use crate::constants::{
    MAX_SEGMENTS, MAX_SEGMENT_CHUNKS, MAX_SEGMENT_ENTRIES, OS_PAGE_SIZE, PAGE_EFFICIENCY_FACTOR,
};
use crate::hash_lookup;

/// Inputs of the segment planning step.
///
/// Sizing figures must be resolved before planning; the all-manual override
/// path bypasses this module entirely.
#[derive(Debug, Clone)]
pub(crate) struct SegmentParams {
    pub entries: u64,
    pub average_entry_size: f64,
    pub average_value_size: f64,
    pub average_chunks_per_entry: f64,
    pub non_tiered_segments_percentile: f64,
    /// User-configured floor; 0 when unset.
    pub user_min_segments: u64,
    pub actual_segments: Option<u64>,
    pub entries_per_segment_override: Option<u64>,
    pub actual_chunks_per_segment: Option<u64>,
    pub aligned_64bit_memory_operations_atomic: bool,
}

/// Output of the segment planning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentPlan {
    pub segments: u64,
    pub entries_per_segment: u64,
    pub chunks_per_segment: u64,
}

/// Plans `(segments, entriesPerSegment, chunksPerSegment)`.
pub(crate) fn plan(params: &SegmentParams) -> Result<SegmentPlan> {
    let segments = actual_segments(params)?;
    let entries_per_segment = entries_per_segment(params, segments)?;
    let chunks_per_segment = match params.actual_chunks_per_segment {
        Some(chunks) => chunks,
        None => chunks_for_entries(entries_per_segment, params.average_chunks_per_entry),
    };
    Ok(SegmentPlan {
        segments,
        entries_per_segment,
        chunks_per_segment,
    })
}

fn actual_segments(params: &SegmentParams) -> Result<u64> {
    if let Some(segments) = params.actual_segments {
        return Ok(segments);
    }
    if let Some(entries_per_segment) = params.entries_per_segment_override {
        let segments = segments_given_entries_per_segment(params, entries_per_segment)?;
        // Emitted segment counts are powers of two on every path.
        return Ok(next_power_of_two(segments, 1));
    }

    // A 4-byte slot keeps a small segment's lookup array and free list on
    // one memory page; accept it unless Poisson over-provisioning of that
    // many tiny segments would waste page space.
    if let Some(segments) = try_hash_lookup_slot_size(params, 4)? {
        return Ok(segments);
    }

    let widest_slot = if params.aligned_64bit_memory_operations_atomic {
        8
    } else {
        4
    };
    let max_entries_per_segment = find_max_entries_per_segment_to_fit_slot(
        widest_slot,
        params.average_chunks_per_entry,
    );
    let Some(max_entries_per_segment) = max_entries_per_segment else {
        return Err(too_many_entries(params, 0));
    };
    let segments = try_segments(params, max_entries_per_segment)?;
    if segments <= MAX_SEGMENTS {
        return Ok(segments);
    }
    Err(too_many_entries(params, segments))
}

fn too_many_entries(params: &SegmentParams, decided_segments: u64) -> StrataError {
    StrataError::TooManyEntries {
        message: format!(
            "max segments is {}; so many entries ({}) are configured, or average chunks \
             per entry is too high ({}), that the planner decided to use {} segments",
            MAX_SEGMENTS,
            params.entries,
            params.average_chunks_per_entry,
            decided_segments
        ),
    }
}

fn try_hash_lookup_slot_size(params: &SegmentParams, slot_bytes: u32) -> Result<Option<u64>> {
    let Some(entries_per_segment) =
        find_max_entries_per_segment_to_fit_slot(slot_bytes, params.average_chunks_per_entry)
    else {
        return Ok(None);
    };
    let entry_space_size = (entries_per_segment as f64 * params.average_entry_size).round() as u64;
    // Too-small segments over-provision disproportionally; with this floor a
    // segment loses at most ~20% of its pages to the Poisson tail.
    if entry_space_size < OS_PAGE_SIZE * PAGE_EFFICIENCY_FACTOR {
        debug!(
            entries_per_segment,
            entry_space_size, "segment entry space below page-efficiency floor; widening slots"
        );
        return Ok(None);
    }
    let segments = try_segments(params, entries_per_segment)?;
    if segments <= MAX_SEGMENTS {
        Ok(Some(segments))
    } else {
        Ok(None)
    }
}

/// Largest entries-per-segment whose hash-lookup slot fits `target_bytes`,
/// or `None` when even a single-entry segment does not fit.
fn find_max_entries_per_segment_to_fit_slot(
    target_bytes: u32,
    average_chunks_per_entry: f64,
) -> Option<u64> {
    let slot = |entries: u64| {
        hash_lookup::slot_bytes(entries, chunks_for_entries(entries, average_chunks_per_entry))
    };
    if slot(1) > target_bytes {
        return None;
    }
    let mut lo = 1u64;
    let mut hi = 1u64 << 62;
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if slot(mid) > target_bytes {
            hi = mid - 1;
        } else {
            lo = mid;
        }
    }
    Some(lo)
}

/// Segments needed so that a segment of `entries_per_segment` slots covers
/// its percentile share of the load, clamped to the configured floors and
/// rounded to a power of two.
fn try_segments(params: &SegmentParams, entries_per_segment: u64) -> Result<u64> {
    let segments = segments_given_entries_per_segment(params, entries_per_segment)?;
    Ok(next_power_of_two(segments.max(min_segments(params)), 1))
}

fn segments_given_entries_per_segment(
    params: &SegmentParams,
    entries_per_segment: u64,
) -> Result<u64> {
    let precision = 1.0 / params.average_chunks_per_entry;
    let mean = poisson::mean_by_cumulative_probability_and_value(
        params.non_tiered_segments_percentile,
        entries_per_segment,
        precision,
    )
    .ok_or_else(|| StrataError::TooManyEntries {
        message: format!(
            "no per-segment load satisfies percentile {} with {} entries per segment; \
             choose more segments",
            params.non_tiered_segments_percentile, entries_per_segment
        ),
    })?;
    let segments = (params.entries as f64 / mean) as u64 + 1;
    check_segments(segments)?;
    Ok(segments.max(params.user_min_segments))
}

fn check_segments(segments: u64) -> Result<()> {
    if segments == 0 || segments > MAX_SEGMENTS {
        return Err(StrataError::TooManyEntries {
            message: format!("max segments is {}, {} required", MAX_SEGMENTS, segments),
        });
    }
    Ok(())
}

fn entries_per_segment(params: &SegmentParams, segments: u64) -> Result<u64> {
    let entries_per_segment = match params.entries_per_segment_override {
        Some(entries_per_segment) => entries_per_segment,
        None => {
            let average_entries_per_segment = params.entries as f64 / segments as f64;
            poisson::inverse_cdf(
                average_entries_per_segment,
                params.non_tiered_segments_percentile,
            )
        }
    };
    if params.actual_chunks_per_segment.is_none() {
        let average_chunks_per_entry = params.average_chunks_per_entry;
        if entries_per_segment as f64 * average_chunks_per_entry > MAX_SEGMENT_CHUNKS as f64 {
            return Err(StrataError::TooManyChunks {
                max_chunks: MAX_SEGMENT_CHUNKS,
                entries_per_segment,
                average_chunks_per_entry,
            });
        }
    }
    if entries_per_segment > MAX_SEGMENT_ENTRIES {
        return Err(StrataError::TooManyEntries {
            message: format!(
                "should not be more than {} entries per segment, {} required",
                MAX_SEGMENT_ENTRIES, entries_per_segment
            ),
        });
    }
    Ok(entries_per_segment)
}

pub(crate) fn chunks_for_entries(entries_per_segment: u64, average_chunks_per_entry: f64) -> u64 {
    (entries_per_segment as f64 * average_chunks_per_entry).round() as u64
}

/// Floor on the segment count: the user's explicit minimum, or an estimate
/// from entry count and value size.
fn min_segments(params: &SegmentParams) -> u64 {
    estimate_segments(params).max(params.user_min_segments)
}

fn estimate_segments(params: &SegmentParams) -> u64 {
    next_power_of_two(params.entries / 32, 1).min(estimate_segments_by_size(params))
}

/// Huge values keep a segment lock held for the whole serialization of one
/// of them; scale the segment count up so concurrent writers rarely collide.
fn estimate_segments_by_size(params: &SegmentParams) -> u64 {
    let segments_for_entries = estimate_segments_for_entries(params.entries);
    let average_value_size = params.average_value_size;
    if average_value_size >= 1_000_000.0 {
        segments_for_entries * 16
    } else if average_value_size >= 100_000.0 {
        segments_for_entries * 8
    } else if average_value_size >= 10_000.0 {
        segments_for_entries * 4
    } else if average_value_size >= 1_000.0 {
        segments_for_entries * 2
    } else {
        segments_for_entries
    }
}

fn estimate_segments_for_entries(entries: u64) -> u64 {
    if entries > 200 << 20 {
        256
    } else if entries >= 1 << 20 {
        128
    } else if entries >= 128 << 10 {
        64
    } else if entries >= 16 << 10 {
        32
    } else if entries >= 4 << 10 {
        16
    } else if entries >= 1 << 10 {
        8
    } else {
        1
    }
}
