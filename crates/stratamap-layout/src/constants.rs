//! Planner limits and entry-footprint constants.

// Hard limits of the segmented layout

/// Maximum number of segments. Segment indexes are carried in 32-bit fields
/// throughout the runtime, and nobody has ever needed a billion locks.
pub const MAX_SEGMENTS: u64 = 1 << 30;

/// Maximum chunks addressable within one segment: chunk indexes must fit the
/// hash-lookup slot value field.
pub const MAX_SEGMENT_CHUNKS: u64 = 1 << 32;

/// Maximum entries in one segment.
pub const MAX_SEGMENT_ENTRIES: u64 = 1 << 32;

/// Maximum chunk size in bytes (1 GB).
pub const MAX_CHUNK_SIZE: u64 = 1 << 30;

// Defaults

/// Default upper bound on the logical entry count (2^20).
pub const DEFAULT_ENTRIES: u64 = 1 << 20;

/// Default percentile of the per-segment Poisson load that a segment must
/// accommodate without spilling into an overflow tier.
pub const DEFAULT_NON_TIERED_SEGMENTS_PERCENTILE: f64 = 0.99999;

// Entry footprint

/// Bytes added to every entry of a replicated map: an 8-byte origin
/// timestamp, a 1-byte node identifier, and a 1-byte entry state.
pub const ADDITIONAL_ENTRY_BYTES: u64 = 10;

/// Bytes of the stored per-entry checksum.
pub const CHECKSUM_STORED_BYTES: u64 = 4;

// Page-level tuning

/// Assumed OS page size. Only the page-efficiency guard and the segment
/// header sizing consult it; tune if targeting huge-page-only deployments.
pub const OS_PAGE_SIZE: u64 = 4096;

/// A 4-byte hash-lookup slot is only accepted when a segment's entry space
/// covers at least this many pages, so Poisson over-provisioning of many
/// tiny segments cannot waste more than ~20% of memory (10% on average).
pub const PAGE_EFFICIENCY_FACTOR: u64 = 5;
