//! The map builder: configuration surface and layout emission.
//!
//! A [`MapBuilder`] collects the user's sizing intent, then `emit()` runs a
//! single resolution pass (sample measurement, conflict checks) followed by
//! the pure planning pipeline and the layout invariant checks. The builder
//! is mutable until `emit()`; afterwards every mutator fails. Clones are
//! cheap and always start mutable, so one recipe can produce many identical
//! maps and be shared across threads clone-per-thread.

use tracing::debug;

use stratamap_common::num::is_power_of_two;
use stratamap_common::{Result, StrataError};

use crate::chunks;
use crate::constants::{DEFAULT_ENTRIES, DEFAULT_NON_TIERED_SEGMENTS_PERCENTILE, MAX_SEGMENTS};
use crate::entry_size::{self, EntryShape};
use crate::hash_lookup;
use crate::layout::{self, Layout};
use crate::marshaller::SerializationOracle;
use crate::segments::{self, SegmentParams, SegmentPlan};

/// Per-entry checksum policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumEntries {
    /// Always checksum entries.
    Yes,
    /// Never checksum entries.
    No,
    /// Checksum iff the map will be backed by a file (the default).
    IfPersisted,
}

/// One of three mutually exclusive ways to size a map side; setting one
/// clears the others.
#[derive(Debug, Clone)]
enum SizeSpec<T> {
    Unset,
    AverageSize(f64),
    AverageSample(T),
    ConstantSample(T),
}

/// Builder of segmented-map layouts.
///
/// ```
/// use stratamap_layout::MapBuilder;
/// use stratamap_layout::marshaller::SerializationOracle;
///
/// # fn main() -> stratamap_common::Result<()> {
/// let mut builder = MapBuilder::of(
///     SerializationOracle::bytes(),
///     SerializationOracle::bytes(),
/// );
/// builder
///     .entries(500_000)?
///     .average_key_size(16.0)?
///     .average_value_size(100.0)?;
/// let layout = builder.emit()?;
/// assert!(layout.segments.is_power_of_two());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MapBuilder<K, V> {
    key_oracle: SerializationOracle<K>,
    value_oracle: SerializationOracle<V>,
    key_sizing: SizeSpec<K>,
    value_sizing: SizeSpec<V>,
    entries: u64,
    min_segments: u64,
    actual_segments: Option<u64>,
    entries_per_segment: Option<u64>,
    actual_chunks_per_segment: Option<u64>,
    actual_chunk_size: Option<u64>,
    max_chunks_per_entry: Option<u64>,
    value_alignment: u64,
    replicated: bool,
    persisted: bool,
    checksum_entries: ChecksumEntries,
    max_bloat_factor: f64,
    allow_segment_tiering: bool,
    non_tiered_segments_percentile: f64,
    aligned_64bit_memory_operations_atomic: bool,
    frozen: bool,
}

/// Sizing facts of one side after the resolution pass.
struct ResolvedSide {
    average_size: Option<f64>,
    constant_size: Option<u64>,
}

impl<K, V> MapBuilder<K, V> {
    /// Creates a builder over the given key and value marshaller oracles.
    pub fn of(key_oracle: SerializationOracle<K>, value_oracle: SerializationOracle<V>) -> Self {
        Self {
            key_oracle,
            value_oracle,
            key_sizing: SizeSpec::Unset,
            value_sizing: SizeSpec::Unset,
            entries: DEFAULT_ENTRIES,
            min_segments: 0,
            actual_segments: None,
            entries_per_segment: None,
            actual_chunks_per_segment: None,
            actual_chunk_size: None,
            max_chunks_per_entry: None,
            value_alignment: 1,
            replicated: false,
            persisted: false,
            checksum_entries: ChecksumEntries::IfPersisted,
            max_bloat_factor: 1.0,
            allow_segment_tiering: true,
            non_tiered_segments_percentile: DEFAULT_NON_TIERED_SEGMENTS_PERCENTILE,
            aligned_64bit_memory_operations_atomic: cfg!(target_pointer_width = "64"),
            frozen: false,
        }
    }

    /// Upper bound on the logical entry count of the maps built from this
    /// layout. The map does not resize; plan for the maximum.
    pub fn entries(&mut self, entries: u64) -> Result<&mut Self> {
        self.check_mutable()?;
        if entries == 0 {
            return Err(invalid("entries", format!("should be positive, {} given", entries)));
        }
        self.entries = entries;
        Ok(self)
    }

    /// Average serialized key size in bytes.
    ///
    /// Clears any previous average-key or constant-key-size configuration.
    pub fn average_key_size(&mut self, average_key_size: f64) -> Result<&mut Self> {
        self.check_mutable()?;
        self.check_not_statically_known(Role::Key)?;
        check_average_size("averageKeySize", average_key_size)?;
        self.key_sizing = SizeSpec::AverageSize(average_key_size);
        Ok(self)
    }

    /// An average key by serialized footprint; the oracle measures it.
    pub fn average_key(&mut self, average_key: K) -> Result<&mut Self> {
        self.check_mutable()?;
        self.check_not_statically_known(Role::Key)?;
        self.key_sizing = SizeSpec::AverageSample(average_key);
        Ok(self)
    }

    /// Asserts that every key serializes to the same size as this sample.
    pub fn constant_key_size_by_sample(&mut self, sample_key: K) -> Result<&mut Self> {
        self.check_mutable()?;
        self.check_not_statically_known(Role::Key)?;
        self.key_sizing = SizeSpec::ConstantSample(sample_key);
        Ok(self)
    }

    /// Average serialized value size in bytes.
    pub fn average_value_size(&mut self, average_value_size: f64) -> Result<&mut Self> {
        self.check_mutable()?;
        self.check_not_statically_known(Role::Value)?;
        check_average_size("averageValueSize", average_value_size)?;
        self.value_sizing = SizeSpec::AverageSize(average_value_size);
        Ok(self)
    }

    /// An average value by serialized footprint; the oracle measures it.
    pub fn average_value(&mut self, average_value: V) -> Result<&mut Self> {
        self.check_mutable()?;
        self.check_not_statically_known(Role::Value)?;
        self.value_sizing = SizeSpec::AverageSample(average_value);
        Ok(self)
    }

    /// Asserts that every value serializes to the same size as this sample.
    pub fn constant_value_size_by_sample(&mut self, sample_value: V) -> Result<&mut Self> {
        self.check_mutable()?;
        self.check_not_statically_known(Role::Value)?;
        self.value_sizing = SizeSpec::ConstantSample(sample_value);
        Ok(self)
    }

    /// Overrides the computed chunk size.
    ///
    /// Entries are allocated in whole chunks, so a hand-picked chunk size
    /// can cut internal fragmentation when the entry size distribution is
    /// known well.
    pub fn actual_chunk_size(&mut self, actual_chunk_size: u64) -> Result<&mut Self> {
        self.check_mutable()?;
        if self.configured_constant_keys() && self.configured_constant_values() {
            return Err(StrataError::ConflictingConfig(
                "sizes of both keys and values are constant, so the chunk size must not be \
                 configured manually"
                    .to_string(),
            ));
        }
        if actual_chunk_size == 0 {
            return Err(invalid("actualChunkSize", "chunk size must be positive".to_string()));
        }
        self.actual_chunk_size = Some(actual_chunk_size);
        Ok(self)
    }

    /// Overrides the computed entries per segment.
    pub fn entries_per_segment(&mut self, entries_per_segment: u64) -> Result<&mut Self> {
        self.check_mutable()?;
        if entries_per_segment == 0 {
            return Err(invalid(
                "entriesPerSegment",
                format!("should be positive, {} given", entries_per_segment),
            ));
        }
        self.entries_per_segment = Some(entries_per_segment);
        Ok(self)
    }

    /// Overrides the computed chunks per segment.
    ///
    /// Only meaningful when the other low-level configurations are manual
    /// too; `emit()` rejects it otherwise.
    pub fn actual_chunks_per_segment(&mut self, actual_chunks_per_segment: u64) -> Result<&mut Self> {
        self.check_mutable()?;
        if actual_chunks_per_segment == 0 {
            return Err(invalid(
                "actualChunksPerSegment",
                format!("should be positive, {} given", actual_chunks_per_segment),
            ));
        }
        self.actual_chunks_per_segment = Some(actual_chunks_per_segment);
        Ok(self)
    }

    /// Overrides the computed segment count; must be a power of two.
    pub fn actual_segments(&mut self, actual_segments: u64) -> Result<&mut Self> {
        self.check_mutable()?;
        check_segments_range("actualSegments", actual_segments)?;
        if !is_power_of_two(actual_segments) {
            return Err(invalid(
                "actualSegments",
                format!("should be a power of two, {} given", actual_segments),
            ));
        }
        self.actual_segments = Some(actual_segments);
        Ok(self)
    }

    /// Floor on the computed segment count.
    pub fn min_segments(&mut self, min_segments: u64) -> Result<&mut Self> {
        self.check_mutable()?;
        check_segments_range("minSegments", min_segments)?;
        self.min_segments = min_segments;
        Ok(self)
    }

    /// Caps how many chunks a single entry may occupy.
    pub fn max_chunks_per_entry(&mut self, max_chunks_per_entry: u64) -> Result<&mut Self> {
        self.check_mutable()?;
        if max_chunks_per_entry == 0 {
            return Err(invalid(
                "maxChunksPerEntry",
                format!("should be >= 1, {} given", max_chunks_per_entry),
            ));
        }
        self.max_chunks_per_entry = Some(max_chunks_per_entry);
        Ok(self)
    }

    /// Alignment of value payloads within entries; a power of two.
    ///
    /// Worth configuring when values are updated in place intensively: a
    /// value straddling cache lines makes atomic field access expensive.
    pub fn value_alignment(&mut self, alignment: u64) -> Result<&mut Self> {
        self.check_mutable()?;
        if alignment == 0 || !is_power_of_two(alignment) {
            return Err(invalid(
                "valueAlignment",
                format!("should be a positive power of two, {} given", alignment),
            ));
        }
        self.value_alignment = alignment;
        Ok(self)
    }

    /// Reserves replication metadata space in every entry.
    pub fn replicated(&mut self, replicated: bool) -> Result<&mut Self> {
        self.check_mutable()?;
        self.replicated = replicated;
        Ok(self)
    }

    /// Declares whether the map will be backed by a file; consumed only by
    /// the `if-persisted` checksum policy.
    pub fn persisted(&mut self, persisted: bool) -> Result<&mut Self> {
        self.check_mutable()?;
        self.persisted = persisted;
        Ok(self)
    }

    /// Per-entry checksum policy.
    pub fn checksum_entries(&mut self, checksum_entries: ChecksumEntries) -> Result<&mut Self> {
        self.check_mutable()?;
        self.checksum_entries = checksum_entries;
        Ok(self)
    }

    /// Bounds total memory expansion through overflow tiers, as a multiple
    /// of the nominal segment allocation. In [1, 1000].
    pub fn max_bloat_factor(&mut self, max_bloat_factor: f64) -> Result<&mut Self> {
        self.check_mutable()?;
        if !max_bloat_factor.is_finite() || !(1.0..=1000.0).contains(&max_bloat_factor) {
            return Err(invalid(
                "maxBloatFactor",
                format!("should be in [1.0, 1000.0], {} given", max_bloat_factor),
            ));
        }
        self.max_bloat_factor = max_bloat_factor;
        Ok(self)
    }

    /// Enables or disables overflow tiers entirely.
    pub fn allow_segment_tiering(&mut self, allow_segment_tiering: bool) -> Result<&mut Self> {
        self.check_mutable()?;
        self.allow_segment_tiering = allow_segment_tiering;
        Ok(self)
    }

    /// Percentile of the per-segment Poisson load a segment must accommodate
    /// without tiering. In (0.5, 1.0) exclusive.
    pub fn non_tiered_segments_percentile(&mut self, percentile: f64) -> Result<&mut Self> {
        self.check_mutable()?;
        if !(percentile > 0.5 && percentile < 1.0) {
            return Err(invalid(
                "nonTieredSegmentsPercentile",
                format!("should be in (0.5, 1.0), {} given", percentile),
            ));
        }
        self.non_tiered_segments_percentile = percentile;
        Ok(self)
    }

    /// Declares whether aligned 64-bit memory operations are atomic on the
    /// target platform; governs the widest hash-lookup slot.
    pub fn aligned_64bit_memory_operations_atomic(&mut self, atomic: bool) -> Result<&mut Self> {
        self.check_mutable()?;
        self.aligned_64bit_memory_operations_atomic = atomic;
        Ok(self)
    }

    /// Plans the layout and freezes the builder.
    ///
    /// Planning is deterministic in the configuration and the platform
    /// flags; repeating `emit()` returns an equal layout. After the first
    /// call every mutator fails with `AlreadyFrozen`.
    pub fn emit(&mut self) -> Result<Layout> {
        self.state_checks()?;

        let checksums = match self.checksum_entries {
            ChecksumEntries::Yes => true,
            ChecksumEntries::No => false,
            ChecksumEntries::IfPersisted => self.persisted,
        };
        let key = resolve_side(&self.key_oracle, &self.key_sizing, "key")?;
        let value = resolve_side(&self.value_oracle, &self.value_sizing, "value")?;

        let constant_entries = key.constant_size.is_some() && value.constant_size.is_some();
        if constant_entries && self.actual_chunk_size.is_some() {
            return Err(StrataError::ConflictingConfig(
                "sizes of both keys and values are constant, so the chunk size must not be \
                 configured manually"
                    .to_string(),
            ));
        }

        let core = match (key.average_size, value.average_size) {
            (Some(average_key_size), Some(average_value_size)) => self.plan_from_sizes(
                average_key_size,
                average_value_size,
                &key,
                &value,
                checksums,
            )?,
            (None, _) => self.plan_all_manual("key")?,
            (_, None) => self.plan_all_manual("value")?,
        };

        let value_bits = hash_lookup::value_bits(core.plan.chunks_per_segment);
        let key_bits = hash_lookup::key_bits(core.plan.entries_per_segment, value_bits);
        let slot_bytes = hash_lookup::entry_size(key_bits, value_bits);
        if slot_bytes == 8 && !self.aligned_64bit_memory_operations_atomic {
            return Err(StrataError::ConflictingConfig(format!(
                "{} entries and {} chunks per segment demand 8-byte hash-lookup slots, which \
                 require atomic aligned 64-bit memory operations",
                core.plan.entries_per_segment, core.plan.chunks_per_segment
            )));
        }

        let max_chunks_per_entry = if core.constant_entries {
            1
        } else {
            let cap = core.plan.chunks_per_segment.min(i32::MAX as u64);
            match self.max_chunks_per_entry {
                Some(user_cap) => user_cap.min(cap),
                None => cap,
            }
        };

        let layout = Layout {
            segments: core.plan.segments,
            entries_per_segment: core.plan.entries_per_segment,
            chunk_size: core.chunk_size,
            chunks_per_segment: core.plan.chunks_per_segment,
            max_chunks_per_entry,
            hash_lookup_value_bits: value_bits,
            hash_lookup_key_bits: key_bits,
            hash_lookup_slot_bytes: slot_bytes,
            segment_header_bytes: layout::segment_header_bytes(core.plan.segments),
            value_alignment: self.value_alignment,
            worst_alignment_padding: core.worst_alignment,
            segment_inner_offset: core.inner_offset,
            max_extra_tiers: layout::max_extra_tiers(
                self.allow_segment_tiering,
                self.max_bloat_factor,
                core.plan.segments,
            ),
            checksums,
            replicated: self.replicated,
        };
        if self.actual_chunk_size.is_none()
            && !core.constant_entries
            && !is_power_of_two(layout.chunk_size)
        {
            return Err(invalid(
                "chunkSize",
                format!("computed chunk size {} is not a power of two", layout.chunk_size),
            ));
        }
        layout.validate()?;
        debug!(
            segments = layout.segments,
            entries_per_segment = layout.entries_per_segment,
            chunk_size = layout.chunk_size,
            slot_bytes = layout.hash_lookup_slot_bytes,
            "planned map layout"
        );
        self.frozen = true;
        Ok(layout)
    }

    fn plan_from_sizes(
        &self,
        average_key_size: f64,
        average_value_size: f64,
        key: &ResolvedSide,
        value: &ResolvedSide,
        checksums: bool,
    ) -> Result<PlannedCore> {
        let shape = EntryShape {
            average_key_size,
            average_key_storing_length: if key.constant_size.is_some() {
                0.0
            } else {
                self.key_oracle.average_storing_length(average_key_size)
            },
            average_value_size,
            average_value_storing_length: if value.constant_size.is_some() {
                0.0
            } else {
                self.value_oracle.average_storing_length(average_value_size)
            },
            constant_keys: key.constant_size.is_some(),
            constant_value_size: value.constant_size,
            constant_value_storing_length: value.constant_size.is_some()
                || self.value_oracle.size_marshaller().constant_storing_length(),
            replicated: self.replicated,
            checksums,
            alignment: self.value_alignment,
            actual_chunk_size: self.actual_chunk_size,
        };
        let info = shape.entry_size_info();
        let constant_entries = shape.constant_entries();
        let chunk_size = chunks::choose_chunk_size(
            self.actual_chunk_size,
            constant_entries,
            info.average_entry_size,
            self.replicated,
        );
        let average_chunks_per_entry =
            chunks::average_chunks_per_entry(info.average_entry_size, chunk_size, constant_entries);
        let plan = segments::plan(&SegmentParams {
            entries: self.entries,
            average_entry_size: info.average_entry_size,
            average_value_size,
            average_chunks_per_entry,
            non_tiered_segments_percentile: self.non_tiered_segments_percentile,
            user_min_segments: self.min_segments,
            actual_segments: self.actual_segments,
            entries_per_segment_override: self.entries_per_segment,
            actual_chunks_per_segment: self.actual_chunks_per_segment,
            aligned_64bit_memory_operations_atomic: self.aligned_64bit_memory_operations_atomic,
        })?;
        Ok(PlannedCore {
            plan,
            chunk_size,
            worst_alignment: info.worst_alignment,
            inner_offset: shape.segment_entry_space_inner_offset(),
            constant_entries,
        })
    }

    /// Escape hatch: with all four low-level overrides manual, key/value
    /// sizes need not be determinable at all.
    fn plan_all_manual(&self, missing_role: &'static str) -> Result<PlannedCore> {
        let (
            Some(segments),
            Some(entries_per_segment),
            Some(chunks_per_segment),
            Some(chunk_size),
        ) = (
            self.actual_segments,
            self.entries_per_segment,
            self.actual_chunks_per_segment,
            self.actual_chunk_size,
        )
        else {
            return Err(StrataError::MissingSize { role: missing_role });
        };
        Ok(PlannedCore {
            plan: SegmentPlan {
                segments,
                entries_per_segment,
                chunks_per_segment,
            },
            chunk_size,
            worst_alignment: entry_size::worst_alignment_without_value_size(self.value_alignment),
            inner_offset: 0,
            constant_entries: false,
        })
    }

    fn state_checks(&self) -> Result<()> {
        if self.actual_chunks_per_segment.is_some() {
            let chunk_size_manual = self.actual_chunk_size.is_some()
                || (self.configured_constant_keys() && self.configured_constant_values());
            if self.entries_per_segment.is_none()
                || self.actual_segments.is_none()
                || !chunk_size_manual
            {
                return Err(StrataError::ConflictingConfig(
                    "actual chunks per segment can only be configured when the other three \
                     low-level configurations are manual too: entries per segment, actual \
                     segments and actual chunk size (unless both key and value sizes are \
                     constant)"
                        .to_string(),
                ));
            }
        }
        if let (Some(entries_per_segment), Some(chunks_per_segment)) =
            (self.entries_per_segment, self.actual_chunks_per_segment)
        {
            if entries_per_segment > chunks_per_segment {
                return Err(StrataError::ConflictingConfig(format!(
                    "entries per segment ({}) cannot exceed actual chunks per segment ({})",
                    entries_per_segment, chunks_per_segment
                )));
            }
        }
        Ok(())
    }

    fn configured_constant_keys(&self) -> bool {
        self.key_oracle.constant_size_marshaller()
            || matches!(self.key_sizing, SizeSpec::ConstantSample(_))
    }

    fn configured_constant_values(&self) -> bool {
        self.value_oracle.constant_size_marshaller()
            || matches!(self.value_sizing, SizeSpec::ConstantSample(_))
    }

    fn check_mutable(&self) -> Result<()> {
        if self.frozen {
            Err(StrataError::AlreadyFrozen)
        } else {
            Ok(())
        }
    }

    fn check_not_statically_known(&self, role: Role) -> Result<()> {
        let statically_known = match role {
            Role::Key => self.key_oracle.statically_known(),
            Role::Value => self.value_oracle.statically_known(),
        };
        if statically_known {
            return Err(StrataError::ConflictingConfig(format!(
                "the {} type's serialized size is statically known and must not be configured \
                 manually",
                role.name()
            )));
        }
        Ok(())
    }
}

impl<K: Clone, V: Clone> Clone for MapBuilder<K, V> {
    /// Deep-copies the configuration; the clone always starts mutable.
    fn clone(&self) -> Self {
        Self {
            key_oracle: self.key_oracle.clone(),
            value_oracle: self.value_oracle.clone(),
            key_sizing: self.key_sizing.clone(),
            value_sizing: self.value_sizing.clone(),
            entries: self.entries,
            min_segments: self.min_segments,
            actual_segments: self.actual_segments,
            entries_per_segment: self.entries_per_segment,
            actual_chunks_per_segment: self.actual_chunks_per_segment,
            actual_chunk_size: self.actual_chunk_size,
            max_chunks_per_entry: self.max_chunks_per_entry,
            value_alignment: self.value_alignment,
            replicated: self.replicated,
            persisted: self.persisted,
            checksum_entries: self.checksum_entries,
            max_bloat_factor: self.max_bloat_factor,
            allow_segment_tiering: self.allow_segment_tiering,
            non_tiered_segments_percentile: self.non_tiered_segments_percentile,
            aligned_64bit_memory_operations_atomic: self.aligned_64bit_memory_operations_atomic,
            frozen: false,
        }
    }
}

#[derive(Clone, Copy)]
enum Role {
    Key,
    Value,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Role::Key => "key",
            Role::Value => "value",
        }
    }
}

struct PlannedCore {
    plan: SegmentPlan,
    chunk_size: u64,
    worst_alignment: u64,
    inner_offset: u64,
    constant_entries: bool,
}

fn resolve_side<T>(
    oracle: &SerializationOracle<T>,
    sizing: &SizeSpec<T>,
    role: &'static str,
) -> Result<ResolvedSide> {
    let measure = |sample: &T| -> Result<u64> {
        oracle.serialization_size(sample).map_err(|err| match err {
            StrataError::BadSample { message, .. } => StrataError::BadSample { role, message },
            other => other,
        })
    };
    match sizing {
        SizeSpec::ConstantSample(sample) => {
            let size = measure(sample)?;
            Ok(ResolvedSide {
                average_size: Some(size as f64),
                constant_size: Some(size),
            })
        }
        SizeSpec::AverageSize(size) => Ok(ResolvedSide {
            average_size: Some(*size),
            constant_size: oracle.constant_size(),
        }),
        SizeSpec::AverageSample(sample) => match oracle.constant_size() {
            Some(constant) => Ok(ResolvedSide {
                average_size: Some(constant as f64),
                constant_size: Some(constant),
            }),
            None => {
                let size = measure(sample)?;
                Ok(ResolvedSide {
                    average_size: Some(size as f64),
                    constant_size: None,
                })
            }
        },
        SizeSpec::Unset => Ok(ResolvedSide {
            average_size: oracle.constant_size().map(|size| size as f64),
            constant_size: oracle.constant_size(),
        }),
    }
}

fn invalid(option: &'static str, message: String) -> StrataError {
    StrataError::InvalidConfig { option, message }
}

fn check_average_size(option: &'static str, average_size: f64) -> Result<()> {
    if !(average_size > 0.0) || !average_size.is_finite() {
        return Err(invalid(
            option,
            format!("must be a positive finite number, {} given", average_size),
        ));
    }
    Ok(())
}

fn check_segments_range(option: &'static str, segments: u64) -> Result<()> {
    if segments == 0 || segments > MAX_SEGMENTS {
        return Err(invalid(
            option,
            format!("should be in [1, {}], {} given", MAX_SEGMENTS, segments),
        ));
    }
    Ok(())
}
