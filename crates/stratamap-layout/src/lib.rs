//! StrataMap layout planning engine.
//!
//! StrataMap is an embeddable, persistent, optionally-replicated hash map
//! whose key/value storage lives in a memory-mapped region shared between
//! threads and across processes. This crate is the builder's sizing and
//! layout-planning core: a pure pipeline that converts a user configuration
//! (entry count, key/value size distributions, alignment, replication) into
//! the physical [`Layout`] the runtime allocates backing memory from:
//! segment count, entries and chunks per segment, chunk size, hash-lookup
//! slot packing, and segment header size.
//!
//! ```
//! use stratamap_layout::MapBuilder;
//! use stratamap_layout::marshaller::SerializationOracle;
//!
//! # fn main() -> stratamap_common::Result<()> {
//! let layout = MapBuilder::of(
//!     SerializationOracle::bytes(),
//!     SerializationOracle::bytes(),
//! )
//! .entries(1_000_000)?
//! .average_key_size(8.0)?
//! .average_value_size(8.0)?
//! .emit()?;
//!
//! assert!(layout.segments.is_power_of_two());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod chunks;
pub mod constants;
pub mod entry_size;
pub mod hash_lookup;
pub mod layout;
pub mod marshaller;
pub mod segments;

pub use builder::{ChecksumEntries, MapBuilder};
pub use layout::Layout;
pub use marshaller::{SerializationOracle, SizeMarshaller, SizedMarshaller};
