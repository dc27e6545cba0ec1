//! Marshaller adapters: the planner's only view of key/value serialization.
//!
//! Serialization itself lives outside this crate. The planner consumes two
//! narrow capabilities: a [`SizeMarshaller`] that reports how many bytes a
//! length prefix occupies, and a [`SizedMarshaller`] handle that reports
//! whether a type's serialized size is constant and measures sample objects.
//! [`SerializationOracle`] bundles the two behind cheaply clonable handles.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use stratamap_common::Result;

/// Length-prefix encoder used ahead of each stored key and value.
pub trait SizeMarshaller: fmt::Debug + Send + Sync {
    /// Bytes used to encode the length `size`.
    fn storing_length(&self, size: u64) -> u64;

    /// True when every length is encoded in the same number of bytes.
    fn constant_storing_length(&self) -> bool;
}

/// Stop-bit encoding: 7 bits of payload per byte, high bit continues.
///
/// The default for variably-sized keys and values.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopBitSizeMarshaller;

impl SizeMarshaller for StopBitSizeMarshaller {
    fn storing_length(&self, size: u64) -> u64 {
        let bits = 64 - u64::from(size.leading_zeros());
        (bits.div_ceil(7)).max(1)
    }

    fn constant_storing_length(&self) -> bool {
        false
    }
}

/// Size marshaller for constant-size types: the length is part of the map
/// metadata, so nothing is stored per entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantSizeMarshaller;

impl SizeMarshaller for ConstantSizeMarshaller {
    fn storing_length(&self, _size: u64) -> u64 {
        0
    }

    fn constant_storing_length(&self) -> bool {
        true
    }
}

/// Opaque handle for a key or value marshaller.
///
/// The planner never serializes anything; it only asks about sizes.
pub trait SizedMarshaller<T>: fmt::Debug + Send + Sync {
    /// True when the serialized size is fixed by the type itself.
    fn statically_known(&self) -> bool {
        false
    }

    /// The serialized size when it is the same for every object, if known.
    fn constant_size(&self) -> Option<u64> {
        None
    }

    /// Measures the serialized size of one sample object.
    ///
    /// Fails with a bad-sample error when the marshaller cannot measure
    /// the sample.
    fn serialization_size(&self, sample: &T) -> Result<u64>;
}

/// Types whose serialized form has a size fixed at compile time.
pub trait StaticallySized {
    /// Serialized size in bytes.
    const SERIALIZED_SIZE: u64;
}

macro_rules! statically_sized {
    ($($t:ty),* $(,)?) => {
        $(
            impl StaticallySized for $t {
                const SERIALIZED_SIZE: u64 = std::mem::size_of::<$t>() as u64;
            }
        )*
    };
}

statically_sized!(bool, u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

/// Marshaller handle for [`StaticallySized`] types.
pub struct StaticSizer<T>(PhantomData<fn() -> T>);

impl<T> StaticSizer<T> {
    /// Creates the sizer.
    pub fn new() -> Self {
        StaticSizer(PhantomData)
    }
}

impl<T> Default for StaticSizer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for StaticSizer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticSizer")
    }
}

impl<T: StaticallySized> SizedMarshaller<T> for StaticSizer<T> {
    fn statically_known(&self) -> bool {
        true
    }

    fn constant_size(&self) -> Option<u64> {
        Some(T::SERIALIZED_SIZE)
    }

    fn serialization_size(&self, _sample: &T) -> Result<u64> {
        Ok(T::SERIALIZED_SIZE)
    }
}

/// Marshaller handle measuring raw byte strings one-to-one.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSizer;

impl SizedMarshaller<Vec<u8>> for BytesSizer {
    fn serialization_size(&self, sample: &Vec<u8>) -> Result<u64> {
        Ok(sample.len() as u64)
    }
}

impl SizedMarshaller<String> for BytesSizer {
    fn serialization_size(&self, sample: &String) -> Result<u64> {
        Ok(sample.len() as u64)
    }
}

/// Adapter over a key or value marshaller handle plus its length-prefix
/// encoder.
///
/// Handles are `Arc`s, so cloning an oracle (and therefore a builder) copies
/// references, not marshallers.
pub struct SerializationOracle<T> {
    marshaller: Arc<dyn SizedMarshaller<T>>,
    size_marshaller: Arc<dyn SizeMarshaller>,
}

impl<T> Clone for SerializationOracle<T> {
    fn clone(&self) -> Self {
        Self {
            marshaller: Arc::clone(&self.marshaller),
            size_marshaller: Arc::clone(&self.size_marshaller),
        }
    }
}

impl<T> fmt::Debug for SerializationOracle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializationOracle")
            .field("marshaller", &self.marshaller)
            .field("size_marshaller", &self.size_marshaller)
            .finish()
    }
}

impl<T> SerializationOracle<T> {
    /// Wraps a marshaller handle, choosing the default length-prefix
    /// encoding: constant (zero bytes) when the type size is constant,
    /// stop-bit otherwise.
    pub fn new(marshaller: Arc<dyn SizedMarshaller<T>>) -> Self {
        let size_marshaller: Arc<dyn SizeMarshaller> = if marshaller.constant_size().is_some() {
            Arc::new(ConstantSizeMarshaller)
        } else {
            Arc::new(StopBitSizeMarshaller)
        };
        Self {
            marshaller,
            size_marshaller,
        }
    }

    /// Replaces the length-prefix encoder.
    pub fn with_size_marshaller(mut self, size_marshaller: Arc<dyn SizeMarshaller>) -> Self {
        self.size_marshaller = size_marshaller;
        self
    }

    /// True when the serialized size is fixed by the type itself.
    pub fn statically_known(&self) -> bool {
        self.marshaller.statically_known()
    }

    /// True when the serialized size is the same for every object.
    pub fn constant_size_marshaller(&self) -> bool {
        self.marshaller.constant_size().is_some()
    }

    /// The constant serialized size, if there is one.
    pub fn constant_size(&self) -> Option<u64> {
        self.marshaller.constant_size()
    }

    /// Measures a sample object.
    pub fn serialization_size(&self, sample: &T) -> Result<u64> {
        self.marshaller.serialization_size(sample)
    }

    /// The length-prefix encoder.
    pub fn size_marshaller(&self) -> &Arc<dyn SizeMarshaller> {
        &self.size_marshaller
    }

    /// Average bytes of the length prefix for the given average payload size.
    ///
    /// An integral average uses the prefix length of that exact size; a
    /// fractional one interpolates linearly between the prefix lengths of
    /// the two neighboring integers.
    pub fn average_storing_length(&self, average_size: f64) -> f64 {
        if average_size == average_size.round() {
            return self.size_marshaller.storing_length(average_size.round() as u64) as f64;
        }
        let lower = average_size.floor();
        let upper = lower + 1.0;
        let lower_length = self.size_marshaller.storing_length(lower as u64) as f64;
        let upper_length = self.size_marshaller.storing_length(upper as u64) as f64;
        if lower_length == upper_length {
            return lower_length;
        }
        lower_length * (upper - average_size) + upper_length * (average_size - lower)
    }
}

impl<T: StaticallySized + 'static> SerializationOracle<T> {
    /// Oracle for a type whose serialized size is fixed at compile time.
    pub fn of_static() -> Self {
        Self::new(Arc::new(StaticSizer::<T>::new()))
    }
}

impl SerializationOracle<Vec<u8>> {
    /// Oracle measuring raw byte strings.
    pub fn bytes() -> Self {
        Self::new(Arc::new(BytesSizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratamap_common::StrataError;

    #[test]
    fn test_stop_bit_storing_length() {
        let m = StopBitSizeMarshaller;
        assert_eq!(m.storing_length(0), 1);
        assert_eq!(m.storing_length(1), 1);
        assert_eq!(m.storing_length(127), 1);
        assert_eq!(m.storing_length(128), 2);
        assert_eq!(m.storing_length(16_383), 2);
        assert_eq!(m.storing_length(16_384), 3);
        assert_eq!(m.storing_length(1_000_000), 3);
        assert_eq!(m.storing_length(u64::MAX), 10);
        assert!(!m.constant_storing_length());
    }

    #[test]
    fn test_constant_size_marshaller_stores_nothing() {
        let m = ConstantSizeMarshaller;
        assert_eq!(m.storing_length(0), 0);
        assert_eq!(m.storing_length(1 << 40), 0);
        assert!(m.constant_storing_length());
    }

    #[test]
    fn test_static_sizer_reports_type_size() {
        let sizer = StaticSizer::<u64>::new();
        assert!(sizer.statically_known());
        assert_eq!(sizer.constant_size(), Some(8));
        assert_eq!(sizer.serialization_size(&42u64).unwrap(), 8);

        let sizer = StaticSizer::<u32>::new();
        assert_eq!(sizer.constant_size(), Some(4));
    }

    #[test]
    fn test_bytes_sizer_measures_length() {
        let sizer = BytesSizer;
        assert_eq!(sizer.serialization_size(&vec![0u8; 17]).unwrap(), 17);
        assert_eq!(sizer.serialization_size(&"hello".to_string()).unwrap(), 5);
        assert!(!SizedMarshaller::<Vec<u8>>::statically_known(&sizer));
        assert_eq!(SizedMarshaller::<Vec<u8>>::constant_size(&sizer), None);
    }

    #[test]
    fn test_oracle_defaults_to_matching_size_marshaller() {
        let constant = SerializationOracle::<u64>::of_static();
        assert!(constant.statically_known());
        assert!(constant.constant_size_marshaller());
        assert!(constant.size_marshaller().constant_storing_length());

        let variable = SerializationOracle::bytes();
        assert!(!variable.statically_known());
        assert!(!variable.constant_size_marshaller());
        assert!(!variable.size_marshaller().constant_storing_length());
    }

    #[test]
    fn test_oracle_clone_shares_handles() {
        let oracle = SerializationOracle::bytes();
        let clone = oracle.clone();
        assert!(Arc::ptr_eq(&oracle.marshaller, &clone.marshaller));
        assert!(Arc::ptr_eq(&oracle.size_marshaller, &clone.size_marshaller));
    }

    #[test]
    fn test_average_storing_length_integral() {
        let oracle = SerializationOracle::bytes();
        assert_eq!(oracle.average_storing_length(8.0), 1.0);
        assert_eq!(oracle.average_storing_length(200.0), 2.0);
    }

    #[test]
    fn test_average_storing_length_interpolates() {
        let oracle = SerializationOracle::bytes();
        // storing_length(127) = 1, storing_length(128) = 2
        let interpolated = oracle.average_storing_length(127.25);
        assert!((interpolated - 1.25).abs() < 1e-12);
        // Same length on both sides: no interpolation.
        assert_eq!(oracle.average_storing_length(64.5), 1.0);
    }

    #[test]
    fn test_bad_sample_error() {
        #[derive(Debug)]
        struct Unmeasurable;
        impl SizedMarshaller<Vec<u8>> for Unmeasurable {
            fn serialization_size(&self, _sample: &Vec<u8>) -> Result<u64> {
                Err(StrataError::BadSample {
                    role: "sample",
                    message: "opaque handle".to_string(),
                })
            }
        }

        let oracle = SerializationOracle::new(Arc::new(Unmeasurable));
        let err = oracle.serialization_size(&vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, StrataError::BadSample { .. }));
    }
}
