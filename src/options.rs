//! Configuration options for packr encoding and decoding.
//!
//! - [`Options`]: codec configuration shared by [`Packer`](crate::Packer) and
//!   [`Unpacker`](crate::Unpacker)
//! - [`Int64Mode`]: how 64-bit integers are surfaced when decoding
//! - [`Float32Mode`]: when floats may be narrowed to 32 bits on the wire
//!
//! Both sides of a stream must agree on `use_records`, the structure pool sizes
//! and `float32`; the other settings only affect one side.
//!
//! ## Examples
//!
//! ```rust
//! use serde_packr::{decode_with_options, encode_with_options, Int64Mode, Options, Value};
//!
//! let options = Options::new()
//!     .with_structured_clone(true)
//!     .with_int64_mode(Int64Mode::AutoNarrow);
//!
//! let bytes = encode_with_options(&Value::from(vec![1, 2, 3]), options.clone()).unwrap();
//! let value = decode_with_options(&bytes, options).unwrap();
//! assert_eq!(value, Value::from(vec![1, 2, 3]));
//! ```

/// Decoding policy for `uint64`/`int64` wire values.
///
/// Smaller integer forms always decode to [`Number::Integer`](crate::Number).
///
/// # Examples
///
/// ```rust
/// use serde_packr::{decode_with_options, Int64Mode, Options, Value};
///
/// // uint64 holding 2^60
/// let bytes = [0xcf, 0x10, 0, 0, 0, 0, 0, 0, 0];
/// let text = decode_with_options(&bytes, Options::new().with_int64_mode(Int64Mode::String)).unwrap();
/// assert_eq!(text, Value::from("1152921504606846976"));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Int64Mode {
    /// Rust's 64-bit integers: `Integer`, or `Unsigned` above `i64::MAX`.
    #[default]
    Native,
    /// Decimal string.
    String,
    /// `Integer` when the magnitude is at most 2^53, `BigInt` otherwise.
    AutoNarrow,
    /// Always `BigInt`.
    Always64,
}

/// When non-integral floats may be written as float32.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Float32Mode {
    /// Always float64.
    #[default]
    Off,
    /// float32 only when the value survives the narrowing exactly.
    RoundTripSafe,
    /// float32 whenever the value survives at the decimal precision of its
    /// float32 exponent; the decoder rounds back to that precision.
    Aggressive,
}

/// Default upper bound for one encoded buffer.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 0x7fd0_0000;

/// Configuration for the packr codec.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{Float32Mode, Options};
///
/// let options = Options::new()
///     .with_records(true)
///     .with_max_own_structures(128)
///     .with_float32(Float32Mode::RoundTripSafe)
///     .with_bundle_strings(true);
/// assert!(options.use_two_byte_records());
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    pub use_records: bool,
    pub maps_as_objects: bool,
    pub max_shared_structures: usize,
    pub max_own_structures: usize,
    pub int64_mode: Int64Mode,
    pub structured_clone: bool,
    pub float32: Float32Mode,
    pub sequential: bool,
    pub copy_on_read: bool,
    pub bundle_strings: bool,
    pub large_bigint_to_float: bool,
    pub max_buffer_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            use_records: true,
            maps_as_objects: true,
            max_shared_structures: 32,
            max_own_structures: 64,
            int64_mode: Int64Mode::default(),
            structured_clone: false,
            float32: Float32Mode::default(),
            sequential: false,
            copy_on_read: false,
            bundle_strings: false,
            large_bigint_to_float: false,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

/// First record id.
pub(crate) const RECORD_ID_BASE: u16 = 0x40;
/// First id written with a second (high) byte in two-byte mode.
pub(crate) const TWO_BYTE_ID_BASE: u16 = 0x60;
/// Number of record ids addressable by one-byte references.
const ONE_BYTE_RECORD_IDS: usize = 0x40;
/// Number of record ids addressable in two-byte mode.
const TWO_BYTE_RECORD_IDS: usize = 0x20 + 0x20 * 0x100;

impl Options {
    /// Creates default options: records on, shared pool of 32, own pool of 64.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_packr::Options;
    ///
    /// let options = Options::new();
    /// assert!(options.use_records);
    /// assert!(!options.structured_clone);
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain MessagePack: no records, no structured clone.
    #[must_use]
    pub fn plain() -> Self {
        Options {
            use_records: false,
            ..Default::default()
        }
    }

    /// Enables or disables record (shared object shape) encoding.
    #[must_use]
    pub fn with_records(mut self, use_records: bool) -> Self {
        self.use_records = use_records;
        self
    }

    /// Decode string-keyed maps as `Object` (default) or always as `Map`.
    #[must_use]
    pub fn with_maps_as_objects(mut self, maps_as_objects: bool) -> Self {
        self.maps_as_objects = maps_as_objects;
        self
    }

    /// Sets the size of the shared structure pool.
    #[must_use]
    pub fn with_max_shared_structures(mut self, max: usize) -> Self {
        self.max_shared_structures = max;
        self
    }

    /// Sets the size of the per-buffer structure ring.
    #[must_use]
    pub fn with_max_own_structures(mut self, max: usize) -> Self {
        self.max_own_structures = max;
        self
    }

    /// Sets the 64-bit integer decoding policy.
    #[must_use]
    pub fn with_int64_mode(mut self, mode: Int64Mode) -> Self {
        self.int64_mode = mode;
        self
    }

    /// Enables reference tracking for [`Value::Shared`](crate::Value) nodes.
    #[must_use]
    pub fn with_structured_clone(mut self, structured_clone: bool) -> Self {
        self.structured_clone = structured_clone;
        self
    }

    /// Sets the float32 narrowing policy.
    #[must_use]
    pub fn with_float32(mut self, mode: Float32Mode) -> Self {
        self.float32 = mode;
        self
    }

    /// Keeps per-buffer structures alive across the values of one stream.
    #[must_use]
    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    /// Copy binary payloads instead of slicing the input buffer.
    #[must_use]
    pub fn with_copy_on_read(mut self, copy_on_read: bool) -> Self {
        self.copy_on_read = copy_on_read;
        self
    }

    /// Collects short strings into out-of-line bundles.
    #[must_use]
    pub fn with_bundle_strings(mut self, bundle_strings: bool) -> Self {
        self.bundle_strings = bundle_strings;
        self
    }

    /// Writes big integers outside the 64-bit range as float64 instead of failing.
    #[must_use]
    pub fn with_large_bigint_to_float(mut self, enabled: bool) -> Self {
        self.large_bigint_to_float = enabled;
        self
    }

    /// Sets the maximum size of one encoded buffer.
    #[must_use]
    pub fn with_max_buffer_size(mut self, max: usize) -> Self {
        self.max_buffer_size = max;
        self
    }

    /// Two-byte record references are used once the pools outgrow 64 ids.
    #[must_use]
    pub fn use_two_byte_records(&self) -> bool {
        self.max_shared_structures + self.max_own_structures > ONE_BYTE_RECORD_IDS
    }

    /// Shared pool size after clamping to the addressable id space.
    pub(crate) fn shared_capacity(&self) -> usize {
        self.max_shared_structures.min(self.id_capacity())
    }

    /// Own ring size after clamping to the addressable id space.
    pub(crate) fn own_capacity(&self) -> usize {
        self.max_own_structures
            .min(self.id_capacity() - self.shared_capacity())
    }

    /// First id of the own ring.
    pub(crate) fn shared_limit_id(&self) -> u16 {
        RECORD_ID_BASE + self.shared_capacity() as u16
    }

    fn id_capacity(&self) -> usize {
        if self.use_two_byte_records() {
            TWO_BYTE_RECORD_IDS
        } else {
            ONE_BYTE_RECORD_IDS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pools_use_two_byte_ids() {
        let options = Options::default();
        assert!(options.use_two_byte_records());
        assert_eq!(options.shared_limit_id(), 0x60);
        assert_eq!(options.own_capacity(), 64);
    }

    #[test]
    fn test_one_byte_pools() {
        let options = Options::new()
            .with_max_shared_structures(16)
            .with_max_own_structures(48);
        assert!(!options.use_two_byte_records());
        assert_eq!(options.shared_limit_id(), 0x50);
        assert_eq!(options.own_capacity(), 48);
    }

    #[test]
    fn test_pool_sizes_are_clamped() {
        let options = Options::new()
            .with_max_shared_structures(10_000)
            .with_max_own_structures(10_000);
        assert_eq!(options.shared_capacity(), TWO_BYTE_RECORD_IDS);
        assert_eq!(options.own_capacity(), 0);
    }
}
