//! Extension types: the registry of extension tags and the codecs of the
//! built-in extension payloads.
//!
//! A custom extension implements [`Extension`] and is registered on a
//! [`Packer`](crate::Packer) or [`Unpacker`](crate::Unpacker). Custom handlers
//! are offered every value before the generic encoding, and win over the
//! built-in handler of the same tag when decoding. The structural tags
//! (bundles, references, record definitions) cannot be replaced.
//!
//! ## Examples
//!
//! ```rust
//! use serde_packr::{Extension, ExtensionContext, Packer, Result, Unpacker, Value};
//!
//! /// Encodes a `[x, y]` pair of small integers as two raw bytes under tag 7.
//! struct Point;
//!
//! impl Extension for Point {
//!     fn tag(&self) -> u8 {
//!         7
//!     }
//!
//!     fn pack(&self, value: &Value, _ctx: &ExtensionContext<'_>) -> Result<Option<Vec<u8>>> {
//!         Ok(match value.as_array().map(Vec::as_slice) {
//!             Some([Value::Number(x), Value::Number(y)]) => match (x.as_u64(), y.as_u64()) {
//!                 (Some(x), Some(y)) if x < 256 && y < 256 => Some(vec![x as u8, y as u8]),
//!                 _ => None,
//!             },
//!             _ => None,
//!         })
//!     }
//!
//!     fn unpack(&self, data: &[u8], _ctx: &ExtensionContext<'_>) -> Result<Value> {
//!         Ok(Value::from(data.iter().map(|b| u64::from(*b)).collect::<Vec<_>>()))
//!     }
//! }
//!
//! let mut packer = Packer::new();
//! packer.register_extension(Point).unwrap();
//! let bytes = packer.encode(&Value::from(vec![3, 4])).unwrap();
//! assert_eq!(bytes, [0xd5, 7, 3, 4]);
//!
//! let mut unpacker = Unpacker::new();
//! unpacker.register_extension(Point).unwrap();
//! assert_eq!(unpacker.decode(&bytes).unwrap(), Value::from(vec![3, 4]));
//! ```

use crate::error::{Error, Result};
use crate::format::tag;
use crate::options::Options;
use crate::value::{ExtValue, TypedArray, Value};
use crate::{Packer, Unpacker};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// A user-defined extension type.
pub trait Extension: Send + Sync {
    /// The extension tag this handler owns.
    fn tag(&self) -> u8;

    /// Encodes `value` into an extension payload.
    ///
    /// Return `Ok(None)` for values this extension does not handle; they fall
    /// through to the next extension and then to the generic encoding.
    fn pack(&self, value: &Value, ctx: &ExtensionContext<'_>) -> Result<Option<Vec<u8>>>;

    /// Decodes an extension payload.
    fn unpack(&self, data: &[u8], ctx: &ExtensionContext<'_>) -> Result<Value>;
}

/// Access to the codec from inside an extension.
///
/// Nested calls run in a fresh session with the same options and extensions;
/// they never touch the state of the call that invoked the extension.
pub struct ExtensionContext<'a> {
    options: &'a Options,
    extensions: &'a ExtensionRegistry,
}

impl<'a> ExtensionContext<'a> {
    pub(crate) fn new(options: &'a Options, extensions: &'a ExtensionRegistry) -> Self {
        ExtensionContext {
            options,
            extensions,
        }
    }

    /// Options of the session that invoked the extension.
    #[must_use]
    pub fn options(&self) -> &Options {
        self.options
    }

    /// Encodes a value into a self-contained buffer.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Packer::with_options(self.options.clone())
            .with_extensions(self.extensions.clone())
            .encode(value)
    }

    /// Decodes a self-contained buffer.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Unpacker::with_options(self.options.clone())
            .with_extensions(self.extensions.clone())
            .decode(bytes)
    }
}

#[derive(Clone)]
enum Handler {
    Empty,
    Builtin,
    Custom(Arc<dyn Extension>),
}

/// The 256-slot extension table of one session.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{ExtensionRegistry, RawExtension};
///
/// let mut registry = ExtensionRegistry::new();
/// assert!(registry.is_builtin(0x73));
/// registry.register(RawExtension::new(0x10)).unwrap();
/// assert!(registry.custom(0x10).is_some());
///
/// // structural tags are reserved
/// assert!(registry.register(RawExtension::new(0x72)).is_err());
/// ```
#[derive(Clone)]
pub struct ExtensionRegistry {
    handlers: Vec<Handler>,
    custom_count: usize,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        let mut handlers = vec![Handler::Empty; 256];
        for tag in tag::BUILTIN {
            handlers[usize::from(tag)] = Handler::Builtin;
        }
        ExtensionRegistry {
            handlers,
            custom_count: 0,
        }
    }
}

impl ExtensionRegistry {
    /// Creates a registry holding only the built-in handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a custom extension, replacing any earlier custom handler or
    /// built-in handler of the same tag.
    ///
    /// # Errors
    ///
    /// Fails for the structural tags `0x62`, `0x69`, `0x70` and `0x72`.
    pub fn register<E: Extension + 'static>(&mut self, extension: E) -> Result<()> {
        self.register_arc(Arc::new(extension))
    }

    /// Installs an already shared extension.
    pub fn register_arc(&mut self, extension: Arc<dyn Extension>) -> Result<()> {
        let tag = extension.tag();
        if tag::STRUCTURAL.contains(&tag) {
            return Err(Error::custom(format!(
                "extension tag 0x{:02x} is reserved",
                tag
            )));
        }
        let slot = &mut self.handlers[usize::from(tag)];
        if !matches!(slot, Handler::Custom(_)) {
            self.custom_count += 1;
        }
        *slot = Handler::Custom(extension);
        Ok(())
    }

    /// Removes a custom extension, restoring the built-in handler if the tag
    /// has one. Returns `false` if no custom extension was registered.
    pub fn unregister(&mut self, tag: u8) -> bool {
        let slot = &mut self.handlers[usize::from(tag)];
        if !matches!(slot, Handler::Custom(_)) {
            return false;
        }
        *slot = if tag::BUILTIN.contains(&tag) {
            Handler::Builtin
        } else {
            Handler::Empty
        };
        self.custom_count -= 1;
        true
    }

    /// The custom extension registered for `tag`.
    #[must_use]
    pub fn custom(&self, tag: u8) -> Option<&Arc<dyn Extension>> {
        match &self.handlers[usize::from(tag)] {
            Handler::Custom(extension) => Some(extension),
            _ => None,
        }
    }

    /// Returns `true` if `tag` is served by its built-in handler.
    #[must_use]
    pub fn is_builtin(&self, tag: u8) -> bool {
        matches!(self.handlers[usize::from(tag)], Handler::Builtin)
    }

    /// Returns `true` if any custom extension is registered.
    #[must_use]
    pub fn has_custom(&self) -> bool {
        self.custom_count > 0
    }

    /// Custom extensions in tag order.
    pub fn customs(&self) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.handlers.iter().filter_map(|handler| match handler {
            Handler::Custom(extension) => Some(extension),
            _ => None,
        })
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let custom: Vec<String> = self
            .customs()
            .map(|extension| format!("0x{:02x}", extension.tag()))
            .collect();
        f.debug_struct("ExtensionRegistry")
            .field("custom", &custom)
            .finish()
    }
}

/// Passes [`Value::Ext`] payloads of one tag through unchanged.
///
/// Registering a `RawExtension` lets a session accept extension tags it has
/// no real handler for.
#[derive(Clone, Copy, Debug)]
pub struct RawExtension {
    tag: u8,
}

impl RawExtension {
    #[must_use]
    pub fn new(tag: u8) -> Self {
        RawExtension { tag }
    }
}

impl Extension for RawExtension {
    fn tag(&self) -> u8 {
        self.tag
    }

    fn pack(&self, value: &Value, _ctx: &ExtensionContext<'_>) -> Result<Option<Vec<u8>>> {
        Ok(match value {
            Value::Ext(ext) if ext.tag == self.tag => Some(ext.data.to_vec()),
            _ => None,
        })
    }

    fn unpack(&self, data: &[u8], _ctx: &ExtensionContext<'_>) -> Result<Value> {
        Ok(Value::Ext(ExtValue {
            tag: self.tag,
            data: Bytes::copy_from_slice(data),
        }))
    }
}

const TIMESTAMP32_MAX_SECS: i64 = 1 << 32;
const TIMESTAMP64_MAX_SECS: i64 = 1 << 34;
const TIMESTAMP64_MAX_NANOS: u32 = 1 << 30;

/// Timestamp payload: the shortest of the 4, 8 and 12 byte forms that holds
/// the date exactly.
pub(crate) fn pack_timestamp(date: &DateTime<Utc>) -> Vec<u8> {
    let secs = date.timestamp();
    let nanos = date.timestamp_subsec_nanos();
    if nanos == 0 && (0..TIMESTAMP32_MAX_SECS).contains(&secs) {
        (secs as u32).to_be_bytes().to_vec()
    } else if (0..TIMESTAMP64_MAX_SECS).contains(&secs) && nanos < TIMESTAMP64_MAX_NANOS {
        ((u64::from(nanos) << 34) | secs as u64).to_be_bytes().to_vec()
    } else {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&nanos.to_be_bytes());
        payload.extend_from_slice(&secs.to_be_bytes());
        payload
    }
}

/// Decodes a timestamp payload; `None` for a bad length or an out-of-range date.
pub(crate) fn unpack_timestamp(data: &[u8]) -> Option<DateTime<Utc>> {
    let (secs, nanos) = match data.len() {
        4 => (i64::from(u32::from_be_bytes(data.try_into().ok()?)), 0),
        8 => {
            let packed = u64::from_be_bytes(data.try_into().ok()?);
            ((packed & 0x3_ffff_ffff) as i64, (packed >> 34) as u32)
        }
        12 => {
            let nanos = u32::from_be_bytes(data[..4].try_into().ok()?);
            let secs = i64::from_be_bytes(data[4..].try_into().ok()?);
            (secs, nanos)
        }
        _ => return None,
    };
    DateTime::from_timestamp(secs, nanos)
}

/// Typed array payload: kind byte followed by the little-endian elements.
pub(crate) fn pack_typed_array(array: &TypedArray) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + array.len() * 8);
    payload.push(array.kind());
    payload.extend_from_slice(&array.to_le_bytes());
    payload
}

pub(crate) fn unpack_typed_array(data: &[u8]) -> Option<TypedArray> {
    let (&kind, elements) = data.split_first()?;
    TypedArray::from_le_bytes(kind, elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Upper;

    impl Extension for Upper {
        fn tag(&self) -> u8 {
            0x20
        }

        fn pack(&self, _value: &Value, _ctx: &ExtensionContext<'_>) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn unpack(&self, data: &[u8], _ctx: &ExtensionContext<'_>) -> Result<Value> {
            Ok(Value::from(String::from_utf8_lossy(data).to_uppercase()))
        }
    }

    #[test]
    fn test_registry_builtins() {
        let registry = ExtensionRegistry::new();
        for tag in tag::BUILTIN {
            assert!(registry.is_builtin(tag));
        }
        assert!(!registry.is_builtin(0x20));
        assert!(!registry.has_custom());
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Upper).unwrap();
        registry.register(RawExtension::new(tag::SET)).unwrap();
        assert!(registry.has_custom());
        assert_eq!(registry.customs().count(), 2);
        assert!(!registry.is_builtin(tag::SET));

        assert!(registry.unregister(tag::SET));
        assert!(registry.is_builtin(tag::SET));
        assert!(registry.unregister(0x20));
        assert!(!registry.unregister(0x20));
        assert!(!registry.has_custom());
    }

    #[test]
    fn test_structural_tags_are_reserved() {
        let mut registry = ExtensionRegistry::new();
        for tag in tag::STRUCTURAL {
            assert!(registry.register(RawExtension::new(tag)).is_err());
        }
    }

    #[test]
    fn test_timestamp_forms() {
        let whole = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(pack_timestamp(&whole).len(), 4);

        let fractional = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(pack_timestamp(&fractional).len(), 8);

        let before_epoch = Utc.timestamp_opt(-86_400, 5).unwrap();
        assert_eq!(pack_timestamp(&before_epoch).len(), 12);

        for date in [whole, fractional, before_epoch] {
            assert_eq!(unpack_timestamp(&pack_timestamp(&date)), Some(date));
        }
        assert_eq!(unpack_timestamp(&[0; 5]), None);
    }

    #[test]
    fn test_typed_array_payload() {
        let array = TypedArray::Int16(vec![1, -2]);
        let payload = pack_typed_array(&array);
        assert_eq!(payload, vec![3, 1, 0, 0xfe, 0xff]);
        assert_eq!(unpack_typed_array(&payload), Some(array));
        assert_eq!(unpack_typed_array(&[]), None);
    }
}
