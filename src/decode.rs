//! Decoding packr bytes into [`Value`]s.
//!
//! An [`Unpacker`] is one decoding session: it remembers shared record
//! structures across calls (and own structures too, in sequential mode).
//! A failed decode leaves the session exactly as it was before the call.
//!
//! ## Examples
//!
//! ```rust
//! use serde_packr::{packr, Packer, Unpacker};
//!
//! let mut packer = Packer::new();
//! let mut unpacker = Unpacker::new();
//!
//! for id in 0..3 {
//!     let row = packr!({ "id": id, "ok": true });
//!     let bytes = packer.encode(&row).unwrap();
//!     assert_eq!(unpacker.decode(&bytes).unwrap(), row);
//! }
//! ```

use crate::error::{Error, Result};
use crate::extension::{unpack_timestamp, unpack_typed_array, ExtensionContext, ExtensionRegistry};
use crate::format::{self, tag};
use crate::options::{Float32Mode, Int64Mode, Options, RECORD_ID_BASE, TWO_BYTE_ID_BASE};
use crate::structures::{record_id_from_bytes, StructureStore, StructureTable};
use crate::value::{ErrorValue, Number, RegExpValue, SharedValue, Value};
use crate::{Extension, ObjectMap};
use bytes::Bytes;
use num_bigint::BigInt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Largest integer magnitude `Int64Mode::AutoNarrow` keeps as a plain number.
const MAX_SAFE_INTEGER: u64 = 1 << 53;

/// A decoding session.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{Error, Unpacker, Value};
///
/// let mut unpacker = Unpacker::new();
/// assert_eq!(unpacker.decode(&[0x92, 0x01, 0xc0]).unwrap(), Value::from(vec![Value::from(1), Value::Null]));
/// assert!(matches!(unpacker.decode(&[0x01, 0x02]), Err(Error::TrailingData { offset: 1, remaining: 1 })));
/// ```
pub struct Unpacker {
    options: Options,
    extensions: ExtensionRegistry,
    table: StructureTable,
    store: Option<Box<dyn StructureStore>>,
    keys: KeyCache,
}

impl Default for Unpacker {
    fn default() -> Self {
        Self::with_options(Options::default())
    }
}

impl Unpacker {
    /// Creates a session with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session with custom options.
    #[must_use]
    pub fn with_options(options: Options) -> Self {
        Unpacker {
            table: StructureTable::new(&options),
            options,
            extensions: ExtensionRegistry::new(),
            store: None,
            keys: KeyCache::default(),
        }
    }

    /// Replaces the extension registry.
    #[must_use]
    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    /// Looks up shared structures in `store` when a buffer references one this
    /// session has not seen defined.
    #[must_use]
    pub fn with_structure_store<S: StructureStore + 'static>(mut self, store: S) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Adds a custom extension to this session.
    pub fn register_extension<E: Extension + 'static>(&mut self, extension: E) -> Result<()> {
        self.extensions.register(extension)
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[must_use]
    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    /// Decodes exactly one value.
    ///
    /// # Errors
    ///
    /// - [`Error::IncompleteBuffer`] if the input ends inside the value
    /// - [`Error::TrailingData`] if bytes follow the value
    /// - any corruption error from the value itself
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Value> {
        self.decode_bytes(Bytes::copy_from_slice(bytes))
    }

    /// Decodes exactly one value; binary payloads share `data` unless
    /// `copy_on_read` is set.
    pub fn decode_bytes(&mut self, data: Bytes) -> Result<Value> {
        let snapshot = self.table.clone();
        let result = self.decode_at(&data, 0).and_then(|(value, end)| {
            if end < data.len() {
                Err(Error::TrailingData {
                    offset: end,
                    remaining: data.len() - end,
                })
            } else {
                Ok(value)
            }
        });
        self.settle(snapshot, result)
    }

    /// Lazily decodes consecutive values until the input is exhausted.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_packr::{Unpacker, Value};
    ///
    /// let mut unpacker = Unpacker::new();
    /// let values: Vec<Value> = unpacker
    ///     .decode_multiple(&[0x01, 0xa1, b'x', 0xc3])
    ///     .collect::<Result<_, _>>()
    ///     .unwrap();
    /// assert_eq!(values, vec![Value::from(1), Value::from("x"), Value::Bool(true)]);
    /// ```
    pub fn decode_multiple(&mut self, bytes: &[u8]) -> DecodeMultiple<'_> {
        DecodeMultiple {
            unpacker: SessionRef::Borrowed(self),
            data: Bytes::copy_from_slice(bytes),
            pos: 0,
            done: false,
        }
    }

    /// Decodes one value starting at `pos`, returning the value and the
    /// position after it.
    fn decode_at(&mut self, data: &Bytes, pos: usize) -> Result<(Value, usize)> {
        let mut decoder = Decoder {
            data: data.clone(),
            pos,
            end: data.len(),
            options: &self.options,
            extensions: &self.extensions,
            two_byte: self.options.use_two_byte_records(),
            table: &mut self.table,
            store: self.store.as_deref(),
            store_reloaded: false,
            keys: &mut self.keys,
            refs: HashMap::new(),
            bundle: None,
            post_bundle: 0,
            depth: 0,
        };
        let value = decoder.read_value()?;
        Ok((value, decoder.pos.max(decoder.post_bundle)))
    }

    fn settle(&mut self, snapshot: StructureTable, result: Result<Value>) -> Result<Value> {
        match result {
            Ok(value) => {
                if !self.options.sequential {
                    self.table.clear_own();
                }
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "decode failed, rolling back structures");
                self.table = snapshot;
                Err(err)
            }
        }
    }
}

enum SessionRef<'u> {
    Owned(Box<Unpacker>),
    Borrowed(&'u mut Unpacker),
}

impl SessionRef<'_> {
    fn get(&mut self) -> &mut Unpacker {
        match self {
            SessionRef::Owned(unpacker) => &mut **unpacker,
            SessionRef::Borrowed(unpacker) => &mut **unpacker,
        }
    }
}

/// Iterator over the values of a concatenated stream.
///
/// Stops after the first error.
pub struct DecodeMultiple<'u> {
    unpacker: SessionRef<'u>,
    data: Bytes,
    pos: usize,
    done: bool,
}

impl DecodeMultiple<'static> {
    pub(crate) fn owned(unpacker: Unpacker, data: Bytes) -> Self {
        DecodeMultiple {
            unpacker: SessionRef::Owned(Box::new(unpacker)),
            data,
            pos: 0,
            done: false,
        }
    }
}

impl Iterator for DecodeMultiple<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.data.len() {
            return None;
        }
        let unpacker = self.unpacker.get();
        let snapshot = unpacker.table.clone();
        let result = unpacker.decode_at(&self.data, self.pos).map(|(value, end)| {
            self.pos = end;
            value
        });
        let result = unpacker.settle(snapshot, result);
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

/// Short string keys seen before, by a hash of their raw bytes.
#[derive(Default)]
struct KeyCache {
    slots: Vec<Option<(Box<[u8]>, String)>>,
}

const KEY_CACHE_SLOTS: usize = 4096;
/// Keys of this many bytes or more bypass the cache.
const MAX_CACHED_KEY: usize = 16;

impl KeyCache {
    fn slot(bytes: &[u8]) -> usize {
        let b0 = usize::from(bytes.first().copied().unwrap_or(0));
        let b1 = usize::from(bytes.get(1).copied().unwrap_or(0));
        ((bytes.len() << 5) ^ ((b0 << 8) | b1)) & (KEY_CACHE_SLOTS - 1)
    }

    /// The key for `bytes`; `None` if they are not valid UTF-8.
    fn intern(&mut self, bytes: &[u8]) -> Option<String> {
        if self.slots.is_empty() {
            self.slots.resize(KEY_CACHE_SLOTS, None);
        }
        let slot = &mut self.slots[Self::slot(bytes)];
        if let Some((raw, key)) = slot {
            if **raw == *bytes {
                return Some(key.clone());
            }
        }
        let key = std::str::from_utf8(bytes).ok()?.to_string();
        *slot = Some((bytes.into(), key.clone()));
        Some(key)
    }
}

struct BundleStrings {
    wide: String,
    ascii: String,
    wide_pos: usize,
    ascii_pos: usize,
}

/// State of one top-level decode.
struct Decoder<'u> {
    data: Bytes,
    pos: usize,
    end: usize,
    options: &'u Options,
    extensions: &'u ExtensionRegistry,
    two_byte: bool,
    table: &'u mut StructureTable,
    store: Option<&'u dyn StructureStore>,
    store_reloaded: bool,
    keys: &'u mut KeyCache,
    refs: HashMap<u32, SharedValue>,
    bundle: Option<BundleStrings>,
    /// Furthest position reached while reading bundle strings.
    post_bundle: usize,
    depth: usize,
}

impl<'u> Decoder<'u> {
    /// Advances past `n` bytes, returning where they start.
    fn take(&mut self, n: usize) -> Result<usize> {
        let available = self.end - self.pos;
        if n > available {
            return Err(Error::incomplete(self.pos, n - available));
        }
        let start = self.pos;
        self.pos += n;
        Ok(start)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let start = self.take(1)?;
        Ok(self.data[start])
    }

    fn read_array_bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let start = self.take(N)?;
        let mut bytes = [0; N];
        bytes.copy_from_slice(&self.data[start..start + N]);
        Ok(bytes)
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.read_array_bytes().map(u16::from_be_bytes)
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.read_array_bytes().map(u32::from_be_bytes)
    }

    fn read_len32(&mut self) -> Result<usize> {
        Ok(self.read_u32()? as usize)
    }

    /// Preallocation bound for a container of `len` items.
    fn capacity_for(&self, len: usize) -> usize {
        len.min(self.end - self.pos)
    }

    fn read_value(&mut self) -> Result<Value> {
        if self.depth >= format::MAX_DEPTH {
            return Err(Error::invalid_data(self.pos, "nesting too deep"));
        }
        self.depth += 1;
        let result = self.read_token();
        self.depth -= 1;
        result
    }

    fn read_token(&mut self) -> Result<Value> {
        let start = self.pos;
        let token = self.read_u8()?;
        match token {
            0x00..=0x3f => Ok(Value::from(token)),
            0x40..=0x7f => {
                if self.options.use_records {
                    self.read_record(token, start)
                } else {
                    Ok(Value::from(token))
                }
            }
            0x80..=0x8f => self.read_map(usize::from(token & 0x0f)),
            0x90..=0x9f => self.read_array(usize::from(token & 0x0f)),
            0xa0..=0xbf => self.read_str(usize::from(token & 0x1f)).map(Value::String),
            format::NIL => Ok(Value::Null),
            format::BUNDLE_REF => self.read_bundled(start),
            format::FALSE => Ok(Value::Bool(false)),
            format::TRUE => Ok(Value::Bool(true)),
            format::BIN8 => {
                let len = usize::from(self.read_u8()?);
                self.read_binary(len)
            }
            format::BIN16 => {
                let len = usize::from(self.read_u16()?);
                self.read_binary(len)
            }
            format::BIN32 => {
                let len = self.read_len32()?;
                self.read_binary(len)
            }
            format::EXT8 => {
                let len = usize::from(self.read_u8()?);
                self.read_ext(len, start)
            }
            format::EXT16 => {
                let len = usize::from(self.read_u16()?);
                self.read_ext(len, start)
            }
            format::EXT32 => {
                let len = self.read_len32()?;
                self.read_ext(len, start)
            }
            format::FLOAT32 => self.read_f32(),
            format::FLOAT64 => {
                let bytes = self.read_array_bytes()?;
                Ok(Value::from(f64::from_be_bytes(bytes)))
            }
            format::UINT8 => Ok(Value::from(self.read_u8()?)),
            format::UINT16 => Ok(Value::from(self.read_u16()?)),
            format::UINT32 => Ok(Value::from(self.read_u32()?)),
            format::UINT64 => {
                let value = u64::from_be_bytes(self.read_array_bytes()?);
                Ok(self.uint64_value(value))
            }
            format::INT8 => Ok(Value::from(self.read_u8()? as i8)),
            format::INT16 => Ok(Value::from(i16::from_be_bytes(self.read_array_bytes()?))),
            format::INT32 => Ok(Value::from(i32::from_be_bytes(self.read_array_bytes()?))),
            format::INT64 => {
                let value = i64::from_be_bytes(self.read_array_bytes()?);
                Ok(self.int64_value(value))
            }
            format::FIXEXT1 => self.read_ext(1, start),
            format::FIXEXT2 => self.read_ext(2, start),
            format::FIXEXT4 => self.read_ext(4, start),
            format::FIXEXT8 => self.read_ext(8, start),
            format::FIXEXT16 => self.read_ext(16, start),
            format::STR8 => {
                let len = usize::from(self.read_u8()?);
                self.read_str(len).map(Value::String)
            }
            format::STR16 => {
                let len = usize::from(self.read_u16()?);
                self.read_str(len).map(Value::String)
            }
            format::STR32 => {
                let len = self.read_len32()?;
                self.read_str(len).map(Value::String)
            }
            format::ARRAY16 => {
                let len = usize::from(self.read_u16()?);
                self.read_array(len)
            }
            format::ARRAY32 => {
                let len = self.read_len32()?;
                self.read_array(len)
            }
            format::MAP16 => {
                let len = usize::from(self.read_u16()?);
                self.read_map(len)
            }
            format::MAP32 => {
                let len = self.read_len32()?;
                self.read_map(len)
            }
            0xe0..=0xff => Ok(Value::from(token as i8)),
        }
    }

    fn uint64_value(&self, value: u64) -> Value {
        match self.options.int64_mode {
            Int64Mode::Native => Value::from(value),
            Int64Mode::String => Value::String(value.to_string()),
            Int64Mode::AutoNarrow if value <= MAX_SAFE_INTEGER => {
                Value::Number(Number::Integer(value as i64))
            }
            Int64Mode::AutoNarrow | Int64Mode::Always64 => Value::BigInt(BigInt::from(value)),
        }
    }

    fn int64_value(&self, value: i64) -> Value {
        match self.options.int64_mode {
            Int64Mode::Native => Value::Number(Number::Integer(value)),
            Int64Mode::String => Value::String(value.to_string()),
            Int64Mode::AutoNarrow if value.unsigned_abs() <= MAX_SAFE_INTEGER => {
                Value::Number(Number::Integer(value))
            }
            Int64Mode::AutoNarrow | Int64Mode::Always64 => Value::BigInt(BigInt::from(value)),
        }
    }

    fn read_f32(&mut self) -> Result<Value> {
        let bytes = self.read_array_bytes()?;
        let value = f64::from(f32::from_be_bytes(bytes));
        if self.options.float32 != Float32Mode::Aggressive {
            return Ok(Value::from(value));
        }
        let multiplier = format::decimal_multiplier(format::float32_exponent(bytes));
        let half = if value > 0.0 { 0.5 } else { -0.5 };
        Ok(Value::from((multiplier * value + half).trunc() / multiplier))
    }

    fn read_str(&mut self, len: usize) -> Result<String> {
        let start = self.take(len)?;
        let bytes = &self.data[start..start + len];
        if len < MAX_CACHED_KEY && bytes.is_ascii() {
            return Ok(bytes.iter().copied().map(char::from).collect());
        }
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| Error::invalid_data(start, "string is not valid UTF-8"))
    }

    /// Reads a value that must be a plain string token.
    fn read_plain_str(&mut self) -> Result<String> {
        let start = self.pos;
        let token = self.read_u8()?;
        let len = match token {
            0xa0..=0xbf => usize::from(token & 0x1f),
            format::STR8 => usize::from(self.read_u8()?),
            format::STR16 => usize::from(self.read_u16()?),
            format::STR32 => self.read_len32()?,
            _ => return Err(Error::invalid_data(start, "expected a string")),
        };
        self.read_str(len)
    }

    fn read_binary(&mut self, len: usize) -> Result<Value> {
        let start = self.take(len)?;
        let data = if self.options.copy_on_read {
            Bytes::copy_from_slice(&self.data[start..start + len])
        } else {
            self.data.slice(start..start + len)
        };
        Ok(Value::Binary(data))
    }

    fn read_array(&mut self, len: usize) -> Result<Value> {
        let mut items = Vec::with_capacity(self.capacity_for(len));
        for _ in 0..len {
            items.push(self.read_value()?);
        }
        Ok(Value::Array(items))
    }

    fn read_map(&mut self, len: usize) -> Result<Value> {
        let mut entries = Vec::with_capacity(self.capacity_for(len));
        for _ in 0..len {
            let key = self.read_key()?;
            let value = self.read_value()?;
            entries.push((key, value));
        }
        if self.options.maps_as_objects && entries.iter().all(|(key, _)| is_scalar_key(key)) {
            let mut object = ObjectMap::with_capacity(entries.len());
            for (key, value) in entries {
                object.insert(scalar_key_string(key), value);
            }
            return Ok(Value::Object(object));
        }
        Ok(Value::Map(entries))
    }

    fn read_key(&mut self) -> Result<Value> {
        let start = self.pos;
        if let Some(&token) = self.data.get(start) {
            let len = usize::from(token & 0x1f);
            if token & 0xe0 == format::FIXSTR && len < MAX_CACHED_KEY && start < self.end {
                let begin = self.take(1 + len)? + 1;
                let bytes = &self.data[begin..begin + len];
                return self
                    .keys
                    .intern(bytes)
                    .map(Value::String)
                    .ok_or_else(|| Error::invalid_data(begin, "string is not valid UTF-8"));
            }
        }
        self.read_value()
    }

    fn read_record(&mut self, token: u8, start: usize) -> Result<Value> {
        let id = if self.two_byte && u16::from(token) >= TWO_BYTE_ID_BASE {
            let high = self.read_u8()?;
            record_id_from_bytes(token, high)
        } else {
            u16::from(token)
        };
        let keys = self.structure(id, start)?;
        self.read_record_values(&keys)
    }

    fn structure(&mut self, id: u16, offset: usize) -> Result<Arc<[String]>> {
        if let Some(keys) = self.table.get(id) {
            return Ok(keys);
        }
        if let Some(store) = self.store {
            if self.table.is_shared(id) && !self.store_reloaded {
                self.store_reloaded = true;
                debug!(id, "unknown shared structure, reloading from store");
                self.table.load_shared(store.get_structures());
                if let Some(keys) = self.table.get(id) {
                    return Ok(keys);
                }
            }
        }
        Err(Error::StructureNotDefined { id, offset })
    }

    fn read_record_values(&mut self, keys: &[String]) -> Result<Value> {
        let values = keys
            .iter()
            .map(|_| self.read_value())
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Object(ObjectMap::from_record(keys, values)))
    }

    fn read_ext(&mut self, len: usize, start: usize) -> Result<Value> {
        let ext_tag = self.read_u8()?;
        let payload_start = self.take(len)?;
        if let Some(extension) = self.extensions.custom(ext_tag) {
            let ctx = ExtensionContext::new(self.options, self.extensions);
            return extension.unpack(&self.data[payload_start..payload_start + len], &ctx);
        }
        let payload = &self.data[payload_start..payload_start + len];
        match ext_tag {
            tag::UNDEFINED => Ok(Value::Undefined),
            tag::BUNDLE => self.read_bundle(payload_start, len),
            tag::ERROR => self.read_error(),
            tag::REFERENCE_ID => {
                let id = self.reference_id(payload_start, len)?;
                let node = SharedValue::new(Value::Null);
                self.refs.insert(id, node.clone());
                let value = self.read_value()?;
                node.replace(value);
                Ok(Value::Shared(node))
            }
            tag::POINTER => {
                let id = self.reference_id(payload_start, len)?;
                self.refs
                    .get(&id)
                    .map(|node| Value::Shared(node.clone()))
                    .ok_or(Error::InvalidReference { id, offset: start })
            }
            tag::RECORD if self.options.use_records => {
                let one_byte_end = if self.two_byte {
                    TWO_BYTE_ID_BASE
                } else {
                    TWO_BYTE_ID_BASE + 0x20
                };
                let id = match *payload {
                    [id] if (RECORD_ID_BASE..one_byte_end).contains(&u16::from(id)) => {
                        u16::from(id)
                    }
                    [low, high]
                        if self.two_byte && u16::from(low) >= TWO_BYTE_ID_BASE && low < 0x80 =>
                    {
                        record_id_from_bytes(low, high)
                    }
                    _ => return Err(Error::invalid_data(payload_start, "invalid record id")),
                };
                self.read_record_definition(id)
            }
            tag::SET => match self.read_value()? {
                Value::Array(items) => Ok(Value::Set(items)),
                _ => Err(Error::invalid_data(start, "set payload must be an array")),
            },
            tag::TYPED_ARRAY => unpack_typed_array(payload)
                .map(Value::TypedArray)
                .ok_or_else(|| Error::invalid_data(payload_start, "invalid typed array")),
            tag::REGEXP => self.read_regexp(start),
            tag::TIMESTAMP => unpack_timestamp(payload)
                .map(Value::Date)
                .ok_or_else(|| Error::invalid_data(payload_start, "invalid timestamp")),
            _ => Err(Error::UnknownExtensionType {
                tag: ext_tag,
                offset: start,
            }),
        }
    }

    fn reference_id(&self, payload_start: usize, len: usize) -> Result<u32> {
        match self.data[payload_start..payload_start + len] {
            [a, b, c, d] => Ok(u32::from_be_bytes([a, b, c, d])),
            _ => Err(Error::invalid_data(payload_start, "reference id must be 4 bytes")),
        }
    }

    fn read_record_definition(&mut self, id: u16) -> Result<Value> {
        let start = self.pos;
        let keys: Arc<[String]> = match self.read_value()? {
            Value::Array(items) => items
                .into_iter()
                .map(|key| match key {
                    Value::String(key) => Ok(key),
                    _ => Err(Error::invalid_data(start, "record keys must be strings")),
                })
                .collect::<Result<Vec<_>>>()?
                .into(),
            _ => return Err(Error::invalid_data(start, "record definition must be an array")),
        };
        self.table.define(id, Arc::clone(&keys));
        self.read_record_values(&keys)
    }

    fn read_error(&mut self) -> Result<Value> {
        let start = self.pos;
        let Value::Array(items) = self.read_value()? else {
            return Err(Error::invalid_data(start, "error payload must be an array"));
        };
        let mut items = items.into_iter();
        let (Some(Value::String(name)), Some(Value::String(message))) = (items.next(), items.next())
        else {
            return Err(Error::invalid_data(start, "error name and message must be strings"));
        };
        let cause = items
            .next()
            .filter(|cause| !cause.is_undefined())
            .map(Box::new);
        Ok(Value::Error(ErrorValue {
            name,
            message,
            cause,
        }))
    }

    fn read_regexp(&mut self, start: usize) -> Result<Value> {
        match self.read_value()? {
            Value::Array(items) => match <[Value; 2]>::try_from(items) {
                Ok([Value::String(source), Value::String(flags)]) => {
                    Ok(Value::RegExp(RegExpValue { source, flags }))
                }
                _ => Err(Error::invalid_data(start, "regexp payload must be [source, flags]")),
            },
            _ => Err(Error::invalid_data(start, "regexp payload must be an array")),
        }
    }

    /// Loads the strings of a bundle and returns the value that follows its
    /// header.
    fn read_bundle(&mut self, field: usize, len: usize) -> Result<Value> {
        if len < 4 {
            return Err(Error::invalid_data(field, "bundle header too short"));
        }
        let mut offset = [0; 4];
        offset.copy_from_slice(&self.data[field..field + 4]);
        let target = field.saturating_add(u32::from_be_bytes(offset) as usize);
        if target > self.end {
            return Err(Error::incomplete(self.end, target - self.end));
        }
        let resume = self.pos;
        self.pos = target;
        let wide = self.read_plain_str()?;
        let ascii = self.read_plain_str()?;
        self.post_bundle = self.post_bundle.max(self.pos);
        self.bundle = Some(BundleStrings {
            wide,
            ascii,
            wide_pos: 0,
            ascii_pos: 0,
        });
        self.pos = resume;
        self.read_value()
    }

    fn read_bundled(&mut self, start: usize) -> Result<Value> {
        if self.bundle.is_none() {
            return Err(Error::UnknownToken {
                token: format::BUNDLE_REF,
                offset: start,
            });
        }
        let length = match self.read_value()? {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
        .ok_or_else(|| Error::invalid_data(start, "bundled string length must be an integer"))?;
        let Some(BundleStrings {
            wide,
            ascii,
            wide_pos,
            ascii_pos,
        }) = &mut self.bundle
        else {
            return Err(Error::invalid_data(start, "no active string bundle"));
        };
        let (source, cursor) = if length >= 0 {
            (ascii, ascii_pos)
        } else {
            (wide, wide_pos)
        };
        let begin = *cursor;
        let end = begin.saturating_add(length.unsigned_abs() as usize);
        let text = source
            .get(begin..end)
            .ok_or_else(|| Error::invalid_data(start, "bundled string out of range"))?;
        *cursor = end;
        Ok(Value::String(text.to_string()))
    }
}

fn is_scalar_key(key: &Value) -> bool {
    matches!(
        key,
        Value::String(_)
            | Value::Number(_)
            | Value::BigInt(_)
            | Value::Bool(_)
            | Value::Null
            | Value::Undefined
    )
}

fn scalar_key_string(key: Value) -> String {
    match key {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::BigInt(b) => b.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => "undefined".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packr;

    fn decode(bytes: &[u8]) -> Result<Value> {
        Unpacker::new().decode(bytes)
    }

    #[test]
    fn test_scalars() {
        assert_eq!(decode(&[0x05]).unwrap(), Value::from(5));
        assert_eq!(decode(&[0xff]).unwrap(), Value::from(-1));
        assert_eq!(decode(&[0xc0]).unwrap(), Value::Null);
        assert_eq!(decode(&[0xd4, 0x00, 0x00]).unwrap(), Value::Undefined);
        assert_eq!(decode(&[0xd0, 0x80]).unwrap(), Value::from(-128));
        assert_eq!(decode(&[0xa2, b'h', b'i']).unwrap(), Value::from("hi"));
    }

    #[test]
    fn test_record_bytes_need_records_enabled() {
        assert!(matches!(
            decode(&[0x41]),
            Err(Error::StructureNotDefined { id: 0x41, offset: 0 })
        ));
        let plain = Unpacker::with_options(Options::plain()).decode(&[0x41]).unwrap();
        assert_eq!(plain, Value::from(0x41));
    }

    #[test]
    fn test_record_definition_without_records_is_unknown() {
        let bytes = [0xd4, 0x72, 0x40, 0x91, 0xa1, b'a', 0x01];
        assert!(matches!(
            Unpacker::with_options(Options::plain()).decode(&bytes),
            Err(Error::UnknownExtensionType { tag: 0x72, .. })
        ));
        assert_eq!(decode(&bytes).unwrap(), packr!({ "a": 1 }));
    }

    #[test]
    fn test_two_byte_record_id() {
        // id 0x81 with the default (two-byte) pools
        let bytes = [0xd5, 0x72, 0x61, 0x01, 0x91, 0xa1, b'k', 0xc3];
        let mut unpacker = Unpacker::with_options(Options::new().with_sequential(true));
        assert_eq!(unpacker.decode(&bytes).unwrap(), packr!({ "k": true }));
        assert_eq!(unpacker.decode(&[0x61, 0x01, 0xc2]).unwrap(), packr!({ "k": false }));
    }

    #[test]
    fn test_record_definition_form_follows_id_width() {
        let one_byte = [0xd4, 0x72, 0x60, 0x91, 0xa1, b'k', 0x07];
        assert!(matches!(
            decode(&one_byte),
            Err(Error::InvalidData { offset: 2, .. })
        ));

        let narrow = Options::new()
            .with_max_shared_structures(16)
            .with_max_own_structures(48);
        assert_eq!(
            Unpacker::with_options(narrow.clone()).decode(&one_byte).unwrap(),
            packr!({ "k": 7 })
        );
        let two_byte = [0xd5, 0x72, 0x61, 0x01, 0x91, 0xa1, b'k', 0x07];
        assert!(matches!(
            Unpacker::with_options(narrow).decode(&two_byte),
            Err(Error::InvalidData { offset: 2, .. })
        ));
    }

    #[test]
    fn test_int64_modes() {
        let big = [0xcf, 0x00, 0x40, 0, 0, 0, 0, 0, 1];
        let value = (1u64 << 54) + 1;
        let decode_as = |mode| {
            Unpacker::with_options(Options::new().with_int64_mode(mode))
                .decode(&big)
                .unwrap()
        };
        assert_eq!(decode_as(Int64Mode::Native), Value::from(value));
        assert_eq!(decode_as(Int64Mode::String), Value::from(value.to_string()));
        assert_eq!(decode_as(Int64Mode::AutoNarrow), Value::BigInt(BigInt::from(value)));
        assert_eq!(decode_as(Int64Mode::Always64), Value::BigInt(BigInt::from(value)));

        let small = [0xd3, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe];
        let narrowed = Unpacker::with_options(Options::new().with_int64_mode(Int64Mode::AutoNarrow))
            .decode(&small)
            .unwrap();
        assert_eq!(narrowed, Value::from(-2));
    }

    #[test]
    fn test_maps_as_objects() {
        // {1: "a", null: "b"}
        let bytes = [0x82, 0x01, 0xa1, b'a', 0xc0, 0xa1, b'b'];
        let object = decode(&bytes).unwrap();
        assert_eq!(object.as_object().unwrap().get("1"), Some(&Value::from("a")));
        assert_eq!(object.as_object().unwrap().get("null"), Some(&Value::from("b")));

        let map = Unpacker::with_options(Options::new().with_maps_as_objects(false))
            .decode(&bytes)
            .unwrap();
        assert!(map.is_map());

        // compound key
        let compound = decode(&[0x81, 0x91, 0x01, 0x02]).unwrap();
        assert_eq!(
            compound,
            Value::Map(vec![(Value::from(vec![1]), Value::from(2))])
        );
    }

    #[test]
    fn test_key_cache_reuse() {
        let mut cache = KeyCache::default();
        assert_eq!(cache.intern(b"name").as_deref(), Some("name"));
        assert_eq!(cache.intern(b"name").as_deref(), Some("name"));
        assert_eq!(cache.intern(&[0xff]), None);
    }

    #[test]
    fn test_unknown_extension() {
        assert!(matches!(
            decode(&[0xd4, 0x10, 0x00]),
            Err(Error::UnknownExtensionType { tag: 0x10, offset: 0 })
        ));
    }

    #[test]
    fn test_bundle_ref_outside_bundle() {
        assert!(matches!(
            decode(&[0xc1]),
            Err(Error::UnknownToken { token: 0xc1, offset: 0 })
        ));
    }

    #[test]
    fn test_pointer_to_unknown_reference() {
        assert!(matches!(
            decode(&[0xd6, 0x70, 0, 0, 0, 9]),
            Err(Error::InvalidReference { id: 9, offset: 0 })
        ));
    }

    #[test]
    fn test_self_reference() {
        let bytes = [0xd6, 0x69, 0, 0, 0, 1, 0x91, 0xd6, 0x70, 0, 0, 0, 1];
        let value = decode(&bytes).unwrap();
        let node = value.as_shared().unwrap().clone();
        let first = node.borrow().as_array().unwrap()[0].clone();
        assert!(first.as_shared().unwrap().ptr_eq(&node));
        node.replace(Value::Null);
    }

    #[test]
    fn test_rollback_on_error() {
        let mut unpacker = Unpacker::new();
        // defines shared 0x40 then fails on an unknown token inside the values
        let broken = [0xd4, 0x72, 0x40, 0x91, 0xa1, b'a', 0xc1];
        assert!(unpacker.decode(&broken).is_err());
        assert!(matches!(
            unpacker.decode(&[0x40, 0x01]),
            Err(Error::StructureNotDefined { id: 0x40, .. })
        ));
    }

    #[test]
    fn test_rollback_on_trailing_data() {
        let mut unpacker = Unpacker::new();
        let bytes = [0xd4, 0x72, 0x40, 0x91, 0xa1, b'a', 0x01, 0x00];
        assert!(matches!(
            unpacker.decode(&bytes),
            Err(Error::TrailingData { offset: 7, remaining: 1 })
        ));
        assert!(unpacker.decode(&[0x40, 0x01]).is_err());
    }

    /// Runs `f` on a thread with the default 2 MiB test stack.
    fn on_small_stack(f: impl FnOnce() + Send + 'static) {
        std::thread::Builder::new()
            .stack_size(2 << 20)
            .spawn(f)
            .unwrap()
            .join()
            .unwrap();
    }

    fn nested(prefix: &[u8], levels: usize) -> Vec<u8> {
        let mut bytes = prefix.repeat(levels);
        bytes.push(0xc0);
        bytes
    }

    #[test]
    fn test_depth_limit() {
        on_small_stack(|| {
            let arrays = nested(&[0x91], format::MAX_DEPTH - 1);
            assert!(decode(&arrays).is_ok());
            let arrays = nested(&[0x91], format::MAX_DEPTH);
            assert!(matches!(decode(&arrays), Err(Error::InvalidData { .. })));

            let maps = nested(&[0x81, 0xa1, b'a'], format::MAX_DEPTH - 1);
            assert!(decode(&maps).is_ok());
            let maps = nested(&[0x81, 0xa1, b'a'], format::MAX_DEPTH);
            assert!(matches!(decode(&maps), Err(Error::InvalidData { .. })));

            // each set is an extension frame plus its array
            let sets = nested(&[0xd4, 0x73, 0x00, 0x91], format::MAX_DEPTH / 2);
            assert!(matches!(decode(&sets), Err(Error::InvalidData { .. })));

            let hostile = nested(&[0x81, 0xa1, b'a'], 100_000);
            assert!(matches!(decode(&hostile), Err(Error::InvalidData { .. })));
        });
    }

    #[test]
    fn test_binary_slices_input() {
        let data = Bytes::from_static(&[0xc4, 0x02, 0xaa, 0xbb]);
        let value = Unpacker::new().decode_bytes(data.clone()).unwrap();
        let binary = value.as_binary().unwrap();
        assert_eq!(&binary[..], &[0xaa, 0xbb]);
        assert_eq!(binary.as_ptr(), data[2..].as_ptr());

        let copied = Unpacker::with_options(Options::new().with_copy_on_read(true))
            .decode_bytes(data.clone())
            .unwrap();
        assert_ne!(copied.as_binary().unwrap().as_ptr(), data[2..].as_ptr());
    }

    #[test]
    fn test_aggressive_float32_rounding() {
        let bytes = [0xca, 0x3d, 0xcc, 0xcc, 0xcd]; // 0.1f32
        let plain = decode(&bytes).unwrap();
        assert_ne!(plain, Value::from(0.1));
        let rounded = Unpacker::with_options(Options::new().with_float32(Float32Mode::Aggressive))
            .decode(&bytes)
            .unwrap();
        assert_eq!(rounded, Value::from(0.1));
    }

    #[test]
    fn test_decode_multiple_stops_after_error() {
        let mut unpacker = Unpacker::new();
        let results: Vec<_> = unpacker.decode_multiple(&[0x01, 0xc1, 0x02]).collect();
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }
}
