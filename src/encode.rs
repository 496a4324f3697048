//! Encoding [`Value`]s into packr bytes.
//!
//! A [`Packer`] is one encoding session. It owns the shape trie, the shared
//! structure pool and the extension registry; everything else (output buffer,
//! reference table, string bundle) lives for one call only.
//!
//! ## Examples
//!
//! ```rust
//! use serde_packr::{packr, Packer};
//!
//! let mut packer = Packer::new();
//! let first = packer.encode(&packr!({ "a": 1, "b": 2 })).unwrap();
//! let second = packer.encode(&packr!({ "a": 3, "b": 4 })).unwrap();
//!
//! // the record definition is only written once per session
//! assert_eq!(second, [0x40, 0x03, 0x04]);
//! assert!(second.len() < first.len());
//! ```

use crate::error::{Error, Result};
use crate::extension::{pack_timestamp, pack_typed_array, ExtensionContext, ExtensionRegistry};
use crate::format::{self, tag};
use crate::options::{Float32Mode, Options};
use crate::structures::{record_id_bytes, RecordShapes, StructureStore};
use crate::value::{ErrorValue, Number, RegExpValue, SharedValue, Value};
use crate::{Extension, ObjectMap};
use num_bigint::{BigInt, Sign};
use std::collections::HashMap;
use tracing::debug;

/// How many times an encode is repeated after the structure store refused
/// a save.
const MAX_SAVE_ATTEMPTS: usize = 3;

/// Initial output capacity.
const INITIAL_CAPACITY: usize = 0x2000;

/// Size of an inserted reference header: `d6 69 <u32 id>`.
const REFERENCE_HEADER_LEN: usize = 6;

type SharePredicate = Box<dyn Fn(&[String]) -> bool>;

/// An encoding session.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{Options, Packer, SharedValue, Value};
///
/// let node = SharedValue::new(Value::Array(vec![]));
/// node.push(Value::Shared(node.clone()));
///
/// let mut packer = Packer::with_options(Options::new().with_structured_clone(true));
/// let bytes = packer.encode(&Value::Shared(node.clone())).unwrap();
/// assert_eq!(&bytes[..2], &[0xd6, 0x69]);
/// node.replace(Value::Null);
/// ```
pub struct Packer {
    options: Options,
    extensions: ExtensionRegistry,
    shapes: RecordShapes,
    store: Option<Box<dyn StructureStore>>,
    store_loaded: bool,
    share: Option<SharePredicate>,
}

impl Default for Packer {
    fn default() -> Self {
        Self::with_options(Options::default())
    }
}

impl Packer {
    /// Creates a session with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session with custom options.
    #[must_use]
    pub fn with_options(options: Options) -> Self {
        Packer {
            shapes: RecordShapes::new(&options),
            options,
            extensions: ExtensionRegistry::new(),
            store: None,
            store_loaded: false,
            share: None,
        }
    }

    /// Replaces the extension registry.
    #[must_use]
    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    /// Persists shared structures through `store`.
    #[must_use]
    pub fn with_structure_store<S: StructureStore + 'static>(mut self, store: S) -> Self {
        self.store = Some(Box::new(store));
        self.store_loaded = false;
        self
    }

    /// Decides which new shapes may enter the shared pool; the others go to
    /// the per-buffer ring.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_packr::{packr, Packer};
    ///
    /// let mut packer = Packer::new().with_share_predicate(|keys| keys.len() > 1);
    /// packer.encode(&packr!({ "only": 1 })).unwrap();
    /// packer.encode(&packr!({ "a": 1, "b": 2 })).unwrap();
    /// assert_eq!(packer.shared_structures().len(), 1);
    /// ```
    #[must_use]
    pub fn with_share_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[String]) -> bool + 'static,
    {
        self.share = Some(Box::new(predicate));
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

    /// Shared structures known to this session, in id order.
    #[must_use]
    pub fn shared_structures(&self) -> &[Vec<String>] {
        self.shapes.shared()
    }

    /// Encodes one value.
    ///
    /// On error nothing is returned and the session's structures are left as
    /// they were before the call.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedType`] for a cycle without structured clone, or an
    ///   extension value using a built-in tag
    /// - [`Error::IntegerOverflow`] for a big integer outside 64 bits
    /// - [`Error::BufferLimitExceeded`] when the output outgrows
    ///   `max_buffer_size`
    pub fn encode(&mut self, value: &Value) -> Result<Vec<u8>> {
        self.load_store();
        let mut attempts = 0;
        loop {
            self.shapes.compact_if_needed();
            let snapshot = self.shapes.snapshot();
            let bytes = match self.encode_once(value) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(error = %err, "encode failed, restoring structures");
                    self.shapes.restore(snapshot);
                    return Err(err);
                }
            };
            if !self.options.sequential {
                self.shapes.clear_own();
            }
            if !self.shapes.has_unsaved() {
                return Ok(bytes);
            }
            let Some(store) = &self.store else {
                self.shapes.mark_saved();
                return Ok(bytes);
            };
            if store.save_structures(self.shapes.shared(), self.shapes.saved_len()) {
                debug!(count = self.shapes.shared().len(), "saved shared structures");
                self.shapes.mark_saved();
                return Ok(bytes);
            }
            attempts += 1;
            if attempts >= MAX_SAVE_ATTEMPTS {
                debug!(attempts, "giving up on saving shared structures");
                let structures = store.get_structures();
                self.shapes.load_shared(structures);
                return Ok(bytes);
            }
            debug!(attempts, "structure store changed, re-encoding");
            self.shapes.restore(snapshot);
            let structures = store.get_structures();
            self.shapes.load_shared(structures);
        }
    }

    fn load_store(&mut self) {
        if self.store_loaded {
            return;
        }
        self.store_loaded = true;
        if let Some(store) = &self.store {
            let structures = store.get_structures();
            self.shapes.load_shared(structures);
        }
    }

    fn encode_once(&mut self, value: &Value) -> Result<Vec<u8>> {
        let bundle = (self.options.bundle_strings && !value.is_string()).then(Bundle::new);
        let mut encoder = Encoder {
            out: OutputBuffer::new(self.options.max_buffer_size),
            options: &self.options,
            extensions: &self.extensions,
            shapes: &mut self.shapes,
            share: self.share.as_deref(),
            two_byte: self.options.use_two_byte_records(),
            referees: HashMap::new(),
            next_reference: 0,
            visiting: Vec::new(),
            depth: 0,
            bundle,
            bundle_fields: Vec::new(),
        };
        encoder.encode_value(value)?;
        encoder.finish()
    }
}

/// Output bytes with explicit growth.
///
/// Positions are indices from the start of the buffer, so offsets recorded
/// during encoding stay valid across reallocations.
pub(crate) struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
}

impl OutputBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        OutputBuffer {
            bytes: Vec::with_capacity(INITIAL_CAPACITY.min(limit)),
            limit,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Makes room for `additional` more bytes.
    pub(crate) fn reserve(&mut self, additional: usize) -> Result<()> {
        let required = self.bytes.len().saturating_add(additional);
        if required > self.limit {
            return Err(Error::BufferLimitExceeded {
                required,
                limit: self.limit,
            });
        }
        if required > self.bytes.capacity() {
            let capacity = grown_capacity(self.bytes.capacity(), required).min(self.limit);
            debug!(from = self.bytes.capacity(), to = capacity, "growing output buffer");
            self.bytes.reserve_exact(capacity - self.bytes.len());
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, byte: u8) -> Result<()> {
        self.reserve(1)?;
        self.bytes.push(byte);
        Ok(())
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn patch_u16(&mut self, pos: usize, value: u16) {
        self.bytes[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub(crate) fn patch_u32(&mut self, pos: usize, value: u32) {
        self.bytes[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn read_u32(&self, pos: usize) -> u32 {
        let mut word = [0; 4];
        word.copy_from_slice(&self.bytes[pos..pos + 4]);
        u32::from_be_bytes(word)
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

/// Capacity for a buffer that must hold `required` bytes.
fn grown_capacity(capacity: usize, required: usize) -> usize {
    const PAGE: usize = 0x1000;
    if required <= 0x100_0000 {
        let target = required.saturating_mul(4).max(capacity.saturating_sub(1));
        ((target >> 12) + 1) << 12
    } else {
        let scaled = if required > 0x400_0000 {
            required.saturating_add(required / 4)
        } else {
            required.saturating_mul(2)
        };
        let target = scaled.max(0x40_0000);
        target.saturating_add(PAGE / 2) / PAGE * PAGE
    }
}

struct Referee {
    offset: usize,
    order: usize,
    id: Option<u32>,
}

/// Strings collected for the current out-of-line bundle.
struct Bundle {
    wide: String,
    ascii: String,
    size: usize,
    /// Position of the current bundle's 4-byte offset field.
    field: Option<usize>,
}

impl Bundle {
    fn new() -> Self {
        Bundle {
            wide: String::new(),
            ascii: String::new(),
            // the first bundled string opens a bundle
            size: usize::MAX,
            field: None,
        }
    }
}

/// State of one top-level encode.
struct Encoder<'p> {
    out: OutputBuffer,
    options: &'p Options,
    extensions: &'p ExtensionRegistry,
    shapes: &'p mut RecordShapes,
    share: Option<&'p dyn Fn(&[String]) -> bool>,
    two_byte: bool,
    referees: HashMap<usize, Referee>,
    next_reference: u32,
    visiting: Vec<usize>,
    depth: usize,
    bundle: Option<Bundle>,
    /// Bundle offset fields with the position they point at.
    bundle_fields: Vec<(usize, usize)>,
}

impl<'p> Encoder<'p> {
    fn encode_value(&mut self, value: &Value) -> Result<()> {
        self.descend(|encoder| encoder.encode_token(value))
    }

    /// Runs `f` one frame deeper. Frames are counted the way the decoder
    /// counts them, so nothing is written that it would refuse to read.
    fn descend(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        self.ensure_depth(1)?;
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn ensure_depth(&self, levels: usize) -> Result<()> {
        if self.depth + levels > format::MAX_DEPTH {
            return Err(Error::UnsupportedType(format!(
                "value nested deeper than {} levels",
                format::MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn encode_token(&mut self, value: &Value) -> Result<()> {
        if let Value::Shared(node) = value {
            return self.encode_shared(node);
        }
        if self.extensions.has_custom() && self.encode_custom(value)? {
            return Ok(());
        }
        match value {
            Value::Undefined => self.write_fixext1(tag::UNDEFINED),
            Value::Null => self.out.push(format::NIL),
            Value::Bool(b) => self.out.push(if *b { format::TRUE } else { format::FALSE }),
            Value::Number(n) => self.write_number(*n),
            Value::BigInt(b) => self.write_bigint(b),
            Value::String(s) => self.write_string(s),
            Value::Binary(data) => self.write_binary(data),
            Value::Array(items) => self.write_array(items),
            Value::Object(object) => self.write_object(object),
            Value::Map(entries) => self.write_map(entries),
            Value::Date(date) => self.write_ext(tag::TIMESTAMP, &pack_timestamp(date)),
            Value::Set(items) => {
                self.write_fixext1(tag::SET)?;
                self.descend(|encoder| encoder.write_array(items))
            }
            Value::Error(error) => self.write_error(error),
            Value::RegExp(regexp) => self.write_regexp(regexp),
            Value::TypedArray(array) => self.write_ext(tag::TYPED_ARRAY, &pack_typed_array(array)),
            Value::Ext(ext) => {
                if self.extensions.is_builtin(ext.tag) {
                    return Err(Error::UnsupportedType(format!(
                        "extension value with built-in tag 0x{:02x}",
                        ext.tag
                    )));
                }
                self.write_ext(ext.tag, &ext.data)
            }
            Value::Shared(_) => Ok(()),
        }
    }

    fn encode_custom(&mut self, value: &Value) -> Result<bool> {
        let extensions = self.extensions;
        let ctx = ExtensionContext::new(self.options, extensions);
        for extension in extensions.customs() {
            if let Some(payload) = extension.pack(value, &ctx)? {
                self.write_ext(extension.tag(), &payload)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn encode_shared(&mut self, node: &SharedValue) -> Result<()> {
        let addr = node.addr();
        if self.options.structured_clone {
            if let Some(referee) = self.referees.get_mut(&addr) {
                let id = match referee.id {
                    Some(id) => id,
                    None => {
                        self.next_reference += 1;
                        referee.id = Some(self.next_reference);
                        self.next_reference
                    }
                };
                let [a, b, c, d] = id.to_be_bytes();
                return self.out.extend(&[format::FIXEXT4, tag::POINTER, a, b, c, d]);
            }
            let order = self.referees.len();
            self.referees.insert(
                addr,
                Referee {
                    offset: self.out.len(),
                    order,
                    id: None,
                },
            );
            let content = node
                .try_borrow()
                .ok_or_else(|| Error::unsupported_type("shared value is mutably borrowed"))?;
            self.encode_value(&content)
        } else {
            if self.visiting.contains(&addr) {
                return Err(Error::unsupported_type(
                    "cyclic structure (enable structured clone to encode cycles)",
                ));
            }
            let content = node
                .try_borrow()
                .ok_or_else(|| Error::unsupported_type("shared value is mutably borrowed"))?;
            self.visiting.push(addr);
            // no reference header, so the content takes this frame
            let result = self.encode_token(&content);
            self.visiting.pop();
            result
        }
    }

    fn write_number(&mut self, number: Number) -> Result<()> {
        match number {
            Number::Integer(i) => self.write_int(i),
            Number::Unsigned(u) => self.write_uint(u),
            Number::Float(f) => self.write_float(f),
            Number::Infinity => self.write_f64(f64::INFINITY),
            Number::NegativeInfinity => self.write_f64(f64::NEG_INFINITY),
            Number::NaN => self.write_f64(f64::NAN),
        }
    }

    fn write_int(&mut self, value: i64) -> Result<()> {
        if value >= 0 {
            return self.write_uint(value as u64);
        }
        if value >= -32 {
            self.out.push(value as u8)
        } else if value >= i64::from(i8::MIN) {
            self.out.extend(&[format::INT8, value as u8])
        } else if value >= i64::from(i16::MIN) {
            self.write_tagged(format::INT16, &(value as i16).to_be_bytes())
        } else if value >= i64::from(i32::MIN) {
            self.write_tagged(format::INT32, &(value as i32).to_be_bytes())
        } else {
            self.write_tagged(format::INT64, &value.to_be_bytes())
        }
    }

    fn write_uint(&mut self, value: u64) -> Result<()> {
        if value < 0x40 || (value < 0x80 && !self.options.use_records) {
            self.out.push(value as u8)
        } else if value <= u64::from(u8::MAX) {
            self.out.extend(&[format::UINT8, value as u8])
        } else if value <= u64::from(u16::MAX) {
            self.write_tagged(format::UINT16, &(value as u16).to_be_bytes())
        } else if value <= u64::from(u32::MAX) {
            self.write_tagged(format::UINT32, &(value as u32).to_be_bytes())
        } else {
            self.write_tagged(format::UINT64, &value.to_be_bytes())
        }
    }

    fn write_float(&mut self, value: f64) -> Result<()> {
        let narrow = value as f32;
        let use_f32 = match self.options.float32 {
            Float32Mode::Off => false,
            Float32Mode::RoundTripSafe => f64::from(narrow) == value,
            Float32Mode::Aggressive => {
                (-2_147_483_648.0..4_294_967_296.0).contains(&value) && {
                    let exponent = format::float32_exponent(narrow.to_be_bytes());
                    let shifted = value * format::decimal_multiplier(exponent);
                    shifted.fract() == 0.0
                        && shifted >= f64::from(i32::MIN)
                        && shifted <= f64::from(i32::MAX)
                }
            }
        };
        if use_f32 {
            self.write_tagged(format::FLOAT32, &narrow.to_be_bytes())
        } else {
            self.write_f64(value)
        }
    }

    fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_tagged(format::FLOAT64, &value.to_be_bytes())
    }

    fn write_bigint(&mut self, value: &BigInt) -> Result<()> {
        if let Ok(i) = i64::try_from(value) {
            return self.write_tagged(format::INT64, &i.to_be_bytes());
        }
        if let Ok(u) = u64::try_from(value) {
            return self.write_tagged(format::UINT64, &u.to_be_bytes());
        }
        if self.options.large_bigint_to_float {
            return self.write_f64(bigint_to_f64(value));
        }
        Err(Error::IntegerOverflow(value.to_string()))
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        let len = value.len();
        if self.bundle.is_some()
            && (format::MIN_BUNDLE_STRING..format::MAX_BUNDLE_STRING).contains(&len)
        {
            // bundle header and length prefix
            self.ensure_depth(2)?;
            return self.write_bundled(value);
        }
        self.write_str(value)
    }

    /// Writes a plain string, never bundled.
    fn write_str(&mut self, value: &str) -> Result<()> {
        let len = value.len();
        self.out.reserve(len + 5)?;
        if len < 0x20 {
            self.out.push(format::FIXSTR | len as u8)?;
        } else if len <= usize::from(u8::MAX) {
            self.out.extend(&[format::STR8, len as u8])?;
        } else if len <= usize::from(u16::MAX) {
            self.write_tagged(format::STR16, &(len as u16).to_be_bytes())?;
        } else {
            let len = u32::try_from(len)
                .map_err(|_| Error::unsupported_type("string longer than 4 GiB"))?;
            self.write_tagged(format::STR32, &len.to_be_bytes())?;
        }
        self.out.extend(value.as_bytes())
    }

    fn write_bundled(&mut self, value: &str) -> Result<()> {
        let len = value.len();
        let needs_new_bundle = match &mut self.bundle {
            Some(bundle) => {
                bundle.size = bundle.size.saturating_add(len);
                bundle.size > format::MAX_BUNDLE_SIZE
            }
            None => false,
        };
        if needs_new_bundle {
            self.open_bundle()?;
        }
        let Some(bundle) = &mut self.bundle else {
            return self.write_str(value);
        };
        let length = if value.is_ascii() {
            bundle.ascii.push_str(value);
            len as i64
        } else {
            bundle.wide.push_str(value);
            -(len as i64)
        };
        self.out.push(format::BUNDLE_REF)?;
        self.write_int(length)
    }

    /// Starts a new bundle, flushing the previous one inside its header.
    fn open_bundle(&mut self) -> Result<()> {
        let Some(mut bundle) = self.bundle.take() else {
            return Ok(());
        };
        match bundle.field {
            Some(previous) => {
                self.out.push(format::EXT16)?;
                let length_pos = self.out.len();
                self.out.extend(&[0, 0, tag::BUNDLE])?;
                let field = self.out.len();
                self.out.extend(&[0; 4])?;
                self.write_bundle_strings(previous, &bundle)?;
                let length = u16::try_from(self.out.len() - field)
                    .map_err(|_| Error::unsupported_type("string bundle too large"))?;
                self.out.patch_u16(length_pos, length);
                bundle.field = Some(field);
            }
            None => {
                self.out.extend(&[format::FIXEXT4, tag::BUNDLE])?;
                bundle.field = Some(self.out.len());
                self.out.extend(&[0; 4])?;
            }
        }
        bundle.wide.clear();
        bundle.ascii.clear();
        bundle.size = 0;
        self.bundle = Some(bundle);
        Ok(())
    }

    /// Points `field` at the current position and writes the bundle strings.
    fn write_bundle_strings(&mut self, field: usize, bundle: &Bundle) -> Result<()> {
        let target = self.out.len();
        self.out.patch_u32(field, offset_u32(target - field)?);
        self.bundle_fields.push((field, target));
        self.write_str(&bundle.wide)?;
        self.write_str(&bundle.ascii)
    }

    fn write_binary(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len();
        self.out.reserve(len + 5)?;
        if len <= usize::from(u8::MAX) {
            self.out.extend(&[format::BIN8, len as u8])?;
        } else if len <= usize::from(u16::MAX) {
            self.write_tagged(format::BIN16, &(len as u16).to_be_bytes())?;
        } else {
            let len = u32::try_from(len)
                .map_err(|_| Error::unsupported_type("binary longer than 4 GiB"))?;
            self.write_tagged(format::BIN32, &len.to_be_bytes())?;
        }
        self.out.extend(data)
    }

    fn write_array_header(&mut self, len: usize) -> Result<()> {
        if len < 0x10 {
            self.out.push(format::FIXARRAY | len as u8)
        } else if len <= usize::from(u16::MAX) {
            self.write_tagged(format::ARRAY16, &(len as u16).to_be_bytes())
        } else {
            let len = u32::try_from(len)
                .map_err(|_| Error::unsupported_type("array longer than 2^32 items"))?;
            self.write_tagged(format::ARRAY32, &len.to_be_bytes())
        }
    }

    fn write_map_header(&mut self, len: usize) -> Result<()> {
        if len < 0x10 {
            self.out.push(format::FIXMAP | len as u8)
        } else if len <= usize::from(u16::MAX) {
            self.write_tagged(format::MAP16, &(len as u16).to_be_bytes())
        } else {
            let len = u32::try_from(len)
                .map_err(|_| Error::unsupported_type("map larger than 2^32 entries"))?;
            self.write_tagged(format::MAP32, &len.to_be_bytes())
        }
    }

    fn write_array(&mut self, items: &[Value]) -> Result<()> {
        self.write_array_header(items.len())?;
        for item in items {
            self.encode_value(item)?;
        }
        Ok(())
    }

    fn write_map(&mut self, entries: &[(Value, Value)]) -> Result<()> {
        self.write_map_header(entries.len())?;
        for (key, value) in entries {
            self.encode_value(key)?;
            self.encode_value(value)?;
        }
        Ok(())
    }

    fn write_plain_object(&mut self, object: &ObjectMap) -> Result<()> {
        self.write_map_header(object.len())?;
        for (key, value) in object {
            self.write_str(key)?;
            self.encode_value(value)?;
        }
        Ok(())
    }

    fn write_object(&mut self, object: &ObjectMap) -> Result<()> {
        if !self.options.use_records || object.is_empty() {
            return self.write_plain_object(object);
        }
        let node = self.shapes.node_for(object.shape());
        match self.shapes.id_of(node) {
            Some(id) => self.write_record_id(id)?,
            None => {
                let keys: Vec<String> = object.keys().cloned().collect();
                let share = self.shapes.has_shared_room() && self.share.map_or(true, |f| f(&keys));
                match self.shapes.allocate(node, keys, share) {
                    Some(id) => self.write_record_definition(id, object)?,
                    None => return self.write_plain_object(object),
                }
            }
        }
        for value in object.values() {
            self.encode_value(value)?;
        }
        Ok(())
    }

    fn write_record_id(&mut self, id: u16) -> Result<()> {
        let (bytes, len) = record_id_bytes(id, self.two_byte);
        self.out.extend(&bytes[..len])
    }

    fn write_record_definition(&mut self, id: u16, object: &ObjectMap) -> Result<()> {
        let (bytes, len) = record_id_bytes(id, self.two_byte);
        if len == 1 {
            self.out.extend(&[format::FIXEXT1, tag::RECORD, bytes[0]])?;
        } else {
            self.out
                .extend(&[format::FIXEXT2, tag::RECORD, bytes[0], bytes[1]])?;
        }
        self.ensure_depth(2)?;
        self.write_array_header(object.len())?;
        for key in object.keys() {
            self.write_str(key)?;
        }
        Ok(())
    }

    fn write_error(&mut self, error: &ErrorValue) -> Result<()> {
        self.write_fixext1(tag::ERROR)?;
        self.descend(|encoder| {
            encoder.write_array_header(3)?;
            encoder.descend(|encoder| encoder.write_string(&error.name))?;
            encoder.descend(|encoder| encoder.write_string(&error.message))?;
            match &error.cause {
                Some(cause) => encoder.encode_value(cause),
                None => encoder.descend(|encoder| encoder.write_fixext1(tag::UNDEFINED)),
            }
        })
    }

    fn write_regexp(&mut self, regexp: &RegExpValue) -> Result<()> {
        self.write_fixext1(tag::REGEXP)?;
        self.descend(|encoder| {
            encoder.write_array_header(2)?;
            encoder.descend(|encoder| encoder.write_string(&regexp.source))?;
            encoder.descend(|encoder| encoder.write_string(&regexp.flags))
        })
    }

    /// `d4 <tag> 00`: an extension whose value follows in the stream.
    fn write_fixext1(&mut self, ext_tag: u8) -> Result<()> {
        self.out.extend(&[format::FIXEXT1, ext_tag, 0])
    }

    fn write_ext(&mut self, ext_tag: u8, payload: &[u8]) -> Result<()> {
        let len = payload.len();
        self.out.reserve(len + 6)?;
        match len {
            1 => self.out.extend(&[format::FIXEXT1, ext_tag])?,
            2 => self.out.extend(&[format::FIXEXT2, ext_tag])?,
            4 => self.out.extend(&[format::FIXEXT4, ext_tag])?,
            8 => self.out.extend(&[format::FIXEXT8, ext_tag])?,
            16 => self.out.extend(&[format::FIXEXT16, ext_tag])?,
            _ if len <= usize::from(u8::MAX) => {
                self.out.extend(&[format::EXT8, len as u8, ext_tag])?
            }
            _ if len <= usize::from(u16::MAX) => {
                let [hi, lo] = (len as u16).to_be_bytes();
                self.out.extend(&[format::EXT16, hi, lo, ext_tag])?
            }
            _ => {
                let len = u32::try_from(len)
                    .map_err(|_| Error::unsupported_type("extension payload larger than 4 GiB"))?;
                self.write_tagged(format::EXT32, &len.to_be_bytes())?;
                self.out.push(ext_tag)?
            }
        }
        self.out.extend(payload)
    }

    fn write_tagged(&mut self, token: u8, bytes: &[u8]) -> Result<()> {
        self.out.reserve(1 + bytes.len())?;
        self.out.push(token)?;
        self.out.extend(bytes)
    }

    /// Flushes the open bundle and inserts reference headers.
    fn finish(mut self) -> Result<Vec<u8>> {
        if let Some(bundle) = self.bundle.take() {
            if let Some(field) = bundle.field {
                self.write_bundle_strings(field, &bundle)?;
            }
        }
        self.insert_reference_headers()
    }

    fn insert_reference_headers(mut self) -> Result<Vec<u8>> {
        let mut targets: Vec<(usize, usize, u32)> = self
            .referees
            .values()
            .filter_map(|r| r.id.map(|id| (r.offset, r.order, id)))
            .collect();
        if targets.is_empty() {
            return Ok(self.out.into_vec());
        }
        targets.sort_unstable();

        let extra = targets.len() * REFERENCE_HEADER_LEN;
        let required = self.out.len().saturating_add(extra);
        if required > self.out.limit {
            return Err(Error::BufferLimitExceeded {
                required,
                limit: self.out.limit,
            });
        }

        // bundle offsets spanning an insertion point grow with it
        for &(field, target) in &self.bundle_fields {
            let spanned = targets
                .iter()
                .filter(|(offset, _, _)| field < *offset && *offset <= target)
                .count();
            if spanned > 0 {
                let value = self.out.read_u32(field) as usize + spanned * REFERENCE_HEADER_LEN;
                self.out.patch_u32(field, offset_u32(value)?);
            }
        }

        let source = self.out.into_vec();
        let mut bytes = Vec::with_capacity(required);
        let mut copied = 0;
        for (offset, _, id) in targets {
            bytes.extend_from_slice(&source[copied..offset]);
            bytes.extend_from_slice(&[format::FIXEXT4, tag::REFERENCE_ID]);
            bytes.extend_from_slice(&id.to_be_bytes());
            copied = offset;
        }
        bytes.extend_from_slice(&source[copied..]);
        Ok(bytes)
    }
}

fn offset_u32(offset: usize) -> Result<u32> {
    u32::try_from(offset).map_err(|_| Error::unsupported_type("bundle offset beyond 4 GiB"))
}

/// Nearest float to a big integer.
fn bigint_to_f64(value: &BigInt) -> f64 {
    let (sign, digits) = value.to_u64_digits();
    let magnitude = digits
        .iter()
        .rev()
        .fold(0.0, |acc, digit| acc * 18_446_744_073_709_551_616.0 + *digit as f64);
    if sign == Sign::Minus {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packr;

    fn encode_plain(value: &Value) -> Vec<u8> {
        Packer::with_options(Options::plain()).encode(value).unwrap()
    }

    #[test]
    fn test_minimal_integers() {
        assert_eq!(encode_plain(&Value::from(0x7f)), vec![0x7f]);
        assert_eq!(encode_plain(&Value::from(0x80)), vec![0xcc, 0x80]);
        assert_eq!(encode_plain(&Value::from(0x100)), vec![0xcd, 0x01, 0x00]);
        assert_eq!(encode_plain(&Value::from(-32)), vec![0xe0]);
        assert_eq!(encode_plain(&Value::from(-33)), vec![0xd0, 0xdf]);
        assert_eq!(
            encode_plain(&Value::from(0x1_0000_0000i64)),
            vec![0xcf, 0, 0, 0, 1, 0, 0, 0, 0]
        );
        assert_eq!(encode_plain(&Value::from(u64::MAX))[0], 0xcf);
        assert_eq!(encode_plain(&Value::from(i64::MIN))[0], 0xd3);
    }

    #[test]
    fn test_record_range_integers_are_widened() {
        let mut packer = Packer::new();
        assert_eq!(packer.encode(&Value::from(0x3f)).unwrap(), vec![0x3f]);
        assert_eq!(packer.encode(&Value::from(0x40)).unwrap(), vec![0xcc, 0x40]);
        assert_eq!(packer.encode(&Value::from(0x7f)).unwrap(), vec![0xcc, 0x7f]);
    }

    #[test]
    fn test_float_modes() {
        assert_eq!(encode_plain(&Value::from(1.5))[0], 0xcb);

        let mut safe = Packer::with_options(Options::plain().with_float32(Float32Mode::RoundTripSafe));
        assert_eq!(safe.encode(&Value::from(1.5)).unwrap(), vec![0xca, 0x3f, 0xc0, 0, 0]);
        assert_eq!(safe.encode(&Value::from(0.1)).unwrap()[0], 0xcb);

        let mut aggressive =
            Packer::with_options(Options::plain().with_float32(Float32Mode::Aggressive));
        assert_eq!(aggressive.encode(&Value::from(0.1)).unwrap()[0], 0xca);
        assert_eq!(aggressive.encode(&Value::from(1e20)).unwrap()[0], 0xcb);
        assert_eq!(aggressive.encode(&Value::from(f64::NAN)).unwrap()[0], 0xcb);
    }

    #[test]
    fn test_bigint_forms() {
        let small = Value::BigInt(BigInt::from(-5));
        assert_eq!(encode_plain(&small), vec![0xd3, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfb]);

        let huge = Value::BigInt(BigInt::from(u64::MAX) * 4);
        assert!(matches!(
            Packer::new().encode(&huge),
            Err(Error::IntegerOverflow(_))
        ));
        let bytes = Packer::with_options(Options::new().with_large_bigint_to_float(true))
            .encode(&huge)
            .unwrap();
        assert_eq!(bytes[0], 0xcb);
        assert_eq!(bigint_to_f64(&(BigInt::from(u64::MAX) * 4)), 7.378697629483821e19);
    }

    #[test]
    fn test_record_definition_then_reference() {
        let mut packer = Packer::new();
        let first = packer.encode(&packr!({ "a": 1, "b": 2 })).unwrap();
        assert_eq!(
            first,
            vec![0xd4, 0x72, 0x40, 0x92, 0xa1, b'a', 0xa1, b'b', 0x01, 0x02]
        );
        let second = packer.encode(&packr!({ "a": 3, "b": 4 })).unwrap();
        assert_eq!(second, vec![0x40, 0x03, 0x04]);
    }

    #[test]
    fn test_own_structures_are_per_buffer() {
        let options = Options::new().with_max_shared_structures(0);
        let mut packer = Packer::with_options(options.clone());
        let first = packer.encode(&packr!({ "x": 1 })).unwrap();
        let second = packer.encode(&packr!({ "x": 1 })).unwrap();
        assert_eq!(first, second);

        let mut sequential = Packer::with_options(options.with_sequential(true));
        let first = sequential.encode(&packr!({ "x": 1 })).unwrap();
        let second = sequential.encode(&packr!({ "x": 1 })).unwrap();
        assert!(second.len() < first.len());
    }

    #[test]
    fn test_empty_object_is_a_map() {
        assert_eq!(Packer::new().encode(&packr!({})).unwrap(), vec![0x80]);
    }

    #[test]
    fn test_cycle_without_structured_clone() {
        let node = SharedValue::new(Value::Array(vec![]));
        node.push(Value::Shared(node.clone()));
        let err = Packer::new().encode(&Value::Shared(node.clone())).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
        node.replace(Value::Null);
    }

    #[test]
    fn test_self_reference_wire_form() {
        let node = SharedValue::new(Value::Array(vec![]));
        node.push(Value::Shared(node.clone()));
        let bytes = Packer::with_options(Options::new().with_structured_clone(true))
            .encode(&Value::Shared(node.clone()))
            .unwrap();
        assert_eq!(
            bytes,
            vec![0xd6, 0x69, 0, 0, 0, 1, 0x91, 0xd6, 0x70, 0, 0, 0, 1]
        );
        node.replace(Value::Null);
    }

    #[test]
    fn test_unreferenced_shared_node_has_no_header() {
        let value = Value::from(vec![Value::shared(Value::from(1))]);
        let bytes = Packer::with_options(Options::new().with_structured_clone(true))
            .encode(&value)
            .unwrap();
        assert_eq!(bytes, vec![0x91, 0x01]);
    }

    #[test]
    fn test_buffer_limit() {
        let options = Options::new().with_max_buffer_size(8);
        let err = Packer::with_options(options)
            .encode(&Value::from("a string that is too long"))
            .unwrap_err();
        assert!(matches!(err, Error::BufferLimitExceeded { limit: 8, .. }));
    }

    fn nest(levels: usize, wrap: impl Fn(Value) -> Value) -> Value {
        (0..levels).fold(Value::Null, |inner, _| wrap(inner))
    }

    #[test]
    fn test_depth_limit_matches_decoder() {
        std::thread::Builder::new()
            .stack_size(2 << 20)
            .spawn(|| {
                let array = |inner| Value::Array(vec![inner]);
                let set = |inner| Value::Set(vec![inner]);
                let object = |inner| {
                    let mut object = ObjectMap::new();
                    object.insert("a".to_string(), inner);
                    Value::Object(object)
                };
                let cases: [(usize, &dyn Fn(Value) -> Value); 3] = [
                    (format::MAX_DEPTH - 1, &array),
                    (format::MAX_DEPTH - 1, &object),
                    (format::MAX_DEPTH / 2 - 1, &set),
                ];
                for (deepest, wrap) in cases {
                    let value = nest(deepest, wrap);
                    let bytes = Packer::new().encode(&value).unwrap();
                    assert_eq!(crate::decode(&bytes).unwrap(), value);

                    let err = Packer::new().encode(&wrap(value)).unwrap_err();
                    assert!(matches!(err, Error::UnsupportedType(_)), "{err}");
                }

                let err = Packer::new()
                    .encode(&nest(4 * format::MAX_DEPTH, array))
                    .unwrap_err();
                assert!(matches!(err, Error::UnsupportedType(_)), "{err}");
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn test_builtin_ext_tag_rejected() {
        let value = Value::Ext(crate::ExtValue {
            tag: tag::SET,
            data: bytes::Bytes::from_static(&[1]),
        });
        assert!(matches!(
            Packer::new().encode(&value),
            Err(Error::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_bundle_layout() {
        let options = Options::plain().with_bundle_strings(true);
        let value = Value::from(vec!["hello", "wörld"]);
        let bytes = Packer::with_options(options).encode(&value).unwrap();
        // 92 d6 62 <offset> c1 05 c1 fa <wide> <ascii>
        assert_eq!(&bytes[..3], &[0x92, 0xd6, 0x62]);
        assert_eq!(&bytes[3..7], &[0, 0, 0, 8]);
        assert_eq!(&bytes[7..11], &[0xc1, 0x05, 0xc1, 0xfa]);
        assert_eq!(bytes[11], 0xa6);
        assert_eq!(&bytes[12..18], "wörld".as_bytes());
        assert_eq!(bytes[18], 0xa5);
        assert_eq!(&bytes[19..], b"hello");
    }

    #[test]
    fn test_grown_capacity() {
        assert_eq!(grown_capacity(0x2000, 0x2001), 0x9000);
        assert_eq!(grown_capacity(0, 10), 0x1000);
        let big = grown_capacity(0x100_0000, 0x100_0001);
        assert!(big >= 0x200_0000 && big % 0x1000 == 0);
        assert!(grown_capacity(0x400_0000, 0x400_0001) < 0x800_0000);
    }
}
