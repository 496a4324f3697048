//! # serde_packr
//!
//! A compact binary format for structured data: a superset of MessagePack
//! with record shapes, extension types, cycle-safe references and string
//! bundles, plus a raw DEFLATE compressor to shrink the result further.
//!
//! ## What is Packr?
//!
//! Packr writes plain MessagePack for everything MessagePack can express. On
//! top of that, an object whose key list has been seen before is written as a
//! one- or two-byte *record id* followed by its values, so a list of a
//! thousand rows carries its keys once. Shapes can be persisted in a
//! [`StructureStore`] and shared between sessions, in which case even the
//! first row of a buffer skips its keys.
//!
//! ## Key Features
//!
//! - **Records**: repeated object shapes cost one or two bytes instead of their keys
//! - **Shared Structures**: shapes persist across buffers and processes through a store
//! - **Structured Clone**: shared and cyclic graphs round-trip with their identity intact
//! - **Extensions**: dates, sets, errors, regular expressions, typed arrays, custom types
//! - **DEFLATE**: raw RFC 1951 compression and decompression, one-shot or streaming
//! - **Serde Compatible**: any `T: Serialize` packs, any `T: Deserialize` unpacks
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! serde_packr = "0.1"
//! serde = { version = "1.0", features = ["derive"] }
//! ```
//!
//! ### Serde types
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use serde_packr::{from_slice, to_vec};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct User {
//!     id: u32,
//!     name: String,
//!     active: bool,
//! }
//!
//! let users = vec![
//!     User { id: 1, name: "Alice".to_string(), active: true },
//!     User { id: 2, name: "Bob".to_string(), active: false },
//! ];
//!
//! let bytes = to_vec(&users).unwrap();
//! let back: Vec<User> = from_slice(&bytes).unwrap();
//! assert_eq!(users, back);
//! ```
//!
//! ### Dynamic values
//!
//! ```rust
//! use serde_packr::{decode, encode, packr};
//!
//! let value = packr!({ "name": "Alice", "tags": ["rust", "serde"] });
//! let bytes = encode(&value).unwrap();
//! assert_eq!(decode(&bytes).unwrap(), value);
//! ```
//!
//! ### Sessions and shared structures
//!
//! A [`Packer`] and an [`Unpacker`] connected to the same store agree on
//! record ids without writing them into every buffer:
//!
//! ```rust
//! use serde_packr::{packr, InMemoryStructures, Packer, Unpacker};
//!
//! let store = InMemoryStructures::new();
//! let mut packer = Packer::new().with_structure_store(store.clone());
//! let mut unpacker = Unpacker::new().with_structure_store(store);
//!
//! for id in 0..3 {
//!     let bytes = packer.encode(&packr!({ "id": id, "ok": true })).unwrap();
//!     assert_eq!(unpacker.decode(&bytes).unwrap(), packr!({ "id": id, "ok": true }));
//! }
//! ```
//!
//! ### Compression
//!
//! ```rust
//! use serde_packr::{decompress_and_unpack, pack_and_compress, packr};
//!
//! let rows: Vec<_> = (0..100).map(|i| packr!({ "row": i, "label": "same" })).collect();
//! let value = serde_packr::Value::Array(rows);
//! let compressed = pack_and_compress(&value).unwrap();
//! assert_eq!(decompress_and_unpack(&compressed).unwrap(), value);
//! ```
//!
//! ## Safety Guarantees
//!
//! - No `unsafe` code blocks
//! - Truncated input fails with [`Error::IncompleteBuffer`], never a panic
//! - Decode errors leave persisted structures untouched
//! - Nesting deeper than 128 levels is rejected on both sides instead of
//!   overflowing the stack
//!
//! ## Format Reference
//!
//! The byte-level layout is documented in the [`format`] module.
//!
//! ## Examples
//!
//! See the `demos/` directory:
//!
//! - **`simple.rs`** - Serde types and dynamic values
//! - **`shared_structures.rs`** - Persisting record shapes across sessions
//! - **`compressed_index.rs`** - Packing and compressing a large index
//!
//! Run any example with: `cargo run --example <name>`

pub mod de;
pub mod decode;
pub mod deflate;
pub mod encode;
pub mod error;
pub mod extension;
pub mod format;
mod huffman;
pub mod inflate;
pub mod macros;
pub mod map;
pub mod options;
pub mod ser;
pub mod structures;
pub mod value;

pub use de::{from_value, ValueDeserializer};
pub use decode::{DecodeMultiple, Unpacker};
pub use deflate::{compress, compress_with_options, DeflateOptions, Deflater};
pub use encode::Packer;
pub use error::{Error, Result};
pub use extension::{Extension, ExtensionContext, ExtensionRegistry, RawExtension};
pub use inflate::{decompress, decompress_with_dictionary};
pub use map::ObjectMap;
pub use options::{Float32Mode, Int64Mode, Options};
pub use ser::{to_value, ValueSerializer};
pub use structures::{InMemoryStructures, StructureStore};
pub use value::{ErrorValue, ExtValue, Number, RegExpValue, SharedValue, TypedArray, Value};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;

/// Encode a [`Value`] with default options.
///
/// Each call starts a fresh session, so record shapes are defined inline in
/// every buffer. Use a [`Packer`] to keep shapes between calls.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{encode, Value};
///
/// assert_eq!(encode(&Value::from(1)).unwrap(), vec![0x01]);
/// assert_eq!(encode(&Value::Null).unwrap(), vec![0xc0]);
/// ```
///
/// # Errors
///
/// Returns an error for unencodable values (such as a cycle without
/// structured clone) or when the output would exceed the buffer limit.
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    encode_with_options(value, Options::default())
}

/// Encode a [`Value`] with custom options.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{encode_with_options, packr, Options};
///
/// let bytes = encode_with_options(&packr!({ "a": 1 }), Options::plain()).unwrap();
/// assert_eq!(bytes, vec![0x81, 0xa1, b'a', 0x01]);
/// ```
///
/// # Errors
///
/// Same as [`encode`].
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn encode_with_options(value: &Value, options: Options) -> Result<Vec<u8>> {
    Packer::with_options(options).encode(value)
}

/// Decode exactly one value from `bytes` with default options.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{decode, Error, Value};
///
/// assert_eq!(decode(&[0x93, 0x01, 0x02, 0x03]).unwrap(), Value::from(vec![1, 2, 3]));
/// assert!(matches!(decode(&[0x01, 0x02]), Err(Error::TrailingData { .. })));
/// ```
///
/// # Errors
///
/// Returns [`Error::IncompleteBuffer`] for truncated input,
/// [`Error::TrailingData`] when bytes follow the value, and other variants
/// for malformed data.
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn decode(bytes: &[u8]) -> Result<Value> {
    decode_with_options(bytes, Options::default())
}

/// Decode exactly one value from `bytes` with custom options.
///
/// # Errors
///
/// Same as [`decode`].
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn decode_with_options(bytes: &[u8], options: Options) -> Result<Value> {
    Unpacker::with_options(options).decode(bytes)
}

/// Iterate over a stream of concatenated values.
///
/// The values share one session, so record shapes defined early in the
/// stream stay available to later values.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{decode_multiple, Value};
///
/// let values: Vec<Value> = decode_multiple(&[0x01, 0xc3, 0xa1, b'x'])
///     .collect::<Result<_, _>>()
///     .unwrap();
/// assert_eq!(values, vec![Value::from(1), Value::Bool(true), Value::from("x")]);
/// ```
pub fn decode_multiple(bytes: &[u8]) -> DecodeMultiple<'static> {
    decode_multiple_with_options(bytes, Options::default())
}

/// Iterate over a stream of concatenated values with custom options.
pub fn decode_multiple_with_options(bytes: &[u8], options: Options) -> DecodeMultiple<'static> {
    DecodeMultiple::owned(
        Unpacker::with_options(options),
        Bytes::copy_from_slice(bytes),
    )
}

/// Encode a value and compress the result at level 6.
///
/// # Errors
///
/// Same as [`encode`].
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn pack_and_compress(value: &Value) -> Result<Vec<u8>> {
    pack_and_compress_with_options(value, Options::default(), &DeflateOptions::default())
}

/// Encode a value and compress the result.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{
///     decompress_and_unpack_with_options, pack_and_compress_with_options, packr,
///     DeflateOptions, Options,
/// };
///
/// let value = packr!(["repeat", "repeat", "repeat", "repeat"]);
/// let deflate = DeflateOptions::new().with_level(9);
/// let compressed =
///     pack_and_compress_with_options(&value, Options::plain(), &deflate).unwrap();
/// let back = decompress_and_unpack_with_options(&compressed, Options::plain(), &deflate);
/// assert_eq!(back.unwrap(), value);
/// ```
///
/// # Errors
///
/// Same as [`encode`].
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn pack_and_compress_with_options(
    value: &Value,
    options: Options,
    deflate: &DeflateOptions,
) -> Result<Vec<u8>> {
    let packed = encode_with_options(value, options)?;
    Ok(compress_with_options(&packed, deflate))
}

/// Decompress a raw DEFLATE stream and decode the value inside.
///
/// # Errors
///
/// Returns the decompression error, or any error of [`decode`].
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn decompress_and_unpack(bytes: &[u8]) -> Result<Value> {
    decompress_and_unpack_with_options(bytes, Options::default(), &DeflateOptions::default())
}

/// Decompress and decode with custom options.
///
/// Only the dictionary of `deflate` matters here; it must match the one used
/// to compress.
///
/// # Errors
///
/// Same as [`decompress_and_unpack`].
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn decompress_and_unpack_with_options(
    bytes: &[u8],
    options: Options,
    deflate: &DeflateOptions,
) -> Result<Value> {
    let dictionary = deflate.dictionary.as_deref().unwrap_or_default();
    let packed = decompress_with_dictionary(bytes, dictionary)?;
    Unpacker::with_options(options).decode_bytes(Bytes::from(packed))
}

/// Serialize any `T: Serialize` to Packr bytes.
///
/// # Examples
///
/// ```rust
/// use serde_packr::to_vec;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Point { x: i32, y: i32 }
///
/// let bytes = to_vec(&Point { x: 1, y: 2 }).unwrap();
/// assert_eq!(bytes[..3], [0xd4, 0x72, 0x40]);
/// ```
///
/// # Errors
///
/// Returns an error if `T`'s `Serialize` implementation fails or the value
/// cannot be encoded.
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn to_vec<T>(value: &T) -> Result<Vec<u8>>
where
    T: ?Sized + Serialize,
{
    to_vec_with_options(value, Options::default())
}

/// Serialize any `T: Serialize` to Packr bytes with custom options.
///
/// # Errors
///
/// Same as [`to_vec`].
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn to_vec_with_options<T>(value: &T, options: Options) -> Result<Vec<u8>>
where
    T: ?Sized + Serialize,
{
    encode_with_options(&to_value(value)?, options)
}

/// Serialize any `T: Serialize` to a writer.
///
/// # Examples
///
/// ```rust
/// use serde_packr::to_writer;
///
/// let mut buffer = Vec::new();
/// to_writer(&mut buffer, &vec![1, 2, 3]).unwrap();
/// assert_eq!(buffer, vec![0x93, 0x01, 0x02, 0x03]);
/// ```
///
/// # Errors
///
/// Returns an error if serialization fails or writing to the writer fails.
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn to_writer<W, T>(mut writer: W, value: &T) -> Result<()>
where
    W: io::Write,
    T: ?Sized + Serialize,
{
    let bytes = to_vec(value)?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::io(&e.to_string()))?;
    Ok(())
}

/// Deserialize an instance of type `T` from Packr bytes.
///
/// # Examples
///
/// ```rust
/// use serde_packr::from_slice;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, PartialEq, Debug)]
/// struct Point { x: i32, y: i32 }
///
/// let bytes = [0x82, 0xa1, b'x', 0x01, 0xa1, b'y', 0x02];
/// let point: Point = from_slice(&bytes).unwrap();
/// assert_eq!(point, Point { x: 1, y: 2 });
/// ```
///
/// # Errors
///
/// Returns an error if the bytes are not a single valid value or cannot be
/// deserialized to type `T`.
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn from_slice<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    from_slice_with_options(bytes, Options::default())
}

/// Deserialize an instance of type `T` from Packr bytes with custom options.
///
/// # Errors
///
/// Same as [`from_slice`].
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn from_slice_with_options<T>(bytes: &[u8], options: Options) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    from_value(decode_with_options(bytes, options)?)
}

/// Deserialize an instance of type `T` from an I/O stream of Packr bytes.
///
/// The reader is consumed to its end and must hold exactly one value.
///
/// # Examples
///
/// ```rust
/// use serde_packr::from_reader;
/// use std::io::Cursor;
///
/// let numbers: Vec<u8> = from_reader(Cursor::new([0x92, 0x07, 0x08])).unwrap();
/// assert_eq!(numbers, vec![7, 8]);
/// ```
///
/// # Errors
///
/// Returns an error if reading from the reader fails, the bytes are not a
/// valid value, or the value cannot be deserialized to type `T`.
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn from_reader<R, T>(mut reader: R) -> Result<T>
where
    R: io::Read,
    T: for<'de> Deserialize<'de>,
{
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| Error::io(&e.to_string()))?;
    from_slice(&bytes)
}
