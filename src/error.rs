//! Error types for packr encoding, decoding and compression.
//!
//! Every error is a plain value returned through [`Result`]; nothing in the
//! codec panics on malformed input. Decoding errors carry the byte offset at
//! which the problem was detected so a corrupt stream can be diagnosed.
//!
//! ## Error Categories
//!
//! - **Truncation**: [`Error::IncompleteBuffer`], the only error a caller may
//!   recover from by retrying with more bytes
//! - **Corruption**: unknown tokens, unknown extensions, undefined records,
//!   dangling references and malformed payloads
//! - **Encoding limits**: unsupported values, integer overflow, buffer limit
//! - **Compression**: malformed DEFLATE streams
//!
//! ## Examples
//!
//! ```rust
//! use serde_packr::{decode, encode, Error, Value};
//!
//! let bytes = encode(&Value::from("hello world")).unwrap();
//! let err = decode(&bytes[..bytes.len() - 2]).unwrap_err();
//! assert!(matches!(err, Error::IncompleteBuffer { .. }));
//! assert!(err.is_incomplete());
//! ```

use std::fmt;
use thiserror::Error;

/// Represents all possible errors raised by the codec and the compressor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The input ended before a complete value was read.
    #[error("Incomplete buffer at offset {offset}: {needed} more byte(s) needed")]
    IncompleteBuffer { offset: usize, needed: usize },

    /// Bytes remain after one complete top-level value.
    #[error("Trailing data at offset {offset}: {remaining} byte(s) after the value")]
    TrailingData { offset: usize, remaining: usize },

    /// An extension tag without a registered handler.
    #[error("Unknown extension type 0x{tag:02x} at offset {offset}")]
    UnknownExtensionType { tag: u8, offset: usize },

    /// A leading byte that does not start any value.
    #[error("Unknown token 0x{token:02x} at offset {offset}")]
    UnknownToken { token: u8, offset: usize },

    /// A record id was referenced before any definition was seen.
    #[error("Record structure 0x{id:x} is not defined (offset {offset})")]
    StructureNotDefined { id: u16, offset: usize },

    /// A structured-clone pointer to an id that was never registered.
    #[error("Reference id {id} is not defined (offset {offset})")]
    InvalidReference { id: u32, offset: usize },

    /// A well-formed token carrying an invalid payload.
    #[error("Invalid data at offset {offset}: {msg}")]
    InvalidData { offset: usize, msg: String },

    /// A value that has no packr encoding.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// An integer that does not fit the 64-bit wire forms.
    #[error("Integer overflow: {0} does not fit in 64 bits")]
    IntegerOverflow(String),

    /// The encoded output would exceed the configured maximum.
    #[error("Buffer limit exceeded: {required} bytes required, limit is {limit}")]
    BufferLimitExceeded { required: usize, limit: usize },

    /// A malformed raw DEFLATE stream.
    #[error("Invalid deflate stream at byte {offset}: {msg}")]
    InvalidDeflate { offset: usize, msg: String },

    /// IO error during reading or writing
    #[error("IO error: {0}")]
    Io(String),

    /// Custom error
    #[error("Error: {0}")]
    Custom(String),
}

impl Error {
    /// Creates an incomplete-buffer error.
    pub fn incomplete(offset: usize, needed: usize) -> Self {
        Error::IncompleteBuffer { offset, needed }
    }

    /// Creates an invalid-data error for a malformed payload.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_packr::Error;
    ///
    /// let err = Error::invalid_data(12, "record keys must be strings");
    /// assert!(err.to_string().contains("offset 12"));
    /// ```
    pub fn invalid_data(offset: usize, msg: &str) -> Self {
        Error::InvalidData {
            offset,
            msg: msg.to_string(),
        }
    }

    /// Creates an invalid-deflate error.
    pub fn invalid_deflate(offset: usize, msg: &str) -> Self {
        Error::InvalidDeflate {
            offset,
            msg: msg.to_string(),
        }
    }

    /// Creates an unsupported type error for values that cannot be encoded.
    pub fn unsupported_type(msg: &str) -> Self {
        Error::UnsupportedType(msg.to_string())
    }

    /// Creates a custom error with a display message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_packr::Error;
    ///
    /// let err = Error::custom("something went wrong");
    /// assert!(err.to_string().contains("something went wrong"));
    /// ```
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Creates an I/O error for reader/writer failures.
    pub fn io(msg: &str) -> Self {
        Error::Io(msg.to_string())
    }

    /// Returns `true` when the input was truncated and more bytes may complete it.
    #[must_use]
    pub const fn is_incomplete(&self) -> bool {
        matches!(self, Error::IncompleteBuffer { .. })
    }
}

impl serde::ser::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
