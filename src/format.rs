//! Packr wire format reference.
//!
//! Packr is a superset of MessagePack. Every MessagePack document decodes
//! unchanged (with records disabled); the additions live in the private
//! extension tags listed below and in the `0x40..=0x7f` record range.
//!
//! # Core tokens
//!
//! | Leading byte | Meaning |
//! |---|---|
//! | `0x00..=0x7f` | positive fixint (`0x40..=0x7f` are record references when records are on) |
//! | `0x80..=0x8f` | fixmap, low nibble = entry count |
//! | `0x90..=0x9f` | fixarray, low nibble = length |
//! | `0xa0..=0xbf` | fixstr, low 5 bits = UTF-8 byte length |
//! | `0xc0` | nil |
//! | `0xc1` | bundled string reference (only inside a bundle) |
//! | `0xc2` / `0xc3` | false / true |
//! | `0xc4..=0xc6` | bin 8/16/32 |
//! | `0xc7..=0xc9` | ext 8/16/32: length, tag, payload |
//! | `0xca` / `0xcb` | float 32/64, big-endian |
//! | `0xcc..=0xcf` | uint 8/16/32/64 |
//! | `0xd0..=0xd3` | int 8/16/32/64 |
//! | `0xd4..=0xd8` | fixext 1/2/4/8/16: tag, payload |
//! | `0xd9..=0xdb` | str 8/16/32 |
//! | `0xdc` / `0xdd` | array 16/32 |
//! | `0xde` / `0xdf` | map 16/32 |
//! | `0xe0..=0xff` | negative fixint |
//!
//! All multi-byte lengths and numbers are big-endian.
//!
//! # Records
//!
//! A record is an object written as a shape id followed by its values, in
//! the field order of the shape. Ids start at `0x40`:
//!
//! ```text
//! 0x40 .. 0x40+shared          shared pool (survives across buffers)
//! 0x40+shared .. +own          own ring (one buffer, or one sequential stream)
//! ```
//!
//! When `shared + own <= 64` every id is one byte. Otherwise ids below `0x60`
//! stay one byte and an id `>= 0x60` is written as two bytes:
//!
//! ```text
//! [0x60 + ((id - 0x60) & 0x1f), (id - 0x60) >> 5]
//! ```
//!
//! The first use of a shape in a buffer defines it inline:
//!
//! ```text
//! d4 72 <id>          fixext1 0x72, one-byte id
//! d5 72 <b0> <b1>     fixext2 0x72, two-byte id
//! <array of keys> <value>*
//! ```
//!
//! Later uses write only the id bytes followed by the values. With records on,
//! plain integers in `0x40..=0x7f` are written as `uint8` (`cc xx`).
//!
//! # Extensions
//!
//! | Tag | Payload |
//! |---|---|
//! | `0x00` | `d4 00 00`: undefined |
//! | `0x62` | `d6 62 <u32 offset>`: string bundle, see below |
//! | `0x65` | `d4 65 00` then `[name, message, cause]`: error |
//! | `0x69` | `d6 69 <u32 id>` then the value: reference target |
//! | `0x70` | `d6 70 <u32 id>`: pointer to an earlier target |
//! | `0x72` | record definition, see above |
//! | `0x73` | `d4 73 00` then an array: set |
//! | `0x74` | `[kind] ++ little-endian elements`: typed array |
//! | `0x78` | `d4 78 00` then `[source, flags]`: regular expression |
//! | `0xff` | timestamp: 4 bytes `u32 secs`, 8 bytes `nanos << 34 \| secs`, 12 bytes `u32 nanos, i64 secs` |
//!
//! Typed array kinds: 0 Int8, 1 Uint8, 2 Uint8Clamped, 3 Int16, 4 Uint16,
//! 5 Int32, 6 Uint32, 7 Float32, 8 Float64, 9 BigInt64, 10 BigUint64.
//!
//! # References
//!
//! With structured clone on, a shared node seen for the second time is
//! written as a `0x70` pointer. The first occurrence is then prefixed with a
//! `0x69` target header carrying the same id. Ids start at 1 and only nodes
//! that were actually pointed to get a header.
//!
//! # String bundles
//!
//! With bundling on, strings of 4 to 4095 bytes inside a non-string top-level
//! value are moved out of line. The value stream starts with a bundle header
//! whose offset (relative to the start of the 4-byte offset field) points at
//! two plain strings: first the non-ASCII bundle, then the ASCII bundle.
//! Each moved string is written as `c1 <int length>`, consuming that many
//! bytes from the ASCII bundle, or from the non-ASCII bundle when the length
//! is negative. A later bundle is announced with
//! `c8 <u16 len> 62 <u32 offset> <previous strings>`.

use std::sync::OnceLock;

/// `nil`
pub(crate) const NIL: u8 = 0xc0;
/// Bundled string reference.
pub(crate) const BUNDLE_REF: u8 = 0xc1;
pub(crate) const FALSE: u8 = 0xc2;
pub(crate) const TRUE: u8 = 0xc3;
pub(crate) const BIN8: u8 = 0xc4;
pub(crate) const BIN16: u8 = 0xc5;
pub(crate) const BIN32: u8 = 0xc6;
pub(crate) const EXT8: u8 = 0xc7;
pub(crate) const EXT16: u8 = 0xc8;
pub(crate) const EXT32: u8 = 0xc9;
pub(crate) const FLOAT32: u8 = 0xca;
pub(crate) const FLOAT64: u8 = 0xcb;
pub(crate) const UINT8: u8 = 0xcc;
pub(crate) const UINT16: u8 = 0xcd;
pub(crate) const UINT32: u8 = 0xce;
pub(crate) const UINT64: u8 = 0xcf;
pub(crate) const INT8: u8 = 0xd0;
pub(crate) const INT16: u8 = 0xd1;
pub(crate) const INT32: u8 = 0xd2;
pub(crate) const INT64: u8 = 0xd3;
pub(crate) const FIXEXT1: u8 = 0xd4;
pub(crate) const FIXEXT2: u8 = 0xd5;
pub(crate) const FIXEXT4: u8 = 0xd6;
pub(crate) const FIXEXT8: u8 = 0xd7;
pub(crate) const FIXEXT16: u8 = 0xd8;
pub(crate) const STR8: u8 = 0xd9;
pub(crate) const STR16: u8 = 0xda;
pub(crate) const STR32: u8 = 0xdb;
pub(crate) const ARRAY16: u8 = 0xdc;
pub(crate) const ARRAY32: u8 = 0xdd;
pub(crate) const MAP16: u8 = 0xde;
pub(crate) const MAP32: u8 = 0xdf;

pub(crate) const FIXMAP: u8 = 0x80;
pub(crate) const FIXARRAY: u8 = 0x90;
pub(crate) const FIXSTR: u8 = 0xa0;

/// Extension tags with a built-in meaning.
pub mod tag {
    pub const UNDEFINED: u8 = 0x00;
    pub const BUNDLE: u8 = 0x62;
    pub const ERROR: u8 = 0x65;
    pub const REFERENCE_ID: u8 = 0x69;
    pub const POINTER: u8 = 0x70;
    pub const RECORD: u8 = 0x72;
    pub const SET: u8 = 0x73;
    pub const TYPED_ARRAY: u8 = 0x74;
    pub const REGEXP: u8 = 0x78;
    pub const TIMESTAMP: u8 = 0xff;

    /// Tags the codec itself interprets; they cannot be re-registered.
    pub const STRUCTURAL: [u8; 4] = [BUNDLE, REFERENCE_ID, POINTER, RECORD];

    /// Every tag with a built-in handler.
    pub const BUILTIN: [u8; 10] = [
        UNDEFINED,
        BUNDLE,
        ERROR,
        REFERENCE_ID,
        POINTER,
        RECORD,
        SET,
        TYPED_ARRAY,
        REGEXP,
        TIMESTAMP,
    ];
}

/// Strings shorter than this are never bundled.
pub(crate) const MIN_BUNDLE_STRING: usize = 4;
/// Strings of this many bytes or more are never bundled.
pub(crate) const MAX_BUNDLE_STRING: usize = 0x1000;
/// A bundle is flushed once its strings exceed this many bytes.
pub(crate) const MAX_BUNDLE_SIZE: usize = 0x5500;

/// Deepest nesting either side accepts, counted in decoder frames: one per
/// value, one more for each extension whose value follows in the stream.
pub(crate) const MAX_DEPTH: usize = 128;

/// Decimal multiplier used by aggressive float32 narrowing.
///
/// `exponent` is the float32 biased exponent, read from the first two bytes of
/// the big-endian encoding as `((b0 & 0x7f) << 1) | (b1 >> 7)`.
pub(crate) fn decimal_multiplier(exponent: u8) -> f64 {
    static MULTIPLIERS: OnceLock<[f64; 256]> = OnceLock::new();
    MULTIPLIERS.get_or_init(|| {
        let mut table = [0.0; 256];
        for (exponent, slot) in table.iter_mut().enumerate() {
            let power = (45.15 - exponent as f64 * 0.30103).floor() as i32;
            *slot = format!("1e{}", power)
                .parse()
                .unwrap_or_else(|_| 10f64.powi(power));
        }
        table
    })[usize::from(exponent)]
}

/// Biased float32 exponent of a big-endian float32 encoding.
pub(crate) fn float32_exponent(bytes: [u8; 4]) -> u8 {
    ((bytes[0] & 0x7f) << 1) | (bytes[1] >> 7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float32_exponent() {
        assert_eq!(float32_exponent(1.0f32.to_be_bytes()), 127);
        assert_eq!(float32_exponent((-2.0f32).to_be_bytes()), 128);
        assert_eq!(float32_exponent(0.0f32.to_be_bytes()), 0);
    }

    #[test]
    fn test_decimal_multiplier() {
        // exponent 127 covers [1, 2): seven significant digits
        assert_eq!(decimal_multiplier(127), 1e6);
        assert_eq!(decimal_multiplier(0), 1e45);
    }

    #[test]
    fn test_structural_tags() {
        assert!(tag::STRUCTURAL.contains(&tag::RECORD));
        assert!(!tag::STRUCTURAL.contains(&tag::SET));
    }
}
