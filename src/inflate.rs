//! Raw DEFLATE (RFC 1951) decompression.

use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::huffman::{
    first_codes, reverse_bits, CODE_LENGTH_ORDER, DIST_BASE, DIST_EXTRA, FIXED_DISTANCE_LENGTHS,
    FIXED_LITERAL_LENGTHS, LENGTH_BASE, LENGTH_EXTRA,
};

const END_OF_BLOCK: u16 = 256;
const MAX_LITERAL_CODES: usize = 286;
const MAX_DISTANCE_CODES: usize = 30;

/// Decompresses a raw DEFLATE stream.
///
/// A stream that ends before its final block is complete fails with
/// [`Error::IncompleteBuffer`]; malformed data fails with
/// [`Error::InvalidDeflate`]. Bytes after the final block are ignored.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    decompress_with_dictionary(data, &[])
}

/// Decompresses a stream produced with a preset dictionary.
pub fn decompress_with_dictionary(data: &[u8], dictionary: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(dictionary.len() + data.len() * 3);
    out.extend_from_slice(dictionary);
    let mut reader = BitReader::new(data);

    loop {
        let last = reader.read(1)? == 1;
        match reader.read(2)? {
            0 => copy_stored(&mut reader, &mut out)?,
            1 => {
                let (literals, distances) = fixed_tables()?;
                inflate_block(&mut reader, &mut out, literals, distances)?;
            }
            2 => {
                let (literals, distances) = read_dynamic_tables(&mut reader)?;
                inflate_block(&mut reader, &mut out, &literals, &distances)?;
            }
            _ => {
                return Err(Error::invalid_deflate(
                    reader.byte_offset(),
                    "reserved block type",
                ))
            }
        }
        if last {
            break;
        }
    }

    out.drain(..dictionary.len());
    Ok(out)
}

struct BitReader<'a> {
    data: &'a [u8],
    /// Position in bits.
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BitReader { data, pos: 0 }
    }

    fn byte_offset(&self) -> usize {
        self.pos / 8
    }

    fn bits_left(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    /// Next `count` bits without consuming them, zero past the end.
    fn peek(&self, count: u8) -> u32 {
        let mut value = 0u32;
        let mut filled = 0u32;
        let mut pos = self.pos;
        while filled < u32::from(count) {
            let Some(&byte) = self.data.get(pos / 8) else {
                break;
            };
            let shift = (pos % 8) as u32;
            let take = (8 - shift).min(u32::from(count) - filled);
            let bits = (u32::from(byte) >> shift) & ((1 << take) - 1);
            value |= bits << filled;
            filled += take;
            pos += take as usize;
        }
        value
    }

    fn consume(&mut self, count: u8) -> Result<()> {
        let count = usize::from(count);
        if count > self.bits_left() {
            let needed = (count - self.bits_left() + 7) / 8;
            return Err(Error::incomplete(self.data.len(), needed));
        }
        self.pos += count;
        Ok(())
    }

    fn read(&mut self, count: u8) -> Result<u32> {
        let value = self.peek(count);
        self.consume(count)?;
        Ok(value)
    }

    fn align(&mut self) {
        self.pos = (self.pos + 7) / 8 * 8;
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        debug_assert_eq!(self.pos % 8, 0);
        let start = self.pos / 8;
        let bytes = self
            .data
            .get(start..start + len)
            .ok_or_else(|| Error::incomplete(self.data.len(), start + len - self.data.len()))?;
        self.pos += len * 8;
        Ok(bytes)
    }
}

/// Lookup table indexed by the next `max_bits` input bits. Each entry is
/// `symbol << 4 | code_length`; zero marks an unused pattern.
struct DecodeTable {
    entries: Vec<u16>,
    max_bits: u8,
}

impl DecodeTable {
    fn new(lengths: &[u8], offset: usize) -> Result<Self> {
        let max_bits = lengths.iter().copied().max().unwrap_or(0);
        let mut entries = vec![0u16; 1 << max_bits];
        let mut next = first_codes(lengths, max_bits);
        for (symbol, &length) in lengths.iter().enumerate() {
            if length == 0 {
                continue;
            }
            let code = next[usize::from(length)];
            if code >= 1 << length {
                return Err(Error::invalid_deflate(offset, "oversubscribed code lengths"));
            }
            next[usize::from(length)] += 1;

            let entry = ((symbol as u16) << 4) | u16::from(length);
            let free_bits = max_bits - length;
            let first = code << free_bits;
            for pattern in first..first + (1 << free_bits) {
                entries[reverse_bits(pattern, max_bits) as usize] = entry;
            }
        }
        Ok(DecodeTable { entries, max_bits })
    }

    fn decode(&self, reader: &mut BitReader<'_>) -> Result<u16> {
        let entry = self.entries[reader.peek(self.max_bits) as usize];
        let length = (entry & 0xf) as u8;
        if length == 0 {
            if reader.bits_left() < usize::from(self.max_bits) {
                return Err(Error::incomplete(reader.data.len(), 1));
            }
            return Err(Error::invalid_deflate(
                reader.byte_offset(),
                "invalid Huffman code",
            ));
        }
        reader.consume(length)?;
        Ok(entry >> 4)
    }
}

fn fixed_tables() -> Result<&'static (DecodeTable, DecodeTable)> {
    static TABLES: OnceLock<(DecodeTable, DecodeTable)> = OnceLock::new();
    if let Some(tables) = TABLES.get() {
        return Ok(tables);
    }
    let tables = (
        DecodeTable::new(&FIXED_LITERAL_LENGTHS, 0)?,
        DecodeTable::new(&FIXED_DISTANCE_LENGTHS, 0)?,
    );
    Ok(TABLES.get_or_init(|| tables))
}

fn copy_stored(reader: &mut BitReader<'_>, out: &mut Vec<u8>) -> Result<()> {
    reader.align();
    let len = reader.read(16)?;
    let nlen = reader.read(16)?;
    if len != !nlen & 0xffff {
        return Err(Error::invalid_deflate(
            reader.byte_offset() - 4,
            "stored block length mismatch",
        ));
    }
    out.extend_from_slice(reader.read_bytes(len as usize)?);
    Ok(())
}

fn read_dynamic_tables(reader: &mut BitReader<'_>) -> Result<(DecodeTable, DecodeTable)> {
    let literal_count = reader.read(5)? as usize + 257;
    let distance_count = reader.read(5)? as usize + 1;
    let length_count = reader.read(4)? as usize + 4;
    if literal_count > MAX_LITERAL_CODES || distance_count > MAX_DISTANCE_CODES {
        return Err(Error::invalid_deflate(
            reader.byte_offset(),
            "too many length or distance codes",
        ));
    }

    let mut length_lengths = [0u8; 19];
    for &symbol in &CODE_LENGTH_ORDER[..length_count] {
        length_lengths[symbol] = reader.read(3)? as u8;
    }
    let length_table = DecodeTable::new(&length_lengths, reader.byte_offset())?;

    let total = literal_count + distance_count;
    let mut lengths = Vec::with_capacity(total);
    while lengths.len() < total {
        let offset = reader.byte_offset();
        let (value, repeat) = match length_table.decode(reader)? {
            symbol @ 0..=15 => (symbol as u8, 1),
            16 => {
                let Some(&previous) = lengths.last() else {
                    return Err(Error::invalid_deflate(offset, "repeat with no previous length"));
                };
                (previous, 3 + reader.read(2)? as usize)
            }
            17 => (0, 3 + reader.read(3)? as usize),
            _ => (0, 11 + reader.read(7)? as usize),
        };
        if lengths.len() + repeat > total {
            return Err(Error::invalid_deflate(offset, "code lengths overflow"));
        }
        lengths.extend(std::iter::repeat(value).take(repeat));
    }

    let offset = reader.byte_offset();
    if lengths[usize::from(END_OF_BLOCK)] == 0 {
        return Err(Error::invalid_deflate(offset, "missing end-of-block code"));
    }
    Ok((
        DecodeTable::new(&lengths[..literal_count], offset)?,
        DecodeTable::new(&lengths[literal_count..], offset)?,
    ))
}

fn inflate_block(
    reader: &mut BitReader<'_>,
    out: &mut Vec<u8>,
    literals: &DecodeTable,
    distances: &DecodeTable,
) -> Result<()> {
    loop {
        let offset = reader.byte_offset();
        let symbol = literals.decode(reader)?;
        match symbol {
            0..=255 => out.push(symbol as u8),
            END_OF_BLOCK => return Ok(()),
            _ => {
                let index = usize::from(symbol - 257);
                if index >= LENGTH_BASE.len() {
                    return Err(Error::invalid_deflate(offset, "invalid length symbol"));
                }
                let length = usize::from(LENGTH_BASE[index])
                    + reader.read(LENGTH_EXTRA[index])? as usize;

                let offset = reader.byte_offset();
                let index = usize::from(distances.decode(reader)?);
                if index >= DIST_BASE.len() {
                    return Err(Error::invalid_deflate(offset, "invalid distance symbol"));
                }
                let distance =
                    usize::from(DIST_BASE[index]) + reader.read(DIST_EXTRA[index])? as usize;
                if distance > out.len() {
                    return Err(Error::invalid_deflate(offset, "distance too far back"));
                }

                let start = out.len() - distance;
                if distance >= length {
                    out.extend_from_within(start..start + length);
                } else {
                    for i in 0..length {
                        let byte = out[start + i];
                        out.push(byte);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_blocks() {
        assert_eq!(decompress(&[0x03, 0x00]).unwrap(), b"");
        assert_eq!(decompress(&[0x01, 0x00, 0x00, 0xff, 0xff]).unwrap(), b"");
    }

    #[test]
    fn test_stored_block() {
        let data = [0x01, 0x03, 0x00, 0xfc, 0xff, b'a', b'b', b'c'];
        assert_eq!(decompress(&data).unwrap(), b"abc");
    }

    #[test]
    fn test_fixed_block() {
        // zlib's raw deflate of "a".
        assert_eq!(decompress(&[0x4b, 0x04, 0x00]).unwrap(), b"a");
    }

    #[test]
    fn test_truncated() {
        let data = [0x01, 0x03, 0x00, 0xfc, 0xff, b'a', b'b', b'c'];
        for len in 0..data.len() {
            let err = decompress(&data[..len]).unwrap_err();
            assert!(err.is_incomplete(), "{len}: {err}");
        }
    }

    #[test]
    fn test_invalid() {
        // Block type 3.
        assert!(matches!(
            decompress(&[0x07]),
            Err(Error::InvalidDeflate { .. })
        ));
        // NLEN is not the complement of LEN.
        assert!(matches!(
            decompress(&[0x01, 0x03, 0x00, 0x00, 0x00, 1, 2, 3]),
            Err(Error::InvalidDeflate { .. })
        ));
    }

    #[test]
    fn test_distance_too_far() {
        // Fixed block: length 3 (symbol 257, code 0000001), distance 1 with
        // nothing decoded yet.
        let mut writer = crate::huffman::BitWriter::default();
        writer.write(1, 1);
        writer.write(1, 2);
        writer.write(reverse_bits(1, 7), 7);
        writer.write(0, 5);
        let err = decompress(&writer.finish()).unwrap_err();
        assert!(matches!(err, Error::InvalidDeflate { .. }), "{err}");
    }

    #[test]
    fn test_dictionary() {
        // Fixed block: length 3, distance 3, back into the dictionary.
        let mut writer = crate::huffman::BitWriter::default();
        writer.write(1, 1);
        writer.write(1, 2);
        writer.write(reverse_bits(1, 7), 7);
        writer.write(reverse_bits(2, 5), 5);
        writer.write(0, 7);
        let compressed = writer.finish();
        assert_eq!(
            decompress_with_dictionary(&compressed, b"xyz").unwrap(),
            b"xyz"
        );
        assert!(decompress(&compressed).is_err());
    }
}
