//! Raw DEFLATE (RFC 1951) compression.
//!
//! Matches are found with a hash chain over three-byte prefixes. Each block is
//! written as whichever of stored, fixed Huffman or dynamic Huffman comes out
//! smallest. Levels run from 0 (stored blocks only) to 9 (longest search).
//!
//! ```
//! let data = b"abcabcabcabcabcabcabcabc".repeat(20);
//! let compressed = serde_packr::compress(&data, 6);
//! assert!(compressed.len() < data.len());
//! assert_eq!(serde_packr::decompress(&compressed).unwrap(), data);
//! ```

use tracing::trace;

use crate::huffman::{
    build_lengths, canonical_codes, coded_bits, encode_lengths, fixed_codes, BitWriter,
    CODE_LENGTH_ORDER, DIST_BASE, DIST_EXTRA, FIXED_DISTANCE_LENGTHS, FIXED_LITERAL_LENGTHS,
    LENGTH_BASE, LENGTH_EXTRA, MAX_CODE_BITS, MAX_CODE_LENGTH_BITS,
};

/// Per level: `nice_length << 13 | max_chain`.
const LEVEL_PARAMS: [u32; 9] = [
    65540, 131080, 131088, 131104, 262176, 1048704, 1048832, 2114560, 2117632,
];

const WINDOW_SIZE: usize = 32768;
const WINDOW_MASK: usize = WINDOW_SIZE - 1;
const MAX_MATCH: usize = 258;
const MAX_STORED_BLOCK: usize = 65535;
/// A block is cut after this many matches...
const BLOCK_MATCHES: usize = 7000;
/// ...or this many symbols.
const BLOCK_SYMBOLS: usize = 24576;
/// Never cut the last block with fewer bytes than this left.
const MIN_TAIL: usize = 423;
/// Pending input that makes a streaming [`Deflater`] emit a block.
const STREAM_BLOCK_INPUT: usize = 65536;
const STREAM_HASH_BITS: f64 = 20.0;
const MAX_LEVEL: u8 = 9;
const MAX_MEM: u8 = 12;

/// Compression parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeflateOptions {
    /// 0 (store only) to 9 (slowest, smallest). Higher values are clamped.
    pub level: u8,
    /// Hash table size as `2^(12 + mem)` entries, 0 to 12. `None` sizes the
    /// table from the input length.
    pub mem: Option<u8>,
    /// Preset dictionary; only its last 32 KiB are used. The decompressor
    /// must be given the same bytes.
    pub dictionary: Option<Vec<u8>>,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        DeflateOptions {
            level: 6,
            mem: None,
            dictionary: None,
        }
    }
}

impl DeflateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn with_mem(mut self, mem: u8) -> Self {
        self.mem = Some(mem);
        self
    }

    pub fn with_dictionary(mut self, dictionary: impl Into<Vec<u8>>) -> Self {
        self.dictionary = Some(dictionary.into());
        self
    }

    fn effective_level(&self) -> u8 {
        self.level.min(MAX_LEVEL)
    }

    fn dictionary_tail(&self) -> &[u8] {
        let dictionary = self.dictionary.as_deref().unwrap_or_default();
        &dictionary[dictionary.len().saturating_sub(WINDOW_SIZE)..]
    }

    fn hash_bits(&self, input_len: usize) -> f64 {
        match self.mem {
            Some(mem) => 12.0 + f64::from(mem.min(MAX_MEM)),
            None => {
                let log = if input_len == 0 {
                    0.0
                } else {
                    (input_len as f64).ln()
                };
                log.clamp(8.0, 13.0).ceil() * 1.5
            }
        }
    }
}

/// Compresses `data` into a raw DEFLATE stream at `level`.
pub fn compress(data: &[u8], level: u8) -> Vec<u8> {
    compress_with_options(data, &DeflateOptions::new().with_level(level))
}

/// Compresses `data` into a raw DEFLATE stream.
pub fn compress_with_options(data: &[u8], options: &DeflateOptions) -> Vec<u8> {
    let level = options.effective_level();
    let dictionary = options.dictionary_tail();
    let mut writer = BitWriter::with_capacity(data.len() / 2 + 16);

    if level == 0 {
        write_stored(&mut writer, data, true);
    } else if dictionary.is_empty() {
        let mut matcher = Matcher::new(options.hash_bits(data.len()));
        deflate_blocks(data, 0, 0, level, &mut matcher, &mut writer, true);
    } else {
        let mut window = Vec::with_capacity(dictionary.len() + data.len());
        window.extend_from_slice(dictionary);
        window.extend_from_slice(data);
        let mut matcher = Matcher::new(options.hash_bits(window.len()));
        deflate_blocks(
            &window,
            0,
            dictionary.len(),
            level,
            &mut matcher,
            &mut writer,
            true,
        );
    }

    let compressed = writer.finish();
    trace!(
        input = data.len(),
        output = compressed.len(),
        compression_level = level,
        "deflate"
    );
    compressed
}

/// Hash chains over the last 32 KiB. Positions are stored modulo the window
/// size, so the chains survive sliding the buffer by whole windows.
struct Matcher {
    head: Vec<u16>,
    prev: Vec<u16>,
    mask: usize,
    shift1: u32,
    shift2: u32,
}

impl Matcher {
    fn new(hash_bits: f64) -> Self {
        let bits = hash_bits as u32;
        let shift1 = (hash_bits / 3.0).ceil() as u32;
        let mask = (1usize << bits) - 1;
        Matcher {
            head: vec![0; mask + 1],
            prev: vec![0; WINDOW_SIZE],
            mask,
            shift1,
            shift2: shift1 * 2,
        }
    }

    fn hash(&self, data: &[u8], i: usize) -> usize {
        let hash = usize::from(data[i])
            ^ (usize::from(data[i + 1]) << self.shift1)
            ^ (usize::from(data[i + 2]) << self.shift2);
        hash & self.mask
    }
}

#[derive(Clone, Copy, Debug)]
enum Symbol {
    Literal(u8),
    Match {
        length_code: u8,
        length_extra: u16,
        distance_code: u8,
        distance_extra: u16,
    },
}

/// Symbols and statistics of the block being built.
struct Block {
    start: usize,
    symbols: Vec<Symbol>,
    literal_freqs: [u32; 288],
    distance_freqs: [u32; 32],
    extra_bits: usize,
    matches: usize,
}

impl Block {
    fn new(start: usize) -> Self {
        Block {
            start,
            symbols: Vec::with_capacity(BLOCK_SYMBOLS + 1),
            literal_freqs: [0; 288],
            distance_freqs: [0; 32],
            extra_bits: 0,
            matches: 0,
        }
    }

    fn reset(&mut self, start: usize) {
        self.start = start;
        self.symbols.clear();
        self.literal_freqs = [0; 288];
        self.distance_freqs = [0; 32];
        self.extra_bits = 0;
        self.matches = 0;
    }

    fn is_full(&self) -> bool {
        self.matches > BLOCK_MATCHES || self.symbols.len() > BLOCK_SYMBOLS
    }

    fn push_literal(&mut self, byte: u8) {
        self.symbols.push(Symbol::Literal(byte));
        self.literal_freqs[usize::from(byte)] += 1;
    }

    fn push_match(&mut self, length: usize, distance: usize) {
        let length_code = LENGTH_BASE.partition_point(|&base| usize::from(base) <= length) - 1;
        let distance_code = DIST_BASE.partition_point(|&base| usize::from(base) <= distance) - 1;
        self.symbols.push(Symbol::Match {
            length_code: length_code as u8,
            length_extra: (length - usize::from(LENGTH_BASE[length_code])) as u16,
            distance_code: distance_code as u8,
            distance_extra: (distance - usize::from(DIST_BASE[distance_code])) as u16,
        });
        self.literal_freqs[257 + length_code] += 1;
        self.distance_freqs[distance_code] += 1;
        self.extra_bits +=
            usize::from(LENGTH_EXTRA[length_code]) + usize::from(DIST_EXTRA[distance_code]);
        self.matches += 1;
    }
}

/// LZ77-codes `data[wait..]` into blocks, hashing from `index` on.
///
/// Bytes in `index..wait` only feed the hash chains (a dictionary or history
/// already emitted). Returns the position after the last byte consumed,
/// which is always `data.len()`.
fn deflate_blocks(
    data: &[u8],
    index: usize,
    wait: usize,
    level: u8,
    matcher: &mut Matcher,
    writer: &mut BitWriter,
    last: bool,
) -> usize {
    let len = data.len();
    let params = LEVEL_PARAMS[usize::from(level) - 1];
    let nice = (params >> 13) as usize;
    let max_chain = (params & 8191) as usize;

    let mut block = Block::new(wait);
    let mut i = index;
    let mut next_emit = wait;
    while i + 2 < len {
        let hash = matcher.hash(data, i);
        let mut imod = i & WINDOW_MASK;
        let mut pimod = usize::from(matcher.head[hash]);
        matcher.prev[imod] = pimod as u16;
        matcher.head[hash] = imod as u16;

        if next_emit <= i {
            let remaining = len - i;
            if block.is_full() && (remaining > MIN_TAIL || !last) {
                write_block(writer, &data[block.start..i], &mut block, false);
                block.reset(i);
            }

            let mut best_len = 2;
            let mut best_dist = 0;
            let mut chain = max_chain;
            let mut dist = imod.wrapping_sub(pimod) & WINDOW_MASK;
            if remaining > 2 && hash == matcher.hash(data, i - dist) {
                let max_nice = nice.min(remaining) - 1;
                let max_dist = (WINDOW_SIZE - 1).min(i);
                let max_len = MAX_MATCH.min(remaining);
                while dist <= max_dist {
                    chain -= 1;
                    if chain == 0 || imod == pimod {
                        break;
                    }
                    if data.get(i + best_len) == Some(&data[i + best_len - dist]) {
                        let mut found = 0;
                        while found < max_len && data[i + found] == data[i + found - dist] {
                            found += 1;
                        }
                        if found > best_len {
                            best_len = found;
                            best_dist = dist;
                            if found > max_nice {
                                break;
                            }
                            // Continue along the chain of the rarest pair in
                            // the match instead of its first bytes.
                            let span = dist.min(found - 2);
                            let mut longest_hop = 0;
                            for j in 0..span {
                                let ti = (i - dist + j) & WINDOW_MASK;
                                let hop = ti.wrapping_sub(usize::from(matcher.prev[ti]))
                                    & WINDOW_MASK;
                                if hop > longest_hop {
                                    longest_hop = hop;
                                    pimod = ti;
                                }
                            }
                        }
                    }
                    imod = pimod;
                    pimod = usize::from(matcher.prev[imod]);
                    dist += imod.wrapping_sub(pimod) & WINDOW_MASK;
                }
            }

            if best_dist > 0 {
                block.push_match(best_len, best_dist);
                next_emit = i + best_len;
            } else {
                block.push_literal(data[i]);
            }
        }
        i += 1;
    }

    for &byte in &data[i.max(next_emit).min(len)..] {
        block.push_literal(byte);
    }
    write_block(writer, &data[block.start..], &mut block, last);
    len
}

/// Writes `block` in its cheapest form; `raw` holds the bytes it covers.
fn write_block(writer: &mut BitWriter, raw: &[u8], block: &mut Block, last: bool) {
    block.literal_freqs[256] += 1;

    let (literal_lengths, literal_bits) = build_lengths(&block.literal_freqs, MAX_CODE_BITS);
    let (distance_lengths, distance_bits) = build_lengths(&block.distance_freqs, MAX_CODE_BITS);
    let (literal_ops, literal_count) = encode_lengths(&literal_lengths);
    let (distance_ops, distance_count) = encode_lengths(&distance_lengths);

    let mut length_freqs = [0u32; 19];
    for op in literal_ops.iter().chain(&distance_ops) {
        length_freqs[usize::from(op.symbol)] += 1;
    }
    let (length_lengths, length_bits) = build_lengths(&length_freqs, MAX_CODE_LENGTH_BITS);
    let length_at = |symbol: usize| length_lengths.get(symbol).copied().unwrap_or(0);
    let mut length_count = 19;
    while length_count > 4 && length_at(CODE_LENGTH_ORDER[length_count - 1]) == 0 {
        length_count -= 1;
    }

    let stored_size = (raw.len() + 5) * 8;
    let fixed_size = coded_bits(&block.literal_freqs, &FIXED_LITERAL_LENGTHS)
        + coded_bits(&block.distance_freqs, &FIXED_DISTANCE_LENGTHS)
        + block.extra_bits;
    let dynamic_size = coded_bits(&block.literal_freqs, &literal_lengths)
        + coded_bits(&block.distance_freqs, &distance_lengths)
        + block.extra_bits
        + 14
        + 3 * length_count
        + coded_bits(&length_freqs, &length_lengths)
        + 2 * length_freqs[16] as usize
        + 3 * length_freqs[17] as usize
        + 7 * length_freqs[18] as usize;

    if stored_size <= fixed_size && stored_size <= dynamic_size {
        trace!(bytes = raw.len(), last, "stored block");
        write_stored(writer, raw, last);
        return;
    }

    writer.write(u32::from(last), 1);
    if dynamic_size < fixed_size {
        trace!(
            bytes = raw.len(),
            symbols = block.symbols.len(),
            bits = dynamic_size,
            last,
            "dynamic block"
        );
        writer.write(2, 2);
        writer.write((literal_count - 257) as u32, 5);
        writer.write((distance_count - 1) as u32, 5);
        writer.write((length_count - 4) as u32, 4);
        for &symbol in &CODE_LENGTH_ORDER[..length_count] {
            writer.write(u32::from(length_at(symbol)), 3);
        }
        let length_codes = canonical_codes(&length_lengths, length_bits);
        for op in literal_ops.iter().chain(&distance_ops) {
            let symbol = usize::from(op.symbol);
            writer.write(u32::from(length_codes[symbol]), length_lengths[symbol]);
            if op.extra_bits > 0 {
                writer.write(u32::from(op.extra), op.extra_bits);
            }
        }
        let literal_codes = canonical_codes(&literal_lengths, literal_bits);
        let distance_codes = canonical_codes(&distance_lengths, distance_bits);
        write_symbols(
            writer,
            &block.symbols,
            (&literal_codes, &literal_lengths),
            (&distance_codes, &distance_lengths),
        );
    } else {
        trace!(
            bytes = raw.len(),
            symbols = block.symbols.len(),
            bits = fixed_size,
            last,
            "fixed block"
        );
        writer.write(1, 2);
        let (literal_codes, distance_codes) = fixed_codes();
        write_symbols(
            writer,
            &block.symbols,
            (literal_codes, &FIXED_LITERAL_LENGTHS),
            (distance_codes, &FIXED_DISTANCE_LENGTHS),
        );
    }
}

fn write_symbols(
    writer: &mut BitWriter,
    symbols: &[Symbol],
    (literal_codes, literal_lengths): (&[u16], &[u8]),
    (distance_codes, distance_lengths): (&[u16], &[u8]),
) {
    for symbol in symbols {
        match *symbol {
            Symbol::Literal(byte) => {
                let byte = usize::from(byte);
                writer.write(u32::from(literal_codes[byte]), literal_lengths[byte]);
            }
            Symbol::Match {
                length_code,
                length_extra,
                distance_code,
                distance_extra,
            } => {
                let length_symbol = 257 + usize::from(length_code);
                writer.write(
                    u32::from(literal_codes[length_symbol]),
                    literal_lengths[length_symbol],
                );
                let extra = LENGTH_EXTRA[usize::from(length_code)];
                if extra > 0 {
                    writer.write(u32::from(length_extra), extra);
                }
                let distance_symbol = usize::from(distance_code);
                writer.write(
                    u32::from(distance_codes[distance_symbol]),
                    distance_lengths[distance_symbol],
                );
                let extra = DIST_EXTRA[distance_symbol];
                if extra > 0 {
                    writer.write(u32::from(distance_extra), extra);
                }
            }
        }
    }
    writer.write(u32::from(literal_codes[256]), literal_lengths[256]);
}

/// Writes `data` as stored blocks of at most 65535 bytes. Empty data still
/// produces one (empty) block.
fn write_stored(writer: &mut BitWriter, data: &[u8], last: bool) {
    let chunk_count = ((data.len() + MAX_STORED_BLOCK - 1) / MAX_STORED_BLOCK).max(1);
    for index in 0..chunk_count {
        let start = index * MAX_STORED_BLOCK;
        let chunk = &data[start..(start + MAX_STORED_BLOCK).min(data.len())];
        let final_chunk = last && index + 1 == chunk_count;
        writer.write(u32::from(final_chunk), 1);
        writer.write(0, 2);
        writer.align();
        let len = chunk.len() as u16;
        writer.write_bytes(&len.to_le_bytes());
        writer.write_bytes(&(!len).to_le_bytes());
        writer.write_bytes(chunk);
    }
}

/// Incremental compressor producing one raw DEFLATE stream.
///
/// Input is buffered until 64 KiB are pending, then coded as non-final
/// blocks; [`finish`](Deflater::finish) codes the rest as the final block.
/// Matches reach back across pushes, so the output is the same kind of stream
/// [`compress`] produces.
///
/// ```
/// use serde_packr::Deflater;
///
/// let mut deflater = Deflater::new(6);
/// let mut compressed = deflater.push(b"hello ");
/// compressed.extend(deflater.push(b"hello hello"));
/// compressed.extend(deflater.finish());
/// assert_eq!(
///     serde_packr::decompress(&compressed).unwrap(),
///     b"hello hello hello"
/// );
/// ```
pub struct Deflater {
    level: u8,
    /// 32 KiB of history followed by pending input.
    window: Vec<u8>,
    matcher: Matcher,
    /// Next position to hash.
    index: usize,
    /// First position not yet coded.
    wait: usize,
    writer: BitWriter,
}

impl Deflater {
    pub fn new(level: u8) -> Self {
        Self::with_options(&DeflateOptions::new().with_level(level))
    }

    pub fn with_options(options: &DeflateOptions) -> Self {
        let dictionary = options.dictionary_tail();
        let mut window = vec![0; WINDOW_SIZE];
        window[WINDOW_SIZE - dictionary.len()..].copy_from_slice(dictionary);
        let hash_bits = match options.mem {
            Some(_) => options.hash_bits(0),
            None => STREAM_HASH_BITS,
        };
        Deflater {
            level: options.effective_level(),
            window,
            matcher: Matcher::new(hash_bits),
            index: WINDOW_SIZE - dictionary.len(),
            wait: WINDOW_SIZE,
            writer: BitWriter::default(),
        }
    }

    /// Adds input and returns whatever compressed bytes are complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.window.extend_from_slice(chunk);
        if self.window.len() - self.wait >= STREAM_BLOCK_INPUT {
            self.flush_blocks(false);
        }
        self.writer.take_bytes()
    }

    /// Codes the remaining input as the final block and returns the rest of
    /// the stream.
    pub fn finish(mut self) -> Vec<u8> {
        self.flush_blocks(true);
        self.writer.finish()
    }

    fn flush_blocks(&mut self, last: bool) {
        let pending = self.window.len() - self.wait;
        if self.level == 0 {
            write_stored(&mut self.writer, &self.window[self.wait..], last);
            self.wait = self.window.len();
            self.index = self.wait;
        } else {
            let end = deflate_blocks(
                &self.window,
                self.index,
                self.wait,
                self.level,
                &mut self.matcher,
                &mut self.writer,
                last,
            );
            // The last two positions could not be hashed without lookahead.
            self.wait = end;
            self.index = end - 2;
        }
        trace!(pending, last, "deflater flush");

        // Slide by whole windows so chain positions stay valid modulo 32 KiB.
        if self.index > 2 * WINDOW_SIZE {
            let drop = (self.index - WINDOW_SIZE) / WINDOW_SIZE * WINDOW_SIZE;
            self.window.drain(..drop);
            self.index -= drop;
            self.wait -= drop;
        }
    }
}

impl std::fmt::Debug for Deflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deflater")
            .field("level", &self.level)
            .field("pending", &(self.window.len() - self.wait))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert_eq!(compress(b"", 6), vec![0x03, 0x00]);
        assert_eq!(compress(b"", 0), vec![0x01, 0x00, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn test_stored_level() {
        let compressed = compress(b"abc", 0);
        assert_eq!(compressed, vec![0x01, 0x03, 0x00, 0xfc, 0xff, b'a', b'b', b'c']);
    }

    #[test]
    fn test_stored_chunks() {
        let data = vec![7u8; MAX_STORED_BLOCK + 10];
        let compressed = compress(&data, 0);
        // Two stored blocks: 5 header bytes each.
        assert_eq!(compressed.len(), data.len() + 10);
        assert_eq!(compressed[0], 0x00);
        assert_eq!(compressed[5 + MAX_STORED_BLOCK], 0x01);
    }

    #[test]
    fn test_repetitive_input() {
        let data = vec![b'a'; 10_000];
        let compressed = compress(&data, 6);
        assert!(compressed.len() < 100, "{} bytes", compressed.len());
    }

    #[test]
    fn test_level_clamped() {
        let data = b"clamp clamp clamp clamp".repeat(10);
        assert_eq!(compress(&data, 200), compress(&data, 9));
    }

    #[test]
    fn test_push_match() {
        let mut block = Block::new(0);
        block.push_match(258, 1);
        block.push_match(10, 32768);
        match block.symbols[0] {
            Symbol::Match {
                length_code,
                length_extra,
                distance_code,
                distance_extra,
            } => {
                assert_eq!((length_code, length_extra), (28, 0));
                assert_eq!((distance_code, distance_extra), (0, 0));
            }
            Symbol::Literal(_) => panic!("expected a match"),
        }
        match block.symbols[1] {
            Symbol::Match {
                length_code,
                distance_code,
                distance_extra,
                ..
            } => {
                assert_eq!(length_code, 7);
                assert_eq!((distance_code, distance_extra), (29, 8191));
            }
            Symbol::Literal(_) => panic!("expected a match"),
        }
        assert_eq!(block.extra_bits, 13);
        assert_eq!(block.literal_freqs[257 + 28], 1);
    }

    #[test]
    fn test_hash_bits() {
        let options = DeflateOptions::new();
        assert_eq!(options.hash_bits(0), 12.0);
        assert_eq!(options.hash_bits(10_000), 15.0);
        assert_eq!(options.clone().with_mem(4).hash_bits(10_000), 16.0);
        assert_eq!(options.with_mem(40).hash_bits(0), 24.0);
    }

    #[test]
    fn test_deflater_slides_window() {
        let data: Vec<u8> = (0..400_000u32).map(|i| (i % 251) as u8 ^ (i / 1000) as u8).collect();
        let mut deflater = Deflater::new(6);
        let mut compressed = Vec::new();
        for chunk in data.chunks(30_000) {
            compressed.extend(deflater.push(chunk));
        }
        assert!(deflater.window.len() < 4 * WINDOW_SIZE + 30_000);
        compressed.extend(deflater.finish());
        assert_eq!(crate::inflate::decompress(&compressed).unwrap(), data);
    }
}
