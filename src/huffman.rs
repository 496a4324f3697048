//! Huffman trees and bit output shared by the DEFLATE compressor and
//! decompressor.

use std::sync::OnceLock;

/// Base match length for each length code (symbols 257..=285).
pub(crate) const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];
pub(crate) const LENGTH_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
/// Base distance for each distance code.
pub(crate) const DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
pub(crate) const DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];
/// Transmission order of the code length code lengths.
pub(crate) const CODE_LENGTH_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

pub(crate) const MAX_CODE_BITS: u8 = 15;
pub(crate) const MAX_CODE_LENGTH_BITS: u8 = 7;

/// Literal/length code lengths of the fixed Huffman block type.
pub(crate) const fn fixed_literal_lengths() -> [u8; 288] {
    let mut lengths = [8u8; 288];
    let mut i = 144;
    while i < 256 {
        lengths[i] = 9;
        i += 1;
    }
    while i < 280 {
        lengths[i] = 7;
        i += 1;
    }
    lengths
}

pub(crate) const FIXED_LITERAL_LENGTHS: [u8; 288] = fixed_literal_lengths();
pub(crate) const FIXED_DISTANCE_LENGTHS: [u8; 32] = [5; 32];

/// Bit-reversed canonical codes of the fixed tables, `(literal, distance)`.
pub(crate) fn fixed_codes() -> &'static (Vec<u16>, Vec<u16>) {
    static CODES: OnceLock<(Vec<u16>, Vec<u16>)> = OnceLock::new();
    CODES.get_or_init(|| {
        (
            canonical_codes(&FIXED_LITERAL_LENGTHS, 9),
            canonical_codes(&FIXED_DISTANCE_LENGTHS, 5),
        )
    })
}

/// Computes code lengths for `freqs`, limited to `max_bits`.
///
/// Returns the lengths (indexed by symbol, trimmed after the last used one)
/// and the longest length. A lone symbol gets length 1; no symbols give an
/// empty table.
pub(crate) fn build_lengths(freqs: &[u32], max_bits: u8) -> (Vec<u8>, u8) {
    let mut leaves: Vec<(u32, usize)> = freqs
        .iter()
        .enumerate()
        .filter(|(_, &freq)| freq > 0)
        .map(|(symbol, &freq)| (freq, symbol))
        .collect();

    match leaves.as_slice() {
        [] => return (Vec::new(), 0),
        [(_, symbol)] => {
            let mut lengths = vec![0; symbol + 1];
            lengths[*symbol] = 1;
            return (lengths, 1);
        }
        _ => {}
    }

    // Stable: equal frequencies keep symbol order.
    leaves.sort_by_key(|&(freq, _)| freq);
    let leaf_count = leaves.len();

    // Two-queue construction. Node `i < leaf_count` is a leaf, node
    // `leaf_count + k` is the k-th merged node.
    let mut merged: Vec<u32> = Vec::with_capacity(leaf_count - 1);
    let mut children: Vec<(usize, usize)> = Vec::with_capacity(leaf_count - 1);
    let (mut leaf_head, mut merged_head) = (0, 0);
    while merged.len() < leaf_count - 1 {
        let (left_freq, left) = take_lightest(&leaves, &merged, &mut leaf_head, &mut merged_head);
        let (right_freq, right) =
            take_lightest(&leaves, &merged, &mut leaf_head, &mut merged_head);
        merged.push(left_freq + right_freq);
        children.push((left, right));
    }

    let max_symbol = leaves.iter().map(|&(_, symbol)| symbol).max().unwrap_or(0);
    let mut lengths = vec![0u8; max_symbol + 1];
    let mut longest = 0u8;
    let mut stack = vec![(2 * leaf_count - 2, 0u8)];
    while let Some((node, depth)) = stack.pop() {
        if node < leaf_count {
            lengths[leaves[node].1] = depth;
            longest = longest.max(depth);
        } else {
            let (left, right) = children[node - leaf_count];
            stack.push((left, depth + 1));
            stack.push((right, depth + 1));
        }
    }

    if longest > max_bits {
        limit_lengths(&mut lengths, &leaves, longest, max_bits);
        longest = max_bits;
    }
    (lengths, longest)
}

fn take_lightest(
    leaves: &[(u32, usize)],
    merged: &[u32],
    leaf_head: &mut usize,
    merged_head: &mut usize,
) -> (u32, usize) {
    let take_merged = match (merged.get(*merged_head), leaves.get(*leaf_head)) {
        (Some(&merged_freq), Some(&(leaf_freq, _))) => merged_freq < leaf_freq,
        (Some(_), None) => true,
        _ => false,
    };
    if take_merged {
        let index = *merged_head;
        *merged_head += 1;
        (merged[index], leaves.len() + index)
    } else {
        let index = *leaf_head;
        *leaf_head += 1;
        (leaves[index].0, index)
    }
}

/// Clamps over-long codes to `max_bits`, then lengthens the shortest
/// remaining codes until the Kraft sum is back to one.
fn limit_lengths(lengths: &mut [u8], leaves: &[(u32, usize)], longest: u8, max_bits: u8) {
    let shift = longest - max_bits;
    let unit = 1i64 << shift;

    let mut order = leaves.to_vec();
    order.sort_by(|a, b| {
        lengths[b.1]
            .cmp(&lengths[a.1])
            .then_with(|| a.0.cmp(&b.0))
    });

    let mut i = 0;
    let mut debt = 0i64;
    while i < order.len() {
        let symbol = order[i].1;
        if lengths[symbol] <= max_bits {
            break;
        }
        debt += unit - (1i64 << (longest - lengths[symbol]));
        lengths[symbol] = max_bits;
        i += 1;
    }
    debt >>= shift;

    while debt > 0 && i < order.len() {
        let symbol = order[i].1;
        if lengths[symbol] < max_bits {
            debt -= 1i64 << (max_bits - lengths[symbol] - 1);
            lengths[symbol] += 1;
        } else {
            i += 1;
        }
    }

    // Overpaid: give back slack by shortening max-length codes.
    let mut j = i.min(order.len() - 1) as isize;
    while j >= 0 && debt != 0 {
        let symbol = order[j as usize].1;
        if lengths[symbol] == max_bits {
            lengths[symbol] -= 1;
            debt += 1;
        }
        j -= 1;
    }
}

/// First canonical code of every length, indexed by length.
pub(crate) fn first_codes(lengths: &[u8], max_bits: u8) -> Vec<u32> {
    let max_bits = usize::from(max_bits);
    let mut counts = vec![0u32; max_bits + 1];
    for &length in lengths.iter().filter(|&&length| length > 0) {
        counts[usize::from(length)] += 1;
    }
    let mut next = vec![0u32; max_bits + 1];
    let mut code = 0u32;
    for bits in 1..=max_bits {
        code = (code + counts[bits - 1]) << 1;
        next[bits] = code;
    }
    next
}

/// Reverses the low `bits` bits of `code`.
pub(crate) fn reverse_bits(code: u32, bits: u8) -> u32 {
    if bits == 0 {
        return 0;
    }
    code.reverse_bits() >> (32 - u32::from(bits))
}

/// Canonical codes for `lengths`, bit-reversed for LSB-first output.
pub(crate) fn canonical_codes(lengths: &[u8], max_bits: u8) -> Vec<u16> {
    let mut next = first_codes(lengths, max_bits);
    lengths
        .iter()
        .map(|&length| {
            if length == 0 {
                return 0;
            }
            let code = next[usize::from(length)];
            next[usize::from(length)] += 1;
            reverse_bits(code, length) as u16
        })
        .collect()
}

/// Total bits to code `freqs` with `lengths`.
pub(crate) fn coded_bits(freqs: &[u32], lengths: &[u8]) -> usize {
    freqs
        .iter()
        .zip(lengths)
        .map(|(&freq, &length)| freq as usize * usize::from(length))
        .sum()
}

/// One entry of a run-length encoded code length sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LengthOp {
    pub symbol: u8,
    pub extra: u8,
    pub extra_bits: u8,
}

impl LengthOp {
    fn plain(length: u8) -> Self {
        LengthOp {
            symbol: length,
            extra: 0,
            extra_bits: 0,
        }
    }

    fn repeat(symbol: u8, extra: usize, extra_bits: u8) -> Self {
        LengthOp {
            symbol,
            extra: extra as u8,
            extra_bits,
        }
    }
}

/// Run-length encodes code lengths with symbols 16 (repeat previous),
/// 17 (short zero run) and 18 (long zero run).
///
/// Returns the ops and the number of lengths they cover: everything up to
/// the last non-zero length, and at least one.
pub(crate) fn encode_lengths(lengths: &[u8]) -> (Vec<LengthOp>, usize) {
    let count = lengths
        .iter()
        .rposition(|&length| length != 0)
        .map_or(1, |last| last + 1);
    let at = |i: usize| lengths.get(i).copied().unwrap_or(0);

    let mut ops = Vec::with_capacity(count);
    let mut current = at(0);
    let mut run = 1usize;
    for i in 1..=count {
        if i != count && at(i) == current {
            run += 1;
            continue;
        }
        if current == 0 && run > 2 {
            while run > 138 {
                ops.push(LengthOp::repeat(18, 127, 7));
                run -= 138;
            }
            if run > 10 {
                ops.push(LengthOp::repeat(18, run - 11, 7));
                run = 0;
            } else if run > 2 {
                ops.push(LengthOp::repeat(17, run - 3, 3));
                run = 0;
            }
        } else if run > 3 {
            ops.push(LengthOp::plain(current));
            run -= 1;
            while run > 6 {
                ops.push(LengthOp::repeat(16, 3, 2));
                run -= 6;
            }
            if run > 2 {
                ops.push(LengthOp::repeat(16, run - 3, 2));
                run = 0;
            }
        }
        ops.extend(std::iter::repeat(LengthOp::plain(current)).take(run));
        run = 1;
        current = at(i);
    }
    (ops, count)
}

/// LSB-first bit sink.
#[derive(Debug, Default)]
pub(crate) struct BitWriter {
    out: Vec<u8>,
    acc: u64,
    bits: u32,
}

impl BitWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        BitWriter {
            out: Vec::with_capacity(capacity),
            acc: 0,
            bits: 0,
        }
    }

    /// Writes the low `count` bits of `value`; `count` is at most 32.
    pub fn write(&mut self, value: u32, count: u8) {
        self.acc |= u64::from(value) << self.bits;
        self.bits += u32::from(count);
        while self.bits >= 8 {
            self.out.push(self.acc as u8);
            self.acc >>= 8;
            self.bits -= 8;
        }
    }

    /// Pads to the next byte boundary with zero bits.
    pub fn align(&mut self) {
        if self.bits > 0 {
            self.out.push(self.acc as u8);
            self.acc = 0;
            self.bits = 0;
        }
    }

    /// Appends whole bytes; the writer must be aligned.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        debug_assert_eq!(self.bits, 0);
        self.out.extend_from_slice(bytes);
    }

    /// Removes and returns the completed bytes, keeping pending bits.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.align();
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kraft_sum(lengths: &[u8]) -> f64 {
        lengths
            .iter()
            .filter(|&&length| length > 0)
            .map(|&length| 2f64.powi(-i32::from(length)))
            .sum()
    }

    #[test]
    fn test_build_lengths_small() {
        let (lengths, longest) = build_lengths(&[5, 1, 1, 2], 15);
        assert_eq!(lengths, vec![1, 3, 3, 2]);
        assert_eq!(longest, 3);
    }

    #[test]
    fn test_build_lengths_degenerate() {
        assert_eq!(build_lengths(&[0, 0, 0], 15), (Vec::new(), 0));
        assert_eq!(build_lengths(&[0, 0, 9], 15), (vec![0, 0, 1], 1));
    }

    #[test]
    fn test_length_limit() {
        // Fibonacci frequencies produce a maximally skewed tree.
        let mut freqs = vec![1u32, 1];
        while freqs.len() < 30 {
            let next = freqs[freqs.len() - 1] + freqs[freqs.len() - 2];
            freqs.push(next);
        }
        let (lengths, longest) = build_lengths(&freqs, 15);
        assert_eq!(longest, 15);
        assert!(lengths.iter().all(|&length| (1..=15).contains(&length)));
        assert!((kraft_sum(&lengths) - 1.0).abs() < 1e-12);

        let (lengths, longest) = build_lengths(&freqs[..19], 7);
        assert_eq!(longest, 7);
        assert!(kraft_sum(&lengths) <= 1.0);
    }

    #[test]
    fn test_canonical_codes() {
        // RFC 1951 section 3.2.2 example: lengths (3,3,3,3,3,2,4,4).
        let lengths = [3, 3, 3, 3, 3, 2, 4, 4];
        let codes = canonical_codes(&lengths, 4);
        let expected = [0b010, 0b011, 0b100, 0b101, 0b110, 0b00, 0b1110, 0b1111];
        for (symbol, &code) in expected.iter().enumerate() {
            assert_eq!(
                u32::from(codes[symbol]),
                reverse_bits(code, lengths[symbol])
            );
        }
    }

    #[test]
    fn test_fixed_tables() {
        let (literal, distance) = fixed_codes();
        // 256 is the first 7-bit code, all zeros.
        assert_eq!(literal[256], 0);
        // 'A' (65) is 0x30 + 65 in 8 bits.
        assert_eq!(u32::from(literal[65]), reverse_bits(0x30 + 65, 8));
        assert_eq!(u32::from(distance[3]), reverse_bits(3, 5));
    }

    #[test]
    fn test_encode_lengths_runs() {
        let mut lengths = vec![0u8; 20];
        lengths.extend([4; 8]);
        lengths.push(3);
        let (ops, count) = encode_lengths(&lengths);
        assert_eq!(count, 29);
        assert_eq!(
            ops,
            vec![
                LengthOp::repeat(18, 9, 7),
                LengthOp::plain(4),
                LengthOp::repeat(16, 3, 2),
                LengthOp::plain(4),
                LengthOp::plain(3),
            ]
        );

        let (ops, count) = encode_lengths(&[]);
        assert_eq!(count, 1);
        assert_eq!(ops, vec![LengthOp::plain(0)]);
    }

    #[test]
    fn test_bit_writer() {
        let mut writer = BitWriter::default();
        writer.write(1, 1);
        writer.write(0b10, 2);
        writer.write(0x1ff, 9);
        assert_eq!(writer.take_bytes(), vec![0b1111_1101]);
        writer.align();
        writer.write_bytes(&[0xaa]);
        assert_eq!(writer.finish(), vec![0x0f, 0xaa]);
    }
}
