use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde_packr::{
    compress, compress_with_options, decompress, decompress_and_unpack, decompress_with_dictionary,
    pack_and_compress, pack_and_compress_with_options, DeflateOptions, Deflater, Error, Options,
    Value,
};
use std::io::{Read, Write};

/// Deterministic, moderately compressible text.
fn sample_text(len: usize) -> Vec<u8> {
    let words = [
        "record", "shape", "deflate", "window", "huffman", "value", "store", "bundle", "stream",
    ];
    let mut state = 0x2545_f491u32;
    let mut out = Vec::with_capacity(len + 16);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        out.extend_from_slice(words[state as usize % words.len()].as_bytes());
        out.push(if state % 7 == 0 { b'\n' } else { b' ' });
    }
    out.truncate(len);
    out
}

/// Deterministic bytes with no structure to exploit.
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    (0..len)
        .map(|_| {
            state ^= state << 7;
            state ^= state >> 9;
            (state >> 24) as u8
        })
        .collect()
}

fn inflate_with_flate2(compressed: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    DeflateDecoder::new(compressed)
        .read_to_end(&mut out)
        .unwrap();
    out
}

fn deflate_with_flate2(data: &[u8], level: u32) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn test_flate2_reads_our_output() {
    let inputs = [
        Vec::new(),
        vec![0x42],
        vec![b'a'; 10_000],
        sample_text(100_000),
        noise(70_000),
    ];
    for data in &inputs {
        for level in 0..=9 {
            let compressed = compress(data, level);
            assert_eq!(
                inflate_with_flate2(&compressed),
                *data,
                "len {} level {level}",
                data.len()
            );
        }
    }
}

#[test]
fn test_tiny_inputs_roundtrip() {
    for data in [Vec::new(), vec![0u8], vec![0xff], b"ab".to_vec()] {
        for level in [0, 1, 6, 9] {
            let compressed = compress(&data, level);
            assert_eq!(decompress(&compressed).unwrap(), data, "level {level}");
        }
    }
}

#[test]
fn test_we_read_flate2_output() {
    for data in [Vec::new(), sample_text(50_000), noise(20_000)] {
        for level in [0, 1, 6, 9] {
            let compressed = deflate_with_flate2(&data, level);
            assert_eq!(decompress(&compressed).unwrap(), data, "level {level}");
        }
    }
}

#[test]
fn test_levels_trade_size() {
    let data = sample_text(200_000);
    let stored = compress(&data, 0);
    let fast = compress(&data, 1);
    let best = compress(&data, 9);
    assert!(stored.len() > data.len());
    assert!(fast.len() < data.len() / 2);
    assert!(best.len() <= fast.len());
}

#[test]
fn test_incompressible_input_stays_close_to_raw() {
    let data = noise(100_000);
    let compressed = compress(&data, 6);
    // a handful of stored block headers at most
    assert!(compressed.len() <= data.len() + 64);
    assert_eq!(decompress(&compressed).unwrap(), data);
}

#[test]
fn test_memory_setting() {
    let data = sample_text(80_000);
    for mem in [0, 4, 12] {
        let options = DeflateOptions::new().with_mem(mem);
        let compressed = compress_with_options(&data, &options);
        assert_eq!(inflate_with_flate2(&compressed), data, "mem {mem}");
    }
}

#[test]
fn test_dictionary() {
    let dictionary = sample_text(4_000);
    let data = [&dictionary[1_000..3_000], b"tail".as_slice()].concat();
    let options = DeflateOptions::new().with_dictionary(dictionary.clone());
    let with_dictionary = compress_with_options(&data, &options);
    let without = compress(&data, 6);
    assert!(with_dictionary.len() < without.len());

    assert_eq!(
        decompress_with_dictionary(&with_dictionary, &dictionary).unwrap(),
        data
    );
    assert!(matches!(
        decompress(&with_dictionary),
        Err(Error::InvalidDeflate { .. })
    ));
}

#[test]
fn test_streaming_matches_one_shot_content() {
    let data = sample_text(300_000);
    let mut deflater = Deflater::new(6);
    let mut compressed = Vec::new();
    for chunk in data.chunks(7_919) {
        compressed.extend(deflater.push(chunk));
    }
    compressed.extend(deflater.finish());
    assert_eq!(inflate_with_flate2(&compressed), data);
    assert_eq!(decompress(&compressed).unwrap(), data);
}

#[test]
fn test_streaming_with_dictionary() {
    let dictionary = sample_text(10_000);
    let data = sample_text(90_000);
    let options = DeflateOptions::new().with_level(9).with_dictionary(dictionary.clone());
    let mut deflater = Deflater::with_options(&options);
    let mut compressed = Vec::new();
    for chunk in data.chunks(40_000) {
        compressed.extend(deflater.push(chunk));
    }
    compressed.extend(deflater.finish());
    assert_eq!(
        decompress_with_dictionary(&compressed, &dictionary).unwrap(),
        data
    );
}

#[test]
fn test_streaming_empty() {
    let deflater = Deflater::new(6);
    let compressed = deflater.finish();
    assert_eq!(decompress(&compressed).unwrap(), Vec::<u8>::new());
}

#[test]
fn test_truncated_stream() {
    let compressed = compress(&sample_text(5_000), 6);
    for cut in [0, 1, compressed.len() / 2, compressed.len() - 1] {
        let err = decompress(&compressed[..cut]).unwrap_err();
        assert!(err.is_incomplete(), "cut {cut}: {err}");
    }
}

#[test]
fn test_pack_and_compress_pipeline() {
    let rows: Vec<Value> = (0..500)
        .map(|i| {
            serde_packr::packr!({ "id": i, "name": "row", "ok": true })
        })
        .collect();
    let value = Value::Array(rows);
    let packed = serde_packr::encode(&value).unwrap();
    let compressed = pack_and_compress(&value).unwrap();
    assert!(compressed.len() < packed.len());
    assert_eq!(decompress(&compressed).unwrap(), packed);
    assert_eq!(decompress_and_unpack(&compressed).unwrap(), value);

    let plain = pack_and_compress_with_options(
        &value,
        Options::plain(),
        &DeflateOptions::new().with_level(1),
    )
    .unwrap();
    assert_eq!(
        serde_packr::decode_with_options(&decompress(&plain).unwrap(), Options::plain()).unwrap(),
        value
    );
}
