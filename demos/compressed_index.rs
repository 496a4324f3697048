//! Packing a table and compressing it with raw DEFLATE.
//!
//! Run with: cargo run --example compressed_index

use serde::{Deserialize, Serialize};
use serde_packr::{
    decompress_and_unpack_with_options, from_value, pack_and_compress_with_options, to_value,
    DeflateOptions, Options,
};
use std::error::Error;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Entry {
    path: String,
    size: u64,
    modified: i64,
}

fn main() -> Result<(), Box<dyn Error>> {
    let entries: Vec<Entry> = (0..1000)
        .map(|i| Entry {
            path: format!("/srv/data/{}/part-{:05}.bin", i % 16, i),
            size: 4096 * (i as u64 % 37 + 1),
            modified: 1_700_000_000 + i,
        })
        .collect();
    let value = to_value(&entries)?;

    let options = Options::new().with_bundle_strings(true);
    let dictionary = b"/srv/data/part-.bin".to_vec();
    for level in [1, 6, 9] {
        let deflate = DeflateOptions::new()
            .with_level(level)
            .with_dictionary(dictionary.clone());
        let bytes = pack_and_compress_with_options(&value, options.clone(), &deflate)?;
        println!("level {}: {} bytes", level, bytes.len());

        let back = decompress_and_unpack_with_options(&bytes, options.clone(), &deflate)?;
        let entries_back: Vec<Entry> = from_value(back)?;
        assert_eq!(entries, entries_back);
    }
    println!("✓ Round-trip successful");

    Ok(())
}
