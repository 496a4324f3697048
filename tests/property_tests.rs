//! Property-based tests for the round-trip and truncation guarantees.

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_packr::{
    compress, decode, decode_with_options, decompress, encode, encode_with_options, from_slice,
    to_vec, ObjectMap, Options, Value,
};

fn roundtrip<T: Serialize + for<'de> Deserialize<'de> + PartialEq + std::fmt::Debug>(
    value: &T,
) -> bool {
    match to_vec(value) {
        Ok(bytes) => match from_slice::<T>(&bytes) {
            Ok(back) => *value == back,
            Err(e) => {
                eprintln!("Deserialize failed: {}", e);
                eprintln!("Encoded was: {:02x?}", bytes);
                false
            }
        },
        Err(e) => {
            eprintln!("Serialize failed: {}", e);
            false
        }
    }
}

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        any::<u64>().prop_map(Value::from),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(Value::from),
        ".{0,40}".prop_map(Value::from),
        prop::collection::vec(any::<u8>(), 0..40).prop_map(Value::binary),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::vec(("[a-d]{1,3}", inner), 0..6).prop_map(|fields| {
                let mut object = ObjectMap::new();
                for (key, value) in fields {
                    object.insert(key, value);
                }
                Value::Object(object)
            }),
        ]
    })
}

proptest! {
    #[test]
    fn prop_value_roundtrip(v in value()) {
        let bytes = encode(&v).unwrap();
        prop_assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn prop_plain_roundtrip(v in value()) {
        let bytes = encode_with_options(&v, Options::plain()).unwrap();
        prop_assert_eq!(decode_with_options(&bytes, Options::plain()).unwrap(), v);
    }

    #[test]
    fn prop_bundled_roundtrip(v in value()) {
        let options = Options::new().with_bundle_strings(true);
        let bytes = encode_with_options(&v, options.clone()).unwrap();
        prop_assert_eq!(decode_with_options(&bytes, options).unwrap(), v);
    }

    #[test]
    fn prop_prefix_is_incomplete(v in value(), cut in any::<prop::sample::Index>()) {
        let bytes = encode(&v).unwrap();
        let cut = cut.index(bytes.len());
        let err = decode(&bytes[..cut]).unwrap_err();
        prop_assert!(err.is_incomplete(), "cut {} of {:02x?}: {}", cut, bytes, err);
    }

    #[test]
    fn prop_compress_roundtrip(
        data in prop::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), any::<u8>()], 0..5000),
        level in 0u8..=9,
    ) {
        let compressed = compress(&data, level);
        prop_assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn prop_i64(n in any::<i64>()) {
        prop_assert!(roundtrip(&n));
    }

    #[test]
    fn prop_u64(n in any::<u64>()) {
        prop_assert!(roundtrip(&n));
    }

    #[test]
    fn prop_vec_string(v in prop::collection::vec(".{0,20}", 0..20)) {
        prop_assert!(roundtrip(&v));
    }

    #[test]
    fn prop_option_i32(opt in proptest::option::of(any::<i32>())) {
        prop_assert!(roundtrip(&opt));
    }

    #[test]
    fn prop_tuple_i32_bool(t in (any::<i32>(), any::<bool>())) {
        prop_assert!(roundtrip(&t));
    }
}
