//! Serde deserialization from [`Value`].
//!
//! [`ValueDeserializer`] drives any `T: Deserialize` from a decoded [`Value`]
//! tree. Together with [`Unpacker`](crate::Unpacker) it backs
//! [`from_slice`](crate::from_slice) and [`from_reader`](crate::from_reader).
//!
//! Packr-specific values map onto the serde data model as follows: dates and
//! regular expressions become strings, sets and typed arrays sequences,
//! binary and raw extensions byte buffers, big integers the narrowest integer
//! that holds them. A shared node deserializes as its content.
//!
//! ```rust
//! use serde::Deserialize;
//! use serde_packr::{from_value, packr};
//!
//! #[derive(Deserialize, Debug, PartialEq)]
//! struct Data { x: i32, y: Option<i32> }
//!
//! let data: Data = from_value(packr!({ "x": 1, "y": null })).unwrap();
//! assert_eq!(data, Data { x: 1, y: None });
//! ```

use crate::value::VisitGuard;
use crate::{Error, Number, Result, TypedArray, Value};
use serde::{de, forward_to_deserialize_any, Deserialize};

/// Deserializer that reads from an owned [`Value`].
pub struct ValueDeserializer {
    value: Value,
}

impl ValueDeserializer {
    #[must_use]
    pub fn new(value: Value) -> Self {
        ValueDeserializer { value }
    }
}

fn typed_array_values(array: TypedArray) -> Vec<Value> {
    match array {
        TypedArray::Int8(v) => v.into_iter().map(Value::from).collect(),
        TypedArray::Uint8(v) | TypedArray::Uint8Clamped(v) => {
            v.into_iter().map(Value::from).collect()
        }
        TypedArray::Int16(v) => v.into_iter().map(Value::from).collect(),
        TypedArray::Uint16(v) => v.into_iter().map(Value::from).collect(),
        TypedArray::Int32(v) => v.into_iter().map(Value::from).collect(),
        TypedArray::Uint32(v) => v.into_iter().map(Value::from).collect(),
        TypedArray::Float32(v) => v.into_iter().map(Value::from).collect(),
        TypedArray::Float64(v) => v.into_iter().map(Value::from).collect(),
        TypedArray::BigInt64(v) => v.into_iter().map(Value::from).collect(),
        TypedArray::BigUint64(v) => v.into_iter().map(Value::from).collect(),
    }
}

impl<'de> de::Deserializer<'de> for ValueDeserializer {
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        match self.value {
            Value::Undefined | Value::Null => visitor.visit_unit(),
            Value::Bool(b) => visitor.visit_bool(b),
            Value::Number(Number::Integer(i)) => visitor.visit_i64(i),
            Value::Number(Number::Unsigned(u)) => visitor.visit_u64(u),
            Value::Number(n) => visitor.visit_f64(n.as_f64()),
            Value::BigInt(bi) => {
                if let Ok(i) = i64::try_from(&bi) {
                    visitor.visit_i64(i)
                } else if let Ok(u) = u64::try_from(&bi) {
                    visitor.visit_u64(u)
                } else if let Ok(i) = i128::try_from(&bi) {
                    visitor.visit_i128(i)
                } else {
                    visitor.visit_string(bi.to_string())
                }
            }
            Value::String(s) => visitor.visit_string(s),
            Value::Binary(b) => visitor.visit_byte_buf(b.to_vec()),
            Value::Array(arr) | Value::Set(arr) => visitor.visit_seq(SeqDeserializer::new(arr)),
            Value::Object(obj) => visitor.visit_map(MapDeserializer::new(
                obj.into_iter()
                    .map(|(k, v)| (Value::String(k), v))
                    .collect(),
            )),
            Value::Map(entries) => visitor.visit_map(MapDeserializer::new(entries)),
            Value::Date(dt) => visitor.visit_string(dt.to_rfc3339()),
            Value::Error(err) => visitor.visit_map(MapDeserializer::new(vec![
                (Value::from("name"), Value::String(err.name)),
                (Value::from("message"), Value::String(err.message)),
            ])),
            Value::RegExp(re) => visitor.visit_string(format!("/{}/{}", re.source, re.flags)),
            Value::TypedArray(arr) => {
                visitor.visit_seq(SeqDeserializer::new(typed_array_values(arr)))
            }
            Value::Ext(ext) => visitor.visit_byte_buf(ext.data.to_vec()),
            Value::Shared(node) => {
                let _guard = VisitGuard::enter(&node)
                    .ok_or_else(|| Error::custom("cannot deserialize a cyclic value"))?;
                let inner = node.borrow().clone();
                ValueDeserializer::new(inner).deserialize_any(visitor)
            }
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        match self.value {
            Value::Undefined | Value::Null => visitor.visit_none(),
            other => visitor.visit_some(ValueDeserializer::new(other)),
        }
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        match self.value {
            Value::String(variant) => visitor.visit_enum(EnumDeserializer::new(variant, None)),
            Value::Object(obj) if obj.len() == 1 => {
                let mut entries = obj.into_iter();
                match entries.next() {
                    Some((variant, value)) => {
                        visitor.visit_enum(EnumDeserializer::new(variant, Some(value)))
                    }
                    None => Err(Error::custom("expected an enum variant")),
                }
            }
            other => Err(Error::custom(format!(
                "expected string or single-key object for enum, found {}",
                other.kind_name()
            ))),
        }
    }

    fn deserialize_newtype_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple
        tuple_struct map struct identifier ignored_any
    }
}

struct SeqDeserializer {
    iter: std::vec::IntoIter<Value>,
}

impl SeqDeserializer {
    fn new(vec: Vec<Value>) -> Self {
        SeqDeserializer {
            iter: vec.into_iter(),
        }
    }
}

impl<'de> de::SeqAccess<'de> for SeqDeserializer {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: de::DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some(value) => seed.deserialize(ValueDeserializer::new(value)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        match self.iter.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(upper),
            _ => None,
        }
    }
}

struct MapDeserializer {
    iter: std::vec::IntoIter<(Value, Value)>,
    value: Option<Value>,
}

impl MapDeserializer {
    fn new(entries: Vec<(Value, Value)>) -> Self {
        MapDeserializer {
            iter: entries.into_iter(),
            value: None,
        }
    }
}

impl<'de> de::MapAccess<'de> for MapDeserializer {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: de::DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some((key, value)) => {
                self.value = Some(value);
                seed.deserialize(ValueDeserializer::new(key)).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: de::DeserializeSeed<'de>,
    {
        match self.value.take() {
            Some(value) => seed.deserialize(ValueDeserializer::new(value)),
            None => Err(Error::custom("object value requested before its key")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        match self.iter.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(upper),
            _ => None,
        }
    }
}

struct EnumDeserializer {
    variant: String,
    value: Option<Value>,
}

impl EnumDeserializer {
    fn new(variant: String, value: Option<Value>) -> Self {
        EnumDeserializer { variant, value }
    }
}

impl<'de> de::EnumAccess<'de> for EnumDeserializer {
    type Error = Error;
    type Variant = VariantDeserializer;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self::Variant)>
    where
        V: de::DeserializeSeed<'de>,
    {
        let variant = seed.deserialize(ValueDeserializer::new(Value::String(self.variant)))?;
        let visitor = VariantDeserializer { value: self.value };
        Ok((variant, visitor))
    }
}

struct VariantDeserializer {
    value: Option<Value>,
}

impl<'de> de::VariantAccess<'de> for VariantDeserializer {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        match self.value {
            Some(Value::Null) | None => Ok(()),
            _ => Err(Error::custom("unit variant carries a payload")),
        }
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value>
    where
        T: de::DeserializeSeed<'de>,
    {
        match self.value {
            Some(value) => seed.deserialize(ValueDeserializer::new(value)),
            None => Err(Error::custom("newtype variant has no payload")),
        }
    }

    fn tuple_variant<V>(self, _len: usize, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        match self.value {
            Some(Value::Array(arr)) => visitor.visit_seq(SeqDeserializer::new(arr)),
            _ => Err(Error::custom("tuple variant payload must be an array")),
        }
    }

    fn struct_variant<V>(self, _fields: &'static [&'static str], visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        match self.value {
            Some(value @ Value::Object(_)) => {
                de::Deserializer::deserialize_any(ValueDeserializer::new(value), visitor)
            }
            _ => Err(Error::custom("struct variant payload must be an object")),
        }
    }
}

/// Deserialize an instance of type `T` from a [`Value`].
///
/// # Errors
///
/// Returns an error if the value does not match the shape `T` expects.
pub fn from_value<T>(value: Value) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    T::deserialize(ValueDeserializer::new(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorValue, SharedValue};
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Deserialize, Debug, PartialEq)]
    enum Op {
        Stop,
        Move(i32, i32),
        Rename { to: String },
    }

    #[test]
    fn test_enum_round_trip_through_value() {
        let stop: Op = from_value(Value::from("Stop")).unwrap();
        assert_eq!(stop, Op::Stop);

        let mut obj = crate::ObjectMap::new();
        obj.insert("Move".to_string(), Value::from(vec![1, 2]));
        let moved: Op = from_value(Value::Object(obj)).unwrap();
        assert_eq!(moved, Op::Move(1, 2));

        let mut inner = crate::ObjectMap::new();
        inner.insert("to".to_string(), Value::from("b"));
        let mut obj = crate::ObjectMap::new();
        obj.insert("Rename".to_string(), Value::Object(inner));
        let renamed: Op = from_value(Value::Object(obj)).unwrap();
        assert_eq!(renamed, Op::Rename { to: "b".to_string() });
    }

    #[test]
    fn test_map_with_integer_keys() {
        let value = Value::Map(vec![(Value::from(1), Value::from("a"))]);
        let map: BTreeMap<u8, String> = from_value(value).unwrap();
        assert_eq!(map.get(&1).map(String::as_str), Some("a"));
    }

    #[test]
    fn test_undefined_is_none_and_shared_is_transparent() {
        let missing: Option<u32> = from_value(Value::Undefined).unwrap();
        assert_eq!(missing, None);

        let shared = Value::Shared(SharedValue::new(Value::from(vec![1, 2, 3])));
        let numbers: Vec<u8> = from_value(shared).unwrap();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_cycle_is_an_error() {
        let node = SharedValue::new(Value::Array(vec![]));
        node.push(Value::Shared(node.clone()));
        let result: Result<Vec<Vec<u8>>> = from_value(Value::Shared(node.clone()));
        assert!(result.is_err());
        node.replace(Value::Null);
    }

    #[test]
    fn test_error_value_as_struct() {
        #[derive(Deserialize)]
        struct Failure {
            name: String,
            message: String,
        }
        let failure: Failure = from_value(Value::Error(ErrorValue::new("RangeError", "bad"))).unwrap();
        assert_eq!(failure.name, "RangeError");
        assert_eq!(failure.message, "bad");
    }

    #[test]
    fn test_typed_array_as_sequence() {
        let floats: Vec<f64> =
            from_value(Value::TypedArray(TypedArray::Float64(vec![0.5, 1.5]))).unwrap();
        assert_eq!(floats, vec![0.5, 1.5]);
    }
}
