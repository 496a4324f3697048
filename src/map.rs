//! Ordered map type for packr objects.
//!
//! [`ObjectMap`] wraps an [`IndexMap`] so that object fields keep their
//! insertion order. The order is part of the wire contract: the record trie
//! classifies an object by its key sequence, so two objects with the same keys
//! in different orders are two different record shapes.
//!
//! ## Examples
//!
//! ```rust
//! use serde_packr::{ObjectMap, Value};
//!
//! let mut map = ObjectMap::new();
//! map.insert("name".to_string(), Value::from("Alice"));
//! map.insert("age".to_string(), Value::from(30));
//!
//! assert_eq!(map.len(), 2);
//! assert_eq!(map.get("name").and_then(|v| v.as_str()), Some("Alice"));
//! assert_eq!(map.shape().collect::<Vec<_>>(), ["name", "age"]);
//! ```

use crate::Value;
use indexmap::IndexMap;

/// Object fields in insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectMap(IndexMap<String, Value>);

impl ObjectMap {
    #[must_use]
    pub fn new() -> Self {
        ObjectMap(IndexMap::new())
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        ObjectMap(IndexMap::with_capacity(capacity))
    }

    /// Builds an object from a record's field list and its values, pairing
    /// them in order. Extra values are ignored; missing ones leave the field
    /// out.
    #[must_use]
    pub fn from_record(keys: &[String], values: impl IntoIterator<Item = Value>) -> Self {
        keys.iter().cloned().zip(values).collect()
    }

    /// Sets a field. A key that is already present keeps its position, so
    /// overwriting never changes the object's shape.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_packr::{ObjectMap, Value};
    ///
    /// let mut map = ObjectMap::new();
    /// assert!(map.insert("key".to_string(), Value::from(42)).is_none());
    /// assert!(map.insert("key".to_string(), Value::from(43)).is_some());
    /// ```
    pub fn insert(&mut self, key: String, value: Value) -> Option<Value> {
        self.0.insert(key, value)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.get_mut(key)
    }

    /// Removes a field; later fields move up, so the shape loses one key
    /// rather than being reordered.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The key sequence that identifies this object's record shape.
    pub fn shape(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(String::as_str)
    }

    /// `true` when both objects have the same keys in the same order.
    #[must_use]
    pub fn same_shape(&self, other: &ObjectMap) -> bool {
        self.len() == other.len() && self.shape().eq(other.shape())
    }

    pub fn keys(&self) -> indexmap::map::Keys<'_, String, Value> {
        self.0.keys()
    }

    pub fn values(&self) -> indexmap::map::Values<'_, String, Value> {
        self.0.values()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Value> {
        self.0.iter()
    }
}

impl IntoIterator for ObjectMap {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ObjectMap {
    type Item = (&'a String, &'a Value);
    type IntoIter = indexmap::map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for ObjectMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        ObjectMap(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_follows_insertion_order() {
        let mut a = ObjectMap::new();
        a.insert("x".to_string(), Value::from(1));
        a.insert("y".to_string(), Value::from(2));
        let mut b = ObjectMap::new();
        b.insert("y".to_string(), Value::from(2));
        b.insert("x".to_string(), Value::from(1));

        assert!(!a.same_shape(&b));
        b.remove("y");
        b.insert("y".to_string(), Value::Null);
        assert!(a.same_shape(&b));
    }

    #[test]
    fn test_from_record() {
        let keys = vec!["id".to_string(), "name".to_string()];
        let object = ObjectMap::from_record(&keys, vec![Value::from(7), Value::from("n")]);
        assert_eq!(object.shape().collect::<Vec<_>>(), ["id", "name"]);
        assert_eq!(object.get("id"), Some(&Value::from(7)));
    }
}
