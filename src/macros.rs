/// Builds a [`Value`](crate::Value) from a JSON-like literal.
///
/// Object literals keep their field order, so the macro is a convenient way to
/// produce values with a known record shape.
///
/// ```rust
/// use serde_packr::{packr, Value};
///
/// let row = packr!({ "id": 1, "tags": ["a", "b"], "parent": null });
/// assert_eq!(row.as_object().map(|o| o.len()), Some(3));
/// assert_eq!(packr!(undefined), Value::Undefined);
/// ```
#[macro_export]
macro_rules! packr {
    (null) => {
        $crate::Value::Null
    };

    (undefined) => {
        $crate::Value::Undefined
    };

    (true) => {
        $crate::Value::Bool(true)
    };

    (false) => {
        $crate::Value::Bool(false)
    };

    ([]) => {
        $crate::Value::Array(vec![])
    };

    ([ $($elem:tt),* $(,)? ]) => {
        $crate::Value::Array(vec![$($crate::packr!($elem)),*])
    };

    ({}) => {
        $crate::Value::Object($crate::ObjectMap::new())
    };

    ({ $($key:literal : $value:tt),* $(,)? }) => {{
        let mut object = $crate::ObjectMap::new();
        $(
            object.insert($key.to_string(), $crate::packr!($value));
        )*
        $crate::Value::Object(object)
    }};

    // Any other expression goes through the serde bridge
    ($s:expr) => {{
        $crate::to_value(&$s).unwrap_or($crate::Value::Null)
    }};
}

#[cfg(test)]
mod tests {
    use crate::{Number, ObjectMap, Value};

    #[test]
    fn test_packr_macro_primitives() {
        assert_eq!(packr!(null), Value::Null);
        assert_eq!(packr!(undefined), Value::Undefined);
        assert_eq!(packr!(true), Value::Bool(true));
        assert_eq!(packr!(42), Value::Number(Number::Integer(42)));
        assert_eq!(packr!(3.5), Value::Number(Number::Float(3.5)));
        assert_eq!(packr!("hello"), Value::String("hello".to_string()));
    }

    #[test]
    fn test_packr_macro_containers() {
        assert_eq!(packr!([]), Value::Array(vec![]));
        assert_eq!(packr!({}), Value::Object(ObjectMap::new()));

        let obj = packr!({ "b": 1, "a": [2, 3] });
        let keys: Vec<_> = obj.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(
            obj.as_object().unwrap().get("a"),
            Some(&Value::from(vec![2, 3]))
        );
    }
}
