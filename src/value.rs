//! Dynamic value representation for packr data.
//!
//! This module provides the [`Value`] enum, the in-memory form of everything the
//! codec can encode or decode.
//!
//! ## Core Types
//!
//! - [`Value`]: any packr value (scalars, containers, dates, sets, errors,
//!   regular expressions, typed arrays, raw extensions and shared nodes)
//! - [`Number`]: integers, floats and the special float values
//! - [`SharedValue`]: a node with identity, the only way to express shared
//!   subtrees and cycles
//! - [`TypedArray`], [`ErrorValue`], [`RegExpValue`], [`ExtValue`]
//!
//! ## Usage Patterns
//!
//! ### Creating Values
//!
//! ```rust
//! use serde_packr::{packr, Value};
//!
//! let number = Value::from(42);
//! let text = Value::from("hello");
//! let list = Value::from(vec![1, 2, 3]);
//!
//! let obj = packr!({
//!     "name": "Alice",
//!     "age": 30
//! });
//! assert!(obj.is_object());
//! ```
//!
//! ### Shared Nodes and Cycles
//!
//! ```rust
//! use serde_packr::{SharedValue, Value};
//!
//! let node = SharedValue::new(Value::Array(vec![]));
//! node.push(Value::Shared(node.clone()));
//!
//! let value = Value::Shared(node.clone());
//! assert_eq!(value, value.clone());
//!
//! // Rc cycles are never freed on their own; break them when done.
//! node.replace(Value::Null);
//! ```
//!
//! ### Extracting Values
//!
//! ```rust
//! use serde_packr::Value;
//! use std::convert::TryFrom;
//!
//! let value = Value::from(42);
//! let num: i64 = i64::try_from(value).unwrap();
//! assert_eq!(num, 42);
//! ```

use crate::ObjectMap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

/// A dynamically-typed representation of any packr value.
///
/// `Object` keeps string keys in insertion order, which is also the field order
/// of the record shape the encoder assigns to it. `Map` holds arbitrary keys.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{Number, Value};
///
/// let null = Value::Null;
/// let num = Value::Number(Number::Integer(42));
/// let text = Value::String("hello".to_string());
///
/// assert!(null.is_null());
/// assert!(num.is_number());
/// assert!(text.is_string());
/// ```
#[derive(Clone, Debug, Default)]
pub enum Value {
    Undefined,
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    BigInt(BigInt),
    String(String),
    Binary(Bytes),
    Array(Vec<Value>),
    Object(ObjectMap),
    Map(Vec<(Value, Value)>),
    Date(DateTime<Utc>),
    Set(Vec<Value>),
    Error(ErrorValue),
    RegExp(RegExpValue),
    TypedArray(TypedArray),
    Ext(ExtValue),
    Shared(SharedValue),
}

/// A numeric value: integer, float, or one of the special float values.
///
/// `Unsigned` only holds values above `i64::MAX`; smaller unsigned values are
/// `Integer`. `Float` never holds NaN or an infinity, so derived equality
/// treats `NaN` as equal to itself.
///
/// # Examples
///
/// ```rust
/// use serde_packr::Number;
///
/// assert_eq!(Number::from(f64::NAN), Number::NaN);
/// assert_eq!(Number::from(u64::MAX), Number::Unsigned(u64::MAX));
/// assert_eq!(Number::from(7u64), Number::Integer(7));
/// assert!(Number::Infinity.is_special());
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Infinity,
    NegativeInfinity,
    NaN,
}

impl Number {
    /// Returns `true` if this is an integer value.
    #[inline]
    #[must_use]
    pub const fn is_integer(&self) -> bool {
        matches!(self, Number::Integer(_) | Number::Unsigned(_))
    }

    /// Returns `true` if this is a finite floating-point value.
    #[inline]
    #[must_use]
    pub const fn is_float(&self) -> bool {
        matches!(self, Number::Float(_))
    }

    /// Returns `true` if this is Infinity, -Infinity or NaN.
    #[inline]
    #[must_use]
    pub const fn is_special(&self) -> bool {
        matches!(
            self,
            Number::Infinity | Number::NegativeInfinity | Number::NaN
        )
    }

    /// Converts this number to an `i64` if it is integral and in range.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_packr::Number;
    ///
    /// assert_eq!(Number::Integer(42).as_i64(), Some(42));
    /// assert_eq!(Number::Float(42.0).as_i64(), Some(42));
    /// assert_eq!(Number::Float(42.5).as_i64(), None);
    /// assert_eq!(Number::Unsigned(u64::MAX).as_i64(), None);
    /// ```
    #[inline]
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Number::Integer(i) => Some(*i),
            Number::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Converts this number to a `u64` if it is integral and non-negative.
    #[inline]
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Number::Unsigned(u) => Some(*u),
            Number::Integer(i) => u64::try_from(*i).ok(),
            Number::Float(f) => {
                if f.fract() == 0.0 && *f >= 0.0 && *f < u64::MAX as f64 {
                    Some(*f as u64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Converts this number to an `f64`.
    #[inline]
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Integer(i) => *i as f64,
            Number::Unsigned(u) => *u as f64,
            Number::Float(f) => *f,
            Number::Infinity => f64::INFINITY,
            Number::NegativeInfinity => f64::NEG_INFINITY,
            Number::NaN => f64::NAN,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Integer(i) => write!(f, "{}", i),
            Number::Unsigned(u) => write!(f, "{}", u),
            Number::Float(fl) => write!(f, "{}", fl),
            Number::Infinity => write!(f, "Infinity"),
            Number::NegativeInfinity => write!(f, "-Infinity"),
            Number::NaN => write!(f, "NaN"),
        }
    }
}

macro_rules! impl_number_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Number {
                fn from(value: $ty) -> Self {
                    Number::Integer(value as i64)
                }
            }

            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Number(Number::Integer(value as i64))
                }
            }
        )*
    };
}

impl_number_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Number {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(i) => Number::Integer(i),
            Err(_) => Number::Unsigned(value),
        }
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        if value.is_nan() {
            Number::NaN
        } else if value == f64::INFINITY {
            Number::Infinity
        } else if value == f64::NEG_INFINITY {
            Number::NegativeInfinity
        } else {
            Number::Float(value)
        }
    }
}

impl From<f32> for Number {
    fn from(value: f32) -> Self {
        Number::from(value as f64)
    }
}

/// A value node with identity.
///
/// Cloning a `SharedValue` clones the handle, not the content. With structured
/// clone enabled the encoder writes each node once and points back to it on
/// every later encounter, so shared subtrees and cycles survive a round trip.
///
/// Equality compares identity first, then content; pairs of nodes already
/// being compared are assumed equal, so comparing two cyclic graphs ends.
///
/// A cycle of `SharedValue`s keeps itself alive. Call [`SharedValue::replace`]
/// on one node of the cycle to release it.
#[derive(Clone)]
pub struct SharedValue(Rc<RefCell<Value>>);

impl SharedValue {
    /// Wraps a value in a new shared node.
    #[must_use]
    pub fn new(value: Value) -> Self {
        SharedValue(Rc::new(RefCell::new(value)))
    }

    /// Borrows the node content.
    ///
    /// # Panics
    ///
    /// Panics if the content is currently mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, Value> {
        self.0.borrow()
    }

    /// Mutably borrows the node content.
    ///
    /// # Panics
    ///
    /// Panics if the content is currently borrowed.
    pub fn borrow_mut(&self) -> RefMut<'_, Value> {
        self.0.borrow_mut()
    }

    /// Replaces the node content, returning the previous value.
    pub fn replace(&self, value: Value) -> Value {
        self.0.replace(value)
    }

    /// Appends to the content if it is an array or a set.
    ///
    /// Returns `false` (and drops `item`) for any other content.
    pub fn push(&self, item: Value) -> bool {
        match &mut *self.0.borrow_mut() {
            Value::Array(items) | Value::Set(items) => {
                items.push(item);
                true
            }
            _ => false,
        }
    }

    /// Returns `true` if both handles point at the same node.
    #[must_use]
    pub fn ptr_eq(&self, other: &SharedValue) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Borrows the content unless it is mutably borrowed.
    pub(crate) fn try_borrow(&self) -> Option<Ref<'_, Value>> {
        self.0.try_borrow().ok()
    }

    /// Address of the node, stable for the node's lifetime.
    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

thread_local! {
    static COMPARING: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
    static VISITING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a node as being visited on this thread for the guard's lifetime.
///
/// `enter` returns `None` when the node is already on the visiting stack,
/// which means the traversal reached it again through a cycle.
pub(crate) struct VisitGuard(usize);

impl VisitGuard {
    pub(crate) fn enter(node: &SharedValue) -> Option<VisitGuard> {
        let addr = node.addr();
        VISITING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&addr) {
                None
            } else {
                stack.push(addr);
                Some(VisitGuard(addr))
            }
        })
    }
}

impl Drop for VisitGuard {
    fn drop(&mut self) {
        VISITING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|addr| *addr == self.0) {
                stack.remove(pos);
            }
        });
    }
}

impl PartialEq for SharedValue {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let pair = (self.addr(), other.addr());
        let in_progress = COMPARING.with(|pairs| {
            let mut pairs = pairs.borrow_mut();
            if pairs.contains(&pair) {
                true
            } else {
                pairs.push(pair);
                false
            }
        });
        if in_progress {
            return true;
        }
        let equal = *self.0.borrow() == *other.0.borrow();
        COMPARING.with(|pairs| {
            let mut pairs = pairs.borrow_mut();
            if let Some(pos) = pairs.iter().rposition(|p| *p == pair) {
                pairs.remove(pos);
            }
        });
        equal
    }
}

/// Structural equality. A shared node compares equal to a plain value equal
/// to its content, so a decoded tree matches its source whether or not a node
/// was written with a reference header.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Shared(a), Value::Shared(b)) => a == b,
            (Value::Shared(a), b) => a.try_borrow().is_some_and(|a| *a == *b),
            (a, Value::Shared(b)) => b.try_borrow().is_some_and(|b| *a == *b),
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Array(a), Value::Array(b)) | (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::RegExp(a), Value::RegExp(b)) => a == b,
            (Value::TypedArray(a), Value::TypedArray(b)) => a == b,
            (Value::Ext(a), Value::Ext(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match VisitGuard::enter(self) {
            Some(_guard) => f.debug_tuple("Shared").field(&*self.0.borrow()).finish(),
            None => f.write_str("<cycle>"),
        }
    }
}

/// Element kinds of a typed array, in wire sub-tag order.
///
/// # Examples
///
/// ```rust
/// use serde_packr::TypedArray;
///
/// let floats = TypedArray::Float32(vec![1.5, -2.0]);
/// assert_eq!(floats.kind(), 7);
/// assert_eq!(floats.len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum TypedArray {
    Int8(Vec<i8>),
    Uint8(Vec<u8>),
    Uint8Clamped(Vec<u8>),
    Int16(Vec<i16>),
    Uint16(Vec<u16>),
    Int32(Vec<i32>),
    Uint32(Vec<u32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    BigInt64(Vec<i64>),
    BigUint64(Vec<u64>),
}

impl TypedArray {
    /// The wire sub-tag of this element kind.
    #[must_use]
    pub const fn kind(&self) -> u8 {
        match self {
            TypedArray::Int8(_) => 0,
            TypedArray::Uint8(_) => 1,
            TypedArray::Uint8Clamped(_) => 2,
            TypedArray::Int16(_) => 3,
            TypedArray::Uint16(_) => 4,
            TypedArray::Int32(_) => 5,
            TypedArray::Uint32(_) => 6,
            TypedArray::Float32(_) => 7,
            TypedArray::Float64(_) => 8,
            TypedArray::BigInt64(_) => 9,
            TypedArray::BigUint64(_) => 10,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            TypedArray::Int8(v) => v.len(),
            TypedArray::Uint8(v) | TypedArray::Uint8Clamped(v) => v.len(),
            TypedArray::Int16(v) => v.len(),
            TypedArray::Uint16(v) => v.len(),
            TypedArray::Int32(v) => v.len(),
            TypedArray::Uint32(v) => v.len(),
            TypedArray::Float32(v) => v.len(),
            TypedArray::Float64(v) => v.len(),
            TypedArray::BigInt64(v) => v.len(),
            TypedArray::BigUint64(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements as little-endian bytes.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        fn collect<T, const N: usize>(items: &[T], f: impl Fn(&T) -> [u8; N]) -> Vec<u8> {
            items.iter().flat_map(f).collect()
        }
        match self {
            TypedArray::Int8(v) => collect(v, |x| x.to_le_bytes()),
            TypedArray::Uint8(v) | TypedArray::Uint8Clamped(v) => v.clone(),
            TypedArray::Int16(v) => collect(v, |x| x.to_le_bytes()),
            TypedArray::Uint16(v) => collect(v, |x| x.to_le_bytes()),
            TypedArray::Int32(v) => collect(v, |x| x.to_le_bytes()),
            TypedArray::Uint32(v) => collect(v, |x| x.to_le_bytes()),
            TypedArray::Float32(v) => collect(v, |x| x.to_le_bytes()),
            TypedArray::Float64(v) => collect(v, |x| x.to_le_bytes()),
            TypedArray::BigInt64(v) => collect(v, |x| x.to_le_bytes()),
            TypedArray::BigUint64(v) => collect(v, |x| x.to_le_bytes()),
        }
    }

    /// Rebuilds a typed array from its sub-tag and little-endian elements.
    ///
    /// Returns `None` for an unknown kind or a byte length that is not a
    /// multiple of the element size.
    #[must_use]
    pub fn from_le_bytes(kind: u8, bytes: &[u8]) -> Option<TypedArray> {
        fn split<T, const N: usize>(bytes: &[u8], f: impl Fn([u8; N]) -> T) -> Option<Vec<T>> {
            if bytes.len() % N != 0 {
                return None;
            }
            bytes
                .chunks_exact(N)
                .map(|chunk| <[u8; N]>::try_from(chunk).ok().map(&f))
                .collect()
        }
        Some(match kind {
            0 => TypedArray::Int8(bytes.iter().map(|b| *b as i8).collect()),
            1 => TypedArray::Uint8(bytes.to_vec()),
            2 => TypedArray::Uint8Clamped(bytes.to_vec()),
            3 => TypedArray::Int16(split(bytes, i16::from_le_bytes)?),
            4 => TypedArray::Uint16(split(bytes, u16::from_le_bytes)?),
            5 => TypedArray::Int32(split(bytes, i32::from_le_bytes)?),
            6 => TypedArray::Uint32(split(bytes, u32::from_le_bytes)?),
            7 => TypedArray::Float32(split(bytes, f32::from_le_bytes)?),
            8 => TypedArray::Float64(split(bytes, f64::from_le_bytes)?),
            9 => TypedArray::BigInt64(split(bytes, i64::from_le_bytes)?),
            10 => TypedArray::BigUint64(split(bytes, u64::from_le_bytes)?),
            _ => return None,
        })
    }
}

/// An error object: name, message and an optional cause.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub cause: Option<Box<Value>>,
}

impl ErrorValue {
    /// Creates an error value without a cause.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_packr::ErrorValue;
    ///
    /// let err = ErrorValue::new("TypeError", "not a function");
    /// assert_eq!(err.name, "TypeError");
    /// assert!(err.cause.is_none());
    /// ```
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorValue {
            name: name.into(),
            message: message.into(),
            cause: None,
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// A regular expression, kept as source text and flags.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RegExpValue {
    pub source: String,
    pub flags: String,
}

impl RegExpValue {
    #[must_use]
    pub fn new(source: impl Into<String>, flags: impl Into<String>) -> Self {
        RegExpValue {
            source: source.into(),
            flags: flags.into(),
        }
    }
}

/// An extension payload with no registered interpretation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtValue {
    pub tag: u8,
    pub data: Bytes,
}

impl Value {
    /// Wraps a value in a new [`SharedValue`] node.
    #[must_use]
    pub fn shared(value: Value) -> Value {
        Value::Shared(SharedValue::new(value))
    }

    /// Creates a binary value.
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Value {
        Value::Binary(data.into())
    }

    /// Returns `true` if the value is undefined.
    #[inline]
    #[must_use]
    pub const fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Returns `true` if the value is null.
    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns `true` if the value is a boolean.
    #[inline]
    #[must_use]
    pub const fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    /// Returns `true` if the value is a number.
    #[inline]
    #[must_use]
    pub const fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    /// Returns `true` if the value is a big integer.
    #[inline]
    #[must_use]
    pub const fn is_bigint(&self) -> bool {
        matches!(self, Value::BigInt(_))
    }

    /// Returns `true` if the value is a string.
    #[inline]
    #[must_use]
    pub const fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// Returns `true` if the value is binary data.
    #[inline]
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Value::Binary(_))
    }

    /// Returns `true` if the value is an array.
    #[inline]
    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Returns `true` if the value is an object.
    #[inline]
    #[must_use]
    pub const fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Returns `true` if the value is a map with arbitrary keys.
    #[inline]
    #[must_use]
    pub const fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    /// Returns `true` if the value is a date.
    #[inline]
    #[must_use]
    pub const fn is_date(&self) -> bool {
        matches!(self, Value::Date(_))
    }

    /// Returns `true` if the value is a shared node.
    #[inline]
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self, Value::Shared(_))
    }

    /// If the value is a boolean, returns it. Otherwise returns `None`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_packr::Value;
    ///
    /// assert_eq!(Value::Bool(true).as_bool(), Some(true));
    /// assert_eq!(Value::from(42).as_bool(), None);
    /// ```
    #[inline]
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// If the value is a string, returns a reference to it. Otherwise returns `None`.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// If the value is an integral number that fits `i64`, returns it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_packr::{Number, Value};
    ///
    /// assert_eq!(Value::Number(Number::Integer(42)).as_i64(), Some(42));
    /// assert_eq!(Value::Number(Number::Float(42.5)).as_i64(), None);
    /// ```
    #[inline]
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            Value::BigInt(b) => i64::try_from(b).ok(),
            _ => None,
        }
    }

    /// If the value is a non-negative integral number that fits `u64`, returns it.
    #[inline]
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            Value::BigInt(b) => u64::try_from(b).ok(),
            _ => None,
        }
    }

    /// If the value is a number, returns it as `f64`.
    #[inline]
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n.as_f64()),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectMap> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Date(dt) => Some(dt),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_bigint(&self) -> Option<&BigInt> {
        match self {
            Value::BigInt(bi) => Some(bi),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_shared(&self) -> Option<&SharedValue> {
        match self {
            Value::Shared(node) => Some(node),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Map(_) => "map",
            Value::Date(_) => "date",
            Value::Set(_) => "set",
            Value::Error(_) => "error",
            Value::RegExp(_) => "regexp",
            Value::TypedArray(_) => "typed array",
            Value::Ext(_) => "extension",
            Value::Shared(_) => "shared",
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::{Error as _, SerializeMap, SerializeSeq};

        match self {
            Value::Undefined | Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(Number::Integer(i)) => serializer.serialize_i64(*i),
            Value::Number(Number::Unsigned(u)) => serializer.serialize_u64(*u),
            Value::Number(n) => serializer.serialize_f64(n.as_f64()),
            Value::BigInt(bi) => {
                if let Ok(i) = i64::try_from(bi) {
                    serializer.serialize_i64(i)
                } else if let Ok(u) = u64::try_from(bi) {
                    serializer.serialize_u64(u)
                } else {
                    serializer.serialize_str(&bi.to_string())
                }
            }
            Value::String(s) => serializer.serialize_str(s),
            Value::Binary(b) => serializer.serialize_bytes(b),
            Value::Array(items) | Value::Set(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for element in items {
                    seq.serialize_element(element)?;
                }
                seq.end()
            }
            Value::Object(obj) => {
                let mut map = serializer.serialize_map(Some(obj.len()))?;
                for (k, v) in obj.iter() {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Date(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            Value::Error(err) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("name", &err.name)?;
                map.serialize_entry("message", &err.message)?;
                map.end()
            }
            Value::RegExp(re) => serializer.serialize_str(&format!("/{}/{}", re.source, re.flags)),
            Value::TypedArray(arr) => match arr {
                TypedArray::Int8(v) => v.serialize(serializer),
                TypedArray::Uint8(v) | TypedArray::Uint8Clamped(v) => v.serialize(serializer),
                TypedArray::Int16(v) => v.serialize(serializer),
                TypedArray::Uint16(v) => v.serialize(serializer),
                TypedArray::Int32(v) => v.serialize(serializer),
                TypedArray::Uint32(v) => v.serialize(serializer),
                TypedArray::Float32(v) => v.serialize(serializer),
                TypedArray::Float64(v) => v.serialize(serializer),
                TypedArray::BigInt64(v) => v.serialize(serializer),
                TypedArray::BigUint64(v) => v.serialize(serializer),
            },
            Value::Ext(ext) => serializer.serialize_bytes(&ext.data),
            Value::Shared(node) => match VisitGuard::enter(node) {
                Some(_guard) => node.borrow().serialize(serializer),
                None => Err(S::Error::custom("cannot serialize a cyclic value")),
            },
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("any valid packr value")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
                Ok(Value::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
                Ok(Value::Number(Number::Integer(value)))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Value::Number(Number::from(value)))
            }

            fn visit_i128<E>(self, value: i128) -> Result<Self::Value, E> {
                Ok(match i64::try_from(value) {
                    Ok(i) => Value::Number(Number::Integer(i)),
                    Err(_) => Value::BigInt(BigInt::from(value)),
                })
            }

            fn visit_u128<E>(self, value: u128) -> Result<Self::Value, E> {
                Ok(match u64::try_from(value) {
                    Ok(u) => Value::Number(Number::from(u)),
                    Err(_) => Value::BigInt(BigInt::from(value)),
                })
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E> {
                Ok(Value::Number(Number::from(value)))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E> {
                Ok(Value::String(value.to_string()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E> {
                Ok(Value::String(value))
            }

            fn visit_bytes<E>(self, value: &[u8]) -> Result<Self::Value, E> {
                Ok(Value::Binary(Bytes::copy_from_slice(value)))
            }

            fn visit_byte_buf<E>(self, value: Vec<u8>) -> Result<Self::Value, E> {
                Ok(Value::Binary(Bytes::from(value)))
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: Deserializer<'de>,
            {
                Deserialize::deserialize(deserializer)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut vec = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(elem) = seq.next_element()? {
                    vec.push(elem);
                }
                Ok(Value::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut entries: Vec<(Value, Value)> = Vec::new();
                while let Some(entry) = map.next_entry()? {
                    entries.push(entry);
                }
                if entries.iter().all(|(k, _)| k.is_string()) {
                    let mut object = ObjectMap::with_capacity(entries.len());
                    for (k, v) in entries {
                        if let Value::String(s) = k {
                            object.insert(s, v);
                        }
                    }
                    Ok(Value::Object(object))
                } else {
                    Ok(Value::Map(entries))
                }
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl TryFrom<Value> for i64 {
    type Error = crate::Error;

    fn try_from(value: Value) -> crate::Result<Self> {
        value.as_i64().ok_or_else(|| {
            crate::Error::custom(format!("expected integer, found {}", value.kind_name()))
        })
    }
}

impl TryFrom<Value> for u64 {
    type Error = crate::Error;

    fn try_from(value: Value) -> crate::Result<Self> {
        value.as_u64().ok_or_else(|| {
            crate::Error::custom(format!(
                "expected unsigned integer, found {}",
                value.kind_name()
            ))
        })
    }
}

impl TryFrom<Value> for f64 {
    type Error = crate::Error;

    fn try_from(value: Value) -> crate::Result<Self> {
        match value {
            Value::Number(n) => Ok(n.as_f64()),
            _ => Err(crate::Error::custom(format!(
                "expected number, found {}",
                value.kind_name()
            ))),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = crate::Error;

    fn try_from(value: Value) -> crate::Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            _ => Err(crate::Error::custom(format!(
                "expected bool, found {}",
                value.kind_name()
            ))),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = crate::Error;

    fn try_from(value: Value) -> crate::Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            _ => Err(crate::Error::custom(format!(
                "expected string, found {}",
                value.kind_name()
            ))),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Number(Number::from(value))
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Number(Number::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(Number::from(value))
    }
}

impl From<Number> for Value {
    fn from(value: Number) -> Self {
        Value::Number(value)
    }
}

impl From<BigInt> for Value {
    fn from(value: BigInt) -> Self {
        Value::BigInt(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Binary(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<ObjectMap> for Value {
    fn from(value: ObjectMap) -> Self {
        Value::Object(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Date(value)
    }
}

impl From<TypedArray> for Value {
    fn from(value: TypedArray) -> Self {
        Value::TypedArray(value)
    }
}

impl From<ErrorValue> for Value {
    fn from(value: ErrorValue) -> Self {
        Value::Error(value)
    }
}

impl From<RegExpValue> for Value {
    fn from(value: RegExpValue) -> Self {
        Value::RegExp(value)
    }
}

impl From<SharedValue> for Value {
    fn from(value: SharedValue) -> Self {
        Value::Shared(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn test_tryfrom_i64() {
        let value = Value::Number(Number::Integer(42));
        assert_eq!(i64::try_from(value).unwrap(), 42);

        let value = Value::Number(Number::Float(42.0));
        assert_eq!(i64::try_from(value).unwrap(), 42);

        let value = Value::BigInt(BigInt::from(-7));
        assert_eq!(i64::try_from(value).unwrap(), -7);

        assert!(i64::try_from(Value::from("test")).is_err());
    }

    #[test]
    fn test_tryfrom_f64_and_special_values() {
        assert_eq!(f64::try_from(Value::from(3.5)).unwrap(), 3.5);
        assert_eq!(f64::try_from(Value::from(42)).unwrap(), 42.0);
        assert_eq!(
            f64::try_from(Value::from(f64::INFINITY)).unwrap(),
            f64::INFINITY
        );
        assert!(f64::try_from(Value::from(f64::NAN)).unwrap().is_nan());
    }

    #[test]
    fn test_number_normalization() {
        assert_eq!(Value::from(f64::NAN), Value::Number(Number::NaN));
        assert_eq!(Value::from(f64::NAN), Value::from(f64::NAN));
        assert_eq!(
            Value::from(f64::NEG_INFINITY),
            Value::Number(Number::NegativeInfinity)
        );
        assert_eq!(Value::from(5u64), Value::Number(Number::Integer(5)));
        assert_eq!(
            Value::from(u64::MAX),
            Value::Number(Number::Unsigned(u64::MAX))
        );
        assert_eq!(Number::Unsigned(u64::MAX).as_u64(), Some(u64::MAX));
        assert_eq!(Number::Integer(-1).as_u64(), None);
    }

    #[test]
    fn test_from_collections() {
        let value = Value::from(vec![1, 2]);
        assert_eq!(
            value,
            Value::Array(vec![Value::from(1i32), Value::from(2i32)])
        );

        let mut map = ObjectMap::new();
        map.insert("key".to_string(), Value::from(42i32));
        assert_eq!(Value::from(map.clone()), Value::Object(map));

        assert_eq!(Value::from(None::<i32>), Value::Null);
    }

    #[test]
    fn test_shared_identity_and_structural_equality() {
        let a = SharedValue::new(Value::from("x"));
        let b = SharedValue::new(Value::from("x"));
        assert!(!a.ptr_eq(&b));
        assert_eq!(a, b);
        assert!(a.ptr_eq(&a.clone()));

        b.replace(Value::from("y"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_cyclic_equality_and_debug_terminate() {
        let a = SharedValue::new(Value::Array(vec![]));
        assert!(a.push(Value::Shared(a.clone())));
        let b = SharedValue::new(Value::Array(vec![]));
        assert!(b.push(Value::Shared(b.clone())));

        assert_eq!(Value::Shared(a.clone()), Value::Shared(b.clone()));
        assert!(format!("{:?}", a).contains("<cycle>"));

        a.replace(Value::Null);
        b.replace(Value::Null);
    }

    #[test]
    fn test_serialize_cycle_is_an_error() {
        let a = SharedValue::new(Value::Array(vec![]));
        a.push(Value::Shared(a.clone()));
        assert!(serde_json::to_string(&Value::Shared(a.clone())).is_err());
        a.replace(Value::Null);
    }

    #[test]
    fn test_serialize_dates_and_bigints_as_text() {
        let date = DateTime::from_timestamp(0, 0).unwrap();
        let big = BigInt::from(u128::MAX);
        let value = Value::Array(vec![Value::Date(date), Value::BigInt(big.clone())]);
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            serde_json::json!(["1970-01-01T00:00:00+00:00", big.to_string()])
        );
    }

    #[test]
    fn test_typed_array_bytes() {
        let arr = TypedArray::Int16(vec![1, -2]);
        let bytes = arr.to_le_bytes();
        assert_eq!(bytes, vec![1, 0, 0xfe, 0xff]);
        assert_eq!(TypedArray::from_le_bytes(3, &bytes), Some(arr));
        assert_eq!(TypedArray::from_le_bytes(3, &[1, 2, 3]), None);
        assert_eq!(TypedArray::from_le_bytes(11, &[]), None);
    }

    #[test]
    fn test_const_is_methods() {
        const fn check_undefined(v: &Value) -> bool {
            v.is_undefined()
        }

        assert!(check_undefined(&Value::Undefined));
        assert!(!check_undefined(&Value::Null));
    }
}
