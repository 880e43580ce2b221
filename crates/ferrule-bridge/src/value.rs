//! Runtime value representation crossing the native boundary.
//!
//! Every argument and result of a foreign call is a [`Value`]. The enum is
//! deliberately small: numbers ride as `f64` unless they fall outside the
//! 53-bit safe integer range, in which case the lossless [`Value::Int64`] and
//! [`Value::UInt64`] variants carry them. Strings and aggregates are
//! reference-counted, so cloning a value never copies payload bytes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::types::TypeDesc;

/// Largest integer magnitude that survives a round trip through `f64`.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Managed function invoked by native code through a trampoline.
pub type CallbackFn = Arc<dyn Fn(&[Value]) -> Result<Value, BridgeError> + Send + Sync>;

/// A value passed to or returned from native code.
#[derive(Clone)]
pub enum Value {
    /// Absence of a value, marshaled as a null pointer or zero.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Any number that fits `f64` without loss.
    Number(f64),
    /// Signed integer outside the 53-bit safe range.
    Int64(i64),
    /// Unsigned integer outside the 53-bit safe range.
    UInt64(u64),
    /// UTF-8 text.
    String(Arc<String>),
    /// Ordered sequence, used for C arrays and primitive output slots.
    Array(ValueArray),
    /// Named fields, used for C structs and unions.
    Record(ValueMap),
    /// Typed address of native memory or of a native function.
    Pointer(PointerValue),
    /// Managed function that native code may call back into.
    Callback(CallbackFn),
}

/// A typed address handed out by native code or by callback registration.
#[derive(Clone)]
pub struct PointerValue {
    addr: usize,
    ty: Arc<TypeDesc>,
}

impl PointerValue {
    pub fn new(addr: usize, ty: Arc<TypeDesc>) -> Self {
        PointerValue { addr, ty }
    }

    /// Raw address as an integer.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Pointer type this address was produced with.
    pub fn type_desc(&self) -> &Arc<TypeDesc> {
        &self.ty
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
}

impl fmt::Debug for PointerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PointerValue({:#x}: {})", self.addr, self.ty.name())
    }
}

impl PartialEq for PointerValue {
    /// Two pointers are equal when they carry the same address. The type tag
    /// is a marshaling hint, not part of identity.
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

/// A copy-on-write array of values backed by `Arc`.
///
/// Cloning is O(1). Mutation clones the backing vector only when the `Arc`
/// is shared.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueArray {
    inner: Arc<Vec<Value>>,
}

impl ValueArray {
    pub fn new() -> Self {
        ValueArray {
            inner: Arc::new(Vec::new()),
        }
    }

    pub fn from_vec(values: Vec<Value>) -> Self {
        ValueArray {
            inner: Arc::new(values),
        }
    }

    /// Read access, no clone needed.
    pub fn as_slice(&self) -> &[Value] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.inner.get(index)
    }

    /// Append a value, cloning the backing storage only if shared.
    pub fn push(&mut self, value: Value) {
        Arc::make_mut(&mut self.inner).push(value);
    }

    /// Replace the value at `index`. Returns `false` when out of bounds.
    pub fn set(&mut self, index: usize, value: Value) -> bool {
        match Arc::make_mut(&mut self.inner).get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.inner.iter()
    }
}

impl Default for ValueArray {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<Value>> for ValueArray {
    fn from(values: Vec<Value>) -> Self {
        Self::from_vec(values)
    }
}

impl FromIterator<Value> for ValueArray {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

/// A copy-on-write string-keyed map backed by `Arc`.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ValueMap {
    inner: Arc<HashMap<String, Value>>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.get(key)
    }

    /// Insert a field, cloning the backing storage only if shared.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.inner).insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.inner.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.inner.iter()
    }
}

impl FromIterator<(String, Value)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        ValueMap {
            inner: Arc::new(iter.into_iter().collect()),
        }
    }
}

impl Value {
    /// Build a string value.
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(Arc::new(s.into()))
    }

    /// Build an array value from a vector.
    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(ValueArray::from_vec(values))
    }

    /// Build a record value from field pairs.
    ///
    /// # Examples
    ///
    /// ```
    /// # use ferrule_bridge::Value;
    /// let v = Value::record([("x", Value::Number(1.0)), ("y", Value::Number(2.0))]);
    /// assert_eq!(v.as_record().unwrap().len(), 2);
    /// ```
    pub fn record<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Record(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// Build a typed pointer value from a raw address.
    pub fn pointer(addr: usize, ty: Arc<TypeDesc>) -> Self {
        Value::Pointer(PointerValue::new(addr, ty))
    }

    /// Wrap a managed function so native code can call it.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, BridgeError> + Send + Sync + 'static,
    {
        Value::Callback(Arc::new(f))
    }

    /// Lossless signed integer: `Number` within the safe range, `Int64` past it.
    pub fn integer(v: i64) -> Self {
        if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&v) {
            Value::Number(v as f64)
        } else {
            Value::Int64(v)
        }
    }

    /// Lossless unsigned integer: `Number` within the safe range, `UInt64` past it.
    pub fn unsigned(v: u64) -> Self {
        if v <= MAX_SAFE_INTEGER as u64 {
            Value::Number(v as f64)
        } else {
            Value::UInt64(v)
        }
    }

    /// Human-readable name of the value shape, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Int64(_) | Value::UInt64(_) => "big integer",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
            Value::Pointer(_) => "pointer",
            Value::Callback(_) => "callback",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view. Booleans coerce to 0 or 1 the way C promotes them.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Int64(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Signed integer view. Fractional numbers truncate toward zero like a
    /// C cast; unsigned values wrap.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => Some(*n as i64),
            Value::Int64(v) => Some(*v),
            Value::UInt64(v) => Some(*v as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Unsigned integer view with C cast semantics for negatives.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => {
                if *n < 0.0 {
                    Some((*n as i64) as u64)
                } else {
                    Some(*n as u64)
                }
            }
            Value::Int64(v) => Some(*v as u64),
            Value::UInt64(v) => Some(*v),
            Value::Bool(b) => Some(u64::from(*b)),
            _ => None,
        }
    }

    /// Boolean view. Numbers coerce by zero test.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(*n != 0.0),
            Value::Int64(v) => Some(*v != 0),
            Value::UInt64(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ValueArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ValueArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&ValueMap> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_record_mut(&mut self) -> Option<&mut ValueMap> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&PointerValue> {
        match self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::UInt64(a), Value::UInt64(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::Callback(a), Value::Callback(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::Int64(v) => write!(f, "Int64({v})"),
            Value::UInt64(v) => write!(f, "UInt64({v})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Array(a) => f.debug_tuple("Array").field(&a.as_slice()).finish(),
            Value::Record(r) => {
                let mut map = f.debug_map();
                for (k, v) in r.iter() {
                    map.entry(k, v);
                }
                map.finish()
            }
            Value::Pointer(p) => write!(f, "{p:?}"),
            Value::Callback(_) => f.write_str("Callback(<managed>)"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::integer(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::unsigned(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_normalization() {
        assert_eq!(Value::integer(42), Value::Number(42.0));
        assert_eq!(Value::integer(-42), Value::Number(-42.0));
        assert_eq!(Value::integer(MAX_SAFE_INTEGER), Value::Number(MAX_SAFE_INTEGER as f64));

        let big = MAX_SAFE_INTEGER + 1;
        assert_eq!(Value::integer(big), Value::Int64(big));
        assert_eq!(Value::unsigned(u64::MAX), Value::UInt64(u64::MAX));
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::Number(3.9).as_i64(), Some(3));
        assert_eq!(Value::Number(-3.9).as_i64(), Some(-3));
        assert_eq!(Value::Bool(true).as_f64(), Some(1.0));
        assert_eq!(Value::Number(-1.0).as_u64(), Some(u64::MAX));
        assert_eq!(Value::Int64(-1).as_u64(), Some(u64::MAX));
        assert_eq!(Value::string("no").as_f64(), None);
    }

    #[test]
    fn test_array_copy_on_write() {
        let a = ValueArray::from_vec(vec![Value::Number(1.0)]);
        let mut b = a.clone();
        b.push(Value::Number(2.0));

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
        assert_eq!(b.get(1), Some(&Value::Number(2.0)));
    }

    #[test]
    fn test_array_set_out_of_bounds() {
        let mut a = ValueArray::from_vec(vec![Value::Null]);
        assert!(a.set(0, Value::Bool(true)));
        assert!(!a.set(5, Value::Bool(true)));
    }

    #[test]
    fn test_record_copy_on_write() {
        let r = Value::record([("a", Value::Number(1.0))]);
        let mut s = r.clone();
        if let Some(map) = s.as_record_mut() {
            map.insert("b", Value::Number(2.0));
        }

        assert_eq!(r.as_record().map(|m| m.len()), Some(1));
        assert_eq!(s.as_record().map(|m| m.len()), Some(2));
    }

    #[test]
    fn test_callback_identity_equality() {
        let f = Value::callback(|_| Ok(Value::Null));
        let g = f.clone();
        let h = Value::callback(|_| Ok(Value::Null));

        assert_eq!(f, g);
        assert_ne!(f, h);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Null.type_name(), "null");
        assert_eq!(Value::Number(0.0).type_name(), "number");
        assert_eq!(Value::Int64(0).type_name(), "big integer");
        assert_eq!(Value::string("x").type_name(), "string");
        assert_eq!(Value::array(vec![]).type_name(), "array");
    }
}
