//! Value model shared by the host and worker contexts
//!
//! Values are what flows through the call channel and what hook callbacks
//! and interpreter modules see. Compound values are shared mutable
//! references: cloning a `Value::Object` clones the reference, not the
//! object, so two fields may point at one object (or at an ancestor).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Handles
// ─────────────────────────────────────────────────────────────────────────────

/// Identifier of an entry in a channel's reference table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Native functions
// ─────────────────────────────────────────────────────────────────────────────

type NativeBody = dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync;

/// A live callable. Cannot cross the message boundary on its own; it has to
/// be exposed through a reference table first, which yields a `Value::Handle`.
#[derive(Clone)]
pub struct NativeFunction {
    name: String,
    body: Arc<NativeBody>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Value, String> {
        (self.body)(args)
    }

    pub fn ptr_eq(&self, other: &NativeFunction) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Objects
// ─────────────────────────────────────────────────────────────────────────────

/// Contents of a compound value.
#[derive(Debug, Clone)]
pub enum Object {
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Shared, mutable reference to an [`Object`].
///
/// Identity is pointer identity; see [`ObjectRef::ptr_eq`].
#[derive(Clone)]
pub struct ObjectRef(Arc<RwLock<Object>>);

impl ObjectRef {
    pub fn new(object: Object) -> Self {
        Self(Arc::new(RwLock::new(object)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Object> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Object> {
        self.0.write()
    }

    /// True if both references point at the same object.
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address used as the identity key when walking a graph.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for ObjectRef {
    // Never descend: the graph may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.read() {
            Object::List(_) => "list",
            Object::Map(_) => "map",
        };
        write!(f, "ObjectRef({kind}@{:#x})", self.addr())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value
// ─────────────────────────────────────────────────────────────────────────────

/// A value that can be marshalled between contexts.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Mutable binary buffer (`bytearray`)
    Bytes(Vec<u8>),
    /// Read-only binary view (`memoryview`)
    View(Vec<u8>),
    Object(ObjectRef),
    Handle(HandleId),
    Function(NativeFunction),
}

impl Value {
    /// New list value from its items.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Object(ObjectRef::new(Object::List(items.into_iter().collect())))
    }

    /// New map value from its entries.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(ObjectRef::new(Object::Map(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) | Value::View(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Look up a field of a map value.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(o) => match &*o.read() {
                Object::Map(m) => m.get(key).cloned(),
                Object::List(_) => None,
            },
            _ => None,
        }
    }

    /// Look up an element of a list value.
    pub fn index(&self, i: usize) -> Option<Value> {
        match self {
            Value::Object(o) => match &*o.read() {
                Object::List(items) => items.get(i).cloned(),
                Object::Map(_) => None,
            },
            _ => None,
        }
    }

    /// Short name of the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytearray",
            Value::View(_) => "memoryview",
            Value::Object(o) => match &*o.read() {
                Object::List(_) => "list",
                Object::Map(_) => "map",
            },
            Value::Handle(_) => "handle",
            Value::Function(_) => "function",
        }
    }

    /// Build a value from JSON. Objects and arrays become fresh, unshared objects.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => Value::list(items.into_iter().map(Value::from_json)),
            serde_json::Value::Object(map) => {
                Value::map(map.into_iter().map(|(k, v)| (k, Value::from_json(v))))
            }
        }
    }
}

/// Identity equality: primitives compare by value, objects and functions by
/// reference. Two structurally equal but distinct objects are not equal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::View(a), Value::View(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Handle(a), Value::Handle(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Display
// ─────────────────────────────────────────────────────────────────────────────

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut seen = HashSet::new();
        render(self, f, &mut seen)
    }
}

fn render(value: &Value, f: &mut fmt::Formatter<'_>, seen: &mut HashSet<usize>) -> fmt::Result {
    match value {
        Value::Null => write!(f, "None"),
        Value::Bool(true) => write!(f, "True"),
        Value::Bool(false) => write!(f, "False"),
        Value::Int(n) => write!(f, "{n}"),
        Value::Float(x) => write!(f, "{x:?}"),
        Value::Str(s) => write!(f, "{s}"),
        Value::Bytes(b) => write!(f, "bytearray({} bytes)", b.len()),
        Value::View(b) => write!(f, "memoryview({} bytes)", b.len()),
        Value::Handle(id) => write!(f, "<{id}>"),
        Value::Function(func) => write!(f, "<function {}>", func.name()),
        Value::Object(obj) => {
            if !seen.insert(obj.addr()) {
                return write!(f, "[...]");
            }
            let object = obj.read().clone();
            match object {
                Object::List(items) => {
                    write!(f, "[")?;
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        render(item, f, seen)?;
                    }
                    write!(f, "]")?;
                }
                Object::Map(entries) => {
                    write!(f, "{{")?;
                    for (i, (k, v)) in entries.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{k}: ")?;
                        render(v, f, seen)?;
                    }
                    write!(f, "}}")?;
                }
            }
            seen.remove(&obj.addr());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality() {
        let a = Value::list([Value::Int(1)]);
        let b = Value::list([Value::Int(1)]);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(Value::str("x"), Value::from("x"));
    }

    #[test]
    fn test_display_cycle_terminates() {
        let list = ObjectRef::new(Object::List(vec![Value::Int(1)]));
        if let Object::List(items) = &mut *list.write() {
            items.push(Value::Object(list.clone()));
        }
        assert_eq!(Value::Object(list).to_string(), "[1, [...]]");
    }

    #[test]
    fn test_from_json() {
        let value = Value::from_json(serde_json::json!({"a": [1, 2.5, "s"], "b": null}));
        assert_eq!(value.get("b"), Some(Value::Null));
        let a = value.get("a").unwrap();
        assert_eq!(a.index(0), Some(Value::Int(1)));
        assert_eq!(a.index(1), Some(Value::Float(2.5)));
        assert_eq!(a.kind(), "list");
    }
}
