//! Graph codec for values crossing the context boundary
//!
//! A value is flattened into a [`Wire`]: every reachable object gets a
//! stable id, objects are emitted in a flat table, and nested references
//! become `Slot::Ref(id)`. Decoding allocates every object before filling
//! any of them, so shared sub-objects and cycles come back as one shared
//! object rather than copies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::value::{HandleId, Object, ObjectRef, Value};

/// One encoded value. Compound values are always `Ref`s into the object table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Slot {
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    Bytes(Vec<u8>),
    View(Vec<u8>),
    Handle(HandleId),
    Ref(u32),
}

/// JSON has no NaN or infinities, so those travel as strings.
mod float_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(f: &f64, s: S) -> Result<S::Ok, S::Error> {
        if f.is_finite() {
            s.serialize_f64(*f)
        } else if f.is_nan() {
            s.serialize_str("nan")
        } else if f.is_sign_positive() {
            s.serialize_str("inf")
        } else {
            s.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Num(f) => Ok(f),
            Repr::Text(text) => match text.as_str() {
                "nan" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid float {other:?}"))),
            },
        }
    }
}

/// One entry of the object table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum WireObject {
    List(Vec<Slot>),
    Map(Vec<(String, Slot)>),
}

/// Wire form of a value graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wire {
    pub root: Slot,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<WireObject>,
}

impl Wire {
    pub fn null() -> Self {
        Self {
            root: Slot::Null,
            objects: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Encode a value graph.
pub fn encode(value: &Value) -> Result<Wire, CodecError> {
    let mut table = ObjectTable::default();
    table.collect(value);

    let mut objects = Vec::with_capacity(table.order.len());
    for (id, obj) in table.order.iter().enumerate() {
        let snapshot = obj.read().clone();
        let encoded = match snapshot {
            Object::List(items) => WireObject::List(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| table.slot(item, || format!("{}[{i}]", table.path(id))))
                    .collect::<Result<_, _>>()?,
            ),
            Object::Map(entries) => WireObject::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), table.slot(v, || format!("{}.{k}", table.path(id)))?)))
                    .collect::<Result<_, CodecError>>()?,
            ),
        };
        objects.push(encoded);
    }

    let root = table.slot(value, || "$".to_string())?;
    Ok(Wire { root, objects })
}

/// Encode straight to JSON bytes.
pub fn encode_json(value: &Value) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(&encode(value)?)?)
}

/// Where an object was first reached. Paths are rebuilt only for errors.
struct Origin {
    parent: Option<u32>,
    segment: String,
}

#[derive(Default)]
struct ObjectTable {
    ids: HashMap<usize, u32>,
    order: Vec<ObjectRef>,
    origins: Vec<Origin>,
}

impl ObjectTable {
    /// First pass: assign ids in depth-first discovery order. Uses its own
    /// stack so nesting depth is bounded by memory, not the thread stack.
    fn collect(&mut self, root: &Value) {
        let Value::Object(obj) = root else {
            return;
        };
        let mut stack = vec![(obj.clone(), None, "$".to_string())];
        while let Some((obj, parent, segment)) = stack.pop() {
            if self.ids.contains_key(&obj.addr()) {
                continue;
            }
            let id = self.order.len() as u32;
            self.ids.insert(obj.addr(), id);
            self.order.push(obj.clone());
            self.origins.push(Origin { parent, segment });

            // Snapshot so no lock is held while descending. Children go on
            // in reverse so the first child is visited first.
            let snapshot = obj.read().clone();
            match snapshot {
                Object::List(items) => {
                    for (i, item) in items.into_iter().enumerate().rev() {
                        if let Value::Object(child) = item {
                            stack.push((child, Some(id), format!("[{i}]")));
                        }
                    }
                }
                Object::Map(entries) => {
                    for (k, v) in entries.into_iter().rev() {
                        if let Value::Object(child) = v {
                            stack.push((child, Some(id), format!(".{k}")));
                        }
                    }
                }
            }
        }
    }

    fn path(&self, id: usize) -> String {
        let mut segments = Vec::new();
        let mut at = Some(id as u32);
        while let Some(id) = at {
            let origin = &self.origins[id as usize];
            segments.push(origin.segment.as_str());
            at = origin.parent;
        }
        segments.into_iter().rev().collect()
    }

    /// Second pass: emit one slot, referencing objects by id.
    fn slot(&self, value: &Value, path: impl Fn() -> String) -> Result<Slot, CodecError> {
        Ok(match value {
            Value::Null => Slot::Null,
            Value::Bool(b) => Slot::Bool(*b),
            Value::Int(n) => Slot::Int(*n),
            Value::Float(f) => Slot::Float(*f),
            Value::Str(s) => Slot::Str(s.clone()),
            Value::Bytes(b) => Slot::Bytes(b.clone()),
            Value::View(b) => Slot::View(b.clone()),
            Value::Handle(h) => Slot::Handle(*h),
            Value::Object(obj) => match self.ids.get(&obj.addr()) {
                Some(id) => Slot::Ref(*id),
                // The object was mutated between passes to include a new child.
                None => {
                    return Err(CodecError::Unsupported {
                        kind: "unvisited object",
                        path: path(),
                    })
                }
            },
            Value::Function(_) => {
                return Err(CodecError::Unsupported {
                    kind: "function",
                    path: path(),
                })
            }
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Decode a wire graph, restoring shared identity.
pub fn decode(wire: &Wire) -> Result<Value, CodecError> {
    let shells: Vec<ObjectRef> = wire
        .objects
        .iter()
        .map(|obj| match obj {
            WireObject::List(_) => ObjectRef::new(Object::List(Vec::new())),
            WireObject::Map(_) => ObjectRef::new(Object::Map(Default::default())),
        })
        .collect();

    for (shell, obj) in shells.iter().zip(&wire.objects) {
        let filled = match obj {
            WireObject::List(slots) => Object::List(
                slots
                    .iter()
                    .map(|s| resolve(s, &shells))
                    .collect::<Result<_, _>>()?,
            ),
            WireObject::Map(entries) => Object::Map(
                entries
                    .iter()
                    .map(|(k, s)| Ok((k.clone(), resolve(s, &shells)?)))
                    .collect::<Result<_, CodecError>>()?,
            ),
        };
        *shell.write() = filled;
    }

    resolve(&wire.root, &shells)
}

/// Decode from JSON bytes produced by [`encode_json`].
pub fn decode_json(bytes: &[u8]) -> Result<Value, CodecError> {
    let wire: Wire = serde_json::from_slice(bytes)?;
    decode(&wire)
}

fn resolve(slot: &Slot, shells: &[ObjectRef]) -> Result<Value, CodecError> {
    Ok(match slot {
        Slot::Null => Value::Null,
        Slot::Bool(b) => Value::Bool(*b),
        Slot::Int(n) => Value::Int(*n),
        Slot::Float(f) => Value::Float(*f),
        Slot::Str(s) => Value::Str(s.clone()),
        Slot::Bytes(b) => Value::Bytes(b.clone()),
        Slot::View(b) => Value::View(b.clone()),
        Slot::Handle(h) => Value::Handle(*h),
        Slot::Ref(id) => Value::Object(
            shells
                .get(*id as usize)
                .cloned()
                .ok_or(CodecError::DanglingRef(*id))?,
        ),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::NativeFunction;

    #[test]
    fn test_shared_sub_object_keeps_identity() {
        let shared = Value::map([("n", Value::Int(7))]);
        let outer = Value::map([("a", shared.clone()), ("b", shared)]);

        let decoded = decode(&encode(&outer).unwrap()).unwrap();
        let a = decoded.get("a").unwrap();
        let b = decoded.get("b").unwrap();
        assert_eq!(a, b, "both fields must reference one object");
        assert_eq!(a.get("n"), Some(Value::Int(7)));

        // Mutating through one reference is visible through the other.
        if let Value::Object(obj) = &a {
            if let Object::Map(m) = &mut *obj.write() {
                m.insert("n".into(), Value::Int(8));
            }
        }
        assert_eq!(b.get("n"), Some(Value::Int(8)));
    }

    #[test]
    fn test_cycle_round_trip() {
        let node = ObjectRef::new(Object::Map(Default::default()));
        if let Object::Map(m) = &mut *node.write() {
            m.insert("self".into(), Value::Object(node.clone()));
            m.insert("name".into(), Value::str("loop"));
        }
        let wire = encode(&Value::Object(node)).unwrap();
        assert_eq!(wire.objects.len(), 1);

        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded.get("self"), Some(decoded.clone()));
        assert_eq!(decoded.get("name"), Some(Value::str("loop")));
    }

    #[test]
    fn test_byte_buffer_round_trip() {
        let bytes: Vec<u8> = vec![0x00, 0x01, 0x7f, 0x80, 0xfe, 0xff];
        let value = Value::list([Value::Bytes(bytes.clone()), Value::View(bytes.clone())]);

        let decoded = decode_json(&encode_json(&value).unwrap()).unwrap();
        match decoded.index(0) {
            Some(Value::Bytes(b)) => assert_eq!(b, bytes),
            other => panic!("expected bytearray, got {other:?}"),
        }
        match decoded.index(1) {
            Some(Value::View(b)) => assert_eq!(b, bytes),
            other => panic!("expected memoryview, got {other:?}"),
        }
    }

    #[test]
    fn test_function_is_rejected_with_path() {
        let func = Value::Function(NativeFunction::new("cb", |_| Ok(Value::Null)));
        let value = Value::map([("inner", Value::list([Value::Int(1), func]))]);
        match encode(&value) {
            Err(CodecError::Unsupported { kind, path }) => {
                assert_eq!(kind, "function");
                assert_eq!(path, "$.inner[1]");
            }
            other => panic!("expected unsupported error, got {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_floats_survive_json() {
        let value = Value::list([
            Value::Float(f64::NAN),
            Value::Float(f64::INFINITY),
            Value::Float(f64::NEG_INFINITY),
            Value::Float(1.5),
        ]);
        let decoded = decode_json(&encode_json(&value).unwrap()).unwrap();
        assert!(matches!(decoded.index(0), Some(Value::Float(f)) if f.is_nan()));
        assert_eq!(decoded.index(1), Some(Value::Float(f64::INFINITY)));
        assert_eq!(decoded.index(2), Some(Value::Float(f64::NEG_INFINITY)));
        assert_eq!(decoded.index(3), Some(Value::Float(1.5)));

        assert!(serde_json::from_str::<Wire>(r#"{"root":{"t":"float","v":"huge"}}"#).is_err());
    }

    #[test]
    fn test_deep_nesting_encodes() {
        const DEPTH: usize = 50_000;
        let mut value = Value::Int(0);
        for _ in 0..DEPTH {
            value = Value::list([value]);
        }

        let wire = encode(&value).unwrap();
        assert_eq!(wire.objects.len(), DEPTH);
        let decoded = decode(&wire).unwrap();

        // Nested values drop recursively, so unwind both chains by hand.
        dismantle(value);
        dismantle(decoded);
    }

    fn dismantle(value: Value) {
        let mut next = Some(value);
        while let Some(Value::Object(obj)) = next.take() {
            next = match &mut *obj.write() {
                Object::List(items) => items.pop(),
                Object::Map(_) => None,
            };
        }
    }

    #[test]
    fn test_dangling_ref() {
        let wire = Wire {
            root: Slot::Ref(3),
            objects: vec![],
        };
        assert!(matches!(decode(&wire), Err(CodecError::DanglingRef(3))));
    }

    #[test]
    fn test_primitive_root_has_no_objects() {
        let wire = encode(&Value::str("plain")).unwrap();
        assert!(wire.objects.is_empty());
        let json = serde_json::to_string(&wire).unwrap();
        assert_eq!(json, r#"{"root":{"t":"str","v":"plain"}}"#);
    }
}
