//! Generic mapping/sequence/scalar trees built from raw protocol objects.

use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::{Map, Number, Value};

use crate::protocol::{RawObject, RawStruct, SchemaRegistry, TYPE_KEY};

pub const MAX_DEPTH: usize = 64;
pub const DEPTH_PLACEHOLDER: &str = "<max depth exceeded>";
const FALLBACK_TYPE_TAG: &str = "Object";

#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mapping {
    pub type_tag: String,
    pub fields: Vec<(String, NormalizedNode)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NormalizedNode {
    Scalar(Scalar),
    Mapping(Mapping),
    Sequence(Vec<NormalizedNode>),
}

impl Mapping {
    pub fn new(type_tag: impl Into<String>) -> Self {
        let type_tag = type_tag.into();
        Self {
            type_tag: if type_tag.is_empty() {
                FALLBACK_TYPE_TAG.to_string()
            } else {
                type_tag
            },
            fields: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&NormalizedNode> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }
}

impl NormalizedNode {
    pub fn null() -> Self {
        NormalizedNode::Scalar(Scalar::Null)
    }

    pub fn string(value: impl Into<String>) -> Self {
        NormalizedNode::Scalar(Scalar::Str(value.into()))
    }

    pub fn type_tag(&self) -> Option<&str> {
        match self {
            NormalizedNode::Mapping(mapping) => Some(&mapping.type_tag),
            _ => None,
        }
    }

    /// Field lookup on a mapping; `None` for every other shape.
    pub fn get(&self, key: &str) -> Option<&NormalizedNode> {
        match self {
            NormalizedNode::Mapping(mapping) => mapping.get(key),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, NormalizedNode::Scalar(Scalar::Null))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NormalizedNode::Scalar(Scalar::Str(value)) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            NormalizedNode::Scalar(Scalar::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NormalizedNode::Scalar(Scalar::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    /// Number of nodes in the tree, the root included.
    pub fn size(&self) -> usize {
        match self {
            NormalizedNode::Scalar(_) => 1,
            NormalizedNode::Mapping(mapping) => {
                1 + mapping
                    .fields
                    .iter()
                    .map(|(_, value)| value.size())
                    .sum::<usize>()
            }
            NormalizedNode::Sequence(items) => 1 + items.iter().map(NormalizedNode::size).sum::<usize>(),
        }
    }

    /// JSON rendering: mappings become objects whose first key is `"_"`.
    pub fn to_json(&self) -> Value {
        match self {
            NormalizedNode::Scalar(scalar) => scalar.to_json(),
            NormalizedNode::Mapping(mapping) => {
                let mut object = Map::with_capacity(mapping.fields.len() + 1);
                object.insert(TYPE_KEY.to_string(), Value::String(mapping.type_tag.clone()));
                for (name, value) in &mapping.fields {
                    object.insert(name.clone(), value.to_json());
                }
                Value::Object(object)
            }
            NormalizedNode::Sequence(items) => Value::Array(items.iter().map(NormalizedNode::to_json).collect()),
        }
    }
}

impl Scalar {
    fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(value) => Value::Bool(*value),
            Scalar::Int(value) => Value::Number((*value).into()),
            Scalar::Float(value) => Number::from_f64(*value).map(Value::Number).unwrap_or(Value::Null),
            Scalar::Str(value) => Value::String(value.clone()),
        }
    }
}

impl Serialize for NormalizedNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NormalizedNode::Scalar(scalar) => scalar.serialize(serializer),
            NormalizedNode::Mapping(mapping) => {
                let mut map = serializer.serialize_map(Some(mapping.fields.len() + 1))?;
                map.serialize_entry(TYPE_KEY, &mapping.type_tag)?;
                for (name, value) in &mapping.fields {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
            NormalizedNode::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Null => serializer.serialize_none(),
            Scalar::Bool(value) => serializer.serialize_bool(*value),
            Scalar::Int(value) => serializer.serialize_i64(*value),
            Scalar::Float(value) if value.is_finite() => serializer.serialize_f64(*value),
            Scalar::Float(_) => serializer.serialize_none(),
            Scalar::Str(value) => serializer.serialize_str(value),
        }
    }
}

/// Lifts a normalized tree back into a raw object with the same shape.
impl From<&NormalizedNode> for RawObject {
    fn from(node: &NormalizedNode) -> Self {
        match node {
            NormalizedNode::Scalar(Scalar::Null) => RawObject::Null,
            NormalizedNode::Scalar(Scalar::Bool(value)) => RawObject::Bool(*value),
            NormalizedNode::Scalar(Scalar::Int(value)) => RawObject::Int(*value),
            NormalizedNode::Scalar(Scalar::Float(value)) => RawObject::Float(*value),
            NormalizedNode::Scalar(Scalar::Str(value)) => RawObject::Text(value.clone()),
            NormalizedNode::Mapping(mapping) => {
                let mut object = RawStruct::new(mapping.type_tag.clone());
                for (name, value) in &mapping.fields {
                    object.push(name.clone(), RawObject::from(value));
                }
                RawObject::Object(object)
            }
            NormalizedNode::Sequence(items) => RawObject::List(items.iter().map(RawObject::from).collect()),
        }
    }
}

/// Walks raw objects into [`NormalizedNode`] trees using the declared field
/// order of each kind. Never fails: whatever cannot be represented degrades
/// to a string.
#[derive(Clone, Debug)]
pub struct Normalizer {
    schemas: Arc<SchemaRegistry>,
    max_depth: usize,
}

impl Normalizer {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            schemas,
            max_depth: MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn normalize(&self, raw: &RawObject) -> NormalizedNode {
        self.walk(raw, 0)
    }

    fn walk(&self, raw: &RawObject, depth: usize) -> NormalizedNode {
        if depth > self.max_depth {
            tracing::warn!(max_depth = self.max_depth, "object nested too deeply, truncating");
            return NormalizedNode::string(DEPTH_PLACEHOLDER);
        }

        match raw {
            RawObject::Null => NormalizedNode::null(),
            RawObject::Bool(value) => NormalizedNode::Scalar(Scalar::Bool(*value)),
            RawObject::Int(value) => NormalizedNode::Scalar(Scalar::Int(*value)),
            RawObject::Float(value) => NormalizedNode::Scalar(Scalar::Float(*value)),
            RawObject::Text(value) => NormalizedNode::string(value.clone()),
            RawObject::Bytes(bytes) => NormalizedNode::string(bytes_placeholder(bytes.len())),
            RawObject::Date(date) => NormalizedNode::string(date.to_rfc3339()),
            RawObject::List(items) => {
                NormalizedNode::Sequence(items.iter().map(|item| self.walk(item, depth + 1)).collect())
            }
            RawObject::Object(object) => NormalizedNode::Mapping(self.walk_object(object, depth)),
            RawObject::Opaque(text) => NormalizedNode::string(text.clone()),
        }
    }

    fn walk_object(&self, object: &RawStruct, depth: usize) -> Mapping {
        let mut mapping = Mapping::new(object.kind());
        if object.is_empty() {
            return mapping;
        }
        mapping.fields.reserve(object.len());

        match self.schemas.fields_for(object.kind()) {
            Some(declared) => {
                for name in declared {
                    if let Some(value) = object.get(name) {
                        mapping.fields.push((field_key(name), self.walk(value, depth + 1)));
                    }
                }
                for (name, value) in object.fields() {
                    if !declared.iter().any(|declared| declared == name) {
                        mapping.fields.push((field_key(name), self.walk(value, depth + 1)));
                    }
                }
            }
            None => {
                for (name, value) in object.fields() {
                    mapping.fields.push((field_key(name), self.walk(value, depth + 1)));
                }
            }
        }

        mapping
    }
}

/// Field names made only of underscores get one more, so no field can take
/// the `"_"` key that carries the type tag.
fn field_key(name: &str) -> String {
    if !name.is_empty() && name.bytes().all(|byte| byte == b'_') {
        format!("_{name}")
    } else {
        name.to_string()
    }
}

fn bytes_placeholder(len: usize) -> String {
    format!("<bytes:{len}>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> Normalizer {
        Normalizer::new(Arc::new(SchemaRegistry::builtin()))
    }

    #[test]
    fn walks_objects_in_declared_order() {
        let raw = RawObject::Object(
            RawStruct::new("Message")
                .with("message", "hello")
                .with("extra", 1i64)
                .with("id", 10i64)
                .with("from_id", RawStruct::new("PeerUser").with("user_id", 42i64)),
        );
        let node = normalizer().normalize(&raw);
        assert_eq!(
            node.to_json(),
            json!({
                "_": "Message",
                "id": 10,
                "message": "hello",
                "from_id": {"_": "PeerUser", "user_id": 42},
                "extra": 1
            })
        );
        let keys: Vec<_> = node.to_json().as_object().expect("object").keys().cloned().collect();
        assert_eq!(keys, vec!["_", "id", "message", "from_id", "extra"]);
    }

    #[test]
    fn unknown_kinds_keep_their_own_order() {
        let raw = RawObject::Object(RawStruct::new("Widget").with("z", 1i64).with("a", 2i64));
        let node = normalizer().normalize(&raw);
        let keys: Vec<_> = node.to_json().as_object().expect("object").keys().cloned().collect();
        assert_eq!(keys, vec!["_", "z", "a"]);
    }

    #[test]
    fn binary_payloads_become_placeholders() {
        let raw = RawObject::Object(RawStruct::new("Photo").with("file_reference", RawObject::Bytes(vec![0; 2048])));
        let node = normalizer().normalize(&raw);
        assert_eq!(node.get("file_reference").and_then(NormalizedNode::as_str), Some("<bytes:2048>"));
    }

    #[test]
    fn scalars_are_idempotent() {
        let normalizer = normalizer();
        for raw in [
            RawObject::Null,
            RawObject::Bool(true),
            RawObject::Int(-3),
            RawObject::Float(1.5),
            RawObject::Text("x".to_string()),
        ] {
            let once = normalizer.normalize(&raw);
            let twice = normalizer.normalize(&RawObject::from(&once));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn deep_nesting_is_truncated() {
        let mut raw = RawObject::Int(1);
        for _ in 0..100 {
            raw = RawObject::List(vec![raw]);
        }
        let node = normalizer().with_max_depth(8).normalize(&raw);
        let mut current = &node;
        let mut depth = 0;
        while let NormalizedNode::Sequence(items) = current {
            current = &items[0];
            depth += 1;
        }
        assert_eq!(depth, 9);
        assert_eq!(current.as_str(), Some(DEPTH_PLACEHOLDER));
    }

    #[test]
    fn empty_kind_gets_fallback_tag() {
        let raw = RawObject::Object(RawStruct::new(""));
        assert_eq!(normalizer().normalize(&raw).type_tag(), Some(FALLBACK_TYPE_TAG));
    }

    #[test]
    fn underscore_fields_never_replace_the_type_tag() {
        let raw = RawObject::from_wire(json!({"_": 5, "a": 1, "__": true}));
        let node = normalizer().normalize(&raw);
        assert_eq!(node.type_tag(), Some("dict"));
        let rendered = node.to_json();
        assert_eq!(rendered, json!({"_": "dict", "a": 1, "___": true, "__": 5}));
        let serialized = serde_json::to_string(&node).expect("serialize");
        assert_eq!(serialized, serde_json::to_string(&rendered).expect("render"));
        assert_eq!(serialized.matches("\"_\":").count(), 1);
    }

    #[test]
    fn serialize_matches_to_json() {
        let raw = RawObject::from_wire(json!({"_": "Message", "id": 1, "media": null, "entities": [{"_": "MessageEntityBold", "offset": 0, "length": 2}]}));
        let node = normalizer().normalize(&raw);
        let serialized = serde_json::to_value(&node).expect("serialize");
        assert_eq!(serialized, node.to_json());
    }
}
