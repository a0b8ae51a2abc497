// gatecrash/src/flatten.rs
//
// Duplicate-key-preserving JSON tree and its recursive rollout into flat
// `key:value` tokens. Standard JSON maps collapse repeated object keys; the
// equivalence engine must not, because `{"a":1,"a":2}` and `{"a":1}` are
// different requests. Object entries are therefore kept as an ordered list
// of pairs, filled by a hand-rolled Deserialize impl.

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

// ── JSON tree ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum JsonNode {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<JsonNode>),
    Object(Vec<(String, JsonNode)>),
}

impl JsonNode {
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    /// Scalar text used inside flattened tokens. Strings render bare,
    /// numbers and booleans as their JSON lexemes, null as `null`.
    /// Non-scalar members of mixed arrays render as compact JSON.
    fn leaf_text(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::String(s) => s.clone(),
            Self::Array(_) | Self::Object(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

/// Parse raw bytes into the duplicate-preserving tree.
pub fn parse(raw: &[u8]) -> Option<JsonNode> {
    serde_json::from_slice(raw).ok()
}

impl<'de> Deserialize<'de> for JsonNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeVisitor;

        impl<'de> Visitor<'de> for NodeVisitor {
            type Value = JsonNode;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("any JSON value")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(JsonNode::Null)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(JsonNode::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(JsonNode::Number(v.into()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(JsonNode::Number(v.into()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                serde_json::Number::from_f64(v)
                    .map(JsonNode::Number)
                    .ok_or_else(|| de::Error::custom("non-finite number"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(JsonNode::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(JsonNode::String(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut items = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(item) = access.next_element()? {
                    items.push(item);
                }
                Ok(JsonNode::Array(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, JsonNode>()? {
                    pairs.push((key, value));
                }
                Ok(JsonNode::Object(pairs))
            }
        }

        deserializer.deserialize_any(NodeVisitor)
    }
}

impl Serialize for JsonNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (k, v) in pairs {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

// ── Rollout ───────────────────────────────────────────────────────────────────

/// Flatten a parsed body into `parent1_parent2_..._key:value` tokens.
///
/// Only objects and arrays of objects can be rolled out; scalars and arrays
/// of scalars have no key structure and yield `None`, which callers treat as
/// an opaque body. Arrays of scalars below a key join their values with
/// spaces; an empty array yields `key:`; arrays of objects recurse under the
/// parent key. No depth cap is imposed.
pub fn roll_out(node: &JsonNode) -> Option<Vec<String>> {
    match node {
        JsonNode::Object(pairs) => {
            let mut tokens = Vec::new();
            for (key, value) in pairs {
                flatten_pair(&mut tokens, "", key, value);
            }
            Some(tokens)
        }
        JsonNode::Array(items) => {
            let mut tokens = Vec::new();
            for item in items {
                match item {
                    JsonNode::Object(pairs) => {
                        for (key, value) in pairs {
                            flatten_pair(&mut tokens, "", key, value);
                        }
                    }
                    _ => return None,
                }
            }
            Some(tokens)
        }
        _ => None,
    }
}

fn flatten_pair(tokens: &mut Vec<String>, prefix: &str, key: &str, value: &JsonNode) {
    match value {
        JsonNode::Object(pairs) => {
            let child_prefix = format!("{prefix}{key}_");
            for (k, v) in pairs {
                flatten_pair(tokens, &child_prefix, k, v);
            }
        }
        JsonNode::Array(items) if items.is_empty() => {
            tokens.push(format!("{prefix}{key}:"));
        }
        JsonNode::Array(items) if items.iter().all(JsonNode::is_object) => {
            let child_prefix = format!("{prefix}{key}_");
            for item in items {
                if let JsonNode::Object(pairs) = item {
                    for (k, v) in pairs {
                        flatten_pair(tokens, &child_prefix, k, v);
                    }
                }
            }
        }
        JsonNode::Array(items) => {
            let joined = items
                .iter()
                .map(JsonNode::leaf_text)
                .collect::<Vec<_>>()
                .join(" ");
            tokens.push(format!("{prefix}{key}:{joined}"));
        }
        scalar => {
            tokens.push(format!("{prefix}{key}:{}", scalar.leaf_text()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(raw: &str) -> Option<Vec<String>> {
        roll_out(&parse(raw.as_bytes()).expect("valid JSON"))
    }

    #[test]
    fn duplicate_keys_survive_parsing() {
        let node = parse(br#"{"a":"1","a":"2"}"#).unwrap();
        match node {
            JsonNode::Object(pairs) => {
                assert_eq!(pairs.len(), 2);
                assert_eq!(pairs[0].0, "a");
                assert_eq!(pairs[1].0, "a");
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn flat_object_rolls_out_in_order() {
        assert_eq!(
            tokens(r#"{"a":"1","b":2,"c":true,"d":null}"#).unwrap(),
            vec!["a:1", "b:2", "c:true", "d:null"]
        );
    }

    #[test]
    fn nested_objects_chain_keys_with_underscores() {
        assert_eq!(
            tokens(r#"{"user":{"name":"bo","address":{"city":"basel"}}}"#).unwrap(),
            vec!["user_name:bo", "user_address_city:basel"]
        );
    }

    #[test]
    fn scalar_lists_join_with_spaces() {
        assert_eq!(
            tokens(r#"{"ids":[1,2,3],"tags":["x","y"]}"#).unwrap(),
            vec!["ids:1 2 3", "tags:x y"]
        );
    }

    #[test]
    fn empty_list_yields_bare_key() {
        assert_eq!(tokens(r#"{"items":[]}"#).unwrap(), vec!["items:"]);
    }

    #[test]
    fn lists_of_objects_recurse_under_parent_key() {
        assert_eq!(
            tokens(r#"{"rows":[{"id":1},{"id":2}]}"#).unwrap(),
            vec!["rows_id:1", "rows_id:2"]
        );
    }

    #[test]
    fn top_level_array_of_objects_rolls_out() {
        assert_eq!(
            tokens(r#"[{"a":"1"},{"b":"2"}]"#).unwrap(),
            vec!["a:1", "b:2"]
        );
    }

    #[test]
    fn shapes_without_keys_are_rejected() {
        assert_eq!(tokens("123"), None);
        assert_eq!(tokens(r#""text""#), None);
        assert_eq!(tokens("[1,2,3]"), None);
        assert_eq!(tokens(r#"[{"a":1},2]"#), None);
    }

    #[test]
    fn duplicate_keys_produce_duplicate_tokens() {
        assert_eq!(
            tokens(r#"{"a":"1","a":"2"}"#).unwrap(),
            vec!["a:1", "a:2"]
        );
    }
}
