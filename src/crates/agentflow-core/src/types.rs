//! Field type descriptors and the type-string parser.
//!
//! State fields and output schemas declare their types as strings like
//! `"str"`, `"list[int]"` or `"dict[str, float]"`. [`FieldType`] is the
//! parsed descriptor; it knows how to check JSON values, decide
//! assignability between types, and print itself back in canonical form
//! (`parse(print(t)) == t`).

use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

const KNOWN_TYPE_NAMES: &[&str] = &[
    "str", "int", "float", "bool", "list", "dict", "object", "any",
];

/// Errors from parsing a type string
#[derive(Debug, Error, PartialEq)]
pub enum TypeParseError {
    #[error("unknown type '{name}'{}", suggestion.as_ref().map(|s| format!(". Did you mean '{}'?", s)).unwrap_or_default())]
    UnknownType {
        name: String,
        suggestion: Option<String>,
    },

    #[error("malformed type '{input}': {reason}")]
    Malformed { input: String, reason: String },
}

/// Parsed type descriptor for state fields and output schemas
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    List(Box<FieldType>),
    Map(Box<FieldType>, Box<FieldType>),
    /// Ordered named fields; an empty field list is an unconstrained object
    Object(Vec<(String, FieldType)>),
    Any,
}

impl FieldType {
    /// Parse a type string. Whitespace-insensitive.
    pub fn parse(input: &str) -> Result<FieldType, TypeParseError> {
        let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(TypeParseError::Malformed {
                input: input.to_string(),
                reason: "empty type string".to_string(),
            });
        }

        let mut parser = TypeParser {
            input: input.to_string(),
            chars: compact.chars().collect(),
            pos: 0,
        };
        let ty = parser.parse_type()?;
        if parser.pos != parser.chars.len() {
            return Err(TypeParseError::Malformed {
                input: input.to_string(),
                reason: format!("unexpected trailing '{}'", parser.rest()),
            });
        }
        Ok(ty)
    }

    /// Whether a value of type `other` can be written where `self` is expected
    pub fn is_assignable_from(&self, other: &FieldType) -> bool {
        match (self, other) {
            (FieldType::Any, _) | (_, FieldType::Any) => true,
            (FieldType::Float, FieldType::Int) => true,
            (FieldType::List(a), FieldType::List(b)) => a.is_assignable_from(b),
            (FieldType::Map(ka, va), FieldType::Map(kb, vb)) => {
                ka.is_assignable_from(kb) && va.is_assignable_from(vb)
            }
            (FieldType::Object(af), FieldType::Object(bf)) => {
                // An unconstrained object accepts any object shape
                if af.is_empty() {
                    return true;
                }
                af.len() == bf.len()
                    && af.iter().all(|(name, ty)| {
                        bf.iter()
                            .any(|(bn, bt)| bn == name && ty.is_assignable_from(bt))
                    })
            }
            (a, b) => a == b,
        }
    }

    /// Whether a JSON value conforms to this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::Str => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::List(elem) => value
                .as_array()
                .map(|items| items.iter().all(|item| elem.accepts(item)))
                .unwrap_or(false),
            FieldType::Map(key, val) => value
                .as_object()
                .map(|entries| {
                    entries
                        .iter()
                        .all(|(k, v)| key.accepts_key(k) && val.accepts(v))
                })
                .unwrap_or(false),
            FieldType::Object(fields) => match value.as_object() {
                None => false,
                Some(_) if fields.is_empty() => true,
                Some(entries) => {
                    entries.len() == fields.len()
                        && fields
                            .iter()
                            .all(|(name, ty)| entries.get(name).map_or(false, |v| ty.accepts(v)))
                }
            },
        }
    }

    /// JSON object keys are strings; non-string key types accept keys that
    /// parse as the key type.
    fn accepts_key(&self, key: &str) -> bool {
        match self {
            FieldType::Str | FieldType::Any => true,
            FieldType::Int => key.parse::<i64>().is_ok(),
            FieldType::Float => key.parse::<f64>().is_ok(),
            FieldType::Bool => key.parse::<bool>().is_ok(),
            _ => false,
        }
    }

    /// JSON-schema rendering for provider-facing schemas
    pub fn json_schema(&self) -> Value {
        match self {
            FieldType::Str => json!({"type": "string"}),
            FieldType::Int => json!({"type": "integer"}),
            FieldType::Float => json!({"type": "number"}),
            FieldType::Bool => json!({"type": "boolean"}),
            FieldType::List(elem) => json!({"type": "array", "items": elem.json_schema()}),
            FieldType::Map(_, val) => {
                json!({"type": "object", "additionalProperties": val.json_schema()})
            }
            FieldType::Object(fields) => {
                let mut properties = serde_json::Map::new();
                let mut required = Vec::new();
                for (name, ty) in fields {
                    properties.insert(name.clone(), ty.json_schema());
                    required.push(json!(name));
                }
                json!({"type": "object", "properties": properties, "required": required})
            }
            FieldType::Any => json!({}),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Str => write!(f, "str"),
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::List(elem) => write!(f, "list[{elem}]"),
            FieldType::Map(key, val) => write!(f, "dict[{key},{val}]"),
            FieldType::Object(_) => write!(f, "object"),
            FieldType::Any => write!(f, "any"),
        }
    }
}

struct TypeParser {
    input: String,
    chars: Vec<char>,
    pos: usize,
}

impl TypeParser {
    fn rest(&self) -> String {
        self.chars[self.pos..].iter().collect()
    }

    fn parse_type(&mut self) -> Result<FieldType, TypeParseError> {
        let name = self.parse_name()?;
        match name.as_str() {
            "str" => Ok(FieldType::Str),
            "int" => Ok(FieldType::Int),
            "float" => Ok(FieldType::Float),
            "bool" => Ok(FieldType::Bool),
            "any" => Ok(FieldType::Any),
            "object" => Ok(FieldType::Object(Vec::new())),
            "list" => {
                if self.eat('[') {
                    let elem = self.parse_type()?;
                    self.expect(']')?;
                    Ok(FieldType::List(Box::new(elem)))
                } else {
                    Ok(FieldType::List(Box::new(FieldType::Any)))
                }
            }
            "dict" => {
                if self.eat('[') {
                    let key = self.parse_type()?;
                    self.expect(',')?;
                    let val = self.parse_type()?;
                    self.expect(']')?;
                    Ok(FieldType::Map(Box::new(key), Box::new(val)))
                } else {
                    Ok(FieldType::Map(Box::new(FieldType::Str), Box::new(FieldType::Any)))
                }
            }
            other => Err(TypeParseError::UnknownType {
                name: other.to_string(),
                suggestion: nearest_type_name(other),
            }),
        }
    }

    fn parse_name(&mut self) -> Result<String, TypeParseError> {
        let start = self.pos;
        while self.pos < self.chars.len()
            && (self.chars[self.pos].is_ascii_alphanumeric() || self.chars[self.pos] == '_')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(TypeParseError::Malformed {
                input: self.input.clone(),
                reason: format!("expected a type name, found '{}'", self.rest()),
            });
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.pos < self.chars.len() && self.chars[self.pos] == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), TypeParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(TypeParseError::Malformed {
                input: self.input.clone(),
                reason: format!("expected '{expected}', found '{}'", self.rest()),
            })
        }
    }
}

/// Nearest known type name within edit distance 2
fn nearest_type_name(name: &str) -> Option<String> {
    KNOWN_TYPE_NAMES
        .iter()
        .map(|candidate| (strsim::levenshtein(name, candidate), candidate))
        .filter(|(distance, _)| *distance <= 2)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_parse_primitives() {
        assert_eq!(FieldType::parse("str").unwrap(), FieldType::Str);
        assert_eq!(FieldType::parse("int").unwrap(), FieldType::Int);
        assert_eq!(FieldType::parse("float").unwrap(), FieldType::Float);
        assert_eq!(FieldType::parse("bool").unwrap(), FieldType::Bool);
        assert_eq!(FieldType::parse("any").unwrap(), FieldType::Any);
    }

    #[test]
    fn test_parse_nested() {
        assert_eq!(
            FieldType::parse("list[dict[str,int]]").unwrap(),
            FieldType::List(Box::new(FieldType::Map(
                Box::new(FieldType::Str),
                Box::new(FieldType::Int)
            )))
        );
    }

    #[test]
    fn test_whitespace_insensitive() {
        assert_eq!(
            FieldType::parse(" dict[ str , list[int] ] ").unwrap(),
            FieldType::Map(
                Box::new(FieldType::Str),
                Box::new(FieldType::List(Box::new(FieldType::Int)))
            )
        );
    }

    #[test]
    fn test_bare_list_and_dict() {
        assert_eq!(
            FieldType::parse("list").unwrap(),
            FieldType::List(Box::new(FieldType::Any))
        );
        assert_eq!(
            FieldType::parse("dict").unwrap(),
            FieldType::Map(Box::new(FieldType::Str), Box::new(FieldType::Any))
        );
    }

    #[test]
    fn test_unknown_type_suggests() {
        let err = FieldType::parse("strr").unwrap_err();
        match err {
            TypeParseError::UnknownType { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("str"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(FieldType::parse("list[").is_err());
        assert!(FieldType::parse("dict[str]").is_err());
        assert!(FieldType::parse("int]").is_err());
        assert!(FieldType::parse("").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for input in ["str", "int", "list[float]", "dict[str,list[int]]", "any"] {
            let ty = FieldType::parse(input).unwrap();
            assert_eq!(FieldType::parse(&ty.to_string()).unwrap(), ty);
        }
    }

    #[test]
    fn test_accepts() {
        assert!(FieldType::Str.accepts(&json!("hello")));
        assert!(!FieldType::Str.accepts(&json!(42)));
        assert!(FieldType::Int.accepts(&json!(42)));
        assert!(!FieldType::Int.accepts(&json!(4.2)));
        assert!(FieldType::Float.accepts(&json!(4.2)));
        assert!(FieldType::Float.accepts(&json!(4)));
        assert!(FieldType::parse("list[int]").unwrap().accepts(&json!([1, 2])));
        assert!(!FieldType::parse("list[int]").unwrap().accepts(&json!([1, "x"])));
        assert!(FieldType::parse("dict[str,int]")
            .unwrap()
            .accepts(&json!({"a": 1})));
        assert!(FieldType::Any.accepts(&json!(null)));
    }

    #[test]
    fn test_assignability() {
        let float = FieldType::Float;
        let int = FieldType::Int;
        assert!(float.is_assignable_from(&int));
        assert!(!int.is_assignable_from(&float));

        let list_float = FieldType::parse("list[float]").unwrap();
        let list_int = FieldType::parse("list[int]").unwrap();
        assert!(list_float.is_assignable_from(&list_int));
        assert!(!list_int.is_assignable_from(&list_float));

        assert!(FieldType::Any.is_assignable_from(&list_int));
        assert!(list_int.is_assignable_from(&FieldType::Any));
    }

    #[test]
    fn test_json_schema_shapes() {
        assert_eq!(FieldType::Str.json_schema()["type"], "string");
        assert_eq!(
            FieldType::parse("list[int]").unwrap().json_schema()["items"]["type"],
            "integer"
        );
        let object = FieldType::Object(vec![("score".to_string(), FieldType::Float)]);
        assert_eq!(
            object.json_schema()["properties"]["score"]["type"],
            "number"
        );
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(input in "[a-z\\[\\], ]{0,40}") {
            let _ = FieldType::parse(&input);
        }

        #[test]
        fn prop_display_roundtrip(depth in 0usize..3) {
            // Build a nested type of the given depth and round-trip it
            let mut ty = FieldType::Int;
            for _ in 0..depth {
                ty = FieldType::List(Box::new(ty));
            }
            let printed = ty.to_string();
            prop_assert_eq!(FieldType::parse(&printed).unwrap(), ty);
        }
    }
}
