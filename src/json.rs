//! JSON intake: building values from producer-emitted descriptions.
//!
//! The producer describes every value as a `{"type": …, "value": …}`
//! object: scalars carry their payload as a string, aggregates as a list
//! of nested descriptions (dict entries as `{"key": …, "value": …}`
//! objects, already sorted by key). Unlike the engine proper, this surface
//! faces external input, so shape violations come back as errors instead
//! of asserting.

use crate::value::{Value, ValuePool, INT_MAX, INT_MIN};
use serde_json::{Map, Value as Json};
use thiserror::Error;

/// Error from [`ValuePool::from_json`].
#[derive(Debug, Error)]
pub enum JsonError {
    #[error("value description must be a JSON object")]
    NotAnObject,
    #[error("missing field {0:?}")]
    MissingField(&'static str),
    #[error("field {0:?} has the wrong shape")]
    BadField(&'static str),
    #[error("unknown value type {0:?}")]
    UnknownType(String),
    #[error("malformed boolean {0:?}")]
    BadBool(String),
    #[error("integer {0:?} does not fit the value range")]
    BadInt(String),
    #[error("atoms cannot be empty")]
    EmptyAtom,
}

fn field<'a>(map: &'a Map<String, Json>, name: &'static str) -> Result<&'a Json, JsonError> {
    map.get(name).ok_or(JsonError::MissingField(name))
}

fn str_value(map: &Map<String, Json>) -> Result<&str, JsonError> {
    field(map, "value")?.as_str().ok_or(JsonError::BadField("value"))
}

fn list_value(map: &Map<String, Json>) -> Result<&[Json], JsonError> {
    field(map, "value")?.as_array().map(Vec::as_slice).ok_or(JsonError::BadField("value"))
}

fn parse_int(s: &str) -> Result<i64, JsonError> {
    match s {
        "inf" => Ok(INT_MAX),
        "-inf" => Ok(INT_MIN),
        _ => {
            let i: i64 = s.parse().map_err(|_| JsonError::BadInt(s.to_string()))?;
            if !(INT_MIN..=INT_MAX).contains(&i) {
                return Err(JsonError::BadInt(s.to_string()));
            }
            Ok(i)
        }
    }
}

/// The "value" field as an integer: the producer writes numbers as strings,
/// but plain JSON numbers are accepted too.
fn int_value(map: &Map<String, Json>) -> Result<i64, JsonError> {
    match field(map, "value")? {
        Json::String(s) => parse_int(s),
        Json::Number(n) => {
            let i = n.as_i64().ok_or_else(|| JsonError::BadInt(n.to_string()))?;
            if !(INT_MIN..=INT_MAX).contains(&i) {
                return Err(JsonError::BadInt(n.to_string()));
            }
            Ok(i)
        }
        _ => Err(JsonError::BadField("value")),
    }
}

impl ValuePool {
    /// Build and intern a value from its JSON description.
    pub fn from_json(&self, json: &Json) -> Result<Value, JsonError> {
        let map = json.as_object().ok_or(JsonError::NotAnObject)?;
        let kind = field(map, "type")?.as_str().ok_or(JsonError::BadField("type"))?;
        match kind {
            "bool" => match str_value(map)? {
                "True" => Ok(Value::Bool(true)),
                "False" => Ok(Value::Bool(false)),
                other => Err(JsonError::BadBool(other.to_string())),
            },
            "int" => Ok(Value::Int(int_value(map)?)),
            "atom" => {
                let name = str_value(map)?;
                if name.is_empty() {
                    return Err(JsonError::EmptyAtom);
                }
                Ok(self.put_atom(None, name.as_bytes()))
            }
            "pc" => {
                let pc = int_value(map)?;
                if pc < 0 {
                    return Err(JsonError::BadInt(pc.to_string()));
                }
                Ok(Value::Pc(pc as u64))
            }
            "dict" => {
                let mut pairs = Vec::new();
                for entry in list_value(map)? {
                    let entry = entry.as_object().ok_or(JsonError::BadField("value"))?;
                    let key = self.from_json(field(entry, "key")?)?;
                    let val = self.from_json(field(entry, "value")?)?;
                    pairs.push((key, val));
                }
                Ok(self.put_dict(None, &pairs))
            }
            "set" => {
                let mut elems = Vec::new();
                for entry in list_value(map)? {
                    elems.push(self.from_json(entry)?);
                }
                Ok(self.put_set(None, &elems))
            }
            "address" => {
                let mut elems = Vec::new();
                for entry in list_value(map)? {
                    elems.push(self.from_json(entry)?);
                }
                Ok(self.put_address(None, &elems))
            }
            other => Err(JsonError::UnknownType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_from_json() {
        let pool = ValuePool::new(1);
        assert_eq!(
            pool.from_json(&json!({"type": "bool", "value": "True"})).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            pool.from_json(&json!({"type": "int", "value": "-42"})).unwrap(),
            Value::Int(-42)
        );
        assert_eq!(
            pool.from_json(&json!({"type": "int", "value": 42})).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            pool.from_json(&json!({"type": "int", "value": "inf"})).unwrap(),
            Value::Int(INT_MAX)
        );
        assert_eq!(
            pool.from_json(&json!({"type": "pc", "value": "7"})).unwrap(),
            Value::Pc(7)
        );
    }

    #[test]
    fn aggregates_from_json() {
        let pool = ValuePool::new(1);
        let atom = pool.from_json(&json!({"type": "atom", "value": "x"})).unwrap();
        assert_eq!(atom, pool.put_atom(None, b"x"));

        let set = pool
            .from_json(&json!({"type": "set", "value": [
                {"type": "int", "value": "1"},
                {"type": "int", "value": "2"},
            ]}))
            .unwrap();
        assert_eq!(set, pool.put_set(None, &[Value::Int(1), Value::Int(2)]));

        let dict = pool
            .from_json(&json!({"type": "dict", "value": [
                {"key": {"type": "atom", "value": "x"}, "value": {"type": "int", "value": "1"}},
            ]}))
            .unwrap();
        assert_eq!(dict, pool.put_dict(None, &[(atom, Value::Int(1))]));

        let empty = pool.from_json(&json!({"type": "dict", "value": []})).unwrap();
        assert_eq!(empty, Value::Dict(None));

        let addr = pool
            .from_json(&json!({"type": "address", "value": [
                {"type": "atom", "value": "obj"},
                {"type": "int", "value": "3"},
            ]}))
            .unwrap();
        assert_eq!(
            addr,
            pool.put_address(None, &[pool.put_atom(None, b"obj"), Value::Int(3)])
        );
    }

    #[test]
    fn shape_violations_are_errors() {
        let pool = ValuePool::new(1);
        assert!(matches!(pool.from_json(&json!(17)), Err(JsonError::NotAnObject)));
        assert!(matches!(
            pool.from_json(&json!({"value": "1"})),
            Err(JsonError::MissingField("type"))
        ));
        assert!(matches!(
            pool.from_json(&json!({"type": "float", "value": "1.0"})),
            Err(JsonError::UnknownType(_))
        ));
        assert!(matches!(
            pool.from_json(&json!({"type": "bool", "value": "yes"})),
            Err(JsonError::BadBool(_))
        ));
        assert!(matches!(
            pool.from_json(&json!({"type": "atom", "value": ""})),
            Err(JsonError::EmptyAtom)
        ));
        assert!(matches!(
            pool.from_json(&json!({"type": "int", "value": "99999999999999999999"})),
            Err(JsonError::BadInt(_))
        ));
    }
}
