use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Static type of a parameter, return slot or field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "kebab-case")]
pub enum ValueType {
    Void,
    Bool,
    Int,
    Str,
    BoolArray,
    IntArray,
}

impl ValueType {
    /// Descriptor used inside member signatures, e.g. `I` in `inc(I)I`.
    pub fn descriptor(&self) -> &'static str {
        match self {
            ValueType::Void => "V",
            ValueType::Bool => "Z",
            ValueType::Int => "I",
            ValueType::Str => "S",
            ValueType::BoolArray => "[Z",
            ValueType::IntArray => "[I",
        }
    }

    /// Reference types accept `null`.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            ValueType::Str | ValueType::BoolArray | ValueType::IntArray
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor())
    }
}

/// A value that can cross the process boundary: call arguments, return
/// values, static field contents and field initializers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum Value {
    Void,
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::BoolArray(_) => "bool[]",
            Value::IntArray(_) => "int[]",
        }
    }

    /// Exact conformance check. There is no widening and no coercion:
    /// `Int` never satisfies `Bool`, and `Null` only satisfies reference types.
    pub fn conforms_to(&self, ty: ValueType) -> bool {
        match (self, ty) {
            (Value::Void, ValueType::Void) => true,
            (Value::Null, ty) => ty.is_reference(),
            (Value::Bool(_), ValueType::Bool) => true,
            (Value::Int(_), ValueType::Int) => true,
            (Value::Str(_), ValueType::Str) => true,
            (Value::BoolArray(_), ValueType::BoolArray) => true,
            (Value::IntArray(_), ValueType::IntArray) => true,
            _ => false,
        }
    }

    pub fn default_for(ty: ValueType) -> Value {
        match ty {
            ValueType::Void => Value::Void,
            ValueType::Bool => Value::Bool(false),
            ValueType::Int => Value::Int(0),
            ValueType::Str | ValueType::BoolArray | ValueType::IntArray => Value::Null,
        }
    }

    /// Converts a JSON value using the declared type to settle ambiguous
    /// shapes such as empty arrays.
    pub fn from_json_typed(json: &serde_json::Value, ty: ValueType) -> Result<Value, String> {
        use serde_json::Value as Json;
        let mismatch = || format!("expected {} but got JSON {}", ty, json);
        match (ty, json) {
            (_, Json::Null) if ty.is_reference() => Ok(Value::Null),
            (ValueType::Bool, Json::Bool(b)) => Ok(Value::Bool(*b)),
            (ValueType::Int, Json::Number(n)) => n.as_i64().map(Value::Int).ok_or_else(mismatch),
            (ValueType::Str, Json::String(s)) => Ok(Value::Str(s.clone())),
            (ValueType::BoolArray, Json::Array(items)) => items
                .iter()
                .map(|item| item.as_bool().ok_or_else(mismatch))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::BoolArray),
            (ValueType::IntArray, Json::Array(items)) => items
                .iter()
                .map(|item| item.as_i64().ok_or_else(mismatch))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::IntArray),
            _ => Err(mismatch()),
        }
    }

    /// Best-effort conversion without a declared type. Empty arrays become
    /// `IntArray`.
    pub fn from_json(json: &serde_json::Value) -> Result<Value, String> {
        use serde_json::Value as Json;
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| format!("number {n} is not a 64-bit integer")),
            Json::String(s) => Ok(Value::Str(s.clone())),
            Json::Array(items) if items.iter().all(|item| item.is_boolean()) && !items.is_empty() => {
                Value::from_json_typed(json, ValueType::BoolArray)
            }
            Json::Array(_) => Value::from_json_typed(json, ValueType::IntArray),
            Json::Object(_) => Err(format!("objects are not supported as values: {json}")),
        }
    }

    /// An empty array takes whichever array type `ty` names; any other value
    /// is returned as is. Pairs with [`Value::from_json`], which cannot tell
    /// an empty `bool[]` from an empty `int[]`.
    pub fn settle_empty_array(self, ty: ValueType) -> Value {
        match (self, ty) {
            (Value::IntArray(items), ValueType::BoolArray) if items.is_empty() => {
                Value::BoolArray(Vec::new())
            }
            (Value::BoolArray(items), ValueType::IntArray) if items.is_empty() => {
                Value::IntArray(Vec::new())
            }
            (value, _) => value,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Void | Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Str(s) => Json::String(s.clone()),
            Value::BoolArray(items) => Json::Array(items.iter().map(|b| Json::Bool(*b)).collect()),
            Value::IntArray(items) => Json::Array(items.iter().map(|i| Json::from(*i)).collect()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::BoolArray(items) => write!(f, "{items:?}"),
            Value::IntArray(items) => write!(f, "{items:?}"),
        }
    }
}
