use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Score for a value whose JSON kind is exactly the declared type.
pub const EXACT: u32 = 4;
/// Score for a value that converts, e.g. an integer into a float parameter.
pub const COMPATIBLE: u32 = 1;
/// A value that cannot become the declared type.
pub const DISQUALIFIED: u32 = 0;

/// Declared type of one positional parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    Int,
    Float,
    String,
    Array(Box<ParamType>),
    /// A structured object, deserialized from a JSON object.
    Object(&'static str),
    Nullable(Box<ParamType>),
    Any,
}

impl ParamType {
    /// How well `value` fits this type; [`DISQUALIFIED`] rules the overload out.
    pub fn score(&self, value: &Value) -> u32 {
        match (self, value) {
            (ParamType::Any, _) => COMPATIBLE,
            (ParamType::Nullable(_), Value::Null) => COMPATIBLE,
            (ParamType::Nullable(inner), v) => inner.score(v),
            (_, Value::Null) => DISQUALIFIED,
            (ParamType::Bool, Value::Bool(_)) => EXACT,
            (ParamType::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => EXACT,
            (ParamType::Float, Value::Number(n)) if n.is_f64() => EXACT,
            // integer widening
            (ParamType::Float, Value::Number(_)) => COMPATIBLE,
            (ParamType::String, Value::String(_)) => EXACT,
            (ParamType::Object(_), Value::Object(_)) => EXACT,
            (ParamType::Array(inner), Value::Array(items)) => {
                let mut score = EXACT;
                for item in items {
                    match inner.score(item) {
                        DISQUALIFIED => return DISQUALIFIED,
                        s if s < EXACT => score = COMPATIBLE,
                        _ => {}
                    }
                }
                score
            }
            _ => DISQUALIFIED,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Bool => f.write_str("bool"),
            ParamType::Int => f.write_str("int"),
            ParamType::Float => f.write_str("float"),
            ParamType::String => f.write_str("string"),
            ParamType::Array(inner) => write!(f, "[{inner}]"),
            ParamType::Object(name) => f.write_str(name),
            ParamType::Nullable(inner) => write!(f, "{inner}?"),
            ParamType::Any => f.write_str("any"),
        }
    }
}

/// A parameter that could not be converted to its declared type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parameter {index}: expected {expected}: {reason}")]
pub struct ConversionError {
    pub index: usize,
    pub expected: String,
    pub reason: String,
}

impl ConversionError {
    pub fn new(expected: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self {
            index: 0,
            expected: expected.to_string(),
            reason: reason.into(),
        }
    }

    pub fn arity(expected: usize, got: usize) -> Self {
        Self {
            index: got.min(expected),
            expected: format!("{expected} parameters"),
            reason: format!("got {got}"),
        }
    }

    /// Position the error at parameter `index`.
    pub fn at(mut self, index: usize) -> Self {
        self.index = index;
        self
    }
}

/// A type that can be built from one positional JSON parameter.
pub trait FromParam: Sized {
    fn param_type() -> ParamType;

    fn from_param(value: &Value) -> Result<Self, ConversionError>;
}

fn mismatch(ty: ParamType, value: &Value) -> ConversionError {
    let reason = format!("got {}", crate::protocol::shape_of(std::slice::from_ref(value)));
    ConversionError::new(ty, reason)
}

impl FromParam for bool {
    fn param_type() -> ParamType {
        ParamType::Bool
    }

    fn from_param(value: &Value) -> Result<Self, ConversionError> {
        value
            .as_bool()
            .ok_or_else(|| mismatch(Self::param_type(), value))
    }
}

macro_rules! signed_param {
    ($($ty: ty),*) => {
        $(
            impl FromParam for $ty {
                fn param_type() -> ParamType {
                    ParamType::Int
                }

                fn from_param(value: &Value) -> Result<Self, ConversionError> {
                    value
                        .as_i64()
                        .and_then(|n| <$ty>::try_from(n).ok())
                        .ok_or_else(|| mismatch(Self::param_type(), value))
                }
            }
        )*
    };
}

macro_rules! unsigned_param {
    ($($ty: ty),*) => {
        $(
            impl FromParam for $ty {
                fn param_type() -> ParamType {
                    ParamType::Int
                }

                fn from_param(value: &Value) -> Result<Self, ConversionError> {
                    value
                        .as_u64()
                        .and_then(|n| <$ty>::try_from(n).ok())
                        .ok_or_else(|| mismatch(Self::param_type(), value))
                }
            }
        )*
    };
}

signed_param!(i8, i16, i32, i64, isize);
unsigned_param!(u8, u16, u32, u64, usize);

impl FromParam for f64 {
    fn param_type() -> ParamType {
        ParamType::Float
    }

    fn from_param(value: &Value) -> Result<Self, ConversionError> {
        value
            .as_f64()
            .ok_or_else(|| mismatch(Self::param_type(), value))
    }
}

impl FromParam for f32 {
    fn param_type() -> ParamType {
        ParamType::Float
    }

    fn from_param(value: &Value) -> Result<Self, ConversionError> {
        f64::from_param(value).map(|n| n as f32)
    }
}

impl FromParam for String {
    fn param_type() -> ParamType {
        ParamType::String
    }

    fn from_param(value: &Value) -> Result<Self, ConversionError> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch(Self::param_type(), value))
    }
}

impl FromParam for Value {
    fn param_type() -> ParamType {
        ParamType::Any
    }

    fn from_param(value: &Value) -> Result<Self, ConversionError> {
        Ok(value.clone())
    }
}

impl<T: FromParam> FromParam for Option<T> {
    fn param_type() -> ParamType {
        ParamType::Nullable(Box::new(T::param_type()))
    }

    fn from_param(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(None),
            v => T::from_param(v).map(Some),
        }
    }
}

impl<T: FromParam> FromParam for Vec<T> {
    fn param_type() -> ParamType {
        ParamType::Array(Box::new(T::param_type()))
    }

    fn from_param(value: &Value) -> Result<Self, ConversionError> {
        let items = value
            .as_array()
            .ok_or_else(|| mismatch(Self::param_type(), value))?;
        items.iter().map(T::from_param).collect()
    }
}

/// A structured parameter or result, (de)serialized with serde.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: DeserializeOwned> FromParam for Json<T> {
    fn param_type() -> ParamType {
        ParamType::Object(simple_type_name::<T>())
    }

    fn from_param(value: &Value) -> Result<Self, ConversionError> {
        serde_json::from_value(value.clone())
            .map(Json)
            .map_err(|e| ConversionError::new(Self::param_type(), e.to_string()))
    }
}

/// `my_crate::module::Point<f64>` -> `Point`
pub fn simple_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
