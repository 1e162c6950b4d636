//! Application values that can cross the wire.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Number, Value};

use crate::error::{RpcError, SerializationErrorKind};

/// A non-primitive application type that can travel as a tagged record.
///
/// The type must also be registered with a [`Codec`](super::Codec) on both
/// ends before it can be marshalled or restored.
pub trait WireType: Any + Send + Sync + fmt::Debug + PartialEq {
    /// Identifier written into the `__type__` tag.
    const TYPE_NAME: &'static str;
}

/// Object-safe view of a tagged value.
pub trait WireObject: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_object(&self, other: &dyn WireObject) -> bool;
}

impl<T> WireObject for T
where
    T: Any + Send + Sync + fmt::Debug + PartialEq,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_object(&self, other: &dyn WireObject) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }
}

/// A value of a registered [`WireType`], type-erased.
#[derive(Clone)]
pub struct TaggedValue {
    type_name: String,
    object: Arc<dyn WireObject>,
}

impl TaggedValue {
    /// Wrap a value of a wire type.
    pub fn new<T: WireType>(value: T) -> Self {
        Self {
            type_name: T::TYPE_NAME.to_string(),
            object: Arc::new(value),
        }
    }

    /// The registered type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Borrow the wrapped value if it is a `T`.
    pub fn downcast_ref<T: WireType>(&self) -> Option<&T> {
        self.object.as_any().downcast_ref::<T>()
    }

    pub(crate) fn as_any(&self) -> &dyn Any {
        self.object.as_any()
    }
}

impl PartialEq for TaggedValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.object.eq_object(&*other.object)
    }
}

impl fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedValue")
            .field("type_name", &self.type_name)
            .field("value", &&*self.object)
            .finish()
    }
}

/// A decoded application value: JSON primitives plus tagged objects.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
    Tagged(TaggedValue),
}

impl Payload {
    /// Wrap a wire type as a payload.
    pub fn tagged<T: WireType>(value: T) -> Self {
        Payload::Tagged(TaggedValue::new(value))
    }

    /// Convert plain JSON, without interpreting type tags.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => Payload::Number(n),
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::Array(items.into_iter().map(Payload::from_json).collect()),
            Value::Object(map) => Payload::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Payload::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to plain JSON. Fails if any tagged value is present.
    pub fn to_json(&self) -> Result<Value, RpcError> {
        Ok(match self {
            Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(*b),
            Payload::Number(n) => Value::Number(n.clone()),
            Payload::String(s) => Value::String(s.clone()),
            Payload::Array(items) => Value::Array(
                items
                    .iter()
                    .map(Payload::to_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Payload::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<serde_json::Map<_, _>, RpcError>>()?,
            ),
            Payload::Tagged(_) => {
                return Err(RpcError::Serialization {
                    kind: SerializationErrorKind::NotPlain,
                })
            }
        })
    }

    /// Deserialize a plain payload into any serde type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        Ok(serde_json::from_value(self.to_json()?)?)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Payload::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Payload::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Payload::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Payload::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Payload]> {
        match self {
            Payload::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Payload>> {
        match self {
            Payload::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow a tagged value as `T`.
    pub fn downcast_ref<T: WireType>(&self) -> Option<&T> {
        match self {
            Payload::Tagged(tagged) => tagged.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Payload::Bool(b)
    }
}

impl From<i32> for Payload {
    fn from(n: i32) -> Self {
        Payload::Number(n.into())
    }
}

impl From<i64> for Payload {
    fn from(n: i64) -> Self {
        Payload::Number(n.into())
    }
}

impl From<u64> for Payload {
    fn from(n: u64) -> Self {
        Payload::Number(n.into())
    }
}

impl From<f64> for Payload {
    /// Non-finite floats have no JSON form and become `Null`.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Payload::Null, Payload::Number)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::String(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::String(s)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(items: Vec<Payload>) -> Self {
        Payload::Array(items)
    }
}

impl From<BTreeMap<String, Payload>> for Payload {
    fn from(map: BTreeMap<String, Payload>) -> Self {
        Payload::Map(map)
    }
}

impl From<TaggedValue> for Payload {
    fn from(tagged: TaggedValue) -> Self {
        Payload::Tagged(tagged)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::from_json(value)
    }
}
