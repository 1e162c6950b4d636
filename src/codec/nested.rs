//! Serde adapter for fields that hold another wire type.
//!
//! A type registered with [`Codec::register`](super::Codec::register) is
//! dumped through serde, which knows nothing about tags. Mark the fields
//! that hold wire types so they travel as tagged records of their own:
//!
//! ```ignore
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Line {
//!     #[serde(with = "stride::codec::nested")]
//!     a: Point,
//!     #[serde(with = "stride::codec::nested")]
//!     b: Point,
//! }
//! ```
//!
//! The field is written with whatever hooks the running codec has for its
//! type. Serializing such a struct outside a codec fails.

use serde::de::{Deserialize, Deserializer, Error as _};
use serde::ser::{Error as _, Serialize, Serializer};
use serde_json::Value;

use super::payload::{Payload, WireType};
use super::registry::active_codec;

pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: WireType,
    S: Serializer,
{
    let codec = active_codec().ok_or_else(|| S::Error::custom(outside_codec(T::TYPE_NAME)))?;
    codec
        .marshal_object(T::TYPE_NAME, value)
        .map_err(S::Error::custom)?
        .serialize(serializer)
}

pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: WireType + Clone,
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let codec = active_codec().ok_or_else(|| D::Error::custom(outside_codec(T::TYPE_NAME)))?;

    match codec.unmarshal(value).map_err(D::Error::custom)? {
        Payload::Tagged(tagged) => tagged.downcast_ref::<T>().cloned().ok_or_else(|| {
            D::Error::custom(format!(
                "expected a {} record, got {}",
                T::TYPE_NAME,
                tagged.type_name()
            ))
        }),
        _ => Err(D::Error::custom(format!(
            "expected a {} record",
            T::TYPE_NAME
        ))),
    }
}

fn outside_codec(type_name: &str) -> String {
    format!("nested {} value used outside a codec", type_name)
}
