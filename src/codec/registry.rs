//! Type registry that marshals payloads to wire JSON and back.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{RpcError, SerializationErrorKind};

use super::payload::{Payload, TaggedValue, WireType};

/// Key marking a JSON object as a tagged record.
pub const TYPE_TAG: &str = "__type__";

/// Encoded form of a tagged value: constructor args and named fields.
///
/// On the wire the args follow the type name inside the tag array and the
/// fields sit next to the tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dumped {
    pub args: Vec<Value>,
    pub fields: Map<String, Value>,
}

impl Dumped {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

type DumpFn = Arc<dyn Fn(&Codec, &dyn Any) -> Result<Dumped, RpcError> + Send + Sync>;
type LoadFn = Arc<dyn Fn(&Codec, Dumped) -> Result<TaggedValue, RpcError> + Send + Sync>;

#[derive(Clone)]
struct TypeEntry {
    dump: DumpFn,
    load: LoadFn,
}

thread_local! {
    /// Codecs currently running a generic field dump or load on this thread.
    static ACTIVE: RefCell<Vec<Codec>> = const { RefCell::new(Vec::new()) };
}

/// Makes a codec visible to [`nested`](super::nested) fields until dropped.
struct ActiveCodec;

impl ActiveCodec {
    fn enter(codec: &Codec) -> Self {
        ACTIVE.with(|active| active.borrow_mut().push(codec.clone()));
        ActiveCodec
    }
}

impl Drop for ActiveCodec {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            active.borrow_mut().pop();
        });
    }
}

/// The innermost codec running a generic field dump or load, if any.
pub(super) fn active_codec() -> Option<Codec> {
    ACTIVE.with(|active| active.borrow().last().cloned())
}

/// Registry of wire types plus the marshal/unmarshal routines.
///
/// Only registered types can be encoded or restored; a tag naming any other
/// type fails with [`SerializationErrorKind::UnknownType`]. Cloning is cheap
/// and clones share their entries until one of them registers more types.
#[derive(Clone, Default)]
pub struct Codec {
    types: Arc<HashMap<String, TypeEntry>>,
}

impl Codec {
    /// Create a codec that knows only JSON primitives.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type using the generic field dump.
    ///
    /// Every named field is written under its bare name using the type's
    /// serde representation, which must be a JSON object. Fields holding
    /// another wire type are tagged when marked with
    /// `#[serde(with = "stride::codec::nested")]`.
    ///
    /// On load, every tagged record found among the fields must name a type
    /// this codec knows, whether or not the field is marked.
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: WireType + Serialize + DeserializeOwned,
    {
        self.insert_entry::<T, _, _>(
            |codec, value| {
                let _active = ActiveCodec::enter(codec);
                match serde_json::to_value(value) {
                    Ok(Value::Object(fields)) => Ok(Dumped {
                        args: Vec::new(),
                        fields,
                    }),
                    Ok(other) => Err(RpcError::Serialization {
                        kind: SerializationErrorKind::Dump {
                            type_name: T::TYPE_NAME.to_string(),
                            message: format!("expected named fields, got {}", other),
                        },
                    }),
                    Err(e) => Err(RpcError::Serialization {
                        kind: SerializationErrorKind::Dump {
                            type_name: T::TYPE_NAME.to_string(),
                            message: e.to_string(),
                        },
                    }),
                }
            },
            |codec, dumped| {
                for value in dumped.fields.values() {
                    codec.check_nested(value)?;
                }

                let _active = ActiveCodec::enter(codec);
                serde_json::from_value(Value::Object(dumped.fields)).map_err(|e| {
                    RpcError::Serialization {
                        kind: SerializationErrorKind::Load {
                            type_name: T::TYPE_NAME.to_string(),
                            message: e.to_string(),
                        },
                    }
                })
            },
        )
    }

    /// Register a type with explicit dump and load hooks.
    pub fn register_with<T, D, L>(&mut self, dump: D, load: L) -> &mut Self
    where
        T: WireType,
        D: Fn(&T) -> Result<Dumped, RpcError> + Send + Sync + 'static,
        L: Fn(Dumped) -> Result<T, RpcError> + Send + Sync + 'static,
    {
        self.insert_entry::<T, _, _>(move |_, value| dump(value), move |_, dumped| load(dumped))
    }

    fn insert_entry<T, D, L>(&mut self, dump: D, load: L) -> &mut Self
    where
        T: WireType,
        D: Fn(&Codec, &T) -> Result<Dumped, RpcError> + Send + Sync + 'static,
        L: Fn(&Codec, Dumped) -> Result<T, RpcError> + Send + Sync + 'static,
    {
        let entry = TypeEntry {
            dump: Arc::new(move |codec: &Codec, any: &dyn Any| match any.downcast_ref::<T>() {
                Some(value) => dump(codec, value),
                None => Err(RpcError::Serialization {
                    kind: SerializationErrorKind::Dump {
                        type_name: T::TYPE_NAME.to_string(),
                        message: "value does not match the registered type".to_string(),
                    },
                }),
            }),
            load: Arc::new(move |codec: &Codec, dumped| load(codec, dumped).map(TaggedValue::new)),
        };

        debug!(type_name = T::TYPE_NAME, "Registering wire type");
        Arc::make_mut(&mut self.types).insert(T::TYPE_NAME.to_string(), entry);
        self
    }

    /// Whether a type name is known to this codec.
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Convert a payload into wire JSON.
    pub fn marshal(&self, payload: &Payload) -> Result<Value, RpcError> {
        Ok(match payload {
            Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(*b),
            Payload::Number(n) => Value::Number(n.clone()),
            Payload::String(s) => Value::String(s.clone()),
            Payload::Array(items) => Value::Array(self.marshal_all(items)?),
            Payload::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.marshal(v)?)))
                    .collect::<Result<Map<_, _>, RpcError>>()?,
            ),
            Payload::Tagged(tagged) => self.marshal_tagged(tagged)?,
        })
    }

    /// Marshal a positional argument list.
    pub fn marshal_all(&self, payloads: &[Payload]) -> Result<Vec<Value>, RpcError> {
        payloads.iter().map(|p| self.marshal(p)).collect()
    }

    /// Convert wire JSON back into a payload, restoring tagged records.
    pub fn unmarshal(&self, value: Value) -> Result<Payload, RpcError> {
        Ok(match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => Payload::Number(n),
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::Array(self.unmarshal_all(items)?),
            Value::Object(mut map) => match map.remove(TYPE_TAG) {
                Some(tag) => self.restore(tag, map)?,
                None => Payload::Map(
                    map.into_iter()
                        .map(|(k, v)| Ok((k, self.unmarshal(v)?)))
                        .collect::<Result<BTreeMap<_, _>, RpcError>>()?,
                ),
            },
        })
    }

    /// Unmarshal a positional argument list.
    pub fn unmarshal_all(&self, values: Vec<Value>) -> Result<Vec<Payload>, RpcError> {
        values.into_iter().map(|v| self.unmarshal(v)).collect()
    }

    fn marshal_tagged(&self, tagged: &TaggedValue) -> Result<Value, RpcError> {
        self.marshal_object(tagged.type_name(), tagged.as_any())
    }

    /// Write one value of a registered type as a tagged record.
    pub(super) fn marshal_object(
        &self,
        type_name: &str,
        object: &dyn Any,
    ) -> Result<Value, RpcError> {
        let entry = self.entry(type_name)?;
        let Dumped { args, fields } = (entry.dump)(self, object)?;

        let mut tag = Vec::with_capacity(args.len() + 1);
        tag.push(Value::String(type_name.to_string()));
        tag.extend(args);

        let mut record = Map::new();
        record.insert(TYPE_TAG.to_string(), Value::Array(tag));
        for (name, value) in fields {
            if name != TYPE_TAG {
                record.insert(name, value);
            }
        }
        Ok(Value::Object(record))
    }

    fn restore(&self, tag: Value, fields: Map<String, Value>) -> Result<Payload, RpcError> {
        let mut parts = match tag {
            Value::Array(parts) if !parts.is_empty() => parts,
            other => {
                return Err(RpcError::Serialization {
                    kind: SerializationErrorKind::InvalidTag {
                        message: format!("expected [type, ...args], got {}", other),
                    },
                })
            }
        };

        let type_name = match parts.remove(0) {
            Value::String(name) => name,
            other => {
                return Err(RpcError::Serialization {
                    kind: SerializationErrorKind::InvalidTag {
                        message: format!("type name must be a string, got {}", other),
                    },
                })
            }
        };

        let entry = self.entry(&type_name)?;
        let tagged = (entry.load)(
            self,
            Dumped {
                args: parts,
                fields,
            },
        )?;
        Ok(Payload::Tagged(tagged))
    }

    /// Fail on the first tagged record inside `value` that cannot be restored.
    fn check_nested(&self, value: &Value) -> Result<(), RpcError> {
        match value {
            Value::Array(items) => items.iter().try_for_each(|item| self.check_nested(item)),
            Value::Object(map) if map.contains_key(TYPE_TAG) => {
                self.unmarshal(value.clone()).map(drop)
            }
            Value::Object(map) => map.values().try_for_each(|item| self.check_nested(item)),
            _ => Ok(()),
        }
    }

    fn entry(&self, type_name: &str) -> Result<&TypeEntry, RpcError> {
        self.types
            .get(type_name)
            .ok_or_else(|| RpcError::Serialization {
                kind: SerializationErrorKind::UnknownType {
                    type_name: type_name.to_string(),
                },
            })
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Codec").field("types", &names).finish()
    }
}
