//! Message codec: turns a [`Message`] into bytes and back, given its schema.
//!
//! [`Codec`] is the seam between the dispatcher and the serializer. The
//! default [`XdrCodec`] writes each present field as
//!
//! ```text
//! field_number: u32 | wire_kind: u32 | value
//! ```
//!
//! in ascending field-number order, so encoding the same message twice yields
//! identical bytes. The wire kind tells a reader how to skip a field it does
//! not know, which keeps older peers able to read messages produced from a
//! newer schema revision.

use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use tracing::trace;

use crate::error::CodecError;
use crate::message::{Message, Value};
use crate::protocol::xdr::{deserialize, Serialize, UsizeAsU32};
use crate::schema::{FieldDescriptor, FieldType, MessageSchema, SchemaRegistry};

/// Maximum depth of nested messages accepted in either direction.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Serializer used by the dispatcher on both peers.
pub trait Codec: Send + Sync {
    /// Encodes `message` according to `schema`.
    fn encode(&self, message: &Message, schema: &MessageSchema) -> Result<Vec<u8>, CodecError>;

    /// Decodes bytes produced by a peer according to `schema`. Unknown fields are ignored.
    fn decode(&self, bytes: &[u8], schema: &MessageSchema) -> Result<Message, CodecError>;
}

/// How a field value is laid out on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum WireKind {
    /// Four bytes: bool, int32, uint32, float
    Word = 0,
    /// Eight bytes: int64, uint64, double
    Hyper = 1,
    /// Length-prefixed and padded: string, bytes, nested message, repeated
    Opaque = 2,
}

impl WireKind {
    pub fn of(field_type: &FieldType) -> WireKind {
        match field_type {
            FieldType::Bool | FieldType::Int32 | FieldType::UInt32 | FieldType::Float => {
                WireKind::Word
            }
            FieldType::Int64 | FieldType::UInt64 | FieldType::Double => WireKind::Hyper,
            FieldType::String
            | FieldType::Bytes
            | FieldType::Message(_)
            | FieldType::Repeated(_) => WireKind::Opaque,
        }
    }
}

/// XDR-based [`Codec`]. Holds the registry to resolve nested message types.
#[derive(Clone, Debug)]
pub struct XdrCodec {
    registry: Arc<SchemaRegistry>,
}

impl XdrCodec {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    fn nested_schema(&self, name: &str) -> Result<&MessageSchema, CodecError> {
        self.registry
            .message(name)
            .map(|schema| schema.as_ref())
            .ok_or_else(|| CodecError::UnknownMessageType(name.to_string()))
    }

    fn encode_message(
        &self,
        message: &Message,
        schema: &MessageSchema,
        depth: usize,
    ) -> Result<Vec<u8>, CodecError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(CodecError::TooDeep(MAX_NESTING_DEPTH));
        }
        let unknown = message.iter().find(|(name, _)| schema.field_by_name(name).is_none());
        if let Some((name, _)) = unknown {
            return Err(CodecError::UnknownField {
                message: schema.name().to_string(),
                field: name.to_string(),
            });
        }

        let mut fields: Vec<&FieldDescriptor> = schema.fields().iter().collect();
        fields.sort_by_key(|field| field.number);

        let mut out = Vec::new();
        for field in fields {
            let Some(value) = message.get(&field.name) else {
                continue;
            };
            field.number.serialize(&mut out)?;
            (WireKind::of(&field.field_type) as u32).serialize(&mut out)?;
            self.encode_value(value, &field.field_type, schema, field, depth, &mut out)?;
        }
        Ok(out)
    }

    fn encode_value(
        &self,
        value: &Value,
        field_type: &FieldType,
        schema: &MessageSchema,
        field: &FieldDescriptor,
        depth: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        match (field_type, value) {
            (FieldType::Bool, Value::Bool(v)) => v.serialize(out)?,
            (FieldType::Int32, Value::Int32(v)) => v.serialize(out)?,
            (FieldType::Int64, Value::Int64(v)) => v.serialize(out)?,
            (FieldType::UInt32, Value::UInt32(v)) => v.serialize(out)?,
            (FieldType::UInt64, Value::UInt64(v)) => v.serialize(out)?,
            (FieldType::Float, Value::Float(v)) => v.serialize(out)?,
            (FieldType::Double, Value::Double(v)) => v.serialize(out)?,
            (FieldType::String, Value::String(v)) => v.as_str().serialize(out)?,
            (FieldType::Bytes, Value::Bytes(v)) => v.as_slice().serialize(out)?,
            (FieldType::Message(name), Value::Message(nested)) => {
                let nested_schema = self.nested_schema(name)?;
                let body = self.encode_message(nested, nested_schema, depth + 1)?;
                body.as_slice().serialize(out)?;
            }
            (FieldType::Repeated(inner), Value::List(values)) => {
                let mut body = Vec::new();
                UsizeAsU32(values.len()).serialize(&mut body)?;
                for v in values {
                    self.encode_value(v, inner, schema, field, depth, &mut body)?;
                }
                body.as_slice().serialize(out)?;
            }
            (_, other) => {
                return Err(CodecError::TypeMismatch {
                    message: schema.name().to_string(),
                    field: field.name.clone(),
                    found: other.kind_name(),
                })
            }
        }
        Ok(())
    }

    fn decode_message(
        &self,
        bytes: &[u8],
        schema: &MessageSchema,
        depth: usize,
    ) -> Result<Message, CodecError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(CodecError::TooDeep(MAX_NESTING_DEPTH));
        }

        let mut src = bytes;
        let mut message = Message::new();
        let mut seen = HashSet::new();
        while !src.is_empty() {
            let number = deserialize::<u32>(&mut src)?;
            let raw_kind = deserialize::<u32>(&mut src)?;
            let kind = WireKind::from_u32(raw_kind).ok_or(CodecError::UnknownWireKind(raw_kind))?;

            let Some(field) = schema.field_by_number(number) else {
                trace!("Skipping unknown field {} of {}", number, schema.name());
                skip_value(kind, &mut src)?;
                continue;
            };

            let expected = WireKind::of(&field.field_type);
            if expected != kind {
                return Err(CodecError::WireKindMismatch {
                    message: schema.name().to_string(),
                    number,
                    expected: expected as u32,
                    found: raw_kind,
                });
            }
            if !seen.insert(number) {
                return Err(CodecError::DuplicateField {
                    message: schema.name().to_string(),
                    number,
                });
            }

            let value = self.decode_value(&field.field_type, &field.name, &mut src, depth)?;
            message.set(field.name.clone(), value);
        }
        Ok(message)
    }

    fn decode_value(
        &self,
        field_type: &FieldType,
        field_name: &str,
        src: &mut &[u8],
        depth: usize,
    ) -> Result<Value, CodecError> {
        let invalid = |reason: &str| CodecError::InvalidValue {
            field: field_name.to_string(),
            reason: reason.to_string(),
        };

        let value = match field_type {
            FieldType::Bool => match deserialize::<u32>(src)? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => return Err(invalid("bool must be 0 or 1")),
            },
            FieldType::Int32 => Value::Int32(deserialize(src)?),
            FieldType::Int64 => Value::Int64(deserialize(src)?),
            FieldType::UInt32 => Value::UInt32(deserialize(src)?),
            FieldType::UInt64 => Value::UInt64(deserialize(src)?),
            FieldType::Float => Value::Float(deserialize(src)?),
            FieldType::Double => Value::Double(deserialize(src)?),
            FieldType::String => {
                let bytes = deserialize::<Vec<u8>>(src)?;
                Value::String(String::from_utf8(bytes).map_err(|_| invalid("not UTF-8"))?)
            }
            FieldType::Bytes => Value::Bytes(deserialize::<Vec<u8>>(src)?),
            FieldType::Message(name) => {
                let body = deserialize::<Vec<u8>>(src)?;
                let nested_schema = self.nested_schema(name)?;
                Value::Message(self.decode_message(&body, nested_schema, depth + 1)?)
            }
            FieldType::Repeated(inner) => {
                let body = deserialize::<Vec<u8>>(src)?;
                let mut body_src = body.as_slice();
                let count = deserialize::<u32>(&mut body_src)?;
                let mut values = Vec::new();
                for _ in 0..count {
                    values.push(self.decode_value(inner, field_name, &mut body_src, depth)?);
                }
                if !body_src.is_empty() {
                    return Err(invalid("trailing bytes after repeated values"));
                }
                Value::List(values)
            }
        };
        Ok(value)
    }
}

impl Codec for XdrCodec {
    fn encode(&self, message: &Message, schema: &MessageSchema) -> Result<Vec<u8>, CodecError> {
        self.encode_message(message, schema, 0)
    }

    fn decode(&self, bytes: &[u8], schema: &MessageSchema) -> Result<Message, CodecError> {
        self.decode_message(bytes, schema, 0)
    }
}

/// Skips over one value of the given kind.
fn skip_value(kind: WireKind, src: &mut &[u8]) -> Result<(), CodecError> {
    match kind {
        WireKind::Word => {
            let mut word = [0_u8; 4];
            src.read_exact(&mut word)?;
        }
        WireKind::Hyper => {
            let mut hyper = [0_u8; 8];
            src.read_exact(&mut hyper)?;
        }
        WireKind::Opaque => {
            deserialize::<Vec<u8>>(src)?;
        }
    }
    Ok(())
}
