//! Attribute value encoding.
//!
//! Attribute values are the tagged scalars, sets, lists and maps of the
//! database data model. Numbers travel as decimal strings and are encoded in
//! their most compact wire form: a 64-bit integer item, a big-integer tag or
//! a decimal tag. The three set kinds use dedicated tags so decoders can
//! distinguish them from plain lists.

use std::collections::HashMap;

use crate::error::{CodecError, CodecResult};
use crate::reader::CborReader;
use crate::types::*;
use crate::writer::CborWriter;

/// A value in the database's attribute data model.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// String.
    S(String),
    /// Number, as a decimal string of arbitrary precision.
    N(String),
    /// Binary.
    B(Vec<u8>),
    /// String set.
    SS(Vec<String>),
    /// Number set.
    NS(Vec<String>),
    /// Binary set.
    BS(Vec<Vec<u8>>),
    /// List.
    L(Vec<AttributeValue>),
    /// Map with string keys. Entry order is not preserved on the wire.
    M(HashMap<String, AttributeValue>),
    /// Boolean.
    Bool(bool),
    /// Null. Only the canonical `Null(true)` form is encodable.
    Null(bool),
}

pub fn encode_attribute_value(value: &AttributeValue, writer: &mut CborWriter) -> CodecResult<()> {
    match value {
        AttributeValue::S(s) => writer.write_string(s),
        AttributeValue::N(n) => writer.write_string_number(n)?,
        AttributeValue::B(b) => writer.write_bytes(b),
        AttributeValue::SS(members) => {
            if members.is_empty() {
                return Err(CodecError::Serialization(
                    "invalid string set: nil or empty".into(),
                ));
            }
            writer.write_tag(TAG_STRING_SET);
            writer.write_array_header(members.len());
            for m in members {
                writer.write_string(m);
            }
        }
        AttributeValue::NS(members) => {
            if members.is_empty() {
                return Err(CodecError::Serialization(
                    "invalid number set: nil or empty".into(),
                ));
            }
            writer.write_tag(TAG_NUMBER_SET);
            writer.write_array_header(members.len());
            for m in members {
                writer.write_string_number(m)?;
            }
        }
        AttributeValue::BS(members) => {
            if members.is_empty() {
                return Err(CodecError::Serialization(
                    "invalid binary set: nil or empty".into(),
                ));
            }
            writer.write_tag(TAG_BINARY_SET);
            writer.write_array_header(members.len());
            for m in members {
                writer.write_bytes(m);
            }
        }
        AttributeValue::L(members) => {
            writer.write_array_header(members.len());
            for m in members {
                encode_attribute_value(m, writer)?;
            }
        }
        AttributeValue::M(entries) => {
            writer.write_map_header(entries.len());
            for (k, v) in entries {
                writer.write_string(k);
                encode_attribute_value(v, writer)?;
            }
        }
        AttributeValue::Bool(b) => writer.write_bool(*b),
        AttributeValue::Null(v) => {
            if !*v {
                return Err(CodecError::Serialization(
                    "invalid null attribute value".into(),
                ));
            }
            writer.write_null();
        }
    }
    Ok(())
}

pub fn decode_attribute_value(reader: &mut CborReader<'_>) -> CodecResult<AttributeValue> {
    let hdr = reader.peek_header()?;
    let major = hdr & MAJOR_TYPE_MASK;
    let minor = hdr & MINOR_TYPE_MASK;

    match major {
        UTF => Ok(AttributeValue::S(reader.read_string()?)),
        BYTES => Ok(AttributeValue::B(reader.read_bytes()?)),
        POS_INT | NEG_INT => Ok(AttributeValue::N(reader.read_int_to_string()?)),
        ARRAY => {
            let len = reader.read_array_len()?;
            let mut members = Vec::with_capacity(len);
            for _ in 0..len {
                members.push(decode_attribute_value(reader)?);
            }
            Ok(AttributeValue::L(members))
        }
        MAP => {
            let len = reader.read_map_len()?;
            let mut entries = HashMap::with_capacity(len);
            for _ in 0..len {
                let k = reader.read_string()?;
                let v = decode_attribute_value(reader)?;
                entries.insert(k, v);
            }
            Ok(AttributeValue::M(entries))
        }
        SIMPLE => {
            reader.read_type_header()?;
            match hdr {
                FALSE => Ok(AttributeValue::Bool(false)),
                TRUE => Ok(AttributeValue::Bool(true)),
                NIL => Ok(AttributeValue::Null(true)),
                _ => Err(CodecError::Deserialization(format!(
                    "unknown minor type {minor} for simple major type"
                ))),
            }
        }
        TAG => {
            let tag = reader.read_tag()?;
            match tag {
                TAG_POS_BIG_INT | TAG_NEG_BIG_INT => {
                    Ok(AttributeValue::N(reader.read_big_int_to_string(tag)?))
                }
                TAG_DECIMAL => Ok(AttributeValue::N(reader.read_decimal_to_string()?)),
                TAG_STRING_SET => {
                    let len = reader.read_array_len()?;
                    let mut members = Vec::with_capacity(len);
                    for _ in 0..len {
                        members.push(reader.read_string()?);
                    }
                    Ok(AttributeValue::SS(members))
                }
                TAG_NUMBER_SET => {
                    let len = reader.read_array_len()?;
                    let mut members = Vec::with_capacity(len);
                    for _ in 0..len {
                        match decode_attribute_value(reader)? {
                            AttributeValue::N(n) => members.push(n),
                            other => {
                                return Err(CodecError::Deserialization(format!(
                                    "number set member is not a number: {other:?}"
                                )))
                            }
                        }
                    }
                    Ok(AttributeValue::NS(members))
                }
                TAG_BINARY_SET => {
                    let len = reader.read_array_len()?;
                    let mut members = Vec::with_capacity(len);
                    for _ in 0..len {
                        members.push(reader.read_bytes()?);
                    }
                    Ok(AttributeValue::BS(members))
                }
                _ => Err(CodecError::Deserialization(format!("unknown tag {tag}"))),
            }
        }
        _ => Err(CodecError::Deserialization(format!(
            "unknown major type {}",
            major >> 5
        ))),
    }
}
