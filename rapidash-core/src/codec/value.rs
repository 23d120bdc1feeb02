//! The intermediate value model and its binary form. Encoders collect
//! user data into a [`StructValue`]; the wire payload is a MessagePack
//! encoding of the schema's columns in declaration order, integers in the
//! narrowest form that fits, times as `[seconds, nanoseconds]` pairs.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rmp::decode;
use rmp::encode;
use rmp::Marker;

use crate::codec::schema::{Field, FieldType, Struct};
use crate::error::Error;

/// A tagged union over everything a column can hold. Narrow integer
/// columns normalise into `Int`/`Uint`; the declared [`FieldType`] keeps
/// the width for type checking and decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
    Slice(Vec<Value>),
    Struct(StructValue),
    StructSlice(Vec<StructValue>),
}

/// One struct-shaped value: a schema plus the columns that were set.
/// Missing columns encode as their type's default.
#[derive(Debug, Clone)]
pub struct StructValue {
    pub(crate) schema: Arc<Struct>,
    pub(crate) fields: HashMap<String, Value>,
}

impl PartialEq for StructValue {
    fn eq(&self, other: &Self) -> bool {
        self.schema.table_name() == other.schema.table_name() && self.fields == other.fields
    }
}

impl StructValue {
    pub(crate) fn new(schema: Arc<Struct>) -> Self {
        StructValue {
            schema,
            fields: HashMap::new(),
        }
    }

    pub(crate) fn schema(&self) -> &Arc<Struct> {
        &self.schema
    }

    pub(crate) fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Append the binary form: an array header over the declared columns,
    /// then each column's value or default.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        encode::write_array_len(buf, self.schema.len() as u32)?;
        for (column, field) in self.schema.iter() {
            match self.fields.get(column) {
                Some(value) => encode_value(buf, value)?,
                None => encode_default(buf, field)?,
            }
        }
        Ok(())
    }

    /// Parse one struct-value, consuming it from the cursor.
    pub(crate) fn decode(schema: &Arc<Struct>, cur: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let len = decode::read_array_len(cur)? as usize;
        if len != schema.len() {
            return Err(Error::MsgpackDecode(format!(
                "struct {:?} declares {} columns, payload carries {}",
                schema.table_name(),
                schema.len(),
                len
            )));
        }
        let mut fields = HashMap::with_capacity(len);
        for (column, field) in schema.iter() {
            let value = decode_field(schema, field, cur)?;
            fields.insert(column.clone(), value);
        }
        Ok(StructValue {
            schema: schema.clone(),
            fields,
        })
    }
}

pub(crate) fn encode_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), Error> {
    match value {
        Value::Nil => {
            encode::write_nil(buf)?;
        }
        Value::Bool(v) => {
            encode::write_bool(buf, *v)?;
        }
        Value::Int(v) => {
            encode::write_sint(buf, *v)?;
        }
        Value::Uint(v) => {
            encode::write_uint(buf, *v)?;
        }
        Value::Float32(v) => {
            encode::write_f32(buf, *v)?;
        }
        Value::Float64(v) => {
            encode::write_f64(buf, *v)?;
        }
        Value::String(v) => {
            encode::write_str(buf, v)?;
        }
        Value::Bytes(v) => {
            encode::write_bin(buf, v)?;
        }
        Value::Time(v) => {
            encode_time(buf, v)?;
        }
        Value::Slice(values) => {
            encode::write_array_len(buf, values.len() as u32)?;
            for value in values {
                encode_value(buf, value)?;
            }
        }
        Value::Struct(value) => value.encode(buf)?,
        Value::StructSlice(values) => {
            encode::write_array_len(buf, values.len() as u32)?;
            for value in values {
                value.encode(buf)?;
            }
        }
    }
    Ok(())
}

fn encode_default(buf: &mut Vec<u8>, field: &Field) -> Result<(), Error> {
    match field.typ() {
        FieldType::Int
        | FieldType::Int8
        | FieldType::Int16
        | FieldType::Int32
        | FieldType::Int64 => {
            encode::write_sint(buf, 0)?;
        }
        FieldType::Uint
        | FieldType::Uint8
        | FieldType::Uint16
        | FieldType::Uint32
        | FieldType::Uint64 => {
            encode::write_uint(buf, 0)?;
        }
        FieldType::Float32 => {
            encode::write_f32(buf, 0.0)?;
        }
        FieldType::Float64 => {
            encode::write_f64(buf, 0.0)?;
        }
        FieldType::String => {
            encode::write_str(buf, "")?;
        }
        FieldType::Bytes => {
            encode::write_bin(buf, b"")?;
        }
        FieldType::Bool => {
            encode::write_bool(buf, false)?;
        }
        FieldType::Time => {
            encode_time(buf, &DateTime::<Utc>::UNIX_EPOCH)?;
        }
        // Nil is the default for container columns; an empty slice that
        // was set explicitly stays an empty array on the wire.
        FieldType::Slice | FieldType::Struct | FieldType::StructSlice => {
            encode::write_nil(buf)?;
        }
    }
    Ok(())
}

fn encode_time(buf: &mut Vec<u8>, time: &DateTime<Utc>) -> Result<(), Error> {
    encode::write_array_len(buf, 2)?;
    encode::write_sint(buf, time.timestamp())?;
    encode::write_sint(buf, i64::from(time.timestamp_subsec_nanos()))?;
    Ok(())
}

fn decode_time(cur: &mut Cursor<&[u8]>) -> Result<DateTime<Utc>, Error> {
    let len = decode::read_array_len(cur)?;
    if len != 2 {
        return Err(Error::MsgpackDecode(format!(
            "time encodes as a 2-element array, found {}",
            len
        )));
    }
    let secs: i64 = decode::read_int(cur)?;
    let nanos: u32 = decode::read_int(cur)?;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| Error::MsgpackDecode(format!("timestamp {}s {}ns out of range", secs, nanos)))
}

/// Consume the next marker only when it is nil.
fn next_is_nil(cur: &mut Cursor<&[u8]>) -> Result<bool, Error> {
    let mark = cur.position();
    let marker = decode::read_marker(cur)?;
    if marker == Marker::Null {
        Ok(true)
    } else {
        cur.set_position(mark);
        Ok(false)
    }
}

fn decode_scalar(typ: FieldType, cur: &mut Cursor<&[u8]>) -> Result<Value, Error> {
    let value = match typ {
        FieldType::Int
        | FieldType::Int8
        | FieldType::Int16
        | FieldType::Int32
        | FieldType::Int64 => Value::Int(decode::read_int(cur)?),
        FieldType::Uint
        | FieldType::Uint8
        | FieldType::Uint16
        | FieldType::Uint32
        | FieldType::Uint64 => Value::Uint(decode::read_int(cur)?),
        FieldType::Float32 => Value::Float32(decode::read_f32(cur)?),
        FieldType::Float64 => Value::Float64(decode::read_f64(cur)?),
        FieldType::String => {
            let len = decode::read_str_len(cur)? as usize;
            let mut raw = vec![0_u8; len];
            cur.read_exact(&mut raw)?;
            Value::String(String::from_utf8(raw).map_err(|err| {
                Error::MsgpackDecode(format!("string column is not utf-8: {}", err))
            })?)
        }
        FieldType::Bytes => {
            let len = decode::read_bin_len(cur)? as usize;
            let mut raw = vec![0_u8; len];
            cur.read_exact(&mut raw)?;
            Value::Bytes(raw)
        }
        FieldType::Bool => Value::Bool(decode::read_bool(cur)?),
        FieldType::Time => Value::Time(decode_time(cur)?),
        FieldType::Slice | FieldType::Struct | FieldType::StructSlice => {
            return Err(Error::MsgpackDecode(format!(
                "{:?} is not a scalar type",
                typ
            )))
        }
    };
    Ok(value)
}

fn decode_field(
    enclosing: &Arc<Struct>,
    field: &Field,
    cur: &mut Cursor<&[u8]>,
) -> Result<Value, Error> {
    match field.typ() {
        FieldType::Slice => {
            if next_is_nil(cur)? {
                return Ok(Value::Nil);
            }
            let elem = field.elem().ok_or_else(|| {
                Error::MsgpackDecode("slice column without an element type".to_string())
            })?;
            let len = decode::read_array_len(cur)? as usize;
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                values.push(decode_scalar(elem, cur)?);
            }
            Ok(Value::Slice(values))
        }
        FieldType::Struct => {
            if next_is_nil(cur)? {
                return Ok(Value::Nil);
            }
            let schema = subtype_of(enclosing, field)?;
            Ok(Value::Struct(StructValue::decode(&schema, cur)?))
        }
        FieldType::StructSlice => {
            if next_is_nil(cur)? {
                return Ok(Value::Nil);
            }
            let schema = subtype_of(enclosing, field)?;
            let len = decode::read_array_len(cur)? as usize;
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                values.push(StructValue::decode(&schema, cur)?);
            }
            Ok(Value::StructSlice(values))
        }
        typ => decode_scalar(typ, cur),
    }
}

fn subtype_of(enclosing: &Arc<Struct>, field: &Field) -> Result<Arc<Struct>, Error> {
    field.subtype_schema(enclosing).ok_or_else(|| {
        Error::MsgpackDecode("struct column without a nested schema".to_string())
    })
}
