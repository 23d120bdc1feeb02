//! The typed read surface of the codec. A decoder parses a payload
//! schema-directed up front; getters then convert columns, returning zero
//! values while recording the first failure, mirroring the encoder's
//! sticky-error discipline.

use std::io::Cursor;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rmp::decode;

use crate::codec::schema::{FieldType, Struct};
use crate::codec::value::{StructValue, Value};
use crate::error::Error;

pub struct Decoder {
    values: Vec<StructValue>,
    err: Option<Error>,
}

impl Decoder {
    /// Parse one struct-value from the cursor.
    pub fn read(schema: Arc<Struct>, cur: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let value = StructValue::decode(&schema, cur)?;
        Ok(Decoder {
            values: vec![value],
            err: None,
        })
    }

    /// Parse a struct-slice payload: `array(len)` of struct-values.
    /// Elements are reachable through [`Decoder::len`] and [`Decoder::at`].
    pub fn read_slice(schema: Arc<Struct>, cur: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let len = decode::read_array_len(cur)? as usize;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(StructValue::decode(&schema, cur)?);
        }
        Ok(Decoder { values, err: None })
    }

    /// Parse a whole single-struct payload.
    pub fn new(schema: Arc<Struct>, payload: &[u8]) -> Result<Self, Error> {
        let mut cur = Cursor::new(payload);
        Decoder::read(schema, &mut cur)
    }

    fn from_value(value: StructValue) -> Self {
        Decoder {
            values: vec![value],
            err: None,
        }
    }

    fn failed(err: Error) -> Self {
        Decoder {
            values: Vec::new(),
            err: Some(err),
        }
    }

    /// Number of struct-values held (1 for a single-struct payload).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// A decoder over the `i`-th struct-value of a slice payload.
    pub fn at(&self, i: usize) -> Decoder {
        match self.values.get(i) {
            Some(value) => Decoder::from_value(value.clone()),
            None => Decoder::failed(Error::MsgpackDecode(format!(
                "index {} out of range for {} struct values",
                i,
                self.values.len()
            ))),
        }
    }

    fn lookup(&mut self, column: &str, requested: FieldType) -> Option<Value> {
        if self.err.is_some() {
            return None;
        }
        let outcome = match self.values.first() {
            None => Err(Error::MsgpackDecode(
                "decoder holds no struct value".to_string(),
            )),
            Some(value) => match value.schema().field(column) {
                None => Err(Error::UnknownColumnName(column.to_string())),
                Some(field) if field.typ() != requested => Err(Error::InvalidDecodeType {
                    column: column.to_string(),
                    declared: field.typ(),
                    requested,
                }),
                Some(_) => Ok(value.get(column).cloned()),
            },
        };
        match outcome {
            Ok(value) => value,
            Err(err) => {
                self.err = Some(err);
                None
            }
        }
    }

    fn lookup_slice(&mut self, column: &str, elem: FieldType) -> Vec<Value> {
        if self.err.is_some() {
            return Vec::new();
        }
        let outcome = match self.values.first() {
            None => Err(Error::MsgpackDecode(
                "decoder holds no struct value".to_string(),
            )),
            Some(value) => match value.schema().field(column) {
                None => Err(Error::UnknownColumnName(column.to_string())),
                Some(field) if field.typ() != FieldType::Slice || field.elem() != Some(elem) => {
                    Err(Error::InvalidDecodeType {
                        column: column.to_string(),
                        declared: field.typ(),
                        requested: FieldType::Slice,
                    })
                }
                Some(_) => Ok(value.get(column).cloned()),
            },
        };
        match outcome {
            Ok(Some(Value::Slice(values))) => values,
            Ok(_) => Vec::new(),
            Err(err) => {
                self.err = Some(err);
                Vec::new()
            }
        }
    }

    pub fn int(&mut self, column: &str) -> i64 {
        match self.lookup(column, FieldType::Int) {
            Some(Value::Int(v)) => v,
            _ => 0,
        }
    }

    pub fn int8(&mut self, column: &str) -> i8 {
        match self.lookup(column, FieldType::Int8) {
            Some(Value::Int(v)) => v as i8,
            _ => 0,
        }
    }

    pub fn int16(&mut self, column: &str) -> i16 {
        match self.lookup(column, FieldType::Int16) {
            Some(Value::Int(v)) => v as i16,
            _ => 0,
        }
    }

    pub fn int32(&mut self, column: &str) -> i32 {
        match self.lookup(column, FieldType::Int32) {
            Some(Value::Int(v)) => v as i32,
            _ => 0,
        }
    }

    pub fn int64(&mut self, column: &str) -> i64 {
        match self.lookup(column, FieldType::Int64) {
            Some(Value::Int(v)) => v,
            _ => 0,
        }
    }

    pub fn uint(&mut self, column: &str) -> u64 {
        match self.lookup(column, FieldType::Uint) {
            Some(Value::Uint(v)) => v,
            _ => 0,
        }
    }

    pub fn uint8(&mut self, column: &str) -> u8 {
        match self.lookup(column, FieldType::Uint8) {
            Some(Value::Uint(v)) => v as u8,
            _ => 0,
        }
    }

    pub fn uint16(&mut self, column: &str) -> u16 {
        match self.lookup(column, FieldType::Uint16) {
            Some(Value::Uint(v)) => v as u16,
            _ => 0,
        }
    }

    pub fn uint32(&mut self, column: &str) -> u32 {
        match self.lookup(column, FieldType::Uint32) {
            Some(Value::Uint(v)) => v as u32,
            _ => 0,
        }
    }

    pub fn uint64(&mut self, column: &str) -> u64 {
        match self.lookup(column, FieldType::Uint64) {
            Some(Value::Uint(v)) => v,
            _ => 0,
        }
    }

    pub fn float32(&mut self, column: &str) -> f32 {
        match self.lookup(column, FieldType::Float32) {
            Some(Value::Float32(v)) => v,
            _ => 0.0,
        }
    }

    pub fn float64(&mut self, column: &str) -> f64 {
        match self.lookup(column, FieldType::Float64) {
            Some(Value::Float64(v)) => v,
            _ => 0.0,
        }
    }

    pub fn string(&mut self, column: &str) -> String {
        match self.lookup(column, FieldType::String) {
            Some(Value::String(v)) => v,
            _ => String::new(),
        }
    }

    pub fn bytes(&mut self, column: &str) -> Vec<u8> {
        match self.lookup(column, FieldType::Bytes) {
            Some(Value::Bytes(v)) => v,
            _ => Vec::new(),
        }
    }

    pub fn bool(&mut self, column: &str) -> bool {
        match self.lookup(column, FieldType::Bool) {
            Some(Value::Bool(v)) => v,
            _ => false,
        }
    }

    pub fn time(&mut self, column: &str) -> DateTime<Utc> {
        match self.lookup(column, FieldType::Time) {
            Some(Value::Time(v)) => v,
            _ => DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn ints(&mut self, column: &str) -> Vec<i64> {
        self.lookup_slice(column, FieldType::Int)
            .into_iter()
            .filter_map(|v| match v {
                Value::Int(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn int8s(&mut self, column: &str) -> Vec<i8> {
        self.lookup_slice(column, FieldType::Int8)
            .into_iter()
            .filter_map(|v| match v {
                Value::Int(v) => Some(v as i8),
                _ => None,
            })
            .collect()
    }

    pub fn int16s(&mut self, column: &str) -> Vec<i16> {
        self.lookup_slice(column, FieldType::Int16)
            .into_iter()
            .filter_map(|v| match v {
                Value::Int(v) => Some(v as i16),
                _ => None,
            })
            .collect()
    }

    pub fn int32s(&mut self, column: &str) -> Vec<i32> {
        self.lookup_slice(column, FieldType::Int32)
            .into_iter()
            .filter_map(|v| match v {
                Value::Int(v) => Some(v as i32),
                _ => None,
            })
            .collect()
    }

    pub fn int64s(&mut self, column: &str) -> Vec<i64> {
        self.lookup_slice(column, FieldType::Int64)
            .into_iter()
            .filter_map(|v| match v {
                Value::Int(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn uints(&mut self, column: &str) -> Vec<u64> {
        self.lookup_slice(column, FieldType::Uint)
            .into_iter()
            .filter_map(|v| match v {
                Value::Uint(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn uint8s(&mut self, column: &str) -> Vec<u8> {
        self.lookup_slice(column, FieldType::Uint8)
            .into_iter()
            .filter_map(|v| match v {
                Value::Uint(v) => Some(v as u8),
                _ => None,
            })
            .collect()
    }

    pub fn uint16s(&mut self, column: &str) -> Vec<u16> {
        self.lookup_slice(column, FieldType::Uint16)
            .into_iter()
            .filter_map(|v| match v {
                Value::Uint(v) => Some(v as u16),
                _ => None,
            })
            .collect()
    }

    pub fn uint32s(&mut self, column: &str) -> Vec<u32> {
        self.lookup_slice(column, FieldType::Uint32)
            .into_iter()
            .filter_map(|v| match v {
                Value::Uint(v) => Some(v as u32),
                _ => None,
            })
            .collect()
    }

    pub fn uint64s(&mut self, column: &str) -> Vec<u64> {
        self.lookup_slice(column, FieldType::Uint64)
            .into_iter()
            .filter_map(|v| match v {
                Value::Uint(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn float32s(&mut self, column: &str) -> Vec<f32> {
        self.lookup_slice(column, FieldType::Float32)
            .into_iter()
            .filter_map(|v| match v {
                Value::Float32(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn float64s(&mut self, column: &str) -> Vec<f64> {
        self.lookup_slice(column, FieldType::Float64)
            .into_iter()
            .filter_map(|v| match v {
                Value::Float64(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn strings(&mut self, column: &str) -> Vec<String> {
        self.lookup_slice(column, FieldType::String)
            .into_iter()
            .filter_map(|v| match v {
                Value::String(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn byte_slices(&mut self, column: &str) -> Vec<Vec<u8>> {
        self.lookup_slice(column, FieldType::Bytes)
            .into_iter()
            .filter_map(|v| match v {
                Value::Bytes(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn bools(&mut self, column: &str) -> Vec<bool> {
        self.lookup_slice(column, FieldType::Bool)
            .into_iter()
            .filter_map(|v| match v {
                Value::Bool(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn times(&mut self, column: &str) -> Vec<DateTime<Utc>> {
        self.lookup_slice(column, FieldType::Time)
            .into_iter()
            .filter_map(|v| match v {
                Value::Time(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    /// A decoder over the nested struct-value of `column`. A nil column
    /// yields an empty decoder.
    pub fn struct_(&mut self, column: &str) -> Decoder {
        match self.lookup(column, FieldType::Struct) {
            Some(Value::Struct(value)) => Decoder::from_value(value),
            _ => Decoder {
                values: Vec::new(),
                err: None,
            },
        }
    }

    /// A decoder over a `StructSlice` column, addressable with
    /// [`Decoder::len`] and [`Decoder::at`].
    pub fn structs(&mut self, column: &str) -> Decoder {
        match self.lookup(column, FieldType::StructSlice) {
            Some(Value::StructSlice(values)) => Decoder { values, err: None },
            _ => Decoder {
                values: Vec::new(),
                err: None,
            },
        }
    }

    /// The first error any getter recorded, consuming it.
    pub fn error(&mut self) -> Result<(), Error> {
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
