//! The typed write surface of the codec. Setters validate the column name
//! and declared type, then record the value; the first failure sticks and
//! turns every later setter into a no-op so the root cause is what
//! [`Encoder::error`] reports.

use std::sync::Arc;

use crate::codec::schema::{FieldType, Struct};
use crate::codec::value::{StructValue, Value};
use crate::error::Error;

pub struct Encoder {
    value: StructValue,
    err: Option<Error>,
}

impl Encoder {
    pub fn new(schema: Arc<Struct>) -> Self {
        Encoder {
            value: StructValue::new(schema),
            err: None,
        }
    }

    fn set(&mut self, column: &str, given: FieldType, value: Value) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        let declared = match self.value.schema().field(column) {
            Some(field) => field.typ(),
            None => {
                self.err = Some(Error::UnknownColumnName(column.to_string()));
                return self;
            }
        };
        if declared != given {
            self.err = Some(Error::InvalidEncodeType {
                column: column.to_string(),
                declared,
                given,
            });
            return self;
        }
        self.value.fields.insert(column.to_string(), value);
        self
    }

    fn set_slice_of(&mut self, column: &str, elem: FieldType, values: Vec<Value>) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        let field = match self.value.schema().field(column) {
            Some(field) => field,
            None => {
                self.err = Some(Error::UnknownColumnName(column.to_string()));
                return self;
            }
        };
        if field.typ() != FieldType::Slice || field.elem() != Some(elem) {
            self.err = Some(Error::InvalidEncodeType {
                column: column.to_string(),
                declared: field.typ(),
                given: FieldType::Slice,
            });
            return self;
        }
        self.value
            .fields
            .insert(column.to_string(), Value::Slice(values));
        self
    }

    pub fn set_int(&mut self, column: &str, v: i64) -> &mut Self {
        self.set(column, FieldType::Int, Value::Int(v))
    }

    pub fn set_int8(&mut self, column: &str, v: i8) -> &mut Self {
        self.set(column, FieldType::Int8, Value::Int(i64::from(v)))
    }

    pub fn set_int16(&mut self, column: &str, v: i16) -> &mut Self {
        self.set(column, FieldType::Int16, Value::Int(i64::from(v)))
    }

    pub fn set_int32(&mut self, column: &str, v: i32) -> &mut Self {
        self.set(column, FieldType::Int32, Value::Int(i64::from(v)))
    }

    pub fn set_int64(&mut self, column: &str, v: i64) -> &mut Self {
        self.set(column, FieldType::Int64, Value::Int(v))
    }

    pub fn set_uint(&mut self, column: &str, v: u64) -> &mut Self {
        self.set(column, FieldType::Uint, Value::Uint(v))
    }

    pub fn set_uint8(&mut self, column: &str, v: u8) -> &mut Self {
        self.set(column, FieldType::Uint8, Value::Uint(u64::from(v)))
    }

    pub fn set_uint16(&mut self, column: &str, v: u16) -> &mut Self {
        self.set(column, FieldType::Uint16, Value::Uint(u64::from(v)))
    }

    pub fn set_uint32(&mut self, column: &str, v: u32) -> &mut Self {
        self.set(column, FieldType::Uint32, Value::Uint(u64::from(v)))
    }

    pub fn set_uint64(&mut self, column: &str, v: u64) -> &mut Self {
        self.set(column, FieldType::Uint64, Value::Uint(v))
    }

    pub fn set_float32(&mut self, column: &str, v: f32) -> &mut Self {
        self.set(column, FieldType::Float32, Value::Float32(v))
    }

    pub fn set_float64(&mut self, column: &str, v: f64) -> &mut Self {
        self.set(column, FieldType::Float64, Value::Float64(v))
    }

    pub fn set_string<S: AsRef<str>>(&mut self, column: &str, v: S) -> &mut Self {
        self.set(
            column,
            FieldType::String,
            Value::String(v.as_ref().to_string()),
        )
    }

    pub fn set_bytes(&mut self, column: &str, v: &[u8]) -> &mut Self {
        self.set(column, FieldType::Bytes, Value::Bytes(v.to_vec()))
    }

    pub fn set_bool(&mut self, column: &str, v: bool) -> &mut Self {
        self.set(column, FieldType::Bool, Value::Bool(v))
    }

    pub fn set_time(&mut self, column: &str, v: chrono::DateTime<chrono::Utc>) -> &mut Self {
        self.set(column, FieldType::Time, Value::Time(v))
    }

    pub fn set_ints(&mut self, column: &str, vs: &[i64]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Int(*v)).collect();
        self.set_slice_of(column, FieldType::Int, values)
    }

    pub fn set_int8s(&mut self, column: &str, vs: &[i8]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Int(i64::from(*v))).collect();
        self.set_slice_of(column, FieldType::Int8, values)
    }

    pub fn set_int16s(&mut self, column: &str, vs: &[i16]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Int(i64::from(*v))).collect();
        self.set_slice_of(column, FieldType::Int16, values)
    }

    pub fn set_int32s(&mut self, column: &str, vs: &[i32]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Int(i64::from(*v))).collect();
        self.set_slice_of(column, FieldType::Int32, values)
    }

    pub fn set_int64s(&mut self, column: &str, vs: &[i64]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Int(*v)).collect();
        self.set_slice_of(column, FieldType::Int64, values)
    }

    pub fn set_uints(&mut self, column: &str, vs: &[u64]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Uint(*v)).collect();
        self.set_slice_of(column, FieldType::Uint, values)
    }

    pub fn set_uint8s(&mut self, column: &str, vs: &[u8]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Uint(u64::from(*v))).collect();
        self.set_slice_of(column, FieldType::Uint8, values)
    }

    pub fn set_uint16s(&mut self, column: &str, vs: &[u16]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Uint(u64::from(*v))).collect();
        self.set_slice_of(column, FieldType::Uint16, values)
    }

    pub fn set_uint32s(&mut self, column: &str, vs: &[u32]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Uint(u64::from(*v))).collect();
        self.set_slice_of(column, FieldType::Uint32, values)
    }

    pub fn set_uint64s(&mut self, column: &str, vs: &[u64]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Uint(*v)).collect();
        self.set_slice_of(column, FieldType::Uint64, values)
    }

    pub fn set_float32s(&mut self, column: &str, vs: &[f32]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Float32(*v)).collect();
        self.set_slice_of(column, FieldType::Float32, values)
    }

    pub fn set_float64s(&mut self, column: &str, vs: &[f64]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Float64(*v)).collect();
        self.set_slice_of(column, FieldType::Float64, values)
    }

    pub fn set_strings<S: AsRef<str>>(&mut self, column: &str, vs: &[S]) -> &mut Self {
        let values = vs
            .iter()
            .map(|v| Value::String(v.as_ref().to_string()))
            .collect();
        self.set_slice_of(column, FieldType::String, values)
    }

    pub fn set_byte_slices(&mut self, column: &str, vs: &[Vec<u8>]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Bytes(v.clone())).collect();
        self.set_slice_of(column, FieldType::Bytes, values)
    }

    pub fn set_bools(&mut self, column: &str, vs: &[bool]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Bool(*v)).collect();
        self.set_slice_of(column, FieldType::Bool, values)
    }

    pub fn set_times(&mut self, column: &str, vs: &[chrono::DateTime<chrono::Utc>]) -> &mut Self {
        let values = vs.iter().map(|v| Value::Time(*v)).collect();
        self.set_slice_of(column, FieldType::Time, values)
    }

    /// Nest another encoder's value under a `Struct` column. The nested
    /// encoder must have been built from the column's declared subtype.
    pub fn set_struct(&mut self, column: &str, nested: Encoder) -> &mut Self {
        match self.nested_value(column, FieldType::Struct, nested) {
            Some(value) => self.set(column, FieldType::Struct, Value::Struct(value)),
            None => self,
        }
    }

    /// Nest a sequence of encoder values under a `StructSlice` column.
    pub fn set_structs(&mut self, column: &str, nested: Vec<Encoder>) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        let mut values = Vec::with_capacity(nested.len());
        for enc in nested {
            match self.nested_value(column, FieldType::StructSlice, enc) {
                Some(value) => values.push(value),
                None => return self,
            }
        }
        self.set(column, FieldType::StructSlice, Value::StructSlice(values))
    }

    fn nested_value(
        &mut self,
        column: &str,
        given: FieldType,
        nested: Encoder,
    ) -> Option<StructValue> {
        if self.err.is_some() {
            return None;
        }
        if let Some(err) = nested.err {
            self.err = Some(err);
            return None;
        }
        let enclosing = self.value.schema().clone();
        let field = match enclosing.field(column) {
            Some(field) => field,
            None => {
                self.err = Some(Error::UnknownColumnName(column.to_string()));
                return None;
            }
        };
        let expected = match field.subtype_schema(&enclosing) {
            Some(schema) if field.typ() == given => schema,
            _ => {
                self.err = Some(Error::InvalidEncodeType {
                    column: column.to_string(),
                    declared: field.typ(),
                    given,
                });
                return None;
            }
        };
        let actual = nested.value.schema();
        if !Arc::ptr_eq(&expected, actual) && expected.table_name() != actual.table_name() {
            self.err = Some(Error::InvalidEncodeType {
                column: column.to_string(),
                declared: field.typ(),
                given,
            });
            return None;
        }
        Some(nested.value)
    }

    /// The first error any setter recorded.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Serialise the collected struct-value.
    pub fn encode(self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Serialise the collected struct-value, appending to `buf`.
    pub fn encode_into(self, buf: &mut Vec<u8>) -> Result<(), Error> {
        if let Some(err) = self.err {
            return Err(err);
        }
        self.value.encode(buf)
    }

    pub(crate) fn into_struct_value(self) -> Result<StructValue, Error> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.value),
        }
    }
}
