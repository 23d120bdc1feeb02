//! Binds application values to cache payloads. The transaction façade
//! only knows these two traits; struct types implement them through
//! [`Encoder`]/[`Decoder`], scalars are covered out of the box via ad-hoc
//! single-column schemas, and `Vec<T>` stores a whole struct-slice under
//! one key.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rmp::decode;
use rmp::encode;

use crate::codec::decoder::Decoder;
use crate::codec::encoder::Encoder;
use crate::codec::schema::{FieldType, Struct};
use crate::error::Error;

/// Serialises a value into a cache payload.
pub trait Marshaler {
    fn marshal(&self, buf: &mut Vec<u8>) -> Result<(), Error>;
}

/// Fills a value from a cache payload, consuming it from the cursor.
pub trait Unmarshaler {
    fn unmarshal(&mut self, cur: &mut Cursor<&[u8]>) -> Result<(), Error>;
}

/// The column name ad-hoc scalar schemas use.
const SCALAR_COLUMN: &str = "value";

static SCALAR_SCHEMAS: Lazy<HashMap<FieldType, Arc<Struct>>> = Lazy::new(|| {
    let scalar_types = [
        FieldType::Int,
        FieldType::Int8,
        FieldType::Int16,
        FieldType::Int32,
        FieldType::Int64,
        FieldType::Uint,
        FieldType::Uint8,
        FieldType::Uint16,
        FieldType::Uint32,
        FieldType::Uint64,
        FieldType::Float32,
        FieldType::Float64,
        FieldType::String,
        FieldType::Bytes,
        FieldType::Bool,
        FieldType::Time,
    ];
    scalar_types
        .into_iter()
        .map(|typ| {
            let schema = match typ {
                FieldType::Int => Struct::new("").field_int(SCALAR_COLUMN),
                FieldType::Int8 => Struct::new("").field_int8(SCALAR_COLUMN),
                FieldType::Int16 => Struct::new("").field_int16(SCALAR_COLUMN),
                FieldType::Int32 => Struct::new("").field_int32(SCALAR_COLUMN),
                FieldType::Int64 => Struct::new("").field_int64(SCALAR_COLUMN),
                FieldType::Uint => Struct::new("").field_uint(SCALAR_COLUMN),
                FieldType::Uint8 => Struct::new("").field_uint8(SCALAR_COLUMN),
                FieldType::Uint16 => Struct::new("").field_uint16(SCALAR_COLUMN),
                FieldType::Uint32 => Struct::new("").field_uint32(SCALAR_COLUMN),
                FieldType::Uint64 => Struct::new("").field_uint64(SCALAR_COLUMN),
                FieldType::Float32 => Struct::new("").field_float32(SCALAR_COLUMN),
                FieldType::Float64 => Struct::new("").field_float64(SCALAR_COLUMN),
                FieldType::String => Struct::new("").field_string(SCALAR_COLUMN),
                FieldType::Bytes => Struct::new("").field_bytes(SCALAR_COLUMN),
                FieldType::Bool => Struct::new("").field_bool(SCALAR_COLUMN),
                FieldType::Time => Struct::new("").field_time(SCALAR_COLUMN),
                _ => unreachable!("non-scalar type in scalar schema table"),
            };
            (typ, Arc::new(schema))
        })
        .collect()
});

fn scalar_schema(typ: FieldType) -> Arc<Struct> {
    SCALAR_SCHEMAS
        .get(&typ)
        .cloned()
        .expect("scalar schema table covers every scalar type")
}

macro_rules! scalar_coder {
    ($ty:ty, $field:ident, $set:ident, $get:ident) => {
        impl Marshaler for $ty {
            fn marshal(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
                let mut enc = Encoder::new(scalar_schema(FieldType::$field));
                enc.$set(SCALAR_COLUMN, *self);
                enc.encode_into(buf)
            }
        }

        impl Unmarshaler for $ty {
            fn unmarshal(&mut self, cur: &mut Cursor<&[u8]>) -> Result<(), Error> {
                let mut dec = Decoder::read(scalar_schema(FieldType::$field), cur)?;
                *self = dec.$get(SCALAR_COLUMN);
                dec.error()
            }
        }
    };
}

scalar_coder!(i8, Int8, set_int8, int8);
scalar_coder!(i16, Int16, set_int16, int16);
scalar_coder!(i32, Int32, set_int32, int32);
scalar_coder!(i64, Int, set_int, int);
scalar_coder!(u8, Uint8, set_uint8, uint8);
scalar_coder!(u16, Uint16, set_uint16, uint16);
scalar_coder!(u32, Uint32, set_uint32, uint32);
scalar_coder!(u64, Uint, set_uint, uint);
scalar_coder!(f32, Float32, set_float32, float32);
scalar_coder!(f64, Float64, set_float64, float64);
scalar_coder!(bool, Bool, set_bool, bool);
scalar_coder!(DateTime<Utc>, Time, set_time, time);

impl Marshaler for String {
    fn marshal(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        self.as_str().marshal(buf)
    }
}

impl Unmarshaler for String {
    fn unmarshal(&mut self, cur: &mut Cursor<&[u8]>) -> Result<(), Error> {
        let mut dec = Decoder::read(scalar_schema(FieldType::String), cur)?;
        *self = dec.string(SCALAR_COLUMN);
        dec.error()
    }
}

impl Marshaler for str {
    fn marshal(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let mut enc = Encoder::new(scalar_schema(FieldType::String));
        enc.set_string(SCALAR_COLUMN, self);
        enc.encode_into(buf)
    }
}

/// A raw byte payload stored through the `Bytes` column type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl Marshaler for Bytes {
    fn marshal(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let mut enc = Encoder::new(scalar_schema(FieldType::Bytes));
        enc.set_bytes(SCALAR_COLUMN, &self.0);
        enc.encode_into(buf)
    }
}

impl Unmarshaler for Bytes {
    fn unmarshal(&mut self, cur: &mut Cursor<&[u8]>) -> Result<(), Error> {
        let mut dec = Decoder::read(scalar_schema(FieldType::Bytes), cur)?;
        self.0 = dec.bytes(SCALAR_COLUMN);
        dec.error()
    }
}

/// A `Vec` is stored as a struct-slice: `array(len)`, then every element's
/// own payload.
impl<T: Marshaler> Marshaler for Vec<T> {
    fn marshal(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        encode::write_array_len(buf, self.len() as u32)?;
        for item in self {
            item.marshal(buf)?;
        }
        Ok(())
    }
}

impl<T: Unmarshaler + Default> Unmarshaler for Vec<T> {
    fn unmarshal(&mut self, cur: &mut Cursor<&[u8]>) -> Result<(), Error> {
        let len = decode::read_array_len(cur)? as usize;
        self.clear();
        self.reserve(len);
        for _ in 0..len {
            let mut item = T::default();
            item.unmarshal(cur)?;
            self.push(item);
        }
        Ok(())
    }
}
