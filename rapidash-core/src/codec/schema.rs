//! Schema definitions for the typed codec. A [`Struct`] is an ordered
//! table of typed columns, built fluently and immutable once it is shared
//! with an encoder, so schemas can be held in `Arc`s and reused across
//! threads without locking.

use std::collections::HashMap;
use std::sync::Arc;

/// The closed set of column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    String,
    Bytes,
    Bool,
    Time,
    Slice,
    Struct,
    StructSlice,
}

impl FieldType {
    /// Whether the type may be the element of a `Slice` column.
    pub(crate) fn is_scalar(self) -> bool {
        !matches!(
            self,
            FieldType::Slice | FieldType::Struct | FieldType::StructSlice
        )
    }
}

/// The nested-schema reference of a `Struct` or `StructSlice` column.
/// `SelfRef` is resolved against the enclosing schema at encode and decode
/// time, which is what makes recursive schemas expressible without a cycle
/// during construction.
#[derive(Debug, Clone)]
pub(crate) enum Subtype {
    None,
    Struct(Arc<Struct>),
    SelfRef,
}

#[derive(Debug, Clone)]
pub struct Field {
    typ: FieldType,
    elem: Option<FieldType>,
    subtype: Subtype,
}

impl Field {
    fn scalar(typ: FieldType) -> Self {
        Field {
            typ,
            elem: None,
            subtype: Subtype::None,
        }
    }

    pub fn typ(&self) -> FieldType {
        self.typ
    }

    /// Element type of a `Slice` column.
    pub fn elem(&self) -> Option<FieldType> {
        self.elem
    }

    /// The nested schema of a `Struct`/`StructSlice` column, with
    /// self-references resolved against the enclosing schema.
    pub(crate) fn subtype_schema(&self, enclosing: &Arc<Struct>) -> Option<Arc<Struct>> {
        match &self.subtype {
            Subtype::None => None,
            Subtype::Struct(sub) => Some(sub.clone()),
            Subtype::SelfRef => Some(enclosing.clone()),
        }
    }
}

/// An immutable column table. Column order is declaration order and is
/// preserved by the binary encoding.
#[derive(Debug)]
pub struct Struct {
    table_name: String,
    fields: Vec<(String, Field)>,
    index: HashMap<String, usize>,
}

impl Struct {
    /// Start a new schema. `table_name` may be empty for ad-hoc scalar
    /// schemas.
    pub fn new<S: Into<String>>(table_name: S) -> Self {
        Struct {
            table_name: table_name.into(),
            fields: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn push(mut self, column: &str, field: Field) -> Self {
        assert!(
            !self.index.contains_key(column),
            "column {:?} declared twice",
            column
        );
        self.index.insert(column.to_string(), self.fields.len());
        self.fields.push((column.to_string(), field));
        self
    }

    pub fn field_int(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Int))
    }

    pub fn field_int8(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Int8))
    }

    pub fn field_int16(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Int16))
    }

    pub fn field_int32(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Int32))
    }

    pub fn field_int64(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Int64))
    }

    pub fn field_uint(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Uint))
    }

    pub fn field_uint8(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Uint8))
    }

    pub fn field_uint16(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Uint16))
    }

    pub fn field_uint32(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Uint32))
    }

    pub fn field_uint64(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Uint64))
    }

    pub fn field_float32(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Float32))
    }

    pub fn field_float64(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Float64))
    }

    pub fn field_string(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::String))
    }

    pub fn field_bytes(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Bytes))
    }

    pub fn field_bool(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Bool))
    }

    pub fn field_time(self, column: &str) -> Self {
        self.push(column, Field::scalar(FieldType::Time))
    }

    /// A homogeneous slice column of the given scalar element type.
    pub fn field_slice(self, column: &str, elem: FieldType) -> Self {
        assert!(
            elem.is_scalar(),
            "slice column {:?} must have a scalar element type",
            column
        );
        self.push(
            column,
            Field {
                typ: FieldType::Slice,
                elem: Some(elem),
                subtype: Subtype::None,
            },
        )
    }

    pub fn field_struct(self, column: &str, subtype: Arc<Struct>) -> Self {
        self.push(
            column,
            Field {
                typ: FieldType::Struct,
                elem: None,
                subtype: Subtype::Struct(subtype),
            },
        )
    }

    pub fn field_struct_slice(self, column: &str, subtype: Arc<Struct>) -> Self {
        self.push(
            column,
            Field {
                typ: FieldType::StructSlice,
                elem: None,
                subtype: Subtype::Struct(subtype),
            },
        )
    }

    /// A nested column whose schema is the enclosing schema itself.
    pub fn field_self_struct(self, column: &str) -> Self {
        self.push(
            column,
            Field {
                typ: FieldType::Struct,
                elem: None,
                subtype: Subtype::SelfRef,
            },
        )
    }

    pub fn field_self_struct_slice(self, column: &str) -> Self {
        self.push(
            column,
            Field {
                typ: FieldType::StructSlice,
                elem: None,
                subtype: Subtype::SelfRef,
            },
        )
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, column: &str) -> Option<&Field> {
        self.index.get(column).map(|&i| &self.fields[i].1)
    }

    /// Columns in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Field)> {
        self.fields.iter().map(|(name, field)| (name, field))
    }
}
