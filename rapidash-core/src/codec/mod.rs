//! The typed value codec: schema definitions, the intermediate value
//! model, the sticky-error encoder/decoder pair and the payload binding
//! traits used by the transaction façade.

mod coder;
mod decoder;
mod encoder;
mod schema;
mod value;

pub use coder::{Bytes, Marshaler, Unmarshaler};
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use schema::{Field, FieldType, Struct};
pub use value::{StructValue, Value};
