//! This crate provides the runtime-agnostic core of rapidash, a
//! client-side two-tier cache over memcached- or Redis-compatible fleets:
//! the transaction façade, the typed value codec, the consistent-hash
//! server selection and the connection pooling. A concrete runtime crate
//! (e.g. `rapidash-tokio`) supplies the [`Connection`] implementation. If
//! compression is undesired, it is possible to disable the `zlib` feature
//! (on by default.)

pub mod codec;
pub mod compress;
pub mod connection;
pub mod error;
pub mod key;
pub mod pool;
pub mod ring;
pub mod selector;
pub mod server;
pub mod tx;

pub use codec::{Bytes, Decoder, Encoder, FieldType, Marshaler, Struct, Unmarshaler, Value};
#[cfg(feature = "zlib")]
pub use compress::ZlibCompressor;
pub use compress::{Compressor, NoCompressor};
pub use connection::Connection;
pub use error::Error;
pub use key::{CacheKey, CacheKeyRef, CacheKeyType, StringCacheKey};
pub use pool::ConnectionPool;
pub use selector::Selector;
pub use server::{
    CacheGetResponse, CacheIterator, CacheServer, CacheServerClient, CacheSetRequest,
    MemcachedCacheServer, RedisCacheServer,
};
pub use tx::{Cache, CacheConfig, CacheServerType, Tx};
