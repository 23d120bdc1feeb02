//! The error taxonomy shared by every layer of the client. The sentinels
//! are stable across both protocol drivers: a miss is always
//! [`Error::CacheMiss`], a stale compare-and-swap token is always
//! [`Error::CasConflict`], no matter which server type is configured.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::codec::FieldType;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The requested key is not present in the cache.
    #[error("cache miss")]
    CacheMiss,

    /// The key is empty, longer than 250 bytes, or contains bytes outside
    /// printable ASCII.
    #[error("malformed cache key")]
    MalformedKey,

    /// A compare-and-swap write lost the race: the server-side value was
    /// modified after the CAS token was issued.
    #[error("compare-and-swap conflict")]
    CasConflict,

    /// The server refused to store the item (e.g. `add` on an existing key).
    #[error("item not stored")]
    NotStored,

    /// The Redis server answered `SET ... NX` with a nil reply.
    #[error("redis value not stored")]
    RedisNotStored,

    /// The column name is not declared by the schema.
    #[error("unknown column name {0:?}")]
    UnknownColumnName(String),

    /// A typed setter was called on a column of a different declared type.
    #[error("cannot encode column {column:?} declared as {declared:?} with a {given:?} value")]
    InvalidEncodeType {
        column: String,
        declared: FieldType,
        given: FieldType,
    },

    /// A typed getter was called on a column of a different declared type.
    #[error("cannot decode column {column:?} declared as {declared:?} as {requested:?}")]
    InvalidDecodeType {
        column: String,
        declared: FieldType,
        requested: FieldType,
    },

    /// The configured timeout is zero.
    #[error("timeout must be a positive duration")]
    SetTimeout,

    /// The configured idle-connection cap is zero.
    #[error("max idle connections must be positive")]
    SetMaxIdleConnections,

    /// No server is registered for the tier the key routes to.
    #[error("cannot assign cache server")]
    CannotAssignCacheServer,

    /// `remove` was called with an address that is not part of the ring.
    #[error("node {0:?} not in ring")]
    NodeNotInRing(String),

    /// The dial itself exceeded the configured timeout. Distinguishable
    /// from other transport failures so callers can treat it as such.
    #[error("connect to {addr}: timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// Any other transport-level failure. The connection that produced it
    /// is closed instead of being returned to the pool.
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server reported an error line (`SERVER_ERROR`, `CLIENT_ERROR`,
    /// `-ERR ...`). Terminal for the current operation.
    #[error("server error: {0}")]
    Server(String),

    /// A response line that no state of the protocol parser accepts.
    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(String),

    #[error("msgpack encode: {0}")]
    MsgpackEncode(String),

    #[error("msgpack decode: {0}")]
    MsgpackDecode(String),

    /// A second terminal call on a transaction that already committed or
    /// rolled back.
    #[error("transaction already committed or rolled back")]
    AlreadyCommitted,
}

impl Error {
    /// Protocol-level failures after which the connection is still in a
    /// known state and may be returned to the pool.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Error::CacheMiss
                | Error::CasConflict
                | Error::NotStored
                | Error::RedisNotStored
                | Error::MalformedKey
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<rmp::encode::ValueWriteError> for Error {
    fn from(err: rmp::encode::ValueWriteError) -> Self {
        Error::MsgpackEncode(err.to_string())
    }
}

impl From<rmp::decode::ValueReadError> for Error {
    fn from(err: rmp::decode::ValueReadError) -> Self {
        Error::MsgpackDecode(err.to_string())
    }
}

impl From<rmp::decode::NumValueReadError> for Error {
    fn from(err: rmp::decode::NumValueReadError) -> Self {
        Error::MsgpackDecode(err.to_string())
    }
}

impl From<rmp::decode::MarkerReadError> for Error {
    fn from(err: rmp::decode::MarkerReadError) -> Self {
        Error::Io(Arc::new(err.0))
    }
}
