//! The cache key model. Application code hands any [`CacheKey`]
//! implementation to the transaction façade; the server layer works on the
//! normalised [`CacheKeyRef`] form so the routing data (wire key, ring hash,
//! forced address, tier) is computed exactly once per operation.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Which selector routes the key. [`CacheKeyType::None`] keys route to the
/// last-level ring, falling back to the second-level ring when no
/// last-level servers are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKeyType {
    #[default]
    None,
    Slc,
    Llc,
}

/// Capability interface for cache keys. Only [`CacheKey::string`] is
/// required; the remaining capabilities default to a plain string key:
/// CRC32 ring hash, no forced address, a derived `<key>/lock` lock key and
/// no tier.
pub trait CacheKey: Send + Sync {
    /// The wire key. At most 250 bytes of printable ASCII.
    fn string(&self) -> String;

    /// 32-bit hash used for ring placement. May be 0 when
    /// [`CacheKey::addr`] pins the key to a server.
    fn hash(&self) -> u32 {
        crc32fast::hash(self.string().as_bytes())
    }

    /// Optional forced server address, overriding the ring.
    fn addr(&self) -> Option<String> {
        None
    }

    /// The key used to serialise updates to this key. Kept on the same
    /// tier and forced address as the value key.
    fn lock_key(&self) -> StringCacheKey {
        StringCacheKey {
            key: format!("{}/lock", self.string()),
            typ: self.key_type(),
            addr: self.addr(),
        }
    }

    fn key_type(&self) -> CacheKeyType {
        CacheKeyType::None
    }
}

/// A plain string key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringCacheKey {
    key: String,
    typ: CacheKeyType,
    addr: Option<String>,
}

impl StringCacheKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        StringCacheKey {
            key: key.into(),
            typ: CacheKeyType::None,
            addr: None,
        }
    }

    /// Route the key through the given tier.
    pub fn with_type(mut self, typ: CacheKeyType) -> Self {
        self.typ = typ;
        self
    }

    /// Pin the key to a specific server address, bypassing the ring.
    pub fn with_addr<S: Into<String>>(mut self, addr: S) -> Self {
        self.addr = Some(addr.into());
        self
    }
}

impl CacheKey for StringCacheKey {
    fn string(&self) -> String {
        self.key.clone()
    }

    fn addr(&self) -> Option<String> {
        self.addr.clone()
    }

    fn key_type(&self) -> CacheKeyType {
        self.typ
    }

    fn lock_key(&self) -> StringCacheKey {
        StringCacheKey {
            key: format!("{}/lock", self.key),
            typ: self.typ,
            addr: self.addr.clone(),
        }
    }
}

impl CacheKey for str {
    fn string(&self) -> String {
        self.to_string()
    }
}

impl CacheKey for String {
    fn string(&self) -> String {
        self.clone()
    }
}

impl<K: CacheKey + ?Sized> CacheKey for &K {
    fn string(&self) -> String {
        (**self).string()
    }

    fn hash(&self) -> u32 {
        (**self).hash()
    }

    fn addr(&self) -> Option<String> {
        (**self).addr()
    }

    fn lock_key(&self) -> StringCacheKey {
        (**self).lock_key()
    }

    fn key_type(&self) -> CacheKeyType {
        (**self).key_type()
    }
}

/// The longest key memcached accepts.
const MAX_KEY_LEN: usize = 250;

/// Validate a wire key: non-empty, at most 250 bytes, printable ASCII with
/// no whitespace and no DEL.
pub(crate) fn legal_key(key: &str) -> Result<(), Error> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::MalformedKey);
    }
    for b in key.bytes() {
        if b <= b' ' || b >= 0x7f {
            return Err(Error::MalformedKey);
        }
    }
    Ok(())
}

/// A [`CacheKey`] normalised for the server layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKeyRef {
    key: String,
    hash: u32,
    addr: Option<String>,
    typ: CacheKeyType,
}

impl CacheKeyRef {
    /// Resolve and validate a user key.
    pub fn from_key<K: CacheKey + ?Sized>(key: &K) -> Result<Self, Error> {
        let wire = key.string();
        legal_key(&wire)?;
        Ok(CacheKeyRef {
            key: wire,
            hash: key.hash(),
            addr: key.addr(),
            typ: key.key_type(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    pub fn key_type(&self) -> CacheKeyType {
        self.typ
    }
}
