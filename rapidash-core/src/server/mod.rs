//! The unified cache-server contract both protocol drivers implement, and
//! the routing substrate they share: one selector per tier, keys bucketed
//! by destination address for multi-key fan-out.

mod memcached;
mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;
use crate::key::{CacheKeyRef, CacheKeyType};
use crate::selector::Selector;

pub use memcached::MemcachedCacheServer;
pub use redis::RedisCacheServer;

/// A storage request. `flags` carries the key hash back to the server as
/// opaque metadata; a non-zero `cas_id` turns the write into a
/// compare-and-swap.
#[derive(Debug, Clone)]
pub struct CacheSetRequest {
    pub key: CacheKeyRef,
    pub flags: u32,
    pub value: Vec<u8>,
    pub expiration: Duration,
    pub cas_id: u64,
}

impl CacheSetRequest {
    pub fn new(key: CacheKeyRef, value: Vec<u8>) -> Self {
        let flags = key.hash();
        CacheSetRequest {
            key,
            flags,
            value,
            expiration: Duration::ZERO,
            cas_id: 0,
        }
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_cas_id(mut self, cas_id: u64) -> Self {
        self.cas_id = cas_id;
        self
    }
}

/// A fetched item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGetResponse {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas_id: u64,
}

/// The result of a multi-get: one entry per input key, in input order,
/// misses surfacing as the entry's error.
#[derive(Debug)]
pub struct CacheIterator {
    entries: std::vec::IntoIter<(CacheKeyRef, Result<CacheGetResponse, Error>)>,
}

impl CacheIterator {
    pub(crate) fn new(entries: Vec<(CacheKeyRef, Result<CacheGetResponse, Error>)>) -> Self {
        CacheIterator {
            entries: entries.into_iter(),
        }
    }

    /// Remaining entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }
}

impl Iterator for CacheIterator {
    type Item = (CacheKeyRef, Result<CacheGetResponse, Error>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

/// The routing substrate of a driver: one ring per tier.
#[derive(Debug)]
pub struct CacheServerClient {
    slc: Selector,
    llc: Selector,
}

impl CacheServerClient {
    pub fn new(slc_addrs: &[String], llc_addrs: &[String]) -> Self {
        CacheServerClient {
            slc: Selector::new(slc_addrs),
            llc: Selector::new(llc_addrs),
        }
    }

    pub fn slc(&self) -> &Selector {
        &self.slc
    }

    pub fn llc(&self) -> &Selector {
        &self.llc
    }

    /// The selector a key's tier routes through. Untiered keys use the
    /// last-level ring, unless it is empty and only the second-level tier
    /// is configured.
    pub fn selector_of(&self, typ: CacheKeyType) -> &Selector {
        match typ {
            CacheKeyType::Slc => &self.slc,
            CacheKeyType::Llc => &self.llc,
            CacheKeyType::None => {
                if self.llc.is_empty() && !self.slc.is_empty() {
                    &self.slc
                } else {
                    &self.llc
                }
            }
        }
    }

    pub fn pick_server(&self, key: &CacheKeyRef) -> Result<String, Error> {
        self.selector_of(key.key_type()).pick_server(key)
    }

    /// Every node of both tiers, deduplicated, for fleet-wide commands.
    pub fn all_addrs(&self) -> Result<Vec<String>, Error> {
        let mut addrs: Vec<String> = Vec::new();
        let mut collect = |addr: &str| {
            if !addrs.iter().any(|a| a == addr) {
                addrs.push(addr.to_string());
            }
            Ok(())
        };
        self.slc.each(&mut collect)?;
        self.llc.each(&mut collect)?;
        Ok(addrs)
    }

    pub fn add_server(&self, typ: CacheKeyType, addr: &str) {
        match typ {
            CacheKeyType::Slc => self.slc.add(addr),
            CacheKeyType::Llc => self.llc.add(addr),
            CacheKeyType::None => {
                self.slc.add(addr);
                self.llc.add(addr);
            }
        }
    }

    pub fn remove_server(&self, typ: CacheKeyType, addr: &str) -> Result<(), Error> {
        match typ {
            CacheKeyType::Slc => self.slc.remove(addr),
            CacheKeyType::Llc => self.llc.remove(addr),
            CacheKeyType::None => {
                self.slc.remove(addr)?;
                self.llc.remove(addr)
            }
        }
    }
}

/// Group keys by the address they route to, remembering each key's input
/// position so responses can be filled back in order.
pub(crate) fn bucket_by_addr<'a>(
    client: &CacheServerClient,
    keys: &'a [CacheKeyRef],
) -> Result<HashMap<String, Vec<(usize, &'a CacheKeyRef)>>, Error> {
    let mut buckets: HashMap<String, Vec<(usize, &CacheKeyRef)>> = HashMap::new();
    for (idx, key) in keys.iter().enumerate() {
        let addr = client.pick_server(key)?;
        buckets.entry(addr).or_default().push((idx, key));
    }
    Ok(buckets)
}

/// The contract shared by the memcached and Redis drivers.
#[async_trait]
pub trait CacheServer: Send + Sync {
    /// Fetch one item. A miss is [`Error::CacheMiss`].
    async fn get(&self, key: &CacheKeyRef) -> Result<CacheGetResponse, Error>;

    /// Fetch many items. Keys are bucketed by destination address, one
    /// request per address, fanned out concurrently when more than one
    /// address is involved. The iterator preserves input order; per-key
    /// misses surface inside it without failing the batch.
    async fn get_multi(&self, keys: &[CacheKeyRef]) -> Result<CacheIterator, Error>;

    /// Store an item. With a non-zero `cas_id` this is a compare-and-swap
    /// that fails with [`Error::CasConflict`] when the token is stale.
    async fn set(&self, req: CacheSetRequest) -> Result<(), Error>;

    /// Store only when the key is absent.
    async fn add(
        &self,
        key: &CacheKeyRef,
        value: Vec<u8>,
        expiration: Duration,
    ) -> Result<(), Error>;

    /// Remove an item. A miss is reported as [`Error::CacheMiss`]; the
    /// façade maps it to success.
    async fn delete(&self, key: &CacheKeyRef) -> Result<(), Error>;

    /// Drop every item on every node of both tiers.
    async fn flush(&self) -> Result<(), Error>;

    /// The pool/selector substrate.
    fn client(&self) -> &CacheServerClient;

    fn set_timeout(&self, timeout: Duration) -> Result<(), Error>;

    fn set_max_idle_connections(&self, max_idle: usize) -> Result<(), Error>;
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::StringCacheKey;

    fn client() -> CacheServerClient {
        CacheServerClient::new(
            &["slc0:11211".to_string()],
            &["llc0:11211".to_string(), "llc1:11211".to_string()],
        )
    }

    fn key_of(typ: CacheKeyType) -> CacheKeyRef {
        CacheKeyRef::from_key(&StringCacheKey::new("k").with_type(typ)).unwrap()
    }

    #[test]
    fn test_tier_routing() {
        let client = client();
        assert_eq!("slc0:11211", client.pick_server(&key_of(CacheKeyType::Slc)).unwrap());
        let llc = client.pick_server(&key_of(CacheKeyType::Llc)).unwrap();
        assert!(llc.starts_with("llc"));
        // Untiered keys land on the last-level ring.
        let untiered = client.pick_server(&key_of(CacheKeyType::None)).unwrap();
        assert!(untiered.starts_with("llc"));
    }

    #[test]
    fn test_untiered_falls_back_to_slc() {
        let client = CacheServerClient::new(&["slc0:11211".to_string()], &[]);
        assert_eq!(
            "slc0:11211",
            client.pick_server(&key_of(CacheKeyType::None)).unwrap()
        );
        assert!(matches!(
            client.pick_server(&key_of(CacheKeyType::Llc)),
            Err(Error::CannotAssignCacheServer)
        ));
    }

    #[test]
    fn test_all_addrs_deduplicates() {
        let shared = vec!["both:11211".to_string()];
        let client = CacheServerClient::new(&shared, &shared);
        assert_eq!(vec!["both:11211".to_string()], client.all_addrs().unwrap());
    }

    #[test]
    fn test_bucketing_keeps_positions() {
        let client = client();
        let keys: Vec<CacheKeyRef> = (0..10)
            .map(|i| {
                CacheKeyRef::from_key(
                    &StringCacheKey::new(format!("k{}", i)).with_type(CacheKeyType::Llc),
                )
                .unwrap()
            })
            .collect();
        let buckets = bucket_by_addr(&client, &keys).unwrap();
        let mut seen: Vec<usize> = buckets
            .values()
            .flat_map(|bucket| bucket.iter().map(|(idx, _)| *idx))
            .collect();
        seen.sort_unstable();
        assert_eq!((0..10).collect::<Vec<_>>(), seen);
    }

    #[test]
    fn test_iterator_preserves_order() {
        let entries = (0..3)
            .map(|i| {
                let key = CacheKeyRef::from_key(format!("k{}", i).as_str()).unwrap();
                if i == 1 {
                    (key, Err(Error::CacheMiss))
                } else {
                    (
                        key,
                        Ok(CacheGetResponse {
                            value: vec![i as u8],
                            flags: 0,
                            cas_id: 0,
                        }),
                    )
                }
            })
            .collect();
        let iter = CacheIterator::new(entries);
        assert_eq!(3, iter.len());
        let collected: Vec<_> = iter.collect();
        assert_eq!("k0", collected[0].0.key());
        assert!(collected[0].1.is_ok());
        assert!(matches!(collected[1].1, Err(Error::CacheMiss)));
        assert_eq!("k2", collected[2].0.key());
    }
}
