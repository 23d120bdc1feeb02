//! The user-facing session layer. A [`Cache`] owns one protocol driver;
//! every read and write goes through a [`Tx`], which buffers writes until
//! commit, serves read-your-writes out of that buffer, serialises
//! concurrent updates through lock keys and hands CAS tokens from finds
//! back to the commit-time writes.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{Marshaler, Unmarshaler};
use crate::compress::{Compressor, NoCompressor};
use crate::connection::Connection;
use crate::error::Error;
use crate::key::{CacheKey, CacheKeyRef, CacheKeyType};
use crate::pool::{ConnectionPool, DEFAULT_MAX_IDLE_CONNECTIONS, DEFAULT_TIMEOUT};
use crate::server::{
    CacheServer, CacheServerClient, CacheSetRequest, MemcachedCacheServer, RedisCacheServer,
};

/// How long an update lock may outlive its transaction before the server
/// expires it.
const LOCK_EXPIRATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheServerType {
    Memcached,
    Redis,
}

/// Client configuration. `servers` seeds both tiers unless a tier lists
/// its own servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub servers: Vec<String>,
    #[serde(default)]
    pub slc_servers: Vec<String>,
    #[serde(default)]
    pub llc_servers: Vec<String>,
    pub server_type: CacheServerType,
    pub timeout: Duration,
    pub max_idle_connections: usize,
}

impl CacheConfig {
    pub fn new(servers: Vec<String>) -> Self {
        CacheConfig {
            servers,
            slc_servers: Vec::new(),
            llc_servers: Vec::new(),
            server_type: CacheServerType::Memcached,
            timeout: DEFAULT_TIMEOUT,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
        }
    }

    pub fn with_server_type(mut self, server_type: CacheServerType) -> Self {
        self.server_type = server_type;
        self
    }

    pub fn with_slc_servers(mut self, servers: Vec<String>) -> Self {
        self.slc_servers = servers;
        self
    }

    pub fn with_llc_servers(mut self, servers: Vec<String>) -> Self {
        self.llc_servers = servers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_idle_connections(mut self, max_idle: usize) -> Self {
        self.max_idle_connections = max_idle;
        self
    }
}

/// A handle on the cache fleet. Cheap to share behind an `Arc`; all
/// operations go through [`Cache::begin`].
pub struct Cache {
    server: Box<dyn CacheServer>,
}

impl Cache {
    /// Build a cache client without payload compression.
    pub fn new<C: Connection>(config: CacheConfig) -> Result<Cache, Error> {
        Cache::with_compressor::<C, NoCompressor>(config, NoCompressor)
    }

    /// Build a cache client running every payload through `compressor`.
    pub fn with_compressor<C: Connection, P: Compressor>(
        config: CacheConfig,
        compressor: P,
    ) -> Result<Cache, Error> {
        let slc = if config.slc_servers.is_empty() {
            &config.servers
        } else {
            &config.slc_servers
        };
        let llc = if config.llc_servers.is_empty() {
            &config.servers
        } else {
            &config.llc_servers
        };
        let client = CacheServerClient::new(slc, llc);
        let pool = ConnectionPool::<C>::new(config.timeout, config.max_idle_connections)?;
        let server: Box<dyn CacheServer> = match config.server_type {
            CacheServerType::Memcached => {
                Box::new(MemcachedCacheServer::new(client, pool, compressor))
            }
            CacheServerType::Redis => Box::new(RedisCacheServer::new(client, pool, compressor)),
        };
        Ok(Cache { server })
    }

    #[cfg(test)]
    pub(crate) fn with_server(server: Box<dyn CacheServer>) -> Cache {
        Cache { server }
    }

    pub fn begin(&self) -> Tx<'_> {
        Tx {
            server: self.server.as_ref(),
            pending: Vec::new(),
            index: HashMap::new(),
            cas_ids: HashMap::new(),
            locks: Vec::new(),
            locked: HashSet::new(),
            state: TxState::Active,
        }
    }

    /// The driver behind this cache.
    pub fn server(&self) -> &dyn CacheServer {
        self.server.as_ref()
    }

    /// Drop every item on every node of both tiers.
    pub async fn flush(&self) -> Result<(), Error> {
        self.server.flush().await
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<(), Error> {
        self.server.set_timeout(timeout)
    }

    pub fn set_max_idle_connections(&self, max_idle: usize) -> Result<(), Error> {
        self.server.set_max_idle_connections(max_idle)
    }

    /// Register a server on a tier ([`CacheKeyType::None`] registers on
    /// both), atomically swapping the ring.
    pub fn add_server(&self, typ: CacheKeyType, addr: &str) {
        self.server.client().add_server(typ, addr);
    }

    pub fn remove_server(&self, typ: CacheKeyType, addr: &str) -> Result<(), Error> {
        self.server.client().remove_server(typ, addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug)]
enum PendingOp {
    Create { value: Vec<u8>, expiration: Duration },
    Update { value: Vec<u8>, expiration: Duration },
    Delete,
}

#[derive(Debug)]
struct PendingWrite {
    key: CacheKeyRef,
    op: PendingOp,
}

/// One cache session. Not shared across threads; writes are buffered
/// until [`Tx::commit`] flushes them in arrival order. Call
/// [`Tx::rollback_unless_committed`] on every exit path so update locks
/// are never leaked.
pub struct Tx<'a> {
    server: &'a dyn CacheServer,
    pending: Vec<PendingWrite>,
    index: HashMap<String, usize>,
    cas_ids: HashMap<String, u64>,
    locks: Vec<CacheKeyRef>,
    locked: HashSet<String>,
    state: TxState,
}

impl<'a> Tx<'a> {
    fn check_active(&self) -> Result<(), Error> {
        match self.state {
            TxState::Active => Ok(()),
            _ => Err(Error::AlreadyCommitted),
        }
    }

    /// Buffer one write per key: a later operation on the same key
    /// replaces the earlier one in place, keeping its commit position.
    fn enqueue(&mut self, key: CacheKeyRef, op: PendingOp) {
        if let Some(&idx) = self.index.get(key.key()) {
            self.pending[idx].op = op;
            return;
        }
        self.index.insert(key.key().to_string(), self.pending.len());
        self.pending.push(PendingWrite { key, op });
    }

    /// Fetch `key` into `value`. Writes buffered by this transaction are
    /// visible; a buffered tombstone reads as a miss. Server reads record
    /// the CAS token for a later [`Tx::update`] of the same key.
    pub async fn find<K: CacheKey, V: Unmarshaler + ?Sized>(
        &mut self,
        key: K,
        value: &mut V,
    ) -> Result<(), Error> {
        self.check_active()?;
        let key = CacheKeyRef::from_key(&key)?;
        if let Some(&idx) = self.index.get(key.key()) {
            return match &self.pending[idx].op {
                PendingOp::Create { value: buf, .. } | PendingOp::Update { value: buf, .. } => {
                    value.unmarshal(&mut Cursor::new(buf.as_slice()))
                }
                PendingOp::Delete => Err(Error::CacheMiss),
            };
        }
        let resp = self.server.get(&key).await?;
        self.cas_ids.insert(key.key().to_string(), resp.cas_id);
        value.unmarshal(&mut Cursor::new(resp.value.as_slice()))
    }

    /// Buffer an insert. Commit stores it with `add`, so racing another
    /// creator of the same key fails the commit with [`Error::NotStored`].
    pub async fn create<K: CacheKey, V: Marshaler + ?Sized>(
        &mut self,
        key: K,
        value: &V,
    ) -> Result<(), Error> {
        self.create_with_expiration(key, value, Duration::ZERO).await
    }

    pub async fn create_with_expiration<K: CacheKey, V: Marshaler + ?Sized>(
        &mut self,
        key: K,
        value: &V,
        expiration: Duration,
    ) -> Result<(), Error> {
        self.check_active()?;
        let key = CacheKeyRef::from_key(&key)?;
        let mut buf = Vec::new();
        value.marshal(&mut buf)?;
        self.enqueue(key, PendingOp::Create { value: buf, expiration });
        Ok(())
    }

    /// Buffer an overwrite, first asserting this session's exclusive
    /// right to the key by `add`ing its lock key. If a prior
    /// [`Tx::find`] returned a CAS token, commit turns the write into a
    /// compare-and-swap.
    pub async fn update<K: CacheKey, V: Marshaler + ?Sized>(
        &mut self,
        key: K,
        value: &V,
    ) -> Result<(), Error> {
        self.update_with_expiration(key, value, Duration::ZERO).await
    }

    pub async fn update_with_expiration<K: CacheKey, V: Marshaler + ?Sized>(
        &mut self,
        key: K,
        value: &V,
        expiration: Duration,
    ) -> Result<(), Error> {
        self.check_active()?;
        let key_ref = CacheKeyRef::from_key(&key)?;
        let mut buf = Vec::new();
        value.marshal(&mut buf)?;
        if !self.locked.contains(key_ref.key()) {
            let lock = CacheKeyRef::from_key(&key.lock_key())?;
            self.server
                .add(&lock, key_ref.key().as_bytes().to_vec(), LOCK_EXPIRATION)
                .await?;
            self.locked.insert(key_ref.key().to_string());
            self.locks.push(lock);
        }
        self.enqueue(key_ref, PendingOp::Update { value: buf, expiration });
        Ok(())
    }

    /// Buffer a tombstone. The server is not contacted until commit, and
    /// a server-side miss at commit time counts as success.
    pub async fn delete<K: CacheKey>(&mut self, key: K) -> Result<(), Error> {
        self.check_active()?;
        let key = CacheKeyRef::from_key(&key)?;
        self.enqueue(key, PendingOp::Delete);
        Ok(())
    }

    /// Flush buffered writes in arrival order, then release locks. The
    /// first write error aborts the commit and surfaces; writes already
    /// flushed stay durable on their servers and are not undone. The
    /// transaction stays open after a failed commit so a rollback can
    /// still release its locks.
    pub async fn commit(&mut self) -> Result<(), Error> {
        self.check_active()?;
        let server = self.server;
        for write in &self.pending {
            match &write.op {
                PendingOp::Create { value, expiration } => {
                    server.add(&write.key, value.clone(), *expiration).await?;
                }
                PendingOp::Update { value, expiration } => {
                    let cas_id = self.cas_ids.get(write.key.key()).copied().unwrap_or(0);
                    let req = CacheSetRequest::new(write.key.clone(), value.clone())
                        .with_expiration(*expiration)
                        .with_cas_id(cas_id);
                    server.set(req).await?;
                }
                PendingOp::Delete => match server.delete(&write.key).await {
                    Ok(()) | Err(Error::CacheMiss) => {}
                    Err(err) => return Err(err),
                },
            }
        }
        self.unlock_all().await?;
        debug!(writes = self.pending.len(), "transaction committed");
        self.pending.clear();
        self.index.clear();
        self.state = TxState::Committed;
        Ok(())
    }

    /// Release locks and discard the write buffer.
    pub async fn rollback(&mut self) -> Result<(), Error> {
        self.check_active()?;
        self.unlock_all().await?;
        debug!(discarded = self.pending.len(), "transaction rolled back");
        self.pending.clear();
        self.index.clear();
        self.cas_ids.clear();
        self.state = TxState::RolledBack;
        Ok(())
    }

    /// [`Tx::rollback`], as a no-op when the transaction already reached
    /// a terminal state. Safe to call on every exit path.
    pub async fn rollback_unless_committed(&mut self) -> Result<(), Error> {
        match self.state {
            TxState::Active => self.rollback().await,
            _ => Ok(()),
        }
    }

    async fn unlock_all(&mut self) -> Result<(), Error> {
        let server = self.server;
        let mut first_err = None;
        for lock in self.locks.drain(..) {
            match server.delete(&lock).await {
                Ok(()) | Err(Error::CacheMiss) => {}
                Err(err) => {
                    warn!(key = lock.key(), %err, "failed to release update lock");
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        self.locked.clear();
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active && (!self.pending.is_empty() || !self.locks.is_empty()) {
            warn!("transaction dropped without commit or rollback");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_test::block_on;

    use super::*;
    use crate::server::{CacheGetResponse, CacheIterator};

    /// An in-memory stand-in for a cache fleet with memcached CAS
    /// semantics.
    struct MemoryCacheServer {
        items: Mutex<HashMap<String, (Vec<u8>, u64)>>,
        cas_counter: AtomicU64,
        client: CacheServerClient,
    }

    impl MemoryCacheServer {
        fn new() -> Self {
            MemoryCacheServer {
                items: Mutex::new(HashMap::new()),
                cas_counter: AtomicU64::new(1),
                client: CacheServerClient::new(&[], &["memory:0".to_string()]),
            }
        }

        fn next_cas(&self) -> u64 {
            self.cas_counter.fetch_add(1, Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CacheServer for MemoryCacheServer {
        async fn get(&self, key: &CacheKeyRef) -> Result<CacheGetResponse, Error> {
            let items = self.items.lock();
            match items.get(key.key()) {
                Some((value, cas_id)) => Ok(CacheGetResponse {
                    value: value.clone(),
                    flags: key.hash(),
                    cas_id: *cas_id,
                }),
                None => Err(Error::CacheMiss),
            }
        }

        async fn get_multi(&self, keys: &[CacheKeyRef]) -> Result<CacheIterator, Error> {
            let mut entries = Vec::with_capacity(keys.len());
            for key in keys {
                entries.push((key.clone(), self.get(key).await));
            }
            Ok(CacheIterator::new(entries))
        }

        async fn set(&self, req: CacheSetRequest) -> Result<(), Error> {
            let next = self.next_cas();
            let mut items = self.items.lock();
            if req.cas_id != 0 {
                match items.get(req.key.key()) {
                    Some((_, cas_id)) if *cas_id != req.cas_id => return Err(Error::CasConflict),
                    Some(_) => {}
                    None => return Err(Error::CacheMiss),
                }
            }
            items.insert(req.key.key().to_string(), (req.value, next));
            Ok(())
        }

        async fn add(
            &self,
            key: &CacheKeyRef,
            value: Vec<u8>,
            _expiration: Duration,
        ) -> Result<(), Error> {
            let next = self.next_cas();
            let mut items = self.items.lock();
            if items.contains_key(key.key()) {
                return Err(Error::NotStored);
            }
            items.insert(key.key().to_string(), (value, next));
            Ok(())
        }

        async fn delete(&self, key: &CacheKeyRef) -> Result<(), Error> {
            match self.items.lock().remove(key.key()) {
                Some(_) => Ok(()),
                None => Err(Error::CacheMiss),
            }
        }

        async fn flush(&self) -> Result<(), Error> {
            self.items.lock().clear();
            Ok(())
        }

        fn client(&self) -> &CacheServerClient {
            &self.client
        }

        fn set_timeout(&self, timeout: Duration) -> Result<(), Error> {
            if timeout.is_zero() {
                return Err(Error::SetTimeout);
            }
            Ok(())
        }

        fn set_max_idle_connections(&self, max_idle: usize) -> Result<(), Error> {
            if max_idle == 0 {
                return Err(Error::SetMaxIdleConnections);
            }
            Ok(())
        }
    }

    fn cache() -> Cache {
        Cache::with_server(Box::new(MemoryCacheServer::new()))
    }

    #[test]
    fn test_create_is_isolated_until_commit() {
        block_on(async {
            let cache = cache();

            let mut tx = cache.begin();
            tx.create("int", &1_i64).await.unwrap();
            // Read-your-writes inside the transaction.
            let mut v = 0_i64;
            tx.find("int", &mut v).await.unwrap();
            assert_eq!(1, v);
            tx.rollback().await.unwrap();

            let mut tx = cache.begin();
            let mut v = 0_i64;
            assert!(matches!(
                tx.find("int", &mut v).await,
                Err(Error::CacheMiss)
            ));
            tx.rollback_unless_committed().await.unwrap();
        });
    }

    #[test]
    fn test_create_update_delete_lifecycle() {
        block_on(async {
            let cache = cache();

            let mut tx = cache.begin();
            tx.create("s", "hello").await.unwrap();
            tx.commit().await.unwrap();

            let mut tx = cache.begin();
            tx.update("s", "world").await.unwrap();
            tx.commit().await.unwrap();

            let mut tx = cache.begin();
            let mut v = String::new();
            tx.find("s", &mut v).await.unwrap();
            assert_eq!("world", v);
            tx.delete("s").await.unwrap();
            tx.commit().await.unwrap();

            let mut tx = cache.begin();
            let mut v = String::new();
            assert!(matches!(tx.find("s", &mut v).await, Err(Error::CacheMiss)));
            tx.rollback().await.unwrap();
        });
    }

    #[test]
    fn test_find_after_delete_in_tx_is_a_miss() {
        block_on(async {
            let cache = cache();

            let mut tx = cache.begin();
            tx.create("k", &7_i64).await.unwrap();
            tx.commit().await.unwrap();

            let mut tx = cache.begin();
            tx.delete("k").await.unwrap();
            let mut v = 0_i64;
            assert!(matches!(tx.find("k", &mut v).await, Err(Error::CacheMiss)));
            tx.rollback().await.unwrap();

            // The tombstone was discarded with the rollback.
            let mut tx = cache.begin();
            tx.find("k", &mut v).await.unwrap();
            assert_eq!(7, v);
            tx.rollback().await.unwrap();
        });
    }

    #[test]
    fn test_concurrent_updates_one_wins() {
        block_on(async {
            let cache = cache();

            let mut tx = cache.begin();
            tx.create("s", "base").await.unwrap();
            tx.commit().await.unwrap();

            let mut tx1 = cache.begin();
            let mut tx2 = cache.begin();
            let mut v = String::new();
            tx1.find("s", &mut v).await.unwrap();
            tx2.find("s", &mut v).await.unwrap();

            tx1.update("s", "first").await.unwrap();
            // The second updater cannot even take the lock while the
            // first holds it.
            assert!(matches!(
                tx2.update("s", "second").await,
                Err(Error::NotStored)
            ));
            tx1.commit().await.unwrap();

            // The lock is free now, but the CAS token from before the
            // first commit is stale.
            tx2.update("s", "second").await.unwrap();
            assert!(matches!(tx2.commit().await, Err(Error::CasConflict)));
            tx2.rollback().await.unwrap();

            let mut tx = cache.begin();
            tx.find("s", &mut v).await.unwrap();
            assert_eq!("first", v);
            tx.rollback().await.unwrap();
        });
    }

    #[test]
    fn test_update_without_find_sets_unconditionally() {
        block_on(async {
            let cache = cache();

            let mut tx = cache.begin();
            tx.create("s", "base").await.unwrap();
            tx.commit().await.unwrap();

            let mut tx = cache.begin();
            tx.update("s", "blind").await.unwrap();
            tx.commit().await.unwrap();

            let mut tx = cache.begin();
            let mut v = String::new();
            tx.find("s", &mut v).await.unwrap();
            assert_eq!("blind", v);
            tx.rollback().await.unwrap();
        });
    }

    #[test]
    fn test_create_conflict_fails_commit() {
        block_on(async {
            let cache = cache();

            let mut tx = cache.begin();
            tx.create("k", &1_i64).await.unwrap();
            tx.commit().await.unwrap();

            let mut tx = cache.begin();
            tx.create("k", &2_i64).await.unwrap();
            assert!(matches!(tx.commit().await, Err(Error::NotStored)));
            // A failed commit leaves the transaction open for rollback.
            tx.rollback().await.unwrap();
        });
    }

    #[test]
    fn test_terminal_calls_are_exclusive() {
        block_on(async {
            let cache = cache();

            let mut tx = cache.begin();
            tx.create("k", &1_i64).await.unwrap();
            tx.commit().await.unwrap();
            assert!(matches!(tx.commit().await, Err(Error::AlreadyCommitted)));
            assert!(matches!(tx.rollback().await, Err(Error::AlreadyCommitted)));
            tx.rollback_unless_committed().await.unwrap();

            let mut tx = cache.begin();
            assert!(matches!(
                tx.find("k", &mut 0_i64).await,
                Ok(())
            ));
            tx.rollback().await.unwrap();
            assert!(matches!(
                tx.create("x", &1_i64).await,
                Err(Error::AlreadyCommitted)
            ));
        });
    }

    #[test]
    fn test_locks_released_on_rollback() {
        block_on(async {
            let cache = cache();

            let mut tx = cache.begin();
            tx.create("s", "base").await.unwrap();
            tx.commit().await.unwrap();

            let mut tx1 = cache.begin();
            tx1.update("s", "abandoned").await.unwrap();
            tx1.rollback().await.unwrap();

            // The rollback released the lock, so a fresh update works.
            let mut tx2 = cache.begin();
            tx2.update("s", "kept").await.unwrap();
            tx2.commit().await.unwrap();

            let mut tx = cache.begin();
            let mut v = String::new();
            tx.find("s", &mut v).await.unwrap();
            assert_eq!("kept", v);
            tx.rollback().await.unwrap();
        });
    }

    #[test]
    fn test_struct_slice_value_round_trip() {
        use crate::codec::{Decoder, Encoder, Struct};
        use once_cell::sync::Lazy;
        use std::sync::Arc;

        #[derive(Debug, Default, Clone, PartialEq)]
        struct Row {
            id: i64,
            active: bool,
            note: String,
        }

        static ROW: Lazy<Arc<Struct>> = Lazy::new(|| {
            Arc::new(
                Struct::new("t")
                    .field_int("i")
                    .field_bool("b")
                    .field_string("s"),
            )
        });

        impl Marshaler for Row {
            fn marshal(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
                let mut enc = Encoder::new(ROW.clone());
                enc.set_int("i", self.id)
                    .set_bool("b", self.active)
                    .set_string("s", &self.note);
                enc.encode_into(buf)
            }
        }

        impl Unmarshaler for Row {
            fn unmarshal(&mut self, cur: &mut Cursor<&[u8]>) -> Result<(), Error> {
                let mut dec = Decoder::read(ROW.clone(), cur)?;
                self.id = dec.int("i");
                self.active = dec.bool("b");
                self.note = dec.string("s");
                dec.error()
            }
        }

        block_on(async {
            let cache = cache();
            let rows = vec![
                Row {
                    id: 1,
                    active: true,
                    note: "hi".to_string(),
                },
                Row {
                    id: 2,
                    active: false,
                    note: "yo".to_string(),
                },
            ];

            let mut tx = cache.begin();
            tx.create("struct_slice", &rows).await.unwrap();
            tx.commit().await.unwrap();

            let mut tx = cache.begin();
            let mut decoded = Vec::<Row>::new();
            tx.find("struct_slice", &mut decoded).await.unwrap();
            assert_eq!(rows, decoded);
            tx.rollback().await.unwrap();
        });
    }
}
