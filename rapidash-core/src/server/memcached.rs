//! The memcached text-protocol driver. Reads always go through `gets` so
//! the server hands back CAS tokens; all storage verbs funnel through one
//! routine that only differs in the verb and the optional CAS id.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::compress::Compressor;
use crate::connection::Connection;
use crate::error::Error;
use crate::key::CacheKeyRef;
use crate::pool::ConnectionPool;
use crate::server::{
    bucket_by_addr, CacheGetResponse, CacheIterator, CacheServer, CacheServerClient,
    CacheSetRequest,
};

pub struct MemcachedCacheServer<C: Connection, P: Compressor> {
    client: CacheServerClient,
    pool: ConnectionPool<C>,
    compressor: P,
}

impl<C: Connection, P: Compressor> MemcachedCacheServer<C, P> {
    pub fn new(client: CacheServerClient, pool: ConnectionPool<C>, compressor: P) -> Self {
        MemcachedCacheServer {
            client,
            pool,
            compressor,
        }
    }

    async fn fetch_from(
        &self,
        addr: &str,
        keys: &[&CacheKeyRef],
    ) -> Result<HashMap<String, CacheGetResponse>, Error> {
        let mut conn = self.pool.get(addr).await?;
        let res = fetch(&mut conn, keys).await;
        self.pool.release(conn, res.as_ref().err());
        let items = res?;
        items
            .into_iter()
            .map(|(key, resp)| {
                let value = self.compressor.decompress(resp.value)?;
                Ok((key, CacheGetResponse { value, ..resp }))
            })
            .collect()
    }

    async fn store(&self, verb: StorageVerb, req: &CacheSetRequest) -> Result<(), Error> {
        let addr = self.client.pick_server(&req.key)?;
        let mut conn = self.pool.get(&addr).await?;
        let res = store(&mut conn, verb, req).await;
        self.pool.release(conn, res.as_ref().err());
        res
    }

    /// Store only when the key already exists.
    pub async fn replace(
        &self,
        key: &CacheKeyRef,
        value: Vec<u8>,
        expiration: Duration,
    ) -> Result<(), Error> {
        let value = self.compressor.compress(value)?;
        let req = CacheSetRequest::new(key.clone(), value).with_expiration(expiration);
        self.store(StorageVerb::Replace, &req).await
    }

    /// Refresh an item's expiration without touching its value.
    pub async fn touch(&self, key: &CacheKeyRef, expiration: Duration) -> Result<(), Error> {
        let addr = self.client.pick_server(key)?;
        let mut conn = self.pool.get(&addr).await?;
        let res = touch(&mut conn, key, expiration).await;
        self.pool.release(conn, res.as_ref().err());
        res
    }

    /// Increment a numeric item, returning the new value.
    pub async fn incr(&self, key: &CacheKeyRef, delta: u64) -> Result<u64, Error> {
        self.arith("incr", key, delta).await
    }

    /// Decrement a numeric item, returning the new value. Decrementing
    /// below zero is pinned at zero by the server.
    pub async fn decr(&self, key: &CacheKeyRef, delta: u64) -> Result<u64, Error> {
        self.arith("decr", key, delta).await
    }

    async fn arith(&self, verb: &str, key: &CacheKeyRef, delta: u64) -> Result<u64, Error> {
        let addr = self.client.pick_server(key)?;
        let mut conn = self.pool.get(&addr).await?;
        let res = arith(&mut conn, verb, key, delta).await;
        self.pool.release(conn, res.as_ref().err());
        res
    }

    /// The version string of the node the key routes to.
    pub async fn version(&self, key: &CacheKeyRef) -> Result<String, Error> {
        let addr = self.client.pick_server(key)?;
        let mut conn = self.pool.get(&addr).await?;
        let res = version(&mut conn).await;
        self.pool.release(conn, res.as_ref().err());
        res
    }
}

#[async_trait]
impl<C: Connection, P: Compressor> CacheServer for MemcachedCacheServer<C, P> {
    async fn get(&self, key: &CacheKeyRef) -> Result<CacheGetResponse, Error> {
        let addr = self.client.pick_server(key)?;
        let mut items = self.fetch_from(&addr, &[key]).await?;
        items.remove(key.key()).ok_or(Error::CacheMiss)
    }

    async fn get_multi(&self, keys: &[CacheKeyRef]) -> Result<CacheIterator, Error> {
        let buckets = bucket_by_addr(&self.client, keys)?;
        let mut slots: Vec<Option<Result<CacheGetResponse, Error>>> = Vec::new();
        slots.resize_with(keys.len(), || None);

        let fetches = buckets.into_iter().map(|(addr, bucket)| async move {
            let refs: Vec<&CacheKeyRef> = bucket.iter().map(|(_, key)| *key).collect();
            let res = self.fetch_from(&addr, &refs).await;
            (bucket, res)
        });
        for (bucket, res) in futures::future::join_all(fetches).await {
            match res {
                Ok(mut items) => {
                    for (idx, key) in bucket {
                        slots[idx] = Some(items.remove(key.key()).ok_or(Error::CacheMiss));
                    }
                }
                Err(err) => {
                    for (idx, _) in bucket {
                        slots[idx] = Some(Err(err.clone()));
                    }
                }
            }
        }

        let entries = keys
            .iter()
            .cloned()
            .zip(slots.into_iter().map(|slot| slot.unwrap_or(Err(Error::CacheMiss))))
            .collect();
        Ok(CacheIterator::new(entries))
    }

    async fn set(&self, req: CacheSetRequest) -> Result<(), Error> {
        let verb = if req.cas_id != 0 {
            StorageVerb::Cas
        } else {
            StorageVerb::Set
        };
        let value = self.compressor.compress(req.value)?;
        self.store(verb, &CacheSetRequest { value, ..req }).await
    }

    async fn add(
        &self,
        key: &CacheKeyRef,
        value: Vec<u8>,
        expiration: Duration,
    ) -> Result<(), Error> {
        let value = self.compressor.compress(value)?;
        let req = CacheSetRequest::new(key.clone(), value).with_expiration(expiration);
        self.store(StorageVerb::Add, &req).await
    }

    async fn delete(&self, key: &CacheKeyRef) -> Result<(), Error> {
        let addr = self.client.pick_server(key)?;
        let mut conn = self.pool.get(&addr).await?;
        let res = delete(&mut conn, key).await;
        self.pool.release(conn, res.as_ref().err());
        res
    }

    async fn flush(&self) -> Result<(), Error> {
        for addr in self.client.all_addrs()? {
            let mut conn = self.pool.get(&addr).await?;
            let res = flush_all(&mut conn).await;
            self.pool.release(conn, res.as_ref().err());
            res?;
        }
        Ok(())
    }

    fn client(&self) -> &CacheServerClient {
        &self.client
    }

    fn set_timeout(&self, timeout: Duration) -> Result<(), Error> {
        self.pool.set_timeout(timeout)
    }

    fn set_max_idle_connections(&self, max_idle: usize) -> Result<(), Error> {
        self.pool.set_max_idle_connections(max_idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageVerb {
    Set,
    Add,
    Replace,
    Cas,
}

impl StorageVerb {
    fn as_str(self) -> &'static str {
        match self {
            StorageVerb::Set => "set",
            StorageVerb::Add => "add",
            StorageVerb::Replace => "replace",
            StorageVerb::Cas => "cas",
        }
    }
}

/// One parsed `VALUE <key> <flags> <bytes> [<casid>]` header line.
#[derive(Debug, Default, PartialEq)]
struct ValueHeader {
    key: String,
    flags: u32,
    size: usize,
    cas_id: u64,
}

#[derive(Debug, Clone, Copy)]
enum HeaderState {
    Key,
    Flags,
    Size,
    CasId,
    Done,
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn line_lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(trim_line(line)).into_owned()
}

/// Map a reply line that is not part of the happy path.
fn response_error(line: &[u8]) -> Error {
    let text = line_lossy(line);
    if text.starts_with("SERVER_ERROR")
        || text.starts_with("CLIENT_ERROR")
        || text == "ERROR"
    {
        Error::Server(text)
    } else {
        Error::UnexpectedResponse(text)
    }
}

fn parse_value_header(line: &[u8]) -> Result<ValueHeader, Error> {
    let rest = match trim_line(line).strip_prefix(b"VALUE ") {
        Some(rest) => rest,
        None => return Err(response_error(line)),
    };

    let mut header = ValueHeader::default();
    let mut state = HeaderState::Key;
    let mut token: Vec<u8> = Vec::new();
    for &b in rest.iter().chain(b"\r".iter()) {
        if b != b' ' && b != b'\r' {
            token.push(b);
            continue;
        }
        state = commit_token(state, &token, &mut header).ok_or_else(|| response_error(line))?;
        token.clear();
        if b == b'\r' {
            break;
        }
    }
    if header.key.is_empty() {
        return Err(response_error(line));
    }
    Ok(header)
}

/// Fold one whitespace-delimited token into the header, advancing the
/// parser state.
fn commit_token(state: HeaderState, token: &[u8], header: &mut ValueHeader) -> Option<HeaderState> {
    let text = std::str::from_utf8(token).ok()?;
    match state {
        HeaderState::Key => {
            header.key = text.to_string();
            Some(HeaderState::Flags)
        }
        HeaderState::Flags => {
            header.flags = text.parse().ok()?;
            Some(HeaderState::Size)
        }
        HeaderState::Size => {
            header.size = text.parse().ok()?;
            Some(HeaderState::CasId)
        }
        HeaderState::CasId => {
            header.cas_id = text.parse().ok()?;
            Some(HeaderState::Done)
        }
        // Trailing tokens after the CAS id.
        HeaderState::Done => None,
    }
}

/// Issue `gets` for the keys and collect every returned item.
async fn fetch<C: Connection>(
    conn: &mut C,
    keys: &[&CacheKeyRef],
) -> Result<HashMap<String, CacheGetResponse>, Error> {
    let mut line = b"gets".to_vec();
    for key in keys {
        line.push(b' ');
        line.extend_from_slice(key.key().as_bytes());
    }
    line.extend_from_slice(b"\r\n");
    conn.write_all(&line).await?;
    conn.flush().await?;

    let mut items = HashMap::new();
    loop {
        let line = conn.read_line().await?;
        if trim_line(&line) == b"END" {
            break;
        }
        let header = parse_value_header(&line)?;
        let mut payload = vec![0_u8; header.size + 2];
        conn.read_exact(&mut payload).await?;
        if &payload[header.size..] != b"\r\n" {
            return Err(Error::UnexpectedResponse(
                "payload is not CRLF-terminated".to_string(),
            ));
        }
        payload.truncate(header.size);
        items.insert(
            header.key,
            CacheGetResponse {
                value: payload,
                flags: header.flags,
                cas_id: header.cas_id,
            },
        );
    }
    Ok(items)
}

/// The single storage routine behind `set`, `add`, `replace` and `cas`.
async fn store<C: Connection>(
    conn: &mut C,
    verb: StorageVerb,
    req: &CacheSetRequest,
) -> Result<(), Error> {
    let mut line = format!(
        "{} {} {} {} {}",
        verb.as_str(),
        req.key.key(),
        req.flags,
        req.expiration.as_secs(),
        req.value.len()
    );
    if verb == StorageVerb::Cas {
        line.push_str(&format!(" {}", req.cas_id));
    }
    line.push_str("\r\n");
    conn.write_all(line.as_bytes()).await?;
    conn.write_all(&req.value).await?;
    conn.write_all(b"\r\n").await?;
    conn.flush().await?;

    let reply = conn.read_line().await?;
    match trim_line(&reply) {
        b"STORED" => Ok(()),
        b"NOT_STORED" => Err(Error::NotStored),
        b"EXISTS" => Err(Error::CasConflict),
        b"NOT_FOUND" => Err(Error::CacheMiss),
        _ => Err(response_error(&reply)),
    }
}

async fn delete<C: Connection>(conn: &mut C, key: &CacheKeyRef) -> Result<(), Error> {
    let line = format!("delete {}\r\n", key.key());
    conn.write_all(line.as_bytes()).await?;
    conn.flush().await?;
    let reply = conn.read_line().await?;
    match trim_line(&reply) {
        b"DELETED" => Ok(()),
        b"NOT_FOUND" => Err(Error::CacheMiss),
        _ => Err(response_error(&reply)),
    }
}

async fn touch<C: Connection>(
    conn: &mut C,
    key: &CacheKeyRef,
    expiration: Duration,
) -> Result<(), Error> {
    let line = format!("touch {} {}\r\n", key.key(), expiration.as_secs());
    conn.write_all(line.as_bytes()).await?;
    conn.flush().await?;
    let reply = conn.read_line().await?;
    match trim_line(&reply) {
        b"TOUCHED" => Ok(()),
        b"NOT_FOUND" => Err(Error::CacheMiss),
        _ => Err(response_error(&reply)),
    }
}

async fn arith<C: Connection>(
    conn: &mut C,
    verb: &str,
    key: &CacheKeyRef,
    delta: u64,
) -> Result<u64, Error> {
    let line = format!("{} {} {}\r\n", verb, key.key(), delta);
    conn.write_all(line.as_bytes()).await?;
    conn.flush().await?;
    let reply = conn.read_line().await?;
    let text = line_lossy(&reply);
    if text == "NOT_FOUND" {
        return Err(Error::CacheMiss);
    }
    text.parse().map_err(|_| response_error(&reply))
}

async fn flush_all<C: Connection>(conn: &mut C) -> Result<(), Error> {
    conn.write_all(b"flush_all\r\n").await?;
    conn.flush().await?;
    let reply = conn.read_line().await?;
    match trim_line(&reply) {
        b"OK" => Ok(()),
        _ => Err(response_error(&reply)),
    }
}

async fn version<C: Connection>(conn: &mut C) -> Result<String, Error> {
    conn.write_all(b"version\r\n").await?;
    conn.flush().await?;
    let reply = conn.read_line().await?;
    let text = line_lossy(&reply);
    match text.strip_prefix("VERSION ") {
        Some(version) => Ok(version.to_string()),
        None => Err(response_error(&reply)),
    }
}
