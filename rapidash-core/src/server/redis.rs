//! The Redis driver. Speaks the RESP subset the cache needs: `SET` with
//! `NX`/`PX`, `GET`, `MGET`, `DEL` and `FLUSHALL`. Expirations go out in
//! milliseconds via `PX`; the RESP subset cannot express compare-and-swap,
//! so `cas_id` is ignored and stores are unconditional.

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

pub struct RedisCacheServer<C: Connection, P: Compressor> {
    client: CacheServerClient,
    pool: ConnectionPool<C>,
    compressor: P,
}

impl<C: Connection, P: Compressor> RedisCacheServer<C, P> {
    pub fn new(client: CacheServerClient, pool: ConnectionPool<C>, compressor: P) -> Self {
        RedisCacheServer {
            client,
            pool,
            compressor,
        }
    }

    async fn fetch_from(
        &self,
        addr: &str,
        keys: &[&CacheKeyRef],
    ) -> Result<Vec<Option<Vec<u8>>>, Error> {
        let mut conn = self.pool.get(addr).await?;
        let res = mget(&mut conn, keys).await;
        self.pool.release(conn, res.as_ref().err());
        res?
            .into_iter()
            .map(|value| match value {
                Some(value) => Ok(Some(self.compressor.decompress(value)?)),
                None => Ok(None),
            })
            .collect()
    }
}

#[async_trait]
impl<C: Connection, P: Compressor> CacheServer for RedisCacheServer<C, P> {
    async fn get(&self, key: &CacheKeyRef) -> Result<CacheGetResponse, Error> {
        let addr = self.client.pick_server(key)?;
        let mut conn = self.pool.get(&addr).await?;
        let res = get(&mut conn, key).await;
        self.pool.release(conn, res.as_ref().err());
        let value = self.compressor.decompress(res?)?;
        // RESP carries neither flags nor CAS tokens.
        Ok(CacheGetResponse {
            value,
            flags: 0,
            cas_id: 0,
        })
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
                Ok(values) => {
                    for ((idx, _), value) in bucket.into_iter().zip(values) {
                        slots[idx] = Some(match value {
                            Some(value) => Ok(CacheGetResponse {
                                value,
                                flags: 0,
                                cas_id: 0,
                            }),
                            None => Err(Error::CacheMiss),
                        });
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
        let addr = self.client.pick_server(&req.key)?;
        let value = self.compressor.compress(req.value)?;
        let mut conn = self.pool.get(&addr).await?;
        let res = set(&mut conn, req.key.key(), &value, false, req.expiration).await;
        self.pool.release(conn, res.as_ref().err());
        res
    }

    async fn add(
        &self,
        key: &CacheKeyRef,
        value: Vec<u8>,
        expiration: Duration,
    ) -> Result<(), Error> {
        let addr = self.client.pick_server(key)?;
        let value = self.compressor.compress(value)?;
        let mut conn = self.pool.get(&addr).await?;
        let res = set(&mut conn, key.key(), &value, true, expiration).await;
        self.pool.release(conn, res.as_ref().err());
        res
    }

    async fn delete(&self, key: &CacheKeyRef) -> Result<(), Error> {
        let addr = self.client.pick_server(key)?;
        let mut conn = self.pool.get(&addr).await?;
        let res = del(&mut conn, key).await;
        self.pool.release(conn, res.as_ref().err());
        res
    }

    async fn flush(&self) -> Result<(), Error> {
        for addr in self.client.all_addrs()? {
            let mut conn = self.pool.get(&addr).await?;
            let res = flushall(&mut conn).await;
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

/// One RESP reply, arrays excluded (only `MGET` returns one, handled by
/// [`read_bulk_array`]).
#[derive(Debug, PartialEq)]
enum Reply {
    Simple(String),
    Int(i64),
    Bulk(Option<Vec<u8>>),
}

async fn write_command<C: Connection>(conn: &mut C, args: &[&[u8]]) -> Result<(), Error> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    conn.write_all(&out).await?;
    conn.flush().await
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_int(text: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            Error::UnexpectedResponse(String::from_utf8_lossy(text).into_owned())
        })
}

async fn read_bulk_payload<C: Connection>(conn: &mut C, len: i64) -> Result<Option<Vec<u8>>, Error> {
    if len < 0 {
        return Ok(None);
    }
    let mut payload = vec![0_u8; len as usize + 2];
    conn.read_exact(&mut payload).await?;
    if &payload[len as usize..] != b"\r\n" {
        return Err(Error::UnexpectedResponse(
            "bulk reply is not CRLF-terminated".to_string(),
        ));
    }
    payload.truncate(len as usize);
    Ok(Some(payload))
}

async fn read_reply<C: Connection>(conn: &mut C) -> Result<Reply, Error> {
    let line = conn.read_line().await?;
    let line = trim_line(&line);
    let (kind, rest) = match line.split_first() {
        Some(split) => split,
        None => return Err(Error::UnexpectedResponse("empty reply line".to_string())),
    };
    match kind {
        b'+' => Ok(Reply::Simple(
            String::from_utf8_lossy(rest).into_owned(),
        )),
        b'-' => Err(Error::Server(String::from_utf8_lossy(rest).into_owned())),
        b':' => Ok(Reply::Int(parse_int(rest)?)),
        b'$' => Ok(Reply::Bulk(read_bulk_payload(conn, parse_int(rest)?).await?)),
        _ => Err(Error::UnexpectedResponse(
            String::from_utf8_lossy(line).into_owned(),
        )),
    }
}

/// Read an `MGET` reply: an array of bulk strings, nil for every miss.
async fn read_bulk_array<C: Connection>(conn: &mut C) -> Result<Vec<Option<Vec<u8>>>, Error> {
    let line = conn.read_line().await?;
    let line = trim_line(&line);
    let len = match line.split_first() {
        Some((b'*', rest)) => parse_int(rest)?,
        Some((b'-', rest)) => {
            return Err(Error::Server(String::from_utf8_lossy(rest).into_owned()))
        }
        _ => {
            return Err(Error::UnexpectedResponse(
                String::from_utf8_lossy(line).into_owned(),
            ))
        }
    };
    let mut values = Vec::with_capacity(len.max(0) as usize);
    for _ in 0..len {
        match read_reply(conn).await? {
            Reply::Bulk(value) => values.push(value),
            reply => {
                return Err(Error::UnexpectedResponse(format!(
                    "non-bulk element in MGET reply: {:?}",
                    reply
                )))
            }
        }
    }
    Ok(values)
}

async fn get<C: Connection>(conn: &mut C, key: &CacheKeyRef) -> Result<Vec<u8>, Error> {
    write_command(conn, &[b"GET", key.key().as_bytes()]).await?;
    match read_reply(conn).await? {
        Reply::Bulk(Some(value)) => Ok(value),
        Reply::Bulk(None) => Err(Error::CacheMiss),
        reply => Err(Error::UnexpectedResponse(format!("{:?}", reply))),
    }
}

async fn mget<C: Connection>(
    conn: &mut C,
    keys: &[&CacheKeyRef],
) -> Result<Vec<Option<Vec<u8>>>, Error> {
    let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
    args.push(b"MGET");
    for key in keys {
        args.push(key.key().as_bytes());
    }
    write_command(conn, &args).await?;
    let values = read_bulk_array(conn).await?;
    if values.len() != keys.len() {
        return Err(Error::UnexpectedResponse(format!(
            "MGET answered {} values for {} keys",
            values.len(),
            keys.len()
        )));
    }
    Ok(values)
}

async fn set<C: Connection>(
    conn: &mut C,
    key: &str,
    value: &[u8],
    only_if_absent: bool,
    expiration: Duration,
) -> Result<(), Error> {
    let millis;
    let mut args: Vec<&[u8]> = vec![b"SET", key.as_bytes(), value];
    if only_if_absent {
        args.push(b"NX");
    }
    if !expiration.is_zero() {
        millis = expiration.as_millis().to_string();
        args.push(b"PX");
        args.push(millis.as_bytes());
    }
    write_command(conn, &args).await?;
    match read_reply(conn).await? {
        Reply::Simple(ok) if ok == "OK" => Ok(()),
        // Nil means the NX guard refused the write.
        Reply::Bulk(None) => Err(Error::RedisNotStored),
        reply => Err(Error::UnexpectedResponse(format!("{:?}", reply))),
    }
}

async fn del<C: Connection>(conn: &mut C, key: &CacheKeyRef) -> Result<(), Error> {
    write_command(conn, &[b"DEL", key.key().as_bytes()]).await?;
    match read_reply(conn).await? {
        Reply::Int(0) => Err(Error::CacheMiss),
        Reply::Int(_) => Ok(()),
        reply => Err(Error::UnexpectedResponse(format!("{:?}", reply))),
    }
}

async fn flushall<C: Connection>(conn: &mut C) -> Result<(), Error> {
    write_command(conn, &[b"FLUSHALL"]).await?;
    match read_reply(conn).await? {
        Reply::Simple(ok) if ok == "OK" => Ok(()),
        reply => Err(Error::UnexpectedResponse(format!("{:?}", reply))),
    }
}
