//! Tokio transport for rapidash. A [`TokioConnection`] speaks to cache
//! servers over TCP (`host:port`) or Unix-domain sockets (absolute `/…`
//! paths), buffered both ways, with every read and write bounded by the
//! deadline the connection pool refreshes on acquisition.
//!
//! ```ignore
//! use rapidash_core::{Cache, CacheConfig};
//! use rapidash_tokio::TokioConnection;
//!
//! let cfg = CacheConfig::new(vec!["localhost:11211".into()]);
//! let cache = Cache::new::<TokioConnection>(cfg)?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use rapidash_core::{Connection, Error};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time;
use tracing::debug;

pub use rapidash_core::{Cache, CacheConfig, CacheServerType};
#[cfg(feature = "zlib")]
pub use rapidash_core::ZlibCompressor;

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A buffered tokio connection to one cache server.
pub struct TokioConnection {
    stream: BufStream<Box<dyn AsyncStream>>,
    addr: String,
    timeout: Duration,
}

impl TokioConnection {
    fn timed_out(&self) -> Error {
        Error::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{}: no progress within {:?}", self.addr, self.timeout),
        ))
    }
}

async fn dial(addr: &str) -> Result<Box<dyn AsyncStream>, Error> {
    if addr.starts_with('/') {
        #[cfg(unix)]
        {
            let stream = UnixStream::connect(addr).await?;
            return Ok(Box::new(stream));
        }
        #[cfg(not(unix))]
        {
            return Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix domain sockets are not available on this platform",
            )));
        }
    }
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

#[async_trait]
impl Connection for TokioConnection {
    async fn connect(addr: &str, timeout: Duration) -> Result<Self, Error> {
        match time::timeout(timeout, dial(addr)).await {
            Ok(Ok(stream)) => {
                debug!(addr, "connected to cache server");
                Ok(TokioConnection {
                    stream: BufStream::new(stream),
                    addr: addr.to_string(),
                    timeout,
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::ConnectTimeout {
                addr: addr.to_string(),
                timeout,
            }),
        }
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, Error> {
        let mut line = Vec::new();
        match time::timeout(self.timeout, self.stream.read_until(b'\n', &mut line)).await {
            Ok(Ok(0)) => Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ))),
            Ok(Ok(_)) => Ok(line),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(self.timed_out()),
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        match time::timeout(self.timeout, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(self.timed_out()),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        match time::timeout(self.timeout, self.stream.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(self.timed_out()),
        }
    }

    async fn flush(&mut self) -> Result<(), Error> {
        match time::timeout(self.timeout, self.stream.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(self.timed_out()),
        }
    }
}

#[cfg(test)]
mod testserver {
    //! Minimal in-process cache servers speaking just enough of each wire
    //! protocol for the end-to-end suite to run hermetically.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct Entry {
        flags: u32,
        value: Vec<u8>,
        cas: u64,
    }

    type Store = Arc<Mutex<HashMap<String, Entry>>>;

    static CAS_COUNTER: AtomicU64 = AtomicU64::new(1);

    fn next_cas() -> u64 {
        CAS_COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    /// Spawn a memcached text-protocol server, returning its address.
    pub async fn memcached() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let store = store.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut reader = BufReader::new(read);
                    loop {
                        let Some(reply) = memcached_command(&mut reader, &store).await else {
                            return;
                        };
                        if write.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn memcached_command(
        reader: &mut BufReader<OwnedReadHalf>,
        store: &Store,
    ) -> Option<Vec<u8>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let words: Vec<&str> = line.trim_end().split(' ').collect();
        let reply = match words.as_slice() {
            ["gets", keys @ ..] | ["get", keys @ ..] => {
                let store = store.lock().unwrap();
                let mut out = Vec::new();
                for key in keys {
                    if let Some(entry) = store.get(*key) {
                        out.extend_from_slice(
                            format!(
                                "VALUE {} {} {} {}\r\n",
                                key,
                                entry.flags,
                                entry.value.len(),
                                entry.cas
                            )
                            .as_bytes(),
                        );
                        out.extend_from_slice(&entry.value);
                        out.extend_from_slice(b"\r\n");
                    }
                }
                out.extend_from_slice(b"END\r\n");
                out
            }
            [verb @ ("set" | "add" | "replace" | "cas"), key, flags, _exp, len, rest @ ..] => {
                let len: usize = len.parse().ok()?;
                let mut payload = vec![0_u8; len + 2];
                reader.read_exact(&mut payload).await.ok()?;
                payload.truncate(len);
                let entry = Entry {
                    flags: flags.parse().ok()?,
                    value: payload,
                    cas: next_cas(),
                };
                let mut store = store.lock().unwrap();
                let occupied = store.contains_key(*key);
                match *verb {
                    "add" if occupied => b"NOT_STORED\r\n".to_vec(),
                    "replace" if !occupied => b"NOT_STORED\r\n".to_vec(),
                    "cas" => {
                        let cas: u64 = rest.first()?.parse().ok()?;
                        match store.get(*key) {
                            None => b"NOT_FOUND\r\n".to_vec(),
                            Some(existing) if existing.cas != cas => b"EXISTS\r\n".to_vec(),
                            Some(_) => {
                                store.insert(key.to_string(), entry);
                                b"STORED\r\n".to_vec()
                            }
                        }
                    }
                    _ => {
                        store.insert(key.to_string(), entry);
                        b"STORED\r\n".to_vec()
                    }
                }
            }
            ["delete", key] => {
                if store.lock().unwrap().remove(*key).is_some() {
                    b"DELETED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            ["touch", key, _exp] => {
                if store.lock().unwrap().contains_key(*key) {
                    b"TOUCHED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            [verb @ ("incr" | "decr"), key, delta] => {
                let delta: u64 = delta.parse().ok()?;
                let mut store = store.lock().unwrap();
                match store.get_mut(*key) {
                    None => b"NOT_FOUND\r\n".to_vec(),
                    Some(entry) => match std::str::from_utf8(&entry.value)
                        .ok()
                        .and_then(|text| text.parse::<u64>().ok())
                    {
                        None => b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"
                            .to_vec(),
                        Some(current) => {
                            let next = if *verb == "incr" {
                                current.wrapping_add(delta)
                            } else {
                                current.saturating_sub(delta)
                            };
                            entry.value = next.to_string().into_bytes();
                            entry.cas = next_cas();
                            format!("{}\r\n", next).into_bytes()
                        }
                    },
                }
            }
            ["flush_all"] => {
                store.lock().unwrap().clear();
                b"OK\r\n".to_vec()
            }
            ["version"] => b"VERSION 1.6.0-test\r\n".to_vec(),
            _ => b"ERROR\r\n".to_vec(),
        };
        Some(reply)
    }

    /// Spawn a RESP server, returning its address.
    pub async fn redis() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let store = store.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut reader = BufReader::new(read);
                    loop {
                        let Some(reply) = redis_command(&mut reader, &store).await else {
                            return;
                        };
                        if write.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn read_resp_args(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<Vec<u8>>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let argc: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            let mut header = String::new();
            reader.read_line(&mut header).await.ok()?;
            let len: usize = header.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut payload = vec![0_u8; len + 2];
            reader.read_exact(&mut payload).await.ok()?;
            payload.truncate(len);
            args.push(payload);
        }
        Some(args)
    }

    async fn redis_command(
        reader: &mut BufReader<OwnedReadHalf>,
        store: &Store,
    ) -> Option<Vec<u8>> {
        let args = read_resp_args(reader).await?;
        let command = String::from_utf8_lossy(args.first()?).to_uppercase();
        let reply = match command.as_str() {
            "SET" => {
                let key = String::from_utf8_lossy(&args[1]).into_owned();
                let value = args[2].clone();
                let nx = args[3..]
                    .iter()
                    .any(|arg| arg.eq_ignore_ascii_case(b"NX"));
                let mut store = store.lock().unwrap();
                if nx && store.contains_key(&key) {
                    b"$-1\r\n".to_vec()
                } else {
                    store.insert(
                        key,
                        Entry {
                            flags: 0,
                            value,
                            cas: next_cas(),
                        },
                    );
                    b"+OK\r\n".to_vec()
                }
            }
            "GET" => {
                let key = String::from_utf8_lossy(&args[1]).into_owned();
                match store.lock().unwrap().get(&key) {
                    Some(entry) => bulk(&entry.value),
                    None => b"$-1\r\n".to_vec(),
                }
            }
            "MGET" => {
                let store = store.lock().unwrap();
                let mut out = format!("*{}\r\n", args.len() - 1).into_bytes();
                for key in &args[1..] {
                    let key = String::from_utf8_lossy(key).into_owned();
                    match store.get(&key) {
                        Some(entry) => out.extend_from_slice(&bulk(&entry.value)),
                        None => out.extend_from_slice(b"$-1\r\n"),
                    }
                }
                out
            }
            "DEL" => {
                let mut store = store.lock().unwrap();
                let removed = args[1..]
                    .iter()
                    .filter(|key| {
                        let key = String::from_utf8_lossy(key).into_owned();
                        store.remove(&key).is_some()
                    })
                    .count();
                format!(":{}\r\n", removed).into_bytes()
            }
            "FLUSHALL" => {
                store.lock().unwrap().clear();
                b"+OK\r\n".to_vec()
            }
            _ => format!("-ERR unknown command '{}'\r\n", command).into_bytes(),
        };
        Some(reply)
    }

    fn bulk(value: &[u8]) -> Vec<u8> {
        let mut out = format!("${}\r\n", value.len()).into_bytes();
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
        out
    }
}
