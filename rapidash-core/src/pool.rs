//! Per-address pooling of live connections. One mutex guards all free
//! stacks; it is only ever held for a push or a pop, never across an await.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 2;

#[derive(Debug)]
struct PoolInner<C> {
    free: HashMap<String, Vec<C>>,
    timeout: Duration,
    max_idle: usize,
}

/// A pool of connections keyed by server address.
///
/// Acquire with [`ConnectionPool::get`] at the start of an operation and
/// hand the connection back through [`ConnectionPool::release`] with the
/// operation's error, which decides between returning it to the free stack
/// and closing it.
#[derive(Debug)]
pub struct ConnectionPool<C: Connection> {
    inner: Mutex<PoolInner<C>>,
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new(timeout: Duration, max_idle: usize) -> Result<Self, Error> {
        if timeout.is_zero() {
            return Err(Error::SetTimeout);
        }
        if max_idle == 0 {
            return Err(Error::SetMaxIdleConnections);
        }
        Ok(ConnectionPool {
            inner: Mutex::new(PoolInner {
                free: HashMap::new(),
                timeout,
                max_idle,
            }),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.inner.lock().timeout
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<(), Error> {
        if timeout.is_zero() {
            return Err(Error::SetTimeout);
        }
        self.inner.lock().timeout = timeout;
        Ok(())
    }

    pub fn set_max_idle_connections(&self, max_idle: usize) -> Result<(), Error> {
        if max_idle == 0 {
            return Err(Error::SetMaxIdleConnections);
        }
        self.inner.lock().max_idle = max_idle;
        Ok(())
    }

    /// Pop a pooled connection for `addr`, refreshing its deadline, or dial
    /// a new one.
    pub async fn get(&self, addr: &str) -> Result<C, Error> {
        let (pooled, timeout) = {
            let mut inner = self.inner.lock();
            let pooled = inner.free.get_mut(addr).and_then(Vec::pop);
            (pooled, inner.timeout)
        };
        if let Some(mut conn) = pooled {
            conn.set_timeout(timeout);
            return Ok(conn);
        }
        debug!(addr, "dialing cache server");
        C::connect(addr, timeout).await
    }

    /// Return a connection after an operation. A clean or resumable outcome
    /// puts it back on the free stack up to the idle cap; anything else
    /// closes it.
    pub fn release(&self, conn: C, err: Option<&Error>) {
        let resumable = err.map_or(true, Error::is_resumable);
        if resumable {
            let mut inner = self.inner.lock();
            let max_idle = inner.max_idle;
            let stack = inner.free.entry(conn.addr().to_string()).or_default();
            if stack.len() < max_idle {
                stack.push(conn);
                return;
            }
            debug!(addr = conn.addr(), "idle cap reached, closing connection");
        } else if let Some(err) = err {
            warn!(addr = conn.addr(), %err, "closing cache connection");
        }
        drop(conn);
    }

    /// Number of idle connections currently pooled for `addr`.
    pub fn idle(&self, addr: &str) -> usize {
        self.inner.lock().free.get(addr).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_test::block_on;

    use super::*;

    static DIALS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug)]
    struct TestConn {
        addr: String,
        id: usize,
        timeout: Duration,
    }

    #[async_trait]
    impl Connection for TestConn {
        async fn connect(addr: &str, timeout: Duration) -> Result<Self, Error> {
            Ok(TestConn {
                addr: addr.to_string(),
                id: DIALS.fetch_add(1, Ordering::SeqCst),
                timeout,
            })
        }

        fn addr(&self) -> &str {
            &self.addr
        }

        fn set_timeout(&mut self, timeout: Duration) {
            self.timeout = timeout;
        }

        async fn read_line(&mut self) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }

        async fn read_exact(&mut self, _buf: &mut [u8]) -> Result<(), Error> {
            Ok(())
        }

        async fn write_all(&mut self, _data: &[u8]) -> Result<(), Error> {
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn test_rejects_zero_config() {
        assert!(matches!(
            ConnectionPool::<TestConn>::new(Duration::ZERO, 4),
            Err(Error::SetTimeout)
        ));
        assert!(matches!(
            ConnectionPool::<TestConn>::new(DEFAULT_TIMEOUT, 0),
            Err(Error::SetMaxIdleConnections)
        ));

        let pool = ConnectionPool::<TestConn>::new(DEFAULT_TIMEOUT, 1).unwrap();
        assert!(matches!(pool.set_timeout(Duration::ZERO), Err(Error::SetTimeout)));
        assert!(matches!(
            pool.set_max_idle_connections(0),
            Err(Error::SetMaxIdleConnections)
        ));
    }

    #[test]
    fn test_reuses_released_connection() {
        block_on(async {
            let pool = ConnectionPool::<TestConn>::new(DEFAULT_TIMEOUT, 2).unwrap();
            let conn = pool.get("cache0:11211").await.unwrap();
            let id = conn.id;
            pool.release(conn, None);
            assert_eq!(1, pool.idle("cache0:11211"));

            let conn = pool.get("cache0:11211").await.unwrap();
            assert_eq!(id, conn.id);
            assert_eq!(0, pool.idle("cache0:11211"));
        });
    }

    #[test]
    fn test_deadline_refresh_on_acquisition() {
        block_on(async {
            let pool = ConnectionPool::<TestConn>::new(DEFAULT_TIMEOUT, 2).unwrap();
            let conn = pool.get("cache0:11211").await.unwrap();
            pool.release(conn, None);

            pool.set_timeout(Duration::from_secs(9)).unwrap();
            let conn = pool.get("cache0:11211").await.unwrap();
            assert_eq!(Duration::from_secs(9), conn.timeout);
        });
    }

    #[test]
    fn test_release_policy() {
        block_on(async {
            let pool = ConnectionPool::<TestConn>::new(DEFAULT_TIMEOUT, 1).unwrap();

            // A resumable error keeps the connection.
            let conn = pool.get("cache0:11211").await.unwrap();
            pool.release(conn, Some(&Error::CacheMiss));
            assert_eq!(1, pool.idle("cache0:11211"));

            // Overflowing the idle cap closes instead.
            let extra = TestConn::connect("cache0:11211", DEFAULT_TIMEOUT)
                .await
                .unwrap();
            pool.release(extra, None);
            assert_eq!(1, pool.idle("cache0:11211"));

            // A transport error closes the connection.
            let conn = pool.get("cache0:11211").await.unwrap();
            pool.release(conn, Some(&Error::Server("gone".into())));
            assert_eq!(0, pool.idle("cache0:11211"));
        });
    }
}
