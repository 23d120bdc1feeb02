//! Routes keys to server addresses. A selector owns one [`HashRing`] behind
//! a read/write lock: lookups share the read side, fleet reshapes swap in a
//! freshly built ring under the write side.

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Error;
use crate::key::CacheKeyRef;
use crate::ring::HashRing;

#[derive(Debug)]
pub struct Selector {
    ring: RwLock<HashRing>,
}

impl Selector {
    pub fn new(addrs: &[String]) -> Self {
        Selector {
            ring: RwLock::new(HashRing::new(addrs)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }

    /// The address the key routes to.
    pub fn pick_server(&self, key: &CacheKeyRef) -> Result<String, Error> {
        self.ring
            .read()
            .get(key)
            .ok_or(Error::CannotAssignCacheServer)
    }

    /// Visit every node, stopping at the first callback error.
    pub fn each(&self, f: &mut dyn FnMut(&str) -> Result<(), Error>) -> Result<(), Error> {
        let ring = self.ring.read();
        for addr in ring.addrs() {
            f(addr)?;
        }
        Ok(())
    }

    /// Snapshot of the current node list.
    pub fn addrs(&self) -> Vec<String> {
        self.ring.read().addrs().to_vec()
    }

    pub fn add(&self, addr: &str) {
        let mut ring = self.ring.write();
        *ring = ring.add(addr);
        debug!(addr, nodes = ring.addrs().len(), "added cache server");
    }

    pub fn remove(&self, addr: &str) -> Result<(), Error> {
        let mut ring = self.ring.write();
        *ring = ring.remove(addr)?;
        debug!(addr, nodes = ring.addrs().len(), "removed cache server");
        Ok(())
    }
}
