//! A consistent-hash ring over server addresses. Each address owns a fixed
//! number of virtual positions so that adding or removing one node only
//! reshuffles the fraction of keys that fell on its arcs.

use std::collections::HashMap;

use crate::error::Error;
use crate::key::CacheKeyRef;

/// Virtual positions per address.
const VIRTUAL_NODES: usize = 30;

/// An immutable ring. [`HashRing::add`] and [`HashRing::remove`] build a
/// fresh ring instead of mutating in place, so a selector can swap rings
/// atomically under its write lock.
#[derive(Debug, Clone)]
pub struct HashRing {
    addrs: Vec<String>,
    ring_keys: Vec<u32>,
    nodes: HashMap<u32, String>,
}

impl HashRing {
    pub fn new(addrs: &[String]) -> Self {
        let mut ring_keys = Vec::with_capacity(addrs.len() * VIRTUAL_NODES);
        let mut nodes = HashMap::with_capacity(addrs.len() * VIRTUAL_NODES);
        for addr in addrs {
            for i in 0..VIRTUAL_NODES {
                let position = crc32fast::hash(format!("{}-{}", addr, i).as_bytes());
                ring_keys.push(position);
                nodes.insert(position, addr.clone());
            }
        }
        ring_keys.sort_unstable();
        ring_keys.dedup();
        HashRing {
            addrs: addrs.to_vec(),
            ring_keys,
            nodes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// The address owning the key. An explicit `addr()` on the key wins
    /// over ring placement; `None` only when the ring has no nodes.
    pub fn get(&self, key: &CacheKeyRef) -> Option<String> {
        if let Some(addr) = key.addr() {
            return Some(addr.to_string());
        }
        if self.ring_keys.is_empty() {
            return None;
        }
        // First ring position strictly greater than the key hash, wrapping
        // back to the smallest position.
        let idx = self.ring_keys.partition_point(|pos| *pos <= key.hash());
        let position = if idx == self.ring_keys.len() {
            self.ring_keys[0]
        } else {
            self.ring_keys[idx]
        };
        self.nodes.get(&position).cloned()
    }

    pub fn add(&self, addr: &str) -> HashRing {
        let mut addrs = self.addrs.clone();
        addrs.push(addr.to_string());
        HashRing::new(&addrs)
    }

    pub fn remove(&self, addr: &str) -> Result<HashRing, Error> {
        let mut addrs = self.addrs.clone();
        match addrs.iter().position(|a| a == addr) {
            Some(idx) => {
                addrs.remove(idx);
                Ok(HashRing::new(&addrs))
            }
            None => Err(Error::NodeNotInRing(addr.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CacheKeyRef;

    fn node_addrs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("cache{}:11211", i)).collect()
    }

    fn keys(n: usize) -> Vec<CacheKeyRef> {
        (0..n)
            .map(|i| CacheKeyRef::from_key(format!("user/{}", i).as_str()).unwrap())
            .collect()
    }

    #[test]
    fn test_addr_override_wins() {
        use crate::key::StringCacheKey;

        let ring = HashRing::new(&node_addrs(3));
        let pinned = StringCacheKey::new("k").with_addr("elsewhere:11211");
        let key = CacheKeyRef::from_key(&pinned).unwrap();
        assert_eq!(Some("elsewhere:11211".to_string()), ring.get(&key));

        // Even an empty ring honours the pin.
        let empty = HashRing::new(&[]);
        assert_eq!(Some("elsewhere:11211".to_string()), empty.get(&key));
        let plain = CacheKeyRef::from_key(&StringCacheKey::new("k")).unwrap();
        assert_eq!(None, empty.get(&plain));
    }

    #[test]
    fn test_placement_is_stable() {
        let ring = HashRing::new(&node_addrs(5));
        for key in keys(100) {
            assert_eq!(ring.get(&key), ring.get(&key));
        }
    }

    #[test]
    fn test_balance() {
        let addrs = node_addrs(5);
        let ring = HashRing::new(&addrs);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for key in keys(1000) {
            *counts.entry(ring.get(&key).unwrap()).or_default() += 1;
        }
        for addr in &addrs {
            let share = *counts.get(addr).unwrap_or(&0);
            assert!(
                (100..=350).contains(&share),
                "{} owns {} of 1000 keys",
                addr,
                share
            );
        }
    }

    #[test]
    fn test_add_remove_stability() {
        let keys = keys(1000);
        let five = HashRing::new(&node_addrs(5));
        let six = five.add("cache5:11211");

        let moved_on_add = keys
            .iter()
            .filter(|k| five.get(k) != six.get(k))
            .count();
        // 1000 / (5 + 1) * 1.2
        assert!(moved_on_add <= 200, "{} keys moved on add", moved_on_add);

        let without_fifth = six.remove("cache4:11211").unwrap();
        let moved_on_remove = keys
            .iter()
            .filter(|k| six.get(k) != without_fifth.get(k))
            .count();
        assert!(
            moved_on_remove <= 250,
            "{} keys moved on remove",
            moved_on_remove
        );
    }

    #[test]
    fn test_remove_unknown_node() {
        let ring = HashRing::new(&node_addrs(2));
        assert!(matches!(
            ring.remove("missing:11211"),
            Err(Error::NodeNotInRing(_))
        ));
    }
}
