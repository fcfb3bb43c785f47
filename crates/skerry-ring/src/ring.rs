use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

const DEFAULT_REPLICAS: usize = 100;

/// A consistent hashing ring with virtual nodes.
///
/// Each virtual node is the CRC-32 of `"{node}#{i}"`; keys route to the node
/// owning the first ring point at or after the key's hash, wrapping around at
/// the top. Hash collisions across virtual points are tolerated: the map is
/// last-write-wins and lookups stay consistent.
pub struct Ring {
    inner: RwLock<RingInner>,
    replicas: usize,
}

struct RingInner {
    /// Sorted hashes of all virtual nodes.
    points: Vec<u32>,
    /// Virtual point hash → physical node address.
    owners: HashMap<u32, String>,
    nodes: HashSet<String>,
}

fn hash_key(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

impl Ring {
    /// `replicas` is the number of virtual points per physical node;
    /// non-positive falls back to the default of 100.
    pub fn new(replicas: usize) -> Self {
        let replicas = if replicas == 0 { DEFAULT_REPLICAS } else { replicas };
        Ring {
            inner: RwLock::new(RingInner {
                points: Vec::new(),
                owners: HashMap::new(),
                nodes: HashSet::new(),
            }),
            replicas,
        }
    }

    /// Insert a physical node. Idempotent on duplicates.
    pub fn add_node(&self, node: &str) {
        let mut inner = self.inner.write().expect("ring lock poisoned");
        if inner.nodes.contains(node) {
            return;
        }
        for i in 0..self.replicas {
            let h = hash_key(&format!("{node}#{i}"));
            inner.points.push(h);
            inner.owners.insert(h, node.to_string());
        }
        inner.nodes.insert(node.to_string());
        inner.points.sort_unstable();
    }

    /// Remove a physical node and all of its virtual points.
    pub fn remove_node(&self, node: &str) {
        let mut inner = self.inner.write().expect("ring lock poisoned");
        if !inner.nodes.contains(node) {
            return;
        }
        let mut removed = HashSet::new();
        for i in 0..self.replicas {
            let h = hash_key(&format!("{node}#{i}"));
            removed.insert(h);
            inner.owners.remove(&h);
        }
        inner.points.retain(|p| !removed.contains(p));
        inner.nodes.remove(node);
    }

    /// The node responsible for `key`, or `None` when the ring is empty.
    pub fn get_node(&self, key: &str) -> Option<String> {
        let inner = self.inner.read().expect("ring lock poisoned");
        if inner.points.is_empty() {
            return None;
        }
        let h = hash_key(key);
        let idx = match inner.points.binary_search(&h) {
            Ok(i) => i,
            Err(i) if i == inner.points.len() => 0, // wrap around
            Err(i) => i,
        };
        inner.owners.get(&inner.points[idx]).cloned()
    }

    /// All physical nodes, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let inner = self.inner.read().expect("ring lock poisoned");
        let mut out: Vec<String> = inner.nodes.iter().cloned().collect();
        out.sort();
        out
    }
}
