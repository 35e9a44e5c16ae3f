//! Consistent-hash ring with virtual nodes
//!
//! Maps opaque request keys to worker endpoints. Each endpoint contributes
//! `replicas` virtual nodes so that membership changes relocate roughly
//! 1/N of the key space and leave everything else in place.
//!
//! The hash is MD5 over the raw key bytes, read as a big-endian 128-bit
//! integer. No per-process salt: gateways and operators must agree on the
//! placement of every key, so the function has to be bit-identical across
//! processes.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};

use md5::{Digest, Md5};

use crate::utils::error::{MeshError, Result};

/// Default virtual nodes per endpoint.
pub const DEFAULT_REPLICAS: usize = 150;

/// Consistent-hash ring over worker endpoints.
///
/// Not internally synchronized; callers serialize membership mutations
/// against lookups (the [`Router`](crate::routing::Router) wraps the ring
/// in an `RwLock`).
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Virtual nodes per endpoint.
    replicas: usize,

    /// hash -> endpoint, ordered for clockwise lookups.
    ring: BTreeMap<u128, String>,

    /// Members in insertion order. The router iterates this for failover.
    members: Vec<String>,
}

impl HashRing {
    /// Create a ring with the given endpoints and replication factor.
    pub fn new<I, S>(endpoints: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self {
            replicas: replicas.max(1),
            ring: BTreeMap::new(),
            members: Vec::new(),
        };
        for endpoint in endpoints {
            ring.add_node(&endpoint.into());
        }
        ring
    }

    /// Create a ring with the default replication factor.
    pub fn with_default_replicas<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(endpoints, DEFAULT_REPLICAS)
    }

    fn hash_key(key: &str) -> u128 {
        let digest = Md5::digest(key.as_bytes());
        u128::from_be_bytes(digest.into())
    }

    /// Add an endpoint. Idempotent: re-adding a member is a no-op.
    pub fn add_node(&mut self, endpoint: &str) {
        if self.members.iter().any(|m| m == endpoint) {
            return;
        }
        self.members.push(endpoint.to_string());
        for i in 0..self.replicas {
            let hash = Self::hash_key(&format!("{}#{}", endpoint, i));
            self.ring.insert(hash, endpoint.to_string());
        }
    }

    /// Remove an endpoint. Idempotent: removing a non-member is a no-op.
    pub fn remove_node(&mut self, endpoint: &str) {
        let Some(pos) = self.members.iter().position(|m| m == endpoint) else {
            return;
        };
        self.members.remove(pos);
        for i in 0..self.replicas {
            let hash = Self::hash_key(&format!("{}#{}", endpoint, i));
            // Only evict entries this endpoint owns; a hash collision may
            // have let a later member overwrite one of our positions.
            if self.ring.get(&hash).is_some_and(|owner| owner == endpoint) {
                self.ring.remove(&hash);
            }
        }
    }

    /// Map a key to an endpoint: first virtual node strictly clockwise of
    /// the key's hash, wrapping to the smallest entry.
    pub fn lookup(&self, key: &str) -> Result<&str> {
        let hash = Self::hash_key(key);
        self.ring
            .range((Excluded(hash), Unbounded))
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, endpoint)| endpoint.as_str())
            .ok_or(MeshError::EmptyRing)
    }

    /// Members in insertion order.
    pub fn nodes(&self) -> &[String] {
        &self.members
    }

    /// Number of member endpoints.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of virtual nodes currently on the ring.
    pub fn virtual_len(&self) -> usize {
        self.ring.len()
    }

    /// Per-endpoint key counts for a set of probe keys.
    pub fn distribution<'a, I>(&self, keys: I) -> HashMap<String, usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: HashMap<String, usize> = self
            .members
            .iter()
            .map(|m| (m.clone(), 0))
            .collect();
        for key in keys {
            if let Ok(endpoint) = self.lookup(key) {
                *counts.entry(endpoint.to_string()).or_default() += 1;
            }
        }
        counts
    }

    /// Load-balance variance: coefficient of variation (std/mean) as a
    /// percentage, over `num_keys` synthetic probe keys.
    pub fn load_variance(&self, num_keys: usize) -> f64 {
        if self.members.is_empty() || num_keys == 0 {
            return 0.0;
        }
        let keys: Vec<String> = (0..num_keys).map(|i| format!("key_{}", i)).collect();
        let counts = self.distribution(keys.iter().map(String::as_str));

        let values: Vec<f64> = counts.values().map(|&c| c as f64).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        if mean <= 0.0 {
            return 0.0;
        }
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        variance.sqrt() / mean * 100.0
    }
}
