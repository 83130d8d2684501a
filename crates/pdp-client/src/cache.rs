//! Response cache
//!
//! Maps request fingerprints to the encoded responses the server returned for
//! them. Entries expire a fixed time after they were stored; expired entries
//! are removed lazily, when looked up or when their shard needs room.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 16;

/// Digest identifying a request payload.
///
/// Computed over the canonical encoded request, which never contains the
/// correlation id, so the same request always maps to the same key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(payload: &[u8]) -> Self {
        Fingerprint(*blake3::hash(payload).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn shard(&self) -> usize {
        self.0[0] as usize % SHARD_COUNT
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    bytes: Vec<u8>,
    created: Instant,
}

/// A cached response as returned by [`ResponseCache::entries`].
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub fingerprint: Fingerprint,
    pub bytes: Vec<u8>,
    pub age: Duration,
    pub expired: bool,
}

/// Sharded, bounded TTL cache of encoded responses.
pub struct ResponseCache {
    ttl: Duration,
    shard_capacity: usize,
    shards: Vec<Mutex<HashMap<Fingerprint, CacheEntry>>>,
}

impl ResponseCache {
    /// Creates a cache holding roughly `max_entries` responses for `ttl`.
    ///
    /// The bound is split evenly across shards, so the effective capacity is
    /// rounded up to a multiple of the shard count.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let shard_capacity = max_entries.div_ceil(SHARD_COUNT).max(1);
        Self {
            ttl,
            shard_capacity,
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self, shard: usize) -> MutexGuard<'_, HashMap<Fingerprint, CacheEntry>> {
        // A panic while holding the lock cannot leave a map half-updated.
        self.shards[shard].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the stored response if it has not expired yet.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        let mut shard = self.lock(fingerprint.shard());
        match shard.get(fingerprint) {
            Some(entry) if entry.created.elapsed() < self.ttl => Some(entry.bytes.clone()),
            Some(_) => {
                shard.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    /// Stores a response, replacing any previous entry for the fingerprint.
    pub fn store(&self, fingerprint: Fingerprint, bytes: Vec<u8>) {
        let mut shard = self.lock(fingerprint.shard());

        if shard.len() >= self.shard_capacity && !shard.contains_key(&fingerprint) {
            let ttl = self.ttl;
            shard.retain(|_, entry| entry.created.elapsed() < ttl);

            if shard.len() >= self.shard_capacity {
                let oldest = shard
                    .iter()
                    .min_by_key(|(_, entry)| entry.created)
                    .map(|(key, _)| *key);
                if let Some(oldest) = oldest {
                    shard.remove(&oldest);
                    tracing::trace!(fingerprint = %oldest, "evicted oldest cached response");
                }
            }
        }

        shard.insert(
            fingerprint,
            CacheEntry {
                bytes,
                created: Instant::now(),
            },
        );
    }

    /// Number of held entries, including expired ones not yet removed.
    pub fn len(&self) -> usize {
        (0..SHARD_COUNT).map(|i| self.lock(i).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every held entry.
    pub fn entries(&self) -> Vec<CachedResponse> {
        let mut out = Vec::new();
        for i in 0..SHARD_COUNT {
            let shard = self.lock(i);
            out.extend(shard.iter().map(|(fingerprint, entry)| {
                let age = entry.created.elapsed();
                CachedResponse {
                    fingerprint: *fingerprint,
                    bytes: entry.bytes.clone(),
                    age,
                    expired: age >= self.ttl,
                }
            }));
        }
        out
    }

    pub fn clear(&self) {
        for i in 0..SHARD_COUNT {
            self.lock(i).clear();
        }
    }
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.ttl)
            .field("shard_capacity", &self.shard_capacity)
            .field("len", &self.len())
            .finish()
    }
}
