// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    num::NonZeroUsize,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    cfg::{config::TrackingConfig, enums::ProtocolVersion},
    client::connection::Connection,
    models::{command::Command, error::ClientError, value::Value},
};

const INVALIDATE: &[u8] = b"invalidate";

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    inserted_at: Instant,
    hits: u64,
}

/// Local key/value cache driven by server push invalidation.
///
/// LRU-bounded with an optional TTL as a safety net. The map belongs
/// to exactly one connection's invalidation stream: the server tracks
/// reads per client, so sharing a cache across connections would let
/// another connection serve keys the server never promised to
/// invalidate for it.
pub struct TrackingCache {
    entries: Mutex<LruCache<Bytes, CacheEntry>>,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl std::fmt::Debug for TrackingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingCache")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

impl TrackingCache {
    pub fn new(cfg: &TrackingConfig) -> Self {
        let capacity = NonZeroUsize::new(cfg.max_entries)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: cfg.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<Bytes> {
        let Ok(mut entries) = self.entries.lock() else {
            return None;
        };
        let expired = match entries.get_mut(key) {
            Some(entry) => {
                let fresh = self
                    .ttl
                    .map(|ttl| entry.inserted_at.elapsed() < ttl)
                    .unwrap_or(true);
                if fresh {
                    entry.hits += 1;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                true
            },
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: Bytes, value: Bytes) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key, CacheEntry {
                value,
                inserted_at: Instant::now(),
                hits: 0,
            });
        }
    }

    pub fn invalidate(&self, key: &[u8]) -> bool {
        self.entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.pop(key))
            .is_some()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Applies one push frame. An `invalidate` frame may name many
    /// keys at once; anything else is not ours and is ignored.
    pub fn handle_push(&self, frame: &[Value]) -> usize {
        if frame.first().and_then(Value::as_bytes) != Some(INVALIDATE) {
            return 0;
        }
        let mut evicted = 0;
        match frame.get(1) {
            Some(Value::Array(keys)) => {
                for key in keys {
                    if let Some(key) = key.as_bytes()
                        && self.invalidate(key)
                    {
                        evicted += 1;
                    }
                }
            },
            Some(Value::Bulk(key)) => {
                if self.invalidate(key) {
                    evicted += 1;
                }
            },
            // A null payload flushes the whole tracking table.
            Some(Value::Null) | Some(Value::NullArray) => {
                self.clear();
            },
            _ => {},
        }
        if evicted > 0 {
            self.invalidations
                .fetch_add(evicted as u64, Ordering::Relaxed);
            trace!("invalidation push evicted {evicted} keys");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// A connection paired with its tracking cache.
///
/// Reads come from the cache while the server has not invalidated
/// them; misses fetch from the server and populate the cache. Losing
/// the connection drops the whole cache, because the server-side
/// tracking table died with the session.
#[derive(Debug)]
pub struct CachedClient {
    conn: Connection,
    cache: TrackingCache,
}

impl CachedClient {
    /// The connection must have negotiated protocol 3 with tracking
    /// enabled during its handshake.
    pub fn new(conn: Connection) -> Result<Self, ClientError> {
        let Some(tracking) = conn.cfg.tracking.as_ref() else {
            return Err(ClientError::Config(
                "tracking is not configured for this client".into(),
            ));
        };
        if conn.protocol() != ProtocolVersion::Resp3 {
            return Err(ClientError::Config(
                "tracking requires a protocol 3 connection".into(),
            ));
        }
        let cache = TrackingCache::new(tracking);
        Ok(Self { conn, cache })
    }

    /// Cached read. The socket is drained (without waiting) and every
    /// pending invalidation applied before the cache is consulted, so
    /// an invalidation the server already delivered can never be
    /// outrun by a stale hit.
    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, ClientError> {
        self.sync_invalidations().await?;

        if let Some(value) = self.cache.lookup(key) {
            return Ok(Some(value));
        }

        let reply = match self.conn.call(&Command::get(key)).await {
            Ok(v) => v,
            Err(e) => {
                if !self.conn.is_open() {
                    debug!("connection lost; dropping tracking cache");
                    self.cache.clear();
                }
                return Err(e);
            },
        };
        self.apply_parked_invalidations();

        match reply {
            Value::Bulk(value) => {
                self.cache
                    .insert(Bytes::copy_from_slice(key), value.clone());
                Ok(Some(value))
            },
            Value::NullBulk | Value::Null => Ok(None),
            other => Err(ClientError::UnexpectedReply(format!(
                "GET answered {other}"
            ))),
        }
    }

    /// Writes go straight through; the server invalidates us.
    pub async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), ClientError> {
        self.conn.call(&Command::set(key, value)).await?;
        Ok(())
    }

    /// Pulls every frame already delivered to the socket into the push
    /// queue, then applies the invalidations. Losing the connection
    /// here drops the whole cache: the server-side tracking table died
    /// with the session.
    async fn sync_invalidations(&mut self) -> Result<(), ClientError> {
        if let Err(e) = self.conn.drain_ready_pushes().await {
            debug!("connection lost; dropping tracking cache");
            self.cache.clear();
            return Err(e);
        }
        self.apply_parked_invalidations();
        Ok(())
    }

    /// Applies invalidation frames parked while reading replies.
    fn apply_parked_invalidations(&mut self) {
        for frame in self.conn.take_pending_pushes() {
            self.cache.handle_push(&frame);
        }
    }

    /// Waits for one invalidation push from the wire; a timeout just
    /// means nothing was invalidated.
    pub async fn poll_invalidations(
        &mut self,
        deadline: Duration,
    ) -> Result<usize, ClientError> {
        match self.conn.read_push(deadline).await {
            Ok(frame) => Ok(self.cache.handle_push(&frame)),
            Err(ClientError::Timeout(_)) => Ok(0),
            Err(e) => {
                self.cache.clear();
                Err(e)
            },
        }
    }

    pub fn cache(&self) -> &TrackingCache {
        &self.cache
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Unbinds the cache; the connection survives, the cache does not.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}
