// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::{Config, ServerAddr},
    client::{connection::Connection, pool::Pool},
    events::{DisconnectReason, EventBus},
    models::{
        command::Command,
        error::{ClientError, ErrorKind, ServerError},
        value::Value,
    },
    topology::slot::hash_slot,
};

/// A server-initiated redirect extracted from an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Slot ownership changed; update the map and retry there.
    Moved { slot: u16, addr: ServerAddr },
    /// One-shot redirect during migration; prefix with `ASKING`, do
    /// not touch the map.
    Ask { slot: u16, addr: ServerAddr },
}

impl Redirect {
    pub fn from_error(e: &ServerError) -> Option<Redirect> {
        match e.kind() {
            ErrorKind::Moved { slot, addr } => {
                Some(Redirect::Moved {
                    slot,
                    addr: addr.parse().ok()?,
                })
            },
            ErrorKind::Ask { slot, addr } => Some(Redirect::Ask {
                slot,
                addr: addr.parse().ok()?,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct SlotRange {
    start: u16,
    end: u16,
    master: ServerAddr,
}

/// The slot-to-node map, built lazily from the cluster topology query
/// and patched in place on MOVED redirects.
#[derive(Debug, Default)]
pub struct SlotMap {
    ranges: RwLock<Vec<SlotRange>>,
    /// Point updates from MOVED, consulted before the ranges; a full
    /// reload clears them.
    overrides: DashMap<u16, ServerAddr>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl SlotMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.ranges.read().map(|r| !r.is_empty()).unwrap_or(false)
    }

    pub fn node_for(&self, slot: u16) -> Option<ServerAddr> {
        if let Some(over) = self.overrides.get(&slot) {
            return Some(over.clone());
        }
        let ranges = self.ranges.read().ok()?;
        ranges
            .iter()
            .find(|r| r.start <= slot && slot <= r.end)
            .map(|r| r.master.clone())
    }

    pub fn apply_moved(&self, slot: u16, addr: ServerAddr) {
        info!("slot {slot} moved to {addr}");
        self.overrides.insert(slot, addr);
    }

    /// Replaces the map from a `CLUSTER SLOTS` reply: an array of
    /// `[start, end, [master-host, master-port, ...], replicas...]`.
    pub fn load(&self, reply: &Value) -> Result<(), ClientError> {
        let Value::Array(entries) = reply else {
            return Err(ClientError::UnexpectedReply(format!(
                "CLUSTER SLOTS answered {reply}"
            )));
        };
        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            let Value::Array(fields) = entry else {
                continue;
            };
            let (Some(start), Some(end)) = (
                fields.first().and_then(Value::as_int),
                fields.get(1).and_then(Value::as_int),
            ) else {
                continue;
            };
            let Some(master) = fields.get(2).and_then(node_addr) else {
                continue;
            };
            ranges.push(SlotRange {
                start: start as u16,
                end: end as u16,
                master,
            });
        }
        if ranges.is_empty() {
            return Err(ClientError::UnexpectedReply(
                "CLUSTER SLOTS returned no ranges".into(),
            ));
        }
        debug!("slot map loaded: {} ranges", ranges.len());
        if let Ok(mut slot_ranges) = self.ranges.write() {
            *slot_ranges = ranges;
        }
        self.overrides.clear();
        Ok(())
    }

    /// Queries the topology over `conn` and reloads. Concurrent
    /// refreshes coalesce: whoever loses the gate returns `false`
    /// immediately and reads the winner's map shortly after.
    pub async fn refresh(&self, conn: &mut Connection) -> Result<bool, ClientError> {
        let Ok(_guard) = self.refresh_gate.try_lock() else {
            return Ok(false);
        };
        let reply = conn.call(&Command::cluster_slots()).await?;
        self.load(&reply)?;
        Ok(true)
    }
}

/// `[host, port, id?]` node descriptor inside CLUSTER SLOTS.
fn node_addr(v: &Value) -> Option<ServerAddr> {
    let Value::Array(parts) = v else {
        return None;
    };
    let host = parts.first().and_then(Value::as_text)?;
    let port = parts.get(1).and_then(Value::as_int)?;
    Some(ServerAddr::tcp(host, u16::try_from(port).ok()?))
}

const MAX_REDIRECTS: usize = 5;

/// Slot-aware command routing across a cluster: one pool per node,
/// MOVED/ASK handling, and lazy or periodic map refresh.
pub struct ClusterRouter {
    cfg: Arc<Config>,
    events: EventBus,
    slots: SlotMap,
    pools: DashMap<ServerAddr, Pool>,
    cancel: CancellationToken,
}

impl ClusterRouter {
    pub fn new(cfg: Arc<Config>, events: EventBus) -> Self {
        Self {
            cfg,
            events,
            slots: SlotMap::new(),
            pools: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn slots(&self) -> &SlotMap {
        &self.slots
    }

    fn pool_for(&self, addr: &ServerAddr) -> Pool {
        self.pools
            .entry(addr.clone())
            .or_insert_with(|| {
                let mut node_cfg = (*self.cfg).clone();
                node_cfg.address = vec![addr.clone()];
                Pool::new(Arc::new(node_cfg), self.events.clone())
            })
            .clone()
    }

    /// First load of the slot map, through any configured seed node.
    async fn bootstrap(&self) -> Result<(), ClientError> {
        if self.slots.is_loaded() {
            return Ok(());
        }
        let mut last = None;
        for seed in self.cfg.address.clone() {
            let pool = self.pool_for(&seed);
            match pool.checkout().await {
                Ok(mut conn) => match self.slots.refresh(&mut conn).await {
                    Ok(_) => return Ok(()),
                    Err(e) => last = Some(e),
                },
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            ClientError::Config("cluster has no seed addresses".into())
        }))
    }

    /// Routes one keyed command, following redirects. A MOVED patches
    /// the map before the retry; an ASK is a one-shot detour behind
    /// `ASKING`.
    pub async fn execute(
        &self,
        key: &[u8],
        cmd: &Command,
    ) -> Result<Value, ClientError> {
        self.bootstrap().await?;
        let slot = hash_slot(key);
        let mut target = match self.slots.node_for(slot) {
            Some(addr) => addr,
            None => self
                .cfg
                .address
                .first()
                .cloned()
                .ok_or_else(|| ClientError::Config("empty address list".into()))?,
        };
        let mut asking = false;

        for _ in 0..MAX_REDIRECTS {
            let pool = self.pool_for(&target);
            let mut conn = pool.checkout().await?;
            if asking {
                conn.call(&Command::asking()).await?;
            }
            match conn.call(cmd).await {
                Ok(v) => return Ok(v),
                Err(ClientError::Server(e)) => match Redirect::from_error(&e) {
                    Some(Redirect::Moved { slot, addr }) => {
                        self.slots.apply_moved(slot, addr.clone());
                        target = addr;
                        asking = false;
                    },
                    Some(Redirect::Ask { addr, .. }) => {
                        target = addr;
                        asking = true;
                    },
                    None => return Err(ClientError::Server(e)),
                },
                Err(e) => return Err(e),
            }
        }
        Err(ClientError::UnexpectedReply(format!(
            "slot {slot} still redirecting after {MAX_REDIRECTS} hops"
        )))
    }

    /// Full map reload through the current topology.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let seed = self
            .slots
            .node_for(0)
            .or_else(|| self.cfg.address.first().cloned())
            .ok_or_else(|| ClientError::Config("empty address list".into()))?;
        let pool = self.pool_for(&seed);
        let mut conn = pool.checkout().await?;
        self.slots.refresh(&mut conn).await?;
        Ok(())
    }
}

/// Starts the optional periodic refresh configured by
/// `cluster.refresh_ms`.
pub fn spawn_refresh(router: Arc<ClusterRouter>) -> Option<JoinHandle<()>> {
    let interval = router.cfg.cluster.refresh?;
    let cancel = router.cancel.clone();
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(interval) => {},
            }
            if let Err(e) = router.refresh().await {
                warn!("periodic slot-map refresh failed: {e}");
            }
        }
    }))
}

impl ClusterRouter {
    /// Stops background refresh and drains every node pool.
    pub async fn close(&self) {
        self.cancel.cancel();
        let pools: Vec<Pool> = self.pools.iter().map(|p| p.value().clone()).collect();
        for pool in pools {
            pool.close().await;
        }
        self.pools.clear();
    }
}

impl std::fmt::Debug for ClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter")
            .field("nodes", &self.pools.len())
            .field("loaded", &self.slots.is_loaded())
            .finish()
    }
}

/// `READONLY` from a data node means the client is talking to a
/// demoted replica; callers discard the connection and rediscover.
pub fn is_demoted_replica(e: &ClientError) -> bool {
    matches!(e.server_kind(), Some(ErrorKind::ReadOnly))
}

/// Closes a connection that answered `READONLY`.
pub async fn discard_demoted(mut conn: Connection) {
    conn.close(DisconnectReason::Error).await;
}
