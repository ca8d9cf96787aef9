// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    client::connection::Connection,
    events::{DisconnectReason, Event, EventBus},
    models::error::ClientError,
};

/// The scheduling contract a pool was built for. This implementation
/// provides the cooperative-task flavor: checkouts suspend instead of
/// blocking, and a task may suspend while holding a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    CooperativeTasks,
}

struct PoolInner {
    cfg: Arc<Config>,
    events: EventBus,
    semaphore: Arc<Semaphore>,
    /// Idle connections, most recently used at the back so checkouts
    /// land on warm buffers first.
    idle: Mutex<Vec<Connection>>,
    active: AtomicUsize,
    closed: AtomicBool,
    cancel: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// Fixed-size connection pool with FIFO waiters.
///
/// Checkout prefers a warm idle connection, dials a new one while
/// under capacity, and otherwise queues on the semaphore until the
/// configured wait deadline. Returning a connection that failed closes
/// it without an eager replacement; the next checkout dials fresh.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(cfg: Arc<Config>, events: EventBus) -> Self {
        let size = cfg.pool.size;
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::with_capacity(size)),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            health_task: Mutex::new(None),
            events: events.clone(),
            cfg,
        });

        events.emit(Event::PoolCreated { size });

        if let Some(interval) = inner.cfg.pool.health_interval {
            let handle = spawn_health_loop(Arc::clone(&inner), interval);
            if let Ok(mut slot) = inner.health_task.lock() {
                *slot = Some(handle);
            }
        }

        Self { inner }
    }

    pub fn concurrency(&self) -> Concurrency {
        Concurrency::CooperativeTasks
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Borrows a healthy connection, waiting up to `pool.wait_ms`.
    pub async fn checkout(&self) -> Result<PooledConnection, ClientError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::PoolClosed);
        }

        let started = Instant::now();
        let wait = inner.cfg.pool.wait;
        let permit = match timeout(
            wait,
            Arc::clone(&inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ClientError::PoolClosed),
            Err(_) => {
                inner.events.emit(Event::PoolExhausted {
                    size: inner.cfg.pool.size,
                    timeout: wait,
                });
                return Err(ClientError::PoolExhausted {
                    size: inner.cfg.pool.size,
                    waited: started.elapsed(),
                });
            },
        };

        let conn = loop {
            let candidate = inner.idle.lock().ok().and_then(|mut idle| idle.pop());
            match candidate {
                Some(conn) if conn.is_open() => break conn,
                Some(stale) => {
                    debug!("dropping stale pooled connection to {}", stale.addr());
                },
                None => {
                    let conn = Connection::connect(
                        Arc::clone(&inner.cfg),
                        inner.events.clone(),
                    )
                    .await?;
                    inner.events.emit(Event::ConnectionCreated {
                        addr: conn.addr().to_string(),
                    });
                    break conn;
                },
            }
        };

        inner.active.fetch_add(1, Ordering::Relaxed);
        inner.events.emit(Event::ConnectionAcquired {
            wait: started.elapsed(),
            active: self.active_count(),
            idle: self.idle_count(),
        });

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(inner),
            _permit: permit,
        })
    }

    /// Stops taking checkouts, waits (bounded by the checkout wait)
    /// for outstanding connections to come home, then closes
    /// everything.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.cancel.cancel();
        let health = inner.health_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = health {
            let _ = handle.await;
        }

        // Outstanding checkouts hold permits; wait for them, bounded.
        let size = inner.cfg.pool.size as u32;
        let _ = timeout(inner.cfg.pool.wait, inner.semaphore.acquire_many(size)).await;
        inner.semaphore.close();

        let drained: Vec<Connection> = inner
            .idle
            .lock()
            .map(|mut idle| idle.drain(..).collect())
            .unwrap_or_default();
        for mut conn in drained {
            conn.close(DisconnectReason::Shutdown).await;
        }
        inner.events.emit(Event::PoolReset);
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.inner.cfg.pool.size)
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .finish()
    }
}

/// A checked-out connection. Dropping it returns the connection to
/// the idle set when it is still healthy; a connection that died in
/// the caller's hands is simply dropped (its socket closes with it).
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Takes the connection out of pool management entirely.
    pub fn detach(mut self) -> Connection {
        self.pool.active.fetch_sub(1, Ordering::Relaxed);
        self.conn.take().expect("connection already detached")
    }

    /// Closes the connection instead of returning it.
    pub async fn discard(mut self, reason: DisconnectReason) {
        self.pool.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(mut conn) = self.conn.take() {
            conn.close(reason).await;
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already detached")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already detached")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.pool.active.fetch_sub(1, Ordering::Relaxed);
        if conn.is_open() && !self.pool.closed.load(Ordering::Acquire) {
            if let Ok(mut idle) = self.pool.idle.lock() {
                idle.push(conn);
            }
            self.pool.events.emit(Event::ConnectionReleased);
        }
        // A dead connection is not replaced eagerly; the next
        // checkout dials a fresh one.
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

/// Periodically pings idle connections and evicts the ones that fail.
fn spawn_health_loop(
    inner: Arc<PoolInner>,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = sleep(interval) => {},
            }

            // Pull the whole idle set so the probe never holds the
            // lock across I/O.
            let batch: Vec<Connection> = inner
                .idle
                .lock()
                .map(|mut idle| idle.drain(..).collect())
                .unwrap_or_default();
            if batch.is_empty() {
                continue;
            }

            let mut keep = Vec::with_capacity(batch.len());
            for mut conn in batch {
                match conn.ping().await {
                    Ok(latency) => {
                        debug!("pool health ping {} in {latency:?}", conn.addr());
                        keep.push(conn);
                    },
                    Err(e) => {
                        warn!("evicting unhealthy connection {}: {e}", conn.addr());
                        if conn.is_open() {
                            conn.close(DisconnectReason::PoolEviction).await;
                        }
                    },
                }
            }
            if let Ok(mut idle) = inner.idle.lock() {
                idle.extend(keep);
            }
        }
    })
}
