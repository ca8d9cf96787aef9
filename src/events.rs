// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use dashmap::DashMap;
use tracing::warn;

use crate::cfg::{
    config::EventConfig,
    enums::{ErrorStrategy, QueueFullPolicy},
};

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Normal,
    Error,
    Timeout,
    PoolEviction,
    Shutdown,
    ForkDetected,
}

/// Typed lifecycle events published by connections, pools and the
/// reliability middleware.
#[derive(Debug, Clone)]
pub enum Event {
    Connecting {
        addr: String,
    },
    Connected {
        addr: String,
        first_time: bool,
    },
    HandshakeFailed {
        addr: String,
        error: String,
    },
    HealthCheck {
        ok: bool,
        latency: Duration,
    },
    Disconnected {
        addr: String,
        reason: DisconnectReason,
    },
    MarkedForReconnect {
        addr: String,
    },
    PoolCreated {
        size: usize,
    },
    ConnectionCreated {
        addr: String,
    },
    ConnectionAcquired {
        wait: Duration,
        active: usize,
        idle: usize,
    },
    ConnectionReleased,
    PoolExhausted {
        size: usize,
        timeout: Duration,
    },
    PoolReset,
    CircuitStateChanged {
        from: &'static str,
        to: &'static str,
    },
    HealthChanged {
        healthy: bool,
    },
}

/// Registry key; one per event variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connecting,
    Connected,
    HandshakeFailed,
    HealthCheck,
    Disconnected,
    MarkedForReconnect,
    PoolCreated,
    ConnectionCreated,
    ConnectionAcquired,
    ConnectionReleased,
    PoolExhausted,
    PoolReset,
    CircuitStateChanged,
    HealthChanged,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connecting { .. } => EventKind::Connecting,
            Event::Connected { .. } => EventKind::Connected,
            Event::HandshakeFailed { .. } => EventKind::HandshakeFailed,
            Event::HealthCheck { .. } => EventKind::HealthCheck,
            Event::Disconnected { .. } => EventKind::Disconnected,
            Event::MarkedForReconnect { .. } => EventKind::MarkedForReconnect,
            Event::PoolCreated { .. } => EventKind::PoolCreated,
            Event::ConnectionCreated { .. } => EventKind::ConnectionCreated,
            Event::ConnectionAcquired { .. } => EventKind::ConnectionAcquired,
            Event::ConnectionReleased => EventKind::ConnectionReleased,
            Event::PoolExhausted { .. } => EventKind::PoolExhausted,
            Event::PoolReset => EventKind::PoolReset,
            Event::CircuitStateChanged { .. } => EventKind::CircuitStateChanged,
            Event::HealthChanged { .. } => EventKind::HealthChanged,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Proof of registration; pass back to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken {
    kind: EventKind,
    id: u64,
}

#[derive(Default)]
struct Subscribers {
    by_kind: DashMap<EventKind, Vec<(u64, Handler)>>,
    strategy: ErrorStrategy,
}

impl Subscribers {
    /// Invokes every handler for the event; the configured strategy
    /// decides what a handler error does to the publishing path.
    fn dispatch(&self, event: &Event) -> anyhow::Result<()> {
        let Some(handlers) = self.by_kind.get(&event.kind()) else {
            return Ok(());
        };
        for (_, handler) in handlers.iter() {
            if let Err(e) = handler(event) {
                match self.strategy {
                    ErrorStrategy::Ignore => {},
                    ErrorStrategy::Log => {
                        warn!("event handler failed for {:?}: {e}", event.kind());
                    },
                    ErrorStrategy::Raise => return Err(e),
                }
            }
        }
        Ok(())
    }
}

struct QueueState {
    items: VecDeque<Event>,
    shutdown: bool,
}

/// Bounded hand-off queue between publishers and the worker threads.
struct WorkQueue {
    state: Mutex<QueueState>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
    policy: QueueFullPolicy,
}

impl WorkQueue {
    fn new(capacity: usize, policy: QueueFullPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
            policy,
        }
    }

    fn push(&self, event: Event) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.shutdown {
            return;
        }
        if state.items.len() >= self.capacity {
            match self.policy {
                QueueFullPolicy::DropOldest => {
                    state.items.pop_front();
                },
                QueueFullPolicy::DropNew => return,
                QueueFullPolicy::BlockMs(ms) => {
                    let deadline = Duration::from_millis(ms);
                    let (guard, timeout) = match self.writable.wait_timeout_while(
                        state,
                        deadline,
                        |s| s.items.len() >= self.capacity && !s.shutdown,
                    ) {
                        Ok(r) => r,
                        Err(_) => return,
                    };
                    state = guard;
                    if timeout.timed_out() || state.shutdown {
                        return;
                    }
                },
            }
        }
        state.items.push_back(event);
        self.readable.notify_one();
    }

    fn pop(&self) -> Option<Event> {
        let mut state = self.state.lock().ok()?;
        loop {
            if let Some(event) = state.items.pop_front() {
                self.writable.notify_one();
                return Some(event);
            }
            if state.shutdown {
                return None;
            }
            state = self.readable.wait(state).ok()?;
        }
    }

    fn shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.shutdown = true;
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

struct BusInner {
    subscribers: Arc<Subscribers>,
    next_id: AtomicU64,
    queue: Option<Arc<WorkQueue>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Some(queue) = &self.queue {
            queue.shutdown();
        }
        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

/// Registry of lifecycle-event subscribers.
///
/// `publish` dispatches synchronously on the publishing thread unless
/// an executor pool is configured, in which case events are enqueued
/// on a bounded queue drained by dedicated worker threads (the same
/// scheme tracing-appender uses for its non-blocking writer).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventConfig::default())
    }
}

impl EventBus {
    pub fn new(cfg: &EventConfig) -> Self {
        let subscribers = Arc::new(Subscribers {
            by_kind: DashMap::new(),
            strategy: cfg.error_strategy,
        });

        let (queue, workers) = match cfg.executor_pool_size {
            Some(pool_size) if pool_size > 0 => {
                let queue = Arc::new(WorkQueue::new(cfg.queue_size.max(1), cfg.queue_full));
                let workers = (0..pool_size)
                    .map(|_| {
                        let queue = Arc::clone(&queue);
                        let subscribers = Arc::clone(&subscribers);
                        thread::spawn(move || {
                            while let Some(event) = queue.pop() {
                                let _ = subscribers.dispatch(&event);
                            }
                        })
                    })
                    .collect();
                (Some(queue), workers)
            },
            _ => (None, Vec::new()),
        };

        Self {
            inner: Arc::new(BusInner {
                subscribers,
                next_id: AtomicU64::new(1),
                queue,
                workers: Mutex::new(workers),
            }),
        }
    }

    pub fn subscribe(&self, kind: EventKind, handler: Handler) -> SubscriptionToken {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, handler));
        SubscriptionToken { kind, id }
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        if let Some(mut handlers) = self.inner.subscribers.by_kind.get_mut(&token.kind) {
            handlers.retain(|(id, _)| *id != token.id);
        }
    }

    /// Dispatches an event. With the `Raise` error strategy and
    /// synchronous dispatch, a handler failure propagates here.
    pub fn publish(&self, event: Event) -> anyhow::Result<()> {
        match &self.inner.queue {
            Some(queue) => {
                queue.push(event);
                Ok(())
            },
            None => self.inner.subscribers.dispatch(&event),
        }
    }

    /// Fire-and-forget publication for the hot path: handler errors
    /// never reach the primary operation.
    pub fn emit(&self, event: Event) {
        if let Err(e) = self.publish(event) {
            warn!("event subscriber error: {e}");
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("async_dispatch", &self.inner.queue.is_some())
            .finish()
    }
}
