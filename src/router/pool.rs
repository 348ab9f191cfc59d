//! Per-node connection pool
//!
//! One pool per (address, role). A semaphore bounds the connections checked
//! out at once; a connection is only created when no idle one is available,
//! so live connections never exceed `max_connections`.

use super::Role;
use crate::address::NodeAddress;
use crate::client::RespConnection;
use crate::config::SentinelConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Liveness of a pooled connection
///
/// `Connecting -> Ready` on handshake, `Ready -> Broken` on I/O failure or
/// close. `Broken` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Connecting,
    Ready,
    Broken,
}

/// A store connection owned by a pool
pub struct PooledConnection {
    id: u64,
    conn: RespConnection,
    state: ConnState,
}

impl PooledConnection {
    /// Connect and run the AUTH/SELECT/PING handshake
    async fn open(id: u64, address: &NodeAddress, config: &SentinelConfig) -> Result<Self> {
        let conn = RespConnection::connect(
            address,
            config.socket_connect_timeout(),
            config.socket_timeout(),
        )
        .await?;

        let mut pooled = PooledConnection {
            id,
            conn,
            state: ConnState::Connecting,
        };

        let handshake = pooled.conn.handshake(config.password.as_deref(), config.db);
        match timeout(config.socket_connect_timeout(), handshake).await {
            Ok(Ok(())) => {
                pooled.state = ConnState::Ready;
                debug!("Connection #{} to {} ready", id, address);
                Ok(pooled)
            }
            // A node that refuses the handshake is as unusable as an unreachable one
            Ok(Err(e)) => Err(Error::broken(address, format!("handshake failed: {}", e))),
            Err(_) => Err(Error::broken(address, "handshake timed out")),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub(super) fn mark_broken(&mut self) {
        self.state = ConnState::Broken;
    }

    pub(super) fn connection(&mut self) -> &mut RespConnection {
        &mut self.conn
    }
}

/// A checked-out connection and the slot it occupies
pub(super) struct Lease {
    pub conn: PooledConnection,
    pub permit: OwnedSemaphorePermit,
}

/// Liveness counts of one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub address: NodeAddress,
    pub role: Role,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
    pub broken_total: u64,
    pub failed_connects: u64,
}

/// Connections to one node in one role
pub struct NodePool {
    address: NodeAddress,
    role: Role,
    config: Arc<SentinelConfig>,

    /// One permit per checked-out (or connecting) connection
    slots: Arc<Semaphore>,

    /// Ready connections waiting for reuse
    idle: Mutex<VecDeque<PooledConnection>>,

    live: AtomicUsize,
    in_use: AtomicUsize,
    broken: AtomicU64,
    failed_connects: AtomicU64,
    next_id: AtomicU64,
    last_used: Mutex<Option<Instant>>,

    /// Set once the topology stops listing this node for this role
    closed: AtomicBool,
}

impl NodePool {
    /// Create an empty pool
    pub fn new(address: NodeAddress, role: Role, config: Arc<SentinelConfig>) -> Arc<Self> {
        let max = config.max_connections;
        Arc::new(NodePool {
            address,
            role,
            config,
            slots: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(VecDeque::with_capacity(max)),
            live: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            broken: AtomicU64::new(0),
            failed_connects: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            last_used: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// When a connection was last checked out, `None` if never
    pub fn last_used(&self) -> Option<Instant> {
        *self.last_used.lock()
    }

    /// Check out a ready connection
    ///
    /// Waits up to `socket_timeout` for a free slot, then fails with
    /// `PoolExhausted`. New connections are opened in a separate task: if the
    /// caller gives up while it runs, the finished connection is parked in
    /// the idle queue instead of leaking.
    pub(super) async fn acquire(self: &Arc<Self>) -> Result<Lease> {
        let wait = self.config.socket_timeout();

        let permit = match timeout(wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(
                    "Pool {} ({}) exhausted: {} connections in use",
                    self.address,
                    self.role,
                    self.in_use.load(Ordering::Relaxed)
                );
                return Err(Error::PoolExhausted {
                    address: self.address.clone(),
                });
            }
        };

        *self.last_used.lock() = Some(Instant::now());

        let reused = self.idle.lock().pop_back();
        if let Some(conn) = reused {
            self.in_use.fetch_add(1, Ordering::AcqRel);
            return Ok(Lease { conn, permit });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let pool = Arc::clone(self);

        tokio::spawn(async move {
            match PooledConnection::open(id, &pool.address, &pool.config).await {
                Ok(conn) => {
                    pool.live.fetch_add(1, Ordering::AcqRel);
                    if let Err(Ok((conn, _permit))) = tx.send(Ok((conn, permit))) {
                        debug!("Connection #{} to {} opened for an abandoned request", id, pool.address);
                        pool.park(conn);
                    }
                }
                Err(e) => {
                    pool.failed_connects.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                    let _ = tx.send(Err(e));
                }
            }
        });

        match rx.await {
            Ok(Ok((conn, permit))) => {
                self.in_use.fetch_add(1, Ordering::AcqRel);
                Ok(Lease { conn, permit })
            }
            Ok(Err(e)) => {
                warn!("Cannot open connection to {} ({}): {}", self.address, self.role, e);
                Err(e)
            }
            Err(_) => Err(Error::broken(&self.address, "connect task aborted")),
        }
    }

    /// Take back a checked-out connection
    pub(super) fn release(&self, conn: PooledConnection) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.park(conn);
    }

    /// Keep a ready connection for reuse, evict anything else
    ///
    /// The caller still holds the connection's slot, so the idle queue
    /// stays below `max_connections`.
    fn park(&self, conn: PooledConnection) {
        if conn.state() == ConnState::Ready && !self.closed.load(Ordering::Acquire) {
            self.idle.lock().push_back(conn);
        } else {
            self.evict(conn);
        }
    }

    fn evict(&self, conn: PooledConnection) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        if conn.state() == ConnState::Broken {
            self.broken.fetch_add(1, Ordering::Relaxed);
            info!("Evicted broken connection #{} to {} ({})", conn.id(), self.address, self.role);
        } else {
            debug!("Closed connection #{} to {} ({})", conn.id(), self.address, self.role);
        }
    }

    /// Close every idle connection
    ///
    /// Used when a connection to this node breaks: its idle siblings were
    /// opened against the same peer and cannot be trusted either.
    pub fn drain_idle(&self) {
        let drained: Vec<PooledConnection> = self.idle.lock().drain(..).collect();
        if !drained.is_empty() {
            debug!("Draining {} idle connections to {} ({})", drained.len(), self.address, self.role);
        }
        for conn in drained {
            self.evict(conn);
        }
    }

    /// Stop pooling: drop idle connections now, in-use ones on release
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.drain_idle();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the liveness counters
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            address: self.address.clone(),
            role: self.role,
            live: self.live.load(Ordering::Acquire),
            idle: self.idle.lock().len(),
            in_use: self.in_use.load(Ordering::Acquire),
            max: self.config.max_connections,
            broken_total: self.broken.load(Ordering::Relaxed),
            failed_connects: self.failed_connects.load(Ordering::Relaxed),
        }
    }
}
