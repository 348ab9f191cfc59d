//! Routed connections
//!
//! What callers get from the router: a pooled connection bound to the node
//! chosen for their role. Dropping it returns the connection to its pool.

use super::pool::{ConnState, Lease, NodePool, PooledConnection};
use super::Role;
use crate::address::NodeAddress;
use crate::error::{Error, Result};
use crate::protocol::RespValue;
use crate::sentinel::TopologyResolver;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::warn;

/// A connection checked out for one role
pub struct RoutedConnection {
    pool: Arc<NodePool>,

    /// `None` once broken or closed
    conn: Option<PooledConnection>,

    /// Pool slot, released after the connection has been handed back
    _permit: OwnedSemaphorePermit,

    resolver: Arc<TopologyResolver>,

    /// Read served by the primary because no replica is known
    fallback: bool,

    /// The topology was already re-resolved for this request
    resolved: bool,

    operations: u64,
}

impl RoutedConnection {
    pub(super) fn new(
        pool: Arc<NodePool>,
        lease: Lease,
        resolver: Arc<TopologyResolver>,
        fallback: bool,
    ) -> Self {
        RoutedConnection {
            pool,
            conn: Some(lease.conn),
            _permit: lease.permit,
            resolver,
            fallback,
            resolved: false,
            operations: 0,
        }
    }

    /// Record that acquiring this connection already cost a resolution
    pub(super) fn mark_resolved(&mut self) {
        self.resolved = true;
    }

    pub(super) fn resolved(&self) -> bool {
        self.resolved
    }

    /// Node this connection talks to
    pub fn address(&self) -> &NodeAddress {
        self.pool.address()
    }

    /// Role of the node (a fallback read reports `Primary`)
    pub fn role(&self) -> Role {
        self.pool.role()
    }

    /// Whether a read was routed to the primary for lack of replicas
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn state(&self) -> ConnState {
        self.conn
            .as_ref()
            .map(PooledConnection::state)
            .unwrap_or(ConnState::Broken)
    }

    /// Run one command
    ///
    /// Error replies become `Error::Upstream`. If the first command on this
    /// connection fails at the I/O level, the connection is evicted and,
    /// unless acquiring it already did, the topology is re-resolved before
    /// the error is returned, so the next request is routed against a fresh
    /// view.
    pub async fn execute(&mut self, command: &RespValue) -> Result<RespValue> {
        let first = self.operations == 0;
        let result = self.execute_once(command).await;

        if let Err(e) = &result {
            if first && e.is_broken() && !self.resolved {
                self.resolved = true;
                warn!("First command on {} failed ({}), re-resolving topology", self.address(), e);
                if let Err(re) = self.resolver.resolve().await {
                    warn!("Re-resolution after failure on {} failed: {}", self.address(), re);
                }
            }
        }

        result
    }

    /// Build and run a command from its words
    pub async fn query<I, S>(&mut self, words: I) -> Result<RespValue>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.execute(&RespValue::command(words)).await
    }

    /// Run one command without any recovery
    pub(super) async fn execute_once(&mut self, command: &RespValue) -> Result<RespValue> {
        self.operations += 1;

        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(Error::broken(self.pool.address(), "connection already broken")),
        };

        let result = conn.connection().request(command).await;

        match result {
            // A demoted primary answers writes with READONLY
            Ok(RespValue::Error(msg)) if self.pool.role() == Role::Primary && msg.starts_with("READONLY") => {
                self.break_connection();
                Err(Error::broken(self.pool.address(), format!("node is no longer primary: {}", msg)))
            }
            Ok(RespValue::Error(msg)) => Err(Error::Upstream(msg)),
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.break_connection();
                Err(e)
            }
        }
    }

    /// Close explicitly; the connection is not reused
    pub fn close(mut self) {
        self.discard();
    }

    /// Evict after a failure, along with the idle connections to the same node
    fn break_connection(&mut self) {
        self.discard();
        self.pool.drain_idle();
    }

    fn discard(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.mark_broken();
            self.pool.release(conn);
        }
    }
}

impl Drop for RoutedConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
