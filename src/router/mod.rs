//! Connection routing
//!
//! Hands out connections by role: writes go to the resolved primary, reads
//! to a replica. The router works from the resolver's current view and asks
//! for a fresh one only when an issued connection fails, at most once per
//! request.

mod pool;
mod routed;

pub use pool::{ConnState, NodePool, PoolStatus, PooledConnection};
pub use routed::RoutedConnection;

use crate::address::NodeAddress;
use crate::config::{ReplicaSelection, SentinelConfig};
use crate::error::{Error, Result};
use crate::protocol::RespValue;
use crate::sentinel::{MonitorPool, TopologyResolver, TopologyView};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Role a connection is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

/// Routes write and read requests to the right node
pub struct ConnectionRouter {
    config: Arc<SentinelConfig>,
    resolver: Arc<TopologyResolver>,
    pools: RwLock<HashMap<(NodeAddress, Role), Arc<NodePool>>>,

    /// Round-robin position over the replica set
    cursor: AtomicUsize,

    /// Epoch of the last view the pools were pruned against
    pruned_epoch: AtomicU64,
}

impl ConnectionRouter {
    /// Build a router (and its resolver) from validated configuration
    pub fn new(config: Arc<SentinelConfig>) -> Result<Self> {
        config.validate()?;
        let monitors = MonitorPool::from_config(&config)?;
        let resolver = Arc::new(TopologyResolver::new(monitors, config.clone()));
        Ok(Self::with_resolver(config, resolver))
    }

    /// Build a router around an existing resolver
    pub fn with_resolver(config: Arc<SentinelConfig>, resolver: Arc<TopologyResolver>) -> Self {
        ConnectionRouter {
            config,
            resolver,
            pools: RwLock::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
            pruned_epoch: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Arc<SentinelConfig> {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<TopologyResolver> {
        &self.resolver
    }

    /// Re-resolve the topology and drop pools the new view no longer lists
    pub async fn refresh(&self) -> Result<Arc<TopologyView>> {
        let view = self.resolver.resolve().await?;
        self.prune(&view);
        Ok(view)
    }

    /// A connection to the current primary
    ///
    /// Refused (`QuorumUnavailable`) when the primary is not confirmed by a
    /// quorum, unless `best_effort_writes` is set.
    pub async fn write_connection(&self) -> Result<RoutedConnection> {
        self.acquire(Role::Primary).await
    }

    /// A connection to one replica, or to the primary when there is none
    ///
    /// The primary fallback is flagged on the returned connection.
    pub async fn read_connection(&self) -> Result<RoutedConnection> {
        self.acquire(Role::Replica).await
    }

    /// Run one command on the primary
    pub async fn write(&self, command: &RespValue) -> Result<RespValue> {
        self.run(Role::Primary, command).await
    }

    /// Run one command on a replica
    pub async fn read(&self, command: &RespValue) -> Result<RespValue> {
        self.run(Role::Replica, command).await
    }

    /// Liveness counts of every pool, sorted by address then role
    pub fn pool_statuses(&self) -> Vec<PoolStatus> {
        let mut statuses: Vec<PoolStatus> = self.pools.read().values().map(|p| p.status()).collect();
        statuses.sort_by(|a, b| (&a.address, a.role).cmp(&(&b.address, b.role)));
        statuses
    }

    /// Run a command, re-resolving once if the connection fails on it
    async fn run(&self, role: Role, command: &RespValue) -> Result<RespValue> {
        let mut conn = self.acquire(role).await?;

        match conn.execute_once(command).await {
            Err(e) if e.is_broken() && !conn.resolved() => {
                warn!("{} {} failed on first command ({}), re-resolving topology", role, conn.address(), e);
                drop(conn);

                let view = self.refresh_for(role).await?;
                let mut conn = self.open(role, &view).await?;
                conn.execute_once(command).await
            }
            result => result,
        }
    }

    /// Check out a connection for `role`
    ///
    /// A connection whose acquisition already re-resolved the topology is
    /// marked so, and never triggers a second resolution for this request.
    async fn acquire(&self, role: Role) -> Result<RoutedConnection> {
        let (view, resolved) = self.view_for(role).await?;

        let mut conn = match self.open(role, &view).await {
            Err(e) if e.is_broken() && !resolved => {
                warn!("Cannot reach {} for {} ({}), re-resolving topology", role, self.config.master_name, e);
                let view = self.refresh_for(role).await?;
                let mut conn = self.open(role, &view).await?;
                conn.mark_resolved();
                conn
            }
            result => result?,
        };

        if resolved {
            conn.mark_resolved();
        }
        Ok(conn)
    }

    /// Current view if usable for `role`, otherwise a fresh one
    async fn view_for(&self, role: Role) -> Result<(Arc<TopologyView>, bool)> {
        match self.resolver.current() {
            Some(view) if role == Role::Replica || self.writes_allowed(&view) => {
                self.prune(&view);
                Ok((view, false))
            }
            _ => Ok((self.refresh_for(role).await?, true)),
        }
    }

    /// Refresh; reads settle for the best-effort view of a quorum-less round
    async fn refresh_for(&self, role: Role) -> Result<Arc<TopologyView>> {
        match self.refresh().await {
            Ok(view) => Ok(view),
            Err(e @ Error::QuorumUnavailable { .. }) if role == Role::Replica || self.config.best_effort_writes => {
                match self.resolver.current() {
                    Some(view) => {
                        warn!("Using best-effort topology for {}: {}", role, e);
                        self.prune(&view);
                        Ok(view)
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn writes_allowed(&self, view: &TopologyView) -> bool {
        view.quorum_satisfied || self.config.best_effort_writes
    }

    /// Check out a connection for `role` against a given view
    async fn open(&self, role: Role, view: &TopologyView) -> Result<RoutedConnection> {
        match role {
            Role::Primary => {
                if !self.writes_allowed(view) {
                    let monitors = self.resolver.monitors();
                    return Err(Error::QuorumUnavailable {
                        responding: view.responding(),
                        configured: monitors.len(),
                        required: monitors.majority(),
                    });
                }
                self.checkout(&view.primary, Role::Primary, false).await
            }
            Role::Replica => self.open_replica(view).await,
        }
    }

    async fn open_replica(&self, view: &TopologyView) -> Result<RoutedConnection> {
        if view.replicas.is_empty() {
            info!("No replicas known for {}, reading from primary {}", self.config.master_name, view.primary);
            return self.checkout(&view.primary, Role::Primary, true).await;
        }

        let mut last_error = None;
        for address in self.replica_order(&view.replicas) {
            match self.checkout(address, Role::Replica, false).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_transient() || e.is_broken() => {
                    debug!("Replica {} unavailable: {}", address, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::broken(&view.primary, "no replica available")))
    }

    /// Replicas in the order they should be tried
    fn replica_order<'a>(&self, replicas: &'a [NodeAddress]) -> Vec<&'a NodeAddress> {
        let n = replicas.len();

        match self.config.replica_selection {
            ReplicaSelection::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
                (0..n).map(|i| &replicas[(start + i) % n]).collect()
            }
            ReplicaSelection::LeastRecentlyUsed => {
                let pools = self.pools.read();
                let mut order: Vec<&NodeAddress> = replicas.iter().collect();
                // Never-used pools (None) sort first
                order.sort_by_key(|address| {
                    pools
                        .get(&((*address).clone(), Role::Replica))
                        .and_then(|p| p.last_used())
                });
                order
            }
        }
    }

    async fn checkout(&self, address: &NodeAddress, role: Role, fallback: bool) -> Result<RoutedConnection> {
        let pool = self.pool(address, role);
        let lease = pool.acquire().await?;
        Ok(RoutedConnection::new(pool, lease, self.resolver.clone(), fallback))
    }

    /// Pool for (address, role), created on first use
    fn pool(&self, address: &NodeAddress, role: Role) -> Arc<NodePool> {
        let key = (address.clone(), role);

        if let Some(pool) = self.pools.read().get(&key) {
            return pool.clone();
        }

        self.pools
            .write()
            .entry(key)
            .or_insert_with(|| {
                debug!("Creating {} pool for {}", role, address);
                NodePool::new(address.clone(), role, self.config.clone())
            })
            .clone()
    }

    /// Close pools for nodes the view no longer lists in their role
    fn prune(&self, view: &TopologyView) {
        if self.pruned_epoch.fetch_max(view.epoch, Ordering::AcqRel) >= view.epoch {
            return;
        }

        let mut pools = self.pools.write();
        pools.retain(|(address, role), pool| {
            let listed = match role {
                Role::Primary => view.lists_primary(address),
                Role::Replica => view.lists_replica(address),
            };
            if !listed {
                info!("Dropping {} pool for {}: no longer in topology", role, address);
                pool.close();
            }
            listed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dead_address, dead_addresses, test_config, FakeNode, FakeSentinel};
    use futures::future::join_all;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct Cluster {
        monitors: Vec<FakeSentinel>,
        router: ConnectionRouter,
    }

    async fn cluster(primary: &NodeAddress, replicas: &[&NodeAddress], tweak: impl FnOnce(&mut SentinelConfig)) -> Cluster {
        let mut monitors = Vec::new();
        for _ in 0..3 {
            monitors.push(FakeSentinel::start(Some(primary), replicas).await);
        }
        let mut config = test_config(&monitors.iter().map(|m| m.address()).collect::<Vec<_>>());
        tweak(&mut config);
        let router = ConnectionRouter::new(Arc::new(config)).unwrap();
        Cluster { monitors, router }
    }

    impl Cluster {
        fn failover(&self, primary: &NodeAddress, replicas: &[&NodeAddress]) {
            for m in &self.monitors {
                m.set_master(Some(primary));
                m.set_replicas(replicas);
            }
        }
    }

    #[tokio::test]
    async fn test_write_goes_to_primary() {
        let primary = FakeNode::start().await;
        let replica = FakeNode::start().await;
        let c = cluster(&primary.address(), &[&replica.address()], |_| {}).await;

        let mut conn = c.router.write_connection().await.unwrap();
        assert_eq!(conn.address(), &primary.address());
        assert_eq!(conn.role(), Role::Primary);
        assert!(!conn.is_fallback());
        assert_eq!(conn.query(["SET", "k", "v"]).await.unwrap(), RespValue::simple_string("OK"));
        assert!(primary.commands().contains(&"SET k v".to_string()));
    }

    #[tokio::test]
    async fn test_read_goes_to_replica() {
        let primary = FakeNode::start().await;
        let replica = FakeNode::start().await;
        let c = cluster(&primary.address(), &[&replica.address()], |_| {}).await;

        let conn = c.router.read_connection().await.unwrap();
        assert_eq!(conn.address(), &replica.address());
        assert_eq!(conn.role(), Role::Replica);
        assert!(!conn.is_fallback());
    }

    #[tokio::test]
    async fn test_read_falls_back_to_primary_without_replicas() {
        let primary = FakeNode::start().await;
        let c = cluster(&primary.address(), &[], |_| {}).await;

        let conn = c.router.read_connection().await.unwrap();
        assert_eq!(conn.address(), &primary.address());
        assert!(conn.is_fallback());
    }

    #[tokio::test]
    async fn test_upstream_error_passes_through() {
        let primary = FakeNode::start().await;
        let c = cluster(&primary.address(), &[], |_| {}).await;

        let err = c.router.write(&RespValue::command(["BOGUS"])).await.unwrap_err();
        assert_eq!(err, Error::Upstream("ERR unknown command 'BOGUS'".to_string()));
        // The connection survives an error reply
        assert_eq!(c.router.pool_statuses()[0].live, 1);
    }

    #[tokio::test]
    async fn test_failover_reresolves_exactly_once() {
        let old = FakeNode::start().await;
        let new = FakeNode::start().await;
        let c = cluster(&old.address(), &[&new.address()], |_| {}).await;

        // Warm the pool with a connection to the old primary
        c.router.write(&RespValue::command(["SET", "a", "1"])).await.unwrap();
        let rounds = c.router.resolver().rounds();

        c.failover(&new.address(), &[]);
        old.kill();

        let reply = c.router.write(&RespValue::command(["SET", "a", "2"])).await.unwrap();
        assert_eq!(reply, RespValue::simple_string("OK"));
        assert_eq!(c.router.resolver().rounds(), rounds + 1);
        assert!(new.commands().contains(&"SET a 2".to_string()));

        // The old primary's pool is gone
        let statuses = c.router.pool_statuses();
        assert!(statuses.iter().all(|s| s.address == new.address()));
    }

    #[tokio::test]
    async fn test_failover_to_unreachable_primary_fails_once() {
        let old = FakeNode::start().await;
        let c = cluster(&old.address(), &[], |_| {}).await;

        c.router.write(&RespValue::command(["SET", "a", "1"])).await.unwrap();
        let rounds = c.router.resolver().rounds();

        let gone = dead_address().await;
        c.failover(&gone, &[]);
        old.kill();

        let err = assert_err!(c.router.write(&RespValue::command(["SET", "a", "2"])).await);
        assert!(matches!(err, Error::BrokenConnection { .. }));
        assert_eq!(c.router.resolver().rounds(), rounds + 1);
    }

    #[tokio::test]
    async fn test_demoted_primary_triggers_reresolution() {
        let old = FakeNode::start().await;
        let new = FakeNode::start().await;
        let c = cluster(&old.address(), &[&new.address()], |_| {}).await;

        c.router.write(&RespValue::command(["SET", "a", "1"])).await.unwrap();
        c.failover(&new.address(), &[&old.address()]);
        old.set_readonly(true);

        let reply = c.router.write(&RespValue::command(["SET", "a", "2"])).await.unwrap();
        assert_eq!(reply, RespValue::simple_string("OK"));
        assert!(new.commands().contains(&"SET a 2".to_string()));
    }

    #[tokio::test]
    async fn test_issued_connection_failure_refreshes_view() {
        let old = FakeNode::start().await;
        let new = FakeNode::start().await;
        let c = cluster(&old.address(), &[], |_| {}).await;
        c.router.refresh().await.unwrap();

        let mut conn = c.router.write_connection().await.unwrap();
        c.failover(&new.address(), &[]);
        old.kill();

        assert!(conn.query(["SET", "k", "v"]).await.unwrap_err().is_broken());
        assert_eq!(conn.state(), ConnState::Broken);
        drop(conn);

        // The failed first command already refreshed the view
        assert_eq!(c.router.resolver().current().unwrap().primary, new.address());
        let conn = c.router.write_connection().await.unwrap();
        assert_eq!(conn.address(), &new.address());
    }

    #[tokio::test]
    async fn test_pool_cap_under_concurrency() {
        let primary = FakeNode::start().await;
        let c = cluster(&primary.address(), &[], |config| {
            config.max_connections = 2;
            config.socket_timeout_ms = 200;
        })
        .await;

        c.router.refresh().await.unwrap();

        let router = &c.router;
        let results = join_all((0..5).map(|_| router.write_connection())).await;
        let (held, refused): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| r.is_ok());

        assert_eq!(held.len(), 2);
        assert_eq!(refused.len(), 3);
        assert!(refused.iter().all(|r| matches!(r, Err(Error::PoolExhausted { .. }))));
        assert!(primary.connections() <= 2);

        drop(held);
        let again = c.router.write_connection().await.unwrap();
        assert!(primary.connections() <= 2);
        drop(again);

        let status = &c.router.pool_statuses()[0];
        assert!(status.live <= 2);
        assert_eq!(status.in_use, 0);
    }

    #[tokio::test]
    async fn test_restarted_node_gets_fresh_connections() {
        let primary = FakeNode::start().await;
        let c = cluster(&primary.address(), &[], |_| {}).await;

        // Two idle connections to the primary
        let a = c.router.write_connection().await.unwrap();
        let b = c.router.write_connection().await.unwrap();
        drop((a, b));
        assert_eq!(c.router.pool_statuses()[0].idle, 2);

        // Same address, every client socket closed
        primary.restart();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reply = assert_ok!(c.router.write(&RespValue::command(["SET", "k", "v"])).await);
        assert_eq!(reply, RespValue::simple_string("OK"));
        assert_eq!(primary.connections(), 3);

        let status = &c.router.pool_statuses()[0];
        assert_eq!(status.live, 1);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn test_held_connection_reresolves_at_most_once() {
        let old = FakeNode::start().await;
        let new = FakeNode::start().await;
        let c = cluster(&old.address(), &[], |_| {}).await;
        c.router.refresh().await.unwrap();
        let rounds = c.router.resolver().rounds();

        c.failover(&new.address(), &[]);
        old.kill();

        // Acquiring finds the old primary gone and re-resolves
        let mut conn = c.router.write_connection().await.unwrap();
        assert_eq!(conn.address(), &new.address());
        assert_eq!(c.router.resolver().rounds(), rounds + 1);

        new.kill();
        let err = assert_err!(conn.query(["SET", "k", "v"]).await);
        assert!(err.is_broken());
        assert_eq!(c.router.resolver().rounds(), rounds + 1);
    }

    #[tokio::test]
    async fn test_concurrent_reads_spread_across_replicas() {
        let primary = FakeNode::start().await;
        let r1 = FakeNode::start().await;
        let r2 = FakeNode::start().await;
        let c = cluster(&primary.address(), &[&r1.address(), &r2.address()], |_| {}).await;
        // Resolve up front so every request sees the same view
        c.router.refresh().await.unwrap();

        let router = &c.router;
        let conns = join_all((0..10).map(|_| router.read_connection())).await;

        let mut counts: HashMap<NodeAddress, usize> = HashMap::new();
        for conn in &conns {
            let conn = conn.as_ref().unwrap();
            assert!(!conn.is_fallback());
            *counts.entry(conn.address().clone()).or_insert(0) += 1;
        }

        let on_r1 = counts.get(&r1.address()).copied().unwrap_or(0);
        let on_r2 = counts.get(&r2.address()).copied().unwrap_or(0);
        assert_eq!(on_r1 + on_r2, 10);
        assert!(on_r1.abs_diff(on_r2) <= 2, "imbalanced: {} vs {}", on_r1, on_r2);
    }

    #[tokio::test]
    async fn test_least_recently_used_alternates() {
        let primary = FakeNode::start().await;
        let r1 = FakeNode::start().await;
        let r2 = FakeNode::start().await;
        let c = cluster(&primary.address(), &[&r1.address(), &r2.address()], |config| {
            config.replica_selection = ReplicaSelection::LeastRecentlyUsed;
        })
        .await;

        let first = c.router.read_connection().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = c.router.read_connection().await.unwrap();
        assert_ne!(first.address(), second.address());
    }

    #[tokio::test]
    async fn test_writes_refused_without_quorum() {
        let primary = FakeNode::start().await;
        let alive = FakeSentinel::start(Some(&primary.address()), &[]).await;
        let config = test_config(&[vec![alive.address()], dead_addresses(2).await].concat());
        let router = ConnectionRouter::new(Arc::new(config)).unwrap();

        let err = router.write_connection().await.err().unwrap();
        assert!(matches!(err, Error::QuorumUnavailable { .. }));

        // Reads accept the best-effort view
        let conn = router.read_connection().await.unwrap();
        assert_eq!(conn.address(), &primary.address());
        assert!(conn.is_fallback());
    }

    #[tokio::test]
    async fn test_best_effort_writes_opt_in() {
        let primary = FakeNode::start().await;
        let alive = FakeSentinel::start(Some(&primary.address()), &[]).await;
        let mut config = test_config(&[vec![alive.address()], dead_addresses(2).await].concat());
        config.best_effort_writes = true;
        let router = ConnectionRouter::new(Arc::new(config)).unwrap();

        let conn = router.write_connection().await.unwrap();
        assert_eq!(conn.address(), &primary.address());
    }

    #[tokio::test]
    async fn test_split_monitors_elect_nobody() {
        let monitors = [
            FakeSentinel::start(Some(&"10.9.0.1:6379".parse().unwrap()), &[]).await,
            FakeSentinel::start(Some(&"10.9.0.2:6379".parse().unwrap()), &[]).await,
            FakeSentinel::start(Some(&"10.9.0.3:6379".parse().unwrap()), &[]).await,
        ];
        let config = test_config(&monitors.iter().map(|m| m.address()).collect::<Vec<_>>());
        let router = ConnectionRouter::new(Arc::new(config)).unwrap();

        let err = router.write_connection().await.err().unwrap();
        assert!(matches!(err, Error::NoPrimaryElected(_)));
    }
}
