//! Topology views
//!
//! A `TopologyView` is an immutable snapshot: the resolver builds a new one
//! for every resolution and swaps it in whole.

use crate::address::{MonitorEndpoint, NodeAddress};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// What a monitor contributed to a resolution round
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorReport {
    pub address: MonitorEndpoint,
    pub responded: bool,
    /// Primary this monitor voted for
    pub claimed_primary: Option<NodeAddress>,
    /// Why the monitor was discarded
    pub error: Option<String>,
}

/// Resolved roles of the replication group at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct TopologyView {
    pub primary: NodeAddress,

    /// Sorted, never contains `primary`
    pub replicas: Vec<NodeAddress>,

    pub observed_at: DateTime<Utc>,

    /// `primary` was confirmed by a strict majority of configured monitors
    pub quorum_satisfied: bool,

    pub monitors: Vec<MonitorReport>,

    /// Publication sequence number, increases with every swap
    pub epoch: u64,
}

impl TopologyView {
    /// Number of monitors that answered in this round
    pub fn responding(&self) -> usize {
        self.monitors.iter().filter(|m| m.responded).count()
    }

    /// Whether `address` is currently listed for the given role
    pub fn lists_primary(&self, address: &NodeAddress) -> bool {
        &self.primary == address
    }

    pub fn lists_replica(&self, address: &NodeAddress) -> bool {
        self.replicas.binary_search(address).is_ok()
    }
}
