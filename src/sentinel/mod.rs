//! Sentinel discovery
//!
//! The monitor pool, the per-monitor discovery handshake and the quorum
//! resolver that turns monitor answers into a `TopologyView`.

mod monitor;
mod resolver;
mod topology;

pub use monitor::{parse_master_addr, parse_replicas, MonitorQuery, MonitorReply};
pub use resolver::{elect, majority, TopologyResolver};
pub use topology::{MonitorReport, TopologyView};

use crate::address::MonitorEndpoint;
use crate::config::SentinelConfig;
use crate::error::{Error, Result};
use std::collections::HashSet;

/// The configured quorum members
///
/// Fixed at construction.
#[derive(Debug, Clone)]
pub struct MonitorPool {
    endpoints: Vec<MonitorEndpoint>,
}

impl MonitorPool {
    /// Build from explicit endpoints. Empty or duplicated lists are rejected.
    pub fn new(endpoints: Vec<MonitorEndpoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::config("monitor list is empty"));
        }

        // A duplicated monitor would vote twice
        let mut seen = HashSet::new();
        for endpoint in &endpoints {
            if !seen.insert(endpoint) {
                return Err(Error::config(format!("monitor {} listed twice", endpoint)));
            }
        }

        Ok(MonitorPool { endpoints })
    }

    /// Build from the configured `sentinels` list
    pub fn from_config(config: &SentinelConfig) -> Result<Self> {
        Self::new(config.monitor_endpoints()?)
    }

    /// Configured monitors, in configuration order
    pub fn list_monitors(&self) -> &[MonitorEndpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Responses needed for quorum
    pub fn majority(&self) -> usize {
        majority(self.endpoints.len())
    }
}
