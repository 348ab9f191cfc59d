//! Health and status reporting
//!
//! Read-only snapshot of what the router currently believes: the published
//! topology, how it was obtained and how the pools are doing. Building a
//! report never queries a monitor or a store node.

use crate::address::NodeAddress;
use crate::router::{ConnectionRouter, PoolStatus};
use crate::sentinel::MonitorReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Snapshot of the router's state
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub master_name: String,

    /// `None` until the first successful resolution
    pub primary: Option<NodeAddress>,
    pub replicas: Vec<NodeAddress>,
    pub quorum_satisfied: bool,
    pub last_resolved_at: Option<DateTime<Utc>>,

    /// Resolution rounds run since startup
    pub resolutions: u64,

    pub monitors: Vec<MonitorReport>,
    pub pools: Vec<PoolStatus>,
}

/// Builds status reports for one router
#[derive(Clone)]
pub struct StatusReporter {
    router: Arc<ConnectionRouter>,
}

impl StatusReporter {
    pub fn new(router: Arc<ConnectionRouter>) -> Self {
        StatusReporter { router }
    }

    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }

    /// Current status, without side effects
    pub fn status(&self) -> StatusReport {
        let resolver = self.router.resolver();
        let view = resolver.current();

        // Before any resolution, list the configured monitors as unseen
        let monitors = match &view {
            Some(view) => view.monitors.clone(),
            None => resolver
                .monitors()
                .list_monitors()
                .iter()
                .map(|address| MonitorReport {
                    address: address.clone(),
                    responded: false,
                    claimed_primary: None,
                    error: None,
                })
                .collect(),
        };

        StatusReport {
            master_name: self.router.config().master_name.clone(),
            primary: view.as_ref().map(|v| v.primary.clone()),
            replicas: view.as_ref().map(|v| v.replicas.clone()).unwrap_or_default(),
            quorum_satisfied: view.as_ref().map(|v| v.quorum_satisfied).unwrap_or(false),
            last_resolved_at: view.as_ref().map(|v| v.observed_at),
            resolutions: resolver.rounds(),
            monitors,
            pools: self.router.pool_statuses(),
        }
    }
}
