//! FerrumHA - High-availability access to a replicated key-value store
//!
//! Each module has a single responsibility:
//! - `sentinel` finds out who the primary is, by majority vote of the monitors
//! - `router` hands out pooled connections to the primary or a replica
//! - `status` and `web` report what the router currently believes
//! - `protocol` and `client` speak RESP to monitors and store nodes

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod router;
pub mod sentinel;
pub mod status;
pub mod web;

#[cfg(test)]
mod testing;

/// Re-export commonly used types
pub use address::{MonitorEndpoint, NodeAddress};
pub use config::{ReplicaSelection, SentinelConfig};
pub use error::{Error, Result};
pub use protocol::{RespError, RespValue};
pub use router::{ConnState, ConnectionRouter, PoolStatus, Role, RoutedConnection};
pub use sentinel::{MonitorPool, MonitorReport, TopologyResolver, TopologyView};
pub use status::{StatusReport, StatusReporter};
