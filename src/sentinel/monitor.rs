//! Monitor queries
//!
//! The discovery handshake with a single monitor: who is primary for the
//! group, and which replicas does it currently consider healthy.

use crate::address::{MonitorEndpoint, NodeAddress};
use crate::client::RespConnection;
use crate::error::{Error, Result};
use crate::protocol::RespValue;
use base64::{engine::general_purpose, Engine as _};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

/// Replica flags that disqualify a replica from the reported set
const UNHEALTHY_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

/// What one monitor claims about the group
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorReply {
    pub primary: NodeAddress,
    pub replicas: Vec<NodeAddress>,
}

/// Parameters shared by every monitor query of a resolution round
#[derive(Debug, Clone)]
pub struct MonitorQuery {
    pub master_name: String,
    pub password: Option<String>,
    /// Bound on the whole exchange with one monitor
    pub timeout: Duration,
}

impl MonitorQuery {
    /// Ask `endpoint` for the primary and replicas of the group
    pub async fn run(&self, endpoint: &MonitorEndpoint) -> Result<MonitorReply> {
        match timeout(self.timeout, self.exchange(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(Error::broken(
                endpoint,
                format!("monitor did not answer within {:?}", self.timeout),
            )),
        }
    }

    async fn exchange(&self, endpoint: &MonitorEndpoint) -> Result<MonitorReply> {
        let mut conn = RespConnection::connect(endpoint, self.timeout, self.timeout).await?;

        if let Some(password) = self.password.as_deref() {
            conn.call(&RespValue::command(["AUTH", password])).await?;
        }

        let reply = conn
            .call(&RespValue::command([
                "SENTINEL",
                "get-master-addr-by-name",
                self.master_name.as_str(),
            ]))
            .await?;
        let primary = parse_master_addr(&reply, &self.master_name)?;

        // Older monitors only know the SLAVES spelling
        let reply = match conn
            .call(&RespValue::command(["SENTINEL", "replicas", self.master_name.as_str()]))
            .await
        {
            Err(Error::Upstream(msg)) if msg.to_ascii_lowercase().contains("unknown") => {
                debug!("{} does not support SENTINEL REPLICAS, using SLAVES", endpoint);
                conn.call(&RespValue::command(["SENTINEL", "slaves", self.master_name.as_str()]))
                    .await?
            }
            other => other?,
        };
        let replicas = parse_replicas(&reply)?;

        Ok(MonitorReply { primary, replicas })
    }
}

/// Decode the `[ip, port]` reply of `SENTINEL get-master-addr-by-name`
///
/// A nil reply means the monitor does not know the group.
pub fn parse_master_addr(reply: &RespValue, master_name: &str) -> Result<NodeAddress> {
    if reply.is_null() {
        return Err(Error::Upstream(format!(
            "monitor does not know group '{}'",
            master_name
        )));
    }

    let parts = match reply.as_array() {
        Some(parts) if parts.len() == 2 => parts,
        _ => return Err(malformed("get-master-addr-by-name", reply)),
    };

    match (parts[0].as_text(), parts[1].as_text()) {
        (Some(host), Some(port)) => {
            NodeAddress::from_parts(&host, &port).map_err(Error::Protocol)
        }
        _ => Err(malformed("get-master-addr-by-name", reply)),
    }
}

/// Decode the reply of `SENTINEL replicas`, keeping only healthy replicas
///
/// Each element is a flat `[field, value, field, value, ...]` array.
pub fn parse_replicas(reply: &RespValue) -> Result<Vec<NodeAddress>> {
    let entries = match reply {
        RespValue::Null => return Ok(Vec::new()),
        RespValue::Array(entries) => entries,
        other => return Err(malformed("replicas", other)),
    };

    let mut replicas = Vec::with_capacity(entries.len());

    for entry in entries {
        let fields = entry
            .as_array()
            .ok_or_else(|| malformed("replicas", entry))?;

        let mut ip = None;
        let mut port = None;
        let mut flags = String::new();

        for pair in fields.chunks(2) {
            if let [name, value] = pair {
                match name.as_text().as_deref() {
                    Some("ip") => ip = value.as_text(),
                    Some("port") => port = value.as_text(),
                    Some("flags") => flags = value.as_text().unwrap_or_default(),
                    _ => {}
                }
            }
        }

        let (ip, port) = match (ip, port) {
            (Some(ip), Some(port)) => (ip, port),
            _ => return Err(malformed("replicas", entry)),
        };

        let address = NodeAddress::from_parts(&ip, &port).map_err(Error::Protocol)?;

        if flags.split(',').any(|f| UNHEALTHY_FLAGS.contains(&f)) {
            debug!("Skipping replica {} with flags '{}'", address, flags);
            continue;
        }

        replicas.push(address);
    }

    Ok(replicas)
}

/// Log a reply we cannot interpret and turn it into a protocol error
fn malformed(what: &str, reply: &RespValue) -> Error {
    // Encode the reply in Base64 so arbitrary bytes stay on one log line
    let debug_msg = format!("{:?}", reply);
    let b64 = general_purpose::STANDARD.encode(debug_msg.as_bytes());
    error!("Malformed '{}' reply from monitor. Reply (B64): {}", what, b64);
    Error::Protocol(format!("malformed '{}' reply", what))
}
