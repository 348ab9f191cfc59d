//! Topology resolver
//!
//! Queries every monitor, elects the primary by strict majority and
//! publishes the result as a new `TopologyView`. Resolution is retried per the
//! configured policy, and concurrent callers share a single in-flight round.

use super::monitor::{MonitorQuery, MonitorReply};
use super::topology::{MonitorReport, TopologyView};
use super::MonitorPool;
use crate::address::{MonitorEndpoint, NodeAddress};
use crate::config::SentinelConfig;
use crate::error::{Error, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of the most recent resolution round
struct Round {
    id: u64,
    result: Result<Arc<TopologyView>>,
}

/// Derives the topology from the monitor pool
pub struct TopologyResolver {
    monitors: MonitorPool,
    config: Arc<SentinelConfig>,

    /// Currently published view. Replaced whole, never mutated.
    current: RwLock<Option<Arc<TopologyView>>>,

    /// Number of completed rounds
    rounds: AtomicU64,

    /// Held for the duration of a round; keeps the last outcome for callers
    /// that queued behind it.
    last_round: Mutex<Option<Round>>,

    /// Publication counter used for `TopologyView::epoch`
    published: AtomicU64,
}

impl TopologyResolver {
    /// Create a resolver; nothing is queried until the first `resolve()`
    pub fn new(monitors: MonitorPool, config: Arc<SentinelConfig>) -> Self {
        TopologyResolver {
            monitors,
            config,
            current: RwLock::new(None),
            rounds: AtomicU64::new(0),
            last_round: Mutex::new(None),
            published: AtomicU64::new(0),
        }
    }

    /// The currently published view, if any
    pub fn current(&self) -> Option<Arc<TopologyView>> {
        self.current.read().clone()
    }

    /// The monitor pool this resolver queries
    pub fn monitors(&self) -> &MonitorPool {
        &self.monitors
    }

    /// Number of resolution rounds completed so far
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Acquire)
    }

    /// Re-derive the topology from the monitors
    ///
    /// Callers that arrive while a round is running wait for it and receive
    /// its result instead of starting another one.
    pub async fn resolve(&self) -> Result<Arc<TopologyView>> {
        let seen = self.rounds.load(Ordering::Acquire);
        let mut last = self.last_round.lock().await;

        if let Some(round) = last.as_ref() {
            if round.id > seen {
                debug!("Joining resolution round {}", round.id);
                return round.result.clone();
            }
        }

        let result = self.resolve_with_retry().await;

        let id = self.rounds.fetch_add(1, Ordering::AcqRel) + 1;
        *last = Some(Round {
            id,
            result: result.clone(),
        });

        result
    }

    /// Run up to `max_retries` rounds until one reaches quorum
    async fn resolve_with_retry(&self) -> Result<Arc<TopologyView>> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = Error::QuorumUnavailable {
            responding: 0,
            configured: self.monitors.len(),
            required: self.monitors.majority(),
        };
        let mut best_effort = None;

        for attempt in 1..=attempts {
            match self.resolve_once().await {
                Ok(view) if view.quorum_satisfied => return Ok(self.publish(view)),
                Ok(view) => {
                    warn!(
                        "Resolution attempt {}/{}: only {} of {} monitors responded",
                        attempt,
                        attempts,
                        view.responding(),
                        self.monitors.len()
                    );
                    last_error = Error::QuorumUnavailable {
                        responding: view.responding(),
                        configured: self.monitors.len(),
                        required: self.monitors.majority(),
                    };
                    best_effort = Some(view);
                }
                Err(e) => {
                    warn!("Resolution attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e;
                    best_effort = None;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        match best_effort {
            // Reads may keep using a view that lacks quorum
            Some(view) => {
                self.publish(view);
            }
            None => self.demote_current(),
        }

        Err(last_error)
    }

    /// Query all monitors concurrently and elect a primary
    async fn resolve_once(&self) -> Result<TopologyView> {
        let query = Arc::new(MonitorQuery {
            master_name: self.config.master_name.clone(),
            password: self.config.monitor_password().map(str::to_string),
            timeout: self.config.socket_connect_timeout(),
        });

        let mut tasks = JoinSet::new();
        for (index, endpoint) in self.monitors.list_monitors().iter().enumerate() {
            let query = query.clone();
            let endpoint = endpoint.clone();
            tasks.spawn(async move {
                let result = query.run(&endpoint).await;
                (index, endpoint, result)
            });
        }

        let mut outcomes = Vec::with_capacity(self.monitors.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("Monitor query task failed: {}", e),
            }
        }
        outcomes.sort_by_key(|(index, _, _)| *index);

        for (_, endpoint, result) in &outcomes {
            if let Err(e) = result {
                debug!("Monitor {} discarded: {}", endpoint, e);
            }
        }

        elect(
            self.monitors.len(),
            outcomes
                .into_iter()
                .map(|(_, endpoint, result)| (endpoint, result))
                .collect(),
        )
    }

    /// Swap in a new view
    fn publish(&self, mut view: TopologyView) -> Arc<TopologyView> {
        view.epoch = self.published.fetch_add(1, Ordering::AcqRel) + 1;
        let view = Arc::new(view);

        let previous = {
            let mut current = self.current.write();
            current.replace(view.clone())
        };

        match previous {
            Some(old) if old.primary != view.primary => {
                warn!("Failover detected: primary moved from {} to {}", old.primary, view.primary);
            }
            _ => {}
        }

        info!(
            "Topology resolved: primary={} replicas={} quorum={} ({}/{} monitors)",
            view.primary,
            view.replicas.len(),
            view.quorum_satisfied,
            view.responding(),
            self.monitors.len()
        );

        view
    }

    /// Republish the current view without its quorum guarantee
    fn demote_current(&self) {
        let demoted = match self.current() {
            Some(view) if view.quorum_satisfied => {
                let mut copy = (*view).clone();
                copy.quorum_satisfied = false;
                copy
            }
            _ => return,
        };

        warn!("Topology for primary {} can no longer be confirmed", demoted.primary);
        self.publish(demoted);
    }
}

/// Strict majority of `n`
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Elect the primary from the monitors' answers
///
/// The winner needs a strict majority of the monitors that responded. The
/// view is returned even when fewer than `majority(configured)` responded, with
/// `quorum_satisfied` false.
pub fn elect(
    configured: usize,
    outcomes: Vec<(MonitorEndpoint, Result<MonitorReply>)>,
) -> Result<TopologyView> {
    let required = majority(configured);
    let responding = outcomes.iter().filter(|(_, r)| r.is_ok()).count();

    if responding == 0 {
        return Err(Error::QuorumUnavailable {
            responding,
            configured,
            required,
        });
    }

    // Tally votes per claimed primary
    let mut votes: HashMap<&NodeAddress, usize> = HashMap::new();
    for (_, result) in &outcomes {
        if let Ok(reply) = result {
            *votes.entry(&reply.primary).or_insert(0) += 1;
        }
    }

    let winner = votes
        .iter()
        .find(|(_, count)| **count * 2 > responding)
        .map(|(primary, _)| (*primary).clone());

    let primary = match winner {
        Some(primary) => primary,
        None if responding < required => {
            return Err(Error::QuorumUnavailable {
                responding,
                configured,
                required,
            })
        }
        None => {
            let mut tally: Vec<String> = votes
                .iter()
                .map(|(primary, count)| format!("{}={}", primary, count))
                .collect();
            tally.sort();
            return Err(Error::NoPrimaryElected(format!(
                "votes {} among {} responding monitors",
                tally.join(", "),
                responding
            )));
        }
    };

    // Union of replicas reported by monitors agreeing with the winner
    let mut replicas = BTreeSet::new();
    for (_, result) in &outcomes {
        if let Ok(reply) = result {
            if reply.primary == primary {
                replicas.extend(reply.replicas.iter().cloned());
            }
        }
    }
    replicas.remove(&primary);

    let monitors = outcomes
        .into_iter()
        .map(|(address, result)| match result {
            Ok(reply) => MonitorReport {
                address,
                responded: true,
                claimed_primary: Some(reply.primary),
                error: None,
            },
            Err(e) => MonitorReport {
                address,
                responded: false,
                claimed_primary: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    Ok(TopologyView {
        primary,
        replicas: replicas.into_iter().collect(),
        observed_at: Utc::now(),
        quorum_satisfied: responding >= required,
        monitors,
        epoch: 0,
    })
}
