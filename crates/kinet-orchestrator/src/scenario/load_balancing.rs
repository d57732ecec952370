//! Load-balancing scenario
//!
//! One replica runs on every node; vehicles are pinned between nodes to even
//! out the per-node load. Each tick the heaviest and lightest nodes are
//! picked, and enough vehicles move to meet in the middle. Vehicles with the
//! most expected time left under their AP move first: a vehicle about to
//! roam would waste its pin.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use kinet_core::{FlowRecord, NodeId, VehicleId};

use crate::error::Result;
use crate::scenario::ScenarioContext;
use crate::viz::{Snapshot, SnapshotLog};

/// Timestamped run log, recreated at startup
pub struct AuditLog {
    file: File,
}

impl AuditLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn log(&mut self, message: &str) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        if let Err(e) = writeln!(self.file, "{timestamp} {message}") {
            warn!("failed to write audit log: {e}");
        }
    }
}

/// Heaviest and lightest loaded nodes, iterating ascending node id. The
/// first node initializes both. A node strictly lighter than the running
/// minimum takes lightest and is not considered for heaviest; only a node
/// strictly heavier than the running maximum takes heaviest.
pub fn select_extremes(loads: &BTreeMap<NodeId, Vec<VehicleId>>) -> Option<(NodeId, NodeId)> {
    let mut iter = loads.iter();
    let (&first, vehicles) = iter.next()?;
    let mut lightest = (first, vehicles.len());
    let mut heaviest = (first, vehicles.len());

    for (&node, vehicles) in iter {
        let count = vehicles.len();
        if count < lightest.1 {
            lightest = (node, count);
        } else if count > heaviest.1 {
            heaviest = (node, count);
        }
    }
    Some((heaviest.0, lightest.0))
}

/// Vehicles to move from the heaviest to the lightest node
pub fn move_count(heaviest: usize, lightest: usize) -> usize {
    let midpoint = (heaviest + lightest) / 2;
    midpoint.saturating_sub(1)
}

/// Order candidates by retention estimate, stickiest first, and keep the
/// requested number
pub fn rank_candidates(
    mut candidates: Vec<(VehicleId, f64)>,
    to_move: usize,
) -> Vec<(VehicleId, f64)> {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    candidates.truncate(to_move);
    candidates
}

pub struct LoadBalancingController {
    ctx: ScenarioContext,
    audit: AuditLog,
    viz: SnapshotLog,
    tick_index: u64,
    defaults_installed: bool,
}

impl LoadBalancingController {
    pub fn new(ctx: ScenarioContext, viz_path: &Path, log_path: &Path) -> Result<Self> {
        Ok(Self {
            ctx,
            audit: AuditLog::create(log_path)?,
            viz: SnapshotLog::new(viz_path),
            tick_index: 0,
            defaults_installed: false,
        })
    }

    async fn tick(&mut self) {
        let mut vehicles = self.ctx.vehicles.lock().await;

        // Group vehicles by the node currently serving them
        let mut loads: BTreeMap<NodeId, Vec<VehicleId>> = BTreeMap::new();
        for (&id, state) in vehicles.iter() {
            if let Some(node) = state.using_node {
                loads.entry(node).or_default().push(id);
            }
        }
        if loads.is_empty() {
            debug!("no vehicles assigned yet");
            return;
        }

        self.audit.log(&format!("vehicle data: {:?}", *vehicles));
        self.audit.log(&format!("loads: {loads:?}"));

        let counts: BTreeMap<NodeId, usize> =
            loads.iter().map(|(&node, v)| (node, v.len())).collect();
        self.viz.record(self.tick_index, Snapshot::NodeLoads(counts));
        self.tick_index += 1;

        if !self.defaults_installed {
            self.ctx.install_default_lb_flows().await;
            self.defaults_installed = true;
        }

        let Some((heaviest, lightest)) = select_extremes(&loads) else {
            return;
        };
        if heaviest == lightest {
            return;
        }
        self.audit
            .log(&format!("heaviest node: {heaviest}, lightest node: {lightest}"));

        let to_move = move_count(loads[&heaviest].len(), loads[&lightest].len());
        if to_move == 0 {
            return;
        }

        // Expected in-coverage travel distance per candidate; an existing
        // pin to the current AP means the vehicle was already moved there
        let mut candidates: Vec<(VehicleId, f64)> = Vec::new();
        for &id in &loads[&heaviest] {
            let state = &vehicles[&id];
            let Some(ap) = state.associated_ap else {
                debug!(vehicle = id, "no associated AP, skipping");
                continue;
            };
            let Some(position) = state.position else {
                continue;
            };
            let retention = if state.has_flow_for_ap(ap) {
                0.0
            } else if let Some(direction) = state.direction {
                self.ctx
                    .topology
                    .distance_in_range(position, direction, ap, self.ctx.range)
            } else {
                // One position sample says nothing about movement yet
                debug!(vehicle = id, "direction unknown, skipping");
                0.0
            };
            if retention > 0.0 {
                candidates.push((id, retention));
            }
        }
        let candidates = rank_candidates(candidates, to_move);

        let Some(light_ip) = self.ctx.node_ip(lightest).map(str::to_string) else {
            warn!(node = lightest, "lightest node has no worker");
            return;
        };
        let Some(bootstrap) = self.ctx.bootstrap_ip().map(str::to_string) else {
            warn!("no bootstrap worker, cannot pin vehicles");
            return;
        };

        for (id, retention) in candidates {
            let Some(state) = vehicles.get_mut(&id) else {
                continue;
            };
            let Some(ap) = state.associated_ap else {
                continue;
            };

            info!(vehicle = id, ap, from = heaviest, to = lightest, "pinning vehicle");
            self.audit.log(&format!(
                "moving vehicle {id} (retention {retention:.1}) from node {heaviest} to node {lightest}"
            ));

            let _ = self
                .ctx
                .sdn
                .install_vehicle_pin(ap, id, &light_ip, &bootstrap)
                .await;
            // History only grows; the serving node is left to the tracker
            state.flows.push(FlowRecord { ap, node: lightest });
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        info!("load-balancing controller started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("load-balancing controller stopping");
                        return;
                    }
                }
            }
        }
    }
}
