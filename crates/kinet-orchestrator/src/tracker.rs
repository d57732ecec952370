//! Vehicle tracker loop
//!
//! Polls the per-vehicle telemetry files once per tick and maintains the
//! shared vehicle table: position, per-tick displacement, associated AP and
//! (in load-balancing mode) the node currently serving the vehicle.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use kinet_core::{ApId, Point, TopologyIndex, VehicleId, VehicleState, DEFAULT_RANGE};

use crate::sdn::vehicle_mac;
use crate::telemetry::{parse_position, read_last_line, telemetry_path};

/// Vehicle table shared between the tracker loop and the decision loop
pub type SharedVehicles = Arc<Mutex<BTreeMap<VehicleId, VehicleState>>>;

/// Build the vehicle table for ids 1..=count
pub fn seed_vehicles(count: u32) -> SharedVehicles {
    let vehicles = (1..=count).map(|id| (id, VehicleState::default())).collect();
    Arc::new(Mutex::new(vehicles))
}

/// Source of real AP attachment, when the wireless tooling is available
#[async_trait]
pub trait AttachmentProbe: Send + Sync {
    /// AP currently reporting the vehicle as a station, if any
    async fn attached_ap(&self, vehicle: VehicleId) -> Option<ApId>;
}

/// Probe shelling out to `iw` on the simulation host. Each AP exposes a
/// `ap{id}-wlan1` interface; the first one listing the vehicle's derived
/// MAC in its station dump wins.
pub struct IwProbe {
    ap_ids: Vec<ApId>,
}

impl IwProbe {
    pub fn new(topology: &TopologyIndex) -> Self {
        Self {
            ap_ids: topology.aps().iter().map(|ap| ap.id).collect(),
        }
    }
}

#[async_trait]
impl AttachmentProbe for IwProbe {
    async fn attached_ap(&self, vehicle: VehicleId) -> Option<ApId> {
        let mac = vehicle_mac(vehicle);
        for &ap in &self.ap_ids {
            let output = tokio::process::Command::new("iw")
                .args(["dev", &format!("ap{ap}-wlan1"), "station", "dump"])
                .output()
                .await
                .ok()?;
            if String::from_utf8_lossy(&output.stdout).contains(&mac) {
                return Some(ap);
            }
        }
        None
    }
}

/// Fold a new telemetry sample into the vehicle state. The displacement is
/// only updated when the position actually changed, so a stalled vehicle
/// keeps its last known direction.
pub fn apply_position(state: &mut VehicleState, sample: Point) {
    match state.position {
        Some(previous) if previous == sample => {}
        Some(previous) => {
            state.direction = Some((sample.x - previous.x, sample.y - previous.y));
            state.position = Some(sample);
        }
        None => {
            state.position = Some(sample);
        }
    }
}

/// True when the serving node should follow the AP's ground-truth node:
/// no previously flowed AP still covers the vehicle.
pub fn needs_node_update(state: &VehicleState, topology: &TopologyIndex, range: f64) -> bool {
    let Some(position) = state.position else {
        return false;
    };
    !state
        .flows
        .iter()
        .any(|flow| topology.is_ap_in_range(position, flow.ap, range))
}

pub struct VehicleTracker {
    topology: Arc<TopologyIndex>,
    vehicles: SharedVehicles,
    telemetry_dir: PathBuf,
    probe: Option<Arc<dyn AttachmentProbe>>,
    /// Load-balancing mode: keep `using_node` in sync with the AP mapping
    assign_serving_node: bool,
    range: f64,
}

impl VehicleTracker {
    pub fn new(
        topology: Arc<TopologyIndex>,
        vehicles: SharedVehicles,
        telemetry_dir: PathBuf,
        probe: Option<Arc<dyn AttachmentProbe>>,
        assign_serving_node: bool,
    ) -> Self {
        Self {
            topology,
            vehicles,
            telemetry_dir,
            probe,
            assign_serving_node,
            range: DEFAULT_RANGE,
        }
    }

    /// One polling pass over all vehicles
    pub async fn poll_once(&self) {
        let ids: Vec<VehicleId> = {
            let vehicles = self.vehicles.lock().await;
            vehicles.keys().copied().collect()
        };

        for id in ids {
            let path = telemetry_path(&self.telemetry_dir, id);
            let Some(line) = read_last_line(&path) else {
                continue;
            };
            let Some(sample) = parse_position(&line) else {
                debug!(vehicle = id, line, "unparseable telemetry line");
                continue;
            };

            // The probe shells out, so query it before taking the lock
            let probed = match &self.probe {
                Some(probe) => probe.attached_ap(id).await,
                None => None,
            };

            let mut vehicles = self.vehicles.lock().await;
            let Some(state) = vehicles.get_mut(&id) else {
                continue;
            };

            apply_position(state, sample);
            let Some(position) = state.position else {
                continue;
            };

            state.associated_ap = probed.or_else(|| self.topology.closest_ap(position));

            if self.assign_serving_node {
                if let Some(ap) = state.associated_ap {
                    if needs_node_update(state, &self.topology, self.range) {
                        state.using_node = self.topology.node_for_ap(ap);
                    }
                }
            }
        }
    }

    /// Tick loop; exits when the shutdown flag flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        info!("vehicle tracker started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("vehicle tracker stopping");
                        return;
                    }
                }
            }
        }
    }
}
