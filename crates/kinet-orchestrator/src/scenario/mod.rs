//! Scenario control loops
//!
//! A run is two tasks sharing the vehicle table: the tracker loop and one
//! placement controller. The controller owns the deployment manager, the
//! flow state and the visualization output; everything it decides per tick
//! happens under the vehicle-table lock so the tracker never observes a
//! half-applied decision.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use kinet_core::{NodeId, TopologyIndex, DEFAULT_RANGE};

use crate::config::{RunConfig, Scenario};
use crate::deploy::DeploymentManager;
use crate::error::{OrchestratorError, Result};
use crate::orchestration::{
    worker_id, worker_name, CreateOutcome, RestWorkloadApi, ServiceSpec, WorkloadApi,
};
use crate::sdn::SdnClient;
use crate::tracker::{seed_vehicles, AttachmentProbe, IwProbe, SharedVehicles, VehicleTracker};

mod load_balancing;
mod mobility;
mod single_flow;

pub use load_balancing::LoadBalancingController;
pub use mobility::{MobilityController, MobilityVariant};
pub use single_flow::SingleFlowController;

/// A worker node as reported by the orchestration collaborator
#[derive(Debug, Clone)]
pub struct Worker {
    pub name: String,
    pub ip: String,
}

/// Everything a placement controller needs besides its own state
pub struct ScenarioContext {
    pub topology: Arc<TopologyIndex>,
    pub vehicles: SharedVehicles,
    pub sdn: Arc<SdnClient>,
    /// Node id to worker, bootstrap worker at id 1
    pub workers: BTreeMap<NodeId, Worker>,
    /// Cluster name; deployment targets derive their worker names from it
    pub cluster: String,
    /// App/selector label being placed
    pub app: String,
    pub range: f64,
}

impl ScenarioContext {
    pub fn worker(&self, node: NodeId) -> Option<&Worker> {
        self.workers.get(&node)
    }

    pub fn node_ip(&self, node: NodeId) -> Option<&str> {
        self.workers.get(&node).map(|w| w.ip.as_str())
    }

    /// Cluster-convention worker name for a node, the key deployments are
    /// tracked under
    pub fn worker_name_for(&self, node: NodeId) -> String {
        worker_name(&self.cluster, node)
    }

    /// IP of the bootstrap worker, the default traffic destination
    pub fn bootstrap_ip(&self) -> Option<&str> {
        self.node_ip(1)
    }

    /// Default flows for the load-balancing scenario: each AP redirects to
    /// its ground-truth node. The bootstrap node is the rewrite target
    /// itself, so its APs need no rule.
    pub async fn install_default_lb_flows(&self) {
        let Some(bootstrap) = self.bootstrap_ip().map(str::to_string) else {
            warn!("no bootstrap worker, skipping default flows");
            return;
        };
        for ap in self.topology.aps() {
            if ap.node == 1 {
                continue;
            }
            let Some(node_ip) = self.node_ip(ap.node) else {
                warn!(ap = ap.id, node = ap.node, "AP mapped to unknown node");
                continue;
            };
            let _ = self.sdn.install_ap_redirect(ap.id, node_ip, &bootstrap).await;
        }
    }

    /// Default flows for the mobility scenarios: every AP starts pointed at
    /// the bootstrap worker.
    pub async fn install_default_mobility_flows(&self) {
        let Some(bootstrap) = self.bootstrap_ip().map(str::to_string) else {
            warn!("no bootstrap worker, skipping default flows");
            return;
        };
        for ap in self.topology.aps() {
            let _ = self.sdn.install_ap_redirect(ap.id, &bootstrap, &bootstrap).await;
        }
    }
}

/// Load the topology, discover the cluster, seed the initial deployments
/// and drive the two loops until Ctrl+C.
pub async fn run(config: RunConfig) -> Result<()> {
    let topology = Arc::new(TopologyIndex::load(&config.topology)?);
    info!(
        aps = topology.aps().len(),
        vehicles = topology.vehicle_count(),
        "topology loaded"
    );

    let api: Arc<dyn WorkloadApi> = Arc::new(RestWorkloadApi::new(&config.orchestration_url));
    let nodes = api.list_nodes().await?;
    if nodes.is_empty() {
        return Err(OrchestratorError::orchestration("cluster reports no worker nodes"));
    }

    let workers: BTreeMap<NodeId, Worker> = nodes
        .into_iter()
        .map(|(name, ip)| (worker_id(&name), Worker { name, ip }))
        .collect();
    for (id, worker) in &workers {
        info!(node = id, name = %worker.name, ip = %worker.ip, "worker discovered");
    }

    let service = ServiceSpec {
        name: format!("{}-service", config.app.name),
        app: config.app.name.clone(),
        port: config.app.container_port,
        target_port: config.app.target_port,
        node_port: config.app.node_port,
    };
    match api.create_service(&service).await {
        CreateOutcome::Created => info!(name = %service.name, "service created"),
        CreateOutcome::AlreadyExists => info!(name = %service.name, "service already exists"),
        outcome => warn!(name = %service.name, ?outcome, "service creation failed"),
    }

    let mut manager = DeploymentManager::new(
        api,
        config.app.image.clone(),
        config.app.container_port,
    );

    // Initial replicas: load balancing starts with one per worker, the
    // other scenarios with only the bootstrap worker populated
    match config.scenario {
        Scenario::LoadBalancing => {
            let nodes: Vec<NodeId> = workers.keys().copied().collect();
            for node in nodes {
                let name = worker_name(&config.cluster, node);
                manager.create(&config.app.name, &name, node).await;
            }
        }
        _ => {
            if workers.contains_key(&1) {
                let name = worker_name(&config.cluster, 1);
                manager.create(&config.app.name, &name, 1).await;
            } else {
                warn!("no bootstrap worker (node 1), skipping initial deployment");
            }
        }
    }

    let vehicles = seed_vehicles(topology.vehicle_count());
    let sdn = Arc::new(SdnClient::new(&config.sdn_url));
    let ctx = ScenarioContext {
        topology: topology.clone(),
        vehicles: vehicles.clone(),
        sdn,
        workers,
        cluster: config.cluster.clone(),
        app: config.app.name.clone(),
        range: DEFAULT_RANGE,
    };

    let probe: Option<Arc<dyn AttachmentProbe>> = if config.use_attachment_probe {
        Some(Arc::new(IwProbe::new(&topology)))
    } else {
        None
    };
    let tracker = VehicleTracker::new(
        topology,
        vehicles,
        config.telemetry_dir.clone(),
        probe,
        config.scenario == Scenario::LoadBalancing,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tracker_task = tokio::spawn(tracker.run(shutdown_rx.clone()));

    let controller_task = match config.scenario {
        Scenario::SingleFlow => {
            let controller = SingleFlowController::new(ctx, manager, config.heading);
            tokio::spawn(controller.run(shutdown_rx))
        }
        Scenario::LoadBalancing => {
            // The manager's job here ends with the initial seeding; the
            // balancing itself only moves flows
            drop(manager);
            let controller =
                LoadBalancingController::new(ctx, &config.visualization_path, &config.lb_log_path)?;
            tokio::spawn(controller.run(shutdown_rx))
        }
        Scenario::MobilityReactive | Scenario::MobilityPredictive => {
            let variant = if config.scenario == Scenario::MobilityReactive {
                MobilityVariant::Reactive
            } else {
                MobilityVariant::Predictive
            };
            let controller = MobilityController::new(
                ctx,
                manager,
                variant,
                config.max_deployments,
                &config.visualization_path,
                &config.vehicle_dump_path,
            );
            tokio::spawn(controller.run(shutdown_rx))
        }
    };

    info!("run started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    let _ = tracker_task.await;
    let _ = controller_task.await;
    Ok(())
}
