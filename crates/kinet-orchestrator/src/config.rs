//! Run configuration
//!
//! One JSON file describes a whole run: the scenario, the topology file, the
//! collaborator endpoints and the output paths. Missing files or malformed
//! values are fatal at startup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kinet_core::Heading;

use crate::error::{OrchestratorError, Result};

/// Which placement strategy drives the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    SingleFlow,
    LoadBalancing,
    MobilityReactive,
    MobilityPredictive,
}

/// Application to deploy on the worker nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// App/selector name, also the deployment name prefix
    pub name: String,

    /// Container image
    pub image: String,

    #[serde(default = "default_container_port")]
    pub container_port: u16,

    #[serde(default = "default_container_port")]
    pub target_port: u16,

    /// NodePort exposed by the service
    #[serde(default = "default_node_port")]
    pub node_port: u16,
}

fn default_container_port() -> u16 {
    80
}

fn default_node_port() -> u16 {
    30001
}

/// Run configuration, loaded from a single JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub scenario: Scenario,

    /// Static topology config (APs, node mapping, vehicle count)
    pub topology: PathBuf,

    /// Cluster name; worker names derive from it
    #[serde(default = "default_cluster")]
    pub cluster: String,

    pub app: AppConfig,

    /// SDN controller REST endpoint
    #[serde(default = "default_sdn_url")]
    pub sdn_url: String,

    /// Container orchestration REST endpoint
    #[serde(default = "default_orchestration_url")]
    pub orchestration_url: String,

    /// Directory holding the per-vehicle telemetry files
    #[serde(default = "default_telemetry_dir")]
    pub telemetry_dir: PathBuf,

    /// Visualization snapshot output
    #[serde(default = "default_visualization_path")]
    pub visualization_path: PathBuf,

    /// Per-tick vehicle table dump (mobility scenarios)
    #[serde(default = "default_vehicle_dump_path")]
    pub vehicle_dump_path: PathBuf,

    /// Load-balancing audit log
    #[serde(default = "default_lb_log_path")]
    pub lb_log_path: PathBuf,

    /// Cap on concurrently deployed replicas (mobility scenarios)
    #[serde(default = "default_max_deployments")]
    pub max_deployments: usize,

    /// Travel axis of the tracked vehicle (single-flow scenario)
    #[serde(default = "default_heading")]
    pub heading: Heading,

    /// Query AP attachment via the wireless tooling instead of nearest-AP
    #[serde(default)]
    pub use_attachment_probe: bool,
}

fn default_cluster() -> String {
    "kinet".to_string()
}

fn default_sdn_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_orchestration_url() -> String {
    "http://127.0.0.1:8001".to_string()
}

fn default_telemetry_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_visualization_path() -> PathBuf {
    PathBuf::from("visualization-data.json")
}

fn default_vehicle_dump_path() -> PathBuf {
    PathBuf::from("vehicle-data.json")
}

fn default_lb_log_path() -> PathBuf {
    PathBuf::from("load-balance.log")
}

fn default_max_deployments() -> usize {
    3
}

fn default_heading() -> Heading {
    Heading::West
}

impl RunConfig {
    /// Load and validate a run config. Fatal on any error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(&path)?;
        let config: RunConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cluster.is_empty() {
            return Err(OrchestratorError::config("cluster name must not be empty"));
        }
        if self.app.name.is_empty() {
            return Err(OrchestratorError::config("app name must not be empty"));
        }
        if self.max_deployments == 0 {
            return Err(OrchestratorError::config("max_deployments must be at least 1"));
        }
        if !self.topology.exists() {
            return Err(OrchestratorError::config(format!(
                "topology file not found: {}",
                self.topology.display()
            )));
        }
        Ok(())
    }
}
