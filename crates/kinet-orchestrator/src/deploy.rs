//! Deployment manager
//!
//! Wraps the orchestration adapter with a local cache of what is deployed
//! where, keyed by worker name. The cache keeps create idempotent (a replica
//! already on the cluster reconciles instead of erroring) and answers the
//! capacity questions the mobility reconciliation asks every tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use kinet_core::NodeId;

use crate::error::Result;
use crate::orchestration::{deployment_name, CreateOutcome, DeploymentSpec, WorkloadApi};

/// One deployment tracked on a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    /// App/selector label
    pub app: String,
    /// Generated deployment name
    pub name: String,
}

/// Local view of the cluster's deployments
pub struct DeploymentManager {
    api: Arc<dyn WorkloadApi>,
    image: String,
    container_port: u16,
    /// Worker name to deployments pinned there
    deployed: BTreeMap<String, Vec<DeploymentRecord>>,
}

impl DeploymentManager {
    pub fn new(api: Arc<dyn WorkloadApi>, image: impl Into<String>, container_port: u16) -> Self {
        Self {
            api,
            image: image.into(),
            container_port,
            deployed: BTreeMap::new(),
        }
    }

    /// Create a replica of `app` on `worker`. Idempotent: an existing remote
    /// object reconciles the cache and counts as success.
    pub async fn create(&mut self, app: &str, worker: &str, node: NodeId) -> CreateOutcome {
        let name = deployment_name(app, node);
        let spec = DeploymentSpec {
            name: name.clone(),
            app: app.to_string(),
            image: self.image.clone(),
            container_port: self.container_port,
            replicas: 1,
            node_name: worker.to_string(),
        };

        let outcome = self.api.create_deployment(&spec).await;
        match outcome {
            CreateOutcome::Created | CreateOutcome::AlreadyExists => {
                let records = self.deployed.entry(worker.to_string()).or_default();
                let record = DeploymentRecord {
                    app: app.to_string(),
                    name,
                };
                if !records.contains(&record) {
                    records.push(record);
                }
            }
            CreateOutcome::ReadError | CreateOutcome::UnexpectedError => {
                warn!(app, worker, "deployment create failed, skipping");
            }
        }
        outcome
    }

    /// Delete a deployment and drop everything tracked for its worker.
    pub async fn delete(&mut self, worker: &str, name: &str) -> Result<()> {
        info!(worker, name, "deleting deployment");
        self.api.delete_deployment(name).await?;
        self.deployed.remove(worker);
        Ok(())
    }

    /// True if `app` is tracked on `worker`
    pub fn is_deployed_at(&self, worker: &str, app: &str) -> bool {
        self.deployed
            .get(worker)
            .is_some_and(|records| records.iter().any(|r| r.app == app))
    }

    /// Number of workers with at least one tracked deployment
    pub fn deployment_count(&self) -> usize {
        self.deployed.len()
    }

    /// Worker name to app labels, for the reconciliation pass
    pub fn node_apps(&self) -> BTreeMap<String, Vec<String>> {
        self.deployed
            .iter()
            .map(|(worker, records)| {
                (
                    worker.clone(),
                    records.iter().map(|r| r.app.clone()).collect(),
                )
            })
            .collect()
    }

    /// Deployments tracked on a worker
    pub fn records_for(&self, worker: &str) -> &[DeploymentRecord] {
        self.deployed.get(worker).map(Vec::as_slice).unwrap_or(&[])
    }
}
