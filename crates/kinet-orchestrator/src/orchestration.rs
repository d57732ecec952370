//! Container orchestration adapter
//!
//! The cluster is external; this module only needs a narrow CRUD surface:
//! list the worker nodes, create/delete deployments, create the service.
//! `WorkloadApi` is the seam the scenarios and the deployment manager are
//! written against, so tests run against an in-memory fake.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kinet_core::NodeId;

use crate::error::Result;

/// Result of an idempotent create call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Object created on the cluster
    Created,
    /// Object already existed
    AlreadyExists,
    /// Existence check failed
    ReadError,
    /// Creation failed
    UnexpectedError,
}

/// Deployment to create on a specific worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Generated deployment name
    pub name: String,
    /// App/selector label
    pub app: String,
    /// Container image
    pub image: String,
    pub container_port: u16,
    pub replicas: u32,
    /// Worker the deployment is pinned to
    pub node_name: String,
}

/// NodePort-shaped service exposing the app
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// App/selector label
    pub app: String,
    pub port: u16,
    pub target_port: u16,
    pub node_port: u16,
}

/// Narrow orchestration contract
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Worker node name to IP address, control-plane entries excluded
    async fn list_nodes(&self) -> Result<BTreeMap<String, String>>;

    async fn create_deployment(&self, spec: &DeploymentSpec) -> CreateOutcome;

    async fn delete_deployment(&self, name: &str) -> Result<()>;

    async fn create_service(&self, spec: &ServiceSpec) -> CreateOutcome;
}

/// Cluster-assigned name of a worker node
pub fn worker_name(cluster: &str, node: NodeId) -> String {
    if node == 1 {
        format!("{cluster}-worker")
    } else {
        format!("{cluster}-worker{node}")
    }
}

/// Node id encoded in a worker name: the trailing character if it is a
/// digit, else 1 (the unnumbered bootstrap worker).
pub fn worker_id(name: &str) -> NodeId {
    name.chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .unwrap_or(1)
}

/// Generated deployment name for an app on a node
pub fn deployment_name(app: &str, node: NodeId) -> String {
    format!("{app}-deployment-{node}")
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    name: String,
    ip: String,
}

/// REST implementation of [`WorkloadApi`]
pub struct RestWorkloadApi {
    base_url: String,
    client: reqwest::Client,
}

impl RestWorkloadApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// GET-then-POST create: read the object first so a re-run against a
    /// populated cluster reconciles instead of failing.
    async fn create_object<T: Serialize>(&self, kind: &str, name: &str, spec: &T) -> CreateOutcome {
        let read = self.client.get(self.url(&format!("{kind}/{name}"))).send().await;
        match read {
            Ok(response) if response.status().is_success() => {
                return CreateOutcome::AlreadyExists;
            }
            Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {}
            Ok(response) => {
                warn!(name, status = %response.status(), "{kind} existence check failed");
                return CreateOutcome::ReadError;
            }
            Err(e) => {
                warn!(name, "{kind} existence check failed: {e}");
                return CreateOutcome::ReadError;
            }
        }

        match self.client.post(self.url(kind)).json(spec).send().await {
            Ok(response) if response.status().is_success() => CreateOutcome::Created,
            Ok(response) => {
                warn!(name, status = %response.status(), "{kind} create rejected");
                CreateOutcome::UnexpectedError
            }
            Err(e) => {
                warn!(name, "{kind} create failed: {e}");
                CreateOutcome::UnexpectedError
            }
        }
    }
}

#[async_trait]
impl WorkloadApi for RestWorkloadApi {
    async fn list_nodes(&self) -> Result<BTreeMap<String, String>> {
        let response = self.client.get(self.url("nodes")).send().await?;
        let entries: Vec<NodeEntry> = response.error_for_status()?.json().await?;

        let workers = entries
            .into_iter()
            .filter(|n| !n.name.contains("control-plane"))
            .map(|n| (n.name, n.ip))
            .collect();
        Ok(workers)
    }

    async fn create_deployment(&self, spec: &DeploymentSpec) -> CreateOutcome {
        debug!(name = %spec.name, node = %spec.node_name, "creating deployment");
        self.create_object("deployments", &spec.name, spec).await
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("deployments/{name}")))
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(name, status = %response.status(), "deployment delete rejected");
        }
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> CreateOutcome {
        self.create_object("services", &spec.name, spec).await
    }
}
