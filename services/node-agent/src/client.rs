//! Control plane API client for the node agent.
//!
//! The allocation plane only pushes: every composed snapshot goes upstream
//! through the updater callback, which this client implements over HTTP.
//! Report failures are logged and dropped; the server reconciles from its
//! own state on the next pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use skiff_id::{AllocId, DeployId};
use skiff_model::{AllocDeploymentStatus, Allocation, ClientStatus, TaskState};
use tracing::{debug, error};

use crate::alloc::AllocUpdaterFn;
use crate::config::Config;

/// Status of one allocation as reported to the control plane.
#[derive(Debug, Serialize, Deserialize)]
pub struct AllocStatusReport {
    pub alloc_id: AllocId,
    pub client_status: ClientStatus,
    pub client_description: String,
    pub alloc_modify_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeployId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_status: Option<AllocDeploymentStatus>,
    pub task_states: BTreeMap<String, TaskState>,
}

impl AllocStatusReport {
    pub fn from_alloc(alloc: &Allocation) -> Self {
        Self {
            alloc_id: alloc.id,
            client_status: alloc.client_status,
            client_description: alloc.client_description.clone(),
            alloc_modify_index: alloc.alloc_modify_index,
            deployment_id: alloc.deployment_id,
            deployment_status: alloc.deployment_status.clone(),
            task_states: alloc.task_states.clone(),
        }
    }
}

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    node_id: String,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.control_plane_url.clone(),
            node_id: config.node_id.to_string(),
        })
    }

    /// Report an allocation's status to the control plane.
    pub async fn report_alloc_status(&self, report: &AllocStatusReport) -> Result<()> {
        let url = format!(
            "{}/v1/nodes/{}/allocations/{}/status",
            self.base_url, self.node_id, report.alloc_id
        );
        debug!(
            alloc_id = %report.alloc_id,
            status = %report.client_status,
            "Reporting allocation status"
        );

        let response = self.client.post(&url).json(report).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to report allocation status");
            anyhow::bail!("failed to report allocation status: {} - {}", status, body);
        }

        Ok(())
    }

    /// Wrap this client as an allocation runner updater callback. Reports
    /// are sent in the background; failures are logged and dropped.
    pub fn into_updater(self: Arc<Self>) -> AllocUpdaterFn {
        Arc::new(move |alloc: Allocation| {
            let client = self.clone();
            let report = AllocStatusReport::from_alloc(&alloc);
            tokio::spawn(async move {
                if let Err(e) = client.report_alloc_status(&report).await {
                    error!(
                        alloc_id = %report.alloc_id,
                        error = %e,
                        "Failed to push allocation status"
                    );
                }
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use skiff_id::{EvalId, JobId, NodeId};
    use skiff_model::{DesiredStatus, Job};

    use super::*;

    #[test]
    fn test_status_report_serialization() {
        let alloc = Allocation {
            id: AllocId::new(),
            node_id: NodeId::new(),
            job: Arc::new(Job {
                id: JobId::new(),
                name: "web".to_string(),
                task_groups: vec![],
            }),
            task_group: "g1".to_string(),
            eval_id: EvalId::new(),
            deployment_id: None,
            alloc_modify_index: 7,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            client_description: String::new(),
            task_states: BTreeMap::new(),
            deployment_status: None,
        };

        let report = AllocStatusReport::from_alloc(&alloc);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"running\""));
        assert!(json.contains("\"alloc_modify_index\":7"));
        // The job subtree never goes upstream.
        assert!(!json.contains("task_groups"));
    }

    #[test]
    fn test_status_report_roundtrip() {
        let json = r#"{
            "alloc_id": "alloc_01HV4Z2WQXKJNM8GPQY6VBKC3D",
            "client_status": "failed",
            "client_description": "missing task group 'g1'",
            "alloc_modify_index": 3,
            "task_states": {}
        }"#;
        let report: AllocStatusReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.client_status, ClientStatus::Failed);
        assert_eq!(report.alloc_modify_index, 3);
    }
}
