//! HTTP webhook variants of the controller hooks.
//!
//! Each hook posts a JSON request to its configured endpoint and
//! decodes the response. A hook with no endpoint configured falls back
//! to the no-op behavior for that hook only. Transport failures,
//! non-2xx statuses, and undecodable bodies are controller errors and
//! abort the tick; a well-formed `"Status": "error"` monitoring body is
//! a verdict, not an error.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::controller::{MonitoringController, MonitoringVerdict, TargetController};
use crate::error::{EngineError, EngineResult};
use crate::types::ClientState;

// ── Wire shapes ────────────────────────────────────────────────────

/// Request for the selection hook; `selection` is how many targets the
/// engine wants back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TargetSelectionRequest {
    pub targets: Vec<ClientState>,
    pub selection: usize,
}

/// Response to the selection hook: a subset of (or replacement for) the
/// offered targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TargetSelectionResponse {
    pub targets: Vec<ClientState>,
}

/// Approval shares the selection request/response shape; `selection`
/// carries the offered count.
pub type TargetApprovalRequest = TargetSelectionRequest;
pub type TargetApprovalResponse = TargetSelectionResponse;

/// Removal shares the selection shape; `selection` is the count to
/// remove.
pub type TargetRemovalRequest = TargetSelectionRequest;
pub type TargetRemovalResponse = TargetSelectionResponse;

/// Request for the per-target monitoring hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TargetMonitoringRequest {
    pub target: ClientState,
}

/// Monitoring verdict body: `status` is `"ok"` or `"error"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TargetMonitoringResponse {
    pub status: String,
    pub message: String,
}

/// Request for the fleet-level external monitoring hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExternalMonitoringRequest {
    pub targets: Vec<ClientState>,
}

/// External monitoring shares the per-target verdict shape.
pub type ExternalMonitoringResponse = TargetMonitoringResponse;

// ── Controllers ────────────────────────────────────────────────────

/// Per-hook endpoints for a webhook target controller. An empty
/// endpoint disables the webhook for that hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WebhookTargetEndpoints {
    pub selection_endpoint: String,
    pub approval_endpoint: String,
    pub monitoring_endpoint: String,
    pub removal_endpoint: String,
}

/// Endpoint for a webhook monitoring controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WebhookMonitoringEndpoint {
    pub external_monitoring_endpoint: String,
}

fn webhook_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .expect("failed to build webhook client")
}

async fn post_json<Req, Resp>(
    client: &reqwest::Client,
    endpoint: &str,
    request: &Req,
) -> EngineResult<Resp>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let response = client
        .post(endpoint)
        .json(request)
        .send()
        .await
        .map_err(|e| EngineError::Controller(format!("webhook {endpoint} failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::Controller(format!(
            "webhook {endpoint} returned status {status}"
        )));
    }

    response.json::<Resp>().await.map_err(|e| {
        EngineError::Controller(format!("webhook {endpoint} returned undecodable body: {e}"))
    })
}

fn verdict_from(status: &str) -> MonitoringVerdict {
    if status == "ok" {
        MonitoringVerdict::Ok
    } else {
        MonitoringVerdict::Failing
    }
}

/// Target controller that consults per-hook HTTP endpoints.
pub struct WebhookTargetController {
    endpoints: WebhookTargetEndpoints,
    client: reqwest::Client,
}

impl WebhookTargetController {
    pub fn new(endpoints: WebhookTargetEndpoints) -> Self {
        Self {
            endpoints,
            client: webhook_client(),
        }
    }
}

#[async_trait]
impl TargetController for WebhookTargetController {
    async fn target_selection(
        &self,
        targets: Vec<ClientState>,
        selection: usize,
    ) -> EngineResult<Vec<ClientState>> {
        let endpoint = &self.endpoints.selection_endpoint;
        if endpoint.is_empty() {
            return Ok(targets.into_iter().take(selection).collect());
        }
        let request = TargetSelectionRequest { targets, selection };
        let response: TargetSelectionResponse =
            post_json(&self.client, endpoint, &request).await?;
        debug!(endpoint, selected = response.targets.len(), "webhook selection");
        Ok(response.targets)
    }

    async fn target_approval(
        &self,
        targets: Vec<ClientState>,
    ) -> EngineResult<Vec<ClientState>> {
        let endpoint = &self.endpoints.approval_endpoint;
        if endpoint.is_empty() {
            return Ok(targets);
        }
        let request = TargetApprovalRequest {
            selection: targets.len(),
            targets,
        };
        let response: TargetApprovalResponse =
            post_json(&self.client, endpoint, &request).await?;
        debug!(endpoint, approved = response.targets.len(), "webhook approval");
        Ok(response.targets)
    }

    async fn target_monitoring(&self, target: &ClientState) -> EngineResult<MonitoringVerdict> {
        let endpoint = &self.endpoints.monitoring_endpoint;
        if endpoint.is_empty() {
            return Ok(MonitoringVerdict::Ok);
        }
        let request = TargetMonitoringRequest {
            target: target.clone(),
        };
        let response: TargetMonitoringResponse =
            post_json(&self.client, endpoint, &request).await?;
        debug!(endpoint, target = %target.name, status = %response.status, "webhook monitoring");
        Ok(verdict_from(&response.status))
    }

    async fn target_removal(
        &self,
        targets: Vec<ClientState>,
        selection: usize,
    ) -> EngineResult<Vec<ClientState>> {
        let endpoint = &self.endpoints.removal_endpoint;
        if endpoint.is_empty() {
            return Ok(Vec::new());
        }
        let request = TargetRemovalRequest { targets, selection };
        let response: TargetRemovalResponse =
            post_json(&self.client, endpoint, &request).await?;
        debug!(endpoint, removed = response.targets.len(), "webhook removal");
        Ok(response.targets)
    }
}

/// Monitoring controller that consults an HTTP endpoint.
pub struct WebhookMonitoringController {
    endpoint: WebhookMonitoringEndpoint,
    client: reqwest::Client,
}

impl WebhookMonitoringController {
    pub fn new(endpoint: WebhookMonitoringEndpoint) -> Self {
        Self {
            endpoint,
            client: webhook_client(),
        }
    }
}

#[async_trait]
impl MonitoringController for WebhookMonitoringController {
    async fn external_monitoring(
        &self,
        targets: &[ClientState],
    ) -> EngineResult<MonitoringVerdict> {
        let endpoint = &self.endpoint.external_monitoring_endpoint;
        if endpoint.is_empty() {
            return Ok(MonitoringVerdict::Ok);
        }
        let request = ExternalMonitoringRequest {
            targets: targets.to_vec(),
        };
        let response: ExternalMonitoringResponse =
            post_json(&self.client, endpoint, &request).await?;
        debug!(endpoint, status = %response.status, "webhook external monitoring");
        Ok(verdict_from(&response.status))
    }
}
