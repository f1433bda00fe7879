//! Remote orchestrator client.
//!
//! The [`Orchestrator`] trait decouples dispatch and self-heal from the
//! transport. [`HttpOrchestrator`] speaks JSON over HTTP POST to
//! `<base>/rpc/<Method>` with a bounded timeout per call. Tests use scripted
//! orchestrators that never open a socket.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// `ExecuteAction` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub skill_name: String,
    pub params: BTreeMap<String, String>,
    pub depth: u32,
    pub reasoning_id: String,
    pub mock_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `ExecuteAction` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default)]
    pub observation: String,
    #[serde(default)]
    pub error: String,
}

/// `ProposePatch` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRequest {
    pub error_trace: String,
    pub component: String,
}

/// `ProposePatch` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchResponse {
    pub patch_id: String,
    #[serde(default)]
    pub proposed_code: String,
    #[serde(alias = "requires_human_approval")]
    pub requires_hitl: bool,
}

/// `ApplyPatch` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub patch_id: String,
    pub approved: bool,
    pub component: String,
    pub requires_hitl: bool,
}

/// `ApplyPatch` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    #[serde(alias = "success")]
    pub applied: bool,
    #[serde(default, alias = "commit_hash")]
    pub commit_reference: String,
}

/// The two RPC groups the core needs from the orchestrator.
pub trait Orchestrator: Send + Sync {
    fn execute_action(&self, request: &ActionRequest) -> Result<ActionResponse>;
    fn propose_patch(&self, request: &PatchRequest) -> Result<PatchResponse>;
    fn apply_patch(&self, request: &ApplyRequest) -> Result<ApplyResponse>;
}

/// JSON-over-HTTP orchestrator client.
pub struct HttpOrchestrator {
    base_url: String,
    client: Client,
}

impl HttpOrchestrator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build orchestrator http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn call<Req, Resp>(&self, method: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/rpc/{method}", self.base_url);
        debug!(%url, "orchestrator call");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .with_context(|| format!("{method} transport"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(anyhow!("{method} failed with {status}: {}", text.trim()));
        }
        response
            .json::<Resp>()
            .with_context(|| format!("{method} response body"))
    }
}

impl Orchestrator for HttpOrchestrator {
    #[instrument(
        skip_all,
        fields(skill = %request.skill_name, reasoning_id = %request.reasoning_id)
    )]
    fn execute_action(&self, request: &ActionRequest) -> Result<ActionResponse> {
        self.call("ExecuteAction", request)
    }

    #[instrument(skip_all, fields(component = %request.component))]
    fn propose_patch(&self, request: &PatchRequest) -> Result<PatchResponse> {
        self.call("ProposePatch", request)
    }

    #[instrument(skip_all, fields(patch_id = %request.patch_id))]
    fn apply_patch(&self, request: &ApplyRequest) -> Result<ApplyResponse> {
        self.call("ApplyPatch", request)
    }
}
