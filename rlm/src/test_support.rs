//! Test-only fakes for the response source and the orchestrator, plus a
//! config rooted in a temp directory.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::io::config::LoopConfig;
use crate::io::orchestrator::{
    ActionRequest, ActionResponse, ApplyRequest, ApplyResponse, Orchestrator, PatchRequest,
    PatchResponse,
};
use crate::io::source::{Prompt, ResponseSource};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Orchestrator that answers from a script and records every request.
#[derive(Default)]
pub struct ScriptedOrchestrator {
    action: Option<ActionResponse>,
    patch: Option<(String, bool)>,
    apply_refused: bool,
    actions: Mutex<Vec<ActionRequest>>,
    patches: Mutex<Vec<PatchRequest>>,
    applies: Mutex<Vec<ApplyRequest>>,
}

impl ScriptedOrchestrator {
    /// Answer every `ExecuteAction` with `response`.
    pub fn with_action(mut self, response: ActionResponse) -> Self {
        self.action = Some(response);
        self
    }

    /// Answer every `ProposePatch` with `patch_id`.
    pub fn with_patch(mut self, patch_id: &str, requires_hitl: bool) -> Self {
        self.patch = Some((patch_id.to_string(), requires_hitl));
        self
    }

    /// Answer `ApplyPatch` with `applied=false`.
    pub fn refusing_apply(mut self) -> Self {
        self.apply_refused = true;
        self
    }

    pub fn action_requests(&self) -> Vec<ActionRequest> {
        lock(&self.actions).clone()
    }

    pub fn patch_requests(&self) -> Vec<PatchRequest> {
        lock(&self.patches).clone()
    }

    pub fn apply_requests(&self) -> Vec<ApplyRequest> {
        lock(&self.applies).clone()
    }
}

impl Orchestrator for ScriptedOrchestrator {
    fn execute_action(&self, request: &ActionRequest) -> Result<ActionResponse> {
        lock(&self.actions).push(request.clone());
        Ok(self.action.clone().unwrap_or_else(|| ActionResponse {
            success: true,
            observation: format!("remote executed skill={}", request.skill_name),
            error: String::new(),
        }))
    }

    fn propose_patch(&self, request: &PatchRequest) -> Result<PatchResponse> {
        lock(&self.patches).push(request.clone());
        let (patch_id, requires_hitl) = self
            .patch
            .clone()
            .ok_or_else(|| anyhow!("no patch scripted"))?;
        Ok(PatchResponse {
            patch_id,
            proposed_code: "// patch".to_string(),
            requires_hitl,
        })
    }

    fn apply_patch(&self, request: &ApplyRequest) -> Result<ApplyResponse> {
        lock(&self.applies).push(request.clone());
        Ok(ApplyResponse {
            applied: !self.apply_refused,
            commit_reference: format!("commit-{}", request.patch_id),
        })
    }
}

/// Orchestrator whose transport always fails.
pub struct FailingOrchestrator;

impl Orchestrator for FailingOrchestrator {
    fn execute_action(&self, _request: &ActionRequest) -> Result<ActionResponse> {
        Err(anyhow!("connection refused"))
    }

    fn propose_patch(&self, _request: &PatchRequest) -> Result<PatchResponse> {
        Err(anyhow!("connection refused"))
    }

    fn apply_patch(&self, _request: &ApplyRequest) -> Result<ApplyResponse> {
        Err(anyhow!("connection refused"))
    }
}

/// Response source that replays queued bodies and records prompts.
#[derive(Default)]
pub struct ScriptedSource {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedSource {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a transport failure.
    pub fn failing(message: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::from([Err(message.to_string())])),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        lock(&self.prompts).clone()
    }
}

impl ResponseSource for ScriptedSource {
    fn respond(&self, prompt: &Prompt) -> Result<String> {
        lock(&self.prompts).push(prompt.clone());
        match lock(&self.replies).pop_front() {
            Some(Ok(body)) => Ok(body),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("script exhausted")),
        }
    }
}

/// Default config with every path under `root` and both logs enabled.
pub fn config_in(root: &Path) -> LoopConfig {
    let mut cfg = LoopConfig::default();
    cfg.skills.registry_dir = root.join("skills");
    cfg.paths.actions_log = Some(root.join("logs/actions.log"));
    cfg.paths.self_heal_log = Some(root.join("logs/self_heal.log"));
    cfg.paths.output_dir = root.join("output");
    cfg.paths.patch_path = root.join("output/self_patch.md");
    cfg.paths.review_test_dir = root.to_path_buf();
    cfg.paths.project_root = root.to_path_buf();
    cfg
}

/// Lines of a log file, or nothing when it was never created.
pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|contents| contents.lines().map(str::to_string).collect())
        .unwrap_or_default()
}
