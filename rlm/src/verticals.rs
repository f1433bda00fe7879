//! Post-convergence side effects per use case.
//!
//! Each side effect goes through the dispatcher like any model-requested
//! action, so channel gating and auditing apply unchanged. Outcomes are
//! reported as summary lines; a failed side effect never blocks convergence.

use std::path::Path;

use chrono::Local;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::core::budget::truncate_chars;
use crate::core::types::{ActionSpec, DispatchResult};
use crate::dispatch::Dispatcher;
use crate::io::config::{LoopConfig, PathsConfig, UseCase};

const OUTCOME_OBS_CHARS: usize = 200;
const REVIEW_TEST_TIMEOUT_SECS: u64 = 30;
const SELF_PATCH_MARKERS: &[&str] = &["self-patch", "self_patch", "self patch"];

/// What a converged structured step hands to its use-case chain.
#[derive(Debug, Clone)]
pub struct ChainInput<'a> {
    pub query: &'a str,
    pub context: &'a str,
    pub thought: &'a str,
    pub depth: u32,
    pub reasoning_id: &'a str,
}

pub struct Verticals {
    use_case: UseCase,
    paths: PathsConfig,
    auto_evolve: bool,
}

impl Verticals {
    pub fn from_config(cfg: &LoopConfig) -> Self {
        Self {
            use_case: cfg.use_case,
            paths: cfg.paths.clone(),
            auto_evolve: cfg.auto_evolve,
        }
    }

    pub fn use_case(&self) -> UseCase {
        self.use_case
    }

    /// Run the chain for the configured use case; returns lines to append to the summary.
    pub fn run(&self, dispatcher: &Dispatcher, input: &ChainInput<'_>) -> Vec<String> {
        let stamp = timestamp();
        match self.use_case {
            UseCase::Generic => Vec::new(),
            UseCase::Codegen => {
                let path = self.paths.output_dir.join(format!("codegen_{stamp}.md"));
                let params = write_params(&path, input.thought);
                vec![self.step(dispatcher, input, "write_file_safe", params).0]
            }
            UseCase::CodeReview => {
                let mut lines = Vec::new();
                let (line, analysis) = self.step(
                    dispatcher,
                    input,
                    "analyze_code",
                    object(json!({"code": input.thought})),
                );
                lines.push(line);
                let (line, _) = self.step(
                    dispatcher,
                    input,
                    "run_tests",
                    object(json!({
                        "dir": self.paths.review_test_dir.to_string_lossy(),
                        "type": test_kind(&self.paths.review_test_dir),
                        "timeout_sec": REVIEW_TEST_TIMEOUT_SECS,
                    })),
                );
                lines.push(line);
                let path = self
                    .paths
                    .output_dir
                    .join("reviewed")
                    .join(format!("review_{stamp}.md"));
                let body = format!(
                    "# Review\n\n{}\n\n## Analysis\n\n{}\n",
                    input.thought, analysis.observation
                );
                let params = write_params(&path, &body);
                lines.push(self.step(dispatcher, input, "write_file_safe", params).0);
                lines
            }
            UseCase::Research => {
                if !mentions_self_patch(input.query) {
                    return Vec::new();
                }
                let body = format!("{}\n\n{}\n", input.context, input.thought);
                let mut params = write_params(&self.paths.patch_path, &body);
                params.insert("overwrite".to_string(), Value::Bool(true));
                let (line, result) = self.step(dispatcher, input, "write_file_safe", params);
                let mut lines = vec![line];
                if self.auto_evolve && result.success {
                    lines.push(format!(
                        "[AUTO_EVOLVE] patch={}",
                        self.paths.patch_path.display()
                    ));
                }
                lines
            }
        }
    }

    fn step(
        &self,
        dispatcher: &Dispatcher,
        input: &ChainInput<'_>,
        skill: &str,
        params: Map<String, Value>,
    ) -> (String, DispatchResult) {
        let action = ActionSpec::new(skill, params);
        let result = dispatcher.dispatch(&action, input.depth, input.reasoning_id, false);
        debug!(
            use_case = self.use_case.as_str(),
            skill,
            ok = result.success,
            "use-case side effect"
        );
        (outcome_line(self.use_case, skill, &result), result)
    }
}

fn outcome_line(use_case: UseCase, skill: &str, result: &DispatchResult) -> String {
    let obs = truncate_chars(&result.observation, OUTCOME_OBS_CHARS);
    if result.error.is_empty() {
        format!("[{}] {skill} ok={}; {obs}", use_case.as_str(), result.success)
    } else {
        format!(
            "[{}] {skill} ok={} err={}; {obs}",
            use_case.as_str(),
            result.success,
            result.error
        )
    }
}

fn write_params(path: &Path, content: &str) -> Map<String, Value> {
    object(json!({
        "path": path.to_string_lossy(),
        "content": content,
    }))
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn mentions_self_patch(query: &str) -> bool {
    let lowered = query.to_lowercase();
    SELF_PATCH_MARKERS.iter().any(|marker| lowered.contains(marker))
}

fn test_kind(dir: &Path) -> &'static str {
    if dir.join("Cargo.toml").is_file() {
        "rust"
    } else {
        "python"
    }
}

fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S_%3f").to_string()
}
