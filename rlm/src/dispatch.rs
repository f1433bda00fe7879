//! Action dispatch across the remote, local, mock and bare channels.
//!
//! The channel is chosen per call by strict priority (see
//! [`select_channel`]). A failure on the chosen channel is reported as a
//! categorized `DispatchResult`; there is no retry and no fallback to
//! another channel. Every call writes an `EXECUTING:` and an `OBSERVATION:`
//! audit line.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::core::budget::truncate_chars;
use crate::core::selector::{Channel, select_channel};
use crate::core::types::{ActionSpec, DispatchResult};
use crate::io::audit::AuditLog;
use crate::io::config::LoopConfig;
use crate::io::orchestrator::{ActionRequest, Orchestrator};
use crate::skills::builtin::{GENERIC_SKILL_MANIFEST, peek_lines, save_manifest};
use crate::skills::manifest::sanitize_skill_name;
use crate::skills::{SkillError, SkillRegistry};

const OBSERVATION_LOG_CHARS: usize = 200;
const BARE_PEEK_DEFAULT_END: usize = 100;

/// Dispatch flags, copied from the config snapshot.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub remote_enabled: bool,
    pub local_enabled: bool,
    pub real_dispatch: bool,
    pub local_allow_list: BTreeSet<String>,
    pub rpc_timeout_ms: u64,
    pub peek_max_chars: usize,
}

impl DispatchPolicy {
    pub fn from_config(cfg: &LoopConfig) -> Self {
        Self {
            remote_enabled: cfg.dispatch.remote_enabled,
            local_enabled: cfg.dispatch.local_enabled,
            real_dispatch: cfg.dispatch.real_dispatch,
            local_allow_list: cfg.dispatch.local_allow_list.iter().cloned().collect(),
            rpc_timeout_ms: cfg.dispatch.rpc_timeout_secs.saturating_mul(1000),
            peek_max_chars: cfg.peek_max_chars,
        }
    }
}

pub struct Dispatcher {
    policy: DispatchPolicy,
    registry: Arc<SkillRegistry>,
    remote: Option<Arc<dyn Orchestrator>>,
    audit: Arc<AuditLog>,
}

impl Dispatcher {
    pub fn new(
        policy: DispatchPolicy,
        registry: Arc<SkillRegistry>,
        remote: Option<Arc<dyn Orchestrator>>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            policy,
            registry,
            remote,
            audit,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    #[instrument(
        skip_all,
        fields(skill = %action.skill_name, depth = depth, mock_mode = mock_mode)
    )]
    pub fn dispatch(
        &self,
        action: &ActionSpec,
        depth: u32,
        reasoning_id: &str,
        mock_mode: bool,
    ) -> DispatchResult {
        self.audit.append(&format!(
            "EXECUTING: {} mock={mock_mode} reasoning_id={reasoning_id}",
            action.skill_name
        ));

        let channel = select_channel(
            self.policy.remote_enabled,
            self.policy.local_enabled,
            mock_mode,
        );
        debug!(channel = channel.as_str(), "dispatching");
        let result = match channel {
            Channel::Remote => self.dispatch_remote(action, depth, reasoning_id, mock_mode),
            Channel::Local => self.dispatch_local(action),
            Channel::Mock => DispatchResult::ok(format!(
                "Observation: mock executed skill={}",
                action.skill_name
            )),
            Channel::Bare => self.dispatch_bare(action),
        };

        self.audit.append(&format!(
            "OBSERVATION: ok={} err={} obs={}",
            result.success,
            result.error,
            truncate_chars(&result.observation, OBSERVATION_LOG_CHARS)
        ));
        result
    }

    fn dispatch_remote(
        &self,
        action: &ActionSpec,
        depth: u32,
        reasoning_id: &str,
        mock_mode: bool,
    ) -> DispatchResult {
        let Some(remote) = &self.remote else {
            return DispatchResult::failed(
                "Action failed",
                "rpc_error:orchestrator client not configured",
            );
        };
        let request = ActionRequest {
            skill_name: action.skill_name.clone(),
            params: stringify_params(&action.params),
            depth,
            reasoning_id: reasoning_id.to_string(),
            mock_mode,
            timeout_ms: self.policy.real_dispatch.then_some(self.policy.rpc_timeout_ms),
        };
        match remote.execute_action(&request) {
            Ok(response) if response.success => DispatchResult::ok(response.observation),
            Ok(response) => DispatchResult::failed(response.observation, response.error),
            Err(err) => DispatchResult::failed("Action failed", format!("rpc_error:{err:#}")),
        }
    }

    fn dispatch_local(&self, action: &ActionSpec) -> DispatchResult {
        if !self.policy.local_enabled {
            return DispatchResult::failed("Local dispatch disabled", "local_dispatch_disabled");
        }
        if !self.policy.local_allow_list.contains(&action.skill_name) {
            return DispatchResult::failed("Local dispatch denied", "local_dispatch_denied");
        }
        let handle = match self.registry.resolve(&action.skill_name) {
            Ok(handle) => handle,
            Err(err) => return DispatchResult::failed("Action failed", local_error(&err)),
        };
        // A manifest may bind an allowed name to any entry point; gate the entry too.
        if !self.policy.local_allow_list.contains(&handle.entry) {
            debug!(entry = %handle.entry, "manifest entry not allow-listed");
            return DispatchResult::failed("Local dispatch denied", "local_dispatch_denied");
        }
        match self.registry.invoke(&handle, &action.params) {
            Ok(observation) => DispatchResult::ok(observation),
            Err(err) => DispatchResult::failed("Action failed", local_error(&err)),
        }
    }

    fn dispatch_bare(&self, action: &ActionSpec) -> DispatchResult {
        let params = &action.params;
        match action.skill_name.as_str() {
            "peek_file" => {
                let path = param_str(params, "path")
                    .or_else(|| param_str(params, "file_path"))
                    .unwrap_or_default();
                let start = param_usize(params, "start").unwrap_or(0);
                let end = param_usize(params, "end").unwrap_or(BARE_PEEK_DEFAULT_END);
                let snippet = peek_lines(Path::new(&path), start, end);
                DispatchResult::ok(truncate_chars(&snippet, self.policy.peek_max_chars))
            }
            "save_skill" => {
                let filename =
                    param_str(params, "filename").unwrap_or_else(|| "new_skill".to_string());
                let code = param_str(params, "code")
                    .unwrap_or_else(|| GENERIC_SKILL_MANIFEST.to_string());
                match save_manifest(self.registry.context(), &filename, &code) {
                    Ok(_) => DispatchResult::ok(format!("Saved skill: {filename}")),
                    Err(err) => DispatchResult::failed("Action failed", format!("{err:#}")),
                }
            }
            "execute_skill" => {
                let name = param_str(params, "skill_name")
                    .or_else(|| param_str(params, "filename"))
                    .and_then(|raw| sanitize_skill_name(&raw))
                    .unwrap_or_default();
                let inner = match params.get("params") {
                    Some(Value::Object(map)) => map.clone(),
                    _ => Map::new(),
                };
                match self.registry.execute(&name, &inner) {
                    Ok(observation) => DispatchResult::ok(observation),
                    Err(err) => {
                        DispatchResult::failed("Action failed", format!("{}:{err}", err.code()))
                    }
                }
            }
            other => DispatchResult::failed("Unknown skill", format!("unknown_skill:{other}")),
        }
    }
}

fn local_error(err: &SkillError) -> String {
    format!("local_error:{}:{err}", err.code())
}

/// Remote params are flat strings; non-string values travel as compact JSON.
fn stringify_params(params: &Map<String, Value>) -> BTreeMap<String, String> {
    params
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect()
}

fn param_str(params: &Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Null | Value::String(_) => None,
        other => Some(other.to_string()),
    }
}

fn param_usize(params: &Map<String, Value>, key: &str) -> Option<usize> {
    match params.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::orchestrator::ActionResponse;
    use crate::skills::builtin::{default_registry, write_default_manifests};
    use crate::test_support::{FailingOrchestrator, ScriptedOrchestrator, config_in, read_lines};
    use serde_json::json;
    use std::fs;

    struct Fixture {
        temp: tempfile::TempDir,
        cfg: LoopConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let cfg = config_in(temp.path());
            Self { temp, cfg }
        }

        fn dispatcher(&self, remote: Option<Arc<dyn Orchestrator>>) -> Dispatcher {
            let registry = default_registry(&self.cfg).expect("registry");
            write_default_manifests(&registry, false).expect("manifests");
            let audit =
                AuditLog::from_optional(self.cfg.paths.actions_log.as_deref()).expect("audit");
            Dispatcher::new(
                DispatchPolicy::from_config(&self.cfg),
                Arc::new(registry),
                remote,
                Arc::new(audit),
            )
        }

        fn audit_lines(&self) -> Vec<String> {
            read_lines(self.cfg.paths.actions_log.as_deref().expect("actions log"))
        }

        fn file(&self, name: &str, body: &str) -> String {
            let path = self.temp.path().join(name);
            fs::write(&path, body).expect("write");
            path.to_string_lossy().into_owned()
        }
    }

    fn action(skill: &str, params: Value) -> ActionSpec {
        match params {
            Value::Object(map) => ActionSpec::new(skill, map),
            _ => ActionSpec::new(skill, Map::new()),
        }
    }

    #[test]
    fn mock_channel_does_no_io_and_audits() {
        let fx = Fixture::new();
        let result = fx
            .dispatcher(None)
            .dispatch(&action("anything", json!({})), 0, "rid-1", true);
        assert_eq!(result, DispatchResult::ok("Observation: mock executed skill=anything"));
        assert_eq!(
            fx.audit_lines(),
            vec![
                "EXECUTING: anything mock=true reasoning_id=rid-1",
                "OBSERVATION: ok=true err= obs=Observation: mock executed skill=anything",
            ]
        );
    }

    #[test]
    fn remote_channel_wins_and_stringifies_params() {
        let mut fx = Fixture::new();
        fx.cfg.dispatch.remote_enabled = true;
        fx.cfg.dispatch.local_enabled = true;
        fx.cfg.dispatch.real_dispatch = true;
        let remote = Arc::new(ScriptedOrchestrator::default());
        let result = fx.dispatcher(Some(remote.clone())).dispatch(
            &action("peek_file", json!({"path": "a.txt", "end": 5})),
            2,
            "rid",
            true,
        );
        assert_eq!(result, DispatchResult::ok("remote executed skill=peek_file"));
        let sent = remote.action_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].params["path"], "a.txt");
        assert_eq!(sent[0].params["end"], "5");
        assert_eq!(sent[0].depth, 2);
        assert!(sent[0].mock_mode);
        assert_eq!(sent[0].timeout_ms, Some(10_000));
    }

    #[test]
    fn remote_failure_passes_through_or_maps_to_rpc_error() {
        let mut fx = Fixture::new();
        fx.cfg.dispatch.remote_enabled = true;
        let remote = Arc::new(ScriptedOrchestrator::default().with_action(ActionResponse {
            success: false,
            observation: "blocked".to_string(),
            error: "policy_denied".to_string(),
        }));
        let result = fx
            .dispatcher(Some(remote))
            .dispatch(&action("x", json!({})), 0, "rid", false);
        assert_eq!(result, DispatchResult::failed("blocked", "policy_denied"));

        let result = fx
            .dispatcher(Some(Arc::new(FailingOrchestrator)))
            .dispatch(&action("x", json!({})), 0, "rid", false);
        assert!(!result.success);
        assert!(result.error.starts_with("rpc_error:"));
        assert!(result.error.contains("connection refused"));
    }

    #[test]
    fn local_channel_runs_allow_listed_skill() {
        let mut fx = Fixture::new();
        fx.cfg.dispatch.local_enabled = true;
        let path = fx.file("a.txt", "hello world");
        let result = fx.dispatcher(None).dispatch(
            &action("peek_file", json!({"path": path, "start": 0, "end": 5})),
            0,
            "rid",
            false,
        );
        assert_eq!(result, DispatchResult::ok("hello"));
    }

    #[test]
    fn local_channel_denies_unlisted_skill_even_with_mock() {
        let mut fx = Fixture::new();
        fx.cfg.dispatch.local_enabled = true;
        let result = fx
            .dispatcher(None)
            .dispatch(&action("write_file_safe", json!({})), 0, "rid", true);
        assert_eq!(
            result,
            DispatchResult::failed("Local dispatch denied", "local_dispatch_denied")
        );
    }

    #[test]
    fn local_channel_gates_the_manifest_entry() {
        let mut fx = Fixture::new();
        fx.cfg.dispatch.local_enabled = true;
        let dispatcher = fx.dispatcher(None);
        let target = fx.temp.path().join("x.txt");

        let rebind = dispatcher.dispatch(
            &action(
                "save_skill",
                json!({"filename": "peek_file", "code": "entry = \"write_file_safe\"\n"}),
            ),
            0,
            "rid",
            false,
        );
        assert!(rebind.observation.starts_with("[save_skill] Write failed"));

        // A manifest written out of band is still refused at dispatch time.
        fs::write(
            fx.cfg.skills.registry_dir.join("peek_file.toml"),
            "entry = \"write_file_safe\"\n",
        )
        .expect("rebind manifest");
        let result = dispatcher.dispatch(
            &action(
                "peek_file",
                json!({"path": target.to_string_lossy(), "content": "pwned"}),
            ),
            0,
            "rid",
            false,
        );
        assert_eq!(
            result,
            DispatchResult::failed("Local dispatch denied", "local_dispatch_denied")
        );
        assert!(!target.exists());
    }

    #[test]
    fn local_registry_errors_are_categorized() {
        let mut fx = Fixture::new();
        fx.cfg.dispatch.local_enabled = true;
        fx.cfg.dispatch.local_allow_list = vec!["peek_file".to_string(), "ghost".to_string()];
        let dispatcher = fx.dispatcher(None);

        let result = dispatcher.dispatch(&action("ghost", json!({})), 0, "rid", false);
        assert!(result.error.starts_with("local_error:skill_not_found:"));

        let result =
            dispatcher.dispatch(&action("peek_file", json!({"start": 1})), 0, "rid", false);
        assert!(result.error.starts_with("local_error:params_validation_error:"));
    }

    #[test]
    fn bare_peek_is_line_based_and_capped() {
        let mut fx = Fixture::new();
        fx.cfg.peek_max_chars = 6;
        let path = fx.file("lines.txt", "one\ntwo\nthree\n");
        let dispatcher = fx.dispatcher(None);
        let result = dispatcher.dispatch(
            &action("peek_file", json!({"file_path": path, "start": 1, "end": "3"})),
            0,
            "rid",
            false,
        );
        assert_eq!(result, DispatchResult::ok("two\nth"));
    }

    #[test]
    fn bare_save_and_execute_skill() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(None);
        let result = dispatcher.dispatch(
            &action(
                "save_skill",
                json!({
                    "filename": "head.py",
                    "code": "entry = \"peek_file\"\n[defaults]\nend = 4\n"
                }),
            ),
            0,
            "rid",
            false,
        );
        assert_eq!(result, DispatchResult::ok("Saved skill: head.py"));

        let path = fx.file("note.txt", "abcdefgh");
        let result = dispatcher.dispatch(
            &action("execute_skill", json!({"skill_name": "head", "params": {"path": path}})),
            0,
            "rid",
            false,
        );
        assert_eq!(result, DispatchResult::ok("abcd"));

        let result = dispatcher.dispatch(
            &action("execute_skill", json!({"skill_name": "missing"})),
            0,
            "rid",
            false,
        );
        assert!(result.error.starts_with("skill_not_found:"));
    }

    #[test]
    fn bare_unknown_skill_fails() {
        let fx = Fixture::new();
        let result = fx
            .dispatcher(None)
            .dispatch(&action("launch_rockets", json!({})), 0, "rid", false);
        assert_eq!(result, DispatchResult::failed("Unknown skill", "unknown_skill:launch_rockets"));
        let lines = fx.audit_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "OBSERVATION: ok=false err=unknown_skill:launch_rockets obs=Unknown skill"
        );
    }
}
