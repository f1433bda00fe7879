//! Orchestration for a single reasoning step.
//!
//! [`Engine::run_step`] takes one [`Query`] and always returns a [`Summary`]:
//! depth check, context trim, mode selection (mock, structured, unstructured),
//! then dispatch and synthesis. Errors and panics escaping a step are
//! reported through self-heal and turned into a non-converged summary.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::budget::{trim_context, truncate_chars};
use crate::core::codec;
use crate::core::selector::{StepMode, StepPolicy, select_step_mode};
use crate::core::types::{ActionSpec, Query, Summary};
use crate::dispatch::{DispatchPolicy, Dispatcher};
use crate::io::audit::AuditLog;
use crate::io::config::LoopConfig;
use crate::io::orchestrator::{HttpOrchestrator, Orchestrator};
use crate::io::prompt::PromptBuilder;
use crate::io::source::{CompletionSource, Prompt, ResponseSource, StubSource};
use crate::self_heal::{LOOP_COMPONENT, SelfHealReporter};
use crate::skills::builtin::{GENERIC_SKILL_MANIFEST, default_registry, peek_lines, save_manifest};
use crate::skills::{SkillRegistry, panic_message};
use crate::verticals::{ChainInput, Verticals};

const SELF_HEAL_SUMMARY_CHARS: usize = 500;
const UNSTRUCTURED_PEEK_LINES: usize = 50;

/// External collaborators of the engine. Tests substitute scripted ones.
pub struct Adapters {
    pub registry: SkillRegistry,
    /// Used for dispatch when remote dispatch is on and for self-heal when enabled.
    pub orchestrator: Option<Arc<dyn Orchestrator>>,
    /// Live completion backend; ignored unless outbound calls are allowed.
    pub completion: Option<Arc<dyn ResponseSource>>,
}

impl Adapters {
    /// Real adapters: built-in registry, HTTP orchestrator and completion client as configured.
    pub fn from_config(cfg: &LoopConfig) -> Result<Self> {
        let registry = default_registry(cfg).context("build skill registry")?;
        let orchestrator: Option<Arc<dyn Orchestrator>> =
            if cfg.dispatch.remote_enabled || cfg.orchestrator.self_heal_via_remote {
                Some(Arc::new(HttpOrchestrator::new(
                    &cfg.orchestrator.url,
                    Duration::from_secs(cfg.dispatch.rpc_timeout_secs),
                )?))
            } else {
                None
            };
        let completion: Option<Arc<dyn ResponseSource>> = if cfg.completion_enabled() {
            Some(Arc::new(CompletionSource::from_config(&cfg.completion)?))
        } else {
            None
        };
        Ok(Self {
            registry,
            orchestrator,
            completion,
        })
    }
}

pub struct Engine {
    cfg: LoopConfig,
    registry: Arc<SkillRegistry>,
    dispatcher: Dispatcher,
    /// Stub first, then live completion.
    structured_source: Option<Arc<dyn ResponseSource>>,
    /// Live completion only; used by unstructured delegation.
    delegate: Option<Arc<dyn ResponseSource>>,
    audit: Arc<AuditLog>,
    self_heal: SelfHealReporter,
    prompts: PromptBuilder,
    verticals: Verticals,
}

impl Engine {
    pub fn from_config(cfg: LoopConfig) -> Result<Self> {
        let adapters = Adapters::from_config(&cfg)?;
        Self::with_adapters(cfg, adapters)
    }

    pub fn with_adapters(cfg: LoopConfig, adapters: Adapters) -> Result<Self> {
        cfg.validate()?;
        let audit = Arc::new(AuditLog::from_optional(cfg.paths.actions_log.as_deref())?);
        let self_heal_log = AuditLog::from_optional(cfg.paths.self_heal_log.as_deref())?;
        let registry = Arc::new(adapters.registry);

        let dispatch_remote = adapters
            .orchestrator
            .clone()
            .filter(|_| cfg.dispatch.remote_enabled);
        let heal_remote = adapters
            .orchestrator
            .filter(|_| cfg.orchestrator.self_heal_via_remote);
        let delegate = adapters.completion.filter(|_| cfg.allow_outbound);
        let stub: Option<Arc<dyn ResponseSource>> = cfg
            .stub_response
            .as_ref()
            .map(|body| Arc::new(StubSource::new(body.clone())) as Arc<dyn ResponseSource>);
        let structured_source = stub.or_else(|| delegate.clone());

        let dispatcher = Dispatcher::new(
            DispatchPolicy::from_config(&cfg),
            Arc::clone(&registry),
            dispatch_remote,
            Arc::clone(&audit),
        );
        let prompts = PromptBuilder::new(&cfg.system_prompt, cfg.use_case);
        let verticals = Verticals::from_config(&cfg);
        Ok(Self {
            registry,
            dispatcher,
            structured_source,
            delegate,
            audit,
            self_heal: SelfHealReporter::new(self_heal_log, heal_remote),
            prompts,
            verticals,
            cfg,
        })
    }

    pub fn config(&self) -> &LoopConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run one step. Never fails and never panics outward.
    #[instrument(skip_all, fields(depth = query.depth))]
    pub fn run_step(&self, query: &Query) -> Summary {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.step(query)));
        let trace = match outcome {
            Ok(Ok(summary)) => {
                info!(converged = summary.converged, "step finished");
                return summary;
            }
            Ok(Err(err)) => format!("{err:?}"),
            Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
        };
        warn!(%trace, "step failed");
        self.self_heal.report(&trace, LOOP_COMPONENT);
        Summary::open(format!(
            "Self-heal reported: {}",
            truncate_chars(&trace, SELF_HEAL_SUMMARY_CHARS)
        ))
    }

    fn step(&self, query: &Query) -> Result<Summary> {
        let policy = StepPolicy {
            max_depth: self.cfg.max_recursion_depth,
            mock_mode: self.cfg.mock_mode,
            enforce_structured: self.cfg.enforce_structured,
            source_available: self.structured_source.is_some(),
        };
        let mode = select_step_mode(query.depth, &policy);
        debug!(?mode, "step mode selected");
        if mode == StepMode::DepthExceeded {
            return Ok(Summary::open("Depth limit reached"));
        }

        let context = trim_context(&query.context, self.cfg.context_char_cap);
        match (mode, &self.structured_source) {
            (StepMode::Mock, _) => Ok(self.mock_step(query)),
            (StepMode::Structured, Some(source)) => {
                Ok(self.structured_step(query, context, source.as_ref()))
            }
            _ => self.unstructured_step(query, context),
        }
    }

    fn mock_step(&self, query: &Query) -> Summary {
        let reasoning_id = Uuid::new_v4().to_string();
        let mut params = Map::new();
        params.insert("query".to_string(), Value::String(query.query.clone()));
        params.insert("depth".to_string(), Value::from(query.depth));
        params.insert(
            "reasoning_id".to_string(),
            Value::String(reasoning_id.clone()),
        );
        let action = ActionSpec::new("mock_skill", params);
        let result = self
            .dispatcher
            .dispatch(&action, query.depth, &reasoning_id, true);
        Summary::converged(format!(
            "MockMode thought: planned={}; ok={}; err={}; {}",
            action.skill_name, result.success, result.error, result.observation
        ))
    }

    fn structured_step(
        &self,
        query: &Query,
        context: &str,
        source: &dyn ResponseSource,
    ) -> Summary {
        let trimmed = Query::new(query.query.clone(), context, query.depth);
        let raw = match self
            .prompts
            .build(&trimmed, &self.registry.installed())
            .and_then(|prompt| source.respond(&prompt))
        {
            Ok(raw) => raw,
            Err(err) => return self.schema_failure(&format!("{err:#}")),
        };
        let parsed = match codec::parse(&raw) {
            Ok(parsed) => parsed,
            Err(err) => return self.schema_failure(&err.to_string()),
        };
        self.audit.append(&format!("THOUGHT: {}", parsed.thought));

        let mut working = context.to_string();
        let mut reasoning_id = None;
        if let Some(action) = &parsed.action {
            let rid = action
                .reasoning_id()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let result = self
                .dispatcher
                .dispatch(action, query.depth, &rid, self.cfg.mock_mode);
            working.push_str("\nObservation: ");
            working.push_str(&result.observation);
            reasoning_id = Some(rid);
        }

        if !parsed.is_final {
            return Summary::open(parsed.thought);
        }
        let rid = reasoning_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let lines = self.verticals.run(
            &self.dispatcher,
            &ChainInput {
                query: &query.query,
                context: &working,
                thought: &parsed.thought,
                depth: query.depth,
                reasoning_id: &rid,
            },
        );
        if lines.is_empty() {
            return Summary::converged(parsed.thought);
        }
        Summary::converged(format!("{}\n{}", parsed.thought, lines.join("\n")))
    }

    fn schema_failure(&self, detail: &str) -> Summary {
        let trace = format!("Schema enforcement failed: {detail}");
        warn!(%trace, "structured response rejected");
        self.self_heal.report(&trace, LOOP_COMPONENT);
        Summary::open(trace)
    }

    fn unstructured_step(&self, query: &Query, context: &str) -> Result<Summary> {
        let mut working = context.to_string();

        if context.to_lowercase().contains("large_file")
            && let Some(path) = file_reference(context)
        {
            let peeked = peek_lines(Path::new(path), 0, UNSTRUCTURED_PEEK_LINES);
            if !peeked.is_empty() {
                working.push_str("\nPeeked: ");
                working.push_str(truncate_chars(&peeked, self.cfg.peek_max_chars));
            }
        }

        if let Some(delegate) = &self.delegate
            && query.query.to_lowercase().contains("complex")
        {
            let trimmed = Query::new(query.query.clone(), context, query.depth);
            let prompt = Prompt {
                system: String::new(),
                user: serde_json::to_string(&trimmed).context("serialize delegated query")?,
            };
            match delegate.respond(&prompt) {
                Ok(sub) => {
                    working.push_str("\nSub-summary: ");
                    working.push_str(truncate_chars(&sub, self.cfg.peek_max_chars));
                }
                Err(err) => working.push_str(&format!("\nSub-error: {err:#}")),
            }
        }

        let converged = working.to_lowercase().contains("resolved")
            || query.depth >= self.cfg.max_recursion_depth.saturating_sub(1);

        if converged
            && query.query.to_lowercase().contains("save_skill")
            && let Err(err) =
                save_manifest(self.registry.context(), "new_skill", GENERIC_SKILL_MANIFEST)
        {
            warn!(err = %format!("{err:#}"), "generic skill save failed");
        }

        Ok(Summary {
            summary: "Synthesized generic response".to_string(),
            converged,
        })
    }
}

/// The token following the last `file:` marker.
fn file_reference(context: &str) -> Option<&str> {
    let (_, rest) = context.rsplit_once("file:")?;
    rest.split_whitespace().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_reference_takes_last_marker() {
        assert_eq!(file_reference("large_file file:a.txt more"), Some("a.txt"));
        assert_eq!(file_reference("file:a.txt file:b.txt"), Some("b.txt"));
        assert_eq!(file_reference("file:   "), None);
        assert_eq!(file_reference("no marker"), None);
    }
}
