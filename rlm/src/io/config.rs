//! Loop configuration stored as TOML (default `rlm.toml`).
//!
//! The loaded [`LoopConfig`] is an immutable snapshot: it is built once per
//! process (file, then `RLM_*` environment overrides) and passed explicitly to
//! the engine. Nothing reads the environment during a step.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYSTEM_PROMPT: &str = "Respond ONLY as JSON: \
    {thought: string, action?: {skill_name, params}, observation?: string, is_final: bool}";

/// Domain-specific prompt augmentation and post-convergence side effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    #[default]
    Generic,
    Codegen,
    CodeReview,
    Research,
}

impl UseCase {
    pub fn as_str(self) -> &'static str {
        match self {
            UseCase::Generic => "generic",
            UseCase::Codegen => "codegen",
            UseCase::CodeReview => "code_review",
            UseCase::Research => "research",
        }
    }
}

impl FromStr for UseCase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "" | "generic" => Ok(UseCase::Generic),
            "codegen" => Ok(UseCase::Codegen),
            "code_review" => Ok(UseCase::CodeReview),
            "research" => Ok(UseCase::Research),
            other => Err(anyhow!("unknown use case '{other}'")),
        }
    }
}

/// Loop configuration (TOML).
///
/// Missing fields default to the conservative policy: no outbound calls, no
/// remote or local dispatch, structured enforcement on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Steps with `depth >= max_recursion_depth` terminate without converging.
    pub max_recursion_depth: u32,

    /// Cap for bare-fallback and unstructured peeks.
    pub peek_max_chars: usize,

    /// Keep only the trailing N characters of the caller's context.
    pub context_char_cap: Option<usize>,

    pub mock_mode: bool,
    pub enforce_structured: bool,

    /// Permit live completion calls.
    pub allow_outbound: bool,

    /// Fixed response used instead of a live completion. Always wins when set.
    pub stub_response: Option<String>,

    pub system_prompt: String,
    pub use_case: UseCase,

    /// Append the auto-evolve marker after a research self-patch write.
    pub auto_evolve: bool,

    pub dispatch: DispatchConfig,
    pub orchestrator: OrchestratorConfig,
    pub completion: CompletionConfig,
    pub skills: SkillsConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    pub remote_enabled: bool,
    pub local_enabled: bool,
    /// Stricter remote dispatch: send an explicit timeout hint.
    pub real_dispatch: bool,
    pub local_allow_list: Vec<String>,
    pub rpc_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub url: String,
    pub self_heal_via_remote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompletionConfig {
    /// OpenAI-compatible chat completions endpoint. `None` disables the backend.
    pub url: Option<String>,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SkillsConfig {
    /// Directory holding `<skill>.toml` manifests.
    pub registry_dir: PathBuf,
    pub disable_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub actions_log: Option<PathBuf>,
    pub self_heal_log: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub patch_path: PathBuf,
    pub review_test_dir: PathBuf,
    /// Writes and searches are confined below this directory.
    pub project_root: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            remote_enabled: false,
            local_enabled: false,
            real_dispatch: false,
            local_allow_list: vec!["peek_file".to_string(), "save_skill".to_string()],
            rpc_timeout_secs: 10,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            url: "http://[::1]:50051".to_string(),
            self_heal_via_remote: false,
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: "openrouter/auto".to_string(),
            api_key_env: "RLM_COMPLETION_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            registry_dir: PathBuf::from("skills"),
            disable_cache: false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            actions_log: None,
            self_heal_log: None,
            output_dir: PathBuf::from("output"),
            patch_path: PathBuf::from("output/self_patch.md"),
            review_test_dir: PathBuf::from("."),
            project_root: PathBuf::from("."),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: 5,
            peek_max_chars: 2000,
            context_char_cap: None,
            mock_mode: false,
            enforce_structured: true,
            allow_outbound: false,
            stub_response: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            use_case: UseCase::Generic,
            auto_evolve: false,
            dispatch: DispatchConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            completion: CompletionConfig::default(),
            skills: SkillsConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_recursion_depth == 0 {
            return Err(anyhow!("max_recursion_depth must be > 0"));
        }
        if self.peek_max_chars == 0 {
            return Err(anyhow!("peek_max_chars must be > 0"));
        }
        if self.dispatch.rpc_timeout_secs == 0 {
            return Err(anyhow!("dispatch.rpc_timeout_secs must be > 0"));
        }
        if self.completion.timeout_secs == 0 {
            return Err(anyhow!("completion.timeout_secs must be > 0"));
        }
        if self.orchestrator.url.trim().is_empty() {
            return Err(anyhow!("orchestrator.url must be non-empty"));
        }
        if let Some(url) = &self.completion.url
            && url.trim().is_empty()
        {
            return Err(anyhow!("completion.url must be non-empty when set"));
        }
        if self.system_prompt.trim().is_empty() {
            return Err(anyhow!("system_prompt must be non-empty"));
        }
        Ok(())
    }

    /// True when a live completion call is both allowed and configured.
    pub fn completion_enabled(&self) -> bool {
        self.allow_outbound && self.completion.url.is_some()
    }

    /// Apply `RLM_*` overrides from an explicit set of variables.
    ///
    /// Callers pass `std::env::vars()` once at startup; tests pass literal pairs.
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                "RLM_MAX_RECURSION_DEPTH" => {
                    self.max_recursion_depth = parse_num(key.as_ref(), value)?;
                }
                "RLM_PEEK_MAX_CHARS" => self.peek_max_chars = parse_num(key.as_ref(), value)?,
                "RLM_CONTEXT_CHAR_CAP" => {
                    self.context_char_cap = if value.trim().is_empty() {
                        None
                    } else {
                        Some(parse_num(key.as_ref(), value)?)
                    };
                }
                "RLM_MOCK_MODE" => self.mock_mode = truthy(value),
                "RLM_ENFORCE_STRUCTURED" => self.enforce_structured = truthy(value),
                "RLM_ALLOW_OUTBOUND" => self.allow_outbound = truthy(value),
                "RLM_STUB_JSON" => self.stub_response = Some(value.to_string()),
                "RLM_SYSTEM_PROMPT" => self.system_prompt = value.to_string(),
                "RLM_USE_CASE" => self.use_case = value.parse()?,
                "RLM_AUTO_EVOLVE" => self.auto_evolve = truthy(value),
                "RLM_ACTIONS_VIA_REMOTE" => self.dispatch.remote_enabled = truthy(value),
                "RLM_ALLOW_LOCAL_DISPATCH" => self.dispatch.local_enabled = truthy(value),
                "RLM_REAL_DISPATCH" => self.dispatch.real_dispatch = truthy(value),
                "RLM_ORCHESTRATOR_URL" => self.orchestrator.url = value.to_string(),
                "RLM_SELF_HEAL_VIA_REMOTE" => {
                    self.orchestrator.self_heal_via_remote = truthy(value);
                }
                "RLM_COMPLETION_URL" => self.completion.url = Some(value.to_string()),
                "RLM_COMPLETION_MODEL" => self.completion.model = value.to_string(),
                "RLM_SKILLS_DIR" => self.skills.registry_dir = PathBuf::from(value),
                "RLM_DISABLE_SKILL_CACHE" => self.skills.disable_cache = truthy(value),
                "RLM_ACTIONS_LOG" => self.paths.actions_log = Some(PathBuf::from(value)),
                "RLM_SELF_HEAL_LOG" => self.paths.self_heal_log = Some(PathBuf::from(value)),
                "RLM_OUTPUT_DIR" => self.paths.output_dir = PathBuf::from(value),
                "RLM_PROJECT_ROOT" => self.paths.project_root = PathBuf::from(value),
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| anyhow!("invalid {key}='{value}': {err}"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
