use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::io::prompt::SkillSummary;
use crate::skills::manifest::{self, SkillManifest};

/// Entry point signature: validated params in, observation text out.
pub type SkillFn = Arc<dyn Fn(&SkillContext, Value) -> Result<String> + Send + Sync>;

/// Registry failures, each with a stable category code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SkillError {
    #[error("skill not found: {0}")]
    SkillNotFound(String),
    #[error("invalid skill module {name}: {reason}")]
    InvalidSkillModule { name: String, reason: String },
    #[error("params schema '{schema}' not registered for skill {name}")]
    ParamsModelMissing { name: String, schema: String },
    #[error("invalid params for {name}: {}", .errors.join("; "))]
    ParamsValidationError { name: String, errors: Vec<String> },
}

impl SkillError {
    pub fn code(&self) -> &'static str {
        match self {
            SkillError::SkillNotFound(_) => "skill_not_found",
            SkillError::InvalidSkillModule { .. } => "invalid_skill_module",
            SkillError::ParamsModelMissing { .. } => "params_model_missing",
            SkillError::ParamsValidationError { .. } => "params_validation_error",
        }
    }
}

/// Ambient values every skill may read. Built once with the registry.
#[derive(Debug, Clone)]
pub struct SkillContext {
    /// Writes, searches and test runs are confined below this directory.
    pub project_root: PathBuf,
    pub registry_dir: PathBuf,
    /// Registered entry point names, for manifest validation.
    pub entries: BTreeSet<String>,
}

/// A compiled parameter schema.
pub struct ParamsSchema {
    name: String,
    schema: Value,
    validator: jsonschema::Validator,
}

impl ParamsSchema {
    pub fn compile(name: &str, schema: Value) -> Result<Self> {
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| anyhow!("compile params schema '{name}': {err}"))?;
        Ok(Self {
            name: name.to_string(),
            schema,
            validator,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn check(&self, instance: &Value) -> std::result::Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect();
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

impl fmt::Debug for ParamsSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamsSchema")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// One registrable entry point.
#[derive(Clone)]
pub struct SkillDefinition {
    pub name: String,
    /// Name of a registered parameter schema.
    pub params: String,
    pub description: String,
    pub run: SkillFn,
}

impl SkillDefinition {
    pub fn new<F>(name: &str, params: &str, description: &str, run: F) -> Self
    where
        F: Fn(&SkillContext, Value) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            params: params.to_string(),
            description: description.to_string(),
            run: Arc::new(run),
        }
    }
}

/// A resolved, ready-to-invoke skill.
pub struct SkillHandle {
    pub name: String,
    pub entry: String,
    pub description: String,
    params: Arc<ParamsSchema>,
    defaults: Map<String, Value>,
    run: SkillFn,
}

impl SkillHandle {
    pub fn params_schema(&self) -> &ParamsSchema {
        &self.params
    }
}

impl fmt::Debug for SkillHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkillHandle")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("params", &self.params.name)
            .finish_non_exhaustive()
    }
}

struct CacheEntry {
    modified: SystemTime,
    handle: Arc<SkillHandle>,
}

/// Collects schemas and entry points; every reference is checked on insert.
pub struct RegistryBuilder {
    schemas: HashMap<String, Arc<ParamsSchema>>,
    entries: BTreeMap<String, SkillDefinition>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
            entries: BTreeMap::new(),
        }
    }

    /// Compile and register a parameter schema under `name`.
    pub fn params(mut self, name: &str, schema: Value) -> Result<Self> {
        if self.schemas.contains_key(name) {
            return Err(anyhow!("params schema '{name}' registered twice"));
        }
        let compiled = ParamsSchema::compile(name, schema)?;
        self.schemas.insert(name.to_string(), Arc::new(compiled));
        Ok(self)
    }

    /// Register `alias` as another name for an already registered schema.
    pub fn alias(mut self, alias: &str, target: &str) -> Result<Self> {
        let schema = self
            .schemas
            .get(target)
            .cloned()
            .ok_or_else(|| {
                anyhow!("alias '{alias}' targets unregistered params schema '{target}'")
            })?;
        if self.schemas.contains_key(alias) {
            return Err(anyhow!("params schema '{alias}' registered twice"));
        }
        self.schemas.insert(alias.to_string(), schema);
        Ok(self)
    }

    pub fn skill(mut self, definition: SkillDefinition) -> Result<Self> {
        if !manifest::is_valid_skill_name(&definition.name) {
            return Err(anyhow!("invalid entry point name '{}'", definition.name));
        }
        if !self.schemas.contains_key(&definition.params) {
            return Err(anyhow!(
                "entry point '{}' references unregistered params schema '{}'",
                definition.name,
                definition.params
            ));
        }
        if self.entries.contains_key(&definition.name) {
            return Err(anyhow!("entry point '{}' registered twice", definition.name));
        }
        self.entries.insert(definition.name.clone(), definition);
        Ok(self)
    }

    pub fn build(
        self,
        registry_dir: &Path,
        project_root: &Path,
        cache_enabled: bool,
    ) -> SkillRegistry {
        let context = SkillContext {
            project_root: project_root.to_path_buf(),
            registry_dir: registry_dir.to_path_buf(),
            entries: self.entries.keys().cloned().collect(),
        };
        SkillRegistry {
            schemas: self.schemas,
            entries: self.entries,
            context,
            cache_enabled,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Name-to-skill resolution with a modification-time cache.
pub struct SkillRegistry {
    schemas: HashMap<String, Arc<ParamsSchema>>,
    entries: BTreeMap<String, SkillDefinition>,
    context: SkillContext,
    cache_enabled: bool,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl SkillRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn context(&self) -> &SkillContext {
        &self.context
    }

    pub fn registry_dir(&self) -> &Path {
        &self.context.registry_dir
    }

    /// Registered entry points, sorted by name.
    pub fn entry_points(&self) -> impl Iterator<Item = &SkillDefinition> {
        self.entries.values()
    }

    /// Installed skills (manifests that parse), for prompts and listings.
    pub fn installed(&self) -> Vec<SkillSummary> {
        let names = match manifest::installed_names(self.registry_dir()) {
            Ok(names) => names,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "list installed skills failed");
                return Vec::new();
            }
        };
        names
            .into_iter()
            .filter_map(|name| {
                let path = manifest::manifest_path(self.registry_dir(), &name);
                let manifest = manifest::load_manifest(&path).ok()?;
                let description = manifest.description.clone().unwrap_or_else(|| {
                    self.entries
                        .get(&manifest.entry)
                        .map(|def| def.description.clone())
                        .unwrap_or_default()
                });
                Some(SkillSummary { name, description })
            })
            .collect()
    }

    /// Resolve `name` to a handle, reusing the cached one while its manifest is unchanged.
    #[instrument(skip_all, fields(skill = %name))]
    pub fn resolve(&self, name: &str) -> std::result::Result<Arc<SkillHandle>, SkillError> {
        if !manifest::is_valid_skill_name(name) {
            return Err(SkillError::SkillNotFound(name.to_string()));
        }
        let path = manifest::manifest_path(self.registry_dir(), name);
        let modified = match path.metadata() {
            Ok(meta) if meta.is_file() => meta.modified().ok(),
            _ => return Err(SkillError::SkillNotFound(name.to_string())),
        };

        if !self.cache_enabled {
            return self.load(name, &path).map(Arc::new);
        }

        let mut cache = match self.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let (Some(modified), Some(entry)) = (modified, cache.get(name))
            && entry.modified == modified
        {
            debug!("skill cache hit");
            return Ok(Arc::clone(&entry.handle));
        }
        let handle = Arc::new(self.load(name, &path)?);
        match modified {
            Some(modified) => {
                debug!("skill cache store");
                cache.insert(
                    name.to_string(),
                    CacheEntry {
                        modified,
                        handle: Arc::clone(&handle),
                    },
                );
            }
            None => {
                cache.remove(name);
            }
        }
        Ok(handle)
    }

    fn load(&self, name: &str, path: &Path) -> std::result::Result<SkillHandle, SkillError> {
        let manifest: SkillManifest =
            manifest::load_manifest(path).map_err(|err| SkillError::InvalidSkillModule {
                name: name.to_string(),
                reason: format!("{err:#}"),
            })?;
        let definition =
            self.entries
                .get(&manifest.entry)
                .ok_or_else(|| SkillError::InvalidSkillModule {
                    name: name.to_string(),
                    reason: format!("unknown entry point '{}'", manifest.entry),
                })?;
        let schema_name = manifest
            .params
            .clone()
            .unwrap_or_else(|| definition.params.clone());
        let params = self
            .schemas
            .get(&schema_name)
            .cloned()
            .ok_or_else(|| SkillError::ParamsModelMissing {
                name: name.to_string(),
                schema: schema_name.clone(),
            })?;
        Ok(SkillHandle {
            name: name.to_string(),
            entry: definition.name.clone(),
            description: manifest
                .description
                .unwrap_or_else(|| definition.description.clone()),
            params,
            defaults: manifest.defaults,
            run: Arc::clone(&definition.run),
        })
    }

    /// Validate `params` (over the manifest defaults) and run the skill.
    ///
    /// Failures inside the skill body, panics included, become
    /// `[<skill>] Error: ...` observations.
    #[instrument(skip_all, fields(skill = %handle.name))]
    pub fn invoke(
        &self,
        handle: &SkillHandle,
        params: &Map<String, Value>,
    ) -> std::result::Result<String, SkillError> {
        let mut merged = handle.defaults.clone();
        for (key, value) in params {
            merged.insert(key.clone(), value.clone());
        }
        let instance = Value::Object(merged);
        handle
            .params
            .check(&instance)
            .map_err(|errors| SkillError::ParamsValidationError {
                name: handle.name.clone(),
                errors,
            })?;

        let run = Arc::clone(&handle.run);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(&self.context, instance)));
        Ok(match outcome {
            Ok(Ok(observation)) => observation,
            Ok(Err(err)) => {
                debug!(err = %format!("{err:#}"), "skill returned error");
                format!("[{}] Error: {err:#}", handle.name)
            }
            Err(payload) => {
                warn!("skill panicked");
                format!("[{}] Error: panic: {}", handle.name, panic_message(payload.as_ref()))
            }
        })
    }

    /// Resolve and invoke in one call.
    pub fn execute(
        &self,
        name: &str,
        params: &Map<String, Value>,
    ) -> std::result::Result<String, SkillError> {
        let handle = self.resolve(name)?;
        self.invoke(&handle, params)
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::manifest::{manifest_path, write_manifest};
    use serde_json::json;
    use std::fs;

    fn echo_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    fn registry(dir: &Path, cache_enabled: bool) -> SkillRegistry {
        SkillRegistry::builder()
            .params("echo", echo_schema())
            .expect("schema")
            .alias("EchoParams", "echo")
            .expect("alias")
            .skill(SkillDefinition::new("echo", "echo", "Echo text", |_, params| {
                Ok(params["text"].as_str().unwrap_or_default().to_string())
            }))
            .expect("echo")
            .skill(SkillDefinition::new("fails", "echo", "Always fails", |_, _| {
                Err(anyhow!("disk on fire"))
            }))
            .expect("fails")
            .skill(SkillDefinition::new("panics", "echo", "Always panics", |_, _| {
                panic!("boom")
            }))
            .expect("panics")
            .build(dir, dir, cache_enabled)
    }

    fn install(dir: &Path, name: &str, manifest: &SkillManifest) {
        write_manifest(&manifest_path(dir, name), manifest).expect("install");
    }

    #[test]
    fn registration_fails_fast_on_unknown_schema() {
        let err = SkillRegistry::builder()
            .skill(SkillDefinition::new("x", "XParams", "", |_, _| Ok(String::new())))
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("unregistered params schema 'XParams'"));
    }

    #[test]
    fn registration_rejects_bad_schema_and_duplicates() {
        assert!(
            SkillRegistry::builder()
                .params("bad", json!({"type": 12}))
                .is_err()
        );
        let err = SkillRegistry::builder()
            .params("echo", echo_schema())
            .and_then(|b| b.params("echo", echo_schema()))
            .err()
            .expect("duplicate");
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), true);
        let err = registry.resolve("echo").unwrap_err();
        assert_eq!(err.code(), "skill_not_found");
        assert_eq!(registry.resolve("../echo").unwrap_err().code(), "skill_not_found");
    }

    #[test]
    fn unknown_entry_or_garbage_is_invalid_module() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), true);
        install(temp.path(), "ghost", &SkillManifest::for_entry("no_such_entry"));
        fs::write(manifest_path(temp.path(), "garbage"), "entry = [").expect("write");

        assert_eq!(registry.resolve("ghost").unwrap_err().code(), "invalid_skill_module");
        assert_eq!(registry.resolve("garbage").unwrap_err().code(), "invalid_skill_module");
    }

    #[test]
    fn unknown_params_override_is_params_model_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), true);
        let mut manifest = SkillManifest::for_entry("echo");
        manifest.params = Some("NopeParams".to_string());
        install(temp.path(), "echo", &manifest);
        assert_eq!(registry.resolve("echo").unwrap_err().code(), "params_model_missing");
    }

    #[test]
    fn legacy_alias_and_defaults_apply() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), true);
        let mut manifest = SkillManifest::for_entry("echo");
        manifest.params = Some("EchoParams".to_string());
        manifest.defaults.insert("text".to_string(), json!("from defaults"));
        install(temp.path(), "greet", &manifest);

        let handle = registry.resolve("greet").expect("resolve");
        assert_eq!(handle.params_schema().name(), "echo");
        assert_eq!(registry.invoke(&handle, &Map::new()).expect("invoke"), "from defaults");
        let mut params = Map::new();
        params.insert("text".to_string(), json!("override"));
        assert_eq!(registry.invoke(&handle, &params).expect("invoke"), "override");
    }

    #[test]
    fn invalid_params_are_rejected_before_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), true);
        install(temp.path(), "echo", &SkillManifest::for_entry("echo"));
        let mut params = Map::new();
        params.insert("text".to_string(), json!(42));
        let err = registry.execute("echo", &params).unwrap_err();
        assert_eq!(err.code(), "params_validation_error");
        assert!(err.to_string().contains("is not of type"));
    }

    #[test]
    fn skill_errors_and_panics_become_observations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), true);
        install(temp.path(), "fails", &SkillManifest::for_entry("fails"));
        install(temp.path(), "panics", &SkillManifest::for_entry("panics"));
        let mut params = Map::new();
        params.insert("text".to_string(), json!("x"));

        assert_eq!(
            registry.execute("fails", &params).expect("observation"),
            "[fails] Error: disk on fire"
        );
        assert_eq!(
            registry.execute("panics", &params).expect("observation"),
            "[panics] Error: panic: boom"
        );
    }

    #[test]
    fn cache_returns_same_handle_until_manifest_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), true);
        let path = manifest_path(temp.path(), "echo");
        install(temp.path(), "echo", &SkillManifest::for_entry("echo"));

        let first = registry.resolve("echo").expect("first");
        let second = registry.resolve("echo").expect("second");
        assert!(Arc::ptr_eq(&first, &second));

        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(later))
            .expect("touch");
        let third = registry.resolve("echo").expect("third");
        assert!(!Arc::ptr_eq(&second, &third));
    }

    #[test]
    fn disabled_cache_always_reloads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), false);
        install(temp.path(), "echo", &SkillManifest::for_entry("echo"));
        let first = registry.resolve("echo").expect("first");
        let second = registry.resolve("echo").expect("second");
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn installed_lists_manifests_with_descriptions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), true);
        install(temp.path(), "echo", &SkillManifest::for_entry("echo"));
        let mut custom = SkillManifest::for_entry("echo");
        custom.description = Some("Custom".to_string());
        install(temp.path(), "loud", &custom);

        let installed = registry.installed();
        assert_eq!(
            installed,
            vec![
                SkillSummary {
                    name: "echo".to_string(),
                    description: "Echo text".to_string()
                },
                SkillSummary {
                    name: "loud".to_string(),
                    description: "Custom".to_string()
                },
            ]
        );
    }
}
