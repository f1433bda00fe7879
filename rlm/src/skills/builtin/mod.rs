//! Built-in entry points and their parameter schemas.
//!
//! Every observation a built-in produces, success or failure, is prefixed
//! with `[<skill>]` except raw file content.

mod files;
mod save;
mod search;
mod test_runner;

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::io::config::LoopConfig;
use crate::skills::manifest::{self, SkillManifest};
use crate::skills::{RegistryBuilder, SkillRegistry};

pub use files::peek_lines;
pub use save::{GENERIC_SKILL_MANIFEST, save_manifest};

/// Registry with every built-in entry point, configured from `cfg`.
pub fn default_registry(cfg: &LoopConfig) -> Result<SkillRegistry> {
    Ok(register_all(SkillRegistry::builder())?.build(
        &cfg.skills.registry_dir,
        &cfg.paths.project_root,
        !cfg.skills.disable_cache,
    ))
}

/// Add the built-ins to an existing builder.
pub fn register_all(builder: RegistryBuilder) -> Result<RegistryBuilder> {
    let builder = files::register(builder)?;
    let builder = search::register(builder)?;
    let builder = test_runner::register(builder)?;
    save::register(builder)
}

/// Install one manifest per built-in entry point.
///
/// Existing manifests are kept unless `force` is set. Returns the written paths.
pub fn write_default_manifests(registry: &SkillRegistry, force: bool) -> Result<Vec<PathBuf>> {
    let dir = registry.registry_dir();
    fs::create_dir_all(dir).with_context(|| format!("create registry dir {}", dir.display()))?;
    let mut written = Vec::new();
    for definition in registry.entry_points() {
        let path = manifest::manifest_path(dir, &definition.name);
        if path.exists() && !force {
            continue;
        }
        let mut manifest = SkillManifest::for_entry(&definition.name);
        manifest.description = Some(definition.description.clone());
        manifest::write_manifest(&path, &manifest)?;
        written.push(path);
    }
    Ok(written)
}

/// `peek_file` -> `PeekFileParams`.
fn legacy_params_name(skill: &str) -> String {
    let mut name: String = skill
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    name.push_str("Params");
    name
}

/// Register `schema` under the skill's own name and its legacy alias.
fn params_with_alias(
    builder: RegistryBuilder,
    skill: &str,
    schema: Value,
) -> Result<RegistryBuilder> {
    builder
        .params(skill, schema)?
        .alias(&legacy_params_name(skill), skill)
}

fn parse_params<T: DeserializeOwned>(skill: &str, params: Value) -> Result<T> {
    serde_json::from_value(params).with_context(|| format!("decode {skill} params"))
}

/// Absolute, `..`-free form of `path`, with symlinks resolved on the part that exists.
fn normalize(path: &Path) -> Result<PathBuf> {
    let absolute =
        std::path::absolute(path).with_context(|| format!("resolve {}", path.display()))?;
    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                lexical.pop();
            }
            Component::CurDir => {}
            other => lexical.push(other.as_os_str()),
        }
    }

    let mut existing = lexical.as_path();
    let mut rest = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved = existing
        .canonicalize()
        .unwrap_or_else(|_| existing.to_path_buf());
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Normalized `path` when it lies below `root`.
fn confine(path: &Path, root: &Path) -> Result<Option<PathBuf>> {
    let root = normalize(root)?;
    let resolved = normalize(path)?;
    Ok(resolved.starts_with(&root).then_some(resolved))
}

/// Normalize a `"*.md"` / `".md"` / `"md"` pattern into a lowercase suffix.
fn suffix_filter(pattern: Option<&str>, force_dot: bool) -> Option<String> {
    let pattern = pattern?.trim().to_lowercase();
    if pattern.is_empty() {
        return None;
    }
    let suffix = pattern.strip_prefix('*').map(str::to_string).unwrap_or(pattern);
    if force_dot && !suffix.starts_with('.') {
        Some(format!(".{suffix}"))
    } else {
        Some(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_names_are_camel_case() {
        assert_eq!(legacy_params_name("peek_file"), "PeekFileParams");
        assert_eq!(legacy_params_name("read_entire_file_safe"), "ReadEntireFileSafeParams");
    }

    #[test]
    fn confine_rejects_escapes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        assert!(confine(&root.join("a/b.txt"), root).expect("confine").is_some());
        assert!(confine(&root.join("a/../../b.txt"), root).expect("confine").is_none());
        assert!(confine(Path::new("/"), root).expect("confine").is_none());
    }

    #[test]
    fn suffix_filters() {
        assert_eq!(suffix_filter(Some("*.MD"), false).as_deref(), Some(".md"));
        assert_eq!(suffix_filter(Some("rs"), true).as_deref(), Some(".rs"));
        assert_eq!(suffix_filter(Some("rs"), false).as_deref(), Some("rs"));
        assert_eq!(suffix_filter(Some("  "), true), None);
        assert_eq!(suffix_filter(None, true), None);
    }

    #[test]
    fn default_manifests_install_every_entry_point() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = LoopConfig {
            skills: crate::io::config::SkillsConfig {
                registry_dir: temp.path().join("skills"),
                disable_cache: false,
            },
            ..LoopConfig::default()
        };
        let registry = default_registry(&cfg).expect("registry");
        let written = write_default_manifests(&registry, false).expect("write");
        assert_eq!(written.len(), registry.entry_points().count());
        assert!(write_default_manifests(&registry, false).expect("rewrite").is_empty());

        let handle = registry.resolve("peek_file").expect("resolve");
        assert_eq!(handle.entry, "peek_file");
        assert!(registry.resolve("write_file_safe").is_ok());
    }
}
