//! On-disk skill manifests (`<registry_dir>/<name>.toml`).
//!
//! A manifest installs a skill: it binds the file stem to a registered entry
//! point and may override the parameter schema and supply parameter defaults.
//! The manifest's modification time keys the registry cache.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MANIFEST_EXTENSION: &str = "toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillManifest {
    /// Registered entry point name.
    pub entry: String,

    /// Parameter schema name; defaults to the entry point's own schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Merged under caller params before validation.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub defaults: Map<String, Value>,
}

impl SkillManifest {
    pub fn for_entry(entry: &str) -> Self {
        Self {
            entry: entry.to_string(),
            params: None,
            description: None,
            defaults: Map::new(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let manifest: SkillManifest = toml::from_str(raw).context("parse skill manifest")?;
        if manifest.entry.trim().is_empty() {
            return Err(anyhow!("skill manifest entry must be non-empty"));
        }
        Ok(manifest)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serialize skill manifest")
    }
}

/// Map a caller-supplied file name to a skill name.
///
/// Strips a trailing `.toml`/`.py` extension, drops `..`, and replaces path
/// separators; anything outside `[A-Za-z0-9_-]` becomes `_`. Returns `None`
/// when nothing usable remains.
pub fn sanitize_skill_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let stem = trimmed
        .strip_suffix(".toml")
        .or_else(|| trimmed.strip_suffix(".py"))
        .unwrap_or(trimmed);
    let cleaned: String = stem
        .replace("..", "")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('_').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// True when `name` can be used verbatim as a manifest file stem.
pub fn is_valid_skill_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn manifest_path(registry_dir: &Path, name: &str) -> PathBuf {
    registry_dir.join(format!("{name}.{MANIFEST_EXTENSION}"))
}

pub fn load_manifest(path: &Path) -> Result<SkillManifest> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    SkillManifest::parse(&raw).with_context(|| format!("load {}", path.display()))
}

/// Atomically write a manifest (temp file + rename).
pub fn write_manifest(path: &Path, manifest: &SkillManifest) -> Result<()> {
    let body = manifest.to_toml()?;
    write_manifest_raw(path, &body)
}

pub(crate) fn write_manifest_raw(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, body)
        .with_context(|| format!("write temp manifest {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace manifest {}", path.display()))?;
    Ok(())
}

/// Skill names with a manifest in `registry_dir`, sorted.
pub fn installed_names(registry_dir: &Path) -> Result<Vec<String>> {
    if !registry_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(registry_dir)
        .with_context(|| format!("read registry dir {}", registry_dir.display()))?
    {
        let path = entry.context("read registry entry")?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(MANIFEST_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
            && is_valid_skill_name(stem)
        {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}
