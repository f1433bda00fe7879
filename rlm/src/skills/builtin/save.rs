use std::path::PathBuf;

use anyhow::{Result, anyhow};
use serde::Deserialize;
use serde_json::json;

use super::{params_with_alias, parse_params};
use crate::skills::manifest::{self, SkillManifest};
use crate::skills::{RegistryBuilder, SkillContext, SkillDefinition};

/// Manifest installed when a converged unstructured step asks to save a skill.
pub const GENERIC_SKILL_MANIFEST: &str =
    "entry = \"peek_file\"\ndescription = \"Generic skill saved by the reasoning loop\"\n";

pub(super) fn register(builder: RegistryBuilder) -> Result<RegistryBuilder> {
    params_with_alias(
        builder,
        "save_skill",
        json!({
            "type": "object",
            "properties": {
                "filename": {"type": "string", "minLength": 1},
                "code": {"type": "string"}
            },
            "required": ["filename", "code"]
        }),
    )?
    .skill(SkillDefinition::new(
        "save_skill",
        "save_skill",
        "Install a skill manifest into the registry",
        save_skill,
    ))
}

#[derive(Debug, Deserialize)]
struct SaveSkillParams {
    filename: String,
    code: String,
}

/// Validate `code` as a manifest bound to a registered entry point, then install it.
///
/// Built-in entry-point names cannot be rebound. Nothing is written when
/// validation fails.
pub fn save_manifest(ctx: &SkillContext, filename: &str, code: &str) -> Result<PathBuf> {
    let name = manifest::sanitize_skill_name(filename)
        .ok_or_else(|| anyhow!("invalid skill file name '{filename}'"))?;
    if ctx.entries.contains(&name) {
        return Err(anyhow!(
            "skill validation failed: '{name}' is a built-in entry point"
        ));
    }
    let parsed = SkillManifest::parse(code)?;
    if !ctx.entries.contains(&parsed.entry) {
        return Err(anyhow!(
            "skill validation failed: unknown entry point '{}'",
            parsed.entry
        ));
    }
    let path = manifest::manifest_path(&ctx.registry_dir, &name);
    manifest::write_manifest_raw(&path, code)?;
    Ok(path)
}

fn save_skill(ctx: &SkillContext, params: serde_json::Value) -> Result<String> {
    let params: SaveSkillParams = parse_params("save_skill", params)?;
    match save_manifest(ctx, &params.filename, &params.code) {
        Ok(path) => Ok(format!(
            "[save_skill] Saved → {}",
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        )),
        Err(err) => Ok(format!("[save_skill] Write failed: {err:#}")),
    }
}
