use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use walkdir::WalkDir;

use super::{confine, normalize, params_with_alias, parse_params, suffix_filter};
use crate::skills::{RegistryBuilder, SkillContext, SkillDefinition};

pub(super) fn register(builder: RegistryBuilder) -> Result<RegistryBuilder> {
    let builder = params_with_alias(
        builder,
        "peek_file",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "minLength": 1},
                "start": {"type": "integer"},
                "end": {"type": "integer"},
                "encoding": {"type": "string"}
            },
            "required": ["path"]
        }),
    )?;
    let builder = params_with_alias(
        builder,
        "read_entire_file_safe",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "minLength": 1},
                "max_size_bytes": {"type": "integer", "minimum": 1},
                "encoding": {"type": "string"}
            },
            "required": ["path"]
        }),
    )?;
    let builder = params_with_alias(
        builder,
        "list_dir",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "pattern": {"type": ["string", "null"]},
                "max_items": {"type": "integer", "minimum": 1}
            }
        }),
    )?;
    let builder = params_with_alias(
        builder,
        "list_files_recursive",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "pattern": {"type": ["string", "null"]},
                "max_depth": {"type": "integer", "minimum": 1},
                "max_items": {"type": "integer", "minimum": 1}
            }
        }),
    )?;
    let builder = params_with_alias(
        builder,
        "write_file_safe",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "minLength": 1},
                "content": {"type": "string"},
                "max_content_bytes": {"type": "integer", "minimum": 1},
                "overwrite": {"type": "boolean"}
            },
            "required": ["path", "content"]
        }),
    )?;

    builder
        .skill(SkillDefinition::new(
            "peek_file",
            "peek_file",
            "Read a byte range of a text file",
            peek_file,
        ))?
        .skill(SkillDefinition::new(
            "read_entire_file_safe",
            "read_entire_file_safe",
            "Read a whole text file up to a size cap",
            read_entire_file_safe,
        ))?
        .skill(SkillDefinition::new(
            "list_dir",
            "list_dir",
            "List one directory, optionally filtered by suffix",
            list_dir,
        ))?
        .skill(SkillDefinition::new(
            "list_files_recursive",
            "list_files_recursive",
            "List files below a directory with depth and item caps",
            list_files_recursive,
        ))?
        .skill(SkillDefinition::new(
            "write_file_safe",
            "write_file_safe",
            "Write a text file below the project root",
            write_file_safe,
        ))
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn check_encoding(skill: &str, encoding: &str) -> Option<String> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => None,
        other => Some(format!("[{skill}] Unsupported encoding: {other}")),
    }
}

#[derive(Debug, Deserialize)]
struct PeekFileParams {
    path: String,
    #[serde(default)]
    start: i64,
    #[serde(default = "default_peek_end")]
    end: i64,
    #[serde(default = "default_encoding")]
    encoding: String,
}

fn default_peek_end() -> i64 {
    2000
}

fn peek_file(_ctx: &SkillContext, params: serde_json::Value) -> Result<String> {
    let params: PeekFileParams = parse_params("peek_file", params)?;
    if !Path::new(&params.path).is_file() {
        return Ok(format!("[peek_file] File not found: {}", params.path));
    }
    if params.start < 0 {
        return Ok("[peek_file] Invalid start".to_string());
    }
    if params.end < params.start {
        return Ok("[peek_file] Invalid range".to_string());
    }
    if let Some(msg) = check_encoding("peek_file", &params.encoding) {
        return Ok(msg);
    }
    let bytes = fs::read(&params.path).with_context(|| format!("read {}", params.path))?;
    let start = usize::try_from(params.start).unwrap_or(usize::MAX).min(bytes.len());
    let end = usize::try_from(params.end).unwrap_or(usize::MAX).min(bytes.len());
    // A cut through a multi-byte sequence decodes as U+FFFD.
    Ok(String::from_utf8_lossy(&bytes[start..end]).into_owned())
}

/// Lines `[start, end)` of a text file; empty when the file is missing or unreadable.
pub fn peek_lines(path: &Path, start: usize, end: usize) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    String::from_utf8_lossy(&bytes)
        .split_inclusive('\n')
        .skip(start)
        .take(end.saturating_sub(start))
        .collect()
}

#[derive(Debug, Deserialize)]
struct ReadEntireFileParams {
    path: String,
    #[serde(default = "default_max_bytes")]
    max_size_bytes: u64,
    #[serde(default = "default_encoding")]
    encoding: String,
}

fn default_max_bytes() -> u64 {
    1024 * 1024
}

fn read_entire_file_safe(_ctx: &SkillContext, params: serde_json::Value) -> Result<String> {
    let params: ReadEntireFileParams = parse_params("read_entire_file_safe", params)?;
    let resolved = normalize(Path::new(&params.path))?;
    if !resolved.is_file() {
        return Ok(format!(
            "[read_entire_file_safe] Not a file or not found: {}",
            params.path
        ));
    }
    if let Some(msg) = check_encoding("read_entire_file_safe", &params.encoding) {
        return Ok(msg);
    }
    let file = fs::File::open(&resolved).with_context(|| format!("open {}", resolved.display()))?;
    let mut buf = Vec::new();
    file.take(params.max_size_bytes)
        .read_to_end(&mut buf)
        .with_context(|| format!("read {}", resolved.display()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[derive(Debug, Deserialize)]
struct ListDirParams {
    #[serde(default = "default_dir")]
    path: String,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default = "default_list_items")]
    max_items: usize,
}

fn default_dir() -> String {
    ".".to_string()
}

fn default_list_items() -> usize {
    20
}

fn list_dir(_ctx: &SkillContext, params: serde_json::Value) -> Result<String> {
    let params: ListDirParams = parse_params("list_dir", params)?;
    let dir = normalize(Path::new(&params.path))?;
    if !dir.is_dir() {
        return Ok(format!("[list_dir] Not a directory: {}", params.path));
    }
    let suffix = suffix_filter(params.pattern.as_deref(), false);

    let mut entries: Vec<(String, bool)> = fs::read_dir(&dir)
        .with_context(|| format!("read dir {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            (entry.file_name().to_string_lossy().into_owned(), is_dir)
        })
        .collect();
    entries.sort_by_key(|(name, _)| name.to_lowercase());

    let mut items = Vec::new();
    for (name, is_dir) in entries {
        if let Some(suffix) = &suffix
            && !name.to_lowercase().ends_with(suffix.as_str())
        {
            continue;
        }
        items.push(format!("{name} {}", if is_dir { "(dir)" } else { "(file)" }));
        if items.len() >= params.max_items {
            items.push("... [truncated]".to_string());
            break;
        }
    }
    if items.is_empty() {
        return Ok("[list_dir] Directory empty or no matches".to_string());
    }
    Ok(format!(
        "[list_dir] Contents of {}:\n{}",
        dir.display(),
        items.join("\n")
    ))
}

#[derive(Debug, Deserialize)]
struct ListFilesRecursiveParams {
    #[serde(default = "default_dir")]
    path: String,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default = "default_walk_depth")]
    max_depth: usize,
    #[serde(default = "default_walk_items")]
    max_items: usize,
}

fn default_walk_depth() -> usize {
    3
}

fn default_walk_items() -> usize {
    100
}

fn list_files_recursive(_ctx: &SkillContext, params: serde_json::Value) -> Result<String> {
    let params: ListFilesRecursiveParams = parse_params("list_files_recursive", params)?;
    let base = normalize(Path::new(&params.path))?;
    if !base.is_dir() {
        return Ok(format!(
            "[list_files_recursive] Not a directory: {}",
            params.path
        ));
    }
    let suffix = suffix_filter(params.pattern.as_deref(), true);

    let mut collected = Vec::new();
    let walker = WalkDir::new(&base)
        .min_depth(1)
        .max_depth(params.max_depth)
        .sort_by_file_name();
    for entry in walker.into_iter().filter_map(|entry| entry.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if let Some(suffix) = &suffix
            && !name.ends_with(suffix.as_str())
        {
            continue;
        }
        let rel = entry.path().strip_prefix(&base).unwrap_or(entry.path());
        collected.push(rel.to_string_lossy().replace('\\', "/"));
        if collected.len() >= params.max_items {
            collected.push("... [truncated]".to_string());
            return Ok(collected.join("\n"));
        }
    }
    if collected.is_empty() {
        return Ok("[list_files_recursive] No files matched or directory empty".to_string());
    }
    Ok(collected.join("\n"))
}

#[derive(Debug, Deserialize)]
struct WriteFileSafeParams {
    path: String,
    content: String,
    #[serde(default = "default_max_bytes")]
    max_content_bytes: u64,
    #[serde(default)]
    overwrite: bool,
}

fn write_file_safe(ctx: &SkillContext, params: serde_json::Value) -> Result<String> {
    let params: WriteFileSafeParams = parse_params("write_file_safe", params)?;
    let Some(resolved) = confine(Path::new(&params.path), &ctx.project_root)? else {
        return Ok(format!(
            "[write_file_safe] Path outside project root: {}",
            params.path
        ));
    };
    if resolved.exists() && !params.overwrite {
        return Ok(format!(
            "[write_file_safe] File exists and overwrite=false: {}",
            params.path
        ));
    }

    let cap = usize::try_from(params.max_content_bytes).unwrap_or(usize::MAX);
    let content = truncate_bytes(&params.content, cap);
    if let Some(parent) = resolved.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&resolved, content).with_context(|| format!("write {}", resolved.display()))?;
    Ok(format!(
        "[write_file_safe] Wrote {} bytes to {}",
        content.len(),
        resolved.display()
    ))
}

/// Longest prefix of `text` that fits in `max_bytes` without splitting a char.
fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
