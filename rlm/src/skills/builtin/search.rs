use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use walkdir::WalkDir;

use super::{confine, normalize, params_with_alias, parse_params};
use crate::skills::{RegistryBuilder, SkillContext, SkillDefinition};

const MAX_MATCH_LINES: usize = 100;
const MAX_LINE_CHARS: usize = 200;
const BINARY_SUFFIXES: &[&str] = &[
    "pyc", "so", "dll", "exe", "bin", "png", "jpg", "ico", "woff", "ttf", "rlib", "o",
];

pub(super) fn register(builder: RegistryBuilder) -> Result<RegistryBuilder> {
    let builder = params_with_alias(
        builder,
        "search_codebase",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "pattern": {"type": "string", "minLength": 1},
                "mode": {"enum": ["keyword", "regex"]},
                "max_files": {"type": "integer", "minimum": 1}
            },
            "required": ["pattern"]
        }),
    )?;
    let builder = params_with_alias(
        builder,
        "analyze_code",
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string"},
                "language": {"type": "string"},
                "max_length": {"type": "integer", "minimum": 1}
            },
            "required": ["code"]
        }),
    )?;
    builder
        .skill(SkillDefinition::new(
            "search_codebase",
            "search_codebase",
            "Search text files below the project root by keyword or regex",
            search_codebase,
        ))?
        .skill(SkillDefinition::new(
            "analyze_code",
            "analyze_code",
            "Flag common error patterns in a code snippet",
            analyze_code,
        ))
}

#[derive(Debug, Deserialize)]
struct SearchCodebaseParams {
    #[serde(default = "default_path")]
    path: String,
    pattern: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_max_files")]
    max_files: usize,
}

fn default_path() -> String {
    ".".to_string()
}

fn default_mode() -> String {
    "keyword".to_string()
}

fn default_max_files() -> usize {
    50
}

enum Matcher {
    Keyword(String),
    Pattern(Regex),
}

impl Matcher {
    fn is_match(&self, line: &str) -> bool {
        match self {
            Matcher::Keyword(needle) => line.contains(needle.as_str()),
            Matcher::Pattern(re) => re.is_match(line),
        }
    }
}

fn is_text_file(path: &Path) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => !BINARY_SUFFIXES.contains(&ext.to_ascii_lowercase().as_str()),
        None => true,
    }
}

fn search_codebase(ctx: &SkillContext, params: serde_json::Value) -> Result<String> {
    let params: SearchCodebaseParams = parse_params("search_codebase", params)?;
    let dir = normalize(Path::new(&params.path))?;
    if !dir.exists() {
        return Ok(format!("[search_codebase] Path not found: {}", params.path));
    }
    if !dir.is_dir() {
        return Ok(format!("[search_codebase] Not a directory: {}", params.path));
    }
    if confine(&dir, &ctx.project_root)?.is_none() {
        return Ok(format!(
            "[search_codebase] Path outside project root: {}",
            params.path
        ));
    }
    let matcher = if params.mode == "regex" {
        match Regex::new(&params.pattern) {
            Ok(re) => Matcher::Pattern(re),
            Err(err) => return Ok(format!("[search_codebase] Invalid regex: {err}")),
        }
    } else {
        Matcher::Keyword(params.pattern.clone())
    };

    let mut matches = Vec::new();
    let mut files_scanned = 0usize;
    let walker = WalkDir::new(&dir).min_depth(1).sort_by_file_name();
    for entry in walker.into_iter().filter_map(|entry| entry.ok()) {
        if !entry.file_type().is_file() || !is_text_file(entry.path()) {
            continue;
        }
        if files_scanned >= params.max_files {
            matches.push(format!("... [truncated at {} files]", params.max_files));
            break;
        }
        files_scanned += 1;
        let Ok(bytes) = fs::read(entry.path()) else {
            continue;
        };
        let content = String::from_utf8_lossy(&bytes);
        for (idx, line) in content.lines().enumerate() {
            if matcher.is_match(line) {
                let snippet: String = line.trim().chars().take(MAX_LINE_CHARS).collect();
                matches.push(format!("{}:{}: {snippet}", entry.path().display(), idx + 1));
            }
        }
    }

    if matches.is_empty() {
        return Ok(format!(
            "[search_codebase] No matches for pattern in {} (files scanned: {files_scanned})",
            params.path
        ));
    }
    matches.truncate(MAX_MATCH_LINES);
    Ok(format!("[search_codebase] Matches:\n{}", matches.join("\n")))
}

#[derive(Debug, Deserialize)]
struct AnalyzeCodeParams {
    code: String,
    #[serde(default = "default_max_length")]
    max_length: usize,
}

fn default_max_length() -> usize {
    4096
}

static SYNTAX_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bSyntaxError\b").expect("syntax error regex should compile")
});
static PANIC_MACRO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bpanic\s*!").expect("panic macro regex should compile"));
static PANIC_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bpanic\b").expect("panic word regex should compile"));
static UNDEFINED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)undefined|NameError|AttributeError").expect("undefined regex should compile")
});
static UNWRAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"unwrap\s*\(\s*\)").expect("unwrap regex should compile"));

/// Root-cause heuristics over a snippet. Pure text inspection.
fn rca_summary(code: &str, max_length: usize) -> String {
    let code: String = code.chars().take(max_length).collect();
    let mut findings = Vec::new();
    if SYNTAX_ERROR_RE.is_match(&code) {
        findings.push("SyntaxError mentioned");
    }
    if PANIC_MACRO_RE.is_match(&code) {
        findings.push("panic! (Rust) detected");
    } else if PANIC_WORD_RE.is_match(&code) {
        findings.push("panic reference");
    }
    if UNDEFINED_RE.is_match(&code) {
        findings.push("undefined/NameError/AttributeError pattern");
    }
    if UNWRAP_RE.is_match(&code) {
        findings.push("unwrap() may panic");
    }
    if findings.is_empty() {
        "RCA summary: No obvious error patterns found.".to_string()
    } else {
        format!("RCA summary: {}", findings.join("; "))
    }
}

fn analyze_code(_ctx: &SkillContext, params: serde_json::Value) -> Result<String> {
    let params: AnalyzeCodeParams = parse_params("analyze_code", params)?;
    Ok(rca_summary(&params.code, params.max_length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn ctx(root: &Path) -> SkillContext {
        SkillContext {
            project_root: root.to_path_buf(),
            registry_dir: root.join("skills"),
            entries: BTreeSet::new(),
        }
    }

    fn seed(root: &Path) {
        fs::create_dir_all(root.join("src")).expect("mkdir");
        fs::write(root.join("src/lib.rs"), "fn main() {\n    let x = foo().unwrap();\n}\n")
            .expect("write");
        fs::write(root.join("src/util.rs"), "// helper\nfn foo() {}\n").expect("write");
        fs::write(root.join("src/logo.png"), "fn foo() in a png").expect("write");
    }

    #[test]
    fn keyword_search_reports_file_and_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        seed(temp.path());
        let root = temp.path().to_string_lossy().into_owned();
        let out = search_codebase(&ctx(temp.path()), json!({"path": root, "pattern": "foo("}))
            .expect("search");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "[search_codebase] Matches:");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("lib.rs:2: let x = foo().unwrap();"));
        assert!(lines[2].ends_with("util.rs:2: fn foo() {}"));
    }

    #[test]
    fn regex_search_and_invalid_regex() {
        let temp = tempfile::tempdir().expect("tempdir");
        seed(temp.path());
        let root = temp.path().to_string_lossy().into_owned();
        let c = ctx(temp.path());
        let out = search_codebase(&c, json!({"path": root, "pattern": r"^//", "mode": "regex"}))
            .expect("search");
        assert!(out.contains("util.rs:1: // helper"));
        let out = search_codebase(&c, json!({"path": root, "pattern": "(", "mode": "regex"}))
            .expect("search");
        assert!(out.starts_with("[search_codebase] Invalid regex"));
    }

    #[test]
    fn search_stops_at_max_files_and_reports_misses() {
        let temp = tempfile::tempdir().expect("tempdir");
        seed(temp.path());
        let root = temp.path().to_string_lossy().into_owned();
        let c = ctx(temp.path());
        let out = search_codebase(&c, json!({"path": root, "pattern": "fn", "max_files": 1}))
            .expect("search");
        assert!(out.ends_with("... [truncated at 1 files]"));
        let out = search_codebase(&c, json!({"path": root, "pattern": "zzz"})).expect("search");
        assert_eq!(
            out,
            format!("[search_codebase] No matches for pattern in {root} (files scanned: 2)")
        );
    }

    #[test]
    fn search_outside_root_is_refused() {
        let outer = tempfile::tempdir().expect("tempdir");
        let root = outer.path().join("project");
        fs::create_dir(&root).expect("mkdir");
        let out = search_codebase(
            &ctx(&root),
            json!({"path": outer.path().to_string_lossy(), "pattern": "x"}),
        )
        .expect("search");
        assert!(out.starts_with("[search_codebase] Path outside project root"));
    }

    #[test]
    fn rca_flags_patterns() {
        assert_eq!(
            rca_summary("let v = x.unwrap();\npanic!(\"bad\")", 4096),
            "RCA summary: panic! (Rust) detected; unwrap() may panic"
        );
        assert_eq!(
            rca_summary("NameError: name 'foo' is not defined", 4096),
            "RCA summary: undefined/NameError/AttributeError pattern"
        );
        assert_eq!(
            rca_summary("a runtime panic occurred", 4096),
            "RCA summary: panic reference"
        );
        assert_eq!(
            rca_summary("fn ok() {}", 4096),
            "RCA summary: No obvious error patterns found."
        );
        assert_eq!(
            rca_summary("fine ... SyntaxError", 8),
            "RCA summary: No obvious error patterns found."
        );
    }
}
