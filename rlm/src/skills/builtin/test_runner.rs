use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;

use super::{confine, normalize, params_with_alias, parse_params};
use crate::core::budget::trim_context;
use crate::io::process::{ProcessRequest, run_bounded};
use crate::skills::{RegistryBuilder, SkillContext, SkillDefinition};

const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 300;
const STDOUT_TAIL_CHARS: usize = 8000;
const STDERR_TAIL_CHARS: usize = 4000;
const OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

pub(super) fn register(builder: RegistryBuilder) -> Result<RegistryBuilder> {
    params_with_alias(
        builder,
        "run_tests",
        json!({
            "type": "object",
            "properties": {
                "dir": {"type": "string", "minLength": 1},
                "type": {"enum": ["python", "rust"]},
                "timeout_sec": {"type": "integer"}
            },
            "required": ["dir"]
        }),
    )?
    .skill(SkillDefinition::new(
        "run_tests",
        "run_tests",
        "Run pytest or cargo test in a directory below the project root",
        run_tests,
    ))
}

#[derive(Debug, Deserialize)]
struct RunTestsParams {
    dir: String,
    #[serde(default = "default_kind", rename = "type")]
    kind: String,
    #[serde(default = "default_timeout")]
    timeout_sec: i64,
}

fn default_kind() -> String {
    "python".to_string()
}

fn default_timeout() -> i64 {
    30
}

fn command_for(kind: &str) -> Option<(&'static str, Vec<String>)> {
    match kind {
        "python" => Some((
            "pytest",
            vec!["-v".to_string(), "--tb=short".to_string()],
        )),
        "rust" => Some(("cargo", vec!["test".to_string()])),
        _ => None,
    }
}

fn run_tests(ctx: &SkillContext, params: serde_json::Value) -> Result<String> {
    let params: RunTestsParams = parse_params("run_tests", params)?;
    let dir = normalize(Path::new(&params.dir))?;
    if !dir.exists() {
        return Ok(format!("[run_tests] Path not found: {}", params.dir));
    }
    if !dir.is_dir() {
        return Ok(format!("[run_tests] Not a directory: {}", params.dir));
    }
    if confine(&dir, &ctx.project_root)?.is_none() {
        return Ok(format!("[run_tests] Path outside project root: {}", params.dir));
    }
    let kind = params.kind.trim().to_ascii_lowercase();
    let Some((program, args)) = command_for(&kind) else {
        return Ok(format!(
            "[run_tests] Unsupported type: {} (use 'python' or 'rust')",
            params.kind
        ));
    };

    let timeout_secs = clamp_timeout(params.timeout_sec);
    let output = run_bounded(&ProcessRequest {
        program: program.to_string(),
        args,
        workdir: dir,
        timeout: Duration::from_secs(timeout_secs),
        output_limit_bytes: OUTPUT_LIMIT_BYTES,
    })?;
    if output.timed_out() {
        return Ok(format!(
            "[run_tests] Execution timed out after {timeout_secs}s"
        ));
    }

    let code = output
        .exit_code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let mut lines = vec![format!("[run_tests] exit_code={code}")];
    let stdout = output.stdout_text();
    if !stdout.is_empty() {
        lines.push(format!("stdout:\n{}", trim_context(&stdout, Some(STDOUT_TAIL_CHARS))));
    }
    let stderr = output.stderr_text();
    if !stderr.is_empty() {
        lines.push(format!("stderr:\n{}", trim_context(&stderr, Some(STDERR_TAIL_CHARS))));
    }
    Ok(lines.join("\n"))
}

fn clamp_timeout(requested: i64) -> u64 {
    u64::try_from(requested)
        .unwrap_or(MIN_TIMEOUT_SECS)
        .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)
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

    #[test]
    fn timeout_is_clamped() {
        assert_eq!(clamp_timeout(-5), 1);
        assert_eq!(clamp_timeout(0), 1);
        assert_eq!(clamp_timeout(30), 30);
        assert_eq!(clamp_timeout(10_000), 300);
    }

    #[test]
    fn rejects_unsupported_type_without_spawning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_tests(
            &ctx(temp.path()),
            json!({"dir": temp.path().to_string_lossy(), "type": "ruby"}),
        )
        .expect("run");
        assert_eq!(out, "[run_tests] Unsupported type: ruby (use 'python' or 'rust')");
    }

    #[test]
    fn refuses_missing_and_outside_dirs() {
        let outer = tempfile::tempdir().expect("tempdir");
        let root = outer.path().join("project");
        std::fs::create_dir(&root).expect("mkdir");
        let c = ctx(&root);

        let out = run_tests(&c, json!({"dir": root.join("nope").to_string_lossy()})).expect("run");
        assert!(out.starts_with("[run_tests] Path not found"));
        let out = run_tests(&c, json!({"dir": outer.path().to_string_lossy()})).expect("run");
        assert!(out.starts_with("[run_tests] Path outside project root"));
    }
}
