//! Recursive reasoning loop CLI.
//!
//! Runs one step of the loop, one direct dispatch, or manages the skill
//! registry directory. Configuration comes from `rlm.toml` (if present) with
//! `RLM_*` environment overrides applied once at startup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use rlm::core::types::{ActionSpec, Query};
use rlm::exit_codes;
use rlm::io::config::{LoopConfig, load_config};
use rlm::logging;
use rlm::skills::builtin::write_default_manifests;
use rlm::step::Engine;

#[derive(Parser)]
#[command(name = "rlm", version, about = "Recursive reasoning loop core")]
struct Cli {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "rlm.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one reasoning step and print the summary as JSON.
    Step {
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "")]
        context: String,
        #[arg(long, default_value_t = 0)]
        depth: u32,
    },
    /// Dispatch one action through the configured channel.
    Dispatch {
        #[arg(long)]
        skill: String,
        /// Parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, default_value_t = 0)]
        depth: u32,
        /// Force the mock channel when remote dispatch is off.
        #[arg(long)]
        mock: bool,
    },
    /// List built-in entry points and installed skill manifests.
    Skills,
    /// Write a default manifest for every built-in entry point.
    InitSkills {
        /// Overwrite existing manifests.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;
    match cli.command {
        Command::Step {
            query,
            context,
            depth,
        } => cmd_step(cfg, Query::new(query, context, depth)),
        Command::Dispatch {
            skill,
            params,
            depth,
            mock,
        } => cmd_dispatch(cfg, &skill, &params, depth, mock),
        Command::Skills => cmd_skills(cfg),
        Command::InitSkills { force } => cmd_init_skills(cfg, force),
    }
}

fn load(path: &Path) -> Result<LoopConfig> {
    load_config(path)?
        .with_env_overrides(std::env::vars())
        .context("apply RLM_* overrides")
}

fn cmd_step(cfg: LoopConfig, query: Query) -> Result<i32> {
    let engine = Engine::from_config(cfg)?;
    let summary = engine.run_step(&query);
    print_json(&summary)?;
    Ok(if summary.converged {
        exit_codes::OK
    } else {
        exit_codes::NOT_CONVERGED
    })
}

fn cmd_dispatch(cfg: LoopConfig, skill: &str, params: &str, depth: u32, mock: bool) -> Result<i32> {
    let params = parse_params(params)?;
    let engine = Engine::from_config(cfg)?;
    let action = ActionSpec::new(skill, params);
    let reasoning_id = action
        .reasoning_id()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let result = engine
        .dispatcher()
        .dispatch(&action, depth, &reasoning_id, mock);
    print_json(&result)?;
    Ok(exit_codes::OK)
}

fn cmd_skills(cfg: LoopConfig) -> Result<i32> {
    let engine = Engine::from_config(cfg)?;
    let registry = engine.registry();
    println!("entry points:");
    for definition in registry.entry_points() {
        println!("  {}  {}", definition.name, definition.description);
    }
    println!("installed ({}):", registry.registry_dir().display());
    for skill in registry.installed() {
        println!("  {}  {}", skill.name, skill.description);
    }
    Ok(exit_codes::OK)
}

fn cmd_init_skills(cfg: LoopConfig, force: bool) -> Result<i32> {
    let engine = Engine::from_config(cfg)?;
    for path in write_default_manifests(engine.registry(), force)? {
        println!("{}", path.display());
    }
    Ok(exit_codes::OK)
}

fn parse_params(raw: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw).context("parse --params json")?;
    match value {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--params must be a JSON object, got {other}"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize json")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_step_defaults() {
        let cli = Cli::parse_from(["rlm", "step", "--query", "q"]);
        assert_eq!(cli.config, PathBuf::from("rlm.toml"));
        match cli.command {
            Command::Step {
                query,
                context,
                depth,
            } => {
                assert_eq!(query, "q");
                assert_eq!(context, "");
                assert_eq!(depth, 0);
            }
            _ => panic!("expected step"),
        }
    }

    #[test]
    fn parse_init_skills_force() {
        let cli = Cli::parse_from(["rlm", "init-skills", "--force"]);
        assert!(matches!(cli.command, Command::InitSkills { force: true }));
    }

    #[test]
    fn params_must_be_an_object() {
        assert!(parse_params("{\"path\": \"a\"}").is_ok());
        assert!(parse_params("[1]").is_err());
        assert!(parse_params("nope").is_err());
    }
}
