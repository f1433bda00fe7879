//! Prompt builder for one structured step.
//!
//! The system message is the configured instruction and the installed skills,
//! followed by the augmentation template of the active use case (generic has
//! none). The user message is the serialized query with its context already
//! trimmed to budget.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::Query;
use crate::io::config::UseCase;
use crate::io::source::Prompt;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// One embedded template per use-case augmentation, keyed by template name.
const AUGMENTATIONS: [(&str, &str); 3] = [
    ("codegen.md", include_str!("prompts/codegen.md")),
    ("code_review.md", include_str!("prompts/code_review.md")),
    ("research.md", include_str!("prompts/research.md")),
];

fn augmentation(use_case: UseCase) -> Option<&'static str> {
    match use_case {
        UseCase::Generic => None,
        UseCase::Codegen => Some("codegen.md"),
        UseCase::CodeReview => Some("code_review.md"),
        UseCase::Research => Some("research.md"),
    }
}

/// Skill listing entry shown to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillSummary {
    pub name: String,
    pub description: String,
}

pub struct PromptBuilder {
    env: Environment<'static>,
    instruction: String,
    use_case: UseCase,
}

impl PromptBuilder {
    pub fn new(instruction: &str, use_case: UseCase) -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        for (name, source) in AUGMENTATIONS {
            env.add_template(name, source)
                .expect("augmentation template should be valid");
        }
        Self {
            env,
            instruction: instruction.trim().to_string(),
            use_case,
        }
    }

    pub fn build(&self, query: &Query, skills: &[SkillSummary]) -> Result<Prompt> {
        let template = self.env.get_template("system")?;
        let system = template
            .render(context! {
                instruction => self.instruction.as_str(),
                skills => skills,
                augmentation => augmentation(self.use_case),
            })
            .context("render system prompt")?;
        let user = serde_json::to_string(query).context("serialize query")?;
        Ok(Prompt {
            system: system.trim().to_string(),
            user,
        })
    }
}
