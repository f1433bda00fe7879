//! Skill registry and built-in skills.
//!
//! Entry points and parameter schemas are registered explicitly at startup.
//! A skill becomes resolvable by name once a manifest under the registry
//! directory binds that name to a registered entry point.

pub mod builtin;
pub mod manifest;
mod registry;

pub use registry::{
    ParamsSchema, RegistryBuilder, SkillContext, SkillDefinition, SkillError, SkillFn, SkillHandle,
    SkillRegistry,
};
pub(crate) use registry::panic_message;
