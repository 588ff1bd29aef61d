//! # options
//! Runtime configuration, built in code with [`TaintOptions::builder`] or
//! read from a toml file.
//!
//! ```toml
//! policy = "strict"
//! track_pc = true
//! backend = "dense"
//! install_fault_handler = false
//! ```
use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::Error;

/// What the engine does with an instruction it has no rule for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Report the gap once and treat the instruction as having no taint effect
    #[default]
    Permissive,
    /// Fail instrumentation of the instruction
    Strict,
}

/// The shadow memory backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowBackend {
    /// Reserve the shadow read-only and commit regions on first write
    #[default]
    Lazy,
    /// Commit the whole shadow up front
    Dense,
}

#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Serialize, Deserialize)]
#[serde(default)]
pub struct TaintOptions {
    #[builder(default)]
    pub policy: GapPolicy,
    /// Give `pc` a shadow slot, written by branches and read by instructions
    /// which use `pc` as an operand
    #[builder(default = false)]
    pub track_pc: bool,
    #[builder(default)]
    pub backend: ShadowBackend,
    /// Install the handler recovering faults on untouched shadow regions.
    /// Hosts which only execute plans through the rule engine do not need it.
    #[builder(default = true)]
    pub install_fault_handler: bool,
}

impl Default for TaintOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TaintOptions {
    /// Parse options from a toml document, absent keys take their default
    pub fn from_toml(toml: &str) -> Result<Self, Error> {
        Ok(toml::from_str(toml)?)
    }

    /// Read options from a toml file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::from_toml(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TaintOptions::default();
        assert_eq!(options.policy, GapPolicy::Permissive);
        assert_eq!(options.backend, ShadowBackend::Lazy);
        assert!(!options.track_pc);
        assert!(options.install_fault_handler);
    }

    #[test]
    fn test_toml_parsing() {
        let options = TaintOptions::from_toml(
            r#"
            policy = "strict"
            track_pc = true
            "#,
        )
        .unwrap();
        assert_eq!(
            options,
            TaintOptions::builder()
                .policy(GapPolicy::Strict)
                .track_pc(true)
                .build()
        );
    }

    #[test]
    fn test_toml_unknown_backend() {
        assert!(matches!(
            TaintOptions::from_toml(r#"backend = "sparse""#),
            Err(Error::Options(_))
        ));
    }
}
