//! # options
//! ```toml
//! fail_address_leaks = true
//! dump_taint_on_exit = "/tmp/taint.dump"
//! ```
use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, TypedBuilder, Serialize, Deserialize)]
#[serde(default)]
pub struct AslrOptions {
    /// Fail a system call which would leak an address, instead of only
    /// reporting it
    #[builder(default = false)]
    pub fail_address_leaks: bool,
    /// Where to dump the shadow memory when the guard finishes
    #[builder(default = None, setter(strip_option))]
    pub dump_taint_on_exit: Option<PathBuf>,
}

impl AslrOptions {
    pub fn from_toml(toml: &str) -> Result<Self, Error> {
        Ok(toml::from_str(toml)?)
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, Error> {
        Self::from_toml(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_parsing() {
        let options = AslrOptions::from_toml(
            r#"
            fail_address_leaks = true
            dump_taint_on_exit = "/tmp/taint.dump"
            "#,
        )
        .unwrap();
        assert_eq!(
            options,
            AslrOptions::builder()
                .fail_address_leaks(true)
                .dump_taint_on_exit(PathBuf::from("/tmp/taint.dump"))
                .build()
        );
        assert_eq!(AslrOptions::from_toml("").unwrap(), AslrOptions::default());
    }
}
