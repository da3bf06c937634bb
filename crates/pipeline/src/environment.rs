//! Branch to environment routing

use crate::error::{PipelineError, Result};
use std::fmt;

const REF_PREFIX: &str = "refs/heads/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub const ALL: [Environment; 2] = [Environment::Development, Environment::Production];

    /// Select the environment deployed by a push to `branch`.
    ///
    /// Accepts a bare branch name or a full `refs/heads/...` ref.
    pub fn from_branch(branch: &str) -> Result<Self> {
        let name = branch.trim();
        let name = name.strip_prefix(REF_PREFIX).unwrap_or(name);
        Self::ALL
            .into_iter()
            .find(|env| env.branch() == name)
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "no environment mapping for branch {name:?} (expected \"develop\" or \"main\")"
                ))
            })
    }

    pub fn branch(self) -> &'static str {
        match self {
            Environment::Development => "develop",
            Environment::Production => "main",
        }
    }

    /// Configuration document for this environment, relative to the config directory
    pub fn config_file(self) -> &'static str {
        match self {
            Environment::Development => "dev.yaml",
            Environment::Production => "prod.yaml",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Route a branch name to its environment
pub fn route(branch: &str) -> Result<Environment> {
    Environment::from_branch(branch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_branches() {
        assert_eq!(route("develop").expect("develop"), Environment::Development);
        assert_eq!(route("main").expect("main"), Environment::Production);
        assert_eq!(
            route("refs/heads/main").expect("full ref"),
            Environment::Production
        );
    }

    #[test]
    fn test_unknown_branches_are_config_errors() {
        for branch in ["feature/x", "Main", "", "refs/heads/release", "master"] {
            assert!(
                matches!(route(branch), Err(PipelineError::Config(_))),
                "branch {branch:?} should not route"
            );
        }
    }

    #[test]
    fn test_environments_use_distinct_documents() {
        assert_ne!(
            Environment::Development.config_file(),
            Environment::Production.config_file()
        );
    }
}
