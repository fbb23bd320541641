//! Compiler configuration types.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Output format of the command-line driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

/// Code generation options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Check the argument count of fixed-arity functions that are not
    /// closures (closures are always checked).
    pub verify_arguments: bool,
    /// Trap at a return whose stack height differs from the frame size.
    pub verify_stack_height: bool,
    /// Call the runtime on function entry and exit.
    pub trace_functions: bool,
    /// Log the function scope after the prologue.
    pub print_scopes: bool,
    /// Emit rethrow instead of bailing out.
    pub enable_rethrow: bool,
    /// Keep assembler comments in the compiled function.
    pub code_comments: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            verify_arguments: cfg!(debug_assertions),
            verify_stack_height: cfg!(debug_assertions),
            trace_functions: false,
            print_scopes: false,
            enable_rethrow: false,
            code_comments: false,
        }
    }
}

impl CompilerConfig {
    /// Configuration with every check off, as in a release build.
    pub fn release() -> Self {
        Self {
            verify_arguments: false,
            verify_stack_height: false,
            ..Self::default()
        }
    }

    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content, path)
    }
}
