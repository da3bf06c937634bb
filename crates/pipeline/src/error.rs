//! Error types for pipeline runs

use std::fmt;
use thiserror::Error;
use warehouse::WarehouseError;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Unknown branch, unreadable or incomplete configuration, bad identifiers
    #[error("Configuration error: {0}")]
    Config(String),

    /// The input file lacks columns the schema requires
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The input file has the right columns but unusable values
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Warehouse(e) if e.is_retryable())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// The stages of one run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Route,
    EnsureSchema,
    Load,
    Transform,
    Verify,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Route,
        Stage::EnsureSchema,
        Stage::Load,
        Stage::Transform,
        Stage::Verify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Route => "route",
            Stage::EnsureSchema => "ensure_schema",
            Stage::Load => "load",
            Stage::Transform => "transform",
            Stage::Verify => "verify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a run: the stage that failed and why
#[derive(Error, Debug)]
#[error("pipeline failed at stage {stage}: {source}")]
pub struct RunFailure {
    pub stage: Stage,
    pub source: PipelineError,
}
