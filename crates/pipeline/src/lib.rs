//! Pipeline: deploys the employee dataset to the environment selected by a branch
//!
//! A run routes the branch to an environment, makes sure the dataset and
//! tables exist, appends the input file to the base table, rebuilds the
//! derived summary table and view, and verifies the result.

mod check;
mod config;
mod environment;
mod error;
mod loader;
mod runner;
mod templates;
mod transform;
mod verify;

pub use check::{ConnectionReport, check_connection};
pub use config::{
    ConfigFile, HIGH_EARNERS_VIEW, PipelineConfig, SUMMARY_TABLE, TemplateParams,
};
pub use environment::{Environment, route};
pub use error::{PipelineError, Result, RunFailure, Stage};
pub use loader::{
    AUDIT_COLUMNS, base_table_schema, parse_records, read_input_schema, summary_table_schema,
};
pub use runner::{CONFIG_DIR, Pipeline, RunReport, execute, load_config, run_stage};
pub use templates::{SqlTemplate, TEMPLATE_FILES, TransformTemplates};
pub use verify::{DepartmentSummary, VerificationReport};
