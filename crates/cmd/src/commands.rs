//! Subcommand implementations shared by the binary and its tests

use clap::ValueEnum;
use diagnostics::*;
use pipeline::{
    ConnectionReport, Pipeline, PipelineConfig, PipelineError, RunFailure, RunReport, Stage,
    check_connection, execute, load_config, route, run_stage,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use warehouse::{
    BigQueryWarehouse, CredentialSummary, Credentials, LocalWarehouse, RetryPolicy, Warehouse,
    WarehouseError,
};

/// Where statements run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// BigQuery, authenticated from the environment
    Bigquery,
    /// In-process engine; nothing outlives the command
    Local,
}

/// Build the warehouse client for a routed configuration
pub async fn connect(
    backend: Backend,
    config: Arc<PipelineConfig>,
) -> Result<Arc<dyn Warehouse>, WarehouseError> {
    match backend {
        Backend::Local => Ok(Arc::new(LocalWarehouse::new())),
        Backend::Bigquery => {
            let credentials = Credentials::from_env()?;
            let summary = credentials.summary();
            let kind = summary.kind;
            let account = summary.client_email.unwrap_or_else(|| "(unnamed)".to_string());
            info!("Authenticating with {kind} credentials for {account}", kind: kind, account: account);
            let warehouse =
                BigQueryWarehouse::connect(&credentials, config.project_id(), config.location())
                    .await?;
            Ok(Arc::new(warehouse))
        }
    }
}

/// Full deployment of `branch`
pub async fn run_command(
    root: &Path,
    branch: &str,
    backend: Backend,
    retry: RetryPolicy,
) -> Result<RunReport, RunFailure> {
    execute(branch, root, retry, move |config| connect(backend, config)).await
}

/// Resolve the configuration a push to `branch` would deploy
pub fn route_command(root: &Path, branch: &str) -> Result<Arc<PipelineConfig>, RunFailure> {
    route(branch)
        .and_then(|environment| load_config(root, environment))
        .map_err(|source| RunFailure {
            stage: Stage::Route,
            source,
        })
}

/// Options of a single-stage invocation
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub root: PathBuf,
    pub branch: String,
    pub backend: Backend,
    pub retry: RetryPolicy,
    /// Input file replacing the configured one (load only)
    pub data_file: Option<PathBuf>,
    /// Template directory replacing the built-in templates (transform only)
    pub sql_dir: Option<PathBuf>,
}

/// What a single stage produced
#[derive(Debug)]
pub enum StageOutput {
    Created(Vec<String>),
    Loaded(u64),
    Executed(usize),
    Verified(pipeline::VerificationReport),
}

/// Routing runs before every stage and has no output of its own
fn route_is_not_standalone() -> RunFailure {
    RunFailure {
        stage: Stage::Route,
        source: PipelineError::Config(
            "routing is not a standalone stage; use the route command".into(),
        ),
    }
}

/// Run one stage on its own against the routed environment
pub async fn stage_command(stage: Stage, options: &StageOptions) -> Result<StageOutput, RunFailure> {
    if stage == Stage::Route {
        return Err(route_is_not_standalone());
    }
    let config = route_command(&options.root, &options.branch)?;
    let warehouse = connect(options.backend, config.clone())
        .await
        .map_err(|e| RunFailure {
            stage,
            source: PipelineError::from(e),
        })?;

    let mut pipeline =
        Pipeline::new(config.clone(), warehouse, &options.root).with_retry(options.retry);
    if let Some(dir) = &options.sql_dir {
        pipeline = pipeline.with_sql_dir(dir);
    }

    match stage {
        Stage::Route => Err(route_is_not_standalone()),
        Stage::EnsureSchema => run_stage(stage, pipeline.ensure_schema())
            .await
            .map(StageOutput::Created),
        Stage::Load => {
            let data_path = options
                .data_file
                .clone()
                .unwrap_or_else(|| config.data_path(&options.root));
            let schema_path = config.schema_path(&options.root);
            run_stage(stage, pipeline.load_records(&data_path, &schema_path))
                .await
                .map(StageOutput::Loaded)
        }
        Stage::Transform => run_stage(stage, pipeline.run_aggregation())
            .await
            .map(StageOutput::Executed),
        Stage::Verify => run_stage(stage, pipeline.verify(0))
            .await
            .map(StageOutput::Verified),
    }
}

/// Outcome of `check`
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    /// Present for the BigQuery backend
    pub credential: Option<CredentialSummary>,
    pub connection: ConnectionReport,
}

/// Read-only connectivity check
pub async fn check_command(
    root: &Path,
    branch: &str,
    backend: Backend,
    retry: RetryPolicy,
) -> Result<CheckReport, RunFailure> {
    let config = route_command(root, branch)?;
    let failure = |source: PipelineError| RunFailure {
        stage: Stage::EnsureSchema,
        source,
    };
    let credential = match backend {
        Backend::Bigquery => Some(
            Credentials::from_env()
                .map_err(|e| failure(e.into()))?
                .summary(),
        ),
        Backend::Local => None,
    };
    let warehouse = connect(backend, config.clone())
        .await
        .map_err(|e| failure(e.into()))?;
    let connection = check_connection(warehouse.as_ref(), &config, retry)
        .await
        .map_err(failure)?;
    Ok(CheckReport {
        credential,
        connection,
    })
}
