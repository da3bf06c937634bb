//! One deployment run: route, ensure schema, load, transform, verify
//!
//! Stages run strictly in order. The first failing stage ends the run and is
//! reported in a [`RunFailure`]; later stages are not attempted. Objects
//! already created are left in place.

use crate::config::PipelineConfig;
use crate::environment::{Environment, route};
use crate::error::{PipelineError, Result, RunFailure, Stage};
use crate::verify::VerificationReport;
use diagnostics::*;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use warehouse::{RetryPolicy, Warehouse, WarehouseError};

/// Directory under the repository root holding the environment documents
pub const CONFIG_DIR: &str = "config";

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub environment: String,
    pub run_id: String,
    pub tables_created: Vec<String>,
    pub rows_loaded: u64,
    pub statements_executed: usize,
    pub verification: VerificationReport,
}

/// A configured pipeline bound to one warehouse
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    warehouse: Arc<dyn Warehouse>,
    root: PathBuf,
    sql_dir: Option<PathBuf>,
    retry: RetryPolicy,
    run_id: String,
}

impl Pipeline {
    /// `root` is the repository root holding `data/` (and `config/`)
    pub fn new(
        config: Arc<PipelineConfig>,
        warehouse: Arc<dyn Warehouse>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            warehouse,
            root: root.into(),
            sql_dir: None,
            retry: RetryPolicy::default(),
            run_id: uuid7::uuid7().to_string(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Read transformation templates from `dir` instead of the built-in ones
    pub fn with_sql_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sql_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn warehouse(&self) -> &dyn Warehouse {
        self.warehouse.as_ref()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sql_dir(&self) -> Option<&Path> {
        self.sql_dir.as_deref()
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Identifier of this run, also used to deduplicate retried appends
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run every stage after routing
    pub async fn run(&self) -> std::result::Result<RunReport, RunFailure> {
        let environment = self.config.environment().name();
        let run_id = self.run_id.clone();
        let backend = self.warehouse.name().to_string();
        let target = self.config.dataset().to_string();
        info!("Starting run {run_id} for {environment} on {backend} ({target})", run_id: run_id, environment: environment, backend: backend, target: target);

        let tables_created = run_stage(Stage::EnsureSchema, self.ensure_schema()).await?;

        let data_path = self.config.data_path(&self.root);
        let schema_path = self.config.schema_path(&self.root);
        let rows_loaded =
            run_stage(Stage::Load, self.load_records(&data_path, &schema_path)).await?;

        let statements_executed = run_stage(Stage::Transform, self.run_aggregation()).await?;

        let verification = run_stage(Stage::Verify, self.verify(rows_loaded)).await?;

        info!("Run {run_id} deployed {rows_loaded} rows to {target}", run_id: run_id, rows_loaded: rows_loaded, target: target);
        Ok(RunReport {
            environment: environment.to_string(),
            run_id,
            tables_created,
            rows_loaded,
            statements_executed,
            verification,
        })
    }
}

/// Await one stage, logging its start, duration and outcome
pub async fn run_stage<T, F>(stage: Stage, fut: F) -> std::result::Result<T, RunFailure>
where
    F: Future<Output = Result<T>>,
{
    let stage_name = stage.as_str();
    info!("Stage {stage_name} started", stage_name: stage_name);
    let started = Instant::now();
    let result = fut.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(value) => {
            info!("Stage {stage_name} finished in {elapsed_ms}ms", stage_name: stage_name, elapsed_ms: elapsed_ms);
            Ok(value)
        }
        Err(source) => {
            let error = source.to_string();
            error!("Stage {stage_name} failed after {elapsed_ms}ms: {error}", stage_name: stage_name, elapsed_ms: elapsed_ms, error: error);
            Err(RunFailure { stage, source })
        }
    }
}

/// Route `branch`, load its configuration from `<root>/config`, connect and run.
///
/// `connect` builds the warehouse for the routed configuration; a connection
/// failure is reported against the schema stage, the first to need it.
pub async fn execute<C, Fut>(
    branch: &str,
    root: &Path,
    retry: RetryPolicy,
    connect: C,
) -> std::result::Result<RunReport, RunFailure>
where
    C: FnOnce(Arc<PipelineConfig>) -> Fut,
    Fut: Future<Output = std::result::Result<Arc<dyn Warehouse>, WarehouseError>>,
{
    let config = run_stage(Stage::Route, async {
        let environment = route(branch)?;
        let branch = environment.branch();
        let target = environment.name();
        info!("Branch {branch} deploys to {target}", branch: branch, target: target);
        load_config(root, environment)
    })
    .await?;

    let warehouse = connect(config.clone()).await.map_err(|e| RunFailure {
        stage: Stage::EnsureSchema,
        source: PipelineError::from(e),
    })?;

    Pipeline::new(config, warehouse, root)
        .with_retry(retry)
        .run()
        .await
}

/// Read the configuration document of `environment` under `<root>/config`
pub fn load_config(root: &Path, environment: Environment) -> Result<Arc<PipelineConfig>> {
    PipelineConfig::load(&root.join(CONFIG_DIR), environment).map(Arc::new)
}
