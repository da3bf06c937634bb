//! Connectivity check against a configured project

use crate::config::PipelineConfig;
use crate::error::Result;
use diagnostics::*;
use serde::Serialize;
use warehouse::{RetryPolicy, Warehouse};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub project_id: String,
    pub datasets: Vec<String>,
    /// Whether the configured dataset is among `datasets`
    pub target_exists: bool,
}

/// List the datasets of the configured project without changing anything
pub async fn check_connection(
    warehouse: &dyn Warehouse,
    config: &PipelineConfig,
    retry: RetryPolicy,
) -> Result<ConnectionReport> {
    let project_id = config.project_id().to_string();
    let datasets = retry
        .run("list datasets", || warehouse.list_datasets(&project_id))
        .await?;
    let target_exists = datasets
        .iter()
        .any(|d| d == config.dataset().dataset());

    let count = datasets.len();
    let backend = warehouse.name().to_string();
    info!("Connected to {project_id} via {backend}: {count} datasets", project_id: project_id, backend: backend, count: count);
    if !target_exists {
        let dataset = config.dataset().to_string();
        warn!("Dataset {dataset} does not exist yet", dataset: dataset);
    }

    Ok(ConnectionReport {
        project_id,
        datasets,
        target_exists,
    })
}
