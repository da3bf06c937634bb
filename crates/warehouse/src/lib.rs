//! Warehouse: access to the datasets, tables and queries the pipeline deploys
//!
//! The [`Warehouse`] trait is the only way the pipeline touches durable
//! state. Two implementations exist:
//!
//! - [`BigQueryWarehouse`] talks to the BigQuery REST API
//! - [`LocalWarehouse`] runs the same statements on an in-process DataFusion
//!   engine, used for rehearsals and tests

mod bigquery;
mod credentials;
mod error;
mod local;
mod retry;
mod rows;
mod table;

pub use bigquery::{BigQueryWarehouse, DEFAULT_ENDPOINT};
pub use credentials::{
    ACCESS_TOKEN_ENV, CREDENTIALS_ENV, CREDENTIALS_FILE_ENV, CredentialSummary, Credentials,
    Secret,
};
pub use error::{Result, WarehouseError};
pub use local::{LocalWarehouse, to_local_sql};
pub use retry::RetryPolicy;
pub use rows::{Row, batches_to_ndjson, batches_to_rows, cell_as_f64, cell_as_str, cell_as_u64};
pub use table::{
    DatasetRef, FieldMode, FieldSpec, FieldType, TableRef, TableSchema, validate_column_name,
    validate_dataset_id, validate_project_id, validate_table_id,
};

use arrow_array::RecordBatch;
use async_trait::async_trait;

/// Statistics reported for a statement that returns no rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOutcome {
    pub affected_rows: Option<u64>,
    pub bytes_processed: Option<u64>,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Dataset ids of a project
    async fn list_datasets(&self, project: &str) -> Result<Vec<String>>;

    /// Create the dataset unless it exists. Returns true when created.
    async fn ensure_dataset(&self, dataset: &DatasetRef, location: &str) -> Result<bool>;

    /// Create the table unless it exists. Returns true when created.
    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> Result<bool>;

    /// Whether a table or view exists
    async fn table_exists(&self, table: &TableRef) -> Result<bool>;

    /// Append rows to an existing table and return how many were submitted.
    ///
    /// `load_id` identifies the load; retrying with the same id must not
    /// duplicate rows where the backend can prevent it.
    async fn append_rows(&self, table: &TableRef, batches: &[RecordBatch], load_id: &str)
    -> Result<u64>;

    /// Run one statement (DDL, DML or a query whose rows are discarded)
    async fn execute(&self, sql: &str) -> Result<QueryOutcome>;

    /// Run one query and return its rows
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// `COUNT(*)` of a table or view, `None` when it does not exist
    async fn row_count(&self, table: &TableRef) -> Result<Option<u64>> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let sql = format!("SELECT COUNT(*) AS row_count FROM {}", table.sql_path());
        let rows = self.query(&sql).await?;
        let count = rows
            .first()
            .and_then(|row| cell_as_u64(row, "row_count"))
            .ok_or_else(|| WarehouseError::Query(format!("no row count returned for {table}")))?;
        Ok(Some(count))
    }
}
