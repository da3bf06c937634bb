//! In-process warehouse backed by DataFusion
//!
//! Each project becomes a memory catalog and each dataset a memory schema,
//! so `project.dataset.table` paths resolve exactly as they do in BigQuery.
//! Statements written for BigQuery are accepted after their backtick-quoted
//! paths are rewritten into double-quoted three-part names.
//!
//! Appends insert into the registered memory table in place, so views defined
//! over a table see rows appended after the view was created.

use crate::error::{Result, WarehouseError};
use crate::rows::{Row, batches_to_rows};
use crate::table::{DatasetRef, TableRef, TableSchema};
use crate::{QueryOutcome, Warehouse};
use arrow_array::RecordBatch;
use async_trait::async_trait;
use datafusion::catalog::{CatalogProvider, MemoryCatalogProvider, MemorySchemaProvider, SchemaProvider};
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::datasource::MemTable;
use datafusion::prelude::SessionContext;
use diagnostics::*;
use std::sync::Arc;

/// Rewrite BigQuery backtick paths (`` `a.b.c` ``) to `"a"."b"."c"`.
///
/// Backticks inside single-quoted string literals are left alone.
pub fn to_local_sql(sql: &str) -> Result<String> {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_string = !in_string;
                out.push(c);
            }
            '`' if !in_string => {
                let mut path = String::new();
                let mut closed = false;
                for p in chars.by_ref() {
                    if p == '`' {
                        closed = true;
                        break;
                    }
                    path.push(p);
                }
                if !closed {
                    return Err(WarehouseError::Invalid(
                        "unterminated backtick identifier".into(),
                    ));
                }
                let parts: Vec<String> = path
                    .split('.')
                    .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
                    .collect();
                out.push_str(&parts.join("."));
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

/// Double-quoted `"project"."dataset"."table"` reference for DataFusion
fn quoted_path(table: &TableRef) -> String {
    [table.project(), table.dataset(), table.table()]
        .iter()
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

pub struct LocalWarehouse {
    ctx: SessionContext,
}

impl Default for LocalWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalWarehouse {
    pub fn new() -> Self {
        Self {
            ctx: SessionContext::new(),
        }
    }

    /// The underlying session, for ad-hoc inspection
    pub fn session(&self) -> &SessionContext {
        &self.ctx
    }

    fn schema_provider(&self, dataset: &DatasetRef) -> Option<Arc<dyn SchemaProvider>> {
        self.ctx.catalog(dataset.project())?.schema(dataset.dataset())
    }

    fn require_schema(&self, dataset: &DatasetRef) -> Result<Arc<dyn SchemaProvider>> {
        self.schema_provider(dataset)
            .ok_or_else(|| WarehouseError::NotFound(format!("dataset {dataset}")))
    }
}

#[async_trait]
impl Warehouse for LocalWarehouse {
    fn name(&self) -> &str {
        "local"
    }

    async fn list_datasets(&self, project: &str) -> Result<Vec<String>> {
        let mut names = self
            .ctx
            .catalog(project)
            .map(|catalog| catalog.schema_names())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn ensure_dataset(&self, dataset: &DatasetRef, _location: &str) -> Result<bool> {
        let catalog = match self.ctx.catalog(dataset.project()) {
            Some(catalog) => catalog,
            None => {
                let catalog: Arc<dyn CatalogProvider> = Arc::new(MemoryCatalogProvider::new());
                let _ = self
                    .ctx
                    .register_catalog(dataset.project(), catalog.clone());
                catalog
            }
        };

        if catalog.schema(dataset.dataset()).is_some() {
            return Ok(false);
        }

        let _ = catalog.register_schema(dataset.dataset(), Arc::new(MemorySchemaProvider::new()))?;
        let name = dataset.to_string();
        debug!("Created local dataset {name}", name: name);
        Ok(true)
    }

    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> Result<bool> {
        let provider = self.require_schema(table.dataset_ref())?;
        if provider.table_exist(table.table()) {
            return Ok(false);
        }

        let mem = MemTable::try_new(schema.to_arrow(), vec![vec![]])?;
        let _ = provider.register_table(table.table().to_string(), Arc::new(mem))?;
        let name = table.to_string();
        debug!("Created local table {name}", name: name);
        Ok(true)
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        Ok(self
            .schema_provider(table.dataset_ref())
            .is_some_and(|provider| provider.table_exist(table.table())))
    }

    async fn append_rows(
        &self,
        table: &TableRef,
        batches: &[RecordBatch],
        _load_id: &str,
    ) -> Result<u64> {
        let provider = self.require_schema(table.dataset_ref())?;
        let existing = provider
            .table(table.table())
            .await?
            .ok_or_else(|| WarehouseError::NotFound(format!("table {table}")))?;
        let schema = existing.schema();

        // Re-tag with the table schema; this also enforces NOT NULL columns.
        let rows = batches
            .iter()
            .map(|batch| RecordBatch::try_new(schema.clone(), batch.columns().to_vec()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let submitted: u64 = rows.iter().map(|batch| batch.num_rows() as u64).sum();
        if submitted == 0 {
            return Ok(0);
        }

        let _ = self
            .ctx
            .read_batches(rows)?
            .write_table(&quoted_path(table), DataFrameWriteOptions::new())
            .await?;

        let name = table.to_string();
        debug!("Appended {submitted} rows to local table {name}", submitted: submitted, name: name);
        Ok(submitted)
    }

    async fn execute(&self, sql: &str) -> Result<QueryOutcome> {
        let local = to_local_sql(sql)?;
        debug!("Executing locally: {local}", local: local);
        let _ = self.ctx.sql(&local).await?.collect().await?;
        Ok(QueryOutcome::default())
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let local = to_local_sql(sql)?;
        debug!("Querying locally: {local}", local: local);
        let batches = self.ctx.sql(&local).await?.collect().await?;
        batches_to_rows(&batches)
    }
}
