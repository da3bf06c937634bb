//! Table creation and CSV loading
//!
//! The input file is parsed and checked completely before the warehouse is
//! contacted, so a file with missing columns or bad values never loads
//! partially.

use crate::error::{PipelineError, Result};
use crate::runner::Pipeline;
use arrow::array::{ArrayRef, TimestampMicrosecondArray};
use arrow_array::RecordBatch;
use arrow_csv::ReaderBuilder;
use arrow_csv::reader::Format;
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use diagnostics::*;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use warehouse::{FieldMode, FieldSpec, FieldType, TableSchema};

/// Columns added to the base table and filled with the load time
pub const AUDIT_COLUMNS: [&str; 2] = ["created_at", "updated_at"];

/// Base table columns: the input schema followed by the audit columns
pub fn base_table_schema(input: &TableSchema) -> Result<TableSchema> {
    let mut schema = input.clone();
    for column in AUDIT_COLUMNS {
        schema = schema.with_field(FieldSpec::load_timestamp(column))?;
    }
    Ok(schema)
}

/// Columns of the department summary table
pub fn summary_table_schema() -> Result<TableSchema> {
    Ok(TableSchema::new(vec![
        FieldSpec::new("department", FieldType::String, FieldMode::Nullable),
        FieldSpec::new("employee_count", FieldType::Integer, FieldMode::Nullable),
        FieldSpec::new("avg_salary", FieldType::Float, FieldMode::Nullable),
        FieldSpec::new("total_salary", FieldType::Float, FieldMode::Nullable),
        FieldSpec::new("last_updated", FieldType::Timestamp, FieldMode::Nullable),
    ])?)
}

/// Read the schema description of the input file
pub fn read_input_schema(path: &Path) -> Result<TableSchema> {
    TableSchema::from_json_file(path).map_err(|e| {
        PipelineError::Config(format!("cannot use schema file {}: {e}", path.display()))
    })
}

/// Parse a CSV document into batches shaped like the base table.
///
/// The header must contain every column of `input`; extra columns are
/// ignored. REQUIRED columns may not be empty. Audit columns get `loaded_at`.
pub fn parse_records(
    csv: &[u8],
    input: &TableSchema,
    loaded_at: DateTime<Utc>,
) -> Result<Vec<RecordBatch>> {
    let target = base_table_schema(input)?;
    let format = Format::default().with_header(true);

    let mut cursor = Cursor::new(csv);
    let (header, _) = format
        .infer_schema(&mut cursor, Some(0))
        .map_err(|e| PipelineError::InvalidData(format!("cannot read CSV header: {e}")))?;

    let header_names: Vec<&str> = header.fields().iter().map(|f| f.name().as_str()).collect();
    let missing: Vec<&str> = input
        .column_names()
        .filter(|name| !header_names.contains(name))
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::SchemaMismatch(format!(
            "input file is missing required column(s): {}",
            missing.join(", ")
        )));
    }

    // Declared columns parse as their type; anything else stays text.
    let file_fields: Vec<Field> = header_names
        .iter()
        .map(|name| {
            let data_type = input
                .field(name)
                .map(|f| f.field_type.arrow_type())
                .unwrap_or(DataType::Utf8);
            Field::new(*name, data_type, true)
        })
        .collect();

    cursor.set_position(0);
    let reader = ReaderBuilder::new(Arc::new(Schema::new(file_fields)))
        .with_format(format)
        .build(cursor)
        .map_err(|e| PipelineError::InvalidData(format!("cannot read CSV: {e}")))?;

    let target_arrow = target.to_arrow();
    let loaded_micros = loaded_at.timestamp_micros();
    let mut batches = Vec::new();
    let mut row_offset = 0usize;

    for batch in reader {
        let batch = batch.map_err(|e| PipelineError::InvalidData(e.to_string()))?;
        let num_rows = batch.num_rows();

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(target.fields().len());
        for field in target.fields() {
            let column = match batch.column_by_name(&field.name) {
                Some(column) if input.field(&field.name).is_some() => column.clone(),
                _ if field.defaults_to_load_time => Arc::new(
                    TimestampMicrosecondArray::from(vec![loaded_micros; num_rows])
                        .with_timezone("UTC"),
                ) as ArrayRef,
                _ => {
                    return Err(PipelineError::SchemaMismatch(format!(
                        "no value for column {}",
                        field.name
                    )));
                }
            };

            if field.is_required() && column.null_count() > 0 {
                let first = (0..num_rows).find(|i| column.is_null(*i)).unwrap_or(0);
                return Err(PipelineError::InvalidData(format!(
                    "column {} is REQUIRED but empty in data row {}",
                    field.name,
                    row_offset + first + 1
                )));
            }
            columns.push(column);
        }

        batches.push(RecordBatch::try_new(target_arrow.clone(), columns).map_err(|e| {
            PipelineError::InvalidData(format!("rows do not fit the table schema: {e}"))
        })?);
        row_offset += num_rows;
    }

    Ok(batches)
}

impl Pipeline {
    /// Create the dataset, the base table and the summary table when absent.
    ///
    /// Safe to repeat: existing objects are left untouched.
    pub async fn ensure_schema(&self) -> Result<Vec<String>> {
        let config = self.config();
        let input = read_input_schema(&config.schema_path(self.root()))?;
        let base_schema = base_table_schema(&input)?;
        let summary_schema = summary_table_schema()?;
        let warehouse = self.warehouse();
        let mut created = Vec::new();

        let dataset = config.dataset();
        let location = config.location();
        if self
            .retry()
            .run("ensure dataset", || warehouse.ensure_dataset(dataset, location))
            .await?
        {
            created.push(dataset.to_string());
        }

        for (table, schema) in [
            (config.base_table(), &base_schema),
            (config.summary_table(), &summary_schema),
        ] {
            let name = table.to_string();
            if self
                .retry()
                .run("ensure table", || warehouse.ensure_table(table, schema))
                .await?
            {
                info!("Created table {name}", name: name);
                created.push(name);
            } else {
                debug!("Table {name} already exists", name: name);
            }
        }

        Ok(created)
    }

    /// Append every row of `file_path` to the base table.
    ///
    /// Returns the number of rows submitted. Loading the same file twice
    /// appends it twice.
    pub async fn load_records(&self, file_path: &Path, schema_path: &Path) -> Result<u64> {
        let input = read_input_schema(schema_path)?;
        let csv = std::fs::read(file_path).map_err(|e| {
            PipelineError::Config(format!("cannot read data file {}: {e}", file_path.display()))
        })?;
        let batches = parse_records(&csv, &input, Utc::now())?;
        let rows: u64 = batches.iter().map(|b| b.num_rows() as u64).sum();

        let table = self.config().base_table();
        let name = table.to_string();
        if rows == 0 {
            warn!("Input file has no rows; nothing to load into {name}", name: name);
            return Ok(0);
        }

        info!("Loading {rows} rows into {name}", rows: rows, name: name);
        let warehouse = self.warehouse();
        let load_id = self.run_id();
        let submitted = self
            .retry()
            .run("append rows", || warehouse.append_rows(table, &batches, load_id))
            .await?;
        info!("Loaded {submitted} rows into {name}", submitted: submitted, name: name);
        Ok(submitted)
    }
}
