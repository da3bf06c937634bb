//! Dataset and table references, and the column schema of warehouse tables
//!
//! Identifiers are validated when a reference is built. SQL text is only
//! ever assembled from validated references, so a `TableRef` is safe to
//! splice into a statement.

use crate::error::{Result, WarehouseError};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

const PROJECT_ID_PATTERN: &str = r"^[a-z][a-z0-9-]{4,28}[a-z0-9]$";
const NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,1023}$";

fn check(pattern: &str, value: &str, what: &str) -> Result<()> {
    let re = Regex::new(pattern)
        .map_err(|e| WarehouseError::Invalid(format!("bad identifier pattern: {e}")))?;
    if re.is_match(value) {
        Ok(())
    } else {
        Err(WarehouseError::Invalid(format!("invalid {what}: {value:?}")))
    }
}

/// Validate a cloud project id (lowercase letters, digits, hyphens; 6-30 chars)
pub fn validate_project_id(value: &str) -> Result<()> {
    check(PROJECT_ID_PATTERN, value, "project id")
}

/// Validate a dataset id
pub fn validate_dataset_id(value: &str) -> Result<()> {
    check(NAME_PATTERN, value, "dataset id")
}

/// Validate a table or view id
pub fn validate_table_id(value: &str) -> Result<()> {
    check(NAME_PATTERN, value, "table id")
}

/// Validate a column name
pub fn validate_column_name(value: &str) -> Result<()> {
    check(NAME_PATTERN, value, "column name")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetRef {
    project: String,
    dataset: String,
}

impl DatasetRef {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>) -> Result<Self> {
        let project = project.into();
        let dataset = dataset.into();
        validate_project_id(&project)?;
        validate_dataset_id(&dataset)?;
        Ok(Self { project, dataset })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Reference a table inside this dataset
    pub fn table(&self, table: impl Into<String>) -> Result<TableRef> {
        let table = table.into();
        validate_table_id(&table)?;
        Ok(TableRef {
            dataset: self.clone(),
            table,
        })
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.dataset)
    }
}

/// Fully-qualified table (or view) reference: project.dataset.table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    dataset: DatasetRef,
    table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self> {
        DatasetRef::new(project, dataset)?.table(table)
    }

    pub fn dataset_ref(&self) -> &DatasetRef {
        &self.dataset
    }

    pub fn project(&self) -> &str {
        self.dataset.project()
    }

    pub fn dataset(&self) -> &str {
        self.dataset.dataset()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// The reference as BigQuery standard SQL spells it: `project.dataset.table`
    pub fn sql_path(&self) -> String {
        format!("`{self}`")
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// Column types, named as in BigQuery JSON schema files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    #[serde(alias = "INT64")]
    Integer,
    #[serde(alias = "FLOAT64")]
    Float,
    #[serde(alias = "BOOL")]
    Boolean,
    Date,
    Timestamp,
}

impl FieldType {
    /// Arrow type used for parsing and for the local engine
    pub fn arrow_type(self) -> DataType {
        match self {
            FieldType::String => DataType::Utf8,
            FieldType::Integer => DataType::Int64,
            FieldType::Float => DataType::Float64,
            FieldType::Boolean => DataType::Boolean,
            FieldType::Date => DataType::Date32,
            FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        }
    }

    /// Standard SQL type name used in DDL
    pub fn sql_name(self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Integer => "INT64",
            FieldType::Float => "FLOAT64",
            FieldType::Boolean => "BOOL",
            FieldType::Date => "DATE",
            FieldType::Timestamp => "TIMESTAMP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Filled with the load time when the input does not supply a value
    #[serde(skip)]
    pub defaults_to_load_time: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType, mode: FieldMode) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode,
            description: String::new(),
            defaults_to_load_time: false,
        }
    }

    /// A TIMESTAMP column defaulting to the time of the load
    pub fn load_timestamp(name: impl Into<String>) -> Self {
        Self {
            defaults_to_load_time: true,
            ..Self::new(name, FieldType::Timestamp, FieldMode::Nullable)
        }
    }

    pub fn is_required(&self) -> bool {
        self.mode == FieldMode::Required
    }

    fn ddl(&self) -> String {
        let mut column = format!("{} {}", self.name, self.field_type.sql_name());
        if self.is_required() {
            column.push_str(" NOT NULL");
        }
        if self.defaults_to_load_time {
            column.push_str(" DEFAULT CURRENT_TIMESTAMP()");
        }
        column
    }
}

/// Ordered list of columns of a table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSchema {
    fields: Vec<FieldSpec>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            validate_column_name(&field.name)?;
            if !seen.insert(field.name.to_ascii_lowercase()) {
                return Err(WarehouseError::Invalid(format!(
                    "duplicate column {:?}",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Parse a BigQuery JSON schema document (an array of fields)
    pub fn from_json_str(json: &str) -> Result<Self> {
        let fields: Vec<FieldSpec> = serde_json::from_str(json)?;
        if fields.is_empty() {
            return Err(WarehouseError::Invalid("schema has no fields".into()));
        }
        Self::new(fields)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Append a column unless one with the same name exists
    pub fn with_field(mut self, field: FieldSpec) -> Result<Self> {
        if self.field(&field.name).is_none() {
            validate_column_name(&field.name)?;
            self.fields.push(field);
        }
        Ok(self)
    }

    pub fn to_arrow(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .fields
            .iter()
            .map(|f| Field::new(&f.name, f.field_type.arrow_type(), !f.is_required()))
            .collect();
        Arc::new(Schema::new(fields))
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this schema
    pub fn create_if_absent_ddl(&self, table: &TableRef) -> String {
        let columns: Vec<String> = self.fields.iter().map(|f| format!("  {}", f.ddl())).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            table.sql_path(),
            columns.join(",\n")
        )
    }
}
