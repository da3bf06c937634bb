//! Per-environment configuration documents

use crate::environment::Environment;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use warehouse::{DatasetRef, TableRef, WarehouseError};

/// Derived table rebuilt from the base table on every run
pub const SUMMARY_TABLE: &str = "department_summary";
/// View over the base table
pub const HIGH_EARNERS_VIEW: &str = "high_earners";

fn default_table_id() -> String {
    "employees".to_string()
}
fn default_schema_file() -> String {
    "employees_schema.json".to_string()
}
fn default_data_file() -> String {
    "employees.csv".to_string()
}

/// The YAML document as written in `config/<env>.yaml`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub gcp_project_id: String,
    pub dataset_id: String,
    pub location: String,
    #[serde(default = "default_table_id")]
    pub table_id: String,
    #[serde(default = "default_schema_file")]
    pub schema_file: String,
    #[serde(default = "default_data_file")]
    pub data_file: String,
}

/// The only values that may be substituted into SQL templates
#[derive(Debug, Clone, Copy)]
pub struct TemplateParams<'a> {
    pub project_id: &'a str,
    pub dataset_id: &'a str,
    pub table_id: &'a str,
}

/// Validated configuration for one environment. Immutable for the run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    environment: Environment,
    file: ConfigFile,
    dataset: DatasetRef,
    base_table: TableRef,
    summary_table: TableRef,
    high_earners_view: TableRef,
}

fn invalid(e: WarehouseError) -> PipelineError {
    PipelineError::Config(e.to_string())
}

/// Input files are named relative to `data/` and may not leave it
fn plain_file_name(key: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(PipelineError::Config(format!("{key} cannot be empty")));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(PipelineError::Config(format!(
            "{key} {name:?} must be a plain file name"
        )));
    }
    Ok(())
}

impl PipelineConfig {
    /// Read and validate `<config_dir>/<environment document>`
    pub fn load(config_dir: &Path, environment: Environment) -> Result<Self> {
        let path = config_dir.join(environment.config_file());
        let content = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content, environment).map_err(|e| match e {
            PipelineError::Config(msg) => {
                PipelineError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_yaml_str(yaml: &str, environment: Environment) -> Result<Self> {
        let file: ConfigFile = serde_yaml_ng::from_str(yaml)
            .map_err(|e| PipelineError::Config(format!("invalid configuration: {e}")))?;
        Self::new(file, environment)
    }

    pub fn new(file: ConfigFile, environment: Environment) -> Result<Self> {
        if file.location.trim().is_empty() {
            return Err(PipelineError::Config("location cannot be empty".into()));
        }
        plain_file_name("schema_file", &file.schema_file)?;
        plain_file_name("data_file", &file.data_file)?;

        let dataset = DatasetRef::new(&file.gcp_project_id, &file.dataset_id).map_err(invalid)?;
        let base_table = dataset.table(&file.table_id).map_err(invalid)?;
        if file.table_id == SUMMARY_TABLE || file.table_id == HIGH_EARNERS_VIEW {
            return Err(PipelineError::Config(format!(
                "table_id {:?} collides with a derived object",
                file.table_id
            )));
        }
        let summary_table = dataset.table(SUMMARY_TABLE).map_err(invalid)?;
        let high_earners_view = dataset.table(HIGH_EARNERS_VIEW).map_err(invalid)?;

        Ok(Self {
            environment,
            file,
            dataset,
            base_table,
            summary_table,
            high_earners_view,
        })
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn project_id(&self) -> &str {
        self.dataset.project()
    }

    pub fn location(&self) -> &str {
        &self.file.location
    }

    pub fn dataset(&self) -> &DatasetRef {
        &self.dataset
    }

    pub fn base_table(&self) -> &TableRef {
        &self.base_table
    }

    pub fn summary_table(&self) -> &TableRef {
        &self.summary_table
    }

    pub fn high_earners_view(&self) -> &TableRef {
        &self.high_earners_view
    }

    pub fn file(&self) -> &ConfigFile {
        &self.file
    }

    pub fn template_params(&self) -> TemplateParams<'_> {
        TemplateParams {
            project_id: self.base_table.project(),
            dataset_id: self.base_table.dataset(),
            table_id: self.base_table.table(),
        }
    }

    /// `<root>/data/schemas/<schema_file>`
    pub fn schema_path(&self, root: &Path) -> PathBuf {
        root.join("data").join("schemas").join(&self.file.schema_file)
    }

    /// `<root>/data/<data_file>`
    pub fn data_path(&self, root: &Path) -> PathBuf {
        root.join("data").join(&self.file.data_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: &str = "
gcp_project_id: acme-analytics-dev
dataset_id: employees_dev
location: US
";

    #[test]
    fn test_defaults_and_refs() {
        let config = PipelineConfig::from_yaml_str(DEV, Environment::Development).expect("valid");
        assert_eq!(config.base_table().to_string(), "acme-analytics-dev.employees_dev.employees");
        assert_eq!(
            config.summary_table().to_string(),
            "acme-analytics-dev.employees_dev.department_summary"
        );
        assert_eq!(config.file().schema_file, "employees_schema.json");
        assert_eq!(
            config.data_path(Path::new("/repo")),
            PathBuf::from("/repo/data/employees.csv")
        );
        let params = config.template_params();
        assert_eq!(params.project_id, "acme-analytics-dev");
        assert_eq!(params.dataset_id, "employees_dev");
        assert_eq!(params.table_id, "employees");
    }

    #[test]
    fn test_missing_required_key() {
        let yaml = "gcp_project_id: acme-analytics-dev\ndataset_id: employees_dev\n";
        let err = PipelineConfig::from_yaml_str(yaml, Environment::Development)
            .expect_err("location is required");
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("location")));
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        let yaml = "
gcp_project_id: acme-analytics-dev
dataset_id: \"employees`; DROP TABLE x; --\"
location: US
";
        assert!(matches!(
            PipelineConfig::from_yaml_str(yaml, Environment::Production),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_input_files_stay_under_data_dir() {
        for bad in ["../../etc/passwd", "sub/employees.csv", "..\\secret.csv", "..", "\"\""] {
            let yaml = format!("{DEV}data_file: {bad}\n");
            match PipelineConfig::from_yaml_str(&yaml, Environment::Development) {
                Err(PipelineError::Config(msg)) => assert!(msg.contains("data_file"), "{msg}"),
                other => panic!("{bad} accepted: {other:?}"),
            }
        }
        let yaml = format!("{DEV}schema_file: ../schema.json\n");
        assert!(matches!(
            PipelineConfig::from_yaml_str(&yaml, Environment::Development),
            Err(PipelineError::Config(_))
        ));

        let yaml = format!("{DEV}data_file: employees_2024.csv\n");
        assert!(PipelineConfig::from_yaml_str(&yaml, Environment::Development).is_ok());
    }

    #[test]
    fn test_rejects_table_colliding_with_derived_objects() {
        let yaml = format!("{DEV}table_id: department_summary\n");
        assert!(matches!(
            PipelineConfig::from_yaml_str(&yaml, Environment::Development),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("prod.yaml"), DEV.replace("-dev", "-prod"))?;

        let config = PipelineConfig::load(dir.path(), Environment::Production)?;
        assert_eq!(config.project_id(), "acme-analytics-prod");
        assert_eq!(config.environment(), Environment::Production);

        let missing = PipelineConfig::load(dir.path(), Environment::Development);
        assert!(matches!(missing, Err(PipelineError::Config(_))));
        Ok(())
    }
}
