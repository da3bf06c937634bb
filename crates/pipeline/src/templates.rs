//! SQL transformation templates
//!
//! Templates are plain SQL with `{project_id}`, `{dataset_id}` and
//! `{table_id}` placeholders. Only values from a validated
//! [`PipelineConfig`](crate::PipelineConfig) are ever substituted.

use crate::config::TemplateParams;
use crate::error::{PipelineError, Result};
use std::path::Path;

const DEPARTMENT_SUMMARY: &str = include_str!("../../../sql/department_summary.sql");
const HIGH_EARNERS: &str = include_str!("../../../sql/high_earners.sql");

/// Template files, in execution order
pub const TEMPLATE_FILES: [&str; 2] = ["department_summary.sql", "high_earners.sql"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTemplate {
    name: String,
    text: String,
}

impl SqlTemplate {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self, params: &TemplateParams<'_>) -> String {
        self.text
            .replace("{project_id}", params.project_id)
            .replace("{dataset_id}", params.dataset_id)
            .replace("{table_id}", params.table_id)
    }

    /// Rendered statements, without comment lines or empty fragments
    pub fn statements(&self, params: &TemplateParams<'_>) -> Vec<String> {
        let rendered = self.render(params);
        let without_comments: String = rendered
            .lines()
            .filter(|line| !line.trim_start().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        without_comments
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// The ordered set of templates applied by the transform stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformTemplates {
    templates: Vec<SqlTemplate>,
}

impl TransformTemplates {
    /// Templates compiled into the binary
    pub fn builtin() -> Self {
        Self {
            templates: vec![
                SqlTemplate::new(TEMPLATE_FILES[0], DEPARTMENT_SUMMARY),
                SqlTemplate::new(TEMPLATE_FILES[1], HIGH_EARNERS),
            ],
        }
    }

    /// Read the templates from a directory holding [`TEMPLATE_FILES`]
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let templates = TEMPLATE_FILES
            .iter()
            .map(|file| {
                let path = dir.join(file);
                std::fs::read_to_string(&path)
                    .map(|text| SqlTemplate::new(*file, text))
                    .map_err(|e| {
                        PipelineError::Config(format!(
                            "cannot read SQL template {}: {e}",
                            path.display()
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { templates })
    }

    pub fn templates(&self) -> &[SqlTemplate] {
        &self.templates
    }

    /// Every statement of every template, in order, tagged with its template name
    pub fn statements(&self, params: &TemplateParams<'_>) -> Vec<(&str, String)> {
        self.templates
            .iter()
            .flat_map(|t| {
                t.statements(params)
                    .into_iter()
                    .map(move |sql| (t.name(), sql))
            })
            .collect()
    }
}
