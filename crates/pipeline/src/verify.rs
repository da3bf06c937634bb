//! Post-deployment checks

use crate::error::{PipelineError, Result};
use crate::runner::Pipeline;
use diagnostics::*;
use serde::Serialize;
use warehouse::{TableRef, cell_as_f64, cell_as_str, cell_as_u64};

/// One row of the department summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartmentSummary {
    pub department: Option<String>,
    pub employee_count: u64,
    pub avg_salary: Option<f64>,
    pub total_salary: Option<f64>,
}

/// Object counts observed after a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub base_rows: u64,
    pub summary_rows: u64,
    pub high_earner_rows: u64,
    /// Summary rows ordered by total salary, largest first
    pub departments: Vec<DepartmentSummary>,
}

impl Pipeline {
    async fn required_count(&self, table: &TableRef) -> Result<u64> {
        let warehouse = self.warehouse();
        self.retry()
            .run("count rows", || warehouse.row_count(table))
            .await?
            .ok_or_else(|| PipelineError::Verification(format!("{table} does not exist")))
    }

    /// Count the deployed objects and read back the summary.
    ///
    /// Fails when an object is missing or holds fewer base rows than the
    /// `rows_loaded` just loaded. After a non-empty load the summary must not
    /// be empty either. An empty view is acceptable.
    pub async fn verify(&self, rows_loaded: u64) -> Result<VerificationReport> {
        let config = self.config();
        let base_rows = self.required_count(config.base_table()).await?;
        let summary_rows = self.required_count(config.summary_table()).await?;
        let high_earner_rows = self.required_count(config.high_earners_view()).await?;

        let base = config.base_table().to_string();
        info!("{base} holds {base_rows} rows", base: base, base_rows: base_rows);
        info!("Summary has {summary_rows} departments, view has {high_earner_rows} rows", summary_rows: summary_rows, high_earner_rows: high_earner_rows);

        if base_rows < rows_loaded {
            return Err(PipelineError::Verification(format!(
                "{base} holds {base_rows} rows but {rows_loaded} were just loaded"
            )));
        }
        if rows_loaded > 0 && summary_rows == 0 {
            return Err(PipelineError::Verification(format!(
                "{} is empty after loading {rows_loaded} rows",
                config.summary_table()
            )));
        }

        let sql = format!(
            "SELECT department, employee_count, avg_salary, total_salary FROM {} \
             ORDER BY total_salary DESC",
            config.summary_table().sql_path()
        );
        let warehouse = self.warehouse();
        let rows = self
            .retry()
            .run("read summary", || warehouse.query(&sql))
            .await?;

        let departments = rows
            .iter()
            .map(|row| DepartmentSummary {
                department: cell_as_str(row, "department").map(str::to_string),
                employee_count: cell_as_u64(row, "employee_count").unwrap_or(0),
                avg_salary: cell_as_f64(row, "avg_salary"),
                total_salary: cell_as_f64(row, "total_salary"),
            })
            .collect::<Vec<_>>();

        for d in &departments {
            let department = d.department.as_deref().unwrap_or("(none)").to_string();
            let employees = d.employee_count;
            let total = d.total_salary.unwrap_or(0.0);
            debug!("{department}: {employees} employees, total salary {total}", department: department, employees: employees, total: total);
        }

        Ok(VerificationReport {
            base_rows,
            summary_rows,
            high_earner_rows,
            departments,
        })
    }
}
