//! Human-readable summaries printed by the binary

use crate::commands::CheckReport;
use pipeline::{PipelineConfig, RunReport, VerificationReport};
use std::fmt::Write;

pub fn format_route(config: &PipelineConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "environment: {}", config.environment());
    let _ = writeln!(out, "project:     {}", config.project_id());
    let _ = writeln!(out, "dataset:     {}", config.dataset().dataset());
    let _ = writeln!(out, "location:    {}", config.location());
    let _ = writeln!(out, "base table:  {}", config.base_table());
    out
}

pub fn format_verification(report: &VerificationReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "base rows:        {}", report.base_rows);
    let _ = writeln!(out, "departments:      {}", report.summary_rows);
    let _ = writeln!(out, "high earners:     {}", report.high_earner_rows);
    for d in &report.departments {
        let _ = writeln!(
            out,
            "  {:<16} {:>4} employees  avg {:>10.2}  total {:>12.2}",
            d.department.as_deref().unwrap_or("(none)"),
            d.employee_count,
            d.avg_salary.unwrap_or_default(),
            d.total_salary.unwrap_or_default(),
        );
    }
    out
}

pub fn format_run(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Deployed to {} (run {})",
        report.environment, report.run_id
    );
    if !report.tables_created.is_empty() {
        let _ = writeln!(out, "created:          {}", report.tables_created.join(", "));
    }
    let _ = writeln!(out, "rows loaded:      {}", report.rows_loaded);
    let _ = writeln!(out, "statements run:   {}", report.statements_executed);
    out.push_str(&format_verification(&report.verification));
    out
}

pub fn format_check(check: &CheckReport) -> String {
    let mut out = String::new();
    if let Some(credential) = &check.credential {
        let _ = writeln!(
            out,
            "credential: {} (project {}, account {})",
            credential.kind,
            credential.project_id.as_deref().unwrap_or("-"),
            credential.client_email.as_deref().unwrap_or("-"),
        );
    }
    let report = &check.connection;
    let _ = writeln!(
        out,
        "Connected to {}: {} dataset(s)",
        report.project_id,
        report.datasets.len()
    );
    for dataset in &report.datasets {
        let _ = writeln!(out, "  {dataset}");
    }
    let _ = writeln!(
        out,
        "target dataset {}",
        if report.target_exists { "exists" } else { "does not exist yet" }
    );
    out
}
