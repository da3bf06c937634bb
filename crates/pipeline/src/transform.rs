//! Rebuild of the derived objects from the base table

use crate::error::Result;
use crate::runner::Pipeline;
use crate::templates::TransformTemplates;
use diagnostics::*;

impl Pipeline {
    /// The templates this pipeline applies
    pub fn transform_templates(&self) -> Result<TransformTemplates> {
        match self.sql_dir() {
            Some(dir) => TransformTemplates::from_dir(dir),
            None => Ok(TransformTemplates::builtin()),
        }
    }

    /// Execute every transformation statement in order.
    ///
    /// Stops at the first statement that fails; returns the number executed.
    pub async fn run_aggregation(&self) -> Result<usize> {
        let templates = self.transform_templates()?;
        let params = self.config().template_params();
        let warehouse = self.warehouse();
        let mut executed = 0;

        for (template, sql) in templates.statements(&params) {
            let template = template.to_string();
            debug!("Executing statement from {template}: {sql}", template: template, sql: sql);
            let outcome = self
                .retry()
                .run("transform statement", || warehouse.execute(&sql))
                .await?;
            executed += 1;
            match outcome.bytes_processed {
                Some(bytes) => info!("Executed {template} ({bytes} bytes processed)", template: template, bytes: bytes),
                None => info!("Executed {template}", template: template),
            }
        }

        Ok(executed)
    }
}
