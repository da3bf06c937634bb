//! BigQuery REST (v2) backend

use crate::credentials::{Credentials, Secret};
use crate::error::{Result, WarehouseError};
use crate::rows::{Row, batches_to_ndjson};
use crate::table::{DatasetRef, TableRef, TableSchema};
use crate::{QueryOutcome, Warehouse};
use arrow_array::RecordBatch;
use async_trait::async_trait;
use diagnostics::*;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com";
const TIMEOUT_SECONDS: u64 = 60;
const QUERY_WAIT_MS: u64 = 10_000;
const MAX_POLLS: usize = 60;
const LOAD_POLL_INTERVAL_MS: u64 = 500;
const UPLOAD_BOUNDARY: &str = "bqdeploy_load_part";
const DATASET_DESCRIPTION: &str = "Dataset created by CI/CD pipeline";

pub struct BigQueryWarehouse {
    http: reqwest::Client,
    endpoint: String,
    token: Secret,
    /// Project that runs (and is billed for) query jobs
    project: String,
    location: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize)]
struct ResponseField {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Deserialize)]
struct ResponseSchema {
    #[serde(default)]
    fields: Vec<ResponseField>,
}

#[derive(Deserialize)]
struct Cell {
    #[serde(default)]
    v: Value,
}

#[derive(Deserialize)]
struct ResponseRow {
    #[serde(default)]
    f: Vec<Cell>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<ResponseSchema>,
    #[serde(default)]
    rows: Vec<ResponseRow>,
    page_token: Option<String>,
    num_dml_affected_rows: Option<String>,
    total_bytes_processed: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetListEntry {
    dataset_reference: DatasetReference,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetList {
    #[serde(default)]
    datasets: Vec<DatasetListEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct JobError {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    error_result: Option<JobError>,
    #[serde(default)]
    errors: Vec<JobError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    output_rows: Option<String>,
}

#[derive(Deserialize)]
struct JobStatistics {
    load: Option<LoadStatistics>,
}

#[derive(Deserialize)]
struct Job {
    #[serde(default)]
    status: JobStatus,
    statistics: Option<JobStatistics>,
}

impl Job {
    fn is_done(&self) -> bool {
        self.status.state == "DONE"
    }

    fn output_rows(&self) -> Option<u64> {
        self.statistics
            .as_ref()?
            .load
            .as_ref()?
            .output_rows
            .as_deref()?
            .parse()
            .ok()
    }

    /// The error of a finished job, if it failed
    fn failure(&self) -> Option<WarehouseError> {
        let first = self.status.error_result.as_ref()?;
        let errors = if self.status.errors.is_empty() {
            std::slice::from_ref(first)
        } else {
            self.status.errors.as_slice()
        };
        let detail = errors
            .iter()
            .map(|e| format!("{}: {}", e.reason, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        Some(match first.reason.as_str() {
            "invalid" | "invalidQuery" => WarehouseError::Invalid(detail),
            "notFound" => WarehouseError::NotFound(detail),
            "accessDenied" => WarehouseError::PermissionDenied(detail),
            _ => WarehouseError::Query(detail),
        })
    }
}

/// Job id of the load identified by `load_id`, stable across retries
fn load_job_id(load_id: &str, table: &TableRef) -> String {
    let clean: String = load_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("bqdeploy_load_{clean}_{}", table.table())
}

/// Body of a `multipart/related` upload: job metadata, then the data
fn multipart_body(metadata: &Value, data: &[u8]) -> Result<Vec<u8>> {
    if data
        .windows(UPLOAD_BOUNDARY.len())
        .any(|w| w == UPLOAD_BOUNDARY.as_bytes())
    {
        return Err(WarehouseError::Invalid(
            "input data contains the upload boundary".into(),
        ));
    }
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(
        format!(
            "--{UPLOAD_BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
             --{UPLOAD_BOUNDARY}\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{UPLOAD_BOUNDARY}--\r\n").as_bytes());
    Ok(body)
}

/// Convert an HTTP failure into the error taxonomy
fn classify(status: StatusCode, body: &str) -> WarehouseError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(300).collect());
    let detail = format!("HTTP {status}: {message}");

    match status.as_u16() {
        401 => WarehouseError::Authentication(detail),
        403 if body.contains("rateLimitExceeded") || body.contains("quotaExceeded") => {
            WarehouseError::Transient(detail)
        }
        403 => WarehouseError::PermissionDenied(detail),
        404 => WarehouseError::NotFound(detail),
        409 => WarehouseError::AlreadyExists(detail),
        429 => WarehouseError::Transient(detail),
        400 => WarehouseError::Invalid(detail),
        s if s >= 500 => WarehouseError::Transient(detail),
        _ => WarehouseError::Query(detail),
    }
}

/// Type a result cell using the column type BigQuery reports
fn typed_cell(field_type: &str, value: Value) -> Value {
    let Value::String(text) = value else {
        return value;
    };
    match field_type {
        "INTEGER" | "INT64" => text.parse::<i64>().map(Value::from).unwrap_or(Value::String(text)),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => {
            text.parse::<f64>().map(Value::from).unwrap_or(Value::String(text))
        }
        "BOOLEAN" | "BOOL" => match text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text),
        },
        _ => Value::String(text),
    }
}

fn response_rows(schema: &ResponseSchema, rows: Vec<ResponseRow>) -> Vec<Row> {
    rows.into_iter()
        .map(|row| {
            schema
                .fields
                .iter()
                .zip(row.f)
                .map(|(field, cell)| (field.name.clone(), typed_cell(&field.field_type, cell.v)))
                .collect()
        })
        .collect()
}

impl BigQueryWarehouse {
    /// Authenticate and create a client for `project`
    pub async fn connect(credentials: &Credentials, project: &str, location: &str) -> Result<Self> {
        let http = Self::http_client()?;
        let token = credentials.access_token(&http).await?;
        Ok(Self {
            http,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token,
            project: project.to_string(),
            location: location.to_string(),
        })
    }

    /// Client with a pre-issued token against an explicit endpoint
    pub fn with_access_token(
        endpoint: impl Into<String>,
        token: Secret,
        project: &str,
        location: &str,
    ) -> Result<Self> {
        Ok(Self {
            http: Self::http_client()?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            project: project.to_string(),
            location: location.to_string(),
        })
    }

    fn http_client() -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECONDS))
            .build()?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/bigquery/v2/{}", self.endpoint, path)
    }

    fn dataset_path(dataset: &DatasetRef) -> String {
        format!("projects/{}/datasets/{}", dataset.project(), dataset.dataset())
    }

    fn table_path(table: &TableRef) -> String {
        format!("{}/tables/{}", Self::dataset_path(table.dataset_ref()), table.table())
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.bearer_auth(self.token.expose()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.url(path);
        debug!("GET {url}", url: url);
        self.send(self.http.get(&url).query(query)).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let url = self.url(path);
        debug!("POST {url}", url: url);
        self.send(self.http.post(&url).json(body)).await
    }

    /// Run a query and wait for completion, following result pages
    async fn run_query(&self, sql: &str) -> Result<(QueryOutcome, Vec<Row>)> {
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "location": self.location,
            "timeoutMs": QUERY_WAIT_MS,
        });
        let mut response: QueryResponse = self
            .post(&format!("projects/{}/queries", self.project), &body)
            .await?;

        let mut polls = 0;
        while !response.job_complete {
            polls += 1;
            if polls > MAX_POLLS {
                return Err(WarehouseError::Transient("query did not complete in time".into()));
            }
            response = self.query_results(&response, None).await?;
        }

        let outcome = QueryOutcome {
            affected_rows: response.num_dml_affected_rows.as_deref().and_then(|n| n.parse().ok()),
            bytes_processed: response.total_bytes_processed.as_deref().and_then(|n| n.parse().ok()),
        };

        let Some(schema) = response.schema.take() else {
            return Ok((outcome, Vec::new()));
        };
        let mut rows = response_rows(&schema, std::mem::take(&mut response.rows));
        while let Some(token) = response.page_token.take() {
            response = self.query_results(&response, Some(token)).await?;
            rows.extend(response_rows(&schema, std::mem::take(&mut response.rows)));
        }

        Ok((outcome, rows))
    }

    async fn query_results(
        &self,
        previous: &QueryResponse,
        page_token: Option<String>,
    ) -> Result<QueryResponse> {
        let job = previous
            .job_reference
            .as_ref()
            .ok_or_else(|| WarehouseError::Query("incomplete query without job reference".into()))?;
        let location = job.location.clone().unwrap_or_else(|| self.location.clone());
        let mut query = vec![
            ("location", location),
            ("timeoutMs", QUERY_WAIT_MS.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        let mut response: QueryResponse = self
            .get(&format!("projects/{}/queries/{}", self.project, job.job_id), &query)
            .await?;
        if response.job_reference.is_none() {
            response.job_reference = Some(JobReference {
                job_id: job.job_id.clone(),
                location: job.location.clone(),
            });
        }
        Ok(response)
    }

    /// Submit a load job appending newline-delimited JSON to `table`
    async fn submit_load_job(&self, job_id: &str, table: &TableRef, data: &[u8]) -> Result<Job> {
        let metadata = json!({
            "jobReference": {
                "projectId": self.project,
                "jobId": job_id,
                "location": self.location,
            },
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": table.project(),
                        "datasetId": table.dataset(),
                        "tableId": table.table(),
                    },
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": "WRITE_APPEND",
                    "createDisposition": "CREATE_NEVER",
                },
            },
        });
        let body = multipart_body(&metadata, data)?;

        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs",
            self.endpoint, self.project
        );
        debug!("POST {url}", url: url);
        let request = self
            .http
            .post(&url)
            .query(&[("uploadType", "multipart")])
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={UPLOAD_BOUNDARY}"),
            )
            .body(body);
        self.send(request).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.get(
            &format!("projects/{}/jobs/{job_id}", self.project),
            &[("location", self.location.clone())],
        )
        .await
    }

    /// Poll `job` until it is done, failing with its error result
    async fn wait_for_job(&self, job_id: &str, mut job: Job) -> Result<Job> {
        let mut polls = 0;
        while !job.is_done() {
            polls += 1;
            if polls > MAX_POLLS {
                return Err(WarehouseError::Transient(format!(
                    "job {job_id} did not complete in time"
                )));
            }
            tokio::time::sleep(Duration::from_millis(LOAD_POLL_INTERVAL_MS)).await;
            job = self.get_job(job_id).await?;
        }
        match job.failure() {
            Some(e) => Err(e),
            None => Ok(job),
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn name(&self) -> &str {
        "bigquery"
    }

    async fn list_datasets(&self, project: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let query: Vec<(&str, String)> = page_token
                .take()
                .map(|t| vec![("pageToken", t)])
                .unwrap_or_default();
            let page: DatasetList = self
                .get(&format!("projects/{project}/datasets"), &query)
                .await?;
            names.extend(page.datasets.into_iter().map(|d| d.dataset_reference.dataset_id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(names)
    }

    async fn ensure_dataset(&self, dataset: &DatasetRef, location: &str) -> Result<bool> {
        let name = dataset.to_string();
        match self.get::<Value>(&Self::dataset_path(dataset), &[]).await {
            Ok(_) => {
                debug!("Dataset {name} already exists", name: name);
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        info!("Creating dataset {name} in {location}", name: name, location: location);
        let body = json!({
            "datasetReference": {
                "projectId": dataset.project(),
                "datasetId": dataset.dataset(),
            },
            "location": location,
            "description": DATASET_DESCRIPTION,
        });
        match self
            .post::<Value>(&format!("projects/{}/datasets", dataset.project()), &body)
            .await
        {
            Ok(_) => Ok(true),
            Err(WarehouseError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> Result<bool> {
        let existed = self.table_exists(table).await?;
        let _ = self.execute(&schema.create_if_absent_ddl(table)).await?;
        Ok(!existed)
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        match self.get::<Value>(&Self::table_path(table), &[]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn append_rows(
        &self,
        table: &TableRef,
        batches: &[RecordBatch],
        load_id: &str,
    ) -> Result<u64> {
        let submitted: u64 = batches.iter().map(|b| b.num_rows() as u64).sum();
        if submitted == 0 {
            return Ok(0);
        }
        let data = batches_to_ndjson(batches)?;
        let job_id = load_job_id(load_id, table);
        let name = table.to_string();
        debug!("Submitting load job {job_id} with {submitted} rows for {name}", job_id: job_id, submitted: submitted, name: name);

        let job = match self.submit_load_job(&job_id, table, &data).await {
            Ok(job) => job,
            // A previous attempt reached the service; follow that job.
            Err(WarehouseError::AlreadyExists(_)) => {
                debug!("Load job {job_id} already submitted", job_id: job_id);
                self.get_job(&job_id).await?
            }
            Err(e) => return Err(e),
        };

        let job = self.wait_for_job(&job_id, job).await?;
        let loaded = job.output_rows().unwrap_or(submitted);
        debug!("Load job {job_id} appended {loaded} rows to {name}", job_id: job_id, loaded: loaded, name: name);
        Ok(loaded)
    }

    async fn execute(&self, sql: &str) -> Result<QueryOutcome> {
        debug!("Executing on BigQuery: {sql}", sql: sql);
        let (outcome, _) = self.run_query(sql).await?;
        if let Some(bytes) = outcome.bytes_processed {
            debug!("Processed {bytes} bytes", bytes: bytes);
        }
        Ok(outcome)
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        debug!("Querying BigQuery: {sql}", sql: sql);
        let (_, rows) = self.run_query(sql).await?;
        Ok(rows)
    }
}
