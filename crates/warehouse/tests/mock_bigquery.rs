//! BigQuery backend against a mock REST server

use anyhow::Result;
use arrow_array::{Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use warehouse::{
    BigQueryWarehouse, DatasetRef, FieldMode, FieldSpec, FieldType, RetryPolicy, Secret, TableRef,
    TableSchema, Warehouse, WarehouseError, cell_as_str, cell_as_u64,
};
use warp::Filter;
use warp::Reply;
use warp::http::{Method, StatusCode};
use warp::hyper::body::Bytes;

const TOKEN: &str = "mock-token-12345";
const PROJECT: &str = "acme-analytics-dev";

#[derive(Default)]
struct MockState {
    datasets: HashMap<String, Value>,
    tables: HashSet<String>,
    jobs: HashMap<String, Value>,
    /// Metadata of every accepted load job
    loads: Vec<Value>,
    /// Rows appended by finished load jobs
    loaded_rows: Vec<Value>,
    uploads: usize,
    queries: Vec<String>,
    /// Uploads to answer with 503 after accepting the job
    upload_failures: usize,
}

type SharedState = Arc<Mutex<MockState>>;

/// Mock BigQuery server bound to an ephemeral port
struct MockBigQuery {
    base_url: String,
    state: SharedState,
    server_handle: tokio::task::JoinHandle<()>,
}

impl MockBigQuery {
    async fn start() -> Self {
        let state = SharedState::default();
        let shared = state.clone();
        let routes = warp::method()
            .and(warp::path::full())
            .and(warp::query::<HashMap<String, String>>())
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::header::optional::<String>("content-type"))
            .and(warp::body::bytes())
            .and_then(
                move |method: Method,
                      path: warp::path::FullPath,
                      query: HashMap<String, String>,
                      auth: Option<String>,
                      content_type: Option<String>,
                      body: Bytes| {
                    let state = shared.clone();
                    let request = Request {
                        method,
                        query,
                        auth,
                        content_type: content_type.unwrap_or_default(),
                        body,
                    };
                    async move { Ok::<_, Infallible>(handle(state, path.as_str(), request).await) }
                },
            );

        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        let server_handle = tokio::spawn(server);
        Self {
            base_url: format!("http://{addr}"),
            state,
            server_handle,
        }
    }

    fn client(&self, token: &str) -> Result<BigQueryWarehouse> {
        Ok(BigQueryWarehouse::with_access_token(
            &self.base_url,
            Secret::new(token),
            PROJECT,
            "US",
        )?)
    }
}

impl Drop for MockBigQuery {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

fn reply(status: StatusCode, body: Value) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn error(status: StatusCode, reason: &str, message: &str) -> warp::reply::Response {
    reply(
        status,
        json!({"error": {"code": status.as_u16(), "message": message, "errors": [{"reason": reason}]}}),
    )
}

struct Request {
    method: Method,
    query: HashMap<String, String>,
    auth: Option<String>,
    content_type: String,
    body: Bytes,
}

/// Payloads of a `multipart/related` body, in order
fn multipart_parts(content_type: &str, body: &[u8]) -> Vec<String> {
    let Some(boundary) = content_type.split("boundary=").nth(1) else {
        return Vec::new();
    };
    String::from_utf8_lossy(body)
        .split(&format!("--{boundary}"))
        .filter_map(|part| part.split_once("\r\n\r\n"))
        .map(|(_, payload)| payload.trim_end_matches("\r\n").to_string())
        .collect()
}

async fn handle(state: SharedState, path: &str, request: Request) -> warp::reply::Response {
    let expected = format!("Bearer {TOKEN}");
    if request.auth.as_deref() != Some(expected.as_str()) {
        return error(StatusCode::UNAUTHORIZED, "authError", "Invalid Credentials");
    }
    let mut state = state.lock().await;

    if let Some(rest) = path.strip_prefix("/upload/bigquery/v2/") {
        let segments: Vec<&str> = rest.split('/').collect();
        return match (request.method.as_str(), segments.as_slice()) {
            ("POST", ["projects", _, "jobs"]) => upload_job(&mut state, &request),
            _ => error(StatusCode::NOT_FOUND, "notFound", "unknown upload endpoint"),
        };
    }

    let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
    let segments: Vec<&str> = path
        .trim_start_matches("/bigquery/v2/")
        .split('/')
        .collect();
    let query = request.query;

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["projects", _, "datasets"]) => {
            let datasets: Vec<Value> = state
                .datasets
                .keys()
                .map(|d| json!({"datasetReference": {"datasetId": d}}))
                .collect();
            reply(StatusCode::OK, json!({"datasets": datasets}))
        }
        ("POST", ["projects", _, "datasets"]) => {
            let id = body["datasetReference"]["datasetId"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            if state.datasets.contains_key(&id) {
                return error(StatusCode::CONFLICT, "duplicate", "Already Exists");
            }
            state.datasets.insert(id, body.clone());
            reply(StatusCode::OK, body)
        }
        ("GET", ["projects", _, "datasets", dataset]) => {
            match state.datasets.get(*dataset) {
                Some(resource) => reply(StatusCode::OK, resource.clone()),
                None => error(StatusCode::NOT_FOUND, "notFound", "Not found: Dataset"),
            }
        }
        ("GET", ["projects", project, "datasets", dataset, "tables", table]) => {
            if state.tables.contains(&format!("{project}.{dataset}.{table}")) {
                reply(StatusCode::OK, json!({"id": table}))
            } else {
                error(StatusCode::NOT_FOUND, "notFound", "Not found: Table")
            }
        }
        ("GET", ["projects", _, "jobs", job]) => match state.jobs.get_mut(*job) {
            // Jobs finish on their first poll.
            Some(resource) => {
                resource["status"]["state"] = json!("DONE");
                reply(StatusCode::OK, resource.clone())
            }
            None => error(StatusCode::NOT_FOUND, "notFound", "Not found: Job"),
        },
        ("POST", ["projects", _, "queries"]) => {
            let sql = body["query"].as_str().unwrap_or_default().to_string();
            state.queries.push(sql.clone());
            query_response(&mut state, &sql)
        }
        ("GET", ["projects", _, "queries", job]) => {
            job_results(&state, job, query.get("pageToken").map(String::as_str))
        }
        _ => error(StatusCode::NOT_FOUND, "notFound", "unknown endpoint"),
    }
}

fn upload_job(state: &mut MockState, request: &Request) -> warp::reply::Response {
    state.uploads += 1;
    if request.query.get("uploadType").map(String::as_str) != Some("multipart") {
        return error(StatusCode::BAD_REQUEST, "invalid", "uploadType must be multipart");
    }
    let parts = multipart_parts(&request.content_type, &request.body);
    let [metadata, data] = parts.as_slice() else {
        return error(StatusCode::BAD_REQUEST, "invalid", "expected metadata and data parts");
    };
    let Ok(metadata) = serde_json::from_str::<Value>(metadata) else {
        return error(StatusCode::BAD_REQUEST, "invalid", "metadata is not JSON");
    };
    let job_id = metadata["jobReference"]["jobId"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    if state.jobs.contains_key(&job_id) {
        return error(StatusCode::CONFLICT, "duplicate", "Already Exists: Job");
    }

    let destination = &metadata["configuration"]["load"]["destinationTable"];
    let table = format!(
        "{}.{}.{}",
        destination["projectId"].as_str().unwrap_or_default(),
        destination["datasetId"].as_str().unwrap_or_default(),
        destination["tableId"].as_str().unwrap_or_default()
    );
    let rows: Vec<Value> = data
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();

    let resource = if state.tables.contains(&table) {
        let count = rows.len();
        state.loaded_rows.extend(rows);
        json!({
            "jobReference": metadata["jobReference"],
            "status": {"state": "RUNNING"},
            "statistics": {"load": {"outputRows": count.to_string()}}
        })
    } else {
        json!({
            "jobReference": metadata["jobReference"],
            "status": {
                "state": "DONE",
                "errorResult": {"reason": "notFound", "message": format!("Not found: Table {table}")}
            }
        })
    };
    state.jobs.insert(job_id, resource.clone());
    state.loads.push(metadata);

    if state.upload_failures > 0 {
        state.upload_failures -= 1;
        return error(StatusCode::SERVICE_UNAVAILABLE, "backendError", "try again");
    }
    reply(StatusCode::OK, resource)
}

fn query_response(state: &mut MockState, sql: &str) -> warp::reply::Response {
    if let Some(rest) = sql.strip_prefix("CREATE TABLE IF NOT EXISTS `") {
        if let Some((name, _)) = rest.split_once('`') {
            state.tables.insert(name.to_string());
        }
        return reply(
            StatusCode::OK,
            json!({"jobComplete": true, "jobReference": {"jobId": "job-ddl"}, "totalBytesProcessed": "0"}),
        );
    }
    if sql.starts_with("SELECT COUNT(*)") {
        // Completes only when polled.
        return reply(
            StatusCode::OK,
            json!({"jobComplete": false, "jobReference": {"jobId": "job-count", "location": "US"}}),
        );
    }
    if sql.starts_with("SELECT department") {
        return reply(
            StatusCode::OK,
            json!({
                "jobComplete": true,
                "jobReference": {"jobId": "job-summary", "location": "US"},
                "schema": {"fields": [
                    {"name": "department", "type": "STRING"},
                    {"name": "employee_count", "type": "INTEGER"}
                ]},
                "rows": [{"f": [{"v": "Engineering"}, {"v": "2"}]}],
                "pageToken": "page-2"
            }),
        );
    }
    error(StatusCode::BAD_REQUEST, "invalidQuery", "Syntax error")
}

fn job_results(state: &MockState, job: &str, page_token: Option<&str>) -> warp::reply::Response {
    match (job, page_token) {
        ("job-count", _) => reply(
            StatusCode::OK,
            json!({
                "jobComplete": true,
                "schema": {"fields": [{"name": "row_count", "type": "INTEGER"}]},
                "rows": [{"f": [{"v": state.loaded_rows.len().to_string()}]}]
            }),
        ),
        ("job-summary", Some("page-2")) => reply(
            StatusCode::OK,
            json!({
                "jobComplete": true,
                "schema": {"fields": [
                    {"name": "department", "type": "STRING"},
                    {"name": "employee_count", "type": "INTEGER"}
                ]},
                "rows": [{"f": [{"v": "HR"}, {"v": "2"}]}]
            }),
        ),
        _ => error(StatusCode::NOT_FOUND, "notFound", "Not found: Job"),
    }
}

fn employees() -> Result<(TableSchema, RecordBatch)> {
    let schema = TableSchema::new(vec![
        FieldSpec::new("id", FieldType::Integer, FieldMode::Required),
        FieldSpec::new("name", FieldType::String, FieldMode::Nullable),
    ])?;
    let batch = RecordBatch::try_new(
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ])),
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3])),
            Arc::new(StringArray::from(vec![Some("Alice"), None, Some("Carol")])),
        ],
    )?;
    Ok((schema, batch))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

#[tokio::test]
async fn test_dataset_is_created_once_with_location() -> Result<()> {
    let server = MockBigQuery::start().await;
    let bq = server.client(TOKEN)?;
    let dataset = DatasetRef::new(PROJECT, "employees_dev")?;

    assert!(bq.ensure_dataset(&dataset, "US").await?);
    assert!(!bq.ensure_dataset(&dataset, "US").await?);
    assert_eq!(bq.list_datasets(PROJECT).await?, vec!["employees_dev".to_string()]);

    let state = server.state.lock().await;
    let resource = &state.datasets["employees_dev"];
    assert_eq!(resource["location"], "US");
    assert_eq!(resource["description"], "Dataset created by CI/CD pipeline");
    Ok(())
}

#[tokio::test]
async fn test_table_is_created_with_ddl() -> Result<()> {
    let server = MockBigQuery::start().await;
    let bq = server.client(TOKEN)?;
    let (schema, _) = employees()?;
    let table = TableRef::new(PROJECT, "employees_dev", "employees")?;

    assert!(!bq.table_exists(&table).await?);
    assert!(bq.ensure_table(&table, &schema).await?);
    assert!(bq.table_exists(&table).await?);
    assert!(!bq.ensure_table(&table, &schema).await?);

    let state = server.state.lock().await;
    assert!(state.queries[0].contains("`acme-analytics-dev.employees_dev.employees`"));
    assert!(state.queries[0].contains("id INT64 NOT NULL"));
    Ok(())
}

#[tokio::test]
async fn test_append_submits_load_job() -> Result<()> {
    let server = MockBigQuery::start().await;
    let bq = server.client(TOKEN)?;
    let (schema, batch) = employees()?;
    let table = TableRef::new(PROJECT, "employees_dev", "employees")?;
    bq.ensure_table(&table, &schema).await?;

    assert_eq!(bq.append_rows(&table, &[batch], "run-1").await?, 3);

    // The count query completes only after polling.
    assert_eq!(bq.row_count(&table).await?, Some(3));
    let state = server.state.lock().await;
    assert_eq!(state.loads.len(), 1);
    let load = &state.loads[0]["configuration"]["load"];
    assert_eq!(load["writeDisposition"], "WRITE_APPEND");
    assert_eq!(load["sourceFormat"], "NEWLINE_DELIMITED_JSON");
    assert_eq!(load["destinationTable"]["tableId"], "employees");
    assert_eq!(state.loaded_rows[0], json!({"id": 1, "name": "Alice"}));
    assert_eq!(state.loaded_rows[1], json!({"id": 2}));
    Ok(())
}

#[tokio::test]
async fn test_retried_append_does_not_duplicate_rows() -> Result<()> {
    let server = MockBigQuery::start().await;
    server.state.lock().await.upload_failures = 1;
    let bq = server.client(TOKEN)?;
    let (schema, batch) = employees()?;
    let table = TableRef::new(PROJECT, "employees_dev", "employees")?;
    bq.ensure_table(&table, &schema).await?;

    let batches = vec![batch];
    let submitted = fast_retry()
        .run("append rows", || bq.append_rows(&table, &batches, "run-1"))
        .await?;
    assert_eq!(submitted, 3);

    assert_eq!(bq.row_count(&table).await?, Some(3));
    let state = server.state.lock().await;
    assert_eq!(state.uploads, 2);
    assert_eq!(state.jobs.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_load_job_is_reported() -> Result<()> {
    let server = MockBigQuery::start().await;
    let bq = server.client(TOKEN)?;
    let (_, batch) = employees()?;
    let table = TableRef::new(PROJECT, "employees_dev", "employees")?;

    let err = bq
        .append_rows(&table, &[batch], "run-1")
        .await
        .expect_err("table was never created");
    assert!(err.is_not_found());
    assert!(!err.is_retryable());
    assert!(server.state.lock().await.loaded_rows.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_query_follows_pages() -> Result<()> {
    let server = MockBigQuery::start().await;
    let bq = server.client(TOKEN)?;

    let rows = bq
        .query("SELECT department, employee_count FROM `acme-analytics-dev.employees_dev.department_summary`")
        .await?;
    assert_eq!(rows.len(), 2);
    assert_eq!(cell_as_str(&rows[1], "department"), Some("HR"));
    assert_eq!(cell_as_u64(&rows[0], "employee_count"), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_errors_are_classified() -> Result<()> {
    let server = MockBigQuery::start().await;

    let bad_token = server.client("expired")?;
    let err = bad_token
        .list_datasets(PROJECT)
        .await
        .expect_err("token is rejected");
    assert!(matches!(err, WarehouseError::Authentication(_)));
    assert!(!err.is_retryable());

    let bq = server.client(TOKEN)?;
    let err = bq.execute("DROP EVERYTHING").await.expect_err("bad SQL");
    assert!(matches!(err, WarehouseError::Invalid(_)));

    let missing = TableRef::new(PROJECT, "employees_dev", "nothing_here")?;
    assert_eq!(bq.row_count(&missing).await?, None);
    Ok(())
}
