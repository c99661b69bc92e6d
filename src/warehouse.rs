//! Databricks SQL warehouse client.
//!
//! Talks to the SQL Statement Execution API (`/api/2.0/sql/statements`) with
//! either an OAuth machine-to-machine token (client credentials against
//! `/oidc/v1/token`) or a personal access token.
//!
//! The query layer only sees the `SessionFactory` / `SqlSession` traits so it
//! can be exercised without a warehouse.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{DatabricksConfig, WarehouseCredentials};
use crate::error::{DashboardError, Result};

/// Token is considered stale this long before it actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

// ─── Statements and results ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlParam {
    pub name: String,
    pub value: Option<String>,
    #[serde(rename = "type")]
    pub type_name: &'static str,
}

/// SQL text with named (`:name`) parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), params: Vec::new() }
    }

    pub fn bind(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.push(SqlParam { name: name.to_string(), value: Some(value.into()), type_name: "STRING" });
        self
    }

    pub fn bind_date(mut self, name: &str, date: chrono::NaiveDate) -> Self {
        self.params.push(SqlParam {
            name: name.to_string(),
            value: Some(date.format("%Y-%m-%d").to_string()),
            type_name: "DATE",
        });
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|p| p.name == name).and_then(|p| p.value.as_deref())
    }
}

/// Rows as returned in JSON_ARRAY format: every cell is a nullable string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        let index: Arc<HashMap<&str, usize>> = Arc::new(
            self.columns.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect(),
        );
        self.rows.iter().map(move |cells| Record { index: Arc::clone(&index), cells })
    }
}

/// One row with by-name column access.
pub struct Record<'a> {
    index: Arc<HashMap<&'a str, usize>>,
    cells: &'a [Option<String>],
}

impl<'a> Record<'a> {
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let i = *self.index.get(column)?;
        self.cells.get(i)?.as_deref()
    }

    pub fn string(&self, column: &str) -> Option<String> {
        self.get(column).map(str::to_string)
    }

    pub fn f64(&self, column: &str) -> Option<f64> {
        self.get(column)?.trim().parse().ok()
    }

    pub fn bool(&self, column: &str) -> Option<bool> {
        match self.get(column)?.trim() {
            "true" | "TRUE" | "True" | "1" => Some(true),
            "false" | "FALSE" | "False" | "0" => Some(false),
            _ => None,
        }
    }
}

// ─── Session traits ──────────────────────────────────────────────────────────

#[async_trait]
pub trait SqlSession: Send + Sync {
    /// Lightweight liveness probe.
    async fn is_alive(&self) -> bool;

    async fn execute(&self, statement: &Statement) -> Result<ResultSet>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Build a brand-new session. Never repairs an existing one.
    async fn connect(&self) -> Result<Arc<dyn SqlSession>>;

    /// Human-readable target for logs.
    fn describe(&self) -> String {
        "sql-warehouse".to_string()
    }
}

// ─── Databricks implementation ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    warehouse_id: &'a str,
    statement: &'a str,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    parameters: &'a [SqlParam],
    wait_timeout: String,
    on_wait_timeout: &'static str,
    format: &'static str,
    disposition: &'static str,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    #[serde(default)]
    statement_id: Option<String>,
    status: StatementStatus,
    #[serde(default)]
    manifest: Option<Manifest>,
    #[serde(default)]
    result: Option<ResultChunk>,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: String,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    schema: ManifestSchema,
}

#[derive(Debug, Deserialize)]
struct ManifestSchema {
    #[serde(default)]
    columns: Vec<ManifestColumn>,
}

#[derive(Debug, Deserialize)]
struct ManifestColumn {
    name: String,
    #[serde(default)]
    position: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ResultChunk {
    #[serde(default)]
    data_array: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    next_chunk_internal_link: Option<String>,
}

/// Builds Databricks sessions from configuration.
pub struct DatabricksConnector {
    http: Client,
    base_url: Url,
    warehouse_id: String,
    credentials: WarehouseCredentials,
    wait_timeout_secs: u64,
}

impl DatabricksConnector {
    pub fn from_config(cfg: &DatabricksConfig) -> Result<Self> {
        let host = cfg
            .host
            .as_deref()
            .ok_or_else(|| DashboardError::Configuration("DATABRICKS_HOST not set".into()))?;
        let warehouse_id = cfg.warehouse_id().ok_or_else(|| {
            DashboardError::Configuration("DATABRICKS_HTTP_PATH does not name a warehouse".into())
        })?;
        let credentials = cfg.credentials().ok_or_else(|| {
            DashboardError::Configuration("no Databricks credentials configured".into())
        })?;

        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs.max(cfg.wait_timeout_secs + 10)))
            .build()?;

        Ok(Self {
            http,
            base_url: normalize_host(host)?,
            warehouse_id,
            credentials,
            wait_timeout_secs: cfg.wait_timeout_secs.clamp(5, 50),
        })
    }

    async fn fetch_token(&self) -> Result<(String, Option<Instant>)> {
        let (client_id, client_secret) = match &self.credentials {
            WarehouseCredentials::Token(token) => return Ok((token.clone(), None)),
            WarehouseCredentials::OAuth { client_id, client_secret } => (client_id, client_secret),
        };

        let url = endpoint(&self.base_url, "oidc/v1/token")?;
        debug!("OAuth M2M token request → {}", url);

        let resp = self
            .http
            .post(url)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials"), ("scope", "all-apis")])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = resp.text().await.unwrap_or_default();
            return Err(DashboardError::Authentication(format!(
                "token endpoint returned {}: {}",
                status,
                truncate(&body, 300)
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DashboardError::Connection(format!(
                "token endpoint returned {}: {}",
                status,
                truncate(&body, 300)
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| DashboardError::Authentication(format!("unexpected token response: {}", e)))?;
        let expires_at = token.expires_in.map(|s| Instant::now() + Duration::from_secs(s));
        Ok((token.access_token, expires_at))
    }
}

#[async_trait]
impl SessionFactory for DatabricksConnector {
    async fn connect(&self) -> Result<Arc<dyn SqlSession>> {
        let auth = match self.credentials {
            WarehouseCredentials::Token(_) => "token",
            WarehouseCredentials::OAuth { .. } => "OAuth M2M",
        };
        info!("Connecting to Databricks SQL ({}, warehouse {}, {})", self.base_url, self.warehouse_id, auth);

        let (token, expires_at) = self.fetch_token().await?;
        let session = DatabricksSession {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            warehouse_id: self.warehouse_id.clone(),
            token,
            expires_at,
            wait_timeout_secs: self.wait_timeout_secs,
            alive: AtomicBool::new(true),
        };

        // Surfaces bad grants / stopped warehouses at connect time
        session.execute(&Statement::new("SELECT 1")).await?;
        info!("Connected to warehouse {}", self.warehouse_id);
        Ok(Arc::new(session))
    }

    fn describe(&self) -> String {
        format!("{} warehouse {}", self.base_url, self.warehouse_id)
    }
}

/// One authenticated session against a warehouse.
pub struct DatabricksSession {
    http: Client,
    base_url: Url,
    warehouse_id: String,
    token: String,
    expires_at: Option<Instant>,
    wait_timeout_secs: u64,
    alive: AtomicBool,
}

impl DatabricksSession {
    fn token_fresh(&self) -> bool {
        token_fresh_at(self.expires_at, Instant::now())
    }

    async fn post_statement(&self, statement: &Statement) -> Result<StatementResponse> {
        let url = endpoint(&self.base_url, "api/2.0/sql/statements/")?;
        let body = StatementRequest {
            warehouse_id: &self.warehouse_id,
            statement: &statement.sql,
            parameters: &statement.params,
            wait_timeout: format!("{}s", self.wait_timeout_secs),
            on_wait_timeout: "CANCEL",
            format: "JSON_ARRAY",
            disposition: "INLINE",
        };

        let resp = self.http.post(url).bearer_auth(&self.token).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http_failure(status, &text));
        }

        resp.json::<StatementResponse>()
            .await
            .map_err(|e| DashboardError::Query(format!("unexpected statement response: {}", e)))
    }

    async fn fetch_chunk(&self, link: &str) -> Result<ResultChunk> {
        let url = endpoint(&self.base_url, link.trim_start_matches('/'))?;
        let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http_failure(status, &text));
        }
        resp.json::<ResultChunk>()
            .await
            .map_err(|e| DashboardError::Query(format!("unexpected result chunk: {}", e)))
    }

    async fn run(&self, statement: &Statement) -> Result<ResultSet> {
        let response = self.post_statement(statement).await?;

        match response.status.state.as_str() {
            "SUCCEEDED" => {}
            state => return Err(classify_statement_failure(state, response.status.error.as_ref())),
        }

        let columns = ordered_columns(response.manifest);
        let statement_id = response.statement_id.unwrap_or_else(|| "?".to_string());
        let rows = collect_chunks(response.result.unwrap_or_default(), |link| {
            debug!("Following result chunk {} (statement {})", link, statement_id);
            async move { self.fetch_chunk(&link).await }
        })
        .await?;

        Ok(ResultSet::new(columns, rows))
    }
}

#[async_trait]
impl SqlSession for DatabricksSession {
    async fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        if !self.token_fresh() {
            debug!("Warehouse token near expiry, session considered stale");
            self.alive.store(false, Ordering::SeqCst);
            return false;
        }
        match self.run(&Statement::new("SELECT 1")).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Liveness probe failed: {}", e);
                self.alive.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    async fn execute(&self, statement: &Statement) -> Result<ResultSet> {
        match self.run(statement).await {
            Ok(rs) => Ok(rs),
            Err(e) => {
                if e.is_stale_connection() {
                    self.alive.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// False once `now` is within the expiry margin of `expires_at`.
/// Tokens without an expiry (PATs) never go stale.
fn token_fresh_at(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |at| now + TOKEN_EXPIRY_MARGIN < at)
}

fn ordered_columns(manifest: Option<Manifest>) -> Vec<String> {
    let mut columns: Vec<ManifestColumn> = manifest.map(|m| m.schema.columns).unwrap_or_default();
    columns.sort_by_key(|c| c.position.unwrap_or(usize::MAX));
    columns.into_iter().map(|c| c.name).collect()
}

/// Rows of `first` followed by every chunk reachable through
/// `next_chunk_internal_link`, in order.
async fn collect_chunks<F, Fut>(first: ResultChunk, mut next: F) -> Result<Vec<Vec<Option<String>>>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<ResultChunk>>,
{
    let mut chunk = first;
    let mut rows = chunk.data_array.take().unwrap_or_default();
    while let Some(link) = chunk.next_chunk_internal_link.take() {
        chunk = next(link).await?;
        rows.extend(chunk.data_array.take().unwrap_or_default());
    }
    Ok(rows)
}

/// `dbc-1.cloud.databricks.com`, `https://dbc-1.cloud.databricks.com/` → base URL.
pub fn normalize_host(host: &str) -> Result<Url> {
    let host = host.trim().trim_end_matches('/');
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}/", host)
    } else {
        format!("https://{}/", host)
    };
    Url::parse(&with_scheme)
        .map_err(|e| DashboardError::Configuration(format!("invalid Databricks host '{}': {}", host, e)))
}

fn endpoint(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| DashboardError::Configuration(format!("invalid endpoint {}: {}", path, e)))
}

fn classify_http_failure(status: StatusCode, body: &str) -> DashboardError {
    let detail = format!("HTTP {}: {}", status, truncate(body, 300));
    match status {
        StatusCode::UNAUTHORIZED => DashboardError::Authentication(detail),
        StatusCode::FORBIDDEN => DashboardError::Permission(detail),
        StatusCode::BAD_REQUEST => {
            if body.contains("PERMISSION_DENIED") {
                DashboardError::Permission(detail)
            } else {
                DashboardError::Query(detail)
            }
        }
        s if s.is_server_error() || s == StatusCode::NOT_FOUND || s == StatusCode::TOO_MANY_REQUESTS => {
            DashboardError::Connection(detail)
        }
        _ => DashboardError::Query(detail),
    }
}

fn classify_statement_failure(state: &str, error: Option<&ServiceError>) -> DashboardError {
    let code = error.and_then(|e| e.error_code.as_deref()).unwrap_or("UNKNOWN");
    let message = error.and_then(|e| e.message.as_deref()).unwrap_or("no message");
    let detail = format!("statement {} ({}): {}", state, code, truncate(message, 500));
    if code == "PERMISSION_DENIED" || message.contains("PERMISSION_DENIED") {
        DashboardError::Permission(detail)
    } else if code == "TEMPORARILY_UNAVAILABLE" || code == "RESOURCE_EXHAUSTED" {
        DashboardError::Connection(detail)
    } else {
        DashboardError::Query(detail)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
