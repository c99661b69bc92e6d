/// Dashboard configuration
///
/// Loaded from dashboard.{toml,yaml,json} (working directory) with env-var
/// overrides in the form DASHBOARD__SECTION__KEY, then the well-known
/// connection variables (DATABRICKS_HOST, ...) from the environment or the
/// secrets file.

use serde::Deserialize;
use tracing::warn;

use crate::error::{DashboardError, Result};
use crate::secrets::Secrets;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub databricks: DatabricksConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabricksConfig {
    pub host: Option<String>,
    /// SQL warehouse path, e.g. /sql/1.0/warehouses/1066550024e48b7a
    pub http_path: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Personal access token, used instead of OAuth when present
    pub token: Option<String>,
    #[serde(default = "default_catalog")]
    pub catalog: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_stage1_table")]
    pub stage1_table: String,
    #[serde(default = "default_stage2_table")]
    pub stage2_table: String,
    #[serde(default = "default_mapping_schema")]
    pub mapping_schema: String,
    #[serde(default = "default_tenant_table")]
    pub tenant_table: String,
    #[serde(default = "default_farm_table")]
    pub farm_table: String,
    #[serde(default = "default_camera_table")]
    pub camera_table: String,
    /// Server-side wait for a statement before it is cancelled (5..=50)
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_catalog() -> String { "stage_cv_catalog".to_string() }
fn default_schema() -> String { "bronze".to_string() }
fn default_stage1_table() -> String { "gemini_stage1_detections".to_string() }
fn default_stage2_table() -> String { "stage2_vlm_inferences".to_string() }
fn default_mapping_schema() -> String { "cv_logs".to_string() }
fn default_tenant_table() -> String { "tenant_map".to_string() }
fn default_farm_table() -> String { "farm_map".to_string() }
fn default_camera_table() -> String { "farm_camera_map".to_string() }
fn default_wait_timeout() -> u64 { 30 }
fn default_http_timeout() -> u64 { 60 }

impl Default for DatabricksConfig {
    fn default() -> Self {
        Self {
            host: None,
            http_path: None,
            client_id: None,
            client_secret: None,
            token: None,
            catalog: default_catalog(),
            schema: default_schema(),
            stage1_table: default_stage1_table(),
            stage2_table: default_stage2_table(),
            mapping_schema: default_mapping_schema(),
            tenant_table: default_tenant_table(),
            farm_table: default_farm_table(),
            camera_table: default_camera_table(),
            wait_timeout_secs: default_wait_timeout(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseCredentials {
    Token(String),
    OAuth { client_id: String, client_secret: String },
}

impl DatabricksConfig {
    pub fn full_stage1_table(&self) -> String {
        format!("{}.{}.{}", self.catalog, self.schema, self.stage1_table)
    }

    pub fn full_stage2_table(&self) -> String {
        format!("{}.{}.{}", self.catalog, self.schema, self.stage2_table)
    }

    pub fn mapping_table(&self, table: &str) -> String {
        format!("{}.{}.{}", self.catalog, self.mapping_schema, table)
    }

    /// Warehouse id: last segment of `/sql/1.0/warehouses/<id>`.
    pub fn warehouse_id(&self) -> Option<String> {
        let path = self.http_path.as_deref()?.trim_end_matches('/');
        let (prefix, id) = path.rsplit_once('/')?;
        (prefix.ends_with("warehouses") && !id.is_empty()).then(|| id.to_string())
    }

    pub fn credentials(&self) -> Option<WarehouseCredentials> {
        if let Some(token) = self.token.as_ref().filter(|t| !t.is_empty()) {
            return Some(WarehouseCredentials::Token(token.clone()));
        }
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Some(WarehouseCredentials::OAuth {
                    client_id: id.clone(),
                    client_secret: secret.clone(),
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Inline service-account key JSON
    pub service_account_json: Option<String>,
    /// Path to a service-account key file
    pub service_account_path: Option<String>,
}

impl StorageConfig {
    pub fn has_credentials(&self) -> bool {
        self.service_account_json.as_ref().is_some_and(|s| !s.is_empty())
            || self.service_account_path.as_ref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Media cache directory. A process-scoped temp dir when unset.
    pub root: Option<String>,
    #[serde(default = "default_gif_fps")]
    pub gif_fps: u32,
    #[serde(default = "default_gif_max_width")]
    pub gif_max_width: u32,
    /// Max cached bundles (one per selected row)
    #[serde(default = "default_max_bundles")]
    pub max_bundles: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Re-encode HEVC videos to browser-friendly H.264
    #[serde(default = "default_transcode")]
    pub transcode: bool,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Try h264_nvenc before libx264
    #[serde(default)]
    pub hwaccel: bool,
}

fn default_gif_fps() -> u32 { 3 }
fn default_gif_max_width() -> u32 { 640 }
fn default_max_bundles() -> usize { 20 }
fn default_max_bytes() -> u64 { 512 * 1024 * 1024 }
fn default_transcode() -> bool { true }
fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: None,
            gif_fps: default_gif_fps(),
            gif_max_width: default_gif_max_width(),
            max_bundles: default_max_bundles(),
            max_bytes: default_max_bytes(),
            transcode: default_transcode(),
            ffmpeg_path: default_ffmpeg_path(),
            hwaccel: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix when served behind a proxy, e.g. /apps/trace
    pub root_path: Option<String>,
    #[serde(default = "default_query_limit")]
    pub query_limit: u32,
}

fn default_bind_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 7860 }
fn default_query_limit() -> u32 { 100 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_port(),
            root_path: None,
            query_limit: default_query_limit(),
        }
    }
}

impl ServerConfig {
    /// Root path normalized to `/prefix` (no trailing slash), or None.
    pub fn normalized_root_path(&self) -> Option<String> {
        let trimmed = self.root_path.as_deref()?.trim().trim_matches('/');
        (!trimmed.is_empty()).then(|| format!("/{}", trimmed))
    }
}

impl AppConfig {
    /// Apply the well-known connection variables. `lookup` resolves env first, then secrets.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let db = &mut self.databricks;
        if let Some(host) = lookup("DATABRICKS_HOST").or_else(|| lookup("DATABRICKS_SERVER_HOSTNAME")) {
            db.host = Some(host);
        }
        if let Some(path) = lookup("DATABRICKS_HTTP_PATH") {
            db.http_path = Some(path);
        }
        if let Some(id) = lookup("DATABRICKS_CLIENT_ID") {
            db.client_id = Some(id);
        }
        if let Some(secret) = lookup("DATABRICKS_CLIENT_SECRET") {
            db.client_secret = Some(secret);
        }
        if let Some(token) = lookup("DATABRICKS_TOKEN") {
            db.token = Some(token);
        }

        if let Some(json) = lookup("GCP_SERVICE_ACCOUNT_JSON") {
            self.storage.service_account_json = Some(json);
        }
        if let Some(path) = lookup("GOOGLE_APPLICATION_CREDENTIALS") {
            self.storage.service_account_path = Some(path);
        }

        let port = lookup("DASHBOARD_PORT").or_else(|| lookup("DATABRICKS_APP_PORT"));
        if let Some(port) = port {
            match port.trim().parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => warn!("Ignoring invalid port override: {}", port),
            }
        }
        if let Some(root) = lookup("DASHBOARD_ROOT_PATH") {
            self.server.root_path = Some(root);
        }
    }

    /// Fail with every missing required key named.
    pub fn validate(&self) -> Result<()> {
        let db = &self.databricks;
        let mut missing = Vec::new();

        if db.host.as_ref().map_or(true, |h| h.trim().is_empty()) {
            missing.push("DATABRICKS_HOST");
        }
        match db.http_path.as_deref() {
            None | Some("") => missing.push("DATABRICKS_HTTP_PATH"),
            Some(path) if db.warehouse_id().is_none() => {
                return Err(DashboardError::Configuration(format!(
                    "DATABRICKS_HTTP_PATH '{}' does not name a warehouse (expected /sql/1.0/warehouses/<id>)",
                    path
                )));
            }
            Some(_) => {}
        }
        if db.credentials().is_none() {
            missing.push("DATABRICKS_CLIENT_ID + DATABRICKS_CLIENT_SECRET (or DATABRICKS_TOKEN)");
        }

        if !missing.is_empty() {
            return Err(DashboardError::Configuration(format!(
                "missing required settings: {} (set them in app.secrets.yaml or as environment variables)",
                missing.join(", ")
            )));
        }

        if !self.storage.has_credentials() {
            warn!("No GCP credentials configured; frames and videos may not be accessible");
        }
        if self.media.gif_fps == 0 {
            return Err(DashboardError::Configuration("media.gif_fps must be at least 1".into()));
        }
        Ok(())
    }
}

/// Load configuration from dashboard.* + environment variable overrides.
///
/// Search order:
///   1. ./dashboard.toml (or .yaml / .json)
///   2. DASHBOARD__SECTION__KEY environment variables
///   3. DATABRICKS_* / GCP_* / DASHBOARD_PORT from env, then the secrets file
pub fn load_config(secrets: &Secrets) -> Result<AppConfig> {
    dotenvy::dotenv().ok();

    let settings = config::Config::builder()
        .add_source(config::File::with_name("dashboard").required(false))
        .add_source(
            config::Environment::with_prefix("DASHBOARD")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| DashboardError::Configuration(e.to_string()))?;

    let mut app: AppConfig = settings
        .try_deserialize()
        .map_err(|e| DashboardError::Configuration(e.to_string()))?;

    app.apply_overrides(|key| secrets.get(key));
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    fn complete() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(lookup_from(&[
            ("DATABRICKS_HOST", "dbc-1.cloud.databricks.com"),
            ("DATABRICKS_HTTP_PATH", "/sql/1.0/warehouses/1066550024e48b7a"),
            ("DATABRICKS_CLIENT_ID", "sp-id"),
            ("DATABRICKS_CLIENT_SECRET", "sp-secret"),
        ]));
        cfg
    }

    #[test]
    fn defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 7860);
        assert_eq!(cfg.media.gif_fps, 3);
        assert_eq!(cfg.databricks.full_stage1_table(), "stage_cv_catalog.bronze.gemini_stage1_detections");
        assert_eq!(cfg.databricks.mapping_table("farm_map"), "stage_cv_catalog.cv_logs.farm_map");
    }

    #[test]
    fn overrides_and_validate() {
        let cfg = complete();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.databricks.warehouse_id().as_deref(), Some("1066550024e48b7a"));
        assert_eq!(
            cfg.databricks.credentials(),
            Some(WarehouseCredentials::OAuth { client_id: "sp-id".into(), client_secret: "sp-secret".into() })
        );
    }

    #[test]
    fn token_takes_precedence() {
        let mut cfg = complete();
        cfg.databricks.token = Some("dapi123".into());
        assert_eq!(cfg.databricks.credentials(), Some(WarehouseCredentials::Token("dapi123".into())));
    }

    #[test]
    fn missing_settings_are_named() {
        let err = AppConfig::default().validate().unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, DashboardError::Configuration(_)));
        assert!(msg.contains("DATABRICKS_HOST"));
        assert!(msg.contains("DATABRICKS_HTTP_PATH"));
        assert!(msg.contains("DATABRICKS_CLIENT_ID"));
    }

    #[test]
    fn http_path_must_name_warehouse() {
        let mut cfg = complete();
        cfg.databricks.http_path = Some("/sql/1.0/endpoints".into());
        assert!(matches!(cfg.validate(), Err(DashboardError::Configuration(_))));
    }

    #[test]
    fn port_and_root_path_overrides() {
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(lookup_from(&[("DATABRICKS_APP_PORT", "8000"), ("DASHBOARD_ROOT_PATH", "apps/trace/")]));
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.server.normalized_root_path().as_deref(), Some("/apps/trace"));

        cfg.apply_overrides(lookup_from(&[("DASHBOARD_PORT", "not-a-port")]));
        assert_eq!(cfg.server.port, 8000);
    }
}
