//! Local secrets file (`app.secrets.yaml`) layered under the process environment.
//!
//! Environment variables always win; the file only fills gaps. The process
//! environment itself is never modified.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{DashboardError, Result};
use crate::logging::redact;

pub const DEFAULT_SECRETS_FILE: &str = "app.secrets.yaml";

#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: HashMap<String, String>,
    source: Option<PathBuf>,
}

impl Secrets {
    /// Load the secrets file. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Secrets file not found: {} (falling back to environment variables)", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let secrets = Self::parse(&raw).map_err(|e| {
            DashboardError::Configuration(format!("cannot parse {}: {}", path.display(), e))
        })?;

        for (key, value) in &secrets.values {
            if std::env::var_os(key).is_none() {
                info!("Loaded {} = {}", key, redact(key, value));
            }
        }
        info!("Loaded {} secrets from {}", secrets.values.len(), path.display());

        Ok(Self { source: Some(path.to_path_buf()), ..secrets })
    }

    /// Resolve the secrets path: `DASHBOARD_SECRETS_FILE` or `./app.secrets.yaml`.
    pub fn default_path() -> PathBuf {
        std::env::var("DASHBOARD_SECRETS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SECRETS_FILE))
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        let doc: Option<HashMap<String, serde_yaml::Value>> = serde_yaml::from_str(raw)?;
        let values = doc
            .unwrap_or_default()
            .into_iter()
            .filter(|(k, _)| !k.starts_with('#'))
            .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k, s)))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        Ok(Self { values, source: None })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            source: None,
        }
    }

    /// Environment variable first, then the secrets file.
    pub fn get(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.file_value(key))
    }

    /// Value from the secrets file only.
    pub fn file_value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
