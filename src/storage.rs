//! Object store access for frames and videos.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectStorePath;
use object_store::ObjectStore;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::{DashboardError, Result};

/// `gs://bucket/key` (also accepts the public `storage.googleapis.com` form).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    pub bucket: String,
    pub key: String,
}

impl ObjectUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let rest = raw
            .strip_prefix("gs://")
            .or_else(|| raw.strip_prefix("https://storage.googleapis.com/"))
            .or_else(|| raw.strip_prefix("https://storage.cloud.google.com/"))
            .ok_or_else(|| DashboardError::Media(format!("unsupported object URI '{}'", raw)))?;

        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self { bucket: bucket.to_string(), key: key.to_string() })
            }
            _ => Err(DashboardError::Media(format!("object URI '{}' has no key", raw))),
        }
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.key)
    }
}

#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Whole object body. Missing objects fail with `MediaNotFound`.
    async fn fetch(&self, uri: &ObjectUri) -> Result<Bytes>;
}

#[derive(Debug, Clone)]
enum GcsCredentials {
    Inline(String),
    KeyFile(String),
    Ambient,
}

/// Google Cloud Storage through `object_store`, one client per bucket.
pub struct GcsFetcher {
    credentials: GcsCredentials,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl GcsFetcher {
    pub fn from_config(cfg: &StorageConfig) -> Self {
        let credentials = match (&cfg.service_account_json, &cfg.service_account_path) {
            (Some(json), _) if !json.trim().is_empty() => GcsCredentials::Inline(json.clone()),
            (_, Some(path)) if !path.trim().is_empty() => GcsCredentials::KeyFile(path.clone()),
            _ => GcsCredentials::Ambient,
        };
        debug!("GCS credentials: {}", match credentials {
            GcsCredentials::Inline(_) => "inline service account",
            GcsCredentials::KeyFile(_) => "service account key file",
            GcsCredentials::Ambient => "ambient environment",
        });
        Self { credentials, stores: Mutex::new(HashMap::new()) }
    }

    async fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(bucket) {
            return Ok(Arc::clone(store));
        }

        let builder = match &self.credentials {
            GcsCredentials::Inline(json) => GoogleCloudStorageBuilder::new().with_service_account_key(json),
            GcsCredentials::KeyFile(path) => GoogleCloudStorageBuilder::new().with_service_account_path(path),
            GcsCredentials::Ambient => GoogleCloudStorageBuilder::from_env(),
        };
        let store: Arc<dyn ObjectStore> = Arc::new(
            builder
                .with_bucket_name(bucket)
                .build()
                .map_err(|e| DashboardError::Configuration(format!("GCS client for bucket {}: {}", bucket, e)))?,
        );
        info!("GCS client ready for bucket {}", bucket);
        stores.insert(bucket.to_string(), Arc::clone(&store));
        Ok(store)
    }
}

#[async_trait]
impl ObjectFetcher for GcsFetcher {
    async fn fetch(&self, uri: &ObjectUri) -> Result<Bytes> {
        let store = self.store_for(&uri.bucket).await?;
        let path = ObjectStorePath::from(uri.key.as_str());
        let body = store.get(&path).await.map_err(|e| match DashboardError::from(e) {
            DashboardError::MediaNotFound(_) => DashboardError::MediaNotFound(uri.to_string()),
            other => other,
        })?;
        Ok(body.bytes().await?)
    }
}
